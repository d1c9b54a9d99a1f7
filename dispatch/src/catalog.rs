//! Device discovery, and sorting a device's memory regions into the roles
//! the dispatcher allocates from.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, };

use hsa_rt::ApiContext;
use hsa_rt::agent::{Agent, Feature, };
use hsa_rt::mem::region::{GlobalFlags, Region, Segment, };

use crate::error::{Error, HsaError, };

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum RegionRole {
  /// Fine grained, coherent with the host.
  HostVisibleShared,
  /// Coarse grained, private to the device.
  DeviceLocal,
  /// Coarse grained, but the host can map it.
  HostAccessibleLocal,
  /// Holds packet argument blocks.
  ArgumentRegion,
}

/// The properties of a region classification looks at.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RegionInfo {
  pub segment: Segment,
  /// `None` for non-global segments.
  pub global_flags: Option<GlobalFlags>,
  pub host_accessible: bool,
  pub size: usize,
  pub alloc_granule: usize,
}

impl RegionInfo {
  pub fn query(region: &Region) -> Result<Self, HsaError> {
    Ok(RegionInfo {
      segment: region.segment()?,
      global_flags: region.global_flags()?,
      host_accessible: region.host_accessible()?,
      size: region.size()?,
      alloc_granule: region.runtime_alloc_granule()?,
    })
  }
}

/// Decide the role of a region from its flags alone. `None` means the
/// region is of no use to the dispatcher.
///
/// The kernel argument flag wins over grain; fine grain wins over coarse.
pub fn classify(info: &RegionInfo) -> Option<RegionRole> {
  if info.segment != Segment::Global {
    return None;
  }
  let flags = info.global_flags?;
  if flags.kernel_arg() {
    Some(RegionRole::ArgumentRegion)
  } else if flags.fine_grained() {
    Some(RegionRole::HostVisibleShared)
  } else if flags.coarse_grained() {
    if info.host_accessible {
      Some(RegionRole::HostAccessibleLocal)
    } else {
      Some(RegionRole::DeviceLocal)
    }
  } else {
    None
  }
}

/// One region per role, as classified during discovery.
#[derive(Clone, Default)]
pub struct RegionCatalog {
  roles: BTreeMap<RegionRole, Region>,
}

impl RegionCatalog {
  /// Classify every region `agent` exposes. When more than one region
  /// has the same role the last one enumerated is kept.
  pub fn discover(agent: &Agent) -> Result<Self, Error> {
    let mut catalog = RegionCatalog::default();
    for region in agent.all_regions()? {
      let info = match RegionInfo::query(&region) {
        Ok(info) => info,
        Err(err) => {
          log::debug!("skipping region 0x{:x}: {:?}", region.id(), err);
          continue;
        },
      };
      if let Some(role) = classify(&info) {
        catalog.record(role, region);
      }
    }
    Ok(catalog)
  }

  pub fn record(&mut self, role: RegionRole, region: Region) {
    if let Some(prev) = self.roles.insert(role, region) {
      log::warn!("more than one {:?} region; dropping 0x{:x}", role, prev.id());
    }
  }

  pub fn get(&self, role: RegionRole) -> Option<&Region> {
    self.roles.get(&role)
  }
  pub fn require(&self, role: RegionRole) -> Result<&Region, Error> {
    self.get(role).ok_or(Error::MissingRegion(role))
  }
  /// Where device only data goes: the device local region, or failing
  /// that the host accessible local one.
  pub fn device_region(&self) -> Result<&Region, Error> {
    self.get(RegionRole::DeviceLocal)
      .or_else(|| self.get(RegionRole::HostAccessibleLocal) )
      .ok_or(Error::MissingRegion(RegionRole::DeviceLocal))
  }

  pub fn iter(&self) -> impl Iterator<Item = (RegionRole, &Region)> {
    self.roles.iter().map(|(&role, region)| (role, region) )
  }
  pub fn len(&self) -> usize { self.roles.len() }
  pub fn is_empty(&self) -> bool { self.roles.is_empty() }
}

impl fmt::Debug for RegionCatalog {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_map()
      .entries(self.roles.iter())
      .finish()
  }
}

/// Agents which accept kernel dispatch packets, in enumeration order.
pub fn kernel_agents(ctx: &ApiContext) -> Result<Vec<Agent>, Error> {
  Ok(ctx.agents()?
    .into_iter()
    .filter(|agent| agent.feature().ok() == Some(Feature::Kernel) )
    .collect())
}

/// The `index`th kernel dispatch agent.
pub fn select_device(ctx: &ApiContext, index: usize) -> Result<Agent, Error> {
  let mut agents = kernel_agents(ctx)?;
  let found = agents.len();
  if index >= found {
    return Err(Error::NoSuchDevice { index, found, });
  }
  Ok(agents.swap_remove(index))
}
