
use std::fmt;

use serde::{Deserialize, Serialize, };

use crate::ApiContext;
use crate::agent::Agent;
use crate::error::Error;
use crate::mem::DevicePtr;
use crate::topology::RegionDesc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum Segment {
  Global,
  ReadOnly,
  Private,
  Group,
  KernelArg,
}

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GlobalFlags(pub u32);
impl GlobalFlags {
  pub const KERNARG: u32 = 1 << 0;
  pub const FINE_GRAINED: u32 = 1 << 1;
  pub const COARSE_GRAINED: u32 = 1 << 2;

  pub fn kernel_arg(&self) -> bool {
    (self.0 & Self::KERNARG) != 0
  }
  pub fn fine_grained(&self) -> bool {
    (self.0 & Self::FINE_GRAINED) != 0
  }
  pub fn coarse_grained(&self) -> bool {
    (self.0 & Self::COARSE_GRAINED) != 0
  }
}

impl fmt::Debug for GlobalFlags {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "GlobalFlags(")?;

    let mut first = true;
    let mut get_space = || {
      if first {
        first = false;
        ""
      } else {
        " "
      }
    };
    if self.kernel_arg() {
      write!(f, "{}kernel arg,", get_space())?;
    }
    if self.fine_grained() {
      write!(f, "{}fine grained,", get_space())?;
    }
    if self.coarse_grained() {
      write!(f, "{}coarse grained,", get_space())?;
    }

    write!(f, ")")
  }
}

/// Identifies a region across the whole runtime: the owning agent's index
/// in the high half, the region's index on that agent in the low half.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegionId(pub(crate) u64);
impl RegionId {
  pub(crate) fn new(agent: usize, region: usize) -> Self {
    RegionId(((agent as u64) << 32) | region as u64)
  }
  pub(crate) fn agent(self) -> usize { (self.0 >> 32) as usize }
  pub(crate) fn region(self) -> usize { (self.0 & 0xffff_ffff) as usize }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Region {
  ctx: ApiContext,
  id: RegionId,
}

impl Region {
  fn desc(&self) -> &RegionDesc {
    &self.ctx.0.topology.agents[self.id.agent()].regions[self.id.region()]
  }

  pub fn id(&self) -> u64 { self.id.0 }
  pub fn segment(&self) -> Result<Segment, Error> {
    Ok(self.desc().segment)
  }

  // will return Ok(None) iff self is not a global segment.
  pub fn global_flags(&self) -> Result<Option<GlobalFlags>, Error> {
    match self.segment()? {
      Segment::Global => {},
      _ => { return Ok(None); },
    }
    Ok(Some(GlobalFlags(self.desc().global_flags)))
  }
  /// Whether the host may read and write allocations from this region
  /// directly. Fine grained regions always are.
  pub fn host_accessible(&self) -> Result<bool, Error> {
    let desc = self.desc();
    Ok(desc.host_accessible ||
      GlobalFlags(desc.global_flags).fine_grained())
  }
  pub fn size(&self) -> Result<usize, Error> {
    Ok(self.desc().size)
  }
  pub fn alloc_max_size(&self) -> Result<usize, Error> {
    Ok(self.desc().alloc_max_size)
  }
  pub fn runtime_alloc_allowed(&self) -> Result<bool, Error> {
    Ok(self.desc().runtime_alloc_allowed)
  }
  pub fn runtime_alloc_granule(&self) -> Result<usize, Error> {
    Ok(self.desc().runtime_alloc_granule)
  }
  pub fn runtime_alloc_alignment(&self) -> Result<usize, Error> {
    Ok(self.desc().runtime_alloc_alignment)
  }
  /// Bytes currently allocated from this region, after granule rounding.
  pub fn used(&self) -> usize {
    self.ctx.0.memory.used(self.id)
  }

  /// All allocations will have alignment `runtime_alloc_alignment`.
  /// This is generally the page size.
  pub fn allocate(&self, bytes: usize) -> Result<DevicePtr, Error> {
    if self.ctx.0.faults.take_allocation() {
      return Err(Error::OutOfResources);
    }
    let host_accessible = self.host_accessible()?;
    self.ctx.0.memory.allocate(self.id, self.desc(), host_accessible, bytes)
  }
  pub fn deallocate(&self, ptr: DevicePtr) -> Result<(), Error> {
    // actually don't need `self`.
    self.ctx.0.memory.free(ptr)
  }
}

impl fmt::Debug for Region {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let desc = self.desc();
    f.debug_struct("Region")
      .field("id", &format_args!("0x{:x}", self.id.0))
      .field("segment", &desc.segment)
      .field("flags", &GlobalFlags(desc.global_flags))
      .field("host_accessible", &desc.host_accessible)
      .field("size", &desc.size)
      .finish()
  }
}

impl Agent {
  pub fn all_regions(&self) -> Result<Vec<Region>, Error> {
    let count = self.desc().regions.len();
    Ok((0..count)
      .map(|region| Region {
        ctx: self.ctx.clone(),
        id: RegionId::new(self.index, region),
      })
      .collect())
  }
}
