//! Describes the agents and memory regions a runtime instance exposes.
//!
//! There is no driver to enumerate, so the set of agents is data. The
//! default topology mirrors a single discrete GPU system: one CPU agent
//! owning system memory and one kernel dispatch agent with fine, coarse
//! and kernel argument regions.

use serde::{Deserialize, Serialize, };

use crate::agent::{DeviceType, Feature, };
use crate::isa::SOFT_ISA_NAME;
use crate::mem::region::{GlobalFlags, Segment, };

const PAGE: usize = 4096;
const MIB: usize = 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Topology {
  pub agents: Vec<AgentDesc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentDesc {
  pub name: String,
  pub vendor_name: String,
  pub device_type: DeviceType,
  pub feature: Option<Feature>,
  /// Inclusive min and max queue sizes, in packets.
  pub queue_size: (u32, u32),
  pub isa: Option<String>,
  pub regions: Vec<RegionDesc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegionDesc {
  pub segment: Segment,
  pub global_flags: u32,
  pub host_accessible: bool,
  pub size: usize,
  pub alloc_max_size: usize,
  pub runtime_alloc_allowed: bool,
  pub runtime_alloc_granule: usize,
  pub runtime_alloc_alignment: usize,
}

impl RegionDesc {
  pub fn global(flags: u32, host_accessible: bool, size: usize) -> Self {
    RegionDesc {
      segment: Segment::Global,
      global_flags: flags,
      host_accessible,
      size,
      alloc_max_size: size,
      runtime_alloc_allowed: true,
      runtime_alloc_granule: PAGE,
      runtime_alloc_alignment: PAGE,
    }
  }
  pub fn group(size: usize) -> Self {
    RegionDesc {
      segment: Segment::Group,
      global_flags: 0,
      host_accessible: false,
      size,
      alloc_max_size: 0,
      runtime_alloc_allowed: false,
      runtime_alloc_granule: 0,
      runtime_alloc_alignment: 0,
    }
  }
}

impl AgentDesc {
  pub fn host_cpu() -> Self {
    AgentDesc {
      name: "soft-host".into(),
      vendor_name: "soft".into(),
      device_type: DeviceType::Cpu,
      feature: None,
      queue_size: (0, 0),
      isa: None,
      regions: vec![
        RegionDesc::global(GlobalFlags::FINE_GRAINED | GlobalFlags::KERNARG,
                           true, 256 * MIB),
        RegionDesc::global(GlobalFlags::COARSE_GRAINED, true, 256 * MIB),
      ],
    }
  }

  pub fn soft_gpu() -> Self {
    AgentDesc {
      name: SOFT_ISA_NAME.into(),
      vendor_name: "soft".into(),
      device_type: DeviceType::Gpu,
      feature: Some(Feature::Kernel),
      queue_size: (1, 1 << 12),
      isa: Some(SOFT_ISA_NAME.into()),
      regions: vec![
        RegionDesc::global(GlobalFlags::FINE_GRAINED, true, 64 * MIB),
        RegionDesc::global(GlobalFlags::FINE_GRAINED | GlobalFlags::KERNARG,
                           true, 4 * MIB),
        RegionDesc::global(GlobalFlags::COARSE_GRAINED, false, 256 * MIB),
        RegionDesc::global(GlobalFlags::COARSE_GRAINED, true, 64 * MIB),
        RegionDesc::group(64 * 1024),
      ],
    }
  }
}

impl Default for Topology {
  fn default() -> Self {
    Topology {
      agents: vec![AgentDesc::host_cpu(), AgentDesc::soft_gpu()],
    }
  }
}
