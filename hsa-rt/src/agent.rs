use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize, };

use crate::ApiContext;
use crate::error::Error;
use crate::topology::AgentDesc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum Feature {
  Agent,
  Kernel,
}
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueueType {
  Single,
  Multiple,
}
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum DeviceType {
  Cpu,
  Gpu,
  Dsp,
}

#[derive(Clone, Eq, PartialEq)]
pub struct Agent {
  pub(crate) ctx: ApiContext,
  pub(crate) index: usize,
}
impl Agent {
  pub(crate) fn new(ctx: ApiContext, index: usize) -> Self {
    Agent { ctx, index, }
  }
  pub(crate) fn desc(&self) -> &AgentDesc {
    &self.ctx.0.topology.agents[self.index]
  }

  pub fn ctx(&self) -> &ApiContext { &self.ctx }
  /// Position of this agent in the runtime's enumeration order.
  pub fn index(&self) -> usize { self.index }

  pub fn name(&self) -> Result<String, Error> {
    Ok(self.desc().name.clone())
  }
  pub fn vendor_name(&self) -> Result<String, Error> {
    Ok(self.desc().vendor_name.clone())
  }
  /// Agents which can't accept dispatch packets return `InvalidAgent`.
  pub fn feature(&self) -> Result<Feature, Error> {
    self.desc().feature
      .ok_or(Error::InvalidAgent)
  }
  pub fn queue_size(&self) -> Result<Range<u32>, Error> {
    let (min, max) = self.desc().queue_size;
    Ok(Range {
      start: min,
      end: max,
    })
  }
  pub fn queue_type(&self) -> Result<QueueType, Error> {
    Ok(QueueType::Multiple)
  }
  pub fn device_type(&self) -> Result<DeviceType, Error> {
    Ok(self.desc().device_type)
  }
  pub fn isa_name(&self) -> Result<String, Error> {
    self.desc().isa.clone()
      .ok_or(Error::InvalidIsa)
  }
}
impl fmt::Debug for Agent {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "Agent(#{}, {:?})", self.index, self.desc().name)
  }
}

pub fn find_agents(ctx: &ApiContext) -> Result<Vec<Agent>, Error> {
  ctx.agents()
}
