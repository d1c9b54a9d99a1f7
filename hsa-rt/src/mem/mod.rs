use std::fmt;

use serde::{Deserialize, Serialize, };

pub mod map;
pub mod region;

/// An address in the runtime's memory map. Opaque to the host: host code
/// reads and writes through `ApiContext::{read_host, write_host}` and
/// passes these tokens to the device in argument blocks and packets.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[repr(transparent)]
pub struct DevicePtr(pub(crate) u64);

impl DevicePtr {
  pub const fn null() -> Self { DevicePtr(0) }
  pub const fn from_addr(addr: u64) -> Self { DevicePtr(addr) }

  pub fn addr(self) -> u64 { self.0 }
  pub fn is_null(self) -> bool { self.0 == 0 }

  /// Returns `None` on overflow.
  pub fn offset(self, bytes: u64) -> Option<DevicePtr> {
    self.0.checked_add(bytes).map(DevicePtr)
  }
}

impl fmt::Debug for DevicePtr {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "DevicePtr(0x{:x})", self.0)
  }
}
impl fmt::Display for DevicePtr {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "0x{:x}", self.0)
  }
}
impl fmt::Pointer for DevicePtr {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::LowerHex::fmt(&self.0, f)
  }
}
