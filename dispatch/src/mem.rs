//! Allocating, freeing and copying device memory from the classified
//! regions, and buffers pairing a host visible copy with a device one.

use std::fmt;

use hsa_rt::mem::DevicePtr;

use crate::catalog::RegionRole;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, HsaError, };

/// A host visible staging copy and a device local copy of the same
/// `size` bytes. Zero sized buffers hold null pointers.
pub struct Buffer {
  size: usize,
  host: DevicePtr,
  device: DevicePtr,
}

impl Buffer {
  pub fn size(&self) -> usize { self.size }
  pub fn host_ptr(&self) -> DevicePtr { self.host }
  /// What kernels should be given.
  pub fn device_ptr(&self) -> DevicePtr { self.device }
}
impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Buffer")
      .field("size", &self.size)
      .field("host", &self.host)
      .field("device", &self.device)
      .finish()
  }
}

impl Dispatcher {
  /// Allocate `size` bytes from the region with `role`. Zero sized
  /// requests against the host visible region return null.
  pub fn allocate(&self, role: RegionRole, size: usize) -> Result<DevicePtr, Error> {
    let region = match role {
      RegionRole::DeviceLocal => self.catalog.device_region()?,
      role => self.catalog.require(role)?,
    };
    if size == 0 && role == RegionRole::HostVisibleShared {
      return Ok(DevicePtr::null());
    }
    let ptr = region.allocate(size)?;
    log::trace!("allocated {} bytes from {:?} at {}", size, role, ptr);
    Ok(ptr)
  }
  pub fn allocate_host(&self, size: usize) -> Result<DevicePtr, Error> {
    self.allocate(RegionRole::HostVisibleShared, size)
  }
  pub fn allocate_device(&self, size: usize) -> Result<DevicePtr, Error> {
    self.allocate(RegionRole::DeviceLocal, size)
  }

  /// Freeing null does nothing.
  pub fn free(&self, ptr: DevicePtr) -> Result<(), Error> {
    if ptr.is_null() {
      return Ok(());
    }
    self.ctx().memory_free(ptr)?;
    Ok(())
  }

  /// Copy `size` bytes from `src` to `dst`. Either may be host or device
  /// memory.
  pub fn copy(&self, dst: DevicePtr, src: DevicePtr, size: usize) -> Result<(), Error> {
    if size == 0 {
      return Ok(());
    }
    self.ctx().memory_copy(dst, src, size)?;
    Ok(())
  }

  pub fn write_host(&self, dst: DevicePtr, data: &[u8]) -> Result<(), Error> {
    if data.is_empty() {
      return Ok(());
    }
    self.ctx().write_host(dst, data)?;
    Ok(())
  }
  pub fn read_host(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), Error> {
    if out.is_empty() {
      return Ok(());
    }
    self.ctx().read_host(src, out)?;
    Ok(())
  }

  pub fn allocate_buffer(&self, size: usize) -> Result<Buffer, Error> {
    if size == 0 {
      return Ok(Buffer {
        size,
        host: DevicePtr::null(),
        device: DevicePtr::null(),
      });
    }
    let host = self.allocate_host(size)?;
    let device = match self.allocate_device(size) {
      Ok(device) => device,
      Err(err) => {
        self.free(host)?;
        return Err(err);
      },
    };
    Ok(Buffer { size, host, device, })
  }
  pub fn free_buffer(&self, buffer: Buffer) -> Result<(), Error> {
    let device = self.free(buffer.device);
    let host = self.free(buffer.host);
    device.and(host)
  }
  pub fn copy_to_device(&self, buffer: &Buffer) -> Result<(), Error> {
    self.copy(buffer.device, buffer.host, buffer.size)
  }
  pub fn copy_from_device(&self, buffer: &Buffer) -> Result<(), Error> {
    self.copy(buffer.host, buffer.device, buffer.size)
  }

  /// Fill the host copy from `data`, which must fit.
  pub fn write_buffer(&self, buffer: &Buffer, data: &[u8]) -> Result<(), Error> {
    if data.len() > buffer.size {
      return Err(HsaError::InvalidArgument.into());
    }
    self.write_host(buffer.host, data)
  }
  /// The whole host copy.
  pub fn read_buffer(&self, buffer: &Buffer) -> Result<Vec<u8>, Error> {
    let mut out = vec![0u8; buffer.size];
    self.read_host(buffer.host, &mut out)?;
    Ok(out)
  }

  pub fn write_f32s(&self, buffer: &Buffer, values: &[f32]) -> Result<(), Error> {
    let bytes: Vec<u8> = values.iter()
      .flat_map(|v| v.to_le_bytes().to_vec() )
      .collect();
    self.write_buffer(buffer, &bytes)
  }
  pub fn read_f32s(&self, buffer: &Buffer) -> Result<Vec<f32>, Error> {
    Ok(self.read_buffer(buffer)?
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) )
      .collect())
  }
  pub fn write_u32s(&self, buffer: &Buffer, values: &[u32]) -> Result<(), Error> {
    let bytes: Vec<u8> = values.iter()
      .flat_map(|v| v.to_le_bytes().to_vec() )
      .collect();
    self.write_buffer(buffer, &bytes)
  }
  pub fn read_u32s(&self, buffer: &Buffer) -> Result<Vec<u32>, Error> {
    Ok(self.read_buffer(buffer)?
      .chunks_exact(4)
      .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) )
      .collect())
  }
}
