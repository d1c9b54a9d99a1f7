//! Argument blocks: packing kernel arguments, and the device side block
//! they are staged into before each dispatch.

use std::fmt;

use hsa_rt::ApiContext;
use hsa_rt::mem::DevicePtr;
use hsa_rt::mem::region::Region;

use crate::error::Error;

/// Packs kernel arguments at their natural alignment, the way the kernel
/// argument segment lays them out.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Kernargs {
  bytes: Vec<u8>,
}

impl Kernargs {
  pub fn new() -> Self { Kernargs::default() }

  fn align_to(&mut self, align: usize) {
    let len = self.bytes.len();
    let padded = (len + align - 1) / align * align;
    self.bytes.resize(padded, 0);
  }

  pub fn ptr(self, ptr: DevicePtr) -> Self {
    self.u64(ptr.addr())
  }
  pub fn u64(mut self, v: u64) -> Self {
    self.align_to(8);
    self.bytes.extend_from_slice(&v.to_le_bytes());
    self
  }
  pub fn u32(mut self, v: u32) -> Self {
    self.align_to(4);
    self.bytes.extend_from_slice(&v.to_le_bytes());
    self
  }
  pub fn f32(self, v: f32) -> Self {
    self.u32(v.to_bits())
  }

  pub fn len(&self) -> usize { self.bytes.len() }
  pub fn is_empty(&self) -> bool { self.bytes.is_empty() }
  pub fn as_bytes(&self) -> &[u8] { &self.bytes }
  pub fn into_bytes(self) -> Vec<u8> { self.bytes }
}

/// The device visible argument block. Its capacity only ever grows: a
/// dispatch needing more than is held replaces the block, anything
/// smaller reuses it.
pub struct KernargBlock {
  region: Region,
  ptr: DevicePtr,
  capacity: usize,
  reallocations: usize,
}

impl KernargBlock {
  pub fn new(region: &Region, initial: usize) -> Result<Self, Error> {
    let ptr = if initial == 0 {
      DevicePtr::null()
    } else {
      region.allocate(initial)?
    };
    log::debug!("kernarg block at {}, size 0x{:x} ({})", ptr, initial, initial);
    Ok(KernargBlock {
      region: region.clone(),
      ptr,
      capacity: initial,
      reallocations: 0,
    })
  }

  pub fn address(&self) -> DevicePtr { self.ptr }
  pub fn capacity(&self) -> usize { self.capacity }
  /// How many times the block was replaced by a larger one.
  pub fn reallocations(&self) -> usize { self.reallocations }

  /// Make room for at least `size` bytes. If allocating the new block
  /// fails the old one is kept.
  pub fn reserve(&mut self, size: usize) -> Result<(), Error> {
    if size <= self.capacity {
      return Ok(());
    }
    log::info!("recreating kernarg block (old size {}, new size {})",
               self.capacity, size);
    let ptr = self.region.allocate(size)?;
    let old = std::mem::replace(&mut self.ptr, ptr);
    self.capacity = size;
    self.reallocations += 1;
    if !old.is_null() {
      self.region.deallocate(old)?;
    }
    Ok(())
  }

  /// Copy `args` into the block, growing it first if needed. Returns the
  /// address to put in the packet.
  pub fn stage(&mut self, ctx: &ApiContext, args: &[u8]) -> Result<DevicePtr, Error> {
    self.reserve(args.len())?;
    if !args.is_empty() {
      ctx.write_host(self.ptr, args)?;
    }
    Ok(self.ptr)
  }
}

impl fmt::Debug for KernargBlock {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("KernargBlock")
      .field("ptr", &self.ptr)
      .field("capacity", &self.capacity)
      .field("reallocations", &self.reallocations)
      .finish()
  }
}

impl Drop for KernargBlock {
  fn drop(&mut self) {
    if self.ptr.is_null() {
      return;
    }
    if let Err(err) = self.region.deallocate(self.ptr) {
      log::error!("failed to free kernarg block {}: {:?}", self.ptr, err);
    }
  }
}
