//! The soft agent's "instruction set": native routines a code object's
//! kernel symbols name as their entry points.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::ApiContext;
use crate::error::Error;
use crate::mem::DevicePtr;
use crate::queue::{KernelDispatchPacket, QueueShared, };

pub const SOFT_ISA_NAME: &str = "gfx-soft";

/// A kernel entry routine. Runs once per dispatch, over the whole grid.
pub trait NativeKernel: Send + Sync {
  fn invoke(&self, invocation: &KernelInvocation) -> Result<(), Error>;
}
impl<F> NativeKernel for F
  where F: Fn(&KernelInvocation) -> Result<(), Error> + Send + Sync,
{
  fn invoke(&self, invocation: &KernelInvocation) -> Result<(), Error> {
    (self)(invocation)
  }
}

/// What a kernel sees of its dispatch: the packet, its argument segment
/// and device memory.
pub struct KernelInvocation<'a> {
  pub(crate) ctx: &'a ApiContext,
  pub(crate) queue: &'a QueueShared,
  pub(crate) packet: &'a KernelDispatchPacket,
  pub(crate) dimensions: u16,
  pub(crate) kernarg_segment_size: u32,
  pub(crate) debug_buffer: DevicePtr,
}

impl<'a> KernelInvocation<'a> {
  pub fn dimensions(&self) -> u16 { self.dimensions }
  pub fn grid_size(&self) -> [u32; 3] { self.packet.grid_size() }
  pub fn workgroup_size(&self) -> [u16; 3] { self.packet.workgroup_size() }
  pub fn group_segment_size(&self) -> u32 { self.packet.group_segment_size }
  pub fn private_segment_size(&self) -> u32 { self.packet.private_segment_size }
  /// Total work-items in the grid; `Overflow` if that doesn't fit a `u64`.
  pub fn work_items(&self) -> Result<u64, Error> {
    let g = self.grid_size();
    let mut n = g[0] as u64;
    if self.dimensions > 1 {
      n = n.checked_mul(g[1] as u64).ok_or(Error::Overflow)?;
    }
    if self.dimensions > 2 {
      n = n.checked_mul(g[2] as u64).ok_or(Error::Overflow)?;
    }
    Ok(n)
  }
  /// Null when the code object wasn't loaded with a debug buffer.
  pub fn debug_buffer(&self) -> DevicePtr { self.debug_buffer }
  pub fn is_queue_active(&self) -> bool { self.queue.is_active() }

  pub fn kernarg_address(&self) -> DevicePtr { self.packet.kernarg_address }
  /// The argument segment, as large as the kernel symbol declares.
  pub fn kernargs(&self) -> Result<Vec<u8>, Error> {
    let mut out = vec![0u8; self.kernarg_segment_size as usize];
    if !out.is_empty() {
      self.read(self.packet.kernarg_address, &mut out)?;
    }
    Ok(out)
  }
  pub fn kernarg_u32(&self, offset: u32) -> Result<u32, Error> {
    let mut b = [0u8; 4];
    self.read_kernarg(offset, &mut b)?;
    Ok(u32::from_le_bytes(b))
  }
  pub fn kernarg_u64(&self, offset: u32) -> Result<u64, Error> {
    let mut b = [0u8; 8];
    self.read_kernarg(offset, &mut b)?;
    Ok(u64::from_le_bytes(b))
  }
  pub fn kernarg_ptr(&self, offset: u32) -> Result<DevicePtr, Error> {
    self.kernarg_u64(offset).map(DevicePtr)
  }
  fn read_kernarg(&self, offset: u32, out: &mut [u8]) -> Result<(), Error> {
    let end = offset as usize + out.len();
    Error::InvalidArgument.check(end <= self.kernarg_segment_size as usize)?;
    let at = self.packet.kernarg_address.offset(offset as u64)
      .ok_or(Error::Overflow)?;
    self.read(at, out)
  }

  pub fn read(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), Error> {
    self.ctx.0.memory.read(src, out, false)
  }
  pub fn write(&self, dst: DevicePtr, data: &[u8]) -> Result<(), Error> {
    self.ctx.0.memory.write(dst, data, false)
  }
  pub fn copy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<(), Error> {
    self.ctx.0.memory.copy(dst, src, bytes)
  }
  /// Bytes between `ptr` and the end of its allocation.
  pub fn extent(&self, ptr: DevicePtr) -> Result<usize, Error> {
    self.ctx.0.memory.extent(ptr)
  }
  /// `InvalidAllocation` unless `count` elements of `size` bytes fit in
  /// `ptr`'s allocation. Returns the byte count.
  pub fn check_extent(&self, ptr: DevicePtr, count: u64, size: usize)
    -> Result<usize, Error>
  {
    let bytes: usize = count.checked_mul(size as u64)
      .and_then(|b| b.try_into().ok() )
      .ok_or(Error::Overflow)?;
    Error::InvalidAllocation.check(bytes <= self.extent(ptr)?)?;
    Ok(bytes)
  }

  pub fn read_f32s(&self, src: DevicePtr, count: usize) -> Result<Vec<f32>, Error> {
    let bytes = self.check_extent(src, count as u64, 4)?;
    let mut bytes = vec![0u8; bytes];
    self.read(src, &mut bytes)?;
    Ok(bytes.chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) )
      .collect())
  }
  pub fn write_f32s(&self, dst: DevicePtr, values: &[f32]) -> Result<(), Error> {
    let bytes: Vec<u8> = values.iter()
      .flat_map(|v| v.to_le_bytes().to_vec() )
      .collect();
    self.write(dst, &bytes)
  }
}

impl<'a> fmt::Debug for KernelInvocation<'a> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("KernelInvocation")
      .field("grid_size", &self.grid_size())
      .field("workgroup_size", &self.workgroup_size())
      .field("kernargs", &self.packet.kernarg_address)
      .finish()
  }
}

/// Write each work-item's flat id into the debug buffer, as far as it
/// reaches.
fn trace_work_items(inv: &KernelInvocation, count: u64) -> Result<(), Error> {
  let buf = inv.debug_buffer();
  if buf.is_null() {
    return Ok(());
  }
  let capacity = (inv.extent(buf)? / 4) as u64;
  let ids: Vec<u8> = (0..count.min(capacity))
    .flat_map(|id| (id as u32).to_le_bytes().to_vec() )
    .collect();
  inv.write(buf, &ids)
}

/// kernargs: `a`, `b`, `c` pointers. `c[i] = a[i] + b[i]`.
fn vector_add_f32(inv: &KernelInvocation) -> Result<(), Error> {
  let a = inv.kernarg_ptr(0)?;
  let b = inv.kernarg_ptr(8)?;
  let c = inv.kernarg_ptr(16)?;
  let n = inv.work_items()?;
  for &ptr in [a, b, c].iter() {
    inv.check_extent(ptr, n, 4)?;
  }
  let n = n as usize;

  let a = inv.read_f32s(a, n)?;
  let b = inv.read_f32s(b, n)?;
  let sum: Vec<f32> = a.iter().zip(b.iter())
    .map(|(a, b)| a + b )
    .collect();
  inv.write_f32s(c, &sum)?;
  trace_work_items(inv, n as u64)
}

/// kernargs: `src`, `dst` pointers, `u64` byte count.
fn copy_bytes(inv: &KernelInvocation) -> Result<(), Error> {
  let src = inv.kernarg_ptr(0)?;
  let dst = inv.kernarg_ptr(8)?;
  let bytes: usize = inv.kernarg_u64(16)?
    .try_into()
    .map_err(|_| Error::Overflow )?;
  inv.copy(dst, src, bytes)?;
  trace_work_items(inv, inv.work_items()?)
}

/// kernargs: `dst` pointer, `u32` value. One element per work-item.
fn fill_u32(inv: &KernelInvocation) -> Result<(), Error> {
  let dst = inv.kernarg_ptr(0)?;
  let value = inv.kernarg_u32(8)?.to_le_bytes();
  let n = inv.work_items()?;
  inv.check_extent(dst, n, value.len())?;
  inv.write(dst, &value.repeat(n as usize))
}

/// Never completes; returns only once the queue is torn down.
fn hang(inv: &KernelInvocation) -> Result<(), Error> {
  while inv.is_queue_active() {
    thread::sleep(Duration::from_millis(1));
  }
  Ok(())
}

lazy_static::lazy_static! {
  static ref BUILTINS: Vec<(&'static str, Arc<dyn NativeKernel>)> = vec![
    ("vector_add_f32", Arc::new(vector_add_f32) as Arc<dyn NativeKernel>),
    ("copy_bytes", Arc::new(copy_bytes) as Arc<dyn NativeKernel>),
    ("fill_u32", Arc::new(fill_u32) as Arc<dyn NativeKernel>),
    ("hang", Arc::new(hang) as Arc<dyn NativeKernel>),
  ];
}

/// Entry routines known to one runtime.
pub(crate) struct KernelRegistry {
  kernels: RwLock<HashMap<String, Arc<dyn NativeKernel>>>,
}
impl KernelRegistry {
  pub(crate) fn with_builtins() -> Self {
    let kernels = BUILTINS.iter()
      .map(|(name, k)| (name.to_string(), k.clone()) )
      .collect();
    KernelRegistry {
      kernels: RwLock::new(kernels),
    }
  }
  pub(crate) fn register(&self, name: &str, kernel: Arc<dyn NativeKernel>) {
    let prev = self.kernels.write().insert(name.to_string(), kernel);
    if prev.is_some() {
      log::warn!("kernel entry `{}` replaced", name);
    }
  }
  pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn NativeKernel>> {
    self.kernels.read().get(name).cloned()
  }
}

/// Names of the entry routines every soft agent provides.
pub fn builtin_kernels() -> impl Iterator<Item = &'static str> {
  BUILTINS.iter().map(|(name, _)| *name )
}
