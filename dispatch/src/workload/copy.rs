
use std::convert::TryFrom;

use crate::args::Kernargs;
use crate::builder::{BuiltinProgram, ProgramSource, };
use crate::dispatcher::{Dispatcher, InvocationParams, };
use crate::error::{Error, HsaError, };
use crate::mem::Buffer;
use crate::pipeline::{Verification, Workload, };

/// Source pointer, destination pointer, `u64` byte count.
pub const KERNARG_SIZE: u32 = 24;

/// Host data goes to the device, through an identity kernel into a
/// second device buffer, and back to the host, where it must come out
/// unchanged.
pub struct CopyRoundTrip {
  data: Vec<u8>,
  source: Box<dyn ProgramSource>,
  buffers: Vec<Buffer>,
}

impl CopyRoundTrip {
  pub fn new(data: Vec<u8>) -> Self {
    let source = BuiltinProgram::new("copy", "copy_bytes", KERNARG_SIZE);
    CopyRoundTrip {
      data,
      source: Box::new(source),
      buffers: vec![],
    }
  }
  /// `len` bytes of a repeating pattern.
  pub fn with_pattern(len: usize) -> Self {
    let data = (0..len)
      .map(|i| (i * 7 + 3) as u8 )
      .collect();
    CopyRoundTrip::new(data)
  }

  pub fn data(&self) -> &[u8] { &self.data }
}

impl Workload for CopyRoundTrip {
  fn name(&self) -> &str { "copy-round-trip" }
  fn program_source(&self) -> &dyn ProgramSource { &*self.source }

  fn setup(&mut self, dispatcher: &Dispatcher) -> Result<InvocationParams, Error> {
    let grid = u32::try_from(self.data.len())
      .ok()
      .filter(|&n| n != 0 )
      .ok_or(HsaError::InvalidArgument)?;
    for _ in 0..2 {
      let buffer = dispatcher.allocate_buffer(self.data.len())?;
      self.buffers.push(buffer);
    }
    let (src, dst) = (&self.buffers[0], &self.buffers[1]);

    dispatcher.write_buffer(src, &self.data)?;
    dispatcher.copy_to_device(src)?;

    let args = Kernargs::new()
      .ptr(src.device_ptr())
      .ptr(dst.device_ptr())
      .u64(self.data.len() as u64);
    Ok(InvocationParams::new_1d(grid, 64, args.into_bytes()))
  }

  fn verify(&mut self, dispatcher: &Dispatcher) -> Result<Verification, Error> {
    let dst = match self.buffers.get(1) {
      Some(dst) => dst,
      None => { return Ok(Verification::default()); },
    };
    dispatcher.copy_from_device(dst)?;
    let out = dispatcher.read_buffer(dst)?;
    let mismatches = out.iter()
      .zip(self.data.iter())
      .filter(|(got, expected)| got != expected )
      .count();
    Ok(Verification {
      checked: self.data.len(),
      mismatches,
    })
  }

  fn shutdown(&mut self, dispatcher: &Dispatcher) -> Result<(), Error> {
    let mut result = Ok(());
    for buffer in self.buffers.drain(..) {
      result = result.and(dispatcher.free_buffer(buffer));
    }
    result
  }
}
