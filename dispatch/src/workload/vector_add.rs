
use crate::args::Kernargs;
use crate::builder::{BuiltinProgram, ProgramSource, };
use crate::dispatcher::{Dispatcher, InvocationParams, };
use crate::error::Error;
use crate::mem::Buffer;
use crate::pipeline::{Verification, Workload, };

pub const WORKGROUP_SIZE: u32 = 64;
/// Three pointers: `a`, `b`, `c`.
pub const KERNARG_SIZE: u32 = 24;

/// `c[i] = a[i] + b[i]` over `a[i] = i`, `b[i] = 1.25 * i`.
pub struct VectorAdd {
  length: u32,
  source: Box<dyn ProgramSource>,
  /// `a`, `b`, `c`, as far as setup got.
  buffers: Vec<Buffer>,
}

impl VectorAdd {
  /// Uses the soft agent's `vector_add_f32` routine.
  pub fn new(length: u32) -> Self {
    let source = BuiltinProgram::new("vector_add", "vector_add_f32", KERNARG_SIZE);
    VectorAdd::with_source(length, Box::new(source))
  }
  pub fn with_source(length: u32, source: Box<dyn ProgramSource>) -> Self {
    VectorAdd {
      length,
      source,
      buffers: vec![],
    }
  }

  pub fn length(&self) -> u32 { self.length }

  pub fn inputs(&self) -> (Vec<f32>, Vec<f32>) {
    let a = (0..self.length)
      .map(|i| i as f32 )
      .collect();
    let b = (0..self.length)
      .map(|i| (i as f32) * 1.25 )
      .collect();
    (a, b)
  }
}

impl Workload for VectorAdd {
  fn name(&self) -> &str { "vector-add" }
  fn program_source(&self) -> &dyn ProgramSource { &*self.source }

  fn setup(&mut self, dispatcher: &Dispatcher) -> Result<InvocationParams, Error> {
    let bytes = self.length as usize * 4;
    for _ in 0..3 {
      let buffer = dispatcher.allocate_buffer(bytes)?;
      self.buffers.push(buffer);
    }
    let (a, b, c) = (&self.buffers[0], &self.buffers[1], &self.buffers[2]);

    let (a_data, b_data) = self.inputs();
    dispatcher.write_f32s(a, &a_data)?;
    dispatcher.write_f32s(b, &b_data)?;
    dispatcher.copy_to_device(a)?;
    dispatcher.copy_to_device(b)?;

    let args = Kernargs::new()
      .ptr(a.device_ptr())
      .ptr(b.device_ptr())
      .ptr(c.device_ptr());
    Ok(InvocationParams::new_1d(self.length, WORKGROUP_SIZE, args.into_bytes()))
  }

  fn verify(&mut self, dispatcher: &Dispatcher) -> Result<Verification, Error> {
    let c = match self.buffers.get(2) {
      Some(c) => c,
      None => { return Ok(Verification::default()); },
    };
    dispatcher.copy_from_device(c)?;
    let out = dispatcher.read_f32s(c)?;

    let (a, b) = self.inputs();
    let mut verification = Verification {
      checked: out.len(),
      mismatches: 0,
    };
    for (i, ((a, b), got)) in a.iter().zip(b.iter()).zip(out.iter()).enumerate() {
      let expected = a + b;
      if expected != *got {
        log::error!("validation failed at {}: got {} expected {}", i, got, expected);
        verification.mismatches += 1;
      }
    }
    Ok(verification)
  }

  fn shutdown(&mut self, dispatcher: &Dispatcher) -> Result<(), Error> {
    let mut result = Ok(());
    for buffer in self.buffers.drain(..) {
      result = result.and(dispatcher.free_buffer(buffer));
    }
    result
  }
}
