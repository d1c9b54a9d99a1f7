//! Kernel dispatch on an HSA agent through one user mode queue.
//!
//! A `Dispatcher` binds to one kernel dispatch agent, sorts its memory
//! regions by role, and owns the queue, its completion signal and the
//! kernel argument block. `dispatch` writes an AQL kernel dispatch packet
//! into the ring, publishes it with a release store of the header, rings
//! the doorbell and waits on the completion signal. A dispatch which
//! doesn't complete within its timeout is abandoned and the queue and
//! signal are recreated.
//!
//! ```no_run
//! use std::time::Duration;
//! use hsa_dispatch::*;
//!
//! # fn main() -> Result<(), Error> {
//! let ctx = hsa_rt::ApiContext::new();
//! let mut dispatcher = Dispatcher::new(&ctx, DispatcherConfig::from_env()?)?;
//! let mut workload = VectorAdd::new(64);
//! let report = run_workload(&mut dispatcher, &mut workload,
//!                           &RunOptions::new(Duration::from_secs(1)))?;
//! assert!(report.passed());
//! # Ok(())
//! # }
//! ```

extern crate tracing as log;

pub use crate::args::{KernargBlock, Kernargs, };
pub use crate::builder::{BuildCommand, BuildRequest, BuiltinProgram, PrebuiltBinary,
                         ProgramSource, };
pub use crate::catalog::{RegionCatalog, RegionInfo, RegionRole, classify, };
pub use crate::clock::{Clock, SteppingClock, SystemClock, };
pub use crate::config::DispatcherConfig;
pub use crate::debug::DebugBuffer;
pub use crate::dispatcher::{DispatchStats, DispatchStatus, Dispatcher, InvocationParams, };
pub use crate::error::{Error, LoadError, };
pub use crate::loader::{Program, ProgramHandle, ProgramLoader, };
pub use crate::mem::Buffer;
pub use crate::pipeline::{RunOptions, RunReport, Stage, Verification, Workload,
                          run_workload, };
pub use crate::queue::{CommandQueue, QueueState, };
pub use crate::workload::{CopyRoundTrip, VectorAdd, };

pub mod args;
pub mod builder;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod debug;
pub mod dispatcher;
pub mod error;
pub mod loader;
pub mod mem;
pub mod pipeline;
pub mod queue;
pub mod workload;

#[cfg(test)]
mod test;
