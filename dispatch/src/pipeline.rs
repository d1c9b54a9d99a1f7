//! Staged workloads: Init, Setup, Run, Verify, Shutdown.
//!
//! A `Workload` supplies the data and the program; `run_workload` owns
//! the order of the stages and cleans up after a failed one.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant, };

use serde::{Deserialize, Serialize, };

use crate::builder::{BuildRequest, ProgramSource, };
use crate::debug::DebugBuffer;
use crate::dispatcher::{DispatchStatus, Dispatcher, InvocationParams, };
use crate::error::Error;
use crate::loader::ProgramHandle;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum Stage {
  /// Debug buffer, program build and load.
  Init,
  Setup,
  Run,
  Verify,
  Shutdown,
}
impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct Verification {
  pub checked: usize,
  pub mismatches: usize,
}
impl Verification {
  pub fn passed(&self) -> bool { self.mismatches == 0 }
}

pub trait Workload {
  fn name(&self) -> &str;
  fn program_source(&self) -> &dyn ProgramSource;

  /// Allocate and fill inputs; return how to invoke the program.
  fn setup(&mut self, dispatcher: &Dispatcher) -> Result<InvocationParams, Error>;
  /// Read results back and check them.
  fn verify(&mut self, dispatcher: &Dispatcher) -> Result<Verification, Error>;
  /// Free everything `setup` allocated. Called even if a stage failed.
  fn shutdown(&mut self, dispatcher: &Dispatcher) -> Result<(), Error>;
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DebugOptions {
  pub size: usize,
  pub path: PathBuf,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
  pub timeout: Duration,
  pub debug: Option<DebugOptions>,
}
impl RunOptions {
  pub fn new(timeout: Duration) -> Self {
    RunOptions {
      timeout,
      debug: None,
    }
  }
  pub fn with_debug<P>(mut self, size: usize, path: P) -> Self
    where P: Into<PathBuf>,
  {
    self.debug = Some(DebugOptions {
      size,
      path: path.into(),
    });
    self
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
  pub workload: String,
  pub kernel: String,
  pub status: DispatchStatus,
  /// `None` when the dispatch timed out and nothing was checked.
  pub verification: Option<Verification>,
  pub debug_bytes: Option<usize>,
  pub elapsed: Duration,
}
impl RunReport {
  pub fn passed(&self) -> bool {
    self.status == DispatchStatus::Completed &&
      self.verification.map(|v| v.passed() ).unwrap_or(false)
  }
}

#[derive(Default)]
struct Resources {
  debug: Option<DebugBuffer>,
  program: Option<ProgramHandle>,
}

fn in_stage<T>(stage: Stage, r: Result<T, Error>) -> Result<T, Error> {
  r.map_err(|err| {
    log::error!("{} stage failed: {}", stage, err);
    Error::Stage(stage, Box::new(err))
  })
}

/// Drive `workload` through every stage on `dispatcher`.
///
/// A timed out dispatch isn't an error: the report says `TimedOut` and
/// Verify is skipped, since the device's writes can't be trusted.
pub fn run_workload<W>(dispatcher: &mut Dispatcher, workload: &mut W,
                       options: &RunOptions)
  -> Result<RunReport, Error>
  where W: Workload + ?Sized,
{
  let begin = Instant::now();
  let mut resources = Resources::default();
  let result = run_stages(dispatcher, workload, options, &mut resources, begin);

  log::debug!("{}: shutdown", workload.name());
  let mut shutdown = workload.shutdown(dispatcher);
  if let Some(program) = resources.program.take() {
    shutdown = shutdown.and(dispatcher.destroy_program(program));
  }
  if let Some(debug) = resources.debug.take() {
    shutdown = shutdown.and(debug.free(dispatcher));
  }

  match (result, shutdown) {
    (Ok(report), shutdown) => {
      in_stage(Stage::Shutdown, shutdown)?;
      Ok(report)
    },
    (Err(err), shutdown) => {
      if let Err(shutdown) = shutdown {
        log::warn!("cleanup after a failed stage also failed: {}", shutdown);
      }
      Err(err)
    },
  }
}

fn run_stages<W>(dispatcher: &mut Dispatcher, workload: &mut W,
                 options: &RunOptions, resources: &mut Resources,
                 begin: Instant)
  -> Result<RunReport, Error>
  where W: Workload + ?Sized,
{
  log::info!("{}: init", workload.name());
  if let Some(ref debug) = options.debug {
    if debug.size > 0 {
      let buffer = DebugBuffer::new(dispatcher, debug.size, debug.path.clone());
      resources.debug = Some(in_stage(Stage::Init, buffer)?);
    }
  }
  let request = BuildRequest {
    isa: in_stage(Stage::Init, dispatcher.agent().isa_name().map_err(Error::from))?,
    debug_buffer: resources.debug.as_ref().map(|d| d.address() ),
  };
  let source = workload.program_source();
  log::info!("building {} for {}", source.describe(), request.isa);
  let bytes = in_stage(Stage::Init, source.build(&request))?;
  let program = in_stage(Stage::Init, dispatcher.load_program(&bytes))?;
  resources.program = Some(program);
  let kernel = in_stage(Stage::Init, dispatcher.program(program))?
    .name().to_string();

  log::debug!("{}: setup", workload.name());
  let params = in_stage(Stage::Setup, workload.setup(dispatcher))?;

  log::debug!("{}: run", workload.name());
  let status = in_stage(Stage::Run, dispatcher.dispatch(program, &params,
                                                        options.timeout))?;

  let (verification, debug_bytes) = match status {
    DispatchStatus::Completed => {
      log::debug!("{}: verify", workload.name());
      let verification = in_stage(Stage::Verify, workload.verify(dispatcher))?;
      let debug_bytes = match resources.debug {
        Some(ref debug) => Some(in_stage(Stage::Verify, debug.drain(dispatcher))?),
        None => None,
      };
      if verification.passed() {
        log::info!("{}: verified {} elements", workload.name(), verification.checked);
      } else {
        log::error!("{}: {} of {} elements wrong", workload.name(),
                    verification.mismatches, verification.checked);
      }
      (Some(verification), debug_bytes)
    },
    DispatchStatus::TimedOut => {
      log::warn!("{}: timed out, skipping verify", workload.name());
      (None, None)
    },
  };

  Ok(RunReport {
    workload: workload.name().to_string(),
    kernel,
    status,
    verification,
    debug_bytes,
    elapsed: begin.elapsed(),
  })
}
