//! Publishing kernel dispatch packets and waiting for them.
//!
//! One packet is in flight at a time: `dispatch` returns only once the
//! packet completed, or timed out and the queue was recreated. The ring
//! therefore never wraps onto an unconsumed slot.

use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, };

use hsa_rt::ApiContext;
use hsa_rt::agent::Agent;
use hsa_rt::queue::{FenceScope, KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS,
                    KernelDispatchPacket, PACKET_TYPE_KERNEL_DISPATCH,
                    grid_dimensions, header, };
use hsa_rt::signal::{ConditionOrdering, Signal, SignalHostWait, SignalHsaHandle,
                     SignalLoad, SignalStore, WaitState, };

use crate::args::KernargBlock;
use crate::catalog::{self, RegionCatalog, RegionRole, };
use crate::clock::{Clock, SystemClock, };
use crate::config::DispatcherConfig;
use crate::error::{Error, HsaError, HsaQueueError, };
use crate::loader::{Program, ProgramHandle, ProgramLoader, };
use crate::queue::{CommandQueue, QueueState, };

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InvocationParams {
  pub workgroup_size: [u32; 3],
  pub grid_size: [u32; 3],
  /// Packed argument bytes; see `Kernargs`.
  pub kernargs: Vec<u8>,
  /// Group memory requested on top of the program's static amount.
  pub dynamic_group_segment_size: u32,
}

impl InvocationParams {
  pub fn new_1d(grid_size: u32, workgroup_size: u32, kernargs: Vec<u8>) -> Self {
    InvocationParams {
      workgroup_size: [workgroup_size, 1, 1],
      grid_size: [grid_size, 1, 1],
      kernargs,
      dynamic_group_segment_size: 0,
    }
  }
  /// The dimensionality written into the packet's setup field.
  pub fn dimensions(&self) -> u16 {
    grid_dimensions(&self.grid_size)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub enum DispatchStatus {
  Completed,
  /// The device didn't complete in time. The queue was recreated; what
  /// the packet did to device memory is unknown.
  TimedOut,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct DispatchStats {
  pub completed: u64,
  pub timed_out: u64,
  pub failed: u64,
  pub recoveries: u64,
}

pub struct Dispatcher {
  ctx: ApiContext,
  agent: Agent,
  config: DispatcherConfig,
  pub(crate) catalog: RegionCatalog,
  loader: ProgramLoader,
  // declared before `kernargs` so the queue is torn down first.
  queue: CommandQueue,
  kernargs: KernargBlock,
  clock: Box<dyn Clock>,
  stats: DispatchStats,
  /// Set when recovery failed; the dispatcher refuses all further work.
  poisoned: bool,
}

impl Dispatcher {
  pub fn new(ctx: &ApiContext, config: DispatcherConfig) -> Result<Self, Error> {
    Dispatcher::with_clock(ctx, config, Box::new(SystemClock::new()))
  }

  /// Select the configured device, classify its regions, create the
  /// queue and signal and the initial argument block.
  pub fn with_clock(ctx: &ApiContext, config: DispatcherConfig,
                    clock: Box<dyn Clock>)
    -> Result<Self, Error>
  {
    let agent = catalog::select_device(ctx, config.device_index)?;
    log::info!("using device #{}: {}", config.device_index, agent.name()?);

    let catalog = RegionCatalog::discover(&agent)?;
    log::debug!("regions: {:?}", catalog);
    let kernarg_region = catalog.require(RegionRole::ArgumentRegion)?;
    catalog.require(RegionRole::HostVisibleShared)?;
    let kernargs = KernargBlock::new(kernarg_region, config.kernarg_initial_size)?;

    let mut queue = CommandQueue::new(&agent, config.queue_size)?;
    queue.create()?;

    Ok(Dispatcher {
      ctx: ctx.clone(),
      loader: ProgramLoader::new(&agent),
      agent,
      config,
      catalog,
      queue,
      kernargs,
      clock,
      stats: DispatchStats::default(),
      poisoned: false,
    })
  }

  pub fn ctx(&self) -> &ApiContext { &self.ctx }
  pub fn agent(&self) -> &Agent { &self.agent }
  pub fn config(&self) -> &DispatcherConfig { &self.config }
  pub fn catalog(&self) -> &RegionCatalog { &self.catalog }
  pub fn command_queue(&self) -> &CommandQueue { &self.queue }
  pub fn queue_state(&self) -> QueueState { self.queue.state() }
  pub fn kernarg_block(&self) -> &KernargBlock { &self.kernargs }
  pub fn stats(&self) -> DispatchStats { self.stats }
  pub fn is_poisoned(&self) -> bool { self.poisoned }

  pub fn load_program(&mut self, bytes: &[u8]) -> Result<ProgramHandle, Error> {
    self.loader.load(bytes)
  }
  pub fn program(&self, handle: ProgramHandle) -> Result<&Program, Error> {
    self.loader.get(handle)
  }
  pub fn destroy_program(&mut self, handle: ProgramHandle) -> Result<(), Error> {
    self.loader.destroy(handle)
  }

  /// Run `program` once and wait up to `timeout` for it.
  ///
  /// Returns `TimedOut` if the device didn't complete the packet in time
  /// and the queue was successfully recreated; later dispatches use the
  /// new queue. If recreating fails the error is `RecoveryFailed` and
  /// this dispatcher is unusable from then on.
  pub fn dispatch(&mut self, program: ProgramHandle, params: &InvocationParams,
                  timeout: Duration)
    -> Result<DispatchStatus, Error>
  {
    if self.poisoned {
      return Err(Error::QueueDestroyed);
    }

    let (kernel_object, static_group, private_segment_size, kernarg_segment_size) = {
      let program = self.loader.get(program)?;
      (program.kernel_object(), program.group_segment_size(),
       program.private_segment_size(), program.kernarg_segment_size())
    };
    // a short block would leave the tail of the previous arguments in place.
    if params.kernargs.len() < kernarg_segment_size as usize {
      log::debug!("{} kernarg bytes given, program declares {}",
                  params.kernargs.len(), kernarg_segment_size);
      return Err(HsaError::InvalidArgument.into());
    }
    let group_segment_size = static_group
      .checked_add(params.dynamic_group_segment_size)
      .ok_or(HsaError::Overflow)?;
    let workgroup_size = check_workgroup_size(&params.workgroup_size)?;
    if params.grid_size.iter().any(|&d| d == 0 ) {
      return Err(HsaQueueError::GridDimSize.into());
    }

    let kernarg_address = self.kernargs.stage(&self.ctx, &params.kernargs)?;

    let queue = self.queue.queue()?;
    let signal = self.queue.signal()?;

    let index = queue.add_write_index_relaxed(1);
    let packet = KernelDispatchPacket {
      workgroup_size_x: workgroup_size[0],
      workgroup_size_y: workgroup_size[1],
      workgroup_size_z: workgroup_size[2],
      grid_size_x: params.grid_size[0],
      grid_size_y: params.grid_size[1],
      grid_size_z: params.grid_size[2],
      private_segment_size,
      group_segment_size,
      kernel_object,
      kernarg_address,
      completion_signal: signal.as_hndl(),
      ..Default::default()
    };
    let hdr = header(PACKET_TYPE_KERNEL_DISPATCH,
                     &Some(FenceScope::System),
                     &Some(FenceScope::System),
                     true);
    let setup = params.dimensions() << KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS;
    queue.publish(index, &packet, hdr, setup);
    log::trace!("published packet {} on queue #{}, grid {:?}", index, queue.id(),
                params.grid_size);

    let status = self.wait_completion(signal, timeout);
    let packet_error = match status {
      DispatchStatus::Completed => {
        signal.store_screlease(1);
        queue.status().err()
      },
      DispatchStatus::TimedOut => None,
    };

    match (status, packet_error) {
      (DispatchStatus::Completed, None) => {
        self.stats.completed += 1;
        Ok(DispatchStatus::Completed)
      },
      (DispatchStatus::Completed, Some(err)) => {
        // the queue keeps reporting its first error; start clean.
        log::warn!("packet {} failed on the device: {:?}", index, err);
        self.stats.failed += 1;
        self.recover()?;
        Err(Error::PacketFailed(err))
      },
      (DispatchStatus::TimedOut, _) => {
        self.stats.timed_out += 1;
        self.recover()?;
        Ok(DispatchStatus::TimedOut)
      },
    }
  }

  /// Actively wait for `signal` to reach 0, rechecking the elapsed time
  /// after every wake.
  fn wait_completion(&self, signal: &Signal, timeout: Duration) -> DispatchStatus {
    let begin = self.clock.now();
    loop {
      let value = signal.wait_scacquire(ConditionOrdering::Equal, 0,
                                        Some(self.config.poll_interval),
                                        WaitState::Active);
      if value == 0 {
        log::trace!("completion signal cleared");
        return DispatchStatus::Completed;
      }
      let elapsed = self.clock.now()
        .checked_sub(begin)
        .unwrap_or_default();
      if elapsed > timeout {
        log::warn!("kernel execution timed out after {:?}, signal value: {}",
                   elapsed, signal.load_scacquire());
        return DispatchStatus::TimedOut;
      }
    }
  }

  fn recover(&mut self) -> Result<(), Error> {
    self.stats.recoveries += 1;
    match self.queue.recreate() {
      Ok(()) => {
        log::info!("queue and signal recreated");
        Ok(())
      },
      Err(err) => {
        log::error!("fatal: unable to reinitialize signal and queue: {:?}", err);
        self.poisoned = true;
        Err(Error::RecoveryFailed(Box::new(err)))
      },
    }
  }

  /// Tear down the queue and release every program still loaded.
  pub fn shutdown(mut self) -> Result<(), Error> {
    self.queue.destroy()?;
    log::info!("dispatcher shut down after {:?}", self.stats);
    Ok(())
  }
}

fn check_workgroup_size(size: &[u32; 3]) -> Result<[u16; 3], Error> {
  let mut out = [0u16; 3];
  for (out, &dim) in out.iter_mut().zip(size.iter()) {
    *out = u16::try_from(dim)
      .ok()
      .filter(|&d| d != 0 )
      .ok_or(HsaQueueError::WorkgroupDimSize)?;
  }
  Ok(out)
}

impl fmt::Debug for Dispatcher {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Dispatcher")
      .field("agent", &self.agent)
      .field("queue", &self.queue)
      .field("kernargs", &self.kernargs)
      .field("loader", &self.loader)
      .field("stats", &self.stats)
      .field("poisoned", &self.poisoned)
      .finish()
  }
}
