//! The packet processor of the soft kernel dispatch agent. One thread per
//! queue, consuming packets in order the way a hardware command processor
//! would: doorbell, header, body, execute, invalidate, complete.

use std::sync::Arc;
use std::sync::atomic::fence;
use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;

use crate::ApiContext;
use crate::error::Error;
use crate::isa::KernelInvocation;
use crate::mem::region::Segment;
use crate::queue::{FENCE_SCOPE_NONE, FenceScope, KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS,
                   KernelDispatchPacket, PACKET_TYPE_INVALID,
                   PACKET_TYPE_KERNEL_DISPATCH, QueueShared, header,
                   header_scacquire_scope, header_screlease_scope,
                   header_type, };
use crate::signal::{ConditionOrdering, SignalHostWait, WaitState, Ordering, };

/// How long the processor sleeps on the doorbell before rechecking that
/// its queue is still active.
const DOORBELL_POLL: Duration = Duration::from_millis(5);

pub(crate) fn spawn_processor(ctx: ApiContext, queue: Arc<QueueShared>)
  -> Result<(), Error>
{
  let name = format!("soft-agent-q{}", queue.id);
  thread::Builder::new()
    .name(name)
    .spawn(move || process(ctx, queue) )
    .map(|_| () )
    .map_err(|err| {
      log::error!("failed to spawn packet processor: {}", err);
      Error::OutOfResources
    })
}

fn process(ctx: ApiContext, queue: Arc<QueueShared>) {
  let mask = queue.slots.len() as u64 - 1;
  let doorbell = queue.doorbell.as_ref();
  let mut read_index = queue.read_index.load(Ordering::Acquire);

  loop {
    loop {
      if !queue.is_active() {
        log::debug!("queue #{} processor exiting", queue.id);
        return;
      }
      let ret = doorbell.wait_scacquire(ConditionOrdering::GreaterEqual,
                                        read_index as i64,
                                        Some(DOORBELL_POLL),
                                        WaitState::Blocked);
      if ret >= read_index as i64 && queue.is_active() {
        break;
      }
    }

    let slot = &queue.slots[(read_index & mask) as usize];
    // with several producers the doorbell can run ahead of this header.
    let backoff = Backoff::new();
    let (hdr, setup) = loop {
      let (hdr, setup) = slot.load_header_scacquire();
      if header_type(hdr) != PACKET_TYPE_INVALID {
        break (hdr, setup);
      }
      if !queue.is_active() {
        return;
      }
      if backoff.is_completed() {
        thread::yield_now();
      } else {
        backoff.snooze();
      }
    };
    if header_scacquire_scope(hdr) != FENCE_SCOPE_NONE {
      fence(Ordering::Acquire);
    }
    let packet = slot.load_body();
    log::trace!("queue #{} packet {}: {:?}", queue.id, read_index, packet);

    let result = execute(&ctx, &queue, hdr, setup, &packet);

    if !queue.is_active() {
      log::debug!("queue #{} inactivated during packet {}, abandoning it",
                  queue.id, read_index);
      return;
    }
    if let Err(err) = result {
      log::error!("queue #{} packet {} failed: {:?}", queue.id, read_index, err);
      queue.record_error(err);
    }
    if header_screlease_scope(hdr) != FENCE_SCOPE_NONE {
      fence(Ordering::Release);
    }

    // free the slot before completion so a producer woken by the signal
    // can't have its next packet clobbered.
    slot.packet_store_rel(header(PACKET_TYPE_INVALID,
                                 &Some(FenceScope::System),
                                 &Some(FenceScope::System),
                                 false), 0);
    read_index += 1;
    queue.read_index.store(read_index, Ordering::Release);

    if !packet.completion_signal.is_null() {
      match ctx.0.signals.get(packet.completion_signal) {
        Some(cell) => {
          cell.subtract(1, Ordering::Release);
          log::trace!("completion signal {:?} now {}", packet.completion_signal,
                      cell.load(Ordering::Relaxed));
        },
        None => {
          log::warn!("completion signal {:?} was destroyed; dropping the write",
                     packet.completion_signal);
        },
      }
    }
  }
}

fn execute(ctx: &ApiContext, queue: &QueueShared, hdr: u16, setup: u16,
           packet: &KernelDispatchPacket)
  -> Result<(), Error>
{
  Error::InvalidPacketFormat
    .check(header_type(hdr) == PACKET_TYPE_KERNEL_DISPATCH)?;
  let dimensions = (setup >> KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS) & 0b11;
  Error::InvalidPacketFormat.check(dimensions != 0)?;
  let wg_ok = packet.workgroup_size().iter().all(|&d| d != 0 );
  let grid_ok = packet.grid_size().iter().all(|&d| d != 0 );
  Error::InvalidPacketFormat.check(wg_ok && grid_ok)?;

  let kernel = ctx.0.code.read()
    .get(&packet.kernel_object)
    .cloned()
    .ok_or(Error::InvalidCodeSymbol)?;
  Error::IncompatibleArguments.check(kernel.agent == queue.agent)?;

  let group_limit = ctx.0.topology.agents[queue.agent].regions.iter()
    .filter(|r| r.segment == Segment::Group )
    .map(|r| r.size )
    .max()
    .unwrap_or_default();
  Error::OutOfResources
    .check(packet.group_segment_size as usize <= group_limit)?;

  let invocation = KernelInvocation {
    ctx,
    queue,
    packet,
    dimensions,
    kernarg_segment_size: kernel.kernarg_segment_size,
    debug_buffer: kernel.debug_buffer,
  };
  log::trace!("executing `{}` over {:?}", kernel.name, packet.grid_size());
  kernel.entry.invoke(&invocation)
}
