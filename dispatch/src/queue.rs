//! The command queue and its completion signal. Their lifetimes are
//! tied: both are created together, and destroyed together in the order
//! the queue protocol requires.

use std::fmt;

use hsa_rt::agent::Agent;
use hsa_rt::queue::KernelMultiQueue;
use hsa_rt::signal::Signal;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueueState {
  Uninitialized,
  Active,
  /// Torn down after a timeout, not yet recreated.
  Recovering,
  Destroyed,
}

struct QueueResources {
  queue: KernelMultiQueue,
  signal: Signal,
}

pub struct CommandQueue {
  agent: Agent,
  size: u32,
  state: QueueState,
  resources: Option<QueueResources>,
}

impl CommandQueue {
  /// A queue of `size` packets on `agent`, or the agent's maximum if
  /// `None`. Nothing is created until `create`.
  pub fn new(agent: &Agent, size: Option<u32>) -> Result<Self, Error> {
    let size = match size {
      Some(size) => size,
      None => agent.queue_size()?.end,
    };
    Ok(CommandQueue {
      agent: agent.clone(),
      size,
      state: QueueState::Uninitialized,
      resources: None,
    })
  }

  pub fn state(&self) -> QueueState { self.state }
  pub fn size(&self) -> u32 { self.size }

  pub fn queue(&self) -> Result<&KernelMultiQueue, Error> {
    self.resources.as_ref()
      .map(|r| &r.queue )
      .ok_or(Error::QueueDestroyed)
  }
  pub fn signal(&self) -> Result<&Signal, Error> {
    self.resources.as_ref()
      .map(|r| &r.signal )
      .ok_or(Error::QueueDestroyed)
  }

  /// Create the queue storage and a completion signal holding 1. On
  /// failure whatever was already created is torn down again. A no-op
  /// on an active queue.
  pub fn create(&mut self) -> Result<(), Error> {
    if self.state == QueueState::Active {
      return Ok(());
    }
    let queue = self.agent.new_kernel_multi_queue(self.size)
      .map_err(Error::QueueCreate)?;
    let signal = match Signal::new(self.agent.ctx(), 1, &[]) {
      Ok(signal) => signal,
      Err(err) => {
        queue.inactivate();
        return Err(Error::QueueCreate(err));
      },
    };
    log::debug!("queue #{} and signal {:?} created", queue.id(), signal);
    self.resources = Some(QueueResources { queue, signal, });
    self.state = QueueState::Active;
    Ok(())
  }

  /// Inactivate the queue, then destroy the signal, then the queue.
  pub fn destroy(&mut self) -> Result<(), Error> {
    self.teardown();
    self.state = QueueState::Destroyed;
    Ok(())
  }

  fn teardown(&mut self) {
    if let Some(QueueResources { queue, signal, }) = self.resources.take() {
      queue.inactivate();
      log::debug!("destroying signal {:?} and queue #{}", signal, queue.id());
      drop(signal);
      drop(queue);
    }
  }

  /// Timeout recovery: destroy, then create afresh. If creating fails
  /// the queue stays destroyed.
  pub fn recreate(&mut self) -> Result<(), Error> {
    self.state = QueueState::Recovering;
    self.teardown();
    match self.create() {
      Ok(()) => Ok(()),
      Err(err) => {
        self.state = QueueState::Destroyed;
        Err(err)
      },
    }
  }
}

impl fmt::Debug for CommandQueue {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("CommandQueue")
      .field("agent", &self.agent)
      .field("size", &self.size)
      .field("state", &self.state)
      .field("queue", &self.resources.as_ref().map(|r| &r.queue ))
      .finish()
  }
}

impl Drop for CommandQueue {
  fn drop(&mut self) {
    self.teardown();
  }
}
