//! A software implementation of the HSA runtime object model.
//!
//! Agents, regions, signals, user mode AQL queues, code objects and
//! executables behave the way the HSA runtime specifies them, but the
//! kernel dispatch agent is a packet processor thread on the host which
//! executes native routines (see `isa`) instead of GCN code. The memory
//! ordering contract between the packet producer and the processor is
//! the real one: packet bodies are published by a release store of the
//! header word, and nothing else.

extern crate rmp_serde as rmps;
extern crate tracing as log;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, };

use parking_lot::RwLock;

use crate::agent::Agent;
use crate::error::Error;
use crate::fault::Faults;
use crate::isa::{KernelRegistry, NativeKernel, };
use crate::mem::DevicePtr;
use crate::mem::map::MemoryMap;
use crate::signal::SignalTable;
use crate::topology::Topology;

pub mod agent;
pub mod code_object;
pub mod error;
pub mod executable;
pub mod fault;
pub mod isa;
pub mod mem;
pub mod queue;
pub mod signal;
pub mod topology;

mod soft;


static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Kernel object addresses handed out by `Executable::freeze`. Starts high
/// so they are never mistaken for memory addresses.
const KERNEL_OBJECT_BASE: u64 = 0x7f00_0000_0000;
const KERNEL_OBJECT_STRIDE: u64 = 0x100;

pub(crate) struct LoadedKernel {
  pub(crate) agent: usize,
  pub(crate) name: String,
  pub(crate) entry: Arc<dyn NativeKernel>,
  pub(crate) kernarg_segment_size: u32,
  pub(crate) debug_buffer: DevicePtr,
}

pub(crate) struct Runtime {
  id: u64,
  pub(crate) topology: Topology,
  pub(crate) memory: MemoryMap,
  pub(crate) signals: SignalTable,
  pub(crate) kernels: KernelRegistry,
  /// Kernel objects of frozen executables, by kernel object address.
  pub(crate) code: RwLock<HashMap<u64, Arc<LoadedKernel>>>,
  next_kernel_object: AtomicU64,
  next_queue_id: AtomicU64,
  pub(crate) faults: Faults,
}

/// A handle to one runtime instance. Clones share the instance.
#[derive(Clone)]
pub struct ApiContext(pub(crate) Arc<Runtime>);

impl ApiContext {
  /// Create a runtime with the default topology.
  pub fn new() -> Self {
    ApiContext::with_topology(Topology::default())
  }
  pub fn with_topology(topology: Topology) -> Self {
    let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
    log::debug!("runtime #{} up with {} agents", id, topology.agents.len());
    ApiContext(Arc::new(Runtime {
      id,
      memory: MemoryMap::default(),
      topology,
      signals: SignalTable::default(),
      kernels: KernelRegistry::with_builtins(),
      code: RwLock::new(HashMap::new()),
      next_kernel_object: AtomicU64::new(KERNEL_OBJECT_BASE),
      next_queue_id: AtomicU64::new(1),
      faults: Faults::default(),
    }))
  }

  pub fn id(&self) -> u64 { self.0.id }

  pub fn agents(&self) -> Result<Vec<Agent>, Error> {
    Ok((0..self.0.topology.agents.len())
      .map(|index| Agent::new(self.clone(), index))
      .collect())
  }

  pub fn faults(&self) -> &Faults { &self.0.faults }

  /// Make `kernel` available as an entry routine to every agent of this
  /// runtime which has an ISA.
  pub fn register_kernel<K>(&self, name: &str, kernel: K)
    where K: NativeKernel + 'static,
  {
    self.0.kernels.register(name, Arc::new(kernel));
  }

  /// Copy `bytes` between two allocations. Either side may be host or
  /// device memory; the copy is symmetric.
  pub fn memory_copy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize)
    -> Result<(), Error>
  {
    self.0.memory.copy(dst, src, bytes)
  }
  pub fn memory_free(&self, ptr: DevicePtr) -> Result<(), Error> {
    self.0.memory.free(ptr)
  }
  /// Read from host accessible memory.
  pub fn read_host(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), Error> {
    self.0.memory.read(src, out, true)
  }
  /// Write to host accessible memory.
  pub fn write_host(&self, dst: DevicePtr, data: &[u8]) -> Result<(), Error> {
    self.0.memory.write(dst, data, true)
  }

  /// Signals currently registered, queue doorbells included.
  pub fn live_signals(&self) -> usize { self.0.signals.len() }
  /// Kernel objects of executables which are frozen and not yet dropped.
  pub fn live_kernel_objects(&self) -> usize { self.0.code.read().len() }
  pub fn live_allocations(&self) -> usize { self.0.memory.len() }

  pub(crate) fn next_kernel_object(&self) -> u64 {
    self.0.next_kernel_object.fetch_add(KERNEL_OBJECT_STRIDE, Ordering::Relaxed)
  }
  pub(crate) fn next_queue_id(&self) -> u64 {
    self.0.next_queue_id.fetch_add(1, Ordering::Relaxed)
  }
  pub(crate) fn same_runtime(&self, other: &ApiContext) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}
impl Default for ApiContext {
  fn default() -> Self { ApiContext::new() }
}
impl fmt::Debug for ApiContext {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "ApiContext(#{})", self.0.id)
  }
}
impl PartialEq for ApiContext {
  fn eq(&self, rhs: &Self) -> bool { self.same_runtime(rhs) }
}
impl Eq for ApiContext { }
