use std::cell::Cell;
use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, fence, };

use parking_lot::Mutex;

use crate::ApiContext;
use crate::agent::{Agent, Feature, QueueType, };
use crate::error::Error as RtError;
use crate::mem::DevicePtr;
use crate::signal::{Signal, SignalHandle, SignalRef, SignalStore, Ordering, };

pub const PACKET_TYPE_VENDOR_SPECIFIC: u16 = 0;
pub const PACKET_TYPE_INVALID: u16 = 1;
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;

pub const PACKET_HEADER_TYPE: u16 = 0;
pub const PACKET_HEADER_BARRIER: u16 = 8;
pub const PACKET_HEADER_SCACQUIRE_FENCE_SCOPE: u16 = 9;
pub const PACKET_HEADER_SCRELEASE_FENCE_SCOPE: u16 = 11;

pub const FENCE_SCOPE_NONE: u16 = 0;
pub const FENCE_SCOPE_AGENT: u16 = 1;
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

pub const KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS: u16 = 0;

/// Words in a packet body, ie everything after the 32-bit header word.
pub const PACKET_BODY_WORDS: usize = 15;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FenceScope {
  Agent,
  System,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Error {
  Full,
  Inactive,
  WorkgroupDimSize,
  GridDimSize,
}
impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}
impl StdError for Error { }

fn scope_to_enum(scope: &Option<FenceScope>) -> u16 {
  match scope {
    &None => FENCE_SCOPE_NONE,
    &Some(FenceScope::System) => FENCE_SCOPE_SYSTEM,
    &Some(FenceScope::Agent) => FENCE_SCOPE_AGENT,
  }
}

/// Build a 16-bit AQL packet header.
pub fn header(ty: u16,
              scacquire: &Option<FenceScope>,
              screlease: &Option<FenceScope>,
              barrier: bool) -> u16 {
  let mut header = ty << PACKET_HEADER_TYPE;

  let v = scope_to_enum(scacquire);
  header |= v << PACKET_HEADER_SCACQUIRE_FENCE_SCOPE;

  let v = scope_to_enum(screlease);
  header |= v << PACKET_HEADER_SCRELEASE_FENCE_SCOPE;

  let v = if barrier {
    1
  } else {
    0
  };
  header |= v << PACKET_HEADER_BARRIER;

  header
}
pub fn header_type(header: u16) -> u16 {
  (header >> PACKET_HEADER_TYPE) & 0xff
}
pub fn header_scacquire_scope(header: u16) -> u16 {
  (header >> PACKET_HEADER_SCACQUIRE_FENCE_SCOPE) & 0b11
}
pub fn header_screlease_scope(header: u16) -> u16 {
  (header >> PACKET_HEADER_SCRELEASE_FENCE_SCOPE) & 0b11
}
pub fn header_barrier(header: u16) -> bool {
  (header >> PACKET_HEADER_BARRIER) & 1 != 0
}

/// Number of grid dimensions a dispatch over `grid` uses: 3 if z > 1,
/// else 2 if y > 1, else 1.
pub fn grid_dimensions(grid: &[u32; 3]) -> u16 {
  if grid[2] > 1 {
    3
  } else if grid[1] > 1 {
    2
  } else {
    1
  }
}

/// The body of an AQL kernel dispatch packet. The first four bytes of the
/// hardware layout (header and setup) live in the slot's header word.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct KernelDispatchPacket {
  pub workgroup_size_x: u16,
  pub workgroup_size_y: u16,
  pub workgroup_size_z: u16,
  pub reserved0: u16,
  pub grid_size_x: u32,
  pub grid_size_y: u32,
  pub grid_size_z: u32,
  pub private_segment_size: u32,
  pub group_segment_size: u32,
  pub kernel_object: u64,
  pub kernarg_address: DevicePtr,
  pub reserved2: u64,
  pub completion_signal: SignalHandle,
}

fn lo(v: u64) -> u32 { v as u32 }
fn hi(v: u64) -> u32 { (v >> 32) as u32 }
fn join(lo: u32, hi: u32) -> u64 { (lo as u64) | ((hi as u64) << 32) }

impl KernelDispatchPacket {
  pub fn workgroup_size(&self) -> [u16; 3] {
    [self.workgroup_size_x, self.workgroup_size_y, self.workgroup_size_z]
  }
  pub fn grid_size(&self) -> [u32; 3] {
    [self.grid_size_x, self.grid_size_y, self.grid_size_z]
  }

  fn to_words(&self) -> [u32; PACKET_BODY_WORDS] {
    [
      (self.workgroup_size_x as u32) | ((self.workgroup_size_y as u32) << 16),
      (self.workgroup_size_z as u32) | ((self.reserved0 as u32) << 16),
      self.grid_size_x,
      self.grid_size_y,
      self.grid_size_z,
      self.private_segment_size,
      self.group_segment_size,
      lo(self.kernel_object), hi(self.kernel_object),
      lo(self.kernarg_address.0), hi(self.kernarg_address.0),
      lo(self.reserved2), hi(self.reserved2),
      lo(self.completion_signal.0), hi(self.completion_signal.0),
    ]
  }
  fn from_words(w: &[u32; PACKET_BODY_WORDS]) -> Self {
    KernelDispatchPacket {
      workgroup_size_x: w[0] as u16,
      workgroup_size_y: (w[0] >> 16) as u16,
      workgroup_size_z: w[1] as u16,
      reserved0: (w[1] >> 16) as u16,
      grid_size_x: w[2],
      grid_size_y: w[3],
      grid_size_z: w[4],
      private_segment_size: w[5],
      group_segment_size: w[6],
      kernel_object: join(w[7], w[8]),
      kernarg_address: DevicePtr(join(w[9], w[10])),
      reserved2: join(w[11], w[12]),
      completion_signal: SignalHandle(join(w[13], w[14])),
    }
  }
}

/// One ring slot. The header word is the only synchronization point:
/// body words are written relaxed and become visible to the packet
/// processor through the release store of the header.
#[repr(C, align(64))]
pub struct PacketSlot {
  header: AtomicU32,
  body: [AtomicU32; PACKET_BODY_WORDS],
}
impl PacketSlot {
  fn new() -> Self {
    let invalid = header(PACKET_TYPE_INVALID, &None, &None, false);
    PacketSlot {
      header: AtomicU32::new(invalid as u32),
      body: Default::default(),
    }
  }

  /// Zero every byte after the header word.
  pub fn clear_body(&self) {
    for word in self.body.iter() {
      word.store(0, Ordering::Relaxed);
    }
  }
  pub fn store_body(&self, packet: &KernelDispatchPacket) {
    for (word, v) in self.body.iter().zip(packet.to_words().iter()) {
      word.store(*v, Ordering::Relaxed);
    }
  }
  pub fn load_body(&self) -> KernelDispatchPacket {
    let mut words = [0u32; PACKET_BODY_WORDS];
    for (v, word) in words.iter_mut().zip(self.body.iter()) {
      *v = word.load(Ordering::Relaxed);
    }
    KernelDispatchPacket::from_words(&words)
  }

  /// Returns `(header, setup)`.
  pub fn load_header_scacquire(&self) -> (u16, u16) {
    let v = self.header.load(Ordering::Acquire);
    (v as u16, (v >> 16) as u16)
  }
  /// Store `header | setup << 16` with release ordering.
  pub fn packet_store_rel(&self, header: u16, setup: u16) {
    let new_value = (header as u32) | ((setup as u32) << 16);
    self.header.store(new_value, Ordering::Release);
  }
}

pub(crate) struct QueueShared {
  pub(crate) id: u64,
  pub(crate) agent: usize,
  pub(crate) slots: Box<[PacketSlot]>,
  pub(crate) write_index: AtomicU64,
  pub(crate) read_index: AtomicU64,
  pub(crate) active: AtomicBool,
  pub(crate) doorbell: Signal,
  /// First error the packet processor hit, if any.
  pub(crate) error: Mutex<Option<RtError>>,
}
impl QueueShared {
  pub(crate) fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }
  pub(crate) fn inactivate(&self) {
    if self.active.swap(false, Ordering::AcqRel) {
      log::debug!("queue #{} inactivated", self.id);
      // wake the processor so it notices.
      self.doorbell.store_screlease(i64::max_value());
    }
  }
  pub(crate) fn record_error(&self, err: RtError) {
    let mut slot = self.error.lock();
    if slot.is_none() {
      *slot = Some(err);
    }
  }
}

pub trait QueueKind: Send {
  const TYPE: QueueType;
}
/// Single producer queues can be moved between threads but not shared.
pub struct SingleQueueType(PhantomData<Cell<()>>);
impl QueueKind for SingleQueueType {
  const TYPE: QueueType = QueueType::Single;
}
pub struct MultiQueueType(());
impl QueueKind for MultiQueueType {
  const TYPE: QueueType = QueueType::Multiple;
}

pub struct KernelQueue<T>
  where T: QueueKind,
{
  shared: Arc<QueueShared>,
  _ctxt: ApiContext,
  _kind: PhantomData<T>,
}

pub type KernelSingleQueue = KernelQueue<SingleQueueType>;
pub type KernelMultiQueue = KernelQueue<MultiQueueType>;

impl Agent {
  fn new_kernel_queue_impl<T>(&self, size: u32) -> Result<KernelQueue<T>, RtError>
    where T: QueueKind,
  {
    match self.feature() {
      Ok(Feature::Kernel) => { },
      _ => { return Err(RtError::InvalidAgent); },
    }
    let range = self.queue_size()?;
    RtError::InvalidQueueCreation.check(size.is_power_of_two())?;
    RtError::InvalidQueueCreation
      .check(size >= range.start && size <= range.end)?;
    if self.ctx.0.faults.take_queue_create() {
      return Err(RtError::OutOfResources);
    }

    let doorbell = Signal::create(&self.ctx, -1);
    let slots = (0..size)
      .map(|_| PacketSlot::new() )
      .collect::<Vec<_>>()
      .into_boxed_slice();
    let shared = Arc::new(QueueShared {
      id: self.ctx.next_queue_id(),
      agent: self.index,
      slots,
      write_index: AtomicU64::new(0),
      read_index: AtomicU64::new(0),
      active: AtomicBool::new(true),
      doorbell,
      error: Mutex::new(None),
    });

    crate::soft::spawn_processor(self.ctx.clone(), shared.clone())?;
    log::debug!("created {:?} queue #{} with {} slots on {:?}",
                T::TYPE, shared.id, size, self);

    Ok(KernelQueue {
      shared,
      _ctxt: self.ctx.clone(),
      _kind: PhantomData,
    })
  }

  /// `size` is in packets, and must be a power of two within
  /// `self.queue_size()`.
  pub fn new_kernel_queue(&self, size: u32) -> Result<KernelSingleQueue, RtError> {
    self.new_kernel_queue_impl(size)
  }
  pub fn new_kernel_multi_queue(&self, size: u32) -> Result<KernelMultiQueue, RtError> {
    self.new_kernel_queue_impl(size)
  }
}

impl<T> KernelQueue<T>
  where T: QueueKind,
{
  pub fn id(&self) -> u64 { self.shared.id }
  pub fn size(&self) -> u32 { self.shared.slots.len() as u32 }
  pub fn queue_type(&self) -> QueueType { T::TYPE }

  pub fn is_active(&self) -> bool { self.shared.is_active() }
  /// Stop the packet processor. Packets not yet completed are abandoned;
  /// their completion signals are never touched again.
  pub fn inactivate(&self) {
    self.shared.inactivate();
  }
  /// The first error the packet processor reported for this queue.
  pub fn status(&self) -> Result<(), RtError> {
    match *self.shared.error.lock() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  pub fn doorbell_ref(&self) -> SignalRef {
    self.shared.doorbell.as_ref()
  }

  pub fn load_read_index_scacquire(&self) -> u64 {
    self.shared.read_index.load(Ordering::Acquire)
  }
  pub fn load_read_index_relaxed(&self) -> u64 {
    self.shared.read_index.load(Ordering::Relaxed)
  }
  pub fn load_write_index_scacquire(&self) -> u64 {
    self.shared.write_index.load(Ordering::Acquire)
  }
  pub fn load_write_index_relaxed(&self) -> u64 {
    self.shared.write_index.load(Ordering::Relaxed)
  }

  /// The slot a packet with `index` occupies.
  pub fn packet_slot(&self, index: u64) -> &PacketSlot {
    let mask = self.shared.slots.len() as u64 - 1;
    &self.shared.slots[(index & mask) as usize]
  }

  pub fn try_enqueue_kernel_dispatch(&self, dispatch: &DispatchPacket)
    -> Result<u64, Error>
  {
    // check the packet params before we get a write index.
    dispatch.check()?;
    if !self.is_active() {
      return Err(Error::Inactive);
    }

    let size = self.size() as u64;
    let write_index = loop {
      let write = self.load_write_index_scacquire();
      let read = self.load_read_index_scacquire();
      if write - read >= size {
        return Err(Error::Full);
      }
      let r = self.shared.write_index
        .compare_exchange_weak(write, write + 1,
                               Ordering::AcqRel, Ordering::Relaxed);
      if r.is_ok() {
        break write;
      }
    };

    let setup = grid_dimensions(&dispatch.grid_size)
      << KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS;
    let ty = header(PACKET_TYPE_KERNEL_DISPATCH,
                    &dispatch.scacquire_scope,
                    &dispatch.screlease_scope,
                    dispatch.barrier);
    self.publish(write_index, &dispatch.body(), ty, setup);

    Ok(write_index)
  }

  /// Write `packet` into the slot of the already reserved `index` and hand
  /// it to the packet processor: clear and fill the body, release fence,
  /// release store of `header | setup << 16`, then ring the doorbell with
  /// `index`. The header word is the last thing written.
  pub fn publish(&self, index: u64, packet: &KernelDispatchPacket,
                 header: u16, setup: u16)
  {
    let slot = self.packet_slot(index);
    slot.clear_body();
    slot.store_body(packet);
    fence(Ordering::Release);
    slot.packet_store_rel(header, setup);
    self.doorbell_ref()
      .store_relaxed(index as i64);
  }
}

macro_rules! impl_add {
  ($f:ident, $ordering:ident) => (
    impl<T> KernelQueue<T>
      where T: QueueKind,
    {
      /// Reserve `val` packet slots; returns the previous write index.
      pub fn $f(&self, val: u64) -> u64 {
        self.shared.write_index.fetch_add(val, Ordering::$ordering)
      }
    }
  )
}
impl_add!(add_write_index_scacq_screl, AcqRel);
impl_add!(add_write_index_scacquire, Acquire);
impl_add!(add_write_index_relaxed, Relaxed);
impl_add!(add_write_index_screlease, Release);

impl<T> fmt::Debug for KernelQueue<T>
  where T: QueueKind,
{
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("KernelQueue")
      .field("id", &self.shared.id)
      .field("type", &T::TYPE)
      .field("size", &self.shared.slots.len())
      .field("active", &self.is_active())
      .finish()
  }
}

impl<T> Drop for KernelQueue<T>
  where T: QueueKind,
{
  fn drop(&mut self) {
    // the processor thread holds its own reference and exits once it
    // notices; a kernel still running on it is left detached.
    self.shared.inactivate();
  }
}

#[derive(Clone, Debug)]
pub struct DispatchPacket {
  pub workgroup_size: [u16; 3],
  pub grid_size: [u32; 3],
  pub private_segment_size: u32,
  pub group_segment_size: u32,
  pub barrier: bool,
  pub scacquire_scope: Option<FenceScope>,
  pub screlease_scope: Option<FenceScope>,
  pub kernel_object: u64,
  pub kernarg_address: DevicePtr,
  pub completion_signal: SignalHandle,
}

impl DispatchPacket {
  fn check(&self) -> Result<(), Error> {
    if self.workgroup_size.iter().any(|&d| d == 0 ) {
      return Err(Error::WorkgroupDimSize);
    }
    if self.grid_size.iter().any(|&d| d == 0 ) {
      return Err(Error::GridDimSize);
    }
    Ok(())
  }
  fn body(&self) -> KernelDispatchPacket {
    KernelDispatchPacket {
      workgroup_size_x: self.workgroup_size[0],
      workgroup_size_y: self.workgroup_size[1],
      workgroup_size_z: self.workgroup_size[2],
      grid_size_x: self.grid_size[0],
      grid_size_y: self.grid_size[1],
      grid_size_z: self.grid_size[2],
      private_segment_size: self.private_segment_size,
      group_segment_size: self.group_segment_size,
      kernel_object: self.kernel_object,
      kernarg_address: self.kernarg_address,
      completion_signal: self.completion_signal,
      ..Default::default()
    }
  }
}
