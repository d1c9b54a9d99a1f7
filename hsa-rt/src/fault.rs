use std::sync::atomic::{AtomicUsize, Ordering, };

/// Countdowns of runtime operations that should fail with
/// `Error::OutOfResources`. Every armed counter fails exactly that many
/// subsequent calls of its kind, then the runtime behaves normally again.
#[derive(Debug, Default)]
pub struct Faults {
  queue_creates: AtomicUsize,
  signal_creates: AtomicUsize,
  allocations: AtomicUsize,
}

impl Faults {
  pub fn fail_queue_creates(&self, n: usize) {
    self.queue_creates.store(n, Ordering::Release);
  }
  pub fn fail_signal_creates(&self, n: usize) {
    self.signal_creates.store(n, Ordering::Release);
  }
  pub fn fail_allocations(&self, n: usize) {
    self.allocations.store(n, Ordering::Release);
  }

  pub(crate) fn take_queue_create(&self) -> bool {
    take(&self.queue_creates)
  }
  pub(crate) fn take_signal_create(&self) -> bool {
    take(&self.signal_creates)
  }
  pub(crate) fn take_allocation(&self) -> bool {
    take(&self.allocations)
  }
}

fn take(counter: &AtomicUsize) -> bool {
  let mut current = counter.load(Ordering::Acquire);
  while current != 0 {
    match counter.compare_exchange_weak(current, current - 1,
                                        Ordering::AcqRel,
                                        Ordering::Acquire) {
      Ok(_) => return true,
      Err(actual) => current = actual,
    }
  }
  false
}
