//! The runtime's memory map: every allocation from every region, keyed by
//! its base address. Host and device side accesses both go through here;
//! a lock per access is what keeps the two actors from racing on bytes.

use std::collections::{BTreeMap, HashMap, };

use parking_lot::RwLock;

use crate::error::Error;
use crate::mem::DevicePtr;
use crate::mem::region::RegionId;
use crate::topology::RegionDesc;

/// Keep address zero (and the first page) unmapped so null is never valid.
const ADDRESS_BASE: u64 = 0x1_0000_0000;

struct Allocation {
  region: RegionId,
  host_accessible: bool,
  data: Box<[u8]>,
}

struct MapInner {
  allocs: BTreeMap<u64, Allocation>,
  used: HashMap<RegionId, usize>,
  next_addr: u64,
}

pub(crate) struct MemoryMap {
  inner: RwLock<MapInner>,
}

impl Default for MemoryMap {
  fn default() -> Self {
    MemoryMap {
      inner: RwLock::new(MapInner {
        allocs: BTreeMap::new(),
        used: HashMap::new(),
        next_addr: ADDRESS_BASE,
      }),
    }
  }
}

fn round_up(v: u64, align: u64) -> Option<u64> {
  if align <= 1 {
    return Some(v);
  }
  let mask = align - 1;
  v.checked_add(mask).map(|v| v & !mask )
}

impl MapInner {
  /// Find the allocation covering `[addr, addr + len)`.
  fn resolve(&self, addr: u64, len: usize) -> Result<(u64, &Allocation), Error> {
    let (&base, alloc) = self.allocs.range(..=addr).next_back()
      .ok_or(Error::InvalidAllocation)?;
    let end = addr.checked_add(len as u64)
      .ok_or(Error::Overflow)?;
    if end > base + alloc.data.len() as u64 {
      return Err(Error::InvalidAllocation);
    }
    Ok((base, alloc))
  }
  fn resolve_mut(&mut self, addr: u64, len: usize) -> Result<(u64, &mut Allocation), Error> {
    let (base, _) = self.resolve(addr, len)?;
    let alloc = self.allocs.get_mut(&base)
      .ok_or(Error::InvalidAllocation)?;
    Ok((base, alloc))
  }
}

impl MemoryMap {
  pub(crate) fn allocate(&self, region: RegionId, desc: &RegionDesc,
                         host_accessible: bool, bytes: usize)
    -> Result<DevicePtr, Error>
  {
    Error::InvalidAllocation.check(desc.runtime_alloc_allowed)?;
    Error::InvalidArgument.check(bytes != 0)?;
    Error::InvalidAllocation.check(bytes <= desc.alloc_max_size)?;

    let granule = desc.runtime_alloc_granule.max(1) as u64;
    let len = round_up(bytes as u64, granule)
      .ok_or(Error::Overflow)?;

    let mut inner = self.inner.write();
    let used = inner.used.get(&region).copied().unwrap_or_default();
    if used as u64 + len > desc.size as u64 {
      return Err(Error::OutOfResources);
    }

    let align = desc.runtime_alloc_alignment.max(1) as u64;
    let addr = round_up(inner.next_addr, align)
      .ok_or(Error::Overflow)?;
    // leave a guard gap so an off-by-one never lands in a neighbour.
    inner.next_addr = addr.checked_add(len + align)
      .ok_or(Error::Overflow)?;
    *inner.used.entry(region).or_default() += len as usize;
    inner.allocs.insert(addr, Allocation {
      region,
      host_accessible,
      data: vec![0u8; len as usize].into_boxed_slice(),
    });

    log::trace!("allocated {} bytes at 0x{:x} in region 0x{:x}",
                len, addr, region.0);
    Ok(DevicePtr(addr))
  }

  pub(crate) fn free(&self, ptr: DevicePtr) -> Result<(), Error> {
    let mut inner = self.inner.write();
    let alloc = inner.allocs.remove(&ptr.0)
      .ok_or(Error::InvalidAllocation)?;
    if let Some(used) = inner.used.get_mut(&alloc.region) {
      *used -= alloc.data.len();
    }
    log::trace!("freed 0x{:x}", ptr.0);
    Ok(())
  }

  pub(crate) fn used(&self, region: RegionId) -> usize {
    self.inner.read().used.get(&region).copied().unwrap_or_default()
  }

  pub(crate) fn len(&self) -> usize {
    self.inner.read().allocs.len()
  }

  /// Bytes from `ptr` to the end of its allocation.
  pub(crate) fn extent(&self, ptr: DevicePtr) -> Result<usize, Error> {
    let inner = self.inner.read();
    let (base, alloc) = inner.resolve(ptr.0, 0)?;
    Ok(alloc.data.len() - (ptr.0 - base) as usize)
  }

  pub(crate) fn read(&self, src: DevicePtr, out: &mut [u8], host: bool)
    -> Result<(), Error>
  {
    let inner = self.inner.read();
    let (base, alloc) = inner.resolve(src.0, out.len())?;
    if host && !alloc.host_accessible {
      return Err(Error::InvalidAllocation);
    }
    let start = (src.0 - base) as usize;
    out.copy_from_slice(&alloc.data[start..start + out.len()]);
    Ok(())
  }

  pub(crate) fn write(&self, dst: DevicePtr, data: &[u8], host: bool)
    -> Result<(), Error>
  {
    let mut inner = self.inner.write();
    let (base, alloc) = inner.resolve_mut(dst.0, data.len())?;
    if host && !alloc.host_accessible {
      return Err(Error::InvalidAllocation);
    }
    let start = (dst.0 - base) as usize;
    alloc.data[start..start + data.len()].copy_from_slice(data);
    Ok(())
  }

  pub(crate) fn copy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize)
    -> Result<(), Error>
  {
    if bytes == 0 {
      return Ok(());
    }
    let mut inner = self.inner.write();
    let (src_base, src_alloc) = inner.resolve(src.0, bytes)?;
    let src_start = (src.0 - src_base) as usize;
    let (dst_base, _) = inner.resolve(dst.0, bytes)?;
    let dst_start = (dst.0 - dst_base) as usize;

    if src_base == dst_base {
      let alloc = inner.allocs.get_mut(&src_base)
        .ok_or(Error::InvalidAllocation)?;
      alloc.data.copy_within(src_start..src_start + bytes, dst_start);
      return Ok(());
    }

    let staged = src_alloc.data[src_start..src_start + bytes].to_vec();
    let dst_alloc = inner.allocs.get_mut(&dst_base)
      .ok_or(Error::InvalidAllocation)?;
    dst_alloc.data[dst_start..dst_start + bytes].copy_from_slice(&staged);
    Ok(())
  }
}
