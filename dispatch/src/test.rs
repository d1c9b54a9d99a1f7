
use std::env;
use std::fs;
use std::thread;
use std::time::{Duration, Instant, };

use parking_lot::Mutex;

use hsa_rt::ApiContext;
use hsa_rt::code_object::{CodeObject, SymbolDesc, SymbolKind, };
use hsa_rt::isa::KernelInvocation;
use hsa_rt::mem::DevicePtr;
use hsa_rt::mem::region::{GlobalFlags, Segment, };
use hsa_rt::signal::SignalLoad;
use hsa_rt::topology::{AgentDesc, RegionDesc, Topology, };

use crate::*;
use crate::config::{DEVICE_ENV, POLL_ENV, TIMEOUT_ENV, };
use crate::error::{HsaError, HsaQueueError, };

lazy_static::lazy_static! {
  /// Serializes tests which touch the process environment.
  static ref ENV_LOCK: Mutex<()> = Mutex::new(());
}

const TIMEOUT: Duration = Duration::from_secs(5);

fn small_config() -> DispatcherConfig {
  DispatcherConfig {
    queue_size: Some(64),
    ..DispatcherConfig::default()
  }
}
fn dispatcher(ctx: &ApiContext) -> Dispatcher {
  Dispatcher::new(ctx, small_config()).unwrap()
}
fn request(d: &Dispatcher) -> BuildRequest {
  BuildRequest {
    isa: d.agent().isa_name().unwrap(),
    debug_buffer: None,
  }
}
fn load(d: &mut Dispatcher, program: &BuiltinProgram) -> ProgramHandle {
  let bytes = program.build(&request(d)).unwrap();
  d.load_program(&bytes).unwrap()
}
fn vector_add_program() -> BuiltinProgram {
  BuiltinProgram::new("vector_add", "vector_add_f32", 24)
}
fn hang_program() -> BuiltinProgram {
  BuiltinProgram::new("hang", "hang", 0)
}

/// Poll `f` until it holds, for at most a second.
fn eventually<F>(mut f: F) -> bool
  where F: FnMut() -> bool,
{
  let deadline = Instant::now() + Duration::from_secs(1);
  while Instant::now() < deadline {
    if f() {
      return true;
    }
    thread::sleep(Duration::from_millis(1));
  }
  f()
}

fn store_dims(inv: &KernelInvocation) -> Result<(), HsaError> {
  let dst = inv.kernarg_ptr(0)?;
  let dims = inv.dimensions() as u32;
  inv.write(dst, &dims.to_le_bytes())
}

fn gpu_without(flags: u32) -> AgentDesc {
  let mut gpu = AgentDesc::soft_gpu();
  gpu.regions.retain(|r| r.global_flags & flags == 0 );
  gpu
}

#[test]
fn classify_is_a_function_of_the_flags() {
  let segments = [
    Segment::Global, Segment::ReadOnly, Segment::Private,
    Segment::Group, Segment::KernelArg,
  ];
  for &segment in segments.iter() {
    for bits in 0..8u32 {
      for &host_accessible in [false, true].iter() {
        let info = RegionInfo {
          segment,
          global_flags: if segment == Segment::Global {
            Some(GlobalFlags(bits))
          } else {
            None
          },
          host_accessible,
          size: 4096,
          alloc_granule: 4096,
        };
        let role = classify(&info);
        assert_eq!(role, classify(&info), "{:?}", info);
        // size and granule play no part.
        let resized = RegionInfo {
          size: 1,
          alloc_granule: 1,
          ..info
        };
        assert_eq!(role, classify(&resized));

        if segment != Segment::Global || bits == 0 {
          assert_eq!(role, None, "{:?}", info);
          continue;
        }
        let flags = GlobalFlags(bits);
        let expected = if flags.kernel_arg() {
          RegionRole::ArgumentRegion
        } else if flags.fine_grained() {
          RegionRole::HostVisibleShared
        } else if host_accessible {
          RegionRole::HostAccessibleLocal
        } else {
          RegionRole::DeviceLocal
        };
        assert_eq!(role, Some(expected), "{:?}", info);
      }
    }
  }
}

#[test]
fn default_device_has_every_role() {
  let ctx = ApiContext::new();
  let agent = catalog::select_device(&ctx, 0).unwrap();
  let catalog = RegionCatalog::discover(&agent).unwrap();
  assert_eq!(catalog.len(), 4);

  let args = catalog.require(RegionRole::ArgumentRegion).unwrap();
  assert!(args.global_flags().unwrap().unwrap().kernel_arg());
  let shared = catalog.require(RegionRole::HostVisibleShared).unwrap();
  let flags = shared.global_flags().unwrap().unwrap();
  assert!(flags.fine_grained() && !flags.kernel_arg());
  let local = catalog.require(RegionRole::DeviceLocal).unwrap();
  assert!(!local.host_accessible().unwrap());
  let mapped = catalog.require(RegionRole::HostAccessibleLocal).unwrap();
  assert!(mapped.host_accessible().unwrap());
}

#[test]
fn duplicate_roles_keep_the_last_region() {
  let mut gpu = AgentDesc::soft_gpu();
  gpu.regions.push(RegionDesc::global(GlobalFlags::COARSE_GRAINED, false, 1 << 20));
  let ctx = ApiContext::with_topology(Topology {
    agents: vec![AgentDesc::host_cpu(), gpu],
  });
  let agent = catalog::select_device(&ctx, 0).unwrap();
  let catalog = RegionCatalog::discover(&agent).unwrap();
  let local = catalog.require(RegionRole::DeviceLocal).unwrap();
  assert_eq!(local.size().unwrap(), 1 << 20);
}

#[test]
fn device_selection() {
  let ctx = ApiContext::with_topology(Topology {
    agents: vec![
      AgentDesc::host_cpu(),
      AgentDesc::soft_gpu(),
      AgentDesc::soft_gpu(),
    ],
  });
  assert_eq!(catalog::kernel_agents(&ctx).unwrap().len(), 2);
  assert_eq!(catalog::select_device(&ctx, 1).unwrap().index(), 2);
  match catalog::select_device(&ctx, 2) {
    Err(Error::NoSuchDevice { index: 2, found: 2, }) => { },
    r => panic!("unexpected {:?}", r),
  }

  let cpu_only = ApiContext::with_topology(Topology {
    agents: vec![AgentDesc::host_cpu()],
  });
  match Dispatcher::new(&cpu_only, DispatcherConfig::default()) {
    Err(Error::NoSuchDevice { index: 0, found: 0, }) => { },
    r => panic!("unexpected {:?}", r),
  }
}

#[test]
fn missing_regions_fail_discovery() {
  let ctx = ApiContext::with_topology(Topology {
    agents: vec![AgentDesc::host_cpu(), gpu_without(GlobalFlags::KERNARG)],
  });
  match Dispatcher::new(&ctx, small_config()) {
    Err(Error::MissingRegion(RegionRole::ArgumentRegion)) => { },
    r => panic!("unexpected {:?}", r),
  }

  let ctx = ApiContext::with_topology(Topology {
    agents: vec![AgentDesc::host_cpu(), gpu_without(GlobalFlags::FINE_GRAINED)],
  });
  // the kernarg region is fine grained too, so it's gone as well.
  assert!(Dispatcher::new(&ctx, small_config()).is_err());
}

#[test]
fn kernargs_are_naturally_aligned() {
  let ptr = DevicePtr::from_addr(0x1122_3344_5566_7788);
  let args = Kernargs::new()
    .u32(7)
    .ptr(ptr)
    .f32(1.5)
    .u64(9);
  assert_eq!(args.len(), 32);
  let bytes = args.as_bytes();
  assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
  assert_eq!(&bytes[4..8], &[0u8; 4]);
  assert_eq!(&bytes[8..16], &ptr.addr().to_le_bytes());
  assert_eq!(&bytes[16..20], &1.5f32.to_bits().to_le_bytes());
  assert_eq!(&bytes[24..32], &9u64.to_le_bytes());
}

#[test]
fn kernarg_block_only_grows() {
  let ctx = ApiContext::new();
  let agent = catalog::select_device(&ctx, 0).unwrap();
  let catalog = RegionCatalog::discover(&agent).unwrap();
  let region = catalog.require(RegionRole::ArgumentRegion).unwrap();

  let mut block = KernargBlock::new(region, 256).unwrap();
  let s1 = vec![1u8; 1024];
  let s2 = vec![2u8; 8192];
  let first = block.stage(&ctx, &s1).unwrap();
  assert_eq!(block.reallocations(), 1);
  let second = block.stage(&ctx, &s2).unwrap();
  assert_eq!(block.reallocations(), 2);
  let third = block.stage(&ctx, &s1).unwrap();
  assert_eq!(block.reallocations(), 2);
  assert_ne!(first, second);
  assert_eq!(second, third);
  assert_eq!(block.capacity(), 8192);

  let mut back = vec![0u8; 1024];
  ctx.read_host(third, &mut back).unwrap();
  assert_eq!(back, s1);
}

#[test]
fn dispatch_argument_growth_reallocates_once() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  assert_eq!(d.kernarg_block().capacity(), config::KERNARG_INITIAL_SIZE);
  let fill = load(&mut d, &BuiltinProgram::new("fill", "fill_u32", 12));
  let out = d.allocate_host(16).unwrap();

  let run = |d: &mut Dispatcher, size: usize, value: u32| {
    let mut args = Kernargs::new()
      .ptr(out)
      .u32(value)
      .into_bytes();
    args.resize(size, 0);
    let params = InvocationParams::new_1d(4, 4, args);
    assert_eq!(d.dispatch(fill, &params, TIMEOUT).unwrap(),
               DispatchStatus::Completed);
    let mut back = [0u8; 16];
    d.read_host(out, &mut back).unwrap();
    assert!(back.chunks(4).all(|c| c == value.to_le_bytes() ));
  };

  run(&mut d, 2048, 1);
  assert_eq!(d.kernarg_block().reallocations(), 0);
  run(&mut d, 16384, 2);
  assert_eq!(d.kernarg_block().reallocations(), 1);
  run(&mut d, 2048, 3);
  assert_eq!(d.kernarg_block().reallocations(), 1);
  assert_eq!(d.kernarg_block().capacity(), 16384);
}

#[test]
fn grid_dimensionality() {
  let cases = [
    ([64, 1, 1], 1),
    ([1, 1, 1], 1),
    ([8, 4, 1], 2),
    ([2, 2, 2], 3),
    ([1, 1, 4], 3),
    ([4, 1, 2], 3),
  ];
  for &(grid, dims) in cases.iter() {
    let params = InvocationParams {
      workgroup_size: [1, 1, 1],
      grid_size: grid,
      ..InvocationParams::default()
    };
    assert_eq!(params.dimensions(), dims, "grid {:?}", grid);
  }

  // and the device sees the same thing in the packet's setup field.
  let ctx = ApiContext::new();
  ctx.register_kernel("store_dims", store_dims);
  let mut d = dispatcher(&ctx);
  let program = load(&mut d, &BuiltinProgram::new("dims", "store_dims", 8));
  let out = d.allocate_host(4).unwrap();
  for &(grid, dims) in cases.iter() {
    let params = InvocationParams {
      workgroup_size: [1, 1, 1],
      grid_size: grid,
      kernargs: Kernargs::new().ptr(out).into_bytes(),
      dynamic_group_segment_size: 0,
    };
    assert_eq!(d.dispatch(program, &params, TIMEOUT).unwrap(),
               DispatchStatus::Completed);
    let mut back = [0u8; 4];
    d.read_host(out, &mut back).unwrap();
    assert_eq!(u32::from_le_bytes(back), dims as u32, "grid {:?}", grid);
  }
}

#[test]
fn bad_invocation_params() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let program = load(&mut d, &vector_add_program());
  let mut params = InvocationParams::new_1d(0, 64, vec![0; 24]);
  match d.dispatch(program, &params, TIMEOUT) {
    Err(Error::HsaQueue(HsaQueueError::GridDimSize)) => { },
    r => panic!("unexpected {:?}", r),
  }
  params.grid_size = [64, 1, 1];
  params.workgroup_size = [1 << 16, 1, 1];
  match d.dispatch(program, &params, TIMEOUT) {
    Err(Error::HsaQueue(HsaQueueError::WorkgroupDimSize)) => { },
    r => panic!("unexpected {:?}", r),
  }
  // nothing was published.
  assert_eq!(d.command_queue().queue().unwrap().load_write_index_relaxed(), 0);
}

#[test]
fn host_device_round_trip() {
  let ctx = ApiContext::new();
  let d = dispatcher(&ctx);
  let data: Vec<u8> = (0..777u32).map(|i| (i % 251) as u8 ).collect();
  let buffer = d.allocate_buffer(data.len()).unwrap();
  d.write_buffer(&buffer, &data).unwrap();
  d.copy_to_device(&buffer).unwrap();

  // the device copy isn't reachable from the host.
  let mut direct = vec![0u8; data.len()];
  assert!(d.read_host(buffer.device_ptr(), &mut direct).is_err());

  d.write_buffer(&buffer, &vec![0u8; data.len()]).unwrap();
  d.copy_from_device(&buffer).unwrap();
  assert_eq!(d.read_buffer(&buffer).unwrap(), data);
  d.free_buffer(buffer).unwrap();
}

#[test]
fn copy_workload_round_trips() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let allocations = ctx.live_allocations();
  let mut workload = CopyRoundTrip::with_pattern(5000);
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed(), "{:?}", report);
  assert_eq!(report.verification.unwrap().checked, 5000);
  assert_eq!(ctx.live_allocations(), allocations);
  assert_eq!(ctx.live_kernel_objects(), 0);
}

#[test]
fn zero_sized_allocations() {
  let ctx = ApiContext::new();
  let d = dispatcher(&ctx);
  let ptr = d.allocate_host(0).unwrap();
  assert!(ptr.is_null());
  d.free(ptr).unwrap();
  match d.allocate_device(0) {
    Err(Error::Hsa(HsaError::InvalidArgument)) => { },
    r => panic!("unexpected {:?}", r),
  }
  let buffer = d.allocate_buffer(0).unwrap();
  d.copy_to_device(&buffer).unwrap();
  assert!(d.read_buffer(&buffer).unwrap().is_empty());
  d.free_buffer(buffer).unwrap();
}

#[test]
fn memory_errors_leave_the_dispatcher_usable() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let ptr = d.allocate_host(64).unwrap();
  d.free(ptr).unwrap();
  match d.free(ptr) {
    Err(Error::Hsa(HsaError::InvalidAllocation)) => { },
    r => panic!("unexpected {:?}", r),
  }
  assert!(d.copy(ptr, ptr, 64).is_err());

  let mut workload = VectorAdd::new(64);
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed());
}

#[test]
fn vector_add_64() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let program = load(&mut d, &vector_add_program());

  let len = 64;
  let a = d.allocate_buffer(len * 4).unwrap();
  let b = d.allocate_buffer(len * 4).unwrap();
  let c = d.allocate_buffer(len * 4).unwrap();
  let a_data: Vec<f32> = (0..len).map(|i| i as f32 ).collect();
  let b_data: Vec<f32> = (0..len).map(|i| i as f32 * 1.25 ).collect();
  d.write_f32s(&a, &a_data).unwrap();
  d.write_f32s(&b, &b_data).unwrap();
  d.copy_to_device(&a).unwrap();
  d.copy_to_device(&b).unwrap();

  let args = Kernargs::new()
    .ptr(a.device_ptr())
    .ptr(b.device_ptr())
    .ptr(c.device_ptr());
  let params = InvocationParams::new_1d(len as u32, 64, args.into_bytes());
  assert_eq!(d.dispatch(program, &params, TIMEOUT).unwrap(),
             DispatchStatus::Completed);
  // the signal is reset for the next packet.
  assert_eq!(d.command_queue().signal().unwrap().load_relaxed(), 1);

  d.copy_from_device(&c).unwrap();
  let out = d.read_f32s(&c).unwrap();
  for (i, &v) in out.iter().enumerate() {
    assert_eq!(v, 2.25 * i as f32, "c[{}]", i);
  }

  for buffer in vec![a, b, c] {
    d.free_buffer(buffer).unwrap();
  }
  assert_eq!(d.stats().completed, 1);
}

#[test]
fn vector_add_workload() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let mut workload = VectorAdd::new(64);
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed(), "{:?}", report);
  assert_eq!(report.kernel, "vector_add");
  assert_eq!(report.verification, Some(Verification {
    checked: 64,
    mismatches: 0,
  }));
  assert_eq!(report.debug_bytes, None);
}

#[test]
fn timeout_recovers_with_a_fresh_queue() {
  let ctx = ApiContext::new();
  let clock = SteppingClock::new(Duration::from_millis(10));
  let mut d = Dispatcher::with_clock(&ctx, small_config(), Box::new(clock))
    .unwrap();
  let hang = load(&mut d, &hang_program());
  let old_queue = d.command_queue().queue().unwrap().id();

  let begin = Instant::now();
  let params = InvocationParams::new_1d(1, 1, vec![]);
  let status = d.dispatch(hang, &params, Duration::from_millis(100)).unwrap();
  assert_eq!(status, DispatchStatus::TimedOut);
  assert!(begin.elapsed() < TIMEOUT);

  assert_eq!(d.queue_state(), QueueState::Active);
  assert_ne!(d.command_queue().queue().unwrap().id(), old_queue);
  assert_eq!(d.command_queue().signal().unwrap().load_relaxed(), 1);
  let stats = d.stats();
  assert_eq!((stats.timed_out, stats.recoveries), (1, 1));

  let mut workload = VectorAdd::new(64);
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed());
}

#[test]
fn timeout_with_the_system_clock() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let mut workload = VectorAdd::with_source(64, Box::new(hang_program()));
  let options = RunOptions::new(Duration::from_millis(20));
  let report = run_workload(&mut d, &mut workload, &options).unwrap();
  assert_eq!(report.status, DispatchStatus::TimedOut);
  assert_eq!(report.verification, None);
  assert!(!report.passed());
}

#[test]
fn failed_recovery_poisons_the_dispatcher() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let hang = load(&mut d, &hang_program());
  let add = load(&mut d, &vector_add_program());

  ctx.faults().fail_queue_creates(1);
  let params = InvocationParams::new_1d(1, 1, vec![]);
  let err = d.dispatch(hang, &params, Duration::from_millis(10)).unwrap_err();
  match err {
    Error::RecoveryFailed(ref inner) => {
      match **inner {
        Error::QueueCreate(HsaError::OutOfResources) => { },
        ref e => panic!("unexpected {:?}", e),
      }
    },
    ref e => panic!("unexpected {:?}", e),
  }
  assert!(err.is_fatal());
  assert!(d.is_poisoned());
  assert_eq!(d.queue_state(), QueueState::Destroyed);

  match d.dispatch(add, &InvocationParams::new_1d(1, 1, vec![0; 24]), TIMEOUT) {
    Err(Error::QueueDestroyed) => { },
    r => panic!("unexpected {:?}", r),
  }
}

#[test]
fn device_errors_fail_the_dispatch_only() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let add = load(&mut d, &vector_add_program());

  // null pointers: the kernel faults reading `a`.
  let params = InvocationParams::new_1d(64, 64, vec![0; 24]);
  match d.dispatch(add, &params, TIMEOUT) {
    Err(Error::PacketFailed(HsaError::InvalidAllocation)) => { },
    r => panic!("unexpected {:?}", r),
  }
  assert_eq!(d.queue_state(), QueueState::Active);

  // more group memory than the agent has.
  let mut params = InvocationParams::new_1d(1, 1, vec![0; 24]);
  params.dynamic_group_segment_size = 1 << 20;
  match d.dispatch(add, &params, TIMEOUT) {
    Err(Error::PacketFailed(HsaError::OutOfResources)) => { },
    r => panic!("unexpected {:?}", r),
  }

  let mut workload = VectorAdd::new(64);
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed());
  assert_eq!(d.stats().failed, 2);
}

#[test]
fn program_handles() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let first = load(&mut d, &vector_add_program());
  let second = load(&mut d, &hang_program());
  assert_eq!(first, ProgramHandle(0));
  assert_eq!(second, ProgramHandle(1));
  assert_eq!(d.program(first).unwrap().name(), "vector_add");
  assert_ne!(d.program(first).unwrap().kernel_object(), 0);
  assert_eq!(ctx.live_kernel_objects(), 2);

  d.destroy_program(first).unwrap();
  assert_eq!(ctx.live_kernel_objects(), 1);
  match d.destroy_program(first) {
    Err(Error::InvalidProgram(ProgramHandle(0))) => { },
    r => panic!("unexpected {:?}", r),
  }
  match d.dispatch(first, &InvocationParams::new_1d(1, 1, vec![0; 24]), TIMEOUT) {
    Err(Error::InvalidProgram(ProgramHandle(0))) => { },
    r => panic!("unexpected {:?}", r),
  }
  assert!(d.program(ProgramHandle(9)).is_err());
  assert!(d.destroy_program(ProgramHandle(9)).is_err());

  // handles aren't reused.
  assert_eq!(load(&mut d, &vector_add_program()), ProgramHandle(2));
}

#[test]
fn load_failures_release_everything() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let isa = d.agent().isa_name().unwrap();

  match d.load_program(b"definitely not a code object") {
    Err(Error::Load(LoadError::Deserialize(_))) => { },
    r => panic!("unexpected {:?}", r),
  }

  let two = CodeObject::new(isa.clone())
    .with_kernel("a", "fill_u32", 12)
    .with_kernel("b", "fill_u32", 12)
    .serialize().unwrap();
  match d.load_program(&two) {
    Err(Error::Load(LoadError::AmbiguousKernel(names))) => {
      assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    },
    r => panic!("unexpected {:?}", r),
  }

  let none = CodeObject::new(isa.clone())
    .with_symbol(SymbolDesc {
      name: "table".into(),
      kind: SymbolKind::Variable,
      entry: String::new(),
      group_segment_size: 0,
      private_segment_size: 0,
      kernarg_segment_size: 0,
    })
    .serialize().unwrap();
  match d.load_program(&none) {
    Err(Error::Load(LoadError::NoKernel)) => { },
    r => panic!("unexpected {:?}", r),
  }

  let foreign = CodeObject::new("gfx906")
    .with_kernel("a", "fill_u32", 12)
    .serialize().unwrap();
  match d.load_program(&foreign) {
    Err(Error::Load(LoadError::Executable(HsaError::IncompatibleArguments))) => { },
    r => panic!("unexpected {:?}", r),
  }

  let unknown = CodeObject::new(isa)
    .with_kernel("a", "no_such_routine", 12)
    .serialize().unwrap();
  assert!(d.load_program(&unknown).is_err());

  assert_eq!(ctx.live_kernel_objects(), 0);
  // failed loads don't use up handles.
  assert_eq!(load(&mut d, &vector_add_program()), ProgramHandle(0));
}

#[test]
fn queue_lifecycle() {
  let ctx = ApiContext::new();
  let agent = catalog::select_device(&ctx, 0).unwrap();
  let signals = ctx.live_signals();

  let mut queue = CommandQueue::new(&agent, None).unwrap();
  assert_eq!(queue.size(), agent.queue_size().unwrap().end);
  assert_eq!(queue.state(), QueueState::Uninitialized);
  assert!(queue.queue().is_err());

  queue.create().unwrap();
  assert_eq!(queue.state(), QueueState::Active);
  assert_eq!(queue.signal().unwrap().load_relaxed(), 1);
  let first = queue.queue().unwrap().id();
  // creating an active queue changes nothing.
  queue.create().unwrap();
  assert_eq!(queue.queue().unwrap().id(), first);

  queue.recreate().unwrap();
  assert_eq!(queue.state(), QueueState::Active);
  assert_ne!(queue.queue().unwrap().id(), first);

  queue.destroy().unwrap();
  assert_eq!(queue.state(), QueueState::Destroyed);
  match queue.signal() {
    Err(Error::QueueDestroyed) => { },
    r => panic!("unexpected {:?}", r),
  }
  assert!(eventually(|| ctx.live_signals() == signals ));

  queue.create().unwrap();
  assert_eq!(queue.state(), QueueState::Active);
  drop(queue);
  assert!(eventually(|| ctx.live_signals() == signals ));
}

#[test]
fn queue_create_failures_tear_down() {
  let ctx = ApiContext::new();
  let agent = catalog::select_device(&ctx, 0).unwrap();
  let signals = ctx.live_signals();

  let mut queue = CommandQueue::new(&agent, Some(16)).unwrap();
  ctx.faults().fail_signal_creates(1);
  match queue.create() {
    Err(Error::QueueCreate(HsaError::OutOfResources)) => { },
    r => panic!("unexpected {:?}", r),
  }
  assert_eq!(queue.state(), QueueState::Uninitialized);
  // the queue made before the signal failed is gone again.
  assert!(eventually(|| ctx.live_signals() == signals ));

  let mut bad = CommandQueue::new(&agent, Some(3)).unwrap();
  match bad.create() {
    Err(Error::QueueCreate(HsaError::InvalidQueueCreation)) => { },
    r => panic!("unexpected {:?}", r),
  }

  queue.create().unwrap();
  assert_eq!(queue.state(), QueueState::Active);
}

#[test]
fn config_from_env() {
  let _guard = ENV_LOCK.lock();
  env::set_var(DEVICE_ENV, "1");
  env::set_var(TIMEOUT_ENV, " 250 ");
  env::set_var(POLL_ENV, "50");
  let config = DispatcherConfig::from_env();
  env::remove_var(DEVICE_ENV);
  env::remove_var(TIMEOUT_ENV);
  env::remove_var(POLL_ENV);

  let config = config.unwrap();
  assert_eq!(config.device_index, 1);
  assert_eq!(config.timeout, Duration::from_millis(250));
  assert_eq!(config.poll_interval, Duration::from_micros(50));
  assert_eq!(config.kernarg_initial_size, config::KERNARG_INITIAL_SIZE);

  assert_eq!(DispatcherConfig::from_env().unwrap(), DispatcherConfig::default());
}

#[test]
fn config_rejects_garbage_env() {
  let _guard = ENV_LOCK.lock();
  env::set_var(TIMEOUT_ENV, "soon");
  let config = DispatcherConfig::from_env();
  env::remove_var(TIMEOUT_ENV);
  match config {
    Err(Error::InvalidEnv { var, value, }) => {
      assert_eq!(var, TIMEOUT_ENV);
      assert_eq!(value, "soon");
    },
    r => panic!("unexpected {:?}", r),
  }
}

#[test]
fn prebuilt_binary_source() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("vector_add.co");
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let bytes = vector_add_program().build(&request(&d)).unwrap();
  fs::write(&path, &bytes).unwrap();

  let source = PrebuiltBinary(path);
  let mut workload = VectorAdd::with_source(64, Box::new(source));
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed());

  let missing = PrebuiltBinary(dir.path().join("missing.co"));
  match missing.build(&request(&d)) {
    Err(Error::Io(Some(_), _)) => { },
    r => panic!("unexpected {:?}", r),
  }
}

#[test]
fn build_command_gets_the_debug_buffer_address() {
  let dir = tempfile::tempdir().unwrap();
  let prebuilt = dir.path().join("prebuilt.co");
  let ctx = ApiContext::new();
  let d = dispatcher(&ctx);
  let bytes = vector_add_program().build(&request(&d)).unwrap();
  fs::write(&prebuilt, &bytes).unwrap();

  let addr_file = dir.path().join("addr");
  let command = format!("printf '%s %s' \"$ASM_DBG_BUF_ADDR\" {{isa}} > {} && cp {} {{output}}",
                        addr_file.display(), prebuilt.display());
  let source = BuildCommand::new(command, dir.path().join("out.co"));
  let request = BuildRequest {
    isa: "gfx-soft".into(),
    debug_buffer: Some(DevicePtr::from_addr(0x1234_5000)),
  };
  assert_eq!(source.build(&request).unwrap(), bytes);
  assert_eq!(fs::read_to_string(&addr_file).unwrap(), "0x12345000 gfx-soft");
  // only the child saw it.
  assert!(env::var_os(debug::DEBUG_BUFFER_ENV).is_none());

  let failing = BuildCommand::new("exit 3", dir.path().join("never.co"));
  match failing.build(&request) {
    Err(Error::Build { status: Some(3), .. }) => { },
    r => panic!("unexpected {:?}", r),
  }
}

#[test]
fn debug_buffer_is_drained_after_the_run() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("debug.bin");
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let allocations = ctx.live_allocations();

  let mut workload = VectorAdd::new(64);
  let options = RunOptions::new(TIMEOUT)
    .with_debug(512, &path);
  let report = run_workload(&mut d, &mut workload, &options).unwrap();
  assert!(report.passed());
  assert_eq!(report.debug_bytes, Some(512));

  let dump = fs::read(&path).unwrap();
  assert_eq!(dump.len(), 512);
  let ids: Vec<u32> = dump.chunks(4)
    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) )
    .collect();
  for (i, &id) in ids.iter().enumerate() {
    // the kernel traced 64 work-items; the rest stays zeroed.
    let expected = if i < 64 { i as u32 } else { 0 };
    assert_eq!(id, expected, "word {}", i);
  }
  assert_eq!(ctx.live_allocations(), allocations);
}

#[test]
fn failed_stage_still_cleans_up() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let allocations = ctx.live_allocations();

  // more than the host visible region holds.
  let mut workload = VectorAdd::new(1 << 30);
  match run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT)) {
    Err(Error::Stage(Stage::Setup, _)) => { },
    r => panic!("unexpected {:?}", r),
  }
  assert_eq!(ctx.live_allocations(), allocations);
  assert_eq!(ctx.live_kernel_objects(), 0);

  let mut workload = CopyRoundTrip::new(vec![]);
  match run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT)) {
    Err(Error::Stage(Stage::Setup, inner)) => {
      match *inner {
        Error::Hsa(HsaError::InvalidArgument) => { },
        e => panic!("unexpected {:?}", e),
      }
    },
    r => panic!("unexpected {:?}", r),
  }
}

#[test]
fn shutdown_releases_programs() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  load(&mut d, &vector_add_program());
  assert_eq!(ctx.live_kernel_objects(), 1);
  d.shutdown().unwrap();
  assert_eq!(ctx.live_kernel_objects(), 0);
  assert!(eventually(|| ctx.live_allocations() == 0 ));
}

#[test]
fn huge_grids_fail_the_dispatch_only() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let add = load(&mut d, &vector_add_program());
  let bufs: Vec<_> = (0..3).map(|_| d.allocate_host(256).unwrap() ).collect();
  let args = Kernargs::new()
    .ptr(bufs[0])
    .ptr(bufs[1])
    .ptr(bufs[2])
    .into_bytes();

  let grids = [
    ([1 << 16, 1 << 16, 1 << 16], HsaError::InvalidAllocation),
    ([u32::max_value(); 3], HsaError::Overflow),
  ];
  for &(grid, expected) in grids.iter() {
    let params = InvocationParams {
      workgroup_size: [1, 1, 1],
      grid_size: grid,
      kernargs: args.clone(),
      dynamic_group_segment_size: 0,
    };
    match d.dispatch(add, &params, TIMEOUT) {
      Err(Error::PacketFailed(err)) => assert_eq!(err, expected, "grid {:?}", grid),
      r => panic!("unexpected {:?}", r),
    }
    assert_eq!(d.queue_state(), QueueState::Active);
  }
  assert_eq!(d.stats().failed, 2);
  assert_eq!(d.stats().recoveries, 2);

  for ptr in bufs {
    d.free(ptr).unwrap();
  }
  let mut workload = VectorAdd::new(64);
  let report = run_workload(&mut d, &mut workload, &RunOptions::new(TIMEOUT))
    .unwrap();
  assert!(report.passed());
}

#[test]
fn short_kernargs_are_rejected() {
  let ctx = ApiContext::new();
  let mut d = dispatcher(&ctx);
  let add = load(&mut d, &vector_add_program());
  assert_eq!(d.program(add).unwrap().kernarg_segment_size(), 24);

  for &len in [0usize, 16, 23].iter() {
    let params = InvocationParams::new_1d(64, 64, vec![0; len]);
    match d.dispatch(add, &params, TIMEOUT) {
      Err(Error::Hsa(HsaError::InvalidArgument)) => { },
      r => panic!("unexpected {:?} for {} bytes", r, len),
    }
  }
  // rejected before anything was staged or published.
  assert_eq!(d.command_queue().queue().unwrap().load_write_index_relaxed(), 0);
  assert_eq!(d.stats(), DispatchStats::default());

  // more than declared is fine.
  let fill = load(&mut d, &BuiltinProgram::new("fill", "fill_u32", 12));
  let out = d.allocate_host(4).unwrap();
  let mut args = Kernargs::new()
    .ptr(out)
    .u32(3)
    .into_bytes();
  args.resize(64, 0);
  let params = InvocationParams::new_1d(1, 1, args);
  assert_eq!(d.dispatch(fill, &params, TIMEOUT).unwrap(), DispatchStatus::Completed);
}
