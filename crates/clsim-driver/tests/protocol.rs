//! End-to-end tests of the guest/driver/device protocol.
//!
//! Scenarios drive the driver either through its typed entry points, to
//! control exactly when the device drains, or through the ABI and the
//! simulation loop, the way a guest runtime would.

use clsim_driver::binary::{ArgKindMeta, ArgMetadata, KernelMetadata, PointerScope};
use clsim_driver::{
    AbiCall, CallScript, DrainSignal, Driver, DriverConfig, DriverError, FinishOutcome,
    FunctionalDevice, Geometry, GuestMemory, KernelId, PagedMemory, ProgramBinary, Registers,
    Simulation,
};

fn uav_arg(name: &str, constant_offset: u32, uav_index: u32) -> ArgMetadata {
    ArgMetadata {
        name: name.into(),
        kind: ArgKindMeta::Pointer {
            scope: PointerScope::Uav,
            constant_buffer: 1,
            constant_offset,
            uav_index,
        },
    }
}

fn program_binary() -> Vec<u8> {
    let a = ArgMetadata {
        name: "a".into(),
        kind: ArgKindMeta::Value {
            size: 4,
            constant_buffer: 1,
            constant_offset: 32,
        },
    };
    let saxpy = KernelMetadata {
        args: vec![uav_arg("x", 0, 10), uav_arg("y", 16, 11), a],
        num_sgpr_used: 16,
        num_vgpr_used: 8,
        text: vec![0x7e, 0x00, 0x02, 0x00, 0xbf, 0x81, 0x00, 0x00],
        ..Default::default()
    };
    let mut program = ProgramBinary::default();
    program.kernels.insert("saxpy".into(), saxpy);
    program.to_json_bytes()
}

fn bound_kernel(config: DriverConfig) -> (Driver, KernelId) {
    let mut driver = Driver::new(config);
    let program = driver.program_create();
    let bytes = program_binary();
    driver.program_set_binary(program, bytes).unwrap();
    let kernel = driver.kernel_create(program, "saxpy").unwrap();
    let x = Some(driver.mem_alloc(4096));
    let y = Some(driver.mem_alloc(4096));
    driver.kernel_set_arg_pointer(kernel, 0, x, 4096).unwrap();
    driver.kernel_set_arg_pointer(kernel, 1, y, 4096).unwrap();
    let a = 2.0f32.to_le_bytes().to_vec();
    driver.kernel_set_arg_value(kernel, 2, a).unwrap();
    (driver, kernel)
}

fn geometry_64x64() -> Geometry {
    Geometry::new(2, &[0, 0], &[64, 64], &[16, 16]).unwrap()
}

#[test]
fn submit_then_finish_before_drain_tears_down_once() {
    let config = DriverConfig {
        work_group_buffer_size: 32,
        ..Default::default()
    };
    let (mut driver, kernel) = bound_kernel(config);
    driver.ndrange_initialize(kernel, geometry_64x64()).unwrap();
    driver.pass_mem_objs(0, 0).unwrap();

    // Context 0 submits the whole grid and parks.
    driver.send_work_groups(0, 0, 16).unwrap();
    assert_eq!(driver.free_slots(), 32 - 16);
    assert!(driver.is_parked(0));

    // Context 1 finishes before the device drained anything.
    assert_eq!(driver.finish(1).unwrap(), FinishOutcome::Suspended);
    assert!(driver.is_parked(1));
    assert!(driver.state().wait_for_completion);

    // The device picks up everything; running is still busy.
    let started = driver.take_waiting(usize::MAX);
    assert_eq!(started, (0..16).collect::<Vec<_>>());
    let signal = driver.on_device_drained();
    assert_eq!(signal, Some(DrainSignal::ReadyForWork));
    assert_eq!(driver.process_events().unwrap(), vec![0]);
    assert!(driver.is_parked(1));
    assert_eq!(driver.teardown_count(), 0);

    for id in started {
        driver.retire(id).unwrap();
    }
    let signal = driver.on_device_drained();
    assert_eq!(signal, Some(DrainSignal::Complete));
    assert_eq!(driver.process_events().unwrap(), vec![1]);
    assert_eq!(driver.teardown_count(), 1);
    assert!(driver.state().is_idle());

    // Further drains and polls do not tear down again.
    assert_eq!(driver.on_device_drained(), None);
    driver.process_events().unwrap();
    assert_eq!(driver.teardown_count(), 1);
    assert!(driver.state().is_idle());
}

#[test]
fn over_capacity_submit_fails_without_touching_waiting() {
    let (mut driver, kernel) = bound_kernel(DriverConfig::default());
    let geometry = Geometry::new(1, &[0], &[1024], &[16]).unwrap();
    driver.ndrange_initialize(kernel, geometry).unwrap();
    driver.send_work_groups(0, 0, 10).unwrap();
    driver.take_waiting(0);
    driver.on_device_drained();
    driver.process_events().unwrap();

    let before: Vec<u32> = driver.queues().waiting().collect();
    let msg = driver.send_work_groups(0, 10, 7).unwrap_err().to_string();
    assert!(msg.contains("only 6 buffer entries are free"), "{msg}");
    assert_eq!(driver.queues().waiting().collect::<Vec<_>>(), before);
    assert!(!driver.is_parked(0));
}

#[test]
fn finish_with_nothing_active_is_fatal() {
    let (mut driver, kernel) = bound_kernel(DriverConfig::default());
    driver.ndrange_initialize(kernel, geometry_64x64()).unwrap();
    assert_eq!(driver.finish(0).unwrap(), FinishOutcome::TornDown);
    assert!(driver.state().is_idle());
    assert!(driver.finish(0).is_err());
}

#[test]
fn host_device_round_trip_through_abi() {
    let mut driver = Driver::new(DriverConfig::default());
    let mut guest = PagedMemory::new();
    let payload: Vec<u8> = (0..=255u8).collect();
    guest.write(0x1_0000, &payload).unwrap();

    let mut call = |code: AbiCall, args: &[u32], guest: &mut PagedMemory| {
        let mut regs = Registers::for_call(code, args);
        driver.abi_call(0, &mut regs, guest).unwrap()
    };
    let src = call(AbiCall::MemAlloc, &[256], &mut guest);
    let dst = call(AbiCall::MemAlloc, &[256], &mut guest);
    call(AbiCall::MemWrite, &[src, 0x1_0000, 256], &mut guest);
    call(AbiCall::MemCopy, &[dst, src, 256], &mut guest);
    call(AbiCall::MemRead, &[0x2_0000, dst, 256], &mut guest);

    assert_eq!(guest.read(0x2_0000, 256).unwrap(), payload);
}

#[test]
fn device_access_past_top_is_fatal() {
    let mut driver = Driver::new(DriverConfig::default());
    let mut guest = PagedMemory::new();
    let tail = driver.mem_alloc(64) + 32;
    let err = driver.mem_read(&mut guest, 0x100, tail, 64).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("access to unallocated device memory"), "{msg}");
}

#[test]
fn headless_dispatch_parks_forever() {
    let (driver, _) = bound_kernel(DriverConfig::default());
    let mut sim = Simulation::new(driver);
    let script = CallScript::new(vec![
        Registers::for_call(AbiCall::NdRangeInitialize, &[0, 1, 0x100, 0x110, 0x120]),
        Registers::for_call(AbiCall::NdRangeSendWorkGroups, &[0, 4]),
    ]);
    sim.spawn(Box::new(script));
    sim.memory_mut().write_u32(0x100, 0).unwrap();
    sim.memory_mut().write_u32(0x110, 256).unwrap();
    sim.memory_mut().write_u32(0x120, 64).unwrap();

    let report = sim.run(50).unwrap();
    assert!(report.hit_tick_limit);
    assert_eq!(report.parked_contexts, vec![0]);
    assert_eq!(report.work_groups_executed, 0);
}

/// Registers for the full guest runtime sequence of one saxpy dispatch.
fn saxpy_script(binary_len: u32) -> Vec<Registers> {
    use AbiCall::*;
    vec![
        Registers::for_call(Init, &[0x40]),
        Registers::for_call(ProgramCreate, &[]),
        Registers::for_call(ProgramSetBinary, &[0, 0x1_0000, binary_len]),
        Registers::for_call(KernelCreate, &[0, 0x800]),
        Registers::for_call(MemAlloc, &[1024]),
        Registers::for_call(MemAlloc, &[1024]),
        Registers::for_call(KernelSetArgPointer, &[0, 0, 0, 1024]),
        Registers::for_call(KernelSetArgPointer, &[0, 1, 1024, 1024]),
        Registers::for_call(KernelSetArgValue, &[0, 2, 0x900, 4]),
        Registers::for_call(NdRangeInitialize, &[0, 1, 0x100, 0x110, 0x120]),
        Registers::for_call(NdRangePassMemObjs, &[0, 0]),
        Registers::for_call(NdRangeGetNumBufferEntries, &[0x200]),
        Registers::for_call(NdRangeSendWorkGroups, &[0, 16]),
        Registers::for_call(NdRangeGetNumBufferEntries, &[0x200]),
        Registers::for_call(NdRangeSendWorkGroups, &[16, 16]),
        Registers::for_call(NdRangeFinish, &[]),
    ]
}

#[test]
fn scripted_runtime_completes_on_functional_device() {
    let config = DriverConfig {
        trace_calls: true,
        ..Default::default()
    };
    let mut driver = Driver::new(config);
    driver.attach_device(Box::new(FunctionalDevice::new(4)));
    let mut sim = Simulation::new(driver);

    let binary = program_binary();
    let mem = sim.memory_mut();
    mem.write(0x1_0000, &binary).unwrap();
    mem.write(0x800, b"saxpy\0").unwrap();
    mem.write(0x900, &3.0f32.to_le_bytes()).unwrap();
    mem.write_u32(0x100, 0).unwrap();
    mem.write_u32(0x110, 2048).unwrap();
    mem.write_u32(0x120, 64).unwrap();

    sim.spawn(Box::new(CallScript::new(saxpy_script(binary.len() as u32))));
    let report = sim.run(1_000).unwrap();

    assert!(!report.hit_tick_limit);
    assert!(report.parked_contexts.is_empty());
    assert_eq!(report.work_groups_executed, 32);
    assert_eq!(report.dispatches_completed, 1);
    assert!(sim.driver().state().is_idle());
    assert!(sim.driver().queues().is_drained());

    assert_eq!(sim.memory().read_u32(0x40).unwrap(), 1);
    assert_eq!(sim.memory().read_u32(0x44).unwrap(), 1559);

    let trace = sim.driver().trace().unwrap();
    assert_eq!(trace.len(), 16);
    let sends: Vec<bool> = trace
        .records()
        .iter()
        .filter(|r| r.code == AbiCall::NdRangeSendWorkGroups.code())
        .map(|r| r.suspended)
        .collect();
    assert_eq!(sends, vec![true, true]);
}

#[test]
fn second_initialize_without_teardown_is_fatal() {
    let (mut driver, kernel) = bound_kernel(DriverConfig::default());
    let geometry = geometry_64x64();
    driver.ndrange_initialize(kernel, geometry).unwrap();
    let err = driver.ndrange_initialize(kernel, geometry).unwrap_err();
    let DriverError::ProtocolViolation { call, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(*call, "si_ndrange_initialize");
}
