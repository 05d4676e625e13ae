//! The driver handle.
//!
//! One [`Driver`] is one simulated driver instance. It owns the device
//! heap, the program and kernel arenas, the single active-dispatch record,
//! the work-group queues and the parked guest contexts, and every entry
//! point takes it explicitly. Guest-facing operations are exposed as typed
//! methods; [`Driver::abi_call`] decodes the guest registers and routes to
//! them through the ABI table.

use std::fmt;

use tracing::{debug, info, warn};

use crate::abi::{self, AbiCall, CallFrame, Registers};
use crate::binary::{BinaryLoader, JsonBinaryLoader};
use crate::config::DriverConfig;
use crate::device::DeviceModel;
use crate::device_memory::DeviceMemory;
use crate::error::{DriverError, Result};
use crate::memory::GuestMemory;
use crate::ndrange::{Geometry, NdRange, NdRangeId, NdRangeStage, ResourceTables};
use crate::queue::{WorkGroupId, WorkGroupQueues};
use crate::registry::{KernelId, ProgramId, Registry};
use crate::scheduler::{self, ContextId, Scheduler, WakePredicate};
use crate::state::DriverState;
use crate::trace::CallTrace;

pub const VERSION_MAJOR: i32 = 1;
pub const VERSION_MINOR: i32 = 1559;

/// Result of [`Driver::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Both queues were already empty; the dispatch was torn down in-line.
    TornDown,
    /// The caller is parked until the dispatch completes.
    Suspended,
}

/// Flag raised by [`Driver::on_device_drained`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSignal {
    ReadyForWork,
    Complete,
}

/// One simulated compute-offload driver instance.
pub struct Driver {
    config: DriverConfig,
    memory: DeviceMemory,
    registry: Registry,
    state: DriverState,
    queues: WorkGroupQueues,
    scheduler: Scheduler<Driver>,
    loader: Box<dyn BinaryLoader>,
    device: Option<Box<dyn DeviceModel>>,
    /// Next dispatch id. Never reset.
    ndrange_count: NdRangeId,
    teardowns: u64,
    trace: Option<CallTrace>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = self.device.as_ref().map(|d| d.name().to_string());
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("heap_top", &self.memory.top())
            .field("programs", &self.registry.program_count())
            .field("kernels", &self.registry.kernel_count())
            .field("state", &self.state)
            .field("queues", &self.queues)
            .field("scheduler", &self.scheduler)
            .field("device", &device)
            .field("ndrange_count", &self.ndrange_count)
            .finish()
    }
}

impl Driver {
    /// Headless driver with the JSON binary loader.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_loader(config, Box::new(JsonBinaryLoader))
    }

    pub fn with_loader(config: DriverConfig, loader: Box<dyn BinaryLoader>) -> Self {
        let trace = config.trace_calls.then(CallTrace::new);
        Self {
            queues: WorkGroupQueues::new(config.work_group_buffer_size),
            config,
            memory: DeviceMemory::new(),
            registry: Registry::new(),
            state: DriverState::default(),
            scheduler: Scheduler::new(),
            loader,
            device: None,
            ndrange_count: 0,
            teardowns: 0,
            trace,
        }
    }

    /// Attach a device model. Dispatches created afterwards are mapped on it.
    pub fn attach_device(&mut self, device: Box<dyn DeviceModel>) {
        info!("attached device '{}'", device.name());
        self.device = Some(device);
    }

    pub fn device(&self) -> Option<&dyn DeviceModel> {
        self.device.as_deref()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn queues(&self) -> &WorkGroupQueues {
        &self.queues
    }

    pub fn scheduler(&self) -> &Scheduler<Driver> {
        &self.scheduler
    }

    /// Number of dispatches torn down so far.
    pub fn teardown_count(&self) -> u64 {
        self.teardowns
    }

    pub fn trace(&self) -> Option<&CallTrace> {
        self.trace.as_ref()
    }

    pub fn is_parked(&self, context: ContextId) -> bool {
        self.scheduler.is_parked(context)
    }

    // ---- version and memory -------------------------------------------------

    /// Write the driver version (two little-endian `i32`) to `version_ptr`.
    pub fn init(&self, guest: &mut dyn GuestMemory, version_ptr: u32) -> Result<()> {
        let mut bytes = VERSION_MAJOR.to_le_bytes().to_vec();
        bytes.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        guest.write(version_ptr, &bytes)?;
        debug!("driver version {}.{}", VERSION_MAJOR, VERSION_MINOR);
        Ok(())
    }

    pub fn mem_alloc(&mut self, size: u32) -> u32 {
        self.memory.allocate(size)
    }

    pub fn mem_read(
        &self,
        guest: &mut dyn GuestMemory,
        host_ptr: u32,
        device_ptr: u32,
        size: u32,
    ) -> Result<()> {
        self.memory.copy_to_host(guest, host_ptr, device_ptr, size)
    }

    pub fn mem_write(
        &mut self,
        guest: &dyn GuestMemory,
        device_ptr: u32,
        host_ptr: u32,
        size: u32,
    ) -> Result<()> {
        self.memory
            .copy_from_host(guest, device_ptr, host_ptr, size)
    }

    pub fn mem_copy(&mut self, dest_ptr: u32, src_ptr: u32, size: u32) -> Result<()> {
        self.memory.copy(dest_ptr, src_ptr, size)
    }

    /// Ignored: device memory is never reclaimed. Returns `device_ptr`.
    pub fn mem_free(&mut self, device_ptr: u32) -> u32 {
        self.memory.free(device_ptr)
    }

    // ---- programs and kernels -----------------------------------------------

    pub fn program_create(&mut self) -> ProgramId {
        self.registry.create_program()
    }

    pub fn program_set_binary(&mut self, program_id: ProgramId, bytes: Vec<u8>) -> Result<()> {
        self.registry
            .set_binary(program_id, bytes, self.loader.as_ref())
    }

    pub fn kernel_create(&mut self, program_id: ProgramId, name: &str) -> Result<KernelId> {
        self.registry.create_kernel(program_id, name)
    }

    pub fn kernel_set_arg_value(
        &mut self,
        kernel_id: KernelId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.registry
            .kernel_mut("si_kernel_set_arg_value", kernel_id)?
            .set_arg_value(index, bytes)
    }

    /// Bind a pointer argument; `None` reserves `size` bytes of local memory.
    pub fn kernel_set_arg_pointer(
        &mut self,
        kernel_id: KernelId,
        index: u32,
        device_ptr: Option<u32>,
        size: u32,
    ) -> Result<()> {
        self.registry
            .kernel_mut("si_kernel_set_arg_pointer", kernel_id)?
            .set_arg_pointer(index, device_ptr, size)
    }

    pub fn kernel_set_arg_image(&mut self, kernel_id: KernelId, _index: u32) -> Result<()> {
        const CALL: &str = "si_kernel_set_arg_image";
        self.registry.kernel(CALL, kernel_id)?;
        Err(DriverError::unimplemented(CALL, "image arguments"))
    }

    pub fn kernel_set_arg_sampler(&mut self, kernel_id: KernelId, _index: u32) -> Result<()> {
        const CALL: &str = "si_kernel_set_arg_sampler";
        self.registry.kernel(CALL, kernel_id)?;
        Err(DriverError::unimplemented(CALL, "sampler arguments"))
    }

    // ---- dispatch -----------------------------------------------------------

    /// Create the active dispatch for `kernel_id` and map it on the device.
    pub fn ndrange_initialize(
        &mut self,
        kernel_id: KernelId,
        geometry: Geometry,
    ) -> Result<NdRangeId> {
        const CALL: &str = "si_ndrange_initialize";
        if self.config.fused_device {
            return Err(DriverError::unimplemented(CALL, "fused device mode"));
        }
        if let Some(active) = self.state.ndrange() {
            return Err(DriverError::protocol(
                CALL,
                format!("ND-Range {} is still active", active.id),
            ));
        }
        let kernel = self.registry.kernel(CALL, kernel_id)?;
        let ndrange = NdRange::new(self.ndrange_count, kernel, geometry)?;
        self.ndrange_count += 1;

        if let Some(device) = self.device.as_mut() {
            device.attach_ndrange(&ndrange);
        } else {
            debug!("no device attached; ND-Range {} stays unmapped", ndrange.id);
        }
        let id = ndrange.id;
        self.state.kernel = Some(kernel_id);
        self.state.ndrange = Some(ndrange);
        Ok(id)
    }

    /// Free entries in the waiting work-group queue.
    pub fn free_slots(&self) -> usize {
        self.queues.free_slots()
    }

    /// Write [`free_slots`](Self::free_slots) to guest memory as a `u32`.
    pub fn get_num_buffer_entries(&self, guest: &mut dyn GuestMemory, host_ptr: u32) -> Result<()> {
        let free = u32::try_from(self.free_slots()).unwrap_or(u32::MAX);
        guest.write_u32(host_ptr, free)
    }

    /// Enqueue `count` work-groups and park `context` until the device asks
    /// for more work.
    pub fn send_work_groups(
        &mut self,
        context: ContextId,
        start: WorkGroupId,
        count: u32,
    ) -> Result<()> {
        const CALL: &str = "si_ndrange_send_work_groups";
        self.ensure_runnable(CALL, context)?;
        let ndrange = self.active_ndrange(CALL)?;
        let end = u64::from(start) + u64::from(count);
        if end > u64::from(ndrange.total_groups) {
            return Err(DriverError::protocol(
                CALL,
                format!(
                    "work-groups {start}..{end} outside ND-Range {} ({} groups)",
                    ndrange.id, ndrange.total_groups
                ),
            ));
        }
        if self.state.wait_for_completion {
            return Err(DriverError::protocol(CALL, "work-groups sent after finish"));
        }

        self.queues.push_range(start, count)?;
        let last = end.saturating_sub(1);
        debug!("receiving work groups {start} through {last}");
        self.state.ready_for_work = false;
        let ready: WakePredicate<Driver> = Box::new(|d: &Driver| d.state.ready_for_work);
        self.scheduler.park(context, CALL, ready, None)
    }

    /// Signal that no more work-groups follow. Tears the dispatch down at
    /// once if the device is idle; otherwise parks `context` until complete.
    pub fn finish(&mut self, context: ContextId) -> Result<FinishOutcome> {
        const CALL: &str = "si_ndrange_finish";
        self.ensure_runnable(CALL, context)?;
        self.active_ndrange(CALL)?;
        if self.state.wait_for_completion {
            return Err(DriverError::protocol(CALL, "finish already pending"));
        }

        self.state.wait_for_completion = true;
        if self.queues.is_drained() {
            self.teardown()?;
            return Ok(FinishOutcome::TornDown);
        }
        self.scheduler.park(
            context,
            CALL,
            Box::new(|d: &Driver| d.state.complete),
            Some(Box::new(|d: &mut Driver| d.teardown())),
        )?;
        Ok(FinishOutcome::Suspended)
    }

    /// Build resource tables and constant buffers and write the arguments.
    ///
    /// `tables_ptr` and `constant_buffers_ptr` are only used in fused mode.
    pub fn pass_mem_objs(&mut self, tables_ptr: u32, constant_buffers_ptr: u32) -> Result<()> {
        const CALL: &str = "si_ndrange_pass_mem_objs";
        let ndrange = self
            .state
            .ndrange
            .as_mut()
            .ok_or_else(|| DriverError::protocol(CALL, "no active ND-Range"))?;
        if ndrange.stage != NdRangeStage::Initialized {
            return Err(DriverError::protocol(
                CALL,
                format!("memory objects already passed for ND-Range {}", ndrange.id),
            ));
        }
        let kernel = self.registry.kernel(CALL, ndrange.kernel_id)?;
        NdRange::check_args(kernel, &self.memory)?;

        if self.config.fused_device {
            ndrange.set_tables(ResourceTables::chained(tables_ptr, constant_buffers_ptr));
        } else {
            ndrange.create_tables(&mut self.memory);
            ndrange.create_constant_buffers(&mut self.memory);
        }
        ndrange.setup_constant_buffers(&mut self.memory)?;
        ndrange.setup_args(kernel, &mut self.memory)?;
        debug!(
            "ND-Range {} tables: {:?}, local memory top {}",
            ndrange.id, ndrange.tables, ndrange.local_mem_top
        );
        Ok(())
    }

    // ---- device side --------------------------------------------------------

    /// Move up to `max` waiting work-groups to the running set.
    pub fn take_waiting(&mut self, max: usize) -> Vec<WorkGroupId> {
        self.queues.take_waiting(max)
    }

    /// A running work-group finished executing.
    pub fn retire(&mut self, id: WorkGroupId) -> Result<()> {
        self.queues.retire(id)
    }

    /// Device drain notification. Raises `complete` when the guest is
    /// waiting and both queues are empty, `ready_for_work` otherwise, and
    /// schedules a predicate pass for the next tick.
    ///
    /// Without an active dispatch nothing is raised and `None` is returned.
    pub fn on_device_drained(&mut self) -> Option<DrainSignal> {
        if !self.state.is_active() {
            debug!("drain ignored: no active ND-Range");
            return None;
        }
        let signal = if self.state.wait_for_completion && self.queues.is_drained() {
            debug!("ND-Range is complete");
            self.state.complete = true;
            DrainSignal::Complete
        } else {
            debug!("device is ready for more work");
            self.state.ready_for_work = true;
            DrainSignal::ReadyForWork
        };
        self.scheduler.schedule_events();
        Some(signal)
    }

    /// Poll every parked context once. Returns the contexts that resumed.
    pub fn process_events(&mut self) -> Result<Vec<ContextId>> {
        scheduler::process_events(self, scheduler_of)
    }

    // ---- ABI ----------------------------------------------------------------

    /// Execute the ABI call selected by `ebx` on behalf of `context` and
    /// store its result in `eax`.
    pub fn abi_call(
        &mut self,
        context: ContextId,
        regs: &mut Registers,
        guest: &mut dyn GuestMemory,
    ) -> Result<u32> {
        let code = regs.ebx;
        let Some(entry) = abi::lookup(code) else {
            return Err(DriverError::protocol("abi_call", format!("invalid call code ({code})")));
        };
        let call: AbiCall = entry.call;
        debug!("context {} ABI call #{} {}", context, code, call.name());

        let outcome = match self.ensure_runnable(call.name(), context) {
            Ok(()) => {
                let mut frame = CallFrame {
                    context,
                    regs: &*regs,
                    guest,
                };
                (entry.handler)(self, &mut frame)
            }
            Err(e) => Err(e),
        };

        if let Some(trace) = self.trace.as_mut() {
            let suspended = self.scheduler.is_parked(context);
            let record = match &outcome {
                Ok(value) => Ok((*value, suspended)),
                Err(e) => Err(e.to_string()),
            };
            trace.record(code, call.name(), context, record);
        }

        let value = outcome?;
        regs.eax = value;
        Ok(value)
    }

    // ---- internals ----------------------------------------------------------

    fn ensure_runnable(&self, call: &'static str, context: ContextId) -> Result<()> {
        if self.scheduler.is_parked(context) {
            return Err(DriverError::protocol(call, format!("context {context} is suspended")));
        }
        Ok(())
    }

    fn active_ndrange(&self, call: &'static str) -> Result<&NdRange> {
        self.state
            .ndrange()
            .ok_or_else(|| DriverError::protocol(call, "no active ND-Range"))
    }

    /// Retire the active dispatch and reset the driver state in one step.
    fn teardown(&mut self) -> Result<()> {
        let Some(ndrange) = self.state.reset() else {
            return Err(DriverError::protocol("si_ndrange_finish", "no ND-Range to tear down"));
        };
        if let Some(device) = self.device.as_mut() {
            device.detach_ndrange(ndrange.id);
        }
        self.teardowns += 1;
        let (id, groups) = (ndrange.id, ndrange.total_groups);
        info!("ND-Range {id} finished ({groups} work-groups)");
        if !self.queues.is_drained() {
            let waiting = self.queues.waiting_len();
            let running = self.queues.running_len();
            warn!("ND-Range {id} torn down with {waiting} waiting, {running} running work-groups");
        }
        Ok(())
    }
}

fn scheduler_of(driver: &mut Driver) -> &mut Scheduler<Driver> {
    &mut driver.scheduler
}
