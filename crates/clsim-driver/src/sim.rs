//! Outer discrete-event loop.
//!
//! Each tick runs three phases in a fixed order:
//!
//! 1. every runnable guest context issues at most one ABI call;
//! 2. the device retires the work-groups it started on the previous tick,
//!    starts up to `compute_units` waiting ones and, once the waiting
//!    queue is empty, reports a drain to the driver;
//! 3. if a drain scheduled events, parked predicates are polled.
//!
//! With no device attached nothing ever drains, so a context parked in
//! `send_work_groups` or `finish` stays parked until the tick limit.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::abi::Registers;
use crate::driver::Driver;
use crate::error::Result;
use crate::memory::{GuestMemory, PagedMemory};
use crate::queue::WorkGroupId;
use crate::scheduler::ContextId;

/// Instruction stream of one guest context, reduced to its ABI calls.
pub trait GuestProgram {
    /// Registers for the next ABI call, or `None` when the program exited.
    ///
    /// `last_result` holds `eax` from the previous call (`None` on the
    /// first call).
    fn next_call(
        &mut self,
        memory: &mut dyn GuestMemory,
        last_result: Option<u32>,
    ) -> Result<Option<Registers>>;
}

/// Guest program replaying a fixed list of calls.
#[derive(Debug, Clone)]
pub struct CallScript {
    calls: std::vec::IntoIter<Registers>,
}

impl CallScript {
    pub fn new(calls: Vec<Registers>) -> Self {
        Self {
            calls: calls.into_iter(),
        }
    }
}

impl GuestProgram for CallScript {
    fn next_call(
        &mut self,
        _memory: &mut dyn GuestMemory,
        _last_result: Option<u32>,
    ) -> Result<Option<Registers>> {
        Ok(self.calls.next())
    }
}

struct GuestContext {
    id: ContextId,
    program: Box<dyn GuestProgram>,
    last_result: Option<u32>,
    exited: bool,
}

/// Summary of a [`Simulation::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimReport {
    pub ticks: u64,
    pub abi_calls: u64,
    pub work_groups_executed: u64,
    pub dispatches_completed: u64,
    /// Contexts still parked when the run stopped.
    pub parked_contexts: Vec<ContextId>,
    /// The tick limit was reached before every context exited.
    pub hit_tick_limit: bool,
}

/// Driver, guest memory, guest contexts and device issue state.
pub struct Simulation {
    driver: Driver,
    memory: PagedMemory,
    contexts: Vec<GuestContext>,
    in_flight: Vec<WorkGroupId>,
    tick: u64,
    abi_calls: u64,
    work_groups_executed: u64,
}

impl Simulation {
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            memory: PagedMemory::new(),
            contexts: Vec::new(),
            in_flight: Vec::new(),
            tick: 0,
            abi_calls: 0,
            work_groups_executed: 0,
        }
    }

    /// Add a guest context; contexts are numbered from 0 in spawn order.
    pub fn spawn(&mut self, program: Box<dyn GuestProgram>) -> ContextId {
        let id = self.contexts.len() as ContextId;
        let ctx = GuestContext {
            id,
            program,
            last_result: None,
            exited: false,
        };
        self.contexts.push(ctx);
        debug!("spawned guest context {id}");
        id
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn memory(&self) -> &PagedMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PagedMemory {
        &mut self.memory
    }

    pub fn all_exited(&self) -> bool {
        self.contexts.iter().all(|c| c.exited)
    }

    /// Advance the simulation by one tick.
    pub fn tick(&mut self) -> Result<()> {
        self.tick += 1;
        self.guest_phase()?;
        self.device_phase()?;
        if self.driver.scheduler().events_scheduled() {
            let resumed = self.driver.process_events()?;
            if !resumed.is_empty() {
                debug!("tick {}: resumed contexts {:?}", self.tick, resumed);
            }
        }
        Ok(())
    }

    /// Tick until every context exits or `max_ticks` ticks have run.
    pub fn run(&mut self, max_ticks: u64) -> Result<SimReport> {
        let start = self.tick;
        while !self.all_exited() && self.tick - start < max_ticks {
            self.tick()?;
        }
        let report = self.report();
        if report.hit_tick_limit {
            warn!(
                "stopped after {} ticks with contexts {:?} still parked",
                report.ticks, report.parked_contexts
            );
        } else {
            info!(
                "simulation finished: {} ticks, {} ABI calls, {} work-groups",
                report.ticks, report.abi_calls, report.work_groups_executed
            );
        }
        Ok(report)
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            ticks: self.tick,
            abi_calls: self.abi_calls,
            work_groups_executed: self.work_groups_executed,
            dispatches_completed: self.driver.teardown_count(),
            parked_contexts: self.driver.scheduler().parked_contexts(),
            hit_tick_limit: !self.all_exited(),
        }
    }

    fn guest_phase(&mut self) -> Result<()> {
        for ctx in self.contexts.iter_mut().filter(|c| !c.exited) {
            if self.driver.is_parked(ctx.id) {
                continue;
            }
            let Some(mut regs) = ctx.program.next_call(&mut self.memory, ctx.last_result)? else {
                debug!("context {} exited", ctx.id);
                ctx.exited = true;
                continue;
            };
            self.abi_calls += 1;
            ctx.last_result = Some(self.driver.abi_call(ctx.id, &mut regs, &mut self.memory)?);
        }
        Ok(())
    }

    fn device_phase(&mut self) -> Result<()> {
        let Some(width) = self.driver.device().map(|d| d.compute_units()) else {
            return Ok(());
        };
        for id in std::mem::take(&mut self.in_flight) {
            self.driver.retire(id)?;
            self.work_groups_executed += 1;
        }
        if !self.driver.state().is_active() {
            return Ok(());
        }
        self.in_flight = self.driver.take_waiting(width);
        if self.driver.queues().waiting_len() == 0 {
            self.driver.on_device_drained();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiCall;
    use crate::config::DriverConfig;

    #[test]
    fn script_runs_to_completion() {
        let mut sim = Simulation::new(Driver::new(DriverConfig::default()));
        let script = CallScript::new(vec![
            Registers::for_call(AbiCall::MemAlloc, &[16]),
            Registers::for_call(AbiCall::ProgramCreate, &[]),
        ]);
        sim.spawn(Box::new(script));
        let report = sim.run(10).unwrap();
        assert!(!report.hit_tick_limit);
        assert_eq!(report.abi_calls, 2);
        assert_eq!(report.ticks, 3);
    }

    #[test]
    fn fatal_call_stops_the_run() {
        let mut sim = Simulation::new(Driver::new(DriverConfig::default()));
        let script = CallScript::new(vec![Registers::default()]);
        sim.spawn(Box::new(script));
        assert!(sim.run(10).is_err());
    }
}
