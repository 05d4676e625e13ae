//! Cooperative suspension of guest contexts.
//!
//! A guest call that has to wait for the device parks its context with a
//! predicate and an optional wake action. The outer event loop polls every
//! parked predicate, in parking order, on each event tick; a context whose
//! predicate holds runs its wake action and becomes runnable again. There
//! are no threads, locks or timeouts: a predicate that never becomes true
//! keeps its context parked forever.

use std::fmt;

use tracing::debug;

use crate::error::{DriverError, Result};

/// Identifier of a simulated guest execution context.
pub type ContextId = u32;

/// Condition under which a parked context may resume.
pub type WakePredicate<S> = Box<dyn Fn(&S) -> bool>;

/// Work performed on the shared state when a context resumes.
pub type WakeAction<S> = Box<dyn FnOnce(&mut S) -> Result<()>>;

/// A guest context blocked inside a driver call.
pub struct ParkedTask<S> {
    context: ContextId,
    reason: &'static str,
    predicate: WakePredicate<S>,
    on_wake: Option<WakeAction<S>>,
}

impl<S> ParkedTask<S> {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Evaluate the wake predicate against the current state.
    pub fn poll(&self, state: &S) -> bool {
        (self.predicate)(state)
    }
}

impl<S> fmt::Debug for ParkedTask<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkedTask")
            .field("context", &self.context)
            .field("reason", &self.reason)
            .field("has_wake_action", &self.on_wake.is_some())
            .finish()
    }
}

/// Set of parked contexts over shared state `S`.
pub struct Scheduler<S> {
    parked: Vec<ParkedTask<S>>,
    events_scheduled: bool,
}

impl<S> Default for Scheduler<S> {
    fn default() -> Self {
        Self {
            parked: Vec::new(),
            events_scheduled: false,
        }
    }
}

impl<S> fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("parked", &self.parked)
            .field("events_scheduled", &self.events_scheduled)
            .finish()
    }
}

impl<S> Scheduler<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `context` until `predicate` holds.
    pub fn park(
        &mut self,
        context: ContextId,
        reason: &'static str,
        predicate: WakePredicate<S>,
        on_wake: Option<WakeAction<S>>,
    ) -> Result<()> {
        if self.is_parked(context) {
            return Err(DriverError::protocol(
                reason,
                format!("context {context} is already suspended"),
            ));
        }
        debug!("context {} suspended in {}", context, reason);
        let task = ParkedTask {
            context,
            reason,
            predicate,
            on_wake,
        };
        self.parked.push(task);
        Ok(())
    }

    pub fn is_parked(&self, context: ContextId) -> bool {
        self.parked.iter().any(|t| t.context == context)
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    pub fn parked_contexts(&self) -> Vec<ContextId> {
        self.parked.iter().map(|t| t.context).collect()
    }

    pub fn parked(&self) -> &[ParkedTask<S>] {
        &self.parked
    }

    /// Ask the event loop to re-evaluate parked predicates.
    pub fn schedule_events(&mut self) {
        self.events_scheduled = true;
    }

    pub fn events_scheduled(&self) -> bool {
        self.events_scheduled
    }
}

/// Poll every parked task of the scheduler reachable through `sched`.
///
/// Tasks are visited in parking order. Each predicate sees the state left
/// by the wake actions of earlier tasks in the same tick. Returns the
/// contexts that resumed.
pub fn process_events<S>(
    state: &mut S,
    sched: fn(&mut S) -> &mut Scheduler<S>,
) -> Result<Vec<ContextId>> {
    let tasks = std::mem::take(&mut sched(state).parked);
    sched(state).events_scheduled = false;

    let mut resumed = Vec::new();
    let mut still_parked = Vec::with_capacity(tasks.len());
    let mut pending = tasks.into_iter();
    let mut failure = None;

    for task in pending.by_ref() {
        if !task.poll(state) {
            still_parked.push(task);
            continue;
        }
        debug!("context {} resumed from {}", task.context, task.reason);
        resumed.push(task.context);
        if let Some(on_wake) = task.on_wake
            && let Err(e) = on_wake(state)
        {
            failure = Some(e);
            break;
        }
    }

    still_parked.extend(pending);
    let scheduler = sched(state);
    let parked_during_tick = std::mem::replace(&mut scheduler.parked, still_parked);
    scheduler.parked.extend(parked_during_tick);

    match failure {
        Some(e) => Err(e),
        None => Ok(resumed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Flags {
        go: bool,
        wakes: u32,
        sched: Scheduler<Flags>,
    }

    fn sched(f: &mut Flags) -> &mut Scheduler<Flags> {
        &mut f.sched
    }

    fn when_go() -> WakePredicate<Flags> {
        Box::new(|s: &Flags| s.go)
    }

    fn constant(ready: bool) -> WakePredicate<Flags> {
        Box::new(move |_: &Flags| ready)
    }

    #[test]
    fn parked_task_waits_for_predicate() {
        let mut f = Flags::default();
        f.sched.park(1, "wait", when_go(), None).unwrap();
        assert!(process_events(&mut f, sched).unwrap().is_empty());
        assert!(f.sched.is_parked(1));

        f.go = true;
        assert_eq!(process_events(&mut f, sched).unwrap(), vec![1]);
        assert_eq!(f.sched.parked_count(), 0);
    }

    #[test]
    fn wake_action_runs_once() {
        let mut f = Flags::default();
        let count: WakeAction<Flags> = Box::new(|s: &mut Flags| {
            s.wakes += 1;
            Ok(())
        });
        f.sched.park(7, "wait", when_go(), Some(count)).unwrap();
        f.go = true;
        process_events(&mut f, sched).unwrap();
        process_events(&mut f, sched).unwrap();
        assert_eq!(f.wakes, 1);
    }

    #[test]
    fn tasks_are_polled_in_parking_order_against_updated_state() {
        let mut f = Flags::default();
        // Context 1 resets the flag when it wakes; context 2 waits on the same flag.
        let reset: WakeAction<Flags> = Box::new(|s: &mut Flags| {
            s.go = false;
            Ok(())
        });
        f.sched.park(1, "first", when_go(), Some(reset)).unwrap();
        f.sched.park(2, "second", when_go(), None).unwrap();
        f.go = true;
        assert_eq!(process_events(&mut f, sched).unwrap(), vec![1]);
        assert_eq!(f.sched.parked_contexts(), vec![2]);
    }

    #[test]
    fn double_park_is_a_violation() {
        let mut f = Flags::default();
        f.sched.park(3, "wait", constant(false), None).unwrap();
        let err = f.sched.park(3, "wait", constant(false), None).unwrap_err();
        assert!(err.to_string().contains("already suspended"));
    }

    #[test]
    fn failing_wake_action_keeps_remaining_tasks() {
        let mut f = Flags::default();
        let fail: WakeAction<Flags> = Box::new(|_: &mut Flags| {
            Err(DriverError::protocol("boom", "bad"))
        });
        f.sched.park(1, "boom", constant(true), Some(fail)).unwrap();
        f.sched.park(2, "later", constant(true), None).unwrap();
        assert!(process_events(&mut f, sched).is_err());
        assert_eq!(f.sched.parked_contexts(), vec![2]);
    }

    #[test]
    fn schedule_flag_cleared_by_processing() {
        let mut f = Flags::default();
        f.sched.schedule_events();
        assert!(f.sched.events_scheduled());
        process_events(&mut f, sched).unwrap();
        assert!(!f.sched.events_scheduled());
    }
}
