//! Per-driver record of the single active dispatch.

use crate::ndrange::NdRange;
use crate::registry::KernelId;

/// Active kernel, active dispatch and the three synchronization flags.
///
/// At most one dispatch is active at a time; all guest-side mutation of
/// this record is serialized by that invariant.
#[derive(Debug, Default)]
pub struct DriverState {
    pub(crate) kernel: Option<KernelId>,
    pub(crate) ndrange: Option<NdRange>,
    /// The device wants more work-groups.
    pub ready_for_work: bool,
    /// The guest called `finish` and waits for the dispatch to drain.
    pub wait_for_completion: bool,
    /// Every submitted work-group has been executed after `finish`.
    pub complete: bool,
}

impl DriverState {
    pub fn kernel(&self) -> Option<KernelId> {
        self.kernel
    }

    pub fn ndrange(&self) -> Option<&NdRange> {
        self.ndrange.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.ndrange.is_some()
    }

    /// True when no dispatch is active and every flag is clear.
    pub fn is_idle(&self) -> bool {
        self.kernel.is_none()
            && self.ndrange.is_none()
            && !self.ready_for_work
            && !self.wait_for_completion
            && !self.complete
    }

    /// Clear everything in one step, handing back the dispatch being retired.
    pub(crate) fn reset(&mut self) -> Option<NdRange> {
        let ndrange = self.ndrange.take();
        self.kernel = None;
        self.ready_for_work = false;
        self.wait_for_completion = false;
        self.complete = false;
        ndrange
    }
}
