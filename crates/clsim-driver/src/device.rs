//! Device model interface consumed by the driver.
//!
//! The micro-architectural GPU model is an external collaborator. The
//! driver only maps a dispatch onto it when one is attached and unmaps it
//! at teardown; drain notifications flow the other way through
//! [`Driver::on_device_drained`](crate::driver::Driver::on_device_drained).

use tracing::{debug, info};

use crate::ndrange::{NdRange, NdRangeId};

/// Default number of work-groups a [`FunctionalDevice`] runs per step.
pub const DEFAULT_COMPUTE_UNITS: usize = 4;

/// A device the driver can map dispatches onto.
pub trait DeviceModel {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Map a freshly initialized dispatch onto the device.
    fn attach_ndrange(&mut self, ndrange: &NdRange);

    /// Unmap a dispatch during teardown.
    fn detach_ndrange(&mut self, id: NdRangeId);

    /// Dispatch currently mapped, if any.
    fn attached(&self) -> Option<NdRangeId>;

    /// Work-groups the device can start in one step.
    fn compute_units(&self) -> usize;
}

/// Functional-only device: no timing, fixed issue width.
///
/// Keeps a history of attach and detach events so harnesses can check
/// that every dispatch was mapped and unmapped exactly once.
#[derive(Debug, Clone)]
pub struct FunctionalDevice {
    compute_units: usize,
    attached: Option<NdRangeId>,
    history: Vec<DeviceEvent>,
}

/// Mapping change recorded by [`FunctionalDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(NdRangeId),
    Detached(NdRangeId),
}

impl FunctionalDevice {
    pub fn new(compute_units: usize) -> Self {
        Self {
            compute_units: compute_units.max(1),
            attached: None,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[DeviceEvent] {
        &self.history
    }
}

impl Default for FunctionalDevice {
    fn default() -> Self {
        Self::new(DEFAULT_COMPUTE_UNITS)
    }
}

impl DeviceModel for FunctionalDevice {
    fn name(&self) -> &str {
        "functional"
    }

    fn attach_ndrange(&mut self, ndrange: &NdRange) {
        info!(
            "device: mapped ND-Range {} ({} work-groups, {} SGPRs, {} VGPRs)",
            ndrange.id, ndrange.total_groups, ndrange.num_sgpr_used, ndrange.num_vgpr_used
        );
        self.attached = Some(ndrange.id);
        self.history.push(DeviceEvent::Attached(ndrange.id));
    }

    fn detach_ndrange(&mut self, id: NdRangeId) {
        debug!("device: unmapped ND-Range {}", id);
        if self.attached == Some(id) {
            self.attached = None;
        }
        self.history.push(DeviceEvent::Detached(id));
    }

    fn attached(&self) -> Option<NdRangeId> {
        self.attached
    }

    fn compute_units(&self) -> usize {
        self.compute_units
    }
}
