//! Compute-offload driver for a simulated GPU.
//!
//! A simulated guest CPU reaches the driver through a numbered ABI
//! ([`abi`]). The driver manages a bump-allocated device heap
//! ([`device_memory`]), program and kernel objects ([`registry`]), builds
//! one dispatch at a time ([`ndrange`]) and feeds its work-groups to the
//! device through a bounded queue ([`queue`]). Guest calls that must wait
//! for the device park their context in the [`scheduler`] until a drain
//! notification makes their predicate true.
//!
//! ```no_run
//! use clsim_driver::{Driver, DriverConfig, FunctionalDevice, Simulation};
//!
//! let mut driver = Driver::new(DriverConfig::default());
//! driver.attach_device(Box::new(FunctionalDevice::default()));
//! let mut sim = Simulation::new(driver);
//! // sim.spawn(Box::new(my_guest_program));
//! let report = sim.run(10_000)?;
//! println!("{} work-groups executed", report.work_groups_executed);
//! # Ok::<(), clsim_driver::DriverError>(())
//! ```

pub mod abi;
pub mod binary;
pub mod config;
pub mod device;
pub mod device_memory;
pub mod driver;
pub mod error;
pub mod memory;
pub mod ndrange;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod state;
pub mod trace;

pub use abi::{ABI_TABLE, AbiCall, Registers};
pub use binary::{BinaryError, BinaryLoader, JsonBinaryLoader, ProgramBinary};
pub use config::{ConfigError, DriverConfig};
pub use device::{DeviceModel, FunctionalDevice};
pub use device_memory::DeviceMemory;
pub use driver::{DrainSignal, Driver, FinishOutcome};
pub use error::{DriverError, Result};
pub use memory::{GuestMemory, PagedMemory};
pub use ndrange::{Geometry, NdRange, NdRangeId};
pub use queue::WorkGroupQueues;
pub use registry::{ArgBinding, Kernel, KernelId, Program, ProgramId};
pub use scheduler::ContextId;
pub use sim::{CallScript, GuestProgram, SimReport, Simulation};
pub use trace::{CallRecord, CallTrace};
