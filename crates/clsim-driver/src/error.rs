//! Error types for the offload driver.
//!
//! Every variant represents a broken guest/driver contract or a feature
//! that is deliberately absent. None of them is recoverable: the outermost
//! simulation loop terminates with the formatted diagnostic.

use thiserror::Error;

use crate::binary::BinaryError;

/// Errors raised by driver entry points.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The guest runtime broke the call protocol (bad selector, unknown id,
    /// kind/size mismatch, capacity exceeded, duplicate active dispatch...).
    #[error("{call}: {reason}")]
    ProtocolViolation { call: &'static str, reason: String },

    /// A feature that is callable but intentionally left out.
    #[error("{call}: {feature} not implemented")]
    Unimplemented {
        call: &'static str,
        feature: &'static str,
    },

    /// A device access reached past the top of the device heap.
    #[error(
        "{call}: access to unallocated device memory \
         (addr=0x{addr:x}, size={size}, top=0x{top:x})"
    )]
    DeviceMemoryFault {
        call: &'static str,
        addr: u32,
        size: u32,
        top: u32,
    },

    /// The guest-memory collaborator rejected an access.
    #[error("guest memory fault at 0x{addr:x} ({size} bytes)")]
    GuestMemoryFault { addr: u32, size: usize },

    /// The binary metadata collaborator rejected a program blob.
    #[error("program binary: {0}")]
    Binary(#[from] BinaryError),
}

impl DriverError {
    /// Shorthand for a [`DriverError::ProtocolViolation`].
    pub fn protocol(call: &'static str, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            call,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DriverError::Unimplemented`].
    pub fn unimplemented(call: &'static str, feature: &'static str) -> Self {
        Self::Unimplemented { call, feature }
    }

    /// All driver errors terminate the simulation.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violation_message_names_the_call() {
        let err = DriverError::protocol("si_kernel_create", "invalid program ID (7)");
        assert_eq!(err.to_string(), "si_kernel_create: invalid program ID (7)");
        assert!(err.is_fatal());
    }

    #[test]
    fn device_fault_reports_range_in_hex() {
        let err = DriverError::DeviceMemoryFault {
            call: "si_mem_read",
            addr: 0x100,
            size: 32,
            top: 0x110,
        };
        let msg = err.to_string();
        assert!(msg.contains("access to unallocated device memory"), "{msg}");
        assert!(msg.contains("addr=0x100"), "{msg}");
        assert!(msg.contains("top=0x110"), "{msg}");
    }

    #[test]
    fn unimplemented_is_fatal_too() {
        let err = DriverError::unimplemented("si_kernel_set_arg_image", "image arguments");
        let expected = "si_kernel_set_arg_image: image arguments not implemented";
        assert_eq!(err.to_string(), expected);
        assert!(err.is_fatal());
    }
}
