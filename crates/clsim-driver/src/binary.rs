//! Compiled-kernel metadata consumed by the driver.
//!
//! Parsing a program blob is the job of an external collaborator behind
//! [`BinaryLoader`]. The driver only needs, per kernel: the argument
//! list, register usage, ABI user elements and the instruction segment.
//! [`JsonBinaryLoader`] reads a self-describing JSON container carrying
//! exactly that.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum number of user elements a kernel may declare.
pub const MAX_USER_ELEMENTS: usize = 16;

/// Errors produced while decoding a program binary.
#[derive(Debug, thiserror::Error)]
pub enum BinaryError {
    #[error("malformed binary: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("kernel '{kernel}': {count} user elements exceed the limit of {MAX_USER_ELEMENTS}")]
    TooManyUserElements { kernel: String, count: usize },

    #[error("kernel '{kernel}': value argument '{arg}' has zero size")]
    ZeroSizedValue { kernel: String, arg: String },

    #[error("program contains no kernels")]
    Empty,
}

/// Memory scope of a pointer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerScope {
    /// Global buffer bound through the UAV table.
    Uav,
    /// Work-group local memory carved out at dispatch time.
    Local,
}

/// Declared kind of one kernel argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArgKindMeta {
    Value {
        size: u32,
        #[serde(default = "default_cb1")]
        constant_buffer: u32,
        constant_offset: u32,
    },
    Pointer {
        scope: PointerScope,
        #[serde(default = "default_cb1")]
        constant_buffer: u32,
        constant_offset: u32,
        #[serde(default)]
        uav_index: u32,
    },
    Image,
    Sampler,
}

fn default_cb1() -> u32 {
    1
}

/// One argument as described by the kernel metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgMetadata {
    pub name: String,
    #[serde(flatten)]
    pub kind: ArgKindMeta,
}

/// ABI binding descriptor copied into every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserElement {
    pub data_class: u32,
    pub api_slot: u32,
    pub start_user_reg: u32,
    pub user_reg_count: u32,
}

/// Everything the driver needs to know about one kernel entry point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelMetadata {
    #[serde(default)]
    pub args: Vec<ArgMetadata>,
    #[serde(default)]
    pub mem_size_local: u32,
    #[serde(default)]
    pub num_sgpr_used: u32,
    #[serde(default)]
    pub num_vgpr_used: u32,
    /// First scalar register receiving the work-group id.
    #[serde(default)]
    pub wg_id_sgpr: u32,
    #[serde(default)]
    pub user_elements: Vec<UserElement>,
    /// Instruction segment (`.text`).
    #[serde(default)]
    pub text: Vec<u8>,
}

/// Parsed program: kernel metadata indexed by entry name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgramBinary {
    pub kernels: BTreeMap<String, KernelMetadata>,
}

impl ProgramBinary {
    pub fn kernel(&self, name: &str) -> Option<&KernelMetadata> {
        self.kernels.get(name)
    }

    /// Structural checks shared by every loader.
    pub fn validate(&self) -> Result<(), BinaryError> {
        if self.kernels.is_empty() {
            return Err(BinaryError::Empty);
        }
        for (name, kernel) in &self.kernels {
            if kernel.user_elements.len() > MAX_USER_ELEMENTS {
                return Err(BinaryError::TooManyUserElements {
                    kernel: name.clone(),
                    count: kernel.user_elements.len(),
                });
            }
            for arg in &kernel.args {
                if let ArgKindMeta::Value { size: 0, .. } = arg.kind {
                    return Err(BinaryError::ZeroSizedValue {
                        kernel: name.clone(),
                        arg: arg.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// External collaborator that decodes program blobs.
pub trait BinaryLoader {
    fn load(&self, bytes: &[u8]) -> Result<ProgramBinary, BinaryError>;
}

/// Loader for the JSON program container.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBinaryLoader;

impl BinaryLoader for JsonBinaryLoader {
    fn load(&self, bytes: &[u8]) -> Result<ProgramBinary, BinaryError> {
        let program: ProgramBinary = serde_json::from_slice(bytes)?;
        program.validate()?;
        Ok(program)
    }
}

impl ProgramBinary {
    /// Encode as the JSON container understood by [`JsonBinaryLoader`].
    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Plain data with string keys: serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
