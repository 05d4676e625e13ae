//! Program and kernel objects.
//!
//! Both live in append-only arenas: the id of an object is its insertion
//! index, ids are never recycled and nothing is ever deleted.

use tracing::debug;

use crate::binary::{ArgKindMeta, BinaryLoader, KernelMetadata, PointerScope, ProgramBinary};
use crate::error::{DriverError, Result};

pub type ProgramId = u32;
pub type KernelId = u32;

/// A compiled program. The binary is set once and never changes.
#[derive(Debug)]
pub struct Program {
    pub id: ProgramId,
    binary: Option<Vec<u8>>,
    parsed: Option<ProgramBinary>,
}

impl Program {
    pub fn binary(&self) -> Option<&[u8]> {
        self.binary.as_deref()
    }

    pub fn parsed(&self) -> Option<&ProgramBinary> {
        self.parsed.as_ref()
    }
}

/// Binding state of one kernel argument, one case per declared kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgBinding {
    /// Plain data copied into a constant buffer at dispatch time.
    Value {
        size: u32,
        constant_buffer: u32,
        constant_offset: u32,
        value: Option<Vec<u8>>,
    },
    /// Global buffer (`device_ptr` set) or local allocation (`None`).
    Pointer {
        scope: PointerScope,
        size: u32,
        device_ptr: Option<u32>,
        constant_buffer: u32,
        constant_offset: u32,
        uav_index: u32,
    },
    Image,
    Sampler,
}

impl ArgBinding {
    fn from_meta(meta: &ArgKindMeta) -> Self {
        match *meta {
            ArgKindMeta::Value {
                size,
                constant_buffer,
                constant_offset,
            } => Self::Value {
                size,
                constant_buffer,
                constant_offset,
                value: None,
            },
            ArgKindMeta::Pointer {
                scope,
                constant_buffer,
                constant_offset,
                uav_index,
            } => Self::Pointer {
                scope,
                size: 0,
                device_ptr: None,
                constant_buffer,
                constant_offset,
                uav_index,
            },
            ArgKindMeta::Image => Self::Image,
            ArgKindMeta::Sampler => Self::Sampler,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Value { .. } => "value",
            Self::Pointer { .. } => "pointer",
            Self::Image => "image",
            Self::Sampler => "sampler",
        }
    }
}

/// A kernel argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    pub index: u32,
    pub name: String,
    /// Whether the guest has bound this argument.
    pub set: bool,
    pub binding: ArgBinding,
}

impl KernelArg {
    /// Declared size in bytes (bound size for pointers).
    pub fn size(&self) -> u32 {
        match self.binding {
            ArgBinding::Value { size, .. } | ArgBinding::Pointer { size, .. } => size,
            ArgBinding::Image | ArgBinding::Sampler => 0,
        }
    }

    /// Currently bound value bytes, if this is a bound value argument.
    pub fn value_bytes(&self) -> Option<&[u8]> {
        match &self.binding {
            ArgBinding::Value { value, .. } => value.as_deref(),
            _ => None,
        }
    }
}

/// A kernel instantiated from a program entry point.
#[derive(Debug)]
pub struct Kernel {
    pub id: KernelId,
    pub program_id: ProgramId,
    pub name: String,
    /// Fixed at creation from the binary metadata.
    args: Vec<KernelArg>,
    pub meta: KernelMetadata,
}

impl Kernel {
    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    pub fn arg(&self, index: u32) -> Option<&KernelArg> {
        self.args.get(index as usize)
    }

    fn arg_mut(&mut self, call: &'static str, index: u32) -> Result<&mut KernelArg> {
        if index as usize >= self.args.len() {
            return Err(self.invalid_index(call, index));
        }
        Ok(&mut self.args[index as usize])
    }

    fn invalid_index(&self, call: &'static str, index: u32) -> DriverError {
        let count = self.args.len();
        let reason = format!("invalid argument {index} (kernel has {count} arguments)");
        DriverError::protocol(call, reason)
    }

    /// Replace the bytes of a value argument. The declared size must match.
    pub fn set_arg_value(&mut self, index: u32, bytes: Vec<u8>) -> Result<()> {
        const CALL: &str = "si_kernel_set_arg_value";
        let arg = self.arg_mut(CALL, index)?;
        let ArgBinding::Value { size, value, .. } = &mut arg.binding else {
            return Err(wrong_kind(CALL, index));
        };
        let found = bytes.len();
        if found != *size as usize {
            return Err(DriverError::protocol(
                CALL,
                format!("argument {index}: size mismatch ({size} expected, {found} found)"),
            ));
        }
        // The previous buffer, if any, is dropped here.
        *value = Some(bytes);
        arg.set = true;
        Ok(())
    }

    /// Size a value argument must be bound with.
    pub fn value_arg_size(&self, call: &'static str, index: u32) -> Result<u32> {
        let Some(arg) = self.arg(index) else {
            return Err(self.invalid_index(call, index));
        };
        match arg.binding {
            ArgBinding::Value { size, .. } => Ok(size),
            _ => Err(wrong_kind(call, index)),
        }
    }

    /// Bind a pointer argument. A device pointer of `None` requests `size`
    /// bytes of local memory at dispatch time.
    pub fn set_arg_pointer(
        &mut self,
        index: u32,
        device_ptr: Option<u32>,
        size: u32,
    ) -> Result<()> {
        const CALL: &str = "si_kernel_set_arg_pointer";
        let arg = self.arg_mut(CALL, index)?;
        match &mut arg.binding {
            ArgBinding::Pointer {
                size: bound_size,
                device_ptr: bound_ptr,
                ..
            } => {
                *bound_size = size;
                *bound_ptr = device_ptr;
            }
            _ => return Err(wrong_kind(CALL, index)),
        }
        arg.set = true;
        Ok(())
    }
}

fn wrong_kind(call: &'static str, index: u32) -> DriverError {
    DriverError::protocol(call, format!("invalid argument {index} type"))
}

/// Append-only tables of programs and kernels.
#[derive(Debug, Default)]
pub struct Registry {
    programs: Vec<Program>,
    kernels: Vec<Kernel>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn create_program(&mut self) -> ProgramId {
        let id = self.programs.len() as ProgramId;
        let program = Program {
            id,
            binary: None,
            parsed: None,
        };
        self.programs.push(program);
        debug!("new program ID = {}", id);
        id
    }

    pub fn program(&self, call: &'static str, id: ProgramId) -> Result<&Program> {
        self.programs
            .get(id as usize)
            .ok_or_else(|| DriverError::protocol(call, format!("invalid program ID ({id})")))
    }

    /// Associate a binary with a program; the blob is parsed by `loader`.
    pub fn set_binary(
        &mut self,
        id: ProgramId,
        bytes: Vec<u8>,
        loader: &dyn BinaryLoader,
    ) -> Result<()> {
        const CALL: &str = "si_program_set_binary";
        let program = self
            .programs
            .get_mut(id as usize)
            .ok_or_else(|| DriverError::protocol(CALL, format!("invalid program ID ({id})")))?;
        if program.binary.is_some() {
            return Err(DriverError::protocol(CALL, format!("program {id} already has a binary")));
        }
        let parsed = loader.load(&bytes)?;
        let (size, count) = (bytes.len(), parsed.kernels.len());
        debug!("program {id} binary: {size} bytes, {count} kernels");
        program.binary = Some(bytes);
        program.parsed = Some(parsed);
        Ok(())
    }

    /// Instantiate kernel `name` from a program whose binary is set.
    pub fn create_kernel(&mut self, program_id: ProgramId, name: &str) -> Result<KernelId> {
        const CALL: &str = "si_kernel_create";
        let program = self.program(CALL, program_id)?;
        let Some(parsed) = program.parsed.as_ref() else {
            let reason = format!("program {program_id} has no binary");
            return Err(DriverError::protocol(CALL, reason));
        };
        let Some(meta) = parsed.kernel(name).cloned() else {
            let reason = format!("invalid kernel name '{name}' in program {program_id}");
            return Err(DriverError::protocol(CALL, reason));
        };

        let args = meta
            .args
            .iter()
            .enumerate()
            .map(|(index, a)| KernelArg {
                index: index as u32,
                name: a.name.clone(),
                set: false,
                binding: ArgBinding::from_meta(&a.kind),
            })
            .collect();

        let id = self.kernels.len() as KernelId;
        let kernel = Kernel {
            id,
            program_id,
            name: name.to_string(),
            args,
            meta,
        };
        self.kernels.push(kernel);
        debug!("new kernel ID = {}", id);
        Ok(id)
    }

    pub fn kernel(&self, call: &'static str, id: KernelId) -> Result<&Kernel> {
        self.kernels
            .get(id as usize)
            .ok_or_else(|| DriverError::protocol(call, format!("invalid kernel ID ({id})")))
    }

    pub fn kernel_mut(&mut self, call: &'static str, id: KernelId) -> Result<&mut Kernel> {
        self.kernels
            .get_mut(id as usize)
            .ok_or_else(|| DriverError::protocol(call, format!("invalid kernel ID ({id})")))
    }
}
