//! Guest-side runtime replayed by `clsim run`.
//!
//! Plays the part of the OpenCL runtime library inside the guest: it stages
//! the program binary, kernel name and geometry in guest memory, creates the
//! program and kernel, binds every argument, builds the dispatch and then
//! feeds work-groups in batches sized by the free buffer entries the driver
//! reports, before calling `finish`.

use clsim_driver::binary::{ArgKindMeta, PointerScope};
use clsim_driver::{AbiCall, DriverError, GuestMemory, GuestProgram, Registers, Result};
use tracing::debug;

/// Fixed guest addresses used by the runtime.
pub mod layout {
    pub const VERSION: u32 = 0x0000_1000;
    pub const KERNEL_NAME: u32 = 0x0000_2000;
    pub const GLOBAL_OFFSET: u32 = 0x0000_3000;
    pub const GLOBAL_SIZE: u32 = 0x0000_3010;
    pub const LOCAL_SIZE: u32 = 0x0000_3020;
    pub const BUFFER_ENTRIES: u32 = 0x0000_3100;
    pub const ARG_VALUE: u32 = 0x0000_4000;
    pub const BINARY: u32 = 0x0010_0000;
}

/// What the runtime launches and how it sizes buffers.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub kernel: String,
    pub global_size: Vec<u32>,
    pub local_size: Vec<u32>,
    /// Bytes allocated for every global buffer argument.
    pub buffer_size: u32,
    /// Bytes requested for every local memory argument.
    pub local_arg_size: u32,
}

impl LaunchSpec {
    pub fn work_dim(&self) -> u32 {
        self.global_size.len() as u32
    }

    /// Work-groups in the grid; zero when a local size is zero.
    pub fn total_groups(&self) -> u32 {
        self.global_size
            .iter()
            .zip(&self.local_size)
            .map(|(g, l)| g.checked_div(*l).unwrap_or(0))
            .product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    ProgramCreate,
    SetBinary,
    KernelCreate,
    BindArg(usize),
    NdRangeInitialize,
    PassMemObjs,
    QueryEntries,
    SendWorkGroups,
    Finish,
    Exit,
}

/// Result of the previous call the runtime still has to pick up.
#[derive(Debug, Clone, Copy)]
enum Pending {
    Program,
    Kernel,
    Buffer(usize),
}

/// Guest runtime state machine.
#[derive(Debug)]
pub struct GuestRuntime {
    binary: Vec<u8>,
    args: Vec<ArgKindMeta>,
    launch: LaunchSpec,
    step: Step,
    pending: Option<Pending>,
    program: u32,
    kernel: u32,
    /// Device buffers allocated for pointer arguments, by index.
    buffers: Vec<Option<u32>>,
    next_group: u32,
}

impl GuestRuntime {
    /// `args` lists the declared argument kinds of `launch.kernel`.
    pub fn new(binary: Vec<u8>, args: Vec<ArgKindMeta>, launch: LaunchSpec) -> Self {
        let buffers = vec![None; args.len()];
        Self {
            binary,
            args,
            launch,
            step: Step::Init,
            pending: None,
            program: 0,
            kernel: 0,
            buffers,
            next_group: 0,
        }
    }

    fn stage(&self, memory: &mut dyn GuestMemory) -> Result<()> {
        memory.write(layout::BINARY, &self.binary)?;
        let mut name = self.launch.kernel.as_bytes().to_vec();
        name.push(0);
        memory.write(layout::KERNEL_NAME, &name)?;
        let dims = self.launch.global_size.len();
        write_words(memory, layout::GLOBAL_OFFSET, &vec![0; dims])?;
        write_words(memory, layout::GLOBAL_SIZE, &self.launch.global_size)?;
        write_words(memory, layout::LOCAL_SIZE, &self.launch.local_size)?;
        Ok(())
    }

    fn collect(&mut self, last_result: Option<u32>) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let value = last_result
            .ok_or_else(|| DriverError::protocol("runtime", "missing result of previous call"))?;
        match pending {
            Pending::Program => self.program = value,
            Pending::Kernel => self.kernel = value,
            Pending::Buffer(index) => self.buffers[index] = Some(value),
        }
        Ok(())
    }

    fn bind_arg(&mut self, memory: &mut dyn GuestMemory, index: usize) -> Result<Registers> {
        use AbiCall::*;
        let i = index as u32;
        let next = if index + 1 < self.args.len() {
            Step::BindArg(index + 1)
        } else {
            Step::NdRangeInitialize
        };
        let regs = match self.args[index] {
            ArgKindMeta::Value { size, .. } => {
                memory.write(layout::ARG_VALUE, &vec![0; size as usize])?;
                let args = [self.kernel, i, layout::ARG_VALUE, size];
                Registers::for_call(KernelSetArgValue, &args)
            }
            ArgKindMeta::Pointer { scope, .. } => match (scope, self.buffers[index]) {
                (PointerScope::Local, _) => {
                    let args = [self.kernel, i, 0, self.launch.local_arg_size];
                    Registers::for_call(KernelSetArgPointer, &args)
                }
                (PointerScope::Uav, None) => {
                    // Allocate first, then come back to bind.
                    self.pending = Some(Pending::Buffer(index));
                    return Ok(Registers::for_call(MemAlloc, &[self.launch.buffer_size]));
                }
                (PointerScope::Uav, Some(ptr)) => {
                    let args = [self.kernel, i, ptr, self.launch.buffer_size];
                    Registers::for_call(KernelSetArgPointer, &args)
                }
            },
            ArgKindMeta::Image => Registers::for_call(KernelSetArgImage, &[self.kernel, i]),
            ArgKindMeta::Sampler => Registers::for_call(KernelSetArgSampler, &[self.kernel, i]),
        };
        self.step = next;
        Ok(regs)
    }
}

impl GuestProgram for GuestRuntime {
    fn next_call(
        &mut self,
        memory: &mut dyn GuestMemory,
        last_result: Option<u32>,
    ) -> Result<Option<Registers>> {
        use AbiCall::*;
        self.collect(last_result)?;
        let total = self.launch.total_groups();

        let regs = match self.step {
            Step::Init => {
                self.stage(memory)?;
                self.step = Step::ProgramCreate;
                Registers::for_call(Init, &[layout::VERSION])
            }
            Step::ProgramCreate => {
                self.pending = Some(Pending::Program);
                self.step = Step::SetBinary;
                Registers::for_call(ProgramCreate, &[])
            }
            Step::SetBinary => {
                self.step = Step::KernelCreate;
                let len = u32::try_from(self.binary.len())
                    .map_err(|_| DriverError::protocol("runtime", "program binary too large"))?;
                Registers::for_call(ProgramSetBinary, &[self.program, layout::BINARY, len])
            }
            Step::KernelCreate => {
                self.pending = Some(Pending::Kernel);
                self.step = if self.args.is_empty() {
                    Step::NdRangeInitialize
                } else {
                    Step::BindArg(0)
                };
                Registers::for_call(KernelCreate, &[self.program, layout::KERNEL_NAME])
            }
            Step::BindArg(index) => self.bind_arg(memory, index)?,
            Step::NdRangeInitialize => {
                self.step = Step::PassMemObjs;
                Registers::for_call(
                    NdRangeInitialize,
                    &[
                        self.kernel,
                        self.launch.work_dim(),
                        layout::GLOBAL_OFFSET,
                        layout::GLOBAL_SIZE,
                        layout::LOCAL_SIZE,
                    ],
                )
            }
            Step::PassMemObjs => {
                self.step = if total == 0 {
                    Step::Finish
                } else {
                    Step::QueryEntries
                };
                Registers::for_call(NdRangePassMemObjs, &[0, 0])
            }
            Step::QueryEntries => {
                self.step = Step::SendWorkGroups;
                Registers::for_call(NdRangeGetNumBufferEntries, &[layout::BUFFER_ENTRIES])
            }
            Step::SendWorkGroups => {
                let free = memory.read_u32(layout::BUFFER_ENTRIES)?;
                let count = free.min(total - self.next_group);
                let start = self.next_group;
                self.next_group += count;
                let end = self.next_group;
                self.step = if end == total {
                    Step::Finish
                } else {
                    Step::QueryEntries
                };
                debug!("runtime: sending work-groups {start}..{end} of {total}");
                Registers::for_call(NdRangeSendWorkGroups, &[start, count])
            }
            Step::Finish => {
                self.step = Step::Exit;
                Registers::for_call(NdRangeFinish, &[])
            }
            Step::Exit => return Ok(None),
        };
        Ok(Some(regs))
    }
}

fn write_words(memory: &mut dyn GuestMemory, addr: u32, words: &[u32]) -> Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    memory.write(addr, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clsim_driver::PagedMemory;

    fn launch() -> LaunchSpec {
        LaunchSpec {
            kernel: "k".into(),
            global_size: vec![64, 64],
            local_size: vec![16, 16],
            buffer_size: 256,
            local_arg_size: 64,
        }
    }

    #[test]
    fn total_groups_multiplies_dimensions() {
        assert_eq!(launch().total_groups(), 16);
        let zero = LaunchSpec {
            local_size: vec![0, 16],
            ..launch()
        };
        assert_eq!(zero.total_groups(), 0);
    }

    #[test]
    fn uav_argument_allocates_before_binding() {
        let args = vec![ArgKindMeta::Pointer {
            scope: PointerScope::Uav,
            constant_buffer: 1,
            constant_offset: 0,
            uav_index: 10,
        }];
        let mut rt = GuestRuntime::new(b"{}".to_vec(), args, launch());
        let mut mem = PagedMemory::new();

        let codes: Vec<u32> = [None, Some(0), Some(7), Some(0), Some(3), Some(0x400)]
            .into_iter()
            .map(|result| rt.next_call(&mut mem, result).unwrap().unwrap().ebx)
            .collect();
        assert_eq!(
            codes,
            vec![
                AbiCall::Init.code(),
                AbiCall::ProgramCreate.code(),
                AbiCall::ProgramSetBinary.code(),
                AbiCall::KernelCreate.code(),
                AbiCall::MemAlloc.code(),
                AbiCall::KernelSetArgPointer.code(),
            ]
        );
        assert_eq!(rt.program, 7);
        assert_eq!(rt.kernel, 3);
        assert_eq!(rt.buffers, vec![Some(0x400)]);
    }

    #[test]
    fn stages_name_and_geometry() {
        let mut rt = GuestRuntime::new(Vec::new(), Vec::new(), launch());
        let mut mem = PagedMemory::new();
        rt.next_call(&mut mem, None).unwrap();
        assert_eq!(mem.read_string(layout::KERNEL_NAME, 16).unwrap(), b"k");
        assert_eq!(mem.read_u32(layout::GLOBAL_SIZE + 4).unwrap(), 64);
        assert_eq!(mem.read_u32(layout::LOCAL_SIZE).unwrap(), 16);
    }
}
