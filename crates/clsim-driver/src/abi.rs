//! Guest-visible ABI.
//!
//! The guest selects an operation with `ebx` and passes up to five
//! arguments in `ecx`, `edx`, `esi`, `edi` and `ebp`; the result comes back
//! in `eax`. Operation codes are fixed by [`ABI_TABLE`], indexed by
//! `code - 1`, independently of how the handlers are written.

use tracing::debug;

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::memory::GuestMemory;
use crate::ndrange::Geometry;
use crate::scheduler::ContextId;

/// Guest register file as seen by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

impl Registers {
    /// Registers for a call to `call` with `args` in argument order.
    pub fn for_call(call: AbiCall, args: &[u32]) -> Self {
        let mut regs = Self::default();
        regs.ebx = call.code();
        let slots = [
            &mut regs.ecx,
            &mut regs.edx,
            &mut regs.esi,
            &mut regs.edi,
            &mut regs.ebp,
        ];
        for (slot, value) in slots.into_iter().zip(args) {
            *slot = *value;
        }
        regs
    }
}

/// ABI operation codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiCall {
    Init = 1,
    MemAlloc = 2,
    MemRead = 3,
    MemWrite = 4,
    MemCopy = 5,
    MemFree = 6,
    ProgramCreate = 7,
    ProgramSetBinary = 8,
    KernelCreate = 9,
    KernelSetArgValue = 10,
    KernelSetArgPointer = 11,
    KernelSetArgImage = 12,
    KernelSetArgSampler = 13,
    NdRangeInitialize = 14,
    NdRangeGetNumBufferEntries = 15,
    NdRangeSendWorkGroups = 16,
    NdRangeFinish = 17,
    NdRangePassMemObjs = 18,
}

impl AbiCall {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        lookup(code).map(|entry| entry.call)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::MemAlloc => "si_mem_alloc",
            Self::MemRead => "si_mem_read",
            Self::MemWrite => "si_mem_write",
            Self::MemCopy => "si_mem_copy",
            Self::MemFree => "si_mem_free",
            Self::ProgramCreate => "si_program_create",
            Self::ProgramSetBinary => "si_program_set_binary",
            Self::KernelCreate => "si_kernel_create",
            Self::KernelSetArgValue => "si_kernel_set_arg_value",
            Self::KernelSetArgPointer => "si_kernel_set_arg_pointer",
            Self::KernelSetArgImage => "si_kernel_set_arg_image",
            Self::KernelSetArgSampler => "si_kernel_set_arg_sampler",
            Self::NdRangeInitialize => "si_ndrange_initialize",
            Self::NdRangeGetNumBufferEntries => "si_ndrange_get_num_buffer_entries",
            Self::NdRangeSendWorkGroups => "si_ndrange_send_work_groups",
            Self::NdRangeFinish => "si_ndrange_finish",
            Self::NdRangePassMemObjs => "si_ndrange_pass_mem_objs",
        }
    }
}

/// Everything a handler may touch besides the driver.
pub struct CallFrame<'a> {
    pub context: ContextId,
    pub regs: &'a Registers,
    pub guest: &'a mut dyn GuestMemory,
}

pub type Handler = fn(&mut Driver, &mut CallFrame<'_>) -> Result<u32>;

/// One row of the ABI table.
pub struct AbiEntry {
    pub call: AbiCall,
    pub handler: Handler,
}

const fn entry(call: AbiCall, handler: Handler) -> AbiEntry {
    AbiEntry { call, handler }
}

pub static ABI_TABLE: [AbiEntry; 18] = [
    entry(AbiCall::Init, init),
    entry(AbiCall::MemAlloc, mem_alloc),
    entry(AbiCall::MemRead, mem_read),
    entry(AbiCall::MemWrite, mem_write),
    entry(AbiCall::MemCopy, mem_copy),
    entry(AbiCall::MemFree, mem_free),
    entry(AbiCall::ProgramCreate, program_create),
    entry(AbiCall::ProgramSetBinary, program_set_binary),
    entry(AbiCall::KernelCreate, kernel_create),
    entry(AbiCall::KernelSetArgValue, kernel_set_arg_value),
    entry(AbiCall::KernelSetArgPointer, kernel_set_arg_pointer),
    entry(AbiCall::KernelSetArgImage, kernel_set_arg_image),
    entry(AbiCall::KernelSetArgSampler, kernel_set_arg_sampler),
    entry(AbiCall::NdRangeInitialize, ndrange_initialize),
    entry(AbiCall::NdRangeGetNumBufferEntries, num_buffer_entries),
    entry(AbiCall::NdRangeSendWorkGroups, ndrange_send_work_groups),
    entry(AbiCall::NdRangeFinish, ndrange_finish),
    entry(AbiCall::NdRangePassMemObjs, ndrange_pass_mem_objs),
];

/// Table row for `code`, if it is in `1..=18`.
pub fn lookup(code: u32) -> Option<&'static AbiEntry> {
    let index = usize::try_from(code.checked_sub(1)?).ok()?;
    ABI_TABLE.get(index)
}

fn init(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    debug!("\tversion_ptr=0x{:x}", f.regs.ecx);
    driver.init(f.guest, f.regs.ecx)?;
    Ok(0)
}

fn mem_alloc(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    Ok(driver.mem_alloc(f.regs.ecx))
}

fn mem_read(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    let (host_ptr, device_ptr, size) = (f.regs.ecx, f.regs.edx, f.regs.esi);
    debug!("\thost_ptr=0x{host_ptr:x}, device_ptr=0x{device_ptr:x}, size={size}");
    driver.mem_read(f.guest, host_ptr, device_ptr, size)?;
    Ok(0)
}

fn mem_write(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    let (device_ptr, host_ptr, size) = (f.regs.ecx, f.regs.edx, f.regs.esi);
    debug!("\tdevice_ptr=0x{device_ptr:x}, host_ptr=0x{host_ptr:x}, size={size}");
    driver.mem_write(f.guest, device_ptr, host_ptr, size)?;
    Ok(0)
}

fn mem_copy(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    let (dest_ptr, src_ptr, size) = (f.regs.ecx, f.regs.edx, f.regs.esi);
    debug!("\tdest_ptr=0x{dest_ptr:x}, src_ptr=0x{src_ptr:x}, size={size}");
    driver.mem_copy(dest_ptr, src_ptr, size)?;
    Ok(0)
}

fn mem_free(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    Ok(driver.mem_free(f.regs.ecx))
}

fn program_create(driver: &mut Driver, _: &mut CallFrame<'_>) -> Result<u32> {
    Ok(driver.program_create())
}

fn program_set_binary(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    const CALL: &str = "si_program_set_binary";
    let (program_id, bin_ptr, bin_size) = (f.regs.ecx, f.regs.edx, f.regs.esi);
    debug!("\tprogram_id={program_id}, bin_ptr=0x{bin_ptr:x}, size={bin_size}");
    // Validate the id before copying the blob out of guest memory.
    driver.registry().program(CALL, program_id)?;
    let bytes = f.guest.read(bin_ptr, bin_size as usize)?;
    driver.program_set_binary(program_id, bytes)?;
    Ok(0)
}

fn kernel_create(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    const CALL: &str = "si_kernel_create";
    let (program_id, name_ptr) = (f.regs.ecx, f.regs.edx);
    let max = driver.config().max_string_size;
    let raw = f.guest.read_string(name_ptr, max)?;
    if raw.len() == max {
        return Err(DriverError::protocol(CALL, "buffer too small"));
    }
    let name = String::from_utf8(raw)
        .map_err(|_| DriverError::protocol(CALL, "kernel name is not valid UTF-8"))?;
    debug!("\tprogram_id={}, func_name='{}'", program_id, name);
    driver.kernel_create(program_id, &name)
}

fn kernel_set_arg_value(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    const CALL: &str = "si_kernel_set_arg_value";
    let (kernel_id, index, host_ptr, size) = (f.regs.ecx, f.regs.edx, f.regs.esi, f.regs.edi);
    debug!("\tkernel_id={kernel_id}, index={index}, host_ptr=0x{host_ptr:x}, size={size}");
    let kernel = driver.registry().kernel(CALL, kernel_id)?;
    let declared = kernel.value_arg_size(CALL, index)?;
    if size != declared {
        return Err(DriverError::protocol(
            CALL,
            format!("argument {index}: size mismatch ({declared} expected, {size} found)"),
        ));
    }
    let bytes = f.guest.read(host_ptr, size as usize)?;
    driver.kernel_set_arg_value(kernel_id, index, bytes)?;
    Ok(0)
}

fn kernel_set_arg_pointer(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    let (kernel_id, index, device_ptr, size) = (f.regs.ecx, f.regs.edx, f.regs.esi, f.regs.edi);
    debug!("\tkernel_id={kernel_id}, index={index}, device_ptr=0x{device_ptr:x}, size={size}");
    // A null device pointer asks for local memory.
    let device_ptr = (device_ptr != 0).then_some(device_ptr);
    driver.kernel_set_arg_pointer(kernel_id, index, device_ptr, size)?;
    Ok(0)
}

fn kernel_set_arg_image(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    driver.kernel_set_arg_image(f.regs.ecx, f.regs.edx)?;
    Ok(0)
}

fn kernel_set_arg_sampler(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    driver.kernel_set_arg_sampler(f.regs.ecx, f.regs.edx)?;
    Ok(0)
}

fn ndrange_initialize(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    const CALL: &str = "si_ndrange_initialize";
    let r = f.regs;
    let (kernel_id, work_dim) = (r.ecx, r.edx);
    debug!(
        "\tkernel_id={}, work_dim={}, offset_ptr=0x{:x}, size_ptr=0x{:x}, local_ptr=0x{:x}",
        kernel_id, work_dim, r.esi, r.edi, r.ebp
    );
    if !(1..=3).contains(&work_dim) {
        return Err(DriverError::protocol(
            CALL,
            format!("work_dim must be between 1 and 3, got {work_dim}"),
        ));
    }
    let global_offset = read_dims(f.guest, r.esi, work_dim)?;
    let global_size = read_dims(f.guest, r.edi, work_dim)?;
    let local_size = read_dims(f.guest, r.ebp, work_dim)?;
    let geometry = Geometry::new(work_dim, &global_offset, &global_size, &local_size)?;
    driver.ndrange_initialize(kernel_id, geometry)?;
    Ok(0)
}

fn read_dims(guest: &dyn GuestMemory, ptr: u32, work_dim: u32) -> Result<Vec<u32>> {
    (0..work_dim)
        .map(|i| guest.read_u32(ptr.wrapping_add(i * 4)))
        .collect()
}

fn num_buffer_entries(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    driver.get_num_buffer_entries(f.guest, f.regs.ecx)?;
    Ok(0)
}

fn ndrange_send_work_groups(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    driver.send_work_groups(f.context, f.regs.ecx, f.regs.edx)?;
    Ok(0)
}

fn ndrange_finish(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    driver.finish(f.context)?;
    Ok(0)
}

fn ndrange_pass_mem_objs(driver: &mut Driver, f: &mut CallFrame<'_>) -> Result<u32> {
    driver.pass_mem_objs(f.regs.ecx, f.regs.edx)?;
    Ok(0)
}
