//! ND-Range (dispatch) construction.
//!
//! An [`NdRange`] is the schedulable unit produced from a kernel and the
//! guest-supplied geometry: work-group decomposition, register usage and
//! user elements copied from the binary, a private instruction memory
//! holding the kernel's `.text`, and the device-resident resource tables
//! and constant buffers that carry the kernel arguments.

use tracing::{debug, info};

use crate::binary::{PointerScope, UserElement};
use crate::device_memory::DeviceMemory;
use crate::error::{DriverError, Result};
use crate::registry::{ArgBinding, Kernel, KernelId};

pub type NdRangeId = u32;

/// Entries in the constant-buffer table.
pub const MAX_CONST_BUFS: u32 = 16;
pub const CONST_BUF_TABLE_ENTRY_SIZE: u32 = 16;
pub const CONST_BUF_TABLE_SIZE: u32 = MAX_CONST_BUFS * CONST_BUF_TABLE_ENTRY_SIZE;

pub const MAX_RESOURCES: u32 = 16;
pub const RESOURCE_TABLE_ENTRY_SIZE: u32 = 32;
pub const RESOURCE_TABLE_SIZE: u32 = MAX_RESOURCES * RESOURCE_TABLE_ENTRY_SIZE;

pub const MAX_UAVS: u32 = 16;
pub const UAV_TABLE_ENTRY_SIZE: u32 = 32;
pub const UAV_TABLE_SIZE: u32 = MAX_UAVS * UAV_TABLE_ENTRY_SIZE;

pub const CONST_BUF_0_SIZE: u32 = 160;
pub const CONST_BUF_1_SIZE: u32 = 1024;

/// Byte offsets of the dispatch constants inside constant buffer 0.
pub mod cb0 {
    pub const GLOBAL_SIZE: u32 = 0;
    pub const LOCAL_SIZE: u32 = 16;
    pub const GROUP_COUNT: u32 = 32;
    pub const WORK_DIM: u32 = 48;
    pub const GLOBAL_OFFSET: u32 = 64;
}

const CALL_INIT: &str = "si_ndrange_initialize";
const CALL_PASS: &str = "si_ndrange_pass_mem_objs";

/// Guest-supplied iteration space of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub work_dim: u32,
    pub global_offset: [u32; 3],
    pub global_size: [u32; 3],
    pub local_size: [u32; 3],
}

impl Geometry {
    /// Build a geometry from per-dimension slices of length `work_dim`.
    /// Unused dimensions get offset 0 and size 1.
    pub fn new(
        work_dim: u32,
        global_offset: &[u32],
        global_size: &[u32],
        local_size: &[u32],
    ) -> Result<Self> {
        if !(1..=3).contains(&work_dim) {
            return Err(DriverError::protocol(
                CALL_INIT,
                format!("work_dim must be between 1 and 3, got {work_dim}"),
            ));
        }
        let dims = work_dim as usize;
        let named = [
            ("global_offset", global_offset),
            ("global_size", global_size),
            ("local_size", local_size),
        ];
        for (what, arr) in named {
            if arr.len() != dims {
                return Err(DriverError::protocol(
                    CALL_INIT,
                    format!("{what} has {} entries for work_dim {work_dim}", arr.len()),
                ));
            }
        }

        let mut g = Self {
            work_dim,
            global_offset: [0; 3],
            global_size: [1; 3],
            local_size: [1; 3],
        };
        g.global_offset[..dims].copy_from_slice(global_offset);
        g.global_size[..dims].copy_from_slice(global_size);
        g.local_size[..dims].copy_from_slice(local_size);
        Ok(g)
    }

    /// Work-groups per dimension. Global sizes must divide exactly.
    pub fn group_count(&self) -> Result<[u32; 3]> {
        let mut count = [1u32; 3];
        for i in 0..3 {
            let (global, local) = (self.global_size[i], self.local_size[i]);
            if local == 0 {
                return Err(DriverError::protocol(
                    CALL_INIT,
                    format!("local_size[{i}] must be non-zero"),
                ));
            }
            if global % local != 0 {
                let reason = format!("global_size[{i}]={global} is not a multiple of {local}");
                return Err(DriverError::protocol(CALL_INIT, reason));
            }
            count[i] = global / local;
        }
        Ok(count)
    }
}

/// Device addresses of the per-dispatch tables and constant buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceTables {
    pub const_buf_table: u32,
    pub resource_table: u32,
    pub uav_table: u32,
    pub cb0: u32,
    pub cb1: u32,
}

impl ResourceTables {
    /// Tables supplied by the guest in fused mode: each table follows the
    /// previous one, 16-byte aligned.
    pub fn chained(tables_ptr: u32, constant_buffers_ptr: u32) -> Self {
        let align = |addr: u32| addr.wrapping_add(16) & 0xFFFF_FFF0;
        let resource_table = align(tables_ptr.wrapping_add(CONST_BUF_TABLE_SIZE));
        let uav_table = align(resource_table.wrapping_add(RESOURCE_TABLE_SIZE));
        Self {
            const_buf_table: tables_ptr,
            resource_table,
            uav_table,
            cb0: constant_buffers_ptr,
            cb1: constant_buffers_ptr.wrapping_add(CONST_BUF_0_SIZE),
        }
    }
}

/// Lifecycle of a dispatch between initialization and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdRangeStage {
    /// Geometry and instruction memory are set up.
    Initialized,
    /// Tables, constant buffers and arguments are in device memory.
    ArgumentsReady,
}

/// One kernel dispatch.
#[derive(Debug, Clone)]
pub struct NdRange {
    pub id: NdRangeId,
    pub kernel_id: KernelId,
    pub geometry: Geometry,
    pub group_count: [u32; 3],
    pub total_groups: u32,
    /// Next free byte of work-group local memory.
    pub local_mem_top: u32,
    pub num_sgpr_used: u32,
    pub num_vgpr_used: u32,
    pub wg_id_sgpr: u32,
    pub user_elements: Vec<UserElement>,
    inst_mem: Vec<u8>,
    /// Initial program counter into `inst_mem`.
    pub pc: u32,
    pub tables: Option<ResourceTables>,
    pub stage: NdRangeStage,
}

impl NdRange {
    /// Build a dispatch for `kernel`. Device memory is not touched.
    pub fn new(id: NdRangeId, kernel: &Kernel, geometry: Geometry) -> Result<Self> {
        let group_count = geometry.group_count()?;
        let total_groups = group_count
            .iter()
            .try_fold(1u32, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| DriverError::protocol(CALL_INIT, "work-group count overflows"))?;

        let meta = &kernel.meta;
        if meta.text.is_empty() {
            return Err(DriverError::protocol(
                CALL_INIT,
                format!("kernel '{}': cannot load kernel code", kernel.name),
            ));
        }

        let mut ndrange = Self {
            id,
            kernel_id: kernel.id,
            geometry,
            group_count,
            total_groups,
            local_mem_top: meta.mem_size_local,
            num_sgpr_used: meta.num_sgpr_used,
            num_vgpr_used: meta.num_vgpr_used,
            wg_id_sgpr: meta.wg_id_sgpr,
            user_elements: meta.user_elements.clone(),
            inst_mem: Vec::new(),
            pc: 0,
            tables: None,
            stage: NdRangeStage::Initialized,
        };
        ndrange.setup_inst_mem(&meta.text, 0);

        info!(
            "ND-Range {} for kernel '{}': work_dim={}, groups={:?} ({} total)",
            id, kernel.name, geometry.work_dim, group_count, total_groups
        );
        Ok(ndrange)
    }

    /// Load `code` into a fresh instruction memory at offset zero.
    fn setup_inst_mem(&mut self, code: &[u8], pc: u32) {
        self.inst_mem = code.to_vec();
        self.pc = pc;
    }

    pub fn inst_mem(&self) -> &[u8] {
        &self.inst_mem
    }

    /// Allocate the constant-buffer, resource and UAV tables in device memory.
    pub fn create_tables(&mut self, dm: &mut DeviceMemory) {
        let tables = self.tables.get_or_insert_with(ResourceTables::default);
        tables.const_buf_table = dm.allocate(CONST_BUF_TABLE_SIZE);
        tables.resource_table = dm.allocate(RESOURCE_TABLE_SIZE);
        tables.uav_table = dm.allocate(UAV_TABLE_SIZE);
    }

    /// Allocate constant buffers 0 and 1.
    pub fn create_constant_buffers(&mut self, dm: &mut DeviceMemory) {
        let tables = self.tables.get_or_insert_with(ResourceTables::default);
        tables.cb0 = dm.allocate(CONST_BUF_0_SIZE);
        tables.cb1 = dm.allocate(CONST_BUF_1_SIZE);
    }

    /// Use guest-provided tables instead of allocating them.
    pub fn set_tables(&mut self, tables: ResourceTables) {
        self.tables = Some(tables);
    }

    fn tables(&self) -> Result<ResourceTables> {
        self.tables
            .ok_or_else(|| DriverError::protocol(CALL_PASS, "resource tables not created"))
    }

    /// Write `bytes` at `offset` inside constant buffer `num`.
    pub fn const_buf_write(
        &self,
        dm: &mut DeviceMemory,
        num: u32,
        offset: u32,
        bytes: &[u8],
    ) -> Result<()> {
        check_const_buf_span(num, offset, bytes.len())?;
        let t = self.tables()?;
        let base = if num == 0 { t.cb0 } else { t.cb1 };
        dm.write(CALL_PASS, base + offset, bytes)
    }

    /// Register both constant buffers in the table and fill buffer 0 with
    /// the dispatch geometry.
    pub fn setup_constant_buffers(&self, dm: &mut DeviceMemory) -> Result<()> {
        let t = self.tables()?;
        let buffers = [(t.cb0, CONST_BUF_0_SIZE), (t.cb1, CONST_BUF_1_SIZE)];
        for (slot, (base, size)) in buffers.into_iter().enumerate() {
            let entry = t.const_buf_table + slot as u32 * CONST_BUF_TABLE_ENTRY_SIZE;
            let desc = descriptor(base, size, CONST_BUF_TABLE_ENTRY_SIZE);
            dm.write(CALL_PASS, entry, &desc)?;
        }

        let g = &self.geometry;
        self.const_buf_write(dm, 0, cb0::GLOBAL_SIZE, &words(&g.global_size))?;
        self.const_buf_write(dm, 0, cb0::LOCAL_SIZE, &words(&g.local_size))?;
        self.const_buf_write(dm, 0, cb0::GROUP_COUNT, &words(&self.group_count))?;
        self.const_buf_write(dm, 0, cb0::WORK_DIM, &g.work_dim.to_le_bytes())?;
        self.const_buf_write(dm, 0, cb0::GLOBAL_OFFSET, &words(&g.global_offset))?;
        Ok(())
    }

    /// Bind a global buffer in UAV slot `index`.
    pub fn insert_uav(
        &self,
        dm: &mut DeviceMemory,
        index: u32,
        base: u32,
        size: u32,
    ) -> Result<()> {
        if index >= MAX_UAVS {
            return Err(DriverError::protocol(CALL_PASS, format!("invalid UAV slot {index}")));
        }
        let t = self.tables()?;
        let entry = t.uav_table + index * UAV_TABLE_ENTRY_SIZE;
        let desc = descriptor(base, size, UAV_TABLE_ENTRY_SIZE);
        dm.write(CALL_PASS, entry, &desc)
    }

    /// Check every argument of `kernel` without writing device memory.
    ///
    /// Each argument must be bound, of a supported kind and fit its
    /// constant-buffer slot; global pointers must lie below the heap top.
    pub fn check_args(kernel: &Kernel, dm: &DeviceMemory) -> Result<()> {
        for arg in kernel.args() {
            if !arg.set {
                let reason = format!("argument '{}' has not been set", arg.name);
                return Err(DriverError::protocol(CALL_PASS, reason));
            }
            match &arg.binding {
                ArgBinding::Image => {
                    return Err(DriverError::unimplemented(CALL_PASS, "image arguments"));
                }
                ArgBinding::Sampler => {
                    return Err(DriverError::unimplemented(CALL_PASS, "sampler arguments"));
                }
                ArgBinding::Pointer {
                    scope: PointerScope::Uav,
                    size,
                    device_ptr,
                    uav_index,
                    ..
                } => {
                    if *uav_index >= MAX_UAVS {
                        let reason = format!("invalid UAV slot {uav_index}");
                        return Err(DriverError::protocol(CALL_PASS, reason));
                    }
                    if let Some(addr) = device_ptr {
                        dm.check_range(CALL_PASS, *addr, *size)?;
                    }
                }
                _ => {}
            }
            if let Some((num, offset, len)) = arg_slot(&arg.binding) {
                check_const_buf_span(num, offset, len)?;
            }
        }
        Ok(())
    }

    /// Materialize every kernel argument into device memory.
    ///
    /// Values go into their constant-buffer slot; global pointers into the
    /// UAV table plus their address into the constant buffer; local
    /// pointers receive the current local-memory top, which then advances.
    pub fn setup_args(&mut self, kernel: &Kernel, dm: &mut DeviceMemory) -> Result<()> {
        Self::check_args(kernel, dm)?;
        for arg in kernel.args() {
            let Some((num, offset, _)) = arg_slot(&arg.binding) else {
                continue;
            };
            match &arg.binding {
                ArgBinding::Value { value, .. } => {
                    let bytes = value.as_deref().unwrap_or_default();
                    self.const_buf_write(dm, num, offset, bytes)?;
                }
                ArgBinding::Pointer {
                    scope: PointerScope::Uav,
                    size,
                    device_ptr,
                    uav_index,
                    ..
                } => {
                    let addr = device_ptr.unwrap_or(0);
                    self.insert_uav(dm, *uav_index, addr, *size)?;
                    self.const_buf_write(dm, num, offset, &addr.to_le_bytes())?;
                }
                ArgBinding::Pointer { size, .. } => {
                    let local = self.local_mem_top;
                    self.const_buf_write(dm, num, offset, &local.to_le_bytes())?;
                    self.local_mem_top = local.wrapping_add(*size);
                }
                ArgBinding::Image | ArgBinding::Sampler => {}
            }
            let kind = arg.binding.kind_name();
            debug!("argument {} '{}' ({kind}) written", arg.index, arg.name);
        }
        self.stage = NdRangeStage::ArgumentsReady;
        Ok(())
    }
}

/// Constant-buffer number, offset and byte length an argument occupies.
fn arg_slot(binding: &ArgBinding) -> Option<(u32, u32, usize)> {
    match binding {
        ArgBinding::Value {
            size,
            constant_buffer,
            constant_offset,
            ..
        } => Some((*constant_buffer, *constant_offset, *size as usize)),
        ArgBinding::Pointer {
            constant_buffer,
            constant_offset,
            ..
        } => Some((*constant_buffer, *constant_offset, 4)),
        ArgBinding::Image | ArgBinding::Sampler => None,
    }
}

fn check_const_buf_span(num: u32, offset: u32, len: usize) -> Result<()> {
    let size = match num {
        0 => CONST_BUF_0_SIZE,
        1 => CONST_BUF_1_SIZE,
        _ => {
            let reason = format!("invalid constant buffer {num}");
            return Err(DriverError::protocol(CALL_PASS, reason));
        }
    };
    let end = u64::from(offset) + len as u64;
    if end > u64::from(size) {
        return Err(DriverError::protocol(
            CALL_PASS,
            format!("constant buffer {num} overflow: {end} > {size} bytes"),
        ));
    }
    Ok(())
}

fn words(values: &[u32; 3]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Table descriptor: base address and size, zero padded to `entry_size`.
fn descriptor(base: u32, size: u32, entry_size: u32) -> Vec<u8> {
    let mut d = vec![0u8; entry_size as usize];
    d[..4].copy_from_slice(&base.to_le_bytes());
    d[4..8].copy_from_slice(&size.to_le_bytes());
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{ArgKindMeta, ArgMetadata, JsonBinaryLoader, KernelMetadata, ProgramBinary};
    use crate::registry::Registry;

    fn kernel_with(meta: KernelMetadata) -> (Registry, KernelId) {
        let mut program = ProgramBinary::default();
        program.kernels.insert("k".into(), meta);
        let bytes = program.to_json_bytes();
        let mut reg = Registry::new();
        let p = reg.create_program();
        reg.set_binary(p, bytes, &JsonBinaryLoader).unwrap();
        let k = reg.create_kernel(p, "k").unwrap();
        (reg, k)
    }

    fn simple_meta() -> KernelMetadata {
        let element = UserElement {
            data_class: 3,
            api_slot: 0,
            start_user_reg: 2,
            user_reg_count: 4,
        };
        KernelMetadata {
            args: vec![
                ArgMetadata {
                    name: "out".into(),
                    kind: ArgKindMeta::Pointer {
                        scope: PointerScope::Uav,
                        constant_buffer: 1,
                        constant_offset: 0,
                        uav_index: 11,
                    },
                },
                ArgMetadata {
                    name: "scale".into(),
                    kind: ArgKindMeta::Value {
                        size: 4,
                        constant_buffer: 1,
                        constant_offset: 16,
                    },
                },
                ArgMetadata {
                    name: "scratch".into(),
                    kind: ArgKindMeta::Pointer {
                        scope: PointerScope::Local,
                        constant_buffer: 1,
                        constant_offset: 32,
                        uav_index: 0,
                    },
                },
            ],
            mem_size_local: 64,
            num_sgpr_used: 12,
            num_vgpr_used: 5,
            wg_id_sgpr: 8,
            user_elements: vec![element],
            text: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
        }
    }

    fn geometry_2d() -> Geometry {
        Geometry::new(2, &[0, 0], &[64, 64], &[16, 16]).unwrap()
    }

    fn read_u32(dm: &DeviceMemory, addr: u32) -> u32 {
        let b = dm.read("test", addr, 4).unwrap();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[test]
    fn geometry_pads_unused_dimensions() {
        let g = Geometry::new(1, &[8], &[256], &[64]).unwrap();
        assert_eq!(g.global_size, [256, 1, 1]);
        assert_eq!(g.local_size, [64, 1, 1]);
        assert_eq!(g.group_count().unwrap(), [4, 1, 1]);
    }

    #[test]
    fn geometry_rejects_bad_work_dim() {
        assert!(Geometry::new(0, &[], &[], &[]).is_err());
        assert!(Geometry::new(4, &[0; 4], &[1; 4], &[1; 4]).is_err());
    }

    #[test]
    fn geometry_rejects_non_divisible_sizes() {
        let g = Geometry::new(1, &[0], &[100], &[16]).unwrap();
        let err = g.group_count().unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
        let g = Geometry::new(1, &[0], &[100], &[0]).unwrap();
        assert!(g.group_count().is_err());
    }

    #[test]
    fn new_copies_kernel_metadata() {
        let (reg, k) = kernel_with(simple_meta());
        let nd = NdRange::new(5, reg.kernel("test", k).unwrap(), geometry_2d()).unwrap();
        assert_eq!(nd.id, 5);
        assert_eq!(nd.group_count, [4, 4, 1]);
        assert_eq!(nd.total_groups, 16);
        assert_eq!(nd.num_sgpr_used, 12);
        assert_eq!(nd.num_vgpr_used, 5);
        assert_eq!(nd.wg_id_sgpr, 8);
        assert_eq!(nd.user_elements.len(), 1);
        assert_eq!(nd.local_mem_top, 64);
        assert_eq!(nd.inst_mem(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(nd.pc, 0);
        assert_eq!(nd.stage, NdRangeStage::Initialized);
    }

    #[test]
    fn empty_text_cannot_be_loaded() {
        let meta = KernelMetadata {
            text: vec![],
            ..simple_meta()
        };
        let (reg, k) = kernel_with(meta);
        let err = NdRange::new(0, reg.kernel("test", k).unwrap(), geometry_2d()).unwrap_err();
        assert!(err.to_string().contains("cannot load kernel code"));
    }

    #[test]
    fn chained_tables_are_aligned() {
        let t = ResourceTables::chained(0x1000, 0x8000);
        assert_eq!(t.const_buf_table, 0x1000);
        assert_eq!(t.resource_table, 0x1110);
        assert_eq!(t.uav_table, 0x1320);
        assert_eq!(t.cb1, 0x8000 + CONST_BUF_0_SIZE);
    }

    #[test]
    fn setup_writes_geometry_and_arguments() {
        let (mut reg, k) = kernel_with(simple_meta());
        let mut dm = DeviceMemory::new();
        dm.allocate(64);
        let buf = dm.allocate(256);
        {
            let kernel = reg.kernel_mut("test", k).unwrap();
            let scale = 2.5f32.to_le_bytes().to_vec();
            kernel.set_arg_pointer(0, Some(buf), 256).unwrap();
            kernel.set_arg_value(1, scale).unwrap();
            kernel.set_arg_pointer(2, None, 32).unwrap();
        }
        let kernel = reg.kernel("test", k).unwrap();
        let mut nd = NdRange::new(0, kernel, geometry_2d()).unwrap();
        nd.create_tables(&mut dm);
        nd.create_constant_buffers(&mut dm);
        nd.setup_constant_buffers(&mut dm).unwrap();
        nd.setup_args(kernel, &mut dm).unwrap();

        let t = nd.tables.unwrap();
        let cb1_entry = t.const_buf_table + CONST_BUF_TABLE_ENTRY_SIZE;
        assert_eq!(read_u32(&dm, t.const_buf_table), t.cb0);
        assert_eq!(read_u32(&dm, cb1_entry), t.cb1);
        assert_eq!(read_u32(&dm, t.cb0 + cb0::GLOBAL_SIZE + 4), 64);
        assert_eq!(read_u32(&dm, t.cb0 + cb0::GROUP_COUNT), 4);
        assert_eq!(read_u32(&dm, t.cb0 + cb0::WORK_DIM), 2);

        assert_eq!(read_u32(&dm, t.cb1), buf);
        assert_eq!(read_u32(&dm, t.uav_table + 11 * UAV_TABLE_ENTRY_SIZE), buf);
        assert_eq!(f32::from_bits(read_u32(&dm, t.cb1 + 16)), 2.5);
        assert_eq!(read_u32(&dm, t.cb1 + 32), 64);
        assert_eq!(nd.local_mem_top, 96);
        assert_eq!(nd.stage, NdRangeStage::ArgumentsReady);
    }

    #[test]
    fn unset_argument_is_a_violation() {
        let (reg, k) = kernel_with(simple_meta());
        let kernel = reg.kernel("test", k).unwrap();
        let mut dm = DeviceMemory::new();
        let mut nd = NdRange::new(0, kernel, geometry_2d()).unwrap();
        nd.create_tables(&mut dm);
        nd.create_constant_buffers(&mut dm);
        let err = nd.setup_args(kernel, &mut dm).unwrap_err();
        assert!(err.to_string().contains("argument 'out' has not been set"));
    }

    #[test]
    fn global_pointer_outside_heap_faults_before_any_write() {
        let (mut reg, k) = kernel_with(simple_meta());
        {
            let kernel = reg.kernel_mut("test", k).unwrap();
            kernel.set_arg_pointer(0, Some(0xFFFF_0000), 256).unwrap();
            kernel.set_arg_value(1, vec![0; 4]).unwrap();
            kernel.set_arg_pointer(2, None, 8).unwrap();
        }
        let kernel = reg.kernel("test", k).unwrap();
        let dm = DeviceMemory::new();
        let err = NdRange::check_args(kernel, &dm).unwrap_err();
        assert!(matches!(err, DriverError::DeviceMemoryFault { .. }));
        assert_eq!(dm.top(), 0);
    }

    #[test]
    fn argument_past_its_constant_buffer_is_rejected() {
        let mut meta = simple_meta();
        meta.args[1].kind = ArgKindMeta::Value {
            size: 8,
            constant_buffer: 1,
            constant_offset: CONST_BUF_1_SIZE - 4,
        };
        let (mut reg, k) = kernel_with(meta);
        {
            let kernel = reg.kernel_mut("test", k).unwrap();
            kernel.set_arg_pointer(0, None, 0).unwrap();
            kernel.set_arg_value(1, vec![0; 8]).unwrap();
            kernel.set_arg_pointer(2, None, 8).unwrap();
        }
        let dm = DeviceMemory::new();
        let err = NdRange::check_args(reg.kernel("test", k).unwrap(), &dm).unwrap_err();
        assert!(err.to_string().contains("constant buffer 1 overflow"));
    }

    #[test]
    fn constant_buffer_overflow_is_rejected() {
        let (reg, k) = kernel_with(simple_meta());
        let mut dm = DeviceMemory::new();
        let mut nd = NdRange::new(0, reg.kernel("test", k).unwrap(), geometry_2d()).unwrap();
        nd.create_tables(&mut dm);
        nd.create_constant_buffers(&mut dm);
        let near_end = CONST_BUF_0_SIZE - 2;
        assert!(nd.const_buf_write(&mut dm, 0, near_end, &[0; 4]).is_err());
        assert!(nd.const_buf_write(&mut dm, 2, 0, &[0; 4]).is_err());
    }
}
