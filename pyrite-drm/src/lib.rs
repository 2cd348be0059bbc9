//! Raw interface between the `pyrite` winsys and the GPU kernel driver.
//!
//! This crate defines the wire-level submission records (plain-old-data,
//! `#[repr(C)]`, directly usable as ioctl payloads) and the [`KernelDevice`]
//! trait through which the winsys reaches the kernel. Production builds
//! implement the trait over the real device node; tests implement it over an
//! in-process software device.
//!
//! Nothing in this crate allocates or retries. Policy (growth heuristics,
//! retry loops, error mapping) lives in `pyrite` proper.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use std::{error::Error, fmt, ptr::NonNull};

/// Hardware queues ("rings") addressable per engine type.
pub const MAX_QUEUES_PER_ENGINE: usize = 8;

bitflags! {
    /// Placement and access flags for a kernel buffer allocation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Allocate from device-local memory.
        const VRAM = 1 << 0;
        /// Allocate from kernel-managed system memory visible to the GPU.
        const GTT = 1 << 1;
        /// Keep a CPU mapping for the lifetime of the allocation.
        const CPU_ACCESS = 1 << 2;
        /// The GPU command processor fetches instructions from this buffer.
        const EXEC = 1 << 3;
    }
}

bitflags! {
    /// Per-IB execution flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IbFlags: u32 {
        /// The IB re-establishes queue state and may be skipped when the
        /// queue context is already current.
        const PREAMBLE = 1 << 0;
    }
}

bitflags! {
    /// Flags on a timeline sync-object wait descriptor.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SyncobjFlags: u32 {
        /// The wait point may not have been submitted yet; block until it
        /// materializes instead of rejecting the request.
        const WAIT_FOR_SUBMIT = 1 << 0;
    }
}

/// One indirect-buffer descriptor in a submission request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IbDescriptor {
    pub flags: u32,
    /// Length of the command stream in 32-bit words.
    pub size_dw: u32,
    /// GPU virtual address the command processor fetches from.
    pub gpu_address: u64,
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
    pub _pad: u32,
}

/// One entry of the deduplicated buffer list attached to a submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferListEntry {
    pub handle: u32,
    pub priority: u32,
}

/// A binary sync-object dependency or signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SyncobjDescriptor {
    pub handle: u32,
}

/// A timeline sync-object dependency or signal. A `point` of zero denotes a
/// binary entry carried in the timeline array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TimelineSyncobjDescriptor {
    pub handle: u32,
    pub flags: u32,
    pub point: u64,
}

/// Where the kernel writes the completed sequence number for this queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FenceRecord {
    /// Buffer handle containing the fence slot.
    pub handle: u32,
    pub _pad: u32,
    /// Byte offset of the 8-byte fence slot inside the buffer.
    pub offset: u64,
}

/// Kernel-scheduler ordering constraint: this submission must not start
/// before the referenced earlier submission has been scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ScheduledDependency {
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
    pub ctx_id: u32,
    pub seq_no: u64,
}

/// A fully assembled submission request. Borrowed views over the caller's
/// arrays; the kernel copies what it needs before returning.
#[derive(Clone, Copy, Debug)]
pub struct SubmitRequest<'a> {
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
    pub ibs: &'a [IbDescriptor],
    pub buffers: &'a [BufferListEntry],
    pub fence: Option<FenceRecord>,
    pub dependencies: &'a [ScheduledDependency],
    /// Binary wait/signal arrays, used when the kernel lacks timeline
    /// sync-object support.
    pub wait_syncobjs: &'a [SyncobjDescriptor],
    pub signal_syncobjs: &'a [SyncobjDescriptor],
    /// Timeline wait/signal arrays, used when it has it.
    pub wait_timeline: &'a [TimelineSyncobjDescriptor],
    pub signal_timeline: &'a [TimelineSyncobjDescriptor],
}

/// A successful buffer allocation.
#[derive(Debug)]
pub struct BufferAllocation {
    pub handle: u32,
    pub gpu_address: u64,
    /// Present when [`AllocFlags::CPU_ACCESS`] was requested. Valid until
    /// `free_buffer` on the handle.
    pub cpu_address: Option<NonNull<u32>>,
}

/// An exported sync-file reference. Opaque to the winsys; must be returned
/// to the kernel via `import_sync_file` or `close_sync_file`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncFile(pub u64);

/// Errno-shaped failures surfaced by [`KernelDevice`] operations. The winsys
/// maps these onto its public error set and never propagates them upward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Transient host-memory exhaustion; the request may succeed if retried.
    NoMemory,
    /// Device-memory exhaustion; retrying will not help.
    NoSpace,
    /// The context was cancelled by the kernel, typically after a GPU hang.
    Canceled,
    /// The caller lacks the privilege for the request.
    NoPermission,
    /// The request was malformed. Indicates a driver bug.
    InvalidInput,
}

impl Error for KernelError {}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KernelError::NoMemory => "out of system memory",
            KernelError::NoSpace => "out of device memory",
            KernelError::Canceled => "context cancelled by the kernel",
            KernelError::NoPermission => "permission denied",
            KernelError::InvalidInput => "malformed request",
        })
    }
}

/// Context scheduling priority, in the kernel's encoding.
pub const CTX_PRIORITY_LOW: u32 = 0;
pub const CTX_PRIORITY_NORMAL: u32 = 1;
pub const CTX_PRIORITY_HIGH: u32 = 2;
pub const CTX_PRIORITY_REALTIME: u32 = 3;

/// The kernel driver as seen by the winsys.
///
/// Object safe so that tests can install a software implementation. All
/// methods are callable from any thread; implementations serialize
/// internally where the real ioctls would.
pub trait KernelDevice: Send + Sync + fmt::Debug {
    fn alloc_buffer(
        &self,
        size: u64,
        alignment: u64,
        flags: AllocFlags,
    ) -> Result<BufferAllocation, KernelError>;

    fn free_buffer(&self, handle: u32);

    /// Reserves a GPU virtual-address range without backing memory.
    fn reserve_va(&self, size: u64, alignment: u64) -> Result<u64, KernelError>;

    fn release_va(&self, address: u64, size: u64);

    /// Creates a submission context. `NoPermission` is returned when the
    /// caller may not use an elevated `priority`.
    fn create_context(&self, priority: u32) -> Result<u32, KernelError>;

    fn destroy_context(&self, ctx: u32);

    /// Queues the request for execution and returns its sequence number,
    /// which increases monotonically per (context, engine, ring).
    fn submit(&self, ctx: u32, request: &SubmitRequest<'_>) -> Result<u64, KernelError>;

    fn create_syncobj(&self, signaled: bool) -> Result<u32, KernelError>;

    fn destroy_syncobj(&self, handle: u32);

    /// Exports the sync object's current binary state as a sync file.
    fn export_sync_file(&self, syncobj: u32) -> Result<SyncFile, KernelError>;

    /// Exports one timeline point as a sync file. Fails with `InvalidInput`
    /// if the point has not been submitted yet.
    fn export_sync_file_at(&self, syncobj: u32, point: u64) -> Result<SyncFile, KernelError>;

    /// Replaces the sync object's binary state with the sync file. Consumes
    /// the file reference.
    fn import_sync_file(&self, syncobj: u32, file: SyncFile) -> Result<(), KernelError>;

    /// Merges two sync files into one that signals when both have.
    /// Consumes both input references.
    fn merge_sync_files(&self, a: SyncFile, b: SyncFile) -> Result<SyncFile, KernelError>;

    fn close_sync_file(&self, file: SyncFile);

    /// Copies a payload between sync objects: `dst` at `dst_point` signals
    /// when `src` at `src_point` does. Point zero selects binary state.
    fn transfer_syncobj(
        &self,
        dst: u32,
        dst_point: u64,
        src: u32,
        src_point: u64,
    ) -> Result<(), KernelError>;

    /// Returns the highest signaled timeline point (zero if none).
    fn query_syncobj(&self, syncobj: u32) -> Result<u64, KernelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn record_layouts() {
        assert_eq!(mem::size_of::<IbDescriptor>(), 32);
        assert_eq!(mem::size_of::<BufferListEntry>(), 8);
        assert_eq!(mem::size_of::<SyncobjDescriptor>(), 4);
        assert_eq!(mem::size_of::<TimelineSyncobjDescriptor>(), 16);
        assert_eq!(mem::size_of::<FenceRecord>(), 16);
        assert_eq!(mem::size_of::<ScheduledDependency>(), 24);
    }

    #[test]
    fn records_cast_to_bytes() {
        let ib = IbDescriptor {
            flags: 0,
            size_dw: 16,
            gpu_address: 0x1000,
            ip_type: 0,
            ip_instance: 0,
            ring: 0,
            _pad: 0,
        };
        let bytes = bytemuck::bytes_of(&ib);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[4..8], &16u32.to_ne_bytes());
    }
}
