//! GPU buffer objects ("BOs").
//!
//! A [`Buffer`] is a kernel allocation with a stable handle and a GPU
//! virtual address, dropped back to the kernel when the last `Arc` goes
//! away. A *virtual* buffer reserves only address space and stands in for an
//! ordered set of concrete buffers; it can be referenced by command streams
//! like any other buffer but contributes its members, not itself, to the
//! submitted buffer list (see [`crate::bo_list`]).

use crate::{device::Device, DeviceOwned, NonExhaustive, WinsysError};
use parking_lot::{RwLock, RwLockReadGuard};
use pyrite_drm::{AllocFlags, BufferListEntry};
use std::{fmt, ptr::NonNull, sync::Arc};

/// Parameters to create a new (concrete) [`Buffer`].
#[derive(Clone, Copy, Debug)]
pub struct BufferCreateInfo {
    /// Size in bytes. Must be a multiple of 4.
    pub size: u64,
    /// Minimum alignment of the GPU virtual address.
    pub alignment: u64,
    /// Placement and access flags.
    pub flags: AllocFlags,
    /// Residency priority; higher values are evicted later. The default
    /// matches ordinary descriptor and vertex data.
    pub priority: u32,
    pub _ne: NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        BufferCreateInfo {
            size: 0,
            alignment: 4096,
            flags: AllocFlags::VRAM,
            priority: 8,
            _ne: NonExhaustive(()),
        }
    }
}

/// A kernel-managed GPU memory allocation.
pub struct Buffer {
    device: Arc<Device>,
    handle: u32,
    gpu_address: u64,
    size: u64,
    priority: u32,
    payload: BufferPayload,
}

enum BufferPayload {
    Concrete { mapping: Option<Mapping> },
    Virtual { members: Vec<Arc<Buffer>> },
}

impl Buffer {
    /// Allocates a new buffer from the device's kernel driver.
    pub fn new(device: &Arc<Device>, create_info: BufferCreateInfo) -> Result<Arc<Buffer>, WinsysError> {
        let BufferCreateInfo { size, alignment, flags, priority, _ne } = create_info;
        assert!(size > 0 && size % 4 == 0, "buffer sizes are whole words");

        let alloc = device.kernel().alloc_buffer(size, alignment, flags)?;
        let mapping = alloc.cpu_address.map(|ptr| Mapping {
            ptr,
            words: (size / 4) as usize,
        });

        device.buffer_registry().register(alloc.handle, priority);

        Ok(Arc::new(Buffer {
            device: device.clone(),
            handle: alloc.handle,
            gpu_address: alloc.gpu_address,
            size,
            priority,
            payload: BufferPayload::Concrete { mapping },
        }))
    }

    /// Reserves address space for a virtual buffer backed by `members`.
    ///
    /// The members are what a submission referencing this buffer will carry
    /// in its buffer list; they are not consulted before then.
    pub fn new_virtual(
        device: &Arc<Device>,
        size: u64,
        members: Vec<Arc<Buffer>>,
    ) -> Result<Arc<Buffer>, WinsysError> {
        assert!(size > 0 && size % 4 == 0, "buffer sizes are whole words");
        debug_assert!(members.iter().all(|member| !member.is_virtual()));

        let gpu_address = device.kernel().reserve_va(size, 4096)?;

        Ok(Arc::new(Buffer {
            device: device.clone(),
            handle: 0,
            gpu_address,
            size,
            priority: 0,
            payload: BufferPayload::Virtual { members },
        }))
    }

    /// The kernel handle, as it appears in submission buffer lists.
    /// Zero for virtual buffers, which never appear there themselves.
    #[inline]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    #[inline]
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        matches!(self.payload, BufferPayload::Virtual { .. })
    }

    /// The CPU mapping, if the buffer was created with
    /// [`AllocFlags::CPU_ACCESS`].
    #[inline]
    pub fn mapping(&self) -> Option<&Mapping> {
        match &self.payload {
            BufferPayload::Concrete { mapping } => mapping.as_ref(),
            BufferPayload::Virtual { .. } => None,
        }
    }

    /// The concrete buffers standing behind a virtual one.
    #[inline]
    pub fn members(&self) -> Option<&[Arc<Buffer>]> {
        match &self.payload {
            BufferPayload::Concrete { .. } => None,
            BufferPayload::Virtual { members } => Some(members),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        match self.payload {
            BufferPayload::Concrete { .. } => {
                self.device.buffer_registry().unregister(self.handle);
                self.device.kernel().free_buffer(self.handle);
            }
            BufferPayload::Virtual { .. } => {
                self.device.kernel().release_va(self.gpu_address, self.size);
            }
        }
    }
}

unsafe impl DeviceOwned for Buffer {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size)
            .field("virtual", &self.is_virtual())
            .finish_non_exhaustive()
    }
}

/// A CPU view of a buffer's memory.
///
/// Reads and writes go through volatile accesses because the GPU observes
/// the same memory. The mapping stays valid for as long as the owning
/// [`Buffer`] is alive, which the borrow on the accessors enforces.
pub struct Mapping {
    ptr: NonNull<u32>,
    words: usize,
}

// The mapping is plain memory shared with the device; any thread may access
// it, subject to the stream single-owner rule above this layer.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    #[inline]
    pub fn len_words(&self) -> usize {
        self.words
    }

    #[inline]
    pub fn write(&self, index: usize, value: u32) {
        assert!(index < self.words);
        // SAFETY: `index` is in bounds and the allocation outlives `self`.
        unsafe { self.ptr.as_ptr().add(index).write_volatile(value) }
    }

    pub fn write_slice(&self, index: usize, values: &[u32]) {
        assert!(index + values.len() <= self.words);
        for (offset, &value) in values.iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { self.ptr.as_ptr().add(index + offset).write_volatile(value) }
        }
    }

    #[inline]
    pub fn read(&self, index: usize) -> u32 {
        assert!(index < self.words);
        // SAFETY: `index` is in bounds and the allocation outlives `self`.
        unsafe { self.ptr.as_ptr().add(index).read_volatile() }
    }

    pub fn read_slice(&self, index: usize, out: &mut [u32]) {
        assert!(index + out.len() <= self.words);
        for (offset, slot) in out.iter_mut().enumerate() {
            // SAFETY: bounds checked above.
            *slot = unsafe { self.ptr.as_ptr().add(index + offset).read_volatile() };
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("words", &self.words)
            .finish()
    }
}

/// The process-wide "track every buffer" diagnostic list.
///
/// When enabled, every concrete buffer registers itself here at creation and
/// deregisters on drop, and every submission's buffer list is built from this
/// registry instead of per-stream tracking. Owned by the [`Device`] and
/// passed explicitly so tests can run with it on or off.
pub(crate) struct BufferRegistry {
    enabled: bool,
    entries: RwLock<Vec<BufferListEntry>>,
}

impl BufferRegistry {
    pub(crate) fn new(enabled: bool) -> Self {
        BufferRegistry {
            enabled,
            entries: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn register(&self, handle: u32, priority: u32) {
        if self.enabled {
            self.entries.write().push(BufferListEntry { handle, priority });
        }
    }

    pub(crate) fn unregister(&self, handle: u32) {
        if self.enabled {
            let mut entries = self.entries.write();
            if let Some(index) = entries.iter().position(|entry| entry.handle == handle) {
                entries.swap_remove(index);
            }
        }
    }

    /// Read access for the submission-list merge; holds off registration
    /// from other threads while a list is being assembled.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<BufferListEntry>> {
        self.entries.read()
    }
}

impl fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("enabled", &self.enabled)
            .field("len", &self.entries.read().len())
            .finish()
    }
}
