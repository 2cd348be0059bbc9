//! Synchronization primitives.
//!
//! [`Semaphore`] wraps a kernel sync object, binary or timeline, for
//! submissions to wait on and signal. [`GangSync`] orders the streams of a
//! gang (one leader plus followers submitted as a unit to different engines)
//! with counters in GPU-visible memory, since gang members cannot use
//! semaphores against each other within a single submission.

use crate::{
    buffer::{Buffer, BufferCreateInfo},
    device::Device,
    packet,
    stream::CommandStream,
    DeviceOwned, NonExhaustive, WinsysError,
};
use pyrite_drm::{AllocFlags, SyncFile};
use std::{fmt, sync::Arc};

/// Parameters to create a new [`Semaphore`].
#[derive(Clone, Debug)]
pub struct SemaphoreCreateInfo {
    /// Create a timeline semaphore, whose waits and signals carry a 64-bit
    /// point, instead of a binary one.
    pub timeline: bool,
    /// Create the semaphore already signaled. Only meaningful for binary
    /// semaphores.
    pub initially_signaled: bool,
    pub _ne: NonExhaustive,
}

impl Default for SemaphoreCreateInfo {
    #[inline]
    fn default() -> Self {
        SemaphoreCreateInfo { timeline: false, initially_signaled: false, _ne: NonExhaustive(()) }
    }
}

/// A device-level synchronization object.
pub struct Semaphore {
    device: Arc<Device>,
    handle: u32,
    timeline: bool,
}

impl Semaphore {
    pub fn new(
        device: &Arc<Device>,
        create_info: SemaphoreCreateInfo,
    ) -> Result<Arc<Semaphore>, WinsysError> {
        let SemaphoreCreateInfo { timeline, initially_signaled, _ne } = create_info;
        if timeline {
            assert!(
                device.supports_timeline_sync_objects(),
                "the kernel does not support timeline sync objects",
            );
        }
        let handle = device.kernel().create_syncobj(initially_signaled && !timeline)?;

        Ok(Arc::new(Semaphore { device: device.clone(), handle, timeline }))
    }

    #[inline]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    #[inline]
    pub fn is_timeline(&self) -> bool {
        self.timeline
    }

    /// Exports the semaphore's current state as a sync file. For timeline
    /// semaphores, `point` selects which point to export; binary semaphores
    /// pass zero.
    pub fn export_sync_file(&self, point: u64) -> Result<SyncFile, WinsysError> {
        let kernel = self.device.kernel();
        let file = if point == 0 {
            kernel.export_sync_file(self.handle)?
        } else {
            kernel.export_sync_file_at(self.handle, point)?
        };
        Ok(file)
    }

    /// Replaces the semaphore's binary state with `file`, consuming it.
    pub fn import_sync_file(&self, file: SyncFile) -> Result<(), WinsysError> {
        assert!(!self.timeline, "sync files import into binary semaphores only");
        self.device.kernel().import_sync_file(self.handle, file)?;
        Ok(())
    }

    /// The highest signaled timeline point, or zero.
    pub fn counter_value(&self) -> Result<u64, WinsysError> {
        let value = self.device.kernel().query_syncobj(self.handle)?;
        Ok(value)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.kernel().destroy_syncobj(self.handle);
    }
}

unsafe impl DeviceOwned for Semaphore {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .field("timeline", &self.timeline)
            .finish_non_exhaustive()
    }
}

/// One semaphore a submission waits on or signals.
#[derive(Clone, Debug)]
pub struct SemaphoreSubmitInfo {
    pub semaphore: Arc<Semaphore>,
    /// The timeline point to wait for or signal. Ignored for binary
    /// semaphores.
    pub value: u64,
    pub _ne: NonExhaustive,
}

impl SemaphoreSubmitInfo {
    #[inline]
    pub fn new(semaphore: Arc<Semaphore>) -> Self {
        SemaphoreSubmitInfo { semaphore, value: 0, _ne: NonExhaustive(()) }
    }
}

/// Word offsets of the two counters in the gang buffer.
const LEADER_COUNTER: usize = 0;
const FOLLOWER_COUNTER: usize = 1;

/// Cross-engine ordering for the streams of one gang submission.
///
/// The leader and follower each own a 32-bit counter in a shared buffer.
/// A member signals by bumping its counter with a write-memory packet and
/// waits by spinning until the other member's counter reaches the expected
/// value. The buffer is allocated on first use; gangs are rare.
#[derive(Debug)]
pub struct GangSync {
    device: Arc<Device>,
    buffer: Option<Arc<Buffer>>,
    leader_value: u32,
    follower_value: u32,
}

impl GangSync {
    #[inline]
    pub fn new(device: &Arc<Device>) -> GangSync {
        GangSync {
            device: device.clone(),
            buffer: None,
            leader_value: 0,
            follower_value: 0,
        }
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Emits the leader-side signal: bumps the leader counter and writes it.
    pub fn emit_leader_signal(
        &mut self,
        stream: &mut CommandStream,
    ) -> Result<(), WinsysError> {
        let buffer = self.counters(stream)?;
        self.leader_value += 1;
        let address = buffer.gpu_address() + (LEADER_COUNTER as u64) * 4;
        stream.emit_words(&packet::write_mem_packet(address, self.leader_value));
        Ok(())
    }

    /// Emits the follower-side wait for everything the leader has signaled
    /// so far.
    pub fn emit_follower_wait(
        &mut self,
        stream: &mut CommandStream,
    ) -> Result<(), WinsysError> {
        let buffer = self.counters(stream)?;
        let address = buffer.gpu_address() + (LEADER_COUNTER as u64) * 4;
        stream.emit_words(&packet::wait_mem_geq_packet(address, self.leader_value));
        Ok(())
    }

    /// Emits the follower-side signal: bumps the follower counter and writes
    /// it.
    pub fn emit_follower_signal(
        &mut self,
        stream: &mut CommandStream,
    ) -> Result<(), WinsysError> {
        let buffer = self.counters(stream)?;
        self.follower_value += 1;
        let address = buffer.gpu_address() + (FOLLOWER_COUNTER as u64) * 4;
        stream.emit_words(&packet::write_mem_packet(address, self.follower_value));
        Ok(())
    }

    /// Emits the leader-side wait for everything the follower has signaled
    /// so far.
    pub fn emit_leader_wait(&mut self, stream: &mut CommandStream) -> Result<(), WinsysError> {
        let buffer = self.counters(stream)?;
        let address = buffer.gpu_address() + (FOLLOWER_COUNTER as u64) * 4;
        stream.emit_words(&packet::wait_mem_geq_packet(address, self.follower_value));
        Ok(())
    }

    /// Zeroes both counters, in memory and in the expected values. Called
    /// when the gang's streams are finalized so the next recording starts
    /// from a known state.
    pub fn reset(&mut self) {
        if let Some(buffer) = &self.buffer {
            let mapping = buffer.mapping().expect("gang counters stay CPU mapped");
            mapping.write(LEADER_COUNTER, 0);
            mapping.write(FOLLOWER_COUNTER, 0);
        }
        self.leader_value = 0;
        self.follower_value = 0;
    }

    fn counters(&mut self, stream: &mut CommandStream) -> Result<Arc<Buffer>, WinsysError> {
        let buffer = match &self.buffer {
            Some(buffer) => buffer.clone(),
            None => {
                let buffer = Buffer::new(
                    &self.device,
                    BufferCreateInfo {
                        size: 8,
                        alignment: 8,
                        flags: AllocFlags::GTT | AllocFlags::CPU_ACCESS,
                        ..Default::default()
                    },
                )?;
                let mapping = buffer.mapping().ok_or(WinsysError::OutOfHostMemory)?;
                mapping.write(LEADER_COUNTER, 0);
                mapping.write(FOLLOWER_COUNTER, 0);
                self.buffer = Some(buffer.clone());
                buffer
            }
        };
        stream.reference_buffer(&buffer);
        Ok(buffer)
    }
}

unsafe impl DeviceOwned for GangSync {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}
