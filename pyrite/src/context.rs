//! Submission contexts.
//!
//! A [`SubmitContext`] is the scheduling identity work is submitted under:
//! one kernel context plus per-queue bookkeeping. Submissions on the same
//! queue of a context execute in submission order; everything else orders
//! only through semaphores.
//!
//! Each context owns a small GPU-visible fence region. Engines that support
//! user fences write a submission's sequence number there when it completes,
//! which is what [`queue_idle`](SubmitContext::queue_idle) reads.

use crate::{
    buffer::{Buffer, BufferCreateInfo},
    device::Device,
    engine::EngineType,
    DeviceOwned, NonExhaustive, WinsysError,
};
use parking_lot::{Mutex, MutexGuard};
use pyrite_drm::{
    AllocFlags, FenceRecord, CTX_PRIORITY_HIGH, CTX_PRIORITY_LOW, CTX_PRIORITY_NORMAL,
    CTX_PRIORITY_REALTIME, MAX_QUEUES_PER_ENGINE,
};
use std::{fmt, sync::Arc};

/// Scheduling priority of a context, relative to other contexts on the same
/// engine. Elevated priorities may require privileges; creating a context
/// with one fails with [`WinsysError::NotPermitted`] when the caller lacks
/// them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextPriority {
    Low,
    #[default]
    Normal,
    High,
    Realtime,
}

impl ContextPriority {
    fn to_kernel(self) -> u32 {
        match self {
            ContextPriority::Low => CTX_PRIORITY_LOW,
            ContextPriority::Normal => CTX_PRIORITY_NORMAL,
            ContextPriority::High => CTX_PRIORITY_HIGH,
            ContextPriority::Realtime => CTX_PRIORITY_REALTIME,
        }
    }
}

/// Parameters to create a new [`SubmitContext`].
#[derive(Clone, Debug)]
pub struct ContextCreateInfo {
    pub priority: ContextPriority,
    pub _ne: NonExhaustive,
}

impl Default for ContextCreateInfo {
    #[inline]
    fn default() -> Self {
        ContextCreateInfo { priority: ContextPriority::Normal, _ne: NonExhaustive(()) }
    }
}

/// Per-queue submission state, guarded by the queue lock.
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Lazily created sync object tracking the queue's completed work.
    /// Every real submission signals it; zero-work submissions read and
    /// retarget it.
    pub(crate) syncobj: Option<u32>,
    /// A zero-work submission imported external waits into the sync object,
    /// and the next real submission must wait on it once before executing.
    pub(crate) pending_wait: bool,
    /// Sequence number of the last submission handed to the kernel.
    pub(crate) last_seq: u64,
}

/// A kernel submission context and the queue state hanging off it.
pub struct SubmitContext {
    device: Arc<Device>,
    ctx: u32,
    priority: ContextPriority,
    queues: [[Mutex<QueueState>; MAX_QUEUES_PER_ENGINE]; EngineType::COUNT],
    /// One 64-bit completion fence per (engine, queue).
    fence_buffer: Arc<Buffer>,
}

impl SubmitContext {
    pub fn new(
        device: &Arc<Device>,
        create_info: ContextCreateInfo,
    ) -> Result<Arc<SubmitContext>, WinsysError> {
        let ContextCreateInfo { priority, _ne } = create_info;

        let ctx = device.kernel().create_context(priority.to_kernel())?;
        let fence_buffer = match Self::create_fence_buffer(device) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.kernel().destroy_context(ctx);
                return Err(err);
            }
        };

        Ok(Arc::new(SubmitContext {
            device: device.clone(),
            ctx,
            priority,
            queues: std::array::from_fn(|_| std::array::from_fn(|_| Mutex::default())),
            fence_buffer,
        }))
    }

    fn create_fence_buffer(device: &Arc<Device>) -> Result<Arc<Buffer>, WinsysError> {
        let slots = EngineType::COUNT * MAX_QUEUES_PER_ENGINE;
        let buffer = Buffer::new(
            device,
            BufferCreateInfo {
                size: (slots * 8) as u64,
                alignment: 8,
                flags: AllocFlags::GTT | AllocFlags::CPU_ACCESS,
                ..Default::default()
            },
        )?;
        let mapping = buffer.mapping().ok_or(WinsysError::OutOfHostMemory)?;
        for word in 0..slots * 2 {
            mapping.write(word, 0);
        }
        Ok(buffer)
    }

    #[inline]
    pub fn priority(&self) -> ContextPriority {
        self.priority
    }

    /// Sequence number of the last submission on the queue, zero if none.
    pub fn last_sequence(&self, engine: EngineType, queue_index: u32) -> u64 {
        self.lock_queue(engine, queue_index).last_seq
    }

    /// Whether every submission on the queue has completed.
    ///
    /// Engines without user fences give the kernel no way to report
    /// completion here; their queues always read as idle, like a queue
    /// nothing was ever submitted to.
    pub fn queue_idle(&self, engine: EngineType, queue_index: u32) -> bool {
        let last_seq = self.last_sequence(engine, queue_index);
        if last_seq == 0 {
            return true;
        }
        if !self.device.engine_info(engine).has_user_fence {
            return true;
        }
        self.fence_value(engine, queue_index) >= last_seq
    }

    #[inline]
    pub(crate) fn kernel_context(&self) -> u32 {
        self.ctx
    }

    pub(crate) fn lock_queue(
        &self,
        engine: EngineType,
        queue_index: u32,
    ) -> MutexGuard<'_, QueueState> {
        self.queues[engine.index()][queue_index as usize].lock()
    }

    /// The queue's sync object, created signaled on first use so that a wait
    /// on an idle queue is satisfied immediately.
    pub(crate) fn queue_syncobj_locked(
        &self,
        state: &mut QueueState,
    ) -> Result<u32, WinsysError> {
        if let Some(handle) = state.syncobj {
            return Ok(handle);
        }
        let handle = self.device.kernel().create_syncobj(true)?;
        state.syncobj = Some(handle);
        Ok(handle)
    }

    /// The fence record a submission to this queue attaches, if the engine
    /// supports user fences.
    pub(crate) fn fence_record(&self, engine: EngineType, queue_index: u32) -> Option<FenceRecord> {
        if !self.device.engine_info(engine).has_user_fence {
            return None;
        }
        Some(FenceRecord {
            handle: self.fence_buffer.handle(),
            _pad: 0,
            offset: Self::fence_offset(engine, queue_index),
        })
    }

    pub(crate) fn fence_buffer(&self) -> &Arc<Buffer> {
        &self.fence_buffer
    }

    /// Completed sequence number the GPU last wrote for the queue.
    pub(crate) fn fence_value(&self, engine: EngineType, queue_index: u32) -> u64 {
        let mapping = self.fence_buffer.mapping().expect("the fence region stays CPU mapped");
        let word = (Self::fence_offset(engine, queue_index) / 4) as usize;
        u64::from(mapping.read(word)) | (u64::from(mapping.read(word + 1)) << 32)
    }

    fn fence_offset(engine: EngineType, queue_index: u32) -> u64 {
        ((engine.index() * MAX_QUEUES_PER_ENGINE) as u64 + u64::from(queue_index)) * 8
    }
}

impl Drop for SubmitContext {
    fn drop(&mut self) {
        let kernel = self.device.kernel();
        for per_engine in &self.queues {
            for queue in per_engine {
                if let Some(handle) = queue.lock().syncobj.take() {
                    kernel.destroy_syncobj(handle);
                }
            }
        }
        kernel.destroy_context(self.ctx);
    }
}

unsafe impl DeviceOwned for SubmitContext {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl fmt::Debug for SubmitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitContext")
            .field("ctx", &self.ctx)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{fake_device, fake_kernel_of};

    #[test]
    fn context_lifetime_tracks_the_kernel_context() {
        let device = fake_device();
        let kernel = fake_kernel_of(&device);

        let context = SubmitContext::new(&device, Default::default()).unwrap();
        let ctx = context.kernel_context();
        assert!(kernel.is_context_live(ctx));

        drop(context);
        assert!(!kernel.is_context_live(ctx));
    }

    #[test]
    fn elevated_priority_needs_permission() {
        let device = fake_device();
        fake_kernel_of(&device).deny_elevated_priorities(true);

        let err = SubmitContext::new(
            &device,
            ContextCreateInfo { priority: ContextPriority::Realtime, ..Default::default() },
        )
        .unwrap_err();
        assert_eq!(err, WinsysError::NotPermitted);

        assert!(SubmitContext::new(&device, Default::default()).is_ok());
    }

    #[test]
    fn fresh_queues_are_idle() {
        let device = fake_device();
        let context = SubmitContext::new(&device, Default::default()).unwrap();
        assert!(context.queue_idle(EngineType::Graphics, 0));
        assert_eq!(context.last_sequence(EngineType::Compute, 3), 0);
    }

    #[test]
    fn queue_syncobj_is_created_once_and_signaled() {
        let device = fake_device();
        let kernel = fake_kernel_of(&device);
        let context = SubmitContext::new(&device, Default::default()).unwrap();

        let first = {
            let mut state = context.lock_queue(EngineType::Graphics, 0);
            context.queue_syncobj_locked(&mut state).unwrap()
        };
        let second = {
            let mut state = context.lock_queue(EngineType::Graphics, 0);
            context.queue_syncobj_locked(&mut state).unwrap()
        };
        assert_eq!(first, second);
        assert!(kernel.syncobj_value(first) > 0);

        drop(context);
        assert!(!kernel.is_syncobj_live(first));
    }

    #[test]
    fn fence_records_follow_the_queue_layout() {
        let device = fake_device();
        let context = SubmitContext::new(&device, Default::default()).unwrap();

        let record = context.fence_record(EngineType::Compute, 2).unwrap();
        assert_eq!(record.handle, context.fence_buffer().handle());
        let slot = EngineType::Compute.index() * MAX_QUEUES_PER_ENGINE + 2;
        assert_eq!(record.offset, (slot * 8) as u64);

        // Video engines have no user fence.
        assert!(context.fence_record(EngineType::VideoDecode, 0).is_none());
    }
}
