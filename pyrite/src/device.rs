//! The winsys root object.

use crate::{
    buffer::{Buffer, BufferRegistry},
    engine::{EngineInfo, EngineType},
    submit::{Clock, MonotonicClock},
    NonExhaustive,
};
use crossbeam_queue::SegQueue;
use pyrite_drm::KernelDevice;
use std::{fmt, sync::Arc};

/// Parameters to create a new [`Device`].
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// Capability and limit table, indexed by [`EngineType`]. The default
    /// describes a typical discrete part; tests shrink it freely.
    pub engines: [EngineInfo; EngineType::COUNT],
    /// Track every buffer in the diagnostic registry and build every
    /// submission's buffer list from it.
    pub debug_all_buffers: bool,
    /// The kernel supports timeline sync objects, letting waits and signals
    /// travel as (handle, point) pairs.
    pub timeline_sync_objects: bool,
    /// Time source for submission retries. Tests substitute a steppable
    /// clock here.
    pub clock: Arc<dyn Clock>,
    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            engines: EngineInfo::default_table(),
            debug_all_buffers: false,
            timeline_sync_objects: true,
            clock: Arc::new(MonotonicClock::new()),
            _ne: NonExhaustive(()),
        }
    }
}

/// An open channel to one GPU: the kernel driver handle plus the winsys
/// state shared by everything created from it.
pub struct Device {
    kernel: Arc<dyn KernelDevice>,
    engines: [EngineInfo; EngineType::COUNT],
    timeline_sync_objects: bool,
    clock: Arc<dyn Clock>,
    registry: BufferRegistry,
    segment_pool: SegmentPool,
}

impl Device {
    pub fn new(kernel: Arc<dyn KernelDevice>, create_info: DeviceCreateInfo) -> Arc<Device> {
        let DeviceCreateInfo { engines, debug_all_buffers, timeline_sync_objects, clock, _ne } =
            create_info;

        Arc::new(Device {
            kernel,
            engines,
            timeline_sync_objects,
            clock,
            registry: BufferRegistry::new(debug_all_buffers),
            segment_pool: SegmentPool::new(),
        })
    }

    #[inline]
    pub fn engine_info(&self, engine: EngineType) -> &EngineInfo {
        &self.engines[engine.index()]
    }

    #[inline]
    pub fn supports_timeline_sync_objects(&self) -> bool {
        self.timeline_sync_objects
    }

    #[inline]
    pub fn debug_all_buffers(&self) -> bool {
        self.registry.is_enabled()
    }

    #[inline]
    pub(crate) fn kernel(&self) -> &Arc<dyn KernelDevice> {
        &self.kernel
    }

    #[inline]
    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[inline]
    pub(crate) fn buffer_registry(&self) -> &BufferRegistry {
        &self.registry
    }

    #[inline]
    pub(crate) fn segment_pool(&self) -> &SegmentPool {
        &self.segment_pool
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kernel", &self.kernel)
            .field("timeline_sync_objects", &self.timeline_sync_objects)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Recycles retired command segments across streams of one device.
///
/// Stream reset pushes device-backed segments here instead of freeing them;
/// the next stream that needs a segment of compatible size pops one without
/// a kernel round trip. Lock-free so that concurrent recording threads never
/// contend on reset.
pub(crate) struct SegmentPool {
    queue: SegQueue<Arc<Buffer>>,
}

/// Keeping more spare segments than this frees them back to the kernel.
const SEGMENT_POOL_CAP: usize = 32;

impl SegmentPool {
    fn new() -> Self {
        SegmentPool { queue: SegQueue::new() }
    }

    /// Pops a pooled segment with at least `min_words` capacity. Looks at a
    /// few candidates only; misses fall back to a fresh allocation.
    pub(crate) fn acquire(&self, min_words: u32) -> Option<Arc<Buffer>> {
        for _ in 0..4 {
            let candidate = self.queue.pop()?;
            if candidate.size() / 4 >= u64::from(min_words) {
                return Some(candidate);
            }
            self.queue.push(candidate);
        }
        None
    }

    pub(crate) fn recycle(&self, buffer: Arc<Buffer>) {
        if self.queue.len() < SEGMENT_POOL_CAP {
            self.queue.push(buffer);
        }
        // Otherwise the buffer drops here and returns to the kernel.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{fake_device, fake_device_with_engines};

    #[test]
    fn engine_table_overrides_are_visible() {
        let mut engines = EngineInfo::default_table();
        engines[EngineType::Graphics.index()].initial_segment_words = 64;
        let device = fake_device_with_engines(engines);
        assert_eq!(device.engine_info(EngineType::Graphics).initial_segment_words, 64);
        assert_eq!(device.engine_info(EngineType::Compute).initial_segment_words, 4096);
    }

    #[test]
    fn segment_pool_reuses_by_capacity() {
        let device = fake_device();
        let small = crate::buffer::Buffer::new(
            &device,
            crate::buffer::BufferCreateInfo { size: 4 * 64, ..Default::default() },
        )
        .unwrap();
        let large = crate::buffer::Buffer::new(
            &device,
            crate::buffer::BufferCreateInfo { size: 4 * 4096, ..Default::default() },
        )
        .unwrap();

        let pool = device.segment_pool();
        pool.recycle(small);
        pool.recycle(large.clone());

        let got = pool.acquire(1024).unwrap();
        assert_eq!(got.handle(), large.handle());
        assert!(pool.acquire(8).is_some());
        assert!(pool.acquire(8).is_none());
    }
}
