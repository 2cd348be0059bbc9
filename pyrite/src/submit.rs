//! Submission of finalized command streams.
//!
//! [`SubmitContext::submit`] turns one or more batches of finalized
//! [`CommandStream`]s into kernel requests. How depends on the engine:
//!
//! - Chain-capable engines get a single request per batch. The trailing slot
//!   of each stream is rewritten to chain into the next, so the request
//!   carries only the first segment and the command processor follows links
//!   from there.
//! - Engines that accept several indirect buffers per request get every piece
//!   of every stream enumerated in order, split into further requests past
//!   the kernel's per-request IB limit.
//! - Engines restricted to one bounded buffer per request get their
//!   host-recorded words copied into freshly allocated bounce segments, one
//!   request per segment, whole pieces only.
//!
//! A call with no stream content is a zero-work submission: the waits are
//! folded into the queue's sync object and forwarded to the signal targets
//! without entering the kernel's scheduler.
//!
//! Consecutive requests from one call execute in sequence through scheduled
//! dependencies; the caller's waits bind to the first request and the signals
//! to the last. Transient kernel memory pressure is absorbed by a bounded
//! retry loop driven by the device's [`Clock`].

use crate::{
    bo_list::{self, BufferReferenceTable},
    buffer::{Buffer, BufferCreateInfo},
    context::{QueueState, SubmitContext},
    device::Device,
    engine::{EngineInfo, EngineType},
    stream::{CommandStream, GrowthStrategy},
    sync::SemaphoreSubmitInfo,
    DeviceOwned, NonExhaustive, WinsysError,
};
use pyrite_drm::{
    AllocFlags, BufferListEntry, IbDescriptor, IbFlags, KernelError, ScheduledDependency,
    SubmitRequest, SyncobjDescriptor, SyncobjFlags, TimelineSyncobjDescriptor,
};
use smallvec::SmallVec;
use std::{
    fmt, mem, slice,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Time source for the submission retry loop.
///
/// The default implementation reads the system's monotonic clock and really
/// sleeps; tests install a fake that advances only when slept on, making the
/// retry budget deterministic.
pub trait Clock: fmt::Debug + Send + Sync {
    /// A monotonic reading. Only differences between readings are meaningful.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

/// The system's monotonic clock.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Pause between submission attempts while the kernel reports memory
/// pressure, and the total time to keep trying before giving up.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_millis(1);
pub(crate) const RETRY_BUDGET: Duration = Duration::from_secs(1);

/// The kernel caps how many IB descriptors one request may carry.
const MAX_IBS_PER_REQUEST: usize = 192;

/// One group of streams that executes as a unit within a [`submit`] call.
///
/// [`submit`]: SubmitContext::submit
#[derive(Clone, Copy, Debug)]
pub struct SubmitBatch<'a> {
    /// Finalized streams, executed in order. Streams must target the engine
    /// and queue the batch is submitted to.
    pub streams: &'a [&'a CommandStream],
    /// Prepended once, ahead of the first stream content of the batch.
    pub initial_preamble: Option<&'a CommandStream>,
    /// Prepended to every request of the batch after the first, re-priming
    /// queue state that does not survive a request boundary.
    pub continue_preamble: Option<&'a CommandStream>,
    pub _ne: NonExhaustive,
}

impl Default for SubmitBatch<'_> {
    #[inline]
    fn default() -> Self {
        SubmitBatch {
            streams: &[],
            initial_preamble: None,
            continue_preamble: None,
            _ne: NonExhaustive(()),
        }
    }
}

/// Parameters of one [`submit`](SubmitContext::submit) call.
#[derive(Clone, Debug)]
pub struct SubmitInfo<'a> {
    /// The queue of the engine to submit to.
    pub queue_index: u32,
    /// Batches to execute, strictly in sequence. A call without stream
    /// content degenerates to a zero-work submission that only moves sync
    /// state.
    pub batches: &'a [SubmitBatch<'a>],
    /// Semaphores that must signal before the first request executes.
    pub wait_semaphores: &'a [SemaphoreSubmitInfo],
    /// Semaphores signaled when the last request completes.
    pub signal_semaphores: &'a [SemaphoreSubmitInfo],
    pub _ne: NonExhaustive,
}

impl Default for SubmitInfo<'_> {
    #[inline]
    fn default() -> Self {
        SubmitInfo {
            queue_index: 0,
            batches: &[],
            wait_semaphores: &[],
            signal_semaphores: &[],
            _ne: NonExhaustive(()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Strategy {
    Chained,
    Fallback,
    Sysmem,
}

fn select_strategy(info: &EngineInfo, batch: &SubmitBatch<'_>) -> Strategy {
    if info.uses_host_backing() {
        Strategy::Sysmem
    } else if info.supports_chaining
        && batch.streams.iter().all(|stream| stream.growth_strategy() == GrowthStrategy::Chained)
    {
        Strategy::Chained
    } else {
        Strategy::Fallback
    }
}

/// One kernel request in the making.
struct RequestPlan<'a> {
    ibs: SmallVec<[IbDescriptor; 4]>,
    tables: SmallVec<[&'a BufferReferenceTable; 4]>,
    extra: SmallVec<[BufferListEntry; 1]>,
}

/// Wait and signal descriptor arrays for one call, assembled once and
/// attached to the first and last request respectively.
#[derive(Default)]
struct SyncDescriptors {
    wait_binary: SmallVec<[SyncobjDescriptor; 4]>,
    signal_binary: SmallVec<[SyncobjDescriptor; 4]>,
    wait_timeline: SmallVec<[TimelineSyncobjDescriptor; 4]>,
    signal_timeline: SmallVec<[TimelineSyncobjDescriptor; 4]>,
    /// The queue sync object was folded into the wait side and the pending
    /// flag must be cleared once the kernel has taken the request.
    consumes_queue_wait: bool,
}

impl SubmitContext {
    /// Submits the batches in `submit_info` to a queue of `engine`.
    ///
    /// Streams must be finalized, target the named engine and queue, and are
    /// only read; they can be submitted again afterwards. A sticky recording
    /// error on any stream fails the whole call before anything reaches the
    /// kernel.
    ///
    /// Calls targeting the same queue serialize on the queue's lock; the
    /// per-stream trailing-slot rewrites are safe under it.
    pub fn submit(&self, engine: EngineType, submit_info: SubmitInfo<'_>) -> Result<(), WinsysError> {
        let SubmitInfo { queue_index, batches, wait_semaphores, signal_semaphores, _ne } =
            submit_info;
        let device = self.device();
        let info = *device.engine_info(engine);
        assert!(
            queue_index < info.queue_count,
            "queue index {} out of range for {:?} ({} queues)",
            queue_index,
            engine,
            info.queue_count,
        );

        let mut total_streams = 0usize;
        for batch in batches {
            for stream in batch.streams {
                assert_eq!(
                    (stream.engine(), stream.queue_index()),
                    (engine, queue_index),
                    "stream recorded for {:?} queue {} submitted to {:?} queue {}",
                    stream.engine(),
                    stream.queue_index(),
                    engine,
                    queue_index,
                );
                assert!(stream.is_finalized(), "only finalized streams can be submitted");
                stream.status()?;
                total_streams += 1;
            }
            for preamble in [batch.initial_preamble, batch.continue_preamble].into_iter().flatten()
            {
                assert_eq!(preamble.engine(), engine, "preamble recorded for another engine");
                assert!(preamble.is_finalized(), "only finalized streams can be submitted");
                preamble.status()?;
            }
        }

        let mut queue = self.lock_queue(engine, queue_index);

        if total_streams == 0 {
            return self.submit_zero_work(&mut queue, wait_semaphores, signal_semaphores);
        }

        let sync = self.build_sync_descriptors(&mut queue, wait_semaphores, signal_semaphores)?;

        let mut plans: Vec<RequestPlan<'_>> = Vec::new();
        let mut bounce_segments: SmallVec<[Arc<Buffer>; 2]> = SmallVec::new();
        for batch in batches {
            if batch.streams.is_empty() {
                continue;
            }
            let strategy = select_strategy(&info, batch);
            log::debug!(
                "submitting {} streams to {:?} queue {} with the {:?} strategy",
                batch.streams.len(),
                engine,
                queue_index,
                strategy,
            );
            match strategy {
                Strategy::Chained => plans.push(plan_chained(engine, queue_index, batch)),
                Strategy::Fallback => {
                    debug_assert!(info.supports_multiple_ibs);
                    plans.extend(plan_fallback(engine, queue_index, batch));
                }
                Strategy::Sysmem => {
                    let (splits, bounces) =
                        plan_sysmem(device, &info, engine, queue_index, batch)?;
                    plans.extend(splits);
                    bounce_segments.extend(bounces);
                }
            }
        }
        if plans.is_empty() {
            // Every stream finalized without recording a word; there is
            // nothing to execute, but the sync state still moves.
            return self.submit_zero_work(&mut queue, wait_semaphores, signal_semaphores);
        }

        let result = self.run_requests(engine, queue_index, &mut queue, &plans, &sync);
        // The kernel took its own references to the bounce copies; ours can
        // go now that every request has been handed over.
        drop(bounce_segments);
        result
    }

    /// Fires the planned requests in order, waits first, signals last, each
    /// later request scheduled after its predecessor.
    fn run_requests(
        &self,
        engine: EngineType,
        queue_index: u32,
        queue: &mut QueueState,
        plans: &[RequestPlan<'_>],
        sync: &SyncDescriptors,
    ) -> Result<(), WinsysError> {
        let device = self.device();
        let fence = self.fence_record(engine, queue_index);
        let last = plans.len() - 1;
        let mut previous: Option<u64> = None;

        for (index, plan) in plans.iter().enumerate() {
            let buffers =
                bo_list::build_submission_list(&plan.tables, &plan.extra, device.buffer_registry());
            let dependency = previous.map(|seq_no| ScheduledDependency {
                ip_type: engine as u32,
                ip_instance: 0,
                ring: queue_index,
                ctx_id: self.kernel_context(),
                seq_no,
            });
            let first = index == 0;
            let request = SubmitRequest {
                ip_type: engine as u32,
                ip_instance: 0,
                ring: queue_index,
                ibs: &plan.ibs,
                buffers: buffers.as_ref(),
                fence,
                dependencies: dependency.as_ref().map_or(&[][..], slice::from_ref),
                wait_syncobjs: if first { &sync.wait_binary } else { &[] },
                signal_syncobjs: if index == last { &sync.signal_binary } else { &[] },
                wait_timeline: if first { &sync.wait_timeline } else { &[] },
                signal_timeline: if index == last { &sync.signal_timeline } else { &[] },
            };

            let seq = self.submit_with_retry(&request)?;
            if first && sync.consumes_queue_wait {
                queue.pending_wait = false;
            }
            queue.last_seq = seq;
            previous = Some(seq);
        }
        Ok(())
    }

    /// Moves sync state for a call that carries no commands: the queue's sync
    /// object absorbs the waits and every signal target is retargeted to it.
    fn submit_zero_work(
        &self,
        queue: &mut QueueState,
        waits: &[SemaphoreSubmitInfo],
        signals: &[SemaphoreSubmitInfo],
    ) -> Result<(), WinsysError> {
        let kernel = self.device().kernel();
        log::debug!(
            "zero-work submission folding {} waits into {} signals",
            waits.len(),
            signals.len(),
        );

        let queue_syncobj = self.queue_syncobj_locked(queue)?;
        if !waits.is_empty() {
            let mut merged = kernel.export_sync_file(queue_syncobj)?;
            for wait in waits {
                let point = if wait.semaphore.is_timeline() { wait.value } else { 0 };
                let file = match wait.semaphore.export_sync_file(point) {
                    Ok(file) => file,
                    Err(err) => {
                        kernel.close_sync_file(merged);
                        return Err(err);
                    }
                };
                merged = kernel.merge_sync_files(merged, file)?;
            }
            kernel.import_sync_file(queue_syncobj, merged)?;
            queue.pending_wait = true;
        }

        for signal in signals {
            let point = if signal.semaphore.is_timeline() { signal.value } else { 0 };
            kernel.transfer_syncobj(signal.semaphore.handle(), point, queue_syncobj, 0)?;
        }
        Ok(())
    }

    /// Assembles the wait/signal arrays, folding in the queue's own sync
    /// object: always on the signal side so it tracks the queue's tail, and
    /// on the wait side once after a zero-work submission left a wait there.
    fn build_sync_descriptors(
        &self,
        queue: &mut QueueState,
        waits: &[SemaphoreSubmitInfo],
        signals: &[SemaphoreSubmitInfo],
    ) -> Result<SyncDescriptors, WinsysError> {
        let mut out = SyncDescriptors::default();
        let queue_syncobj = self.queue_syncobj_locked(queue)?;
        out.consumes_queue_wait = queue.pending_wait;

        if self.device().supports_timeline_sync_objects() {
            // Binary entries ride in the timeline arrays with a zero point.
            for wait in waits {
                out.wait_timeline.push(TimelineSyncobjDescriptor {
                    handle: wait.semaphore.handle(),
                    flags: SyncobjFlags::WAIT_FOR_SUBMIT.bits(),
                    point: if wait.semaphore.is_timeline() { wait.value } else { 0 },
                });
            }
            if queue.pending_wait {
                out.wait_timeline.push(TimelineSyncobjDescriptor {
                    handle: queue_syncobj,
                    flags: SyncobjFlags::WAIT_FOR_SUBMIT.bits(),
                    point: 0,
                });
            }
            for signal in signals {
                out.signal_timeline.push(TimelineSyncobjDescriptor {
                    handle: signal.semaphore.handle(),
                    flags: 0,
                    point: if signal.semaphore.is_timeline() { signal.value } else { 0 },
                });
            }
            out.signal_timeline.push(TimelineSyncobjDescriptor {
                handle: queue_syncobj,
                flags: 0,
                point: 0,
            });
        } else {
            // Timeline semaphores cannot exist on such a device; everything
            // is a binary handle.
            for wait in waits {
                out.wait_binary.push(SyncobjDescriptor { handle: wait.semaphore.handle() });
            }
            if queue.pending_wait {
                out.wait_binary.push(SyncobjDescriptor { handle: queue_syncobj });
            }
            for signal in signals {
                out.signal_binary.push(SyncobjDescriptor { handle: signal.semaphore.handle() });
            }
            out.signal_binary.push(SyncobjDescriptor { handle: queue_syncobj });
        }
        Ok(out)
    }

    /// Hands one request to the kernel, absorbing transient memory pressure
    /// by sleeping and resubmitting until the retry budget runs out.
    fn submit_with_retry(&self, request: &SubmitRequest<'_>) -> Result<u64, WinsysError> {
        let device = self.device();
        let kernel = device.kernel();
        let clock = device.clock();
        let start = clock.now();
        let mut retried = false;
        loop {
            match kernel.submit(self.kernel_context(), request) {
                Ok(seq) => return Ok(seq),
                Err(KernelError::NoMemory) => {
                    if clock.now().saturating_sub(start) >= RETRY_BUDGET {
                        log::error!(
                            "kernel kept reporting memory pressure for {RETRY_BUDGET:?}; \
                            giving up on the submission"
                        );
                        return Err(WinsysError::OutOfHostMemory);
                    }
                    if !retried {
                        log::warn!("kernel is under memory pressure, retrying the submission");
                        retried = true;
                    }
                    clock.sleep(RETRY_INTERVAL);
                }
                Err(KernelError::InvalidInput) => {
                    log::error!("the kernel rejected a submission as malformed");
                    return Err(WinsysError::Unknown);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn describe_ib(
    engine: EngineType,
    queue_index: u32,
    gpu_address: u64,
    size_dw: u32,
    flags: IbFlags,
) -> IbDescriptor {
    IbDescriptor {
        flags: flags.bits(),
        size_dw,
        gpu_address,
        ip_type: engine as u32,
        ip_instance: 0,
        ring: queue_index,
        _pad: 0,
    }
}

fn preamble_ibs(
    preamble: Option<&CommandStream>,
    engine: EngineType,
    queue_index: u32,
) -> SmallVec<[IbDescriptor; 2]> {
    let mut out = SmallVec::new();
    if let Some(stream) = preamble {
        for (gpu_address, size_dw) in stream.ib_descriptors() {
            out.push(describe_ib(engine, queue_index, gpu_address, size_dw, IbFlags::PREAMBLE));
        }
    }
    out
}

/// Rewrites the trailing slots back to front so each stream falls through to
/// the next and the last one terminates, then plans a single request around
/// the first stream's first segment.
fn plan_chained<'a>(
    engine: EngineType,
    queue_index: u32,
    batch: &SubmitBatch<'a>,
) -> RequestPlan<'a> {
    let mut target: Option<(u64, u32)> = None;
    for stream in batch.streams.iter().rev() {
        stream.patch_trailing_chain(target);
        let (gpu_address, size_dw) = stream.ib_descriptors()[0];
        target = Some((gpu_address, size_dw));
    }

    let mut ibs: SmallVec<[IbDescriptor; 4]> =
        SmallVec::from_iter(preamble_ibs(batch.initial_preamble, engine, queue_index));
    let (gpu_address, size_dw) = target.expect("the batch was checked non-empty");
    ibs.push(describe_ib(engine, queue_index, gpu_address, size_dw, IbFlags::empty()));

    let mut tables: SmallVec<[&'a BufferReferenceTable; 4]> = SmallVec::new();
    if let Some(preamble) = batch.initial_preamble {
        tables.push(preamble.buffer_references());
    }
    for stream in batch.streams {
        tables.push(stream.buffer_references());
    }
    RequestPlan { ibs, tables, extra: SmallVec::new() }
}

/// Enumerates every piece of every stream as its own IB descriptor, splitting
/// into further requests when the kernel's per-request limit is hit.
fn plan_fallback<'a>(
    engine: EngineType,
    queue_index: u32,
    batch: &SubmitBatch<'a>,
) -> SmallVec<[RequestPlan<'a>; 1]> {
    let mut content: SmallVec<[IbDescriptor; 8]> = SmallVec::new();
    for stream in batch.streams {
        // A trailing link left behind by an earlier chained submission would
        // leak execution into a stream that is no longer next.
        if stream.growth_strategy() == GrowthStrategy::Chained {
            stream.patch_trailing_chain(None);
        }
        for (gpu_address, size_dw) in stream.ib_descriptors() {
            content.push(describe_ib(engine, queue_index, gpu_address, size_dw, IbFlags::empty()));
        }
    }

    let mut plans: SmallVec<[RequestPlan<'a>; 1]> = SmallVec::new();
    if content.is_empty() {
        return plans;
    }

    let initial = preamble_ibs(batch.initial_preamble, engine, queue_index);
    let cont = preamble_ibs(batch.continue_preamble, engine, queue_index);
    let mut tables: SmallVec<[&'a BufferReferenceTable; 4]> = SmallVec::new();
    for preamble in [batch.initial_preamble, batch.continue_preamble].into_iter().flatten() {
        tables.push(preamble.buffer_references());
    }
    for stream in batch.streams {
        tables.push(stream.buffer_references());
    }

    let mut at = 0;
    while at < content.len() {
        let lead = if plans.is_empty() { &initial } else { &cont };
        assert!(
            lead.len() < MAX_IBS_PER_REQUEST,
            "a {}-piece preamble leaves no room in a {}-descriptor request",
            lead.len(),
            MAX_IBS_PER_REQUEST,
        );
        let take = (MAX_IBS_PER_REQUEST - lead.len()).min(content.len() - at);
        let mut ibs: SmallVec<[IbDescriptor; 4]> = SmallVec::new();
        ibs.extend_from_slice(lead);
        ibs.extend_from_slice(&content[at..at + take]);
        plans.push(RequestPlan { ibs, tables: tables.clone(), extra: SmallVec::new() });
        at += take;
    }
    plans
}

/// Packs the host-recorded words into bounce segments no larger than the
/// engine's ceiling, whole pieces only, one request per segment. Returns the
/// plans plus the bounce allocations that must outlive the kernel calls.
#[allow(clippy::type_complexity)]
fn plan_sysmem<'a>(
    device: &Arc<Device>,
    info: &EngineInfo,
    engine: EngineType,
    queue_index: u32,
    batch: &SubmitBatch<'a>,
) -> Result<(SmallVec<[RequestPlan<'a>; 1]>, SmallVec<[Arc<Buffer>; 1]>), WinsysError> {
    let ceiling = (info.max_segment_words & !info.pad_mask()) as usize;

    struct Split<'w> {
        chunks: SmallVec<[&'w [u32]; 8]>,
        words: usize,
        /// At least one stream chunk landed here; lead-in alone is dropped.
        content: bool,
    }

    let mut lead_in: SmallVec<[&'a [u32]; 8]> = SmallVec::new();
    if let Some(stream) = batch.continue_preamble {
        lead_in.extend(stream.host_chunks());
    }
    let lead_in_words: usize = lead_in.iter().map(|chunk| chunk.len()).sum();

    let mut splits: Vec<Split<'a>> = Vec::new();
    let mut open = Split { chunks: SmallVec::new(), words: 0, content: false };
    if let Some(stream) = batch.initial_preamble {
        for chunk in stream.host_chunks() {
            open.words += chunk.len();
            open.chunks.push(chunk);
        }
    }
    for stream in batch.streams {
        for chunk in stream.host_chunks() {
            if open.words + chunk.len() > ceiling && open.content {
                splits.push(mem::replace(
                    &mut open,
                    Split { chunks: lead_in.clone(), words: lead_in_words, content: false },
                ));
            }
            if open.words + chunk.len() > ceiling {
                log::warn!(
                    "a {}-word stream piece does not fit a {ceiling}-word bounce segment of \
                    the {:?} engine",
                    chunk.len(),
                    engine,
                );
                return Err(WinsysError::OutOfDeviceMemory);
            }
            open.words += chunk.len();
            open.chunks.push(chunk);
            open.content = true;
        }
    }
    if open.content {
        splits.push(open);
    }

    let mut tables: SmallVec<[&'a BufferReferenceTable; 4]> = SmallVec::new();
    for preamble in [batch.initial_preamble, batch.continue_preamble].into_iter().flatten() {
        tables.push(preamble.buffer_references());
    }
    for stream in batch.streams {
        tables.push(stream.buffer_references());
    }

    let mut plans: SmallVec<[RequestPlan<'a>; 1]> = SmallVec::new();
    let mut bounces: SmallVec<[Arc<Buffer>; 1]> = SmallVec::new();
    for split in splits {
        // Chunks are individually padded, so their concatenation stays
        // aligned.
        debug_assert_eq!(split.words as u32 & info.pad_mask(), 0);
        let buffer = Buffer::new(
            device,
            BufferCreateInfo {
                size: (split.words * 4) as u64,
                alignment: 4096,
                flags: AllocFlags::GTT | AllocFlags::CPU_ACCESS | AllocFlags::EXEC,
                ..Default::default()
            },
        )?;
        let mapping = buffer.mapping().ok_or(WinsysError::OutOfHostMemory)?;
        let mut at = 0;
        for chunk in &split.chunks {
            mapping.write_slice(at, chunk);
            at += chunk.len();
        }

        let mut ibs: SmallVec<[IbDescriptor; 4]> = SmallVec::new();
        ibs.push(describe_ib(
            engine,
            queue_index,
            buffer.gpu_address(),
            split.words as u32,
            IbFlags::empty(),
        ));
        let mut extra: SmallVec<[BufferListEntry; 1]> = SmallVec::new();
        extra.push(BufferListEntry { handle: buffer.handle(), priority: buffer.priority() });
        plans.push(RequestPlan { ibs, tables: tables.clone(), extra });
        bounces.push(buffer);
    }
    Ok((plans, bounces))
}
