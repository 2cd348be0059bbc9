//! Command streams.
//!
//! A [`CommandStream`] is an append-only buffer of packet words that the
//! driver records into and later hands to [`submit`](crate::submit) for
//! execution. Storage is segmented: recording starts in one segment and grows
//! into further segments on demand. How a stream grows is fixed at creation
//! by its [`GrowthStrategy`]:
//!
//! - [`Chained`](GrowthStrategy::Chained) streams link device segments with
//!   chain packets that the command processor follows on its own, so a fully
//!   recorded stream is executable from its first segment alone.
//! - [`OverflowList`](GrowthStrategy::OverflowList) streams retire filled
//!   pieces into an ordered list for submission to enumerate, either as
//!   separate indirect buffers or by bounce-copying host pieces into device
//!   memory.
//!
//! Failures while recording do not surface at the recording call sites.
//! A stream that fails to grow enters a sticky error state, further emission
//! is dropped, and the error is reported when the stream is finalized or
//! submitted. A failed stream still finalizes into a well-formed buffer.
//!
//! A stream is single-owner: recording takes `&mut self` and is not
//! synchronized. Submission of finalized streams is the one multi-stream
//! operation, and the queue lock in [`submit`](crate::submit) serializes it.

use crate::{
    bo_list::BufferReferenceTable,
    buffer::{Buffer, BufferCreateInfo},
    device::Device,
    engine::{EngineInfo, EngineType},
    packet, DeviceOwned, NonExhaustive, WinsysError,
};
use pyrite_drm::AllocFlags;
use smallvec::{smallvec, SmallVec};
use std::{cell::Cell, mem, sync::Arc};

/// Kernel residency priority for command stream segments.
const SEGMENT_BUFFER_PRIORITY: u32 = 12;

/// How a stream acquires space once its current segment is full. Selected
/// once at creation from the engine's capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowthStrategy {
    /// A chain packet at the tail of the old segment redirects the command
    /// processor to the new one. Only engines that execute chain packets
    /// support this.
    Chained,
    /// Filled pieces retire into an ordered overflow list and recording
    /// restarts in a fresh piece. Submission stitches the pieces back
    /// together.
    OverflowList,
}

/// Parameters to create a new [`CommandStream`].
#[derive(Clone, Debug)]
pub struct CommandStreamCreateInfo {
    /// The engine the stream will be submitted to.
    pub engine: EngineType,
    /// The queue of that engine the stream targets.
    pub queue_index: u32,
    /// Permit the chained growth strategy if the engine supports it. Streams
    /// recorded for reuse inside other streams turn this off so that their
    /// contents stay position-independent.
    pub allow_chaining: bool,
    pub _ne: NonExhaustive,
}

impl Default for CommandStreamCreateInfo {
    #[inline]
    fn default() -> Self {
        CommandStreamCreateInfo {
            engine: EngineType::Graphics,
            queue_index: 0,
            allow_chaining: true,
            _ne: NonExhaustive(()),
        }
    }
}

/// Where the final length of the segment being recorded will be written once
/// it is known.
#[derive(Clone, Copy, Debug)]
enum LengthSlot {
    /// First segment: the length goes into the submission descriptor.
    Descriptor,
    /// The control word of the chain packet at `word` in retired piece
    /// `piece`, which was emitted with a zero size field.
    ChainControl { piece: usize, word: usize },
}

/// Backing store the write cursor currently appends into.
#[derive(Debug)]
enum Backing {
    Device { buffer: Arc<Buffer>, capacity: u32 },
    Host { words: Vec<u32>, capacity: u32 },
}

/// A filled, immutable piece of a stream.
///
/// Device pieces stay allocated until [`CommandStream::reset`] because
/// in-flight submissions may still execute from them.
#[derive(Debug)]
pub(crate) enum StreamPiece {
    Device { buffer: Arc<Buffer>, len: u32 },
    Host { words: Vec<u32> },
}

/// An append-only, segmented packet buffer targeting one engine queue.
#[derive(Debug)]
pub struct CommandStream {
    device: Arc<Device>,
    engine: EngineType,
    queue_index: u32,
    info: EngineInfo,
    growth: GrowthStrategy,
    status: Result<(), WinsysError>,
    finalized: bool,
    /// Write position in the current backing, in words.
    cursor: u32,
    current: Backing,
    retired: Vec<StreamPiece>,
    length_slot: LengthSlot,
    /// Final length of the first segment, once known.
    first_len: u32,
    /// The trailing slot currently holds a chain packet written by
    /// submission rather than padding.
    chained_to: Cell<bool>,
    references: BufferReferenceTable,
}

impl CommandStream {
    pub fn new(
        device: &Arc<Device>,
        create_info: CommandStreamCreateInfo,
    ) -> Result<CommandStream, WinsysError> {
        let CommandStreamCreateInfo { engine, queue_index, allow_chaining, _ne } = create_info;
        let info = *device.engine_info(engine);
        assert!(
            queue_index < info.queue_count,
            "queue index {} out of range for {:?} ({} queues)",
            queue_index,
            engine,
            info.queue_count,
        );

        let growth = if info.supports_chaining && allow_chaining {
            GrowthStrategy::Chained
        } else {
            GrowthStrategy::OverflowList
        };

        let mask = info.pad_mask();
        let mut references = BufferReferenceTable::new();
        let current = if info.uses_host_backing() {
            let capacity = info.initial_segment_words & !mask;
            Backing::Host { words: Vec::with_capacity(capacity as usize), capacity }
        } else {
            let buffer = Self::allocate_segment(device, info.initial_segment_words)?;
            let capacity = (buffer.size() / 4) as u32 & !mask;
            references.add(buffer.handle(), buffer.priority());
            Backing::Device { buffer, capacity }
        };

        Ok(CommandStream {
            device: device.clone(),
            engine,
            queue_index,
            info,
            growth,
            status: Ok(()),
            finalized: false,
            cursor: 0,
            current,
            retired: Vec::new(),
            length_slot: LengthSlot::Descriptor,
            first_len: 0,
            chained_to: Cell::new(false),
            references,
        })
    }

    #[inline]
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    #[inline]
    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    #[inline]
    pub fn growth_strategy(&self) -> GrowthStrategy {
        self.growth
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The sticky stream status. Once recording fails, every later operation
    /// on the stream reports the same error until [`reset`](Self::reset).
    #[inline]
    pub fn status(&self) -> Result<(), WinsysError> {
        self.status
    }

    /// Total words recorded so far, including padding and chain packets.
    pub fn word_count(&self) -> u32 {
        let retired: u32 = self
            .retired
            .iter()
            .map(|piece| match piece {
                StreamPiece::Device { len, .. } => *len,
                StreamPiece::Host { words } => words.len() as u32,
            })
            .sum();
        retired + self.cursor
    }

    /// The buffers this stream references, for submission to pass to the
    /// kernel.
    #[inline]
    pub fn buffer_references(&self) -> &BufferReferenceTable {
        &self.references
    }

    /// Marks `buffer` as read or written by this stream's packets.
    ///
    /// Virtual buffers are recorded as such; their concrete members are only
    /// resolved when a submission builds its buffer list.
    pub fn reference_buffer(&mut self, buffer: &Arc<Buffer>) {
        if buffer.is_virtual() {
            self.references.add_virtual(buffer);
        } else {
            self.references.add(buffer.handle(), buffer.priority());
        }
    }

    /// Makes every buffer referenced by `other` also referenced by `self`.
    pub fn merge_buffer_references(&mut self, other: &CommandStream) {
        self.references.merge_from(&other.references);
    }

    /// Guarantees that `words` more words can be emitted without further
    /// allocation, growing the stream if needed.
    ///
    /// Does not report failure: a stream that cannot grow enters a sticky
    /// error state and subsequent emission is dropped. The error surfaces
    /// from [`finalize`](Self::finalize) and from submission.
    ///
    /// # Panics
    ///
    /// Panics if the stream is finalized.
    pub fn ensure_space(&mut self, words: u32) {
        assert!(!self.finalized, "cannot record into a finalized command stream");
        if self.status.is_err() {
            return;
        }
        if self.cursor.saturating_add(words) <= self.usable_capacity() {
            return;
        }
        if let Err(err) = self.grow(words) {
            self.status = Err(err);
        }
    }

    /// Appends one word.
    #[inline]
    pub fn emit(&mut self, word: u32) {
        self.emit_words(&[word]);
    }

    /// Appends a packet's worth of words.
    ///
    /// # Panics
    ///
    /// Panics if the stream is finalized.
    pub fn emit_words(&mut self, words: &[u32]) {
        if words.is_empty() {
            return;
        }
        self.ensure_space(words.len() as u32);
        if self.status.is_err() {
            return;
        }
        self.write_current(words);
    }

    /// Pads with the engine's pad word until the cursor is a multiple of
    /// `alignment` words. `alignment` must be a power of two no larger than
    /// the engine's own alignment.
    pub fn pad_to_alignment(&mut self, alignment: u32) {
        assert!(alignment.is_power_of_two());
        let mask = alignment - 1;
        while self.cursor & mask != 0 {
            self.emit(self.info.pad_word);
        }
    }

    /// Ends recording.
    ///
    /// Pads the stream to the engine's alignment; chained streams
    /// additionally end in a patchable slot of pad words that submission can
    /// rewrite into a chain packet linking to the next stream. After this,
    /// emission panics until [`reset`](Self::reset).
    ///
    /// Returns the sticky stream status. A stream that failed to grow still
    /// finalizes into a well-formed buffer of what was recorded before the
    /// failure.
    pub fn finalize(&mut self) -> Result<(), WinsysError> {
        if !self.finalized {
            let mask = self.info.pad_mask();
            match self.growth {
                GrowthStrategy::Chained => {
                    // Leave exactly four words after padding so that the
                    // trailing slot ends on an alignment boundary.
                    while self.cursor == 0 || (self.cursor & mask) != mask - 3 {
                        self.write_current(&[self.info.pad_word]);
                    }
                    self.write_current(&packet::nop_slot());
                    self.resolve_length_slot(self.cursor);
                }
                GrowthStrategy::OverflowList => {
                    while self.cursor & mask != 0 {
                        self.write_current(&[self.info.pad_word]);
                    }
                    if let LengthSlot::Descriptor = self.length_slot {
                        self.first_len = self.cursor;
                    }
                }
            }
            self.finalized = true;
        }
        self.status
    }

    /// Rewinds the stream for a fresh recording.
    ///
    /// Retired device segments return to the device's segment pool, retired
    /// host pieces are freed, the reference table is cleared and the sticky
    /// status resets to success. The current segment is kept.
    pub fn reset(&mut self) {
        for piece in self.retired.drain(..) {
            if let StreamPiece::Device { buffer, .. } = piece {
                self.device.segment_pool().recycle(buffer);
            }
        }
        if let Backing::Host { words, .. } = &mut self.current {
            words.clear();
        }
        self.cursor = 0;
        self.finalized = false;
        self.status = Ok(());
        self.length_slot = LengthSlot::Descriptor;
        self.first_len = 0;
        self.chained_to.set(false);
        self.references.clear();
        if let Backing::Device { buffer, .. } = &self.current {
            let (handle, priority) = (buffer.handle(), buffer.priority());
            self.references.add(handle, priority);
        }
    }

    /// Replays a finalized stream inside this one.
    ///
    /// When `allow_hw_chain` is set, both streams are chained and `other`
    /// fits in a single segment, this emits one launch packet referencing
    /// `other`'s memory in place. Otherwise `other`'s words are copied in,
    /// with the chain packets and trailing slots that only made sense in its
    /// own segmentation stripped. Either way `other`'s buffer references are
    /// merged into this stream.
    ///
    /// # Panics
    ///
    /// Panics if `other` is not finalized or targets a different engine.
    pub fn append_stream(&mut self, other: &CommandStream, allow_hw_chain: bool) {
        assert!(other.finalized, "appended streams must be finalized");
        assert_eq!(self.engine, other.engine, "appended streams must share the engine");
        if self.status.is_err() {
            return;
        }
        if let Err(err) = other.status {
            self.status = Err(err);
            return;
        }

        let launch = allow_hw_chain
            && self.growth == GrowthStrategy::Chained
            && other.growth == GrowthStrategy::Chained
            && other.retired.is_empty();
        if launch {
            let packet = packet::launch_packet(other.first_segment_address(), other.first_len);
            self.emit_words(&packet);
        } else {
            // Chained pieces end in four link words (a chain packet, or the
            // patchable slot on the last piece) that must not leak into the
            // copy.
            let strip = if other.growth == GrowthStrategy::Chained {
                packet::CHAIN_PACKET_WORDS
            } else {
                0
            };
            let mut scratch = Vec::new();
            for piece in &other.retired {
                match piece {
                    StreamPiece::Device { buffer, len } => {
                        self.copy_device_words(buffer, len - strip, &mut scratch);
                    }
                    StreamPiece::Host { words } => self.emit_words(words),
                }
            }
            match &other.current {
                Backing::Device { buffer, .. } => {
                    self.copy_device_words(buffer, other.cursor - strip, &mut scratch);
                }
                Backing::Host { words, .. } => self.emit_words(&words[..other.cursor as usize]),
            }
        }
        self.references.merge_from(&other.references);
    }

    /// The indirect buffers a finalized stream submits as, in execution
    /// order. Chained streams yield one descriptor, the first segment;
    /// host-backed streams yield none and are submitted through
    /// [`host_chunks`](Self::host_chunks) instead.
    pub(crate) fn ib_descriptors(&self) -> SmallVec<[(u64, u32); 4]> {
        debug_assert!(self.finalized);
        match self.growth {
            GrowthStrategy::Chained => smallvec![(self.first_segment_address(), self.first_len)],
            GrowthStrategy::OverflowList => {
                let mut out = SmallVec::new();
                for piece in &self.retired {
                    if let StreamPiece::Device { buffer, len } = piece {
                        out.push((buffer.gpu_address(), *len));
                    }
                }
                if let Backing::Device { buffer, .. } = &self.current {
                    if self.cursor > 0 {
                        out.push((buffer.gpu_address(), self.cursor));
                    }
                }
                out
            }
        }
    }

    /// The recorded words of a host-backed stream, in order. Each chunk is
    /// already padded to the engine's alignment.
    pub(crate) fn host_chunks(&self) -> SmallVec<[&[u32]; 4]> {
        let mut out = SmallVec::new();
        for piece in &self.retired {
            if let StreamPiece::Host { words } = piece {
                out.push(words.as_slice());
            }
        }
        if let Backing::Host { words, .. } = &self.current {
            if !words.is_empty() {
                out.push(words.as_slice());
            }
        }
        out
    }

    /// Flattened view of every recorded word in recording order, chain links
    /// and padding included.
    #[cfg(test)]
    pub(crate) fn recorded_words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.word_count() as usize);
        for piece in &self.retired {
            match piece {
                StreamPiece::Device { buffer, len } => {
                    let at = out.len();
                    out.resize(at + *len as usize, 0);
                    let mapping = buffer.mapping().expect("command segments stay CPU mapped");
                    mapping.read_slice(0, &mut out[at..]);
                }
                StreamPiece::Host { words } => out.extend_from_slice(words),
            }
        }
        match &self.current {
            Backing::Device { buffer, .. } => {
                let at = out.len();
                out.resize(at + self.cursor as usize, 0);
                let mapping = buffer.mapping().expect("command segments stay CPU mapped");
                mapping.read_slice(0, &mut out[at..]);
            }
            Backing::Host { words, .. } => out.extend_from_slice(words),
        }
        out
    }

    /// Rewrites the trailing slot of a finalized chained stream.
    ///
    /// `Some((address, length))` patches in a chain packet so execution
    /// continues at another stream's first segment; `None` restores the pad
    /// words. Submission calls this under the queue lock, which is what makes
    /// the `&self` mutation of mapped memory sound.
    pub(crate) fn patch_trailing_chain(&self, target: Option<(u64, u32)>) {
        debug_assert!(self.finalized);
        debug_assert_eq!(self.growth, GrowthStrategy::Chained);
        let Backing::Device { buffer, .. } = &self.current else {
            unreachable!("chained streams are device backed");
        };
        let mapping = buffer.mapping().expect("command segments stay CPU mapped");
        let slot = (self.cursor - packet::CHAIN_PACKET_WORDS) as usize;
        match target {
            Some((address, length)) => {
                mapping.write_slice(slot, &packet::chain_packet(address, length));
                self.chained_to.set(true);
            }
            None => {
                if self.chained_to.replace(false) {
                    mapping.write_slice(slot, &packet::nop_slot());
                }
            }
        }
    }

    /// Address of the segment execution starts in.
    pub(crate) fn first_segment_address(&self) -> u64 {
        match self.retired.first() {
            Some(StreamPiece::Device { buffer, .. }) => buffer.gpu_address(),
            Some(StreamPiece::Host { .. }) => 0,
            None => match &self.current {
                Backing::Device { buffer, .. } => buffer.gpu_address(),
                Backing::Host { .. } => 0,
            },
        }
    }

    fn usable_capacity(&self) -> u32 {
        let capacity = match &self.current {
            Backing::Device { capacity, .. } | Backing::Host { capacity, .. } => *capacity,
        };
        match self.growth {
            GrowthStrategy::Chained => capacity - packet::CHAIN_PACKET_WORDS,
            GrowthStrategy::OverflowList => capacity,
        }
    }

    /// Writes into the current backing without space or state checks. The
    /// caller guarantees capacity.
    fn write_current(&mut self, words: &[u32]) {
        match &mut self.current {
            Backing::Device { buffer, .. } => {
                let mapping = buffer.mapping().expect("command segments stay CPU mapped");
                mapping.write_slice(self.cursor as usize, words);
            }
            Backing::Host { words: buf, .. } => buf.extend_from_slice(words),
        }
        self.cursor += words.len() as u32;
    }

    fn resolve_length_slot(&mut self, len: u32) {
        match self.length_slot {
            LengthSlot::Descriptor => self.first_len = len,
            LengthSlot::ChainControl { piece, word } => {
                let StreamPiece::Device { buffer, .. } = &self.retired[piece] else {
                    unreachable!("chain links live in device pieces");
                };
                let mapping = buffer.mapping().expect("command segments stay CPU mapped");
                mapping.write(word, mapping.read(word) | len);
            }
        }
    }

    fn grow(&mut self, needed: u32) -> Result<(), WinsysError> {
        match (self.growth, &self.current) {
            (GrowthStrategy::Chained, _) => self.grow_chained(needed),
            (GrowthStrategy::OverflowList, Backing::Device { .. }) => {
                self.grow_overflow_device(needed)
            }
            (GrowthStrategy::OverflowList, Backing::Host { .. }) => self.grow_overflow_host(needed),
        }
    }

    /// Links a fresh segment from the tail of the current one.
    fn grow_chained(&mut self, needed: u32) -> Result<(), WinsysError> {
        let new_capacity = self.grown_segment_words(needed)?;
        let buffer = Self::allocate_segment(&self.device, new_capacity)?;
        let mask = self.info.pad_mask();
        let capacity = (buffer.size() / 4) as u32 & !mask;

        // Pad so the chain packet ends the segment on an alignment boundary,
        // then write it with a zero size field. The size of the new segment
        // is only known when it in turn fills up or the stream finalizes.
        while self.cursor == 0 || (self.cursor & mask) != mask - 3 {
            self.write_current(&[self.info.pad_word]);
        }
        let old_len = self.cursor + packet::CHAIN_PACKET_WORDS;
        self.resolve_length_slot(old_len);
        self.write_current(&packet::chain_packet(buffer.gpu_address(), 0));

        let (handle, priority) = (buffer.handle(), buffer.priority());
        let old = mem::replace(&mut self.current, Backing::Device { buffer, capacity });
        let Backing::Device { buffer: old_buffer, .. } = old else {
            unreachable!("chained streams are device backed");
        };
        self.retired.push(StreamPiece::Device { buffer: old_buffer, len: old_len });
        self.length_slot =
            LengthSlot::ChainControl { piece: self.retired.len() - 1, word: old_len as usize - 1 };
        self.cursor = 0;
        self.references.add(handle, priority);
        Ok(())
    }

    /// Retires the current device segment to the overflow list and starts a
    /// fresh one.
    fn grow_overflow_device(&mut self, needed: u32) -> Result<(), WinsysError> {
        let new_capacity = self.grown_segment_words(needed)?;
        let buffer = Self::allocate_segment(&self.device, new_capacity)?;
        let mask = self.info.pad_mask();
        let capacity = (buffer.size() / 4) as u32 & !mask;

        while self.cursor & mask != 0 {
            self.write_current(&[self.info.pad_word]);
        }
        let len = self.cursor;
        let (handle, priority) = (buffer.handle(), buffer.priority());
        let old = mem::replace(&mut self.current, Backing::Device { buffer, capacity });
        let Backing::Device { buffer: old_buffer, .. } = old else {
            unreachable!("this growth path is device backed");
        };
        if len > 0 {
            self.retired.push(StreamPiece::Device { buffer: old_buffer, len });
        } else {
            // Nothing was recorded into it; hand it straight back.
            self.device.segment_pool().recycle(old_buffer);
        }
        self.cursor = 0;
        self.references.add(handle, priority);
        Ok(())
    }

    /// Enlarges the current host piece in place, or retires it once it hits
    /// the engine's size ceiling.
    fn grow_overflow_host(&mut self, needed: u32) -> Result<(), WinsysError> {
        let info = &self.info;
        let mask = info.pad_mask();
        let ceiling = info.max_segment_words & !mask;
        let Backing::Host { words, capacity } = &mut self.current else {
            unreachable!("this growth path is host backed");
        };

        let request = self.cursor.saturating_add(needed);
        if request <= ceiling {
            let doubled = capacity.saturating_mul(2).min(ceiling);
            let floor = info.initial_segment_words.min(ceiling);
            let target = ((request.max(doubled).max(floor) + mask) & !mask).min(ceiling);
            words.reserve(target as usize - words.len());
            *capacity = target;
            return Ok(());
        }
        if needed > ceiling {
            log::warn!(
                "a single {needed}-word packet exceeds the {ceiling}-word segment ceiling of \
                the {:?} engine",
                self.engine,
            );
            return Err(WinsysError::OutOfDeviceMemory);
        }

        while self.cursor & mask != 0 {
            words.push(info.pad_word);
            self.cursor += 1;
        }
        let retired_words = mem::take(words);
        let fresh = ((needed.max(info.initial_segment_words.min(ceiling)) + mask) & !mask)
            .min(ceiling);
        *words = Vec::with_capacity(fresh as usize);
        *capacity = fresh;
        self.retired.push(StreamPiece::Host { words: retired_words });
        self.cursor = 0;
        Ok(())
    }

    /// Sizes the next device segment: big enough for the pending packet and
    /// its footer, doubling the current capacity up to the engine ceiling.
    fn grown_segment_words(&self, needed: u32) -> Result<u32, WinsysError> {
        let info = &self.info;
        let mask = info.pad_mask();
        let ceiling = info.max_segment_words & !mask;
        let footer = match self.growth {
            GrowthStrategy::Chained => packet::CHAIN_PACKET_WORDS,
            GrowthStrategy::OverflowList => 0,
        };
        let request = needed.saturating_add(footer);
        if request > ceiling {
            log::warn!(
                "a single {needed}-word packet exceeds the {ceiling}-word segment ceiling of \
                the {:?} engine",
                self.engine,
            );
            return Err(WinsysError::OutOfDeviceMemory);
        }
        let capacity = match &self.current {
            Backing::Device { capacity, .. } | Backing::Host { capacity, .. } => *capacity,
        };
        let doubled = capacity.saturating_mul(2).min(ceiling);
        let floor = info.initial_segment_words.min(ceiling);
        Ok(((request.max(doubled).max(floor) + mask) & !mask).min(ceiling))
    }

    fn allocate_segment(device: &Arc<Device>, words: u32) -> Result<Arc<Buffer>, WinsysError> {
        if let Some(buffer) = device.segment_pool().acquire(words) {
            return Ok(buffer);
        }
        let buffer = Buffer::new(
            device,
            BufferCreateInfo {
                size: u64::from(words) * 4,
                alignment: 4096,
                flags: AllocFlags::GTT | AllocFlags::CPU_ACCESS | AllocFlags::EXEC,
                priority: SEGMENT_BUFFER_PRIORITY,
                ..Default::default()
            },
        )?;
        if buffer.mapping().is_none() {
            return Err(WinsysError::OutOfHostMemory);
        }
        Ok(buffer)
    }

    fn copy_device_words(&mut self, buffer: &Arc<Buffer>, len: u32, scratch: &mut Vec<u32>) {
        let mapping = buffer.mapping().expect("command segments stay CPU mapped");
        scratch.resize(len as usize, 0);
        mapping.read_slice(0, scratch);
        self.emit_words(scratch);
    }
}

unsafe impl DeviceOwned for CommandStream {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineInfo,
        packet,
        tests::{fake_device, fake_device_with_engines, fake_kernel_of},
    };

    fn tiny_graphics_engines(initial: u32, max: u32) -> [EngineInfo; EngineType::COUNT] {
        let mut engines = EngineInfo::default_table();
        let gfx = &mut engines[EngineType::Graphics.index()];
        gfx.align_words = 4;
        gfx.initial_segment_words = initial;
        gfx.max_segment_words = max;
        engines
    }

    fn device_piece_words(piece: &StreamPiece) -> Vec<u32> {
        let StreamPiece::Device { buffer, len } = piece else {
            panic!("expected a device piece");
        };
        let mut words = vec![0; *len as usize];
        buffer.mapping().unwrap().read_slice(0, &mut words);
        words
    }

    fn current_words(stream: &CommandStream) -> Vec<u32> {
        match &stream.current {
            Backing::Device { buffer, .. } => {
                let mut words = vec![0; stream.cursor as usize];
                buffer.mapping().unwrap().read_slice(0, &mut words);
                words
            }
            Backing::Host { words, .. } => words.clone(),
        }
    }

    fn current_segment(stream: &CommandStream) -> &Arc<Buffer> {
        let Backing::Device { buffer, .. } = &stream.current else {
            panic!("expected a device backing");
        };
        buffer
    }

    #[test]
    fn chained_growth_links_segments() {
        let device = fake_device_with_engines(tiny_graphics_engines(64, 64));
        let mut stream = CommandStream::new(&device, Default::default()).unwrap();

        // 64-word segments with a 4-word footer leave 60 usable words, so
        // word 61 forces a second segment.
        for i in 0..65u32 {
            stream.emit(i);
        }
        stream.finalize().unwrap();

        assert_eq!(stream.retired.len(), 1);
        let first = device_piece_words(&stream.retired[0]);
        assert_eq!(first.len(), 64);
        assert_eq!(&first[..60], &(0..60).collect::<Vec<u32>>()[..]);

        let link = packet::decode_indirect(&first[60..64]).unwrap();
        assert!(link.chain);
        assert_eq!(link.gpu_address, current_segment(&stream).gpu_address());
        // 5 payload words, padded to 8, plus the 4-word trailing slot.
        assert_eq!(link.size_dw, 12);

        let second = current_words(&stream);
        assert_eq!(&second[..5], &[60, 61, 62, 63, 64]);
        assert_eq!(&second[5..8], &[packet::nop_word(); 3]);
        assert_eq!(&second[8..12], &packet::nop_slot());

        assert_eq!(stream.word_count(), 76);
        assert_eq!(stream.ib_descriptors().as_slice(), &[(stream.first_segment_address(), 64)]);
    }

    #[test]
    fn single_segment_stream_pads_and_records_length() {
        let device = fake_device();
        let mut stream = CommandStream::new(&device, Default::default()).unwrap();
        stream.emit_words(&[1, 2, 3]);
        stream.finalize().unwrap();

        // Padded to the 8-word alignment with the slot at the end.
        assert_eq!(stream.word_count(), 8);
        let words = current_words(&stream);
        assert_eq!(&words[..3], &[1, 2, 3]);
        assert_eq!(words[3], packet::nop_word());
        assert_eq!(&words[4..8], &packet::nop_slot());
        assert_eq!(stream.ib_descriptors().len(), 1);
        assert_eq!(stream.ib_descriptors()[0].1, 8);
    }

    #[test]
    fn overflow_list_retires_device_pieces_in_order() {
        let mut engines = EngineInfo::default_table();
        let transfer = &mut engines[EngineType::Transfer.index()];
        transfer.initial_segment_words = 32;
        transfer.max_segment_words = 64;
        let device = fake_device_with_engines(engines);

        let mut stream = CommandStream::new(
            &device,
            CommandStreamCreateInfo { engine: EngineType::Transfer, ..Default::default() },
        )
        .unwrap();
        assert_eq!(stream.growth_strategy(), GrowthStrategy::OverflowList);

        for i in 0..40u32 {
            stream.emit(i);
        }
        stream.finalize().unwrap();

        let descriptors = stream.ib_descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].1, 32);
        // 8 words padded to the 16-word alignment.
        assert_eq!(descriptors[1].1, 16);
        assert_eq!(device_piece_words(&stream.retired[0])[..32], (0..32).collect::<Vec<u32>>()[..]);
    }

    #[test]
    fn host_backed_stream_grows_in_place_then_splits() {
        let mut engines = EngineInfo::default_table();
        let video = &mut engines[EngineType::VideoDecode.index()];
        video.initial_segment_words = 16;
        video.max_segment_words = 32;
        let device = fake_device_with_engines(engines);

        let mut stream = CommandStream::new(
            &device,
            CommandStreamCreateInfo { engine: EngineType::VideoDecode, ..Default::default() },
        )
        .unwrap();
        let pad = device.engine_info(EngineType::VideoDecode).pad_word;
        for i in 0..40u32 {
            stream.emit(i);
        }
        stream.finalize().unwrap();

        let chunks = stream.host_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], &(0..32).collect::<Vec<u32>>()[..]);
        assert_eq!(chunks[1].len(), 16);
        assert_eq!(&chunks[1][..8], &(32..40).collect::<Vec<u32>>()[..]);
        assert_eq!(&chunks[1][8..], &[pad; 8]);
        assert!(stream.ib_descriptors().is_empty());
    }

    #[test]
    fn growth_failure_is_sticky_and_leaves_a_valid_stream() {
        let device = fake_device_with_engines(tiny_graphics_engines(64, 64));
        let kernel = fake_kernel_of(&device);
        let mut stream = CommandStream::new(&device, Default::default()).unwrap();

        kernel.fail_next_allocations(u32::MAX);
        for i in 0..100u32 {
            stream.emit(i);
        }
        assert_eq!(stream.status(), Err(WinsysError::OutOfDeviceMemory));
        // The cursor froze at the failure point.
        assert_eq!(stream.word_count(), 60);

        assert_eq!(stream.finalize(), Err(WinsysError::OutOfDeviceMemory));
        let words = current_words(&stream);
        assert_eq!(words.len(), 64);
        assert_eq!(&words[60..64], &packet::nop_slot());
    }

    #[test]
    fn append_stream_emits_a_launch_packet() {
        let device = fake_device();
        let mut inner = CommandStream::new(&device, Default::default()).unwrap();
        inner.emit_words(&[7, 8, 9]);
        inner.finalize().unwrap();

        let mut outer = CommandStream::new(&device, Default::default()).unwrap();
        outer.append_stream(&inner, true);

        let words = current_words(&outer);
        let (decoded, consumed) = packet::decode(&words).unwrap();
        assert_eq!(consumed, 4);
        match decoded {
            packet::DecodedPacket::Indirect(op) => {
                assert!(!op.chain);
                assert_eq!(op.gpu_address, inner.first_segment_address());
                assert_eq!(op.size_dw, 8);
            }
            other => panic!("expected a launch packet, got {other:?}"),
        }
        assert!(outer.buffer_references().contains(current_segment(&inner).handle()));
    }

    #[test]
    fn append_stream_copy_strips_links() {
        let device = fake_device_with_engines(tiny_graphics_engines(64, 0xf_ffff));
        let mut inner = CommandStream::new(&device, Default::default()).unwrap();
        for i in 0..65u32 {
            inner.emit(i);
        }
        inner.finalize().unwrap();

        let mut outer = CommandStream::new(&device, Default::default()).unwrap();
        outer.append_stream(&inner, false);

        // 60 words of the first piece (link stripped) land in the outer
        // stream's first segment, which then chains; the second piece
        // contributes its payload and pad words but not the slot.
        assert_eq!(outer.word_count(), 64 + 8);
        let tail = current_words(&outer);
        assert_eq!(&tail[..5], &[60, 61, 62, 63, 64]);
        assert_eq!(&tail[5..8], &[packet::nop_word(); 3]);
        assert!(outer.buffer_references().contains(current_segment(&inner).handle()));
    }

    #[test]
    fn append_copy_reproduces_unchained_streams() {
        let device = fake_device_with_engines(tiny_graphics_engines(32, 64));
        let info = CommandStreamCreateInfo { allow_chaining: false, ..Default::default() };

        let mut source = CommandStream::new(&device, info.clone()).unwrap();
        for i in 0..40u32 {
            source.emit(i);
        }
        source.finalize().unwrap();
        assert_eq!(source.growth_strategy(), GrowthStrategy::OverflowList);
        assert_eq!(source.ib_descriptors().len(), 2);

        // Without chain links the recorded words are position independent,
        // so copying the pieces whole reproduces the stream exactly.
        let mut copy = CommandStream::new(&device, info).unwrap();
        copy.append_stream(&source, false);
        copy.finalize().unwrap();
        assert_eq!(copy.recorded_words(), source.recorded_words());
    }

    #[test]
    fn append_copy_reproduces_host_backed_streams() {
        let mut engines = EngineInfo::default_table();
        let video = &mut engines[EngineType::VideoDecode.index()];
        video.initial_segment_words = 16;
        video.max_segment_words = 32;
        let device = fake_device_with_engines(engines);
        let info =
            CommandStreamCreateInfo { engine: EngineType::VideoDecode, ..Default::default() };

        let mut source = CommandStream::new(&device, info.clone()).unwrap();
        for i in 0..40u32 {
            source.emit(i);
        }
        source.finalize().unwrap();
        assert_eq!(source.host_chunks().len(), 2);

        let mut copy = CommandStream::new(&device, info).unwrap();
        copy.append_stream(&source, false);
        copy.finalize().unwrap();
        assert_eq!(copy.recorded_words(), source.recorded_words());
        // The same engine limits re-segment the copy at the same boundary.
        assert_eq!(copy.host_chunks().len(), 2);
    }

    #[test]
    fn reset_recycles_segments_into_the_pool() {
        let device = fake_device_with_engines(tiny_graphics_engines(64, 64));
        let kernel = fake_kernel_of(&device);

        let mut stream = CommandStream::new(&device, Default::default()).unwrap();
        for i in 0..200u32 {
            stream.emit(i);
        }
        stream.finalize().unwrap();
        let allocated = kernel.allocation_count();

        stream.reset();
        assert!(!stream.is_finalized());
        assert_eq!(stream.word_count(), 0);
        assert!(stream.status().is_ok());
        assert_eq!(stream.buffer_references().entries().len(), 1);

        // A re-recorded stream grows out of the pool without fresh
        // allocations.
        for i in 0..200u32 {
            stream.emit(i);
        }
        stream.finalize().unwrap();
        assert_eq!(kernel.allocation_count(), allocated);
    }

    #[test]
    #[should_panic(expected = "finalized")]
    fn emitting_into_a_finalized_stream_panics() {
        let device = fake_device();
        let mut stream = CommandStream::new(&device, Default::default()).unwrap();
        stream.finalize().unwrap();
        stream.emit(0);
    }
}
