//! Deduplicated buffer lists attached to kernel submissions.
//!
//! Every stream tracks the buffers its packets reference in a
//! [`BufferReferenceTable`]; at submission time the scheduler asks
//! [`build_submission_list`] for one flat, deduplicated list covering all
//! streams of the request. Virtual buffers are expanded into their members
//! only here, so emission-side tracking stays O(1) per reference no matter
//! how many allocations stand behind a virtual buffer.

use crate::buffer::{Buffer, BufferRegistry};
use foldhash::{HashMap, HashSet};
use pyrite_drm::BufferListEntry;
use std::{borrow::Cow, sync::Arc};

/// The per-stream reference set: insertion order preserved, idempotent,
/// keyed by kernel handle.
#[derive(Debug, Default)]
pub struct BufferReferenceTable {
    entries: Vec<BufferListEntry>,
    index: HashMap<u32, usize>,
    virtuals: Vec<Arc<Buffer>>,
    virtual_index: HashSet<usize>,
}

impl BufferReferenceTable {
    pub(crate) fn new() -> Self {
        BufferReferenceTable {
            entries: Vec::new(),
            index: HashMap::default(),
            virtuals: Vec::new(),
            virtual_index: HashSet::default(),
        }
    }

    /// Records a dependency on `handle`. Re-adding a handle keeps one entry
    /// and the highest priority seen.
    pub(crate) fn add(&mut self, handle: u32, priority: u32) {
        match self.index.get(&handle) {
            Some(&at) => {
                let entry = &mut self.entries[at];
                entry.priority = entry.priority.max(priority);
            }
            None => {
                self.index.insert(handle, self.entries.len());
                self.entries.push(BufferListEntry { handle, priority });
            }
        }
    }

    /// Records a dependency on a virtual buffer. Members are not walked
    /// here; see [`build_submission_list`].
    pub(crate) fn add_virtual(&mut self, buffer: &Arc<Buffer>) {
        debug_assert!(buffer.is_virtual());
        let key = Arc::as_ptr(buffer) as usize;
        if self.virtual_index.insert(key) {
            self.virtuals.push(buffer.clone());
        }
    }

    /// Adds everything `other` references, used when one stream's content is
    /// appended to another.
    pub(crate) fn merge_from(&mut self, other: &BufferReferenceTable) {
        for entry in &other.entries {
            self.add(entry.handle, entry.priority);
        }
        for buffer in &other.virtuals {
            self.add_virtual(buffer);
        }
    }

    /// Bulk clear on stream reset. Individual entries are never removed.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.virtuals.clear();
        self.virtual_index.clear();
    }

    #[inline]
    pub fn entries(&self) -> &[BufferListEntry] {
        &self.entries
    }

    #[inline]
    pub fn virtual_buffers(&self) -> &[Arc<Buffer>] {
        &self.virtuals
    }

    #[inline]
    pub fn contains(&self, handle: u32) -> bool {
        self.index.contains_key(&handle)
    }
}

/// Appends `entry` unless the handle is already present; duplicates keep the
/// highest priority. The linear scan makes the general path quadratic in the
/// total reference count, which stays small (it is bounded by working-set
/// size, not command count).
fn merge_entry(result: &mut Vec<BufferListEntry>, entry: BufferListEntry) {
    for existing in result.iter_mut() {
        if existing.handle == entry.handle {
            existing.priority = existing.priority.max(entry.priority);
            return;
        }
    }
    result.push(entry);
}

/// Builds the flat buffer list for one kernel request.
///
/// With the diagnostic registry enabled the list is the registry itself:
/// every live buffer is in it, so per-stream tracking is redundant. The fast
/// path hands out the single stream's table without copying. Everything else
/// goes through the quadratic merge.
pub(crate) fn build_submission_list<'a>(
    tables: &[&'a BufferReferenceTable],
    extra: &[BufferListEntry],
    registry: &BufferRegistry,
) -> Cow<'a, [BufferListEntry]> {
    if registry.is_enabled() {
        return Cow::Owned(registry.read().clone());
    }

    if let [table] = tables {
        if extra.is_empty() && table.virtuals.is_empty() {
            return Cow::Borrowed(&table.entries);
        }
    }

    let capacity = tables.iter().map(|table| table.entries.len()).sum::<usize>() + extra.len();
    let mut result = Vec::with_capacity(capacity);
    for table in tables {
        for &entry in &table.entries {
            merge_entry(&mut result, entry);
        }
        for buffer in &table.virtuals {
            for member in buffer.members().unwrap_or(&[]) {
                merge_entry(
                    &mut result,
                    BufferListEntry {
                        handle: member.handle(),
                        priority: member.priority(),
                    },
                );
            }
        }
    }
    for &entry in extra {
        merge_entry(&mut result, entry);
    }

    Cow::Owned(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{BufferCreateInfo, BufferRegistry},
        tests::fake_device,
    };

    fn handles(list: &[BufferListEntry]) -> Vec<u32> {
        let mut handles: Vec<u32> = list.iter().map(|entry| entry.handle).collect();
        handles.sort_unstable();
        handles
    }

    #[test]
    fn add_is_idempotent_and_keeps_highest_priority() {
        let mut table = BufferReferenceTable::new();
        table.add(7, 2);
        table.add(9, 1);
        table.add(7, 5);
        table.add(7, 3);

        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.entries()[0], BufferListEntry { handle: 7, priority: 5 });
    }

    #[test]
    fn single_stream_list_is_borrowed() {
        let mut table = BufferReferenceTable::new();
        table.add(1, 0);
        table.add(2, 0);

        let registry = BufferRegistry::new(false);
        let list = build_submission_list(&[&table], &[], &registry);
        assert!(matches!(list, Cow::Borrowed(_)));
        assert_eq!(handles(&list), [1, 2]);
    }

    #[test]
    fn overlapping_streams_merge_to_the_union() {
        let (a, b, c, d) = (10, 11, 12, 13);
        let mut first = BufferReferenceTable::new();
        first.add(a, 0);
        first.add(b, 0);
        let mut second = BufferReferenceTable::new();
        second.add(b, 0);
        second.add(c, 0);
        let mut third = BufferReferenceTable::new();
        third.add(c, 0);
        third.add(d, 0);

        let registry = BufferRegistry::new(false);
        let list = build_submission_list(&[&first, &second, &third], &[], &registry);
        assert_eq!(handles(&list), [a, b, c, d]);
    }

    #[test]
    fn virtual_members_expand_only_at_list_build() {
        let device = fake_device();
        let members: Vec<_> = (0..3)
            .map(|_| {
                crate::buffer::Buffer::new(
                    &device,
                    BufferCreateInfo { size: 4096, ..Default::default() },
                )
                .unwrap()
            })
            .collect();
        let virt = crate::buffer::Buffer::new_virtual(&device, 1 << 16, members.clone()).unwrap();

        let mut table = BufferReferenceTable::new();
        table.add_virtual(&virt);
        table.add_virtual(&virt);

        // Emission-side state: one pending virtual, zero expanded entries.
        assert!(table.entries().is_empty());
        assert_eq!(table.virtual_buffers().len(), 1);

        let registry = BufferRegistry::new(false);
        let list = build_submission_list(&[&table], &[], &registry);
        let expected: Vec<u32> = {
            let mut expected: Vec<u32> = members.iter().map(|member| member.handle()).collect();
            expected.sort_unstable();
            expected
        };
        assert_eq!(handles(&list), expected);
    }

    #[test]
    fn registry_mode_overrides_per_stream_tracking() {
        let registry = BufferRegistry::new(true);
        registry.register(100, 1);
        registry.register(101, 2);

        let mut table = BufferReferenceTable::new();
        table.add(555, 0);

        let list = build_submission_list(&[&table], &[], &registry);
        assert_eq!(handles(&list), [100, 101]);
    }
}
