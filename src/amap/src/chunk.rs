// Slot storage of an amap. Small amaps keep one flat array. Large amaps only
// keep a table of chunk pointers; a chunk of chunk_slots entries comes into
// existence on the first add into its range and goes away when its last slot
// is cleared, so a sparse amap costs memory proportional to what is used.

use usage::{memory::MemoryAccounting, Event};
use utils::{bit, SlotRange};

use crate::{anon::AnonRef, VmOpts};

#[derive(Debug)]
pub(crate) struct Chunk {
    slots: Box<[Option<AnonRef>]>,
    used: usize,
}

impl Chunk {
    fn new(chunk_slots: usize) -> Self {
        Self {
            slots: vec![None; chunk_slots].into_boxed_slice(),
            used: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) enum SlotStore {
    Flat(Vec<Option<AnonRef>>),
    Chunked {
        chunk_shift: usize,
        table: Vec<Option<Chunk>>,
    },
}

impl SlotStore {
    pub(crate) fn new(capacity: usize, opts: &VmOpts) -> Self {
        if capacity < opts.large_slots {
            return SlotStore::Flat(vec![None; capacity]);
        }
        let chunk_shift = bit::msb(opts.chunk_slots as u64) as usize;
        let mut table = Vec::new();
        table.resize_with(bit::div_round_up(capacity, opts.chunk_slots), || None);
        SlotStore::Chunked { chunk_shift, table }
    }

    // charge is the number of kmem units the store holds outside of chunks.
    pub(crate) fn charge(&self) -> u64 {
        match self {
            SlotStore::Flat(slots) => slots.len() as u64,
            SlotStore::Chunked { table, .. } => table.len() as u64,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match self {
            SlotStore::Flat(slots) => slots.len(),
            SlotStore::Chunked { chunk_shift, table } => table.len() << chunk_shift,
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self, SlotStore::Chunked { .. })
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&AnonRef> {
        match self {
            SlotStore::Flat(slots) => slots[slot].as_ref(),
            SlotStore::Chunked { chunk_shift, table } => table[slot >> chunk_shift]
                .as_ref()
                .and_then(|chunk| chunk.slots[slot & ((1usize << chunk_shift) - 1)].as_ref()),
        }
    }

    // set stores anon in slot, materializing its chunk, and returns what the
    // slot held before.
    pub(crate) fn set(
        &mut self,
        slot: usize,
        anon: AnonRef,
        accounting: &MemoryAccounting,
    ) -> Option<AnonRef> {
        match self {
            SlotStore::Flat(slots) => slots[slot].replace(anon),
            SlotStore::Chunked { chunk_shift, table } => {
                let idx = slot >> *chunk_shift;
                let chunk = table[idx].get_or_insert_with(|| {
                    logger::trace!("materializing chunk {}", idx);
                    accounting.record(Event::ChunkMaterialize);
                    Chunk::new(1usize << *chunk_shift)
                });
                let old = chunk.slots[slot & ((1usize << *chunk_shift) - 1)].replace(anon);
                if old.is_none() {
                    chunk.used += 1;
                }
                old
            }
        }
    }

    // take clears slot. A chunk left without anons is released.
    pub(crate) fn take(&mut self, slot: usize, accounting: &MemoryAccounting) -> Option<AnonRef> {
        match self {
            SlotStore::Flat(slots) => slots[slot].take(),
            SlotStore::Chunked { chunk_shift, table } => {
                let idx = slot >> *chunk_shift;
                let chunk = table[idx].as_mut()?;
                let old = chunk.slots[slot & ((1usize << *chunk_shift) - 1)].take();
                if old.is_some() {
                    chunk.used -= 1;
                    if chunk.used == 0 {
                        table[idx] = None;
                        accounting.record(Event::ChunkRelease);
                    }
                }
                old
            }
        }
    }

    // populated lists the occupied slots of range in ascending order without
    // touching chunks that were never materialized.
    pub(crate) fn populated(&self, range: SlotRange) -> Vec<usize> {
        match self {
            SlotStore::Flat(slots) => range.iter().filter(|s| slots[*s].is_some()).collect(),
            SlotStore::Chunked { chunk_shift, table } => {
                let mut out = Vec::new();
                if range.is_empty() {
                    return out;
                }
                for idx in (range.start >> chunk_shift)..=((range.end - 1) >> chunk_shift) {
                    let chunk = match &table[idx] {
                        Some(chunk) => chunk,
                        None => continue,
                    };
                    let base = idx << chunk_shift;
                    for (i, anon) in chunk.slots.iter().enumerate() {
                        if anon.is_some() && range.contains(base + i) {
                            out.push(base + i);
                        }
                    }
                }
                out
            }
        }
    }

    pub(crate) fn materialized_chunks(&self) -> usize {
        match self {
            SlotStore::Flat(_) => 0,
            SlotStore::Chunked { table, .. } => table.iter().filter(|c| c.is_some()).count(),
        }
    }

    // grow makes room for capacity slots. A flat store that reaches the
    // large threshold is migrated into chunks.
    pub(crate) fn grow(&mut self, capacity: usize, opts: &VmOpts, accounting: &MemoryAccounting) {
        if capacity <= self.capacity() {
            return;
        }
        match self {
            SlotStore::Flat(slots) if capacity < opts.large_slots => {
                slots.resize(capacity, None);
            }
            SlotStore::Flat(slots) => {
                let old = std::mem::take(slots);
                let mut chunked = SlotStore::new(capacity, opts);
                for (slot, anon) in old.into_iter().enumerate() {
                    if let Some(anon) = anon {
                        chunked.set(slot, anon, accounting);
                    }
                }
                logger::debug!(
                    "migrated flat slot store to {} chunks",
                    chunked.materialized_chunks()
                );
                *self = chunked;
            }
            SlotStore::Chunked { chunk_shift, table } => {
                let len = bit::div_round_up(capacity, 1usize << *chunk_shift);
                table.resize_with(len, || None);
            }
        }
    }

    // drain empties the store and returns every anon it held.
    pub(crate) fn drain(&mut self, accounting: &MemoryAccounting) -> Vec<AnonRef> {
        match self {
            SlotStore::Flat(slots) => slots.iter_mut().filter_map(|s| s.take()).collect(),
            SlotStore::Chunked { table, .. } => {
                let mut out = Vec::new();
                for chunk in table.iter_mut().filter_map(|c| c.take()) {
                    accounting.record(Event::ChunkRelease);
                    out.extend(chunk.slots.into_vec().into_iter().flatten());
                }
                out
            }
        }
    }
}
