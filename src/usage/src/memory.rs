use std::sync::atomic::{AtomicU64, Ordering};

use super::{Event, MemoryKind};

// MemoryAccounting holds the counters of one VM instance. Every counter is
// updated with plain atomics so that faults on unrelated amaps never
// serialize on the accounting.
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    anonymous: AtomicU64,
    swapped: AtomicU64,
    amap_slots: AtomicU64,
    ppref: AtomicU64,
    events: EventCounters,
}

#[derive(Debug, Default)]
struct EventCounters {
    amap_alloc: AtomicU64,
    amap_wipeout: AtomicU64,
    anon_alloc: AtomicU64,
    anon_free: AtomicU64,
    chunk_materialize: AtomicU64,
    chunk_release: AtomicU64,
    ppref_establish: AtomicU64,
    cow_break: AtomicU64,
    page_in: AtomicU64,
    page_out: AtomicU64,
}

impl EventCounters {
    fn counter(&self, event: Event) -> &AtomicU64 {
        match event {
            Event::AmapAlloc => &self.amap_alloc,
            Event::AmapWipeout => &self.amap_wipeout,
            Event::AnonAlloc => &self.anon_alloc,
            Event::AnonFree => &self.anon_free,
            Event::ChunkMaterialize => &self.chunk_materialize,
            Event::ChunkRelease => &self.chunk_release,
            Event::PprefEstablish => &self.ppref_establish,
            Event::CowBreak => &self.cow_break,
            Event::PageIn => &self.page_in,
            Event::PageOut => &self.page_out,
        }
    }
}

impl MemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: MemoryKind) -> &AtomicU64 {
        match kind {
            MemoryKind::Anonymous => &self.anonymous,
            MemoryKind::Swapped => &self.swapped,
            MemoryKind::AmapSlots => &self.amap_slots,
            MemoryKind::Ppref => &self.ppref,
        }
    }

    pub fn inc(&self, val: u64, kind: MemoryKind) {
        self.counter(kind).fetch_add(val, Ordering::SeqCst);
    }

    pub fn dec(&self, val: u64, kind: MemoryKind) {
        let prev = self.counter(kind).fetch_sub(val, Ordering::SeqCst);
        if prev < val {
            panic!(
                "memory accounting underflow for {:?}: {} - {}",
                kind, prev, val
            );
        }
    }

    pub fn change_memory_kind(&self, val: u64, to: MemoryKind, from: MemoryKind) {
        self.dec(val, from);
        self.inc(val, to);
    }

    pub fn get(&self, kind: MemoryKind) -> u64 {
        self.counter(kind).load(Ordering::SeqCst)
    }

    pub fn record(&self, event: Event) {
        self.events.counter(event).fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self, event: Event) -> u64 {
        self.events.counter(event).load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            anonymous: self.get(MemoryKind::Anonymous),
            swapped: self.get(MemoryKind::Swapped),
            amap_slots: self.get(MemoryKind::AmapSlots),
            ppref: self.get(MemoryKind::Ppref),
            live_anons: self
                .count(Event::AnonAlloc)
                .saturating_sub(self.count(Event::AnonFree)),
            live_amaps: self
                .count(Event::AmapAlloc)
                .saturating_sub(self.count(Event::AmapWipeout)),
            live_chunks: self
                .count(Event::ChunkMaterialize)
                .saturating_sub(self.count(Event::ChunkRelease)),
            cow_breaks: self.count(Event::CowBreak),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub anonymous: u64,
    pub swapped: u64,
    pub amap_slots: u64,
    pub ppref: u64,
    pub live_anons: u64,
    pub live_amaps: u64,
    pub live_chunks: u64,
    pub cow_breaks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_moves_pages() {
        let acct = MemoryAccounting::new();
        acct.inc(3, MemoryKind::Anonymous);
        acct.change_memory_kind(2, MemoryKind::Swapped, MemoryKind::Anonymous);
        assert_eq!(acct.get(MemoryKind::Anonymous), 1);
        assert_eq!(acct.get(MemoryKind::Swapped), 2);
    }

    #[test]
    fn snapshot_derives_live_counts() {
        let acct = MemoryAccounting::new();
        acct.record(Event::AnonAlloc);
        acct.record(Event::AnonAlloc);
        acct.record(Event::AnonFree);
        acct.record(Event::ChunkMaterialize);
        let stats = acct.snapshot();
        assert_eq!(stats.live_anons, 1);
        assert_eq!(stats.live_chunks, 1);
        assert_eq!(stats.live_amaps, 0);
    }

    #[test]
    #[should_panic(expected = "memory accounting underflow")]
    fn underflow_panics() {
        let acct = MemoryAccounting::new();
        acct.dec(1, MemoryKind::Ppref);
    }
}
