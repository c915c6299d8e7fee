use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use anyhow::bail;
use mem::{AccessType, Addr, AddrRange};
use pgalloc::{FrameNumber, PageAllocator, Quota};
use slab::Slab;
use swap::SwapSpace;
use usage::memory::{MemoryAccounting, MemoryStats};
use utils::{bail_libc, bit, SysError, SysResult};

use crate::{
    amap::{Amap, AmapRef},
    anon::{Anon, AnonPool},
};

// Pmap is the hook into the page-table layer. Only the calls the anonymous
// memory layer needs are modelled.
pub trait Pmap: Send + Sync {
    fn enter(&self, addr: Addr, frame: FrameNumber, prot: AccessType);
    fn protect(&self, range: AddrRange, prot: AccessType);
    fn page_protect(&self, frame: FrameNumber, prot: AccessType);
    fn remove(&self, range: AddrRange);
}

#[derive(Debug, Default)]
pub struct NullPmap;

impl Pmap for NullPmap {
    fn enter(&self, _: Addr, _: FrameNumber, _: AccessType) {}
    fn protect(&self, _: AddrRange, _: AccessType) {}
    fn page_protect(&self, _: FrameNumber, _: AccessType) {}
    fn remove(&self, _: AddrRange) {}
}

#[derive(Clone, Debug)]
pub struct VmOpts {
    // slots per chunk of a chunked amap
    pub chunk_slots: usize,
    // amaps with at least this many slots use chunked storage
    pub large_slots: usize,
    // upper bound on live anons
    pub max_anons: u64,
    // upper bound on resident pages
    pub max_pages: u64,
    // kernel memory available to slot tables and ppref arrays, in slots
    pub kmem_slots: u64,
    pub track_partial_refs: bool,
}

impl Default for VmOpts {
    fn default() -> Self {
        Self {
            chunk_slots: 16,
            large_slots: 256,
            max_anons: 1 << 20,
            max_pages: 1 << 18,
            kmem_slots: 1 << 24,
            track_partial_refs: true,
        }
    }
}

impl VmOpts {
    fn validate(&self) -> SysResult<()> {
        if !bit::is_power_of_two(self.chunk_slots) {
            logger::warn!("chunk_slots must be a power of two: {}", self.chunk_slots);
            bail_libc!(libc::EINVAL);
        }
        if self.large_slots < self.chunk_slots {
            logger::warn!(
                "large_slots ({}) is smaller than chunk_slots ({})",
                self.large_slots,
                self.chunk_slots
            );
            bail_libc!(libc::EINVAL);
        }
        if self.max_anons == 0 || self.max_pages == 0 || self.kmem_slots == 0 {
            bail_libc!(libc::EINVAL);
        }
        Ok(())
    }
}

// Vm carries everything the anonymous memory layer would otherwise keep in
// globals, so independent instances can coexist (one per test).
pub struct Vm {
    opts: VmOpts,
    pages: PageAllocator,
    swap: SwapSpace,
    kmem: Quota,
    anons: AnonPool,
    amaps: Mutex<Slab<Weak<Amap>>>,
    accounting: MemoryAccounting,
    pmap: Box<dyn Pmap>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("opts", &self.opts)
            .field("pages", &self.pages)
            .field("kmem", &self.kmem)
            .field("anons", &self.anons)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Vm {
    pub fn new(opts: VmOpts) -> SysResult<Self> {
        Self::with_pmap(opts, Box::new(NullPmap))
    }

    pub fn with_pmap(opts: VmOpts, pmap: Box<dyn Pmap>) -> SysResult<Self> {
        opts.validate()?;
        logger::debug!("creating vm with {:?}", opts);
        Ok(Self {
            pages: PageAllocator::new(opts.max_pages),
            swap: SwapSpace::new(),
            kmem: Quota::new("amap kmem", opts.kmem_slots),
            anons: AnonPool::new(opts.max_anons),
            amaps: Mutex::new(Slab::new()),
            accounting: MemoryAccounting::new(),
            pmap,
            opts,
        })
    }

    pub fn opts(&self) -> &VmOpts {
        &self.opts
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn kmem(&self) -> &Quota {
        &self.kmem
    }

    pub fn accounting(&self) -> &MemoryAccounting {
        &self.accounting
    }

    pub fn pmap(&self) -> &dyn Pmap {
        self.pmap.as_ref()
    }

    pub(crate) fn anon_pool(&self) -> &AnonPool {
        &self.anons
    }

    pub fn stats(&self) -> MemoryStats {
        self.accounting.snapshot()
    }

    pub(crate) fn register_amap<F: FnOnce(usize) -> Amap>(&self, build: F) -> AmapRef {
        let mut amaps = self.amaps.lock().unwrap();
        let entry = amaps.vacant_entry();
        let amap = Arc::new(build(entry.key()));
        entry.insert(Arc::downgrade(&amap));
        amap
    }

    pub(crate) fn deregister_amap(&self, key: usize) {
        let mut amaps = self.amaps.lock().unwrap();
        if amaps.try_remove(key).is_none() {
            panic!("amap {} is not registered", key);
        }
    }

    // live_amaps returns every amap that has not been wiped out yet.
    pub fn live_amaps(&self) -> Vec<AmapRef> {
        self.amaps
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    // check_anon_refcounts verifies that every anon reachable from an amap
    // carries exactly one reference per (amap, slot) pair that holds it, and
    // that every amap is internally consistent.
    pub fn check_anon_refcounts(&self) -> anyhow::Result<()> {
        let mut holders: HashMap<*const Anon, (usize, Arc<Anon>)> = HashMap::new();
        for amap in self.live_amaps() {
            let st = amap.lock();
            if st.is_wiped() {
                continue;
            }
            st.check_invariants()?;
            for slot in st.populated_slots(0..st.slot_count()) {
                if let Some(anon) = st.lookup_slot(slot) {
                    holders
                        .entry(Arc::as_ptr(&anon))
                        .or_insert_with(|| (0, Arc::clone(&anon)))
                        .0 += 1;
                }
            }
        }
        for (count, anon) in holders.values() {
            let refs = anon.refs();
            if refs != *count {
                bail!(
                    "anon {} has refcount {} but is held by {} slots",
                    anon.id(),
                    refs,
                    count
                );
            }
        }
        Ok(())
    }
}
