use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, ensure};
use pgalloc::WaitPolicy;
use usage::{Event, MemoryKind};
use utils::{bit, precondition, precondition_failed, SlotRange, SysResult};

use crate::{
    anon::{Anon, AnonRef},
    chunk::SlotStore,
    ppref::Ppref,
    Vm, VmOpts,
};

pub type AmapRef = Arc<Amap>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefFlags {
    // the new reference shares the amap instead of copying it on write
    pub shared: bool,
    // the reference covers every slot regardless of offset and length
    pub all: bool,
}

// Amap is the slot array backing a range of anonymous memory. It is shared by
// every aref pointing into it; refs counts those arefs.
#[derive(Debug)]
pub struct Amap {
    key: usize,
    state: Mutex<AmapState>,
}

#[derive(Debug)]
pub struct AmapState {
    slot_count: usize,
    refs: usize,
    used: usize,
    shared: bool,
    slots: SlotStore,
    ppref: Ppref,
    // kmem units held for the slot store
    charged: u64,
    wiped: bool,
}

fn charge_for(capacity: usize, opts: &VmOpts) -> u64 {
    if capacity < opts.large_slots {
        capacity as u64
    } else {
        bit::div_round_up(capacity, opts.chunk_slots) as u64
    }
}

impl Amap {
    // alloc returns an amap of slot_count empty slots and room for pad more,
    // referenced once. Large amaps allocate their chunk table only.
    pub fn alloc(vm: &Vm, slot_count: usize, pad: usize, wait: WaitPolicy) -> SysResult<AmapRef> {
        precondition!(slot_count > 0, "allocating an amap without slots");
        let slots = SlotStore::new(slot_count + pad, vm.opts());
        let charged = slots.charge();
        vm.kmem().acquire(charged, wait)?;
        vm.accounting().inc(charged, MemoryKind::AmapSlots);
        vm.accounting().record(Event::AmapAlloc);
        let amap = vm.register_amap(|key| Amap {
            key,
            state: Mutex::new(AmapState {
                slot_count,
                refs: 1,
                used: 0,
                shared: false,
                slots,
                ppref: Ppref::default(),
                charged,
                wiped: false,
            }),
        });
        logger::trace!(
            "amap {}: allocated {} slots (pad {})",
            amap.key,
            slot_count,
            pad
        );
        Ok(amap)
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn lock(&self) -> MutexGuard<'_, AmapState> {
        self.state.lock().unwrap()
    }

    // ref_range adds a reference covering [offset, offset+len).
    pub fn ref_range(&self, vm: &Vm, offset: usize, len: usize, flags: RefFlags) {
        let mut st = self.lock();
        precondition!(!st.wiped, "referencing wiped out amap {}", self.key);
        st.check_range(offset, len);
        if flags.shared {
            st.shared = true;
        }
        st.adjust_refs(vm, offset, len, 1, flags.all);
    }

    // unref drops the reference covering [offset, offset+len). Slots no
    // aref sees anymore are cleared, and dropping the last reference wipes
    // the amap out.
    pub fn unref(amap: &AmapRef, vm: &Vm, offset: usize, len: usize, all: bool) {
        let mut st = amap.lock();
        precondition!(
            !st.wiped && st.refs > 0,
            "unref of wiped out amap {}",
            amap.key
        );
        if !all {
            st.check_range(offset, len);
        }
        if st.refs == 1 {
            st.refs = 0;
            amap.wipeout_locked(vm, &mut st);
            return;
        }
        let zeroed = st.adjust_refs(vm, offset, len, -1, all);
        if st.refs == 1 {
            st.shared = false;
        }
        st.wipe_slots(vm, zeroed);
    }

    // wipeout releases everything an unreferenced amap holds.
    pub fn wipeout(&self, vm: &Vm) {
        let mut st = self.lock();
        self.wipeout_locked(vm, &mut st);
    }

    fn wipeout_locked(&self, vm: &Vm, st: &mut AmapState) {
        precondition!(
            st.refs == 0,
            "wiping out amap {} with {} refs",
            self.key,
            st.refs
        );
        precondition!(!st.wiped, "amap {} wiped out twice", self.key);
        let anons = st.slots.drain(vm.accounting());
        logger::trace!("amap {}: wipeout of {} anons", self.key, anons.len());
        for anon in anons {
            Anon::unref(vm, anon);
        }
        st.used = 0;
        st.ppref.release(vm);
        vm.kmem().release(st.charged);
        vm.accounting().dec(st.charged, MemoryKind::AmapSlots);
        st.charged = 0;
        st.wiped = true;
        vm.deregister_amap(self.key);
        vm.accounting().record(Event::AmapWipeout);
    }
}

impl AmapState {
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn is_chunked(&self) -> bool {
        self.slots.is_chunked()
    }

    pub fn materialized_chunks(&self) -> usize {
        self.slots.materialized_chunks()
    }

    pub fn ppref_is_tracked(&self) -> bool {
        self.ppref.is_tracked()
    }

    pub fn ppref_value(&self, slot: usize) -> Option<i32> {
        self.ppref.get(slot)
    }

    // effective_refs returns how many arefs see slot.
    pub fn effective_refs(&self, slot: usize) -> usize {
        self.check_slot(slot);
        self.ppref.effective(slot, self.refs)
    }

    fn check_slot(&self, slot: usize) {
        precondition!(
            slot < self.slot_count,
            "slot {} out of range for amap of {} slots",
            slot,
            self.slot_count
        );
    }

    fn check_range(&self, offset: usize, len: usize) {
        precondition!(
            len > 0 && offset + len <= self.slot_count,
            "range [{}, {}) out of bounds for amap of {} slots",
            offset,
            offset + len,
            self.slot_count
        );
    }

    // lookup_slot never materializes storage.
    pub fn lookup_slot(&self, slot: usize) -> Option<AnonRef> {
        self.check_slot(slot);
        self.slots.get(slot).cloned()
    }

    pub fn lookup_slots(&self, slot: usize, count: usize) -> Vec<Option<AnonRef>> {
        self.check_range(slot, count);
        (slot..slot + count)
            .map(|s| self.slots.get(s).cloned())
            .collect()
    }

    // add installs anon into slot, taking over the caller's reference. With
    // replace the slot must be occupied and the old anon is handed back
    // without being unreferenced.
    pub fn add(&mut self, vm: &Vm, slot: usize, anon: AnonRef, replace: bool) -> Option<AnonRef> {
        self.check_slot(slot);
        precondition!(!self.wiped, "adding to a wiped out amap");
        let occupied = self.slots.get(slot).is_some();
        if occupied && !replace {
            precondition_failed!("slot {} is already occupied", slot);
        }
        if !occupied && replace {
            precondition_failed!("replacing empty slot {}", slot);
        }
        let old = self.slots.set(slot, anon, vm.accounting());
        if !replace {
            self.used += 1;
        }
        old
    }

    // unadd clears slot and hands its anon back without unreferencing it.
    pub fn unadd(&mut self, vm: &Vm, slot: usize) -> AnonRef {
        self.check_slot(slot);
        match self.slots.take(slot, vm.accounting()) {
            Some(anon) => {
                self.used -= 1;
                anon
            }
            None => precondition_failed!("unadd of empty slot {}", slot),
        }
    }

    pub fn populated_slots(&self, range: std::ops::Range<usize>) -> Vec<usize> {
        precondition!(
            range.start <= range.end && range.end <= self.slot_count,
            "range {:?} out of bounds for amap of {} slots",
            range,
            self.slot_count
        );
        self.slots.populated(SlotRange {
            start: range.start,
            end: range.end,
        })
    }

    // adjust_refs changes refs by delta for a reference to [offset,
    // offset+len) and returns the slots nobody references anymore. The
    // first reference that does not cover the whole amap switches to per-slot
    // counts, filled in with the count from before the change.
    fn adjust_refs(
        &mut self,
        vm: &Vm,
        offset: usize,
        len: usize,
        delta: i32,
        all: bool,
    ) -> Vec<usize> {
        let whole = all || len == self.slot_count;
        if !whole && self.ppref.is_uniform() {
            self.ppref.establish(vm, self.slots.capacity(), self.refs);
        }
        self.refs = (self.refs as i64 + delta as i64) as usize;
        let range = if whole {
            SlotRange {
                start: 0,
                end: self.slot_count,
            }
        } else {
            SlotRange::from_len(offset, len)
        };
        self.ppref.adjust(range, delta)
    }

    fn wipe_slots(&mut self, vm: &Vm, slots: Vec<usize>) {
        for slot in slots {
            if let Some(anon) = self.slots.take(slot, vm.accounting()) {
                self.used -= 1;
                Anon::unref(vm, anon);
            }
        }
    }

    // split_ref accounts for an aref being split in two. Every slot keeps
    // its count; only the uniform count stops being accurate.
    pub(crate) fn split_ref(&mut self, vm: &Vm) {
        precondition!(!self.wiped, "splitting a reference to a wiped out amap");
        if self.ppref.is_uniform() {
            self.ppref.establish(vm, self.slots.capacity(), self.refs);
        }
        self.refs += 1;
    }

    // copy_from adds a reference to every anon src holds in [offset,
    // offset+count) and installs them at the start of self.
    pub(crate) fn copy_from(&mut self, vm: &Vm, src: &AmapState, offset: usize, count: usize) {
        for slot in src.populated_slots(offset..offset + count) {
            if let Some(anon) = src.slots.get(slot) {
                anon.reference();
                self.add(vm, slot - offset, Arc::clone(anon), false);
            }
        }
    }

    // extend_slots appends delta slots seen only by the aref that ends at the
    // current end of the amap.
    pub(crate) fn extend_slots(&mut self, vm: &Vm, delta: usize, wait: WaitPolicy) -> SysResult<()> {
        precondition!(!self.wiped, "extending a wiped out amap");
        if self.refs > 1 && self.ppref.is_uniform() {
            self.ppref.establish(vm, self.slots.capacity(), self.refs);
        }
        let old = self.slot_count;
        let new = old + delta;
        if new > self.slots.capacity() {
            let charge = charge_for(new, vm.opts());
            if charge > self.charged {
                vm.kmem().acquire(charge - self.charged, wait)?;
                vm.accounting()
                    .inc(charge - self.charged, MemoryKind::AmapSlots);
            } else if charge < self.charged {
                vm.kmem().release(self.charged - charge);
                vm.accounting()
                    .dec(self.charged - charge, MemoryKind::AmapSlots);
            }
            self.charged = charge;
            self.slots.grow(new, vm.opts(), vm.accounting());
            self.ppref.grow(vm, self.slots.capacity());
            logger::debug!("amap grown to {} slots (capacity {})", new, self.capacity());
        }
        self.ppref.set_range(SlotRange { start: old, end: new }, 1);
        self.slot_count = new;
        Ok(())
    }

    pub fn check_invariants(&self) -> anyhow::Result<()> {
        if self.wiped {
            ensure!(self.used == 0, "wiped out amap still uses {} slots", self.used);
            return Ok(());
        }
        ensure!(self.refs > 0, "live amap without references");
        let populated = self.populated_slots(0..self.slot_count);
        ensure!(
            populated.len() == self.used,
            "{} populated slots but used count is {}",
            populated.len(),
            self.used
        );
        let beyond = self.slots.populated(SlotRange {
            start: self.slot_count,
            end: self.slots.capacity(),
        });
        ensure!(beyond.is_empty(), "slots {:?} populated past the end", beyond);
        if self.ppref.is_tracked() {
            for slot in 0..self.slot_count {
                let count = self.ppref.get(slot).unwrap_or_default();
                if count < 0 || count as usize > self.refs {
                    bail!(
                        "ppref of slot {} is {} with {} refs",
                        slot,
                        count,
                        self.refs
                    );
                }
                if count == 0 && self.slots.get(slot).is_some() {
                    bail!("slot {} is populated but unreferenced", slot);
                }
            }
        }
        Ok(())
    }
}
