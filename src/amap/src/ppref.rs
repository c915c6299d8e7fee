// Per-slot partial reference counts. While every aref of an amap covers the
// whole slot range the amap reference count already says how many arefs see
// each slot, so nothing is stored. The first reference to a sub-range turns
// that implicit count into an explicit array.

use pgalloc::WaitPolicy;
use usage::{Event, MemoryKind};
use utils::{precondition, SlotRange};

use crate::Vm;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Ppref {
    // every slot is referenced by all refs of the amap
    Uniform,
    Tracked(Vec<i32>),
    // tracking was given up: slots are only reclaimed at wipeout
    Untracked,
}

impl Default for Ppref {
    fn default() -> Self {
        Ppref::Uniform
    }
}

impl Ppref {
    pub(crate) fn is_uniform(&self) -> bool {
        matches!(self, Ppref::Uniform)
    }

    pub(crate) fn is_tracked(&self) -> bool {
        matches!(self, Ppref::Tracked(_))
    }

    // establish fills an array of capacity entries with refs. The array is
    // never allocated with a sleeping allocation; when that fails tracking
    // is abandoned for the life of the amap.
    pub(crate) fn establish(&mut self, vm: &Vm, capacity: usize, refs: usize) {
        if !self.is_uniform() {
            return;
        }
        if !vm.opts().track_partial_refs {
            *self = Ppref::Untracked;
            return;
        }
        match vm.kmem().acquire(capacity as u64, WaitPolicy::NoWait) {
            Ok(()) => {
                vm.accounting().inc(capacity as u64, MemoryKind::Ppref);
                vm.accounting().record(Event::PprefEstablish);
                *self = Ppref::Tracked(vec![refs as i32; capacity]);
            }
            Err(e) => {
                logger::warn!("ppref: giving up partial reference tracking: {}", e);
                *self = Ppref::Untracked;
            }
        }
    }

    // adjust adds delta to every slot of range and returns the slots whose
    // count dropped to zero.
    pub(crate) fn adjust(&mut self, range: SlotRange, delta: i32) -> Vec<usize> {
        let counts = match self {
            Ppref::Tracked(counts) => counts,
            _ => return Vec::new(),
        };
        let mut zeroed = Vec::new();
        for slot in range.iter() {
            let count = &mut counts[slot];
            *count += delta;
            precondition!(*count >= 0, "ppref of slot {} dropped below zero", slot);
            if *count == 0 && delta < 0 {
                zeroed.push(slot);
            }
        }
        zeroed
    }

    pub(crate) fn get(&self, slot: usize) -> Option<i32> {
        match self {
            Ppref::Tracked(counts) => Some(counts[slot]),
            _ => None,
        }
    }

    // effective returns the number of arefs that see slot.
    pub(crate) fn effective(&self, slot: usize, refs: usize) -> usize {
        match self {
            Ppref::Tracked(counts) => counts[slot] as usize,
            _ => refs,
        }
    }

    pub(crate) fn set_range(&mut self, range: SlotRange, value: i32) {
        if let Ppref::Tracked(counts) = self {
            for slot in range.iter() {
                counts[slot] = value;
            }
        }
    }

    // grow resizes a tracked array for a larger slot store.
    pub(crate) fn grow(&mut self, vm: &Vm, capacity: usize) {
        let old = match self {
            Ppref::Tracked(counts) if counts.len() < capacity => counts.len(),
            _ => return,
        };
        let delta = (capacity - old) as u64;
        if let Err(e) = vm.kmem().acquire(delta, WaitPolicy::NoWait) {
            logger::warn!("ppref: cannot grow to {} slots: {}", capacity, e);
            self.release(vm);
            *self = Ppref::Untracked;
            return;
        }
        vm.accounting().inc(delta, MemoryKind::Ppref);
        if let Ppref::Tracked(counts) = self {
            counts.resize(capacity, 0);
        }
    }

    // release hands the array back. The state is left as it was so a wiped
    // amap still reports how it was shared.
    pub(crate) fn release(&mut self, vm: &Vm) {
        if let Ppref::Tracked(counts) = self {
            let n = counts.len() as u64;
            vm.kmem().release(n);
            vm.accounting().dec(n, MemoryKind::Ppref);
            counts.clear();
        }
    }
}
