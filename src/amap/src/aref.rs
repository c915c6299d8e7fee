use std::sync::Arc;

use crate::{
    amap::{Amap, AmapRef, RefFlags},
    anon::AnonRef,
    Vm,
};

// Aref is one reference to an amap: the map entry that holds it sees the
// amap's slots starting at offset. Aref is not Clone: a second reference is
// taken through the amap so its counts stay right.
#[derive(Debug)]
pub struct Aref {
    offset: usize,
    amap: AmapRef,
}

impl Aref {
    // new wraps a reference the caller already took on amap.
    pub(crate) fn new(amap: AmapRef, offset: usize) -> Self {
        Self { offset, amap }
    }

    // new_ref takes a fresh reference on [offset, offset+len) of amap.
    pub(crate) fn new_ref(vm: &Vm, amap: &AmapRef, offset: usize, len: usize, flags: RefFlags) -> Self {
        amap.ref_range(vm, offset, len, flags);
        Self::new(Arc::clone(amap), offset)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn amap(&self) -> &AmapRef {
        &self.amap
    }

    pub fn slot(&self, index: usize) -> usize {
        self.offset + index
    }

    pub fn lookup(&self, index: usize) -> Option<AnonRef> {
        self.amap.lock().lookup_slot(self.slot(index))
    }

    pub fn lookups(&self, index: usize, count: usize) -> Vec<Option<AnonRef>> {
        self.amap.lock().lookup_slots(self.slot(index), count)
    }

    // release drops the reference this aref holds on len slots.
    pub(crate) fn release(self, vm: &Vm, len: usize) {
        Amap::unref(&self.amap, vm, self.offset, len, false);
    }

    pub fn same_amap(&self, other: &Aref) -> bool {
        Arc::ptr_eq(&self.amap, &other.amap)
    }
}
