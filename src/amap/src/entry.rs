use mem::{AccessType, Addr, AddrRange, PAGE_SIZE};
use utils::{bail_libc, precondition, SysError, SysResult};

use crate::{anon::AnonRef, aref::Aref, Vm};

// MapEntry is the part of a virtual memory map entry the anonymous memory
// layer works with: a page aligned range, its protections, its COW state and
// the aref of the amap backing it, if one was created yet.
#[derive(Debug)]
pub struct MapEntry {
    start: Addr,
    end: Addr,
    pub(crate) aref: Option<Aref>,
    pub prot: AccessType,
    pub max_prot: AccessType,
    // private mapping: writes must not be visible through other entries
    pub cow: bool,
    // the amap may still be shared with other entries and must be copied
    // before the first write
    pub needs_copy: bool,
    pub wired: bool,
}

impl MapEntry {
    // new_anonymous describes a fresh private anonymous mapping. Its amap is
    // created by the first write fault.
    pub fn new_anonymous(start: Addr, len: u64, prot: AccessType) -> SysResult<Self> {
        if len == 0 || !start.is_page_aligned() || len % PAGE_SIZE as u64 != 0 {
            bail_libc!(libc::EINVAL);
        }
        let end = start.add_length(len).ok_or_else(|| SysError::new(libc::EINVAL))?;
        Ok(Self {
            start,
            end,
            aref: None,
            prot,
            max_prot: AccessType::any_access(),
            cow: true,
            needs_copy: true,
            wired: false,
        })
    }

    pub(crate) fn with_aref(&self, start: Addr, end: Addr, aref: Option<Aref>) -> Self {
        Self {
            start,
            end,
            aref,
            prot: self.prot,
            max_prot: self.max_prot,
            cow: self.cow,
            needs_copy: self.needs_copy,
            wired: self.wired,
        }
    }

    pub fn start(&self) -> Addr {
        self.start
    }

    pub fn end(&self) -> Addr {
        self.end
    }

    pub fn range(&self) -> AddrRange {
        AddrRange {
            start: self.start.0,
            end: self.end.0,
        }
    }

    pub(crate) fn set_end(&mut self, end: Addr) {
        self.end = end;
    }

    pub fn pages(&self) -> usize {
        self.end.pages_from(self.start)
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.range().contains(addr.0)
    }

    pub fn aref(&self) -> Option<&Aref> {
        self.aref.as_ref()
    }

    pub fn page_index(&self, addr: Addr) -> usize {
        precondition!(
            self.contains(addr),
            "{} is outside of entry [{}, {})",
            addr,
            self.start,
            self.end
        );
        addr.round_down().pages_from(self.start)
    }

    pub fn lookup(&self, addr: Addr) -> Option<AnonRef> {
        let index = self.page_index(addr);
        self.aref.as_ref().and_then(|aref| aref.lookup(index))
    }

    pub fn lookups(&self, addr: Addr, pages: usize) -> Vec<Option<AnonRef>> {
        let index = self.page_index(addr);
        precondition!(
            pages > 0 && index + pages <= self.pages(),
            "lookup of {} pages at {} in entry [{}, {})",
            pages,
            addr,
            self.start,
            self.end
        );
        match &self.aref {
            Some(aref) => aref.lookups(index, pages),
            None => vec![None; pages],
        }
    }

    // clip splits the entry at addr. self keeps [start, addr) and the
    // returned entry covers [addr, end).
    pub fn clip(&mut self, vm: &Vm, addr: Addr) -> MapEntry {
        precondition!(
            addr.is_page_aligned() && self.range().can_split_at(addr.0),
            "cannot split [{}, {}) at {}",
            self.start,
            self.end,
            addr
        );
        let split = addr.pages_from(self.start);
        let pages = self.pages();
        let aref = self
            .aref
            .as_ref()
            .map(|aref| crate::cow::splitref(vm, aref, pages, split));
        let tail = self.with_aref(addr, self.end, aref);
        self.end = addr;
        tail
    }

    // unmap drops the entry's reference on its amap and tears down its
    // translations.
    pub fn unmap(self, vm: &Vm) {
        let pages = self.pages();
        vm.pmap().remove(self.range());
        if let Some(aref) = self.aref {
            aref.release(vm, pages);
        }
    }
}
