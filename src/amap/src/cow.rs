// Fork, copy-on-write resolution, splitting and growth of the amap reference
// held by a map entry. Callers hold the entry mutably, which serializes every
// operation on the same entry.

use std::sync::Arc;

use mem::{page_count, AccessType, Addr, AddrRange, PAGE_SIZE};
use pgalloc::WaitPolicy;
use usage::Event;
use utils::{bail_libc, precondition, precondition_failed, SysError, SysResult};

use crate::{
    amap::{Amap, RefFlags},
    anon::Anon,
    aref::Aref,
    entry::MapEntry,
    Vm,
};

fn write_protect(vm: &Vm, entry: &MapEntry) {
    if entry.prot.write {
        vm.pmap().protect(entry.range(), entry.prot.without_write());
    }
}

// copy prepares the amap side of a fork of the part of entry covering range
// (the whole entry by default) and returns the child's entry. The lazy path
// only takes another reference on the amap and leaves both sides to copy it
// on their first write. With force_now the child gets its own amap right away
// sharing the parent's anons, which are duplicated too if the parent is
// wired.
pub fn copy(
    vm: &Vm,
    entry: &mut MapEntry,
    wait: WaitPolicy,
    force_now: bool,
    range: Option<AddrRange>,
) -> SysResult<MapEntry> {
    let range = range.unwrap_or_else(|| entry.range());
    precondition!(
        !range.is_empty()
            && entry.range().is_superset_of(&range)
            && Addr(range.start).is_page_aligned()
            && Addr(range.end).is_page_aligned(),
        "copy of {:?} from entry {:?}",
        range,
        entry.range()
    );
    let (start, end) = (Addr(range.start), Addr(range.end));
    let index = start.pages_from(entry.start());
    let pages = page_count(range.len());

    let src = match &entry.aref {
        Some(aref) => aref,
        None => {
            let mut child = entry.with_aref(start, end, None);
            child.cow = true;
            child.needs_copy = true;
            child.wired = false;
            return Ok(child);
        }
    };

    if !force_now {
        let aref = Aref::new_ref(vm, src.amap(), src.slot(index), pages, RefFlags::default());
        entry.cow = true;
        entry.needs_copy = true;
        write_protect(vm, entry);
        let mut child = entry.with_aref(start, end, Some(aref));
        child.wired = false;
        return Ok(child);
    }

    let amap = Amap::alloc(vm, pages, 0, wait)?;
    {
        let src_st = src.amap().lock();
        amap.lock().copy_from(vm, &src_st, src.slot(index), pages);
    }
    write_protect(vm, entry);
    let mut child = entry.with_aref(start, end, Some(Aref::new(amap, 0)));
    child.cow = true;
    child.needs_copy = false;
    child.wired = false;
    if entry.wired {
        if let Err(e) = cow_now(vm, &mut child, wait) {
            if let Some(aref) = child.aref.take() {
                aref.release(vm, pages);
            }
            return Err(e);
        }
    }
    Ok(child)
}

// copy_private gives entry an amap nobody else writes through. An entry
// without an amap gets a fresh one; an entry that is the only user of its
// amap keeps it.
pub fn copy_private(vm: &Vm, entry: &mut MapEntry, wait: WaitPolicy) -> SysResult<()> {
    let pages = entry.pages();
    let aref = match &entry.aref {
        Some(aref) => aref,
        None => {
            let amap = Amap::alloc(vm, pages, 0, wait)?;
            entry.aref = Some(Aref::new(amap, 0));
            entry.needs_copy = false;
            return Ok(());
        }
    };
    if !entry.needs_copy {
        return Ok(());
    }
    if aref.amap().lock().refs() == 1 {
        entry.needs_copy = false;
        return Ok(());
    }

    let amap = Amap::alloc(vm, pages, 0, wait)?;
    {
        let src = aref.amap().lock();
        amap.lock().copy_from(vm, &src, aref.offset(), pages);
    }
    logger::trace!(
        "entry [{}, {}): private copy of amap {} into amap {}",
        entry.start(),
        entry.end(),
        aref.amap().key(),
        amap.key()
    );
    if let Some(old) = entry.aref.replace(Aref::new(amap, 0)) {
        old.release(vm, pages);
    }
    entry.needs_copy = false;
    Ok(())
}

// cow_now replaces every anon of entry that is also referenced elsewhere by
// a private copy. The page copy happens with the amap unlocked, so the slot
// is looked up again before the copy is installed.
pub fn cow_now(vm: &Vm, entry: &mut MapEntry, wait: WaitPolicy) -> SysResult<()> {
    precondition!(!entry.needs_copy, "cow_now on an entry that still needs a copy");
    let aref = match &entry.aref {
        Some(aref) => aref,
        None => return Ok(()),
    };
    let amap = aref.amap();
    let start = aref.offset();
    let populated = amap.lock().populated_slots(start..start + entry.pages());
    for slot in populated {
        loop {
            let anon = amap.lock().lookup_slot(slot);
            let anon = match anon {
                Some(anon) if anon.refs() > 1 => anon,
                _ => break,
            };
            let copy = {
                let guard = match anon.lock_and_get_page(vm, wait) {
                    Ok(guard) => guard,
                    Err(e) if e.code() == libc::EAGAIN => continue,
                    Err(e) => return Err(e),
                };
                match Anon::copy_page(vm, guard, wait)? {
                    Some(copy) => copy,
                    None => continue,
                }
            };
            let mut st = amap.lock();
            let current = st.lookup_slot(slot);
            match current {
                Some(cur) if Arc::ptr_eq(&cur, &anon) && anon.refs() > 1 => {}
                _ => {
                    drop(st);
                    Anon::unref(vm, copy);
                    continue;
                }
            }
            if let Some(old) = st.add(vm, slot, copy, true) {
                Anon::unref(vm, old);
            }
            vm.accounting().record(Event::CowBreak);
            break;
        }
    }
    Ok(())
}

// extend grows entry to new_len bytes. The aref must end where its amap
// ends; the new slots are seen by this aref only.
pub fn extend(vm: &Vm, entry: &mut MapEntry, new_len: u64, wait: WaitPolicy) -> SysResult<()> {
    if new_len % PAGE_SIZE as u64 != 0 {
        bail_libc!(libc::EINVAL);
    }
    let pages = entry.pages();
    let new_pages = page_count(new_len);
    precondition!(
        new_pages >= pages,
        "extend cannot shrink an entry from {} to {} pages",
        pages,
        new_pages
    );
    if new_pages == pages {
        return Ok(());
    }
    let new_end = entry
        .start()
        .add_length(new_len)
        .ok_or_else(|| SysError::new(libc::EINVAL))?;
    if let Some(aref) = &entry.aref {
        let mut st = aref.amap().lock();
        precondition!(
            aref.offset() + pages == st.slot_count(),
            "extending an aref at offset {} of {} pages that does not end at slot {}",
            aref.offset(),
            pages,
            st.slot_count()
        );
        st.extend_slots(vm, new_pages - pages, wait)?;
    }
    entry.set_end(new_end);
    Ok(())
}

// splitref returns a new aref covering the part of src, an aref of len slots,
// from split slots on. Slot data stays where it is.
pub fn splitref(vm: &Vm, src: &Aref, len: usize, split: usize) -> Aref {
    let mut st = src.amap().lock();
    precondition!(
        split > 0 && split < len && src.offset() + len <= st.slot_count(),
        "splitref at {} of an aref of {} slots at offset {} in an amap of {} slots",
        split,
        len,
        src.offset(),
        st.slot_count()
    );
    st.split_ref(vm);
    drop(st);
    Aref::new(Arc::clone(src.amap()), src.offset() + split)
}

// share returns an entry that shares entry's amap: writes through either are
// seen by both.
pub fn share(vm: &Vm, entry: &mut MapEntry, wait: WaitPolicy) -> SysResult<MapEntry> {
    copy_private(vm, entry, wait)?;
    let pages = entry.pages();
    let aref = match &entry.aref {
        Some(aref) => Aref::new_ref(
            vm,
            aref.amap(),
            aref.offset(),
            pages,
            RefFlags {
                shared: true,
                all: false,
            },
        ),
        None => precondition_failed!("entry has no amap after copy_private"),
    };
    let mut child = entry.with_aref(entry.start(), entry.end(), Some(aref));
    child.wired = false;
    Ok(child)
}

// share_protect changes the protection of entry. Making a private entry
// writable first gives it its own copy of every page; taking rights away
// from an entry whose amap is shared revokes them on each resident page so
// the other sharers lose them too.
pub fn share_protect(
    vm: &Vm,
    entry: &mut MapEntry,
    new_prot: AccessType,
    wait: WaitPolicy,
) -> SysResult<()> {
    if !entry.max_prot.is_superset_of(new_prot) {
        bail_libc!(libc::EACCES);
    }
    if entry.cow && entry.prot.is_widened_by(new_prot) && entry.aref.is_some() {
        copy_private(vm, entry, wait)?;
        cow_now(vm, entry, wait)?;
    } else if !new_prot.is_superset_of(entry.prot) {
        if let (false, Some(aref)) = (entry.cow, &entry.aref) {
            let st = aref.amap().lock();
            if st.is_shared() || st.refs() > 1 {
                let start = aref.offset();
                for slot in st.populated_slots(start..start + entry.pages()) {
                    if let Some(anon) = st.lookup_slot(slot) {
                        if let Some(page) = anon.lock().page() {
                            vm.pmap().page_protect(page.frame(), new_prot);
                        }
                    }
                }
            }
        }
        vm.pmap().protect(entry.range(), new_prot);
    }
    entry.prot = new_prot;
    Ok(())
}
