use std::sync::Arc;

use mem::{AccessType, Addr};
use pgalloc::WaitPolicy;
use usage::Event;
use utils::{bail_libc, SysError, SysResult};

use crate::{
    anon::{Anon, AnonRef},
    cow::copy_private,
    entry::MapEntry,
    Vm,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    // read of a page never written: reads as zeros, nothing allocated
    ZeroFillRead,
    // first write of a page: a zeroed anon was installed
    ZeroFill,
    Resident,
    // the page was read back from swap
    SwapIn,
    // write to a shared anon: a private copy replaced it
    CowBreak,
}

#[derive(Debug)]
pub struct FaultOutcome {
    pub kind: FaultKind,
    pub anon: Option<AnonRef>,
    // protection the page was entered with
    pub prot: AccessType,
}

// handle_fault resolves a fault at addr inside entry for an access of the
// given kind. The amap lock is never held across page allocation or swap
// reads; each time it is retaken the slot is checked to still hold the anon
// that was worked on.
pub fn handle_fault(
    vm: &Vm,
    entry: &mut MapEntry,
    addr: Addr,
    access: AccessType,
    wait: WaitPolicy,
) -> SysResult<FaultOutcome> {
    if !entry.contains(addr) || !entry.prot.is_superset_of(access) {
        logger::debug!("fault at {} with {:?} denied", addr, access);
        bail_libc!(libc::EFAULT);
    }
    if access.write && (entry.needs_copy || entry.aref().is_none()) {
        copy_private(vm, entry, wait)?;
    }
    let page_addr = addr.round_down();
    let index = entry.page_index(addr);
    let zero_read = FaultOutcome {
        kind: FaultKind::ZeroFillRead,
        anon: None,
        prot: entry.prot.without_write(),
    };
    let aref = match entry.aref() {
        Some(aref) => aref,
        None => return Ok(zero_read),
    };
    let amap = aref.amap();
    let slot = aref.slot(index);

    loop {
        let anon = amap.lock().lookup_slot(slot);
        let anon = match anon {
            Some(anon) => anon,
            None if !access.write => return Ok(zero_read),
            None => {
                let fresh = Anon::allocate_zeroed(vm, wait)?;
                let mut st = amap.lock();
                if st.lookup_slot(slot).is_some() {
                    drop(st);
                    Anon::unref(vm, fresh);
                    continue;
                }
                st.add(vm, slot, Arc::clone(&fresh), false);
                if let Some(frame) = fresh.frame() {
                    vm.pmap().enter(page_addr, frame, entry.prot);
                }
                return Ok(FaultOutcome {
                    kind: FaultKind::ZeroFill,
                    anon: Some(fresh),
                    prot: entry.prot,
                });
            }
        };

        let swapped = anon.swap_slot().is_some();
        let guard = match anon.lock_and_get_page(vm, wait) {
            Ok(guard) => guard,
            Err(e) if e.code() == libc::EAGAIN => continue,
            Err(e) => return Err(e),
        };
        let refs = guard.refs();

        if access.write && refs > 1 {
            let copy = match Anon::copy_page(vm, guard, wait)? {
                Some(copy) => copy,
                None => continue,
            };
            let mut st = amap.lock();
            if !matches!(st.lookup_slot(slot), Some(cur) if Arc::ptr_eq(&cur, &anon)) {
                drop(st);
                Anon::unref(vm, copy);
                continue;
            }
            if let Some(old) = st.add(vm, slot, Arc::clone(&copy), true) {
                Anon::unref(vm, old);
            }
            vm.accounting().record(Event::CowBreak);
            logger::debug!(
                "cow break at {}: anon {} replaced by anon {}",
                page_addr,
                anon.id(),
                copy.id()
            );
            if let Some(frame) = copy.frame() {
                vm.pmap().enter(page_addr, frame, entry.prot);
            }
            return Ok(FaultOutcome {
                kind: FaultKind::CowBreak,
                anon: Some(copy),
                prot: entry.prot,
            });
        }

        let frame = guard.page().frame();
        drop(guard);
        let st = amap.lock();
        if !matches!(st.lookup_slot(slot), Some(cur) if Arc::ptr_eq(&cur, &anon)) {
            continue;
        }
        let prot = if refs > 1 || entry.needs_copy {
            entry.prot.without_write()
        } else {
            entry.prot
        };
        vm.pmap().enter(page_addr, frame, prot);
        drop(st);
        return Ok(FaultOutcome {
            kind: if swapped {
                FaultKind::SwapIn
            } else {
                FaultKind::Resident
            },
            anon: Some(anon),
            prot,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{
        context::tests::{recording_vm, vm, vm_with, PmapOp},
        cow::{copy, share, tests::first_byte},
        VmOpts,
    };

    const BASE: Addr = Addr(0x100000);

    fn entry(pages: usize) -> MapEntry {
        MapEntry::new_anonymous(BASE, mem::pages_to_bytes(pages), AccessType::read_write())
            .unwrap()
    }

    fn write(vm: &Vm, e: &mut MapEntry, page: usize, fill: u8) -> FaultOutcome {
        let out = handle_fault(
            vm,
            e,
            BASE.add_pages(page),
            AccessType::write(),
            WaitPolicy::NoWait,
        )
        .unwrap();
        if let Some(anon) = &out.anon {
            anon.lock_and_get_page(vm, WaitPolicy::NoWait)
                .unwrap()
                .page_mut()
                .as_mut_slice()[0] = fill;
        }
        out
    }

    fn read(vm: &Vm, e: &mut MapEntry, page: usize) -> FaultOutcome {
        handle_fault(
            vm,
            e,
            BASE.add_pages(page),
            AccessType::read(),
            WaitPolicy::NoWait,
        )
        .unwrap()
    }

    #[test]
    fn read_of_untouched_page_allocates_nothing() {
        let vm = vm();
        let mut e = entry(4);
        let out = read(&vm, &mut e, 2);
        assert_eq!(out.kind, FaultKind::ZeroFillRead);
        assert!(out.anon.is_none());
        assert!(e.aref().is_none());
        assert_eq!(vm.anon_pool().live(), 0);
    }

    #[test]
    fn first_write_installs_a_zeroed_anon() {
        let (vm, pmap) = recording_vm(VmOpts::default());
        let mut e = entry(4);
        let out = write(&vm, &mut e, 1, 0);
        assert_eq!(out.kind, FaultKind::ZeroFill);
        let anon = out.anon.unwrap();
        assert_eq!(anon.refs(), 1);
        assert!(!e.needs_copy);
        assert_eq!(
            *pmap.ops.lock().unwrap(),
            vec![PmapOp::Enter(
                BASE.add_pages(1),
                anon.frame().unwrap(),
                AccessType::read_write()
            )]
        );
        let again = read(&vm, &mut e, 1);
        assert_eq!(again.kind, FaultKind::Resident);
        assert!(Arc::ptr_eq(again.anon.as_ref().unwrap(), &anon));
        assert_eq!(read(&vm, &mut e, 3).kind, FaultKind::ZeroFillRead);
    }

    #[test]
    fn faults_outside_the_entry_or_its_rights_fail() {
        let vm = vm();
        let mut e = entry(2);
        e.prot = AccessType::read();
        for (addr, access) in vec![
            (BASE.add_pages(2), AccessType::read()),
            (Addr(BASE.0 - 1), AccessType::read()),
            (BASE, AccessType::write()),
            (BASE, AccessType::execute()),
        ] {
            assert_eq!(
                handle_fault(&vm, &mut e, addr, access, WaitPolicy::NoWait).unwrap_err(),
                SysError::new(libc::EFAULT)
            );
        }
    }

    // One anon in slot 5 of a 20 slot amap; a lazy fork followed by a write
    // in the child gives the child a fresh copy and leaves the first anon to
    // the parent.
    #[test]
    fn write_after_lazy_copy_breaks_sharing() {
        let vm = vm_with(VmOpts {
            chunk_slots: 16,
            ..VmOpts::default()
        });
        let mut parent = entry(20);
        let a = write(&vm, &mut parent, 5, 0xa5).anon.unwrap();
        let mut child = copy(&vm, &mut parent, WaitPolicy::NoWait, false, None).unwrap();
        assert_eq!(parent.aref().unwrap().amap().lock().refs(), 2);
        // one amap holds a, so its count stays at one until the child copies
        assert_eq!(a.refs(), 1);
        vm.check_anon_refcounts().unwrap();

        let out = write(&vm, &mut child, 5, 0xb5);
        assert_eq!(out.kind, FaultKind::CowBreak);
        let b = out.anon.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.refs(), 1);
        assert_eq!(b.refs(), 1);
        assert_eq!(first_byte(&vm, &a), 0xa5);
        assert_eq!(first_byte(&vm, &b), 0xb5);
        assert!(Arc::ptr_eq(&parent.lookup(BASE.add_pages(5)).unwrap(), &a));
        assert_eq!(vm.stats().cow_breaks, 1);
        vm.check_anon_refcounts().unwrap();

        // the parent is the only user of its amap and its anon now
        assert_eq!(write(&vm, &mut parent, 5, 0xa6).kind, FaultKind::Resident);
        assert_eq!(vm.stats().cow_breaks, 1);
    }

    #[test]
    fn read_of_a_shared_anon_maps_it_read_only() {
        let vm = vm();
        let mut parent = entry(2);
        write(&vm, &mut parent, 0, 1);
        let mut child = copy(&vm, &mut parent, WaitPolicy::NoWait, true, None).unwrap();
        let out = read(&vm, &mut child, 0);
        assert_eq!(out.kind, FaultKind::Resident);
        assert_eq!(out.prot, AccessType::read());
    }

    #[test]
    fn fault_on_swapped_page_reads_it_back() {
        let vm = vm();
        vm.swap().add_device(4).unwrap();
        let mut e = entry(2);
        let anon = write(&vm, &mut e, 0, 0x5a).anon.unwrap();
        anon.page_out(&vm).unwrap();
        let out = read(&vm, &mut e, 0);
        assert_eq!(out.kind, FaultKind::SwapIn);
        assert!(anon.is_resident());
        assert_eq!(first_byte(&vm, &anon), 0x5a);
        assert_eq!(vm.accounting().count(Event::PageIn), 1);
    }

    #[test]
    fn write_fault_without_memory_fails() {
        let vm = vm_with(VmOpts {
            max_pages: 1,
            ..VmOpts::default()
        });
        let mut e = entry(2);
        write(&vm, &mut e, 0, 1);
        let err = handle_fault(
            &vm,
            &mut e,
            BASE.add_pages(1),
            AccessType::write(),
            WaitPolicy::NoWait,
        )
        .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(e.aref().unwrap().amap().lock().used(), 1);
    }

    // The copy of a COW break waits for its frame with the anon unlocked, so
    // readers of the shared page are not held up meanwhile.
    #[test]
    fn cow_break_waiting_for_a_frame_leaves_the_anon_unlocked() {
        let vm = Arc::new(vm_with(VmOpts {
            max_pages: 2,
            ..VmOpts::default()
        }));
        let mut parent = entry(4);
        let a = write(&vm, &mut parent, 0, 0xa5).anon.unwrap();
        let mut other = entry(1);
        write(&vm, &mut other, 0, 1);
        let mut child = copy(&vm, &mut parent, WaitPolicy::NoWait, false, None).unwrap();

        let breaker = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                let out = handle_fault(
                    &vm,
                    &mut child,
                    BASE,
                    AccessType::write(),
                    WaitPolicy::Wait,
                )
                .unwrap();
                (out.kind, child)
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(first_byte(&vm, &a), 0xa5);
        other.unmap(&vm);

        let (kind, child) = breaker.join().unwrap();
        assert_eq!(kind, FaultKind::CowBreak);
        assert_eq!(a.refs(), 1);
        vm.check_anon_refcounts().unwrap();
        child.unmap(&vm);
        parent.unmap(&vm);
        assert_eq!(vm.pages().pages_in_use(), 0);
    }

    #[test]
    fn concurrent_writes_to_a_shared_amap_install_one_anon() {
        let vm = Arc::new(vm());
        let mut first = entry(8);
        write(&vm, &mut first, 0, 1);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mut e = share(&vm, &mut first, WaitPolicy::NoWait).unwrap();
            e.cow = false;
            let vm = Arc::clone(&vm);
            handles.push(thread::spawn(move || {
                let mut anons = Vec::new();
                for page in 1..8 {
                    let out = handle_fault(
                        &vm,
                        &mut e,
                        BASE.add_pages(page),
                        AccessType::write(),
                        WaitPolicy::Wait,
                    )
                    .unwrap();
                    anons.push(out.anon.unwrap());
                }
                (e, anons)
            }));
        }
        let mut seen: Vec<Vec<AnonRef>> = Vec::new();
        for handle in handles {
            let (e, anons) = handle.join().unwrap();
            seen.push(anons);
            e.unmap(&vm);
        }
        for page in 0..7 {
            for anons in &seen[1..] {
                assert!(Arc::ptr_eq(&anons[page], &seen[0][page]));
            }
        }
        assert_eq!(first.aref().unwrap().amap().lock().used(), 8);
        vm.check_anon_refcounts().unwrap();
        first.unmap(&vm);
        assert_eq!(vm.anon_pool().live(), 0);
    }
}
