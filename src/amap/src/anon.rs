// Anon: one page of anonymous memory. An anon is either resident (owns a
// page), swapped (owns a swap slot) or untouched (owns neither and reads as
// zeros). Its refcount is the number of (amap, slot) pairs holding it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use pgalloc::{FrameNumber, Page, WaitPolicy};
use swap::SwapSlot;
use usage::{Event, MemoryKind};
use utils::{precondition, SysError, SysResult};

use crate::Vm;

pub type AnonRef = Arc<Anon>;

#[derive(Debug)]
pub struct AnonPool {
    limit: u64,
    live: AtomicU64,
    next_id: AtomicU64,
}

impl AnonPool {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            live: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    fn take(&self) -> SysResult<u64> {
        let limit = self.limit;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                if live < limit {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .map_err(|_| {
                SysError::no_memory_with_msg(format!("anon pool exhausted ({} live)", limit))
            })?;
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn put(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct AnonState {
    refs: usize,
    page: Option<Page>,
    swap_slot: Option<SwapSlot>,
}

impl AnonState {
    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }
}

#[derive(Debug)]
pub struct Anon {
    id: u64,
    state: Mutex<AnonState>,
}

// AnonPageGuard holds the anon lock of a resident anon.
pub struct AnonPageGuard<'a> {
    state: MutexGuard<'a, AnonState>,
}

impl<'a> AnonPageGuard<'a> {
    pub fn page(&self) -> &Page {
        match &self.state.page {
            Some(page) => page,
            None => panic!("resident anon lost its page"),
        }
    }

    pub fn page_mut(&mut self) -> &mut Page {
        match &mut self.state.page {
            Some(page) => page,
            None => panic!("resident anon lost its page"),
        }
    }

    pub fn refs(&self) -> usize {
        self.state.refs
    }
}

impl Anon {
    // allocate returns an anon with one reference and no backing page yet.
    pub fn allocate(vm: &Vm) -> SysResult<AnonRef> {
        let id = vm.anon_pool().take()?;
        vm.accounting().record(Event::AnonAlloc);
        Ok(Arc::new(Anon {
            id,
            state: Mutex::new(AnonState {
                refs: 1,
                page: None,
                swap_slot: None,
            }),
        }))
    }

    fn allocate_with(vm: &Vm, page: SysResult<Page>) -> SysResult<AnonRef> {
        let page = page?;
        let anon = match Anon::allocate(vm) {
            Ok(anon) => anon,
            Err(e) => {
                vm.pages().free(page);
                return Err(e);
            }
        };
        anon.state.lock().unwrap().page = Some(page);
        vm.accounting().inc(1, MemoryKind::Anonymous);
        Ok(anon)
    }

    pub fn allocate_zeroed(vm: &Vm, wait: WaitPolicy) -> SysResult<AnonRef> {
        Anon::allocate_with(vm, vm.pages().alloc(wait))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn refs(&self) -> usize {
        self.state.lock().unwrap().refs
    }

    pub fn is_resident(&self) -> bool {
        self.state.lock().unwrap().page.is_some()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.state.lock().unwrap().swap_slot
    }

    // frame returns the frame holding the page of a resident anon.
    pub fn frame(&self) -> Option<FrameNumber> {
        self.state.lock().unwrap().page.as_ref().map(Page::frame)
    }

    pub fn lock(&self) -> MutexGuard<'_, AnonState> {
        self.state.lock().unwrap()
    }

    // reference adds the reference of one more (amap, slot) pair.
    pub fn reference(&self) {
        let mut st = self.state.lock().unwrap();
        precondition!(st.refs > 0, "referencing freed anon {}", self.id);
        st.refs += 1;
    }

    // unref drops one reference and frees the anon when it was the last one.
    // Returns whether the anon was freed.
    pub fn unref(vm: &Vm, anon: AnonRef) -> bool {
        let last = {
            let mut st = anon.state.lock().unwrap();
            precondition!(st.refs > 0, "unref of freed anon {}", anon.id);
            st.refs -= 1;
            st.refs == 0
        };
        if last {
            anon.free(vm);
        }
        last
    }

    // free releases the page or swap slot of an anon nobody references.
    pub fn free(&self, vm: &Vm) {
        let (page, slot) = {
            let mut st = self.state.lock().unwrap();
            precondition!(st.refs == 0, "freeing anon {} with {} refs", self.id, st.refs);
            (st.page.take(), st.swap_slot.take())
        };
        if let Some(page) = page {
            vm.pages().free(page);
            vm.accounting().dec(1, MemoryKind::Anonymous);
        }
        if let Some(slot) = slot {
            vm.swap().free_slot(slot);
            vm.accounting().dec(1, MemoryKind::Swapped);
        }
        vm.anon_pool().put();
        vm.accounting().record(Event::AnonFree);
        logger::trace!("anon {} freed", self.id);
    }

    // lock_and_get_page locks the anon and makes its page resident, reading
    // it back from swap if needed. The caller must not hold the lock of any
    // amap: the read may sleep. A frame is never waited for with the anon
    // locked; the lock is dropped for the wait and the anon checked again.
    // Fails with EAGAIN if the anon was freed meanwhile, in which case the
    // caller has to look the slot up again.
    pub fn lock_and_get_page(&self, vm: &Vm, wait: WaitPolicy) -> SysResult<AnonPageGuard<'_>> {
        loop {
            let mut st = self.state.lock().unwrap();
            if st.refs == 0 {
                return Err(SysError::new(libc::EAGAIN));
            }
            if st.page.is_some() {
                return Ok(AnonPageGuard { state: st });
            }
            let mut page = match vm.pages().alloc(WaitPolicy::NoWait) {
                Ok(page) => page,
                Err(_) if wait == WaitPolicy::Wait => {
                    drop(st);
                    vm.pages().wait_for_frame();
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(slot) = st.swap_slot {
                if let Err(e) = vm.swap().read(slot, page.as_mut_slice()) {
                    logger::warn!("anon {}: page in from {} failed: {}", self.id, slot, e);
                    vm.pages().free(page);
                    return Err(e);
                }
                st.swap_slot = None;
                vm.swap().free_slot(slot);
                vm.accounting()
                    .change_memory_kind(1, MemoryKind::Anonymous, MemoryKind::Swapped);
                vm.accounting().record(Event::PageIn);
                logger::trace!("anon {}: paged in from {}", self.id, slot);
            } else {
                vm.accounting().inc(1, MemoryKind::Anonymous);
            }
            st.page = Some(page);
            return Ok(AnonPageGuard { state: st });
        }
    }

    // copy_page returns a new anon holding a copy of the page guard locks.
    // When no frame is free and the caller may wait, the guard is released
    // before sleeping and None is returned: whatever the caller looked up
    // has to be looked up again.
    pub(crate) fn copy_page(
        vm: &Vm,
        guard: AnonPageGuard<'_>,
        wait: WaitPolicy,
    ) -> SysResult<Option<AnonRef>> {
        let page = match vm.pages().alloc_copy(guard.page(), WaitPolicy::NoWait) {
            Ok(page) => page,
            Err(_) if wait == WaitPolicy::Wait => {
                drop(guard);
                vm.pages().wait_for_frame();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        drop(guard);
        Anon::allocate_with(vm, Ok(page)).map(Some)
    }

    // page_out moves the page of a resident anon into a swap slot.
    pub fn page_out(&self, vm: &Vm) -> SysResult<()> {
        let mut st = self.state.lock().unwrap();
        precondition!(st.refs > 0, "paging out freed anon {}", self.id);
        let page = match st.page.take() {
            Some(page) => page,
            None => return Ok(()),
        };
        let slot = match vm.swap().alloc_slot() {
            Ok(slot) => slot,
            Err(e) => {
                st.page = Some(page);
                return Err(e);
            }
        };
        if let Err(e) = vm.swap().write(slot, page.as_slice()) {
            vm.swap().free_slot(slot);
            st.page = Some(page);
            return Err(e);
        }
        st.swap_slot = Some(slot);
        vm.pages().free(page);
        vm.accounting()
            .change_memory_kind(1, MemoryKind::Swapped, MemoryKind::Anonymous);
        vm.accounting().record(Event::PageOut);
        logger::trace!("anon {}: paged out to {}", self.id, slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::{context::tests::vm_with, Amap, VmOpts};

    #[test]
    fn allocate_starts_with_one_ref_and_no_page() {
        let vm = vm_with(VmOpts::default());
        let anon = Anon::allocate(&vm).unwrap();
        assert_eq!(anon.refs(), 1);
        assert!(!anon.is_resident());
        assert!(anon.swap_slot().is_none());
        assert!(Anon::unref(&vm, anon));
        assert_eq!(vm.anon_pool().live(), 0);
    }

    #[test]
    fn pool_exhaustion_is_out_of_memory() {
        let vm = vm_with(VmOpts {
            max_anons: 2,
            ..VmOpts::default()
        });
        let _a = Anon::allocate(&vm).unwrap();
        let _b = Anon::allocate(&vm).unwrap();
        let err = Anon::allocate(&vm).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(err.code(), libc::ENOMEM);
    }

    #[test]
    fn failed_anon_allocation_returns_the_page() {
        let vm = vm_with(VmOpts {
            max_anons: 1,
            ..VmOpts::default()
        });
        let _a = Anon::allocate(&vm).unwrap();
        assert!(Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).is_err());
        assert_eq!(vm.pages().pages_in_use(), 0);
    }

    #[test]
    fn untouched_anon_materializes_zero_page() {
        let vm = vm_with(VmOpts::default());
        let anon = Anon::allocate(&vm).unwrap();
        {
            let guard = anon.lock_and_get_page(&vm, WaitPolicy::NoWait).unwrap();
            assert!(guard.page().is_zeroed());
        }
        assert!(anon.is_resident());
        assert_eq!(vm.accounting().get(MemoryKind::Anonymous), 1);
        Anon::unref(&vm, anon);
        assert_eq!(vm.pages().pages_in_use(), 0);
        assert_eq!(vm.accounting().get(MemoryKind::Anonymous), 0);
    }

    #[test]
    fn page_out_and_back_in() {
        let vm = vm_with(VmOpts::default());
        vm.swap().add_device(4).unwrap();
        let anon = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        anon.lock_and_get_page(&vm, WaitPolicy::NoWait)
            .unwrap()
            .page_mut()
            .as_mut_slice()[100] = 42;
        anon.page_out(&vm).unwrap();
        assert!(!anon.is_resident());
        assert!(anon.swap_slot().is_some());
        assert_eq!(vm.pages().pages_in_use(), 0);
        assert_eq!(vm.accounting().get(MemoryKind::Swapped), 1);

        let guard = anon.lock_and_get_page(&vm, WaitPolicy::NoWait).unwrap();
        assert_eq!(guard.page().as_slice()[100], 42);
        drop(guard);
        assert!(anon.swap_slot().is_none());
        assert_eq!(vm.accounting().get(MemoryKind::Swapped), 0);
        Anon::unref(&vm, anon);
    }

    #[test]
    fn page_out_without_swap_keeps_page() {
        let vm = vm_with(VmOpts::default());
        let anon = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        let err = anon.page_out(&vm).unwrap_err();
        assert_eq!(err.kind(), utils::SysErrorKind::OutOfSwap);
        assert!(anon.is_resident());
    }

    #[test]
    fn page_in_from_bad_slot_is_io_error() {
        let vm = vm_with(VmOpts::default());
        vm.swap().add_device(4).unwrap();
        let anon = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        anon.page_out(&vm).unwrap();
        vm.swap().mark_bad(anon.swap_slot().unwrap());
        let err = anon.lock_and_get_page(&vm, WaitPolicy::NoWait).err().unwrap();
        assert_eq!(err.kind(), utils::SysErrorKind::Io);
        assert!(anon.swap_slot().is_some());
        assert_eq!(vm.pages().pages_in_use(), 0);
    }

    #[test]
    fn freed_anon_reports_eagain() {
        let vm = vm_with(VmOpts::default());
        let anon = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        let stale = Arc::clone(&anon);
        Anon::unref(&vm, anon);
        let err = stale.lock_and_get_page(&vm, WaitPolicy::NoWait).err().unwrap();
        assert_eq!(err.code(), libc::EAGAIN);
    }

    // A page-in that has to wait for a frame must not keep the anon locked:
    // the unmap that frees the only frame unrefs that same anon first.
    #[test]
    fn page_in_waiting_for_a_frame_lets_unmap_proceed() {
        let vm = Arc::new(vm_with(VmOpts {
            max_pages: 1,
            ..VmOpts::default()
        }));
        vm.swap().add_device(4).unwrap();
        let amap = Amap::alloc(&vm, 4, 0, WaitPolicy::NoWait).unwrap();
        let swapped = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        swapped.page_out(&vm).unwrap();
        let resident = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        {
            let mut st = amap.lock();
            st.add(&vm, 0, Arc::clone(&swapped), false);
            st.add(&vm, 1, resident, false);
        }

        let (tx, rx) = mpsc::channel();
        let fault = {
            let vm = Arc::clone(&vm);
            let anon = Arc::clone(&swapped);
            thread::spawn(move || {
                let res = anon
                    .lock_and_get_page(&vm, WaitPolicy::Wait)
                    .map(|_| ())
                    .map_err(|e| e.code());
                tx.send(res).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(20));
        Amap::unref(&amap, &vm, 0, 4, false);

        let res = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("page in still waiting after the unmap freed a frame");
        fault.join().unwrap();
        assert_eq!(res, Err(libc::EAGAIN));
        assert_eq!(vm.pages().pages_in_use(), 0);
        assert_eq!(vm.anon_pool().live(), 0);
    }

    #[test]
    fn copy_page_without_frames_fails_or_waits() {
        let vm = vm_with(VmOpts {
            max_pages: 1,
            ..VmOpts::default()
        });
        let anon = Anon::allocate_zeroed(&vm, WaitPolicy::NoWait).unwrap();
        let guard = anon.lock_and_get_page(&vm, WaitPolicy::NoWait).unwrap();
        assert!(Anon::copy_page(&vm, guard, WaitPolicy::NoWait)
            .unwrap_err()
            .is_out_of_memory());
        assert!(anon.state.try_lock().is_ok());
        Anon::unref(&vm, anon);
        assert_eq!(vm.pages().pages_in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "precondition violation: freeing anon")]
    fn free_with_refs_panics() {
        let vm = vm_with(VmOpts::default());
        let anon = Anon::allocate(&vm).unwrap();
        anon.free(&vm);
    }
}
