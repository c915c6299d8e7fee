use pgalloc::WaitPolicy;
use swap::SwapDeviceId;
use utils::{SysError, SysResult};

use crate::{anon::AnonRef, Vm};

// swapped_on collects the anons of the live amaps whose pages sit on device.
fn swapped_on(vm: &Vm, device: SwapDeviceId) -> Vec<AnonRef> {
    let mut anons = Vec::new();
    for amap in vm.live_amaps() {
        let st = amap.lock();
        if st.is_wiped() {
            continue;
        }
        for slot in st.populated_slots(0..st.slot_count()) {
            if let Some(anon) = st.lookup_slot(slot) {
                if anon.swap_slot().map_or(false, |s| s.device == device) {
                    anons.push(anon);
                }
            }
        }
    }
    anons
}

// anon_swap_off reads every page stored on device back into memory so the
// device can be removed. The device takes no new pages meanwhile. If a page
// cannot be brought back the device is put back into service and the call
// fails with EBUSY.
pub fn anon_swap_off(vm: &Vm, device: SwapDeviceId) -> SysResult<()> {
    vm.swap().begin_swap_off(device)?;
    let anons = swapped_on(vm, device);
    logger::debug!("swap off of device {}: {} pages to read back", device.0, anons.len());
    for anon in anons {
        match anon.lock_and_get_page(vm, WaitPolicy::NoWait) {
            Ok(_) => {}
            // freed since the scan, nothing left to read
            Err(e) if e.code() == libc::EAGAIN => {}
            Err(e) => {
                logger::warn!(
                    "swap off of device {}: anon {} cannot be paged in: {}",
                    device.0,
                    anon.id(),
                    e
                );
                vm.swap().abort_swap_off(device);
                return Err(SysError::busy(format!(
                    "swap device {} still backs anon {}",
                    device.0,
                    anon.id()
                )));
            }
        }
    }
    if let Err(e) = vm.swap().finish_swap_off(device) {
        logger::warn!("swap off of device {} failed: {}", device.0, e);
        vm.swap().abort_swap_off(device);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::tests::{vm, vm_with},
        cow::tests::{first_byte, populated_entry},
        VmOpts,
    };

    #[test]
    fn swap_off_reads_every_page_back() {
        let vm = vm();
        let dev = vm.swap().add_device(8).unwrap();
        let e = populated_entry(&vm, 4, &[(0, 0x11), (2, 0x22)]);
        let a0 = e.lookup(e.start()).unwrap();
        let a2 = e.lookup(e.start().add_pages(2)).unwrap();
        a0.page_out(&vm).unwrap();
        a2.page_out(&vm).unwrap();
        assert_eq!(vm.swap().slots_in_use(dev), 2);

        anon_swap_off(&vm, dev).unwrap();
        assert!(!vm.swap().has_device(dev));
        assert!(a0.is_resident() && a2.is_resident());
        assert_eq!(first_byte(&vm, &a0), 0x11);
        assert_eq!(first_byte(&vm, &a2), 0x22);
        assert_eq!(vm.stats().swapped, 0);
        e.unmap(&vm);
    }

    #[test]
    fn unreadable_page_aborts_swap_off() {
        let vm = vm();
        let dev = vm.swap().add_device(8).unwrap();
        let e = populated_entry(&vm, 2, &[(1, 5)]);
        let anon = e.lookup(e.start().add_pages(1)).unwrap();
        anon.page_out(&vm).unwrap();
        vm.swap().mark_bad(anon.swap_slot().unwrap());

        let err = anon_swap_off(&vm, dev).unwrap_err();
        assert_eq!(err.kind(), utils::SysErrorKind::Busy);
        assert!(vm.swap().has_device(dev));
        // the device is active again and hands out slots
        assert_eq!(vm.swap().alloc_slot().unwrap().device, dev);
    }

    #[test]
    fn page_in_without_memory_aborts_swap_off() {
        let vm = vm_with(VmOpts {
            max_pages: 1,
            ..VmOpts::default()
        });
        let dev = vm.swap().add_device(8).unwrap();
        let e = populated_entry(&vm, 2, &[(0, 1)]);
        let anon = e.lookup(e.start()).unwrap();
        anon.page_out(&vm).unwrap();
        let _hog = vm.pages().alloc(WaitPolicy::NoWait).unwrap();
        assert_eq!(
            anon_swap_off(&vm, dev).unwrap_err().code(),
            libc::EBUSY
        );
        assert_eq!(vm.swap().slots_in_use(dev), 1);
    }

    #[test]
    fn swap_off_of_an_idle_device_removes_it() {
        let vm = vm();
        let dev = vm.swap().add_device(2).unwrap();
        anon_swap_off(&vm, dev).unwrap();
        assert!(!vm.swap().has_device(dev));
        assert_eq!(
            anon_swap_off(&vm, dev).unwrap_err(),
            SysError::new(libc::EINVAL)
        );
    }
}
