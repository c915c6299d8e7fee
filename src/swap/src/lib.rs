// In-memory swap space. A device is a fixed array of page-sized slots; the
// pager writes evicted anonymous pages into free slots and reads them back on
// fault. Devices can be drained and removed (swap off).

use std::{collections::HashSet, sync::Mutex};

use mem::PAGE_SIZE;
use slab::Slab;
use utils::{bail_libc, SysError, SysResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapDeviceId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapSlot {
    pub device: SwapDeviceId,
    pub index: usize,
}

impl std::fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "swap{}:{}", self.device.0, self.index)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DeviceState {
    Active,
    Draining,
}

#[derive(Debug)]
struct SwapDevice {
    slots: Vec<Option<Box<[u8]>>>,
    allocated: Vec<bool>,
    in_use: usize,
    bad: HashSet<usize>,
    state: DeviceState,
    // hint for the next free slot search
    cursor: usize,
}

impl SwapDevice {
    fn new(nslots: usize) -> Self {
        Self {
            slots: vec![None; nslots],
            allocated: vec![false; nslots],
            in_use: 0,
            bad: HashSet::new(),
            state: DeviceState::Active,
            cursor: 0,
        }
    }

    fn find_free(&mut self) -> Option<usize> {
        let n = self.allocated.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            if !self.allocated[idx] && !self.bad.contains(&idx) {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct SwapSpace {
    devices: Mutex<Slab<SwapDevice>>,
}

impl SwapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, nslots: usize) -> SysResult<SwapDeviceId> {
        if nslots == 0 {
            bail_libc!(libc::EINVAL);
        }
        let id = self.devices.lock().unwrap().insert(SwapDevice::new(nslots));
        logger::debug!("swap device {} added with {} slots", id, nslots);
        Ok(SwapDeviceId(id))
    }

    // alloc_slot reserves a slot on the first active device that has room.
    pub fn alloc_slot(&self) -> SysResult<SwapSlot> {
        let mut devices = self.devices.lock().unwrap();
        for (id, dev) in devices.iter_mut() {
            if dev.state != DeviceState::Active {
                continue;
            }
            if let Some(index) = dev.find_free() {
                dev.allocated[index] = true;
                dev.in_use += 1;
                return Ok(SwapSlot {
                    device: SwapDeviceId(id),
                    index,
                });
            }
        }
        Err(SysError::out_of_swap())
    }

    pub fn free_slot(&self, slot: SwapSlot) {
        let mut devices = self.devices.lock().unwrap();
        let dev = match devices.get_mut(slot.device.0) {
            Some(dev) => dev,
            None => panic!("freeing {} on a removed device", slot),
        };
        if !dev.allocated[slot.index] {
            panic!("double free of {}", slot);
        }
        dev.allocated[slot.index] = false;
        dev.slots[slot.index] = None;
        dev.in_use -= 1;
    }

    pub fn write(&self, slot: SwapSlot, data: &[u8]) -> SysResult<()> {
        if data.len() != PAGE_SIZE as usize {
            bail_libc!(libc::EINVAL);
        }
        let mut devices = self.devices.lock().unwrap();
        let dev = devices
            .get_mut(slot.device.0)
            .ok_or_else(|| SysError::new(libc::ENODEV))?;
        if dev.bad.contains(&slot.index) {
            return Err(SysError::io_error(format!("write to bad slot {}", slot)));
        }
        dev.slots[slot.index] = Some(data.to_vec().into_boxed_slice());
        Ok(())
    }

    pub fn read(&self, slot: SwapSlot, buf: &mut [u8]) -> SysResult<()> {
        let devices = self.devices.lock().unwrap();
        let dev = devices
            .get(slot.device.0)
            .ok_or_else(|| SysError::new(libc::ENODEV))?;
        if dev.bad.contains(&slot.index) {
            return Err(SysError::io_error(format!("read from bad slot {}", slot)));
        }
        match &dev.slots[slot.index] {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            None => Err(SysError::io_error(format!("read from empty slot {}", slot))),
        }
    }

    // mark_bad records a media error on slot. The slot keeps its reservation
    // until freed but is never handed out again.
    pub fn mark_bad(&self, slot: SwapSlot) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(dev) = devices.get_mut(slot.device.0) {
            logger::warn!("marking {} bad", slot);
            dev.bad.insert(slot.index);
        }
    }

    // begin_swap_off stops new allocations from device so its slots can be
    // drained.
    pub fn begin_swap_off(&self, device: SwapDeviceId) -> SysResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let dev = devices
            .get_mut(device.0)
            .ok_or_else(|| SysError::new(libc::EINVAL))?;
        if dev.state == DeviceState::Draining {
            return Err(SysError::busy(format!(
                "swap device {} is already being removed",
                device.0
            )));
        }
        dev.state = DeviceState::Draining;
        Ok(())
    }

    pub fn abort_swap_off(&self, device: SwapDeviceId) {
        if let Some(dev) = self.devices.lock().unwrap().get_mut(device.0) {
            dev.state = DeviceState::Active;
        }
    }

    pub fn finish_swap_off(&self, device: SwapDeviceId) -> SysResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let in_use = devices
            .get(device.0)
            .ok_or_else(|| SysError::new(libc::EINVAL))?
            .in_use;
        if in_use != 0 {
            return Err(SysError::busy(format!(
                "swap device {} still has {} slots in use",
                device.0, in_use
            )));
        }
        devices.remove(device.0);
        logger::debug!("swap device {} removed", device.0);
        Ok(())
    }

    pub fn slots_in_use(&self, device: SwapDeviceId) -> usize {
        self.devices
            .lock()
            .unwrap()
            .get(device.0)
            .map_or(0, |dev| dev.in_use)
    }

    pub fn has_device(&self, device: SwapDeviceId) -> bool {
        self.devices.lock().unwrap().contains(device.0)
    }
}
