use std::sync::{Condvar, Mutex};

use utils::{SysError, SysResult};

use crate::WaitPolicy;

// Quota is a counted resource with a hard limit. Callers that may sleep wait
// on the condition variable until enough units are released; callers that
// may not sleep fail with ENOMEM right away.
#[derive(Debug)]
pub struct Quota {
    name: &'static str,
    limit: u64,
    used: Mutex<u64>,
    released: Condvar,
}

impl Quota {
    pub fn new(name: &'static str, limit: u64) -> Self {
        Self {
            name,
            limit,
            used: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self, n: u64, wait: WaitPolicy) -> SysResult<()> {
        if n > self.limit {
            return Err(SysError::no_memory_with_msg(format!(
                "{}: request of {} exceeds limit {}",
                self.name, n, self.limit
            )));
        }
        let mut used = self.used.lock().unwrap();
        loop {
            if *used + n <= self.limit {
                *used += n;
                return Ok(());
            }
            match wait {
                WaitPolicy::NoWait => {
                    logger::trace!(
                        "{}: cannot take {} units without waiting ({}/{})",
                        self.name,
                        n,
                        *used,
                        self.limit
                    );
                    return Err(SysError::no_memory());
                }
                WaitPolicy::Wait => {
                    used = self.released.wait(used).unwrap();
                }
            }
        }
    }

    // wait_available sleeps until n units could be taken, without taking
    // them. Callers retry with NoWait after retaking their own locks.
    pub fn wait_available(&self, n: u64) {
        if n > self.limit {
            return;
        }
        let mut used = self.used.lock().unwrap();
        while *used + n > self.limit {
            used = self.released.wait(used).unwrap();
        }
    }

    pub fn release(&self, n: u64) {
        let mut used = self.used.lock().unwrap();
        if *used < n {
            panic!(
                "{}: releasing {} units but only {} in use",
                self.name, n, *used
            );
        }
        *used -= n;
        self.released.notify_all();
    }

    pub fn used(&self) -> u64 {
        *self.used.lock().unwrap()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.limit - self.used()
    }
}
