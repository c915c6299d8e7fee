// Physical page frame allocator. Frames are plain heap buffers of PAGE_SIZE
// bytes; the allocator bounds how many may exist at once and decides whether
// a caller that hits the bound sleeps or fails.

mod quota;

pub use quota::Quota;

use std::sync::Mutex;

use mem::PAGE_SIZE;
use utils::SysResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitPolicy {
    Wait,
    NoWait,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl std::fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

// Page owns one physical frame until it is handed back with
// PageAllocator::free.
pub struct Page {
    frame: FrameNumber,
    data: Box<[u8]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Page").field(&self.frame).finish()
    }
}

impl Page {
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn copy_from(&mut self, src: &Page) {
        self.data.copy_from_slice(&src.data);
    }

    pub fn copy_from_slice(&mut self, src: &[u8]) {
        self.data.copy_from_slice(src);
    }

    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

#[derive(Debug)]
pub struct PageAllocator {
    frames: Quota,
    free_frames: Mutex<FrameList>,
}

#[derive(Debug, Default)]
struct FrameList {
    next: u64,
    recycled: Vec<FrameNumber>,
}

impl PageAllocator {
    pub fn new(max_pages: u64) -> Self {
        Self {
            frames: Quota::new("page frames", max_pages),
            free_frames: Mutex::new(FrameList::default()),
        }
    }

    // alloc returns a zero-filled page.
    pub fn alloc(&self, wait: WaitPolicy) -> SysResult<Page> {
        self.frames.acquire(1, wait)?;
        let frame = {
            let mut list = self.free_frames.lock().unwrap();
            match list.recycled.pop() {
                Some(frame) => frame,
                None => {
                    list.next += 1;
                    FrameNumber(list.next)
                }
            }
        };
        Ok(Page {
            frame,
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        })
    }

    // alloc_copy returns a new page holding a copy of src.
    pub fn alloc_copy(&self, src: &Page, wait: WaitPolicy) -> SysResult<Page> {
        let mut page = self.alloc(wait)?;
        page.copy_from(src);
        Ok(page)
    }

    pub fn free(&self, page: Page) {
        self.free_frames.lock().unwrap().recycled.push(page.frame);
        self.frames.release(1);
    }

    // wait_for_frame sleeps until a frame is free. It does not reserve the
    // frame, so the following NoWait alloc may still lose a race.
    pub fn wait_for_frame(&self) {
        self.frames.wait_available(1);
    }

    pub fn pages_in_use(&self) -> u64 {
        self.frames.used()
    }

    pub fn max_pages(&self) -> u64 {
        self.frames.limit()
    }
}
