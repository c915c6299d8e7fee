use super::{PAGE_SHIFT, PAGE_SIZE};
use utils::Range;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl Addr {
    pub const fn round_down(&self) -> Self {
        Addr(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    #[inline]
    pub fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    pub fn to_range(self, length: u64) -> Option<AddrRange> {
        self.add_length(length).map(|end| AddrRange {
            start: self.0,
            end: end.0,
        })
    }

    #[inline]
    pub fn add_length(&self, length: u64) -> Option<Self> {
        let end = self.0.checked_add(length)?;
        Some(Addr(end))
    }

    #[inline]
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    // pages_from returns how many whole pages lie between base and self.
    #[inline]
    pub fn pages_from(&self, base: Addr) -> usize {
        ((self.0 - base.0) >> PAGE_SHIFT) as usize
    }

    #[inline]
    pub fn add_pages(&self, pages: usize) -> Self {
        Addr(self.0 + ((pages as u64) << PAGE_SHIFT))
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub type AddrRange = Range<u64>;
