mod access_type;
mod addr;

pub use access_type::AccessType;
pub use addr::*;

pub const PAGE_SHIFT: i32 = 12;
pub const PAGE_SIZE: i32 = 1 << PAGE_SHIFT;

// page_count returns the number of pages needed to cover length bytes.
#[inline]
pub const fn page_count(length: u64) -> usize {
    ((length + PAGE_SIZE as u64 - 1) >> PAGE_SHIFT) as usize
}

#[inline]
pub const fn pages_to_bytes(pages: usize) -> u64 {
    (pages as u64) << PAGE_SHIFT
}
