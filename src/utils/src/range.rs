#[derive(PartialEq, Eq, Copy, Clone, Default, Hash)]
pub struct Range<T> {
    pub start: T,
    pub end: T,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Range<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x?}, {:#x?})", self.start, self.end)
    }
}

impl<T: num::Integer + Copy> Range<T> {
    #[inline]
    pub fn from_len(start: T, len: T) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    #[inline]
    pub fn len(&self) -> T {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn can_split_at(&self, k: T) -> bool {
        self.start < k && k < self.end
    }

    #[inline]
    pub fn contains(&self, k: T) -> bool {
        self.start <= k && k < self.end
    }

    #[inline]
    pub fn is_superset_of(&self, r: &Self) -> bool {
        self.start <= r.start && r.end <= self.end
    }
}

impl Range<usize> {
    pub fn iter(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

// SlotRange addresses amap slots, one slot per page.
pub type SlotRange = Range<usize>;
