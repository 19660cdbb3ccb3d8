//! Byte accounting for live and garbage state.

use std::ops::{AddAssign, SubAssign};

/// Absolute size of a piece of CRDT state. `data` counts user content bytes,
/// `meta` counts ticket and bookkeeping bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DataSize {
    pub data: usize,
    pub meta: usize,
}

impl DataSize {
    pub fn new(data: usize, meta: usize) -> DataSize {
        DataSize { data, meta }
    }

    pub fn total(&self) -> usize {
        self.data + self.meta
    }
}

impl AddAssign for DataSize {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.data += rhs.data;
        self.meta += rhs.meta;
    }
}

impl SubAssign for DataSize {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        debug_assert!(self.data >= rhs.data && self.meta >= rhs.meta);
        self.data -= rhs.data;
        self.meta -= rhs.meta;
    }
}

/// Signed size update, applied to one bucket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeDelta {
    pub data: isize,
    pub meta: isize,
}

impl SizeDelta {
    pub fn inc_by(&mut self, s: DataSize) {
        self.data += s.data as isize;
        self.meta += s.meta as isize;
    }

    pub fn dec_by(&mut self, s: DataSize) {
        self.data -= s.data as isize;
        self.meta -= s.meta as isize;
    }
}

impl AddAssign for SizeDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.data += rhs.data;
        self.meta += rhs.meta;
    }
}

/// Paired live/gc deltas produced by one mutation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DocDelta {
    pub live: SizeDelta,
    pub gc: SizeDelta,
}

impl AddAssign for DocDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.live += rhs.live;
        self.gc += rhs.gc;
    }
}

/// Running document size. The invariant is that live + gc equals the byte
/// count of every node inserted and not yet purged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DocSize {
    pub live: DataSize,
    pub gc: DataSize,
}

impl DocSize {
    pub fn total(&self) -> usize {
        self.live.total() + self.gc.total()
    }

    pub fn apply(&mut self, delta: DocDelta) {
        apply_delta(&mut self.live, delta.live);
        apply_delta(&mut self.gc, delta.gc);
    }
}

fn apply_delta(size: &mut DataSize, delta: SizeDelta) {
    let data = size.data as isize + delta.data;
    let meta = size.meta as isize + delta.meta;
    debug_assert!(data >= 0 && meta >= 0, "size accounting went negative");
    size.data = data.max(0) as usize;
    size.meta = meta.max(0) as usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_move_between_buckets() {
        let mut size = DocSize::default();
        let node = DataSize::new(10, 28);

        let mut insert = DocDelta::default();
        insert.live.inc_by(node);
        size.apply(insert);
        assert_eq!(size.live, node);

        let mut tombstone = DocDelta::default();
        tombstone.live.dec_by(node);
        tombstone.gc.inc_by(node);
        tombstone.gc.inc_by(DataSize::new(0, 28));
        size.apply(tombstone);
        assert_eq!(size.live, DataSize::default());
        assert_eq!(size.gc, DataSize::new(10, 56));
        assert_eq!(size.total(), 66);
    }
}
