use std::fmt::{Debug, Error, Formatter};
use std::iter::{DoubleEndedIterator, Enumerate, FromIterator};
use std::ops::Sub;
use std::result::Result;
use std::slice::Iter;
use std::vec::IntoIter as VecIntoIter;

/// Elements with a width (eg. when used in an `OffsetVec`)
pub trait Width {
    fn width(&self) -> usize;
}

/// A vector of elements of different logical "widths", where offsets into the vector are given in
/// terms of the sum of the widths of the previous elements (as opposed to the number of preceding
/// elements).
///
/// Dex files have a couple of these:
///
///   - register frames (depending on type, a local takes 1 or 2 registers)
///   - method code and branch targets (instructions are 1 to 5 code units long)
///
#[derive(Clone)]
pub struct OffsetVec<T: Sized> {
    /// Entries, along with their offset
    entries: Vec<(Offset, T)>,

    /// Offset of the next element to be added
    offset_len: Offset,
}

/// Offset into an `OffsetVec`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

impl Sub for Offset {
    type Output = isize;

    fn sub(self, other: Offset) -> isize {
        (self.0 as isize) - (other.0 as isize)
    }
}

impl<T: Sized + Width> OffsetVec<T> {
    /// New empty offset vector
    pub fn new() -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: Offset(0),
        }
    }

    /// Length of the `OffsetVec` (aka. number of entries)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current offset size of the `OffsetVec` (aka. offset of the next element
    /// to be added)
    pub fn offset_len(&self) -> Offset {
        self.offset_len
    }

    /// Add an entry to the back
    pub fn push(&mut self, slot: T) -> Offset {
        let offset = self.offset_len;
        self.offset_len.0 += slot.width();
        self.entries.push((offset, slot));

        offset
    }

    /// Get an entry (and its offset) by its position in the vector
    pub fn get_index(&self, index: usize) -> Option<(Offset, &T)> {
        self.entries.get(index).map(|(offset, t)| (*offset, t))
    }

    /// Get a mutable entry (and its offset) by its position in the vector
    ///
    /// Note: the width of the entry must not be changed through the reference
    pub fn get_index_mut(&mut self, index: usize) -> Option<(Offset, &mut T)> {
        self.entries.get_mut(index).map(|(offset, t)| (*offset, t))
    }

    /// Find the entry starting exactly at an offset
    pub fn get_offset(&self, offset: Offset) -> Option<(usize, &T)> {
        self.entries
            .binary_search_by_key(&offset, |(off, _)| *off)
            .ok()
            .map(|idx| (idx, &self.entries[idx].1))
    }

    pub fn iter<'a>(&'a self) -> OffsetVecIter<'a, T> {
        self.into_iter()
    }
}

impl<A: PartialEq> PartialEq for OffsetVec<A> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<A: Eq> Eq for OffsetVec<A> {}

impl<A: Width> Default for OffsetVec<A> {
    fn default() -> Self {
        OffsetVec::new()
    }
}

/// Iterator for owned `OffsetVec`
pub struct OffsetVecIntoIter<T>(Enumerate<VecIntoIter<(Offset, T)>>);

impl<T> Iterator for OffsetVecIntoIter<T> {
    type Item = (Offset, usize, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(idx, (off, elem))| (off, idx, elem))
    }
}

impl<T> IntoIterator for OffsetVec<T> {
    type Item = (Offset, usize, T);
    type IntoIter = OffsetVecIntoIter<T>;

    fn into_iter(self) -> OffsetVecIntoIter<T> {
        OffsetVecIntoIter(self.entries.into_iter().enumerate())
    }
}

/// Iterator for borrowed `OffsetVec`
pub struct OffsetVecIter<'a, T>(Enumerate<Iter<'a, (Offset, T)>>);

impl<'a, T> Iterator for OffsetVecIter<'a, T> {
    type Item = (Offset, usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(idx, (off, elem))| (*off, idx, elem))
    }
}

impl<'a, T> DoubleEndedIterator for OffsetVecIter<'a, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.0
            .next_back()
            .map(|(idx, (off, elem))| (*off, idx, elem))
    }
}

impl<'a, T> IntoIterator for &'a OffsetVec<T> {
    type Item = (Offset, usize, &'a T);
    type IntoIter = OffsetVecIter<'a, T>;

    fn into_iter(self) -> OffsetVecIter<'a, T> {
        OffsetVecIter(self.entries.iter().enumerate())
    }
}

impl<T: Width> FromIterator<T> for OffsetVec<T> {
    fn from_iter<A: IntoIterator<Item = T>>(elems: A) -> Self {
        let mut offset_vec = OffsetVec::new();
        for elem in elems {
            offset_vec.push(elem);
        }
        offset_vec
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut list = f.debug_list();
        for (off, elem) in &self.entries {
            list.entry(&format_args!("#{} = {:?}", off.0, elem));
        }
        list.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    enum Unit {
        Narrow(u8),
        Wide(u8),
        Long(u8),
    }

    impl Width for Unit {
        fn width(&self) -> usize {
            match self {
                Unit::Narrow(_) => 1,
                Unit::Wide(_) => 2,
                Unit::Long(_) => 5,
            }
        }
    }

    #[test]
    fn mixed_widths() {
        let units: OffsetVec<Unit> = vec![
            Unit::Narrow(1),
            Unit::Long(2),
            Unit::Wide(3),
            Unit::Narrow(4),
        ]
        .into_iter()
        .collect();
        assert_eq!(units.offset_len(), Offset(9));
        assert_eq!(
            units.into_iter().collect::<Vec<_>>(),
            vec![
                (Offset(0), 0, Unit::Narrow(1)),
                (Offset(1), 1, Unit::Long(2)),
                (Offset(6), 2, Unit::Wide(3)),
                (Offset(8), 3, Unit::Narrow(4)),
            ]
        );
    }

    #[test]
    fn lookup_by_offset() {
        let units: OffsetVec<Unit> = vec![Unit::Wide(1), Unit::Narrow(2), Unit::Wide(3)]
            .into_iter()
            .collect();
        assert_eq!(units.get_offset(Offset(2)), Some((1, &Unit::Narrow(2))));
        assert_eq!(units.get_offset(Offset(3)), Some((2, &Unit::Wide(3))));
        assert_eq!(units.get_offset(Offset(1)), None);
        assert_eq!(units.get_offset(Offset(5)), None);
    }

    #[test]
    fn patching_in_place() {
        let mut units: OffsetVec<Unit> = vec![Unit::Narrow(1), Unit::Wide(2)].into_iter().collect();
        if let Some((offset, unit)) = units.get_index_mut(1) {
            assert_eq!(offset, Offset(1));
            *unit = Unit::Wide(7);
        }
        assert_eq!(units.get_index(1), Some((Offset(1), &Unit::Wide(7))));
    }
}
