use std::fmt;
use std::sync::atomic::{AtomicI16, Ordering};

/// Highest replica count a topology may declare.
pub const MAX_REPLICAS: usize = 3;

/// Server index meaning "no node assigned".
pub const UNASSIGNED: i16 = -1;

/// One shard of the key space: its position in the partition map, a master
/// server index and ordered replicas.
///
/// The master is the only mutable field. It is corrected in place when a
/// misroute is reported, so every holder of the topology sees the new owner
/// without waiting for a refresh.
pub struct Partition {
    index: usize,
    master: AtomicI16,
    replicas: Vec<i16>,
}

impl Partition {
    pub fn new(index: usize, master: i16, replicas: Vec<i16>) -> Self {
        Self {
            index,
            master: AtomicI16::new(master),
            replicas,
        }
    }

    /// Builds partition `index` from a `[master, replica1, ...]` row.
    pub fn from_row(index: usize, row: &[i16]) -> Self {
        match row.split_first() {
            Some((master, replicas)) => Self::new(index, *master, replicas.to_vec()),
            None => Self::new(index, UNASSIGNED, Vec::new()),
        }
    }

    /// Position in the partition map; keys hashing here route to this entry.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn master(&self) -> i16 {
        self.master.load(Ordering::Acquire)
    }

    /// Replica server index at `index`, or [`UNASSIGNED`] when out of range.
    pub fn replica(&self, index: usize) -> i16 {
        self.replicas.get(index).copied().unwrap_or(UNASSIGNED)
    }

    pub fn replicas(&self) -> &[i16] {
        &self.replicas
    }

    pub(crate) fn set_master(&self, master: i16) {
        self.master.store(master, Ordering::Release);
    }

    /// Swaps the master only if it still equals `expected`.
    pub(crate) fn replace_master(&self, expected: i16, master: i16) -> bool {
        self.master
            .compare_exchange(expected, master, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True when this partition already carries exactly `row`.
    pub fn same_assignment(&self, row: &[i16]) -> bool {
        match row.split_first() {
            Some((master, replicas)) => {
                self.master() == *master && self.replicas.as_slice() == replicas
            }
            None => false,
        }
    }
}

impl Clone for Partition {
    fn clone(&self) -> Self {
        Self::new(self.index, self.master(), self.replicas.clone())
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.master() == other.master()
            && self.replicas == other.replicas
    }
}

impl Eq for Partition {}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("index", &self.index)
            .field("master", &self.master())
            .field("replicas", &self.replicas)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_row_splits_master_and_replicas() {
        let partition = Partition::from_row(7, &[2, 0, -1]);
        assert_eq!(partition.index(), 7);
        assert_eq!(partition.master(), 2);
        assert_eq!(partition.replica(0), 0);
        assert_eq!(partition.replica(1), UNASSIGNED);
        assert_eq!(partition.replica(5), UNASSIGNED);
    }

    #[test]
    fn test_same_assignment() {
        let partition = Partition::from_row(0, &[1, 0]);
        assert!(partition.same_assignment(&[1, 0]));
        assert!(!partition.same_assignment(&[1, 2]));
        assert!(!partition.same_assignment(&[0, 0]));
        assert!(!partition.same_assignment(&[]));
    }

    #[test]
    fn test_replace_master_only_from_expected() {
        let partition = Partition::from_row(0, &[0, 1]);
        assert!(!partition.replace_master(1, 2));
        assert_eq!(partition.master(), 0);
        assert!(partition.replace_master(0, 1));
        assert_eq!(partition.master(), 1);
    }

    #[test]
    fn test_equality_includes_position() {
        assert_eq!(Partition::from_row(3, &[0, 1]), Partition::from_row(3, &[0, 1]));
        assert_ne!(Partition::from_row(3, &[0, 1]), Partition::from_row(4, &[0, 1]));
    }
}
