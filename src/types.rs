//! Shared identifiers and the lock mode

use std::fmt;

/// Transaction identifier. Nested transactions lock under their oldest
/// ancestor's id.
pub type TxnId = u64;

/// Identity of a keyspace (table or index) and therefore of its locktree
pub type DictionaryId = u64;

/// Requested or granted lock strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared: coexists with other holders' reads
    Read,

    /// Exclusive: coexists with nothing held by another transaction
    Write,
}

impl LockMode {
    /// Whether a lock of mode `self` held by one transaction blocks a
    /// request of mode `requested` from a different transaction.
    pub fn conflicts_with(self, requested: LockMode) -> bool {
        matches!((self, requested), (LockMode::Write, _) | (_, LockMode::Write))
    }

    /// The weakest mode covering both
    pub fn max(self, other: LockMode) -> LockMode {
        if self == LockMode::Write || other == LockMode::Write {
            LockMode::Write
        } else {
            LockMode::Read
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("READ"),
            LockMode::Write => f.write_str("WRITE"),
        }
    }
}

/// Sorted, de-duplicated set of transaction ids
///
/// Holder sets rarely exceed a handful of entries, so a sorted vector
/// beats a hash set here and gives a deterministic `first()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TxnIdSet {
    ids: Vec<TxnId>,
}

impl TxnIdSet {
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    pub fn single(txnid: TxnId) -> Self {
        Self { ids: vec![txnid] }
    }

    /// Add an id; returns false if it was already present
    pub fn add(&mut self, txnid: TxnId) -> bool {
        match self.ids.binary_search(&txnid) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, txnid);
                true
            }
        }
    }

    /// Remove an id; returns false if it was absent
    pub fn remove(&mut self, txnid: TxnId) -> bool {
        match self.ids.binary_search(&txnid) {
            Ok(pos) => {
                self.ids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, txnid: TxnId) -> bool {
        self.ids.binary_search(&txnid).is_ok()
    }

    /// Merge every id of `other` into this set
    pub fn union_with(&mut self, other: &TxnIdSet) {
        for &id in &other.ids {
            self.add(id);
        }
    }

    /// True if the set holds exactly `txnid` and nothing else
    pub fn is_only(&self, txnid: TxnId) -> bool {
        self.ids.len() == 1 && self.ids[0] == txnid
    }

    /// Lowest id, used as "the" conflicting holder in diagnostics
    pub fn first(&self) -> Option<TxnId> {
        self.ids.first().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.ids.iter().copied()
    }

    pub fn as_slice(&self) -> &[TxnId] {
        &self.ids
    }
}

impl FromIterator<TxnId> for TxnIdSet {
    fn from_iter<I: IntoIterator<Item = TxnId>>(iter: I) -> Self {
        let mut set = TxnIdSet::new();
        for id in iter {
            set.add(id);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_stays_sorted_and_unique() {
        let mut set = TxnIdSet::new();
        assert!(set.add(7));
        assert!(set.add(3));
        assert!(!set.add(7));
        assert_eq!(set.as_slice(), &[3, 7]);
        assert_eq!(set.first(), Some(3));
        assert!(set.remove(3));
        assert!(set.is_only(7));
    }

    #[test]
    fn test_mode_conflicts() {
        assert!(!LockMode::Read.conflicts_with(LockMode::Read));
        assert!(LockMode::Read.conflicts_with(LockMode::Write));
        assert!(LockMode::Write.conflicts_with(LockMode::Read));
        assert_eq!(LockMode::Read.max(LockMode::Write), LockMode::Write);
    }
}
