//! Key ordering
//!
//! Each keyspace injects its own comparator; the lock manager never looks
//! inside key bytes itself.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::Key;

/// Total order over the raw bytes of one keyspace
pub trait KeyComparator: Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Short name for diagnostics
    fn name(&self) -> &str {
        "custom"
    }
}

/// Lexicographic byte order
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "bytewise"
    }
}

/// Shared handle to a keyspace comparator, extended to infinities
#[derive(Clone)]
pub struct Comparator {
    inner: Arc<dyn KeyComparator>,
}

impl Comparator {
    pub fn new(inner: Arc<dyn KeyComparator>) -> Self {
        Self { inner }
    }

    pub fn bytewise() -> Self {
        Self::new(Arc::new(BytewiseComparator))
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Compare two keys, placing the infinities at the ends
    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        match (a, b) {
            (Key::NegativeInfinity, Key::NegativeInfinity)
            | (Key::PositiveInfinity, Key::PositiveInfinity) => Ordering::Equal,
            (Key::NegativeInfinity, _) | (_, Key::PositiveInfinity) => Ordering::Less,
            (Key::PositiveInfinity, _) | (_, Key::NegativeInfinity) => Ordering::Greater,
            (Key::Value(a), Key::Value(b)) => self.inner.compare(a, b),
        }
    }
}

impl Default for Comparator {
    fn default() -> Self {
        Self::bytewise()
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Comparator").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReverseComparator;

    impl KeyComparator for ReverseComparator {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    #[test]
    fn test_infinities_bound_every_key() {
        let cmp = Comparator::bytewise();
        let key = Key::from("m");
        assert_eq!(cmp.compare(&Key::NegativeInfinity, &key), Ordering::Less);
        assert_eq!(cmp.compare(&key, &Key::PositiveInfinity), Ordering::Less);
        assert_eq!(
            cmp.compare(&Key::PositiveInfinity, &Key::NegativeInfinity),
            Ordering::Greater
        );
    }

    #[test]
    fn test_injected_order_is_used() {
        let cmp = Comparator::new(Arc::new(ReverseComparator));
        assert_eq!(cmp.compare(&Key::from("a"), &Key::from("b")), Ordering::Greater);
        // infinities do not depend on the injected order
        assert_eq!(
            cmp.compare(&Key::NegativeInfinity, &Key::from("a")),
            Ordering::Less
        );
    }
}
