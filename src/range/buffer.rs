//! Range buffer
//!
//! Append-only list of owned ranges with a running memory total.

use super::KeyRange;

/// Owned ranges recorded for one (transaction, locktree) pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeBuffer {
    ranges: Vec<KeyRange>,
    memory_size: usize,
}

impl RangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, range: KeyRange) {
        self.memory_size += range.memory_size();
        self.ranges.push(range);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Bytes accounted against the lock memory budget
    pub fn total_memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.memory_size = 0;
    }
}

impl FromIterator<KeyRange> for RangeBuffer {
    fn from_iter<I: IntoIterator<Item = KeyRange>>(iter: I) -> Self {
        let mut buffer = RangeBuffer::new();
        for range in iter {
            buffer.append(range);
        }
        buffer
    }
}

impl<'a> IntoIterator for &'a RangeBuffer {
    type Item = &'a KeyRange;
    type IntoIter = std::slice::Iter<'a, KeyRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Key;

    #[test]
    fn test_memory_tracks_appends() {
        let mut buffer = RangeBuffer::new();
        assert_eq!(buffer.total_memory_size(), 0);

        let r = KeyRange::point(Key::from("abc"));
        let size = r.memory_size();
        buffer.append(r.clone());
        buffer.append(r);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_memory_size(), 2 * size);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_memory_size(), 0);
    }
}
