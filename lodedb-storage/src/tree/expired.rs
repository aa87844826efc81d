use crate::journal::loggable::NULL_ADDRESS;

/// Addresses of loggables made obsolete by a mutable tree,
/// handed to the garbage collector after save.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExpiredLoggableCollection {
    addresses: Vec<u64>,
}

impl ExpiredLoggableCollection {
    #[inline]
    pub fn new() -> Self {
        ExpiredLoggableCollection::default()
    }

    /// Add an address, null address is ignored.
    #[inline]
    pub fn add(&mut self, address: u64) {
        if address != NULL_ADDRESS {
            self.addresses.push(address);
        }
    }

    /// Move all addresses of other collection into this one.
    #[inline]
    pub fn merge(&mut self, other: ExpiredLoggableCollection) {
        if self.addresses.is_empty() {
            self.addresses = other.addresses;
        } else {
            self.addresses.extend(other.addresses);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        self.addresses.contains(&address)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.addresses.iter().copied()
    }

    /// Take all addresses out, leaving collection empty.
    #[inline]
    pub fn take(&mut self) -> ExpiredLoggableCollection {
        std::mem::take(self)
    }

    /// Returns sorted and deduplicated addresses.
    #[inline]
    pub fn into_sorted_vec(self) -> Vec<u64> {
        let mut addresses = self.addresses;
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_loggables() {
        let mut expired = ExpiredLoggableCollection::new();
        expired.add(24);
        expired.add(NULL_ADDRESS);
        expired.add(8);
        assert_eq!(expired.len(), 2);
        let mut other = ExpiredLoggableCollection::new();
        other.add(24);
        other.add(96);
        expired.merge(other);
        assert_eq!(expired.len(), 4);
        assert!(expired.contains(96));
        let taken = expired.take();
        assert!(expired.is_empty());
        assert_eq!(taken.into_sorted_vec(), vec![8, 24, 96]);
    }
}
