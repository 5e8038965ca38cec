//! # Peer Table
//!
//! Slab of per-endpoint records plus an endpoint → slot index. The dispatcher
//! resolves the sender's address to a [`PeerSlot`] once per datagram and
//! reaches the record through the slot. Slots are recycled after removal.

use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Handle to a record in a [`PeerTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSlot(pub usize);

/// Slot-indexed per-endpoint state.
pub struct PeerTable<T> {
    slots: Slab<(SocketAddr, T)>,
    index: HashMap<SocketAddr, usize>,
}

impl<T> PeerTable<T> {
    pub fn new() -> Self {
        PeerTable {
            slots: Slab::new(),
            index: HashMap::new(),
        }
    }

    /// Register `addr`. Returns `None` (and drops `value`) if the address is
    /// already present; state is created exactly once per connection.
    pub fn insert(&mut self, addr: SocketAddr, value: T) -> Option<PeerSlot> {
        if self.index.contains_key(&addr) {
            return None;
        }
        let key = self.slots.insert((addr, value));
        self.index.insert(addr, key);
        Some(PeerSlot(key))
    }

    /// Resolve an address to its slot.
    pub fn slot(&self, addr: &SocketAddr) -> Option<PeerSlot> {
        self.index.get(addr).copied().map(PeerSlot)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.index.contains_key(addr)
    }

    pub fn get(&self, slot: PeerSlot) -> Option<&T> {
        self.slots.get(slot.0).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, slot: PeerSlot) -> Option<&mut T> {
        self.slots.get_mut(slot.0).map(|(_, v)| v)
    }

    /// Look up by address (hashes once).
    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&T> {
        self.slot(addr).and_then(|slot| self.get(slot))
    }

    pub fn get_mut_by_addr(&mut self, addr: &SocketAddr) -> Option<&mut T> {
        let slot = self.slot(addr)?;
        self.get_mut(slot)
    }

    /// Remove `addr`, returning its record.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<T> {
        let key = self.index.remove(addr)?;
        Some(self.slots.remove(key).1)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SocketAddr, &mut T)> {
        self.slots.iter_mut().map(|(_, (addr, v))| (*addr, v))
    }
}

impl<T> Default for PeerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn insert_lookup_remove() {
        let mut table = PeerTable::new();
        let slot = table.insert(addr(1), "a").unwrap();
        assert_eq!(table.slot(&addr(1)), Some(slot));
        assert_eq!(table.get(slot), Some(&"a"));
        assert_eq!(table.remove(&addr(1)), Some("a"));
        assert!(table.is_empty());
        assert_eq!(table.slot(&addr(1)), None);
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut table = PeerTable::new();
        table.insert(addr(1), 1).unwrap();
        assert!(table.insert(addr(1), 2).is_none());
        assert_eq!(table.get_by_addr(&addr(1)), Some(&1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn slots_are_recycled() {
        let mut table = PeerTable::new();
        let first = table.insert(addr(1), ()).unwrap();
        table.remove(&addr(1));
        let second = table.insert(addr(2), ()).unwrap();
        assert_eq!(first, second);
        assert!(!table.contains(&addr(1)));
    }

    #[test]
    fn iter_mut_sees_every_peer() {
        let mut table = PeerTable::new();
        table.insert(addr(1), 0);
        table.insert(addr(2), 0);
        for (_, v) in table.iter_mut() {
            *v += 1;
        }
        assert_eq!(table.get_by_addr(&addr(1)), Some(&1));
        assert_eq!(table.get_by_addr(&addr(2)), Some(&1));
        let mut seen: Vec<_> = table.iter_mut().map(|(a, _)| a).collect();
        seen.sort();
        assert_eq!(seen, vec![addr(1), addr(2)]);
    }

    #[test]
    fn slot_reaches_record_mutably() {
        let mut table = PeerTable::new();
        table.insert(addr(1), 'x');
        let slot = table.slot(&addr(1)).unwrap();
        *table.get_mut(slot).unwrap() = 'y';
        assert_eq!(table.get(slot), Some(&'y'));
        table.remove(&addr(1));
        assert_eq!(table.get_mut(slot), None);
    }
}
