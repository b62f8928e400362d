//! One-handler-per-key registration tables.
//!
//! The Ethernet layer keys its table by EtherType and the IPv4 layer by
//! protocol number. Registering a key that already has a handler replaces it;
//! unregistering only succeeds for the handler that currently owns the key.

use std::collections::HashMap;
use std::hash::Hash;

/// Identifies one registration in a [`HandlerTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct HandlerTable<K, H> {
    slots: HashMap<K, (HandlerId, H)>,
    next_id: u64,
}

impl<K: Copy + Eq + Hash, H> HandlerTable<K, H> {
    pub fn new() -> Self {
        HandlerTable {
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    /// Install `handler` for `key`, displacing any previous handler.
    pub fn register(&mut self, key: K, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.slots.insert(key, (id, handler));
        id
    }

    /// Remove the handler for `key` if it is still the one registered as `id`.
    pub fn unregister(&mut self, key: K, id: HandlerId) -> Option<H> {
        match self.slots.get(&key) {
            Some((current, _)) if *current == id => self.slots.remove(&key).map(|(_, h)| h),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut H> {
        self.slots.get_mut(&key).map(|(_, h)| h)
    }

    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(&key)
    }
}

impl<K: Copy + Eq + Hash, H> Default for HandlerTable<K, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_registration_wins() {
        let mut table = HandlerTable::new();
        table.register(0x0800u16, "first");
        table.register(0x0800u16, "second");
        assert_eq!(table.get_mut(0x0800), Some(&mut "second"));
    }

    #[test]
    fn test_unregister_only_if_current() {
        let mut table = HandlerTable::new();
        let old = table.register(17u8, "old");
        let new = table.register(17u8, "new");

        assert_eq!(table.unregister(17, old), None);
        assert!(table.contains(17));

        assert_eq!(table.unregister(17, new), Some("new"));
        assert!(!table.contains(17));
    }
}
