//! Trusted and untrusted discovery queues.

use crate::candidate::{Priority, TrustLevel};
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Trusted,
    Untrusted,
}

impl QueueKind {
    pub fn for_trust(trust: TrustLevel) -> Self {
        match trust {
            TrustLevel::Untrusted => QueueKind::Untrusted,
            TrustLevel::SemiTrusted | TrustLevel::Trusted => QueueKind::Trusted,
        }
    }
}

/// A max-priority queue of addresses that supports removal.
///
/// Equal priorities pop lower addresses first.
#[derive(Debug, Default)]
pub struct AddressQueue {
    entries: BTreeSet<(Priority, Reverse<u64>)>,
    queued: FxHashMap<u64, Priority>,
}

impl AddressQueue {
    /// Insert, or move an already queued address to its new priority.
    pub fn push(&mut self, address: u64, priority: Priority) {
        if let Some(old) = self.queued.insert(address, priority) {
            self.entries.remove(&(old, Reverse(address)));
        }
        self.entries.insert((priority, Reverse(address)));
    }

    pub fn pop(&mut self) -> Option<u64> {
        let (_, Reverse(address)) = self.entries.pop_last()?;
        self.queued.remove(&address);
        Some(address)
    }

    pub fn remove(&mut self, address: u64) -> bool {
        match self.queued.remove(&address) {
            Some(priority) => self.entries.remove(&(priority, Reverse(address))),
            None => false,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        self.queued.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The trusted and untrusted discovery queues. New work goes to whichever
/// queue is currently being drained.
#[derive(Debug)]
pub struct Scheduler {
    trusted: AddressQueue,
    untrusted: AddressQueue,
    current: QueueKind,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            trusted: AddressQueue::default(),
            untrusted: AddressQueue::default(),
            current: QueueKind::Trusted,
        }
    }
}

impl Scheduler {
    pub fn current(&self) -> QueueKind {
        self.current
    }

    pub fn set_current(&mut self, kind: QueueKind) {
        self.current = kind;
    }

    pub fn queue(&mut self, kind: QueueKind) -> &mut AddressQueue {
        match kind {
            QueueKind::Trusted => &mut self.trusted,
            QueueKind::Untrusted => &mut self.untrusted,
        }
    }

    pub fn push(&mut self, kind: QueueKind, address: u64, priority: Priority) {
        self.queue(kind).push(address, priority);
    }

    pub fn push_current(&mut self, address: u64, priority: Priority) {
        self.push(self.current, address, priority);
    }

    /// Move a queued address to a new priority, leaving unqueued addresses alone.
    pub fn reprioritize(&mut self, address: u64, priority: Priority) {
        for queue in [&mut self.trusted, &mut self.untrusted] {
            if queue.contains(address) {
                queue.push(address, priority);
            }
        }
    }

    /// Take an address out of whichever queue holds it.
    pub fn remove(&mut self, address: u64) -> bool {
        self.trusted.remove(address) | self.untrusted.remove(address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.trusted.contains(address) || self.untrusted.contains(address)
    }

    pub fn pop(&mut self, kind: QueueKind) -> Option<u64> {
        self.queue(kind).pop()
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Trusted => self.trusted.len(),
            QueueKind::Untrusted => self.untrusted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::FoundBy;

    #[test]
    fn test_pop_order_follows_priority() {
        let mut queue = AddressQueue::default();
        queue.push(0x3000, FoundBy::RUNTIME_FUNCTION.into());
        queue.push(0x2000, (FoundBy::EXPORT | FoundBy::CALL).into());
        queue.push(0x1000, FoundBy::CALL.into());
        assert_eq!(queue.pop(), Some(0x2000));
        assert_eq!(queue.pop(), Some(0x3000));
        assert_eq!(queue.pop(), Some(0x1000));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_reprioritize_replaces_entry() {
        let mut queue = AddressQueue::default();
        queue.push(0x1000, FoundBy::CALL.into());
        queue.push(0x2000, FoundBy::SYMBOL.into());
        queue.push(0x1000, (FoundBy::CALL | FoundBy::EXPORT).into());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(0x1000));
        assert_eq!(queue.pop(), Some(0x2000));
    }

    #[test]
    fn test_ties_pop_lowest_address() {
        let mut queue = AddressQueue::default();
        queue.push(0x2000, FoundBy::SYMBOL.into());
        queue.push(0x1000, FoundBy::SYMBOL.into());
        assert_eq!(queue.pop(), Some(0x1000));
    }

    #[test]
    fn test_remove_from_either_queue() {
        let mut scheduler = Scheduler::default();
        scheduler.push(QueueKind::Untrusted, 0x1000, FoundBy::RVA.into());
        scheduler.push_current(0x2000, FoundBy::CALL.into());
        assert!(scheduler.remove(0x1000));
        assert!(!scheduler.remove(0x1000));
        assert_eq!(scheduler.len(QueueKind::Untrusted), 0);
        assert_eq!(scheduler.pop(QueueKind::Trusted), Some(0x2000));
    }

    #[test]
    fn test_reprioritize_only_touches_queued() {
        let mut scheduler = Scheduler::default();
        scheduler.push(QueueKind::Untrusted, 0x1000, FoundBy::CALL.into());
        scheduler.push(QueueKind::Untrusted, 0x2000, FoundBy::SYMBOL.into());
        scheduler.reprioritize(0x1000, (FoundBy::CALL | FoundBy::EXPORT).into());
        scheduler.reprioritize(0x3000, FoundBy::EXPORT.into());
        assert!(!scheduler.contains(0x3000));
        assert_eq!(scheduler.pop(QueueKind::Untrusted), Some(0x1000));
    }
}
