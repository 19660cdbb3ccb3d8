//! Object members: a key → element map with last-writer-wins by creation
//! ticket. The loser of a concurrent set is tombstoned rather than left
//! dangling, so replicas converge on both the winner and the garbage.

use std::collections::BTreeMap;

use smartstring::alias::String as SmartString;

use crate::time::TimeTicket;

#[derive(Debug, PartialEq, Eq)]
pub enum MemberSet {
    /// The key was empty.
    Inserted,
    /// The previous member lost; tombstone it with the winner's ticket.
    ReplacedOld { old: TimeTicket },
    /// The incoming element lost; tombstone it with the winner's ticket.
    NewLost { winner: TimeTicket },
}

#[derive(Debug, Clone, Default)]
pub struct CrdtObject {
    members: BTreeMap<SmartString, TimeTicket>,
}

impl CrdtObject {
    pub fn new() -> CrdtObject {
        CrdtObject::default()
    }

    pub fn set(&mut self, key: &str, created: TimeTicket) -> MemberSet {
        match self.members.get(key).copied() {
            None => {
                self.members.insert(SmartString::from(key), created);
                MemberSet::Inserted
            }
            Some(old) if created.after(old) => {
                self.members.insert(SmartString::from(key), created);
                MemberSet::ReplacedOld { old }
            }
            Some(old) => MemberSet::NewLost { winner: old },
        }
    }

    pub fn get(&self, key: &str) -> Option<TimeTicket> {
        self.members.get(key).copied()
    }

    pub fn key_of(&self, created: TimeTicket) -> Option<&SmartString> {
        self.members.iter().find(|(_, &t)| t == created).map(|(k, _)| k)
    }

    /// Drops the mapping during GC, but only while it still points at the
    /// purged element.
    pub fn unlink(&mut self, key: &str, created: TimeTicket) {
        if self.members.get(key) == Some(&created) {
            self.members.remove(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmartString, TimeTicket)> {
        self.members.iter().map(|(k, &t)| (k, t))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ActorId;

    fn ticket(lamport: u64) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId::INITIAL)
    }

    #[test]
    fn later_creation_wins_the_key() {
        let mut obj = CrdtObject::new();
        assert_eq!(obj.set("a", ticket(1)), MemberSet::Inserted);
        assert_eq!(obj.set("a", ticket(3)), MemberSet::ReplacedOld { old: ticket(1) });
        // A concurrent set that lost the race leaves the winner in place.
        assert_eq!(obj.set("a", ticket(2)), MemberSet::NewLost { winner: ticket(3) });
        assert_eq!(obj.get("a"), Some(ticket(3)));
    }

    #[test]
    fn unlink_only_matches_the_current_member() {
        let mut obj = CrdtObject::new();
        obj.set("a", ticket(1));
        obj.unlink("a", ticket(2));
        assert_eq!(obj.get("a"), Some(ticket(1)));
        obj.unlink("a", ticket(1));
        assert_eq!(obj.get("a"), None);
    }
}
