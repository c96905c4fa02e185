// src/txn_log.rs
//
// Transactional journal of type-graph mutations.
//
// Every mutation the unifier performs is preceded by a snapshot of the
// node about to change. Rolling back restores the snapshots in reverse
// order, so a failed speculative branch leaves the graph exactly as it
// found it. A successful child unifier's log is concatenated onto its
// parent's so the whole top-level operation stays one transaction.

use crate::type_arena::{TypeArena, TypeId, TypePackId};
use crate::types::{PackNode, TypeNode};

#[derive(Debug, Clone)]
enum LogEntry {
    Type { id: TypeId, saved: TypeNode },
    Pack { id: TypePackId, saved: PackNode },
}

#[derive(Debug, Clone, Default)]
pub struct TxnLog {
    entries: Vec<LogEntry>,
}

impl TxnLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Snapshot a type node before the caller mutates it.
    pub fn log_type(&mut self, arena: &TypeArena, id: TypeId) {
        self.entries.push(LogEntry::Type {
            id,
            saved: arena.get(id).clone(),
        });
    }

    /// Snapshot a pack node before the caller mutates it.
    pub fn log_pack(&mut self, arena: &TypeArena, id: TypePackId) {
        self.entries.push(LogEntry::Pack {
            id,
            saved: arena.get_pack(id).clone(),
        });
    }

    /// Restore every snapshotted node in reverse order and clear the log.
    pub fn rollback(&mut self, arena: &mut TypeArena) {
        tracing::trace!(entries = self.entries.len(), "rolling back unification");

        for entry in self.entries.drain(..).rev() {
            match entry {
                LogEntry::Type { id, saved } => *arena.get_mut(id) = saved,
                LogEntry::Pack { id, saved } => *arena.get_pack_mut(id) = saved,
            }
        }
    }

    /// Append another log's entries after ours. Used when a speculative
    /// child unifier succeeds.
    pub fn concat(&mut self, other: TxnLog) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FreeType, TypeLevel};

    #[test]
    fn test_rollback_restores_in_reverse_order() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let string = arena.builtins.string_type;
        let free = arena.fresh_type(TypeLevel::default());

        let mut log = TxnLog::new();

        // Two successive rebinds of the same node; rollback must land on
        // the original Free state, not the intermediate one.
        log.log_type(&arena, free);
        *arena.get_mut(free) = TypeNode::Bound(number);
        log.log_type(&arena, free);
        *arena.get_mut(free) = TypeNode::Bound(string);

        log.rollback(&mut arena);

        assert_eq!(
            arena.get(free),
            &TypeNode::Free(FreeType {
                level: TypeLevel::default()
            })
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_concat_preserves_child_entries() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let a = arena.fresh_type(TypeLevel::default());
        let b = arena.fresh_type(TypeLevel::default());

        let mut parent = TxnLog::new();
        parent.log_type(&arena, a);
        *arena.get_mut(a) = TypeNode::Bound(number);

        let mut child = TxnLog::new();
        child.log_type(&arena, b);
        *arena.get_mut(b) = TypeNode::Bound(a);

        parent.concat(child);
        assert_eq!(parent.len(), 2);

        parent.rollback(&mut arena);
        assert!(matches!(arena.get(a), TypeNode::Free(_)));
        assert!(matches!(arena.get(b), TypeNode::Free(_)));
    }

    #[test]
    fn test_pack_snapshots_round_trip() {
        let mut arena = TypeArena::new();
        let target = arena.add_pack(PackNode::List(Default::default()));
        let free = arena.fresh_pack(TypeLevel::default());

        let mut log = TxnLog::new();
        log.log_pack(&arena, free);
        *arena.get_pack_mut(free) = PackNode::Bound(target);

        log.rollback(&mut arena);
        assert!(matches!(arena.get_pack(free), PackNode::Free(_)));
    }
}
