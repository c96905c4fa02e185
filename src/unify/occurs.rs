// src/unify/occurs.rs
//
// Occurs check: refuse to bind a free variable to a structure that
// contains it, which would create an infinite type. The offending
// variable is replaced with the error-recovery node so checking can
// continue.

use rustc_hash::FxHashSet;

use crate::errors::{TypeError, UnifyError};
use crate::type_arena::{TypeId, TypePackId, flatten_pack};
use crate::types::{PackNode, TypeNode};

use super::Unifier;

impl<'a> Unifier<'a> {
    /// Check that binding `needle := other` would not make `needle` a
    /// member of its own structure.
    pub(crate) fn occurs_check_type(&mut self, needle: TypeId, haystack: TypeId) {
        let mut seen = std::mem::take(&mut self.state.scratch_types);
        seen.clear();
        self.occurs_check_type_seen(&mut seen, needle, haystack);
        self.state.scratch_types = seen;
    }

    fn occurs_check_type_seen(
        &mut self,
        seen: &mut FxHashSet<TypeId>,
        needle: TypeId,
        haystack: TypeId,
    ) {
        if !self.enter_recursion() {
            return;
        }
        self.occurs_check_type_step(seen, needle, haystack);
        self.leave_recursion();
    }

    fn occurs_check_type_step(
        &mut self,
        seen: &mut FxHashSet<TypeId>,
        needle: TypeId,
        haystack: TypeId,
    ) {
        let needle = self.arena.follow(needle);
        let haystack = self.arena.follow(haystack);

        if !seen.insert(haystack) {
            return;
        }

        if matches!(self.arena.get(needle), TypeNode::Error) {
            return;
        }

        if !matches!(self.arena.get(needle), TypeNode::Free(_)) {
            self.ice("occurs check needle is not a free type");
        }

        if needle == haystack {
            self.errors
                .push(TypeError::new(UnifyError::OccursCheckFailed, self.span));
            self.log.log_type(self.arena, needle);
            *self.arena.get_mut(needle) = TypeNode::Error;
            return;
        }

        enum Children {
            None,
            Types(Vec<TypeId>),
            Packs(TypePackId, TypePackId),
        }

        let children = match self.arena.get(haystack) {
            TypeNode::Free(_) => Children::None,
            TypeNode::Function(function) => {
                if self.state.config.recursive_function_types {
                    // Recursion through a function is representable;
                    // leave its interior alone.
                    Children::None
                } else {
                    Children::Packs(function.args, function.ret)
                }
            }
            TypeNode::Union(union) => Children::Types(union.options.to_vec()),
            TypeNode::Intersection(intersection) => {
                Children::Types(intersection.parts.to_vec())
            }
            _ => Children::None,
        };

        match children {
            Children::None => {}
            Children::Types(types) => {
                for ty in types {
                    self.occurs_check_type_seen(seen, needle, ty);
                }
            }
            Children::Packs(args, ret) => {
                for ty in flatten_pack(self.arena, args).0 {
                    self.occurs_check_type_seen(seen, needle, ty);
                }
                for ty in flatten_pack(self.arena, ret).0 {
                    self.occurs_check_type_seen(seen, needle, ty);
                }
            }
        }
    }

    pub(crate) fn occurs_check_pack(&mut self, needle: TypePackId, haystack: TypePackId) {
        let mut seen = std::mem::take(&mut self.state.scratch_packs);
        seen.clear();
        self.occurs_check_pack_seen(&mut seen, needle, haystack);
        self.state.scratch_packs = seen;
    }

    fn occurs_check_pack_seen(
        &mut self,
        seen: &mut FxHashSet<TypePackId>,
        needle: TypePackId,
        haystack: TypePackId,
    ) {
        if !self.enter_recursion() {
            return;
        }
        self.occurs_check_pack_step(seen, needle, haystack);
        self.leave_recursion();
    }

    fn occurs_check_pack_step(
        &mut self,
        seen: &mut FxHashSet<TypePackId>,
        needle: TypePackId,
        haystack: TypePackId,
    ) {
        let needle = self.arena.follow_pack(needle);
        let mut haystack = self.arena.follow_pack(haystack);

        if !seen.insert(haystack) {
            return;
        }

        if matches!(self.arena.get_pack(needle), PackNode::Error) {
            return;
        }

        if !matches!(self.arena.get_pack(needle), PackNode::Free(_)) {
            self.ice("occurs check needle is not a free pack");
        }

        loop {
            if needle == haystack {
                self.errors
                    .push(TypeError::new(UnifyError::OccursCheckFailed, self.span));
                self.log.log_pack(self.arena, needle);
                *self.arena.get_pack_mut(needle) = PackNode::Error;
                return;
            }

            let (head, tail) = match self.arena.get_pack(haystack) {
                PackNode::List(list) => (list.head.to_vec(), list.tail),
                _ => return,
            };

            if !self.state.config.recursive_function_types {
                for ty in head {
                    let followed = self.arena.follow(ty);
                    let packs = match self.arena.get(followed) {
                        TypeNode::Function(function) => Some((function.args, function.ret)),
                        _ => None,
                    };
                    if let Some((args, ret)) = packs {
                        self.occurs_check_pack_seen(seen, needle, args);
                        self.occurs_check_pack_seen(seen, needle, ret);
                    }
                }
            }

            match tail {
                Some(tail) => {
                    haystack = self.arena.follow_pack(tail);
                    if !seen.insert(haystack) {
                        return;
                    }
                }
                None => return,
            }
        }
    }
}
