// src/unify/cache.rs
//
// Memoization of proved subtype pairs.
//
// Only immutable types may be cached: anything containing a free,
// bound, generic, or non-sealed-table node can still change under
// unification, so a cached "proof" about it could go stale. The skip
// determination itself is memoized per type.

use crate::type_arena::{TypeArena, TypeId, TypePackId};
use crate::types::{PackNode, TableState, TypeNode};
use crate::visit::{self, TypeVisitor};

use super::{Unifier, Variance};

struct SkipCacheScan<'s> {
    memo: &'s rustc_hash::FxHashMap<TypeId, bool>,
    skip: bool,
}

impl TypeVisitor for SkipCacheScan<'_> {
    fn visit_type(&mut self, arena: &TypeArena, id: TypeId) -> bool {
        if self.skip {
            return false;
        }

        match arena.get(id) {
            TypeNode::Free(_) | TypeNode::Bound(_) | TypeNode::Generic(_) => {
                self.skip = true;
                false
            }
            TypeNode::Table(table) => {
                if table.bound_to.is_some() || table.state != TableState::Sealed {
                    self.skip = true;
                    false
                } else {
                    true
                }
            }
            _ => {
                if self.memo.get(&id).copied().unwrap_or(false) {
                    self.skip = true;
                    false
                } else {
                    true
                }
            }
        }
    }

    fn visit_pack(&mut self, arena: &TypeArena, id: TypePackId) -> bool {
        if self.skip {
            return false;
        }

        match arena.get_pack(id) {
            PackNode::Free(_) | PackNode::Bound(_) | PackNode::Generic => {
                self.skip = true;
                false
            }
            _ => true,
        }
    }
}

impl<'a> Unifier<'a> {
    /// Record `(super, sub)` as proved, provided both sides are immutable
    /// for unification purposes. Under invariance both orderings go in.
    pub(crate) fn cache_result(&mut self, super_ty: TypeId, sub_ty: TypeId) {
        if self.state.skip_cache_for_type.get(&super_ty) == Some(&true) {
            return;
        }
        if self.state.skip_cache_for_type.get(&sub_ty) == Some(&true) {
            return;
        }

        if self.skip_cache_for(super_ty) || self.skip_cache_for(sub_ty) {
            return;
        }

        tracing::trace!(?super_ty, ?sub_ty, "caching proved pair");
        self.state.cached_unify.insert((super_ty, sub_ty));

        if self.variance == Variance::Invariant {
            self.state.cached_unify.insert((sub_ty, super_ty));
        }
    }

    fn skip_cache_for(&mut self, ty: TypeId) -> bool {
        if let Some(&known) = self.state.skip_cache_for_type.get(&ty) {
            return known;
        }

        let mut scan = SkipCacheScan {
            memo: &self.state.skip_cache_for_type,
            skip: false,
        };
        visit::visit_type_once(self.arena, ty, &mut scan);
        let skip = scan.skip;

        self.state.skip_cache_for_type.insert(ty, skip);
        skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use crate::type_arena::TypeArena;
    use crate::types::{Property, TableType, TypeLevel};
    use crate::unify::{Mode, UnifierSharedState, Unifier};

    fn sealed_table(arena: &mut TypeArena, props: &[(&str, TypeId)]) -> TypeId {
        arena.add_type(TypeNode::Table(TableType::with_props(
            props
                .iter()
                .map(|(name, ty)| (name.to_string(), Property::new(*ty))),
            TableState::Sealed,
            TypeLevel::default(),
        )))
    }

    #[test]
    fn test_sealed_tables_are_cacheable() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let left = sealed_table(&mut arena, &[("x", number)]);
        let right = sealed_table(&mut arena, &[("x", number)]);

        let mut state = UnifierSharedState::default();
        let mut u = Unifier::new(
            &mut arena,
            &mut state,
            Mode::Strict,
            Span::default(),
            Variance::Covariant,
        );
        u.cache_result(left, right);

        assert!(u.state.cached_unify.contains(&(left, right)));
        assert!(!u.state.cached_unify.contains(&(right, left)));
    }

    #[test]
    fn test_invariant_caches_both_orders() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let left = sealed_table(&mut arena, &[("x", number)]);
        let right = sealed_table(&mut arena, &[("x", number)]);

        let mut state = UnifierSharedState::default();
        let mut u = Unifier::new(
            &mut arena,
            &mut state,
            Mode::Strict,
            Span::default(),
            Variance::Invariant,
        );
        u.cache_result(left, right);

        assert!(u.state.cached_unify.contains(&(left, right)));
        assert!(u.state.cached_unify.contains(&(right, left)));
    }

    #[test]
    fn test_free_interior_skips_cache() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let free = arena.fresh_type(TypeLevel::default());
        let left = sealed_table(&mut arena, &[("x", free)]);
        let right = sealed_table(&mut arena, &[("x", number)]);

        let mut state = UnifierSharedState::default();
        let mut u = Unifier::new(
            &mut arena,
            &mut state,
            Mode::Strict,
            Span::default(),
            Variance::Covariant,
        );
        u.cache_result(left, right);

        assert!(u.state.cached_unify.is_empty());
        assert_eq!(u.state.skip_cache_for_type.get(&left), Some(&true));
    }

    #[test]
    fn test_unsealed_table_skips_cache() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let left = arena.add_type(TypeNode::Table(TableType::with_props(
            [("x".to_string(), Property::new(number))],
            TableState::Unsealed,
            TypeLevel::default(),
        )));
        let right = sealed_table(&mut arena, &[("x", number)]);

        let mut state = UnifierSharedState::default();
        let mut u = Unifier::new(
            &mut arena,
            &mut state,
            Mode::Strict,
            Span::default(),
            Variance::Covariant,
        );
        u.cache_result(left, right);

        assert!(u.state.cached_unify.is_empty());
    }
}
