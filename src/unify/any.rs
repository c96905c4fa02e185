// src/unify/any.rs
//
// Coercion against `any` and the error type.
//
// When one side of a unification is `any` (or error recovery), the other
// side's entire reachable subgraph is conceded: every free type variable
// in it is bound so later code sees a settled type instead of a dangling
// inference variable.

use rustc_hash::FxHashSet;

use crate::type_arena::{TypeId, TypePackId};
use crate::types::{PackNode, TypeNode, VariadicPack};

use super::Unifier;

impl<'a> Unifier<'a> {
    /// `absorber` is `any` or the error type; flood `ty`'s subgraph.
    pub(crate) fn try_unify_with_any_type(&mut self, absorber: TypeId, ty: TypeId) {
        let is_any = match self.arena.get(absorber) {
            TypeNode::Any => true,
            TypeNode::Error => false,
            _ => self.ice("try_unify_with_any_type invoked without any or error"),
        };

        // Leaves that the flood below never rebinds anyway.
        if matches!(
            self.arena.get(ty),
            TypeNode::Primitive(_) | TypeNode::Any | TypeNode::Class(_)
        ) {
            return;
        }

        let (bind_ty, bind_tp) = if is_any {
            let any = self.arena.builtins.any_type;
            (
                any,
                self.arena
                    .add_pack(PackNode::Variadic(VariadicPack { ty: any })),
            )
        } else {
            (
                self.arena.builtins.error_type,
                self.arena.builtins.error_pack,
            )
        };

        let mut seen_types = std::mem::take(&mut self.state.scratch_types);
        let mut seen_packs = std::mem::take(&mut self.state.scratch_packs);
        seen_types.clear();
        seen_packs.clear();

        self.flood_with_any(vec![ty], &mut seen_types, &mut seen_packs, bind_ty, bind_tp);

        self.state.scratch_types = seen_types;
        self.state.scratch_packs = seen_packs;
    }

    /// `absorber` is the error-recovery pack; flood `tp`'s subgraph.
    pub(crate) fn try_unify_with_any_pack(&mut self, absorber: TypePackId, tp: TypePackId) {
        if !matches!(self.arena.get_pack(absorber), PackNode::Error) {
            self.ice("try_unify_with_any_pack invoked without an error pack");
        }

        let bind_ty = self.arena.builtins.error_type;

        let mut seen_types = std::mem::take(&mut self.state.scratch_types);
        let mut seen_packs = std::mem::take(&mut self.state.scratch_packs);
        seen_types.clear();
        seen_packs.clear();

        let mut queue = Vec::new();
        self.queue_type_pack(&mut queue, &mut seen_packs, tp, absorber);
        self.flood_with_any(queue, &mut seen_types, &mut seen_packs, bind_ty, absorber);

        self.state.scratch_types = seen_types;
        self.state.scratch_packs = seen_packs;
    }

    fn flood_with_any(
        &mut self,
        mut queue: Vec<TypeId>,
        seen_types: &mut FxHashSet<TypeId>,
        seen_packs: &mut FxHashSet<TypePackId>,
        bind_ty: TypeId,
        bind_tp: TypePackId,
    ) {
        while let Some(ty) = queue.pop() {
            let ty = self.arena.follow(ty);
            if !seen_types.insert(ty) {
                continue;
            }

            enum Step {
                Bind,
                Function(TypePackId, TypePackId),
                Children(Vec<TypeId>),
                Leaf,
            }

            let step = match self.arena.get(ty) {
                TypeNode::Free(_) => Step::Bind,
                TypeNode::Function(function) => Step::Function(function.args, function.ret),
                TypeNode::Table(table) => {
                    let mut children: Vec<TypeId> =
                        table.props.values().map(|prop| prop.ty).collect();
                    if let Some(indexer) = table.indexer {
                        children.push(indexer.key_ty);
                        children.push(indexer.value_ty);
                    }
                    Step::Children(children)
                }
                TypeNode::Metatable(mt) => Step::Children(vec![mt.table, mt.metatable]),
                TypeNode::Union(union) => Step::Children(union.options.to_vec()),
                TypeNode::Intersection(intersection) => {
                    Step::Children(intersection.parts.to_vec())
                }
                // Primitives, generics, classes, and already-settled types
                // terminate the flood.
                _ => Step::Leaf,
            };

            match step {
                Step::Bind => {
                    self.log.log_type(self.arena, ty);
                    *self.arena.get_mut(ty) = TypeNode::Bound(bind_ty);
                }
                Step::Function(args, ret) => {
                    self.queue_type_pack(&mut queue, seen_packs, args, bind_tp);
                    self.queue_type_pack(&mut queue, seen_packs, ret, bind_tp);
                }
                Step::Children(children) => queue.extend(children),
                Step::Leaf => {}
            }
        }
    }

    /// Enqueue a pack chain's head types; free tails are conceded to the
    /// absorbing pack.
    fn queue_type_pack(
        &mut self,
        queue: &mut Vec<TypeId>,
        seen_packs: &mut FxHashSet<TypePackId>,
        tp: TypePackId,
        bind_tp: TypePackId,
    ) {
        let mut cur = tp;
        loop {
            cur = self.arena.follow_pack(cur);
            if !seen_packs.insert(cur) {
                break;
            }

            match self.arena.get_pack(cur) {
                PackNode::Free(_) => {
                    self.log.log_pack(self.arena, cur);
                    *self.arena.get_pack_mut(cur) = PackNode::Bound(bind_tp);
                    break;
                }
                PackNode::List(list) => {
                    queue.extend(list.head.iter().copied());
                    match list.tail {
                        Some(tail) => cur = tail,
                        None => break,
                    }
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use crate::type_arena::TypeArena;
    use crate::types::{FunctionType, Property, TableState, TableType, TypeLevel, TypeList};
    use crate::unify::{Mode, UnifierSharedState, Unifier, Variance};

    fn unifier<'a>(arena: &'a mut TypeArena, state: &'a mut UnifierSharedState) -> Unifier<'a> {
        Unifier::new(arena, state, Mode::Strict, Span::default(), Variance::Covariant)
    }

    #[test]
    fn test_any_floods_function_interior() {
        let mut arena = TypeArena::new();
        let any = arena.builtins.any_type;
        let arg = arena.fresh_type(TypeLevel::default());
        let ret = arena.fresh_type(TypeLevel::default());
        let args = arena.add_pack(PackNode::List(TypeList::new([arg], None)));
        let rets = arena.add_pack(PackNode::List(TypeList::new([ret], None)));
        let function = arena.add_type(TypeNode::Function(FunctionType::new(args, rets)));

        let mut state = UnifierSharedState::default();
        let mut u = unifier(&mut arena, &mut state);
        u.try_unify_with_any_type(any, function);

        assert!(u.errors.is_empty());
        assert_eq!(u.arena().follow(arg), any);
        assert_eq!(u.arena().follow(ret), any);
    }

    #[test]
    fn test_error_floods_table_props_with_recovery_type() {
        let mut arena = TypeArena::new();
        let error = arena.builtins.error_type;
        let free = arena.fresh_type(TypeLevel::default());
        let table = arena.add_type(TypeNode::Table(TableType::with_props(
            [("p".to_string(), Property::new(free))],
            TableState::Sealed,
            TypeLevel::default(),
        )));

        let mut state = UnifierSharedState::default();
        let mut u = unifier(&mut arena, &mut state);
        u.try_unify_with_any_type(error, table);

        assert_eq!(u.arena().follow(free), error);
    }

    #[test]
    fn test_flood_is_journaled() {
        let mut arena = TypeArena::new();
        let any = arena.builtins.any_type;
        let free = arena.fresh_type(TypeLevel::default());
        let table = arena.add_type(TypeNode::Table(TableType::with_props(
            [("p".to_string(), Property::new(free))],
            TableState::Sealed,
            TypeLevel::default(),
        )));

        let mut state = UnifierSharedState::default();
        let mut u = unifier(&mut arena, &mut state);
        u.try_unify_with_any_type(any, table);
        assert_eq!(u.arena().follow(free), any);

        u.rollback();
        assert!(matches!(u.arena().get(free), TypeNode::Free(_)));
    }
}
