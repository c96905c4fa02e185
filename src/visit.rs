// src/visit.rs
//
// Generic traversal of the type graph.
//
// Walks every type and pack reachable from a root exactly once. Bound
// indirections are visited as nodes in their own right and then descended
// through, so visitors that care about mutability (the unify cache) can
// see them. Visitors return false to prune a node's children; cycles call
// the cycle hooks instead of revisiting.

use rustc_hash::FxHashSet;

use crate::type_arena::{TypeArena, TypeId, TypePackId};
use crate::types::{PackNode, TypeNode};

pub trait TypeVisitor {
    /// Called once per reachable type. Return false to skip its children.
    fn visit_type(&mut self, arena: &TypeArena, id: TypeId) -> bool {
        let _ = (arena, id);
        true
    }

    /// Called once per reachable pack. Return false to skip its children.
    fn visit_pack(&mut self, arena: &TypeArena, id: TypePackId) -> bool {
        let _ = (arena, id);
        true
    }

    fn cycle_type(&mut self, id: TypeId) {
        let _ = id;
    }

    fn cycle_pack(&mut self, id: TypePackId) {
        let _ = id;
    }
}

enum Work {
    Type(TypeId),
    Pack(TypePackId),
}

/// Visit every type and pack reachable from `root`, once each.
pub fn visit_type_once<V: TypeVisitor>(arena: &TypeArena, root: TypeId, visitor: &mut V) {
    walk(arena, Work::Type(root), visitor);
}

/// Visit every type and pack reachable from `root`, once each.
pub fn visit_pack_once<V: TypeVisitor>(arena: &TypeArena, root: TypePackId, visitor: &mut V) {
    walk(arena, Work::Pack(root), visitor);
}

fn walk<V: TypeVisitor>(arena: &TypeArena, root: Work, visitor: &mut V) {
    let mut seen_types: FxHashSet<TypeId> = FxHashSet::default();
    let mut seen_packs: FxHashSet<TypePackId> = FxHashSet::default();
    let mut stack = vec![root];

    while let Some(item) = stack.pop() {
        match item {
            Work::Type(id) => {
                if !seen_types.insert(id) {
                    visitor.cycle_type(id);
                    continue;
                }
                if !visitor.visit_type(arena, id) {
                    continue;
                }

                match arena.get(id) {
                    TypeNode::Free(_)
                    | TypeNode::Generic(_)
                    | TypeNode::Error
                    | TypeNode::Any
                    | TypeNode::Primitive(_)
                    | TypeNode::Singleton(_)
                    | TypeNode::Class(_) => {}
                    TypeNode::Bound(target) => stack.push(Work::Type(*target)),
                    TypeNode::Function(function) => {
                        stack.extend(function.generics.iter().map(|&g| Work::Type(g)));
                        stack.extend(function.generic_packs.iter().map(|&g| Work::Pack(g)));
                        stack.push(Work::Pack(function.args));
                        stack.push(Work::Pack(function.ret));
                    }
                    TypeNode::Table(table) => match table.bound_to {
                        Some(target) => stack.push(Work::Type(target)),
                        None => {
                            stack.extend(table.props.values().map(|prop| Work::Type(prop.ty)));
                            if let Some(indexer) = table.indexer {
                                stack.push(Work::Type(indexer.key_ty));
                                stack.push(Work::Type(indexer.value_ty));
                            }
                        }
                    },
                    TypeNode::Metatable(mt) => {
                        stack.push(Work::Type(mt.table));
                        stack.push(Work::Type(mt.metatable));
                    }
                    TypeNode::Union(union) => {
                        stack.extend(union.options.iter().map(|&opt| Work::Type(opt)));
                    }
                    TypeNode::Intersection(intersection) => {
                        stack.extend(intersection.parts.iter().map(|&part| Work::Type(part)));
                    }
                }
            }
            Work::Pack(id) => {
                if !seen_packs.insert(id) {
                    visitor.cycle_pack(id);
                    continue;
                }
                if !visitor.visit_pack(arena, id) {
                    continue;
                }

                match arena.get_pack(id) {
                    PackNode::Free(_) | PackNode::Generic | PackNode::Error => {}
                    PackNode::Bound(target) => stack.push(Work::Pack(*target)),
                    PackNode::List(list) => {
                        stack.extend(list.head.iter().map(|&ty| Work::Type(ty)));
                        if let Some(tail) = list.tail {
                            stack.push(Work::Pack(tail));
                        }
                    }
                    PackNode::Variadic(variadic) => stack.push(Work::Type(variadic.ty)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        FunctionType, Property, TableState, TableType, TypeLevel, TypeList, UnionType,
    };

    struct Collect {
        types: Vec<TypeId>,
        packs: Vec<TypePackId>,
        cycles: usize,
    }

    impl TypeVisitor for Collect {
        fn visit_type(&mut self, _arena: &TypeArena, id: TypeId) -> bool {
            self.types.push(id);
            true
        }

        fn visit_pack(&mut self, _arena: &TypeArena, id: TypePackId) -> bool {
            self.packs.push(id);
            true
        }

        fn cycle_type(&mut self, _id: TypeId) {
            self.cycles += 1;
        }
    }

    #[test]
    fn test_visits_function_interior() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let string = arena.builtins.string_type;
        let args = arena.add_pack(PackNode::List(TypeList::new([number], None)));
        let ret = arena.add_pack(PackNode::List(TypeList::new([string], None)));
        let function = arena.add_type(TypeNode::Function(FunctionType::new(args, ret)));

        let mut collect = Collect {
            types: Vec::new(),
            packs: Vec::new(),
            cycles: 0,
        };
        visit_type_once(&arena, function, &mut collect);

        assert!(collect.types.contains(&function));
        assert!(collect.types.contains(&number));
        assert!(collect.types.contains(&string));
        assert_eq!(collect.packs.len(), 2);
    }

    #[test]
    fn test_cyclic_graph_terminates() {
        let mut arena = TypeArena::new();
        let nil = arena.builtins.nil_type;

        // t = { self: t | nil }
        let table = arena.add_type(TypeNode::Table(TableType::new(
            TableState::Sealed,
            TypeLevel::default(),
        )));
        let union = arena.add_type(TypeNode::Union(UnionType {
            options: [table, nil].into_iter().collect(),
        }));
        if let TypeNode::Table(t) = arena.get_mut(table) {
            t.props.insert("self".to_string(), Property::new(union));
        }

        let mut collect = Collect {
            types: Vec::new(),
            packs: Vec::new(),
            cycles: 0,
        };
        visit_type_once(&arena, table, &mut collect);

        assert!(collect.cycles >= 1);
        assert!(collect.types.contains(&union));
    }
}
