// src/type_arena.rs
//
// Arena storage for type and pack nodes.
//
// Handles are u32 indices. Nodes are mutable in place: unification turns
// Free nodes into Bound indirections, grows free tables, and lowers
// levels, all without invalidating outstanding handles. Nothing is ever
// freed; the arena lives as long as the checking session.

use hashbrown::HashSet;

use crate::types::{
    ClassType, FreePack, FreeType, PackNode, PrimitiveType, Property, TableType, TypeLevel,
    TypeList, TypeNode,
};

/// Handle to a type node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypeId(u32);

impl TypeId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index (for debugging/serialization)
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Handle to a type pack node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypePackId(u32);

impl TypePackId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Pre-allocated singleton types shared by the whole session.
///
/// These are persistent: the unifier never rebinds them, and definition
/// metadata never propagates onto them.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinTypes {
    pub nil_type: TypeId,
    pub boolean_type: TypeId,
    pub number_type: TypeId,
    pub string_type: TypeId,
    pub thread_type: TypeId,
    pub any_type: TypeId,
    /// Placeholder produced while recovering from an earlier error.
    pub error_type: TypeId,
    pub error_pack: TypePackId,
}

/// Per-session type arena.
pub struct TypeArena {
    types: Vec<TypeNode>,
    packs: Vec<PackNode>,
    pub builtins: BuiltinTypes,
    /// Handles below these watermarks were allocated during construction
    /// and are persistent.
    persistent_types: u32,
    persistent_packs: u32,
}

impl TypeArena {
    pub fn new() -> Self {
        let mut types = Vec::new();
        let mut packs = Vec::new();

        let mut add = |node: TypeNode| {
            let id = TypeId(types.len() as u32);
            types.push(node);
            id
        };

        let builtins = BuiltinTypes {
            nil_type: add(TypeNode::Primitive(PrimitiveType::Nil)),
            boolean_type: add(TypeNode::Primitive(PrimitiveType::Boolean)),
            number_type: add(TypeNode::Primitive(PrimitiveType::Number)),
            string_type: add(TypeNode::Primitive(PrimitiveType::String)),
            thread_type: add(TypeNode::Primitive(PrimitiveType::Thread)),
            any_type: add(TypeNode::Any),
            error_type: add(TypeNode::Error),
            error_pack: {
                let id = TypePackId(packs.len() as u32);
                packs.push(PackNode::Error);
                id
            },
        };

        let persistent_types = types.len() as u32;
        let persistent_packs = packs.len() as u32;

        Self {
            types,
            packs,
            builtins,
            persistent_types,
            persistent_packs,
        }
    }

    pub fn add_type(&mut self, node: TypeNode) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(node);
        id
    }

    pub fn add_pack(&mut self, node: PackNode) -> TypePackId {
        let id = TypePackId(self.packs.len() as u32);
        self.packs.push(node);
        id
    }

    /// A fresh free type variable at the given scope level.
    pub fn fresh_type(&mut self, level: TypeLevel) -> TypeId {
        self.add_type(TypeNode::Free(FreeType { level }))
    }

    /// A fresh free type pack at the given scope level.
    pub fn fresh_pack(&mut self, level: TypeLevel) -> TypePackId {
        self.add_pack(PackNode::Free(FreePack { level }))
    }

    pub fn get(&self, id: TypeId) -> &TypeNode {
        &self.types[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeNode {
        &mut self.types[id.0 as usize]
    }

    pub fn get_pack(&self, id: TypePackId) -> &PackNode {
        &self.packs[id.0 as usize]
    }

    pub fn get_pack_mut(&mut self, id: TypePackId) -> &mut PackNode {
        &mut self.packs[id.0 as usize]
    }

    pub fn is_persistent(&self, id: TypeId) -> bool {
        id.0 < self.persistent_types
    }

    pub fn is_persistent_pack(&self, id: TypePackId) -> bool {
        id.0 < self.persistent_packs
    }

    /// Chase Bound indirections (and table `bound_to` links) to the
    /// canonical representative. Bound chains are acyclic by construction,
    /// so this terminates.
    pub fn follow(&self, id: TypeId) -> TypeId {
        let mut cur = id;
        loop {
            match self.get(cur) {
                TypeNode::Bound(next) => cur = *next,
                TypeNode::Table(table) => match table.bound_to {
                    Some(next) => cur = next,
                    None => return cur,
                },
                _ => return cur,
            }
        }
    }

    pub fn follow_pack(&self, id: TypePackId) -> TypePackId {
        let mut cur = id;
        while let PackNode::Bound(next) = self.get_pack(cur) {
            cur = *next;
        }
        cur
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Graph helpers
// ---------------------------------------------------------------------------

pub fn is_nil(arena: &TypeArena, ty: TypeId) -> bool {
    matches!(
        arena.get(arena.follow(ty)),
        TypeNode::Primitive(PrimitiveType::Nil)
    )
}

pub fn is_string(arena: &TypeArena, ty: TypeId) -> bool {
    matches!(
        arena.get(arena.follow(ty)),
        TypeNode::Primitive(PrimitiveType::String)
    )
}

pub fn is_any(arena: &TypeArena, ty: TypeId) -> bool {
    matches!(arena.get(arena.follow(ty)), TypeNode::Any)
}

/// A type is optional when it is a union with a nil option.
pub fn is_optional(arena: &TypeArena, ty: TypeId) -> bool {
    match arena.get(arena.follow(ty)) {
        TypeNode::Union(union) => union.options.iter().any(|&opt| is_nil(arena, opt)),
        _ => false,
    }
}

/// Walk the parent chain of `sub` looking for `superclass`.
pub fn is_subclass(arena: &TypeArena, sub: TypeId, superclass: TypeId) -> bool {
    let superclass = arena.follow(superclass);
    let mut cur = arena.follow(sub);
    loop {
        if cur == superclass {
            return true;
        }
        match arena.get(cur) {
            TypeNode::Class(class) => match class.parent {
                Some(parent) => cur = arena.follow(parent),
                None => return false,
            },
            _ => return false,
        }
    }
}

pub fn lookup_class_prop(arena: &TypeArena, class: TypeId, name: &str) -> Option<Property> {
    let mut cur = arena.follow(class);
    loop {
        match arena.get(cur) {
            TypeNode::Class(class) => {
                if let Some(prop) = class.props.get(name) {
                    return Some(*prop);
                }
                cur = arena.follow(class.parent?);
            }
            _ => return None,
        }
    }
}

/// Look up a property on a table, falling back to the `__index` table of
/// its metatable. Cycle-safe.
pub fn find_table_property_respecting_meta(
    arena: &TypeArena,
    ty: TypeId,
    name: &str,
) -> Option<TypeId> {
    let mut seen: HashSet<TypeId> = HashSet::new();
    let mut cur = arena.follow(ty);

    loop {
        if !seen.insert(cur) {
            return None;
        }

        match arena.get(cur) {
            TypeNode::Table(table) => {
                return table.props.get(name).map(|prop| prop.ty);
            }
            TypeNode::Metatable(mt) => {
                let inner = arena.follow(mt.table);
                if let TypeNode::Table(table) = arena.get(inner)
                    && let Some(prop) = table.props.get(name)
                {
                    return Some(prop.ty);
                }

                let meta = arena.follow(mt.metatable);
                match arena.get(meta) {
                    TypeNode::Table(meta_table) => match meta_table.props.get("__index") {
                        Some(index) => cur = arena.follow(index.ty),
                        None => return None,
                    },
                    _ => return None,
                }
            }
            _ => return None,
        }
    }
}

/// The display name a type was bound to, if any. Drives the union option
/// ordering heuristic.
pub fn type_name(arena: &TypeArena, ty: TypeId) -> Option<&str> {
    match arena.get(arena.follow(ty)) {
        TypeNode::Table(table) => table
            .name
            .as_deref()
            .or(table.synthetic_name.as_deref()),
        TypeNode::Class(class) => Some(&class.name),
        TypeNode::Metatable(mt) => type_name(arena, mt.table),
        _ => None,
    }
}

/// Flatten a pack into its head types and terminal tail, chasing bound
/// links and nested list tails.
pub fn flatten_pack(arena: &TypeArena, pack: TypePackId) -> (Vec<TypeId>, Option<TypePackId>) {
    let mut head = Vec::new();
    let mut cur = arena.follow_pack(pack);

    loop {
        match arena.get_pack(cur) {
            PackNode::List(list) => {
                head.extend(list.head.iter().copied());
                match list.tail {
                    Some(tail) => cur = arena.follow_pack(tail),
                    None => return (head, None),
                }
            }
            _ => return (head, Some(cur)),
        }
    }
}

/// Number of head elements reachable without crossing a non-list tail.
pub fn pack_size(arena: &TypeArena, pack: TypePackId) -> usize {
    flatten_pack(arena, pack).0.len()
}

/// A pack is finite when it does not end in a free, generic, or variadic
/// tail.
pub fn pack_finite(arena: &TypeArena, pack: TypePackId) -> bool {
    match flatten_pack(arena, pack).1 {
        None => true,
        Some(tail) => matches!(arena.get_pack(tail), PackNode::Error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TableState, UnionType};

    #[test]
    fn test_follow_chases_bound_chains() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let a = arena.fresh_type(TypeLevel::default());
        let b = arena.fresh_type(TypeLevel::default());
        *arena.get_mut(a) = TypeNode::Bound(b);
        *arena.get_mut(b) = TypeNode::Bound(number);

        assert_eq!(arena.follow(a), number);
        assert_eq!(arena.follow(number), number);
    }

    #[test]
    fn test_follow_respects_table_bound_to() {
        let mut arena = TypeArena::new();
        let target = arena.add_type(TypeNode::Table(TableType::new(
            TableState::Sealed,
            TypeLevel::default(),
        )));
        let mut source_table = TableType::new(TableState::Free, TypeLevel::default());
        source_table.bound_to = Some(target);
        let source = arena.add_type(TypeNode::Table(source_table));

        assert_eq!(arena.follow(source), target);
    }

    #[test]
    fn test_is_optional_sees_nil_union() {
        let mut arena = TypeArena::new();
        let nil = arena.builtins.nil_type;
        let number = arena.builtins.number_type;
        let optional = arena.add_type(TypeNode::Union(UnionType {
            options: [nil, number].into_iter().collect(),
        }));

        assert!(is_optional(&arena, optional));
        assert!(!is_optional(&arena, number));
    }

    #[test]
    fn test_subclass_chain() {
        let mut arena = TypeArena::new();
        let base = arena.add_type(TypeNode::Class(ClassType::new("Base", None)));
        let middle = arena.add_type(TypeNode::Class(ClassType::new("Middle", Some(base))));
        let leaf = arena.add_type(TypeNode::Class(ClassType::new("Leaf", Some(middle))));

        assert!(is_subclass(&arena, leaf, base));
        assert!(is_subclass(&arena, leaf, leaf));
        assert!(!is_subclass(&arena, base, leaf));
    }

    #[test]
    fn test_property_lookup_through_metatable_index() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;

        let methods = arena.add_type(TypeNode::Table(TableType::with_props(
            [("answer".to_string(), Property::new(number))],
            TableState::Sealed,
            TypeLevel::default(),
        )));
        let meta = arena.add_type(TypeNode::Table(TableType::with_props(
            [("__index".to_string(), Property::new(methods))],
            TableState::Sealed,
            TypeLevel::default(),
        )));
        let inner = arena.add_type(TypeNode::Table(TableType::new(
            TableState::Sealed,
            TypeLevel::default(),
        )));
        let wrapped = arena.add_type(TypeNode::Metatable(crate::types::MetatableType {
            table: inner,
            metatable: meta,
        }));

        assert_eq!(
            find_table_property_respecting_meta(&arena, wrapped, "answer"),
            Some(number)
        );
        assert_eq!(
            find_table_property_respecting_meta(&arena, wrapped, "missing"),
            None
        );
    }

    #[test]
    fn test_flatten_chases_nested_lists() {
        let mut arena = TypeArena::new();
        let number = arena.builtins.number_type;
        let string = arena.builtins.string_type;
        let free_tail = arena.fresh_pack(TypeLevel::default());
        let inner = arena.add_pack(PackNode::List(TypeList::new([string], Some(free_tail))));
        let outer = arena.add_pack(PackNode::List(TypeList::new([number], Some(inner))));

        let (head, tail) = flatten_pack(&arena, outer);
        assert_eq!(head, vec![number, string]);
        assert_eq!(tail, Some(free_tail));
        assert_eq!(pack_size(&arena, outer), 2);
        assert!(!pack_finite(&arena, outer));
    }
}
