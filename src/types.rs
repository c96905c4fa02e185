// src/types.rs
//
// Type graph nodes.
//
// Unlike an interning arena, nodes here are mutable in place: unification
// refines a Free node into a Bound indirection without changing its
// handle. Identity therefore lives in the TypeId, not in the node value.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::span::Span;
use crate::type_arena::{TypeId, TypePackId};

/// SmallVec for type children - inline up to 4 (covers most unions,
/// heads, and generic lists)
pub type TypeIdVec = SmallVec<[TypeId; 4]>;

/// Lexical scope depth, used to keep free variables from leaking into
/// scopes that outlive them.
///
/// `a.subsumes(b)` means a variable introduced at `a` is allowed to refer
/// to things at `b`. The minor component only participates in strict
/// subsumption, which drives level promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TypeLevel {
    pub major: u32,
    pub minor: u32,
}

impl TypeLevel {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn subsumes(self, other: TypeLevel) -> bool {
        self.major <= other.major
    }

    pub fn subsumes_strict(self, other: TypeLevel) -> bool {
        self.major < other.major || (self.major == other.major && self.minor < other.minor)
    }

    /// The outer (smaller) of two levels.
    pub fn min(self, other: TypeLevel) -> TypeLevel {
        if self.subsumes(other) { self } else { other }
    }

    /// Enter a child scope.
    pub fn incremented(self) -> TypeLevel {
        TypeLevel::new(self.major + 1, 0)
    }
}

/// Built-in value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Nil,
    Boolean,
    Number,
    String,
    Thread,
}

/// A literal type: `true`, `false`, or a specific string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Singleton {
    Bool(bool),
    Str(String),
}

/// A not-yet-determined type variable. May be bound by unification to
/// anything its level subsumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeType {
    pub level: TypeLevel,
}

/// A quantified type variable. Never refined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericType {
    pub level: TypeLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    pub generics: TypeIdVec,
    pub generic_packs: SmallVec<[TypePackId; 2]>,
    pub args: TypePackId,
    pub ret: TypePackId,
    pub level: TypeLevel,
    /// Where the function was declared, when known. Propagated between
    /// compatible function types so diagnostics can point at a definition.
    pub definition: Option<Span>,
}

impl FunctionType {
    pub fn new(args: TypePackId, ret: TypePackId) -> Self {
        Self {
            generics: TypeIdVec::new(),
            generic_packs: SmallVec::new(),
            args,
            ret,
            level: TypeLevel::default(),
            definition: None,
        }
    }
}

/// Property-set lifecycle of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Shape unknown: may grow new properties and may be bound wholesale
    /// to another table, metatable, or class.
    Free,
    /// May grow new properties, cannot be re-bound.
    Unsealed,
    /// Property set is closed.
    Sealed,
    /// Parametric table shape; treated as closed and never mutated.
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Property {
    pub ty: TypeId,
    pub definition: Option<Span>,
}

impl Property {
    pub fn new(ty: TypeId) -> Self {
        Self {
            ty,
            definition: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableIndexer {
    pub key_ty: TypeId,
    pub value_ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableType {
    pub props: BTreeMap<String, Property>,
    pub indexer: Option<TableIndexer>,
    pub state: TableState,
    /// Set when unification discovers this table is really another type.
    /// `follow` chases it exactly like a Bound node.
    pub bound_to: Option<TypeId>,
    pub level: TypeLevel,
    pub name: Option<String>,
    pub synthetic_name: Option<String>,
}

impl Default for TableState {
    fn default() -> Self {
        TableState::Unsealed
    }
}

impl TableType {
    pub fn new(state: TableState, level: TypeLevel) -> Self {
        Self {
            props: BTreeMap::new(),
            indexer: None,
            state,
            bound_to: None,
            level,
            name: None,
            synthetic_name: None,
        }
    }

    pub fn with_props(
        props: impl IntoIterator<Item = (String, Property)>,
        state: TableState,
        level: TypeLevel,
    ) -> Self {
        let mut table = TableType::new(state, level);
        table.props.extend(props);
        table
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetatableType {
    pub table: TypeId,
    pub metatable: TypeId,
}

/// Nominal class. Classes come from the host embedding; they contain no
/// free variables and are never mutated by unification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassType {
    pub name: String,
    pub parent: Option<TypeId>,
    pub props: BTreeMap<String, Property>,
}

impl ClassType {
    pub fn new(name: impl Into<String>, parent: Option<TypeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            props: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionType {
    pub options: TypeIdVec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionType {
    pub parts: TypeIdVec,
}

/// A type graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeNode {
    Free(FreeType),
    /// Indirection to another handle; follow before inspecting.
    Bound(TypeId),
    Generic(GenericType),
    /// Came from an earlier error; unifies with anything silently.
    Error,
    /// Top type; absorbs anything and floods into free variables.
    Any,
    Primitive(PrimitiveType),
    Singleton(Singleton),
    Function(FunctionType),
    Table(TableType),
    Metatable(MetatableType),
    Class(ClassType),
    Union(UnionType),
    Intersection(IntersectionType),
}

/// An ordered sequence of types with an optional continuation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypeList {
    pub head: TypeIdVec,
    pub tail: Option<TypePackId>,
}

impl TypeList {
    pub fn new(head: impl IntoIterator<Item = TypeId>, tail: Option<TypePackId>) -> Self {
        Self {
            head: head.into_iter().collect(),
            tail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreePack {
    pub level: TypeLevel,
}

/// Zero or more values of one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariadicPack {
    pub ty: TypeId,
}

/// A type pack graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum PackNode {
    Free(FreePack),
    Bound(TypePackId),
    Generic,
    Error,
    List(TypeList),
    Variadic(VariadicPack),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_subsumption() {
        let outer = TypeLevel::new(1, 0);
        let inner = TypeLevel::new(2, 0);
        assert!(outer.subsumes(inner));
        assert!(!inner.subsumes(outer));
        assert!(outer.subsumes(outer));
        assert!(outer.subsumes_strict(inner));
        assert!(!outer.subsumes_strict(outer));
    }

    #[test]
    fn test_level_minor_breaks_strict_ties() {
        let early = TypeLevel::new(3, 1);
        let late = TypeLevel::new(3, 4);
        assert!(early.subsumes(late));
        assert!(early.subsumes_strict(late));
        assert!(!late.subsumes_strict(early));
    }

    #[test]
    fn test_level_min() {
        let a = TypeLevel::new(1, 0);
        let b = TypeLevel::new(2, 5);
        assert_eq!(a.min(b), a);
        assert_eq!(b.min(a), a);
    }
}
