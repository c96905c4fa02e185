// src/lib.rs
//
// Unification core of the Stoat type checker.
//
// Stoat is a gradually-typed scripting language with structural tables,
// union and intersection types, nominal classes with metatables, and
// variadic parameter packs. This crate implements the engine that decides
// whether one type (or type pack) is compatible with another, refining
// free type variables in place as it goes. All mutations are journaled in
// a transactional log so that speculative branches (union option
// selection, dry runs) can be rolled back without polluting the graph.

pub mod errors;
pub mod span;
pub mod txn_log;
pub mod type_arena;
pub mod types;
pub mod unify;
pub mod visit;

pub use errors::{
    CannotExtendKind, CountContext, MissingPropertiesKind, TypeError, UnifyError,
};
pub use span::Span;
pub use txn_log::TxnLog;
pub use type_arena::{
    BuiltinTypes, TypeArena, TypeId, TypePackId, find_table_property_respecting_meta,
    flatten_pack, is_any, is_nil, is_optional, is_string, is_subclass, lookup_class_prop,
    pack_finite, pack_size, type_name,
};
pub use types::{
    ClassType, FreePack, FreeType, FunctionType, GenericType, IntersectionType, MetatableType,
    PackNode, PrimitiveType, Property, Singleton, TableIndexer, TableState, TableType, TypeIdVec,
    TypeLevel, TypeList, TypeNode, UnionType, VariadicPack,
};
pub use unify::{
    IceHandler, Mode, UnifierSharedState, Unifier, UnifyConfig, UnifyCounters, Variance,
};
