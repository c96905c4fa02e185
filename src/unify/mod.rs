// src/unify/mod.rs
//
// The unification engine.
//
// `Unifier::try_unify(super_ty, sub_ty)` decides whether `sub_ty` is
// compatible with `super_ty`, refining free type variables in place and
// journaling every mutation. Speculative branches (union options, dry
// runs) run in a child unifier that shares the arena, cache, counters,
// and seen stack, but owns its log and error vector; the parent adopts
// a successful child with `log.concat` and discards a failed one with
// `rollback`.

pub mod any;
pub mod cache;
pub mod occurs;
pub mod packs;
pub mod tables;


use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::{CountContext, TypeError, UnifyError};
use crate::span::Span;
use crate::txn_log::TxnLog;
use crate::type_arena::{
    TypeArena, TypeId, TypePackId, is_nil, is_subclass, lookup_class_prop, pack_finite, pack_size,
    type_name,
};
use crate::types::{PackNode, Singleton, TableState, TypeLevel, TypeNode};
use crate::visit::{self, TypeVisitor};

/// Direction of the subtype relation being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variance {
    /// `sub` must be usable where `super` is expected.
    Covariant,
    /// The two types must be interchangeable.
    Invariant,
}

/// Checking mode of the surrounding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Strict,
    Nonstrict,
    NoCheck,
}

/// Tunables for a checking session. The booleans gate migrations that are
/// still settling; the limits bound runaway inference.
#[derive(Debug, Clone)]
pub struct UnifyConfig {
    /// Maximum recursion depth; 0 disables the guard.
    pub recursion_limit: usize,
    /// Maximum unification steps per top-level call; 0 disables the guard.
    pub iteration_limit: usize,
    /// Maximum pack-growth loop turns before treating growth as runaway;
    /// 0 disables the guard.
    pub pack_loop_limit: usize,
    /// Use the variance-aware table rules. When off, sealed tables go
    /// through the legacy deep comparison instead.
    pub table_subtyping_variance: bool,
    /// Skip function interiors in the occurs check so that recursive
    /// function types stay representable.
    pub recursive_function_types: bool,
}

impl Default for UnifyConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 0,
            iteration_limit: 2000,
            pack_loop_limit: 0,
            table_subtyping_variance: true,
            recursive_function_types: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnifyCounters {
    pub iteration_count: usize,
    pub recursion_count: usize,
}

/// Invoked on internal invariant violations. These are bugs in the
/// checker, not diagnostics; the handler must not return.
pub type IceHandler = Box<dyn Fn(&str, Span)>;

/// State shared across every unifier of one checking session, including
/// speculative children.
pub struct UnifierSharedState {
    pub counters: UnifyCounters,
    /// Pairs proven compatible. See `cache.rs` for what may be inserted.
    pub cached_unify: FxHashSet<(TypeId, TypeId)>,
    /// Memoized "this type can never be cached" results.
    pub skip_cache_for_type: FxHashMap<TypeId, bool>,
    pub config: UnifyConfig,
    /// Pairs currently being proven, for co-inductive cycle handling.
    /// Shared between a parent and its speculative children so cycle
    /// detection spans branches.
    seen: Vec<(TypeId, TypeId)>,
    scratch_types: FxHashSet<TypeId>,
    scratch_packs: FxHashSet<TypePackId>,
    ice_handler: IceHandler,
}

impl UnifierSharedState {
    pub fn new(config: UnifyConfig) -> Self {
        Self::with_ice_handler(
            config,
            Box::new(|message, span| {
                panic!(
                    "internal checker error at {}:{}: {message}",
                    span.line, span.column
                )
            }),
        )
    }

    pub fn with_ice_handler(config: UnifyConfig, ice_handler: IceHandler) -> Self {
        Self {
            counters: UnifyCounters::default(),
            cached_unify: FxHashSet::default(),
            skip_cache_for_type: FxHashMap::default(),
            config,
            seen: Vec::new(),
            scratch_types: FxHashSet::default(),
            scratch_packs: FxHashSet::default(),
            ice_handler,
        }
    }

    /// Seen pairs are unordered: contravariant positions look the same
    /// pair up with the sides swapped.
    fn seen_pair(a: TypeId, b: TypeId) -> (TypeId, TypeId) {
        if a.index() > b.index() { (a, b) } else { (b, a) }
    }

    fn have_seen(&self, a: TypeId, b: TypeId) -> bool {
        let pair = Self::seen_pair(a, b);
        self.seen.iter().any(|&p| p == pair)
    }

    fn push_seen(&mut self, a: TypeId, b: TypeId) {
        self.seen.push(Self::seen_pair(a, b));
    }

    fn pop_seen(&mut self, a: TypeId, b: TypeId) {
        let top = self.seen.pop();
        debug_assert_eq!(top, Some(Self::seen_pair(a, b)));
    }
}

impl Default for UnifierSharedState {
    fn default() -> Self {
        Self::new(UnifyConfig::default())
    }
}

pub struct Unifier<'a> {
    pub(crate) arena: &'a mut TypeArena,
    pub(crate) state: &'a mut UnifierSharedState,
    pub mode: Mode,
    pub variance: Variance,
    /// Location errors are attributed to.
    pub span: Span,
    /// Which sequence a pack count mismatch should be reported against.
    pub ctx: CountContext,
    pub(crate) first_pack_error_pos: Option<usize>,
    pub log: TxnLog,
    pub errors: Vec<TypeError>,
}

impl<'a> Unifier<'a> {
    pub fn new(
        arena: &'a mut TypeArena,
        state: &'a mut UnifierSharedState,
        mode: Mode,
        span: Span,
        variance: Variance,
    ) -> Self {
        Self {
            arena,
            state,
            mode,
            variance,
            span,
            ctx: CountContext::Arg,
            first_pack_error_pos: None,
            log: TxnLog::new(),
            errors: Vec::new(),
        }
    }

    /// A speculative child: same arena, cache, counters, and seen stack;
    /// fresh log and errors.
    pub(crate) fn child(&mut self) -> Unifier<'_> {
        Unifier {
            arena: &mut *self.arena,
            state: &mut *self.state,
            mode: self.mode,
            variance: self.variance,
            span: self.span,
            ctx: self.ctx,
            first_pack_error_pos: None,
            log: TxnLog::new(),
            errors: Vec::new(),
        }
    }

    pub fn arena(&self) -> &TypeArena {
        self.arena
    }

    /// Roll back this unifier's own log, restoring the graph.
    pub fn rollback(&mut self) {
        let mut log = std::mem::take(&mut self.log);
        log.rollback(self.arena);
    }

    pub fn try_unify(&mut self, super_ty: TypeId, sub_ty: TypeId) {
        self.try_unify_opts(super_ty, sub_ty, false, false);
    }

    pub fn try_unify_opts(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        is_function_call: bool,
        is_intersection: bool,
    ) {
        tracing::trace!(?super_ty, ?sub_ty, variance = ?self.variance, "try_unify");
        self.state.counters.iteration_count = 0;
        self.try_unify_inner(super_ty, sub_ty, is_function_call, is_intersection);
    }

    pub fn try_unify_packs(&mut self, super_tp: TypePackId, sub_tp: TypePackId) {
        self.try_unify_packs_opts(super_tp, sub_tp, false);
    }

    pub fn try_unify_packs_opts(
        &mut self,
        super_tp: TypePackId,
        sub_tp: TypePackId,
        is_function_call: bool,
    ) {
        self.state.counters.iteration_count = 0;
        self.try_unify_packs_inner(super_tp, sub_tp, is_function_call);
    }

    /// Dry run: report what unification would say without keeping any of
    /// its mutations.
    pub fn can_unify(&mut self, super_ty: TypeId, sub_ty: TypeId) -> Vec<TypeError> {
        let mut inner = self.child();
        inner.try_unify_inner(super_ty, sub_ty, false, false);
        let mut log = inner.log;
        let errors = inner.errors;
        log.rollback(self.arena);
        errors
    }

    pub fn can_unify_packs(
        &mut self,
        super_tp: TypePackId,
        sub_tp: TypePackId,
        is_function_call: bool,
    ) -> Vec<TypeError> {
        let mut inner = self.child();
        inner.try_unify_packs_inner(super_tp, sub_tp, is_function_call);
        let mut log = inner.log;
        let errors = inner.errors;
        log.rollback(self.arena);
        errors
    }

    pub(crate) fn is_nonstrict(&self) -> bool {
        matches!(self.mode, Mode::Nonstrict | Mode::NoCheck)
    }

    pub(crate) fn ice(&self, message: &str) -> ! {
        tracing::error!(message, "internal checker error");
        (self.state.ice_handler)(message, self.span);
        unreachable!("ice handler returned");
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    fn enter_recursion(&mut self) -> bool {
        self.state.counters.recursion_count += 1;
        let limit = self.state.config.recursion_limit;
        if limit > 0 && self.state.counters.recursion_count > limit {
            self.state.counters.recursion_count -= 1;
            self.errors
                .push(TypeError::new(UnifyError::UnificationTooComplex, self.span));
            return false;
        }
        true
    }

    fn leave_recursion(&mut self) {
        self.state.counters.recursion_count -= 1;
    }

    fn iteration_limit_exceeded(&mut self) -> bool {
        self.state.counters.iteration_count += 1;
        let limit = self.state.config.iteration_limit;
        if limit > 0 && self.state.counters.iteration_count > limit {
            self.errors
                .push(TypeError::new(UnifyError::UnificationTooComplex, self.span));
            return true;
        }
        false
    }

    // -----------------------------------------------------------------------
    // Type unification
    // -----------------------------------------------------------------------

    pub(crate) fn try_unify_inner(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        is_function_call: bool,
        is_intersection: bool,
    ) {
        if !self.enter_recursion() {
            return;
        }
        self.try_unify_step(super_ty, sub_ty, is_function_call, is_intersection);
        self.leave_recursion();
    }

    fn try_unify_step(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        is_function_call: bool,
        is_intersection: bool,
    ) {
        if self.iteration_limit_exceeded() {
            return;
        }

        let super_ty = self.arena.follow(super_ty);
        let sub_ty = self.arena.follow(sub_ty);

        if super_ty == sub_ty {
            return;
        }

        let super_free = match self.arena.get(super_ty) {
            TypeNode::Free(free) => Some(*free),
            _ => None,
        };
        let sub_free = match self.arena.get(sub_ty) {
            TypeNode::Free(free) => Some(*free),
            _ => None,
        };

        match (super_free, sub_free) {
            (Some(l), Some(r)) if l.level.subsumes(r.level) => {
                self.occurs_check_type(sub_ty, super_ty);

                // The occurs check may have turned the sub side into an
                // error-recovery node.
                if !matches!(self.arena.get(sub_ty), TypeNode::Error) {
                    self.log.log_type(self.arena, sub_ty);
                    *self.arena.get_mut(sub_ty) = TypeNode::Bound(super_ty);
                }
                return;
            }
            (Some(l), Some(r)) => {
                self.occurs_check_type(super_ty, sub_ty);

                let lowered = r.level.min(l.level);
                if lowered != r.level
                    && let TypeNode::Free(_) = self.arena.get(sub_ty)
                {
                    self.log.log_type(self.arena, sub_ty);
                    if let TypeNode::Free(free) = self.arena.get_mut(sub_ty) {
                        free.level = lowered;
                    }
                }

                if !matches!(self.arena.get(super_ty), TypeNode::Error) {
                    self.log.log_type(self.arena, super_ty);
                    *self.arena.get_mut(super_ty) = TypeNode::Bound(sub_ty);
                }
                return;
            }
            (Some(l), None) => {
                self.occurs_check_type(super_ty, sub_ty);

                let super_level = l.level;

                // Unification can't change the level of a generic.
                if let TypeNode::Generic(generic) = self.arena.get(sub_ty)
                    && !generic.level.subsumes(super_level)
                {
                    self.errors.push(TypeError::new(
                        UnifyError::GenericError {
                            message: "generic subtype escaping scope".to_string(),
                        },
                        self.span,
                    ));
                    return;
                }

                if !matches!(self.arena.get(super_ty), TypeNode::Error) {
                    self.promote_type_levels(super_level, sub_ty);
                    self.log.log_type(self.arena, super_ty);
                    *self.arena.get_mut(super_ty) = TypeNode::Bound(sub_ty);
                }
                return;
            }
            (None, Some(r)) => {
                let sub_level = r.level;

                self.occurs_check_type(sub_ty, super_ty);

                if let TypeNode::Generic(generic) = self.arena.get(super_ty)
                    && !generic.level.subsumes(sub_level)
                {
                    self.errors.push(TypeError::new(
                        UnifyError::GenericError {
                            message: "generic supertype escaping scope".to_string(),
                        },
                        self.span,
                    ));
                    return;
                }

                if !matches!(self.arena.get(sub_ty), TypeNode::Error) {
                    self.promote_type_levels(sub_level, super_ty);

                    if let Some(level) = self.level_of(super_ty)
                        && !level.subsumes(sub_level)
                    {
                        self.log.log_type(self.arena, super_ty);
                        self.set_level(super_ty, sub_level);
                    }

                    self.log.log_type(self.arena, sub_ty);
                    *self.arena.get_mut(sub_ty) = TypeNode::Bound(super_ty);
                }
                return;
            }
            (None, None) => {}
        }

        if matches!(self.arena.get(super_ty), TypeNode::Error | TypeNode::Any) {
            return self.try_unify_with_any_type(super_ty, sub_ty);
        }
        if matches!(self.arena.get(sub_ty), TypeNode::Error | TypeNode::Any) {
            return self.try_unify_with_any_type(sub_ty, super_ty);
        }

        let cache_enabled = !is_function_call && !is_intersection;

        // The types may be immutable and their relation proven before.
        if cache_enabled
            && self.state.cached_unify.contains(&(super_ty, sub_ty))
            && (self.variance == Variance::Covariant
                || self.state.cached_unify.contains(&(sub_ty, super_ty)))
        {
            return;
        }

        // If we have seen this pair before, we are recursing into cyclic
        // types. Assume they unify; if they do not, the outer frame fails
        // and rolls the speculation back.
        if self.state.have_seen(super_ty, sub_ty) {
            return;
        }

        self.state.push_seen(super_ty, sub_ty);
        self.dispatch_structural(super_ty, sub_ty, is_function_call, is_intersection, cache_enabled);
        self.state.pop_seen(super_ty, sub_ty);
    }

    fn dispatch_structural(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        is_function_call: bool,
        is_intersection: bool,
        cache_enabled: bool,
    ) {
        enum Rule {
            UnionSub(Vec<TypeId>),
            UnionSuper(Vec<TypeId>),
            IntersectionSuper(Vec<TypeId>),
            IntersectionSub(Vec<TypeId>),
            Primitives,
            Singletons,
            Functions,
            Tables,
            MetatableSuper,
            MetatableSub,
            ClassSuper,
            ClassSub,
            Mismatch,
        }

        use TypeNode as T;
        let rule = match (self.arena.get(super_ty), self.arena.get(sub_ty)) {
            (_, T::Union(union)) => Rule::UnionSub(union.options.to_vec()),
            (T::Union(union), _) => Rule::UnionSuper(union.options.to_vec()),
            (T::Intersection(intersection), _) => {
                Rule::IntersectionSuper(intersection.parts.to_vec())
            }
            (_, T::Intersection(intersection)) => {
                Rule::IntersectionSub(intersection.parts.to_vec())
            }
            (T::Primitive(_), T::Primitive(_)) => Rule::Primitives,
            (T::Primitive(_) | T::Singleton(_), T::Singleton(_)) => Rule::Singletons,
            (T::Function(_), T::Function(_)) => Rule::Functions,
            (T::Table(_), T::Table(_)) => Rule::Tables,
            (T::Metatable(_), _) => Rule::MetatableSuper,
            (_, T::Metatable(_)) => Rule::MetatableSub,
            (T::Class(_), _) => Rule::ClassSuper,
            (_, T::Class(_)) => Rule::ClassSub,
            _ => Rule::Mismatch,
        };

        match rule {
            Rule::UnionSub(options) => {
                self.try_unify_union_subtype(super_ty, sub_ty, &options);
            }
            Rule::UnionSuper(options) => {
                self.try_unify_union_supertype(
                    super_ty,
                    sub_ty,
                    &options,
                    is_function_call,
                    cache_enabled,
                );
            }
            Rule::IntersectionSuper(parts) => {
                self.try_unify_intersection_supertype(super_ty, sub_ty, &parts);
            }
            Rule::IntersectionSub(parts) => {
                self.try_unify_intersection_subtype(
                    super_ty,
                    sub_ty,
                    &parts,
                    is_function_call,
                    cache_enabled,
                );
            }
            Rule::Primitives => self.try_unify_primitives(super_ty, sub_ty),
            Rule::Singletons => self.try_unify_singletons(super_ty, sub_ty),
            Rule::Functions => self.try_unify_functions(super_ty, sub_ty, is_function_call),
            Rule::Tables => {
                self.try_unify_tables(super_ty, sub_ty, is_intersection);

                if cache_enabled && self.errors.is_empty() {
                    self.cache_result(super_ty, sub_ty);
                }
            }
            Rule::MetatableSuper => self.try_unify_with_metatable(super_ty, sub_ty, false),
            Rule::MetatableSub => self.try_unify_with_metatable(sub_ty, super_ty, true),
            Rule::ClassSuper => self.try_unify_with_class(super_ty, sub_ty, false),
            // Unification of non-classes with classes is almost, but not
            // quite, symmetrical. The test order matters when both sides
            // are classes.
            Rule::ClassSub => self.try_unify_with_class(super_ty, sub_ty, true),
            Rule::Mismatch => {
                self.errors.push(TypeError::new(
                    UnifyError::TypeMismatch {
                        wanted: super_ty,
                        given: sub_ty,
                        reason: None,
                        cause: None,
                    },
                    self.span,
                ));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Unions and intersections
    // -----------------------------------------------------------------------

    /// `A | B <: T` requires every option to fit `T`.
    fn try_unify_union_subtype(&mut self, super_ty: TypeId, sub_ty: TypeId, options: &[TypeId]) {
        let mut failed = false;
        let mut too_complex: Option<TypeError> = None;
        let mut first_failed_option: Option<TypeError> = None;

        let count = options.len();
        for (i, &option) in options.iter().enumerate() {
            let mut inner = self.child();
            inner.try_unify_inner(super_ty, option, false, false);
            let mut child_log = inner.log;
            let child_errors = inner.errors;

            if let Some(e) = has_too_complex(&child_errors) {
                too_complex = Some(e);
            } else if !child_errors.is_empty() {
                // Nil options are skipped in the report: the renderer
                // shows `T?` specially.
                if first_failed_option.is_none() && !is_nil(self.arena, option) {
                    first_failed_option = Some(child_errors[0].clone());
                }
                failed = true;
            }

            // Earlier options' bindings may contradict later ones, so only
            // the last option's log survives.
            if i != count - 1 {
                child_log.rollback(self.arena);
            } else {
                self.log.concat(child_log);
            }
        }

        if let Some(e) = too_complex {
            self.errors.push(e);
        } else if failed {
            let (reason, cause) = match first_failed_option {
                Some(inner) => (
                    Some("not all union options are compatible".to_string()),
                    Some(Box::new(inner)),
                ),
                None => (None, None),
            };
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason,
                    cause,
                },
                self.span,
            ));
        }
    }

    /// `T <: A | B` succeeds if some option accepts `T`. Option order is
    /// chosen heuristically for stability and error quality.
    fn try_unify_union_supertype(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        options: &[TypeId],
        is_function_call: bool,
        cache_enabled: bool,
    ) {
        let mut found = false;
        let mut too_complex: Option<TypeError> = None;
        let mut failed_option_count = 0usize;
        let mut failed_option: Option<TypeError> = None;

        let mut found_heuristic = false;
        let mut start_index = 0usize;

        // 1. A bound name shared with some option.
        if let Some(sub_name) = type_name(self.arena, sub_ty).map(str::to_owned) {
            for (i, &option) in options.iter().enumerate() {
                if type_name(self.arena, option) == Some(sub_name.as_str()) {
                    found_heuristic = true;
                    start_index = i;
                    break;
                }
            }
        }

        // 2. A tag field with a matching singleton value.
        if !found_heuristic
            && let Some((tag, value)) = table_match_tag(self.arena, sub_ty)
        {
            for (i, &option) in options.iter().enumerate() {
                if let Some((option_tag, option_value)) = table_match_tag(self.arena, option)
                    && option_tag == tag
                    && option_value == value
                {
                    found_heuristic = true;
                    start_index = i;
                    break;
                }
            }
        }

        // 3. An option the cache already proves.
        if !found_heuristic && cache_enabled {
            for (i, &option) in options.iter().enumerate() {
                if self.state.cached_unify.contains(&(option, sub_ty))
                    && (self.variance == Variance::Covariant
                        || self.state.cached_unify.contains(&(sub_ty, option)))
                {
                    start_index = i;
                    break;
                }
            }
        }

        let count = options.len();
        for i in 0..count {
            let option = options[(i + start_index) % count];

            let mut inner = self.child();
            inner.try_unify_inner(option, sub_ty, is_function_call, false);
            let mut child_log = inner.log;
            let child_errors = inner.errors;

            if child_errors.is_empty() {
                found = true;
                self.log.concat(child_log);
                break;
            }

            if let Some(e) = has_too_complex(&child_errors) {
                too_complex = Some(e);
            } else if !is_nil(self.arena, option) {
                failed_option_count += 1;
                if failed_option.is_none() {
                    failed_option = Some(child_errors[0].clone());
                }
            }

            tracing::trace!(?option, "union option rejected");
            child_log.rollback(self.arena);
        }

        if let Some(e) = too_complex {
            self.errors.push(e);
        } else if !found {
            let attach_example = failed_option_count == 1 || found_heuristic;
            let (reason, cause) = match failed_option {
                Some(inner) if attach_example => (
                    "none of the union options are compatible; for example:".to_string(),
                    Some(Box::new(inner)),
                ),
                _ => ("none of the union options are compatible".to_string(), None),
            };
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason: Some(reason),
                    cause,
                },
                self.span,
            ));
        }
    }

    /// `T <: A & B` requires every part to accept `T`.
    fn try_unify_intersection_supertype(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        parts: &[TypeId],
    ) {
        let mut too_complex: Option<TypeError> = None;
        let mut first_failed_part: Option<TypeError> = None;

        for &part in parts {
            let mut inner = self.child();
            inner.try_unify_inner(part, sub_ty, false, true);
            let child_log = inner.log;
            let child_errors = inner.errors;

            if let Some(e) = has_too_complex(&child_errors) {
                too_complex = Some(e);
            } else if !child_errors.is_empty() && first_failed_part.is_none() {
                first_failed_part = Some(child_errors[0].clone());
            }

            self.log.concat(child_log);
        }

        if let Some(e) = too_complex {
            self.errors.push(e);
        } else if let Some(inner) = first_failed_part {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason: Some("not all intersection parts are compatible".to_string()),
                    cause: Some(Box::new(inner)),
                },
                self.span,
            ));
        }
    }

    /// `A & B <: T` succeeds if some part already fits `T`.
    fn try_unify_intersection_subtype(
        &mut self,
        super_ty: TypeId,
        sub_ty: TypeId,
        parts: &[TypeId],
        is_function_call: bool,
        cache_enabled: bool,
    ) {
        let mut found = false;
        let mut too_complex: Option<TypeError> = None;

        let mut start_index = 0usize;
        if cache_enabled {
            for (i, &part) in parts.iter().enumerate() {
                if self.state.cached_unify.contains(&(super_ty, part))
                    && (self.variance == Variance::Covariant
                        || self.state.cached_unify.contains(&(part, super_ty)))
                {
                    start_index = i;
                    break;
                }
            }
        }

        let count = parts.len();
        for i in 0..count {
            let part = parts[(i + start_index) % count];

            let mut inner = self.child();
            inner.try_unify_inner(super_ty, part, is_function_call, false);
            let mut child_log = inner.log;
            let child_errors = inner.errors;

            if child_errors.is_empty() {
                found = true;
                self.log.concat(child_log);
                break;
            }

            if let Some(e) = has_too_complex(&child_errors) {
                too_complex = Some(e);
            }

            child_log.rollback(self.arena);
        }

        if let Some(e) = too_complex {
            self.errors.push(e);
        } else if !found {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason: Some("none of the intersection parts are compatible".to_string()),
                    cause: None,
                },
                self.span,
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Primitives and singletons
    // -----------------------------------------------------------------------

    fn try_unify_primitives(&mut self, super_ty: TypeId, sub_ty: TypeId) {
        let (lp, rp) = match (self.arena.get(super_ty), self.arena.get(sub_ty)) {
            (TypeNode::Primitive(lp), TypeNode::Primitive(rp)) => (*lp, *rp),
            _ => self.ice("non-primitive types passed to try_unify_primitives"),
        };

        if lp != rp {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason: None,
                    cause: None,
                },
                self.span,
            ));
        }
    }

    fn try_unify_singletons(&mut self, super_ty: TypeId, sub_ty: TypeId) {
        use crate::types::PrimitiveType;

        let sub_singleton = match self.arena.get(sub_ty) {
            TypeNode::Singleton(s) => s.clone(),
            _ => self.ice("non-singleton subtype passed to try_unify_singletons"),
        };

        match self.arena.get(super_ty) {
            TypeNode::Singleton(s) if *s == sub_singleton => return,
            TypeNode::Primitive(PrimitiveType::Boolean)
                if matches!(sub_singleton, Singleton::Bool(_))
                    && self.variance == Variance::Covariant =>
            {
                return;
            }
            TypeNode::Primitive(PrimitiveType::String)
                if matches!(sub_singleton, Singleton::Str(_))
                    && self.variance == Variance::Covariant =>
            {
                return;
            }
            TypeNode::Singleton(_) | TypeNode::Primitive(_) => {}
            _ => self.ice("non-singleton/primitive supertype passed to try_unify_singletons"),
        }

        self.errors.push(TypeError::new(
            UnifyError::TypeMismatch {
                wanted: super_ty,
                given: sub_ty,
                reason: None,
                cause: None,
            },
            self.span,
        ));
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn try_unify_functions(&mut self, super_ty: TypeId, sub_ty: TypeId, is_function_call: bool) {
        let (lf, rf) = match (self.arena.get(super_ty), self.arena.get(sub_ty)) {
            (TypeNode::Function(lf), TypeNode::Function(rf)) => (lf.clone(), rf.clone()),
            _ => self.ice("non-function types passed to try_unify_functions"),
        };

        let mut num_generics = lf.generics.len();
        if num_generics != rf.generics.len() {
            num_generics = num_generics.min(rf.generics.len());

            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason: Some("different number of generic type parameters".to_string()),
                    cause: None,
                },
                self.span,
            ));
        }

        if lf.generic_packs.len() != rf.generic_packs.len() {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: super_ty,
                    given: sub_ty,
                    reason: Some("different number of generic type pack parameters".to_string()),
                    cause: None,
                },
                self.span,
            ));
        }

        // Paired generics compare equal by handle for the duration.
        for i in 0..num_generics {
            self.state.push_seen(lf.generics[i], rf.generics[i]);
        }

        let saved_ctx = self.ctx;

        if !is_function_call {
            let (child_log, arg_errors, arg_pos, ret_errors, ret_pos) = {
                let mut inner = self.child();

                // Arguments are contravariant: the subtype must accept
                // everything the supertype's caller may pass.
                inner.ctx = CountContext::Arg;
                inner.try_unify_packs_inner(rf.args, lf.args, is_function_call);
                let arg_errors = std::mem::take(&mut inner.errors);
                let arg_pos = inner.first_pack_error_pos.take();

                // Returns are covariant.
                inner.ctx = CountContext::Result;
                inner.try_unify_packs_inner(lf.ret, rf.ret, false);

                (
                    inner.log,
                    arg_errors,
                    arg_pos,
                    inner.errors,
                    inner.first_pack_error_pos,
                )
            };

            let reported = !arg_errors.is_empty();

            if let Some(e) = has_too_complex(&arg_errors) {
                self.errors.push(e);
            } else if !arg_errors.is_empty() && arg_pos.is_some() {
                let pos = arg_pos.unwrap_or_default();
                self.errors.push(TypeError::new(
                    UnifyError::TypeMismatch {
                        wanted: super_ty,
                        given: sub_ty,
                        reason: Some(format!("argument #{pos} is not compatible")),
                        cause: Some(Box::new(arg_errors[0].clone())),
                    },
                    self.span,
                ));
            } else if !arg_errors.is_empty() {
                self.errors.push(TypeError::new(
                    UnifyError::TypeMismatch {
                        wanted: super_ty,
                        given: sub_ty,
                        reason: None,
                        cause: Some(Box::new(arg_errors[0].clone())),
                    },
                    self.span,
                ));
            }

            if !reported {
                if let Some(e) = has_too_complex(&ret_errors) {
                    self.errors.push(e);
                } else if !ret_errors.is_empty()
                    && pack_size(self.arena, lf.ret) == 1
                    && pack_finite(self.arena, lf.ret)
                {
                    self.errors.push(TypeError::new(
                        UnifyError::TypeMismatch {
                            wanted: super_ty,
                            given: sub_ty,
                            reason: Some("return type is not compatible".to_string()),
                            cause: Some(Box::new(ret_errors[0].clone())),
                        },
                        self.span,
                    ));
                } else if !ret_errors.is_empty() && ret_pos.is_some() {
                    let pos = ret_pos.unwrap_or_default();
                    self.errors.push(TypeError::new(
                        UnifyError::TypeMismatch {
                            wanted: super_ty,
                            given: sub_ty,
                            reason: Some(format!("return #{pos} is not compatible")),
                            cause: Some(Box::new(ret_errors[0].clone())),
                        },
                        self.span,
                    ));
                } else if !ret_errors.is_empty() {
                    self.errors.push(TypeError::new(
                        UnifyError::TypeMismatch {
                            wanted: super_ty,
                            given: sub_ty,
                            reason: None,
                            cause: Some(Box::new(ret_errors[0].clone())),
                        },
                        self.span,
                    ));
                }
            }

            self.log.concat(child_log);
        } else {
            self.ctx = CountContext::Arg;
            self.try_unify_packs_inner(rf.args, lf.args, is_function_call);

            self.ctx = CountContext::Result;
            self.try_unify_packs_inner(lf.ret, rf.ret, false);
        }

        // Share definition locations between compatible functions so later
        // diagnostics can point somewhere useful.
        if lf.definition.is_some() && rf.definition.is_none() && !self.arena.is_persistent(sub_ty) {
            self.log.log_type(self.arena, sub_ty);
            if let TypeNode::Function(function) = self.arena.get_mut(sub_ty) {
                function.definition = lf.definition;
            }
        } else if lf.definition.is_none()
            && rf.definition.is_some()
            && !self.arena.is_persistent(super_ty)
        {
            self.log.log_type(self.arena, super_ty);
            if let TypeNode::Function(function) = self.arena.get_mut(super_ty) {
                function.definition = rf.definition;
            }
        }

        self.ctx = saved_ctx;

        for i in (0..num_generics).rev() {
            self.state.pop_seen(lf.generics[i], rf.generics[i]);
        }
    }

    // -----------------------------------------------------------------------
    // Metatables and classes
    // -----------------------------------------------------------------------

    /// The first argument must be the metatable side; `reversed` records
    /// which side it actually was for error attribution.
    fn try_unify_with_metatable(&mut self, metatable_ty: TypeId, other: TypeId, reversed: bool) {
        let mt = match self.arena.get(metatable_ty) {
            TypeNode::Metatable(mt) => *mt,
            _ => self.ice("non-metatable type passed to try_unify_with_metatable"),
        };

        let (wanted, given) = if reversed {
            (other, metatable_ty)
        } else {
            (metatable_ty, other)
        };

        enum OtherKind {
            Metatable(crate::types::MetatableType),
            Table(TableState),
            Absorbed,
            Mismatch,
        }

        let kind = match self.arena.get(other) {
            TypeNode::Metatable(rhs) => OtherKind::Metatable(*rhs),
            TypeNode::Table(table) => OtherKind::Table(table.state),
            TypeNode::Any | TypeNode::Error => OtherKind::Absorbed,
            _ => OtherKind::Mismatch,
        };

        match kind {
            OtherKind::Metatable(rhs) => {
                let mut inner = self.child();
                inner.try_unify_inner(mt.table, rhs.table, false, false);
                inner.try_unify_inner(mt.metatable, rhs.metatable, false, false);
                let child_log = inner.log;
                let child_errors = inner.errors;

                if let Some(e) = has_too_complex(&child_errors) {
                    self.errors.push(e);
                } else if !child_errors.is_empty() {
                    self.errors.push(TypeError::new(
                        UnifyError::TypeMismatch {
                            wanted,
                            given,
                            reason: None,
                            cause: Some(Box::new(child_errors[0].clone())),
                        },
                        self.span,
                    ));
                }

                self.log.concat(child_log);
            }
            OtherKind::Table(TableState::Free) => {
                // A free table may still turn out to carry a metatable.
                self.try_unify_inner(mt.table, other, false, false);

                self.log.log_type(self.arena, other);
                if let TypeNode::Table(table) = self.arena.get_mut(other) {
                    table.bound_to = Some(metatable_ty);
                }
            }
            // The shape of sealed, unsealed, and generic tables is known;
            // a metatable cannot be attached to them after the fact.
            OtherKind::Table(_) | OtherKind::Mismatch => {
                self.errors.push(TypeError::new(
                    UnifyError::TypeMismatch {
                        wanted,
                        given,
                        reason: None,
                        cause: None,
                    },
                    self.span,
                ));
            }
            OtherKind::Absorbed => {}
        }
    }

    /// Class unification is almost, but not quite, symmetrical; `reversed`
    /// records which scenario we are in.
    fn try_unify_with_class(&mut self, super_ty: TypeId, sub_ty: TypeId, reversed: bool) {
        let (wanted, given) = (super_ty, sub_ty);
        let (super_ty, sub_ty) = if reversed {
            (sub_ty, super_ty)
        } else {
            (super_ty, sub_ty)
        };

        let class_name = match self.arena.get(super_ty) {
            TypeNode::Class(class) => class.name.clone(),
            _ => self.ice("non-class type passed to try_unify_with_class"),
        };

        enum SubKind {
            Class,
            FreeTable(Vec<(String, crate::types::Property)>, bool),
            OtherTable,
            Mismatch,
        }

        let kind = match self.arena.get(sub_ty) {
            TypeNode::Class(_) => SubKind::Class,
            TypeNode::Table(table) if table.state == TableState::Free => SubKind::FreeTable(
                table
                    .props
                    .iter()
                    .map(|(name, prop)| (name.clone(), *prop))
                    .collect(),
                table.indexer.is_some(),
            ),
            TypeNode::Table(_) => SubKind::OtherTable,
            _ => SubKind::Mismatch,
        };

        match kind {
            SubKind::Class => {
                let compatible = match self.variance {
                    Variance::Covariant => is_subclass(self.arena, sub_ty, super_ty),
                    Variance::Invariant => sub_ty == super_ty,
                };
                if !compatible {
                    self.errors.push(TypeError::new(
                        UnifyError::TypeMismatch {
                            wanted,
                            given,
                            reason: None,
                            cause: None,
                        },
                        self.span,
                    ));
                }
            }
            SubKind::FreeTable(props, has_indexer) => {
                // A free table's shape is still unknown, so it may turn out
                // to be this class. Every property it already has must
                // exist on the class and unify with the class's type.
                let mut ok = true;

                for (name, prop) in props {
                    match lookup_class_prop(self.arena, super_ty, &name) {
                        None => {
                            ok = false;
                            self.errors.push(TypeError::new(
                                UnifyError::UnknownProperty {
                                    ty: super_ty,
                                    name: name.clone(),
                                },
                                self.span,
                            ));
                        }
                        Some(class_prop) => {
                            let mut inner = self.child();
                            inner.variance = Variance::Invariant;
                            inner.try_unify_inner(prop.ty, class_prop.ty, false, false);
                            let mut child_log = inner.log;
                            let child_errors = inner.errors;

                            self.check_child_mismatch_prop(&child_errors, &name, wanted, given);

                            if child_errors.is_empty() {
                                self.log.concat(child_log);
                            } else {
                                ok = false;
                                child_log.rollback(self.arena);
                            }
                        }
                    }
                }

                if has_indexer {
                    ok = false;
                    self.errors.push(TypeError::new(
                        UnifyError::GenericError {
                            message: format!("class '{class_name}' does not have an indexer"),
                        },
                        self.span,
                    ));
                }

                if !ok {
                    return;
                }

                self.log.log_type(self.arena, sub_ty);
                if let TypeNode::Table(table) = self.arena.get_mut(sub_ty) {
                    table.bound_to = Some(super_ty);
                }
            }
            SubKind::OtherTable | SubKind::Mismatch => {
                self.errors.push(TypeError::new(
                    UnifyError::TypeMismatch {
                        wanted,
                        given,
                        reason: None,
                        cause: None,
                    },
                    self.span,
                ));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    /// Lower the level of everything reachable from `ty` that sits deeper
    /// than `min_level`. Performed when a free variable at `min_level` is
    /// about to be bound to `ty`, so nothing inside `ty` outlives its new
    /// home scope.
    pub(crate) fn promote_type_levels(&mut self, min_level: TypeLevel, ty: TypeId) {
        enum Target {
            Type(TypeId),
            Pack(TypePackId),
        }

        struct Scan {
            min_level: TypeLevel,
            targets: Vec<Target>,
        }

        impl TypeVisitor for Scan {
            fn visit_type(&mut self, arena: &TypeArena, id: TypeId) -> bool {
                let level = match arena.get(id) {
                    TypeNode::Free(free) => Some(free.level),
                    TypeNode::Function(function) => Some(function.level),
                    TypeNode::Table(table) => Some(table.level),
                    _ => None,
                };
                if let Some(level) = level
                    && self.min_level.subsumes_strict(level)
                {
                    self.targets.push(Target::Type(id));
                }
                true
            }

            fn visit_pack(&mut self, arena: &TypeArena, id: TypePackId) -> bool {
                if let PackNode::Free(free) = arena.get_pack(id)
                    && self.min_level.subsumes_strict(free.level)
                {
                    self.targets.push(Target::Pack(id));
                }
                true
            }
        }

        let mut scan = Scan {
            min_level,
            targets: Vec::new(),
        };
        visit::visit_type_once(self.arena, ty, &mut scan);

        for target in scan.targets {
            match target {
                Target::Type(id) => {
                    self.log.log_type(self.arena, id);
                    self.set_level(id, min_level);
                }
                Target::Pack(id) => {
                    self.log.log_pack(self.arena, id);
                    if let PackNode::Free(free) = self.arena.get_pack_mut(id) {
                        free.level = min_level;
                    }
                }
            }
        }
    }

    fn level_of(&self, ty: TypeId) -> Option<TypeLevel> {
        match self.arena.get(ty) {
            TypeNode::Free(free) => Some(free.level),
            TypeNode::Function(function) => Some(function.level),
            TypeNode::Table(table) => Some(table.level),
            _ => None,
        }
    }

    fn set_level(&mut self, ty: TypeId, level: TypeLevel) {
        match self.arena.get_mut(ty) {
            TypeNode::Free(free) => free.level = level,
            TypeNode::Function(function) => function.level = level,
            TypeNode::Table(table) => table.level = level,
            _ => {}
        }
    }

    pub(crate) fn check_child_mismatch(
        &mut self,
        child_errors: &[TypeError],
        wanted: TypeId,
        given: TypeId,
    ) {
        if let Some(e) = has_too_complex(child_errors) {
            self.errors.push(e);
        } else if !child_errors.is_empty() {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted,
                    given,
                    reason: None,
                    cause: None,
                },
                self.span,
            ));
        }
    }

    pub(crate) fn check_child_mismatch_prop(
        &mut self,
        child_errors: &[TypeError],
        prop: &str,
        wanted: TypeId,
        given: TypeId,
    ) {
        if let Some(e) = has_too_complex(child_errors) {
            self.errors.push(e);
        } else if !child_errors.is_empty() {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted,
                    given,
                    reason: Some(format!("property '{prop}' is not compatible")),
                    cause: Some(Box::new(child_errors[0].clone())),
                },
                self.span,
            ));
        }
    }
}

/// `UnificationTooComplex` always wins over other child diagnostics.
pub(crate) fn has_too_complex(errors: &[TypeError]) -> Option<TypeError> {
    errors
        .iter()
        .find(|e| matches!(e.error, UnifyError::UnificationTooComplex))
        .cloned()
}

/// For the tagged-union heuristic: the first property whose type is a
/// singleton, i.e. the table's discriminant.
fn table_match_tag(arena: &TypeArena, ty: TypeId) -> Option<(String, Singleton)> {
    match arena.get(arena.follow(ty)) {
        TypeNode::Table(table) => {
            for (name, prop) in &table.props {
                if let TypeNode::Singleton(singleton) = arena.get(arena.follow(prop.ty)) {
                    return Some((name.clone(), singleton.clone()));
                }
            }
            None
        }
        TypeNode::Metatable(mt) => table_match_tag(arena, mt.table),
        _ => None,
    }
}
