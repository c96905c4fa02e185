// src/unify/tables.rs
//
// Table unification.
//
// The default path is variance-aware width subtyping: supertype
// properties must exist on the subtype and agree invariantly, free
// tables grow to fit, unsealed supertypes absorb extra subtype
// properties in deeply-optional form. The legacy path (config toggle)
// is the older strict comparison kept for sealed tables while the
// variance rules finish settling.

use hashbrown::HashMap;

use crate::errors::{CannotExtendKind, MissingPropertiesKind, TypeError, UnifyError};
use crate::type_arena::{
    TypeId, find_table_property_respecting_meta, is_any, is_optional, is_string,
};
use crate::types::{Property, TableIndexer, TableState, TypeNode, UnionType};

use super::{Unifier, Variance};

impl<'a> Unifier<'a> {
    pub(crate) fn try_unify_tables(&mut self, left: TypeId, right: TypeId, is_intersection: bool) {
        if !self.state.config.table_subtyping_variance {
            return self.try_unify_tables_legacy(left, right, is_intersection);
        }

        if !matches!(self.arena.get(left), TypeNode::Table(_))
            || !matches!(self.arena.get(right), TypeNode::Table(_))
        {
            self.ice("non-table types passed to try_unify_tables");
        }

        let mut missing: Vec<String> = Vec::new();
        let mut extra: Vec<String> = Vec::new();

        // Cheap screen before any recursive unification: a subtype without
        // an indexer and with a fixed shape must already have every
        // required property.
        if self.table_indexer(right).is_none() && self.table_state(right) != TableState::Free {
            for (name, prop) in self.table_props(left) {
                if self.table_prop(right, &name).is_none()
                    && !is_optional(self.arena, prop.ty)
                    && !is_any(self.arena, prop.ty)
                {
                    missing.push(name);
                }
            }

            if !missing.is_empty() {
                self.errors.push(TypeError::new(
                    UnifyError::MissingProperties {
                        wanted: left,
                        given: right,
                        properties: missing,
                        kind: MissingPropertiesKind::Missing,
                    },
                    self.span,
                ));
                return;
            }
        }

        // And vice versa when invariant.
        if self.variance == Variance::Invariant
            && self.table_indexer(left).is_none()
            && self.table_state(left) != TableState::Unsealed
            && self.table_state(left) != TableState::Free
        {
            for (name, prop) in self.table_props(right) {
                if self.table_prop(left, &name).is_none()
                    && !is_optional(self.arena, prop.ty)
                    && !is_any(self.arena, prop.ty)
                {
                    extra.push(name);
                }
            }

            if !extra.is_empty() {
                self.errors.push(TypeError::new(
                    UnifyError::MissingProperties {
                        wanted: left,
                        given: right,
                        properties: extra,
                        kind: MissingPropertiesKind::Extra,
                    },
                    self.span,
                ));
                return;
            }
        }

        // Width subtyping: any property in the supertype must be present
        // in the subtype, and the two must agree invariantly since table
        // properties are read-write.
        for (name, prop) in self.table_props(left) {
            if let Some(right_prop) = self.table_prop(right, &name) {
                let mut inner = self.child();
                inner.variance = Variance::Invariant;
                inner.try_unify_inner(prop.ty, right_prop.ty, false, false);
                let mut child_log = inner.log;
                let child_errors = inner.errors;

                self.check_child_mismatch_prop(&child_errors, &name, left, right);

                if child_errors.is_empty() {
                    self.log.concat(child_log);
                } else {
                    child_log.rollback(self.arena);
                }
            } else if let Some(indexer) = self
                .table_indexer(right)
                .filter(|indexer| is_string(self.arena, indexer.key_ty))
            {
                let mut inner = self.child();
                inner.variance = Variance::Invariant;
                inner.try_unify_inner(prop.ty, indexer.value_ty, false, false);
                let mut child_log = inner.log;
                let child_errors = inner.errors;

                self.check_child_mismatch_prop(&child_errors, &name, left, right);

                if child_errors.is_empty() {
                    self.log.concat(child_log);
                } else {
                    child_log.rollback(self.arena);
                }
            } else if is_optional(self.arena, prop.ty) || is_any(self.arena, prop.ty) {
                // Accepted silently even though the subtype never supplies
                // the property. Unsound, and load-bearing for idiomatic
                // optional-field tables.
            } else if self.table_state(right) == TableState::Free {
                self.log.log_type(self.arena, right);
                if let TypeNode::Table(table) = self.arena.get_mut(right) {
                    table.props.insert(name, prop);
                }
            } else {
                missing.push(name);
            }
        }

        for (name, prop) in self.table_props(right) {
            if self.table_prop(left, &name).is_some() {
                // Already unified above.
            } else if let Some(indexer) = self
                .table_indexer(left)
                .filter(|indexer| is_string(self.arena, indexer.key_ty))
            {
                let mut inner = self.child();
                inner.variance = Variance::Invariant;
                inner.try_unify_inner(prop.ty, indexer.value_ty, false, false);
                let mut child_log = inner.log;
                let child_errors = inner.errors;

                self.check_child_mismatch_prop(&child_errors, &name, left, right);

                if child_errors.is_empty() {
                    self.log.concat(child_log);
                } else {
                    child_log.rollback(self.arena);
                }
            } else if self.table_state(left) == TableState::Unsealed {
                // The unsealed supertype learns the property, but only in
                // optional form: existing values of the supertype did not
                // have it.
                let optional_ty = self.deeply_optional(prop.ty);
                self.log.log_type(self.arena, left);
                if let TypeNode::Table(table) = self.arena.get_mut(left) {
                    table.props.insert(
                        name,
                        Property {
                            ty: optional_ty,
                            definition: prop.definition,
                        },
                    );
                }
            } else if self.variance == Variance::Covariant {
                // Width subtyping: extra subtype properties are fine.
            } else if is_optional(self.arena, prop.ty) || is_any(self.arena, prop.ty) {
                // See the left pass.
            } else if self.table_state(left) == TableState::Free {
                self.log.log_type(self.arena, left);
                if let TypeNode::Table(table) = self.arena.get_mut(left) {
                    table.props.insert(name, prop);
                }
            } else {
                extra.push(name);
            }
        }

        // Indexers.
        match (self.table_indexer(left), self.table_indexer(right)) {
            (Some(left_indexer), Some(right_indexer)) => {
                let mut inner = self.child();
                inner.variance = Variance::Invariant;
                inner.try_unify_indexer(left_indexer, right_indexer);
                let mut child_log = inner.log;
                let child_errors = inner.errors;

                self.check_child_mismatch(&child_errors, left, right);

                if child_errors.is_empty() {
                    self.log.concat(child_log);
                } else {
                    child_log.rollback(self.arena);
                }
            }
            (Some(left_indexer), None) => {
                // Passing a table without an indexer where one is expected:
                // growable subtypes adopt it.
                if matches!(
                    self.table_state(right),
                    TableState::Unsealed | TableState::Free
                ) {
                    self.log.log_type(self.arena, right);
                    if let TypeNode::Table(table) = self.arena.get_mut(right) {
                        table.indexer = Some(left_indexer);
                    }
                }
            }
            (None, Some(right_indexer)) if self.variance == Variance::Invariant => {
                if matches!(
                    self.table_state(left),
                    TableState::Unsealed | TableState::Free
                ) {
                    self.log.log_type(self.arena, left);
                    if let TypeNode::Table(table) = self.arena.get_mut(left) {
                        table.indexer = Some(right_indexer);
                    }
                }
            }
            _ => {}
        }

        if !missing.is_empty() {
            self.errors.push(TypeError::new(
                UnifyError::MissingProperties {
                    wanted: left,
                    given: right,
                    properties: missing,
                    kind: MissingPropertiesKind::Missing,
                },
                self.span,
            ));
            return;
        }

        if !extra.is_empty() {
            self.errors.push(TypeError::new(
                UnifyError::MissingProperties {
                    wanted: left,
                    given: right,
                    properties: extra,
                    kind: MissingPropertiesKind::Extra,
                },
                self.span,
            ));
            return;
        }

        // Unifying a property can rebind the table that holds it (cyclic
        // types). Start over on the followed handles; this terminates
        // because binding only happens to free tables.
        if self.table_bound_to(left).is_some() || self.table_bound_to(right).is_some() {
            return self.try_unify_inner(left, right, false, false);
        }

        if self.table_state(left) == TableState::Free {
            tracing::trace!(?left, ?right, "binding free supertype table");
            self.log.log_type(self.arena, left);
            if let TypeNode::Table(table) = self.arena.get_mut(left) {
                table.bound_to = Some(right);
            }
        } else if self.table_state(right) == TableState::Free {
            tracing::trace!(?left, ?right, "binding free subtype table");
            self.log.log_type(self.arena, right);
            if let TypeNode::Table(table) = self.arena.get_mut(right) {
                table.bound_to = Some(left);
            }
        }
    }

    pub(crate) fn try_unify_indexer(&mut self, super_indexer: TableIndexer, sub_indexer: TableIndexer) {
        self.try_unify_inner(super_indexer.key_ty, sub_indexer.key_ty, false, false);
        self.try_unify_inner(super_indexer.value_ty, sub_indexer.value_ty, false, false);
    }

    /// A copy of `ty` in which every table property is optional, used when
    /// an unsealed table absorbs properties it did not previously have.
    pub(crate) fn deeply_optional(&mut self, ty: TypeId) -> TypeId {
        let mut seen = HashMap::new();
        self.deeply_optional_seen(ty, &mut seen)
    }

    fn deeply_optional_seen(&mut self, ty: TypeId, seen: &mut HashMap<TypeId, TypeId>) -> TypeId {
        let ty = self.arena.follow(ty);

        if matches!(self.arena.get(ty), TypeNode::Any) || is_optional(self.arena, ty) {
            return ty;
        }

        if let TypeNode::Table(table) = self.arena.get(ty) {
            if let Some(&result) = seen.get(&ty) {
                return result;
            }

            let clone = table.clone();
            let result = self.arena.add_type(TypeNode::Table(clone));
            seen.insert(ty, result);

            let props: Vec<(String, TypeId)> = match self.arena.get(result) {
                TypeNode::Table(table) => table
                    .props
                    .iter()
                    .map(|(name, prop)| (name.clone(), prop.ty))
                    .collect(),
                _ => Vec::new(),
            };

            for (name, prop_ty) in props {
                let optional_ty = self.deeply_optional_seen(prop_ty, seen);
                if let TypeNode::Table(table) = self.arena.get_mut(result)
                    && let Some(prop) = table.props.get_mut(&name)
                {
                    prop.ty = optional_ty;
                }
            }

            let nil = self.arena.builtins.nil_type;
            self.arena.add_type(TypeNode::Union(UnionType {
                options: [nil, result].into_iter().collect(),
            }))
        } else {
            let nil = self.arena.builtins.nil_type;
            self.arena.add_type(TypeNode::Union(UnionType {
                options: [nil, ty].into_iter().collect(),
            }))
        }
    }

    // -----------------------------------------------------------------------
    // Legacy strict comparison
    // -----------------------------------------------------------------------

    fn try_unify_tables_legacy(&mut self, left: TypeId, right: TypeId, is_intersection: bool) {
        let saved_variance = self.variance;
        self.variance = Variance::Invariant;
        self.try_unify_tables_legacy_inner(left, right, is_intersection);
        self.variance = saved_variance;
    }

    fn try_unify_tables_legacy_inner(
        &mut self,
        left: TypeId,
        right: TypeId,
        is_intersection: bool,
    ) {
        use TableState as S;

        if !matches!(self.arena.get(left), TypeNode::Table(_))
            || !matches!(self.arena.get(right), TypeNode::Table(_))
        {
            self.ice("non-table types passed to try_unify_tables");
        }

        let lt_state = self.table_state(left);
        let rt_state = self.table_state(right);

        if lt_state == S::Sealed && rt_state == S::Sealed {
            self.try_unify_sealed_tables(left, right, is_intersection)
        } else if (lt_state == S::Sealed && rt_state == S::Unsealed)
            || (lt_state == S::Unsealed && rt_state == S::Sealed)
        {
            self.try_unify_sealed_tables(left, right, is_intersection)
        } else if (lt_state == S::Sealed && rt_state == S::Generic)
            || (lt_state == S::Generic && rt_state == S::Sealed)
        {
            self.errors.push(TypeError::new(
                UnifyError::TypeMismatch {
                    wanted: left,
                    given: right,
                    reason: None,
                    cause: None,
                },
                self.span,
            ));
        } else if (lt_state == S::Free) != (rt_state == S::Free) {
            let (free_id, other_id) = if rt_state == S::Free {
                (right, left)
            } else {
                (left, right)
            };
            self.try_unify_free_table(free_id, other_id);
        } else if lt_state == S::Free && rt_state == S::Free {
            self.try_unify_free_table(left, right);

            // Avoid a cycle when the two already point at each other.
            if self.arena.follow(left) != self.arena.follow(right) {
                self.log.log_type(self.arena, left);
                if let TypeNode::Table(table) = self.arena.get_mut(left) {
                    table.bound_to = Some(right);
                }
            }
        } else if lt_state != S::Sealed && rt_state != S::Sealed {
            // Tables must have exactly the same props and all of them must
            // unify.
            for (name, prop) in self.table_props(left) {
                match self.table_prop(right, &name) {
                    None => self.errors.push(TypeError::new(
                        UnifyError::UnknownProperty { ty: right, name },
                        self.span,
                    )),
                    Some(right_prop) => {
                        self.try_unify_inner(prop.ty, right_prop.ty, false, false)
                    }
                }
            }

            match (self.table_indexer(left), self.table_indexer(right)) {
                (Some(left_indexer), Some(right_indexer)) => {
                    self.try_unify_indexer(left_indexer, right_indexer)
                }
                (Some(left_indexer), None) => {
                    if rt_state == S::Unsealed {
                        self.log.log_type(self.arena, right);
                        if let TypeNode::Table(table) = self.arena.get_mut(right) {
                            table.indexer = Some(left_indexer);
                        }
                    } else {
                        self.errors.push(TypeError::new(
                            UnifyError::CannotExtendTable {
                                ty: right,
                                kind: CannotExtendKind::Indexer,
                            },
                            self.span,
                        ));
                    }
                }
                _ => {}
            }
        } else if lt_state == S::Sealed {
            // Cannot happen for any state combination enumerated above;
            // kept as a hard stop because the old comparison never
            // supported this shape.
            self.ice("sealed table unification reached an unsupported table state");
        } else if rt_state == S::Sealed {
            self.try_unify_tables_legacy_inner(right, left, is_intersection);
        } else {
            self.ice("table unification fell through every case");
        }
    }

    /// Every property the free table already has must exist (possibly via
    /// a metatable) on the other side and unify; then the free table binds
    /// to the other.
    fn try_unify_free_table(&mut self, free_id: TypeId, other_id: TypeId) {
        if !matches!(self.arena.get(free_id), TypeNode::Table(_))
            || !matches!(self.arena.get(other_id), TypeNode::Table(_))
        {
            self.ice("non-table types passed to try_unify_free_table");
        }

        for (name, prop) in self.table_props(free_id) {
            if let Some(other_prop_ty) =
                find_table_property_respecting_meta(self.arena, other_id, &name)
            {
                self.try_unify_inner(other_prop_ty, prop.ty, false, false);

                // Unifying a property can rebind either table; if that
                // happened, start over from the followed handles.
                let free_is_table = matches!(self.arena.get(free_id), TypeNode::Table(_));
                let other_is_table = matches!(self.arena.get(other_id), TypeNode::Table(_));
                if !free_is_table || !other_is_table {
                    return self.try_unify_inner(free_id, other_id, false, false);
                }
                if self.table_bound_to(free_id).is_some() {
                    return self.try_unify_inner(free_id, other_id, false, false);
                }
            } else if self.table_state(other_id) == TableState::Free {
                // The other table is also free: it just grew.
                self.log.log_type(self.arena, other_id);
                if let TypeNode::Table(table) = self.arena.get_mut(other_id) {
                    table.props.insert(name, prop);
                }
            } else {
                self.errors.push(TypeError::new(
                    UnifyError::UnknownProperty {
                        ty: other_id,
                        name,
                    },
                    self.span,
                ));
            }
        }

        match (self.table_indexer(free_id), self.table_indexer(other_id)) {
            (Some(free_indexer), Some(other_indexer)) => {
                let mut inner = self.child();
                inner.try_unify_indexer(free_indexer, other_indexer);
                let child_log = inner.log;
                let child_errors = inner.errors;

                self.check_child_mismatch(&child_errors, free_id, other_id);
                self.log.concat(child_log);
            }
            (Some(free_indexer), None) => {
                if self.table_state(other_id) == TableState::Free {
                    self.log.log_type(self.arena, other_id);
                    if let TypeNode::Table(table) = self.arena.get_mut(other_id) {
                        table.indexer = Some(free_indexer);
                    }
                }
            }
            _ => {}
        }

        if self.table_bound_to(free_id).is_none()
            && self.table_state(other_id) != TableState::Free
        {
            self.log.log_type(self.arena, free_id);
            if let TypeNode::Table(table) = self.arena.get_mut(free_id) {
                table.bound_to = Some(other_id);
            }
        }
    }

    /// Strict comparison for closed tables: both sides need the same
    /// properties and all of them must unify.
    fn try_unify_sealed_tables(&mut self, left: TypeId, right: TypeId, is_intersection: bool) {
        let (lt, rt) = match (self.arena.get(left), self.arena.get(right)) {
            (TypeNode::Table(lt), TypeNode::Table(rt)) => (lt.clone(), rt.clone()),
            _ => self.ice("non-table types passed to try_unify_sealed_tables"),
        };

        let mut missing: Vec<String> = Vec::new();
        let is_unnamed = rt.name.is_none() && rt.synthetic_name.is_none();

        // Cheap screen first, as in the variance path.
        if rt.indexer.is_none() {
            for (name, prop) in &lt.props {
                if !rt.props.contains_key(name) && !is_optional(self.arena, prop.ty) {
                    missing.push(name.clone());
                }
            }

            if !missing.is_empty() {
                self.errors.push(TypeError::new(
                    UnifyError::MissingProperties {
                        wanted: left,
                        given: right,
                        properties: missing,
                        kind: MissingPropertiesKind::Missing,
                    },
                    self.span,
                ));
                return;
            }
        }

        let mut surfaced: Option<TypeError> = None;
        let mut error_reported = false;

        let (child_log, child_errors) = {
            let mut inner = self.child();

            for (name, prop) in &lt.props {
                match rt.props.get(name) {
                    None => {
                        if is_optional(inner.arena, prop.ty) {
                            continue;
                        }

                        missing.push(name.clone());
                        inner.errors.push(TypeError::new(
                            UnifyError::TypeMismatch {
                                wanted: left,
                                given: right,
                                reason: None,
                                cause: None,
                            },
                            inner.span,
                        ));
                    }
                    Some(right_prop) => {
                        // For anonymous table literals, point the error at
                        // the property's own definition and surface the
                        // child error directly.
                        if is_unnamed && let Some(definition) = right_prop.definition {
                            let old_count = inner.errors.len();
                            let old_span = inner.span;
                            inner.span = definition;
                            inner.try_unify_inner(prop.ty, right_prop.ty, false, false);
                            inner.span = old_span;

                            if inner.errors.len() != old_count && !error_reported {
                                error_reported = true;
                                surfaced = inner.errors.last().cloned();
                            }
                        } else {
                            inner.try_unify_inner(prop.ty, right_prop.ty, false, false);
                        }
                    }
                }
            }

            if lt.indexer.is_some() || rt.indexer.is_some() {
                if let (Some(left_indexer), Some(right_indexer)) = (lt.indexer, rt.indexer) {
                    inner.try_unify_indexer(left_indexer, right_indexer);
                } else if rt.state == TableState::Unsealed {
                    if let Some(left_indexer) = lt.indexer
                        && rt.indexer.is_none()
                    {
                        inner.log.log_type(inner.arena, right);
                        if let TypeNode::Table(table) = inner.arena.get_mut(right) {
                            table.indexer = Some(left_indexer);
                        }
                    }
                } else if lt.state == TableState::Unsealed {
                    if let Some(right_indexer) = rt.indexer
                        && lt.indexer.is_none()
                    {
                        inner.log.log_type(inner.arena, left);
                        if let TypeNode::Table(table) = inner.arena.get_mut(left) {
                            table.indexer = Some(right_indexer);
                        }
                    }
                } else if let Some(left_indexer) = lt.indexer {
                    let string_ty = inner.arena.builtins.string_type;
                    inner.try_unify_inner(left_indexer.key_ty, string_ty, false, false);

                    // Properties present on both sides were unified above;
                    // the remainder must fit the indexer.
                    for (name, prop) in &rt.props {
                        if !lt.props.contains_key(name) {
                            inner.try_unify_inner(left_indexer.value_ty, prop.ty, false, false);
                        }
                    }
                } else {
                    inner.errors.push(TypeError::new(
                        UnifyError::TypeMismatch {
                            wanted: left,
                            given: right,
                            reason: None,
                            cause: None,
                        },
                        inner.span,
                    ));
                }
            }

            (inner.log, inner.errors)
        };

        self.log.concat(child_log);

        if let Some(e) = surfaced {
            self.errors.push(e);
        }
        if error_reported {
            return;
        }

        if !missing.is_empty() {
            self.errors.push(TypeError::new(
                UnifyError::MissingProperties {
                    wanted: left,
                    given: right,
                    properties: missing,
                    kind: MissingPropertiesKind::Missing,
                },
                self.span,
            ));
            return;
        }

        // When the supertype is one part of an intersection, its siblings
        // may legitimately own the "extra" properties; skip the check.
        if !is_intersection && lt.state != TableState::Unsealed && lt.indexer.is_none() {
            let mut extra: Vec<String> = Vec::new();

            for (name, prop) in &rt.props {
                if !lt.props.contains_key(name) && !is_optional(self.arena, prop.ty) {
                    extra.push(name.clone());
                }
            }

            if !extra.is_empty() {
                self.errors.push(TypeError::new(
                    UnifyError::MissingProperties {
                        wanted: left,
                        given: right,
                        properties: extra,
                        kind: MissingPropertiesKind::Extra,
                    },
                    self.span,
                ));
                return;
            }
        }

        self.check_child_mismatch(&child_errors, left, right);
    }

    // -----------------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------------

    fn table_state(&self, ty: TypeId) -> TableState {
        match self.arena.get(ty) {
            TypeNode::Table(table) => table.state,
            _ => TableState::Sealed,
        }
    }

    fn table_indexer(&self, ty: TypeId) -> Option<TableIndexer> {
        match self.arena.get(ty) {
            TypeNode::Table(table) => table.indexer,
            _ => None,
        }
    }

    fn table_bound_to(&self, ty: TypeId) -> Option<TypeId> {
        match self.arena.get(ty) {
            TypeNode::Table(table) => table.bound_to,
            _ => None,
        }
    }

    fn table_prop(&self, ty: TypeId, name: &str) -> Option<Property> {
        match self.arena.get(ty) {
            TypeNode::Table(table) => table.props.get(name).copied(),
            _ => None,
        }
    }

    fn table_props(&self, ty: TypeId) -> Vec<(String, Property)> {
        match self.arena.get(ty) {
            TypeNode::Table(table) => table
                .props
                .iter()
                .map(|(name, prop)| (name.clone(), *prop))
                .collect(),
            _ => Vec::new(),
        }
    }
}
