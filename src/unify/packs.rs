// src/unify/packs.rs
//
// Type pack unification.
//
// Packs are rope-like: a head list plus an optional tail that may itself
// be another list, a free pack, a generic pack, or a variadic. Two
// cursors walk the ropes and unify paired heads; when one side runs out
// and the other side's tail is free, the free tail grows fresh types to
// fit.

use crate::errors::{CountContext, TypeError, UnifyError};
use crate::type_arena::{TypeArena, TypeId, TypePackId, flatten_pack, is_optional, pack_size};
use crate::types::{PackNode, TypeLevel, TypeList, TypeNode, VariadicPack};

use super::Unifier;

/// Walks a pack chain one head element at a time. After `grow` the cursor
/// points at a fresh list that the caller extends to match the other
/// side.
struct PackCursor {
    pack_id: TypePackId,
    index: usize,
    growing: bool,
    level: TypeLevel,
}

impl PackCursor {
    fn new(arena: &TypeArena, pack_id: TypePackId) -> Self {
        let mut pack_id = arena.follow_pack(pack_id);

        // Skip leading empty segments.
        loop {
            match arena.get_pack(pack_id) {
                PackNode::List(TypeList {
                    head,
                    tail: Some(tail),
                }) if head.is_empty() => {
                    pack_id = arena.follow_pack(*tail);
                }
                _ => break,
            }
        }

        Self {
            pack_id,
            index: 0,
            growing: false,
            level: TypeLevel::default(),
        }
    }

    fn good(&self, arena: &TypeArena) -> bool {
        matches!(arena.get_pack(self.pack_id), PackNode::List(list) if self.index < list.head.len())
    }

    fn current(&self, arena: &TypeArena) -> TypeId {
        match arena.get_pack(self.pack_id) {
            PackNode::List(list) => list.head[self.index],
            _ => unreachable!("current() called on a bad cursor"),
        }
    }

    fn advance(&mut self, arena: &TypeArena) {
        let (head_len, tail) = match arena.get_pack(self.pack_id) {
            PackNode::List(list) => (list.head.len(), list.tail),
            _ => return,
        };

        if self.index < head_len {
            self.index += 1;
        }

        if self.growing || self.index < head_len {
            return;
        }

        if let Some(tail) = tail {
            self.pack_id = arena.follow_pack(tail);
            self.index = 0;
        }
    }

    fn can_grow(&self, arena: &TypeArena) -> bool {
        matches!(arena.get_pack(self.pack_id), PackNode::Free(_))
    }

    /// Bind the free tail under the cursor to a fresh empty list and keep
    /// iterating there. The free tail's level is remembered so grown
    /// elements live at the right scope depth.
    fn grow(&mut self, u: &mut Unifier<'_>, new_tail: TypePackId) {
        let level = match u.arena.get_pack(self.pack_id) {
            PackNode::Free(free) => free.level,
            _ => unreachable!("grow() called on a cursor that cannot grow"),
        };

        u.log.log_pack(u.arena, self.pack_id);
        *u.arena.get_pack_mut(self.pack_id) = PackNode::Bound(new_tail);

        self.pack_id = new_tail;
        self.index = 0;
        self.growing = true;
        self.level = level;
    }
}

impl<'a> Unifier<'a> {
    pub(crate) fn try_unify_packs_inner(
        &mut self,
        super_tp: TypePackId,
        sub_tp: TypePackId,
        is_function_call: bool,
    ) {
        if !self.enter_recursion() {
            return;
        }
        self.try_unify_packs_step(super_tp, sub_tp, is_function_call);
        self.leave_recursion();
    }

    fn try_unify_packs_step(
        &mut self,
        super_tp: TypePackId,
        sub_tp: TypePackId,
        is_function_call: bool,
    ) {
        if self.iteration_limit_exceeded() {
            return;
        }

        let mut super_tp = self.arena.follow_pack(super_tp);
        let mut sub_tp = self.arena.follow_pack(sub_tp);

        // Empty list segments carry no information; skip to their tails.
        loop {
            match self.arena.get_pack(sub_tp) {
                PackNode::List(TypeList {
                    head,
                    tail: Some(tail),
                }) if head.is_empty() => {
                    sub_tp = self.arena.follow_pack(*tail);
                }
                _ => break,
            }
        }
        loop {
            match self.arena.get_pack(super_tp) {
                PackNode::List(TypeList {
                    head,
                    tail: Some(tail),
                }) if head.is_empty() => {
                    super_tp = self.arena.follow_pack(*tail);
                }
                _ => break,
            }
        }

        if super_tp == sub_tp {
            return;
        }

        enum Shape {
            SuperFree,
            SubFree,
            SuperError,
            SubError,
            SuperVariadic,
            SubVariadic,
            Lists,
            Mismatch,
        }

        let shape = match (self.arena.get_pack(super_tp), self.arena.get_pack(sub_tp)) {
            (PackNode::Free(_), _) => Shape::SuperFree,
            (_, PackNode::Free(_)) => Shape::SubFree,
            (PackNode::Error, _) => Shape::SuperError,
            (_, PackNode::Error) => Shape::SubError,
            (PackNode::Variadic(_), _) => Shape::SuperVariadic,
            (_, PackNode::Variadic(_)) => Shape::SubVariadic,
            (PackNode::List(_), PackNode::List(_)) => Shape::Lists,
            _ => Shape::Mismatch,
        };

        match shape {
            Shape::SuperFree => {
                self.occurs_check_pack(super_tp, sub_tp);

                if !matches!(self.arena.get_pack(super_tp), PackNode::Error) {
                    self.log.log_pack(self.arena, super_tp);
                    *self.arena.get_pack_mut(super_tp) = PackNode::Bound(sub_tp);
                }
            }
            Shape::SubFree => {
                self.occurs_check_pack(sub_tp, super_tp);

                if !matches!(self.arena.get_pack(sub_tp), PackNode::Error) {
                    self.log.log_pack(self.arena, sub_tp);
                    *self.arena.get_pack_mut(sub_tp) = PackNode::Bound(super_tp);
                }
            }
            Shape::SuperError => self.try_unify_with_any_pack(super_tp, sub_tp),
            Shape::SubError => self.try_unify_with_any_pack(sub_tp, super_tp),
            Shape::SuperVariadic => self.try_unify_variadics(super_tp, sub_tp, false, 0),
            Shape::SubVariadic => self.try_unify_variadics(sub_tp, super_tp, true, 0),
            Shape::Lists => self.try_unify_pack_lists(super_tp, sub_tp, is_function_call),
            Shape::Mismatch => {
                self.errors.push(TypeError::new(
                    UnifyError::GenericError {
                        message: "failed to unify type packs".to_string(),
                    },
                    self.span,
                ));
            }
        }
    }

    fn try_unify_pack_lists(
        &mut self,
        super_tp: TypePackId,
        sub_tp: TypePackId,
        is_function_call: bool,
    ) {
        let super_first_tail = match self.arena.get_pack(super_tp) {
            PackNode::List(list) => list.tail,
            _ => None,
        };
        let sub_first_tail = match self.arena.get_pack(sub_tp) {
            PackNode::List(list) => list.tail,
            _ => None,
        };

        // If head sizes differ while both tails are free, one pass is
        // enough: without this sentinel the two sides would grow each
        // other forever.
        let (super_heads, super_tail) = flatten_pack(self.arena, super_tp);
        let (sub_heads, sub_tail) = flatten_pack(self.arena, sub_tp);
        let no_infinite_growth = super_heads.len() != sub_heads.len()
            && super_tail
                .is_some_and(|tail| matches!(self.arena.get_pack(tail), PackNode::Free(_)))
            && sub_tail.is_some_and(|tail| matches!(self.arena.get_pack(tail), PackNode::Free(_)));

        let mut super_cur = PackCursor::new(self.arena, super_tp);
        let mut sub_cur = PackCursor::new(self.arena, sub_tp);

        let empty_tp = self.arena.add_pack(PackNode::List(TypeList::default()));

        let mut loop_count = 0usize;

        loop {
            let limit = self.state.config.pack_loop_limit;
            if limit > 0 && loop_count >= limit {
                self.ice("detected possibly infinite type pack growth");
            }
            loop_count += 1;

            // A growing side receives a fresh type for every element the
            // other side still has.
            if super_cur.good(self.arena) && sub_cur.growing {
                let fresh = self.arena.fresh_type(sub_cur.level);
                if let PackNode::List(list) = self.arena.get_pack_mut(sub_cur.pack_id) {
                    list.head.push(fresh);
                }
            }
            if sub_cur.good(self.arena) && super_cur.growing {
                let fresh = self.arena.fresh_type(super_cur.level);
                if let PackNode::List(list) = self.arena.get_pack_mut(super_cur.pack_id) {
                    list.head.push(fresh);
                }
            }

            if super_cur.good(self.arena) && sub_cur.good(self.arena) {
                let super_elem = super_cur.current(self.arena);
                let sub_elem = sub_cur.current(self.arena);
                self.try_unify_inner(super_elem, sub_elem, false, false);

                if !self.errors.is_empty() && self.first_pack_error_pos.is_none() {
                    self.first_pack_error_pos = Some(loop_count);
                }

                super_cur.advance(self.arena);
                sub_cur.advance(self.arena);

                if no_infinite_growth {
                    break;
                }
                continue;
            }

            // Both ends reached.
            if !super_cur.good(self.arena) && !sub_cur.good(self.arena) {
                let super_tail_free = super_first_tail.is_some_and(|tail| {
                    let tail = self.arena.follow_pack(tail);
                    matches!(self.arena.get_pack(tail), PackNode::Free(_))
                });
                let sub_tail_free = sub_first_tail.is_some_and(|tail| {
                    let tail = self.arena.follow_pack(tail);
                    matches!(self.arena.get_pack(tail), PackNode::Free(_))
                });

                if super_tail_free && sub_tail_free {
                    let (Some(l), Some(r)) = (super_first_tail, sub_first_tail) else {
                        unreachable!("free tails checked above");
                    };
                    self.try_unify_packs_inner(l, r, false);
                } else if super_tail_free {
                    let Some(l) = super_first_tail else {
                        unreachable!("free tail checked above");
                    };
                    self.try_unify_packs_inner(l, empty_tp, false);
                } else if sub_tail_free {
                    let Some(r) = sub_first_tail else {
                        unreachable!("free tail checked above");
                    };
                    self.try_unify_packs_inner(r, empty_tp, false);
                }

                break;
            }

            // If both tails are free, bind one to the other and call it a
            // day.
            if super_cur.can_grow(self.arena) && sub_cur.can_grow(self.arena) {
                return self.try_unify_packs_inner(super_cur.pack_id, sub_cur.pack_id, false);
            }

            // Just one side free on its tail: grow it to fit the other.
            if super_cur.can_grow(self.arena) {
                tracing::trace!(pack = ?super_cur.pack_id, "growing supertype pack tail");
                let new_tail = self.arena.add_pack(PackNode::List(TypeList::default()));
                super_cur.grow(self, new_tail);
            } else if sub_cur.can_grow(self.arena) {
                tracing::trace!(pack = ?sub_cur.pack_id, "growing subtype pack tail");
                let new_tail = self.arena.add_pack(PackNode::List(TypeList::default()));
                sub_cur.grow(self, new_tail);
            } else {
                // A union with nil marks an optional element; it may be
                // absent from the other side.
                if super_cur.good(self.arena) && is_optional(self.arena, super_cur.current(self.arena))
                {
                    super_cur.advance(self.arena);
                    if no_infinite_growth {
                        break;
                    }
                    continue;
                }
                if sub_cur.good(self.arena) && is_optional(self.arena, sub_cur.current(self.arena)) {
                    sub_cur.advance(self.arena);
                    if no_infinite_growth {
                        break;
                    }
                    continue;
                }
                // In nonstrict mode, `any` marks an optional element too.
                if super_cur.good(self.arena) && self.is_nonstrict() {
                    let current = self.arena.follow(super_cur.current(self.arena));
                    if matches!(self.arena.get(current), TypeNode::Any) {
                        super_cur.advance(self.arena);
                        if no_infinite_growth {
                            break;
                        }
                        continue;
                    }
                }

                if matches!(self.arena.get_pack(super_cur.pack_id), PackNode::Variadic(_)) {
                    return self.try_unify_variadics(
                        super_cur.pack_id,
                        sub_cur.pack_id,
                        false,
                        sub_cur.index,
                    );
                }
                if matches!(self.arena.get_pack(sub_cur.pack_id), PackNode::Variadic(_)) {
                    return self.try_unify_variadics(
                        sub_cur.pack_id,
                        super_cur.pack_id,
                        true,
                        super_cur.index,
                    );
                }

                if !is_function_call && sub_cur.good(self.arena) {
                    // Surplus return values may be discarded.
                    return;
                }

                // We only know subtype vs supertype here, not expected vs
                // actual; when checking returned values the roles swap.
                let mut expected = pack_size(self.arena, super_tp);
                let mut actual = pack_size(self.arena, sub_tp);
                if self.ctx == CountContext::Result {
                    std::mem::swap(&mut expected, &mut actual);
                }
                self.errors.push(TypeError::new(
                    UnifyError::CountMismatch {
                        expected,
                        actual,
                        context: self.ctx,
                    },
                    self.span,
                ));

                // Recovery: settle every leftover element against the
                // error type so inference can continue past the mismatch.
                let error_type = self.arena.builtins.error_type;
                while super_cur.good(self.arena) {
                    let current = super_cur.current(self.arena);
                    self.try_unify_inner(error_type, current, false, false);
                    super_cur.advance(self.arena);
                }
                while sub_cur.good(self.arena) {
                    let current = sub_cur.current(self.arena);
                    self.try_unify_inner(error_type, current, false, false);
                    sub_cur.advance(self.arena);
                }

                return;
            }

            if no_infinite_growth {
                break;
            }
        }

        if no_infinite_growth
            && pack_size(self.arena, super_tp) != pack_size(self.arena, sub_tp)
        {
            let mut expected = pack_size(self.arena, super_tp);
            let mut actual = pack_size(self.arena, sub_tp);
            if self.ctx == CountContext::Result {
                std::mem::swap(&mut expected, &mut actual);
            }
            self.errors.push(TypeError::new(
                UnifyError::CountMismatch {
                    expected,
                    actual,
                    context: self.ctx,
                },
                self.span,
            ));
        }
    }

    /// Unify a variadic pack against another pack. `sub_offset` skips
    /// elements the caller already consumed when handing off mid-walk.
    pub(crate) fn try_unify_variadics(
        &mut self,
        super_tp: TypePackId,
        sub_tp: TypePackId,
        reversed: bool,
        sub_offset: usize,
    ) {
        let variadic = match self.arena.get_pack(super_tp) {
            PackNode::Variadic(variadic) => *variadic,
            _ => self.ice("non-variadic pack passed to try_unify_variadics"),
        };

        enum SubShape {
            Variadic(VariadicPack),
            List,
            Other,
        }

        let sub_shape = match self.arena.get_pack(sub_tp) {
            PackNode::Variadic(v) => SubShape::Variadic(*v),
            PackNode::List(_) => SubShape::List,
            _ => SubShape::Other,
        };

        match sub_shape {
            SubShape::Variadic(rv) => {
                if reversed {
                    self.try_unify_inner(rv.ty, variadic.ty, false, false);
                } else {
                    self.try_unify_inner(variadic.ty, rv.ty, false, false);
                }
            }
            SubShape::List => {
                let (heads, tail) = flatten_pack(self.arena, sub_tp);

                for &head in heads.iter().skip(sub_offset) {
                    if reversed {
                        self.try_unify_inner(head, variadic.ty, false, false);
                    } else {
                        self.try_unify_inner(variadic.ty, head, false, false);
                    }
                }

                if let Some(tail) = tail {
                    let tail = self.arena.follow_pack(tail);
                    match self.arena.get_pack(tail) {
                        PackNode::Free(_) => {
                            self.log.log_pack(self.arena, tail);
                            *self.arena.get_pack_mut(tail) = PackNode::Bound(super_tp);
                        }
                        PackNode::Variadic(vtp) => {
                            let vtp_ty = vtp.ty;
                            self.try_unify_inner(variadic.ty, vtp_ty, false, false);
                        }
                        PackNode::Generic => {
                            self.errors.push(TypeError::new(
                                UnifyError::GenericError {
                                    message: "cannot unify a variadic pack against a generic pack"
                                        .to_string(),
                                },
                                self.span,
                            ));
                        }
                        PackNode::Error => {}
                        _ => self.ice("unknown type pack kind behind a pack tail"),
                    }
                }
            }
            SubShape::Other => {
                self.errors.push(TypeError::new(
                    UnifyError::GenericError {
                        message: "failed to unify variadic packs".to_string(),
                    },
                    self.span,
                ));
            }
        }
    }
}
