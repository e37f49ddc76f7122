//! Denoted values (shadow thunks)
//!
//! A `DenotedValue` shadows either a lazy thunk or an eagerly materialized
//! argument. It accumulates everything the promises and escaped_arguments
//! tables need: forcing and metaprogramming counters, scope-effect counters
//! attributed by the stack walk, dispatch counts, execution time, and a
//! compact lifecycle fingerprint.
//!
//! All counters exist twice, one phase before the escape transition and one
//! after; once a value escapes the call that first referenced it, every
//! subsequent update lands in the after-escape phase. Per-entity totals are
//! the field-wise sum of the two phases.

use crate::host::{EnvRef, ThunkRef, ValueKind};
use crate::ids::{CallId, FunctionId, Timestamp, ValueId};

/// Per-thunk event counters (one phase).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub force: u64,
    pub metaprogram: u64,
    pub value_lookup: u64,
    pub value_assign: u64,
    pub expression_lookup: u64,
    pub expression_assign: u64,
    pub environment_lookup: u64,
    pub environment_assign: u64,
}

/// Direct/indirect pair for one scope relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeCounts {
    pub direct: u64,
    pub indirect: u64,
}

impl ScopeCounts {
    fn bump(&mut self, direct: bool) {
        if direct {
            self.direct += 1;
        } else {
            self.indirect += 1;
        }
    }
}

/// Scope-effect counters (one phase): {self, lexical, non-lexical} ×
/// {mutation, observation}, each split direct/indirect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeEffectCounts {
    pub self_mutation: ScopeCounts,
    pub lexical_mutation: ScopeCounts,
    pub non_lexical_mutation: ScopeCounts,
    pub self_observation: ScopeCounts,
    pub lexical_observation: ScopeCounts,
    pub non_lexical_observation: ScopeCounts,
}

/// Stack-shape snapshot taken when a thunk is first forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalDepth {
    pub call_depth: u32,
    pub promise_depth: u32,
    pub nested_promise_depth: u32,
    pub forcing_actual_argument_position: i32,
}

/// Depth recorded when the originating call can no longer be found on the
/// stack (the thunk escaped), and the default before any force.
pub const ESCAPED_EVAL_DEPTH: EvalDepth = EvalDepth {
    call_depth: 0,
    promise_depth: 0,
    nested_promise_depth: 0,
    forcing_actual_argument_position: -1,
};

impl Default for EvalDepth {
    fn default() -> Self {
        ESCAPED_EVAL_DEPTH
    }
}

/// Compact fingerprint of the code paths a thunk went through: one tag char
/// per action, with consecutive repeats collapsed into the trailing count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lifecycle {
    pub actions: String,
    pub counts: Vec<u64>,
}

impl Lifecycle {
    pub fn record(&mut self, tag: char) {
        if self.actions.ends_with(tag) {
            if let Some(last) = self.counts.last_mut() {
                *last += 1;
                return;
            }
        }
        self.actions.push(tag);
        self.counts.push(1);
    }
}

/// Where a value currently sits in some live call's argument list.
#[derive(Debug, Clone, Copy)]
pub struct ArgumentLink {
    pub call_id: CallId,
    pub argument_index: usize,
    pub formal_parameter_position: i32,
    pub actual_argument_position: i32,
    pub default_argument: bool,
}

/// Metadata stamped when the last owning argument is torn down; feeds the
/// escaped_arguments record.
#[derive(Debug, Clone)]
pub struct PreviousCall {
    pub call_id: CallId,
    pub function_id: FunctionId,
    pub return_value_kind: ValueKind,
    pub formal_parameter_count: usize,
    pub formal_parameter_position: i32,
    pub actual_argument_position: i32,
    pub default_argument: bool,
}

#[derive(Debug, Clone)]
pub struct DenotedValue {
    id: ValueId,
    thunk: Option<ThunkRef>,
    environment: Option<EnvRef>,
    kind: ValueKind,
    expression_kind: ValueKind,
    value_kind: ValueKind,
    class_name: String,
    scope: Option<FunctionId>,
    local: bool,
    creation_timestamp: Timestamp,

    active: bool,
    argument_count: u32,
    was_argument: bool,
    preforced: bool,
    escaped: bool,
    non_local_return: bool,

    last_argument: Option<ArgumentLink>,
    previous_call: Option<PreviousCall>,

    s3_dispatch_count: u64,
    s4_dispatch_count: u64,

    before_escape_events: EventCounts,
    after_escape_events: EventCounts,
    before_escape_scope: ScopeEffectCounts,
    after_escape_scope: ScopeEffectCounts,

    execution_time: u64,
    eval_depth: EvalDepth,
    lifecycle: Lifecycle,
}

impl DenotedValue {
    /// Shadow a lazy thunk. `preforced_value_kind` is the memoized value's
    /// kind when the host had already materialized the thunk before the
    /// tracer observed it.
    pub fn thunk(
        id: ValueId,
        thunk: ThunkRef,
        environment: EnvRef,
        expression_kind: ValueKind,
        preforced_value_kind: Option<ValueKind>,
        local: bool,
        creation_timestamp: Timestamp,
    ) -> Self {
        let mut value = Self::raw(id, ValueKind::Thunk, creation_timestamp);
        value.thunk = Some(thunk);
        value.environment = Some(environment);
        value.expression_kind = expression_kind;
        value.local = local;
        if let Some(kind) = preforced_value_kind {
            value.preforced = true;
            value.value_kind = kind;
        }
        value.lifecycle.record('C');
        value
    }

    /// Wrap an eagerly materialized argument value.
    pub fn eager(id: ValueId, kind: ValueKind, creation_timestamp: Timestamp) -> Self {
        let mut value = Self::raw(id, kind, creation_timestamp);
        value.expression_kind = kind;
        value.value_kind = kind;
        value.lifecycle.record('C');
        value
    }

    fn raw(id: ValueId, kind: ValueKind, creation_timestamp: Timestamp) -> Self {
        Self {
            id,
            thunk: None,
            environment: None,
            kind,
            expression_kind: ValueKind::Unknown,
            value_kind: ValueKind::Unknown,
            class_name: String::new(),
            scope: None,
            local: false,
            creation_timestamp,
            active: false,
            argument_count: 0,
            was_argument: false,
            preforced: false,
            escaped: false,
            non_local_return: false,
            last_argument: None,
            previous_call: None,
            s3_dispatch_count: 0,
            s4_dispatch_count: 0,
            before_escape_events: EventCounts::default(),
            after_escape_events: EventCounts::default(),
            before_escape_scope: ScopeEffectCounts::default(),
            after_escape_scope: ScopeEffectCounts::default(),
            execution_time: 0,
            eval_depth: EvalDepth::default(),
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn thunk_ref(&self) -> Option<ThunkRef> {
        self.thunk
    }

    pub fn is_thunk(&self) -> bool {
        self.kind == ValueKind::Thunk
    }

    pub fn environment(&self) -> Option<EnvRef> {
        self.environment
    }

    /// The runtime type of the denoted value itself (`thunk` for thunks).
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn expression_kind(&self) -> ValueKind {
        self.expression_kind
    }

    pub fn value_kind(&self) -> ValueKind {
        self.value_kind
    }

    pub fn set_value_kind(&mut self, kind: ValueKind) {
        self.value_kind = kind;
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn set_class_name(&mut self, class_name: String) {
        self.class_name = class_name;
    }

    pub fn scope(&self) -> Option<&FunctionId> {
        self.scope.as_ref()
    }

    pub fn set_scope(&mut self, scope: FunctionId) {
        self.scope = Some(scope);
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn creation_timestamp(&self) -> Timestamp {
        self.creation_timestamp
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self) {
        self.active = true;
    }

    pub fn set_inactive(&mut self) {
        self.active = false;
    }

    pub fn is_argument(&self) -> bool {
        self.argument_count > 0
    }

    pub fn was_argument(&self) -> bool {
        self.was_argument
    }

    pub fn is_preforced(&self) -> bool {
        self.preforced
    }

    pub fn has_escaped(&self) -> bool {
        self.escaped
    }

    pub fn does_non_local_return(&self) -> bool {
        self.non_local_return
    }

    pub fn set_non_local_return(&mut self) {
        self.non_local_return = true;
    }

    pub fn last_argument(&self) -> Option<&ArgumentLink> {
        self.last_argument.as_ref()
    }

    pub fn previous_call(&self) -> Option<&PreviousCall> {
        self.previous_call.as_ref()
    }

    /// A live call took a reference to this value.
    pub fn add_argument(&mut self, link: ArgumentLink) {
        self.argument_count += 1;
        self.was_argument = true;
        self.last_argument = Some(link);
    }

    /// A live call released its reference, stamping its summary metadata for
    /// a potential escape record.
    pub fn remove_argument(&mut self, previous: PreviousCall) {
        debug_assert!(self.argument_count > 0);
        self.argument_count = self.argument_count.saturating_sub(1);
        self.previous_call = Some(previous);
    }

    /// Escape transition: the value outlived the call that referenced it and
    /// is being exercised again. Must run before any counter update.
    pub fn check_escape(&mut self) {
        if !self.escaped && self.was_argument && !self.is_argument() {
            self.escaped = true;
        }
    }

    fn events_mut(&mut self) -> &mut EventCounts {
        if self.escaped {
            &mut self.after_escape_events
        } else {
            &mut self.before_escape_events
        }
    }

    fn scope_mut(&mut self) -> &mut ScopeEffectCounts {
        if self.escaped {
            &mut self.after_escape_scope
        } else {
            &mut self.before_escape_scope
        }
    }

    pub fn force(&mut self) {
        self.check_escape();
        self.events_mut().force += 1;
        self.lifecycle.record('F');
    }

    pub fn metaprogram(&mut self) {
        self.check_escape();
        self.events_mut().metaprogram += 1;
        self.lifecycle.record('M');
    }

    pub fn lookup_value(&mut self) {
        self.check_escape();
        self.events_mut().value_lookup += 1;
        self.lifecycle.record('V');
    }

    pub fn assign_value(&mut self) {
        self.check_escape();
        self.events_mut().value_assign += 1;
        self.lifecycle.record('A');
    }

    pub fn lookup_expression(&mut self) {
        self.check_escape();
        self.events_mut().expression_lookup += 1;
        self.lifecycle.record('X');
    }

    pub fn assign_expression(&mut self) {
        self.check_escape();
        self.events_mut().expression_assign += 1;
        self.lifecycle.record('W');
    }

    pub fn lookup_environment(&mut self) {
        self.check_escape();
        self.events_mut().environment_lookup += 1;
        self.lifecycle.record('N');
    }

    pub fn assign_environment(&mut self) {
        self.check_escape();
        self.events_mut().environment_assign += 1;
        self.lifecycle.record('G');
    }

    pub fn dispatch_s3(&mut self) {
        self.s3_dispatch_count += 1;
    }

    pub fn dispatch_s4(&mut self) {
        self.s4_dispatch_count += 1;
    }

    pub fn set_self_scope_mutation(&mut self, direct: bool) {
        self.scope_mut().self_mutation.bump(direct);
    }

    pub fn set_lexical_scope_mutation(&mut self, direct: bool) {
        self.scope_mut().lexical_mutation.bump(direct);
    }

    pub fn set_non_lexical_scope_mutation(&mut self, direct: bool) {
        self.scope_mut().non_lexical_mutation.bump(direct);
    }

    pub fn set_self_scope_observation(&mut self, direct: bool) {
        self.scope_mut().self_observation.bump(direct);
    }

    pub fn set_lexical_scope_observation(&mut self, direct: bool) {
        self.scope_mut().lexical_observation.bump(direct);
    }

    pub fn set_non_lexical_scope_observation(&mut self, direct: bool) {
        self.scope_mut().non_lexical_observation.bump(direct);
    }

    pub fn add_execution_time(&mut self, nanos: u64) {
        self.execution_time += nanos;
    }

    pub fn execution_time(&self) -> u64 {
        self.execution_time
    }

    pub fn eval_depth(&self) -> EvalDepth {
        self.eval_depth
    }

    pub fn set_eval_depth(&mut self, depth: EvalDepth) {
        self.eval_depth = depth;
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn s3_dispatch_count(&self) -> u64 {
        self.s3_dispatch_count
    }

    pub fn s4_dispatch_count(&self) -> u64 {
        self.s4_dispatch_count
    }

    pub fn events_before_escape(&self) -> EventCounts {
        self.before_escape_events
    }

    pub fn events_after_escape(&self) -> EventCounts {
        self.after_escape_events
    }

    pub fn scope_before_escape(&self) -> ScopeEffectCounts {
        self.before_escape_scope
    }

    pub fn scope_after_escape(&self) -> ScopeEffectCounts {
        self.after_escape_scope
    }

    /// Lifetime event totals across both escape phases.
    pub fn event_totals(&self) -> EventCounts {
        let b = self.before_escape_events;
        let a = self.after_escape_events;
        EventCounts {
            force: b.force + a.force,
            metaprogram: b.metaprogram + a.metaprogram,
            value_lookup: b.value_lookup + a.value_lookup,
            value_assign: b.value_assign + a.value_assign,
            expression_lookup: b.expression_lookup + a.expression_lookup,
            expression_assign: b.expression_assign + a.expression_assign,
            environment_lookup: b.environment_lookup + a.environment_lookup,
            environment_assign: b.environment_assign + a.environment_assign,
        }
    }

    /// Lifetime scope-effect totals across both escape phases.
    pub fn scope_totals(&self) -> ScopeEffectCounts {
        let add = |x: ScopeCounts, y: ScopeCounts| ScopeCounts {
            direct: x.direct + y.direct,
            indirect: x.indirect + y.indirect,
        };
        let b = self.before_escape_scope;
        let a = self.after_escape_scope;
        ScopeEffectCounts {
            self_mutation: add(b.self_mutation, a.self_mutation),
            lexical_mutation: add(b.lexical_mutation, a.lexical_mutation),
            non_lexical_mutation: add(b.non_lexical_mutation, a.non_lexical_mutation),
            self_observation: add(b.self_observation, a.self_observation),
            lexical_observation: add(b.lexical_observation, a.lexical_observation),
            non_lexical_observation: add(b.non_lexical_observation, a.non_lexical_observation),
        }
    }

    pub fn force_count(&self) -> u64 {
        self.before_escape_events.force + self.after_escape_events.force
    }
}
