//! Tracer state: the bookkeeping engine
//!
//! `TracerState` owns every shadow registry and the execution-context stack,
//! and implements the walks that attribute side effects and evaluation depth
//! to enclosing thunks. Probe-level entry points live in `probes.rs`; this
//! module is the state they drive.
//!
//! Denoted values live in an arena map. The thunk registry and live call
//! arguments hold ids into it; the `active`/`is_argument` flag pair decides
//! which side removes the entry, so a value is freed exactly once no matter
//! which owner lets go last.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::call::{count_sequence_to_string, position_sequence_to_string, Argument, Call};
use crate::config::TracerConfig;
use crate::context::{ExecutionContext, ExecutionContextStack};
use crate::environment::Environment;
use crate::function::{CallSignature, Function};
use crate::host::{
    ArgBinding, Binding, EnvRef, FunRef, FunctionKind, HostRuntime, ThunkRef, ValueKind, DOTS_NAME,
};
use crate::ids::{CallId, EnvId, IdSource, Timestamp, ValueId, VarId};
use crate::sinks::TraceSinks;
use crate::table::Cell;
use crate::timer::ExecutionTimer;
use crate::trace::TraceLog;
use crate::value::{
    ArgumentLink, DenotedValue, EvalDepth, Lifecycle, PreviousCall, ESCAPED_EVAL_DEPTH,
};

/// Variable identity plus the modification timestamp the attribution walk
/// needs, copied out of the registry to keep borrows short.
#[derive(Debug, Clone, Copy)]
pub struct VariableSnapshot {
    pub env_id: EnvId,
    pub var_id: VarId,
    pub modification_timestamp: Option<Timestamp>,
}

pub struct TracerState<H: HostRuntime> {
    host: H,
    config: TracerConfig,
    sinks: TraceSinks,
    pub(crate) trace: TraceLog,
    pub(crate) ids: IdSource,
    pub(crate) stack: ExecutionContextStack,
    timer: ExecutionTimer,

    environments: HashMap<EnvRef, Environment>,
    values: HashMap<ValueId, DenotedValue>,
    thunk_index: HashMap<ThunkRef, ValueId>,
    calls: HashMap<CallId, Call>,
    functions: HashMap<FunRef, Function>,
    serialized_functions: HashSet<String>,

    object_counts: BTreeMap<ValueKind, u64>,
    lifecycle_summary: Vec<(Lifecycle, u64)>,
}

impl<H: HostRuntime> TracerState<H> {
    pub fn new(host: H, config: TracerConfig) -> Result<Self> {
        let sinks = TraceSinks::open(&config)?;
        let trace = TraceLog::open(&config).with_context(|| {
            format!(
                "failed to open raw trace stream {}",
                config.trace_filepath.display()
            )
        })?;
        Ok(Self {
            host,
            config,
            sinks,
            trace,
            ids: IdSource::new(),
            stack: ExecutionContextStack::new(),
            timer: ExecutionTimer::new(),
            environments: HashMap::new(),
            values: HashMap::new(),
            thunk_index: HashMap::new(),
            calls: HashMap::new(),
            functions: HashMap::new(),
            serialized_functions: HashSet::new(),
            object_counts: BTreeMap::new(),
            lifecycle_summary: Vec::new(),
        })
    }

    /// Write the CONFIGURATION side file. Call once before the first probe.
    pub fn initialize(&self) -> Result<()> {
        self.config
            .write_configuration(&self.config.output_dirpath)
            .context("failed to write CONFIGURATION")
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn stack(&self) -> &ExecutionContextStack {
        &self.stack
    }

    pub fn value(&self, id: ValueId) -> Option<&DenotedValue> {
        self.values.get(&id)
    }

    pub fn call(&self, id: CallId) -> Option<&Call> {
        self.calls.get(&id)
    }

    pub fn thunk_value_id(&self, thunk: ThunkRef) -> Option<ValueId> {
        self.thunk_index.get(&thunk).copied()
    }

    pub fn function(&self, op: FunRef) -> Option<&Function> {
        self.functions.get(&op)
    }

    /* ---------------------------------------------------------------------
     * probe timing
     * ------------------------------------------------------------------- */

    /// First action of every probe: stop the host timer, charge the elapsed
    /// time to every thunk currently on the stack, advance the logical clock.
    pub fn enter_probe(&mut self) {
        let elapsed = self.timer.pause();
        if elapsed > 0 {
            for i in 0..self.stack.len() {
                if let Some(ExecutionContext::Thunk(id)) = self.stack.get(i) {
                    if let Some(value) = self.values.get_mut(&id) {
                        value.add_execution_time(elapsed);
                    }
                }
            }
        }
        self.ids.tick();
    }

    /// Last action of every probe: hand the clock back to the host.
    pub fn exit_probe(&mut self) {
        self.timer.resume();
    }

    /* ---------------------------------------------------------------------
     * environments and variables
     * ------------------------------------------------------------------- */

    pub fn lookup_environment(&mut self, env: EnvRef) -> &mut Environment {
        let ids = &mut self.ids;
        self.environments
            .entry(env)
            .or_insert_with(|| Environment::new(ids.next_environment_id()))
    }

    pub fn remove_environment(&mut self, env: EnvRef) {
        self.environments.remove(&env);
    }

    /// Bind `name` to a fresh variable identity; redefinition overwrites.
    pub fn define_variable(&mut self, env: EnvRef, name: &str) -> VariableSnapshot {
        let now = self.ids.now();
        let var_id = self.ids.next_variable_id();
        let shadow = self.lookup_environment(env);
        let env_id = shadow.id();
        shadow.define(name, var_id, now);
        VariableSnapshot {
            env_id,
            var_id,
            modification_timestamp: None,
        }
    }

    /// Look a variable up. The flags control whether a missing environment
    /// or variable is created; a missing entity that may not be created
    /// yields `None`. The returned snapshot carries the current modification
    /// timestamp.
    pub fn lookup_variable(
        &mut self,
        env: EnvRef,
        name: &str,
        create_environment: bool,
        create_variable: bool,
    ) -> Option<VariableSnapshot> {
        if !create_environment && !self.environments.contains_key(&env) {
            return None;
        }
        let now = self.ids.now();
        let env_id = self.lookup_environment(env).id();
        let exists = self
            .environments
            .get(&env)
            .map_or(false, |shadow| shadow.exists(name));
        if !exists {
            if !create_variable {
                return None;
            }
            let var_id = self.ids.next_variable_id();
            if let Some(shadow) = self.environments.get_mut(&env) {
                shadow.define(name, var_id, now);
            }
        }
        let variable = self.environments.get(&env)?.lookup(name)?;
        Some(VariableSnapshot {
            env_id,
            var_id: variable.id(),
            modification_timestamp: variable.modification_timestamp(),
        })
    }

    /// Record an assignment: the returned snapshot carries the timestamp the
    /// variable had *before* this write, which is what the creator walk
    /// compares against.
    pub fn update_variable(&mut self, env: EnvRef, name: &str) -> VariableSnapshot {
        let snapshot = match self.lookup_variable(env, name, true, true) {
            Some(snapshot) => snapshot,
            // unreachable with both create flags set; keep the probe total
            None => VariableSnapshot {
                env_id: 0,
                var_id: 0,
                modification_timestamp: None,
            },
        };
        let now = self.ids.now();
        if let Some(variable) = self
            .environments
            .get_mut(&env)
            .and_then(|shadow| shadow.lookup_mut(name))
        {
            variable.set_modification_timestamp(now);
        }
        snapshot
    }

    /// Detach a variable; missing bindings are a no-op.
    pub fn remove_variable(&mut self, env: EnvRef, name: &str) -> Option<VariableSnapshot> {
        let shadow = self.environments.get_mut(&env)?;
        let env_id = shadow.id();
        let variable = shadow.remove(name)?;
        Some(VariableSnapshot {
            env_id,
            var_id: variable.id(),
            modification_timestamp: variable.modification_timestamp(),
        })
    }

    /* ---------------------------------------------------------------------
     * thunk registry
     * ------------------------------------------------------------------- */

    /// Register a freshly created host thunk. A stale entry under the same
    /// handle is detached: freed here if nothing references it, otherwise
    /// left for its argument's teardown.
    pub fn create_thunk(&mut self, thunk: ThunkRef) -> ValueId {
        if let Some(stale) = self.thunk_index.remove(&thunk) {
            let release = match self.values.get_mut(&stale) {
                Some(value) => {
                    value.set_inactive();
                    !value.is_argument()
                }
                None => false,
            };
            if release {
                self.values.remove(&stale);
            }
        }
        self.create_raw_thunk(thunk, true)
    }

    /// Find a thunk's shadow, optionally creating one for handles first seen
    /// here (e.g. thunks born before the tracer attached).
    pub fn lookup_thunk(&mut self, thunk: ThunkRef, create: bool, local: bool) -> Option<ValueId> {
        if let Some(&id) = self.thunk_index.get(&thunk) {
            return Some(id);
        }
        if !create {
            return None;
        }
        Some(self.create_raw_thunk(thunk, local))
    }

    fn lookup_or_create_thunk(&mut self, thunk: ThunkRef, local: bool) -> ValueId {
        if let Some(&id) = self.thunk_index.get(&thunk) {
            id
        } else {
            self.create_raw_thunk(thunk, local)
        }
    }

    fn create_raw_thunk(&mut self, thunk: ThunkRef, local: bool) -> ValueId {
        let id = self.ids.next_value_id();
        let env = self.host.thunk_env(thunk);
        self.lookup_environment(env);
        let expression_kind = self.host.thunk_expression_kind(thunk);
        let preforced = self
            .host
            .thunk_value(thunk)
            .map(|value| self.host.value_kind(value));
        let mut value = DenotedValue::thunk(
            id,
            thunk,
            env,
            expression_kind,
            preforced,
            local,
            self.ids.now(),
        );
        value.set_active();
        self.values.insert(id, value);
        self.set_scope(id);
        self.thunk_index.insert(thunk, id);
        id
    }

    /// Host released the thunk: destroy through the registry side.
    pub fn remove_thunk(&mut self, thunk: ThunkRef) -> Result<()> {
        if let Some(id) = self.thunk_index.remove(&thunk) {
            self.destroy_value(id)?;
        }
        Ok(())
    }

    /// Registry-side teardown: emit the per-thunk rows, fold the lifecycle
    /// fingerprint, and free unless a live call still holds the value.
    fn destroy_value(&mut self, id: ValueId) -> Result<()> {
        let (row, escape_row, lifecycle, still_argument) = match self.values.get_mut(&id) {
            None => return Ok(()),
            Some(value) => {
                value.set_inactive();
                (
                    promise_row(value),
                    value.has_escaped().then(|| escaped_argument_row(value)),
                    value.lifecycle().clone(),
                    value.is_argument(),
                )
            }
        };

        self.sinks.promises.write_row(&row)?;
        self.summarize_lifecycle(lifecycle);
        if let Some(escape_row) = escape_row {
            self.sinks.escaped_arguments.write_row(&escape_row)?;
        }
        if !still_argument {
            self.values.remove(&id);
        }
        Ok(())
    }

    /// Innermost-closure scope assignment. The walk deliberately overwrites
    /// at every call frame until the first closure breaks it; callers rely on
    /// this exact order.
    fn set_scope(&mut self, id: ValueId) {
        let mut scope = None;
        for i in (0..self.stack.len()).rev() {
            let Some(frame) = self.stack.get(i) else {
                continue;
            };
            if let Some(call_id) = frame.call_id() {
                if let Some(call) = self.calls.get(&call_id) {
                    scope = Some(call.function_id().clone());
                }
            }
            if frame.is_closure() {
                break;
            }
        }
        if let Some(scope) = scope {
            if let Some(value) = self.values.get_mut(&id) {
                value.set_scope(scope);
            }
        }
    }

    /* ---------------------------------------------------------------------
     * calls and arguments
     * ------------------------------------------------------------------- */

    /// Intern the function, mint a call, and walk the callee frame for
    /// closure arguments. Builtins and specials record the host's
    /// argument-evaluation code instead of a per-argument walk.
    pub fn create_call(&mut self, op: FunRef, name: &str, rho: EnvRef) -> CallId {
        let (function_id, kind, formals) = {
            let function = self.lookup_function(op);
            function.record_name(name);
            (
                function.id().clone(),
                function.kind(),
                function.formal_parameters().to_vec(),
            )
        };
        self.lookup_environment(rho);

        let call_id = self.ids.next_call_id();
        let mut call = Call::new(call_id, op, function_id, kind, name, formals.len(), rho);

        if kind == FunctionKind::Closure {
            self.process_closure_arguments(&mut call, &formals);
        } else {
            call.set_force_order(self.host.builtin_force_order(op));
        }

        if self.config.verbose {
            debug!(call_id, name, kind = kind.as_str(), "call created");
        }
        self.calls.insert(call_id, call);
        call_id
    }

    fn process_closure_arguments(&mut self, call: &mut Call, formals: &[String]) {
        let rho = call.environment();
        let mut actual_position: i32 = -1;
        for (formal_position, name) in formals.iter().enumerate() {
            match self.host.lookup(rho, name) {
                Binding::Dots(elements) => {
                    for element in elements {
                        actual_position += 1;
                        self.process_closure_argument(
                            call,
                            formal_position as i32,
                            actual_position,
                            element,
                            true,
                        );
                    }
                }
                Binding::Single(binding) => {
                    actual_position += 1;
                    self.process_closure_argument(
                        call,
                        formal_position as i32,
                        actual_position,
                        binding,
                        name == DOTS_NAME,
                    );
                }
            }
        }
    }

    fn process_closure_argument(
        &mut self,
        call: &mut Call,
        formal_parameter_position: i32,
        actual_argument_position: i32,
        binding: ArgBinding,
        dot_dot_dot: bool,
    ) {
        let value_id = match binding {
            ArgBinding::Thunk(thunk) => self.lookup_or_create_thunk(thunk, false),
            ArgBinding::Value(value) => {
                let kind = self.host.value_kind(value);
                self.new_eager_value(kind)
            }
            ArgBinding::Missing => self.new_eager_value(ValueKind::Missing),
        };

        let mut default_argument = true;
        if let Some(value) = self.values.get(&value_id) {
            if value.is_thunk() {
                default_argument = value.environment() == Some(call.environment());
            }
        }

        let argument = Argument::new(
            formal_parameter_position,
            actual_argument_position,
            default_argument,
            dot_dot_dot,
            value_id,
        );
        let index = call.add_argument(argument);

        if let Some(value) = self.values.get_mut(&value_id) {
            value.add_argument(ArgumentLink {
                call_id: call.id(),
                argument_index: index,
                formal_parameter_position,
                actual_argument_position,
                default_argument,
            });
        }
    }

    fn new_eager_value(&mut self, kind: ValueKind) -> ValueId {
        let id = self.ids.next_value_id();
        let value = DenotedValue::eager(id, kind, self.ids.now());
        self.values.insert(id, value);
        self.set_scope(id);
        id
    }

    /// Fold the call into its function's summary, emit one arguments row per
    /// argument, and release or free each argument's value per the two-flag
    /// protocol.
    pub fn destroy_call(&mut self, call_id: CallId) -> Result<()> {
        let Some(call) = self.calls.remove(&call_id) else {
            error!(call_id, "destroying a call that is not registered");
            return Ok(());
        };

        let missing_arguments: Vec<i32> = call
            .arguments()
            .iter()
            .filter(|argument| {
                self.values
                    .get(&argument.value())
                    .map_or(false, |value| value.kind() == ValueKind::Missing)
            })
            .map(Argument::formal_parameter_position)
            .collect();

        let signature = CallSignature {
            force_order: call.force_order().to_vec(),
            missing_arguments,
            return_value_kind: call.return_value_kind(),
        };
        if let Some(function) = self.functions.get_mut(&call.function()) {
            function.add_summary(signature);
        }

        for argument in call.arguments() {
            let value_id = argument.value();
            let row = argument_row(&call, argument, self.values.get(&value_id));
            self.sinks.arguments.write_row(&row)?;

            let release = match self.values.get_mut(&value_id) {
                None => false,
                Some(value) if !value.is_active() => true,
                Some(value) => {
                    value.remove_argument(PreviousCall {
                        call_id: call.id(),
                        function_id: call.function_id().clone(),
                        return_value_kind: call.return_value_kind(),
                        formal_parameter_count: call.formal_parameter_count(),
                        formal_parameter_position: argument.formal_parameter_position(),
                        actual_argument_position: argument.actual_argument_position(),
                        default_argument: argument.is_default_argument(),
                    });
                    false
                }
            };
            if release {
                self.values.remove(&value_id);
            }
        }

        if self.config.verbose {
            debug!(call_id, name = call.name(), "call destroyed");
        }
        Ok(())
    }

    /* ---------------------------------------------------------------------
     * functions
     * ------------------------------------------------------------------- */

    pub fn lookup_function(&mut self, op: FunRef) -> &mut Function {
        let host = &self.host;
        self.functions
            .entry(op)
            .or_insert_with(|| Function::new(host.function_info(op)))
    }

    /// Host released the function object: serialize and drop it.
    pub fn remove_function(&mut self, op: FunRef) -> Result<()> {
        self.serialize_function(op)?;
        self.functions.remove(&op);
        Ok(())
    }

    /// On call entry: if the caller frame is a closure and the current
    /// callee is internal/primitive, the caller is (still) a wrapper.
    pub fn update_wrapper_state(&mut self, call_id: CallId) {
        let Some(caller_frame) = self.stack.peek(1) else {
            return;
        };
        let ExecutionContext::Closure(caller_call) = caller_frame else {
            return;
        };
        let delegates = {
            let Some(call) = self.calls.get(&call_id) else {
                return;
            };
            let Some(callee) = self.functions.get(&call.function()) else {
                return;
            };
            callee.is_internal() || callee.is_primitive()
        };
        let Some(caller_function) = self.calls.get(&caller_call).map(Call::function) else {
            return;
        };
        if let Some(function) = self.functions.get_mut(&caller_function) {
            function.update_wrapper(delegates);
        }
    }

    /// Mark the method's generic name on an S3/S4 dispatch and flag the
    /// dispatching function.
    pub fn mark_dispatch(&mut self, dispatcher: FunRef, method: Option<FunRef>, generic: &str) {
        if let Some(function) = self.functions.get_mut(&dispatcher) {
            function.mark_dispatcher();
        }
        if let Some(method) = method {
            let function = self.lookup_function(method);
            function.set_generic_method_name(generic);
        }
    }

    /* ---------------------------------------------------------------------
     * attribution engine
     * ------------------------------------------------------------------- */

    /// Walk the stack after a write to `env`, attributing the mutation to
    /// enclosing thunks. `prior_modification` is the variable's modification
    /// timestamp from before this write. The innermost qualifying thunk is
    /// tagged direct, outer ones indirect.
    pub fn identify_side_effect_creators(
        &mut self,
        env: EnvRef,
        prior_modification: Option<Timestamp>,
    ) {
        let mut direct = true;
        for i in (0..self.stack.len()).rev() {
            let Some(frame) = self.stack.get(i) else {
                continue;
            };
            match frame {
                ExecutionContext::Closure(call_id) => {
                    // a function writing its own frame is not a side effect
                    if self.calls.get(&call_id).map(Call::environment) == Some(env) {
                        return;
                    }
                }
                ExecutionContext::Thunk(value_id) => {
                    let Some((thunk_env, creation)) = self.values.get(&value_id).and_then(|v| {
                        v.environment().map(|e| (e, v.creation_timestamp()))
                    }) else {
                        continue;
                    };
                    if thunk_env == env {
                        let newer = prior_modification.map_or(false, |ts| creation > ts);
                        if newer {
                            if let Some(value) = self.values.get_mut(&value_id) {
                                value.set_self_scope_mutation(direct);
                            }
                            return;
                        }
                    } else if self.is_parent_environment(env, thunk_env) {
                        if let Some(value) = self.values.get_mut(&value_id) {
                            value.set_lexical_scope_mutation(direct);
                        }
                        direct = false;
                    } else {
                        if let Some(value) = self.values.get_mut(&value_id) {
                            value.set_non_lexical_scope_mutation(direct);
                        }
                        direct = false;
                    }
                }
                ExecutionContext::Builtin(_) | ExecutionContext::Special(_) => {}
            }
        }
    }

    /// Walk the stack after a read from `env`, attributing the observation
    /// to enclosing thunks created before the variable's last write.
    pub fn identify_side_effect_observers(
        &mut self,
        env: EnvRef,
        modification: Option<Timestamp>,
    ) {
        let Some(modification) = modification else {
            // variable never assigned: nothing to observe
            return;
        };
        let mut direct = true;
        for i in (0..self.stack.len()).rev() {
            let Some(frame) = self.stack.get(i) else {
                continue;
            };
            match frame {
                ExecutionContext::Closure(call_id) => {
                    if self.calls.get(&call_id).map(Call::environment) == Some(env) {
                        return;
                    }
                }
                ExecutionContext::Thunk(value_id) => {
                    let Some((thunk_env, creation)) = self.values.get(&value_id).and_then(|v| {
                        v.environment().map(|e| (e, v.creation_timestamp()))
                    }) else {
                        continue;
                    };
                    if thunk_env == env {
                        if creation < modification {
                            if let Some(value) = self.values.get_mut(&value_id) {
                                value.set_self_scope_observation(direct);
                            }
                            return;
                        }
                    } else if self.is_parent_environment(env, thunk_env) {
                        if let Some(value) = self.values.get_mut(&value_id) {
                            value.set_lexical_scope_observation(direct);
                        }
                        direct = false;
                    } else {
                        if let Some(value) = self.values.get_mut(&value_id) {
                            value.set_non_lexical_scope_observation(direct);
                        }
                        direct = false;
                    }
                }
                ExecutionContext::Builtin(_) | ExecutionContext::Special(_) => {}
            }
        }
    }

    /// Is `env_a` on `env_b`'s enclosure chain? An environment is not its
    /// own parent.
    pub fn is_parent_environment(&self, env_a: EnvRef, env_b: EnvRef) -> bool {
        if env_a == env_b {
            return false;
        }
        let mut cursor = self.host.parent_env(env_b);
        while let Some(env) = cursor {
            if env == env_a {
                return true;
            }
            cursor = self.host.parent_env(env);
        }
        false
    }

    /// Stack-shape snapshot relative to `call`. `None` means the call is no
    /// longer on the stack: the forced thunk escaped it.
    pub fn evaluation_depth(&self, call: CallId) -> Option<EvalDepth> {
        let mut depth = EvalDepth {
            call_depth: 0,
            promise_depth: 0,
            nested_promise_depth: 0,
            forcing_actual_argument_position: -1,
        };
        let mut nesting = true;
        for i in (0..self.stack.len()).rev() {
            let Some(frame) = self.stack.get(i) else {
                continue;
            };
            match frame {
                ExecutionContext::Closure(call_id) => {
                    nesting = false;
                    if call_id == call {
                        return Some(depth);
                    }
                    depth.call_depth += 1;
                }
                ExecutionContext::Thunk(value_id) => {
                    depth.promise_depth += 1;
                    if nesting {
                        depth.nested_promise_depth += 1;
                    }
                    if depth.forcing_actual_argument_position == -1 {
                        if let Some(value) = self.values.get(&value_id) {
                            if value.is_argument() {
                                if let Some(link) = value.last_argument() {
                                    if link.call_id == call {
                                        depth.forcing_actual_argument_position =
                                            link.actual_argument_position;
                                    }
                                }
                            }
                        }
                    }
                }
                ExecutionContext::Builtin(_) | ExecutionContext::Special(_) => {}
            }
        }
        None
    }

    /* ---------------------------------------------------------------------
     * per-event bookkeeping shared by probes
     * ------------------------------------------------------------------- */

    /// Where a value currently sits as an argument, plus whether the event
    /// reaching it is direct (no intervening closure between the event and
    /// the argument's call).
    pub(crate) fn argument_attribution(&self, id: ValueId) -> Option<(ArgumentLink, bool)> {
        let value = self.values.get(&id)?;
        if !value.is_argument() {
            return None;
        }
        let link = *value.last_argument()?;
        let direct = self
            .evaluation_depth(link.call_id)
            .map_or(false, |depth| depth.call_depth == 0);
        Some((link, direct))
    }

    /// Force-entry bookkeeping: eval-depth snapshot on first force,
    /// per-argument force attribution, force-order recording, the counter
    /// bump, and the context push.
    pub(crate) fn force_thunk(&mut self, id: ValueId) {
        let (first_force, link) = match self.values.get(&id) {
            Some(value) => (
                value.force_count() == 0,
                value
                    .is_argument()
                    .then(|| value.last_argument().copied())
                    .flatten(),
            ),
            None => (false, None),
        };

        if let Some(link) = link {
            let depth = self.evaluation_depth(link.call_id);
            if first_force {
                if let Some(value) = self.values.get_mut(&id) {
                    value.set_eval_depth(depth.unwrap_or(ESCAPED_EVAL_DEPTH));
                }
            }
            if let Some(depth) = depth {
                let direct = depth.call_depth == 0;
                if let Some(call) = self.calls.get_mut(&link.call_id) {
                    if let Some(argument) = call.argument_mut(link.argument_index) {
                        argument.record_force(direct, depth.forcing_actual_argument_position);
                    }
                    if first_force {
                        call.add_to_force_order(link.formal_parameter_position);
                    }
                }
            }
        }

        if let Some(value) = self.values.get_mut(&id) {
            value.force();
        }
        self.stack.push(ExecutionContext::Thunk(id));
    }

    pub(crate) fn value_mut(&mut self, id: ValueId) -> Option<&mut DenotedValue> {
        self.values.get_mut(&id)
    }

    pub(crate) fn set_call_return_kind(&mut self, call_id: CallId, kind: ValueKind) {
        if let Some(call) = self.calls.get_mut(&call_id) {
            call.set_return_value_kind(kind);
        }
    }

    pub(crate) fn stamp_argument_lookup(&mut self, id: ValueId) {
        if let Some((link, direct)) = self.argument_attribution(id) {
            if let Some(call) = self.calls.get_mut(&link.call_id) {
                if let Some(argument) = call.argument_mut(link.argument_index) {
                    argument.record_lookup(direct);
                }
            }
        }
    }

    pub(crate) fn stamp_argument_metaprogram(&mut self, id: ValueId) {
        if let Some((link, direct)) = self.argument_attribution(id) {
            if let Some(call) = self.calls.get_mut(&link.call_id) {
                if let Some(argument) = call.argument_mut(link.argument_index) {
                    argument.record_metaprogram(direct);
                }
            }
        }
    }

    pub(crate) fn stamp_argument_dispatch(&mut self, id: ValueId, s4: bool) {
        if let Some(value) = self.values.get_mut(&id) {
            if s4 {
                value.dispatch_s4();
            } else {
                value.dispatch_s3();
            }
        }
        if let Some(link) = self.values.get(&id).and_then(|v| v.last_argument().copied()) {
            if let Some(call) = self.calls.get_mut(&link.call_id) {
                if let Some(argument) = call.argument_mut(link.argument_index) {
                    if s4 {
                        argument.set_s4_dispatch();
                    } else {
                        argument.set_s3_dispatch();
                    }
                }
            }
        }
    }

    /// Eagerly pop frames above `depth` on a non-local return. Popped thunk
    /// frames and their argument records are stamped; popped calls are torn
    /// down with a jump return type.
    pub(crate) fn unwind_stack(&mut self, depth: usize) -> Result<usize> {
        let popped = self.stack.unwind_to(depth);
        let count = popped.len();
        for frame in popped {
            match frame {
                ExecutionContext::Thunk(value_id) => {
                    if let Some(value) = self.values.get_mut(&value_id) {
                        value.set_non_local_return();
                    }
                    if let Some(link) = self
                        .values
                        .get(&value_id)
                        .and_then(|v| v.last_argument().copied())
                    {
                        if let Some(call) = self.calls.get_mut(&link.call_id) {
                            if let Some(argument) = call.argument_mut(link.argument_index) {
                                argument.set_non_local_return();
                            }
                        }
                    }
                }
                ExecutionContext::Closure(call_id)
                | ExecutionContext::Builtin(call_id)
                | ExecutionContext::Special(call_id) => {
                    if let Some(call) = self.calls.get_mut(&call_id) {
                        call.set_non_local_return();
                        call.set_return_value_kind(ValueKind::Jump);
                    }
                    self.destroy_call(call_id)?;
                }
            }
        }
        Ok(count)
    }

    /* ---------------------------------------------------------------------
     * aggregation
     * ------------------------------------------------------------------- */

    pub fn increment_object_count(&mut self, kind: ValueKind) {
        *self.object_counts.entry(kind).or_insert(0) += 1;
    }

    fn summarize_lifecycle(&mut self, lifecycle: Lifecycle) {
        for (seen, count) in &mut self.lifecycle_summary {
            if *seen == lifecycle {
                *count += 1;
                return;
            }
        }
        self.lifecycle_summary.push((lifecycle, 1));
    }

    fn serialize_function(&mut self, op: FunRef) -> Result<()> {
        let Some(function) = self.functions.get(&op) else {
            return Ok(());
        };
        for summary in function.summaries() {
            self.sinks.call_summary.write_row(&[
                Cell::from(function.id().as_str()),
                Cell::from(function.kind().as_str()),
                Cell::from(function.formal_parameter_count()),
                Cell::from(function.is_wrapper()),
                Cell::from(function.qualified_names()),
                Cell::from(function.generic_method_name()),
                Cell::from(function.is_dispatcher()),
                Cell::from(position_sequence_to_string(&summary.signature.force_order)),
                Cell::from(position_sequence_to_string(
                    &summary.signature.missing_arguments,
                )),
                Cell::from(summary.signature.return_value_kind.as_str()),
                Cell::from(summary.call_count),
            ])?;
        }
        if self.serialized_functions.insert(function.id().clone()) {
            self.sinks.function_definition.write_row(&[
                Cell::from(function.id().as_str()),
                Cell::from(function.is_byte_compiled()),
                Cell::from(function.definition()),
            ])?;
        }
        Ok(())
    }

    fn serialize_object_counts(&mut self) -> Result<()> {
        for (kind, count) in &self.object_counts {
            if *count > 0 {
                self.sinks
                    .object_count
                    .write_row(&[Cell::from(kind.as_str()), Cell::from(*count)])?;
            }
        }
        Ok(())
    }

    fn serialize_lifecycle_summary(&mut self) -> Result<()> {
        for (lifecycle, count) in &self.lifecycle_summary {
            self.sinks.promise_lifecycle.write_row(&[
                Cell::from(lifecycle.actions.as_str()),
                Cell::from(count_sequence_to_string(&lifecycle.counts)),
                Cell::from(*count),
            ])?;
        }
        Ok(())
    }

    /* ---------------------------------------------------------------------
     * teardown
     * ------------------------------------------------------------------- */

    /// Drain all remaining state and write the terminal sentinel. Runs to
    /// completion in both success and failure cases; any emission error also
    /// turns the sentinel into ERROR.
    pub fn cleanup(mut self, error: bool) -> Result<()> {
        let drain_result = self.drain_remaining();

        let stack_violation = !self.stack.is_empty();
        if stack_violation {
            error!(
                frames = self.stack.len(),
                "execution-context stack not empty at tracer exit"
            );
        }

        self.trace.finish();

        let TracerState { sinks, config, .. } = self;
        let finish_result = sinks.finish();

        let had_error =
            error || stack_violation || drain_result.is_err() || finish_result.is_err();
        let sentinel = if had_error { "ERROR" } else { "NOERROR" };
        let sentinel_result = fs::write(config.output_dirpath.join(sentinel), sentinel)
            .with_context(|| format!("failed to write {} sentinel", sentinel));

        drain_result.and(finish_result).and(sentinel_result)
    }

    fn drain_remaining(&mut self) -> Result<()> {
        let mut pending: Vec<ValueId> = self.thunk_index.values().copied().collect();
        pending.sort_unstable();
        self.thunk_index.clear();
        for id in pending {
            self.destroy_value(id)?;
        }

        let mut functions: Vec<FunRef> = self.functions.keys().copied().collect();
        functions.sort_unstable_by_key(|op| op.0);
        for op in functions {
            self.serialize_function(op)?;
        }
        self.functions.clear();

        self.serialize_object_counts()?;
        self.serialize_lifecycle_summary()?;
        Ok(())
    }
}

/* -------------------------------------------------------------------------
 * row builders
 * ----------------------------------------------------------------------- */

fn argument_row(call: &Call, argument: &Argument, value: Option<&DenotedValue>) -> Vec<Cell> {
    let (value_id, kind, expression_kind, value_kind, preforced) = match value {
        Some(value) => (
            value.id(),
            value.kind(),
            value.expression_kind(),
            value.value_kind(),
            value.is_preforced(),
        ),
        None => (0, ValueKind::Unknown, ValueKind::Unknown, ValueKind::Unknown, false),
    };
    vec![
        Cell::from(call.id()),
        Cell::from(call.function_id().as_str()),
        Cell::from(value_id),
        Cell::from(argument.formal_parameter_position()),
        Cell::from(argument.actual_argument_position()),
        Cell::from(kind.as_str()),
        Cell::from(expression_kind.as_str()),
        Cell::from(value_kind.as_str()),
        Cell::from(argument.is_default_argument()),
        Cell::from(argument.is_dot_dot_dot()),
        Cell::from(preforced),
        Cell::from(argument.is_directly_forced()),
        Cell::from(argument.direct_lookup_count()),
        Cell::from(argument.direct_metaprogram_count()),
        Cell::from(argument.is_indirectly_forced()),
        Cell::from(argument.indirect_lookup_count()),
        Cell::from(argument.indirect_metaprogram_count()),
        Cell::from(argument.used_for_s3_dispatch()),
        Cell::from(argument.used_for_s4_dispatch()),
        Cell::from(argument.forcing_actual_argument_position()),
        Cell::from(argument.does_non_local_return()),
    ]
}

fn promise_row(value: &DenotedValue) -> Vec<Cell> {
    let events = value.event_totals();
    let scope = value.scope_totals();
    let depth = value.eval_depth();
    vec![
        Cell::from(value.id()),
        Cell::from(value.was_argument()),
        Cell::from(value.expression_kind().as_str()),
        Cell::from(value.value_kind().as_str()),
        Cell::from(value.scope().map(String::as_str).unwrap_or("")),
        Cell::from(value.s3_dispatch_count()),
        Cell::from(value.s4_dispatch_count()),
        Cell::from(value.is_preforced()),
        Cell::from(events.force),
        Cell::from(u64::from(depth.call_depth)),
        Cell::from(u64::from(depth.promise_depth)),
        Cell::from(u64::from(depth.nested_promise_depth)),
        Cell::from(events.metaprogram),
        Cell::from(events.value_lookup),
        Cell::from(events.value_assign),
        Cell::from(events.expression_lookup),
        Cell::from(events.expression_assign),
        Cell::from(events.environment_lookup),
        Cell::from(events.environment_assign),
        Cell::from(scope.self_mutation.direct),
        Cell::from(scope.self_mutation.indirect),
        Cell::from(scope.lexical_mutation.direct),
        Cell::from(scope.lexical_mutation.indirect),
        Cell::from(scope.non_lexical_mutation.direct),
        Cell::from(scope.non_lexical_mutation.indirect),
        Cell::from(scope.self_observation.direct),
        Cell::from(scope.self_observation.indirect),
        Cell::from(scope.lexical_observation.direct),
        Cell::from(scope.lexical_observation.indirect),
        Cell::from(scope.non_lexical_observation.direct),
        Cell::from(scope.non_lexical_observation.indirect),
        Cell::from(value.execution_time()),
    ]
}

fn escaped_argument_row(value: &DenotedValue) -> Vec<Cell> {
    let previous = value.previous_call();
    let (call_id, function_id, return_kind, formal_count, formal_position, actual_position, default) =
        match previous {
            Some(previous) => (
                previous.call_id,
                previous.function_id.as_str(),
                previous.return_value_kind,
                previous.formal_parameter_count,
                previous.formal_parameter_position,
                previous.actual_argument_position,
                previous.default_argument,
            ),
            None => (0, "", ValueKind::Unknown, 0, -1, -1, false),
        };
    let before = value.events_before_escape();
    let after = value.events_after_escape();
    let before_scope = value.scope_before_escape();
    let after_scope = value.scope_after_escape();
    let depth = value.eval_depth();

    vec![
        Cell::from(call_id),
        Cell::from(function_id),
        Cell::from(return_kind.as_str()),
        Cell::from(formal_count),
        Cell::from(formal_position),
        Cell::from(actual_position),
        Cell::from(value.id()),
        Cell::from(value.class_name()),
        Cell::from(value.s3_dispatch_count()),
        Cell::from(value.s4_dispatch_count()),
        Cell::from(value.kind().as_str()),
        Cell::from(value.expression_kind().as_str()),
        Cell::from(value.value_kind().as_str()),
        Cell::from(default),
        Cell::from(value.does_non_local_return()),
        Cell::from(value.has_escaped()),
        Cell::from(u64::from(depth.call_depth)),
        Cell::from(u64::from(depth.promise_depth)),
        Cell::from(u64::from(depth.nested_promise_depth)),
        Cell::from(depth.forcing_actual_argument_position),
        Cell::from(value.is_preforced()),
        Cell::from(before.force),
        Cell::from(before.metaprogram),
        Cell::from(before.value_lookup),
        Cell::from(before.value_assign),
        Cell::from(before.expression_lookup),
        Cell::from(before.expression_assign),
        Cell::from(before.environment_lookup),
        Cell::from(before.environment_assign),
        Cell::from(after.force),
        Cell::from(after.metaprogram),
        Cell::from(after.value_lookup),
        Cell::from(after.value_assign),
        Cell::from(after.expression_lookup),
        Cell::from(after.expression_assign),
        Cell::from(after.environment_lookup),
        Cell::from(after.environment_assign),
        Cell::from(before_scope.self_mutation.direct),
        Cell::from(before_scope.self_mutation.indirect),
        Cell::from(before_scope.lexical_mutation.direct),
        Cell::from(before_scope.lexical_mutation.indirect),
        Cell::from(before_scope.non_lexical_mutation.direct),
        Cell::from(before_scope.non_lexical_mutation.indirect),
        Cell::from(before_scope.self_observation.direct),
        Cell::from(before_scope.self_observation.indirect),
        Cell::from(before_scope.lexical_observation.direct),
        Cell::from(before_scope.lexical_observation.indirect),
        Cell::from(before_scope.non_lexical_observation.direct),
        Cell::from(before_scope.non_lexical_observation.indirect),
        Cell::from(after_scope.self_mutation.direct),
        Cell::from(after_scope.self_mutation.indirect),
        Cell::from(after_scope.lexical_mutation.direct),
        Cell::from(after_scope.lexical_mutation.indirect),
        Cell::from(after_scope.non_lexical_mutation.direct),
        Cell::from(after_scope.non_lexical_mutation.indirect),
        Cell::from(after_scope.self_observation.direct),
        Cell::from(after_scope.self_observation.indirect),
        Cell::from(after_scope.lexical_observation.direct),
        Cell::from(after_scope.lexical_observation.indirect),
        Cell::from(after_scope.non_lexical_observation.direct),
        Cell::from(after_scope.non_lexical_observation.indirect),
        Cell::from(value.execution_time()),
    ]
}
