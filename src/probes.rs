//! Probe entry points
//!
//! The host glue calls exactly one of these per evaluator event. Every probe
//! pauses the execution timer on entry (charging elapsed host time to the
//! thunks on the stack and advancing the logical clock) and resumes it on
//! exit, so the shadow model never observes its own overhead.

use anyhow::Result;
use tracing::error;

use crate::call::Call;
use crate::context::ExecutionContext;
use crate::host::{EnvRef, FunRef, FunctionKind, HostRuntime, ThunkRef, ValueKind, ValueRef};
use crate::ids::{CallId, ValueId};
use crate::state::TracerState;
use crate::trace::TraceEvent;

/// Which dispatch family an argument value was used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMethod {
    S3,
    S4,
}

impl DispatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMethod::S3 => "S3",
            DispatchMethod::S4 => "S4",
        }
    }
}

impl<H: HostRuntime> TracerState<H> {
    /// Function entry: intern the function, build the call (walking closure
    /// arguments), push its frame, and refresh the caller's wrapper status.
    pub fn probe_function_entry(&mut self, op: FunRef, name: &str, rho: EnvRef) -> CallId {
        self.enter_probe();
        let call_id = self.create_call(op, name, rho);
        let kind = self
            .call(call_id)
            .map(Call::kind)
            .unwrap_or(FunctionKind::Closure);
        let frame = match kind {
            FunctionKind::Closure => ExecutionContext::Closure(call_id),
            FunctionKind::Builtin => ExecutionContext::Builtin(call_id),
            FunctionKind::Special => ExecutionContext::Special(call_id),
        };
        self.stack.push(frame);
        self.update_wrapper_state(call_id);
        if self.trace.is_enabled() {
            let function_id = self
                .call(call_id)
                .map(|call| call.function_id().clone())
                .unwrap_or_default();
            self.trace.record(&TraceEvent::FunctionEntry {
                call_id,
                function_id: &function_id,
                name,
            });
        }
        self.exit_probe();
        call_id
    }

    /// Function exit: pop the frame, stamp the return type, and tear the
    /// call down (emitting its argument rows).
    pub fn probe_function_exit(&mut self, result: Option<ValueRef>) -> Result<()> {
        self.enter_probe();
        let frame = self.stack.pop();
        let return_kind = result
            .map(|value| self.host().value_kind(value))
            .unwrap_or(ValueKind::Unknown);
        let outcome = match frame.and_then(ExecutionContext::call_id) {
            Some(call_id) => {
                self.set_call_return_kind(call_id, return_kind);
                if self.trace.is_enabled() {
                    self.trace.record(&TraceEvent::FunctionExit {
                        call_id,
                        return_type: return_kind.as_str(),
                    });
                }
                self.destroy_call(call_id)
            }
            None => {
                error!("function exit does not match a call frame");
                Ok(())
            }
        };
        self.exit_probe();
        outcome
    }

    /// A thunk was allocated by the host.
    pub fn probe_thunk_created(&mut self, thunk: ThunkRef) -> ValueId {
        self.enter_probe();
        let id = self.create_thunk(thunk);
        if self.trace.is_enabled() {
            self.trace.record(&TraceEvent::ThunkCreated { value_id: id });
        }
        self.exit_probe();
        id
    }

    /// A thunk's evaluation began.
    pub fn probe_force_entry(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            self.force_thunk(id);
            if self.trace.is_enabled() {
                self.trace
                    .record(&TraceEvent::ThunkForceEntry { value_id: id });
            }
        }
        self.exit_probe();
    }

    /// A thunk's evaluation finished with `result`.
    pub fn probe_force_exit(&mut self, thunk: ThunkRef, result: ValueRef) {
        self.enter_probe();
        let id = self.lookup_thunk(thunk, true, false);
        let frame = self.stack.pop();
        match (frame, id) {
            (Some(ExecutionContext::Thunk(popped)), Some(id)) if popped == id => {}
            _ => error!("force exit does not match the top of the context stack"),
        }
        if let Some(id) = id {
            let kind = self.host().value_kind(result);
            let class = self.host().class_of(result);
            if let Some(value) = self.value_mut(id) {
                value.set_value_kind(kind);
                if let Some(class) = class {
                    value.set_class_name(class);
                }
            }
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkForceExit {
                    value_id: id,
                    value_type: kind.as_str(),
                });
            }
        }
        self.exit_probe();
    }

    /// A memoized thunk value was read.
    pub fn probe_value_lookup(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            if let Some(value) = self.value_mut(id) {
                value.lookup_value();
            }
            self.stamp_argument_lookup(id);
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkLookup {
                    value_id: id,
                    component: "value",
                });
            }
        }
        self.exit_probe();
    }

    /// A thunk's memoized value was overwritten without a force.
    pub fn probe_value_assign(&mut self, thunk: ThunkRef, result: ValueRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            let kind = self.host().value_kind(result);
            if let Some(value) = self.value_mut(id) {
                value.assign_value();
                value.set_value_kind(kind);
            }
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkAssign {
                    value_id: id,
                    component: "value",
                });
            }
        }
        self.exit_probe();
    }

    /// A thunk's deferred expression was read reflectively.
    pub fn probe_expression_lookup(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            if let Some(value) = self.value_mut(id) {
                value.lookup_expression();
            }
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkLookup {
                    value_id: id,
                    component: "expression",
                });
            }
        }
        self.exit_probe();
    }

    /// A thunk's deferred expression was replaced.
    pub fn probe_expression_assign(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            if let Some(value) = self.value_mut(id) {
                value.assign_expression();
            }
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkAssign {
                    value_id: id,
                    component: "expression",
                });
            }
        }
        self.exit_probe();
    }

    /// A thunk's evaluation environment was read reflectively.
    pub fn probe_environment_lookup(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            if let Some(value) = self.value_mut(id) {
                value.lookup_environment();
            }
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkLookup {
                    value_id: id,
                    component: "environment",
                });
            }
        }
        self.exit_probe();
    }

    /// A thunk's evaluation environment was replaced.
    pub fn probe_environment_assign(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            if let Some(value) = self.value_mut(id) {
                value.assign_environment();
            }
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ThunkAssign {
                    value_id: id,
                    component: "environment",
                });
            }
        }
        self.exit_probe();
    }

    /// A metaprogramming operation captured the thunk without forcing it.
    pub fn probe_metaprogram(&mut self, thunk: ThunkRef) {
        self.enter_probe();
        if let Some(id) = self.lookup_thunk(thunk, true, false) {
            if let Some(value) = self.value_mut(id) {
                value.metaprogram();
            }
            self.stamp_argument_metaprogram(id);
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::Metaprogram { value_id: id });
            }
        }
        self.exit_probe();
    }

    /// Method dispatch: flag the dispatching function, stamp the generic
    /// name on the method, and count the dispatch against the dispatched-on
    /// value and its argument record.
    pub fn probe_dispatch(
        &mut self,
        method: DispatchMethod,
        dispatcher: FunRef,
        method_function: Option<FunRef>,
        generic: &str,
        object: Option<ThunkRef>,
    ) {
        self.enter_probe();
        self.mark_dispatch(dispatcher, method_function, generic);
        let value_id = object.and_then(|thunk| self.lookup_thunk(thunk, true, false));
        if let Some(id) = value_id {
            self.stamp_argument_dispatch(id, method == DispatchMethod::S4);
        }
        if self.trace.is_enabled() {
            self.trace.record(&TraceEvent::Dispatch {
                method: method.as_str(),
                value_id,
            });
        }
        self.exit_probe();
    }

    /// A variable was defined (fresh identity, even over an existing name).
    pub fn probe_variable_define(&mut self, rho: EnvRef, name: &str) {
        self.enter_probe();
        let snapshot = self.define_variable(rho, name);
        self.identify_side_effect_creators(rho, snapshot.modification_timestamp);
        if self.trace.is_enabled() {
            self.trace.record(&TraceEvent::VariableDefine {
                env_id: snapshot.env_id,
                var_id: snapshot.var_id,
                name,
            });
        }
        self.exit_probe();
    }

    /// A variable was assigned. The creator walk runs against the
    /// modification timestamp from *before* this write.
    pub fn probe_variable_assign(&mut self, rho: EnvRef, name: &str) {
        self.enter_probe();
        let snapshot = self.update_variable(rho, name);
        self.identify_side_effect_creators(rho, snapshot.modification_timestamp);
        if self.trace.is_enabled() {
            self.trace.record(&TraceEvent::VariableAssign {
                env_id: snapshot.env_id,
                var_id: snapshot.var_id,
                name,
            });
        }
        self.exit_probe();
    }

    /// A variable was read.
    pub fn probe_variable_lookup(&mut self, rho: EnvRef, name: &str) {
        self.enter_probe();
        if let Some(snapshot) = self.lookup_variable(rho, name, true, true) {
            self.identify_side_effect_observers(rho, snapshot.modification_timestamp);
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::VariableLookup {
                    env_id: snapshot.env_id,
                    name,
                });
            }
        }
        self.exit_probe();
    }

    /// A variable was removed; unknown bindings are a no-op.
    pub fn probe_variable_remove(&mut self, rho: EnvRef, name: &str) {
        self.enter_probe();
        if let Some(snapshot) = self.remove_variable(rho, name) {
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::VariableRemove {
                    env_id: snapshot.env_id,
                    name,
                });
            }
        }
        self.exit_probe();
    }

    /// The host garbage-collected an environment.
    pub fn probe_environment_removed(&mut self, rho: EnvRef) {
        self.enter_probe();
        self.remove_environment(rho);
        self.exit_probe();
    }

    /// The host garbage-collected a thunk: registry-side teardown.
    pub fn probe_thunk_removed(&mut self, thunk: ThunkRef) -> Result<()> {
        self.enter_probe();
        let result = self.remove_thunk(thunk);
        self.exit_probe();
        result
    }

    /// The host garbage-collected a function object.
    pub fn probe_function_removed(&mut self, op: FunRef) -> Result<()> {
        self.enter_probe();
        let result = self.remove_function(op);
        self.exit_probe();
        result
    }

    /// Host allocation notification, aggregated into the object_count table.
    pub fn probe_allocation(&mut self, kind: ValueKind) {
        self.enter_probe();
        self.increment_object_count(kind);
        if self.trace.is_enabled() {
            self.trace.record(&TraceEvent::Allocation {
                object_type: kind.as_str(),
            });
        }
        self.exit_probe();
    }

    /// Non-local return: the host unwound every frame above `target_depth`.
    /// Unwound calls are torn down eagerly with a jump return type.
    pub fn probe_context_jump(&mut self, target_depth: usize) -> Result<()> {
        self.enter_probe();
        let result = self.unwind_stack(target_depth);
        if let Ok(unwound_frames) = &result {
            if self.trace.is_enabled() {
                self.trace.record(&TraceEvent::ContextJump {
                    unwound_frames: *unwound_frames,
                });
            }
        }
        self.exit_probe();
        result.map(|_| ())
    }
}
