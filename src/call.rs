//! Calls and arguments
//!
//! A `Call` is built on function entry by walking the formals against the
//! callee frame, and destroyed on exit after its rows are emitted. Each
//! `Argument` pairs one formal/actual slot with the denoted value bound
//! there, and carries the per-argument attribution the arguments table
//! reports (direct vs indirect forcing, lookups, metaprogramming, dispatch).

use crate::host::{EnvRef, FunRef, FunctionKind, ValueKind};
use crate::ids::{CallId, FunctionId, ValueId};

#[derive(Debug, Clone)]
pub struct Argument {
    formal_parameter_position: i32,
    actual_argument_position: i32,
    default_argument: bool,
    dot_dot_dot: bool,
    value: ValueId,

    directly_forced: bool,
    indirectly_forced: bool,
    direct_lookup_count: u64,
    indirect_lookup_count: u64,
    direct_metaprogram_count: u64,
    indirect_metaprogram_count: u64,
    s3_dispatch: bool,
    s4_dispatch: bool,
    forcing_actual_argument_position: i32,
    non_local_return: bool,
}

impl Argument {
    pub fn new(
        formal_parameter_position: i32,
        actual_argument_position: i32,
        default_argument: bool,
        dot_dot_dot: bool,
        value: ValueId,
    ) -> Self {
        Self {
            formal_parameter_position,
            actual_argument_position,
            default_argument,
            dot_dot_dot,
            value,
            directly_forced: false,
            indirectly_forced: false,
            direct_lookup_count: 0,
            indirect_lookup_count: 0,
            direct_metaprogram_count: 0,
            indirect_metaprogram_count: 0,
            s3_dispatch: false,
            s4_dispatch: false,
            forcing_actual_argument_position: -1,
            non_local_return: false,
        }
    }

    pub fn formal_parameter_position(&self) -> i32 {
        self.formal_parameter_position
    }

    pub fn actual_argument_position(&self) -> i32 {
        self.actual_argument_position
    }

    pub fn is_default_argument(&self) -> bool {
        self.default_argument
    }

    pub fn is_dot_dot_dot(&self) -> bool {
        self.dot_dot_dot
    }

    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn record_force(&mut self, direct: bool, forcing_position: i32) {
        if direct {
            self.directly_forced = true;
        } else {
            self.indirectly_forced = true;
        }
        if self.forcing_actual_argument_position == -1 {
            self.forcing_actual_argument_position = forcing_position;
        }
    }

    pub fn record_lookup(&mut self, direct: bool) {
        if direct {
            self.direct_lookup_count += 1;
        } else {
            self.indirect_lookup_count += 1;
        }
    }

    pub fn record_metaprogram(&mut self, direct: bool) {
        if direct {
            self.direct_metaprogram_count += 1;
        } else {
            self.indirect_metaprogram_count += 1;
        }
    }

    pub fn set_s3_dispatch(&mut self) {
        self.s3_dispatch = true;
    }

    pub fn set_s4_dispatch(&mut self) {
        self.s4_dispatch = true;
    }

    pub fn set_non_local_return(&mut self) {
        self.non_local_return = true;
    }

    pub fn is_directly_forced(&self) -> bool {
        self.directly_forced
    }

    pub fn is_indirectly_forced(&self) -> bool {
        self.indirectly_forced
    }

    pub fn direct_lookup_count(&self) -> u64 {
        self.direct_lookup_count
    }

    pub fn indirect_lookup_count(&self) -> u64 {
        self.indirect_lookup_count
    }

    pub fn direct_metaprogram_count(&self) -> u64 {
        self.direct_metaprogram_count
    }

    pub fn indirect_metaprogram_count(&self) -> u64 {
        self.indirect_metaprogram_count
    }

    pub fn used_for_s3_dispatch(&self) -> bool {
        self.s3_dispatch
    }

    pub fn used_for_s4_dispatch(&self) -> bool {
        self.s4_dispatch
    }

    pub fn forcing_actual_argument_position(&self) -> i32 {
        self.forcing_actual_argument_position
    }

    pub fn does_non_local_return(&self) -> bool {
        self.non_local_return
    }
}

#[derive(Debug)]
pub struct Call {
    id: CallId,
    function: FunRef,
    function_id: FunctionId,
    kind: FunctionKind,
    name: String,
    formal_parameter_count: usize,
    environment: EnvRef,
    arguments: Vec<Argument>,
    return_value_kind: ValueKind,
    force_order: Vec<i32>,
    non_local_return: bool,
}

impl Call {
    pub fn new(
        id: CallId,
        function: FunRef,
        function_id: FunctionId,
        kind: FunctionKind,
        name: &str,
        formal_parameter_count: usize,
        environment: EnvRef,
    ) -> Self {
        Self {
            id,
            function,
            function_id,
            kind,
            name: name.to_string(),
            formal_parameter_count,
            environment,
            arguments: Vec::new(),
            return_value_kind: ValueKind::Unknown,
            force_order: Vec::new(),
            non_local_return: false,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn function(&self) -> FunRef {
        self.function
    }

    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn formal_parameter_count(&self) -> usize {
        self.formal_parameter_count
    }

    pub fn environment(&self) -> EnvRef {
        self.environment
    }

    pub fn add_argument(&mut self, argument: Argument) -> usize {
        self.arguments.push(argument);
        self.arguments.len() - 1
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn argument_mut(&mut self, index: usize) -> Option<&mut Argument> {
        self.arguments.get_mut(index)
    }

    pub fn return_value_kind(&self) -> ValueKind {
        self.return_value_kind
    }

    pub fn set_return_value_kind(&mut self, kind: ValueKind) {
        self.return_value_kind = kind;
    }

    /// Formal positions in the order their bindings were first forced. For
    /// builtins and specials this is the host's argument-evaluation code.
    pub fn force_order(&self) -> &[i32] {
        &self.force_order
    }

    pub fn add_to_force_order(&mut self, formal_parameter_position: i32) {
        self.force_order.push(formal_parameter_position);
    }

    pub fn set_force_order(&mut self, code: i32) {
        self.force_order = vec![code];
    }

    pub fn does_non_local_return(&self) -> bool {
        self.non_local_return
    }

    pub fn set_non_local_return(&mut self) {
        self.non_local_return = true;
    }
}

/// Render a position sequence the way the tables expect: `|`-separated,
/// empty string for the empty sequence.
pub fn position_sequence_to_string(sequence: &[i32]) -> String {
    sequence
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Render a count sequence (lifecycle fingerprints).
pub fn count_sequence_to_string(sequence: &[u64]) -> String {
    sequence
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_call() -> Call {
        Call::new(
            1,
            FunRef(10),
            "abcd".to_string(),
            FunctionKind::Closure,
            "f",
            2,
            EnvRef(5),
        )
    }

    #[test]
    fn test_argument_force_attribution() {
        let mut arg = Argument::new(0, 0, false, false, 7);
        arg.record_force(true, 1);
        arg.record_force(false, 2);
        assert!(arg.is_directly_forced());
        assert!(arg.is_indirectly_forced());
        // first forcing position wins
        assert_eq!(arg.forcing_actual_argument_position(), 1);
    }

    #[test]
    fn test_argument_lookup_and_metaprogram_counts() {
        let mut arg = Argument::new(0, 0, false, false, 7);
        arg.record_lookup(true);
        arg.record_lookup(true);
        arg.record_lookup(false);
        arg.record_metaprogram(false);
        assert_eq!(arg.direct_lookup_count(), 2);
        assert_eq!(arg.indirect_lookup_count(), 1);
        assert_eq!(arg.direct_metaprogram_count(), 0);
        assert_eq!(arg.indirect_metaprogram_count(), 1);
    }

    #[test]
    fn test_call_accumulates_arguments() {
        let mut call = make_call();
        let i = call.add_argument(Argument::new(0, 0, false, false, 1));
        let j = call.add_argument(Argument::new(1, 1, true, false, 2));
        assert_eq!(i, 0);
        assert_eq!(j, 1);
        assert_eq!(call.arguments().len(), 2);
        call.argument_mut(1).unwrap().set_s3_dispatch();
        assert!(call.arguments()[1].used_for_s3_dispatch());
    }

    #[test]
    fn test_force_order_accumulation() {
        let mut call = make_call();
        call.add_to_force_order(1);
        call.add_to_force_order(0);
        assert_eq!(call.force_order(), &[1, 0]);
        call.set_force_order(12);
        assert_eq!(call.force_order(), &[12]);
    }

    #[test]
    fn test_position_sequence_rendering() {
        assert_eq!(position_sequence_to_string(&[]), "");
        assert_eq!(position_sequence_to_string(&[2]), "2");
        assert_eq!(position_sequence_to_string(&[0, 2, 1]), "0|2|1");
        assert_eq!(count_sequence_to_string(&[1, 3]), "1|3");
    }
}
