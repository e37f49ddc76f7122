//! Shared test fixtures: a scriptable host runtime and table readers.
#![allow(dead_code)] // not every suite uses every fixture

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use perezoso::{
    ArgBinding, Binding, EnvRef, FunRef, FunctionInfo, FunctionKind, HostRuntime, ThunkRef,
    ValueKind, ValueRef,
};

#[derive(Default)]
struct World {
    env_parents: HashMap<EnvRef, Option<EnvRef>>,
    bindings: HashMap<(EnvRef, String), Binding>,
    thunk_envs: HashMap<ThunkRef, EnvRef>,
    thunk_expressions: HashMap<ThunkRef, ValueKind>,
    thunk_values: HashMap<ThunkRef, ValueRef>,
    functions: HashMap<FunRef, FunctionInfo>,
    force_orders: HashMap<FunRef, i32>,
    value_kinds: HashMap<ValueRef, ValueKind>,
    value_classes: HashMap<ValueRef, String>,
}

/// In-memory evaluator model the tests drive probes against.
#[derive(Clone, Default)]
pub struct ScriptedHost {
    world: Rc<RefCell<World>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_environment(&self, env: EnvRef, parent: Option<EnvRef>) {
        self.world.borrow_mut().env_parents.insert(env, parent);
    }

    pub fn add_thunk(&self, thunk: ThunkRef, env: EnvRef, expression: ValueKind) {
        let mut world = self.world.borrow_mut();
        world.thunk_envs.insert(thunk, env);
        world.thunk_expressions.insert(thunk, expression);
    }

    /// Mark a thunk as already materialized (preforced).
    pub fn set_thunk_value(&self, thunk: ThunkRef, value: ValueRef) {
        self.world.borrow_mut().thunk_values.insert(thunk, value);
    }

    pub fn bind(&self, env: EnvRef, name: &str, binding: Binding) {
        self.world
            .borrow_mut()
            .bindings
            .insert((env, name.to_string()), binding);
    }

    pub fn add_value(&self, value: ValueRef, kind: ValueKind) {
        self.world.borrow_mut().value_kinds.insert(value, kind);
    }

    pub fn set_value_class(&self, value: ValueRef, class: &str) {
        self.world
            .borrow_mut()
            .value_classes
            .insert(value, class.to_string());
    }

    pub fn add_closure(&self, function: FunRef, formals: &[&str], definition: &str) {
        self.world.borrow_mut().functions.insert(
            function,
            FunctionInfo {
                kind: FunctionKind::Closure,
                formal_parameters: formals.iter().map(|f| f.to_string()).collect(),
                byte_compiled: false,
                definition: definition.to_string(),
                namespace: "base".to_string(),
                is_internal: false,
                is_primitive: false,
            },
        );
    }

    pub fn add_builtin(&self, function: FunRef, definition: &str, force_order: i32) {
        let mut world = self.world.borrow_mut();
        world.functions.insert(
            function,
            FunctionInfo {
                kind: FunctionKind::Builtin,
                formal_parameters: vec![],
                byte_compiled: false,
                definition: definition.to_string(),
                namespace: "base".to_string(),
                is_internal: true,
                is_primitive: true,
            },
        );
        world.force_orders.insert(function, force_order);
    }
}

impl HostRuntime for ScriptedHost {
    fn parent_env(&self, env: EnvRef) -> Option<EnvRef> {
        self.world.borrow().env_parents.get(&env).copied().flatten()
    }

    fn thunk_env(&self, thunk: ThunkRef) -> EnvRef {
        self.world
            .borrow()
            .thunk_envs
            .get(&thunk)
            .copied()
            .unwrap_or(EnvRef(0))
    }

    fn thunk_expression_kind(&self, thunk: ThunkRef) -> ValueKind {
        self.world
            .borrow()
            .thunk_expressions
            .get(&thunk)
            .copied()
            .unwrap_or(ValueKind::Language)
    }

    fn thunk_value(&self, thunk: ThunkRef) -> Option<ValueRef> {
        self.world.borrow().thunk_values.get(&thunk).copied()
    }

    fn lookup(&self, env: EnvRef, name: &str) -> Binding {
        self.world
            .borrow()
            .bindings
            .get(&(env, name.to_string()))
            .cloned()
            .unwrap_or(Binding::Single(ArgBinding::Missing))
    }

    fn function_info(&self, function: FunRef) -> FunctionInfo {
        self.world
            .borrow()
            .functions
            .get(&function)
            .cloned()
            .unwrap_or_else(|| FunctionInfo {
                kind: FunctionKind::Closure,
                formal_parameters: vec![],
                byte_compiled: false,
                definition: format!("<function {}>", function.0),
                namespace: "base".to_string(),
                is_internal: false,
                is_primitive: false,
            })
    }

    fn value_kind(&self, value: ValueRef) -> ValueKind {
        self.world
            .borrow()
            .value_kinds
            .get(&value)
            .copied()
            .unwrap_or(ValueKind::Unknown)
    }

    fn class_of(&self, value: ValueRef) -> Option<String> {
        self.world.borrow().value_classes.get(&value).cloned()
    }

    fn builtin_force_order(&self, function: FunRef) -> i32 {
        self.world
            .borrow()
            .force_orders
            .get(&function)
            .copied()
            .unwrap_or(0)
    }
}

/// Parse a text-mode table into header-keyed rows.
pub fn read_table(dir: &Path, name: &str) -> Vec<HashMap<String, String>> {
    let text = std::fs::read_to_string(dir.join(name))
        .unwrap_or_else(|e| panic!("failed to read table {name}: {e}"));
    let mut lines = text.lines();
    let header: Vec<&str> = lines
        .next()
        .unwrap_or_else(|| panic!("table {name} has no header"))
        .split('\t')
        .collect();
    lines
        .map(|line| {
            header
                .iter()
                .zip(line.split('\t'))
                .map(|(column, field)| (column.to_string(), field.to_string()))
                .collect()
        })
        .collect()
}

/// Convenience accessor with a readable panic message.
pub fn field<'a>(row: &'a HashMap<String, String>, column: &str) -> &'a str {
    row.get(column)
        .unwrap_or_else(|| panic!("row has no column '{column}'"))
}

/// Decode a binary-mode table (uncompressed) into header-keyed rows, with
/// every cell rendered as a string.
pub fn read_binary_table(dir: &Path, name: &str) -> Vec<HashMap<String, String>> {
    let bytes = std::fs::read(dir.join(name))
        .unwrap_or_else(|e| panic!("failed to read binary table {name}: {e}"));
    let mut at = 0usize;

    let read_u32 = |bytes: &[u8], at: &mut usize| {
        let value = u32::from_le_bytes(bytes[*at..*at + 4].try_into().unwrap());
        *at += 4;
        value
    };

    let column_count = read_u32(&bytes, &mut at) as usize;
    let mut header = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let len = read_u32(&bytes, &mut at) as usize;
        header.push(String::from_utf8(bytes[at..at + len].to_vec()).unwrap());
        at += len;
    }

    let mut rows = Vec::new();
    while at < bytes.len() {
        let mut row = HashMap::new();
        for column in &header {
            let tag = bytes[at];
            at += 1;
            let rendered = match tag {
                0 => {
                    let value = bytes[at] != 0;
                    at += 1;
                    if value { "1".to_string() } else { "0".to_string() }
                }
                1 => {
                    let value = i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
                    at += 8;
                    value.to_string()
                }
                2 => {
                    let value = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
                    at += 8;
                    value.to_string()
                }
                3 => {
                    let value = f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
                    at += 8;
                    value.to_string()
                }
                4 => {
                    let len = read_u32(&bytes, &mut at) as usize;
                    let value = String::from_utf8(bytes[at..at + len].to_vec()).unwrap();
                    at += len;
                    value
                }
                other => panic!("unknown cell tag {other} in table {name}"),
            };
            row.insert(column.clone(), rendered);
        }
        rows.push(row);
    }
    rows
}
