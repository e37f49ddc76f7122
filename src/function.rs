//! Function interning and per-signature call summaries
//!
//! Functions are interned per host handle. Identity is the hex SHA-256 of
//! the host's deparsed definition, so the same closure reached through
//! different bindings or environments collapses to one row. Each destroyed
//! call folds into a `(force_order, missing_arguments, return_type)`
//! signature with an occurrence count.

use sha2::{Digest, Sha256};

use crate::host::{FunctionInfo, FunctionKind, ValueKind};
use crate::ids::FunctionId;

/// Stable function identity: hex SHA-256 of the definition text.
pub fn function_identity(definition: &str) -> FunctionId {
    let digest = Sha256::digest(definition.as_bytes());
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// One observed invocation shape of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSignature {
    pub force_order: Vec<i32>,
    pub missing_arguments: Vec<i32>,
    pub return_value_kind: ValueKind,
}

#[derive(Debug, Clone)]
pub struct CallSummary {
    pub signature: CallSignature,
    pub call_count: u64,
}

#[derive(Debug)]
pub struct Function {
    id: FunctionId,
    kind: FunctionKind,
    formal_parameters: Vec<String>,
    byte_compiled: bool,
    definition: String,
    namespace: String,
    names: Vec<String>,
    generic_method_name: String,
    dispatcher: bool,
    wrapper: Option<bool>,
    internal: bool,
    primitive: bool,
    summaries: Vec<CallSummary>,
}

impl Function {
    pub fn new(info: FunctionInfo) -> Self {
        let id = function_identity(&info.definition);
        Self {
            id,
            kind: info.kind,
            formal_parameters: info.formal_parameters,
            byte_compiled: info.byte_compiled,
            definition: info.definition,
            namespace: info.namespace,
            names: Vec::new(),
            generic_method_name: String::new(),
            dispatcher: false,
            wrapper: None,
            internal: info.is_internal,
            primitive: info.is_primitive,
            summaries: Vec::new(),
        }
    }

    pub fn id(&self) -> &FunctionId {
        &self.id
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn formal_parameters(&self) -> &[String] {
        &self.formal_parameters
    }

    pub fn formal_parameter_count(&self) -> usize {
        self.formal_parameters.len()
    }

    pub fn is_byte_compiled(&self) -> bool {
        self.byte_compiled
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive
    }

    /// Remember a binding name this function was called through.
    pub fn record_name(&mut self, name: &str) {
        if !name.is_empty() && !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    /// All observed names, namespace-qualified and `|`-separated.
    pub fn qualified_names(&self) -> String {
        self.names
            .iter()
            .map(|name| format!("{}::{}", self.namespace, name))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn generic_method_name(&self) -> &str {
        &self.generic_method_name
    }

    pub fn set_generic_method_name(&mut self, name: &str) {
        self.generic_method_name = name.to_string();
    }

    pub fn is_dispatcher(&self) -> bool {
        self.dispatcher
    }

    pub fn mark_dispatcher(&mut self) {
        self.dispatcher = true;
    }

    /// Wrapper status accumulates over observed callees: a closure stays a
    /// wrapper only while every call it makes goes to an internal/primitive.
    pub fn update_wrapper(&mut self, delegates_to_primitive: bool) {
        self.wrapper = Some(self.wrapper.unwrap_or(true) && delegates_to_primitive);
    }

    pub fn is_wrapper(&self) -> bool {
        self.wrapper.unwrap_or(false)
    }

    /// Fold one destroyed call into the matching signature, or open a new
    /// one. Linear scan: the signature list stays tiny in practice.
    pub fn add_summary(&mut self, signature: CallSignature) {
        for summary in &mut self.summaries {
            if summary.signature == signature {
                summary.call_count += 1;
                return;
            }
        }
        self.summaries.push(CallSummary {
            signature,
            call_count: 1,
        });
    }

    pub fn summaries(&self) -> &[CallSummary] {
        &self.summaries
    }
}
