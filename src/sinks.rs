//! The seven output streams
//!
//! Column lists are fixed; downstream tooling indexes by position, so the
//! order here is load-bearing. Do not reorder or extend without migrating
//! the consumers.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::TracerConfig;
use crate::table::TableSink;

pub const OBJECT_COUNT_COLUMNS: &[&str] = &["type", "count"];

pub const CALL_SUMMARY_COLUMNS: &[&str] = &[
    "function_id",
    "function_type",
    "formal_parameter_count",
    "wrapper",
    "function_name",
    "generic_method",
    "dispatcher",
    "force_order",
    "missing_arguments",
    "return_value_type",
    "call_count",
];

pub const FUNCTION_DEFINITION_COLUMNS: &[&str] = &["function_id", "byte_compiled", "definition"];

pub const ARGUMENT_COLUMNS: &[&str] = &[
    "call_id",
    "function_id",
    "value_id",
    "formal_parameter_position",
    "actual_argument_position",
    "argument_type",
    "expression_type",
    "value_type",
    "default",
    "dot_dot_dot",
    "preforce",
    "direct_force",
    "direct_lookup_count",
    "direct_metaprogram_count",
    "indirect_force",
    "indirect_lookup_count",
    "indirect_metaprogram_count",
    "S3_dispatch",
    "S4_dispatch",
    "forcing_actual_argument_position",
    "non_local_return",
];

pub const ESCAPED_ARGUMENT_COLUMNS: &[&str] = &[
    "call_id",
    "function_id",
    "return_value_type",
    "formal_parameter_count",
    "formal_parameter_position",
    "actual_argument_position",
    "value_id",
    "class",
    "S3_dispatch",
    "S4_dispatch",
    "argument_type",
    "expression_type",
    "value_type",
    "default",
    "non_local_return",
    "escape",
    "call_depth",
    "promise_depth",
    "nested_promise_depth",
    "forcing_actual_argument_position",
    "preforce",
    "before_escape_force_count",
    "before_escape_metaprogram_count",
    "before_escape_value_lookup_count",
    "before_escape_value_assign_count",
    "before_escape_expression_lookup_count",
    "before_escape_expression_assign_count",
    "before_escape_environment_lookup_count",
    "before_escape_environment_assign_count",
    "after_escape_force_count",
    "after_escape_metaprogram_count",
    "after_escape_value_lookup_count",
    "after_escape_value_assign_count",
    "after_escape_expression_lookup_count",
    "after_escape_expression_assign_count",
    "after_escape_environment_lookup_count",
    "after_escape_environment_assign_count",
    "before_escape_direct_self_scope_mutation_count",
    "before_escape_indirect_self_scope_mutation_count",
    "before_escape_direct_lexical_scope_mutation_count",
    "before_escape_indirect_lexical_scope_mutation_count",
    "before_escape_direct_non_lexical_scope_mutation_count",
    "before_escape_indirect_non_lexical_scope_mutation_count",
    "before_escape_direct_self_scope_observation_count",
    "before_escape_indirect_self_scope_observation_count",
    "before_escape_direct_lexical_scope_observation_count",
    "before_escape_indirect_lexical_scope_observation_count",
    "before_escape_direct_non_lexical_scope_observation_count",
    "before_escape_indirect_non_lexical_scope_observation_count",
    "after_escape_direct_self_scope_mutation_count",
    "after_escape_indirect_self_scope_mutation_count",
    "after_escape_direct_lexical_scope_mutation_count",
    "after_escape_indirect_lexical_scope_mutation_count",
    "after_escape_direct_non_lexical_scope_mutation_count",
    "after_escape_indirect_non_lexical_scope_mutation_count",
    "after_escape_direct_self_scope_observation_count",
    "after_escape_indirect_self_scope_observation_count",
    "after_escape_direct_lexical_scope_observation_count",
    "after_escape_indirect_lexical_scope_observation_count",
    "after_escape_direct_non_lexical_scope_observation_count",
    "after_escape_indirect_non_lexical_scope_observation_count",
    "execution_time",
];

pub const PROMISE_COLUMNS: &[&str] = &[
    "value_id",
    "argument",
    "expression_type",
    "value_type",
    "scope",
    "S3_dispatch",
    "S4_dispatch",
    "preforce",
    "force_count",
    "call_depth",
    "promise_depth",
    "nested_promise_depth",
    "metaprogram_count",
    "value_lookup_count",
    "value_assign_count",
    "expression_lookup_count",
    "expression_assign_count",
    "environment_lookup_count",
    "environment_assign_count",
    "direct_self_scope_mutation_count",
    "indirect_self_scope_mutation_count",
    "direct_lexical_scope_mutation_count",
    "indirect_lexical_scope_mutation_count",
    "direct_non_lexical_scope_mutation_count",
    "indirect_non_lexical_scope_mutation_count",
    "direct_self_scope_observation_count",
    "indirect_self_scope_observation_count",
    "direct_lexical_scope_observation_count",
    "indirect_lexical_scope_observation_count",
    "direct_non_lexical_scope_observation_count",
    "indirect_non_lexical_scope_observation_count",
    "execution_time",
];

pub const PROMISE_LIFECYCLE_COLUMNS: &[&str] = &["action", "count", "promise_count"];

/// All table sinks for one trace run.
#[derive(Debug)]
pub struct TraceSinks {
    pub object_count: TableSink,
    pub call_summary: TableSink,
    pub function_definition: TableSink,
    pub arguments: TableSink,
    pub escaped_arguments: TableSink,
    pub promises: TableSink,
    pub promise_lifecycle: TableSink,
}

impl TraceSinks {
    pub fn open(config: &TracerConfig) -> Result<Self> {
        let dir: &Path = &config.output_dirpath;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;

        let open = |name, columns| {
            TableSink::open(
                dir,
                name,
                columns,
                config.truncate,
                config.binary,
                config.compression_level,
            )
            .with_context(|| format!("failed to open table '{}'", name))
        };

        Ok(Self {
            object_count: open("object_count", OBJECT_COUNT_COLUMNS)?,
            call_summary: open("call_summary", CALL_SUMMARY_COLUMNS)?,
            function_definition: open("function_definition", FUNCTION_DEFINITION_COLUMNS)?,
            arguments: open("arguments", ARGUMENT_COLUMNS)?,
            escaped_arguments: open("escaped_arguments", ESCAPED_ARGUMENT_COLUMNS)?,
            promises: open("promises", PROMISE_COLUMNS)?,
            promise_lifecycle: open("promise_lifecycle", PROMISE_LIFECYCLE_COLUMNS)?,
        })
    }

    /// Flush every stream; compressed sinks finalize their trailer here.
    pub fn finish(self) -> Result<()> {
        self.object_count.finish()?;
        self.call_summary.finish()?;
        self.function_definition.finish()?;
        self.arguments.finish()?;
        self.escaped_arguments.finish()?;
        self.promises.finish()?;
        self.promise_lifecycle.finish()?;
        Ok(())
    }
}
