//! Output surface: side files, binary mode, the raw trace stream, and
//! teardown aggregation tables.

mod common;

use common::{field, read_binary_table, read_table, ScriptedHost};
use perezoso::{
    ArgBinding, Binding, EnvRef, FunRef, ThunkRef, TracerConfig, TracerState, ValueKind, ValueRef,
};
use tempfile::TempDir;

const GLOBAL: EnvRef = EnvRef(1);
const INT: ValueRef = ValueRef(900);

fn base_host() -> ScriptedHost {
    let host = ScriptedHost::new();
    host.add_environment(GLOBAL, None);
    host.add_value(INT, ValueKind::Integer);
    host
}

#[test]
fn test_configuration_side_file_is_written() {
    let host = base_host();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let state = TracerState::new(host, TracerConfig::new(&out)).unwrap();
    state.initialize().unwrap();
    state.cleanup(false).unwrap();

    let text = std::fs::read_to_string(out.join("CONFIGURATION")).unwrap();
    assert!(text.contains("PEREZOSO_OUTPUT_DIR="));
    assert!(text.contains("GIT_COMMIT_INFO="));
    assert!(text.contains("truncate=1"));
    assert!(text.contains("compression_level=0"));
    assert!(out.join("NOERROR").exists());
}

#[test]
fn test_error_flag_propagates_to_sentinel() {
    let host = base_host();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let state = TracerState::new(host, TracerConfig::new(&out)).unwrap();
    state.cleanup(true).unwrap();
    assert!(out.join("ERROR").exists());
    assert!(!out.join("NOERROR").exists());
}

#[test]
fn test_binary_tables_decode_to_the_same_rows() {
    let host = base_host();
    let f = FunRef(10);
    host.add_closure(f, &["x"], "function(x) x");
    let call_env = EnvRef(2);
    host.add_environment(call_env, Some(GLOBAL));
    let t = ThunkRef(100);
    host.add_thunk(t, GLOBAL, ValueKind::Language);
    host.bind(call_env, "x", Binding::Single(ArgBinding::Thunk(t)));

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut config = TracerConfig::new(&out);
    config.binary = true;
    let mut state = TracerState::new(host, config).unwrap();
    state.initialize().unwrap();

    state.probe_thunk_created(t);
    state.probe_function_entry(f, "f", call_env);
    state.probe_force_entry(t);
    state.probe_force_exit(t, INT);
    state.probe_function_exit(Some(INT)).unwrap();
    state.cleanup(false).unwrap();

    let promises = read_binary_table(&out, "promises");
    assert_eq!(promises.len(), 1);
    assert_eq!(field(&promises[0], "force_count"), "1");
    assert_eq!(field(&promises[0], "expression_type"), "language");
    assert_eq!(field(&promises[0], "value_type"), "integer");

    let arguments = read_binary_table(&out, "arguments");
    assert_eq!(arguments.len(), 1);
    assert_eq!(field(&arguments[0], "direct_force"), "1");
}

#[test]
fn test_compressed_binary_tables_have_gzip_magic() {
    let host = base_host();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut config = TracerConfig::new(&out);
    config.binary = true;
    config.compression_level = 6;
    let state = TracerState::new(host, config).unwrap();
    state.cleanup(false).unwrap();

    let bytes = std::fs::read(out.join("promises")).unwrap();
    assert_eq!(&bytes[0..2], &[0x1f, 0x8b]);
}

#[test]
fn test_raw_trace_stream_records_probe_events() {
    let host = base_host();
    let t = ThunkRef(101);
    host.add_thunk(t, GLOBAL, ValueKind::Language);

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut config = TracerConfig::new(&out);
    config.enable_trace = true;
    let trace_path = config.trace_filepath.clone();
    let mut state = TracerState::new(host, config).unwrap();
    state.initialize().unwrap();

    state.probe_thunk_created(t);
    state.probe_force_entry(t);
    state.probe_force_exit(t, INT);
    state.probe_variable_define(GLOBAL, "x");
    state.cleanup(false).unwrap();

    let text = std::fs::read_to_string(trace_path).unwrap();
    let events: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["event"], "thunk_created");
    assert_eq!(events[1]["event"], "thunk_force_entry");
    assert_eq!(events[2]["event"], "thunk_force_exit");
    assert_eq!(events[2]["value_type"], "integer");
    assert_eq!(events[3]["event"], "variable_define");
    assert_eq!(events[3]["name"], "x");
    // sequence numbers are monotone from 1
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event["seq"], (i + 1) as u64);
    }
}

#[test]
fn test_function_definitions_deduplicate_by_identity() {
    // Two host handles with the same deparsed definition share a function
    // identity: one function_definition row, two call_summary rows.
    let host = base_host();
    let (f1, f2) = (FunRef(20), FunRef(21));
    host.add_closure(f1, &[], "function() 1");
    host.add_closure(f2, &[], "function() 1");
    let e1 = EnvRef(3);
    host.add_environment(e1, Some(GLOBAL));

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut state = TracerState::new(host, TracerConfig::new(&out)).unwrap();
    state.initialize().unwrap();

    state.probe_function_entry(f1, "f", e1);
    state.probe_function_exit(Some(INT)).unwrap();
    state.probe_function_entry(f2, "g", e1);
    state.probe_function_exit(Some(INT)).unwrap();
    state.cleanup(false).unwrap();

    let definitions = read_table(&out, "function_definition");
    assert_eq!(definitions.len(), 1);
    assert_eq!(field(&definitions[0], "definition"), "function() 1");

    let summary = read_table(&out, "call_summary");
    assert_eq!(summary.len(), 2);
    assert_eq!(
        field(&summary[0], "function_id"),
        field(&summary[1], "function_id")
    );
}

#[test]
fn test_function_names_are_namespace_qualified_and_joined() {
    let host = base_host();
    let f = FunRef(22);
    host.add_closure(f, &[], "function() 2");
    let e1 = EnvRef(4);
    host.add_environment(e1, Some(GLOBAL));

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut state = TracerState::new(host, TracerConfig::new(&out)).unwrap();
    state.initialize().unwrap();

    state.probe_function_entry(f, "first", e1);
    state.probe_function_exit(Some(INT)).unwrap();
    state.probe_function_entry(f, "second", e1);
    state.probe_function_exit(Some(INT)).unwrap();
    state.cleanup(false).unwrap();

    let summary = read_table(&out, "call_summary");
    assert_eq!(summary.len(), 1);
    assert_eq!(field(&summary[0], "call_count"), "2");
    assert_eq!(
        field(&summary[0], "function_name"),
        "base::first | base::second"
    );
}

#[test]
fn test_lifecycle_fingerprints_aggregate_across_thunks() {
    // Two thunks exercised identically collapse into one lifecycle row with
    // promise_count 2; a third, different one gets its own row.
    let host = base_host();
    let thunks = [ThunkRef(110), ThunkRef(111), ThunkRef(112)];
    for thunk in thunks {
        host.add_thunk(thunk, GLOBAL, ValueKind::Language);
    }

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let mut state = TracerState::new(host.clone(), TracerConfig::new(&out)).unwrap();
    state.initialize().unwrap();

    for thunk in &thunks[..2] {
        state.probe_thunk_created(*thunk);
        state.probe_force_entry(*thunk);
        state.probe_force_exit(*thunk, INT);
    }
    state.probe_thunk_created(thunks[2]);
    state.probe_force_entry(thunks[2]);
    state.probe_force_exit(thunks[2], INT);
    state.probe_value_lookup(thunks[2]);
    state.probe_value_lookup(thunks[2]);
    state.cleanup(false).unwrap();

    let rows = read_table(&out, "promise_lifecycle");
    assert_eq!(rows.len(), 2);
    let forced_only = rows.iter().find(|row| field(row, "action") == "CF").unwrap();
    assert_eq!(field(forced_only, "count"), "1|1");
    assert_eq!(field(forced_only, "promise_count"), "2");
    let looked_up = rows.iter().find(|row| field(row, "action") == "CFV").unwrap();
    assert_eq!(field(looked_up, "count"), "1|1|2");
    assert_eq!(field(looked_up, "promise_count"), "1");
}
