//! Raw probe event stream
//!
//! When `enable_trace` is on, every probe appends one JSON line to
//! `trace_filepath`: a monotone sequence number plus the event payload. The
//! stream is a debugging aid, separate from the relational tables; write
//! failures are logged and do not abort tracing.

use std::fs::File;
use std::io::{BufWriter, Write};

use serde::Serialize;
use tracing::warn;

use crate::config::TracerConfig;
use crate::ids::{CallId, EnvId, ValueId, VarId};

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent<'a> {
    FunctionEntry {
        call_id: CallId,
        function_id: &'a str,
        name: &'a str,
    },
    FunctionExit {
        call_id: CallId,
        return_type: &'a str,
    },
    ThunkCreated {
        value_id: ValueId,
    },
    ThunkForceEntry {
        value_id: ValueId,
    },
    ThunkForceExit {
        value_id: ValueId,
        value_type: &'a str,
    },
    ThunkLookup {
        value_id: ValueId,
        component: &'a str,
    },
    ThunkAssign {
        value_id: ValueId,
        component: &'a str,
    },
    Metaprogram {
        value_id: ValueId,
    },
    Dispatch {
        method: &'a str,
        value_id: Option<ValueId>,
    },
    VariableDefine {
        env_id: EnvId,
        var_id: VarId,
        name: &'a str,
    },
    VariableAssign {
        env_id: EnvId,
        var_id: VarId,
        name: &'a str,
    },
    VariableLookup {
        env_id: EnvId,
        name: &'a str,
    },
    VariableRemove {
        env_id: EnvId,
        name: &'a str,
    },
    Allocation {
        object_type: &'a str,
    },
    ContextJump {
        unwound_frames: usize,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    seq: u64,
    #[serde(flatten)]
    event: &'a TraceEvent<'a>,
}

/// JSON-lines sink for raw probe events; inert when tracing is disabled.
#[derive(Debug, Default)]
pub struct TraceLog {
    writer: Option<BufWriter<File>>,
    seq: u64,
}

impl TraceLog {
    pub fn open(config: &TracerConfig) -> std::io::Result<Self> {
        if !config.enable_trace {
            return Ok(Self::default());
        }
        let file = File::create(&config.trace_filepath)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            seq: 0,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn record(&mut self, event: &TraceEvent<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        self.seq += 1;
        let envelope = Envelope {
            seq: self.seq,
            event,
        };
        let outcome = serde_json::to_writer(&mut *writer, &envelope)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(error) = outcome {
            warn!(%error, "dropping raw trace event");
        }
    }

    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(error) = writer.flush() {
                warn!(%error, "failed to flush raw trace stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disabled_log_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = TracerConfig::new(dir.path());
        let mut log = TraceLog::open(&config).unwrap();
        assert!(!log.is_enabled());
        log.record(&TraceEvent::ThunkCreated { value_id: 1 });
        log.finish();
        assert!(!config.trace_filepath.exists());
    }

    #[test]
    fn test_events_are_sequenced_json_lines() {
        let dir = TempDir::new().unwrap();
        let mut config = TracerConfig::new(dir.path());
        config.enable_trace = true;
        let mut log = TraceLog::open(&config).unwrap();
        log.record(&TraceEvent::ThunkCreated { value_id: 3 });
        log.record(&TraceEvent::FunctionEntry {
            call_id: 1,
            function_id: "ab12",
            name: "f",
        });
        log.finish();

        let text = std::fs::read_to_string(&config.trace_filepath).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["seq"], 1);
        assert_eq!(first["event"], "thunk_created");
        assert_eq!(first["value_id"], 3);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["seq"], 2);
        assert_eq!(second["event"], "function_entry");
        assert_eq!(second["name"], "f");
    }
}
