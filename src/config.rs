//! Tracer configuration
//!
//! Flat option struct in the spirit of the probe layer that drives it. Every
//! option can come from a `PEREZOSO_*` environment variable; the recognized
//! variables are echoed verbatim into the CONFIGURATION side file so a trace
//! directory is self-describing.

use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Environment variables surfaced to the CONFIGURATION file, in emission
/// order.
pub const ENVIRONMENT_VARIABLES: &[&str] = &[
    "PEREZOSO_OUTPUT_DIR",
    "PEREZOSO_TRACE_FILE",
    "PEREZOSO_ENABLE_TRACE",
    "PEREZOSO_TRUNCATE",
    "PEREZOSO_VERBOSE",
    "PEREZOSO_BINARY",
    "PEREZOSO_COMPRESSION_LEVEL",
];

/// Build-time commit stamp, "unknown" for builds outside the repository.
pub const GIT_COMMIT_INFO: &str = match option_env!("GIT_COMMIT_INFO") {
    Some(info) => info,
    None => "unknown",
};

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub output_dirpath: PathBuf,
    pub trace_filepath: PathBuf,
    pub enable_trace: bool,
    pub truncate: bool,
    pub verbose: bool,
    pub binary: bool,
    pub compression_level: u32,
}

impl TracerConfig {
    /// Defaults for a given output directory: text tables, truncating, raw
    /// trace disabled.
    pub fn new(output_dirpath: impl Into<PathBuf>) -> Self {
        let output_dirpath = output_dirpath.into();
        let trace_filepath = output_dirpath.join("trace.jsonl");
        Self {
            output_dirpath,
            trace_filepath,
            enable_trace: false,
            truncate: true,
            verbose: false,
            binary: false,
            compression_level: 0,
        }
    }

    /// Read every option from the `PEREZOSO_*` environment variables,
    /// falling back to the defaults for unset ones.
    pub fn from_env() -> Self {
        let output_dirpath =
            env::var("PEREZOSO_OUTPUT_DIR").unwrap_or_else(|_| String::from("perezoso-trace"));
        let mut config = Self::new(output_dirpath);
        if let Ok(path) = env::var("PEREZOSO_TRACE_FILE") {
            config.trace_filepath = PathBuf::from(path);
        }
        config.enable_trace = env_flag("PEREZOSO_ENABLE_TRACE", config.enable_trace);
        config.truncate = env_flag("PEREZOSO_TRUNCATE", config.truncate);
        config.verbose = env_flag("PEREZOSO_VERBOSE", config.verbose);
        config.binary = env_flag("PEREZOSO_BINARY", config.binary);
        if let Ok(level) = env::var("PEREZOSO_COMPRESSION_LEVEL") {
            if let Ok(level) = level.parse() {
                config.compression_level = level;
            }
        }
        config
    }

    /// Write the CONFIGURATION side file: recognized environment variables
    /// verbatim, the commit stamp, and the effective flags.
    pub fn write_configuration(&self, dir: &Path) -> io::Result<()> {
        let mut file = File::create(dir.join("CONFIGURATION"))?;
        for variable in ENVIRONMENT_VARIABLES {
            let value = env::var(variable).unwrap_or_default();
            writeln!(file, "{}={}", variable, value)?;
        }
        writeln!(file, "GIT_COMMIT_INFO={}", GIT_COMMIT_INFO)?;
        writeln!(file, "truncate={}", u8::from(self.truncate))?;
        writeln!(file, "verbose={}", u8::from(self.verbose))?;
        writeln!(file, "binary={}", u8::from(self.binary))?;
        writeln!(file, "compression_level={}", self.compression_level)?;
        Ok(())
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TracerConfig::new("/tmp/out");
        assert_eq!(config.output_dirpath, PathBuf::from("/tmp/out"));
        assert_eq!(config.trace_filepath, PathBuf::from("/tmp/out/trace.jsonl"));
        assert!(!config.enable_trace);
        assert!(config.truncate);
        assert!(!config.binary);
        assert_eq!(config.compression_level, 0);
    }

    #[test]
    fn test_configuration_file_contents() {
        let dir = TempDir::new().unwrap();
        let mut config = TracerConfig::new(dir.path());
        config.binary = true;
        config.compression_level = 4;
        config.write_configuration(dir.path()).unwrap();

        let text = std::fs::read_to_string(dir.path().join("CONFIGURATION")).unwrap();
        assert!(text.contains("PEREZOSO_OUTPUT_DIR="));
        assert!(text.contains("GIT_COMMIT_INFO="));
        assert!(text.contains("truncate=1"));
        assert!(text.contains("verbose=0"));
        assert!(text.contains("binary=1"));
        assert!(text.contains("compression_level=4"));
    }

    #[test]
    fn test_env_flag_parsing() {
        assert!(!env_flag("PEREZOSO_TEST_UNSET_FLAG", false));
        assert!(env_flag("PEREZOSO_TEST_UNSET_FLAG", true));
    }
}
