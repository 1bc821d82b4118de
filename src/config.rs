//! Compiler configuration types.

use crate::jit::assembler::MAX_HALFWORDS;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Output format for compiled functions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Disassembly listing
    #[default]
    Text,
    /// JSON document with code and shape
    Json,
    /// Raw halfwords in hex, one function per line
    Hex,
}

/// Configuration for compiling one function.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Buffer size per function in halfwords (capped at 1020)
    pub capacity: usize,
    /// Print `[JIT]` trace lines to stderr
    pub trace_jit: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_HALFWORDS,
            trace_jit: false,
        }
    }
}

impl JitConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default() {
        let config = JitConfig::default();
        assert_eq!(config.capacity, 1020);
        assert!(!config.trace_jit);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "trace_jit = true").unwrap();
        let config = JitConfig::load(file.path()).unwrap();
        assert!(config.trace_jit);
        assert_eq!(config.capacity, 1020);
    }

    #[test]
    fn test_load_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "capacity = \"lots\"").unwrap();
        let err = JitConfig::load(file.path()).unwrap_err();
        assert!(err.contains("failed to parse"));

        let err = JitConfig::load(Path::new("/nonexistent/thumbjit.toml")).unwrap_err();
        assert!(err.contains("failed to read"));
    }
}
