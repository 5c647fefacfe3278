//! Error types for preset loading and validation

use std::path::PathBuf;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// A macro failed to parse.
///
/// Raised at preset-load time; the offending mapping is disabled and
/// reported, the rest of the preset keeps working. The span points into the
/// cleaned macro source (comments and insignificant whitespace removed).
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(evmapper::macros::parse))]
pub struct MacroParseError {
    #[source_code]
    pub src: String,
    #[label("{message}")]
    pub span: SourceSpan,
    pub message: String,
}

impl MacroParseError {
    pub fn new(src: &str, offset: usize, len: usize, message: impl Into<String>) -> Self {
        let offset = offset.min(src.len());
        let len = len.min(src.len() - offset);
        Self {
            src: src.to_string(),
            span: (offset, len).into(),
            message: message.into(),
        }
    }

    /// Byte offset of the error in the cleaned macro source.
    pub fn offset(&self) -> usize {
        self.span.offset()
    }
}

/// One rejected mapping inside an invalid preset.
#[derive(Debug, Clone, Error)]
#[error("mapping {index}: {reason}")]
pub struct MappingError {
    /// Index of the offending record in the preset file.
    pub index: usize,
    pub reason: String,
}

/// Schema or semantic validation failure of a whole preset.
#[derive(Debug, Error)]
#[error("invalid preset \"{preset}\": {}", format_mapping_errors(.errors))]
pub struct InvalidPreset {
    pub preset: String,
    pub errors: Vec<MappingError>,
}

fn format_mapping_errors(errors: &[MappingError]) -> String {
    errors
        .iter()
        .map(MappingError::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures reading or writing the on-disk configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
