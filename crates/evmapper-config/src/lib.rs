//! Configuration and data model for evmapper
//!
//! This crate is pure data: the input-symbol table, the preset/mapping model
//! with its validation rules, the macro language (parser, AST, printer), the
//! capability declarations of the virtual output targets, and the on-disk
//! configuration layout. The daemon crate consumes these to drive devices.

pub mod error;
pub mod keys;
pub mod macros;
pub mod model;
pub mod storage;
pub mod targets;
pub mod validate;

pub use error::{ConfigError, InvalidPreset, MacroParseError, MappingError};
pub use keys::{EventKind, SymbolTable, DISABLE_NAME};
pub use model::{InputCombination, InputConfig, InputMatchKey, Mapping, Preset, TargetDevice};
pub use storage::{ConfigDir, GlobalConfig};
pub use validate::{compile_preset, CompiledMapping, CompiledPreset, ResolvedOutput};
