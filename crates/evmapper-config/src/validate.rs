//! Preset validation and output resolution
//!
//! `compile_preset` turns a raw [`Preset`] into the form the injection
//! engine consumes: every mapping's output resolved to a key, an axis, a
//! parsed macro, or "disabled". Hard schema violations reject the preset;
//! macro parse failures only disable the affected mapping, unless every
//! single mapping fails to parse.

use std::collections::HashSet;

use crate::error::{InvalidPreset, MacroParseError, MappingError};
use crate::keys::{EventKind, SymbolTable, DISABLE_NAME};
use crate::macros::{self, Macro};
use crate::model::{Mapping, Preset};
use crate::targets;

/// The resolved output of a mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedOutput {
    /// Mirror press/hold/release onto `(kind, code)`.
    Key { kind: EventKind, code: u16 },
    /// Drive `(kind, code)` as an analog axis.
    Axis { kind: EventKind, code: u16 },
    Macro(Macro),
    /// Consume the trigger, emit nothing.
    Disabled,
}

/// A mapping that passed validation, with its output resolved.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    /// Index of the record in the preset file, stable across runs.
    pub index: usize,
    pub mapping: Mapping,
    pub output: ResolvedOutput,
}

/// A validated preset, ready for injection.
#[derive(Debug, Clone, Default)]
pub struct CompiledPreset {
    pub name: String,
    pub group_key: String,
    pub mappings: Vec<CompiledMapping>,
    /// Mappings disabled because their macro failed to parse.
    pub disabled: Vec<(usize, MacroParseError)>,
}

/// Validate a preset and resolve every output.
pub fn compile_preset(
    preset: &Preset,
    symbols: &SymbolTable,
) -> Result<CompiledPreset, InvalidPreset> {
    let mut errors: Vec<MappingError> = Vec::new();
    let mut compiled = CompiledPreset {
        name: preset.name.clone(),
        group_key: preset.group_key.clone(),
        ..Default::default()
    };

    let mut seen_combinations = HashSet::new();

    for (index, mapping) in preset.mappings.iter().enumerate() {
        let mut reject = |reason: String| {
            errors.push(MappingError { index, reason });
        };

        let identity = mapping.input_combination.identity();
        if !seen_combinations.insert(identity) {
            reject(format!(
                "the combination \"{}\" is already mapped",
                mapping.input_combination.beautify(symbols)
            ));
            continue;
        }

        if let Err(reason) = check_combination(mapping) {
            reject(reason);
            continue;
        }
        if let Err(reason) = check_shaping(mapping) {
            reject(reason);
            continue;
        }

        let output = match resolve_output(mapping, symbols) {
            Ok(output) => output,
            Err(ResolveError::Invalid(reason)) => {
                reject(reason);
                continue;
            }
            Err(ResolveError::MacroParse(error)) => {
                tracing::warn!(
                    preset = %preset.name,
                    index,
                    "disabling mapping, macro failed to parse: {error}"
                );
                compiled.disabled.push((index, error));
                continue;
            }
        };

        if let Err(reason) = check_output_matches_input(mapping, &output, symbols) {
            reject(reason);
            continue;
        }

        compiled.mappings.push(CompiledMapping {
            index,
            mapping: mapping.clone(),
            output,
        });
    }

    if !errors.is_empty() {
        return Err(InvalidPreset {
            preset: preset.name.clone(),
            errors,
        });
    }

    // a preset where every mapping failed to parse is useless, reject it
    if compiled.mappings.is_empty() && !compiled.disabled.is_empty() {
        return Err(InvalidPreset {
            preset: preset.name.clone(),
            errors: compiled
                .disabled
                .iter()
                .map(|(index, error)| MappingError {
                    index: *index,
                    reason: format!("macro failed to parse: {error}"),
                })
                .collect(),
        });
    }

    Ok(compiled)
}

fn check_combination(mapping: &Mapping) -> Result<(), String> {
    let combination = &mapping.input_combination;

    if combination.is_empty() {
        return Err("the input combination is empty".to_string());
    }

    let analog_count = combination
        .iter()
        .filter(|config| config.defines_analog_input())
        .count();
    if analog_count > 1 {
        return Err(format!(
            "a combination may contain at most one analog input, found {analog_count}; \
             add trigger thresholds to use axes as buttons"
        ));
    }

    for config in combination.iter() {
        if config.kind == EventKind::Abs {
            if let Some(threshold) = config.analog_threshold {
                if threshold.abs() > 100 {
                    return Err(format!(
                        "analog_threshold {threshold} for an absolute axis must be a \
                         percentage in [-100, 100]"
                    ));
                }
            }
        }
        if !matches!(config.kind, EventKind::Key | EventKind::Rel | EventKind::Abs) {
            return Err(format!(
                "input type {} cannot be used as a trigger",
                config.kind
            ));
        }
    }

    Ok(())
}

fn check_shaping(mapping: &Mapping) -> Result<(), String> {
    if !(0.0..1.0).contains(&mapping.deadzone) {
        return Err(format!("deadzone {} must be in [0, 1)", mapping.deadzone));
    }
    if mapping.expo <= -1.0 || mapping.expo >= 1.0 {
        return Err(format!("expo {} must be in (-1, 1)", mapping.expo));
    }
    if mapping.rel_rate == 0 {
        return Err("rel_rate must be positive".to_string());
    }
    if mapping.rel_to_abs_input_cutoff <= 0.0 {
        return Err(format!(
            "rel_to_abs_input_cutoff {} must be positive",
            mapping.rel_to_abs_input_cutoff
        ));
    }
    if mapping.release_timeout <= 0.0 {
        return Err(format!(
            "release_timeout {} must be positive",
            mapping.release_timeout
        ));
    }
    Ok(())
}

enum ResolveError {
    Invalid(String),
    MacroParse(MacroParseError),
}

fn resolve_output(mapping: &Mapping, symbols: &SymbolTable) -> Result<ResolvedOutput, ResolveError> {
    match (&mapping.output_symbol, mapping.output_type, mapping.output_code) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ResolveError::Invalid(
            "output_symbol and output_type/output_code are mutually exclusive".to_string(),
        )),
        (Some(symbol), None, None) => {
            let symbol = symbol.trim();
            if symbol == DISABLE_NAME {
                return Ok(ResolvedOutput::Disabled);
            }
            if macros::is_this_a_macro(symbol) {
                return macros::parse(symbol)
                    .map(ResolvedOutput::Macro)
                    .map_err(ResolveError::MacroParse);
            }
            match symbols.key(symbol) {
                Some(code) => Ok(ResolvedOutput::Key {
                    kind: EventKind::Key,
                    code,
                }),
                None => Err(ResolveError::Invalid(format!(
                    "the output_symbol \"{symbol}\" is not a macro and not a known key name"
                ))),
            }
        }
        (None, Some(kind), Some(code)) => {
            if !matches!(kind, EventKind::Key | EventKind::Rel | EventKind::Abs) {
                return Err(ResolveError::Invalid(format!(
                    "output_type {kind} is not emittable"
                )));
            }
            if mapping.input_combination.analog_input().is_some() {
                Ok(ResolvedOutput::Axis { kind, code })
            } else {
                Ok(ResolvedOutput::Key { kind, code })
            }
        }
        _ => Err(ResolveError::Invalid(
            "a mapping must have either output_symbol or output_type and output_code".to_string(),
        )),
    }
}

fn check_output_matches_input(
    mapping: &Mapping,
    output: &ResolvedOutput,
    symbols: &SymbolTable,
) -> Result<(), String> {
    let uses_analog = mapping.input_combination.analog_input().is_some();
    let capabilities = targets::capabilities(mapping.target_uinput);

    match output {
        ResolvedOutput::Disabled => Ok(()),
        ResolvedOutput::Macro(_) => {
            if uses_analog {
                Err(format!(
                    "\"{}\" is used as analog input but the output is a macro",
                    mapping.input_combination.beautify(symbols)
                ))
            } else {
                Ok(())
            }
        }
        ResolvedOutput::Key { kind, code } | ResolvedOutput::Axis { kind, code } => {
            if uses_analog && !matches!(kind, EventKind::Abs | EventKind::Rel) {
                return Err(format!(
                    "\"{}\" is used as analog input but the output is not an axis",
                    mapping.input_combination.beautify(symbols)
                ));
            }
            let analog_kind = mapping.input_combination.analog_input().map(|c| c.kind);
            if analog_kind == Some(EventKind::Rel) && *kind == EventKind::Rel {
                return Err(
                    "mapping a relative axis to a relative axis is not supported".to_string()
                );
            }
            if !capabilities.supports(*kind, *code) {
                return Err(format!(
                    "target \"{}\" does not advertise {} {}",
                    mapping.target_uinput,
                    kind,
                    symbols.name(*kind, *code)
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InputCombination, InputConfig, TargetDevice};

    fn symbols() -> SymbolTable {
        SymbolTable::new()
    }

    fn preset(mappings: Vec<Mapping>) -> Preset {
        Preset {
            name: "test".to_string(),
            group_key: "group".to_string(),
            mappings,
        }
    }

    fn key_combination(codes: &[u16]) -> InputCombination {
        InputCombination::new(codes.iter().map(|&c| InputConfig::key(c)).collect())
    }

    fn abs_config(code: u16, threshold: Option<i32>) -> InputConfig {
        InputConfig {
            kind: EventKind::Abs,
            code,
            origin_hash: None,
            analog_threshold: threshold,
        }
    }

    #[test]
    fn compiles_a_simple_key_mapping() {
        let mapping = Mapping::key_to_key(key_combination(&[30]), TargetDevice::Keyboard, 48);
        let compiled = compile_preset(&preset(vec![mapping]), &symbols()).unwrap();
        assert_eq!(compiled.mappings.len(), 1);
        assert_eq!(
            compiled.mappings[0].output,
            ResolvedOutput::Key {
                kind: EventKind::Key,
                code: 48
            }
        );
    }

    #[test]
    fn resolves_symbols_and_macros() {
        let key = Mapping::with_symbol(key_combination(&[30]), TargetDevice::Keyboard, "b");
        let macro_ = Mapping::with_symbol(key_combination(&[31]), TargetDevice::Keyboard, "key(a).key(b)");
        let disable = Mapping::with_symbol(key_combination(&[32]), TargetDevice::Keyboard, "disable");

        let compiled = compile_preset(&preset(vec![key, macro_, disable]), &symbols()).unwrap();
        assert!(matches!(compiled.mappings[0].output, ResolvedOutput::Key { code, .. } if code == evdev::Key::KEY_B.code()));
        assert!(matches!(compiled.mappings[1].output, ResolvedOutput::Macro(_)));
        assert_eq!(compiled.mappings[2].output, ResolvedOutput::Disabled);
    }

    #[test]
    fn rejects_empty_combination() {
        let mapping = Mapping::key_to_key(InputCombination::new(vec![]), TargetDevice::Keyboard, 48);
        let error = compile_preset(&preset(vec![mapping]), &symbols()).unwrap_err();
        assert!(error.errors[0].reason.contains("empty"));
    }

    #[test]
    fn rejects_duplicate_combinations_in_any_order() {
        let a = Mapping::key_to_key(key_combination(&[42, 30]), TargetDevice::Keyboard, 48);
        let b = Mapping::key_to_key(key_combination(&[30, 42]), TargetDevice::Keyboard, 49);
        let error = compile_preset(&preset(vec![a, b]), &symbols()).unwrap_err();
        assert_eq!(error.errors[0].index, 1);
        assert!(error.errors[0].reason.contains("already mapped"));
    }

    #[test]
    fn rejects_multiple_analog_inputs() {
        let combination =
            InputCombination::new(vec![abs_config(0, None), abs_config(1, None)]);
        let mut mapping = Mapping::key_to_key(combination, TargetDevice::Gamepad, 0);
        mapping.output_type = Some(EventKind::Abs);
        let error = compile_preset(&preset(vec![mapping]), &symbols()).unwrap_err();
        assert!(error.errors[0].reason.contains("at most one analog input"));
    }

    #[test]
    fn rejects_out_of_range_shaping() {
        let mut mapping = Mapping::key_to_key(key_combination(&[30]), TargetDevice::Keyboard, 48);
        mapping.deadzone = 1.0;
        assert!(compile_preset(&preset(vec![mapping.clone()]), &symbols()).is_err());

        mapping.deadzone = 0.1;
        mapping.expo = 1.0;
        assert!(compile_preset(&preset(vec![mapping.clone()]), &symbols()).is_err());

        mapping.expo = 0.0;
        mapping.release_timeout = 0.0;
        assert!(compile_preset(&preset(vec![mapping]), &symbols()).is_err());
    }

    #[test]
    fn rejects_threshold_out_of_percent_range() {
        let combination = InputCombination::new(vec![abs_config(0, Some(150))]);
        let mapping = Mapping::key_to_key(combination, TargetDevice::Keyboard, 30);
        let error = compile_preset(&preset(vec![mapping]), &symbols()).unwrap_err();
        assert!(error.errors[0].reason.contains("[-100, 100]"));
    }

    #[test]
    fn rejects_axis_output_not_advertised_by_target() {
        // keyboard does not advertise EV_ABS at all
        let combination = InputCombination::new(vec![abs_config(0, None)]);
        let mut mapping = Mapping::key_to_key(combination, TargetDevice::Keyboard, 0);
        mapping.output_type = Some(EventKind::Abs);
        mapping.output_code = Some(0);
        let error = compile_preset(&preset(vec![mapping]), &symbols()).unwrap_err();
        assert!(error.errors[0].reason.contains("does not advertise"));
    }

    #[test]
    fn rejects_analog_input_with_key_output() {
        let combination = InputCombination::new(vec![abs_config(0, None)]);
        let mapping = Mapping::key_to_key(combination, TargetDevice::Keyboard, 30);
        let error = compile_preset(&preset(vec![mapping]), &symbols()).unwrap_err();
        assert!(error.errors[0].reason.contains("not an axis"));
    }

    #[test]
    fn macro_parse_failure_disables_only_that_mapping() {
        let good = Mapping::with_symbol(key_combination(&[30]), TargetDevice::Keyboard, "key(a)");
        let bad = Mapping::with_symbol(key_combination(&[31]), TargetDevice::Keyboard, "key(a");

        let compiled = compile_preset(&preset(vec![good, bad]), &symbols()).unwrap();
        assert_eq!(compiled.mappings.len(), 1);
        assert_eq!(compiled.disabled.len(), 1);
        assert_eq!(compiled.disabled[0].0, 1);
    }

    #[test]
    fn rejects_preset_where_all_macros_fail() {
        let bad_1 = Mapping::with_symbol(key_combination(&[30]), TargetDevice::Keyboard, "key(a");
        let bad_2 = Mapping::with_symbol(key_combination(&[31]), TargetDevice::Keyboard, "nope(1)");
        assert!(compile_preset(&preset(vec![bad_1, bad_2]), &symbols()).is_err());
    }

    #[test]
    fn threshold_on_axis_as_button_is_a_key_mapping() {
        let combination = InputCombination::new(vec![abs_config(0, Some(50))]);
        let mapping = Mapping::key_to_key(combination, TargetDevice::Keyboard, 30);
        let compiled = compile_preset(&preset(vec![mapping]), &symbols()).unwrap();
        assert!(matches!(
            compiled.mappings[0].output,
            ResolvedOutput::Key { kind: EventKind::Key, code: 30 }
        ));
    }

    #[test]
    fn empty_preset_is_valid() {
        let compiled = compile_preset(&preset(vec![]), &symbols()).unwrap();
        assert!(compiled.mappings.is_empty());
        assert!(compiled.disabled.is_empty());
    }
}
