//! Macro text parser
//!
//! Turns macro code like `repeat(3, key(a).wait(10))` into a [`Macro`].
//! Comments (`#` to end of line) and whitespace outside string quotes are
//! insignificant. `a + b + c` is sugar for `hold_keys(a, b, c)`. Calls accept
//! keyword arguments after positionals, e.g. `if_eq(1, 1, else=key(b))`.
//!
//! Parse failures are values, not panics: every error carries the cleaned
//! source and the offending span so the validator can aggregate and report
//! them per mapping.

use miette::SourceSpan;

use crate::error::MacroParseError;
use crate::macros::ast::{HoldBody, Macro, Task, Value};

/// Figure out whether an output symbol is macro code rather than a key name.
pub fn is_this_a_macro(output: &str) -> bool {
    let trimmed = output.trim();
    if trimmed.contains('+') {
        // for example "a + b"
        return true;
    }
    trimmed.contains('(') && trimmed.contains(')') && trimmed.len() >= 4
}

/// Parse macro code into its AST.
pub fn parse(code: &str) -> Result<Macro, MacroParseError> {
    let cleaned = clean(code);
    let cleaned = handle_plus_syntax(&cleaned)?;

    let parser = Parser { src: &cleaned };
    let macro_ = parser.parse_chain(0, cleaned.len())?;
    if macro_.is_empty() {
        return Err(parser.error(0, cleaned.len().max(1), "the provided code is not a macro"));
    }
    Ok(macro_)
}

/// Remove comments, then whitespace outside of string quotes.
fn clean(code: &str) -> String {
    let mut result = String::with_capacity(code.len());
    let mut in_string = false;
    let mut in_comment = false;

    for c in code.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = !in_string;
                result.push(c);
            }
            '#' if !in_string => in_comment = true,
            c if c.is_whitespace() && !in_string => {}
            c => result.push(c),
        }
    }

    result
}

/// Transform `a+b+c` into `hold_keys(a,b,c)`.
fn handle_plus_syntax(code: &str) -> Result<String, MacroParseError> {
    if !code.contains('+') {
        return Ok(code.to_string());
    }

    if code.contains('(') || code.contains(')') {
        return Err(MacroParseError::new(
            code,
            0,
            code.len(),
            format!("mixing \"+\" and function calls is unsupported: \"{code}\""),
        ));
    }

    let chunks: Vec<&str> = code.split('+').collect();
    if chunks.iter().any(|chunk| chunk.is_empty()) {
        return Err(MacroParseError::new(
            code,
            0,
            code.len(),
            format!("invalid \"+\" syntax: \"{code}\""),
        ));
    }

    Ok(format!("hold_keys({})", chunks.join(",")))
}

/// A parsed argument before it is assigned to a task parameter.
#[derive(Debug)]
enum Arg {
    Value(Value),
    Macro(Macro),
    None,
}

#[derive(Debug)]
struct ParsedArg {
    keyword: Option<String>,
    arg: Arg,
}

struct Parser<'a> {
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, offset: usize, len: usize, message: impl Into<String>) -> MacroParseError {
        MacroParseError::new(self.src, offset, len, message)
    }

    /// Parse a dot-joined chain of calls within `src[start..end]`.
    fn parse_chain(&self, start: usize, end: usize) -> Result<Macro, MacroParseError> {
        let mut tasks = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let (task, after_call) = self.parse_call(cursor, end)?;
            tasks.push(task);

            if after_call == end {
                break;
            }
            if self.src.as_bytes()[after_call] != b'.' {
                return Err(self.error(
                    after_call,
                    1,
                    "expected \".\" between macro calls",
                ));
            }
            cursor = after_call + 1;
            if cursor == end {
                return Err(self.error(after_call, 1, "macro ends with a dangling \".\""));
            }
        }

        Ok(Macro::new(tasks))
    }

    /// Parse one `name(args)` call starting at `start`. Returns the task and
    /// the offset just past the closing bracket.
    fn parse_call(&self, start: usize, end: usize) -> Result<(Task, usize), MacroParseError> {
        let code = &self.src[start..end];

        let name_len = code
            .char_indices()
            .take_while(|&(i, c)| {
                c == '_' || c.is_ascii_alphanumeric() && !(i == 0 && c.is_ascii_digit())
            })
            .count();
        if name_len == 0 {
            return Err(self.error(start, 1, "expected a function call"));
        }
        let name = &code[..name_len];

        if code[name_len..].chars().next() != Some('(') {
            return Err(self.error(
                start,
                name_len,
                format!("expected \"(\" after \"{name}\""),
            ));
        }

        let open = start + name_len;
        let close = self.find_closing_bracket(open, end)?;
        let task = self.build_task(name, start, open + 1, close)?;

        Ok((task, close + 1))
    }

    /// Find the position of the bracket closing the one at `open`.
    fn find_closing_bracket(&self, open: usize, end: usize) -> Result<usize, MacroParseError> {
        let mut depth = 0usize;
        let mut in_string = false;
        for (i, c) in self.src[open..end].char_indices() {
            match c {
                '"' => in_string = !in_string,
                '(' if !in_string => depth += 1,
                ')' if !in_string => {
                    if depth == 0 {
                        return Err(self.error(open + i, 1, "unbalanced brackets"));
                    }
                    depth -= 1;
                    if depth == 0 {
                        return Ok(open + i);
                    }
                }
                _ => {}
            }
        }
        Err(self.error(open, 1, "unbalanced brackets"))
    }

    /// Split the contents of a call into arguments at top-level commas.
    fn extract_args(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        if start == end {
            return spans;
        }

        let mut depth = 0usize;
        let mut in_string = false;
        let mut arg_start = start;
        for (i, c) in self.src[start..end].char_indices() {
            match c {
                '"' => in_string = !in_string,
                '(' if !in_string => depth += 1,
                ')' if !in_string => depth = depth.saturating_sub(1),
                ',' if !in_string && depth == 0 => {
                    spans.push((arg_start, start + i));
                    arg_start = start + i + 1;
                }
                _ => {}
            }
        }
        spans.push((arg_start, end));
        spans
    }

    /// Parse one argument: keyword split, then value or nested macro.
    fn parse_arg(&self, start: usize, end: usize) -> Result<ParsedArg, MacroParseError> {
        let text = &self.src[start..end];

        // "foo=bar" -> keyword argument
        if let Some(eq) = text.find('=') {
            let keyword = &text[..eq];
            let is_ident = !keyword.is_empty()
                && keyword
                    .chars()
                    .enumerate()
                    .all(|(i, c)| c == '_' || c.is_ascii_alphanumeric() && !(i == 0 && c.is_ascii_digit()));
            if is_ident {
                let inner = self.parse_arg(start + eq + 1, end)?;
                return Ok(ParsedArg {
                    keyword: Some(keyword.to_string()),
                    arg: inner.arg,
                });
            }
        }

        Ok(ParsedArg {
            keyword: None,
            arg: self.parse_arg_value(start, end)?,
        })
    }

    fn parse_arg_value(&self, start: usize, end: usize) -> Result<Arg, MacroParseError> {
        let text = &self.src[start..end];

        if text.is_empty() || text == "None" {
            return Ok(Arg::None);
        }

        if let Some(stripped) = text.strip_prefix('"') {
            let inner = stripped.strip_suffix('"').ok_or_else(|| {
                self.error(start, text.chars().count(), "unterminated string")
            })?;
            if inner.contains('"') {
                return Err(self.error(start, text.chars().count(), "stray quote inside string"));
            }
            return Ok(Arg::Value(Value::Str(inner.to_string())));
        }

        if let Some(name) = text.strip_prefix('$') {
            if name.is_empty() || !name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric()) {
                return Err(self.error(start, text.chars().count(), "invalid variable name"));
            }
            return Ok(Arg::Value(Value::Var(name.to_string())));
        }

        if let Ok(int) = text.parse::<i64>() {
            return Ok(Arg::Value(Value::Int(int)));
        }
        if let Ok(float) = text.parse::<f64>() {
            return Ok(Arg::Value(Value::Float(float)));
        }

        // nested call?
        let looks_like_call = text
            .find('(')
            .map(|open| {
                let name = &text[..open];
                !name.is_empty()
                    && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
            })
            .unwrap_or(false);
        if looks_like_call {
            return Ok(Arg::Macro(self.parse_chain(start, end)?));
        }

        // a bare key or variable name like KEY_A
        if text.chars().all(|c| c == '_' || c.is_ascii_alphanumeric() || c == '-') {
            return Ok(Arg::Value(Value::Str(text.to_string())));
        }

        Err(self.error(
            start,
            text.chars().count(),
            format!("could not parse \"{text}\""),
        ))
    }

    /// Arrange parsed arguments into parameter slots and build the task.
    fn build_task(
        &self,
        name: &str,
        call_start: usize,
        args_start: usize,
        args_end: usize,
    ) -> Result<Task, MacroParseError> {
        let call_len = args_end + 1 - call_start;
        let arg_spans = self.extract_args(args_start, args_end);
        let mut args = Vec::with_capacity(arg_spans.len());
        for &(s, e) in &arg_spans {
            args.push(self.parse_arg(s, e)?);
        }

        let call_error =
            |message: String| self.error(call_start, call_len, message);

        // hold_keys is the only variadic call
        if matches!(name, "hold_keys") {
            if args.is_empty() {
                return Err(call_error("hold_keys takes at least 1 parameter".into()));
            }
            let mut symbols = Vec::with_capacity(args.len());
            for parsed in args {
                match parsed.arg {
                    Arg::Value(value) => symbols.push(value),
                    _ => return Err(call_error("hold_keys parameters must be symbols".into())),
                }
            }
            return Ok(Task::HoldKeys { symbols });
        }

        let params: &[&str] = match name {
            "key" | "k" => &["symbol"],
            "key_down" => &["symbol"],
            "key_up" => &["symbol"],
            "wait" | "w" => &["time", "max"],
            "repeat" | "r" => &["repeats", "macro"],
            "modify" | "m" => &["modifier", "macro"],
            "hold" | "h" => &["macro"],
            "mod_tap" => &["default", "modifier", "tapping_term"],
            "mouse" => &["direction", "speed", "acceleration"],
            "mouse_xy" => &["x", "y", "acceleration"],
            "wheel" => &["direction", "speed"],
            "event" | "e" => &["type", "code", "value"],
            "set" => &["variable", "value"],
            "add" => &["variable", "value"],
            "if_eq" => &["value_1", "value_2", "then", "else"],
            "ifeq" => &["variable", "value", "then", "else"],
            "if_tap" => &["then", "else", "timeout"],
            "if_single" => &["then", "else", "timeout"],
            "if_capslock" => &["then", "else"],
            "if_numlock" => &["then", "else"],
            _ => return Err(call_error(format!("unknown function \"{name}\""))),
        };

        let min_args: usize = match name {
            "hold" | "h" | "if_tap" | "if_single" | "if_capslock" | "if_numlock" => 0,
            "wait" | "w" | "key" | "k" | "key_down" | "key_up" => 1,
            "if_eq" | "ifeq" | "mod_tap" | "mouse" | "mouse_xy" => 2,
            "event" | "e" => 3,
            _ => params.len(),
        };

        if args.len() < min_args || args.len() > params.len() {
            let msg = if min_args == params.len() {
                format!("{name} takes {min_args}, not {} parameters", args.len())
            } else {
                format!(
                    "{name} takes between {min_args} and {}, not {} parameters",
                    params.len(),
                    args.len()
                )
            };
            return Err(call_error(msg));
        }

        // assign positionals, then keywords
        let mut slots: Vec<Option<Arg>> = params.iter().map(|_| None).collect();
        let mut seen_keyword = false;
        for (i, parsed) in args.into_iter().enumerate() {
            match parsed.keyword {
                None => {
                    if seen_keyword {
                        return Err(call_error(
                            "positional argument follows keyword argument".into(),
                        ));
                    }
                    slots[i] = Some(parsed.arg);
                }
                Some(keyword) => {
                    seen_keyword = true;
                    let position = params.iter().position(|&p| p == keyword).ok_or_else(|| {
                        call_error(format!("{name} has no \"{keyword}\" parameter"))
                    })?;
                    if slots[position].is_some() {
                        return Err(call_error(format!(
                            "the \"{keyword}\" argument was specified twice"
                        )));
                    }
                    slots[position] = Some(parsed.arg);
                }
            }
        }

        let mut slots = slots.into_iter();
        let mut next = || slots.next().unwrap_or(None);

        let value = |arg: Option<Arg>, param: &str| -> Result<Value, MacroParseError> {
            match arg {
                Some(Arg::Value(value)) => Ok(value),
                Some(Arg::Macro(_)) => {
                    Err(call_error(format!("\"{param}\" of {name} must not be a macro")))
                }
                Some(Arg::None) | None => {
                    Err(call_error(format!("{name} is missing \"{param}\"")))
                }
            }
        };
        let opt_value = |arg: Option<Arg>, param: &str| -> Result<Option<Value>, MacroParseError> {
            match arg {
                Some(Arg::Value(value)) => Ok(Some(value)),
                Some(Arg::Macro(_)) => {
                    Err(call_error(format!("\"{param}\" of {name} must not be a macro")))
                }
                Some(Arg::None) | None => Ok(None),
            }
        };
        let macro_arg = |arg: Option<Arg>, param: &str| -> Result<Macro, MacroParseError> {
            match arg {
                Some(Arg::Macro(body)) => Ok(body),
                _ => Err(call_error(format!("\"{param}\" of {name} must be a macro"))),
            }
        };
        let opt_macro = |arg: Option<Arg>, param: &str| -> Result<Option<Macro>, MacroParseError> {
            match arg {
                Some(Arg::Macro(body)) => Ok(Some(body)),
                Some(Arg::None) | None => Ok(None),
                Some(Arg::Value(_)) => {
                    Err(call_error(format!("\"{param}\" of {name} must be a macro")))
                }
            }
        };
        let variable = |arg: Option<Arg>, param: &str| -> Result<String, MacroParseError> {
            match arg {
                Some(Arg::Value(Value::Str(word))) => Ok(word),
                _ => Err(call_error(format!(
                    "\"{param}\" of {name} must be a variable name"
                ))),
            }
        };

        let task = match name {
            "key" | "k" => Task::Key {
                symbol: value(next(), "symbol")?,
            },
            "key_down" => Task::KeyDown {
                symbol: value(next(), "symbol")?,
            },
            "key_up" => Task::KeyUp {
                symbol: value(next(), "symbol")?,
            },
            "wait" | "w" => Task::Wait {
                time: value(next(), "time")?,
                max: opt_value(next(), "max")?,
            },
            "repeat" | "r" => Task::Repeat {
                repeats: value(next(), "repeats")?,
                body: macro_arg(next(), "macro")?,
            },
            "modify" | "m" => Task::Modify {
                modifier: value(next(), "modifier")?,
                body: macro_arg(next(), "macro")?,
            },
            "hold" | "h" => Task::Hold {
                body: match next() {
                    Some(Arg::Macro(body)) => Some(HoldBody::Macro(body)),
                    Some(Arg::Value(symbol)) => Some(HoldBody::Symbol(symbol)),
                    Some(Arg::None) | None => None,
                },
            },
            "mod_tap" => Task::ModTap {
                default: value(next(), "default")?,
                modifier: value(next(), "modifier")?,
                tapping_term: opt_value(next(), "tapping_term")?,
            },
            "mouse" => Task::Mouse {
                direction: value(next(), "direction")?,
                speed: value(next(), "speed")?,
                acceleration: opt_value(next(), "acceleration")?,
            },
            "mouse_xy" => Task::MouseXy {
                x: value(next(), "x")?,
                y: value(next(), "y")?,
                acceleration: opt_value(next(), "acceleration")?,
            },
            "wheel" => Task::Wheel {
                direction: value(next(), "direction")?,
                speed: value(next(), "speed")?,
            },
            "event" | "e" => Task::Event {
                kind: value(next(), "type")?,
                code: value(next(), "code")?,
                value: value(next(), "value")?,
            },
            "set" => Task::Set {
                variable: variable(next(), "variable")?,
                value: value(next(), "value")?,
            },
            "add" => Task::Add {
                variable: variable(next(), "variable")?,
                value: value(next(), "value")?,
            },
            "if_eq" => Task::IfEq {
                value_1: value(next(), "value_1")?,
                value_2: value(next(), "value_2")?,
                then: opt_macro(next(), "then")?,
                else_: opt_macro(next(), "else")?,
            },
            // deprecated variant, the variable name is implicit
            "ifeq" => Task::IfEq {
                value_1: Value::Var(variable(next(), "variable")?),
                value_2: value(next(), "value")?,
                then: opt_macro(next(), "then")?,
                else_: opt_macro(next(), "else")?,
            },
            "if_tap" => Task::IfTap {
                then: opt_macro(next(), "then")?,
                else_: opt_macro(next(), "else")?,
                timeout: opt_value(next(), "timeout")?,
            },
            "if_single" => Task::IfSingle {
                then: opt_macro(next(), "then")?,
                else_: opt_macro(next(), "else")?,
                timeout: opt_value(next(), "timeout")?,
            },
            "if_capslock" => Task::IfCapslock {
                then: opt_macro(next(), "then")?,
                else_: opt_macro(next(), "else")?,
            },
            "if_numlock" => Task::IfNumlock {
                then: opt_macro(next(), "then")?,
                else_: opt_macro(next(), "else")?,
            },
            _ => unreachable!("function table covered above"),
        };

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    #[test]
    fn parses_a_simple_chain() {
        let macro_ = parse("key(a).wait(10).key(b)").unwrap();
        assert_eq!(
            macro_.tasks,
            vec![
                Task::Key { symbol: sym("a") },
                Task::Wait {
                    time: Value::Int(10),
                    max: None
                },
                Task::Key { symbol: sym("b") },
            ]
        );
    }

    #[test]
    fn parses_nested_macros() {
        let macro_ = parse("repeat(3, key(a).wait(10))").unwrap();
        assert_eq!(macro_.tasks.len(), 1);
        match &macro_.tasks[0] {
            Task::Repeat { repeats, body } => {
                assert_eq!(*repeats, Value::Int(3));
                assert_eq!(body.tasks.len(), 2);
            }
            other => panic!("expected repeat, got {other:?}"),
        }
    }

    #[test]
    fn parses_shorthand_aliases() {
        let long = parse("modify(KEY_LEFTSHIFT, repeat(2, key(a))).wait(10)").unwrap();
        let short = parse("m(KEY_LEFTSHIFT, r(2, k(a))).w(10)").unwrap();
        assert_eq!(long, short);
    }

    #[test]
    fn whitespace_and_comments_are_insignificant() {
        let spaced = parse(
            "key(a) . # press a\n  wait( 10 )\n# trailing comment\n.key(b)",
        )
        .unwrap();
        let dense = parse("key(a).wait(10).key(b)").unwrap();
        assert_eq!(spaced, dense);
    }

    #[test]
    fn hash_inside_quotes_is_not_a_comment() {
        let macro_ = parse("set(foo, \"a#b\")").unwrap();
        assert_eq!(
            macro_.tasks,
            vec![Task::Set {
                variable: "foo".to_string(),
                value: Value::Str("a#b".to_string()),
            }]
        );
    }

    #[test]
    fn plus_syntax_becomes_hold_keys() {
        let plus = parse("a + b + c").unwrap();
        let explicit = parse("hold_keys(a, b, c)").unwrap();
        assert_eq!(plus, explicit);
    }

    #[test]
    fn plus_mixed_with_calls_fails() {
        assert!(parse("a + key(b)").is_err());
    }

    #[test]
    fn keyword_arguments() {
        let macro_ = parse("if_eq(1, 1, else=key(b))").unwrap();
        match &macro_.tasks[0] {
            Task::IfEq { then, else_, .. } => {
                assert!(then.is_none());
                assert!(else_.is_some());
            }
            other => panic!("expected if_eq, got {other:?}"),
        }
    }

    #[test]
    fn none_placeholders() {
        let a = parse("if_tap(None, key(b), 200)").unwrap();
        let b = parse("if_tap(, key(b), 200)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn variables_are_late_bound_values() {
        let macro_ = parse("if_eq($foo, 1, hold_keys(a), hold_keys(BTN_MIDDLE))").unwrap();
        match &macro_.tasks[0] {
            Task::IfEq { value_1, .. } => {
                assert_eq!(*value_1, Value::Var("foo".to_string()));
            }
            other => panic!("expected if_eq, got {other:?}"),
        }
    }

    #[test]
    fn deprecated_ifeq_desugars() {
        let old = parse("ifeq(foo, 1, key(a), key(b))").unwrap();
        let new = parse("if_eq($foo, 1, key(a), key(b))").unwrap();
        assert_eq!(old, new);
    }

    #[test]
    fn hold_variants() {
        assert_eq!(
            parse("hold(key(a))").unwrap().tasks[0],
            Task::Hold {
                body: Some(HoldBody::Macro(Macro::new(vec![Task::Key {
                    symbol: sym("a")
                }])))
            }
        );
        assert_eq!(
            parse("hold(a)").unwrap().tasks[0],
            Task::Hold {
                body: Some(HoldBody::Symbol(sym("a")))
            }
        );
        assert_eq!(parse("hold()").unwrap().tasks[0], Task::Hold { body: None });
    }

    #[test]
    fn wait_with_jitter_range() {
        assert_eq!(
            parse("wait(10, 20)").unwrap().tasks[0],
            Task::Wait {
                time: Value::Int(10),
                max: Some(Value::Int(20)),
            }
        );
    }

    #[test]
    fn rejects_unknown_functions() {
        let error = parse("frobnicate(1)").unwrap_err();
        assert!(error.message.contains("unknown function"));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(parse("key()").is_err());
        assert!(parse("key(a, b)").is_err());
        assert!(parse("wheel(up)").is_err());
        assert!(parse("event(1, 2)").is_err());
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        assert!(parse("key(a").is_err());
        assert!(parse("repeat(2, key(a)").is_err());
    }

    #[test]
    fn rejects_duplicate_keyword() {
        assert!(parse("if_eq(1, 1, then=key(a), then=key(b))").is_err());
    }

    #[test]
    fn rejects_positional_after_keyword() {
        assert!(parse("if_eq(1, 1, then=key(a), key(b))").is_err());
    }

    #[test]
    fn rejects_non_macros() {
        assert!(parse("a").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn detects_macros() {
        assert!(is_this_a_macro("key(a)"));
        assert!(is_this_a_macro("a + b"));
        assert!(!is_this_a_macro("a"));
        assert!(!is_this_a_macro("KEY_A"));
    }

    // parse -> print -> parse must preserve structure
    #[test]
    fn round_trips() {
        let sources = [
            "key(a).wait(10).key(b)",
            "repeat(3,key(a).wait(10))",
            "modify(KEY_LEFTSHIFT,repeat(2,key(a)))",
            "hold(key(a))",
            "hold(a)",
            "hold()",
            "hold_keys(a,b,c)",
            "mod_tap(a,KEY_LEFTSHIFT,300)",
            "mouse(up,4,1.5)",
            "mouse_xy(10,-10)",
            "wheel(down,2)",
            "event(2,8,1)",
            "set(foo,1).add(foo,2)",
            "if_eq($foo,1,key(a),key(b))",
            "if_eq(1,1,None,key(b))",
            "if_tap(key(a),key(b),300)",
            "if_single(key(a),None,1000)",
            "if_capslock(key(a),key(b))",
            "if_numlock(key(a))",
            "wait(10,20)",
        ];
        for source in sources {
            let first = parse(source).unwrap();
            let printed = first.to_string();
            let second = parse(&printed)
                .unwrap_or_else(|e| panic!("re-parse of {printed:?} failed: {e}"));
            assert_eq!(first, second, "round trip of {source:?} via {printed:?}");
        }
    }
}
