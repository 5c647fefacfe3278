//! Macro AST
//!
//! The macro text is the source of truth; this AST is the derived form the
//! runtime executes. `Display` prints a canonical rendition (all arguments
//! positional, no whitespace) that parses back to a structurally equal AST.

use std::fmt;

/// A literal or late-bound argument value.
///
/// `Var` is resolved against the shared variable store at the point of use,
/// not at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Var(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn is_bare_word(s: &str) -> bool {
        !s.is_empty()
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && s != "None"
            && s.parse::<f64>().is_err()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => {
                if x.fract() == 0.0 {
                    // keep the decimal point so it stays a float on re-parse
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => {
                if Value::is_bare_word(s) {
                    write!(f, "{s}")
                } else {
                    write!(f, "\"{s}\"")
                }
            }
            Value::Var(name) => write!(f, "${name}"),
        }
    }
}

/// The argument of `hold()`: either a nested macro to loop or a single
/// symbol to keep pressed.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldBody {
    Macro(Macro),
    Symbol(Value),
}

/// One step of a macro program.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Press, sleep half the key gap, release, sleep the other half.
    Key { symbol: Value },
    KeyDown { symbol: Value },
    KeyUp { symbol: Value },
    /// Sleep `time` ms, or a uniform sample in `[time, max]`.
    Wait { time: Value, max: Option<Value> },
    Repeat { repeats: Value, body: Macro },
    Modify { modifier: Value, body: Macro },
    /// Loop the body (or keep the symbol pressed) while the trigger is held.
    Hold { body: Option<HoldBody> },
    /// Press each in order, wait for release, release in reverse order.
    HoldKeys { symbols: Vec<Value> },
    /// Tap `default` on a quick lone release, act as `modifier` otherwise.
    ModTap {
        default: Value,
        modifier: Value,
        tapping_term: Option<Value>,
    },
    /// REL_X/REL_Y ticks in one direction until release.
    Mouse {
        direction: Value,
        speed: Value,
        acceleration: Option<Value>,
    },
    MouseXy {
        x: Value,
        y: Value,
        acceleration: Option<Value>,
    },
    Wheel { direction: Value, speed: Value },
    /// Raw event emission.
    Event { kind: Value, code: Value, value: Value },
    Set { variable: String, value: Value },
    Add { variable: String, value: Value },
    IfEq {
        value_1: Value,
        value_2: Value,
        then: Option<Macro>,
        else_: Option<Macro>,
    },
    IfTap {
        then: Option<Macro>,
        else_: Option<Macro>,
        timeout: Option<Value>,
    },
    IfSingle {
        then: Option<Macro>,
        else_: Option<Macro>,
        timeout: Option<Value>,
    },
    IfCapslock {
        then: Option<Macro>,
        else_: Option<Macro>,
    },
    IfNumlock {
        then: Option<Macro>,
        else_: Option<Macro>,
    },
}

/// A parsed macro: a dot-chained sequence of tasks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Macro {
    pub tasks: Vec<Task>,
}

impl Macro {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

enum PrintArg<'a> {
    Value(&'a Value),
    OptValue(Option<&'a Value>),
    Macro(&'a Macro),
    OptMacro(Option<&'a Macro>),
    Word(&'a str),
    Hold(Option<&'a HoldBody>),
}

fn write_call(f: &mut fmt::Formatter<'_>, name: &str, args: &[PrintArg<'_>]) -> fmt::Result {
    // positional form; trailing absent optionals are dropped, inner ones
    // are printed as None
    let mut last_present = 0;
    for (i, arg) in args.iter().enumerate() {
        let present = !matches!(
            arg,
            PrintArg::OptValue(None) | PrintArg::OptMacro(None) | PrintArg::Hold(None)
        );
        if present {
            last_present = i + 1;
        }
    }

    write!(f, "{name}(")?;
    for (i, arg) in args.iter().take(last_present).enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        match arg {
            PrintArg::Value(value) => write!(f, "{value}")?,
            PrintArg::OptValue(Some(value)) => write!(f, "{value}")?,
            PrintArg::Macro(body) => write!(f, "{body}")?,
            PrintArg::OptMacro(Some(body)) => write!(f, "{body}")?,
            PrintArg::Word(word) => write!(f, "{word}")?,
            PrintArg::Hold(Some(HoldBody::Macro(body))) => write!(f, "{body}")?,
            PrintArg::Hold(Some(HoldBody::Symbol(symbol))) => write!(f, "{symbol}")?,
            PrintArg::OptValue(None) | PrintArg::OptMacro(None) | PrintArg::Hold(None) => {
                write!(f, "None")?
            }
        }
    }
    write!(f, ")")
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PrintArg::*;
        match self {
            Task::Key { symbol } => write_call(f, "key", &[Value(symbol)]),
            Task::KeyDown { symbol } => write_call(f, "key_down", &[Value(symbol)]),
            Task::KeyUp { symbol } => write_call(f, "key_up", &[Value(symbol)]),
            Task::Wait { time, max } => {
                write_call(f, "wait", &[Value(time), OptValue(max.as_ref())])
            }
            Task::Repeat { repeats, body } => {
                write_call(f, "repeat", &[Value(repeats), Macro(body)])
            }
            Task::Modify { modifier, body } => {
                write_call(f, "modify", &[Value(modifier), Macro(body)])
            }
            Task::Hold { body } => write_call(f, "hold", &[Hold(body.as_ref())]),
            Task::HoldKeys { symbols } => {
                let args: Vec<PrintArg<'_>> = symbols.iter().map(Value).collect();
                write_call(f, "hold_keys", &args)
            }
            Task::ModTap {
                default,
                modifier,
                tapping_term,
            } => write_call(
                f,
                "mod_tap",
                &[Value(default), Value(modifier), OptValue(tapping_term.as_ref())],
            ),
            Task::Mouse {
                direction,
                speed,
                acceleration,
            } => write_call(
                f,
                "mouse",
                &[Value(direction), Value(speed), OptValue(acceleration.as_ref())],
            ),
            Task::MouseXy { x, y, acceleration } => write_call(
                f,
                "mouse_xy",
                &[Value(x), Value(y), OptValue(acceleration.as_ref())],
            ),
            Task::Wheel { direction, speed } => {
                write_call(f, "wheel", &[Value(direction), Value(speed)])
            }
            Task::Event { kind, code, value } => {
                write_call(f, "event", &[Value(kind), Value(code), Value(value)])
            }
            Task::Set { variable, value } => write_call(f, "set", &[Word(variable), Value(value)]),
            Task::Add { variable, value } => write_call(f, "add", &[Word(variable), Value(value)]),
            Task::IfEq {
                value_1,
                value_2,
                then,
                else_,
            } => write_call(
                f,
                "if_eq",
                &[
                    Value(value_1),
                    Value(value_2),
                    OptMacro(then.as_ref()),
                    OptMacro(else_.as_ref()),
                ],
            ),
            Task::IfTap {
                then,
                else_,
                timeout,
            } => write_call(
                f,
                "if_tap",
                &[
                    OptMacro(then.as_ref()),
                    OptMacro(else_.as_ref()),
                    OptValue(timeout.as_ref()),
                ],
            ),
            Task::IfSingle {
                then,
                else_,
                timeout,
            } => write_call(
                f,
                "if_single",
                &[
                    OptMacro(then.as_ref()),
                    OptMacro(else_.as_ref()),
                    OptValue(timeout.as_ref()),
                ],
            ),
            Task::IfCapslock { then, else_ } => write_call(
                f,
                "if_capslock",
                &[OptMacro(then.as_ref()), OptMacro(else_.as_ref())],
            ),
            Task::IfNumlock { then, else_ } => write_call(
                f,
                "if_numlock",
                &[OptMacro(then.as_ref()), OptMacro(else_.as_ref())],
            ),
        }
    }
}

impl fmt::Display for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, task) in self.tasks.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{task}")?;
        }
        Ok(())
    }
}
