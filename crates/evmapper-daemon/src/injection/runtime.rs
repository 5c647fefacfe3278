//! Macro runtime
//!
//! Executes parsed macro programs as cooperative tasks. Every suspension
//! point is an explicit await (`wait`, `hold` iterations, rate-limited
//! emitters), one task runs per press instance, and the triggering key's
//! release flips the instance's held flag, which tasks observe at their
//! next suspension point. A finishing or cancelled task emits the key-up
//! edges it still owes, so presses and releases stay balanced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evmapper_config::macros::{HoldBody, Macro, Task, Value};
use evmapper_config::{EventKind, TargetDevice};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::injection::context::{Context, VarValue};
use crate::injection::shaping::{FractionalCarry, WHEEL_HI_RES_SCALING, WHEEL_SCALING};
use crate::outputs::Event;

/// Ceiling for a single `wait`; a longer one counts as a hung macro.
const MAX_WAIT_MS: u64 = 60_000;

const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_HWHEEL: u16 = 0x06;
const REL_WHEEL: u16 = 0x08;
const REL_WHEEL_HI_RES: u16 = 0x0b;
const REL_HWHEEL_HI_RES: u16 = 0x0c;

/// Error during macro execution. Logged per mapping; further presses on the
/// mapping are still attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroError {
    pub message: String,
}

impl MacroError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MacroError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Everything needed to start one macro press instance.
pub struct MacroSpawn {
    pub program: Arc<Macro>,
    pub ctx: Arc<Context>,
    pub target: TargetDevice,
    pub mapping_index: usize,
    pub key_sleep_ms: u64,
    pub rel_rate: u16,
}

/// Handle the spawning handler keeps to signal the trigger release.
pub struct MacroInstance {
    pub id: u64,
    held: watch::Sender<bool>,
}

impl MacroInstance {
    /// The triggering key was released; the task observes this at its next
    /// suspension point.
    pub fn release(&self) {
        let _ = self.held.send(false);
    }
}

/// Spawns and tracks macro tasks for one injection.
#[derive(Default)]
pub struct MacroRuntime {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, RunningTask>>,
}

struct RunningTask {
    held: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MacroRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a task for one press of a macro mapping.
    pub fn spawn(self: &Arc<Self>, spawn: MacroSpawn) -> MacroInstance {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (held_tx, held_rx) = watch::channel(true);

        let runtime = Arc::clone(self);
        let mapping_index = spawn.mapping_index;
        let handle = tokio::spawn(async move {
            let mut exec = MacroExec {
                ctx: Arc::clone(&spawn.ctx),
                target: spawn.target,
                key_sleep: Duration::from_millis(spawn.key_sleep_ms),
                rel_interval: Duration::from_secs_f64(1.0 / f64::from(spawn.rel_rate.max(1))),
                held: held_rx,
                press_snapshot: spawn.ctx.presses(),
                owed: Vec::new(),
            };

            if let Err(error) = exec.run_macro(&spawn.program).await {
                exec.ctx.macro_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("macro error in mapping {mapping_index}: {error}");
            }

            // emit whatever key-up edges the macro still owes
            for code in exec.owed.drain(..).rev() {
                exec.ctx.outputs.write(exec.target, Event::key(code, 0));
            }

            runtime.tasks.lock().expect("task table poisoned").remove(&id);
        });

        self.tasks
            .lock()
            .expect("task table poisoned")
            .insert(id, RunningTask {
                held: held_tx.clone(),
                handle,
            });

        MacroInstance { id, held: held_tx }
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        self.tasks.lock().expect("task table poisoned").len()
    }

    /// Cancel every task cooperatively and wait for the drain, bounded.
    pub async fn shutdown(&self, drain: Duration) {
        let tasks: Vec<RunningTask> = {
            let mut table = self.tasks.lock().expect("task table poisoned");
            table.drain().map(|(_, task)| task).collect()
        };

        for task in &tasks {
            let _ = task.held.send(false);
        }

        for task in tasks {
            if timeout(drain, task.handle).await.is_err() {
                tracing::warn!("macro task did not drain in time, aborting");
            }
        }
    }
}

/// Wait until the instance's held flag goes false.
async fn released(mut held: watch::Receiver<bool>) {
    while *held.borrow() {
        if held.changed().await.is_err() {
            break;
        }
    }
}

/// A value resolved against the shared variable store.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Int(i64),
    Float(f64),
    Str(String),
}

struct MacroExec {
    ctx: Arc<Context>,
    target: TargetDevice,
    key_sleep: Duration,
    rel_interval: Duration,
    held: watch::Receiver<bool>,
    press_snapshot: u64,
    /// Key codes pressed by this task and not yet released.
    owed: Vec<u16>,
}

impl MacroExec {
    fn run_macro<'a>(
        &'a mut self,
        program: &'a Macro,
    ) -> futures_util::future::BoxFuture<'a, Result<(), MacroError>> {
        Box::pin(async move {
            for task in &program.tasks {
                self.run_task(task).await?;
            }
            Ok(())
        })
    }

    async fn run_task(&mut self, task: &Task) -> Result<(), MacroError> {
        match task {
            Task::Key { symbol } => {
                let code = self.resolve_key(symbol)?;
                self.press(code);
                self.key_pause().await;
                self.release(code);
                self.key_pause().await;
            }
            Task::KeyDown { symbol } => {
                let code = self.resolve_key(symbol)?;
                self.press(code);
            }
            Task::KeyUp { symbol } => {
                let code = self.resolve_key(symbol)?;
                self.release(code);
            }
            Task::Wait { time, max } => {
                let time = self.resolve_ms(time)?;
                let duration = match max {
                    None => time,
                    Some(max) => {
                        let max = self.resolve_ms(max)?.max(time);
                        rand::thread_rng().gen_range(time..=max)
                    }
                };
                if duration > MAX_WAIT_MS {
                    return Err(MacroError::new(format!(
                        "wait({duration}) exceeds the {MAX_WAIT_MS} ms ceiling"
                    )));
                }
                sleep(Duration::from_millis(duration)).await;
            }
            Task::Repeat { repeats, body } => {
                let repeats = self.resolve_int(repeats)?;
                for _ in 0..repeats.max(0) {
                    self.run_macro(body).await?;
                }
            }
            Task::Modify { modifier, body } => {
                let code = self.resolve_key(modifier)?;
                self.press(code);
                self.key_pause().await;
                let result = self.run_macro(body).await;
                self.release(code);
                result?;
            }
            Task::Hold { body } => match body {
                None => released(self.held.clone()).await,
                Some(HoldBody::Symbol(symbol)) => {
                    let code = self.resolve_key(symbol)?;
                    self.press(code);
                    released(self.held.clone()).await;
                    self.release(code);
                }
                Some(HoldBody::Macro(body)) => {
                    while self.is_held() {
                        self.run_macro(body).await?;
                    }
                }
            },
            Task::HoldKeys { symbols } => {
                let mut codes = Vec::with_capacity(symbols.len());
                for symbol in symbols {
                    codes.push(self.resolve_key(symbol)?);
                }
                for &code in &codes {
                    self.press(code);
                    self.key_pause().await;
                }
                released(self.held.clone()).await;
                for &code in codes.iter().rev() {
                    self.release(code);
                    self.key_pause().await;
                }
            }
            Task::ModTap {
                default,
                modifier,
                tapping_term,
            } => {
                let term = match tapping_term {
                    Some(term) => self.resolve_ms(term)?,
                    None => 200,
                };
                let tapped = timeout(
                    Duration::from_millis(term),
                    released(self.held.clone()),
                )
                .await
                .is_ok();

                if tapped && self.ctx.presses() == self.press_snapshot {
                    let code = self.resolve_key(default)?;
                    self.press(code);
                    self.key_pause().await;
                    self.release(code);
                } else {
                    let code = self.resolve_key(modifier)?;
                    self.press(code);
                    released(self.held.clone()).await;
                    self.release(code);
                }
            }
            Task::Mouse {
                direction,
                speed,
                acceleration,
            } => {
                let direction = self.resolve_word(direction)?;
                let speed = self.resolve_float(speed)?;
                let (code, sign) = match direction.as_str() {
                    "up" => (REL_Y, -1.0),
                    "down" => (REL_Y, 1.0),
                    "left" => (REL_X, -1.0),
                    "right" => (REL_X, 1.0),
                    other => {
                        return Err(MacroError::new(format!(
                            "unknown mouse direction \"{other}\""
                        )))
                    }
                };
                let acceleration = match acceleration {
                    Some(value) => Some(self.resolve_float(value)?),
                    None => None,
                };
                self.pointer_loop(&[(code, sign * speed)], acceleration).await;
            }
            Task::MouseXy { x, y, acceleration } => {
                let x = self.resolve_float(x)?;
                let y = self.resolve_float(y)?;
                let acceleration = match acceleration {
                    Some(value) => Some(self.resolve_float(value)?),
                    None => None,
                };
                self.pointer_loop(&[(REL_X, x), (REL_Y, y)], acceleration).await;
            }
            Task::Wheel { direction, speed } => {
                let direction = self.resolve_word(direction)?;
                let speed = self.resolve_float(speed)?;
                let (low, high, sign) = match direction.as_str() {
                    "up" => (REL_WHEEL, REL_WHEEL_HI_RES, 1.0),
                    "down" => (REL_WHEEL, REL_WHEEL_HI_RES, -1.0),
                    "left" => (REL_HWHEEL, REL_HWHEEL_HI_RES, -1.0),
                    "right" => (REL_HWHEEL, REL_HWHEEL_HI_RES, 1.0),
                    other => {
                        return Err(MacroError::new(format!(
                            "unknown wheel direction \"{other}\""
                        )))
                    }
                };

                let per_tick = sign * speed * self.rel_interval.as_secs_f64();
                let mut low_carry = FractionalCarry::default();
                let mut high_carry = FractionalCarry::default();
                while self.is_held() {
                    let low_delta = low_carry.advance(per_tick * WHEEL_SCALING);
                    if low_delta != 0 {
                        self.write(Event::new(EventKind::Rel, low, low_delta));
                    }
                    let high_delta = high_carry.advance(per_tick * WHEEL_HI_RES_SCALING);
                    if high_delta != 0 {
                        self.write(Event::new(EventKind::Rel, high, high_delta));
                    }
                    sleep(self.rel_interval).await;
                }
            }
            Task::Event { kind, code, value } => {
                let kind = self.resolve_event_kind(kind)?;
                let code = self.resolve_code(kind, code)?;
                let value = self.resolve_int(value)?;
                self.write(Event::new(kind, code, value as i32));
            }
            Task::Set { variable, value } => {
                let value = match self.resolve(value)? {
                    Resolved::Int(n) => VarValue::Int(n),
                    Resolved::Float(x) => VarValue::Int(x.round() as i64),
                    Resolved::Str(s) => VarValue::Str(s),
                };
                self.ctx.vars.set(variable, value);
            }
            Task::Add { variable, value } => {
                let amount = self.resolve_int(value)?;
                self.ctx.vars.add(variable, amount);
            }
            Task::IfEq {
                value_1,
                value_2,
                then,
                else_,
            } => {
                let a = self.resolve_opt(value_1)?;
                let b = self.resolve_opt(value_2)?;
                self.run_branch(values_equal(&a, &b), then, else_).await?;
            }
            Task::IfTap {
                then,
                else_,
                timeout: limit,
            } => {
                let limit = match limit {
                    Some(limit) => self.resolve_ms(limit)?,
                    None => 300,
                };
                let tapped = timeout(
                    Duration::from_millis(limit),
                    released(self.held.clone()),
                )
                .await
                .is_ok();
                self.run_branch(tapped, then, else_).await?;
            }
            Task::IfSingle {
                then,
                else_,
                timeout: limit,
            } => {
                let release_seen = match limit {
                    None => {
                        released(self.held.clone()).await;
                        true
                    }
                    Some(limit) => {
                        let limit = self.resolve_ms(limit)?;
                        timeout(Duration::from_millis(limit), released(self.held.clone()))
                            .await
                            .is_ok()
                    }
                };
                let single = release_seen && self.ctx.presses() == self.press_snapshot;
                self.run_branch(single, then, else_).await?;
            }
            Task::IfCapslock { then, else_ } => {
                let on = self.ctx.leds.capslock.load(Ordering::Relaxed);
                self.run_branch(on, then, else_).await?;
            }
            Task::IfNumlock { then, else_ } => {
                let on = self.ctx.leds.numlock.load(Ordering::Relaxed);
                self.run_branch(on, then, else_).await?;
            }
        }
        Ok(())
    }

    async fn run_branch(
        &mut self,
        condition: bool,
        then: &Option<Macro>,
        else_: &Option<Macro>,
    ) -> Result<(), MacroError> {
        let branch = if condition { then } else { else_ };
        if let Some(branch) = branch {
            self.run_macro(branch).await?;
        }
        Ok(())
    }

    /// Inject REL ticks until release, with optional linear ramp-up.
    async fn pointer_loop(&mut self, axes: &[(u16, f64)], acceleration: Option<f64>) {
        let mut carries: Vec<FractionalCarry> = axes.iter().map(|_| FractionalCarry::default()).collect();
        let mut ramp: f64 = match acceleration {
            Some(_) => 0.0,
            None => 1.0,
        };

        while self.is_held() {
            if let Some(acceleration) = acceleration {
                ramp = (ramp + acceleration * self.rel_interval.as_secs_f64()).min(1.0);
            }
            for (i, &(code, speed)) in axes.iter().enumerate() {
                let delta = carries[i].advance(speed * ramp);
                if delta != 0 {
                    self.write(Event::new(EventKind::Rel, code, delta));
                }
            }
            sleep(self.rel_interval).await;
        }
    }

    fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    fn write(&self, event: Event) {
        self.ctx.outputs.write(self.target, event);
    }

    fn press(&mut self, code: u16) {
        self.write(Event::key(code, 1));
        self.owed.push(code);
    }

    fn release(&mut self, code: u16) {
        self.write(Event::key(code, 0));
        if let Some(position) = self.owed.iter().rposition(|&owed| owed == code) {
            self.owed.remove(position);
        }
    }

    async fn key_pause(&self) {
        if !self.key_sleep.is_zero() {
            sleep(self.key_sleep / 2).await;
        }
    }

    fn resolve(&self, value: &Value) -> Result<Resolved, MacroError> {
        self.resolve_opt(value)?.ok_or_else(|| match value {
            Value::Var(name) => MacroError::new(format!("the variable ${name} is not set")),
            _ => MacroError::new("missing value"),
        })
    }

    fn resolve_opt(&self, value: &Value) -> Result<Option<Resolved>, MacroError> {
        Ok(match value {
            Value::Int(n) => Some(Resolved::Int(*n)),
            Value::Float(x) => Some(Resolved::Float(*x)),
            Value::Str(s) => Some(Resolved::Str(s.clone())),
            Value::Var(name) => self.ctx.vars.get(name).map(|stored| match stored {
                VarValue::Int(n) => Resolved::Int(n),
                VarValue::Str(s) => Resolved::Str(s),
            }),
        })
    }

    fn resolve_int(&self, value: &Value) -> Result<i64, MacroError> {
        match self.resolve(value)? {
            Resolved::Int(n) => Ok(n),
            Resolved::Float(x) => Ok(x as i64),
            Resolved::Str(s) => s
                .parse()
                .map_err(|_| MacroError::new(format!("\"{s}\" is not a number"))),
        }
    }

    fn resolve_float(&self, value: &Value) -> Result<f64, MacroError> {
        match self.resolve(value)? {
            Resolved::Int(n) => Ok(n as f64),
            Resolved::Float(x) => Ok(x),
            Resolved::Str(s) => s
                .parse()
                .map_err(|_| MacroError::new(format!("\"{s}\" is not a number"))),
        }
    }

    fn resolve_ms(&self, value: &Value) -> Result<u64, MacroError> {
        let ms = self.resolve_int(value)?;
        if ms < 0 {
            return Err(MacroError::new(format!("negative duration {ms}")));
        }
        Ok(ms as u64)
    }

    fn resolve_word(&self, value: &Value) -> Result<String, MacroError> {
        match self.resolve(value)? {
            Resolved::Str(s) => Ok(s.to_lowercase()),
            other => Err(MacroError::new(format!("expected a name, got {other:?}"))),
        }
    }

    fn resolve_key(&self, value: &Value) -> Result<u16, MacroError> {
        match self.resolve(value)? {
            Resolved::Str(name) => self
                .ctx
                .symbols
                .key(&name)
                .ok_or_else(|| MacroError::new(format!("unknown key \"{name}\""))),
            Resolved::Int(code) if (0..=u16::MAX as i64).contains(&code) => Ok(code as u16),
            other => Err(MacroError::new(format!("expected a key, got {other:?}"))),
        }
    }

    fn resolve_event_kind(&self, value: &Value) -> Result<EventKind, MacroError> {
        match self.resolve(value)? {
            Resolved::Str(name) => EventKind::parse_name(&name)
                .ok_or_else(|| MacroError::new(format!("unknown event type \"{name}\""))),
            Resolved::Int(raw) if (0..=u16::MAX as i64).contains(&raw) => {
                EventKind::from_raw(raw as u16)
                    .ok_or_else(|| MacroError::new(format!("unknown event type {raw}")))
            }
            other => Err(MacroError::new(format!("expected an event type, got {other:?}"))),
        }
    }

    fn resolve_code(&self, kind: EventKind, value: &Value) -> Result<u16, MacroError> {
        match self.resolve(value)? {
            Resolved::Str(name) => self
                .ctx
                .symbols
                .code(kind, &name)
                .ok_or_else(|| MacroError::new(format!("unknown code \"{name}\""))),
            Resolved::Int(code) if (0..=u16::MAX as i64).contains(&code) => Ok(code as u16),
            other => Err(MacroError::new(format!("expected a code, got {other:?}"))),
        }
    }
}

fn values_equal(a: &Option<Resolved>, b: &Option<Resolved>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => match (a, b) {
            (Resolved::Int(a), Resolved::Int(b)) => a == b,
            (Resolved::Float(a), Resolved::Float(b)) => a == b,
            (Resolved::Int(a), Resolved::Float(b)) | (Resolved::Float(b), Resolved::Int(a)) => {
                *a as f64 == *b
            }
            (Resolved::Str(a), Resolved::Str(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmapper_config::macros::parse;
    use evmapper_config::{CompiledPreset, SymbolTable};
    use crate::outputs::OutputRegistry;

    fn test_context() -> Arc<Context> {
        let outputs = Arc::new(OutputRegistry::recording());
        let forward = outputs.get(TargetDevice::KeyboardMouse);
        Arc::new(Context::new(
            CompiledPreset::default(),
            Arc::new(SymbolTable::new()),
            Arc::clone(&outputs),
            forward,
            crate::injection::context::SharedVars::new(),
        ))
    }

    fn spawn_program(
        runtime: &Arc<MacroRuntime>,
        ctx: &Arc<Context>,
        code: &str,
    ) -> MacroInstance {
        runtime.spawn(MacroSpawn {
            program: Arc::new(parse(code).unwrap()),
            ctx: Arc::clone(ctx),
            target: TargetDevice::Keyboard,
            mapping_index: 0,
            key_sleep_ms: 10,
            rel_rate: 60,
        })
    }

    async fn drain(runtime: &Arc<MacroRuntime>) {
        runtime.shutdown(Duration::from_secs(5)).await;
    }

    fn keyboard_events(ctx: &Context) -> Vec<Event> {
        ctx.outputs.get(TargetDevice::Keyboard).recorded()
    }

    #[tokio::test(start_paused = true)]
    async fn key_emits_press_and_release() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let a = evdev::Key::KEY_A.code();

        spawn_program(&runtime, &ctx, "key(a)");
        drain(&runtime).await;

        assert_eq!(keyboard_events(&ctx), vec![Event::key(a, 1), Event::key(a, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_runs_n_full_executions() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        spawn_program(&runtime, &ctx, "repeat(3, key(a).wait(10))");
        drain(&runtime).await;

        let presses = keyboard_events(&ctx).iter().filter(|e| e.is_press()).count();
        assert_eq!(presses, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_zero_has_no_effect() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        spawn_program(&runtime, &ctx, "repeat(0, key(a))");
        drain(&runtime).await;

        assert!(keyboard_events(&ctx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn modify_wraps_the_body() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let shift = evdev::Key::KEY_LEFTSHIFT.code();
        let a = evdev::Key::KEY_A.code();

        spawn_program(&runtime, &ctx, "modify(KEY_LEFTSHIFT, key(a))");
        drain(&runtime).await;

        assert_eq!(
            keyboard_events(&ctx),
            vec![
                Event::key(shift, 1),
                Event::key(a, 1),
                Event::key(a, 0),
                Event::key(shift, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hold_keys_releases_in_reverse_on_trigger_release() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let a = evdev::Key::KEY_A.code();
        let b = evdev::Key::KEY_B.code();

        let instance = spawn_program(&runtime, &ctx, "hold_keys(a, b)");
        tokio::time::sleep(Duration::from_millis(50)).await;
        instance.release();
        drain(&runtime).await;

        assert_eq!(
            keyboard_events(&ctx),
            vec![
                Event::key(a, 1),
                Event::key(b, 1),
                Event::key(b, 0),
                Event::key(a, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_emits_owed_key_ups() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let a = evdev::Key::KEY_A.code();

        spawn_program(&runtime, &ctx, "key_down(a).hold()");
        tokio::time::sleep(Duration::from_millis(20)).await;
        drain(&runtime).await;

        let events = keyboard_events(&ctx);
        assert_eq!(events, vec![Event::key(a, 1), Event::key(a, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn if_tap_picks_then_on_quick_release() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let a = evdev::Key::KEY_A.code();

        let instance = spawn_program(&runtime, &ctx, "if_tap(key(a), key(b), 300)");
        tokio::time::sleep(Duration::from_millis(100)).await;
        instance.release();
        drain(&runtime).await;

        assert_eq!(keyboard_events(&ctx), vec![Event::key(a, 1), Event::key(a, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn if_tap_picks_else_after_timeout() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let b = evdev::Key::KEY_B.code();

        let instance = spawn_program(&runtime, &ctx, "if_tap(key(a), key(b), 300)");
        tokio::time::sleep(Duration::from_millis(500)).await;
        instance.release();
        drain(&runtime).await;

        assert_eq!(keyboard_events(&ctx), vec![Event::key(b, 1), Event::key(b, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_variables_and_if_eq() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();
        let a = evdev::Key::KEY_A.code();

        spawn_program(&runtime, &ctx, "set(foo, 1)");
        drain(&runtime).await;
        assert_eq!(ctx.vars.get("foo"), Some(VarValue::Int(1)));

        spawn_program(&runtime, &ctx, "if_eq($foo, 1, key(a), key(b))");
        drain(&runtime).await;
        assert_eq!(keyboard_events(&ctx), vec![Event::key(a, 1), Event::key(a, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn add_increments_atomically() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        spawn_program(&runtime, &ctx, "set(n, 1).add(n, 4)");
        drain(&runtime).await;

        assert_eq!(ctx.vars.get("n"), Some(VarValue::Int(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn mouse_ticks_until_release() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        let instance = runtime.spawn(MacroSpawn {
            program: Arc::new(parse("mouse(right, 4)").unwrap()),
            ctx: Arc::clone(&ctx),
            target: TargetDevice::Mouse,
            mapping_index: 0,
            key_sleep_ms: 0,
            rel_rate: 60,
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        instance.release();
        drain(&runtime).await;

        let events = ctx.outputs.get(TargetDevice::Mouse).recorded();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.kind == EventKind::Rel && e.code == REL_X));
        let total: i32 = events.iter().map(|e| e.value).sum();
        // ~30 ticks of 4 units
        assert!(total > 100 && total < 140, "total {total}");
    }

    #[tokio::test(start_paused = true)]
    async fn wheel_emits_low_and_hi_res() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        let instance = runtime.spawn(MacroSpawn {
            program: Arc::new(parse("wheel(down, 2)").unwrap()),
            ctx: Arc::clone(&ctx),
            target: TargetDevice::Mouse,
            mapping_index: 0,
            key_sleep_ms: 0,
            rel_rate: 60,
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        instance.release();
        drain(&runtime).await;

        let events = ctx.outputs.get(TargetDevice::Mouse).recorded();
        let low: i32 = events
            .iter()
            .filter(|e| e.code == REL_WHEEL)
            .map(|e| e.value)
            .sum();
        let high: i32 = events
            .iter()
            .filter(|e| e.code == REL_WHEEL_HI_RES)
            .map(|e| e.value)
            .sum();
        assert!(low <= -1, "low {low}");
        assert!((high - low * 120).abs() <= 120, "low {low} high {high}");
    }

    #[tokio::test(start_paused = true)]
    async fn event_emits_raw_events() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        let _ = runtime.spawn(MacroSpawn {
            program: Arc::new(parse("event(EV_REL, REL_WHEEL, 1)").unwrap()),
            ctx: Arc::clone(&ctx),
            target: TargetDevice::Mouse,
            mapping_index: 0,
            key_sleep_ms: 0,
            rel_rate: 60,
        });
        drain(&runtime).await;

        assert_eq!(
            ctx.outputs.get(TargetDevice::Mouse).recorded(),
            vec![Event::new(EventKind::Rel, REL_WHEEL, 1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_errors_do_not_leak_tasks() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        spawn_program(&runtime, &ctx, "key(not_a_key)");
        drain(&runtime).await;

        assert_eq!(runtime.running(), 0);
        assert!(keyboard_events(&ctx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn excessive_wait_is_a_hung_macro() {
        let ctx = test_context();
        let runtime = MacroRuntime::new();

        spawn_program(&runtime, &ctx, "wait(61000).key(a)");
        drain(&runtime).await;

        // the wait errored out before key(a)
        assert!(keyboard_events(&ctx).is_empty());
    }
}
