//! Analog axis handlers
//!
//! Three shapes of axis mapping: absolute to absolute (sample for sample),
//! absolute to relative (a rate emitter ticking while the input is outside
//! the deadzone), and relative to absolute (ticks accumulate into a virtual
//! position that recenters after `release_timeout` of silence).
//!
//! A combination may gate an axis mapping behind held buttons; the gate is
//! tracked here without resolver involvement since axis outputs are never
//! "pressed keys".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evmapper_config::{EventKind, InputConfig, InputMatchKey, TargetDevice};
use tokio::sync::mpsc;

use crate::injection::context::Context;
use crate::injection::handlers::trigger::{AbsTrigger, RelTrigger, TriggerUpdate};
use crate::injection::handlers::Verdict;
use crate::injection::pipeline::{PipelineMsg, SourcedEvent};
use crate::injection::shaping::{
    denormalize, normalize_rel, FractionalCarry, Transformation, REL_XY_SCALING, WHEEL_HI_RES_SCALING,
    WHEEL_SCALING,
};
use crate::outputs::Event;

const REL_HWHEEL: u16 = 0x06;
const REL_WHEEL: u16 = 0x08;
const REL_WHEEL_HI_RES: u16 = 0x0b;
const REL_HWHEEL_HI_RES: u16 = 0x0c;

/// Shaping parameters shared by the axis handlers.
#[derive(Debug, Clone, Copy)]
pub struct Shaping {
    pub deadzone: f64,
    pub gain: f64,
    pub expo: f64,
}

enum GateCondition {
    Key,
    Abs(AbsTrigger),
    Rel(RelTrigger),
}

enum GateUpdate {
    NotMine,
    Changed(bool),
    NoChange,
}

/// Held-button conditions gating an axis mapping.
struct ComboGate {
    match_keys: Vec<InputMatchKey>,
    conditions: Vec<GateCondition>,
    satisfied: Vec<bool>,
}

impl ComboGate {
    /// Build from the non-analog configs of a combination.
    fn new(configs: &[InputConfig]) -> Self {
        let gated: Vec<&InputConfig> = configs
            .iter()
            .filter(|config| !config.defines_analog_input())
            .collect();
        Self {
            match_keys: gated.iter().map(|c| c.match_key()).collect(),
            conditions: gated
                .iter()
                .map(|config| match config.kind {
                    EventKind::Abs => {
                        GateCondition::Abs(AbsTrigger::new(config.analog_threshold.unwrap_or(100)))
                    }
                    EventKind::Rel => {
                        GateCondition::Rel(RelTrigger::new(config.analog_threshold.unwrap_or(1)))
                    }
                    _ => GateCondition::Key,
                })
                .collect(),
            satisfied: vec![false; gated.len()],
        }
    }

    fn active(&self) -> bool {
        self.satisfied.iter().all(|&s| s)
    }

    fn notify(&mut self, event: &SourcedEvent, ctx: &Context) -> GateUpdate {
        let Some(index) = self.match_keys.iter().position(|key| {
            key.matches(event.event.kind, event.event.code, &event.origin)
        }) else {
            return GateUpdate::NotMine;
        };

        let was_active = self.active();
        let update = match &mut self.conditions[index] {
            GateCondition::Key => {
                let pressed = event.event.value >= 1;
                if pressed == self.satisfied[index] {
                    TriggerUpdate::NoChange
                } else if pressed {
                    TriggerUpdate::Pressed
                } else {
                    TriggerUpdate::Released
                }
            }
            GateCondition::Abs(trigger) => {
                let range = ctx.abs_range(&event.origin, event.event.code);
                trigger.update(event.event.value, range)
            }
            GateCondition::Rel(trigger) => trigger.update(event.event.value),
        };

        match update {
            TriggerUpdate::Pressed => self.satisfied[index] = true,
            TriggerUpdate::Released => self.satisfied[index] = false,
            TriggerUpdate::NoChange => return GateUpdate::NoChange,
        }

        let is_active = self.active();
        if is_active != was_active {
            GateUpdate::Changed(is_active)
        } else {
            GateUpdate::NoChange
        }
    }

    fn reset(&mut self) {
        for satisfied in &mut self.satisfied {
            *satisfied = false;
        }
        for condition in &mut self.conditions {
            match condition {
                GateCondition::Key => {}
                GateCondition::Abs(trigger) => trigger.reset(),
                GateCondition::Rel(trigger) => trigger.reset(),
            }
        }
    }
}

// ============================================================================
// ABS -> ABS
// ============================================================================

pub struct AbsToAbsHandler {
    input: InputMatchKey,
    out_code: u16,
    out_range: (i32, i32),
    shaping: Shaping,
    gate: ComboGate,
    target: TargetDevice,
    ctx: Arc<Context>,
}

impl AbsToAbsHandler {
    pub fn new(
        configs: &[InputConfig],
        input: InputMatchKey,
        out_code: u16,
        shaping: Shaping,
        target: TargetDevice,
        ctx: Arc<Context>,
    ) -> Self {
        Self {
            input,
            out_code,
            out_range: evmapper_config::targets::abs_range(out_code),
            shaping,
            gate: ComboGate::new(configs),
            target,
            ctx,
        }
    }

    pub fn match_keys(&self) -> Vec<InputMatchKey> {
        let mut keys = self.gate.match_keys.clone();
        keys.push(self.input.clone());
        keys
    }

    fn write_centered(&self) {
        let centered = denormalize(0.0, self.out_range.0, self.out_range.1);
        self.ctx
            .outputs
            .write(self.target, Event::new(EventKind::Abs, self.out_code, centered));
    }

    pub fn notify(&mut self, event: &SourcedEvent) -> Verdict {
        match self.gate.notify(event, &self.ctx) {
            GateUpdate::Changed(active) => {
                if !active {
                    self.write_centered();
                }
                return Verdict::Consumed;
            }
            _ => {}
        }

        if !self
            .input
            .matches(event.event.kind, event.event.code, &event.origin)
        {
            return Verdict::Passthrough;
        }
        if !self.gate.active() {
            return Verdict::Passthrough;
        }

        let (min, max) = self.ctx.abs_range(&event.origin, event.event.code);
        let transformation = Transformation::new(
            min,
            max,
            self.shaping.deadzone,
            self.shaping.gain,
            self.shaping.expo,
        );
        let shaped = transformation.apply(f64::from(event.event.value)).clamp(-1.0, 1.0);
        let value = denormalize(shaped, self.out_range.0, self.out_range.1);
        self.ctx
            .outputs
            .write(self.target, Event::new(EventKind::Abs, self.out_code, value));
        Verdict::Consumed
    }

    pub fn reset(&mut self) {
        if self.gate.active() {
            self.write_centered();
        }
        self.gate.reset();
    }
}

// ============================================================================
// ABS -> REL
// ============================================================================

struct RelEmitter {
    speed: Mutex<f64>,
    active: AtomicBool,
}

/// REL output codes and scaling for one mapping.
#[derive(Debug, Clone, Copy)]
struct RelOutput {
    low: (u16, f64),
    high: Option<(u16, f64)>,
}

fn rel_output(code: u16) -> RelOutput {
    match code {
        REL_WHEEL => RelOutput {
            low: (REL_WHEEL, WHEEL_SCALING),
            high: Some((REL_WHEEL_HI_RES, WHEEL_HI_RES_SCALING)),
        },
        REL_HWHEEL => RelOutput {
            low: (REL_HWHEEL, WHEEL_SCALING),
            high: Some((REL_HWHEEL_HI_RES, WHEEL_HI_RES_SCALING)),
        },
        REL_WHEEL_HI_RES => RelOutput {
            low: (REL_WHEEL_HI_RES, WHEEL_HI_RES_SCALING),
            high: None,
        },
        REL_HWHEEL_HI_RES => RelOutput {
            low: (REL_HWHEEL_HI_RES, WHEEL_HI_RES_SCALING),
            high: None,
        },
        other => RelOutput {
            low: (other, REL_XY_SCALING),
            high: None,
        },
    }
}

pub struct AbsToRelHandler {
    input: InputMatchKey,
    output: RelOutput,
    shaping: Shaping,
    rel_rate: u16,
    gate: ComboGate,
    emitter: Arc<RelEmitter>,
    target: TargetDevice,
    ctx: Arc<Context>,
}

impl AbsToRelHandler {
    pub fn new(
        configs: &[InputConfig],
        input: InputMatchKey,
        out_code: u16,
        shaping: Shaping,
        rel_rate: u16,
        target: TargetDevice,
        ctx: Arc<Context>,
    ) -> Self {
        Self {
            input,
            output: rel_output(out_code),
            shaping,
            rel_rate,
            gate: ComboGate::new(configs),
            emitter: Arc::new(RelEmitter {
                speed: Mutex::new(0.0),
                active: AtomicBool::new(false),
            }),
            target,
            ctx,
        }
    }

    pub fn match_keys(&self) -> Vec<InputMatchKey> {
        let mut keys = self.gate.match_keys.clone();
        keys.push(self.input.clone());
        keys
    }

    fn stop(&self) {
        self.emitter.active.store(false, Ordering::Relaxed);
    }

    fn start(&self) {
        if self.emitter.active.swap(true, Ordering::Relaxed) {
            return; // a tick task is already running
        }

        let emitter = Arc::clone(&self.emitter);
        let outputs = Arc::clone(&self.ctx.outputs);
        let target = self.target;
        let output = self.output;
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.rel_rate.max(1)));
        tokio::spawn(async move {
            let mut low_carry = FractionalCarry::default();
            let mut high_carry = FractionalCarry::default();
            let seconds_per_tick = interval.as_secs_f64();
            while emitter.active.load(Ordering::Relaxed) {
                let speed = *emitter.speed.lock().expect("emitter speed poisoned");
                let low_delta = low_carry.advance(speed * output.low.1 * seconds_per_tick);
                if low_delta != 0 {
                    outputs.write(target, Event::new(EventKind::Rel, output.low.0, low_delta));
                }
                if let Some((code, scale)) = output.high {
                    let high_delta = high_carry.advance(speed * scale * seconds_per_tick);
                    if high_delta != 0 {
                        outputs.write(target, Event::new(EventKind::Rel, code, high_delta));
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    pub fn notify(&mut self, event: &SourcedEvent) -> Verdict {
        match self.gate.notify(event, &self.ctx) {
            GateUpdate::Changed(active) => {
                if !active {
                    self.stop();
                }
                return Verdict::Consumed;
            }
            _ => {}
        }

        if !self
            .input
            .matches(event.event.kind, event.event.code, &event.origin)
        {
            return Verdict::Passthrough;
        }
        if !self.gate.active() {
            return Verdict::Passthrough;
        }

        let (min, max) = self.ctx.abs_range(&event.origin, event.event.code);
        let transformation = Transformation::new(
            min,
            max,
            self.shaping.deadzone,
            self.shaping.gain,
            self.shaping.expo,
        );
        let speed = transformation.apply(f64::from(event.event.value));

        if speed == 0.0 {
            self.stop();
            return Verdict::Consumed;
        }

        *self.emitter.speed.lock().expect("emitter speed poisoned") = speed;
        self.start();
        // the raw sample is consumed, emission happens on the tick task
        Verdict::Deferred
    }

    pub fn reset(&mut self) {
        self.stop();
        self.gate.reset();
    }
}

// ============================================================================
// REL -> ABS
// ============================================================================

pub struct RelToAbsHandler {
    handler_id: usize,
    input: InputMatchKey,
    out_code: u16,
    out_range: (i32, i32),
    shaping: Shaping,
    cutoff: f64,
    release_timeout: Duration,
    /// Accumulated virtual position, normalized to [-1, 1].
    position: f64,
    generation: u64,
    gate: ComboGate,
    target: TargetDevice,
    ctx: Arc<Context>,
    tx: mpsc::UnboundedSender<PipelineMsg>,
}

impl RelToAbsHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler_id: usize,
        configs: &[InputConfig],
        input: InputMatchKey,
        out_code: u16,
        shaping: Shaping,
        cutoff: f64,
        release_timeout: Duration,
        target: TargetDevice,
        ctx: Arc<Context>,
        tx: mpsc::UnboundedSender<PipelineMsg>,
    ) -> Self {
        Self {
            handler_id,
            input,
            out_code,
            out_range: evmapper_config::targets::abs_range(out_code),
            shaping,
            cutoff,
            release_timeout,
            position: 0.0,
            generation: 0,
            gate: ComboGate::new(configs),
            target,
            ctx,
            tx,
        }
    }

    pub fn match_keys(&self) -> Vec<InputMatchKey> {
        let mut keys = self.gate.match_keys.clone();
        keys.push(self.input.clone());
        keys
    }

    fn write_position(&self) {
        let value = denormalize(self.position, self.out_range.0, self.out_range.1);
        self.ctx
            .outputs
            .write(self.target, Event::new(EventKind::Abs, self.out_code, value));
    }

    fn recenter(&mut self) {
        if self.position != 0.0 {
            self.position = 0.0;
            self.write_position();
        }
    }

    pub fn notify(&mut self, event: &SourcedEvent) -> Verdict {
        match self.gate.notify(event, &self.ctx) {
            GateUpdate::Changed(active) => {
                if !active {
                    self.recenter();
                }
                return Verdict::Consumed;
            }
            _ => {}
        }

        if !self
            .input
            .matches(event.event.kind, event.event.code, &event.origin)
        {
            return Verdict::Passthrough;
        }
        if !self.gate.active() {
            return Verdict::Passthrough;
        }

        let x = normalize_rel(f64::from(event.event.value), self.cutoff);
        let transformation =
            Transformation::new(-1, 1, self.shaping.deadzone, self.shaping.gain, self.shaping.expo);
        let delta = transformation.apply_normalized(x);

        // accumulate and saturate at the axis boundaries
        self.position = (self.position + delta).clamp(-1.0, 1.0);
        self.write_position();
        self.schedule_recenter();
        Verdict::Consumed
    }

    /// The silence timer fired; the axis is treated as centered.
    pub fn on_timeout(&mut self, generation: u64) {
        if generation == self.generation {
            self.recenter();
        }
    }

    fn schedule_recenter(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let handler = self.handler_id;
        let timeout = self.release_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(PipelineMsg::Timeout {
                handler,
                config: 0,
                generation,
            });
        });
    }

    pub fn reset(&mut self) {
        self.recenter();
        self.gate.reset();
    }
}
