//! Combination handler
//!
//! Tracks the satisfaction state of every input config in a combination and
//! drives the mapping's output: a key edge, a macro task, or nothing for
//! disabled mappings. Key configs are satisfied while held, axis configs
//! through their threshold triggers. The handler consults the resolver on
//! every press and release so overlapping combinations keep correct release
//! semantics.

use std::sync::Arc;
use std::time::Duration;

use evmapper_config::macros::Macro;
use evmapper_config::{EventKind, InputConfig, InputMatchKey, TargetDevice};
use tokio::sync::mpsc;

use crate::injection::context::Context;
use crate::injection::handlers::trigger::{AbsTrigger, RelTrigger, TriggerUpdate};
use crate::injection::handlers::Verdict;
use crate::injection::pipeline::{PipelineMsg, SourcedEvent};
use crate::injection::resolver::{Resolver, ResolverAction};
use crate::injection::runtime::{MacroInstance, MacroRuntime, MacroSpawn};
use crate::outputs::Event;

/// What a triggered button-like mapping emits.
pub enum ButtonOutput {
    Key { kind: EventKind, code: u16 },
    Macro { program: Arc<Macro> },
    Disabled,
}

/// Per-config satisfaction tracking.
enum Condition {
    Key,
    Abs(AbsTrigger),
    Rel(RelTrigger),
}

pub struct CombinationHandler {
    handler_id: usize,
    mapping_index: usize,
    target: TargetDevice,
    configs: Vec<InputConfig>,
    match_keys: Vec<InputMatchKey>,
    conditions: Vec<Condition>,
    satisfied: Vec<bool>,
    /// Set when a synthetic release for this config was already emitted on
    /// the forwarded device; the physical release is then swallowed.
    forward_suppressed: Vec<bool>,
    /// Timer generations for relative-axis release timeouts.
    generations: Vec<u64>,
    slot: usize,
    output: ButtonOutput,
    output_pressed: bool,
    release_keys: bool,
    release_timeout: Duration,
    key_sleep_ms: u64,
    rel_rate: u16,
    ctx: Arc<Context>,
    runtime: Arc<MacroRuntime>,
    macro_instance: Option<MacroInstance>,
    tx: mpsc::UnboundedSender<PipelineMsg>,
}

impl CombinationHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler_id: usize,
        mapping_index: usize,
        target: TargetDevice,
        configs: Vec<InputConfig>,
        output: ButtonOutput,
        release_keys: bool,
        release_timeout: Duration,
        key_sleep_ms: u64,
        rel_rate: u16,
        slot: usize,
        ctx: Arc<Context>,
        runtime: Arc<MacroRuntime>,
        tx: mpsc::UnboundedSender<PipelineMsg>,
    ) -> Self {
        let match_keys = configs.iter().map(InputConfig::match_key).collect();
        let conditions = configs
            .iter()
            .map(|config| match config.kind {
                EventKind::Abs => Condition::Abs(AbsTrigger::new(
                    config.analog_threshold.unwrap_or(100),
                )),
                EventKind::Rel => Condition::Rel(RelTrigger::new(
                    config.analog_threshold.unwrap_or(1),
                )),
                _ => Condition::Key,
            })
            .collect();
        let len = configs.len();

        Self {
            handler_id,
            mapping_index,
            target,
            configs,
            match_keys,
            conditions,
            satisfied: vec![false; len],
            forward_suppressed: vec![false; len],
            generations: vec![0; len],
            slot,
            output,
            output_pressed: false,
            release_keys,
            release_timeout,
            key_sleep_ms,
            rel_rate,
            ctx,
            runtime,
            macro_instance: None,
            tx,
        }
    }

    pub fn match_keys(&self) -> &[InputMatchKey] {
        &self.match_keys
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    fn is_active(&self) -> bool {
        self.satisfied.iter().all(|&s| s)
    }

    pub fn notify(
        &mut self,
        event: &SourcedEvent,
        resolver: &mut Resolver,
        actions: &mut Vec<ResolverAction>,
        suppress: bool,
    ) -> Verdict {
        let Some(index) = self.match_keys.iter().position(|key| {
            key.matches(event.event.kind, event.event.code, &event.origin)
        }) else {
            return Verdict::Passthrough;
        };

        // key repeats never change combination state
        if event.event.kind == EventKind::Key && event.event.value == 2 {
            return if self.output_pressed {
                Verdict::Consumed
            } else {
                Verdict::Passthrough
            };
        }

        let was_active = self.is_active();
        let mut refresh_timer = false;
        let update = match &mut self.conditions[index] {
            Condition::Key => {
                let pressed = event.event.value >= 1;
                if pressed == self.satisfied[index] {
                    TriggerUpdate::NoChange
                } else if pressed {
                    TriggerUpdate::Pressed
                } else {
                    TriggerUpdate::Released
                }
            }
            Condition::Abs(trigger) => {
                let range = self.ctx.abs_range(&event.origin, event.event.code);
                trigger.update(event.event.value, range)
            }
            Condition::Rel(trigger) => {
                let update = trigger.update(event.event.value);
                refresh_timer = trigger.is_active();
                update
            }
        };
        if refresh_timer {
            self.schedule_timeout(index);
        }

        match update {
            TriggerUpdate::Pressed => {
                self.satisfied[index] = true;
                self.forward_suppressed[index] = false;
            }
            TriggerUpdate::Released => self.satisfied[index] = false,
            TriggerUpdate::NoChange => {
                return self.idle_verdict(index, event);
            }
        }
        let is_active = self.is_active();

        if !was_active && is_active {
            if suppress {
                // a longer combination claimed the trigger event
                return Verdict::Passthrough;
            }
            self.trigger(index, resolver, actions);
            return Verdict::Consumed;
        }

        if was_active && !is_active {
            self.release(resolver, actions);
            if self.forward_suppressed[index] {
                self.forward_suppressed[index] = false;
            }
            return Verdict::Consumed;
        }

        self.idle_verdict(index, event)
    }

    /// Verdict for events that did not change the activation state.
    fn idle_verdict(&mut self, index: usize, event: &SourcedEvent) -> Verdict {
        if self.is_active() && self.output_pressed {
            return Verdict::Consumed;
        }
        match event.event.kind {
            EventKind::Key => {
                // swallow the physical release of keys we already released
                // on the forwarded device when the combination triggered
                if event.event.value == 0 && self.forward_suppressed[index] {
                    self.forward_suppressed[index] = false;
                    Verdict::Consumed
                } else {
                    Verdict::Passthrough
                }
            }
            // raw analog samples never reach the forwarded device
            _ => Verdict::Consumed,
        }
    }

    fn trigger(&mut self, trigger_index: usize, resolver: &mut Resolver, actions: &mut Vec<ResolverAction>) {
        resolver.activated(self.slot, actions);

        if self.release_keys && self.configs.len() > 1 {
            for (i, config) in self.configs.iter().enumerate() {
                if i == trigger_index || !self.satisfied[i] || config.kind != EventKind::Key {
                    continue;
                }
                tracing::debug!(
                    "forwarding release for key {} of mapping {}",
                    config.code,
                    self.mapping_index
                );
                self.ctx.forward.write(Event::key(config.code, 0));
                self.forward_suppressed[i] = true;
            }
        }

        // the press itself goes through the action queue so synthetic
        // releases of displaced combinations are emitted first
        actions.push(ResolverAction::EmitPress {
            handler: self.handler_id,
        });
    }

    /// Applied from the action queue after displaced releases went out.
    pub fn complete_press(&mut self) {
        self.emit_press();
    }

    fn emit_press(&mut self) {
        match &self.output {
            ButtonOutput::Key { kind, code } => {
                self.ctx
                    .outputs
                    .write(self.target, Event::new(*kind, *code, 1));
            }
            ButtonOutput::Macro { program } => {
                let instance = self.runtime.spawn(MacroSpawn {
                    program: Arc::clone(program),
                    ctx: Arc::clone(&self.ctx),
                    target: self.target,
                    mapping_index: self.mapping_index,
                    key_sleep_ms: self.key_sleep_ms,
                    rel_rate: self.rel_rate,
                });
                self.macro_instance = Some(instance);
            }
            ButtonOutput::Disabled => {}
        }
        self.output_pressed = true;
    }

    fn release(&mut self, resolver: &mut Resolver, actions: &mut Vec<ResolverAction>) {
        resolver.deactivated(self.slot, actions);
        self.emit_release();
    }

    fn emit_release(&mut self) {
        if !self.output_pressed {
            return;
        }
        match &self.output {
            ButtonOutput::Key { kind, code } => {
                self.ctx
                    .outputs
                    .write(self.target, Event::new(*kind, *code, 0));
            }
            ButtonOutput::Macro { .. } => {
                if let Some(instance) = self.macro_instance.take() {
                    instance.release();
                }
            }
            ButtonOutput::Disabled => {}
        }
        self.output_pressed = false;
    }

    /// A longer combination displaced this one; release the output without
    /// touching the key state.
    pub fn force_release(&mut self) {
        self.emit_release();
    }

    /// A longer combination released while this one is still satisfied.
    pub fn try_reactivate(&mut self, resolver: &mut Resolver) {
        if self.is_active() && !self.output_pressed {
            resolver.mark_triggered(self.slot);
            self.emit_press();
        }
    }

    /// A relative-axis release timer fired.
    pub fn on_timeout(
        &mut self,
        config: usize,
        generation: u64,
        resolver: &mut Resolver,
        actions: &mut Vec<ResolverAction>,
    ) {
        if self.generations.get(config) != Some(&generation) {
            return; // newer motion arrived since the timer was set
        }
        let Condition::Rel(trigger) = &mut self.conditions[config] else {
            return;
        };
        if !trigger.timeout_release() {
            return;
        }

        let was_active = self.is_active();
        self.satisfied[config] = false;
        if was_active {
            self.release(resolver, actions);
        }
    }

    fn schedule_timeout(&mut self, config: usize) {
        self.generations[config] += 1;
        let generation = self.generations[config];
        let handler = self.handler_id;
        let tx = self.tx.clone();
        let timeout = self.release_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(PipelineMsg::Timeout {
                handler,
                config,
                generation,
            });
        });
    }

    /// Cancellation drain: release the output and clear all state.
    pub fn reset(&mut self, resolver: &mut Resolver) {
        self.emit_release();
        resolver.mark_released(self.slot);
        for satisfied in &mut self.satisfied {
            *satisfied = false;
        }
        for suppressed in &mut self.forward_suppressed {
            *suppressed = false;
        }
        for condition in &mut self.conditions {
            match condition {
                Condition::Key => {}
                Condition::Abs(trigger) => trigger.reset(),
                Condition::Rel(trigger) => trigger.reset(),
            }
        }
    }
}
