//! Macro handler
//!
//! One key in, a macro program out. Every press spawns a fresh task in the
//! macro runtime; the release flips that instance's held flag, which the
//! task observes at its next suspension point.

use std::sync::Arc;

use evmapper_config::macros::Macro;
use evmapper_config::{InputMatchKey, TargetDevice};

use crate::injection::context::Context;
use crate::injection::handlers::Verdict;
use crate::injection::pipeline::SourcedEvent;
use crate::injection::resolver::{Resolver, ResolverAction};
use crate::injection::runtime::{MacroInstance, MacroRuntime, MacroSpawn};

pub struct MacroHandler {
    match_key: InputMatchKey,
    program: Arc<Macro>,
    target: TargetDevice,
    mapping_index: usize,
    key_sleep_ms: u64,
    rel_rate: u16,
    slot: usize,
    key_held: bool,
    running: Option<MacroInstance>,
    ctx: Arc<Context>,
    runtime: Arc<MacroRuntime>,
}

impl MacroHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        match_key: InputMatchKey,
        program: Arc<Macro>,
        target: TargetDevice,
        mapping_index: usize,
        key_sleep_ms: u64,
        rel_rate: u16,
        slot: usize,
        ctx: Arc<Context>,
        runtime: Arc<MacroRuntime>,
    ) -> Self {
        Self {
            match_key,
            program,
            target,
            mapping_index,
            key_sleep_ms,
            rel_rate,
            slot,
            key_held: false,
            running: None,
            ctx,
            runtime,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn match_key(&self) -> &InputMatchKey {
        &self.match_key
    }

    fn spawn(&mut self) {
        let instance = self.runtime.spawn(MacroSpawn {
            program: Arc::clone(&self.program),
            ctx: Arc::clone(&self.ctx),
            target: self.target,
            mapping_index: self.mapping_index,
            key_sleep_ms: self.key_sleep_ms,
            rel_rate: self.rel_rate,
        });
        self.running = Some(instance);
    }

    pub fn notify(
        &mut self,
        event: &SourcedEvent,
        resolver: &mut Resolver,
        actions: &mut Vec<ResolverAction>,
        suppress: bool,
    ) -> Verdict {
        if !self
            .match_key
            .matches(event.event.kind, event.event.code, &event.origin)
        {
            return Verdict::Passthrough;
        }

        match event.event.value {
            1 => {
                self.key_held = true;
                if suppress {
                    return Verdict::Passthrough;
                }
                resolver.activated(self.slot, actions);
                self.spawn();
                Verdict::Consumed
            }
            2 => {
                if self.running.is_some() {
                    Verdict::Consumed
                } else {
                    Verdict::Passthrough
                }
            }
            _ => {
                self.key_held = false;
                if let Some(instance) = self.running.take() {
                    resolver.deactivated(self.slot, actions);
                    instance.release();
                    Verdict::Consumed
                } else {
                    Verdict::Passthrough
                }
            }
        }
    }

    pub fn force_release(&mut self) {
        if let Some(instance) = self.running.take() {
            instance.release();
        }
    }

    pub fn try_reactivate(&mut self, resolver: &mut Resolver) {
        if self.key_held && self.running.is_none() {
            resolver.mark_triggered(self.slot);
            self.spawn();
        }
    }

    pub fn reset(&mut self, resolver: &mut Resolver) {
        self.force_release();
        resolver.mark_released(self.slot);
        self.key_held = false;
    }
}
