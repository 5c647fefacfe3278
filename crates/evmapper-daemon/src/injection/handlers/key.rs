//! 1-to-1 key handler
//!
//! The simplest mapping: one key in, one output code out, press/hold/release
//! mirrored from the input value. Registered with the resolver as a
//! length-one combination so longer combinations sharing the key can
//! displace it and hand the key back afterwards.

use std::sync::Arc;

use evmapper_config::{EventKind, InputMatchKey, TargetDevice};

use crate::injection::context::Context;
use crate::injection::handlers::Verdict;
use crate::injection::pipeline::SourcedEvent;
use crate::injection::resolver::{Resolver, ResolverAction};
use crate::outputs::Event;

pub struct KeyHandler {
    match_key: InputMatchKey,
    out_kind: EventKind,
    out_code: u16,
    target: TargetDevice,
    slot: usize,
    /// Whether the physical key is down, tracked even while suppressed.
    key_held: bool,
    /// Whether our output is currently pressed.
    pressed: bool,
    ctx: Arc<Context>,
}

impl KeyHandler {
    pub fn new(
        match_key: InputMatchKey,
        out_kind: EventKind,
        out_code: u16,
        target: TargetDevice,
        slot: usize,
        ctx: Arc<Context>,
    ) -> Self {
        Self {
            match_key,
            out_kind,
            out_code,
            target,
            slot,
            key_held: false,
            pressed: false,
            ctx,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn match_key(&self) -> &InputMatchKey {
        &self.match_key
    }

    fn write(&self, value: i32) {
        self.ctx
            .outputs
            .write(self.target, Event::new(self.out_kind, self.out_code, value));
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
                self.write(1);
                self.pressed = true;
                Verdict::Consumed
            }
            2 => {
                if self.pressed {
                    self.write(2);
                    Verdict::Consumed
                } else {
                    Verdict::Passthrough
                }
            }
            _ => {
                self.key_held = false;
                if self.pressed {
                    resolver.deactivated(self.slot, actions);
                    self.write(0);
                    self.pressed = false;
                    Verdict::Consumed
                } else {
                    Verdict::Passthrough
                }
            }
        }
    }

    pub fn force_release(&mut self) {
        if self.pressed {
            self.write(0);
            self.pressed = false;
        }
    }

    pub fn try_reactivate(&mut self, resolver: &mut Resolver) {
        if self.key_held && !self.pressed {
            resolver.mark_triggered(self.slot);
            self.write(1);
            self.pressed = true;
        }
    }

    pub fn reset(&mut self, resolver: &mut Resolver) {
        self.force_release();
        resolver.mark_released(self.slot);
        self.key_held = false;
    }
}
