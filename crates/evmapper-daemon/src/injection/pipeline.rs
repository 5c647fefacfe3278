//! Event pipeline
//!
//! Producers hand their events into a single mpsc merge point per
//! injection, so the handler graph observes a total order. Dispatch walks
//! the routing table longest-combination-first; the first consumer
//! suppresses emission in the remaining handlers, and unconsumed events go
//! to the forwarded device. Timer expiries from relative-axis handlers
//! arrive through the same channel, keeping every state transition on this
//! one consumer.

use std::sync::Arc;

use evmapper_config::EventKind;
use tokio::sync::{mpsc, watch};

use crate::injection::context::Context;
use crate::injection::handlers::{build_graph, HandlerGraph, Verdict};
use crate::injection::resolver::ResolverAction;
use crate::injection::runtime::MacroRuntime;
use crate::outputs::Event;

/// An event tagged with the sub-device it came from.
#[derive(Debug, Clone)]
pub struct SourcedEvent {
    pub origin: Arc<str>,
    pub event: Event,
    /// Synthetic events are engine-internal and are never forwarded.
    pub synthetic: bool,
}

impl SourcedEvent {
    pub fn new(origin: Arc<str>, event: Event) -> Self {
        Self {
            origin,
            event,
            synthetic: false,
        }
    }
}

/// Everything that reaches the pipeline's single consumer.
#[derive(Debug)]
pub enum PipelineMsg {
    Input(SourcedEvent),
    /// A handler's release/recenter timer fired.
    Timeout {
        handler: usize,
        config: usize,
        generation: u64,
    },
}

pub struct Pipeline {
    ctx: Arc<Context>,
    graph: HandlerGraph,
    rx: mpsc::UnboundedReceiver<PipelineMsg>,
    cancel: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(
        ctx: Arc<Context>,
        runtime: Arc<MacroRuntime>,
        rx: mpsc::UnboundedReceiver<PipelineMsg>,
        tx: mpsc::UnboundedSender<PipelineMsg>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let graph = build_graph(&ctx, &runtime, &tx);
        tracing::debug!(
            "handler graph ready: {} handlers, {} routed entries",
            graph.handlers.len(),
            graph.routing.len()
        );
        Self {
            ctx,
            graph,
            rx,
            cancel,
        }
    }

    /// Consume messages until cancellation, then drain.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(PipelineMsg::Input(event)) => self.dispatch(event),
                    Some(PipelineMsg::Timeout { handler, config, generation }) => {
                        self.handle_timeout(handler, config, generation);
                    }
                    None => break,
                },
            }
        }
        self.reset();
    }

    /// Route one event through the handler graph.
    pub fn dispatch(&mut self, event: SourcedEvent) {
        match event.event.kind {
            // LED echoes feed the lock-state branch conditions
            EventKind::Led => {
                self.ctx.leds.update(event.event.code, event.event.value != 0);
                return;
            }
            // batch markers are forwarded, never routed
            EventKind::Syn | EventKind::Msc => {
                if !event.synthetic {
                    self.ctx.forward.write(event.event);
                }
                return;
            }
            _ => {}
        }

        if event.event.is_press() {
            self.ctx.count_press();
        }

        let Some(ids) = self
            .graph
            .routing
            .get(&(event.event.kind, event.event.code))
            .cloned()
        else {
            if !event.synthetic {
                self.ctx.forward.write(event.event);
            }
            return;
        };

        let handlers = &mut self.graph.handlers;
        let resolver = &mut self.graph.resolver;
        let mut actions: Vec<ResolverAction> = Vec::new();
        let mut consumed = false;
        let mut passthrough = false;

        for id in ids {
            let verdict = handlers[id].notify(&event, resolver, &mut actions, consumed);
            match verdict {
                Verdict::Consumed | Verdict::Deferred => consumed = true,
                Verdict::Passthrough => passthrough = true,
            }
        }

        self.apply_actions(actions);

        if !consumed && passthrough && !event.synthetic {
            self.ctx.forward.write(event.event);
        }
    }

    /// A timer message from a handler arrived.
    pub fn handle_timeout(&mut self, handler: usize, config: usize, generation: u64) {
        if handler >= self.graph.handlers.len() {
            return;
        }
        let handlers = &mut self.graph.handlers;
        let resolver = &mut self.graph.resolver;
        let mut actions: Vec<ResolverAction> = Vec::new();
        handlers[handler].on_timeout(config, generation, resolver, &mut actions);
        self.apply_actions(actions);
    }

    fn apply_actions(&mut self, actions: Vec<ResolverAction>) {
        let handlers = &mut self.graph.handlers;
        let resolver = &mut self.graph.resolver;
        for action in actions {
            match action {
                ResolverAction::Release { handler } => handlers[handler].force_release(),
                ResolverAction::Reactivate { handler } => {
                    handlers[handler].try_reactivate(resolver)
                }
                ResolverAction::EmitPress { handler } => handlers[handler].complete_press(),
            }
        }
    }

    /// Release everything still pressed and clear all handler state.
    pub fn reset(&mut self) {
        let handlers = &mut self.graph.handlers;
        let resolver = &mut self.graph.resolver;
        for handler in handlers.iter_mut() {
            handler.reset(resolver);
        }
    }
}
