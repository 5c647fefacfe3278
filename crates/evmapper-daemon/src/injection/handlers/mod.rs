//! The handler graph
//!
//! Handlers are a tagged variant per mapping shape, indexed by an entry
//! routing table `{(type, code) -> [handler, ...]}`. An event is dispatched
//! to every handler whose index matches, longest combination first; the
//! first consumer suppresses emission in the rest.

pub mod axis;
pub mod combination;
pub mod key;
pub mod macros;
pub mod trigger;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use evmapper_config::{EventKind, InputMatchKey, ResolvedOutput};
use tokio::sync::mpsc;

use crate::injection::context::Context;
use crate::injection::pipeline::{PipelineMsg, SourcedEvent};
use crate::injection::resolver::{Resolver, ResolverAction};
use crate::injection::runtime::MacroRuntime;

use axis::{AbsToAbsHandler, AbsToRelHandler, RelToAbsHandler, Shaping};
use combination::{ButtonOutput, CombinationHandler};
use key::KeyHandler;
use macros::MacroHandler;

/// What a handler decided about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Do not forward.
    Consumed,
    /// Forward to the forwarded device.
    Passthrough,
    /// Consumed for now; any emission happens later (rate emitters, timers).
    Deferred,
}

/// One per-mapping state machine.
pub enum Handler {
    Combination(CombinationHandler),
    Key(KeyHandler),
    Macro(MacroHandler),
    AbsToAbs(AbsToAbsHandler),
    AbsToRel(AbsToRelHandler),
    RelToAbs(RelToAbsHandler),
}

impl Handler {
    pub fn notify(
        &mut self,
        event: &SourcedEvent,
        resolver: &mut Resolver,
        actions: &mut Vec<ResolverAction>,
        suppress: bool,
    ) -> Verdict {
        match self {
            Handler::Combination(handler) => handler.notify(event, resolver, actions, suppress),
            Handler::Key(handler) => handler.notify(event, resolver, actions, suppress),
            Handler::Macro(handler) => handler.notify(event, resolver, actions, suppress),
            Handler::AbsToAbs(handler) => handler.notify(event),
            Handler::AbsToRel(handler) => handler.notify(event),
            Handler::RelToAbs(handler) => handler.notify(event),
        }
    }

    pub fn on_timeout(
        &mut self,
        config: usize,
        generation: u64,
        resolver: &mut Resolver,
        actions: &mut Vec<ResolverAction>,
    ) {
        match self {
            Handler::Combination(handler) => handler.on_timeout(config, generation, resolver, actions),
            Handler::RelToAbs(handler) => handler.on_timeout(generation),
            _ => {}
        }
    }

    /// Emit a synthetic release because a longer combination took over.
    pub fn force_release(&mut self) {
        match self {
            Handler::Combination(handler) => handler.force_release(),
            Handler::Key(handler) => handler.force_release(),
            Handler::Macro(handler) => handler.force_release(),
            _ => {}
        }
    }

    /// Emit the press of a combination that just won arbitration.
    pub fn complete_press(&mut self) {
        if let Handler::Combination(handler) = self {
            handler.complete_press();
        }
    }

    /// Fire again if still satisfied, after a longer combination released.
    pub fn try_reactivate(&mut self, resolver: &mut Resolver) {
        match self {
            Handler::Combination(handler) => handler.try_reactivate(resolver),
            Handler::Key(handler) => handler.try_reactivate(resolver),
            Handler::Macro(handler) => handler.try_reactivate(resolver),
            _ => {}
        }
    }

    /// Cancellation drain: release pending outputs, clear state.
    pub fn reset(&mut self, resolver: &mut Resolver) {
        match self {
            Handler::Combination(handler) => handler.reset(resolver),
            Handler::Key(handler) => handler.reset(resolver),
            Handler::Macro(handler) => handler.reset(resolver),
            Handler::AbsToAbs(handler) => handler.reset(),
            Handler::AbsToRel(handler) => handler.reset(),
            Handler::RelToAbs(handler) => handler.reset(),
        }
    }

    fn match_keys(&self) -> Vec<InputMatchKey> {
        match self {
            Handler::Combination(handler) => handler.match_keys().to_vec(),
            Handler::Key(handler) => vec![handler.match_key().clone()],
            Handler::Macro(handler) => vec![handler.match_key().clone()],
            Handler::AbsToAbs(handler) => handler.match_keys(),
            Handler::AbsToRel(handler) => handler.match_keys(),
            Handler::RelToAbs(handler) => handler.match_keys(),
        }
    }
}

/// The built graph for one injection.
pub struct HandlerGraph {
    pub handlers: Vec<Handler>,
    /// `(type, code)` to matching handler indices, longest combination first.
    pub routing: HashMap<(EventKind, u16), Vec<usize>>,
    pub resolver: Resolver,
}

/// Materialize handlers, routing table and resolver from the compiled
/// preset carried by the context.
pub fn build_graph(
    ctx: &Arc<Context>,
    runtime: &Arc<MacroRuntime>,
    tx: &mpsc::UnboundedSender<PipelineMsg>,
) -> HandlerGraph {
    let mut handlers: Vec<Handler> = Vec::new();
    let mut lengths: Vec<usize> = Vec::new();
    let mut resolver = Resolver::new();

    for compiled in &ctx.preset.mappings {
        let mapping = &compiled.mapping;
        let combination = &mapping.input_combination;
        let handler_id = handlers.len();
        let target = mapping.target_uinput;
        let shaping = Shaping {
            deadzone: mapping.deadzone,
            gain: mapping.gain,
            expo: mapping.expo,
        };
        let release_timeout = Duration::from_secs_f64(mapping.release_timeout);

        let handler = match (&compiled.output, combination.analog_input()) {
            (ResolvedOutput::Axis { kind, code }, Some(analog)) => {
                let input = analog.match_key();
                match (analog.kind, kind) {
                    (EventKind::Abs, EventKind::Abs) => Handler::AbsToAbs(AbsToAbsHandler::new(
                        &combination.0,
                        input,
                        *code,
                        shaping,
                        target,
                        Arc::clone(ctx),
                    )),
                    (EventKind::Abs, EventKind::Rel) => Handler::AbsToRel(AbsToRelHandler::new(
                        &combination.0,
                        input,
                        *code,
                        shaping,
                        mapping.rel_rate,
                        target,
                        Arc::clone(ctx),
                    )),
                    (EventKind::Rel, EventKind::Abs) => Handler::RelToAbs(RelToAbsHandler::new(
                        handler_id,
                        &combination.0,
                        input,
                        *code,
                        shaping,
                        mapping.rel_to_abs_input_cutoff,
                        release_timeout,
                        target,
                        Arc::clone(ctx),
                        tx.clone(),
                    )),
                    _ => {
                        // validation rejects the remaining shapes
                        tracing::error!(
                            "mapping {} has an unsupported axis shape, skipping",
                            compiled.index
                        );
                        continue;
                    }
                }
            }
            (output, None) if combination.len() == 1
                && combination.0[0].kind == EventKind::Key
                && !matches!(output, ResolvedOutput::Disabled) =>
            {
                let config = &combination.0[0];
                match output {
                    ResolvedOutput::Key { kind, code } => {
                        let slot = resolver.register(handler_id, vec![config.match_key()]);
                        Handler::Key(KeyHandler::new(
                            config.match_key(),
                            *kind,
                            *code,
                            target,
                            slot,
                            Arc::clone(ctx),
                        ))
                    }
                    ResolvedOutput::Macro(program) => {
                        let slot = resolver.register(handler_id, vec![config.match_key()]);
                        Handler::Macro(MacroHandler::new(
                            config.match_key(),
                            Arc::new(program.clone()),
                            target,
                            compiled.index,
                            mapping.macro_key_sleep_ms,
                            mapping.rel_rate,
                            slot,
                            Arc::clone(ctx),
                            runtime.clone(),
                        ))
                    }
                    _ => unreachable!("guarded by the match arm"),
                }
            }
            (output, _) => {
                let button_output = match output {
                    ResolvedOutput::Key { kind, code } => ButtonOutput::Key {
                        kind: *kind,
                        code: *code,
                    },
                    ResolvedOutput::Macro(program) => ButtonOutput::Macro {
                        program: Arc::new(program.clone()),
                    },
                    ResolvedOutput::Disabled => ButtonOutput::Disabled,
                    ResolvedOutput::Axis { .. } => {
                        tracing::error!(
                            "mapping {} combines an axis output with button inputs, skipping",
                            compiled.index
                        );
                        continue;
                    }
                };
                let keys: Vec<InputMatchKey> =
                    combination.iter().map(|config| config.match_key()).collect();
                let slot = resolver.register(handler_id, keys);
                Handler::Combination(CombinationHandler::new(
                    handler_id,
                    compiled.index,
                    target,
                    combination.0.clone(),
                    button_output,
                    mapping.release_combination_keys,
                    release_timeout,
                    mapping.macro_key_sleep_ms,
                    mapping.rel_rate,
                    slot,
                    Arc::clone(ctx),
                    runtime.clone(),
                    tx.clone(),
                ))
            }
        };

        lengths.push(combination.len());
        handlers.push(handler);
    }

    resolver.finalize();

    let mut routing: HashMap<(EventKind, u16), Vec<usize>> = HashMap::new();
    for (id, handler) in handlers.iter().enumerate() {
        for key in handler.match_keys() {
            let entry = routing.entry((key.kind, key.code)).or_default();
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
    }
    // longest combination first for longest-match arbitration
    for ids in routing.values_mut() {
        ids.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
    }

    HandlerGraph {
        handlers,
        routing,
        resolver,
    }
}
