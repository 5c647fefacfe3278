//! The injection engine
//!
//! The [`Supervisor`] owns the lifecycle of every running injection: it
//! grabs the sub-devices of a group, materializes producers, the handler
//! graph and the macro runtime, and tears everything down again on stop.
//! One injection is fully isolated from the others; they only share the
//! virtual output registry and the shared variable store.

pub mod context;
pub mod handlers;
pub mod pipeline;
pub mod producer;
pub mod resolver;
pub mod runtime;
pub mod shaping;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use evdev::Device;
use evmapper_config::targets::Capabilities;
use evmapper_config::{compile_preset, InvalidPreset, Preset, SymbolTable};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::injection::context::{Context, SharedVars, LED_CAPSL, LED_NUML};
use crate::injection::pipeline::Pipeline;
use crate::injection::runtime::MacroRuntime;
use crate::inventory::{origin_hash, DeviceGroup};
use crate::outputs::OutputRegistry;

/// Extra drain budget on top of the largest `release_timeout`.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Lifecycle state of one injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionStatus {
    Starting,
    Running,
    Stopped,
    Failed(String),
}

/// Why a start request was rejected.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no readable devices found for the group")]
    NoDevicesFound,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    InvalidPreset(#[from] InvalidPreset),
}

struct Injection {
    status: InjectionStatus,
    cancel: watch::Sender<bool>,
    runtime: Arc<MacroRuntime>,
    producer_tasks: Vec<JoinHandle<()>>,
    pipeline_task: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

/// Owns every running injection.
pub struct Supervisor {
    outputs: Arc<OutputRegistry>,
    symbols: Arc<SymbolTable>,
    vars: SharedVars,
    injections: HashMap<String, Injection>,
}

impl Supervisor {
    pub fn new(outputs: Arc<OutputRegistry>, symbols: Arc<SymbolTable>) -> Self {
        Self {
            outputs,
            symbols,
            vars: SharedVars::new(),
            injections: HashMap::new(),
        }
    }

    /// The shared variable store, alive for the daemon's lifetime.
    pub fn vars(&self) -> &SharedVars {
        &self.vars
    }

    /// Grab the group's sub-devices and start injecting with the preset.
    ///
    /// A group that is already injecting is stopped first; preset changes
    /// only become visible through such a restart.
    pub async fn start(&mut self, group: &DeviceGroup, preset: &Preset) -> Result<(), StartError> {
        if self.injections.contains_key(&group.key) {
            tracing::info!("restarting injection for \"{}\"", group.key);
            self.stop(&group.key).await;
        }

        let compiled = compile_preset(preset, &self.symbols)?;
        for (index, error) in &compiled.disabled {
            tracing::warn!(
                "preset \"{}\": mapping {index} disabled: {error}",
                preset.name
            );
        }

        // open every readable node of the group
        let mut devices: Vec<(String, std::path::PathBuf, Device)> = Vec::new();
        for path in &group.paths {
            match Device::open(path) {
                Ok(device) => {
                    let origin = origin_hash(&device, path);
                    devices.push((origin, path.clone(), device));
                }
                Err(error) => {
                    tracing::warn!("could not open {}: {error}", path.display());
                }
            }
        }
        if devices.is_empty() {
            return Err(StartError::NoDevicesFound);
        }

        // exclusive grabs; a single failure aborts and releases the rest
        for i in 0..devices.len() {
            if let Err(error) = devices[i].2.grab() {
                let failed_path = devices[i].1.clone();
                for (_, _, device) in devices.iter_mut().take(i) {
                    let _ = device.ungrab();
                }
                return Err(StartError::PermissionDenied(format!(
                    "failed to grab {}: {error}",
                    failed_path.display()
                )));
            }
        }

        // gather capabilities and axis ranges for the context and the
        // forwarded device
        let mut forward_caps = Capabilities::default();
        let mut abs_ranges = HashMap::new();
        let mut capslock = false;
        let mut numlock = false;
        for (origin, _, device) in &devices {
            if let Some(keys) = device.supported_keys() {
                for key in keys.iter() {
                    forward_caps.keys.push(key.code());
                }
            }
            if let Some(axes) = device.supported_relative_axes() {
                for axis in axes.iter() {
                    forward_caps.rel.push(axis.0);
                }
            }
            if let Some(axes) = device.supported_absolute_axes() {
                let state = device.get_abs_state().ok();
                for axis in axes.iter() {
                    forward_caps.abs.push(axis.0);
                    if let Some(info) = state.as_ref().and_then(|s| s.get(axis.0 as usize)) {
                        abs_ranges
                            .insert((origin.clone(), axis.0), (info.minimum, info.maximum));
                    }
                }
            }
            if let Ok(leds) = device.get_led_state() {
                capslock |= leds.contains(evdev::LedType::LED_CAPSL);
                numlock |= leds.contains(evdev::LedType::LED_NUML);
            }
        }
        forward_caps.keys.sort_unstable();
        forward_caps.keys.dedup();
        forward_caps.rel.sort_unstable();
        forward_caps.rel.dedup();
        forward_caps.abs.sort_unstable();
        forward_caps.abs.dedup();

        let forward = self
            .outputs
            .create_forward(&group.name, forward_caps)
            .map_err(|error| StartError::PermissionDenied(error.to_string()))?;

        let drain_timeout = compiled
            .mappings
            .iter()
            .map(|m| m.mapping.release_timeout)
            .fold(0.0_f64, f64::max);
        let drain_timeout = Duration::from_secs_f64(drain_timeout) + DRAIN_GRACE;

        let mut ctx = Context::new(
            compiled,
            Arc::clone(&self.symbols),
            Arc::clone(&self.outputs),
            forward,
            self.vars.clone(),
        );
        ctx.abs_ranges = abs_ranges;
        ctx.leds.update(LED_CAPSL, capslock);
        ctx.leds.update(LED_NUML, numlock);
        let ctx = Arc::new(ctx);

        let runtime = MacroRuntime::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let pipeline = Pipeline::new(
            Arc::clone(&ctx),
            Arc::clone(&runtime),
            rx,
            tx.clone(),
            cancel_rx.clone(),
        );
        let pipeline_task = tokio::spawn(pipeline.run());

        let mut producer_tasks = Vec::with_capacity(devices.len());
        for (origin, _, device) in devices {
            let stream = match device.into_event_stream() {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::warn!("no event stream for {origin}, skipping: {error}");
                    continue;
                }
            };
            producer_tasks.push(tokio::spawn(producer::run_producer(
                stream,
                Arc::from(origin),
                tx.clone(),
                cancel_rx.clone(),
            )));
        }

        tracing::info!(
            "injection for \"{}\" ({}) running with {} producer(s)",
            group.key,
            preset.name,
            producer_tasks.len()
        );

        self.injections.insert(
            group.key.clone(),
            Injection {
                status: InjectionStatus::Running,
                cancel: cancel_tx,
                runtime,
                producer_tasks,
                pipeline_task: Some(pipeline_task),
                drain_timeout,
            },
        );

        Ok(())
    }

    /// Stop an injection. A second stop for the same group is a no-op.
    pub async fn stop(&mut self, group_key: &str) {
        let Some(mut injection) = self.injections.remove(group_key) else {
            tracing::debug!("stop for \"{group_key}\": nothing running");
            return;
        };

        let _ = injection.cancel.send(true);
        injection.runtime.shutdown(injection.drain_timeout).await;

        for task in injection.producer_tasks.drain(..) {
            if tokio::time::timeout(injection.drain_timeout, task).await.is_err() {
                tracing::warn!("producer for \"{group_key}\" did not stop in time");
            }
        }
        if let Some(task) = injection.pipeline_task.take() {
            if tokio::time::timeout(injection.drain_timeout, task).await.is_err() {
                tracing::warn!("pipeline for \"{group_key}\" did not drain in time");
            }
        }

        tracing::info!("injection for \"{group_key}\" stopped");
    }

    pub async fn stop_all(&mut self) {
        let keys: Vec<String> = self.injections.keys().cloned().collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    pub fn status(&self, group_key: &str) -> InjectionStatus {
        match self.injections.get(group_key) {
            Some(injection) => injection.status.clone(),
            None => InjectionStatus::Stopped,
        }
    }

    /// Group keys of currently running injections.
    pub fn running(&self) -> Vec<String> {
        self.injections.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_injection_is_a_no_op() {
        let outputs = Arc::new(OutputRegistry::recording());
        let mut supervisor = Supervisor::new(outputs, Arc::new(SymbolTable::new()));

        supervisor.stop("not running").await;
        supervisor.stop("not running").await;
        assert_eq!(supervisor.status("not running"), InjectionStatus::Stopped);
        assert!(supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn start_with_no_nodes_is_rejected() {
        let outputs = Arc::new(OutputRegistry::recording());
        let mut supervisor = Supervisor::new(outputs, Arc::new(SymbolTable::new()));

        let group = DeviceGroup {
            key: "ghost".to_string(),
            name: "ghost".to_string(),
            paths: vec![std::path::PathBuf::from("/dev/input/event999")],
            device_names: vec!["ghost".to_string()],
        };
        let preset = Preset::new("empty", "ghost");

        match supervisor.start(&group, &preset).await {
            Err(StartError::NoDevicesFound) => {}
            other => panic!("expected NoDevicesFound, got {other:?}"),
        }
    }
}
