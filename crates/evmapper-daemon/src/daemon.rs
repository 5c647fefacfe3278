//! Daemon shell
//!
//! Wires the inventory, the virtual output registry, the supervisor and
//! the IPC server together and runs the control loop: IPC requests,
//! hotplug notifications and the shutdown signal all land here.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use evmapper_config::{ConfigDir, Preset, SymbolTable};
use tokio::sync::mpsc;

use crate::injection::{StartError, Supervisor};
use crate::inventory::{self, DeviceGroup, InventoryEvent};
use crate::ipc::{self, GroupSummary, IpcRequest, IpcResponse, IpcServer};
use crate::outputs::OutputRegistry;

pub struct Daemon {
    config_dir: ConfigDir,
    symbols: Arc<SymbolTable>,
    supervisor: Supervisor,
    server: IpcServer,
}

impl Daemon {
    /// Pre-flight: open the virtual outputs, load the symbol overrides and
    /// bind the control socket. Any failure here aborts startup.
    pub fn new(config_dir: ConfigDir) -> Result<Self> {
        let outputs = Arc::new(OutputRegistry::open()?);

        let mut symbols = SymbolTable::new();
        match config_dir.load_xmodmap() {
            Ok(overrides) if !overrides.is_empty() => {
                tracing::info!("loaded {} layout symbol overrides", overrides.len());
                symbols.apply_overrides(&overrides);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!("ignoring xmodmap overrides: {error}"),
        }
        let symbols = Arc::new(symbols);

        let supervisor = Supervisor::new(outputs, Arc::clone(&symbols));
        let server = IpcServer::new()?;

        Ok(Self {
            config_dir,
            symbols,
            supervisor,
            server,
        })
    }

    /// Run until SIGINT/SIGTERM. Serves IPC requests and reacts to device
    /// hotplug by retrying autoload entries.
    pub async fn run(mut self) -> Result<()> {
        let (hotplug_tx, mut hotplug_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(error) = inventory::watch_devices(hotplug_tx).await {
                tracing::warn!("device watcher stopped: {error}");
            }
        });

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            tokio::select! {
                connection = self.server.accept() => match connection {
                    Ok(mut stream) => {
                        match ipc::read_request(&mut stream).await {
                            Ok(Some(request)) => {
                                tracing::debug!("IPC request: {request:?}");
                                let response = self.handle_request(request).await;
                                if let Err(error) = ipc::write_response(&mut stream, &response).await {
                                    tracing::warn!("failed to answer IPC request: {error}");
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                tracing::warn!("bad IPC request: {error}");
                                let response = IpcResponse::Error {
                                    message: error.to_string(),
                                };
                                let _ = ipc::write_response(&mut stream, &response).await;
                            }
                        }
                    }
                    Err(error) => tracing::warn!("accept failed: {error}"),
                },
                event = hotplug_rx.recv() => match event {
                    Some(InventoryEvent::Added(path)) => {
                        tracing::info!("device appeared at {}", path.display());
                        self.retry_autoload().await;
                    }
                    Some(InventoryEvent::Removed(path)) => {
                        // the affected producer notices ENODEV on its own
                        tracing::info!("device disappeared at {}", path.display());
                    }
                    None => {}
                },
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
            }
        }

        tracing::info!("shutting down");
        self.supervisor.stop_all().await;
        Ok(())
    }

    pub async fn handle_request(&mut self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Hello => IpcResponse::Hello,
            IpcRequest::ListGroups => self.list_groups(),
            IpcRequest::StartInjection {
                group_key,
                preset_name,
            } => match self.start_injection(&group_key, &preset_name).await {
                Ok(()) => IpcResponse::Accepted,
                Err(reason) => IpcResponse::Rejected { reason },
            },
            IpcRequest::StopInjection { group_key } => {
                self.supervisor.stop(&group_key).await;
                IpcResponse::Ok
            }
            IpcRequest::Autoload { config_dir } => {
                if let Some(path) = config_dir {
                    self.config_dir = ConfigDir::new(path);
                }
                self.autoload().await;
                IpcResponse::Ok
            }
            IpcRequest::SetConfigDir { path } => {
                tracing::info!("configuration directory set to {}", path.display());
                self.config_dir = ConfigDir::new(path);
                IpcResponse::Ok
            }
        }
    }

    fn list_groups(&self) -> IpcResponse {
        match inventory::discover() {
            Ok(groups) => IpcResponse::Groups {
                groups: groups
                    .into_iter()
                    .map(|group| GroupSummary {
                        status: format!("{:?}", self.supervisor.status(&group.key)),
                        group_key: group.key,
                        human_name: group.name,
                        sub_device_paths: group.paths,
                    })
                    .collect(),
            },
            Err(error) => IpcResponse::Error {
                message: error.to_string(),
            },
        }
    }

    async fn start_injection(&mut self, group_key: &str, preset_name: &str) -> Result<(), String> {
        let groups = inventory::discover().map_err(|error| error.to_string())?;
        let Some(group) = inventory::resolve(&groups, group_key) else {
            return Err(format!("no devices found for group \"{group_key}\""));
        };

        let preset = self.load_preset(&group, preset_name)?;
        self.supervisor
            .start(&group, &preset)
            .await
            .map_err(|error| match &error {
                StartError::InvalidPreset(invalid) => invalid.to_string(),
                other => other.to_string(),
            })
    }

    fn load_preset(&self, group: &DeviceGroup, preset_name: &str) -> Result<Preset, String> {
        self.config_dir
            .load_preset(&group.name, preset_name)
            .map(|mut preset| {
                preset.group_key = group.key.clone();
                preset
            })
            .map_err(|error| error.to_string())
    }

    /// Start every configured `(group, preset)` pair.
    async fn autoload(&mut self) {
        let config = match self.config_dir.load_config() {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!("cannot load config for autoload: {error}");
                return;
            }
        };

        for (group_key, preset_name) in &config.autoload {
            match self.start_injection(group_key, preset_name).await {
                Ok(()) => tracing::info!("autoloaded \"{preset_name}\" for \"{group_key}\""),
                Err(reason) => {
                    tracing::warn!("autoload of \"{preset_name}\" for \"{group_key}\" failed: {reason}");
                }
            }
        }
    }

    /// After hotplug: start autoload entries whose group just became
    /// available and is not injecting yet.
    async fn retry_autoload(&mut self) {
        let Ok(config) = self.config_dir.load_config() else {
            return;
        };
        let running = self.supervisor.running();

        for (group_key, preset_name) in &config.autoload {
            if running.contains(group_key) {
                continue;
            }
            if self.start_injection(group_key, preset_name).await.is_ok() {
                tracing::info!("autoloaded \"{preset_name}\" for hotplugged \"{group_key}\"");
            }
        }
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }
}
