//! Device inventory
//!
//! Enumerates `/dev/input/event*` nodes and groups the ones that belong to
//! one physical device: a controller often exposes several sub-devices
//! (pen and pad of a tablet, keyboard and media keys of one board). The
//! group key is the shortest device name with a numeric suffix to keep
//! identical siblings apart, which makes autoload entries stable.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use evdev::Device;
use futures_util::StreamExt;
use inotify::{Inotify, WatchMask};
use tokio::sync::mpsc;

use crate::outputs::DEV_NAME;

const INPUT_DIR: &str = "/dev/input";

/// One physical device: a stable key and the event nodes behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    /// Stable identifier used by autoload and the control surface.
    pub key: String,
    /// Human-readable name, also the presets directory name.
    pub name: String,
    pub paths: Vec<PathBuf>,
    /// The names of the individual sub-devices.
    pub device_names: Vec<String>,
}

/// Identity shared by all sub-devices of one physical device.
///
/// Bus type, vendor and product are unique per product; the first chunk of
/// the phys path keeps two identical devices on different ports apart.
fn hardware_identity(device: &Device) -> String {
    let id = device.input_id();
    let phys = device
        .physical_path()
        .and_then(|phys| phys.split('/').next())
        .filter(|chunk| !chunk.is_empty())
        .unwrap_or("-")
        .to_string();
    format!(
        "{:04x}_{:04x}_{:04x}_{phys}",
        id.bus_type().0,
        id.vendor(),
        id.product()
    )
}

/// Stable per-sub-device hash, used to tag events and to bind input
/// configs to one node of a group.
pub fn origin_hash(device: &Device, path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    device.name().unwrap_or("").hash(&mut hasher);
    device.physical_path().unwrap_or("").hash(&mut hasher);
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Whether the daemon should never touch this device.
fn is_denylisted(device: &Device) -> bool {
    device
        .name()
        .map(|name| name.starts_with(DEV_NAME))
        .unwrap_or(false)
}

/// Enumerate all groups currently present.
pub fn discover() -> Result<Vec<DeviceGroup>> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir(INPUT_DIR)
        .with_context(|| format!("failed to read {INPUT_DIR}"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("event"))
                .unwrap_or(false)
        })
        .collect();
    nodes.sort();

    // identity -> (names, paths), insertion-ordered by identity for
    // deterministic suffix assignment
    let mut grouped: BTreeMap<String, (Vec<String>, Vec<PathBuf>)> = BTreeMap::new();
    for path in nodes {
        let device = match Device::open(&path) {
            Ok(device) => device,
            Err(error) => {
                tracing::debug!("could not open {}: {error}", path.display());
                continue;
            }
        };
        if is_denylisted(&device) {
            continue;
        }

        let identity = hardware_identity(&device);
        let name = device.name().unwrap_or("unknown").to_string();
        let entry = grouped.entry(identity).or_default();
        entry.0.push(name);
        entry.1.push(path);
    }

    let mut groups = Vec::with_capacity(grouped.len());
    let mut used_keys = HashSet::new();
    for (_, (device_names, paths)) in grouped {
        let name = device_names
            .iter()
            .min_by_key(|name| name.len())
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let key = dedupe_key(&name, &mut used_keys);
        groups.push(DeviceGroup {
            key,
            name,
            paths,
            device_names,
        });
    }

    Ok(groups)
}

/// Resolve a group key to its sub-device paths.
pub fn resolve(groups: &[DeviceGroup], key: &str) -> Option<DeviceGroup> {
    groups.iter().find(|group| group.key == key).cloned()
}

/// Append " 2", " 3", ... until the key is unique.
fn dedupe_key(name: &str, used: &mut HashSet<String>) -> String {
    let mut key = name.to_string();
    let mut counter = 2;
    while used.contains(&key) {
        key = format!("{name} {counter}");
        counter += 1;
    }
    used.insert(key.clone());
    key
}

/// A device node appeared or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryEvent {
    Added(PathBuf),
    Removed(PathBuf),
}

/// Watch `/dev/input` and push change notifications into `tx` until the
/// receiver goes away.
pub async fn watch_devices(tx: mpsc::UnboundedSender<InventoryEvent>) -> Result<()> {
    let inotify = Inotify::init().context("failed to initialize inotify")?;
    inotify
        .watches()
        .add(INPUT_DIR, WatchMask::CREATE | WatchMask::DELETE)
        .with_context(|| format!("failed to watch {INPUT_DIR}"))?;

    let mut stream = inotify.into_event_stream([0u8; 1024])?;
    while let Some(event) = stream.next().await {
        let event = event.context("inotify stream error")?;
        let Some(name) = event.name else { continue };
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("event") {
            continue;
        }

        let path = Path::new(INPUT_DIR).join(name);
        let change = if event.mask.contains(inotify::EventMask::CREATE) {
            InventoryEvent::Added(path)
        } else {
            InventoryEvent::Removed(path)
        };
        if tx.send(change).is_err() {
            break;
        }
    }

    Ok(())
}
