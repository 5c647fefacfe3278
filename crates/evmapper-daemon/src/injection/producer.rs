//! Event producers
//!
//! One reader per grabbed sub-device. Each producer reads events in kernel
//! order, tags them with the sub-device's origin hash and hands them into
//! the injection's merge channel. A stop signal releases the grab at the
//! next event or immediately if the reader is idle.

use std::sync::Arc;

use evdev::EventStream;
use tokio::sync::{mpsc, watch};

use crate::injection::pipeline::{PipelineMsg, SourcedEvent};
use crate::outputs::Event;

pub async fn run_producer(
    mut stream: EventStream,
    origin: Arc<str>,
    tx: mpsc::UnboundedSender<PipelineMsg>,
    mut cancel: watch::Receiver<bool>,
) {
    tracing::debug!("producer for {origin} running");

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            result = stream.next_event() => match result {
                Ok(raw) => {
                    let Some(event) = Event::from_input_event(&raw) else {
                        continue;
                    };
                    let sourced = SourcedEvent::new(Arc::clone(&origin), event);
                    if tx.send(PipelineMsg::Input(sourced)).is_err() {
                        break;
                    }
                }
                Err(error) if error.raw_os_error() == Some(libc::ENODEV) => {
                    tracing::info!("device {origin} disappeared, dropping producer");
                    break;
                }
                Err(error) => {
                    tracing::warn!("read error on {origin}, dropping producer: {error}");
                    break;
                }
            },
        }
    }

    if let Err(error) = stream.device_mut().ungrab() {
        tracing::debug!("ungrab of {origin} failed: {error}");
    }
    tracing::debug!("producer for {origin} stopped");
}
