//! Command modules - one file per CLI verb

pub mod artifact;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod index;
pub mod install;
pub mod list;
pub mod search;
pub mod sync;
pub mod uninstall;
pub mod update;

use gotya::ops::orchestrator::Event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawn a task that renders orchestrator events to stdout, returning
/// the sender to hand to the orchestrator and the handle to await once
/// the operation ends.
pub fn event_printer() -> (mpsc::UnboundedSender<Event>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("[{}] {}", event.phase, event.msg);
        }
    });
    (tx, handle)
}
