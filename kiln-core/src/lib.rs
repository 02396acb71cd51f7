// kiln-core/src/lib.rs
pub mod build;
pub mod fetch;
pub mod install;
pub mod interpreter;
pub mod step;
pub mod uninstall;
pub mod verify;

use kiln_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;

pub use fetch::{FetchedSource, SourceAcquirer};
pub use install::InstallOutcome;
pub use interpreter::{Plan, Session, SessionOptions, SessionReport};
pub use uninstall::{uninstall, UninstallOptions, UninstallReport};
pub use verify::VerificationReport;

const EVENT_CHANNEL_SIZE: usize = 256;

pub type EventSender = broadcast::Sender<PipelineEvent>;

pub fn event_channel() -> (EventSender, broadcast::Receiver<PipelineEvent>) {
    broadcast::channel(EVENT_CHANNEL_SIZE)
}

/// Publishes `event`. Having no subscribers is not an error.
pub(crate) fn emit(events: &EventSender, event: PipelineEvent) {
    let _ = events.send(event);
}
