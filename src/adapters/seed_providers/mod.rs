//! Sources of the administrative document set.
use std::sync::Mutex;

use tokio::sync::mpsc;

pub mod file;
pub mod http;

pub use file::FileSeedProvider;
pub use http::HttpSeedProvider;

/// Hand out the change receiver once. Later callers get a closed channel.
fn take_receiver(slot: &Mutex<Option<mpsc::Receiver<()>>>) -> mpsc::Receiver<()> {
    let taken = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    taken.unwrap_or_else(|| {
        tracing::warn!("Seed watch channel already taken");
        let (_, rx) = mpsc::channel(1);
        rx
    })
}
