use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::take_receiver;
use crate::{
    config::load_seed_file, core::entities::StoreSeed, ports::seed_provider::SeedProvider,
};

/// Seed provider that reads gateways and routes from a local file and
/// watches it for changes.
pub struct FileSeedProvider {
    path: PathBuf,
    // Dropping the watcher stops notifications.
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileSeedProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        provider.init_watcher()?;
        Ok(provider)
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let seed_filename = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid seed path: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&seed_filename))
                        {
                            tracing::debug!("Seed file changed: {:?}", event.kind);
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch seed directory")?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl SeedProvider for FileSeedProvider {
    async fn load_seed(&self) -> Result<StoreSeed> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_seed_file(&path))
            .await
            .wrap_err("Seed loading task failed")?
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        take_receiver(&self.update_rx)
    }
}
