use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task::JoinHandle};

use super::take_receiver;
use crate::{core::entities::StoreSeed, ports::seed_provider::SeedProvider};

/// Seed provider that fetches a JSON document set over HTTP and polls for changes.
///
/// Changes are detected by hashing the response body; the first successful
/// poll only records the baseline.
pub struct HttpSeedProvider {
    url: String,
    client: Client,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    poller: JoinHandle<()>,
}

impl HttpSeedProvider {
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let poll_client = client.clone();
        let poll_url = url.clone();
        let poller = tokio::spawn(async move {
            let mut last_hash: Option<String> = None;
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                interval.tick().await;
                match Self::fetch_raw(&poll_client, &poll_url).await {
                    Ok(body) => {
                        let hash = format!("{:x}", Sha1::digest(&body));
                        match &last_hash {
                            Some(last) if *last != hash => {
                                tracing::info!(url = %poll_url, "Remote seed changed");
                                let _ = tx.try_send(());
                            }
                            _ => {}
                        }
                        last_hash = Some(hash);
                    }
                    Err(e) => tracing::warn!("Failed to poll remote seed: {}", e),
                }
            }
        });

        Self {
            url,
            client,
            update_rx: std::sync::Mutex::new(Some(rx)),
            poller,
        }
    }

    async fn fetch_raw(client: &Client, url: &str) -> Result<bytes::Bytes> {
        let resp = client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Seed endpoint returned an error status")?;
        resp.bytes().await.context("Failed to read seed body")
    }
}

impl Drop for HttpSeedProvider {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl SeedProvider for HttpSeedProvider {
    async fn load_seed(&self) -> Result<StoreSeed> {
        let body = Self::fetch_raw(&self.client, &self.url).await?;
        serde_json::from_slice(&body).context("Failed to parse JSON seed")
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        take_receiver(&self.update_rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, routing::get};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_http_seed_provider() -> Result<()> {
        let seed_state = Arc::new(Mutex::new(json!({
            "gateways": [{"id": "g1", "subdomain": "acme", "base_url": "https://api.acme.test"}],
            "routes": []
        })));

        let state = seed_state.clone();
        let app = Router::new().route(
            "/seed",
            get(move || async move {
                let seed: Value = state.lock().unwrap().clone();
                Json(seed)
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{}/seed", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpSeedProvider::new(url, Duration::from_millis(100));

        let seed = provider.load_seed().await?;
        assert_eq!(seed.gateways[0].subdomain, "acme");
        assert!(seed.routes.is_empty());

        let mut rx = provider.watch();

        // Let the poller record its baseline.
        tokio::time::sleep(Duration::from_millis(200)).await;

        seed_state.lock().unwrap()["routes"] = json!([
            {"id": "r1", "gateway_id": "g1", "path": "/users/:id"}
        ]);

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for seed update");
        assert!(
            notification.unwrap().is_some(),
            "Channel closed unexpectedly"
        );

        let seed = provider.load_seed().await?;
        assert_eq!(seed.routes.len(), 1);
        Ok(())
    }
}
