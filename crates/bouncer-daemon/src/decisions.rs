//! Decision stream client and dataset updater.
//!
//! The stream pulls decision batches from the local API; the updater applies
//! them to the parent's dataset and republishes them as control messages for
//! the routing layer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bouncer_core::config::ApiConfig;
use bouncer_core::{ControlMessage, Dataset, DecisionBatch};
use reqwest::header::{HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::TaskError;

/// Decision stream errors.
#[derive(Debug, Error)]
pub enum DecisionStreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Local API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("decision stream halted")]
    Halted,
}

/// Source of decision batches.
///
/// `run` returns `Ok` once `cancel` fires. Returning for any other reason
/// means the stream stopped, which the parent treats as fatal.
pub trait DecisionStream: Send + 'static {
    fn run(
        self,
        batches: mpsc::Sender<DecisionBatch>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), DecisionStreamError>> + Send;
}

/// Polling client for the local API's `/v1/decisions/stream` endpoint.
#[derive(Debug)]
pub struct LapiStream {
    http: reqwest::Client,
    stream_url: String,
    interval: Duration,
}

impl LapiStream {
    pub fn new(config: &ApiConfig) -> Result<Self, DecisionStreamError> {
        let base = config.url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(DecisionStreamError::Config("api.url is empty".into()));
        }
        if config.update_frequency_secs == 0 {
            return Err(DecisionStreamError::Config(
                "api.update_frequency_secs must be at least 1".into(),
            ));
        }

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.key)
            .map_err(|_| DecisionStreamError::Config("Invalid api.key format".into()))?;
        headers.insert("x-api-key", key);

        // reqwest is built with rustls-no-provider; `Err` means a provider is
        // already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("spoa-bouncer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            stream_url: format!("{base}/v1/decisions/stream"),
            interval: Duration::from_secs(config.update_frequency_secs),
        })
    }

    /// Stream endpoint URL; `startup` asks for the full current set.
    pub fn url(&self, startup: bool) -> String {
        format!("{}?startup={startup}", self.stream_url)
    }

    pub async fn pull(&self, startup: bool) -> Result<DecisionBatch, DecisionStreamError> {
        let resp = self.http.get(self.url(startup)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(DecisionStreamError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }
}

impl DecisionStream for LapiStream {
    async fn run(
        self,
        batches: mpsc::Sender<DecisionBatch>,
        cancel: CancellationToken,
    ) -> Result<(), DecisionStreamError> {
        let mut startup = true;
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = timer.tick() => {}
            }

            let pulled = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                pulled = self.pull(startup) => pulled,
            };
            match pulled {
                Ok(batch) => {
                    startup = false;
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(new = batch.new.len(), deleted = batch.deleted.len(), "Pulled decisions");
                    if batches.send(batch).await.is_err() {
                        return Err(DecisionStreamError::Halted);
                    }
                }
                Err(e) => warn!(error = %e, url = %self.url(startup), "Decision stream pull failed"),
            }
        }
    }
}

/// Run `stream` as a group task. Any return before cancellation is fatal.
pub async fn run_stream<S: DecisionStream>(
    stream: S,
    batches: mpsc::Sender<DecisionBatch>,
    cancel: CancellationToken,
) -> Result<(), TaskError> {
    let result = stream.run(batches, cancel.clone()).await;
    if cancel.is_cancelled() {
        return Ok(());
    }
    let error = result.err().unwrap_or(DecisionStreamError::Halted);
    Err(TaskError::failed("decision-stream", error))
}

/// Apply incoming batches to `dataset` and publish them on `updates`.
pub async fn apply_decisions(
    mut batches: mpsc::Receiver<DecisionBatch>,
    dataset: Arc<RwLock<Dataset>>,
    updates: broadcast::Sender<ControlMessage>,
    cancel: CancellationToken,
) -> Result<(), TaskError> {
    info!("Processing new and deleted decisions");
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            batch = batches.recv() => match batch {
                Some(batch) => apply_batch(batch, &dataset, &updates).await,
                None => {
                    // The stream task reports its own failure.
                    cancel.cancelled().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn apply_batch(
    batch: DecisionBatch,
    dataset: &RwLock<Dataset>,
    updates: &broadcast::Sender<ControlMessage>,
) {
    let DecisionBatch { new, deleted } = batch;
    let mut data = dataset.write().await;

    // Publishing under the write lock keeps snapshots and updates ordered for
    // subscribers that snapshot after subscribing.
    if !new.is_empty() {
        debug!(count = new.len(), "Processing new decisions");
        data.add(new.iter().cloned());
        let _ = updates.send(ControlMessage::Added { decisions: new });
    }
    if !deleted.is_empty() {
        debug!(count = deleted.len(), "Processing deleted decisions");
        data.remove(&deleted);
        let _ = updates.send(ControlMessage::Deleted { decisions: deleted });
    }
    drop(data);
}
