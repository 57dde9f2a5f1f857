//! Client for the external CRDT merge engine.
//!
//! The engine is a separate HTTP service that merges opaque update fragments
//! into a materialized state and extracts indexable blocks from a state. This
//! module never interprets fragment bytes; they cross the wire as base64.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use pagewiki_types::{ExtractedBlock, Snapshot, UpdateRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine request timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("engine response could not be decoded: {0}")]
    Decode(String),
}

/// Narrow contract with the merge engine.
#[async_trait]
pub trait MergeEngine: Send + Sync {
    /// Merge an ordered list of fragments into one state. A prior state may be
    /// passed as the first element.
    async fn apply_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError>;

    /// Extract indexable blocks from a materialized state.
    async fn extract_blocks(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError>;

    /// Liveness probe.
    async fn health(&self) -> Result<(), EngineError>;
}

/// Body of `POST /apply-updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyUpdatesRequest {
    pub updates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyUpdatesResponse {
    pub state: String,
}

/// Body of `POST /extract-blocks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractBlocksRequest {
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractBlocksResponse {
    pub blocks: Vec<ExtractedBlock>,
}

/// HTTP implementation of [`MergeEngine`].
#[derive(Debug, Clone)]
pub struct HttpMergeEngine {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpMergeEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EngineError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.timeout)
        } else {
            EngineError::Http(err)
        }
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, EngineError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MergeEngine for HttpMergeEngine {
    async fn apply_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        let body = ApplyUpdatesRequest {
            updates: updates.iter().map(|u| B64.encode(u)).collect(),
        };
        debug!(count = updates.len(), "engine apply-updates");
        let resp: ApplyUpdatesResponse = self.post_json("/apply-updates", &body).await?;
        B64.decode(resp.state.as_bytes())
            .map_err(|e| EngineError::Decode(format!("state is not base64: {e}")))
    }

    async fn extract_blocks(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError> {
        let body = ExtractBlocksRequest {
            state: B64.encode(state),
        };
        let resp: ExtractBlocksResponse = self.post_json("/extract-blocks", &body).await?;
        debug!(blocks = resp.blocks.len(), "engine extract-blocks");
        Ok(resp.blocks)
    }

    async fn health(&self) -> Result<(), EngineError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Status {
                status: resp.status().as_u16(),
                body: String::new(),
            })
        }
    }
}

/// A page state together with the highest update sequence merged into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub state: Vec<u8>,
    pub covered_seq: u64,
}

/// Merge `base` (latest snapshot, if any) with the log tail recorded after it.
///
/// The engine is only called when there is a tail to merge.
pub async fn materialize(
    engine: &dyn MergeEngine,
    base: Option<&Snapshot>,
    tail: &[UpdateRecord],
) -> Result<Materialized, EngineError> {
    let base_seq = base.map(|s| s.covered_seq).unwrap_or(0);
    let Some(last) = tail.last() else {
        return Ok(Materialized {
            state: base.map(|s| s.state.clone()).unwrap_or_default(),
            covered_seq: base_seq,
        });
    };

    let mut updates = Vec::with_capacity(tail.len() + 1);
    if let Some(snapshot) = base {
        updates.push(snapshot.state.clone());
    }
    updates.extend(tail.iter().map(|r| r.fragment.clone()));

    let state = engine.apply_updates(&updates).await?;
    Ok(Materialized {
        state,
        covered_seq: last.seq,
    })
}
