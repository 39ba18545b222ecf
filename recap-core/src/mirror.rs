//! Best-effort replication of accounted clips to a per-user document store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::config::MirrorSection;
use crate::history::{format_timestamp, VideoEvent};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid mirror url: {0}")]
    Url(#[from] url::ParseError),
    #[error("mirror base url {0} cannot carry a document path")]
    CannotBeABase(String),
    #[error("mirror rejected request with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("mirror project id is not configured")]
    MissingProject,
}

pub type MirrorResult<T> = Result<T, MirrorError>;

/// Remote copy of a [`VideoEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorDocument {
    #[serde(skip)]
    pub doc_id: String,
    pub game_name: String,
    pub duration: f64,
    pub timestamp: String,
    pub updated_at: String,
    pub file_path: String,
}

impl MirrorDocument {
    pub fn from_event(event: &VideoEvent) -> Self {
        Self {
            doc_id: document_id(&event.timestamp),
            game_name: event.game_name.clone(),
            duration: event.duration,
            timestamp: event.timestamp.clone(),
            updated_at: format_timestamp(Utc::now()),
            file_path: event.path.to_string_lossy().into_owned(),
        }
    }

    /// Firestore's typed-value encoding of the document body.
    pub fn to_fields(&self) -> Value {
        json!({
            "fields": {
                "gameName": { "stringValue": self.game_name },
                "duration": { "doubleValue": self.duration },
                "timestamp": { "stringValue": self.timestamp },
                "updatedAt": { "stringValue": self.updated_at },
                "filePath": { "stringValue": self.file_path },
            }
        })
    }
}

/// Document key derived from an event timestamp: `:` and `.` removed.
pub fn document_id(timestamp: &str) -> String {
    timestamp.chars().filter(|ch| !matches!(ch, ':' | '.')).collect()
}

#[async_trait]
pub trait RemoteMirror: Send + Sync {
    async fn upsert(&self, identity: &str, document: &MirrorDocument) -> MirrorResult<()>;

    async fn delete(&self, identity: &str, doc_id: &str) -> MirrorResult<()>;
}

/// Firestore REST client writing to `users/{identity}/videos/{doc}`.
#[derive(Debug, Clone)]
pub struct FirestoreMirror {
    client: Client,
    base: Url,
    project_id: String,
    api_key: Option<String>,
}

impl FirestoreMirror {
    pub fn new(
        client: Client,
        base_url: &str,
        project_id: impl Into<String>,
        api_key: Option<String>,
    ) -> MirrorResult<Self> {
        let project_id = project_id.into();
        if project_id.trim().is_empty() {
            return Err(MirrorError::MissingProject);
        }
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(MirrorError::CannotBeABase(base_url.to_string()));
        }
        Ok(Self {
            client,
            base,
            project_id,
            api_key,
        })
    }

    pub fn from_config(config: &MirrorSection) -> MirrorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Self::new(
            client,
            &config.base_url,
            config.project_id.clone(),
            config.api_key.clone(),
        )
    }

    pub fn document_url(&self, identity: &str, doc_id: &str) -> MirrorResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MirrorError::CannotBeABase(self.base.to_string()))?
            .pop_if_empty()
            .extend([
                "projects",
                self.project_id.as_str(),
                "databases",
                "(default)",
                "documents",
                "users",
                identity,
                "videos",
                doc_id,
            ]);
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }
}

async fn check_status(response: reqwest::Response) -> MirrorResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(MirrorError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RemoteMirror for FirestoreMirror {
    async fn upsert(&self, identity: &str, document: &MirrorDocument) -> MirrorResult<()> {
        let url = self.document_url(identity, &document.doc_id)?;
        let response = self
            .client
            .patch(url)
            .json(&document.to_fields())
            .send()
            .await?;
        check_status(response).await
    }

    async fn delete(&self, identity: &str, doc_id: &str) -> MirrorResult<()> {
        let url = self.document_url(identity, doc_id)?;
        let response = self.client.delete(url).send().await?;
        check_status(response).await
    }
}
