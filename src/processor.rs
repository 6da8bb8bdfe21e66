//! External collaborators of the ingestion pipeline: the document
//! processing worker and the LLM content generator, both invoked over HTTP.
//! Also owns the fire-and-forget dispatch path, which guarantees that a
//! failed invocation still lands the document in a terminal `error` state.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::Document;
use crate::pipeline::{DocumentMetadata, DocumentStatus, ErrorCode, ProcessingError};
use crate::realtime::{ChangeEvent, ChangeType};
use crate::schema::documents;
use crate::state::AppState;

/// The asynchronous processing worker (text extraction, chunking,
/// embeddings). Invocation is at-most-once per call; the worker must
/// tolerate duplicate triggers for the same document.
#[async_trait]
pub trait DocumentProcessor: Send + Sync + 'static {
    async fn invoke(&self, document_id: Uuid) -> Result<()>;
}

/// The LLM-backed content generation service used by generation tasks.
#[async_trait]
pub trait ContentGenerator: Send + Sync + 'static {
    async fn generate(&self, kind: &str, title: &str) -> Result<String>;
}

pub struct HttpDocumentProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDocumentProcessor {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl DocumentProcessor for HttpDocumentProcessor {
    async fn invoke(&self, document_id: Uuid) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&json!({ "document_id": document_id }))
            .send()
            .await
            .context("failed to reach document processor")?
            .error_for_status()
            .context("document processor rejected invocation")?;
        Ok(())
    }
}

pub struct HttpContentGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpContentGenerator {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, kind: &str, title: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "kind": kind, "title": title }))
            .send()
            .await
            .context("failed to reach content generator")?
            .error_for_status()
            .context("content generator rejected request")?;

        let body: serde_json::Value = response
            .json()
            .await
            .context("invalid content generator response")?;
        body.get("content")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("content generator response missing 'content'"))
    }
}

/// Stand-in used when the corresponding endpoint is not configured. Every
/// call fails, which the dispatch path converts into a structured
/// configuration error on the document/task.
pub struct UnconfiguredCollaborator {
    name: &'static str,
}

impl UnconfiguredCollaborator {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl DocumentProcessor for UnconfiguredCollaborator {
    async fn invoke(&self, _document_id: Uuid) -> Result<()> {
        Err(anyhow!("{} endpoint is not configured", self.name))
    }
}

#[async_trait]
impl ContentGenerator for UnconfiguredCollaborator {
    async fn generate(&self, _kind: &str, _title: &str) -> Result<String> {
        Err(anyhow!("{} endpoint is not configured", self.name))
    }
}

/// Serializable view of a document row for change events (drops nothing the
/// UI polls for, keeps the metadata blob intact).
pub fn document_wire(document: &Document) -> serde_json::Value {
    json!({
        "id": document.id,
        "organisation_id": document.organisation_id,
        "base_class_id": document.base_class_id,
        "original_name": document.original_name,
        "status": document.status,
        "metadata": document.metadata,
        "updated_at": document.updated_at.and_utc(),
    })
}

pub fn publish_document_change(
    state: &AppState,
    event_type: ChangeType,
    old: Option<&Document>,
    new: Option<&Document>,
) {
    let reference = new.or(old);
    let Some(reference) = reference else { return };
    state.changes.publish(ChangeEvent::new(
        event_type,
        "documents",
        reference.organisation_id,
        reference.id,
        new.map(document_wire),
        old.map(document_wire),
    ));
}

/// Moves a document to `error` with a structured failure record. Used by
/// every failure path that must terminate the pipeline visibly.
pub fn mark_document_error(
    state: &AppState,
    conn: &mut PgConnection,
    document_id: Uuid,
    failure: ProcessingError,
) -> AppResult<Document> {
    let document: Document = documents::table.find(document_id).first(conn)?;
    let current = DocumentStatus::parse(&document.status)
        .ok_or_else(|| AppError::internal(format!("unknown document status {}", document.status)))?;

    if !current.can_transition_to(DocumentStatus::Error) && current != DocumentStatus::Error {
        warn!(
            document_id = %document_id,
            status = %document.status,
            "skipping error transition from terminal status"
        );
        return Ok(document);
    }

    let mut metadata = DocumentMetadata::from_value(&document.metadata);
    metadata.processing_error = Some(failure);

    diesel::update(documents::table.find(document_id))
        .set((
            documents::status.eq(DocumentStatus::Error.as_str()),
            documents::metadata.eq(metadata.to_value()),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;

    let updated: Document = documents::table.find(document_id).first(conn)?;
    publish_document_change(state, ChangeType::Update, Some(&document), Some(&updated));
    Ok(updated)
}

/// Fire-and-forget trigger of the processing worker. Never blocks the HTTP
/// response; an invocation failure always terminates in a status update so
/// the UI has something to poll or subscribe to.
pub fn dispatch_processing(state: AppState, document_id: Uuid) {
    tokio::spawn(async move {
        match state.processor.invoke(document_id).await {
            Ok(()) => {
                debug!(document_id = %document_id, "processing worker invoked");
            }
            Err(err) => {
                warn!(document_id = %document_id, error = %err, "processor invocation failed");
                let failure = ProcessingError::new(ErrorCode::InvocationFailed, err.to_string());
                match state.db() {
                    Ok(mut conn) => {
                        if let Err(err) =
                            mark_document_error(&state, &mut conn, document_id, failure)
                        {
                            error!(
                                document_id = %document_id,
                                error = ?err,
                                "failed to record invocation failure"
                            );
                        }
                    }
                    Err(err) => {
                        error!(
                            document_id = %document_id,
                            error = ?err,
                            "failed to record invocation failure due to pool error"
                        );
                    }
                }
            }
        }
    });
}
