use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::classify::is_retryable;
use crate::error::{AppError, AppResult};
use crate::models::{Document, NewDocument};
use crate::pipeline::{
    bucket_for_organisation, check_transition, storage_key, DocumentMetadata, DocumentStatus,
    ProcessingError, ProcessingProgress,
};
use crate::processor::{
    dispatch_processing, document_wire, mark_document_error, publish_document_change,
};
use crate::realtime::ChangeType;
use crate::schema::documents;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub base_class_id: Option<Uuid>,
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub document_id: Uuid,
    pub status: &'static str,
}

#[derive(Deserialize)]
pub struct StatusCallbackRequest {
    pub status: String,
    pub processing_progress: Option<ProcessingProgress>,
    pub processing_error: Option<ProcessingError>,
}

#[derive(Deserialize)]
pub struct RetryRequest {
    pub document_ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct RetryError {
    pub document_id: Uuid,
    pub error: String,
}

#[derive(Serialize)]
pub struct RetryResponse {
    pub success: bool,
    pub retried_count: usize,
    pub errors: Vec<RetryError>,
}

struct UploadRequest {
    bytes: Vec<u8>,
    original_name: String,
    content_type: Option<String>,
    base_class_id: Option<Uuid>,
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut base_class_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                original_name = field.file_name().map(|n| n.to_string());
                content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some("base_class_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid base_class_id: {err}")))?;
                if !value.trim().is_empty() {
                    base_class_id = Some(
                        Uuid::parse_str(value.trim())
                            .map_err(|_| AppError::bad_request("base_class_id must be a valid UUID"))?,
                    );
                }
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| {
        error!("upload rejected: missing file field");
        AppError::bad_request("file field is required")
    })?;
    if file_bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    if file_bytes.len() as i64 > state.config.max_upload_bytes {
        return Err(AppError::bad_request(format!(
            "file exceeds maximum size of {} bytes",
            state.config.max_upload_bytes
        )));
    }
    let original_name =
        original_name.ok_or_else(|| AppError::bad_request("filename is required"))?;

    // Multipart clients often omit the part content type; fall back to the
    // filename before enforcing the allow-list.
    let content_type = content_type.or_else(|| {
        mime_guess::from_path(&original_name)
            .first()
            .map(|mime| mime.essence_str().to_string())
    });
    let normalized = content_type
        .as_deref()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| AppError::bad_request("content type could not be determined"))?;
    if !state
        .config
        .allowed_content_types
        .iter()
        .any(|allowed| *allowed == normalized)
    {
        return Err(AppError::bad_request(format!(
            "content type {normalized} is not allowed"
        )));
    }
    let content_type = Some(normalized);

    let request = UploadRequest {
        bytes: file_bytes,
        original_name,
        content_type,
        base_class_id,
    };
    let document = process_upload(&state, request, &user).await?;

    info!(
        document_id = %document.id,
        organisation_id = %document.organisation_id,
        original_name = %document.original_name,
        "document accepted for processing"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            document_id: document.id,
            status: "queued",
        }),
    ))
}

/// The row lands first with `status=queued`, then bytes go to storage, then
/// the processor is triggered. A crash between steps leaves a queued row the
/// retry endpoint can pick up, never an orphan blob.
async fn process_upload(
    state: &AppState,
    request: UploadRequest,
    user: &AuthenticatedUser,
) -> AppResult<Document> {
    let UploadRequest {
        bytes,
        original_name,
        content_type,
        base_class_id,
    } = request;

    let now = Utc::now().naive_utc();
    let bucket = bucket_for_organisation(&state.config.bucket_prefix, user.organisation_id);
    let key = storage_key(user.user_id, now, &original_name);
    let checksum = hex::encode(Sha256::digest(&bytes));

    let new_document = NewDocument {
        id: Uuid::new_v4(),
        organisation_id: user.organisation_id,
        base_class_id,
        uploaded_by: user.user_id,
        storage_bucket: bucket.clone(),
        storage_key: key.clone(),
        original_name,
        content_type: content_type.clone(),
        size_bytes: bytes.len() as i64,
        checksum,
        status: DocumentStatus::Queued.as_str().to_string(),
        metadata: DocumentMetadata::default().to_value(),
    };

    let document: Document = {
        let mut conn = state.db()?;
        diesel::insert_into(documents::table)
            .values(&new_document)
            .execute(&mut conn)?;
        documents::table.find(new_document.id).first(&mut conn)?
    };

    if let Err(err) = store_with_bucket_retry(state, &bucket, &key, bytes, content_type).await {
        error!(document_id = %document.id, error = %err, "failed to store document bytes");
        let mut conn = state.db()?;
        mark_document_error(
            state,
            &mut conn,
            document.id,
            ProcessingError::new(crate::pipeline::ErrorCode::Network, err.to_string()),
        )?;
        return Err(AppError::internal(format!("failed to store document: {err}")));
    }

    publish_document_change(state, ChangeType::Insert, None, Some(&document));
    dispatch_processing(state.clone(), document.id);

    Ok(document)
}

/// First put may race bucket provisioning; create the bucket and retry once.
async fn store_with_bucket_retry(
    state: &AppState,
    bucket: &str,
    key: &str,
    bytes: Vec<u8>,
    content_type: Option<String>,
) -> anyhow::Result<()> {
    state.storage.ensure_bucket(bucket).await?;
    match state
        .storage
        .put_object(bucket, key, bytes.clone(), content_type.clone())
        .await
    {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(bucket = %bucket, error = %err, "put failed, recreating bucket and retrying");
            state.storage.ensure_bucket(bucket).await?;
            state.storage.put_object(bucket, key, bytes, content_type).await
        }
    }
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<DocumentListQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Value>>> {
    let mut conn = state.db()?;

    let mut query = documents::table
        .filter(documents::organisation_id.eq(user.organisation_id))
        .order(documents::created_at.desc())
        .into_boxed();
    if let Some(base_class_id) = params.base_class_id {
        query = query.filter(documents::base_class_id.eq(base_class_id));
    }
    if let Some(ref status) = params.status {
        DocumentStatus::parse(status)
            .ok_or_else(|| AppError::bad_request(format!("unknown status filter {status}")))?;
        query = query.filter(documents::status.eq(status));
    }

    let docs: Vec<Document> = query.load(&mut conn)?;
    Ok(Json(docs.iter().map(document_wire).collect()))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let document = find_scoped(&mut conn, document_id, user.organisation_id)?;
    Ok(Json(document_wire(&document)))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let document = {
        let mut conn = state.db()?;
        find_scoped(&mut conn, document_id, user.organisation_id)?
    };

    let bytes = state
        .storage
        .get_object(&document.storage_bucket, &document.storage_key)
        .await
        .map_err(|err| {
            error!(
                document_id = %document_id,
                bucket = %document.storage_bucket,
                key = %document.storage_key,
                error = %err,
                "failed to fetch document bytes"
            );
            AppError::internal(format!("failed to fetch document: {err}"))
        })?;

    let content_type = document
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let disposition = format!("attachment; filename=\"{}\"", document.original_name);

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// Row removal is authoritative; a failing storage delete is logged and
/// tolerated so a flaky object store cannot wedge document management.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let document = {
        let mut conn = state.db()?;
        let document = find_scoped(&mut conn, document_id, user.organisation_id)?;
        diesel::delete(documents::table.find(document_id)).execute(&mut conn)?;
        document
    };

    if let Err(err) = state
        .storage
        .delete_object(&document.storage_bucket, &document.storage_key)
        .await
    {
        warn!(
            document_id = %document_id,
            bucket = %document.storage_bucket,
            key = %document.storage_key,
            error = %err,
            "storage delete failed; row already removed"
        );
    }

    publish_document_change(&state, ChangeType::Delete, Some(&document), None);
    Ok(StatusCode::NO_CONTENT)
}

/// Worker callback. Transitions are forward-only; an out-of-order or
/// duplicate callback gets a 409 and changes nothing.
pub async fn update_status(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<StatusCallbackRequest>,
) -> AppResult<Json<Value>> {
    let next = DocumentStatus::parse(&payload.status)
        .ok_or_else(|| AppError::bad_request(format!("unknown status {}", payload.status)))?;

    let mut conn = state.db()?;
    let document = find_scoped(&mut conn, document_id, user.organisation_id)?;
    let current = DocumentStatus::parse(&document.status)
        .ok_or_else(|| AppError::internal(format!("unknown document status {}", document.status)))?;

    check_transition(current, next).map_err(|err| AppError::conflict(err.to_string()))?;

    let mut metadata = DocumentMetadata::from_value(&document.metadata);
    if let Some(progress) = payload.processing_progress {
        metadata.processing_progress = Some(progress);
    }
    if let Some(failure) = payload.processing_error {
        metadata.processing_error = Some(failure);
    }

    diesel::update(documents::table.find(document_id))
        .set((
            documents::status.eq(next.as_str()),
            documents::metadata.eq(metadata.to_value()),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let updated: Document = documents::table.find(document_id).first(&mut conn)?;
    publish_document_change(&state, ChangeType::Update, Some(&document), Some(&updated));

    Ok(Json(document_wire(&updated)))
}

/// Batch retry with per-id accounting. One bad id never aborts the rest.
pub async fn retry_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<RetryRequest>,
) -> AppResult<Json<RetryResponse>> {
    if payload.document_ids.is_empty() {
        return Err(AppError::bad_request("document_ids must not be empty"));
    }

    let mut retried = Vec::new();
    let mut errors = Vec::new();

    for document_id in payload.document_ids {
        match reset_for_retry(&state, document_id, user.organisation_id) {
            Ok(()) => retried.push(document_id),
            Err(err) => {
                warn!(document_id = %document_id, error = %err, "retry failed");
                errors.push(RetryError {
                    document_id,
                    error: err.to_string(),
                });
            }
        }
    }

    for document_id in &retried {
        dispatch_processing(state.clone(), *document_id);
    }

    info!(
        retried = retried.len(),
        failed = errors.len(),
        "document retry batch finished"
    );

    Ok(Json(RetryResponse {
        success: errors.is_empty(),
        retried_count: retried.len(),
        errors,
    }))
}

fn reset_for_retry(
    state: &AppState,
    document_id: Uuid,
    organisation_id: Uuid,
) -> anyhow::Result<()> {
    let mut conn = state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;

    let document: Document = documents::table
        .find(document_id)
        .filter(documents::organisation_id.eq(organisation_id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| anyhow::anyhow!("document not found"))?;

    if document.status != DocumentStatus::Error.as_str() {
        anyhow::bail!("document is not in error state (status: {})", document.status);
    }

    let mut metadata = DocumentMetadata::from_value(&document.metadata);
    if !is_retryable(&metadata) {
        anyhow::bail!("document failure is not retryable");
    }
    metadata.retry_count += 1;
    metadata.retry_attempted_at = Some(Utc::now());

    diesel::update(documents::table.find(document_id))
        .set((
            documents::status.eq(DocumentStatus::Queued.as_str()),
            documents::metadata.eq(metadata.to_value()),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let updated: Document = documents::table.find(document_id).first(&mut conn)?;
    publish_document_change(state, ChangeType::Update, Some(&document), Some(&updated));
    Ok(())
}

fn find_scoped(
    conn: &mut PgConnection,
    document_id: Uuid,
    organisation_id: Uuid,
) -> AppResult<Document> {
    let document: Option<Document> = documents::table
        .find(document_id)
        .filter(documents::organisation_id.eq(organisation_id))
        .first(conn)
        .optional()?;
    document.ok_or_else(AppError::not_found)
}
