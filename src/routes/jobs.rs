use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::generation::{
    clear_job, create_job, delete_job, job_wire, list_jobs, load_job, load_tasks, run_job,
};
use crate::models::{BaseClass, GenerationJob};
use crate::schema::base_classes;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TaskInput {
    pub title: String,
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub base_class_id: Uuid,
    pub kind: String,
    pub tasks: Vec<TaskInput>,
}

#[derive(Deserialize)]
pub struct JobListQuery {
    pub base_class_id: Uuid,
    #[serde(default)]
    pub include_cleared: bool,
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateJobRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let kind = payload.kind.trim().to_string();
    if kind.is_empty() {
        return Err(AppError::bad_request("kind must not be empty"));
    }
    let titles: Vec<String> = payload
        .tasks
        .iter()
        .map(|task| task.title.trim().to_string())
        .collect();
    if titles.iter().any(String::is_empty) {
        return Err(AppError::bad_request("task titles must not be empty"));
    }

    let mut conn = state.db()?;
    ensure_class_scoped(&mut conn, payload.base_class_id, user.organisation_id)?;
    let (job, tasks) = create_job(
        &mut conn,
        payload.base_class_id,
        user.user_id,
        &kind,
        &titles,
    )?;

    Ok((StatusCode::CREATED, Json(job_wire(&job, &tasks))))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Value>>> {
    let mut conn = state.db()?;
    ensure_class_scoped(&mut conn, params.base_class_id, user.organisation_id)?;

    let jobs = list_jobs(&mut conn, params.base_class_id, params.include_cleared)?;
    let mut body = Vec::with_capacity(jobs.len());
    for job in &jobs {
        let tasks = load_tasks(&mut conn, job.id)?;
        body.push(job_wire(job, &tasks));
    }
    Ok(Json(body))
}

pub async fn get(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let job = find_job_scoped(&mut conn, job_id, user.organisation_id)?;
    let tasks = load_tasks(&mut conn, job.id)?;
    Ok(Json(job_wire(&job, &tasks)))
}

pub async fn run(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    {
        let mut conn = state.db()?;
        find_job_scoped(&mut conn, job_id, user.organisation_id)?;
    }

    let job = run_job(&state, job_id).await?;
    let mut conn = state.db()?;
    let tasks = load_tasks(&mut conn, job.id)?;
    Ok(Json(job_wire(&job, &tasks)))
}

pub async fn clear(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    find_job_scoped(&mut conn, job_id, user.organisation_id)?;
    let job = clear_job(&mut conn, job_id)?;
    let tasks = load_tasks(&mut conn, job.id)?;
    Ok(Json(job_wire(&job, &tasks)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;
    find_job_scoped(&mut conn, job_id, user.organisation_id)?;
    delete_job(&state, &mut conn, job_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn ensure_class_scoped(
    conn: &mut diesel::PgConnection,
    base_class_id: Uuid,
    organisation_id: Uuid,
) -> AppResult<()> {
    let class: Option<BaseClass> = base_classes::table
        .find(base_class_id)
        .filter(base_classes::organisation_id.eq(organisation_id))
        .first(conn)
        .optional()?;
    class.map(|_| ()).ok_or_else(AppError::not_found)
}

pub(crate) fn find_job_scoped(
    conn: &mut diesel::PgConnection,
    job_id: Uuid,
    organisation_id: Uuid,
) -> AppResult<GenerationJob> {
    let job = load_job(conn, job_id)?;
    ensure_class_scoped(conn, job.base_class_id, organisation_id)?;
    Ok(job)
}
