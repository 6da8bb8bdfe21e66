//! Generation jobs: a job owns an ordered set of tasks, each producing one
//! piece of course content through the external generator. Jobs carry no
//! stored percentage; it is always derived from task counts, so a crashed
//! writer can never leave a stale number behind.

use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{GenerationJob, GenerationTask, NewGenerationJob, NewGenerationTask};
use crate::realtime::{ChangeEvent, ChangeType};
use crate::schema::{generation_jobs, generation_tasks};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(value: &str) -> bool {
        matches!(value, "completed" | "failed")
    }
}

/// Share of tasks that have settled, rounded to whole percent. An empty
/// task list reads as 0, never a division error.
pub fn job_percentage(tasks: &[GenerationTask]) -> i32 {
    if tasks.is_empty() {
        return 0;
    }
    let settled = tasks
        .iter()
        .filter(|task| TaskStatus::is_terminal(&task.status))
        .count();
    ((settled as f64 / tasks.len() as f64) * 100.0).round() as i32
}

pub fn job_wire(job: &GenerationJob, tasks: &[GenerationTask]) -> serde_json::Value {
    json!({
        "id": job.id,
        "base_class_id": job.base_class_id,
        "kind": job.kind,
        "status": job.status,
        "is_cleared": job.is_cleared,
        "last_error": job.last_error,
        "percentage": job_percentage(tasks),
        "task_count": tasks.len(),
        "created_at": job.created_at.and_utc(),
        "updated_at": job.updated_at.and_utc(),
        "tasks": tasks.iter().map(task_wire).collect::<Vec<_>>(),
    })
}

pub fn task_wire(task: &GenerationTask) -> serde_json::Value {
    json!({
        "id": task.id,
        "job_id": task.job_id,
        "position": task.position,
        "title": task.title,
        "status": task.status,
        "output": task.output,
        "last_error": task.last_error,
        "updated_at": task.updated_at.and_utc(),
    })
}

/// Creates a job and its tasks in one transaction so a job is never visible
/// without the tasks that define its percentage.
pub fn create_job(
    conn: &mut PgConnection,
    base_class_id: Uuid,
    created_by: Uuid,
    kind: &str,
    titles: &[String],
) -> AppResult<(GenerationJob, Vec<GenerationTask>)> {
    if titles.is_empty() {
        return Err(AppError::bad_request("a generation job needs at least one task"));
    }

    conn.transaction::<(GenerationJob, Vec<GenerationTask>), AppError, _>(|conn| {
        let new_job = NewGenerationJob {
            id: Uuid::new_v4(),
            base_class_id,
            created_by,
            kind: kind.to_string(),
            status: JobStatus::Pending.as_str().to_string(),
        };
        diesel::insert_into(generation_jobs::table)
            .values(&new_job)
            .execute(conn)?;

        let new_tasks: Vec<NewGenerationTask> = titles
            .iter()
            .enumerate()
            .map(|(position, title)| NewGenerationTask {
                id: Uuid::new_v4(),
                job_id: new_job.id,
                position: position as i32,
                title: title.clone(),
                status: TaskStatus::Pending.as_str().to_string(),
            })
            .collect();
        diesel::insert_into(generation_tasks::table)
            .values(&new_tasks)
            .execute(conn)?;

        let job: GenerationJob = generation_jobs::table.find(new_job.id).first(conn)?;
        let tasks = load_tasks(conn, job.id)?;
        Ok((job, tasks))
    })
}

pub fn load_job(conn: &mut PgConnection, job_id: Uuid) -> AppResult<GenerationJob> {
    Ok(generation_jobs::table.find(job_id).first(conn)?)
}

pub fn load_tasks(conn: &mut PgConnection, job_id: Uuid) -> AppResult<Vec<GenerationTask>> {
    Ok(generation_tasks::table
        .filter(generation_tasks::job_id.eq(job_id))
        .order(generation_tasks::position.asc())
        .load(conn)?)
}

pub fn list_jobs(
    conn: &mut PgConnection,
    base_class_id: Uuid,
    include_cleared: bool,
) -> AppResult<Vec<GenerationJob>> {
    let mut query = generation_jobs::table
        .filter(generation_jobs::base_class_id.eq(base_class_id))
        .order(generation_jobs::created_at.desc())
        .into_boxed();
    if !include_cleared {
        query = query.filter(generation_jobs::is_cleared.eq(false));
    }
    Ok(query.load(conn)?)
}

/// Runs every pending task of a job concurrently. One task failing never
/// aborts its siblings, but any failure leaves the job `failed` with
/// `last_error` summarising how many tasks went wrong. The flip to
/// `processing` is a conditional update, so concurrent runs collapse to one.
pub async fn run_job(state: &AppState, job_id: Uuid) -> AppResult<GenerationJob> {
    let (kind, tasks) = {
        let mut conn = state.db()?;
        let before = load_job(&mut conn, job_id)?;

        let flipped = diesel::update(
            generation_jobs::table
                .find(job_id)
                .filter(generation_jobs::status.ne(JobStatus::Processing.as_str())),
        )
        .set((
            generation_jobs::status.eq(JobStatus::Processing.as_str()),
            generation_jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
        if flipped == 0 {
            return Err(AppError::conflict("job is already running"));
        }

        let job = load_job(&mut conn, job_id)?;
        let tasks = load_tasks(&mut conn, job_id)?;
        state.changes.publish(ChangeEvent::new(
            ChangeType::Update,
            "generation_jobs",
            job_id,
            job_id,
            Some(job_wire(&job, &tasks)),
            Some(job_wire(&before, &tasks)),
        ));
        (job.kind, tasks)
    };

    let pending: Vec<&GenerationTask> = tasks
        .iter()
        .filter(|task| !TaskStatus::is_terminal(&task.status))
        .collect();

    let futures = pending.iter().map(|task| {
        let generator = state.generator.clone();
        let kind = kind.clone();
        let title = task.title.clone();
        let task_id = task.id;
        async move {
            let outcome = generator.generate(&kind, &title).await;
            (task_id, outcome)
        }
    });
    let outcomes = join_all(futures).await;

    let mut conn = state.db()?;
    let mut failures = 0usize;
    for (task_id, outcome) in outcomes {
        match outcome {
            Ok(output) => {
                finish_task(state, &mut conn, job_id, task_id, TaskStatus::Completed, Some(output), None)?;
            }
            Err(err) => {
                failures += 1;
                warn!(job_id = %job_id, task_id = %task_id, error = %err, "generation task failed");
                finish_task(
                    state,
                    &mut conn,
                    job_id,
                    task_id,
                    TaskStatus::Failed,
                    None,
                    Some(err.to_string()),
                )?;
            }
        }
    }

    let job = load_job(&mut conn, job_id)?;
    let settled = load_tasks(&mut conn, job_id)?;
    let succeeded = settled
        .iter()
        .filter(|task| task.status == TaskStatus::Completed.as_str())
        .count();

    let (final_status, last_error) = if failures > 0 {
        (
            JobStatus::Failed,
            Some(format!("{failures} of {} tasks failed", settled.len())),
        )
    } else {
        (JobStatus::Completed, None)
    };

    let job = set_job_status(state, &mut conn, &job, final_status, last_error)?;
    info!(
        job_id = %job_id,
        status = job.status,
        succeeded,
        failed = failures,
        "generation job finished"
    );
    Ok(job)
}

fn set_job_status(
    state: &AppState,
    conn: &mut PgConnection,
    job: &GenerationJob,
    status: JobStatus,
    last_error: Option<String>,
) -> AppResult<GenerationJob> {
    diesel::update(generation_jobs::table.find(job.id))
        .set((
            generation_jobs::status.eq(status.as_str()),
            generation_jobs::last_error.eq(last_error),
            generation_jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    let updated: GenerationJob = generation_jobs::table.find(job.id).first(conn)?;
    let tasks = load_tasks(conn, job.id)?;
    state.changes.publish(ChangeEvent::new(
        ChangeType::Update,
        "generation_jobs",
        updated.id,
        updated.id,
        Some(job_wire(&updated, &tasks)),
        Some(job_wire(job, &tasks)),
    ));
    Ok(updated)
}

fn finish_task(
    state: &AppState,
    conn: &mut PgConnection,
    job_id: Uuid,
    task_id: Uuid,
    status: TaskStatus,
    output: Option<String>,
    last_error: Option<String>,
) -> AppResult<()> {
    diesel::update(generation_tasks::table.find(task_id))
        .set((
            generation_tasks::status.eq(status.as_str()),
            generation_tasks::output.eq(output),
            generation_tasks::last_error.eq(last_error),
            generation_tasks::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    let task: GenerationTask = generation_tasks::table.find(task_id).first(conn)?;
    state.changes.publish(ChangeEvent::new(
        ChangeType::Update,
        "generation_tasks",
        job_id,
        task_id,
        Some(task_wire(&task)),
        None,
    ));
    Ok(())
}

/// Soft-hide: the job stays queryable (and auditable) but drops out of the
/// default listing. Running jobs cannot be cleared out from under their
/// writer.
pub fn clear_job(conn: &mut PgConnection, job_id: Uuid) -> AppResult<GenerationJob> {
    let job = load_job(conn, job_id)?;
    if job.status == JobStatus::Processing.as_str() {
        return Err(AppError::conflict("cannot clear a running job"));
    }
    diesel::update(generation_jobs::table.find(job_id))
        .set((
            generation_jobs::is_cleared.eq(true),
            generation_jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(load_job(conn, job_id)?)
}

/// Hard delete: tasks first, then the job, in one transaction. There is no
/// FK cascade in the schema, so the ordering here is the integrity guarantee.
pub fn delete_job(state: &AppState, conn: &mut PgConnection, job_id: Uuid) -> AppResult<()> {
    let job = load_job(conn, job_id)?;
    if job.status == JobStatus::Processing.as_str() {
        return Err(AppError::conflict("cannot delete a running job"));
    }

    conn.transaction::<(), AppError, _>(|conn| {
        diesel::delete(generation_tasks::table.filter(generation_tasks::job_id.eq(job_id)))
            .execute(conn)?;
        diesel::delete(generation_jobs::table.find(job_id)).execute(conn)?;
        Ok(())
    })?;

    state.changes.publish(ChangeEvent::new(
        ChangeType::Delete,
        "generation_jobs",
        job_id,
        job_id,
        None,
        Some(job_wire(&job, &[])),
    ));
    Ok(())
}
