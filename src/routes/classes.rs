use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{BaseClass, Lesson, NewBaseClass, NewLesson, NewPath, Path as CoursePath};
use crate::schema::{base_classes, lessons, paths};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateClassRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct CreatePathRequest {
    pub title: String,
    pub position: i32,
}

#[derive(Deserialize)]
pub struct CreateLessonRequest {
    pub title: String,
    pub position: i32,
}

pub async fn create_class(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateClassRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }

    let mut conn = state.db()?;
    let new_class = NewBaseClass {
        id: Uuid::new_v4(),
        organisation_id: user.organisation_id,
        title,
    };
    diesel::insert_into(base_classes::table)
        .values(&new_class)
        .execute(&mut conn)?;
    let class: BaseClass = base_classes::table.find(new_class.id).first(&mut conn)?;

    Ok((StatusCode::CREATED, Json(class_wire(&class))))
}

pub async fn create_path(
    State(state): State<AppState>,
    Path(base_class_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<CreatePathRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }

    let mut conn = state.db()?;
    find_class_scoped(&mut conn, base_class_id, user.organisation_id)?;

    let new_path = NewPath {
        id: Uuid::new_v4(),
        base_class_id,
        title,
        position: payload.position,
    };
    diesel::insert_into(paths::table)
        .values(&new_path)
        .execute(&mut conn)?;
    let path: CoursePath = paths::table.find(new_path.id).first(&mut conn)?;

    Ok((StatusCode::CREATED, Json(path_wire(&path))))
}

pub async fn create_lesson(
    State(state): State<AppState>,
    Path(path_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateLessonRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }

    let mut conn = state.db()?;

    // Resolve the owning class through the path to enforce organisation scope.
    let path: Option<CoursePath> = paths::table.find(path_id).first(&mut conn).optional()?;
    let path = path.ok_or_else(AppError::not_found)?;
    find_class_scoped(&mut conn, path.base_class_id, user.organisation_id)?;

    let new_lesson = NewLesson {
        id: Uuid::new_v4(),
        path_id,
        title,
        position: payload.position,
    };
    diesel::insert_into(lessons::table)
        .values(&new_lesson)
        .execute(&mut conn)?;
    let lesson: Lesson = lessons::table.find(new_lesson.id).first(&mut conn)?;

    Ok((StatusCode::CREATED, Json(lesson_wire(&lesson))))
}

/// Ordered tree: paths by position, lessons by position within each path.
pub async fn get_class(
    State(state): State<AppState>,
    Path(base_class_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let class = find_class_scoped(&mut conn, base_class_id, user.organisation_id)?;

    let class_paths: Vec<CoursePath> = paths::table
        .filter(paths::base_class_id.eq(base_class_id))
        .order(paths::position.asc())
        .load(&mut conn)?;
    let class_lessons: Vec<Lesson> = Lesson::belonging_to(&class_paths)
        .order(lessons::position.asc())
        .load(&mut conn)?;
    let grouped = class_lessons.grouped_by(&class_paths);

    let tree: Vec<Value> = class_paths
        .iter()
        .zip(grouped)
        .map(|(path, lessons)| {
            let mut value = path_wire(path);
            if let Some(map) = value.as_object_mut() {
                map.insert(
                    "lessons".to_string(),
                    Value::Array(lessons.iter().map(lesson_wire).collect()),
                );
            }
            value
        })
        .collect();

    let mut body = class_wire(&class);
    if let Some(map) = body.as_object_mut() {
        map.insert("paths".to_string(), Value::Array(tree));
    }
    Ok(Json(body))
}

fn find_class_scoped(
    conn: &mut diesel::PgConnection,
    base_class_id: Uuid,
    organisation_id: Uuid,
) -> AppResult<BaseClass> {
    let class: Option<BaseClass> = base_classes::table
        .find(base_class_id)
        .filter(base_classes::organisation_id.eq(organisation_id))
        .first(conn)
        .optional()?;
    class.ok_or_else(AppError::not_found)
}

fn class_wire(class: &BaseClass) -> Value {
    json!({
        "id": class.id,
        "organisation_id": class.organisation_id,
        "title": class.title,
        "created_at": class.created_at.and_utc(),
    })
}

fn path_wire(path: &CoursePath) -> Value {
    json!({
        "id": path.id,
        "base_class_id": path.base_class_id,
        "title": path.title,
        "position": path.position,
    })
}

fn lesson_wire(lesson: &Lesson) -> Value {
    json!({
        "id": lesson.id,
        "path_id": lesson.path_id,
        "title": lesson.title,
        "position": lesson.position,
    })
}
