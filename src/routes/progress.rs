use axum::extract::{Json, Path, State};
use diesel::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::BaseClass;
use crate::progress::{
    apply_update, current_position, mastery, progress_wire, ItemType, ProgressUpdate,
};
use crate::schema::base_classes;
use crate::state::AppState;

pub async fn record_progress(
    State(state): State<AppState>,
    Path((item_type, item_id)): Path<(String, Uuid)>,
    user: AuthenticatedUser,
    Json(payload): Json<ProgressUpdate>,
) -> AppResult<Json<Value>> {
    let item_type = ItemType::parse(&item_type)
        .ok_or_else(|| AppError::bad_request(format!("unknown item type {item_type}")))?;

    if let Some(percentage) = payload.progress_percentage {
        if !(0..=100).contains(&percentage) {
            return Err(AppError::bad_request(
                "progress_percentage must be between 0 and 100",
            ));
        }
    }

    let mut conn = state.db()?;
    let record = apply_update(&state, &mut conn, user.user_id, item_type, item_id, payload)?;

    let mut body = progress_wire(&record);
    if let Some(map) = body.as_object_mut() {
        map.insert("mastery".to_string(), json!(mastery(record.percentage)));
    }
    Ok(Json(body))
}

pub async fn course_position(
    State(state): State<AppState>,
    Path(base_class_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;

    let course: Option<BaseClass> = base_classes::table
        .find(base_class_id)
        .filter(base_classes::organisation_id.eq(user.organisation_id))
        .first(&mut conn)
        .optional()?;
    let course = course.ok_or_else(AppError::not_found)?;

    let position = current_position(&mut conn, user.user_id, course.id)?;
    match position {
        Some(position) => Ok(Json(serde_json::to_value(position)?)),
        None => Ok(Json(json!({ "course_id": course.id, "empty": true }))),
    }
}
