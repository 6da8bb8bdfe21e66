//! Hierarchical progress aggregation: monotonic per-item updates that
//! cascade lesson -> path -> course, recomputed pull-style from children so
//! duplicate or out-of-order events cannot corrupt the aggregates.

use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Lesson, NewProgressRecord, Path, ProgressRecord};
use crate::realtime::{ChangeEvent, ChangeType};
use crate::schema::{lessons, paths, progress};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Lesson,
    LessonSection,
    Assessment,
    Path,
    Course,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Lesson => "lesson",
            ItemType::LessonSection => "lesson_section",
            ItemType::Assessment => "assessment",
            ItemType::Path => "path",
            ItemType::Course => "course",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lesson" => Some(ItemType::Lesson),
            "lesson_section" => Some(ItemType::LessonSection),
            "assessment" => Some(ItemType::Assessment),
            "path" => Some(ItemType::Path),
            "course" => Some(ItemType::Course),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
    Passed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Passed => "passed",
            ProgressStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(ProgressStatus::NotStarted),
            "in_progress" => Some(ProgressStatus::InProgress),
            "completed" => Some(ProgressStatus::Completed),
            "passed" => Some(ProgressStatus::Passed),
            "failed" => Some(ProgressStatus::Failed),
            _ => None,
        }
    }

    /// Did the learner get through the item (as opposed to failing out).
    pub fn is_complete(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Passed)
    }
}

/// Total ordering over stored progress: terminal beats in-progress beats
/// untouched; among in-progress records the percentage breaks ties.
pub fn rank(status: ProgressStatus, percentage: i32) -> (u8, i32) {
    let status_rank = match status {
        ProgressStatus::NotStarted => 0,
        ProgressStatus::InProgress => 1,
        ProgressStatus::Completed | ProgressStatus::Passed | ProgressStatus::Failed => 2,
    };
    (status_rank, percentage.clamp(0, 100))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressUpdate {
    pub status: Option<ProgressStatus>,
    pub progress_percentage: Option<i32>,
    pub last_position: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLevel {
    Novice,
    Developing,
    Proficient,
    Advanced,
    Expert,
}

/// Fixed thresholds, inclusive lower bounds.
pub fn mastery(percentage: i32) -> MasteryLevel {
    match percentage {
        p if p >= 95 => MasteryLevel::Expert,
        p if p >= 85 => MasteryLevel::Advanced,
        p if p >= 70 => MasteryLevel::Proficient,
        p if p >= 50 => MasteryLevel::Developing,
        _ => MasteryLevel::Novice,
    }
}

/// Applies one update under the monotonic-rank rule and cascades lesson
/// completions upward. Lower-rank updates are acknowledged no-ops.
pub fn apply_update(
    state: &AppState,
    conn: &mut PgConnection,
    user_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
    update: ProgressUpdate,
) -> AppResult<ProgressRecord> {
    let (record, applied) = conn.transaction::<(ProgressRecord, bool), AppError, _>(|conn| {
        let existing = find_record(conn, user_id, item_type, item_id)?;

        let current_status = existing
            .as_ref()
            .and_then(|row| ProgressStatus::parse(&row.status))
            .unwrap_or(ProgressStatus::NotStarted);
        let current_percentage = existing.as_ref().map(|row| row.percentage).unwrap_or(0);

        let incoming_status = update.status.unwrap_or(if current_status
            == ProgressStatus::NotStarted
        {
            ProgressStatus::InProgress
        } else {
            current_status
        });
        let mut incoming_percentage = update
            .progress_percentage
            .unwrap_or(current_percentage)
            .clamp(0, 100);
        if incoming_status.is_complete() && update.progress_percentage.is_none() {
            incoming_percentage = 100;
        }

        if let Some(existing) = existing.as_ref() {
            if rank(incoming_status, incoming_percentage)
                < rank(current_status, current_percentage)
            {
                debug!(
                    user_id = %user_id,
                    item_type = item_type.as_str(),
                    item_id = %item_id,
                    "ignoring lower-rank progress update"
                );
                return Ok((existing.clone(), false));
            }
        }

        let stored = upsert_record(
            conn,
            user_id,
            item_type,
            item_id,
            incoming_status,
            incoming_percentage,
            update.last_position.clone(),
        )?;

        if item_type == ItemType::Lesson && incoming_status.is_complete() {
            cascade_from_lesson(conn, user_id, item_id)?;
        }

        Ok((stored, true))
    })?;

    // Acknowledged no-ops change nothing, so subscribers hear nothing.
    if applied {
        state.changes.publish(ChangeEvent::new(
            if record.created_at == record.updated_at {
                ChangeType::Insert
            } else {
                ChangeType::Update
            },
            "progress",
            user_id,
            record.id,
            Some(progress_wire(&record)),
            None,
        ));
    }

    Ok(record)
}

pub fn progress_wire(record: &ProgressRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "user_id": record.user_id,
        "item_type": record.item_type,
        "item_id": record.item_id,
        "status": record.status,
        "percentage": record.percentage,
        "last_position": record.last_position,
        "updated_at": record.updated_at.and_utc(),
    })
}

fn find_record(
    conn: &mut PgConnection,
    user_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
) -> AppResult<Option<ProgressRecord>> {
    let row = progress::table
        .filter(progress::user_id.eq(user_id))
        .filter(progress::item_type.eq(item_type.as_str()))
        .filter(progress::item_id.eq(item_id))
        .first::<ProgressRecord>(conn)
        .optional()?;
    Ok(row)
}

fn upsert_record(
    conn: &mut PgConnection,
    user_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
    status: ProgressStatus,
    percentage: i32,
    last_position: Option<String>,
) -> AppResult<ProgressRecord> {
    let now = Utc::now().naive_utc();
    if let Some(existing) = find_record(conn, user_id, item_type, item_id)? {
        // Keep the stored resume token unless the update carries one.
        let position = last_position.or(existing.last_position.clone());
        diesel::update(progress::table.find(existing.id))
            .set((
                progress::status.eq(status.as_str()),
                progress::percentage.eq(percentage),
                progress::last_position.eq(position),
                progress::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(progress::table.find(existing.id).first(conn)?)
    } else {
        let new_row = NewProgressRecord {
            id: Uuid::new_v4(),
            user_id,
            item_type: item_type.as_str().to_string(),
            item_id,
            status: status.as_str().to_string(),
            percentage,
            last_position,
        };
        diesel::insert_into(progress::table)
            .values(&new_row)
            .execute(conn)?;
        Ok(progress::table.find(new_row.id).first(conn)?)
    }
}

/// Recomputes the owning path from its lessons; a path reaching 100%
/// recomputes the owning course from its paths. Pull-style on purpose:
/// counting children at query time tolerates duplicate and out-of-order
/// completion events.
fn cascade_from_lesson(conn: &mut PgConnection, user_id: Uuid, lesson_id: Uuid) -> AppResult<()> {
    let lesson: Lesson = lessons::table.find(lesson_id).first(conn)?;
    let path_percentage = recompute_path(conn, user_id, lesson.path_id)?;

    if path_percentage >= 100 {
        let path: Path = paths::table.find(lesson.path_id).first(conn)?;
        recompute_course(conn, user_id, path.base_class_id)?;
    }
    Ok(())
}

pub fn recompute_path(conn: &mut PgConnection, user_id: Uuid, path_id: Uuid) -> AppResult<i32> {
    let lesson_ids: Vec<Uuid> = lessons::table
        .filter(lessons::path_id.eq(path_id))
        .select(lessons::id)
        .load(conn)?;

    if lesson_ids.is_empty() {
        return Ok(0);
    }

    let completed = completed_count(conn, user_id, ItemType::Lesson, &lesson_ids)?;
    let percentage = ((completed as f64 / lesson_ids.len() as f64) * 100.0).round() as i32;
    let status = if percentage >= 100 {
        ProgressStatus::Completed
    } else {
        ProgressStatus::InProgress
    };
    apply_monotonic(conn, user_id, ItemType::Path, path_id, status, percentage)?;
    Ok(percentage)
}

pub fn recompute_course(
    conn: &mut PgConnection,
    user_id: Uuid,
    base_class_id: Uuid,
) -> AppResult<i32> {
    let path_ids: Vec<Uuid> = paths::table
        .filter(paths::base_class_id.eq(base_class_id))
        .select(paths::id)
        .load(conn)?;

    if path_ids.is_empty() {
        return Ok(0);
    }

    let completed = completed_count(conn, user_id, ItemType::Path, &path_ids)?;
    let percentage = ((completed as f64 / path_ids.len() as f64) * 100.0).round() as i32;
    let status = if percentage >= 100 {
        ProgressStatus::Completed
    } else {
        ProgressStatus::InProgress
    };
    apply_monotonic(conn, user_id, ItemType::Course, base_class_id, status, percentage)?;
    Ok(percentage)
}

fn completed_count(
    conn: &mut PgConnection,
    user_id: Uuid,
    item_type: ItemType,
    item_ids: &[Uuid],
) -> AppResult<i64> {
    let count = progress::table
        .filter(progress::user_id.eq(user_id))
        .filter(progress::item_type.eq(item_type.as_str()))
        .filter(progress::item_id.eq_any(item_ids))
        .filter(progress::status.eq_any(["completed", "passed"]))
        .count()
        .get_result(conn)?;
    Ok(count)
}

fn apply_monotonic(
    conn: &mut PgConnection,
    user_id: Uuid,
    item_type: ItemType,
    item_id: Uuid,
    status: ProgressStatus,
    percentage: i32,
) -> AppResult<()> {
    if let Some(existing) = find_record(conn, user_id, item_type, item_id)? {
        let existing_status =
            ProgressStatus::parse(&existing.status).unwrap_or(ProgressStatus::NotStarted);
        if rank(status, percentage) < rank(existing_status, existing.percentage) {
            return Ok(());
        }
    }
    upsert_record(conn, user_id, item_type, item_id, status, percentage, None)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CoursePosition {
    pub path_id: Uuid,
    pub path_title: String,
    pub lesson_id: Uuid,
    pub lesson_title: String,
    pub last_position: Option<String>,
    pub all_completed: bool,
}

/// Resume point: the first lesson in (path order, lesson order) the user has
/// not completed. A fully-completed course resolves to its last lesson.
pub fn current_position(
    conn: &mut PgConnection,
    user_id: Uuid,
    base_class_id: Uuid,
) -> AppResult<Option<CoursePosition>> {
    let ordered: Vec<(Path, Lesson)> = paths::table
        .inner_join(lessons::table)
        .filter(paths::base_class_id.eq(base_class_id))
        .order((paths::position.asc(), lessons::position.asc()))
        .load(conn)?;

    if ordered.is_empty() {
        return Ok(None);
    }

    let lesson_ids: Vec<Uuid> = ordered.iter().map(|(_, lesson)| lesson.id).collect();
    let records: Vec<ProgressRecord> = progress::table
        .filter(progress::user_id.eq(user_id))
        .filter(progress::item_type.eq(ItemType::Lesson.as_str()))
        .filter(progress::item_id.eq_any(&lesson_ids))
        .load(conn)?;

    let position_of = |lesson_id: Uuid| -> Option<&ProgressRecord> {
        records.iter().find(|row| row.item_id == lesson_id)
    };

    for (path, lesson) in &ordered {
        let complete = position_of(lesson.id)
            .and_then(|row| ProgressStatus::parse(&row.status))
            .map(|status| status.is_complete())
            .unwrap_or(false);
        if !complete {
            return Ok(Some(CoursePosition {
                path_id: path.id,
                path_title: path.title.clone(),
                lesson_id: lesson.id,
                lesson_title: lesson.title.clone(),
                last_position: position_of(lesson.id).and_then(|row| row.last_position.clone()),
                all_completed: false,
            }));
        }
    }

    let Some((path, lesson)) = ordered.last() else {
        return Ok(None);
    };
    Ok(Some(CoursePosition {
        path_id: path.id,
        path_title: path.title.clone(),
        lesson_id: lesson.id,
        lesson_title: lesson.title.clone(),
        last_position: position_of(lesson.id).and_then(|row| row.last_position.clone()),
        all_completed: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_status_before_percentage() {
        assert!(rank(ProgressStatus::NotStarted, 0) < rank(ProgressStatus::InProgress, 0));
        assert!(rank(ProgressStatus::InProgress, 10) < rank(ProgressStatus::InProgress, 60));
        assert!(rank(ProgressStatus::InProgress, 99) < rank(ProgressStatus::Completed, 0));
        assert!(rank(ProgressStatus::Completed, 100) > rank(ProgressStatus::InProgress, 100));
    }

    #[test]
    fn terminal_statuses_share_a_rank_tier() {
        assert_eq!(
            rank(ProgressStatus::Completed, 100).0,
            rank(ProgressStatus::Failed, 100).0
        );
        assert_eq!(
            rank(ProgressStatus::Passed, 100),
            rank(ProgressStatus::Completed, 100)
        );
    }

    #[test]
    fn rank_clamps_percentage() {
        assert_eq!(rank(ProgressStatus::InProgress, 150).1, 100);
        assert_eq!(rank(ProgressStatus::InProgress, -5).1, 0);
    }

    #[test]
    fn mastery_thresholds_are_inclusive() {
        assert_eq!(mastery(100), MasteryLevel::Expert);
        assert_eq!(mastery(95), MasteryLevel::Expert);
        assert_eq!(mastery(94), MasteryLevel::Advanced);
        assert_eq!(mastery(85), MasteryLevel::Advanced);
        assert_eq!(mastery(84), MasteryLevel::Proficient);
        assert_eq!(mastery(70), MasteryLevel::Proficient);
        assert_eq!(mastery(69), MasteryLevel::Developing);
        assert_eq!(mastery(50), MasteryLevel::Developing);
        assert_eq!(mastery(49), MasteryLevel::Novice);
        assert_eq!(mastery(0), MasteryLevel::Novice);
    }

    #[test]
    fn item_type_round_trips() {
        for ty in [
            ItemType::Lesson,
            ItemType::LessonSection,
            ItemType::Assessment,
            ItemType::Path,
            ItemType::Course,
        ] {
            assert_eq!(ItemType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ItemType::parse("module"), None);
    }
}
