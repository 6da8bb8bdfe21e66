use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = organisations)]
pub struct Organisation {
    pub id: Uuid,
    pub name: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = organisations)]
pub struct NewOrganisation {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = users)]
#[diesel(belongs_to(Organisation, foreign_key = organisation_id))]
pub struct User {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = base_classes)]
#[diesel(belongs_to(Organisation, foreign_key = organisation_id))]
pub struct BaseClass {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub title: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = base_classes)]
pub struct NewBaseClass {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub title: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = paths)]
#[diesel(belongs_to(BaseClass, foreign_key = base_class_id))]
pub struct Path {
    pub id: Uuid,
    pub base_class_id: Uuid,
    pub title: String,
    pub position: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = paths)]
pub struct NewPath {
    pub id: Uuid,
    pub base_class_id: Uuid,
    pub title: String,
    pub position: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = lessons)]
#[diesel(belongs_to(Path, foreign_key = path_id))]
pub struct Lesson {
    pub id: Uuid,
    pub path_id: Uuid,
    pub title: String,
    pub position: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = lessons)]
pub struct NewLesson {
    pub id: Uuid,
    pub path_id: Uuid,
    pub title: String,
    pub position: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(Organisation, foreign_key = organisation_id))]
pub struct Document {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub base_class_id: Option<Uuid>,
    pub uploaded_by: Uuid,
    pub storage_bucket: String,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub status: String,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub base_class_id: Option<Uuid>,
    pub uploaded_by: Uuid,
    pub storage_bucket: String,
    pub storage_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub status: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = progress)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct ProgressRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_type: String,
    pub item_id: Uuid,
    pub status: String,
    pub percentage: i32,
    pub last_position: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = progress)]
pub struct NewProgressRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_type: String,
    pub item_id: Uuid,
    pub status: String,
    pub percentage: i32,
    pub last_position: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = generation_jobs)]
#[diesel(belongs_to(BaseClass, foreign_key = base_class_id))]
pub struct GenerationJob {
    pub id: Uuid,
    pub base_class_id: Uuid,
    pub created_by: Uuid,
    pub kind: String,
    pub status: String,
    pub is_cleared: bool,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = generation_jobs)]
pub struct NewGenerationJob {
    pub id: Uuid,
    pub base_class_id: Uuid,
    pub created_by: Uuid,
    pub kind: String,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = generation_tasks)]
#[diesel(belongs_to(GenerationJob, foreign_key = job_id))]
pub struct GenerationTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub position: i32,
    pub title: String,
    pub status: String,
    pub output: Option<String>,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = generation_tasks)]
pub struct NewGenerationTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub position: i32,
    pub title: String,
    pub status: String,
}
