mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_json, TestApp};
use diesel::prelude::*;
use lunaclass::models::ProgressRecord;
use lunaclass::schema::progress;
use serde_json::json;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

struct Course {
    class_id: Uuid,
    lesson_ids: Vec<Vec<Uuid>>,
}

async fn setup_course(app: &TestApp, shape: &[usize]) -> Result<(String, Uuid, Course)> {
    let organisation_id = app.insert_organisation("acme-academy").await?;
    let user_id = app
        .insert_user(organisation_id, "student", "password123", "student")
        .await?;
    let token = app.login_token("student", "password123").await?;

    let class_id = app.insert_class(organisation_id, "Rust 101").await?;
    let mut lesson_ids = Vec::new();
    for (path_index, lesson_count) in shape.iter().enumerate() {
        let path_id = app
            .insert_path(class_id, &format!("Path {path_index}"), path_index as i32)
            .await?;
        let mut lessons = Vec::new();
        for lesson_index in 0..*lesson_count {
            let lesson_id = app
                .insert_lesson(
                    path_id,
                    &format!("Lesson {path_index}.{lesson_index}"),
                    lesson_index as i32,
                )
                .await?;
            lessons.push(lesson_id);
        }
        lesson_ids.push(lessons);
    }

    Ok((
        token,
        user_id,
        Course {
            class_id,
            lesson_ids,
        },
    ))
}

async fn load_record(
    app: &TestApp,
    user_id: Uuid,
    item_type: &str,
    item_id: Uuid,
) -> Result<Option<ProgressRecord>> {
    let item_type = item_type.to_string();
    app.with_conn(move |conn| {
        progress::table
            .filter(progress::user_id.eq(user_id))
            .filter(progress::item_type.eq(item_type))
            .filter(progress::item_id.eq(item_id))
            .first(conn)
            .optional()
            .map_err(Into::into)
    })
    .await
}

#[tokio::test]
async fn lower_rank_updates_never_regress_stored_progress() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (token, user_id, course) = setup_course(&app, &[1]).await?;
    let lesson_id = course.lesson_ids[0][0];
    let path = format!("/api/progress/lesson/{lesson_id}");

    let response = app
        .post_json(
            &path,
            &json!({ "status": "in_progress", "progress_percentage": 60 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["percentage"], 60);

    // Stale update with a lower percentage is acknowledged but ignored.
    let response = app
        .post_json(
            &path,
            &json!({ "status": "in_progress", "progress_percentage": 30 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["percentage"], 60);

    let record = load_record(&app, user_id, "lesson", lesson_id)
        .await?
        .expect("record stored");
    assert_eq!(record.percentage, 60);
    assert_eq!(record.status, "in_progress");

    // Completion wins over any in-progress value.
    let response = app
        .post_json(&path, &json!({ "status": "completed" }), Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let record = load_record(&app, user_id, "lesson", lesson_id)
        .await?
        .expect("record stored");
    assert_eq!(record.status, "completed");
    assert_eq!(record.percentage, 100);

    app.cleanup().await
}

#[tokio::test]
async fn equal_rank_updates_advance_the_resume_token() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (token, user_id, course) = setup_course(&app, &[1]).await?;
    let lesson_id = course.lesson_ids[0][0];
    let path = format!("/api/progress/lesson/{lesson_id}");

    app.post_json(
        &path,
        &json!({
            "status": "in_progress",
            "progress_percentage": 50,
            "last_position": "section-2"
        }),
        Some(&token),
    )
    .await?;

    let response = app
        .post_json(
            &path,
            &json!({
                "status": "in_progress",
                "progress_percentage": 50,
                "last_position": "section-3"
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let record = load_record(&app, user_id, "lesson", lesson_id)
        .await?
        .expect("record stored");
    assert_eq!(record.last_position.as_deref(), Some("section-3"));

    app.cleanup().await
}

#[tokio::test]
async fn ignored_updates_publish_no_change_events() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (token, user_id, course) = setup_course(&app, &[1]).await?;
    let lesson_id = course.lesson_ids[0][0];
    let path = format!("/api/progress/lesson/{lesson_id}");

    app.post_json(
        &path,
        &json!({ "status": "in_progress", "progress_percentage": 60 }),
        Some(&token),
    )
    .await?;

    let mut subscription = app.state.changes.subscribe(user_id);

    // Lower-rank no-op: acknowledged with 200 but never broadcast.
    let response = app
        .post_json(
            &path,
            &json!({ "status": "in_progress", "progress_percentage": 30 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    app.post_json(&path, &json!({ "status": "completed" }), Some(&token))
        .await?;

    // The first event subscribers see is the completion, not the stale 30%.
    let event = timeout(Duration::from_secs(1), subscription.next_event())
        .await?
        .expect("event delivered");
    assert_eq!(event.table, "progress");
    assert_eq!(
        event.new.as_ref().and_then(|row| row.get("percentage")),
        Some(&json!(100))
    );

    subscription.unsubscribe();
    app.cleanup().await
}

#[tokio::test]
async fn lesson_completions_cascade_to_path_and_course() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (token, user_id, course) = setup_course(&app, &[4]).await?;
    let path_id = {
        // Resolve the single path's id through any lesson record.
        let lesson_id = course.lesson_ids[0][0];
        app.with_conn(move |conn| {
            use lunaclass::schema::lessons;
            lessons::table
                .find(lesson_id)
                .select(lessons::path_id)
                .first::<Uuid>(conn)
                .map_err(Into::into)
        })
        .await?
    };

    for lesson_id in &course.lesson_ids[0][..3] {
        let response = app
            .post_json(
                &format!("/api/progress/lesson/{lesson_id}"),
                &json!({ "status": "completed" }),
                Some(&token),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let record = load_record(&app, user_id, "path", path_id)
        .await?
        .expect("path aggregate stored");
    assert_eq!(record.percentage, 75);
    assert_eq!(record.status, "in_progress");

    // Fourth completion finishes the path and, with only one path, the course.
    app.post_json(
        &format!("/api/progress/lesson/{}", course.lesson_ids[0][3]),
        &json!({ "status": "completed" }),
        Some(&token),
    )
    .await?;

    let record = load_record(&app, user_id, "path", path_id)
        .await?
        .expect("path aggregate stored");
    assert_eq!(record.percentage, 100);
    assert_eq!(record.status, "completed");

    let record = load_record(&app, user_id, "course", course.class_id)
        .await?
        .expect("course aggregate stored");
    assert_eq!(record.percentage, 100);
    assert_eq!(record.status, "completed");

    app.cleanup().await
}

#[tokio::test]
async fn course_position_resumes_at_first_incomplete_lesson() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (token, _, course) = setup_course(&app, &[2, 2]).await?;

    // Complete all of path 0 and the first lesson of path 1.
    for lesson_id in course.lesson_ids[0].iter().chain(&course.lesson_ids[1][..1]) {
        app.post_json(
            &format!("/api/progress/lesson/{lesson_id}"),
            &json!({ "status": "completed" }),
            Some(&token),
        )
        .await?;
    }
    app.post_json(
        &format!("/api/progress/lesson/{}", course.lesson_ids[1][1]),
        &json!({ "status": "in_progress", "progress_percentage": 20, "last_position": "intro" }),
        Some(&token),
    )
    .await?;

    let response = app
        .get(
            &format!("/api/courses/{}/position", course.class_id),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["lesson_id"], json!(course.lesson_ids[1][1]));
    assert_eq!(body["last_position"], "intro");
    assert_eq!(body["all_completed"], false);

    // Completing the last lesson resolves to the final lesson, flagged done.
    app.post_json(
        &format!("/api/progress/lesson/{}", course.lesson_ids[1][1]),
        &json!({ "status": "completed" }),
        Some(&token),
    )
    .await?;

    let response = app
        .get(
            &format!("/api/courses/{}/position", course.class_id),
            Some(&token),
        )
        .await?;
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["lesson_id"], json!(course.lesson_ids[1][1]));
    assert_eq!(body["all_completed"], true);

    app.cleanup().await
}
