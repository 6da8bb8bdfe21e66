use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use lunaclass::auth::jwt::JwtService;
use lunaclass::config::{default_allowed_content_types, AppConfig};
use lunaclass::db::{self, PgPool};
use lunaclass::models::{NewBaseClass, NewLesson, NewOrganisation, NewPath, NewUser};
use lunaclass::processor::{ContentGenerator, DocumentProcessor};
use lunaclass::realtime::ChangeFeed;
use lunaclass::routes;
use lunaclass::state::AppState;
use lunaclass::storage::ObjectStorage;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
#[derive(Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    buckets: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    fail_puts: std::sync::atomic::AtomicBool,
    fail_deletes: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let mut guard = self.buckets.lock().await;
        guard.insert(bucket.to_string());
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        if self.fail_puts.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("injected put failure");
        }
        {
            let buckets = self.buckets.lock().await;
            ensure!(buckets.contains(bucket), "bucket {bucket} missing");
        }
        let stored = StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            bytes,
            content_type,
        };
        let mut guard = self.objects.lock().await;
        guard.insert((stored.bucket.clone(), stored.key.clone()), stored);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| anyhow!("object {bucket}/{key} missing"))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("injected delete failure");
        }
        let mut guard = self.objects.lock().await;
        guard.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }

    #[allow(dead_code)]
    pub async fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let guard = self.objects.lock().await;
        guard.get(&(bucket.to_string(), key.to_string())).cloned()
    }

    #[allow(dead_code)]
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Records invocations instead of reaching a worker; can be told to fail.
#[derive(Default)]
pub struct FakeProcessor {
    invocations: Mutex<Vec<Uuid>>,
    fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl DocumentProcessor for FakeProcessor {
    async fn invoke(&self, document_id: Uuid) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("injected processor failure");
        }
        let mut guard = self.invocations.lock().await;
        guard.push(document_id);
        Ok(())
    }
}

impl FakeProcessor {
    #[allow(dead_code)]
    pub async fn invocations(&self) -> Vec<Uuid> {
        let guard = self.invocations.lock().await;
        guard.clone()
    }

    #[allow(dead_code)]
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Dispatch is fire-and-forget, so tests poll for the spawned task.
    #[allow(dead_code)]
    pub async fn wait_for_invocations(&self, count: usize) -> Result<Vec<Uuid>> {
        for _ in 0..100 {
            {
                let guard = self.invocations.lock().await;
                if guard.len() >= count {
                    return Ok(guard.clone());
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("processor never reached {count} invocations")
    }
}

/// Generates canned content; titles in `fail_titles` error out instead.
#[derive(Default)]
pub struct FakeGenerator {
    fail_titles: Mutex<HashSet<String>>,
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate(&self, kind: &str, title: &str) -> Result<String> {
        let guard = self.fail_titles.lock().await;
        if guard.contains(title) {
            anyhow::bail!("injected generation failure for {title}");
        }
        Ok(format!("{kind} content for {title}"))
    }
}

impl FakeGenerator {
    #[allow(dead_code)]
    pub async fn fail_title(&self, title: &str) {
        let mut guard = self.fail_titles.lock().await;
        guard.insert(title.to_string());
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
    processor: Arc<FakeProcessor>,
    generator: Arc<FakeGenerator>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            cors_allowed_origin: None,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            bucket_prefix: "test-docs".to_string(),
            processor_endpoint: None,
            generator_endpoint: None,
            max_upload_bytes: 1024 * 1024,
            allowed_content_types: default_allowed_content_types(),
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let processor = Arc::new(FakeProcessor::default());
        let generator = Arc::new(FakeGenerator::default());
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(
            pool.clone(),
            config,
            storage.clone(),
            processor.clone(),
            generator.clone(),
            ChangeFeed::default(),
            jwt,
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            processor,
            generator,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    #[allow(dead_code)]
    pub fn processor(&self) -> Arc<FakeProcessor> {
        self.processor.clone()
    }

    #[allow(dead_code)]
    pub fn generator(&self) -> Arc<FakeGenerator> {
        self.generator.clone()
    }

    pub async fn insert_organisation(&self, name: &str) -> Result<Uuid> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let organisation = NewOrganisation {
                id: Uuid::new_v4(),
                name,
            };
            diesel::insert_into(lunaclass::schema::organisations::table)
                .values(&organisation)
                .execute(conn)
                .context("failed to insert organisation")?;
            Ok(organisation.id)
        })
        .await
    }

    pub async fn insert_user(
        &self,
        organisation_id: Uuid,
        username: &str,
        password: &str,
        role: &str,
    ) -> Result<Uuid> {
        let username = username.to_string();
        let password = password.to_string();
        let role = role.to_string();
        self.with_conn(move |conn| {
            let password_hash = hash_password(&password)?;
            let user = NewUser {
                id: Uuid::new_v4(),
                organisation_id,
                username,
                password_hash,
                role,
            };
            diesel::insert_into(lunaclass::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_class(&self, organisation_id: Uuid, title: &str) -> Result<Uuid> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            let class = NewBaseClass {
                id: Uuid::new_v4(),
                organisation_id,
                title,
            };
            diesel::insert_into(lunaclass::schema::base_classes::table)
                .values(&class)
                .execute(conn)
                .context("failed to insert base class")?;
            Ok(class.id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_path(
        &self,
        base_class_id: Uuid,
        title: &str,
        position: i32,
    ) -> Result<Uuid> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            let path = NewPath {
                id: Uuid::new_v4(),
                base_class_id,
                title,
                position,
            };
            diesel::insert_into(lunaclass::schema::paths::table)
                .values(&path)
                .execute(conn)
                .context("failed to insert path")?;
            Ok(path.id)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_lesson(&self, path_id: Uuid, title: &str, position: i32) -> Result<Uuid> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            let lesson = NewLesson {
                id: Uuid::new_v4(),
                path_id,
                title,
                position,
            };
            diesel::insert_into(lunaclass::schema::lessons::table)
                .values(&lesson)
                .execute(conn)
                .context("failed to insert lesson")?;
            Ok(lesson.id)
        })
        .await
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = serde_json::from_slice(&body)?;
        Ok(parsed.access_token)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn upload_document(
        &self,
        filename: &str,
        content_type: &str,
        data: &[u8],
        base_class_id: Option<Uuid>,
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        if let Some(class) = base_class_id {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"base_class_id\"\r\n\r\n");
            body.extend(class.to_string().as_bytes());
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        self.post_multipart(body, &boundary, token).await
    }

    #[allow(dead_code)]
    pub async fn post_multipart(
        &self,
        body: Vec<u8>,
        boundary: &str,
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let builder = Request::builder()
            .method(Method::POST)
            .uri("/api/documents")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"));

        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_to_json(body: Body) -> Result<serde_json::Value> {
    let bytes = body_to_vec(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE generation_tasks, generation_jobs, progress, documents, lessons, paths, base_classes, users, organisations RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}

fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?
        .to_string())
}
