pub mod auth;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod realtime;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod state;
pub mod storage;
