pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod progress;
pub mod runner;
pub mod store;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::{
    config::AppConfig,
    jobs::{JobRunnerState, QueuedJob, RateLimiter},
    store::JobStore,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: mpsc::Sender<QueuedJob>,
    pub runner_state: Arc<Mutex<JobRunnerState>>,
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}
