use std::future::Future;
use anyhow::Result;
use log::{debug, error};

pub mod agent;
pub mod capture;
pub mod config;
pub mod data;
pub mod phase;
pub mod resolve;
pub mod retry;
pub mod role;
pub mod session;
pub mod store;
pub mod update;

pub(crate) fn spawn<F: Future<Output = Result<()>> + Send + 'static>(task: F) {
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("task finished"),
            Err(e) => error!("task failed: {:?}", e),
        }
    });
}
