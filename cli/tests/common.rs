//! Test utilities for CLI crate integration tests.
#![allow(missing_docs, dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run the given future with a timeout, failing the test if it elapses.
///
/// # Panics
///
/// Panics if the timeout elapses before the future completes.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .expect("test timed out")
}

/// Write `contents` as `kindling.toml` under `dir`
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("kindling.toml");
    std::fs::write(&path, contents).expect("write config");
    path
}
