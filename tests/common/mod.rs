//! Shared helpers for building state machine directories out of shell scripts.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use stepwise::engine::Scheduler;
use stepwise::storage::JobStore;
use stepwise::storage::memory_store::MemoryJobStore;

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_state(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Create `root/name` holding one script per `(state, body)` pair.
pub fn machine_dir(root: &Path, name: &str, states: &[(&str, &str)]) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    for (state, body) in states {
        write_state(&dir, state, body);
    }
    dir
}

pub fn memory_scheduler() -> (Scheduler, Arc<dyn JobStore>) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    (Scheduler::new(store.clone()), store)
}

/// Run one tick and wait for every step it launched. Returns how many launched.
pub async fn step_once(scheduler: &Scheduler) -> usize {
    let handles = scheduler.tick(Utc::now()).await;
    let launched = handles.len();
    for handle in handles {
        handle.await.unwrap();
    }
    launched
}

/// Registry and active index hold the same ids, and none of them is stopped.
pub async fn assert_consistent(scheduler: &Scheduler) {
    let registry_ids = scheduler.active().ids();
    let index_ids = scheduler.store().active_ids().await.unwrap();
    assert_eq!(registry_ids, index_ids, "registry and active index disagree");

    for run in scheduler.list_active() {
        assert!(!run.is_stopped(), "stopped run {} still active", run.id);
        let persisted = scheduler.store().get_run(run.id).await.unwrap();
        assert!(!persisted.is_stopped(), "persisted run {} is stopped but indexed", run.id);
    }
}
