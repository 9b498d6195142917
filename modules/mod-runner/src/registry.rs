use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{RunHandle, RunRequest, RunnerError, Workload};

#[derive(Debug, Clone)]
pub struct RunState {
    pub device: String,
    pub duration_secs: u64,
    pub log_path: PathBuf,
    pub workload: Workload,
    pub started: Instant,
    handle: Option<RunHandle>,
}

impl RunState {
    pub fn new(request: &RunRequest) -> Self {
        Self {
            device: request.device_path.clone(),
            duration_secs: request.duration_secs,
            log_path: request.log_path.clone(),
            workload: request.workload,
            started: Instant::now(),
            handle: None,
        }
    }

    pub fn progress_at(&self, now: Instant) -> RunProgress {
        RunProgress::compute(
            &self.device,
            self.duration_secs,
            now.saturating_duration_since(self.started),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub device: String,
    /// 0..=100, capped once the nominal duration has passed.
    pub percent: u8,
    pub elapsed: Duration,
    pub remaining: Duration,
}

impl RunProgress {
    pub fn compute(device: &str, duration_secs: u64, elapsed: Duration) -> Self {
        let total = Duration::from_secs(duration_secs);
        let percent = if duration_secs == 0 {
            100
        } else {
            let ratio = elapsed.as_secs_f64() / total.as_secs_f64();
            (ratio * 100.0).min(100.0) as u8
        };
        Self {
            device: device.to_string(),
            percent,
            elapsed,
            remaining: total.saturating_sub(elapsed),
        }
    }

    pub fn describe_remaining(&self) -> String {
        let secs = self.remaining.as_secs();
        let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if hours > 0 {
            format!("{hours}h {minutes}m {seconds}s remaining")
        } else if minutes > 0 {
            format!("{minutes}m {seconds}s remaining")
        } else {
            format!("{seconds}s remaining")
        }
    }
}

/// Active runs keyed by test id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunState>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunState>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: &str, state: RunState) {
        self.lock().insert(id.to_string(), state);
    }

    pub(crate) fn attach(&self, id: &str, handle: RunHandle) {
        if let Some(state) = self.lock().get_mut(id) {
            state.handle = Some(handle);
        }
    }

    pub fn remove(&self, id: &str) -> Option<RunState> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn progress(&self, id: &str) -> Option<RunProgress> {
        self.lock()
            .get(id)
            .map(|state| state.progress_at(Instant::now()))
    }

    pub fn cancel(&self, id: &str) -> Result<(), RunnerError> {
        // Clone out so the lock is not held through the grace period.
        let handle = self
            .lock()
            .get(id)
            .and_then(|state| state.handle.clone())
            .ok_or_else(|| RunnerError::UnknownTest(id.to_string()))?;
        handle.cancel()
    }
}
