use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::NaiveDateTime;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

mod registry;

pub use registry::{RunProgress, RunRegistry, RunState};

/// Helper script expected next to the logs unless overridden.
pub const DEFAULT_SCRIPT: &str = "run_single_drive_test.sh";

const CANCEL_GRACE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TEMP_TAG: &str = "[TEMP]";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("test script not found at {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("failed to start {}", .script.display())]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("test {0} not found")]
    UnknownTest(String),
    #[error("failed to signal test process group {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// Mixed 70/30 data load followed by large sequential checkpoint writes.
    Ai,
    /// Plain 4K random read/write.
    Standard,
}

impl Workload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workload::Ai => "ai",
            Workload::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub device_path: String,
    pub duration_secs: u64,
    pub log_path: PathBuf,
    pub workload: Workload,
}

/// Keeps alphanumerics, `_` and `-`; everything else becomes `_`.
pub fn sanitize_log_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Log file for a run: the sanitized operator name, or a timestamped default.
pub fn log_path_for(
    dir: &Path,
    device_name: &str,
    log_name: Option<&str>,
    now: NaiveDateTime,
) -> PathBuf {
    match log_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => dir.join(format!("{}.log", sanitize_log_name(name))),
        None => dir.join(format!(
            "nvme_stress_{}_{}.log",
            device_name,
            now.format("%Y%m%d_%H%M%S")
        )),
    }
}

pub fn test_id_for(device_name: &str, now: NaiveDateTime) -> String {
    format!("test_{}_{}", now.format("%Y%m%d_%H%M%S"), device_name)
}

/// One line of combined stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    /// Temperature sample emitted by the helper script.
    pub temperature: bool,
}

impl OutputLine {
    fn new(text: String) -> Self {
        let temperature = text.contains(TEMP_TAG);
        Self { text, temperature }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed { code: Option<i32> },
    Cancelled,
    Error { message: String },
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed { code } => code.unwrap_or(1),
            RunOutcome::Cancelled => 130,
            RunOutcome::Error { .. } => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Succeeded => f.write_str("Test completed successfully"),
            RunOutcome::Failed { code: Some(code) } => {
                write!(f, "Test failed with return code {}", code)
            }
            RunOutcome::Failed { code: None } => f.write_str("Test terminated by a signal"),
            RunOutcome::Cancelled => f.write_str("Test was cancelled"),
            RunOutcome::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

/// Events delivered to a run listener; `Finished` is always the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Output(OutputLine),
    Finished(RunOutcome),
}

/// Runs the helper script against one device.
#[derive(Debug, Clone)]
pub struct TestRunner {
    script: PathBuf,
}

impl TestRunner {
    pub fn new<P: Into<PathBuf>>(script: P) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    fn command(&self, request: &RunRequest) -> Command {
        let mut command = Command::new(&self.script);
        command
            .arg(&request.device_path)
            .arg(request.duration_secs.to_string())
            .arg(&request.log_path)
            .arg(request.workload.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so cancellation reaches fio as well as the script.
            .process_group(0);
        command
    }

    /// Spawns the script and streams its output to `listener` from a supervisor thread.
    pub fn start<F>(&self, request: RunRequest, mut listener: F) -> Result<RunHandle, RunnerError>
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        if !self.script.is_file() {
            return Err(RunnerError::ScriptNotFound(self.script.clone()));
        }

        let mut child = self
            .command(&request)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                script: self.script.clone(),
                source,
            })?;
        let pid = child.id();
        info!(
            pid,
            device = %request.device_path,
            duration = request.duration_secs,
            workload = request.workload.as_str(),
            "test started"
        );

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || forward_lines(stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || forward_lines(stderr, tx)));
        }
        drop(tx);

        let shared = Arc::new(RunShared {
            child: Mutex::new(child),
            pid,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let supervisor = Arc::clone(&shared);
        thread::spawn(move || {
            for line in rx {
                listener(RunEvent::Output(OutputLine::new(line)));
            }
            for reader in readers {
                if reader.join().is_err() {
                    warn!(pid = supervisor.pid, "output reader panicked");
                }
            }

            let outcome = supervisor.wait_outcome();
            supervisor.finished.store(true, Ordering::SeqCst);
            info!(pid = supervisor.pid, %outcome, "test finished");
            listener(RunEvent::Finished(outcome));
        });

        Ok(RunHandle { shared })
    }

    /// Like [`TestRunner::start`], tracking the run in `registry` until it finishes.
    pub fn start_tracked<F>(
        &self,
        registry: &Arc<RunRegistry>,
        id: &str,
        request: RunRequest,
        mut listener: F,
    ) -> Result<RunHandle, RunnerError>
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        registry.register(id, RunState::new(&request));

        let cleanup = Arc::clone(registry);
        let cleanup_id = id.to_string();
        let started = self.start(request, move |event| {
            if matches!(event, RunEvent::Finished(_)) {
                cleanup.remove(&cleanup_id);
            }
            listener(event);
        });

        match started {
            Ok(handle) => {
                registry.attach(id, handle.clone());
                Ok(handle)
            }
            Err(err) => {
                registry.remove(id);
                Err(err)
            }
        }
    }
}

fn forward_lines<R: Read>(reader: R, tx: Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!("output stream closed: {err}");
                break;
            }
        }
    }
}

#[derive(Debug)]
struct RunShared {
    child: Mutex<Child>,
    pid: u32,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl RunShared {
    fn still_running(&self) -> bool {
        let polled = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        matches!(polled, Ok(None))
    }

    fn wait_outcome(&self) -> RunOutcome {
        let status = loop {
            let polled = self
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait();
            match polled {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => break Err(err),
            }
        };

        match status {
            Ok(_) if self.cancelled.load(Ordering::SeqCst) => RunOutcome::Cancelled,
            Ok(status) if status.success() => RunOutcome::Succeeded,
            Ok(status) => RunOutcome::Failed {
                code: status.code(),
            },
            Err(err) => RunOutcome::Error {
                message: err.to_string(),
            },
        }
    }

    fn signal(&self, signal: Signal) -> Result<(), RunnerError> {
        let pid = i32::try_from(self.pid).unwrap_or(i32::MAX);
        match killpg(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(RunnerError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }
}

/// Handle to a running test; clones share the same process.
#[derive(Debug, Clone)]
pub struct RunHandle {
    shared: Arc<RunShared>,
}

impl RunHandle {
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// SIGTERM to the process group, then SIGKILL after a short grace period.
    pub fn cancel(&self) -> Result<(), RunnerError> {
        if self.is_finished() || !self.shared.still_running() {
            return Ok(());
        }
        // Only a live child is reported as cancelled; one that already exited keeps its status.
        self.shared.cancelled.store(true, Ordering::SeqCst);
        info!(pid = self.shared.pid, "cancelling test");
        self.shared.signal(Signal::SIGTERM)?;

        thread::sleep(CANCEL_GRACE);
        if self.shared.still_running() {
            warn!(pid = self.shared.pid, "test ignored SIGTERM; killing");
            self.shared.signal(Signal::SIGKILL)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use std::sync::mpsc::Receiver;
    use std::time::Instant;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("valid timestamp")
    }

    // `sh <fixture> ...` runs the fixture as the "device" argument, so the
    // fixture sees duration, log and workload as $1..$3 and needs no exec bit.
    fn shell_fixture(body: &str) -> (tempfile::TempDir, RunRequest) {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fixture.sh");
        fs::write(&script, body).expect("write fixture");
        let request = RunRequest {
            device_path: script.display().to_string(),
            duration_secs: 5,
            log_path: dir.path().join("nvme0.log"),
            workload: Workload::Ai,
        };
        (dir, request)
    }

    fn collect(rx: Receiver<RunEvent>) -> (Vec<OutputLine>, RunOutcome) {
        let mut lines = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(20)).expect("event") {
                RunEvent::Output(line) => lines.push(line),
                RunEvent::Finished(outcome) => return (lines, outcome),
            }
        }
    }

    fn start(body: &str) -> (tempfile::TempDir, RunHandle, Receiver<RunEvent>) {
        let (dir, request) = shell_fixture(body);
        let (tx, rx) = mpsc::channel();
        let handle = TestRunner::new("/bin/sh")
            .start(request, move |event| {
                let _ = tx.send(event);
            })
            .expect("start");
        (dir, handle, rx)
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_log_name("drive 1/../x.log"), "drive_1____x_log");
        assert_eq!(sanitize_log_name("nvme0-run_2"), "nvme0-run_2");
    }

    #[test]
    fn log_path_prefers_operator_name() {
        let dir = Path::new("/var/log/nvst");
        assert_eq!(
            log_path_for(dir, "nvme0n1", Some(" burn in "), at(1, 2, 3)),
            dir.join("burn_in.log")
        );
        assert_eq!(
            log_path_for(dir, "nvme0n1", Some("   "), at(1, 2, 3)),
            dir.join("nvme_stress_nvme0n1_20240309_010203.log")
        );
        assert_eq!(
            log_path_for(dir, "nvme0n1", None, at(13, 4, 5)),
            dir.join("nvme_stress_nvme0n1_20240309_130405.log")
        );
    }

    #[test]
    fn test_id_embeds_timestamp_and_device() {
        assert_eq!(test_id_for("nvme1n1", at(9, 30, 0)), "test_20240309_093000_nvme1n1");
    }

    #[test]
    fn missing_script_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = TestRunner::new(dir.path().join("absent.sh"));
        let request = RunRequest {
            device_path: "/dev/nvme0n1".into(),
            duration_secs: 1,
            log_path: dir.path().join("x.log"),
            workload: Workload::Standard,
        };
        let err = runner.start(request, |_| {}).unwrap_err();
        assert!(matches!(err, RunnerError::ScriptNotFound(_)));
    }

    #[test]
    fn streams_output_then_success() {
        let (_dir, _handle, rx) = start("echo \"duration=$1 workload=$3\"\necho '[TEMP] nvme0: 48C'\n");
        let (lines, outcome) = collect(rx);
        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(lines[0].text, "duration=5 workload=ai");
        assert!(!lines[0].temperature);
        assert!(lines[1].temperature);
    }

    #[test]
    fn stderr_lines_are_forwarded_and_exit_code_kept() {
        let (_dir, _handle, rx) = start("echo boom >&2\nexit 3\n");
        let (lines, outcome) = collect(rx);
        assert!(lines.iter().any(|l| l.text == "boom"));
        assert_eq!(outcome, RunOutcome::Failed { code: Some(3) });
        assert_eq!(outcome.exit_code(), 3);
        assert!(!outcome.success());
    }

    #[test]
    fn cancel_terminates_run() {
        let (_dir, handle, rx) = start("echo started\nsleep 30\n");
        match rx.recv_timeout(Duration::from_secs(10)).expect("first line") {
            RunEvent::Output(line) => assert_eq!(line.text, "started"),
            other => panic!("unexpected event {other:?}"),
        }

        let begun = Instant::now();
        handle.cancel().expect("cancel");
        let (_, outcome) = collect(rx);
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(begun.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_after_exit_keeps_status() {
        let (_dir, handle, rx) = start("exit 0\n");
        while handle.shared.still_running() {
            thread::sleep(Duration::from_millis(10));
        }
        handle.cancel().expect("cancel");
        let (_, outcome) = collect(rx);
        assert_eq!(outcome, RunOutcome::Succeeded);
    }

    #[test]
    fn registry_cancel_kills_process_group() {
        let (_dir, request) = shell_fixture("echo started\nexec sleep 30\n");
        let registry = Arc::new(RunRegistry::new());
        let (tx, rx) = mpsc::channel();
        let handle = TestRunner::new("/bin/sh")
            .start_tracked(&registry, "test_cancel", request, move |event| {
                let _ = tx.send(event);
            })
            .expect("start");
        match rx.recv_timeout(Duration::from_secs(10)).expect("first line") {
            RunEvent::Output(line) => assert_eq!(line.text, "started"),
            other => panic!("unexpected event {other:?}"),
        }

        registry.cancel("test_cancel").expect("cancel");
        let (_, outcome) = collect(rx);
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(outcome.exit_code(), 130);
        assert!(!registry.contains("test_cancel"));

        let group = Pid::from_raw(i32::try_from(handle.pid()).expect("pid"));
        assert_eq!(killpg(group, None::<Signal>), Err(Errno::ESRCH));
    }

    #[test]
    fn tracked_run_leaves_registry_when_done() {
        let (_dir, request) = shell_fixture("echo hi\n");
        let registry = Arc::new(RunRegistry::new());
        let (tx, rx) = mpsc::channel();
        TestRunner::new("/bin/sh")
            .start_tracked(&registry, "test_1", request, move |event| {
                let _ = tx.send(event);
            })
            .expect("start");

        let (_, outcome) = collect(rx);
        assert!(outcome.success());
        assert!(!registry.contains("test_1"));
    }

    #[test]
    fn outcome_messages() {
        assert_eq!(RunOutcome::Succeeded.to_string(), "Test completed successfully");
        assert_eq!(
            RunOutcome::Failed { code: Some(2) }.to_string(),
            "Test failed with return code 2"
        );
        assert_eq!(RunOutcome::Cancelled.to_string(), "Test was cancelled");
    }
}
