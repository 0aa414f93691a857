//! Supervision of the external data-plane process (sing-box)
//!
//! The supervisor is a small state machine: `Stopped`, `Running(pid)` and
//! the transitional `Stopping(pid)`. Each spawned process gets a reaper
//! thread that collects it and clears the handle, but only while the
//! handle still refers to that same process instance.

use crate::config::{DataPlaneSection, StateLayout, CONFIG_PLACEHOLDER};
use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// How long to wait for the reaper after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Interval at which the reaper polls for exit
const REAP_POLL: Duration = Duration::from_millis(25);

/// Bytes of the data-plane log attached to process errors
const LOG_TAIL_BYTES: u64 = 4096;

/// Observable state of the data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running { pid: u32 },
    Stopping { pid: u32 },
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Stopped => None,
            ProcessState::Running { pid } | ProcessState::Stopping { pid } => Some(*pid),
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    /// The process had exited before it was signalled
    AlreadyExited,
    Terminated,
    Killed,
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitReport {
    fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            success: false,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_output(output: Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// One spawned process, shared between the supervisor and its reaper.
///
/// The child stays in `child` until the reaper collects it. Signals are only
/// sent while that lock is held and the child is present, so the pid cannot
/// have been reaped and reused in between.
#[derive(Debug)]
struct Instance {
    id: u64,
    pid: u32,
    child: Mutex<Option<Child>>,
    exit: Mutex<Option<ExitReport>>,
    exited: Condvar,
}

impl Instance {
    fn new(id: u64, child: Child) -> Self {
        Self {
            id,
            pid: child.id(),
            child: Mutex::new(Some(child)),
            exit: Mutex::new(None),
            exited: Condvar::new(),
        }
    }

    /// Signal the process unless it has already been reaped
    fn signal(&self, force: bool) -> std::result::Result<(), String> {
        let child = lock(&self.child);
        if child.is_none() {
            return Ok(());
        }
        send_signal(self.pid, force)
    }

    /// Poll until the child exits, then collect it
    fn reap(&self) -> ExitReport {
        loop {
            {
                let mut child = lock(&self.child);
                let polled = match child.as_mut() {
                    Some(child) => child.try_wait(),
                    None => return ExitReport::unknown(),
                };
                match polled {
                    Ok(Some(status)) => {
                        *child = None;
                        return ExitReport::from_status(&status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("waiting for data plane (pid={}) failed: {}", self.pid, e);
                        *child = None;
                        return ExitReport::unknown();
                    }
                }
            }
            thread::sleep(REAP_POLL);
        }
    }

    /// Kill and collect the child without a reaper thread
    fn kill_and_collect(&self) {
        if let Some(mut child) = lock(&self.child).take() {
            child.kill().ok();
            if let Ok(status) = child.wait() {
                self.record_exit(ExitReport::from_status(&status));
            }
        }
    }

    fn record_exit(&self, report: ExitReport) {
        *lock(&self.exit) = Some(report);
        self.exited.notify_all();
    }

    fn exit_report(&self) -> Option<ExitReport> {
        *lock(&self.exit)
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<ExitReport> {
        let guard = lock(&self.exit);
        let (guard, _) = self
            .exited
            .wait_timeout_while(guard, timeout, |exit| exit.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    fn wait(&self) -> ExitReport {
        let guard = lock(&self.exit);
        let guard = self
            .exited
            .wait_while(guard, |exit| exit.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.unwrap_or_else(ExitReport::unknown)
    }
}

#[derive(Debug)]
enum Slot {
    Stopped,
    Running(Arc<Instance>),
    Stopping(u32),
}

/// Handle for waiting on the currently running process without holding any lock
#[derive(Debug, Clone)]
pub struct ExitWatch {
    instance: Arc<Instance>,
}

impl ExitWatch {
    pub fn pid(&self) -> u32 {
        self.instance.pid
    }

    /// Block until the process exits, or until `timeout` passes
    pub fn wait(&self, timeout: Option<Duration>) -> Option<ExitReport> {
        match timeout {
            Some(timeout) => self.instance.wait_timeout(timeout),
            None => Some(self.instance.wait()),
        }
    }
}

/// Starts, stops, and reaps the data-plane process
#[derive(Debug)]
pub struct ProcessSupervisor {
    binary: String,
    args: Vec<String>,
    config_path: PathBuf,
    log_path: PathBuf,
    pid_path: PathBuf,
    stop_grace: Duration,
    startup_probe: Duration,
    slot: Arc<Mutex<Slot>>,
    /// Serializes start and stop so concurrent callers never spawn twice
    lifecycle: Mutex<()>,
    next_instance: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(section: &DataPlaneSection, layout: &StateLayout) -> Self {
        Self {
            binary: section.binary.clone(),
            args: section.args.clone(),
            config_path: layout.server_config.clone(),
            log_path: layout.data_plane_log.clone(),
            pid_path: layout.data_plane_pid.clone(),
            stop_grace: Duration::from_millis(section.stop_grace_ms),
            startup_probe: Duration::from_millis(section.startup_probe_ms),
            slot: Arc::new(Mutex::new(Slot::Stopped)),
            lifecycle: Mutex::new(()),
            next_instance: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> ProcessState {
        match &*lock(&self.slot) {
            Slot::Stopped => ProcessState::Stopped,
            Slot::Running(instance) => ProcessState::Running { pid: instance.pid },
            Slot::Stopping(pid) => ProcessState::Stopping { pid: *pid },
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Watch the running process, if any
    pub fn watch(&self) -> Option<ExitWatch> {
        match &*lock(&self.slot) {
            Slot::Running(instance) => Some(ExitWatch {
                instance: Arc::clone(instance),
            }),
            _ => None,
        }
    }

    /// Arguments passed to the binary, with the server document path filled in
    pub fn command_args(&self) -> Vec<String> {
        let config = self.config_path.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config))
            .collect()
    }

    /// Check that the data-plane binary can be executed
    pub fn check_binary(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::CommandNotFound(self.binary.clone())
                } else {
                    Error::process(format!("Cannot run '{} version': {}", self.binary, e), "")
                }
            })?;

        let output = CommandOutput::from_output(output);
        if !output.success() {
            return Err(Error::process(
                format!("'{} version' exited with code {}", self.binary, output.exit_code),
                &output.stderr,
            ));
        }
        Ok(output.stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Spawn the data plane unless it is already running.
    ///
    /// A spawn failure, or an exit within the startup probe window, is a
    /// [`Error::Process`] and leaves the supervisor stopped.
    pub fn start(&self) -> Result<StartOutcome> {
        let _lifecycle = lock(&self.lifecycle);
        if let ProcessState::Running { pid } = self.state() {
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let log_file = open_log(&self.log_path)?;
        let err_file = log_file.try_clone()?;

        let child = Command::new(&self.binary)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(log_file)
            .stderr(err_file)
            .spawn()
            .map_err(|e| {
                Error::process(
                    format!("Failed to start data plane '{}': {}", self.binary, e),
                    &self.log_tail(),
                )
            })?;

        let instance = Arc::new(Instance::new(
            self.next_instance.fetch_add(1, Ordering::Relaxed),
            child,
        ));
        let pid = instance.pid;
        *lock(&self.slot) = Slot::Running(Arc::clone(&instance));
        if let Err(e) = fs::write(&self.pid_path, format!("{}\n", pid)) {
            log::warn!("cannot write pid file {}: {}", self.pid_path.display(), e);
        }

        let reaper_instance = Arc::clone(&instance);
        let slot = Arc::clone(&self.slot);
        let pid_path = self.pid_path.clone();
        let spawned = thread::Builder::new()
            .name(format!("data-plane-reaper-{}", pid))
            .spawn(move || {
                let report = reaper_instance.reap();
                reaper_instance.record_exit(report);

                let mut slot = lock(&slot);
                let current = matches!(&*slot, Slot::Running(i) if i.id == reaper_instance.id);
                if current {
                    *slot = Slot::Stopped;
                    fs::remove_file(&pid_path).ok();
                    if report.success {
                        log::info!("data plane exited (pid={})", pid);
                    } else {
                        log::warn!("data plane exited unexpectedly (pid={}): {}", pid, report);
                    }
                }
            });

        if let Err(e) = spawned {
            instance.kill_and_collect();
            self.clear_if_current(instance.id);
            return Err(Error::process(
                format!("Cannot watch data plane (pid={}): {}", pid, e),
                "",
            ));
        }

        if !self.startup_probe.is_zero() {
            if let Some(report) = instance.wait_timeout(self.startup_probe) {
                self.clear_if_current(instance.id);
                return Err(Error::process(
                    format!("Data plane exited during startup ({})", report),
                    &self.log_tail(),
                ));
            }
        }

        log::info!("data plane started (pid={})", pid);
        Ok(StartOutcome::Started { pid })
    }

    /// Stop the data plane: SIGTERM, grace period, then SIGKILL.
    ///
    /// Never fails; the handle is always cleared afterwards.
    pub fn stop(&self) -> StopOutcome {
        let _lifecycle = lock(&self.lifecycle);
        let instance = {
            let mut slot = lock(&self.slot);
            let instance = match &*slot {
                Slot::Running(instance) => Arc::clone(instance),
                _ => return StopOutcome::AlreadyStopped,
            };
            *slot = Slot::Stopping(instance.pid);
            instance
        };

        let outcome = self.terminate(&instance);

        {
            let mut slot = lock(&self.slot);
            if matches!(&*slot, Slot::Stopping(pid) if *pid == instance.pid) {
                *slot = Slot::Stopped;
            }
        }
        fs::remove_file(&self.pid_path).ok();
        log::info!("data plane stopped (pid={}, {:?})", instance.pid, outcome);
        outcome
    }

    fn terminate(&self, instance: &Instance) -> StopOutcome {
        if instance.exit_report().is_some() {
            return StopOutcome::AlreadyExited;
        }

        if let Err(e) = instance.signal(false) {
            log::warn!("cannot signal data plane (pid={}): {}", instance.pid, e);
        }
        if instance.wait_timeout(self.stop_grace).is_some() {
            return StopOutcome::Terminated;
        }

        log::warn!(
            "data plane (pid={}) ignored SIGTERM for {:?}, killing",
            instance.pid,
            self.stop_grace
        );
        if let Err(e) = instance.signal(true) {
            log::warn!("cannot kill data plane (pid={}): {}", instance.pid, e);
        }
        if instance.wait_timeout(KILL_WAIT).is_none() {
            log::warn!("data plane (pid={}) was not reaped after SIGKILL", instance.pid);
        }
        StopOutcome::Killed
    }

    fn clear_if_current(&self, id: u64) {
        let mut slot = lock(&self.slot);
        if matches!(&*slot, Slot::Running(i) if i.id == id) {
            *slot = Slot::Stopped;
            fs::remove_file(&self.pid_path).ok();
        }
    }

    /// Last lines of the data-plane log, for error reports
    pub fn log_tail(&self) -> String {
        read_tail(&self.log_path, LOG_TAIL_BYTES).unwrap_or_default()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_log(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}

fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).trim().to_string())
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> std::result::Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: bool) -> std::result::Result<(), String> {
    Err("process signals are not supported on this platform".to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn supervisor(root: &Path, script: &str, probe_ms: u64) -> ProcessSupervisor {
        let layout = StateLayout::new(root, None, None);
        let section = DataPlaneSection {
            binary: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "sing-box".to_string(),
                CONFIG_PLACEHOLDER.to_string(),
            ],
            stop_grace_ms: 300,
            startup_probe_ms: probe_ms,
            auto_start: false,
        };
        ProcessSupervisor::new(&section, &layout)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    #[test]
    fn test_command_args_fill_config_path() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "true", 0);
        let args = sup.command_args();
        assert_eq!(args[3], dir.path().join("server.json").display().to_string());
    }

    #[test]
    fn test_start_stop_cycle() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "exec sleep 30", 100);

        let pid = match sup.start().unwrap() {
            StartOutcome::Started { pid } => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(sup.state(), ProcessState::Running { pid });
        assert_eq!(
            fs::read_to_string(dir.path().join("sing-box.pid")).unwrap().trim(),
            pid.to_string()
        );

        // Second start is a no-op
        assert_eq!(sup.start().unwrap(), StartOutcome::AlreadyRunning { pid });

        assert_eq!(sup.stop(), StopOutcome::Terminated);
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert!(!dir.path().join("sing-box.pid").exists());

        // Stopping again is a no-op
        assert_eq!(sup.stop(), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn test_stop_kills_process_ignoring_sigterm() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "trap '' TERM; while true; do sleep 0.05; done", 100);

        sup.start().unwrap();
        assert_eq!(sup.stop(), StopOutcome::Killed);
        assert!(!sup.is_running());
    }

    #[test]
    fn test_spawn_failure_stays_stopped() {
        let dir = tempdir().unwrap();
        let layout = StateLayout::new(dir.path(), None, None);
        let section = DataPlaneSection {
            binary: dir.path().join("missing-binary").display().to_string(),
            ..DataPlaneSection::default()
        };
        let sup = ProcessSupervisor::new(&section, &layout);

        let err = sup.start().unwrap_err();
        assert!(matches!(err, Error::Process(_)), "unexpected error: {err}");
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_early_exit_reports_output() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "echo 'bad config' >&2; exit 3", 1000);

        let err = sup.start().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"), "{message}");
        assert!(message.contains("bad config"), "{message}");
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_reaper_clears_exited_process() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "sleep 0.3", 0);

        sup.start().unwrap();
        let watch = sup.watch().unwrap();
        let report = watch.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(report.success);
        assert!(wait_until(Duration::from_secs(2), || !sup.is_running()));
        assert_eq!(sup.stop(), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn test_stale_reaper_does_not_clear_new_process() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "exec sleep 30", 0);

        sup.start().unwrap();
        let old = sup.watch().unwrap();
        sup.stop();
        assert!(old.wait(Some(Duration::from_secs(2))).is_some());

        sup.start().unwrap();
        let new_pid = sup.state().pid().unwrap();
        assert_ne!(new_pid, old.pid());

        // Give the old reaper every chance to misbehave
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sup.state(), ProcessState::Running { pid: new_pid });
        sup.stop();
    }

    #[test]
    fn test_log_is_appended() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "echo started; exec sleep 30", 100);

        sup.start().unwrap();
        sup.stop();
        sup.start().unwrap();
        sup.stop();

        let log = fs::read_to_string(dir.path().join("sing-box.log")).unwrap();
        assert_eq!(log.matches("started").count(), 2);
    }

    #[test]
    fn test_concurrent_starts_spawn_once() {
        let dir = tempdir().unwrap();
        let sup = Arc::new(supervisor(dir.path(), "exec sleep 30", 50));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sup = Arc::clone(&sup);
                thread::spawn(move || sup.start().unwrap())
            })
            .collect();
        let outcomes: Vec<StartOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let started: Vec<u32> = outcomes
            .iter()
            .filter_map(|o| match o {
                StartOutcome::Started { pid } => Some(*pid),
                StartOutcome::AlreadyRunning { .. } => None,
            })
            .collect();
        assert_eq!(started.len(), 1, "outcomes: {:?}", outcomes);
        let pid = started[0];
        assert!(outcomes.iter().all(|o| match o {
            StartOutcome::Started { pid: p } | StartOutcome::AlreadyRunning { pid: p } => *p == pid,
        }));

        assert_eq!(sup.stop(), StopOutcome::Terminated);
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_reaped_process_is_not_signalled() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path(), "sleep 0.3", 0);

        sup.start().unwrap();
        let watch = sup.watch().unwrap();
        watch.wait(Some(Duration::from_secs(5))).unwrap();

        // The child has been collected, so its pid is never signalled again
        assert!(lock(&watch.instance.child).is_none());
        assert_eq!(watch.instance.signal(true), Ok(()));
    }

    #[test]
    fn test_check_binary_missing() {
        let dir = tempdir().unwrap();
        let layout = StateLayout::new(dir.path(), None, None);
        let section = DataPlaneSection {
            binary: "definitely-not-a-sing-box-binary".to_string(),
            ..DataPlaneSection::default()
        };
        let sup = ProcessSupervisor::new(&section, &layout);
        assert!(matches!(sup.check_binary(), Err(Error::CommandNotFound(_))));
    }
}
