//! Engine process launch, supervision, and shutdown escalation.
//!
//! [`launch`] turns an [`Engine`] plus [`LaunchOptions`] into a running
//! external process with an established transport: stdio pipes by default, or
//! a WebSocket connection to the endpoint the engine announces on stderr.
//! One automatic retry is performed when an attempt fails with the known
//! nondeterministic dynamic-loader race; any other error, or a second
//! occurrence, propagates.
//!
//! Shutdown goes through [`close_or_kill`]: the graceful-close operation
//! races a timer, and a forced kill fires only if the timer wins. The
//! process record's close notification fires at most once, on any exit.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};

use enginelink_protocol::{IgnoreDefaultArgs, LaunchOptions};

use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::transport::{PipeTransport, TransportParts, WebSocketTransport};

/// Stderr announcement prefix for socket-handshake transport establishment.
const WS_ENDPOINT_PREFIX: &str = "Listening on ";
/// The known glibc loader race signature. An attempt failing with this is
/// recoverable by exactly one retry.
const GLIBC_RACE_MARKER: &str = "Inconsistency detected by ld.so";
/// Handshake budget applied when the caller set no deadline.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// How many recent stderr lines are retained for failure diagnostics.
const RECENT_LOG_CAPACITY: usize = 200;

/// The abstract engine seam: names the executable, computes default
/// arguments, and gets a chance to reinterpret startup failures.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Path of the bundled executable, used when the caller supplies none.
    fn default_executable(&self) -> PathBuf;

    /// Computed default arguments, before the caller's override mode and
    /// extra arguments are applied.
    fn default_args(&self, options: &LaunchOptions, user_data_dir: &Path) -> Vec<String>;

    /// Engine-specific environment adjustments, applied to the override map.
    fn amend_environment(&self, _env: &mut std::collections::HashMap<String, String>) {}

    /// Lets the engine map a raw startup failure to a more precise kind.
    fn rewrite_startup_error(&self, error: Error) -> Error {
        error
    }
}

/// Async hook invoked by the launcher at a fixed point, when present.
pub type LaunchHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Pass-through test hooks; not part of the core contract.
#[derive(Clone, Default)]
pub struct LaunchHooks {
    /// Runs after argument assembly, before process creation.
    pub before_spawn: Option<LaunchHook>,
    /// Runs at the start of [`close_or_kill`], before graceful close.
    pub before_close: Option<LaunchHook>,
}

/// The cooperative shutdown operation for a launched process.
pub type GracefulClose = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Callback fired at most once when the process exits for any reason.
pub type OnClose = Box<dyn FnOnce(ExitStatus) + Send>;

/// How the process exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Which shutdown path won in [`close_or_kill`]. Exactly one per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPath {
    Graceful,
    Killed,
}

/// A running external engine process.
///
/// Exclusively owned by the component that requested the launch, which must
/// be the only caller of its close/kill operations. Temporary directories
/// created for the launch are removed on its close path, never elsewhere.
pub struct LaunchedProcess {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    graceful_close: Mutex<Option<GracefulClose>>,
    before_close: Option<LaunchHook>,
    on_close: Arc<Mutex<Option<OnClose>>>,
    temp_dirs: Mutex<Vec<TempDir>>,
    recent_logs: Arc<Mutex<VecDeque<String>>>,
}

impl LaunchedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Installs the graceful-close operation used by [`close_or_kill`].
    pub fn set_graceful_close(&self, op: GracefulClose) {
        *self.graceful_close.lock() = Some(op);
    }

    /// Registers the at-most-once exit notification. If the process has
    /// already exited, the callback fires immediately.
    pub fn set_on_close(&self, callback: OnClose) {
        // The slot lock is held across the exit check: the supervisor
        // publishes the exit before draining the slot, so an exit observed
        // as None here is guaranteed to fire the stored callback.
        let mut slot = self.on_close.lock();
        let current = self.exit_rx.borrow().clone();
        match current {
            Some(status) => {
                drop(slot);
                callback(status);
            }
            None => *slot = Some(callback),
        }
    }

    /// Requests a forced kill. Failures are swallowed by the supervisor; the
    /// process is presumed gone or unkillable.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Exit status, if the process has already terminated.
    pub fn exited(&self) -> Option<ExitStatus> {
        self.exit_rx.borrow().clone()
    }

    /// Resolves once the OS reports process termination.
    pub async fn wait_for_exit(&self) -> ExitStatus {
        let mut rx = self.exit_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(status) = current {
                return status;
            }
            if rx.changed().await.is_err() {
                // Supervisor gone without publishing; exit details unknown.
                return ExitStatus {
                    code: None,
                    signal: None,
                };
            }
        }
    }

    /// Recent stderr lines, oldest first.
    pub fn recent_logs(&self) -> Vec<String> {
        self.recent_logs.lock().iter().cloned().collect()
    }

    fn cleanup(&self) {
        self.temp_dirs.lock().clear();
    }
}

/// Launches the engine, retrying once if the attempt fails with the known
/// startup race.
pub async fn launch(
    engine: &Arc<dyn Engine>,
    options: &LaunchOptions,
    hooks: &LaunchHooks,
    progress: &Progress,
) -> Result<(LaunchedProcess, TransportParts)> {
    launch_with_retries(progress, || launch_once(engine, options, hooks, progress)).await
}

/// Runs `attempt`, retrying exactly once iff it fails with the tagged
/// startup-race kind. Any other error, or a second occurrence, propagates.
pub async fn launch_with_retries<T, F, Fut>(progress: &Progress, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt().await {
        Ok(value) => Ok(value),
        Err(error) if error.is_startup_race() => {
            progress.log("<restarting engine due to hitting race condition in glibc>");
            tracing::warn!("Engine startup hit the loader race, retrying once");
            attempt().await
        }
        Err(error) => Err(error),
    }
}

async fn launch_once(
    engine: &Arc<dyn Engine>,
    options: &LaunchOptions,
    hooks: &LaunchHooks,
    progress: &Progress,
) -> Result<(LaunchedProcess, TransportParts)> {
    let (executable, bundled) = match &options.executable_path {
        Some(path) => (path.clone(), false),
        None => (engine.default_executable(), true),
    };
    if !executable.exists() {
        return Err(Error::ExecutableNotFound {
            name: engine.name().to_string(),
            path: executable,
            bundled,
        });
    }

    let mut temp_dirs = Vec::new();
    let user_data_dir = match &options.user_data_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = tempfile::Builder::new()
                .prefix("enginelink-user-data-")
                .tempdir()?;
            let path = dir.path().to_path_buf();
            temp_dirs.push(dir);
            path
        }
    };
    if options.downloads_path.is_none() {
        let dir = tempfile::Builder::new()
            .prefix("enginelink-downloads-")
            .tempdir()?;
        temp_dirs.push(dir);
    }

    let args = assemble_args(engine.as_ref(), options, &user_data_dir);

    if let Some(hook) = &hooks.before_spawn {
        hook().await?;
    }

    progress.log(format!(
        "<launching> {} {}",
        executable.display(),
        args.join(" ")
    ));

    let mut command = Command::new(&executable);
    command
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut env = options.env.clone().unwrap_or_default();
    engine.amend_environment(&mut env);
    if options.env.is_some() {
        command.env_clear();
    }
    command.envs(&env);

    let mut child = command
        .spawn()
        .map_err(|e| engine.rewrite_startup_error(classify_spawn_error(&e)))?;
    let pid = child.id();
    tracing::debug!(engine = engine.name(), ?pid, "Spawned engine process");

    let recent_logs = Arc::new(Mutex::new(VecDeque::new()));
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_pump(stderr, progress.clone(), Arc::clone(&recent_logs), line_tx);
    }

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let on_close: Arc<Mutex<Option<OnClose>>> = Arc::new(Mutex::new(None));
    spawn_supervisor(child, exit_tx, kill_rx, Arc::clone(&on_close));

    #[cfg(unix)]
    forward_signals(options, kill_tx.clone());

    // If the wrapping invocation aborts while (or after) we establish the
    // transport, the spawned engine must not outlive it.
    let kill_on_abort = kill_tx.clone();
    let mut exit_on_abort = exit_rx.clone();
    progress.cleanup_when_aborted(move || {
        Box::pin(async move {
            let _ = kill_on_abort.send(());
            loop {
                if exit_on_abort.borrow_and_update().is_some() {
                    return Ok(());
                }
                if exit_on_abort.changed().await.is_err() {
                    return Ok(());
                }
            }
        })
    });

    let process = LaunchedProcess {
        pid,
        kill_tx,
        exit_rx,
        graceful_close: Mutex::new(None),
        before_close: hooks.before_close.clone(),
        on_close,
        temp_dirs: Mutex::new(temp_dirs),
        recent_logs: Arc::clone(&recent_logs),
    };

    let established = if options.use_web_socket {
        match wait_for_endpoint(&mut line_rx, &process, progress, &recent_logs).await {
            Ok(url) => {
                progress.log(format!("<connecting> {url}"));
                WebSocketTransport::connect(&url).await
            }
            Err(error) => Err(error),
        }
    } else {
        match stdin.zip(stdout) {
            Some((stdin, stdout)) => {
                let (pipe, message_rx) = PipeTransport::new(stdin, stdout);
                Ok(pipe.into_transport_parts(message_rx))
            }
            None => Err(Error::LaunchFailed("Engine stdio was not piped".to_string())),
        }
    };
    match established {
        Ok(parts) => Ok((process, parts)),
        Err(error) => {
            // The attempt failed after the spawn: reap the child.
            process.kill();
            process.wait_for_exit().await;
            Err(engine.rewrite_startup_error(error))
        }
    }
}

/// Builds the final argument list from the engine defaults and the caller's
/// override mode. The three modes are mutually exclusive: caller arguments
/// verbatim, defaults minus an exclusion list, or defaults unmodified;
/// caller arguments are appended in the latter two modes.
pub fn assemble_args(
    engine: &dyn Engine,
    options: &LaunchOptions,
    user_data_dir: &Path,
) -> Vec<String> {
    let defaults = engine.default_args(options, user_data_dir);
    let mut args = match &options.ignore_default_args {
        IgnoreDefaultArgs::All => return options.args.clone(),
        IgnoreDefaultArgs::UseDefaults => defaults,
        IgnoreDefaultArgs::These(excluded) => defaults
            .into_iter()
            .filter(|arg| !excluded.contains(arg))
            .collect(),
    };
    args.extend(options.args.iter().cloned());
    args
}

/// Graceful-close/kill escalation.
///
/// The graceful operation races the timer; if the timer fires first, the
/// forced kill runs and we wait for actual process exit before returning.
/// Exactly one of the two paths is reported per call.
pub async fn close_or_kill(process: &LaunchedProcess, timeout: Duration) -> Result<ShutdownPath> {
    if let Some(hook) = &process.before_close {
        if let Err(e) = hook().await {
            tracing::debug!("before_close hook failed (ignored): {e}");
        }
    }
    let graceful = process.graceful_close.lock().take();
    if let Some(op) = graceful {
        let attempt = async {
            if let Err(e) = op().await {
                tracing::debug!("Graceful close failed: {e}");
            }
            process.wait_for_exit().await
        };
        if let Ok(status) = tokio::time::timeout(timeout, attempt).await {
            tracing::debug!(code = ?status.code, "Engine closed gracefully");
            process.cleanup();
            return Ok(ShutdownPath::Graceful);
        }
        tracing::warn!("Graceful close timed out, killing engine process");
    }
    process.kill();
    let status = process.wait_for_exit().await;
    tracing::debug!(code = ?status.code, signal = ?status.signal, "Engine process killed");
    process.cleanup();
    Ok(ShutdownPath::Killed)
}

fn classify_spawn_error(error: &std::io::Error) -> Error {
    let message = error.to_string();
    if message.contains(GLIBC_RACE_MARKER) {
        Error::StartupRace(message)
    } else {
        Error::LaunchFailed(message)
    }
}

fn spawn_stderr_pump(
    stderr: ChildStderr,
    progress: Progress,
    recent_logs: Arc<Mutex<VecDeque<String>>>,
    line_tx: mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            progress.log(format!("[err] {line}"));
            {
                let mut ring = recent_logs.lock();
                if ring.len() == RECENT_LOG_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(line.clone());
            }
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// The supervisor task owns the child: it forwards kill requests, publishes
/// the exit status exactly once, and fires the close notification.
fn spawn_supervisor(
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    on_close: Arc<Mutex<Option<OnClose>>>,
) {
    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                result = child.wait() => match result {
                    Ok(status) => break describe_exit(status),
                    Err(e) => {
                        tracing::warn!("Failed to await engine process: {e}");
                        break ExitStatus { code: None, signal: None };
                    }
                },
                Some(()) = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Kill failed (ignored): {e}");
                    }
                }
            }
        };
        tracing::debug!(code = ?status.code, signal = ?status.signal, "Engine process exited");
        exit_tx.send_replace(Some(status.clone()));
        if let Some(callback) = on_close.lock().take() {
            callback(status);
        }
    });
}

fn describe_exit(status: std::process::ExitStatus) -> ExitStatus {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    ExitStatus {
        code: status.code(),
        signal,
    }
}

/// Forwards OS termination signals toward the child per the caller's flags.
#[cfg(unix)]
fn forward_signals(options: &LaunchOptions, kill_tx: mpsc::UnboundedSender<()>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut kinds = Vec::new();
    if options.handle_sigint {
        kinds.push(SignalKind::interrupt());
    }
    if options.handle_sigterm {
        kinds.push(SignalKind::terminate());
    }
    if options.handle_sighup {
        kinds.push(SignalKind::hangup());
    }
    for kind in kinds {
        let kill_tx = kill_tx.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        let _ = kill_tx.send(());
                    }
                });
            }
            Err(e) => tracing::warn!("Failed to install signal handler: {e}"),
        }
    }
}

/// Waits for the engine's `Listening on <url>` stderr announcement.
async fn wait_for_endpoint(
    line_rx: &mut mpsc::UnboundedReceiver<String>,
    process: &LaunchedProcess,
    progress: &Progress,
    recent_logs: &Arc<Mutex<VecDeque<String>>>,
) -> Result<String> {
    let budget = progress.time_until_deadline();
    let budget = if budget == Duration::MAX {
        DEFAULT_HANDSHAKE_TIMEOUT
    } else {
        budget
    };
    let wait = async {
        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        if let Some(url) = line.strip_prefix(WS_ENDPOINT_PREFIX) {
                            return Ok(url.trim().to_string());
                        }
                    }
                    None => return Err(startup_failure(recent_logs)),
                },
                _ = process.wait_for_exit() => {
                    // Let the stderr pump drain before reading the ring.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return Err(startup_failure(recent_logs));
                }
            }
        }
    };
    match tokio::time::timeout(budget, wait).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "Timeout {}ms exceeded.",
            budget.as_millis()
        ))),
    }
}

fn startup_failure(recent_logs: &Arc<Mutex<VecDeque<String>>>) -> Error {
    let log = recent_logs
        .lock()
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    if log.contains(GLIBC_RACE_MARKER) {
        Error::StartupRace(log)
    } else {
        Error::LaunchFailed(format!(
            "Engine process exited before announcing its endpoint\n{log}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{CallMetadata, ProgressController};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeEngine {
        executable: PathBuf,
        defaults: Vec<String>,
    }

    impl Engine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }
        fn default_executable(&self) -> PathBuf {
            self.executable.clone()
        }
        fn default_args(&self, _options: &LaunchOptions, _user_data_dir: &Path) -> Vec<String> {
            self.defaults.clone()
        }
    }

    fn quiet_options() -> LaunchOptions {
        LaunchOptions {
            handle_sigint: false,
            handle_sigterm: false,
            handle_sighup: false,
            ..Default::default()
        }
    }

    async fn with_progress<T, F, Fut>(f: F) -> Result<T>
    where
        F: FnOnce(Progress) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let controller = ProgressController::new(CallMetadata::new(1, "Engine", "launch"));
        controller.run(None, f).await
    }

    #[test]
    fn assembles_args_in_all_three_modes() {
        let engine = FakeEngine {
            executable: PathBuf::from("/bin/true"),
            defaults: vec!["--a".to_string(), "--b".to_string()],
        };
        let user_data = PathBuf::from("/tmp/ud");

        let mut options = LaunchOptions {
            args: vec!["--user".to_string()],
            ..Default::default()
        };
        assert_eq!(
            assemble_args(&engine, &options, &user_data),
            vec!["--a", "--b", "--user"]
        );

        options.ignore_default_args = IgnoreDefaultArgs::These(vec!["--b".to_string()]);
        assert_eq!(
            assemble_args(&engine, &options, &user_data),
            vec!["--a", "--user"]
        );

        options.ignore_default_args = IgnoreDefaultArgs::All;
        assert_eq!(assemble_args(&engine, &options, &user_data), vec!["--user"]);
    }

    #[tokio::test]
    async fn missing_bundled_executable_suggests_reinstall() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/nonexistent/enginelink-fake"),
            defaults: Vec::new(),
        });
        let options = quiet_options();
        let result = with_progress(|progress| async move {
            launch(&engine, &options, &LaunchHooks::default(), &progress).await
        })
        .await;

        match result {
            Err(Error::ExecutableNotFound { bundled, .. }) => assert!(bundled),
            other => panic!("expected ExecutableNotFound, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn missing_explicit_executable_does_not_suggest_reinstall() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/true"),
            defaults: Vec::new(),
        });
        let options = LaunchOptions {
            executable_path: Some(PathBuf::from("/nonexistent/custom-engine")),
            ..quiet_options()
        };
        let result = with_progress(|progress| async move {
            launch(&engine, &options, &LaunchHooks::default(), &progress).await
        })
        .await;

        match result {
            Err(error @ Error::ExecutableNotFound { bundled: false, .. }) => {
                assert!(!error.to_string().contains("Try re-installing"));
            }
            other => panic!("expected ExecutableNotFound, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn retries_exactly_once_on_startup_race() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = with_progress(|progress| {
            let attempts = Arc::clone(&attempts);
            async move {
                launch_with_retries(&progress, || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(Error::StartupRace("ld.so blew up".to_string()))
                        } else {
                            Ok(7u32)
                        }
                    }
                })
                .await
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_race_occurrence_is_fatal() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = with_progress(|progress| {
            let attempts = Arc::clone(&attempts);
            async move {
                launch_with_retries(&progress, || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Error::StartupRace("ld.so again".to_string()))
                    }
                })
                .await
            }
        })
        .await;

        assert!(result.unwrap_err().is_startup_race());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_launch_errors_do_not_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = with_progress(|progress| {
            let attempts = Arc::clone(&attempts);
            async move {
                launch_with_retries(&progress, || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Error::LaunchFailed("out of memory".to_string()))
                    }
                })
                .await
            }
        })
        .await;

        assert!(matches!(result, Err(Error::LaunchFailed(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn before_spawn_hook_error_aborts_the_launch() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/true"),
            defaults: Vec::new(),
        });
        let hooks = LaunchHooks {
            before_spawn: Some(Arc::new(|| {
                Box::pin(async { Err(Error::LaunchFailed("hook vetoed".to_string())) })
            })),
            before_close: None,
        };
        let options = quiet_options();
        let result = with_progress(|progress| async move {
            launch(&engine, &options, &hooks, &progress).await
        })
        .await;

        match result {
            Err(Error::LaunchFailed(message)) => assert_eq!(message, "hook vetoed"),
            other => panic!("expected LaunchFailed, got {:?}", other.err()),
        }
    }

    #[test]
    fn startup_failure_tags_the_loader_race() {
        let ring = Arc::new(Mutex::new(VecDeque::from([
            "some noise".to_string(),
            "Inconsistency detected by ld.so: dl-something".to_string(),
        ])));
        assert!(startup_failure(&ring).is_startup_race());

        let ring = Arc::new(Mutex::new(VecDeque::from(["plain crash".to_string()])));
        assert!(matches!(startup_failure(&ring), Error::LaunchFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_transport_round_trips_through_a_real_process() {
        // `cat` echoes frames verbatim: stdin -> stdout.
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/cat"),
            defaults: Vec::new(),
        });
        let options = quiet_options();
        let engine_clone = Arc::clone(&engine);
        let (process, mut parts) = with_progress(|progress| async move {
            launch(&engine_clone, &options, &LaunchHooks::default(), &progress).await
        })
        .await
        .unwrap();
        assert!(process.pid().is_some());

        let mut receiver = parts.receiver;
        let driver = tokio::spawn(async move { receiver.run().await });

        let message = json!({"id": 1, "method": "ping", "params": {}});
        parts.sender.send(message.clone()).await.unwrap();
        let echoed = parts.message_rx.recv().await.unwrap();
        assert_eq!(echoed, message);

        // No graceful-close operation installed: escalation kills.
        let path = close_or_kill(&process, Duration::from_secs(5)).await.unwrap();
        assert_eq!(path, ShutdownPath::Killed);
        driver.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_close_wins_when_it_finishes_in_time() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/cat"),
            defaults: Vec::new(),
        });
        let options = quiet_options();
        let engine_clone = Arc::clone(&engine);
        let (process, parts) = with_progress(|progress| async move {
            launch(&engine_clone, &options, &LaunchHooks::default(), &progress).await
        })
        .await
        .unwrap();

        let temp_paths: Vec<PathBuf> = process
            .temp_dirs
            .lock()
            .iter()
            .map(|dir| dir.path().to_path_buf())
            .collect();
        assert!(!temp_paths.is_empty());
        assert!(temp_paths.iter().all(|path| path.exists()));

        // Dropping the transport closes stdin, which makes `cat` exit 0.
        let parts_slot = Arc::new(Mutex::new(Some(parts)));
        let slot = Arc::clone(&parts_slot);
        process.set_graceful_close(Box::new(move || {
            let parts = slot.lock().take();
            Box::pin(async move {
                drop(parts);
                Ok(())
            })
        }));

        let path = close_or_kill(&process, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(path, ShutdownPath::Graceful);
        assert_eq!(process.exited().unwrap().code, Some(0));
        assert!(temp_paths.iter().all(|path| !path.exists()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_path_fires_when_graceful_close_stalls() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/cat"),
            defaults: Vec::new(),
        });
        let options = quiet_options();
        let engine_clone = Arc::clone(&engine);
        let (process, parts) = with_progress(|progress| async move {
            launch(&engine_clone, &options, &LaunchHooks::default(), &progress).await
        })
        .await
        .unwrap();

        // A graceful close that never makes the process exit.
        process.set_graceful_close(Box::new(|| Box::pin(async { Ok(()) })));

        let path = close_or_kill(&process, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(path, ShutdownPath::Killed);
        let status = process.exited().unwrap();
        assert_eq!(status.signal, Some(9));
        drop(parts);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_notification_fires_once_with_the_exit_code() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/sh"),
            defaults: vec!["-c".to_string(), "exit 3".to_string()],
        });
        let options = quiet_options();
        let engine_clone = Arc::clone(&engine);
        let (process, _parts) = with_progress(|progress| async move {
            launch(&engine_clone, &options, &LaunchHooks::default(), &progress).await
        })
        .await
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        process.set_on_close(Box::new(move |status| {
            let _ = tx.send(status);
        }));

        let status = rx.await.unwrap();
        assert_eq!(status.code, Some(3));
        assert_eq!(status.signal, None);
        assert_eq!(process.wait_for_exit().await, status);
    }

    #[cfg(unix)]
    fn pid_is_running(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_launch_does_not_leak_the_child() {
        // The child records its pid, never announces an endpoint, and would
        // run forever; the deadline forces the launch attempt to fail.
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/sh"),
            defaults: vec![
                "-c".to_string(),
                format!("echo $$ > {}; exec sleep 1000", pid_file.display()),
            ],
        });
        let options = LaunchOptions {
            use_web_socket: true,
            ..quiet_options()
        };

        let controller = ProgressController::new(CallMetadata::new(1, "Engine", "launch"));
        let result = controller
            .run(Some(Duration::from_millis(500)), |progress| async move {
                launch(&engine, &options, &LaunchHooks::default(), &progress).await
            })
            .await;
        assert!(result.is_err());

        let mut reaped = false;
        for _ in 0..50 {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                if !pid_is_running(pid) {
                    reaped = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(reaped, "child process survived the failed launch attempt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn on_close_registered_after_exit_fires_immediately() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/sh"),
            defaults: vec!["-c".to_string(), "exit 0".to_string()],
        });
        let options = quiet_options();
        let engine_clone = Arc::clone(&engine);
        let (process, _parts) = with_progress(|progress| async move {
            launch(&engine_clone, &options, &LaunchHooks::default(), &progress).await
        })
        .await
        .unwrap();

        process.wait_for_exit().await;
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_callback = Arc::clone(&fired);
        process.set_on_close(Box::new(move |status| {
            assert_eq!(status.code, Some(0));
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn websocket_mode_surfaces_the_race_from_stderr() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine {
            executable: PathBuf::from("/bin/sh"),
            defaults: vec![
                "-c".to_string(),
                "echo 'Inconsistency detected by ld.so: boom' 1>&2; exit 127".to_string(),
            ],
        });
        let options = LaunchOptions {
            use_web_socket: true,
            ..quiet_options()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_hook = Arc::clone(&attempts);
        let hooks = LaunchHooks {
            before_spawn: Some(Arc::new(move || {
                attempts_in_hook.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            })),
            before_close: None,
        };

        let result = with_progress(|progress| async move {
            launch(&engine, &options, &hooks, &progress).await
        })
        .await;

        assert!(result.err().unwrap().is_startup_race());
        // Both the original attempt and the single retry ran.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
