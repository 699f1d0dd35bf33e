//! Device-Code Login Sessions
//!
//! `az login --use-device-code` prints a URL and a one-time code, then blocks
//! until the user completes the browser flow. The caller needs the code
//! within seconds, so [`LoginSessionManager::login`] scans the merged output
//! for a bounded time, returns as soon as the code is visible, and hands the
//! still-running process to a detached drain task.
//!
//! # Session lifecycle
//!
//! ```text
//! Idle -> Starting -> Reading -> {EarlyReturn | Exhausted} -> (session cleared)
//!                                       |
//!                                       v
//!                                 BackgroundDrain -> Done
//! ```
//!
//! At most one login process is referenced by the session. A new login
//! terminates the referenced process (SIGTERM, grace period, then a single
//! kill) before spawning its own. The swap runs under the session mutex; the
//! scan does not, so a newer login can supersede one that is still scanning.

use super::error::ExecutionError;
use super::executor::CommandExecutor;
use super::process::{
    ChildProcess, ProcessHandle, ProcessReader, ProcessSpawner, ProcessWriter, SpawnRequest,
};
use super::timeout::ExecutionTimeout;
use super::validator::{ValidatedCommand, ValidationError};
use crate::metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Substrings (lowercase) marking a line as part of the device-code prompt
pub const DEVICE_CODE_KEYWORDS: [&str; 7] = [
    "device",
    "code",
    "browser",
    "authenticate",
    "https://",
    "to sign in",
    "microsoft.com",
];

/// Returned when a login produced no output at all
pub const LOGIN_STARTED_MESSAGE: &str =
    "Device code authentication started. Please check Azure CLI output.";

pub const SUPERSEDED_MESSAGE: &str = "Error: Login superseded by a newer login request";

const USE_DEVICE_CODE: &str = "--use-device-code";

/// Flags removed without a value
const STRIPPED_SWITCHES: [&str; 2] = [USE_DEVICE_CODE, "--service-principal"];

/// Flags removed together with the value that follows them
const STRIPPED_VALUE_FLAGS: [&str; 6] = ["--username", "-u", "--password", "-p", "--tenant", "-t"];

const LINE_CHANNEL_CAPACITY: usize = 256;

/// Tuning for the login scan
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// Time a superseded process gets to exit after SIGTERM
    pub grace_period: Duration,

    /// Maximum wait for a single output line
    pub line_timeout: Duration,

    /// Read attempts before the scan gives up; timeouts count
    pub max_scan_lines: usize,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            line_timeout: Duration::from_secs(1),
            max_scan_lines: 30,
        }
    }
}

/// Where a login invocation ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPhase {
    /// Enough device-code output arrived before the process finished
    EarlyReturn,
    /// Output ended and the process exited successfully (or is draining)
    Exhausted,
    /// Attempt budget spent while the process kept running
    BudgetSpent,
    /// Spawn failure or non-zero exit
    Failed,
    /// A newer login cancelled this one
    Superseded,
}

impl LoginPhase {
    fn label(self) -> &'static str {
        match self {
            Self::EarlyReturn => "early_return",
            Self::Exhausted => "exhausted",
            Self::BudgetSpent => "budget_spent",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
        }
    }
}

/// Result of one login invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Caller-facing text; failures start with `Error: `
    pub text: String,
    pub phase: LoginPhase,
    /// The process was handed to a background drain
    pub detached: bool,
}

impl LoginOutcome {
    fn new(text: impl Into<String>, phase: LoginPhase, detached: bool) -> Self {
        Self {
            text: text.into(),
            phase,
            detached,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.phase, LoginPhase::Failed | LoginPhase::Superseded)
    }
}

/// Service-principal credentials for non-interactive login
#[derive(Clone)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

impl ServicePrincipal {
    fn command(&self) -> ValidatedCommand {
        let argv = [
            "az",
            "login",
            "--service-principal",
            "--tenant",
            self.tenant_id.as_str(),
            "--username",
            self.client_id.as_str(),
            "--password",
            self.client_secret.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let display = format!(
            "az login --service-principal --tenant {} --username {} --password ***",
            self.tenant_id, self.client_id
        );
        ValidatedCommand::trusted(argv, display)
    }
}

/// Is this line part of the device-code prompt?
pub fn is_device_code_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    DEVICE_CODE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Rewrite any `az login` into its device-code form
///
/// Credential and mode flags are dropped (with their values) and exactly one
/// `--use-device-code` is appended. The result goes through validation again.
pub fn normalize_login_command(
    command: &ValidatedCommand,
) -> Result<ValidatedCommand, ValidationError> {
    let mut kept: Vec<&str> = Vec::with_capacity(command.argv().len() + 1);
    let mut args = command.argv().iter().map(String::as_str);

    while let Some(arg) = args.next() {
        if STRIPPED_SWITCHES.contains(&arg) {
            continue;
        }
        if STRIPPED_VALUE_FLAGS.contains(&arg) {
            args.next();
            continue;
        }
        let is_assignment = arg
            .split_once('=')
            .map(|(flag, _)| STRIPPED_VALUE_FLAGS.contains(&flag) || STRIPPED_SWITCHES.contains(&flag))
            .unwrap_or(false);
        if is_assignment {
            continue;
        }
        kept.push(arg);
    }
    kept.push(USE_DEVICE_CODE);

    let text = shlex::try_join(kept).map_err(|_| ValidationError::Malformed)?;
    ValidatedCommand::reparse(&text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputLine {
    stream: OutputStream,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Starting,
    Reading,
}

struct LoginSession {
    current: Option<Weak<LoginProcess>>,
    state: SessionState,
}

impl LoginSession {
    fn references(&self, process: &Arc<LoginProcess>) -> bool {
        self.current
            .as_ref()
            .map(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(process)))
            .unwrap_or(false)
    }

    fn clear(&mut self) {
        self.current = None;
        self.state = SessionState::Idle;
    }
}

struct LoginProcess {
    id: u64,
    pid: Option<u32>,
    child: Mutex<Box<dyn ChildProcess>>,
    superseded: AtomicBool,
}

/// Lines seen during one scan
#[derive(Default)]
struct LineScan {
    output: Vec<String>,
    relevant: Vec<String>,
    saw_url: bool,
}

impl LineScan {
    fn push(&mut self, line: String) {
        if is_device_code_line(&line) {
            if line.to_lowercase().contains("https://") {
                self.saw_url = true;
            }
            self.relevant.push(line.clone());
        }
        self.output.push(line);
    }

    /// Enough to hand back to the caller
    fn ready(&self) -> bool {
        self.relevant.len() >= 2 || self.saw_url
    }

    fn relevant_text(&self) -> String {
        self.relevant.join("\n")
    }

    fn output_text(&self) -> String {
        self.output.join("\n")
    }

    /// Relevant lines, else everything, else the generic message
    fn best_text(&self) -> String {
        if !self.relevant.is_empty() {
            self.relevant_text()
        } else if !self.output.is_empty() {
            self.output_text()
        } else {
            LOGIN_STARTED_MESSAGE.to_string()
        }
    }
}

enum ScanEnd {
    EarlyReturn,
    EndOfStream,
    BudgetSpent,
}

/// Owner of the single interactive login session
pub struct LoginSessionManager {
    spawner: Arc<dyn ProcessSpawner>,
    config: LoginConfig,
    session: Mutex<LoginSession>,
    next_id: AtomicU64,
    active_drains: Arc<AtomicUsize>,
}

impl LoginSessionManager {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: LoginConfig) -> Self {
        Self {
            spawner,
            config,
            session: Mutex::new(LoginSession {
                current: None,
                state: SessionState::Idle,
            }),
            next_id: AtomicU64::new(1),
            active_drains: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &LoginConfig {
        &self.config
    }

    /// Number of detached drain tasks still running
    pub fn active_drains(&self) -> usize {
        self.active_drains.load(Ordering::SeqCst)
    }

    /// Whether a login process is currently referenced by the session
    pub async fn has_active_session(&self) -> bool {
        let session = self.session.lock().await;
        session
            .current
            .as_ref()
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Run a device-code login and return the text the user needs
    ///
    /// Never fails: every negative outcome is an `Error: ` text in the
    /// returned [`LoginOutcome`].
    pub async fn login(&self, command: &ValidatedCommand) -> LoginOutcome {
        let outcome = self.run_device_code(command).await;
        metrics::LOGIN_SESSIONS_TOTAL
            .with_label_values(&[outcome.phase.label()])
            .inc();
        info!(
            phase = outcome.phase.label(),
            detached = outcome.detached,
            "Login request finished"
        );
        outcome
    }

    async fn run_device_code(&self, command: &ValidatedCommand) -> LoginOutcome {
        let normalized = match normalize_login_command(command) {
            Ok(normalized) => normalized,
            Err(e) => return start_failure(e),
        };

        let request = SpawnRequest::new(normalized)
            .with_stdin()
            .with_env("PYTHONUNBUFFERED", "1")
            .detachable();

        let (process, mut lines, stdin) = match self.replace_session(request).await {
            Ok(started) => started,
            Err(e) => return start_failure(e),
        };

        let mut scan = LineScan::default();
        let line_timeout = ExecutionTimeout::new(self.config.line_timeout);
        let mut attempts = 0;
        let scan_end = loop {
            if attempts == self.config.max_scan_lines {
                break ScanEnd::BudgetSpent;
            }
            attempts += 1;

            match line_timeout.race(lines.recv()).await {
                Some(Some(line)) => {
                    if line.text.is_empty() {
                        continue;
                    }
                    debug!(login = process.id, stream = ?line.stream, "{}", line.text);
                    scan.push(line.text);
                    if scan.ready() {
                        break ScanEnd::EarlyReturn;
                    }
                }
                Some(None) => break ScanEnd::EndOfStream,
                None if !scan.relevant.is_empty() => break ScanEnd::EarlyReturn,
                None => debug!(login = process.id, attempt = attempts, "No login output yet"),
            }
        };

        match scan_end {
            ScanEnd::EarlyReturn => {
                self.detach(process.clone(), lines, stdin);
                self.finish(&process).await;
                LoginOutcome::new(scan.relevant_text(), LoginPhase::EarlyReturn, true)
            }
            ScanEnd::BudgetSpent => {
                warn!(
                    login = process.id,
                    attempts, "Login output scan budget spent, draining in background"
                );
                self.detach(process.clone(), lines, stdin);
                self.finish(&process).await;
                LoginOutcome::new(scan.best_text(), LoginPhase::BudgetSpent, true)
            }
            ScanEnd::EndOfStream => self.conclude(process, lines, stdin, scan).await,
        }
    }

    /// Output ended: settle on the exit status
    async fn conclude(
        &self,
        process: Arc<LoginProcess>,
        lines: mpsc::Receiver<OutputLine>,
        stdin: Option<ProcessWriter>,
        scan: LineScan,
    ) -> LoginOutcome {
        let grace = ExecutionTimeout::new(self.config.grace_period);
        let exit = {
            let mut child = process.child.lock().await;
            grace.race(child.wait()).await
        };

        let exit = match exit {
            Some(Ok(exit)) => exit,
            Some(Err(e)) => {
                self.finish(&process).await;
                return LoginOutcome::new(
                    format!("Error: Login failed ({})", e),
                    LoginPhase::Failed,
                    false,
                );
            }
            None => {
                debug!(login = process.id, "Output closed but process still running");
                self.detach(process.clone(), lines, stdin);
                self.finish(&process).await;
                return LoginOutcome::new(scan.best_text(), LoginPhase::Exhausted, true);
            }
        };

        self.finish(&process).await;
        drop(stdin);

        if process.superseded.load(Ordering::SeqCst) {
            return LoginOutcome::new(SUPERSEDED_MESSAGE, LoginPhase::Superseded, false);
        }

        if exit.success() {
            LoginOutcome::new(scan.best_text(), LoginPhase::Exhausted, false)
        } else {
            let output = scan.output_text();
            let text = if output.is_empty() {
                format!("Error: Login failed ({})", exit)
            } else {
                format!("Error: Login failed ({}): {}", exit, output)
            };
            LoginOutcome::new(text, LoginPhase::Failed, false)
        }
    }

    /// Cancel the referenced process (if any), spawn, and take the slot
    async fn replace_session(
        &self,
        request: SpawnRequest,
    ) -> Result<
        (
            Arc<LoginProcess>,
            mpsc::Receiver<OutputLine>,
            Option<ProcessWriter>,
        ),
        ExecutionError,
    > {
        let mut session = self.session.lock().await;
        debug!(state = ?session.state, "Acquired login session");
        session.state = SessionState::Starting;

        if let Some(previous) = session.current.take().and_then(|weak| weak.upgrade()) {
            self.cancel(&previous).await;
        }

        let ProcessHandle {
            child,
            stdin,
            stdout,
            stderr,
        } = match self.spawner.spawn(request) {
            Ok(handle) => handle,
            Err(e) => {
                session.clear();
                return Err(e);
            }
        };

        let process = Arc::new(LoginProcess {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            pid: child.id(),
            child: Mutex::new(child),
            superseded: AtomicBool::new(false),
        });
        info!(login = process.id, pid = ?process.pid, "Started device-code login");

        let lines = merge_streams(stdout, stderr);
        session.current = Some(Arc::downgrade(&process));
        session.state = SessionState::Reading;

        Ok((process, lines, stdin))
    }

    /// Terminate a running login: SIGTERM, grace period, then one kill
    async fn cancel(&self, process: &LoginProcess) {
        let mut child = process.child.lock().await;

        match child.try_wait() {
            Ok(Some(exit)) => {
                debug!(login = process.id, %exit, "Previous login already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(login = process.id, "Failed to poll previous login: {}", e),
        }

        process.superseded.store(true, Ordering::SeqCst);
        metrics::LOGINS_SUPERSEDED_TOTAL.inc();
        info!(login = process.id, pid = ?process.pid, "Terminating superseded login");

        if let Err(e) = child.terminate() {
            warn!(login = process.id, "Failed to signal previous login: {}", e);
        }

        match ExecutionTimeout::new(self.config.grace_period)
            .race(child.wait())
            .await
        {
            Some(Ok(exit)) => debug!(login = process.id, %exit, "Superseded login exited"),
            Some(Err(e)) => warn!(login = process.id, "Waiting on superseded login failed: {}", e),
            None => {
                warn!(
                    login = process.id,
                    grace = ?self.config.grace_period,
                    "Superseded login ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(login = process.id, "Failed to kill previous login: {}", e);
                }
            }
        }
    }

    /// Clear the session if it still references this process
    async fn finish(&self, process: &Arc<LoginProcess>) {
        let mut session = self.session.lock().await;
        if session.references(process) {
            session.clear();
        }
    }

    /// Hand the process and the rest of its output to a background task
    fn detach(
        &self,
        process: Arc<LoginProcess>,
        mut lines: mpsc::Receiver<OutputLine>,
        stdin: Option<ProcessWriter>,
    ) {
        let drains = self.active_drains.clone();
        drains.fetch_add(1, Ordering::SeqCst);
        metrics::ACTIVE_DRAINS.inc();

        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if !line.text.is_empty() {
                    debug!(login = process.id, stream = ?line.stream, "{}", line.text);
                }
            }
            drop(stdin);

            let status = process.child.lock().await.wait().await;
            match status {
                Ok(exit) if exit.success() => {
                    info!(login = process.id, "Background login completed successfully")
                }
                Ok(exit) => warn!(login = process.id, %exit, "Background login ended"),
                Err(e) => warn!(login = process.id, "Waiting on background login failed: {}", e),
            }

            drains.fetch_sub(1, Ordering::SeqCst);
            metrics::ACTIVE_DRAINS.dec();
        });
    }

    /// Log in with a service principal, superseding any device-code login
    ///
    /// Runs to completion under `timeout` while holding the session, so
    /// device-code logins queue behind it.
    pub async fn login_service_principal(
        &self,
        credentials: &ServicePrincipal,
        timeout: Duration,
    ) -> Result<String, ExecutionError> {
        let command = credentials.command();
        let mut session = self.session.lock().await;
        session.state = SessionState::Starting;

        if let Some(previous) = session.current.take().and_then(|weak| weak.upgrade()) {
            self.cancel(&previous).await;
        }
        info!(command = %command, "Logging in with service principal");

        let executor = CommandExecutor::with_spawner(self.spawner.clone());
        let result = executor.run_with_timeout(&command, timeout).await;
        session.clear();

        let phase = if result.is_ok() { "service_principal" } else { "failed" };
        metrics::LOGIN_SESSIONS_TOTAL.with_label_values(&[phase]).inc();
        result
    }
}

fn start_failure(error: impl Into<StartError>) -> LoginOutcome {
    let detail = match error.into() {
        StartError::Spawn(ExecutionError::SpawnFailed(detail)) => detail,
        StartError::Spawn(other) => other.to_string(),
        StartError::Normalize(e) => e.to_string(),
    };
    warn!("Failed to start login process: {}", detail);
    LoginOutcome::new(
        format!("Error: Failed to start login process - {}", detail),
        LoginPhase::Failed,
        false,
    )
}

enum StartError {
    Spawn(ExecutionError),
    Normalize(ValidationError),
}

impl From<ExecutionError> for StartError {
    fn from(e: ExecutionError) -> Self {
        Self::Spawn(e)
    }
}

impl From<ValidationError> for StartError {
    fn from(e: ValidationError) -> Self {
        Self::Normalize(e)
    }
}

/// Forward both streams, line by line, into one channel
fn merge_streams(
    stdout: Option<ProcessReader>,
    stderr: Option<ProcessReader>,
) -> mpsc::Receiver<OutputLine> {
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    for (stream, reader) in [(OutputStream::Stdout, stdout), (OutputStream::Stderr, stderr)] {
        if let Some(reader) = reader {
            tokio::spawn(forward_lines(stream, reader, tx.clone()));
        }
    }
    rx
}

async fn forward_lines(stream: OutputStream, reader: ProcessReader, tx: mpsc::Sender<OutputLine>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).trim().to_string();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(?stream, "Login output read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{eventually, MockEvent, MockScript, MockSpawner};
    use crate::tools::CommandValidator;

    const URL_LINE: &str = "To sign in, use a web browser to open the page https://microsoft.com/devicelogin and enter the code ABCD1234 to authenticate.";

    fn command(text: &str) -> ValidatedCommand {
        CommandValidator::new().validate(text).unwrap()
    }

    fn fast_config() -> LoginConfig {
        LoginConfig {
            grace_period: Duration::from_millis(200),
            line_timeout: Duration::from_millis(50),
            max_scan_lines: 30,
        }
    }

    fn manager(spawner: Arc<MockSpawner>) -> LoginSessionManager {
        LoginSessionManager::new(spawner, fast_config())
    }

    #[test]
    fn test_device_code_keywords() {
        assert!(is_device_code_line(URL_LINE));
        assert!(is_device_code_line("Enter the CODE shown"));
        assert!(is_device_code_line("Open your Browser"));
        assert!(!is_device_code_line("Retrieving tenants and subscriptions"));
        assert!(!is_device_code_line(""));
    }

    #[test]
    fn test_normalize_plain_login() {
        let normalized = normalize_login_command(&command("az login")).unwrap();
        assert_eq!(normalized.as_str(), "az login --use-device-code");
    }

    #[test]
    fn test_normalize_strips_credentials() {
        let normalized = normalize_login_command(&command(
            "az login --service-principal -u app-id --password s3cret --tenant contoso.onmicrosoft.com",
        ))
        .unwrap();
        assert_eq!(normalized.as_str(), "az login --use-device-code");
    }

    #[test]
    fn test_normalize_keeps_other_flags_and_single_device_flag() {
        let normalized = normalize_login_command(&command(
            "az login --use-device-code --allow-no-subscriptions --use-device-code -t tenant-1",
        ))
        .unwrap();
        assert_eq!(
            normalized.argv(),
            ["az", "login", "--allow-no-subscriptions", "--use-device-code"]
        );
    }

    #[test]
    fn test_normalize_strips_assignment_forms() {
        let normalized =
            normalize_login_command(&command("az login --username=me --tenant=t1 --scope 'a b'"))
                .unwrap();
        assert_eq!(
            normalized.argv(),
            ["az", "login", "--scope", "a b", "--use-device-code"]
        );
    }

    #[test]
    fn test_service_principal_command_redacts_secret() {
        let sp = ServicePrincipal {
            tenant_id: "tenant".into(),
            client_id: "client".into(),
            client_secret: "p@ss;word".into(),
        };
        let cmd = sp.command();
        assert!(cmd.argv().contains(&"p@ss;word".to_string()));
        assert!(!cmd.as_str().contains("p@ss;word"));
        assert!(cmd.as_str().ends_with("--password ***"));
        assert!(!format!("{:?}", sp).contains("p@ss;word"));
    }

    #[tokio::test]
    async fn test_early_return_before_exit() {
        let spawner = MockSpawner::new(vec![MockScript::lines(&[
            "To sign in, use a web browser",
            URL_LINE,
        ])
        .hanging()]);
        let manager = manager(spawner.clone());

        let outcome = manager.login(&command("az login")).await;

        assert_eq!(outcome.phase, LoginPhase::EarlyReturn);
        assert!(outcome.detached);
        assert_eq!(
            outcome.text,
            format!("To sign in, use a web browser\n{}", URL_LINE)
        );
        assert_eq!(spawner.spawned_commands(), vec!["az login --use-device-code"]);

        // The process is still running, owned by the drain
        let control = spawner.control(0);
        assert!(control.exit_status().is_none());
        assert_eq!(manager.active_drains(), 1);
        assert!(!manager.has_active_session().await);

        control.finish(0);
        assert!(eventually(Duration::from_secs(2), || manager.active_drains() == 0).await);
        assert!(control.wait_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_spawn_request_shape() {
        let spawner = MockSpawner::new(vec![MockScript::lines(&[URL_LINE]).hanging()]);
        let manager = manager(spawner.clone());

        manager.login(&command("az login")).await;

        let request = &spawner.spawned_requests()[0];
        assert!(request.pipe_stdin);
        assert!(!request.kill_on_drop);
        assert!(request
            .env
            .contains(&("PYTHONUNBUFFERED".to_string(), "1".to_string())));
        spawner.control(0).finish(0);
    }

    #[tokio::test]
    async fn test_single_relevant_line_then_timeout() {
        let spawner = MockSpawner::new(vec![MockScript::lines(&[
            "WARNING: Enter the code XYZ987",
        ])
        .hanging()]);
        let manager = manager(spawner.clone());

        let outcome = manager.login(&command("az login")).await;

        assert_eq!(outcome.phase, LoginPhase::EarlyReturn);
        assert_eq!(outcome.text, "WARNING: Enter the code XYZ987");
        spawner.control(0).finish(0);
    }

    #[tokio::test]
    async fn test_stderr_lines_are_merged() {
        let spawner = MockSpawner::new(vec![MockScript::default()
            .with_stderr(&format!("{}\n", URL_LINE))
            .hanging()]);
        let manager = manager(spawner.clone());

        let outcome = manager.login(&command("az login")).await;

        assert_eq!(outcome.phase, LoginPhase::EarlyReturn);
        assert_eq!(outcome.text, URL_LINE);
        spawner.control(0).finish(0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_before_relevant_output() {
        let spawner = MockSpawner::new(vec![
            MockScript::lines(&["ERROR: AADSTS900023 tenant not found"]).exiting_with(1),
        ]);
        let manager = manager(spawner.clone());

        let outcome = manager.login(&command("az login")).await;

        assert_eq!(outcome.phase, LoginPhase::Failed);
        assert!(!outcome.detached);
        assert_eq!(
            outcome.text,
            "Error: Login failed (exit code 1): ERROR: AADSTS900023 tenant not found"
        );
        assert_eq!(manager.active_drains(), 0);
        assert!(!manager.has_active_session().await);
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_output() {
        let spawner = MockSpawner::new(vec![MockScript::default().exiting_with(2)]);
        let manager = manager(spawner);

        let outcome = manager.login(&command("az login")).await;
        assert_eq!(outcome.text, "Error: Login failed (exit code 2)");
    }

    #[tokio::test]
    async fn test_clean_exit_without_output() {
        let spawner = MockSpawner::new(vec![MockScript::default()]);
        let manager = manager(spawner);

        let outcome = manager.login(&command("az login")).await;
        assert_eq!(outcome.phase, LoginPhase::Exhausted);
        assert_eq!(outcome.text, LOGIN_STARTED_MESSAGE);
    }

    #[tokio::test]
    async fn test_clean_exit_returns_all_output_when_nothing_relevant() {
        let spawner = MockSpawner::new(vec![MockScript::lines(&["", "Logged in", "   "])]);
        let manager = manager(spawner);

        let outcome = manager.login(&command("az login")).await;
        assert_eq!(outcome.phase, LoginPhase::Exhausted);
        assert_eq!(outcome.text, "Logged in");
    }

    #[tokio::test]
    async fn test_budget_spent_hands_off_to_drain() {
        let spawner = MockSpawner::new(vec![MockScript::lines(&["Retrieving tenants"]).hanging()]);
        let manager = LoginSessionManager::new(
            spawner.clone(),
            LoginConfig {
                max_scan_lines: 3,
                ..fast_config()
            },
        );

        let outcome = manager.login(&command("az login")).await;

        assert_eq!(outcome.phase, LoginPhase::BudgetSpent);
        assert!(outcome.detached);
        assert_eq!(outcome.text, "Retrieving tenants");
        assert_eq!(manager.active_drains(), 1);

        spawner.control(0).finish(0);
        assert!(eventually(Duration::from_secs(2), || manager.active_drains() == 0).await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spawner = MockSpawner::new(vec![MockScript::failing_spawn("az: not found")]);
        let manager = manager(spawner.clone());

        let outcome = manager.login(&command("az login")).await;

        assert_eq!(outcome.phase, LoginPhase::Failed);
        assert_eq!(outcome.text, "Error: Failed to start login process - az: not found");
        assert!(!manager.has_active_session().await);
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_supersession_terminates_before_spawn() {
        let spawner = MockSpawner::new(vec![
            MockScript::lines(&["Retrieving tenants"]).hanging(),
            MockScript::lines(&[URL_LINE]).hanging(),
        ]);
        let manager = Arc::new(LoginSessionManager::new(
            spawner.clone(),
            LoginConfig {
                max_scan_lines: 40,
                ..fast_config()
            },
        ));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.login(&command("az login")).await }
        });
        assert!(eventually(Duration::from_secs(2), || spawner.spawn_count() == 1).await);

        let second = manager.login(&command("az login")).await;
        let first = first.await.unwrap();

        assert_eq!(
            spawner.events()[..3],
            [MockEvent::Spawned(0), MockEvent::Terminated(0), MockEvent::Spawned(1)]
        );
        assert_eq!(first.phase, LoginPhase::Superseded);
        assert_eq!(first.text, SUPERSEDED_MESSAGE);
        assert_eq!(second.phase, LoginPhase::EarlyReturn);
        assert_eq!(second.text, URL_LINE);
        assert_eq!(spawner.control(0).kill_calls.load(Ordering::SeqCst), 0);

        spawner.control(1).finish(0);
    }

    #[tokio::test]
    async fn test_forced_kill_exactly_once() {
        let spawner = MockSpawner::new(vec![
            MockScript::lines(&["Retrieving tenants"]).hanging().ignoring_sigterm(),
            MockScript::lines(&[URL_LINE]).hanging(),
        ]);
        let manager = Arc::new(LoginSessionManager::new(
            spawner.clone(),
            LoginConfig {
                max_scan_lines: 40,
                ..fast_config()
            },
        ));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.login(&command("az login")).await }
        });
        assert!(eventually(Duration::from_secs(2), || spawner.spawn_count() == 1).await);

        let second = manager.login(&command("az login")).await;
        let first = first.await.unwrap();

        assert_eq!(
            spawner.events()[..4],
            [
                MockEvent::Spawned(0),
                MockEvent::Terminated(0),
                MockEvent::Killed(0),
                MockEvent::Spawned(1)
            ]
        );
        let control = spawner.control(0);
        assert_eq!(control.terminate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(control.kill_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.phase, LoginPhase::Superseded);
        assert_eq!(second.phase, LoginPhase::EarlyReturn);

        spawner.control(1).finish(0);
    }

    #[tokio::test]
    async fn test_exited_process_is_not_signalled() {
        let spawner = MockSpawner::new(vec![
            MockScript::lines(&[URL_LINE]).hanging(),
            MockScript::lines(&[URL_LINE]).hanging(),
        ]);
        let manager = manager(spawner.clone());

        let first = manager.login(&command("az login")).await;
        assert_eq!(first.phase, LoginPhase::EarlyReturn);
        spawner.control(0).finish(0);

        manager.login(&command("az login")).await;

        // Early return cleared the session, nothing to supersede
        assert!(!spawner.events().contains(&MockEvent::Terminated(0)));
        spawner.control(1).finish(0);
    }

    #[tokio::test]
    async fn test_service_principal_login() {
        let spawner = MockSpawner::new(vec![MockScript::stdout("[{\"name\": \"sub\"}]", 0)]);
        let manager = manager(spawner.clone());
        let sp = ServicePrincipal {
            tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
        };

        let output = manager
            .login_service_principal(&sp, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output, "[{\"name\": \"sub\"}]");
        assert_eq!(
            spawner.spawned_requests()[0].command.argv(),
            [
                "az",
                "login",
                "--service-principal",
                "--tenant",
                "t",
                "--username",
                "c",
                "--password",
                "s"
            ]
        );
    }

    #[tokio::test]
    async fn test_service_principal_supersedes_device_code() {
        let spawner = MockSpawner::new(vec![
            MockScript::lines(&["Retrieving tenants"]).hanging(),
            MockScript::stdout("[]", 0),
        ]);
        let manager = Arc::new(LoginSessionManager::new(
            spawner.clone(),
            LoginConfig {
                max_scan_lines: 40,
                ..fast_config()
            },
        ));

        let device = tokio::spawn({
            let manager = manager.clone();
            async move { manager.login(&command("az login")).await }
        });
        assert!(eventually(Duration::from_secs(2), || spawner.spawn_count() == 1).await);

        let sp = ServicePrincipal {
            tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
        };
        manager
            .login_service_principal(&sp, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(device.await.unwrap().phase, LoginPhase::Superseded);
        assert_eq!(spawner.events()[1], MockEvent::Terminated(0));
    }
}
