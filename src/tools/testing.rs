//! Scripted processes for unit tests
//!
//! `MockSpawner` hands out in-memory processes whose output, exit code and
//! signal handling are scripted. Every spawn, terminate and kill is recorded
//! in one ordered event log so tests can assert happens-before relations.

use super::error::ExecutionError;
use super::process::{
    ChildProcess, ProcessExit, ProcessHandle, ProcessReader, ProcessSpawner, ProcessWriter,
    SpawnRequest,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Spawned(usize),
    Terminated(usize),
    Killed(usize),
}

/// What a scripted process does
#[derive(Debug, Clone, Default)]
pub(crate) struct MockScript {
    /// `(delay before chunk, chunk)` written to stdout
    pub stdout: Vec<(Duration, String)>,
    /// `(delay before chunk, chunk)` written to stderr
    pub stderr: Vec<(Duration, String)>,
    pub exit_code: i32,
    /// Keep running (streams open) after the output is written
    pub hang: bool,
    /// SIGTERM is ignored, only kill ends the process
    pub ignore_sigterm: bool,
    /// Fail at spawn time with this message
    pub spawn_error: Option<String>,
}

impl MockScript {
    pub fn stdout(text: &str, exit_code: i32) -> Self {
        Self {
            stdout: vec![(Duration::ZERO, text.to_string())],
            exit_code,
            ..Default::default()
        }
    }

    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout: lines
                .iter()
                .map(|l| (Duration::ZERO, format!("{}\n", l)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, text: &str) -> Self {
        self.stderr.push((Duration::ZERO, text.to_string()));
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn ignoring_sigterm(mut self) -> Self {
        self.ignore_sigterm = true;
        self
    }

    pub fn exiting_with(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn failing_spawn(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// Observation and control of one spawned mock process
#[derive(Clone)]
pub(crate) struct MockControl {
    exit: watch::Sender<Option<ProcessExit>>,
    pub terminate_calls: Arc<AtomicUsize>,
    pub kill_calls: Arc<AtomicUsize>,
    pub wait_calls: Arc<AtomicUsize>,
}

impl MockControl {
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Make the process exit now (no-op if it already has)
    pub fn finish(&self, code: i32) {
        set_exit(&self.exit, ProcessExit::from_code(code));
    }
}

fn set_exit(tx: &watch::Sender<Option<ProcessExit>>, exit: ProcessExit) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(exit);
            true
        } else {
            false
        }
    });
}

#[derive(Default)]
pub(crate) struct MockSpawner {
    scripts: Mutex<VecDeque<MockScript>>,
    spawned: Mutex<Vec<SpawnRequest>>,
    controls: Mutex<Vec<MockControl>>,
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockSpawner {
    pub fn new(scripts: Vec<MockScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn spawned_commands(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.as_str().to_string())
            .collect()
    }

    pub fn spawned_requests(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn control(&self, index: usize) -> MockControl {
        self.controls.lock().unwrap()[index].clone()
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle, ExecutionError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        if let Some(message) = script.spawn_error {
            return Err(ExecutionError::SpawnFailed(message));
        }

        let index = {
            let mut spawned = self.spawned.lock().unwrap();
            spawned.push(request.clone());
            spawned.len() - 1
        };
        self.events.lock().unwrap().push(MockEvent::Spawned(index));

        let (exit_tx, exit_rx) = watch::channel(None);
        let control = MockControl {
            exit: exit_tx.clone(),
            terminate_calls: Arc::new(AtomicUsize::new(0)),
            kill_calls: Arc::new(AtomicUsize::new(0)),
            wait_calls: Arc::new(AtomicUsize::new(0)),
        };
        self.controls.lock().unwrap().push(control.clone());

        let (stdout_w, stdout_r) = tokio::io::duplex(64 * 1024);
        let (stderr_w, stderr_r) = tokio::io::duplex(64 * 1024);

        let hang = script.hang;
        let exit_code = script.exit_code;
        let out_rx = exit_rx.clone();
        let err_rx = exit_rx.clone();
        let process_tx = exit_tx.clone();
        tokio::spawn(async move {
            tokio::join!(
                write_chunks(stdout_w, script.stdout, out_rx, hang),
                write_chunks(stderr_w, script.stderr, err_rx, hang),
            );
            if !hang {
                set_exit(&process_tx, ProcessExit::from_code(exit_code));
            }
        });

        let (stdin_w, _stdin_r) = tokio::io::duplex(1024);
        let stdin = request
            .pipe_stdin
            .then(|| Box::new(stdin_w) as ProcessWriter);

        Ok(ProcessHandle {
            child: Box::new(MockChild {
                index,
                pid: 10_000 + index as u32,
                ignore_sigterm: script.ignore_sigterm,
                exit_tx,
                exit_rx,
                control,
                events: self.events.clone(),
            }),
            stdin,
            stdout: Some(Box::new(stdout_r) as ProcessReader),
            stderr: Some(Box::new(stderr_r) as ProcessReader),
        })
    }
}

async fn write_chunks(
    mut writer: DuplexStream,
    chunks: Vec<(Duration, String)>,
    mut exit: watch::Receiver<Option<ProcessExit>>,
    hold_open: bool,
) {
    for (delay, chunk) in chunks {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = exit.wait_for(Option::is_some) => return,
        }
        if writer.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
    }
    if hold_open {
        let _ = exit.wait_for(Option::is_some).await;
    }
}

struct MockChild {
    index: usize,
    pid: u32,
    ignore_sigterm: bool,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    control: MockControl,
    events: Arc<Mutex<Vec<MockEvent>>>,
}

#[async_trait]
impl ChildProcess for MockChild {
    fn id(&self) -> Option<u32> {
        match *self.exit_rx.borrow() {
            Some(_) => None,
            None => Some(self.pid),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.control.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .push(MockEvent::Terminated(self.index));
        if !self.ignore_sigterm {
            set_exit(&self.exit_tx, ProcessExit::signaled());
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.control.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(MockEvent::Killed(self.index));
        set_exit(&self.exit_tx, ProcessExit::signaled());
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        self.control.wait_calls.fetch_add(1, Ordering::SeqCst);
        let exit: Option<ProcessExit> = *self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "mock process vanished"))?;
        Ok(exit.unwrap_or_else(ProcessExit::signaled))
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.exit_rx.borrow())
    }
}

/// Poll `condition` until it holds or `within` elapses
pub(crate) async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
