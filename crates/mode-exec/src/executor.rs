use std::io;
use std::io::Read;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::contracts::CommandOutput;
use crate::contracts::ExecRequest;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command timed out after {after_ms} ms")]
    TimedOut {
        after_ms: u64,
        partial: CommandOutput,
    },
    #[error("failed to start shell: {0}")]
    Spawn(#[source] io::Error),
}

pub trait CommandExecutor: Send + Sync {
    fn execute(&self, request: &ExecRequest) -> Result<CommandOutput, ExecError>;
}

/// Runs commands through `sh -c` in a fresh process group so a timeout can kill every
/// process the command started.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellExecutor {
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, request: &ExecRequest) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(ExecError::Spawn)?;
        debug!(pid = child.id(), command = %request.command, "spawned");

        let (done_tx, done_rx) = mpsc::channel();
        let stdout = spawn_reader(child.stdout.take(), request.output_limit, done_tx.clone());
        let stderr = spawn_reader(child.stderr.take(), request.output_limit, done_tx);
        let mut open_streams = usize::from(stdout.is_some()) + usize::from(stderr.is_some());

        let deadline = started + request.timeout;
        let status = match wait_with_deadline(&mut child, deadline) {
            Ok(status) => status,
            Err(err) => {
                kill_group(&mut child);
                return Err(ExecError::Spawn(err));
            }
        };
        let status = match status {
            Some(status) if wait_for_readers(&done_rx, &mut open_streams, deadline) => Some(status),
            Some(_) => {
                // The shell is gone but a background member of its group still holds a pipe.
                warn!(command = %request.command, "output still open at deadline");
                kill_group(&mut child);
                None
            }
            None => None,
        };
        if status.is_none()
            && !wait_for_readers(&done_rx, &mut open_streams, Instant::now() + KILL_GRACE)
        {
            warn!(command = %request.command, "output readers outlived the process group");
        }
        let duration_ms = elapsed_ms(started);
        let stdout = snapshot(stdout.as_ref());
        let stderr = snapshot(stderr.as_ref());

        match status {
            Some(status) => Ok(CommandOutput {
                exit_code: exit_code(status),
                stdout,
                stderr,
                duration_ms,
            }),
            None => Err(ExecError::TimedOut {
                after_ms: duration_ms,
                partial: CommandOutput {
                    exit_code: -1,
                    stdout,
                    stderr,
                    duration_ms,
                },
            }),
        }
    }
}

/// `Ok(None)` means the deadline passed and the process group was killed.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // The child leads its own group, so a negative pid signals every member.
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result != 0 {
        warn!(
            pgid,
            error = %io::Error::last_os_error(),
            "failed to kill process group"
        );
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

type SharedTail = Arc<Mutex<TailBuffer>>;

/// Drains `stream` into a shared tail buffer on its own thread and signals `done` at EOF.
fn spawn_reader<R>(stream: Option<R>, limit: usize, done: Sender<()>) -> Option<SharedTail>
where
    R: Read + Send + 'static,
{
    let mut stream = stream?;
    let tail: SharedTail = Arc::new(Mutex::new(TailBuffer::new(limit)));
    let sink = Arc::clone(&tail);
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => lock(&sink).push(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = done.send(());
    });
    Some(tail)
}

/// True once every open stream reached EOF before `deadline`. `open` counts down as they do.
fn wait_for_readers(done: &Receiver<()>, open: &mut usize, deadline: Instant) -> bool {
    while *open > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(()) => *open -= 1,
            Err(RecvTimeoutError::Timeout) => return false,
            Err(RecvTimeoutError::Disconnected) => return true,
        }
    }
    true
}

fn snapshot(tail: Option<&SharedTail>) -> String {
    tail.map(|tail| lock(tail).render()).unwrap_or_default()
}

fn lock(tail: &SharedTail) -> MutexGuard<'_, TailBuffer> {
    tail.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the last `limit` bytes of a stream and counts what fell off the front.
#[derive(Debug)]
pub struct TailBuffer {
    limit: usize,
    dropped: usize,
    bytes: Vec<u8>,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            dropped: 0,
            bytes: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    pub fn render(&self) -> String {
        if self.dropped == 0 {
            return String::from_utf8_lossy(&self.bytes).into_owned();
        }
        // Skip UTF-8 continuation bytes left over from the cut.
        let start = self
            .bytes
            .iter()
            .position(|b| b & 0xC0 != 0x80)
            .unwrap_or(self.bytes.len());
        let dropped = self.dropped + start;
        format!(
            "[... {dropped} bytes truncated ...]\n{}",
            String::from_utf8_lossy(&self.bytes[start..])
        )
    }
}
