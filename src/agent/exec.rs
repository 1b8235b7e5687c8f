//! Shell command execution with optional output assertions.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::CommandResult;

const EXEC_POLL: Duration = Duration::from_millis(500);
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// How long output may keep trickling in after the shell is gone.
const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub cmd: String,
    /// Stdout without its trailing newline.
    pub result: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_should_contain: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_should_not_contain: Option<bool>,
}

pub fn exec_command(
    cmd: &str,
    should_contain: Option<&str>,
    should_not_contain: Option<&str>,
) -> CommandResult<ExecResult> {
    exec_with_timeout(cmd, should_contain, should_not_contain, EXEC_TIMEOUT)
}

fn exec_with_timeout(
    cmd: &str,
    should_contain: Option<&str>,
    should_not_contain: Option<&str>,
    timeout: Duration,
) -> CommandResult<ExecResult> {
    let preview = if cmd.len() > 80 {
        format!("{}...", cmd.chars().take(80).collect::<String>())
    } else {
        cmd.to_string()
    };
    let start = Instant::now();

    let mut child = shell(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain pipes while polling so a chatty command can't block on a full pipe
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = start + timeout;
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!("cmd='{}' still running after {:?}, killing", preview, timeout);
            kill_tree(&mut child);
            break;
        }
        thread::sleep(EXEC_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }

    // Background jobs can inherit the pipes and hold them open indefinitely
    let drained_by = Instant::now() + PIPE_GRACE;
    let stdout = collect(stdout, drained_by);
    let stderr = collect(stderr, drained_by);
    tracing::info!(
        "exec cmd='{}' duration={}ms",
        preview,
        start.elapsed().as_millis()
    );

    let combined = format!("{}{}", stdout, stderr);
    Ok(ExecResult {
        cmd: cmd.to_string(),
        result: stdout.strip_suffix('\n').unwrap_or(&stdout).to_string(),
        error: stderr,
        result_should_contain: should_contain
            .filter(|s| !s.is_empty())
            .map(|s| combined.contains(s)),
        result_should_not_contain: should_not_contain
            .filter(|s| !s.is_empty())
            .map(|s| !combined.contains(s)),
    })
}

#[cfg(windows)]
fn shell(cmd: &str) -> Command {
    let mut c = Command::new("cmd");
    c.args(["/C", cmd]);
    c
}

#[cfg(not(windows))]
fn shell(cmd: &str) -> Command {
    use std::os::unix::process::CommandExt;

    let mut c = Command::new("sh");
    c.args(["-c", cmd]);
    // Own process group, so a timeout takes the whole pipeline down
    c.process_group(0);
    c
}

#[cfg(unix)]
fn kill_tree(child: &mut std::process::Child) {
    use nix::sys::signal::{killpg, Signal};

    if let Ok(pgid) = i32::try_from(child.id()) {
        let _ = killpg(nix::unistd::Pid::from_raw(pgid), Signal::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Output read so far from one pipe, plus a signal for EOF.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    eof: mpsc::Receiver<()>,
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Drain {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, eof) = mpsc::channel();
    let sink = Arc::clone(&buf);

    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
        let _ = tx.send(());
    });

    Drain { buf, eof }
}

/// Wait for EOF until `until`, then take whatever arrived.
fn collect(drain: Option<Drain>, until: Instant) -> String {
    let Some(drain) = drain else {
        return String::new();
    };
    let _ = drain
        .eof
        .recv_timeout(until.saturating_duration_since(Instant::now()));
    let buf = drain.buf.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&buf).into_owned()
}
