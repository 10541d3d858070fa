use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

const READ_CHUNK_SIZE: usize = 8192;
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What happened to one spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was killed by a signal or never started
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub timed_out: bool,
    /// Set when an output stream hit the cap; a still running process is killed
    pub truncated: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    fn launch_failure(message: String, elapsed: Duration) -> Self {
        Self {
            exit_code: None,
            signal: None,
            timed_out: false,
            truncated: false,
            stdout: String::new(),
            stderr: message,
            elapsed,
        }
    }

    /// The process could not be spawned at all; `stderr` holds the reason
    pub fn is_launch_failure(&self) -> bool {
        self.exit_code.is_none() && self.signal.is_none() && !self.timed_out
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns a single process with bounded output and a wall-clock timeout
///
/// Expected failures (missing binary, non-zero exit, timeout, runaway output)
/// are reported inside the returned [`ProcessOutcome`], never as an error.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    max_output_bytes: usize,
}

impl ProcessRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
        stdin_data: &str,
    ) -> ProcessOutcome {
        let started = Instant::now();

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::debug!("Failed to spawn {command}: {e}");
                return ProcessOutcome::launch_failure(
                    format!("Failed to start {command}: {e}"),
                    started.elapsed(),
                );
            }
        };

        // Dropping the handle closes the pipe, so empty input is an immediate EOF
        if let Some(mut stdin) = child.stdin.take()
            && !stdin_data.is_empty()
        {
            let data = stdin_data.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    log::debug!("Child stopped reading stdin: {e}");
                }
            });
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_chunk = [0u8; READ_CHUNK_SIZE];
        let mut stderr_chunk = [0u8; READ_CHUNK_SIZE];
        let mut timed_out = false;
        let mut truncated = false;

        let pgid = child.id().map(|pid| pid as libc::pid_t);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                read = read_chunk(&mut stdout_pipe, &mut stdout_chunk), if stdout_pipe.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stdout_pipe = None,
                        Ok(n) => {
                            if append_capped(&mut stdout, &stdout_chunk[..n], self.max_output_bytes) {
                                log::info!("{command} exceeded the stdout cap, killing it");
                                truncated = true;
                                break terminate(&mut child, pgid).await;
                            }
                        }
                    }
                }
                read = read_chunk(&mut stderr_pipe, &mut stderr_chunk), if stderr_pipe.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stderr_pipe = None,
                        Ok(n) => {
                            if append_capped(&mut stderr, &stderr_chunk[..n], self.max_output_bytes) {
                                log::info!("{command} exceeded the stderr cap, killing it");
                                truncated = true;
                                break terminate(&mut child, pgid).await;
                            }
                        }
                    }
                }
                status = child.wait() => {
                    // Background helpers may still hold the pipes open
                    kill_group(pgid);
                    break status;
                }
                _ = &mut deadline => {
                    log::info!("{command} timed out after {timeout:?}, killing it");
                    timed_out = true;
                    break terminate(&mut child, pgid).await;
                }
            }
        };

        // Collect what was written before the exit but not read yet
        let drain_deadline = tokio::time::sleep(DRAIN_GRACE);
        tokio::pin!(drain_deadline);
        while stdout_pipe.is_some() || stderr_pipe.is_some() {
            tokio::select! {
                read = read_chunk(&mut stdout_pipe, &mut stdout_chunk), if stdout_pipe.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stdout_pipe = None,
                        Ok(n) => {
                            if append_capped(&mut stdout, &stdout_chunk[..n], self.max_output_bytes) {
                                truncated = true;
                                stdout_pipe = None;
                            }
                        }
                    }
                }
                read = read_chunk(&mut stderr_pipe, &mut stderr_chunk), if stderr_pipe.is_some() => {
                    match read {
                        Ok(0) | Err(_) => stderr_pipe = None,
                        Ok(n) => {
                            if append_capped(&mut stderr, &stderr_chunk[..n], self.max_output_bytes) {
                                truncated = true;
                                stderr_pipe = None;
                            }
                        }
                    }
                }
                _ = &mut drain_deadline => {
                    log::debug!("Output pipes of {command} still open after exit, giving up on them");
                    break;
                }
            }
        }

        let (exit_code, signal) = match status {
            Ok(status) => (status.code(), status.signal().map(signal_name)),
            Err(e) => {
                log::error!("Failed to wait for {command}: {e}");
                let message = format!("Failed to wait for {command}: {e}");
                append_capped(&mut stderr, message.as_bytes(), self.max_output_bytes);
                (None, None)
            }
        };

        ProcessOutcome {
            exit_code,
            signal,
            timed_out,
            truncated,
            stdout: decode_capped(&stdout, self.max_output_bytes),
            stderr: decode_capped(&stderr, self.max_output_bytes),
            elapsed: started.elapsed(),
        }
    }
}

async fn read_chunk<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Appends `chunk` without letting `buffer` grow past `cap`.
/// Returns `true` if anything had to be cut off.
fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buffer.len());
    if chunk.len() > room {
        buffer.extend_from_slice(&chunk[..room]);
        true
    } else {
        buffer.extend_from_slice(chunk);
        false
    }
}

/// Lossy UTF-8 decoding that still respects `cap`: replacement characters
/// are wider than the bytes they stand for, so the tail is cut back to a
/// character boundary.
fn decode_capped(bytes: &[u8], cap: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// SIGKILLs the process group led by the child (`process_group(0)`)
fn kill_group(pgid: Option<libc::pid_t>) {
    if let Some(pgid) = pgid {
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

/// Kills the child with its whole group and waits until it is reaped
async fn terminate(child: &mut Child, pgid: Option<libc::pid_t>) -> std::io::Result<ExitStatus> {
    kill_group(pgid);
    if let Err(e) = child.start_kill() {
        log::debug!("Direct kill failed: {e}");
    }
    child.wait().await
}

fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        other => return format!("SIG{other}"),
    };
    name.to_string()
}
