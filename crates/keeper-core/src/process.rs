//! Subprocess runner shared by the external-command drivers
//!
//! Callers stay synchronous; each invocation drives the child on a
//! current-thread tokio runtime so stdin, stdout and stderr are pumped
//! concurrently and the whole exchange is bounded by a timeout. Captured
//! stdout is capped by an output limit; stderr keeps only its head.

use anyhow::{bail, Context, Result};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default cap on captured stdout
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024 * 1024;

/// Bytes of stderr kept for error messages; the rest is drained and dropped
const STDERR_LIMIT: usize = 64 * 1024;

/// Subprocess errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} wrote more than {limit} bytes to stdout")]
    OutputTooLarge { program: String, limit: usize },

    #[error("I/O error while talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Captured result of a finished subprocess
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stderr as trimmed, lossily decoded text
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Exit code, or a description of the signal that killed the child
    pub fn exit_description(&self) -> String {
        match self.status.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A subprocess to run: program, arguments, extra environment and a deadline
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
    output_limit: usize,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: Duration::from_secs(30),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Largest stdout accepted before the child is killed
    pub fn output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Run to completion, feeding `input` on stdin when given.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run(&self, input: Option<&[u8]>) -> Result<ProcessOutput> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start subprocess runtime")?;
        runtime.block_on(self.run_async(input))
    }

    async fn run_async(&self, input: Option<&[u8]>) -> Result<ProcessOutput> {
        debug!("Running {} {:?}", self.program, self.args);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().context("Child stdout was not captured")?;
        let mut stderr = child.stderr.take().context("Child stderr was not captured")?;

        let limit = self.output_limit;
        let exchange = async {
            let feed = async {
                if let (Some(mut pipe), Some(data)) = (stdin, input) {
                    match pipe.write_all(data).await {
                        // The child may exit without draining its input
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                        Err(e) => return Err(Failure::Io(e)),
                        Ok(()) => {}
                    }
                    // Dropping the pipe signals EOF
                    drop(pipe);
                }
                Ok(())
            };

            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                (&mut stdout)
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .await?;
                if out.len() > limit {
                    return Err(Failure::Overflow);
                }
                Ok(())
            };
            let read_err = async {
                read_head(&mut stderr, &mut err, STDERR_LIMIT).await?;
                Ok::<_, Failure>(())
            };

            tokio::try_join!(feed, read_out, read_err)?;
            let status = child.wait().await?;
            Ok::<_, Failure>((status, out, err))
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;

        let failure = match outcome {
            Ok(Ok((status, stdout, stderr))) => {
                debug!("{} finished with {}", self.program, status);
                return Ok(ProcessOutput {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(Err(Failure::Io(source))) => {
                return Err(ProcessError::Io {
                    program: self.program.clone(),
                    source,
                }
                .into())
            }
            Ok(Err(Failure::Overflow)) => {
                warn!(
                    "{} exceeded its {} byte output limit, killing it",
                    self.program, limit
                );
                ProcessError::OutputTooLarge {
                    program: self.program.clone(),
                    limit,
                }
            }
            Err(_) => {
                warn!(
                    "{} exceeded its {:?} timeout, killing it",
                    self.program, self.timeout
                );
                ProcessError::Timeout {
                    program: self.program.clone(),
                    after: self.timeout,
                }
            }
        };

        if let Err(e) = child.start_kill() {
            warn!("Failed to kill {}: {}", self.program, e);
        }
        let _ = child.wait().await;
        bail!(failure)
    }
}

/// Why an exchange with a child stopped early
enum Failure {
    Io(io::Error),
    Overflow,
}

impl From<io::Error> for Failure {
    fn from(e: io::Error) -> Self {
        Failure::Io(e)
    }
}

/// Read to EOF, keeping at most `cap` bytes
async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_captures_stdout_and_status() {
        let output = Invocation::new("/bin/sh")
            .args(["-c", "printf hello; exit 3"])
            .run(None)
            .unwrap();

        assert_eq!(output.stdout, b"hello");
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.exit_description(), "exit code 3");
    }

    #[test]
    fn test_feeds_stdin() {
        let output = Invocation::new("/bin/sh")
            .args(["-c", "cat"])
            .run(Some(b"piped bytes"))
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, b"piped bytes");
    }

    #[test]
    fn test_large_payload_does_not_deadlock() {
        let payload = vec![b'x'; 4 * 1024 * 1024];
        let output = Invocation::new("/bin/sh")
            .args(["-c", "cat"])
            .run(Some(&payload))
            .unwrap();

        assert_eq!(output.stdout.len(), payload.len());
    }

    #[test]
    fn test_env_is_injected() {
        let output = Invocation::new("/bin/sh")
            .args(["-c", "printf '%s' \"$SECRET_ID\""])
            .env("SECRET_ID", "abc123")
            .run(None)
            .unwrap();

        assert_eq!(output.stdout, b"abc123");
    }

    #[test]
    fn test_stderr_text() {
        let output = Invocation::new("/bin/sh")
            .args(["-c", "echo '  broken  ' >&2; exit 1"])
            .run(None)
            .unwrap();

        assert_eq!(output.stderr_text(), "broken");
    }

    #[test]
    fn test_timeout_kills_child() {
        let start = Instant::now();
        let err = Invocation::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .timeout(Duration::from_millis(200))
            .run(None)
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::Timeout { .. })
        ));
    }

    #[test]
    fn test_output_limit() {
        let output = Invocation::new("/bin/sh")
            .args(["-c", "printf 12345678"])
            .output_limit(8)
            .run(None)
            .unwrap();
        assert_eq!(output.stdout, b"12345678");

        let start = Instant::now();
        let err = Invocation::new("/bin/sh")
            .args(["-c", "head -c 50000000 /dev/zero"])
            .output_limit(8)
            .run(None)
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::OutputTooLarge { limit: 8, .. })
        ));
    }

    #[test]
    fn test_stderr_is_capped_and_drained() {
        let output = Invocation::new("/bin/sh")
            .args(["-c", "head -c 1000000 /dev/zero >&2; printf done"])
            .run(None)
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, b"done");
        assert_eq!(output.stderr.len(), STDERR_LIMIT);
    }

    #[test]
    fn test_missing_program() {
        let err = Invocation::new("/nonexistent/keeper-test-binary")
            .run(None)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::Spawn { .. })
        ));
    }
}
