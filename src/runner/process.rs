//! Subprocess supervision with a hard wall-clock deadline and bounded output.
//!
//! Output is pumped by one reader thread per pipe into a channel; the
//! supervising thread keeps only the trailing bytes of each stream plus a
//! bounded combined log. Full output is never retained.
//!
//! On unix the child leads its own process group so a timeout can take down
//! everything it spawned (browsers, drivers) and not just the direct child.

#![allow(missing_docs)]

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

const READ_CHUNK: usize = 8 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to keep collecting output after the child is gone. Grandchildren
/// holding the pipes open must not stall the caller.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(2);
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(250);

// ──────────────────── bounded buffers ────────────────────

/// Keeps the last `cap` bytes written to it.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    cap: usize,
    buf: Vec<u8>,
    total: u64,
}

impl TailBuffer {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        if bytes.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&bytes[bytes.len() - self.cap..]);
            return;
        }
        self.buf.extend_from_slice(bytes);
        // Compact lazily so steady small writes stay amortized O(1).
        if self.buf.len() > self.cap.saturating_mul(2).max(READ_CHUNK) {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
        }
    }

    /// Whether anything was dropped from the front.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.total > self.cap as u64
    }

    /// Total bytes ever pushed.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The retained tail as text, starting on a character boundary.
    #[must_use]
    pub fn to_text(&self) -> String {
        let start = self.buf.len().saturating_sub(self.cap);
        let mut tail = &self.buf[start..];
        if start > 0 || self.truncated() {
            // Skip UTF-8 continuation bytes left over from the cut.
            let skip = tail
                .iter()
                .take(3)
                .take_while(|b| (0x80..0xC0).contains(*b))
                .count();
            tail = &tail[skip..];
        }
        String::from_utf8_lossy(tail).into_owned()
    }
}

// ──────────────────── supervision ────────────────────

#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    pub stdout_tail: usize,
    pub stderr_tail: usize,
    pub combined: usize,
}

/// What the supervised process left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub combined: String,
    pub combined_truncated: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    bytes: Vec<u8>,
}

struct Sinks {
    stdout: TailBuffer,
    stderr: TailBuffer,
    combined: TailBuffer,
}

impl Sinks {
    fn accept(&mut self, chunk: &Chunk) {
        match chunk.stream {
            Stream::Stdout => self.stdout.push(&chunk.bytes),
            Stream::Stderr => self.stderr.push(&chunk.bytes),
        }
        self.combined.push(&chunk.bytes);
    }

    fn drain(&mut self, rx: &Receiver<Chunk>, budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(chunk) => self.accept(&chunk),
                Err(_) => break,
            }
        }
    }
}

/// Runs one command to completion or deadline.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub limits: OutputLimits,
}

impl Supervisor {
    /// Spawn `cmd` and wait for it. Only a failure to spawn is an error; a
    /// timeout is reported through [`ProcessOutcome::timed_out`].
    pub fn run(&self, mut cmd: Command) -> io::Result<ProcessOutcome> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd.spawn()?;

        let (tx, rx) = crossbeam_channel::unbounded::<Chunk>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let mut sinks = Sinks {
            stdout: TailBuffer::new(self.limits.stdout_tail),
            stderr: TailBuffer::new(self.limits.stderr_tail),
            combined: TailBuffer::new(self.limits.combined),
        };

        let deadline = start + self.timeout;
        let mut timed_out = false;
        let mut pipes_open = true;
        let status: Option<ExitStatus> = loop {
            let polled = child.try_wait();
            if let Some(status) = self.settle_poll(&mut child, polled)? {
                break Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break self.terminate(&mut child);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            if pipes_open {
                match rx.recv_timeout(wait) {
                    Ok(chunk) => sinks.accept(&chunk),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => pipes_open = false,
                }
            } else {
                thread::sleep(wait);
            }
        };

        sinks.drain(
            &rx,
            if timed_out {
                DRAIN_AFTER_KILL
            } else {
                DRAIN_AFTER_EXIT
            },
        );

        Ok(ProcessOutcome {
            exit_code: if timed_out {
                None
            } else {
                status.and_then(|s| s.code())
            },
            timed_out,
            stdout_tail: sinks.stdout.to_text(),
            stderr_tail: sinks.stderr.to_text(),
            combined_truncated: sinks.combined.truncated(),
            combined: sinks.combined.to_text(),
            duration: start.elapsed(),
        })
    }

    /// A failed status poll still takes the process group down before the
    /// error is returned.
    fn settle_poll(
        &self,
        child: &mut Child,
        polled: io::Result<Option<ExitStatus>>,
    ) -> io::Result<Option<ExitStatus>> {
        polled.inspect_err(|_| {
            let _ = self.terminate(child);
        })
    }

    /// SIGTERM the process group, then SIGKILL once the grace period runs out.
    #[cfg(unix)]
    fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(child.id()) else {
            let _ = child.kill();
            return child.wait().ok();
        };
        let group = Pid::from_raw(raw);
        if killpg(group, Signal::SIGTERM).is_err() {
            let _ = child.kill();
        }

        let grace_end = Instant::now() + self.kill_grace;
        let mut status = None;
        while Instant::now() < grace_end {
            if let Ok(Some(s)) = child.try_wait() {
                status = Some(s);
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        // Stragglers in the group get SIGKILL even if the leader already left.
        let _ = killpg(group, Signal::SIGKILL);
        status.or_else(|| child.wait().ok())
    }

    #[cfg(not(unix))]
    fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        let _ = child.kill();
        child.wait().ok()
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R, stream: Stream, tx: Sender<Chunk>) {
    thread::spawn(move || {
        let mut buf = vec![0_u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx
                        .send(Chunk {
                            stream,
                            bytes: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_buffer_keeps_the_end() {
        let mut tail = TailBuffer::new(4);
        tail.push(b"abc");
        tail.push(b"defg");
        assert_eq!(tail.to_text(), "defg");
        assert!(tail.truncated());
        assert_eq!(tail.total(), 7);
    }

    #[test]
    fn tail_buffer_under_cap_is_untouched() {
        let mut tail = TailBuffer::new(100);
        tail.push(b"hello ");
        tail.push(b"world");
        assert_eq!(tail.to_text(), "hello world");
        assert!(!tail.truncated());
    }

    #[test]
    fn tail_buffer_large_single_write() {
        let mut tail = TailBuffer::new(10);
        let data = vec![b'x'; 100_000];
        tail.push(&data);
        tail.push(b"END");
        let text = tail.to_text();
        assert_eq!(text.len(), 10);
        assert!(text.ends_with("END"));
    }

    #[test]
    fn tail_buffer_does_not_split_characters() {
        let mut tail = TailBuffer::new(5);
        tail.push("ééé".as_bytes());
        let text = tail.to_text();
        assert!(!text.contains('\u{FFFD}'), "{text:?}");
        assert_eq!(text, "éé");
    }

    #[cfg(unix)]
    fn supervisor(timeout: Duration) -> Supervisor {
        Supervisor {
            timeout,
            kill_grace: Duration::from_millis(200),
            limits: OutputLimits {
                stdout_tail: 2_000,
                stderr_tail: 1_000,
                combined: 1_048_576,
            },
        }
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams_and_exit_code() {
        let outcome = supervisor(Duration::from_secs(10))
            .run(sh("echo out; echo err >&2; exit 3"))
            .unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout_tail.trim(), "out");
        assert_eq!(outcome.stderr_tail.trim(), "err");
        assert!(outcome.combined.contains("out") && outcome.combined.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_loop_and_keeps_partial_output() {
        let started = Instant::now();
        let outcome = supervisor(Duration::from_secs(1))
            .run(sh("while true; do echo tick; sleep 0.1; done"))
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stdout_tail.contains("tick"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_reaches_grandchildren() {
        let started = Instant::now();
        let outcome = supervisor(Duration::from_millis(500))
            .run(sh("sleep 30 & sleep 30 & wait"))
            .unwrap();
        assert!(outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_tail_is_bounded() {
        let outcome = supervisor(Duration::from_secs(10))
            .run(sh("i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done"))
            .unwrap();
        assert!(outcome.stdout_tail.len() <= 2_000);
        assert!(outcome.stdout_tail.trim_end().ends_with("line-1999"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_status_poll_kills_the_group() {
        use std::os::unix::process::CommandExt as _;
        let mut cmd = sh("sleep 30");
        cmd.process_group(0);
        let mut child = cmd.spawn().unwrap();
        let sup = supervisor(Duration::from_secs(10));

        let err = sup
            .settle_poll(&mut child, Err(io::Error::other("wait failed")))
            .unwrap_err();
        assert_eq!(err.to_string(), "wait failed");
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let cmd = Command::new("/nonexistent/triage-runner-binary");
        assert!(supervisor_any().run(cmd).is_err());
    }

    fn supervisor_any() -> Supervisor {
        Supervisor {
            timeout: Duration::from_secs(1),
            kill_grace: Duration::from_millis(100),
            limits: OutputLimits {
                stdout_tail: 10,
                stderr_tail: 10,
                combined: 10,
            },
        }
    }
}
