//! Build invocation and compiler-error counting.

use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, ScoutError};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long output readers may lag behind the exit of the build.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Matches located diagnostics in `file:line:col: error` form, as printed by
/// `cargo check --message-format short`, gcc and clang.
pub const DEFAULT_ERROR_PATTERN: &str = r"^[^\s:][^:]*:\d+:\d+: error\b";

/// Builds a project tree and reports how many compiler errors it produced.
pub trait BuildService: Send + Sync {
    fn build(&self, project: &Path) -> Result<u32>;
}

/// Runs an external command in the project directory and counts output lines
/// matching `error_pattern`. The exit status is not consulted.
///
/// On unix the command gets its own process group and a timeout kills the
/// whole group, so compiler processes it started stop writing into the tree
/// too. Elsewhere only the direct child is killed.
#[derive(Debug, Clone)]
pub struct CommandBuild {
    program: String,
    args: Vec<String>,
    error_pattern: Regex,
    timeout: Option<Duration>,
}

impl CommandBuild {
    /// `command_line` is split on whitespace; the first word is the program.
    pub fn new(command_line: &str, error_pattern: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| ScoutError::BuildFailed("build command is empty".to_string()))?;
        let error_pattern = Regex::new(error_pattern).map_err(|err| {
            ScoutError::BuildFailed(format!("invalid error pattern: {}", err))
        })?;
        Ok(Self {
            program,
            args: words.collect(),
            error_pattern,
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn count_errors(&self, output: &str) -> u32 {
        output
            .lines()
            .filter(|line| self.error_pattern.is_match(line))
            .count() as u32
    }

    fn wait(&self, child: &mut Child) -> Result<()> {
        let Some(timeout) = self.timeout else {
            child
                .wait()
                .map_err(|err| ScoutError::BuildFailed(err.to_string()))?;
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(err) = kill_build(child) {
                        warn!(error = %err, "Failed to kill timed-out build");
                    }
                    let _ = child.wait();
                    return Err(ScoutError::BuildTimedOut {
                        secs: timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(ScoutError::BuildFailed(err.to_string())),
            }
        }
    }
}

#[cfg(unix)]
fn kill_build(child: &mut Child) -> io::Result<()> {
    let group = child.id() as libc::pid_t;
    // SAFETY: libc::kill has no memory-safety preconditions. A negative pid
    // targets the process group created by `process_group(0)` at spawn, whose
    // id is the child's pid; the child is not yet reaped so the id is live.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(-group, libc::SIGKILL) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone.
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
fn kill_build(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

/// Joins an output reader, giving up after [`DRAIN_GRACE`] if something
/// outside the build still holds the pipe open.
fn collect(reader: JoinHandle<String>, stream: &str) -> String {
    let deadline = Instant::now() + DRAIN_GRACE;
    while !reader.is_finished() {
        if Instant::now() >= deadline {
            warn!(stream, "Build output still open after exit; discarding it");
            return String::new();
        }
        thread::sleep(POLL_INTERVAL);
    }
    reader.join().unwrap_or_default()
}

impl BuildService for CommandBuild {
    fn build(&self, project: &Path) -> Result<u32> {
        let started = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(project)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| ScoutError::BuildFailed(format!("{}: {}", self.program, err)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let waited = self.wait(&mut child);

        let mut output = collect(stdout, "stdout");
        output.push('\n');
        output.push_str(&collect(stderr, "stderr"));
        waited?;

        let errors = self.count_errors(&output);
        debug!(
            program = %self.program,
            project = %project.display(),
            errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Build finished"
        );
        Ok(errors)
    }
}
