//! Invocation of external tools.
//!
//! Every tool runs as a separate process with captured output. Runs are
//! bounded by a timeout and tied to a [`CancellationToken`]; when either
//! fires, the child is killed before the call returns.

use std::{
    ffi::OsString,
    fmt,
    io,
    path::Path,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Captured result of a finished process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, or `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Fails with `ExternalTool` unless the process exited with code 0.
    ///
    /// # Errors
    ///
    /// Returns the exit status and the trimmed standard error output.
    pub fn ensure_success(&self, program: &Path) -> Result<()> {
        if self.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&self.stderr);
        Err(Error::external_tool(format!(
            "{} failed with {self}: {}",
            program.display(),
            stderr.trim()
        )))
    }
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("signal"),
        }
    }
}

impl From<std::process::Output> for ToolOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Runs external programs on behalf of the pipeline.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Whether `program` can be found and started.
    fn is_available(&self, program: &Path) -> bool;

    /// Runs `program` to completion.
    ///
    /// A non-zero exit is not an error at this level; callers decide with
    /// [`ToolOutput::ensure_success`].
    ///
    /// # Errors
    ///
    /// * `ExternalTool` if the program cannot be started or times out
    /// * `Cancelled` if `cancel` fires first
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        cancel: &CancellationToken,
    ) -> Result<ToolOutput>;
}

/// Runs programs as real child processes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct System {
    timeout: Duration,
}

impl System {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for System {
    fn is_available(&self, program: &Path) -> bool {
        which::which(program).is_ok()
    }

    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        trace!("running {} {args:?}", program.display());

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    Error::external_tool(format!("{} not found", program.display()))
                }
                _ => Error::external_tool(format!("cannot start {}: {e}", program.display())),
            })?;

        // Dropping the output future drops the child, which kills it.
        let output = child.wait_with_output();

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                Err(Error::cancelled(format!("{} was cancelled", program.display())))
            }

            result = tokio::time::timeout(self.timeout, output) => match result {
                Ok(output) => Ok(output?.into()),
                Err(_) => Err(Error::external_tool(format!(
                    "{} timed out after {:.1}s",
                    program.display(),
                    self.timeout.as_secs_f32()
                ))),
            }
        }
    }
}

#[cfg(test)]
pub mod stub {
    //! Scriptable runner for tests.

    use std::{
        path::PathBuf,
        sync::{Mutex, PoisonError},
    };

    use super::*;

    type Handler = Box<dyn Fn(&[OsString]) -> Result<ToolOutput> + Send + Sync>;

    /// Records every invocation and answers with per-program handlers.
    /// Programs without a handler are reported as not installed.
    #[derive(Default)]
    pub struct RunnerStub {
        handlers: Vec<(PathBuf, Handler)>,
        pub calls: Mutex<Vec<(PathBuf, Vec<OsString>)>>,
    }

    impl RunnerStub {
        #[must_use]
        pub fn with(
            mut self,
            program: impl Into<PathBuf>,
            handler: impl Fn(&[OsString]) -> Result<ToolOutput> + Send + Sync + 'static,
        ) -> Self {
            self.handlers.push((program.into(), Box::new(handler)));
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        pub fn calls_to(&self, program: &str) -> Vec<Vec<OsString>> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(p, _)| p == Path::new(program))
                .map(|(_, args)| args.clone())
                .collect()
        }
    }

    pub fn ok() -> Result<ToolOutput> {
        Ok(ToolOutput {
            code: Some(0),
            ..ToolOutput::default()
        })
    }

    #[async_trait]
    impl CommandRunner for RunnerStub {
        fn is_available(&self, program: &Path) -> bool {
            self.handlers.iter().any(|(p, _)| p == program)
        }

        async fn run(
            &self,
            program: &Path,
            args: &[OsString],
            cancel: &CancellationToken,
        ) -> Result<ToolOutput> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((program.to_path_buf(), args.to_vec()));

            if cancel.is_cancelled() {
                return Err(Error::cancelled("cancelled"));
            }

            match self.handlers.iter().find(|(p, _)| p == program) {
                Some((_, handler)) => handler(args),
                None => Err(Error::external_tool(format!("{} not found", program.display()))),
            }
        }
    }
}
