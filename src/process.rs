//! # External tool invocation
//!
//! All short-lived hypervisor tools (`vmrun`, `vmware-vdiskmanager`, the
//! network helper, `vmrest -v`) are executed through a [Tool]. The output of
//! each run is fully captured, a non-zero exit code is either handed back to
//! the caller as part of [Output] (some `vmrun` failures are expected answers)
//! or turned into [ProcessError::CommandFailed] by [Executable::exec_checked].
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Unable to find the {0} binary on host")]
    BinaryNotFound(String),
    #[error("Failed to spawn {0} command: {1}")]
    Spawn(String, std::io::Error),
    #[error("{binary} command has failed with exit code {code}. stdout: {stdout:?}, stderr: {stderr:?}")]
    CommandFailed {
        binary: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl From<ProcessError> for Status {
    fn from(e: ProcessError) -> Status {
        match e {
            ProcessError::BinaryNotFound(_) => Status::failed_precondition(e.to_string()),
            ProcessError::Spawn(..) => Status::internal(e.to_string()),
            ProcessError::CommandFailed { .. } => Status::internal(e.to_string()),
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `-1` when the process was terminated by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout and stderr joined, trimmed. `vmrun` reports most of its errors
    /// on stdout so callers usually match on this.
    pub fn text(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{}\n{}", stdout, stderr),
            (false, true) => stdout.to_string(),
            _ => stderr.to_string(),
        }
    }
}

/// Arguments always passed to a binary before the per-call ones
pub trait Args {
    fn args(&self) -> Vec<OsString>;
}

#[async_trait]
pub trait Executable: Args + Send + Sync {
    /// Run the binary to completion and capture its output, whatever the
    /// exit code is
    async fn exec(&self, args: &[OsString]) -> Result<Output, ProcessError>;

    fn concat_args(&self, args: &[OsString]) -> Vec<OsString> {
        let mut combined = self.args();
        combined.extend(args.iter().cloned());
        combined
    }

    /// Same as [Executable::exec] but a non-zero exit code is an error
    async fn exec_checked(&self, args: &[OsString]) -> Result<Output, ProcessError>;
}

/// A hypervisor command line tool
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    binary: PathBuf,
    leading: Vec<OsString>,
}

impl Tool {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Tool {
        Tool {
            name: name.into(),
            binary: binary.into(),
            leading: Vec::new(),
        }
    }

    /// Arguments prepended to every invocation, e.g. `-T ws` for vmrun
    pub fn with_leading_args<I, S>(mut self, args: I) -> Tool
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Shorthand over [Executable::exec] for string arguments
    pub async fn run<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> Result<Output, ProcessError> {
        let args: Vec<OsString> = args.iter().map(|a| a.as_ref().to_os_string()).collect();
        self.exec(&args).await
    }

    /// Shorthand over [Executable::exec_checked] for string arguments
    pub async fn run_checked<S: AsRef<std::ffi::OsStr>>(
        &self,
        args: &[S],
    ) -> Result<Output, ProcessError> {
        let args: Vec<OsString> = args.iter().map(|a| a.as_ref().to_os_string()).collect();
        self.exec_checked(&args).await
    }
}

impl Args for Tool {
    fn args(&self) -> Vec<OsString> {
        self.leading.clone()
    }
}

#[async_trait]
impl Executable for Tool {
    async fn exec(&self, args: &[OsString]) -> Result<Output, ProcessError> {
        if !self.binary.is_file() {
            return Err(ProcessError::BinaryNotFound(self.name.clone()));
        }
        let args = self.concat_args(args);
        debug!("Running {} {:?}", self.name, args);
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProcessError::Spawn(self.name.clone(), e))?;

        let output = Output {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            "{} exited with {}: stdout={:?} stderr={:?}",
            self.name,
            output.code,
            output.stdout,
            output.stderr
        );
        Ok(output)
    }

    async fn exec_checked(&self, args: &[OsString]) -> Result<Output, ProcessError> {
        let output = self.exec(args).await?;
        if !output.success() {
            return Err(ProcessError::CommandFailed {
                binary: self.name.clone(),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn leading_args_come_first() {
        let dir = tempdir().unwrap();
        let bin = script(dir.path(), "echoer", "echo \"$@\"");
        let tool = Tool::new("echoer", bin).with_leading_args(["-T", "ws"]);

        let output = tool.run(&["list"]).await.unwrap();
        assert!(output.success());
        assert_eq!(output.text(), "-T ws list");
    }

    #[tokio::test]
    async fn non_zero_exit_is_kept_or_reported() {
        let dir = tempdir().unwrap();
        let bin = script(dir.path(), "failing", "echo 'Error: Cannot open VM: x'; exit 255");
        let tool = Tool::new("failing", bin);

        let output = tool.run::<&str>(&[]).await.unwrap();
        assert_eq!(output.code, 255);
        assert!(output.text().starts_with("Error: Cannot open VM:"));

        match tool.run_checked::<&str>(&[]).await {
            Err(ProcessError::CommandFailed { code, stdout, .. }) => {
                assert_eq!(code, 255);
                assert!(stdout.contains("Cannot open VM"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary() {
        let tool = Tool::new("vmrun", "/nonexistent/vmrun");
        assert!(matches!(
            tool.run(&["list"]).await,
            Err(ProcessError::BinaryNotFound(name)) if name == "vmrun"
        ));
    }
}
