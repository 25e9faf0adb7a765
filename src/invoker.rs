// Copyright 2025 Chisomo Makombo Sakala
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::command::Invocation;
use crate::error::StepError;
use serde::Deserialize;
use serde::Serialize;
use std::env;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// How long to keep draining output pipes once the process is gone.
/// A killed tool may leave grandchildren holding the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Why a tool invocation ended the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ToolStatus {
  Success,
  /// Exited on its own with a nonzero code (`None` when killed by a signal).
  ExitCode { code: Option<i32> },
  TimedOut,
  /// The program could not be found at all.
  NotFound,
  SpawnFailed { reason: String },
}

impl fmt::Display for ToolStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ToolStatus::Success => write!(f, "succeeded"),
      ToolStatus::ExitCode { code: Some(code) } => write!(f, "exited with code {}", code),
      ToolStatus::ExitCode { code: None } => write!(f, "was terminated by a signal"),
      ToolStatus::TimedOut => write!(f, "timed out"),
      ToolStatus::NotFound => write!(f, "not found"),
      ToolStatus::SpawnFailed { reason } => write!(f, "failed to start: {}", reason),
    }
  }
}

/// Result of one tool invocation. Never an error: failures live in `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
  pub status: ToolStatus,
  pub stdout: String,
  pub stderr: String,
  pub duration: Duration,
}

impl ToolOutcome {
  fn unstarted(status: ToolStatus, start: Instant) -> Self {
    Self {
      status,
      stdout: String::new(),
      stderr: String::new(),
      duration: start.elapsed(),
    }
  }

  pub fn success(&self) -> bool {
    self.status == ToolStatus::Success
  }

  pub fn timed_out(&self) -> bool {
    self.status == ToolStatus::TimedOut
  }

  pub fn exit_code(&self) -> Option<i32> {
    match self.status {
      ToolStatus::Success => Some(0),
      ToolStatus::ExitCode { code } => code,
      _ => None,
    }
  }

  /// stdout followed by stderr, for logs and step results.
  pub fn combined_output(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (_, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (false, false) => format!("{}\n--- STDERR ---\n{}", self.stdout, self.stderr),
    }
  }

  /// Converts a failed outcome into a [`StepError`] attributed to `tool`.
  pub fn check(self, tool: &str) -> Result<ToolOutcome, StepError> {
    if self.success() {
      Ok(self)
    } else {
      Err(StepError::Tool {
        tool: tool.to_string(),
        output: self.combined_output(),
        status: self.status,
      })
    }
  }
}

/// Runs external tools with a timeout and captured output.
#[derive(Debug, Clone, Default)]
pub struct ToolInvoker;

impl ToolInvoker {
  pub fn new() -> Self {
    Self
  }

  /// Runs `invocation` to completion or until its timeout elapses.
  pub async fn run(&self, invocation: &Invocation) -> ToolOutcome {
    let start = Instant::now();

    if !invocation.cwd.is_dir() {
      return ToolOutcome::unstarted(
        ToolStatus::SpawnFailed {
          reason: format!(
            "working directory {} does not exist",
            invocation.cwd.display()
          ),
        },
        start,
      );
    }

    let mut cmd = Command::new(&invocation.program);
    cmd
      .args(&invocation.args)
      .current_dir(&invocation.cwd)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    // own group, so a timeout reaches everything the tool spawns
    #[cfg(unix)]
    {
      cmd.process_group(0);
    }

    tracing::debug!(cmd = %invocation.display(), cwd = %invocation.cwd.display(), "Spawning tool");
    let mut child = match cmd.spawn() {
      Ok(child) => child,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        tracing::error!(program = %invocation.program, "Tool not found");
        return ToolOutcome::unstarted(ToolStatus::NotFound, start);
      }
      Err(e) => {
        tracing::error!(program = %invocation.program, error = %e, "Failed to spawn tool");
        return ToolOutcome::unstarted(
          ToolStatus::SpawnFailed {
            reason: e.to_string(),
          },
          start,
        );
      }
    };

    let stdout_task = spawn_reader(child.stdout.take(), "stdout");
    let stderr_task = spawn_reader(child.stderr.take(), "stderr");

    let status = match tokio::time::timeout(invocation.timeout, child.wait()).await {
      Ok(Ok(exit)) if exit.success() => ToolStatus::Success,
      Ok(Ok(exit)) => ToolStatus::ExitCode { code: exit.code() },
      Ok(Err(e)) => ToolStatus::SpawnFailed {
        reason: format!("failed to wait for process: {}", e),
      },
      Err(_) => {
        tracing::warn!(
          program = %invocation.program,
          timeout = ?invocation.timeout,
          "Tool exceeded its timeout, killing it"
        );
        kill_tree(&mut child).await;
        ToolStatus::TimedOut
      }
    };

    let outcome = ToolOutcome {
      status,
      stdout: drain(stdout_task).await,
      stderr: drain(stderr_task).await,
      duration: start.elapsed(),
    };
    tracing::debug!(
      program = %invocation.program,
      status = %outcome.status,
      elapsed = ?outcome.duration,
      "Tool finished"
    );
    outcome
  }
}

/// Kills the tool and, on unix, every process in its group.
async fn kill_tree(child: &mut Child) {
  #[cfg(unix)]
  {
    if let Some(pid) = child.id() {
      // SAFETY: kill(2) only sends a signal; a negative pid targets the group.
      let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
      if rc != 0 {
        tracing::warn!(
          pid,
          error = %std::io::Error::last_os_error(),
          "Failed to kill tool process group"
        );
      }
    }
  }
  if let Err(e) = child.kill().await {
    tracing::warn!(error = %e, "Failed to kill timed-out tool");
  }
}

fn spawn_reader<R>(stream: Option<R>, target: &'static str) -> JoinHandle<String>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(
    async move {
      match stream {
        Some(stream) => read_stream(stream, target).await,
        None => String::new(),
      }
    }
    .instrument(tracing::trace_span!("output_reader", target)),
  )
}

/// Reads lines from a tool's output stream, tracing each one.
async fn read_stream<R: AsyncRead + Unpin>(stream: R, target: &'static str) -> String {
  let mut reader = BufReader::new(stream).lines();
  let mut captured = String::new();

  loop {
    match reader.next_line().await {
      Ok(Some(line)) => {
        tracing::trace!(target, "{}", line);
        captured.push_str(&line);
        captured.push('\n');
      }
      Ok(None) => break,
      Err(e) => {
        tracing::warn!(target, error = %e, "Failed to read tool output");
        break;
      }
    }
  }
  captured
}

async fn drain(handle: JoinHandle<String>) -> String {
  match tokio::time::timeout(DRAIN_GRACE, handle).await {
    Ok(Ok(output)) => output,
    Ok(Err(e)) => {
      tracing::warn!(error = %e, "Output reader task failed");
      String::new()
    }
    Err(_) => String::new(),
  }
}

/// Resolves `name` to an executable, either as a path or by searching `PATH`.
pub fn resolve_tool(name: &str) -> Option<PathBuf> {
  let candidate = Path::new(name);
  if candidate.is_absolute() || candidate.components().count() > 1 {
    return with_exe_suffix(candidate.to_path_buf())
      .into_iter()
      .find(|p| is_executable(p));
  }

  let search = env::var_os("PATH")?;
  env::split_paths(&search)
    .flat_map(|dir| with_exe_suffix(dir.join(name)))
    .find(|p| is_executable(p))
}

/// Candidate spellings of an executable path; adds ".exe" on Windows.
fn with_exe_suffix(path: PathBuf) -> Vec<PathBuf> {
  #[cfg(target_os = "windows")]
  {
    if path.extension().is_none() {
      let mut p = path.clone().into_os_string();
      p.push(".exe");
      return vec![path, PathBuf::from(p)];
    }
  }
  vec![path]
}

fn is_executable(path: &Path) -> bool {
  let Ok(meta) = path.metadata() else {
    return false;
  };
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
  }
  #[cfg(not(unix))]
  {
    meta.is_file()
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  fn sh(script: &str, timeout: Duration) -> Invocation {
    Invocation::new("sh", env::temp_dir(), timeout).args(["-c", script])
  }

  #[tokio::test]
  async fn captures_output_of_successful_tool() {
    let outcome = ToolInvoker::new()
      .run(&sh("echo hello; echo oops >&2", Duration::from_secs(10)))
      .await;

    assert!(outcome.success());
    assert_eq!(outcome.stdout, "hello\n");
    assert_eq!(outcome.stderr, "oops\n");
    assert_eq!(outcome.exit_code(), Some(0));
  }

  #[tokio::test]
  async fn nonzero_exit_is_not_a_timeout() {
    let outcome = ToolInvoker::new()
      .run(&sh("exit 3", Duration::from_secs(10)))
      .await;

    assert_eq!(outcome.status, ToolStatus::ExitCode { code: Some(3) });
    assert!(!outcome.timed_out());
  }

  #[tokio::test]
  async fn slow_tool_is_killed_and_reported_as_timed_out() {
    let outcome = ToolInvoker::new()
      .run(&sh("exec sleep 10", Duration::from_millis(200)))
      .await;

    assert_eq!(outcome.status, ToolStatus::TimedOut);
    assert!(outcome.duration < Duration::from_secs(5));
  }

  #[tokio::test]
  async fn timeout_kills_grandchildren_too() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let script = format!("sh -c 'sleep 2; touch \"{}\"'; true", marker.display());

    let outcome = ToolInvoker::new()
      .run(&sh(&script, Duration::from_millis(200)))
      .await;

    assert_eq!(outcome.status, ToolStatus::TimedOut);
    assert!(outcome.duration < Duration::from_secs(2), "{:?}", outcome.duration);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists());
  }

  #[tokio::test]
  async fn missing_program_is_not_found() {
    let inv = Invocation::new(
      "tapeflow-no-such-tool-7f3a",
      env::temp_dir(),
      Duration::from_secs(1),
    );
    let outcome = ToolInvoker::new().run(&inv).await;

    assert_eq!(outcome.status, ToolStatus::NotFound);
  }

  #[tokio::test]
  async fn missing_working_directory_is_a_spawn_failure() {
    let inv = Invocation::new("sh", "/definitely/not/here", Duration::from_secs(1));
    let outcome = ToolInvoker::new().run(&inv).await;

    assert!(matches!(outcome.status, ToolStatus::SpawnFailed { .. }));
  }

  #[test]
  fn check_attributes_failure_to_tool() {
    let outcome = ToolOutcome {
      status: ToolStatus::ExitCode { code: Some(1) },
      stdout: String::new(),
      stderr: "bad rule\n".to_string(),
      duration: Duration::ZERO,
    };

    let err = outcome.check("magic").unwrap_err();
    assert_eq!(err.to_string(), "magic exited with code 1");
    assert_eq!(err.output(), "bad rule\n");
  }

  #[test]
  fn resolves_tools_on_path_only_when_present() {
    assert!(resolve_tool("sh").is_some());
    assert!(resolve_tool("tapeflow-no-such-tool-7f3a").is_none());
    assert!(resolve_tool("/definitely/not/here/tool").is_none());
  }
}
