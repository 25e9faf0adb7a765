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

//! Linear, fail-fast step executor.
//!
//! A run moves through `Idle → Validating → Running(i) → … → Completed`,
//! passing through `Aborted` when a required step fails. Pre-flight failures
//! stop the run before the output root is even created.

use crate::artifact::ArtifactStore;
use crate::config::Configuration;
use crate::error::PreflightError;
use crate::error::StepError;
use crate::error::TapeflowError;
use crate::invoker::ToolInvoker;
use crate::invoker::ToolOutcome;
use crate::invoker::resolve_tool;
use crate::logging::RunLog;
use crate::scripts::ToolScript;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use tracing::Instrument;

/// Default bound on a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(3600);

/// What a step hands to its action.
pub struct StepEnv<'a> {
  pub invoker: &'a ToolInvoker,
  pub artifacts: &'a ArtifactStore,
  pub timeout: Duration,
}

impl StepEnv<'_> {
  /// Writes the script file (if any) into the output root, then runs the tool there.
  pub async fn run_script(&self, script: &ToolScript) -> Result<ToolOutcome, StepError> {
    if let Some(file) = &script.script {
      self.artifacts.write(&file.text, &file.name)?;
    }
    let invocation = script.invocation(self.artifacts.root(), self.timeout);
    tracing::info!(cmd = %invocation.display(), "Running {}", script.tool);
    self.invoker.run(&invocation).await.check(&script.tool)
  }
}

/// Successful output of a step action.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
  pub message: String,
  pub output: String,
}

impl StepOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      output: String::new(),
    }
  }

  pub fn with_output(mut self, output: impl Into<String>) -> Self {
    self.output = output.into();
    self
  }
}

/// The work a step performs.
#[async_trait]
pub trait StepAction: Send + Sync {
  async fn execute(&self, env: &StepEnv<'_>) -> Result<StepOutput, StepError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
  /// Failure aborts the run.
  Required,
  /// Failure is recorded but never fails the run. With `after_failure`,
  /// the step still runs after a required step has failed.
  BestEffort { after_failure: bool },
}

type RunPredicate = Box<dyn Fn(&Configuration) -> bool + Send + Sync>;

/// One named unit of work.
pub struct Step {
  name: String,
  policy: StepPolicy,
  predicate: RunPredicate,
  action: Box<dyn StepAction>,
}

impl Step {
  pub fn required(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
    Self::new(name, StepPolicy::Required, action)
  }

  pub fn best_effort(
    name: impl Into<String>,
    action: impl StepAction + 'static,
    after_failure: bool,
  ) -> Self {
    Self::new(name, StepPolicy::BestEffort { after_failure }, action)
  }

  fn new(name: impl Into<String>, policy: StepPolicy, action: impl StepAction + 'static) -> Self {
    Self {
      name: name.into(),
      policy,
      predicate: Box::new(|_| true),
      action: Box::new(action),
    }
  }

  /// Runs the step only when `predicate` holds for the run's configuration.
  pub fn run_if(mut self, predicate: impl Fn(&Configuration) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Box::new(predicate);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  fn is_required(&self) -> bool {
    self.policy == StepPolicy::Required
  }

  fn runs_after_failure(&self) -> bool {
    matches!(self.policy, StepPolicy::BestEffort { after_failure: true })
  }
}

/// Predicate that reads a boolean flag, defaulting when absent.
pub fn flag(key: &'static str, default: bool) -> impl Fn(&Configuration) -> bool + Send + Sync {
  move |config| config.bool_or(key, default).unwrap_or(default)
}

/// Outcome of one step. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
  pub name: String,
  pub required: bool,
  pub ran: bool,
  pub success: bool,
  pub message: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub output: String,
  pub duration_ms: u64,
}

/// Ordered step results plus the overall verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
  pub flow: String,
  pub run_id: String,
  pub success: bool,
  /// The required step that aborted the run, if any.
  pub aborted_at: Option<String>,
  pub steps: Vec<StepResult>,
}

impl RunResult {
  pub fn step(&self, name: &str) -> Option<&StepResult> {
    self.steps.iter().find(|s| s.name == name)
  }

  /// File name the result is persisted under, relative to the output root.
  pub fn file_name(flow: &str) -> String {
    format!("{}_run.json", flow)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
  File,
  Directory,
  Layout,
  MacroDescription,
}

/// Checks run in the `Validating` phase.
#[derive(Debug, Default)]
pub struct Preflight {
  tools: Vec<String>,
  inputs: Vec<(String, PathBuf, InputKind)>,
}

impl Preflight {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn tool(mut self, tool: impl Into<String>) -> Self {
    self.tools.push(tool.into());
    self
  }

  pub fn input(mut self, name: impl Into<String>, path: impl Into<PathBuf>, kind: InputKind) -> Self {
    self.inputs.push((name.into(), path.into(), kind));
    self
  }

  /// First failing check wins: tools, then inputs, in registration order.
  pub fn check(&self, artifacts: &ArtifactStore) -> Result<(), PreflightError> {
    for tool in &self.tools {
      match resolve_tool(tool) {
        Some(path) => tracing::debug!(%tool, path = %path.display(), "Resolved tool"),
        None => return Err(PreflightError::ToolNotFound { tool: tool.clone() }),
      }
    }

    for (name, path, kind) in &self.inputs {
      let present = match kind {
        InputKind::Directory => path.is_dir(),
        _ => path.is_file(),
      };
      if !present {
        return Err(PreflightError::InputMissing {
          name: name.clone(),
          path: path.clone(),
        });
      }
      let (valid, kind_name) = match kind {
        InputKind::File | InputKind::Directory => (true, ""),
        InputKind::Layout => (artifacts.validate_layout(path), "layout"),
        InputKind::MacroDescription => (
          artifacts.validate_macro_description(path),
          "macro description",
        ),
      };
      if !valid {
        return Err(PreflightError::InputInvalid {
          name: name.clone(),
          path: path.clone(),
          kind: kind_name,
        });
      }
    }
    Ok(())
  }
}

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Validating,
  Running(usize),
  Aborted,
  Completed,
}

fn advance(phase: &mut Phase, next: Phase) {
  tracing::debug!(from = ?*phase, to = ?next, "Phase transition");
  *phase = next;
}

/// Drives an ordered list of steps against one output root.
pub struct PipelineExecutor {
  config: Configuration,
  artifacts: ArtifactStore,
  invoker: ToolInvoker,
  log: RunLog,
  timeout: Duration,
  preflight: Preflight,
  steps: Vec<Step>,
}

impl PipelineExecutor {
  pub fn new(config: Configuration, artifacts: ArtifactStore, log: RunLog) -> Self {
    Self {
      config,
      artifacts,
      invoker: ToolInvoker::new(),
      log,
      timeout: DEFAULT_TOOL_TIMEOUT,
      preflight: Preflight::default(),
      steps: Vec::new(),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_preflight(mut self, preflight: Preflight) -> Self {
    self.preflight = preflight;
    self
  }

  pub fn step(mut self, step: Step) -> Self {
    self.steps.push(step);
    self
  }

  /// Runs pre-flight and then every step, persisting the result.
  ///
  /// Returns an error only when pre-flight fails or the result cannot be
  /// persisted. Step failures are part of the returned [`RunResult`].
  pub async fn run(&self) -> Result<RunResult, TapeflowError> {
    let span = self.log.span().clone();
    self.run_phases().instrument(span).await
  }

  async fn run_phases(&self) -> Result<RunResult, TapeflowError> {
    let mut phase = Phase::Idle;
    tracing::info!(config = ?self.config.source(), "--- Starting {} ---", self.log.flow());

    advance(&mut phase, Phase::Validating);
    if let Err(e) = self.preflight.check(&self.artifacts) {
      tracing::error!(error = %e, "Pre-flight check failed; no step will run");
      advance(&mut phase, Phase::Aborted);
      return Err(e.into());
    }
    self
      .artifacts
      .ensure_root()
      .map_err(|source| PreflightError::OutputRoot {
        path: self.artifacts.root().to_path_buf(),
        source,
      })?;

    let env = StepEnv {
      invoker: &self.invoker,
      artifacts: &self.artifacts,
      timeout: self.timeout,
    };

    let mut results = Vec::with_capacity(self.steps.len());
    let mut aborted_at: Option<String> = None;

    for (index, step) in self.steps.iter().enumerate() {
      if aborted_at.is_some() && !step.runs_after_failure() {
        tracing::debug!(step = %step.name, "Not running after abort");
        continue;
      }
      if aborted_at.is_none() {
        advance(&mut phase, Phase::Running(index + 1));
      }

      let result = self
        .execute(step, &env)
        .instrument(self.log.step_span(&step.name))
        .await;

      if step.is_required() && !result.success && aborted_at.is_none() {
        aborted_at = Some(step.name.clone());
        advance(&mut phase, Phase::Aborted);
      }
      results.push(result);
    }

    advance(&mut phase, Phase::Completed);
    match &aborted_at {
      None => tracing::info!("--- {} completed successfully ---", self.log.flow()),
      Some(step) => tracing::error!(%step, "--- {} failed ---", self.log.flow()),
    }

    let result = RunResult {
      flow: self.log.flow().to_string(),
      run_id: self.log.run_id().to_string(),
      success: aborted_at.is_none(),
      aborted_at,
      steps: results,
    };
    let path = self
      .artifacts
      .write_json(&result, RunResult::file_name(self.log.flow()))?;
    tracing::info!(path = %path.display(), "Run result written");
    Ok(result)
  }

  async fn execute(&self, step: &Step, env: &StepEnv<'_>) -> StepResult {
    if !(step.predicate)(&self.config) {
      tracing::info!("Skipping step (disabled by configuration)");
      return StepResult {
        name: step.name.clone(),
        required: step.is_required(),
        ran: false,
        success: true,
        message: "skipped".to_string(),
        output: String::new(),
        duration_ms: 0,
      };
    }

    tracing::info!("Running step");
    let start = Instant::now();
    let outcome = step.action.execute(env).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (success, message, output) = match outcome {
      Ok(out) => {
        tracing::info!(elapsed_ms = duration_ms, "{}", out.message);
        (true, out.message, out.output)
      }
      Err(e) => {
        if step.is_required() {
          tracing::error!(error = %e, "Required step failed");
        } else {
          tracing::warn!(error = %e, "Best-effort step failed");
        }
        (false, e.to_string(), e.output().to_string())
      }
    };

    StepResult {
      name: step.name.clone(),
      required: step.is_required(),
      ran: true,
      success,
      message,
      output,
      duration_ms,
    }
  }
}
