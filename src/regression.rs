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

//! Runs every regression test through the simulator, one at a time, and
//! aggregates the outcomes.

use crate::artifact::ArtifactStore;
use crate::command::Invocation;
use crate::config::Configuration;
use crate::error::PreflightError;
use crate::error::TapeflowError;
use crate::error::ValidationError;
use crate::invoker::ToolInvoker;
use crate::invoker::ToolStatus;
use crate::logging::RunLog;
use chrono::DateTime;
use chrono::Local;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Instrument;

pub const FLOW_NAME: &str = "regression";
pub const SUMMARY_FILE: &str = "regression_summary.json";

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionConfig {
  pub simulator: String,
  pub coverage: bool,
  pub waves: bool,
  pub timeout: Duration,
  pub test_dir: PathBuf,
  pub log_dir: PathBuf,
  pub result_dir: PathBuf,
  pub top_module: String,
  pub test_extensions: Vec<String>,
}

impl Default for RegressionConfig {
  fn default() -> Self {
    Self {
      simulator: "verilator".to_string(),
      coverage: true,
      waves: false,
      timeout: Duration::from_secs(3600),
      test_dir: PathBuf::from("tests"),
      log_dir: PathBuf::from("logs"),
      result_dir: PathBuf::from("results"),
      top_module: "simple_arm_tb".to_string(),
      test_extensions: vec!["sv".to_string()],
    }
  }
}

impl TryFrom<&Configuration> for RegressionConfig {
  type Error = ValidationError;

  fn try_from(config: &Configuration) -> Result<Self, Self::Error> {
    let defaults = RegressionConfig::default();

    let timeout = match config.optional_number("timeout")? {
      Some(secs) if secs <= 0.0 => {
        return Err(ValidationError::new("timeout", "must be positive"));
      }
      Some(secs) => Duration::try_from_secs_f64(secs)
        .map_err(|e| ValidationError::new("timeout", e.to_string()))?,
      None => defaults.timeout,
    };
    let mut test_extensions = config.string_list("test_extensions")?;
    if test_extensions.is_empty() {
      test_extensions = defaults.test_extensions;
    }

    Ok(RegressionConfig {
      simulator: config.string_or("simulator", &defaults.simulator)?,
      coverage: config.bool_or("coverage", defaults.coverage)?,
      waves: config.bool_or("waves", defaults.waves)?,
      timeout,
      test_dir: config.path_or("test_dir", "tests")?,
      log_dir: config.path_or("log_dir", "logs")?,
      result_dir: config.path_or("result_dir", "results")?,
      top_module: config.string_or("top_module", &defaults.top_module)?,
      test_extensions: test_extensions
        .into_iter()
        .map(|e| e.trim_start_matches('.').to_string())
        .collect(),
    })
  }
}

impl RegressionConfig {
  /// Loads the regression configuration. A missing file is not an error;
  /// the defaults apply and the caller decides how loudly to say so.
  pub fn load(path: &Path) -> Result<Self, TapeflowError> {
    if !path.exists() {
      return Ok(Self::default());
    }
    let config = Configuration::load(path)?;
    Ok(Self::try_from(&config)?)
  }
}

/// One test source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
  /// File name, extension included, so `alu.sv` and `alu.v` stay apart.
  /// Also names the per-test log and result files.
  pub name: String,
  pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
  pub test: String,
  pub path: PathBuf,
  pub passed: bool,
  pub timed_out: bool,
  pub status: ToolStatus,
  pub exit_code: Option<i32>,
  pub duration_ms: u64,
  pub log_path: PathBuf,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionSummary {
  pub started_at: DateTime<Local>,
  pub total: usize,
  pub passed: usize,
  /// Tests that ran to completion and failed. Timeouts are counted apart.
  pub failed: usize,
  pub timed_out: usize,
  /// Every test that did not pass, timeouts included, in run order.
  pub failing: Vec<String>,
  pub outcomes: Vec<TestOutcome>,
}

impl RegressionSummary {
  fn new(started_at: DateTime<Local>, outcomes: Vec<TestOutcome>) -> Self {
    let passed = outcomes.iter().filter(|o| o.passed).count();
    let timed_out = outcomes.iter().filter(|o| o.timed_out).count();
    Self {
      started_at,
      total: outcomes.len(),
      passed,
      failed: outcomes.len() - passed - timed_out,
      timed_out,
      failing: outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| o.test.clone())
        .collect(),
      outcomes,
    }
  }

  /// True when at least one test ran and none failed or timed out.
  pub fn success(&self) -> bool {
    self.total > 0 && self.passed == self.total
  }
}

pub struct RegressionRunner {
  config: RegressionConfig,
  filter: Vec<String>,
  invoker: ToolInvoker,
  log: RunLog,
}

impl RegressionRunner {
  pub fn new(config: RegressionConfig, log: RunLog) -> Self {
    Self {
      config,
      filter: Vec::new(),
      invoker: ToolInvoker::new(),
      log,
    }
  }

  /// Restricts the run to tests whose stem or file name is listed.
  pub fn with_filter(mut self, names: Vec<String>) -> Self {
    self.filter = names;
    self
  }

  /// Test files directly under the test directory, sorted by name.
  pub fn discover(&self) -> Result<Vec<TestCase>, TapeflowError> {
    let dir = &self.config.test_dir;
    if !dir.is_dir() {
      return Err(
        PreflightError::InputMissing {
          name: "test_dir".to_string(),
          path: dir.clone(),
        }
        .into(),
      );
    }

    let mut tests = Vec::new();
    for entry in fs::read_dir(dir)? {
      let path = entry?.path();
      if !path.is_file() {
        continue;
      }
      let matches_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| self.config.test_extensions.iter().any(|x| x == e));
      if !matches_extension {
        continue;
      }
      let (Some(stem), Some(file_name)) = (
        path.file_stem().and_then(|s| s.to_str()),
        path.file_name().and_then(|s| s.to_str()),
      ) else {
        tracing::warn!(path = %path.display(), "Skipping test with non UTF-8 name");
        continue;
      };
      if !self.filter.is_empty() && !self.filter.iter().any(|f| f == stem || f == file_name) {
        continue;
      }
      tests.push(TestCase {
        name: file_name.to_string(),
        path,
      });
    }
    tests.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(tests)
  }

  pub fn log_path(&self, test: &TestCase) -> PathBuf {
    self.config.log_dir.join(format!("{}.log", test.name))
  }

  /// Simulator command line for one test.
  pub fn command_for(&self, test: &TestCase) -> Invocation {
    let cfg = &self.config;
    let mut invocation = Invocation::new(&cfg.simulator, ".", cfg.timeout);
    if cfg.coverage {
      invocation = invocation.args(["--coverage", "true"]);
    }
    if cfg.waves {
      invocation = invocation.args(["--waves", "true"]);
    }
    invocation
      .arg("--test")
      .arg(test.path.display().to_string())
      .arg("--log")
      .arg(self.log_path(test).display().to_string())
      .arg("--top")
      .arg(&cfg.top_module)
  }

  /// Runs every discovered test and persists each outcome and the summary.
  pub async fn run(&self) -> Result<RegressionSummary, TapeflowError> {
    let span = self.log.span().clone();
    self.run_all().instrument(span).await
  }

  async fn run_all(&self) -> Result<RegressionSummary, TapeflowError> {
    let started_at = Local::now();
    fs::create_dir_all(&self.config.log_dir)?;
    let results = ArtifactStore::new(&self.config.result_dir);
    results.ensure_root()?;

    let tests = self.discover()?;
    if tests.is_empty() {
      tracing::error!(dir = %self.config.test_dir.display(), "No tests found");
    } else {
      tracing::info!(count = tests.len(), "Starting regression");
    }

    let mut outcomes = Vec::with_capacity(tests.len());
    for test in &tests {
      let outcome = self
        .run_test(test)
        .instrument(self.log.test_span(&test.name))
        .await;
      // a lost record must not cost the summary
      if let Err(e) = results.write_json(&outcome, format!("{}.json", test.name)) {
        tracing::error!(test = %test.name, error = %e, "Failed to write test result");
      }
      outcomes.push(outcome);
    }

    let summary = RegressionSummary::new(started_at, outcomes);
    let path = results.write_json(&summary, SUMMARY_FILE)?;
    tracing::info!(
      total = summary.total,
      passed = summary.passed,
      failed = summary.failed,
      timed_out = summary.timed_out,
      "Regression summary"
    );
    if !summary.failing.is_empty() {
      tracing::error!("Failing tests: {}", summary.failing.join(", "));
    }
    tracing::info!(path = %path.display(), "Summary written");
    Ok(summary)
  }

  async fn run_test(&self, test: &TestCase) -> TestOutcome {
    let invocation = self.command_for(test);
    tracing::info!("Running test: {}", test.name);
    tracing::debug!(cmd = %invocation.display(), "Command");

    let outcome = self.invoker.run(&invocation).await;
    let passed = outcome.success();
    if passed {
      tracing::info!(elapsed_ms = outcome.duration.as_millis() as u64, "Test passed");
    } else if outcome.timed_out() {
      tracing::error!("Test {} timed out", test.name);
    } else {
      tracing::error!(status = %outcome.status, "Test {} failed", test.name);
    }

    TestOutcome {
      test: test.name.clone(),
      path: test.path.clone(),
      passed,
      timed_out: outcome.timed_out(),
      exit_code: outcome.exit_code(),
      duration_ms: outcome.duration.as_millis() as u64,
      log_path: self.log_path(test),
      output: outcome.combined_output(),
      status: outcome.status,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::tempdir;

  fn runner(config: RegressionConfig) -> RegressionRunner {
    RegressionRunner::new(config, RunLog::new(FLOW_NAME))
  }

  #[test]
  fn defaults_apply_to_absent_keys() {
    let config = Configuration::from_values(
      json!({"waves": true, "timeout": 5})
        .as_object()
        .cloned()
        .unwrap(),
    );
    let cfg = RegressionConfig::try_from(&config).unwrap();

    assert_eq!(cfg.simulator, "verilator");
    assert!(cfg.coverage);
    assert!(cfg.waves);
    assert_eq!(cfg.timeout, Duration::from_secs(5));
    assert_eq!(cfg.test_extensions, vec!["sv"]);
  }

  #[test]
  fn oversized_timeout_is_a_validation_error() {
    let config = Configuration::from_values(
      json!({"timeout": 1e30}).as_object().cloned().unwrap(),
    );
    let err = RegressionConfig::try_from(&config).unwrap_err();
    assert_eq!(err.param, "timeout");
  }

  #[test]
  fn missing_config_file_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let cfg = RegressionConfig::load(&dir.path().join("absent.json")).unwrap();
    assert_eq!(cfg, RegressionConfig::default());
  }

  #[test]
  fn command_line_is_deterministic() {
    let cfg = RegressionConfig {
      waves: true,
      log_dir: PathBuf::from("logs"),
      ..RegressionConfig::default()
    };
    let test = TestCase {
      name: "alu_add.sv".to_string(),
      path: PathBuf::from("tests/alu_add.sv"),
    };

    let invocation = runner(cfg).command_for(&test);

    assert_eq!(invocation.program, "verilator");
    assert_eq!(
      invocation.args,
      vec![
        "--coverage",
        "true",
        "--waves",
        "true",
        "--test",
        "tests/alu_add.sv",
        "--log",
        "logs/alu_add.sv.log",
        "--top",
        "simple_arm_tb"
      ]
    );
  }

  #[test]
  fn discovery_is_sorted_and_filtered() {
    let dir = tempdir().unwrap();
    for name in ["b_branch.sv", "a_alu.sv", "notes.txt", "c_mem.sv"] {
      fs::write(dir.path().join(name), "").unwrap();
    }
    fs::create_dir(dir.path().join("nested.sv")).unwrap();
    let cfg = RegressionConfig {
      test_dir: dir.path().to_path_buf(),
      ..RegressionConfig::default()
    };

    let all = runner(cfg.clone()).discover().unwrap();
    let names: Vec<_> = all.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["a_alu.sv", "b_branch.sv", "c_mem.sv"]);

    let some = runner(cfg)
      .with_filter(vec!["c_mem.sv".to_string(), "a_alu".to_string()])
      .discover()
      .unwrap();
    let names: Vec<_> = some.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["a_alu.sv", "c_mem.sv"]);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn timeouts_are_counted_apart_from_failures() {
    use crate::flows::test_support::fake_tool;

    let dir = tempdir().unwrap();
    let tests = dir.path().join("tests");
    fs::create_dir(&tests).unwrap();
    for i in 0..7 {
      fs::write(tests.join(format!("pass_{}.sv", i)), "pass").unwrap();
    }
    fs::write(tests.join("fail_0.sv"), "fail").unwrap();
    fs::write(tests.join("fail_1.sv"), "fail").unwrap();
    fs::write(tests.join("hang_0.sv"), "hang").unwrap();

    let simulator = fake_tool(
      dir.path(),
      "sim",
      r#"test=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--test" ]; then test="$2"; fi
  shift
done
case "$(cat "$test")" in
  hang) exec sleep 10 ;;
  fail) echo "assertion failed" >&2; exit 1 ;;
esac
echo PASS
"#,
    );
    let cfg = RegressionConfig {
      simulator: simulator.display().to_string(),
      timeout: Duration::from_millis(500),
      test_dir: tests,
      log_dir: dir.path().join("logs"),
      result_dir: dir.path().join("results"),
      ..RegressionConfig::default()
    };

    let summary = runner(cfg).run().await.unwrap();

    assert_eq!(summary.total, 10);
    assert_eq!(summary.passed, 7);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.failing, vec!["fail_0.sv", "fail_1.sv", "hang_0.sv"]);
    assert!(!summary.success());

    let results = dir.path().join("results");
    assert!(results.join(SUMMARY_FILE).exists());
    let hang: TestOutcome =
      serde_json::from_str(&fs::read_to_string(results.join("hang_0.sv.json")).unwrap()).unwrap();
    assert!(hang.timed_out);
    assert!(!hang.passed);
    let fail: TestOutcome =
      serde_json::from_str(&fs::read_to_string(results.join("fail_0.sv.json")).unwrap()).unwrap();
    assert_eq!(fail.exit_code, Some(1));
    assert!(fail.output.contains("assertion failed"));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn tests_sharing_a_stem_keep_separate_outputs() {
    use crate::flows::test_support::fake_tool;

    let dir = tempdir().unwrap();
    let tests = dir.path().join("tests");
    fs::create_dir(&tests).unwrap();
    fs::write(tests.join("alu.sv"), "pass").unwrap();
    fs::write(tests.join("alu.v"), "fail").unwrap();

    let simulator = fake_tool(
      dir.path(),
      "sim",
      r#"while [ $# -gt 0 ]; do
  case "$1" in
    --test) test="$2" ;;
    --log) log="$2" ;;
  esac
  shift
done
cat "$test" > "$log"
[ "$(cat "$test")" = "pass" ]
"#,
    );
    let cfg = RegressionConfig {
      simulator: simulator.display().to_string(),
      coverage: false,
      test_dir: tests,
      log_dir: dir.path().join("logs"),
      result_dir: dir.path().join("results"),
      test_extensions: vec!["sv".to_string(), "v".to_string()],
      ..RegressionConfig::default()
    };

    let summary = runner(cfg).run().await.unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.failing, vec!["alu.v"]);
    let logs: Vec<_> = summary.outcomes.iter().map(|o| o.log_path.clone()).collect();
    assert_ne!(logs[0], logs[1]);
    assert_eq!(fs::read_to_string(dir.path().join("logs/alu.sv.log")).unwrap(), "pass");
    assert_eq!(fs::read_to_string(dir.path().join("logs/alu.v.log")).unwrap(), "fail");

    let results = dir.path().join("results");
    assert_eq!(fs::read_dir(&results).unwrap().count(), 3);
    let failed: TestOutcome =
      serde_json::from_str(&fs::read_to_string(results.join("alu.v.json")).unwrap()).unwrap();
    assert!(!failed.passed);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn summary_survives_a_failed_result_write() {
    use crate::flows::test_support::fake_tool;

    let dir = tempdir().unwrap();
    let tests = dir.path().join("tests");
    fs::create_dir(&tests).unwrap();
    fs::write(tests.join("alu.sv"), "").unwrap();
    fs::write(tests.join("mem.sv"), "").unwrap();
    // a directory where the result file should go makes that write fail
    fs::create_dir_all(dir.path().join("results/alu.sv.json")).unwrap();

    let cfg = RegressionConfig {
      simulator: fake_tool(dir.path(), "sim", "exit 0\n").display().to_string(),
      test_dir: tests,
      log_dir: dir.path().join("logs"),
      result_dir: dir.path().join("results"),
      ..RegressionConfig::default()
    };

    let summary = runner(cfg).run().await.unwrap();

    assert_eq!(summary.total, 2);
    assert!(summary.success());
    assert!(dir.path().join("results").join(SUMMARY_FILE).is_file());
    assert!(dir.path().join("results/mem.sv.json").is_file());
  }

  #[tokio::test]
  async fn an_empty_suite_is_not_a_success() {
    let dir = tempdir().unwrap();
    let cfg = RegressionConfig {
      test_dir: dir.path().to_path_buf(),
      log_dir: dir.path().join("logs"),
      result_dir: dir.path().join("results"),
      ..RegressionConfig::default()
    };

    let summary = runner(cfg).run().await.unwrap();
    assert_eq!(summary.total, 0);
    assert!(!summary.success());
  }
}
