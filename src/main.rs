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
use Commands::Macro;
use Commands::Merge;
use Commands::Regress;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tapeflow::cli::Cli;
use tapeflow::cli::Commands;
use tapeflow::cli::MacroArgs;
use tapeflow::cli::MergeArgs;
use tapeflow::cli::RegressArgs;
use tapeflow::config::Configuration;
use tapeflow::flows::layout;
use tapeflow::flows::memory;
use tapeflow::logging::LogGuard;
use tapeflow::logging::LogSettings;
use tapeflow::logging::RunLog;
use tapeflow::logging::setup_tracing;
use tapeflow::regression;
use tapeflow::regression::RegressionConfig;
use tapeflow::regression::RegressionRunner;

#[tokio::main]
async fn main() -> ExitCode {
  let Cli { command, debug } = Cli::parse();
  // set once tracing is installed; errors before that go straight to stderr
  let mut logging: Option<LogGuard> = None;

  let outcome = match command {
    Merge(args) => merge(args, debug, &mut logging).await,
    Macro(args) => generate_macro(args, debug, &mut logging).await,
    Regress(args) => regress(args, debug, &mut logging).await,
  };

  match outcome {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(e) => {
      if logging.is_some() {
        tracing::error!("{:#}", e);
      } else {
        eprintln!("Error: {:#}", e);
      }
      ExitCode::FAILURE
    }
  }
}

fn start_logging(
  logging: &mut Option<LogGuard>,
  log_dir: PathBuf,
  flow: &str,
  debug: bool,
) -> Result<()> {
  let guard = setup_tracing(&LogSettings {
    log_dir: Some(log_dir),
    file_stem: flow.to_string(),
    debug,
  })?;
  if let Some(file) = &guard.log_file {
    tracing::debug!(path = %file.display(), "Logging to file");
  }
  *logging = Some(guard);
  Ok(())
}

async fn merge(args: MergeArgs, debug: bool, logging: &mut Option<LogGuard>) -> Result<bool> {
  let config = Configuration::load(&args.config)?.apply_overrides(args.overrides());
  start_logging(logging, config.path_or("log_dir", "logs")?, layout::FLOW_NAME, debug)?;

  let executor = layout::executor(config, RunLog::new(layout::FLOW_NAME))?;
  let result = executor
    .run()
    .await
    .context("Layout merge flow did not start")?;
  Ok(result.success)
}

async fn generate_macro(
  args: MacroArgs,
  debug: bool,
  logging: &mut Option<LogGuard>,
) -> Result<bool> {
  let config = Configuration::load(&args.config)?.apply_overrides(args.overrides());
  start_logging(logging, config.path_or("log_dir", "logs")?, memory::FLOW_NAME, debug)?;

  // before the parameters are validated
  let compiler = memory::check_compiler_env(|name| std::env::var_os(name))
    .context("Memory compiler environment is not usable")?;

  let executor = memory::executor(config, compiler, RunLog::new(memory::FLOW_NAME))?;
  let result = executor
    .run()
    .await
    .context("Memory macro flow did not start")?;
  Ok(result.success)
}

async fn regress(args: RegressArgs, debug: bool, logging: &mut Option<LogGuard>) -> Result<bool> {
  let config = RegressionConfig::load(&args.config)?;
  start_logging(logging, config.log_dir.clone(), regression::FLOW_NAME, debug)?;
  if !args.config.exists() {
    tracing::warn!(path = %args.config.display(), "Config file not found, using defaults");
  }

  let summary = RegressionRunner::new(config, RunLog::new(regression::FLOW_NAME))
    .with_filter(args.tests)
    .run()
    .await?;
  Ok(summary.success())
}
