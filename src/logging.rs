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
use anyhow::Context;
use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Where and how verbosely one run logs.
#[derive(Debug, Clone)]
pub struct LogSettings {
  /// Directory for the run's log file. `None` logs to stderr only.
  pub log_dir: Option<PathBuf>,
  /// File name prefix, e.g. "layout_merge".
  pub file_stem: String,
  pub debug: bool,
}

/// Keeps the file writer flushing until the run ends.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
  _file: Option<WorkerGuard>,
  pub log_file: Option<PathBuf>,
}

/// Sets up the global tracing subscriber for one run.
///
/// Always logs to stderr. With a log directory, also writes a
/// `<file_stem>_<timestamp>.log` file there (no ANSI colors).
///
/// Log level is controlled by the `RUST_LOG` env var (e.g., `RUST_LOG=info`);
/// `debug` raises the default from `info` to `debug`.
pub fn setup_tracing(settings: &LogSettings) -> Result<LogGuard> {
  let default_level = if settings.debug { "debug" } else { "info" };
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  let stderr_layer = fmt::layer().with_writer(std::io::stderr);

  match &settings.log_dir {
    Some(dir) => {
      fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
      let file_name = format!(
        "{}_{}.log",
        settings.file_stem,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
      );
      let file_appender = tracing_appender::rolling::never(dir, &file_name);
      let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

      tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(
          fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

      Ok(LogGuard {
        _file: Some(guard),
        log_file: Some(dir.join(file_name)),
      })
    }
    None => {
      tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

      Ok(LogGuard {
        _file: None,
        log_file: None,
      })
    }
  }
}

/// Logging context of a single pipeline or regression run.
///
/// Constructed once per run and handed to the executor or runner, which
/// nest every step's or test's span under [`RunLog::span`].
#[derive(Debug, Clone)]
pub struct RunLog {
  flow: String,
  run_id: String,
  span: Span,
}

impl RunLog {
  pub fn new(flow: &str) -> Self {
    let run_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let span = tracing::info_span!("run", flow = %flow, run_id = %run_id);
    Self {
      flow: flow.to_string(),
      run_id,
      span,
    }
  }

  pub fn flow(&self) -> &str {
    &self.flow
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn span(&self) -> &Span {
    &self.span
  }

  /// Child span for one step of this run.
  pub fn step_span(&self, step: &str) -> Span {
    tracing::info_span!(parent: &self.span, "step", name = %step)
  }

  /// Child span for one regression test of this run.
  pub fn test_span(&self, test: &str) -> Span {
    tracing::info_span!(parent: &self.span, "test", name = %test)
  }
}
