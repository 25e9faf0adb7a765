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
use crate::invoker::ToolStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error enum for the tapeflow library.
#[derive(Error, Debug)]
pub enum TapeflowError {
  #[error("Configuration error: {0}")]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("Pre-flight check failed: {0}")]
  Preflight(#[from] PreflightError),

  #[error("Artifact error: {0}")]
  Artifact(#[from] ArtifactError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors raised while loading a configuration document (src/config.rs).
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config file: {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Unsupported config file format: {path} (expected .json, .yaml, .yml or .toml)")]
  UnsupportedFormat { path: PathBuf },

  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<figment::Error>,
  },
}

/// A parameter that is missing, mistyped or out of range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid parameter '{param}': {reason}")]
pub struct ValidationError {
  pub param: String,
  pub reason: String,
}

impl ValidationError {
  pub fn new(param: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      param: param.into(),
      reason: reason.into(),
    }
  }
}

/// Failures detected before any step runs (src/pipeline.rs).
#[derive(Error, Debug)]
pub enum PreflightError {
  #[error("Required tool not found: {tool}")]
  ToolNotFound { tool: String },

  #[error("Required input '{name}' not found at {path}")]
  InputMissing { name: String, path: PathBuf },

  #[error("Required input '{name}' at {path} is not a valid {kind} file")]
  InputInvalid {
    name: String,
    path: PathBuf,
    kind: &'static str,
  },

  #[error("Required environment variables not set: {}", vars.join(", "))]
  EnvironmentUnset { vars: Vec<String> },

  #[error("Installation not found or incomplete: {path} does not exist")]
  InstallationIncomplete { path: PathBuf },

  #[error("Failed to create output directory: {path}")]
  OutputRoot {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Errors related to artifact storage (src/artifact.rs).
#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("Artifact not found: {path}")]
  NotFound { path: PathBuf },

  #[error("Failed to read artifact: {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to write artifact: {path}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to serialize artifact {path}")]
  Serialize {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Errors produced by a step action. The executor turns them into step results.
#[derive(Error, Debug)]
pub enum StepError {
  #[error("{tool} {status}")]
  Tool {
    tool: String,
    status: ToolStatus,
    output: String,
  },

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error("Expected output missing: {path}")]
  MissingOutput { path: PathBuf },

  #[error("Invalid {kind} output: {path}")]
  InvalidOutput { path: PathBuf, kind: &'static str },
}

impl StepError {
  /// Output captured from the failing tool, if any.
  pub fn output(&self) -> &str {
    match self {
      StepError::Tool { output, .. } => output,
      _ => "",
    }
  }
}
