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
use crate::config::Overrides;
use crate::config::set_override;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tapeflow", version, about = "Build and verify orchestrator for chip tape-out flows")]
pub struct Cli {
  #[command(subcommand)]
  pub command: Commands,

  /// Raise the default log level to debug
  #[arg(long, global = true)]
  pub debug: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
  /// Merge the core and memory layouts and verify the result
  Merge(MergeArgs),

  /// Generate a memory macro with the memory compiler
  Macro(MacroArgs),

  /// Run the regression test suite
  Regress(RegressArgs),
}

#[derive(Debug, Args)]
pub struct MergeArgs {
  /// Flow configuration (.json, .yaml, .yml or .toml)
  #[arg(long, env = "TAPEFLOW_CONFIG")]
  pub config: PathBuf,

  /// Overrides `output_dir`
  #[arg(long)]
  pub output_dir: Option<PathBuf>,

  #[arg(long)]
  pub skip_drc: bool,

  #[arg(long)]
  pub skip_lvs: bool,

  /// Do not generate area and hierarchy reports
  #[arg(long)]
  pub no_reports: bool,

  /// Generate reports even when a required step failed
  #[arg(long)]
  pub reports_after_failure: bool,
}

impl MergeArgs {
  pub fn overrides(&self) -> Overrides {
    let mut overrides = Overrides::new();
    set_override(
      &mut overrides,
      "output_dir",
      self.output_dir.as_ref().map(|p| p.display().to_string()),
    );
    set_override(&mut overrides, "run_drc", self.skip_drc.then_some(false));
    set_override(&mut overrides, "run_lvs", self.skip_lvs.then_some(false));
    set_override(&mut overrides, "generate_reports", self.no_reports.then_some(false));
    set_override(
      &mut overrides,
      "report_policy",
      self.reports_after_failure.then_some("always"),
    );
    overrides
  }
}

#[derive(Debug, Args)]
pub struct MacroArgs {
  /// Macro configuration (.json, .yaml, .yml or .toml)
  #[arg(long, env = "TAPEFLOW_CONFIG")]
  pub config: PathBuf,

  /// Overrides `output_dir`
  #[arg(long)]
  pub output_dir: Option<PathBuf>,

  /// Threads the memory compiler may use
  #[arg(long)]
  pub num_threads: Option<u64>,

  /// Skip the compiler's own design rule checks
  #[arg(long)]
  pub skip_drc: bool,

  /// Skip the compiler's own layout-vs-schematic checks
  #[arg(long)]
  pub skip_lvs: bool,

  /// Overrides `process`
  #[arg(long)]
  pub tech: Option<String>,

  #[arg(long)]
  pub voltage: Option<f64>,

  #[arg(long)]
  pub frequency: Option<f64>,

  #[arg(long)]
  pub temp: Option<f64>,
}

impl MacroArgs {
  pub fn overrides(&self) -> Overrides {
    let mut overrides = Overrides::new();
    set_override(
      &mut overrides,
      "output_dir",
      self.output_dir.as_ref().map(|p| p.display().to_string()),
    );
    set_override(&mut overrides, "num_threads", self.num_threads);
    // the compiler runs both checks together
    set_override(
      &mut overrides,
      "check_lvsdrc",
      (self.skip_drc || self.skip_lvs).then_some(false),
    );
    set_override(&mut overrides, "process", self.tech.clone());
    set_override(&mut overrides, "voltage", self.voltage);
    set_override(&mut overrides, "frequency", self.frequency);
    set_override(&mut overrides, "temp", self.temp);
    overrides
  }
}

#[derive(Debug, Args)]
pub struct RegressArgs {
  /// Regression configuration; defaults apply when the file is absent
  #[arg(long, default_value = "regression_config.json")]
  pub config: PathBuf,

  /// Run only the named tests (file name or stem); repeatable
  #[arg(long = "test")]
  pub tests: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn merge_flags_become_overrides() {
    let cli = Cli::parse_from([
      "tapeflow",
      "merge",
      "--config",
      "flow.yaml",
      "--skip-drc",
      "--reports-after-failure",
    ]);
    let Commands::Merge(args) = cli.command else {
      panic!("expected merge");
    };

    let overrides = args.overrides();
    assert_eq!(overrides.get("run_drc"), Some(&json!(false)));
    assert_eq!(overrides.get("report_policy"), Some(&json!("always")));
    assert!(!overrides.contains_key("run_lvs"));
    assert!(!overrides.contains_key("output_dir"));
  }

  #[test]
  fn macro_flags_become_overrides() {
    let cli = Cli::parse_from([
      "tapeflow",
      "macro",
      "--config",
      "sram.json",
      "--tech",
      "sky130",
      "--voltage",
      "1.2",
      "--skip-lvs",
      "--debug",
    ]);
    assert!(cli.debug);
    let Commands::Macro(args) = cli.command else {
      panic!("expected macro");
    };

    let overrides = args.overrides();
    assert_eq!(overrides.get("process"), Some(&json!("sky130")));
    assert_eq!(overrides.get("voltage"), Some(&json!(1.2)));
    assert_eq!(overrides.get("check_lvsdrc"), Some(&json!(false)));
    assert!(!overrides.contains_key("temp"));
  }

  #[test]
  fn regress_collects_repeated_tests() {
    let cli = Cli::parse_from(["tapeflow", "regress", "--test", "alu", "--test", "mem"]);
    let Commands::Regress(args) = cli.command else {
      panic!("expected regress");
    };
    assert_eq!(args.config, PathBuf::from("regression_config.json"));
    assert_eq!(args.tests, vec!["alu", "mem"]);
  }
}
