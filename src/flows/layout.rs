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

//! Layout merge flow: merge the core and memory layouts, verify the result
//! and write the final layout.

use crate::artifact::ArtifactStore;
use crate::config::Configuration;
use crate::config::ParamKind;
use crate::config::ParamSpec;
use crate::error::StepError;
use crate::error::ValidationError;
use crate::flows::absolute;
use crate::logging::RunLog;
use crate::pipeline::InputKind;
use crate::pipeline::PipelineExecutor;
use crate::pipeline::Preflight;
use crate::pipeline::Step;
use crate::pipeline::StepAction;
use crate::pipeline::StepEnv;
use crate::pipeline::StepOutput;
use crate::pipeline::flag;
use crate::scripts;
use crate::scripts::Verifier;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const FLOW_NAME: &str = "layout_merge";

pub const LAYOUT_SCHEMA: &[ParamSpec] = &[
  ParamSpec::required("primary_layout", ParamKind::String),
  ParamSpec::required("secondary_layout", ParamKind::String),
  ParamSpec::required("pnr_def", ParamKind::String),
];

/// When the best-effort report step may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPolicy {
  /// Only after every required step succeeded.
  OnSuccess,
  /// Even after a required step failed.
  Always,
}

impl TryFrom<&str> for ReportPolicy {
  type Error = ValidationError;

  fn try_from(value: &str) -> Result<Self, Self::Error> {
    match value {
      "on-success" => Ok(ReportPolicy::OnSuccess),
      "always" => Ok(ReportPolicy::Always),
      other => Err(ValidationError::new(
        "report_policy",
        format!("expected \"on-success\" or \"always\", got {:?}", other),
      )),
    }
  }
}

/// Fully validated and resolved layout-merge configuration.
#[derive(Debug, Clone)]
pub struct LayoutConfig {
  pub output_dir: PathBuf,
  pub log_dir: PathBuf,
  pub primary_layout: PathBuf,
  pub secondary_layout: PathBuf,
  pub pnr_def: PathBuf,
  pub additional_layouts: Vec<PathBuf>,
  pub rc_file: Option<PathBuf>,
  pub reference_netlist: Option<PathBuf>,
  pub lvs_setup: Option<PathBuf>,
  pub design_name: String,
  pub run_drc: bool,
  pub run_lvs: bool,
  pub generate_reports: bool,
  pub report_policy: ReportPolicy,
  pub tool_timeout: Duration,
  pub layout_editor: String,
  pub verifier: String,
  pub lvs_tool: String,
}

impl TryFrom<&Configuration> for LayoutConfig {
  type Error = ValidationError;

  fn try_from(config: &Configuration) -> Result<Self, Self::Error> {
    config.validate(LAYOUT_SCHEMA)?;

    let optional_path = |key: &str| -> Result<Option<PathBuf>, ValidationError> {
      config
        .optional_string(key)?
        .map(|p| absolute(key, PathBuf::from(p)))
        .transpose()
    };

    let run_lvs = config.bool_or("run_lvs", true)?;
    let reference_netlist = optional_path("reference_netlist")?;
    let lvs_setup = optional_path("lvs_setup")?;
    if run_lvs {
      if reference_netlist.is_none() {
        return Err(ValidationError::new(
          "reference_netlist",
          "required when run_lvs is enabled",
        ));
      }
      if lvs_setup.is_none() {
        return Err(ValidationError::new(
          "lvs_setup",
          "required when run_lvs is enabled",
        ));
      }
    }

    let tool_timeout = config.number_or("tool_timeout", 3600.0)?;
    if tool_timeout <= 0.0 {
      return Err(ValidationError::new("tool_timeout", "must be positive"));
    }
    let tool_timeout = Duration::try_from_secs_f64(tool_timeout)
      .map_err(|e| ValidationError::new("tool_timeout", e.to_string()))?;

    Ok(LayoutConfig {
      output_dir: absolute("output_dir", config.path_or("output_dir", ".")?)?,
      log_dir: config.path_or("log_dir", "logs")?,
      primary_layout: absolute("primary_layout", config.path("primary_layout")?)?,
      secondary_layout: absolute("secondary_layout", config.path("secondary_layout")?)?,
      pnr_def: absolute("pnr_def", config.path("pnr_def")?)?,
      additional_layouts: config
        .string_list("additional_layouts")?
        .into_iter()
        .map(|p| absolute("additional_layouts", PathBuf::from(p)))
        .collect::<Result<_, _>>()?,
      rc_file: optional_path("rc_file")?,
      reference_netlist,
      lvs_setup,
      design_name: config.string_or("design_name", "simple_arm")?,
      run_drc: config.bool_or("run_drc", true)?,
      run_lvs,
      generate_reports: config.bool_or("generate_reports", true)?,
      report_policy: ReportPolicy::try_from(config.string_or("report_policy", "on-success")?.as_str())?,
      tool_timeout,
      layout_editor: config.string_or("layout_editor", "klayout")?,
      verifier: config.string_or("verifier", "magic")?,
      lvs_tool: config.string_or("lvs_tool", "netgen")?,
    })
  }
}

impl LayoutConfig {
  /// Every layout to merge, primary first.
  pub fn layouts(&self) -> Vec<PathBuf> {
    let mut layouts = vec![self.primary_layout.clone(), self.secondary_layout.clone()];
    layouts.extend(self.additional_layouts.iter().cloned());
    layouts
  }

  pub fn merged_layout(&self) -> PathBuf {
    PathBuf::from(format!("{}_merged.gds", self.design_name))
  }

  pub fn extracted_netlist(&self) -> PathBuf {
    PathBuf::from(format!("{}_merged.spice", self.design_name))
  }

  pub fn final_layout(&self) -> PathBuf {
    PathBuf::from(format!("{}_final.gds", self.design_name))
  }

  fn verifier(&self) -> Verifier<'_> {
    Verifier::new(&self.verifier, self.rc_file.as_deref())
  }

  fn preflight(&self) -> Preflight {
    let mut preflight = Preflight::new()
      .tool(&self.layout_editor)
      .tool(&self.verifier);
    if self.run_lvs {
      preflight = preflight.tool(&self.lvs_tool);
    }

    preflight = preflight
      .input("primary_layout", &self.primary_layout, InputKind::Layout)
      .input("secondary_layout", &self.secondary_layout, InputKind::Layout)
      .input("pnr_def", &self.pnr_def, InputKind::File);
    for layout in &self.additional_layouts {
      preflight = preflight.input("additional_layouts", layout, InputKind::Layout);
    }
    if let Some(rc) = &self.rc_file {
      preflight = preflight.input("rc_file", rc, InputKind::File);
    }
    if self.run_lvs {
      if let Some(reference) = &self.reference_netlist {
        preflight = preflight.input("reference_netlist", reference, InputKind::File);
      }
      if let Some(setup) = &self.lvs_setup {
        preflight = preflight.input("lvs_setup", setup, InputKind::File);
      }
    }
    preflight
  }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
  ValidateInputs,
  PrepareMergeScript,
  MergeLayouts,
  DesignRuleCheck,
  LayoutVsSchematic,
  FinalizeLayout,
  GenerateReports,
}

struct LayoutStep {
  stage: Stage,
  config: Arc<LayoutConfig>,
}

#[async_trait]
impl StepAction for LayoutStep {
  async fn execute(&self, env: &StepEnv<'_>) -> Result<StepOutput, StepError> {
    let cfg = &self.config;
    match self.stage {
      Stage::ValidateInputs => {
        let layouts = cfg.layouts();
        for layout in &layouts {
          if !env.artifacts.validate_layout(layout) {
            return Err(StepError::InvalidOutput {
              path: layout.clone(),
              kind: "layout",
            });
          }
        }
        if !cfg.pnr_def.is_file() {
          return Err(StepError::MissingOutput {
            path: cfg.pnr_def.clone(),
          });
        }
        Ok(StepOutput::new(format!(
          "{} layouts and placement output validated",
          layouts.len()
        )))
      }
      Stage::PrepareMergeScript => {
        let script = merge_script(cfg);
        if let Some(file) = &script.script {
          env.artifacts.write(&file.text, &file.name)?;
        }
        Ok(StepOutput::new("Merge script written"))
      }
      Stage::MergeLayouts => {
        let script = merge_script(cfg);
        if let Some(file) = &script.script {
          if !env.artifacts.exists(&file.name) {
            return Err(StepError::MissingOutput {
              path: env.artifacts.path(&file.name),
            });
          }
        }
        let outcome = env
          .invoker
          .run(&script.invocation(env.artifacts.root(), env.timeout))
          .await
          .check(&script.tool)?;
        Ok(
          StepOutput::new(format!("Merged into {}", cfg.merged_layout().display()))
            .with_output(outcome.combined_output()),
        )
      }
      Stage::DesignRuleCheck => {
        let script = cfg
          .verifier()
          .design_rule_check(&cfg.merged_layout(), &PathBuf::from("drc.log"));
        let outcome = env.run_script(&script).await?;
        Ok(StepOutput::new("Design rule check passed").with_output(outcome.combined_output()))
      }
      Stage::LayoutVsSchematic => {
        let (Some(reference), Some(setup)) = (&cfg.reference_netlist, &cfg.lvs_setup) else {
          return Err(StepError::MissingOutput {
            path: PathBuf::from("reference_netlist"),
          });
        };
        let extract = cfg.verifier().extract_netlist(&cfg.merged_layout());
        let extracted = env.run_script(&extract).await?;
        let compare = scripts::layout_vs_schematic(
          &cfg.lvs_tool,
          &cfg.extracted_netlist(),
          reference,
          setup,
          &PathBuf::from("lvs_report.txt"),
        );
        let compared = env.run_script(&compare).await?;
        Ok(
          StepOutput::new("Layout matches schematic").with_output(format!(
            "{}{}",
            extracted.combined_output(),
            compared.combined_output()
          )),
        )
      }
      Stage::FinalizeLayout => {
        let script =
          cfg
            .verifier()
            .finalize_layout(&cfg.merged_layout(), "top_cell", &cfg.final_layout());
        let outcome = env.run_script(&script).await?;
        Ok(
          StepOutput::new(format!("Final layout written to {}", cfg.final_layout().display()))
            .with_output(outcome.combined_output()),
        )
      }
      Stage::GenerateReports => {
        let verifier = cfg.verifier();
        let area = env.run_script(&verifier.area_report(&cfg.final_layout())).await;
        let hierarchy = env
          .run_script(&verifier.hierarchy_report(&cfg.final_layout()))
          .await;
        let area = area?;
        let hierarchy = hierarchy?;
        Ok(
          StepOutput::new("Area and hierarchy reports generated").with_output(format!(
            "{}{}",
            area.stdout, hierarchy.stdout
          )),
        )
      }
    }
  }
}

fn merge_script(cfg: &LayoutConfig) -> scripts::ToolScript {
  scripts::layout_merge(&cfg.layout_editor, &cfg.layouts(), &cfg.merged_layout())
}

/// Builds the layout merge pipeline for `config`.
pub fn executor(config: Configuration, log: RunLog) -> Result<PipelineExecutor, ValidationError> {
  let layout = Arc::new(LayoutConfig::try_from(&config)?);
  let step = |stage| LayoutStep {
    stage,
    config: Arc::clone(&layout),
  };

  Ok(
    PipelineExecutor::new(config, ArtifactStore::new(&layout.output_dir), log)
      .with_timeout(layout.tool_timeout)
      .with_preflight(layout.preflight())
      .step(Step::required("validate-inputs", step(Stage::ValidateInputs)))
      .step(Step::required("prepare-merge-script", step(Stage::PrepareMergeScript)))
      .step(Step::required("merge-layouts", step(Stage::MergeLayouts)))
      .step(Step::required("design-rule-check", step(Stage::DesignRuleCheck)).run_if(flag("run_drc", true)))
      .step(
        Step::required("layout-vs-schematic-check", step(Stage::LayoutVsSchematic))
          .run_if(flag("run_lvs", true)),
      )
      .step(Step::required("finalize-layout", step(Stage::FinalizeLayout)))
      .step(
        Step::best_effort(
          "generate-reports",
          step(Stage::GenerateReports),
          layout.report_policy == ReportPolicy::Always,
        )
        .run_if(flag("generate_reports", true)),
      ),
  )
}
