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

//! Memory macro flow: configure and run the memory compiler, derive the
//! remaining views and check that all five are present.

use crate::artifact::ArtifactStore;
use crate::config::Check;
use crate::config::Configuration;
use crate::config::ParamKind;
use crate::config::ParamSpec;
use crate::error::PreflightError;
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
use crate::scripts;
use crate::scripts::CompilerParams;
use crate::scripts::ToolScript;
use crate::scripts::Verifier;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const FLOW_NAME: &str = "memory_macro";

pub const COMPILER_HOME_VAR: &str = "OPENRAM_HOME";
pub const COMPILER_TECH_VAR: &str = "OPENRAM_TECH";

/// Subdirectory of the output root the compiler writes its views into.
pub const VIEW_DIR: &str = "sram_output";

pub const MACRO_SCHEMA: &[ParamSpec] = &[
  ParamSpec::required("word_size", ParamKind::Integer).checked(&[Check::Positive, Check::MultipleOf(8)]),
  ParamSpec::required("num_words", ParamKind::Integer).checked(&[Check::PowerOfTwo]),
  ParamSpec::required("num_banks", ParamKind::Integer).checked(&[Check::Positive]),
  ParamSpec::required("process", ParamKind::String),
  ParamSpec::required("voltage", ParamKind::Number).checked(&[Check::Within {
    min_exclusive: 0.0,
    max_inclusive: 2.0,
  }]),
  ParamSpec::required("frequency", ParamKind::Number).checked(&[Check::Positive]),
  ParamSpec::required("temp", ParamKind::Number),
];

/// Location of the memory compiler installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerEnv {
  pub home: PathBuf,
  pub tech: PathBuf,
}

/// Checks the compiler's environment variables and installation layout.
///
/// `lookup` reads one variable; the binary passes `std::env::var_os`. Every
/// unset variable is reported at once.
pub fn check_compiler_env(
  lookup: impl Fn(&str) -> Option<OsString>,
) -> Result<CompilerEnv, PreflightError> {
  let home = lookup(COMPILER_HOME_VAR).filter(|v| !v.is_empty());
  let tech = lookup(COMPILER_TECH_VAR).filter(|v| !v.is_empty());

  let (home, tech) = match (home, tech) {
    (Some(home), Some(tech)) => (PathBuf::from(home), PathBuf::from(tech)),
    (home, tech) => {
      let mut vars = Vec::new();
      if home.is_none() {
        vars.push(COMPILER_HOME_VAR.to_string());
      }
      if tech.is_none() {
        vars.push(COMPILER_TECH_VAR.to_string());
      }
      return Err(PreflightError::EnvironmentUnset { vars });
    }
  };

  let compiler = home.join("compiler");
  if !compiler.exists() {
    return Err(PreflightError::InstallationIncomplete { path: compiler });
  }
  tracing::debug!(home = %home.display(), tech = %tech.display(), "Memory compiler found");
  Ok(CompilerEnv { home, tech })
}

/// Validated memory macro parameters.
#[derive(Debug, Clone)]
pub struct MacroConfig {
  pub output_dir: PathBuf,
  pub log_dir: PathBuf,
  pub word_size: u64,
  pub num_words: u64,
  pub num_banks: u64,
  pub process: String,
  pub voltage: f64,
  pub frequency: f64,
  pub temp: f64,
  pub ram_name: String,
  pub check_lvsdrc: bool,
  pub custom_cells: Vec<String>,
  pub num_threads: Option<u64>,
  pub rc_file: Option<PathBuf>,
  pub python: String,
  pub verifier: String,
  pub tool_timeout: Duration,
}

impl TryFrom<&Configuration> for MacroConfig {
  type Error = ValidationError;

  fn try_from(config: &Configuration) -> Result<Self, Self::Error> {
    config.validate(MACRO_SCHEMA)?;

    let num_threads = config.optional_integer("num_threads")?;
    if num_threads == Some(0) {
      return Err(ValidationError::new("num_threads", "must be positive"));
    }
    let tool_timeout = config.number_or("tool_timeout", 3600.0)?;
    if tool_timeout <= 0.0 {
      return Err(ValidationError::new("tool_timeout", "must be positive"));
    }
    let tool_timeout = Duration::try_from_secs_f64(tool_timeout)
      .map_err(|e| ValidationError::new("tool_timeout", e.to_string()))?;

    Ok(MacroConfig {
      output_dir: absolute("output_dir", config.path_or("output_dir", ".")?)?,
      log_dir: config.path_or("log_dir", "logs")?,
      word_size: config.integer("word_size")?,
      num_words: config.integer("num_words")?,
      num_banks: config.integer("num_banks")?,
      process: config.string("process")?,
      voltage: config.number("voltage")?,
      frequency: config.number("frequency")?,
      temp: config.number("temp")?,
      ram_name: config.string_or("ram_name", "sky130_sram_8kx32")?,
      check_lvsdrc: config.bool_or("check_lvsdrc", true)?,
      custom_cells: config.string_list("custom_cells")?,
      num_threads,
      rc_file: config
        .optional_string("rc_file")?
        .map(|p| absolute("rc_file", PathBuf::from(p)))
        .transpose()?,
      python: config.string_or("python", "python3")?,
      verifier: config.string_or("verifier", "magic")?,
      tool_timeout,
    })
  }
}

impl MacroConfig {
  /// Address bits needed for `num_words` (a power of two).
  pub fn address_width(&self) -> u32 {
    self.num_words.trailing_zeros()
  }

  /// Path of one generated view, relative to the output root.
  pub fn view(&self, extension: &str) -> PathBuf {
    Path::new(VIEW_DIR).join(format!("{}.{}", self.ram_name, extension))
  }

  fn compiler_script(&self, env: &CompilerEnv) -> ToolScript {
    let params = CompilerParams {
      process: &self.process,
      voltage: self.voltage,
      temp: self.temp,
      frequency: self.frequency,
      word_size: self.word_size,
      num_words: self.num_words,
      num_banks: self.num_banks,
      custom_cells: &self.custom_cells,
      check_lvsdrc: self.check_lvsdrc,
      output_name: &self.ram_name,
    };
    scripts::memory_compiler(
      &self.python,
      &env.home,
      &params,
      Path::new(VIEW_DIR),
      self.num_threads,
    )
  }

  fn verifier(&self) -> Verifier<'_> {
    Verifier::new(&self.verifier, self.rc_file.as_deref())
  }
}

/// Timing view text for the generated macro.
pub fn liberty_view(cfg: &MacroConfig) -> String {
  format!(
    r#"library({name}) {{
    delay_model : "table_lookup";
    time_unit : "1ns";
    voltage_unit : "1V";
    current_unit : "1mA";
    resistance_unit : "1kohm";
    capacitive_load_unit(1,pf);

    nom_process : 1.0;
    nom_temperature : {temp};
    nom_voltage : {voltage};

    operating_conditions(typical) {{
        process : 1.0;
        temperature : {temp};
        voltage : {voltage};
    }}

    cell({name}) {{
        memory() {{
            type : ram;
            address_width : {addr_width};
            word_width : {word_size};
        }}

        interface_timing : true;
        pin(clk0) {{
            direction : input;
            clock : true;
            max_transition : 0.15;
        }}

        pin(csb0) {{
            direction : input;
            timing() {{
                related_pin : "clk0";
                timing_type : setup_rising;
                rise_constraint(scalar) {{
                    values("0.200");
                }}
                fall_constraint(scalar) {{
                    values("0.200");
                }}
            }}
        }}
    }}
}}
"#,
    name = cfg.ram_name,
    temp = cfg.temp,
    voltage = cfg.voltage,
    addr_width = cfg.address_width(),
    word_size = cfg.word_size,
  )
}

/// Behavioral model of a single-port synchronous RAM.
pub fn verilog_view(cfg: &MacroConfig) -> String {
  format!(
    r#"module {name} (
    input wire clk0,
    input wire csb0,
    input wire web0,
    input wire [{addr_width}-1:0] addr0,
    input wire [{word_size}-1:0] din0,
    output reg [{word_size}-1:0] dout0
);
    reg [{word_size}-1:0] mem[0:{num_words}-1];

    always @(posedge clk0) begin
        if (!csb0 && !web0) begin
            mem[addr0] <= din0;
        end
    end

    always @(posedge clk0) begin
        if (!csb0 && web0) begin
            dout0 <= mem[addr0];
        end
    end
endmodule
"#,
    name = cfg.ram_name,
    addr_width = cfg.address_width(),
    word_size = cfg.word_size,
    num_words = cfg.num_words,
  )
}

#[derive(Debug, Clone, Copy)]
enum Stage {
  WriteCompilerConfig,
  RunCompiler,
  GenerateViews,
  VerifyOutputs,
}

struct MacroStep {
  stage: Stage,
  config: Arc<MacroConfig>,
  env: Arc<CompilerEnv>,
}

#[async_trait]
impl StepAction for MacroStep {
  async fn execute(&self, env: &StepEnv<'_>) -> Result<StepOutput, StepError> {
    let cfg = &self.config;
    match self.stage {
      Stage::WriteCompilerConfig => {
        let script = cfg.compiler_script(&self.env);
        let mut written = None;
        if let Some(file) = &script.script {
          written = Some(env.artifacts.write(&file.text, &file.name)?);
        }
        env.artifacts.ensure_dir(VIEW_DIR)?;
        let message = match written {
          Some(path) => format!(
            "Compiler configuration written to {}",
            env.artifacts.relative(&path).display()
          ),
          None => "Compiler configuration written".to_string(),
        };
        Ok(StepOutput::new(message))
      }
      Stage::RunCompiler => {
        let script = cfg.compiler_script(&self.env);
        let outcome = env
          .invoker
          .run(&script.invocation(env.artifacts.root(), env.timeout))
          .await
          .check(&script.tool)?;
        Ok(StepOutput::new("Memory compiler finished").with_output(outcome.combined_output()))
      }
      Stage::GenerateViews => {
        let verifier = cfg.verifier();
        let layout = cfg.view("gds");

        let lef = env
          .run_script(&verifier.abstract_view(&layout, &cfg.view("lef")))
          .await?;
        env.artifacts.write(liberty_view(cfg), cfg.view("lib"))?;
        env.artifacts.write(verilog_view(cfg), cfg.view("v"))?;
        let cdl = env.run_script(&verifier.netlist_view(&layout)).await?;

        Ok(
          StepOutput::new("Abstract, timing, behavioral and netlist views generated")
            .with_output(format!("{}{}", lef.combined_output(), cdl.combined_output())),
        )
      }
      Stage::VerifyOutputs => {
        for extension in ["gds", "lef", "lib", "v", "spice"] {
          let view = cfg.view(extension);
          if !env.artifacts.exists(&view) {
            return Err(StepError::MissingOutput {
              path: env.artifacts.path(&view),
            });
          }
        }
        let lef = cfg.view("lef");
        if !env.artifacts.validate_macro_description(&lef) {
          return Err(StepError::InvalidOutput {
            path: env.artifacts.path(&lef),
            kind: "macro description",
          });
        }
        Ok(StepOutput::new(format!("All views of {} present", cfg.ram_name)))
      }
    }
  }
}

/// Builds the memory macro pipeline. The compiler environment must have
/// been checked already, before `config` was validated.
pub fn executor(
  config: Configuration,
  compiler: CompilerEnv,
  log: RunLog,
) -> Result<PipelineExecutor, ValidationError> {
  let memory = Arc::new(MacroConfig::try_from(&config)?);
  let compiler = Arc::new(compiler);
  let step = |stage| MacroStep {
    stage,
    config: Arc::clone(&memory),
    env: Arc::clone(&compiler),
  };

  let mut preflight = Preflight::new()
    .tool(&memory.python)
    .tool(&memory.verifier)
    .input("compiler", compiler.home.join("compiler"), InputKind::Directory)
    .input("compiler entry point", compiler.home.join("openram.py"), InputKind::File);
  if let Some(rc) = &memory.rc_file {
    preflight = preflight.input("rc_file", rc, InputKind::File);
  }

  Ok(
    PipelineExecutor::new(config, ArtifactStore::new(&memory.output_dir), log)
      .with_timeout(memory.tool_timeout)
      .with_preflight(preflight)
      .step(Step::required("write-compiler-config", step(Stage::WriteCompilerConfig)))
      .step(Step::required("run-compiler", step(Stage::RunCompiler)))
      .step(Step::required("generate-views", step(Stage::GenerateViews)))
      .step(Step::required("verify-outputs", step(Stage::VerifyOutputs))),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;
  use serde_json::json;
  use std::collections::HashMap;
  use tempfile::tempdir;

  fn configuration(value: Value) -> Configuration {
    match value {
      Value::Object(map) => Configuration::from_values(map),
      other => panic!("not a mapping: {}", other),
    }
  }

  fn params() -> Value {
    json!({
      "word_size": 32,
      "num_words": 1024,
      "num_banks": 1,
      "process": "sky130",
      "voltage": 1.8,
      "frequency": 100e6,
      "temp": 25,
      "ram_name": "sram_test",
    })
  }

  fn lookup<'a>(vars: &'a HashMap<&'static str, PathBuf>) -> impl Fn(&str) -> Option<OsString> + 'a {
    move |name| vars.get(name).map(|p| p.clone().into_os_string())
  }

  #[test]
  fn unset_variables_are_all_reported() {
    let vars = HashMap::new();
    let err = check_compiler_env(lookup(&vars)).unwrap_err();

    match err {
      PreflightError::EnvironmentUnset { vars } => {
        assert_eq!(vars, vec![COMPILER_HOME_VAR, COMPILER_TECH_VAR]);
      }
      other => panic!("unexpected error: {}", other),
    }
  }

  #[test]
  fn installation_without_compiler_dir_is_incomplete() {
    let dir = tempdir().unwrap();
    let vars = HashMap::from([
      (COMPILER_HOME_VAR, dir.path().to_path_buf()),
      (COMPILER_TECH_VAR, dir.path().join("tech")),
    ]);

    assert!(matches!(
      check_compiler_env(lookup(&vars)),
      Err(PreflightError::InstallationIncomplete { .. })
    ));

    std::fs::create_dir(dir.path().join("compiler")).unwrap();
    let env = check_compiler_env(lookup(&vars)).unwrap();
    assert_eq!(env.home, dir.path());
  }

  #[test]
  fn word_count_must_be_a_power_of_two() {
    let mut value = params();
    value["num_words"] = json!(100);

    let err = MacroConfig::try_from(&configuration(value)).unwrap_err();
    assert_eq!(err.param, "num_words");
  }

  #[test]
  fn numeric_policy_is_enforced() {
    for (key, bad) in [
      ("word_size", json!(12)),
      ("word_size", json!(0)),
      ("num_banks", json!(0)),
      ("voltage", json!(0)),
      ("voltage", json!(2.1)),
      ("frequency", json!(-1.0)),
      ("process", json!(130)),
      ("tool_timeout", json!(1e30)),
    ] {
      let mut value = params();
      value[key] = bad.clone();
      let err = MacroConfig::try_from(&configuration(value)).unwrap_err();
      assert_eq!(err.param, key, "{} = {}", key, bad);
    }
  }

  #[test]
  fn views_use_derived_address_width() {
    let cfg = MacroConfig::try_from(&configuration(params())).unwrap();
    assert_eq!(cfg.address_width(), 10);
    assert_eq!(cfg.view("lef"), PathBuf::from("sram_output/sram_test.lef"));

    let liberty = liberty_view(&cfg);
    assert!(liberty.starts_with("library(sram_test) {\n"));
    assert!(liberty.contains("address_width : 10;"));
    assert!(liberty.contains("word_width : 32;"));
    assert!(liberty.contains("nom_voltage : 1.8;"));

    let verilog = verilog_view(&cfg);
    assert!(verilog.contains("input wire [10-1:0] addr0,"));
    assert!(verilog.contains("reg [32-1:0] mem[0:1024-1];"));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn generates_and_verifies_all_views() {
    use crate::flows::test_support::fake_tool;

    let dir = tempdir().unwrap();
    let home = dir.path().join("openram");
    std::fs::create_dir_all(home.join("compiler")).unwrap();
    std::fs::write(home.join("openram.py"), "# entry point").unwrap();

    let compiler = fake_tool(
      dir.path(),
      "python",
      r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
mkdir -p "$out"
printf 'gds' > "$out/sram_test.gds"
printf '* netlist' > "$out/sram_test.spice"
printf 'VERSION 5.7 ;\nBUSBITCHARS "[]" ;\nDIVIDERCHAR "/" ;\nMACRO sram_test\nEND sram_test\n' > "$out/sram_test.lef"
"#,
    );
    let verifier = fake_tool(dir.path(), "magic", "exit 0\n");

    let mut value = params();
    value["output_dir"] = json!(dir.path().join("out"));
    value["python"] = json!(compiler);
    value["verifier"] = json!(verifier);
    value["num_threads"] = json!(2);

    let env = CompilerEnv {
      home,
      tech: dir.path().join("tech"),
    };
    let result = executor(configuration(value), env, RunLog::new(FLOW_NAME))
      .unwrap()
      .run()
      .await
      .unwrap();

    assert!(result.success, "{:?}", result.steps);
    assert_eq!(result.steps.len(), 4);
    let out = dir.path().join("out");
    assert!(out.join("openram_config.py").exists());
    assert!(out.join("generate_lef.tcl").exists());
    assert!(out.join("sram_output/sram_test.lib").exists());
    assert!(out.join("memory_macro_run.json").exists());
    assert_eq!(
      result.step("write-compiler-config").unwrap().message,
      "Compiler configuration written to openram_config.py"
    );
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn missing_views_fail_verification() {
    use crate::flows::test_support::fake_tool;

    let dir = tempdir().unwrap();
    let home = dir.path().join("openram");
    std::fs::create_dir_all(home.join("compiler")).unwrap();
    std::fs::write(home.join("openram.py"), "# entry point").unwrap();

    let mut value = params();
    value["output_dir"] = json!(dir.path().join("out"));
    value["python"] = json!(fake_tool(dir.path(), "python", "exit 0\n"));
    value["verifier"] = json!(fake_tool(dir.path(), "magic", "exit 0\n"));

    let env = CompilerEnv {
      home,
      tech: dir.path().join("tech"),
    };
    let result = executor(configuration(value), env, RunLog::new(FLOW_NAME))
      .unwrap()
      .run()
      .await
      .unwrap();

    assert!(!result.success);
    assert_eq!(result.aborted_at.as_deref(), Some("verify-outputs"));
    let verify = result.step("verify-outputs").unwrap();
    assert!(verify.message.contains("sram_test.gds"), "{}", verify.message);
  }
}
