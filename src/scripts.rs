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

//! Typed builders for the scratch scripts handed to external tools.
//!
//! There is one builder per tool dialect. Each returns a [`ToolScript`]:
//! the program to run, the script file to write next to it (if the dialect
//! takes one) and the argument list. Steps write the file into the output
//! root and run the program from there, so every path in `args` that names
//! the script is relative to the output root.

use crate::command::Invocation;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// A script file to be written before the tool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
  pub name: String,
  pub text: String,
}

/// Value object describing one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolScript {
  pub tool: String,
  pub script: Option<ScriptFile>,
  pub args: Vec<String>,
}

impl ToolScript {
  pub fn invocation(&self, cwd: impl Into<PathBuf>, timeout: Duration) -> Invocation {
    Invocation::new(&self.tool, cwd, timeout).args(self.args.iter().cloned())
  }
}

fn show(path: &Path) -> String {
  path.display().to_string()
}

/// Scripts for the layout editor that merges stream-format layouts.
pub fn layout_merge(editor: &str, inputs: &[PathBuf], output: &Path) -> ToolScript {
  const NAME: &str = "merge_layouts.rb";
  let text = r#"# Merge stream-format layouts into the first one's top cell.
source_files = input_files.split(',')
main_layout = RBA::Layout.new
main_layout.read(source_files[0])
top_cell = main_layout.top_cell

source_files[1..-1].each do |file|
  layout = RBA::Layout.new
  layout.read(file)
  layout.each_cell do |cell|
    if cell.is_top?
      top_cell.copy_tree(cell)
    end
  end
end

main_layout.write(output_file)
"#;
  let inputs = inputs.iter().map(|p| show(p)).collect::<Vec<_>>().join(",");
  ToolScript {
    tool: editor.to_string(),
    script: Some(ScriptFile {
      name: NAME.to_string(),
      text: text.to_string(),
    }),
    args: vec![
      "-z".to_string(),
      "-rd".to_string(),
      format!("input_files={}", inputs),
      "-rd".to_string(),
      format!("output_file={}", show(output)),
      "-r".to_string(),
      NAME.to_string(),
    ],
  }
}

/// Batch scripts for the layout/verification tool (DRC, extraction, views).
#[derive(Debug, Clone, Copy)]
pub struct Verifier<'a> {
  pub tool: &'a str,
  pub rc_file: Option<&'a Path>,
}

impl<'a> Verifier<'a> {
  pub fn new(tool: &'a str, rc_file: Option<&'a Path>) -> Self {
    Self { tool, rc_file }
  }

  fn batch(&self, name: &str, body: String) -> ToolScript {
    let mut args = vec!["-dnull".to_string(), "-noconsole".to_string()];
    if let Some(rc) = self.rc_file {
      args.push("-rcfile".to_string());
      args.push(show(rc));
    }
    args.push(name.to_string());
    ToolScript {
      tool: self.tool.to_string(),
      script: Some(ScriptFile {
        name: name.to_string(),
        text: body,
      }),
      args,
    }
  }

  pub fn design_rule_check(&self, layout: &Path, report: &Path) -> ToolScript {
    self.batch(
      "run_drc.tcl",
      format!(
        "drc style drc(full)\n\
         drc euclidean on\n\
         drc count total\n\
         load {}\n\
         select top cell\n\
         drc check\n\
         drc catchup\n\
         drc stats\n\
         drc why\n\
         save {}\n\
         quit -noprompt\n",
        show(layout),
        show(report)
      ),
    )
  }

  pub fn extract_netlist(&self, layout: &Path) -> ToolScript {
    self.batch(
      "extract_netlist.tcl",
      format!(
        "load {}\n\
         extract all\n\
         ext2spice hierarchy on\n\
         ext2spice scale off\n\
         ext2spice cthresh 0\n\
         ext2spice rthresh 0\n\
         ext2spice blackbox on\n\
         ext2spice subcircuit top on\n\
         ext2spice global off\n\
         ext2spice\n\
         quit -noprompt\n",
        show(layout)
      ),
    )
  }

  pub fn finalize_layout(&self, merged: &Path, top_cell: &str, output: &Path) -> ToolScript {
    self.batch(
      "create_final.tcl",
      format!(
        "load {}\n\
         flatten {top}\n\
         select {top}\n\
         expand\n\
         extract all\n\
         writeall force {}\n\
         quit -noprompt\n",
        show(merged),
        show(output),
        top = top_cell
      ),
    )
  }

  pub fn area_report(&self, layout: &Path) -> ToolScript {
    self.batch(
      "area_report.tcl",
      format!(
        "load {}\n\
         box\n\
         puts \"Total cell area: [box area]\"\n\
         quit -noprompt\n",
        show(layout)
      ),
    )
  }

  pub fn hierarchy_report(&self, layout: &Path) -> ToolScript {
    self.batch(
      "hierarchy_report.tcl",
      format!(
        "load {}\n\
         expand\n\
         puts \"Cell hierarchy:\"\n\
         cellname list\n\
         quit -noprompt\n",
        show(layout)
      ),
    )
  }

  /// Physical abstract of a generated macro.
  pub fn abstract_view(&self, layout: &Path, output: &Path) -> ToolScript {
    self.batch(
      "generate_lef.tcl",
      format!(
        "load {}\n\
         lef write {} -hide_empty_pins\n\
         quit -noprompt\n",
        show(layout),
        show(output)
      ),
    )
  }

  /// Circuit netlist of a generated macro.
  pub fn netlist_view(&self, layout: &Path) -> ToolScript {
    self.batch(
      "generate_cdl.tcl",
      format!(
        "load {}\n\
         ext2spice hierarchy on\n\
         ext2spice format ngspice\n\
         ext2spice subcircuit top on\n\
         ext2spice global off\n\
         extract all\n\
         ext2spice\n\
         quit -noprompt\n",
        show(layout)
      ),
    )
  }
}

/// Connectivity comparison of an extracted netlist against a reference.
pub fn layout_vs_schematic(
  tool: &str,
  extracted: &Path,
  reference: &Path,
  setup: &Path,
  report: &Path,
) -> ToolScript {
  ToolScript {
    tool: tool.to_string(),
    script: None,
    args: vec![
      "-batch".to_string(),
      "lvs".to_string(),
      show(extracted),
      show(reference),
      show(setup),
      "-o".to_string(),
      show(report),
    ],
  }
}

/// Parameters rendered into the memory compiler's configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerParams<'a> {
  pub process: &'a str,
  pub voltage: f64,
  pub temp: f64,
  pub frequency: f64,
  pub word_size: u64,
  pub num_words: u64,
  pub num_banks: u64,
  pub custom_cells: &'a [String],
  pub check_lvsdrc: bool,
  pub output_name: &'a str,
}

/// Configuration file and command line for the memory compiler.
pub fn memory_compiler(
  interpreter: &str,
  compiler_home: &Path,
  params: &CompilerParams<'_>,
  output_dir: &Path,
  num_threads: Option<u64>,
) -> ToolScript {
  const NAME: &str = "openram_config.py";
  let py_bool = |b: bool| if b { "True" } else { "False" };
  let custom_cells = params
    .custom_cells
    .iter()
    .map(|c| format!("{:?}", c))
    .collect::<Vec<_>>()
    .join(", ");

  let text = format!(
    r#"# Memory compiler configuration
tech_name = "{process}"
process_corners = ["TT"]
supply_voltages = [{voltage:?}]
temperatures = [{temp:?}]

num_words = {num_words}
word_size = {word_size}
num_banks = {num_banks}
num_rw_ports = 1
num_r_ports = 0
num_w_ports = 0

custom_cell_names = [{custom_cells}]

slew_rate = 0.001
load = 0.05
operating_temperature = {temp:?}
operating_voltage = {voltage:?}
operating_frequency = {frequency:?}

route_supplies = True
check_lvsdrc = {check_lvsdrc}
perimeter_pins = True
inline_lvsdrc = False
uniquify = True

symmetric = True
netlist_only = False
analytical_delay = False
output_extended_config = True
output_datasheet = True
output_name = "{output_name}"
"#,
    process = params.process,
    voltage = params.voltage,
    temp = params.temp,
    frequency = params.frequency,
    num_words = params.num_words,
    word_size = params.word_size,
    num_banks = params.num_banks,
    custom_cells = custom_cells,
    check_lvsdrc = py_bool(params.check_lvsdrc),
    output_name = params.output_name,
  );

  let mut args = vec![
    show(&compiler_home.join("openram.py")),
    NAME.to_string(),
    "-o".to_string(),
    show(output_dir),
    "--quiet".to_string(),
  ];
  if let Some(threads) = num_threads {
    args.push("-t".to_string());
    args.push(threads.to_string());
  }

  ToolScript {
    tool: interpreter.to_string(),
    script: Some(ScriptFile {
      name: NAME.to_string(),
      text,
    }),
    args,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn merge_passes_every_input_in_order() {
    let script = layout_merge(
      "klayout",
      &[PathBuf::from("/in/core.gds"), PathBuf::from("/in/sram.gds")],
      Path::new("/out/merged.gds"),
    );

    assert_eq!(script.tool, "klayout");
    assert!(script.args.contains(&"input_files=/in/core.gds,/in/sram.gds".to_string()));
    assert!(script.args.contains(&"output_file=/out/merged.gds".to_string()));
    assert_eq!(script.args.last().map(String::as_str), Some("merge_layouts.rb"));
  }

  #[test]
  fn verifier_scripts_name_their_file_last_and_honor_rc_file() {
    let rc = PathBuf::from("/pdk/magicrc");
    let with_rc = Verifier::new("magic", Some(&rc))
      .design_rule_check(Path::new("merged.gds"), Path::new("drc.log"));
    let without_rc = Verifier::new("magic", None).area_report(Path::new("final.gds"));

    assert_eq!(
      with_rc.args,
      vec!["-dnull", "-noconsole", "-rcfile", "/pdk/magicrc", "run_drc.tcl"]
    );
    let drc = with_rc.script.unwrap();
    assert!(drc.text.contains("load merged.gds\n"));
    assert!(drc.text.contains("save drc.log\n"));
    assert_eq!(without_rc.args, vec!["-dnull", "-noconsole", "area_report.tcl"]);
  }

  #[test]
  fn lvs_has_no_script_file() {
    let script = layout_vs_schematic(
      "netgen",
      Path::new("merged.spice"),
      Path::new("ref.spice"),
      Path::new("setup.tcl"),
      Path::new("lvs_report.txt"),
    );
    assert!(script.script.is_none());
    assert_eq!(script.args[..2], ["-batch", "lvs"]);
  }

  #[test]
  fn compiler_config_renders_parameters() {
    let cells = vec!["bitcell".to_string()];
    let params = CompilerParams {
      process: "sky130",
      voltage: 1.8,
      temp: 25.0,
      frequency: 100e6,
      word_size: 32,
      num_words: 1024,
      num_banks: 1,
      custom_cells: &cells,
      check_lvsdrc: false,
      output_name: "sram_1kx32",
    };

    let script = memory_compiler("python3", Path::new("/opt/openram"), &params, Path::new("out"), Some(4));
    let text = script.script.unwrap().text;

    assert!(text.contains("tech_name = \"sky130\"\n"));
    assert!(text.contains("supply_voltages = [1.8]\n"));
    assert!(text.contains("num_words = 1024\n"));
    assert!(text.contains("custom_cell_names = [\"bitcell\"]\n"));
    assert!(text.contains("check_lvsdrc = False\n"));
    assert_eq!(script.args[0], "/opt/openram/openram.py");
    assert_eq!(script.args[script.args.len() - 2..], ["-t", "4"]);
  }
}
