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
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to launch one external tool.
///
/// This struct is the "contract" between the pipeline steps and the
/// [`ToolInvoker`](crate::invoker::ToolInvoker): steps describe what to
/// run, the invoker decides how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
  /// The program to execute (e.g., "magic" or "/opt/tools/bin/netgen").
  pub program: String,

  /// Arguments passed to the program, in order.
  #[serde(default)]
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<String>,

  /// Working directory. Relative paths in `args` resolve against it.
  pub cwd: PathBuf,

  /// Upper bound on wall-clock time before the process is killed.
  pub timeout: Duration,
}

impl Invocation {
  pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      cwd: cwd.into(),
      timeout,
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  /// Renders the command line for logs.
  pub fn display(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_appends_args_in_order() {
    let inv = Invocation::new("netgen", "/tmp", Duration::from_secs(5))
      .args(["-batch", "lvs"])
      .arg("-o")
      .arg("report.txt");

    assert_eq!(inv.args, vec!["-batch", "lvs", "-o", "report.txt"]);
    assert_eq!(inv.display(), "netgen -batch lvs -o report.txt");
  }
}
