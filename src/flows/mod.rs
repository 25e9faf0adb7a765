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

//! The concrete pipelines: layout merge and memory macro generation.

pub mod layout;
pub mod memory;

use crate::error::ValidationError;
use std::path::PathBuf;

/// Tools run from the output root, so input paths are pinned to the
/// current directory before anything is spawned.
pub(crate) fn absolute(param: &str, path: PathBuf) -> Result<PathBuf, ValidationError> {
  std::path::absolute(&path)
    .map_err(|e| ValidationError::new(param, format!("cannot resolve {}: {}", path.display(), e)))
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
  use std::fs;
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;
  use std::path::PathBuf;

  /// Writes an executable shell script standing in for an external tool.
  pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  /// Writes a file with a valid stream-format header.
  pub fn layout_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"\x00\x06\x00\x02\x02\x58").unwrap();
    path
  }
}
