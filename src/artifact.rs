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
use crate::error::ArtifactError;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

/// Record type bytes of the stream-format HEADER record that opens every layout.
const LAYOUT_HEADER_RECORD: [u8; 2] = [0x00, 0x02];

/// Keywords every macro abstract must carry.
const MACRO_DESCRIPTION_KEYWORDS: [&str; 4] = ["VERSION", "BUSBITCHARS", "DIVIDERCHAR", "MACRO"];

/// Named files under a single output root.
///
/// Artifacts are identified by their path relative to the root. Nothing is
/// ever deleted; writing an existing artifact overwrites it.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
  root: PathBuf,
}

impl ArtifactStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Absolute (or root-joined) location of an artifact.
  pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
    self.root.join(relative)
  }

  /// Identity of `path` relative to the root, when it lives under it.
  pub fn relative(&self, path: &Path) -> PathBuf {
    pathdiff::diff_paths(path, &self.root).unwrap_or_else(|| path.to_path_buf())
  }

  /// Creates the root directory if it is absent.
  pub fn ensure_root(&self) -> std::io::Result<()> {
    fs::create_dir_all(&self.root)
  }

  pub fn ensure_dir(&self, relative: impl AsRef<Path>) -> Result<PathBuf, ArtifactError> {
    let dir = self.path(relative);
    fs::create_dir_all(&dir).map_err(|source| ArtifactError::Write {
      path: dir.clone(),
      source,
    })?;
    Ok(dir)
  }

  pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
    self.path(relative).exists()
  }

  /// Writes `content`, creating parent directories as needed.
  pub fn write(
    &self,
    content: impl AsRef<[u8]>,
    relative: impl AsRef<Path>,
  ) -> Result<PathBuf, ArtifactError> {
    let path = self.path(relative);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|source| ArtifactError::Write {
        path: parent.to_path_buf(),
        source,
      })?;
    }
    fs::write(&path, content).map_err(|source| ArtifactError::Write {
      path: path.clone(),
      source,
    })?;
    tracing::debug!(artifact = %path.display(), "Wrote artifact");
    Ok(path)
  }

  pub fn write_json<T: Serialize>(
    &self,
    value: &T,
    relative: impl AsRef<Path>,
  ) -> Result<PathBuf, ArtifactError> {
    let relative = relative.as_ref();
    let json = serde_json::to_string_pretty(value).map_err(|source| ArtifactError::Serialize {
      path: self.path(relative),
      source,
    })?;
    self.write(json, relative)
  }

  pub fn read(&self, relative: impl AsRef<Path>) -> Result<String, ArtifactError> {
    let path = self.path(relative);
    fs::read_to_string(&path).map_err(|source| {
      if source.kind() == ErrorKind::NotFound {
        ArtifactError::NotFound { path }
      } else {
        ArtifactError::Read { path, source }
      }
    })
  }

  /// Shallow check that `path` looks like a stream-format layout.
  ///
  /// Only the 4-byte header is inspected: bytes 3-4 must hold the HEADER
  /// record type. This catches wrong or truncated files, nothing more.
  pub fn validate_layout(&self, path: impl AsRef<Path>) -> bool {
    let path = self.path(path);
    let mut header = [0u8; 4];
    let read = fs::File::open(&path).and_then(|mut f| f.read_exact(&mut header));
    match read {
      Ok(()) if header[2..4] == LAYOUT_HEADER_RECORD => true,
      Ok(()) => {
        tracing::error!(path = %path.display(), "Invalid layout header");
        false
      }
      Err(e) => {
        tracing::error!(path = %path.display(), error = %e, "Cannot read layout header");
        false
      }
    }
  }

  /// Shallow check that `path` is a macro abstract carrying every required section keyword.
  pub fn validate_macro_description(&self, path: impl AsRef<Path>) -> bool {
    let path = self.path(path);
    let Ok(content) = fs::read_to_string(&path) else {
      tracing::error!(path = %path.display(), "Cannot read macro description");
      return false;
    };
    match MACRO_DESCRIPTION_KEYWORDS
      .iter()
      .find(|keyword| !content.contains(*keyword))
    {
      Some(missing) => {
        tracing::error!(path = %path.display(), keyword = %missing, "Missing required keyword");
        false
      }
      None => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn write_then_read_overwrites_in_place() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    store.write("first", "scripts/run.tcl").unwrap();
    store.write("second", "scripts/run.tcl").unwrap();

    assert_eq!(store.read("scripts/run.tcl").unwrap(), "second");
    assert_eq!(fs::read_dir(dir.path().join("scripts")).unwrap().count(), 1);
  }

  #[test]
  fn reading_missing_artifact_is_not_found() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    assert!(!store.exists("nope.txt"));
    assert!(matches!(
      store.read("nope.txt"),
      Err(ArtifactError::NotFound { .. })
    ));
  }

  #[test]
  fn relative_identity_strips_root() {
    let store = ArtifactStore::new("/work/out");
    assert_eq!(
      store.relative(Path::new("/work/out/reports/drc.log")),
      PathBuf::from("reports/drc.log")
    );
  }

  #[test]
  fn layout_validator_checks_header_record() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.write(b"\x00\x06\x00\x02\x02\x58", "good.gds").unwrap();
    store.write(b"\x00\x06\x01\x02", "bad.gds").unwrap();
    store.write(b"\x00\x06", "short.gds").unwrap();

    assert!(store.validate_layout("good.gds"));
    assert!(!store.validate_layout("bad.gds"));
    assert!(!store.validate_layout("short.gds"));
    assert!(!store.validate_layout("missing.gds"));
  }

  #[test]
  fn macro_description_needs_every_keyword() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store
      .write(
        "VERSION 5.7 ;\nBUSBITCHARS \"[]\" ;\nDIVIDERCHAR \"/\" ;\nMACRO sram\nEND sram\n",
        "sram.lef",
      )
      .unwrap();
    store.write("VERSION 5.7 ;\nMACRO sram\n", "partial.lef").unwrap();

    assert!(store.validate_macro_description("sram.lef"));
    assert!(!store.validate_macro_description("partial.lef"));
  }
}
