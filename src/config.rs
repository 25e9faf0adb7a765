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
use crate::error::ConfigError;
use crate::error::ValidationError;
use figment::Figment;
use figment::providers::Format;
use figment::providers::Json;
use figment::providers::Toml;
use figment::providers::Yaml;
use serde_json::Map;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

/// Command-line values that replace loaded parameters of the same name.
pub type Overrides = Map<String, Value>;

/// Inserts `value` under `key` when it is present.
pub fn set_override<T: Into<Value>>(overrides: &mut Overrides, key: &str, value: Option<T>) {
  if let Some(value) = value {
    overrides.insert(key.to_string(), value.into());
  }
}

/// Expected shape of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
  Integer,
  /// Any number; integers are accepted too.
  Number,
  String,
  Bool,
  StringList,
}

impl ParamKind {
  fn describe(self) -> &'static str {
    match self {
      ParamKind::Integer => "an integer",
      ParamKind::Number => "a number",
      ParamKind::String => "a string",
      ParamKind::Bool => "a boolean",
      ParamKind::StringList => "a list of strings",
    }
  }

  fn matches(self, value: &Value) -> bool {
    match self {
      ParamKind::Integer => value.is_i64() || value.is_u64(),
      ParamKind::Number => value.is_number(),
      ParamKind::String => value.is_string(),
      ParamKind::Bool => value.is_boolean(),
      ParamKind::StringList => value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string)),
    }
  }
}

/// Range or shape constraint applied after the type check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Check {
  Positive,
  MultipleOf(i64),
  PowerOfTwo,
  Within { min_exclusive: f64, max_inclusive: f64 },
}

impl Check {
  fn apply(self, value: &Value) -> Result<(), String> {
    match self {
      Check::Positive => match value.as_f64() {
        Some(n) if n > 0.0 => Ok(()),
        _ => Err(format!("must be positive, got {}", value)),
      },
      Check::MultipleOf(m) => match value.as_i64() {
        Some(n) if n % m == 0 => Ok(()),
        _ => Err(format!("must be a multiple of {}, got {}", m, value)),
      },
      Check::PowerOfTwo => match value.as_i64() {
        Some(n) if n > 0 && n & (n - 1) == 0 => Ok(()),
        _ => Err(format!("must be a power of two, got {}", value)),
      },
      Check::Within {
        min_exclusive,
        max_inclusive,
      } => match value.as_f64() {
        Some(n) if n > min_exclusive && n <= max_inclusive => Ok(()),
        _ => Err(format!(
          "must be in ({}, {}], got {}",
          min_exclusive, max_inclusive, value
        )),
      },
    }
  }
}

/// One required parameter of a flow's schema.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
  pub name: &'static str,
  pub kind: ParamKind,
  pub checks: &'static [Check],
}

impl ParamSpec {
  pub const fn required(name: &'static str, kind: ParamKind) -> Self {
    Self {
      name,
      kind,
      checks: &[],
    }
  }

  pub const fn checked(self, checks: &'static [Check]) -> Self {
    Self { checks, ..self }
  }
}

/// A loaded configuration document. Immutable; overrides produce a new value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
  values: Map<String, Value>,
  source: Option<PathBuf>,
}

impl Configuration {
  /// Loads a JSON, YAML or TOML mapping. The format follows the file extension.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let extension = path
      .extension()
      .and_then(|e| e.to_str())
      .map(str::to_ascii_lowercase);

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    let figment = match extension.as_deref() {
      Some("json") => Figment::from(Json::string(&content)),
      Some("yaml") | Some("yml") => Figment::from(Yaml::string(&content)),
      Some("toml") => Figment::from(Toml::string(&content)),
      _ => {
        return Err(ConfigError::UnsupportedFormat {
          path: path.to_path_buf(),
        });
      }
    };

    let values: Map<String, Value> = figment.extract().map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: Box::new(e),
    })?;

    tracing::debug!(path = %path.display(), keys = values.len(), "Loaded configuration");
    Ok(Self {
      values,
      source: Some(path.to_path_buf()),
    })
  }

  pub fn from_values(values: Map<String, Value>) -> Self {
    Self {
      values,
      source: None,
    }
  }

  pub fn source(&self) -> Option<&Path> {
    self.source.as_deref()
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.values.get(key)
  }

  /// Returns a new configuration where every key in `overrides` wins.
  pub fn apply_overrides(&self, overrides: Overrides) -> Self {
    let mut values = self.values.clone();
    for (key, value) in overrides {
      tracing::debug!(%key, %value, "Applying override");
      values.insert(key, value);
    }
    Self {
      values,
      source: self.source.clone(),
    }
  }

  /// Checks every parameter of `schema`, reporting the first violation.
  pub fn validate(&self, schema: &[ParamSpec]) -> Result<(), ValidationError> {
    for spec in schema {
      let Some(value) = self.values.get(spec.name) else {
        return Err(ValidationError::new(spec.name, "missing required parameter"));
      };
      if !spec.kind.matches(value) {
        return Err(ValidationError::new(
          spec.name,
          format!("expected {}, got {}", spec.kind.describe(), describe(value)),
        ));
      }
      for check in spec.checks {
        check
          .apply(value)
          .map_err(|reason| ValidationError::new(spec.name, reason))?;
      }
    }
    Ok(())
  }

  fn typed<T>(
    &self,
    key: &str,
    kind: ParamKind,
    convert: impl FnOnce(&Value) -> Option<T>,
  ) -> Result<Option<T>, ValidationError> {
    match self.values.get(key) {
      None | Some(Value::Null) => Ok(None),
      Some(value) => convert(value).map(Some).ok_or_else(|| {
        ValidationError::new(
          key,
          format!("expected {}, got {}", kind.describe(), describe(value)),
        )
      }),
    }
  }

  fn require<T>(&self, key: &str, value: Option<T>) -> Result<T, ValidationError> {
    value.ok_or_else(|| ValidationError::new(key, "missing required parameter"))
  }

  pub fn string(&self, key: &str) -> Result<String, ValidationError> {
    let value = self.optional_string(key)?;
    self.require(key, value)
  }

  pub fn optional_string(&self, key: &str) -> Result<Option<String>, ValidationError> {
    self.typed(key, ParamKind::String, |v| v.as_str().map(str::to_string))
  }

  pub fn string_or(&self, key: &str, default: &str) -> Result<String, ValidationError> {
    Ok(
      self
        .optional_string(key)?
        .unwrap_or_else(|| default.to_string()),
    )
  }

  pub fn integer(&self, key: &str) -> Result<u64, ValidationError> {
    let value = self.optional_integer(key)?;
    self.require(key, value)
  }

  pub fn optional_integer(&self, key: &str) -> Result<Option<u64>, ValidationError> {
    self.typed(key, ParamKind::Integer, Value::as_u64)
  }

  pub fn number(&self, key: &str) -> Result<f64, ValidationError> {
    let value = self.optional_number(key)?;
    self.require(key, value)
  }

  pub fn optional_number(&self, key: &str) -> Result<Option<f64>, ValidationError> {
    self.typed(key, ParamKind::Number, Value::as_f64)
  }

  pub fn number_or(&self, key: &str, default: f64) -> Result<f64, ValidationError> {
    Ok(self.optional_number(key)?.unwrap_or(default))
  }

  pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ValidationError> {
    Ok(
      self
        .typed(key, ParamKind::Bool, Value::as_bool)?
        .unwrap_or(default),
    )
  }

  pub fn path(&self, key: &str) -> Result<PathBuf, ValidationError> {
    self.string(key).map(PathBuf::from)
  }

  pub fn path_or(&self, key: &str, default: &str) -> Result<PathBuf, ValidationError> {
    self.string_or(key, default).map(PathBuf::from)
  }

  /// A list of strings; an absent key is an empty list.
  pub fn string_list(&self, key: &str) -> Result<Vec<String>, ValidationError> {
    Ok(
      self
        .typed(key, ParamKind::StringList, |v| {
          v.as_array()?
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()
        })?
        .unwrap_or_default(),
    )
  }
}

fn describe(value: &Value) -> String {
  match value {
    Value::Null => "null".to_string(),
    Value::Bool(b) => format!("boolean {}", b),
    Value::Number(n) => format!("number {}", n),
    Value::String(s) => format!("string {:?}", s),
    Value::Array(_) => "a list".to_string(),
    Value::Object(_) => "a mapping".to_string(),
  }
}
