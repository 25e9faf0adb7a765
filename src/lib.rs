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

//! # Tapeflow
//!
//! `tapeflow` orchestrates the build-and-verify flow of a chip tape-out:
//! merging layouts and checking them, generating a memory macro through an
//! external memory compiler, and running the simulation regression suite.
//! Every external tool is an opaque step that succeeds or fails.
//!
//! ## Core Modules
//!
//! * [`pipeline`]: The staged executor. Runs pre-flight checks, then an
//!   ordered list of required and best-effort steps, stopping at the first
//!   required failure, and persists a `<flow>_run.json` result.
//! * [`flows`]: The layout-merge and memory-macro pipelines built on it.
//! * [`regression`]: Runs each regression test through the simulator with a
//!   timeout and writes per-test results and a summary.
//! * [`config`]: Loads JSON, YAML or TOML configuration, applies command-line
//!   overrides and validates parameters against a schema.
//! * [`invoker`]: Runs one external tool with captured output and a timeout.
//! * [`command`]: Defines the shared `Invocation` struct.
//! * [`scripts`]: Builds the scratch scripts handed to each tool.
//! * [`artifact`]: Named files under an output root, plus shallow validators.
//! * [`cli`]: Defines the `clap`-based command-line interface.
//! * [`error`]: Defines the custom error types for the library.
//! * [`logging`]: Provides `setup_tracing` and the per-run `RunLog`.

pub mod artifact;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod flows;
pub mod invoker;
pub mod logging;
pub mod pipeline;
pub mod regression;
pub mod scripts;
