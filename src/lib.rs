// Copyright 2025-2026 Johann Kempter
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
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # ilcover
//!
//! A coverage instrumentation engine for .NET assemblies, built on
//! [`dotscope`]. Given a compiled module and its Portable PDB sidecar,
//! `ilcover` rewrites the module in place so that at runtime every
//! executable source line and every conditional branch edge increments a
//! counter in a per-module hit table; when the hosting process (or an
//! isolation domain) unloads, the injected runtime aggregates per-thread
//! counts and persists them to a binary hit file. The engine returns an
//! *instrumentation map* correlating counter slots with source
//! locations; a report generator joins map and hit file into coverage.
//!
//! # Architecture
//!
//! - **Engine entry point**: [`Instrumenter`] loads the module through
//!   `dotscope`, plans every eligible method, and writes the modified
//!   binary back.
//! - **Symbols**: [`symbols::SymbolFile`] parses the standalone Portable
//!   PDB sidecar (documents, sequence points) and
//!   [`symbols::branch_points`] recovers the per-edge fork structure
//!   from the decoded IL.
//! - **Filtering**: eligibility is decided from glob patterns on type
//!   names, opt-out attributes (resolved on the outermost declaring
//!   type), and excluded source files.
//! - **Injection**: each module receives a private clone of the runtime
//!   tracker type under a reserved namespace, with all template
//!   cross-references rewritten into the target module.
//! - **Splicing**: a five-instruction counter prelude is placed in front
//!   of every sequence-point head and branch-edge target, keeping branch
//!   operands, switch tables, and exception-handler ranges intact.
//! - **Runtime protocol**: [`hits::HitFile`] and [`hits::HitTracker`]
//!   implement the hit-file accumulation contract natively — the same
//!   protocol the injected IL executes in-process.
//!
//! # Usage
//!
//! ```rust,no_run
//! use ilcover::Instrumenter;
//!
//! let mut instrumenter = Instrumenter::new(
//!     "bin/Debug/Widgets.dll",
//!     "a1b2c3",   // unique per instrumentation run
//!     &[],        // exclude filters
//!     &[],        // include filters
//!     &[],        // excluded source files
//! )?;
//!
//! if instrumenter.can_instrument() {
//!     let result = instrumenter.instrument()?;
//!     println!(
//!         "{}: {} hit slots across {} documents",
//!         result.module,
//!         result.hit_entries.len(),
//!         result.documents.len()
//!     );
//! }
//! # Ok::<(), ilcover::Error>(())
//! ```
//!
//! # Concurrency
//!
//! One `Instrumenter` is single-threaded over one module file. A driver
//! may instrument several modules concurrently with independent
//! instances; nothing is shared. The injected runtime is heavily
//! concurrent instead: per-thread counter arrays on the hot path, a
//! registry mutex paid once per thread, and a named inter-process mutex
//! around hit-file accumulation.
//!
//! # Errors
//!
//! All operations return [`Result`] with the kind-tagged [`Error`];
//! see the variants for the contract (missing symbols, malformed
//! sidecar, hit-file mismatch, metadata failures).

mod error;
mod filter;
mod instrument;
mod instrumenter;
mod map;
mod module;
mod tracker;

/// Hit-file protocol: binary format, named inter-process mutex, and the
/// native in-process tracker.
pub mod hits;

/// Debug-symbol access: Portable PDB sidecar parsing, sequence points,
/// and branch-point analysis.
pub mod symbols;

pub use error::{Error, Result};
pub use instrumenter::{hits_file_path_for, Instrumenter, InstrumenterResult};
pub use map::{Branch, Document, HitEntry, HitMap, Line};
