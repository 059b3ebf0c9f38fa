// Copyright 2025-2026 cillift contributors
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
#![allow(dead_code)]

//! # cillift
//!
//! The IL-to-high-level-AST decompilation core of an ECMA-335 decompiler.
//! Given a method body in common-intermediate-language form (delivered by an
//! external metadata reader), `cillift` reconstructs readable high-level
//! constructs: structured control flow, expression trees, recovered
//! language idioms (lock blocks, using blocks, string switches, null
//! operators), and a resolved type-system view of the member declarations
//! involved.
//!
//! # Architecture
//!
//! The crate is a pipeline over an in-memory instruction tree ("ILAst"):
//!
//! - **Metadata boundary** ([`crate::metadata`]): the contracts an external
//!   reader implements - typed records, signatures decoded through a
//!   provider callback, raw method bodies, optional debug symbols.
//! - **Type system** ([`crate::typesystem`]): lazy, memoized entity views
//!   with generic substitution, overload matching modulo normalization,
//!   reflection-name parsing, and `InternalsVisibleTo`.
//! - **IL tree** ([`crate::il`]): the arena instruction model with its
//!   mutation discipline, flow flags, variable use counters, pattern
//!   primitives, and the CIL decoder.
//! - **Dataflow** ([`crate::dataflow`]): a generic forward fixed-point
//!   engine over the tree, parameterized by a join-semilattice state.
//! - **Structurer** ([`crate::structure`]): loop nesting, if/else folding,
//!   switch normalization.
//! - **Transforms** ([`crate::transforms`]): the pass pipeline that rewrites
//!   low-level patterns into high-level constructs, with step-marker
//!   observability and per-method failure records.
//! - **AST** ([`crate::ast`]): the language-agnostic outbound surface a
//!   separate emitter renders to text.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::{atomic::AtomicBool, Arc};
//! use cillift::{
//!     settings::DecompilerSettings,
//!     transforms::decompile_module,
//!     typesystem::TypeSystem,
//! };
//!
//! let types = TypeSystem::new(reader);
//! let methods = types.reader().type_definitions()
//!     .iter()
//!     .flat_map(|&t| types.reader().type_definition(t).unwrap().methods)
//!     .collect::<Vec<_>>();
//! let outcomes = decompile_module(
//!     &types,
//!     &methods,
//!     &DecompilerSettings::default(),
//!     Arc::new(AtomicBool::new(false)),
//! );
//! for outcome in outcomes {
//!     match outcome.result {
//!         Ok(function) => {
//!             let ast = cillift::ast::translate_function(&function)?;
//!             // hand the AST to an emitter
//!         }
//!         Err(error) => eprintln!("method {} failed: {error}", outcome.handle),
//!     }
//! }
//! ```

#[macro_use]
mod error;

pub mod ast;
pub mod dataflow;
pub mod il;
pub mod metadata;
pub mod settings;
pub mod structure;
pub mod transforms;
pub mod typesystem;
pub mod utils;

pub use error::Error;
pub use settings::DecompilerSettings;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
