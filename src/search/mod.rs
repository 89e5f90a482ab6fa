// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search Infrastructure
//!
//! Filter AST, its Meilisearch rendering, and index bootstrap.
//!
//! # Architecture
//!
//! ```text
//! Filter (AST)
//!     ↓
//!     ├─→ MeiliTranslator → Meilisearch filter expression
//!     └─→ Filter::matches  → in-process evaluation (memory backend)
//! ```

mod filter;
mod meili_translator;
pub mod index_setup;

pub use filter::{FieldFilter, Filter, FilterNode, FilterOperator, FilterValue};
pub use meili_translator::MeiliTranslator;
pub use index_setup::{ensure_index, IndexSpec};
