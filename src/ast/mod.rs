/// Canonical query model and filter translation.
///
/// ```text
/// External request (QueryRequest, wire filter arrays)
///       ↓
/// Query Builder          (builder.rs)
///       ↓
/// Query AST / FilterNode (types.rs)
///       ↓
/// Filter Translator      (translator.rs)
///       ↓
/// Canonical filter array (filter.rs)
///       ↓
/// Driver                 (driver/ module)
/// ```
pub mod builder;
pub mod filter;
pub mod translator;
pub mod types;

// Re-export key types for convenience
pub use builder::{build_query, QueryRequest};
pub use filter::{Condition, FilterArray, FilterItem, Logic};
pub use translator::{translate, translate_opt};
pub use types::*;
