//! Backend output normalization.
//!
//! Turns heterogeneous backend output (nested content-block records, flat
//! typed records, timestamped verbose lines) into one canonical event model
//! the runner uses to detect progress and completion.

pub mod detail;
pub mod event;
pub mod normalize;
pub mod normalizer;

pub use detail::tool_detail;
pub use event::NormalizedEvent;
pub use normalize::{normalize, normalize_line};
pub use normalizer::StreamNormalizer;
