//! Small shared helpers.

/// JSON payload codec.
pub mod json;
