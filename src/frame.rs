//! Source-location tags for declared operations.
//!
//! Every builder that declares an endpoint, method, hook or expectation is
//! `#[track_caller]`, so the captured location is the user's declaration site
//! rather than a line inside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;

/// Where an operation was declared
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Name of the declaring operation, e.g. `Method::assert_ok`
    pub symbol: String,
}

impl Frame {
    /// Capture the location of the caller's caller chain up to the first
    /// function not marked `#[track_caller]`.
    #[track_caller]
    pub fn caller(symbol: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
            symbol: symbol.into(),
        }
    }

    /// Frame for operations synthesized by the crate itself
    pub fn internal(symbol: impl Into<String>) -> Self {
        Self {
            file: "<internal>".to_string(),
            line: 0,
            column: 0,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
