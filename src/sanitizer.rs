//! Compiler instrumentation modes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sanitizer a sandbox is built with.
///
/// The tag of each variant is the value OSS-Fuzz expects in `SANITIZER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sanitizer {
    Address,
    Memory,
    #[serde(rename = "undefined")]
    UndefinedBehavior,
    Coverage,
}

impl Sanitizer {
    /// All sanitizers, in declaration order.
    pub const ALL: [Sanitizer; 4] = [
        Sanitizer::Address,
        Sanitizer::Memory,
        Sanitizer::UndefinedBehavior,
        Sanitizer::Coverage,
    ];

    /// Stable, filesystem-safe tag.
    pub fn tag(self) -> &'static str {
        match self {
            Sanitizer::Address => "address",
            Sanitizer::Memory => "memory",
            Sanitizer::UndefinedBehavior => "undefined",
            Sanitizer::Coverage => "coverage",
        }
    }
}

impl fmt::Display for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Sanitizer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" | "asan" => Ok(Sanitizer::Address),
            "memory" | "msan" => Ok(Sanitizer::Memory),
            "undefined" | "ubsan" => Ok(Sanitizer::UndefinedBehavior),
            "coverage" => Ok(Sanitizer::Coverage),
            other => Err(Error::Config(format!("unknown sanitizer '{}'", other))),
        }
    }
}
