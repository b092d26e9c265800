//! Per-identity sandbox directories.
//!
//! [`SandboxLayout`] names the paths of one sandbox and [`materialize`]
//! fills it with the patched source. Exclusive access is granted by the
//! workspace through a [`SandboxLease`](crate::workspace::SandboxLease).

pub(crate) mod git;
mod layout;
mod materializer;

pub use layout::SandboxLayout;
pub use materializer::{materialize, Materialization};
