//! Identifier and hash types shared between the keep node and its tooling.

pub mod hash;
pub mod ids;

pub use hash::{Digest, Hash32};
pub use ids::{KeepId, OperatorId, ParseIdError};
