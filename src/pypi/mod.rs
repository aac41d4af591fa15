pub mod client;
pub mod version;

pub use client::PyPiIndex;
pub use version::{RiskTier, Version, VersionComparator};
