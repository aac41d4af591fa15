use crate::error::Result;

pub mod factory;
pub use factory::IndexFactory;

/// Source of published versions for a package.
///
/// Implementations return every published version they know of in any order;
/// ordering and eligibility are decided by the resolver.
pub trait PackageIndex: Send + Sync {
    fn list_versions(&self, name: &str) -> Result<Vec<String>>;
}
