use crate::config::Config;
use crate::error::Result;
use crate::index::PackageIndex;
use crate::pypi::PyPiIndex;
use std::sync::Arc;

pub struct IndexFactory;

impl IndexFactory {
    pub fn create_pypi(config: &Config) -> Result<Arc<dyn PackageIndex>> {
        let client = PyPiIndex::with_base_url(&config.index_url, config.allow_private_index)?;
        Ok(Arc::new(client))
    }
}
