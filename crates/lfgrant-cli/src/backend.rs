//! Catalog service factory

use anyhow::Result;
use lfgrant_core::{BackendConfig, CatalogService};
use lfgrant_emulator::EmulatorBackend;
use std::sync::Arc;

/// Build the catalog service selected by `config`
pub async fn create_service(config: &BackendConfig) -> Result<Arc<dyn CatalogService>> {
    match config {
        BackendConfig::Emulator { state_file } => {
            let emulator = EmulatorBackend::open(state_file.clone()).await?;
            Ok(Arc::new(emulator))
        }
        #[cfg(feature = "aws")]
        BackendConfig::Aws {
            region,
            profile,
            endpoint,
        } => {
            let catalog = lfgrant_aws::create_aws_catalog(
                region.clone(),
                profile.clone(),
                endpoint.clone(),
            )
            .await?;
            tracing::info!(region = catalog.region(), "using AWS Lake Formation");
            Ok(Arc::new(catalog))
        }
        #[cfg(not(feature = "aws"))]
        BackendConfig::Aws { .. } => Err(anyhow::anyhow!(
            "lfgrant was built without AWS support; rebuild with `--features aws`"
        )),
    }
}
