use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::layer::LayerCatalog;
use crate::{Error, TileCoord, TileGeometryEncoder};

/// Maps a layer identifier and tile address to an encoded tile.
#[derive(Clone)]
pub struct VectorTileServer {
    catalog: Arc<dyn LayerCatalog>,
    encoder: Arc<dyn TileGeometryEncoder>,
    tenant: Option<String>,
}

impl VectorTileServer {
    pub fn new(
        catalog: Arc<dyn LayerCatalog>,
        encoder: Arc<dyn TileGeometryEncoder>,
        tenant: Option<String>,
    ) -> Self {
        VectorTileServer {
            catalog,
            encoder,
            tenant,
        }
    }

    /// Returns the MVT bytes of one tile of a layer.
    ///
    /// Unknown or not yet imported layers are [`Error::NotFound`], and so is a tile
    /// without any features in it. Store failures are passed through untouched.
    pub async fn serve(&self, layer_id: &str, tile: TileCoord) -> Result<Vec<u8>, Error> {
        let id = Uuid::parse_str(layer_id).map_err(|_| Error::NotFound)?;
        let layer = self.catalog.layer(&id).await?.ok_or(Error::NotFound)?;
        if !layer.is_ready {
            debug!(layer = %id, "layer is not ready");
            return Err(Error::NotFound);
        }

        let table = layer.query_table_name(self.tenant.as_deref());
        let raw_tile = self
            .encoder
            .query_tile(&table, &layer.field_names(), tile)
            .await?;

        if raw_tile.is_empty() {
            debug!(layer = %id, z = tile.z, x = tile.x, y = tile.y, "empty tile");
            return Err(Error::NotFound);
        }
        Ok(raw_tile)
    }
}
