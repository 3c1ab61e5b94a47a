//! # Layer Tiles
//!
//! Serving paths for spatial vector layers.
//!
//! ## Current features
//!
//! Two independent ways of getting a layer's features to a map client:
//!
//! * A pre-built single-file archive (PMTiles) served with HTTP `Range` support.
//!   Each request maps the archive read-only, slices out the requested bytes and
//!   releases the mapping before the response is returned.
//! * Mapbox Vector Tiles rendered on demand from the layer's spatial table. Given
//!   a PostGIS database, the query built here leverages `ST_AsMVT` to do the heavy
//!   lifting; an in-process encoder covers environments without a spatial engine.
//!
//! Alongside the tiles, a layer can be asked which of its features lies nearest to a
//! set of points, returning the attributes of each match.
//!
//! ## Known Limitations
//!
//! Layer records come from a static catalog; ingestion (format detection,
//! reprojection, table creation) happens elsewhere and is expected to leave a table
//! named `layer_<uuid>` in the tenant's `_gis` schema with a `geometry` column in
//! EPSG:4326. Tiles are always produced in EPSG:3857 web mercator.
//!
//! Tile encoders and layer catalogs sit behind traits, so other backends plug in
//! without touching the HTTP layer.

#![deny(warnings)]

use async_trait::async_trait;

pub mod archive;
pub mod archive_server;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod in_process;
pub mod layer;
pub mod postgis;
pub mod query;
pub mod range;
pub mod tile_server;

pub use error::Error;
pub use layer::TableName;

/// Highest zoom level a tile coordinate may address.
pub const MAX_ZOOM: u8 = 30;

/// A slippy map tile address in XYZ format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        TileCoord { z, x, y }
    }

    /// Whether `x` and `y` exist in the tile pyramid at zoom `z`.
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM {
            return false;
        }
        let tiles_per_side = 1u64 << self.z;
        u64::from(self.x) < tiles_per_side && u64::from(self.y) < tiles_per_side
    }
}

/// Produces the encoded Mapbox vector tile for one tile of a layer's spatial table.
///
/// Implementations return the whole tile as a single buffer holding one layer named
/// [`query::TILE_LAYER_NAME`]. A tile with no features in its envelope is an empty
/// buffer, never an error.
#[async_trait]
pub trait TileGeometryEncoder: Send + Sync {
    async fn query_tile(
        &self,
        table: &TableName,
        field_names: &[String],
        tile: TileCoord,
    ) -> Result<Vec<u8>, Error>;
}
