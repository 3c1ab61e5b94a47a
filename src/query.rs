//! SQL run against layer tables: rendering one Mapbox vector tile with PostGIS, and
//! finding the feature nearest to a point.
use crate::layer::{quote_ident, TableName, GEOMETRY_COLUMN};
use crate::TileCoord;

/// Zoom level at and below which geometries are simplified.
pub const SIMPLIFY_ZOOM_THRESHOLD: u8 = 5;

/// Tile coordinate space, in MVT units per tile side.
pub const TILE_EXTENT: u32 = 4096;

/// How far geometries may extend past the tile edge, in tile units.
pub const TILE_BUFFER: u32 = 64;

/// Name of the single layer in every rendered tile.
pub const TILE_LAYER_NAME: &str = "default";

/// SRID tiles are rendered in (web mercator).
pub const TILE_SRID: i32 = 3857;

/// Column the clipped tile geometry is selected as, kept apart from attribute names.
pub const MVT_GEOMETRY_ALIAS: &str = "__mvt_geom";

/// Simplification tolerance, in web mercator metres, for tiles at `zoom`.
///
/// Zero (no simplification) above [`SIMPLIFY_ZOOM_THRESHOLD`], then growing by a
/// factor of e for every zoom level below it.
pub fn simplify_tolerance(zoom: u8) -> f64 {
    if zoom > SIMPLIFY_ZOOM_THRESHOLD {
        0.0
    } else {
        1000.0 * f64::from(SIMPLIFY_ZOOM_THRESHOLD - zoom).exp()
    }
}

/// A ready-to-execute tile query.
///
/// Placeholders are `$1`, `$2`, `$3` for `z`, `x`, `y` and, when [`Self::tolerance`]
/// is non-zero, `$4` for the tolerance.
#[derive(Clone, Debug, PartialEq)]
pub struct TileQuery {
    pub sql: String,
    pub tile: TileCoord,
    pub tolerance: f64,
}

impl TileQuery {
    pub fn simplifies(&self) -> bool {
        self.tolerance > 0.0
    }
}

/// Builds tile queries for one layer table.
#[derive(Clone, Debug)]
pub struct TileQueryBuilder<'a> {
    table: &'a TableName,
    field_names: &'a [String],
}

impl<'a> TileQueryBuilder<'a> {
    pub fn new(table: &'a TableName, field_names: &'a [String]) -> Self {
        TileQueryBuilder { table, field_names }
    }

    pub fn build(&self, tile: TileCoord) -> TileQuery {
        let tolerance = simplify_tolerance(tile.z);

        let transformed = format!(
            "ST_Transform({}, {})",
            quote_ident(GEOMETRY_COLUMN),
            TILE_SRID
        );
        let geometry = if tolerance > 0.0 {
            format!("ST_Simplify({}, $4)", transformed)
        } else {
            transformed.clone()
        };

        let mut columns: Vec<String> = self.field_names.iter().map(|f| quote_ident(f)).collect();
        columns.push(format!(
            "ST_AsMVTGeom({}, ST_TileEnvelope($1, $2, $3), extent => {}, buffer => {}) AS {}",
            geometry,
            TILE_EXTENT,
            TILE_BUFFER,
            quote_ident(MVT_GEOMETRY_ALIAS)
        ));

        // The margin keeps features that only reach into the buffer.
        let margin = f64::from(TILE_BUFFER) / f64::from(TILE_EXTENT);
        let sql = format!(
            "WITH mvtgeom AS (SELECT {} FROM {} WHERE {} && ST_TileEnvelope($1, $2, $3, margin => {})) \
             SELECT ST_AsMVT(mvtgeom.*, '{}', {}, '{}') FROM mvtgeom WHERE {} IS NOT NULL",
            columns.join(", "),
            self.table.quoted(),
            transformed,
            margin,
            TILE_LAYER_NAME,
            TILE_EXTENT,
            MVT_GEOMETRY_ALIAS,
            quote_ident(MVT_GEOMETRY_ALIAS)
        );

        TileQuery {
            sql,
            tile,
            tolerance,
        }
    }
}

/// SQL selecting the attributes of the feature nearest to a point.
///
/// Placeholders are `$1`, `$2` for the point's x and y, `$3` for the SRID the point and
/// tolerance are expressed in, and `$4` for the search radius. The first column is a
/// constant so a match is visible even without attributes; attribute values follow as
/// text, in `field_names` order.
pub fn nearest_feature_sql(table: &TableName, field_names: &[String]) -> String {
    let mut columns = vec![String::from("1")];
    columns.extend(field_names.iter().map(|f| format!("{}::text", quote_ident(f))));

    let geometry = format!("ST_Transform({}, $3)", quote_ident(GEOMETRY_COLUMN));
    let point = "ST_SetSRID(ST_MakePoint($1, $2), $3)";
    format!(
        "SELECT {} FROM {} WHERE ST_DWithin({}, {}, $4) ORDER BY ST_Distance({}, {}) LIMIT 1",
        columns.join(", "),
        table.quoted(),
        geometry,
        point,
        geometry,
        point
    )
}
