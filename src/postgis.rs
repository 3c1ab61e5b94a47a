//! Tile rendering, point lookups and table introspection against a PostGIS database.
use async_trait::async_trait;
use futures::TryStreamExt;
use geo::Coord;
use sqlx::postgres::PgRow;
use sqlx::{query, PgConnection, PgPool, Row};
use tracing::debug;

use crate::context::{FeatureLookup, Properties};
use crate::layer::{quote_ident, FieldValue, LayerAttribute, TableName, GEOMETRY_COLUMN};
use crate::query::{nearest_feature_sql, TileQuery, TileQueryBuilder};
use crate::{Error, TileCoord, TileGeometryEncoder};

/// Renders tiles with `ST_AsMVT` on a pooled connection.
///
/// A connection is checked out for the duration of one tile query and goes back to
/// the pool when the query finishes, whether it succeeded or not.
#[derive(Clone, Debug)]
pub struct PostgisEncoder {
    pool: PgPool,
}

impl PostgisEncoder {
    pub fn new(pool: PgPool) -> Self {
        PostgisEncoder { pool }
    }
}

/// Runs a prepared tile query and concatenates the returned MVT buffers.
pub async fn execute_tile_query(
    conn: &mut PgConnection,
    tile_query: &TileQuery,
) -> Result<Vec<u8>, sqlx::Error> {
    let tile = tile_query.tile;
    // Valid tiles have x and y below 2^30, so they fit.
    let mut statement = query(&tile_query.sql)
        .bind(i32::from(tile.z))
        .bind(tile.x as i32)
        .bind(tile.y as i32);
    if tile_query.simplifies() {
        statement = statement.bind(tile_query.tolerance);
    }

    let mut raw_tile: Vec<u8> = Vec::new();
    let mut rows = statement.fetch(conn);
    while let Some(row) = rows.try_next().await? {
        // ST_AsMVT over zero rows may come back as NULL.
        let layer: Option<Vec<u8>> = row.try_get(0)?;
        if let Some(layer) = layer {
            raw_tile.extend_from_slice(&layer);
        }
    }

    Ok(raw_tile)
}

#[async_trait]
impl TileGeometryEncoder for PostgisEncoder {
    async fn query_tile(
        &self,
        table: &TableName,
        field_names: &[String],
        tile: TileCoord,
    ) -> Result<Vec<u8>, Error> {
        if !tile.is_valid() {
            debug!(%table, z = tile.z, x = tile.x, y = tile.y, "tile outside the pyramid");
            return Ok(Vec::new());
        }

        let tile_query = TileQueryBuilder::new(table, field_names).build(tile);
        let mut conn = self.pool.acquire().await?;
        let raw_tile = execute_tile_query(&mut conn, &tile_query).await?;

        debug!(
            %table,
            z = tile.z,
            x = tile.x,
            y = tile.y,
            tolerance = tile_query.tolerance,
            bytes = raw_tile.len(),
            "rendered tile"
        );
        Ok(raw_tile)
    }
}

#[async_trait]
impl FeatureLookup for PostgisEncoder {
    async fn nearest_feature(
        &self,
        table: &TableName,
        field_names: &[String],
        point: Coord<f64>,
        tolerance: f64,
        srid: i32,
    ) -> Result<Option<Properties>, Error> {
        let sql = nearest_feature_sql(table, field_names);
        let mut conn = self.pool.acquire().await?;
        let row = query(&sql)
            .bind(point.x)
            .bind(point.y)
            .bind(srid)
            .bind(tolerance)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|row| feature_properties(&row, field_names))
            .transpose()
    }
}

// Attribute values start after the constant match column.
fn feature_properties(row: &PgRow, field_names: &[String]) -> Result<Properties, Error> {
    let mut properties = Properties::new();
    for (idx, name) in field_names.iter().enumerate() {
        let value: Option<String> = row.try_get(idx + 1)?;
        properties.insert(name.clone(), value.map_or(FieldValue::Null, FieldValue::Text));
    }
    Ok(properties)
}

const COLUMNS_SQL: &str = "SELECT column_name::text, data_type::text \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

/// Reads the attribute columns of a freshly imported layer table.
pub async fn introspect_attributes(
    conn: &mut PgConnection,
    table: &TableName,
) -> Result<Vec<LayerAttribute>, Error> {
    let rows = query(COLUMNS_SQL)
        .bind(table.schema.as_str())
        .bind(table.table.as_str())
        .fetch_all(conn)
        .await?;

    let mut columns: Vec<(String, String)> = Vec::with_capacity(rows.len());
    for row in &rows {
        columns.push((row.try_get(0)?, row.try_get(1)?));
    }
    Ok(attributes_from_columns(columns))
}

/// Turns `(name, data type)` pairs in table order into layer attributes.
///
/// The geometry column is left out. `order` is the column's position among all of
/// the table's columns.
pub fn attributes_from_columns(columns: Vec<(String, String)>) -> Vec<LayerAttribute> {
    columns
        .into_iter()
        .enumerate()
        .filter(|(_, (name, _))| name != GEOMETRY_COLUMN)
        .map(|(idx, (name, attribute_type))| LayerAttribute {
            name,
            attribute_type,
            order: idx as i32,
            label: None,
            description: None,
        })
        .collect()
}

// PostgreSQL's undefined_table.
const UNDEFINED_TABLE: &str = "42P01";

/// Number of features in a layer table, or `None` if the table does not exist.
pub async fn count_features(
    conn: &mut PgConnection,
    table: &TableName,
) -> Result<Option<i64>, Error> {
    let sql = format!("SELECT count(*) FROM {}", table.quoted());
    match query(&sql).fetch_one(conn).await {
        Ok(row) => Ok(Some(row.try_get(0)?)),
        Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNDEFINED_TABLE) => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Creates the schema that holds a tenant's layer tables.
pub async fn create_schema(conn: &mut PgConnection, schema: &str) -> Result<(), Error> {
    let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
    query(&sql).execute(conn).await?;
    Ok(())
}

/// Drops the table of a layer that is being removed.
pub async fn drop_table(conn: &mut PgConnection, table: &TableName) -> Result<(), Error> {
    let sql = format!("DROP TABLE IF EXISTS {}", table.quoted());
    query(&sql).execute(conn).await?;
    debug!(%table, "dropped layer table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_sql_is_parameterized() {
        assert!(COLUMNS_SQL.contains("table_schema = $1"));
        assert!(COLUMNS_SQL.contains("table_name = $2"));
        assert!(COLUMNS_SQL.ends_with("ORDER BY ordinal_position"));
    }

    #[tokio::test]
    async fn test_invalid_tile_skips_the_database() {
        // Nothing listens here; a query attempt would fail.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .unwrap();
        let encoder = PostgisEncoder::new(pool);
        let table = TableName::new("public_gis", "layer_x");

        let tile = encoder
            .query_tile(&table, &[], TileCoord::new(2, 4, 0))
            .await
            .unwrap();
        assert!(tile.is_empty());

        assert!(matches!(
            encoder.query_tile(&table, &[], TileCoord::new(2, 0, 0)).await,
            Err(Error::Query(_))
        ));
    }

    #[test]
    fn test_attributes_from_columns() {
        let columns = vec![
            (String::from("id"), String::from("integer")),
            (String::from("geometry"), String::from("USER-DEFINED")),
            (String::from("name"), String::from("character varying")),
        ];
        let attributes = attributes_from_columns(columns);

        assert_eq!(2, attributes.len());
        assert_eq!("id", attributes[0].name);
        assert_eq!("integer", attributes[0].attribute_type);
        assert_eq!(0, attributes[0].order);
        // Positions count the skipped geometry column.
        assert_eq!("name", attributes[1].name);
        assert_eq!(2, attributes[1].order);
        assert!(attributes.iter().all(|a| a.label.is_none() && a.description.is_none()));
    }

    #[tokio::test]
    async fn test_lookup_reports_database_failures() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .unwrap();
        let encoder = PostgisEncoder::new(pool);
        let table = TableName::new("public_gis", "layer_x");

        assert!(matches!(
            encoder
                .nearest_feature(&table, &[], Coord { x: 0.0, y: 0.0 }, 10.0, 4326)
                .await,
            Err(Error::Query(_))
        ));
    }
}
