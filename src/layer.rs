//! Layer records and the naming of their spatial tables.
//!
//! A layer's table is derived from its UUID alone, inside a schema derived from the
//! tenant the service runs for.
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Name of the geometry column in every layer table.
pub const GEOMETRY_COLUMN: &str = "geometry";

/// Schema used when no tenant is configured.
pub const DEFAULT_SCHEMA: &str = "public_gis";

/// Schema holding the layer tables of a tenant.
pub fn schema_name(tenant: Option<&str>) -> String {
    match tenant {
        Some(tenant) => format!("{}_gis", tenant),
        None => DEFAULT_SCHEMA.to_string(),
    }
}

/// Quotes an SQL identifier, doubling any embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// An attribute value of a feature.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// A schema-qualified table name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableName {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted `"schema"."table"` form for interpolation into SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
}

impl GeometryKind {
    /// Classifies a geometry type name as reported by the import tooling
    /// (`MultiLineString`, `POLYGON`, `3D Point`, ...).
    pub fn from_geometry_type(geometry_type: &str) -> GeometryKind {
        let geometry_type = geometry_type.to_lowercase();
        if geometry_type.contains("line") {
            GeometryKind::Line
        } else if geometry_type.contains("polygon") {
            GeometryKind::Polygon
        } else {
            GeometryKind::Point
        }
    }
}

/// Column metadata of a layer table.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LayerAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named vector dataset.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Layer {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "geometry", default)]
    pub geometry_kind: Option<GeometryKind>,
    /// Set once an import has finished successfully.
    #[serde(rename = "ready", default)]
    pub is_ready: bool,
    /// Pre-built archive, relative to the configured archive root.
    #[serde(default)]
    pub archive: Option<PathBuf>,
    #[serde(default)]
    pub attributes: Vec<LayerAttribute>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Layer {
            id: Uuid::new_v4(),
            name: name.into(),
            geometry_kind: None,
            is_ready: false,
            archive: None,
            attributes: Vec::new(),
        }
    }

    /// Unqualified name of the layer's spatial table.
    pub fn table_name(&self) -> String {
        format!("layer_{}", self.id).replace('-', "_")
    }

    pub fn query_table_name(&self, tenant: Option<&str>) -> TableName {
        TableName::new(schema_name(tenant), self.table_name())
    }

    /// Attribute names sorted by name, without the geometry column.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .attributes
            .iter()
            .map(|attribute| attribute.name.clone())
            .filter(|name| name != GEOMETRY_COLUMN)
            .collect();
        names.sort();
        names
    }

    /// Path template for this layer's vector tiles, if it has data to serve.
    pub fn tile_url(&self) -> Option<String> {
        if !self.is_ready {
            return None;
        }
        Some(format!("/{}/tile/{{z}}/{{x}}/{{y}}/", self.id))
    }

    /// `pmtiles://` URL of this layer's archive as seen from `base_url`.
    pub fn archive_url(&self, base_url: &str) -> Option<String> {
        if !self.is_ready || self.archive.is_none() {
            return None;
        }
        Some(format!(
            "pmtiles://{}/serve-pmtile/{}/",
            base_url.trim_end_matches('/'),
            self.id
        ))
    }
}

/// Resolves layer identifiers to layer records.
#[async_trait]
pub trait LayerCatalog: Send + Sync {
    async fn layer(&self, id: &Uuid) -> Result<Option<Layer>, Error>;
}

/// A fixed set of layers, typically loaded from configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    layers: HashMap<Uuid, Layer>,
}

impl StaticCatalog {
    pub fn new(layers: impl IntoIterator<Item = Layer>) -> Self {
        StaticCatalog {
            layers: layers.into_iter().map(|layer| (layer.id, layer)).collect(),
        }
    }

    /// Constructs a catalog from a YAML list of layers.
    pub fn from(data: &str) -> Result<StaticCatalog, Error> {
        let layers: Vec<Layer> = serde_yaml::from_str(data)?;
        Ok(StaticCatalog::new(layers))
    }

    pub fn insert(&mut self, layer: Layer) {
        self.layers.insert(layer.id, layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[async_trait]
impl LayerCatalog for StaticCatalog {
    async fn layer(&self, id: &Uuid) -> Result<Option<Layer>, Error> {
        Ok(self.layers.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(name: &str, order: i32) -> LayerAttribute {
        LayerAttribute {
            name: name.to_string(),
            attribute_type: String::from("character varying"),
            order,
            label: None,
            description: None,
        }
    }

    #[test]
    fn test_table_name_from_uuid() {
        let mut layer = Layer::new("Cities");
        layer.id = Uuid::parse_str("0b8a1b0e-4c5d-4e6f-8a9b-0c1d2e3f4a5b").unwrap();

        assert_eq!(
            "layer_0b8a1b0e_4c5d_4e6f_8a9b_0c1d2e3f4a5b",
            layer.table_name()
        );
        assert_eq!(
            "public_gis.layer_0b8a1b0e_4c5d_4e6f_8a9b_0c1d2e3f4a5b",
            layer.query_table_name(None).to_string()
        );
        assert_eq!(
            "\"acme_gis\".\"layer_0b8a1b0e_4c5d_4e6f_8a9b_0c1d2e3f4a5b\"",
            layer.query_table_name(Some("acme")).quoted()
        );
    }

    #[test]
    fn test_table_names_do_not_collide() {
        let first = Layer::new("a");
        let second = Layer::new("a");
        assert_ne!(first.table_name(), second.table_name());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!("\"name\"", quote_ident("name"));
        assert_eq!("\"we\"\"ird\"", quote_ident("we\"ird"));
    }

    #[test]
    fn test_field_names_sorted_without_geometry() {
        let mut layer = Layer::new("Cities");
        layer.attributes = vec![
            attribute("COUNTRY", 2),
            attribute("geometry", 3),
            attribute("CITY_NAME", 0),
            attribute("CITY_TYPE", 1),
        ];

        assert_eq!(
            vec!["CITY_NAME", "CITY_TYPE", "COUNTRY"],
            layer.field_names()
        );
    }

    #[test]
    fn test_urls_require_ready_layer() {
        let mut layer = Layer::new("Cities");
        layer.archive = Some(PathBuf::from("cities.pmtiles"));
        assert_eq!(None, layer.tile_url());
        assert_eq!(None, layer.archive_url("https://maps.example.com"));

        layer.is_ready = true;
        assert_eq!(
            Some(format!("/{}/tile/{{z}}/{{x}}/{{y}}/", layer.id)),
            layer.tile_url()
        );
        assert_eq!(
            Some(format!(
                "pmtiles://https://maps.example.com/serve-pmtile/{}/",
                layer.id
            )),
            layer.archive_url("https://maps.example.com/")
        );

        layer.archive = None;
        assert_eq!(None, layer.archive_url("https://maps.example.com"));
    }

    #[test]
    fn test_geometry_kind_from_type() {
        assert_eq!(
            GeometryKind::Line,
            GeometryKind::from_geometry_type("MultiLineString")
        );
        assert_eq!(
            GeometryKind::Polygon,
            GeometryKind::from_geometry_type("3D POLYGON")
        );
        assert_eq!(GeometryKind::Point, GeometryKind::from_geometry_type("Point"));
        assert_eq!(GeometryKind::Point, GeometryKind::from_geometry_type("unknown"));
    }

    #[tokio::test]
    async fn test_static_catalog_from_yaml() {
        let data = r#"
- id: 0b8a1b0e-4c5d-4e6f-8a9b-0c1d2e3f4a5b
  name: Cities
  geometry: point
  ready: true
  archive: pmtile_files/cities.pmtiles
  attributes:
    - name: CITY_NAME
      type: character varying
      order: 0
- id: 5f0c7b8e-1d2a-4b3c-9d8e-7f6a5b4c3d2e
  name: Roads
"#;
        let catalog = StaticCatalog::from(data).unwrap();
        assert_eq!(2, catalog.len());

        let id = Uuid::parse_str("0b8a1b0e-4c5d-4e6f-8a9b-0c1d2e3f4a5b").unwrap();
        let cities = catalog.layer(&id).await.unwrap().unwrap();
        assert_eq!("Cities", cities.name);
        assert_eq!(Some(GeometryKind::Point), cities.geometry_kind);
        assert!(cities.is_ready);
        assert_eq!(
            Some(PathBuf::from("pmtile_files/cities.pmtiles")),
            cities.archive
        );
        assert_eq!(vec!["CITY_NAME"], cities.field_names());

        let id = Uuid::parse_str("5f0c7b8e-1d2a-4b3c-9d8e-7f6a5b4c3d2e").unwrap();
        let roads = catalog.layer(&id).await.unwrap().unwrap();
        assert!(!roads.is_ready);
        assert!(roads.attributes.is_empty());

        assert!(catalog.layer(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn test_static_catalog_rejects_bad_yaml() {
        assert!(matches!(
            StaticCatalog::from("- id: not-a-uuid\n  name: x\n"),
            Err(Error::Catalog(_))
        ));
    }
}
