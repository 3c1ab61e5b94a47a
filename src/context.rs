//! Point lookups: for each of a set of coordinates, the attributes of the layer feature
//! nearest to it within a tolerance.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use geo::Coord;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::layer::{FieldValue, LayerCatalog, TableName};
use crate::Error;

/// Search radius used when a request does not give one, in units of its SRID.
pub const DEFAULT_TOLERANCE: f64 = 10.0;

/// SRID coordinates are read in when a request does not give one.
pub const DEFAULT_SRID: i32 = 4326;

/// Attribute values of one feature, keyed by attribute name.
pub type Properties = BTreeMap<String, FieldValue>;

/// Finds the feature of a layer table nearest to a point.
#[async_trait]
pub trait FeatureLookup: Send + Sync {
    /// Attributes of the nearest feature within `tolerance` of `point`, or `None` if
    /// nothing is that close. `point` and `tolerance` are in units of `srid`.
    async fn nearest_feature(
        &self,
        table: &TableName,
        field_names: &[String],
        point: Coord<f64>,
        tolerance: f64,
        srid: i32,
    ) -> Result<Option<Properties>, Error>;
}

/// Query string of a lookup request, as sent.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContextParams {
    pub key: Option<String>,
    /// Comma separated attribute names; all of the layer's attributes when absent.
    pub attr: Option<String>,
    /// Comma separated x values, paired in order with `y`.
    pub x: Option<String>,
    pub y: Option<String>,
    pub srid: Option<String>,
    pub tolerance: Option<String>,
}

/// A validated lookup request.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextQuery {
    pub key: String,
    pub field_names: Option<Vec<String>>,
    pub coordinates: Vec<Coord<f64>>,
    pub tolerance: f64,
    pub srid: i32,
}

fn invalid(message: &str) -> Error {
    Error::InvalidQuery(message.to_string())
}

impl ContextQuery {
    pub fn parse(params: &ContextParams) -> Result<ContextQuery, Error> {
        let (Some(key), Some(x), Some(y)) = (&params.key, &params.x, &params.y) else {
            return Err(invalid("required arguments key, x and y missing"));
        };

        let xs: Vec<&str> = x.split(',').collect();
        let ys: Vec<&str> = y.split(',').collect();
        if xs.len() != ys.len() {
            return Err(invalid("the number of x and y coordinates must be the same"));
        }
        let coordinates = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| match (x.trim().parse::<f64>(), y.trim().parse::<f64>()) {
                (Ok(x), Ok(y)) if x.is_finite() && y.is_finite() => Ok(Coord { x, y }),
                _ => Err(invalid("all x and y values must be valid floats")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tolerance = match params.tolerance.as_deref() {
            None => DEFAULT_TOLERANCE,
            Some(tolerance) => match tolerance.trim().parse::<f64>() {
                Ok(tolerance) if tolerance.is_finite() && tolerance >= 0.0 => tolerance,
                _ => return Err(invalid("tolerance must be a non-negative float")),
            },
        };
        let srid = match params.srid.as_deref() {
            None => DEFAULT_SRID,
            Some(srid) => srid
                .trim()
                .parse::<i32>()
                .map_err(|_| invalid("srid must be an integer"))?,
        };

        let field_names = params
            .attr
            .as_deref()
            .map(str::trim)
            .filter(|attr| !attr.is_empty())
            .map(|attr| attr.split(',').map(|name| name.trim().to_string()).collect());

        Ok(ContextQuery {
            key: key.clone(),
            field_names,
            coordinates,
            tolerance,
            srid,
        })
    }
}

/// The lookup result for one requested coordinate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextFeature {
    pub coordinates: (f64, f64),
    pub feature: Properties,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextResponse {
    pub result: Vec<ContextFeature>,
}

/// Answers lookup requests against the layers of a catalog.
#[derive(Clone)]
pub struct FeatureContextServer {
    catalog: Arc<dyn LayerCatalog>,
    lookup: Arc<dyn FeatureLookup>,
    tenant: Option<String>,
}

impl FeatureContextServer {
    pub fn new(
        catalog: Arc<dyn LayerCatalog>,
        lookup: Arc<dyn FeatureLookup>,
        tenant: Option<String>,
    ) -> Self {
        FeatureContextServer {
            catalog,
            lookup,
            tenant,
        }
    }

    /// Looks up every requested coordinate, in request order.
    ///
    /// A coordinate with no feature in range still gets an entry, with every
    /// requested attribute set to an empty string. Bad parameters are
    /// [`Error::InvalidQuery`]; an unknown or unready layer is [`Error::NotFound`].
    pub async fn serve(&self, params: &ContextParams) -> Result<ContextResponse, Error> {
        let query = ContextQuery::parse(params)?;
        let id = Uuid::parse_str(&query.key).map_err(|_| Error::NotFound)?;
        let layer = self
            .catalog
            .layer(&id)
            .await?
            .filter(|layer| layer.is_ready)
            .ok_or(Error::NotFound)?;

        let table = layer.query_table_name(self.tenant.as_deref());
        let field_names = query
            .field_names
            .clone()
            .unwrap_or_else(|| layer.field_names());

        let mut result = Vec::with_capacity(query.coordinates.len());
        for point in &query.coordinates {
            let feature = self
                .lookup
                .nearest_feature(&table, &field_names, *point, query.tolerance, query.srid)
                .await?
                .unwrap_or_else(|| empty_feature(&field_names));
            result.push(ContextFeature {
                coordinates: (point.x, point.y),
                feature,
            });
        }

        debug!(layer = %id, points = result.len(), srid = query.srid, "looked up features");
        Ok(ContextResponse { result })
    }
}

fn empty_feature(field_names: &[String]) -> Properties {
    field_names
        .iter()
        .map(|name| (name.clone(), FieldValue::Text(String::new())))
        .collect()
}
