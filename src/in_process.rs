//! Vector tile rendering without a spatial database.
//!
//! Features are held in memory in EPSG:4326. For each tile they are projected to web
//! mercator, simplified with Douglas-Peucker using the same zoom-dependent tolerance
//! as the SQL path, clipped to the buffered tile envelope and encoded with the `mvt`
//! crate.
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use geo::{
    BoundingRect, Coord, EuclideanDistance, Geometry, LineString, MapCoords, Polygon, Simplify,
};
use mvt::{GeomData, GeomEncoder, GeomType, Tile};
use slippy_map_tilenames::tile2lonlat;
use tracing::debug;

use crate::context::{FeatureLookup, Properties};
use crate::layer::{FieldValue, TableName};
use crate::query::{simplify_tolerance, TILE_BUFFER, TILE_EXTENT, TILE_LAYER_NAME, TILE_SRID};
use crate::{Error, TileCoord, TileGeometryEncoder};

const EARTH_RADIUS: f64 = 6_378_137.0;

const WGS84_SRID: i32 = 4326;

// Latitude at which web mercator becomes square.
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// One row of a layer table: a geometry in EPSG:4326 and its attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub geometry: Geometry<f64>,
    pub properties: BTreeMap<String, FieldValue>,
}

impl Feature {
    pub fn new(geometry: impl Into<Geometry<f64>>) -> Self {
        Feature {
            geometry: geometry.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }
}

/// In-memory stand-in for the spatial tables of a database.
#[derive(Debug, Default)]
pub struct FeatureStore {
    tables: RwLock<HashMap<TableName, Vec<Feature>>>,
}

impl FeatureStore {
    pub fn new() -> Self {
        FeatureStore::default()
    }

    /// Creates or replaces a table wholesale.
    pub fn replace_table(&self, table: TableName, features: Vec<Feature>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, features);
    }

    /// Appends a feature, creating the table if needed.
    pub fn insert(&self, table: &TableName, feature: Feature) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.clone())
            .or_default()
            .push(feature);
    }

    pub fn remove_table(&self, table: &TableName) -> bool {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table)
            .is_some()
    }

    /// Number of features in a table, or `None` if it does not exist.
    pub fn count(&self, table: &TableName) -> Option<usize> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map(Vec::len)
    }
}

/// Web mercator bounds of a tile, in metres.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl TileBounds {
    pub fn of(tile: TileCoord) -> TileBounds {
        let (west, north) = tile2lonlat(tile.x, tile.y, tile.z);
        let (east, south) = tile2lonlat(tile.x + 1, tile.y + 1, tile.z);
        let south_west = to_mercator(Coord { x: west, y: south });
        let north_east = to_mercator(Coord { x: east, y: north });

        TileBounds {
            west: south_west.x,
            south: south_west.y,
            east: north_east.x,
            north: north_east.y,
        }
    }

    fn width(&self) -> f64 {
        self.east - self.west
    }

    fn height(&self) -> f64 {
        self.north - self.south
    }
}

/// Projects an EPSG:4326 coordinate to EPSG:3857.
pub fn to_mercator(coord: Coord<f64>) -> Coord<f64> {
    let lat = coord.y.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    Coord {
        x: EARTH_RADIUS * coord.x.to_radians(),
        y: EARTH_RADIUS * (PI / 4.0 + lat / 2.0).tan().ln(),
    }
}

type Point = (f64, f64);

/// Maps web mercator coordinates into the coordinate space of one tile.
#[derive(Clone, Copy, Debug)]
struct TileSpace {
    bounds: TileBounds,
    extent: f64,
    buffer: f64,
}

impl TileSpace {
    fn new(tile: TileCoord) -> Self {
        TileSpace {
            bounds: TileBounds::of(tile),
            extent: f64::from(TILE_EXTENT),
            buffer: f64::from(TILE_BUFFER),
        }
    }

    fn min(&self) -> f64 {
        -self.buffer
    }

    fn max(&self) -> f64 {
        self.extent + self.buffer
    }

    // Y grows downwards in tile space.
    fn project(&self, coord: &Coord<f64>) -> Point {
        (
            (coord.x - self.bounds.west) / self.bounds.width() * self.extent,
            (self.bounds.north - coord.y) / self.bounds.height() * self.extent,
        )
    }

    /// Whether a mercator bounding box reaches into the buffered tile.
    fn touches(&self, geometry: &Geometry<f64>) -> bool {
        let Some(rect) = geometry.bounding_rect() else {
            return false;
        };
        let (min_x, max_y) = self.project(&rect.min());
        let (max_x, min_y) = self.project(&rect.max());
        max_x >= self.min() && min_x <= self.max() && max_y >= self.min() && min_y <= self.max()
    }

    fn contains(&self, point: Point) -> bool {
        (self.min()..=self.max()).contains(&point.0) && (self.min()..=self.max()).contains(&point.1)
    }
}

/// Tile-space geometry of one MVT feature.
#[derive(Clone, Debug, PartialEq)]
enum Shape {
    Points(Vec<Point>),
    Lines(Vec<Vec<Point>>),
    // Each polygon is its exterior ring followed by its holes.
    Polygons(Vec<Vec<Vec<Point>>>),
}

impl Shape {
    fn is_empty(&self) -> bool {
        match self {
            Shape::Points(points) => points.is_empty(),
            Shape::Lines(lines) => lines.is_empty(),
            Shape::Polygons(polygons) => polygons.is_empty(),
        }
    }

    fn encode(&self) -> Result<GeomData, Error> {
        let encoder = match self {
            Shape::Points(points) => {
                let mut encoder = GeomEncoder::new(GeomType::Point);
                for (x, y) in points {
                    encoder = encoder.point(*x, *y)?;
                }
                encoder
            }
            Shape::Lines(lines) => {
                let mut encoder = GeomEncoder::new(GeomType::Linestring);
                for line in lines {
                    for (x, y) in line {
                        encoder = encoder.point(*x, *y)?;
                    }
                    encoder = encoder.complete()?;
                }
                encoder
            }
            Shape::Polygons(polygons) => {
                let mut encoder = GeomEncoder::new(GeomType::Polygon);
                for ring in polygons.iter().flatten() {
                    for (x, y) in ring {
                        encoder = encoder.point(*x, *y)?;
                    }
                    encoder = encoder.complete()?;
                }
                encoder
            }
        };
        Ok(encoder.encode()?)
    }
}

/// Renders tiles from a [`FeatureStore`].
#[derive(Debug, Default)]
pub struct InProcessEncoder {
    store: Arc<FeatureStore>,
}

impl InProcessEncoder {
    pub fn new(store: Arc<FeatureStore>) -> Self {
        InProcessEncoder { store }
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    fn render(
        &self,
        table: &TableName,
        field_names: &[String],
        tile: TileCoord,
    ) -> Result<Vec<u8>, Error> {
        let tables = self.store.tables.read().unwrap_or_else(PoisonError::into_inner);
        let features = tables
            .get(table)
            .ok_or_else(|| Error::MissingTable(table.clone()))?;

        let space = TileSpace::new(tile);
        let tolerance = simplify_tolerance(tile.z);

        let mut mvt_tile = Tile::new(TILE_EXTENT);
        let mut layer = mvt_tile.create_layer(TILE_LAYER_NAME);
        let mut encoded = 0usize;

        for feature in features {
            let projected = feature.geometry.map_coords(to_mercator);
            if !space.touches(&projected) {
                continue;
            }

            let mut shapes = Vec::new();
            collect_shapes(&projected, tolerance, &space, &mut shapes);
            for shape in shapes.iter().filter(|shape| !shape.is_empty()) {
                let mut mvt_feature = layer.into_feature(shape.encode()?);
                for name in field_names {
                    match feature.properties.get(name) {
                        Some(FieldValue::Text(value)) => mvt_feature.add_tag_string(name, value),
                        Some(FieldValue::Int(value)) => mvt_feature.add_tag_int(name, *value),
                        Some(FieldValue::Float(value)) => mvt_feature.add_tag_double(name, *value),
                        Some(FieldValue::Bool(value)) => mvt_feature.add_tag_bool(name, *value),
                        Some(FieldValue::Null) | None => {}
                    }
                }
                layer = mvt_feature.into_layer();
                encoded += 1;
            }
        }

        if encoded == 0 {
            return Ok(Vec::new());
        }

        mvt_tile.add_layer(layer)?;
        Ok(mvt_tile.to_bytes()?)
    }
}

#[async_trait]
impl TileGeometryEncoder for InProcessEncoder {
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

        let raw_tile = self.render(table, field_names, tile)?;
        debug!(
            %table,
            z = tile.z,
            x = tile.x,
            y = tile.y,
            bytes = raw_tile.len(),
            "rendered tile in process"
        );
        Ok(raw_tile)
    }
}

#[async_trait]
impl FeatureLookup for InProcessEncoder {
    async fn nearest_feature(
        &self,
        table: &TableName,
        field_names: &[String],
        point: Coord<f64>,
        tolerance: f64,
        srid: i32,
    ) -> Result<Option<Properties>, Error> {
        // Stored features are EPSG:4326; only it and web mercator are known here.
        let project: fn(Coord<f64>) -> Coord<f64> = match srid {
            WGS84_SRID => |coord| coord,
            TILE_SRID => to_mercator,
            _ => return Err(Error::InvalidQuery(format!("unsupported SRID {}", srid))),
        };

        let tables = self.store.tables.read().unwrap_or_else(PoisonError::into_inner);
        let features = tables
            .get(table)
            .ok_or_else(|| Error::MissingTable(table.clone()))?;

        let target = geo::Point::from(point);
        let nearest = features
            .iter()
            .map(|feature| {
                let distance = target.euclidean_distance(&feature.geometry.map_coords(project));
                (distance, feature)
            })
            .filter(|(distance, _)| *distance <= tolerance)
            .min_by(|a, b| a.0.total_cmp(&b.0));

        Ok(nearest.map(|(_, feature)| {
            field_names
                .iter()
                .map(|name| {
                    let value = feature.properties.get(name).cloned();
                    (name.clone(), value.unwrap_or(FieldValue::Null))
                })
                .collect()
        }))
    }
}

fn simplify_line(line: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    if tolerance > 0.0 {
        line.simplify(&tolerance)
    } else {
        line.clone()
    }
}

fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    if tolerance > 0.0 {
        polygon.simplify(&tolerance)
    } else {
        polygon.clone()
    }
}

/// Simplifies, clips and projects a mercator geometry into one shape per MVT feature.
fn collect_shapes(
    geometry: &Geometry<f64>,
    tolerance: f64,
    space: &TileSpace,
    shapes: &mut Vec<Shape>,
) {
    match geometry {
        Geometry::Point(point) => shapes.push(point_shape([point.0].iter(), space)),
        Geometry::MultiPoint(points) => {
            shapes.push(point_shape(points.iter().map(|point| &point.0), space))
        }
        Geometry::Line(line) => {
            let line = LineString::from(vec![line.start, line.end]);
            shapes.push(line_shape([line].iter(), space));
        }
        Geometry::LineString(line) => {
            let line = simplify_line(line, tolerance);
            shapes.push(line_shape([line].iter(), space));
        }
        Geometry::MultiLineString(lines) => {
            let lines: Vec<LineString<f64>> = lines
                .iter()
                .map(|line| simplify_line(line, tolerance))
                .collect();
            shapes.push(line_shape(lines.iter(), space));
        }
        Geometry::Polygon(polygon) => {
            let polygon = simplify_polygon(polygon, tolerance);
            shapes.push(polygon_shape([polygon].iter(), space));
        }
        Geometry::MultiPolygon(polygons) => {
            let polygons: Vec<Polygon<f64>> = polygons
                .iter()
                .map(|polygon| simplify_polygon(polygon, tolerance))
                .collect();
            shapes.push(polygon_shape(polygons.iter(), space));
        }
        Geometry::Rect(rect) => {
            shapes.push(polygon_shape([rect.to_polygon()].iter(), space));
        }
        Geometry::Triangle(triangle) => {
            shapes.push(polygon_shape([triangle.to_polygon()].iter(), space));
        }
        Geometry::GeometryCollection(collection) => {
            for member in collection.iter() {
                collect_shapes(member, tolerance, space, shapes);
            }
        }
    }
}

fn point_shape<'a>(coords: impl Iterator<Item = &'a Coord<f64>>, space: &TileSpace) -> Shape {
    let points = coords
        .map(|coord| space.project(coord))
        .filter(|point| space.contains(*point))
        .map(round)
        .collect();
    Shape::Points(points)
}

fn line_shape<'a>(lines: impl Iterator<Item = &'a LineString<f64>>, space: &TileSpace) -> Shape {
    let mut parts = Vec::new();
    for line in lines {
        let projected: Vec<Point> = line.coords().map(|coord| space.project(coord)).collect();
        for part in clip_line(&projected, space.min(), space.max()) {
            let part = dedup(part.into_iter().map(round));
            if part.len() >= 2 {
                parts.push(part);
            }
        }
    }
    Shape::Lines(parts)
}

fn polygon_shape<'a>(polygons: impl Iterator<Item = &'a Polygon<f64>>, space: &TileSpace) -> Shape {
    let mut shapes = Vec::new();
    for polygon in polygons {
        let Some(exterior) = tile_ring(polygon.exterior(), space, true) else {
            continue;
        };
        let mut rings = vec![exterior];
        rings.extend(
            polygon
                .interiors()
                .iter()
                .filter_map(|ring| tile_ring(ring, space, false)),
        );
        shapes.push(rings);
    }
    Shape::Polygons(shapes)
}

/// Projects, clips and rounds one polygon ring, returning it open (without the closing
/// point) and wound the way MVT expects: positive area for exteriors, negative for
/// holes. Rings that collapse are dropped.
fn tile_ring(ring: &LineString<f64>, space: &TileSpace, exterior: bool) -> Option<Vec<Point>> {
    let mut projected: Vec<Point> = ring.coords().map(|coord| space.project(coord)).collect();
    if projected.len() > 1 && projected.first() == projected.last() {
        projected.pop();
    }

    let clipped = clip_ring(&projected, space.min(), space.max());
    let mut rounded = dedup(clipped.into_iter().map(round));
    if rounded.len() > 1 && rounded.first() == rounded.last() {
        rounded.pop();
    }
    if rounded.len() < 3 {
        return None;
    }

    let area = signed_area(&rounded);
    if area == 0.0 {
        return None;
    }
    if (area > 0.0) != exterior {
        rounded.reverse();
    }
    Some(rounded)
}

fn round(point: Point) -> Point {
    (point.0.round(), point.1.round())
}

fn dedup(points: impl Iterator<Item = Point>) -> Vec<Point> {
    let mut result: Vec<Point> = Vec::new();
    for point in points {
        if result.last() != Some(&point) {
            result.push(point);
        }
    }
    result
}

/// Surveyor's formula over an open ring, in tile coordinates.
fn signed_area(ring: &[Point]) -> f64 {
    let mut sum = 0.0;
    for (i, a) in ring.iter().enumerate() {
        let b = ring[(i + 1) % ring.len()];
        sum += a.0 * b.1 - b.0 * a.1;
    }
    sum / 2.0
}

/// Sutherland-Hodgman clipping of an open ring against the square `[min, max]²`.
fn clip_ring(ring: &[Point], min: f64, max: f64) -> Vec<Point> {
    // (axis, bound, inside when the coordinate is at least the bound)
    let edges = [(0, min, true), (0, max, false), (1, min, true), (1, max, false)];

    let mut output = ring.to_vec();
    for (axis, bound, lower) in edges {
        let input = std::mem::take(&mut output);
        let Some(&last) = input.last() else {
            break;
        };

        let inside = |point: Point| {
            let value = if axis == 0 { point.0 } else { point.1 };
            if lower {
                value >= bound
            } else {
                value <= bound
            }
        };
        let intersect = |from: Point, to: Point| {
            if axis == 0 {
                let t = (bound - from.0) / (to.0 - from.0);
                (bound, from.1 + t * (to.1 - from.1))
            } else {
                let t = (bound - from.1) / (to.1 - from.1);
                (from.0 + t * (to.0 - from.0), bound)
            }
        };

        let mut previous = last;
        for &current in &input {
            match (inside(previous), inside(current)) {
                (true, true) => output.push(current),
                (true, false) => output.push(intersect(previous, current)),
                (false, true) => {
                    output.push(intersect(previous, current));
                    output.push(current);
                }
                (false, false) => {}
            }
            previous = current;
        }
    }
    output
}

/// Liang-Barsky clipping of one segment against the square `[min, max]²`.
fn clip_segment(from: Point, to: Point, min: f64, max: f64) -> Option<(Point, Point)> {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    let mut t0: f64 = 0.0;
    let mut t1: f64 = 1.0;

    for (p, q) in [
        (-dx, from.0 - min),
        (dx, max - from.0),
        (-dy, from.1 - min),
        (dy, max - from.1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }

    let start = if t0 > 0.0 {
        (from.0 + t0 * dx, from.1 + t0 * dy)
    } else {
        from
    };
    let end = if t1 < 1.0 {
        (from.0 + t1 * dx, from.1 + t1 * dy)
    } else {
        to
    };
    Some((start, end))
}

/// Splits a polyline into the runs that lie inside the square `[min, max]²`.
fn clip_line(line: &[Point], min: f64, max: f64) -> Vec<Vec<Point>> {
    let mut parts = Vec::new();
    let mut current: Vec<Point> = Vec::new();

    for segment in line.windows(2) {
        match clip_segment(segment[0], segment[1], min, max) {
            Some((start, end)) => {
                if current.last() != Some(&start) {
                    if !current.is_empty() {
                        parts.push(std::mem::take(&mut current));
                    }
                    current.push(start);
                }
                current.push(end);
                if end != segment[1] {
                    parts.push(std::mem::take(&mut current));
                }
            }
            None => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
