//! Quadrants: the unit of search and storage partitioning.
//!
//! Quadrant geometries come from outside the pipeline. Two adapters are provided: a GeoJSON
//! FeatureCollection whose features carry a `pathrow` property, and a small polygon built
//! around a single coordinate.

use geojson::{Feature, GeoJson, Geometry, Value};
use serde::Serialize;
use std::f64::consts::PI;
use std::path::Path;
use thiserror::Error;

/// Radius in degrees of the polygon built around a single point.
pub const POINT_BUFFER_DEG: f64 = 0.01;

const POINT_BUFFER_VERTICES: usize = 32;

/// Property holding the quadrant identifier in GeoJSON input.
pub const PATHROW_PROPERTY: &str = "pathrow";

#[derive(Debug, Error)]
pub enum QuadrantError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid GeoJSON: {0}")]
    Parse(String),

    #[error("feature {index} has no '{PATHROW_PROPERTY}' property")]
    MissingId { index: usize },

    #[error("quadrant {id}: geometry must be a Polygon or MultiPolygon")]
    UnsupportedGeometry { id: String },

    #[error("coordinate out of range: lat {lat}, lon {lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// A quadrant identifier with its polygon in geographic coordinates (EPSG:4326).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quadrant {
    pub id: String,
    pub geometry: Geometry,
}

impl Quadrant {
    pub fn new(id: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            geometry,
        }
    }

    /// Build a quadrant as a small circular polygon around `(lat, lon)`.
    pub fn from_point(id: impl Into<String>, lat: f64, lon: f64) -> Result<Self, QuadrantError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(QuadrantError::InvalidCoordinate { lat, lon });
        }

        let mut ring: Vec<Vec<f64>> = (0..POINT_BUFFER_VERTICES)
            .map(|i| {
                let theta = 2.0 * PI * i as f64 / POINT_BUFFER_VERTICES as f64;
                vec![
                    lon + POINT_BUFFER_DEG * theta.cos(),
                    lat + POINT_BUFFER_DEG * theta.sin(),
                ]
            })
            .collect();
        // GeoJSON rings are closed.
        let first = ring[0].clone();
        ring.push(first);

        Ok(Self::new(id, Geometry::new(Value::Polygon(vec![ring]))))
    }
}

/// Reads quadrants from a GeoJSON FeatureCollection.
pub struct GeoJsonQuadrants;

impl GeoJsonQuadrants {
    pub fn load(path: &Path) -> Result<Vec<Quadrant>, QuadrantError> {
        let raw = std::fs::read_to_string(path).map_err(|source| QuadrantError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Parse quadrants in document order.
    pub fn parse(raw: &str) -> Result<Vec<Quadrant>, QuadrantError> {
        let geojson: GeoJson = raw
            .parse()
            .map_err(|e: geojson::Error| QuadrantError::Parse(e.to_string()))?;

        let features = match geojson {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(_) => {
                return Err(QuadrantError::Parse(
                    "expected a Feature or FeatureCollection".to_string(),
                ))
            }
        };

        features
            .into_iter()
            .enumerate()
            .map(|(index, feature)| quadrant_from_feature(index, feature))
            .collect()
    }
}

fn quadrant_from_feature(index: usize, feature: Feature) -> Result<Quadrant, QuadrantError> {
    let id = match feature.property(PATHROW_PROPERTY) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(QuadrantError::MissingId { index }),
    };

    match feature.geometry {
        Some(geometry)
            if matches!(geometry.value, Value::Polygon(_) | Value::MultiPolygon(_)) =>
        {
            Ok(Quadrant::new(id, geometry))
        }
        _ => Err(QuadrantError::UnsupportedGeometry { id }),
    }
}
