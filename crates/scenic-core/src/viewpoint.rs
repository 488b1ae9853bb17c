//! Viewpoints: point features with optional weight, radius and height.
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScenicError};
use crate::raster::Raster;

/// One point of an input collection, attributes as they appear on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointFeature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<u64>,
    pub x: f64,
    pub y: f64,
    #[serde(rename = "WEIGHT", default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(rename = "RADIUS", default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(rename = "RADIUS2", default, skip_serializing_if = "Option::is_none")]
    pub radius2: Option<f64>,
    #[serde(rename = "HEIGHT", default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl PointFeature {
    pub fn at(x: f64, y: f64) -> Self {
        Self { fid: None, x, y, weight: None, radius: None, radius2: None, height: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCollection {
    pub features: Vec<PointFeature>,
}

pub fn read_points(path: &Path) -> Result<Vec<PointFeature>> {
    let file = File::open(path).map_err(ScenicError::io(path))?;
    let collection: PointCollection = serde_json::from_reader(BufReader::new(file))
        .map_err(|source| ScenicError::Json { path: path.to_path_buf(), source })?;
    Ok(collection.features)
}

pub fn write_points(path: &Path, features: &[PointFeature]) -> Result<()> {
    let file = File::create(path).map_err(ScenicError::io(path))?;
    let collection = PointCollection { features: features.to_vec() };
    serde_json::to_writer_pretty(BufWriter::new(file), &collection)
        .map_err(|source| ScenicError::Json { path: path.to_path_buf(), source })
}

/// A viewpoint ready for visibility analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub x: f64,
    pub y: f64,
    /// Visibility radius in ground units; `None` is unbounded.
    pub max_radius: Option<f64>,
    /// Height of the observer above the terrain.
    pub height: f64,
    pub weight: f64,
}

impl Viewpoint {
    /// Weight defaults to 1. Radius is `|RADIUS|`, else `|RADIUS2|`, else
    /// unbounded. Height is `|HEIGHT|`, else 0.
    pub fn from_feature(f: &PointFeature) -> Self {
        Self {
            x: f.x,
            y: f.y,
            max_radius: f.radius.or(f.radius2).map(f64::abs),
            height: f.height.map_or(0.0, f64::abs),
            weight: f.weight.unwrap_or(1.0),
        }
    }
}

/// A viewpoint with the stable index used to name its derived rasters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedViewpoint {
    pub index: usize,
    pub viewpoint: Viewpoint,
}

/// Keep the features that sit inside the DEM's bounding box (edges
/// included) over a valid DEM pixel, sorted by `(x, y)` and indexed in that
/// order. Skipped features are logged, not errors.
pub fn prepare_viewpoints(features: &[PointFeature], dem_path: &Path) -> Result<Vec<IndexedViewpoint>> {
    let mut dem = Raster::open(dem_path)?;
    let info = dem.info().clone();
    let bbox = info.bounding_box();

    let mut kept = Vec::with_capacity(features.len());
    for (i, f) in features.iter().enumerate() {
        let id = f.fid.unwrap_or(i as u64);
        if !bbox.contains(f.x, f.y) {
            tracing::info!("Feature {id} is not within the DEM bounding box. Skipping.");
            continue;
        }
        // Points on the far edges map one pixel past the grid.
        let (col, row) = info.transform.pixel_of(f.x, f.y);
        let col = col.clamp(0, info.width as i64 - 1) as usize;
        let row = row.clamp(0, info.height as i64 - 1) as usize;
        if info.is_nodata(dem.read_pixel(col, row)?) {
            tracing::info!("Feature {id} is over a DEM nodata pixel. Skipping.");
            continue;
        }
        kept.push(Viewpoint::from_feature(f));
    }

    kept.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    tracing::info!("{} of {} viewpoints usable", kept.len(), features.len());
    Ok(kept
        .into_iter()
        .enumerate()
        .map(|(index, viewpoint)| IndexedViewpoint { index, viewpoint })
        .collect())
}
