//! Seam to the line-of-sight algorithm.
//!
//! The model only needs a binary visibility raster aligned to the DEM for
//! each viewpoint. [`VisibilityModel`] is that contract; [`DiskVisibility`]
//! is a radius-only implementation for wiring and tests.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::progress::Progress;
use crate::raster::{DataType, Raster};
use crate::tiles::{raster_calculator, Block, TileStream};

/// No-data value of per-viewpoint visibility rasters.
pub const VISIBILITY_NODATA: f64 = 255.0;

/// No-data value of auxiliary (distance) rasters.
pub const AUXILIARY_NODATA: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisibilityParams {
    /// Earth curvature correction. The model always enables it.
    pub curved_earth: bool,
    pub refraction: f64,
    /// Ground distance past which nothing is visible; `None` is unbounded.
    pub max_distance: Option<f64>,
    pub viewpoint_height: f64,
}

pub trait VisibilityModel: Send + Sync {
    fn name(&self) -> &str;

    /// Write a Byte raster aligned to `dem` with 1 (visible), 0 (hidden) or
    /// [`VISIBILITY_NODATA`], plus an auxiliary raster of the same layout.
    fn compute(
        &self,
        dem: &Path,
        viewpoint: (f64, f64),
        params: &VisibilityParams,
        visibility_target: &Path,
        auxiliary_target: &Path,
    ) -> Result<()>;
}

/// Every valid terrain pixel within `max_distance` of the viewpoint is
/// visible. The auxiliary raster holds the ground distance to each pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskVisibility;

impl VisibilityModel for DiskVisibility {
    fn name(&self) -> &str {
        "disk"
    }

    fn compute(
        &self,
        dem: &Path,
        viewpoint: (f64, f64),
        params: &VisibilityParams,
        visibility_target: &Path,
        auxiliary_target: &Path,
    ) -> Result<()> {
        let info = TileStream::open(&[dem])?.info().clone();
        let (ix, iy) = info.transform.pixel_of(viewpoint.0, viewpoint.1);
        let pixel_size = info.transform.mean_pixel_size();
        let distance = |col: usize, row: usize| {
            (col as f64 - ix as f64).hypot(row as f64 - iy as f64) * pixel_size
        };
        let limit = params.max_distance.unwrap_or(f64::INFINITY);

        let mut progress = Progress::new(format!("visibility {}", visibility_target.display()), info.pixel_count());
        raster_calculator(&[dem], visibility_target, DataType::Byte, VISIBILITY_NODATA, &mut progress, |w, blocks| {
            let mut out = Block::for_window(w, VISIBILITY_NODATA);
            for r in 0..w.height {
                for c in 0..w.width {
                    if info.is_nodata(blocks[0].get(r, c)) {
                        continue;
                    }
                    let visible = distance(w.xoff + c, w.yoff + r) <= limit;
                    out.set(r, c, if visible { 1.0 } else { 0.0 });
                }
            }
            out
        })?;

        let mut progress = Progress::new(format!("auxiliary {}", auxiliary_target.display()), info.pixel_count());
        raster_calculator(&[dem], auxiliary_target, DataType::Float64, AUXILIARY_NODATA, &mut progress, |w, blocks| {
            let mut out = Block::for_window(w, AUXILIARY_NODATA);
            for r in 0..w.height {
                for c in 0..w.width {
                    if !info.is_nodata(blocks[0].get(r, c)) {
                        out.set(r, c, distance(w.xoff + c, w.yoff + r));
                    }
                }
            }
            out
        })?;
        Ok(())
    }
}

/// Open a visibility raster and report whether it is aligned with `dem`.
pub fn aligned_with_dem(visibility: &Path, dem: &Path) -> Result<bool> {
    let vis = Raster::open(visibility)?;
    let dem = Raster::open(dem)?;
    Ok(vis.info().aligned_with(dem.info()))
}
