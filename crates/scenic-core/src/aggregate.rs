//! Whole-landscape aggregates over the per-viewpoint rasters.
use std::path::{Path, PathBuf};

use crate::error::{Result, ScenicError};
use crate::progress::Progress;
use crate::raster::{DataType, Raster};
use crate::tiles::{raster_calculator, Block};
use crate::valuation::VALUATION_NODATA;

/// No-data value of the weighted visible-structure count raster.
pub const COUNT_NODATA: f64 = -1.0;

/// Weighted count of viewpoints that can see each pixel.
///
/// Every valid DEM pixel starts at 0 and gains `weights[i]` wherever
/// visibility raster `i` equals 1. DEM no-data stays no-data. With no
/// visibility rasters the result is all zeros over valid DEM pixels.
pub fn count_visible_structures(
    visibility_paths: &[PathBuf],
    weights: &[f64],
    dem_path: &Path,
    target: &Path,
) -> Result<()> {
    if visibility_paths.len() != weights.len() {
        return Err(ScenicError::WeightMismatch {
            weights: weights.len(),
            rasters: visibility_paths.len(),
        });
    }
    tracing::info!("Summing {} visibility rasters", visibility_paths.len());

    let mut inputs: Vec<&Path> = Vec::with_capacity(visibility_paths.len() + 1);
    inputs.push(dem_path);
    inputs.extend(visibility_paths.iter().map(PathBuf::as_path));
    let dem_info = Raster::open(dem_path)?.info().clone();

    let mut progress = Progress::new("visible structures", dem_info.pixel_count());
    raster_calculator(&inputs, target, DataType::Float32, COUNT_NODATA, &mut progress, |window, blocks| {
        let (dem, vis) = (&blocks[0], &blocks[1..]);
        let mut out = Block::for_window(window, COUNT_NODATA);
        for (i, cell) in out.data.iter_mut().enumerate() {
            if dem_info.is_nodata(dem.data[i]) {
                continue;
            }
            *cell = vis
                .iter()
                .zip(weights)
                .filter(|(v, _)| v.data[i] == 1.0)
                .fold(0.0, |acc, (_, w)| acc + w);
        }
        out
    })?;
    Ok(())
}

/// Sum of the per-viewpoint valuation rasters.
///
/// Valid DEM pixels start at 0; valuation no-data samples contribute
/// nothing. DEM no-data stays no-data.
pub fn sum_valuation_rasters(dem_path: &Path, valuation_paths: &[PathBuf], target: &Path) -> Result<()> {
    tracing::info!("Summing {} valuation rasters", valuation_paths.len());
    let mut inputs: Vec<&Path> = Vec::with_capacity(valuation_paths.len() + 1);
    inputs.push(dem_path);
    inputs.extend(valuation_paths.iter().map(PathBuf::as_path));
    let dem_info = Raster::open(dem_path)?.info().clone();

    let mut progress = Progress::new("valuation sum", dem_info.pixel_count());
    raster_calculator(&inputs, target, DataType::Float64, VALUATION_NODATA, &mut progress, |window, blocks| {
        let (dem, values) = (&blocks[0], &blocks[1..]);
        let mut out = Block::for_window(window, VALUATION_NODATA);
        for (i, cell) in out.data.iter_mut().enumerate() {
            if dem_info.is_nodata(dem.data[i]) {
                continue;
            }
            *cell = values
                .iter()
                .map(|b| b.data[i])
                .filter(|&v| v != VALUATION_NODATA)
                .fold(0.0, |acc, v| acc + v);
        }
        out
    })?;
    Ok(())
}
