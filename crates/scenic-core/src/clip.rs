//! Clipping inputs to the area of interest.
use std::path::{Path, PathBuf};

use crate::error::{ClipError, RasterError, Result};
use crate::progress::Progress;
use crate::raster::{DataType, Extent, Raster, RasterInfo, Window};
use crate::tiles::{raster_calculator, windows, Block};
use crate::viewpoint::PointFeature;

/// Fallback no-data for a clipped DEM whose source declares none.
pub const CLIPPED_DEM_NODATA: f64 = -9999.0;

/// Features inside `aoi` (edges included).
pub fn clip_viewpoints(features: &[PointFeature], aoi: &Extent) -> std::result::Result<Vec<PointFeature>, ClipError> {
    let kept: Vec<PointFeature> = features.iter().filter(|f| aoi.contains(f.x, f.y)).cloned().collect();
    if kept.is_empty() {
        return Err(ClipError::Empty { total: features.len() });
    }
    tracing::info!("{} of {} viewpoints inside the area of interest", kept.len(), features.len());
    Ok(kept)
}

/// Crop `dem` to its overlap with `aoi` and mask every pixel whose centre
/// falls outside the AOI. The result is Float32 and keeps the DEM's no-data.
///
/// The crop is staged in a `clip_dem*` scratch directory under
/// `working_dir`, removed on every exit path.
pub fn clip_and_mask_dem(dem_path: &Path, aoi: &Extent, target: &Path, working_dir: &Path) -> Result<()> {
    let mut dem = Raster::open(dem_path)?;
    let info = dem.info().clone();
    let overlap = info.bounding_box().intersection(aoi).ok_or(ClipError::NoOverlap)?;
    let window = info.window_covering(&overlap).ok_or(ClipError::NoOverlap)?;
    let nodata = info.nodata.unwrap_or(CLIPPED_DEM_NODATA);

    std::fs::create_dir_all(working_dir).map_err(RasterError::io(working_dir))?;
    let scratch = tempfile::Builder::new()
        .prefix("clip_dem")
        .tempdir_in(working_dir)
        .map_err(RasterError::io(working_dir))?;

    let result = crop(&mut dem, &window, nodata, &scratch.path().join("cropped.ras"))
        .and_then(|cropped| mask(&cropped, aoi, nodata, target));

    let scratch_path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        tracing::error!("could not remove {}: {e}", scratch_path.display());
    }
    result
}

/// Copy `window` of `dem` into a new raster georeferenced at the window.
fn crop(dem: &mut Raster, window: &Window, nodata: f64, path: &Path) -> Result<PathBuf> {
    let src = dem.info().clone();
    let info = RasterInfo::new(
        window.width,
        window.height,
        src.transform.shifted(window.xoff, window.yoff),
        DataType::Float32,
        Some(nodata),
    );
    let mut out = Raster::create(path, info.clone(), nodata)?;
    for w in windows(info.width, info.height, info.block) {
        let from = Window::new(window.xoff + w.xoff, window.yoff + w.yoff, w.width, w.height);
        let mut data = dem.read_window(&from)?;
        for v in data.iter_mut().filter(|v| src.is_nodata(**v)) {
            *v = nodata;
        }
        out.write_window(&w, &data)?;
    }
    Ok(path.to_path_buf())
}

fn mask(cropped: &Path, aoi: &Extent, nodata: f64, target: &Path) -> Result<()> {
    let info = Raster::open(cropped)?.info().clone();
    let mut progress = Progress::new("masking DEM", info.pixel_count());
    raster_calculator(&[cropped], target, DataType::Float32, nodata, &mut progress, |window, blocks| {
        let mut out = Block::for_window(window, nodata);
        for r in 0..window.height {
            for c in 0..window.width {
                let (x, y) = info
                    .transform
                    .apply((window.xoff + c) as f64 + 0.5, (window.yoff + r) as f64 + 0.5);
                if aoi.contains(x, y) {
                    out.set(r, c, blocks[0].get(r, c));
                }
            }
        }
        out
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScenicError;
    use crate::raster::GeoTransform;

    #[test]
    fn viewpoint_clip_keeps_inside_points() {
        let aoi = Extent::new(0.0, 0.0, 10.0, 10.0);
        let pts = vec![PointFeature::at(1.0, 1.0), PointFeature::at(11.0, 1.0), PointFeature::at(10.0, 10.0)];
        let kept = clip_viewpoints(&pts, &aoi).unwrap();
        assert_eq!(kept, vec![PointFeature::at(1.0, 1.0), PointFeature::at(10.0, 10.0)]);
    }

    #[test]
    fn empty_viewpoint_clip_is_an_error() {
        let aoi = Extent::new(0.0, 0.0, 1.0, 1.0);
        let err = clip_viewpoints(&[PointFeature::at(5.0, 5.0)], &aoi).unwrap_err();
        assert_eq!(err, ClipError::Empty { total: 1 });
    }

    #[test]
    fn dem_is_cropped_and_masked() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.ras");
        let out = dir.path().join("clipped.ras");
        let work = dir.path().join("work");
        // 6x4 grid of 1 m pixels over (0,0)-(6,4), values = index.
        let info = RasterInfo::new(6, 4, GeoTransform::north_up(0.0, 4.0, 1.0), DataType::Float64, Some(-1.0));
        let data: Vec<f64> = (0..24).map(f64::from).collect();
        Raster::from_vec(&dem, info, &data).unwrap();

        // Window covers columns 1..=3 and rows 1..=2; every centre is inside.
        let aoi = Extent::new(1.0, 1.0, 3.7, 3.0);
        clip_and_mask_dem(&dem, &aoi, &out, &work).unwrap();

        let mut clipped = Raster::open(&out).unwrap();
        let ci = clipped.info().clone();
        assert_eq!((ci.width, ci.height), (3, 2));
        assert_eq!(ci.transform.origin(), (1.0, 3.0));
        assert_eq!(ci.dtype, DataType::Float32);
        assert_eq!(ci.nodata, Some(-1.0));
        assert_eq!(clipped.read_all().unwrap(), vec![7.0, 8.0, 9.0, 13.0, 14.0, 15.0]);
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);

        let masked = Extent::new(1.0, 1.0, 3.2, 3.0);
        clip_and_mask_dem(&dem, &masked, &out, &work).unwrap();
        assert_eq!(Raster::open(&out).unwrap().read_all().unwrap(), vec![7.0, 8.0, -1.0, 13.0, 14.0, -1.0]);
    }

    #[test]
    fn inexact_float32_nodata_stays_nodata_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.ras");
        let out = dir.path().join("clipped.ras");
        let info = RasterInfo::new(3, 1, GeoTransform::north_up(0.0, 1.0, 1.0), DataType::Float64, Some(-9999.9));
        Raster::from_vec(&dem, info, &[100.0, -9999.9, 100.0]).unwrap();

        clip_and_mask_dem(&dem, &Extent::new(0.0, 0.0, 3.0, 1.0), &out, &dir.path().join("work")).unwrap();
        let mut clipped = Raster::open(&out).unwrap();
        let ci = clipped.info().clone();
        let vals = clipped.read_all().unwrap();
        assert!(ci.is_nodata(vals[1]), "{vals:?} against {:?}", ci.nodata);
        assert!(!ci.is_nodata(vals[0]));

        let count = dir.path().join("count.ras");
        crate::aggregate::count_visible_structures(&[], &[], &out, &count).unwrap();
        let counts = Raster::open(&count).unwrap().read_all().unwrap();
        assert_eq!(counts, vec![0.0, crate::aggregate::COUNT_NODATA, 0.0]);
    }

    #[test]
    fn scratch_is_removed_when_masking_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.ras");
        let work = dir.path().join("work");
        let info = RasterInfo::new(4, 4, GeoTransform::north_up(0.0, 4.0, 1.0), DataType::Float32, Some(-1.0));
        Raster::create(&dem, info, 1.0).unwrap();

        let unwritable = dir.path().join("no_such_dir").join("clipped.ras");
        let err = clip_and_mask_dem(&dem, &Extent::new(1.0, 1.0, 3.0, 3.0), &unwritable, &work).unwrap_err();
        assert!(matches!(err, ScenicError::Raster(_)), "{err:?}");
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn disjoint_aoi_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dem = dir.path().join("dem.ras");
        let info = RasterInfo::new(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0), DataType::Float32, None);
        Raster::create(&dem, info, 1.0).unwrap();
        let err = clip_and_mask_dem(&dem, &Extent::new(5.0, 5.0, 6.0, 6.0), &dir.path().join("o.ras"), dir.path())
            .unwrap_err();
        assert!(matches!(err, ScenicError::Clip(ClipError::NoOverlap)));
    }
}
