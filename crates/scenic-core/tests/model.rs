use std::path::Path;
use std::sync::Arc;

use scenic_core::error::{ClipError, GraphError, RasterError};
use scenic_core::percentile::BYTE_NODATA;
use scenic_core::raster::{DataType, Extent, GeoTransform, Raster, RasterInfo};
use scenic_core::valuation::VALUATION_NODATA;
use scenic_core::viewpoint::{write_points, PointFeature};
use scenic_core::{execute, DiskVisibility, ModelConfig, ScenicError, VisibilityModel, VisibilityParams};

const DEM_NODATA: f64 = -1.0;

/// 10x10 grid of 1 m pixels over (0,0)-(10,10); elevation 100 inside the
/// 6x6 inset at rows/cols 2..8, no-data elsewhere.
fn inset_dem(path: &Path) {
    let info = RasterInfo::new(10, 10, GeoTransform::north_up(0.0, 10.0, 1.0), DataType::Float32, Some(DEM_NODATA))
        .with_block(4, 4);
    let data: Vec<f64> = (0..100)
        .map(|i| {
            let (r, c) = (i / 10, i % 10);
            if (2..8).contains(&r) && (2..8).contains(&c) {
                100.0
            } else {
                DEM_NODATA
            }
        })
        .collect();
    Raster::from_vec(path, info, &data).unwrap();
}

fn in_inset(i: usize) -> bool {
    let (r, c) = (i / 10, i % 10);
    (2..8).contains(&r) && (2..8).contains(&c)
}

fn config(ws: &Path, points: &[PointFeature], workers: usize) -> ModelConfig {
    let dem = ws.join("dem.ras");
    let pts = ws.join("structures.json");
    inset_dem(&dem);
    write_points(&pts, points).unwrap();
    ModelConfig {
        workspace_dir: ws.join("workspace"),
        results_suffix: String::new(),
        dem_path: dem,
        viewpoints_path: pts,
        aoi: None,
        refraction: 0.13,
        valuation_function: "linear".into(),
        a_coef: 1.0,
        b_coef: 0.0,
        max_valuation_radius: 1000.0,
        n_workers: workers,
        log_pixel_size_threshold: 1.0,
    }
}

fn weighted(x: f64, y: f64, weight: f64) -> PointFeature {
    PointFeature { weight: Some(weight), ..PointFeature::at(x, y) }
}

fn read(path: &Path) -> Vec<f64> {
    Raster::open(path).unwrap().read_all().unwrap()
}

#[test]
fn single_viewpoint_inset_example() {
    for workers in [0, 2] {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[weighted(5.0, 5.0, 2.0)], workers);
        let out = execute(&cfg, Arc::new(DiskVisibility)).unwrap();
        assert_eq!(out.viewpoints.len(), 1);

        let value = read(&out.files.viewshed_value);
        let count = read(&out.files.n_visible_structures);
        let quality = read(&out.files.viewshed_quality);
        for i in 0..100 {
            if in_inset(i) {
                assert_eq!(value[i], 2.0, "valuation at {i}");
                assert_eq!(count[i], 2.0, "count at {i}");
                assert_eq!(quality[i], 4.0, "quality at {i}");
            } else {
                assert_eq!(value[i], VALUATION_NODATA, "valuation at {i}");
                assert_eq!(count[i], -1.0, "count at {i}");
                assert_eq!(quality[i], BYTE_NODATA, "quality at {i}");
            }
        }
        assert!(out.files.visibility(0).exists());
        assert!(out.files.value(0).exists());
    }
}

#[test]
fn two_viewpoints_add_their_weights() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &[weighted(6.5, 3.5, 3.0), weighted(3.5, 6.5, 1.0)], 0);
    let out = execute(&cfg, Arc::new(DiskVisibility)).unwrap();

    let idx: Vec<usize> = out.viewpoints.iter().map(|v| v.index).collect();
    assert_eq!(idx, vec![0, 1]);
    // Sorted by x: the weight-1 viewpoint comes first.
    assert_eq!(out.viewpoints[0].viewpoint.weight, 1.0);

    let count = read(&out.files.n_visible_structures);
    assert_eq!(count[5 * 10 + 5], 4.0);
    let value = read(&out.files.viewshed_value);
    assert_eq!(value[5 * 10 + 5], 4.0);
}

#[test]
fn viewpoints_over_nodata_leave_zero_aggregates() {
    let dir = tempfile::tempdir().unwrap();
    // Inside the AOI, but over a DEM no-data pixel.
    let cfg = config(dir.path(), &[PointFeature::at(0.5, 0.5)], 0);
    let out = execute(&cfg, Arc::new(DiskVisibility)).unwrap();
    assert!(out.viewpoints.is_empty());

    let count = read(&out.files.n_visible_structures);
    let value = read(&out.files.viewshed_value);
    let quality = read(&out.files.viewshed_quality);
    for i in 0..100 {
        let (c, v, q) = if in_inset(i) { (0.0, 0.0, 0.0) } else { (-1.0, VALUATION_NODATA, BYTE_NODATA) };
        assert_eq!((count[i], value[i], quality[i]), (c, v, q), "pixel {i}");
    }
}

#[test]
fn rerun_skips_every_task() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &[weighted(5.0, 5.0, 2.0), weighted(3.0, 3.0, 1.0)], 2);

    let first = execute(&cfg, Arc::new(DiskVisibility)).unwrap();
    assert_eq!(first.summary.skipped, 0);
    let total = first.summary.done;
    assert_eq!(total, 2 + 2 * 2 + 3);

    let second = execute(&cfg, Arc::new(DiskVisibility)).unwrap();
    assert_eq!(second.summary.done, 0);
    assert_eq!(second.summary.skipped, total);
}

#[test]
fn unknown_valuation_fails_before_any_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &[weighted(5.0, 5.0, 2.0)], 0);
    cfg.valuation_function = "quadratic".into();

    let err = execute(&cfg, Arc::new(DiskVisibility)).unwrap_err();
    assert!(matches!(err, ScenicError::Config(_)));
    assert!(!cfg.workspace_dir.join("intermediate").exists());
}

#[test]
fn empty_clip_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &[weighted(9.0, 9.0, 1.0)], 0);
    cfg.aoi = Some(Extent::new(2.0, 2.0, 8.0, 8.0));

    let err = execute(&cfg, Arc::new(DiskVisibility)).unwrap_err();
    match err {
        ScenicError::Graph(GraphError::TaskFailed { task, source }) => {
            assert_eq!(task, "clip_structures_to_aoi");
            let clip = source.downcast_ref::<ScenicError>();
            assert!(matches!(clip, Some(ScenicError::Clip(ClipError::Empty { total: 1 }))));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

/// Writes visibility on a grid smaller than the DEM.
struct ShrunkenVisibility;

impl VisibilityModel for ShrunkenVisibility {
    fn name(&self) -> &str {
        "shrunken"
    }

    fn compute(
        &self,
        _dem: &Path,
        _viewpoint: (f64, f64),
        _params: &VisibilityParams,
        visibility_target: &Path,
        auxiliary_target: &Path,
    ) -> scenic_core::Result<()> {
        let info = RasterInfo::new(5, 5, GeoTransform::north_up(0.0, 10.0, 1.0), DataType::Byte, Some(255.0));
        Raster::create(visibility_target, info.clone(), 1.0)?;
        Raster::create(auxiliary_target, info, 0.0)?;
        Ok(())
    }
}

#[test]
fn misaligned_visibility_fails_its_task() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &[weighted(5.0, 5.0, 2.0)], 0);

    let err = execute(&cfg, Arc::new(ShrunkenVisibility)).unwrap_err();
    match err {
        ScenicError::Graph(GraphError::TaskFailed { task, source }) => {
            assert_eq!(task, "calculate_visibility_0");
            let cause = source.downcast_ref::<ScenicError>();
            assert!(matches!(cause, Some(ScenicError::Raster(RasterError::Misaligned { .. }))), "{cause:?}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!cfg.workspace_dir.join("output").join("vshed_value.ras").exists());
}
