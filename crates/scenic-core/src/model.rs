//! Scenic quality model: wires clipping, visibility, valuation, aggregation
//! and classification into one task graph.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::aggregate::{count_visible_structures, sum_valuation_rasters};
use crate::clip::{clip_and_mask_dem, clip_viewpoints};
use crate::error::{ConfigError, RasterError, Result, ScenicError};
use crate::percentile::calculate_visual_quality;
use crate::raster::{Extent, Raster};
use crate::taskgraph::{GraphSummary, TaskGraph, TaskSpec};
use crate::valuation::{calculate_valuation, warn_if_unstable, ValuationParams, LOG_PIXEL_SIZE_THRESHOLD};
use crate::viewpoint::{prepare_viewpoints, read_points, write_points, IndexedViewpoint};
use crate::visibility::{aligned_with_dem, VisibilityModel, VisibilityParams};

const RASTER_EXT: &str = "ras";

fn default_refraction() -> f64 {
    0.13
}

fn default_log_threshold() -> f64 {
    LOG_PIXEL_SIZE_THRESHOLD
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Model arguments, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub workspace_dir: PathBuf,
    /// Appended to every output file name.
    #[serde(default)]
    pub results_suffix: String,
    pub dem_path: PathBuf,
    /// Point collection (JSON) of structures to view.
    pub viewpoints_path: PathBuf,
    /// Area of interest; the DEM's bounding box when absent.
    #[serde(default)]
    pub aoi: Option<Extent>,
    #[serde(default = "default_refraction")]
    pub refraction: f64,
    /// `linear`, `logarithmic` or `exponential` (prefix match).
    pub valuation_function: String,
    pub a_coef: f64,
    pub b_coef: f64,
    pub max_valuation_radius: f64,
    /// 0 runs every task synchronously.
    #[serde(default)]
    pub n_workers: usize,
    /// Pixel size below which logarithmic valuation triggers a warning.
    #[serde(default = "default_log_threshold")]
    pub log_pixel_size_threshold: f64,
}

impl ModelConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(ScenicError::io(path))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ScenicError::Json { path: path.to_path_buf(), source })
    }

    pub fn valuation(&self) -> std::result::Result<ValuationParams, ConfigError> {
        Ok(ValuationParams {
            method: self.valuation_function.parse()?,
            a: self.a_coef,
            b: self.b_coef,
            max_valuation_radius: self.max_valuation_radius,
        })
    }
}

// ── File registry ─────────────────────────────────────────────────────────────

/// Every path the model reads or writes under its workspace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRegistry {
    pub output_dir: PathBuf,
    pub intermediate_dir: PathBuf,
    pub token_dir: PathBuf,
    /// Sum of per-viewpoint valuation.
    pub viewshed_value: PathBuf,
    /// Weighted count of visible structures.
    pub n_visible_structures: PathBuf,
    /// Visual quality classes.
    pub viewshed_quality: PathBuf,
    pub clipped_dem: PathBuf,
    pub clipped_structures: PathBuf,
    suffix: String,
}

impl FileRegistry {
    pub fn new(workspace: &Path, suffix: &str) -> Self {
        let suffix = match suffix {
            "" => String::new(),
            s if s.starts_with('_') => s.to_string(),
            s => format!("_{s}"),
        };
        let output_dir = workspace.join("output");
        let intermediate_dir = workspace.join("intermediate");
        let raster = |dir: &Path, stem: &str| dir.join(format!("{stem}{suffix}.{RASTER_EXT}"));
        Self {
            viewshed_value: raster(&output_dir, "vshed_value"),
            n_visible_structures: raster(&output_dir, "vshed"),
            viewshed_quality: raster(&output_dir, "vshed_qual"),
            clipped_dem: raster(&intermediate_dir, "dem_clipped"),
            clipped_structures: intermediate_dir.join(format!("structures_clipped{suffix}.json")),
            token_dir: intermediate_dir.join("_tmp_work_tokens"),
            output_dir,
            intermediate_dir,
            suffix,
        }
    }

    fn per_viewpoint(&self, stem: &str, id: usize) -> PathBuf {
        self.intermediate_dir.join(format!("{stem}_{id}{}.{RASTER_EXT}", self.suffix))
    }

    pub fn visibility(&self, id: usize) -> PathBuf {
        self.per_viewpoint("visibility", id)
    }

    pub fn auxiliary(&self, id: usize) -> PathBuf {
        self.per_viewpoint("auxiliary", id)
    }

    pub fn value(&self, id: usize) -> PathBuf {
        self.per_viewpoint("value", id)
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ModelOutputs {
    pub files: FileRegistry,
    pub viewpoints: Vec<IndexedViewpoint>,
    pub summary: GraphSummary,
}

/// Run the model. The valuation method is validated before any task exists.
pub fn execute(config: &ModelConfig, visibility: Arc<dyn VisibilityModel>) -> Result<ModelOutputs> {
    let valuation = config.valuation()?;
    let dem_info = Raster::open(&config.dem_path)?.info().clone();
    warn_if_unstable(valuation.method, dem_info.transform.mean_pixel_size(), config.log_pixel_size_threshold);

    let files = FileRegistry::new(&config.workspace_dir, &config.results_suffix);
    for dir in [&files.output_dir, &files.intermediate_dir] {
        std::fs::create_dir_all(dir).map_err(ScenicError::io(dir))?;
    }
    let graph = TaskGraph::new(&files.token_dir, config.n_workers)?;
    let aoi = config.aoi.unwrap_or_else(|| dem_info.bounding_box());

    // Phase 1: clip inputs to the area of interest.
    let clip_dem_task = {
        let (dem, target, work) = (config.dem_path.clone(), files.clipped_dem.clone(), files.intermediate_dir.clone());
        let spec = TaskSpec::new("clip_dem_to_aoi", "clip_and_mask_dem")
            .args(json!({ "dem": path_arg(&dem), "aoi": aoi_arg(&aoi) }))
            .inputs([&dem])
            .targets([&target]);
        graph.add_task(spec, move || clip_and_mask_dem(&dem, &aoi, &target, &work))?
    };
    let clip_structures_task = {
        let (src, target) = (config.viewpoints_path.clone(), files.clipped_structures.clone());
        let spec = TaskSpec::new("clip_structures_to_aoi", "clip_viewpoints")
            .args(json!({ "structures": path_arg(&src), "aoi": aoi_arg(&aoi) }))
            .inputs([&src])
            .targets([&target]);
        graph.add_task(spec, move || -> Result<()> {
            let clipped = clip_viewpoints(&read_points(&src)?, &aoi)?;
            write_points(&target, &clipped)
        })?
    };
    tracing::info!("Waiting for clipping to finish");
    graph.join(clip_dem_task)?;
    graph.join(clip_structures_task)?;

    // Phase 2: per-viewpoint visibility and valuation.
    tracing::info!("Setting up visibility tasks");
    let viewpoints = prepare_viewpoints(&read_points(&files.clipped_structures)?, &files.clipped_dem)?;

    let mut visibility_paths = Vec::with_capacity(viewpoints.len());
    let mut visibility_tasks = Vec::with_capacity(viewpoints.len());
    let mut valuation_paths = Vec::with_capacity(viewpoints.len());
    let mut valuation_tasks = Vec::with_capacity(viewpoints.len());
    let mut weights = Vec::with_capacity(viewpoints.len());
    for &IndexedViewpoint { index, viewpoint } in &viewpoints {
        let location = (viewpoint.x, viewpoint.y);
        let params = VisibilityParams {
            curved_earth: true,
            refraction: config.refraction,
            max_distance: viewpoint.max_radius,
            viewpoint_height: viewpoint.height,
        };
        let (vis_path, aux_path) = (files.visibility(index), files.auxiliary(index));
        let vis_task = {
            let (dem, vis, aux, model) = (files.clipped_dem.clone(), vis_path.clone(), aux_path.clone(), Arc::clone(&visibility));
            let spec = TaskSpec::new(format!("calculate_visibility_{index}"), "visibility")
                .args(json!({ "model": visibility.name(), "viewpoint": [location.0, location.1], "params": params }))
                .inputs([&dem])
                .targets([&aux_path, &vis_path])
                .depends_on([clip_dem_task, clip_structures_task]);
            graph.add_task(spec, move || -> Result<()> {
                model.compute(&dem, location, &params, &vis, &aux)?;
                if !aligned_with_dem(&vis, &dem)? {
                    return Err(RasterError::Misaligned { path: vis, base: dem }.into());
                }
                Ok(())
            })?
        };

        let value_path = files.value(index);
        let value_task = {
            let (vis, target, weight) = (vis_path.clone(), value_path.clone(), viewpoint.weight);
            let spec = TaskSpec::new(format!("calculate_valuation_for_viewshed_{index}"), "valuation")
                .args(json!({ "viewpoint": [location.0, location.1], "weight": weight, "valuation": valuation }))
                .inputs([&vis])
                .targets([&value_path])
                .depends_on([vis_task]);
            graph.add_task(spec, move || calculate_valuation(&vis, location, weight, &valuation, &target))?
        };

        visibility_paths.push(vis_path);
        visibility_tasks.push(vis_task);
        valuation_paths.push(value_path);
        valuation_tasks.push(value_task);
        weights.push(viewpoint.weight);
    }

    // Phase 3: landscape-wide aggregates and classification.
    let sum_task = {
        let (dem, paths, target) = (files.clipped_dem.clone(), valuation_paths.clone(), files.viewshed_value.clone());
        let spec = TaskSpec::new("add_up_valuation_rasters", "sum_valuation")
            .args(json!({ "rasters": paths_arg(&paths) }))
            .inputs(std::iter::once(&dem).chain(&paths))
            .targets([&target])
            .depends_on(valuation_tasks.iter().copied().chain([clip_dem_task]));
        graph.add_task(spec, move || sum_valuation_rasters(&dem, &paths, &target))?
    };
    {
        let (dem, paths, target) = (files.clipped_dem.clone(), visibility_paths.clone(), files.n_visible_structures.clone());
        let spec = TaskSpec::new("sum_visibility_for_all_structures", "count_visible")
            .args(json!({ "rasters": paths_arg(&paths), "weights": weights }))
            .inputs(std::iter::once(&dem).chain(&paths))
            .targets([&target])
            .depends_on(visibility_tasks.iter().copied().chain([clip_dem_task]));
        graph.add_task(spec, move || count_visible_structures(&paths, &weights, &dem, &target))?;
    }
    {
        let (src, work, target) = (files.viewshed_value.clone(), files.intermediate_dir.clone(), files.viewshed_quality.clone());
        let spec = TaskSpec::new("calculate_visual_quality", "visual_quality")
            .inputs([&src])
            .targets([&target])
            .depends_on([sum_task]);
        graph.add_task(spec, move || calculate_visual_quality(&src, &work, &target).map(drop))?;
    }

    tracing::info!("Waiting for scenic quality tasks to complete");
    graph.join_all()?;
    let summary = graph.summary();
    tracing::info!(
        "Scenic quality finished: {} run, {} up to date, {} viewpoints",
        summary.done,
        summary.skipped,
        viewpoints.len()
    );
    Ok(ModelOutputs { files, viewpoints, summary })
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn paths_arg(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| path_arg(p)).collect()
}

fn aoi_arg(aoi: &Extent) -> [f64; 4] {
    [aoi.min_x, aoi.min_y, aoi.max_x, aoi.max_y]
}
