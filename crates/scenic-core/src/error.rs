use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::raster::Window;

/// Error type carried out of a task body into the scheduler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared form of [`BoxError`], so one failure can be reported at every join.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = ScenicError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a scenic raster: {reason}")]
    BadHeader { path: PathBuf, reason: String },
    #[error("window {window:?} falls outside a {width}x{height} raster")]
    WindowOutOfBounds {
        window: Window,
        width: usize,
        height: usize,
    },
    #[error("{got} samples supplied for a window of {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("{path} is not aligned with {base}")]
    Misaligned { path: PathBuf, base: PathBuf },
    #[error("a tile stream needs at least one input raster")]
    NoInputs,
}

impl RasterError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| RasterError::Io { path, source }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("valuation function type `{0}` not recognized")]
    UnknownValuation(String),
    #[error("quantiles must be ascending values in [0, 1], got {0:?}")]
    BadQuantiles(Vec<f64>),
    #[error("at most {max} quantiles fit in a byte classification, got {got}")]
    TooManyQuantiles { max: usize, got: usize },
}

#[derive(Debug, Error, PartialEq)]
pub enum ClipError {
    #[error("none of the {total} viewpoints fall inside the area of interest")]
    Empty { total: usize },
    #[error("the area of interest does not overlap the DEM")]
    NoOverlap,
}

#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("task `{0}` was already added with a different identity")]
    DuplicateTask(String),
    #[error("target {target} is already produced by task `{owner}`")]
    TargetConflict { target: PathBuf, owner: String },
    #[error("no task with handle {0}")]
    UnknownTask(usize),
    #[error("task `{task}` failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: SharedError,
    },
    #[error("task `{task}` finished without creating target {target}")]
    MissingTarget { task: String, target: PathBuf },
    #[error("task `{task}` skipped because upstream task `{upstream}` failed")]
    UpstreamFailed { task: String, upstream: String },
    #[error("token store at {path}: {source}")]
    TokenStore {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("cannot start worker pool: {0}")]
    WorkerPool(String),
}

#[derive(Debug, Error)]
pub enum ScenicError {
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Clip(#[from] ClipError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{weights} weights supplied for {rasters} visibility rasters")]
    WeightMismatch { weights: usize, rasters: usize },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ScenicError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ScenicError::Io { path, source }
    }
}
