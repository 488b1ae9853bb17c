//! Scenic quality: visibility, valuation and visual-quality surfaces over a
//! terrain grid, computed tile by tile under a memoizing task graph.
pub mod aggregate;
pub mod clip;
pub mod error;
pub mod model;
pub mod percentile;
pub mod progress;
pub mod raster;
pub mod taskgraph;
pub mod tiles;
pub mod valuation;
pub mod viewpoint;
pub mod visibility;

pub use error::{ClipError, ConfigError, GraphError, RasterError, Result, ScenicError};
pub use model::{execute, FileRegistry, ModelConfig, ModelOutputs};
pub use raster::{DataType, Extent, GeoTransform, Raster, RasterInfo, Window};
pub use taskgraph::{GraphSummary, TaskGraph, TaskHandle, TaskSpec, TaskStatus};
pub use tiles::{raster_calculator, Block, TileStream};
pub use valuation::{ValuationMethod, ValuationParams};
pub use visibility::{DiskVisibility, VisibilityModel, VisibilityParams};
