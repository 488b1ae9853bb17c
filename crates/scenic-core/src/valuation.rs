//! Valuation of a single viewpoint's visibility raster.
//!
//! Each visible pixel is valued by a decay-with-distance function of the
//! ground distance to the viewpoint:
//!   linear:      (a + b·d) · w
//!   logarithmic: (a + b·ln d) · w      (d = 0 is valued 0)
//!   exponential:  a·exp(−b·d) · w
//! Pixels farther than the maximum valuation radius, and pixels that are not
//! visible, are valued 0. Only visibility no-data stays no-data.
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RasterError};
use crate::progress::Progress;
use crate::raster::{DataType, Raster};
use crate::tiles::{raster_calculator, Block};

/// No-data value of valuation and valuation-sum rasters.
pub const VALUATION_NODATA: f64 = -99999.0;

/// Pixel size (ground units) below which logarithmic valuation gets noisy.
pub const LOG_PIXEL_SIZE_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValuationMethod {
    Linear,
    Logarithmic,
    Exponential,
}

impl FromStr for ValuationMethod {
    type Err = ConfigError;

    /// Accepts any case-insensitive string starting with a method name,
    /// e.g. `"linear"` or `"exponential: a * e^(-bx)"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.starts_with("linear") {
            Ok(ValuationMethod::Linear)
        } else if lower.starts_with("logarithmic") {
            Ok(ValuationMethod::Logarithmic)
        } else if lower.starts_with("exponential") {
            Ok(ValuationMethod::Exponential)
        } else {
            Err(ConfigError::UnknownValuation(s.to_string()))
        }
    }
}

impl fmt::Display for ValuationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValuationMethod::Linear => "linear",
            ValuationMethod::Logarithmic => "logarithmic",
            ValuationMethod::Exponential => "exponential",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValuationParams {
    pub method: ValuationMethod,
    pub a: f64,
    pub b: f64,
    /// Ground distance past which every pixel is valued 0.
    pub max_valuation_radius: f64,
}

impl ValuationParams {
    /// Value of one pixel `distance` ground units from the viewpoint.
    #[inline]
    pub fn value(&self, distance: f64, visibility: f64, weight: f64) -> f64 {
        if visibility <= 0.0 || distance > self.max_valuation_radius {
            return 0.0;
        }
        let scale = weight * visibility;
        match self.method {
            ValuationMethod::Linear => (self.a + self.b * distance) * scale,
            ValuationMethod::Logarithmic if distance > 0.0 => (self.a + self.b * distance.ln()) * scale,
            ValuationMethod::Logarithmic => 0.0,
            ValuationMethod::Exponential => self.a * (-self.b * distance).exp() * scale,
        }
    }
}

/// Log a warning when logarithmic valuation meets sub-threshold pixels.
/// Returns whether the warning fired.
pub fn warn_if_unstable(method: ValuationMethod, mean_pixel_size: f64, threshold: f64) -> bool {
    let unstable = method == ValuationMethod::Logarithmic && mean_pixel_size < threshold;
    if unstable {
        tracing::warn!(
            "Pixel sizes are less than {threshold} ground units. Expect strange results with the \
             logarithmic valuation method for pixels closer than {threshold} to the viewpoint."
        );
    }
    unstable
}

/// Write the valuation raster for one viewpoint.
///
/// `viewpoint` is in the visibility raster's map coordinates; distances are
/// measured pixel centre to pixel centre and scaled by the mean pixel size.
pub fn calculate_valuation(
    visibility_path: &Path,
    viewpoint: (f64, f64),
    weight: f64,
    params: &ValuationParams,
    target: &Path,
) -> Result<(), RasterError> {
    tracing::info!(
        "Calculating valuation with {} method. Coefficients: a={} b={}",
        params.method,
        params.a,
        params.b
    );
    let info = Raster::open(visibility_path)?.info().clone();
    let (ix, iy) = info.transform.pixel_of(viewpoint.0, viewpoint.1);
    let pixel_size = info.transform.mean_pixel_size();

    let mut progress = Progress::new(format!("valuation {}", target.display()), info.pixel_count());
    raster_calculator(
        &[visibility_path],
        target,
        DataType::Float64,
        VALUATION_NODATA,
        &mut progress,
        |window, blocks| {
            let vis = &blocks[0];
            let mut out = Block::for_window(window, VALUATION_NODATA);
            for r in 0..window.height {
                let dy = (window.yoff + r) as f64 - iy as f64;
                for c in 0..window.width {
                    let v = vis.get(r, c);
                    if info.is_nodata(v) {
                        continue;
                    }
                    let dx = (window.xoff + c) as f64 - ix as f64;
                    let distance = dx.hypot(dy) * pixel_size;
                    out.set(r, c, params.value(distance, v, weight));
                }
            }
            out
        },
    )
}
