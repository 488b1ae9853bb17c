//! PNG quicklook of a visual-quality raster.
use std::path::Path;

use anyhow::{Context, Result};

use scenic_core::raster::{Raster, RasterInfo, Window};

/// Class → RGBA, from "not visible" to the most visually impacted class.
const RAMP: [[u8; 4]; 5] = [
    [235, 235, 220, 255], // 0: none
    [255, 237, 160, 255], // 1: low
    [254, 178, 76, 255],  // 2
    [240, 59, 32, 255],   // 3
    [128, 0, 38, 255],    // 4: high
];
const NODATA_RGBA: [u8; 4] = [128, 128, 128, 0];

fn class_color(value: f64, info: &RasterInfo) -> [u8; 4] {
    if info.is_nodata(value) || value.is_nan() {
        NODATA_RGBA
    } else {
        RAMP[(value.max(0.0) as usize).min(RAMP.len() - 1)]
    }
}

pub fn render_quality(input: &Path, output: &Path) -> Result<()> {
    let mut raster = Raster::open(input)?;
    let info = raster.info().clone();
    let mut img = image::RgbaImage::new(info.width as u32, info.height as u32);
    for r in 0..info.height {
        let row = raster.read_window(&Window::new(0, r, info.width, 1))?;
        for (c, &v) in row.iter().enumerate() {
            img.put_pixel(c as u32, r as u32, image::Rgba(class_color(v, &info)));
        }
    }
    img.save(output).with_context(|| format!("failed to save {}", output.display()))?;
    Ok(())
}
