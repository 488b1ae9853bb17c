//! GeoTIFF interchange. Only north-up single-band images with
//! ModelPixelScale + ModelTiepoint georeferencing are handled.
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use scenic_core::raster::{DataType, GeoTransform, Raster, RasterInfo, Window};

/// Parse GDAL's ASCII no-data tag ("-9999", sometimes NUL-terminated).
fn parse_nodata(raw: &str) -> Option<f64> {
    raw.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok()
}

pub fn import_dem(input: &Path, output: &Path, block: usize) -> Result<RasterInfo> {
    let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).context("not a valid TIFF")?;
    let (width, height) = decoder.dimensions()?;

    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .context("missing ModelPixelScale tag")?;
    let tie = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .context("missing ModelTiepoint tag")?;
    if scale.len() < 2 || tie.len() < 6 {
        bail!("malformed georeferencing tags: scale {scale:?}, tiepoint {tie:?}");
    }
    let nodata = decoder.get_tag_ascii_string(Tag::GdalNodata).ok().and_then(|s| parse_nodata(&s));

    let (values, dtype): (Vec<f64>, DataType) = match decoder.read_image()? {
        DecodingResult::F32(v) => (v.into_iter().map(f64::from).collect(), DataType::Float32),
        DecodingResult::F64(v) => (v, DataType::Float64),
        DecodingResult::I16(v) => (v.into_iter().map(f64::from).collect(), DataType::Float32),
        DecodingResult::U16(v) => (v.into_iter().map(f64::from).collect(), DataType::Float32),
        DecodingResult::U8(v) => (v.into_iter().map(f64::from).collect(), DataType::Byte),
        _ => bail!("unsupported sample type (expected F32, F64, I16, U16 or U8)"),
    };
    let (width, height) = (width as usize, height as usize);
    if values.len() != width * height {
        bail!("expected one band of {}x{} samples, got {}", width, height, values.len());
    }

    // Tiepoint (i, j, k, x, y, z) pins raster pixel (i, j) to map point (x, y).
    let (sx, sy) = (scale[0], scale[1]);
    let transform = GeoTransform([tie[3] - tie[0] * sx, sx, 0.0, tie[4] + tie[1] * sy, 0.0, -sy]);
    let info = RasterInfo::new(width, height, transform, dtype, nodata).with_block(block, block);
    Raster::from_vec(output, info.clone(), &values)?;
    Ok(info)
}

pub fn export(input: &Path, output: &Path) -> Result<()> {
    let mut raster = Raster::open(input)?;
    let info = raster.info().clone();
    let t = info.transform.0;
    if t[2] != 0.0 || t[4] != 0.0 {
        bail!("rotated rasters cannot be written with a pixel scale and tiepoint");
    }

    let file = File::create(output).with_context(|| format!("cannot create {}", output.display()))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(info.width as u32, info.height as u32)?;
    image.encoder().write_tag(Tag::ModelPixelScaleTag, &[t[1], -t[5], 0.0][..])?;
    image.encoder().write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, t[0], t[3], 0.0][..])?;
    if let Some(nd) = info.nodata {
        image.encoder().write_tag(Tag::GdalNodata, nd.to_string().as_str())?;
    }

    // One strip per block row keeps memory at one band of blocks.
    let rows = info.block.1.max(1);
    image.rows_per_strip(rows as u32)?;
    let mut row = 0;
    while row < info.height {
        let n = rows.min(info.height - row);
        let band = raster.read_window(&Window::new(0, row, info.width, n))?;
        let strip: Vec<f32> = band.iter().map(|&v| v as f32).collect();
        image.write_strip(&strip)?;
        row += n;
    }
    image.finish()?;
    Ok(())
}
