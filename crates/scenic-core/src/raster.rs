//! Minimal on-disk raster: a JSON header followed by row-major little-endian
//! samples. Windows are read and written in place, so no caller ever needs
//! the whole grid in memory.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RasterError;

const MAGIC: &[u8; 4] = b"SCNR";
/// Nominal block edge used when a raster is created without an explicit block.
pub const DEFAULT_BLOCK: usize = 256;

// ── Sample types ──────────────────────────────────────────────────────────────

/// Storage type of a raster's samples. In memory every sample is an `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Byte,
    Float32,
    Float64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Byte => 1,
            DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    /// `value` as it reads back after a round trip through this storage type.
    pub fn narrow(self, value: f64) -> f64 {
        match self {
            DataType::Byte => f64::from(value as u8),
            DataType::Float32 => f64::from(value as f32),
            DataType::Float64 => value,
        }
    }

    fn encode(self, values: &[f64], out: &mut Vec<u8>) {
        match self {
            // `as` saturates, which is the narrowing we want for byte rasters.
            DataType::Byte => out.extend(values.iter().map(|&v| v as u8)),
            DataType::Float32 => {
                for &v in values {
                    out.extend_from_slice(&(v as f32).to_le_bytes());
                }
            }
            DataType::Float64 => {
                for &v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    fn decode(self, bytes: &[u8], out: &mut Vec<f64>) {
        match self {
            DataType::Byte => out.extend(bytes.iter().map(|&b| f64::from(b))),
            DataType::Float32 => out.extend(bytes.chunks_exact(4).map(|c| {
                f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            })),
            DataType::Float64 => out.extend(bytes.chunks_exact(8).map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                f64::from_le_bytes(raw)
            })),
        }
    }
}

// ── Georeferencing ────────────────────────────────────────────────────────────

/// Affine transform in GDAL order:
/// `(origin_x, pixel_w, rot_x, origin_y, rot_y, pixel_h)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform with square pixels; `origin` is the top-left corner.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_size: f64) -> Self {
        Self([origin_x, pixel_size, 0.0, origin_y, 0.0, -pixel_size])
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    pub fn pixel_width(&self) -> f64 {
        self.0[1]
    }

    pub fn pixel_height(&self) -> f64 {
        self.0[5]
    }

    pub fn mean_pixel_size(&self) -> f64 {
        (self.0[1].abs() + self.0[5].abs()) / 2.0
    }

    /// Map coordinates of the image-space point `(col, row)`.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let g = &self.0;
        (g[0] + col * g[1] + row * g[2], g[3] + col * g[4] + row * g[5])
    }

    /// Fractional image coordinates of a map point. Rotation terms are ignored.
    pub fn image_coords(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.0[0]) / self.0[1], (y - self.0[3]) / self.0[5])
    }

    /// Integer pixel holding a map point, truncating toward zero.
    pub fn pixel_of(&self, x: f64, y: f64) -> (i64, i64) {
        let (fx, fy) = self.image_coords(x, y);
        (fx.trunc() as i64, fy.trunc() as i64)
    }

    /// Same transform with its origin moved to pixel `(col, row)`.
    pub fn shifted(&self, col: usize, row: usize) -> Self {
        let (x, y) = self.apply(col as f64, row as f64);
        let mut g = self.0;
        g[0] = x;
        g[3] = y;
        Self(g)
    }
}

/// Axis-aligned map extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Inclusive on every edge.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.min_x <= x && x <= self.max_x && self.min_y <= y && y <= self.max_y
    }

    /// Overlapping part of two extents; `None` when they only touch or miss.
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let out = Extent {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        (out.min_x < out.max_x && out.min_y < out.max_y).then_some(out)
    }
}

// ── Windows ───────────────────────────────────────────────────────────────────

/// Rectangular region of a raster's storage, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub xoff: usize,
    pub yoff: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(xoff: usize, yoff: usize, width: usize, height: usize) -> Self {
        Self { xoff, yoff, width, height }
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Raster metadata ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    pub dtype: DataType,
    /// Storage block `(width, height)` used by tile streams.
    pub block: (usize, usize),
}

impl RasterInfo {
    pub fn new(
        width: usize,
        height: usize,
        transform: GeoTransform,
        dtype: DataType,
        nodata: Option<f64>,
    ) -> Self {
        Self {
            width,
            height,
            transform,
            nodata,
            dtype,
            block: (DEFAULT_BLOCK.min(width).max(1), DEFAULT_BLOCK.min(height).max(1)),
        }
    }

    pub fn with_block(mut self, width: usize, height: usize) -> Self {
        self.block = (width.max(1), height.max(1));
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn is_nodata(&self, value: f64) -> bool {
        match self.nodata {
            Some(nd) => value == nd || (nd.is_nan() && value.is_nan()),
            None => false,
        }
    }

    /// Extent covered by the four corners of the grid.
    pub fn bounding_box(&self) -> Extent {
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [
            self.transform.apply(0.0, 0.0),
            self.transform.apply(w, 0.0),
            self.transform.apply(0.0, h),
            self.transform.apply(w, h),
        ];
        let mut ext = Extent::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            ext.min_x = ext.min_x.min(x);
            ext.min_y = ext.min_y.min(y);
            ext.max_x = ext.max_x.max(x);
            ext.max_y = ext.max_y.max(y);
        }
        ext
    }

    /// Same storage dimensions and transform.
    pub fn aligned_with(&self, other: &RasterInfo) -> bool {
        self.width == other.width && self.height == other.height && self.transform == other.transform
    }

    /// Smallest pixel window covering `extent`, clamped to the grid.
    /// Assumes a transform without rotation terms.
    pub fn window_covering(&self, extent: &Extent) -> Option<Window> {
        let (ax, ay) = self.transform.image_coords(extent.min_x, extent.max_y);
        let (bx, by) = self.transform.image_coords(extent.max_x, extent.min_y);
        let clamp = |v: f64, max: usize| (v.max(0.0) as usize).min(max);
        let x0 = clamp(ax.min(bx).floor(), self.width);
        let x1 = clamp(ax.max(bx).ceil(), self.width);
        let y0 = clamp(ay.min(by).floor(), self.height);
        let y1 = clamp(ay.max(by).ceil(), self.height);
        (x1 > x0 && y1 > y0).then(|| Window::new(x0, y0, x1 - x0, y1 - y0))
    }

    fn check(&self, window: &Window) -> Result<(), RasterError> {
        if window.xoff + window.width > self.width || window.yoff + window.height > self.height {
            return Err(RasterError::WindowOutOfBounds {
                window: *window,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

// ── Raster file ───────────────────────────────────────────────────────────────

/// An open raster file. Reads and writes go straight to disk.
#[derive(Debug)]
pub struct Raster {
    path: PathBuf,
    info: RasterInfo,
    file: File,
    data_offset: u64,
}

impl Raster {
    /// Create (or overwrite) a raster with every sample set to `fill`.
    ///
    /// The header's no-data is stored as it reads back from the sample
    /// type, so a narrowed no-data sample still compares equal to it.
    pub fn create(path: impl AsRef<Path>, info: RasterInfo, fill: f64) -> Result<Self, RasterError> {
        let path = path.as_ref();
        let nodata = info.nodata.map(|nd| info.dtype.narrow(nd));
        let info = RasterInfo { nodata, ..info };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(RasterError::io(path))?;

        let header = serde_json::to_vec(&info).map_err(|e| RasterError::BadHeader {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let data_offset = (MAGIC.len() + 4 + header.len()) as u64;

        let mut row = Vec::with_capacity(info.width * info.dtype.size());
        info.dtype.encode(&vec![fill; info.width], &mut row);

        let mut writer = BufWriter::new(&file);
        let write = |w: &mut BufWriter<&File>| -> std::io::Result<()> {
            w.write_all(MAGIC)?;
            w.write_all(&(header.len() as u32).to_le_bytes())?;
            w.write_all(&header)?;
            for _ in 0..info.height {
                w.write_all(&row)?;
            }
            w.flush()
        };
        write(&mut writer).map_err(RasterError::io(path))?;
        drop(writer);

        Ok(Self { path: path.to_path_buf(), info, file, data_offset })
    }

    /// New raster sharing `base`'s size, transform and block layout.
    /// Samples start at `fill`, or at `nodata` when no fill is given.
    pub fn create_from_base(
        base: impl AsRef<Path>,
        target: impl AsRef<Path>,
        dtype: DataType,
        nodata: f64,
        fill: Option<f64>,
    ) -> Result<Self, RasterError> {
        let base_info = Raster::open(base)?.info;
        let info = RasterInfo { dtype, nodata: Some(nodata), ..base_info };
        Raster::create(target, info, fill.unwrap_or(nodata))
    }

    /// Write a complete raster from a row-major array.
    pub fn from_vec(path: impl AsRef<Path>, info: RasterInfo, data: &[f64]) -> Result<Self, RasterError> {
        let full = Window::new(0, 0, info.width, info.height);
        let mut raster = Raster::create(path, info, 0.0)?;
        raster.write_window(&full, data)?;
        Ok(raster)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, RasterError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(RasterError::io(path))?;
        Self::from_file(path, file)
    }

    /// Open for reading and in-place window writes.
    pub fn open_update(path: impl AsRef<Path>) -> Result<Self, RasterError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(RasterError::io(path))?;
        Self::from_file(path, file)
    }

    fn from_file(path: &Path, mut file: File) -> Result<Self, RasterError> {
        let bad = |reason: &str| RasterError::BadHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix).map_err(|_| bad("file too short"))?;
        if &prefix[..4] != MAGIC {
            return Err(bad("missing SCNR magic"));
        }
        let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        let mut header = vec![0u8; len];
        file.read_exact(&mut header).map_err(|_| bad("truncated header"))?;
        let info: RasterInfo =
            serde_json::from_slice(&header).map_err(|e| bad(&e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            info,
            file,
            data_offset: (8 + len) as u64,
        })
    }

    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, col: usize, row: usize) -> u64 {
        self.data_offset + ((row * self.info.width + col) * self.info.dtype.size()) as u64
    }

    pub fn read_window(&mut self, window: &Window) -> Result<Vec<f64>, RasterError> {
        self.info.check(window)?;
        let mut out = Vec::with_capacity(window.len());
        let mut buf = vec![0u8; window.width * self.info.dtype.size()];
        for r in 0..window.height {
            let offset = self.offset(window.xoff, window.yoff + r);
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.read_exact(&mut buf))
                .map_err(RasterError::io(&self.path))?;
            self.info.dtype.decode(&buf, &mut out);
        }
        Ok(out)
    }

    pub fn write_window(&mut self, window: &Window, data: &[f64]) -> Result<(), RasterError> {
        self.info.check(window)?;
        if data.len() != window.len() {
            return Err(RasterError::LengthMismatch { expected: window.len(), got: data.len() });
        }
        let mut buf = Vec::with_capacity(window.width * self.info.dtype.size());
        for (r, row) in data.chunks_exact(window.width.max(1)).enumerate() {
            buf.clear();
            self.info.dtype.encode(row, &mut buf);
            let offset = self.offset(window.xoff, window.yoff + r);
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.write_all(&buf))
                .map_err(RasterError::io(&self.path))?;
        }
        Ok(())
    }

    pub fn read_pixel(&mut self, col: usize, row: usize) -> Result<f64, RasterError> {
        Ok(self.read_window(&Window::new(col, row, 1, 1))?[0])
    }

    /// Whole grid in memory. Meant for small rasters and tests.
    pub fn read_all(&mut self) -> Result<Vec<f64>, RasterError> {
        let full = Window::new(0, 0, self.info.width, self.info.height);
        self.read_window(&full)
    }
}
