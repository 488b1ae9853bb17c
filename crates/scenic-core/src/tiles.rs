//! Tile stream: walks aligned rasters block by block so per-pixel work never
//! holds more than one window of each input in memory.
use std::path::{Path, PathBuf};

use crate::error::RasterError;
use crate::progress::Progress;
use crate::raster::{DataType, Raster, RasterInfo, Window};

/// One window of samples, row-major, promoted to `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
}

impl Block {
    /// Create a block filled with the given value.
    pub fn new(width: usize, height: usize, fill: f64) -> Self {
        Self { data: vec![fill; width * height], width, height }
    }

    pub fn for_window(window: &Window, fill: f64) -> Self {
        Self::new(window.width, window.height, fill)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        self.data[row * self.width + col] = val;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Row-major windows covering a `width`×`height` grid with no gaps or
/// overlaps. The last column and row of windows may be narrower.
pub fn windows(width: usize, height: usize, block: (usize, usize)) -> impl Iterator<Item = Window> {
    let (bw, bh) = (block.0.max(1), block.1.max(1));
    (0..height).step_by(bh).flat_map(move |yoff| {
        (0..width)
            .step_by(bw)
            .map(move |xoff| Window::new(xoff, yoff, bw.min(width - xoff), bh.min(height - yoff)))
    })
}

/// A window and the matching block of every input raster.
#[derive(Debug)]
pub struct Tile {
    pub window: Window,
    pub blocks: Vec<Block>,
}

/// Single-pass iterator over the tiles of one or more aligned rasters,
/// following the first raster's block layout.
#[derive(Debug)]
pub struct TileStream {
    rasters: Vec<Raster>,
    windows: std::vec::IntoIter<Window>,
}

impl TileStream {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, RasterError> {
        let rasters = paths.iter().map(Raster::open).collect::<Result<Vec<_>, _>>()?;
        Self::from_rasters(rasters)
    }

    pub fn from_rasters(rasters: Vec<Raster>) -> Result<Self, RasterError> {
        let primary = rasters.first().ok_or(RasterError::NoInputs)?;
        for other in &rasters[1..] {
            if !other.info().aligned_with(primary.info()) {
                return Err(RasterError::Misaligned {
                    path: other.path().to_path_buf(),
                    base: primary.path().to_path_buf(),
                });
            }
        }
        let info = primary.info();
        let windows: Vec<Window> = windows(info.width, info.height, info.block).collect();
        Ok(Self { rasters, windows: windows.into_iter() })
    }

    /// Metadata of the primary (first) raster.
    pub fn info(&self) -> &RasterInfo {
        self.rasters[0].info()
    }

    /// Tiles not yet yielded.
    pub fn remaining(&self) -> usize {
        self.windows.len()
    }
}

impl Iterator for TileStream {
    type Item = Result<Tile, RasterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let window = self.windows.next()?;
        let mut blocks = Vec::with_capacity(self.rasters.len());
        for raster in &mut self.rasters {
            match raster.read_window(&window) {
                Ok(data) => blocks.push(Block { data, width: window.width, height: window.height }),
                Err(e) => {
                    // Nothing after a failed read is trustworthy.
                    self.windows = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
        Some(Ok(Tile { window, blocks }))
    }
}

/// Evaluate `op` tile by tile over aligned `inputs` and write its result to a
/// new raster at `target` laid out like the first input.
///
/// `op` receives the window and one block per input, and must return a block
/// of the window's shape.
pub fn raster_calculator<P, F>(
    inputs: &[P],
    target: &Path,
    dtype: DataType,
    nodata: f64,
    progress: &mut Progress,
    mut op: F,
) -> Result<(), RasterError>
where
    P: AsRef<Path>,
    F: FnMut(&Window, &[Block]) -> Block,
{
    let stream = TileStream::open(inputs)?;
    let base: PathBuf = inputs[0].as_ref().to_path_buf();
    let mut out = Raster::create_from_base(&base, target, dtype, nodata, None)?;
    for tile in stream {
        let tile = tile?;
        let result = op(&tile.window, &tile.blocks);
        out.write_window(&tile.window, &result.data)?;
        progress.advance(tile.window.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;
    use std::collections::HashSet;

    fn ramp(path: &Path, w: usize, h: usize, block: (usize, usize)) -> RasterInfo {
        let info = RasterInfo::new(w, h, GeoTransform::north_up(0.0, 0.0, 1.0), DataType::Float64, Some(-1.0))
            .with_block(block.0, block.1);
        let data: Vec<f64> = (0..w * h).map(|i| i as f64).collect();
        Raster::from_vec(path, info.clone(), &data).unwrap();
        info
    }

    #[test]
    fn windows_cover_grid_exactly_once() {
        let mut seen = HashSet::new();
        let mut count = 0;
        for w in windows(10, 7, (4, 3)) {
            assert!(w.width <= 4 && w.height <= 3);
            for r in w.yoff..w.yoff + w.height {
                for c in w.xoff..w.xoff + w.width {
                    assert!(seen.insert((r, c)), "pixel ({r}, {c}) visited twice");
                }
            }
            count += 1;
        }
        assert_eq!(seen.len(), 70);
        assert_eq!(count, 9);
    }

    #[test]
    fn last_tiles_are_truncated() {
        let all: Vec<Window> = windows(10, 7, (4, 3)).collect();
        assert_eq!(all.last(), Some(&Window::new(8, 6, 2, 1)));
    }

    #[test]
    fn stream_yields_aligned_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ras");
        let b = dir.path().join("b.ras");
        ramp(&a, 5, 5, (2, 2));
        ramp(&b, 5, 5, (5, 5));

        let stream = TileStream::open(&[&a, &b]).unwrap();
        assert_eq!(stream.remaining(), 9);
        for tile in stream {
            let tile = tile.unwrap();
            assert_eq!(tile.blocks.len(), 2);
            assert_eq!(tile.blocks[0], tile.blocks[1]);
            let w = tile.window;
            assert_eq!(tile.blocks[0].get(0, 0), (w.yoff * 5 + w.xoff) as f64);
        }
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ras");
        let b = dir.path().join("b.ras");
        ramp(&a, 5, 5, (2, 2));
        ramp(&b, 6, 5, (2, 2));
        assert!(matches!(TileStream::open(&[&a, &b]), Err(RasterError::Misaligned { .. })));
        assert!(matches!(TileStream::open::<PathBuf>(&[]), Err(RasterError::NoInputs)));
    }

    #[test]
    fn calculator_writes_every_window() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ras");
        let out = dir.path().join("out.ras");
        ramp(&a, 7, 3, (3, 2));

        let mut progress = Progress::new("double", 21);
        raster_calculator(&[&a], &out, DataType::Float32, -1.0, &mut progress, |_, blocks| {
            let mut b = blocks[0].clone();
            b.data.iter_mut().for_each(|v| *v *= 2.0);
            b
        })
        .unwrap();

        assert_eq!(progress.done(), 21);
        let values = Raster::open(&out).unwrap().read_all().unwrap();
        let expected: Vec<f64> = (0..21).map(|i| 2.0 * i as f64).collect();
        assert_eq!(values, expected);
    }
}
