//! Out-of-core nearest-rank percentiles and quantile classification.
//!
//! The eligible population (finite, non-zero, non-no-data samples) is spilled
//! tile by tile into sorted runs on disk. A single k-way merge over the runs
//! walks the population in ascending order and picks the value at each target
//! rank `ceil(q·N)`, so at most one tile and one value per run are held in
//! memory at a time.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ordered_float::OrderedFloat;

use crate::error::{ConfigError, RasterError, Result};
use crate::progress::Progress;
use crate::raster::{DataType, Raster, RasterInfo};
use crate::tiles::{raster_calculator, Block, TileStream};

/// No-data value of classified (byte) rasters.
pub const BYTE_NODATA: f64 = 255.0;

/// Quantiles used for the visual-quality classes.
pub const DEFAULT_QUANTILES: [f64; 4] = [0.0, 0.25, 0.5, 0.75];

// ── Sorted runs ───────────────────────────────────────────────────────────────

/// One tile's eligible samples, sorted ascending and spilled to disk.
#[derive(Debug)]
pub struct SortedRun {
    path: PathBuf,
    len: usize,
}

impl SortedRun {
    /// Sort `values` in place and write them to `path` as little-endian f64.
    pub fn write(path: impl Into<PathBuf>, values: &mut [f64]) -> io::Result<Self> {
        let path = path.into();
        values.sort_unstable_by(f64::total_cmp);
        let mut w = BufWriter::new(File::create(&path)?);
        for v in values.iter() {
            w.write_all(&v.to_le_bytes())?;
        }
        w.flush()?;
        Ok(Self { path, len: values.len() })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> io::Result<RunCursor> {
        Ok(RunCursor { reader: BufReader::new(File::open(&self.path)?) })
    }
}

/// Sequential reader over a [`SortedRun`].
#[derive(Debug)]
pub struct RunCursor {
    reader: BufReader<File>,
}

impl Iterator for RunCursor {
    type Item = io::Result<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut raw = [0u8; 8];
        match self.reader.read_exact(&mut raw) {
            Ok(()) => Some(Ok(f64::from_le_bytes(raw))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

// ── K-way merge ───────────────────────────────────────────────────────────────

/// Ascending merge of already-sorted sources, keyed on each source's head.
/// Finite, single pass, not restartable.
pub struct KWayMerge<I> {
    sources: Vec<I>,
    heap: BinaryHeap<Reverse<(OrderedFloat<f64>, usize)>>,
    failed: bool,
}

impl<I, E> KWayMerge<I>
where
    I: Iterator<Item = std::result::Result<f64, E>>,
{
    /// Prime the heap with the head of every source.
    pub fn new(mut sources: Vec<I>) -> std::result::Result<Self, E> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, src) in sources.iter_mut().enumerate() {
            if let Some(v) = src.next() {
                heap.push(Reverse((OrderedFloat(v?), idx)));
            }
        }
        Ok(Self { sources, heap, failed: false })
    }
}

impl<I, E> Iterator for KWayMerge<I>
where
    I: Iterator<Item = std::result::Result<f64, E>>,
{
    type Item = std::result::Result<f64, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Reverse((OrderedFloat(value), idx)) = self.heap.pop()?;
        match self.sources[idx].next() {
            Some(Ok(v)) => self.heap.push(Reverse((OrderedFloat(v), idx))),
            Some(Err(e)) => {
                self.failed = true;
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok(value))
    }
}

// ── Nearest rank ──────────────────────────────────────────────────────────────

/// Zero-based target ranks `ceil(q·n)` for each quantile.
pub fn rank_ordinals(quantiles: &[f64], n: usize) -> Vec<usize> {
    quantiles.iter().map(|q| (q * n as f64).ceil() as usize).collect()
}

/// Walk an ascending sequence once and record the value found at each rank.
///
/// `ranks` must be ascending. Each ordinal records at most one breakpoint, so
/// repeated ranks collapse into one; ranks at or past the end of the sequence
/// yield nothing. Stops reading as soon as the last rank is found.
pub fn breakpoints_from_sorted<I, E>(sorted: I, ranks: &[usize]) -> std::result::Result<Vec<f64>, E>
where
    I: IntoIterator<Item = std::result::Result<f64, E>>,
{
    let mut out = Vec::with_capacity(ranks.len());
    let mut pending = ranks.iter().copied().peekable();
    if pending.peek().is_none() {
        return Ok(out);
    }
    for (ordinal, value) in sorted.into_iter().enumerate() {
        let value = value?;
        if pending.next_if_eq(&ordinal).is_some() {
            out.push(value);
            while pending.next_if_eq(&ordinal).is_some() {}
        }
        if pending.peek().is_none() {
            break;
        }
    }
    Ok(out)
}

/// Reference nearest-rank breakpoints over an in-memory population.
pub fn nearest_rank_in_memory(values: &[f64], quantiles: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let mut ranks = rank_ordinals(quantiles, sorted.len());
    ranks.dedup();
    ranks.into_iter().filter_map(|r| sorted.get(r).copied()).collect()
}

fn eligible(info: &RasterInfo, v: f64) -> bool {
    v != 0.0 && !v.is_nan() && !info.is_nodata(v)
}

fn check_quantiles(quantiles: &[f64]) -> std::result::Result<(), ConfigError> {
    // Bucket indices must stay clear of the byte no-data value.
    let max = BYTE_NODATA as usize - 1;
    if quantiles.len() > max {
        return Err(ConfigError::TooManyQuantiles { max, got: quantiles.len() });
    }
    let in_range = quantiles.iter().all(|q| (0.0..=1.0).contains(q));
    let ascending = quantiles.windows(2).all(|w| w[0] <= w[1]);
    if !in_range || !ascending {
        return Err(ConfigError::BadQuantiles(quantiles.to_vec()));
    }
    Ok(())
}

// ── Classification ────────────────────────────────────────────────────────────

/// Nearest-rank breakpoints of the eligible population of `source`.
///
/// Sorted runs live in a `visual_quality*` scratch directory under
/// `working_dir`, removed on every exit path.
pub fn compute_breakpoints(source: &Path, working_dir: &Path, quantiles: &[f64]) -> Result<Vec<f64>> {
    check_quantiles(quantiles)?;
    std::fs::create_dir_all(working_dir).map_err(RasterError::io(working_dir))?;
    let scratch = tempfile::Builder::new()
        .prefix("visual_quality")
        .tempdir_in(working_dir)
        .map_err(RasterError::io(working_dir))?;

    let result = spill_and_merge(source, scratch.path(), quantiles);

    let scratch_path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        tracing::error!("could not remove {}: {e}", scratch_path.display());
    }
    result
}

fn spill_and_merge(source: &Path, scratch: &Path, quantiles: &[f64]) -> Result<Vec<f64>> {
    let stream = TileStream::open(&[source])?;
    let info = stream.info().clone();
    let mut progress = Progress::new(format!("sorting {}", source.display()), info.pixel_count());

    let mut runs = Vec::new();
    let mut n = 0usize;
    for tile in stream {
        let tile = tile?;
        let mut values: Vec<f64> = tile.blocks[0].data.iter().copied().filter(|&v| eligible(&info, v)).collect();
        progress.advance(tile.window.len());
        if values.is_empty() {
            continue;
        }
        let path = scratch.join(format!("run_{}.bin", runs.len()));
        let run = SortedRun::write(&path, &mut values).map_err(RasterError::io(&path))?;
        n += run.len();
        runs.push(run);
    }
    tracing::info!("{} eligible pixels in {} sorted runs", n, runs.len());

    let cursors = runs
        .iter()
        .map(|r| r.open().map_err(RasterError::io(r.path())))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let ranks = rank_ordinals(quantiles, n);
    let merge = KWayMerge::new(cursors).map_err(RasterError::io(scratch))?;
    let breakpoints = breakpoints_from_sorted(merge, &ranks).map_err(RasterError::io(scratch))?;
    Ok(breakpoints)
}

/// Bucket of one sample against ascending `breakpoints`.
///
/// No-data (or NaN) stays [`BYTE_NODATA`], exact zero is bucket 0, anything
/// else is the number of breakpoints at or below the value.
#[inline]
pub fn classify_value(value: f64, info: &RasterInfo, breakpoints: &[f64]) -> f64 {
    if info.is_nodata(value) || value.is_nan() {
        BYTE_NODATA
    } else if value == 0.0 {
        0.0
    } else {
        breakpoints.partition_point(|&b| b <= value) as f64
    }
}

/// Classify `source` into visual-quality classes with [`DEFAULT_QUANTILES`].
/// Returns the breakpoints used.
pub fn calculate_visual_quality(source: &Path, working_dir: &Path, target: &Path) -> Result<Vec<f64>> {
    calculate_visual_quality_with(source, working_dir, target, &DEFAULT_QUANTILES)
}

pub fn calculate_visual_quality_with(
    source: &Path,
    working_dir: &Path,
    target: &Path,
    quantiles: &[f64],
) -> Result<Vec<f64>> {
    let breakpoints = compute_breakpoints(source, working_dir, quantiles)?;
    tracing::info!("Visual quality breakpoints: {:?}", breakpoints);

    let info = Raster::open(source)?.info().clone();
    let mut progress = Progress::new(format!("classifying {}", source.display()), info.pixel_count());
    raster_calculator(&[source], target, DataType::Byte, BYTE_NODATA, &mut progress, |window, blocks| {
        let mut out = Block::for_window(window, BYTE_NODATA);
        for (cell, &v) in out.data.iter_mut().zip(&blocks[0].data) {
            *cell = classify_value(v, &info, &breakpoints);
        }
        out
    })?;
    Ok(breakpoints)
}
