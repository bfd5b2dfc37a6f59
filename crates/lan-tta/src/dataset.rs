//! Paired image datasets for test-time adaptation.
//!
//! This module defines the [`PairedDataset`] trait plus two concrete
//! implementations:
//!
//! - [`ImageFolderDataset`]: pairs low-quality and ground-truth images that
//!   share a file name across two parallel directories.
//! - [`SyntheticPairDataset`]: analytic clean patterns with deterministic
//!   pseudo-noise; used by `--dry-run` and the test-suite.
//!
//! [`SampleIter`] walks any [`PairedDataset`] sequentially (batch size 1, no
//! shuffle), skipping samples that fail to load.
//!
//! # Directory layout expected by `ImageFolderDataset`
//!
//! ```text
//! polyu/
//!   lq/
//!     Canon5D2_bag_Real.JPG
//!     ...
//!   gt/
//!     Canon5D2_bag_Real.JPG     # same file name as its noisy partner
//!     ...
//! ```
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use lan_tta::dataset::{PairedDataset, SyntheticConfig, SyntheticPairDataset};
//!
//! let ds = SyntheticPairDataset::new(4, SyntheticConfig::default());
//! assert_eq!(ds.len(), 4);
//! let pair = ds.get(0).unwrap();
//! assert_eq!(pair.shape(), (3, 32, 32));
//! ```

use std::path::{Path, PathBuf};

use ndarray::Array3;
use tch::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::error::DatasetError;

/// File extensions recognised as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Smallest height and width a pair may have. Both self-supervised losses
/// halve the spatial size, so a single row or column leaves nothing to
/// denoise.
pub const MIN_SIDE: usize = 2;

// ---------------------------------------------------------------------------
// ImagePair
// ---------------------------------------------------------------------------

/// A noisy observation and its clean reference.
///
/// Both arrays are `[C, H, W]`, row-major, with values in `[0, 1]`. The
/// shapes are identical by construction.
#[derive(Debug, Clone)]
pub struct ImagePair {
    /// Identifier used in logs (file name or `synthetic_{idx}`).
    pub name: String,
    /// Low-quality input.
    pub lq: Array3<f32>,
    /// Ground-truth target.
    pub gt: Array3<f32>,
}

impl ImagePair {
    /// Build a pair, rejecting mismatched shapes and images with a side
    /// shorter than [`MIN_SIDE`].
    pub fn new(name: impl Into<String>, lq: Array3<f32>, gt: Array3<f32>) -> Result<Self, DatasetError> {
        let name = name.into();
        if lq.dim() != gt.dim() {
            return Err(DatasetError::ShapeMismatch {
                name,
                lq: lq.shape().to_vec(),
                gt: gt.shape().to_vec(),
            });
        }
        let (_, height, width) = lq.dim();
        if height < MIN_SIDE || width < MIN_SIDE {
            return Err(DatasetError::TooSmall { name, height, width, min_side: MIN_SIDE });
        }
        Ok(ImagePair { name, lq, gt })
    }

    /// `(C, H, W)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.lq.dim()
    }

    /// Batched `[1, C, H, W]` float tensors `(lq, gt)` on `device`.
    pub fn to_tensors(&self, device: Device) -> (Tensor, Tensor) {
        (array_to_tensor(&self.lq, device), array_to_tensor(&self.gt, device))
    }
}

fn array_to_tensor(a: &Array3<f32>, device: Device) -> Tensor {
    let (c, h, w) = a.dim();
    let data: Vec<f32> = a.iter().copied().collect();
    Tensor::from_slice(&data)
        .reshape([1, c as i64, h as i64, w as i64])
        .to_device(device)
}

// ---------------------------------------------------------------------------
// PairedDataset trait
// ---------------------------------------------------------------------------

/// Common interface for all paired datasets.
pub trait PairedDataset: Send + Sync {
    /// Total number of pairs.
    fn len(&self) -> usize;

    /// Load the pair at position `idx`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::IndexOutOfBounds`] when `idx >= self.len()`, decode or
    /// shape errors otherwise.
    fn get(&self, idx: usize) -> Result<ImagePair, DatasetError>;

    /// Returns `true` when the dataset contains no pairs.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// SampleIter
// ---------------------------------------------------------------------------

/// Sequential iterator yielding `(idx, pair)`.
///
/// Failed loads are skipped with a `warn!` log rather than aborting the run.
pub struct SampleIter<'a> {
    dataset: &'a dyn PairedDataset,
    cursor: usize,
}

impl<'a> SampleIter<'a> {
    pub fn new(dataset: &'a dyn PairedDataset) -> Self {
        SampleIter { dataset, cursor: 0 }
    }
}

impl<'a> Iterator for SampleIter<'a> {
    type Item = (usize, ImagePair);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.dataset.len() {
            let idx = self.cursor;
            self.cursor += 1;
            match self.dataset.get(idx) {
                Ok(pair) => return Some((idx, pair)),
                Err(e) => warn!("Skipping sample {idx}: {e}"),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// ImageFolderDataset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PairEntry {
    name: String,
    lq_path: PathBuf,
    gt_path: PathBuf,
}

/// Pairs read from two parallel directories.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    entries: Vec<PairEntry>,
    lq_dir: PathBuf,
}

impl ImageFolderDataset {
    /// Scan `lq_dir` for images and pair each with the file of the same name
    /// in `gt_dir`.
    ///
    /// Files are visited in name order. A low-quality image without a
    /// ground-truth partner is skipped with a `debug!` log.
    ///
    /// # Errors
    ///
    /// [`DatasetError::DirectoryNotFound`] if either directory is missing,
    /// [`DatasetError::Io`] if listing fails.
    pub fn discover(lq_dir: &Path, gt_dir: &Path) -> Result<Self, DatasetError> {
        for dir in [lq_dir, gt_dir] {
            if !dir.is_dir() {
                return Err(DatasetError::DirectoryNotFound { path: dir.to_path_buf() });
            }
        }

        let mut lq_files: Vec<PathBuf> = std::fs::read_dir(lq_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| is_image(p))
            .collect();
        lq_files.sort();

        let mut entries = Vec::with_capacity(lq_files.len());
        for lq_path in lq_files {
            let Some(file_name) = lq_path.file_name() else { continue };
            let gt_path = gt_dir.join(file_name);
            if !gt_path.is_file() {
                debug!("Skipping {}: no ground truth partner", lq_path.display());
                continue;
            }
            entries.push(PairEntry {
                name: file_name.to_string_lossy().into_owned(),
                lq_path,
                gt_path,
            });
        }

        info!(
            "ImageFolderDataset: {} pairs (lq={}, gt={})",
            entries.len(),
            lq_dir.display(),
            gt_dir.display()
        );

        Ok(ImageFolderDataset { entries, lq_dir: lq_dir.to_path_buf() })
    }

    /// File names of the discovered pairs, in iteration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

impl PairedDataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, idx: usize) -> Result<ImagePair, DatasetError> {
        let entry = self
            .entries
            .get(idx)
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.entries.len() })?;
        let lq = load_rgb(&entry.lq_path)?;
        let gt = load_rgb(&entry.gt_path)?;
        ImagePair::new(entry.name.clone(), lq, gt)
    }

    fn name(&self) -> &str {
        self.lq_dir.to_str().unwrap_or("ImageFolderDataset")
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Decode an image file into `[3, H, W]` RGB values in `[0, 1]`.
pub fn load_rgb(path: &Path) -> Result<Array3<f32>, DatasetError> {
    if !path.is_file() {
        return Err(DatasetError::not_found(path, "image file does not exist"));
    }
    let rgb = image::open(path)
        .map_err(|e| DatasetError::image_decode(path, e))?
        .to_rgb8();
    let (w, h) = rgb.dimensions();
    Ok(Array3::from_shape_fn((3, h as usize, w as usize), |(c, i, j)| {
        rgb.get_pixel(j as u32, i as u32)[c] as f32 / 255.0
    }))
}

// ---------------------------------------------------------------------------
// SyntheticPairDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticPairDataset`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Image channels. Default: **3**.
    pub channels: usize,
    /// Image height. Default: **32**.
    pub height: usize,
    /// Image width. Default: **32**.
    pub width: usize,
    /// Peak amplitude of the additive pseudo-noise. Default: **0.1**.
    pub noise_level: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig { channels: 3, height: 32, width: 32, noise_level: 0.1 }
    }
}

/// Deterministic noisy/clean pairs.
///
/// No random number generator is used: every pair is a function of its
/// index alone.
///
/// ## Clean model
///
/// ```text
/// gt = 0.5 + 0.35 × sin(2π × (i/H × f + j/W × (f + 1) + c × 0.3))    f = 1 + idx mod 3
/// ```
///
/// ## Noise model
///
/// A multiplicative hash of `(idx, c, i, j)` mapped to `[-1, 1]`, scaled by
/// `noise_level`. The noisy image is clipped to `[0, 1]`.
pub struct SyntheticPairDataset {
    num_samples: usize,
    config: SyntheticConfig,
}

impl SyntheticPairDataset {
    pub fn new(num_samples: usize, config: SyntheticConfig) -> Self {
        SyntheticPairDataset { num_samples, config }
    }

    #[inline]
    fn clean_value(&self, idx: usize, c: usize, i: usize, j: usize) -> f32 {
        let f = 1.0 + (idx % 3) as f32;
        let phase = 2.0
            * std::f32::consts::PI
            * (i as f32 / self.config.height as f32 * f
                + j as f32 / self.config.width as f32 * (f + 1.0)
                + c as f32 * 0.3);
        0.5 + 0.35 * phase.sin()
    }

    #[inline]
    fn noise_value(&self, idx: usize, c: usize, i: usize, j: usize) -> f32 {
        let mut h = (idx as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((c as u64) << 40 | (i as u64) << 20 | j as u64);
        h ^= h >> 33;
        h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        h ^= h >> 33;
        let unit = (h % 20_001) as f32 / 10_000.0 - 1.0;
        unit * self.config.noise_level
    }
}

impl PairedDataset for SyntheticPairDataset {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, idx: usize) -> Result<ImagePair, DatasetError> {
        if idx >= self.num_samples {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.num_samples });
        }
        let cfg = &self.config;
        let shape = (cfg.channels, cfg.height, cfg.width);
        let gt = Array3::from_shape_fn(shape, |(c, i, j)| self.clean_value(idx, c, i, j));
        let lq = Array3::from_shape_fn(shape, |(c, i, j)| {
            (gt[[c, i, j]] + self.noise_value(idx, c, i, j)).clamp(0.0, 1.0)
        });
        ImagePair::new(format!("synthetic_{idx}"), lq, gt)
    }

    fn name(&self) -> &str {
        "SyntheticPairDataset"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    // ----- SyntheticPairDataset -------------------------------------------

    #[test]
    fn synthetic_pair_shapes() {
        let ds = SyntheticPairDataset::new(3, SyntheticConfig::default());
        let pair = ds.get(1).unwrap();
        assert_eq!(pair.lq.shape(), &[3, 32, 32]);
        assert_eq!(pair.gt.shape(), &[3, 32, 32]);
        assert_eq!(pair.name, "synthetic_1");
    }

    #[test]
    fn synthetic_is_deterministic() {
        let ds = SyntheticPairDataset::new(2, SyntheticConfig::default());
        let a = ds.get(0).unwrap();
        let b = ds.get(0).unwrap();
        assert_eq!(a.lq, b.lq);
        assert_eq!(a.gt, b.gt);
    }

    #[test]
    fn synthetic_values_in_unit_range_and_noisy() {
        let ds = SyntheticPairDataset::new(1, SyntheticConfig::default());
        let pair = ds.get(0).unwrap();
        assert!(pair.lq.iter().chain(pair.gt.iter()).all(|&v| (0.0..=1.0).contains(&v)));
        let diff: f32 = (&pair.lq - &pair.gt).mapv(f32::abs).sum();
        assert!(diff > 0.0, "noisy image must differ from the clean one");
    }

    #[test]
    fn synthetic_out_of_bounds() {
        let ds = SyntheticPairDataset::new(2, SyntheticConfig::default());
        assert!(matches!(ds.get(2), Err(DatasetError::IndexOutOfBounds { idx: 2, len: 2 })));
    }

    // ----- ImagePair --------------------------------------------------------

    #[test]
    fn pair_rejects_mismatched_shapes() {
        let err = ImagePair::new("x", Array3::zeros((3, 4, 4)), Array3::zeros((3, 4, 5))).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch { .. }));
    }

    #[test]
    fn to_tensors_preserves_layout() {
        let lq = Array3::from_shape_fn((2, 3, 4), |(c, i, j)| (c * 100 + i * 10 + j) as f32);
        let pair = ImagePair::new("p", lq.clone(), lq).unwrap();
        let (t, _) = pair.to_tensors(Device::Cpu);
        assert_eq!(t.size(), vec![1, 2, 3, 4]);
        assert_abs_diff_eq!(t.double_value(&[0, 1, 2, 3]), 123.0, epsilon = 1e-6);
    }

    // ----- ImageFolderDataset ----------------------------------------------

    fn write_png(path: &Path, value: u8) {
        image::RgbImage::from_pixel(6, 4, image::Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn discover_pairs_by_file_name() {
        let tmp = tempdir().unwrap();
        let (lq_dir, gt_dir) = (tmp.path().join("lq"), tmp.path().join("gt"));
        std::fs::create_dir_all(&lq_dir).unwrap();
        std::fs::create_dir_all(&gt_dir).unwrap();
        for name in ["b.png", "a.png", "orphan.png"] {
            write_png(&lq_dir.join(name), 64);
        }
        write_png(&gt_dir.join("a.png"), 255);
        write_png(&gt_dir.join("b.png"), 0);
        std::fs::write(lq_dir.join("notes.txt"), "not an image").unwrap();

        let ds = ImageFolderDataset::discover(&lq_dir, &gt_dir).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.names().collect::<Vec<_>>(), vec!["a.png", "b.png"]);

        let pair = ds.get(0).unwrap();
        assert_eq!(pair.shape(), (3, 4, 6));
        assert_abs_diff_eq!(pair.lq[[0, 0, 0]], 64.0 / 255.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pair.gt[[2, 3, 5]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn discover_missing_directory() {
        let tmp = tempdir().unwrap();
        let err = ImageFolderDataset::discover(&tmp.path().join("nope"), tmp.path()).unwrap_err();
        assert!(matches!(err, DatasetError::DirectoryNotFound { .. }));
    }

    #[test]
    fn sample_iter_skips_undecodable_pairs() {
        let tmp = tempdir().unwrap();
        let (lq_dir, gt_dir) = (tmp.path().join("lq"), tmp.path().join("gt"));
        std::fs::create_dir_all(&lq_dir).unwrap();
        std::fs::create_dir_all(&gt_dir).unwrap();
        std::fs::write(lq_dir.join("broken.png"), b"garbage").unwrap();
        std::fs::write(gt_dir.join("broken.png"), b"garbage").unwrap();
        write_png(&lq_dir.join("good.png"), 10);
        write_png(&gt_dir.join("good.png"), 20);

        let ds = ImageFolderDataset::discover(&lq_dir, &gt_dir).unwrap();
        assert_eq!(ds.len(), 2);
        let yielded: Vec<(usize, String)> =
            SampleIter::new(&ds).map(|(idx, pair)| (idx, pair.name)).collect();
        assert_eq!(yielded, vec![(1, "good.png".to_string())]);
    }

    #[test]
    fn pair_rejects_single_row_images() {
        let err = ImagePair::new("row", Array3::zeros((3, 1, 16)), Array3::zeros((3, 1, 16))).unwrap_err();
        assert!(matches!(err, DatasetError::TooSmall { height: 1, width: 16, .. }));
        assert!(ImagePair::new("ok", Array3::zeros((3, 2, 2)), Array3::zeros((3, 2, 2))).is_ok());
    }

    #[test]
    fn sample_iter_on_empty_dataset() {
        let ds = SyntheticPairDataset::new(0, SyntheticConfig::default());
        assert!(ds.is_empty());
        assert_eq!(SampleIter::new(&ds).count(), 0);
    }
}
