//! Image quality metrics and the per-step metric log of an experiment.
//!
//! This module provides:
//!
//! - **PSNR** in dB for images in `[0, 1]`. Identical images yield the finite
//!   sentinel [`PSNR_IDENTICAL`] instead of `+inf`.
//! - **SSIM** with an 11×11 Gaussian window (`sigma = 1.5`, `k1 = 0.01`,
//!   `k2 = 0.03`, data range 1), averaged over the valid region and over
//!   channels.
//! - [`compute`], the `(psnr, ssim)` pair for batch element 0 of two tensors.
//! - [`MetricLog`], the cross-sample aggregate: per-step means, the
//!   `"first->last"` trend strings shown during a run, the per-step summary
//!   table, and the persisted `idx,loop,psnr,ssim` CSV.

use std::path::Path;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::Serialize;
use tch::{Device, Kind, Tensor};

use crate::error::{TtaError, TtaResult};

/// PSNR reported for a prediction identical to its reference, in dB.
pub const PSNR_IDENTICAL: f64 = 100.0;

/// Header of the persisted result table.
pub const CSV_HEADER: [&str; 4] = ["idx", "loop", "psnr", "ssim"];

// ---------------------------------------------------------------------------
// SSIM configuration
// ---------------------------------------------------------------------------

/// Parameters of the SSIM index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsimConfig {
    /// Side of the Gaussian window. Shrunk to the largest odd size that fits
    /// when the image is smaller. Default: **11**.
    pub window_size: usize,
    /// Standard deviation of the Gaussian window. Default: **1.5**.
    pub sigma: f64,
    /// Luminance stabiliser. Default: **0.01**.
    pub k1: f64,
    /// Contrast stabiliser. Default: **0.03**.
    pub k2: f64,
    /// Dynamic range of pixel values. Default: **1.0**.
    pub data_range: f64,
}

impl Default for SsimConfig {
    fn default() -> Self {
        SsimConfig { window_size: 11, sigma: 1.5, k1: 0.01, k2: 0.03, data_range: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// PSNR / SSIM on arrays
// ---------------------------------------------------------------------------

/// Peak signal-to-noise ratio of `pred` against `gt`, both `[C, H, W]` in
/// `[0, 1]`.
///
/// Never NaN: identical (or empty) images return [`PSNR_IDENTICAL`].
pub fn psnr(pred: ArrayView3<f32>, gt: ArrayView3<f32>) -> f64 {
    let n = pred.len();
    if n == 0 {
        return PSNR_IDENTICAL;
    }
    let sse: f64 = pred
        .iter()
        .zip(gt.iter())
        .map(|(&p, &g)| {
            let d = p as f64 - g as f64;
            d * d
        })
        .sum();
    let mse = sse / n as f64;
    if mse <= 0.0 {
        return PSNR_IDENTICAL;
    }
    (10.0 * (1.0 / mse).log10()).min(PSNR_IDENTICAL)
}

/// SSIM of `pred` against `gt` with the default [`SsimConfig`].
pub fn ssim(pred: ArrayView3<f32>, gt: ArrayView3<f32>) -> f64 {
    ssim_with(pred, gt, &SsimConfig::default())
}

/// SSIM with explicit parameters. The result lies in `[-1, 1]`.
pub fn ssim_with(pred: ArrayView3<f32>, gt: ArrayView3<f32>, cfg: &SsimConfig) -> f64 {
    let (c, h, w) = pred.dim();
    let fit = cfg.window_size.min(h).min(w);
    if c == 0 || fit == 0 {
        return 1.0;
    }
    let window = if fit % 2 == 0 { fit - 1 } else { fit };
    let kernel = gaussian_kernel(window, cfg.sigma);

    let c1 = (cfg.k1 * cfg.data_range).powi(2);
    let c2 = (cfg.k2 * cfg.data_range).powi(2);

    let mut total = 0.0;
    for ch in 0..c {
        let x = pred.index_axis(Axis(0), ch).mapv(f64::from);
        let y = gt.index_axis(Axis(0), ch).mapv(f64::from);

        let mu_x = filter_valid(x.view(), &kernel);
        let mu_y = filter_valid(y.view(), &kernel);
        let xx = filter_valid((&x * &x).view(), &kernel);
        let yy = filter_valid((&y * &y).view(), &kernel);
        let xy = filter_valid((&x * &y).view(), &kernel);

        let mut acc = 0.0;
        for ((((&mx, &my), &exx), &eyy), &exy) in
            mu_x.iter().zip(mu_y.iter()).zip(xx.iter()).zip(yy.iter()).zip(xy.iter())
        {
            let var_x = (exx - mx * mx).max(0.0);
            let var_y = (eyy - my * my).max(0.0);
            let cov = exy - mx * my;
            let num = (2.0 * mx * my + c1) * (2.0 * cov + c2);
            let den = (mx * mx + my * my + c1) * (var_x + var_y + c2);
            acc += num / den;
        }
        total += acc / mu_x.len() as f64;
    }
    (total / c as f64).clamp(-1.0, 1.0)
}

/// Normalised 1-D Gaussian of `size` taps.
fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let center = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - center;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

/// Separable "valid" filtering: output is `(H - K + 1, W - K + 1)`.
fn filter_valid(plane: ArrayView2<f64>, kernel: &[f64]) -> Array2<f64> {
    let k = kernel.len();
    let (h, w) = plane.dim();
    let (oh, ow) = (h + 1 - k, w + 1 - k);

    let rows: Array2<f64> = Array2::from_shape_fn((h, ow), |(i, j)| {
        kernel.iter().enumerate().map(|(t, g)| plane[[i, j + t]] * g).sum::<f64>()
    });
    Array2::from_shape_fn((oh, ow), |(i, j)| {
        kernel.iter().enumerate().map(|(t, g)| rows[[i + t, j]] * g).sum()
    })
}

// ---------------------------------------------------------------------------
// Tensor bridge
// ---------------------------------------------------------------------------

/// Copy a `[1, C, H, W]` (batch element 0 is used) or `[C, H, W]` tensor into
/// a host `f32` array.
pub fn tensor_to_array3(t: &Tensor) -> TtaResult<Array3<f32>> {
    let image = match t.dim() {
        4 => t.get(0),
        3 => t.shallow_clone(),
        _ => return Err(TtaError::shape_mismatch(vec![1, -1, -1, -1], t.size())),
    };
    let size = image.size();
    let (c, h, w) = (size[0] as usize, size[1] as usize, size[2] as usize);
    let flat = image
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .flatten(0, -1);
    let data = Vec::<f32>::try_from(&flat)?;
    Array3::from_shape_vec((c, h, w), data)
        .map_err(|_| TtaError::shape_mismatch(vec![c as i64, h as i64, w as i64], size))
}

/// `(psnr, ssim)` of `pred` against `gt` on batch element 0.
///
/// # Errors
///
/// [`TtaError::ShapeMismatch`] when the two images differ in shape.
pub fn compute(pred: &Tensor, gt: &Tensor) -> TtaResult<(f64, f64)> {
    let p = tensor_to_array3(pred)?;
    let g = tensor_to_array3(gt)?;
    if p.dim() != g.dim() {
        let dims = |a: &Array3<f32>| a.shape().iter().map(|&d| d as i64).collect::<Vec<_>>();
        return Err(TtaError::shape_mismatch(dims(&g), dims(&p)));
    }
    Ok((psnr(p.view(), g.view()), ssim(p.view(), g.view())))
}

// ---------------------------------------------------------------------------
// Per-sample records
// ---------------------------------------------------------------------------

/// Metrics of one inner-loop step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    /// Loop index, `0..=inner_loop`.
    pub step: usize,
    /// PSNR in dB.
    pub psnr: f64,
    /// SSIM index.
    pub ssim: f64,
    /// Self-supervised loss of the step; `None` for the final evaluation.
    pub loss: Option<f64>,
}

/// All step records of one sample, in step order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleLog {
    /// Position of the sample in the dataset.
    pub idx: usize,
    /// One record per step.
    pub steps: Vec<StepMetrics>,
}

impl SampleLog {
    pub fn new(idx: usize) -> Self {
        SampleLog { idx, steps: Vec::new() }
    }

    pub fn push(&mut self, record: StepMetrics) {
        self.steps.push(record);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Values of `metric` across steps.
    pub fn trajectory(&self, metric: Metric) -> Vec<f64> {
        self.steps.iter().map(|s| metric.of(s)).collect()
    }
}

/// Selector for one of the tracked metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Psnr,
    Ssim,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Psnr => "psnr",
            Metric::Ssim => "ssim",
        }
    }

    /// Decimals used when displaying this metric.
    pub fn precision(&self) -> usize {
        match self {
            Metric::Psnr => 2,
            Metric::Ssim => 3,
        }
    }

    fn of(&self, record: &StepMetrics) -> f64 {
        match self {
            Metric::Psnr => record.psnr,
            Metric::Ssim => record.ssim,
        }
    }
}

// ---------------------------------------------------------------------------
// MetricLog
// ---------------------------------------------------------------------------

/// One row of the persisted table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResultRow {
    pub idx: usize,
    #[serde(rename = "loop")]
    pub step: usize,
    pub psnr: f64,
    pub ssim: f64,
}

/// Cross-sample aggregate of [`SampleLog`]s.
///
/// Summary accessors return `None` while the log is empty so callers can
/// report the condition instead of printing NaNs.
#[derive(Debug, Clone, Default)]
pub struct MetricLog {
    samples: Vec<SampleLog>,
}

impl MetricLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the log of a finished sample.
    pub fn push(&mut self, sample: SampleLog) {
        self.samples.push(sample);
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[SampleLog] {
        &self.samples
    }

    /// Mean of `metric` at every step, taken over the samples that reached
    /// that step.
    pub fn step_means(&self, metric: Metric) -> Option<Vec<f64>> {
        let steps = self.samples.iter().map(SampleLog::len).max()?;
        if steps == 0 {
            return None;
        }
        let mut sums = vec![0.0; steps];
        let mut counts = vec![0usize; steps];
        for sample in &self.samples {
            for (i, record) in sample.steps.iter().enumerate() {
                sums[i] += metric.of(record);
                counts[i] += 1;
            }
        }
        Some(sums.iter().zip(&counts).map(|(s, &n)| s / n as f64).collect())
    }

    /// `"first->last"` of the per-step means, e.g. `"28.41->29.07"`.
    pub fn trend(&self, metric: Metric) -> Option<String> {
        let means = self.step_means(metric)?;
        let (first, last) = (means.first()?, means.last()?);
        let p = metric.precision();
        Some(format!("{first:.p$}->{last:.p$}"))
    }

    pub fn psnr_trend(&self) -> Option<String> {
        self.trend(Metric::Psnr)
    }

    pub fn ssim_trend(&self) -> Option<String> {
        self.trend(Metric::Ssim)
    }

    /// Per-step mean table (one line per loop index).
    pub fn summary_table(&self) -> Option<String> {
        let psnr = self.step_means(Metric::Psnr)?;
        let ssim = self.step_means(Metric::Ssim)?;
        let mut out = format!("{:>5} {:>9} {:>7}\n", "loop", "psnr", "ssim");
        for (step, (p, s)) in psnr.iter().zip(&ssim).enumerate() {
            out.push_str(&format!("{step:>5} {p:>9.4} {s:>7.4}\n"));
        }
        Some(out)
    }

    /// Flat `(idx, loop, psnr, ssim)` rows, samples in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = ResultRow> + '_ {
        self.samples.iter().flat_map(|sample| {
            sample.steps.iter().map(move |r| ResultRow {
                idx: sample.idx,
                step: r.step,
                psnr: r.psnr,
                ssim: r.ssim,
            })
        })
    }

    /// Write the table to `path`, creating parent directories. The header
    /// is written even when the log is empty.
    pub fn write_csv(&self, path: &Path) -> TtaResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
        writer.write_record(CSV_HEADER)?;
        for row in self.rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn gradient_image(c: usize, h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((c, h, w), |(k, i, j)| {
            ((i * w + j + k) as f32 / (h * w + c) as f32).clamp(0.0, 1.0)
        })
    }

    fn sample(idx: usize, values: &[(f64, f64)]) -> SampleLog {
        let mut log = SampleLog::new(idx);
        for (step, &(psnr, ssim)) in values.iter().enumerate() {
            log.push(StepMetrics { step, psnr, ssim, loss: None });
        }
        log
    }

    #[test]
    fn psnr_of_identical_images_is_sentinel() {
        let img = gradient_image(3, 8, 8);
        assert_eq!(psnr(img.view(), img.view()), PSNR_IDENTICAL);
    }

    #[test]
    fn psnr_known_value() {
        let a = Array3::<f32>::zeros((1, 4, 4));
        let b = Array3::<f32>::from_elem((1, 4, 4), 0.1);
        // mse = 0.01 -> 20 dB
        assert_abs_diff_eq!(psnr(a.view(), b.view()), 20.0, epsilon = 1e-4);
    }

    #[test]
    fn psnr_is_non_negative_in_unit_range() {
        let a = Array3::<f32>::zeros((3, 5, 5));
        let b = Array3::<f32>::ones((3, 5, 5));
        assert_abs_diff_eq!(psnr(a.view(), b.view()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn ssim_of_identical_images_is_one() {
        let img = gradient_image(3, 16, 16);
        assert_abs_diff_eq!(ssim(img.view(), img.view()), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn ssim_drops_with_noise_and_stays_bounded() {
        let gt = gradient_image(1, 16, 16);
        let noisy = Array3::from_shape_fn((1, 16, 16), |(_, i, j)| {
            let n = if (i + j) % 2 == 0 { 0.2 } else { -0.2 };
            (gt[[0, i, j]] + n).clamp(0.0, 1.0)
        });
        let v = ssim(noisy.view(), gt.view());
        assert!(v < 0.9, "noise should reduce SSIM, got {v}");
        assert!((-1.0..=1.0).contains(&v));
    }

    #[test]
    fn ssim_handles_images_smaller_than_window() {
        let img = gradient_image(3, 4, 6);
        let v = ssim(img.view(), img.view());
        assert_abs_diff_eq!(v, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn gaussian_kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(11, 1.5);
        assert_abs_diff_eq!(k.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k[0], k[10], epsilon = 1e-15);
        assert!(k[5] > k[4]);
    }

    #[test]
    fn compute_uses_first_batch_element() {
        let pred = Tensor::full([1, 3, 8, 8], 0.5, (Kind::Float, Device::Cpu));
        let gt = pred.copy();
        let (p, s) = compute(&pred, &gt).unwrap();
        assert_eq!(p, PSNR_IDENTICAL);
        assert_abs_diff_eq!(s, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn compute_rejects_shape_mismatch() {
        let a = Tensor::zeros([1, 3, 8, 8], (Kind::Float, Device::Cpu));
        let b = Tensor::zeros([1, 3, 8, 6], (Kind::Float, Device::Cpu));
        assert!(matches!(compute(&a, &b), Err(TtaError::ShapeMismatch { .. })));
    }

    #[test]
    fn empty_log_has_no_statistics() {
        let log = MetricLog::new();
        assert!(log.is_empty());
        assert!(log.step_means(Metric::Psnr).is_none());
        assert!(log.psnr_trend().is_none());
        assert!(log.summary_table().is_none());
    }

    #[test]
    fn trend_strings_use_metric_precision() {
        let mut log = MetricLog::new();
        log.push(sample(0, &[(30.0, 0.80), (31.0, 0.82)]));
        log.push(sample(1, &[(32.0, 0.90), (33.5, 0.93)]));
        assert_eq!(log.psnr_trend().as_deref(), Some("31.00->32.25"));
        assert_eq!(log.ssim_trend().as_deref(), Some("0.850->0.875"));
    }

    #[test]
    fn rows_follow_sample_and_step_order() {
        let mut log = MetricLog::new();
        log.push(sample(4, &[(1.0, 0.1), (2.0, 0.2)]));
        log.push(sample(7, &[(3.0, 0.3), (4.0, 0.4)]));
        let keys: Vec<(usize, usize)> = log.rows().map(|r| (r.idx, r.step)).collect();
        assert_eq!(keys, vec![(4, 0), (4, 1), (7, 0), (7, 1)]);
    }
}
