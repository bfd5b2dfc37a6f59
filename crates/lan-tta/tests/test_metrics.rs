//! Integration tests for [`lan_tta::metrics`].
//!
//! All inputs are analytic images; no random values are used.

use approx::assert_abs_diff_eq;
use lan_tta::metrics::{
    psnr, ssim, tensor_to_array3, Metric, MetricLog, SampleLog, StepMetrics, PSNR_IDENTICAL,
};
use ndarray::Array3;
use tch::{Device, Kind, Tensor};
use tempfile::tempdir;

fn ramp(h: usize, w: usize) -> Array3<f32> {
    Array3::from_shape_fn((3, h, w), |(c, i, j)| ((i + j + c) as f32 / (h + w + 3) as f32))
}

fn sample_log(idx: usize, steps: usize, base: f64) -> SampleLog {
    let mut log = SampleLog::new(idx);
    for step in 0..steps {
        log.push(StepMetrics {
            step,
            psnr: base + step as f64,
            ssim: 0.5 + 0.01 * step as f64,
            loss: if step + 1 < steps { Some(0.1) } else { None },
        });
    }
    log
}

// ---------------------------------------------------------------------------
// PSNR / SSIM
// ---------------------------------------------------------------------------

#[test]
fn psnr_never_nan_and_non_negative() {
    let a = ramp(12, 12);
    let b = a.mapv(|v| 1.0 - v);
    let value = psnr(a.view(), b.view());
    assert!(value.is_finite());
    assert!(value >= 0.0);
    assert_eq!(psnr(a.view(), a.view()), PSNR_IDENTICAL);
}

#[test]
fn psnr_decreases_as_error_grows() {
    let gt = ramp(12, 12);
    let small = gt.mapv(|v| (v + 0.01).min(1.0));
    let large = gt.mapv(|v| (v + 0.1).min(1.0));
    assert!(psnr(small.view(), gt.view()) > psnr(large.view(), gt.view()));
}

#[test]
fn ssim_within_bounds_for_inverted_image() {
    let a = ramp(16, 16);
    let b = a.mapv(|v| 1.0 - v);
    let value = ssim(a.view(), b.view());
    assert!((-1.0..=1.0).contains(&value));
    assert!(value < 0.5);
}

#[test]
fn ssim_is_symmetric() {
    let a = ramp(16, 20);
    let b = a.mapv(|v| (v * 0.8 + 0.1).clamp(0.0, 1.0));
    assert_abs_diff_eq!(ssim(a.view(), b.view()), ssim(b.view(), a.view()), epsilon = 1e-12);
}

#[test]
fn tensor_bridge_takes_first_batch_element() {
    let t = Tensor::arange(2 * 3 * 2 * 2i64, (Kind::Float, Device::Cpu)).reshape([2, 3, 2, 2]);
    let a = tensor_to_array3(&t).unwrap();
    assert_eq!(a.shape(), &[3, 2, 2]);
    assert_abs_diff_eq!(a[[2, 1, 1]], 11.0);
}

// ---------------------------------------------------------------------------
// MetricLog
// ---------------------------------------------------------------------------

#[test]
fn step_means_average_across_samples() {
    let mut log = MetricLog::new();
    log.push(sample_log(0, 3, 20.0));
    log.push(sample_log(1, 3, 30.0));
    let means = log.step_means(Metric::Psnr).unwrap();
    assert_eq!(means, vec![25.0, 26.0, 27.0]);
    assert_eq!(log.psnr_trend().unwrap(), "25.00->27.00");
    assert_eq!(log.ssim_trend().unwrap(), "0.500->0.520");
}

#[test]
fn summary_table_has_one_line_per_step() {
    let mut log = MetricLog::new();
    log.push(sample_log(0, 21, 28.0));
    let table = log.summary_table().unwrap();
    assert_eq!(table.lines().count(), 22);
    assert!(table.lines().next().unwrap().contains("loop"));
}

#[test]
fn csv_contains_header_and_one_row_per_record() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("out").join("result.csv");
    let mut log = MetricLog::new();
    log.push(sample_log(0, 3, 20.0));
    log.push(sample_log(5, 3, 21.0));
    log.write_csv(&path).unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(headers, vec!["idx", "loop", "psnr", "ssim"]);

    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 6);
    assert_eq!(&rows[3][0], "5");
    assert_eq!(&rows[3][1], "0");
    assert_eq!(rows[5][2].parse::<f64>().unwrap(), 23.0);
}

#[test]
fn empty_log_writes_header_only() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("empty.csv");
    MetricLog::new().write_csv(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.trim_end(), "idx,loop,psnr,ssim");
}
