//! Numeric kernels behind the image-quality criteria.
//!
//! Everything here works on raw `ndarray` views and returns a
//! [`CriterionError`] on degenerate input (too small, constant, no threshold
//! crossing). The evaluator absorbs those errors at the tile boundary; they
//! never reach callers of the public scoring API.

use ndarray::{s, Array1, Array2, ArrayView2};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use super::CriterionError;

/// Fourier-ring-correlation cutoff used in electron microscopy.
const FRC_THRESHOLD: f64 = 1.0 / 7.0;

/// Gaussian sigma (in pixels) matching a physical detail length.
///
/// A feature of size `detail` spans `detail / pixel_size` pixels; the filter
/// sigma is that span over 2*pi, so the gaussian passband rolls off at the
/// corresponding spatial frequency.
pub fn detail_sigma(detail: f64, pixel_size: f64) -> f64 {
    (detail / pixel_size) / (2.0 * std::f64::consts::PI)
}

/// Separable gaussian blur with edge replication.
///
/// Kernel is truncated at 6 sigma. A sigma below a fraction of a pixel
/// returns the input unchanged.
pub fn gaussian_blur(img: &ArrayView2<'_, f32>, sigma: f64) -> Array2<f32> {
    if sigma < 0.05 {
        return img.to_owned();
    }
    let radius = (sigma * 6.0).ceil() as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i as f64).powi(2) / (2.0 * sigma * sigma)).exp() as f32)
        .collect();
    let norm: f32 = kernel.iter().sum();
    let kernel: Vec<f32> = kernel.iter().map(|k| k / norm).collect();

    let (rows, cols) = (img.shape()[0], img.shape()[1]);
    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    // horizontal pass
    let mut horizontal = Array2::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let cc = clamp(c as isize + k as isize - radius, cols);
                acc += img[[r, cc]] * weight;
            }
            horizontal[[r, c]] = acc;
        }
    }

    // vertical pass
    let mut out = Array2::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let rr = clamp(r as isize + k as isize - radius, rows);
                acc += horizontal[[rr, c]] * weight;
            }
            out[[r, c]] = acc;
        }
    }
    out
}

/// Mean absolute value of the gaussian band-passed image.
pub fn bandpass_energy(
    img: &ArrayView2<'_, f32>,
    pixel_size: f64,
    lowest_detail: f64,
    highest_detail: f64,
) -> Result<f64, CriterionError> {
    let diff = band_difference(img, pixel_size, lowest_detail, highest_detail)?;
    let sum: f64 = diff.iter().map(|v| v.abs() as f64).sum();
    Ok(sum / diff.len() as f64)
}

/// Variance of the gaussian band-passed image.
pub fn bandpass_variance(
    img: &ArrayView2<'_, f32>,
    pixel_size: f64,
    lowest_detail: f64,
    highest_detail: f64,
) -> Result<f64, CriterionError> {
    let diff = band_difference(img, pixel_size, lowest_detail, highest_detail)?;
    let n = diff.len() as f64;
    let mean: f64 = diff.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = diff.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
    Ok(var)
}

fn band_difference(
    img: &ArrayView2<'_, f32>,
    pixel_size: f64,
    lowest_detail: f64,
    highest_detail: f64,
) -> Result<Array2<f32>, CriterionError> {
    if img.is_empty() {
        return Err(CriterionError::EmptyInput);
    }
    let coarse = gaussian_blur(img, detail_sigma(lowest_detail, pixel_size));
    let fine = gaussian_blur(img, detail_sigma(highest_detail, pixel_size));
    Ok(&fine - &coarse)
}

/// Band-limited FFT amplitude sum; dispatches on dimensionality.
///
/// A 1-pixel-high frame is treated as a scan line (1D transform), anything
/// else as a full image (2D transform). The DC component is always excluded.
pub fn fft_band_energy(
    img: &ArrayView2<'_, f32>,
    pixel_size: f64,
    lowest_detail: f64,
    highest_detail: f64,
) -> Result<f64, CriterionError> {
    if img.is_empty() {
        return Err(CriterionError::EmptyInput);
    }
    let low_frequency = 1.0 / lowest_detail;
    let high_frequency = 1.0 / highest_detail;

    if img.shape()[0] == 1 || img.shape()[1] == 1 {
        let line: Array1<f32> = img.iter().cloned().collect();
        fft_band_energy_1d(&line, pixel_size, low_frequency, high_frequency)
    } else {
        fft_band_energy_2d(img, pixel_size, low_frequency, high_frequency)
    }
}

fn fft_band_energy_1d(
    line: &Array1<f32>,
    pixel_size: f64,
    low_frequency: f64,
    high_frequency: f64,
) -> Result<f64, CriterionError> {
    let n = line.len();
    if n < 4 {
        return Err(CriterionError::InputTooSmall { rows: 1, cols: n });
    }
    let mean = line.sum() / n as f32;
    let mut buf: Vec<Complex<f32>> = line.iter().map(|v| Complex::new(v - mean, 0.0)).collect();

    FftPlanner::new().plan_fft_forward(n).process(&mut buf);

    let mut energy = 0.0;
    for (i, value) in buf.iter().enumerate().take(n / 2).skip(1) {
        // positive frequencies only
        let freq = i as f64 / (n as f64 * pixel_size);
        if freq > low_frequency && freq < high_frequency {
            energy += value.norm() as f64;
        }
    }
    Ok(energy)
}

fn fft_band_energy_2d(
    img: &ArrayView2<'_, f32>,
    pixel_size: f64,
    low_frequency: f64,
    high_frequency: f64,
) -> Result<f64, CriterionError> {
    let (rows, cols) = (img.shape()[0], img.shape()[1]);
    if rows < 4 || cols < 4 {
        return Err(CriterionError::InputTooSmall { rows, cols });
    }
    let mean = img.iter().sum::<f32>() / (rows * cols) as f32;
    let centered = img.mapv(|v| v - mean);
    let spectrum = fft2(&centered.view());

    let mut energy = 0.0;
    for ((r, c), value) in spectrum.indexed_iter() {
        let fr = fft_frequency(r, rows, pixel_size);
        let fc = fft_frequency(c, cols, pixel_size);
        let freq = (fr * fr + fc * fc).sqrt();
        if freq >= low_frequency && freq <= high_frequency && freq > 0.0 {
            energy += value.norm() as f64;
        }
    }
    Ok(energy)
}

/// Signed sample frequency for FFT bin `i` of `n` samples spaced `d` apart.
fn fft_frequency(i: usize, n: usize, d: f64) -> f64 {
    let i = i as isize;
    let n = n as isize;
    let k = if i <= (n - 1) / 2 { i } else { i - n };
    (k as f64 / (n as f64 * d)).abs()
}

/// Full 2D FFT: rows, then columns.
fn fft2(img: &ArrayView2<'_, f32>) -> Array2<Complex<f32>> {
    let (rows, cols) = (img.shape()[0], img.shape()[1]);
    let mut planner = FftPlanner::new();

    let row_fft = planner.plan_fft_forward(cols);
    let mut data: Array2<Complex<f32>> = img.mapv(|v| Complex::new(v, 0.0));
    for mut row in data.rows_mut() {
        let mut buf: Vec<Complex<f32>> = row.to_vec();
        row_fft.process(&mut buf);
        for (dst, src) in row.iter_mut().zip(buf) {
            *dst = src;
        }
    }

    let col_fft = planner.plan_fft_forward(rows);
    for c in 0..cols {
        let mut buf: Vec<Complex<f32>> = data.slice(s![.., c]).to_vec();
        col_fft.process(&mut buf);
        for (r, src) in buf.into_iter().enumerate() {
            data[[r, c]] = src;
        }
    }
    data
}

/// Fourier-ring-correlation resolution estimate.
///
/// The image is split along its diagonals into two half-sampled sub-images,
/// Hann-windowed and transformed; correlation is accumulated over frequency
/// rings and the first crossing below the EM threshold (1/7) gives the
/// resolution. The sqrt(2) accounts for the diagonal sub-sampling pitch.
///
/// Note the orientation of this score: it is a *length*, so smaller is
/// sharper. It is meant for resolution measurement of accepted images;
/// autofunctions maximize the bandpass/FFT criteria instead.
pub fn frc_resolution(img: &ArrayView2<'_, f32>, pixel_size: f64) -> Result<f64, CriterionError> {
    let (rows, cols) = (img.shape()[0], img.shape()[1]);
    if rows < 16 || cols < 16 {
        return Err(CriterionError::InputTooSmall { rows, cols });
    }

    let normalized = normalize_unit(img)?;
    let (split_a, split_b) = diagonal_split(&normalized.view());
    let split_a = apply_hann(&normalize_unit(&split_a.view())?.view());
    let split_b = apply_hann(&normalize_unit(&split_b.view())?.view());

    let spectrum_a = fft2(&split_a.view());
    let spectrum_b = fft2(&split_b.view());

    let (sub_rows, sub_cols) = (split_a.shape()[0], split_a.shape()[1]);
    let ring_count = sub_rows.min(sub_cols) / 2;
    if ring_count < 2 {
        return Err(CriterionError::InputTooSmall { rows, cols });
    }

    let mut cross = vec![0.0f64; ring_count];
    let mut power_a = vec![0.0f64; ring_count];
    let mut power_b = vec![0.0f64; ring_count];

    for ((r, c), a) in spectrum_a.indexed_iter() {
        let b = spectrum_b[[r, c]];
        // ring index from the centred frequency radius
        let fr = signed_bin(r, sub_rows) / sub_rows as f64;
        let fc = signed_bin(c, sub_cols) / sub_cols as f64;
        let ring = ((fr * fr + fc * fc).sqrt() * sub_rows.min(sub_cols) as f64).round() as usize;
        if ring >= ring_count {
            continue;
        }
        cross[ring] += (a * b.conj()).re as f64;
        power_a[ring] += a.norm_sqr() as f64;
        power_b[ring] += b.norm_sqr() as f64;
    }

    // skip the DC ring when searching the crossing
    for ring in 1..ring_count {
        let denom = (power_a[ring] * power_b[ring]).sqrt();
        let corr = if denom > 0.0 { cross[ring] / denom } else { 0.0 };
        if corr < FRC_THRESHOLD {
            let freq = ring as f64 / ring_count as f64 / 2.0;
            if freq <= 0.0 {
                return Err(CriterionError::NoThresholdCrossing);
            }
            return Ok((1.0 / freq) * pixel_size * std::f64::consts::SQRT_2);
        }
    }
    Err(CriterionError::NoThresholdCrossing)
}

/// Min-max normalization to [0, 1]; constant input is an error.
fn normalize_unit(img: &ArrayView2<'_, f32>) -> Result<Array2<f32>, CriterionError> {
    let min = img.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = img.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !(max > min) {
        return Err(CriterionError::ConstantInput);
    }
    Ok(img.mapv(|v| (v - min) / (max - min)))
}

/// Splits an image into two diagonally sub-sampled halves.
fn diagonal_split(img: &ArrayView2<'_, f32>) -> (Array2<f32>, Array2<f32>) {
    let a = img.slice(s![0..;2, 0..;2]).to_owned();
    let b = img.slice(s![1..;2, 1..;2]).to_owned();
    // trim to a common shape when dimensions are odd
    let rows = a.shape()[0].min(b.shape()[0]);
    let cols = a.shape()[1].min(b.shape()[1]);
    (
        a.slice(s![..rows, ..cols]).to_owned(),
        b.slice(s![..rows, ..cols]).to_owned(),
    )
}

/// 2D Hann window.
fn apply_hann(img: &ArrayView2<'_, f32>) -> Array2<f32> {
    let (rows, cols) = (img.shape()[0], img.shape()[1]);
    let hann = |i: usize, n: usize| {
        0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1).max(1) as f64).cos()
    };
    let mut out = img.to_owned();
    for ((r, c), v) in out.indexed_iter_mut() {
        *v *= (hann(r, rows) * hann(c, cols)) as f32;
    }
    out
}

fn signed_bin(i: usize, n: usize) -> f64 {
    let i = i as isize;
    let n = n as isize;
    (if i <= (n - 1) / 2 { i } else { i - n }) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Deterministic pseudo-noise image.
    fn noise_image(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let mut h = (r as u64)
                .wrapping_mul(0x9e37_79b9)
                .wrapping_add(c as u64)
                .wrapping_mul(0x85eb_ca6b);
            h ^= h >> 13;
            (h & 0xffff) as f32 / 65536.0
        })
    }

    fn smooth_image(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            ((r as f32 / rows as f32) * std::f32::consts::PI).sin()
                * ((c as f32 / cols as f32) * std::f32::consts::PI).sin()
        })
    }

    #[test]
    fn test_gaussian_blur_reduces_variance() {
        let img = noise_image(32, 32);
        let blurred = gaussian_blur(&img.view(), 2.0);
        let var = |a: &Array2<f32>| {
            let m = a.mean().unwrap();
            a.iter().map(|v| (v - m).powi(2)).sum::<f32>() / a.len() as f32
        };
        assert!(var(&blurred) < var(&img) * 0.5);
    }

    #[test]
    fn test_gaussian_blur_preserves_constant_image() {
        let img = Array2::from_elem((16, 16), 0.7f32);
        let blurred = gaussian_blur(&img.view(), 3.0);
        assert!(blurred.iter().all(|v| (v - 0.7).abs() < 1e-4));
    }

    #[test]
    fn test_bandpass_energy_prefers_textured_image() {
        let textured = noise_image(64, 64);
        let smooth = smooth_image(64, 64);
        let px = 1e-9;
        let sharp = bandpass_energy(&textured.view(), px, 50e-9, 4e-9).unwrap();
        let dull = bandpass_energy(&smooth.view(), px, 50e-9, 4e-9).unwrap();
        assert!(sharp > dull);
    }

    #[test]
    fn test_fft_band_energy_detects_in_band_tone() {
        let n = 64;
        let px = 1e-9;
        // tone with a 8-pixel period = 8 nm detail
        let tone = Array2::from_shape_fn((n, n), |(_, c)| {
            (2.0 * std::f32::consts::PI * c as f32 / 8.0).sin()
        });
        let in_band = fft_band_energy(&tone.view(), px, 16e-9, 4e-9).unwrap();
        let out_of_band = fft_band_energy(&tone.view(), px, 100e-9, 50e-9).unwrap();
        assert!(in_band > out_of_band * 10.0);
    }

    #[test]
    fn test_fft_band_energy_1d_line() {
        let line = Array2::from_shape_fn((1, 128), |(_, c)| {
            (2.0 * std::f32::consts::PI * c as f32 / 8.0).sin()
        });
        let energy = fft_band_energy(&line.view(), 1e-9, 16e-9, 4e-9).unwrap();
        assert!(energy > 0.0);
    }

    #[test]
    fn test_fft_rejects_tiny_input() {
        let img = noise_image(2, 2);
        assert!(matches!(
            fft_band_energy(&img.view(), 1e-9, 16e-9, 4e-9),
            Err(CriterionError::InputTooSmall { .. })
        ));
    }

    #[test]
    fn test_frc_sharp_beats_blurred() {
        // band-limited noise: the split halves share structure up to the
        // blur cutoff, so a lighter blur crosses the threshold later
        let noise = noise_image(128, 128);
        let sharp = gaussian_blur(&noise.view(), 1.0);
        let blurred = gaussian_blur(&noise.view(), 4.0);
        let px = 1e-9;
        let sharp_res = frc_resolution(&sharp.view(), px).unwrap();
        let blurred_res = frc_resolution(&blurred.view(), px).unwrap();
        // resolution is a length: sharper image resolves finer detail
        assert!(sharp_res < blurred_res);
    }

    #[test]
    fn test_frc_constant_image_fails_cleanly() {
        let img = Array2::from_elem((64, 64), 1.0f32);
        assert!(frc_resolution(&img.view(), 1e-9).is_err());
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let img = noise_image(64, 64);
        let a = bandpass_energy(&img.view(), 1e-9, 50e-9, 4e-9).unwrap();
        let b = bandpass_energy(&img.view(), 1e-9, 50e-9, 4e-9).unwrap();
        assert_eq!(a, b);
    }
}
