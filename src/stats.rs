//! Statistical kernels
//!
//! Means, standard deviations, Pearson correlations (scalar and voxelwise
//! across a cohort), Otsu-based template scaling for figure backgrounds, and
//! the small dense solves used by the regression module.

use ndarray::{Array2, Axis};

use crate::nifti_io::Volume;

/// Arithmetic mean; NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; NaN for an empty slice.
pub fn std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let var = values.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Mean ignoring NaN entries; NaN when nothing is finite.
pub fn nan_mean(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in values {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Pearson correlation coefficient. NaN when either side has zero variance
/// or the inputs are shorter than 2.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return f64::NAN;
    }
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    let mut sum_ab = 0.0;
    let mut sum_a2 = 0.0;
    let mut sum_b2 = 0.0;
    for i in 0..n {
        sum_a += a[i];
        sum_b += b[i];
        sum_ab += a[i] * b[i];
        sum_a2 += a[i] * a[i];
        sum_b2 += b[i] * b[i];
    }
    let nf = n as f64;
    let cov = sum_ab - sum_a * sum_b / nf;
    let var_a = sum_a2 - sum_a * sum_a / nf;
    let var_b = sum_b2 - sum_b * sum_b / nf;
    if var_a <= 0.0 || var_b <= 0.0 {
        return f64::NAN;
    }
    cov / (var_a * var_b).sqrt()
}

/// Per-voxel Pearson across the scan axis of two (scans x voxels) stacks.
pub fn cross_subject_voxelwise_corr(a: &Array2<f64>, b: &Array2<f64>) -> Vec<f64> {
    let n_voxels = a.ncols();
    let mut out = Vec::with_capacity(n_voxels);
    for v in 0..n_voxels {
        let col_a: Vec<f64> = a.index_axis(Axis(1), v).to_vec();
        let col_b: Vec<f64> = b.index_axis(Axis(1), v).to_vec();
        out.push(pearson(&col_a, &col_b));
    }
    out
}

/// Per-voxel Pearson of a (scans x voxels) stack against a per-scan scalar.
pub fn cross_subject_corr_with_scalar(maps: &Array2<f64>, scalar: &[f64]) -> Vec<f64> {
    let n_voxels = maps.ncols();
    let mut out = Vec::with_capacity(n_voxels);
    for v in 0..n_voxels {
        let col: Vec<f64> = maps.index_axis(Axis(1), v).to_vec();
        out.push(pearson(&col, scalar));
    }
    out
}

/// Otsu's method for automatic threshold selection.
///
/// Finds the threshold that maximizes inter-class variance over a histogram
/// of `num_bins` bins spanning the full value range. Follows MATLAB's
/// graythresh conventions: every value (zeros included) enters the
/// histogram, and the returned threshold sits on the lower edge of the
/// optimal bin.
pub fn otsu_threshold(data: &[f64], num_bins: usize) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let min_val = data.iter().fold(f64::MAX, |a, &b| a.min(b));
    let max_val = data.iter().fold(f64::MIN, |a, &b| a.max(b));

    if (max_val - min_val).abs() < 1e-10 {
        return min_val;
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let mut histogram = vec![0usize; num_bins];
    for &v in data {
        let bin = ((v - min_val) / bin_width).floor() as usize;
        histogram[bin.min(num_bins - 1)] += 1;
    }

    let total_pixels = data.len() as f64;
    let mut sum_total = 0.0;
    for (i, &count) in histogram.iter().enumerate() {
        sum_total += i as f64 * count as f64;
    }

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut max_variance = 0.0;
    let mut optimal_threshold_bin = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total_pixels - weight_background;
        if weight_foreground == 0.0 {
            break;
        }
        sum_background += t as f64 * count as f64;

        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_total - sum_background) / weight_foreground;
        let variance =
            weight_background * weight_foreground * (mean_background - mean_foreground).powi(2);
        if variance > max_variance {
            max_variance = variance;
            optimal_threshold_bin = t;
        }
    }

    min_val + optimal_threshold_bin as f64 * bin_width
}

/// Intensity-normalize an anatomical template for figure backgrounds.
///
/// Values below the Otsu threshold (background/skull) map to 0; the rest are
/// scaled linearly into [0, 1] by the foreground maximum.
pub fn otsu_scaling(template: &Volume) -> Vec<f64> {
    let threshold = otsu_threshold(&template.data, 200);
    let foreground_max = template
        .data
        .iter()
        .filter(|&&v| v >= threshold)
        .fold(f64::MIN, |a, &b| a.max(b));
    if foreground_max <= threshold {
        return vec![0.0; template.data.len()];
    }
    template
        .data
        .iter()
        .map(|&v| {
            if v < threshold {
                0.0
            } else {
                ((v - threshold) / (foreground_max - threshold)).clamp(0.0, 1.0)
            }
        })
        .collect()
}

/// Solve A x = B for a small dense square system by Gauss-Jordan elimination
/// with partial pivoting. Returns `None` for a singular system.
pub fn solve(a: &Array2<f64>, b: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.nrows() != n {
        return None;
    }
    let m = b.ncols();
    let mut aug = Array2::<f64>::zeros((n, n + m));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        for j in 0..m {
            aug[[i, n + j]] = b[[i, j]];
        }
    }

    for col in 0..n {
        // Pivot
        let mut pivot = col;
        for row in col + 1..n {
            if aug[[row, col]].abs() > aug[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if aug[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for j in 0..n + m {
                let tmp = aug[[col, j]];
                aug[[col, j]] = aug[[pivot, j]];
                aug[[pivot, j]] = tmp;
            }
        }
        let scale = aug[[col, col]];
        for j in 0..n + m {
            aug[[col, j]] /= scale;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n + m {
                aug[[row, j]] -= factor * aug[[col, j]];
            }
        }
    }

    let mut x = Array2::<f64>::zeros((n, m));
    for i in 0..n {
        for j in 0..m {
            x[[i, j]] = aug[[i, n + j]];
        }
    }
    Some(x)
}

/// Least squares via normal equations: returns the (k x m) coefficient matrix
/// minimizing ||design * coef - targets||.
pub fn lstsq(design: &Array2<f64>, targets: &Array2<f64>) -> Option<Array2<f64>> {
    let gram = design.t().dot(design);
    let rhs = design.t().dot(targets);
    solve(&gram, &rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mean_std() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&values) - 2.5).abs() < 1e-12);
        assert!((std(&values) - 1.118033988749895).abs() < 1e-9);
        assert!(mean(&[]).is_nan());
    }

    #[test]
    fn test_nan_mean_skips_nan() {
        let values = [1.0, f64::NAN, 3.0];
        assert!((nan_mean(&values) - 2.0).abs() < 1e-12);
        assert!(nan_mean(&[f64::NAN, f64::NAN]).is_nan());
    }

    #[test]
    fn test_pearson_perfect() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-12);

        let c = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson(&a, &c) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_degenerate() {
        let a = [1.0, 1.0, 1.0];
        let b = [1.0, 2.0, 3.0];
        assert!(pearson(&a, &b).is_nan());
        assert!(pearson(&[1.0], &[2.0]).is_nan());
    }

    #[test]
    fn test_cross_subject_voxelwise_corr() {
        // Voxel 0: identical ordering across scans -> r = 1.
        // Voxel 1: reversed ordering -> r = -1.
        let a = array![[1.0, 3.0], [2.0, 2.0], [3.0, 1.0]];
        let b = array![[10.0, 10.0], [20.0, 20.0], [30.0, 30.0]];
        let corr = cross_subject_voxelwise_corr(&a, &b);
        assert!((corr[0] - 1.0).abs() < 1e-12);
        assert!((corr[1] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cross_subject_corr_with_scalar() {
        let maps = array![[1.0], [2.0], [3.0]];
        let corr = cross_subject_corr_with_scalar(&maps, &[5.0, 6.0, 7.0]);
        assert!((corr[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_otsu_threshold_bimodal() {
        let mut data = Vec::new();
        for i in 0..100 {
            data.push(0.1 + 0.2 * (i as f64 / 100.0));
        }
        for i in 0..100 {
            data.push(0.7 + 0.2 * (i as f64 / 100.0));
        }
        let threshold = otsu_threshold(&data, 256);
        assert!(
            threshold > 0.2 && threshold < 0.8,
            "threshold {} should separate the clusters",
            threshold
        );
    }

    #[test]
    fn test_otsu_threshold_returns_bin_edge() {
        // min 0, max 10, 10 bins of width 1: the optimal bin is [2, 3), and
        // the returned threshold is its lower edge.
        let data = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 8.0, 8.0, 9.0, 9.0, 10.0, 10.0];
        let threshold = otsu_threshold(&data, 10);
        assert_eq!(threshold, 2.0);
    }

    #[test]
    fn test_otsu_threshold_constant() {
        assert_eq!(otsu_threshold(&[5.0; 100], 256), 5.0);
        assert_eq!(otsu_threshold(&[], 256), 0.0);
    }

    #[test]
    fn test_otsu_scaling_range() {
        let mut template = Volume::filled((4, 4, 4), 0.0);
        for (i, v) in template.data.iter_mut().enumerate() {
            *v = if i < 32 { 10.0 } else { 100.0 + (i % 7) as f64 };
        }
        let scaled = otsu_scaling(&template);
        assert_eq!(scaled.len(), 64);
        assert!(scaled.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // Background voxels map to exactly zero.
        assert!(scaled[..32].iter().all(|&v| v == 0.0));
        assert!(scaled[32..].iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_solve_2x2() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![[5.0], [10.0]];
        let x = solve(&a, &b).unwrap();
        // 2x + y = 5, x + 3y = 10 -> x = 1, y = 3
        assert!((x[[0, 0]] - 1.0).abs() < 1e-9);
        assert!((x[[1, 0]] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_solve_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![[1.0], [2.0]];
        assert!(solve(&a, &b).is_none());
    }

    #[test]
    fn test_lstsq_exact_fit() {
        // y = 2*x0 + 3*x1, overdetermined
        let design = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, 1.0]];
        let targets = array![[2.0], [3.0], [5.0], [7.0]];
        let coef = lstsq(&design, &targets).unwrap();
        assert!((coef[[0, 0]] - 2.0).abs() < 1e-9);
        assert!((coef[[1, 0]] - 3.0).abs() < 1e-9);
    }
}
