//! Per-scan fitting kernels
//!
//! Dual regression against group priors, whole-brain summary traces (global
//! signal, DVARS, masked means) and voxelwise correlation maps against those
//! traces. All operate on masked (time x voxels) matrices.

use ndarray::{Array2, Axis};

use crate::error::{DiagnosisError, Result};
use crate::stats;

/// Output of the two-stage dual-regression fit.
#[derive(Debug, Clone)]
pub struct DualRegressionFit {
    /// Per-component timecourses (time x components), unit variance.
    pub timecourses: Array2<f64>,
    /// Per-component spatial maps (components x voxels), in amplitude units
    /// of the data because of the timecourse normalization.
    pub maps: Array2<f64>,
}

/// Two-stage dual regression of `priors` (components x voxels) against a
/// timeseries (time x voxels).
///
/// Stage 1 fits the priors to every frame to recover component timecourses;
/// stage 2 fits the variance-normalized timecourses back to every voxel to
/// recover subject-specific spatial maps.
pub fn dual_regression(priors: &Array2<f64>, series: &Array2<f64>) -> Result<DualRegressionFit> {
    let n_comp = priors.nrows();
    let n_voxels = priors.ncols();
    if series.ncols() != n_voxels {
        return Err(DiagnosisError::shape(
            "dual regression priors vs series",
            n_voxels,
            series.ncols(),
        ));
    }

    // Stage 1: series (T x V) ~ W (T x C) . priors (C x V)
    // W^T solves (P P^T) W^T = P Y^T
    let design = priors.t().to_owned(); // V x C
    let timecourses_t = stats::lstsq(&design, &series.t().to_owned())
        .ok_or_else(|| DiagnosisError::Config("degenerate prior maps in dual regression".into()))?;
    let mut timecourses = timecourses_t.t().to_owned(); // T x C

    // Normalize each timecourse to unit variance so stage-2 maps carry the
    // data's amplitude units.
    for c in 0..n_comp {
        let column: Vec<f64> = timecourses.index_axis(Axis(1), c).to_vec();
        let sd = stats::std(&column);
        if sd > 0.0 {
            for t in 0..timecourses.nrows() {
                timecourses[[t, c]] /= sd;
            }
        }
    }

    // Stage 2: Y (T x V) ~ W (T x C) . S (C x V)
    let maps = stats::lstsq(&timecourses, series)
        .ok_or_else(|| DiagnosisError::Config("degenerate timecourses in dual regression".into()))?;

    Ok(DualRegressionFit { timecourses, maps })
}

/// Mean over masked voxels at each frame.
pub fn global_signal(series: &Array2<f64>) -> Vec<f64> {
    series
        .axis_iter(Axis(0))
        .map(|frame| frame.mean().unwrap_or(f64::NAN))
        .collect()
}

/// Root-mean-square frame-to-frame signal change. The first frame is 0 by
/// convention.
pub fn dvars(series: &Array2<f64>) -> Vec<f64> {
    let n_frames = series.nrows();
    let n_voxels = series.ncols();
    let mut out = Vec::with_capacity(n_frames);
    out.push(0.0);
    for t in 1..n_frames {
        let mut sum_sq = 0.0;
        for v in 0..n_voxels {
            let diff = series[[t, v]] - series[[t - 1, v]];
            sum_sq += diff * diff;
        }
        out.push((sum_sq / n_voxels as f64).sqrt());
    }
    out
}

/// Mean trace over a voxel subset, given positions in the masked voxel axis.
pub fn masked_mean_trace(series: &Array2<f64>, positions: &[usize]) -> Vec<f64> {
    let n_frames = series.nrows();
    let mut out = Vec::with_capacity(n_frames);
    for t in 0..n_frames {
        if positions.is_empty() {
            out.push(f64::NAN);
        } else {
            let sum: f64 = positions.iter().map(|&v| series[[t, v]]).sum();
            out.push(sum / positions.len() as f64);
        }
    }
    out
}

/// Correlation of every voxel timecourse with a global trace.
pub fn voxelwise_corr_map(series: &Array2<f64>, trace: &[f64]) -> Result<Vec<f64>> {
    if trace.len() != series.nrows() {
        return Err(DiagnosisError::shape(
            "voxelwise correlation trace",
            series.nrows(),
            trace.len(),
        ));
    }
    let n_voxels = series.ncols();
    let mut out = Vec::with_capacity(n_voxels);
    for v in 0..n_voxels {
        let column: Vec<f64> = series.index_axis(Axis(1), v).to_vec();
        out.push(stats::pearson(&column, trace));
    }
    Ok(out)
}

/// Per-frame mean absolute amplitude over the selected components.
///
/// An empty component selection yields NaN at every frame rather than an
/// error, so optional signal/confound groupings degrade gracefully.
pub fn component_amplitude(timecourses: &Array2<f64>, idx: &[usize]) -> Vec<f64> {
    let n_frames = timecourses.nrows();
    if idx.is_empty() {
        return vec![f64::NAN; n_frames];
    }
    let mut out = Vec::with_capacity(n_frames);
    for t in 0..n_frames {
        let sum: f64 = idx.iter().map(|&c| timecourses[[t, c]].abs()).sum();
        out.push(sum / idx.len() as f64);
    }
    out
}

/// Select rows of a (components x voxels) matrix by index.
pub fn select_rows(maps: &Array2<f64>, idx: &[usize]) -> Array2<f64> {
    let n_voxels = maps.ncols();
    let mut out = Array2::<f64>::zeros((idx.len(), n_voxels));
    for (row, &c) in idx.iter().enumerate() {
        out.row_mut(row).assign(&maps.row(c));
    }
    out
}
