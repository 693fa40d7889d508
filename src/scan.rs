//! Per-scan feature extraction
//!
//! Computes the spatial and temporal QC features of one cleaned BOLD scan
//! against the shared mask bundle, and renders the two per-scan diagnosis
//! panels. Spatial features are masked brain-voxel vectors; temporal
//! features are per-frame traces.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::info;

use crate::error::{DiagnosisError, Result};
use crate::figures;
use crate::masks::MaskBundle;
use crate::nifti_io::{self, TimeSeries};
use crate::regression;

/// Confound-regression outputs consumed by the diagnosis. Produced by the
/// confound-correction stage, never computed here.
#[derive(Debug, Clone)]
pub struct ConfoundData {
    /// Temporal degrees of freedom left after confound regression.
    pub tdof: f64,
    /// Six rigid-body motion parameters per frame.
    pub motion_params: Vec<[f64; 6]>,
    /// Framewise displacement per frame.
    pub framewise_displacement: Vec<f64>,
    /// Variance explained by the confound model at each frame.
    pub frame_r2: Vec<f64>,
}

/// Input files and confound data for one scan.
#[derive(Debug, Clone)]
pub struct ScanFiles {
    /// Cleaned BOLD timeseries.
    pub bold_file: PathBuf,
    /// Voxelwise variance explained by confound regression.
    pub ve_file: PathBuf,
    /// Voxelwise temporal standard deviation before correction.
    pub std_file: PathBuf,
    pub confounds: ConfoundData,
}

/// Outputs of the (external) connectivity analysis for one scan.
#[derive(Debug, Clone)]
pub struct ScanAnalysis {
    /// Subject-specific maps from dual ICA, masked to brain voxels
    /// (components x voxels). Zero rows when dual ICA was not requested.
    pub dual_ica_maps: Array2<f64>,
    /// Seed-based connectivity maps, one file per seed.
    pub seed_map_files: Vec<PathBuf>,
}

impl ScanAnalysis {
    /// Analysis record with no optional outputs.
    pub fn none(n_voxels: usize) -> ScanAnalysis {
        ScanAnalysis {
            dual_ica_maps: Array2::zeros((0, n_voxels)),
            seed_map_files: Vec::new(),
        }
    }
}

/// Masked spatial feature vectors of one scan. All vectors share the
/// bundle's brain voxel count and ordering.
#[derive(Debug, Clone)]
pub struct SpatialFeatures {
    pub temporal_std: Vec<f64>,
    pub ve: Vec<f64>,
    pub gs_corr: Vec<f64>,
    pub dvars_corr: Vec<f64>,
    pub fd_corr: Vec<f64>,
    /// Dual-regression maps of the signal components (components x voxels).
    pub dr_maps: Array2<f64>,
    /// Copy of the analysis dual-ICA maps (may have zero rows).
    pub dual_ica_maps: Array2<f64>,
}

/// Per-frame temporal feature traces of one scan.
#[derive(Debug, Clone)]
pub struct TemporalFeatures {
    /// Voxel-by-time matrix for the grayplot (plot rows x frames).
    pub grayplot: Array2<f64>,
    pub motion_params: Vec<[f64; 6]>,
    pub framewise_displacement: Vec<f64>,
    pub dvars: Vec<f64>,
    pub edge_trace: Vec<f64>,
    pub wm_trace: Vec<f64>,
    pub csf_trace: Vec<f64>,
    pub frame_r2: Vec<f64>,
    /// Mean absolute amplitude over the signal components (NaN when none).
    pub signal_amplitude: Vec<f64>,
    /// Mean absolute amplitude over the confound components (NaN when none).
    pub confound_amplitude: Vec<f64>,
}

/// Result of diagnosing one scan.
#[derive(Debug, Clone)]
pub struct ScanDiagnosis {
    pub spatial: SpatialFeatures,
    pub temporal: TemporalFeatures,
    pub figure_temporal: PathBuf,
    pub figure_spatial: PathBuf,
}

/// Filename stem of a NIfTI path: everything before the first ".nii".
pub fn bold_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.find(".nii") {
        Some(pos) => name[..pos].to_string(),
        None => name,
    }
}

/// Load a masked (time x voxels) matrix from a 4-D BOLD file, validating its
/// grid against the bundle.
fn load_masked_series(bold_file: &Path, bundle: &MaskBundle) -> Result<Array2<f64>> {
    let series: TimeSeries = nifti_io::read_series(bold_file)?;
    if !series.geom.matches(&bundle.brain_mask.geom) {
        return Err(DiagnosisError::Config(format!(
            "BOLD file '{}' does not share the brain-mask grid",
            bold_file.display()
        )));
    }
    let n_voxels = bundle.n_voxels();
    let mut matrix = Array2::<f64>::zeros((series.n_frames, n_voxels));
    for t in 0..series.n_frames {
        let frame = series.frame(t);
        for (v, &i) in bundle.voxel_indices.iter().enumerate() {
            matrix[[t, v]] = frame[i];
        }
    }
    Ok(matrix)
}

/// Load a masked 3-D map file on the bundle grid.
fn load_masked_map(path: &Path, bundle: &MaskBundle, name: &str) -> Result<Vec<f64>> {
    let volume = nifti_io::read_volume(path)?;
    if !volume.geom.matches(&bundle.brain_mask.geom) {
        return Err(DiagnosisError::Config(format!(
            "{} '{}' does not share the brain-mask grid",
            name,
            path.display()
        )));
    }
    Ok(nifti_io::extract_masked(&volume.data, &bundle.voxel_indices))
}

/// Positions (within the masked voxel axis) of brain voxels that are also
/// set in `region`.
fn region_positions(bundle: &MaskBundle, region: &[f64]) -> Vec<usize> {
    bundle
        .voxel_indices
        .iter()
        .enumerate()
        .filter(|(_, &i)| region[i] != 0.0)
        .map(|(v, _)| v)
        .collect()
}

/// Grayplot row ordering: hemisphere-grouped when regional plotting is
/// requested (cortical right, cortical left, then WM, then CSF), plain mask
/// order otherwise.
fn grayplot_rows(bundle: &MaskBundle, regional: bool) -> Result<Vec<usize>> {
    if !regional {
        return Ok((0..bundle.n_voxels()).collect());
    }
    let right = bundle.right_hem_mask.as_ref().ok_or_else(|| {
        DiagnosisError::Config("regional grayplot requested but bundle has no hemisphere masks".into())
    })?;
    let left = bundle.left_hem_mask.as_ref().ok_or_else(|| {
        DiagnosisError::Config("regional grayplot requested but bundle has no hemisphere masks".into())
    })?;

    let mut order = Vec::with_capacity(bundle.n_voxels());
    let mut seen = vec![false; bundle.n_voxels()];
    for region in [&right.data, &left.data, &bundle.wm_mask.data, &bundle.csf_mask.data] {
        for v in region_positions(bundle, region) {
            if !seen[v] {
                seen[v] = true;
                order.push(v);
            }
        }
    }
    // Remaining brain voxels keep mask order at the bottom.
    for v in 0..bundle.n_voxels() {
        if !seen[v] {
            order.push(v);
        }
    }
    Ok(order)
}

fn build_grayplot(series: &Array2<f64>, row_order: &[usize]) -> Array2<f64> {
    let n_frames = series.nrows();
    let mut plot = Array2::<f64>::zeros((row_order.len(), n_frames));
    for (row, &v) in row_order.iter().enumerate() {
        for t in 0..n_frames {
            plot[[row, t]] = series[[t, v]];
        }
    }
    plot
}

fn check_trace_len(name: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(DiagnosisError::shape(name, expected, got));
    }
    Ok(())
}

/// Extract the spatial and temporal QC features of one scan and render its
/// two diagnosis panels into `out_dir`.
///
/// `signal_idx`/`confound_idx` partition the bundle's prior components; an
/// empty group yields NaN amplitude traces. Dual-ICA maps are passed through
/// from `analysis` untouched.
pub fn diagnose_scan(
    files: &ScanFiles,
    analysis: &ScanAnalysis,
    bundle: &MaskBundle,
    signal_idx: &[usize],
    confound_idx: &[usize],
    regional_grayplot: bool,
    out_dir: &Path,
) -> Result<ScanDiagnosis> {
    let series = load_masked_series(&files.bold_file, bundle)?;
    let n_frames = series.nrows();
    let n_voxels = bundle.n_voxels();

    check_trace_len(
        "motion parameters",
        n_frames,
        files.confounds.motion_params.len(),
    )?;
    check_trace_len(
        "framewise displacement",
        n_frames,
        files.confounds.framewise_displacement.len(),
    )?;
    check_trace_len("frame R2", n_frames, files.confounds.frame_r2.len())?;
    for &c in signal_idx.iter().chain(confound_idx.iter()) {
        if c >= bundle.n_priors() {
            return Err(DiagnosisError::Config(format!(
                "prior component index {} out of range ({} priors)",
                c,
                bundle.n_priors()
            )));
        }
    }
    if analysis.dual_ica_maps.nrows() > 0 && analysis.dual_ica_maps.ncols() != n_voxels {
        return Err(DiagnosisError::shape(
            "dual-ICA maps",
            n_voxels,
            analysis.dual_ica_maps.ncols(),
        ));
    }

    // Spatial features
    let temporal_std = load_masked_map(&files.std_file, bundle, "temporal std map")?;
    let ve = load_masked_map(&files.ve_file, bundle, "VE map")?;
    let gs = regression::global_signal(&series);
    let dvars_trace = regression::dvars(&series);
    let gs_corr = regression::voxelwise_corr_map(&series, &gs)?;
    let dvars_corr = regression::voxelwise_corr_map(&series, &dvars_trace)?;
    let fd_corr =
        regression::voxelwise_corr_map(&series, &files.confounds.framewise_displacement)?;

    let fit = regression::dual_regression(&bundle.prior_maps, &series)?;
    let dr_maps = regression::select_rows(&fit.maps, signal_idx);

    let spatial = SpatialFeatures {
        temporal_std,
        ve,
        gs_corr,
        dvars_corr,
        fd_corr,
        dr_maps,
        dual_ica_maps: analysis.dual_ica_maps.clone(),
    };

    // Temporal features
    let edge_positions = region_positions(bundle, &bundle.edge_mask.data);
    let wm_positions = region_positions(bundle, &bundle.wm_mask.data);
    let csf_positions = region_positions(bundle, &bundle.csf_mask.data);

    let temporal = TemporalFeatures {
        grayplot: build_grayplot(&series, &grayplot_rows(bundle, regional_grayplot)?),
        motion_params: files.confounds.motion_params.clone(),
        framewise_displacement: files.confounds.framewise_displacement.clone(),
        dvars: dvars_trace,
        edge_trace: regression::masked_mean_trace(&series, &edge_positions),
        wm_trace: regression::masked_mean_trace(&series, &wm_positions),
        csf_trace: regression::masked_mean_trace(&series, &csf_positions),
        frame_r2: files.confounds.frame_r2.clone(),
        signal_amplitude: regression::component_amplitude(&fit.timecourses, signal_idx),
        confound_amplitude: regression::component_amplitude(&fit.timecourses, confound_idx),
    };

    // Figures
    let stem = bold_stem(&files.bold_file);
    let figure_temporal = out_dir.join(format!("{}_temporal_diagnosis.png", stem));
    let figure_spatial = out_dir.join(format!("{}_spatial_diagnosis.png", stem));
    render_temporal_figure(&figure_temporal, &temporal)?;
    render_spatial_figure(&figure_spatial, &spatial, bundle)?;

    info!(
        scan = %stem,
        frames = n_frames,
        voxels = n_voxels,
        "scan diagnosis complete"
    );

    Ok(ScanDiagnosis {
        spatial,
        temporal,
        figure_temporal,
        figure_spatial,
    })
}

/// Temporal panel rows, top to bottom: grayplot, six motion parameters, FD,
/// DVARS, edge/WM/CSF traces, frame R2, signal and confound amplitudes.
fn render_temporal_figure(path: &Path, temporal: &TemporalFeatures) -> Result<()> {
    let n_frames = temporal.grayplot.ncols();
    let mut motion_traces: Vec<Vec<f64>> = vec![Vec::with_capacity(n_frames); 6];
    for frame in &temporal.motion_params {
        for (p, &value) in frame.iter().enumerate() {
            motion_traces[p].push(value);
        }
    }

    let mut traces: Vec<(&[f64], [u8; 3])> = Vec::new();
    for trace in &motion_traces {
        traces.push((trace, [0, 160, 255]));
    }
    traces.push((&temporal.framewise_displacement, [255, 80, 0]));
    traces.push((&temporal.dvars, [255, 160, 0]));
    traces.push((&temporal.edge_trace, [120, 255, 120]));
    traces.push((&temporal.wm_trace, [200, 200, 200]));
    traces.push((&temporal.csf_trace, [120, 120, 255]));
    traces.push((&temporal.frame_r2, [255, 255, 255]));
    traces.push((&temporal.signal_amplitude, [0, 255, 0]));
    traces.push((&temporal.confound_amplitude, [255, 0, 0]));

    figures::temporal_panel(path, &temporal.grayplot, &traces)
}

/// Spatial panel rows, top to bottom: template, temporal std, VE, global
/// signal / DVARS / FD correlation maps, then one row per dual-regression
/// map and per dual-ICA map.
fn render_spatial_figure(
    path: &Path,
    spatial: &SpatialFeatures,
    bundle: &MaskBundle,
) -> Result<()> {
    let n_full = bundle.brain_mask.geom.n_voxels();
    let indices = &bundle.voxel_indices;
    let background = crate::stats::otsu_scaling(&bundle.template);

    let mut maps = vec![
        figures::unmask(&spatial.temporal_std, indices, n_full),
        figures::unmask(&spatial.ve, indices, n_full),
        figures::unmask(&spatial.gs_corr, indices, n_full),
        figures::unmask(&spatial.dvars_corr, indices, n_full),
        figures::unmask(&spatial.fd_corr, indices, n_full),
    ];
    for row in spatial.dr_maps.rows() {
        maps.push(figures::unmask(&row.to_vec(), indices, n_full));
    }
    for row in spatial.dual_ica_maps.rows() {
        maps.push(figures::unmask(&row.to_vec(), indices, n_full));
    }

    figures::map_mosaic_panel(path, &background, &bundle.brain_mask.geom, &maps)
}
