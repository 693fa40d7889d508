//! Dataset-level QC aggregation
//!
//! Collects the per-scan feature records of a cohort, validates them against
//! the shared mask bundle, and produces the group-level QC outputs: the
//! spatial cross-correlation figure and, per prior component and feature
//! family, one statistics row and one rendered figure.
//!
//! Families: dual regression always; dual ICA only when the scans carry
//! dual-ICA maps; seed FC only when seed prior maps are supplied. An absent
//! optional family is skipped, never an error.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Axis};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{DiagnosisError, Result};
use crate::figures;
use crate::masks::MaskBundle;
use crate::nifti_io;
use crate::resample::{self, Interp};
use crate::scan::{ScanAnalysis, ScanFiles, SpatialFeatures};
use crate::stats;

/// Minimum cohort size for any correlation statistic. Inherited from the
/// original pipeline; below this the group statistics are undefined.
pub const MIN_COHORT_SIZE: usize = 3;

/// One scan's contribution to the cohort: its input record, extracted
/// spatial features, and analysis outputs.
#[derive(Debug, Clone)]
pub struct CohortScan {
    pub files: ScanFiles,
    pub spatial: SpatialFeatures,
    pub analysis: ScanAnalysis,
}

/// Single CSV row of QC statistics for one prior component of one family.
#[derive(Debug, Clone, Serialize)]
pub struct QcStats {
    /// Pearson correlation of the cohort-average map with the prior map.
    pub overlap_with_prior: f64,
    /// Mean (over brain voxels) of the cross-scan correlation between the
    /// component maps and the temporal-std maps.
    pub corr_with_std: f64,
    /// Same against the variance-explained maps.
    pub corr_with_ve: f64,
    /// Same against the per-scan temporal degrees of freedom.
    pub corr_with_tdof: f64,
    pub mean_tdof: f64,
    pub n_scans: usize,
}

/// Intermediate per-component QC computation: the stats row plus the maps
/// rendered into the component figure.
struct ComponentQc {
    stats: QcStats,
    average_map: Vec<f64>,
    corr_std_map: Vec<f64>,
    corr_ve_map: Vec<f64>,
    corr_tdof_map: Vec<f64>,
}

fn component_qc(
    fc_maps: &Array2<f64>,
    prior: &[f64],
    std_maps: &Array2<f64>,
    ve_maps: &Array2<f64>,
    tdof: &[f64],
) -> ComponentQc {
    let average: Array1<f64> = fc_maps.mean_axis(Axis(0)).unwrap_or_default();
    let average_map = average.to_vec();

    let corr_std_map = stats::cross_subject_voxelwise_corr(fc_maps, std_maps);
    let corr_ve_map = stats::cross_subject_voxelwise_corr(fc_maps, ve_maps);
    let corr_tdof_map = stats::cross_subject_corr_with_scalar(fc_maps, tdof);

    let stats_row = QcStats {
        overlap_with_prior: stats::pearson(&average_map, prior),
        corr_with_std: stats::nan_mean(&corr_std_map),
        corr_with_ve: stats::nan_mean(&corr_ve_map),
        corr_with_tdof: stats::nan_mean(&corr_tdof_map),
        mean_tdof: stats::mean(tdof),
        n_scans: fc_maps.nrows(),
    };

    ComponentQc {
        stats: stats_row,
        average_map,
        corr_std_map,
        corr_ve_map,
        corr_tdof_map,
    }
}

fn csv_io_error(path: &Path, e: impl std::fmt::Display) -> DiagnosisError {
    DiagnosisError::Io(std::io::Error::other(format!(
        "failed to write '{}': {}",
        path.display(),
        e
    )))
}

fn write_stats_csv(path: &Path, stats_row: &QcStats) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_io_error(path, e))?;
    writer.serialize(stats_row).map_err(|e| csv_io_error(path, e))?;
    writer.flush().map_err(|e| csv_io_error(path, e))?;
    Ok(())
}

fn check_vector(context: String, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(DiagnosisError::ShapeMismatch {
            context,
            expected,
            got,
        });
    }
    Ok(())
}

/// Validate the whole cohort before anything is written: sample size, voxel
/// counts of every spatial vector, consistent component counts, and seed-map
/// counts against the seed priors when any are supplied.
fn validate_cohort(
    scans: &[CohortScan],
    bundle: &MaskBundle,
    seed_prior_files: &[PathBuf],
) -> Result<()> {
    if scans.len() < MIN_COHORT_SIZE {
        return Err(DiagnosisError::InsufficientSample { n: scans.len() });
    }
    let n_voxels = bundle.n_voxels();
    let n_dr = scans[0].spatial.dr_maps.nrows();
    let n_ica = scans[0].spatial.dual_ica_maps.nrows();

    for (s, scan) in scans.iter().enumerate() {
        let sp = &scan.spatial;
        check_vector(format!("scan {} temporal_std", s), n_voxels, sp.temporal_std.len())?;
        check_vector(format!("scan {} VE map", s), n_voxels, sp.ve.len())?;
        check_vector(format!("scan {} GS correlation", s), n_voxels, sp.gs_corr.len())?;
        check_vector(format!("scan {} DVARS correlation", s), n_voxels, sp.dvars_corr.len())?;
        check_vector(format!("scan {} FD correlation", s), n_voxels, sp.fd_corr.len())?;
        check_vector(format!("scan {} DR maps", s), n_voxels, sp.dr_maps.ncols())?;
        check_vector(format!("scan {} DR components", s), n_dr, sp.dr_maps.nrows())?;
        check_vector(
            format!("scan {} dual-ICA components", s),
            n_ica,
            sp.dual_ica_maps.nrows(),
        )?;
        if n_ica > 0 {
            check_vector(
                format!("scan {} dual-ICA maps", s),
                n_voxels,
                sp.dual_ica_maps.ncols(),
            )?;
        }
        // Seed maps without seed priors are simply unused, not an error.
        if !seed_prior_files.is_empty() {
            check_vector(
                format!("scan {} seed maps", s),
                seed_prior_files.len(),
                scan.analysis.seed_map_files.len(),
            )?;
        }
    }
    Ok(())
}

/// Gather one masked vector per scan into a (scans x voxels) stack.
fn stack_vectors<'a, F>(scans: &'a [CohortScan], n_voxels: usize, select: F) -> Array2<f64>
where
    F: Fn(&'a CohortScan) -> &'a [f64],
{
    let mut stack = Array2::<f64>::zeros((scans.len(), n_voxels));
    for (s, scan) in scans.iter().enumerate() {
        stack.row_mut(s).assign(&Array1::from_vec(select(scan).to_vec()));
    }
    stack
}

/// Gather component `c` of a per-scan (components x voxels) matrix into a
/// (scans x voxels) stack.
fn stack_component<'a, F>(scans: &'a [CohortScan], n_voxels: usize, c: usize, select: F) -> Array2<f64>
where
    F: Fn(&'a CohortScan) -> &'a Array2<f64>,
{
    let mut stack = Array2::<f64>::zeros((scans.len(), n_voxels));
    for (s, scan) in scans.iter().enumerate() {
        stack.row_mut(s).assign(&select(scan).row(c));
    }
    stack
}

/// Per-component QC outputs for one feature family: one figure and one CSV
/// per component, named `<family><index>_QC_maps.png` / `_QC_stats.csv`.
#[allow(clippy::too_many_arguments)]
fn family_qc(
    family: &str,
    out_dir: &Path,
    fc_stacks: &[Array2<f64>],
    priors: &[Vec<f64>],
    std_maps: &Array2<f64>,
    ve_maps: &Array2<f64>,
    tdof: &[f64],
    background: &[f64],
    bundle: &MaskBundle,
) -> Result<()> {
    let n_full = bundle.brain_mask.geom.n_voxels();
    let indices = &bundle.voxel_indices;
    for (i, (fc_maps, prior)) in fc_stacks.iter().zip(priors.iter()).enumerate() {
        let qc = component_qc(fc_maps, prior, std_maps, ve_maps, tdof);

        let fig_path = out_dir.join(format!("{}{}_QC_maps.png", family, i));
        let rows = vec![
            figures::unmask(prior, indices, n_full),
            figures::unmask(&qc.average_map, indices, n_full),
            figures::unmask(&qc.corr_std_map, indices, n_full),
            figures::unmask(&qc.corr_ve_map, indices, n_full),
            figures::unmask(&qc.corr_tdof_map, indices, n_full),
        ];
        figures::map_mosaic_panel(&fig_path, background, &bundle.brain_mask.geom, &rows)?;

        let csv_path = out_dir.join(format!("{}{}_QC_stats.csv", family, i));
        write_stats_csv(&csv_path, &qc.stats)?;
        info!(family, component = i, "QC outputs written");
    }
    Ok(())
}

/// The stacked feature families entering the cross-correlation figure, in
/// fixed row order: the five scalar maps, then one entry per dual-regression
/// component, then one per dual-ICA component.
fn crosscorr_features(scans: &[CohortScan], n_voxels: usize) -> Vec<Array2<f64>> {
    let n_dr = scans[0].spatial.dr_maps.nrows();
    let n_ica = scans[0].spatial.dual_ica_maps.nrows();
    let mut features = vec![
        stack_vectors(scans, n_voxels, |s| &s.spatial.temporal_std),
        stack_vectors(scans, n_voxels, |s| &s.spatial.ve),
        stack_vectors(scans, n_voxels, |s| &s.spatial.gs_corr),
        stack_vectors(scans, n_voxels, |s| &s.spatial.dvars_corr),
        stack_vectors(scans, n_voxels, |s| &s.spatial.fd_corr),
    ];
    for c in 0..n_dr {
        features.push(stack_component(scans, n_voxels, c, |s| &s.spatial.dr_maps));
    }
    for c in 0..n_ica {
        features.push(stack_component(scans, n_voxels, c, |s| &s.spatial.dual_ica_maps));
    }
    features
}

/// Load the per-scan seed maps for seed index `i` into a stack, validating
/// each against the bundle grid.
fn stack_seed_maps(scans: &[CohortScan], bundle: &MaskBundle, i: usize) -> Result<Array2<f64>> {
    let n_voxels = bundle.n_voxels();
    let mut stack = Array2::<f64>::zeros((scans.len(), n_voxels));
    for (s, scan) in scans.iter().enumerate() {
        let path = &scan.analysis.seed_map_files[i];
        let volume = nifti_io::read_volume(path)?;
        if !volume.geom.matches(&bundle.brain_mask.geom) {
            return Err(DiagnosisError::Config(format!(
                "seed map '{}' does not share the brain-mask grid",
                path.display()
            )));
        }
        let masked = nifti_io::extract_masked(&volume.data, &bundle.voxel_indices);
        stack.row_mut(s).assign(&Array1::from_vec(masked));
    }
    Ok(stack)
}

/// Run the dataset-level diagnosis over a validated cohort.
///
/// `signal_idx` names the bundle prior components the scans' DR (and
/// dual-ICA) maps were fitted to, in map row order. Outputs land under
/// `<out_dir>/dataset_diagnosis/`; the directory is only created after all
/// validation has passed. Returns the output directory path.
pub fn dataset_diagnosis(
    scans: &[CohortScan],
    bundle: &MaskBundle,
    signal_idx: &[usize],
    seed_prior_files: &[PathBuf],
    out_dir: &Path,
) -> Result<PathBuf> {
    validate_cohort(scans, bundle, seed_prior_files)?;

    let n_voxels = bundle.n_voxels();
    let n_dr = scans[0].spatial.dr_maps.nrows();
    let n_ica = scans[0].spatial.dual_ica_maps.nrows();
    if signal_idx.len() != n_dr {
        return Err(DiagnosisError::shape("signal component indices", n_dr, signal_idx.len()));
    }
    if n_ica > signal_idx.len() {
        return Err(DiagnosisError::shape(
            "dual-ICA components vs signal priors",
            signal_idx.len(),
            n_ica,
        ));
    }
    for &c in signal_idx {
        if c >= bundle.n_priors() {
            return Err(DiagnosisError::Config(format!(
                "prior component index {} out of range ({} priors)",
                c,
                bundle.n_priors()
            )));
        }
    }

    let diagnosis_dir = out_dir.join("dataset_diagnosis");
    std::fs::create_dir_all(&diagnosis_dir)?;

    let background = stats::otsu_scaling(&bundle.template);
    let n_full = bundle.brain_mask.geom.n_voxels();
    let indices = &bundle.voxel_indices;

    // Voxelwise cross-scan correlation between every pair of feature
    // families, one row per pair.
    let features = crosscorr_features(scans, n_voxels);
    let mut pair_maps = Vec::new();
    for a in 0..features.len() {
        for b in a + 1..features.len() {
            let corr = stats::cross_subject_voxelwise_corr(&features[a], &features[b]);
            pair_maps.push(figures::unmask(&corr, indices, n_full));
        }
    }
    let crosscorr_path = diagnosis_dir.join("spatial_crosscorrelations.png");
    figures::map_mosaic_panel(&crosscorr_path, &background, &bundle.brain_mask.geom, &pair_maps)?;

    let std_maps = stack_vectors(scans, n_voxels, |s| &s.spatial.temporal_std);
    let ve_maps = stack_vectors(scans, n_voxels, |s| &s.spatial.ve);
    let tdof: Vec<f64> = scans.iter().map(|s| s.files.confounds.tdof).collect();

    // Dual-regression family, always present.
    let dr_stacks: Vec<Array2<f64>> = (0..n_dr)
        .map(|c| stack_component(scans, n_voxels, c, |s| &s.spatial.dr_maps))
        .collect();
    let dr_priors: Vec<Vec<f64>> = signal_idx
        .iter()
        .map(|&c| bundle.prior_maps.row(c).to_vec())
        .collect();
    family_qc(
        "DR",
        &diagnosis_dir,
        &dr_stacks,
        &dr_priors,
        &std_maps,
        &ve_maps,
        &tdof,
        &background,
        bundle,
    )?;

    // Dual-ICA family, only when the scans carry dual-ICA maps.
    if n_ica > 0 {
        let ica_stacks: Vec<Array2<f64>> = (0..n_ica)
            .map(|c| stack_component(scans, n_voxels, c, |s| &s.spatial.dual_ica_maps))
            .collect();
        family_qc(
            "dual_ICA",
            &diagnosis_dir,
            &ica_stacks,
            &dr_priors[..n_ica],
            &std_maps,
            &ve_maps,
            &tdof,
            &background,
            bundle,
        )?;
    } else {
        warn!("no dual-ICA maps in cohort, skipping dual-ICA QC");
    }

    // Seed-FC family, only when seed priors are supplied.
    if !seed_prior_files.is_empty() {
        let mut seed_priors = Vec::with_capacity(seed_prior_files.len());
        for path in seed_prior_files {
            let prior = nifti_io::read_volume(path)?;
            let resampled =
                resample::resample_to_reference(&prior, &bundle.brain_mask.geom, Interp::Linear)?;
            seed_priors.push(nifti_io::extract_masked(&resampled.data, indices));
        }
        let mut seed_stacks = Vec::with_capacity(seed_prior_files.len());
        for i in 0..seed_prior_files.len() {
            seed_stacks.push(stack_seed_maps(scans, bundle, i)?);
        }
        family_qc(
            "seed_FC",
            &diagnosis_dir,
            &seed_stacks,
            &seed_priors,
            &std_maps,
            &ve_maps,
            &tdof,
            &background,
            bundle,
        )?;
    }

    info!(
        scans = scans.len(),
        priors = n_dr,
        dual_ica = n_ica,
        seeds = seed_prior_files.len(),
        "dataset diagnosis complete"
    );
    Ok(diagnosis_dir)
}
