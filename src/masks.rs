//! Mask bundle builder
//!
//! Assembles the fixed set of reference images every diagnosis stage shares:
//! display template, brain/WM/CSF/edge masks, optional hemisphere label
//! masks, and the group prior maps restricted to brain voxels. The bundle is
//! built once per dataset and read-only afterwards.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::{debug, info};

use crate::error::{DiagnosisError, Result};
use crate::morphology;
use crate::nifti_io::{self, Volume};
use crate::resample::{self, Interp};

/// Atlas file names resolved under the configured atlas directory.
const RIGHT_HEM_MASK: &str = "right_hem_mask.nii.gz";
const LEFT_HEM_MASK: &str = "left_hem_mask.nii.gz";

/// Explicit atlas location. The hemisphere label masks are only needed for
/// regional grayplots, so the directory is optional.
#[derive(Debug, Clone, Default)]
pub struct AtlasConfig {
    pub atlas_dir: Option<PathBuf>,
}

/// Per-scan reference files produced by preprocessing.
///
/// All scans of a dataset are expected to share the same commonspace masks;
/// [`build_mask_bundle`] checks that instead of assuming it.
#[derive(Debug, Clone)]
pub struct ScanMaskFiles {
    pub brain_mask: PathBuf,
    pub wm_mask: PathBuf,
    pub csf_mask: PathBuf,
    pub anat_template: PathBuf,
}

/// Shared reference images on the brain-mask grid. Immutable once built.
#[derive(Debug, Clone)]
pub struct MaskBundle {
    /// Anatomical template resampled onto the brain-mask grid.
    pub template: Volume,
    pub brain_mask: Volume,
    pub wm_mask: Volume,
    pub csf_mask: Volume,
    /// Single-voxel-thick shell of the brain mask.
    pub edge_mask: Volume,
    /// Hemisphere label masks, present only when regional grayplots were
    /// requested at build time.
    pub right_hem_mask: Option<Volume>,
    pub left_hem_mask: Option<Volume>,
    /// Group prior maps restricted to brain voxels (components x voxels).
    pub prior_maps: Array2<f64>,
    /// Flat Fortran-order indices of the brain voxels.
    pub voxel_indices: Vec<usize>,
}

impl MaskBundle {
    /// Number of brain-mask voxels: the length every masked feature vector
    /// of the dataset must have.
    pub fn n_voxels(&self) -> usize {
        self.voxel_indices.len()
    }

    pub fn n_priors(&self) -> usize {
        self.prior_maps.nrows()
    }
}

fn read_mask(path: &Path, name: &str, reference: &Volume) -> Result<Volume> {
    let mask = nifti_io::read_volume(path)?;
    if !mask.geom.matches(&reference.geom) {
        return Err(DiagnosisError::Config(format!(
            "{} '{}' does not share the brain-mask grid",
            name,
            path.display()
        )));
    }
    Ok(mask)
}

/// Verify that every scan's reference files (brain/WM/CSF masks and the
/// anatomical template) agree with the first scan's.
///
/// Identical paths pass immediately; distinct paths are loaded and compared
/// on geometry and content. Any disagreement is a configuration error.
fn check_masks_identical(mask_files: &[ScanMaskFiles]) -> Result<()> {
    let first = &mask_files[0];
    for (scan_idx, files) in mask_files.iter().enumerate().skip(1) {
        let pairs = [
            ("brain mask", &files.brain_mask, &first.brain_mask),
            ("WM mask", &files.wm_mask, &first.wm_mask),
            ("CSF mask", &files.csf_mask, &first.csf_mask),
            ("anatomical template", &files.anat_template, &first.anat_template),
        ];
        for (name, path, first_path) in pairs {
            if path == first_path {
                continue;
            }
            let reference = nifti_io::read_volume(first_path)?;
            let other = nifti_io::read_volume(path)?;
            if !other.geom.matches(&reference.geom) || other.data != reference.data {
                return Err(DiagnosisError::Config(format!(
                    "{} of scan {} ('{}') differs from scan 0 ('{}'); \
                     all scans must share commonspace masks",
                    name,
                    scan_idx,
                    path.display(),
                    first_path.display()
                )));
            }
        }
    }
    Ok(())
}

fn resample_atlas_mask(atlas_dir: &Path, name: &str, brain_mask: &Volume) -> Result<Volume> {
    let path = atlas_dir.join(name);
    if !path.exists() {
        return Err(DiagnosisError::Config(format!(
            "atlas mask '{}' not found; regional grayplots need the hemisphere masks",
            path.display()
        )));
    }
    let atlas_mask = nifti_io::read_volume(&path)?;
    resample::resample_to_reference(&atlas_mask, &brain_mask.geom, Interp::Nearest)
}

/// Build the shared [`MaskBundle`] for a dataset.
///
/// `mask_files` carries one entry per scan (all expected identical, and
/// checked to be), `prior_maps_file` the 4-D group component stack, and
/// `use_region_masks` requests the hemisphere label masks from `atlas`.
pub fn build_mask_bundle(
    mask_files: &[ScanMaskFiles],
    prior_maps_file: &Path,
    use_region_masks: bool,
    atlas: &AtlasConfig,
) -> Result<MaskBundle> {
    let first = mask_files
        .first()
        .ok_or_else(|| DiagnosisError::Config("no scan mask files provided".into()))?;

    let brain_mask = nifti_io::read_volume(&first.brain_mask)?;
    let voxel_indices = nifti_io::mask_indices(&brain_mask);
    if voxel_indices.is_empty() {
        return Err(DiagnosisError::Config(format!(
            "brain mask '{}' is empty",
            first.brain_mask.display()
        )));
    }
    check_masks_identical(mask_files)?;

    let wm_mask = read_mask(&first.wm_mask, "WM mask", &brain_mask)?;
    let csf_mask = read_mask(&first.csf_mask, "CSF mask", &brain_mask)?;

    // Display template on the brain-mask grid (functional resolution).
    let anat = nifti_io::read_volume(&first.anat_template)?;
    let template = resample::resample_to_reference(&anat, &brain_mask.geom, Interp::Spline)?;
    debug!(
        dims = ?template.geom.dims,
        "resampled anatomical template onto the brain-mask grid"
    );

    let (right_hem_mask, left_hem_mask) = if use_region_masks {
        let atlas_dir = atlas.atlas_dir.as_deref().ok_or_else(|| {
            DiagnosisError::Config(
                "regional grayplots requested but no atlas directory configured".into(),
            )
        })?;
        (
            Some(resample_atlas_mask(atlas_dir, RIGHT_HEM_MASK, &brain_mask)?),
            Some(resample_atlas_mask(atlas_dir, LEFT_HEM_MASK, &brain_mask)?),
        )
    } else {
        (None, None)
    };

    // Prior component stack onto the mask grid, brain voxels only.
    let prior_stack = nifti_io::read_series(prior_maps_file)?;
    let resampled = resample::resample_stack(&prior_stack, &brain_mask.geom, Interp::Linear)?;
    let n_comp = resampled.n_frames;
    let mut prior_maps = Array2::<f64>::zeros((n_comp, voxel_indices.len()));
    for c in 0..n_comp {
        let masked = nifti_io::extract_masked(resampled.frame(c), &voxel_indices);
        for (v, value) in masked.into_iter().enumerate() {
            prior_maps[[c, v]] = value;
        }
    }

    let edge_mask = morphology::edge_mask(&brain_mask);

    info!(
        n_voxels = voxel_indices.len(),
        n_priors = n_comp,
        regional = use_region_masks,
        "mask bundle built"
    );

    Ok(MaskBundle {
        template,
        brain_mask,
        wm_mask,
        csf_mask,
        edge_mask,
        right_hem_mask,
        left_hem_mask,
        prior_maps,
        voxel_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::{write_series, write_volume, TimeSeries};
    use std::fs;

    /// Write a small consistent set of mask/template/prior files and return
    /// ScanMaskFiles entries pointing into `dir`.
    fn write_inputs(dir: &Path, n_scans: usize) -> (Vec<ScanMaskFiles>, PathBuf) {
        let dims = (6, 6, 6);
        let mut brain = Volume::filled(dims, 0.0);
        for z in 1..5 {
            for y in 1..5 {
                for x in 1..5 {
                    let i = brain.geom.index(x, y, z);
                    brain.data[i] = 1.0;
                }
            }
        }
        let mut wm = Volume::filled(dims, 0.0);
        wm.data[brain.geom.index(3, 3, 3)] = 1.0;
        let mut csf = Volume::filled(dims, 0.0);
        csf.data[brain.geom.index(2, 2, 2)] = 1.0;
        let mut anat = Volume::filled(dims, 10.0);
        for i in 0..anat.data.len() {
            if brain.data[i] != 0.0 {
                anat.data[i] = 100.0;
            }
        }

        let brain_path = dir.join("brain_mask.nii.gz");
        let wm_path = dir.join("wm_mask.nii.gz");
        let csf_path = dir.join("csf_mask.nii.gz");
        let anat_path = dir.join("anat_template.nii.gz");
        write_volume(&brain_path, &brain).unwrap();
        write_volume(&wm_path, &wm).unwrap();
        write_volume(&csf_path, &csf).unwrap();
        write_volume(&anat_path, &anat).unwrap();

        // Two-component prior stack
        let n = brain.geom.n_voxels();
        let mut data = vec![0.0; n * 2];
        for i in 0..n {
            if brain.data[i] != 0.0 {
                data[i] = 1.0;
                data[n + i] = -1.0;
            }
        }
        let priors = TimeSeries {
            geom: brain.geom.clone(),
            n_frames: 2,
            data,
        };
        let priors_path = dir.join("prior_maps.nii.gz");
        write_series(&priors_path, &priors).unwrap();

        let files = (0..n_scans)
            .map(|_| ScanMaskFiles {
                brain_mask: brain_path.clone(),
                wm_mask: wm_path.clone(),
                csf_mask: csf_path.clone(),
                anat_template: anat_path.clone(),
            })
            .collect();
        (files, priors_path)
    }

    #[test]
    fn test_build_bundle_basic() {
        let dir = tempfile::tempdir().unwrap();
        let (files, priors_path) = write_inputs(dir.path(), 3);

        let bundle =
            build_mask_bundle(&files, &priors_path, false, &AtlasConfig::default()).unwrap();

        assert_eq!(bundle.n_voxels(), 64); // 4^3 cube
        assert_eq!(bundle.n_priors(), 2);
        assert!(bundle.right_hem_mask.is_none());
        assert!(bundle.left_hem_mask.is_none());

        // Edge mask strictly inside the brain mask
        for i in 0..bundle.edge_mask.data.len() {
            if bundle.edge_mask.data[i] != 0.0 {
                assert!(bundle.brain_mask.data[i] != 0.0);
            }
        }
        let edge_count = bundle.edge_mask.data.iter().filter(|&&v| v != 0.0).count();
        assert_eq!(edge_count, 64 - 8); // 4^3 minus 2^3 interior

        // Priors masked onto brain voxels keep their sign structure
        assert!(bundle.prior_maps.row(0).iter().all(|&v| v >= 0.0));
        assert!(bundle.prior_maps.row(1).iter().all(|&v| v <= 0.0));
    }

    #[test]
    fn test_build_bundle_no_scans() {
        let result = build_mask_bundle(
            &[],
            Path::new("/tmp/nowhere.nii.gz"),
            false,
            &AtlasConfig::default(),
        );
        assert!(matches!(result, Err(DiagnosisError::Config(_))));
    }

    #[test]
    fn test_build_bundle_missing_atlas_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (files, priors_path) = write_inputs(dir.path(), 2);

        // Flag set but no atlas dir configured
        let result = build_mask_bundle(&files, &priors_path, true, &AtlasConfig::default());
        assert!(matches!(result, Err(DiagnosisError::Config(_))));

        // Atlas dir configured but empty
        let atlas = AtlasConfig {
            atlas_dir: Some(dir.path().join("empty_atlas")),
        };
        fs::create_dir_all(dir.path().join("empty_atlas")).unwrap();
        let result = build_mask_bundle(&files, &priors_path, true, &atlas);
        assert!(matches!(result, Err(DiagnosisError::Config(_))));
    }

    #[test]
    fn test_build_bundle_with_atlas_masks() {
        let dir = tempfile::tempdir().unwrap();
        let (files, priors_path) = write_inputs(dir.path(), 2);

        let atlas_dir = dir.path().join("atlas");
        fs::create_dir_all(&atlas_dir).unwrap();
        let mut hem = Volume::filled((6, 6, 6), 0.0);
        for i in 0..hem.data.len() / 2 {
            hem.data[i] = 1.0;
        }
        write_volume(&atlas_dir.join(RIGHT_HEM_MASK), &hem).unwrap();
        write_volume(&atlas_dir.join(LEFT_HEM_MASK), &hem).unwrap();

        let atlas = AtlasConfig {
            atlas_dir: Some(atlas_dir),
        };
        let bundle = build_mask_bundle(&files, &priors_path, true, &atlas).unwrap();
        assert!(bundle.right_hem_mask.is_some());
        assert!(bundle.left_hem_mask.is_some());
    }

    #[test]
    fn test_build_bundle_mismatched_masks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut files, priors_path) = write_inputs(dir.path(), 2);

        // Second scan points at a genuinely different brain mask.
        let mut other = Volume::filled((6, 6, 6), 0.0);
        other.data[0] = 1.0;
        let other_path = dir.path().join("other_brain_mask.nii.gz");
        write_volume(&other_path, &other).unwrap();
        files[1].brain_mask = other_path;

        let result = build_mask_bundle(&files, &priors_path, false, &AtlasConfig::default());
        assert!(matches!(result, Err(DiagnosisError::Config(_))));
    }

    #[test]
    fn test_build_bundle_mismatched_wm_mask_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut files, priors_path) = write_inputs(dir.path(), 2);

        // Same brain mask everywhere, but scan 1 brings its own WM mask.
        let mut other = Volume::filled((6, 6, 6), 0.0);
        other.data[0] = 1.0;
        let other_path = dir.path().join("other_wm_mask.nii.gz");
        write_volume(&other_path, &other).unwrap();
        files[1].wm_mask = other_path;

        let result = build_mask_bundle(&files, &priors_path, false, &AtlasConfig::default());
        assert!(matches!(result, Err(DiagnosisError::Config(_))));
    }

    #[test]
    fn test_build_bundle_equal_content_distinct_paths_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut files, priors_path) = write_inputs(dir.path(), 2);

        // A byte-equal copy under a different path passes the content check.
        let copy_path = dir.path().join("csf_mask_copy.nii.gz");
        fs::copy(&files[0].csf_mask, &copy_path).unwrap();
        files[1].csf_mask = copy_path;

        assert!(build_mask_bundle(&files, &priors_path, false, &AtlasConfig::default()).is_ok());
    }

    #[test]
    fn test_build_bundle_empty_brain_mask() {
        let dir = tempfile::tempdir().unwrap();
        let (mut files, priors_path) = write_inputs(dir.path(), 1);

        let empty = Volume::filled((6, 6, 6), 0.0);
        let empty_path = dir.path().join("empty_mask.nii.gz");
        write_volume(&empty_path, &empty).unwrap();
        files[0].brain_mask = empty_path;

        let result = build_mask_bundle(&files, &priors_path, false, &AtlasConfig::default());
        assert!(matches!(result, Err(DiagnosisError::Config(_))));
    }
}
