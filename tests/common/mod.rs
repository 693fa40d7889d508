//! Shared helpers for the end-to-end diagnosis tests
//!
//! Builds a small synthetic dataset on disk: a 100-voxel single-slab brain
//! mask, a two-component prior stack split into left/right halves, and BOLD
//! scans carrying those sources plus deterministic per-voxel noise.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use rsfc_diagnosis::masks::{MaskBundle, ScanMaskFiles};
use rsfc_diagnosis::nifti_io::{write_series, write_volume, TimeSeries, Volume};
use rsfc_diagnosis::scan::{ConfoundData, ScanAnalysis, ScanFiles};

pub const DIMS: (usize, usize, usize) = (10, 10, 3);
pub const N_FRAMES: usize = 24;
pub const N_MASK_VOXELS: usize = 100;

/// Brain mask: the full 10x10 plane at z = 1, exactly 100 voxels.
pub fn brain_mask_volume() -> Volume {
    let mut mask = Volume::filled(DIMS, 0.0);
    for y in 0..10 {
        for x in 0..10 {
            let i = mask.geom.index(x, y, 1);
            mask.data[i] = 1.0;
        }
    }
    mask
}

/// Two prior components: left half (x < 5) and right half (x >= 5) of the
/// mask slab.
fn prior_stack(mask: &Volume) -> TimeSeries {
    let n = mask.geom.n_voxels();
    let mut data = vec![0.0; n * 2];
    for y in 0..10 {
        for x in 0..10 {
            let i = mask.geom.index(x, y, 1);
            if x < 5 {
                data[i] = 1.0;
            } else {
                data[n + i] = 1.0;
            }
        }
    }
    TimeSeries {
        geom: mask.geom.clone(),
        n_frames: 2,
        data,
    }
}

/// Write the shared bundle inputs (masks, template, priors) into `dir` and
/// return one ScanMaskFiles entry per scan plus the prior-stack path.
pub fn write_bundle_inputs(dir: &Path, n_scans: usize) -> (Vec<ScanMaskFiles>, PathBuf) {
    let mask = brain_mask_volume();

    let mut wm = Volume::filled(DIMS, 0.0);
    let mut csf = Volume::filled(DIMS, 0.0);
    for y in 4..6 {
        wm.data[mask.geom.index(2, y, 1)] = 1.0;
        csf.data[mask.geom.index(7, y, 1)] = 1.0;
    }

    let mut anat = Volume::filled(DIMS, 10.0);
    for i in 0..anat.data.len() {
        if mask.data[i] != 0.0 {
            anat.data[i] = 100.0;
        }
    }

    let brain_path = dir.join("brain_mask.nii.gz");
    let wm_path = dir.join("wm_mask.nii.gz");
    let csf_path = dir.join("csf_mask.nii.gz");
    let anat_path = dir.join("anat_template.nii.gz");
    let priors_path = dir.join("prior_maps.nii.gz");
    write_volume(&brain_path, &mask).unwrap();
    write_volume(&wm_path, &wm).unwrap();
    write_volume(&csf_path, &csf).unwrap();
    write_volume(&anat_path, &anat).unwrap();
    write_series(&priors_path, &prior_stack(&mask)).unwrap();

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

/// Deterministic per-scan confound record.
pub fn confounds(scan_idx: usize) -> ConfoundData {
    let phase = scan_idx as f64 * 0.31;
    ConfoundData {
        tdof: 100.0 + scan_idx as f64,
        motion_params: (0..N_FRAMES)
            .map(|t| {
                let t = t as f64;
                [
                    0.01 * (0.2 * t + phase).sin(),
                    0.01 * (0.3 * t + phase).cos(),
                    0.01 * (0.4 * t).sin(),
                    0.001 * (0.5 * t).cos(),
                    0.001 * (0.6 * t + phase).sin(),
                    0.001 * (0.7 * t).cos(),
                ]
            })
            .collect(),
        framewise_displacement: (0..N_FRAMES)
            .map(|t| 0.05 * ((0.5 * t as f64 + phase).sin()).abs())
            .collect(),
        frame_r2: (0..N_FRAMES)
            .map(|t| 0.3 + 0.1 * ((t as f64) * 0.4 + phase).sin())
            .collect(),
    }
}

/// Write one scan's BOLD, VE and STD files and return its ScanFiles record.
///
/// The BOLD carries the two prior sources plus a small voxel-dependent
/// oscillation, so every voxel timecourse has nonzero variance.
pub fn write_scan_inputs(dir: &Path, scan_idx: usize, mask: &Volume) -> ScanFiles {
    let geom = mask.geom.clone();
    let n = geom.n_voxels();
    let phase = scan_idx as f64 * 0.5;

    let mut bold = vec![0.0; n * N_FRAMES];
    for t in 0..N_FRAMES {
        let tc0 = ((t as f64) * 0.7 + phase).sin();
        let tc1 = ((t as f64) * 0.4).cos();
        for i in 0..n {
            let value = if mask.data[i] != 0.0 {
                let x = i % geom.dims.0;
                let source = if x < 5 { tc0 } else { tc1 };
                100.0 + source + 0.2 * ((t as f64) * 1.3 + (i as f64) * 0.37).sin()
            } else {
                0.0
            };
            bold[t * n + i] = value;
        }
    }
    let bold_series = TimeSeries {
        geom: geom.clone(),
        n_frames: N_FRAMES,
        data: bold,
    };

    let mut ve = Volume::filled(DIMS, 0.0);
    let mut std_map = Volume::filled(DIMS, 0.0);
    for i in 0..n {
        if mask.data[i] != 0.0 {
            ve.data[i] = 0.4 + 0.01 * scan_idx as f64 + 0.002 * (i % 13) as f64;
            std_map.data[i] = 1.0 + 0.05 * scan_idx as f64 + 0.001 * (i % 7) as f64;
        }
    }

    let bold_path = dir.join(format!("sub-{:02}_bold.nii.gz", scan_idx));
    let ve_path = dir.join(format!("sub-{:02}_VE.nii.gz", scan_idx));
    let std_path = dir.join(format!("sub-{:02}_STD.nii.gz", scan_idx));
    write_series(&bold_path, &bold_series).unwrap();
    write_volume(&ve_path, &ve).unwrap();
    write_volume(&std_path, &std_map).unwrap();

    ScanFiles {
        bold_file: bold_path,
        ve_file: ve_path,
        std_file: std_path,
        confounds: confounds(scan_idx),
    }
}

/// Analysis record with `n_ica` synthetic dual-ICA components.
pub fn analysis_with_ica(bundle: &MaskBundle, scan_idx: usize, n_ica: usize) -> ScanAnalysis {
    let n_voxels = bundle.n_voxels();
    let mut maps = Array2::<f64>::zeros((n_ica, n_voxels));
    for c in 0..n_ica {
        for v in 0..n_voxels {
            maps[[c, v]] = bundle.prior_maps[[c, v]] * (1.0 + 0.1 * scan_idx as f64)
                + 0.01 * (v % 11) as f64;
        }
    }
    ScanAnalysis {
        dual_ica_maps: maps,
        seed_map_files: Vec::new(),
    }
}

/// Sorted file names inside a directory.
pub fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
