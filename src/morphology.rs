//! Binary mask morphology
//!
//! One-voxel erosion and the erosion-difference edge mask used for the
//! diagnosis figures and edge timecourses.

use crate::nifti_io::Volume;

/// Erode a binary mask by one voxel (6-connectivity). The volume boundary is
/// treated as background, so surface voxels of the field of view are removed.
pub fn erode(mask: &[f64], dims: (usize, usize, usize)) -> Vec<u8> {
    let (nx, ny, nz) = dims;
    let idx = |x: usize, y: usize, z: usize| x + y * nx + z * nx * ny;

    let mut eroded = vec![0u8; nx * ny * nz];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if mask[idx(x, y, z)] == 0.0 {
                    continue;
                }
                if x == 0 || y == 0 || z == 0 || x == nx - 1 || y == ny - 1 || z == nz - 1 {
                    continue;
                }
                let kept = mask[idx(x - 1, y, z)] != 0.0
                    && mask[idx(x + 1, y, z)] != 0.0
                    && mask[idx(x, y - 1, z)] != 0.0
                    && mask[idx(x, y + 1, z)] != 0.0
                    && mask[idx(x, y, z - 1)] != 0.0
                    && mask[idx(x, y, z + 1)] != 0.0;
                if kept {
                    eroded[idx(x, y, z)] = 1;
                }
            }
        }
    }
    eroded
}

/// Single-voxel-thick edge: original mask minus its one-voxel erosion.
/// The result is a strict subset of the brain mask (for any non-empty mask).
pub fn edge_mask(brain_mask: &Volume) -> Volume {
    let eroded = erode(&brain_mask.data, brain_mask.geom.dims);
    let data = brain_mask
        .data
        .iter()
        .zip(eroded.iter())
        .map(|(&m, &e)| if m != 0.0 && e == 0 { 1.0 } else { 0.0 })
        .collect();
    Volume {
        geom: brain_mask.geom.clone(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cube mask of `side` voxels centered in a `dims` volume.
    fn cube_mask(dims: (usize, usize, usize), side: usize) -> Volume {
        let mut mask = Volume::filled(dims, 0.0);
        let start = (dims.0 - side) / 2;
        for z in start..start + side {
            for y in start..start + side {
                for x in start..start + side {
                    let i = mask.geom.index(x, y, z);
                    mask.data[i] = 1.0;
                }
            }
        }
        mask
    }

    #[test]
    fn test_erode_cube() {
        let mask = cube_mask((7, 7, 7), 5);
        let eroded = erode(&mask.data, (7, 7, 7));
        let count: usize = eroded.iter().map(|&v| v as usize).sum();
        // 5^3 cube erodes to 3^3
        assert_eq!(count, 27);
    }

    #[test]
    fn test_erode_respects_volume_boundary() {
        // A full-volume mask loses its outer shell entirely.
        let mask = Volume::filled((4, 4, 4), 1.0);
        let eroded = erode(&mask.data, (4, 4, 4));
        let count: usize = eroded.iter().map(|&v| v as usize).sum();
        assert_eq!(count, 8); // inner 2x2x2
    }

    #[test]
    fn test_edge_mask_is_strict_subset() {
        let mask = cube_mask((9, 9, 9), 5);
        let edge = edge_mask(&mask);

        let mut edge_count = 0;
        for i in 0..mask.data.len() {
            if edge.data[i] != 0.0 {
                assert!(mask.data[i] != 0.0, "edge voxel {} outside brain mask", i);
                edge_count += 1;
            }
        }
        let mask_count = mask.data.iter().filter(|&&v| v != 0.0).count();
        assert!(edge_count > 0, "edge mask should not be empty");
        assert!(
            edge_count < mask_count,
            "edge must be a strict subset: {} vs {}",
            edge_count,
            mask_count
        );
        // 5^3 minus the 3^3 interior
        assert_eq!(edge_count, 125 - 27);
    }

    #[test]
    fn test_edge_mask_one_voxel_thick() {
        // Every edge voxel has at least one 6-neighbor outside the mask or on
        // the volume boundary, and eroding the edge mask leaves nothing.
        let mask = cube_mask((9, 9, 9), 5);
        let edge = edge_mask(&mask);
        let re_eroded = erode(&edge.data, (9, 9, 9));
        assert!(re_eroded.iter().all(|&v| v == 0), "edge shell is thicker than one voxel");
    }

    #[test]
    fn test_edge_mask_empty_input() {
        let mask = Volume::filled((3, 3, 3), 0.0);
        let edge = edge_mask(&mask);
        assert!(edge.data.iter().all(|&v| v == 0.0));
    }
}
