//! Grid resampling
//!
//! Maps volumes between voxel grids through world space: each output voxel is
//! sent through the reference affine, pulled back through the inverse source
//! affine, and sampled with the requested interpolator. Voxels falling
//! outside the source field of view are 0.

use crate::error::{DiagnosisError, Result};
use crate::nifti_io::{TimeSeries, Volume, VolumeGeometry};

/// Interpolation scheme.
///
/// Nearest for label masks, linear for component stacks, cubic (Catmull-Rom)
/// spline for display templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    Nearest,
    Linear,
    Spline,
}

/// Invert a row-major 4x4 affine (3x3 adjugate inverse plus translation).
///
/// Returns `None` when the linear part is singular.
pub fn invert_affine(m: &[f64; 16]) -> Option<[f64; 16]> {
    let a = m[0];
    let b = m[1];
    let c = m[2];
    let d = m[4];
    let e = m[5];
    let f = m[6];
    let g = m[8];
    let h = m[9];
    let i = m[10];

    let det = a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;

    let r00 = (e * i - f * h) * inv_det;
    let r01 = (c * h - b * i) * inv_det;
    let r02 = (b * f - c * e) * inv_det;
    let r10 = (f * g - d * i) * inv_det;
    let r11 = (a * i - c * g) * inv_det;
    let r12 = (c * d - a * f) * inv_det;
    let r20 = (d * h - e * g) * inv_det;
    let r21 = (b * g - a * h) * inv_det;
    let r22 = (a * e - b * d) * inv_det;

    let tx = m[3];
    let ty = m[7];
    let tz = m[11];

    Some([
        r00,
        r01,
        r02,
        -(r00 * tx + r01 * ty + r02 * tz),
        r10,
        r11,
        r12,
        -(r10 * tx + r11 * ty + r12 * tz),
        r20,
        r21,
        r22,
        -(r20 * tx + r21 * ty + r22 * tz),
        0.0,
        0.0,
        0.0,
        1.0,
    ])
}

fn apply_affine(m: &[f64; 16], x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    (
        m[0] * x + m[1] * y + m[2] * z + m[3],
        m[4] * x + m[5] * y + m[6] * z + m[7],
        m[8] * x + m[9] * y + m[10] * z + m[11],
    )
}

fn sample_at(data: &[f64], geom: &VolumeGeometry, x: usize, y: usize, z: usize) -> f64 {
    data[geom.index(x, y, z)]
}

/// Clamped voxel lookup used by the spline kernel's edge handling.
fn sample_clamped(data: &[f64], geom: &VolumeGeometry, x: i64, y: i64, z: i64) -> f64 {
    let (nx, ny, nz) = geom.dims;
    let cx = x.clamp(0, nx as i64 - 1) as usize;
    let cy = y.clamp(0, ny as i64 - 1) as usize;
    let cz = z.clamp(0, nz as i64 - 1) as usize;
    sample_at(data, geom, cx, cy, cz)
}

fn sample_nearest(data: &[f64], geom: &VolumeGeometry, x: f64, y: f64, z: f64) -> f64 {
    let xi = x.round() as i64;
    let yi = y.round() as i64;
    let zi = z.round() as i64;
    let (nx, ny, nz) = geom.dims;
    if xi < 0 || yi < 0 || zi < 0 || xi >= nx as i64 || yi >= ny as i64 || zi >= nz as i64 {
        return 0.0;
    }
    sample_at(data, geom, xi as usize, yi as usize, zi as usize)
}

fn sample_linear(data: &[f64], geom: &VolumeGeometry, x: f64, y: f64, z: f64) -> f64 {
    let (nx, ny, nz) = geom.dims;
    if x < 0.0 || y < 0.0 || z < 0.0 || x > (nx - 1) as f64 || y > (ny - 1) as f64 || z > (nz - 1) as f64 {
        return 0.0;
    }
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let z0 = z.floor() as usize;
    let x1 = (x0 + 1).min(nx - 1);
    let y1 = (y0 + 1).min(ny - 1);
    let z1 = (z0 + 1).min(nz - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let fz = z - z0 as f64;

    let c000 = sample_at(data, geom, x0, y0, z0);
    let c100 = sample_at(data, geom, x1, y0, z0);
    let c010 = sample_at(data, geom, x0, y1, z0);
    let c110 = sample_at(data, geom, x1, y1, z0);
    let c001 = sample_at(data, geom, x0, y0, z1);
    let c101 = sample_at(data, geom, x1, y0, z1);
    let c011 = sample_at(data, geom, x0, y1, z1);
    let c111 = sample_at(data, geom, x1, y1, z1);

    let c00 = c000 * (1.0 - fx) + c100 * fx;
    let c10 = c010 * (1.0 - fx) + c110 * fx;
    let c01 = c001 * (1.0 - fx) + c101 * fx;
    let c11 = c011 * (1.0 - fx) + c111 * fx;

    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;

    c0 * (1.0 - fz) + c1 * fz
}

/// Catmull-Rom weight for a unit-spaced sample at offset `t` in [-2, 2].
fn catmull_rom(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

fn sample_spline(data: &[f64], geom: &VolumeGeometry, x: f64, y: f64, z: f64) -> f64 {
    let (nx, ny, nz) = geom.dims;
    if x < 0.0 || y < 0.0 || z < 0.0 || x > (nx - 1) as f64 || y > (ny - 1) as f64 || z > (nz - 1) as f64 {
        return 0.0;
    }
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let z0 = z.floor() as i64;

    let mut acc = 0.0;
    for dz in -1i64..=2 {
        let wz = catmull_rom(z - (z0 + dz) as f64);
        if wz == 0.0 {
            continue;
        }
        for dy in -1i64..=2 {
            let wy = catmull_rom(y - (y0 + dy) as f64);
            if wy == 0.0 {
                continue;
            }
            for dx in -1i64..=2 {
                let wx = catmull_rom(x - (x0 + dx) as f64);
                if wx == 0.0 {
                    continue;
                }
                acc += wx * wy * wz * sample_clamped(data, geom, x0 + dx, y0 + dy, z0 + dz);
            }
        }
    }
    acc
}

fn sample(data: &[f64], geom: &VolumeGeometry, x: f64, y: f64, z: f64, interp: Interp) -> f64 {
    match interp {
        Interp::Nearest => sample_nearest(data, geom, x, y, z),
        Interp::Linear => sample_linear(data, geom, x, y, z),
        Interp::Spline => sample_spline(data, geom, x, y, z),
    }
}

fn resample_frame(
    src_data: &[f64],
    src_geom: &VolumeGeometry,
    src_inverse: &[f64; 16],
    reference: &VolumeGeometry,
    interp: Interp,
    out: &mut Vec<f64>,
) {
    let (nx, ny, nz) = reference.dims;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let world = apply_affine(&reference.affine, i as f64, j as f64, k as f64);
                let (sx, sy, sz) = apply_affine(src_inverse, world.0, world.1, world.2);
                out.push(sample(src_data, src_geom, sx, sy, sz, interp));
            }
        }
    }
}

/// Resample a volume onto a reference grid.
pub fn resample_to_reference(
    src: &Volume,
    reference: &VolumeGeometry,
    interp: Interp,
) -> Result<Volume> {
    let inverse = invert_affine(&src.geom.affine)
        .ok_or_else(|| DiagnosisError::Config("singular affine on resample source".into()))?;
    let mut data = Vec::with_capacity(reference.n_voxels());
    resample_frame(&src.data, &src.geom, &inverse, reference, interp, &mut data);
    Ok(Volume {
        geom: reference.clone(),
        data,
    })
}

/// Resample every frame of a 4-D stack onto a reference grid.
pub fn resample_stack(src: &TimeSeries, reference: &VolumeGeometry, interp: Interp) -> Result<TimeSeries> {
    let inverse = invert_affine(&src.geom.affine)
        .ok_or_else(|| DiagnosisError::Config("singular affine on resample source".into()))?;
    let mut data = Vec::with_capacity(reference.n_voxels() * src.n_frames);
    for t in 0..src.n_frames {
        resample_frame(src.frame(t), &src.geom, &inverse, reference, interp, &mut data);
    }
    Ok(TimeSeries {
        geom: reference.clone(),
        n_frames: src.n_frames,
        data,
    })
}
