//! NIfTI file I/O
//!
//! Loads 3-D volumes and 4-D series into flat `Vec<f64>` buffers in Fortran
//! order (x varies fastest), and writes them back as NIfTI-1 files. Both
//! `.nii` and `.nii.gz` are supported (gzip is auto-detected on read, chosen
//! by extension on write).
//!
//! The 4th axis of a [`TimeSeries`] is time for BOLD files and the component
//! axis for prior-map stacks; the layout is the same either way.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{DiagnosisError, Result};

/// Voxel grid description shared by all images of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

impl VolumeGeometry {
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Flat Fortran-order index: x + y*nx + z*nx*ny
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.dims.0 + z * self.dims.0 * self.dims.1
    }

    /// Whether two grids are interchangeable (same dims, spacing and affine
    /// within tolerance).
    pub fn matches(&self, other: &VolumeGeometry) -> bool {
        const TOL: f64 = 1e-3;
        self.dims == other.dims
            && (self.voxel_size.0 - other.voxel_size.0).abs() < TOL
            && (self.voxel_size.1 - other.voxel_size.1).abs() < TOL
            && (self.voxel_size.2 - other.voxel_size.2).abs() < TOL
            && self
                .affine
                .iter()
                .zip(other.affine.iter())
                .all(|(a, b)| (a - b).abs() < TOL)
    }
}

/// One 3-D volume, flat Fortran order.
#[derive(Debug, Clone)]
pub struct Volume {
    pub geom: VolumeGeometry,
    pub data: Vec<f64>,
}

impl Volume {
    /// Volume filled with a constant, on a unit-spacing grid.
    pub fn filled(dims: (usize, usize, usize), value: f64) -> Volume {
        let geom = VolumeGeometry {
            dims,
            voxel_size: (1.0, 1.0, 1.0),
            affine: identity_affine(1.0, 1.0, 1.0),
        };
        let n = geom.n_voxels();
        Volume {
            geom,
            data: vec![value; n],
        }
    }
}

/// A 4-D image: `n_frames` volumes sharing one grid, frame-major
/// (frame t occupies `data[t*n_voxels .. (t+1)*n_voxels]`).
#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub geom: VolumeGeometry,
    pub n_frames: usize,
    pub data: Vec<f64>,
}

impl TimeSeries {
    /// Borrow frame `t` as a flat slice.
    pub fn frame(&self, t: usize) -> &[f64] {
        let n = self.geom.n_voxels();
        &self.data[t * n..(t + 1) * n]
    }
}

/// Flat Fortran-order indices of the nonzero voxels of a mask volume.
pub fn mask_indices(mask: &Volume) -> Vec<usize> {
    mask.data
        .iter()
        .enumerate()
        .filter(|(_, &v)| v != 0.0)
        .map(|(i, _)| i)
        .collect()
}

/// Gather the values at `indices` out of a flat volume buffer.
pub fn extract_masked(data: &[f64], indices: &[usize]) -> Vec<f64> {
    indices.iter().map(|&i| data[i]).collect()
}

/// Identity affine scaled by the voxel size.
pub fn identity_affine(vsx: f64, vsy: f64, vsz: f64) -> [f64; 16] {
    [
        vsx, 0.0, 0.0, 0.0, //
        0.0, vsy, 0.0, 0.0, //
        0.0, 0.0, vsz, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn load_object(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder)
            .map_err(|e| DiagnosisError::Nifti(format!("failed to read gzipped NIfTI: {}", e)))
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| DiagnosisError::Nifti(format!("failed to read NIfTI: {}", e)))
    }
}

/// Affine from header: sform when set, pixdim-scaled identity otherwise.
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64, //
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64, //
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64, //
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        identity_affine(
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        )
    }
}

fn geometry_from_header(header: &NiftiHeader, dims: (usize, usize, usize)) -> VolumeGeometry {
    VolumeGeometry {
        dims,
        voxel_size: (
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        ),
        affine: get_affine(header),
    }
}

fn decode(bytes: &[u8]) -> Result<TimeSeries> {
    let obj = load_object(bytes)?;
    let header = obj.header().clone();

    let scl_slope = if header.scl_slope == 0.0 {
        1.0
    } else {
        header.scl_slope as f64
    };
    let scl_inter = header.scl_inter as f64;

    let volume = obj.into_volume();
    let array: Array<f64, _> = volume
        .into_ndarray()
        .map_err(|e| DiagnosisError::Nifti(format!("failed to convert to ndarray: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(DiagnosisError::Nifti(format!(
            "expected at least 3D volume, got {}D",
            shape.len()
        )));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    // Flatten to Fortran order per frame, applying the scaling on the fly.
    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    if shape.len() == 3 {
        let array = array
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| DiagnosisError::Nifti(format!("unsupported dimensionality: {}", e)))?;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(array[[i, j, k]] * scl_slope + scl_inter);
                }
            }
        }
    } else {
        let array = array
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| DiagnosisError::Nifti(format!("unsupported dimensionality: {}", e)))?;
        for t in 0..nt {
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        data.push(array[[i, j, k, t]] * scl_slope + scl_inter);
                    }
                }
            }
        }
    }

    Ok(TimeSeries {
        geom: geometry_from_header(&header, (nx, ny, nz)),
        n_frames: nt,
        data,
    })
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        DiagnosisError::Nifti(format!("failed to read file '{}': {}", path.display(), e))
    })
}

/// Read a 3-D volume. A 4-D file is rejected to catch mixed-up inputs early.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let series = decode(&read_bytes(path)?)?;
    if series.n_frames != 1 {
        return Err(DiagnosisError::Nifti(format!(
            "'{}' has {} frames, expected a single 3D volume",
            path.display(),
            series.n_frames
        )));
    }
    Ok(Volume {
        geom: series.geom,
        data: series.data,
    })
}

/// Read a 3-D or 4-D image as a series (a 3-D file becomes one frame).
pub fn read_series(path: &Path) -> Result<TimeSeries> {
    decode(&read_bytes(path)?)
}

/// Serialize as an uncompressed NIfTI-1 byte buffer (FLOAT32 data).
fn encode(data: &[f64], geom: &VolumeGeometry, n_frames: usize) -> Result<Vec<u8>> {
    use std::io::Write;

    let (nx, ny, nz) = geom.dims;
    let expected = nx * ny * nz * n_frames;
    if data.len() != expected {
        return Err(DiagnosisError::shape("nifti encode", expected, data.len()));
    }

    let mut header = [0u8; 348];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let ndim: i16 = if n_frames > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [
        ndim,
        nx as i16,
        ny as i16,
        nz as i16,
        n_frames as i16,
        1,
        1,
        1,
    ];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [
        1.0,
        geom.voxel_size.0 as f32,
        geom.voxel_size.1 as f32,
        geom.voxel_size.2 as f32,
        1.0,
        1.0,
        1.0,
        1.0,
    ];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4-byte extension flag)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes()); // scl_slope
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes()); // scl_inter

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            let value = geom.affine[row * 4 + col] as f32;
            header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(&header)?;
    buffer.write_all(&[0u8; 4])?;
    for &val in data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }
    Ok(buffer)
}

fn write_bytes(path: &Path, data: &[f64], geom: &VolumeGeometry, n_frames: usize) -> Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let raw = encode(data, geom, n_frames)?;
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .map_err(|e| DiagnosisError::Nifti(format!("gzip compression failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| DiagnosisError::Nifti(format!("gzip finish failed: {}", e)))?
    } else {
        raw
    };
    std::fs::write(path, &bytes).map_err(|e| {
        DiagnosisError::Nifti(format!("failed to write file '{}': {}", path.display(), e))
    })
}

/// Write a 3-D volume (`.nii` or `.nii.gz` by extension).
pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    write_bytes(path, &volume.data, &volume.geom, 1)
}

/// Write a 4-D series (`.nii` or `.nii.gz` by extension).
pub fn write_series(path: &Path, series: &TimeSeries) -> Result<()> {
    write_bytes(path, &series.data, &series.geom, series.n_frames)
}
