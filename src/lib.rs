//! rsfc-diagnosis: QC diagnosis for rodent resting-state fMRI
//!
//! This crate computes scan- and dataset-level quality-control features on
//! preprocessed BOLD data and renders the associated diagnosis figures.
//!
//! # Modules
//! - `nifti_io`: NIfTI volume/series I/O
//! - `resample`: grid resampling (nearest, linear, spline)
//! - `morphology`: mask erosion and edge masks
//! - `stats`: correlation and thresholding kernels
//! - `regression`: dual regression and summary traces
//! - `masks`: shared mask bundle builder
//! - `scan`: per-scan feature extraction
//! - `dataset`: cohort-level QC aggregation
//! - `figures`: PNG figure rendering

// Numerical kernels
pub mod morphology;
pub mod regression;
pub mod resample;
pub mod stats;

// Diagnosis stages
pub mod dataset;
pub mod masks;
pub mod scan;

// I/O modules
pub mod figures;
pub mod nifti_io;

pub mod error;

pub use dataset::{dataset_diagnosis, CohortScan, QcStats, MIN_COHORT_SIZE};
pub use error::{DiagnosisError, Result};
pub use masks::{build_mask_bundle, AtlasConfig, MaskBundle, ScanMaskFiles};
pub use scan::{diagnose_scan, ConfoundData, ScanAnalysis, ScanDiagnosis, ScanFiles};
