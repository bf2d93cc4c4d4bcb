//! Plumbline
//!
//! Lens distortion correction for images and point coordinates, and automatic
//! estimation of the distortion from points that are known to lie on straight
//! lines in the scene (the plumb-line method). No calibration target is
//! needed. The library provides:
//! - Caltech-style radial + tangential + skew and radial-only distortion models
//! - Image resampling that removes distortion
//! - A normal-form line fitter
//! - The line-straightness objective and its Levenberg-Marquardt driver
//! - `.rad`, `.dat`, CSV, YAML and JSON file support
//! - Background jobs with cooperative cancellation
//!
//! Optimization uses the tiny-solver framework with automatic differentiation.

pub mod distortion;
pub mod geometry;
pub mod jobs;
pub mod optimization;
pub mod undistort;
pub mod util;

// Re-export commonly used types
pub use distortion::{
    DistortionError, DistortionKernel, DistortionModel, DistortionParameters, ModelKind,
};

pub use geometry::{fit_line, LineFit, LineGroup, LineSeed};

pub use optimization::{
    calibrate, calibrate_with_cancel, Calibration, CalibrationObjective, CalibrationReport,
    LineCalibration, Optimizer, SolverOptions,
};

pub use undistort::{
    remove_distortion, remove_distortion_with_cancel, BoundaryMode, Raster, UndistortOptions,
    UndistortedImage,
};

pub use jobs::{CancellationToken, JobHandle, ModelSlot};
