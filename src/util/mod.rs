//! File formats and I/O helpers.
//!
//! * `.rad` parameter files ([`RadFile`])
//! * `.dat` numeric arrays ([`load_dat`], [`save_dat`])
//! * line group CSV files ([`load_line_groups`], [`save_line_groups`])
//! * JSON calibration reports and YAML/JSON solver settings
//! * raster images through the `image` crate ([`load_raster`], [`save_raster`])

use crate::distortion::DistortionError;
use crate::optimization::{CalibrationReport, SolverOptions};
use crate::undistort::{Raster, UndistortOptions};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

pub mod dat;
pub mod lines;
pub mod rad;

pub use dat::{format_c_exp, load_dat, save_dat, save_dat_row, DatFormat};
pub use lines::{load_line_groups, save_line_groups};
pub use rad::RadFile;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("YAML error: {0}")]
    Yaml(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Distortion(#[from] DistortionError),
}

impl From<serde_yaml::Error> for UtilError {
    fn from(err: serde_yaml::Error) -> Self {
        UtilError::Yaml(err.to_string())
    }
}

/// Ensure the output directory exists
pub fn ensure_output_dir() -> Result<(), UtilError> {
    let output_dir = Path::new("output");
    if !output_dir.exists() {
        fs::create_dir_all(output_dir).map_err(|e| {
            UtilError::InvalidParams(format!("Failed to create output directory: {e}"))
        })?;
    }
    Ok(())
}

/// Decodes an image file into a [`Raster`] with one value per channel in `0..=255`.
pub fn load_raster<P: AsRef<Path>>(path: P) -> Result<Raster, UtilError> {
    let path = path.as_ref();
    let img = image::open(path)?;
    let raster = Raster::from_dynamic_image(&img)?;
    info!(
        "Loaded {} ({}x{}, {} channel(s))",
        path.display(),
        raster.width(),
        raster.height(),
        raster.channels()
    );
    Ok(raster)
}

/// Encodes a [`Raster`] as an 8-bit image. The format follows the file extension.
pub fn save_raster<P: AsRef<Path>>(path: P, raster: &Raster) -> Result<(), UtilError> {
    let img = raster.to_dynamic_image()?;
    img.save(path.as_ref())?;
    info!("Saved {}", path.as_ref().display());
    Ok(())
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Reads a serde value from JSON (`.json`) or YAML (anything else).
fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, UtilError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    if is_json(path) {
        Ok(serde_json::from_str(&contents)?)
    } else {
        Ok(serde_yaml::from_str(&contents)?)
    }
}

fn save_config<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<(), UtilError> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    if is_json(path) {
        serde_json::to_writer_pretty(&mut writer, value)?;
        writeln!(writer)?;
    } else {
        writer.write_all(serde_yaml::to_string(value)?.as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Loads solver settings. Missing fields take their default values.
pub fn load_solver_options<P: AsRef<Path>>(path: P) -> Result<SolverOptions, UtilError> {
    load_config(path)
}

pub fn save_solver_options<P: AsRef<Path>>(path: P, options: &SolverOptions) -> Result<(), UtilError> {
    save_config(path, options)
}

/// Loads image correction settings. Missing fields take their default values.
pub fn load_undistort_options<P: AsRef<Path>>(path: P) -> Result<UndistortOptions, UtilError> {
    load_config(path)
}

/// Writes a calibration report as pretty-printed JSON.
pub fn save_report<P: AsRef<Path>>(path: P, report: &CalibrationReport) -> Result<(), UtilError> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()?;
    info!("Calibration report written to {}", path.display());
    Ok(())
}

pub fn load_report<P: AsRef<Path>>(path: P) -> Result<CalibrationReport, UtilError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undistort::BoundaryMode;

    #[test]
    fn test_solver_options_yaml_and_json() {
        ensure_output_dir().unwrap();
        let options = SolverOptions {
            max_iterations: 250,
            verbose: true,
            ..SolverOptions::default()
        };

        save_solver_options("output/solver_options.yaml", &options).unwrap();
        assert_eq!(load_solver_options("output/solver_options.yaml").unwrap(), options);

        save_solver_options("output/solver_options.json", &options).unwrap();
        assert_eq!(load_solver_options("output/solver_options.json").unwrap(), options);

        fs::remove_file("output/solver_options.yaml").unwrap();
        fs::remove_file("output/solver_options.json").unwrap();
    }

    #[test]
    fn test_load_undistort_options_sample() {
        let options = load_undistort_options("samples/undistort.yaml").unwrap();
        assert!(options.reshape);
        assert_eq!(options.boundary, BoundaryMode::Clamp);
    }

    #[test]
    fn test_raster_png_round_trip() {
        ensure_output_dir().unwrap();
        let data: Vec<f64> = (0..4 * 3 * 3).map(|v| (v * 7 % 256) as f64).collect();
        let raster = Raster::new(4, 3, 3, data).unwrap();

        save_raster("output/raster_rgb.png", &raster).unwrap();
        let loaded = load_raster("output/raster_rgb.png").unwrap();
        assert_eq!(loaded, raster);

        fs::remove_file("output/raster_rgb.png").unwrap();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_report("samples/does_not_exist.json").unwrap_err();
        assert!(matches!(err, UtilError::Io(_)));
    }
}
