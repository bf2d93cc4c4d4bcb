//! Image Undistortion Example
//!
//! Removes lens distortion from an image with parameters from a YAML or
//! `.rad` file.
//!
//! Usage:
//! ```bash
//! cargo run --example undistort_image -- \
//!   --input photo.png \
//!   --params samples/caltech.yaml \
//!   --output output/photo_undistorted.png
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info};
use plumbline::distortion::{DistortionModel, DistortionParameters};
use plumbline::jobs::JobHandle;
use plumbline::undistort::{remove_distortion_with_cancel, BoundaryMode, UndistortOptions};
use plumbline::util::{self, RadFile};
use std::path::PathBuf;

/// Image undistortion tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Distorted input image
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Distortion parameters (.yaml or .rad)
    #[arg(short = 'p', long)]
    params: PathBuf,

    /// Output image path
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Resampling settings (.yaml or .json)
    #[arg(long)]
    options: Option<PathBuf>,

    /// Keep the input canvas instead of growing it to the distorted corners
    #[arg(long)]
    no_reshape: bool,

    /// Fill outside samples from the nearest edge instead of black
    #[arg(long)]
    clamp: bool,
}

fn load_parameters(path: &PathBuf) -> Result<DistortionParameters, Box<dyn std::error::Error>> {
    let is_rad = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("rad"));
    if is_rad {
        Ok(RadFile::load(path)?.parameters)
    } else {
        let path_str = path.to_str().ok_or("Invalid params path string")?;
        Ok(DistortionParameters::load_from_yaml(path_str)?)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    info!("Input: {:?}", cli.input);
    info!("Parameters: {:?}", cli.params);
    info!("Output: {:?}", cli.output);

    let params = load_parameters(&cli.params)?;
    info!("{:?}", params);
    let model = DistortionModel::new(params)?;

    let mut options = match &cli.options {
        Some(path) => util::load_undistort_options(path)?,
        None => UndistortOptions::default(),
    };
    if cli.no_reshape {
        options.reshape = false;
    }
    if cli.clamp {
        options.boundary = BoundaryMode::Clamp;
    }

    let raster = util::load_raster(&cli.input)?;
    let job = JobHandle::spawn("undistort", move |token| {
        remove_distortion_with_cancel(&model, &raster, &options, &token)
    })?;

    let undistorted = match job.wait() {
        Ok(undistorted) => undistorted,
        Err(e) => {
            error!("Undistortion failed: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Output canvas {}x{}, lower-left ({:.3}, {:.3}), upper-right ({:.3}, {:.3})",
        undistorted.image.width(),
        undistorted.image.height(),
        undistorted.lower_left.x,
        undistorted.lower_left.y,
        undistorted.upper_right.x,
        undistorted.upper_right.y
    );

    if let Some(parent) = cli.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    util::save_raster(&cli.output, &undistorted.image)?;

    Ok(())
}
