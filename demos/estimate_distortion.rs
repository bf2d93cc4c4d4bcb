//! Plumb-line Distortion Estimation Example
//!
//! Estimates the distortion center and radial coefficients from groups of
//! points that lie on straight lines in the scene.
//!
//! Usage:
//! ```bash
//! cargo run --example estimate_distortion -- \
//!   --lines samples/grid_lines.csv \
//!   --principal-axis-seed \
//!   --output-rad output/estimate.rad \
//!   --report output/estimate.json
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info, warn};
use nalgebra::Vector2;
use plumbline::distortion::{DistortionModel, DistortionParameters};
use plumbline::geometry::LineSeed;
use plumbline::jobs::{JobHandle, ModelSlot};
use plumbline::optimization::{calibrate_with_cancel, CalibrationObjective, SolverOptions};
use plumbline::util::{self, RadFile};
use std::path::{Path, PathBuf};

/// Plumb-line distortion estimation tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// CSV file with columns line,x,y in distorted pixel coordinates
    #[arg(short = 'l', long)]
    lines: PathBuf,

    /// Seed parameters (.yaml or .rad). Defaults to f=1000 and the image center
    #[arg(short = 'p', long)]
    params: Option<PathBuf>,

    /// Image width used for the default seed
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Image height used for the default seed
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Solver settings (.yaml or .json)
    #[arg(short = 's', long)]
    solver: Option<PathBuf>,

    /// Penalty that keeps the center near the seed center
    #[arg(long)]
    center_penalty: Option<f64>,

    /// Seed every line from the principal axis of its points
    #[arg(long)]
    principal_axis_seed: bool,

    /// Where to write the estimate as a .rad file
    #[arg(long)]
    output_rad: Option<PathBuf>,

    /// Where to write the JSON calibration report
    #[arg(long)]
    report: Option<PathBuf>,
}

fn load_seed(cli: &Cli) -> Result<DistortionParameters, Box<dyn std::error::Error>> {
    let Some(path) = &cli.params else {
        info!("No seed given, starting from a {}x{} default", cli.width, cli.height);
        return Ok(DistortionParameters::for_image(cli.width, cli.height));
    };
    let is_rad = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("rad"));
    if is_rad {
        let rad = RadFile::load(path)?;
        info!("Loaded seed from {:?} ({})", path, rad.comment);
        Ok(rad.parameters)
    } else {
        let path_str = path.to_str().ok_or("Invalid params path string")?;
        info!("Loaded seed from {:?}", path);
        Ok(DistortionParameters::load_from_yaml(path_str)?)
    }
}

fn ensure_parent(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
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
    info!("Lines: {:?}", cli.lines);

    let groups = util::load_line_groups(&cli.lines)?;
    let seed_params = load_seed(&cli)?;
    info!("Seed parameters: {:?}", seed_params);
    let seed = DistortionModel::new(seed_params)?;

    let mut options = match &cli.solver {
        Some(path) => util::load_solver_options(path)?,
        None => SolverOptions::default(),
    };
    options.verbose = true;

    let mut objective = CalibrationObjective::from_model(groups, &seed);
    if let Some(penalty) = cli.center_penalty {
        objective = objective.with_weighted_center_prior(seed.center(), penalty);
    }
    if cli.principal_axis_seed {
        objective = objective.with_line_seed(LineSeed::PrincipalAxis);
    }

    let slot = ModelSlot::new(seed.clone());
    let job = JobHandle::spawn("plumb-line calibration", move |token| {
        calibrate_with_cancel(&objective, &seed, &options, &token)
    })?;

    let calibration = match job.wait() {
        Ok(calibration) => calibration,
        Err(e) if e.is_numerical() => {
            error!("Calibration did not converge: {}", e);
            warn!("Try more line groups, --principal-axis-seed or a center penalty");
            return Err(e.into());
        }
        Err(e) => {
            error!("Calibration failed: {}", e);
            return Err(e.into());
        }
    };

    let version = slot.replace(calibration.model.clone());
    info!("Installed estimate as model version {}", version);

    let estimate = slot.current();
    let corrected = estimate.undistort_point(&Vector2::new(0.0, 0.0));
    info!("Top-left corner maps to ({:.3}, {:.3})", corrected.x, corrected.y);

    if let Some(path) = &cli.output_rad {
        ensure_parent(path)?;
        RadFile::new(estimate.parameters().clone(), "plumb-line estimate").save(path)?;
        info!("Wrote {:?}", path);
    }
    if let Some(path) = &cli.report {
        ensure_parent(path)?;
        util::save_report(path, &calibration.report)?;
    }

    println!("\n=== PLUMB-LINE ESTIMATE ===");
    println!("  Lines / points: {} / {}", calibration.report.line_count, calibration.report.point_count);
    println!("  Center: ({:.4}, {:.4})", estimate.parameters().center_x, estimate.parameters().center_y);
    println!("  k1, k2: {:.6e}, {:.6e}", estimate.parameters().k1(), estimate.parameters().k2());
    println!("  RMS line distance: {:.6} px", calibration.report.rms_distance);
    println!("  Status: {}", calibration.report.status);
    println!("===========================");

    Ok(())
}
