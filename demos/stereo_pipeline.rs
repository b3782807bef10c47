//! Stereo Pipeline Demo
//!
//! Runs the calibrate -> rectify -> disparity pipeline on a capture directory,
//! or end to end on generated data.
//!
//! Usage:
//! ```bash
//! # calibrate from left%03d.png/right%03d.png pairs or a capture_log.csv
//! cargo run --release --example stereo_pipeline -- calibrate \
//!   --dir calib_images --output stereo_calib.yaml
//!
//! # rectify one pair and compute its disparity
//! cargo run --release --example stereo_pipeline -- disparity \
//!   --calibration stereo_calib.yaml --left left000.png --right right000.png --output out
//!
//! # synthetic rig, no input needed
//! cargo run --release --example stereo_pipeline -- synthetic
//! ```

use clap::{Parser, Subcommand};
use image::GrayImage;
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use stereo_rig_tools::synthetic::{self, SyntheticRig};
use stereo_rig_tools::{CalibrationArtifact, CalibrationSession, Resolution, RigConfig, StereoRig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional YAML configuration; defaults are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate the rig from a directory of captured pairs
    Calibrate {
        #[arg(short, long)]
        dir: PathBuf,
        /// Artifact path (.yaml, .yml or .json)
        #[arg(short, long, default_value = "stereo_calib.yaml")]
        output: PathBuf,
    },
    /// Rectify a raw pair and compute its disparity map
    Disparity {
        #[arg(long)]
        calibration: PathBuf,
        #[arg(short, long)]
        left: PathBuf,
        #[arg(short, long)]
        right: PathBuf,
        /// Directory for the rectified images and the disparity visualization
        #[arg(short, long, default_value = "output")]
        output: PathBuf,
    },
    /// Run the whole pipeline on a generated rig and report its accuracy
    Synthetic {
        /// Directory for the rendered and rectified images
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// One row of the capture log written by the collector.
#[derive(Debug, Deserialize)]
struct CaptureRecord {
    left_image: String,
    right_image: String,
    #[allow(dead_code)]
    distance_m: Option<f64>,
}

/// Image pairs listed in `capture_log.csv`, or `left%03d.png`/`right%03d.png`.
fn capture_pairs(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, Box<dyn std::error::Error>> {
    let log_path = dir.join("capture_log.csv");
    if log_path.exists() {
        let mut reader = csv::Reader::from_path(&log_path)?;
        let mut pairs = Vec::new();
        for record in reader.deserialize() {
            let record: CaptureRecord = record?;
            pairs.push((dir.join(record.left_image), dir.join(record.right_image)));
        }
        info!("{} pairs listed in {}", pairs.len(), log_path.display());
        return Ok(pairs);
    }

    let mut pairs = Vec::new();
    for index in 0.. {
        let left = dir.join(format!("left{:03}.png", index));
        let right = dir.join(format!("right{:03}.png", index));
        if !left.exists() || !right.exists() {
            break;
        }
        pairs.push((left, right));
    }
    info!("{} numbered pairs found in {}", pairs.len(), dir.display());
    Ok(pairs)
}

fn load_gray(path: &Path) -> Result<GrayImage, Box<dyn std::error::Error>> {
    Ok(image::open(path)?.to_luma8())
}

fn calibrate(
    config: RigConfig,
    dir: &Path,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let paths = capture_pairs(dir)?;
    let mut images = Vec::with_capacity(paths.len());
    for (left, right) in &paths {
        match (load_gray(left), load_gray(right)) {
            (Ok(l), Ok(r)) => images.push((l, r)),
            _ => warn!("could not read {} / {}, skipping", left.display(), right.display()),
        }
    }
    let first = images.first().ok_or("no readable image pairs")?;
    let image_size = Resolution::new(first.0.width(), first.0.height());

    let mut session = CalibrationSession::new(config, image_size)?;
    let start = Instant::now();
    let kept = session.add_image_batch(&images);
    println!("Pattern found in {} of {} pairs", kept, images.len());

    let result = session.calibrate()?;
    println!("Left RMS:   {:.4} px", result.left.rms);
    println!("Right RMS:  {:.4} px", result.right.rms);
    println!("Stereo RMS: {:.4} px", result.stereo.rms);
    println!("Baseline:   {:.4} m", result.stereo.extrinsics.baseline());
    println!("Rectified focal length: {:.2} px", result.rectification.focal_length());
    result.to_artifact().save(output)?;
    println!(
        "Calibration saved to {} ({:.2} s)",
        output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn disparity(
    config: RigConfig,
    calibration: &Path,
    left: &Path,
    right: &Path,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let rig = StereoRig::load(calibration, config.disparity)?;
    let (left, right) = (load_gray(left)?, load_gray(right)?);

    let start = Instant::now();
    let (rect_left, rect_right) = rig.rectify_pair(&left, &right)?;
    let map = stereo_rig_tools::stereo::compute(&rect_left, &rect_right, rig.disparity_params())?;
    println!(
        "Disparity: {} of {} pixels valid ({:.2} s)",
        map.valid_count(),
        map.width * map.height,
        start.elapsed().as_secs_f64()
    );

    fs::create_dir_all(output)?;
    rect_left.save(output.join("rect_left.png"))?;
    rect_right.save(output.join("rect_right.png"))?;
    map.to_image().save(output.join("disparity.png"))?;
    println!("Results written to {}", output.display());
    Ok(())
}

fn run_synthetic(config: RigConfig, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let rig = SyntheticRig::default();
    let mut session = CalibrationSession::new(config.clone(), rig.resolution)?;
    for pair in synthetic::observe_pairs(&rig, session.pattern(), 0.1, 7) {
        session.add_pair(Some(pair.left), Some(pair.right));
    }
    let result = session.calibrate()?;
    println!("Calibrated from {} synthetic pairs", session.pairs().len());
    println!("Stereo RMS: {:.4} px", result.stereo.rms);
    println!(
        "Baseline:   {:.5} m (true {:.5} m)",
        result.stereo.extrinsics.baseline(),
        rig.extrinsics.baseline()
    );

    let artifact: CalibrationArtifact = result.to_artifact();
    let mut params = config.disparity;
    params.num_disparities = 32;
    let stereo_rig = StereoRig::from_artifact(&artifact, params)?;

    let depth = 1.0;
    let (left, right) = synthetic::render_plane_pair(&rig, depth, 5);
    let map = stereo_rig.compute_disparity(&left, &right)?;
    let points = stereo_rig.rectification().reproject_disparity_map(&map);
    let depths: Vec<f64> = points.iter().flatten().map(|p| p.z).collect();
    if depths.is_empty() {
        return Err("no valid disparities".into());
    }
    let mean = depths.iter().sum::<f64>() / depths.len() as f64;
    println!(
        "Plane at {:.2} m: {} valid pixels, mean depth {:.4} m",
        depth,
        depths.len(),
        mean
    );

    if let Some(dir) = output {
        fs::create_dir_all(dir)?;
        let (rect_left, rect_right) = stereo_rig.rectify_pair(&left, &right)?;
        left.save(dir.join("left000.png"))?;
        right.save(dir.join("right000.png"))?;
        rect_left.save(dir.join("rect_left.png"))?;
        rect_right.save(dir.join("rect_right.png"))?;
        map.to_image().save(dir.join("disparity.png"))?;
        artifact.save(dir.join("stereo_calib.yaml"))?;
        println!("Images written to {}", dir.display());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RigConfig::load_from_yaml(path)?,
        None => RigConfig::default(),
    };

    match &cli.command {
        Command::Calibrate { dir, output } => calibrate(config, dir, output),
        Command::Disparity {
            calibration,
            left,
            right,
            output,
        } => disparity(config, calibration, left, right, output),
        Command::Synthetic { output } => run_synthetic(config, output.as_deref()),
    }
}
