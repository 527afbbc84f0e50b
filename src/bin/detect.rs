//! Command-line front end: detect regions in one image and print them as JSON lines.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nudenet::{Detection, Detector, DetectorConfig, Mode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image file to scan
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Size policy: fast (320px) or accurate (800-1333px)
    #[arg(long, default_value = "fast")]
    mode: Mode,

    /// Minimum class score for a detection to be reported
    #[arg(long, value_name = "PROB")]
    min_prob: Option<f32>,

    /// JSON detector configuration; defaults come from the environment
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only report exposed-region labels
    #[arg(long)]
    exposed_only: bool,

    /// Run N timed detections after one warm-up run and print latency stats
    #[arg(long, value_name = "N")]
    repeat: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Some(min_prob) = args.min_prob {
        anyhow::ensure!((0.0..=1.0).contains(&min_prob), "--min-prob must be within [0, 1]");
    }

    let config = match &args.config {
        Some(path) => DetectorConfig::from_json_file(path)?,
        None => DetectorConfig::from_env(),
    };
    info!(model = %config.model_path.display(), classes = %config.classes_path.display(), mode = %args.mode, "starting detector");

    let detector = Detector::new(config);

    match args.repeat {
        Some(runs) => benchmark(&detector, &args, runs),
        None => {
            let detections = detector
                .detect_from_path(&args.image, args.mode, args.min_prob)
                .with_context(|| format!("detection failed for {}", args.image.display()))?;
            print_detections(&detections, args.exposed_only)
        }
    }
}

fn print_detections(detections: &[Detection], exposed_only: bool) -> Result<()> {
    for detection in detections
        .iter()
        .filter(|d| !exposed_only || d.label().is_exposed())
    {
        println!("{}", serde_json::to_string(detection)?);
    }
    Ok(())
}

fn benchmark<E: nudenet::InferenceEngine>(detector: &Detector<E>, args: &Args, runs: usize) -> Result<()> {
    anyhow::ensure!(runs > 0, "--repeat must be at least 1");

    // Warm-up pays the session and class list load
    let warmup = Instant::now();
    detector.detect_from_path(&args.image, args.mode, args.min_prob)?;
    println!("warm-up: {:.1}ms", warmup.elapsed().as_secs_f64() * 1000.0);

    let mut times = Vec::with_capacity(runs);
    for run in 1..=runs {
        let start = Instant::now();
        let detections = detector.detect_from_path(&args.image, args.mode, args.min_prob)?;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        println!("run {run}: {elapsed:.1}ms ({} detections)", detections.len());
        times.push(elapsed);
    }

    let avg = times.iter().sum::<f64>() / times.len() as f64;
    let min = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    println!("average: {avg:.1}ms");
    println!("min:     {min:.1}ms");
    println!("max:     {max:.1}ms");
    Ok(())
}
