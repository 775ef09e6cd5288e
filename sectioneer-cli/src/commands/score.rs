//! Score command - run a configured criterion against a stored image.
//!
//! Useful for tuning criterion parameters offline: score a few slice images
//! from a previous run, adjust the detail band, score again.

use std::path::PathBuf;

use clap::Args;
use console::style;
use sectioneer::criterion::CriterionEvaluator;
use sectioneer::{logging, Frame, Settings};

use crate::error::CliError;

/// Arguments for the score command.
#[derive(Args, Debug)]
pub struct ScoreArgs {
    /// Settings file providing the criterion definitions
    pub settings: PathBuf,

    /// Grayscale image to score
    pub image: PathBuf,

    /// Physical pixel size of the image in metres
    #[arg(long)]
    pub pixel_size: f64,

    /// Criterion name; defaults to the acquisition criterion
    #[arg(long)]
    pub criterion: Option<String>,
}

/// Run the score command.
pub fn run(args: ScoreArgs) -> Result<(), CliError> {
    let _guard = logging::init(None);

    let settings =
        Settings::load(&args.settings).map_err(|e| CliError::Config(e.to_string()))?;
    let name = args
        .criterion
        .unwrap_or_else(|| settings.acquisition.criterion_name.clone());
    let config = settings
        .find_criterion(&name)
        .ok_or_else(|| CliError::Config(format!("unknown criterion '{name}'")))?
        .clone();

    let frame = Frame::load_png(&args.image, args.pixel_size)
        .map_err(|e| CliError::Image(format!("cannot read {}: {e}", args.image.display())))?;

    let evaluator = CriterionEvaluator::new(config);
    let score = evaluator.score(&frame, None, None);

    println!(
        "{} {} = {score}",
        style(args.image.display().to_string()).cyan(),
        name
    );
    Ok(())
}
