//! Run command - start an acquisition run against the virtual instrument.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use console::style;
use sectioneer::escalation::{AcknowledgeGate, AutoAcknowledge, LogEmail};
use sectioneer::microscope::VirtualMicroscope;
use sectioneer::{logging, Settings, SliceCycleController};
use tracing::{info, warn};

use crate::error::CliError;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Settings file (YAML), re-read at the start of every slice
    pub settings: PathBuf,

    /// Slice number to start from
    #[arg(long, default_value_t = 0)]
    pub start_slice: u64,

    /// Acknowledge escalations automatically instead of prompting
    #[arg(long)]
    pub unattended: bool,
}

/// Blocks the run on an operator confirmation after an escalation.
struct PromptGate;

impl AcknowledgeGate for PromptGate {
    fn wait_for_acknowledgement(&self, message: &str) {
        eprintln!("{}", style(message).yellow().bold());
        let _ = dialoguer::Confirm::new()
            .with_prompt("Acknowledge and continue")
            .default(true)
            .interact();
    }
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let settings =
        Settings::load(&args.settings).map_err(|e| CliError::Config(e.to_string()))?;
    fs::create_dir_all(&settings.dirs.log)
        .map_err(|e| CliError::Config(format!("cannot create log directory: {e}")))?;
    let _guard = logging::init(Some(&settings.dirs.log));

    let gate: Box<dyn AcknowledgeGate> = if args.unattended {
        Box::new(AutoAcknowledge)
    } else {
        Box::new(PromptGate)
    };
    let mut controller = SliceCycleController::new(
        args.settings.clone(),
        Box::new(VirtualMicroscope::new()),
        Box::new(LogEmail),
        gate,
    )?;

    let stop = controller.stop_flag();
    ctrlc::set_handler(move || {
        warn!("stop requested, finishing the current step");
        stop.trigger();
    })
    .map_err(|e| CliError::Config(format!("cannot install signal handler: {e}")))?;

    println!("{} v{}", style("Sectioneer").cyan().bold(), sectioneer::VERSION);
    println!("Settings:      {}", args.settings.display());
    println!("Start slice:   {}", args.start_slice);
    println!("Autofunctions: {}", controller.autofunction_names().join(", "));
    println!("Images:        {}", settings.dirs.output_images.display());
    println!("Logs:          {}", settings.dirs.log.display());
    println!();

    info!(
        settings = %args.settings.display(),
        start_slice = args.start_slice,
        unattended = args.unattended,
        "starting acquisition run"
    );
    controller.run(args.start_slice)?;

    let snapshot = controller.metrics().snapshot();
    info!(
        slices_completed = snapshot.slices_completed,
        autofunction_runs = snapshot.autofunction_runs,
        escalations = snapshot.escalations,
        "acquisition run finished"
    );
    println!();
    println!(
        "{} slices: {}, autofunction passes: {}, escalations: {}",
        style("Run finished.").green().bold(),
        snapshot.slices_completed,
        snapshot.autofunction_runs,
        snapshot.escalations
    );
    Ok(())
}
