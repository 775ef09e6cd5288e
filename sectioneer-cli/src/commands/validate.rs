//! Validate command - load a settings file and report what it defines.

use std::path::PathBuf;

use clap::Args;
use console::style;
use sectioneer::Settings;

use crate::error::CliError;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Settings file (YAML)
    pub settings: PathBuf,
}

/// Run the validate command.
pub fn run(args: ValidateArgs) -> Result<(), CliError> {
    let settings =
        Settings::load(&args.settings).map_err(|e| CliError::Config(e.to_string()))?;

    println!("{} {}", style("OK").green().bold(), args.settings.display());
    println!("Autofunctions: {}", settings.autofunction.autofunctions.len());
    for af in &settings.autofunction.autofunctions {
        println!(
            "  {} ({:?} sweep of {:?}, criterion '{}')",
            af.name, af.sweeping_strategy, af.variable, af.criterion_name
        );
    }
    println!("Criteria:      {}", settings.criterion_calculation.len());
    println!("Image presets: {}", settings.image.len());
    println!("Masks:         {}", settings.mask.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_settings_validate() {
        let example = concat!(env!("CARGO_MANIFEST_DIR"), "/../settings.example.yaml");
        run(ValidateArgs {
            settings: PathBuf::from(example),
        })
        .unwrap();
    }
}
