//! CLI error type.

use std::fmt;

#[derive(Debug)]
pub enum CliError {
    /// Settings problems and other user-facing misconfiguration.
    Config(String),
    /// Image file problems (score command).
    Image(String),
    /// Fatal engine errors surfaced from a run.
    Control(sectioneer::ControlError),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "{msg}"),
            CliError::Image(msg) => write!(f, "{msg}"),
            CliError::Control(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<sectioneer::ControlError> for CliError {
    fn from(e: sectioneer::ControlError) -> Self {
        CliError::Control(e)
    }
}
