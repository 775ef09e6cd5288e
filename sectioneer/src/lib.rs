//! Sectioneer - acquisition control for automated serial-sectioning
//! microscopy.
//!
//! The engine drives an ion/electron dual-beam instrument through an
//! unattended slice-and-image run: mill a slice, correct the electron
//! column for the removed material, run any scheduled optimization
//! ("autofunction") passes, acquire and store the slice image, and score
//! its resolution in the background. The hardware sits behind the
//! [`microscope::Microscope`] trait; [`microscope::VirtualMicroscope`]
//! provides a synthetic instrument for development and tests.
//!
//! # Module map
//!
//! - [`controller`] - per-slice state machine tying everything together
//! - [`scheduler`] - autofunction firing, FIFO queue, attempt limits
//! - [`autofunction`] - full / stepped / line-interlaced optimization passes
//! - [`sweep`] - candidate-value generation (basic, interleaved, spiral)
//! - [`criterion`] - image-quality scoring (bandpass, FFT, FRC)
//! - [`mask`] - region masking for scoring and drift tracking
//! - [`microscope`] - instrument abstraction and the virtual instrument
//! - [`config`] - the YAML settings tree, re-read every slice
//! - [`escalation`] - fault routing: email, cooperative stop, fatal error
//! - [`telemetry`] - per-slice records and run counters
//! - [`frame`] / [`geom`] - acquired images and coordinate primitives

pub mod autofunction;
pub mod config;
pub mod controller;
pub mod criterion;
pub mod escalation;
pub mod frame;
pub mod geom;
pub mod logging;
pub mod mask;
pub mod microscope;
pub mod scheduler;
pub mod sweep;
pub mod telemetry;

pub use config::Settings;
pub use controller::{ControlError, SliceCycleController};
pub use escalation::StopFlag;
pub use frame::Frame;

/// Crate version, for CLI banners.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
