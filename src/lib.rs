//! expbuddy: hyperparameter capture, command-line overrides and run tracking
//! for machine-learning experiments.
//!
//! A typical script builds its parameters in a [`ParameterBlock`], registers
//! them (which merges `--name=value` overrides), then asks the
//! [`Dispatcher`] for a [`RunReporter`] to log against.

pub mod backend;
pub mod capture;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod git;
pub mod logging;
pub mod models;
pub mod overrides;
pub mod params;
pub mod prompt;
pub mod remote;
pub mod reporter;
pub mod storage;

pub use backend::{LocalBackend, MemoryBackend, RenderedFigure, TrackingBackend};
pub use capture::{ParameterBlock, Scope};
pub use config::BuddyConfig;
pub use deploy::{DeployOptions, Deployment, Dispatcher, Environment};
pub use error::{BuddyError, Result};
pub use models::{HistogramInput, ParamKind, ParamValue, RunConfig, RunStatus};
pub use overrides::{OverrideEntry, Registry};
pub use params::{Binding, ExtraModule, HyperparameterSet, ESCAPE_PREFIX};
pub use reporter::{Figure, RunContext, RunReporter};
