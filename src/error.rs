use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

use crate::core::backend::BackendError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration at {path} is invalid: {message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("The configuration path {path} does not exist or is not readable.")]
    ExplicitConfigMissing { path: PathBuf },
    #[error("Failed to power off VM `{vm}`: {source}")]
    PowerOffFailed {
        vm: String,
        #[source]
        source: BackendError,
    },
    #[error("Shutdown of VM `{vm}` was abandoned before it reported completion.")]
    Abandoned { vm: String },
    #[error("{message}")]
    Usage { message: String },
    #[error("Failed to start the event loop: {source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::ReadConfig { .. } => ExitCode::from(74),
            Self::ParseConfig { .. } => ExitCode::from(65),
            Self::InvalidConfig { .. } => ExitCode::from(65),
            Self::ExplicitConfigMissing { .. } => ExitCode::from(66),
            Self::PowerOffFailed { .. } => ExitCode::from(69),
            Self::Abandoned { .. } => ExitCode::from(75),
            Self::Usage { .. } => ExitCode::from(64),
            Self::Runtime { .. } => ExitCode::from(71),
        }
    }
}
