use std::{fmt, io, time::Duration};
use thiserror::Error;

/// The sequential steps of an image build.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildStep {
    Validate,
    Fetch,
    Configure,
    Declare,
    Commit,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStep::Validate => "validate",
            BuildStep::Fetch => "fetch",
            BuildStep::Configure => "configure",
            BuildStep::Declare => "declare",
            BuildStep::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid `{parameter}`: {reason}")]
    Config {
        parameter: &'static str,
        reason: String,
    },

    #[error("failed to fetch {url} at tag {tag}: {reason}")]
    Fetch {
        url: String,
        tag: String,
        reason: String,
    },

    #[error("fetching {url} at tag {tag} timed out after {timeout:?}")]
    FetchTimeout {
        url: String,
        tag: String,
        timeout: Duration,
    },

    #[error("{step} step failed: {reason}")]
    Image { step: BuildStep, reason: String },

    #[error("{step} step failed: {source}")]
    Io {
        step: BuildStep,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    pub fn config<R: Into<String>>(parameter: &'static str, reason: R) -> BuildError {
        BuildError::Config {
            parameter,
            reason: reason.into(),
        }
    }

    pub fn step(&self) -> BuildStep {
        match self {
            BuildError::Config { .. } => BuildStep::Validate,
            BuildError::Fetch { .. } | BuildError::FetchTimeout { .. } => BuildStep::Fetch,
            BuildError::Image { step, .. } | BuildError::Io { step, .. } => *step,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config { .. } => 3,
            BuildError::Fetch { .. } => 4,
            BuildError::FetchTimeout { .. } => 5,
            BuildError::Image { .. } => 6,
            BuildError::Io { .. } => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The container was created but its start command did not come up.
    #[error("container {name} failed to start: {reason}")]
    RuntimeStart { name: String, reason: String },

    #[error("container {name}: {reason}")]
    Backend { name: String, reason: String },
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::RuntimeStart { .. } => 7,
            LaunchError::Backend { .. } => 6,
        }
    }
}
