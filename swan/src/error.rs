// Copyright (c) Facebook, Inc. and its affiliates.
use swan_intf::{EX_IOERR, EX_SOFTWARE, EX_USAGE};

/// Failure classes callers have to tell apart. These travel inside
/// `anyhow::Error` and are recovered with `downcast_ref()`.
#[derive(Debug, thiserror::Error)]
pub enum SwanError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("insufficient CPUs: {0}")]
    InsufficientCpus(String),
    #[error("{0} did not become live within {1:?}")]
    Liveness(String, std::time::Duration),
    #[error("load run failed: {0}")]
    LoadRun(String),
    #[error("cannot parse {0}: {1}")]
    Parse(String, String),
    #[error("telemetry session failed: {0}")]
    Telemetry(String),
    #[error("metadata store: {0}")]
    Metadata(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl SwanError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EX_USAGE,
            Self::Io(_) | Self::Metadata(_) => EX_IOERR,
            _ => EX_SOFTWARE,
        }
    }
}

pub fn is_config_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SwanError>(), Some(SwanError::Config(_)))
}

/// Exit status for an error which ended the run.
pub fn exit_code_of(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<SwanError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return EX_IOERR;
        }
    }
    EX_SOFTWARE
}

/// Keeps the first error and logs the ones that follow.
#[derive(Debug, Default)]
pub struct ErrorCollection {
    first: Option<anyhow::Error>,
    rest: Vec<String>,
}

impl ErrorCollection {
    pub fn add(&mut self, err: anyhow::Error) {
        match self.first {
            None => self.first = Some(err),
            Some(_) => {
                log::error!("{:#}", &err);
                self.rest.push(format!("{:#}", &err));
            }
        }
    }

    pub fn add_result<T>(&mut self, res: anyhow::Result<T>) {
        if let Err(e) = res {
            self.add(e);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn nr_errors(&self) -> usize {
        self.first.iter().count() + self.rest.len()
    }

    /// Returns the first error with the later ones attached as context.
    pub fn into_result(self) -> anyhow::Result<()> {
        match self.first {
            None => Ok(()),
            Some(first) if self.rest.is_empty() => Err(first),
            Some(first) => {
                let others = self.rest.join("; ");
                Err(first.context(format!("followed by: {}", others)))
            }
        }
    }
}
