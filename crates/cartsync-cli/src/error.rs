use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] cartsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    LogDirective(#[from] tracing_subscriber::filter::ParseError),
    #[error("Name cannot be empty")]
    EmptyName,
    #[error("No category named {0}")]
    UnknownCategory(String),
    #[error("The demo did not converge: {0}")]
    DemoFailed(String),
}
