//! Bootstrap failures and error chain rendering.

use std::error::Error;

use thiserror::Error;

use crate::engine::EngineError;

/// Why one torrent source could not be used.
#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error("not provided")]
    NotProvided,
    #[error("{}", display_chain(.0))]
    Rejected(EngineError),
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to start the engine client")]
    Client(#[source] EngineError),
    #[error("a valid magnet link or torrent file must be provided (magnet: {magnet}; file: {file})")]
    NoUsableSource {
        magnet: SourceFailure,
        file: SourceFailure,
    },
}

/// Renders an error and all of its sources as `outer: inner: root`.
pub fn display_chain(error: &dyn Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
