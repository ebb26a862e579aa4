use std::borrow::Cow;
use thiserror::Error;

/// Errors surfaced to callers of the discovery responder and engine.
///
/// Only configuration problems and a total failure to bind sockets are reported this way.
/// Everything that goes wrong per socket or per discovered server is logged and isolated instead.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Invalid parameters, rejected before any socket is opened.
    #[error("Invalid discovery configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// None of the requested sockets could be bound.
    #[error("Couldn't bind any discovery socket for the requested address families")]
    NoSocketsBound,

    /// A discovery session is already in progress on this engine.
    #[error("Discovery is already running")]
    AlreadyRunning,

    /// The engine was disposed and can't start new sessions.
    #[error("Discovery engine has been disposed")]
    Disposed,

    /// Unexpected internal error.
    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl DiscoveryError {
    pub(crate) const fn configuration(message: &'static str) -> Self {
        Self::Configuration(Cow::Borrowed(message))
    }
}
