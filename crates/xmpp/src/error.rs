use thiserror::Error;

use crate::stanza::Stanza;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("session closed")]
    SessionClosed,
}

/// Outcome of a request/response exchange that did not produce a `result`.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query rejected by peer (id {})", .0.id().unwrap_or("?"))]
    Rejected(Box<Stanza>),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("plugin {plugin} failed: {message}")]
    PluginFailed { plugin: String, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StanzaError {
    #[error("<{stanza}/> is missing child <{child}/>")]
    MissingChild { stanza: &'static str, child: String },

    #[error("<{stanza}/> is missing attribute '{attribute}'")]
    MissingAttribute {
        stanza: &'static str,
        attribute: String,
    },
}

impl From<StanzaError> for DispatchError {
    fn from(error: StanzaError) -> Self {
        DispatchError::Protocol(error.to_string())
    }
}
