use crate::{error::ConnectionError, stanza::Stanza};

/// Credentials and endpoint handed to the transport when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInRequest {
    pub jid: String,
    pub password: String,
    pub uri: Option<String>,
    pub domain: Option<String>,
}

impl LogInRequest {
    pub fn from_account(account: &tern_core::config::AccountConfig) -> Self {
        Self {
            jid: account.jid.clone(),
            password: account.password.clone(),
            uri: account.uri.clone(),
            domain: account.effective_domain(),
        }
    }
}

/// Lifecycle notifications pushed by a transport into the engine's run loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Error(String),
    Status { status: String, detail: Option<String> },
    /// Session bound; carries the full JID assigned by the server.
    Online(String),
    Stanza(Stanza),
}

/// Socket, TLS and SASL handling live behind this trait.
///
/// Implementations deliver [`TransportEvent`]s on the channel whose receiver
/// is handed to [`crate::ConnectionEngine::run`].
pub trait XmppTransport: Send + Sync + 'static {
    fn start(
        &self,
        request: &LogInRequest,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Queue a stanza for transmission. Resolves once the transport accepted it.
    fn send(&self, stanza: &Stanza) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn stop(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}
