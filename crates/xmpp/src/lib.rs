pub mod connection;
pub mod disco;
pub mod error;
pub mod plugin;
pub mod stanza;
pub mod transport;

pub use connection::{ConnectionEngine, ConnectionState};
pub use disco::{FeatureDiscovery, NS_DISCO_INFO, ServiceDiscovery};
pub use error::{ConnectionError, DispatchError, QueryError, StanzaError};
pub use plugin::{DispatchOutcome, PluginChain, PluginContext, StanzaPlugin};
pub use stanza::{Stanza, StanzaKind};
pub use transport::{LogInRequest, TransportEvent, XmppTransport};
pub use xmpp_parsers::{jid, minidom};
