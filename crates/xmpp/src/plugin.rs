use std::sync::{Arc, PoisonError, RwLock};

use xmpp_parsers::jid::{BareJid, Jid};

use crate::{connection::ConnectionState, error::DispatchError, stanza::Stanza};

/// Session facts handed to every plugin invocation.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    pub local_jid: Option<Jid>,
}

impl PluginContext {
    pub fn local_bare_jid(&self) -> Option<BareJid> {
        self.local_jid.as_ref().map(Jid::to_bare)
    }
}

/// An optional protocol feature observing the inbound stanza stream.
///
/// Plugins only see stanzas the engine did not route itself (errors, body
/// messages and query responses never reach them).
pub trait StanzaPlugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Lower values run first. Plugins with equal priority run in registration order.
    fn priority(&self) -> i32;

    /// `Ok(true)` claims the stanza and stops the chain. An `Err` also stops
    /// the chain; the engine reports it and moves on to the next stanza.
    fn handle_stanza(&self, stanza: &Stanza, ctx: &PluginContext) -> Result<bool, DispatchError>;

    fn on_connection_state_changed(&self, _state: ConnectionState) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Claimed { plugin: String },
    Unclaimed,
}

#[derive(Default)]
pub struct PluginChain {
    plugins: RwLock<Vec<Arc<dyn StanzaPlugin>>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn StanzaPlugin>) {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        plugins.push(plugin);
        plugins.sort_by_key(|p| p.priority());
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plugin names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }

    pub fn dispatch(
        &self,
        stanza: &Stanza,
        ctx: &PluginContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        for plugin in self.snapshot() {
            match plugin.handle_stanza(stanza, ctx) {
                Ok(true) => {
                    return Ok(DispatchOutcome::Claimed {
                        plugin: plugin.name().to_string(),
                    });
                }
                Ok(false) => continue,
                Err(error) => {
                    return Err(DispatchError::PluginFailed {
                        plugin: plugin.name().to_string(),
                        message: error.to_string(),
                    });
                }
            }
        }
        Ok(DispatchOutcome::Unclaimed)
    }

    pub fn notify_state(&self, state: ConnectionState) {
        for plugin in self.snapshot() {
            plugin.on_connection_state_changed(state);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn StanzaPlugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
