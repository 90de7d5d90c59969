use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};
use xmpp_parsers::jid::BareJid;
use xmpp_parsers::minidom::Element;

use crate::{
    connection::{ConnectionEngine, ConnectionState},
    error::DispatchError,
    plugin::{PluginContext, StanzaPlugin},
    stanza::Stanza,
    transport::XmppTransport,
};

pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// Answers whether an entity advertises a protocol feature.
#[async_trait]
pub trait FeatureDiscovery: Send + Sync {
    async fn supports_feature(&self, jid: &BareJid, feature: &str) -> bool;
}

type FeatureCache = Arc<Mutex<HashMap<BareJid, HashSet<String>>>>;

/// XEP-0030 `disco#info` lookups with a per-session cache.
pub struct ServiceDiscovery<T>
where
    T: XmppTransport,
{
    engine: Arc<ConnectionEngine<T>>,
    cache: FeatureCache,
}

impl<T> ServiceDiscovery<T>
where
    T: XmppTransport,
{
    /// Create the discovery service and hook its cache into the engine's
    /// connection state, so a disconnect drops everything learned.
    pub fn new(engine: Arc<ConnectionEngine<T>>) -> Self {
        let cache = FeatureCache::default();
        engine.register_plugin(Arc::new(CacheInvalidator {
            cache: Arc::clone(&cache),
        }));
        Self { engine, cache }
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cached_features(&self, jid: &BareJid) -> Option<HashSet<String>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(jid)
            .cloned()
    }

    async fn fetch_features(&self, jid: &BareJid) -> Option<HashSet<String>> {
        let request = Stanza::iq(
            "get",
            Some(jid.to_string().as_str()),
            Element::builder("query", NS_DISCO_INFO).build(),
        );

        let response = match self.engine.send_query(request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(jid = %jid, error = %error, "service discovery failed");
                return None;
            }
        };

        let features = parse_features(&response);
        debug!(jid = %jid, count = features.len(), "discovered features");
        Some(features)
    }
}

#[async_trait]
impl<T> FeatureDiscovery for ServiceDiscovery<T>
where
    T: XmppTransport,
{
    async fn supports_feature(&self, jid: &BareJid, feature: &str) -> bool {
        if let Some(features) = self.cached_features(jid) {
            return features.contains(feature);
        }

        let Some(features) = self.fetch_features(jid).await else {
            return false;
        };
        let supported = features.contains(feature);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(jid.clone(), features);
        supported
    }
}

struct CacheInvalidator {
    cache: FeatureCache,
}

impl StanzaPlugin for CacheInvalidator {
    fn name(&self) -> &str {
        "disco-cache"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn handle_stanza(&self, _stanza: &Stanza, _ctx: &PluginContext) -> Result<bool, DispatchError> {
        Ok(false)
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        if state == ConnectionState::Disconnected {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }
}

fn parse_features(response: &Stanza) -> HashSet<String> {
    response
        .child_ns("query", NS_DISCO_INFO)
        .into_iter()
        .flat_map(Element::children)
        .filter(|child| child.name() == "feature")
        .filter_map(|child| child.attr("var"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ConnectionError;
    use crate::transport::{LogInRequest, TransportEvent};

    /// Answers nothing; tests feed responses through the engine.
    #[derive(Clone, Default)]
    struct CountingTransport {
        sent: Arc<Mutex<Vec<Stanza>>>,
        sends: Arc<AtomicUsize>,
    }

    impl XmppTransport for CountingTransport {
        async fn start(&self, _request: &LogInRequest) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn send(&self, stanza: &Stanza) -> Result<(), ConnectionError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(stanza.clone());
            Ok(())
        }

        async fn stop(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn info_result(id: &str, features: &[&str]) -> Stanza {
        let vars: String = features
            .iter()
            .map(|var| format!("<feature var='{var}'/>"))
            .collect();
        Stanza::parse(
            format!(
                "<iq xmlns='jabber:client' type='result' id='{id}'><query xmlns='{NS_DISCO_INFO}'><identity category='account' type='registered'/>{vars}</query></iq>"
            )
            .as_bytes(),
        )
        .unwrap()
    }

    async fn answer_next(
        transport: &CountingTransport,
        engine: &ConnectionEngine<CountingTransport>,
        features: &[&str],
    ) {
        for _ in 0..100 {
            let next = transport.sent.lock().unwrap().pop();
            if let Some(query) = next {
                assert!(query.child_ns("query", NS_DISCO_INFO).is_some());
                engine.on_stanza_received(info_result(query.id().unwrap(), features));
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("no discovery query was sent");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn caches_features_per_jid() {
        let transport = CountingTransport::default();
        let engine = Arc::new(ConnectionEngine::new(transport.clone()));
        let disco = Arc::new(ServiceDiscovery::new(Arc::clone(&engine)));
        let jid: BareJid = "alice@example.com".parse().unwrap();

        let lookup = tokio::spawn({
            let disco = Arc::clone(&disco);
            let jid = jid.clone();
            async move { disco.supports_feature(&jid, "urn:xmpp:mam:2").await }
        });
        answer_next(&transport, &engine, &["urn:xmpp:mam:2", "urn:xmpp:carbons:2"]).await;
        assert!(lookup.await.unwrap());

        assert!(disco.supports_feature(&jid, "urn:xmpp:carbons:2").await);
        assert!(!disco.supports_feature(&jid, "urn:xmpp:push:0").await);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_query_means_unsupported_and_is_not_cached() {
        let transport = CountingTransport::default();
        let engine = Arc::new(ConnectionEngine::new(transport.clone()));
        let disco = Arc::new(ServiceDiscovery::new(Arc::clone(&engine)));
        let jid: BareJid = "alice@example.com".parse().unwrap();

        let lookup = tokio::spawn({
            let disco = Arc::clone(&disco);
            let jid = jid.clone();
            async move { disco.supports_feature(&jid, "urn:xmpp:mam:2").await }
        });
        for _ in 0..100 {
            let next = transport.sent.lock().unwrap().pop();
            if let Some(query) = next {
                let id = query.id().unwrap();
                engine.on_stanza_received(
                    Stanza::parse(
                        format!("<iq xmlns='jabber:client' type='error' id='{id}'/>").as_bytes(),
                    )
                    .unwrap(),
                );
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!lookup.await.unwrap());
        assert!(disco.cached_features(&jid).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn logout_clears_cache() {
        let transport = CountingTransport::default();
        let engine = Arc::new(ConnectionEngine::new(transport.clone()));
        let disco = Arc::new(ServiceDiscovery::new(Arc::clone(&engine)));
        let jid: BareJid = "alice@example.com".parse().unwrap();

        let lookup = tokio::spawn({
            let disco = Arc::clone(&disco);
            let jid = jid.clone();
            async move { disco.supports_feature(&jid, "urn:xmpp:mam:2").await }
        });
        answer_next(&transport, &engine, &["urn:xmpp:mam:2"]).await;
        assert!(lookup.await.unwrap());
        assert!(disco.cached_features(&jid).is_some());

        engine.handle_transport_event(TransportEvent::Online("alice@example.com/desk".into()));
        engine.log_out().await;
        assert!(disco.cached_features(&jid).is_none());
    }
}
