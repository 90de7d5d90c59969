pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use tern_xmpp::Stanza;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    /// Load a stanza fixture, replacing each `{key}` placeholder with its value.
    pub fn stanza_with(name: &str, values: &[(&str, &str)]) -> Stanza {
        let mut xml = stanza(name);
        for (key, value) in values {
            xml = xml.replace(&format!("{{{key}}}"), value);
        }
        Stanza::parse(xml.as_bytes())
            .unwrap_or_else(|error| panic!("fixture {name} is not a valid stanza: {error}"))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod transport {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use tern_xmpp::{ConnectionError, LogInRequest, Stanza, XmppTransport};
    use tokio::sync::mpsc;

    /// In-memory transport recording everything the engine sends.
    #[derive(Clone)]
    pub struct MockTransport {
        inner: Arc<Inner>,
    }

    struct Inner {
        sent: Mutex<Vec<Stanza>>,
        outbox_tx: mpsc::UnboundedSender<Stanza>,
        outbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stanza>>,
        started_with: Mutex<Option<LogInRequest>>,
        stopped: AtomicBool,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
            Self {
                inner: Arc::new(Inner {
                    sent: Mutex::new(Vec::new()),
                    outbox_tx,
                    outbox_rx: tokio::sync::Mutex::new(outbox_rx),
                    started_with: Mutex::new(None),
                    stopped: AtomicBool::new(false),
                    fail_sends: AtomicBool::new(false),
                }),
            }
        }

        /// Every stanza accepted so far, in send order.
        pub fn sent(&self) -> Vec<Stanza> {
            self.inner.sent.lock().unwrap().clone()
        }

        /// Wait for the next stanza the engine sends.
        pub async fn next_sent(&self) -> Stanza {
            self.inner
                .outbox_rx
                .lock()
                .await
                .recv()
                .await
                .expect("mock transport outbox closed")
        }

        /// A stanza already sent and not yet taken by [`Self::next_sent`].
        pub fn try_next_sent(&self) -> Option<Stanza> {
            self.inner.outbox_rx.try_lock().ok()?.try_recv().ok()
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.inner.fail_sends.store(fail, Ordering::SeqCst);
        }

        pub fn started_with(&self) -> Option<LogInRequest> {
            self.inner.started_with.lock().unwrap().clone()
        }

        pub fn is_stopped(&self) -> bool {
            self.inner.stopped.load(Ordering::SeqCst)
        }
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl XmppTransport for MockTransport {
        async fn start(&self, request: &LogInRequest) -> Result<(), ConnectionError> {
            *self.inner.started_with.lock().unwrap() = Some(request.clone());
            self.inner.stopped.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, stanza: &Stanza) -> Result<(), ConnectionError> {
            if self.inner.fail_sends.load(Ordering::SeqCst) {
                return Err(ConnectionError::TransportError(
                    "cannot send data while disconnected".to_string(),
                ));
            }
            self.inner.sent.lock().unwrap().push(stanza.clone());
            let _ = self.inner.outbox_tx.send(stanza.clone());
            Ok(())
        }

        async fn stop(&self) -> Result<(), ConnectionError> {
            self.inner.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}

pub mod discovery {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tern_xmpp::FeatureDiscovery;
    use tern_xmpp::jid::BareJid;

    /// Discovery answering from a fixed feature list, for every JID.
    #[derive(Default)]
    pub struct StaticDiscovery {
        features: HashSet<String>,
        lookups: AtomicUsize,
    }

    impl StaticDiscovery {
        pub fn with_features(features: &[&str]) -> Self {
            Self {
                features: features.iter().map(|f| f.to_string()).collect(),
                lookups: AtomicUsize::new(0),
            }
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FeatureDiscovery for StaticDiscovery {
        async fn supports_feature(&self, _jid: &BareJid, feature: &str) -> bool {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.features.contains(feature)
        }
    }
}

pub mod session {
    use std::sync::Arc;

    use tern_core::config::EventBusConfig;
    use tern_core::event::{BroadcastEventBus, EventBus};
    use tern_xmpp::{ConnectionEngine, ConnectionState, Stanza, TransportEvent};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::transport::MockTransport;

    /// A running engine over a [`MockTransport`], with its run loop spawned.
    pub struct TestSession {
        pub engine: Arc<ConnectionEngine<MockTransport>>,
        pub transport: MockTransport,
        pub bus: Arc<BroadcastEventBus>,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
        run: Option<JoinHandle<()>>,
    }

    impl TestSession {
        pub fn start() -> Self {
            let transport = MockTransport::new();
            let bus = Arc::new(BroadcastEventBus::from_config(&EventBusConfig::default()));
            let engine = Arc::new(ConnectionEngine::with_event_bus(
                transport.clone(),
                Arc::clone(&bus) as Arc<dyn EventBus>,
            ));
            let (events, receiver) = mpsc::unbounded_channel();
            let run = tokio::spawn(Arc::clone(&engine).run(receiver));

            Self {
                engine,
                transport,
                bus,
                events: Some(events),
                run: Some(run),
            }
        }

        pub fn send_event(&self, event: TransportEvent) {
            if let Some(events) = &self.events {
                events.send(event).expect("engine run loop stopped");
            }
        }

        /// Report the session bound as `full_jid` and wait until the engine is online.
        pub async fn go_online(&self, full_jid: &str) {
            let mut state = self.engine.subscribe_state();
            self.send_event(TransportEvent::Online(full_jid.to_string()));
            state
                .wait_for(|state| *state == ConnectionState::Online)
                .await
                .expect("engine state channel closed");
        }

        /// Hand a stanza straight to the engine's dispatcher.
        pub fn deliver(&self, stanza: Stanza) {
            self.engine.on_stanza_received(stanza);
        }

        /// Close the transport event channel and wait for the run loop to exit.
        pub async fn close_transport(&mut self) {
            self.events.take();
            if let Some(run) = self.run.take() {
                run.await.expect("engine run loop panicked");
            }
        }
    }
}

pub use discovery::StaticDiscovery;
pub use session::TestSession;
pub use transport::MockTransport;
