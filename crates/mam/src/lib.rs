pub mod notify;
pub mod plugin;
pub mod query;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tern_core::config::MamConfig;
use tern_core::contact::{ContactStore, Recipient};
use tern_core::event::{self, EventBus, EventPayload, EventSource};
use tern_xmpp::jid::BareJid;
use tern_xmpp::{
    ConnectionEngine, ConnectionError, ConnectionState, FeatureDiscovery, QueryError, Stanza,
    XmppTransport,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use notify::{HISTORY_CHANGED_CHANNEL, HistoryNotifier};
pub use plugin::{ArchiveResultPlugin, RoomMessageHandler, stable_message_id};
pub use query::{ArchivePage, ArchiveQuery, NS_MAM, PageRequest};

#[derive(Debug, thiserror::Error)]
pub enum MamError {
    #[error("MAM not supported by server")]
    UnsupportedFeature,

    #[error("MAM query failed: {0}")]
    Query(#[from] QueryError),

    #[error("MAM protocol error: {0}")]
    Protocol(String),

    #[error("MAM query timed out after {0}s")]
    Timeout(u64),
}

/// Keeps local conversations in step with the server-side message archive.
pub struct MessageArchive<T>
where
    T: XmppTransport,
{
    engine: Arc<ConnectionEngine<T>>,
    discovery: Arc<dyn FeatureDiscovery>,
    config: MamConfig,
    event_bus: Option<Arc<dyn EventBus>>,
    delivered: Arc<AtomicU64>,
    _notifier: HistoryNotifier,
}

impl<T> MessageArchive<T>
where
    T: XmppTransport,
{
    /// Register the archive-result plugin on `engine` and start the
    /// history-changed debouncer. Must be called inside a Tokio runtime.
    pub fn new(
        engine: Arc<ConnectionEngine<T>>,
        discovery: Arc<dyn FeatureDiscovery>,
        contacts: Arc<dyn ContactStore>,
        rooms: Arc<dyn RoomMessageHandler>,
        config: MamConfig,
    ) -> Self {
        let event_bus = engine.event_bus().cloned();
        let (notifier, _task) = HistoryNotifier::spawn(event_bus.clone(), config.history_debounce());
        let plugin = ArchiveResultPlugin::new(contacts, rooms, notifier.clone());
        let delivered = plugin.delivered_counter();
        engine.register_plugin(Arc::new(plugin));

        Self {
            engine,
            discovery,
            config,
            event_bus,
            delivered,
            _notifier: notifier,
        }
    }

    pub fn engine(&self) -> &Arc<ConnectionEngine<T>> {
        &self.engine
    }

    /// Catch up with the archive every time the session comes online.
    ///
    /// Returns once the engine is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut state = self.engine.subscribe_state();
        loop {
            // The engine only signals real changes, so observing Online here
            // means a fresh transition into it.
            let online = *state.borrow_and_update() == ConnectionState::Online;
            if online {
                self.catch_up().await;
            }

            if state.changed().await.is_err() {
                debug!("connection state channel closed, archive sync stopping");
                return;
            }
        }
    }

    async fn catch_up(&self) {
        match self.request_newest_messages().await {
            Ok(page) => info!(complete = page.complete, "archive catch-up complete"),
            Err(MamError::UnsupportedFeature) => {
                info!("server does not support MAM, skipping catch-up");
            }
            Err(MamError::Timeout(secs)) => warn!(secs, "archive catch-up timed out"),
            Err(e) => error!(error = %e, "archive catch-up failed"),
        }
    }

    /// Fetch the newest page of the whole archive.
    pub async fn request_newest_messages(&self) -> Result<ArchivePage, MamError> {
        self.ensure_supported().await?;

        let correlation_id = Uuid::new_v4();
        self.emit_sync_started(correlation_id);
        let before = self.delivered.load(Ordering::Relaxed);

        let page = self
            .query(
                ArchiveQuery::new()
                    .max(self.config.catch_up_page_size)
                    .last_page(),
            )
            .await?;

        self.emit_sync_completed(self.delivered_since(before), correlation_id);
        Ok(page)
    }

    /// Fetch the page of history just older than what `recipient` already holds.
    pub async fn load_most_recent_unloaded_messages(
        &self,
        recipient: &Recipient,
    ) -> Result<ArchivePage, MamError> {
        self.ensure_supported().await?;

        let mut query = match recipient {
            Recipient::Contact(contact) => ArchiveQuery::new().with(contact.jid()),
            Recipient::Room(room) => ArchiveQuery::new().to(room.jid()),
        };
        if let Some(oldest) = recipient.oldest_message() {
            query = query.end(oldest.timestamp);
        }

        debug!(jid = recipient.jid(), "loading older archived messages");
        self.query(query.max(self.config.history_page_size).last_page())
            .await
    }

    /// Walk the entire archive forward, page by page. Returns the number of
    /// pages fetched.
    pub async fn load_all_messages(&self) -> Result<usize, MamError> {
        self.ensure_supported().await?;

        let correlation_id = Uuid::new_v4();
        self.emit_sync_started(correlation_id);
        let before = self.delivered.load(Ordering::Relaxed);

        let mut page = self.query(ArchiveQuery::new()).await?;
        let mut pages = 1;
        let mut previous_cursor: Option<String> = None;

        while !page.complete {
            let cursor = page.last.take().ok_or_else(|| {
                MamError::Protocol("incomplete archive page without <last/> cursor".to_string())
            })?;
            if previous_cursor.as_deref() == Some(cursor.as_str()) {
                return Err(MamError::Protocol(format!(
                    "archive cursor did not advance past {cursor}"
                )));
            }

            debug!(cursor = %cursor, pages, "requesting next archive page");
            page = self
                .query(
                    ArchiveQuery::new()
                        .max(self.config.full_sync_page_size)
                        .after(cursor.clone()),
                )
                .await?;
            previous_cursor = Some(cursor);
            pages += 1;
        }

        let messages_synced = self.delivered_since(before);
        info!(pages, messages_synced, "full archive sync complete");
        self.emit_sync_completed(messages_synced, correlation_id);
        Ok(pages)
    }

    async fn ensure_supported(&self) -> Result<(), MamError> {
        let account = self.account_jid()?;
        if self.discovery.supports_feature(&account, NS_MAM).await {
            Ok(())
        } else {
            Err(MamError::UnsupportedFeature)
        }
    }

    fn account_jid(&self) -> Result<BareJid, MamError> {
        self.engine
            .local_bare_jid()
            .ok_or(MamError::Query(QueryError::Connection(
                ConnectionError::SessionClosed,
            )))
    }

    async fn query(&self, query: ArchiveQuery) -> Result<ArchivePage, MamError> {
        let response = self
            .with_timeout(self.engine.send_query(query.into_stanza()))
            .await??;
        ArchivePage::from_response(&response)
    }

    async fn with_timeout<F>(&self, future: F) -> Result<F::Output, MamError>
    where
        F: Future<Output = Result<Stanza, QueryError>>,
    {
        tokio::time::timeout(self.config.query_timeout(), future)
            .await
            .map_err(|_| MamError::Timeout(self.config.query_timeout_secs))
    }

    fn delivered_since(&self, before: u64) -> u64 {
        self.delivered
            .load(Ordering::Relaxed)
            .saturating_sub(before)
    }

    fn emit_sync_started(&self, correlation_id: Uuid) {
        if let Some(bus) = &self.event_bus {
            event::emit_correlated(
                bus.as_ref(),
                "system.sync.started",
                EventSource::System("mam".into()),
                EventPayload::SyncStarted,
                correlation_id,
            );
        }
    }

    fn emit_sync_completed(&self, messages_synced: u64, correlation_id: Uuid) {
        if let Some(bus) = &self.event_bus {
            event::emit_correlated(
                bus.as_ref(),
                "system.sync.completed",
                EventSource::System("mam".into()),
                EventPayload::SyncCompleted { messages_synced },
                correlation_id,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use tern_core::contact::{Contact, Direction, InMemoryContactStore, Message, Room};
    use tern_core::event::Event;
    use tern_test_support::{MockTransport, StaticDiscovery, TestSession, fixtures};
    use tern_xmpp::minidom::Element;
    use tern_xmpp::DispatchError;
    use tracing_test::traced_test;

    use super::*;
    use crate::query::{NS_DATA_FORMS, NS_RSM};

    #[derive(Default)]
    struct Rooms {
        messages: Mutex<Vec<String>>,
    }

    impl RoomMessageHandler for Rooms {
        fn handle_room_message_stanza(
            &self,
            message: &Element,
            _delay: Option<&Element>,
        ) -> Result<(), DispatchError> {
            self.messages
                .lock()
                .unwrap()
                .push(message.attr("id").unwrap_or_default().to_string());
            Ok(())
        }
    }

    struct Fixture {
        session: TestSession,
        archive: Arc<MessageArchive<MockTransport>>,
        contacts: Arc<InMemoryContactStore>,
        discovery: Arc<StaticDiscovery>,
    }

    async fn fixture_with(features: &[&str]) -> Fixture {
        let session = TestSession::start();
        session.go_online("alice@example.com/desk").await;
        let contacts = Arc::new(InMemoryContactStore::new());
        let discovery = Arc::new(StaticDiscovery::with_features(features));
        let archive = Arc::new(MessageArchive::new(
            Arc::clone(&session.engine),
            discovery.clone(),
            contacts.clone(),
            Arc::new(Rooms::default()),
            MamConfig::default(),
        ));
        Fixture {
            session,
            archive,
            contacts,
            discovery,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(&[NS_MAM]).await
    }

    fn rsm_child(stanza: &Stanza, name: &str) -> Option<String> {
        stanza
            .child_ns("query", NS_MAM)?
            .get_child("set", NS_RSM)?
            .get_child(name, NS_RSM)
            .map(Element::text)
    }

    fn fin(id: &str, complete: bool, last: &str) -> Stanza {
        fixtures::stanza_with(
            "mam-fin.xml",
            &[
                ("id", id),
                ("complete", if complete { "true" } else { "false" }),
                ("first", "first"),
                ("last", last),
            ],
        )
    }

    fn drain(sub: &mut tern_core::event::EventSubscription) -> Vec<Event> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[tokio::test]
    async fn newest_messages_query_and_sync_events() {
        let f = fixture().await;
        let mut sync = f.session.bus.subscribe("system.sync.*").unwrap();

        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move { archive.request_newest_messages().await });

        let sent = f.session.transport.next_sent().await;
        assert_eq!(rsm_child(&sent, "max").as_deref(), Some("250"));
        assert_eq!(rsm_child(&sent, "before").as_deref(), Some(""));
        let id = sent.id().unwrap().to_string();

        f.session.deliver(fixtures::stanza_with(
            "mam-result-chat-in.xml",
            &[
                ("queryid", "q"),
                ("archive_id", "a1"),
                ("stamp", "2024-01-01T08:00:00Z"),
                ("message_id", "m1"),
                ("body", "hi"),
            ],
        ));
        f.session
            .deliver(fixtures::stanza_with("mam-fin-empty.xml", &[("id", &id)]));

        let page = task.await.unwrap().unwrap();
        assert!(page.complete);
        assert_eq!(page.last, None);

        let events = drain(&mut sync);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].payload, EventPayload::SyncStarted));
        assert!(matches!(
            events[1].payload,
            EventPayload::SyncCompleted { messages_synced: 1 }
        ));
        assert_eq!(events[0].correlation_id, events[1].correlation_id);
        assert!(events[0].correlation_id.is_some());
    }

    #[tokio::test]
    async fn unsupported_server_sends_nothing() {
        let f = fixture_with(&[]).await;
        assert_matches!(
            f.archive.request_newest_messages().await,
            Err(MamError::UnsupportedFeature)
        );
        assert_matches!(
            f.archive.load_all_messages().await,
            Err(MamError::UnsupportedFeature)
        );
        assert!(f.session.transport.sent().is_empty());
        assert_eq!(f.discovery.lookups(), 2);
    }

    #[tokio::test]
    async fn offline_archive_reports_closed_session() {
        let session = TestSession::start();
        let archive = MessageArchive::new(
            Arc::clone(&session.engine),
            Arc::new(StaticDiscovery::with_features(&[NS_MAM])),
            Arc::new(InMemoryContactStore::new()),
            Arc::new(Rooms::default()),
            MamConfig::default(),
        );
        assert_matches!(
            archive.request_newest_messages().await,
            Err(MamError::Query(QueryError::Connection(
                ConnectionError::SessionClosed
            )))
        );
    }

    #[tokio::test]
    async fn contact_history_is_scoped_and_bounded() {
        let f = fixture().await;
        let bob = Arc::new(Contact::new("bob@example.com"));
        bob.add_message(Message {
            id: "known".to_string(),
            direction: Direction::In,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            body: "hello".to_string(),
            delayed: false,
        });
        let recipient = Recipient::Contact(bob);

        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move {
            archive
                .load_most_recent_unloaded_messages(&recipient)
                .await
        });

        let sent = f.session.transport.next_sent().await;
        assert!(sent.to().is_none());
        let form = sent
            .child_ns("query", NS_MAM)
            .and_then(|q| q.get_child("x", NS_DATA_FORMS))
            .unwrap();
        let value = |var: &str| {
            form.children()
                .find(|field| field.attr("var") == Some(var))
                .and_then(|field| field.get_child("value", NS_DATA_FORMS))
                .map(Element::text)
        };
        assert_eq!(value("with").as_deref(), Some("bob@example.com"));
        assert_eq!(value("end").as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(rsm_child(&sent, "max").as_deref(), Some("100"));

        f.session.deliver(fixtures::stanza_with(
            "mam-fin-empty.xml",
            &[("id", sent.id().unwrap())],
        ));
        assert!(task.await.unwrap().unwrap().complete);
    }

    #[tokio::test]
    async fn room_history_is_addressed_to_the_room() {
        let f = fixture().await;
        let recipient = Recipient::Room(Arc::new(Room::new("lobby@muc.example.com")));

        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move {
            archive
                .load_most_recent_unloaded_messages(&recipient)
                .await
        });

        let sent = f.session.transport.next_sent().await;
        assert_eq!(sent.to(), Some("lobby@muc.example.com"));
        assert!(
            sent.child_ns("query", NS_MAM)
                .unwrap()
                .get_child("x", NS_DATA_FORMS)
                .is_none()
        );
        f.session.deliver(fixtures::stanza_with(
            "mam-fin-empty.xml",
            &[("id", sent.id().unwrap())],
        ));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_sync_follows_cursors_until_complete() {
        let f = fixture().await;
        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move { archive.load_all_messages().await });

        let first = f.session.transport.next_sent().await;
        assert_eq!(first.child_ns("query", NS_MAM).unwrap().children().count(), 0);
        f.session.deliver(fin(first.id().unwrap(), false, "c1"));

        let second = f.session.transport.next_sent().await;
        assert_eq!(rsm_child(&second, "after").as_deref(), Some("c1"));
        assert_eq!(rsm_child(&second, "max").as_deref(), Some("250"));
        f.session.deliver(fin(second.id().unwrap(), false, "c2"));

        let third = f.session.transport.next_sent().await;
        assert_eq!(rsm_child(&third, "after").as_deref(), Some("c2"));
        f.session.deliver(fin(third.id().unwrap(), true, "c3"));

        assert_eq!(task.await.unwrap().unwrap(), 3);
        assert!(f.session.transport.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn history_load_waits_for_its_fin() {
        let f = fixture().await;
        let recipient = Recipient::Contact(Arc::new(Contact::new("bob@example.com")));
        let mut load = tokio_test::task::spawn(f.archive.load_most_recent_unloaded_messages(&recipient));

        tokio_test::assert_pending!(load.poll());
        let sent = f.session.transport.try_next_sent().expect("query sent");
        assert_eq!(f.session.engine.pending_query_count(), 1);

        f.session
            .deliver(fin(sent.id().unwrap(), true, "last-seen"));
        assert!(load.is_woken());
        let page = tokio_test::assert_ready!(load.poll()).unwrap();
        assert_eq!(page.last.as_deref(), Some("last-seen"));
    }

    #[tokio::test]
    async fn full_sync_rejects_a_stuck_cursor() {
        let f = fixture().await;
        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move { archive.load_all_messages().await });

        let first = f.session.transport.next_sent().await;
        f.session.deliver(fin(first.id().unwrap(), false, "same"));
        let second = f.session.transport.next_sent().await;
        f.session.deliver(fin(second.id().unwrap(), false, "same"));

        assert_matches!(task.await.unwrap(), Err(MamError::Protocol(_)));
        assert_eq!(f.session.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn full_sync_requires_a_cursor_when_incomplete() {
        let f = fixture().await;
        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move { archive.load_all_messages().await });

        let first = f.session.transport.next_sent().await;
        f.session.deliver(
            Stanza::parse(
                format!(
                    "<iq xmlns='jabber:client' type='result' id='{}'><fin xmlns='urn:xmpp:mam:2'/></iq>",
                    first.id().unwrap()
                )
                .as_bytes(),
            )
            .unwrap(),
        );

        assert_matches!(task.await.unwrap(), Err(MamError::Protocol(_)));
    }

    #[tokio::test]
    async fn rejected_query_surfaces_the_error_stanza() {
        let f = fixture().await;
        let archive = Arc::clone(&f.archive);
        let task = tokio::spawn(async move { archive.request_newest_messages().await });

        let sent = f.session.transport.next_sent().await;
        f.session.deliver(fixtures::stanza_with(
            "iq-error.xml",
            &[("id", sent.id().unwrap())],
        ));

        let error = task.await.unwrap().unwrap_err();
        assert_matches!(error, MamError::Query(QueryError::Rejected(stanza)) if stanza.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_query_times_out() {
        let f = fixture().await;
        let error = f.archive.request_newest_messages().await.unwrap_err();
        assert_matches!(error, MamError::Timeout(30));
        assert_eq!(f.session.engine.pending_query_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn run_catches_up_once_per_online_transition() {
        let f = fixture().await;
        let run = tokio::spawn(Arc::clone(&f.archive).run());

        let sent = f.session.transport.next_sent().await;
        assert_eq!(rsm_child(&sent, "before").as_deref(), Some(""));
        f.session.deliver(fixtures::stanza_with(
            "mam-fin-empty.xml",
            &[("id", sent.id().unwrap())],
        ));
        tokio::task::yield_now().await;

        f.session.engine.log_out().await;
        let presence = f.session.transport.next_sent().await;
        assert_eq!(presence.type_(), Some("unavailable"));

        f.session.go_online("alice@example.com/laptop").await;
        let again = f.session.transport.next_sent().await;
        assert_eq!(rsm_child(&again, "max").as_deref(), Some("250"));
        f.session.deliver(fixtures::stanza_with(
            "mam-fin-empty.xml",
            &[("id", again.id().unwrap())],
        ));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(f.contacts.is_empty());
        assert!(logs_contain("archive catch-up complete"));
        run.abort();
    }
}
