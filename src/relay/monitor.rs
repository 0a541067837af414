//! The daemon control loop.
//!
//! One actor owns the tracked-chat map and the update queues. The tracking
//! directory watcher, the poll loop and the push reader run as separate tasks
//! and only send [`MonitorEvent`]s; the actor applies them one at a time, so a
//! chat is claimed for completion exactly once.

use crate::error::{FatalError, UpstreamError};
use crate::openclaw::delivery::DeliveryService;
use crate::relay::audit;
use crate::relay::config::RelayConfig;
use crate::relay::history;
use crate::relay::notify;
use crate::relay::push;
use crate::relay::state::{Listener, StateStore, TrackedChat};
use crate::relay::updates::UpdateAggregator;
use crate::relay::upstream::{ChatStatus, UpstreamClient};
use crate::relay::warn::{self, WarnEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 64;

#[derive(Debug)]
pub enum MonitorEvent {
    /// A tracking file appeared or changed on disk.
    ChatFile { chat: TrackedChat, is_new: bool },
    Completed(String),
    Progress { chat_id: String, text: String },
    PollReport {
        polled: Vec<String>,
        result: Result<BTreeMap<String, ChatStatus>, UpstreamError>,
    },
    Fatal(FatalError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Every tracked chat finished or disappeared.
    NothingTracked,
    Fatal(&'static str),
    Shutdown,
}

pub struct ChatMonitor {
    store: StateStore,
    upstream: UpstreamClient,
    delivery: DeliveryService,
    config: RelayConfig,
    audit_log: PathBuf,
    tracked: BTreeMap<String, TrackedChat>,
    updates: UpdateAggregator,
    ids_tx: watch::Sender<BTreeSet<String>>,
    events_tx: mpsc::Sender<MonitorEvent>,
    events_rx: Option<mpsc::Receiver<MonitorEvent>>,
    fatal: Option<&'static str>,
}

impl ChatMonitor {
    pub fn new(
        store: StateStore,
        upstream: UpstreamClient,
        delivery: DeliveryService,
        config: RelayConfig,
        audit_log: PathBuf,
    ) -> Self {
        let updates =
            UpdateAggregator::new(config.interim.max_updates_per_chat, config.interim_flush());
        let (ids_tx, _) = watch::channel(BTreeSet::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            store,
            upstream,
            delivery,
            config,
            audit_log,
            tracked: BTreeMap::new(),
            updates,
            ids_tx,
            events_tx,
            events_rx: Some(events_rx),
            fatal: None,
        }
    }

    /// Feeds events into the actor alongside its own loops.
    pub fn sender(&self) -> mpsc::Sender<MonitorEvent> {
        self.events_tx.clone()
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        self.tracked.keys().cloned().collect()
    }

    fn publish_ids(&self) {
        let ids: BTreeSet<String> = self.tracked.keys().cloned().collect();
        self.ids_tx.send_replace(ids);
    }

    fn audit(&self, phase: &str, status: &str, chat_id: Option<&str>, message: &str) {
        audit::record(&self.audit_log, phase, status, chat_id, message);
    }

    /// Runs until nothing is tracked, a fatal upstream error was broadcast,
    /// or `shutdown` resolves. Tracking files survive a shutdown.
    pub async fn run<F>(mut self, shutdown: F) -> MonitorExit
    where
        F: Future<Output = ()>,
    {
        tracing::info!("reconciling tracked chats");
        if let Some(fatal) = self.reconcile().await {
            self.handle_fatal(fatal).await;
        }
        if let Some(kind) = self.fatal {
            return MonitorExit::Fatal(kind);
        }
        if self.tracked.is_empty() {
            tracing::info!("nothing to track after reconciliation");
            self.audit("shutdown", "ok", None, "nothing tracked");
            return MonitorExit::NothingTracked;
        }

        let Some(mut events_rx) = self.events_rx.take() else {
            return MonitorExit::Shutdown;
        };
        let tasks = self.spawn_loops();
        tracing::info!(chats = self.tracked.len(), "monitor running");

        let check = self.config.interim_check();
        let mut flush_tick = tokio::time::interval_at(tokio::time::Instant::now() + check, check);
        tokio::pin!(shutdown);

        let exit = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, tracking files kept");
                    self.audit("shutdown", "ok", None, "signal");
                    break MonitorExit::Shutdown;
                }
                maybe_event = events_rx.recv() => {
                    let Some(event) = maybe_event else {
                        break MonitorExit::Shutdown;
                    };
                    self.apply(event).await;
                }
                _ = flush_tick.tick() => {
                    self.flush_interim(Instant::now()).await;
                }
            }

            if let Some(kind) = self.fatal {
                break MonitorExit::Fatal(kind);
            }
            if self.tracked.is_empty() && !self.adopt_untracked_files() {
                tracing::info!("all tracked chats finished");
                self.audit("shutdown", "ok", None, "nothing tracked");
                break MonitorExit::NothingTracked;
            }
        };

        for task in tasks {
            task.abort();
        }
        exit
    }

    fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let events_tx = self.sender();
        let mut tasks = vec![
            tokio::spawn(watch_tracking_dir(
                self.store.clone(),
                self.config.watch_interval(),
                events_tx.clone(),
            )),
            tokio::spawn(poll_loop(
                self.upstream.clone(),
                self.config.poll_interval(),
                self.ids_tx.subscribe(),
                events_tx.clone(),
            )),
        ];

        if self.config.push.enabled {
            match self.upstream.push_url() {
                Ok(url) => {
                    tracing::info!(url = %self.upstream.masked_push_url(), "push channel enabled");
                    tasks.push(tokio::spawn(push::run_push_loop(
                        url,
                        self.config.push.clone(),
                        self.ids_tx.subscribe(),
                        events_tx,
                    )));
                }
                Err(err) => tracing::warn!("push channel disabled: {err:#}"),
            }
        }
        tasks
    }

    async fn apply(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::ChatFile { chat, is_new } => self.apply_chat_file(chat, is_new),
            MonitorEvent::Completed(chat_id) => self.complete(&chat_id).await,
            MonitorEvent::Progress { chat_id, text } => {
                if self.collect_update(&chat_id, &text, Instant::now()) {
                    tracing::debug!(
                        chat = %chat_id,
                        pending = self.updates.pending(&chat_id),
                        "progress queued"
                    );
                }
            }
            MonitorEvent::PollReport { polled, result } => {
                self.apply_poll_report(&polled, result).await;
            }
            MonitorEvent::Fatal(fatal) => self.handle_fatal(fatal).await,
        }
    }

    /// Loads every record, checks them in one status call and settles the
    /// ones that finished or vanished while no daemon was running.
    pub async fn reconcile(&mut self) -> Option<FatalError> {
        let loaded = self.store.load_all();
        if loaded.is_empty() {
            return None;
        }
        let ids: Vec<String> = loaded.keys().cloned().collect();
        self.tracked = loaded;
        self.publish_ids();

        match self.upstream.bulk_status(&ids).await {
            Ok(statuses) => {
                for chat_id in &ids {
                    match statuses.get(chat_id) {
                        None => self.remove_missing(chat_id),
                        Some(status) if status.operating => {
                            if let Some(chat) = self.tracked.get_mut(chat_id) {
                                chat.touch_verified();
                                if let Err(err) = self.store.save(chat) {
                                    tracing::warn!(chat = %chat_id, "failed to refresh record: {err:#}");
                                }
                            }
                        }
                        Some(_) => {
                            tracing::info!(chat = %chat_id, "finished while no daemon was running");
                            self.complete(chat_id).await;
                        }
                    }
                }
            }
            Err(UpstreamError::Fatal(fatal)) => return Some(fatal),
            Err(UpstreamError::Transient(reason)) => {
                tracing::warn!("reconcile status check failed, polling will retry: {reason}");
            }
        }

        self.audit(
            "reconcile",
            "ok",
            None,
            &format!("loaded={} active={}", ids.len(), self.tracked.len()),
        );
        None
    }

    fn apply_chat_file(&mut self, chat: TrackedChat, is_new: bool) {
        // Completion and removal delete the file; a stale scan must not revive it.
        if !self.store.path_for(&chat.chat_id).exists() {
            return;
        }
        match self.tracked.get_mut(&chat.chat_id) {
            Some(existing) => {
                let before = existing.listeners.len();
                existing.listeners = chat.listeners;
                if existing.listeners.len() != before {
                    tracing::info!(
                        chat = %chat.chat_id,
                        "listeners updated: {before} -> {}",
                        existing.listeners.len()
                    );
                }
            }
            None => {
                tracing::info!(
                    chat = %chat.chat_id,
                    listeners = chat.listeners.len(),
                    new_file = is_new,
                    "now tracking"
                );
                self.tracked.insert(chat.chat_id.clone(), chat);
                self.publish_ids();
            }
        }
    }

    /// Picks up records written after the last watcher scan.
    fn adopt_untracked_files(&mut self) -> bool {
        let found = self.store.load_all();
        if found.is_empty() {
            return false;
        }
        tracing::info!(chats = found.len(), "adopting records written during shutdown");
        self.tracked.extend(found);
        self.publish_ids();
        true
    }

    async fn apply_poll_report(
        &mut self,
        polled: &[String],
        result: Result<BTreeMap<String, ChatStatus>, UpstreamError>,
    ) {
        let statuses = match result {
            Ok(statuses) => statuses,
            Err(UpstreamError::Fatal(fatal)) => {
                self.handle_fatal(fatal).await;
                return;
            }
            Err(UpstreamError::Transient(reason)) => {
                tracing::warn!("status poll failed: {reason}");
                return;
            }
        };

        for chat_id in polled {
            if !self.tracked.contains_key(chat_id) {
                continue;
            }
            match statuses.get(chat_id) {
                None => {
                    tracing::warn!(chat = %chat_id, "chat missing upstream, dropping");
                    self.remove_missing(chat_id);
                }
                Some(status) if !status.operating => {
                    tracing::info!(chat = %chat_id, "completion observed by poll");
                    self.complete(chat_id).await;
                }
                Some(ChatStatus {
                    annotation: Some(annotation),
                    ..
                }) => tracing::warn!(chat = %chat_id, annotation, "chat reports an error state"),
                Some(_) => {}
            }
        }
    }

    fn remove_missing(&mut self, chat_id: &str) {
        self.tracked.remove(chat_id);
        self.updates.clear(chat_id);
        self.store.remove(chat_id);
        self.publish_ids();
        self.audit("remove", "missing", Some(chat_id), "chat unknown upstream");
    }

    /// Delivers the final notification for `chat_id` once. Later calls for the
    /// same chat find nothing to do.
    pub async fn complete(&mut self, chat_id: &str) {
        let Some(chat) = self.tracked.remove(chat_id) else {
            tracing::debug!(chat = %chat_id, "completion already handled");
            return;
        };
        self.updates.clear(chat_id);
        self.publish_ids();
        tracing::info!(chat = %chat_id, listeners = chat.listeners.len(), "processing completion");

        match self.upstream.history(chat_id).await {
            Ok(chat_history) => {
                let mut batch = Vec::with_capacity(chat.listeners.len());
                for listener in &chat.listeners {
                    let cursor = self.store.cursor(chat_id, &listener.session_key);
                    let seen = cursor.load();
                    let digest = history::digest_for(&chat_history, chat_id, seen);
                    if digest.last_index > seen
                        && let Err(err) = cursor.save(digest.last_index)
                    {
                        tracing::warn!(chat = %chat_id, session = %listener.session_key, "cursor not saved: {err:#}");
                    }
                    let message =
                        notify::completion_message(chat_id, &listener.task_label, &digest);
                    batch.push((listener, message));
                }

                let results = self.delivery.deliver_each(&batch).await;
                let delivered = results.values().filter(|ok| **ok).count();
                for (session, _) in results.iter().filter(|(_, ok)| !**ok) {
                    warn::emit(WarnEvent {
                        code: "DELIVERY_FAILED",
                        action: "deliver-completion",
                        chat: chat_id,
                        session,
                        reason: "no-deliverable-session",
                        err: "",
                    });
                }
                self.audit(
                    "completion",
                    if delivered == results.len() { "ok" } else { "partial" },
                    Some(chat_id),
                    &format!("delivered {delivered}/{}", results.len()),
                );
            }
            Err(err) => {
                warn::emit(WarnEvent {
                    code: "HISTORY_FAILED",
                    action: "fetch-history",
                    chat: chat_id,
                    session: "na",
                    reason: "history-unavailable",
                    err: &format!("{err:#}"),
                });
                self.audit("completion", "failed", Some(chat_id), &format!("{err:#}"));
            }
        }

        self.store.remove(chat_id);
    }

    /// Broadcasts remediation for `fatal` to every listener once; the
    /// tracking files stay so `resume` can pick them up again.
    pub async fn handle_fatal(&mut self, fatal: FatalError) {
        if self.fatal.is_some() {
            return;
        }
        self.fatal = Some(fatal.kind());
        tracing::error!(kind = fatal.kind(), "fatal upstream error: {fatal}");

        let message = notify::fatal_message(&fatal, &self.tracked);
        let mut seen = BTreeSet::new();
        let listeners: Vec<Listener> = self
            .tracked
            .values()
            .flat_map(|chat| chat.listeners.iter())
            .filter(|l| seen.insert(l.session_key.clone()))
            .cloned()
            .collect();

        if !listeners.is_empty() {
            let results = self.delivery.deliver_to_all(&listeners, &message).await;
            let delivered = results.values().filter(|ok| **ok).count();
            tracing::info!("fatal notice delivered to {delivered}/{} listeners", results.len());
        }
        self.audit("fatal", fatal.kind(), None, &fatal.to_string());
    }

    /// Sends queued progress for chats whose flush interval elapsed.
    pub async fn flush_interim(&mut self, now: Instant) {
        for chat_id in self.updates.chat_ids() {
            let Some(chat) = self.tracked.get(&chat_id) else {
                self.updates.clear(&chat_id);
                continue;
            };
            if !self.updates.flush_due(&chat_id, now) {
                continue;
            }
            let label = chat.primary_label().to_string();
            let listeners = chat.listeners.clone();
            let taken = self.updates.take(&chat_id, now);
            tracing::info!(chat = %chat_id, updates = taken.len(), "sending interim update");

            let message = notify::interim_message(&chat_id, &label, &taken, now);
            let results = self.delivery.deliver_to_all(&listeners, &message).await;
            for (session, ok) in results {
                if !ok {
                    tracing::warn!(chat = %chat_id, session = %session, "interim update not delivered");
                }
            }
        }
    }

    pub fn collect_update(&mut self, chat_id: &str, text: &str, now: Instant) -> bool {
        self.tracked.contains_key(chat_id) && self.updates.collect(chat_id, text, now)
    }
}

/// Polls the tracking directory and reports new or modified records.
async fn watch_tracking_dir(
    store: StateStore,
    every: Duration,
    events: mpsc::Sender<MonitorEvent>,
) {
    let mut known: BTreeMap<PathBuf, SystemTime> = BTreeMap::new();
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        let current = match scan_dir(store.tracked_dir()).await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!("tracking directory scan failed: {err:#}");
                continue;
            }
        };

        for (path, mtime) in &current {
            let is_new = match known.get(path) {
                None => true,
                Some(previous) if previous < mtime => false,
                Some(_) => continue,
            };
            match store.load(path) {
                Ok(chat) => {
                    if events
                        .send(MonitorEvent::ChatFile { chat, is_new })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), "ignoring unreadable tracking file: {err:#}")
                }
            }
        }
        known = current;
    }
}

async fn scan_dir(dir: &Path) -> anyhow::Result<BTreeMap<PathBuf, SystemTime>> {
    let mut current = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if StateStore::chat_id_from_path(&path).is_none() {
            continue;
        }
        if let Ok(meta) = entry.metadata().await
            && let Ok(modified) = meta.modified()
        {
            current.insert(path, modified);
        }
    }
    Ok(current)
}

/// Bulk status for every tracked chat on a fixed interval. Stops after a
/// fatal classification.
async fn poll_loop(
    upstream: UpstreamClient,
    every: Duration,
    tracked: watch::Receiver<BTreeSet<String>>,
    events: mpsc::Sender<MonitorEvent>,
) {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tick.tick().await;
        let polled: Vec<String> = tracked.borrow().iter().cloned().collect();
        if polled.is_empty() {
            continue;
        }
        tracing::debug!(chats = polled.len(), "polling status");
        let result = upstream.bulk_status(&polled).await;
        let is_fatal = matches!(result, Err(UpstreamError::Fatal(_)));
        if events
            .send(MonitorEvent::PollReport { polled, result })
            .await
            .is_err()
            || is_fatal
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openclaw::auth::AuthSource;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _tmp: TempDir,
        store: StateStore,
        audit_log: PathBuf,
        config: RelayConfig,
    }

    fn harness(upstream_base: &str) -> Harness {
        let tmp = tempdir().expect("tempdir");
        let store = StateStore::open(tmp.path().join("tracked_chats"), tmp.path().join("chats"))
            .expect("store");
        let mut config = RelayConfig::default();
        config.upstream.api_base_url = upstream_base.to_string();
        config.push.enabled = false;
        config.monitor.poll_interval_secs = 1;
        config.monitor.watch_interval_ms = 50;
        Harness {
            audit_log: tmp.path().join("audit.log"),
            _tmp: tmp,
            store,
            config,
        }
    }

    impl Harness {
        fn monitor(&self) -> ChatMonitor {
            let upstream = UpstreamClient::new(&self.config.upstream, "sk_test").expect("upstream");
            let delivery = DeliveryService::new(Duration::from_secs(5)).expect("delivery");
            ChatMonitor::new(
                self.store.clone(),
                upstream,
                delivery,
                self.config.clone(),
                self.audit_log.clone(),
            )
        }

        fn track(&self, chat_id: &str, session_key: &str, gateway: &str) {
            let listener = Listener::new(
                session_key,
                gateway,
                AuthSource::Literal("gw".into()),
                "Research task",
            );
            self.store
                .save(&TrackedChat::new(chat_id, listener))
                .expect("save record");
        }
    }

    fn mock_sessions<'a>(server: &'a MockServer, session_key: &str) -> httpmock::Mock<'a> {
        let sessions = json!({
            "result": {"details": {"sessions": [{"key": session_key, "channel": "telegram"}]}}
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"tool\":\"sessions_list\"");
            then.status(200).json_body(sessions);
        })
    }

    fn mock_send<'a>(server: &'a MockServer, includes: &[&str]) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            let mut when = when
                .method(POST)
                .path("/tools/invoke")
                .body_includes("\"tool\":\"sessions_send\"");
            for needle in includes {
                when = when.body_includes(*needle);
            }
            then.status(200)
                .json_body(json!({"result": {"details": {"status": "ok"}}}));
        })
    }

    fn mock_history<'a>(server: &'a MockServer, chat_id: &str) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(GET).path(format!("/chat/{chat_id}/history"));
            then.status(200).json_body(json!({
                "messages": [
                    {"role": "openclaw", "content": "Research X", "created_at": "2026-02-04T14:30:00Z"},
                    {"role": "cellcog", "content": "Here is X", "created_at": "2026-02-04T15:30:00Z"}
                ]
            }));
        })
    }

    fn mock_status<'a>(server: &'a MockServer, body: serde_json::Value) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(POST).path("/chats/status");
            then.status(200).json_body(body);
        })
    }

    #[tokio::test]
    async fn duplicate_completion_fetches_history_once() {
        let upstream = MockServer::start();
        let gateway = MockServer::start();
        mock_status(&upstream, json!({"chats": {"c1": {"operating": true}}}));
        let history = mock_history(&upstream, "c1");
        mock_sessions(&gateway, "agent:main:main");
        let send = mock_send(&gateway, &[]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let mut monitor = h.monitor();
        assert!(monitor.reconcile().await.is_none());
        assert_eq!(monitor.tracked_ids(), vec!["c1".to_string()]);

        monitor.complete("c1").await;
        monitor.complete("c1").await;

        assert_eq!(history.calls(), 1);
        assert_eq!(send.calls(), 1);
        assert!(!h.store.path_for("c1").exists());
        assert_eq!(h.store.cursor("c1", "agent:main:main").load(), 1);
    }

    #[tokio::test]
    async fn reconcile_settles_finished_and_missing_chats() {
        let upstream = MockServer::start();
        let gateway = MockServer::start();
        mock_status(
            &upstream,
            json!({"chats": {"done": {"operating": false}, "live": {"operating": true}}}),
        );
        mock_history(&upstream, "done");
        mock_sessions(&gateway, "agent:main:main");
        let send = mock_send(&gateway, &[]);

        let h = harness(&upstream.base_url());
        h.track("done", "agent:main:main", &gateway.base_url());
        h.track("live", "agent:main:main", &gateway.base_url());
        h.track("gone", "agent:main:main", &gateway.base_url());

        let mut monitor = h.monitor();
        assert!(monitor.reconcile().await.is_none());

        assert_eq!(send.calls(), 1);
        assert_eq!(monitor.tracked_ids(), vec!["live".to_string()]);
        assert!(!h.store.path_for("done").exists());
        assert!(!h.store.path_for("gone").exists());
        assert!(h.store.path_for("live").exists());
    }

    #[tokio::test]
    async fn transient_reconcile_failure_keeps_everything() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(POST).path("/chats/status");
            then.status(503);
        });
        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", "http://127.0.0.1:9");

        let mut monitor = h.monitor();
        assert!(monitor.reconcile().await.is_none());
        assert_eq!(monitor.tracked_ids(), vec!["c1".to_string()]);
        assert!(h.store.path_for("c1").exists());
    }

    #[tokio::test]
    async fn fatal_at_startup_notifies_and_keeps_files() {
        let upstream = MockServer::start();
        upstream.mock(|when, then| {
            when.method(POST).path("/chats/status");
            then.status(402);
        });
        let gateway = MockServer::start();
        mock_sessions(&gateway, "agent:main:main");
        let notice = mock_send(&gateway, &["payment required", "Research task (c1)"]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let exit = h.monitor().run(std::future::pending()).await;

        assert_eq!(exit, MonitorExit::Fatal("payment-required"));
        assert_eq!(notice.calls(), 1);
        assert!(h.store.path_for("c1").exists());
        let audit = fs::read_to_string(&h.audit_log).expect("audit log");
        assert!(audit.contains("\"phase\":\"fatal\""));
    }

    #[tokio::test]
    async fn fatal_is_broadcast_once_per_lifetime() {
        let upstream = MockServer::start();
        mock_status(&upstream, json!({"chats": {"c1": {"operating": true}}}));
        let gateway = MockServer::start();
        mock_sessions(&gateway, "agent:main:main");
        let send = mock_send(&gateway, &[]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let mut monitor = h.monitor();
        monitor.reconcile().await;
        monitor
            .handle_fatal(FatalError::AuthRejected("revoked".into()))
            .await;
        monitor.handle_fatal(FatalError::PaymentRequired).await;

        assert_eq!(send.calls(), 1);
    }

    #[tokio::test]
    async fn interim_flush_sends_progress_digest() {
        let upstream = MockServer::start();
        mock_status(&upstream, json!({"chats": {"c1": {"operating": true}}}));
        let gateway = MockServer::start();
        mock_sessions(&gateway, "agent:main:main");
        let interim = mock_send(&gateway, &["still working", "Reading sources"]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let mut monitor = h.monitor();
        monitor.reconcile().await;

        let start = Instant::now();
        assert!(monitor.collect_update("c1", "Reading sources", start));
        assert!(!monitor.collect_update("unknown", "ignored", start));

        monitor.flush_interim(start + Duration::from_secs(10)).await;
        assert_eq!(interim.calls(), 0);
        monitor.flush_interim(start + Duration::from_secs(240)).await;
        assert_eq!(interim.calls(), 1);
        monitor.flush_interim(start + Duration::from_secs(600)).await;
        assert_eq!(interim.calls(), 1);
    }

    #[tokio::test]
    async fn poll_completion_notifies_removes_file_and_exits() {
        let upstream = MockServer::start();
        let gateway = MockServer::start();
        let mut operating = mock_status(&upstream, json!({"chats": {"c1": {"operating": true}}}));
        let history = mock_history(&upstream, "c1");
        mock_sessions(&gateway, "agent:main:main");
        let send = mock_send(&gateway, &[]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let monitor = h.monitor();
        let running = tokio::spawn(monitor.run(std::future::pending()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.store.path_for("c1").exists());
        operating.delete();
        mock_status(&upstream, json!({"chats": {"c1": {"operating": false}}}));

        let exit = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("monitor exits")
            .expect("join");
        assert_eq!(exit, MonitorExit::NothingTracked);
        assert_eq!(history.calls(), 1);
        assert_eq!(send.calls(), 1);
        assert!(!h.store.path_for("c1").exists());
    }

    #[tokio::test]
    async fn watcher_picks_up_new_records_and_shutdown_keeps_them() {
        let upstream = MockServer::start();
        mock_status(
            &upstream,
            json!({"chats": {"c1": {"operating": true}, "c2": {"operating": true}}}),
        );
        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", "http://127.0.0.1:9");

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let monitor = h.monitor();
        let mut ids = monitor.ids_tx.subscribe();
        let running = tokio::spawn(monitor.run(async move {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(200)).await;
        h.track("c2", "agent:main:subagent:x", "http://127.0.0.1:9");
        tokio::time::timeout(Duration::from_secs(5), ids.wait_for(|ids| ids.contains("c2")))
            .await
            .expect("c2 tracked in time")
            .expect("monitor alive");
        let _ = stop_tx.send(());

        let exit = running.await.expect("join");
        assert_eq!(exit, MonitorExit::Shutdown);
        assert!(h.store.path_for("c1").exists());
        assert!(h.store.path_for("c2").exists());
    }

    #[tokio::test]
    async fn completion_events_for_one_chat_deliver_once() {
        let upstream = MockServer::start();
        let gateway = MockServer::start();
        mock_status(&upstream, json!({"chats": {"c1": {"operating": true}}}));
        let history = mock_history(&upstream, "c1");
        mock_sessions(&gateway, "agent:main:main");
        let send = mock_send(&gateway, &[]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let monitor = h.monitor();
        let events = monitor.sender();
        let running = tokio::spawn(monitor.run(std::future::pending()));

        events
            .send(MonitorEvent::Completed("c1".into()))
            .await
            .expect("first completion");
        // The actor may already be gone once the first one emptied the map.
        let _ = events.send(MonitorEvent::Completed("c1".into())).await;

        let exit = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("monitor exits")
            .expect("join");
        assert_eq!(exit, MonitorExit::NothingTracked);
        assert_eq!(history.calls(), 1);
        assert_eq!(send.calls(), 1);
    }

    #[tokio::test]
    async fn rewritten_record_adds_listener_to_running_chat() {
        let upstream = MockServer::start();
        let gateway = MockServer::start();
        let mut operating = mock_status(&upstream, json!({"chats": {"c1": {"operating": true}}}));
        mock_history(&upstream, "c1");
        gateway.mock(|when, then| {
            when.method(POST)
                .path("/tools/invoke")
                .body_includes("\"tool\":\"sessions_list\"");
            then.status(200).json_body(json!({
                "result": {"details": {"sessions": [
                    {"key": "agent:main:main", "channel": "telegram"},
                    {"key": "agent:main:subagent:x", "channel": "telegram"}
                ]}}
            }));
        });
        let to_main = mock_send(&gateway, &["\"sessionKey\":\"agent:main:main\""]);
        let to_sub = mock_send(&gateway, &["\"sessionKey\":\"agent:main:subagent:x\""]);

        let h = harness(&upstream.base_url());
        h.track("c1", "agent:main:main", &gateway.base_url());
        let running = tokio::spawn(h.monitor().run(std::future::pending()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut chat = h.store.load(&h.store.path_for("c1")).expect("load record");
        assert!(chat.add_listener(Listener::new(
            "agent:main:subagent:x",
            &gateway.base_url(),
            AuthSource::Literal("gw".into()),
            "Follow-up",
        )));
        h.store.save(&chat).expect("rewrite record");
        tokio::time::sleep(Duration::from_millis(300)).await;

        operating.delete();
        mock_status(&upstream, json!({"chats": {"c1": {"operating": false}}}));

        let exit = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("monitor exits")
            .expect("join");
        assert_eq!(exit, MonitorExit::NothingTracked);
        assert_eq!(to_main.calls(), 1);
        assert_eq!(to_sub.calls(), 1);
    }
}
