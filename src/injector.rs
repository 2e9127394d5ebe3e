use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::api::ContentService;
use crate::content::{ContentItem, ContentKey};
use crate::events::{ContentReady, Subscription};
use crate::feed::{FeedController, MergeOutcome};
use crate::storage::ProvisionalStore;

pub const DEFAULT_RECONCILE_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq)]
pub struct InjectorOptions {
    /// How long after an optimistic insert the authoritative copy is fetched.
    pub reconcile_delay: Duration,
}

impl Default for InjectorOptions {
    fn default() -> Self {
        Self {
            reconcile_delay: DEFAULT_RECONCILE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    /// The author still has to review the fact-check result.
    HeldForReview,
    /// Inserted from the provisional record; reconciliation is scheduled.
    Inserted,
    AlreadyVisible,
    /// No provisional record; the authoritative copy is being fetched.
    FetchScheduled,
    NotLoaded,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Reconcile,
    Fallback,
}

struct Task {
    key: ContentKey,
    kind: TaskKind,
}

struct InjectorResponse {
    request_id: u64,
    result: Result<ContentItem>,
}

/// Merges content into a feed as soon as its processing completes, ahead of
/// the next natural page fetch.
pub struct OptimisticInjector {
    events: Subscription,
    store: Arc<dyn ProvisionalStore>,
    service: Arc<dyn ContentService>,
    opts: InjectorOptions,
    response_tx: Sender<InjectorResponse>,
    response_rx: Receiver<InjectorResponse>,
    pending: HashMap<u64, Task>,
    next_request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

impl OptimisticInjector {
    pub fn new(
        events: Subscription,
        store: Arc<dyn ProvisionalStore>,
        service: Arc<dyn ContentService>,
        opts: InjectorOptions,
    ) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            events,
            store,
            service,
            opts,
            response_tx,
            response_rx,
            pending: HashMap::new(),
            next_request_id: 1,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancel_flag.load(Ordering::SeqCst)
    }

    pub fn awaiting_reconciliation(&self) -> Vec<ContentKey> {
        self.pending
            .values()
            .filter(|task| task.kind == TaskKind::Reconcile)
            .map(|task| task.key)
            .collect()
    }

    pub fn on_content_ready(
        &mut self,
        event: ContentReady,
        feed: &mut FeedController,
    ) -> InjectOutcome {
        if !self.is_active() || !feed.is_mounted() {
            return InjectOutcome::Detached;
        }
        let key = event.key();
        if event.verification_status.requires_review() {
            if self.store.delete(key) {
                tracing::debug!(%key, status = %event.verification_status, "cleared provisional record held for review");
            }
            return InjectOutcome::HeldForReview;
        }

        let Some(record) = self.store.get(key) else {
            if feed.contains(key) {
                return InjectOutcome::AlreadyVisible;
            }
            tracing::debug!(%key, "no provisional record, fetching content");
            self.spawn_fetch(key, TaskKind::Fallback, Duration::ZERO);
            return InjectOutcome::FetchScheduled;
        };

        match feed.prepend_and_trim(record.to_item()) {
            MergeOutcome::Inserted => {
                self.store.delete(key);
                tracing::debug!(%key, feed = %feed.key(), "inserted provisional content");
                self.spawn_fetch(key, TaskKind::Reconcile, self.opts.reconcile_delay);
                InjectOutcome::Inserted
            }
            MergeOutcome::Duplicate => {
                self.store.delete(key);
                InjectOutcome::AlreadyVisible
            }
            MergeOutcome::NotLoaded => InjectOutcome::NotLoaded,
            MergeOutcome::Detached => InjectOutcome::Detached,
        }
    }

    /// Handles queued completion events, then any finished fetches.
    pub fn poll(&mut self, feed: &mut FeedController) -> bool {
        let mut changed = false;
        while let Some(event) = self.events.try_next() {
            changed |= matches!(
                self.on_content_ready(event, feed),
                InjectOutcome::Inserted | InjectOutcome::FetchScheduled
            );
        }
        while let Ok(message) = self.response_rx.try_recv() {
            changed |= self.handle_response(message, feed);
        }
        changed
    }

    /// Waits for every scheduled fetch, then for whatever the feed itself has
    /// in flight. Returns false on timeout.
    pub fn block_until_idle(&mut self, feed: &mut FeedController, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.poll(feed);
        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(message) => {
                    self.handle_response(message, feed);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false;
                }
            }
        }
        feed.block_until_idle(deadline.saturating_duration_since(Instant::now()))
    }

    /// Stops handling events; results of fetches still running are dropped.
    pub fn teardown(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.pending.clear();
    }

    fn spawn_fetch(&mut self, key: ContentKey, kind: TaskKind, delay: Duration) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.pending.insert(request_id, Task { key, kind });

        let tx = self.response_tx.clone();
        let service = self.service.clone();
        let cancel_flag = self.cancel_flag.clone();
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.fetch_item(key);
            let _ = tx.send(InjectorResponse { request_id, result });
        });
    }

    fn handle_response(&mut self, message: InjectorResponse, feed: &mut FeedController) -> bool {
        let Some(task) = self.pending.remove(&message.request_id) else {
            tracing::trace!(request_id = message.request_id, "dropping stale content response");
            return false;
        };
        if !self.is_active() || !feed.is_mounted() {
            return false;
        }
        let key = task.key;

        match (task.kind, message.result) {
            (TaskKind::Reconcile, Ok(item)) => {
                if item.key() != key {
                    tracing::warn!(%key, got = %item.key(), "reconciliation returned different content");
                    return false;
                }
                feed.replace_item(item)
            }
            (TaskKind::Reconcile, Err(err)) => {
                tracing::warn!(%key, "reconciliation failed, keeping optimistic entry: {err:#}");
                false
            }
            (TaskKind::Fallback, Ok(item)) => {
                matches!(feed.prepend_and_trim(item), MergeOutcome::Inserted)
            }
            (TaskKind::Fallback, Err(err)) => {
                tracing::warn!(%key, feed = %feed.key(), "content fetch failed, refetching feed: {err:#}");
                feed.refetch();
                true
            }
        }
    }
}

impl Drop for OptimisticInjector {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fixtures::{item, posts};
    use crate::api::{FeedKey, MockCall, MockContentService};
    use crate::content::{ContentType, ProvisionalRecord, UserSummary, VerificationStatus};
    use crate::events::EventBus;
    use crate::feed::{FeedCache, FeedOptions};
    use crate::storage::{MemoryProvisionalStore, Options as StoreOptions};
    use chrono::Utc;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        bus: EventBus,
        service: Arc<MockContentService>,
        store: Arc<MemoryProvisionalStore>,
        feed: FeedController,
        injector: OptimisticInjector,
    }

    fn harness() -> Harness {
        let service = Arc::new(MockContentService::with_feed(FeedKey::Feed, posts(1..=20), 12));
        let store = Arc::new(MemoryProvisionalStore::new(StoreOptions::default()));
        let bus = EventBus::new();
        let mut feed = FeedController::mount(
            FeedKey::Feed,
            service.clone(),
            FeedCache::new(),
            FeedOptions::default(),
        );
        assert!(feed.block_until_idle(WAIT));
        let injector = OptimisticInjector::new(
            bus.subscribe(),
            store.clone(),
            service.clone(),
            InjectorOptions {
                reconcile_delay: Duration::ZERO,
            },
        );
        Harness {
            bus,
            service,
            store,
            feed,
            injector,
        }
    }

    fn record(key: ContentKey) -> ProvisionalRecord {
        ProvisionalRecord {
            id: key.id,
            kind: key.kind,
            author: UserSummary {
                id: 1,
                username: "author".into(),
                avatar: None,
            },
            caption: Some("just uploaded".into()),
            media_url: Some("/media/upload.jpg".into()),
            created_at: None,
            verification_status: VerificationStatus::NotApplicable,
            stored_at: Utc::now(),
        }
    }

    fn authoritative(key: ContentKey) -> ContentItem {
        let mut item = item(key.kind, key.id);
        item.caption = Some("just uploaded".into());
        item.likes_count = 3;
        item.verification_status = VerificationStatus::NotApplicable;
        item.extra
            .insert("share_count".into(), serde_json::json!(8));
        item
    }

    fn ready(key: ContentKey, status: VerificationStatus) -> ContentReady {
        ContentReady::new(key, status)
    }

    fn count(feed: &FeedController, key: ContentKey) -> usize {
        feed.items().iter().filter(|item| item.key() == key).count()
    }

    #[test]
    fn provisional_content_is_prepended_then_reconciled() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        h.store.set(&record(key)).unwrap();
        h.service.insert_item(authoritative(key));

        let outcome = h
            .injector
            .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed);
        assert_eq!(outcome, InjectOutcome::Inserted);
        let first = h.feed.items()[0].clone();
        assert_eq!(first.key(), key);
        assert_eq!(first.likes_count, 0);
        assert!(h.store.get(key).is_none());
        assert_eq!(h.feed.len(), 12);
        assert_eq!(h.injector.awaiting_reconciliation(), vec![key]);

        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));
        assert_eq!(h.feed.items()[0], authoritative(key));
        assert!(h.injector.awaiting_reconciliation().is_empty());
    }

    #[test]
    fn published_event_is_merged_on_poll() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        h.store.set(&record(key)).unwrap();
        h.service.insert_item(authoritative(key));

        h.bus.publish(ready(key, VerificationStatus::NotApplicable));
        assert!(h.injector.poll(&mut h.feed));
        let items = h.feed.items();
        assert_eq!(items[0].id, 501);
        assert_eq!(items[0].kind, ContentType::Post);
        assert!(h.store.get(key).is_none());
        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));
    }

    #[test]
    fn content_awaiting_review_is_not_merged() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Reel, 77);
        h.store.set(&record(key)).unwrap();
        let before = h.feed.items();

        let outcome = h
            .injector
            .on_content_ready(ready(key, VerificationStatus::Pending), &mut h.feed);
        assert_eq!(outcome, InjectOutcome::HeldForReview);
        assert_eq!(h.feed.items(), before);
        assert!(h.store.get(key).is_none());
        assert!(!h
            .service
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::Item(_))));
    }

    #[test]
    fn duplicate_delivery_inserts_once() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        h.store.set(&record(key)).unwrap();
        h.service.insert_item(authoritative(key));

        let event = ready(key, VerificationStatus::NotApplicable);
        h.bus.publish(event);
        h.bus.publish(event);
        h.injector.poll(&mut h.feed);
        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));
        assert_eq!(count(&h.feed, key), 1);
        assert_eq!(h.feed.len(), 12);
    }

    #[test]
    fn concurrent_fallback_fetches_insert_once() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Reel, 9);
        h.service.insert_item(authoritative(key));

        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        h.service.hold_requests(gate_rx);
        let event = ready(key, VerificationStatus::NoClaims);
        assert_eq!(
            h.injector.on_content_ready(event, &mut h.feed),
            InjectOutcome::FetchScheduled
        );
        assert_eq!(
            h.injector.on_content_ready(event, &mut h.feed),
            InjectOutcome::FetchScheduled
        );
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));
        h.service.release_requests();

        assert_eq!(count(&h.feed, key), 1);
        assert_eq!(h.feed.items()[0].key(), key);
    }

    #[test]
    fn missing_record_falls_back_to_fetch() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 600);
        h.service.insert_item(authoritative(key));

        let outcome = h
            .injector
            .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed);
        assert_eq!(outcome, InjectOutcome::FetchScheduled);
        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));
        assert_eq!(h.feed.items()[0], authoritative(key));
        assert_eq!(h.feed.pages()[0].items.len(), 12);
    }

    #[test]
    fn failed_fallback_refetches_feed() {
        let mut h = harness();
        h.feed.request_next_page();
        assert!(h.feed.block_until_idle(WAIT));
        assert_eq!(h.feed.page_count(), 2);

        let key = ContentKey::new(ContentType::Post, 700);
        h.service.fail_item(key, true);
        h.injector
            .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed);
        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));

        assert_eq!(h.feed.page_count(), 1);
        assert_eq!(h.service.page_calls(FeedKey::Feed), vec![1, 2, 1]);
        assert!(h.feed.error().is_none());
    }

    #[test]
    fn failed_reconciliation_keeps_optimistic_entry() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        let provisional = record(key);
        h.store.set(&provisional).unwrap();
        h.service.fail_item(key, true);

        h.injector
            .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed);
        assert!(h.injector.block_until_idle(&mut h.feed, WAIT));
        assert_eq!(h.feed.items()[0], provisional.to_item());
        assert_eq!(h.feed.page_count(), 1);
        assert_eq!(h.service.page_calls(FeedKey::Feed), vec![1]);
    }

    #[test]
    fn results_after_teardown_are_dropped() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        h.store.set(&record(key)).unwrap();
        h.service.insert_item(authoritative(key));

        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        h.service.hold_requests(gate_rx);
        h.injector
            .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed);
        assert!(h.service.wait_for_calls(2, WAIT));
        h.injector.teardown();
        gate_tx.send(()).unwrap();

        let late = h.injector.response_rx.recv_timeout(WAIT).unwrap();
        assert!(!h.injector.handle_response(late, &mut h.feed));
        assert_eq!(h.feed.items()[0].likes_count, 0);
        assert_eq!(
            h.injector
                .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed),
            InjectOutcome::Detached
        );
    }

    #[test]
    fn reconciliation_after_feed_unmount_is_dropped() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        h.store.set(&record(key)).unwrap();
        h.service.insert_item(authoritative(key));

        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        h.service.hold_requests(gate_rx);
        assert_eq!(
            h.injector
                .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed),
            InjectOutcome::Inserted
        );
        assert!(h.service.wait_for_calls(2, WAIT));
        h.feed.unmount();
        let pages = h.feed.pages().to_vec();
        gate_tx.send(()).unwrap();

        assert!(h.injector.is_active());
        let late = h.injector.response_rx.recv_timeout(WAIT).unwrap();
        assert!(!h.injector.handle_response(late, &mut h.feed));
        assert_eq!(h.feed.pages(), pages.as_slice());
        assert_eq!(h.feed.items()[0].likes_count, 0);
        assert!(h.injector.awaiting_reconciliation().is_empty());
    }

    #[test]
    fn record_for_visible_content_is_consumed() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 3);
        let mut provisional = record(key);
        provisional.verification_status = VerificationStatus::NoClaims;
        h.store.set(&provisional).unwrap();

        assert_eq!(
            h.injector
                .on_content_ready(ready(key, VerificationStatus::NoClaims), &mut h.feed),
            InjectOutcome::AlreadyVisible
        );
        assert!(h.store.get(key).is_none());
        assert_eq!(count(&h.feed, key), 1);
        assert_eq!(h.feed.items()[2].caption.as_deref(), Some("post 3"));
    }

    #[test]
    fn unmounted_feed_is_left_alone() {
        let mut h = harness();
        let key = ContentKey::new(ContentType::Post, 501);
        h.store.set(&record(key)).unwrap();
        h.feed.unmount();
        assert_eq!(
            h.injector
                .on_content_ready(ready(key, VerificationStatus::NotApplicable), &mut h.feed),
            InjectOutcome::Detached
        );
        assert!(h.store.get(key).is_some());
    }
}
