use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::api::{ContentService, FeedKey};
use crate::content::{ContentItem, ContentKey, Page};

pub const DEFAULT_PAGE_SIZE: usize = 12;
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_INTERSECTION_MARGIN: f64 = 400.0;
pub const DEFAULT_INTERSECTION_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedOptions {
    pub page_size: usize,
    pub stale_time: Duration,
    pub intersection_margin: f64,
    pub intersection_threshold: f64,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            stale_time: DEFAULT_STALE_TIME,
            intersection_margin: DEFAULT_INTERSECTION_MARGIN,
            intersection_threshold: DEFAULT_INTERSECTION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("failed to load page {page}: {message}")]
    PageLoad { page: u32, message: String },
    #[error("failed to refresh feed: {message}")]
    Refresh { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Initial,
    NextPage,
    Refreshing,
    Revalidating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// An entry with the same identity is already in the feed.
    Duplicate,
    /// No page has been loaded yet; the first fetch will carry the item.
    NotLoaded,
    Detached,
}

struct CacheEntry {
    pages: Vec<Page>,
    fetched_at: Instant,
}

/// Pages per feed that outlive a single controller, so remounting a feed
/// within the stale window shows it without a network round-trip.
#[derive(Clone, Default)]
pub struct FeedCache {
    entries: Arc<Mutex<HashMap<FeedKey, CacheEntry>>>,
}

impl FeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: FeedKey) -> bool {
        self.entries.lock().contains_key(&key)
    }

    pub fn invalidate(&self, key: FeedKey) -> bool {
        self.entries.lock().remove(&key).is_some()
    }

    fn load(&self, key: FeedKey) -> Option<(Vec<Page>, Instant)> {
        self.entries
            .lock()
            .get(&key)
            .map(|entry| (entry.pages.clone(), entry.fetched_at))
    }

    fn store(&self, key: FeedKey, pages: Vec<Page>, fetched_at: Instant) {
        self.entries
            .lock()
            .insert(key, CacheEntry { pages, fetched_at });
    }
}

/// Vertical extent of an element, in the same coordinate space as the
/// viewport it is tested against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub top: f64,
    pub bottom: f64,
}

impl Bounds {
    pub fn new(top: f64, height: f64) -> Self {
        Self {
            top,
            bottom: top + height.max(0.0),
        }
    }

    pub fn height(&self) -> f64 {
        (self.bottom - self.top).max(0.0)
    }
}

/// Viewport-intersection watch over the sentinel at the end of the list.
#[derive(Debug, Clone)]
pub struct EndOfListWatch {
    sentinel: Bounds,
    margin: f64,
    threshold: f64,
    intersecting: bool,
}

impl EndOfListWatch {
    pub fn new(sentinel: Bounds, margin: f64, threshold: f64) -> Self {
        Self {
            sentinel,
            margin: margin.max(0.0),
            threshold: threshold.clamp(0.0, 1.0),
            intersecting: false,
        }
    }

    /// Fraction of the sentinel inside the viewport grown by the margin.
    pub fn ratio(&self, viewport: Bounds) -> f64 {
        let root_top = viewport.top - self.margin;
        let root_bottom = viewport.bottom + self.margin;
        let height = self.sentinel.height();
        if height == 0.0 {
            let inside = self.sentinel.top >= root_top && self.sentinel.top <= root_bottom;
            return if inside { 1.0 } else { 0.0 };
        }
        let overlap =
            self.sentinel.bottom.min(root_bottom) - self.sentinel.top.max(root_top);
        (overlap.max(0.0) / height).min(1.0)
    }

    /// True only when the sentinel enters; staying visible is not a new event.
    pub fn update(&mut self, viewport: Bounds) -> bool {
        let ratio = self.ratio(viewport);
        let now = ratio > 0.0 && ratio >= self.threshold;
        let entered = now && !self.intersecting;
        self.intersecting = now;
        entered
    }

    pub fn is_intersecting(&self) -> bool {
        self.intersecting
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Append(u32),
    Replace,
    Revalidate,
}

struct PendingFetch {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
    kind: FetchKind,
}

enum Fetched {
    Page(Page),
    Pages(Vec<Page>),
}

struct FeedResponse {
    request_id: u64,
    result: Result<Fetched>,
}

/// Owns the paginated item sequence of one feed. All mutation happens on the
/// owning thread; fetches run on background threads and are applied by
/// [`FeedController::poll`].
pub struct FeedController {
    key: FeedKey,
    service: Arc<dyn ContentService>,
    cache: FeedCache,
    opts: FeedOptions,
    pages: Vec<Page>,
    fetched_at: Option<Instant>,
    error: Option<FeedError>,
    pending: Option<PendingFetch>,
    response_tx: Sender<FeedResponse>,
    response_rx: Receiver<FeedResponse>,
    next_request_id: u64,
    watch: Option<EndOfListWatch>,
    mounted: bool,
}

impl FeedController {
    /// Reuses fresh cached pages, shows stale ones while revalidating, and
    /// otherwise starts loading page 1.
    pub fn mount(
        key: FeedKey,
        service: Arc<dyn ContentService>,
        cache: FeedCache,
        opts: FeedOptions,
    ) -> Self {
        let (response_tx, response_rx) = unbounded();
        let mut opts = opts;
        if opts.page_size == 0 {
            opts.page_size = DEFAULT_PAGE_SIZE;
        }
        let mut controller = Self {
            key,
            service,
            cache,
            opts,
            pages: Vec::new(),
            fetched_at: None,
            error: None,
            pending: None,
            response_tx,
            response_rx,
            next_request_id: 1,
            watch: None,
            mounted: true,
        };

        match controller.cache.load(key) {
            Some((pages, fetched_at)) => {
                tracing::debug!(feed = %key, pages = pages.len(), "mounted from cache");
                controller.pages = pages;
                controller.fetched_at = Some(fetched_at);
                controller.revalidate_if_stale();
            }
            None => {
                controller.request_next_page();
            }
        }
        controller
    }

    pub fn key(&self) -> FeedKey {
        self.key
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Flattened items in fetch order, first occurrence of each identity wins.
    pub fn items(&self) -> Vec<ContentItem> {
        self.unique_items().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.unique_items().count()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|page| page.items.is_empty())
    }

    pub fn contains(&self, key: ContentKey) -> bool {
        self.pages
            .iter()
            .flat_map(|page| page.items.iter())
            .any(|item| item.key() == key)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Nothing fetched yet counts as more to load; afterwards only a full
    /// last page does.
    pub fn has_more(&self) -> bool {
        match self.pages.last() {
            Some(page) => page.is_full(self.opts.page_size),
            None => true,
        }
    }

    pub fn error(&self) -> Option<&FeedError> {
        self.error.as_ref()
    }

    pub fn load_state(&self) -> LoadState {
        match self.pending.as_ref().map(|pending| pending.kind) {
            None => LoadState::Idle,
            Some(FetchKind::Append(_)) if self.pages.is_empty() => LoadState::Initial,
            Some(FetchKind::Append(_)) => LoadState::NextPage,
            Some(FetchKind::Replace) => LoadState::Refreshing,
            Some(FetchKind::Revalidate) => LoadState::Revalidating,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.load_state() == LoadState::NextPage
    }

    /// True while stale cached pages are being refreshed in the background.
    pub fn is_revalidating(&self) -> bool {
        self.load_state() == LoadState::Revalidating
    }

    pub fn is_stale(&self) -> bool {
        match self.fetched_at {
            Some(fetched_at) => fetched_at.elapsed() >= self.opts.stale_time,
            None => true,
        }
    }

    /// Requests page `page_count + 1`. Returns false when a fetch is already
    /// in flight, the feed is exhausted, or the controller is unmounted.
    pub fn request_next_page(&mut self) -> bool {
        if !self.mounted || self.pending.is_some() || !self.has_more() {
            return false;
        }
        let number = self.pages.len() as u32 + 1;
        self.spawn_page(number, FetchKind::Append(number));
        true
    }

    /// Reloads from page 1. The current items stay visible until the new
    /// first page arrives and replaces every cached page.
    pub fn refetch(&mut self) {
        if !self.mounted {
            return;
        }
        self.cancel_pending();
        self.spawn_page(1, FetchKind::Replace);
    }

    pub fn revalidate_if_stale(&mut self) -> bool {
        if !self.mounted || self.pending.is_some() || self.pages.is_empty() || !self.is_stale() {
            return false;
        }
        self.spawn_revalidate();
        true
    }

    pub fn observe_end_of_list(&mut self, sentinel: Bounds) {
        self.watch = Some(EndOfListWatch::new(
            sentinel,
            self.opts.intersection_margin,
            self.opts.intersection_threshold,
        ));
    }

    pub fn stop_observing(&mut self) {
        self.watch = None;
    }

    /// Feeds a viewport change to the end-of-list watch. Returns true when
    /// the intersection led to a page request.
    pub fn on_viewport(&mut self, viewport: Bounds) -> bool {
        let Some(watch) = self.watch.as_mut() else {
            return false;
        };
        if !watch.update(viewport) {
            return false;
        }
        self.request_next_page()
    }

    /// Places `item` at the head of the first page and trims that page back
    /// to its capacity. An item pushed off a page moves to the head of the
    /// next loaded page, so nothing leaves the sequence once a later page is
    /// loaded. With a single page the pushed-out item is dropped; the shifted
    /// second page returns it. The identity check runs against the live
    /// sequence.
    pub fn prepend_and_trim(&mut self, item: ContentItem) -> MergeOutcome {
        if !self.mounted {
            return MergeOutcome::Detached;
        }
        if self.contains(item.key()) {
            return MergeOutcome::Duplicate;
        }
        if self.pages.is_empty() {
            return MergeOutcome::NotLoaded;
        }
        let page_size = self.opts.page_size;
        let last = self.pages.len() - 1;
        let mut carry = Some(item);
        for (index, page) in self.pages.iter_mut().enumerate() {
            let Some(item) = carry.take() else {
                break;
            };
            let capacity = page.items.len().max(page_size);
            page.items.insert(0, item);
            // the last page of several absorbs the overflow
            if (index == 0 || index < last) && page.items.len() > capacity {
                carry = page.items.pop();
            }
        }
        if let Some(dropped) = carry {
            tracing::trace!(feed = %self.key, key = %dropped.key(), "trimmed off the only loaded page");
        }
        self.snapshot();
        MergeOutcome::Inserted
    }

    /// Swaps the entry with the same identity for `item`, keeping its
    /// position. Returns false if the entry is gone.
    pub fn replace_item(&mut self, item: ContentItem) -> bool {
        if !self.mounted {
            return false;
        }
        let key = item.key();
        let slot = self
            .pages
            .iter_mut()
            .flat_map(|page| page.items.iter_mut())
            .find(|existing| existing.key() == key);
        let Some(slot) = slot else {
            return false;
        };
        *slot = item;
        self.snapshot();
        true
    }

    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            changed |= self.handle_response(message);
        }
        changed
    }

    /// Applies responses until nothing is in flight. Returns false on timeout.
    pub fn block_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.poll();
        while self.pending.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(message) => {
                    self.handle_response(message);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false;
                }
            }
        }
        true
    }

    /// Tears the feed down: in-flight results are dropped on arrival and the
    /// pages are handed back to the shared cache.
    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.cancel_pending();
        self.snapshot();
        self.watch = None;
        self.mounted = false;
    }

    fn unique_items(&self) -> impl Iterator<Item = &ContentItem> {
        let mut seen = HashSet::new();
        self.pages
            .iter()
            .flat_map(|page| page.items.iter())
            .filter(move |item| seen.insert(item.key()))
    }

    fn take_request_id(&mut self) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        request_id
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_page(&mut self, number: u32, kind: FetchKind) {
        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingFetch {
            request_id,
            cancel_flag: cancel_flag.clone(),
            kind,
        });

        let tx = self.response_tx.clone();
        let service = self.service.clone();
        let key = self.key;
        let page_size = self.opts.page_size;
        tracing::debug!(feed = %key, page = number, request_id, "requesting page");
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service
                .fetch_page(key, number, page_size)
                .map(Fetched::Page);
            let _ = tx.send(FeedResponse { request_id, result });
        });
    }

    fn spawn_revalidate(&mut self) {
        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingFetch {
            request_id,
            cancel_flag: cancel_flag.clone(),
            kind: FetchKind::Revalidate,
        });

        let tx = self.response_tx.clone();
        let service = self.service.clone();
        let key = self.key;
        let page_size = self.opts.page_size;
        let count = self.pages.len().max(1) as u32;
        tracing::debug!(feed = %key, pages = count, request_id, "revalidating cached pages");
        thread::spawn(move || {
            let mut pages = Vec::new();
            for number in 1..=count {
                if cancel_flag.load(Ordering::SeqCst) {
                    return;
                }
                match service.fetch_page(key, number, page_size) {
                    Ok(page) => {
                        let full = page.is_full(page_size);
                        pages.push(page);
                        if !full {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(FeedResponse {
                            request_id,
                            result: Err(err),
                        });
                        return;
                    }
                }
            }
            let _ = tx.send(FeedResponse {
                request_id,
                result: Ok(Fetched::Pages(pages)),
            });
        });
    }

    fn handle_response(&mut self, message: FeedResponse) -> bool {
        if !self.mounted {
            tracing::trace!(feed = %self.key, request_id = message.request_id, "dropping response after unmount");
            return false;
        }
        let Some(pending) = &self.pending else {
            return false;
        };
        if pending.cancel_flag.load(Ordering::SeqCst) || pending.request_id != message.request_id {
            tracing::trace!(feed = %self.key, request_id = message.request_id, "dropping stale response");
            return false;
        }
        let kind = pending.kind;
        self.pending = None;

        match (kind, message.result) {
            (FetchKind::Append(number), Ok(Fetched::Page(mut page))) => {
                if number as usize != self.pages.len() + 1 {
                    tracing::warn!(feed = %self.key, page = number, "page no longer follows the cached pages");
                    return false;
                }
                page.number = number;
                tracing::debug!(feed = %self.key, page = number, items = page.items.len(), "page loaded");
                self.pages.push(page);
                if self.fetched_at.is_none() {
                    self.fetched_at = Some(Instant::now());
                }
                self.error = None;
            }
            (FetchKind::Replace, Ok(Fetched::Page(mut page))) => {
                page.number = 1;
                tracing::debug!(feed = %self.key, items = page.items.len(), "feed refetched");
                self.pages = vec![page];
                self.fetched_at = Some(Instant::now());
                self.error = None;
            }
            (FetchKind::Revalidate, Ok(Fetched::Pages(mut pages))) => {
                for (index, page) in pages.iter_mut().enumerate() {
                    page.number = index as u32 + 1;
                }
                tracing::debug!(feed = %self.key, pages = pages.len(), "feed revalidated");
                self.pages = pages;
                self.fetched_at = Some(Instant::now());
                self.error = None;
            }
            (FetchKind::Append(number), Err(err)) => {
                tracing::warn!(feed = %self.key, page = number, "page fetch failed: {err:#}");
                self.error = Some(FeedError::PageLoad {
                    page: number,
                    message: format!("{err:#}"),
                });
                return true;
            }
            (FetchKind::Replace, Err(err)) => {
                tracing::warn!(feed = %self.key, "refetch failed: {err:#}");
                self.error = Some(FeedError::Refresh {
                    message: format!("{err:#}"),
                });
                return true;
            }
            (FetchKind::Revalidate, Err(err)) => {
                tracing::warn!(feed = %self.key, "background revalidation failed, keeping cached pages: {err:#}");
                return false;
            }
            (_, Ok(_)) => return false,
        }
        self.snapshot();
        true
    }

    fn snapshot(&self) {
        if let Some(fetched_at) = self.fetched_at {
            self.cache.store(self.key, self.pages.clone(), fetched_at);
        }
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        self.unmount();
    }
}
