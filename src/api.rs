use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::content::{ContentItem, ContentKey, Page};

/// Cache partition for a paginated feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedKey {
    #[default]
    Feed,
    Explore,
}

impl FeedKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKey::Feed => "feed",
            FeedKey::Explore => "explore",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            FeedKey::Feed => "Following",
            FeedKey::Explore => "Explore",
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" | "following" => Ok(FeedKey::Feed),
            "explore" => Ok(FeedKey::Explore),
            other => bail!("unknown feed {other:?} (expected feed or explore)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("content {0} not found")]
    NotFound(ContentKey),
    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Network collaborator. Implementations must return an error on transport
/// failure instead of blocking forever.
pub trait ContentService: Send + Sync {
    fn fetch_page(&self, feed: FeedKey, page: u32, page_size: usize) -> Result<Page>;
    fn fetch_item(&self, key: ContentKey) -> Result<ContentItem>;
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct RestContentService {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    Wrapped { items: Vec<ContentItem> },
    Bare(Vec<ContentItem>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ItemBody {
    Wrapped { item: ContentItem },
    Bare(ContentItem),
}

impl RestContentService {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("content client user agent required");
        }
        let mut base = config.base_url.trim().to_string();
        if base.is_empty() {
            bail!("content client base url required");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("parse api base url {base:?}"))?;

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("build content HTTP client")?,
        };

        Ok(Self {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("build url for {path}"))
    }

    fn get(&self, url: Url) -> Result<reqwest::blocking::Response> {
        let response = self
            .http
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .send()
            .with_context(|| format!("request {url}"))?;
        Ok(response)
    }
}

impl ContentService for RestContentService {
    fn fetch_page(&self, feed: FeedKey, page: u32, page_size: usize) -> Result<Page> {
        let mut url = self.endpoint(&format!("api/{}", feed.as_str()))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &page_size.to_string());

        let response = self.get(url)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ApiError::Status { status, body }.into());
        }
        let body: PageBody = response
            .json()
            .with_context(|| format!("decode {feed} page {page}"))?;
        let items = match body {
            PageBody::Wrapped { items } => items,
            PageBody::Bare(items) => items,
        };
        Ok(Page::new(page, items))
    }

    fn fetch_item(&self, key: ContentKey) -> Result<ContentItem> {
        let url = self.endpoint(&format!("api/{}/{}", key.kind.collection(), key.id))?;
        let response = self.get(url)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(key).into());
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ApiError::Status { status, body }.into());
        }
        let body: ItemBody = response
            .json()
            .with_context(|| format!("decode content {key}"))?;
        Ok(match body {
            ItemBody::Wrapped { item } => item,
            ItemBody::Bare(item) => item,
        })
    }
}

/// Scripted in-memory backend used for offline browsing and tests.
#[derive(Default)]
pub struct MockContentService {
    pages: Mutex<HashMap<(FeedKey, u32), Vec<ContentItem>>>,
    items: Mutex<HashMap<ContentKey, ContentItem>>,
    failing_pages: Mutex<HashSet<(FeedKey, u32)>>,
    failing_items: Mutex<HashSet<ContentKey>>,
    gate: Mutex<Option<Receiver<()>>>,
    calls: Mutex<Vec<MockCall>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Page(FeedKey, u32),
    Item(ContentKey),
}

impl MockContentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `items` split into consecutive pages of `page_size`.
    pub fn with_feed(feed: FeedKey, items: Vec<ContentItem>, page_size: usize) -> Self {
        let service = Self::new();
        service.set_feed(feed, items, page_size);
        service
    }

    pub fn set_feed(&self, feed: FeedKey, items: Vec<ContentItem>, page_size: usize) {
        let mut pages = self.pages.lock();
        pages.retain(|(key, _), _| *key != feed);
        let mut catalog = self.items.lock();
        for item in &items {
            catalog.insert(item.key(), item.clone());
        }
        for (index, chunk) in items.chunks(page_size.max(1)).enumerate() {
            pages.insert((feed, index as u32 + 1), chunk.to_vec());
        }
    }

    pub fn set_page(&self, feed: FeedKey, page: u32, items: Vec<ContentItem>) {
        self.pages.lock().insert((feed, page), items);
    }

    pub fn insert_item(&self, item: ContentItem) {
        self.items.lock().insert(item.key(), item);
    }

    pub fn fail_page(&self, feed: FeedKey, page: u32, failing: bool) {
        let mut set = self.failing_pages.lock();
        if failing {
            set.insert((feed, page));
        } else {
            set.remove(&(feed, page));
        }
    }

    pub fn fail_item(&self, key: ContentKey, failing: bool) {
        let mut set = self.failing_items.lock();
        if failing {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Every request waits for one message on `gate` before answering.
    pub fn hold_requests(&self, gate: Receiver<()>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn release_requests(&self) {
        *self.gate.lock() = None;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn page_calls(&self, feed: FeedKey) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::Page(key, page) if *key == feed => Some(*page),
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `count` requests have been received.
    pub fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.calls.lock().len() < count {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn wait_gate(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
    }
}

impl ContentService for MockContentService {
    fn fetch_page(&self, feed: FeedKey, page: u32, _page_size: usize) -> Result<Page> {
        self.calls.lock().push(MockCall::Page(feed, page));
        self.wait_gate();
        if self.failing_pages.lock().contains(&(feed, page)) {
            return Err(anyhow!("network error fetching {feed} page {page}"));
        }
        let items = self
            .pages
            .lock()
            .get(&(feed, page))
            .cloned()
            .unwrap_or_default();
        Ok(Page::new(page, items))
    }

    fn fetch_item(&self, key: ContentKey) -> Result<ContentItem> {
        self.calls.lock().push(MockCall::Item(key));
        self.wait_gate();
        if self.failing_items.lock().contains(&key) {
            return Err(anyhow!("network error fetching {key}"));
        }
        self.items
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key).into())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::content::ContentType;

    #[test]
    fn feed_key_parses_aliases() {
        assert_eq!("explore".parse::<FeedKey>().unwrap(), FeedKey::Explore);
        assert_eq!(" Following ".parse::<FeedKey>().unwrap(), FeedKey::Feed);
        assert!("reels".parse::<FeedKey>().is_err());
    }

    #[test]
    fn rest_client_requires_user_agent_and_base() {
        let missing_agent = RestContentService::new(ClientConfig {
            base_url: "http://localhost:8000".into(),
            ..ClientConfig::default()
        });
        assert!(missing_agent.is_err());

        let missing_base = RestContentService::new(ClientConfig {
            user_agent: "verifeed-test".into(),
            ..ClientConfig::default()
        });
        assert!(missing_base.is_err());
    }

    #[test]
    fn rest_client_builds_paths_under_base() {
        let client = RestContentService::new(ClientConfig {
            base_url: "http://localhost:8000/v1".into(),
            user_agent: "verifeed-test".into(),
            ..ClientConfig::default()
        })
        .unwrap();
        let url = client.endpoint("api/reels/4").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/v1/api/reels/4");
    }

    #[test]
    fn page_body_accepts_both_shapes() {
        let wrapped = r#"{"items":[{"id":1,"type":"post","author":{"id":1,"username":"a"}}]}"#;
        let bare = r#"[{"id":1,"type":"post","author":{"id":1,"username":"a"}}]"#;
        for raw in [wrapped, bare] {
            let body: PageBody = serde_json::from_str(raw).unwrap();
            let items = match body {
                PageBody::Wrapped { items } => items,
                PageBody::Bare(items) => items,
            };
            assert_eq!(items.len(), 1);
        }
    }

    #[test]
    fn mock_splits_feed_into_pages() {
        let service = MockContentService::with_feed(FeedKey::Feed, posts(1..=20), 12);
        assert_eq!(service.fetch_page(FeedKey::Feed, 1, 12).unwrap().items.len(), 12);
        assert_eq!(service.fetch_page(FeedKey::Feed, 2, 12).unwrap().items.len(), 8);
        assert!(service.fetch_page(FeedKey::Feed, 3, 12).unwrap().items.is_empty());
        assert_eq!(service.page_calls(FeedKey::Feed), vec![1, 2, 3]);
    }

    #[test]
    fn mock_reports_missing_items_as_not_found() {
        let service = MockContentService::new();
        let err = service
            .fetch_item(crate::content::ContentKey::new(ContentType::Reel, 3))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::NotFound(_))
        ));
    }
}
