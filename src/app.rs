use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;

use crate::api::{ClientConfig, ContentService, FeedKey, MockContentService, RestContentService};
use crate::config;
use crate::content::{
    ContentItem, ContentKey, ContentType, ProvisionalRecord, UserSummary, VerificationStatus,
};
use crate::events::{ContentReady, EventBus};
use crate::feed::{FeedCache, FeedController};
use crate::injector::OptimisticInjector;
use crate::storage::{MemoryProvisionalStore, ProvisionalStore};

const LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const DEMO_FEED_LEN: i64 = 20;
const DEMO_UPLOAD_ID: i64 = 9001;

/// Verifeed - Browse a fact-checked feed from the terminal.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "verifeed", version, about, long_about = None)]
pub struct RunOptions {
    /// Feed to load: feed or explore.
    #[arg(long, default_value = "feed")]
    pub feed: FeedKey,

    /// Pages to load before printing.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub pages: u32,

    /// Config file (default: platform config dir).
    #[arg(long = "config", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Use bundled demo content.
    #[arg(long)]
    pub offline: bool,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: opts.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;

    let page_size = cfg.feed.page_size;
    let offline = opts.offline || cfg.api.base_url.trim().is_empty();
    let demo = offline.then(|| Arc::new(demo_service(page_size)));
    let service: Arc<dyn ContentService> = match &demo {
        Some(mock) => mock.clone() as Arc<dyn ContentService>,
        None => Arc::new(
            RestContentService::new(ClientConfig {
                base_url: cfg.api.base_url.clone(),
                user_agent: cfg.api.user_agent.clone(),
                timeout: Some(cfg.api.timeout),
                http_client: None,
            })
            .context("create content client")?,
        ),
    };
    if offline {
        tracing::info!("no api.base_url configured or --offline given; using demo content");
    }

    let store = Arc::new(MemoryProvisionalStore::new(cfg.storage.store_options()));
    let bus = EventBus::new();
    let mut feed = FeedController::mount(
        opts.feed,
        service.clone(),
        FeedCache::new(),
        cfg.feed.feed_options(),
    );
    let mut injector = OptimisticInjector::new(
        bus.subscribe(),
        store.clone(),
        service,
        cfg.feed.injector_options(),
    );

    loop {
        if !feed.block_until_idle(LOAD_TIMEOUT) {
            bail!("timed out loading {}", feed.key());
        }
        if let Some(err) = feed.error() {
            bail!("{err}");
        }
        if feed.page_count() >= opts.pages as usize || !feed.has_more() {
            break;
        }
        feed.request_next_page();
    }

    if let Some(mock) = &demo {
        simulate_upload(mock, store.as_ref(), &bus)?;
        injector.poll(&mut feed);
        if !injector.block_until_idle(&mut feed, LOAD_TIMEOUT) {
            bail!("timed out reconciling demo upload");
        }
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    print_feed(&mut out, &feed).context("write feed")?;
    Ok(())
}

fn print_feed(out: &mut impl Write, feed: &FeedController) -> io::Result<()> {
    let items = feed.items();
    let tail = if feed.has_more() {
        "more available"
    } else {
        "end of feed"
    };
    writeln!(
        out,
        "{}: {} page{}, {} items, {}",
        feed.key().display_name(),
        feed.page_count(),
        if feed.page_count() == 1 { "" } else { "s" },
        items.len(),
        tail
    )?;
    for (index, item) in items.iter().enumerate() {
        writeln!(out, "{}", format_item(index + 1, item))?;
    }
    Ok(())
}

pub fn format_item(position: usize, item: &ContentItem) -> String {
    let caption = item.caption.as_deref().unwrap_or("").trim();
    format!(
        "{:>3}. {} @{} [{}] {}",
        position,
        item.key(),
        item.author.username,
        item.verification_status,
        caption
    )
    .trim_end()
    .to_string()
}

/// Offline content for both feeds, alternating posts and reels.
pub fn demo_service(page_size: usize) -> MockContentService {
    let service = MockContentService::new();
    for (feed, offset) in [(FeedKey::Feed, 0), (FeedKey::Explore, 1000)] {
        let items = (1..=DEMO_FEED_LEN)
            .map(|n| {
                let kind = if n % 3 == 0 {
                    ContentType::Reel
                } else {
                    ContentType::Post
                };
                demo_item(kind, offset + n)
            })
            .collect();
        service.set_feed(feed, items, page_size);
    }
    service
}

fn demo_item(kind: ContentType, id: i64) -> ContentItem {
    let status = match id % 4 {
        0 => VerificationStatus::Verified,
        1 => VerificationStatus::NoClaims,
        2 => VerificationStatus::NotApplicable,
        _ => VerificationStatus::Disputed,
    };
    ContentItem {
        id,
        kind,
        author: demo_author(id),
        caption: Some(format!("Sample {kind} #{id}")),
        media_url: None,
        created_at: None,
        likes_count: (id * 7) % 50,
        comments_count: id % 6,
        is_liked: false,
        verification_status: status,
        extra: serde_json::Map::new(),
    }
}

fn demo_author(id: i64) -> UserSummary {
    const NAMES: [&str; 4] = ["amara", "kenji", "lucia", "tomas"];
    let index = id.rem_euclid(NAMES.len() as i64) as usize;
    UserSummary {
        id: index as i64 + 1,
        username: NAMES[index].to_string(),
        avatar: None,
    }
}

/// Plays the upload flow: provisional record first, completion event once
/// processing found no claims to check.
fn simulate_upload(
    service: &MockContentService,
    store: &dyn ProvisionalStore,
    bus: &EventBus,
) -> Result<()> {
    let key = ContentKey::new(ContentType::Post, DEMO_UPLOAD_ID);
    let record = ProvisionalRecord {
        id: key.id,
        kind: key.kind,
        author: UserSummary {
            id: 0,
            username: "you".into(),
            avatar: None,
        },
        caption: Some("Your new post".into()),
        media_url: None,
        created_at: Some(Utc::now()),
        verification_status: VerificationStatus::NotApplicable,
        stored_at: Utc::now(),
    };
    store.set(&record)?;
    service.insert_item(record.to_item());
    let delivered = bus.publish(ContentReady::new(key, VerificationStatus::NotApplicable));
    tracing::debug!(%key, delivered, "published demo upload");
    Ok(())
}
