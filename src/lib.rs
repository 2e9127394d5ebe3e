#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod config;
pub mod content;
pub mod events;
pub mod feed;
pub mod injector;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
pub use feed::{FeedCache, FeedController, FeedOptions};
pub use injector::OptimisticInjector;
