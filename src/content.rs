use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Post,
    Reel,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Post => "post",
            ContentType::Reel => "reel",
        }
    }

    /// REST collection segment for single-item lookups.
    pub fn collection(&self) -> &'static str {
        match self {
            ContentType::Post => "posts",
            ContentType::Reel => "reels",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a feed entry. Ids are only unique within a content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub kind: ContentType,
    pub id: i64,
}

impl ContentKey {
    pub fn new(kind: ContentType, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn storage_key(&self) -> String {
        format!("provisional:{}:{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Disputed,
    Unverified,
    #[default]
    Pending,
    NotApplicable,
    NoClaims,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Disputed => "disputed",
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Pending => "pending",
            VerificationStatus::NotApplicable => "not_applicable",
            VerificationStatus::NoClaims => "no_claims",
        }
    }

    /// Content with checkable claims waits on the author's fact-check review
    /// before it may appear in a public feed.
    pub fn requires_review(&self) -> bool {
        !matches!(
            self,
            VerificationStatus::NotApplicable | VerificationStatus::NoClaims
        )
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub author: UserSummary,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub likes_count: i64,
    #[serde(default)]
    pub comments_count: i64,
    #[serde(default)]
    pub is_liked: bool,
    #[serde(default)]
    pub verification_status: VerificationStatus,
    /// Remaining server fields, carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentItem {
    pub fn key(&self) -> ContentKey {
        ContentKey::new(self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub number: u32,
    pub items: Vec<ContentItem>,
}

impl Page {
    pub fn new(number: u32, items: Vec<ContentItem>) -> Self {
        Self { number, items }
    }

    /// A page shorter than the requested size marks the end of the feed.
    pub fn is_full(&self, page_size: usize) -> bool {
        self.items.len() >= page_size
    }
}

/// Client-held shadow of freshly uploaded content, written by the upload flow
/// and consumed once by the injector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionalRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub author: UserSummary,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verification_status: VerificationStatus,
    pub stored_at: DateTime<Utc>,
}

impl ProvisionalRecord {
    pub fn key(&self) -> ContentKey {
        ContentKey::new(self.kind, self.id)
    }

    pub fn to_item(&self) -> ContentItem {
        ContentItem {
            id: self.id,
            kind: self.kind,
            author: self.author.clone(),
            caption: self.caption.clone(),
            media_url: self.media_url.clone(),
            created_at: self.created_at.or(Some(self.stored_at)),
            likes_count: 0,
            comments_count: 0,
            is_liked: false,
            verification_status: self.verification_status,
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_decodes_type_field_and_keeps_extras() {
        let raw = r#"{
            "id": 7,
            "type": "reel",
            "author": {"id": 3, "username": "ana"},
            "likes_count": 4,
            "verification_status": "disputed",
            "claims": [{"text": "water is dry"}]
        }"#;
        let item: ContentItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.key(), ContentKey::new(ContentType::Reel, 7));
        assert_eq!(item.verification_status, VerificationStatus::Disputed);
        assert!(item.extra.contains_key("claims"));
        assert!(!item.is_liked);
    }

    #[test]
    fn only_claimless_content_skips_review() {
        assert!(!VerificationStatus::NotApplicable.requires_review());
        assert!(!VerificationStatus::NoClaims.requires_review());
        assert!(VerificationStatus::Pending.requires_review());
        assert!(VerificationStatus::Verified.requires_review());
        assert!(VerificationStatus::Disputed.requires_review());
    }

    #[test]
    fn keys_distinguish_types() {
        let post = ContentKey::new(ContentType::Post, 501);
        let reel = ContentKey::new(ContentType::Reel, 501);
        assert_ne!(post, reel);
        assert_eq!(post.storage_key(), "provisional:post:501");
        assert_eq!(reel.to_string(), "reel:501");
    }

    #[test]
    fn provisional_record_synthesizes_blank_engagement() {
        let record = ProvisionalRecord {
            id: 9,
            kind: ContentType::Post,
            author: UserSummary {
                id: 1,
                username: "me".into(),
                avatar: None,
            },
            caption: Some("hello".into()),
            media_url: None,
            created_at: None,
            verification_status: VerificationStatus::NotApplicable,
            stored_at: Utc::now(),
        };
        let item = record.to_item();
        assert_eq!(item.key(), record.key());
        assert_eq!(item.likes_count, 0);
        assert_eq!(item.created_at, Some(record.stored_at));
        assert!(item.extra.is_empty());
    }
}
