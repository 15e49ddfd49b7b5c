//! Announcement sources.
//!
//! Each configured website is read from its RSS/Atom feed. The first category
//! of an entry becomes the announcement tag.

use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::announcements::Announcement;
use crate::config::{Config, Source};
use crate::db::Website;

#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    fn website(&self) -> &Website;

    /// Fetch the announcements currently listed by the website, oldest first.
    async fn fetch(&self) -> Result<Vec<Announcement>>;
}

pub struct FeedSource {
    website: Website,
    url: String,
    default_tag: String,
    client: reqwest::Client,
}

impl FeedSource {
    pub fn new(source: &Source, client: reqwest::Client) -> Self {
        Self {
            website: source.website.clone(),
            url: source.url.clone(),
            default_tag: source.default_tag.clone(),
            client,
        }
    }
}

#[async_trait]
impl AnnouncementSource for FeedSource {
    fn website(&self) -> &Website {
        &self.website
    }

    async fn fetch(&self) -> Result<Vec<Announcement>> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_feed(&self.website, &self.default_tag, &body)
            .with_context(|| format!("Failed to parse feed {}", self.url))
    }
}

/// Build one source per configured feed, sharing a single HTTP client.
pub fn from_config(config: &Config) -> Result<Vec<Box<dyn AnnouncementSource>>> {
    let client = reqwest::ClientBuilder::new()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("unibot/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(config
        .scraping
        .sources
        .iter()
        .map(|source| {
            Box::new(FeedSource::new(source, client.clone()))
                as Box<dyn AnnouncementSource>
        })
        .collect())
}

fn parse_feed(
    website: &Website,
    default_tag: &str,
    body: &[u8],
) -> Result<Vec<Announcement>> {
    let feed = feed_rs::parser::parse(body)?;
    let mut announcements = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            // The link identifies an announcement; entries without one
            // cannot be deduplicated.
            let link = entry.links.first()?.href.clone();
            let tag = entry
                .categories
                .first()
                .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| default_tag.to_string());
            Some(Announcement {
                website: website.clone(),
                tag,
                title: entry.title.map_or_else(
                    || link.clone(),
                    |t| t.content.trim().to_string(),
                ),
                link,
                published_at: entry.published.or(entry.updated),
            })
        })
        .collect::<Vec<_>>();
    // Feeds list the newest entry first.
    announcements.reverse();
    Ok(announcements)
}
