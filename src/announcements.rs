//! Announcement records and their history table.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::{StorageResult, Website};
use crate::preferences::upsert_tags;
use crate::{models, schema};

/// A single announcement as produced by a source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Announcement {
    pub website: Website,
    pub tag: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Persist a scraped batch and return the announcements that were not
/// already known, in batch order.
///
/// Announcements are unique per `(website, link)`, so an announcement is
/// returned by at most one call. Every tag seen in the batch is registered
/// for its website.
pub fn store_new(
    conn: &mut SqliteConnection,
    batch: Vec<Announcement>,
) -> StorageResult<Vec<Announcement>> {
    let scraped_at = Utc::now().naive_utc();
    let fresh = conn.exclusive_transaction(|conn| {
        upsert_tags(conn, batch.iter().map(|a| (&a.website, a.tag.as_str())))?;

        let mut fresh = Vec::new();
        for announcement in batch {
            let inserted =
                diesel::insert_or_ignore_into(schema::announcements::table)
                    .values(models::NewAnnouncement {
                        website: &announcement.website,
                        tag: &announcement.tag,
                        title: &announcement.title,
                        link: &announcement.link,
                        published_at: announcement
                            .published_at
                            .map(|t| t.naive_utc()),
                        scraped_at,
                    })
                    .execute(conn)?;
            if inserted > 0 {
                fresh.push(announcement);
            }
        }
        crate::db::StorageResult::Ok(fresh)
    })?;
    Ok(fresh)
}

#[cfg(test)]
pub fn announcement(website: &str, tag: &str, title: &str) -> Announcement {
    Announcement {
        website: Website::new(website),
        tag: tag.to_string(),
        title: title.to_string(),
        link: format!("https://example.org/{website}/{title}"),
        published_at: None,
    }
}
