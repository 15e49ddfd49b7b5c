//! Match a batch of announcements against user preferences.

use crate::announcements::Announcement;
use crate::db::DbTagId;
use crate::models::User;
use crate::preferences::{PreferenceSnapshot, TagIndex};

/// Announcements selected for one user.
#[derive(Debug)]
pub struct Delivery<'a> {
    pub user: User,
    pub announcements: Vec<&'a Announcement>,
}

/// Compute, for every user, the announcements they have not opted out of.
///
/// Users are visited in the given order and each user's announcements keep
/// batch order. Users left with nothing are omitted.
///
/// An announcement whose tag is not in `tags` can not be muted at tag level;
/// it still reaches everyone who did not mute its website.
pub fn filter_announcements<'a>(
    announcements: &'a [Announcement],
    users: &[User],
    prefs: &PreferenceSnapshot,
    tags: &TagIndex,
) -> Vec<Delivery<'a>> {
    // Resolve tags once per batch instead of once per user.
    let resolved: Vec<(&Announcement, Option<DbTagId>)> = announcements
        .iter()
        .map(|a| (a, tags.resolve(&a.website, &a.tag)))
        .collect();

    users
        .iter()
        .filter_map(|user| {
            let selected = resolved
                .iter()
                .filter(|(a, tag)| {
                    !prefs.is_website_muted(user.id, &a.website)
                        && !tag.is_some_and(|t| prefs.is_tag_muted(user.id, t))
                })
                .map(|&(a, _)| a)
                .collect::<Vec<_>>();
            (!selected.is_empty()).then(|| Delivery {
                user: user.clone(),
                announcements: selected,
            })
        })
        .collect()
}
