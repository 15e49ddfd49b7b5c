//! Per-user opt-out preferences.
//!
//! Preferences are stored with opt-out polarity: a user is interested in every
//! website and tag unless an `uninterested_*` row says otherwise, so a freshly
//! registered user receives everything.

use std::collections::{BTreeSet, HashMap, HashSet};

use diesel::prelude::*;

use crate::db::{DbChatId, DbTagId, DbUserId, StorageResult, Website};
use crate::{models, schema};

/// Register a user, or return the existing row for this chat.
pub fn register_user(
    conn: &mut SqliteConnection,
    chat_id: DbChatId,
) -> StorageResult<models::User> {
    diesel::insert_or_ignore_into(schema::users::table)
        .values(models::NewUser { chat_id })
        .execute(conn)?;
    let user = schema::users::table
        .filter(schema::users::chat_id.eq(chat_id))
        .select(models::User::as_select())
        .get_result(conn)?;
    Ok(user)
}

pub fn find_user(
    conn: &mut SqliteConnection,
    chat_id: DbChatId,
) -> StorageResult<Option<models::User>> {
    Ok(schema::users::table
        .filter(schema::users::chat_id.eq(chat_id))
        .select(models::User::as_select())
        .get_result(conn)
        .optional()?)
}

pub fn list_all_users(
    conn: &mut SqliteConnection,
) -> StorageResult<Vec<models::User>> {
    Ok(schema::users::table
        .order(schema::users::id.asc())
        .select(models::User::as_select())
        .load(conn)?)
}

/// Replace every opt-out row of `user` with the given sets.
///
/// Runs in a single exclusive transaction: on error nothing is changed.
pub fn replace_preferences(
    conn: &mut SqliteConnection,
    user: DbUserId,
    muted_websites: &BTreeSet<Website>,
    muted_tags: &BTreeSet<DbTagId>,
) -> StorageResult<()> {
    conn.exclusive_transaction(|conn| {
        use schema::{uninterested_in as ui, uninterested_websites as uw};

        diesel::delete(ui::table.filter(ui::user_id.eq(user))).execute(conn)?;
        diesel::delete(uw::table.filter(uw::user_id.eq(user))).execute(conn)?;

        if !muted_websites.is_empty() {
            diesel::insert_into(uw::table)
                .values(
                    muted_websites
                        .iter()
                        .map(|website| models::UninterestedWebsite {
                            user_id: user,
                            website: website.clone(),
                        })
                        .collect::<Vec<_>>(),
                )
                .execute(conn)?;
        }
        if !muted_tags.is_empty() {
            diesel::insert_into(ui::table)
                .values(
                    muted_tags
                        .iter()
                        .map(|&tag_id| models::UninterestedIn {
                            user_id: user,
                            tag_id,
                        })
                        .collect::<Vec<_>>(),
                )
                .execute(conn)?;
        }
        diesel::QueryResult::Ok(())
    })?;
    Ok(())
}

/// A consistent in-memory copy of the opt-out rows.
///
/// Loaded once per notification cycle so that filtering never goes back to
/// the database, and preference edits made meanwhile only apply to the next
/// cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PreferenceSnapshot {
    muted_websites: HashMap<DbUserId, HashSet<Website>>,
    muted_tags: HashMap<DbUserId, HashSet<DbTagId>>,
}

impl PreferenceSnapshot {
    /// Load the preferences of every user.
    pub fn load(conn: &mut SqliteConnection) -> StorageResult<Self> {
        Self::load_filtered(conn, None)
    }

    /// Load the preferences of a single user.
    pub fn load_user(
        conn: &mut SqliteConnection,
        user: DbUserId,
    ) -> StorageResult<Self> {
        Self::load_filtered(conn, Some(user))
    }

    fn load_filtered(
        conn: &mut SqliteConnection,
        user: Option<DbUserId>,
    ) -> StorageResult<Self> {
        use schema::{uninterested_in as ui, uninterested_websites as uw};

        let (websites, tags) = conn.transaction(|conn| {
            let mut websites_query = uw::table
                .select(models::UninterestedWebsite::as_select())
                .into_boxed();
            let mut tags_query = ui::table
                .select(models::UninterestedIn::as_select())
                .into_boxed();
            if let Some(user) = user {
                websites_query = websites_query.filter(uw::user_id.eq(user));
                tags_query = tags_query.filter(ui::user_id.eq(user));
            }
            let websites = websites_query.load(conn)?;
            let tags = tags_query.load(conn)?;
            diesel::QueryResult::Ok((websites, tags))
        })?;

        let mut snapshot = Self::default();
        for row in websites {
            snapshot.mute_website(row.user_id, row.website);
        }
        for row in tags {
            snapshot.mute_tag(row.user_id, row.tag_id);
        }
        Ok(snapshot)
    }

    pub fn mute_website(&mut self, user: DbUserId, website: Website) {
        self.muted_websites.entry(user).or_default().insert(website);
    }

    pub fn mute_tag(&mut self, user: DbUserId, tag: DbTagId) {
        self.muted_tags.entry(user).or_default().insert(tag);
    }

    pub fn is_website_muted(&self, user: DbUserId, website: &Website) -> bool {
        self.muted_websites.get(&user).is_some_and(|w| w.contains(website))
    }

    pub fn is_tag_muted(&self, user: DbUserId, tag: DbTagId) -> bool {
        self.muted_tags.get(&user).is_some_and(|t| t.contains(&tag))
    }
}

/// All known tags, indexed by website and name.
#[derive(Debug, Default)]
pub struct TagIndex {
    ids: HashMap<(Website, String), DbTagId>,
    names: HashMap<Website, Vec<String>>,
}

impl TagIndex {
    pub fn load(conn: &mut SqliteConnection) -> StorageResult<Self> {
        let tags = schema::tags::table
            .order(schema::tags::id.asc())
            .select(models::Tag::as_select())
            .load(conn)?;
        Ok(tags.into_iter().collect())
    }

    /// Id of the tag `name` of `website`. Unknown tags resolve to `None`.
    pub fn resolve(&self, website: &Website, name: &str) -> Option<DbTagId> {
        self.ids.get(&(website.clone(), name.to_string())).copied()
    }

    /// Tag names of `website`, in the order they were first seen.
    pub fn names(&self, website: &Website) -> &[String] {
        self.names.get(website).map_or(&[], Vec::as_slice)
    }
}

impl FromIterator<models::Tag> for TagIndex {
    fn from_iter<I: IntoIterator<Item = models::Tag>>(iter: I) -> Self {
        let mut index = Self::default();
        for tag in iter {
            index
                .names
                .entry(tag.website.clone())
                .or_default()
                .push(tag.name.clone());
            index.ids.insert((tag.website, tag.name), tag.id);
        }
        index
    }
}

/// Make sure that a tag exists for every `(website, name)` pair.
pub fn upsert_tags<'a>(
    conn: &mut SqliteConnection,
    tags: impl IntoIterator<Item = (&'a Website, &'a str)>,
) -> StorageResult<()> {
    let tags = tags
        .into_iter()
        .map(|(website, name)| models::NewTag { website, name })
        .collect::<Vec<_>>();
    if tags.is_empty() {
        return Ok(());
    }
    diesel::insert_or_ignore_into(schema::tags::table)
        .values(tags)
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;

    fn websites(names: &[&str]) -> BTreeSet<Website> {
        names.iter().map(|n| Website::new(*n)).collect()
    }

    fn seed_tags(conn: &mut SqliteConnection) -> TagIndex {
        let disim = Website::new("DISIM");
        let adsu = Website::new("ADSU");
        upsert_tags(
            conn,
            [(&disim, "Bandi"), (&disim, "Eventi"), (&adsu, "Bandi")],
        )
        .unwrap();
        TagIndex::load(conn).unwrap()
    }

    #[test]
    fn register_user_is_idempotent() {
        let mut conn = test_connection();
        let first = register_user(&mut conn, DbChatId(100)).unwrap();
        let second = register_user(&mut conn, DbChatId(100)).unwrap();
        let other = register_user(&mut conn, DbChatId(200)).unwrap();
        assert_eq!(first, second);
        assert_ne!(first.id, other.id);
        assert_eq!(list_all_users(&mut conn).unwrap(), vec![first, other]);
        assert_eq!(find_user(&mut conn, DbChatId(300)).unwrap(), None);
    }

    #[test]
    fn tag_index_resolves_and_lists_in_order() {
        let mut conn = test_connection();
        let index = seed_tags(&mut conn);
        let disim = Website::new("DISIM");
        assert!(index.resolve(&disim, "Bandi").is_some());
        assert_ne!(
            index.resolve(&disim, "Bandi"),
            index.resolve(&Website::new("ADSU"), "Bandi")
        );
        assert_eq!(index.resolve(&disim, "Tesi"), None);
        assert_eq!(index.names(&disim), ["Bandi", "Eventi"]);
        assert!(index.names(&Website::new("UNKNOWN")).is_empty());

        // Upserting known tags again adds nothing.
        upsert_tags(&mut conn, [(&disim, "Bandi")]).unwrap();
        assert_eq!(TagIndex::load(&mut conn).unwrap().names(&disim).len(), 2);
    }

    #[test]
    fn new_user_has_no_mutes() {
        let mut conn = test_connection();
        let index = seed_tags(&mut conn);
        let user = register_user(&mut conn, DbChatId(1)).unwrap();
        let snapshot = PreferenceSnapshot::load(&mut conn).unwrap();
        let disim = Website::new("DISIM");
        assert!(!snapshot.is_website_muted(user.id, &disim));
        let bandi = index.resolve(&disim, "Bandi").unwrap();
        assert!(!snapshot.is_tag_muted(user.id, bandi));
    }

    #[test]
    fn replace_overwrites_previous_rows() {
        let mut conn = test_connection();
        let index = seed_tags(&mut conn);
        let user = register_user(&mut conn, DbChatId(1)).unwrap();
        let disim = Website::new("DISIM");
        let bandi = index.resolve(&disim, "Bandi").unwrap();
        let eventi = index.resolve(&disim, "Eventi").unwrap();

        replace_preferences(
            &mut conn,
            user.id,
            &websites(&["ADSU"]),
            &[bandi].into(),
        )
        .unwrap();
        replace_preferences(
            &mut conn,
            user.id,
            &BTreeSet::new(),
            &[eventi].into(),
        )
        .unwrap();

        let snapshot =
            PreferenceSnapshot::load_user(&mut conn, user.id).unwrap();
        assert!(!snapshot.is_website_muted(user.id, &Website::new("ADSU")));
        assert!(!snapshot.is_tag_muted(user.id, bandi));
        assert!(snapshot.is_tag_muted(user.id, eventi));
    }

    #[test]
    fn replace_twice_is_idempotent() {
        let mut conn = test_connection();
        let index = seed_tags(&mut conn);
        let user = register_user(&mut conn, DbChatId(1)).unwrap();
        let bandi = index.resolve(&Website::new("DISIM"), "Bandi").unwrap();
        let muted_websites = websites(&["ADSU"]);
        let muted_tags = BTreeSet::from([bandi]);

        replace_preferences(&mut conn, user.id, &muted_websites, &muted_tags)
            .unwrap();
        let once = PreferenceSnapshot::load(&mut conn).unwrap();
        replace_preferences(&mut conn, user.id, &muted_websites, &muted_tags)
            .unwrap();
        let twice = PreferenceSnapshot::load(&mut conn).unwrap();

        similar_asserts::assert_eq!(once, twice);
        let rows: i64 = schema::uninterested_in::table
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn failed_replace_keeps_previous_rows() {
        let mut conn = test_connection();
        let index = seed_tags(&mut conn);
        let user = register_user(&mut conn, DbChatId(1)).unwrap();
        let bandi = index.resolve(&Website::new("DISIM"), "Bandi").unwrap();
        replace_preferences(
            &mut conn,
            user.id,
            &websites(&["ADSU"]),
            &[bandi].into(),
        )
        .unwrap();
        let before = PreferenceSnapshot::load(&mut conn).unwrap();

        // The unknown tag id violates the foreign key after the old rows
        // have already been deleted inside the transaction.
        let result = replace_preferences(
            &mut conn,
            user.id,
            &websites(&["DISIM"]),
            &[DbTagId(9999)].into(),
        );
        assert!(result.is_err());

        let after = PreferenceSnapshot::load(&mut conn).unwrap();
        similar_asserts::assert_eq!(before, after);
        assert!(after.is_website_muted(user.id, &Website::new("ADSU")));
        assert!(!after.is_website_muted(user.id, &Website::new("DISIM")));
    }

    #[test]
    fn snapshot_for_one_user_ignores_others() {
        let mut conn = test_connection();
        seed_tags(&mut conn);
        let alice = register_user(&mut conn, DbChatId(1)).unwrap();
        let bob = register_user(&mut conn, DbChatId(2)).unwrap();
        replace_preferences(
            &mut conn,
            bob.id,
            &websites(&["ADSU"]),
            &BTreeSet::new(),
        )
        .unwrap();

        let snapshot =
            PreferenceSnapshot::load_user(&mut conn, alice.id).unwrap();
        assert!(!snapshot.is_website_muted(bob.id, &Website::new("ADSU")));
    }
}
