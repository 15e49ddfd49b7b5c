use diesel::prelude::*;

use crate::db::{DbChatId, DbTagId, DbUserId, Website};

// Database models

#[derive(Clone, Debug, Eq, PartialEq, Queryable, Selectable)]
#[diesel(table_name = crate::schema::users)]
pub struct User {
    pub id: DbUserId,
    pub chat_id: DbChatId,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser {
    pub chat_id: DbChatId,
}

#[derive(Clone, Debug, Queryable, Selectable)]
#[diesel(table_name = crate::schema::tags)]
pub struct Tag {
    pub id: DbTagId,
    pub website: Website,
    pub name: String,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::tags)]
pub struct NewTag<'a> {
    pub website: &'a Website,
    pub name: &'a str,
}

#[derive(Clone, Debug, Insertable, Queryable, Selectable)]
#[diesel(table_name = crate::schema::uninterested_websites)]
pub struct UninterestedWebsite {
    pub user_id: DbUserId,
    pub website: Website,
}

#[derive(Clone, Debug, Insertable, Queryable, Selectable)]
#[diesel(table_name = crate::schema::uninterested_in)]
pub struct UninterestedIn {
    pub user_id: DbUserId,
    pub tag_id: DbTagId,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::announcements)]
pub struct NewAnnouncement<'a> {
    pub website: &'a Website,
    pub tag: &'a str,
    pub title: &'a str,
    pub link: &'a str,
    pub published_at: Option<chrono::NaiveDateTime>,
    pub scraped_at: chrono::NaiveDateTime,
}
