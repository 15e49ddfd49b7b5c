//! Periodically scrape the configured websites and notify every user about
//! the new announcements they did not opt out of.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use diesel::{Connection as _, SqliteConnection};
use teloxide::Bot;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::announcements::{self, Announcement};
use crate::common::BotEnv;
use crate::db::StorageResult;
use crate::dispatch::{dispatch, DispatchReport, Transport};
use crate::filter::filter_announcements;
use crate::models::User;
use crate::preferences::{self, PreferenceSnapshot, TagIndex};
use crate::sources::AnnouncementSource;
use crate::utils::ResultExt as _;

const SECONDS_IN_HOUR: u64 = 60 * 60;

/// Outcome of a single cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub new_announcements: usize,
    pub users: usize,
    pub dispatch: DispatchReport,
}

/// Run a cycle right away, then once every `scraping.interval_hours`.
/// Cancellation is checked between cycles; a running cycle is completed.
pub async fn task(
    env: Arc<BotEnv>,
    bot: Bot,
    sources: Vec<Box<dyn AnnouncementSource>>,
    shutdown: CancellationToken,
) {
    let interval =
        Duration::from_secs(env.config.scraping.interval_hours * SECONDS_IN_HOUR);
    loop {
        run_cycle(&env, &sources, &bot)
            .await
            .log_ok("Notification cycle failed");

        select! {
            () = shutdown.cancelled() => {
                break;
            }
            () = sleep(interval) => {}
        }
    }
    log::info!("Notification task stopped");
}

/// Fetch, deduplicate, filter and deliver.
///
/// A source that fails to load is skipped for this cycle. If users or
/// preferences can not be read nobody is notified; the announcements stay
/// stored and are not sent again.
pub async fn run_cycle<T: Transport + ?Sized>(
    env: &BotEnv,
    sources: &[Box<dyn AnnouncementSource>],
    transport: &T,
) -> Result<CycleReport> {
    let batch = fetch_all(sources).await;
    let fresh = announcements::store_new(&mut env.conn(), batch)?;

    let recipients = load_recipients(&mut env.conn());
    let (users, prefs, tags) = recipients?;

    let deliveries = filter_announcements(&fresh, &users, &prefs, &tags);
    let pause = Duration::from_millis(env.config.scraping.send_delay_ms);
    let report = dispatch(transport, &deliveries, pause).await;

    crate::metrics::record_cycle(fresh.len(), users.len(), &report);
    log::info!(
        "Cycle done: {} new announcements, {} of {} users notified, {} failures",
        fresh.len(),
        report.delivered.len(),
        users.len(),
        report.failures.len(),
    );
    Ok(CycleReport {
        new_announcements: fresh.len(),
        users: users.len(),
        dispatch: report,
    })
}

async fn fetch_all(sources: &[Box<dyn AnnouncementSource>]) -> Vec<Announcement> {
    let results =
        futures::future::join_all(sources.iter().map(|s| s.fetch())).await;
    let mut batch = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        crate::metrics::update_source(source.website().as_str(), result.is_ok());
        match result {
            Ok(announcements) => {
                log::debug!(
                    "Fetched {} announcements from {}",
                    announcements.len(),
                    source.website()
                );
                batch.extend(announcements);
            }
            Err(e) => {
                log::warn!("Failed to fetch {}: {e:#}", source.website());
            }
        }
    }
    batch
}

/// Users, their preferences and the tag index, read in one transaction.
fn load_recipients(
    conn: &mut SqliteConnection,
) -> StorageResult<(Vec<User>, PreferenceSnapshot, TagIndex)> {
    conn.transaction(|conn| {
        let users = preferences::list_all_users(conn)?;
        let prefs = PreferenceSnapshot::load(conn)?;
        let tags = TagIndex::load(conn)?;
        Ok((users, prefs, tags))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use diesel::connection::SimpleConnection as _;
    use teloxide::types::ChatId;
    use teloxide::{ApiError, RequestError};

    use super::*;
    use crate::announcements::announcement;
    use crate::config::Config;
    use crate::db::{DbChatId, Website};

    struct FakeSource {
        website: Website,
        batch: Option<Vec<Announcement>>,
    }

    impl FakeSource {
        fn boxed(
            website: &str,
            batch: Option<Vec<Announcement>>,
        ) -> Box<dyn AnnouncementSource> {
            Box::new(Self { website: Website::new(website), batch })
        }
    }

    #[async_trait]
    impl AnnouncementSource for FakeSource {
        fn website(&self) -> &Website {
            &self.website
        }

        async fn fetch(&self) -> Result<Vec<Announcement>> {
            self.batch
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(ChatId, String)>>,
        failing: HashSet<ChatId>,
    }

    impl FakeTransport {
        fn chats(&self) -> Vec<ChatId> {
            self.sent.lock().unwrap().iter().map(|(c, _)| *c).collect()
        }

        fn text_for(&self, chat: ChatId) -> String {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == chat)
                .map(|(_, t)| t.as_str())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_html(
            &self,
            chat: ChatId,
            text: String,
        ) -> Result<(), RequestError> {
            if self.failing.contains(&chat) {
                return Err(RequestError::Api(ApiError::BotBlocked));
            }
            self.sent.lock().unwrap().push((chat, text));
            Ok(())
        }
    }

    fn env() -> BotEnv {
        BotEnv::new(Config::for_tests(&["DISIM", "ADSU"])).unwrap()
    }

    fn sources() -> Vec<Box<dyn AnnouncementSource>> {
        vec![
            FakeSource::boxed(
                "DISIM",
                Some(vec![
                    announcement("DISIM", "Bandi", "X"),
                    announcement("DISIM", "Eventi", "Y"),
                ]),
            ),
            FakeSource::boxed(
                "ADSU",
                Some(vec![announcement("ADSU", "Bandi", "Z")]),
            ),
        ]
    }

    #[tokio::test]
    async fn users_receive_only_what_they_did_not_mute() {
        let env = env();
        let sources = sources();
        let (a, b) = {
            let mut guard = env.conn();
            let conn = &mut *guard;
            // Tags must exist before they can be muted.
            preferences::upsert_tags(
                conn,
                [
                    (&Website::new("DISIM"), "Bandi"),
                    (&Website::new("DISIM"), "Eventi"),
                ],
            )
            .unwrap();
            let a = preferences::register_user(conn, DbChatId(1)).unwrap();
            let b = preferences::register_user(conn, DbChatId(2)).unwrap();
            let bandi = TagIndex::load(conn)
                .unwrap()
                .resolve(&Website::new("DISIM"), "Bandi")
                .unwrap();
            preferences::replace_preferences(
                conn,
                a.id,
                &BTreeSet::from([Website::new("ADSU")]),
                &BTreeSet::from([bandi]),
            )
            .unwrap();
            (a, b)
        };
        let transport = FakeTransport::default();

        let report = run_cycle(&env, &sources, &transport).await.unwrap();

        assert_eq!(report.new_announcements, 3);
        assert_eq!(report.users, 2);
        assert_eq!(report.dispatch.delivered, [a, b]);
        assert_eq!(transport.chats(), [ChatId(1), ChatId(2)]);
        let to_a = transport.text_for(ChatId(1));
        assert!(to_a.contains(">Y</a>"));
        assert!(!to_a.contains(">X</a>"));
        assert!(!to_a.contains(">Z</a>"));
        let to_b = transport.text_for(ChatId(2));
        for title in ["X", "Y", "Z"] {
            assert!(to_b.contains(&format!(">{title}</a>")));
        }
    }

    #[tokio::test]
    async fn announcements_are_sent_once() {
        let env = env();
        let sources = sources();
        preferences::register_user(&mut env.conn(), DbChatId(1)).unwrap();
        let transport = FakeTransport::default();

        run_cycle(&env, &sources, &transport).await.unwrap();
        let report = run_cycle(&env, &sources, &transport).await.unwrap();

        assert_eq!(report.new_announcements, 0);
        assert!(report.dispatch.delivered.is_empty());
        assert_eq!(transport.chats(), [ChatId(1)]);
    }

    #[tokio::test]
    async fn user_with_nothing_selected_gets_no_message() {
        let env = env();
        let sources = sources();
        let muted = preferences::register_user(&mut env.conn(), DbChatId(1))
            .unwrap();
        preferences::register_user(&mut env.conn(), DbChatId(2)).unwrap();
        preferences::replace_preferences(
            &mut env.conn(),
            muted.id,
            &BTreeSet::from([Website::new("DISIM"), Website::new("ADSU")]),
            &BTreeSet::new(),
        )
        .unwrap();
        let transport = FakeTransport::default();

        run_cycle(&env, &sources, &transport).await.unwrap();

        assert_eq!(transport.chats(), [ChatId(2)]);
    }

    #[tokio::test]
    async fn failing_source_and_failing_user_do_not_stop_the_cycle() {
        let env = env();
        let sources = vec![
            FakeSource::boxed("DISIM", None),
            FakeSource::boxed(
                "ADSU",
                Some(vec![announcement("ADSU", "Bandi", "Z")]),
            ),
        ];
        for chat in 1..=3 {
            preferences::register_user(&mut env.conn(), DbChatId(chat)).unwrap();
        }
        let transport = FakeTransport {
            failing: HashSet::from([ChatId(2)]),
            ..Default::default()
        };

        let report = run_cycle(&env, &sources, &transport).await.unwrap();

        assert_eq!(report.new_announcements, 1);
        assert_eq!(report.dispatch.delivered.len(), 2);
        assert_eq!(report.dispatch.failures.len(), 1);
        assert_eq!(transport.chats(), [ChatId(1), ChatId(3)]);
    }

    #[tokio::test]
    async fn unreadable_preferences_notify_nobody() {
        let env = env();
        let sources = sources();
        preferences::register_user(&mut env.conn(), DbChatId(1)).unwrap();
        env.conn().batch_execute("DROP TABLE uninterested_in").unwrap();
        let transport = FakeTransport::default();

        assert!(run_cycle(&env, &sources, &transport).await.is_err());
        assert!(transport.chats().is_empty());
    }
}
