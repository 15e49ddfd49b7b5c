//! Preferences menu.
//!
//! `/start` registers the chat and opens the menu, `/personalizza` reopens it.
//! The first level lists the websites; the second level toggles a whole
//! website or single tags. Nothing is written until "Salva" is pressed, then
//! all opt-out rows of the user are replaced at once.
//!
//! The checkbox state lives in the chat's dialogue, not in shared state, and
//! is dropped on save.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use diesel::SqliteConnection;
use itertools::Itertools as _;
use teloxide::dispatching::dialogue::{Dialogue, InMemStorage};
use teloxide::dispatching::HandlerExt as _;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::utils::command::BotCommands;

use crate::common::{BotEnv, UpdateHandler};
use crate::db::{DbTagId, DbUserId, StorageResult, Website};
use crate::models;
use crate::preferences::{self, PreferenceSnapshot, TagIndex};
use crate::utils::format_to;

const RECEIVE_FROM_WEBSITE: &str = "Ricevi comunicazioni dal sito";
const NOT_RECEIVE_FROM_WEBSITE: &str = "Non ricevere comunicazioni dal sito";
const SELECT_THE_WEBSITE: &str =
    "Seleziona il sito per gestire i tuoi tag di interesse:";
const NOTIFICATIONS_ICON: &str = "🔔";
const NO_NOTIFICATIONS_ICON: &str = "🔕";

/// Callback option toggling a whole website.
const WEBSITE_OPTION: &str = "uninterested_website";

/// Telegram limit for `callback_data`, in bytes.
const MAX_CALLBACK_DATA_LEN: usize = 64;

pub type MenuStorage = InMemStorage<MenuSession>;
pub type MenuDialogue = Dialogue<MenuSession, MenuStorage>;

/// Per-chat menu session.
#[derive(Clone, Debug, Default)]
pub enum MenuSession {
    #[default]
    Idle,
    Editing(Selection),
}

/// Unsaved checkbox state of one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    websites: Vec<WebsiteSelection>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebsiteSelection {
    website: Website,
    muted: bool,
    tags: Vec<TagChoice>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TagChoice {
    id: DbTagId,
    name: String,
    interested: bool,
}

/// What a second-level button toggles. Tags are referenced by id so that
/// the payload stays short whatever the tag name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuOption {
    Website,
    Tag(DbTagId),
}

impl Selection {
    /// Build the checkbox state from stored preferences: every box is checked
    /// unless the user muted it.
    pub fn build(
        websites: &[Website],
        tags: &TagIndex,
        prefs: &PreferenceSnapshot,
        user: DbUserId,
    ) -> Self {
        let websites = websites
            .iter()
            .map(|website| WebsiteSelection {
                website: website.clone(),
                muted: prefs.is_website_muted(user, website),
                tags: tags
                    .names(website)
                    .iter()
                    .filter_map(|name| {
                        let id = tags.resolve(website, name)?;
                        Some(TagChoice {
                            id,
                            name: name.clone(),
                            interested: !prefs.is_tag_muted(user, id),
                        })
                    })
                    .collect(),
            })
            .collect();
        Self { websites }
    }

    pub fn load(
        conn: &mut SqliteConnection,
        websites: &[Website],
        user: DbUserId,
    ) -> StorageResult<Self> {
        let tags = TagIndex::load(conn)?;
        let prefs = PreferenceSnapshot::load_user(conn, user)?;
        Ok(Self::build(websites, &tags, &prefs, user))
    }

    pub fn website(&self, name: &str) -> Option<&WebsiteSelection> {
        self.websites.iter().find(|w| w.website.as_str() == name)
    }

    /// Flip one checkbox. Returns `false` if the website or tag is unknown,
    /// or the tag belongs to another website.
    pub fn toggle(&mut self, website: &str, option: MenuOption) -> bool {
        let Some(site) =
            self.websites.iter_mut().find(|w| w.website.as_str() == website)
        else {
            return false;
        };
        match option {
            MenuOption::Website => site.muted = !site.muted,
            MenuOption::Tag(id) => {
                let Some(tag) = site.tags.iter_mut().find(|t| t.id == id) else {
                    return false;
                };
                tag.interested = !tag.interested;
            }
        }
        true
    }

    /// Websites and tags to store as muted. Tag choices are kept for muted
    /// websites too, so that unmuting a website restores them.
    pub fn muted_sets(&self) -> (BTreeSet<Website>, BTreeSet<DbTagId>) {
        let websites = self
            .websites
            .iter()
            .filter(|w| w.muted)
            .map(|w| w.website.clone())
            .collect();
        let tag_ids = self
            .websites
            .iter()
            .flat_map(|w| w.tags.iter())
            .filter(|t| !t.interested)
            .map(|t| t.id)
            .collect();
        (websites, tag_ids)
    }

    /// Human readable recap shown after saving.
    pub fn summary(&self) -> String {
        let mut text = String::from("Riepilogo delle tue selezioni:");
        for site in &self.websites {
            if site.muted {
                format_to!(
                    text,
                    "\n• {NOT_RECEIVE_FROM_WEBSITE} {} {NO_NOTIFICATIONS_ICON}",
                    site.website
                );
            } else {
                let selected = site
                    .tags
                    .iter()
                    .filter(|t| t.interested)
                    .map(|t| t.name.as_str())
                    .join(", ");
                let selected = if selected.is_empty() {
                    "nessun tag selezionato"
                } else {
                    &selected
                };
                format_to!(text, "\n• {}: {selected}", site.website);
            }
        }
        text
    }
}

/// Parsed inline button payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MenuCallback {
    Website(String),
    Toggle { website: String, option: MenuOption },
    SaveAll,
    Back,
}

impl MenuCallback {
    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "save_all" => return Some(Self::SaveAll),
            "back" => return Some(Self::Back),
            _ => (),
        }
        if let Some(website) = data.strip_prefix("first:") {
            return (!website.is_empty())
                .then(|| Self::Website(website.to_string()));
        }
        let (website, option) = data.strip_prefix("second:")?.split_once(':')?;
        if website.is_empty() {
            return None;
        }
        let option = if option == WEBSITE_OPTION {
            MenuOption::Website
        } else {
            MenuOption::Tag(DbTagId(option.parse().ok()?))
        };
        Some(Self::Toggle { website: website.to_string(), option })
    }

    pub fn to_data(&self) -> String {
        match self {
            Self::Website(website) => format!("first:{website}"),
            Self::Toggle { website, option: MenuOption::Website } => {
                format!("second:{website}:{WEBSITE_OPTION}")
            }
            Self::Toggle { website, option: MenuOption::Tag(id) } => {
                format!("second:{website}:{}", id.0)
            }
            Self::SaveAll => "save_all".to_string(),
            Self::Back => "back".to_string(),
        }
    }
}

/// Append a one-button row. A button whose payload Telegram would reject is
/// left out so that the rest of the keyboard can still be sent.
fn push_button(
    rows: &mut Vec<Vec<InlineKeyboardButton>>,
    text: impl Into<String>,
    data: &MenuCallback,
) {
    let data = data.to_data();
    if data.len() > MAX_CALLBACK_DATA_LEN {
        log::warn!("Callback data too long, skipping button: {data:?}");
        return;
    }
    rows.push(vec![InlineKeyboardButton::callback(text, data)]);
}

fn root_keyboard(selection: &Selection) -> InlineKeyboardMarkup {
    let mut buttons = Vec::new();
    for site in &selection.websites {
        let name = site.website.to_string();
        let text = if site.muted {
            format!("{name} {NO_NOTIFICATIONS_ICON}")
        } else {
            name.clone()
        };
        push_button(&mut buttons, text, &MenuCallback::Website(name));
    }
    push_button(&mut buttons, "Salva 💾", &MenuCallback::SaveAll);
    InlineKeyboardMarkup::new(buttons)
}

fn detail_text(site: &WebsiteSelection) -> String {
    format!("Seleziona i tuoi tag di interesse per il sito {}:", site.website)
}

fn detail_keyboard(site: &WebsiteSelection) -> InlineKeyboardMarkup {
    let website = site.website.to_string();
    let mut buttons = Vec::new();
    let toggle = MenuCallback::Toggle {
        website: website.clone(),
        option: MenuOption::Website,
    };
    if site.muted {
        push_button(
            &mut buttons,
            format!("{NOT_RECEIVE_FROM_WEBSITE} {website} {NO_NOTIFICATIONS_ICON}"),
            &toggle,
        );
    } else {
        push_button(
            &mut buttons,
            format!("{RECEIVE_FROM_WEBSITE} {website} {NOTIFICATIONS_ICON}"),
            &toggle,
        );
        for tag in &site.tags {
            push_button(
                &mut buttons,
                format!("{} {}", if tag.interested { '✅' } else { '❌' }, tag.name),
                &MenuCallback::Toggle {
                    website: website.clone(),
                    option: MenuOption::Tag(tag.id),
                },
            );
        }
    }
    push_button(&mut buttons, "<< Indietro", &MenuCallback::Back);
    InlineKeyboardMarkup::new(buttons)
}


/// Commands available in this module.
#[derive(Clone, BotCommands)]
#[command(rename_rule = "lowercase", description = "Comandi disponibili:")]
pub enum Commands {
    #[command(description = "iscriviti e scegli cosa ricevere.")]
    Start,
    #[command(description = "modifica i siti e i tag di interesse.")]
    Personalizza,
    #[command(description = "mostra questo messaggio.")]
    Help,
}

/// Return an update handler for the menu commands.
pub fn command_handler() -> UpdateHandler {
    teloxide::filter_command::<Commands, _>()
        .enter_dialogue::<Message, MenuStorage, MenuSession>()
        .endpoint(handle_command)
}

/// Return an update handler for the menu buttons.
pub fn callback_handler() -> UpdateHandler {
    dptree::filter_map(filter_callbacks)
        .enter_dialogue::<CallbackQuery, MenuStorage, MenuSession>()
        .endpoint(handle_callback)
}

fn filter_callbacks(callback: CallbackQuery) -> Option<MenuCallback> {
    MenuCallback::parse(callback.data.as_deref()?)
}

async fn handle_command(
    bot: Bot,
    env: Arc<BotEnv>,
    dialogue: MenuDialogue,
    msg: Message,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Start => {
            let user =
                preferences::register_user(&mut env.conn(), msg.chat.id.into())?;
            log::info!("Chat {} registered as {}", msg.chat.id, user.id);
            open_menu(bot, env, dialogue, &msg, &user).await?;
        }
        Commands::Personalizza => {
            let user =
                preferences::find_user(&mut env.conn(), msg.chat.id.into())?;
            match user {
                Some(user) => open_menu(bot, env, dialogue, &msg, &user).await?,
                None => {
                    bot.send_message(
                        msg.chat.id,
                        "Non sei ancora iscritto: usa /start.",
                    )
                    .await?;
                }
            }
        }
        Commands::Help => {
            bot.send_message(msg.chat.id, Commands::descriptions().to_string())
                .await?;
        }
    }
    Ok(())
}

async fn open_menu(
    bot: Bot,
    env: Arc<BotEnv>,
    dialogue: MenuDialogue,
    msg: &Message,
    user: &models::User,
) -> Result<()> {
    let selection =
        Selection::load(&mut env.conn(), &env.config.websites(), user.id)?;
    bot.send_message(msg.chat.id, SELECT_THE_WEBSITE)
        .reply_markup(root_keyboard(&selection))
        .await?;
    dialogue.update(MenuSession::Editing(selection)).await?;
    Ok(())
}

async fn handle_callback(
    bot: Bot,
    env: Arc<BotEnv>,
    dialogue: MenuDialogue,
    callback: CallbackQuery,
    data: MenuCallback,
) -> Result<()> {
    bot.answer_callback_query(&callback.id).await?;
    let Some(message) = &callback.message else {
        return Ok(());
    };
    let chat_id = message.chat.id;

    let Some(user) = preferences::find_user(&mut env.conn(), chat_id.into())?
    else {
        return Ok(());
    };
    let mut selection = match dialogue.get().await? {
        Some(MenuSession::Editing(selection)) => selection,
        // No live session, e.g. after a restart: start over from the stored
        // preferences.
        _ => {
            Selection::load(&mut env.conn(), &env.config.websites(), user.id)?
        }
    };

    match data {
        MenuCallback::Website(website) => {
            let Some(site) = selection.website(&website) else {
                return Ok(());
            };
            bot.edit_message_text(chat_id, message.id, detail_text(site))
                .reply_markup(detail_keyboard(site))
                .await?;
        }
        MenuCallback::Toggle { website, option } => {
            if !selection.toggle(&website, option) {
                return Ok(());
            }
            if let Some(site) = selection.website(&website) {
                bot.edit_message_text(chat_id, message.id, detail_text(site))
                    .reply_markup(detail_keyboard(site))
                    .await?;
            }
        }
        MenuCallback::Back => {
            bot.edit_message_text(chat_id, message.id, SELECT_THE_WEBSITE)
                .reply_markup(root_keyboard(&selection))
                .await?;
        }
        MenuCallback::SaveAll => {
            let saved = save(&mut env.conn(), user.id, &selection);
            match saved {
                Ok(()) => {
                    log::info!("Saved preferences of {}", user.id);
                    dialogue.exit().await?;
                    bot.edit_message_text(
                        chat_id,
                        message.id,
                        selection.summary(),
                    )
                    .await?;
                }
                Err(e) => {
                    log::error!("Failed to save preferences of {}: {e}", user.id);
                    dialogue.update(MenuSession::Editing(selection)).await?;
                    bot.send_message(
                        chat_id,
                        "Non è stato possibile salvare le preferenze, riprova.",
                    )
                    .await?;
                }
            }
            return Ok(());
        }
    }

    dialogue.update(MenuSession::Editing(selection)).await?;
    Ok(())
}

fn save(
    conn: &mut SqliteConnection,
    user: DbUserId,
    selection: &Selection,
) -> StorageResult<()> {
    let (muted_websites, muted_tags) = selection.muted_sets();
    preferences::replace_preferences(conn, user, &muted_websites, &muted_tags)
}
