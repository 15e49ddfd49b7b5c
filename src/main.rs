#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Restriction lints
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::deref_by_slicing,
    clippy::if_then_some_else_none,
    clippy::undocumented_unsafe_blocks,
    clippy::unnecessary_cast,
    clippy::unnecessary_safety_comment
)]
// False positives
#![allow(clippy::needless_pass_by_value)] // for dptree handlers
// Style
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::module_name_repetitions)]
// Style in tests
#![cfg_attr(
    test,
    allow(clippy::iter_on_empty_collections, clippy::iter_on_single_items)
)]

use std::ffi::OsString;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use argh::FromArgs;
use metrics_exporter_prometheus::PrometheusBuilder;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::payloads::AnswerCallbackQuerySetters;
use teloxide::requests::Requester;
use teloxide::types::{CallbackQuery, Update};
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::modules::menu::MenuSession;

mod announcements;
mod common;
mod config;
mod db;
mod dispatch;
mod filter;
mod metrics;
mod models;
mod modules;
mod preferences;
mod schema;
mod sources;
mod utils;

static VERSION: OnceLock<String> = OnceLock::new();

fn version() -> &'static str {
    VERSION.get().map_or("unknown", String::as_str)
}

/// unibot
#[derive(FromArgs, PartialEq, Debug)]
struct Args {
    #[argh(option, hidden_help = true, long = "-set-revision")]
    set_revision: Option<String>,

    #[argh(subcommand)]
    subcommand: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Bot(SubCommandBot),
    Cycle(SubCommandCycle),
}

/// run the bot
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "bot")]
struct SubCommandBot {
    /// config file
    #[argh(positional)]
    config_file: OsString,
}

/// run one notification cycle and exit
#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "cycle")]
struct SubCommandCycle {
    /// config file
    #[argh(positional)]
    config_file: OsString,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();
    let args: Args = argh::from_env();
    VERSION.get_or_init(|| {
        args.set_revision.clone().unwrap_or_else(|| {
            git_version::git_version!(fallback = "unknown").to_string()
        })
    });
    log::info!("Version {}", version());
    match args.subcommand {
        SubCommand::Bot(c) => run_bot(Path::new(&c.config_file)).await?,
        SubCommand::Cycle(c) => run_once(Path::new(&c.config_file)).await?,
    }
    Ok(())
}

async fn run_bot(config_fpath: &Path) -> Result<()> {
    let config = Config::load(config_fpath)?;
    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        log::info!("Serving metrics on http://{addr}/metrics");
    }
    metrics::register_metrics();

    let sources = sources::from_config(&config)?;
    let bot_env = Arc::new(common::BotEnv::new(config)?);
    let bot = Bot::new(&bot_env.config.telegram.token);

    let mut dispatcher = Dispatcher::builder(
        bot.clone(),
        dptree::entry()
            .branch(
                Update::filter_message()
                    .branch(modules::menu::command_handler())
                    .endpoint(drop_endpoint),
            )
            .branch(
                Update::filter_callback_query()
                    .branch(modules::menu::callback_handler())
                    .endpoint(drop_callback_query),
            )
            .endpoint(drop_endpoint),
    )
    .dependencies(dptree::deps![
        InMemStorage::<MenuSession>::new(),
        Arc::clone(&bot_env)
    ])
    .build();
    let bot_shutdown_token = dispatcher.shutdown_token().clone();
    let mut join_handles = Vec::new();
    join_handles.push(tokio::spawn(async move { dispatcher.dispatch().await }));

    let cancel = CancellationToken::new();

    join_handles.push(tokio::spawn(modules::notifications::task(
        Arc::clone(&bot_env),
        bot.clone(),
        sources,
        cancel.clone(),
    )));

    run_signal_handler(bot_shutdown_token.clone(), cancel.clone());

    futures::future::join_all(join_handles).await;

    Ok(())
}

async fn run_once(config_fpath: &Path) -> Result<()> {
    let config = Config::load(config_fpath)?;
    let sources = sources::from_config(&config)?;
    let env = common::BotEnv::new(config)?;
    let bot = Bot::new(&env.config.telegram.token);
    let report = modules::notifications::run_cycle(&env, &sources, &bot).await?;
    for failure in &report.dispatch.failures {
        log::warn!("Not delivered to {}: {}", failure.user.id, failure.error);
    }
    Ok(())
}

async fn drop_callback_query(
    bot: Bot,
    callback_query: CallbackQuery,
) -> Result<()> {
    log::warn!(
        "Unexpected callback query from {}: {:?}",
        callback_query.from.id,
        callback_query.data,
    );
    bot.answer_callback_query(&callback_query.id)
        .text("Errore: azione non riconosciuta")
        .await?;
    Ok(())
}

async fn drop_endpoint() -> Result<()> {
    Ok(())
}

fn run_signal_handler(
    bot_shutdown_token: teloxide::dispatching::ShutdownToken,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for SIGINT: {e}");
                return;
            }
            cancel.cancel();
            match bot_shutdown_token.shutdown() {
                #[allow(
                    clippy::redundant_pub_crate,
                    // reason = "https://github.com/rust-lang/rust-clippy/issues/10636"
                )]
                Ok(f) => {
                    log::info!(
                        "^C received, trying to shutdown the dispatcher..."
                    );
                    tokio::select! {
                        () = f => {
                            log::info!("dispatcher is shutdown...");
                        }
                        _ = tokio::signal::ctrl_c() => {
                            log::info!("Got another ^C, exiting immediately");
                            std::process::exit(0);
                        }
                    }
                }
                Err(_) => {
                    log::info!("^C received, the dispatcher isn't running, ignoring the signal");
                }
            }
        }
    });
}
