use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context as _, Result};
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};

use crate::db::Website;

/// Environment variable used when `telegram.token` is left empty.
const TOKEN_ENV: &str = "TELOXIDE_TOKEN";

#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    pub telegram: Telegram,
    pub db: String,
    pub scraping: Scraping,
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Telegram {
    #[serde(default)]
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Scraping {
    pub interval_hours: u64,
    /// Pause between two users during a notification wave.
    pub send_delay_ms: u64,
    pub sources: Vec<Source>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Source {
    pub website: Website,
    pub url: String,
    /// Tag assigned to entries that carry no category.
    pub default_tag: String,
}

impl Config {
    /// Read the YAML config at `path`. An empty bot token is taken from the
    /// environment so that the secret can stay out of the file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut config: Self = serde_yaml::from_reader(file)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;
        if config.telegram.token.is_empty() {
            config.telegram.token = std::env::var(TOKEN_ENV).with_context(
                || format!("No telegram.token in config and {TOKEN_ENV} is unset"),
            )?;
        }
        anyhow::ensure!(
            config.scraping.interval_hours > 0,
            "scraping.interval_hours must be positive"
        );
        Ok(config)
    }

    /// Websites offered in the preferences menu, in config order.
    pub fn websites(&self) -> Vec<Website> {
        self.scraping
            .sources
            .iter()
            .map(|s| s.website.clone())
            .unique()
            .collect()
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests(websites: &[&str]) -> Self {
        Self {
            telegram: Telegram { token: "0:test".to_string() },
            db: ":memory:".to_string(),
            scraping: Scraping {
                interval_hours: 1,
                send_delay_ms: 0,
                sources: websites
                    .iter()
                    .map(|w| Source {
                        website: Website::new(*w),
                        url: format!("https://example.org/{w}/feed"),
                        default_tag: "Avvisi".to_string(),
                    })
                    .collect(),
            },
            metrics_addr: None,
        }
    }
}
