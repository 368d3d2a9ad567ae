use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_SHEET_TAB: &str = "Voice Activity";
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60 * 60;

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub guild_id: Option<u64>,
    pub denylist: HashSet<u64>,
    pub snapshot_channel_id: Option<u64>,
    pub snapshot_interval: Duration,
    pub sheet_id: Option<String>,
    pub sheet_tab: String,
    pub credentials_path: PathBuf,
    pub activity_file: PathBuf,
    pub avatar_cache_dir: PathBuf,
    /// Extra font files for characters the built-in face lacks.
    pub snapshot_fonts: Vec<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let discord_token = get("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let guild_id = get("GUILD_ID")
            .map(|v| parse_id("GUILD_ID", &v))
            .transpose()?;
        let snapshot_channel_id = get("SNAPSHOT_CHANNEL_ID")
            .map(|v| parse_id("SNAPSHOT_CHANNEL_ID", &v))
            .transpose()?;

        let denylist = match get("DENYLIST_CHANNEL_IDS") {
            Some(list) => list
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(|s| parse_id("DENYLIST_CHANNEL_IDS", s))
                .collect::<Result<HashSet<_>, _>>()?,
            None => HashSet::new(),
        };

        let snapshot_interval = match get("SNAPSHOT_INTERVAL_SECS") {
            Some(v) => match v.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "SNAPSHOT_INTERVAL_SECS",
                        value: v,
                    });
                }
            },
            None => Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS),
        };

        let snapshot_fonts = get("SNAPSHOT_FONTS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            discord_token,
            guild_id,
            denylist,
            snapshot_channel_id,
            snapshot_interval,
            sheet_id: get("SHEET_ID"),
            sheet_tab: get("SHEET_TAB").unwrap_or_else(|| DEFAULT_SHEET_TAB.to_string()),
            credentials_path: get("GOOGLE_CREDENTIALS")
                .unwrap_or_else(|| "credentials.json".to_string())
                .into(),
            activity_file: get("ACTIVITY_FILE")
                .unwrap_or_else(|| "activity.json".to_string())
                .into(),
            avatar_cache_dir: get("AVATAR_CACHE_DIR")
                .unwrap_or_else(|| "avatar_cache".to_string())
                .into(),
            snapshot_fonts,
        })
    }

    /// Logs the features that are switched off by missing settings.
    pub fn warn_missing(&self) {
        if self.sheet_id.is_none() {
            warn!("SHEET_ID is not set, spreadsheet mirroring disabled");
        }
        if self.guild_id.is_none() {
            warn!("GUILD_ID is not set, startup reconciliation and snapshots disabled");
        }
        if self.snapshot_channel_id.is_none() {
            warn!("SNAPSHOT_CHANNEL_ID is not set, voice snapshots disabled");
        }
    }
}

fn parse_id(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn token_is_required() {
        assert!(matches!(
            config(&[("GUILD_ID", "1")]),
            Err(ConfigError::Missing("DISCORD_TOKEN"))
        ));
        assert!(matches!(
            config(&[("DISCORD_TOKEN", "  ")]),
            Err(ConfigError::Missing("DISCORD_TOKEN"))
        ));
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("DISCORD_TOKEN", "t")]).unwrap();
        assert_eq!(cfg.guild_id, None);
        assert!(cfg.denylist.is_empty());
        assert_eq!(cfg.sheet_tab, DEFAULT_SHEET_TAB);
        assert_eq!(cfg.snapshot_interval, Duration::from_secs(3600));
        assert_eq!(cfg.activity_file, PathBuf::from("activity.json"));
        assert_eq!(cfg.avatar_cache_dir, PathBuf::from("avatar_cache"));
        assert!(cfg.snapshot_fonts.is_empty());
    }

    #[test]
    fn snapshot_fonts_split_on_commas() {
        let cfg = config(&[
            ("DISCORD_TOKEN", "t"),
            (
                "SNAPSHOT_FONTS",
                "/fonts/Noto Sans CJK.ttc, /fonts/emoji.ttf,",
            ),
        ])
        .unwrap();
        assert_eq!(
            cfg.snapshot_fonts,
            vec![
                PathBuf::from("/fonts/Noto Sans CJK.ttc"),
                PathBuf::from("/fonts/emoji.ttf")
            ]
        );
    }

    #[test]
    fn denylist_accepts_commas_and_spaces() {
        let cfg = config(&[
            ("DISCORD_TOKEN", "t"),
            ("DENYLIST_CHANNEL_IDS", "111, 222 333,,"),
        ])
        .unwrap();
        assert_eq!(cfg.denylist, HashSet::from([111, 222, 333]));
    }

    #[test]
    fn bad_ids_are_rejected() {
        let err = config(&[("DISCORD_TOKEN", "t"), ("DENYLIST_CHANNEL_IDS", "12,abc")])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "DENYLIST_CHANNEL_IDS", .. }
        ));
        assert!(config(&[("DISCORD_TOKEN", "t"), ("SNAPSHOT_INTERVAL_SECS", "0")]).is_err());
    }
}
