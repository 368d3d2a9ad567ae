use anyhow::{Context as _, Result};
use chrono::Utc;
use serenity::Client;
use serenity::all::GatewayIntents;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

mod buckets;
mod config;
mod engine;
mod error;
mod mirror;
mod render;
mod sheets;
mod snapshot;
mod store;
mod tracker;
mod voice_tracker;

use crate::config::Config;
use crate::engine::AccountingEngine;
use crate::mirror::{MirrorSink, NoopMirror, SheetMirror};
use crate::sheets::{GoogleSheetsClient, ServiceAccountAuth};
use crate::store::ActivityStore;
use crate::voice_tracker::{AccountingState, VoiceHandler};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    config.warn_missing();

    let store = ActivityStore::load(&config.activity_file)?;
    info!(
        "Tracking {} known users from {:?}, current buckets {} / {}",
        store.len(),
        store.path(),
        buckets::current_week_key(),
        buckets::current_month_key()
    );
    let engine = AccountingEngine::new(store, config.denylist.clone(), Utc::now());

    let http = reqwest::Client::new();
    let mirror = build_mirror(&config, &http);

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MEMBERS;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(VoiceHandler::new(config.clone(), mirror, http))
        .type_map_insert::<AccountingState>(Arc::new(Mutex::new(engine)))
        .await
        .context("failed to create discord client")?;

    info!("Starting voice tracker");

    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
        return Err(why.into());
    }
    Ok(())
}

fn build_mirror(config: &Config, http: &reqwest::Client) -> Arc<dyn MirrorSink> {
    let Some(sheet_id) = &config.sheet_id else {
        return Arc::new(NoopMirror);
    };

    match ServiceAccountAuth::from_file(&config.credentials_path, http.clone()) {
        Ok(auth) => {
            info!("Mirroring totals to sheet tab {:?}", config.sheet_tab);
            let client =
                GoogleSheetsClient::new(http.clone(), auth, sheet_id.clone(), &config.sheet_tab);
            Arc::new(SheetMirror::new(client))
        }
        Err(e) => {
            warn!(
                "Could not load Google credentials from {:?}, mirroring disabled: {}",
                config.credentials_path, e
            );
            Arc::new(NoopMirror)
        }
    }
}
