use chrono::Utc;
use serenity::all::{
    ChannelId, Command, CommandDataOptionValue, CommandInteraction, CommandOptionType,
    CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, Guild, GuildId, Interaction, Ready, User, UserId,
};
use serenity::async_trait;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::buckets::BucketKeys;
use crate::config::Config;
use crate::engine::{AccountingEngine, PresentMember, Transition};
use crate::mirror::{self, MirrorSink, format_minutes};
use crate::render::TextFonts;
use crate::snapshot::{
    AvatarCache, ChannelOccupancy, DiscordReportSink, HttpAvatarSource, Occupant,
    SnapshotReporter,
};

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const UNKNOWN_NAME: &str = "Unknown";

/// Shared accounting state, reachable from every event through the TypeMap.
pub struct AccountingState;

impl TypeMapKey for AccountingState {
    type Value = Arc<Mutex<AccountingEngine>>;
}

pub struct VoiceHandler {
    config: Arc<Config>,
    mirror: Arc<dyn MirrorSink>,
    http: reqwest::Client,
    // the minute tick starts on the first READY, whatever the guild setup
    accruing: AtomicBool,
    // reconciliation and snapshots run once, on the first GUILD_CREATE
    started: AtomicBool,
}

impl VoiceHandler {
    pub fn new(config: Arc<Config>, mirror: Arc<dyn MirrorSink>, http: reqwest::Client) -> Self {
        Self {
            config,
            mirror,
            http,
            accruing: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    fn build_reporter(&self, ctx: &Context) -> Option<Arc<SnapshotReporter>> {
        let channel = self.config.snapshot_channel_id?;
        let source = Arc::new(HttpAvatarSource::new(self.http.clone()));
        let avatars = match AvatarCache::new(&self.config.avatar_cache_dir, source) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Avatar cache unavailable, snapshots disabled: {}", e);
                return None;
            }
        };
        let fonts = match TextFonts::with_fallbacks(&self.config.snapshot_fonts) {
            Ok(fonts) => fonts,
            Err(e) => {
                warn!("Snapshot font unavailable, snapshots disabled: {}", e);
                return None;
            }
        };
        debug!("Snapshot text uses {} font faces", fonts.len());
        let sink = Arc::new(DiscordReportSink::new(
            ctx.http.clone(),
            ChannelId::new(channel),
        ));
        Some(Arc::new(SnapshotReporter::new(avatars, fonts, sink)))
    }
}

#[async_trait]
impl EventHandler for VoiceHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected", ready.user.name);

        let registered = match self.config.guild_id {
            Some(id) => GuildId::new(id)
                .create_command(&ctx.http, voicetime_command())
                .await
                .map(|_| ()),
            None => Command::create_global_command(&ctx.http, voicetime_command())
                .await
                .map(|_| ()),
        };
        if let Err(e) = registered {
            error!("Failed to register /voicetime: {:?}", e);
        }

        match engine(&ctx).await {
            Some(engine) => {
                if start_accrual(&self.accruing, engine, self.mirror.clone(), TICK_INTERVAL)
                    .is_some()
                {
                    info!("Minute accrual started");
                }
            }
            None => error!("Accounting engine missing from client data"),
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        if self.config.guild_id != Some(guild.id.get()) {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Guild {} re-sent, already reconciled", guild.id);
            return;
        }
        let Some(engine) = engine(&ctx).await else {
            error!("Accounting engine missing from client data");
            return;
        };

        let present = present_members(&ctx, &guild).await;
        let open = {
            let mut engine = engine.lock().await;
            engine.reconcile(present, Utc::now());
            engine.open_sessions()
        };
        info!("Startup reconciliation: {} members being timed", open);

        if let Some(reporter) = self.build_reporter(&ctx) {
            spawn_snapshots(ctx, guild.id, reporter, self.config.snapshot_interval);
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        if !in_scope(self.config.guild_id, new.guild_id) {
            return;
        }
        let Some(engine) = engine(&ctx).await else {
            error!("Accounting engine missing from client data");
            return;
        };

        let display_name = new
            .member
            .as_ref()
            .map(|m| m.display_name().to_string())
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());
        debug!(
            "Voice update for {}: {:?} -> {:?}",
            display_name,
            old.as_ref().and_then(|v| v.channel_id),
            new.channel_id
        );

        let outcome = engine.lock().await.on_voice_update(
            new.user_id.get(),
            &display_name,
            new.channel_id.map(|id| id.get()),
            Utc::now(),
        );
        if outcome.transition != Transition::Unchanged {
            debug!("{}: {:?}", display_name, outcome.transition);
        }

        mirror::push_all(&self.mirror, outcome.mirror.into_iter().collect());
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(cmd) = interaction {
            if cmd.data.name == "voicetime" {
                handle_voicetime(&ctx, &cmd).await;
            }
        }
    }
}

async fn engine(ctx: &Context) -> Option<Arc<Mutex<AccountingEngine>>> {
    let data = ctx.data.read().await;
    data.get::<AccountingState>().cloned()
}

/// Events from other guilds are ignored once a guild is configured.
fn in_scope(configured: Option<u64>, guild: Option<GuildId>) -> bool {
    match configured {
        Some(id) => guild.map(|g| g.get()) == Some(id),
        None => true,
    }
}

/// Spawns the accrual loop unless `started` was already set.
fn start_accrual(
    started: &AtomicBool,
    engine: Arc<Mutex<AccountingEngine>>,
    sink: Arc<dyn MirrorSink>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    if started.swap(true, Ordering::SeqCst) {
        return None;
    }
    Some(spawn_accrual(engine, sink, period))
}

fn spawn_accrual(
    engine: Arc<Mutex<AccountingEngine>>,
    sink: Arc<dyn MirrorSink>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let outcome = engine.lock().await.tick(Utc::now());
            if outcome.elapsed_minutes > 0 {
                debug!(
                    "Tick credited {}m to {} users{}",
                    outcome.elapsed_minutes,
                    outcome.mirror.len(),
                    if outcome.delayed { " (late)" } else { "" }
                );
            }
            mirror::push_all(&sink, outcome.mirror);
        }
    })
}

fn spawn_snapshots(
    ctx: Context,
    guild_id: GuildId,
    reporter: Arc<SnapshotReporter>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // fires immediately the first time, giving the startup snapshot
            interval.tick().await;
            let channels = voice_occupancy(&ctx, guild_id);
            reporter.run(&channels, Utc::now()).await;
        }
    });
}

async fn present_members(ctx: &Context, guild: &Guild) -> Vec<PresentMember> {
    let mut present = Vec::new();
    for (user_id, state) in &guild.voice_states {
        let Some(channel_id) = state.channel_id else {
            continue;
        };
        let cached = guild
            .members
            .get(user_id)
            .or(state.member.as_ref())
            .map(|m| m.display_name().to_string());
        let display_name = match cached {
            Some(name) => name,
            None => fetch_display_name(ctx, guild.id, *user_id).await,
        };
        present.push(PresentMember {
            user_id: user_id.get(),
            channel_id: channel_id.get(),
            display_name,
        });
    }
    present
}

async fn fetch_display_name(ctx: &Context, guild_id: GuildId, user_id: UserId) -> String {
    match guild_id.member(ctx, user_id).await {
        Ok(member) => member.display_name().to_string(),
        Err(e) => {
            warn!("Could not fetch member {}: {}", user_id, e);
            UNKNOWN_NAME.to_string()
        }
    }
}

/// Who is in which voice channel, read from the cache.
fn voice_occupancy(ctx: &Context, guild_id: GuildId) -> Vec<ChannelOccupancy> {
    let Some(guild) = ctx.cache.guild(guild_id) else {
        warn!("Guild {} not in cache, skipping snapshot", guild_id);
        return Vec::new();
    };

    let mut by_channel: HashMap<ChannelId, Vec<Occupant>> = HashMap::new();
    for (user_id, state) in &guild.voice_states {
        let Some(channel_id) = state.channel_id else {
            continue;
        };
        let Some(member) = guild.members.get(user_id).or(state.member.as_ref()) else {
            continue;
        };
        by_channel.entry(channel_id).or_default().push(Occupant {
            user_id: user_id.get(),
            display_name: member.display_name().to_string(),
            avatar_url: avatar_url(&member.user),
            bot: member.user.bot,
        });
    }

    by_channel
        .into_iter()
        .map(|(channel_id, occupants)| ChannelOccupancy {
            channel_id: channel_id.get(),
            name: guild
                .channels
                .get(&channel_id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| channel_id.to_string()),
            occupants,
        })
        .collect()
}

fn avatar_url(user: &User) -> String {
    match &user.avatar {
        Some(hash) => cdn_avatar_url(user.id, hash),
        None => user.default_avatar_url(),
    }
}

fn cdn_avatar_url(user_id: UserId, hash: &impl std::fmt::Display) -> String {
    format!(
        "https://cdn.discordapp.com/avatars/{}/{}.png?size=128",
        user_id, hash
    )
}

fn voicetime_command() -> CreateCommand {
    CreateCommand::new("voicetime")
        .description("Show tracked voice time")
        .add_option(
            CreateCommandOption::new(CommandOptionType::User, "user", "Member to look up")
                .required(false),
        )
}

async fn handle_voicetime(ctx: &Context, cmd: &CommandInteraction) {
    let target = cmd
        .data
        .options
        .iter()
        .find(|o| o.name == "user")
        .and_then(|o| match &o.value {
            CommandDataOptionValue::User(id) => Some(*id),
            _ => None,
        })
        .unwrap_or(cmd.user.id);

    let name = cmd
        .data
        .resolved
        .users
        .get(&target)
        .map(|u| u.display_name().to_string())
        .unwrap_or_else(|| cmd.user.display_name().to_string());

    let content = match engine(ctx).await {
        Some(engine) => {
            let now = Utc::now();
            let summary = engine.lock().await.summary(target.get(), now);
            let keys = BucketKeys::at(now);
            let live = if summary.in_session { " (in voice now)" } else { "" };
            format!(
                "**{}**{}\nLifetime: {}\nThis week ({}): {}\nThis month ({}): {}",
                name,
                live,
                format_minutes(summary.lifetime_minutes),
                keys.week,
                format_minutes(summary.weekly_minutes),
                keys.month,
                format_minutes(summary.monthly_minutes)
            )
        }
        None => "Voice tracking is not running.".to_string(),
    };

    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new().content(content),
    );
    if let Err(e) = cmd.create_response(&ctx.http, response).await {
        warn!("Failed to answer /voicetime: {:?}", e);
    }
}
