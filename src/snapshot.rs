use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbaImage};
use reqwest::Client;
use serenity::all::{ChannelId, CreateAttachment, CreateMessage, Http};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SnapshotError;
use crate::render::{RenderRow, TextFonts, render_snapshot};
use crate::store::UserId;

/// Channels with fewer human occupants than this are not reported.
pub const MIN_OCCUPANTS: usize = 3;

#[derive(Debug, Clone)]
pub struct Occupant {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: String,
    pub bot: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelOccupancy {
    pub channel_id: u64,
    pub name: String,
    pub occupants: Vec<Occupant>,
}

impl ChannelOccupancy {
    pub fn humans(&self) -> Vec<&Occupant> {
        self.occupants.iter().filter(|o| !o.bot).collect()
    }
}

pub struct SnapshotReport {
    pub channel_id: u64,
    pub caption: String,
    pub file_name: String,
    pub png: Vec<u8>,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: SnapshotReport) -> Result<(), SnapshotError>;
}

/// Posts reports into one Discord text channel.
pub struct DiscordReportSink {
    http: Arc<Http>,
    channel: ChannelId,
}

impl DiscordReportSink {
    pub fn new(http: Arc<Http>, channel: ChannelId) -> Self {
        Self { http, channel }
    }
}

#[async_trait]
impl ReportSink for DiscordReportSink {
    async fn deliver(&self, report: SnapshotReport) -> Result<(), SnapshotError> {
        debug!("Posting snapshot of channel {}", report.channel_id);
        let attachment = CreateAttachment::bytes(report.png, report.file_name);
        let message = CreateMessage::new()
            .content(report.caption)
            .add_file(attachment);
        self.channel.send_message(&*self.http, message).await?;
        Ok(())
    }
}

#[async_trait]
pub trait AvatarSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SnapshotError>;
}

pub struct HttpAvatarSource {
    http: Client,
}

impl HttpAvatarSource {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AvatarSource for HttpAvatarSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SnapshotError> {
        debug!("Downloading avatar from {}", url);
        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

/// Avatars stored as `<user id>.png`, fetched at most once per user.
pub struct AvatarCache {
    dir: PathBuf,
    source: Arc<dyn AvatarSource>,
}

impl AvatarCache {
    pub fn new(dir: impl Into<PathBuf>, source: Arc<dyn AvatarSource>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, source })
    }

    /// Never fails; a missing avatar is rendered as a blank slot.
    pub async fn get(&self, occupant: &Occupant) -> Option<RgbaImage> {
        match self.load_or_fetch(occupant).await {
            Ok(img) => Some(img),
            Err(e) => {
                warn!(
                    "Failed to load avatar for {}: {}",
                    occupant.display_name, e
                );
                None
            }
        }
    }

    async fn load_or_fetch(&self, occupant: &Occupant) -> Result<RgbaImage, SnapshotError> {
        let path = self.dir.join(format!("{}.png", occupant.user_id));
        if path.exists() {
            return Ok(image::open(&path)?.to_rgba8());
        }

        let bytes = self.source.fetch(&occupant.avatar_url).await?;
        let img = image::load_from_memory(&bytes)?;
        img.save_with_format(&path, ImageFormat::Png)?;
        Ok(img.to_rgba8())
    }
}

pub fn caption(channel_name: &str, members: usize, at: DateTime<Utc>) -> String {
    format!(
        "Auto Adhoc of **{}** with {} members at <t:{}:F>",
        channel_name,
        members,
        at.timestamp()
    )
}

pub struct SnapshotReporter {
    avatars: AvatarCache,
    fonts: TextFonts,
    sink: Arc<dyn ReportSink>,
}

impl SnapshotReporter {
    pub fn new(avatars: AvatarCache, fonts: TextFonts, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            avatars,
            fonts,
            sink,
        }
    }

    /// Reports every channel with enough people in it. Returns how many
    /// reports were delivered.
    pub async fn run(&self, channels: &[ChannelOccupancy], now: DateTime<Utc>) -> usize {
        debug!("Sending voice snapshots for {} channels", channels.len());
        let mut delivered = 0;

        for channel in channels {
            let humans = channel.humans();
            if humans.len() < MIN_OCCUPANTS {
                continue;
            }
            match self.report(channel, &humans, now).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send snapshot for {}: {}", channel.name, e),
            }
        }

        info!("Voice snapshots completed, {} delivered", delivered);
        delivered
    }

    async fn report(
        &self,
        channel: &ChannelOccupancy,
        humans: &[&Occupant],
        now: DateTime<Utc>,
    ) -> Result<(), SnapshotError> {
        let mut rows = Vec::with_capacity(humans.len());
        for occupant in humans {
            rows.push(RenderRow {
                display_name: occupant.display_name.clone(),
                avatar: self.avatars.get(occupant).await,
            });
        }

        let png = render_snapshot(&self.fonts, &channel.name, &rows)?;
        self.sink
            .deliver(SnapshotReport {
                channel_id: channel.channel_id,
                caption: caption(&channel.name, humans.len(), now),
                file_name: format!("vc_snapshot_{}.png", channel.channel_id),
                png,
            })
            .await
    }
}
