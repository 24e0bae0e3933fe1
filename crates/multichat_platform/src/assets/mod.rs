#![forbid(unsafe_code)]

mod bttv;
mod common;
mod ffz;
mod seventv;
mod twitch;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use bttv::BttvProvider;
pub use common::{bttv_cdn, ffz_cdn, seventv_cdn, twitch_cdn};
pub use ffz::FfzProvider;
pub use seventv::SevenTvProvider;
pub use twitch::TwitchEmoteProvider;

use crate::twitch::HelixClient;

/// Emote code to image URL.
pub type EmoteMap = HashMap<String, String>;

/// Emote catalogs consulted by the emote cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmoteProviderId {
	Twitch,
	Bttv,
	SevenTv,
	Ffz,
}

impl EmoteProviderId {
	pub const fn as_str(self) -> &'static str {
		match self {
			EmoteProviderId::Twitch => "twitch",
			EmoteProviderId::Bttv => "bttv",
			EmoteProviderId::SevenTv => "7tv",
			EmoteProviderId::Ffz => "ffz",
		}
	}

	/// Connection key for the global catalog (`global_bttv`).
	pub fn global_key(self) -> String {
		format!("global_{}", self.as_str())
	}

	/// Connection key for the channel catalog (`channel_bttv`).
	pub fn channel_key(self) -> String {
		format!("channel_{}", self.as_str())
	}
}

impl fmt::Display for EmoteProviderId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One emote catalog, global and per channel.
#[async_trait]
pub trait EmoteProvider: Send + Sync + 'static {
	fn id(&self) -> EmoteProviderId;

	async fn global_emotes(&self) -> anyhow::Result<EmoteMap>;

	async fn channel_emotes(&self, channel_id: u64) -> anyhow::Result<EmoteMap>;
}

/// Resolves the numeric platform id of the configured channel.
#[async_trait]
pub trait ChannelIdResolver: Send + Sync + 'static {
	async fn channel_id(&self) -> anyhow::Result<u64>;
}

/// The four catalogs in merge order: platform-native first, then third parties.
pub fn default_providers(helix: Option<Arc<HelixClient>>) -> Vec<Arc<dyn EmoteProvider>> {
	let mut providers: Vec<Arc<dyn EmoteProvider>> = Vec::with_capacity(4);
	if let Some(helix) = helix {
		providers.push(Arc::new(TwitchEmoteProvider::new(helix)));
	}
	providers.push(Arc::new(BttvProvider::new()));
	providers.push(Arc::new(SevenTvProvider::new()));
	providers.push(Arc::new(FfzProvider::new()));
	providers
}
