#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::common::twitch_cdn;
use super::{EmoteMap, EmoteProvider, EmoteProviderId};
use crate::twitch::{HelixClient, HelixEmote};

/// Twitch-native emotes via Helix.
pub struct TwitchEmoteProvider {
	helix: Arc<HelixClient>,
}

impl TwitchEmoteProvider {
	pub fn new(helix: Arc<HelixClient>) -> Self {
		Self { helix }
	}
}

#[async_trait]
impl EmoteProvider for TwitchEmoteProvider {
	fn id(&self) -> EmoteProviderId {
		EmoteProviderId::Twitch
	}

	async fn global_emotes(&self) -> anyhow::Result<EmoteMap> {
		let out = emotes_to_map(&self.helix.global_emotes().await?);
		if out.is_empty() {
			warn!("twitch global emotes empty");
		} else {
			info!(emote_count = out.len(), "twitch global emotes fetched");
		}
		Ok(out)
	}

	async fn channel_emotes(&self, channel_id: u64) -> anyhow::Result<EmoteMap> {
		let out = emotes_to_map(&self.helix.channel_emotes(channel_id).await?);
		if out.is_empty() {
			warn!(channel_id, "twitch channel emotes empty");
		} else {
			info!(channel_id, emote_count = out.len(), "twitch channel emotes fetched");
		}
		Ok(out)
	}
}

fn emotes_to_map(emotes: &[HelixEmote]) -> EmoteMap {
	emotes.iter().map(|e| (e.name.clone(), twitch_cdn(&e.id))).collect()
}
