#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::common::{bttv_cdn, get_json, http_client};
use super::{EmoteMap, EmoteProvider, EmoteProviderId};

const BTTV_BASE_URL: &str = "https://api.betterttv.net/3";

/// BetterTTV catalog.
pub struct BttvProvider {
	http: reqwest::Client,
	base_url: String,
}

impl BttvProvider {
	pub fn new() -> Self {
		Self::with_base_url(BTTV_BASE_URL)
	}

	pub fn with_base_url(base_url: impl Into<String>) -> Self {
		Self {
			http: http_client(),
			base_url: base_url.into(),
		}
	}
}

impl Default for BttvProvider {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl EmoteProvider for BttvProvider {
	fn id(&self) -> EmoteProviderId {
		EmoteProviderId::Bttv
	}

	async fn global_emotes(&self) -> anyhow::Result<EmoteMap> {
		let url = format!("{}/cached/emotes/global", self.base_url);
		let body: Vec<BttvEmote> = get_json(&self.http, &url, "bttv global emotes").await?;
		let out = emotes_to_map(&body);

		if out.is_empty() {
			warn!("bttv global emotes empty");
		} else {
			info!(emote_count = out.len(), "bttv global emotes fetched");
		}
		Ok(out)
	}

	async fn channel_emotes(&self, channel_id: u64) -> anyhow::Result<EmoteMap> {
		let url = format!("{}/cached/users/twitch/{channel_id}", self.base_url);
		let body: BttvUserResponse = get_json(&self.http, &url, "bttv channel emotes").await?;
		let out = user_to_map(&body);

		if out.is_empty() {
			warn!(channel_id, "bttv channel emotes empty");
		} else {
			info!(channel_id, emote_count = out.len(), "bttv channel emotes fetched");
		}
		Ok(out)
	}
}

fn emotes_to_map(emotes: &[BttvEmote]) -> EmoteMap {
	emotes.iter().map(|e| (e.code.clone(), bttv_cdn(&e.id))).collect()
}

fn user_to_map(body: &BttvUserResponse) -> EmoteMap {
	body.channel_emotes
		.iter()
		.chain(body.shared_emotes.iter())
		.map(|e| (e.code.clone(), bttv_cdn(&e.id)))
		.collect()
}

#[derive(Debug, Deserialize)]
struct BttvUserResponse {
	#[serde(default, rename = "channelEmotes")]
	channel_emotes: Vec<BttvEmote>,
	#[serde(default, rename = "sharedEmotes")]
	shared_emotes: Vec<BttvEmote>,
}

#[derive(Debug, Deserialize)]
struct BttvEmote {
	id: String,
	code: String,
}
