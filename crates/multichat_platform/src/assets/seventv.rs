#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::common::{get_json, http_client, seventv_cdn};
use super::{EmoteMap, EmoteProvider, EmoteProviderId};

const SEVENTV_BASE_URL: &str = "https://7tv.io/v3";

/// 7TV catalog (REST v3).
pub struct SevenTvProvider {
	http: reqwest::Client,
	base_url: String,
}

impl SevenTvProvider {
	pub fn new() -> Self {
		Self::with_base_url(SEVENTV_BASE_URL)
	}

	pub fn with_base_url(base_url: impl Into<String>) -> Self {
		Self {
			http: http_client(),
			base_url: base_url.into(),
		}
	}
}

impl Default for SevenTvProvider {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl EmoteProvider for SevenTvProvider {
	fn id(&self) -> EmoteProviderId {
		EmoteProviderId::SevenTv
	}

	async fn global_emotes(&self) -> anyhow::Result<EmoteMap> {
		let url = format!("{}/emote-sets/global", self.base_url);
		let body: SevenTvEmoteSet = get_json(&self.http, &url, "7tv global emotes").await?;
		let out = set_to_map(&body);

		if out.is_empty() {
			warn!("7tv global emotes empty");
		} else {
			info!(emote_count = out.len(), "7tv global emotes fetched");
		}
		Ok(out)
	}

	async fn channel_emotes(&self, channel_id: u64) -> anyhow::Result<EmoteMap> {
		let url = format!("{}/users/twitch/{channel_id}", self.base_url);
		let body: SevenTvUserResponse = get_json(&self.http, &url, "7tv channel emotes").await?;
		let out = body.emote_set.as_ref().map(set_to_map).unwrap_or_default();

		if out.is_empty() {
			warn!(channel_id, "7tv channel emotes empty");
		} else {
			info!(channel_id, emote_count = out.len(), "7tv channel emotes fetched");
		}
		Ok(out)
	}
}

fn set_to_map(set: &SevenTvEmoteSet) -> EmoteMap {
	set.emotes
		.iter()
		.filter(|e| !e.name.is_empty())
		.map(|e| (e.name.clone(), seventv_cdn(&e.id)))
		.collect()
}

#[derive(Debug, Deserialize)]
struct SevenTvUserResponse {
	#[serde(default)]
	emote_set: Option<SevenTvEmoteSet>,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteSet {
	#[serde(default)]
	emotes: Vec<SevenTvEmote>,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmote {
	id: String,
	#[serde(default)]
	name: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_user_emote_set() {
		let body: SevenTvUserResponse = serde_json::from_str(
			r#"{"id":"1","emote_set":{"id":"s","emotes":[{"id":"01F","name":"peepoClap"},{"id":"x","name":""}]}}"#,
		)
		.unwrap();
		let map = body.emote_set.as_ref().map(set_to_map).unwrap();
		assert_eq!(map.len(), 1);
		assert_eq!(map["peepoClap"], "https://cdn.7tv.app/emote/01F/3x.webp");
	}

	#[test]
	fn user_without_set_is_empty() {
		let body: SevenTvUserResponse = serde_json::from_str(r#"{"id":"1","emote_set":null}"#).unwrap();
		assert!(body.emote_set.is_none());
	}
}
