#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::common::{ffz_cdn, get_json, http_client};
use super::{EmoteMap, EmoteProvider, EmoteProviderId};

const FFZ_BASE_URL: &str = "https://api.frankerfacez.com";
const FFZ_GLOBAL_SET_ID: u32 = 3;

/// FrankerFaceZ catalog.
pub struct FfzProvider {
	http: reqwest::Client,
	base_url: String,
}

impl FfzProvider {
	pub fn new() -> Self {
		Self::with_base_url(FFZ_BASE_URL)
	}

	pub fn with_base_url(base_url: impl Into<String>) -> Self {
		Self {
			http: http_client(),
			base_url: base_url.into(),
		}
	}
}

impl Default for FfzProvider {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl EmoteProvider for FfzProvider {
	fn id(&self) -> EmoteProviderId {
		EmoteProviderId::Ffz
	}

	async fn global_emotes(&self) -> anyhow::Result<EmoteMap> {
		let url = format!("{}/v1/set/{FFZ_GLOBAL_SET_ID}", self.base_url);
		let body: FfzSetsResponse = get_json(&self.http, &url, "ffz global emotes").await?;
		let out = sets_to_map(&body);

		if out.is_empty() {
			warn!("ffz global emotes empty");
		} else {
			info!(emote_count = out.len(), "ffz global emotes fetched");
		}
		Ok(out)
	}

	async fn channel_emotes(&self, channel_id: u64) -> anyhow::Result<EmoteMap> {
		let url = format!("{}/v1/room/id/{channel_id}", self.base_url);
		let body: FfzSetsResponse = get_json(&self.http, &url, "ffz channel emotes").await?;
		let out = sets_to_map(&body);

		if out.is_empty() {
			warn!(channel_id, "ffz channel emotes empty");
		} else {
			info!(channel_id, emote_count = out.len(), "ffz channel emotes fetched");
		}
		Ok(out)
	}
}

fn sets_to_map(body: &FfzSetsResponse) -> EmoteMap {
	let mut out = EmoteMap::new();
	for set in body.sets.values() {
		for e in &set.emoticons {
			out.insert(e.name.clone(), ffz_cdn(e.id, e.is_animated()));
		}
	}
	out
}

#[derive(Debug, Deserialize)]
struct FfzSetsResponse {
	#[serde(default)]
	sets: HashMap<String, FfzSet>,
}

#[derive(Debug, Deserialize)]
struct FfzSet {
	#[serde(default)]
	emoticons: Vec<FfzEmote>,
}

#[derive(Debug, Deserialize)]
struct FfzEmote {
	id: u64,
	name: String,
	#[serde(default)]
	animated: Option<serde_json::Value>,
}

impl FfzEmote {
	fn is_animated(&self) -> bool {
		self.animated
			.as_ref()
			.is_some_and(|v| v.is_object() || v.as_bool() == Some(true))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_static_and_animated_emotes() {
		let body: FfzSetsResponse = serde_json::from_str(
			r#"{"room":{"set":42},"sets":{"42":{"emoticons":[
				{"id":1,"name":"ZrehplaR","urls":{"1":"x"}},
				{"id":2,"name":"Wiggle","animated":{"1":"y"}}
			]}}}"#,
		)
		.unwrap();
		let map = sets_to_map(&body);
		assert_eq!(map["ZrehplaR"], "https://cdn.frankerfacez.com/emote/1/2");
		assert_eq!(map["Wiggle"], "https://cdn.frankerfacez.com/emote/2/animated/2.webp");
	}
}
