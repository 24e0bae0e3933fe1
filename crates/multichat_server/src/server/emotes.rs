#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use multichat_domain::{EmoteRanges, format_range};
use multichat_platform::assets::{ChannelIdResolver, EmoteMap, EmoteProvider};
use multichat_util::time::unix_ms_now;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for `EmoteCache`.
#[derive(Debug, Clone)]
pub struct EmoteCacheConfig {
	/// How long a completed refresh stays fresh.
	pub ttl: Duration,

	/// How long a started refresh blocks another attempt.
	pub retry_backoff: Duration,

	/// Delay before the background refresher's first run.
	pub startup_delay: Duration,
}

impl Default for EmoteCacheConfig {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(60 * 60),
			retry_backoff: Duration::from_secs(30),
			startup_delay: Duration::from_secs(2 * 60),
		}
	}
}

#[derive(Default)]
struct CacheState {
	emotes: EmoteMap,
	connections: BTreeMap<String, bool>,
	last_updated: Option<Instant>,
	last_updated_ms: Option<i64>,
	started_updating: Option<Instant>,
	started_updating_ms: Option<i64>,
}

/// Snapshot for `/status/emotes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmoteCacheStatus {
	pub num_emotes: usize,
	pub connections: BTreeMap<String, bool>,
	pub last_updated_ms: Option<i64>,
	pub started_updating_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AliasEntry {
	id: String,
	code: String,
}

/// Load the `[{id, code}]` table for `:code:` emoji. Missing or bad files give an empty table.
pub fn load_yt_aliases(path: &Path) -> HashMap<String, String> {
	let data = match std::fs::read_to_string(path) {
		Ok(d) => d,
		Err(e) => {
			warn!(path = %path.display(), error = %e, "emoji alias file unreadable");
			return HashMap::new();
		}
	};
	match serde_json::from_str::<Vec<AliasEntry>>(&data) {
		Ok(entries) => {
			let table: HashMap<String, String> = entries.into_iter().map(|e| (e.code, e.id)).collect();
			info!(count = table.len(), "emoji aliases loaded");
			table
		}
		Err(e) => {
			warn!(path = %path.display(), error = %e, "emoji alias file did not parse");
			HashMap::new()
		}
	}
}

/// Third-party emote code table shared by every chat line.
pub struct EmoteCache {
	cfg: EmoteCacheConfig,
	providers: Vec<Arc<dyn EmoteProvider>>,
	resolver: Option<Arc<dyn ChannelIdResolver>>,
	yt_aliases: HashMap<String, String>,
	shortcode: Regex,
	state: Mutex<CacheState>,
}

impl EmoteCache {
	pub fn new(
		cfg: EmoteCacheConfig,
		providers: Vec<Arc<dyn EmoteProvider>>,
		resolver: Option<Arc<dyn ChannelIdResolver>>,
		yt_aliases: HashMap<String, String>,
	) -> anyhow::Result<Self> {
		let shortcode = Regex::new(r":[a-zA-Z\-]+:").context("compile emoji shortcode pattern")?;
		Ok(Self {
			cfg,
			providers,
			resolver,
			yt_aliases,
			shortcode,
			state: Mutex::new(CacheState::default()),
		})
	}

	/// Refresh the table unless it is fresh or a refresh started recently.
	///
	/// Returns whether a refresh ran.
	pub async fn update_if_needed(&self) -> bool {
		let now = Instant::now();
		{
			let mut st = self.state.lock();
			if let Some(last) = st.last_updated
				&& now < last + self.cfg.ttl
			{
				debug!("emote cache fresh");
				return false;
			}
			if let Some(started) = st.started_updating
				&& now < started + self.cfg.retry_backoff
			{
				debug!("emote cache update in progress");
				return false;
			}
			st.started_updating = Some(now);
			st.started_updating_ms = Some(unix_ms_now());
		}

		info!("updating emote cache");
		let (emotes, connections) = self.fetch_all().await;
		let count = emotes.len();

		{
			let mut st = self.state.lock();
			st.emotes = emotes;
			st.connections = connections;
			st.last_updated = Some(now);
			st.last_updated_ms = Some(unix_ms_now());
			st.started_updating = None;
			st.started_updating_ms = None;
		}

		metrics::counter!("multichat_emote_refresh_total").increment(1);
		metrics::gauge!("multichat_emotes").set(count as f64);
		info!(emote_count = count, "emote cache updated");
		true
	}

	/// Fetch every catalog. Channel catalogs merge first so they shadow globals;
	/// within a scope the first provider to claim a code keeps it.
	async fn fetch_all(&self) -> (EmoteMap, BTreeMap<String, bool>) {
		let mut connections = BTreeMap::new();
		let mut merged = EmoteMap::new();

		let channel_id = match &self.resolver {
			Some(resolver) => match resolver.channel_id().await {
				Ok(id) => Some(id),
				Err(e) => {
					warn!(error = %e, "channel id lookup failed; skipping channel emotes");
					None
				}
			},
			None => None,
		};

		let channel_results: Vec<anyhow::Result<EmoteMap>> = match channel_id {
			Some(id) => join_all(self.providers.iter().map(|p| p.channel_emotes(id))).await,
			None => Vec::new(),
		};
		let global_results = join_all(self.providers.iter().map(|p| p.global_emotes())).await;

		for (idx, provider) in self.providers.iter().enumerate() {
			let key = provider.id().channel_key();
			match channel_results.get(idx) {
				Some(Ok(map)) => {
					connections.insert(key, true);
					merge_first_wins(&mut merged, map);
				}
				Some(Err(e)) => {
					metrics::counter!("multichat_emote_provider_failures_total", "provider" => key.clone()).increment(1);
					warn!(provider = %provider.id(), error = %e, "channel emote fetch failed");
					connections.insert(key, false);
				}
				None => {
					connections.insert(key, false);
				}
			}
		}

		for (provider, result) in self.providers.iter().zip(global_results) {
			let key = provider.id().global_key();
			match result {
				Ok(map) => {
					connections.insert(key, true);
					merge_first_wins(&mut merged, &map);
				}
				Err(e) => {
					metrics::counter!("multichat_emote_provider_failures_total", "provider" => key.clone()).increment(1);
					warn!(provider = %provider.id(), error = %e, "global emote fetch failed");
					connections.insert(key, false);
				}
			}
		}

		(merged, connections)
	}

	/// Emote ranges in `text`: whole whitespace tokens found in the table, plus
	/// `:code:` emoji from the alias table.
	pub fn find_annotations(&self, text: &str) -> EmoteRanges {
		let mut out = EmoteRanges::new();

		{
			let st = self.state.lock();
			if !st.emotes.is_empty() {
				let mut pos = 0usize;
				for word in text.split_whitespace() {
					if let Some(url) = st.emotes.get(word) {
						out.entry(url.clone())
							.or_default()
							.push(format_range(pos, pos + word.len() - 1));
					}
					pos += word.len() + 1;
				}
			}
		}

		if !self.yt_aliases.is_empty() {
			for m in self.shortcode.find_iter(text) {
				if let Some(id) = self.yt_aliases.get(m.as_str()) {
					let range = format_range(m.start(), m.end() - 1);
					let slot = out.entry(id.clone()).or_default();
					if !slot.contains(&range) {
						slot.push(range);
					}
				}
			}
		}

		out
	}

	pub fn status(&self) -> EmoteCacheStatus {
		let st = self.state.lock();
		EmoteCacheStatus {
			num_emotes: st.emotes.len(),
			connections: st.connections.clone(),
			last_updated_ms: st.last_updated_ms,
			started_updating_ms: st.started_updating_ms,
		}
	}

	/// Background refresh: once after the startup delay, then every TTL.
	pub async fn run_refresher(self: Arc<Self>) {
		tokio::time::sleep(self.cfg.startup_delay).await;
		loop {
			self.update_if_needed().await;
			tokio::time::sleep(self.cfg.ttl).await;
		}
	}
}

fn merge_first_wins(into: &mut EmoteMap, from: &EmoteMap) {
	for (code, url) in from {
		into.entry(code.clone()).or_insert_with(|| url.clone());
	}
}
