#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use multichat_platform::pronouns::{PronounLookup, seed_catalog};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::hub::ChatHub;

#[derive(Debug, Clone)]
pub struct PronounCacheConfig {
	pub ttl: Duration,
	pub retry_backoff: Duration,
}

impl Default for PronounCacheConfig {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(24 * 60 * 60),
			retry_backoff: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Default)]
struct Entry {
	pronouns: String,
	last_updated: Option<Instant>,
	started_updating: Option<Instant>,
}

/// Per-user pronoun strings, refreshed in the background.
pub struct PronounCache {
	cfg: PronounCacheConfig,
	lookup: Arc<dyn PronounLookup>,
	hub: Arc<ChatHub>,
	catalog: RwLock<HashMap<String, String>>,
	entries: Mutex<HashMap<String, Entry>>,
}

impl PronounCache {
	pub fn new(cfg: PronounCacheConfig, lookup: Arc<dyn PronounLookup>, hub: Arc<ChatHub>) -> Self {
		Self {
			cfg,
			lookup,
			hub,
			catalog: RwLock::new(seed_catalog()),
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Merge the service's catalog over the seed table.
	pub async fn load_catalog(&self) -> anyhow::Result<usize> {
		let fetched = self.lookup.catalog().await?;
		let mut catalog = self.catalog.write();
		catalog.extend(fetched);
		info!(count = catalog.len(), "pronoun catalog loaded");
		Ok(catalog.len())
	}

	/// The cached pronouns for `username`, possibly stale or empty.
	///
	/// Never waits on the network: a due refresh is spawned and later
	/// delivered as a `pronouns` event plus a history patch.
	pub fn lookup(self: &Arc<Self>, username: &str) -> String {
		if username.is_empty() {
			return String::new();
		}

		let key = username.to_lowercase();
		let now = Instant::now();
		let previous = {
			let mut entries = self.entries.lock();
			let entry = entries.entry(key.clone()).or_default();
			if let Some(t) = entry.last_updated
				&& now < t + self.cfg.ttl
			{
				return entry.pronouns.clone();
			}
			if let Some(t) = entry.started_updating
				&& now < t + self.cfg.retry_backoff
			{
				return entry.pronouns.clone();
			}
			entry.started_updating = Some(now);
			entry.pronouns.clone()
		};

		let this = self.clone();
		let username = username.to_string();
		tokio::spawn(async move { this.refresh(key, username).await });
		previous
	}

	fn display_for(&self, code: &str) -> String {
		self.catalog
			.read()
			.get(code)
			.cloned()
			.unwrap_or_else(|| code.to_string())
	}

	async fn refresh(&self, key: String, username: String) {
		let code = match self.lookup.user_code(&username).await {
			Ok(code) => code,
			Err(e) => {
				metrics::counter!("multichat_pronoun_fetch_failures_total").increment(1);
				warn!(%username, error = %e, "pronoun lookup failed");
				return;
			}
		};
		metrics::counter!("multichat_pronoun_fetches_total").increment(1);

		let pronouns = code.as_deref().map(|c| self.display_for(c)).unwrap_or_default();
		{
			let mut entries = self.entries.lock();
			let entry = entries.entry(key).or_default();
			entry.pronouns = pronouns.clone();
			entry.last_updated = Some(Instant::now());
			entry.started_updating = None;
		}
		debug!(%username, %pronouns, "pronouns updated");

		self.hub
			.broadcast("pronouns", json!({ "username": username, "pronouns": pronouns }));
		self.hub.patch_pronouns(&username, &pronouns);
	}
}
