#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

const ALEJO_BASE_URL: &str = "https://pronouns.alejo.io/api";

/// External pronoun service: a catalog of codes and a per-user code lookup.
#[async_trait]
pub trait PronounLookup: Send + Sync + 'static {
	/// Short code → display string (`hehim` → `He/Him`).
	async fn catalog(&self) -> anyhow::Result<HashMap<String, String>>;

	/// The user's pronoun code, `None` when they have not set one.
	async fn user_code(&self, login: &str) -> anyhow::Result<Option<String>>;
}

/// Catalog used until the service's own catalog has loaded.
pub fn seed_catalog() -> HashMap<String, String> {
	[
		("aeaer", "Ae/Aer"),
		("any", "Any"),
		("eem", "E/Em"),
		("faefaer", "Fae/Faer"),
		("hehim", "He/Him"),
		("heshe", "He/She"),
		("hethem", "He/They"),
		("itits", "It/Its"),
		("other", "Other"),
		("perper", "Per/Per"),
		("sheher", "She/Her"),
		("shethem", "She/They"),
		("theythem", "They/Them"),
		("vever", "Ve/Ver"),
		("xexem", "Xe/Xem"),
		("ziehir", "Zie/Hir"),
	]
	.into_iter()
	.map(|(k, v)| (k.to_string(), v.to_string()))
	.collect()
}

/// pronouns.alejo.io client.
#[derive(Debug, Clone)]
pub struct AlejoPronouns {
	http: reqwest::Client,
	base_url: String,
}

impl AlejoPronouns {
	pub fn new() -> anyhow::Result<Self> {
		Self::with_base_url(ALEJO_BASE_URL)
	}

	pub fn with_base_url(base_url: impl Into<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("multichat/0.x (pronouns)")
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			http,
			base_url: base_url.into(),
		})
	}

	async fn get<T: serde::de::DeserializeOwned>(&self, url: &str, label: &'static str) -> anyhow::Result<T> {
		self.http
			.get(url)
			.send()
			.await
			.with_context(|| format!("{label} request"))?
			.error_for_status()
			.with_context(|| format!("{label} status"))?
			.json()
			.await
			.with_context(|| format!("{label} json"))
	}
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
	name: String,
	display: String,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
	#[serde(default)]
	pronoun_id: String,
}

fn first_code(users: Vec<UserEntry>) -> Option<String> {
	users.into_iter().map(|u| u.pronoun_id).find(|c| !c.is_empty())
}

#[async_trait]
impl PronounLookup for AlejoPronouns {
	async fn catalog(&self) -> anyhow::Result<HashMap<String, String>> {
		let url = format!("{}/pronouns", self.base_url);
		let entries: Vec<CatalogEntry> = self.get(&url, "pronoun catalog").await?;
		info!(count = entries.len(), "pronoun catalog fetched");
		Ok(entries.into_iter().map(|e| (e.name, e.display)).collect())
	}

	async fn user_code(&self, login: &str) -> anyhow::Result<Option<String>> {
		let url = format!("{}/users/{}", self.base_url, urlencoding::encode(&login.to_lowercase()));
		let users: Vec<UserEntry> = self.get(&url, "pronoun user").await?;
		Ok(first_code(users))
	}
}
