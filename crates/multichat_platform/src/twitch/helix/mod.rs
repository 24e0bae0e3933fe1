#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::SecretString;
use crate::assets::ChannelIdResolver;

const HELIX_BASE_URL: &str = "https://api.twitch.tv";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const USERS_PATH: &str = "/helix/users";
const GLOBAL_EMOTES_PATH: &str = "/helix/chat/emotes/global";
const CHANNEL_EMOTES_PATH: &str = "/helix/chat/emotes";

/// Refresh app tokens this long before Twitch says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

fn is_helix_auth_error(err: &anyhow::Error) -> bool {
	format!("{err:#}").contains("helix auth failed")
}

#[derive(Debug)]
struct AppToken {
	access_token: SecretString,
	expires_at: Instant,
}

/// Helix client authenticated with an app access token (client credentials).
///
/// Used for the channel's numeric id and the native emote catalogs; chat
/// itself goes over IRC with the bot's user token.
#[derive(Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	token_url: String,
	client_id: String,
	client_secret: SecretString,
	channel: String,
	token: Mutex<Option<AppToken>>,
	channel_id: Mutex<Option<u64>>,
}

impl HelixClient {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString, channel: impl Into<String>) -> anyhow::Result<Self> {
		let base_url = Url::parse(HELIX_BASE_URL).context("parse helix base url")?;
		Self::with_urls(base_url, TOKEN_URL, client_id, client_secret, channel)
	}

	pub fn with_urls(
		base_url: Url,
		token_url: impl Into<String>,
		client_id: impl Into<String>,
		client_secret: SecretString,
		channel: impl Into<String>,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("multichat/0.x (helix)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			token_url: token_url.into(),
			client_id: client_id.into(),
			client_secret,
			channel: channel.into().to_lowercase(),
			token: Mutex::new(None),
			channel_id: Mutex::new(None),
		})
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	async fn app_token(&self) -> anyhow::Result<String> {
		{
			let guard = self.token.lock();
			if let Some(t) = guard.as_ref()
				&& Instant::now() < t.expires_at
			{
				return Ok(t.access_token.expose().to_string());
			}
		}

		let resp = self
			.http
			.post(&self.token_url)
			.form(&[
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose()),
				("grant_type", "client_credentials"),
			])
			.send()
			.await
			.context("twitch app token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch app token read body")?;
		if !status.is_success() {
			anyhow::bail!("twitch app token failed: status={status} body={body}");
		}

		let parsed: AppTokenResponse = serde_json::from_str(&body).context("twitch app token parse json")?;
		let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
		info!(expires_in = parsed.expires_in, "twitch app token acquired");

		let access = parsed.access_token.clone();
		*self.token.lock() = Some(AppToken {
			access_token: SecretString::new(parsed.access_token),
			expires_at: Instant::now() + lifetime,
		});
		Ok(access)
	}

	async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str, label: &'static str) -> anyhow::Result<T> {
		let url = self.url(path_and_query)?;
		let token = self.app_token().await?;
		let req = self
			.http
			.get(url)
			.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {token}"));

		let resp = match send_with_retry(req, label).await {
			Ok(r) => r,
			Err(e) => {
				if is_helix_auth_error(&e) {
					debug!("dropping cached app token after auth failure");
					*self.token.lock() = None;
				}
				return Err(e);
			}
		};

		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("helix {label} read body"))?;
		if !status.is_success() {
			anyhow::bail!("helix {label} failed: status={status} body={body}");
		}

		serde_json::from_str(&body).with_context(|| format!("helix {label} parse json"))
	}

	/// Numeric id of `login`, if the account exists.
	pub async fn user_id(&self, login: &str) -> anyhow::Result<Option<u64>> {
		let path = format!("{USERS_PATH}?login={}", urlencoding::encode(login));
		let parsed: HelixUsersResponse = self.get_json(&path, "GET /helix/users").await?;
		match parsed.data.into_iter().next() {
			Some(user) => {
				let id = user.id.parse::<u64>().context("helix user id is not numeric")?;
				Ok(Some(id))
			}
			None => Ok(None),
		}
	}

	pub async fn global_emotes(&self) -> anyhow::Result<Vec<HelixEmote>> {
		let parsed: HelixEmotesResponse = self.get_json(GLOBAL_EMOTES_PATH, "GET /helix/chat/emotes/global").await?;
		Ok(parsed.data)
	}

	pub async fn channel_emotes(&self, broadcaster_id: u64) -> anyhow::Result<Vec<HelixEmote>> {
		let path = format!("{CHANNEL_EMOTES_PATH}?broadcaster_id={broadcaster_id}");
		let parsed: HelixEmotesResponse = self.get_json(&path, "GET /helix/chat/emotes").await?;
		Ok(parsed.data)
	}
}

#[async_trait]
impl ChannelIdResolver for HelixClient {
	async fn channel_id(&self) -> anyhow::Result<u64> {
		if let Some(id) = *self.channel_id.lock() {
			return Ok(id);
		}

		let id = self
			.user_id(&self.channel)
			.await?
			.with_context(|| format!("twitch channel {} not found", self.channel))?;
		*self.channel_id.lock() = Some(id);
		Ok(id)
	}
}

#[derive(Debug, Deserialize)]
struct AppTokenResponse {
	access_token: String,
	expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
}

#[derive(Debug, Deserialize)]
struct HelixEmotesResponse {
	#[serde(default)]
	data: Vec<HelixEmote>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixEmote {
	pub id: String,
	pub name: String,
}

#[cfg(test)]
mod tests {
	use reqwest::header::HeaderValue;

	use super::*;

	#[test]
	fn retry_after_header_wins() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(3)));
	}

	#[test]
	fn past_ratelimit_reset_is_ignored() {
		let mut headers = HeaderMap::new();
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("1"));
		assert_eq!(retry_delay_from_headers(&headers), None);
	}

	#[test]
	fn parses_emote_payload() {
		let parsed: HelixEmotesResponse = serde_json::from_str(
			r#"{"data":[{"id":"25","name":"Kappa","images":{},"format":["static"]}],"template":"x"}"#,
		)
		.unwrap();
		assert_eq!(parsed.data.len(), 1);
		assert_eq!(parsed.data[0].name, "Kappa");
	}

	#[test]
	fn auth_errors_are_detected_through_context() {
		let err = anyhow::anyhow!("helix auth failed (status=401) body=").context("GET /helix/users");
		assert!(is_helix_auth_error(&err));
		assert!(!is_helix_auth_error(&anyhow::anyhow!("timeout")));
	}
}
