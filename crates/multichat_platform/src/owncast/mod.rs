#![forbid(unsafe_code)]

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use multichat_domain::{ChatSource, EmoteRanges, format_range};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::{
	ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, InboundChat, PlatformConnector, new_session_id,
	status,
};

const DEFAULT_COLOR: &str = "rgb(255,255,255)";

/// Target Owncast server and the name the bot registers under.
#[derive(Debug, Clone)]
pub struct OwncastConfig {
	/// Bare host (`owncast.example.com`), no scheme.
	pub host: String,
	pub display_name: String,
	pub secure: bool,
}

impl OwncastConfig {
	pub fn new(host: impl Into<String>, display_name: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			display_name: display_name.into(),
			secure: true,
		}
	}

	fn register_url(&self) -> String {
		let scheme = if self.secure { "https" } else { "http" };
		format!("{scheme}://{}/api/chat/register", self.host)
	}

	fn ws_url(&self, access_token: &str) -> String {
		let scheme = if self.secure { "wss" } else { "ws" };
		format!("{scheme}://{}/ws?accessToken={}", self.host, urlencoding::encode(access_token))
	}
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
	#[serde(default, rename = "accessToken")]
	access_token: String,
}

/// Owncast chat over its websocket.
pub struct OwncastConnector {
	cfg: OwncastConfig,
	http: reqwest::Client,
}

impl OwncastConnector {
	pub fn new(cfg: OwncastConfig) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("multichat/0.x (owncast)")
			.build()
			.context("build reqwest client")?;
		Ok(Self { cfg, http })
	}

	async fn register(&self) -> anyhow::Result<String> {
		let resp = self
			.http
			.post(self.cfg.register_url())
			.json(&json!({ "displayName": self.cfg.display_name }))
			.send()
			.await
			.context("owncast register request")?
			.error_for_status()
			.context("owncast register status")?;
		let body: RegisterResponse = resp.json().await.context("owncast register json")?;
		if body.access_token.is_empty() {
			anyhow::bail!("owncast register returned no accessToken");
		}
		Ok(body.access_token)
	}
}

fn strip_markup(body: &str) -> String {
	body.replace("<p>", "").replace("</p>", "").replace('\n', " ")
}

/// Map one Owncast socket event to a chat line.
///
/// Events without a body or a display name are dropped. Non-`CHAT` events
/// carry HTML paragraphs that are flattened; fediverse likes become
/// `title image body` with the image annotated as an emote.
pub fn parse_owncast_message(m: &Value) -> Option<InboundChat> {
	let kind = m.get("type").and_then(Value::as_str).unwrap_or_default();
	let mut body = m.get("body").and_then(Value::as_str).unwrap_or_default().to_string();
	let user = m.get("user").filter(|u| u.is_object())?;
	if body.is_empty() {
		return None;
	}

	let name = user.get("displayName").and_then(Value::as_str).unwrap_or_default();
	if name.is_empty() {
		return None;
	}

	let color = user
		.get("displayColor")
		.and_then(Value::as_f64)
		.map(|c| format!("hsla({}, 100%, 60%, 0.85)", c as i64))
		.unwrap_or_else(|| DEFAULT_COLOR.to_string());

	if kind != "CHAT" {
		body = strip_markup(&body);
	}

	let mut emotes = EmoteRanges::new();
	if kind == "FEDIVERSE_ENGAGEMENT_LIKE" {
		let title = m.get("title").and_then(Value::as_str).unwrap_or_default();
		let image = m.get("image").and_then(Value::as_str).unwrap_or_default();
		body = format!("{title} {image} {body}");
		if !image.is_empty()
			&& let Some(start) = body.find(image)
		{
			emotes.insert(image.to_string(), vec![format_range(start, start + image.len() - 1)]);
		}
	}

	let mut chat = InboundChat::new(ChatSource::Owncast, name, body);
	chat.color = color;
	chat.emotes = emotes;
	Some(chat)
}

#[async_trait::async_trait]
impl PlatformConnector for OwncastConnector {
	fn source(&self) -> ChatSource {
		ChatSource::Owncast
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		info!(%session_id, host = %self.cfg.host, "owncast connecting");

		let token = self.register().await?;
		let (mut ws, _resp) = tokio_tungstenite::connect_async(self.cfg.ws_url(&token).as_str())
			.await
			.context("connect_async to owncast ws")?;

		info!(host = %self.cfg.host, "owncast connected");
		let _ = events_tx.try_send(status(ChatSource::Owncast, true, format!("connected to {}", self.cfg.host)));
		let _ = events_tx
			.send(ConnectorEvent::Announce {
				text: format!("connected to owncast chat: https://{}", self.cfg.host),
				later: true,
			})
			.await;

		let result: anyhow::Result<()> = loop {
			tokio::select! {
				cmd = control_rx.recv() => {
					match cmd {
						Some(ConnectorControl::Say { .. }) => {}
						Some(ConnectorControl::Shutdown) | None => {
							info!(%session_id, "owncast received Shutdown");
							let _ = ws.close(None).await;
							break Ok(());
						}
					}
				}

				msg = ws.next() => {
					let Some(msg) = msg else {
						break Err(anyhow::anyhow!("owncast stream ended"));
					};
					let msg = match msg {
						Ok(m) => m,
						Err(e) => break Err(anyhow::Error::new(e).context("owncast read")),
					};

					match msg {
						Message::Text(t) => {
							let mut closed = false;
							for line in t.as_str().split('\n').filter(|l| !l.trim().is_empty()) {
								let value: Value = match serde_json::from_str(line) {
									Ok(v) => v,
									Err(e) => {
										warn!(error = %e, "owncast parse failed");
										continue;
									}
								};
								let Some(chat) = parse_owncast_message(&value) else {
									debug!("owncast event without chat body");
									continue;
								};
								metrics::counter!("multichat_connector_messages_total", "source" => "owncast").increment(1);
								if events_tx.send(ConnectorEvent::Chat(Box::new(chat))).await.is_err() {
									closed = true;
									break;
								}
							}
							if closed {
								break Ok(());
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							break Err(anyhow::anyhow!("owncast closed: {frame:?}"));
						}
						_ => {}
					}
				}
			}
		};

		let _ = events_tx
			.send(ConnectorEvent::Announce {
				text: "disconnected from owncast chat".to_string(),
				later: false,
			})
			.await;
		let _ = events_tx.try_send(status(ChatSource::Owncast, false, "owncast socket closed"));
		result
	}
}
