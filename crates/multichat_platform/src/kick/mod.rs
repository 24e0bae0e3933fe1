#![forbid(unsafe_code)]

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use multichat_domain::ChatSource;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::{
	ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, InboundChat, PlatformConnector, new_session_id,
	status,
};

const PUSHER_KEY: &str = "32cbd69e4b950bf97679";
const PUSHER_CLUSTER: &str = "us2";
const CHAT_MESSAGE_EVENT: &str = "App\\Events\\ChatMessageEvent";

pub fn pusher_url() -> String {
	format!("wss://ws-{PUSHER_CLUSTER}.pusher.com/app/{PUSHER_KEY}?protocol=7&client=js&version=8.4.0-rc2&flash=false")
}

/// Chatroom to follow.
#[derive(Debug, Clone)]
pub struct KickConfig {
	pub chatroom_id: u64,
	pub ws_url: String,
}

impl KickConfig {
	pub fn new(chatroom_id: u64) -> Self {
		Self {
			chatroom_id,
			ws_url: pusher_url(),
		}
	}

	fn channel(&self) -> String {
		format!("chatrooms.{}.v2", self.chatroom_id)
	}
}

/// Parse a `kick_chatroom_id` prop value (a decimal string).
pub fn parse_chatroom_id(s: &str) -> Option<u64> {
	s.trim().parse::<u64>().ok()
}

/// One decoded Pusher frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PusherFrame {
	ConnectionEstablished,
	SubscriptionSucceeded,
	Ping,
	Chat(Box<InboundChat>),
	Error(String),
	Other,
}

fn chat_from_data(data: &Value) -> Option<InboundChat> {
	let content = data.get("content").and_then(Value::as_str).unwrap_or_default();
	let sender = data.get("sender")?;
	let username = sender.get("username").and_then(Value::as_str).unwrap_or_default();
	if username.is_empty() {
		return None;
	}
	let identity = sender.get("identity");

	let mut chat = InboundChat::new(ChatSource::Kick, username, content);
	if let Some(slug) = sender.get("slug").and_then(Value::as_str) {
		chat.login = slug.to_string();
	}
	chat.color = identity
		.and_then(|i| i.get("color"))
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_string();

	for badge in identity
		.and_then(|i| i.get("badges"))
		.and_then(Value::as_array)
		.into_iter()
		.flatten()
	{
		match badge.get("type").and_then(Value::as_str) {
			Some("moderator") => chat.is_moderator = true,
			Some("broadcaster") => chat.is_broadcaster = true,
			_ => {}
		}
	}
	Some(chat)
}

/// Decode a text frame. Pusher double-encodes `data` as a JSON string.
pub fn parse_pusher_frame(text: &str) -> PusherFrame {
	let Ok(frame) = serde_json::from_str::<Value>(text) else {
		return PusherFrame::Other;
	};
	let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();
	let data = match frame.get("data") {
		Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
		Some(v) => v.clone(),
		None => Value::Null,
	};

	match event {
		"pusher:connection_established" => PusherFrame::ConnectionEstablished,
		"pusher_internal:subscription_succeeded" => PusherFrame::SubscriptionSucceeded,
		"pusher:ping" => PusherFrame::Ping,
		"pusher:error" => PusherFrame::Error(
			data.get("message")
				.and_then(Value::as_str)
				.unwrap_or("unknown pusher error")
				.to_string(),
		),
		CHAT_MESSAGE_EVENT => chat_from_data(&data).map_or(PusherFrame::Other, |c| PusherFrame::Chat(Box::new(c))),
		_ => PusherFrame::Other,
	}
}

/// Kick chat via its public Pusher socket.
pub struct KickConnector {
	cfg: KickConfig,
}

impl KickConnector {
	pub fn new(cfg: KickConfig) -> Self {
		Self { cfg }
	}
}

#[async_trait::async_trait]
impl PlatformConnector for KickConnector {
	fn source(&self) -> ChatSource {
		ChatSource::Kick
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		info!(%session_id, chatroom_id = self.cfg.chatroom_id, "kick connecting");

		let (ws, _resp) = tokio_tungstenite::connect_async(self.cfg.ws_url.as_str())
			.await
			.context("connect_async to kick pusher")?;
		let (mut write, mut read) = ws.split();

		let subscribe = json!({
			"event": "pusher:subscribe",
			"data": { "auth": "", "channel": self.cfg.channel() },
		});
		write
			.send(Message::Text(subscribe.to_string().into()))
			.await
			.context("kick subscribe")?;

		let result: anyhow::Result<()> = loop {
			tokio::select! {
				cmd = control_rx.recv() => {
					match cmd {
						Some(ConnectorControl::Say { .. }) => {}
						Some(ConnectorControl::Shutdown) | None => {
							info!(%session_id, "kick received Shutdown");
							let _ = write.close().await;
							break Ok(());
						}
					}
				}

				msg = read.next() => {
					let Some(msg) = msg else {
						break Err(anyhow::anyhow!("kick stream ended"));
					};
					let msg = match msg {
						Ok(m) => m,
						Err(e) => break Err(anyhow::Error::new(e).context("kick read")),
					};

					match msg {
						Message::Text(t) => match parse_pusher_frame(t.as_str()) {
							PusherFrame::ConnectionEstablished => debug!("pusher connection established"),
							PusherFrame::SubscriptionSucceeded => {
								info!(chatroom_id = self.cfg.chatroom_id, "kick chatroom joined");
								let _ = events_tx.try_send(status(
									ChatSource::Kick,
									true,
									format!("subscribed to {}", self.cfg.channel()),
								));
							}
							PusherFrame::Ping => {
								let pong = json!({ "event": "pusher:pong", "data": {} });
								if let Err(e) = write.send(Message::Text(pong.to_string().into())).await {
									break Err(anyhow::Error::new(e).context("kick pong"));
								}
							}
							PusherFrame::Chat(chat) => {
								metrics::counter!("multichat_connector_messages_total", "source" => "kick").increment(1);
								if events_tx.send(ConnectorEvent::Chat(chat)).await.is_err() {
									break Ok(());
								}
							}
							PusherFrame::Error(message) => {
								warn!(%message, "pusher error");
							}
							PusherFrame::Other => {}
						},
						Message::Ping(p) => {
							let _ = write.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							break Err(anyhow::anyhow!("kick closed: {frame:?}"));
						}
						_ => {}
					}
				}
			}
		};

		let _ = events_tx.try_send(status(ChatSource::Kick, false, "kick socket closed"));
		result
	}
}
