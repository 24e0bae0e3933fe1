#![forbid(unsafe_code)]

mod client;

use std::time::Duration;

use multichat_domain::ChatSource;
use multichat_util::profanity;
use multichat_util::time::unix_ms_now;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use client::{ChatPage, LiveChatSession, YouTubeChatItem, YouTubeClient, parse_chat_page, parse_live_page};

use crate::{
	ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, InboundChat, PlatformConnector, new_session_id,
	status,
};

/// Polling knobs for the live chat reader.
#[derive(Debug, Clone)]
pub struct YouTubeConfig {
	pub channel_id: String,
	pub poll_interval: Duration,
	pub error_backoff: Duration,
	pub max_message_age: Duration,
}

impl YouTubeConfig {
	pub fn new(channel_id: impl Into<String>) -> Self {
		Self {
			channel_id: channel_id.into(),
			poll_interval: Duration::from_secs(2),
			error_backoff: Duration::from_secs(5),
			max_message_age: Duration::from_secs(60),
		}
	}
}

/// YouTube live chat via innertube polling.
pub struct YouTubeConnector {
	cfg: YouTubeConfig,
	client: YouTubeClient,

	/// Line prefixes relayed to primary chat (e.g. `!sr`).
	forward_prefixes: watch::Receiver<Vec<String>>,
}

impl YouTubeConnector {
	pub fn new(cfg: YouTubeConfig, client: YouTubeClient, forward_prefixes: watch::Receiver<Vec<String>>) -> Self {
		Self {
			cfg,
			client,
			forward_prefixes,
		}
	}
}

/// Message age relative to `now_ms`; unknown timestamps count as fresh.
fn is_stale(item: &YouTubeChatItem, now_ms: i64, max_age: Duration) -> bool {
	if item.timestamp_usec <= 0 {
		return false;
	}
	let sent_ms = item.timestamp_usec / 1000;
	now_ms.saturating_sub(sent_ms) > max_age.as_millis() as i64
}

/// Censored copy of `text` if it starts with one of `prefixes`.
fn forwarded_line(text: &str, prefixes: &[String]) -> Option<String> {
	prefixes
		.iter()
		.any(|p| !p.is_empty() && text.starts_with(p.as_str()))
		.then(|| profanity::censor(text))
}

fn item_to_chat(item: YouTubeChatItem) -> InboundChat {
	let mut chat = InboundChat::new(ChatSource::YouTube, item.author, item.text);
	chat.emotes = item.emotes;
	chat
}

enum Wait {
	Elapsed,
	Stop,
}

/// Sleep for `d` unless a control message asks us to stop first.
async fn wait_or_stop(control_rx: &mut ConnectorControlRx, d: Duration) -> Wait {
	let sleep = tokio::time::sleep(d);
	tokio::pin!(sleep);
	loop {
		tokio::select! {
			_ = &mut sleep => return Wait::Elapsed,
			cmd = control_rx.recv() => match cmd {
				Some(ConnectorControl::Say { .. }) => {}
				Some(ConnectorControl::Shutdown) | None => return Wait::Stop,
			},
		}
	}
}

#[async_trait::async_trait]
impl PlatformConnector for YouTubeConnector {
	fn source(&self) -> ChatSource {
		ChatSource::YouTube
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		info!(%session_id, channel_id = %self.cfg.channel_id, "youtube connecting");

		let mut session = self.client.open_session(&self.cfg.channel_id).await?;

		info!(video_id = %session.video_id, "youtube live chat found");
		let _ = events_tx.try_send(status(
			ChatSource::YouTube,
			true,
			format!("polling youtu.be/{}", session.video_id),
		));
		let _ = events_tx
			.send(ConnectorEvent::Announce {
				text: format!("connected to youtube chat: youtu.be/{}", session.video_id),
				later: true,
			})
			.await;

		'poll: loop {
			let page = match self.client.fetch_chat(&session).await {
				Ok(p) => p,
				Err(e) => {
					warn!(error = %e, "youtube fetch failed");
					match wait_or_stop(&mut control_rx, self.cfg.error_backoff).await {
						Wait::Elapsed => continue,
						Wait::Stop => break,
					}
				}
			};

			let now_ms = unix_ms_now();
			let prefixes = self.forward_prefixes.borrow().clone();
			debug!(count = page.items.len(), "youtube chat page");

			for item in page.items {
				if item.text.is_empty() {
					continue;
				}
				if is_stale(&item, now_ms, self.cfg.max_message_age) {
					debug!(author = %item.author, "skipping old youtube message");
					continue;
				}

				let forward = forwarded_line(&item.text, &prefixes);
				metrics::counter!("multichat_connector_messages_total", "source" => "youtube").increment(1);
				if events_tx.send(ConnectorEvent::Chat(Box::new(item_to_chat(item)))).await.is_err() {
					break 'poll;
				}
				if let Some(text) = forward {
					info!(%text, "forwarding youtube command to twitch");
					let _ = events_tx.send(ConnectorEvent::Announce { text, later: false }).await;
				}
			}

			let Some(next) = page.next_continuation else {
				info!("youtube stream over");
				break;
			};
			session.continuation = next;

			if let Wait::Stop = wait_or_stop(&mut control_rx, self.cfg.poll_interval).await {
				break;
			}
		}

		let _ = events_tx
			.send(ConnectorEvent::Announce {
				text: "disconnected from youtube chat".to_string(),
				later: false,
			})
			.await;
		let _ = events_tx.try_send(status(ChatSource::YouTube, false, "youtube polling stopped"));
		Ok(())
	}
}
