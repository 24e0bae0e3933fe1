#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use multichat_domain::ChatMessage;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// Encoded `{type, content}` frame shared by every subscriber queue.
pub type Frame = Arc<str>;

/// Configuration for `ChatHub`.
#[derive(Debug, Clone)]
pub struct ChatHubConfig {
	/// Messages kept for `/chat_history` and late joiners.
	pub history_length: usize,

	/// Maximum number of queued frames per subscriber.
	pub subscriber_queue_capacity: usize,

	/// Hash of the page template, sent to each client on connect.
	pub page_hash: String,
}

impl Default for ChatHubConfig {
	fn default() -> Self {
		Self {
			history_length: 100,
			subscriber_queue_capacity: 256,
			page_hash: String::new(),
		}
	}
}

/// Write half of one overlay connection.
#[async_trait]
pub trait SubscriberSink: Send + 'static {
	async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

	async fn close(&mut self);
}

struct Subscriber {
	id: SubscriberId,
	tx: mpsc::Sender<Frame>,
	dropped: u64,
}

/// Chat history ring buffer plus the overlay subscriber registry.
pub struct ChatHub {
	cfg: ChatHubConfig,
	history: Mutex<VecDeque<ChatMessage>>,
	subscribers: Mutex<Vec<Subscriber>>,
	next_id: AtomicU64,
}

/// Served in place of a missing page template.
pub const FALLBACK_INDEX_HTML: &str = "<html><body><h1>tenant container fallback index</h1></body></html>";

/// Hex SHA-256 of the page template at `path`, or of the fallback page.
pub fn page_hash_of(path: &Path) -> String {
	let bytes = match std::fs::read(path) {
		Ok(bytes) => bytes,
		Err(e) => {
			warn!(path = %path.display(), error = %e, "page template unreadable; hashing fallback page");
			FALLBACK_INDEX_HTML.as_bytes().to_vec()
		}
	};
	format!("{:x}", Sha256::digest(&bytes))
}

pub fn encode_event(kind: &str, content: &Value) -> Frame {
	Arc::from(json!({ "type": kind, "content": content }).to_string())
}

impl ChatHub {
	pub fn new(cfg: ChatHubConfig) -> Self {
		Self {
			history: Mutex::new(VecDeque::with_capacity(cfg.history_length.min(1024))),
			subscribers: Mutex::new(Vec::new()),
			next_id: AtomicU64::new(1),
			cfg,
		}
	}

	/// Register a subscriber. The page hash is already queued on the returned stream.
	pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Frame>) {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);

		let _ = tx.try_send(encode_event("page_hash", &json!({ "page_hash": self.cfg.page_hash })));

		let count = {
			let mut subs = self.subscribers.lock();
			subs.retain(|s| !s.tx.is_closed());
			subs.push(Subscriber { id, tx, dropped: 0 });
			subs.len()
		};

		metrics::gauge!("multichat_ws_clients").set(count as f64);
		info!(subscriber_id = id, clients = count, "websocket client connected");
		(id, rx)
	}

	pub fn unregister(&self, id: SubscriberId) -> bool {
		let (removed, count) = {
			let mut subs = self.subscribers.lock();
			let before = subs.len();
			subs.retain(|s| s.id != id);
			(subs.len() != before, subs.len())
		};
		if removed {
			metrics::gauge!("multichat_ws_clients").set(count as f64);
			info!(subscriber_id = id, clients = count, "websocket client disconnected");
		}
		removed
	}

	pub fn num_clients(&self) -> usize {
		self.subscribers.lock().iter().filter(|s| !s.tx.is_closed()).count()
	}

	/// Deliver `{type, content}` to every subscriber without waiting on any of them.
	///
	/// Closed subscribers are removed; a full queue drops the frame for that
	/// subscriber only. Returns the number of queues that accepted the frame.
	pub fn broadcast(&self, kind: &str, content: Value) -> usize {
		let frame = encode_event(kind, &content);

		let mut delivered = 0usize;
		let mut closed = Vec::new();
		let count = {
			let mut subs = self.subscribers.lock();
			for sub in subs.iter_mut() {
				match sub.tx.try_send(frame.clone()) {
					Ok(()) => delivered += 1,
					Err(mpsc::error::TrySendError::Full(_)) => {
						sub.dropped = sub.dropped.saturating_add(1);
						metrics::counter!("multichat_ws_frames_dropped_total").increment(1);
						debug!(subscriber_id = sub.id, dropped = sub.dropped, "subscriber queue full");
					}
					Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
				}
			}
			if !closed.is_empty() {
				subs.retain(|s| !closed.contains(&s.id));
			}
			subs.len()
		};

		if !closed.is_empty() {
			metrics::counter!("multichat_ws_clients_removed_total").increment(closed.len() as u64);
			metrics::gauge!("multichat_ws_clients").set(count as f64);
			warn!(removed = closed.len(), "removed closed websocket clients");
		}
		metrics::counter!("multichat_broadcasts_total", "type" => kind.to_string()).increment(1);
		delivered
	}

	/// Append to history (dropping the oldest past the cap) and broadcast a `chat` event.
	pub fn publish_chat(&self, msg: ChatMessage) {
		let content = match serde_json::to_value(&msg) {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "chat message did not serialize");
				return;
			}
		};

		{
			let mut history = self.history.lock();
			history.push_back(msg);
			while history.len() > self.cfg.history_length {
				history.pop_front();
			}
		}

		self.broadcast("chat", content);
	}

	/// Empty the history and tell clients to clear.
	pub fn clear(&self) {
		self.history.lock().clear();
		info!("chat history cleared");
		self.broadcast("command", json!({ "command": "clear" }));
	}

	pub fn history(&self) -> Vec<ChatMessage> {
		self.history.lock().iter().cloned().collect()
	}

	/// Rewrite the nickname on every retained message from `username`.
	pub fn patch_nickname(&self, username: &str, nickname: &str) -> usize {
		let mut history = self.history.lock();
		let mut patched = 0;
		for msg in history.iter_mut().filter(|m| m.username == username) {
			msg.nickname = nickname.to_string();
			patched += 1;
		}
		patched
	}

	/// Rewrite pronouns on every retained message from `username` (case-insensitive).
	pub fn patch_pronouns(&self, username: &str, pronouns: &str) -> usize {
		let mut history = self.history.lock();
		let mut patched = 0;
		for msg in history.iter_mut().filter(|m| m.username.eq_ignore_ascii_case(username)) {
			msg.pronouns = pronouns.to_string();
			patched += 1;
		}
		patched
	}
}

/// Drain one subscriber's queue into its connection until either side closes.
pub async fn pump_subscriber<S: SubscriberSink>(
	hub: Arc<ChatHub>,
	id: SubscriberId,
	mut rx: mpsc::Receiver<Frame>,
	mut sink: S,
) {
	while let Some(frame) = rx.recv().await {
		if let Err(e) = sink.send_text(&frame).await {
			warn!(subscriber_id = id, error = %e, "websocket send failed");
			break;
		}
	}
	rx.close();
	sink.close().await;
	hub.unregister(id);
}
