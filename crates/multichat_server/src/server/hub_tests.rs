use std::sync::Arc;
use std::time::Duration;

use multichat_domain::{ChatMessage, ChatSource, EmoteRanges};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::time::timeout;

use super::hub::{ChatHub, ChatHubConfig, FALLBACK_INDEX_HTML, SubscriberSink, page_hash_of, pump_subscriber};

fn hub_with(history_length: usize, queue: usize) -> ChatHub {
	ChatHub::new(ChatHubConfig {
		history_length,
		subscriber_queue_capacity: queue,
		page_hash: "abc123".to_string(),
	})
}

fn msg(username: &str, text: &str) -> ChatMessage {
	ChatMessage {
		source: ChatSource::Twitch,
		username: username.to_string(),
		nickname: String::new(),
		pronouns: String::new(),
		color: String::new(),
		emotes: EmoteRanges::new(),
		text: text.to_string(),
	}
}

fn parse(frame: &str) -> Value {
	serde_json::from_str(frame).expect("frame is json")
}

#[tokio::test]
async fn register_queues_page_hash_first() {
	let hub = hub_with(10, 8);
	let (_id, mut rx) = hub.register();

	let first = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("timed out")
		.expect("closed");
	assert_eq!(parse(&first), json!({"type": "page_hash", "content": {"page_hash": "abc123"}}));

	hub.broadcast("channel_prop", json!({"prop_name": "font", "prop_value": "x"}));
	let second = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
	assert_eq!(parse(&second)["type"], "channel_prop");
}

#[tokio::test]
async fn broadcast_skips_broken_subscriber_among_many() {
	let hub = hub_with(10, 8);
	let mut receivers = Vec::new();
	for _ in 0..1000 {
		receivers.push(hub.register());
	}

	// Connection 500 is already gone.
	let (broken_id, broken_rx) = receivers.remove(500);
	drop(broken_rx);

	let delivered = hub.broadcast("chat", json!({"text": "hi"}));
	assert_eq!(delivered, 999);
	assert_eq!(hub.num_clients(), 999);
	assert!(!hub.unregister(broken_id), "broken subscriber should already be gone");

	for (_id, rx) in receivers.iter_mut() {
		let _page_hash = rx.try_recv().expect("page hash");
		let frame = rx.try_recv().expect("chat frame");
		assert_eq!(parse(&frame)["content"]["text"], "hi");
	}
}

#[tokio::test]
async fn full_queue_only_drops_for_that_subscriber() {
	let hub = hub_with(10, 2);
	let (_slow, mut slow_rx) = hub.register();
	let (_fast, mut fast_rx) = hub.register();

	// page_hash + one frame fills the slow queue.
	hub.broadcast("chat", json!(1));
	let _ = fast_rx.try_recv();
	let _ = fast_rx.try_recv();

	let delivered = hub.broadcast("chat", json!(2));
	assert_eq!(delivered, 1);
	assert_eq!(hub.num_clients(), 2);
	assert_eq!(parse(&fast_rx.try_recv().unwrap())["content"], 2);

	let _ = slow_rx.try_recv();
	assert_eq!(parse(&slow_rx.try_recv().unwrap())["content"], 1);
	assert!(slow_rx.try_recv().is_err());
}

#[tokio::test]
async fn clear_empties_history_and_notifies() {
	let hub = hub_with(10, 8);
	hub.publish_chat(msg("alice", "one"));
	let (_id, mut rx) = hub.register();
	let _ = rx.try_recv();

	hub.clear();
	assert!(hub.history().is_empty());
	let frame = parse(&rx.try_recv().unwrap());
	assert_eq!(frame, json!({"type": "command", "content": {"command": "clear"}}));
}

#[test]
fn nickname_patch_leaves_other_fields() {
	let hub = hub_with(10, 8);
	let mut original = msg("alice", "hello Kappa");
	original.emotes.insert("https://e/kappa".to_string(), vec!["6-10".to_string()]);
	hub.publish_chat(original.clone());
	hub.publish_chat(msg("bob", "yo"));

	assert_eq!(hub.patch_nickname("alice", "Al"), 1);

	let history = hub.history();
	assert_eq!(history[0].nickname, "Al");
	assert_eq!(history[0].username, original.username);
	assert_eq!(history[0].text, original.text);
	assert_eq!(history[0].emotes, original.emotes);
	assert_eq!(history[1].nickname, "");
}

#[test]
fn pronoun_patch_ignores_case() {
	let hub = hub_with(10, 8);
	hub.publish_chat(msg("Alice", "a"));
	hub.publish_chat(msg("alice", "b"));
	hub.publish_chat(msg("bob", "c"));

	assert_eq!(hub.patch_pronouns("ALICE", "She/Her"), 2);
	assert_eq!(hub.history()[2].pronouns, "");
}

proptest! {
	#[test]
	fn history_keeps_most_recent_in_order(cap in 0usize..20, count in 0usize..60) {
		let hub = hub_with(cap, 4);
		for i in 0..count {
			hub.publish_chat(msg("u", &i.to_string()));
			prop_assert!(hub.history().len() <= cap);
		}

		let texts: Vec<String> = hub.history().into_iter().map(|m| m.text).collect();
		let expected: Vec<String> = (count.saturating_sub(cap)..count).map(|i| i.to_string()).collect();
		prop_assert_eq!(texts, expected);
	}
}

#[derive(Clone, Default)]
struct RecordingSink {
	sent: Arc<Mutex<Vec<String>>>,
	closed: Arc<Mutex<bool>>,
	fail_after: Option<usize>,
}

#[async_trait::async_trait]
impl SubscriberSink for RecordingSink {
	async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
		let mut sent = self.sent.lock();
		if self.fail_after.is_some_and(|n| sent.len() >= n) {
			anyhow::bail!("connection reset");
		}
		sent.push(text.to_string());
		Ok(())
	}

	async fn close(&mut self) {
		*self.closed.lock() = true;
	}
}

#[tokio::test]
async fn pump_unregisters_after_send_error() {
	let hub = Arc::new(hub_with(10, 8));
	let (id, rx) = hub.register();
	let sink = RecordingSink {
		fail_after: Some(1),
		..Default::default()
	};
	let probe = sink.clone();

	let task = tokio::spawn(pump_subscriber(hub.clone(), id, rx, sink));
	hub.broadcast("chat", json!("x"));

	timeout(Duration::from_millis(500), task)
		.await
		.expect("pump should stop")
		.unwrap();
	assert_eq!(probe.sent.lock().len(), 1);
	assert!(*probe.closed.lock());
	assert_eq!(hub.num_clients(), 0);
}

#[test]
fn page_hash_tracks_template_contents() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("index.html");

	let fallback = page_hash_of(&path);
	assert_eq!(fallback.len(), 64);

	std::fs::write(&path, FALLBACK_INDEX_HTML).unwrap();
	assert_eq!(page_hash_of(&path), fallback);

	std::fs::write(&path, "<html>v2</html>").unwrap();
	let updated = page_hash_of(&path);
	assert_ne!(updated, fallback);
	assert!(updated.chars().all(|c| c.is_ascii_hexdigit()));
}
