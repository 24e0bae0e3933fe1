use std::sync::Arc;

use multichat_domain::PropValue;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::hub::{ChatHub, ChatHubConfig};
use super::props::PropStore;
use super::props_backend::{InMemoryPropBackend, PropBackend};

fn store() -> (Arc<PropStore>, Arc<InMemoryPropBackend>, Arc<ChatHub>) {
	let backend = Arc::new(InMemoryPropBackend::default());
	let hub = Arc::new(ChatHub::new(ChatHubConfig::default()));
	let props = Arc::new(PropStore::new("chan", backend.clone(), hub.clone()));
	(props, backend, hub)
}

fn frames(rx: &mut tokio::sync::mpsc::Receiver<super::hub::Frame>) -> Vec<Value> {
	let mut out = Vec::new();
	while let Ok(f) = rx.try_recv() {
		out.push(serde_json::from_str(&f).unwrap());
	}
	out
}

#[tokio::test]
async fn absent_and_garbage_values_use_defaults() {
	let (props, backend, _hub) = store();
	assert_eq!(props.get_channel_prop("enabled").await, PropValue::Bool(true));
	assert_eq!(props.channel_int("greetz_threshold").await, 18_000_000);
	assert_eq!(props.channel_int("greetz_wb_threshold").await, 2_700_000);
	assert_eq!(props.channel_list("fwd_cmds_yt_twitch").await, vec!["!sr", "!test"]);
	assert_eq!(props.get_channel_prop("no_such_prop").await, PropValue::Null);

	backend.set_channel_raw("chan", "max_nickname_length", "{not json").await.unwrap();
	assert_eq!(props.channel_int("max_nickname_length").await, 20);
	assert_eq!(props.get_viewer_prop("alice", "nickname").await, PropValue::Null);
}

#[tokio::test]
async fn numeric_props_widen_between_int_and_float() {
	let (props, backend, _hub) = store();
	backend.set_channel_raw("chan", "max_nickname_length", "12.0").await.unwrap();
	assert_eq!(props.channel_int("max_nickname_length").await, 12);
	assert_eq!(props.channel_number::<f64>("greetz_threshold").await, 18_000_000.0);

	props
		.set_channel_prop("max_nickname_length", PropValue::from("long"))
		.await
		.unwrap();
	assert_eq!(props.channel_int("max_nickname_length").await, 0);
}

#[tokio::test]
async fn null_write_deletes_and_default_returns() {
	let (props, backend, _hub) = store();
	props.set_channel_prop("enabled", PropValue::Bool(false)).await.unwrap();
	assert!(!props.channel_bool("enabled").await);

	props.set_channel_prop("enabled", PropValue::Null).await.unwrap();
	assert_eq!(backend.get_channel_raw("chan", "enabled").await.unwrap(), None);
	assert!(props.channel_bool("enabled").await);
}

#[tokio::test]
async fn channel_listeners_fire_only_on_change() {
	let (props, _backend, hub) = store();
	let (_id, mut rx) = hub.register();
	let seen: Arc<Mutex<Vec<(PropValue, PropValue)>>> = Arc::default();
	let sink = seen.clone();
	props.add_channel_listener("youtube_id", move |old, new| sink.lock().push((old.clone(), new.clone())));

	props.set_channel_prop("youtube_id", PropValue::from("UC1")).await.unwrap();
	props.set_channel_prop("youtube_id", PropValue::from("UC1")).await.unwrap();
	props.set_channel_prop("youtube_id", PropValue::from("UC2")).await.unwrap();

	assert_eq!(
		*seen.lock(),
		vec![
			(PropValue::from(""), PropValue::from("UC1")),
			(PropValue::from("UC1"), PropValue::from("UC2")),
		]
	);

	let prop_frames: Vec<Value> = frames(&mut rx).into_iter().filter(|f| f["type"] == "channel_prop").collect();
	assert_eq!(prop_frames.len(), 3, "every write is broadcast, changed or not");
	assert_eq!(prop_frames[2]["content"], json!({"prop_name": "youtube_id", "prop_value": "UC2"}));
}

#[tokio::test]
async fn list_writes_always_count_as_changes() {
	let (props, _backend, _hub) = store();
	let calls = Arc::new(Mutex::new(0));
	let counter = calls.clone();
	props.add_channel_listener("fwd_cmds_yt_twitch", move |_, _| *counter.lock() += 1);

	let list = PropValue::List(vec!["!sr".to_string()]);
	props.set_channel_prop("fwd_cmds_yt_twitch", list.clone()).await.unwrap();
	props.set_channel_prop("fwd_cmds_yt_twitch", list).await.unwrap();
	assert_eq!(*calls.lock(), 2);
}

#[tokio::test]
async fn viewer_writes_register_and_delete_notifies() {
	let (props, _backend, hub) = store();
	let seen: Arc<Mutex<Vec<(String, PropValue, PropValue)>>> = Arc::default();
	let sink = seen.clone();
	props.add_viewer_listener("nickname", move |user, old, new| {
		sink.lock().push((user.to_string(), old.clone(), new.clone()))
	});

	props.set_viewer_prop("alice", "nickname", PropValue::from("Al")).await.unwrap();
	props
		.set_viewer_prop("alice", "custom_greetz", PropValue::from("hi @"))
		.await
		.unwrap();
	assert_eq!(props.list_viewers().await, vec!["alice"]);
	assert!(props.is_nickname_taken("Al").await);
	assert_eq!(props.all_viewers().await["alice"].len(), 2);

	let (_id, mut rx) = hub.register();
	props.delete_viewer("alice").await.unwrap();

	assert_eq!(
		seen.lock().last().cloned(),
		Some(("alice".to_string(), PropValue::from("Al"), PropValue::Null))
	);
	assert!(props.list_viewers().await.is_empty());
	assert_eq!(props.get_viewer_prop("alice", "nickname").await, PropValue::Null);
	let last = frames(&mut rx).pop().unwrap();
	assert_eq!(last, json!({"type": "delete_viewer", "content": {"username": "alice"}}));
}

#[tokio::test]
async fn first_run_resets_once() {
	let (props, _backend, _hub) = store();
	props.set_channel_prop("youtube_id", PropValue::from("UC1")).await.unwrap();
	props.set_viewer_prop("stale", "nickname", PropValue::from("x")).await.unwrap();

	assert!(props.ensure_first_run("botname", "🤖").await.unwrap());
	assert_eq!(props.channel_string("youtube_id").await, "");
	assert_eq!(props.list_viewers().await, vec!["botname"]);
	assert_eq!(props.viewer_string("botname", "nickname").await, "🤖");

	props.set_channel_prop("youtube_id", PropValue::from("UC9")).await.unwrap();
	assert!(!props.ensure_first_run("botname", "🤖").await.unwrap());
	assert_eq!(props.channel_string("youtube_id").await, "UC9");
}
