#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use multichat_domain::{PropNumber, PropValue};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::hub::ChatHub;
use super::props_backend::PropBackend;

/// Called with `(old, new)` after a channel prop write that changed the value.
///
/// Runs on the writer's task: long work belongs in a spawned task.
pub type ChannelPropListener = Arc<dyn Fn(&PropValue, &PropValue) + Send + Sync>;

/// Called with `(username, old, new)` after a viewer prop write that changed the value.
pub type ViewerPropListener = Arc<dyn Fn(&str, &PropValue, &PropValue) + Send + Sync>;

/// Default for a channel prop; unknown names default to null.
pub fn channel_prop_default(name: &str) -> PropValue {
	match name {
		"enabled" => PropValue::Bool(true),
		"did_first_run" => PropValue::Bool(false),
		"fwd_cmds_yt_twitch" => PropValue::List(vec!["!sr".to_string(), "!test".to_string()]),
		"max_nickname_length" => PropValue::Int(20),
		"greetz_threshold" => PropValue::Int(5 * 60 * 60 * 1000),
		"greetz_wb_threshold" => PropValue::Int(45 * 60 * 1000),
		"youtube_id" | "owncast_url" | "kick_username" | "kick_chatroom_id" => PropValue::String(String::new()),
		"show_usernames" | "show_nicknames" | "show_pronouns" => PropValue::Bool(true),
		"text_shadow" => PropValue::String("1px 1px 2px black".to_string()),
		"font" => PropValue::String(
			"\"Cabin\", \"Segoe UI\", \"Helvetica Neue\", Helvetica, Arial, sans-serif".to_string(),
		),
		_ => PropValue::Null,
	}
}

/// Viewer props the store accepts; all default to null.
pub const VIEWER_PROPS: [&str; 2] = ["nickname", "custom_greetz"];

pub fn is_viewer_prop(name: &str) -> bool {
	VIEWER_PROPS.contains(&name)
}

/// Typed access to one channel's props and its viewers' props.
///
/// Reads never fail: absent, unreadable and undecodable values fall back to
/// the per-name default. Every write is announced on the hub.
pub struct PropStore {
	channel: String,
	backend: Arc<dyn PropBackend>,
	hub: Arc<ChatHub>,
	channel_listeners: RwLock<HashMap<String, Vec<ChannelPropListener>>>,
	viewer_listeners: RwLock<HashMap<String, Vec<ViewerPropListener>>>,
}

impl PropStore {
	pub fn new(channel: impl Into<String>, backend: Arc<dyn PropBackend>, hub: Arc<ChatHub>) -> Self {
		Self {
			channel: channel.into(),
			backend,
			hub,
			channel_listeners: RwLock::new(HashMap::new()),
			viewer_listeners: RwLock::new(HashMap::new()),
		}
	}

	pub fn channel(&self) -> &str {
		&self.channel
	}

	pub fn add_channel_listener(&self, name: &str, f: impl Fn(&PropValue, &PropValue) + Send + Sync + 'static) {
		self.channel_listeners
			.write()
			.entry(name.to_string())
			.or_default()
			.push(Arc::new(f));
	}

	pub fn add_viewer_listener(&self, name: &str, f: impl Fn(&str, &PropValue, &PropValue) + Send + Sync + 'static) {
		self.viewer_listeners
			.write()
			.entry(name.to_string())
			.or_default()
			.push(Arc::new(f));
	}

	fn decode_or(&self, raw: anyhow::Result<Option<String>>, default: PropValue, what: &str, name: &str) -> PropValue {
		match raw {
			Ok(Some(raw)) => match PropValue::decode(&raw) {
				Ok(v) => v,
				Err(e) => {
					warn!(prop = name, %what, error = %e, "stored prop did not decode; using default");
					default
				}
			},
			Ok(None) => default,
			Err(e) => {
				warn!(prop = name, %what, error = %e, "prop read failed; using default");
				default
			}
		}
	}

	pub async fn get_channel_prop(&self, name: &str) -> PropValue {
		let raw = self.backend.get_channel_raw(&self.channel, name).await;
		self.decode_or(raw, channel_prop_default(name), "channel", name)
	}

	pub async fn set_channel_prop(&self, name: &str, value: PropValue) -> anyhow::Result<()> {
		let listeners = self.channel_listeners.read().get(name).cloned().unwrap_or_default();
		let old = if listeners.is_empty() {
			None
		} else {
			Some(self.get_channel_prop(name).await)
		};

		if value.is_null() {
			self.backend.delete_channel_raw(&self.channel, name).await?;
		} else {
			self.backend.set_channel_raw(&self.channel, name, &value.encode()).await?;
		}
		debug!(prop = name, value = %value, "channel prop set");

		self.hub.broadcast(
			"channel_prop",
			json!({ "prop_name": name, "prop_value": Value::from(value.clone()) }),
		);

		if let Some(old) = old
			&& !old.shallow_eq(&value)
		{
			for listener in &listeners {
				listener(&old, &value);
			}
		}
		Ok(())
	}

	pub async fn channel_bool(&self, name: &str) -> bool {
		let value = self.get_channel_prop(name).await;
		value
			.as_bool()
			.or_else(|| channel_prop_default(name).as_bool())
			.unwrap_or(false)
	}

	/// Numeric channel prop, widened from whichever representation was stored; zero otherwise.
	pub async fn channel_number<T: PropNumber + Default>(&self, name: &str) -> T {
		self.get_channel_prop(name).await.as_number::<T>().unwrap_or_default()
	}

	pub async fn channel_int(&self, name: &str) -> i64 {
		self.channel_number::<i64>(name).await
	}

	pub async fn channel_string(&self, name: &str) -> String {
		match self.get_channel_prop(name).await {
			PropValue::String(s) => s,
			_ => String::new(),
		}
	}

	pub async fn channel_list(&self, name: &str) -> Vec<String> {
		match self.get_channel_prop(name).await {
			PropValue::List(l) => l,
			_ => Vec::new(),
		}
	}

	pub async fn get_viewer_prop(&self, username: &str, name: &str) -> PropValue {
		let raw = self.backend.get_viewer_raw(&self.channel, username, name).await;
		self.decode_or(raw, PropValue::Null, "viewer", name)
	}

	/// String viewer prop, empty when unset.
	pub async fn viewer_string(&self, username: &str, name: &str) -> String {
		match self.get_viewer_prop(username, name).await {
			PropValue::String(s) => s,
			_ => String::new(),
		}
	}

	pub async fn set_viewer_prop(&self, username: &str, name: &str, value: PropValue) -> anyhow::Result<()> {
		let listeners = self.viewer_listeners.read().get(name).cloned().unwrap_or_default();
		let old = if listeners.is_empty() {
			None
		} else {
			Some(self.get_viewer_prop(username, name).await)
		};

		if value.is_null() {
			self.backend.delete_viewer_raw(&self.channel, username, name).await?;
		} else {
			self.backend
				.set_viewer_raw(&self.channel, username, name, &value.encode())
				.await?;
			self.backend.add_viewer(&self.channel, username).await?;
		}
		debug!(%username, prop = name, value = %value, "viewer prop set");

		self.hub.broadcast(
			"viewer_prop",
			json!({ "username": username, "prop_name": name, "prop_value": Value::from(value.clone()) }),
		);

		if let Some(old) = old
			&& !old.shallow_eq(&value)
		{
			for listener in &listeners {
				listener(username, &old, &value);
			}
		}
		Ok(())
	}

	/// Remove a viewer entirely; listeners see every existing prop go to null.
	pub async fn delete_viewer(&self, username: &str) -> anyhow::Result<()> {
		let props = self.backend.viewer_props(&self.channel, username).await?;
		{
			let listeners = self.viewer_listeners.read().clone();
			for (name, raw) in &props {
				let Some(fns) = listeners.get(name) else {
					continue;
				};
				let old = self.decode_or(Ok(Some(raw.clone())), PropValue::Null, "viewer", name);
				for listener in fns {
					listener(username, &old, &PropValue::Null);
				}
			}
		}

		self.backend.delete_viewer_record(&self.channel, username).await?;
		self.backend.remove_viewer(&self.channel, username).await?;
		info!(%username, props = props.len(), "viewer deleted");

		self.hub.broadcast("delete_viewer", json!({ "username": username }));
		Ok(())
	}

	pub async fn list_viewers(&self) -> Vec<String> {
		match self.backend.list_viewers(&self.channel).await {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "listing viewers failed");
				Vec::new()
			}
		}
	}

	pub async fn get_all_viewer_props(&self, username: &str) -> anyhow::Result<BTreeMap<String, PropValue>> {
		let props = self.backend.viewer_props(&self.channel, username).await?;
		Ok(props
			.into_iter()
			.map(|(name, raw)| {
				let value = self.decode_or(Ok(Some(raw)), PropValue::Null, "viewer", &name);
				(name, value)
			})
			.collect())
	}

	/// Viewer name to props, for the bot page.
	pub async fn all_viewers(&self) -> BTreeMap<String, BTreeMap<String, PropValue>> {
		let mut out = BTreeMap::new();
		for viewer in self.list_viewers().await {
			match self.get_all_viewer_props(&viewer).await {
				Ok(props) => {
					out.insert(viewer, props);
				}
				Err(e) => warn!(%viewer, error = %e, "reading viewer props failed"),
			}
		}
		out
	}

	/// Whether another viewer already uses `nickname`.
	pub async fn is_nickname_taken(&self, nickname: &str) -> bool {
		for viewer in self.list_viewers().await {
			if self.get_viewer_prop(&viewer, "nickname").await.as_str() == Some(nickname) {
				return true;
			}
		}
		false
	}

	/// One-time reset of a fresh channel: wipe props, seed the bot nickname.
	pub async fn ensure_first_run(&self, bot_username: &str, bot_nickname: &str) -> anyhow::Result<bool> {
		if self.channel_bool("did_first_run").await {
			return Ok(false);
		}

		info!(channel = %self.channel, "first run: resetting channel props");
		self.backend.clear_channel(&self.channel).await?;
		if !bot_username.is_empty() {
			self.set_viewer_prop(bot_username, "nickname", PropValue::from(bot_nickname))
				.await?;
		}
		self.set_channel_prop("did_first_run", PropValue::Bool(true)).await?;
		Ok(true)
	}
}
