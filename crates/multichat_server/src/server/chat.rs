#![forbid(unsafe_code)]

use std::sync::Arc;

use multichat_domain::{ChatMessage, ChatSource, EmoteRanges, merge_emote_ranges};
use tracing::debug;

use super::emotes::EmoteCache;
use super::hub::ChatHub;
use super::pronouns::PronounCache;
use super::props::PropStore;

/// Turns normalized chat lines into feed messages.
pub struct ChatService {
	hub: Arc<ChatHub>,
	emotes: Arc<EmoteCache>,
	pronouns: Arc<PronounCache>,
}

impl ChatService {
	pub fn new(hub: Arc<ChatHub>, emotes: Arc<EmoteCache>, pronouns: Arc<PronounCache>) -> Self {
		Self { hub, emotes, pronouns }
	}

	/// Enrich one line with pronouns and third-party emotes, then append and broadcast it.
	pub fn send_chat(
		&self,
		source: ChatSource,
		username: &str,
		nickname: &str,
		color: &str,
		text: &str,
		platform_emotes: EmoteRanges,
	) -> ChatMessage {
		let emotes = self.emotes.clone();
		tokio::spawn(async move {
			emotes.update_if_needed().await;
		});

		let pronouns = self.pronouns.lookup(username);

		let mut ranges = platform_emotes;
		merge_emote_ranges(&mut ranges, self.emotes.find_annotations(text));

		let msg = ChatMessage {
			source,
			username: username.to_string(),
			nickname: nickname.to_string(),
			pronouns,
			color: color.to_string(),
			emotes: ranges,
			text: text.to_string(),
		};
		debug!(source = %source, %username, "chat");
		metrics::counter!("multichat_chats_total", "source" => source.as_str()).increment(1);
		self.hub.publish_chat(msg.clone());
		msg
	}

	pub fn clear_chat(&self) {
		self.hub.clear();
	}
}

/// Keep nicknames in history in step with the `nickname` viewer prop.
pub fn sync_nicknames_into_history(props: &PropStore, hub: Arc<ChatHub>) {
	props.add_viewer_listener("nickname", move |username, _old, new| {
		let patched = hub.patch_nickname(username, new.as_str().unwrap_or(""));
		debug!(%username, patched, "nickname patched into history");
	});
}
