#![forbid(unsafe_code)]

use anyhow::Context;
use multichat_domain::{EmoteRanges, format_range};
use serde_json::{Value, json};

const YOUTUBE_BASE_URL: &str = "https://www.youtube.com";
const BROWSER_USER_AGENT: &str =
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const FALLBACK_CLIENT_VERSION: &str = "2.20230622.06.00";

/// State scraped from a channel's `/live` page, enough to poll its chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveChatSession {
	pub api_key: String,
	pub client_version: String,
	pub continuation: String,
	pub video_id: String,
}

/// One text message from the chat feed.
#[derive(Debug, Clone, PartialEq)]
pub struct YouTubeChatItem {
	pub author: String,
	pub text: String,
	pub timestamp_usec: i64,

	/// Custom (image) emoji runs, keyed by image URL.
	pub emotes: EmoteRanges,
}

/// One poll result. `next_continuation == None` means the stream is over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatPage {
	pub items: Vec<YouTubeChatItem>,
	pub next_continuation: Option<String>,
}

/// Value of the first `"key":"..."` in `haystack`, if non-empty.
fn quoted_value<'a>(haystack: &'a str, key: &str) -> Option<&'a str> {
	let needle = format!("\"{key}\":\"");
	let start = haystack.find(&needle)? + needle.len();
	let len = haystack[start..].find('"')?;
	let value = &haystack[start..start + len];
	(!value.is_empty()).then_some(value)
}

fn video_id_from_url(url: &str) -> Option<&str> {
	let pos = url.find("v=")?;
	let id = url[pos + 2..].split('&').next()?;
	(!id.is_empty()).then_some(id)
}

/// Extract the innertube key, client version, first chat continuation and video id.
pub fn parse_live_page(html: &str, final_url: &str) -> anyhow::Result<LiveChatSession> {
	let api_key = quoted_value(html, "INNERTUBE_API_KEY").context("live page has no INNERTUBE_API_KEY")?;

	let client_version = quoted_value(html, "INNERTUBE_CONTEXT_CLIENT_VERSION")
		.or_else(|| quoted_value(html, "clientVersion"))
		.unwrap_or(FALLBACK_CLIENT_VERSION);

	let chat_at = html.find("liveChatRenderer").context("channel is not live (no liveChatRenderer)")?;
	let continuation = quoted_value(&html[chat_at..], "continuation").context("live chat has no continuation")?;

	let video_id = video_id_from_url(final_url)
		.or_else(|| quoted_value(html, "videoId"))
		.context("live page has no video id")?;

	Ok(LiveChatSession {
		api_key: api_key.to_string(),
		client_version: client_version.to_string(),
		continuation: continuation.to_string(),
		video_id: video_id.to_string(),
	})
}

fn parse_item(item: &Value) -> Option<YouTubeChatItem> {
	let author = item.pointer("/authorName/simpleText").and_then(Value::as_str)?.to_string();
	let timestamp_usec = item
		.get("timestampUsec")
		.and_then(Value::as_str)
		.and_then(|s| s.parse::<i64>().ok())
		.unwrap_or(0);

	let mut text = String::new();
	let mut emotes = EmoteRanges::new();

	for run in item.pointer("/message/runs").and_then(Value::as_array).into_iter().flatten() {
		if let Some(t) = run.get("text").and_then(Value::as_str) {
			text.push_str(t);
			continue;
		}
		let Some(emoji) = run.get("emoji") else {
			continue;
		};

		let shortcut = emoji
			.pointer("/shortcuts/0")
			.and_then(Value::as_str)
			.or_else(|| emoji.get("emojiId").and_then(Value::as_str))
			.unwrap_or_default();
		if shortcut.is_empty() {
			continue;
		}

		let start = text.len();
		text.push_str(shortcut);

		let is_custom = emoji.get("isCustomEmoji").and_then(Value::as_bool).unwrap_or(false);
		if is_custom && let Some(url) = emoji.pointer("/image/thumbnails/0/url").and_then(Value::as_str) {
			emotes
				.entry(url.to_string())
				.or_insert_with(Vec::new)
				.push(format_range(start, start + shortcut.len() - 1));
		}
	}

	Some(YouTubeChatItem {
		author,
		text,
		timestamp_usec,
		emotes,
	})
}

/// Map a `get_live_chat` response to chat items and the next continuation.
pub fn parse_chat_page(body: &Value) -> ChatPage {
	let root = body.pointer("/continuationContents/liveChatContinuation");

	let items = root
		.and_then(|r| r.get("actions"))
		.and_then(Value::as_array)
		.into_iter()
		.flatten()
		.filter_map(|action| action.pointer("/addChatItemAction/item/liveChatTextMessageRenderer"))
		.filter_map(parse_item)
		.collect();

	let next_continuation = root
		.and_then(|r| r.pointer("/continuations/0"))
		.and_then(|c| {
			c.pointer("/invalidationContinuationData/continuation")
				.or_else(|| c.pointer("/timedContinuationData/continuation"))
				.or_else(|| c.pointer("/reloadContinuationData/continuation"))
		})
		.and_then(Value::as_str)
		.map(str::to_string);

	ChatPage {
		items,
		next_continuation,
	}
}

/// Scraping client for YouTube live chat (innertube web API).
#[derive(Debug, Clone)]
pub struct YouTubeClient {
	http: reqwest::Client,
	base_url: String,
}

impl YouTubeClient {
	pub fn new() -> anyhow::Result<Self> {
		Self::with_base_url(YOUTUBE_BASE_URL)
	}

	pub fn with_base_url(base_url: impl Into<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(BROWSER_USER_AGENT)
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			http,
			base_url: base_url.into(),
		})
	}

	pub async fn open_session(&self, channel_id: &str) -> anyhow::Result<LiveChatSession> {
		let url = format!("{}/channel/{channel_id}/live", self.base_url);
		let resp = self
			.http
			.get(&url)
			.send()
			.await
			.context("youtube live page request")?
			.error_for_status()
			.context("youtube live page status")?;
		let final_url = resp.url().to_string();
		let html = resp.text().await.context("youtube live page read body")?;
		parse_live_page(&html, &final_url)
	}

	pub async fn fetch_chat(&self, session: &LiveChatSession) -> anyhow::Result<ChatPage> {
		let url = format!(
			"{}/youtubei/v1/live_chat/get_live_chat?key={}",
			self.base_url,
			urlencoding::encode(&session.api_key)
		);
		let body = json!({
			"context": {
				"client": {
					"clientName": "WEB",
					"clientVersion": session.client_version,
				}
			},
			"continuation": session.continuation,
		});

		let resp = self
			.http
			.post(&url)
			.json(&body)
			.send()
			.await
			.context("youtube get_live_chat request")?
			.error_for_status()
			.context("youtube get_live_chat status")?;
		let value: Value = resp.json().await.context("youtube get_live_chat json")?;
		Ok(parse_chat_page(&value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PAGE: &str = r#"<html><script>ytcfg.set({"INNERTUBE_API_KEY":"AIzaKEY","INNERTUBE_CONTEXT_CLIENT_VERSION":"2.20240101.00.00"});
	var ytInitialData = {"contents":{"x":{"continuation":"not-this-one"},"liveChatRenderer":{"continuations":[{"reloadContinuationData":{"continuation":"CONT1"}}]}},"videoId":"abc123XYZ_0"};</script></html>"#;

	#[test]
	fn live_page_yields_session() {
		let s = parse_live_page(PAGE, "https://www.youtube.com/channel/UC1/live").unwrap();
		assert_eq!(s.api_key, "AIzaKEY");
		assert_eq!(s.client_version, "2.20240101.00.00");
		assert_eq!(s.continuation, "CONT1");
		assert_eq!(s.video_id, "abc123XYZ_0");
	}

	#[test]
	fn video_id_prefers_redirect_url() {
		let s = parse_live_page(PAGE, "https://www.youtube.com/watch?v=fromUrl&feature=x").unwrap();
		assert_eq!(s.video_id, "fromUrl");
	}

	#[test]
	fn offline_channel_is_an_error() {
		let html = r#"{"INNERTUBE_API_KEY":"k","videoId":"v"}"#;
		let err = parse_live_page(html, "https://www.youtube.com/channel/UC1").unwrap_err();
		assert!(err.to_string().contains("not live"));
	}

	#[test]
	fn chat_page_maps_text_and_emoji_runs() {
		let body: Value = serde_json::from_str(
			r#"{"continuationContents":{"liveChatContinuation":{
				"continuations":[{"timedContinuationData":{"continuation":"NEXT","timeoutMs":5000}}],
				"actions":[
					{"addChatItemAction":{"item":{"liveChatTextMessageRenderer":{
						"authorName":{"simpleText":"Viewer"},
						"timestampUsec":"1700000000000000",
						"message":{"runs":[
							{"text":"hi "},
							{"emoji":{"emojiId":"UCx/abc","shortcuts":[":wave-cat:"],"isCustomEmoji":true,
								"image":{"thumbnails":[{"url":"https://yt3.ggpht.com/wave"}]}}},
							{"emoji":{"emojiId":"😀","shortcuts":[":grinning:"],"image":{"thumbnails":[{"url":"https://x/1f600"}]}}}
						]}}}}},
					{"addChatItemAction":{"item":{"liveChatPaidMessageRenderer":{}}}},
					{"markChatItemAsDeletedAction":{}}
				]}}}"#,
		)
		.unwrap();

		let page = parse_chat_page(&body);
		assert_eq!(page.next_continuation.as_deref(), Some("NEXT"));
		assert_eq!(page.items.len(), 1);

		let item = &page.items[0];
		assert_eq!(item.author, "Viewer");
		assert_eq!(item.text, "hi :wave-cat::grinning:");
		assert_eq!(item.timestamp_usec, 1_700_000_000_000_000);
		assert_eq!(item.emotes["https://yt3.ggpht.com/wave"], vec!["3-12"]);
		assert_eq!(item.emotes.len(), 1);
	}

	#[test]
	fn missing_continuation_means_stream_over() {
		let body: Value = serde_json::from_str(r#"{"continuationContents":{"liveChatContinuation":{"actions":[]}}}"#).unwrap();
		let page = parse_chat_page(&body);
		assert!(page.items.is_empty());
		assert!(page.next_continuation.is_none());
	}
}
