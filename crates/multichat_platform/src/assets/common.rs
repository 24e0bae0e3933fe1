#![forbid(unsafe_code)]

use anyhow::Context;
use serde::de::DeserializeOwned;

/// Twitch emote image (`dark` theme, scale 3).
pub fn twitch_cdn(id: &str) -> String {
	format!("https://static-cdn.jtvnw.net/emoticons/v2/{id}/default/dark/3.0")
}

pub fn bttv_cdn(id: &str) -> String {
	format!("https://cdn.betterttv.net/emote/{id}/3x.webp")
}

pub fn seventv_cdn(id: &str) -> String {
	format!("https://cdn.7tv.app/emote/{id}/3x.webp")
}

pub fn ffz_cdn(id: u64, animated: bool) -> String {
	if animated {
		format!("https://cdn.frankerfacez.com/emote/{id}/animated/2.webp")
	} else {
		format!("https://cdn.frankerfacez.com/emote/{id}/2")
	}
}

pub(crate) fn http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.user_agent("multichat/0.x (emotes)")
		.build()
		.unwrap_or_else(|_| reqwest::Client::new())
}

/// GET a JSON document, failing on non-2xx statuses.
pub(crate) async fn get_json<T: DeserializeOwned>(
	http: &reqwest::Client,
	url: &str,
	label: &'static str,
) -> anyhow::Result<T> {
	let resp = http
		.get(url)
		.send()
		.await
		.with_context(|| format!("{label} request"))?
		.error_for_status()
		.with_context(|| format!("{label} status"))?;
	resp.json().await.with_context(|| format!("{label} json"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cdn_urls() {
		assert_eq!(twitch_cdn("25"), "https://static-cdn.jtvnw.net/emoticons/v2/25/default/dark/3.0");
		assert_eq!(bttv_cdn("abc"), "https://cdn.betterttv.net/emote/abc/3x.webp");
		assert_eq!(seventv_cdn("x1"), "https://cdn.7tv.app/emote/x1/3x.webp");
		assert_eq!(ffz_cdn(9, false), "https://cdn.frankerfacez.com/emote/9/2");
		assert_eq!(ffz_cdn(9, true), "https://cdn.frankerfacez.com/emote/9/animated/2.webp");
	}
}
