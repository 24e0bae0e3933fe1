#![forbid(unsafe_code)]

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}

pub mod host {
	/// Normalize a self-hosted server address to a bare `host[:port][/path]`.
	///
	/// Accepts values pasted with a scheme or trailing slash.
	pub fn normalize_host(s: &str) -> Result<String, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("host must be non-empty".to_string());
		}

		let rest = s
			.strip_prefix("https://")
			.or_else(|| s.strip_prefix("http://"))
			.or_else(|| s.strip_prefix("wss://"))
			.or_else(|| s.strip_prefix("ws://"))
			.unwrap_or(s);
		let rest = rest.trim_end_matches('/');

		if rest.is_empty() {
			return Err(format!("invalid host: {s}"));
		}
		if rest.contains(char::is_whitespace) || rest.contains('?') || rest.contains('#') {
			return Err(format!("invalid host (no whitespace, query or fragment allowed): {s}"));
		}

		Ok(rest.to_string())
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn strips_scheme_and_trailing_slash() {
			assert_eq!(normalize_host("https://watch.example.com/").unwrap(), "watch.example.com");
			assert_eq!(normalize_host("watch.example.com:8080").unwrap(), "watch.example.com:8080");
			assert_eq!(normalize_host("  http://oc.example.org  ").unwrap(), "oc.example.org");
		}

		#[test]
		fn rejects_empty_and_query() {
			assert!(normalize_host("").is_err());
			assert!(normalize_host("https://").is_err());
			assert!(normalize_host("oc.example.org?x=1").is_err());
		}
	}
}

pub mod profanity {
	use rustrict::CensorStr;

	/// Whether `text` reads as profane, sexual, offensive or mean.
	pub fn is_profane(text: &str) -> bool {
		text.is_inappropriate()
	}

	/// Star out inappropriate words, leaving the rest of `text` alone.
	pub fn censor(text: &str) -> String {
		text.censor()
	}

}
