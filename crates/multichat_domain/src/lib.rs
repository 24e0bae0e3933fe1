#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat platforms feeding the unified feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSource {
	/// Primary live-streaming chat (IRC).
	Twitch,
	/// Video-sharing chat, polled.
	#[serde(rename = "youtube")]
	YouTube,
	/// Self-hosted streaming server chat socket.
	Owncast,
	/// Community chat socket.
	Kick,
}

impl ChatSource {
	pub const ALL: [ChatSource; 4] = [ChatSource::Twitch, ChatSource::YouTube, ChatSource::Owncast, ChatSource::Kick];

	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ChatSource::Twitch => "twitch",
			ChatSource::YouTube => "youtube",
			ChatSource::Owncast => "owncast",
			ChatSource::Kick => "kick",
		}
	}
}

impl fmt::Display for ChatSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing a chat source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseSourceError {
	#[error("empty value")]
	Empty,
	#[error("unknown chat source: {0}")]
	Unknown(String),
}

impl FromStr for ChatSource {
	type Err = ParseSourceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseSourceError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(ChatSource::Twitch),
			"youtube" | "yt" => Ok(ChatSource::YouTube),
			"owncast" => Ok(ChatSource::Owncast),
			"kick" => Ok(ChatSource::Kick),
			other => Err(ParseSourceError::Unknown(other.to_string())),
		}
	}
}

/// Emote key (platform emote id or image URL) to inclusive `"start-end"` byte ranges.
pub type EmoteRanges = BTreeMap<String, Vec<String>>;

/// Format an inclusive byte range the way overlay clients expect it.
pub fn format_range(start: usize, end: usize) -> String {
	format!("{start}-{end}")
}

/// Merge `extra` into `into`, skipping ranges already present for a key.
pub fn merge_emote_ranges(into: &mut EmoteRanges, extra: EmoteRanges) {
	for (key, ranges) in extra {
		let slot = into.entry(key).or_default();
		for range in ranges {
			if !slot.contains(&range) {
				slot.push(range);
			}
		}
	}
}

/// One message in the unified feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub source: ChatSource,
	pub username: String,
	pub nickname: String,
	pub pronouns: String,
	pub color: String,
	pub emotes: EmoteRanges,
	pub text: String,
}

/// Errors decoding a stored prop value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PropDecodeError {
	#[error("invalid json: {0}")]
	Json(String),
	#[error("unsupported prop shape: {0}")]
	Unsupported(&'static str),
}

/// Channel or viewer prop value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum PropValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	List(Vec<String>),
}

impl PropValue {
	/// Decode the serialized JSON form kept by the store.
	pub fn decode(raw: &str) -> Result<Self, PropDecodeError> {
		let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| PropDecodeError::Json(e.to_string()))?;
		Self::try_from(value)
	}

	/// Serialized JSON form for the store.
	pub fn encode(&self) -> String {
		serde_json::Value::from(self.clone()).to_string()
	}

	pub fn is_null(&self) -> bool {
		matches!(self, PropValue::Null)
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			PropValue::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			PropValue::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_list(&self) -> Option<&[String]> {
		match self {
			PropValue::List(l) => Some(l),
			_ => None,
		}
	}

	/// Numeric view with widening between integer and float representations.
	pub fn as_number<T: PropNumber>(&self) -> Option<T> {
		match self {
			PropValue::Int(i) => T::from_i64(*i),
			PropValue::Float(f) => T::from_f64(*f),
			_ => None,
		}
	}

	/// Change detection used before firing prop listeners.
	///
	/// Scalars compare by variant and value. Lists never compare equal: two decoded
	/// lists are distinct values, so a write of a list always counts as a change.
	pub fn shallow_eq(&self, other: &PropValue) -> bool {
		match (self, other) {
			(PropValue::List(_), _) | (_, PropValue::List(_)) => false,
			(a, b) => a == b,
		}
	}
}

impl fmt::Display for PropValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.encode())
	}
}

impl TryFrom<serde_json::Value> for PropValue {
	type Error = PropDecodeError;

	fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
		use serde_json::Value;

		match value {
			Value::Null => Ok(PropValue::Null),
			Value::Bool(b) => Ok(PropValue::Bool(b)),
			Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					Ok(PropValue::Int(i))
				} else if let Some(f) = n.as_f64() {
					Ok(PropValue::Float(f))
				} else {
					Err(PropDecodeError::Unsupported("number"))
				}
			}
			Value::String(s) => Ok(PropValue::String(s)),
			Value::Array(items) => items
				.into_iter()
				.map(|item| match item {
					Value::String(s) => Ok(s),
					_ => Err(PropDecodeError::Unsupported("non-string list item")),
				})
				.collect::<Result<Vec<_>, _>>()
				.map(PropValue::List),
			Value::Object(_) => Err(PropDecodeError::Unsupported("object")),
		}
	}
}

impl From<PropValue> for serde_json::Value {
	fn from(value: PropValue) -> Self {
		use serde_json::Value;

		match value {
			PropValue::Null => Value::Null,
			PropValue::Bool(b) => Value::Bool(b),
			PropValue::Int(i) => Value::from(i),
			PropValue::Float(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
			PropValue::String(s) => Value::String(s),
			PropValue::List(l) => Value::Array(l.into_iter().map(Value::String).collect()),
		}
	}
}

impl From<bool> for PropValue {
	fn from(v: bool) -> Self {
		PropValue::Bool(v)
	}
}

impl From<i64> for PropValue {
	fn from(v: i64) -> Self {
		PropValue::Int(v)
	}
}

impl From<f64> for PropValue {
	fn from(v: f64) -> Self {
		PropValue::Float(v)
	}
}

impl From<&str> for PropValue {
	fn from(v: &str) -> Self {
		PropValue::String(v.to_string())
	}
}

impl From<String> for PropValue {
	fn from(v: String) -> Self {
		PropValue::String(v)
	}
}

impl From<Vec<String>> for PropValue {
	fn from(v: Vec<String>) -> Self {
		PropValue::List(v)
	}
}

impl<T: Into<PropValue>> From<Option<T>> for PropValue {
	fn from(v: Option<T>) -> Self {
		v.map(Into::into).unwrap_or(PropValue::Null)
	}
}

/// Numeric targets reachable from a stored prop.
pub trait PropNumber: Sized + Copy {
	fn from_i64(v: i64) -> Option<Self>;
	fn from_f64(v: f64) -> Option<Self>;
}

impl PropNumber for f64 {
	fn from_i64(v: i64) -> Option<Self> {
		Some(v as f64)
	}

	fn from_f64(v: f64) -> Option<Self> {
		Some(v)
	}
}

macro_rules! int_prop_number {
	($($t:ty),*) => {
		$(
			impl PropNumber for $t {
				fn from_i64(v: i64) -> Option<Self> {
					<$t>::try_from(v).ok()
				}

				fn from_f64(v: f64) -> Option<Self> {
					if !v.is_finite() || v < <$t>::MIN as f64 || v > <$t>::MAX as f64 {
						return None;
					}
					Some(v.trunc() as $t)
				}
			}
		)*
	};
}

int_prop_number!(i32, i64, u32, u64, usize);
