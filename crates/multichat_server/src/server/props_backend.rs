#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

pub fn channel_prop_key(channel: &str, prop: &str) -> String {
	format!("channels/{channel}/channel_props/{prop}")
}

pub fn viewer_key(channel: &str, username: &str) -> String {
	format!("channels/{channel}/viewers/{username}")
}

pub fn viewers_key(channel: &str) -> String {
	format!("channels/{channel}/viewers")
}

fn channel_prefix(channel: &str) -> String {
	format!("channels/{channel}/")
}

/// Key-value storage behind the prop store. Values are JSON strings.
#[async_trait]
pub trait PropBackend: Send + Sync + 'static {
	async fn get_channel_raw(&self, channel: &str, prop: &str) -> anyhow::Result<Option<String>>;
	async fn set_channel_raw(&self, channel: &str, prop: &str, raw: &str) -> anyhow::Result<()>;
	async fn delete_channel_raw(&self, channel: &str, prop: &str) -> anyhow::Result<()>;

	async fn get_viewer_raw(&self, channel: &str, username: &str, prop: &str) -> anyhow::Result<Option<String>>;
	async fn set_viewer_raw(&self, channel: &str, username: &str, prop: &str, raw: &str) -> anyhow::Result<()>;
	async fn delete_viewer_raw(&self, channel: &str, username: &str, prop: &str) -> anyhow::Result<()>;

	/// Every stored prop of one viewer, sorted by name.
	async fn viewer_props(&self, channel: &str, username: &str) -> anyhow::Result<Vec<(String, String)>>;

	async fn add_viewer(&self, channel: &str, username: &str) -> anyhow::Result<()>;
	async fn remove_viewer(&self, channel: &str, username: &str) -> anyhow::Result<()>;
	async fn list_viewers(&self, channel: &str) -> anyhow::Result<Vec<String>>;

	/// Drop the viewer's whole prop record (not the set membership).
	async fn delete_viewer_record(&self, channel: &str, username: &str) -> anyhow::Result<()>;

	/// Drop every key under the channel.
	async fn clear_channel(&self, channel: &str) -> anyhow::Result<()>;
}

/// Select a backend from `database_url`; `None` keeps everything in memory.
pub async fn connect_prop_backend(database_url: Option<&str>) -> anyhow::Result<Arc<dyn PropBackend>> {
	match database_url {
		None => {
			info!("prop store: in-memory backend");
			Ok(Arc::new(InMemoryPropBackend::default()))
		}
		Some(url) if url.starts_with("sqlite:") => {
			let backend = SqlitePropBackend::connect(url).await?;
			info!("prop store: sqlite backend");
			Ok(Arc::new(backend))
		}
		Some(_) => Err(anyhow!("unsupported database_url for prop store (expected sqlite:)")),
	}
}

#[derive(Default)]
struct MemoryInner {
	values: HashMap<String, String>,
	hashes: HashMap<String, BTreeMap<String, String>>,
	sets: HashMap<String, BTreeSet<String>>,
}

/// Process-local backend; the default and the one tests use.
#[derive(Default)]
pub struct InMemoryPropBackend {
	inner: Mutex<MemoryInner>,
}

#[async_trait]
impl PropBackend for InMemoryPropBackend {
	async fn get_channel_raw(&self, channel: &str, prop: &str) -> anyhow::Result<Option<String>> {
		Ok(self.inner.lock().values.get(&channel_prop_key(channel, prop)).cloned())
	}

	async fn set_channel_raw(&self, channel: &str, prop: &str, raw: &str) -> anyhow::Result<()> {
		self.inner
			.lock()
			.values
			.insert(channel_prop_key(channel, prop), raw.to_string());
		Ok(())
	}

	async fn delete_channel_raw(&self, channel: &str, prop: &str) -> anyhow::Result<()> {
		self.inner.lock().values.remove(&channel_prop_key(channel, prop));
		Ok(())
	}

	async fn get_viewer_raw(&self, channel: &str, username: &str, prop: &str) -> anyhow::Result<Option<String>> {
		Ok(self
			.inner
			.lock()
			.hashes
			.get(&viewer_key(channel, username))
			.and_then(|h| h.get(prop))
			.cloned())
	}

	async fn set_viewer_raw(&self, channel: &str, username: &str, prop: &str, raw: &str) -> anyhow::Result<()> {
		self.inner
			.lock()
			.hashes
			.entry(viewer_key(channel, username))
			.or_default()
			.insert(prop.to_string(), raw.to_string());
		Ok(())
	}

	async fn delete_viewer_raw(&self, channel: &str, username: &str, prop: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		let key = viewer_key(channel, username);
		if let Some(hash) = inner.hashes.get_mut(&key) {
			hash.remove(prop);
			if hash.is_empty() {
				inner.hashes.remove(&key);
			}
		}
		Ok(())
	}

	async fn viewer_props(&self, channel: &str, username: &str) -> anyhow::Result<Vec<(String, String)>> {
		Ok(self
			.inner
			.lock()
			.hashes
			.get(&viewer_key(channel, username))
			.map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
			.unwrap_or_default())
	}

	async fn add_viewer(&self, channel: &str, username: &str) -> anyhow::Result<()> {
		self.inner
			.lock()
			.sets
			.entry(viewers_key(channel))
			.or_default()
			.insert(username.to_string());
		Ok(())
	}

	async fn remove_viewer(&self, channel: &str, username: &str) -> anyhow::Result<()> {
		if let Some(set) = self.inner.lock().sets.get_mut(&viewers_key(channel)) {
			set.remove(username);
		}
		Ok(())
	}

	async fn list_viewers(&self, channel: &str) -> anyhow::Result<Vec<String>> {
		Ok(self
			.inner
			.lock()
			.sets
			.get(&viewers_key(channel))
			.map(|s| s.iter().cloned().collect())
			.unwrap_or_default())
	}

	async fn delete_viewer_record(&self, channel: &str, username: &str) -> anyhow::Result<()> {
		self.inner.lock().hashes.remove(&viewer_key(channel, username));
		Ok(())
	}

	async fn clear_channel(&self, channel: &str) -> anyhow::Result<()> {
		let prefix = channel_prefix(channel);
		let mut inner = self.inner.lock();
		inner.values.retain(|k, _| !k.starts_with(&prefix));
		inner.hashes.retain(|k, _| !k.starts_with(&prefix));
		inner.sets.retain(|k, _| !k.starts_with(&prefix));
		Ok(())
	}
}

/// SQLite-backed store with the same key layout.
#[derive(Clone)]
pub struct SqlitePropBackend {
	pool: sqlx::SqlitePool,
}

impl SqlitePropBackend {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;
		Ok(Self { pool })
	}

	async fn get_value(&self, key: &str) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT value FROM prop_values WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await
			.context("select prop value")?;
		Ok(row.map(|(v,)| v))
	}

	async fn delete_prefixed(&self, table: &str, prefix: &str) -> anyhow::Result<()> {
		let sql = format!("DELETE FROM {table} WHERE substr(key, 1, ?) = ?");
		sqlx::query(&sql)
			.bind(prefix.chars().count() as i64)
			.bind(prefix)
			.execute(&self.pool)
			.await
			.with_context(|| format!("clear {table}"))?;
		Ok(())
	}
}

#[async_trait]
impl PropBackend for SqlitePropBackend {
	async fn get_channel_raw(&self, channel: &str, prop: &str) -> anyhow::Result<Option<String>> {
		self.get_value(&channel_prop_key(channel, prop)).await
	}

	async fn set_channel_raw(&self, channel: &str, prop: &str, raw: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO prop_values (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
			.bind(channel_prop_key(channel, prop))
			.bind(raw)
			.execute(&self.pool)
			.await
			.context("upsert channel prop")?;
		Ok(())
	}

	async fn delete_channel_raw(&self, channel: &str, prop: &str) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM prop_values WHERE key = ?")
			.bind(channel_prop_key(channel, prop))
			.execute(&self.pool)
			.await
			.context("delete channel prop")?;
		Ok(())
	}

	async fn get_viewer_raw(&self, channel: &str, username: &str, prop: &str) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT value FROM prop_hash_fields WHERE key = ? AND field = ?")
			.bind(viewer_key(channel, username))
			.bind(prop)
			.fetch_optional(&self.pool)
			.await
			.context("select viewer prop")?;
		Ok(row.map(|(v,)| v))
	}

	async fn set_viewer_raw(&self, channel: &str, username: &str, prop: &str, raw: &str) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO prop_hash_fields (key, field, value) VALUES (?, ?, ?) \
			 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
		)
		.bind(viewer_key(channel, username))
		.bind(prop)
		.bind(raw)
		.execute(&self.pool)
		.await
		.context("upsert viewer prop")?;
		Ok(())
	}

	async fn delete_viewer_raw(&self, channel: &str, username: &str, prop: &str) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM prop_hash_fields WHERE key = ? AND field = ?")
			.bind(viewer_key(channel, username))
			.bind(prop)
			.execute(&self.pool)
			.await
			.context("delete viewer prop")?;
		Ok(())
	}

	async fn viewer_props(&self, channel: &str, username: &str) -> anyhow::Result<Vec<(String, String)>> {
		sqlx::query_as::<_, (String, String)>("SELECT field, value FROM prop_hash_fields WHERE key = ? ORDER BY field")
			.bind(viewer_key(channel, username))
			.fetch_all(&self.pool)
			.await
			.context("select viewer props")
	}

	async fn add_viewer(&self, channel: &str, username: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT OR IGNORE INTO prop_set_members (key, member) VALUES (?, ?)")
			.bind(viewers_key(channel))
			.bind(username)
			.execute(&self.pool)
			.await
			.context("add viewer")?;
		Ok(())
	}

	async fn remove_viewer(&self, channel: &str, username: &str) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM prop_set_members WHERE key = ? AND member = ?")
			.bind(viewers_key(channel))
			.bind(username)
			.execute(&self.pool)
			.await
			.context("remove viewer")?;
		Ok(())
	}

	async fn list_viewers(&self, channel: &str) -> anyhow::Result<Vec<String>> {
		let rows: Vec<(String,)> = sqlx::query_as("SELECT member FROM prop_set_members WHERE key = ? ORDER BY member")
			.bind(viewers_key(channel))
			.fetch_all(&self.pool)
			.await
			.context("list viewers")?;
		Ok(rows.into_iter().map(|(m,)| m).collect())
	}

	async fn delete_viewer_record(&self, channel: &str, username: &str) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM prop_hash_fields WHERE key = ?")
			.bind(viewer_key(channel, username))
			.execute(&self.pool)
			.await
			.context("delete viewer record")?;
		Ok(())
	}

	async fn clear_channel(&self, channel: &str) -> anyhow::Result<()> {
		let prefix = channel_prefix(channel);
		self.delete_prefixed("prop_values", &prefix).await?;
		self.delete_prefixed("prop_hash_fields", &prefix).await?;
		self.delete_prefixed("prop_set_members", &prefix).await
	}
}
