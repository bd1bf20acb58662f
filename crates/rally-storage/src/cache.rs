//! Resolver caches: good and bad outcomes keyed by a normalized string,
//! persisted incrementally through an injected backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry for {key} could not be serialized: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Outcome of a resolution. `Bad` is remembered so the same key never
/// triggers another network call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum CacheEntry<V> {
    Good(V),
    Bad,
}

impl<V> CacheEntry<V> {
    pub fn is_good(&self) -> bool {
        matches!(self, CacheEntry::Good(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheLine<V> {
    key: String,
    cached_at: DateTime<Utc>,
    entry: CacheEntry<V>,
}

/// Line-oriented storage behind a [`ResolverCache`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load_lines(&self) -> Result<Vec<String>, CacheError>;
    async fn append_line(&mut self, line: &str) -> Result<(), CacheError>;
    async fn replace_all(&mut self, lines: &[String]) -> Result<(), CacheError>;
}

/// Append-only JSON-lines file. Compaction rewrites it through a temp file
/// and an atomic rename.
#[derive(Debug, Clone)]
pub struct JsonLinesBackend {
    path: PathBuf,
}

impl JsonLinesBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err(parent))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for JsonLinesBackend {
    async fn load_lines(&self) -> Result<Vec<String>, CacheError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(ToString::to_string)
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(io_err(&self.path)(err)),
        }
    }

    async fn append_line(&mut self, line: &str) -> Result<(), CacheError> {
        self.ensure_parent().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err(&self.path))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(io_err(&self.path))?;
        file.flush().await.map_err(io_err(&self.path))
    }

    async fn replace_all(&mut self, lines: &[String]) -> Result<(), CacheError> {
        self.ensure_parent().await?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.cache.tmp", Uuid::new_v4()));

        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&self.path)(err));
        }
        Ok(())
    }
}

/// In-memory backend; clones share the same lines.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn load_lines(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.lines())
    }

    async fn append_line(&mut self, line: &str) -> Result<(), CacheError> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.to_string());
        Ok(())
    }

    async fn replace_all(&mut self, lines: &[String]) -> Result<(), CacheError> {
        *self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = lines.to_vec();
        Ok(())
    }
}

pub struct ResolverCache<V> {
    name: String,
    entries: HashMap<String, CacheEntry<V>>,
    backend: Box<dyn CacheBackend>,
}

impl<V> std::fmt::Debug for ResolverCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverCache")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<V> ResolverCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send,
{
    /// Replay every persisted line; later lines win. Unreadable lines (a
    /// crash mid-append leaves a truncated tail) are skipped.
    pub async fn open(
        name: impl Into<String>,
        backend: Box<dyn CacheBackend>,
    ) -> Result<Self, CacheError> {
        let name = name.into();
        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        for line in backend.load_lines().await? {
            match serde_json::from_str::<CacheLine<V>>(&line) {
                Ok(parsed) => {
                    entries.insert(parsed.key, parsed.entry);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(cache = %name, skipped, "skipped unreadable cache lines");
        }
        Ok(Self {
            name,
            entries,
            backend,
        })
    }

    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
            backend: Box::new(MemoryBackend::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    pub async fn put_good(&mut self, key: &str, value: V) -> Result<(), CacheError> {
        self.put(key, CacheEntry::Good(value)).await
    }

    pub async fn put_bad(&mut self, key: &str) -> Result<(), CacheError> {
        self.put(key, CacheEntry::Bad).await
    }

    async fn put(&mut self, key: &str, entry: CacheEntry<V>) -> Result<(), CacheError> {
        let line = encode_line(key, &entry)?;
        self.backend.append_line(&line).await?;
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn good_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_good()).count()
    }

    pub fn bad_count(&self) -> usize {
        self.len() - self.good_count()
    }

    /// Rewrite the backend with exactly one line per key, sorted by key.
    pub async fn compact(&mut self) -> Result<usize, CacheError> {
        let mut keys = self.entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        let mut lines = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(entry) = self.entries.get(key) {
                lines.push(encode_line(key, entry)?);
            }
        }
        self.backend.replace_all(&lines).await?;
        Ok(lines.len())
    }
}

fn encode_line<V: Serialize + Clone>(
    key: &str,
    entry: &CacheEntry<V>,
) -> Result<String, CacheError> {
    let line = CacheLine {
        key: key.to_string(),
        cached_at: Utc::now(),
        entry: entry.clone(),
    };
    serde_json::to_string(&line).map_err(|source| CacheError::Serialize {
        key: key.to_string(),
        source,
    })
}
