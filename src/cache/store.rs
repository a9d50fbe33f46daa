//! Disk-backed cache storage.
//!
//! Two kinds of files live under the store root, both addressed by a hex
//! digest and sharded as `root/ab/cd/ef…`:
//!
//! - **Metadata** (`md…`, keyed by the normalized request URI): the list of
//!   variants stored for that URI, newest first. Each variant pairs the
//!   `Vary`-relevant request headers with the response status and headers.
//! - **Bodies** (`en…`, keyed by a digest of the bytes): written once and
//!   shared by every variant whose response has identical content.
//!
//! Metadata is replaced atomically (temp file in the same directory, then
//! rename), so readers never observe a partially written list. Per-key lock
//! markers (`md….lck`) serialize revalidation with the origin.

use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::error::StoreError;
use crate::http::{Body, Headers, Request, Response, StatusCode};

/// Response header that links a stored response to its body blob.
pub const CONTENT_DIGEST: &str = "X-Content-Digest";

const FORMAT_VERSION: u32 = 1;

/// Lock markers older than this are assumed to belong to a crashed request.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Variant {
    request: Headers,
    status: u16,
    response: Headers,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    version: u32,
    variants: Vec<Variant>,
}

// Read ahead of `Metadata` so a newer layout is reported as such rather than
// as a decode failure.
#[derive(Deserialize)]
struct VersionTag {
    version: u32,
}

/// Outcome of [`Store::lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lock {
    /// The caller now owns the right to revalidate this key.
    Acquired,
    /// Another request holds the marker at this path.
    Pending(PathBuf),
}

/// Persistent variant and body storage rooted at a directory.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    held: Mutex<HashSet<PathBuf>>,
}

impl Store {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            held: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the cache key of a request: a digest of its normalized URI.
    pub fn cache_key(request: &Request) -> String {
        format!("md{}", hex::encode(Sha256::digest(request.uri().as_bytes())))
    }

    /// Maps a key or body digest to its sharded location.
    pub fn path_for(&self, key: &str) -> PathBuf {
        if key.len() <= 4 {
            return self.root.join(key);
        }
        self.root.join(&key[..2]).join(&key[2..4]).join(&key[4..])
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let mut path = self.path_for(key).into_os_string();
        path.push(".lck");
        PathBuf::from(path)
    }

    /// Finds the stored response matching `request`, honoring `Vary`.
    ///
    /// The returned response has a [`Body::File`] pointing at its blob.
    /// A variant whose blob has gone missing is reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the metadata cannot be read or decoded.
    pub async fn lookup(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        let key = Self::cache_key(request);
        let variants = self.load_variants(&key).await?;

        let Some(variant) = variants.into_iter().find(|variant| {
            requests_match(
                variant.response.get_joined("vary").as_deref(),
                &variant.request,
                request.headers(),
            )
        }) else {
            return Ok(None);
        };

        let Some(digest) = variant.response.get(CONTENT_DIGEST).map(str::to_owned) else {
            warn!(key = %key, "stored variant has no content digest");
            return Ok(None);
        };
        let body = self.path_for(&digest);
        let exists = tokio::fs::try_exists(&body)
            .await
            .map_err(|e| StoreError::io(&body, e))?;
        if !exists {
            warn!(key = %key, digest = %digest, "metadata references a missing body");
            return Ok(None);
        }

        restore(variant, Body::File(body)).map(Some)
    }

    /// Stores `response` as the variant of `request`, returning the cache key.
    ///
    /// An original response (one without [`CONTENT_DIGEST`]) has its body
    /// written to the blob store first and is tagged with the digest, so that
    /// the caller's response now mirrors what was stored.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the body or metadata cannot be persisted.
    pub async fn write(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<String, StoreError> {
        let key = Self::cache_key(request);
        let vary = response.headers().get_joined("vary");
        let stored_request = vary_snapshot(vary.as_deref(), request.headers());

        if !response.headers().contains(CONTENT_DIGEST) {
            let content = read_body(response.payload()).await?;
            let digest = format!("en{}", hex::encode(Sha256::digest(&content)));
            self.save_blob(&digest, content.clone()).await?;

            response.headers_mut().set(CONTENT_DIGEST, digest);
            if !response.headers().contains("transfer-encoding") {
                response
                    .headers_mut()
                    .set("Content-Length", content.len().to_string());
            }
        }

        // Keep only variants this response does not supersede.
        let mut variants: Vec<Variant> = self
            .load_variants(&key)
            .await?
            .into_iter()
            .filter(|variant| {
                variant.response.get_joined("vary") == vary
                    && !requests_match(vary.as_deref(), &variant.request, &stored_request)
            })
            .collect();

        let mut headers = response.headers().clone();
        headers.remove("age");
        variants.insert(
            0,
            Variant {
                request: stored_request,
                status: response.status().as_u16(),
                response: headers,
            },
        );

        debug!(key = %key, variants = variants.len(), "writing cache metadata");
        self.save_variants(&key, variants).await?;
        Ok(key)
    }

    /// Force-expires every fresh variant stored for `request` without
    /// deleting it. Returns `true` if anything changed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the metadata cannot be read or rewritten.
    pub async fn invalidate(&self, request: &Request, now: SystemTime) -> Result<bool, StoreError> {
        let key = Self::cache_key(request);
        let mut variants = self.load_variants(&key).await?;
        let mut modified = false;

        for variant in &mut variants {
            let mut response = restore(variant.clone(), Body::default())?;
            if response.is_fresh(now) {
                response.expire(now);
                variant.response = response.headers().clone();
                modified = true;
            }
        }

        if modified {
            debug!(key = %key, "expired stored variants");
            self.save_variants(&key, variants).await?;
        }
        Ok(modified)
    }

    /// Deletes the metadata stored for `request`. Bodies are left in place.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the file exists but cannot be removed.
    pub async fn purge(&self, request: &Request) -> Result<bool, StoreError> {
        let path = self.path_for(&Self::cache_key(request));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Tries to take the revalidation marker for `request`.
    ///
    /// A marker older than the staleness bound is reclaimed once.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the marker cannot be created for any
    /// reason other than already existing.
    pub async fn lock(&self, request: &Request) -> Result<Lock, StoreError> {
        let path = self.lock_path(&Self::cache_key(request));
        ensure_parent(&path).await?;

        for attempt in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    self.held().insert(path);
                    return Ok(Lock::Acquired);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && marker_is_abandoned(&path).await {
                        warn!(path = %path.display(), "reclaiming abandoned lock marker");
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => warn!(
                                path = %path.display(),
                                error = %e,
                                "failed to remove abandoned lock marker"
                            ),
                        }
                        continue;
                    }
                    return Ok(Lock::Pending(path));
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(Lock::Pending(path))
    }

    /// Removes the revalidation marker for `request`. Returns `false` if
    /// there was none.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the marker exists but cannot be removed.
    pub async fn unlock(&self, request: &Request) -> Result<bool, StoreError> {
        let path = self.lock_path(&Self::cache_key(request));
        self.held().remove(&path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Returns `true` while a revalidation marker exists for `request`.
    pub async fn is_locked(&self, request: &Request) -> bool {
        let path = self.lock_path(&Self::cache_key(request));
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op = "store.held",
                    result = "poisoned_recovered",
                    "Recovered from poisoned lock-marker registry"
                );
                poisoned.into_inner()
            }
        }
    }

    async fn load_variants(&self, key: &str) -> Result<Vec<Variant>, StoreError> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        decode_metadata(&path, &raw)
    }

    async fn save_variants(&self, key: &str, variants: Vec<Variant>) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(&Metadata {
            version: FORMAT_VERSION,
            variants,
        })?;
        atomic_write(self.path_for(key), Bytes::from(encoded)).await
    }

    async fn save_blob(&self, digest: &str, content: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(digest);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if exists {
            return Ok(());
        }
        atomic_write(path, content).await
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let held = match self.held.get_mut() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for path in held.drain() {
            if std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "released lock marker on shutdown");
            }
        }
    }
}

/// Returns `true` if `a` and `b` agree on every header named in `vary`.
fn requests_match(vary: Option<&str>, a: &Headers, b: &Headers) -> bool {
    vary_names(vary).all(|name| a.get_joined(name) == b.get_joined(name))
}

fn vary_names(vary: Option<&str>) -> impl Iterator<Item = &str> {
    vary.unwrap_or_default()
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
}

fn vary_snapshot(vary: Option<&str>, headers: &Headers) -> Headers {
    let mut snapshot = Headers::new();
    for name in vary_names(vary) {
        for value in headers.get_all(name) {
            snapshot.insert(name, value);
        }
    }
    snapshot
}

fn restore(variant: Variant, body: Body) -> Result<Response, StoreError> {
    let status =
        StatusCode::from_u16(variant.status).ok_or(StoreError::UnknownStatus(variant.status))?;
    Ok(Response::from_parts(status, variant.response, body))
}

fn decode_metadata(path: &Path, raw: &[u8]) -> Result<Vec<Variant>, StoreError> {
    let tag: VersionTag = serde_json::from_slice(raw).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    if tag.version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: tag.version,
        });
    }
    let metadata: Metadata = serde_json::from_slice(raw).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(metadata.variants)
}

async fn read_body(body: &Body) -> Result<Bytes, StoreError> {
    match body {
        Body::Full(bytes) => Ok(bytes.clone()),
        Body::File(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| StoreError::io(path, e)),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    Ok(())
}

async fn marker_is_abandoned(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

async fn atomic_write(path: PathBuf, data: Bytes) -> Result<(), StoreError> {
    ensure_parent(&path).await?;
    tokio::task::spawn_blocking(move || {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        file.write_all(&data)
            .map_err(|e| StoreError::io(file.path(), e))?;
        file.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    })
    .await?
}
