//! Object store rooted at a local directory (mounted bucket, NFS export).
//!
//! Keys map to relative paths. Writes land in a hidden sibling file and are
//! renamed into place, so a listing never returns a partial object.

use crate::remote::{ObjectStore, RemoteError, RemoteObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

const PARTIAL_PREFIX: &str = ".partial-";

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, RemoteError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(RemoteError::Io {
                kind: std::io::ErrorKind::InvalidInput,
                message: format!("invalid object key {key}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_file(&self, local: &Path, key: &str) -> Result<u64, RemoteError> {
        let dest = self.object_path(key)?;
        let parent = dest.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let partial = parent.join(format!("{PARTIAL_PREFIX}{}-{file_name}", uuid::Uuid::new_v4()));

        let bytes = match tokio::fs::copy(local, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        tokio::fs::rename(&partial, &dest).await?;
        Ok(bytes)
    }

    async fn get_file(&self, key: &str, local: &Path) -> Result<u64, RemoteError> {
        let src = self.object_path(key)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(RemoteError::NotFound(key.to_string()));
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::copy(&src, local).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), RemoteError> {
        for key in keys {
            let path = self.object_path(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        start_after: Option<&'a str>,
    ) -> BoxStream<'a, Result<RemoteObject, RemoteError>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let start_after = start_after.map(str::to_string);

        let listing = async move {
            let result =
                tokio::task::spawn_blocking(move || list_sorted(&root, &prefix, start_after.as_deref()))
                    .await;
            match result {
                Ok(Ok(objects)) => stream::iter(objects.into_iter().map(Ok)).boxed(),
                Ok(Err(e)) => stream::once(async move { Err(e) }).boxed(),
                Err(e) => stream::once(async move { Err(RemoteError::Transient(e.to_string())) }).boxed(),
            }
        };

        stream::once(listing).flatten().boxed()
    }
}

fn list_sorted(
    root: &Path,
    prefix: &str,
    start_after: Option<&str>,
) -> Result<Vec<RemoteObject>, RemoteError> {
    // Only walk the deepest directory fully named by the prefix.
    let dir_part = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    let start_dir = if dir_part.is_empty() {
        root.to_path_buf()
    } else {
        root.join(dir_part)
    };
    if !start_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(&start_dir).follow_links(false) {
        let entry = entry.map_err(|e| RemoteError::Transient(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.starts_with(prefix) {
            continue;
        }
        if start_after.is_some_and(|marker| key.as_str() <= marker) {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| RemoteError::Transient(e.to_string()))?;
        let last_modified: DateTime<Utc> = metadata.modified()?.into();
        objects.push(RemoteObject {
            key,
            size: metadata.len(),
            last_modified,
        });
    }

    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;

    async fn put(store: &LocalObjectStore, dir: &Path, key: &str) -> Result<u64, RemoteError> {
        let src = dir.join("src");
        tokio::fs::write(&src, key.as_bytes()).await?;
        store.put_file(&src, key).await
    }

    #[tokio::test]
    async fn test_put_get_exists_delete() -> Result<(), RemoteError> {
        let temp_dir = TempDir::new()?;
        let store = LocalObjectStore::new(temp_dir.path().join("bucket"));

        let bytes = put(&store, temp_dir.path(), "a/b/c.db").await?;
        assert_eq!(bytes, 8);
        assert!(store.exists("a/b/c.db").await?);

        let out = temp_dir.path().join("restore/c.db");
        store.get_file("a/b/c.db", &out).await?;
        assert_eq!(tokio::fs::read(&out).await?, b"a/b/c.db");

        store.delete_many(&["a/b/c.db".to_string(), "missing".to_string()]).await?;
        assert!(!store.exists("a/b/c.db").await?);
        assert!(matches!(
            store.get_file("a/b/c.db", &out).await,
            Err(RemoteError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_prefix_filtered() -> Result<(), RemoteError> {
        let temp_dir = TempDir::new()?;
        let store = LocalObjectStore::new(temp_dir.path().join("bucket"));
        for key in ["p/2/x", "p/1/y", "p/10/z", "q/1/w", "p/1/a"] {
            put(&store, temp_dir.path(), key).await?;
        }

        let keys: Vec<String> = store
            .list("p/1", None)
            .map_ok(|o| o.key)
            .try_collect()
            .await?;
        assert_eq!(keys, vec!["p/1/a", "p/1/y", "p/10/z"]);

        let after: Vec<String> = store
            .list("p/", Some("p/1/y"))
            .map_ok(|o| o.key)
            .try_collect()
            .await?;
        assert_eq!(after, vec!["p/10/z", "p/2/x"]);

        let none: Vec<RemoteObject> = store.list("nothing/", None).try_collect().await?;
        assert!(none.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let store = LocalObjectStore::new("/tmp/bucket");
        assert!(store.exists("../etc/passwd").await.is_err());
        assert!(store.exists("/etc/passwd").await.is_err());
    }
}
