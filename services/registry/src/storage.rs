//! Manifest and tag storage for the registry

use std::collections::HashMap;
use std::fmt;
use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::Instrument;
use uuid::Uuid;

use blob_storage::Digest;

use crate::error::{RegistryError, RegistryResult};
use crate::manifest::detect_manifest_type;

/// Directory under the manifest root where files are staged before being renamed into place.
const STAGING_DIR: &str = ".uploads";

/// A manifest as pushed by a client.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    /// The media type the manifest was pushed with.
    pub content_type: String,

    /// The raw manifest bytes, exactly as pushed.
    pub data: Bytes,
}

/// A manifest reference from a URL: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag, e.g. `latest`.
    Tag(String),

    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// Parse a reference, validating tags and digests.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            return Ok(Reference::Digest(reference.parse()?));
        }

        let valid = reference.len() <= 128
            && reference
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

        if valid {
            Ok(Reference::Tag(reference.to_owned()))
        } else {
            Err(RegistryError::InvalidTag(reference.to_owned()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => fmt::Display::fmt(digest, f),
        }
    }
}

#[derive(Debug, Default)]
struct Repository {
    manifests: HashMap<Digest, StoredManifest>,
    tags: HashMap<String, Digest>,
}

/// Registry manifest storage.
///
/// Manifests are always indexed in memory. When a directory is configured,
/// every change is mirrored to it and the index is reloaded from it on
/// [`ManifestStore::open`]:
///
/// - manifests: `<dir>/manifests/<repository>/<digest>`
/// - tags: `<dir>/tags/<repository>/<tag>`, containing the digest
///
/// Files are written to `<dir>/.uploads` first and renamed into place, so a
/// crash never leaves a partial manifest or tag behind.
#[derive(Debug, Default)]
pub struct ManifestStore {
    repositories: RwLock<HashMap<String, Repository>>,
    root: Option<Utf8PathBuf>,
}

impl ManifestStore {
    /// Create an in-memory manifest store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a manifest store, persisted under `root` when one is given.
    #[tracing::instrument(level = "debug")]
    pub async fn open(root: Option<Utf8PathBuf>) -> io::Result<Self> {
        let Some(root) = root else {
            return Ok(Self::new());
        };

        tokio::fs::create_dir_all(root.join("manifests")).await?;
        tokio::fs::create_dir_all(root.join("tags")).await?;
        tokio::fs::create_dir_all(root.join(STAGING_DIR)).await?;

        let dir = root.clone();
        let repositories = tokio::task::spawn_blocking(move || load_index(&dir))
            .in_current_span()
            .await
            .map_err(io::Error::other)??;

        tracing::debug!("Loaded {} repositories", repositories.len());

        Ok(Self {
            repositories: RwLock::new(repositories),
            root: Some(root),
        })
    }

    fn manifest_path(root: &Utf8Path, repository: &str, digest: &Digest) -> Utf8PathBuf {
        let mut path = root.join("manifests");
        path.push(repository);
        path.push(digest.as_str());
        path
    }

    fn tag_path(root: &Utf8Path, repository: &str, tag: &str) -> Utf8PathBuf {
        let mut path = root.join("tags");
        path.push(repository);
        path.push(tag);
        path
    }

    /// Resolve a reference to a stored manifest.
    pub async fn get(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> RegistryResult<(Digest, StoredManifest)> {
        let not_found = || RegistryError::ManifestNotFound(format!("{repository}:{reference}"));

        let repositories = self.repositories.read().await;
        let repo = repositories.get(repository).ok_or_else(not_found)?;

        let digest = match reference {
            Reference::Tag(tag) => repo.tags.get(tag).ok_or_else(not_found)?,
            Reference::Digest(digest) => digest,
        };

        let manifest = repo.manifests.get(digest).ok_or_else(not_found)?;
        Ok((digest.clone(), manifest.clone()))
    }

    /// Store a manifest, returning its digest.
    ///
    /// Pushing by digest requires the content to match that digest. Pushing
    /// by tag also moves the tag to the new manifest.
    pub async fn put(
        &self,
        repository: &str,
        reference: &Reference,
        content_type: &str,
        data: Bytes,
    ) -> RegistryResult<Digest> {
        let digest = Digest::sha256(&data);

        if let Reference::Digest(expected) = reference {
            if *expected != digest {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        if let Some(root) = &self.root {
            let path = Self::manifest_path(root, repository, &digest);
            write_file(root, &path, &data).await?;

            if let Reference::Tag(tag) = reference {
                let path = Self::tag_path(root, repository, tag);
                write_file(root, &path, digest.as_str().as_bytes()).await?;
            }
        }

        let mut repositories = self.repositories.write().await;
        let repo = repositories.entry(repository.to_owned()).or_default();
        repo.manifests.insert(
            digest.clone(),
            StoredManifest {
                content_type: content_type.to_owned(),
                data,
            },
        );
        if let Reference::Tag(tag) = reference {
            repo.tags.insert(tag.clone(), digest.clone());
        }

        Ok(digest)
    }

    /// Delete a manifest or a tag.
    ///
    /// Deleting a tag leaves the manifest in place. Deleting a digest removes
    /// the manifest and every tag pointing at it.
    pub async fn delete(&self, repository: &str, reference: &Reference) -> RegistryResult<()> {
        let not_found = || RegistryError::ManifestNotFound(format!("{repository}:{reference}"));

        let mut repositories = self.repositories.write().await;
        let repo = repositories.get_mut(repository).ok_or_else(not_found)?;

        let mut removed_tags = Vec::new();
        let removed_manifest = match reference {
            Reference::Tag(tag) => {
                repo.tags.remove(tag).ok_or_else(not_found)?;
                removed_tags.push(tag.clone());
                None
            }
            Reference::Digest(digest) => {
                repo.manifests.remove(digest).ok_or_else(not_found)?;
                repo.tags.retain(|tag, target| {
                    let keep = target != digest;
                    if !keep {
                        removed_tags.push(tag.clone());
                    }
                    keep
                });
                Some(digest)
            }
        };
        drop(repositories);

        if let Some(root) = &self.root {
            for tag in &removed_tags {
                remove_file(&Self::tag_path(root, repository, tag)).await?;
            }
            if let Some(digest) = removed_manifest {
                remove_file(&Self::manifest_path(root, repository, digest)).await?;
            }
        }

        Ok(())
    }

    /// List the tags of a repository, sorted.
    pub async fn tags(&self, repository: &str) -> RegistryResult<Vec<String>> {
        let repositories = self.repositories.read().await;
        let repo = repositories
            .get(repository)
            .ok_or_else(|| RegistryError::RepositoryNotFound(repository.to_owned()))?;

        let mut tags: Vec<String> = repo.tags.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }
}

/// Write `contents` to a staging file under `root`, then rename it to `path`.
async fn write_file(root: &Utf8Path, path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut staging = root.join(STAGING_DIR);
    staging.push(Uuid::new_v4().to_string());

    let staged = async {
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, path).await
    }
    .await;

    if staged.is_err() {
        if let Err(err) = tokio::fs::remove_file(&staging).await {
            tracing::trace!(%staging, "staging file not removed: {err}");
        }
    }
    staged
}

async fn remove_file(path: &Utf8Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

#[tracing::instrument]
fn load_index(root: &Utf8Path) -> io::Result<HashMap<String, Repository>> {
    let mut repositories: HashMap<String, Repository> = HashMap::new();

    for (repository, name, path) in visit(&root.join("manifests"))? {
        let Ok(digest) = name.parse::<Digest>() else {
            tracing::warn!(%path, "Skipping manifest with invalid digest name");
            continue;
        };
        let data = Bytes::from(std::fs::read(&path)?);
        if !digest.verify(&data) {
            tracing::warn!(%path, "Skipping manifest whose content does not match its digest");
            continue;
        }
        let manifest = StoredManifest {
            content_type: detect_manifest_type(&data),
            data,
        };
        repositories
            .entry(repository)
            .or_default()
            .manifests
            .insert(digest, manifest);
    }

    for (repository, tag, path) in visit(&root.join("tags"))? {
        let contents = std::fs::read_to_string(&path)?;
        let Ok(digest) = contents.trim().parse::<Digest>() else {
            tracing::warn!(%path, "Skipping tag with invalid digest");
            continue;
        };
        repositories
            .entry(repository)
            .or_default()
            .tags
            .insert(tag, digest);
    }

    Ok(repositories)
}

/// Collect `(repository, file name, path)` for every file two levels below `dir`.
fn visit(dir: &Utf8Path) -> io::Result<Vec<(String, String, Utf8PathBuf)>> {
    let mut files = Vec::new();

    for repository in dir.read_dir_utf8()? {
        let repository = repository?;
        if !repository.file_type()?.is_dir() {
            continue;
        }

        for entry in repository.path().read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push((
                    repository.file_name().to_owned(),
                    entry.file_name().to_owned(),
                    entry.path().to_owned(),
                ));
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

    fn tag(name: &str) -> Reference {
        Reference::Tag(name.to_owned())
    }

    fn manifest() -> Bytes {
        Bytes::from_static(br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#)
    }

    #[test]
    fn parse_references() {
        assert_eq!(Reference::parse("latest").unwrap(), tag("latest"));
        assert_eq!(Reference::parse("v1.2_rc-3").unwrap(), tag("v1.2_rc-3"));

        let digest = Digest::sha256(b"x");
        assert_eq!(
            Reference::parse(digest.as_str()).unwrap(),
            Reference::Digest(digest)
        );

        assert!(matches!(
            Reference::parse(".hidden"),
            Err(RegistryError::InvalidTag(_))
        ));
        assert!(matches!(
            Reference::parse("sha256:zz"),
            Err(RegistryError::InvalidDigest(_))
        ));
    }

    #[tokio::test]
    async fn put_and_get_by_tag_and_digest() {
        let store = ManifestStore::new();

        let digest = store
            .put("app", &tag("latest"), MEDIA_TYPE, manifest())
            .await
            .unwrap();

        let (resolved, by_tag) = store.get("app", &tag("latest")).await.unwrap();
        assert_eq!(resolved, digest);
        assert_eq!(by_tag.data, manifest());
        assert_eq!(by_tag.content_type, MEDIA_TYPE);

        let (_, by_digest) = store
            .get("app", &Reference::Digest(digest.clone()))
            .await
            .unwrap();
        assert_eq!(by_digest.data, manifest());
    }

    #[tokio::test]
    async fn put_by_wrong_digest_is_rejected() {
        let store = ManifestStore::new();
        let wrong = Reference::Digest(Digest::sha256(b"something else"));

        let err = store
            .put("app", &wrong, MEDIA_TYPE, manifest())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn delete_tag_keeps_manifest() {
        let store = ManifestStore::new();
        let digest = store
            .put("app", &tag("v1"), MEDIA_TYPE, manifest())
            .await
            .unwrap();

        store.delete("app", &tag("v1")).await.unwrap();

        assert!(store.get("app", &tag("v1")).await.is_err());
        assert!(store.get("app", &Reference::Digest(digest)).await.is_ok());
    }

    #[tokio::test]
    async fn delete_digest_removes_tags() {
        let store = ManifestStore::new();
        let digest = store
            .put("app", &tag("v1"), MEDIA_TYPE, manifest())
            .await
            .unwrap();
        store
            .put("app", &tag("v2"), MEDIA_TYPE, manifest())
            .await
            .unwrap();

        store
            .delete("app", &Reference::Digest(digest))
            .await
            .unwrap();

        assert!(store.tags("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_tags_sorted() {
        let store = ManifestStore::new();
        for name in ["v1.1", "latest", "v1.0"] {
            store
                .put("app", &tag(name), MEDIA_TYPE, manifest())
                .await
                .unwrap();
        }

        assert_eq!(store.tags("app").await.unwrap(), ["latest", "v1.0", "v1.1"]);
        assert!(matches!(
            store.tags("unknown").await,
            Err(RegistryError::RepositoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn persisted_manifests_reload() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();

        let digest = {
            let store = ManifestStore::open(Some(root.clone())).await.unwrap();
            store
                .put("app", &tag("latest"), MEDIA_TYPE, manifest())
                .await
                .unwrap()
        };

        let store = ManifestStore::open(Some(root)).await.unwrap();
        let (resolved, stored) = store.get("app", &tag("latest")).await.unwrap();
        assert_eq!(resolved, digest);
        assert_eq!(stored.data, manifest());
        assert_eq!(stored.content_type, MEDIA_TYPE);
    }

    #[tokio::test]
    async fn persisted_writes_leave_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();

        let store = ManifestStore::open(Some(root.clone())).await.unwrap();
        store
            .put("app", &tag("latest"), MEDIA_TYPE, manifest())
            .await
            .unwrap();

        let staged = std::fs::read_dir(root.join(STAGING_DIR)).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn truncated_manifest_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();

        let digest = {
            let store = ManifestStore::open(Some(root.clone())).await.unwrap();
            store
                .put("app", &tag("latest"), MEDIA_TYPE, manifest())
                .await
                .unwrap()
        };

        let path = ManifestStore::manifest_path(&root, "app", &digest);
        std::fs::write(&path, &manifest()[..10]).unwrap();

        let store = ManifestStore::open(Some(root)).await.unwrap();
        assert!(matches!(
            store.get("app", &Reference::Digest(digest)).await,
            Err(RegistryError::ManifestNotFound(_))
        ));
        assert!(matches!(
            store.get("app", &tag("latest")).await,
            Err(RegistryError::ManifestNotFound(_))
        ));
    }
}
