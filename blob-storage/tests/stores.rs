//! Behaviour shared by every blob store.

use blob_storage::{BlobStorage, Digest, DiskBlobStore, MemoryBlobStore};
use bytes::Bytes;
use camino::Utf8Path;

async fn disk_store(dir: &tempfile::TempDir) -> BlobStorage {
    let root = Utf8Path::from_path(dir.path()).unwrap().join("blobs");
    DiskBlobStore::open(root).await.unwrap().into()
}

async fn round_trip(storage: &BlobStorage) {
    let data = Bytes::from_static(b"{\"architecture\":\"amd64\"}");
    let digest = Digest::sha256(&data);

    assert!(!storage.exists(&digest).await.unwrap());
    storage.put(&digest, data.clone()).await.unwrap();

    assert!(storage.exists(&digest).await.unwrap());
    assert_eq!(storage.get(&digest).await.unwrap(), data);
}

async fn concurrent_puts(storage: &BlobStorage) {
    let blobs: Vec<(Digest, Bytes)> = (0..32)
        .map(|i| {
            let data = Bytes::from(format!("layer number {i}").repeat(i + 1));
            (Digest::sha256(&data), data)
        })
        .collect();

    let writes = blobs.iter().map(|(digest, data)| {
        let storage = storage.clone();
        let digest = digest.clone();
        let data = data.clone();
        tokio::spawn(async move { storage.put(&digest, data).await })
    });

    for result in futures::future::join_all(writes).await {
        result.unwrap().unwrap();
    }

    for (digest, data) in &blobs {
        assert_eq!(&storage.get(digest).await.unwrap(), data);
    }
}

async fn missing(storage: &BlobStorage) {
    let digest = Digest::sha256(b"nobody wrote this");
    assert!(storage.get(&digest).await.unwrap_err().is_not_found());
    assert!(!storage.exists(&digest).await.unwrap());
}

#[tokio::test]
async fn memory_round_trip() {
    round_trip(&MemoryBlobStore::new().into()).await;
}

#[tokio::test]
async fn disk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    round_trip(&disk_store(&dir).await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_puts() {
    concurrent_puts(&MemoryBlobStore::new().into()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_concurrent_puts() {
    let dir = tempfile::tempdir().unwrap();
    concurrent_puts(&disk_store(&dir).await).await;
}

#[tokio::test]
async fn memory_missing() {
    missing(&MemoryBlobStore::new().into()).await;
}

#[tokio::test]
async fn disk_missing() {
    let dir = tempfile::tempdir().unwrap();
    missing(&disk_store(&dir).await).await;
}

#[tokio::test]
async fn memory_does_not_survive_restart() {
    let digest = Digest::sha256(b"ephemeral");
    {
        let storage: BlobStorage = MemoryBlobStore::new().into();
        storage
            .put(&digest, Bytes::from_static(b"ephemeral"))
            .await
            .unwrap();
    }

    let storage: BlobStorage = MemoryBlobStore::new().into();
    assert!(!storage.exists(&digest).await.unwrap());
}

#[tokio::test]
async fn disk_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let digest = Digest::sha256(b"durable");
    {
        let storage = disk_store(&dir).await;
        storage
            .put(&digest, Bytes::from_static(b"durable"))
            .await
            .unwrap();
    }

    let storage = disk_store(&dir).await;
    assert!(storage.exists(&digest).await.unwrap());
    assert_eq!(&storage.get(&digest).await.unwrap()[..], b"durable");
}
