use std::collections::BTreeMap;
use std::time::Duration;

use fetch_core::RateLimiterSpec;
use fetch_core::bencoding::{Bencode, info_hash};
use sha1::{Digest, Sha1};

use super::*;

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: dir.to_path_buf(),
        debug: true,
        listen_port: 0,
        download_limit: RateLimiterSpec::Unlimited,
        upload_limit: RateLimiterSpec::Unlimited,
    }
}

/// A single-file `.torrent` and its info hash.
fn torrent(name: &str, payload: &[u8], piece_length: usize) -> (Vec<u8>, [u8; 20]) {
    let hashes: Vec<u8> = payload
        .chunks(piece_length)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect();
    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Bencode::Bytes(name.as_bytes().to_vec()));
    info.insert(b"length".to_vec(), Bencode::Int(payload.len() as i64));
    info.insert(b"piece length".to_vec(), Bencode::Int(piece_length as i64));
    info.insert(b"pieces".to_vec(), Bencode::Bytes(hashes));
    let info = Bencode::Dict(info);
    let hash = info_hash(&info.encode());

    let mut root = BTreeMap::new();
    root.insert(b"info".to_vec(), info);
    (Bencode::Dict(root).encode(), hash)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_torrent_file_has_metadata_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let (raw, _) = torrent("file.bin", &payload(1000), 256);
    let path = dir.path().join("file.torrent");
    std::fs::write(&path, raw).unwrap();

    let client = SwarmEngine.new_client(config(dir.path())).await.unwrap();
    assert_ne!(client.listen_port(), 0);
    let handle = client.add_torrent_file(&path).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle.metadata_ready())
        .await
        .unwrap();
    assert_eq!(handle.bytes_completed().unwrap(), 0);
    assert_eq!(handle.bytes_missing().unwrap(), 1000);
    assert_eq!(
        std::fs::metadata(dir.path().join("file.bin")).unwrap().len(),
        1000
    );
    client.close().await;
}

#[tokio::test]
async fn test_rejected_sources() {
    let dir = tempfile::tempdir().unwrap();
    let client = SwarmEngine.new_client(config(dir.path())).await.unwrap();

    assert!(matches!(
        client.add_magnet("").await,
        Err(EngineError::Magnet(_))
    ));
    assert!(matches!(
        client.add_torrent_file(&dir.path().join("missing.torrent")).await,
        Err(EngineError::TorrentFile { .. })
    ));
    let garbage = dir.path().join("garbage.torrent");
    std::fs::write(&garbage, b"not a torrent").unwrap();
    assert!(matches!(
        client.add_torrent_file(&garbage).await,
        Err(EngineError::TorrentFile { .. })
    ));

    let magnet = format!("magnet:?xt=urn:btih:{}", "ab".repeat(20));
    client.add_magnet(&magnet).await.unwrap();
    assert!(matches!(
        client.add_magnet(&magnet).await,
        Err(EngineError::Duplicate { .. })
    ));
    client.close().await;
}

#[tokio::test]
async fn test_data_dir_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b/c");
    let client = SwarmEngine.new_client(config(&nested)).await.unwrap();
    assert!(nested.is_dir());
    client.close().await;
}

#[tokio::test]
async fn test_finished_tasks_are_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let client = SwarmEngine.new_client(config(dir.path())).await.unwrap();
    for _ in 0..20 {
        client.shared.spawn(async {});
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.shared.spawn(std::future::pending());
    // The accept loop and the pending task.
    assert_eq!(lock(&client.shared.tasks).len(), 2);
    client.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_ends_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(SwarmEngine.new_client(config(dir.path())).await.unwrap());
    let magnet = format!("magnet:?xt=urn:btih:{}", "cd".repeat(20));
    let handle = client.add_magnet(&magnet).await.unwrap();
    handle.download_all();
    assert_eq!(handle.bytes_missing().unwrap(), 0);

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_all().await })
    };
    tokio::task::yield_now().await;
    client.close().await;
    client.close().await;
    assert!(!waiter.await.unwrap());
    assert!(!client.wait_all().await);
    assert!(matches!(
        client.add_magnet(&magnet.replace("cd", "ef")).await,
        Err(EngineError::Closed)
    ));
}

#[tokio::test]
async fn test_magnet_download_from_loopback_seeder() {
    let data = payload(100_000);
    let (raw, hash) = torrent("shared.bin", &data, 32 * 1024);

    let seed_dir = tempfile::tempdir().unwrap();
    std::fs::write(seed_dir.path().join("shared.bin"), &data).unwrap();
    let torrent_path = seed_dir.path().join("shared.torrent");
    std::fs::write(&torrent_path, raw).unwrap();
    let seeder = SwarmEngine.new_client(config(seed_dir.path())).await.unwrap();
    let seeded = seeder.add_torrent_file(&torrent_path).await.unwrap();
    assert_eq!(seeded.bytes_missing().unwrap(), 0);

    let leech_dir = tempfile::tempdir().unwrap();
    let leecher = SwarmEngine.new_client(config(leech_dir.path())).await.unwrap();
    let magnet = format!("magnet:?xt=urn:btih:{}&dn=shared", hex::encode(hash));
    let handle = leecher.add_magnet(&magnet).await.unwrap();
    handle
        .transfer
        .discovered(SocketAddr::from(([127, 0, 0, 1], seeder.listen_port())));

    let finished = tokio::time::timeout(Duration::from_secs(20), async {
        handle.metadata_ready().await;
        handle.download_all();
        leecher.wait_all().await
    })
    .await
    .expect("download stalled");

    assert!(finished);
    assert_eq!(handle.bytes_completed().unwrap(), 100_000);
    assert_eq!(handle.bytes_missing().unwrap(), 0);
    assert_eq!(std::fs::read(leech_dir.path().join("shared.bin")).unwrap(), data);
    assert!(seeded.transfer.bytes_uploaded() >= 100_000);

    leecher.close().await;
    seeder.close().await;
}
