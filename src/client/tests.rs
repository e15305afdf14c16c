use super::*;
use crate::peer::testing::{content_and_info, seed};
use crate::tracker::AnnounceResponse;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::net::TcpListener;

/// Hands out a fixed peer list
struct StaticTracker {
    peers: Vec<SocketAddr>,
    announces: AtomicUsize,
}

impl StaticTracker {
    fn new(peers: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            peers,
            announces: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Tracker for StaticTracker {
    async fn announce(&self, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
        self.announces.fetch_add(1, Ordering::SeqCst);
        Ok(AnnounceResponse {
            peers: self.peers.clone(),
            interval: Duration::from_secs(1800),
        })
    }
}

/// Answers the first announce, then never again
struct HangingTracker {
    peers: Vec<SocketAddr>,
    announces: AtomicUsize,
}

#[async_trait]
impl Tracker for HangingTracker {
    async fn announce(&self, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
        if self.announces.fetch_add(1, Ordering::SeqCst) > 0 || self.peers.is_empty() {
            std::future::pending::<()>().await;
        }
        Ok(AnnounceResponse {
            peers: self.peers.clone(),
            interval: Duration::ZERO,
        })
    }
}

struct DeadTracker;

#[async_trait]
impl Tracker for DeadTracker {
    async fn announce(&self, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
        Err(Error::Tracker("connection refused".to_string()))
    }
}

/// Keeps every write, counting how often each piece was written
#[derive(Default)]
struct MemoryStorage {
    pieces: StdMutex<HashMap<usize, (Vec<u8>, usize)>>,
}

impl MemoryStorage {
    fn with_pieces(pieces: impl IntoIterator<Item = (usize, Vec<u8>)>) -> Arc<Self> {
        let pieces = pieces.into_iter().map(|(i, data)| (i, (data, 0))).collect();
        Arc::new(Self {
            pieces: StdMutex::new(pieces),
        })
    }

    fn writes(&self) -> HashMap<usize, usize> {
        let pieces = self.pieces.lock().unwrap();
        pieces
            .iter()
            .filter(|(_, (_, writes))| *writes > 0)
            .map(|(i, (_, writes))| (*i, *writes))
            .collect()
    }

    fn assembled(&self, piece_count: usize) -> Vec<u8> {
        let pieces = self.pieces.lock().unwrap();
        (0..piece_count)
            .flat_map(|i| pieces[&i].0.clone())
            .collect()
    }
}

#[async_trait]
impl StorageSink for MemoryStorage {
    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        let mut pieces = self.pieces.lock().unwrap();
        let entry = pieces.entry(index).or_insert_with(|| (Vec::new(), 0));
        entry.0 = data.to_vec();
        entry.1 += 1;
        Ok(())
    }

    async fn read_piece(&self, index: usize, _length: usize) -> Result<Option<Vec<u8>>> {
        Ok(self.pieces.lock().unwrap().get(&index).map(|(data, _)| data.clone()))
    }
}

/// Listen on loopback and seed every incoming connection
async fn spawn_seeder(info: &TorrentInfo, content: &[u8], corrupt: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info = info.clone();
    let content = content.to_vec();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let info = info.clone();
            let content = content.clone();
            tokio::spawn(async move {
                let _ = seed(stream, &info, &content, corrupt).await;
            });
        }
    });

    addr
}

fn config() -> DownloadConfig {
    DownloadConfig {
        block_size: 16,
        pipeline_depth: 4,
        resume: false,
        min_announce_interval: Duration::ZERO,
        ..DownloadConfig::default()
    }
}

async fn finish(handle: DownloadHandle) -> Result<()> {
    time::timeout(Duration::from_secs(20), handle.wait())
        .await
        .expect("download did not finish")
}

#[tokio::test]
async fn test_downloads_from_seeders() {
    // ten pieces, the last one short
    let (content, info) = content_and_info(64, 600);
    let first = spawn_seeder(&info, &content, false).await;
    let second = spawn_seeder(&info, &content, false).await;

    let storage = Arc::new(MemoryStorage::default());
    let handle = start_download(
        Arc::new(info.clone()),
        StaticTracker::new(vec![first, second]),
        storage.clone(),
        config(),
    )
    .unwrap();
    let progress = handle.subscribe();

    finish(handle).await.unwrap();

    let writes = storage.writes();
    assert_eq!(writes.len(), 10);
    assert!(writes.values().all(|&n| n == 1));
    assert_eq!(storage.assembled(10), content);

    let last = *progress.borrow();
    assert_eq!(last.pieces_complete, 10);
    assert_eq!(last.pieces_total, 10);
    assert_eq!(last.bytes_downloaded, 600);
}

#[tokio::test]
async fn test_resume_skips_stored_pieces() {
    let (content, info) = content_and_info(64, 600);
    let seeder = spawn_seeder(&info, &content, false).await;

    // pieces 0..5 on disk, piece 3 damaged
    let stored = (0..5).map(|i| {
        let mut data = content[i * 64..(i + 1) * 64].to_vec();
        if i == 3 {
            data[0] ^= 0xFF;
        }
        (i, data)
    });
    let storage = MemoryStorage::with_pieces(stored);

    let handle = start_download(
        Arc::new(info),
        StaticTracker::new(vec![seeder]),
        storage.clone(),
        DownloadConfig {
            resume: true,
            ..config()
        },
    )
    .unwrap();
    finish(handle).await.unwrap();

    let mut written: Vec<usize> = storage.writes().into_keys().collect();
    written.sort();
    assert_eq!(written, vec![3, 5, 6, 7, 8, 9]);
    assert_eq!(storage.assembled(10), content);
}

#[tokio::test]
async fn test_complete_storage_needs_no_tracker() {
    let (content, info) = content_and_info(64, 128);
    let storage = MemoryStorage::with_pieces(vec![
        (0, content[..64].to_vec()),
        (1, content[64..].to_vec()),
    ]);
    let tracker = StaticTracker::new(Vec::new());

    let handle = start_download(
        Arc::new(info),
        tracker.clone(),
        storage.clone(),
        DownloadConfig {
            resume: true,
            ..config()
        },
    )
    .unwrap();
    finish(handle).await.unwrap();

    assert_eq!(tracker.announces.load(Ordering::SeqCst), 0);
    assert!(storage.writes().is_empty());
}

#[tokio::test]
async fn test_corrupt_peer_banned_then_exhausted() {
    let (content, info) = content_and_info(64, 256);
    let liar = spawn_seeder(&info, &content, true).await;

    let storage = Arc::new(MemoryStorage::default());
    let handle = start_download(
        Arc::new(info),
        StaticTracker::new(vec![liar]),
        storage.clone(),
        DownloadConfig {
            max_peer_strikes: 1,
            stall_threshold: 1,
            ..config()
        },
    )
    .unwrap();
    let progress = handle.subscribe();

    assert!(matches!(finish(handle).await, Err(Error::PeersExhausted)));
    assert!(storage.writes().is_empty());
    assert!(progress.borrow().stalled);
}

#[tokio::test]
async fn test_tracker_failure_is_terminal() {
    let (_, info) = content_and_info(64, 128);
    let handle = start_download(
        Arc::new(info),
        Arc::new(DeadTracker),
        Arc::new(MemoryStorage::default()),
        DownloadConfig {
            tracker_retries: 2,
            ..config()
        },
    )
    .unwrap();

    assert!(matches!(finish(handle).await, Err(Error::Tracker(_))));
}

#[tokio::test]
async fn test_cancel_resolves_cancelled() {
    let (_, info) = content_and_info(64, 128);

    // accepts connections and never answers the handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let storage = Arc::new(MemoryStorage::default());
    let handle = start_download(
        Arc::new(info),
        StaticTracker::new(vec![silent]),
        storage.clone(),
        config(),
    )
    .unwrap();

    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.progress().pieces_complete, 0);
    handle.cancel();

    assert!(matches!(finish(handle).await, Err(Error::Cancelled)));
    assert!(storage.writes().is_empty());
}

#[tokio::test]
async fn test_stuck_reannounce_does_not_block_download() {
    let (content, info) = content_and_info(64, 600);
    let seeder = spawn_seeder(&info, &content, false).await;
    let tracker = Arc::new(HangingTracker {
        peers: vec![seeder],
        announces: AtomicUsize::new(0),
    });

    let storage = Arc::new(MemoryStorage::default());
    let handle = start_download(Arc::new(info), tracker.clone(), storage.clone(), config())
        .unwrap();
    finish(handle).await.unwrap();

    assert_eq!(storage.assembled(10), content);
    // the re-announce was still pending when the download completed
    assert!(tracker.announces.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_unanswered_announces_time_out() {
    let (_, info) = content_and_info(64, 128);
    let tracker = Arc::new(HangingTracker {
        peers: Vec::new(),
        announces: AtomicUsize::new(0),
    });

    let handle = start_download(
        Arc::new(info),
        tracker,
        Arc::new(MemoryStorage::default()),
        DownloadConfig {
            announce_timeout: Duration::from_millis(100),
            tracker_retries: 2,
            ..config()
        },
    )
    .unwrap();

    assert!(matches!(finish(handle).await, Err(Error::Tracker(_))));
}

#[tokio::test]
async fn test_rejects_zero_block_size() {
    let (_, info) = content_and_info(64, 128);
    let result = start_download(
        Arc::new(info),
        StaticTracker::new(Vec::new()),
        Arc::new(MemoryStorage::default()),
        DownloadConfig {
            block_size: 0,
            ..config()
        },
    );

    assert!(matches!(result, Err(Error::Config(_))));
}
