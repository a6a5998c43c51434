//! Live tunnel registry
//!
//! Maps connection ids to [`TunnelEntry`]s. The map lock only guards
//! insert/lookup/remove; socket I/O happens on the entry itself, behind
//! per-entry locks, so tunnels never wait on each other.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sohtunnel_core::ConnectionConfig;

use crate::{Result, ServerError};

/// Read half of the target socket plus the scratch buffer `/read` fills
struct ReadSide {
    stream: OwnedReadHalf,
    scratch: Vec<u8>,
}

/// One open tunnel and its target socket
pub struct TunnelEntry {
    id: String,
    owner: IpAddr,
    created_at: SystemTime,
    config: ConnectionConfig,
    reader: Mutex<Option<ReadSide>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl TunnelEntry {
    fn new(id: String, owner: IpAddr, config: ConnectionConfig, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let scratch = vec![0u8; config.buffer_size];
        Self {
            id,
            owner,
            created_at: SystemTime::now(),
            config,
            reader: Mutex::new(Some(ReadSide {
                stream: read_half,
                scratch,
            })),
            writer: Mutex::new(Some(write_half)),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> IpAddr {
        self.owner
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write every byte to the target socket
    pub async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(ServerError::NotFound);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ServerError::NotFound)?;

        tokio::select! {
            res = writer.write_all(bytes) => res.map_err(ServerError::from),
            _ = self.closed.cancelled() => Err(ServerError::NotFound),
        }
    }

    /// Long-poll the target socket.
    ///
    /// Waits up to `timeout` for the first byte, then drains whatever else
    /// is immediately ready (up to the scratch size) and returns it. An
    /// empty result means nothing arrived before the timeout. End of stream
    /// with nothing read in this call is [`ServerError::EndOfStream`].
    pub async fn read_available(&self, timeout: Duration) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(ServerError::NotFound);
        }
        let mut guard = self.reader.lock().await;
        let side = guard.as_mut().ok_or(ServerError::NotFound)?;

        let deadline = Instant::now() + timeout;
        let mut filled = 0usize;

        loop {
            match side.stream.try_read(&mut side.scratch[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Err(ServerError::EndOfStream);
                    }
                    break;
                }
                Ok(n) => {
                    filled += n;
                    if filled == side.scratch.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if filled > 0 {
                        break;
                    }
                    tokio::select! {
                        ready = side.stream.readable() => ready?,
                        _ = tokio::time::sleep_until(deadline) => break,
                        _ = self.closed.cancelled() => return Err(ServerError::NotFound),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(side.scratch[..filled].to_vec())
    }

    /// Close the target socket.
    ///
    /// Only the first call does anything and returns `Ok(true)`; later
    /// calls return `Ok(false)`. In-flight reads and writes are woken and
    /// fail with [`ServerError::NotFound`].
    pub async fn close(&self) -> io::Result<bool> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.closed.cancel();

        drop(self.reader.lock().await.take());
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(true)
    }
}

/// Snapshot of one entry for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: String,
    pub owner: IpAddr,
    pub created_at: SystemTime,
    pub target: String,
}

/// Outcome of [`ConnectionRegistry::drain_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub closed: usize,
    pub errored: usize,
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connection(s) closed ({} with error)",
            self.closed, self.errored
        )
    }
}

/// Registry of live tunnels keyed by connection id
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, Arc<TunnelEntry>>>,
    connect_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Connect to the config's target and register a new entry for `owner`.
    ///
    /// Nothing is stored if the connect fails or times out.
    pub async fn create(&self, config: ConnectionConfig, owner: IpAddr) -> Result<String> {
        let target = config.target();
        debug!("Opening tunnel to {} for {}", target, owner);

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| ServerError::ConnectFailed(format!("{}: connect timed out", target)))?
        .map_err(|e| ServerError::ConnectFailed(format!("{}: {}", target, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", target, e);
        }

        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(TunnelEntry::new(id.clone(), owner, config, stream));
        self.entries.write().insert(id.clone(), entry);

        info!("Tunnel {} established to {} for {}", id, target, owner);
        Ok(id)
    }

    /// Resolve `id` for a caller, checking the caller opened it
    pub fn lookup(&self, id: &str, caller: IpAddr) -> Result<Arc<TunnelEntry>> {
        let entry = self
            .entries
            .read()
            .get(id)
            .cloned()
            .ok_or(ServerError::NotFound)?;

        if entry.owner != caller {
            warn!(
                "Rejected call from {} for tunnel {} owned by {}",
                caller, id, entry.owner
            );
            return Err(ServerError::Forbidden);
        }
        Ok(entry)
    }

    /// Close the entry's socket and drop it from the registry.
    ///
    /// Returns `true` if this call closed it. Absent ids are a no-op and
    /// close errors are logged, not returned.
    pub async fn remove(&self, id: &str) -> bool {
        let Some(entry) = self.entries.read().get(id).cloned() else {
            return false;
        };

        let closed = match entry.close().await {
            Ok(closed) => closed,
            Err(e) => {
                warn!("Error while closing tunnel {}: {}", id, e);
                true
            }
        };
        self.entries.write().remove(id);

        if closed {
            let age = entry.created_at.elapsed().unwrap_or_default();
            info!("Tunnel {} closed after {:.1}s", id, age.as_secs_f64());
        }
        closed
    }

    /// Close and remove every entry
    pub async fn drain_all(&self) -> CleanReport {
        let drained: Vec<Arc<TunnelEntry>> = {
            let mut entries = self.entries.write();
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let mut report = CleanReport::default();
        for entry in drained {
            report.closed += 1;
            if let Err(e) = entry.close().await {
                warn!("Error while cleaning tunnel {}: {}", entry.id, e);
                report.errored += 1;
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Diagnostic snapshot of live entries
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.entries
            .read()
            .values()
            .map(|entry| EntryInfo {
                id: entry.id.clone(),
                owner: entry.owner,
                created_at: entry.created_at,
                target: entry.config.target(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const OWNER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const STRANGER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    /// Listener whose accepted sockets are handed back to the test
    async fn target() -> (TcpListener, ConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ConnectionConfig::new("127.0.0.1", port).with_buffer_size(16))
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (listener, config) = target().await;
        let registry = registry();

        let id = registry.create(config.clone(), OWNER).await.unwrap();
        let _peer = listener.accept().await.unwrap();

        assert_eq!(registry.len(), 1);
        let entry = registry.lookup(&id, OWNER).unwrap();
        assert_eq!(entry.id(), id);
        assert_eq!(entry.config(), &config);
        assert!(!entry.is_closed());

        let info = registry.entries();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].target, config.target());
        assert_eq!(info[0].owner, OWNER);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (listener, config) = target().await;
        let registry = registry();

        let a = registry.create(config.clone(), OWNER).await.unwrap();
        let b = registry.create(config, OWNER).await.unwrap();
        let _pa = listener.accept().await.unwrap();
        let _pb = listener.accept().await.unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_create_unreachable_stores_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let registry = registry();
        let result = registry
            .create(ConnectionConfig::new("127.0.0.1", port), OWNER)
            .await;

        assert!(matches!(result, Err(ServerError::ConnectFailed(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_unknown_and_foreign() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let _peer = listener.accept().await.unwrap();

        assert!(matches!(
            registry.lookup("no-such-id", OWNER),
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            registry.lookup(&id, STRANGER),
            Err(ServerError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_write_reaches_target() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let entry = registry.lookup(&id, OWNER).unwrap();
        let payload: Vec<u8> = (0..100u8).collect();
        entry.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_read_returns_ready_bytes() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(b"AB").await.unwrap();

        let entry = registry.lookup(&id, OWNER).unwrap();
        let bytes = entry.read_available(Duration::from_secs(5)).await.unwrap();
        assert_eq!(bytes, b"AB");
    }

    #[tokio::test]
    async fn test_read_is_bounded_by_scratch_size() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let payload: Vec<u8> = (0..40u8).collect();
        peer.write_all(&payload).await.unwrap();

        let entry = registry.lookup(&id, OWNER).unwrap();
        let mut received = Vec::new();
        while received.len() < payload.len() {
            let chunk = entry.read_available(Duration::from_secs(5)).await.unwrap();
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 16);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_read_times_out_empty() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let entry = registry.lookup(&id, OWNER).unwrap();
        let started = std::time::Instant::now();
        let bytes = entry
            .read_available(Duration::from_millis(200))
            .await
            .unwrap();

        assert!(bytes.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_read_end_of_stream() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(b"bye").await.unwrap();
        drop(peer);

        let entry = registry.lookup(&id, OWNER).unwrap();
        let mut received = Vec::new();
        loop {
            match entry.read_available(Duration::from_secs(5)).await {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(ServerError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(received, b"bye");

        // End of stream is sticky
        assert!(matches!(
            entry.read_available(Duration::from_secs(1)).await,
            Err(ServerError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (listener, config) = target().await;
        let registry = Arc::new(registry());
        let id = registry.create(config, OWNER).await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let entry = registry.lookup(&id, OWNER).unwrap();
        let reader = tokio::spawn(async move {
            entry.read_available(Duration::from_secs(30)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.remove(&id).await);

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("pending read was not woken")
            .unwrap();
        assert!(matches!(result, Err(ServerError::NotFound)));
    }

    #[tokio::test]
    async fn test_remove_closes_once() {
        let (listener, config) = target().await;
        let registry = registry();
        let id = registry.create(config, OWNER).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let entry = registry.lookup(&id, OWNER).unwrap();
        assert!(registry.remove(&id).await);
        assert!(!registry.remove(&id).await);
        assert!(registry.is_empty());
        assert!(entry.is_closed());
        assert!(!entry.close().await.unwrap());

        // Calls on a stale handle never touch the closed socket
        assert!(matches!(entry.write_all(b"x").await, Err(ServerError::NotFound)));

        // Target sees end of stream
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_all() {
        let (listener, config) = target().await;
        let registry = registry();
        registry.create(config.clone(), OWNER).await.unwrap();
        registry.create(config, STRANGER).await.unwrap();
        let _pa = listener.accept().await.unwrap();
        let _pb = listener.accept().await.unwrap();

        let report = registry.drain_all().await;
        assert_eq!(report, CleanReport { closed: 2, errored: 0 });
        assert!(registry.is_empty());

        assert_eq!(registry.drain_all().await, CleanReport::default());
    }

    #[tokio::test]
    async fn test_drain_all_counts_close_errors() {
        let (listener, config) = target().await;
        let registry = registry();

        registry.create(config.clone(), OWNER).await.unwrap();
        let (_healthy, _) = listener.accept().await.unwrap();
        let reset_id = registry.create(config, OWNER).await.unwrap();
        let (reset_peer, _) = listener.accept().await.unwrap();

        // Abortive close: the target answers with RST, so the entry's
        // socket is dead and shutting down its write half fails
        #[allow(deprecated)]
        reset_peer.set_linger(Some(Duration::ZERO)).unwrap();
        drop(reset_peer);

        let entry = registry.lookup(&reset_id, OWNER).unwrap();
        let observed = entry.read_available(Duration::from_secs(5)).await;
        assert!(observed.is_err());
        drop(entry);

        let report = registry.drain_all().await;
        assert_eq!(report, CleanReport { closed: 2, errored: 1 });
        assert_eq!(report.to_string(), "2 connection(s) closed (1 with error)");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clean_report_display() {
        let report = CleanReport { closed: 2, errored: 1 };
        assert_eq!(report.to_string(), "2 connection(s) closed (1 with error)");
        assert_eq!(
            CleanReport::default().to_string(),
            "0 connection(s) closed (0 with error)"
        );
    }
}
