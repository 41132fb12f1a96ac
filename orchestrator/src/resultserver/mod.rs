/// Result server receiving telemetry streamed by guest agents
///
/// One listener for the whole process. Every accepted connection gets its
/// own task running a [`ResultHandler`]; the only state shared between
/// handlers is the [`HandlerRegistry`], used to broadcast a stop request.
/// The source address of a connection decides where its artifacts land,
/// through a [`StoragePathResolver`].

pub mod handler;
pub mod protocol;
pub mod registry;

pub use handler::ResultHandler;
pub use protocol::{Frame, OpenProcess, Protocol};
pub use registry::HandlerRegistry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shared::{DetectorError, ErrorClass, Result};

use crate::config::ResultServerConfig;

/// Maps a connection's source address to its task storage path
#[async_trait]
pub trait StoragePathResolver: Send + Sync {
    async fn resolve(&self, peer: IpAddr) -> Option<PathBuf>;
}

/// Running analyses by guest address
#[derive(Debug)]
pub struct AnalysisTasks {
    analyses_path: PathBuf,
    tasks: RwLock<HashMap<IpAddr, i64>>,
}

impl AnalysisTasks {
    pub fn new(analyses_path: impl Into<PathBuf>) -> Self {
        Self {
            analyses_path: analyses_path.into(),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, task_id: i64, ip: IpAddr) {
        self.tasks.write().await.insert(ip, task_id);
    }

    pub async fn remove(&self, ip: IpAddr) -> Option<i64> {
        self.tasks.write().await.remove(&ip)
    }

    pub async fn task_for(&self, ip: IpAddr) -> Option<i64> {
        self.tasks.read().await.get(&ip).copied()
    }
}

#[async_trait]
impl StoragePathResolver for AnalysisTasks {
    async fn resolve(&self, peer: IpAddr) -> Option<PathBuf> {
        self.task_for(peer)
            .await
            .map(|id| self.analyses_path.join(id.to_string()))
    }
}

pub struct ResultServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    tasks: Arc<AnalysisTasks>,
    handlers: HandlerRegistry,
    cancel: CancellationToken,
    upload_max: u64,
}

impl ResultServer {
    /// Bind the listener, moving to the next port while the address is in use.
    pub async fn bind(config: &ResultServerConfig, analyses_path: impl Into<PathBuf>) -> Result<Self> {
        let listener = bind_with_retries(config.ip, config.port, config.port_retries).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Result server listening");

        let cancel = CancellationToken::new();
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            tasks: Arc::new(AnalysisTasks::new(analyses_path)),
            handlers: HandlerRegistry::with_parent(cancel.clone()),
            cancel,
            upload_max: config.upload_max_bytes,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn tasks(&self) -> &Arc<AnalysisTasks> {
        &self.tasks
    }

    /// Route connections from `ip` to the storage of `task_id`.
    pub async fn add_task(&self, task_id: i64, ip: IpAddr) {
        debug!(task_id, ip = %ip, "Result server tracking task");
        self.tasks.add(task_id, ip).await;
    }

    pub async fn del_task(&self, ip: IpAddr) {
        if let Some(task_id) = self.tasks.remove(ip).await {
            debug!(task_id, ip = %ip, "Result server released task");
        }
    }

    /// Wait until no handler serves `ip`, at most `limit`.
    pub async fn wait_idle(&self, ip: IpAddr, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.handlers.count_for(ip) == 0 {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_secs(1))).await;
        }
    }

    /// Start the accept loop in the background.
    pub async fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| DetectorError::Operational("result server already running".to_string()))?;

        let server = Arc::clone(self);
        Ok(tokio::spawn(async move { server.accept_loop(listener).await }))
    }

    /// Stop accepting and ask every live handler to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.handlers.cancel_all();
        info!("Result server stopping");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle(stream, peer).await });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
        debug!("Result server accept loop finished");
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(storage) = self.tasks.resolve(peer.ip()).await else {
            debug!(peer = %peer, "Connection from unknown source dropped");
            return;
        };

        let registration = self.handlers.register(peer);
        let handler = ResultHandler::new(stream, peer, storage, registration.token(), self.upload_max);

        match handler.run().await {
            Ok(()) => debug!(peer = %peer, "Connection closed"),
            Err(e) => match e.class() {
                ErrorClass::Protocol => warn!(peer = %peer, error = %e, "Protocol error, connection closed"),
                _ => error!(peer = %peer, error = %e, "Connection handler failed"),
            },
        }
        drop(registration);
    }
}

async fn bind_with_retries(ip: IpAddr, port: u16, retries: u16) -> Result<TcpListener> {
    let mut port = port;
    let mut remaining = retries;
    loop {
        let addr = SocketAddr::new(ip, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse && remaining > 0 => {
                let next = port.checked_add(1).ok_or_else(|| {
                    DetectorError::Critical(format!("Unable to bind result server on {}: {}", addr, e))
                })?;
                warn!(address = %addr, next_port = next, "Address already in use, retrying");
                port = next;
                remaining -= 1;
            }
            Err(e) => {
                return Err(DetectorError::Critical(format!(
                    "Unable to bind result server on {}: {}",
                    addr, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn local_config(port: u16) -> ResultServerConfig {
        ResultServerConfig {
            ip: "127.0.0.1".parse().unwrap(),
            port,
            port_retries: 8,
            upload_max_bytes: 1024 * 1024,
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_back_to_back_binds_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let first = ResultServer::bind(&local_config(0), dir.path()).await.unwrap();
        let second = ResultServer::bind(&local_config(first.port()), dir.path())
            .await
            .unwrap();
        assert_ne!(first.port(), second.port());
    }

    #[tokio::test]
    async fn test_address_in_use_without_budget_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let first = ResultServer::bind(&local_config(0), dir.path()).await.unwrap();
        let mut config = local_config(first.port());
        config.port_retries = 0;

        let err = ResultServer::bind(&config, dir.path()).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unassigned_address_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(2042);
        config.ip = "192.0.2.1".parse().unwrap();

        let err = ResultServer::bind(&config, dir.path()).await.err().unwrap();
        assert!(matches!(err, DetectorError::Critical(_)));
    }

    #[tokio::test]
    async fn test_resolver_maps_ip_to_task_storage() {
        let tasks = AnalysisTasks::new("/srv/storage/analyses");
        let ip: IpAddr = "192.168.56.101".parse().unwrap();
        assert_eq!(tasks.resolve(ip).await, None);

        tasks.add(42, ip).await;
        assert_eq!(tasks.resolve(ip).await, Some(PathBuf::from("/srv/storage/analyses/42")));
        assert_eq!(tasks.remove(ip).await, Some(42));
        assert_eq!(tasks.resolve(ip).await, None);
    }

    #[tokio::test]
    async fn test_connection_writes_process_log_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ResultServer::bind(&local_config(0), dir.path()).await.unwrap());
        server.add_task(1, "127.0.0.1".parse().unwrap()).await;
        let accept = server.spawn().await.unwrap();

        let mut guest = TcpStream::connect(server.local_addr()).await.unwrap();
        guest.write_all(b"v1\n").await.unwrap();
        let open = Frame::Open(OpenProcess {
            pid: 100,
            ppid: Some(1),
            process_name: "a.exe".to_string(),
            track: true,
        });
        guest.write_all(&open.encode().unwrap()).await.unwrap();
        guest
            .write_all(&Frame::Payload(b"0123456789".to_vec()).encode().unwrap())
            .await
            .unwrap();

        let handlers = server.handlers().clone();
        assert!(eventually(|| handlers.len() == 1).await);
        drop(guest);
        assert!(eventually(|| handlers.is_empty()).await);

        let log = std::fs::read(dir.path().join("1/logs/100.log")).unwrap();
        assert_eq!(log, b"0123456789".to_vec());

        server.stop();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_source_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ResultServer::bind(&local_config(0), dir.path()).await.unwrap());
        let _accept = server.spawn().await.unwrap();

        let mut guest = TcpStream::connect(server.local_addr()).await.unwrap();
        let _ = guest.write_all(b"v1\n").await;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read(&mut guest, &mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(server.handlers().is_empty());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_live_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ResultServer::bind(&local_config(0), dir.path()).await.unwrap());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        server.add_task(5, ip).await;
        let accept = server.spawn().await.unwrap();

        let mut guest = TcpStream::connect(server.local_addr()).await.unwrap();
        guest.write_all(b"v1\n").await.unwrap();
        let handlers = server.handlers().clone();
        assert!(eventually(|| handlers.len() == 1).await);

        server.stop();
        accept.await.unwrap();
        assert!(server.wait_idle(ip, Duration::from_secs(5)).await);
        assert!(server.spawn().await.is_err());
    }
}
