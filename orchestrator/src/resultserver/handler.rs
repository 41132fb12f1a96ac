use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shared::{DetectorError, Result};

use super::protocol::{Frame, OpenProcess, Protocol, FRAME_HEADER_LEN};
use crate::utils;

/// Largest single read issued against the socket.
pub const BUFSIZE: usize = 16 * 1024;

/// Upper bound on the socket wait between two cancellation checks.
pub const READ_POLL: Duration = Duration::from_secs(1);

const MAX_NEGOTIATION_LEN: usize = 256;

const STORAGE_FOLDERS: &[&str] = &["logs", "shots", "files", "buffer"];

/// A log file that stops accepting bytes past a size limit
#[derive(Debug)]
struct CappedLog {
    path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
    capped: bool,
}

impl CappedLog {
    async fn create(path: PathBuf, limit: u64) -> Result<Self> {
        let file = File::create(&path).await?;
        Ok(Self::new(path, file, limit))
    }

    async fn append(path: PathBuf, limit: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self::new(path, file, limit))
    }

    fn new(path: PathBuf, file: File, limit: u64) -> Self {
        Self {
            path,
            file,
            written: 0,
            limit,
            capped: false,
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let room = self.limit.saturating_sub(self.written);
        let take = (data.len() as u64).min(room) as usize;
        if take > 0 {
            self.file.write_all(&data[..take]).await?;
            self.written += take as u64;
        }
        if take < data.len() && !self.capped {
            self.capped = true;
            warn!(
                path = %self.path.display(),
                limit = self.limit,
                "Log reached the upload limit, discarding further data"
            );
        }
        Ok(())
    }

    async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

#[derive(Debug)]
struct ProcessLog {
    record: OpenProcess,
    log: CappedLog,
}

/// Serves one guest connection
///
/// Owns the connection session: the storage path, the negotiated protocol,
/// bytes buffered before any process announced itself, and at most one
/// open process log.
pub struct ResultHandler<S> {
    stream: S,
    peer: SocketAddr,
    storage: PathBuf,
    cancel: CancellationToken,
    upload_max: u64,
    protocol: Option<Protocol>,
    startbuf: Vec<u8>,
    process: Option<ProcessLog>,
    analysis_log: Option<CappedLog>,
}

impl<S> ResultHandler<S>
where
    S: AsyncRead + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        storage: PathBuf,
        cancel: CancellationToken,
        upload_max: u64,
    ) -> Self {
        Self {
            stream,
            peer,
            storage,
            cancel,
            upload_max,
            protocol: None,
            startbuf: Vec::new(),
            process: None,
            analysis_log: None,
        }
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Drive the connection to its end. Disconnects are a normal exit.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.serve().await;
        let finished = self.finish().await;

        match outcome {
            Err(e) if e.is_disconnect() => finished,
            Err(e) => Err(e),
            Ok(()) => finished,
        }
    }

    async fn serve(&mut self) -> Result<()> {
        self.create_folders().await?;

        let protocol = self.negotiate().await?;
        debug!(peer = %self.peer, ?protocol, "Protocol negotiated");

        match protocol {
            Protocol::Framed => self.serve_frames().await,
            Protocol::AnalysisLog => self.serve_analysis_log().await,
        }
    }

    pub async fn create_folders(&self) -> Result<()> {
        utils::create_folders(&self.storage, STORAGE_FOLDERS).await
    }

    /// Read exactly `length` bytes, or fail with a disconnect.
    pub async fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(length.min(BUFSIZE));
        let mut chunk = vec![0u8; length.min(BUFSIZE)];

        while buf.len() < length {
            let want = (length - buf.len()).min(BUFSIZE);
            let n = self.poll_read(&mut chunk[..want]).await?;
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf)
    }

    /// Whatever is available, up to [`BUFSIZE`] bytes.
    pub async fn read_any(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; BUFSIZE];
        let n = self.poll_read(&mut chunk).await?;
        chunk.truncate(n);
        Ok(chunk)
    }

    /// Bytes up to the next newline, newline excluded.
    pub async fn read_newline(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let byte = self.read(1).await?;
            if byte[0] == b'\n' {
                return Ok(line);
            }
            if line.len() >= MAX_NEGOTIATION_LEN {
                return Err(DetectorError::Result(format!(
                    "no newline within {} bytes",
                    MAX_NEGOTIATION_LEN
                )));
            }
            line.push(byte[0]);
        }
    }

    /// One read of at least one byte, checking for cancellation every poll.
    async fn poll_read(&mut self, chunk: &mut [u8]) -> Result<usize> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(DetectorError::Disconnect);
            }
            match tokio::time::timeout(READ_POLL, self.stream.read(chunk)).await {
                Err(_elapsed) => continue,
                Ok(Ok(0)) => return Err(DetectorError::Disconnect),
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
                    ) =>
                {
                    return Err(DetectorError::Disconnect)
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn negotiate(&mut self) -> Result<Protocol> {
        let line = self.read_newline().await?;
        let token = String::from_utf8_lossy(&line);
        let protocol = Protocol::from_token(&token)?;
        self.protocol = Some(protocol);
        Ok(protocol)
    }

    async fn serve_frames(&mut self) -> Result<()> {
        loop {
            let raw = self.read(FRAME_HEADER_LEN).await?;
            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&raw);

            let len = Frame::body_len(&header)?;
            let body = self.read(len).await?;

            match Frame::parse(header[0], body)? {
                Frame::Open(record) => self.open_process_log(record).await?,
                Frame::Payload(bytes) => self.write_payload(&bytes).await?,
                Frame::Close => self.close_process_log().await?,
            }
        }
    }

    async fn serve_analysis_log(&mut self) -> Result<()> {
        let path = self.storage.join("analysis.log");
        self.analysis_log = Some(CappedLog::append(path, self.upload_max).await?);

        loop {
            let data = self.read_any().await?;
            if let Some(log) = self.analysis_log.as_mut() {
                log.write(&data).await?;
            }
        }
    }

    /// Open `logs/<pid>.log` for the announced process.
    ///
    /// Only one process log may be open per connection.
    pub async fn open_process_log(&mut self, record: OpenProcess) -> Result<()> {
        if let Some(open) = &self.process {
            return Err(DetectorError::Result(format!(
                "only one process log per connection: pid {} is still open, pid {} announced",
                open.record.pid, record.pid
            )));
        }

        let path = self.storage.join("logs").join(format!("{}.log", record.pid));
        let mut log = CappedLog::create(path, self.upload_max).await?;
        if !self.startbuf.is_empty() {
            let buffered = std::mem::take(&mut self.startbuf);
            log.write(&buffered).await?;
        }

        info!(
            peer = %self.peer,
            pid = record.pid,
            ppid = ?record.ppid,
            process = %record.process_name,
            track = record.track,
            "New process"
        );
        self.process = Some(ProcessLog { record, log });
        Ok(())
    }

    async fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        match self.process.as_mut() {
            Some(process) => process.log.write(data).await,
            None => {
                let room = (self.upload_max as usize).saturating_sub(self.startbuf.len());
                self.startbuf.extend_from_slice(&data[..data.len().min(room)]);
                Ok(())
            }
        }
    }

    async fn close_process_log(&mut self) -> Result<()> {
        if let Some(process) = self.process.take() {
            debug!(peer = %self.peer, pid = process.record.pid, "Process log closed");
            process.log.close().await?;
        }
        Ok(())
    }

    /// Close every file still open. Runs on every exit path.
    pub async fn finish(&mut self) -> Result<()> {
        let process = self.close_process_log().await;
        let analysis = match self.analysis_log.take() {
            Some(log) => log.close().await,
            None => Ok(()),
        };
        process.and(analysis)
    }
}
