//! TCP command server and client
//!
//! Each connection carries exactly one request line: the server reads up
//! to the first newline (or EOF, capped at [`MAX_REQUEST_SIZE`] bytes),
//! answers, and closes. Connections are
//! handled on their own tasks so a slow caller never blocks another.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::command::{execute, CommandRequest, MAX_REQUEST_SIZE, UNKNOWN_RESPONSE};
use crate::engine::EngineHandle;

/// How long a caller has to send its request
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Round-trip budget for [`send_command`]
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default listen address
pub const DEFAULT_ADDR: &str = "127.0.0.1:65432";

pub struct CommandServer {
    listener: TcpListener,
    read_timeout: Duration,
}

impl CommandServer {
    /// Bind the listener. Failure here is fatal for the daemon.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            read_timeout: READ_TIMEOUT,
        })
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, handle: EngineHandle, cancel: CancellationToken, tracker: TaskTracker) {
        match self.local_addr() {
            Ok(addr) => info!("Command server listening on {}", addr),
            Err(e) => warn!("Command server listening (address unknown: {})", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let handle = handle.clone();
                    let read_timeout = self.read_timeout;
                    tracker.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &handle, read_timeout).await {
                            debug!(%peer, "Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Command server stopped");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handle: &EngineHandle,
    read_timeout: Duration,
) -> io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_SIZE as u64));
    let mut buf = Vec::with_capacity(64);

    // One line, or everything up to EOF / the size cap
    let n = match tokio::time::timeout(read_timeout, reader.read_until(b'\n', &mut buf)).await {
        Ok(read) => read?,
        Err(_) => {
            info!(%peer, "No request within {:?}, dropping connection", read_timeout);
            return Ok(());
        }
    };

    if n == 0 {
        debug!(%peer, "Connection closed without a request");
        return Ok(());
    }

    let response = match std::str::from_utf8(&buf) {
        Ok(text) => {
            let request = CommandRequest::parse(text);
            if request.mutates() {
                info!(%peer, %request, "Command received");
            } else {
                debug!(%peer, %request, raw = text.trim(), "Query received");
            }
            execute(handle, request).await
        }
        Err(_) => {
            info!(%peer, bytes = n, "Non-text request");
            UNKNOWN_RESPONSE.to_string()
        }
    };

    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Send one request and return the response text.
///
/// The whole round trip is bounded by [`CLIENT_TIMEOUT`].
pub async fn send_command(addr: impl ToSocketAddrs, request: &str) -> io::Result<String> {
    let round_trip = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, io::Error>(String::from_utf8_lossy(&response).into_owned())
    };

    tokio::time::timeout(CLIENT_TIMEOUT, round_trip)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {:?}", CLIENT_TIMEOUT),
            )
        })?
}

#[cfg(all(test, feature = "test-source"))]
mod tests {
    use super::*;
    use crate::capture::SyntheticSource;
    use crate::engine::{Engine, EngineConfig};
    use crate::notify::{Dispatcher, LogSink};
    use crate::recording::{ArtifactConfig, ArtifactStore};
    use crate::signal::SilentSignal;
    use crate::{Resolution, Settings};
    use std::sync::Arc;

    async fn serve(
        read_timeout: Duration,
    ) -> (SocketAddr, EngineHandle, CancellationToken, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let artifacts = ArtifactStore::new(ArtifactConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(LogSink), Arc::new(artifacts), tracker.clone());
        let (source, _control) = SyntheticSource::new(Resolution::new(32, 24));
        let (engine, handle) = Engine::new(
            EngineConfig::default(),
            Settings::default(),
            source,
            dispatcher,
            Arc::new(SilentSignal::default()),
        );
        tracker.spawn(engine.run(cancel.clone()));

        let server = CommandServer::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_read_timeout(read_timeout);
        let addr = server.local_addr().unwrap();
        tracker.spawn(server.run(handle.clone(), cancel.clone(), tracker.clone()));

        (addr, handle, cancel, dir)
    }

    #[tokio::test]
    async fn schedule_round_trip() {
        let (addr, _handle, cancel, _dir) = serve(READ_TIMEOUT).await;
        let response = send_command(addr, "schedule").await.unwrap();
        assert_eq!(response, "Schedule Settings:\nArm Time: 21:00\nDisarm Time: 7:00");
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_and_binary_requests() {
        let (addr, _handle, cancel, _dir) = serve(READ_TIMEOUT).await;
        assert_eq!(send_command(addr, "open the pod bay doors").await.unwrap(), "Unknown command");

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0xff, 0xfe, 0x00, b'\n']).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "Unknown command");
        cancel.cancel();
    }

    #[tokio::test]
    async fn request_split_across_writes() {
        let (addr, handle, cancel, _dir) = serve(READ_TIMEOUT).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"alarm").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(b" on\n").await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "Alarm activated");
        assert!(handle.status().await.unwrap().alarm.state.is_armed());
        cancel.cancel();
    }

    #[tokio::test]
    async fn line_is_answered_without_closing_write_side() {
        let (addr, _handle, cancel, _dir) = serve(READ_TIMEOUT).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"schedule\n").await.unwrap();
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("Schedule Settings:"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn silent_caller_is_dropped() {
        let (addr, _handle, cancel, _dir) = serve(Duration::from_millis(100)).await;

        let mut silent = TcpStream::connect(addr).await.unwrap();
        // Others are served while the silent caller waits
        assert!(send_command(addr, "status").await.unwrap().starts_with("System Status:"));

        let mut response = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), silent.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn client_times_out_on_unresponsive_server() {
        // Accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let err = send_command(addr, "status").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        hold.abort();
    }

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        let first = CommandServer::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap();
        assert!(CommandServer::bind(addr).await.is_err());
    }
}
