//! TCP front-end for the engine.
//!
//! Frames are separated by a single carriage-return byte, no line feed. Each
//! connection is served by its own task: read bytes up to `\r`, parse,
//! dispatch to the engine, write the response followed by `\r`. Values are
//! arbitrary bytes, so the response for a `read` is raw value bytes.

pub mod protocol;

use crate::engine::Engine;
use crate::error::Result;
use crate::Error;
use protocol::Command;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;

pub struct Server {
    engine: Arc<Engine>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Binds the listener. Failing to bind is fatal to the caller.
    pub async fn bind(addr: impl ToSocketAddrs, engine: Arc<Engine>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        tracing::info!(addr = %listener.local_addr()?, "server listening");
        Ok(Self {
            engine,
            listener,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle that stops the accept loop (and every connection task) when
    /// sent to.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accepts connections until shutdown is signalled. In-flight commands
    /// run to completion; connection tasks exit at their next frame
    /// boundary.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "client connected");
                            let engine = self.engine.clone();
                            let shutdown = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(engine, stream, shutdown).await {
                                    tracing::debug!(%peer, error = %e, "connection error");
                                }
                                tracing::debug!(%peer, "client disconnected");
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept failed"),
                    }
                }

                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::new();

    loop {
        frame.clear();
        let n = tokio::select! {
            n = reader.read_until(b'\r', &mut frame) => n?,
            _ = shutdown.recv() => return Ok(()),
        };
        if n == 0 {
            return Ok(()); // client closed the connection
        }
        match frame.last() {
            Some(&b'\r') => {
                frame.pop();
            }
            // Unterminated bytes at EOF are not a command.
            _ => return Ok(()),
        }
        if frame.is_empty() {
            continue;
        }

        let response = execute(&engine, &frame);
        write_half.write_all(&response).await?;
        write_half.write_all(b"\r").await?;
    }
}

/// Parses and dispatches one frame, formatting the response per the wire
/// contract: `success`/value bytes/joined lists on the happy path, `error`
/// for an absent key or failed delete, `error: <msg>` otherwise.
fn execute(engine: &Engine, frame: &[u8]) -> Vec<u8> {
    let command = match protocol::parse(frame) {
        Ok(command) => command,
        Err(e) => return error_response(e),
    };

    match command {
        Command::Write { key, value } => match engine.put(&key, value) {
            Ok(()) => b"success".to_vec(),
            Err(e) => error_response(e),
        },

        Command::Read { key } => match engine.get(&key) {
            Ok(Some(value)) => value,
            Ok(None) => b"error".to_vec(),
            Err(e) => error_response(e),
        },

        Command::Delete { key } => match engine.delete(&key) {
            Ok(true) => b"success".to_vec(),
            Ok(false) => b"error".to_vec(),
            Err(e) => error_response(e),
        },

        Command::Keys => match engine.keys() {
            Ok(keys) => keys.join(&b"\r"[..]),
            Err(e) => error_response(e),
        },

        Command::PrefixScan { prefix } => match engine.prefix_scan(&prefix) {
            Ok(values) => values.join(&b"\r"[..]),
            Err(e) => error_response(e),
        },

        Command::Status => match engine.stats() {
            Ok(stats) => format!(
                "well going our operation\nwrites={} reads={} deletes={} flushes={} memtable_size={} sst_count={} wal_size={}",
                stats.writes,
                stats.reads,
                stats.deletes,
                stats.flushes,
                stats.memstore_size,
                stats.segment_count,
                stats.wal_size,
            )
            .into_bytes(),
            Err(e) => error_response(e),
        },
    }
}

fn error_response(e: Error) -> Vec<u8> {
    match e {
        // User-facing validation and parse errors carry their message bare.
        Error::InvalidInput(msg) => format!("error: {msg}").into_bytes(),
        other => format!("error: {other}").into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct Client {
        stream: TcpStream,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            Self { stream }
        }

        /// Sends a command and reads exactly `len` response bytes
        /// (including the trailing separator).
        async fn send(&mut self, command: &str, len: usize) -> Vec<u8> {
            self.stream.write_all(command.as_bytes()).await.unwrap();
            self.stream.write_all(b"\r").await.unwrap();
            let mut buf = vec![0u8; len];
            self.stream.read_exact(&mut buf).await.unwrap();
            buf
        }

        /// Sends a command and reads up to the first `\r`. Only valid for
        /// responses that cannot contain an embedded separator.
        async fn send_line(&mut self, command: &str) -> String {
            self.stream.write_all(command.as_bytes()).await.unwrap();
            self.stream.write_all(b"\r").await.unwrap();
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                self.stream.read_exact(&mut byte).await.unwrap();
                if byte[0] == b'\r' {
                    break;
                }
                response.push(byte[0]);
            }
            String::from_utf8(response).unwrap()
        }
    }

    async fn start_server(dir: &TempDir) -> (SocketAddr, broadcast::Sender<()>, Arc<Engine>) {
        let engine = Engine::open(Config::new(dir.path())).unwrap();
        let server = Server::bind("127.0.0.1:0", engine.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.run());
        (addr, shutdown, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wire_protocol_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (addr, shutdown, engine) = start_server(&dir).await;
        let mut client = Client::connect(addr).await;

        assert_eq!(client.send_line("write a|1").await, "success");
        assert_eq!(client.send_line("keys").await, "a");
        assert_eq!(client.send_line("read a").await, "1");
        assert_eq!(client.send_line("read missing").await, "error");

        // Values keep their pipes; only the first one separates.
        assert_eq!(client.send_line("write p|x|y").await, "success");
        assert_eq!(client.send_line("read p").await, "x|y");

        assert_eq!(client.send_line("delete a").await, "success");
        assert_eq!(client.send_line("read a").await, "error");
        assert_eq!(client.send_line("delete a").await, "error");

        assert_eq!(
            client.send_line("bogus command").await,
            "error: unknown command"
        );
        assert_eq!(
            client.send_line("write bad*key|v").await,
            "error: invalid key format"
        );

        let _ = shutdown.send(());
        engine.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefix_scan_over_wire() {
        let dir = TempDir::new().unwrap();
        let (addr, shutdown, engine) = start_server(&dir).await;
        let mut client = Client::connect(addr).await;

        assert_eq!(client.send_line("write user:a|A").await, "success");
        assert_eq!(client.send_line("write user:b|B").await, "success");
        assert_eq!(client.send_line("write other|X").await, "success");

        // "A\rB\r" or "B\rA\r"; order is unspecified.
        let response = client.send("reads user:", 4).await;
        assert!(response == b"A\rB\r" || response == b"B\rA\r");

        let _ = shutdown.send(());
        engine.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_counters_over_wire() {
        let dir = TempDir::new().unwrap();
        let (addr, shutdown, engine) = start_server(&dir).await;
        let mut client = Client::connect(addr).await;

        assert_eq!(client.send_line("write k|v").await, "success");
        assert_eq!(client.send_line("read k").await, "v");
        assert_eq!(client.send_line("read k").await, "v");
        assert_eq!(client.send_line("delete k").await, "success");

        let status = client.send_line("status").await;
        let mut lines = status.split('\n');
        assert_eq!(lines.next(), Some("well going our operation"));
        let counters = lines.next().unwrap();
        assert!(counters.starts_with("writes=1 reads=2 deletes=1 flushes=0"));
        assert!(counters.contains("sst_count=0"));

        let _ = shutdown.send(());
        engine.close().await.unwrap();
    }
}
