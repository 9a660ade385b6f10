//! Byte-stream transport for the session protocol.
//!
//! The engine only needs a duplex stream of length-delimited JSON events;
//! where that stream comes from (and how it is authenticated) is the
//! connector's concern. The shipped framing is one JSON object per line,
//! which keeps the wire format inspectable with nothing but `nc`.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{SonicError, SonicResult};

/// Write half of the event stream.
#[async_trait]
pub trait EventSink: Send {
    /// Send one encoded event.
    async fn send(&mut self, payload: &[u8]) -> SonicResult<()>;

    /// Flush and close the write half.
    async fn shutdown(&mut self) -> SonicResult<()>;
}

/// Read half of the event stream.
#[async_trait]
pub trait EventSource: Send {
    /// Receive the next encoded event; `None` means the peer closed the
    /// stream cleanly.
    async fn next_event(&mut self) -> SonicResult<Option<Vec<u8>>>;
}

/// Establishes the transport. Credential and endpoint resolution live behind
/// this trait so the engine never touches the environment.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> SonicResult<(Box<dyn EventSink>, Box<dyn EventSource>)>;
}

/// Newline-delimited JSON writer over any async byte sink.
pub struct JsonLineSink<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for JsonLineSink<W> {
    async fn send(&mut self, payload: &[u8]) -> SonicResult<()> {
        self.writer.write_all(payload).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> SonicResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Newline-delimited JSON reader over any async byte source.
pub struct JsonLineSource<R> {
    reader: BufReader<R>,
    line: String,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for JsonLineSource<R> {
    async fn next_event(&mut self) -> SonicResult<Option<Vec<u8>>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(trimmed.as_bytes().to_vec()));
        }
    }
}

/// Split a duplex byte stream into line-framed sink and source halves.
pub fn split_stream<S>(stream: S) -> (Box<dyn EventSink>, Box<dyn EventSource>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        Box::new(JsonLineSink { writer: write }),
        Box::new(JsonLineSource {
            reader: BufReader::new(read),
            line: String::new(),
        }),
    )
}

/// Plain TCP connector speaking newline-delimited JSON.
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> SonicResult<(Box<dyn EventSink>, Box<dyn EventSource>)> {
        debug!(endpoint = %self.endpoint, "opening transport");
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| SonicError::Connection(format!("{}: {e}", self.endpoint)))?;
        Ok(split_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_framing_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut sink, _) = split_stream(client);
        let (_, mut source) = split_stream(server);

        sink.send(br#"{"event":{"sessionEnd":{}}}"#).await.unwrap();
        sink.send(br#"{"event":{"promptEnd":{"promptName":"p"}}}"#)
            .await
            .unwrap();

        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first, br#"{"event":{"sessionEnd":{}}}"#.to_vec());
        let second = source.next_event().await.unwrap().unwrap();
        assert!(second.starts_with(br#"{"event":{"promptEnd""#));
    }

    #[tokio::test]
    async fn source_reports_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        let (mut sink, _) = split_stream(client);
        let (_, mut source) = split_stream(server);

        sink.shutdown().await.unwrap();
        drop(sink);
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (client, server) = tokio::io::duplex(256);
        let (mut sink, _) = split_stream(client);
        let (_, mut source) = split_stream(server);

        sink.send(b"").await.unwrap();
        sink.send(br#"{"event":{}}"#).await.unwrap();
        let next = source.next_event().await.unwrap().unwrap();
        assert_eq!(next, br#"{"event":{}}"#.to_vec());
    }
}
