//! AT transcript engine.
//!
//! Serializes AT commands over one serial line: drain leftover unsolicited
//! lines, write `cmd\r\n`, read until `OK`/`ERROR` or timeout. Unsolicited
//! result codes (URCs) seen at any point are routed by prefix into
//! channels, so the modem session can react to `+CMQDISCON:` and friends
//! without polling.
//!
//! The engine is generic over the byte stream: a real serial port in
//! production, a `tokio::io::duplex` pair in tests.

use std::io;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, warn};

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Quiet period that ends the pre-command drain of unsolicited lines.
const DRAIN_DELAY: Duration = Duration::from_millis(50);

type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// The outcome of one AT command.
#[derive(Debug, Clone, Default)]
pub struct AtResponse {
    /// All response lines up to and including `OK`/`ERROR`.
    pub full_response: Vec<String>,
    /// Capture groups of the requested match, restricted to the requested
    /// field indices.
    pub query: Option<Vec<String>>,
    pub success: bool,
}

impl AtResponse {
    fn failed() -> Self {
        Self::default()
    }
}

struct AtInner {
    reader: Reader,
    writer: Writer,
    /// Partial line kept across a cancelled read, so the drain timeout
    /// never loses bytes.
    line_buf: Vec<u8>,
    last_response: Instant,
}

pub struct AtEngine {
    inner: Mutex<AtInner>,
    /// URC prefixes, longest first so the most specific prefix wins.
    urc_channels: Vec<(String, mpsc::Sender<String>)>,
}

impl AtEngine {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Mutex::new(AtInner {
                reader: BufReader::new(Box::new(reader)),
                writer: Box::new(writer),
                line_buf: Vec::new(),
                last_response: Instant::now(),
            }),
            urc_channels: Vec::new(),
        }
    }

    /// Opens the AT serial line: 115200 8N1, no flow control.
    pub fn from_serial(device: &str) -> crate::Result<Self> {
        let port = tokio_serial::new(device, 115200)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(Self::new(port))
    }

    /// Registers an unsolicited-line prefix. Lines starting with `prefix`
    /// are delivered, stripped of it, to the returned channel. Must be
    /// called before the engine is shared.
    pub fn add_urc_channel(&mut self, prefix: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        self.urc_channels.push((prefix.to_owned(), tx));
        self.urc_channels.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        rx
    }

    fn dispatch_urc(&self, line: &str) -> bool {
        for (prefix, tx) in &self.urc_channels {
            if let Some(rest) = line.strip_prefix(prefix.as_str()) {
                if tx.try_send(rest.to_owned()).is_err() {
                    warn!("Unsolicited line dropped, slow consumer: {line}");
                }
                return true;
            }
        }
        false
    }

    /// Time since the modem last answered anything.
    pub async fn last_response_age(&self) -> Duration {
        self.inner.lock().await.last_response.elapsed()
    }

    pub async fn call(&self, command: &str, timeout: Duration) -> AtResponse {
        self.call_impl(command, None, timeout).await
    }

    /// Like [`Self::call`], additionally matching `pattern` against every
    /// response line. On a match, capture groups end up in
    /// [`AtResponse::query`]; with `fields` given, the first group is
    /// split on commas and only those indices are kept.
    pub async fn call_match(
        &self,
        command: &str,
        pattern: &str,
        fields: &[usize],
        timeout: Duration,
    ) -> AtResponse {
        self.call_impl(command, Some((pattern, fields)), timeout).await
    }

    async fn call_impl(
        &self,
        command: &str,
        matcher: Option<(&str, &[usize])>,
        timeout: Duration,
    ) -> AtResponse {
        let full_response = match self.exchange(command, timeout).await {
            Ok(lines) => lines,
            Err(err) => {
                error!("{command} failed: {err}");
                return AtResponse::failed();
            }
        };
        debug!("{command}: {full_response:?}");

        let mut res = AtResponse {
            full_response,
            query: None,
            success: false,
        };
        if res.full_response.last().map(String::as_str) == Some("ERROR") {
            return res;
        }
        let Some((pattern, fields)) = matcher else {
            res.success = true;
            return res;
        };

        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => {
                error!("Invalid AT match pattern {pattern}: {err}");
                return res;
            }
        };
        for line in &res.full_response {
            let Some(caps) = regex.captures(line) else {
                continue;
            };
            let mut query = Vec::new();
            for group in caps.iter().skip(1).flatten() {
                if fields.is_empty() {
                    query.push(group.as_str().to_owned());
                } else {
                    let split: Vec<&str> = group.as_str().split(',').collect();
                    query = fields
                        .iter()
                        .filter_map(|&idx| split.get(idx))
                        .map(|s| (*s).to_owned())
                        .collect();
                }
            }
            res.query = Some(query);
            res.success = true;
            return res;
        }
        res
    }

    async fn exchange(&self, command: &str, timeout: Duration) -> crate::Result<Vec<String>> {
        let mut inner = self.inner.lock().await;

        let AtInner {
            reader,
            writer,
            line_buf,
            last_response,
        } = &mut *inner;

        // Residual unsolicited lines from before this command
        loop {
            match tokio::time::timeout(DRAIN_DELAY, read_line(reader, line_buf)).await {
                Ok(Ok(Some(line))) => {
                    if !line.is_empty() && !self.dispatch_urc(&line) {
                        debug!("Discarding stale line: {line}");
                    }
                }
                Ok(Ok(None)) => {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => break,
            }
        }

        writer.write_all(format!("{command}\r\n").as_bytes()).await?;
        writer.flush().await?;

        let result = tokio::time::timeout(timeout, async {
            let mut full_response: Vec<String> = Vec::new();
            loop {
                match read_line(reader, line_buf).await? {
                    None => {
                        return Err(crate::Error::from(io::Error::from(
                            io::ErrorKind::UnexpectedEof,
                        )))
                    }
                    Some(line) => {
                        if line.is_empty() {
                            continue;
                        }
                        self.dispatch_urc(&line);
                        let done = line == "OK" || line == "ERROR";
                        full_response.push(line);
                        if done {
                            return Ok(full_response);
                        }
                    }
                }
            }
        })
        .await;
        *last_response = Instant::now();

        match result {
            Ok(lines) => lines,
            Err(_) => Err(crate::Error::AtTimeout),
        }
    }
}

/// Reads one line, accumulating partial reads in `acc`. Built on
/// `fill_buf` so that cancellation (the drain timeout) never drops bytes.
async fn read_line(reader: &mut Reader, acc: &mut Vec<u8>) -> crate::Result<Option<String>> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(None);
        }
        match buf.iter().position(|&byte| byte == b'\n') {
            Some(pos) => {
                acc.extend_from_slice(&buf[..=pos]);
                reader.consume(pos + 1);
                let line = String::from_utf8_lossy(acc).trim().to_owned();
                acc.clear();
                return Ok(Some(line));
            }
            None => {
                let len = buf.len();
                acc.extend_from_slice(buf);
                reader.consume(len);
            }
        }
    }
}

#[cfg(test)]
mod test_at {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn expect_command(server: &mut tokio::io::DuplexStream, expected: &str, reply: &[u8]) {
        let mut buf = vec![0u8; 256];
        let mut received = String::new();
        while !received.ends_with("\r\n") {
            let n = server.read(&mut buf).await.unwrap();
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert_eq!(received.trim_end(), expected);
        server.write_all(reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_match() {
        let (client, mut server) = tokio::io::duplex(1024);
        let engine = AtEngine::new(client);
        tokio::spawn(async move {
            expect_command(&mut server, "AT+CEREG?", b"+CEREG: 3,5\r\nOK\r\n").await;
        });

        let response = engine
            .call_match("AT+CEREG?", "CEREG: ([0123]),([15])", &[], Duration::from_secs(1))
            .await;
        assert!(response.success);
        assert_eq!(
            response.query,
            Some(vec!["3".to_owned(), "5".to_owned()])
        );
    }

    #[tokio::test]
    async fn test_field_selection() {
        let (client, mut server) = tokio::io::duplex(1024);
        let engine = AtEngine::new(client);
        tokio::spawn(async move {
            expect_command(
                &mut server,
                "AT+CENG?",
                b"+CENG: 0,1,2,\"0x12AB\",4,5,6,-70,8\r\nOK\r\n",
            )
            .await;
        });

        let response = engine
            .call_match("AT+CENG?", "CENG: (.*)", &[6, 3], Duration::from_secs(1))
            .await;
        assert!(response.success);
        assert_eq!(
            response.query,
            Some(vec!["6".to_owned(), "\"0x12AB\"".to_owned()])
        );
    }

    #[tokio::test]
    async fn test_error_response() {
        let (client, mut server) = tokio::io::duplex(1024);
        let engine = AtEngine::new(client);
        tokio::spawn(async move {
            expect_command(&mut server, "AT+CMQNEW?", b"ERROR\r\n").await;
        });

        let response = engine.call("AT+CMQNEW?", Duration::from_secs(1)).await;
        assert!(!response.success);
        assert_eq!(response.full_response, vec!["ERROR".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (client, mut server) = tokio::io::duplex(1024);
        let engine = AtEngine::new(client);
        tokio::spawn(async move {
            // Swallow the command, never answer
            let mut buf = vec![0u8; 64];
            let _ = server.read(&mut buf).await;
            std::future::pending::<()>().await;
        });

        let response = engine.call("AT", Duration::from_millis(100)).await;
        assert!(!response.success);
        assert!(response.full_response.is_empty());
    }

    #[tokio::test]
    async fn test_urc_dispatch() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut engine = AtEngine::new(client);
        let mut discon = engine.add_urc_channel("+CMQDISCON:");
        tokio::spawn(async move {
            expect_command(&mut server, "AT", b"+CMQDISCON: 0\r\nOK\r\n").await;
        });

        let response = engine.call("AT", Duration::from_secs(1)).await;
        assert!(response.success);
        assert_eq!(discon.recv().await.unwrap().trim(), "0");
    }
}
