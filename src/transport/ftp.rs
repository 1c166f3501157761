use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use futures::Stream;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream, Take};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tracing::{debug, trace};
use url::Url;

use crate::config::EngineConfig;
use crate::credentials::Credentials;
use crate::descriptor::Mirror;
use crate::error::TransportError;
use crate::transport::{FetchRequest, FetchStream, ResourceInfo, TransportAdapter};

const DEFAULT_FTP_PORT: u16 = 21;

static PASV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").unwrap());

/// Passive-mode FTP. Ranges are served with `REST`; one transfer per control
/// connection, so each mirror gets a single connection.
#[derive(Debug, Clone)]
pub struct FtpTransport {
    reply_timeout: Duration,
}

impl FtpTransport {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            reply_timeout: config.connect_timeout,
        }
    }

    async fn login(&self, url: &Url) -> Result<Control, TransportError> {
        let mut control = Control::connect(url, self.reply_timeout).await?;
        let reply = control.reply().await?;
        control.check(reply, &[220])?;

        let creds = Credentials::from_url_or_anonymous(url);
        let (code, text) = control
            .command(&format!("USER {}", creds.username()))
            .await?;
        match code {
            230 => {}
            331 | 332 => {
                let reply = control
                    .send_secret("PASS", creds.password().unwrap_or_default())
                    .await?;
                control.check(reply, &[230, 202])?;
            }
            _ => return Err(reply_error(code, &text, &control.url)),
        }

        let reply = control.command("TYPE I").await?;
        control.check(reply, &[200])?;
        Ok(control)
    }
}

#[async_trait]
impl TransportAdapter for FtpTransport {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn supports_range(&self) -> bool {
        true
    }

    fn connection_limit(&self) -> Option<u32> {
        Some(1)
    }

    async fn probe(&self, mirror: &Mirror) -> Result<ResourceInfo, TransportError> {
        let mut control = self.login(&mirror.url).await?;
        let path = remote_path(&mirror.url);
        let total_size = control.size(&path).await?;
        let last_modified = control.modified(&path).await?;
        debug!(url = %mirror.url, size = ?total_size, "Probed FTP mirror");
        Ok(ResourceInfo {
            total_size,
            final_url: Some(mirror.url.clone()),
            last_modified,
            supports_range: true,
            ..Default::default()
        })
    }

    async fn open(&self, request: &FetchRequest) -> Result<FetchStream, TransportError> {
        let url = &request.mirror.url;
        let mut control = self.login(url).await?;
        let path = remote_path(url);

        let total_size = control.size(&path).await?;
        if let (Some(total), Some(expected)) = (total_size, request.expected_size) {
            if total != expected {
                return Err(TransportError::size_mismatch(format!(
                    "{} reports {} bytes, expected {}",
                    url, total, expected
                )));
            }
        }

        let data_addr = control.passive().await?;
        let data = timeout(self.reply_timeout, TcpStream::connect(data_addr)).await??;

        if request.range.start > 0 {
            let reply = control
                .command(&format!("REST {}", request.range.start))
                .await?;
            control.check(reply, &[350])?;
        }
        let reply = control.command(&format!("RETR {}", path)).await?;
        control.check(reply, &[125, 150])?;
        trace!(url = %url, start = request.range.start, "FTP transfer started");

        let limit = request.range.len().unwrap_or(u64::MAX);
        Ok(FetchStream {
            info: ResourceInfo {
                total_size,
                final_url: Some(url.clone()),
                supports_range: true,
                ..Default::default()
            },
            body: Box::pin(FtpBody {
                inner: ReaderStream::new(data.take(limit)),
                _control: control,
            }),
        })
    }
}

/// Data connection body. Owns the control connection so the server does not
/// abort the transfer while the body is being read.
struct FtpBody {
    inner: ReaderStream<Take<TcpStream>>,
    _control: Control,
}

impl Stream for FtpBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(|r| r.map_err(TransportError::from)))
    }
}

struct Control {
    stream: BufStream<TcpStream>,
    peer: SocketAddr,
    url: String,
    reply_timeout: Duration,
}

impl Control {
    async fn connect(url: &Url, reply_timeout: Duration) -> Result<Self, TransportError> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::not_found(format!("{} has no host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = url.port().unwrap_or(DEFAULT_FTP_PORT);
        let tcp = timeout(reply_timeout, TcpStream::connect((host, port))).await??;
        let peer = tcp.peer_addr()?;
        Ok(Self {
            stream: BufStream::new(tcp),
            peer,
            url: redacted(url),
            reply_timeout,
        })
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let n = timeout(self.reply_timeout, self.stream.read_line(&mut line)).await??;
        if n == 0 {
            return Err(TransportError::transient(format!(
                "{} closed the control connection",
                self.url
            )));
        }
        Ok(line.trim_end().to_string())
    }

    /// Reads one reply, following `NNN-` continuation lines.
    async fn reply(&mut self) -> Result<(u16, String), TransportError> {
        let first = self.read_line().await?;
        let code: u16 = first
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| {
                TransportError::transient(format!("{} sent a malformed reply: {}", self.url, first))
            })?;
        let mut text = first[3..].trim_start_matches(['-', ' ']).to_string();
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let line = self.read_line().await?;
                if let Some(rest) = line.strip_prefix(&terminator) {
                    text.push('\n');
                    text.push_str(rest);
                    break;
                }
                text.push('\n');
                text.push_str(&line);
            }
        }
        trace!(url = %self.url, code, "FTP reply");
        Ok((code, text))
    }

    async fn command(&mut self, command: &str) -> Result<(u16, String), TransportError> {
        trace!(url = %self.url, command, "FTP command");
        self.write(command).await?;
        self.reply().await
    }

    async fn send_secret(&mut self, verb: &str, secret: &str) -> Result<(u16, String), TransportError> {
        trace!(url = %self.url, command = verb, "FTP command");
        self.write(&format!("{} {}", verb, secret)).await?;
        self.reply().await
    }

    async fn write(&mut self, line: &str) -> Result<(), TransportError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn check(&self, (code, text): (u16, String), accepted: &[u16]) -> Result<String, TransportError> {
        if accepted.contains(&code) {
            Ok(text)
        } else {
            Err(reply_error(code, &text, &self.url))
        }
    }

    /// `SIZE`. None when the server does not implement it.
    async fn size(&mut self, path: &str) -> Result<Option<u64>, TransportError> {
        let (code, text) = self.command(&format!("SIZE {}", path)).await?;
        match code {
            213 => Ok(text.trim().parse().ok()),
            550 => Err(reply_error(code, &text, &self.url)),
            _ => Ok(None),
        }
    }

    /// `MDTM` as unix seconds, None when unsupported.
    async fn modified(&mut self, path: &str) -> Result<Option<i64>, TransportError> {
        let (code, text) = self.command(&format!("MDTM {}", path)).await?;
        if code != 213 {
            return Ok(None);
        }
        let stamp = text.trim();
        let stamp = stamp.split('.').next().unwrap_or(stamp);
        Ok(NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
            .ok()
            .map(|dt| dt.and_utc().timestamp()))
    }

    /// Enters passive mode. The advertised host is ignored in favour of the
    /// control connection's peer, which survives NAT.
    async fn passive(&mut self) -> Result<SocketAddr, TransportError> {
        let reply = self.command("PASV").await?;
        let text = self.check(reply, &[227])?;
        let caps = PASV_RE.captures(&text).ok_or_else(|| {
            TransportError::transient(format!("{} sent an unparsable PASV reply", self.url))
        })?;
        let high: u16 = caps[5].parse().unwrap_or(0);
        let low: u16 = caps[6].parse().unwrap_or(0);
        Ok(SocketAddr::new(self.peer.ip(), high * 256 + low))
    }
}

fn reply_error(code: u16, text: &str, url: &str) -> TransportError {
    let message = format!("{} replied {} {}", url, code, text);
    match code {
        530 | 532 | 332 => TransportError::auth(message),
        421 | 425 | 426 | 450 | 451 | 452 => TransportError::transient(message),
        400..=499 => TransportError::transient(message),
        _ => TransportError::not_found(message),
    }
}

fn remote_path(url: &Url) -> String {
    percent_decode_str(url.path())
        .decode_utf8_lossy()
        .into_owned()
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    let _ = url.set_password(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfigBuilder;
    use crate::error::TransportErrorKind;
    use crate::transport::ByteRange;
    use futures::StreamExt;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const CONTENT: &[u8] = b"HelloWorldThisIsATestFile";

    /// Minimal passive-mode server. `missing` makes every file lookup fail.
    async fn spawn_server(missing: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, missing));
            }
        });
        addr
    }

    async fn serve(socket: TcpStream, missing: bool) {
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut data_listener: Option<TcpListener> = None;
        let mut rest = 0usize;
        let _ = write.write_all(b"220-Welcome\r\n220 ready\r\n").await;
        while let Ok(Some(line)) = lines.next_line().await {
            let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let reply = match verb {
                "USER" => "331 password please".to_string(),
                "PASS" if arg == "anonymous@" => "230 logged in".to_string(),
                "PASS" => "530 bad login".to_string(),
                "TYPE" => "200 binary".to_string(),
                "SIZE" | "MDTM" | "RETR" if missing => "550 no such file".to_string(),
                "SIZE" => format!("213 {}", CONTENT.len()),
                "MDTM" => "213 20151021072800".to_string(),
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    data_listener = Some(listener);
                    format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port / 256,
                        port % 256
                    )
                }
                "REST" => {
                    rest = arg.parse().unwrap();
                    "350 restarting".to_string()
                }
                "RETR" => {
                    let _ = write.write_all(b"150 opening data connection\r\n").await;
                    if let Some(listener) = data_listener.take() {
                        if let Ok((mut data, _)) = listener.accept().await {
                            let _ = data.write_all(&CONTENT[rest..]).await;
                        }
                    }
                    "226 transfer complete".to_string()
                }
                _ => "502 not implemented".to_string(),
            };
            if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }
    }

    fn transport() -> FtpTransport {
        FtpTransport::new(&EngineConfigBuilder::default().build().unwrap())
    }

    fn request(addr: SocketAddr, range: ByteRange) -> FetchRequest {
        FetchRequest {
            mirror: Mirror::parse(&format!("ftp://{}/pub/file.bin", addr), 1).unwrap(),
            range,
            expected_size: Some(CONTENT.len() as u64),
            single_segment: false,
        }
    }

    async fn read_all(stream: FetchStream) -> Vec<u8> {
        let mut body = stream.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn restarts_transfer_at_range_start() -> Result<(), Box<dyn std::error::Error>> {
        let addr = spawn_server(false).await;
        let stream = transport()
            .open(&request(addr, ByteRange::new(10, Some(25))))
            .await?;
        assert_eq!(stream.info.total_size, Some(25));
        assert_eq!(read_all(stream).await, &CONTENT[10..]);
        Ok(())
    }

    #[tokio::test]
    async fn range_end_limits_the_body() -> Result<(), Box<dyn std::error::Error>> {
        let addr = spawn_server(false).await;
        let stream = transport()
            .open(&request(addr, ByteRange::new(0, Some(5))))
            .await?;
        assert_eq!(read_all(stream).await, b"Hello");
        Ok(())
    }

    #[tokio::test]
    async fn probe_reports_size_and_mtime() -> Result<(), Box<dyn std::error::Error>> {
        let addr = spawn_server(false).await;
        let mirror = Mirror::parse(&format!("ftp://{}/pub/file.bin", addr), 1)?;
        let info = transport().probe(&mirror).await?;
        assert_eq!(info.total_size, Some(25));
        assert_eq!(info.last_modified, Some(1445412480));
        assert!(info.supports_range);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let addr = spawn_server(true).await;
        let err = transport()
            .open(&request(addr, ByteRange::full()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rejected_login_is_an_auth_failure() {
        let addr = spawn_server(false).await;
        let mirror = Mirror::parse(&format!("ftp://bob:wrong@{}/pub/file.bin", addr), 1).unwrap();
        let err = transport().probe(&mirror).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn size_disagreement_is_a_size_mismatch() {
        let addr = spawn_server(false).await;
        let mut req = request(addr, ByteRange::full());
        req.expected_size = Some(99);
        let err = transport().open(&req).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::SizeMismatch);
    }

    #[test]
    fn reply_codes_map_to_kinds() {
        assert_eq!(reply_error(530, "", "u").kind, TransportErrorKind::AuthenticationFailure);
        assert_eq!(reply_error(421, "", "u").kind, TransportErrorKind::TransientNetwork);
        assert_eq!(reply_error(550, "", "u").kind, TransportErrorKind::NotFound);
    }
}
