//! Interleaved-TCP RTSP session engine.
//!
//! One socket carries everything. A single reader task classifies the byte
//! stream ([`crate::message::MessageParser`]), forwards interleaved frames
//! to the session's channel and completes pending requests by `CSeq`.
//! Requests (including keepalives) are serialized through the write half.
//!
//! Lifecycle: `connect` drives OPTIONS -> DESCRIBE -> SETUP(per track),
//! `play` issues PLAY and starts the keepalive/watchdog task. Any
//! transport or protocol failure closes the socket, which surfaces to the
//! owner as end-of-stream on [`RtspSession::recv_frame`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::message::{MessageParser, RtspEvent, RtspResponse};
use crate::sdp::{self, SdpSession};
use crate::{RtspError, TrackDescriptor};

/// How long a single request may wait for its response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Session timeout assumed when the server sends none (or `timeout=0`).
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
/// Lower bound on the keepalive period.
const MIN_KEEPALIVE: Duration = Duration::from_secs(15);

const USER_AGENT: &str = concat!("camrelay/", env!("CARGO_PKG_VERSION"));

/// One interleaved payload as read from the socket. RTP rides even
/// channels, RTCP odd ones.
#[derive(Debug)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// An established RTSP session, SETUP complete for every advertised track.
pub struct RtspSession {
    conn: Arc<RtspConnection>,
    frames: mpsc::Receiver<InterleavedFrame>,
    pub tracks: Vec<TrackDescriptor>,
    pub sdp: SdpSession,
    /// Aggregate control URI used for PLAY and keepalive.
    play_uri: String,
    session_timeout: Duration,
    keepalive: Option<JoinHandle<()>>,
}

impl RtspSession {
    /// Connect and negotiate through SETUP. The returned session is not
    /// yet receiving media; call [`RtspSession::play`].
    pub async fn connect(raw_url: &str) -> Result<RtspSession, RtspError> {
        let url = Url::parse(raw_url)
            .map_err(|e| RtspError::protocol(format!("bad RTSP URL: {e}")))?;

        let (conn, frames) = RtspConnection::open(&url).await?;

        // OPTIONS: learn whether GET_PARAMETER is available for keepalive.
        let options = conn.request("OPTIONS", conn.request_uri(), &[]).await?;
        expect_ok("OPTIONS", &options)?;
        let get_parameter = options
            .public_methods()
            .iter()
            .any(|m| m == "GET_PARAMETER");
        conn.use_get_parameter.store(get_parameter, Ordering::Relaxed);

        // DESCRIBE: SDP plus the Content-Base all control URIs resolve
        // against.
        let describe = conn
            .request(
                "DESCRIBE",
                conn.request_uri(),
                &[("Accept", "application/sdp".to_string())],
            )
            .await?;
        expect_ok("DESCRIBE", &describe)?;
        let base = describe
            .header("Content-Base")
            .or_else(|| describe.header("Content-Location"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| conn.request_uri().to_string());
        let body = String::from_utf8(describe.body.clone())
            .map_err(|_| RtspError::protocol("SDP body is not UTF-8"))?;
        let session_sdp = sdp::parse(&body)?;

        // SETUP each media section on the next interleaved channel pair;
        // the server's accepted channels win over the requested ones.
        let mut tracks = Vec::with_capacity(session_sdp.media.len());
        for (index, media) in session_sdp.media.iter().enumerate() {
            let control = sdp::resolve_control(&base, media.control.as_deref());
            let requested = (index * 2) as u8;
            let transport = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                requested,
                requested + 1
            );
            let setup = conn
                .request("SETUP", &control, &[("Transport", transport)])
                .await?;
            expect_ok("SETUP", &setup)?;
            let (rtp_channel, _rtcp_channel) = setup
                .interleaved_channels()
                .unwrap_or((requested, requested + 1));
            if rtp_channel != requested {
                debug!(
                    requested,
                    accepted = rtp_channel,
                    control = %control,
                    "server moved interleaved channel"
                );
            }
            tracks.push(TrackDescriptor {
                channel_id: rtp_channel,
                media_type: media.media_type,
                control_uri: control,
                payload_type: media.payload_type,
                clock_rate: media.clock_rate,
                codec_params: media.fmtp.clone(),
            });
        }
        if tracks.is_empty() {
            return Err(RtspError::protocol("no tracks to SETUP"));
        }

        let play_uri = sdp::resolve_control(&base, session_sdp.session_control.as_deref());
        let session_timeout = conn.session_timeout();

        info!(
            tracks = tracks.len(),
            timeout_secs = session_timeout.as_secs(),
            "RTSP session established"
        );

        Ok(RtspSession {
            conn,
            frames,
            tracks,
            sdp: session_sdp,
            play_uri,
            session_timeout,
            keepalive: None,
        })
    }

    /// Issue PLAY and start the keepalive/receive-watchdog task.
    pub async fn play(&mut self) -> Result<(), RtspError> {
        let play = self
            .conn
            .request("PLAY", &self.play_uri, &[("Range", "npt=0-".to_string())])
            .await?;
        expect_ok("PLAY", &play)?;

        // Refresh the timeout in case PLAY restated it.
        let timeout = self.conn.session_timeout().max(Duration::from_secs(1));
        let interval = (timeout / 2).max(MIN_KEEPALIVE);
        self.session_timeout = timeout;
        self.keepalive = Some(tokio::spawn(keepalive_loop(
            Arc::clone(&self.conn),
            self.play_uri.clone(),
            interval,
        )));
        Ok(())
    }

    /// Next interleaved frame; `None` once the connection is closed (read
    /// error, malformed stream, keepalive failure or watchdog expiry).
    pub async fn recv_frame(&mut self) -> Option<InterleavedFrame> {
        self.frames.recv().await
    }

    pub fn keepalive_interval(&self) -> Duration {
        (self.session_timeout / 2).max(MIN_KEEPALIVE)
    }

    /// Best-effort TEARDOWN, then close the socket and stop the keepalive.
    pub async fn teardown(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        let teardown = self
            .conn
            .request("TEARDOWN", &self.play_uri, &[]);
        if let Err(e) = tokio::time::timeout(Duration::from_secs(2), teardown).await {
            debug!("TEARDOWN timed out: {e}");
        }
        self.conn.shutdown().await;
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }
}

fn expect_ok(method: &'static str, response: &RtspResponse) -> Result<(), RtspError> {
    if response.status == 200 {
        Ok(())
    } else {
        Err(RtspError::Status {
            method,
            status: response.status,
            reason: response.reason.clone(),
        })
    }
}

trait RtspStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RtspStream for T {}

type BoxedStream = Box<dyn RtspStream>;

struct RtspConnection {
    writer: Mutex<WriteHalf<BoxedStream>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<RtspResponse>>>,
    cseq: AtomicU32,
    session_id: Mutex<Option<String>>,
    /// `timeout=N` from the `Session:` header, seconds; 0 = unset.
    session_timeout_secs: AtomicU64,
    use_get_parameter: AtomicBool,
    /// Request URI (credentials stripped) and the matching auth header.
    uri: String,
    auth_header: Option<String>,
    /// Milliseconds since `epoch` of the last byte read from the socket.
    last_rx_ms: AtomicU64,
    epoch: Instant,
}

impl RtspConnection {
    async fn open(
        url: &Url,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InterleavedFrame>), RtspError> {
        let secure = match url.scheme() {
            "rtsp" => false,
            "rtsps" => true,
            other => {
                return Err(RtspError::protocol(format!("unsupported scheme {other:?}")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| RtspError::protocol("RTSP URL has no host"))?
            .to_string();
        let port = url.port().unwrap_or(if secure { 322 } else { 554 });

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true).ok();
        let stream: BoxedStream = if secure {
            Box::new(tls_connect(tcp, &host).await?)
        } else {
            Box::new(tcp)
        };
        let (reader, writer) = tokio::io::split(stream);

        // Basic auth from the URL userinfo (RFC 2617); the request line
        // itself carries the URL without credentials.
        let auth_header = if url.username().is_empty() {
            None
        } else {
            let creds = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            Some(format!("Basic {}", BASE64.encode(creds)))
        };
        let mut clean = url.clone();
        clean.set_username("").ok();
        clean.set_password(None).ok();

        let (frames_tx, frames_rx) = mpsc::channel(256);
        let conn = Arc::new(RtspConnection {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            cseq: AtomicU32::new(1),
            session_id: Mutex::new(None),
            session_timeout_secs: AtomicU64::new(0),
            use_get_parameter: AtomicBool::new(false),
            uri: clean.to_string(),
            auth_header,
            last_rx_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        });

        let reader_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            if let Err(e) = reader_loop(reader, &reader_conn, frames_tx).await {
                warn!("RTSP reader ended: {e}");
            }
            // Fail anything still waiting for a response.
            reader_conn.pending.lock().await.clear();
        });

        Ok((conn, frames_rx))
    }

    fn request_uri(&self) -> &str {
        &self.uri
    }

    fn session_timeout(&self) -> Duration {
        match self.session_timeout_secs.load(Ordering::Relaxed) {
            0 => DEFAULT_SESSION_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    fn touch_rx(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_rx_ms.store(ms, Ordering::Relaxed);
    }

    fn since_last_rx(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_rx_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    async fn request(
        &self,
        method: &'static str,
        uri: &str,
        headers: &[(&str, String)],
    ) -> Result<RtspResponse, RtspError> {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);

        let mut text = format!("{method} {uri} RTSP/1.0\r\nCSeq: {cseq}\r\nUser-Agent: {USER_AGENT}\r\n");
        if let Some(session) = self.session_id.lock().await.clone() {
            text.push_str(&format!("Session: {session}\r\n"));
        }
        if let Some(auth) = &self.auth_header {
            text.push_str(&format!("Authorization: {auth}\r\n"));
        }
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        text.push_str("\r\n");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(cseq, tx);

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(text.as_bytes()).await?;
            writer.flush().await?;
        }

        let response = match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RtspError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&cseq);
                return Err(RtspError::Timeout);
            }
        };

        if let Some((id, timeout)) = response.session() {
            *self.session_id.lock().await = Some(id);
            if let Some(secs) = timeout {
                self.session_timeout_secs.store(secs, Ordering::Relaxed);
            }
        }
        Ok(response)
    }

    /// Close the socket; unblocks the reader and ends the session.
    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
    }
}

async fn tls_connect(
    tcp: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, RtspError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert).ok();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| RtspError::protocol(format!("invalid TLS server name {host:?}")))?;
    Ok(connector.connect(server_name, tcp).await?)
}

async fn reader_loop(
    mut reader: ReadHalf<BoxedStream>,
    conn: &RtspConnection,
    frames_tx: mpsc::Sender<InterleavedFrame>,
) -> Result<(), RtspError> {
    let mut parser = MessageParser::new();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(RtspError::Closed);
        }
        conn.touch_rx();

        for event in parser.append(&buf[..n])? {
            match event {
                RtspEvent::Frame { channel, payload } => {
                    if frames_tx
                        .send(InterleavedFrame { channel, payload })
                        .await
                        .is_err()
                    {
                        // Owner went away; nothing left to deliver.
                        return Ok(());
                    }
                }
                RtspEvent::Response(response) => {
                    let cseq = response.cseq();
                    let waiter = match cseq {
                        Some(cseq) => conn.pending.lock().await.remove(&cseq),
                        None => None,
                    };
                    match waiter {
                        Some(tx) => {
                            tx.send(response).ok();
                        }
                        None => debug!(?cseq, "response without a pending request"),
                    }
                }
            }
        }
    }
}

/// Periodic idempotent request plus the receive-side watchdog: more than
/// three silent intervals means the server is gone.
async fn keepalive_loop(conn: Arc<RtspConnection>, uri: String, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        if conn.since_last_rx() > interval * 3 {
            warn!(
                silent_secs = conn.since_last_rx().as_secs(),
                "no RTSP bytes for three keepalive intervals, closing"
            );
            conn.shutdown().await;
            return;
        }

        let method = if conn.use_get_parameter.load(Ordering::Relaxed) {
            "GET_PARAMETER"
        } else {
            "OPTIONS"
        };
        match conn.request(method, &uri, &[]).await {
            Ok(response) if response.status >= 400 => {
                warn!(status = response.status, "keepalive refused, closing");
                conn.shutdown().await;
                return;
            }
            Ok(_) => debug!(method, "keepalive ok"),
            Err(e) => {
                warn!("keepalive failed: {e}");
                conn.shutdown().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaType;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal scripted RTSP camera: answers the standard handshake and
    /// then pushes one interleaved frame.
    async fn scripted_server(
        listener: TcpListener,
        setup_channels: &'static str,
        session_header: &'static str,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let sdp_body = "v=0\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=control:track1\r\n";

        loop {
            // Read one request head.
            let mut method = String::new();
            let mut cseq = 0u32;
            loop {
                let line = match lines.next_line().await.unwrap() {
                    Some(line) => line,
                    None => return,
                };
                if line.is_empty() {
                    break;
                }
                if method.is_empty() {
                    method = line.split(' ').next().unwrap_or_default().to_string();
                } else if let Some(v) = line.strip_prefix("CSeq:") {
                    cseq = v.trim().parse().unwrap_or(0);
                }
            }

            let response = match method.as_str() {
                "OPTIONS" => format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\
                     Public: OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER\r\n\r\n"
                ),
                "DESCRIBE" => format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\
                     Content-Base: rtsp://127.0.0.1/stream/\r\n\
                     Content-Length: {}\r\n\r\n{}",
                    sdp_body.len(),
                    sdp_body
                ),
                "SETUP" => format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\
                     Session: {session_header}\r\n\
                     Transport: RTP/AVP/TCP;unicast;interleaved={setup_channels}\r\n\r\n"
                ),
                "PLAY" => format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: abc123\r\n\r\n"
                ),
                _ => format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n"),
            };
            write_half.write_all(response.as_bytes()).await.unwrap();

            if method == "PLAY" {
                // One interleaved RTP-ish frame on the SETUP channel.
                let channel: u8 = setup_channels
                    .split('-')
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                write_half
                    .write_all(&[0x24, channel, 0x00, 0x03, 0xde, 0xad, 0xbf])
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn handshake_play_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(scripted_server(listener, "0-1", "abc123;timeout=30"));

        let url = format!("rtsp://{addr}/stream");
        let mut session = RtspSession::connect(&url).await.unwrap();
        assert_eq!(session.tracks.len(), 1);
        assert_eq!(session.tracks[0].channel_id, 0);
        assert_eq!(session.tracks[0].media_type, MediaType::Video);
        assert_eq!(
            session.tracks[0].control_uri,
            "rtsp://127.0.0.1/stream/track1"
        );
        // timeout=30 from SETUP -> keepalive every max(15, 15) seconds.
        session.play().await.unwrap();
        assert_eq!(session.keepalive_interval(), Duration::from_secs(15));

        let frame = session.recv_frame().await.unwrap();
        assert_eq!(frame.channel, 0);
        assert_eq!(frame.payload.as_ref(), &[0xde, 0xad, 0xbf]);

        session.teardown().await;
    }

    #[tokio::test]
    async fn server_channel_override_is_honored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(scripted_server(listener, "6-7", "abc123;timeout=30"));

        let url = format!("rtsp://{addr}/stream");
        let mut session = RtspSession::connect(&url).await.unwrap();
        assert_eq!(session.tracks[0].channel_id, 6);

        session.play().await.unwrap();
        let frame = session.recv_frame().await.unwrap();
        assert_eq!(frame.channel, 6);
    }

    #[tokio::test]
    async fn closed_socket_surfaces_as_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(scripted_server(listener, "0-1", "abc123;timeout=30"));

        let url = format!("rtsp://{addr}/stream");
        let mut session = RtspSession::connect(&url).await.unwrap();
        session.play().await.unwrap();
        let _ = session.recv_frame().await.unwrap();

        // Kill the server; the reader must deliver end-of-stream.
        server.abort();
        assert!(session.recv_frame().await.is_none());
    }

    #[tokio::test]
    async fn missing_timeout_falls_back_to_60s_default() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(scripted_server(listener, "0-1", "abc123"));

        let url = format!("rtsp://{addr}/stream");
        let mut session = RtspSession::connect(&url).await.unwrap();
        session.play().await.unwrap();
        // 60 s default timeout -> keepalive every 30 s.
        assert_eq!(session.keepalive_interval(), Duration::from_secs(30));
        session.teardown().await;
    }

    #[tokio::test]
    async fn zero_timeout_falls_back_to_60s_default() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(scripted_server(listener, "0-1", "abc123;timeout=0"));

        let url = format!("rtsp://{addr}/stream");
        let mut session = RtspSession::connect(&url).await.unwrap();
        session.play().await.unwrap();
        assert_eq!(session.keepalive_interval(), Duration::from_secs(30));
        session.teardown().await;
    }
}
