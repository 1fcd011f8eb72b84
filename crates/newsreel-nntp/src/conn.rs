//! One physical NNTP connection.
//!
//! The connection is a strict request/response state machine. Callers own it
//! exclusively for each exchange; after `begin_body` the multiline payload
//! must be drained through `read_body_chunk` until it reports completion
//! before any further command is legal. Violating that, or any transport
//! error, marks the connection closed so the pool above destroys it instead
//! of reusing a desynced link.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use newsreel_core::server::Credentials;
use newsreel_core::{Error, Result, SegmentId, ServerConfig};

use crate::response::{code, Response, ResponseClass};

/// Status lines are short; anything longer is not NNTP.
const MAX_STATUS_LINE: usize = 2048;
/// Encoded body lines run ~128 bytes in practice; 16 KiB leaves margin.
const MAX_BODY_LINE: usize = 16 * 1024;
/// Complete header block cap.
const MAX_HEADER_BLOCK: usize = 256 * 1024;
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

trait Wire: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Wire for T {}

type NetStream = Box<dyn Wire>;

pub struct NntpConnection {
    server: String,
    stream: BufReader<NetStream>,
    open: bool,
    in_body: bool,
}

impl NntpConnection {
    /// Establish a connection per the descriptor: TCP (TLS when configured),
    /// greeting, AUTHINFO. The whole handshake shares one timeout.
    pub async fn connect(config: &ServerConfig, connect_timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(connect_timeout, Self::handshake(config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::connect(
                &config.id,
                format!("handshake timed out after {connect_timeout:?}"),
            )),
        }
    }

    async fn handshake(config: &ServerConfig) -> Result<Self> {
        let addr = config.addr();
        tracing::debug!(server = %config.id, addr = %addr, tls = config.tls, "connecting");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connect(&config.id, format!("tcp connect to {addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);
        let net: NetStream = if config.tls {
            Box::new(tls_handshake(&config.id, &config.host, tcp).await?)
        } else {
            Box::new(tcp)
        };
        let mut conn = Self::from_stream(&config.id, net);
        conn.server_hello(config.credentials.as_ref()).await?;
        tracing::debug!(server = %config.id, "connection established");
        Ok(conn)
    }

    /// Wrap an already-established transport, command state assumed.
    pub(crate) fn from_stream(server: &str, net: NetStream) -> Self {
        NntpConnection {
            server: server.to_string(),
            stream: BufReader::new(net),
            open: true,
            in_body: false,
        }
    }

    /// Consume the greeting and authenticate when credentials are given.
    pub(crate) async fn server_hello(&mut self, creds: Option<&Credentials>) -> Result<()> {
        let greeting = self.read_response().await?;
        match greeting.code {
            code::GREETING_POSTING_OK | code::GREETING_READ_ONLY => {}
            _ => {
                self.open = false;
                return Err(Error::connect(
                    &self.server,
                    format!("unexpected greeting: {}", greeting.line),
                ));
            }
        }
        if let Some(creds) = creds {
            self.authenticate(creds).await?;
        }
        Ok(())
    }

    async fn authenticate(&mut self, creds: &Credentials) -> Result<()> {
        let user = self
            .exchange(&format!("AUTHINFO USER {}", creds.username))
            .await?;
        let reply = match user.code {
            code::AUTH_ACCEPTED => return Ok(()),
            code::PASSWORD_REQUIRED => {
                self.exchange(&format!("AUTHINFO PASS {}", creds.password))
                    .await?
            }
            _ => user,
        };
        match reply.code {
            code::AUTH_ACCEPTED => Ok(()),
            _ => {
                self.open = false;
                Err(Error::Auth {
                    server: self.server.clone(),
                    reply: reply.line,
                })
            }
        }
    }

    /// Existence probe. `Ok(())` means the article is on this server.
    pub async fn stat(&mut self, id: &SegmentId) -> Result<()> {
        let resp = self.exchange(&format!("STAT {}", id.bracketed())).await?;
        match resp.class() {
            ResponseClass::Ok if resp.code == code::ARTICLE_EXISTS => Ok(()),
            ResponseClass::Missing => Err(Error::not_found(id.as_str())),
            _ => Err(self.unexpected("STAT", &resp)),
        }
    }

    /// Fetch the complete header block, dot-destuffed, CRLF line endings.
    pub async fn head(&mut self, id: &SegmentId) -> Result<Vec<u8>> {
        let resp = self.exchange(&format!("HEAD {}", id.bracketed())).await?;
        match resp.class() {
            ResponseClass::ContentFollows if resp.code == code::HEAD_FOLLOWS => {
                self.read_block(MAX_HEADER_BLOCK).await
            }
            ResponseClass::Missing => Err(Error::not_found(id.as_str())),
            _ => Err(self.unexpected("HEAD", &resp)),
        }
    }

    /// Issue BODY and confirm the payload is coming. The caller must then
    /// drain `read_body_chunk` to completion before issuing anything else.
    pub async fn begin_body(&mut self, id: &SegmentId) -> Result<()> {
        let resp = self.exchange(&format!("BODY {}", id.bracketed())).await?;
        match resp.class() {
            ResponseClass::ContentFollows if resp.code == code::BODY_FOLLOWS => {
                self.in_body = true;
                Ok(())
            }
            ResponseClass::Missing => Err(Error::not_found(id.as_str())),
            _ => Err(self.unexpected("BODY", &resp)),
        }
    }

    /// Next dot-destuffed piece of the body, line granularity, CRLF kept.
    /// `Ok(None)` means the terminator was consumed and the connection is
    /// back in command state.
    pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.in_body {
            return Err(Error::protocol(&self.server, "no body in flight"));
        }
        let line = self.read_wire_line(MAX_BODY_LINE).await?;
        if is_terminator(&line) {
            self.in_body = false;
            return Ok(None);
        }
        if line.starts_with(b"..") {
            return Ok(Some(Bytes::copy_from_slice(&line[1..])));
        }
        Ok(Some(Bytes::from(line)))
    }

    /// Best-effort QUIT. Never errors, never blocks past a short deadline.
    pub async fn close(&mut self) {
        if !self.open || self.in_body {
            // Mid-body the link is desynced; just drop the socket.
            self.open = false;
            return;
        }
        self.open = false;
        let farewell = async {
            if self.stream.write_all(b"QUIT\r\n").await.is_ok() && self.stream.flush().await.is_ok()
            {
                let mut limited = (&mut self.stream).take(MAX_STATUS_LINE as u64);
                let mut buf = Vec::new();
                let _ = limited.read_until(b'\n', &mut buf).await;
            }
        };
        let _ = tokio::time::timeout(QUIT_TIMEOUT, farewell).await;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    // ------------------------------------------------------------------
    // Wire primitives
    // ------------------------------------------------------------------

    async fn exchange(&mut self, cmd: &str) -> Result<Response> {
        self.send(cmd).await?;
        self.read_response().await
    }

    async fn send(&mut self, cmd: &str) -> Result<()> {
        if self.in_body {
            self.open = false;
            return Err(Error::protocol(
                &self.server,
                "command issued while body in flight",
            ));
        }
        if cmd.bytes().any(|b| b == b'\r' || b == b'\n') {
            return Err(Error::Config("command must not contain CR or LF".into()));
        }
        tracing::trace!(server = %self.server, cmd = %loggable(cmd), "send");
        if let Err(e) = self.stream.write_all(cmd.as_bytes()).await {
            return Err(self.fail_io("send", e));
        }
        if let Err(e) = self.stream.write_all(b"\r\n").await {
            return Err(self.fail_io("send", e));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.fail_io("send", e));
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response> {
        let raw = self.read_wire_line(MAX_STATUS_LINE).await?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        match Response::parse(&text) {
            Some(resp) => {
                tracing::trace!(server = %self.server, reply = %resp.line, "recv");
                Ok(resp)
            }
            None => Err(self.fail_protocol(format!(
                "unparseable status line: {:?}",
                text.trim_end()
            ))),
        }
    }

    async fn read_block(&mut self, max_total: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let line = self.read_wire_line(MAX_BODY_LINE).await?;
            if is_terminator(&line) {
                return Ok(out);
            }
            out.extend_from_slice(destuff(&line));
            if out.len() > max_total {
                return Err(
                    self.fail_protocol(format!("multiline block exceeds {max_total} bytes"))
                );
            }
        }
    }

    /// One wire line including its terminator, bounded by `max`.
    async fn read_wire_line(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = {
            let mut limited = (&mut self.stream).take(max as u64);
            match limited.read_until(b'\n', &mut buf).await {
                Ok(n) => n,
                Err(e) => return Err(self.fail_io("read", e)),
            }
        };
        if n == 0 {
            self.open = false;
            return Err(Error::connect(&self.server, "connection closed by peer"));
        }
        if !buf.ends_with(b"\n") {
            if buf.len() >= max {
                return Err(self.fail_protocol(format!("line exceeds {max} bytes")));
            }
            self.open = false;
            return Err(Error::connect(&self.server, "connection closed mid-line"));
        }
        Ok(buf)
    }

    fn unexpected(&mut self, cmd: &str, resp: &Response) -> Error {
        self.open = false;
        match resp.class() {
            ResponseClass::Auth => Error::Auth {
                server: self.server.clone(),
                reply: resp.line.clone(),
            },
            _ => Error::protocol(
                &self.server,
                format!("unexpected reply to {cmd}: {}", resp.line),
            ),
        }
    }

    fn fail_io(&mut self, ctx: &str, e: std::io::Error) -> Error {
        self.open = false;
        Error::connect(&self.server, format!("{ctx}: {e}"))
    }

    fn fail_protocol(&mut self, detail: impl ToString) -> Error {
        self.open = false;
        Error::protocol(&self.server, detail)
    }
}

fn is_terminator(line: &[u8]) -> bool {
    line == b".\r\n" || line == b".\n"
}

fn destuff(line: &[u8]) -> &[u8] {
    if line.starts_with(b"..") {
        &line[1..]
    } else {
        line
    }
}

fn loggable(cmd: &str) -> &str {
    if cmd.starts_with("AUTHINFO PASS") {
        "AUTHINFO PASS ***"
    } else {
        cmd
    }
}

static TLS_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

async fn tls_handshake(
    server: &str,
    host: &str,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let config = TLS_CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone();
    let name = rustls::pki_types::ServerName::try_from(host.to_owned())
        .map_err(|_| Error::Tls(format!("{server}: invalid TLS server name {host:?}")))?;
    TlsConnector::from(config)
        .connect(name, tcp)
        .await
        .map_err(|e| Error::Tls(format!("{server}: handshake with {host}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn pair() -> (NntpConnection, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (NntpConnection::from_stream("test", Box::new(ours)), theirs)
    }

    /// Scripted peer: for each entry, wait for a command starting with the
    /// expected prefix (empty prefix sends immediately) and write the reply
    /// verbatim.
    fn peer(theirs: DuplexStream, script: Vec<(&'static str, &'static str)>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read_half).lines();
            for (expect, reply) in script {
                if !expect.is_empty() {
                    let line = lines.next_line().await.unwrap().unwrap_or_default();
                    assert!(
                        line.starts_with(expect),
                        "peer expected {expect:?}, got {line:?}"
                    );
                }
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
        })
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    #[tokio::test]
    async fn greeting_accepted_without_credentials() {
        let (mut conn, theirs) = pair();
        let script = peer(theirs, vec![("", "201 reader service\r\n")]);
        conn.server_hello(None).await.unwrap();
        assert!(conn.is_open());
        script.await.unwrap();
    }

    #[tokio::test]
    async fn bad_greeting_is_a_connection_failure() {
        let (mut conn, theirs) = pair();
        let _script = peer(theirs, vec![("", "400 service discontinued\r\n")]);
        let err = conn.server_hello(None).await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "{err}");
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn two_step_authentication() {
        let (mut conn, theirs) = pair();
        let script = peer(
            theirs,
            vec![
                ("", "200 hello\r\n"),
                ("AUTHINFO USER reader", "381 password required\r\n"),
                ("AUTHINFO PASS s3cret", "281 welcome\r\n"),
            ],
        );
        let creds = Credentials::new("reader", "s3cret");
        conn.server_hello(Some(&creds)).await.unwrap();
        assert!(conn.is_open());
        script.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_password_is_an_auth_error() {
        let (mut conn, theirs) = pair();
        let _script = peer(
            theirs,
            vec![
                ("", "200 hello\r\n"),
                ("AUTHINFO USER reader", "381 password required\r\n"),
                ("AUTHINFO PASS wrong", "481 authentication failed\r\n"),
            ],
        );
        let creds = Credentials::new("reader", "wrong");
        let err = conn.server_hello(Some(&creds)).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }), "{err}");
        assert!(!conn.is_open());
    }

    // ========================================================================
    // Article commands
    // ========================================================================

    #[tokio::test]
    async fn stat_distinguishes_present_from_missing() {
        let (mut conn, theirs) = pair();
        let script = peer(
            theirs,
            vec![
                ("STAT <here@x>", "223 0 <here@x>\r\n"),
                ("STAT <gone@x>", "430 no such article\r\n"),
            ],
        );
        conn.stat(&SegmentId::new("here@x")).await.unwrap();
        let err = conn.stat(&SegmentId::new("gone@x")).await.unwrap_err();
        assert!(err.is_not_found());
        // A 430 is an answer, not a fault; the connection stays usable.
        assert!(conn.is_open());
        script.await.unwrap();
    }

    #[tokio::test]
    async fn head_collects_and_destuffs_the_block() {
        let (mut conn, theirs) = pair();
        let script = peer(
            theirs,
            vec![(
                "HEAD <a@x>",
                "221 0 <a@x>\r\nSubject: demo\r\n..starts-with-dot\r\n.\r\n",
            )],
        );
        let block = conn.head(&SegmentId::new("a@x")).await.unwrap();
        assert_eq!(block, b"Subject: demo\r\n.starts-with-dot\r\n");
        assert!(conn.is_open());
        script.await.unwrap();
    }

    #[tokio::test]
    async fn body_streams_chunks_then_returns_to_command_state() {
        let (mut conn, theirs) = pair();
        let script = peer(
            theirs,
            vec![
                ("BODY <a@x>", "222 0 <a@x>\r\nline one\r\n..dotted\r\n.\r\n"),
                ("STAT <a@x>", "223 0 <a@x>\r\n"),
            ],
        );
        conn.begin_body(&SegmentId::new("a@x")).await.unwrap();
        assert_eq!(
            conn.read_body_chunk().await.unwrap().as_deref(),
            Some(b"line one\r\n".as_slice())
        );
        assert_eq!(
            conn.read_body_chunk().await.unwrap().as_deref(),
            Some(b".dotted\r\n".as_slice())
        );
        assert_eq!(conn.read_body_chunk().await.unwrap(), None);
        // Terminator consumed, next command legal on the same link.
        conn.stat(&SegmentId::new("a@x")).await.unwrap();
        script.await.unwrap();
    }

    #[tokio::test]
    async fn missing_body_is_not_found_and_leaves_command_state() {
        let (mut conn, theirs) = pair();
        let script = peer(theirs, vec![("BODY <gone@x>", "430 gone\r\n")]);
        let err = conn.begin_body(&SegmentId::new("gone@x")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(conn.is_open());
        script.await.unwrap();
    }

    // ========================================================================
    // Fault paths
    // ========================================================================

    #[tokio::test]
    async fn eof_mid_body_poisons_the_connection() {
        let (mut conn, theirs) = pair();
        let script = peer(theirs, vec![("BODY <a@x>", "222 0 <a@x>\r\npartial")]);
        conn.begin_body(&SegmentId::new("a@x")).await.unwrap();
        // Script task finished and dropped its half, so the peer wrote a
        // partial line and hung up. The next chunk read must fail as a
        // connection error, never hang or fabricate data.
        script.await.unwrap();
        let err = conn.read_body_chunk().await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "{err}");
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn garbage_status_line_is_a_protocol_fault() {
        let (mut conn, theirs) = pair();
        let script = peer(theirs, vec![("STAT", "this is not nntp\r\n")]);
        let err = conn.stat(&SegmentId::new("a@x")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "{err}");
        assert!(!conn.is_open());
        script.await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_reply_names_the_command() {
        let (mut conn, theirs) = pair();
        let script = peer(theirs, vec![("HEAD", "500 what\r\n")]);
        let err = conn.head(&SegmentId::new("a@x")).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("HEAD"), "{text}");
        script.await.unwrap();
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let (mut conn, theirs) = pair();
        let long = "a".repeat(MAX_BODY_LINE + 16);
        tokio::spawn(async move {
            let (_read_half, mut write_half) = tokio::io::split(theirs);
            write_half.write_all(b"222 0 <a@x>\r\n").await.unwrap();
            write_half.write_all(long.as_bytes()).await.unwrap();
        });
        conn.begin_body(&SegmentId::new("a@x")).await.unwrap();
        let err = conn.read_body_chunk().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "{err}");
        assert!(!conn.is_open());
    }
}
