//! Tunnel connection state machine
//!
//! A [`TunnelConnection`] owns one socket to the router. `connect` runs the
//! route handshake; once the tunnel is `Open` the socket is a transparent
//! pipe to the destination, used for HTTP exchanges or raw reads/writes.

use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::{Instant, timeout, timeout_at},
};
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{
    config::{MultiHopPolicy, TunnelOptions},
    constants::{ERROR_EYECATCHER_WINDOW, MAX_HEADER_SECTION_BYTES, READ_CHUNK_BYTES},
    error::{ConnectFailure, Phase, Result, TunnelError},
    http::{HttpRequestSpec, HttpResponse, ResponseAssembler, encode_request},
    route::{
        RouteDescriptor, RouteReply, decode_route_reply, encode_route_packet,
        error_packet_complete, is_error_packet, router_error_message,
    },
    tls::connect_tls,
    utils::generate_tunnel_id,
    validation::validate_host,
};

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelState {
    Idle,
    Connecting,
    Handshaking,
    Open,
    Closed,
    /// Setup failed; terminal
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Handshaking => "handshaking",
            TunnelState::Open => "open",
            TunnelState::Closed => "closed",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Destination behind the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTarget {
    pub target_host: String,
    pub target_port: u16,
    /// Negotiate TLS with the destination once the tunnel is open
    ///
    /// The session is end-to-end with the destination and runs inside the
    /// tunnel; the socket to the router itself stays plain TCP.
    #[serde(default)]
    pub use_tls: bool,
}

impl TunnelTarget {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            use_tls: false,
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// `host:port`, as used for the `Host` header
    pub fn authority(&self) -> String {
        if self.target_host.contains(':') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

/// Closes a tunnel from another task
///
/// Outstanding I/O on the tunnel fails with `Cancelled`.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Socket toward the destination, optionally wrapped in TLS
enum TunnelStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStream::Plain(_) => f.write_str("Plain"),
            TunnelStream::Tls(_) => f.write_str("Tls"),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One tunnel through a router to a destination
#[derive(Debug)]
pub struct TunnelConnection {
    id: String,
    route: RouteDescriptor,
    target: TunnelTarget,
    options: TunnelOptions,
    state: TunnelState,
    stream: Option<TunnelStream>,
    /// Bytes received past the end of the last response
    pending: BytesMut,
    cancel: CancellationToken,
    span: Span,
}

impl TunnelConnection {
    /// Create an idle tunnel; no I/O happens until `connect`
    pub fn new(route: RouteDescriptor, target: TunnelTarget, options: TunnelOptions) -> Result<Self> {
        validate_host(&target.target_host)?;

        if route.is_multi_hop() {
            match options.multi_hop {
                MultiHopPolicy::Reject => {
                    return Err(TunnelError::UnsupportedRoute(format!(
                        "{} names {} routers, only single-hop routes are supported",
                        route,
                        route.further_hops().len() + 1
                    )));
                }
                MultiHopPolicy::FirstHopOnly => {
                    warn!(
                        "Ignoring {} further hop(s) of route {}",
                        route.further_hops().len(),
                        route
                    );
                }
            }
        }

        let id = generate_tunnel_id();
        let span = info_span!(
            "tunnel",
            id = %id,
            router = %route.router_addr(),
            target = %target
        );

        Ok(Self {
            id,
            route,
            target,
            options,
            state: TunnelState::Idle,
            stream: None,
            pending: BytesMut::new(),
            cancel: CancellationToken::new(),
            span,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &RouteDescriptor {
        &self.route
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Current state; a tunnel closed through a `CancelHandle` reports `Closed`
    pub fn state(&self) -> TunnelState {
        match self.state {
            TunnelState::Failed => TunnelState::Failed,
            _ if self.cancel.is_cancelled() => TunnelState::Closed,
            state => state,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == TunnelState::Open
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Open the socket to the router and run the route handshake
    ///
    /// On failure the socket is closed and the tunnel ends up `Failed`, or
    /// `Closed` when it was cancelled.
    pub async fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state != TunnelState::Idle {
            return Err(TunnelError::InvalidState(state));
        }

        let span = self.span.clone();
        let result = self.establish().instrument(span).await;

        if let Err(e) = &result {
            self.stream = None;
            self.state = match e {
                TunnelError::Cancelled => TunnelState::Closed,
                _ => TunnelState::Failed,
            };
            warn!(parent: &self.span, "Tunnel setup failed: {}", e);
        }
        result
    }

    async fn establish(&mut self) -> Result<()> {
        let timeouts = self.options.timeouts;
        let addr = self.route.router_addr();

        self.state = TunnelState::Connecting;
        info!("Connecting to router {}", addr);

        let mut tcp = with_cancel(&self.cancel, async {
            match timeout(timeouts.connect, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(TunnelError::RouterConnectFailed {
                    addr: addr.clone(),
                    reason: e.into(),
                }),
                Err(_) => Err(TunnelError::RouterConnectFailed {
                    addr: addr.clone(),
                    reason: ConnectFailure::TimedOut(timeouts.connect),
                }),
            }
        })
        .await?;

        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        self.state = TunnelState::Handshaking;
        let packet = encode_route_packet(&self.target.target_host, self.target.target_port);
        debug!("Sending route packet ({} bytes)", packet.len());

        let reply = with_cancel(&self.cancel, async {
            match timeout(
                timeouts.handshake,
                handshake(&mut tcp, &packet, timeouts.handshake_grace),
            )
            .await
            {
                Ok(reply) => reply,
                Err(_) => Err(TunnelError::HandshakeTimeout(timeouts.handshake)),
            }
        })
        .await?;

        match reply {
            RouteReply::Rejected { code, detail } => {
                drop(tcp);
                return Err(rejected(code, detail));
            }
            RouteReply::Established => info!("Route established to {}", self.target),
            RouteReply::Pending => info!(
                "No route reply within {:?}, treating tunnel to {} as open",
                timeouts.handshake_grace, self.target
            ),
        }

        let stream = if self.target.use_tls {
            let tls = with_cancel(&self.cancel, async {
                let reason = match timeout(
                    timeouts.connect,
                    connect_tls(tcp, &self.target.target_host, &self.options.tls),
                )
                .await
                {
                    Ok(Ok(tls)) => return Ok(tls),
                    Ok(Err(reason)) => reason,
                    Err(_) => ConnectFailure::TimedOut(timeouts.connect),
                };
                Err(TunnelError::RouterConnectFailed {
                    addr: self.target.authority(),
                    reason,
                })
            })
            .await?;
            debug!("TLS session with {} established", self.target.target_host);
            TunnelStream::Tls(Box::new(tls))
        } else {
            TunnelStream::Plain(tcp)
        };

        self.stream = Some(stream);
        self.state = TunnelState::Open;
        info!("Tunnel open");
        Ok(())
    }

    /// Send one request and wait for its complete response
    ///
    /// A request that fails validation leaves the tunnel open. Transport
    /// failures, timeouts and a peer close all leave it `Closed`.
    pub async fn send_request(&mut self, request: &HttpRequestSpec) -> Result<HttpResponse> {
        let state = self.state();
        if state != TunnelState::Open {
            return Err(TunnelError::NotConnected(state));
        }

        let wire = encode_request(request, &self.target.authority())?;
        debug!(
            parent: &self.span,
            "{} {} ({} bytes on the wire)",
            request.method,
            request.path,
            wire.len()
        );

        let span = self.span.clone();
        self.exchange(&wire, request.is_head()).instrument(span).await
    }

    async fn exchange(&mut self, wire: &[u8], head_request: bool) -> Result<HttpResponse> {
        let timeouts = self.options.timeouts;
        let mut assembler = ResponseAssembler::new(
            head_request,
            self.options.chunked_body,
            self.options.max_response_bytes,
        );
        let pending = self.pending.split();

        let Some(stream) = self.stream.as_mut() else {
            return Err(TunnelError::NotConnected(self.state));
        };

        let outcome = with_cancel(&self.cancel, async {
            match timeout(
                timeouts.response,
                relay(stream, wire, pending, &mut assembler),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TunnelError::ResponseTimeout(timeouts.response)),
            }
        })
        .await;

        match outcome {
            Ok((response, peer_closed)) => {
                debug!(
                    "Response {} with {} body bytes",
                    response.status_code,
                    response.body.len()
                );
                if peer_closed {
                    debug!("Destination closed the connection");
                    self.close();
                } else if response.closes_connection() {
                    debug!("Response asked for connection close");
                    self.close();
                } else {
                    self.pending = assembler.take_remainder();
                }
                Ok(response)
            }
            Err(e) => {
                warn!("Request failed: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    /// Write raw bytes to the destination
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let state = self.state();
        let Some(stream) = self.stream.as_mut().filter(|_| state == TunnelState::Open) else {
            return Err(TunnelError::NotConnected(state));
        };

        let result = with_cancel(&self.cancel, async {
            stream
                .write_all(data)
                .await
                .map_err(|e| TunnelError::broken(Phase::Request, e))?;
            stream
                .flush()
                .await
                .map_err(|e| TunnelError::broken(Phase::Request, e))
        })
        .await;

        if result.is_err() {
            self.close();
        }
        result
    }

    /// Read raw bytes from the destination; returns 0 once the peer closed
    ///
    /// Bytes left over from an earlier response are returned first.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let state = self.state();
        if state != TunnelState::Open {
            return Err(TunnelError::NotConnected(state));
        }

        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending.split_to(n));
            return Ok(n);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(TunnelError::NotConnected(state));
        };

        let result = with_cancel(&self.cancel, async {
            stream
                .read(buf)
                .await
                .map_err(|e| TunnelError::broken(Phase::Response, e))
        })
        .await;

        match result {
            Ok(0) => {
                debug!(parent: &self.span, "Destination closed the connection");
                self.close();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Close the socket; safe to call in any state, any number of times
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.pending.clear();
        if self.stream.take().is_some() {
            debug!(parent: &self.span, "Socket to router dropped");
        }
        if !matches!(self.state, TunnelState::Closed | TunnelState::Failed) {
            info!(parent: &self.span, "Tunnel closed");
            self.state = TunnelState::Closed;
        }
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `fut` unless the tunnel is closed first
async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        result = fut => result,
    }
}

/// Send the route packet and classify what comes back
///
/// Reads until the reply is decisive, the router closes, or `grace`
/// passes. Silence for the whole grace window counts as acceptance.
pub(crate) async fn handshake<S>(stream: &mut S, packet: &[u8], grace: Duration) -> Result<RouteReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(packet)
        .await
        .map_err(|e| TunnelError::broken(Phase::Handshake, e))?;
    stream
        .flush()
        .await
        .map_err(|e| TunnelError::broken(Phase::Handshake, e))?;

    let deadline = Instant::now() + grace;
    let mut buf = BytesMut::with_capacity(64);

    loop {
        let read = match timeout_at(deadline, stream.read_buf(&mut buf)).await {
            Err(_) if buf.is_empty() => return Ok(RouteReply::Pending),
            Err(_) => {
                debug!("Grace period over with {} reply bytes buffered", buf.len());
                return decode_route_reply(&buf);
            }
            Ok(Err(e)) => return Err(TunnelError::broken(Phase::Handshake, e)),
            Ok(Ok(n)) => n,
        };

        if read == 0 {
            match decode_route_reply(&buf) {
                Ok(reply @ RouteReply::Rejected { .. }) => return Ok(reply),
                Err(e @ TunnelError::MalformedReply(_)) if !buf.is_empty() => return Err(e),
                _ => {}
            }
            return Err(TunnelError::broken(
                Phase::Handshake,
                format!("router closed the connection after {} reply bytes", buf.len()),
            ));
        }

        match decode_route_reply(&buf) {
            Ok(RouteReply::Established) => return Ok(RouteReply::Established),
            Ok(reply @ RouteReply::Rejected { .. }) => {
                let partial = is_error_packet(&buf)
                    && !error_packet_complete(&buf)
                    && buf.len() < MAX_HEADER_SECTION_BYTES;
                if !partial {
                    return Ok(reply);
                }
            }
            Ok(RouteReply::Pending) | Err(TunnelError::MalformedReply(_)) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Build the error for a route the router refused
fn rejected(code: i32, detail: Option<String>) -> TunnelError {
    TunnelError::RouterRejected {
        code,
        message: router_error_message(code).to_string(),
        detail,
    }
}

/// What the first bytes after an unconfirmed handshake turned out to be
#[derive(Debug, PartialEq, Eq)]
enum Lead {
    /// Too short to tell an HTTP response from a router error packet
    Undecided,
    /// Router error packet, possibly still incomplete
    RouterError { complete: bool },
    Http,
}

/// Classify the bytes that precede a response head
///
/// A router that accepted the route silently may still refuse it later
/// with an `NI_RTERR` packet. Such packets open with a length field, so
/// they never start like a status line.
fn classify_lead(buf: &[u8]) -> Lead {
    if is_error_packet(buf) {
        return Lead::RouterError {
            complete: error_packet_complete(buf) || buf.len() >= MAX_HEADER_SECTION_BYTES,
        };
    }
    match buf.first().copied() {
        Some(b'H' | b'\r' | b'\n') => Lead::Http,
        Some(_) if buf.len() >= ERROR_EYECATCHER_WINDOW => Lead::Http,
        _ => Lead::Undecided,
    }
}

/// Write one request and read until its response is complete
///
/// Returns the response and whether the peer closed the stream. Until the
/// response head is parsed, incoming bytes are checked for a late router
/// error packet, which fails the exchange with `RouterRejected`.
async fn relay<S>(
    stream: &mut S,
    wire: &[u8],
    pending: BytesMut,
    assembler: &mut ResponseAssembler,
) -> Result<(HttpResponse, bool)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(wire)
        .await
        .map_err(|e| TunnelError::broken(Phase::Request, e))?;
    stream
        .flush()
        .await
        .map_err(|e| TunnelError::broken(Phase::Request, e))?;

    // Bytes held back while they might still be a router error packet
    let mut held = BytesMut::new();
    let mut incoming = pending;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        if !incoming.is_empty() {
            let data = if assembler.headers_parsed() {
                incoming.split()
            } else {
                held.unsplit(incoming.split());
                match classify_lead(&held) {
                    Lead::Http => held.split(),
                    Lead::Undecided | Lead::RouterError { complete: false } => BytesMut::new(),
                    Lead::RouterError { complete: true } => return Err(late_rejection(&held)),
                }
            };
            if !data.is_empty() {
                if let Some(response) = assembler.push(&data)? {
                    return Ok((response, false));
                }
            }
        }

        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| TunnelError::broken(Phase::Response, e))?;
        if n == 0 {
            if is_error_packet(&held) {
                return Err(late_rejection(&held));
            }
            if !held.is_empty() {
                if let Some(response) = assembler.push(&held)? {
                    return Ok((response, true));
                }
            }
            return assembler.finish().map(|response| (response, true));
        }
        incoming.extend_from_slice(&buf[..n]);
    }
}

fn late_rejection(packet: &[u8]) -> TunnelError {
    let (code, detail) = match decode_route_reply(packet) {
        Ok(RouteReply::Rejected { code, detail }) => (code, detail),
        _ => (-1, None),
    };
    warn!("Router refused the route after the handshake: code {}", code);
    rejected(code, detail)
}
