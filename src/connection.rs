// ABOUTME: The per-endpoint multiplexing connection: one socket, two pumps, 128 streams
// ABOUTME: Owns framing, stream correlation, and the single failure path that cancels everything

use crate::codec::{CodecError, FrameHeader, FrameReader, FrameWriter, Opcode, ProtocolVersion};
use crate::config::ConnectionConfig;
use crate::error::{TransportError, TransportResult};
use crate::instrument::{Instrumentation, RequestToken, TraceEvent};
use crate::queue::RequestQueue;
use crate::sink::{CollectSink, ResponseHandler, ResponseSink, SinkHandler};
use crate::streams::{InFlight, PendingTable, StreamIdPool};
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Fixed keepalive probe interval once the idle threshold fires.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);

/// Tokens the handshake uses for its own two exchanges.
const STARTUP_TOKEN: RequestToken = RequestToken(0);
const CREDENTIALS_TOKEN: RequestToken = RequestToken(1);

/// The immutable record of one accepted request: how to serialize it, how
/// to deliver its response, and who to blame in trace events.
pub(crate) struct RequestDescriptor {
    pub writer: Box<dyn FnOnce(&mut FrameWriter) -> Result<(), CodecError> + Send>,
    pub handler: Box<dyn ResponseHandler>,
    pub token: RequestToken,
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

type FailureListener = Box<dyn FnOnce(&TransportError) + Send>;

/// State shared between the public handle and both pumps.
struct Shared {
    queue: RequestQueue,
    pool: StreamIdPool,
    pending: PendingTable,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    failure_listeners: Mutex<Vec<FailureListener>>,
    instrumentation: Arc<dyn Instrumentation>,
    version: ProtocolVersion,
}

impl Shared {
    /// The single teardown path; first caller wins, everyone else no-ops.
    ///
    /// Stops admission, unparks both pumps, terminates every accepted but
    /// unfinished request with `Cancelled`, then raises the failure event
    /// once (pump faults) or silently drops the subscriptions (explicit
    /// close). Either way the listener list empties, breaking cycles.
    fn shutdown(&self, reason: Option<TransportError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let queued = self.queue.close();
        self.pool.close();
        let _ = self.shutdown_tx.send(true);

        for mut desc in queued {
            self.instrumentation
                .client_trace(desc.token, TraceEvent::Cancellation);
            desc.handler.fail(TransportError::Cancelled);
        }
        for mut entry in self.pending.drain() {
            self.instrumentation
                .client_trace(entry.token, TraceEvent::Cancellation);
            entry.handler.fail(TransportError::Cancelled);
        }

        let listeners = std::mem::take(&mut *self.failure_listeners.lock().unwrap());
        if let Some(err) = reason {
            warn!(error = %err, "connection failed");
            for listener in listeners {
                listener(&err);
            }
        }
    }
}

/// A single long-lived TCP connection multiplexing up to 128 concurrently
/// outstanding requests, each tagged with a one-byte stream id.
///
/// Callers submit from any task via [`Connection::execute`]; a dedicated
/// write pump serializes admission order onto the socket and a dedicated
/// read pump demultiplexes responses back to their sinks. Any I/O fault on
/// either pump cancels everything outstanding, refuses new work, and fires
/// the failure notification exactly once.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connect to `(address, config.port)`, tune the socket, start both
    /// pumps, then run the readify handshake through them.
    ///
    /// A handshake failure (including `InvalidCredentials`) tears the pumps
    /// down before returning; the connection never reaches `Ready`.
    pub async fn open(
        address: IpAddr,
        config: &ConnectionConfig,
        instrumentation: Arc<dyn Instrumentation>,
    ) -> TransportResult<Connection> {
        let stream = TcpStream::connect((address, config.port)).await?;
        apply_socket_options(&stream, config)?;
        let (read_half, write_half) = stream.into_split();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue: RequestQueue::new(),
            pool: StreamIdPool::new(),
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
            shutdown_tx,
            failure_listeners: Mutex::new(Vec::new()),
            instrumentation,
            version: config.version,
        });

        tokio::spawn(write_pump(
            shared.clone(),
            write_half,
            config.send_timeout(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_pump(
            shared.clone(),
            read_half,
            config.receive_timeout(),
            shutdown_rx,
        ));

        let connection = Connection { shared };
        if let Err(err) = connection.readify(config).await {
            connection.shared.shutdown(None);
            return Err(err);
        }
        Ok(connection)
    }

    /// Submit a request.
    ///
    /// The writer capability serializes the body into the frame and
    /// declares its opcode; the decode capability is pulled once per item
    /// until it returns `Ok(None)`, each item landing in the sink.
    ///
    /// Never waits for a stream id or for the socket; admission may only
    /// contend on the queue mutex. Only an *accepted* request is owed a
    /// terminal sink call: a synchronous rejection here carries the outcome
    /// in the returned error instead.
    pub fn execute<T, W, D, S>(
        &self,
        writer: W,
        decode: D,
        token: RequestToken,
        sink: S,
    ) -> TransportResult<()>
    where
        W: FnOnce(&mut FrameWriter) -> Result<(), CodecError> + Send + 'static,
        D: FnMut(&mut FrameReader) -> Result<Option<T>, CodecError> + Send + 'static,
        S: ResponseSink<T> + 'static,
        T: 'static,
    {
        let desc = RequestDescriptor {
            writer: Box::new(writer),
            handler: Box::new(SinkHandler::new(decode, sink)),
            token,
        };
        self.shared.queue.enqueue(desc).map_err(|(_, err)| err)
    }

    /// One-shot request/response convenience over [`Connection::execute`]:
    /// resolves with every decoded item once the sink completes.
    pub async fn round_trip<T, W, D>(
        &self,
        writer: W,
        decode: D,
        token: RequestToken,
    ) -> TransportResult<Vec<T>>
    where
        W: FnOnce(&mut FrameWriter) -> Result<(), CodecError> + Send + 'static,
        D: FnMut(&mut FrameReader) -> Result<Option<T>, CodecError> + Send + 'static,
        T: Send + 'static,
    {
        let (sink, reply) = CollectSink::channel();
        self.execute(writer, decode, token, sink)?;
        reply.await.map_err(|_| TransportError::Cancelled)?
    }

    /// Idempotent explicit close: cancels everything outstanding, refuses
    /// new work, and drops the failure subscriptions without firing them.
    pub fn close(&self) {
        self.shared.shutdown(None);
    }

    /// True once the connection stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to the single failure notification raised when a pump hits
    /// an I/O fault. Delivered at most once; an explicit [`Connection::close`]
    /// never fires it. A registration after close is discarded.
    pub fn on_failure(&self, listener: impl FnOnce(&TransportError) + Send + 'static) {
        let mut listeners = self.shared.failure_listeners.lock().unwrap();
        if self.is_closed() {
            return;
        }
        listeners.push(Box::new(listener));
    }

    /// The readify handshake: a startup exchange, then a credentials round
    /// if the server asks for authentication. Runs through the ordinary
    /// pump machinery, which is why the pumps start before it.
    async fn readify(&self, config: &ConnectionConfig) -> TransportResult<()> {
        let cql_version = config.cql_version.clone();
        let auth_required = self
            .round_trip(
                move |w: &mut FrameWriter| {
                    w.set_opcode(Opcode::Startup);
                    w.write_string_map(&[("CQL_VERSION", cql_version.as_str())]);
                    Ok(())
                },
                decode_startup_reply(),
                STARTUP_TOKEN,
            )
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::Cancelled)?;

        if !auth_required {
            return Ok(());
        }

        let (user, password) = match (&config.user, &config.password) {
            (Some(user), Some(password)) => (user.clone(), password.clone()),
            _ => return Err(TransportError::InvalidCredentials),
        };
        self.round_trip(
            move |w: &mut FrameWriter| {
                w.set_opcode(Opcode::Credentials);
                w.write_string_map(&[("username", user.as_str()), ("password", password.as_str())]);
                Ok(())
            },
            decode_ready_reply(),
            CREDENTIALS_TOKEN,
        )
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn free_stream_ids(&self) -> usize {
        self.shared.pool.available()
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.shared.pending.occupied()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown(None);
    }
}

/// Single-item decoder for the startup reply: does the server want a
/// credentials round?
fn decode_startup_reply() -> impl FnMut(&mut FrameReader) -> Result<Option<bool>, CodecError> + Send
{
    let mut done = false;
    move |reader: &mut FrameReader| {
        if done {
            return Ok(None);
        }
        done = true;
        match reader.opcode() {
            Opcode::Ready => Ok(Some(false)),
            Opcode::Authenticate => {
                let _authenticator = reader.read_string()?;
                Ok(Some(true))
            }
            other => Err(CodecError::UnexpectedOpcode {
                expected: Opcode::Ready,
                actual: other,
            }),
        }
    }
}

/// Single-item decoder accepting only a `Ready` reply.
fn decode_ready_reply() -> impl FnMut(&mut FrameReader) -> Result<Option<()>, CodecError> + Send {
    let mut done = false;
    move |reader: &mut FrameReader| {
        if done {
            return Ok(None);
        }
        done = true;
        match reader.opcode() {
            Opcode::Ready => Ok(Some(())),
            other => Err(CodecError::UnexpectedOpcode {
                expected: Opcode::Ready,
                actual: other,
            }),
        }
    }
}

/// Socket tuning applied before the pumps start: no Nagle, hard close on
/// drop, optional keepalive probing.
fn apply_socket_options(stream: &TcpStream, config: &ConnectionConfig) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_linger(Some(Duration::ZERO))?;
    if config.keepalive {
        let mut keepalive = TcpKeepalive::new();
        if config.keepalive_time_ms > 0 {
            keepalive = keepalive
                .with_time(Duration::from_millis(config.keepalive_time_ms))
                .with_interval(KEEPALIVE_INTERVAL);
        }
        sock.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Single writer: drains the queue in admission order, correlates each
/// request with a stream id, and puts exactly one contiguous frame on the
/// wire per request.
async fn write_pump(
    shared: Arc<Shared>,
    mut socket: OwnedWriteHalf,
    send_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let desc = match shared.queue.dequeue().await {
            Ok(desc) => desc,
            // Closed; the shutdown path owns every remaining sink.
            Err(_) => return,
        };
        let RequestDescriptor {
            writer,
            mut handler,
            token,
        } = desc;

        let mut frame_writer = FrameWriter::new(shared.version);
        if let Err(err) = writer(&mut frame_writer) {
            // An encoder fault is this caller's problem alone: no bytes
            // reached the socket and no stream id was consumed.
            handler.fail(TransportError::Encoder(err));
            continue;
        }

        let id = match shared.pool.acquire().await {
            Ok(id) => id,
            Err(_) => {
                handler.fail(TransportError::Cancelled);
                return;
            }
        };

        let frame = match frame_writer.finish(id) {
            Ok(frame) => frame,
            Err(err) => {
                shared.pool.release(id);
                handler.fail(TransportError::Encoder(err));
                continue;
            }
        };

        // Publish before writing: the response must never beat the entry.
        if let Err(mut entry) = shared.pending.put(id, InFlight { handler, token }) {
            entry.handler.fail(TransportError::Cancelled);
            return;
        }

        shared
            .instrumentation
            .client_trace(token, TraceEvent::BeginWrite);
        let written = tokio::select! {
            result = write_all_timed(&mut socket, &frame, send_timeout) => result,
            _ = shutdown.changed() => return,
        };
        match written {
            Ok(()) => shared
                .instrumentation
                .client_trace(token, TraceEvent::EndWrite),
            Err(err) => {
                debug!(stream = id, error = %err, "write pump fault");
                shared.shutdown(Some(TransportError::Io(err)));
                return;
            }
        }
    }
}

/// Single reader: demultiplexes response frames back to their sinks.
async fn read_pump(
    shared: Arc<Shared>,
    mut socket: OwnedReadHalf,
    receive_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            result = read_frame(&mut socket, receive_timeout) => result,
            _ = shutdown.changed() => return,
        };
        let (header, body) = match frame {
            Ok(frame) => frame,
            Err(ReadError::Io(err)) => {
                shared.shutdown(Some(TransportError::Io(err)));
                return;
            }
            Err(ReadError::Framing(err)) => {
                shared.shutdown(Some(framing_fault(err)));
                return;
            }
        };

        if header.stream < 0 {
            // Reserved for server-initiated events. The body was already
            // consumed, so framing stays aligned.
            debug!(stream = header.stream, opcode = ?header.opcode, "ignoring server event frame");
            continue;
        }

        let Some(mut entry) = shared.pending.take(header.stream) else {
            // A response for a stream nobody is waiting on: the frame
            // boundary can no longer be trusted.
            let err = io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response on idle stream {}", header.stream),
            );
            shared.shutdown(Some(TransportError::Io(err)));
            return;
        };
        // The id goes back before any decoding so long-running decoders
        // never starve admission; safe because the slot is already clear.
        shared.pool.release(header.stream);

        shared
            .instrumentation
            .client_trace(entry.token, TraceEvent::BeginRead);
        match FrameReader::new(header, body) {
            Ok(mut reader) => {
                if let Some((code, message)) = reader.server_error() {
                    entry.handler.fail(TransportError::Protocol {
                        code: *code,
                        message: message.clone(),
                    });
                } else {
                    entry.handler.deliver(&mut reader);
                }
                shared
                    .instrumentation
                    .client_trace(entry.token, TraceEvent::EndRead);
                if let Some(tracing_id) = reader.tracing_id() {
                    shared.instrumentation.server_trace(entry.token, tracing_id);
                }
            }
            Err(err) => {
                // The tracing/error prologue failed to parse. The body was
                // consumed whole, so this stays isolated to one request.
                entry.handler.fail(TransportError::Decoder(err));
                shared
                    .instrumentation
                    .client_trace(entry.token, TraceEvent::EndRead);
            }
        }
    }
}

enum ReadError {
    Io(io::Error),
    Framing(CodecError),
}

/// Read one complete frame: the fixed header, then exactly `length` body
/// bytes. Buffering the body in full keeps decoding off the socket.
async fn read_frame(
    socket: &mut OwnedReadHalf,
    limit: Option<Duration>,
) -> Result<(FrameHeader, Bytes), ReadError> {
    let mut raw = [0u8; FrameHeader::SIZE];
    read_exact_timed(socket, &mut raw, limit)
        .await
        .map_err(ReadError::Io)?;
    let header = FrameHeader::decode(&raw).map_err(ReadError::Framing)?;

    let mut body = vec![0u8; header.length as usize];
    read_exact_timed(socket, &mut body, limit)
        .await
        .map_err(ReadError::Io)?;
    Ok((header, Bytes::from(body)))
}

async fn read_exact_timed(
    socket: &mut OwnedReadHalf,
    buf: &mut [u8],
    limit: Option<Duration>,
) -> io::Result<()> {
    match limit {
        Some(limit) => match timeout(limit, socket.read_exact(buf)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "receive timed out",
            )),
        },
        None => socket.read_exact(buf).await.map(|_| ()),
    }
}

async fn write_all_timed(
    socket: &mut OwnedWriteHalf,
    frame: &[u8],
    limit: Option<Duration>,
) -> io::Result<()> {
    match limit {
        Some(limit) => match timeout(limit, socket.write_all(frame)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
        },
        None => socket.write_all(frame).await,
    }
}

/// Framing desynchronization is unrecoverable in place; it propagates as an
/// I/O fault so the whole connection comes down.
fn framing_fault(err: CodecError) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
}
