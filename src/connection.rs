//! Async WebSocket connection
//!
//! A [`Connection`] owns one upgraded socket. A spawned read task feeds the
//! socket bytes into the sans-I/O [`Protocol`] and carries out the actions it
//! returns; application code sends through the `send_*` methods and receives
//! through the [`Events`] stream handed out at construction.
//!
//! There is no outbound queue. Every send is written to the transport
//! directly, one frame per `write_all`, under the writer lock. Writes race
//! the destroy signal, so [`Connection::terminate`] cuts off a write that a
//! stalled peer is blocking.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::protocol::{Action, Message, Protocol, Role};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something that happened on a connection
#[derive(Debug)]
pub enum Event {
    /// A complete text or binary message
    Message(Message),
    /// A pong frame arrived
    Pong(Bytes),
    /// The connection is gone; emitted exactly once, always last
    Close(CloseReason),
    /// The transport failed or the peer broke the protocol
    Error(Error),
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    close_timer: Option<JoinHandle<()>>,
}

struct Inner {
    id: u64,
    role: Role,
    config: Config,
    protocol: Mutex<Protocol>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    tasks: Mutex<Tasks>,
    awaiting_pong: AtomicBool,
    destroyed: AtomicBool,
    destroy_signal: watch::Sender<bool>,
}

/// Handle to a WebSocket connection
///
/// Cheap to clone; all clones refer to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap an already-upgraded stream.
    ///
    /// `head` holds bytes read past the HTTP head during the handshake; they
    /// are processed before anything read from `stream`. Must be called from
    /// within a Tokio runtime.
    pub fn new<S>(stream: S, role: Role, config: Config, head: Bytes) -> (Self, Events)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            role,
            protocol: Mutex::new(Protocol::new(
                role,
                config.max_buffer,
                config.max_message_size,
            )),
            config,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            events: Mutex::new(Some(tx)),
            tasks: Mutex::new(Tasks::default()),
            awaiting_pong: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            destroy_signal: watch::Sender::new(false),
        });
        let conn = Connection { inner };
        debug!(id = conn.id(), ?role, "connection opened");

        let task = tokio::spawn(conn.clone().read_loop(reader, head));
        conn.inner.tasks.lock().reader = Some(task);

        (conn, Events { rx })
    }

    /// Server-side connection
    pub fn server<S>(stream: S, config: Config, head: Bytes) -> (Self, Events)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(stream, Role::Server, config, head)
    }

    /// Client-side connection
    pub fn client<S>(stream: S, config: Config, head: Bytes) -> (Self, Events)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(stream, Role::Client, config, head)
    }

    /// Process-unique connection id
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether messages can still be sent
    pub fn is_open(&self) -> bool {
        !self.is_closed() && !self.inner.protocol.lock().is_closing()
    }

    /// Whether the socket has been destroyed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// The peer's close code and reason, once its Close frame has arrived
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.protocol.lock().received_close().cloned()
    }

    /// Send a text message. Returns `Ok(false)` if the connection is closing.
    pub async fn send_text(&self, text: &str) -> Result<bool> {
        self.send_frame(OpCode::Text, text.as_bytes()).await
    }

    /// Send a binary message. Returns `Ok(false)` if the connection is closing.
    pub async fn send_binary(&self, data: &[u8]) -> Result<bool> {
        self.send_frame(OpCode::Binary, data).await
    }

    /// Send a complete message
    pub async fn send_message(&self, msg: &Message) -> Result<bool> {
        self.send_frame(msg.opcode(), msg.as_bytes()).await
    }

    /// Send a ping (payload at most 125 bytes)
    pub async fn send_ping(&self, data: &[u8]) -> Result<bool> {
        if data.len() > crate::MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFrameTooLarge);
        }
        self.send_frame(OpCode::Ping, data).await
    }

    /// Send an unsolicited pong (payload at most 125 bytes)
    pub async fn send_pong(&self, data: &[u8]) -> Result<bool> {
        if data.len() > crate::MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFrameTooLarge);
        }
        self.send_frame(OpCode::Pong, data).await
    }

    /// Start the close handshake.
    ///
    /// Sends a Close frame and arms the close timer: if the peer has not
    /// answered within `close_timeout` the socket is ended, then destroyed
    /// after `close_grace`. Returns `Ok(false)` if a Close was already sent.
    pub async fn send_close(&self, code: u16, reason: &str) -> Result<bool> {
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if reason.len() + 2 > crate::MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFrameTooLarge);
        }
        if self.is_closed() {
            return Ok(false);
        }

        let mut actions = Vec::new();
        let sent = self
            .inner
            .protocol
            .lock()
            .close(Some(CloseReason::new(code, reason)), &mut actions);
        if !sent {
            return Ok(false);
        }
        // Arm before queueing for the writer, which a stalled write may hold
        if actions.first() == Some(&Action::ArmCloseTimer) {
            self.arm_close_timer();
            actions.remove(0);
        }

        let mut writer = self.inner.writer.lock().await;
        self.run(actions, &mut writer).await;
        self.release_writer(&mut writer);
        Ok(sent)
    }

    /// Normal closure (1000) with no reason
    pub async fn close(&self) -> Result<bool> {
        self.send_close(CloseReason::NORMAL, "").await
    }

    /// Destroy the socket immediately.
    ///
    /// Cancels the read task, the close timer and any write in flight, then
    /// emits the final [`Event::Close`]. Safe to call any number of times
    /// from any state.
    pub fn terminate(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.protocol.lock().abort();
        self.inner.destroy_signal.send_replace(true);

        {
            let mut tasks = self.inner.tasks.lock();
            if let Some(timer) = tasks.close_timer.take() {
                timer.abort();
            }
            if let Some(reader) = tasks.reader.take() {
                reader.abort();
            }
        }

        // A write in flight holds the lock; it drops the writer once the
        // destroy signal cancels it.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }

        let reason = self
            .close_reason()
            .unwrap_or_else(|| CloseReason::new(CloseReason::ABNORMAL, ""));
        debug!(id = self.id(), %reason, "connection destroyed");

        if let Some(tx) = self.inner.events.lock().take() {
            let _ = tx.send(Event::Close(reason));
        }
    }

    /// Mark the connection as waiting for a pong.
    ///
    /// Returns the previous value: `true` means the last ping was never
    /// answered.
    pub(crate) fn mark_awaiting_pong(&self) -> bool {
        self.inner.awaiting_pong.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn is_awaiting_pong(&self) -> bool {
        self.inner.awaiting_pong.load(Ordering::Acquire)
    }

    async fn send_frame(&self, opcode: OpCode, payload: &[u8]) -> Result<bool> {
        let mut writer = self.inner.writer.lock().await;
        let Some(bytes) = self.inner.protocol.lock().encode(opcode, payload) else {
            return Ok(false);
        };

        let result = self.write(&mut writer, &bytes).await;
        if let Err(e) = &result {
            debug!(id = self.id(), error = %e, "write failed");
        }
        self.release_writer(&mut writer);
        result
    }

    /// Write one batch unless the connection is destroyed first.
    ///
    /// Returns `Ok(false)` when nothing was written, in which case the
    /// writer has been dropped.
    async fn write(&self, writer: &mut Option<BoxedWriter>, bytes: &[u8]) -> Result<bool> {
        let Some(w) = writer.as_mut() else {
            return Ok(false);
        };

        let outcome = tokio::select! {
            result = write_batch(w, bytes) => Some(result),
            () = destroyed(self.inner.destroy_signal.subscribe()) => None,
        };

        match outcome {
            Some(result) => result.map(|()| true),
            None => {
                debug!(id = self.id(), "write cut off by destroy");
                writer.take();
                Ok(false)
            }
        }
    }

    async fn read_loop<R>(self, mut reader: R, head: Bytes)
    where
        R: AsyncRead + Send + Unpin,
    {
        if !head.is_empty() {
            self.process(&head).await;
        }

        let mut buf = BytesMut::with_capacity(crate::RECV_BUFFER_SIZE);
        while !self.is_closed() {
            buf.clear();
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(id = self.id(), "peer closed the socket");
                    break;
                }
                Ok(_) => self.process(&buf).await,
                Err(e) => {
                    self.emit(Event::Error(e.into()));
                    break;
                }
            }
        }
        self.terminate();
    }

    async fn process(&self, data: &[u8]) {
        let mut writer = self.inner.writer.lock().await;
        let mut actions = Vec::new();
        self.inner.protocol.lock().receive(data, &mut actions);
        self.run(actions, &mut writer).await;
        self.release_writer(&mut writer);
    }

    /// Carry out protocol actions in order, with the writer lock held
    async fn run(&self, actions: Vec<Action>, writer: &mut Option<BoxedWriter>) {
        for action in actions {
            match action {
                Action::Write(bytes) => match self.write(writer, &bytes).await {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        self.emit(Event::Error(e));
                        writer.take();
                        self.terminate();
                        return;
                    }
                },
                Action::Message(msg) => self.emit(Event::Message(msg)),
                Action::Pong(payload) => {
                    self.inner.awaiting_pong.store(false, Ordering::Release);
                    self.emit(Event::Pong(payload));
                }
                Action::ArmCloseTimer => self.arm_close_timer(),
                Action::Terminate => self.terminate(),
                Action::Violation(v) => self.emit(Event::Error(Error::Violation(v))),
            }
        }
    }

    fn release_writer(&self, writer: &mut Option<BoxedWriter>) {
        if self.is_closed() {
            writer.take();
        }
    }

    fn arm_close_timer(&self) {
        if self.is_closed() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.close_timeout;
        let grace = self.inner.config.close_grace;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            // A stalled write may hold the writer; never wait past the grace
            let deadline = tokio::time::Instant::now() + grace;
            {
                let conn = Connection { inner };
                debug!(id = conn.id(), "close timed out, ending socket");
                let _ = tokio::time::timeout_at(deadline, conn.end()).await;
            }

            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.terminate();
            }
        });

        if let Some(previous) = self.inner.tasks.lock().close_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Half-close the socket
    async fn end(&self) {
        let mut writer = self.inner.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            let _ = w.shutdown().await;
        }
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = self.inner.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Resolves once the connection is destroyed
async fn destroyed(mut signal: watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

async fn write_batch(writer: &mut BoxedWriter, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Receiving half of a connection
///
/// Yields every [`Event`] in order and ends after [`Event::Close`].
#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    /// Wait for the next event; `None` after the connection is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Wait for the next application message, skipping pongs and errors
    pub async fn next_message(&mut self) -> Option<Message> {
        while let Some(event) = self.rx.recv().await {
            match event {
                Event::Message(msg) => return Some(msg),
                Event::Close(_) => return None,
                Event::Pong(_) | Event::Error(_) => {}
            }
        }
        None
    }
}

impl Stream for Events {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}
