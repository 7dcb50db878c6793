use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::config::TcpTransportConfig;
use crate::safe_converter::PrecheckedCast;
use crate::tcp::frame::{handshake_frame, HandshakeMessage, TcpFrameHeader, TcpFrameKind, TCP_PROTOCOL_VERSION};
use crate::tcp::{SessionState, SessionStateCell};

/// Per-session payload callback. It runs on the session's I/O task and the
///  next frame is not read before it returns, so delivery within a session
///  is strictly in order and undelivered messages cannot pile up - which
///  also means the callback must be cheap, expensive work belongs on
///  another queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadHandler: Send + Sync + 'static {
    async fn on_payload(&self, payload: &[u8]);
}

type SessionList = Arc<Mutex<Vec<Arc<SubscriberSession>>>>;

/// The connecting side of the TCP path: maintains one session per
///  publisher endpoint, all delivering into the same handler.
pub struct Subscriber {
    config: Arc<TcpTransportConfig>,
    handler: Arc<dyn PayloadHandler>,
    buffer_pool: Arc<BufferPool>,
    sessions: SessionList,
}

impl Subscriber {
    pub fn new(config: Arc<TcpTransportConfig>, handler: Arc<dyn PayloadHandler>) -> anyhow::Result<Subscriber> {
        config.validate()?;

        let buffer_pool = Arc::new(BufferPool::new(config.receive_buffer_capacity, config.receive_buffer_pool_size));

        Ok(Subscriber {
            config,
            handler,
            buffer_pool,
            sessions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Starts a session towards a publisher endpoint. Connecting, the
    ///  handshake and all reconnection attempts happen asynchronously - a
    ///  publisher that does not exist (yet) simply keeps the session in its
    ///  retry loop.
    pub fn connect_to(&self, address: impl Into<String>, port: u16) -> Arc<SubscriberSession> {
        let session = Arc::new(SubscriberSession {
            address: address.into(),
            port,
            config: self.config.clone(),
            handler: self.handler.clone(),
            buffer_pool: self.buffer_pool.clone(),
            state: SessionStateCell::new(),
            task_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(session.clone().run(Arc::downgrade(&self.sessions)));
        *session.task_handle.lock().unwrap() = Some(handle);

        self.sessions.lock().unwrap().push(session.clone());
        session
    }

    /// number of sessions that are past their handshake and delivering
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().iter()
            .filter(|s| s.state() == SessionState::Running)
            .count()
    }

    #[cfg(test)]
    fn raw_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// idempotent; tears down all sessions
    pub fn cancel(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for session in sessions {
            session.cancel();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel();
    }
}


/// One logical connection to a publisher, surviving actual TCP connections:
///  on any connect or read failure the session goes through
///  resolve -> connect -> handshake again, gated by the configured retry
///  budget. A successfully received payload refills the budget - sustained
///  connectivity resets failure history.
pub struct SubscriberSession {
    address: String,
    port: u16,
    config: Arc<TcpTransportConfig>,
    handler: Arc<dyn PayloadHandler>,
    buffer_pool: Arc<BufferPool>,
    state: SessionStateCell,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriberSession {
    async fn run(self: Arc<Self>, parent: Weak<Mutex<Vec<Arc<SubscriberSession>>>>) {
        let mut retries_left = self.config.max_reconnection_attempts;

        loop {
            if self.state.is_canceled() {
                break;
            }

            match self.run_connection(&mut retries_left).await {
                Ok(()) => break, // canceled from within the frame loop
                Err(e) => {
                    if self.state.is_canceled() {
                        break;
                    }
                    debug!("subscriber session {}:{}: connection failed: {}", self.address, self.port, e);
                }
            }

            if retries_left == 0 {
                debug!("subscriber session {}:{}: retries exhausted, giving up", self.address, self.port);
                break;
            }
            if retries_left > 0 {
                retries_left -= 1;
            }

            trace!("subscriber session {}:{}: reconnecting in {:?}", self.address, self.port, self.config.retry_delay);
            sleep(self.config.retry_delay).await;
        }

        self.close(&parent);
    }

    async fn run_connection(&self, retries_left: &mut i32) -> anyhow::Result<()> {
        let endpoint = self.resolve().await?;

        let stream = TcpStream::connect(endpoint).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set tcp nodelay for {}: {} - latency may suffer", endpoint, e);
        }

        self.frame_loop(stream, retries_left).await
    }

    async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        let endpoints = lookup_host((self.address.as_str(), self.port)).await?
            .collect::<Vec<_>>();

        // when the name resolves to several endpoints, a loopback one wins
        match endpoints.iter().find(|a| a.ip().is_loopback()).or(endpoints.first()) {
            Some(&endpoint) => Ok(endpoint),
            None => bail!("address '{}' did not resolve to any endpoint", self.address),
        }
    }

    /// Drives one established connection: sends the handshake (the
    ///  connecting side speaks first), then reads frames until the
    ///  connection fails or the session is canceled.
    async fn frame_loop<S>(&self, stream: S, retries_left: &mut i32) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        self.state.set(SessionState::Handshaking);
        writer.write_all(&handshake_frame()).await?;

        loop {
            if self.state.is_canceled() {
                return Ok(());
            }

            let header = TcpFrameHeader::read(&mut reader).await?;
            if header.data_size > self.config.max_message_size {
                bail!("frame declares {} payload bytes, above the configured maximum of {}", header.data_size, self.config.max_message_size);
            }

            match header.kind {
                TcpFrameKind::ProtocolHandshake => {
                    let mut payload = vec![0u8; header.data_size.prechecked_cast()];
                    reader.read_exact(&mut payload).await?;

                    let handshake = HandshakeMessage::try_deser(&payload)?;
                    if handshake.protocol_version > TCP_PROTOCOL_VERSION {
                        bail!("publisher requires protocol version {} which this build does not support", handshake.protocol_version);
                    }
                    debug!("subscriber session {}:{}: connected, protocol version {}", self.address, self.port, handshake.protocol_version);
                    self.state.set(SessionState::Running);
                }
                TcpFrameKind::RegularPayload => {
                    if header.data_size == 0 {
                        trace!("subscriber session {}:{}: empty payload frame", self.address, self.port);
                        continue;
                    }

                    let mut buf = self.buffer_pool.get();
                    buf.resize(header.data_size.prechecked_cast(), 0);
                    reader.read_exact(&mut buf[..]).await?;

                    // deliver before starting the next read - this is what
                    // keeps per-session delivery in order and bounded
                    self.handler.on_payload(&buf).await;

                    *retries_left = self.config.max_reconnection_attempts;
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn address(&self) -> (&str, u16) {
        (&self.address, self.port)
    }

    /// idempotent teardown, safe from any thread
    pub fn cancel(&self) {
        if !self.state.cancel() {
            return;
        }
        debug!("canceling subscriber session {}:{}", self.address, self.port);

        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn close(self: &Arc<Self>, parent: &Weak<Mutex<Vec<Arc<SubscriberSession>>>>) {
        let _ = self.state.cancel();

        if let Some(parent) = parent.upgrade() {
            parent.lock().unwrap().retain(|s| !Arc::ptr_eq(s, self));
        }
        debug!("subscriber session {}:{} closed", self.address, self.port);
    }

    #[cfg(test)]
    fn for_test(config: Arc<TcpTransportConfig>, handler: Arc<dyn PayloadHandler>) -> SubscriberSession {
        SubscriberSession {
            address: "localhost".to_string(),
            port: 0,
            config: config.clone(),
            handler,
            buffer_pool: Arc::new(BufferPool::new(config.receive_buffer_capacity, config.receive_buffer_pool_size)),
            state: SessionStateCell::new(),
            task_handle: Mutex::new(None),
        }
    }
}
