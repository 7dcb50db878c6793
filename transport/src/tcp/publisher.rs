use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::bail;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::TcpTransportConfig;
use crate::safe_converter::PrecheckedCast;
use crate::tcp::frame::{handshake_frame, regular_payload_frame, HandshakeMessage, TcpFrameHeader, TcpFrameKind, TCP_PROTOCOL_VERSION};
use crate::tcp::{SessionState, SessionStateCell};

type SessionList = Arc<Mutex<Vec<Arc<PublisherSession>>>>;

/// The accepting side of the TCP path: listens for subscriber connections
///  and fans every sent sample out to all connected sessions.
pub struct Publisher {
    local_addr: SocketAddr,
    sessions: SessionList,
    accept_handle: JoinHandle<()>,
    canceled: AtomicBool,
}

impl Publisher {
    pub async fn bind(addr: SocketAddr, config: Arc<TcpTransportConfig>) -> anyhow::Result<Publisher> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("publisher accepting subscribers on {}", local_addr);

        let sessions: SessionList = Arc::new(Mutex::new(Vec::new()));
        let accept_handle = tokio::spawn(Self::accept_loop(listener, sessions.clone(), config));

        Ok(Publisher {
            local_addr,
            sessions,
            accept_handle,
            canceled: AtomicBool::new(false),
        })
    }

    async fn accept_loop(listener: TcpListener, sessions: SessionList, config: Arc<TcpTransportConfig>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("accepted subscriber connection from {}", peer_addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        // Nagle's algorithm would delay small frames waiting
                        // for more data, which is exactly wrong for samples
                        warn!("failed to set tcp nodelay for {}: {} - latency may suffer", peer_addr, e);
                    }

                    let session = PublisherSession::spawn(stream, peer_addr, Arc::downgrade(&sessions), config.clone());
                    sessions.lock().unwrap().push(session);
                }
                Err(e) => {
                    error!("error accepting subscriber connection: {}", e);
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// number of sessions that have completed their handshake - callers use
    ///  this for flow-control decisions, since sends without any subscriber
    ///  simply vanish
    pub fn subscriber_count(&self) -> usize {
        self.sessions.lock().unwrap().iter()
            .filter(|s| s.state() == SessionState::Running)
            .count()
    }

    /// Frames the payload once and hands it to every running session.
    ///  Returns false if there was no session to hand it to. Note that a
    ///  session under backpressure may still coalesce this payload away -
    ///  see [PublisherSession::send_frame].
    pub fn send(&self, payload: &[u8]) -> bool {
        if self.canceled.load(Ordering::Acquire) {
            return false;
        }

        let frame = regular_payload_frame(payload).freeze();

        let sessions = self.sessions.lock().unwrap().clone();
        let mut any_session = false;
        for session in &sessions {
            if session.state() == SessionState::Running {
                session.send_frame(frame.clone());
                any_session = true;
            }
        }
        any_session
    }

    /// idempotent; stops accepting connections and tears down all sessions
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accept_handle.abort();

        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for session in sessions {
            session.cancel();
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel();
    }
}


/// One accepted subscriber connection.
///
/// The write side holds at most one write in flight. A frame arriving while
///  a write is running goes into the single `pending` slot, overwriting
///  whatever was there: under backpressure a burst of sends collapses to
///  its newest value instead of growing a queue, bounding memory to two
///  buffers per session. Callers that need every value delivered have to
///  throttle upstream.
pub struct PublisherSession {
    peer_addr: SocketAddr,
    config: Arc<TcpTransportConfig>,
    state: SessionStateCell,
    pending: Mutex<Option<Bytes>>,
    send_ready: Notify,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PublisherSession {
    pub(crate) fn spawn<S>(
        stream: S,
        peer_addr: SocketAddr,
        parent: Weak<Mutex<Vec<Arc<PublisherSession>>>>,
        config: Arc<TcpTransportConfig>,
    ) -> Arc<PublisherSession>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let session = Arc::new(PublisherSession {
            peer_addr,
            config,
            state: SessionStateCell::new(),
            pending: Mutex::new(None),
            send_ready: Notify::new(),
            task_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(session.clone().run(stream, parent));
        *session.task_handle.lock().unwrap() = Some(handle);

        session
    }

    async fn run<S>(self: Arc<Self>, stream: S, parent: Weak<Mutex<Vec<Arc<PublisherSession>>>>)
    where S: AsyncRead + AsyncWrite + Send + Unpin
    {
        if let Err(e) = self.do_run(stream).await {
            if !self.state.is_canceled() {
                debug!("publisher session {}: {}", self.peer_addr, e);
            }
        }
        self.close(&parent);
    }

    async fn do_run<S>(&self, stream: S) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + Unpin
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        self.state.set(SessionState::Handshaking);

        // the connecting side speaks first
        let header = TcpFrameHeader::read(&mut reader).await?;
        if header.kind != TcpFrameKind::ProtocolHandshake {
            bail!("expected a handshake frame, got {:?}", header.kind);
        }
        if header.data_size > self.config.max_message_size {
            bail!("implausible handshake payload of {} bytes", header.data_size);
        }
        let mut payload = vec![0u8; header.data_size.prechecked_cast()];
        reader.read_exact(&mut payload).await?;

        let handshake = HandshakeMessage::try_deser(&payload)?;
        if handshake.protocol_version > TCP_PROTOCOL_VERSION {
            bail!("subscriber requested protocol version {} which this build does not support", handshake.protocol_version);
        }
        writer.write_all(&handshake_frame()).await?;
        debug!("publisher session {}: handshake complete, protocol version {}", self.peer_addr, handshake.protocol_version);

        self.state.set(SessionState::Running);

        loop {
            self.send_ready.notified().await;
            if self.state.is_canceled() {
                return Ok(());
            }

            while let Some(frame) = self.take_pending() {
                writer.write_all(&frame).await?;
                trace!("publisher session {}: sent frame of {} bytes", self.peer_addr, frame.len());
            }
        }
    }

    fn take_pending(&self) -> Option<Bytes> {
        self.pending.lock().unwrap().take()
    }

    /// Hands a complete frame to this session's write pipeline. Never
    ///  blocks: if the previous write has not finished, the frame replaces
    ///  whatever is waiting in the pending slot (last write wins).
    pub fn send_frame(&self, frame: Bytes) {
        if self.state.get() != SessionState::Running {
            return;
        }

        let replaced = self.pending.lock().unwrap().replace(frame);
        if replaced.is_some() {
            trace!("publisher session {}: backpressure, coalescing to the newest frame", self.peer_addr);
        }
        self.send_ready.notify_one();
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// idempotent teardown, safe from any thread and from concurrent error
    ///  paths racing each other
    pub fn cancel(&self) {
        if !self.state.cancel() {
            return;
        }
        debug!("canceling publisher session {}", self.peer_addr);

        // a write stuck on a dead peer never wakes up on its own
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn close(self: &Arc<Self>, parent: &Weak<Mutex<Vec<Arc<PublisherSession>>>>) {
        let _ = self.state.cancel(); // re-entering the terminal state is a no-op

        if let Some(parent) = parent.upgrade() {
            parent.lock().unwrap().retain(|s| !Arc::ptr_eq(s, self));
        }
        debug!("publisher session {} closed", self.peer_addr);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::runtime::Builder;
    use tokio::time::{sleep, timeout};

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached within the polling budget");
    }

    fn test_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn handshake_as_subscriber(client: &mut tokio::io::DuplexStream) {
        client.write_all(&handshake_frame()).await.unwrap();

        let header = TcpFrameHeader::read(client).await.unwrap();
        assert_eq!(header.kind, TcpFrameKind::ProtocolHandshake);
        let mut payload = vec![0u8; header.data_size as usize];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(HandshakeMessage::try_deser(&payload).unwrap().protocol_version, TCP_PROTOCOL_VERSION);
    }

    #[test]
    fn test_session_handshake() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server, mut client) = tokio::io::duplex(1024);
            let sessions: SessionList = Arc::new(Mutex::new(Vec::new()));

            let session = PublisherSession::spawn(
                server, test_addr(), Arc::downgrade(&sessions), Arc::new(TcpTransportConfig::default_local()));
            assert_ne!(session.state(), SessionState::Running);

            handshake_as_subscriber(&mut client).await;
            wait_for(|| session.state() == SessionState::Running).await;

            session.cancel();
            session.cancel(); // idempotent
            assert_eq!(session.state(), SessionState::Canceled);
        });
    }

    #[test]
    fn test_handshake_version_rejected() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server, mut client) = tokio::io::duplex(1024);
            let sessions: SessionList = Arc::new(Mutex::new(vec![]));

            let session = PublisherSession::spawn(
                server, test_addr(), Arc::downgrade(&sessions), Arc::new(TcpTransportConfig::default_local()));
            sessions.lock().unwrap().push(session.clone());

            let mut frame = handshake_frame();
            *frame.last_mut().unwrap() = TCP_PROTOCOL_VERSION + 1;
            client.write_all(&frame).await.unwrap();

            // the session closes and prunes itself from its parent's list
            wait_for(|| sessions.lock().unwrap().is_empty()).await;
            assert_eq!(session.state(), SessionState::Canceled);
        });
    }

    /// three sends in rapid succession while the first write is stuck on
    ///  backpressure: the first and the last frame arrive, the middle one
    ///  is coalesced away
    #[test]
    fn test_backpressured_sends_coalesce() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            // a pipe smaller than the first frame, so its write blocks
            let (server, mut client) = tokio::io::duplex(64);
            let sessions: SessionList = Arc::new(Mutex::new(Vec::new()));

            let session = PublisherSession::spawn(
                server, test_addr(), Arc::downgrade(&sessions), Arc::new(TcpTransportConfig::default_local()));

            handshake_as_subscriber(&mut client).await;
            wait_for(|| session.state() == SessionState::Running).await;

            session.send_frame(regular_payload_frame(&[b'a'; 256]).freeze());
            sleep(Duration::from_millis(50)).await; // let the write start and fill the pipe

            session.send_frame(regular_payload_frame(b"bbb").freeze());
            session.send_frame(regular_payload_frame(b"ccc").freeze());

            let header = TcpFrameHeader::read(&mut client).await.unwrap();
            assert_eq!(header.data_size, 256);
            let mut payload = vec![0u8; 256];
            client.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, vec![b'a'; 256]);

            let header = TcpFrameHeader::read(&mut client).await.unwrap();
            assert_eq!(header.data_size, 3);
            let mut payload = vec![0u8; 3];
            client.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"ccc");

            // nothing else was transmitted
            let mut one_more = [0u8; 1];
            assert!(timeout(Duration::from_millis(100), client.read_exact(&mut one_more)).await.is_err());
        });
    }

    #[test]
    fn test_send_without_subscribers_returns_false() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let publisher = Publisher::bind(test_addr(), Arc::new(TcpTransportConfig::default_local())).await.unwrap();
            assert_eq!(publisher.subscriber_count(), 0);
            assert!(!publisher.send(b"into the void"));
            publisher.cancel();
        });
    }

    #[test]
    fn test_accepted_connection_becomes_session() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let publisher = Publisher::bind(test_addr(), Arc::new(TcpTransportConfig::default_local())).await.unwrap();

            let mut client = TcpStream::connect(publisher.local_addr()).await.unwrap();
            client.write_all(&handshake_frame()).await.unwrap();
            let header = TcpFrameHeader::read(&mut client).await.unwrap();
            assert_eq!(header.kind, TcpFrameKind::ProtocolHandshake);
            let mut payload = vec![0u8; header.data_size as usize];
            client.read_exact(&mut payload).await.unwrap();

            wait_for(|| publisher.subscriber_count() == 1).await;

            assert!(publisher.send(b"sample"));
            let header = TcpFrameHeader::read(&mut client).await.unwrap();
            assert_eq!(header.kind, TcpFrameKind::RegularPayload);
            let mut payload = vec![0u8; header.data_size as usize];
            client.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"sample");

            publisher.cancel();
            assert_eq!(publisher.subscriber_count(), 0);
        });
    }
}
