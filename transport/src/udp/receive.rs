use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::UdpSampleConfig;
use crate::safe_converter::PrecheckedCast;
use crate::stats::TrafficStats;
use crate::udp::frame::{classify_magic, parse_sample_name, FrameHeader, FrameKind, MagicClass};

/// This trait decouples the reassembly engine from the handling of a
///  completed sample. `accepts` is a cheap predicate that is consulted
///  before memory is committed or payload is deserialized - a receiver that
///  is not interested in a sample name short-circuits the whole message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SampleSink: Send + Sync + 'static {
    fn accepts(&self, sample_name: &str) -> bool;

    /// hands over a complete sample; called outside the slot table lock
    async fn apply(&self, sample_name: &str, sample: &[u8]);
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotMode {
    Waiting,
    Reading,
    Aborted,
    Completed,
}

/// Transient per-message state on the receive path: created when a message
///  is announced, fed by its content fragments, destroyed on completion,
///  integrity violation or timeout.
struct ReceiveSlot {
    message_id: i32,
    expected_fragments: i32,
    total_length: i32,
    received_fragments: i32,
    received_length: i32,
    buffer: Vec<u8>,
    mode: SlotMode,
    last_fragment: Instant,
}

impl ReceiveSlot {
    fn new(message_id: i32, now: Instant) -> ReceiveSlot {
        ReceiveSlot {
            message_id,
            expected_fragments: 0,
            total_length: 0,
            received_fragments: 0,
            received_length: 0,
            buffer: Vec::new(),
            mode: SlotMode::Waiting,
            last_fragment: now,
        }
    }

    fn on_header(&mut self, header: &FrameHeader, now: Instant) {
        self.expected_fragments = header.sequence_number;
        self.total_length = header.length;
        self.received_fragments = 0;
        self.received_length = 0;
        self.buffer.clear();
        self.buffer.reserve(header.length.prechecked_cast());
        self.mode = SlotMode::Reading;
        self.last_fragment = now;
    }

    /// applies one content fragment, returning true when the message just
    ///  became complete. The caller has already bounds-checked `payload`
    ///  against the header's declared length.
    fn on_content(&mut self, header: &FrameHeader, payload: &[u8], now: Instant) -> bool {
        if self.mode != SlotMode::Reading {
            return false;
        }
        self.last_fragment = now;

        if header.id != self.message_id {
            debug!("aborting reassembly: fragment for message {} applied to slot {}", header.id, self.message_id);
            self.mode = SlotMode::Aborted;
            return false;
        }
        if header.sequence_number != self.received_fragments {
            // out-of-order arrival is treated as loss of the whole message,
            // not buffered and reordered
            debug!(
                "aborting reassembly of message {}: expected fragment {}, got {}",
                self.message_id, self.received_fragments, header.sequence_number
            );
            self.mode = SlotMode::Aborted;
            return false;
        }
        if header.length <= 0 {
            debug!("aborting reassembly of message {}: non-positive fragment length {}", self.message_id, header.length);
            self.mode = SlotMode::Aborted;
            return false;
        }

        self.buffer.extend_from_slice(payload);
        self.received_fragments += 1;
        self.received_length += header.length;

        if self.received_fragments == self.expected_fragments {
            self.mode = SlotMode::Completed;
            true
        }
        else {
            false
        }
    }

    fn is_finished(&self) -> bool {
        self.mode == SlotMode::Aborted || self.mode == SlotMode::Completed
    }
}


struct ReceiverInner {
    slots: FxHashMap<i32, ReceiveSlot>,
    last_cleanup: Instant,
}

/// The receive side of the fragmentation engine: raw datagrams go in,
///  complete named samples come out through the [SampleSink].
pub struct SampleReceiver {
    config: Arc<UdpSampleConfig>,
    sink: Arc<dyn SampleSink>,
    stats: Arc<TrafficStats>,
    inner: Mutex<ReceiverInner>,
}

impl SampleReceiver {
    pub fn new(config: Arc<UdpSampleConfig>, sink: Arc<dyn SampleSink>, stats: Arc<TrafficStats>) -> SampleReceiver {
        SampleReceiver {
            config,
            sink,
            stats,
            inner: Mutex::new(ReceiverInner {
                slots: FxHashMap::default(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub async fn on_datagram(&self, datagram: &[u8]) {
        self.on_datagram_at(datagram, Instant::now()).await
    }

    async fn on_datagram_at(&self, datagram: &[u8], now: Instant) {
        if datagram.len() < FrameHeader::SERIALIZED_LEN {
            trace!("undersized datagram of {} bytes - dropping", datagram.len());
            return;
        }

        match classify_magic(datagram) {
            MagicClass::Current => {}
            MagicClass::Legacy => {
                warn!("received traffic of a previous protocol generation - dropping");
                return;
            }
            MagicClass::Foreign => {
                warn!("received datagram without a valid protocol tag - dropping");
                return;
            }
        }

        let mut parse_buf: &[u8] = datagram;
        let header = match FrameHeader::try_deser(&mut parse_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("received datagram with unparseable frame header - dropping: {}", e);
                return;
            }
        };

        // never trust the declared length beyond the bytes actually present
        match header.kind {
            FrameKind::Content | FrameKind::HeaderWithContent => {
                let declared_len: Option<usize> = header.length.try_into().ok();
                if !declared_len.is_some_and(|len| len <= parse_buf.len()) {
                    debug!(
                        "frame for message {} declares {} payload bytes but carries {} - dropping",
                        header.id, header.length, parse_buf.len()
                    );
                    return;
                }
            }
            FrameKind::Header => {}
        }

        self.stats.add_read_bytes(datagram.len() as u64);

        match header.kind {
            FrameKind::HeaderWithContent => self.on_self_contained(&header, parse_buf).await,
            FrameKind::Header => self.on_announcement(&header, now),
            FrameKind::Content => self.on_fragment(&header, parse_buf, now).await,
        }

        self.cleanup_expired(now);
    }

    /// the whole message fits one datagram - no slot involved
    async fn on_self_contained(&self, header: &FrameHeader, payload: &[u8]) {
        let content_len: usize = header.length.prechecked_cast();
        let content = &payload[..content_len];
        match parse_sample_name(content) {
            Ok((name, sample)) => {
                if self.sink.accepts(name) {
                    trace!("self-contained sample '{}' received", name);
                    self.sink.apply(name, sample).await;
                }
                else {
                    trace!("not interested in sample '{}' - skipping", name);
                }
            }
            Err(e) => {
                warn!("self-contained frame without a valid sample name - dropping: {}", e);
            }
        }
    }

    fn on_announcement(&self, header: &FrameHeader, now: Instant) {
        if header.sequence_number <= 0 || header.length < 0 {
            debug!(
                "implausible announcement for message {}: {} fragments, {} bytes - dropping",
                header.id, header.sequence_number, header.length
            );
            return;
        }

        trace!("message {} announced: {} fragments, {} bytes total", header.id, header.sequence_number, header.length);

        let mut slot = ReceiveSlot::new(header.id, now);
        slot.on_header(header, now);

        // an existing slot for the same id is abandoned - ids are random, so
        // a collision means the previous message is stale anyway
        self.inner.lock().unwrap()
            .slots.insert(header.id, slot);
    }

    async fn on_fragment(&self, header: &FrameHeader, payload: &[u8], now: Instant) {
        let content_len: usize = header.length.prechecked_cast();
        let content = &payload[..content_len];

        // fragment 0 carries the sample name: peek it before deciding to
        // keep reassembly state for this message at all
        if header.sequence_number == 0 {
            let interested = match parse_sample_name(content) {
                Ok((name, _)) => self.sink.accepts(name),
                Err(_) => false,
            };
            if !interested {
                let removed = self.inner.lock().unwrap()
                    .slots.remove(&header.id);
                if removed.is_some() {
                    trace!("discarding message {}: not interested in this sample", header.id);
                }
                return;
            }
        }

        let completed = {
            let mut inner = self.inner.lock().unwrap();
            let message_complete = match inner.slots.get_mut(&header.id) {
                None => {
                    trace!("fragment for unknown message id {} - dropping", header.id);
                    false
                }
                Some(slot) => slot.on_content(header, content, now),
            };

            if message_complete {
                inner.slots.remove(&header.id).map(|slot| slot.buffer)
            }
            else {
                None
            }
        };

        if let Some(message) = completed {
            match parse_sample_name(&message) {
                Ok((name, sample)) => {
                    if self.sink.accepts(name) {
                        trace!("sample '{}' reassembled from {} bytes", name, message.len());
                        self.sink.apply(name, sample).await;
                    }
                }
                Err(e) => {
                    warn!("reassembled message without a valid sample name - discarding: {}", e);
                }
            }
        }
    }

    /// Sweeps the slot table, dropping finished slots and slots that have
    ///  not seen a fragment within the slot timeout (a slow or dead sender).
    ///  Runs at most once per cleanup interval so the cost is independent of
    ///  the datagram rate.
    pub fn cleanup_expired(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if now.duration_since(inner.last_cleanup) < self.config.cleanup_interval {
            return;
        }
        inner.last_cleanup = now;

        let timeout = self.config.slot_timeout;
        inner.slots.retain(|&id, slot| {
            if slot.is_finished() {
                debug!("evicting finished reassembly slot {}", id);
                return false;
            }
            if now.duration_since(slot.last_fragment) > timeout {
                debug!(
                    "evicting stalled reassembly slot {}: {} of {} bytes received",
                    id, slot.received_length, slot.total_length
                );
                return false;
            }
            true
        });
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    #[cfg(test)]
    fn slot_mode(&self, id: i32) -> Option<SlotMode> {
        self.inner.lock().unwrap().slots.get(&id).map(|s| s.mode)
    }
}


/// Drives a [SampleReceiver] from a UDP socket. Receive calls carry an
///  explicit timeout so the loop can re-check its cancel flag and run the
///  slot sweep even when no traffic arrives.
pub struct UdpSampleReceiver {
    socket: UdpSocket,
    receiver: Arc<SampleReceiver>,
    config: Arc<UdpSampleConfig>,
    canceled: AtomicBool,
}

impl UdpSampleReceiver {
    pub fn new(socket: UdpSocket, receiver: Arc<SampleReceiver>, config: Arc<UdpSampleConfig>) -> UdpSampleReceiver {
        UdpSampleReceiver {
            socket,
            receiver,
            config,
            canceled: AtomicBool::new(false),
        }
    }

    pub async fn receive_loop(&self) -> anyhow::Result<()> {
        info!("starting sample receive loop on {:?}", self.socket.local_addr()?);

        let mut buf = vec![0u8; self.config.max_datagram_size];
        while !self.canceled.load(Ordering::Acquire) {
            match timeout(self.config.receive_poll_timeout, self.socket.recv_from(&mut buf)).await {
                Err(_elapsed) => {
                    // idle poll window - sweep so stalled slots do not
                    // accumulate while no traffic arrives
                    self.receiver.cleanup_expired(Instant::now());
                }
                Ok(Ok((num_read, _from))) => {
                    self.receiver.on_datagram(&buf[..num_read]).await;
                }
                Ok(Err(e)) => {
                    error!("error receiving datagram: {}", e);
                }
            }
        }

        info!("shutting down sample receive loop");
        Ok(())
    }

    /// idempotent and callable from any thread; the loop terminates at the
    ///  next poll timeout
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}
