use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use transport::stats::TrafficStats;
use transport::udp::send::UdpSampleSender;

use crate::config::{ProcessIdentity, RegistrationConfig};
use crate::sample::{EntityKey, ProcessDescriptor, Sample, SampleList};

/// broadcast primitive for a single registration sample
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistrationSender: Send + Sync + 'static {
    /// returns the number of bytes transmitted, 0 on failure
    async fn send_sample(&self, sample_name: &str, buf: &[u8]) -> usize;
}

/// sends registration samples through the UDP fragmentation engine
pub struct UdpRegistrationSender {
    inner: Arc<UdpSampleSender>,
}
impl UdpRegistrationSender {
    pub fn new(inner: Arc<UdpSampleSender>) -> UdpRegistrationSender {
        UdpRegistrationSender { inner }
    }
}
#[async_trait]
impl RegistrationSender for UdpRegistrationSender {
    async fn send_sample(&self, sample_name: &str, buf: &[u8]) -> usize {
        self.inner.send_sample(sample_name, buf).await
    }
}

/// Broadcast primitive for a whole cycle's samples in one block, for
///  local-domain distribution where one large write beats a datagram per
///  sample. Optional - without it, per-sample broadcast is all there is.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SampleListSink: Send + Sync + 'static {
    async fn publish_list(&self, buf: &[u8]) -> bool;
}


struct RateState {
    last_read_bytes: u64,
    last_write_bytes: u64,
    last_sample: Instant,
}

impl RateState {
    /// byte-rate averages over the interval since the previous call
    fn sample(&mut self, stats: &TrafficStats, now: Instant) -> (u64, u64) {
        let read_bytes = stats.read_bytes();
        let write_bytes = stats.write_bytes();

        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        let rates = if elapsed > 0.0 {
            (
                ((read_bytes - self.last_read_bytes) as f64 / elapsed) as u64,
                ((write_bytes - self.last_write_bytes) as f64 / elapsed) as u64,
            )
        }
        else {
            (0, 0)
        };

        self.last_read_bytes = read_bytes;
        self.last_write_bytes = write_bytes;
        self.last_sample = now;
        rates
    }
}


/// The provider half of discovery: keeps a map per entity kind of
///  everything this process owns, re-broadcasts all of it on a cyclic
///  timer, and emits forced one-off samples on creation/destruction so
///  discovery latency for lifecycle events is near-zero rather than one
///  refresh period.
pub struct RegistrationProvider {
    inner: Arc<ProviderInner>,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

struct ProviderInner {
    config: Arc<RegistrationConfig>,
    identity: ProcessIdentity,
    sender: Arc<dyn RegistrationSender>,
    list_sink: Option<Arc<dyn SampleListSink>>,
    stats: Arc<TrafficStats>,

    topics: Mutex<FxHashMap<EntityKey, Sample>>,
    servers: Mutex<FxHashMap<EntityKey, Sample>>,
    clients: Mutex<FxHashMap<EntityKey, Sample>>,

    /// samples accumulated for the next list broadcast
    pending_list: Mutex<Vec<Sample>>,
    rate_state: Mutex<RateState>,
    shut_down: AtomicBool,
}

impl RegistrationProvider {
    pub fn new(
        config: Arc<RegistrationConfig>,
        identity: ProcessIdentity,
        sender: Arc<dyn RegistrationSender>,
        list_sink: Option<Arc<dyn SampleListSink>>,
        stats: Arc<TrafficStats>,
    ) -> anyhow::Result<RegistrationProvider> {
        config.validate()?;

        Ok(RegistrationProvider {
            inner: Arc::new(ProviderInner {
                config,
                identity,
                sender,
                list_sink,
                stats,
                topics: Default::default(),
                servers: Default::default(),
                clients: Default::default(),
                pending_list: Default::default(),
                rate_state: Mutex::new(RateState {
                    last_read_bytes: 0,
                    last_write_bytes: 0,
                    last_sample: Instant::now(),
                }),
                shut_down: AtomicBool::new(false),
            }),
            refresh_handle: Mutex::new(None),
        })
    }

    /// starts the cyclic refresh; the first cycle runs immediately
    pub fn start(&self) {
        let mut handle = self.refresh_handle.lock().unwrap();
        if handle.is_some() {
            warn!("registration refresh loop already started");
            return;
        }

        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move {
            let mut refresh = interval(inner.config.refresh_interval);
            loop {
                refresh.tick().await;
                inner.refresh_cycle().await;
            }
        }));
    }

    pub async fn register_topic(&self, key: EntityKey, sample: Sample, force: bool) -> bool {
        self.inner.register_entity(&self.inner.topics, key, sample, force).await
    }

    pub async fn unregister_topic(&self, key: &EntityKey, unregister_sample: Sample, force: bool) -> bool {
        self.inner.unregister_entity(&self.inner.topics, key, unregister_sample, force).await
    }

    pub async fn register_server(&self, key: EntityKey, sample: Sample, force: bool) -> bool {
        self.inner.register_entity(&self.inner.servers, key, sample, force).await
    }

    pub async fn unregister_server(&self, key: &EntityKey, unregister_sample: Sample, force: bool) -> bool {
        self.inner.unregister_entity(&self.inner.servers, key, unregister_sample, force).await
    }

    pub async fn register_client(&self, key: EntityKey, sample: Sample, force: bool) -> bool {
        self.inner.register_entity(&self.inner.clients, key, sample, force).await
    }

    pub async fn unregister_client(&self, key: &EntityKey, unregister_sample: Sample, force: bool) -> bool {
        self.inner.unregister_entity(&self.inner.clients, key, unregister_sample, force).await
    }

    #[cfg(test)]
    pub(crate) async fn run_refresh_cycle(&self) {
        self.inner.refresh_cycle().await;
    }

    /// Last words: stops the cyclic refresh and broadcasts an explicit
    ///  unregister-process sample so peers learn about the departure right
    ///  away instead of waiting for the staleness timeout. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down registration provider, unregistering process");

        if let Some(handle) = self.refresh_handle.lock().unwrap().take() {
            handle.abort();
        }

        let process = self.inner.process_descriptor(0, 0);
        self.inner.apply_sample(&Sample::UnregisterProcess(process)).await;
        self.inner.flush_sample_list().await;
    }
}

impl ProviderInner {
    async fn register_entity(
        &self,
        map: &Mutex<FxHashMap<EntityKey, Sample>>,
        key: EntityKey,
        sample: Sample,
        force: bool,
    ) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }

        map.lock().unwrap().insert(key, sample.clone());

        if force {
            // a forced registration also re-announces the process, so a peer
            // seeing the entity for the first time knows its owner as well
            self.register_process().await;
            self.apply_sample(&sample).await;
            self.flush_sample_list().await;
        }
        true
    }

    async fn unregister_entity(
        &self,
        map: &Mutex<FxHashMap<EntityKey, Sample>>,
        key: &EntityKey,
        unregister_sample: Sample,
        force: bool,
    ) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }

        if force {
            self.apply_sample(&unregister_sample).await;
            self.flush_sample_list().await;
        }

        map.lock().unwrap().remove(key).is_some()
    }

    async fn register_process(&self) {
        let (read_rate, write_rate) = self.rate_state.lock().unwrap()
            .sample(&self.stats, Instant::now());

        let process = self.process_descriptor(read_rate, write_rate);
        self.apply_sample(&Sample::RegisterProcess(process)).await;
    }

    fn process_descriptor(&self, read_bytes_per_sec: u64, write_bytes_per_sec: u64) -> ProcessDescriptor {
        ProcessDescriptor {
            host_name: self.identity.host_name.clone(),
            pid: self.identity.pid,
            process_name: self.identity.process_name.clone(),
            unit_name: self.identity.unit_name.clone(),
            read_bytes_per_sec,
            write_bytes_per_sec,
        }
    }

    /// broadcasts a single sample, and queues it for the next list broadcast
    async fn apply_sample(&self, sample: &Sample) {
        let mut buf = BytesMut::new();
        sample.ser(&mut buf);

        let num_sent = self.sender.send_sample(sample.sample_name(), &buf).await;
        if num_sent == 0 {
            warn!("failed to broadcast registration sample '{}'", sample.sample_name());
        }
        else {
            trace!("broadcast registration sample '{}' ({} bytes)", sample.sample_name(), num_sent);
        }

        if self.list_sink.is_some() {
            self.pending_list.lock().unwrap().push(sample.clone());
        }
    }

    async fn flush_sample_list(&self) {
        let Some(list_sink) = &self.list_sink else {
            return;
        };

        let list = {
            let mut pending = self.pending_list.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            SampleList { samples: std::mem::take(&mut *pending) }
        };

        debug!("publishing sample list with {} samples", list.samples.len());
        let mut buf = BytesMut::new();
        list.ser(&mut buf);

        if !list_sink.publish_list(&buf).await {
            warn!("failed to publish sample list");
        }
    }

    /// One registration refresh: re-announce the process and then every
    ///  entity this process owns, each as an independent sample, finally
    ///  batch the whole cycle into one list block.
    async fn refresh_cycle(&self) {
        self.register_process().await;

        for map in [&self.servers, &self.clients, &self.topics] {
            let samples = map.lock().unwrap().values().cloned().collect::<Vec<_>>();
            for sample in samples {
                self.apply_sample(&sample).await;
            }
        }

        self.flush_sample_list().await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::TopicDescriptor;
    use mockall::Sequence;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn identity() -> ProcessIdentity {
        ProcessIdentity {
            host_name: "host_a".to_string(),
            pid: 4711,
            process_name: "proc".to_string(),
            unit_name: "unit".to_string(),
        }
    }

    fn publisher_sample(topic_name: &str) -> Sample {
        Sample::RegisterPublisher(TopicDescriptor {
            host_name: "host_a".to_string(),
            pid: 4711,
            topic_name: topic_name.to_string(),
            topic_id: "1".to_string(),
            ..TopicDescriptor::default()
        })
    }

    fn unregister_publisher_sample(topic_name: &str) -> Sample {
        Sample::UnregisterPublisher(TopicDescriptor {
            host_name: "host_a".to_string(),
            pid: 4711,
            topic_name: topic_name.to_string(),
            topic_id: "1".to_string(),
            ..TopicDescriptor::default()
        })
    }

    fn decode(buf: &[u8]) -> Sample {
        let mut read_buf: &[u8] = buf;
        Sample::try_deser(&mut read_buf).unwrap()
    }

    fn provider_with(sender: MockRegistrationSender, list_sink: Option<MockSampleListSink>) -> RegistrationProvider {
        RegistrationProvider::new(
            Arc::new(RegistrationConfig::default_local()),
            identity(),
            Arc::new(sender),
            list_sink.map(|s| Arc::new(s) as Arc<dyn SampleListSink>),
            Arc::new(TrafficStats::default()),
        ).unwrap()
    }

    #[test]
    fn test_forced_registration_announces_process_then_topic() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sender = MockRegistrationSender::new();
            let mut seq = Sequence::new();
            sender.expect_send_sample()
                .once()
                .in_sequence(&mut seq)
                .withf(|name, buf| name == "host_a" && matches!(decode(buf), Sample::RegisterProcess(_)))
                .returning(|_, buf| buf.len());
            sender.expect_send_sample()
                .once()
                .in_sequence(&mut seq)
                .withf(|name, buf| name == "topic_a" && matches!(decode(buf), Sample::RegisterPublisher(_)))
                .returning(|_, buf| buf.len());

            let provider = provider_with(sender, None);
            assert!(provider.register_topic(EntityKey::new("topic_a", "1"), publisher_sample("topic_a"), true).await);
        });
    }

    #[test]
    fn test_unforced_registration_stays_quiet_until_refresh() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sender = MockRegistrationSender::new();
            // nothing is sent at registration time...
            sender.expect_send_sample().never();
            let provider = provider_with(sender, None);
            assert!(provider.register_topic(EntityKey::new("topic_a", "1"), publisher_sample("topic_a"), false).await);
        });
    }

    #[test]
    fn test_refresh_cycle_rebroadcasts_everything() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sender = MockRegistrationSender::new();
            // process sample plus both registered topics
            sender.expect_send_sample()
                .times(3)
                .returning(|_, buf| buf.len());

            let provider = provider_with(sender, None);
            provider.register_topic(EntityKey::new("topic_a", "1"), publisher_sample("topic_a"), false).await;
            provider.register_topic(EntityKey::new("topic_b", "1"), publisher_sample("topic_b"), false).await;

            provider.run_refresh_cycle().await;
        });
    }

    #[test]
    fn test_unregistration_is_broadcast_and_entity_dropped_from_refresh() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sender = MockRegistrationSender::new();
            sender.expect_send_sample()
                .once()
                .withf(|name, buf| name == "topic_a" && matches!(decode(buf), Sample::UnregisterPublisher(_)))
                .returning(|_, buf| buf.len());
            // the following refresh only re-announces the process
            sender.expect_send_sample()
                .once()
                .withf(|_, buf| matches!(decode(buf), Sample::RegisterProcess(_)))
                .returning(|_, buf| buf.len());

            let provider = provider_with(sender, None);
            provider.register_topic(EntityKey::new("topic_a", "1"), publisher_sample("topic_a"), false).await;

            assert!(provider.unregister_topic(&EntityKey::new("topic_a", "1"), unregister_publisher_sample("topic_a"), true).await);
            provider.run_refresh_cycle().await;
        });
    }

    #[test]
    fn test_refresh_cycle_batches_samples_into_one_list() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sender = MockRegistrationSender::new();
            sender.expect_send_sample()
                .times(3)
                .returning(|_, buf| buf.len());

            let mut list_sink = MockSampleListSink::new();
            list_sink.expect_publish_list()
                .once()
                .withf(|buf| {
                    let mut read_buf: &[u8] = buf;
                    SampleList::try_deser(&mut read_buf).unwrap().samples.len() == 3
                })
                .returning(|_| true);

            let provider = provider_with(sender, Some(list_sink));
            provider.register_topic(EntityKey::new("topic_a", "1"), publisher_sample("topic_a"), false).await;
            provider.register_topic(EntityKey::new("topic_b", "1"), publisher_sample("topic_b"), false).await;

            provider.run_refresh_cycle().await;
        });
    }

    #[test]
    fn test_shutdown_sends_unregister_process_once() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sender = MockRegistrationSender::new();
            sender.expect_send_sample()
                .once()
                .withf(|name, buf| name == "host_a" && matches!(decode(buf), Sample::UnregisterProcess(_)))
                .returning(|_, buf| buf.len());

            let provider = provider_with(sender, None);
            provider.shutdown().await;
            provider.shutdown().await; // idempotent - the expectation is `once`

            // a shut-down provider refuses new registrations
            assert!(!provider.register_topic(EntityKey::new("topic_a", "1"), publisher_sample("topic_a"), true).await);
        });
    }

    #[test]
    fn test_rate_sampling() {
        let stats = TrafficStats::default();
        let start = Instant::now();
        let mut rate_state = RateState {
            last_read_bytes: 0,
            last_write_bytes: 0,
            last_sample: start,
        };

        stats.add_read_bytes(10_000);
        stats.add_write_bytes(5_000);

        let (read_rate, write_rate) = rate_state.sample(&stats, start + Duration::from_secs(2));
        assert_eq!(read_rate, 5_000);
        assert_eq!(write_rate, 2_500);

        // no traffic since the previous sample: rates drop to zero
        let (read_rate, write_rate) = rate_state.sample(&stats, start + Duration::from_secs(3));
        assert_eq!(read_rate, 0);
        assert_eq!(write_rate, 0);
    }
}
