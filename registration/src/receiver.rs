use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{trace, warn};

use transport::udp::receive::SampleSink;

use crate::config::{ProcessIdentity, RegistrationConfig};
use crate::registry::ExpiringRegistry;
use crate::sample::{ClientDescriptor, ProcessDescriptor, Sample, SampleList, ServiceDescriptor, TopicDescriptor};

/// Callbacks into the application when the distributed view changes -
///  consumed by discovery UIs and by the pub/sub layer's connection logic.
///  They run on the receive path, so they must be cheap.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistrationEvents: Send + Sync + 'static {
    async fn on_process(&self, process: &ProcessDescriptor, registered: bool);
    async fn on_publisher(&self, topic: &TopicDescriptor, registered: bool);
    async fn on_subscriber(&self, topic: &TopicDescriptor, registered: bool);
    async fn on_service(&self, service: &ServiceDescriptor, registered: bool);
    async fn on_client(&self, client: &ClientDescriptor, registered: bool);
}


/// composite identity of a service instance in the remote view
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServiceKey {
    pub service_name: String,
    pub host_name: String,
    pub pid: i32,
    pub tcp_port: u16,
}

impl ServiceKey {
    fn of(descriptor: &ServiceDescriptor) -> ServiceKey {
        ServiceKey {
            service_name: descriptor.service_name.clone(),
            host_name: descriptor.host_name.clone(),
            pid: descriptor.pid,
            tcp_port: descriptor.tcp_port,
        }
    }
}

/// composite identity of a service client in the remote view
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClientKey {
    pub service_name: String,
    pub host_name: String,
    pub pid: i32,
    pub client_id: String,
}

impl ClientKey {
    fn of(descriptor: &ClientDescriptor) -> ClientKey {
        ClientKey {
            service_name: descriptor.service_name.clone(),
            host_name: descriptor.host_name.clone(),
            pid: descriptor.pid,
            client_id: descriptor.client_id.clone(),
        }
    }
}


/// The consumer half of discovery: applies incoming registration samples to
///  the distributed view. Registrations upsert time-stamped entries into the
///  lookup registries; explicit unregistrations evict immediately; entries
///  whose owner fell silent age out via the registries' read-time sweep.
pub struct RegistrationApplier {
    identity: ProcessIdentity,
    loopback: AtomicBool,
    events: Arc<dyn RegistrationEvents>,
    services: ExpiringRegistry<ServiceKey, ServiceDescriptor>,
    clients: ExpiringRegistry<ClientKey, ClientDescriptor>,
}

impl RegistrationApplier {
    pub fn new(
        config: &RegistrationConfig,
        identity: ProcessIdentity,
        events: Arc<dyn RegistrationEvents>,
    ) -> RegistrationApplier {
        RegistrationApplier {
            identity,
            loopback: AtomicBool::new(config.loopback),
            events,
            services: ExpiringRegistry::new(config.registration_timeout),
            clients: ExpiringRegistry::new(config.registration_timeout),
        }
    }

    /// whether samples originating from this very process are applied too
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::Release);
    }

    pub async fn apply_sample(&self, sample: &Sample) {
        if self.is_own(sample) && !self.loopback.load(Ordering::Acquire) {
            trace!("skipping looped-back registration sample '{}'", sample.sample_name());
            return;
        }

        match sample {
            Sample::RegisterProcess(p) => {
                self.events.on_process(p, true).await;
            }
            Sample::UnregisterProcess(p) => {
                self.events.on_process(p, false).await;
            }
            Sample::RegisterPublisher(t) => {
                self.events.on_publisher(t, true).await;
            }
            Sample::UnregisterPublisher(t) => {
                self.events.on_publisher(t, false).await;
            }
            Sample::RegisterSubscriber(t) => {
                self.events.on_subscriber(t, true).await;
            }
            Sample::UnregisterSubscriber(t) => {
                self.events.on_subscriber(t, false).await;
            }
            Sample::RegisterService(s) => {
                self.services.upsert(ServiceKey::of(s), s.clone());
                self.events.on_service(s, true).await;
            }
            Sample::UnregisterService(s) => {
                self.services.remove(&ServiceKey::of(s));
                self.events.on_service(s, false).await;
            }
            Sample::RegisterClient(c) => {
                self.clients.upsert(ClientKey::of(c), c.clone());
                self.events.on_client(c, true).await;
            }
            Sample::UnregisterClient(c) => {
                self.clients.remove(&ClientKey::of(c));
                self.events.on_client(c, false).await;
            }
        }
    }

    /// applies a batched list, e.g. from a local-domain broadcast
    pub async fn apply_sample_list(&self, list: &SampleList) {
        for sample in &list.samples {
            self.apply_sample(sample).await;
        }
    }

    /// all live instances of a named service; stale entries are swept
    ///  before this returns
    pub fn services_by_name(&self, service_name: &str) -> Vec<ServiceDescriptor> {
        self.services.matching(|key, _| key.service_name == service_name)
    }

    pub fn clients_by_service(&self, service_name: &str) -> Vec<ClientDescriptor> {
        self.clients.matching(|key, _| key.service_name == service_name)
    }

    pub(crate) fn service_registry(&self) -> &ExpiringRegistry<ServiceKey, ServiceDescriptor> {
        &self.services
    }

    fn is_own(&self, sample: &Sample) -> bool {
        let (host_name, pid) = match sample {
            Sample::RegisterProcess(p) | Sample::UnregisterProcess(p) => (&p.host_name, p.pid),
            Sample::RegisterPublisher(t) | Sample::UnregisterPublisher(t)
            | Sample::RegisterSubscriber(t) | Sample::UnregisterSubscriber(t) => (&t.host_name, t.pid),
            Sample::RegisterService(s) | Sample::UnregisterService(s) => (&s.host_name, s.pid),
            Sample::RegisterClient(c) | Sample::UnregisterClient(c) => (&c.host_name, c.pid),
        };
        *host_name == self.identity.host_name && pid == self.identity.pid
    }
}

/// Wires the applier into the UDP receive path: registration traffic runs
///  on its own multicast group, so every sample arriving there is of
///  interest.
#[async_trait]
impl SampleSink for RegistrationApplier {
    fn accepts(&self, _sample_name: &str) -> bool {
        true
    }

    async fn apply(&self, sample_name: &str, sample: &[u8]) {
        let mut read_buf: &[u8] = sample;
        match Sample::try_deser(&mut read_buf) {
            Ok(sample) => self.apply_sample(&sample).await,
            Err(e) => {
                warn!("received unparseable registration sample '{}' - discarding: {}", sample_name, e);
            }
        }
    }
}
