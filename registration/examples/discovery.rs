//! Discovery round-trip within one process: a provider broadcasts onto the
//!  registration multicast group, the receiver applies what comes back in.
//!  Run with `cargo run --example discovery` (requires multicast-capable
//!  networking).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, Level};

use registration::config::{ProcessIdentity, RegistrationConfig};
use registration::provider::{RegistrationProvider, UdpRegistrationSender};
use registration::receiver::{RegistrationApplier, RegistrationEvents};
use registration::sample::{ClientDescriptor, EntityKey, ProcessDescriptor, Sample, ServiceDescriptor, TopicDescriptor};

use transport::config::UdpSampleConfig;
use transport::stats::TrafficStats;
use transport::udp::multicast;
use transport::udp::receive::{SampleReceiver, UdpSampleReceiver};
use transport::udp::send::{TargetedSender, UdpSampleSender};

struct LoggingEvents;

#[async_trait]
impl RegistrationEvents for LoggingEvents {
    async fn on_process(&self, process: &ProcessDescriptor, registered: bool) {
        info!("process {}@{} registered={}", process.process_name, process.host_name, registered);
    }

    async fn on_publisher(&self, topic: &TopicDescriptor, registered: bool) {
        info!("publisher on '{}' registered={}", topic.topic_name, registered);
    }

    async fn on_subscriber(&self, topic: &TopicDescriptor, registered: bool) {
        info!("subscriber on '{}' registered={}", topic.topic_name, registered);
    }

    async fn on_service(&self, service: &ServiceDescriptor, registered: bool) {
        info!("service '{}' on port {} registered={}", service.service_name, service.tcp_port, registered);
    }

    async fn on_client(&self, client: &ClientDescriptor, registered: bool) {
        info!("client of '{}' registered={}", client.service_name, registered);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let udp_config = Arc::new(UdpSampleConfig::default_local());
    let reg_config = Arc::new(RegistrationConfig {
        refresh_interval: Duration::from_millis(500),
        ..RegistrationConfig::default_local()
    });
    let stats = Arc::new(TrafficStats::default());

    let identity = ProcessIdentity {
        host_name: "localhost".to_string(),
        pid: std::process::id() as i32,
        process_name: "discovery_example".to_string(),
        unit_name: "discovery".to_string(),
    };

    // receive side: multicast socket -> reassembly -> registration applier
    let applier = Arc::new(RegistrationApplier::new(&reg_config, identity.clone(), Arc::new(LoggingEvents)));
    applier.set_loopback(true); // we want to see our own broadcasts

    let sample_receiver = Arc::new(SampleReceiver::new(udp_config.clone(), applier.clone(), stats.clone()));
    let udp_receiver = Arc::new(UdpSampleReceiver::new(
        multicast::receive_socket(&udp_config)?,
        sample_receiver,
        udp_config.clone(),
    ));
    let receive_task = tokio::spawn({
        let udp_receiver = udp_receiver.clone();
        async move { udp_receiver.receive_loop().await }
    });

    // send side: registration provider -> fragmentation engine -> multicast
    let raw_sender = TargetedSender::new(multicast::send_socket(&udp_config)?, multicast::group_address(&udp_config));
    let sample_sender = Arc::new(UdpSampleSender::new(Arc::new(raw_sender), udp_config, stats.clone()));

    let provider = RegistrationProvider::new(
        reg_config,
        identity.clone(),
        Arc::new(UdpRegistrationSender::new(sample_sender)),
        None,
        stats,
    )?;
    provider.start();

    provider.register_server(
        EntityKey::new("mirror", "1"),
        Sample::RegisterService(ServiceDescriptor {
            host_name: identity.host_name.clone(),
            pid: identity.pid,
            process_name: identity.process_name.clone(),
            unit_name: identity.unit_name.clone(),
            service_name: "mirror".to_string(),
            service_id: "1".to_string(),
            tcp_port: 31337,
            methods: vec![],
        }),
        true,
    ).await;

    sleep(Duration::from_secs(2)).await;
    info!("discovered service instances: {:?}", applier.services_by_name("mirror"));

    provider.shutdown().await;
    udp_receiver.cancel();
    let _ = receive_task.await;
    Ok(())
}
