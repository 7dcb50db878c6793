//! Decentralized discovery for a brokerless pub/sub middleware.
//!
//! Every process runs a [provider::RegistrationProvider] that broadcasts
//!  descriptors for all locally owned entities - publishers, subscribers,
//!  services, clients, and the process itself - both cyclically and
//!  immediately on creation/destruction. A [receiver::RegistrationApplier]
//!  consumes those broadcasts from all peers and maintains the distributed
//!  view: callbacks for discovery consumers plus lookup tables whose entries
//!  expire when their owner stops refreshing them.
//!
//! There is no central component anywhere: the view is eventually
//!  consistent, kept alive purely by cyclic re-broadcast, with explicit
//!  unregister samples as a fast path so peers do not have to wait for the
//!  staleness timeout when an entity goes away cleanly.

pub mod buf;
pub mod config;
pub mod provider;
pub mod receiver;
pub mod registry;
pub mod sample;
