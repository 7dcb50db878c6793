pub mod frame;
pub mod multicast;
pub mod receive;
pub mod send;
