//! Contains the events and handler traits used to monitor commands sent by
//! the driver and the behavior of its connection pools.

pub mod command;
pub mod pool;
