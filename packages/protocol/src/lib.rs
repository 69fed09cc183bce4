//! Core protocol engine for the bridge485 daemon: frame codec, per-slave
//! request queues, the round-robin master scheduler with echo verification,
//! and the single-threaded bus I/O loop.

pub mod config;
pub mod crc;
pub mod daemon;
pub mod engine;
pub mod frame;
pub mod runtime;
pub mod slave;
