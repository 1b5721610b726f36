pub mod balance;
pub mod chain;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod firewall;
pub mod keygen;
pub mod lifecycle;
mod metrics;
pub mod network;
pub mod operator;
pub mod primitives;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod signing;
pub mod smoke;
pub mod storage;
pub mod time_cache;
pub mod tracing;
pub mod tracking;
pub mod web;

#[cfg(test)]
mod tests;
