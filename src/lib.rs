pub mod agent;
pub mod config;
pub mod export;
pub mod iptables;
pub mod metrics;
pub mod watch;
