pub mod cache;
pub mod config;
pub mod firewall;
pub mod packet;
pub mod tracker;

pub use cache::{ConnCache, ConnRecord};
pub use config::Config;
pub use firewall::{Firewall, IptablesBackend, IptablesFirewall};
pub use packet::{decode, Observation};
pub use tracker::{Tracker, TrackerParams};
