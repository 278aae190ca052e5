// client: the consumer role.
//
// Subscribes to provider announcements, deduplicates them, requests
// transfers, unpacks what arrives, and republishes local availability.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod heartbeat;
pub mod listener;
pub mod requester;
pub mod stats;
pub mod supervisor;

pub use cache::UidCache;
pub use config::{read_config, ClientConfig, Provider};
pub use fetch::FetchContext;
pub use heartbeat::HeartbeatMonitor;
pub use requester::PushRequester;
pub use supervisor::{ClientArgs, ClientChain, MoveClient};
