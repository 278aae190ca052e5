// mirror: transparent interposition between producers and consumers.
//
// Re-advertises upstream announcements under its own request address and
// fetches from the origin producers on demand, serving downstream peers
// from its local cache.

pub mod chain;
pub mod config;
pub mod registry;
pub mod supervisor;

pub use chain::{announce, MirrorChain, MirrorRequestHandler};
pub use config::{read_config, MirrorConfig};
pub use registry::FileRegistry;
pub use supervisor::{MirrorArgs, MoveMirror};
