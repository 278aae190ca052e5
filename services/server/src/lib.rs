// server: the producer role.
//
// Watches directories for new files, announces them on the bus, serves
// transfer requests on a ROUTER socket, and cleans up after itself.

pub mod cache;
pub mod chain;
pub mod config;
pub mod deleter;
pub mod request_manager;
pub mod supervisor;
pub mod unpack;
pub mod watcher;

pub use cache::FileCache;
pub use chain::Chain;
pub use config::{read_config, ChainConfig};
pub use deleter::{Deleter, DeleterHandle};
pub use request_manager::{RequestHandler, RequestManager, ServerRequestHandler};
pub use supervisor::{MoveServer, ServerArgs};
