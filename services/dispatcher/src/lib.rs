// dispatcher: route announced files to per-client destinations by
// metadata predicates.

pub mod conditions;
pub mod config;
pub mod dispatch;
pub mod supervisor;

pub use conditions::check_conditions;
pub use config::{all_addresses, all_topics, parse_config, read_config, DispatchRoot};
pub use dispatch::{dispatch, get_destinations, handle_message, Destination};
pub use supervisor::{DispatcherArgs, DispatcherService};
