// ferry-util: filename pattern engine and URL helpers shared by every role.

pub mod pattern;
pub mod reload;
pub mod urls;

pub use pattern::{compose, fnmatch, globify, parse, Pattern, PatternError};
pub use reload::{watch_file, ConfigWatch};
pub use urls::{clean_url, clean_url_str, host_is_local, is_local, local_ips, own_hostname};
