//! fileferry: a distributed file-transfer fabric for operational data
//! pipelines.
//!
//! Producers watch directories and announce new files on a lightweight
//! pub/sub bus; consumers request transfers over a typed request/reply
//! protocol; mirrors interpose transparently; a dispatcher routes files to
//! per-client destinations by metadata predicates.
//!
//! The workspace splits along those roles:
//!
//! | crate / service     | responsibility                                  |
//! |---------------------|-------------------------------------------------|
//! | `ferry-protocol`    | message model, wire codec, body traversal        |
//! | `ferry-util`        | filename patterns, URL hygiene, host locality    |
//! | `ferry-movers`      | scheme-keyed transfer backends, connection pool  |
//! | `ferry-bus`         | PUB/SUB plumbing                                 |
//! | `ferry-logging`     | shared tracing setup for the role binaries       |
//! | `services/server`   | producer: watch → announce → serve requests      |
//! | `services/client`   | consumer: subscribe → fetch → republish          |
//! | `services/mirror`   | both at once, with request coalescing            |
//! | `services/dispatcher` | predicate-routed fan-out                       |
//!
//! This root package only hosts the end-to-end suites under
//! `tests/integration/`.
