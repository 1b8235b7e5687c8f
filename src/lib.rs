//! havoc - fault injection for a fleet of nodes.
//!
//! The `havoc-agent` daemon runs on every node and performs disruptive
//! actions on request: killing or suspending processes, burning CPU, RAM and
//! disk, flapping network adapters and redirecting DNS names to localhost.
//!
//! This library holds what the driver side needs to talk to those agents:
//! the wire protocol, the node registry and the dispatcher. It can be used
//! directly from failover tests:
//!
//! ```no_run
//! use havoc::driver::{Driver, NodeRegistry, Targets};
//!
//! # async fn run() -> havoc::error::Result<()> {
//! let mut registry = NodeRegistry::new();
//! registry.add_node("local", "127.0.0.1:6969", "main", "secret");
//!
//! let driver = Driver::new(registry)?;
//! let result = driver
//!     .get_process(&Targets::nodes(["local"]), &[], &["nginx*"])
//!     .await?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
