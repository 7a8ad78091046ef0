//! Conflux parallel execution core
//!
//! Task-parallel execution over distributed memory: every execution domain
//! owns a worker pool, a slab of domain memory and a communication endpoint.
//! Tasks synchronize through full/empty cells, wait for their children in
//! structured task groups, and reach other domains through active messages.
//!
//! # Example
//!
//! ```no_run
//! use conflux::runtime::{Cluster, HandlerRegistry};
//! use conflux::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_pairs([("numLocales", "2")]).unwrap();
//! let cluster = Cluster::launch(config, HandlerRegistry::new()).unwrap();
//! cluster
//!     .run_main(|domain, ctx| {
//!         println!("{} running on {}", ctx.id(), domain.id());
//!         Ok(())
//!     })
//!     .unwrap();
//! ```

#![doc(html_root_url = "https://docs.rs/conflux")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod fanout;
pub mod runtime;

// Utility modules
pub mod util;

pub use runtime::{Cluster, RuntimeError, RuntimeResult, TaskError, TaskResult};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "Conflux";
