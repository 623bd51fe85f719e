//! Configuration management.
//!
//! - [`schema`]: configuration structures with validation
//! - [`uri`]: `failover:(...)?opts` URI parsing
//! - [`loader`]: layered loading from defaults, TOML files and environment
//!
//! # Examples
//!
//! ```rust
//! use wirelink_core::config::FailoverUri;
//!
//! let parsed = FailoverUri::parse("failover:(tcp://a:61616,tcp://b:61616)?randomize=false")
//!     .expect("valid uri");
//! assert_eq!(parsed.uris.len(), 2);
//! assert!(!parsed.config.randomize);
//! ```

pub mod loader;
pub mod schema;
pub mod uri;

pub use loader::ConfigLoader;
pub use schema::{FailoverConfig, LogFormat, LoggingConfig};
pub use uri::{parse_uri_list, FailoverUri};
