//! # Concurrency Patterns
//!
//! Two thread-safe building blocks that come up again and again in design
//! pattern catalogs:
//!
//! - [`LazyRegistry`]: named singletons, each built at most once, using
//!   double-checked locking. Owned by the application instead of living in a
//!   `static`.
//! - [`BoundedChannel`]: a fixed-capacity FIFO for producer-consumer
//!   pipelines, with backpressure, closing, and cancellable blocking calls.
//!
//! Blocking calls take a [`Context`] carrying a [`CancelToken`] and/or a
//! deadline.
//!
//! ```
//! use concurrency_patterns::{BoundedChannel, Context, LazyRegistry};
//!
//! let registry: LazyRegistry<String> = LazyRegistry::new();
//! let db = registry
//!     .get_or_create("db", || Ok::<_, std::io::Error>("postgres://localhost".to_string()))
//!     .unwrap();
//! assert_eq!(db.as_str(), "postgres://localhost");
//!
//! let channel = BoundedChannel::new(2);
//! channel.put(1, &Context::background()).unwrap();
//! channel.close();
//! assert_eq!(channel.take(&Context::background()), Ok(1));
//! assert!(channel.take(&Context::background()).unwrap_err().is_closed());
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod registry;

pub use channel::BoundedChannel;
pub use config::{ChannelConfig, Config, RegistryConfig};
pub use context::{CancelToken, Context};
pub use error::{CancelReason, ChannelError, ConfigError, PutError, RegistryError};
pub use registry::{EntryState, LazyRegistry};
