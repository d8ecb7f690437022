//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ConveyorConfig (validated, immutable)
//!     → CLI overrides applied by the binary
//!     → handed to Server::new
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the server is built
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{ConnectionConfig, ConveyorConfig, ListenerConfig, ObservabilityConfig, TlsConfig};
pub use validation::{validate_config, ValidationError};
