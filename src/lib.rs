//! Client for the Alexa Voice Service HTTP protocol.
//!
//! [`ProtocolClient`] posts events and recorded audio, keeps the downchannel
//! open for server-pushed directives and pings the service to keep the
//! connection alive. Everything it produces is delivered to a
//! [`ClientHandler`].

pub mod auth;
pub mod client;
pub mod config;
pub mod directive;
pub mod downchannel;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod multipart;

pub use auth::{SharedTokenSource, StaticTokenSource, TokenSource};
pub use client::{ClientHandler, ProtocolClient};
pub use config::{AvsConfig, ConfigError};
pub use directive::{ContentKind, Directive, ParsedDirective};
pub use downchannel::ConnectionState;
pub use error::{AvsError, ProtocolError, Result};
pub use event::EventEnvelope;
