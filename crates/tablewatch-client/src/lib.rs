//! Tablewatch Client - async client for realtime table change subscriptions.
//!
//! A [`Client`] owns one WebSocket to a Supabase-compatible realtime server.
//! [`Channel`]s are named subscription scopes on that socket; each carries
//! one or more filter bindings and hands matching change records to its
//! handlers.
//!
//! # Quick Start
//!
//! ```ignore
//! use tablewatch_client::{CallbackError, Client, ClientConfig};
//! use tablewatch_client::proto::{ChangeEventRecord, FilterDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig::new("https://abc.supabase.co", "anon-key"))?;
//!
//!     let inserts = FilterDescriptor::insert()
//!         .with_schema("public")
//!         .with_table("user_messages");
//!
//!     client
//!         .channel("public:user_messages")
//!         .on(inserts, |record: &ChangeEventRecord| -> Result<(), CallbackError> {
//!             println!("{:?}", record.field("message"));
//!             Ok(())
//!         })
//!         .subscribe()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
mod socket;

pub use channel::{Channel, ChannelState};
pub use client::Client;
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::ConnectionState;
pub use delivery::{Binding, ChangeHandler};
pub use error::{CallbackError, Error};

/// Re-export protocol types.
pub use tablewatch_proto as proto;
