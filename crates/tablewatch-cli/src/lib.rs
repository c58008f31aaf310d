//! tablewatch - print rows inserted into a Supabase table as they arrive.
//!
//! The binary opens two channels on one realtime client: one restricted to
//! inserts on the configured table, one receiving every insert the backend
//! exposes. Both feed the same [`InsertPrinter`], so an insert into the
//! watched table prints twice.

pub mod config;
pub mod handler;

pub use config::{Args, ConfigError, ListenerConfig, FALLBACK_KEY_ENV};
pub use handler::{format_decoded_line, format_insert_line, InsertPrinter};

use std::sync::Arc;

use tokio::sync::watch;

use tablewatch_client::{Channel, ChannelState, ChangeHandler, Client, Error};
use tablewatch_proto::FilterDescriptor;

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "tablewatch=info,tablewatch_cli=info,tablewatch_client=info";

/// Name of the channel receiving inserts on every table.
pub const ALL_INSERTS_CHANNEL: &str = "inserts";

/// Subscribe the listener's channels, all feeding `handler`.
pub fn subscribe_listener(
    client: &Client,
    config: &ListenerConfig,
    handler: Arc<dyn ChangeHandler>,
) -> Result<Vec<Channel>, Error> {
    let table_inserts = FilterDescriptor::insert()
        .with_schema(&config.schema)
        .with_table(&config.table);

    let table = client
        .channel(config.table_channel())
        .on_shared(table_inserts, handler.clone())
        .subscribe()?;
    let everything = client
        .channel(ALL_INSERTS_CHANNEL)
        .on_shared(FilterDescriptor::insert(), handler)
        .subscribe()?;

    Ok(vec![table, everything])
}

/// Resolves with the final states once every channel is closed or errored.
pub async fn all_terminal(mut receivers: Vec<watch::Receiver<ChannelState>>) -> Vec<ChannelState> {
    let mut states = Vec::with_capacity(receivers.len());
    for rx in &mut receivers {
        let state = match rx.wait_for(ChannelState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => ChannelState::Closed,
        };
        states.push(state);
    }
    states
}
