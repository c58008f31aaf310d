//! Realtime client API.
//!
//! This module provides the main `Client` struct: a handle to one shared
//! socket task from which channels are created.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::error::Error;
use crate::socket::{SocketCmd, SocketTask};

/// A realtime client.
///
/// Cloning is cheap; all clones share one socket. Creating the client does no
/// network I/O. The socket is dialed when the first channel subscribes.
///
/// # Example
///
/// ```ignore
/// use tablewatch_client::{Client, ClientConfig};
/// use tablewatch_client::proto::FilterDescriptor;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::new(ClientConfig::new("https://abc.supabase.co", "anon-key"))?;
///
///     let channel = client
///         .channel("public:user_messages")
///         .on(FilterDescriptor::insert().with_table("user_messages"), |record: &_| {
///             println!("{:?}", record);
///             Ok(())
///         })
///         .subscribe()?;
///     channel.wait_active().await?;
///
///     tokio::signal::ctrl_c().await?;
///     client.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    cmd_tx: mpsc::UnboundedSender<SocketCmd>,
    refs: Arc<AtomicU64>,
    conn_state: watch::Receiver<ConnectionState>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a client.
    ///
    /// Must be called from within a Tokio runtime; the socket task is spawned
    /// onto it.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("client must be created inside a tokio runtime".to_string())
        })?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, conn_state) = watch::channel(ConnectionState::Disconnected);
        let refs = Arc::new(AtomicU64::new(1));

        let task = SocketTask::new(config.clone(), cmd_rx, refs.clone(), state_tx);
        let handle = runtime.spawn(task.run());

        tracing::debug!(endpoint = %config.endpoint, "realtime client created");

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                cmd_tx,
                refs,
                conn_state,
                runtime,
                task: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Create a channel.
    ///
    /// `name` becomes the topic `realtime:<name>` unless it already carries
    /// the prefix. Every call creates a distinct channel, even for a name
    /// used before.
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        let join_ref = self.inner.refs.fetch_add(1, Ordering::Relaxed).to_string();
        Channel::new(
            name.into(),
            join_ref,
            self.inner.cmd_tx.clone(),
            self.inner.runtime.clone(),
            self.inner.config.event_buffer,
        )
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current socket state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.conn_state.borrow()
    }

    /// Receiver notified on every socket state change.
    pub fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.conn_state.clone()
    }

    /// Whether the socket task is still running.
    pub fn is_running(&self) -> bool {
        !self.inner.cmd_tx.is_closed()
    }

    /// Leave every channel, close the socket and stop the socket task.
    ///
    /// Channels end in the `Closed` state. Calling this more than once is
    /// harmless.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.cmd_tx.send(SocketCmd::Shutdown { done_tx }).is_ok() {
            let _ = done_rx.await;
        }

        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "socket task ended abnormally");
            }
        }
        tracing::info!("realtime client shut down");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;

    fn config() -> ClientConfig {
        ClientConfig::new("http://127.0.0.1:9", "anon-key")
    }

    #[test]
    fn test_new_outside_runtime() {
        let err = Client::new(config()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let err = Client::new(ClientConfig::new("", "anon-key")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let zero_buffer = ClientConfig {
            event_buffer: 0,
            ..config()
        };
        assert!(matches!(Client::new(zero_buffer), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_lazy_connection() {
        let client = Client::new(config()).unwrap();
        let _channel = client.channel("room");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.is_running());
    }

    #[tokio::test]
    async fn test_channels_are_distinct() {
        let client = Client::new(config()).unwrap();
        let a = client.channel("room");
        let b = client.channel("room");
        assert_eq!(a.topic(), b.topic());
        assert_ne!(format!("{:?}", a), format!("{:?}", b));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let client = Client::new(config()).unwrap();
        let mut channel = client.channel("room");

        client.shutdown().await;
        assert_eq!(client.connection_state(), ConnectionState::Closed);
        assert!(!client.is_running());

        // Second call is a no-op.
        client.shutdown().await;

        assert!(matches!(client.channel("late").subscribe(), Err(Error::Closed)));
        channel.unsubscribe().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_debug_redacts_key() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let client = Client::new(config()).unwrap();
        let debug = format!("{:?}", client);
        assert!(debug.contains("127.0.0.1"));
        assert!(!debug.contains("anon-key"));
    }
}
