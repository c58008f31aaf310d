//! Channels: named subscription scopes over the change stream.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use tablewatch_proto::{channel_topic, FilterDescriptor};

use crate::delivery::{self, Binding, ChangeHandler};
use crate::error::Error;
use crate::socket::SocketCmd;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Created locally; bindings may still be added.
    Created,
    /// Activation requested; waiting for the socket and the join reply.
    Subscribed,
    /// Join acknowledged; changes are being delivered.
    Active,
    /// Left, closed by the server, or the client shut down.
    Closed,
    /// Join rejected or connection failed for good.
    Errored(String),
}

impl ChannelState {
    /// Whether the channel can no longer become active.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored(_))
    }
}

/// A named subscription scope.
///
/// Build it with [`Channel::on`], then call [`Channel::subscribe`]. Dropping
/// the handle does not leave the channel; delivery continues until
/// [`Channel::unsubscribe`] or [`crate::Client::shutdown`].
///
/// # Example
///
/// ```ignore
/// let channel = client
///     .channel("public:user_messages")
///     .on(
///         FilterDescriptor::insert().with_schema("public").with_table("user_messages"),
///         |record: &ChangeEventRecord| -> Result<(), CallbackError> {
///             println!("{:?}", record.new);
///             Ok(())
///         },
///     )
///     .subscribe()?;
/// channel.wait_active().await?;
/// ```
pub struct Channel {
    name: String,
    topic: String,
    join_ref: String,
    bindings: Vec<Binding>,
    state_tx: Option<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    cmd_tx: mpsc::UnboundedSender<SocketCmd>,
    runtime: Handle,
    event_buffer: usize,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        join_ref: String,
        cmd_tx: mpsc::UnboundedSender<SocketCmd>,
        runtime: Handle,
        event_buffer: usize,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Created);
        Self {
            topic: channel_topic(&name),
            name,
            join_ref,
            bindings: Vec::new(),
            state_tx: Some(state_tx),
            state_rx,
            cmd_tx,
            runtime,
            event_buffer,
        }
    }

    /// Register a handler for changes matching `filter`.
    ///
    /// May be called repeatedly; registering the same filter twice delivers
    /// each matching change twice. Only channels in the `Created` state accept
    /// new bindings.
    pub fn on(self, filter: FilterDescriptor, handler: impl ChangeHandler) -> Self {
        self.on_shared(filter, Arc::new(handler))
    }

    /// Register a shared handler for changes matching `filter`.
    pub fn on_shared(mut self, filter: FilterDescriptor, handler: Arc<dyn ChangeHandler>) -> Self {
        let state = self.state();
        if state != ChannelState::Created {
            tracing::warn!(
                topic = %self.topic,
                filter = %filter,
                state = ?state,
                "ignoring binding registered after subscribe"
            );
            return self;
        }
        tracing::debug!(topic = %self.topic, filter = %filter, "binding registered");
        self.bindings.push(Binding { filter, handler });
        self
    }

    /// Activate the channel.
    ///
    /// Returns as soon as the join is queued; the socket is dialed and the
    /// join negotiated in the background. Use [`Channel::wait_active`] to
    /// wait for the acknowledgement.
    pub fn subscribe(mut self) -> Result<Self, Error> {
        let state = self.state();
        if state != ChannelState::Created {
            return Err(Error::InvalidState {
                expected: "created",
                actual: state,
            });
        }
        if self.cmd_tx.is_closed() {
            return Err(Error::Closed);
        }
        let state_tx = self.state_tx.take().ok_or(Error::InvalidState {
            expected: "created",
            actual: state,
        })?;

        let (event_tx, event_rx) = mpsc::channel(self.event_buffer);
        state_tx.send_replace(ChannelState::Subscribed);

        self.cmd_tx
            .send(SocketCmd::Join {
                join_ref: self.join_ref.clone(),
                topic: self.topic.clone(),
                filters: self.bindings.iter().map(|b| b.filter.clone()).collect(),
                event_tx,
                state_tx,
            })
            .map_err(|_| Error::Closed)?;

        self.runtime.spawn(delivery::run(
            self.topic.clone(),
            self.bindings.clone(),
            event_rx,
        ));

        tracing::info!(
            topic = %self.topic,
            bindings = self.bindings.len(),
            "channel subscribing"
        );
        Ok(self)
    }

    /// Wait until the channel is active.
    ///
    /// Fails with [`Error::Connection`] if the join is rejected or the
    /// connection gives up, and with [`Error::Closed`] if the channel closes.
    pub async fn wait_active(&self) -> Result<(), Error> {
        let state = self.state();
        if state == ChannelState::Created {
            return Err(Error::InvalidState {
                expected: "subscribed",
                actual: state,
            });
        }

        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| *s == ChannelState::Active || s.is_terminal())
            .await
            .map_err(|_| Error::Closed)?
            .clone();

        match state {
            ChannelState::Active => Ok(()),
            ChannelState::Errored(reason) => Err(Error::Connection(reason)),
            _ => Err(Error::Closed),
        }
    }

    /// Leave the channel and stop delivery.
    pub async fn unsubscribe(&mut self) -> Result<(), Error> {
        if let Some(state_tx) = self.state_tx.take() {
            // Never subscribed.
            state_tx.send_replace(ChannelState::Closed);
            return Ok(());
        }
        if self.state().is_terminal() {
            return Ok(());
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(SocketCmd::Leave {
                join_ref: self.join_ref.clone(),
                done_tx,
            })
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Channel name as given to [`crate::Client::channel`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Registered bindings.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("join_ref", &self.join_ref)
            .field("bindings", &self.bindings.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use tablewatch_proto::ChangeEventRecord;

    fn noop(_: &ChangeEventRecord) -> Result<(), CallbackError> {
        Ok(())
    }

    fn channel(name: &str) -> (Channel, mpsc::UnboundedReceiver<SocketCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Channel::new(name.to_string(), "1".to_string(), tx, Handle::current(), 16), rx)
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ChannelState::Created.is_terminal());
        assert!(!ChannelState::Subscribed.is_terminal());
        assert!(!ChannelState::Active.is_terminal());
        assert!(ChannelState::Closed.is_terminal());
        assert!(ChannelState::Errored("x".into()).is_terminal());
    }

    #[tokio::test]
    async fn test_topic_and_bindings() {
        let (ch, _rx) = channel("public:user_messages");
        let ch = ch
            .on(FilterDescriptor::insert().with_table("user_messages"), noop)
            .on(FilterDescriptor::insert(), noop);

        assert_eq!(ch.name(), "public:user_messages");
        assert_eq!(ch.topic(), "realtime:public:user_messages");
        assert_eq!(ch.bindings().len(), 2);
        assert_eq!(ch.state(), ChannelState::Created);
    }

    #[tokio::test]
    async fn test_subscribe_queues_join() {
        let (ch, mut rx) = channel("room");
        let ch = ch.on(FilterDescriptor::insert(), noop).subscribe().unwrap();
        assert_eq!(ch.state(), ChannelState::Subscribed);

        match rx.recv().await {
            Some(SocketCmd::Join { join_ref, topic, filters, .. }) => {
                assert_eq!(join_ref, "1");
                assert_eq!(topic, "realtime:room");
                assert_eq!(filters, vec![FilterDescriptor::insert()]);
            }
            _ => panic!("expected join command"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_twice_rejected() {
        let (ch, _rx) = channel("room");
        let ch = ch.subscribe().unwrap();
        let err = ch.subscribe().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState { actual: ChannelState::Subscribed, .. }
        ));
    }

    #[tokio::test]
    async fn test_binding_after_subscribe_ignored() {
        let (ch, _rx) = channel("room");
        let ch = ch.subscribe().unwrap().on(FilterDescriptor::insert(), noop);
        assert!(ch.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_on_closed_client() {
        let (ch, rx) = channel("room");
        drop(rx);
        assert!(matches!(ch.subscribe(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_unsubscribe_before_subscribe() {
        let (mut ch, _rx) = channel("room");
        ch.unsubscribe().await.unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(ch.subscribe().is_err());
    }

    #[tokio::test]
    async fn test_wait_active_requires_subscribe() {
        let (ch, _rx) = channel("room");
        assert!(matches!(
            ch.wait_active().await,
            Err(Error::InvalidState { expected: "subscribed", .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_active_reports_rejection() {
        let (ch, mut rx) = channel("room");
        let ch = ch.subscribe().unwrap();

        let Some(SocketCmd::Join { state_tx, .. }) = rx.recv().await else {
            panic!("expected join command");
        };
        state_tx.send_replace(ChannelState::Errored("join rejected: Invalid JWT".into()));

        match ch.wait_active().await {
            Err(Error::Connection(reason)) => assert!(reason.contains("Invalid JWT")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
