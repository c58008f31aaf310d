//! Per-channel delivery of change records to registered handlers.
//!
//! The socket task pushes [`ChannelEvent`]s onto a bounded queue; the
//! delivery task drains it and runs the matching handlers, so a slow handler
//! applies backpressure to the socket instead of growing memory.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;

use tablewatch_proto::{ChangeEventRecord, FilterDescriptor};

use crate::error::CallbackError;

/// Receives change records for a channel binding.
///
/// Called from a blocking-pool thread; blocking I/O is fine here.
pub trait ChangeHandler: Send + Sync + 'static {
    /// Handle one change record.
    fn handle(&self, record: &ChangeEventRecord) -> Result<(), CallbackError>;
}

impl<F> ChangeHandler for F
where
    F: Fn(&ChangeEventRecord) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    fn handle(&self, record: &ChangeEventRecord) -> Result<(), CallbackError> {
        self(record)
    }
}

/// A filter paired with the handler it feeds.
#[derive(Clone)]
pub struct Binding {
    /// Which changes this binding receives.
    pub filter: FilterDescriptor,
    /// Handler invoked for each matching change.
    pub handler: Arc<dyn ChangeHandler>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("filter", &self.filter).finish()
    }
}

/// Events pushed from the socket task to a channel's delivery task.
#[derive(Debug, Clone)]
pub(crate) enum ChannelEvent {
    /// Join acknowledged; server binding ids in registration order.
    Joined(Vec<u64>),
    /// A change routed to this channel.
    Change {
        /// Server ids of the bindings the change matched.
        ids: Vec<u64>,
        /// The change.
        record: ChangeEventRecord,
    },
}

/// Drains a channel's event queue until the socket task drops its sender.
///
/// Handlers run on Tokio's blocking pool, one change at a time, so a handler
/// may block on I/O without stalling runtime workers. Per-channel order is
/// kept.
pub(crate) async fn run(topic: String, bindings: Vec<Binding>, mut rx: mpsc::Receiver<ChannelEvent>) {
    let bindings: Arc<[Binding]> = bindings.into();
    let mut server_ids: Arc<[Option<u64>]> = vec![None; bindings.len()].into();
    let mut delivered: u64 = 0;

    while let Some(event) = rx.recv().await {
        match event {
            ChannelEvent::Joined(ids) => {
                server_ids = (0..bindings.len()).map(|i| ids.get(i).copied()).collect();
                tracing::debug!(topic = %topic, ids = ?ids, "binding ids assigned");
            }
            ChannelEvent::Change { ids, record } => {
                let worker_topic = topic.clone();
                let worker_bindings = bindings.clone();
                let worker_ids = server_ids.clone();
                let ran = tokio::task::spawn_blocking(move || {
                    dispatch(&worker_topic, &worker_bindings, &worker_ids, &ids, &record)
                })
                .await;
                match ran {
                    Ok(ran) => delivered += ran,
                    Err(e) => tracing::error!(topic = %topic, error = %e, "delivery worker failed"),
                }
            }
        }
    }

    tracing::debug!(topic = %topic, delivered, "delivery stopped");
}

/// Run every binding that matches `record`; returns how many ran.
pub(crate) fn dispatch(
    topic: &str,
    bindings: &[Binding],
    server_ids: &[Option<u64>],
    ids: &[u64],
    record: &ChangeEventRecord,
) -> u64 {
    let mut ran = 0;
    for (index, binding) in bindings.iter().enumerate() {
        let server_id = server_ids.get(index).copied().flatten();
        if !binding_matches(&binding.filter, server_id, ids, record) {
            continue;
        }
        ran += 1;
        invoke(topic, binding, record);
    }
    ran
}

/// Server ids decide when both sides have them; local matching otherwise.
pub(crate) fn binding_matches(
    filter: &FilterDescriptor,
    server_id: Option<u64>,
    ids: &[u64],
    record: &ChangeEventRecord,
) -> bool {
    match server_id {
        Some(id) if !ids.is_empty() => ids.contains(&id) && filter.event.accepts(record.event_type),
        _ => filter.matches(record),
    }
}

fn invoke(topic: &str, binding: &Binding, record: &ChangeEventRecord) {
    match catch_unwind(AssertUnwindSafe(|| binding.handler.handle(record))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(
                topic,
                filter = %binding.filter,
                table = %record.table,
                error = %e,
                "change handler failed"
            );
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                topic,
                filter = %binding.filter,
                table = %record.table,
                panic = %reason,
                "change handler panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tablewatch_proto::EventKind;

    fn record(table: &str) -> ChangeEventRecord {
        ChangeEventRecord {
            schema: "public".to_string(),
            table: table.to_string(),
            event_type: EventKind::Insert,
            commit_timestamp: None,
            new: Default::default(),
            old: Default::default(),
            columns: vec![],
            errors: None,
        }
    }

    fn counting(filter: FilterDescriptor, counter: Arc<AtomicUsize>) -> Binding {
        Binding {
            filter,
            handler: Arc::new(move |_: &ChangeEventRecord| -> Result<(), CallbackError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        }
    }

    #[test]
    fn test_local_matching_without_ids() {
        let filter = FilterDescriptor::insert().with_table("user_messages");
        assert!(binding_matches(&filter, None, &[], &record("user_messages")));
        assert!(!binding_matches(&filter, None, &[], &record("orders")));
        // Ids on only one side fall back to local matching.
        assert!(binding_matches(&filter, Some(7), &[], &record("user_messages")));
        assert!(binding_matches(&filter, None, &[7], &record("user_messages")));
    }

    #[test]
    fn test_server_id_matching() {
        let filter = FilterDescriptor::insert().with_table("user_messages");
        assert!(binding_matches(&filter, Some(7), &[3, 7], &record("user_messages")));
        assert!(!binding_matches(&filter, Some(7), &[3], &record("user_messages")));

        let mut update = record("user_messages");
        update.event_type = EventKind::Update;
        assert!(!binding_matches(&filter, Some(7), &[7], &update));
    }

    #[test]
    fn test_duplicate_bindings_each_fire() {
        let counter = Arc::new(AtomicUsize::new(0));
        let filter = FilterDescriptor::insert()
            .with_schema("public")
            .with_table("user_messages");
        let bindings = vec![
            counting(filter.clone(), counter.clone()),
            counting(filter, counter.clone()),
        ];

        let ran = dispatch("t", &bindings, &[None, None], &[], &record("user_messages"));
        assert_eq!(ran, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_delivery() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bindings = vec![
            Binding {
                filter: FilterDescriptor::insert(),
                handler: Arc::new(|_: &ChangeEventRecord| -> Result<(), CallbackError> {
                    Err(CallbackError::new("boom"))
                }),
            },
            Binding {
                filter: FilterDescriptor::insert(),
                handler: Arc::new(|_: &ChangeEventRecord| -> Result<(), CallbackError> {
                    panic!("handler bug")
                }),
            },
            counting(FilterDescriptor::insert(), counter.clone()),
        ];

        let ran = dispatch("t", &bindings, &[], &[], &record("anything"));
        assert_eq!(ran, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_applies_joined_ids() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bindings = vec![counting(FilterDescriptor::insert(), counter.clone())];
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run("realtime:t".to_string(), bindings, rx));

        tx.send(ChannelEvent::Joined(vec![11])).await.unwrap();
        // Listed id: delivered.
        tx.send(ChannelEvent::Change { ids: vec![11], record: record("a") }).await.unwrap();
        // Another binding's id: skipped.
        tx.send(ChannelEvent::Change { ids: vec![12], record: record("a") }).await.unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_handler_leaves_runtime_free() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let bindings = vec![Binding {
            filter: FilterDescriptor::insert(),
            handler: Arc::new(move |_: &ChangeEventRecord| -> Result<(), CallbackError> {
                // Blocks until the test task, on the same runtime, releases it.
                let released = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(std::time::Duration::from_secs(5))
                    .is_ok();
                done_tx.send(released).unwrap();
                Ok(())
            }),
        }];

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run("realtime:t".to_string(), bindings, rx));
        tx.send(ChannelEvent::Change { ids: vec![], record: record("a") }).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();

        assert_eq!(done_rx.recv().await, Some(true));
        drop(tx);
        task.await.unwrap();
    }
}
