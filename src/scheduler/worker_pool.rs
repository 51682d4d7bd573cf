//! Semaphore-gated workers and the batch scheduler.
//!
//! A batch is a list of independent [`WorkItem`]s. The scheduler walks the
//! list in submission order, waits for a concurrency slot before each item,
//! and spawns one [`Worker`] per item with its own oneshot result channel.
//! Results are drained in submission order once everything is dispatched.
//!
//! # Failure handling
//!
//! - A worker whose operation fails or panics raises the shared fault flag
//!   *before* it releases its slot, so the dispatcher never starts another
//!   item after a fault.
//! - On a fault or an interrupt every in-flight worker is aborted and its
//!   teardown awaited. Aborting drops the worker's launcher future, whose
//!   guard kills the command's process group.
//! - Optionally, remaining descendant processes are reaped afterwards.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{Args, ItemState, Operation, WorkItem, WorkerFault, WorkerOutcome};
use crate::error::{BatchError, ABORT_EXIT_CODE};
use crate::launcher::kill_descendants;

/// Default concurrency cap.
pub const DEFAULT_MAX_CONCURRENCY: usize = 100;

/// Default bound on each `ps` query made while reaping.
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How results are collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collect {
    /// A list in submission order.
    #[default]
    Ordered,
    /// A map from each item's key to its result.
    Keyed,
}

/// Options for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of workers running at once. Must be at least 1.
    pub max_concurrency: usize,
    /// Result collection mode.
    pub collect: Collect,
    /// Exit code reported when a fault aborts the batch.
    pub abort_exit_code: i32,
    /// Whether to kill leftover descendant processes after an abort.
    pub reap_descendants: bool,
    /// Bound on each process listing made while reaping.
    pub reap_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            collect: Collect::Ordered,
            abort_exit_code: ABORT_EXIT_CODE,
            reap_descendants: true,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }
}

impl BatchOptions {
    /// Creates options with the given concurrency cap.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Default::default()
        }
    }

    /// Sets the collection mode.
    pub fn with_collect(mut self, collect: Collect) -> Self {
        self.collect = collect;
        self
    }

    /// Collects results keyed by item key.
    pub fn keyed(self) -> Self {
        self.with_collect(Collect::Keyed)
    }

    /// Sets the abort exit code.
    pub fn with_abort_exit_code(mut self, code: i32) -> Self {
        self.abort_exit_code = code;
        self
    }

    /// Enables or disables reaping of descendant processes after an abort.
    pub fn with_reap_descendants(mut self, reap: bool) -> Self {
        self.reap_descendants = reap;
        self
    }

    /// Sets the bound on each process listing made while reaping.
    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }
}

/// Results of a completed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchOutput<T> {
    /// Results in submission order.
    Ordered(Vec<T>),
    /// Results by item key.
    Keyed(BTreeMap<String, T>),
}

impl<T> BatchOutput<T> {
    /// Number of collected results.
    pub fn len(&self) -> usize {
        match self {
            BatchOutput::Ordered(results) => results.len(),
            BatchOutput::Keyed(results) => results.len(),
        }
    }

    /// Whether the batch produced no results.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Results as a list. Keyed results come out in key order.
    pub fn into_ordered(self) -> Vec<T> {
        match self {
            BatchOutput::Ordered(results) => results,
            BatchOutput::Keyed(results) => results.into_values().collect(),
        }
    }

    /// Results as a map, or `None` for an ordered batch.
    pub fn into_keyed(self) -> Option<BTreeMap<String, T>> {
        match self {
            BatchOutput::Keyed(results) => Some(results),
            BatchOutput::Ordered(_) => None,
        }
    }
}

/// First fault raised in a batch, shared with the dispatcher.
#[derive(Debug, Clone)]
struct FaultReport {
    index: usize,
    key: Option<String>,
    fault: WorkerFault,
}

type FaultSender = Arc<watch::Sender<Option<FaultReport>>>;

/// Runs one work item while holding a concurrency slot.
pub struct Worker<T> {
    index: usize,
    key: Option<String>,
    operation: Arc<dyn Operation<Output = T>>,
    args: Args,
    permit: OwnedSemaphorePermit,
    result_tx: oneshot::Sender<WorkerOutcome<T>>,
    fault_tx: FaultSender,
}

impl<T: Send + 'static> Worker<T> {
    /// Runs the operation and reports its outcome.
    ///
    /// The slot is released last: after the fault flag is raised and the
    /// outcome is sent. If the task is aborted first, dropping it releases
    /// the slot instead.
    async fn run(self) {
        let Worker {
            index,
            key,
            operation,
            args,
            permit,
            result_tx,
            fault_tx,
        } = self;
        let name = operation.name().to_string();
        debug!(index, operation = %name, state = %ItemState::Running, "Worker started");

        let outcome = match AssertUnwindSafe(operation.call(&args)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(WorkerFault::new(&name, format!("{e:#}"))),
            Err(panic) => Err(WorkerFault::new(
                &name,
                format!("panicked: {}", panic_message(panic.as_ref())),
            )),
        };

        match &outcome {
            Ok(_) => debug!(index, operation = %name, state = %ItemState::Completed, "Worker finished"),
            Err(fault) => {
                warn!(index, operation = %name, state = %ItemState::Failed, error = %fault.message, "Worker failed");
                let report = FaultReport {
                    index,
                    key,
                    fault: fault.clone(),
                };
                fault_tx.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(report);
                        true
                    } else {
                        false
                    }
                });
            }
        }

        // The receiver is gone only when the batch is already tearing down.
        let _ = result_tx.send(outcome);
        drop(permit);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A dispatched item awaiting collection.
struct InFlight<T> {
    index: usize,
    key: Option<String>,
    operation: String,
    result_rx: oneshot::Receiver<WorkerOutcome<T>>,
}

enum Stop {
    Interrupted,
    Fault(FaultReport),
}

/// Runs a batch, treating Ctrl-C as an interrupt.
///
/// # Errors
///
/// See [`run_batch_until`].
pub async fn run_batch<T: Send + 'static>(
    items: Vec<WorkItem<T>>,
    options: &BatchOptions,
) -> Result<BatchOutput<T>, BatchError> {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for Ctrl-C, interrupts disabled");
            std::future::pending::<()>().await;
        }
        info!("Interrupt received");
    };
    run_batch_until(items, options, interrupt).await
}

/// Runs a batch until it completes, a worker faults, or `interrupt`
/// resolves.
///
/// # Errors
///
/// - `BatchError::ZeroConcurrency`, `ConcurrencyTooHigh`, `MissingKey`,
///   `DuplicateKey` before any dispatch
/// - `BatchError::Aborted` carrying the configured abort code when a worker
///   fails or panics
/// - `BatchError::Interrupted` when `interrupt` resolves first
pub async fn run_batch_until<T, I>(
    items: Vec<WorkItem<T>>,
    options: &BatchOptions,
    interrupt: I,
) -> Result<BatchOutput<T>, BatchError>
where
    T: Send + 'static,
    I: Future<Output = ()>,
{
    if options.max_concurrency == 0 {
        return Err(BatchError::ZeroConcurrency);
    }
    if options.max_concurrency > Semaphore::MAX_PERMITS {
        return Err(BatchError::ConcurrencyTooHigh {
            requested: options.max_concurrency,
            limit: Semaphore::MAX_PERMITS,
        });
    }
    check_keys(&items, options.collect)?;
    if items.is_empty() {
        return Ok(collect_output(options.collect, Vec::new()));
    }

    let total = items.len();
    info!(items = total, max_concurrency = options.max_concurrency, "Starting batch");

    let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
    let (fault_tx, mut fault_rx) = watch::channel(None);
    let fault_tx: FaultSender = Arc::new(fault_tx);
    tokio::pin!(interrupt);

    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(total);
    let mut in_flight: Vec<InFlight<T>> = Vec::with_capacity(total);
    let mut stop = None;

    for (index, item) in items.into_iter().enumerate() {
        debug!(index, operation = %item.operation.name(), state = %ItemState::Pending, "Waiting for a slot");

        let acquired = tokio::select! {
            biased;
            _ = &mut interrupt => {
                stop = Some(Stop::Interrupted);
                break;
            }
            report = fault_signalled(&mut fault_rx) => {
                stop = Some(Stop::Fault(report));
                break;
            }
            acquired = Arc::clone(&semaphore).acquire_owned() => acquired,
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(_) => {
                stop = Some(Stop::Fault(FaultReport {
                    index,
                    key: item.key,
                    fault: WorkerFault::new(item.operation.name(), "concurrency semaphore closed"),
                }));
                break;
            }
        };

        // A fault may have landed while this slot was being handed over.
        let raised = fault_rx.borrow_and_update().clone();
        if let Some(report) = raised {
            drop(permit);
            stop = Some(Stop::Fault(report));
            break;
        }

        debug!(index, operation = %item.operation.name(), state = %ItemState::Acquired, "Slot acquired");
        let (result_tx, result_rx) = oneshot::channel();
        in_flight.push(InFlight {
            index,
            key: item.key.clone(),
            operation: item.operation.name().to_string(),
            result_rx,
        });
        let worker = Worker {
            index,
            key: item.key,
            operation: item.operation,
            args: item.args,
            permit,
            result_tx,
            fault_tx: Arc::clone(&fault_tx),
        };
        handles.push(tokio::spawn(worker.run()));
    }

    match stop {
        Some(Stop::Interrupted) => {
            teardown(handles, options).await;
            return Err(BatchError::Interrupted);
        }
        Some(Stop::Fault(report)) => {
            teardown(handles, options).await;
            return Err(aborted(report, options));
        }
        None => {}
    }

    let mut results = Vec::with_capacity(total);
    for slot in in_flight {
        let InFlight {
            index,
            key,
            operation,
            result_rx,
        } = slot;

        let outcome = tokio::select! {
            biased;
            _ = &mut interrupt => {
                teardown(handles, options).await;
                return Err(BatchError::Interrupted);
            }
            report = fault_signalled(&mut fault_rx) => Err(report),
            received = result_rx => match received {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(fault)) => Err(FaultReport { index, key: key.clone(), fault }),
                Err(_) => Err(FaultReport {
                    index,
                    key: key.clone(),
                    fault: WorkerFault::new(&operation, "worker exited without reporting a result"),
                }),
            },
        };

        match outcome {
            Ok(value) => {
                debug!(index, operation = %operation, state = %ItemState::Collected, "Result collected");
                results.push((key, value));
            }
            Err(report) => {
                teardown(handles, options).await;
                return Err(aborted(report, options));
            }
        }
    }

    info!(items = total, "Batch complete");
    Ok(collect_output(options.collect, results))
}

/// Resolves once any worker has raised the fault flag.
async fn fault_signalled(rx: &mut watch::Receiver<Option<FaultReport>>) -> FaultReport {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(report) = current {
            return report;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn aborted(report: FaultReport, options: &BatchOptions) -> BatchError {
    error!(
        index = report.index,
        key = ?report.key,
        operation = %report.fault.operation,
        error = %report.fault.message,
        "Aborting batch"
    );
    BatchError::Aborted {
        index: report.index,
        key: report.key,
        operation: report.fault.operation,
        message: report.fault.message,
        exit_code: options.abort_exit_code,
    }
}

/// Aborts every worker, waits for each to be torn down, then reaps leftovers.
async fn teardown(handles: Vec<JoinHandle<()>>, options: &BatchOptions) {
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        if let Err(e) = handle.await {
            if e.is_panic() {
                warn!(error = %e, "Worker task panicked during teardown");
            }
        }
    }
    if options.reap_descendants {
        let reaped = kill_descendants(options.reap_timeout).await;
        info!(reaped, "Reaped leftover processes");
    }
}

fn check_keys<T>(items: &[WorkItem<T>], collect: Collect) -> Result<(), BatchError> {
    if collect != Collect::Keyed {
        return Ok(());
    }
    let mut seen = HashSet::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let key = item.key.as_deref().ok_or(BatchError::MissingKey(index))?;
        if !seen.insert(key) {
            return Err(BatchError::DuplicateKey(key.to_string()));
        }
    }
    Ok(())
}

fn collect_output<T>(collect: Collect, results: Vec<(Option<String>, T)>) -> BatchOutput<T> {
    match collect {
        Collect::Ordered => BatchOutput::Ordered(results.into_iter().map(|(_, value)| value).collect()),
        Collect::Keyed => BatchOutput::Keyed(
            results
                .into_iter()
                .filter_map(|(key, value)| key.map(|key| (key, value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::INTERRUPT_EXIT_CODE;
    use crate::scheduler::job::operation_fn;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn options(max_concurrency: usize) -> BatchOptions {
        BatchOptions::new(max_concurrency).with_reap_descendants(false)
    }

    fn index_arg(args: &Args) -> u64 {
        args.get("i").and_then(Value::as_u64).unwrap_or(u64::MAX)
    }

    /// Items that sleep, record peak concurrency and return their index.
    fn sleepy_items(
        n: u64,
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> Vec<WorkItem<u64>> {
        let op = operation_fn("sleepy", move |args: Args| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(index_arg(&args))
            }
        });
        (0..n)
            .map(|i| WorkItem::new(Arc::clone(&op), Args::new().with("i", i)).with_key(format!("item-{i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items = sleepy_items(5, Duration::from_millis(100), Arc::clone(&active), Arc::clone(&peak));

        let start = Instant::now();
        let output = run_batch_until(items, &options(2), std::future::pending()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(output.into_ordered(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_keyed_collection() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items = sleepy_items(3, Duration::from_millis(10), active, peak);

        let output = run_batch_until(items, &options(3).keyed(), std::future::pending())
            .await
            .unwrap();
        let keyed = output.into_keyed().unwrap();
        assert_eq!(keyed.len(), 3);
        assert_eq!(keyed["item-2"], 2);
    }

    #[tokio::test]
    async fn test_fault_aborts_and_stops_dispatch() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let op = operation_fn("maybe_fail", move |args: Args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match index_arg(&args) {
                    1 => anyhow::bail!("node unreachable"),
                    i => Ok(i),
                }
            }
        });
        let items = (0..3u64)
            .map(|i| WorkItem::new(Arc::clone(&op), Args::new().with("i", i)))
            .collect();

        let err = run_batch_until(items, &options(1), std::future::pending())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), ABORT_EXIT_CODE);
        match err {
            BatchError::Aborted { index, operation, message, .. } => {
                assert_eq!(index, 1);
                assert_eq!(operation, "maybe_fail");
                assert!(message.contains("node unreachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fault_cancels_running_workers() {
        let op = operation_fn("slow_or_fail", |args: Args| async move {
            if index_arg(&args) == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(0)
            } else {
                anyhow::bail!("fatal")
            }
        });
        let items = (0..2u64)
            .map(|i| WorkItem::new(Arc::clone(&op), Args::new().with("i", i)))
            .collect();

        let start = Instant::now();
        let err = run_batch_until(items, &options(2), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Aborted { index: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let op = operation_fn("explode", |_args: Args| async move {
            if true {
                panic!("worker blew up");
            }
            Ok::<_, anyhow::Error>(())
        });
        let err = run_batch_until(vec![WorkItem::new(op, Args::new())], &options(1), std::future::pending())
            .await
            .unwrap_err();
        match err {
            BatchError::Aborted { message, .. } => assert!(message.contains("worker blew up")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_interrupt_tears_down_workers() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (d, s) = (Arc::clone(&dropped), Arc::clone(&started));
        let op = operation_fn("hang", move |_args: Args| {
            let guard = DropCounter(Arc::clone(&d));
            let started = Arc::clone(&s);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                drop(guard);
                Ok::<_, anyhow::Error>(())
            }
        });
        let items = (0..4)
            .map(|_| WorkItem::new(Arc::clone(&op), Args::new()))
            .collect();

        let err = run_batch_until(items, &options(2), tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Interrupted));
        assert_eq!(err.exit_code(), INTERRUPT_EXIT_CODE);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_before_dispatch() {
        let op = operation_fn("noop", |_args: Args| async move { Ok::<_, anyhow::Error>(()) });

        let err = run_batch_until(vec![WorkItem::new(Arc::clone(&op), Args::new())], &options(0), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::ZeroConcurrency));

        let err = run_batch_until(
            vec![WorkItem::new(Arc::clone(&op), Args::new())],
            &options(usize::MAX),
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BatchError::ConcurrencyTooHigh { requested: usize::MAX, .. }));
        assert_eq!(err.exit_code(), 1);

        let items = vec![
            WorkItem::new(Arc::clone(&op), Args::new()).with_key("a"),
            WorkItem::new(Arc::clone(&op), Args::new()),
        ];
        let err = run_batch_until(items, &options(1).keyed(), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::MissingKey(1)));

        let items = vec![
            WorkItem::new(Arc::clone(&op), Args::new()).with_key("a"),
            WorkItem::new(Arc::clone(&op), Args::new()).with_key("a"),
        ];
        let err = run_batch_until(items, &options(1).keyed(), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::DuplicateKey(ref k) if k == "a"));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let output = run_batch_until(Vec::<WorkItem<()>>::new(), &options(4), std::future::pending())
            .await
            .unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_custom_abort_code() {
        let op = operation_fn("fail", |_args: Args| async move { Err::<(), _>(anyhow::anyhow!("no")) });
        let err = run_batch_until(
            vec![WorkItem::new(op, Args::new())],
            &options(1).with_abort_exit_code(9),
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), 9);
    }

    #[test]
    fn test_options_builder() {
        let opts = BatchOptions::default();
        assert_eq!(opts.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(opts.collect, Collect::Ordered);
        assert!(opts.reap_descendants);

        let opts = BatchOptions::new(3)
            .keyed()
            .with_reap_timeout(Duration::from_secs(1))
            .with_reap_descendants(false);
        assert_eq!(opts.collect, Collect::Keyed);
        assert_eq!(opts.reap_timeout, Duration::from_secs(1));
        assert!(!opts.reap_descendants);
    }
}
