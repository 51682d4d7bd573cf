//! Integration tests for batch execution against the local host.
//!
//! Commands run through the real launcher and shell wrapper, so tests that
//! need `bash`, `xxd` or `timeout` skip themselves when a tool is missing.
//! The ssh test needs a reachable node:
//! TIMMY_TEST_NODE=10.0.0.5 cargo test --test batch_integration -- --ignored

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use timmy::config::Config;
use timmy::error::{BatchError, ABORT_EXIT_CODE};
use timmy::launcher::launch;
use timmy::lock::InstanceLock;
use timmy::scheduler::{
    node_items, operation_fn, run_batch_until, Args, BatchOptions, ExecOperation, Operation,
    WorkItem,
};
use timmy::ExecutionResult;

fn tools_available(tools: &[&str]) -> bool {
    tools.iter().all(|tool| {
        std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("command -v {tool}"))
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

fn test_config() -> Config {
    Config::default()
        .with_timeout(Duration::from_secs(10))
        .with_reap_descendants(false)
}

#[tokio::test]
async fn test_exec_on_loopback_nodes() {
    if !tools_available(&["bash", "xxd", "timeout"]) {
        eprintln!("skipping: bash/xxd/timeout not installed");
        return;
    }
    let config = test_config();
    let op: Arc<dyn Operation<Output = ExecutionResult>> =
        Arc::new(ExecOperation::from_config(&config));
    let nodes = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let items = node_items(op, &nodes, &Args::new().with("command", "echo ok; exit 3"));

    let output = run_batch_until(items, &config.batch_options().keyed(), std::future::pending())
        .await
        .expect("batch should complete");

    let results = output.into_keyed().expect("keyed output");
    assert_eq!(results.len(), 2);
    for node in &nodes {
        let result = &results[node];
        assert_eq!(result.target, *node);
        assert_eq!(result.stdout, "ok\n");
        // Non-zero exits are data, not faults.
        assert_eq!(result.exit_code, 3);
    }
}

#[tokio::test]
async fn test_stdin_payload_reaches_command() {
    if !tools_available(&["bash", "xxd", "timeout"]) {
        eprintln!("skipping: bash/xxd/timeout not installed");
        return;
    }
    let config = test_config();
    let op: Arc<dyn Operation<Output = ExecutionResult>> =
        Arc::new(ExecOperation::from_config(&config));
    let args = Args::new()
        .with("address", "localhost")
        .with("command", "wc -l")
        .with("input", "one\ntwo\nthree\n");

    let result = op.call(&args).await.expect("exec should run");
    assert_eq!(result.stdout.trim(), "3");
}

#[tokio::test]
async fn test_abort_kills_running_commands() {
    let temp = tempfile::TempDir::new().unwrap();
    let marker = temp.path().join("finished");
    let command = format!("sleep 1 && touch '{}'", marker.display());

    let op = operation_fn("step", move |args: Args| {
        let command = command.clone();
        async move {
            if args.get("fail").is_some() {
                tokio::time::sleep(Duration::from_millis(200)).await;
                anyhow::bail!("step failed on purpose");
            }
            let result = launch(&command, Duration::from_secs(10), None, &[]).await?;
            Ok(result.exit_code)
        }
    });
    let items = vec![
        WorkItem::new(Arc::clone(&op), Args::new()),
        WorkItem::new(Arc::clone(&op), Args::new().with("fail", true)),
    ];

    let start = Instant::now();
    let err = run_batch_until(
        items,
        &BatchOptions::new(2).with_reap_descendants(false),
        std::future::pending(),
    )
    .await
    .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(err.exit_code(), ABORT_EXIT_CODE);
    assert!(matches!(err, BatchError::Aborted { index: 1, .. }));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!Path::new(&marker).exists(), "aborted command kept running");
}

#[tokio::test]
async fn test_abort_stops_exec_payloads() {
    if !tools_available(&["bash", "xxd", "timeout"]) {
        eprintln!("skipping: bash/xxd/timeout not installed");
        return;
    }
    let temp = tempfile::TempDir::new().unwrap();
    let marker = temp.path().join("payload-finished");
    let config = test_config();
    let exec: Arc<dyn Operation<Output = ExecutionResult>> =
        Arc::new(ExecOperation::from_config(&config));
    let fail = operation_fn("fail", |_args: Args| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Err::<ExecutionResult, _>(anyhow::anyhow!("fatal"))
    });
    let items = vec![
        WorkItem::new(
            exec,
            Args::new()
                .with("address", "localhost")
                .with("command", format!("sleep 2; touch '{}'", marker.display())),
        ),
        WorkItem::new(fail, Args::new()),
    ];

    let err = run_batch_until(
        items,
        &BatchOptions::new(2).with_reap_descendants(false),
        std::future::pending(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BatchError::Aborted { index: 1, .. }));

    // `timeout` runs the payload in its own process group.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists(), "exec payload kept running after the abort");
}

#[tokio::test]
async fn test_interrupt_stops_pending_items() {
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    let op = operation_fn("wait", move |_args: Args| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, anyhow::Error>(())
        }
    });
    let items = (0..10)
        .map(|_| WorkItem::new(Arc::clone(&op), Args::new()))
        .collect();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(());
    });

    let err = run_batch_until(
        items,
        &BatchOptions::new(3).with_reap_descendants(false),
        async {
            let _ = rx.await;
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BatchError::Interrupted));
    assert_eq!(started.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_locked_batches_run_once() {
    let temp = tempfile::TempDir::new().unwrap();
    let lock = InstanceLock::new(temp.path(), "timmy");
    let executed = Arc::new(AtomicUsize::new(0));

    let run = |lock: InstanceLock, executed: Arc<AtomicUsize>| async move {
        lock.with_lock_async("exec", |guard| async move {
            let _guard = guard;
            executed.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
        .await
        .unwrap()
    };

    let (a, b) = tokio::join!(
        run(lock.clone(), Arc::clone(&executed)),
        run(lock.clone(), Arc::clone(&executed))
    );

    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert_eq!([a, b].iter().filter(|r| r.is_none()).count(), 1);
}

#[tokio::test]
#[ignore] // Run with: TIMMY_TEST_NODE=host cargo test --test batch_integration -- --ignored
async fn test_exec_over_ssh() {
    let node = std::env::var("TIMMY_TEST_NODE")
        .expect("TIMMY_TEST_NODE environment variable must be set for ssh tests");
    let config = test_config().with_ssh_options(["-oBatchMode=yes", "-oConnectTimeout=5"]);
    let op: Arc<dyn Operation<Output = ExecutionResult>> =
        Arc::new(ExecOperation::from_config(&config));
    let items = node_items(op, &[node.clone()], &Args::new().with("command", "echo $((6 * 7))"));

    let output = run_batch_until(items, &config.batch_options().keyed(), std::future::pending())
        .await
        .expect("batch should complete");
    let results = output.into_keyed().expect("keyed output");
    assert_eq!(results[&node].stdout.trim(), "42");
}
