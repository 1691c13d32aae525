//! Apartment Tests - MTA and STA Threading Models
//!
//! These tests check how inbound calls reach exported objects:
//! - MTA exporters run calls concurrently
//! - STA exporters run calls one at a time, in the apartment's message loop
//! - An STA waiting on an outbound call defers quit requests

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use comrt::{ApartmentKind, ComConfig, InterfacePtr, Value};
use futures::future::join_all;
use rpcrt::{RuntimeConfig, WorkerPoolConfig};

use common::*;

/// Test: concurrent calls into an MTA object overlap
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mta_runs_calls_concurrently() {
    init_logging();

    const CALLERS: usize = 8;

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let proxy = marshal_across(&server.mta(), &client.mta(), &local, ICALC.iid).await;

    let start = Instant::now();
    let calls = (0..CALLERS).map(|_| {
        let proxy = proxy.clone();
        async move {
            let out = proxy.invoke(DELAY, vec![Value::U32(100)]).await.unwrap();
            proxy.release().await.unwrap();
            out[0].as_u32().unwrap()
        }
    });
    let results = join_all(calls).await;
    let elapsed = start.elapsed();

    println!("\n=== MTA Concurrency Results ===");
    println!("Calls: {}", CALLERS);
    println!("Max concurrent: {}", calc.max_active());
    println!("Elapsed: {:?}", elapsed);

    assert!(results.iter().all(|&ms| ms == 100));
    assert_eq!(calc.calls(), CALLERS as u32);
    assert!(calc.max_active() > 1, "MTA calls never overlapped");

    proxy.release().await.unwrap();
    client.shutdown().await;
    server.shutdown().await;
}

/// Test: calls into an STA object are serialized by its message loop
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sta_serializes_calls() {
    init_logging();

    const CALLERS: usize = 6;

    let runtime = com_runtime(ComConfig::default()).await;
    let sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
    let pump = spawn_message_loop(&sta);

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let proxy = marshal_across(&sta, &runtime.mta(), &local, ICALC.iid).await;

    let calls = (0..CALLERS).map(|_| {
        let proxy = proxy.clone();
        async move {
            proxy.invoke(DELAY, vec![Value::U32(20)]).await.unwrap();
            proxy.release().await.unwrap();
        }
    });
    join_all(calls).await;

    assert_eq!(calc.calls(), CALLERS as u32);
    assert_eq!(calc.max_active(), 1, "STA ran two calls at once");

    proxy.release().await.unwrap();
    runtime.uninitialize(&sta).await;
    let pumped = pump.await.unwrap();
    println!("\n=== STA Serialization Results ===");
    println!("Calls pumped by message loop: {}", pumped);
    assert!(pumped >= CALLERS);
    runtime.shutdown().await;
}

/// Test: several STAs each serialize their own calls while running in
/// parallel with one another
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_stas_run_in_parallel() {
    init_logging();

    const STAS: usize = 4;
    const CALLS_PER_STA: usize = 3;

    let runtime = com_runtime(ComConfig::default()).await;
    let mta = runtime.mta();

    let mut stas = Vec::new();
    let mut pumps = Vec::new();
    let mut calcs = Vec::new();
    let mut proxies = Vec::new();
    for _ in 0..STAS {
        let sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
        pumps.push(spawn_message_loop(&sta));
        let calc = Arc::new(Calculator::new());
        let local = InterfacePtr::from_object(calc.clone());
        proxies.push(marshal_across(&sta, &mta, &local, ICALC.iid).await);
        calcs.push(calc);
        stas.push(sta);
    }

    let start = Instant::now();
    let calls = proxies.iter().flat_map(|proxy| {
        (0..CALLS_PER_STA).map(move |_| async move {
            proxy.invoke(DELAY, vec![Value::U32(50)]).await.unwrap();
        })
    });
    join_all(calls).await;
    let elapsed = start.elapsed();

    println!("\n=== Parallel STA Results ===");
    println!("STAs: {} | Calls per STA: {}", STAS, CALLS_PER_STA);
    println!("Elapsed: {:?}", elapsed);

    for calc in &calcs {
        assert_eq!(calc.calls(), CALLS_PER_STA as u32);
        assert_eq!(calc.max_active(), 1);
    }
    // fully serial would take STAS * CALLS_PER_STA * 50ms
    assert!(elapsed < Duration::from_millis((STAS * CALLS_PER_STA * 50) as u64));

    for proxy in proxies {
        proxy.release().await.unwrap();
    }
    for sta in &stas {
        runtime.uninitialize(sta).await;
    }
    for pump in pumps {
        pump.await.unwrap();
    }
    runtime.shutdown().await;
}

/// Test: a quit posted while the STA waits on an outbound call is held
/// back and ends the next message loop
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quit_deferred_during_outbound_call() {
    init_logging();

    let runtime = com_runtime(ComConfig::default()).await;
    let sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();

    let local = InterfacePtr::from_object(Arc::new(Calculator::new()));
    let proxy = marshal_across(&runtime.mta(), &sta, &local, ICALC.iid).await;

    let quitter = sta.clone();
    let (out, ()) = tokio::join!(proxy.invoke(DELAY, vec![Value::U32(200)]), async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        quitter.post_quit();
    });
    assert_eq!(out.unwrap()[0].as_u32().unwrap(), 200);
    assert_eq!(sta.deferred_messages(), 1);

    assert_eq!(sta.run_message_loop().await, 0);
    assert_eq!(sta.deferred_messages(), 0);

    proxy.release().await.unwrap();
    runtime.shutdown().await;
}

/// Test: uninitializing an STA disconnects what it exported
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uninitialized_sta_disconnects_importers() {
    init_logging();

    let runtime = com_runtime(ComConfig::default()).await;
    let sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
    let pump = spawn_message_loop(&sta);

    let dropped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let local = InterfacePtr::from_object(Arc::new(Calculator::tracked(dropped.clone())));
    let proxy = marshal_across(&sta, &runtime.mta(), &local, ICALC.iid).await;
    drop(local);

    let out = proxy.invoke(ADD, vec![Value::I32(2), Value::I32(3)]).await.unwrap();
    assert_eq!(out[0].as_i32().unwrap(), 5);

    runtime.uninitialize(&sta).await;
    pump.await.unwrap();
    assert_eq!(dropped.load(std::sync::atomic::Ordering::SeqCst), 1);

    let err = proxy.invoke(ADD, vec![Value::I32(1), Value::I32(1)]).await.unwrap_err();
    println!("Call after uninitialize: {}", err);
    assert!(matches!(err, comrt::ComError::Disconnected(_)));

    drop(proxy);
    runtime.shutdown().await;
}

/// Test: many STAs blocked in outbound calls at once still get their
/// replies, even with no idle workers kept around
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sta_callers_share_pool() {
    init_logging();

    const STAS: usize = 12;

    let pool = WorkerPoolConfig::default()
        .with_max_idle_workers(0)
        .with_idle_timeout(Duration::from_millis(10));
    let runtime = com_runtime(ComConfig::default().with_rpc(RuntimeConfig::default().with_worker_pool(pool))).await;

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let mut callers = Vec::new();
    for _ in 0..STAS {
        let sta = runtime.init_apartment(ApartmentKind::Sta).unwrap();
        let proxy = marshal_across(&runtime.mta(), &sta, &local, ICALC.iid).await;
        callers.push(tokio::spawn(async move {
            let out = proxy.invoke(DELAY, vec![Value::U32(200)]).await.unwrap();
            proxy.release().await.unwrap();
            out[0].as_u32().unwrap()
        }));
    }

    let results = tokio::time::timeout(Duration::from_secs(10), join_all(callers))
        .await
        .expect("apartment-threaded calls stalled in the worker pool");
    assert!(results.into_iter().all(|r| r.unwrap() == 200));
    assert_eq!(calc.calls(), STAS as u32);

    let stats = runtime.rpc().pool().stats();
    println!("Peak workers: {}", stats.peak_workers);
    assert!(stats.peak_workers >= STAS);
    assert_eq!(stats.queued, 0);

    runtime.shutdown().await;
}
