//! Reference Counting Tests - Distributed Lifetime Across Runtimes
//!
//! Each runtime here stands in for a separate process. The exporter's
//! counts are checked after every step:
//! - normal marshal transfers a batch of references, released in one call
//! - table-strong records keep the object alive until released
//! - a proxy re-marshaled to a third party points straight at the exporter
//! - concurrent clone/release on one proxy leaves the counts consistent

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use comrt::{
    marshal_interface, release_marshal_data, unmarshal_interface, ComConfig, InterfacePtr, MarshalMode, Value,
};
use futures::future::join_all;

use common::*;

/// Test: the last local release on a proxy sends every held reference back
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_release_returns_all_references() {
    init_logging();

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();

    let dropped = Arc::new(AtomicUsize::new(0));
    let local = InterfacePtr::from_object(Arc::new(Calculator::tracked(dropped.clone())));
    let proxy = marshal_across(&exporter, &client.mta(), &local, ICALC.iid).await;
    let oid = exporter.exported_oid(&local).unwrap();
    assert_eq!(exporter.object_refs(oid), Some(5));

    let copies: Vec<_> = (0..3).map(|_| proxy.clone()).collect();
    assert_eq!(proxy.proxy().unwrap().refs(), 4);
    for copy in copies {
        copy.release().await.unwrap();
    }
    // local releases never reach the exporter
    assert_eq!(exporter.object_refs(oid), Some(5));

    assert_eq!(proxy.release().await.unwrap(), 0);
    assert_eq!(exporter.object_refs(oid), None);
    assert_eq!(client.mta().imported_objects(), 0);

    drop(local);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: dropping a proxy without releasing it still frees the object
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_proxy_released_in_background() {
    init_logging();

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();

    let local = InterfacePtr::from_object(Arc::new(Calculator::new()));
    let proxy = marshal_across(&exporter, &client.mta(), &local, ICALC.iid).await;
    let oid = exporter.exported_oid(&local).unwrap();

    drop(proxy);
    wait_for(|| exporter.object_refs(oid).is_none()).await;
    assert_eq!(exporter.exported_objects(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: a table-strong record outlives every proxy made from it
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_table_strong_across_runtimes() {
    init_logging();

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();
    let importer = client.mta();

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let record = marshal_interface(&exporter, &local, ICALC.iid, MarshalMode::TableStrong)
        .await
        .unwrap();
    let oid = exporter.exported_oid(&local).unwrap();
    assert_eq!(exporter.object_refs(oid), Some(1));

    let first = unmarshal_interface(&importer, &record, ICALC.iid).await.unwrap();
    first.invoke(ADD, vec![Value::I32(1), Value::I32(1)]).await.unwrap();
    first.release().await.unwrap();
    assert_eq!(exporter.object_refs(oid), Some(1));

    // the record can be unmarshaled again after every proxy is gone
    let second = unmarshal_interface(&importer, &record, ICALC.iid).await.unwrap();
    second.invoke(ADD, vec![Value::I32(2), Value::I32(2)]).await.unwrap();
    second.release().await.unwrap();
    assert_eq!(calc.calls(), 2);

    // released from the importing side, over the wire
    release_marshal_data(&importer, &record).await.unwrap();
    assert_eq!(exporter.object_refs(oid), None);

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: A exports, B re-marshals its proxy to C, C calls A directly
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_remarshal_to_third_runtime() {
    init_logging();

    let a = com_runtime(ComConfig::default()).await;
    let b = com_runtime(ComConfig::default()).await;
    let c = com_runtime(ComConfig::default()).await;
    let exporter = a.mta();

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let at_b = marshal_across(&exporter, &b.mta(), &local, ICALC.iid).await;
    let oid = exporter.exported_oid(&local).unwrap();

    let at_c = marshal_across(&b.mta(), &c.mta(), &at_b, ICALC.iid).await;
    let pm = at_c.proxy().unwrap();
    assert_eq!(pm.oxid(), exporter.oxid());
    assert_eq!(pm.oid(), oid);
    // B's batch plus the batch B fetched for C
    assert_eq!(exporter.object_refs(oid), Some(10));

    at_b.release().await.unwrap();
    assert_eq!(exporter.object_refs(oid), Some(5));

    let out = at_c.invoke(ADD, vec![Value::I32(20), Value::I32(22)]).await.unwrap();
    assert_eq!(out[0].as_i32().unwrap(), 42);
    assert_eq!(calc.calls(), 1);

    at_c.release().await.unwrap();
    assert_eq!(exporter.object_refs(oid), None);

    for runtime in [&c, &b, &a] {
        runtime.shutdown().await;
    }
}

/// Test: many tasks cloning and releasing one proxy
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_clone_and_release() {
    init_logging();

    const TASKS: usize = 16;
    const ROUNDS: usize = 20;

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let proxy = marshal_across(&exporter, &client.mta(), &local, ICALC.iid).await;
    let oid = exporter.exported_oid(&local).unwrap();

    let tasks = (0..TASKS).map(|i| {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            for round in 0..ROUNDS {
                let copy = proxy.clone();
                let out = copy
                    .invoke(ADD, vec![Value::I32(i as i32), Value::I32(round as i32)])
                    .await
                    .unwrap();
                assert_eq!(out[0].as_i32().unwrap(), (i + round) as i32);
                if round % 2 == 0 {
                    copy.release().await.unwrap();
                } else {
                    drop(copy);
                }
            }
            proxy.release().await.unwrap();
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    println!("\n=== Concurrent Clone/Release Results ===");
    println!("Calls: {}", calc.calls());
    println!("Proxy refs left: {}", proxy.proxy().unwrap().refs());

    assert_eq!(calc.calls(), (TASKS * ROUNDS) as u32);
    assert_eq!(proxy.proxy().unwrap().refs(), 1);
    assert_eq!(exporter.object_refs(oid), Some(5));

    proxy.release().await.unwrap();
    assert_eq!(exporter.object_refs(oid), None);

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: an interface returned as an out argument arrives as a proxy that
/// owns its references
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interface_out_argument() {
    init_logging();

    let server = com_runtime(ComConfig::default()).await;
    let client = com_runtime(ComConfig::default()).await;
    let exporter = server.mta();

    let factory = Arc::new(Factory::default());
    let local = InterfacePtr::from_object(factory.clone());
    let remote_factory = marshal_across(&exporter, &client.mta(), &local, IFACTORY.iid).await;

    let mut out = remote_factory.invoke(CREATE, vec![]).await.unwrap();
    let calc = out.swap_remove(0).into_interface().unwrap().unwrap();
    assert!(calc.is_proxy());
    assert_eq!(factory.created(), 1);
    assert_eq!(exporter.exported_objects(), 2);

    let sum = calc.invoke(ADD, vec![Value::I32(-3), Value::I32(10)]).await.unwrap();
    assert_eq!(sum[0].as_i32().unwrap(), 7);

    calc.release().await.unwrap();
    assert_eq!(exporter.exported_objects(), 1);
    remote_factory.release().await.unwrap();
    assert_eq!(exporter.exported_objects(), 0);

    client.shutdown().await;
    server.shutdown().await;
}
