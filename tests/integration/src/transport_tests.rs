//! Transport Tests - Object Calls Over Each Protocol Sequence
//!
//! The object runtime is transport agnostic: the exporter advertises the
//! protocol sequence it listens on in its marshal records and importers
//! connect to whatever the record names.

mod common;

use std::sync::Arc;

use comrt::{ApartmentKind, ComConfig, ComError, InterfacePtr, Value};
use rpcrt::protseq;

use common::*;

fn tcp_config() -> ComConfig {
    ComConfig::default().with_protseq(protseq::NCACN_IP_TCP, "127.0.0.1", "")
}

/// Test: the advertised binding names the port actually bound
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_binding_advertised() {
    init_logging();

    let runtime = com_runtime(tcp_config()).await;
    let bindings = &runtime.bindings().string_bindings;
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].protseq(), Some(protseq::NCACN_IP_TCP));

    let (network_addr, endpoint) = bindings[0].address();
    println!("Advertised: {}[{}]", network_addr, endpoint);
    assert_eq!(network_addr, "127.0.0.1");
    let port: u16 = endpoint.parse().unwrap();
    assert_ne!(port, 0);

    runtime.shutdown().await;
}

/// Test: calls between two runtimes over TCP
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_over_tcp() {
    init_logging();

    let server = com_runtime(tcp_config()).await;
    let client = com_runtime(tcp_config()).await;

    let calc = Arc::new(Calculator::new());
    let local = InterfacePtr::from_object(calc.clone());
    let proxy = marshal_across(&server.mta(), &client.mta(), &local, ICALC.iid).await;
    assert_eq!(proxy.proxy().unwrap().channel().protseq(), protseq::NCACN_IP_TCP);

    for i in 0..20 {
        let out = proxy.invoke(ADD, vec![Value::I32(i), Value::I32(i)]).await.unwrap();
        assert_eq!(out[0].as_i32().unwrap(), i * 2);
    }
    let calls = proxy.invoke(CALLS, vec![]).await.unwrap();
    assert_eq!(calls[0].as_u32().unwrap(), 21);

    proxy.release().await.unwrap();
    let oid = server.mta().exported_oid(&local);
    assert!(oid.is_none());

    client.shutdown().await;
    server.shutdown().await;
}

/// Test: an importer listening on ncalrpc reaches a TCP exporter, and the
/// exporter's callbacks reach the importer over ncalrpc
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_protocol_sequences() {
    init_logging();

    let server = com_runtime(tcp_config()).await;
    let client = com_runtime(ComConfig::default()).await;
    let sta = client.init_apartment(ApartmentKind::Sta).unwrap();

    let driver = marshal_across(
        &server.mta(),
        &sta,
        &InterfacePtr::from_object(Arc::new(Driver)),
        IDRIVER.iid,
    )
    .await;
    assert_eq!(driver.proxy().unwrap().channel().protseq(), protseq::NCACN_IP_TCP);

    let doubler = Arc::new(Doubler::default());
    let out = driver
        .invoke(
            DRIVE,
            vec![Value::Interface(Some(InterfacePtr::from_object(doubler.clone()))), Value::U32(4)],
        )
        .await
        .unwrap();
    assert_eq!(out[0].as_u32().unwrap(), 9);
    assert_eq!(doubler.notified(), 1);

    driver.release().await.unwrap();
    client.shutdown().await;
    server.shutdown().await;
}

/// Test: calls to an apartment torn down on the far side of a TCP link
/// report the exporter as disconnected
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_over_tcp() {
    init_logging();

    let server = com_runtime(tcp_config()).await;
    let client = com_runtime(tcp_config()).await;
    let sta = server.init_apartment(ApartmentKind::Sta).unwrap();
    let pump = spawn_message_loop(&sta);

    let local = InterfacePtr::from_object(Arc::new(Calculator::new()));
    let proxy = marshal_across(&sta, &client.mta(), &local, ICALC.iid).await;
    let out = proxy.invoke(ADD, vec![Value::I32(1), Value::I32(2)]).await.unwrap();
    assert_eq!(out[0].as_i32().unwrap(), 3);

    server.uninitialize(&sta).await;
    pump.await.unwrap();

    let err = proxy.invoke(ADD, vec![Value::I32(1), Value::I32(2)]).await.unwrap_err();
    println!("Call after exporter teardown: {}", err);
    assert!(matches!(err, ComError::Disconnected(oxid) if oxid == sta.oxid()));

    drop(proxy);
    client.shutdown().await;
    server.shutdown().await;
}
