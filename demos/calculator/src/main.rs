//! Calculator demo
//!
//! Starts two object runtimes in one process: the server exports a
//! calculator from an apartment, the client unmarshals the record it is
//! handed and calls through the resulting proxy.
//!
//! Run with: cargo run --bin calculator -- --protseq ncacn_ip_tcp --sta

use std::sync::Arc;

use clap::Parser;
use comrt::{
    marshal_interface, unmarshal_interface, ApartmentKind, ComConfig, ComError, ComRuntime, InterfacePtr, MarshalMode,
    ObjRef, Value,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use calculator_demo::{method, Calculator, ICALCULATOR, IID_ICALCULATOR};

#[derive(Parser)]
#[command(name = "calculator")]
#[command(about = "Cross-apartment calculator demo")]
struct Args {
    /// Protocol sequence the server listens on
    #[arg(short, long, default_value = rpcrt::protseq::NCALRPC)]
    protseq: String,

    /// Network address for ncacn_ip_tcp
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Export from a single-threaded apartment instead of the MTA
    #[arg(long)]
    sta: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

async fn start(args: &Args) -> comrt::Result<ComRuntime> {
    let network_addr = if args.protseq == rpcrt::protseq::NCACN_IP_TCP {
        args.host.as_str()
    } else {
        ""
    };
    let config = ComConfig::default().with_protseq(&args.protseq, network_addr, "");
    let runtime = ComRuntime::new(config).await?;
    runtime.register_interface(&ICALCULATOR);
    Ok(runtime)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server = start(&args).await?;
    let client = start(&args).await?;

    let exporter = if args.sta {
        server.init_apartment(ApartmentKind::Sta)?
    } else {
        server.mta()
    };
    let pump = exporter.is_sta().then(|| {
        let sta = exporter.clone();
        tokio::spawn(async move { sta.run_message_loop().await })
    });
    info!(kind = ?exporter.kind(), oxid = %exporter.oxid(), "server apartment ready");

    let calculator = InterfacePtr::from_object(Arc::new(Calculator::new()));
    let record = marshal_interface(&exporter, &calculator, IID_ICALCULATOR, MarshalMode::Normal).await?;
    let objref = ObjRef::decode(&mut &record[..])?;
    info!(
        bytes = record.len(),
        oxid = %objref.std.oxid,
        oid = %objref.std.oid,
        ipid = %objref.std.ipid,
        refs = objref.std.public_refs,
        "marshaled calculator"
    );

    let importer = client.mta();
    let proxy = unmarshal_interface(&importer, &record, IID_ICALCULATOR).await?;
    if let Some(channel) = proxy.proxy().map(|pm| pm.channel().clone()) {
        info!(
            protseq = channel.protseq(),
            endpoint = channel.endpoint(),
            "connected to calculator"
        );
    }

    let operations = [
        ("Add", method::ADD, 40, 2),
        ("Subtract", method::SUBTRACT, 50, 8),
        ("Multiply", method::MULTIPLY, 6, 7),
        ("Divide", method::DIVIDE, 84, 2),
        ("Divide", method::DIVIDE, 1, 0),
    ];
    for (name, op, a, b) in operations {
        match proxy.invoke(op, vec![Value::I32(a), Value::I32(b)]).await {
            Ok(out) => println!("{}({}, {}) = {}", name, a, b, out[0].as_i32()?),
            Err(ComError::Fault(hr)) => println!("{}({}, {}) failed: HRESULT 0x{:08x}", name, a, b, hr),
            Err(e) => return Err(e.into()),
        }
    }
    let total = proxy.invoke(method::TOTAL, vec![]).await?;
    println!("Operations served: {}", total[0].as_u64()?);

    proxy.release().await?;
    drop(calculator);

    if let Some(pump) = pump {
        server.uninitialize(&exporter).await;
        match pump.await {
            Ok(calls) => info!(calls, "message loop finished"),
            Err(e) => warn!(error = %e, "message loop task failed"),
        }
    }
    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
