//! A simple discovery demo listing all the found servers and devices.

use ascom_alpaca_discovery::discovery::{DiscoveryEngine, DiscoveryOptions};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    println!("Searching...");

    let engine = DiscoveryEngine::new();
    engine.start_discovery(DiscoveryOptions {
        resolve_dns: true,
        ..DiscoveryOptions::default()
    })?;
    let _ = engine.wait_for_completion().await;

    for server in engine.get_alpaca_servers() {
        let endpoint = &server.endpoint;
        println!(
            "Server at {addr} ({host}): {status:?}",
            addr = endpoint.addr,
            host = endpoint.host_name.as_deref().unwrap_or("unknown host"),
            status = endpoint.status,
        );
        if let Some(server_info) = &server.server_info {
            println!("Server info: {server_info:#?}");
        }
        if !server.status_message.is_empty() {
            println!("Problems: {}", server.status_message);
        }
        println!("Devices: {:#?}", server.devices);
    }

    println!("Discovery completed");

    engine.dispose();

    Ok(())
}
