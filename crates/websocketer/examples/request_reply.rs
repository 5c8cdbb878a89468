//! Request-Reply Example
//!
//! Two endpoints on an in-process transport pair calling each other's
//! named handlers.
//!
//! Run with: `cargo run -p websocketer --example request_reply`

use serde_json::json;
use websocketer::{Endpoint, EndpointConfig, WsrError, memory_pair};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let (near, far) = memory_pair();

    let server = Endpoint::attach(far, EndpointConfig::new().id("server"))?;
    server.listen("greet", |payload, _| async move {
        let who = payload
            .and_then(|p| p.as_str().map(str::to_string))
            .unwrap_or_else(|| "stranger".to_string());
        Ok(Some(json!(format!("hello, {who}"))))
    });
    server.listen("fail", |_, _| async {
        Err(WsrError::internal("this operation always fails"))
    });

    let client = Endpoint::attach(near, EndpointConfig::new().id("client"))?;

    let reply = client.call("greet", json!("world")).await?;
    println!("greet       -> {reply:?}");

    let reply = client.call("greet", None).await?;
    println!("greet(none) -> {reply:?}");

    match client.call("fail", None).await {
        Ok(_) => println!("fail        -> unexpectedly succeeded"),
        Err(e) => println!("fail        -> {} ({})", e, e.code()),
    }

    match client.call("unknown", None).await {
        Ok(_) => println!("unknown     -> unexpectedly succeeded"),
        Err(e) => println!("unknown     -> {} ({})", e, e.code()),
    }

    client.destroy().await;
    server.destroy().await;
    Ok(())
}
