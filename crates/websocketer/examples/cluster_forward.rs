//! Cluster Forwarding Example
//!
//! Three endpoints sharing a local collaborator. Requests addressed to a
//! peer are handed over and their replies relayed back transparently.
//!
//! Run with: `cargo run -p websocketer --example cluster_forward`

use std::sync::Arc;

use serde_json::json;
use websocketer::{
    CallManyOptions, Endpoint, EndpointConfig, LocalCluster, MemoryTransport, memory_pair,
};

fn worker(
    cluster: &Arc<LocalCluster>,
    id: &str,
) -> websocketer::WsrResult<(Endpoint, MemoryTransport)> {
    let (near, far) = memory_pair();
    let endpoint = Endpoint::attach(
        near,
        EndpointConfig::new().id(id).cluster(cluster.clone()),
    )?;
    Ok((endpoint, far))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cluster = Arc::new(LocalCluster::new());

    // each worker keeps its far transport end alive for the demo
    let (alpha, _alpha_wire) = worker(&cluster, "alpha")?;
    let (beta, _beta_wire) = worker(&cluster, "beta")?;
    let (gamma, _gamma_wire) = worker(&cluster, "gamma")?;

    for endpoint in [&beta, &gamma] {
        let id = endpoint.id().to_string();
        endpoint.listen("status", move |_, _| {
            let id = id.clone();
            async move { Ok(Some(json!(format!("{id} is up")))) }
        });
    }

    let reply = alpha.call_to("status", None, "beta").await?;
    println!("beta        -> {reply:?}");

    let options = CallManyOptions::default().continue_on_error(true);
    let results = alpha
        .call_many("status", None, &["beta", "gamma", "delta"], options)
        .await?;
    for (destination, result) in ["beta", "gamma", "delta"].iter().zip(results) {
        match result {
            Ok(payload) => println!("{destination:<12}-> {payload:?}"),
            Err(e) => println!("{destination:<12}-> {} ({})", e, e.code()),
        }
    }

    alpha.destroy().await;
    beta.destroy().await;
    gamma.destroy().await;
    Ok(())
}
