//! Probe binary: one vertex-loader pass against a live graph endpoint

use graphload_core::connection::{ConnectionConfig, RestConnection};
use graphload_core::data::{AttributeSelection, TransportKind};
use graphload_core::{LoaderConfig, LoaderFactory, LoaderKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let connection_config = ConnectionConfig::from_env();
    info!("Probing {} graph {}", connection_config.host, connection_config.graph);
    let connection = Arc::new(RestConnection::new(connection_config)?);
    let factory = LoaderFactory::new(connection)?;

    let mut builder = LoaderConfig::builder()
        .kind(LoaderKind::Vertex)
        .num_batches(env_parse("PROBE_NUM_BATCHES").unwrap_or(4))
        .shuffle(env_parse("PROBE_SHUFFLE").unwrap_or(false))
        .timeout(Duration::from_secs(env_parse("PROBE_TIMEOUT_SECS").unwrap_or(60)));

    if let Ok(attributes) = std::env::var("PROBE_ATTRIBUTES") {
        let attributes: Vec<String> = attributes.split(',').map(|a| a.trim().to_string()).collect();
        builder = builder.vertex_selection(AttributeSelection::Uniform(attributes));
    }
    if let Ok(filter) = std::env::var("PROBE_FILTER") {
        builder = builder.filter_by(filter);
    }
    let config = builder.transport(TransportKind::Bulk).build()?;

    let mut loader = factory.loader(config)?;
    let start = Instant::now();
    let (mut batches, mut failures, mut rows) = (0usize, 0usize, 0usize);
    for (i, batch) in (&mut loader).enumerate() {
        match batch {
            Ok(batch) => {
                info!("Batch {} (partition {:?}): {} vertices", i, batch.partition, batch.num_vertices());
                batches += 1;
                rows += batch.num_vertices();
            }
            Err(e) => {
                error!("Batch {} failed: {}", i, e);
                failures += 1;
            }
        }
    }

    info!(
        "Pass finished as {:?} in {:?}: {} batches, {} failures, {} vertices",
        loader.state(),
        start.elapsed(),
        batches,
        failures,
        rows
    );
    println!("{}", factory.metrics());
    Ok(())
}
