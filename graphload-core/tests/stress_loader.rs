//! Stress tests for the loader pipeline
//!
//! Run with: cargo test --release --test stress_loader -- --nocapture

mod common;

use common::*;
use graphload_core::data::TransportKind;
use graphload_core::{Batch, LoaderConfig, LoaderState};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Instant;

/// Many shuffled epochs through a one-slot buffer
#[test]
fn stress_repeated_epochs() {
    let fixture = Fixture::cora();
    let config = LoaderConfig::builder()
        .vertex_attributes(["x", "y", "is_train"])
        .batch_size(100)
        .shuffle(true)
        .buffer_size(1)
        .build()
        .unwrap();
    let mut loader = fixture.factory.loader(config).unwrap();

    let epochs = 20;
    let start = Instant::now();
    for _ in 0..epochs {
        let loader = loader.epoch().unwrap();
        let batches: Vec<Batch> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 28);
        assert_exact_cover(&vertex_ids(&batches), CORA_PAPERS);
    }

    let elapsed = start.elapsed();
    let rows_per_sec = (epochs * CORA_PAPERS) as f64 / elapsed.as_secs_f64();
    println!("Repeated epochs:");
    println!("  Epochs: {}", epochs);
    println!("  Elapsed: {:?}", elapsed);
    println!("  Throughput: {:.0} rows/s", rows_per_sec);
    println!("  Stats: {:?}", loader.stats());
}

/// Reset at random points in the pass, bulk and streamed
#[test]
fn stress_reset_storm() {
    let fixture = Fixture::cora_streamed();
    let mut rng = StdRng::seed_from_u64(7);

    for transport in [TransportKind::Bulk, TransportKind::Streamed] {
        let config = LoaderConfig::builder()
            .num_batches(16)
            .buffer_size(2)
            .transport(transport)
            .build()
            .unwrap();
        let mut loader = fixture.factory.loader(config).unwrap();

        for _ in 0..25 {
            let take = rng.gen_range(0..16);
            for _ in 0..take {
                loader.next().unwrap().unwrap();
            }
            loader.reset();
            assert_eq!(loader.state(), LoaderState::Idle);
        }

        let batches: Vec<Batch> = (&mut loader).map(|b| b.unwrap()).collect();
        assert_exact_cover(&vertex_ids(&batches), CORA_PAPERS);
        assert_eq!(loader.state(), LoaderState::Exhausted);
    }
}
