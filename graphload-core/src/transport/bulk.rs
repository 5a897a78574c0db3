//! Bulk transport
//!
//! One synchronous request per partition, in plan order. A single-partition
//! plan sends one request for the whole filtered set.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use super::Transport;
use crate::connection::{Envelope, FetchRequest, GraphConnection};
use crate::data::batch::RawBatch;
use crate::data::partition::PartitionPlan;
use crate::error::TransportError;

pub struct BulkTransport {
    connection: Arc<dyn GraphConnection>,
    request: FetchRequest,
    /// Partitions not yet requested, in plan order
    remaining: VecDeque<u32>,
    /// Batches returned by a request but not yet handed out
    ready: VecDeque<RawBatch>,
    whole_set: bool,
    current: Option<u32>,
    limit: u64,
}

impl BulkTransport {
    pub fn new(connection: Arc<dyn GraphConnection>, request: FetchRequest, plan: &PartitionPlan, limit: u64) -> Self {
        Self {
            connection,
            request,
            remaining: plan.ids().into(),
            ready: VecDeque::new(),
            whole_set: plan.is_single(),
            current: None,
            limit,
        }
    }

    async fn fetch(&mut self, partition: u32) -> Result<(), TransportError> {
        let request = if self.whole_set {
            self.request.clone()
        } else {
            self.request.for_partition(partition)
        };
        let body = self.connection.fetch(&request, self.limit).await?;
        let results = decode_envelope(&body, self.limit, partition)?;

        debug!(
            "Partition {} returned {} result(s), {} bytes",
            partition,
            results.len(),
            body.len()
        );

        if results.is_empty() {
            self.ready.push_back(RawBatch {
                partition,
                vertices: None,
                edges: None,
            });
        } else {
            self.ready.extend(results);
        }
        Ok(())
    }
}

/// Decode a bulk response body into its raw batches
pub fn decode_envelope(body: &[u8], limit: u64, partition: u32) -> Result<Vec<RawBatch>, TransportError> {
    if body.len() as u64 > limit {
        return Err(TransportError::PayloadTooLarge {
            size: body.len() as u64,
            limit,
        });
    }
    let envelope: Envelope<RawBatch> =
        serde_json::from_slice(body).map_err(|e| TransportError::DecodeFailed {
            partition: Some(partition),
            reason: e.to_string(),
        })?;
    envelope.into_results(200)
}

#[async_trait]
impl Transport for BulkTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<RawBatch, TransportError>> {
        if let Some(raw) = self.ready.pop_front() {
            return Some(Ok(raw));
        }

        let partition = self.remaining.pop_front()?;
        self.current = Some(partition);
        if self.whole_set {
            self.remaining.clear();
        }

        match self.fetch(partition).await {
            Ok(()) => self.ready.pop_front().map(Ok),
            Err(e) => Some(Err(e)),
        }
    }

    async fn close(&mut self) {
        self.remaining.clear();
        self.ready.clear();
    }

    fn current_partition(&self) -> Option<u32> {
        self.current
    }

    fn isolates_decode_failures(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope() {
        let body = br#"{"error": false, "message": "", "results": [{"partition": 4}]}"#;
        let results = decode_envelope(body, 1024, 4).unwrap();
        assert_eq!(results[0].partition, 4);

        assert!(matches!(
            decode_envelope(body, 8, 4),
            Err(TransportError::PayloadTooLarge { limit: 8, .. })
        ));
        assert!(matches!(
            decode_envelope(b"{not json", 1024, 4),
            Err(TransportError::DecodeFailed { partition: Some(4), .. })
        ));
        assert!(matches!(
            decode_envelope(br#"{"error": true, "message": "boom"}"#, 1024, 4),
            Err(TransportError::Rejected { .. })
        ));
    }
}
