// kafkagate/src/kafka/batch.rs
//
// Pending record batch built by a parser and flushed to the sink in one call.
//
// Each descriptor is a refcounted byte handle. Within one batch the handles
// either all view the same shared chunk buffer (zero copy, records closed
// inside one chunk) or each own their stitched straddle buffer; either way the
// backing memory lives until the last in-flight clone is dropped by the
// delivery callback.

use bytes::Bytes;

/// Append-only array of record payloads awaiting one produce call.
#[derive(Debug, Default)]
pub struct MessageBatch {
    records: Vec<Bytes>,
}

impl MessageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Bytes) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Bytes] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Bytes> {
        self.records
    }
}
