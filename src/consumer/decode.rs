use std::collections::HashSet;

use bytes::Bytes;

use crate::consumer::ConsumerMessage;
use crate::error::Result;
use crate::protocol::fetch::AbortedTransaction;
use crate::protocol::records::{
    ControlRecordType, RecordBatch, RecordSet, Trailing, decode_record_set,
};
use crate::types::IsolationLevel;

/// Messages extracted from one partition block of a fetch response.
#[derive(Debug, Default)]
pub(crate) struct Fetched {
    pub messages: Vec<ConsumerMessage>,
    /// Where the next fetch starts, when at least one entry was complete.
    pub next_offset: Option<i64>,
    /// Bytes needed to read the first entry, when not even one fit.
    pub overflow: Option<usize>,
}

/// Filters aborted transactional batches under read-committed.
struct AbortedFilter {
    pending: Vec<AbortedTransaction>,
    active: HashSet<i64>,
}

impl AbortedFilter {
    fn new(aborted: &[AbortedTransaction]) -> Self {
        let mut pending = aborted.to_vec();
        // Popped from the back, lowest first offset first.
        pending.sort_by(|a, b| b.first_offset.cmp(&a.first_offset));
        Self {
            pending,
            active: HashSet::new(),
        }
    }

    /// Whether `batch` must be hidden from the application.
    fn skip(&mut self, batch: &RecordBatch) -> bool {
        while let Some(next) = self.pending.last() {
            if next.first_offset > batch.last_offset() {
                break;
            }
            self.active.insert(next.producer_id);
            self.pending.pop();
        }

        if batch.is_control {
            let marker = batch.records.first().map(|r| ControlRecordType::from_key(r.key.as_ref()));
            if marker == Some(ControlRecordType::Abort) {
                self.active.remove(&batch.producer_id);
            }
            return true;
        }
        batch.is_transactional && self.active.contains(&batch.producer_id)
    }
}

/// Decode the record bytes of a fetched partition. Records below
/// `fetch_offset` (from a compressed batch that started earlier) are dropped,
/// and control batches are never delivered.
pub(crate) fn decode_fetched(
    topic: &str,
    partition: i32,
    records: &Bytes,
    fetch_offset: i64,
    isolation: IsolationLevel,
    aborted: &[AbortedTransaction],
) -> Result<Fetched> {
    let decoded = decode_record_set(records)?;
    let mut fetched = Fetched::default();
    let mut filter = match isolation {
        IsolationLevel::ReadCommitted => Some(AbortedFilter::new(aborted)),
        IsolationLevel::ReadUncommitted => None,
    };

    for set in &decoded.sets {
        if let Some(next) = set.next_offset() {
            fetched.next_offset = Some(fetched.next_offset.map_or(next, |n: i64| n.max(next)));
        }
        match set {
            RecordSet::Batch(batch) => {
                let hidden = match filter.as_mut() {
                    Some(filter) => filter.skip(batch),
                    None => batch.is_control,
                };
                if hidden {
                    continue;
                }
                for record in &batch.records {
                    let offset = batch.base_offset + record.offset_delta as i64;
                    if offset < fetch_offset {
                        continue;
                    }
                    let timestamp = if batch.log_append_time {
                        batch.max_timestamp
                    } else {
                        batch.first_timestamp + record.timestamp_delta
                    };
                    fetched.messages.push(ConsumerMessage {
                        topic: topic.to_string(),
                        partition,
                        key: record.key.clone(),
                        value: record.value.clone(),
                        headers: record.headers.clone(),
                        offset,
                        timestamp,
                    });
                }
            }
            RecordSet::Legacy(blocks) => {
                for block in blocks {
                    if block.offset < fetch_offset {
                        continue;
                    }
                    fetched.messages.push(ConsumerMessage {
                        topic: topic.to_string(),
                        partition,
                        key: block.message.key.clone(),
                        value: block.message.value.clone(),
                        headers: Vec::new(),
                        offset: block.offset,
                        timestamp: block.message.timestamp.unwrap_or(-1),
                    });
                }
            }
        }
    }

    if let Trailing::Overflow { needed } = decoded.trailing {
        fetched.overflow = Some(needed);
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RECORD_BATCH_LOG_OVERHEAD;
    use crate::protocol::records::{Compression, Record};
    use bytes::BytesMut;

    fn record(offset_delta: i32, value: &str) -> Record {
        Record {
            attributes: 0,
            timestamp_delta: offset_delta as i64,
            offset_delta,
            key: None,
            value: Some(Bytes::from(value.to_string())),
            headers: Vec::new(),
        }
    }

    fn batch(base_offset: i64, values: &[&str]) -> RecordBatch {
        RecordBatch {
            base_offset,
            first_timestamp: 1_000,
            max_timestamp: 1_000 + values.len() as i64,
            last_offset_delta: values.len() as i32 - 1,
            records: values
                .iter()
                .enumerate()
                .map(|(i, v)| record(i as i32, v))
                .collect(),
            ..Default::default()
        }
    }

    fn transactional(base_offset: i64, producer_id: i64, values: &[&str]) -> RecordBatch {
        RecordBatch {
            is_transactional: true,
            producer_id,
            producer_epoch: 0,
            first_sequence: 0,
            ..batch(base_offset, values)
        }
    }

    fn marker(base_offset: i64, producer_id: i64, kind: ControlRecordType) -> RecordBatch {
        RecordBatch {
            base_offset,
            is_transactional: true,
            is_control: true,
            producer_id,
            producer_epoch: 0,
            last_offset_delta: 0,
            first_timestamp: 1_000,
            max_timestamp: 1_000,
            records: vec![Record {
                key: Some(kind.key()),
                value: Some(Bytes::from_static(&[0, 0, 0, 0, 0, 0])),
                ..record(0, "")
            }],
            ..Default::default()
        }
    }

    fn concat(batches: &[RecordBatch]) -> Bytes {
        let mut buf = BytesMut::new();
        for b in batches {
            buf.extend_from_slice(&b.encode(None).unwrap());
        }
        buf.freeze()
    }

    fn values(fetched: &Fetched) -> Vec<String> {
        fetched
            .messages
            .iter()
            .map(|m| String::from_utf8(m.value.clone().unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_decode_skips_records_below_fetch_offset() {
        let bytes = concat(&[batch(10, &["a", "b", "c"])]);
        let fetched =
            decode_fetched("t", 0, &bytes, 11, IsolationLevel::ReadUncommitted, &[]).unwrap();

        assert_eq!(values(&fetched), vec!["b", "c"]);
        assert_eq!(fetched.messages[0].offset, 11);
        assert_eq!(fetched.messages[0].timestamp, 1_001);
        assert_eq!(fetched.next_offset, Some(13));
        assert_eq!(fetched.overflow, None);
    }

    #[test]
    fn test_decode_log_append_time_uses_max_timestamp() {
        let mut b = batch(0, &["a", "b"]);
        b.log_append_time = true;
        b.max_timestamp = 5_000;
        let fetched = decode_fetched(
            "t",
            0,
            &concat(&[b]),
            0,
            IsolationLevel::ReadUncommitted,
            &[],
        )
        .unwrap();

        assert!(fetched.messages.iter().all(|m| m.timestamp == 5_000));
    }

    #[test]
    fn test_read_committed_hides_aborted_transactions() {
        let bytes = concat(&[
            transactional(0, 7, &["aborted-1", "aborted-2"]),
            transactional(2, 8, &["committed"]),
            marker(3, 7, ControlRecordType::Abort),
            marker(4, 8, ControlRecordType::Commit),
            transactional(5, 7, &["later"]),
        ]);
        let aborted = [AbortedTransaction {
            producer_id: 7,
            first_offset: 0,
        }];

        let committed =
            decode_fetched("t", 0, &bytes, 0, IsolationLevel::ReadCommitted, &aborted).unwrap();
        assert_eq!(values(&committed), vec!["committed", "later"]);
        assert_eq!(committed.next_offset, Some(6));

        let everything =
            decode_fetched("t", 0, &bytes, 0, IsolationLevel::ReadUncommitted, &aborted).unwrap();
        assert_eq!(
            values(&everything),
            vec!["aborted-1", "aborted-2", "committed", "later"]
        );
    }

    #[test]
    fn test_only_control_batches_still_advance_offset() {
        let bytes = concat(&[marker(9, 3, ControlRecordType::Commit)]);
        let fetched =
            decode_fetched("t", 0, &bytes, 9, IsolationLevel::ReadCommitted, &[]).unwrap();

        assert!(fetched.messages.is_empty());
        assert_eq!(fetched.next_offset, Some(10));
    }

    #[test]
    fn test_overflow_reports_needed_bytes() {
        let full = concat(&[batch(0, &["0123456789"; 20])]);
        let cut = full.slice(..full.len() / 2);
        let fetched =
            decode_fetched("t", 0, &cut, 0, IsolationLevel::ReadUncommitted, &[]).unwrap();

        assert!(fetched.messages.is_empty());
        assert_eq!(fetched.overflow, Some(full.len()));
        assert_eq!(fetched.next_offset, None);
    }

    #[test]
    fn test_truncated_header_asks_for_more_bytes() {
        let full = concat(&[batch(0, &["x"])]);
        let fetched = decode_fetched(
            "t",
            0,
            &full.slice(..8),
            0,
            IsolationLevel::ReadUncommitted,
            &[],
        )
        .unwrap();

        assert!(fetched.messages.is_empty());
        assert_eq!(fetched.overflow, Some(RECORD_BATCH_LOG_OVERHEAD));
        assert_eq!(fetched.next_offset, None);
    }

    #[test]
    fn test_compressed_batch_decodes() {
        let mut b = batch(100, &["zipped", "twice"]);
        b.compression = Compression::Gzip;
        let fetched = decode_fetched(
            "t",
            2,
            &concat(&[b]),
            100,
            IsolationLevel::ReadUncommitted,
            &[],
        )
        .unwrap();

        assert_eq!(values(&fetched), vec!["zipped", "twice"]);
        assert!(fetched.messages.iter().all(|m| m.partition == 2));
    }
}
