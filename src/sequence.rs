use num_bigint::BigUint;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("could not parse sequence number '{0}'")]
    Parse(String),
}

/// Identifier of a record within a shard, ordered lexicographically:
/// first by the arbitrary-precision sequence number, then by the
/// sub-sequence number assigned by the producer's aggregation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequencePair {
    pub number: BigUint,
    pub sub: u32,
}

impl SequencePair {
    /// Strict base-10 parse of the host-supplied decimal string. Kinesis
    /// sequence numbers exceed 64 bits, so the number is kept arbitrary
    /// precision; the only operation ever needed on it is ordering.
    pub fn parse(sequence_number: &str, sub_sequence_number: u32) -> Result<Self, SequenceError> {
        let number = BigUint::from_str(sequence_number)
            .map_err(|_| SequenceError::Parse(sequence_number.to_string()))?;
        Ok(Self {
            number,
            sub: sub_sequence_number,
        })
    }
}

impl std::fmt::Display for SequencePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.number, self.sub)
    }
}

/// Largest and smallest sequence pairs observed in the current batch.
/// `largest` survives a flush so a later checkpoint can quote the
/// largest-ever-flushed pair; `smallest` is reset with the batch.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    pub largest: Option<SequencePair>,
    pub smallest: Option<SequencePair>,
}

impl SequenceTracker {
    pub fn observe(&mut self, pair: &SequencePair) {
        match &self.largest {
            Some(largest) if largest >= pair => {}
            _ => self.largest = Some(pair.clone()),
        }
        match &self.smallest {
            Some(smallest) if smallest <= pair => {}
            _ => self.smallest = Some(pair.clone()),
        }
    }

    pub fn reset_smallest(&mut self) {
        self.smallest = None;
    }
}

/// Shared marker for the largest sequence pair enclosed in any batch the
/// sink has acknowledged. The sender advances it on send completion; the
/// record processor reads it when deciding what to checkpoint. The value
/// is monotone non-decreasing for the life of the worker.
#[derive(Debug, Clone, Default)]
pub struct FlushMark {
    inner: Arc<Mutex<Option<SequencePair>>>,
}

impl FlushMark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, pair: &SequencePair) {
        if let Ok(mut mark) = self.inner.lock() {
            match &*mark {
                Some(current) if current >= pair => {}
                _ => *mark = Some(pair.clone()),
            }
        }
    }

    pub fn get(&self) -> Option<SequencePair> {
        self.inner.lock().ok().and_then(|mark| mark.clone())
    }
}
