// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use thiserror::Error;

pub type CacheResult<T = ()> = Result<T, CacheError>;

/// Possible errors returned by the topic cache. None of these are retried
/// inside the cache; retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{store} capacity exceeded: {required} bytes required, {available} available")]
    CapacityExceeded {
        store: &'static str,
        required: usize,
        available: usize,
    },
    #[error("message of {size} bytes exceeds max message bytes of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("offset {offset} does not advance past {progress}")]
    OffsetRegression { offset: i64, progress: i64 },
    #[error("partition has no head segment")]
    NoHead,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl CacheError {
    pub fn capacity(store: &'static str, required: usize, available: usize) -> Self {
        crate::metrics::CAPACITY_EXCEEDED.increment();
        CacheError::CapacityExceeded {
            store,
            required,
            available,
        }
    }

    /// Returns true if the error can be resolved by rotating to a fresh head
    /// segment and trying the write again.
    pub fn is_capacity(&self) -> bool {
        matches!(self, CacheError::CapacityExceeded { .. })
    }
}

impl From<std::io::Error> for CacheError {
    fn from(other: std::io::Error) -> Self {
        CacheError::Io(other)
    }
}
