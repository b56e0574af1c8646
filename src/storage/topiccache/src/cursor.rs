// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A cursor packs an `(index, value)` pair into one `i64`. The index is the
//! record number within an index file and the value is usually the log
//! position that record points at. Callers should treat a cursor as opaque
//! and use the functions here rather than doing arithmetic on it.

/// The search ran off the end of this segment and should continue in the
/// next one.
pub const NEXT_SEGMENT_VALUE: i32 = i32::MIN;

/// The search ran off the end of a segment that is still being appended to,
/// so the same cursor may find a match later.
pub const RETRY_SEGMENT_VALUE: i32 = i32::MIN + 1;

/// Packs `index` and `value` into a cursor. The value is stored as its raw
/// 32 bits so a negative value never leaks into the index half.
#[inline]
pub const fn encode(index: i32, value: i32) -> i64 {
    ((index as i64) << 32) | (value as u32 as i64)
}

#[inline]
pub const fn index(cursor: i64) -> i32 {
    (cursor >> 32) as i32
}

#[inline]
pub const fn value(cursor: i64) -> i32 {
    cursor as i32
}

/// Advances the cursor to the following index, keeping its value.
#[inline]
pub const fn next_index(cursor: i64) -> i64 {
    encode(index(cursor).wrapping_add(1), value(cursor))
}

/// Moves the cursor to the preceding index, keeping its value.
#[inline]
pub const fn previous_index(cursor: i64) -> i64 {
    encode(index(cursor).wrapping_sub(1), value(cursor))
}

/// Returns true if the cursor's value is a miss marker rather than a match.
#[inline]
pub const fn is_miss(cursor: i64) -> bool {
    let value = value(cursor);
    value == NEXT_SEGMENT_VALUE || value == RETRY_SEGMENT_VALUE
}

#[inline]
pub const fn is_next_segment(cursor: i64) -> bool {
    value(cursor) == NEXT_SEGMENT_VALUE
}

#[inline]
pub const fn is_retry(cursor: i64) -> bool {
    value(cursor) == RETRY_SEGMENT_VALUE
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boundaries() {
        let samples = [i32::MIN, i32::MIN + 1, -1, 0, 1, i32::MAX - 1, i32::MAX];
        for i in samples {
            for v in samples {
                let cursor = encode(i, v);
                assert_eq!(index(cursor), i, "index of ({i}, {v})");
                assert_eq!(value(cursor), v, "value of ({i}, {v})");
            }
        }
    }

    #[test]
    fn negative_value_keeps_index() {
        assert_eq!(index(encode(0, -1)), 0);
        assert_eq!(index(encode(5, NEXT_SEGMENT_VALUE)), 5);
        assert_eq!(value(encode(-1, 7)), 7);
    }

    #[test]
    fn markers() {
        assert!(is_next_segment(encode(3, NEXT_SEGMENT_VALUE)));
        assert!(is_retry(encode(3, RETRY_SEGMENT_VALUE)));
        assert!(is_miss(encode(-1, NEXT_SEGMENT_VALUE)));
        assert!(!is_miss(encode(0, 0)));
        assert!(!is_miss(encode(0, -1)));
    }

    #[test]
    fn step() {
        let cursor = encode(4, 100);
        assert_eq!(next_index(cursor), encode(5, 100));
        assert_eq!(previous_index(cursor), encode(3, 100));
        assert_eq!(index(previous_index(encode(0, 1))), -1);
    }

    proptest! {
        #[test]
        fn round_trip(i in any::<i32>(), v in any::<i32>()) {
            let cursor = encode(i, v);
            prop_assert_eq!(index(cursor), i);
            prop_assert_eq!(value(cursor), v);
        }
    }
}
