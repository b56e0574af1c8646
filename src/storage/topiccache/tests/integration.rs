// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End to end tests driving the cache the way a kafka binding would: a single
//! writer per partition with concurrent readers and periodic maintenance.

use tempfile::TempDir;
use topiccache::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn config(tempdir: &TempDir) -> Config {
    let toml = format!(
        r#"
        [kafka_cache]
        directory = "{}"
        segment_bytes = 65536
        segment_index_bytes = 4096

        [kafka_cache.topics.items]
        cleanup_policy = "compact"
        min_cleanable_dirty_ratio = 0.01
        "#,
        tempdir.path().display()
    );
    Config::parse(&toml).expect("failed to parse config")
}

// writes `count` records cycling over `keys`, rotating heads as needed
fn produce(partition: &Partition, first: i64, count: i64, keys: &[&[u8]]) {
    for offset in first..first + count {
        let key = keys[offset as usize % keys.len()];
        let value = format!(r#"{{"offset":{offset}}}"#);
        partition
            .new_head_if_necessary(offset, Some(key), value.len() as i32, 0)
            .expect("no head");
        partition
            .write_entry(
                &Record::new(offset, Some(key), Some(value.as_bytes())).timestamp(offset),
                None,
                0,
                DeltaType::JsonPatch,
            )
            .expect("failed to write");
    }
}

// latest value per key, reading from the first segment onwards
fn snapshot(partition: &Partition) -> Vec<(Vec<u8>, i64)> {
    let mut latest = std::collections::BTreeMap::new();
    let mut node = partition.sentinel().next();
    while !node.is_sentinel() {
        if let Some(segment) = node.segment() {
            for entry in segment.entries() {
                if let Some(key) = entry.key() {
                    latest.insert(key.to_vec(), entry.offset());
                }
            }
        }
        node = node.next();
    }
    latest.into_iter().collect()
}

#[test]
fn compaction_keeps_latest_per_key() {
    let tempdir = TempDir::new().expect("failed to generate tempdir");
    let caches = Caches::new(&config(&tempdir));
    let cache = caches.supply("cache");
    let topic = cache.supply_topic("items").expect("failed to create topic");
    assert_eq!(topic.config().cleanup_policy, CleanupPolicy::Compact);

    let partition = topic.supply_partition(0).expect("failed to create partition");
    let keys: [&[u8]; 3] = [b"a", b"b", b"c"];

    partition.append(0).expect("failed to append");
    produce(&partition, 0, 30, &keys);
    partition.append(30).expect("failed to append");
    produce(&partition, 30, 2, &keys);

    let before = snapshot(&partition);

    let report = caches.maintain(common::time::unix_millis());
    assert_eq!(report.cleaned, 1);

    // readers see the same latest values after compaction
    assert_eq!(snapshot(&partition), before);

    let tail = partition.sentinel().next();
    let cleaned = tail.segment().expect("no segment");
    assert_eq!(cleaned.id(), 1);
    assert!(cleaned.entries().all(|e| !e.is_dirty()));

    // keys rewritten in the head leave only `c` behind in the tail
    let offsets: Vec<i64> = cleaned.entries().map(|e| e.offset()).collect();
    assert_eq!(offsets, vec![29]);

    // every head entry refers back to an earlier entry with the same key
    let head = partition.head().segment().expect("no head");
    for entry in head.entries() {
        assert!(entry.ancestor() >= 0);
        assert!(entry.delta().is_some());
    }
}

#[test]
fn delete_policy_expires_old_segments() {
    let tempdir = TempDir::new().expect("failed to generate tempdir");
    let cache = Caches::new(&config(&tempdir)).supply("cache");
    let topic = cache.supply_topic("events").expect("failed to create topic");
    assert_eq!(topic.config().cleanup_policy, CleanupPolicy::Delete);

    let partition = topic.supply_partition(2).expect("failed to create partition");
    for base in [0, 10, 20] {
        partition.append(base).expect("failed to append");
        produce(&partition, base, 10, &[b"k".as_slice()]);
    }

    let now = common::time::unix_millis();
    let retention = topic.config().retention_ms;

    // nothing expires inside the retention window
    let report = topic.maintain(now).expect("maintenance failed");
    assert_eq!(report.deleted, 0);
    assert_eq!(partition.segment_count(), 3);

    // past it the aged head rolls over and every tail expires
    let report = topic.maintain(now + retention + 1).expect("maintenance failed");
    assert_eq!(report.rolled, 1);
    assert_eq!(report.deleted, 3);
    assert_eq!(partition.segment_count(), 1);
    assert_eq!(partition.seek_not_after(15).base_offset(), None);
    assert_eq!(partition.next_offset(-1), 30);
}

#[test]
fn readers_follow_a_writer() {
    let tempdir = TempDir::new().expect("failed to generate tempdir");
    let cache = Caches::new(&config(&tempdir)).supply("cache");
    let topic = cache.supply_topic("stream").expect("failed to create topic");
    let partition = topic.supply_partition(0).expect("failed to create partition");
    partition.append(0).expect("failed to append");

    let done = Arc::new(AtomicBool::new(false));
    let total = 2000;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let partition = partition.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut next = 0;
                while next < total {
                    let node = partition.seek_not_after(next);
                    if let Some(entry) = node.segment().and_then(|s| s.find_entry(next)) {
                        assert_eq!(entry.offset(), next);
                        let expected = format!(r#"{{"offset":{next}}}"#);
                        assert_eq!(entry.value(), Some(expected.as_bytes()));
                        next += 1;
                    } else if done.load(Ordering::Acquire) && next >= partition.next_offset(0) {
                        break;
                    } else {
                        std::thread::yield_now();
                    }
                }
                next
            })
        })
        .collect();

    let keys: [&[u8]; 2] = [b"x", b"y"];
    produce(&partition, 0, total, &keys);
    done.store(true, Ordering::Release);

    for reader in readers {
        assert_eq!(reader.join().expect("reader panicked"), total);
    }
    assert!(partition.segment_count() > 1);
}
