// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;
use topiccache::*;

use std::sync::Arc;
use std::time::Duration;

fn partition(tempdir: &TempDir, policy: CleanupPolicy) -> Partition {
    let config = TopicConfig {
        cleanup_policy: policy,
        segment_bytes: 64 * 1024 * 1024,
        segment_index_bytes: 8 * 1024 * 1024,
        ..Default::default()
    };
    Partition::new(tempdir.path(), "bench", "bench", 0, Arc::new(config))
        .expect("failed to create partition")
}

fn write_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_entry");
    group.measurement_time(Duration::from_secs(2));

    let value = vec![0u8; 64];
    let keys: Vec<Vec<u8>> = (0..1024).map(|k| format!("key-{k}").into_bytes()).collect();

    for policy in [CleanupPolicy::Delete, CleanupPolicy::Compact] {
        let tempdir = TempDir::new().expect("failed to generate tempdir");
        let partition = partition(&tempdir, policy);
        partition.append(0).expect("failed to append");

        let mut offset = 0;
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{policy}"), |b| {
            b.iter(|| {
                let key = &keys[offset as usize % keys.len()];
                partition
                    .new_head_if_necessary(offset, Some(key.as_slice()), value.len() as i32, 0)
                    .expect("no head");
                let record = Record::new(offset, Some(key.as_slice()), Some(value.as_slice()));
                let result = partition.write_entry(&record, None, 0, DeltaType::None);
                assert!(result.is_ok());
                offset += 1;
            })
        });
    }
}

fn seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("seek");
    group.measurement_time(Duration::from_secs(2));

    let tempdir = TempDir::new().expect("failed to generate tempdir");
    let partition = partition(&tempdir, CleanupPolicy::Delete);
    for base in 0..64 {
        partition.append(base * 100).expect("failed to append");
        for offset in (base * 100)..(base * 100 + 100) {
            partition
                .write_entry(&Record::new(offset, None, Some(b"value")), None, 0, DeltaType::None)
                .expect("failed to write");
        }
    }

    group.throughput(Throughput::Elements(1));
    group.bench_function("seek_not_after", |b| {
        let mut offset = 0;
        b.iter(|| {
            let node = partition.seek_not_after(offset);
            let entry = node.segment().and_then(|s| s.find_entry(offset));
            assert!(entry.is_some());
            offset = (offset + 97) % 6400;
        })
    });
}

criterion_group!(benches, write_entry, seek);
criterion_main!(benches);
