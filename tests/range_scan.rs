//! Range-scan scenarios: ring splitting, adjacent-range merging, and
//! result ordering across sub-ranges.

mod common;

use common::*;

use std::sync::atomic::Ordering;

use colonnade::{
    token_of, ConsistencyLevel, RangeReadCommand, ReplicaRequest, TokenRange,
    MIN_TOKEN,
};

/// Seeds ten one-row partitions into each of the eight ring segments.
fn seed_segments(cluster: &TestCluster, n: u8) -> usize {
    let mut per_segment = vec![0usize; n as usize];
    let mut seeded = 0;
    let mut i = 0u64;
    while per_segment.iter().any(|&c| c < 10) && i < 1_000_000 {
        let key = format!("key{}", i);
        i += 1;
        let token = token_of(&key);
        let segment = (0..n).find(|&s| {
            let left = if s == 0 {
                MIN_TOKEN
            } else {
                ring_token(s - 1, n)
            };
            TokenRange::new(left, ring_token(s, n)).contains(token)
        });
        let Some(segment) = segment else { continue };
        if per_segment[segment as usize] >= 10 {
            continue;
        }
        per_segment[segment as usize] += 1;
        seeded += 1;
        cluster.shared.seed_all(
            "ks",
            "cf",
            &key,
            vec![row("r1", vec![cell("c", "v", 1)])],
        );
    }
    assert!(per_segment.iter().all(|&c| c == 10), "seeding exhausted");
    seeded
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_returns_rows_in_sub_range_order() {
    let n = 8u8;
    let cluster = build_cluster(n, 3);
    let seeded = seed_segments(&cluster, n);
    assert_eq!(seeded, 80);

    let command = RangeReadCommand {
        keyspace: "ks".into(),
        table: "cf".into(),
        range: TokenRange::new(MIN_TOKEN, ring_token(n - 1, n)),
        limit: 100,
    };
    let partitions = cluster
        .coordinator
        .range_scan(command, ConsistencyLevel::One)
        .await
        .expect("scan");

    // every seeded row comes back, in ascending ring order
    assert_eq!(partitions.len(), 80);
    let tokens: Vec<_> = partitions.iter().map(|p| token_of(&p.key)).collect();
    let mut sorted = tokens.clone();
    sorted.sort_unstable();
    assert_eq!(tokens, sorted, "results follow sub-range order");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_honors_the_row_limit() {
    let n = 8u8;
    let cluster = build_cluster(n, 3);
    seed_segments(&cluster, n);

    let command = RangeReadCommand {
        keyspace: "ks".into(),
        table: "cf".into(),
        range: TokenRange::new(MIN_TOKEN, ring_token(n - 1, n)),
        limit: 25,
    };
    let partitions = cluster
        .coordinator
        .range_scan(command, ConsistencyLevel::One)
        .await
        .expect("scan");
    let rows: usize = partitions.iter().map(|p| p.rows.len()).sum();
    assert_eq!(rows, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_replication_merges_ranges_into_local_scan() {
    // rf == n: every range shares all replicas, and the snitch blesses
    // merging, so the whole scan collapses into one local request
    let n = 4u8;
    let cluster = build_cluster(n, n);
    cluster.shared.merge_worthwhile.store(true, Ordering::Relaxed);
    seed_some(&cluster, 12);

    let command = RangeReadCommand {
        keyspace: "ks".into(),
        table: "cf".into(),
        range: TokenRange::new(MIN_TOKEN, ring_token(n - 1, n)),
        limit: 100,
    };
    let partitions = cluster
        .coordinator
        .range_scan(command.clone(), ConsistencyLevel::One)
        .await
        .expect("scan");
    assert!(!partitions.is_empty());

    let remote_range_reads = cluster
        .shared
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, r)| matches!(r, ReplicaRequest::RangeRead { .. }))
        .count();
    assert_eq!(remote_range_reads, 0, "merged scan served locally");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_eligibility_counts_only_filtered_replicas() {
    // ring order: 0(dc1), 1(dc1), 2(dc2), 3(dc1); rf=3, local rf=2.
    // adjacent pieces replicate on [0,1,2] and [1,2,3]: their local-DC
    // overlap {1} cannot satisfy LOCAL_QUORUM, while the raw live
    // overlap {1,2} could. Counting the latter would merge the pieces
    // into one that no longer meets the CL, failing a scan that each
    // piece individually satisfies.
    let layout = vec![
        (0u8, "dc1".to_string(), "r1".to_string()),
        (1u8, "dc1".to_string(), "r2".to_string()),
        (2u8, "dc2".to_string(), "r1".to_string()),
        (3u8, "dc1".to_string(), "r3".to_string()),
    ];
    let cluster =
        build_cluster_with(&layout, 3, 2, colonnade::CoordinatorConfig::default());
    cluster.shared.merge_worthwhile.store(true, Ordering::Relaxed);

    // one row in each of the two leading ring segments
    let mut seeded = 0u8;
    let mut have = [false, false];
    let mut i = 0u64;
    while seeded < 2 && i < 1_000_000 {
        let key = format!("key{}", i);
        i += 1;
        let token = token_of(&key);
        let segment = if TokenRange::new(MIN_TOKEN, ring_token(0, 4)).contains(token)
        {
            0
        } else if TokenRange::new(ring_token(0, 4), ring_token(1, 4))
            .contains(token)
        {
            1
        } else {
            continue;
        };
        if have[segment] {
            continue;
        }
        have[segment] = true;
        seeded += 1;
        cluster.shared.seed_all(
            "ks",
            "cf",
            &key,
            vec![row("r1", vec![cell("c", "v", 1)])],
        );
    }
    assert_eq!(seeded, 2, "seeding exhausted");

    let command = RangeReadCommand {
        keyspace: "ks".into(),
        table: "cf".into(),
        range: TokenRange::new(MIN_TOKEN, ring_token(1, 4)),
        limit: 100,
    };
    let partitions = cluster
        .coordinator
        .range_scan(command, ConsistencyLevel::LocalQuorum)
        .await
        .expect("unmerged pieces each satisfy LOCAL_QUORUM");
    let rows: usize = partitions.iter().map(|p| p.rows.len()).sum();
    assert_eq!(rows, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_with_divergent_replicas_reconciles() {
    let n = 4u8;
    let cluster = build_cluster(n, n);
    seed_some(&cluster, 5);

    // one replica holds a newer value for one key
    let newer = mutation("ks", "cf", "skey0", vec![row("r1", vec![cell("c", "newer", 99)])]);
    cluster.shared.replica(2).apply(&newer);

    let command = RangeReadCommand {
        keyspace: "ks".into(),
        table: "cf".into(),
        range: TokenRange::full(),
        limit: 100,
    };
    // CL requiring every replica version forces reconciliation
    let partitions = cluster
        .coordinator
        .range_scan(command, ConsistencyLevel::All)
        .await
        .expect("scan");
    let hit = partitions
        .iter()
        .find(|p| p.key == "skey0")
        .expect("seeded key present");
    assert_eq!(hit.rows[0].cells[0].value, Some("newer".into()));
}

fn seed_some(cluster: &TestCluster, count: usize) {
    for i in 0..count {
        cluster.shared.seed_all(
            "ks",
            "cf",
            &format!("skey{}", i),
            vec![row("r1", vec![cell("c", "v", 1)])],
        );
    }
}
