use std::{collections::BTreeMap, num::NonZeroUsize, thread};

use training_backends::{AccelErr, Device, Mesh, RankInfo, SpawnConfig, Tensor, WorkerContext};

const WORLD: usize = 4;

fn contexts(seed: Option<u64>) -> Vec<WorkerContext> {
    let cfg = SpawnConfig::new(NonZeroUsize::new(WORLD).unwrap());
    let mesh = Mesh::new(WORLD);
    (0..WORLD)
        .map(|rank| {
            WorkerContext::for_worker(RankInfo::from_topology(rank, &cfg), seed, mesh.handle(rank))
        })
        .collect()
}

#[test]
fn sum_reduce_multiplies_a_uniform_value_by_world_size() {
    let cxs = contexts(None);
    thread::scope(|s| {
        for cx in &cxs {
            s.spawn(move || {
                let reduced = cx.reduce(Tensor::scalar(2.5), "sum").unwrap();
                assert_eq!(reduced.item(), Some(2.5 * WORLD as f32));
            });
        }
    });
}

#[test]
fn mean_and_avg_return_the_uniform_value() {
    for op in ["mean", "avg", "Mean", "AVG"] {
        let cxs = contexts(None);
        thread::scope(|s| {
            for cx in &cxs {
                s.spawn(move || {
                    let reduced = cx.reduce(Tensor::scalar(3.0), op).unwrap();
                    assert_eq!(reduced.item(), Some(3.0));
                });
            }
        });
    }
}

#[test]
fn invalid_reduce_op_fails_before_any_collective_call() {
    // Only one rank calls in; an eager collective would hang here.
    let cxs = contexts(None);
    let err = cxs[0].reduce(Tensor::scalar(1.0), "max").unwrap_err();
    assert!(matches!(err, AccelErr::InvalidReduceOp(op) if op == "max"));
}

#[test]
fn decision_reduction_requires_unanimity() {
    let cxs = contexts(None);
    thread::scope(|s| {
        for cx in &cxs {
            s.spawn(move || {
                assert!(cx.reduce_decision(true));
            });
        }
    });

    // A single dissenting rank flips the decision everywhere.
    let cxs = contexts(None);
    thread::scope(|s| {
        for (rank, cx) in cxs.iter().enumerate() {
            s.spawn(move || {
                let mine = rank != 2;
                assert!(!cx.reduce_decision(mine));
            });
        }
    });
}

#[test]
fn broadcast_round_trips_structured_values() {
    const SRC: usize = 2;

    let mut payload = BTreeMap::new();
    payload.insert("best_epoch".to_string(), 12_u64);
    payload.insert("patience".to_string(), 3_u64);

    let cxs = contexts(None);
    thread::scope(|s| {
        for (rank, cx) in cxs.iter().enumerate() {
            let payload = payload.clone();
            s.spawn(move || {
                let mine = if rank == SRC {
                    payload.clone()
                } else {
                    BTreeMap::new()
                };
                let received: BTreeMap<String, u64> = cx.broadcast(&mine, SRC).unwrap();
                assert_eq!(received, payload);
            });
        }
    });
}

#[test]
fn all_gather_stacks_in_rank_order() {
    let cxs = contexts(None);
    thread::scope(|s| {
        for (rank, cx) in cxs.iter().enumerate() {
            s.spawn(move || {
                let mine = Tensor::new(vec![rank as f32, 10.0 + rank as f32], Device::Mesh(rank));
                let gathered = cx.all_gather(&mine, false);
                let expected: Vec<f32> = (0..WORLD)
                    .flat_map(|r| [r as f32, 10.0 + r as f32])
                    .collect();
                assert_eq!(gathered.data(), expected.as_slice());
                assert_eq!(gathered.device(), mine.device());
            });
        }
    });
}

#[test]
fn seeded_contexts_produce_identical_rng_streams() {
    use rand::RngCore;

    let cxs = contexts(Some(99));
    let mut draws: Vec<u64> = cxs.iter().map(|cx| cx.rng().next_u64()).collect();
    draws.dedup();
    assert_eq!(draws.len(), 1);
}
