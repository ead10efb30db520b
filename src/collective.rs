use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::AccelErr;

/// Aggregation ops supported by mesh reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

impl ReduceOp {
    /// Parses an op name, case-insensitively.
    ///
    /// # Errors
    /// Returns `AccelErr::InvalidReduceOp` for anything other than
    /// `sum`, `mean` or `avg`.
    pub fn parse(name: &str) -> Result<Self, AccelErr> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Ok(ReduceOp::Sum),
            "mean" | "avg" => Ok(ReduceOp::Mean),
            _ => Err(AccelErr::InvalidReduceOp(name.to_string())),
        }
    }
}

/// The all-participant exchange every collective is built on.
///
/// Every rank deposits one `f32` payload per round and leaves with the
/// full set of payloads. A round completes only once all `world_size`
/// ranks have both deposited and collected, which gives the blocking
/// all-or-nothing semantics collectives require: a rank that never calls
/// in leaves the others waiting forever. There are no timeouts.
struct MeshState {
    slots: Vec<Option<Vec<f32>>>,
    deposited: usize,
    collected: usize,
}

/// Shared rendezvous state for one group of cooperating workers.
///
/// Created by the spawn strategy right before workers start and dropped
/// when they rejoin; every worker holds a `MeshHandle` onto it.
pub struct Mesh {
    world: usize,
    state: Mutex<MeshState>,
    arrived: Condvar,
}

impl Mesh {
    /// Creates a mesh for `world_size` cooperating ranks.
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world: world_size,
            state: Mutex::new(MeshState {
                slots: vec![None; world_size],
                deposited: 0,
                collected: 0,
            }),
            arrived: Condvar::new(),
        })
    }

    /// Returns the number of participating ranks.
    pub fn world_size(&self) -> usize {
        self.world
    }

    /// Creates the per-rank handle workers use to call collectives.
    ///
    /// # Panics
    /// Panics if `rank` is outside the mesh.
    pub fn handle(self: &Arc<Self>, rank: usize) -> MeshHandle {
        assert!(rank < self.world, "rank {rank} outside world {}", self.world);
        MeshHandle {
            mesh: Arc::clone(self),
            rank,
        }
    }

    fn exchange(&self, rank: usize, data: Vec<f32>) -> Vec<Vec<f32>> {
        let mut state = self.state.lock();

        // A fast rank re-entering before the previous round fully drained
        // waits until its slot frees up.
        while state.slots[rank].is_some() {
            self.arrived.wait(&mut state);
        }

        state.slots[rank] = Some(data);
        state.deposited += 1;
        if state.deposited == self.world {
            self.arrived.notify_all();
        }
        while state.deposited < self.world {
            self.arrived.wait(&mut state);
        }

        let round: Vec<Vec<f32>> = state
            .slots
            .iter()
            .map(|slot| slot.clone().expect("all ranks deposited"))
            .collect();

        state.collected += 1;
        if state.collected == self.world {
            for slot in &mut state.slots {
                *slot = None;
            }
            state.deposited = 0;
            state.collected = 0;
            self.arrived.notify_all();
        }

        round
    }
}

/// One rank's view of the mesh.
#[derive(Clone)]
pub struct MeshHandle {
    mesh: Arc<Mesh>,
    rank: usize,
}

impl MeshHandle {
    /// Returns this participant's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the number of participating ranks.
    pub fn world_size(&self) -> usize {
        self.mesh.world_size()
    }

    /// Blocks until every rank has arrived at the named rendezvous point.
    pub fn barrier(&self, name: &str) {
        debug!(rank = self.rank, name = name; "entering barrier");
        self.mesh.exchange(self.rank, Vec::new());
    }

    /// Gathers every rank's payload, ordered by rank.
    ///
    /// All ranks must contribute equally shaped payloads.
    pub fn all_gather(&self, data: &[f32]) -> Vec<Vec<f32>> {
        self.mesh.exchange(self.rank, data.to_vec())
    }

    /// Element-wise sum of every rank's payload.
    pub fn sum_reduce(&self, data: &[f32]) -> Vec<f32> {
        let round = self.mesh.exchange(self.rank, data.to_vec());
        let mut acc = vec![0.0; data.len()];
        for contribution in round {
            for (sum, value) in acc.iter_mut().zip(contribution) {
                *sum += value;
            }
        }
        acc
    }

    /// Transmits `payload` from `src` to every rank.
    ///
    /// The mesh moves `f32` lanes only, so the bytes ride one per lane
    /// through the gather; non-source contributions are empty.
    pub fn broadcast_bytes(&self, payload: &[u8], src: usize) -> Vec<u8> {
        let lanes: Vec<f32> = if self.rank == src {
            payload.iter().map(|byte| f32::from(*byte)).collect()
        } else {
            Vec::new()
        };

        let mut round = self.mesh.exchange(self.rank, lanes);
        round.swap_remove(src).iter().map(|lane| *lane as u8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn exchange_stays_consistent_across_rounds() {
        const WORLD: usize = 3;
        const ROUNDS: usize = 5;

        let mesh = Mesh::new(WORLD);
        thread::scope(|s| {
            for rank in 0..WORLD {
                let handle = mesh.handle(rank);
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        let value = (rank * ROUNDS + round) as f32;
                        let gathered = handle.all_gather(&[value]);
                        for (peer, payload) in gathered.iter().enumerate() {
                            assert_eq!(payload, &[(peer * ROUNDS + round) as f32]);
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn sum_reduce_adds_across_ranks() {
        const WORLD: usize = 4;

        let mesh = Mesh::new(WORLD);
        thread::scope(|s| {
            for rank in 0..WORLD {
                let handle = mesh.handle(rank);
                s.spawn(move || {
                    let summed = handle.sum_reduce(&[1.0, 2.0]);
                    assert_eq!(summed, vec![4.0, 8.0]);
                });
            }
        });
    }

    #[test]
    fn broadcast_bytes_returns_source_payload_everywhere() {
        const WORLD: usize = 3;
        const SRC: usize = 1;

        let mesh = Mesh::new(WORLD);
        let payload = b"weights-ready".to_vec();
        thread::scope(|s| {
            for rank in 0..WORLD {
                let handle = mesh.handle(rank);
                let payload = payload.clone();
                s.spawn(move || {
                    let sent = if rank == SRC { payload.clone() } else { Vec::new() };
                    let received = handle.broadcast_bytes(&sent, SRC);
                    assert_eq!(received, payload);
                });
            }
        });
    }
}
