//! Organisms: a bytecode genotype, its rendered phenotype, and lineage
//! metadata, shared across the population map behind `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::opcode::{Opcode, MUTABLE_NO_OPERAND, MUTABLE_WITH_OPERAND};
use crate::vm::{BytecodeVm, Image};

/// Process-wide id allocator. Ids are assigned once and never reused.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reserves every id up to and including `id`, so organisms restored from a
/// checkpoint can never collide with future births.
fn reserve_id(id: u64) {
    NEXT_ID.fetch_max(id.saturating_add(1), Ordering::Relaxed);
}

/// Snapshot of an organism's metadata, safe to hand across threads.
#[derive(Debug, Clone)]
pub struct OrganismStats {
    pub id: u64,
    pub generation: u64,
    pub parent_id: u64,
    pub fitness_score: f64,
    pub birth_time: Instant,
    pub last_replication: Instant,
    pub replication_count: u32,
    pub mutation_count: u32,
}

/// Checkpoint record for one organism.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrganismRecord {
    pub id: u64,
    pub generation: u64,
    pub parent_id: u64,
    pub fitness_score: f64,
    pub bytecode: Vec<u8>,
}

#[derive(Debug)]
struct OrganismInner {
    generation: u64,
    parent_id: u64,
    fitness_score: f64,
    birth_time: Instant,
    last_replication: Instant,
    replication_count: u32,
    mutation_count: u32,
    bytecode: Vec<u8>,
    phenotype: Image,
}

/// A single organism. The id is immutable; everything else sits behind the
/// organism's own lock so fitness can be assigned without the environment
/// lock held.
#[derive(Debug)]
pub struct Organism {
    id: u64,
    inner: Mutex<OrganismInner>,
}

impl Organism {
    /// Creates an organism from existing bytecode, rendering its phenotype
    /// immediately.
    #[must_use]
    pub fn new(bytecode: Vec<u8>, vm: &mut BytecodeVm, parent_id: u64) -> Self {
        let phenotype = vm.execute(&bytecode);
        let now = Instant::now();
        Self {
            id: allocate_id(),
            inner: Mutex::new(OrganismInner {
                generation: if parent_id == 0 { 0 } else { 1 },
                parent_id,
                fitness_score: 0.0,
                birth_time: now,
                last_replication: now,
                replication_count: 0,
                mutation_count: 0,
                bytecode,
                phenotype,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, OrganismInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner().generation
    }

    #[must_use]
    pub fn parent_id(&self) -> u64 {
        self.inner().parent_id
    }

    #[must_use]
    pub fn fitness(&self) -> f64 {
        self.inner().fitness_score
    }

    pub fn set_fitness(&self, score: f64) {
        self.inner().fitness_score = score;
    }

    /// Copy of the genotype.
    #[must_use]
    pub fn bytecode(&self) -> Vec<u8> {
        self.inner().bytecode.clone()
    }

    /// Copy of the cached phenotype rendered at construction.
    #[must_use]
    pub fn phenotype(&self) -> Image {
        self.inner().phenotype.clone()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.inner().birth_time.elapsed()
    }

    #[must_use]
    pub fn stats(&self) -> OrganismStats {
        let inner = self.inner();
        OrganismStats {
            id: self.id,
            generation: inner.generation,
            parent_id: inner.parent_id,
            fitness_score: inner.fitness_score,
            birth_time: inner.birth_time,
            last_replication: inner.last_replication,
            replication_count: inner.replication_count,
            mutation_count: inner.mutation_count,
        }
    }

    /// Asexual reproduction: copy the genotype, mutate, re-render. The
    /// child's generation is the parent's plus one, and the parent's
    /// replication bookkeeping is updated.
    #[must_use]
    pub fn replicate(&self, vm: &mut BytecodeVm, mutation_rate: f64, max_mutations: u32) -> Self {
        let (mut bytecode, generation) = {
            let mut inner = self.inner();
            inner.replication_count += 1;
            inner.last_replication = Instant::now();
            (inner.bytecode.clone(), inner.generation + 1)
        };
        let mutations = mutate_bytecode(&mut bytecode, mutation_rate, max_mutations);
        let child = Self::new(bytecode, vm, self.id);
        {
            let mut inner = child.inner();
            inner.generation = generation;
            inner.mutation_count = mutations;
        }
        child
    }

    /// Sexual reproduction by structure-aware single-point crossover, then
    /// mutation and re-render. Returns `None` when either parent carries an
    /// empty genotype.
    #[must_use]
    pub fn reproduce_with(
        &self,
        other: &Organism,
        vm: &mut BytecodeVm,
        mutation_rate: f64,
        max_mutations: u32,
    ) -> Option<Self> {
        let bytecode_a = self.bytecode();
        let bytecode_b = other.bytecode();
        if bytecode_a.is_empty() || bytecode_b.is_empty() {
            return None;
        }
        let generation = {
            let mut inner = self.inner();
            inner.replication_count += 1;
            inner.last_replication = Instant::now();
            inner.generation + 1
        };
        let mut child_code = crossover(&bytecode_a, &bytecode_b, &mut rand::rng());
        let mutations = mutate_bytecode(&mut child_code, mutation_rate, max_mutations);
        let child = Self::new(child_code, vm, self.id);
        {
            let mut inner = child.inner();
            inner.generation = generation;
            inner.mutation_count = mutations;
        }
        Some(child)
    }

    /// Checkpoint record of this organism.
    #[must_use]
    pub fn serialize(&self) -> OrganismRecord {
        let inner = self.inner();
        OrganismRecord {
            id: self.id,
            generation: inner.generation,
            parent_id: inner.parent_id,
            fitness_score: inner.fitness_score,
            bytecode: inner.bytecode.clone(),
        }
    }

    /// Restores an organism from a checkpoint record, re-rendering the
    /// phenotype and reserving the restored id.
    #[must_use]
    pub fn deserialize(record: &OrganismRecord, vm: &mut BytecodeVm) -> Self {
        reserve_id(record.id);
        let phenotype = vm.execute(&record.bytecode);
        let now = Instant::now();
        Self {
            id: record.id,
            inner: Mutex::new(OrganismInner {
                generation: record.generation,
                parent_id: record.parent_id,
                fitness_score: record.fitness_score,
                birth_time: now,
                last_replication: now,
                replication_count: 0,
                mutation_count: 0,
                bytecode: record.bytecode.clone(),
                phenotype,
            }),
        }
    }
}

impl Clone for Organism {
    /// A copy keeps the genotype, phenotype, fitness, and generation, but is
    /// assigned a fresh id and records the source organism as its parent.
    fn clone(&self) -> Self {
        let inner = self.inner();
        let now = Instant::now();
        Self {
            id: allocate_id(),
            inner: Mutex::new(OrganismInner {
                generation: inner.generation,
                parent_id: self.id,
                fitness_score: inner.fitness_score,
                birth_time: now,
                last_replication: now,
                replication_count: 0,
                mutation_count: inner.mutation_count,
                bytecode: inner.bytecode.clone(),
                phenotype: inner.phenotype.clone(),
            }),
        }
    }
}

/// Byte indices immediately following each drawing instruction, preceded by
/// the mandatory index 0. These are the semantically meaningful crossover
/// cut points.
#[must_use]
pub fn unit_boundaries(bytecode: &[u8]) -> Vec<usize> {
    let mut boundaries = vec![0];
    let mut i = 0;
    while i < bytecode.len() {
        match Opcode::from_byte(bytecode[i]) {
            Some(op) => {
                let next = i + 1 + op.operand_width().min(bytecode.len() - i - 1);
                if op.is_drawing() {
                    boundaries.push(next);
                }
                i = next;
            }
            None => i += 1,
        }
    }
    boundaries
}

/// Structure-aware single-point crossover. When both parents expose an
/// internal unit boundary, a cut is chosen from each parent's boundary list;
/// otherwise this falls back to a classic cut at a shared random index.
pub fn crossover<R: Rng>(parent_a: &[u8], parent_b: &[u8], rng: &mut R) -> Vec<u8> {
    let boundaries_a = unit_boundaries(parent_a);
    let boundaries_b = unit_boundaries(parent_b);
    let internal =
        |bounds: &[usize], len: usize| bounds.iter().any(|&b| b > 0 && b < len);

    if internal(&boundaries_a, parent_a.len()) && internal(&boundaries_b, parent_b.len()) {
        let cut_a = boundaries_a[rng.random_range(0..boundaries_a.len())];
        let cut_b = boundaries_b[rng.random_range(0..boundaries_b.len())];
        let mut child = Vec::with_capacity(cut_a + parent_b.len() - cut_b.min(parent_b.len()));
        child.extend_from_slice(&parent_a[..cut_a.min(parent_a.len())]);
        child.extend_from_slice(&parent_b[cut_b.min(parent_b.len())..]);
        child
    } else {
        let cut = rng.random_range(0..=parent_a.len().min(parent_b.len()));
        let mut child = Vec::with_capacity(cut + parent_b.len() - cut);
        child.extend_from_slice(&parent_a[..cut]);
        child.extend_from_slice(&parent_b[cut..]);
        child
    }
}

/// Mutates `bytecode` in place using the thread-local RNG.
pub fn mutate_bytecode(bytecode: &mut [u8], mutation_rate: f64, max_mutations: u32) -> u32 {
    mutate_bytecode_with(bytecode, mutation_rate, max_mutations, &mut rand::rng())
}

/// Mutation walks the program instruction by instruction so opcodes and
/// operands are never conflated, and stops before the last byte so the
/// terminal HALT survives. Jump targets are constrained to land strictly
/// after the current instruction and before the terminal HALT; when no such
/// forward target fits in a byte, the instruction is neutralized to NOP.
/// Opcode replacements keep the operand width of the instruction they
/// replace, so the instruction framing of the rest of the program is
/// untouched.
pub fn mutate_bytecode_with<R: Rng>(
    bytecode: &mut [u8],
    mutation_rate: f64,
    max_mutations: u32,
    rng: &mut R,
) -> u32 {
    if bytecode.len() < 2 || mutation_rate <= 0.0 || max_mutations == 0 {
        return 0;
    }

    let mut mutations = 0;
    let mut i = 0;
    while i + 1 < bytecode.len() && mutations < max_mutations {
        let Some(op) = Opcode::from_byte(bytecode[i]) else {
            i += 1;
            continue;
        };
        let width = op.operand_width();
        if i + width >= bytecode.len() {
            i += 1;
            continue;
        }

        if rng.random::<f64>() < mutation_rate {
            mutations += 1;
            let mutate_operand = width > 0 && rng.random::<f64>() < 0.5;
            if mutate_operand {
                if matches!(op, Opcode::Jmp | Opcode::Jz | Opcode::Jnz | Opcode::Call) {
                    let min_target = i + 1 + width;
                    let max_target = 255.min(bytecode.len() - 2);
                    if min_target <= max_target {
                        bytecode[i + 1] = rng.random_range(min_target..=max_target) as u8;
                    } else {
                        // No legal forward target fits: neutralize the whole
                        // instruction, operand byte included, so the stale
                        // operand is not re-parsed as an opcode.
                        bytecode[i] = Opcode::Nop.byte();
                        bytecode[i + 1] = Opcode::Nop.byte();
                    }
                } else {
                    bytecode[i + 1] = rng.random();
                }
            } else {
                let pool = if width == 0 {
                    MUTABLE_NO_OPERAND
                } else {
                    MUTABLE_WITH_OPERAND
                };
                bytecode[i] = pool[rng.random_range(0..pool.len())].byte();
            }
        }

        i += 1 + width;
    }
    mutations
}
