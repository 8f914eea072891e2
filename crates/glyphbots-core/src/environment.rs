//! The environment owns the population and advances it one generation at a
//! time: evaluate fitness, apply pressures, select, reproduce.
//!
//! Locking follows one rule: the expensive work (VM execution and image
//! analysis) runs with the environment lock released; only the snapshot and
//! the state-modifying phase hold it.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analyzer::{AnalyzerConfig, SymmetryAnalyzer};
use crate::generator::{BytecodeGenerator, DEFAULT_COMPOSITE_CHANCE};
use crate::organism::{Organism, OrganismRecord, OrganismStats};
use crate::vm::{BytecodeVm, VmConfig};

/// Version tag written into every checkpoint.
pub const STATE_VERSION: &str = "ENVIRONMENT_STATE_V4";
/// One prior version is still readable; its RNG state is discarded.
const STATE_VERSION_PREVIOUS: &str = "ENVIRONMENT_STATE_V3";

/// Images whose summed per-channel standard deviation falls below this are
/// treated as blank and scored zero without running the analyzer.
const BLANK_SPREAD_THRESHOLD: f64 = 1.0;

/// Weight floor added to `(1 - fitness)` when choosing predation prey.
const PREDATION_EPSILON: f64 = 0.01;

/// Per-generation probability of a random catastrophe, when enabled.
const CATASTROPHE_CHANCE: f64 = 0.01;

/// Primitive-count range for organisms of the initial population.
const INITIAL_PRIMITIVES: std::ops::RangeInclusive<usize> = 3..=8;

/// Environment configuration. All knobs that shape selection live here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    pub max_population: u32,
    pub initial_population: u32,
    pub min_population: u32,
    /// Byte length of immigrant genomes.
    pub initial_bytecode_size: u32,
    /// Top-N organisms shielded from pressures each generation.
    pub elite_count: u32,
    pub mutation_rate: f64,
    pub max_mutations: u32,
    /// Fraction of the population culled from the bottom of the fitness
    /// ranking each generation.
    pub selection_pressure: f64,
    /// Multiplier on `max_population` above which resource scarcity culls.
    pub resource_abundance: f64,
    /// Probability that an offspring slot is filled by a fresh random
    /// organism instead of a crossover child.
    pub immigration_chance: f64,
    /// Pacing floor for the engine worker; 0 leaves generations unpaced.
    pub generation_time_ms: u64,
    pub enable_aging: bool,
    pub max_age_ms: u64,
    pub enable_competition: bool,
    pub competition_intensity: f64,
    pub enable_cooperation: bool,
    pub cooperation_bonus: f64,
    pub enable_predation: bool,
    pub enable_random_catastrophes: bool,
    pub fitness_weight_symmetry: f64,
    pub fitness_weight_variation: f64,
    /// Optional seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            max_population: 1000,
            initial_population: 100,
            min_population: 10,
            initial_bytecode_size: 64,
            elite_count: 2,
            mutation_rate: 0.01,
            max_mutations: 5,
            selection_pressure: 0.3,
            resource_abundance: 1.0,
            immigration_chance: 0.05,
            generation_time_ms: 0,
            enable_aging: true,
            max_age_ms: 30_000,
            enable_competition: true,
            competition_intensity: 0.5,
            enable_cooperation: false,
            cooperation_bonus: 0.1,
            enable_predation: false,
            enable_random_catastrophes: false,
            fitness_weight_symmetry: 0.7,
            fitness_weight_variation: 0.3,
            rng_seed: None,
        }
    }
}

/// Aggregate population statistics, recomputed at every generation commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentStats {
    pub generation: u64,
    pub population_size: u32,
    pub births_this_gen: u32,
    pub deaths_this_gen: u32,
    pub avg_fitness: f64,
    pub min_fitness: f64,
    pub max_fitness: f64,
    pub fitness_variance: f64,
    pub total_organisms_created: u64,
    pub total_organisms_died: u64,
}

/// The three config records behind one handle, for clients and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullConfig {
    pub environment: EnvironmentConfig,
    pub vm: VmConfig,
    pub analyzer: AnalyzerConfig,
}

/// Failures crossing the environment boundary.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("checkpoint i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unsupported checkpoint version: {0:?}")]
    UnsupportedVersion(String),
}

/// On-disk checkpoint document. Writers emit [`STATE_VERSION`]; readers also
/// accept the immediately preceding version.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    version: String,
    config: EnvironmentConfig,
    vm_config: VmConfig,
    analyzer_config: AnalyzerConfig,
    stats: EnvironmentStats,
    rng_state: String,
    organisms: Vec<OrganismRecord>,
}

struct EnvInner {
    config: EnvironmentConfig,
    vm_config: VmConfig,
    analyzer: SymmetryAnalyzer,
    population: HashMap<u64, Arc<Organism>>,
    stats: EnvironmentStats,
    rng: ChaCha8Rng,
    vm: BytecodeVm,
    last_update: Instant,
}

/// Thread-safe owner of the population. All mutation goes through the single
/// internal lock; organisms themselves are individually lockable so fitness
/// assignment can happen while this lock is released.
pub struct Environment {
    inner: Mutex<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Environment")
            .field("generation", &inner.stats.generation)
            .field("population", &inner.population.len())
            .finish()
    }
}

impl Environment {
    /// Builds an environment and seeds its initial population. The first
    /// organism always draws a circle in a non-black color so the starting
    /// phenotypes are visibly non-blank.
    #[must_use]
    pub fn new(
        config: EnvironmentConfig,
        vm_config: VmConfig,
        analyzer_config: AnalyzerConfig,
    ) -> Self {
        let mut rng = seeded_rng(config.rng_seed);
        let mut vm = match config.rng_seed {
            Some(seed) => BytecodeVm::with_seed(vm_config.clone(), seed),
            None => BytecodeVm::new(vm_config.clone()),
        };
        let mut generator = match config.rng_seed {
            Some(seed) => BytecodeGenerator::with_seed(
                vm_config.image_width,
                vm_config.image_height,
                DEFAULT_COMPOSITE_CHANCE,
                seed ^ 0x9E37_79B9_7F4A_7C15,
            ),
            None => BytecodeGenerator::new(
                vm_config.image_width,
                vm_config.image_height,
                DEFAULT_COMPOSITE_CHANCE,
            ),
        };

        let mut population = HashMap::with_capacity(config.initial_population as usize);
        let mut stats = EnvironmentStats::default();
        if config.initial_population > 0 {
            let mut seed_code = generator.circle_primitive();
            seed_code.push(crate::opcode::Opcode::Halt.byte());
            let seeded = Organism::new(seed_code, &mut vm, 0);
            population.insert(seeded.id(), Arc::new(seeded));
            stats.total_organisms_created += 1;

            for _ in 1..config.initial_population {
                let count = rng.random_range(INITIAL_PRIMITIVES);
                let bytecode = generator.generate_initial(count);
                let organism = Organism::new(bytecode, &mut vm, 0);
                population.insert(organism.id(), Arc::new(organism));
                stats.total_organisms_created += 1;
            }
        }

        let mut inner = EnvInner {
            config,
            vm_config,
            analyzer: SymmetryAnalyzer::new(analyzer_config),
            population,
            stats,
            rng,
            vm,
            last_update: Instant::now(),
        };
        inner.refresh_population_stats();
        info!(
            population = inner.population.len(),
            "environment initialized"
        );
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnvInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances the population by exactly one generation.
    pub fn update(&self) -> Result<(), EnvironmentError> {
        // Snapshot phase: copy handles, release the lock.
        let (organisms, vm_config, analyzer, w_symmetry, w_variation) = {
            let inner = self.lock();
            (
                inner.population.values().cloned().collect::<Vec<_>>(),
                inner.vm_config.clone(),
                inner.analyzer.clone(),
                inner.config.fitness_weight_symmetry,
                inner.config.fitness_weight_variation,
            )
        };

        // Evaluation phase: per-thread VMs, no environment lock held.
        organisms.par_iter().for_each_init(
            || BytecodeVm::new(vm_config.clone()),
            |vm, organism| {
                let fitness = score_organism(vm, &analyzer, w_symmetry, w_variation, organism);
                organism.set_fitness(fitness);
            },
        );

        // State-modifying phase: all-or-nothing under the lock.
        let mut inner = self.lock();
        inner.stats.births_this_gen = 0;
        inner.stats.deaths_this_gen = 0;

        let elites = inner.extract_elites();
        inner.apply_pressures();
        inner.apply_selection();
        for elite in elites {
            inner.population.insert(elite.id(), elite);
        }
        inner.reproduce();

        inner.stats.generation += 1;
        inner.last_update = Instant::now();
        inner.refresh_population_stats();
        debug!(
            generation = inner.stats.generation,
            population = inner.stats.population_size,
            births = inner.stats.births_this_gen,
            deaths = inner.stats.deaths_this_gen,
            best = inner.stats.max_fitness,
            "generation committed"
        );
        Ok(())
    }

    /// Applies the environmental pressures (scarcity, fitness culling,
    /// catastrophe, predation) outside a full generation. Exposed for tests
    /// and diagnostics; `update` calls the same code path.
    pub fn apply_environmental_pressures(&self) {
        self.lock().apply_pressures();
    }

    /// Scores a single organism: VM render, blank short-circuit, analyzer
    /// fitness blended with a color-variation term.
    #[must_use]
    pub fn evaluate_fitness(&self, organism: &Organism) -> f64 {
        let (vm_config, analyzer, w_symmetry, w_variation) = {
            let inner = self.lock();
            (
                inner.vm_config.clone(),
                inner.analyzer.clone(),
                inner.config.fitness_weight_symmetry,
                inner.config.fitness_weight_variation,
            )
        };
        let mut vm = BytecodeVm::new(vm_config);
        score_organism(&mut vm, &analyzer, w_symmetry, w_variation, organism)
    }

    /// Inserts an externally built organism, refusing once `max_population`
    /// is reached.
    pub fn add_organism(&self, organism: Arc<Organism>) -> bool {
        let mut inner = self.lock();
        if inner.population.len() >= inner.config.max_population as usize {
            return false;
        }
        inner.stats.total_organisms_created += 1;
        inner.population.insert(organism.id(), organism);
        inner.refresh_population_stats();
        true
    }

    /// Removes an organism by id.
    pub fn remove_organism(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let removed = inner.population.remove(&id).is_some();
        if removed {
            inner.stats.total_organisms_died += 1;
            inner.refresh_population_stats();
        }
        removed
    }

    /// Copy of the population map.
    #[must_use]
    pub fn get_population(&self) -> HashMap<u64, Arc<Organism>> {
        self.lock().population.clone()
    }

    #[must_use]
    pub fn get_organism(&self, id: u64) -> Option<Arc<Organism>> {
        self.lock().population.get(&id).cloned()
    }

    /// The `count` fittest organisms, best first.
    #[must_use]
    pub fn get_top_fittest(&self, count: usize) -> Vec<Arc<Organism>> {
        let mut ranked: Vec<Arc<Organism>> = self.lock().population.values().cloned().collect();
        ranked.sort_by_key(|organism| Reverse(OrderedFloat(organism.fitness())));
        ranked.truncate(count);
        ranked
    }

    #[must_use]
    pub fn get_best_organism(&self) -> Option<Arc<Organism>> {
        self.lock()
            .population
            .values()
            .max_by_key(|organism| OrderedFloat(organism.fitness()))
            .cloned()
    }

    #[must_use]
    pub fn get_organism_stats(&self) -> Vec<OrganismStats> {
        self.lock()
            .population
            .values()
            .map(|organism| organism.stats())
            .collect()
    }

    /// Last committed generation's statistics.
    #[must_use]
    pub fn get_stats(&self) -> EnvironmentStats {
        self.lock().stats.clone()
    }

    #[must_use]
    pub fn get_full_config(&self) -> FullConfig {
        let inner = self.lock();
        FullConfig {
            environment: inner.config.clone(),
            vm: inner.vm_config.clone(),
            analyzer: inner.analyzer.config().clone(),
        }
    }

    /// Pacing floor for the engine worker.
    #[must_use]
    pub fn generation_time(&self) -> Duration {
        Duration::from_millis(self.lock().config.generation_time_ms)
    }

    #[must_use]
    pub fn population_size(&self) -> usize {
        self.lock().population.len()
    }

    /// Instant of the last committed generation (or construction/load).
    #[must_use]
    pub fn last_update(&self) -> Instant {
        self.lock().last_update
    }

    /// Drops every organism and resets statistics.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.population.clear();
        inner.stats = EnvironmentStats::default();
    }

    /// Writes a versioned checkpoint of configs, stats, RNG state, and the
    /// full population.
    pub fn save_state(&self, path: &Path) -> Result<(), EnvironmentError> {
        let document = {
            let inner = self.lock();
            CheckpointDocument {
                version: STATE_VERSION.to_string(),
                config: inner.config.clone(),
                vm_config: inner.vm_config.clone(),
                analyzer_config: inner.analyzer.config().clone(),
                stats: inner.stats.clone(),
                rng_state: serde_json::to_string(&inner.rng)?,
                organisms: inner
                    .population
                    .values()
                    .map(|organism| organism.serialize())
                    .collect(),
            }
        };
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &document)?;
        info!(
            path = %path.display(),
            organisms = document.organisms.len(),
            generation = document.stats.generation,
            "checkpoint written"
        );
        Ok(())
    }

    /// Restores a checkpoint, replacing configs, stats, RNG state, and the
    /// population. A missing or corrupt RNG state is recovered by re-seeding;
    /// any other corruption aborts the load and leaves the environment
    /// untouched.
    pub fn load_state(&self, path: &Path) -> Result<(), EnvironmentError> {
        let raw = fs::read_to_string(path)?;
        let document: CheckpointDocument = serde_json::from_str(&raw)?;
        match document.version.as_str() {
            STATE_VERSION | STATE_VERSION_PREVIOUS => {}
            other => return Err(EnvironmentError::UnsupportedVersion(other.to_string())),
        }

        let rng = if document.version == STATE_VERSION && !document.rng_state.is_empty() {
            match serde_json::from_str(&document.rng_state) {
                Ok(rng) => rng,
                Err(err) => {
                    warn!(%err, "checkpoint RNG state unreadable; re-seeding from entropy");
                    seeded_rng(None)
                }
            }
        } else {
            warn!(
                version = %document.version,
                "checkpoint carries no usable RNG state; re-seeding from entropy"
            );
            seeded_rng(None)
        };

        let mut inner = self.lock();
        let mut vm = BytecodeVm::new(document.vm_config.clone());
        inner.population.clear();
        for record in &document.organisms {
            let organism = Organism::deserialize(record, &mut vm);
            inner.population.insert(organism.id(), Arc::new(organism));
        }
        inner.vm = vm;
        inner.config = document.config;
        inner.vm_config = document.vm_config;
        inner.analyzer = SymmetryAnalyzer::new(document.analyzer_config);
        inner.stats = document.stats;
        inner.stats.population_size = inner.population.len() as u32;
        inner.rng = rng;
        inner.last_update = Instant::now();
        info!(
            generation = inner.stats.generation,
            population = inner.stats.population_size,
            "checkpoint restored"
        );
        Ok(())
    }
}

impl EnvInner {
    /// Removes and returns the top-N organisms so the pressures cannot touch
    /// them; the caller re-inserts them afterwards.
    fn extract_elites(&mut self) -> Vec<Arc<Organism>> {
        let elite_count = self.config.elite_count as usize;
        if elite_count == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<(u64, f64)> = self
            .population
            .iter()
            .map(|(id, organism)| (*id, organism.fitness()))
            .collect();
        ranked.sort_by_key(|(_, fitness)| Reverse(OrderedFloat(*fitness)));
        ranked
            .into_iter()
            .take(elite_count)
            .filter_map(|(id, _)| self.population.remove(&id))
            .collect()
    }

    fn kill(&mut self, id: u64) {
        if self.population.remove(&id).is_some() {
            self.stats.deaths_this_gen += 1;
            self.stats.total_organisms_died += 1;
        }
    }

    fn remove_random(&mut self, count: usize) {
        for _ in 0..count {
            if self.population.is_empty() {
                break;
            }
            let ids: Vec<u64> = self.population.keys().copied().collect();
            let victim = ids[self.rng.random_range(0..ids.len())];
            self.kill(victim);
        }
    }

    /// Pressures, in order: resource scarcity, fitness-ranked culling,
    /// random catastrophe, predation.
    fn apply_pressures(&mut self) {
        // Resource scarcity: uniformly random removal of the excess.
        let capacity =
            (f64::from(self.config.max_population) * self.config.resource_abundance) as usize;
        if self.population.len() > capacity {
            let excess = self.population.len() - capacity;
            debug!(excess, "resource scarcity cull");
            self.remove_random(excess);
        }

        // Fitness-ranked culling driven by selection_pressure.
        if self.config.selection_pressure > 0.0 && !self.population.is_empty() {
            let cull =
                (self.population.len() as f64 * self.config.selection_pressure).floor() as usize;
            if cull > 0 {
                let mut ranked: Vec<(u64, f64)> = self
                    .population
                    .iter()
                    .map(|(id, organism)| (*id, organism.fitness()))
                    .collect();
                ranked.sort_by_key(|(_, fitness)| OrderedFloat(*fitness));
                let victims: Vec<u64> = ranked.into_iter().take(cull).map(|(id, _)| id).collect();
                for id in victims {
                    self.kill(id);
                }
            }
        }

        // Random catastrophe: rare, indiscriminate.
        if self.config.enable_random_catastrophes
            && !self.population.is_empty()
            && self.rng.random::<f64>() < CATASTROPHE_CHANCE
        {
            let victims = (self.population.len() / 10).max(1);
            info!(victims, "random catastrophe strikes");
            self.remove_random(victims);
        }

        // Predation: fitness-weighted, always leaves at least one survivor.
        if self.config.enable_predation && self.population.len() >= 2 {
            let targets = (self.population.len() * 5 / 100)
                .max(1)
                .min(self.population.len() - 1);
            for _ in 0..targets {
                if self.population.len() < 2 {
                    break;
                }
                let weighted: Vec<(u64, f64)> = self
                    .population
                    .iter()
                    .map(|(id, organism)| {
                        (*id, (1.0 - organism.fitness()).max(0.0) + PREDATION_EPSILON)
                    })
                    .collect();
                let total: f64 = weighted.iter().map(|(_, weight)| weight).sum();
                let mut roll = self.rng.random::<f64>() * total;
                let mut victim = weighted[weighted.len() - 1].0;
                for (id, weight) in &weighted {
                    roll -= weight;
                    if roll <= 0.0 {
                        victim = *id;
                        break;
                    }
                }
                self.kill(victim);
            }
        }
    }

    /// Selection helpers: aging, competition, cooperation.
    fn apply_selection(&mut self) {
        if self.config.enable_aging {
            let max_age = Duration::from_millis(self.config.max_age_ms);
            let expired: Vec<u64> = self
                .population
                .iter()
                .filter(|(_, organism)| organism.age() > max_age)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                self.kill(id);
            }
        }

        if self.config.enable_competition {
            let intensity = self.config.competition_intensity;
            let candidates: Vec<(u64, f64)> = self
                .population
                .iter()
                .map(|(id, organism)| (*id, organism.fitness()))
                .collect();
            for (id, fitness) in candidates {
                let death_probability = (1.0 - fitness) * intensity;
                if self.rng.random::<f64>() < death_probability {
                    self.kill(id);
                }
            }
        }

        if self.config.enable_cooperation {
            // Deliberately mutates fitness in place; the reproduction pool
            // sees the boosted values.
            let bonus = self.config.cooperation_bonus;
            for organism in self.population.values() {
                organism.set_fitness(organism.fitness() + bonus);
            }
        }
    }

    /// Grows the population back toward the 1.1× target, drawing parents
    /// pairwise from the fitness-sorted pool and occasionally admitting an
    /// immigrant.
    fn reproduce(&mut self) {
        let current = self.population.len();
        let target = (self.config.max_population as usize)
            .min((self.config.min_population as usize).max((current as f64 * 1.1).ceil() as usize));

        let mut pool: Vec<Arc<Organism>> = self.population.values().cloned().collect();
        pool.sort_by_key(|organism| Reverse(OrderedFloat(organism.fitness())));
        if pool.is_empty() {
            return;
        }

        let iteration_cap = target.saturating_mul(10);
        let mut iterations = 0;
        let mut pair = 0;
        while self.population.len() < target && iterations < iteration_cap {
            iterations += 1;
            let child = if self.rng.random::<f64>() < self.config.immigration_chance {
                let bytecode = self
                    .vm
                    .generate_random_bytecode(self.config.initial_bytecode_size as usize);
                Some(Organism::new(bytecode, &mut self.vm, 0))
            } else {
                let parent_a = &pool[pair % pool.len()];
                let parent_b = &pool[(pair + 1) % pool.len()];
                pair += 1;
                parent_a.reproduce_with(
                    parent_b,
                    &mut self.vm,
                    self.config.mutation_rate,
                    self.config.max_mutations,
                )
            };
            if let Some(child) = child {
                self.stats.births_this_gen += 1;
                self.stats.total_organisms_created += 1;
                self.population.insert(child.id(), Arc::new(child));
            }
        }
    }

    fn refresh_population_stats(&mut self) {
        self.stats.population_size = self.population.len() as u32;
        if self.population.is_empty() {
            self.stats.avg_fitness = 0.0;
            self.stats.min_fitness = 0.0;
            self.stats.max_fitness = 0.0;
            self.stats.fitness_variance = 0.0;
            return;
        }
        let scores: Vec<f64> = self
            .population
            .values()
            .map(|organism| organism.fitness())
            .collect();
        let count = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / count;
        self.stats.avg_fitness = mean;
        self.stats.max_fitness = scores.iter().copied().fold(f64::MIN, f64::max);
        self.stats.min_fitness = scores.iter().copied().fold(f64::MAX, f64::min);
        self.stats.fitness_variance =
            scores.iter().map(|score| (score - mean).powi(2)).sum::<f64>() / count;
    }
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => {
            let seed: u64 = rand::random();
            ChaCha8Rng::seed_from_u64(seed)
        }
    }
}

/// Renders the organism and blends the analyzer fitness with a color
/// variation term. Images that are effectively blank score exactly zero.
fn score_organism(
    vm: &mut BytecodeVm,
    analyzer: &SymmetryAnalyzer,
    w_symmetry: f64,
    w_variation: f64,
    organism: &Organism,
) -> f64 {
    let image = vm.execute(&organism.bytecode());
    let spread: f64 = image.channel_std_dev().iter().sum();
    if spread < BLANK_SPREAD_THRESHOLD {
        return 0.0;
    }
    let result = analyzer.analyze(&image);
    let variation = (spread / 3.0 / 128.0).min(1.0);
    (w_symmetry * result.fitness + w_variation * variation).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> EnvironmentConfig {
        EnvironmentConfig {
            initial_population: 0,
            min_population: 0,
            selection_pressure: 0.0,
            resource_abundance: 10.0,
            immigration_chance: 0.0,
            enable_aging: false,
            enable_competition: false,
            enable_cooperation: false,
            enable_predation: false,
            enable_random_catastrophes: false,
            rng_seed: Some(7),
            ..EnvironmentConfig::default()
        }
    }

    fn small_vm_config() -> VmConfig {
        VmConfig {
            image_width: 32,
            image_height: 32,
            ..VmConfig::default()
        }
    }

    fn environment(config: EnvironmentConfig) -> Environment {
        Environment::new(config, small_vm_config(), AnalyzerConfig::default())
    }

    fn organism_with_fitness(env: &Environment, fitness: f64) -> u64 {
        let mut vm = BytecodeVm::with_seed(small_vm_config(), 5);
        let mut generator = BytecodeGenerator::with_seed(32, 32, 0.0, 11);
        let organism = Organism::new(generator.generate_initial(2), &mut vm, 0);
        organism.set_fitness(fitness);
        let id = organism.id();
        assert!(env.add_organism(Arc::new(organism)));
        id
    }

    #[test]
    fn initial_population_is_seeded_and_visible() {
        let config = EnvironmentConfig {
            initial_population: 5,
            rng_seed: Some(3),
            ..quiet_config()
        };
        let env = environment(config);
        assert_eq!(env.population_size(), 5);
        let any_visible = env
            .get_population()
            .values()
            .any(|organism| organism.phenotype().data().iter().any(|&b| b != 0));
        assert!(any_visible, "seed organism must draw something");
    }

    #[test]
    fn selection_pressure_culls_the_weakest() {
        let config = EnvironmentConfig {
            selection_pressure: 0.5,
            ..quiet_config()
        };
        let env = environment(config);
        let mut weak = Vec::new();
        for _ in 0..5 {
            organism_with_fitness(&env, 0.9);
        }
        for _ in 0..5 {
            weak.push(organism_with_fitness(&env, 0.1));
        }
        env.apply_environmental_pressures();
        assert_eq!(env.population_size(), 5);
        for id in weak {
            assert!(env.get_organism(id).is_none(), "weak {id} should be gone");
        }
    }

    #[test]
    fn resource_scarcity_trims_to_capacity() {
        let config = EnvironmentConfig {
            max_population: 100,
            resource_abundance: 0.04,
            ..quiet_config()
        };
        let env = environment(config);
        for _ in 0..10 {
            organism_with_fitness(&env, 0.5);
        }
        env.apply_environmental_pressures();
        assert_eq!(env.population_size(), 4);
    }

    #[test]
    fn predation_prefers_the_weak_but_spares_one() {
        let config = EnvironmentConfig {
            enable_predation: true,
            ..quiet_config()
        };
        let env = environment(config);
        organism_with_fitness(&env, 0.99);
        organism_with_fitness(&env, 0.0);
        env.apply_environmental_pressures();
        assert_eq!(env.population_size(), 1);
    }

    #[test]
    fn cooperation_boosts_fitness_in_place() {
        let config = EnvironmentConfig {
            enable_cooperation: true,
            cooperation_bonus: 0.2,
            ..quiet_config()
        };
        let env = environment(config);
        let id = organism_with_fitness(&env, 0.5);
        env.lock().apply_selection();
        let organism = env.get_organism(id).expect("still present");
        assert!((organism.fitness() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn update_grows_population_toward_target() {
        let config = EnvironmentConfig {
            initial_population: 10,
            min_population: 1,
            elite_count: 2,
            ..quiet_config()
        };
        let env = environment(config);
        env.update().expect("update");
        let stats = env.get_stats();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.population_size, 11);
        assert_eq!(stats.births_this_gen, 1);
        assert_eq!(stats.deaths_this_gen, 0);
    }

    #[test]
    fn blank_phenotype_scores_zero() {
        let env = environment(quiet_config());
        let mut vm = BytecodeVm::with_seed(small_vm_config(), 5);
        let bytecode = vec![
            crate::opcode::Opcode::Push.byte(),
            0x42,
            crate::opcode::Opcode::Halt.byte(),
        ];
        let organism = Organism::new(bytecode, &mut vm, 0);
        assert_eq!(env.evaluate_fitness(&organism), 0.0);
    }

    #[test]
    fn top_fittest_is_ordered() {
        let env = environment(quiet_config());
        organism_with_fitness(&env, 0.5);
        organism_with_fitness(&env, 0.9);
        organism_with_fitness(&env, 0.2);
        organism_with_fitness(&env, 0.7);
        let top = env.get_top_fittest(3);
        let scores: Vec<f64> = top.iter().map(|organism| organism.fitness()).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn add_organism_respects_max_population() {
        let config = EnvironmentConfig {
            max_population: 2,
            ..quiet_config()
        };
        let env = environment(config);
        organism_with_fitness(&env, 0.1);
        organism_with_fitness(&env, 0.2);
        let mut vm = BytecodeVm::with_seed(small_vm_config(), 5);
        let extra = Organism::new(vec![crate::opcode::Opcode::Halt.byte()], &mut vm, 0);
        assert!(!env.add_organism(Arc::new(extra)));
    }

    #[test]
    fn checkpoint_round_trips_stats_and_population() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");

        let config = EnvironmentConfig {
            initial_population: 10,
            min_population: 1,
            ..quiet_config()
        };
        let env = environment(config);
        env.update().expect("update");
        let saved_stats = env.get_stats();
        env.save_state(&path).expect("save");

        let restored = environment(quiet_config());
        restored.load_state(&path).expect("load");
        let loaded_stats = restored.get_stats();
        assert_eq!(loaded_stats.generation, saved_stats.generation);
        assert_eq!(loaded_stats.population_size, saved_stats.population_size);
        assert_eq!(
            loaded_stats.total_organisms_created,
            saved_stats.total_organisms_created
        );
        assert_eq!(restored.population_size(), 11);
    }

    #[test]
    fn load_rejects_unknown_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        let env = environment(quiet_config());
        env.save_state(&path).expect("save");
        let doctored = fs::read_to_string(&path)
            .expect("read")
            .replace(STATE_VERSION, "ENVIRONMENT_STATE_V1");
        fs::write(&path, doctored).expect("write");
        let result = env.load_state(&path);
        assert!(matches!(
            result,
            Err(EnvironmentError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn load_recovers_from_corrupt_rng_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let env = environment(quiet_config());
        organism_with_fitness(&env, 0.4);
        env.save_state(&path).expect("save");

        let mut document: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        document["rng_state"] = serde_json::Value::String("not an rng".into());
        fs::write(&path, document.to_string()).expect("write");

        let restored = environment(quiet_config());
        restored.load_state(&path).expect("load succeeds regardless");
        assert_eq!(restored.population_size(), 1);
    }

    #[test]
    fn elites_survive_harsh_pressures() {
        let config = EnvironmentConfig {
            selection_pressure: 1.0,
            elite_count: 2,
            ..quiet_config()
        };
        let env = environment(config);
        let best = organism_with_fitness(&env, 0.9);
        let second = organism_with_fitness(&env, 0.8);
        let mut weak = Vec::new();
        for _ in 0..4 {
            weak.push(organism_with_fitness(&env, 0.1));
        }

        // Drive the state-modifying phases directly so the assigned fitness
        // scores stay in force.
        {
            let mut inner = env.lock();
            let elites = inner.extract_elites();
            assert_eq!(elites.len(), 2);
            inner.apply_pressures();
            inner.apply_selection();
            for elite in elites {
                inner.population.insert(elite.id(), elite);
            }
        }

        assert!(env.get_organism(best).is_some());
        assert!(env.get_organism(second).is_some());
        for id in weak {
            assert!(env.get_organism(id).is_none());
        }
    }
}
