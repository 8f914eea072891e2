//! Lifecycle driver: a dedicated worker thread advances the environment one
//! generation at a time, with pause/resume gating, periodic checkpointing,
//! and a bounded event history.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::environment::Environment;

/// Well-known checkpoint filename used for automatic resume.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Maximum retained events; the oldest are evicted first.
const HISTORY_CAP: usize = 1000;

/// Minimum sleep between generations so a fast environment cannot busy-loop.
const WORKER_BREATHER: Duration = Duration::from_millis(10);

/// Engine configuration: lifecycle and periodic-task knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub auto_start: bool,
    pub enable_logging: bool,
    pub enable_save_state: bool,
    pub save_interval_generations: u64,
    pub save_directory: PathBuf,
    pub enable_backup: bool,
    pub backup_interval: u64,
    pub enable_metrics: bool,
    pub metrics_interval: u64,
    /// Stop cleanly after this many generations; 0 runs forever.
    pub max_generations: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            enable_logging: true,
            enable_save_state: true,
            save_interval_generations: 100,
            save_directory: PathBuf::from("saves"),
            enable_backup: true,
            backup_interval: 1000,
            enable_metrics: true,
            metrics_interval: 50,
            max_generations: 0,
        }
    }
}

/// Kinds of engine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EngineStarted,
    EngineStopped,
    EnginePaused,
    EngineResumed,
    GenerationCompleted,
    FitnessImproved,
    StateSaved,
    StateLoaded,
    ErrorOccurred,
}

/// One entry of the engine's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub generation: u64,
    pub timestamp: SystemTime,
    pub message: String,
    pub fitness: Option<f64>,
    pub organism_id: Option<u64>,
}

/// Engine statistics snapshot. Population and fitness fields mirror the
/// environment's last committed generation.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_generations: u64,
    pub total_runtime_ms: u64,
    pub generations_per_second: f64,
    pub is_running: bool,
    pub is_paused: bool,
    #[serde(skip)]
    pub start_time: Instant,
    #[serde(skip)]
    pub last_generation_time: Instant,
    pub current_population: u32,
    pub current_best_fitness: f64,
    pub current_avg_fitness: f64,
}

impl Default for EngineStats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            total_generations: 0,
            total_runtime_ms: 0,
            generations_per_second: 0.0,
            is_running: false,
            is_paused: false,
            start_time: now,
            last_generation_time: now,
            current_population: 0,
            current_best_fitness: 0.0,
            current_avg_fitness: 0.0,
        }
    }
}

/// Callback invoked synchronously for every emitted event.
pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync + 'static>;

struct Lifecycle {
    running: bool,
    paused: bool,
    should_stop: bool,
    stats: EngineStats,
    worker: Option<JoinHandle<()>>,
}

struct EngineShared {
    environment: Arc<Environment>,
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
    wake: Condvar,
    history: Mutex<VecDeque<Event>>,
    callback: Mutex<Option<EventCallback>>,
}

/// The evolution engine. All methods are safe to call from any thread.
pub struct EvolutionEngine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for EvolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.shared.lock_lifecycle();
        f.debug_struct("EvolutionEngine")
            .field("running", &lifecycle.running)
            .field("paused", &lifecycle.paused)
            .field("generations", &lifecycle.stats.total_generations)
            .finish()
    }
}

impl EvolutionEngine {
    /// Builds an engine over the environment; honours `auto_start`.
    #[must_use]
    pub fn new(environment: Arc<Environment>, config: EngineConfig) -> Self {
        let auto_start = config.auto_start;
        let engine = Self {
            shared: Arc::new(EngineShared {
                environment,
                config,
                lifecycle: Mutex::new(Lifecycle {
                    running: false,
                    paused: false,
                    should_stop: false,
                    stats: EngineStats::default(),
                    worker: None,
                }),
                wake: Condvar::new(),
                history: Mutex::new(VecDeque::new()),
                callback: Mutex::new(None),
            }),
        };
        if auto_start {
            engine.start();
        }
        engine
    }

    /// Starts the worker. Resumes automatically from the well-known
    /// checkpoint file when one exists. Returns false when already running.
    pub fn start(&self) -> bool {
        if self.shared.lock_lifecycle().running {
            return false;
        }

        let checkpoint = self.shared.config.save_directory.join(CHECKPOINT_FILE);
        if checkpoint.exists() {
            info!(path = %checkpoint.display(), "checkpoint found, attempting resume");
            if self.load_state(&checkpoint) {
                info!(
                    generation = self.shared.lock_lifecycle().stats.total_generations,
                    "resumed from checkpoint"
                );
            } else {
                warn!("failed to load checkpoint, starting a fresh run");
            }
        }

        if self.shared.config.enable_logging {
            self.log_effective_config();
        }

        {
            let mut lifecycle = self.shared.lock_lifecycle();
            if lifecycle.running {
                return false;
            }
            lifecycle.running = true;
            lifecycle.paused = false;
            lifecycle.should_stop = false;
            lifecycle.stats.is_running = true;
            lifecycle.stats.is_paused = false;
            lifecycle.stats.start_time = Instant::now();
            let shared = Arc::clone(&self.shared);
            lifecycle.worker = Some(thread::spawn(move || worker_loop(&shared)));
        }
        self.shared
            .emit(EventKind::EngineStarted, 0, "Evolution engine started", None, None);
        true
    }

    /// Requests a stop and joins the worker. When invoked from the worker
    /// thread itself (via an event callback) only the flag is set; the
    /// worker exits at the next phase boundary and finalizes state itself.
    pub fn stop(&self) -> bool {
        let handle = {
            let mut lifecycle = self.shared.lock_lifecycle();
            if !lifecycle.running && lifecycle.worker.is_none() {
                return false;
            }
            lifecycle.should_stop = true;
            self.shared.wake.notify_all();
            let from_worker = lifecycle
                .worker
                .as_ref()
                .is_some_and(|handle| handle.thread().id() == thread::current().id());
            if from_worker {
                None
            } else {
                lifecycle.worker.take()
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("evolution worker panicked");
            }
        }
        true
    }

    /// Pauses the worker after the in-flight generation.
    pub fn pause(&self) -> bool {
        {
            let mut lifecycle = self.shared.lock_lifecycle();
            if !lifecycle.running || lifecycle.paused {
                return false;
            }
            lifecycle.paused = true;
            lifecycle.stats.is_paused = true;
        }
        let generation = self.shared.lock_lifecycle().stats.total_generations;
        self.shared
            .emit(EventKind::EnginePaused, generation, "Evolution engine paused", None, None);
        true
    }

    /// Wakes a paused worker.
    pub fn resume(&self) -> bool {
        {
            let mut lifecycle = self.shared.lock_lifecycle();
            if !lifecycle.running || !lifecycle.paused {
                return false;
            }
            lifecycle.paused = false;
            lifecycle.stats.is_paused = false;
            self.shared.wake.notify_all();
        }
        let generation = self.shared.lock_lifecycle().stats.total_generations;
        self.shared
            .emit(EventKind::EngineResumed, generation, "Evolution engine resumed", None, None);
        true
    }

    /// Statistics snapshot; reads the environment's pre-computed stats and
    /// never triggers a re-evaluation.
    #[must_use]
    pub fn get_stats(&self) -> EngineStats {
        let env_stats = self.shared.environment.get_stats();
        let lifecycle = self.shared.lock_lifecycle();
        let mut stats = lifecycle.stats.clone();
        if stats.is_running {
            stats.total_runtime_ms = stats.start_time.elapsed().as_millis() as u64;
        }
        if stats.total_runtime_ms > 0 {
            stats.generations_per_second =
                stats.total_generations as f64 / (stats.total_runtime_ms as f64 / 1000.0);
        }
        stats.current_population = env_stats.population_size;
        stats.current_best_fitness = env_stats.max_fitness;
        stats.current_avg_fitness = env_stats.avg_fitness;
        stats
    }

    /// Handle to the owned environment.
    #[must_use]
    pub fn get_environment(&self) -> Arc<Environment> {
        Arc::clone(&self.shared.environment)
    }

    /// Saves a checkpoint to `path`, or to the well-known checkpoint file in
    /// the save directory when no path is given.
    pub fn save_state(&self, path: Option<&Path>) -> bool {
        let target = match path {
            Some(path) => path.to_path_buf(),
            None => self.shared.config.save_directory.join(CHECKPOINT_FILE),
        };
        self.shared.save_to(&target)
    }

    /// Loads a checkpoint. Refused while the engine is running.
    pub fn load_state(&self, path: &Path) -> bool {
        if self.shared.lock_lifecycle().running {
            warn!("cannot load state while the engine is running; stop it first");
            return false;
        }
        match self.shared.environment.load_state(path) {
            Ok(()) => {
                let env_stats = self.shared.environment.get_stats();
                let generation = env_stats.generation;
                {
                    let mut lifecycle = self.shared.lock_lifecycle();
                    lifecycle.stats = EngineStats {
                        total_generations: env_stats.generation,
                        current_population: env_stats.population_size,
                        current_best_fitness: env_stats.max_fitness,
                        current_avg_fitness: env_stats.avg_fitness,
                        ..EngineStats::default()
                    };
                }
                self.shared.emit(
                    EventKind::StateLoaded,
                    generation,
                    &format!("State loaded from {}", path.display()),
                    None,
                    None,
                );
                true
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "state load failed");
                false
            }
        }
    }

    /// Installs the event callback, replacing any previous one.
    pub fn register_event_callback<F>(&self, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        *self.shared.lock_callback() = Some(Box::new(callback));
    }

    /// Removes the event callback.
    pub fn unregister_event_callback(&self) {
        *self.shared.lock_callback() = None;
    }

    /// Copy of the bounded event history, oldest first.
    #[must_use]
    pub fn get_history(&self) -> Vec<Event> {
        self.shared.lock_history().iter().cloned().collect()
    }

    /// Clears the event history.
    pub fn clear_history(&self) {
        self.shared.lock_history().clear();
    }

    /// Writes a summary-statistics record (no population detail) as JSON.
    pub fn export_data(&self, path: &Path) -> bool {
        let stats = self.get_stats();
        let document = json!({
            "summary_stats": {
                "total_generations": stats.total_generations,
                "total_runtime_ms": stats.total_runtime_ms,
                "generations_per_second": stats.generations_per_second,
                "current_population": stats.current_population,
                "current_best_fitness": stats.current_best_fitness,
                "current_avg_fitness": stats.current_avg_fitness,
            }
        });
        let result = std::fs::write(path, format!("{document:#}"));
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(%err, path = %path.display(), "data export failed");
                false
            }
        }
    }

    /// Polls until the engine is no longer running. A zero timeout waits
    /// indefinitely. Returns false on timeout.
    pub fn wait_for_completion(&self, timeout_ms: u64) -> bool {
        let started = Instant::now();
        loop {
            {
                let lifecycle = self.shared.lock_lifecycle();
                if !lifecycle.running {
                    return true;
                }
            }
            if timeout_ms > 0 && started.elapsed().as_millis() as u64 >= timeout_ms {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn log_effective_config(&self) {
        let full = self.shared.environment.get_full_config();
        match serde_json::to_string_pretty(&json!({
            "engine": self.shared.config,
            "environment": full.environment,
            "vm": full.vm,
            "analyzer": full.analyzer,
        })) {
            Ok(rendered) => info!("effective configuration:\n{rendered}"),
            Err(err) => warn!(%err, "could not render effective configuration"),
        }
    }
}

impl Drop for EvolutionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EngineShared {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callback(&self) -> MutexGuard<'_, Option<EventCallback>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(
        &self,
        kind: EventKind,
        generation: u64,
        message: &str,
        fitness: Option<f64>,
        organism_id: Option<u64>,
    ) {
        let event = Event {
            kind,
            generation,
            timestamp: SystemTime::now(),
            message: message.to_string(),
            fitness,
            organism_id,
        };
        if let Some(callback) = self.lock_callback().as_ref() {
            callback(&event);
        }
        let mut history = self.lock_history();
        history.push_back(event);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    fn save_to(&self, path: &Path) -> bool {
        match self.environment.save_state(path) {
            Ok(()) => {
                let generation = self.lock_lifecycle().stats.total_generations;
                self.emit(
                    EventKind::StateSaved,
                    generation,
                    &format!("State saved to {}", path.display()),
                    None,
                    None,
                );
                true
            }
            Err(err) => {
                error!(%err, path = %path.display(), "state save failed");
                false
            }
        }
    }

    fn periodic_tasks(&self, generation: u64) {
        if self.config.enable_save_state
            && self.config.save_interval_generations > 0
            && generation % self.config.save_interval_generations == 0
        {
            self.save_to(&self.config.save_directory.join(CHECKPOINT_FILE));
        }
        if self.config.enable_backup
            && self.config.backup_interval > 0
            && generation % self.config.backup_interval == 0
        {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0);
            let filename = format!("backup_{generation}_{stamp}.json");
            self.save_to(&self.config.save_directory.join(filename));
        }
        if self.config.enable_metrics
            && self.config.metrics_interval > 0
            && generation % self.config.metrics_interval == 0
        {
            self.collect_metrics(generation);
        }
    }

    fn collect_metrics(&self, generation: u64) {
        let env_stats = self.environment.get_stats();
        info!(
            generation,
            population = env_stats.population_size,
            avg_fitness = env_stats.avg_fitness,
            best_fitness = env_stats.max_fitness,
            variance = env_stats.fitness_variance,
            "metrics sample"
        );
    }
}

fn worker_loop(shared: &EngineShared) {
    loop {
        // Pause gate and stop check.
        {
            let mut lifecycle = shared.lock_lifecycle();
            while lifecycle.paused && !lifecycle.should_stop {
                lifecycle = shared
                    .wake
                    .wait(lifecycle)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if lifecycle.should_stop {
                break;
            }
        }

        let generation_started = Instant::now();
        match shared.environment.update() {
            Ok(()) => {
                let env_stats = shared.environment.get_stats();
                let (generation, improved, reached_max) = {
                    let mut lifecycle = shared.lock_lifecycle();
                    if lifecycle.should_stop {
                        break;
                    }
                    lifecycle.stats.total_generations += 1;
                    lifecycle.stats.last_generation_time = Instant::now();
                    lifecycle.stats.total_runtime_ms =
                        lifecycle.stats.start_time.elapsed().as_millis() as u64;
                    let improved = env_stats.max_fitness > lifecycle.stats.current_best_fitness;
                    lifecycle.stats.current_population = env_stats.population_size;
                    lifecycle.stats.current_best_fitness = env_stats.max_fitness;
                    lifecycle.stats.current_avg_fitness = env_stats.avg_fitness;
                    let generation = lifecycle.stats.total_generations;
                    let reached_max = shared.config.max_generations > 0
                        && generation >= shared.config.max_generations;
                    if reached_max {
                        lifecycle.should_stop = true;
                    }
                    (generation, improved, reached_max)
                };
                shared.emit(
                    EventKind::GenerationCompleted,
                    generation,
                    "Generation completed",
                    Some(env_stats.max_fitness),
                    None,
                );
                if improved {
                    shared.emit(
                        EventKind::FitnessImproved,
                        generation,
                        "Best fitness improved",
                        Some(env_stats.max_fitness),
                        None,
                    );
                }
                shared.periodic_tasks(generation);
                if reached_max {
                    info!(
                        max_generations = shared.config.max_generations,
                        "reached max generations, stopping"
                    );
                    break;
                }
            }
            Err(err) => {
                error!(%err, "generation update failed");
                let generation = shared.lock_lifecycle().stats.total_generations;
                shared.emit(
                    EventKind::ErrorOccurred,
                    generation,
                    &format!("Environment update failed: {err}"),
                    None,
                    None,
                );
            }
        }

        // Breather plus optional pacing toward generation_time_ms, woken
        // early by stop or resume.
        let pace = shared.environment.generation_time();
        let sleep = pace
            .checked_sub(generation_started.elapsed())
            .unwrap_or_default()
            .max(WORKER_BREATHER);
        let lifecycle = shared.lock_lifecycle();
        if lifecycle.should_stop {
            break;
        }
        let _ = shared
            .wake
            .wait_timeout(lifecycle, sleep)
            .map(|(guard, _)| drop(guard))
            .map_err(|poisoned| drop(poisoned.into_inner()));
    }

    // Finalize lifecycle state from whichever path broke the loop.
    let generation = {
        let mut lifecycle = shared.lock_lifecycle();
        lifecycle.running = false;
        lifecycle.paused = false;
        lifecycle.stats.is_running = false;
        lifecycle.stats.is_paused = false;
        lifecycle.stats.total_runtime_ms =
            lifecycle.stats.start_time.elapsed().as_millis() as u64;
        lifecycle.stats.total_generations
    };
    shared.emit(
        EventKind::EngineStopped,
        generation,
        "Evolution engine stopped",
        None,
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerConfig;
    use crate::environment::EnvironmentConfig;
    use crate::vm::VmConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiny_environment() -> Arc<Environment> {
        let config = EnvironmentConfig {
            initial_population: 4,
            min_population: 2,
            max_population: 16,
            selection_pressure: 0.0,
            enable_aging: false,
            enable_competition: false,
            enable_predation: false,
            enable_random_catastrophes: false,
            immigration_chance: 0.0,
            rng_seed: Some(21),
            ..EnvironmentConfig::default()
        };
        let vm_config = VmConfig {
            image_width: 16,
            image_height: 16,
            max_instructions: 2000,
            ..VmConfig::default()
        };
        Arc::new(Environment::new(
            config,
            vm_config,
            AnalyzerConfig::default(),
        ))
    }

    fn quiet_engine_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            enable_logging: false,
            enable_save_state: false,
            enable_backup: false,
            enable_metrics: false,
            save_directory: dir.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn lifecycle_transitions_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = EvolutionEngine::new(tiny_environment(), quiet_engine_config(dir.path()));

        assert!(!engine.stop(), "stop while stopped is a no-op");
        assert!(!engine.pause(), "pause while stopped is a no-op");
        assert!(engine.start());
        assert!(!engine.start(), "double start is refused");
        assert!(engine.pause());
        assert!(!engine.pause(), "double pause is refused");
        assert!(engine.resume());
        assert!(!engine.resume(), "double resume is refused");
        assert!(engine.stop());
        assert!(!engine.stop());
        let stats = engine.get_stats();
        assert!(!stats.is_running);
        assert!(!stats.is_paused);
    }

    #[test]
    fn max_generations_stops_the_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            max_generations: 3,
            ..quiet_engine_config(dir.path())
        };
        let engine = EvolutionEngine::new(tiny_environment(), config);
        assert!(engine.start());
        assert!(engine.wait_for_completion(30_000));
        let stats = engine.get_stats();
        assert_eq!(stats.total_generations, 3);
        assert!(!stats.is_running);
    }

    #[test]
    fn events_reach_callback_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            max_generations: 2,
            ..quiet_engine_config(dir.path())
        };
        let engine = EvolutionEngine::new(tiny_environment(), config);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        engine.register_event_callback(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(engine.start());
        assert!(engine.wait_for_completion(30_000));

        assert!(seen.load(Ordering::SeqCst) > 0);
        let history = engine.get_history();
        assert!(history
            .iter()
            .any(|event| event.kind == EventKind::EngineStarted));
        assert!(history
            .iter()
            .any(|event| event.kind == EventKind::GenerationCompleted));
        assert!(history
            .iter()
            .any(|event| event.kind == EventKind::EngineStopped));

        engine.clear_history();
        assert!(engine.get_history().is_empty());
    }

    #[test]
    fn periodic_save_writes_checkpoint_and_resume_picks_it_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            enable_save_state: true,
            save_interval_generations: 1,
            max_generations: 2,
            ..quiet_engine_config(dir.path())
        };
        let engine = EvolutionEngine::new(tiny_environment(), config.clone());
        assert!(engine.start());
        assert!(engine.wait_for_completion(30_000));
        let checkpoint = dir.path().join(CHECKPOINT_FILE);
        assert!(checkpoint.exists());
        drop(engine);

        // A fresh engine over a fresh environment resumes from the file.
        let resumed = EvolutionEngine::new(
            tiny_environment(),
            EngineConfig {
                max_generations: 2,
                ..config
            },
        );
        assert!(resumed.start());
        // Already at the max-generation boundary from the checkpoint: the
        // worker stops after observing it.
        assert!(resumed.wait_for_completion(30_000));
        assert!(resumed.get_stats().total_generations >= 2);
    }

    #[test]
    fn load_state_is_refused_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = EvolutionEngine::new(tiny_environment(), quiet_engine_config(dir.path()));
        let path = dir.path().join("snapshot.json");
        assert!(engine.save_state(Some(&path)));
        assert!(engine.start());
        assert!(!engine.load_state(&path));
        assert!(engine.stop());
        assert!(engine.load_state(&path));
    }

    #[test]
    fn export_writes_summary_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = EvolutionEngine::new(tiny_environment(), quiet_engine_config(dir.path()));
        let path = dir.path().join("export.json");
        assert!(engine.export_data(&path));
        let raw = std::fs::read_to_string(&path).expect("read export");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse export");
        assert!(value["summary_stats"]["total_generations"].is_u64());
    }

    #[test]
    fn stop_from_event_callback_does_not_deadlock() {
        // Stopping from inside the worker thread must only set the flag.
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(EvolutionEngine::new(
            tiny_environment(),
            quiet_engine_config(dir.path()),
        ));
        let handle = Arc::clone(&engine);
        engine.register_event_callback(move |event| {
            if event.kind == EventKind::GenerationCompleted {
                handle.stop();
            }
        });
        assert!(engine.start());
        assert!(engine.wait_for_completion(30_000));
        assert!(!engine.get_stats().is_running);
    }
}
