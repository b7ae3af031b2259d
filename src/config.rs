//! Scheduler configuration.
//!
//! Values are read once when the scheduler starts. They can come from serde
//! (any format), from a key-value store through [`SchedulerConfig::from_lookup`],
//! or from the environment through [`SchedulerConfig::from_env`].

use crate::error::ConfigError;
use crate::fiber::Fiber;
use crate::job::StackClass;
use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
}

/// Size of one fiber pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of fibers created at startup.
    pub count: usize,
    /// Usable stack bytes per fiber.
    pub stack_size: usize,
}

impl PoolConfig {
    pub const fn new(count: usize, stack_size: usize) -> Self {
        PoolConfig { count, stack_size }
    }

    /// Arena bytes the whole pool needs, saturating at `usize::MAX`.
    pub fn arena_bytes(&self) -> usize {
        self.checked_arena_bytes().unwrap_or(usize::MAX)
    }

    /// Arena bytes the whole pool needs, `None` on overflow.
    pub fn checked_arena_bytes(&self) -> Option<usize> {
        if self.count == 0 {
            return Some(0);
        }
        self.count
            .checked_mul(Fiber::checked_allocation_size(self.stack_size)?)
    }
}

/// One [`PoolConfig`] per stack class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberPoolsConfig {
    pub normal: PoolConfig,
    pub large: PoolConfig,
    pub gigantic: PoolConfig,
    pub external: PoolConfig,
}

impl Default for FiberPoolsConfig {
    fn default() -> Self {
        FiberPoolsConfig {
            normal: PoolConfig::new(128, 64 * 1024),
            large: PoolConfig::new(32, 256 * 1024),
            gigantic: PoolConfig::new(8, 1024 * 1024),
            external: PoolConfig::new(4, 4 * 1024 * 1024),
        }
    }
}

impl FiberPoolsConfig {
    pub fn get(&self, class: StackClass) -> &PoolConfig {
        match class {
            StackClass::Normal => &self.normal,
            StackClass::Large => &self.large,
            StackClass::Gigantic => &self.gigantic,
            StackClass::ExternalLibrary => &self.external,
        }
    }

    pub fn get_mut(&mut self, class: StackClass) -> &mut PoolConfig {
        match class {
            StackClass::Normal => &mut self.normal,
            StackClass::Large => &mut self.large,
            StackClass::Gigantic => &mut self.gigantic,
            StackClass::ExternalLibrary => &mut self.external,
        }
    }

    /// Arena bytes needed by all pools together, saturating at `usize::MAX`.
    pub fn arena_bytes(&self) -> usize {
        self.checked_arena_bytes().unwrap_or(usize::MAX)
    }

    /// Arena bytes needed by all pools together, `None` on overflow.
    pub fn checked_arena_bytes(&self) -> Option<usize> {
        StackClass::ALL.iter().try_fold(0usize, |total, &class| {
            total.checked_add(self.get(class).checked_arena_bytes()?)
        })
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fiber worker threads to spawn. 0 means one per hardware thread, minus
    /// the main thread when it acts as a worker.
    pub fiber_workers: usize,
    /// I/O worker threads to spawn. 0 means `max(1, cpus / 4)`.
    pub io_workers: usize,
    /// Whether the thread that creates the scheduler runs jobs while it waits.
    pub main_thread_is_worker: bool,
    pub fibers: FiberPoolsConfig,
    /// Counters available through `generate_counter`.
    pub max_counters: usize,
    /// Capacity of each (lane, priority) job queue.
    pub queue_capacity: usize,
    /// Fill unused fiber stacks with a recognizable pattern.
    pub poison_stacks: bool,
    pub pinning: PinningStrategy,
    /// OS stack size of spawned worker threads.
    pub worker_stack_size: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            fiber_workers: 0,
            io_workers: 0,
            main_thread_is_worker: true,
            fibers: FiberPoolsConfig::default(),
            max_counters: 1024,
            queue_capacity: 4096,
            poison_stacks: cfg!(debug_assertions),
            pinning: PinningStrategy::None,
            worker_stack_size: 2 * 1024 * 1024,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    /// Reads every known key through `lookup`. Missing keys keep their
    /// defaults.
    ///
    /// Keys are `jobs.fiber_workers`, `jobs.io_workers`,
    /// `jobs.main_thread_is_worker`, `jobs.fibers.<class>.count`,
    /// `jobs.fibers.<class>.stack_size` (class is `normal`, `large`,
    /// `gigantic` or `external`), `jobs.max_counters`, `jobs.queue_capacity`,
    /// `jobs.poison_stacks`, `jobs.pinning`, `jobs.worker_stack_size` and
    /// `jobs.shutdown_timeout_ms`. Sizes accept a `k`, `m` or `g` suffix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = SchedulerConfig::default();
        let get = |key: &str| lookup(key).map(|v| (key.to_string(), v.trim().to_string()));

        if let Some((k, v)) = get("jobs.fiber_workers") {
            config.fiber_workers = parse_count(&k, &v)?;
        }
        if let Some((k, v)) = get("jobs.io_workers") {
            config.io_workers = parse_count(&k, &v)?;
        }
        if let Some((k, v)) = get("jobs.main_thread_is_worker") {
            config.main_thread_is_worker = parse_bool(&k, &v)?;
        }
        for class in StackClass::ALL {
            let pool = config.fibers.get_mut(class);
            if let Some((k, v)) = get(&format!("jobs.fibers.{}.count", class.name())) {
                pool.count = parse_count(&k, &v)?;
            }
            if let Some((k, v)) = get(&format!("jobs.fibers.{}.stack_size", class.name())) {
                pool.stack_size = parse_size(&k, &v)?;
            }
        }
        if let Some((k, v)) = get("jobs.max_counters") {
            config.max_counters = parse_count(&k, &v)?;
        }
        if let Some((k, v)) = get("jobs.queue_capacity") {
            config.queue_capacity = parse_count(&k, &v)?;
        }
        if let Some((k, v)) = get("jobs.poison_stacks") {
            config.poison_stacks = parse_bool(&k, &v)?;
        }
        if let Some((k, v)) = get("jobs.pinning") {
            config.pinning = match v.to_ascii_lowercase().as_str() {
                "none" => PinningStrategy::None,
                "linear" => PinningStrategy::Linear,
                _ => return Err(invalid(&k, &v)),
            };
        }
        if let Some((k, v)) = get("jobs.worker_stack_size") {
            config.worker_stack_size = parse_size(&k, &v)?;
        }
        if let Some((k, v)) = get("jobs.shutdown_timeout_ms") {
            config.shutdown_timeout_ms = v.parse().map_err(|_| invalid(&k, &v))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from `FIBERJOBS_*` environment variables. The
    /// variable for `jobs.fibers.large.count` is `FIBERJOBS_FIBERS_LARGE_COUNT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(env_var_name(key)).ok())
    }

    /// Checks values that would make the scheduler unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_counters == 0 {
            return Err(ConfigError::Zero {
                key: "jobs.max_counters",
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero {
                key: "jobs.queue_capacity",
            });
        }
        if self.worker_stack_size == 0 {
            return Err(ConfigError::Zero {
                key: "jobs.worker_stack_size",
            });
        }
        for class in StackClass::ALL {
            let pool = self.fibers.get(class);
            if pool.count == 0 {
                continue;
            }
            if pool.stack_size == 0 || Fiber::checked_allocation_size(pool.stack_size).is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("jobs.fibers.{}.stack_size", class.name()),
                    value: pool.stack_size.to_string(),
                });
            }
            if pool.checked_arena_bytes().is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("jobs.fibers.{}.count", class.name()),
                    value: pool.count.to_string(),
                });
            }
        }
        if self.fibers.checked_arena_bytes().is_none() {
            return Err(ConfigError::InvalidValue {
                key: "jobs.fibers".to_string(),
                value: "total stack bytes overflow usize".to_string(),
            });
        }
        if StackClass::ALL.iter().all(|&c| self.fibers.get(c).count == 0) {
            return Err(ConfigError::Zero {
                key: "jobs.fibers.normal.count",
            });
        }
        Ok(())
    }

    /// Number of fiber worker threads that will be spawned.
    pub fn resolved_fiber_workers(&self) -> usize {
        if self.fiber_workers > 0 {
            return self.fiber_workers;
        }
        let cpus = num_cpus::get();
        let reserved = usize::from(self.main_thread_is_worker);
        cpus.saturating_sub(reserved).max(1)
    }

    /// Number of I/O worker threads that will be spawned.
    pub fn resolved_io_workers(&self) -> usize {
        if self.io_workers > 0 {
            self.io_workers
        } else {
            (num_cpus::get() / 4).max(1)
        }
    }

    pub fn with_fiber_workers(mut self, count: usize) -> Self {
        self.fiber_workers = count;
        self
    }

    pub fn with_io_workers(mut self, count: usize) -> Self {
        self.io_workers = count;
        self
    }

    pub fn with_main_thread_worker(mut self, enabled: bool) -> Self {
        self.main_thread_is_worker = enabled;
        self
    }

    pub fn with_pool(mut self, class: StackClass, count: usize, stack_size: usize) -> Self {
        *self.fibers.get_mut(class) = PoolConfig::new(count, stack_size);
        self
    }

    pub fn with_max_counters(mut self, count: usize) -> Self {
        self.max_counters = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poisoning(mut self, enabled: bool) -> Self {
        self.poison_stacks = enabled;
        self
    }

    pub fn with_pinning(mut self, pinning: PinningStrategy) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn with_shutdown_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.shutdown_timeout_ms = timeout_ms;
        self
    }
}

fn env_var_name(key: &str) -> String {
    let key = key.strip_prefix("jobs.").unwrap_or(key);
    format!("FIBERJOBS_{}", key.replace('.', "_").to_ascii_uppercase())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize, ConfigError> {
    let lower = value.to_ascii_lowercase();
    let (digits, shift) = match lower.trim_end_matches('b').chars().last() {
        Some('k') => (&lower[..lower.find('k').unwrap_or(0)], 10),
        Some('m') => (&lower[..lower.find('m').unwrap_or(0)], 20),
        Some('g') => (&lower[..lower.find('g').unwrap_or(0)], 30),
        _ => (lower.as_str(), 0),
    };
    let base: usize = digits.trim().parse().map_err(|_| invalid(key, value))?;
    base.checked_mul(1usize << shift)
        .ok_or_else(|| invalid(key, value))
}
