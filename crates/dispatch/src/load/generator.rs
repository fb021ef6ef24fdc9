//! Closed-loop pool load estimation
//!
//! Each control cycle compares the pool's occupancy with the previous cycle to
//! estimate how many tasks finished, then admits enough new tasks to keep the
//! pool's active queue at `max_tasks_per_pool * ratio`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of execution pool occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool_id: String,
    pub max_tasks_per_pool: u32,
    /// Tasks waiting for a slot
    pub active_tasks: u32,
    /// Tasks executing on a node
    pub running_tasks: u32,
}

impl PoolMetrics {
    /// Whether the pool has no queued or executing tasks
    pub fn is_idle(&self) -> bool {
        self.active_tasks == 0 && self.running_tasks == 0
    }

    /// Queued plus executing tasks
    pub fn total_tasks(&self) -> u32 {
        self.active_tasks + self.running_tasks
    }
}

/// Load generator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadConfig {
    /// Target ratio of active (queued) tasks to pool capacity
    pub active_to_running_ratio: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            active_to_running_ratio: 3.0,
        }
    }
}

impl LoadConfig {
    /// Create a configuration with the given target ratio
    pub fn new(active_to_running_ratio: f64) -> Self {
        Self {
            active_to_running_ratio,
        }
    }
}

/// Result of one control cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolLoadSnapshot {
    /// Never negative
    pub tasks_to_admit: u32,
    pub target_active_to_running_ratio: f64,
    pub max_tasks_per_pool: u32,
    pub sampling_interval_seconds: f64,
    pub processing_speed_per_interval: f64,
    pub processing_speed_per_minute: f64,
    pub active_tasks: u32,
    pub running_tasks: u32,
    pub timestamp: DateTime<Utc>,
}

/// Controller state carried from one cycle to the next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolLoadState {
    pub last_metrics: PoolMetrics,
    /// Tasks actually admitted after the last snapshot
    pub last_admitted_count: u32,
    pub active_to_running_ratio: f64,
    /// Ratio restored when the pool is found overfilled
    pub default_ratio: f64,
    pub processing_speed: f64,
    pub timestamp: DateTime<Utc>,
}

impl PoolLoadState {
    /// Compute the next state and snapshot from fresh metrics
    ///
    /// `prev` is `None` on the first cycle.
    pub fn advance(
        prev: Option<&PoolLoadState>,
        config: &LoadConfig,
        metrics: &PoolMetrics,
        now: DateTime<Utc>,
    ) -> (PoolLoadState, PoolLoadSnapshot) {
        let capacity = metrics.max_tasks_per_pool as f64;
        let active = metrics.active_tasks as f64;

        let (ratio, default_ratio, speed, interval, admitted) = match prev {
            None => {
                let ratio = config.active_to_running_ratio;
                let admitted = capacity * ratio - active;
                (ratio, ratio, 0.0, 0.0, admitted)
            }
            Some(prev) => {
                let speed = prev.last_admitted_count as f64
                    + prev.last_metrics.active_tasks as f64
                    - active;

                let mut ratio = prev.active_to_running_ratio;
                if metrics.active_tasks == 0 && prev.last_admitted_count > 0 {
                    // Pool drained everything we gave it
                    ratio += 1.0;
                } else if capacity * (ratio + 1.0) < active {
                    ratio = prev.default_ratio;
                }

                let admitted = capacity * ratio - active + (speed / 2.0).ceil();
                let interval = (now - prev.timestamp).num_milliseconds().max(0) as f64 / 1000.0;
                (ratio, prev.default_ratio, speed, interval, admitted)
            }
        };

        let tasks_to_admit = admitted.max(0.0).floor() as u32;
        let speed_per_minute = if interval > 0.0 {
            speed * 60.0 / interval
        } else {
            0.0
        };

        let state = PoolLoadState {
            last_metrics: metrics.clone(),
            last_admitted_count: tasks_to_admit,
            active_to_running_ratio: ratio,
            default_ratio,
            processing_speed: speed,
            timestamp: now,
        };

        let snapshot = PoolLoadSnapshot {
            tasks_to_admit,
            target_active_to_running_ratio: ratio,
            max_tasks_per_pool: metrics.max_tasks_per_pool,
            sampling_interval_seconds: interval,
            processing_speed_per_interval: speed,
            processing_speed_per_minute: speed_per_minute,
            active_tasks: metrics.active_tasks,
            running_tasks: metrics.running_tasks,
            timestamp: now,
        };

        (state, snapshot)
    }
}

/// Owner of the controller state for a single worker
///
/// # Example
///
/// ```
/// use scanfleet_dispatch::load::{LoadConfig, PoolLoadGenerator, PoolMetrics};
///
/// let mut generator = PoolLoadGenerator::new(LoadConfig::new(2.0));
/// let snapshot = generator.get_load_snapshot(&PoolMetrics {
///     pool_id: "pool".into(),
///     max_tasks_per_pool: 10,
///     active_tasks: 5,
///     running_tasks: 10,
/// });
/// assert_eq!(snapshot.tasks_to_admit, 15);
///
/// // Report what was really submitted before the next cycle
/// generator.set_last_admitted_count(7);
/// ```
#[derive(Debug, Clone)]
pub struct PoolLoadGenerator {
    config: LoadConfig,
    state: Option<PoolLoadState>,
}

impl PoolLoadGenerator {
    /// Create a generator with no history
    pub fn new(config: LoadConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// Compute the snapshot for this cycle
    pub fn get_load_snapshot(&mut self, metrics: &PoolMetrics) -> PoolLoadSnapshot {
        self.get_load_snapshot_at(metrics, Utc::now())
    }

    /// Compute the snapshot for this cycle at an explicit time
    pub fn get_load_snapshot_at(
        &mut self,
        metrics: &PoolMetrics,
        now: DateTime<Utc>,
    ) -> PoolLoadSnapshot {
        let (state, snapshot) =
            PoolLoadState::advance(self.state.as_ref(), &self.config, metrics, now);
        self.state = Some(state);
        snapshot
    }

    /// Correct the estimate with the number of tasks actually admitted
    ///
    /// Must be called every cycle before the next snapshot.
    pub fn set_last_admitted_count(&mut self, count: u32) {
        if let Some(state) = self.state.as_mut() {
            state.last_admitted_count = count;
        }
    }

    /// Current controller state, `None` before the first snapshot
    pub fn state(&self) -> Option<&PoolLoadState> {
        self.state.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn metrics(max: u32, active: u32, running: u32) -> PoolMetrics {
        PoolMetrics {
            pool_id: "pool".to_string(),
            max_tasks_per_pool: max,
            active_tasks: active,
            running_tasks: running,
        }
    }

    #[test]
    fn test_first_snapshot_fills_to_target() {
        let mut generator = PoolLoadGenerator::new(LoadConfig::new(2.0));
        let snapshot = generator.get_load_snapshot(&metrics(10, 4, 10));

        assert_eq!(snapshot.tasks_to_admit, 16);
        assert_eq!(snapshot.target_active_to_running_ratio, 2.0);
        assert_eq!(snapshot.sampling_interval_seconds, 0.0);
        assert_eq!(snapshot.processing_speed_per_minute, 0.0);
    }

    #[test]
    fn test_first_snapshot_never_negative() {
        let mut generator = PoolLoadGenerator::new(LoadConfig::new(1.0));
        let snapshot = generator.get_load_snapshot(&metrics(4, 40, 4));
        assert_eq!(snapshot.tasks_to_admit, 0);
    }

    #[test]
    fn test_processing_speed_feeds_admission() {
        let mut generator = PoolLoadGenerator::new(LoadConfig::new(1.0));
        let t0 = Utc::now();

        generator.get_load_snapshot_at(&metrics(10, 10, 10), t0);
        generator.set_last_admitted_count(6);

        // 6 admitted + 10 active before - 8 active now = 8 processed
        let snapshot =
            generator.get_load_snapshot_at(&metrics(10, 8, 10), t0 + Duration::seconds(30));
        assert_eq!(snapshot.processing_speed_per_interval, 8.0);
        assert_eq!(snapshot.sampling_interval_seconds, 30.0);
        assert_eq!(snapshot.processing_speed_per_minute, 16.0);
        // 10 * 1 - 8 + ceil(8 / 2)
        assert_eq!(snapshot.tasks_to_admit, 6);
    }

    #[test]
    fn test_ratio_grows_when_pool_drains() {
        let mut generator = PoolLoadGenerator::new(LoadConfig::new(1.0));
        let t0 = Utc::now();

        generator.get_load_snapshot_at(&metrics(4, 0, 0), t0);
        generator.set_last_admitted_count(4);

        let snapshot =
            generator.get_load_snapshot_at(&metrics(4, 0, 4), t0 + Duration::seconds(15));
        assert_eq!(snapshot.target_active_to_running_ratio, 2.0);

        generator.set_last_admitted_count(3);
        let snapshot =
            generator.get_load_snapshot_at(&metrics(4, 0, 4), t0 + Duration::seconds(30));
        assert_eq!(snapshot.target_active_to_running_ratio, 3.0);
    }

    #[test]
    fn test_ratio_unchanged_when_nothing_admitted() {
        let mut generator = PoolLoadGenerator::new(LoadConfig::new(1.0));
        let t0 = Utc::now();

        generator.get_load_snapshot_at(&metrics(4, 0, 0), t0);
        generator.set_last_admitted_count(0);

        let snapshot =
            generator.get_load_snapshot_at(&metrics(4, 0, 0), t0 + Duration::seconds(15));
        assert_eq!(snapshot.target_active_to_running_ratio, 1.0);
    }

    #[test]
    fn test_ratio_resets_when_overfilled() {
        let config = LoadConfig::new(1.0);
        let t0 = Utc::now();

        let (mut state, _) = PoolLoadState::advance(None, &config, &metrics(4, 0, 0), t0);
        state.active_to_running_ratio = 5.0;
        state.last_admitted_count = 0;

        // 4 * (5 + 1) = 24 < 30 active tasks
        let (next, snapshot) = PoolLoadState::advance(
            Some(&state),
            &config,
            &metrics(4, 30, 4),
            t0 + Duration::seconds(15),
        );
        assert_eq!(next.active_to_running_ratio, 1.0);
        assert_eq!(snapshot.target_active_to_running_ratio, 1.0);
        assert_eq!(snapshot.tasks_to_admit, 0);
    }

    #[test]
    fn test_ratio_never_drops_below_default() {
        let config = LoadConfig::new(2.0);
        let t0 = Utc::now();
        let mut state: Option<PoolLoadState> = None;

        for step in 0..200u32 {
            let active = (step * 37) % 97;
            let running = (step * 13) % 11;
            let (mut next, snapshot) = PoolLoadState::advance(
                state.as_ref(),
                &config,
                &metrics(8, active, running),
                t0 + Duration::seconds(step as i64),
            );
            assert!(snapshot.target_active_to_running_ratio >= 2.0);
            next.last_admitted_count = snapshot.tasks_to_admit / 2;
            state = Some(next);
        }
    }

    #[test]
    fn test_set_last_admitted_before_first_snapshot_is_ignored() {
        let mut generator = PoolLoadGenerator::new(LoadConfig::default());
        generator.set_last_admitted_count(5);
        assert!(generator.state().is_none());
    }

    #[test]
    fn test_pool_metrics_idle() {
        assert!(metrics(4, 0, 0).is_idle());
        assert!(!metrics(4, 0, 1).is_idle());
        assert_eq!(metrics(4, 2, 3).total_tasks(), 5);
    }
}
