//! Orbital task model: priorities, lifecycle states, trigger conditions,
//! execution contexts, and results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Orbit-position match tolerances.
pub const ALTITUDE_TOLERANCE_KM: f64 = 10.0;
pub const POSITION_TOLERANCE_DEG: f64 = 5.0;

/// Task execution priority. Declaration order doubles as dispatch order:
/// `Critical` sorts before `High`, and so on down to `Idle`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
    Idle,
}

/// Task lifecycle state.
///
/// Transitions are monotone per execution: `Pending` -> `Running` -> one of
/// the terminal states. Only `Suspended` <-> `Pending` may revisit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Suspended,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Task categories used for completion-callback filtering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskType {
    Communication,
    PowerManagement,
    Telemetry,
    AttitudeControl,
    OrbitalManeuver,
    PayloadOperation,
    HealthCheck,
    Maintenance,
    FirmwareUpdate,
}

/// What to do with a task that ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    Retry,
    CheckpointRestore,
    AlternateRoutine,
    GroundAssistance,
    SafeMode,
}

/// Resource envelope a task payload runs under.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub memory_limit_bytes: u64,
    pub cpu_time_limit_ms: u32,
    pub allow_io_operations: bool,
    pub allow_critical_subsystems: bool,
    pub environment: BTreeMap<String, String>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 1024 * 1024,
            cpu_time_limit_ms: 5000,
            allow_io_operations: true,
            allow_critical_subsystems: false,
            environment: BTreeMap::new(),
        }
    }
}

/// Task payload. Runs to completion synchronously and reports success as a
/// boolean; panics are caught at the executor boundary.
pub type TaskPayload = Arc<dyn Fn(&TaskContext) -> bool + Send + Sync>;

/// Definition of a schedulable orbital task.
#[derive(Clone)]
pub struct Task {
    /// Unique identifier; the scheduler generates one when left empty.
    pub id: String,
    pub name: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    pub scheduled_time: SystemTime,
    pub timeout: Duration,
    pub recovery_strategy: RecoveryStrategy,
    pub radiation_protected: bool,
    pub retry_limit: u32,
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, task_type: TaskType, payload: F) -> Self
    where
        F: Fn(&TaskContext) -> bool + Send + Sync + 'static,
    {
        Self {
            id: String::new(),
            name: name.into(),
            task_type,
            priority: TaskPriority::Normal,
            payload: Arc::new(payload),
            scheduled_time: SystemTime::now(),
            timeout: Duration::from_millis(5000),
            recovery_strategy: RecoveryStrategy::Retry,
            radiation_protected: false,
            retry_limit: 1,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_time(mut self, when: SystemTime) -> Self {
        self.scheduled_time = when;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_recovery_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = strategy;
        self
    }

    pub fn with_radiation_protection(mut self, protected: bool) -> Self {
        self.radiation_protected = protected;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the execution context, letting metadata override the defaults.
    pub fn build_context(&self, defaults: &TaskContext) -> TaskContext {
        let mut context = defaults.clone();
        if let Some(value) = self.metadata.get("memory_limit_bytes") {
            if let Ok(parsed) = value.parse() {
                context.memory_limit_bytes = parsed;
            }
        }
        if let Some(value) = self.metadata.get("cpu_time_limit_ms") {
            if let Ok(parsed) = value.parse() {
                context.cpu_time_limit_ms = parsed;
            }
        }
        if let Some(value) = self.metadata.get("allow_io_operations") {
            context.allow_io_operations = value == "true";
        }
        if let Some(value) = self.metadata.get("allow_critical_subsystems") {
            context.allow_critical_subsystems = value == "true";
        }
        context.environment.extend(
            self.metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        context
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("scheduled_time", &self.scheduled_time)
            .field("timeout", &self.timeout)
            .field("recovery_strategy", &self.recovery_strategy)
            .field("radiation_protected", &self.radiation_protected)
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

/// Result of one completed task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub error_message: String,
    pub output: BTreeMap<String, String>,
    pub retry_attempts: u32,
    pub radiation_event_detected: bool,
}

/// Read-only view of a task's definition and current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub metadata: BTreeMap<String, String>,
}

/// Spacecraft orbit position sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrbitPosition {
    pub altitude_km: f64,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub velocity_kmps: f64,
    pub timestamp: SystemTime,
}

impl OrbitPosition {
    pub fn new(altitude_km: f64, latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            altitude_km,
            latitude_deg,
            longitude_deg,
            velocity_kmps: 7.6,
            timestamp: SystemTime::now(),
        }
    }

    /// Whether `self` falls inside the match window around `trigger`.
    /// Longitude wraps through the antimeridian.
    pub fn matches(&self, trigger: &OrbitPosition) -> bool {
        let altitude_match =
            (self.altitude_km - trigger.altitude_km).abs() <= ALTITUDE_TOLERANCE_KM;
        let latitude_match =
            (self.latitude_deg - trigger.latitude_deg).abs() <= POSITION_TOLERANCE_DEG;

        let mut longitude_delta = (self.longitude_deg - trigger.longitude_deg).abs();
        if longitude_delta > POSITION_TOLERANCE_DEG {
            longitude_delta = longitude_delta
                .min(((self.longitude_deg + 360.0) - trigger.longitude_deg).abs())
                .min((self.longitude_deg - (trigger.longitude_deg + 360.0)).abs());
        }

        altitude_match && latitude_match && longitude_delta <= POSITION_TOLERANCE_DEG
    }
}

impl Default for OrbitPosition {
    fn default() -> Self {
        // Nominal LEO insertion point until the ADCS reports a fix.
        Self::new(550.0, 0.0, 0.0)
    }
}

/// Condition set deferring a task until one sub-condition is satisfied.
#[derive(Debug, Clone, Default)]
pub struct TriggerCondition {
    pub time_point: Option<SystemTime>,
    pub orbit_position: Option<OrbitPosition>,
    pub event_name: Option<String>,
    pub dependency_task_id: Option<String>,
}

impl TriggerCondition {
    pub fn at_time(when: SystemTime) -> Self {
        Self {
            time_point: Some(when),
            ..Self::default()
        }
    }

    pub fn at_position(position: OrbitPosition) -> Self {
        Self {
            orbit_position: Some(position),
            ..Self::default()
        }
    }

    pub fn on_event(name: impl Into<String>) -> Self {
        Self {
            event_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn after_task(task_id: impl Into<String>) -> Self {
        Self {
            dependency_task_id: Some(task_id.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_puts_critical_first() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert!(TaskPriority::Low < TaskPriority::Idle);
    }

    #[test]
    fn position_match_within_tolerances() {
        let trigger = OrbitPosition::new(550.0, 45.0, 90.0);
        assert!(OrbitPosition::new(555.0, 47.0, 88.0).matches(&trigger));
        assert!(!OrbitPosition::new(550.0, 0.0, 0.0).matches(&trigger));
        assert!(!OrbitPosition::new(580.0, 45.0, 90.0).matches(&trigger));
    }

    #[test]
    fn longitude_wraps_through_antimeridian() {
        let trigger = OrbitPosition::new(550.0, 0.0, 179.0);
        assert!(OrbitPosition::new(550.0, 0.0, -178.0).matches(&trigger));
        assert!(!OrbitPosition::new(550.0, 0.0, -170.0).matches(&trigger));
    }

    #[test]
    fn metadata_overrides_context_defaults() {
        let task = Task::new("ctx", TaskType::Maintenance, |_| true)
            .with_metadata("cpu_time_limit_ms", "250")
            .with_metadata("allow_critical_subsystems", "true");
        let context = task.build_context(&TaskContext::default());
        assert_eq!(context.cpu_time_limit_ms, 250);
        assert!(context.allow_critical_subsystems);
        assert_eq!(context.memory_limit_bytes, 1024 * 1024);
    }
}
