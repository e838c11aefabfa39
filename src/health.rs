//! Health monitor intake: periodic radiation/temperature sampling, component
//! health recomputation, and status-change callback dispatch.
//!
//! Sensor hardware stays behind the [`RadiationSensor`] and
//! [`TemperatureSensor`] contracts. The presentation layer (ground report
//! formatting) is intentionally thin; only measurement intake and callback
//! fan-out are flight logic.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::integrity::SeuCounters;

/// Sentinel a temperature sensor returns for an invalid reading.
pub const INVALID_TEMPERATURE_C: f32 = -273.15;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HealthStatus {
    Nominal,
    Degraded,
    Warning,
    Critical,
    Failed,
    Unknown,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ComponentType {
    PowerSystem,
    CommunicationSystem,
    ThermalControl,
    AttitudeControl,
    Propulsion,
    Payload,
    Processor,
    Memory,
    Sensor,
}

/// Radiation environment sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RadiationData {
    pub total_dose_rads: f32,
    pub dose_rate_rads_per_hour: f32,
    pub single_event_upsets: u64,
    pub timestamp: SystemTime,
}

impl Default for RadiationData {
    fn default() -> Self {
        Self {
            total_dose_rads: 0.0,
            dose_rate_rads_per_hour: 0.0,
            single_event_upsets: 0,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureData {
    pub temperature_celsius: f32,
    pub component: ComponentType,
    pub sensor_id: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component_type: ComponentType,
    pub component_id: String,
    pub status: HealthStatus,
    pub health_percentage: f32,
    pub diagnostic_info: String,
    pub last_updated: SystemTime,
}

/// Raw sensor reading contract for the radiation monitor hardware.
pub trait RadiationSensor: Send {
    fn read(&mut self) -> RadiationReading;
}

#[derive(Debug, Clone, Copy)]
pub struct RadiationReading {
    pub total_dose_rads: f32,
    pub dose_rate_rads_per_hour: f32,
    pub seu_count: u64,
}

/// Raw sensor reading contract for temperature hardware. Returns
/// [`INVALID_TEMPERATURE_C`] when the sensor cannot produce a reading.
pub trait TemperatureSensor: Send {
    fn read(&mut self, component: ComponentType, sensor_id: &str) -> f32;
}

pub type HealthStatusCallback = Box<dyn Fn(&ComponentHealth) + Send + Sync>;

struct ComponentRecord {
    health: ComponentHealth,
    registered_at: SystemTime,
}

struct CallbackEntry {
    id: u32,
    filter_type: ComponentType,
    callback: HealthStatusCallback,
}

struct HealthState {
    components: HashMap<String, ComponentRecord>,
    radiation: RadiationData,
    temperatures: HashMap<String, TemperatureData>,
}

struct HealthShared {
    running: AtomicBool,
    state: Mutex<HealthState>,
    callbacks: Mutex<Vec<CallbackEntry>>,
    radiation_sensor: Mutex<Box<dyn RadiationSensor>>,
    temperature_sensor: Mutex<Box<dyn TemperatureSensor>>,
    counters: Arc<SeuCounters>,
    next_callback_id: AtomicU32,
    poll_interval: Duration,
}

/// The health monitor. `start` spawns the sampling thread; `sample_once`
/// runs one tick synchronously for deterministic callers.
pub struct HealthMonitor {
    shared: Arc<HealthShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        radiation_sensor: Box<dyn RadiationSensor>,
        temperature_sensor: Box<dyn TemperatureSensor>,
        counters: Arc<SeuCounters>,
    ) -> Self {
        Self::with_poll_interval(
            radiation_sensor,
            temperature_sensor,
            counters,
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        )
    }

    pub fn with_poll_interval(
        radiation_sensor: Box<dyn RadiationSensor>,
        temperature_sensor: Box<dyn TemperatureSensor>,
        counters: Arc<SeuCounters>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(HealthShared {
                running: AtomicBool::new(false),
                state: Mutex::new(HealthState {
                    components: HashMap::new(),
                    radiation: RadiationData::default(),
                    temperatures: HashMap::new(),
                }),
                callbacks: Mutex::new(Vec::new()),
                radiation_sensor: Mutex::new(radiation_sensor),
                temperature_sensor: Mutex::new(temperature_sensor),
                counters,
                next_callback_id: AtomicU32::new(1),
                poll_interval,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register a component for health tracking, seeded NOMINAL at 100%.
    pub fn register_component(&self, component_type: ComponentType, component_id: &str) {
        let mut state = self.shared.state.lock().expect("health state poisoned");
        let now = SystemTime::now();
        state.components.insert(
            component_id.to_string(),
            ComponentRecord {
                health: ComponentHealth {
                    component_type,
                    component_id: component_id.to_string(),
                    status: HealthStatus::Nominal,
                    health_percentage: 100.0,
                    diagnostic_info: String::new(),
                    last_updated: now,
                },
                registered_at: now,
            },
        );
    }

    /// Spawn the periodic sampling thread.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("health monitoring loop started");
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("health-mon".into())
            .spawn(move || {
                while shared.running.load(Ordering::SeqCst) {
                    sample_tick(&shared, shared.poll_interval.as_millis() as u64);
                    std::thread::sleep(shared.poll_interval);
                }
                info!("health monitoring loop stopped");
            })
            .expect("failed to spawn health monitor thread");
        *self.worker.lock().expect("worker slot poisoned") = Some(handle);
        true
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.lock().expect("worker slot poisoned").take() {
            let _ = handle.join();
        }
    }

    /// One synchronous sampling tick covering `elapsed_ms` of dose
    /// integration. The periodic thread calls this with the poll interval.
    pub fn sample_once(&self, elapsed_ms: u64) {
        sample_tick(&self.shared, elapsed_ms);
    }

    pub fn component_health(&self, component_id: &str) -> ComponentHealth {
        let state = self.shared.state.lock().expect("health state poisoned");
        state
            .components
            .get(component_id)
            .map(|record| record.health.clone())
            .unwrap_or_else(|| ComponentHealth {
                component_type: ComponentType::Processor,
                component_id: component_id.to_string(),
                status: HealthStatus::Unknown,
                health_percentage: 0.0,
                diagnostic_info: String::new(),
                last_updated: SystemTime::now(),
            })
    }

    pub fn all_component_health(&self) -> Vec<ComponentHealth> {
        let state = self.shared.state.lock().expect("health state poisoned");
        state
            .components
            .values()
            .map(|record| record.health.clone())
            .collect()
    }

    pub fn radiation_data(&self) -> RadiationData {
        self.shared
            .state
            .lock()
            .expect("health state poisoned")
            .radiation
    }

    pub fn temperature(&self, component: ComponentType, sensor_id: &str) -> TemperatureData {
        let state = self.shared.state.lock().expect("health state poisoned");
        let key = temperature_key(component, sensor_id);
        state
            .temperatures
            .get(&key)
            .cloned()
            .unwrap_or(TemperatureData {
                temperature_celsius: 0.0,
                component,
                sensor_id: sensor_id.to_string(),
                timestamp: SystemTime::now(),
            })
    }

    /// Register a status-change callback filtered by component type.
    pub fn register_status_callback<F>(&self, callback: F, filter_type: ComponentType) -> u32
    where
        F: Fn(&ComponentHealth) + Send + Sync + 'static,
    {
        let id = self.shared.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .callbacks
            .lock()
            .expect("callbacks poisoned")
            .push(CallbackEntry {
                id,
                filter_type,
                callback: Box::new(callback),
            });
        id
    }

    pub fn unregister_status_callback(&self, callback_id: u32) {
        self.shared
            .callbacks
            .lock()
            .expect("callbacks poisoned")
            .retain(|entry| entry.id != callback_id);
    }

    /// Format and log the ground health report. Returns the report text so
    /// the command layer can downlink it.
    pub fn report_to_ground(&self, full_report: bool) -> String {
        let state = self.shared.state.lock().expect("health state poisoned");
        let mut report = format!(
            "Health Status Report - {}\n",
            if full_report { "Full" } else { "Summary" }
        );
        report.push_str(&format!(
            "Radiation - Total Dose: {:.3} rads, Rate: {:.3} rads/hour, SEUs: {}\n",
            state.radiation.total_dose_rads,
            state.radiation.dose_rate_rads_per_hour,
            state.radiation.single_event_upsets
        ));
        for record in state.components.values() {
            let health = &record.health;
            report.push_str(&format!(
                "Component {} - Status: {:?}, Health: {:.1}%\n",
                health.component_id, health.status, health.health_percentage
            ));
            if full_report && !health.diagnostic_info.is_empty() {
                report.push_str(&format!("  Info: {}\n", health.diagnostic_info));
            }
        }
        info!("sending health report to ground");
        report
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn temperature_key(component: ComponentType, sensor_id: &str) -> String {
    if sensor_id.is_empty() {
        format!("{:?}", component)
    } else {
        sensor_id.to_string()
    }
}

fn sample_tick(shared: &HealthShared, elapsed_ms: u64) {
    // Read hardware outside the state lock.
    let reading = shared
        .radiation_sensor
        .lock()
        .expect("radiation sensor poisoned")
        .read();

    let component_keys: Vec<(ComponentType, String)> = {
        let state = shared.state.lock().expect("health state poisoned");
        state
            .components
            .values()
            .map(|record| {
                (
                    record.health.component_type,
                    record.health.component_id.clone(),
                )
            })
            .collect()
    };

    let mut temperature_samples = Vec::with_capacity(component_keys.len());
    {
        let mut sensor = shared
            .temperature_sensor
            .lock()
            .expect("temperature sensor poisoned");
        for (component, _) in &component_keys {
            temperature_samples.push(sensor.read(*component, ""));
        }
    }

    let mut changed: Vec<ComponentHealth> = Vec::new();
    {
        let mut state = shared.state.lock().expect("health state poisoned");

        state.radiation.dose_rate_rads_per_hour = reading.dose_rate_rads_per_hour;
        // Integrate the dose rate over the elapsed interval, ms -> hours.
        // A sensor that reports its own cumulative total acts as a floor;
        // the tick's contribution is never added on top of it.
        let integrated = state.radiation.total_dose_rads
            + reading.dose_rate_rads_per_hour * (elapsed_ms as f32 / 3_600_000.0);
        state.radiation.total_dose_rads = integrated.max(reading.total_dose_rads);
        state.radiation.single_event_upsets =
            reading.seu_count + shared.counters.total_upsets();
        state.radiation.timestamp = SystemTime::now();

        let dose_rate = state.radiation.dose_rate_rads_per_hour;
        let now = SystemTime::now();

        for ((component, component_id), temperature) in
            component_keys.iter().zip(temperature_samples.iter())
        {
            let key = temperature_key(*component, "");
            state.temperatures.insert(
                key,
                TemperatureData {
                    temperature_celsius: *temperature,
                    component: *component,
                    sensor_id: String::new(),
                    timestamp: now,
                },
            );

            let Some(record) = state.components.get_mut(component_id) else {
                continue;
            };

            let age_hours = now
                .duration_since(record.registered_at)
                .unwrap_or_default()
                .as_secs_f32()
                / 3600.0;

            let (percentage, diagnostic) =
                health_percentage(*temperature, dose_rate, age_hours);
            let status = if *temperature > 100.0 {
                HealthStatus::Critical
            } else {
                status_for_percentage(percentage)
            };

            record.health.health_percentage = percentage;
            record.health.diagnostic_info = diagnostic;
            record.health.last_updated = now;

            if record.health.status != status {
                record.health.status = status;
                changed.push(record.health.clone());
            }
        }
    }

    // Fan out status changes outside the state lock.
    if !changed.is_empty() {
        let callbacks = shared.callbacks.lock().expect("callbacks poisoned");
        for health in &changed {
            if health.status >= HealthStatus::Warning {
                warn!(
                    component = %health.component_id,
                    status = ?health.status,
                    health = health.health_percentage,
                    "component health status changed"
                );
            }
            for entry in callbacks.iter() {
                if entry.filter_type != health.component_type {
                    continue;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| (entry.callback)(health)));
                if outcome.is_err() {
                    error!(callback = entry.id, "health status callback panicked");
                }
            }
        }
    }
}

/// Health percentage from the lowest of the temperature, radiation, and
/// age factors, clamped to [0, 100].
fn health_percentage(temperature_c: f32, dose_rate: f32, age_hours: f32) -> (f32, String) {
    let mut diagnostics = Vec::new();

    let temp_factor = if temperature_c <= INVALID_TEMPERATURE_C + 1.0 {
        // Invalid sensor reading: no temperature contribution.
        1.0
    } else {
        if temperature_c > 60.0 {
            diagnostics.push("temperature elevated");
        }
        1.0 - (temperature_c - 60.0).max(0.0) / 40.0
    };

    let radiation_factor = {
        if dose_rate > 100.0 {
            diagnostics.push("high radiation exposure");
        }
        1.0 - (dose_rate - 100.0).max(0.0) / 1900.0
    };

    let time_factor = 1.0 - age_hours / 8760.0;

    let percentage =
        (100.0 * temp_factor.min(radiation_factor).min(time_factor)).clamp(0.0, 100.0);
    (percentage, diagnostics.join("; "))
}

fn status_for_percentage(percentage: f32) -> HealthStatus {
    if percentage >= 80.0 {
        HealthStatus::Nominal
    } else if percentage >= 50.0 {
        HealthStatus::Degraded
    } else if percentage >= 20.0 {
        HealthStatus::Warning
    } else if percentage > 5.0 {
        HealthStatus::Critical
    } else {
        HealthStatus::Failed
    }
}

/// Fixed-value sensors for tests and the simulator.
pub struct StaticRadiationSensor {
    pub reading: RadiationReading,
}

impl RadiationSensor for StaticRadiationSensor {
    fn read(&mut self) -> RadiationReading {
        self.reading
    }
}

pub struct StaticTemperatureSensor {
    pub temperature_c: f32,
}

impl TemperatureSensor for StaticTemperatureSensor {
    fn read(&mut self, _component: ComponentType, _sensor_id: &str) -> f32 {
        self.temperature_c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(temperature_c: f32, dose_rate: f32) -> HealthMonitor {
        HealthMonitor::new(
            Box::new(StaticRadiationSensor {
                reading: RadiationReading {
                    total_dose_rads: 0.0,
                    dose_rate_rads_per_hour: dose_rate,
                    seu_count: 0,
                },
            }),
            Box::new(StaticTemperatureSensor { temperature_c }),
            SeuCounters::new(),
        )
    }

    #[test]
    fn nominal_conditions_stay_nominal() {
        let hm = monitor(25.0, 10.0);
        hm.register_component(ComponentType::Processor, "obc-0");
        hm.sample_once(1000);
        let health = hm.component_health("obc-0");
        assert_eq!(health.status, HealthStatus::Nominal);
        assert!(health.health_percentage > 99.0);
    }

    #[test]
    fn elevated_temperature_degrades_health() {
        // temp_factor at 85 C = 1 - 25/40 = 0.375 -> WARNING band.
        let hm = monitor(85.0, 10.0);
        hm.register_component(ComponentType::ThermalControl, "radiator-1");
        hm.sample_once(1000);
        let health = hm.component_health("radiator-1");
        assert_eq!(health.status, HealthStatus::Warning);
        assert!((health.health_percentage - 37.5).abs() < 0.5);
    }

    #[test]
    fn overlimit_temperature_is_critical() {
        let hm = monitor(105.0, 10.0);
        hm.register_component(ComponentType::Payload, "camera-0");
        hm.sample_once(1000);
        assert_eq!(
            hm.component_health("camera-0").status,
            HealthStatus::Critical
        );
    }

    #[test]
    fn radiation_dominates_when_lowest_factor() {
        // radiation_factor at 2000 rads/h = 0.0 -> FAILED.
        let hm = monitor(25.0, 2000.0);
        hm.register_component(ComponentType::Memory, "sram-0");
        hm.sample_once(1000);
        assert_eq!(hm.component_health("sram-0").status, HealthStatus::Failed);
    }

    #[test]
    fn dose_integrates_over_elapsed_time() {
        let hm = monitor(25.0, 100.0);
        hm.register_component(ComponentType::Processor, "obc-0");
        // One hour of sampling at 100 rads/hour.
        hm.sample_once(3_600_000);
        let radiation = hm.radiation_data();
        assert!((radiation.total_dose_rads - 100.0).abs() < 1.0);
    }

    #[test]
    fn callbacks_fire_only_on_status_change() {
        use std::sync::atomic::AtomicUsize;
        let hm = monitor(85.0, 10.0);
        hm.register_component(ComponentType::Processor, "obc-0");

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        hm.register_status_callback(
            move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
            },
            ComponentType::Processor,
        );

        hm.sample_once(1000);
        hm.sample_once(1000);
        // Status changed once (Nominal -> Warning), then held steady.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_filter_by_component_type() {
        use std::sync::atomic::AtomicUsize;
        let hm = monitor(85.0, 10.0);
        hm.register_component(ComponentType::Processor, "obc-0");

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        hm.register_status_callback(
            move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
            },
            ComponentType::Payload,
        );
        hm.sample_once(1000);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_component_reports_unknown() {
        let hm = monitor(25.0, 0.0);
        assert_eq!(
            hm.component_health("ghost").status,
            HealthStatus::Unknown
        );
    }
}
