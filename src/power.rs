//! Power management: mode state machine, per-subsystem enable/level table,
//! solar/battery accounting, and RF allocation slots.
//!
//! Every mode write and every subsystem-table mutation lands in a
//! [`ProtectedCell`]; every public read goes through a vote. The manager's
//! internal methods take `&mut PowerCore` and assume the caller already
//! holds the manager lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::integrity::{discrete_majority, ProtectedCell, Redundant, ScrubOutcome, SeuCounters};
use crate::subsystems::SubsystemId;

// Battery thresholds driving automatic mode transitions.
const MINIMUM_BATTERY_THRESHOLD: f32 = 0.15;
const LOW_POWER_THRESHOLD: f32 = 0.30;
const CRITICAL_THRESHOLD: f32 = 0.20;
const EMERGENCY_THRESHOLD: f32 = 0.10;
const NORMAL_RECOVERY_THRESHOLD: f32 = 0.40;

/// Nominal draw of an RF transmission burst at full level.
pub const RF_BURST_BASE_W: f32 = 2.5;

/// Usable battery capacity in watt-hours.
const BATTERY_CAPACITY_WH: f32 = 10.0;

const SYSTEM_EFFICIENCY: f32 = 0.95;
/// Derating for displacement damage in the power electronics. Tunable;
/// retained from flight heritage rather than derived.
const RADIATION_DERATING: f32 = 0.98;

const SOLAR_PANEL_COUNT: usize = 6;

/// Power modes, strictly ordered by austerity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PowerMode {
    Normal,
    LowPower,
    Critical,
    Emergency,
    Hibernation,
}

impl PowerMode {
    pub fn from_wire(value: u8) -> Option<PowerMode> {
        match value {
            0 => Some(PowerMode::Normal),
            1 => Some(PowerMode::LowPower),
            2 => Some(PowerMode::Critical),
            3 => Some(PowerMode::Emergency),
            4 => Some(PowerMode::Hibernation),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PowerMode::Normal => 0,
            PowerMode::LowPower => 1,
            PowerMode::Critical => 2,
            PowerMode::Emergency => 3,
            PowerMode::Hibernation => 4,
        }
    }
}

impl Redundant for PowerMode {
    fn vote(replicas: &[Self]) -> Option<Self> {
        discrete_majority(replicas)
    }

    fn matches(&self, other: &Self) -> bool {
        self == other
    }

    fn corrupt_bit(&mut self, bit_offset: u32) {
        let flipped = self.to_wire() ^ (1 << (bit_offset % 3));
        *self = PowerMode::from_wire(flipped % 5).unwrap_or(PowerMode::Hibernation);
    }
}

impl core::fmt::Display for PowerMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            PowerMode::Normal => "NORMAL",
            PowerMode::LowPower => "LOW_POWER",
            PowerMode::Critical => "CRITICAL",
            PowerMode::Emergency => "EMERGENCY",
            PowerMode::Hibernation => "HIBERNATION",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSource {
    SolarPanel,
    Battery,
    BackupBattery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSourceStatus {
    pub source: PowerSource,
    pub voltage_v: f32,
    pub current_a: f32,
    pub temperature_c: f32,
    pub state_of_charge: f32,
    pub last_updated: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConsumption {
    pub subsystem: SubsystemId,
    pub average_w: f32,
    pub peak_w: f32,
    pub current_w: f32,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerBudget {
    pub total_available_w: f32,
    pub total_consumption_w: f32,
    pub projected_available_w: f32,
    pub subsystems: Vec<PowerConsumption>,
    pub mode: PowerMode,
    pub battery_reserve_wh: f32,
    pub solar_input_w: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerError {
    InvalidParameter,
    InsufficientPower,
    SubsystemNotManaged,
}

impl core::fmt::Display for PowerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PowerError::InvalidParameter => write!(f, "invalid parameter"),
            PowerError::InsufficientPower => write!(f, "insufficient power available"),
            PowerError::SubsystemNotManaged => write!(f, "subsystem not managed"),
        }
    }
}

impl std::error::Error for PowerError {}

/// TMR-protected entry in the subsystem table.
#[derive(Debug)]
struct SubsystemCell {
    enabled: ProtectedCell<bool>,
    level: ProtectedCell<f32>,
}

impl SubsystemCell {
    fn new() -> Self {
        Self {
            enabled: ProtectedCell::new(false),
            level: ProtectedCell::new(0.0),
        }
    }
}

/// Mutable power state. Held behind the manager's mutex.
struct PowerCore {
    mode: ProtectedCell<PowerMode>,
    table: Vec<(SubsystemId, SubsystemCell)>,
    rf_standard: ProtectedCell<f32>,
    rf_burst: ProtectedCell<f32>,
    rf_emergency: ProtectedCell<f32>,
    panel_efficiencies: [f32; SOLAR_PANEL_COUNT],
    main_battery_health: f32,
    backup_battery_health: f32,
    battery_soc: f32,
}

impl PowerCore {
    fn new() -> Self {
        Self {
            mode: ProtectedCell::new(PowerMode::Normal),
            table: Vec::new(),
            rf_standard: ProtectedCell::new(0.8),
            rf_burst: ProtectedCell::new(1.0),
            rf_emergency: ProtectedCell::new(0.9),
            panel_efficiencies: [0.95; SOLAR_PANEL_COUNT],
            main_battery_health: 1.0,
            backup_battery_health: 1.0,
            battery_soc: 0.75,
        }
    }

    fn cell(&self, subsystem: SubsystemId) -> Option<&SubsystemCell> {
        self.table
            .iter()
            .find(|(id, _)| *id == subsystem)
            .map(|(_, cell)| cell)
    }

    fn cell_mut(&mut self, subsystem: SubsystemId) -> Option<&mut SubsystemCell> {
        self.table
            .iter_mut()
            .find(|(id, _)| *id == subsystem)
            .map(|(_, cell)| cell)
    }

    fn is_enabled(&self, subsystem: SubsystemId) -> bool {
        self.cell(subsystem).map_or(false, |c| c.enabled.read())
    }

    fn level(&self, subsystem: SubsystemId) -> f32 {
        self.cell(subsystem).map_or(0.0, |c| c.level.read())
    }

    fn set_level(&mut self, subsystem: SubsystemId, level: f32) {
        if let Some(cell) = self.cell_mut(subsystem) {
            cell.level.store(level.clamp(0.0, 1.0));
        }
    }

    fn set_enabled(&mut self, subsystem: SubsystemId, enabled: bool, level: f32) {
        if let Some(cell) = self.cell_mut(subsystem) {
            cell.enabled.store(enabled);
            cell.level.store(if enabled { level.clamp(0.0, 1.0) } else { 0.0 });
        }
    }

    fn avg_panel_efficiency(&self) -> f32 {
        self.panel_efficiencies.iter().sum::<f32>() / SOLAR_PANEL_COUNT as f32
    }

    fn source_status(&self, source: PowerSource) -> PowerSourceStatus {
        match source {
            PowerSource::SolarPanel => {
                let efficiency = self.avg_panel_efficiency();
                PowerSourceStatus {
                    source,
                    voltage_v: 5.0 * efficiency,
                    current_a: 0.2 * efficiency,
                    temperature_c: 25.0,
                    state_of_charge: 1.0,
                    last_updated: SystemTime::now(),
                }
            }
            PowerSource::Battery => PowerSourceStatus {
                source,
                voltage_v: 3.7 * self.main_battery_health,
                current_a: 0.5,
                temperature_c: 20.0,
                state_of_charge: self.battery_soc * self.main_battery_health,
                last_updated: SystemTime::now(),
            },
            PowerSource::BackupBattery => PowerSourceStatus {
                source,
                voltage_v: 3.7 * self.backup_battery_health,
                current_a: 0.1,
                temperature_c: 18.0,
                state_of_charge: 0.95 * self.backup_battery_health,
                last_updated: SystemTime::now(),
            },
        }
    }

    fn consumption_w(&self) -> f32 {
        self.table
            .iter()
            .filter(|(_, cell)| cell.enabled.read())
            .map(|(id, cell)| id.base_power_w() * cell.level.read())
            .sum()
    }

    fn available_w(&self) -> f32 {
        let solar = self.source_status(PowerSource::SolarPanel);
        let mut total = solar.voltage_v * solar.current_a;

        let battery = self.source_status(PowerSource::Battery);
        if battery.state_of_charge > 0.1 {
            total += battery.voltage_v * battery.current_a;
        }

        total * SYSTEM_EFFICIENCY * RADIATION_DERATING
    }

    /// Rewrite subsystem levels for the target mode. Assumes the manager
    /// lock is held; callbacks run after the lock is released.
    fn apply_mode_policy(&mut self, from: PowerMode, to: PowerMode) {
        let rf_standard = self.rf_standard.read();
        let rf_emergency = self.rf_emergency.read();

        match to {
            PowerMode::Normal => {
                if self.is_enabled(SubsystemId::Rf) {
                    self.set_level(SubsystemId::Rf, rf_standard);
                }
                for id in [
                    SubsystemId::Obc,
                    SubsystemId::Adcs,
                    SubsystemId::Thermal,
                    SubsystemId::Payload,
                    SubsystemId::Sensors,
                ] {
                    if self.is_enabled(id) {
                        self.set_level(id, 1.0);
                    }
                }
            }
            PowerMode::LowPower => {
                if self.is_enabled(SubsystemId::Rf) {
                    self.set_level(SubsystemId::Rf, rf_standard * 0.7);
                }
                if self.is_enabled(SubsystemId::Obc) {
                    self.set_level(SubsystemId::Obc, 0.8);
                }
                if self.is_enabled(SubsystemId::Adcs) {
                    self.set_level(SubsystemId::Adcs, 0.6);
                }
                if self.is_enabled(SubsystemId::Thermal) {
                    self.set_level(SubsystemId::Thermal, 0.7);
                }
                if self.is_enabled(SubsystemId::Payload) {
                    self.set_level(SubsystemId::Payload, 0.5);
                }
                if self.is_enabled(SubsystemId::Sensors) {
                    self.set_level(SubsystemId::Sensors, 0.7);
                }
            }
            PowerMode::Critical => {
                if self.is_enabled(SubsystemId::Rf) {
                    self.set_level(SubsystemId::Rf, rf_emergency);
                }
                if self.is_enabled(SubsystemId::Obc) {
                    self.set_level(SubsystemId::Obc, 0.6);
                }
                if self.is_enabled(SubsystemId::Adcs) {
                    self.set_level(SubsystemId::Adcs, 0.4);
                }
                if self.is_enabled(SubsystemId::Thermal) {
                    self.set_level(SubsystemId::Thermal, 0.5);
                }
                self.set_enabled(SubsystemId::Payload, false, 0.0);
                if self.is_enabled(SubsystemId::Sensors) {
                    self.set_level(SubsystemId::Sensors, 0.5);
                }
            }
            PowerMode::Emergency => {
                if self.is_enabled(SubsystemId::Rf) {
                    self.set_level(SubsystemId::Rf, rf_emergency * 0.8);
                }
                if self.is_enabled(SubsystemId::Obc) {
                    self.set_level(SubsystemId::Obc, 0.4);
                }
                if self.is_enabled(SubsystemId::Adcs) {
                    self.set_level(SubsystemId::Adcs, 0.2);
                }
                if self.is_enabled(SubsystemId::Thermal) {
                    self.set_level(SubsystemId::Thermal, 0.3);
                }
                self.set_enabled(SubsystemId::Payload, false, 0.0);
                if self.is_enabled(SubsystemId::Sensors) {
                    self.set_level(SubsystemId::Sensors, 0.3);
                }
            }
            PowerMode::Hibernation => {
                if self.is_enabled(SubsystemId::Rf) {
                    self.set_level(SubsystemId::Rf, rf_emergency * 0.5);
                }
                if self.is_enabled(SubsystemId::Obc) {
                    self.set_level(SubsystemId::Obc, 0.2);
                }
                for id in [
                    SubsystemId::Adcs,
                    SubsystemId::Thermal,
                    SubsystemId::Payload,
                    SubsystemId::Sensors,
                ] {
                    self.set_enabled(id, false, 0.0);
                }
            }
        }

        if from == PowerMode::Hibernation && to != PowerMode::Hibernation {
            // Warm-up sequence: survival systems come back before the rest.
            info!("executing warm-up sequence out of hibernation");
            if !self.is_enabled(SubsystemId::Obc) {
                self.set_enabled(SubsystemId::Obc, true, 0.5);
            }
            if !self.is_enabled(SubsystemId::Rf) {
                self.set_enabled(SubsystemId::Rf, true, rf_emergency);
            }
            if !self.is_enabled(SubsystemId::Thermal) {
                self.set_enabled(SubsystemId::Thermal, true, 0.7);
            }
        }

        if to == PowerMode::Normal && from != PowerMode::Normal {
            info!("restoring normal mode operations");
            if !self.is_enabled(SubsystemId::Sensors) {
                self.set_enabled(SubsystemId::Sensors, true, 0.8);
            }
            if !self.is_enabled(SubsystemId::Adcs) {
                self.set_enabled(SubsystemId::Adcs, true, 0.7);
            }
        }
    }

    /// Scrub the mode cell, subsystem table, and RF allocation cells.
    /// Returns (any_corrected, any_unrecoverable).
    fn scrub_all(&mut self, counters: &SeuCounters) -> (bool, bool) {
        let mut corrected = false;
        let mut unrecoverable = false;
        let mut fold = |outcome: ScrubOutcome| match outcome {
            ScrubOutcome::Corrected => corrected = true,
            ScrubOutcome::Unrecoverable => unrecoverable = true,
            ScrubOutcome::Clean => {}
        };

        fold(counters.record(self.mode.scrub()));
        for (_, cell) in &mut self.table {
            fold(counters.record(cell.enabled.scrub()));
            fold(counters.record(cell.level.scrub()));
        }
        fold(counters.record(self.rf_standard.scrub()));
        fold(counters.record(self.rf_burst.scrub()));
        fold(counters.record(self.rf_emergency.scrub()));

        (corrected, unrecoverable)
    }
}

type WarningCallback = Box<dyn Fn(PowerMode) + Send + Sync>;

/// The power manager. All mutation goes through this API; the internal
/// state never escapes the lock.
pub struct PowerManager {
    core: Mutex<PowerCore>,
    callbacks: Mutex<Vec<(u32, WarningCallback)>>,
    next_callback_id: AtomicU32,
    counters: Arc<SeuCounters>,
}

impl PowerManager {
    pub fn new(counters: Arc<SeuCounters>) -> Self {
        Self {
            core: Mutex::new(PowerCore::new()),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU32::new(1),
            counters,
        }
    }

    /// Seed the subsystem table. Subsystems absent from the list are not
    /// managed and cannot be enabled.
    pub fn initialize(&self, subsystems: &[SubsystemId]) -> bool {
        {
            let mut core = self.lock_core();
            core.table.clear();
            for subsystem in subsystems {
                core.table.push((*subsystem, SubsystemCell::new()));
            }
            core.scrub_all(&self.counters);

            if core.battery_soc * core.main_battery_health < LOW_POWER_THRESHOLD {
                let from = core.mode.read();
                core.apply_mode_policy(from, PowerMode::LowPower);
                core.mode.store(PowerMode::LowPower);
            }
        }
        self.health_check()
    }

    pub fn set_mode(&self, mode: PowerMode) -> bool {
        let changed = {
            let mut core = self.lock_core();
            let previous = core.mode.read();
            if previous == mode {
                return true;
            }
            info!(from = %previous, to = %mode, "power mode transition");
            core.apply_mode_policy(previous, mode);
            core.mode.store(mode);
            core.scrub_all(&self.counters);
            true
        };
        if changed {
            self.fire_warning_callbacks(mode);
        }
        changed
    }

    pub fn current_mode(&self) -> PowerMode {
        self.lock_core().mode.read()
    }

    /// Enable a subsystem at the given level, gated on available power.
    pub fn enable(&self, subsystem: SubsystemId, level: f32) -> Result<(), PowerError> {
        let mut core = self.lock_core();
        let level = level.clamp(0.0, 1.0);
        if core.cell(subsystem).is_none() {
            return Err(PowerError::SubsystemNotManaged);
        }

        let required = subsystem.base_power_w() * level;
        if core.consumption_w() + required > core.available_w() {
            debug!(%subsystem, level, "enable rejected: insufficient power");
            return Err(PowerError::InsufficientPower);
        }

        core.set_enabled(subsystem, true, level);
        core.scrub_all(&self.counters);
        Ok(())
    }

    pub fn disable(&self, subsystem: SubsystemId) -> Result<(), PowerError> {
        let mut core = self.lock_core();
        if core.cell(subsystem).is_none() {
            return Err(PowerError::SubsystemNotManaged);
        }
        core.set_enabled(subsystem, false, 0.0);
        core.scrub_all(&self.counters);
        Ok(())
    }

    pub fn is_enabled(&self, subsystem: SubsystemId) -> bool {
        self.lock_core().is_enabled(subsystem)
    }

    pub fn level(&self, subsystem: SubsystemId) -> f32 {
        self.lock_core().level(subsystem)
    }

    /// Adjust the level of an already-enabled subsystem.
    pub fn set_level(&self, subsystem: SubsystemId, level: f32) -> Result<(), PowerError> {
        let mut core = self.lock_core();
        if !core.is_enabled(subsystem) {
            return Err(PowerError::SubsystemNotManaged);
        }
        core.set_level(subsystem, level.clamp(0.0, 1.0));
        core.scrub_all(&self.counters);
        Ok(())
    }

    pub fn budget(&self) -> PowerBudget {
        let core = self.lock_core();
        let solar = core.source_status(PowerSource::SolarPanel);
        let battery = core.source_status(PowerSource::Battery);
        let solar_input_w = solar.voltage_v * solar.current_a;

        let subsystems = core
            .table
            .iter()
            .filter(|(_, cell)| cell.enabled.read())
            .map(|(id, cell)| {
                let base = id.base_power_w();
                let (avg_factor, peak_w) = match id {
                    SubsystemId::Rf => (0.7, RF_BURST_BASE_W),
                    SubsystemId::Obc => (0.9, base),
                    SubsystemId::Adcs => (0.8, base * 1.2),
                    SubsystemId::Thermal => (0.6, base * 1.5),
                    SubsystemId::Payload => (0.5, base * 1.8),
                    SubsystemId::Sensors => (0.7, base * 1.1),
                };
                PowerConsumption {
                    subsystem: *id,
                    average_w: base * avg_factor,
                    peak_w,
                    current_w: base * cell.level.read(),
                    active: true,
                }
            })
            .collect();

        PowerBudget {
            total_available_w: core.available_w(),
            total_consumption_w: core.consumption_w(),
            projected_available_w: solar_input_w,
            subsystems,
            mode: core.mode.read(),
            battery_reserve_wh: battery.state_of_charge * BATTERY_CAPACITY_WH,
            solar_input_w,
        }
    }

    pub fn source_status(&self, source: PowerSource) -> PowerSourceStatus {
        self.lock_core().source_status(source)
    }

    /// Platform integration point: the EPS driver reports the measured
    /// battery state of charge here.
    pub fn set_battery_soc(&self, soc: f32) {
        self.lock_core().battery_soc = soc.clamp(0.0, 1.0);
    }

    pub fn set_rf_allocations(
        &self,
        standard: f32,
        burst: f32,
        emergency: f32,
    ) -> Result<(), PowerError> {
        let mut core = self.lock_core();
        if core.cell(SubsystemId::Rf).is_none() {
            return Err(PowerError::SubsystemNotManaged);
        }

        let standard = standard.clamp(0.1, 1.0);
        let burst = burst.clamp(0.2, 1.0);
        let emergency = emergency.clamp(0.3, 1.0);
        core.rf_standard.store(standard);
        core.rf_burst.store(burst);
        core.rf_emergency.store(emergency);

        if core.is_enabled(SubsystemId::Rf) {
            let level = match core.mode.read() {
                PowerMode::Normal => standard,
                PowerMode::LowPower => standard * 0.7,
                PowerMode::Critical => emergency,
                PowerMode::Emergency => emergency * 0.8,
                PowerMode::Hibernation => {
                    core.set_enabled(SubsystemId::Rf, false, 0.0);
                    core.scrub_all(&self.counters);
                    return Ok(());
                }
            };
            core.set_level(SubsystemId::Rf, level);
        }

        core.scrub_all(&self.counters);
        Ok(())
    }

    pub fn rf_allocations(&self) -> (f32, f32, f32) {
        let core = self.lock_core();
        (
            core.rf_standard.read(),
            core.rf_burst.read(),
            core.rf_emergency.read(),
        )
    }

    /// Reserve power for an RF transmission burst. Requires both
    /// instantaneous headroom and enough battery energy for the whole burst.
    pub fn prepare_rf_burst(&self, duration_ms: u32, level: f32) -> Result<(), PowerError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(PowerError::InvalidParameter);
        }
        let mut core = self.lock_core();
        if !core.is_enabled(SubsystemId::Rf) {
            return Err(PowerError::SubsystemNotManaged);
        }

        let burst_power = RF_BURST_BASE_W * level;
        if core.available_w() - core.consumption_w() < burst_power {
            return Err(PowerError::InsufficientPower);
        }

        let battery = core.source_status(PowerSource::Battery);
        let energy_required_ws = burst_power * duration_ms as f32 / 1000.0;
        let energy_available_ws = battery.state_of_charge * BATTERY_CAPACITY_WH * 3600.0;
        if energy_available_ws < energy_required_ws {
            return Err(PowerError::InsufficientPower);
        }

        core.rf_burst.store(level);
        core.scrub_all(&self.counters);
        Ok(())
    }

    /// Check panel efficiencies, battery healths, and replica agreement.
    pub fn health_check(&self) -> bool {
        let mut core = self.lock_core();
        let mut healthy = true;

        for (index, efficiency) in core.panel_efficiencies.iter().enumerate() {
            if *efficiency < 0.6 {
                healthy = false;
                warn!(
                    panel = index,
                    efficiency = *efficiency,
                    "solar panel efficiency degraded"
                );
            }
        }
        if core.main_battery_health < 0.7 {
            healthy = false;
            warn!(
                health = core.main_battery_health,
                "main battery health degraded"
            );
        }
        if core.backup_battery_health < 0.8 {
            healthy = false;
            warn!(
                health = core.backup_battery_health,
                "backup battery health degraded"
            );
        }

        let (corrected, unrecoverable) = core.scrub_all(&self.counters);
        if corrected {
            warn!("replica disagreement found in power state during health check");
            healthy = false;
        }
        healthy && !unrecoverable
    }

    /// Scrub the mode cell plus all subsystem cells. Returns whether any
    /// correction occurred.
    pub fn handle_seu_errors(&self) -> bool {
        let mut core = self.lock_core();
        let (corrected, unrecoverable) = core.scrub_all(&self.counters);
        if corrected {
            info!("corrected radiation-induced error in power state");
        }
        if unrecoverable {
            warn!("unrecoverable replica disagreement in power state");
        }
        corrected
    }

    /// Periodic update: battery-driven mode transitions, budget enforcement,
    /// SEU handling, and a closing scrub pass.
    pub fn update(&self, _dt_ms: u32) {
        let new_mode = {
            let mut core = self.lock_core();
            let soc = core.source_status(PowerSource::Battery).state_of_charge;
            let mode = core.mode.read();

            let target = if soc <= EMERGENCY_THRESHOLD && mode != PowerMode::Emergency {
                Some(PowerMode::Emergency)
            } else if soc <= CRITICAL_THRESHOLD
                && soc > EMERGENCY_THRESHOLD
                && mode != PowerMode::Critical
                && mode != PowerMode::Emergency
            {
                Some(PowerMode::Critical)
            } else if soc <= LOW_POWER_THRESHOLD
                && soc > CRITICAL_THRESHOLD
                && mode == PowerMode::Normal
            {
                Some(PowerMode::LowPower)
            } else if soc >= NORMAL_RECOVERY_THRESHOLD
                && matches!(
                    mode,
                    PowerMode::LowPower | PowerMode::Critical | PowerMode::Emergency
                )
            {
                Some(PowerMode::Normal)
            } else {
                None
            };

            if let Some(target) = target {
                info!(soc, from = %mode, to = %target, "battery-driven mode transition");
                core.apply_mode_policy(mode, target);
                core.mode.store(target);
            }

            // Budget enforcement: shed load, payload first, until consumption
            // fits inside the available envelope.
            let shed_order = [
                SubsystemId::Payload,
                SubsystemId::Sensors,
                SubsystemId::Adcs,
                SubsystemId::Rf,
                SubsystemId::Thermal,
                SubsystemId::Obc,
            ];
            let mut passes = 0;
            while core.consumption_w() > core.available_w() && passes < 32 {
                for id in shed_order {
                    if core.consumption_w() <= core.available_w() {
                        break;
                    }
                    if core.is_enabled(id) {
                        let level = core.level(id) * 0.8;
                        if level < 0.05 {
                            core.set_enabled(id, false, 0.0);
                            warn!(subsystem = %id, "load shed: subsystem disabled");
                        } else {
                            core.set_level(id, level);
                        }
                    }
                }
                passes += 1;
            }

            core.scrub_all(&self.counters);

            debug_assert!(
                core.consumption_w() <= core.available_w() + f32::EPSILON,
                "consumption {} exceeds available {}",
                core.consumption_w(),
                core.available_w()
            );

            target
        };

        if let Some(mode) = new_mode {
            self.fire_warning_callbacks(mode);
        }
    }

    /// Project generation against consumption over the next orbit and step
    /// the mode down pre-emptively when the margin is negative.
    pub fn update_orbit_power_profile(&self, time_in_sunlight_s: u32, time_in_eclipse_s: u32) {
        let (mode_change, current_mode) = {
            let core = self.lock_core();
            let efficiency = core.avg_panel_efficiency();
            let generation_wh = (5.0 * 0.2 * efficiency) * (time_in_sunlight_s as f32 / 3600.0);
            let consumption_wh = core.consumption_w()
                * ((time_in_sunlight_s + time_in_eclipse_s) as f32 / 3600.0);

            if consumption_wh <= generation_wh {
                return;
            }

            let soc = core.source_status(PowerSource::Battery).state_of_charge;
            let projected_soc = soc - (consumption_wh - generation_wh) / BATTERY_CAPACITY_WH;
            let mode = core.mode.read();

            let target = if projected_soc < EMERGENCY_THRESHOLD && mode != PowerMode::Emergency {
                Some(PowerMode::Critical)
            } else if projected_soc < CRITICAL_THRESHOLD && mode != PowerMode::Critical {
                Some(PowerMode::LowPower)
            } else {
                None
            };
            (target, mode)
        };

        if let Some(target) = mode_change {
            if target != current_mode {
                self.set_mode(target);
            }
        }
    }

    /// Restore defaults. A hard reset also restores the simulated hardware
    /// health factors and clears the callback table.
    pub fn reset(&self, hard: bool) -> bool {
        {
            let mut core = self.lock_core();
            core.mode.store(PowerMode::Normal);
            let ids: Vec<SubsystemId> = core.table.iter().map(|(id, _)| *id).collect();
            for id in ids {
                core.set_enabled(id, false, 0.0);
            }
            core.rf_standard.store(0.8);
            core.rf_burst.store(1.0);
            core.rf_emergency.store(0.9);

            if hard {
                core.panel_efficiencies = [0.95; SOLAR_PANEL_COUNT];
                core.main_battery_health = 1.0;
                core.backup_battery_health = 1.0;
            }
            core.scrub_all(&self.counters);
        }

        if hard {
            self.callbacks.lock().expect("callback table poisoned").clear();
            self.next_callback_id.store(1, Ordering::Relaxed);
        }
        true
    }

    pub fn register_warning_callback<F>(&self, callback: F) -> u32
    where
        F: Fn(PowerMode) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .expect("callback table poisoned")
            .push((id, Box::new(callback)));
        id
    }

    pub fn unregister_warning_callback(&self, callback_id: u32) {
        self.callbacks
            .lock()
            .expect("callback table poisoned")
            .retain(|(id, _)| *id != callback_id);
    }

    pub fn seu_counters(&self) -> Arc<SeuCounters> {
        Arc::clone(&self.counters)
    }

    /// White-box SEU injection for the integrity test suite: flip one bit in
    /// the named part of the protected state.
    #[doc(hidden)]
    pub fn inject_mode_bitflip(&self, replica_index: usize, bit_offset: u32) {
        self.lock_core().mode.force_bitflip(replica_index, bit_offset);
    }

    #[doc(hidden)]
    pub fn inject_subsystem_bitflip(
        &self,
        subsystem: SubsystemId,
        replica_index: usize,
        bit_offset: u32,
        target_level: bool,
    ) {
        let mut core = self.lock_core();
        if let Some(cell) = core.cell_mut(subsystem) {
            if target_level {
                cell.level.force_bitflip(replica_index, bit_offset);
            } else {
                cell.enabled.force_bitflip(replica_index, bit_offset);
            }
        }
    }

    fn fire_warning_callbacks(&self, mode: PowerMode) {
        let callbacks = self.callbacks.lock().expect("callback table poisoned");
        for (id, callback) in callbacks.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(mode)
            }));
            if result.is_err() {
                warn!(callback = id, "power warning callback panicked");
            }
        }
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, PowerCore> {
        self.core.lock().expect("power state poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PowerManager {
        let pm = PowerManager::new(SeuCounters::new());
        pm.initialize(&SubsystemId::ALL);
        pm
    }

    #[test]
    fn enable_disable_round_trip() {
        let pm = manager();
        pm.enable(SubsystemId::Obc, 0.5).unwrap();
        assert!(pm.is_enabled(SubsystemId::Obc));
        pm.disable(SubsystemId::Obc).unwrap();
        assert!(!pm.is_enabled(SubsystemId::Obc));
    }

    #[test]
    fn enable_rejects_over_budget_request() {
        let pm = manager();
        // Payload at full level wants 8 W; the platform cannot source it.
        assert_eq!(
            pm.enable(SubsystemId::Payload, 1.0),
            Err(PowerError::InsufficientPower)
        );
    }

    #[test]
    fn set_mode_round_trips_and_notifies() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let pm = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        let id = pm.register_warning_callback(move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pm.set_mode(PowerMode::LowPower));
        assert_eq!(pm.current_mode(), PowerMode::LowPower);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        pm.unregister_warning_callback(id);
        assert!(pm.set_mode(PowerMode::Normal));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn critical_mode_sheds_payload() {
        let pm = manager();
        pm.enable(SubsystemId::Obc, 0.3).unwrap();
        pm.enable(SubsystemId::Payload, 0.1).unwrap();
        pm.set_mode(PowerMode::Critical);
        assert!(!pm.is_enabled(SubsystemId::Payload));
        assert!(pm.is_enabled(SubsystemId::Obc));
    }

    #[test]
    fn hibernation_exit_runs_warm_up() {
        let pm = manager();
        pm.enable(SubsystemId::Obc, 0.3).unwrap();
        pm.set_mode(PowerMode::Hibernation);
        assert!(!pm.is_enabled(SubsystemId::Thermal));
        pm.set_mode(PowerMode::LowPower);
        assert!(pm.is_enabled(SubsystemId::Obc));
        assert!(pm.is_enabled(SubsystemId::Rf));
        assert!(pm.is_enabled(SubsystemId::Thermal));
    }

    #[test]
    fn battery_descent_walks_the_mode_ladder() {
        let pm = manager();
        pm.set_battery_soc(0.75);
        pm.update(1000);
        assert_eq!(pm.current_mode(), PowerMode::Normal);

        pm.set_battery_soc(0.25);
        for _ in 0..3 {
            pm.update(1000);
        }
        assert_eq!(pm.current_mode(), PowerMode::LowPower);

        pm.set_battery_soc(0.18);
        pm.update(1000);
        assert_eq!(pm.current_mode(), PowerMode::Critical);

        pm.set_battery_soc(0.08);
        pm.update(1000);
        assert_eq!(pm.current_mode(), PowerMode::Emergency);

        pm.set_battery_soc(0.45);
        pm.update(1000);
        assert_eq!(pm.current_mode(), PowerMode::Normal);
    }

    #[test]
    fn seu_in_subsystem_table_is_corrected_silently() {
        let pm = manager();
        pm.enable(SubsystemId::Rf, 0.5).unwrap();

        pm.inject_subsystem_bitflip(SubsystemId::Rf, 1, 0, false);
        assert!(pm.is_enabled(SubsystemId::Rf));

        let before = pm.seu_counters().radiation_errors();
        assert!(pm.handle_seu_errors());
        assert_eq!(pm.seu_counters().radiation_errors(), before);
        assert!(pm.is_enabled(SubsystemId::Rf));
        assert!(!pm.handle_seu_errors());
    }

    #[test]
    fn mode_cell_corruption_is_corrected() {
        let pm = manager();
        pm.set_mode(PowerMode::LowPower);
        pm.inject_mode_bitflip(0, 1);
        pm.handle_seu_errors();
        assert_eq!(pm.current_mode(), PowerMode::LowPower);
    }

    #[test]
    fn rf_burst_requires_headroom_and_energy() {
        let pm = manager();
        assert_eq!(
            pm.prepare_rf_burst(1000, 0.5),
            Err(PowerError::SubsystemNotManaged)
        );
        pm.enable(SubsystemId::Rf, 0.2).unwrap();
        assert!(pm.prepare_rf_burst(1000, 0.2).is_ok());
        assert_eq!(
            pm.prepare_rf_burst(1000, 1.5),
            Err(PowerError::InvalidParameter)
        );
    }

    #[test]
    fn budget_stays_within_available_power() {
        let pm = manager();
        pm.enable(SubsystemId::Obc, 0.2).unwrap();
        pm.enable(SubsystemId::Sensors, 0.3).unwrap();
        pm.update(1000);
        let budget = pm.budget();
        assert!(budget.total_consumption_w <= budget.total_available_w);
        assert_eq!(budget.subsystems.len(), 2);
    }

    #[test]
    fn set_level_requires_enabled_subsystem() {
        let pm = manager();
        assert_eq!(
            pm.set_level(SubsystemId::Adcs, 0.5),
            Err(PowerError::SubsystemNotManaged)
        );
        pm.enable(SubsystemId::Adcs, 0.2).unwrap();
        pm.set_level(SubsystemId::Adcs, 0.35).unwrap();
        assert!((pm.level(SubsystemId::Adcs) - 0.35).abs() < 0.01);
    }

    #[test]
    fn orbit_profile_steps_mode_down_preemptively() {
        let pm = manager();
        pm.enable(SubsystemId::Obc, 0.5).unwrap();
        pm.set_battery_soc(0.3);
        // Long eclipse: the projected end-of-orbit charge dips below the
        // critical threshold, so the mode steps down ahead of time.
        pm.update_orbit_power_profile(1800, 3600);
        assert_eq!(pm.current_mode(), PowerMode::LowPower);
    }

    #[test]
    fn reset_restores_defaults() {
        let pm = manager();
        pm.enable(SubsystemId::Obc, 0.4).unwrap();
        pm.set_mode(PowerMode::Critical);
        assert!(pm.reset(true));
        assert_eq!(pm.current_mode(), PowerMode::Normal);
        assert!(!pm.is_enabled(SubsystemId::Obc));
        assert_eq!(pm.rf_allocations(), (0.8, 1.0, 0.9));
    }
}
