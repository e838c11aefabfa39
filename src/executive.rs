//! The satellite executive assembly: owns every subsystem, wires the
//! cross-component hooks, and drives the periodic update tick.
//!
//! Ownership is deliberately acyclic: the executive owns the power manager,
//! scheduler, health monitor, RF controller, and command arbitrator; the
//! arbitrator holds shared read-capability handles to the others and the
//! assembly outlives them all.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::command::{CommandControl, TrustAnchors};
use crate::health::{
    ComponentType, HealthMonitor, RadiationSensor, TemperatureSensor,
};
use crate::integrity::SeuCounters;
use crate::power::{PowerManager, PowerMode};
use crate::rf::{RfController, RfPowerState, Transceiver};
use crate::scheduler::OrbitalTaskScheduler;
use crate::subsystems::SubsystemId;

/// Assembly configuration.
pub struct ExecutiveConfig {
    pub trust_anchors: TrustAnchors,
    pub scheduler_tick: Duration,
    pub health_poll_interval: Duration,
    pub initial_battery_soc: f32,
}

impl Default for ExecutiveConfig {
    fn default() -> Self {
        Self {
            trust_anchors: TrustAnchors::new(),
            scheduler_tick: Duration::from_millis(1000),
            health_poll_interval: Duration::from_millis(1000),
            initial_battery_soc: 0.75,
        }
    }
}

pub struct SatelliteExecutive {
    counters: Arc<SeuCounters>,
    power: Arc<PowerManager>,
    scheduler: Arc<OrbitalTaskScheduler>,
    health: Arc<HealthMonitor>,
    rf: Arc<RfController>,
    command: Arc<CommandControl>,
}

impl SatelliteExecutive {
    pub fn new(
        config: ExecutiveConfig,
        transceiver: Box<dyn Transceiver>,
        radiation_sensor: Box<dyn RadiationSensor>,
        temperature_sensor: Box<dyn TemperatureSensor>,
    ) -> Result<Self, crate::rf::RfError> {
        let counters = SeuCounters::new();

        let power = Arc::new(PowerManager::new(Arc::clone(&counters)));
        power.initialize(&SubsystemId::ALL);
        power.set_battery_soc(config.initial_battery_soc);

        let scheduler = Arc::new(OrbitalTaskScheduler::with_tick_interval(
            config.scheduler_tick,
        ));

        let health = Arc::new(HealthMonitor::with_poll_interval(
            radiation_sensor,
            temperature_sensor,
            Arc::clone(&counters),
            config.health_poll_interval,
        ));
        health.register_component(ComponentType::Processor, "obc");
        health.register_component(ComponentType::PowerSystem, "eps");
        health.register_component(ComponentType::CommunicationSystem, "rf-front-end");
        health.register_component(ComponentType::AttitudeControl, "adcs");
        health.register_component(ComponentType::ThermalControl, "thermal");
        health.register_component(ComponentType::Payload, "payload");

        let rf = Arc::new(RfController::new(transceiver)?);

        let command = Arc::new(CommandControl::new(
            Arc::clone(&power),
            Arc::clone(&scheduler),
            Arc::clone(&health),
            Arc::clone(&rf),
            config.trust_anchors,
        ));

        // Safe-mode recovery strategy reaches the arbitrator through the
        // scheduler hook rather than a direct dependency.
        let safe_mode_target = Arc::clone(&command);
        scheduler.set_safe_mode_hook(move |task_id| {
            safe_mode_target.enter_safe_mode(0x7A5C, task_id);
        });

        power.register_warning_callback(|mode| {
            if mode >= PowerMode::Critical {
                warn!(%mode, "power mode warning");
            } else {
                info!(%mode, "power mode changed");
            }
        });

        Ok(Self {
            counters,
            power,
            scheduler,
            health,
            rf,
            command,
        })
    }

    /// Start the worker threads and bring the survival subsystems up.
    pub fn start(&self) -> bool {
        info!("satellite executive starting");
        if !self.scheduler.start() {
            return false;
        }
        self.health.start();

        // Baseline loadout; failures leave the subsystem off and the power
        // budget intact.
        for (subsystem, level) in [
            (SubsystemId::Obc, 0.4),
            (SubsystemId::Thermal, 0.3),
            (SubsystemId::Sensors, 0.3),
        ] {
            if let Err(err) = self.power.enable(subsystem, level) {
                warn!(%subsystem, %err, "baseline enable failed");
            }
        }
        if self.rf.set_power_state(RfPowerState::Active).is_err() {
            warn!("transceiver failed to activate");
        }
        info!("satellite executive ready");
        true
    }

    pub fn stop(&self) {
        info!("satellite executive stopping");
        self.health.stop();
        self.scheduler.stop();
        let _ = self.rf.set_power_state(RfPowerState::Standby);
    }

    /// One periodic executive tick: power update (battery-driven mode
    /// machine plus scrubbing) and command queue drain.
    pub fn update(&self, dt_ms: u32) {
        self.power.update(dt_ms);
        self.command.process_queues();
    }

    pub fn power(&self) -> &Arc<PowerManager> {
        &self.power
    }

    pub fn scheduler(&self) -> &Arc<OrbitalTaskScheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn rf(&self) -> &Arc<RfController> {
        &self.rf
    }

    pub fn command(&self) -> &Arc<CommandControl> {
        &self.command
    }

    pub fn seu_counters(&self) -> &Arc<SeuCounters> {
        &self.counters
    }
}
