//! # Radiation-Tolerant Satellite Executive
//!
//! Core flight software for a small LEO spacecraft: an orbital task
//! scheduler with TMR execution and recovery strategies, a mode-based power
//! manager, and a command-and-control arbitrator, all built over a shared
//! data-integrity substrate that protects critical mutable state against
//! single-event upsets.
//!
//! ## Quick Start
//!
//! ```no_run
//! use satexec::executive::{ExecutiveConfig, SatelliteExecutive};
//! use satexec::health::{RadiationReading, StaticRadiationSensor, StaticTemperatureSensor};
//! use satexec::rf::LoopbackTransceiver;
//!
//! let executive = SatelliteExecutive::new(
//!     ExecutiveConfig::default(),
//!     Box::new(LoopbackTransceiver::new()),
//!     Box::new(StaticRadiationSensor {
//!         reading: RadiationReading {
//!             total_dose_rads: 0.0,
//!             dose_rate_rads_per_hour: 0.5,
//!             seu_count: 0,
//!         },
//!     }),
//!     Box::new(StaticTemperatureSensor { temperature_c: 20.0 }),
//! )
//! .expect("transceiver init failed");
//!
//! executive.start();
//! executive.update(1000);
//! executive.stop();
//! ```
//!
//! ## Architecture
//!
//! - [`integrity`] - TMR voting cells, scrubbing, SEU accounting
//! - [`power`] - power mode state machine and subsystem budget table
//! - [`scheduler`] - prioritized/conditional/recurring task execution
//! - [`command`] - command validation, dispatch, telemetry, safe mode
//! - [`health`] - radiation/temperature intake and status callbacks
//! - [`rf`] - transceiver driver contract and controller handle
//! - [`protocol`] - uplink/downlink wire formats
//! - [`executive`] - the owning assembly

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod executive;
pub mod health;
pub mod integrity;
pub mod power;
pub mod protocol;
pub mod rf;
pub mod scheduler;
pub mod subsystems;
pub mod task;

pub use command::CommandControl;
pub use executive::SatelliteExecutive;
pub use integrity::{ProtectedCell, ScrubOutcome, SeuCounters};
pub use power::{PowerManager, PowerMode};
pub use protocol::{Command, TelemetryPacket};
pub use scheduler::OrbitalTaskScheduler;
pub use subsystems::SubsystemId;
pub use task::{Task, TaskPriority, TaskStatus};
