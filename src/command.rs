//! Command and control: validation, authentication, prioritized dispatch,
//! telemetry collection, and safe-mode orchestration.
//!
//! The command pipeline runs checksum, TMR code vote, signature, and
//! parameter validation in that order; the first failing step produces the
//! command's single terminal status. Validated commands become scheduler
//! tasks; emergency commands execute inline when no mode transition is in
//! flight.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use ed25519_dalek::VerifyingKey;
use heapless::Deque;
use tracing::{debug, error, info, warn};

use crate::health::HealthMonitor;
use crate::power::{PowerManager, PowerMode};
use crate::protocol::{
    opcode, packet_type, Command, CommandPriority, CommandSource, CommandStatus, TelemetryPacket,
};
use crate::rf::RfController;
use crate::scheduler::OrbitalTaskScheduler;
use crate::subsystems::SubsystemId;
use crate::task::{Task, TaskPriority, TaskStatus, TaskType};

const COMMAND_QUEUE_DEPTH: usize = 32;
const TELEMETRY_RING_DEPTH: usize = 64;

pub type CommandCallback = Box<dyn FnOnce(CommandStatus, &str) + Send>;

/// One verifying key per command source. The executive is configured with
/// trust anchors; it never holds private keys.
#[derive(Default, Clone)]
pub struct TrustAnchors {
    keys: [Option<VerifyingKey>; 5],
}

impl TrustAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, source: CommandSource, key: VerifyingKey) {
        self.keys[source.to_wire() as usize] = Some(key);
    }

    pub fn get(&self, source: CommandSource) -> Option<&VerifyingKey> {
        self.keys[source.to_wire() as usize].as_ref()
    }
}

struct QueuedCommand {
    command: Command,
    callback: Option<CommandCallback>,
}

#[derive(Default)]
struct CommandQueues {
    high: std::collections::VecDeque<QueuedCommand>,
    normal: std::collections::VecDeque<QueuedCommand>,
    low: std::collections::VecDeque<QueuedCommand>,
}

impl CommandQueues {
    fn queue_for(&mut self, priority: CommandPriority) -> &mut std::collections::VecDeque<QueuedCommand> {
        match priority {
            CommandPriority::Emergency | CommandPriority::High => &mut self.high,
            CommandPriority::Normal => &mut self.normal,
            CommandPriority::Low | CommandPriority::Deferred => &mut self.low,
        }
    }

    fn pop_next(&mut self) -> Option<QueuedCommand> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

/// The command and control arbitrator. Holds shared read-capability handles
/// to the other subsystems; the executive assembly owns all of them.
pub struct CommandControl {
    power: Arc<PowerManager>,
    scheduler: Arc<OrbitalTaskScheduler>,
    health: Arc<HealthMonitor>,
    rf: Arc<RfController>,
    anchors: TrustAnchors,

    queues: Mutex<CommandQueues>,
    telemetry: Mutex<Deque<TelemetryPacket, TELEMETRY_RING_DEPTH>>,

    in_safe_mode: AtomicBool,
    processing_enabled: AtomicBool,
    mode_transitioning: AtomicBool,
    last_error_code: AtomicU32,
    next_packet_id: AtomicU32,
    telemetry_sequence: AtomicU64,
    telemetry_dropped: AtomicU64,
}

impl CommandControl {
    pub fn new(
        power: Arc<PowerManager>,
        scheduler: Arc<OrbitalTaskScheduler>,
        health: Arc<HealthMonitor>,
        rf: Arc<RfController>,
        anchors: TrustAnchors,
    ) -> Self {
        Self {
            power,
            scheduler,
            health,
            rf,
            anchors,
            queues: Mutex::new(CommandQueues::default()),
            telemetry: Mutex::new(Deque::new()),
            in_safe_mode: AtomicBool::new(false),
            processing_enabled: AtomicBool::new(true),
            mode_transitioning: AtomicBool::new(false),
            last_error_code: AtomicU32::new(0),
            next_packet_id: AtomicU32::new(1),
            telemetry_sequence: AtomicU64::new(0),
            telemetry_dropped: AtomicU64::new(0),
        }
    }

    // ---- command processing ----

    /// Run the validation pipeline and dispatch or enqueue the command.
    /// Exactly one terminal status reaches the callback.
    pub fn process_command(
        &self,
        command: Command,
        callback: Option<CommandCallback>,
    ) -> CommandStatus {
        // 1. Checksum over the transmitted fields.
        if !command.verify_checksum() {
            warn!(command = command.id, "command rejected: checksum mismatch");
            return self.finish(callback, CommandStatus::InvalidCommand, "checksum mismatch");
        }

        // 2. TMR vote over the redundant code copies.
        if !command.validate_tmr() {
            warn!(command = command.id, "command rejected: TMR code mismatch");
            return self.finish(
                callback,
                CommandStatus::RedundancyMismatch,
                "redundant code copies disagree",
            );
        }

        // 3. Signature against the trust anchor for the claimed source.
        let authentic = self
            .anchors
            .get(command.source)
            .map(|key| command.verify_signature(key))
            .unwrap_or(false);
        if !authentic {
            warn!(
                command = command.id,
                source = ?command.source,
                "command rejected: authentication failed"
            );
            return self.finish(callback, CommandStatus::Unauthorized, "authentication failed");
        }

        // 4. Per-opcode parameter validation.
        if let Err(reason) = validate_parameters(&command) {
            warn!(command = command.id, reason, "command rejected: invalid parameters");
            return self.finish(callback, CommandStatus::InvalidCommand, reason);
        }

        // Safe mode admits only emergency traffic until a recovery stage
        // re-enables routine intake.
        if self.in_safe_mode.load(Ordering::SeqCst)
            && !self.processing_enabled.load(Ordering::SeqCst)
            && command.priority != CommandPriority::Emergency
        {
            return self.finish(
                callback,
                CommandStatus::ResourceUnavailable,
                "system in safe mode",
            );
        }

        if command.priority == CommandPriority::Emergency
            && !self.mode_transitioning.load(Ordering::SeqCst)
        {
            // Emergency commands bypass queueing.
            let (status, detail) = self.execute(&command);
            return self.finish(callback, status, &detail);
        }

        let mut queues = self.queues.lock().expect("command queues poisoned");
        let queue = queues.queue_for(command.priority);
        if queue.len() >= COMMAND_QUEUE_DEPTH {
            return self.finish(callback, CommandStatus::ResourceUnavailable, "queue full");
        }
        debug!(command = command.id, priority = ?command.priority, "command queued");
        queue.push_back(QueuedCommand { command, callback });
        CommandStatus::Pending
    }

    /// Drain the priority queues, dispatching each command as a scheduler
    /// task. Called from the executive's update tick.
    pub fn process_queues(&self) {
        loop {
            let queued = {
                let mut queues = self.queues.lock().expect("command queues poisoned");
                queues.pop_next()
            };
            let Some(QueuedCommand { command, callback }) = queued else {
                return;
            };
            self.dispatch_as_task(command, callback);
        }
    }

    pub fn queued_command_count(&self) -> usize {
        self.queues.lock().expect("command queues poisoned").len()
    }

    /// Hand the validated command to the scheduler as a typed task. The
    /// command callback fires from the task payload with the terminal
    /// status.
    fn dispatch_as_task(&self, command: Command, callback: Option<CommandCallback>) {
        let task_type = task_type_for(command.code);
        let priority = task_priority_for(command.priority);
        let name = format!("cmd-{:04x}-{}", command.code, command.id);
        let callback_slot = Mutex::new(callback);
        let command_clone = command.clone();
        let this = SelfHandle {
            power: Arc::clone(&self.power),
            scheduler: Arc::clone(&self.scheduler),
            health: Arc::clone(&self.health),
        };

        let task = Task::new(name, task_type, move |_context| {
            let (status, detail) = execute_command(&this, &command_clone);
            if let Some(callback) = callback_slot
                .lock()
                .expect("command callback poisoned")
                .take()
            {
                callback(status, &detail);
            }
            status == CommandStatus::Success
        })
        .with_priority(priority)
        .with_retry_limit(0);

        if let Err(err) = self.scheduler.schedule(task) {
            error!(command = command.id, error = %err, "failed to dispatch command task");
        }
    }

    /// Execute a command inline (emergency path).
    fn execute(&self, command: &Command) -> (CommandStatus, String) {
        let this = SelfHandle {
            power: Arc::clone(&self.power),
            scheduler: Arc::clone(&self.scheduler),
            health: Arc::clone(&self.health),
        };
        match command.code {
            opcode::ENTER_SAFE_MODE => {
                self.enter_safe_mode(0x5AFE, "commanded safe-mode entry");
                (CommandStatus::Success, "safe mode entered".into())
            }
            opcode::ATTEMPT_RECOVERY => {
                let level = command.payload.first().copied().unwrap_or(0);
                if self.attempt_recovery(level) {
                    (CommandStatus::Success, "recovery complete".into())
                } else {
                    (CommandStatus::ExecutionError, "recovery incomplete".into())
                }
            }
            _ => execute_command(&this, command),
        }
    }

    // ---- telemetry ----

    /// Sample each subsystem through its read-only contract and build
    /// checksummed, ECC-protected packets.
    pub fn collect_telemetry(&self, full: bool) -> Vec<TelemetryPacket> {
        let mut packets = Vec::new();

        let budget = self.power.budget();
        if let Ok(payload) = serde_json::to_vec(&budget) {
            packets.push(self.build_packet(packet_type::POWER, payload));
        }

        let metrics = self.scheduler.report_metrics();
        if let Ok(payload) = serde_json::to_vec(&metrics) {
            packets.push(self.build_packet(packet_type::SCHEDULER, payload));
        }

        if full {
            let health = self.health.all_component_health();
            let radiation = self.health.radiation_data();
            if let Ok(payload) = serde_json::to_vec(&(health, radiation)) {
                packets.push(self.build_packet(packet_type::HEALTH, payload));
            }
        }

        packets
    }

    fn build_packet(&self, packet_type: u16, payload: Vec<u8>) -> TelemetryPacket {
        self.telemetry_sequence.fetch_add(1, Ordering::Relaxed);
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        TelemetryPacket::new(id, packet_type, payload)
    }

    /// Append to the bounded telemetry ring. On overflow the oldest
    /// non-urgent packet is dropped; urgent packets are never displaced.
    pub fn queue_telemetry(&self, packet: TelemetryPacket) -> bool {
        let mut ring = self.telemetry.lock().expect("telemetry ring poisoned");
        if ring.is_full() {
            let victim_index = ring.iter().position(|p| !p.is_urgent());
            match victim_index {
                Some(index) => {
                    // Rebuild the ring without the oldest routine packet.
                    let mut kept: Vec<TelemetryPacket> = Vec::with_capacity(ring.len());
                    while let Some(queued) = ring.pop_front() {
                        kept.push(queued);
                    }
                    kept.remove(index);
                    for queued in kept {
                        let _ = ring.push_back(queued);
                    }
                    self.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("telemetry ring overflow: dropped oldest routine packet");
                }
                None => {
                    if !packet.is_urgent() {
                        self.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    // All queued packets urgent: the oldest yields to the
                    // newer urgent packet.
                    let _ = ring.pop_front();
                    self.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        ring.push_back(packet).is_ok()
    }

    /// Remove and return every queued packet, oldest first.
    pub fn drain_telemetry(&self) -> Vec<TelemetryPacket> {
        let mut ring = self.telemetry.lock().expect("telemetry ring poisoned");
        let mut drained = Vec::with_capacity(ring.len());
        while let Some(packet) = ring.pop_front() {
            drained.push(packet);
        }
        drained
    }

    /// Drain and downlink everything through the RF controller.
    pub fn transmit_telemetry(&self) -> usize {
        let packets = self.drain_telemetry();
        let mut sent = 0;
        for packet in &packets {
            match self.rf.downlink(&packet.encode()) {
                Ok(_) => sent += 1,
                Err(err) => {
                    warn!(error = %err, "telemetry downlink failed");
                    break;
                }
            }
        }
        sent
    }

    /// Respond to a telemetry request: collect and queue the packets.
    pub fn process_telemetry_request(&self, request_type: u16) -> bool {
        let full = request_type == packet_type::HEALTH;
        let packets = self.collect_telemetry(full);
        let mut queued = true;
        for packet in packets {
            queued &= self.queue_telemetry(packet);
        }
        queued
    }

    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry_dropped.load(Ordering::Relaxed)
    }

    // ---- safe mode ----

    pub fn in_safe_mode(&self) -> bool {
        self.in_safe_mode.load(Ordering::SeqCst)
    }

    /// Whether routine (non-emergency) command intake is currently open.
    pub fn processing_enabled(&self) -> bool {
        self.processing_enabled.load(Ordering::SeqCst)
    }

    /// Enter safe mode: EMERGENCY power, block routine command intake,
    /// cancel non-critical pending tasks, notify the ground.
    pub fn enter_safe_mode(&self, error_code: u32, details: &str) {
        if self.in_safe_mode.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(error_code, details, "entering safe mode");
        self.last_error_code.store(error_code, Ordering::SeqCst);
        self.processing_enabled.store(false, Ordering::SeqCst);

        self.mode_transitioning.store(true, Ordering::SeqCst);
        self.power.set_mode(PowerMode::Emergency);
        self.mode_transitioning.store(false, Ordering::SeqCst);

        for task in self.scheduler.by_status(TaskStatus::Pending) {
            if task.priority != TaskPriority::Critical {
                let _ = self.scheduler.cancel(&task.id);
            }
        }

        let notification = format!("{{\"error_code\":{},\"details\":{:?}}}", error_code, details);
        let packet = self.build_packet(packet_type::SAFE_MODE_EVENT, notification.into_bytes());
        self.queue_telemetry(packet);
    }

    /// Staged recovery: level >= 2 re-opens routine command intake,
    /// level >= 1 restores LOW_POWER, and level 0 exits safe mode (which
    /// also re-opens intake) only after a full power health check passes.
    pub fn attempt_recovery(&self, level: u8) -> bool {
        if !self.in_safe_mode.load(Ordering::SeqCst) {
            return true;
        }
        info!(level, "attempting safe-mode recovery");

        if level >= 2 {
            self.processing_enabled.store(true, Ordering::SeqCst);
            info!("routine command intake re-enabled");
        }

        if level >= 1 {
            self.mode_transitioning.store(true, Ordering::SeqCst);
            self.power.set_mode(PowerMode::LowPower);
            self.mode_transitioning.store(false, Ordering::SeqCst);
        }

        if level == 0 {
            if !self.power.health_check() {
                warn!("safe-mode exit blocked: health check failed");
                return false;
            }
            self.in_safe_mode.store(false, Ordering::SeqCst);
            self.processing_enabled.store(true, Ordering::SeqCst);
            self.last_error_code.store(0, Ordering::SeqCst);
            info!("safe mode exited");
            return true;
        }

        true
    }

    pub fn last_error_code(&self) -> u32 {
        self.last_error_code.load(Ordering::SeqCst)
    }

    fn finish(
        &self,
        callback: Option<CommandCallback>,
        status: CommandStatus,
        detail: &str,
    ) -> CommandStatus {
        if let Some(callback) = callback {
            callback(status, detail);
        }
        status
    }
}

/// Shared handles captured by command task payloads.
struct SelfHandle {
    power: Arc<PowerManager>,
    scheduler: Arc<OrbitalTaskScheduler>,
    health: Arc<HealthMonitor>,
}

/// Opcode-level parameter validation. Runs after integrity checks.
fn validate_parameters(command: &Command) -> Result<(), &'static str> {
    match command.code {
        opcode::PING | opcode::COLLECT_TELEMETRY | opcode::ENTER_SAFE_MODE => Ok(()),
        opcode::SET_POWER_MODE => {
            let value = *command.payload.first().ok_or("missing mode byte")?;
            PowerMode::from_wire(value)
                .map(|_| ())
                .ok_or("mode value out of range")
        }
        opcode::ENABLE_SUBSYSTEM => {
            if command.payload.len() < 3 {
                return Err("payload too short");
            }
            SubsystemId::from_wire(command.payload[0]).ok_or("subsystem value out of range")?;
            let permille = u16::from_be_bytes([command.payload[1], command.payload[2]]);
            if permille > 1000 {
                return Err("level above 1000 permille");
            }
            Ok(())
        }
        opcode::DISABLE_SUBSYSTEM => {
            let value = *command.payload.first().ok_or("missing subsystem byte")?;
            SubsystemId::from_wire(value)
                .map(|_| ())
                .ok_or("subsystem value out of range")
        }
        opcode::SET_RF_ALLOCATIONS => {
            if command.payload.len() < 6 {
                return Err("payload too short");
            }
            for chunk in command.payload[..6].chunks(2) {
                let permille = u16::from_be_bytes([chunk[0], chunk[1]]);
                if permille > 1000 {
                    return Err("allocation above 1000 permille");
                }
            }
            Ok(())
        }
        opcode::SCHEDULE_MAINTENANCE => {
            if command.payload.len() < 2 {
                return Err("missing delay field");
            }
            Ok(())
        }
        opcode::SIGNAL_EVENT => {
            if command.payload.is_empty() || command.payload.len() > 64 {
                return Err("event name length out of range");
            }
            core::str::from_utf8(&command.payload)
                .map(|_| ())
                .map_err(|_| "event name not UTF-8")
        }
        opcode::ATTEMPT_RECOVERY => {
            let level = *command.payload.first().ok_or("missing recovery level")?;
            if level > 3 {
                return Err("recovery level out of range");
            }
            Ok(())
        }
        _ => Err("unknown operation code"),
    }
}

fn task_type_for(code: u16) -> TaskType {
    match code {
        opcode::SET_POWER_MODE
        | opcode::ENABLE_SUBSYSTEM
        | opcode::DISABLE_SUBSYSTEM
        | opcode::SET_RF_ALLOCATIONS => TaskType::PowerManagement,
        opcode::COLLECT_TELEMETRY => TaskType::Telemetry,
        opcode::SCHEDULE_MAINTENANCE => TaskType::Maintenance,
        opcode::ENTER_SAFE_MODE | opcode::ATTEMPT_RECOVERY => TaskType::HealthCheck,
        _ => TaskType::Communication,
    }
}

fn task_priority_for(priority: CommandPriority) -> TaskPriority {
    match priority {
        CommandPriority::Emergency => TaskPriority::Critical,
        CommandPriority::High => TaskPriority::High,
        CommandPriority::Normal => TaskPriority::Normal,
        CommandPriority::Low => TaskPriority::Low,
        CommandPriority::Deferred => TaskPriority::Idle,
    }
}

/// Apply a validated command against the subsystem handles.
fn execute_command(handles: &SelfHandle, command: &Command) -> (CommandStatus, String) {
    match command.code {
        opcode::PING => (CommandStatus::Success, "pong".into()),
        opcode::COLLECT_TELEMETRY => {
            // Collection happens through the arbitrator's queues; here the
            // task simply confirms the scheduler executed the request.
            let metrics = handles.scheduler.report_metrics();
            (
                CommandStatus::Success,
                format!("telemetry requested; {} tasks executed", metrics.tasks_executed),
            )
        }
        opcode::SET_POWER_MODE => {
            let mode = command
                .payload
                .first()
                .and_then(|v| PowerMode::from_wire(*v));
            match mode {
                Some(mode) if handles.power.set_mode(mode) => {
                    (CommandStatus::Success, format!("mode set to {}", mode))
                }
                Some(_) => (CommandStatus::ExecutionError, "mode change failed".into()),
                None => (CommandStatus::InvalidCommand, "bad mode value".into()),
            }
        }
        opcode::ENABLE_SUBSYSTEM => {
            let subsystem = SubsystemId::from_wire(command.payload[0]);
            let permille = u16::from_be_bytes([command.payload[1], command.payload[2]]);
            let level = f32::from(permille) / 1000.0;
            match subsystem {
                Some(subsystem) => match handles.power.enable(subsystem, level) {
                    Ok(()) => (
                        CommandStatus::Success,
                        format!("{} enabled at {:.2}", subsystem, level),
                    ),
                    Err(err) => (CommandStatus::ResourceUnavailable, err.to_string()),
                },
                None => (CommandStatus::InvalidCommand, "bad subsystem".into()),
            }
        }
        opcode::DISABLE_SUBSYSTEM => {
            match SubsystemId::from_wire(command.payload[0]) {
                Some(subsystem) => match handles.power.disable(subsystem) {
                    Ok(()) => (CommandStatus::Success, format!("{} disabled", subsystem)),
                    Err(err) => (CommandStatus::ExecutionError, err.to_string()),
                },
                None => (CommandStatus::InvalidCommand, "bad subsystem".into()),
            }
        }
        opcode::SET_RF_ALLOCATIONS => {
            let standard = u16::from_be_bytes([command.payload[0], command.payload[1]]);
            let burst = u16::from_be_bytes([command.payload[2], command.payload[3]]);
            let emergency = u16::from_be_bytes([command.payload[4], command.payload[5]]);
            match handles.power.set_rf_allocations(
                f32::from(standard) / 1000.0,
                f32::from(burst) / 1000.0,
                f32::from(emergency) / 1000.0,
            ) {
                Ok(()) => (CommandStatus::Success, "rf allocations updated".into()),
                Err(err) => (CommandStatus::ExecutionError, err.to_string()),
            }
        }
        opcode::SCHEDULE_MAINTENANCE => {
            let delay_s = u16::from_be_bytes([command.payload[0], command.payload[1]]);
            let health = Arc::clone(&handles.health);
            let task = Task::new("commanded-maintenance", TaskType::Maintenance, move |_| {
                health.sample_once(0);
                true
            })
            .with_scheduled_time(SystemTime::now() + Duration::from_secs(u64::from(delay_s)))
            .with_priority(TaskPriority::Low);
            match handles.scheduler.schedule(task) {
                Ok(id) => (
                    CommandStatus::Success,
                    format!("maintenance scheduled as {}", id),
                ),
                Err(err) => (CommandStatus::ExecutionError, err.to_string()),
            }
        }
        opcode::SIGNAL_EVENT => {
            match core::str::from_utf8(&command.payload) {
                Ok(name) => {
                    handles.scheduler.signal_event(name);
                    (CommandStatus::Success, format!("event {} signaled", name))
                }
                Err(_) => (CommandStatus::InvalidCommand, "event name not UTF-8".into()),
            }
        }
        opcode::ENTER_SAFE_MODE | opcode::ATTEMPT_RECOVERY => {
            // Handled on the arbitrator's inline path; reaching here means
            // the command was queued at a non-emergency priority.
            (
                CommandStatus::ResourceUnavailable,
                "safe-mode commands require emergency priority".into(),
            )
        }
        _ => (CommandStatus::InvalidCommand, "unknown operation code".into()),
    }
}
