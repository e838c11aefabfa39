//! Transceiver driver contract and the RF controller handle.
//!
//! The actual radio drivers (AX5043, AT86RF233) live outside this crate;
//! they plug in behind the [`Transceiver`] trait. The executive owns one
//! [`RfController`] and passes the handle to consumers instead of touching
//! a global radio instance.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use arrayvec::ArrayVec;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Transmit frames carry 1..=256 bytes.
pub const MAX_FRAME_LEN: usize = 256;
pub const MAX_SYNC_WORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfBand {
    Uhf,
    S,
    X,
    Ku,
    Ka,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfModulation {
    Bpsk,
    Qpsk,
    Psk8,
    Qam16,
    Fsk,
    Gmsk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
    Max,
}

/// Driver power states, from fully off to actively transceiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfPowerState {
    Off,
    Sleep,
    Standby,
    Active,
}

/// Radio configuration handed to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfConfig {
    pub band: RfBand,
    pub frequency_hz: u32,
    pub bandwidth_hz: u32,
    pub modulation: RfModulation,
    pub power_level: RfPowerLevel,
    pub preamble_bits: u16,
    pub sync_word: BoundedVec<u8, MAX_SYNC_WORD_LEN>,
}

impl Default for RfConfig {
    fn default() -> Self {
        let mut sync_word = BoundedVec::new();
        for byte in [0xAA, 0x7E] {
            let _ = sync_word.push(byte);
        }
        Self {
            band: RfBand::Uhf,
            frequency_hz: 435_000_000,
            bandwidth_hz: 25_000,
            modulation: RfModulation::Gmsk,
            power_level: RfPowerLevel::Medium,
            preamble_bits: 64,
            sync_word,
        }
    }
}

pub type RxCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type TxCallback = Box<dyn FnOnce(bool) + Send>;

/// Narrow contract the radio drivers must honor.
pub trait Transceiver: Send {
    fn init(&mut self) -> bool;
    fn deinit(&mut self) -> bool;
    fn configure(&mut self, config: &RfConfig) -> bool;
    fn transmit(&mut self, frame: &[u8]) -> bool;
    fn transmit_async(&mut self, frame: &[u8], done: TxCallback) -> bool;
    fn start_receive(&mut self, callback: RxCallback) -> bool;
    fn stop_receive(&mut self) -> bool;
    fn set_power_state(&mut self, state: RfPowerState) -> bool;
}

/// Link metrics mirrored into telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RfMetrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub transmit_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfError {
    InvalidFrameLength,
    DriverFault,
    NotActive,
}

impl core::fmt::Display for RfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RfError::InvalidFrameLength => write!(f, "frame length out of range"),
            RfError::DriverFault => write!(f, "transceiver driver fault"),
            RfError::NotActive => write!(f, "transceiver not in active state"),
        }
    }
}

impl std::error::Error for RfError {}

/// Owned handle over one transceiver driver. Tracks power state and link
/// metrics; splits oversized downlink buffers into legal frames.
pub struct RfController {
    driver: Mutex<Box<dyn Transceiver>>,
    power_state: Mutex<RfPowerState>,
    metrics_frames_sent: AtomicU64,
    metrics_bytes_sent: AtomicU64,
    metrics_frames_received: AtomicU64,
    metrics_bytes_received: AtomicU64,
    transmit_errors: AtomicU32,
}

impl RfController {
    pub fn new(mut driver: Box<dyn Transceiver>) -> Result<Self, RfError> {
        if !driver.init() {
            return Err(RfError::DriverFault);
        }
        Ok(Self {
            driver: Mutex::new(driver),
            power_state: Mutex::new(RfPowerState::Standby),
            metrics_frames_sent: AtomicU64::new(0),
            metrics_bytes_sent: AtomicU64::new(0),
            metrics_frames_received: AtomicU64::new(0),
            metrics_bytes_received: AtomicU64::new(0),
            transmit_errors: AtomicU32::new(0),
        })
    }

    pub fn configure(&self, config: &RfConfig) -> Result<(), RfError> {
        let mut driver = self.lock_driver();
        if driver.configure(config) {
            debug!(
                frequency_hz = config.frequency_hz,
                bandwidth_hz = config.bandwidth_hz,
                "transceiver configured"
            );
            Ok(())
        } else {
            Err(RfError::DriverFault)
        }
    }

    pub fn set_power_state(&self, state: RfPowerState) -> Result<(), RfError> {
        let mut driver = self.lock_driver();
        if !driver.set_power_state(state) {
            return Err(RfError::DriverFault);
        }
        *self.power_state.lock().expect("power state poisoned") = state;
        Ok(())
    }

    pub fn power_state(&self) -> RfPowerState {
        *self.power_state.lock().expect("power state poisoned")
    }

    /// Transmit a single frame of 1..=256 bytes.
    pub fn transmit(&self, frame: &[u8]) -> Result<(), RfError> {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            return Err(RfError::InvalidFrameLength);
        }
        if self.power_state() != RfPowerState::Active {
            return Err(RfError::NotActive);
        }

        // Stage into a fixed buffer so the driver never sees an oversized
        // slice even if the caller's buffer is shared.
        let mut staged: ArrayVec<u8, MAX_FRAME_LEN> = ArrayVec::new();
        staged.try_extend_from_slice(frame).map_err(|_| RfError::InvalidFrameLength)?;

        let mut driver = self.lock_driver();
        if driver.transmit(&staged) {
            self.metrics_frames_sent.fetch_add(1, Ordering::Relaxed);
            self.metrics_bytes_sent
                .fetch_add(staged.len() as u64, Ordering::Relaxed);
            Ok(())
        } else {
            self.transmit_errors.fetch_add(1, Ordering::Relaxed);
            warn!("transceiver rejected frame");
            Err(RfError::DriverFault)
        }
    }

    /// Transmit an arbitrary-length buffer as consecutive legal frames.
    pub fn downlink(&self, bytes: &[u8]) -> Result<usize, RfError> {
        let mut frames = 0;
        for chunk in bytes.chunks(MAX_FRAME_LEN) {
            self.transmit(chunk)?;
            frames += 1;
        }
        Ok(frames)
    }

    pub fn start_receive<F>(&self, callback: F) -> Result<(), RfError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut driver = self.lock_driver();
        if driver.start_receive(Box::new(callback)) {
            Ok(())
        } else {
            Err(RfError::DriverFault)
        }
    }

    pub fn stop_receive(&self) -> Result<(), RfError> {
        let mut driver = self.lock_driver();
        if driver.stop_receive() {
            Ok(())
        } else {
            Err(RfError::DriverFault)
        }
    }

    pub fn record_received(&self, bytes: usize) {
        self.metrics_frames_received.fetch_add(1, Ordering::Relaxed);
        self.metrics_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> RfMetrics {
        RfMetrics {
            frames_sent: self.metrics_frames_sent.load(Ordering::Relaxed),
            frames_received: self.metrics_frames_received.load(Ordering::Relaxed),
            bytes_sent: self.metrics_bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.metrics_bytes_received.load(Ordering::Relaxed),
            transmit_errors: self.transmit_errors.load(Ordering::Relaxed),
        }
    }

    fn lock_driver(&self) -> std::sync::MutexGuard<'_, Box<dyn Transceiver>> {
        self.driver.lock().expect("driver poisoned")
    }
}

/// In-memory transceiver used by the simulator and the test suite. Frames
/// transmitted while a receive callback is installed are looped back to it.
#[derive(Default)]
pub struct LoopbackTransceiver {
    initialized: bool,
    receiving: Option<RxCallback>,
    power_state: Option<RfPowerState>,
}

impl LoopbackTransceiver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transceiver for LoopbackTransceiver {
    fn init(&mut self) -> bool {
        self.initialized = true;
        self.power_state = Some(RfPowerState::Standby);
        true
    }

    fn deinit(&mut self) -> bool {
        self.initialized = false;
        self.receiving = None;
        self.power_state = Some(RfPowerState::Off);
        true
    }

    fn configure(&mut self, _config: &RfConfig) -> bool {
        self.initialized
    }

    fn transmit(&mut self, frame: &[u8]) -> bool {
        if !self.initialized || frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            return false;
        }
        if let Some(callback) = &self.receiving {
            callback(frame);
        }
        true
    }

    fn transmit_async(&mut self, frame: &[u8], done: TxCallback) -> bool {
        let sent = self.transmit(frame);
        done(sent);
        sent
    }

    fn start_receive(&mut self, callback: RxCallback) -> bool {
        if !self.initialized {
            return false;
        }
        self.receiving = Some(callback);
        true
    }

    fn stop_receive(&mut self) -> bool {
        self.receiving = None;
        true
    }

    fn set_power_state(&mut self, state: RfPowerState) -> bool {
        if !self.initialized {
            return false;
        }
        self.power_state = Some(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn controller() -> RfController {
        RfController::new(Box::new(LoopbackTransceiver::new())).unwrap()
    }

    #[test]
    fn transmit_requires_active_state() {
        let rf = controller();
        assert_eq!(rf.transmit(&[1, 2, 3]), Err(RfError::NotActive));
        rf.set_power_state(RfPowerState::Active).unwrap();
        assert!(rf.transmit(&[1, 2, 3]).is_ok());
        assert_eq!(rf.metrics().frames_sent, 1);
        assert_eq!(rf.metrics().bytes_sent, 3);
    }

    #[test]
    fn frame_length_limits_enforced() {
        let rf = controller();
        rf.set_power_state(RfPowerState::Active).unwrap();
        assert_eq!(rf.transmit(&[]), Err(RfError::InvalidFrameLength));
        let oversized = vec![0u8; MAX_FRAME_LEN + 1];
        assert_eq!(rf.transmit(&oversized), Err(RfError::InvalidFrameLength));
        let exact = vec![0u8; MAX_FRAME_LEN];
        assert!(rf.transmit(&exact).is_ok());
    }

    #[test]
    fn downlink_chunks_oversized_buffers() {
        let rf = controller();
        rf.set_power_state(RfPowerState::Active).unwrap();
        let buffer = vec![0u8; MAX_FRAME_LEN * 2 + 10];
        assert_eq!(rf.downlink(&buffer), Ok(3));
        assert_eq!(rf.metrics().frames_sent, 3);
    }

    #[test]
    fn loopback_delivers_to_receiver() {
        let rf = controller();
        rf.set_power_state(RfPowerState::Active).unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&received);
        rf.start_receive(move |frame| {
            observer.fetch_add(frame.len(), Ordering::SeqCst);
        })
        .unwrap();
        rf.transmit(&[5; 10]).unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 10);
        rf.stop_receive().unwrap();
    }
}
