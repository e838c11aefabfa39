//! Uplink command and downlink telemetry wire formats.
//!
//! Commands travel as bit-exact big-endian frames with a CRC-32 over the
//! header-plus-payload prefix and an Ed25519 signature trailer. Telemetry
//! packets carry a CRC-32 and an interleaved-parity error-detection code.
//! The in-memory `Command` additionally holds two redundant copies of the
//! operation code for TMR voting; the copies are never transmitted.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::integrity::discrete_majority;

pub const MAX_COMMAND_PAYLOAD: usize = 512;
pub const MAX_SIGNATURE_LEN: usize = 128;
pub const ECC_STRIPES: usize = 4;

/// Command operation codes with parameter-validation contracts.
pub mod opcode {
    pub const PING: u16 = 0x0001;
    pub const COLLECT_TELEMETRY: u16 = 0x0010;
    pub const SET_POWER_MODE: u16 = 0x0020;
    pub const ENABLE_SUBSYSTEM: u16 = 0x0021;
    pub const DISABLE_SUBSYSTEM: u16 = 0x0022;
    pub const SET_RF_ALLOCATIONS: u16 = 0x0023;
    pub const SCHEDULE_MAINTENANCE: u16 = 0x0030;
    pub const SIGNAL_EVENT: u16 = 0x0031;
    pub const ENTER_SAFE_MODE: u16 = 0x00F0;
    pub const ATTEMPT_RECOVERY: u16 = 0x00F1;
}

/// Telemetry packet types. Types at or above `TLM_URGENT_FLOOR` survive
/// queue overflow.
pub mod packet_type {
    pub const POWER: u16 = 0x0001;
    pub const SCHEDULER: u16 = 0x0002;
    pub const HEALTH: u16 = 0x0003;
    pub const SAFE_MODE_EVENT: u16 = 0x00F0;

    pub const TLM_URGENT_FLOOR: u16 = 0x00F0;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CommandPriority {
    Emergency,
    High,
    Normal,
    Low,
    Deferred,
}

impl CommandPriority {
    pub fn from_wire(value: u8) -> Option<CommandPriority> {
        match value {
            0 => Some(CommandPriority::Emergency),
            1 => Some(CommandPriority::High),
            2 => Some(CommandPriority::Normal),
            3 => Some(CommandPriority::Low),
            4 => Some(CommandPriority::Deferred),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            CommandPriority::Emergency => 0,
            CommandPriority::High => 1,
            CommandPriority::Normal => 2,
            CommandPriority::Low => 3,
            CommandPriority::Deferred => 4,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CommandSource {
    GroundStation,
    MeshPeer,
    OnboardScheduler,
    AutonomousSystem,
    RecoverySystem,
}

impl CommandSource {
    pub const ALL: [CommandSource; 5] = [
        CommandSource::GroundStation,
        CommandSource::MeshPeer,
        CommandSource::OnboardScheduler,
        CommandSource::AutonomousSystem,
        CommandSource::RecoverySystem,
    ];

    pub fn from_wire(value: u8) -> Option<CommandSource> {
        match value {
            0 => Some(CommandSource::GroundStation),
            1 => Some(CommandSource::MeshPeer),
            2 => Some(CommandSource::OnboardScheduler),
            3 => Some(CommandSource::AutonomousSystem),
            4 => Some(CommandSource::RecoverySystem),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            CommandSource::GroundStation => 0,
            CommandSource::MeshPeer => 1,
            CommandSource::OnboardScheduler => 2,
            CommandSource::AutonomousSystem => 3,
            CommandSource::RecoverySystem => 4,
        }
    }
}

/// Terminal (and transitional) command statuses reported to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Pending,
    InvalidCommand,
    Unauthorized,
    ExecutionError,
    ResourceUnavailable,
    Timeout,
    RedundancyMismatch,
    RadiationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    Truncated,
    PayloadTooLarge,
    SignatureTooLarge,
    InvalidPriority(u8),
    InvalidSource(u8),
    ChecksumMismatch,
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolError::Truncated => write!(f, "frame truncated"),
            ProtocolError::PayloadTooLarge => write!(f, "payload exceeds limit"),
            ProtocolError::SignatureTooLarge => write!(f, "signature exceeds limit"),
            ProtocolError::InvalidPriority(v) => write!(f, "invalid priority value {}", v),
            ProtocolError::InvalidSource(v) => write!(f, "invalid source value {}", v),
            ProtocolError::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// An uplinked satellite command. Transient: destroyed after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub code: u16,
    pub priority: CommandPriority,
    pub source: CommandSource,
    pub timestamp_ms: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub checksum: u32,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,

    // Redundant operation-code copies for TMR. Never transmitted; reset to
    // the wire value on decode.
    #[serde(skip)]
    pub code_copy1: u16,
    #[serde(skip)]
    pub code_copy2: u16,
}

impl Command {
    pub fn new(
        id: u32,
        code: u16,
        priority: CommandPriority,
        source: CommandSource,
        payload: Vec<u8>,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut command = Self {
            id,
            code,
            priority,
            source,
            timestamp_ms,
            payload,
            checksum: 0,
            signature: Vec::new(),
            code_copy1: code,
            code_copy2: code,
        };
        command.checksum = command.compute_checksum();
        command
    }

    /// The checksummed-and-signed prefix: every field ahead of the checksum
    /// in the wire layout.
    pub fn signed_prefix(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(18 + self.payload.len());
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&self.code.to_be_bytes());
        bytes.push(self.priority.to_wire());
        bytes.push(self.source.to_wire());
        bytes.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.signed_prefix())
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Majority vote over the transmitted code and its two shadow copies.
    pub fn code_tmr_vote(&self) -> Option<u16> {
        discrete_majority(&[self.code, self.code_copy1, self.code_copy2])
    }

    pub fn validate_tmr(&self) -> bool {
        self.code_tmr_vote() == Some(self.code)
    }

    /// Ground-side helper: sign the frame prefix.
    pub fn sign(&mut self, key: &SigningKey) {
        self.checksum = self.compute_checksum();
        let signature: Signature = key.sign(&self.signed_prefix());
        self.signature = signature.to_bytes().to_vec();
    }

    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        key.verify(&self.signed_prefix(), &signature).is_ok()
    }

    /// Encode to the big-endian uplink frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_COMMAND_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge);
        }
        if self.signature.len() > MAX_SIGNATURE_LEN {
            return Err(ProtocolError::SignatureTooLarge);
        }
        let mut bytes = self.signed_prefix();
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.signature);
        Ok(bytes)
    }

    /// Decode an uplink frame. Field ranges are validated here; checksum,
    /// TMR, and signature checks are the command pipeline's job.
    pub fn decode(bytes: &[u8]) -> Result<Command, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let id = cursor.read_u32()?;
        let code = cursor.read_u16()?;
        let priority_raw = cursor.read_u8()?;
        let priority = CommandPriority::from_wire(priority_raw)
            .ok_or(ProtocolError::InvalidPriority(priority_raw))?;
        let source_raw = cursor.read_u8()?;
        let source =
            CommandSource::from_wire(source_raw).ok_or(ProtocolError::InvalidSource(source_raw))?;
        let timestamp_ms = cursor.read_u64()?;
        let payload_len = cursor.read_u16()? as usize;
        if payload_len > MAX_COMMAND_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge);
        }
        let payload = cursor.read_bytes(payload_len)?.to_vec();
        let checksum = cursor.read_u32()?;
        let sig_len = cursor.read_u16()? as usize;
        if sig_len > MAX_SIGNATURE_LEN {
            return Err(ProtocolError::SignatureTooLarge);
        }
        let signature = cursor.read_bytes(sig_len)?.to_vec();

        Ok(Command {
            id,
            code,
            priority,
            source,
            timestamp_ms,
            payload,
            checksum,
            signature,
            code_copy1: code,
            code_copy2: code,
        })
    }
}

/// A downlink telemetry packet. Transient: destroyed when transmitted or
/// dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub id: u32,
    pub timestamp_ms: u64,
    pub packet_type: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub checksum: u32,
    #[serde(with = "serde_bytes")]
    pub ecc: Vec<u8>,
}

impl TelemetryPacket {
    pub fn new(id: u32, packet_type: u16, payload: Vec<u8>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut packet = Self {
            id,
            timestamp_ms,
            packet_type,
            payload,
            checksum: 0,
            ecc: Vec::new(),
        };
        packet.generate_checksum();
        packet.generate_ecc();
        packet
    }

    fn checksum_prefix(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + self.payload.len());
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        bytes.extend_from_slice(&self.packet_type.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn generate_checksum(&mut self) {
        self.checksum = crc32fast::hash(&self.checksum_prefix());
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == crc32fast::hash(&self.checksum_prefix())
    }

    /// Interleaved parity stripes over the payload.
    pub fn generate_ecc(&mut self) {
        self.ecc = parity_stripes(&self.payload);
    }

    pub fn verify_ecc(&self) -> bool {
        self.ecc == parity_stripes(&self.payload)
    }

    /// Urgent packets survive telemetry-queue overflow.
    pub fn is_urgent(&self) -> bool {
        self.packet_type >= packet_type::TLM_URGENT_FLOOR
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.checksum_prefix();
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&(self.ecc.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.ecc);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<TelemetryPacket, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let id = cursor.read_u32()?;
        let timestamp_ms = cursor.read_u64()?;
        let packet_type = cursor.read_u16()?;
        let payload_len = cursor.read_u16()? as usize;
        let payload = cursor.read_bytes(payload_len)?.to_vec();
        let checksum = cursor.read_u32()?;
        let ecc_len = cursor.read_u16()? as usize;
        let ecc = cursor.read_bytes(ecc_len)?.to_vec();

        Ok(TelemetryPacket {
            id,
            timestamp_ms,
            packet_type,
            payload,
            checksum,
            ecc,
        })
    }
}

fn parity_stripes(payload: &[u8]) -> Vec<u8> {
    let mut stripes = vec![0u8; ECC_STRIPES];
    for (index, byte) in payload.iter().enumerate() {
        stripes[index % ECC_STRIPES] ^= byte;
    }
    stripes
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.offset.checked_add(len).ok_or(ProtocolError::Truncated)?;
        if end > self.bytes.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.read_bytes(8)?;
        let mut buffer = [0u8; 8];
        buffer.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buffer))
    }
}
