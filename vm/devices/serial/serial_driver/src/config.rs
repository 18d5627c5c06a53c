// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device configuration: flow control policy, timeouts and special
//! characters.

use bitfield_struct::bitfield;
use std::time::Duration;
use thiserror::Error;

/// Errors returned when validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The interrupt buffer must hold at least one byte.
    #[error("interrupt buffer size must be non-zero")]
    ZeroBufferSize,
    /// A flow control limit exceeds the interrupt buffer.
    #[error("{name} limit {limit} exceeds buffer size {buffer_size}")]
    LimitTooLarge {
        /// Which limit.
        name: &'static str,
        /// The rejected limit.
        limit: usize,
        /// The buffer it was checked against.
        buffer_size: usize,
    },
    /// The release watermark is not below the hold watermark, so receive
    /// flow control would release as soon as it engaged.
    #[error("xon limit {xon_limit} must be below the hold threshold {threshold}")]
    OverlappingLimits {
        /// The rejected Xon limit.
        xon_limit: usize,
        /// `buffer_size - xoff_limit`.
        threshold: usize,
    },
    /// Raw hand-flow words contained a reserved or unsupported bit pattern.
    #[error("unsupported {field} bits {bits:#x}")]
    UnsupportedBits {
        /// Which word.
        field: &'static str,
        /// The offending bits.
        bits: u32,
    },
    /// Software flow control needs distinct XON and XOFF characters.
    #[error("xon and xoff characters are both {0:#04x}")]
    XonEqualsXoff(u8),
    /// The read interval and multiplier were both `u32::MAX` with a constant
    /// that is zero or `u32::MAX`. Neither names a usable wait.
    #[error("read interval and multiplier are u32::MAX without a usable constant")]
    InvalidTimeouts,
    /// The baud rate must be non-zero.
    #[error("baud rate must be non-zero")]
    ZeroBaudRate,
}

/// Raw `ControlHandShake` word of the hand-flow structure.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ControlHandShake {
    #[bits(2)]
    pub dtr_mask: u8,
    _reserved0: bool,
    pub cts_handshake: bool,
    pub dsr_handshake: bool,
    pub dcd_handshake: bool,
    pub dsr_sensitivity: bool,
    #[bits(24)]
    _reserved1: u32,
    pub error_abort: bool,
}

/// Raw `FlowReplace` word of the hand-flow structure.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FlowReplace {
    pub auto_transmit: bool,
    pub auto_receive: bool,
    #[bits(4)]
    _reserved0: u8,
    #[bits(2)]
    pub rts_mask: u8,
    #[bits(23)]
    _reserved1: u32,
    pub xoff_continue: bool,
}

const DTR_CONTROL: u8 = 0x01;
const DTR_HANDSHAKE: u8 = 0x02;
const RTS_CONTROL: u8 = 0x01;
const RTS_HANDSHAKE: u8 = 0x02;
const TRANSMIT_TOGGLE: u8 = 0x03;

/// How the driver manages DTR.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DtrControl {
    /// DTR is held low.
    #[default]
    Disabled,
    /// DTR is held high.
    Control,
    /// DTR signals whether the receive buffer has room.
    Handshake,
}

/// How the driver manages RTS.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RtsControl {
    /// RTS is held low.
    #[default]
    Disabled,
    /// RTS is held high.
    Control,
    /// RTS signals whether the receive buffer has room.
    Handshake,
    /// RTS is raised only while there is data to transmit.
    TransmitToggle,
}

/// Flow control policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandFlow {
    /// DTR mode.
    pub dtr: DtrControl,
    /// RTS mode.
    pub rts: RtsControl,
    /// Hold transmission while CTS is low.
    pub cts_handshake: bool,
    /// Hold transmission while DSR is low.
    pub dsr_handshake: bool,
    /// Hold transmission while DCD is low.
    pub dcd_handshake: bool,
    /// Discard received bytes while DSR is low.
    pub dsr_sensitivity: bool,
    /// Cancel all reads and writes when a line error is latched.
    pub error_abort: bool,
    /// Honor XON/XOFF bytes received from the remote side.
    pub auto_transmit: bool,
    /// Send XOFF/XON to the remote side as the receive buffer fills and drains.
    pub auto_receive: bool,
    /// Keep transmitting after sending an XOFF.
    pub xoff_continue: bool,
    /// Receive holds are released once the buffer drains to this many bytes.
    pub xon_limit: usize,
    /// Receive holds engage once free space drops to this many bytes.
    pub xoff_limit: usize,
}

impl HandFlow {
    /// A policy with no flow control and DTR/RTS held high.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            dtr: DtrControl::Control,
            rts: RtsControl::Control,
            cts_handshake: false,
            dsr_handshake: false,
            dcd_handshake: false,
            dsr_sensitivity: false,
            error_abort: false,
            auto_transmit: false,
            auto_receive: false,
            xoff_continue: false,
            xon_limit: buffer_size / 8,
            xoff_limit: buffer_size / 8,
        }
    }

    /// Builds a policy from the raw `ControlHandShake`/`FlowReplace` words.
    pub fn from_raw(
        control_hand_shake: u32,
        flow_replace: u32,
        xon_limit: usize,
        xoff_limit: usize,
    ) -> Result<Self, ConfigError> {
        let control = ControlHandShake::from(control_hand_shake);
        let flow = FlowReplace::from(flow_replace);

        let control_known = ControlHandShake::new()
            .with_dtr_mask(3)
            .with_cts_handshake(true)
            .with_dsr_handshake(true)
            .with_dcd_handshake(true)
            .with_dsr_sensitivity(true)
            .with_error_abort(true);
        let control_unknown = control_hand_shake & !u32::from(control_known);
        if control_unknown != 0 {
            return Err(ConfigError::UnsupportedBits {
                field: "control handshake",
                bits: control_unknown,
            });
        }
        let flow_known = FlowReplace::new()
            .with_auto_transmit(true)
            .with_auto_receive(true)
            .with_rts_mask(3)
            .with_xoff_continue(true);
        let flow_unknown = flow_replace & !u32::from(flow_known);
        if flow_unknown != 0 {
            return Err(ConfigError::UnsupportedBits {
                field: "flow replace",
                bits: flow_unknown,
            });
        }

        let dtr = match control.dtr_mask() {
            0 => DtrControl::Disabled,
            DTR_CONTROL => DtrControl::Control,
            DTR_HANDSHAKE => DtrControl::Handshake,
            _ => {
                return Err(ConfigError::UnsupportedBits {
                    field: "dtr mode",
                    bits: control_hand_shake & 0x3,
                })
            }
        };
        let rts = match flow.rts_mask() {
            0 => RtsControl::Disabled,
            RTS_CONTROL => RtsControl::Control,
            RTS_HANDSHAKE => RtsControl::Handshake,
            _ => RtsControl::TransmitToggle,
        };

        Ok(Self {
            dtr,
            rts,
            cts_handshake: control.cts_handshake(),
            dsr_handshake: control.dsr_handshake(),
            dcd_handshake: control.dcd_handshake(),
            dsr_sensitivity: control.dsr_sensitivity(),
            error_abort: control.error_abort(),
            auto_transmit: flow.auto_transmit(),
            auto_receive: flow.auto_receive(),
            xoff_continue: flow.xoff_continue(),
            xon_limit,
            xoff_limit,
        })
    }

    /// Returns the raw `ControlHandShake` word.
    pub fn control_hand_shake(&self) -> ControlHandShake {
        ControlHandShake::new()
            .with_dtr_mask(match self.dtr {
                DtrControl::Disabled => 0,
                DtrControl::Control => DTR_CONTROL,
                DtrControl::Handshake => DTR_HANDSHAKE,
            })
            .with_cts_handshake(self.cts_handshake)
            .with_dsr_handshake(self.dsr_handshake)
            .with_dcd_handshake(self.dcd_handshake)
            .with_dsr_sensitivity(self.dsr_sensitivity)
            .with_error_abort(self.error_abort)
    }

    /// Returns the raw `FlowReplace` word.
    pub fn flow_replace(&self) -> FlowReplace {
        FlowReplace::new()
            .with_auto_transmit(self.auto_transmit)
            .with_auto_receive(self.auto_receive)
            .with_rts_mask(match self.rts {
                RtsControl::Disabled => 0,
                RtsControl::Control => RTS_CONTROL,
                RtsControl::Handshake => RTS_HANDSHAKE,
                RtsControl::TransmitToggle => TRANSMIT_TOGGLE,
            })
            .with_xoff_continue(self.xoff_continue)
    }

    /// True if any of the output handshakes (CTS, DSR, DCD) is enabled.
    pub fn output_handshake(&self) -> bool {
        self.cts_handshake || self.dsr_handshake || self.dcd_handshake
    }

    /// Returns the occupancy at which receive flow control engages.
    pub fn hold_threshold(&self, buffer_size: usize) -> usize {
        buffer_size.saturating_sub(self.xoff_limit)
    }

    /// Checks the watermarks against an interrupt buffer of `buffer_size`
    /// bytes.
    pub fn validate(&self, buffer_size: usize) -> Result<(), ConfigError> {
        if buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        for (name, limit) in [("xon", self.xon_limit), ("xoff", self.xoff_limit)] {
            if limit > buffer_size {
                return Err(ConfigError::LimitTooLarge {
                    name,
                    limit,
                    buffer_size,
                });
            }
        }
        let threshold = self.hold_threshold(buffer_size);
        if self.xon_limit >= threshold {
            return Err(ConfigError::OverlappingLimits {
                xon_limit: self.xon_limit,
                threshold,
            });
        }
        Ok(())
    }
}

/// Special characters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SerialChars {
    /// Resumes transmission on the remote side.
    pub xon: u8,
    /// Pauses transmission on the remote side.
    pub xoff: u8,
    /// Reception of this byte raises the `RXFLAG` wait event.
    pub event: u8,
}

impl Default for SerialChars {
    fn default() -> Self {
        Self {
            xon: 0x11,
            xoff: 0x13,
            event: 0,
        }
    }
}

impl SerialChars {
    /// Rejects identical XON/XOFF bytes when software flow control is on.
    pub fn validate(&self, hand_flow: &HandFlow) -> Result<(), ConfigError> {
        if (hand_flow.auto_transmit || hand_flow.auto_receive) && self.xon == self.xoff {
            return Err(ConfigError::XonEqualsXoff(self.xon));
        }
        Ok(())
    }
}

/// Read and write timeouts, in milliseconds.
///
/// `read_interval == u32::MAX` selects the "return what is present"
/// family of behaviors, refined by the total timeout fields:
///
/// * both totals zero: complete at once with whatever is buffered;
/// * multiplier `u32::MAX` and a constant strictly between zero and
///   `u32::MAX`: wait up to the constant for a single byte;
/// * any other finite totals: return what arrives once something does.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Timeouts {
    /// Maximum gap between two received bytes.
    pub read_interval: u32,
    /// Per-byte component of the read total timeout.
    pub read_total_multiplier: u32,
    /// Fixed component of the read total timeout.
    pub read_total_constant: u32,
    /// Per-byte component of the write total timeout.
    pub write_total_multiplier: u32,
    /// Fixed component of the write total timeout.
    pub write_total_constant: u32,
}

/// How a read of a given length should wait for data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ReadPolicy {
    /// Complete with whatever is buffered, never wait.
    pub return_immediately: bool,
    /// Complete as soon as any data has been copied.
    pub return_on_any: bool,
    /// Shrink the request to a single byte before waiting.
    pub crunch_to_one: bool,
    pub total: Option<Duration>,
    pub interval: Option<Duration>,
}

impl Timeouts {
    /// Rejects an infinite interval and multiplier unless the constant bounds
    /// the wait.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_interval == u32::MAX
            && self.read_total_multiplier == u32::MAX
            && (self.read_total_constant == 0 || self.read_total_constant == u32::MAX)
        {
            return Err(ConfigError::InvalidTimeouts);
        }
        Ok(())
    }

    pub(crate) fn read_policy(&self, length: usize) -> ReadPolicy {
        let mut policy = ReadPolicy {
            return_immediately: false,
            return_on_any: false,
            crunch_to_one: false,
            total: None,
            interval: None,
        };
        let mut total = None;
        if self.read_interval != 0 && self.read_interval != u32::MAX {
            policy.interval = Some(Duration::from_millis(self.read_interval.into()));
        }
        if self.read_interval == u32::MAX {
            if self.read_total_constant == 0 && self.read_total_multiplier == 0 {
                policy.return_immediately = true;
            } else if self.read_total_constant != u32::MAX
                && self.read_total_multiplier != u32::MAX
            {
                policy.return_on_any = true;
                total = Some((self.read_total_multiplier, self.read_total_constant));
            } else if self.read_total_constant != 0 && self.read_total_constant != u32::MAX {
                policy.return_on_any = true;
                policy.crunch_to_one = true;
                total = Some((0, self.read_total_constant));
            }
        } else if self.read_total_multiplier != 0 || self.read_total_constant != 0 {
            total = Some((self.read_total_multiplier, self.read_total_constant));
        }
        policy.total = total.map(|(multiplier, constant)| total_time(multiplier, constant, length));
        policy
    }

    pub(crate) fn write_total(&self, length: usize) -> Option<Duration> {
        (self.write_total_multiplier != 0 || self.write_total_constant != 0).then(|| {
            total_time(
                self.write_total_multiplier,
                self.write_total_constant,
                length,
            )
        })
    }
}

fn total_time(multiplier: u32, constant: u32, length: usize) -> Duration {
    let millis = u64::from(multiplier)
        .saturating_mul(length as u64)
        .saturating_add(constant.into());
    Duration::from_millis(millis)
}

/// Construction-time configuration of a serial device.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device name used in logs and diagnostic records.
    pub name: String,
    /// Size of the receive interrupt buffer in bytes.
    pub buffer_size: usize,
    /// Initial flow control policy.
    pub hand_flow: HandFlow,
    /// Initial timeouts.
    pub timeouts: Timeouts,
    /// Initial special characters.
    pub chars: SerialChars,
    /// Line speed, used to compute the duration of one character.
    pub baud_rate: u32,
}

const DEFAULT_BUFFER_SIZE: usize = 4096;

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            name: "COM1".into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            hand_flow: HandFlow::new(DEFAULT_BUFFER_SIZE),
            timeouts: Timeouts::default(),
            chars: SerialChars::default(),
            baud_rate: 9600,
        }
    }
}

impl SerialConfig {
    /// Validates every field against the others.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ZeroBaudRate);
        }
        self.hand_flow.validate(self.buffer_size)?;
        self.chars.validate(&self.hand_flow)?;
        self.timeouts.validate()
    }
}
