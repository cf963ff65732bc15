/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Primitive data structures exchanged with NVMe providers.
//!
//! Primitives:
//! - `TransportId`: selects the controllers a probe enumerates. Built from a
//!   `TransportType`, an `AddressFamily` and the address strings.
//! - `CompletionStatus`: status code type and status code of a finished
//!   command, kept verbatim.
//! - `ControllerData`, `ControllerOptions`: identify data and negotiated
//!   options of an attached controller.
//! - `QpairOptions`: I/O queue pair allocation parameters.
//! - `TargetOptions`, `NvmfSubtype`, `NvmfSubsystemMode`, `TransportName`:
//!   NVMe over fabrics target parameters.

use std::fmt;
use std::str::FromStr;

use iobridge::BridgeError;
use serde::Deserialize;
use serde::Serialize;

/// Longest NVMe qualified name accepted, excluding the terminator.
pub const NQN_MAX_LEN: usize = 223;
/// Longest transport address accepted.
pub const TRADDR_MAX_LEN: usize = 256;
/// Longest transport service id accepted.
pub const TRSVCID_MAX_LEN: usize = 32;
/// Qualified name of the well-known discovery subsystem.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// NVMe transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransportType {
    /// Local PCIe attached controller.
    Pcie = 256,
    /// NVMe over fabrics, RDMA transport.
    Rdma = 1,
}

/// Fabrics address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum AddressFamily {
    Ipv4 = 0x1,
    Ipv6 = 0x2,
    Ib = 0x3,
    Fc = 0x4,
    /// Used by PCIe transport ids.
    IntraHost = 0xfe,
}

/// Selects the controllers visible to a probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportId {
    /// `trtype` - Transport type.
    pub trtype: TransportType,
    /// `adrfam` - Address family.
    pub adrfam: AddressFamily,
    /// `traddr` - Transport address: a PCI address or a fabrics host. Empty
    /// matches every local controller.
    pub traddr: String,
    /// `trsvcid` - Transport service id, the port for RDMA.
    pub trsvcid: String,
    /// `subnqn` - Subsystem qualified name. Empty matches any subsystem.
    pub subnqn: String,
}

impl TransportId {
    /// A validated transport id.
    pub fn new(
        trtype: TransportType,
        adrfam: AddressFamily,
        traddr: &str,
        trsvcid: &str,
        subnqn: &str,
    ) -> Result<Self, BridgeError> {
        check_len("transport address", traddr, TRADDR_MAX_LEN)?;
        check_len("service id", trsvcid, TRSVCID_MAX_LEN)?;
        check_len("subsystem nqn", subnqn, NQN_MAX_LEN)?;
        if trtype == TransportType::Pcie && adrfam != AddressFamily::IntraHost {
            return Err(BridgeError::invalid(format!(
                "pcie transport requires the intra-host address family, got {:?}",
                adrfam
            )));
        }
        if trtype == TransportType::Rdma && adrfam == AddressFamily::IntraHost {
            return Err(BridgeError::invalid("rdma transport requires a fabrics address family"));
        }
        Ok(Self {
            trtype,
            adrfam,
            traddr: traddr.to_string(),
            trsvcid: trsvcid.to_string(),
            subnqn: subnqn.to_string(),
        })
    }

    /// Local controller at `pci_address`, or every local controller if empty.
    pub fn pcie(pci_address: &str) -> Result<Self, BridgeError> {
        Self::new(TransportType::Pcie, AddressFamily::IntraHost, pci_address, "", "")
    }

    /// Fabrics controllers of `subnqn` reachable at `address:service_id`.
    pub fn rdma(
        adrfam: AddressFamily,
        address: &str,
        service_id: &str,
        subnqn: &str,
    ) -> Result<Self, BridgeError> {
        if address.is_empty() {
            return Err(BridgeError::invalid("rdma transport requires an address"));
        }
        Self::new(TransportType::Rdma, adrfam, address, service_id, subnqn)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trtype:{:?} adrfam:{:?} traddr:{} trsvcid:{} subnqn:{}",
            self.trtype, self.adrfam, self.traddr, self.trsvcid, self.subnqn
        )
    }
}

fn check_len(what: &str, value: &str, max: usize) -> Result<(), BridgeError> {
    if value.len() > max {
        return Err(BridgeError::invalid(format!(
            "{} is {} bytes, at most {} allowed",
            what,
            value.len(),
            max
        )));
    }
    if value.contains('\0') {
        return Err(BridgeError::invalid(format!("{} contains a NUL byte", what)));
    }
    Ok(())
}

/// Validates a subsystem qualified name.
pub fn check_nqn(nqn: &str) -> Result<(), BridgeError> {
    if !nqn.starts_with("nqn.") {
        return Err(BridgeError::invalid(format!("{:?} is not an nqn", nqn)));
    }
    check_len("subsystem nqn", nqn, NQN_MAX_LEN)
}

/// Status code type of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCodeType {
    Generic = 0x0,
    CommandSpecific = 0x1,
    MediaError = 0x2,
    VendorSpecific = 0x7,
}

impl StatusCodeType {
    /// Decodes a raw status code type.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0x0 => Some(StatusCodeType::Generic),
            0x1 => Some(StatusCodeType::CommandSpecific),
            0x2 => Some(StatusCodeType::MediaError),
            0x7 => Some(StatusCodeType::VendorSpecific),
            _ => None,
        }
    }
}

/// Generic command status codes the bridge itself reasons about.
pub mod generic_status {
    pub const SUCCESS: i32 = 0x00;
    pub const INVALID_OPCODE: i32 = 0x01;
    pub const INVALID_FIELD: i32 = 0x02;
    pub const DATA_TRANSFER_ERROR: i32 = 0x04;
    pub const INTERNAL_DEVICE_ERROR: i32 = 0x06;
    pub const ABORTED_SQ_DELETION: i32 = 0x08;
    pub const INVALID_NAMESPACE_OR_FORMAT: i32 = 0x0b;
    pub const LBA_OUT_OF_RANGE: i32 = 0x80;
    pub const CAPACITY_EXCEEDED: i32 = 0x81;
    pub const NAMESPACE_NOT_READY: i32 = 0x82;
}

/// Status of a finished command, copied verbatim from the native completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionStatus {
    /// `sct` - Status code type.
    pub sct: i32,
    /// `sc` - Status code.
    pub sc: i32,
}

impl CompletionStatus {
    /// Successful completion.
    pub const SUCCESS: CompletionStatus = CompletionStatus { sct: 0, sc: 0 };

    /// A generic command status.
    pub const fn generic(sc: i32) -> Self {
        Self {
            sct: StatusCodeType::Generic as i32,
            sc,
        }
    }

    /// Whether the command failed.
    pub fn is_error(&self) -> bool {
        self.sct != 0 || self.sc != 0
    }

    /// Decoded status code type, if it is a known one.
    pub fn code_type(&self) -> Option<StatusCodeType> {
        StatusCodeType::from_raw(self.sct)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct={:#x} sc={:#x}", self.sct, self.sc)
    }
}

/// Direction of a namespace I/O command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

/// Command arbitration mechanism selected at controller initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ArbitrationMechanism {
    #[default]
    RoundRobin = 0x0,
    WeightedRoundRobin = 0x1,
    VendorSpecific = 0x7,
}

/// Identify controller data, the fields the bridge exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerData {
    /// `vid` - PCI vendor id.
    pub vid: u16,
    /// `ssvid` - PCI subsystem vendor id.
    pub ssvid: u16,
    /// `serial` - Serial number, at most 20 bytes.
    pub serial: String,
    /// `model` - Model number, at most 40 bytes.
    pub model: String,
    /// `firmware` - Firmware revision, at most 8 bytes.
    pub firmware: String,
    /// `mdts` - Maximum data transfer size as a power of two of the minimum
    /// page size. Zero means no limit.
    pub mdts: u8,
    /// `cntlid` - Controller id.
    pub cntlid: u16,
    /// `version` - Raw version register: major in bits 31:16, minor in 15:8,
    /// tertiary in 7:0.
    pub version: u32,
}

impl ControllerData {
    /// Major version.
    pub fn version_major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// Minor version.
    pub fn version_minor(&self) -> u8 {
        (self.version >> 8) as u8
    }
}

/// Options a controller was initialized with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    /// `num_io_queues` - I/O queue pairs the controller may allocate.
    pub num_io_queues: u32,
    /// `use_cmb_sqs` - Submission queues placed in the controller memory
    /// buffer.
    pub use_cmb_sqs: bool,
    /// `arb_mechanism` - Command arbitration.
    pub arb_mechanism: ArbitrationMechanism,
    /// `keep_alive_timeout_ms` - Fabrics keep alive timeout.
    pub keep_alive_timeout_ms: u32,
    /// `transport_retry_count` - Fabrics transport retries.
    pub transport_retry_count: u8,
    /// `io_queue_size` - Largest I/O queue size.
    pub io_queue_size: u32,
    /// `hostnqn` - Host qualified name presented to the controller.
    pub hostnqn: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            num_io_queues: 1024,
            use_cmb_sqs: false,
            arb_mechanism: ArbitrationMechanism::RoundRobin,
            keep_alive_timeout_ms: 10_000,
            transport_retry_count: 4,
            io_queue_size: 256,
            hostnqn: String::from("nqn.2016-06.io.spdk:host"),
        }
    }
}

/// I/O queue pair priority, meaningful under weighted round robin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum QpairPriority {
    Urgent = 0,
    High = 1,
    Medium = 2,
    #[default]
    Low = 3,
}

impl fmt::Display for QpairPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QpairPriority::Urgent => "urgent",
            QpairPriority::High => "high",
            QpairPriority::Medium => "medium",
            QpairPriority::Low => "low",
        };
        f.write_str(name)
    }
}

impl FromStr for QpairPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(QpairPriority::Urgent),
            "high" => Ok(QpairPriority::High),
            "medium" => Ok(QpairPriority::Medium),
            "low" => Ok(QpairPriority::Low),
            other => Err(anyhow::anyhow!("unknown queue pair priority: {}", other)),
        }
    }
}

/// I/O queue pair allocation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpairOptions {
    /// `priority` - Arbitration priority.
    pub priority: QpairPriority,
    /// `io_queue_size` - Submission queue entries. Clamped to the
    /// controller's limit.
    pub io_queue_size: u32,
    /// `io_queue_requests` - Commands that may be outstanding at once.
    pub io_queue_requests: u32,
}

impl Default for QpairOptions {
    fn default() -> Self {
        Self {
            priority: QpairPriority::Low,
            io_queue_size: 256,
            io_queue_requests: 512,
        }
    }
}

/// NVMe over fabrics target parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetOptions {
    pub max_queue_depth: u16,
    pub max_conn_per_session: u16,
    pub in_capsule_data_size: u32,
    pub max_io_size: u32,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            max_queue_depth: 128,
            max_conn_per_session: 4,
            in_capsule_data_size: 4096,
            max_io_size: 131_072,
        }
    }
}

/// Kind of a target subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NvmfSubtype {
    Discovery = 1,
    Nvme = 2,
}

/// How a target subsystem reaches its controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NvmfSubsystemMode {
    /// Commands pass through to the attached controller.
    Direct = 0,
    /// Namespaces are virtualized by the target.
    Virtual = 1,
}

/// Fabrics transport a target listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportName {
    Rdma,
}

impl TransportName {
    /// Name understood by the native target.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportName::Rdma => "RDMA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_id_validation() {
        assert!(TransportId::pcie("0000:01:00.0").is_ok());
        assert!(TransportId::pcie("").is_ok());
        assert!(matches!(
            TransportId::new(TransportType::Pcie, AddressFamily::Ipv4, "", "", ""),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            TransportId::rdma(AddressFamily::Ipv4, "", "4420", ""),
            Err(BridgeError::InvalidArgument(_))
        ));
        let long_nqn = format!("nqn.{}", "x".repeat(NQN_MAX_LEN));
        assert!(matches!(
            TransportId::rdma(AddressFamily::Ipv4, "10.0.0.1", "4420", &long_nqn),
            Err(BridgeError::InvalidArgument(_))
        ));
        let trid = TransportId::rdma(AddressFamily::Ipv4, "10.0.0.1", "4420", "nqn.2016-06.io.spdk:cnode1")
            .unwrap();
        assert_eq!(trid.trtype as i32, 1);
        assert!(trid.to_string().contains("traddr:10.0.0.1"));
    }

    #[test]
    fn test_nqn_check() {
        assert!(check_nqn(DISCOVERY_NQN).is_ok());
        assert!(check_nqn("cnode1").is_err());
        assert!(check_nqn("nqn.a\0b").is_err());
    }

    #[test]
    fn test_status_is_error() {
        assert!(!CompletionStatus::SUCCESS.is_error());
        let lba = CompletionStatus::generic(generic_status::LBA_OUT_OF_RANGE);
        assert!(lba.is_error());
        assert_eq!(lba.code_type(), Some(StatusCodeType::Generic));
        assert!(CompletionStatus { sct: 1, sc: 0 }.is_error());
        assert_eq!(CompletionStatus { sct: 3, sc: 0 }.code_type(), None);
    }

    #[test]
    fn test_version_fields() {
        let data = ControllerData {
            vid: 0x8086,
            ssvid: 0x8086,
            serial: String::new(),
            model: String::new(),
            firmware: String::new(),
            mdts: 5,
            cntlid: 1,
            version: 0x0001_0300,
        };
        assert_eq!(data.version_major(), 1);
        assert_eq!(data.version_minor(), 3);
    }

    #[test]
    fn test_priority_parses() {
        assert_eq!("High".parse::<QpairPriority>().unwrap(), QpairPriority::High);
        assert!("fast".parse::<QpairPriority>().is_err());
    }
}
