/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Primitive data structures exchanged with verbs providers.
//!
//! Primitives:
//! - `PortSpace`, `QpType`, `AccessFlags`: creation parameters, numerically
//!   compatible with librdmacm and libibverbs.
//! - `QpState`, `QpAttr`, `QpAttrMask`: queue pair modify and query.
//! - `CmEventKind`, `CmEvent`: connection manager events as decoded by the
//!   event bridge.
//! - `ConnParam`: connect/accept parameters, including private data.
//! - `SendWr`, `RecvWr`, `Sge`: work requests posted to a queue pair.
//! - `WorkCompletion`: decoded completion queue entry, with `WcStatus` and
//!   `WcOpcode`.
//! - `MemoryRegionInfo`: keys and registration handle of a memory region.
//! - `DeviceAttr`: subset of the device attributes used for connection setup.

use std::fmt;
use std::ops::BitOr;

use iobridge::Handle;
use iobridge::NativePtr;
use serde::Deserialize;
use serde::Serialize;

/// Connection manager port space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PortSpace {
    /// IP over InfiniBand.
    Ipoib = 0x0002,
    /// Reliable connected, TCP-like semantics.
    Tcp = 0x0106,
    /// Unreliable datagram, UDP-like semantics.
    Udp = 0x0111,
    /// Native InfiniBand addressing.
    Ib = 0x013f,
}

/// Queue pair transport type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum QpType {
    /// Reliable connected
    #[default]
    Rc = 2,
    /// Unreliable connected
    Uc = 3,
    /// Unreliable datagram
    Ud = 4,
}

/// Queue pair capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpCap {
    /// `max_send_wr` - Outstanding send work requests.
    pub max_send_wr: u32,
    /// `max_recv_wr` - Outstanding receive work requests.
    pub max_recv_wr: u32,
    /// `max_send_sge` - Scatter/gather entries per send work request.
    pub max_send_sge: u32,
    /// `max_recv_sge` - Scatter/gather entries per receive work request.
    pub max_recv_sge: u32,
    /// `max_inline_data` - Bytes that may be posted inline.
    pub max_inline_data: u32,
}

impl Default for QpCap {
    fn default() -> Self {
        Self {
            max_send_wr: 64,
            max_recv_wr: 64,
            max_send_sge: 4,
            max_recv_sge: 4,
            max_inline_data: 0,
        }
    }
}

/// Queue pair creation parameters. The completion queues are handles of the
/// dispatcher creating the queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    /// Completion queue for send work requests.
    pub send_cq: Handle,
    /// Completion queue for receive work requests.
    pub recv_cq: Handle,
    /// Transport type.
    pub qp_type: QpType,
    /// Capacities.
    pub cap: QpCap,
    /// Generate a completion for every send work request.
    pub sq_sig_all: bool,
}

/// Memory region access permissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// No remote access, local read only.
    pub const NONE: AccessFlags = AccessFlags(0);
    /// Local write access.
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1);
    /// Remote write access.
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    /// Remote read access.
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);
    /// Remote atomic access.
    pub const REMOTE_ATOMIC: AccessFlags = AccessFlags(1 << 3);

    /// Access used for buffers that take part in two-sided and one-sided
    /// transfers.
    pub const fn default_remote() -> Self {
        AccessFlags(Self::LOCAL_WRITE.0 | Self::REMOTE_WRITE.0 | Self::REMOTE_READ.0)
    }

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Queue pair state, numbered as `enum ibv_qp_state`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum QpState {
    #[default]
    Reset = 0,
    Init = 1,
    /// Ready to receive.
    Rtr = 2,
    /// Ready to send.
    Rts = 3,
    /// Send queue drained.
    Sqd = 4,
    /// Send queue error.
    Sqe = 5,
    Error = 6,
}

impl QpState {
    /// Whether a modify may move a queue pair from `self` to `to`. Any state
    /// may go to `Reset` or `Error`.
    pub fn can_move_to(self, to: QpState) -> bool {
        use QpState::*;
        matches!(
            (self, to),
            (_, Reset)
                | (_, Error)
                | (Reset, Init)
                | (Init, Init)
                | (Init, Rtr)
                | (Rtr, Rts)
                | (Rts, Rts)
                | (Rts, Sqd)
                | (Sqd, Sqd)
                | (Sqd, Rts)
                | (Sqe, Rts)
        )
    }

    /// Whether a pair in this state accepts inbound traffic.
    pub fn receives(self) -> bool {
        matches!(self, QpState::Rtr | QpState::Rts | QpState::Sqd | QpState::Sqe)
    }
}

/// Queue pair attributes. A modify reads only the fields its
/// [`QpAttrMask`] selects; a query fills all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpAttr {
    pub qp_state: QpState,
    /// Local ack timeout exponent, at most [`QpAttr::MAX_TIMEOUT`].
    pub timeout: u8,
    /// Transport retries, at most [`QpAttr::MAX_RETRY`].
    pub retry_cnt: u8,
    /// Receiver-not-ready retries, at most [`QpAttr::MAX_RETRY`]. 7 retries
    /// forever.
    pub rnr_retry: u8,
    /// Receiver-not-ready NAK timer code, at most [`QpAttr::MAX_TIMEOUT`].
    pub min_rnr_timer: u8,
}

impl QpAttr {
    pub const MAX_TIMEOUT: u8 = 31;
    pub const MAX_RETRY: u8 = 7;
}

/// Selects the [`QpAttr`] fields a modify applies, numbered as
/// `enum ibv_qp_attr_mask`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QpAttrMask(u32);

impl QpAttrMask {
    pub const STATE: QpAttrMask = QpAttrMask(1);
    pub const TIMEOUT: QpAttrMask = QpAttrMask(1 << 9);
    pub const RETRY_CNT: QpAttrMask = QpAttrMask(1 << 10);
    pub const RNR_RETRY: QpAttrMask = QpAttrMask(1 << 11);
    pub const MIN_RNR_TIMER: QpAttrMask = QpAttrMask(1 << 15);

    /// Every bit a modify can apply.
    pub const SUPPORTED: QpAttrMask = QpAttrMask(
        Self::STATE.0 | Self::TIMEOUT.0 | Self::RETRY_CNT.0 | Self::RNR_RETRY.0 | Self::MIN_RNR_TIMER.0,
    );

    /// Wraps a raw mask received from a caller.
    pub const fn from_bits(bits: u32) -> Self {
        QpAttrMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: QpAttrMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QpAttrMask {
    type Output = QpAttrMask;

    fn bitor(self, rhs: QpAttrMask) -> QpAttrMask {
        QpAttrMask(self.0 | rhs.0)
    }
}

/// Connection manager event kinds, numbered as librdmacm numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CmEventKind {
    AddrResolved = 0,
    AddrError = 1,
    RouteResolved = 2,
    RouteError = 3,
    ConnectRequest = 4,
    ConnectResponse = 5,
    ConnectError = 6,
    Unreachable = 7,
    Rejected = 8,
    Established = 9,
    Disconnected = 10,
    DeviceRemoval = 11,
    MulticastJoin = 12,
    MulticastError = 13,
    AddrChange = 14,
    TimewaitExit = 15,
}

impl CmEventKind {
    /// Decodes a native event code.
    pub fn from_raw(raw: u32) -> Option<Self> {
        use CmEventKind::*;
        const KINDS: [CmEventKind; 16] = [
            AddrResolved,
            AddrError,
            RouteResolved,
            RouteError,
            ConnectRequest,
            ConnectResponse,
            ConnectError,
            Unreachable,
            Rejected,
            Established,
            Disconnected,
            DeviceRemoval,
            MulticastJoin,
            MulticastError,
            AddrChange,
            TimewaitExit,
        ];
        KINDS.get(raw as usize).copied()
    }

    /// The native event code.
    pub fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Event record as a provider decodes it, before handles are assigned.
#[derive(Debug)]
pub struct RawCmEvent<Id> {
    /// Event kind.
    pub kind: CmEventKind,
    /// Native status, zero or a negative errno.
    pub status: i32,
    /// Listening id the event arrived on, for connect requests.
    pub listen_id: Option<NativePtr<Id>>,
    /// Connection id the event concerns.
    pub id: Option<NativePtr<Id>>,
    /// Private data carried by the peer.
    pub private_data: Vec<u8>,
}

/// Event returned by a successful poll of an event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmEvent {
    /// Event kind.
    pub kind: CmEventKind,
    /// Native status, zero or a negative errno.
    pub status: i32,
    /// Handle of the listening id, for connect requests.
    pub listen_id: Option<Handle>,
    /// Handle of the connection id the event concerns.
    pub id: Option<Handle>,
    /// Private data carried by the peer.
    pub private_data: Vec<u8>,
}

impl CmEvent {
    /// The listening handle in boundary form, `-1` when absent.
    pub fn listen_handle(&self) -> i64 {
        self.listen_id.unwrap_or(Handle::INVALID).as_i64()
    }

    /// The connection handle in boundary form, `-1` when absent.
    pub fn id_handle(&self) -> i64 {
        self.id.unwrap_or(Handle::INVALID).as_i64()
    }
}

/// Connect and accept parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParam {
    /// `private_data` - Bytes delivered to the peer with the request or reply.
    pub private_data: Vec<u8>,
    /// `responder_resources` - Outstanding RDMA reads accepted from the peer.
    /// Zero means the device maximum.
    pub responder_resources: u8,
    /// `initiator_depth` - Outstanding RDMA reads issued to the peer. Zero
    /// means the device maximum.
    pub initiator_depth: u8,
    /// `retry_count` - Transport retries on timeout.
    pub retry_count: u8,
    /// `rnr_retry_count` - Retries on receiver-not-ready.
    pub rnr_retry_count: u8,
}

/// Device attributes consulted during connection setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttr {
    /// Outstanding RDMA reads a queue pair can serve.
    pub max_qp_rd_atom: u32,
    /// Outstanding RDMA reads a queue pair can initiate.
    pub max_qp_init_rd_atom: u32,
    /// Maximum number of queue pairs.
    pub max_qp: u32,
    /// Maximum number of completion queues.
    pub max_cq: u32,
    /// Maximum entries per completion queue.
    pub max_cqe: u32,
    /// Maximum number of memory regions.
    pub max_mr: u32,
    /// Maximum number of protection domains.
    pub max_pd: u32,
    /// Maximum work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather entries per work request.
    pub max_sge: u32,
}

/// Keys of a registered memory region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrKeys {
    /// Local key, used in local scatter/gather entries.
    pub lkey: u32,
    /// Remote key, handed to peers for one-sided access.
    pub rkey: u32,
    /// Native registration handle.
    pub registration: u32,
}

/// Result of registering a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegionInfo {
    /// Handle of the memory region.
    pub handle: Handle,
    /// Local key.
    pub lkey: u32,
    /// Remote key.
    pub rkey: u32,
    /// Native registration handle.
    pub registration: u32,
}

/// Scatter/gather entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sge {
    /// Buffer address.
    pub addr: u64,
    /// Buffer length in bytes.
    pub length: u32,
    /// Local key of the region holding the buffer.
    pub lkey: u32,
}

/// Send side opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum WrOpcode {
    RdmaWrite = 0,
    RdmaWriteWithImm = 1,
    #[default]
    Send = 2,
    SendWithImm = 3,
    RdmaRead = 4,
}

/// Send work request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWr {
    /// Caller chosen id returned in the completion.
    pub wr_id: u64,
    /// Local buffers.
    pub sg_list: Vec<Sge>,
    /// Operation.
    pub opcode: WrOpcode,
    /// Generate a completion for this request.
    pub signaled: bool,
    /// Immediate data for the `*WithImm` opcodes.
    pub imm_data: Option<u32>,
    /// Remote address for one-sided operations.
    pub remote_addr: u64,
    /// Remote key for one-sided operations.
    pub rkey: u32,
}

/// Receive work request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvWr {
    /// Caller chosen id returned in the completion.
    pub wr_id: u64,
    /// Local buffers to scatter incoming data into.
    pub sg_list: Vec<Sge>,
}

/// Work completion status, numbered as libibverbs numbers them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum WcStatus {
    #[default]
    Success = 0,
    LocLenErr = 1,
    LocQpOpErr = 2,
    LocProtErr = 4,
    WrFlushErr = 5,
    LocAccessErr = 8,
    RemInvReqErr = 9,
    RemAccessErr = 10,
    RemOpErr = 11,
    RetryExcErr = 12,
    RnrRetryExcErr = 13,
    GeneralErr = 21,
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum WcOpcode {
    #[default]
    Send = 0,
    RdmaWrite = 1,
    RdmaRead = 2,
    Recv = 128,
    RecvRdmaWithImm = 129,
}

impl From<WrOpcode> for WcOpcode {
    fn from(op: WrOpcode) -> Self {
        match op {
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
            WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        }
    }
}

/// Decoded completion queue entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// `wr_id` - Work Request ID, used to identify the completed operation
    pub wr_id: u64,
    /// `status` - Completion status
    pub status: WcStatus,
    /// `opcode` - Type of operation that completed
    pub opcode: WcOpcode,
    /// `vendor_err` - Vendor specific error syndrome
    pub vendor_err: u32,
    /// `byte_len` - Bytes transferred, for receives and reads
    pub byte_len: u32,
    /// `imm_data` - Immediate data, if any
    pub imm_data: Option<u32>,
    /// `qp_num` - Queue Pair Number
    pub qp_num: u32,
    /// `src_qp` - Source Queue Pair Number
    pub src_qp: u32,
}

impl WorkCompletion {
    /// Whether the operation completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    /// The failure status, if the operation failed.
    pub fn error(&self) -> Option<(WcStatus, u32)> {
        if self.is_success() {
            None
        } else {
            Some((self.status, self.vendor_err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qp_state_transitions() {
        assert!(QpState::Reset.can_move_to(QpState::Init));
        assert!(QpState::Init.can_move_to(QpState::Rtr));
        assert!(QpState::Rtr.can_move_to(QpState::Rts));
        assert!(QpState::Rts.can_move_to(QpState::Sqd));
        assert!(QpState::Sqd.can_move_to(QpState::Rts));
        assert!(QpState::Rts.can_move_to(QpState::Error));
        assert!(QpState::Error.can_move_to(QpState::Reset));
        assert!(!QpState::Reset.can_move_to(QpState::Rts));
        assert!(!QpState::Error.can_move_to(QpState::Rts));
        assert!(!QpState::Init.can_move_to(QpState::Rts));
        assert!(QpState::Sqd.receives());
        assert!(!QpState::Init.receives());
    }

    #[test]
    fn test_qp_attr_mask_bits() {
        let mask = QpAttrMask::STATE | QpAttrMask::RETRY_CNT;
        assert_eq!(mask.bits(), 0x401);
        assert!(QpAttrMask::SUPPORTED.contains(mask));
        assert!(!QpAttrMask::SUPPORTED.contains(QpAttrMask::from_bits(1 << 7)));
        assert!(QpAttrMask::default().is_empty());
    }

    #[test]
    fn test_cm_event_kind_codes() {
        for raw in 0..16 {
            let kind = CmEventKind::from_raw(raw).unwrap();
            assert_eq!(kind.raw(), raw);
        }
        assert_eq!(CmEventKind::from_raw(4), Some(CmEventKind::ConnectRequest));
        assert_eq!(CmEventKind::from_raw(16), None);
    }

    #[test]
    fn test_access_flags() {
        let access = AccessFlags::default_remote();
        assert_eq!(access.bits(), 7);
        assert!(access.contains(AccessFlags::REMOTE_WRITE));
        assert!(!access.contains(AccessFlags::REMOTE_ATOMIC));
        assert!((AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ).contains(AccessFlags::REMOTE_READ));
    }

    #[test]
    fn test_wr_opcode_maps_to_wc_opcode() {
        assert_eq!(WcOpcode::from(WrOpcode::RdmaWriteWithImm), WcOpcode::RdmaWrite);
        assert_eq!(WcOpcode::from(WrOpcode::SendWithImm), WcOpcode::Send);
        assert_eq!(WcOpcode::from(WrOpcode::RdmaRead), WcOpcode::RdmaRead);
    }

    #[test]
    fn test_absent_handles_read_as_minus_one() {
        let event = CmEvent {
            kind: CmEventKind::Established,
            status: 0,
            listen_id: None,
            id: Some(Handle::from_raw(0x40)),
            private_data: Vec::new(),
        };
        assert_eq!(event.listen_handle(), -1);
        assert_eq!(event.id_handle(), 0x40);
        assert!(WorkCompletion::default().is_success());
    }
}
