//! Wire types for the vhost-user framing: the 16-byte header, its flag
//! bits, the request-code enumeration, and the fixed-shape payloads (§4.E).

use std::convert::TryInto;

/// Maximum payload bytes in one frame, header excluded.
pub const MAX_PAYLOAD_SIZE: u32 = 8192;
/// Maximum ancillary fds `SCM_RIGHTS` can carry in one frame.
pub const MAX_FDS: usize = 32;
/// Maximum memory regions one `set-memory-table` payload can list.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Protocol version carried in flag bits 0-1; this transport only speaks
/// version 1.
pub const PROTOCOL_VERSION: u32 = 1;
const FLAG_VERSION_MASK: u32 = 0x3;
const FLAG_REPLY: u32 = 1 << 2;
const FLAG_NEED_REPLY: u32 = 1 << 3;

/// Set alongside the queue index in a vring-kick/-call scalar payload to
/// convey "no fd" without attaching ancillary data (§4.E "Fd passing").
pub const VHOST_USER_VRING_NOFD_MASK: u64 = 1 << 8;

/// Request codes. Contiguous small-integer enumeration per §4.E; values
/// follow the order real vhost-user backends assign them so a packet
/// capture lines up with what any other implementation would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestCode {
    GetFeatures = 1,
    SetFeatures = 2,
    SetOwner = 3,
    ResetOwner = 4,
    SetMemTable = 5,
    SetLogBase = 6,
    SetLogFd = 7,
    SetVringNum = 8,
    SetVringAddr = 9,
    SetVringBase = 10,
    GetVringBase = 11,
    SetVringKick = 12,
    SetVringCall = 13,
    SetVringErr = 14,
    GetProtocolFeatures = 15,
    SetProtocolFeatures = 16,
    GetQueueNum = 17,
    SetVringEnable = 18,
    SetBackendReqFd = 19,
    GetConfig = 20,
    SetConfig = 21,
    AddMemReg = 22,
    RemMemReg = 23,
    ResetDevice = 24,
    SetStatus = 25,
    GetStatus = 26,
    /// Backend-initiated "slave fd" channel. Named but never issued or
    /// handled: the accompanying `REQUEST_BACKEND` protocol feature bit
    /// is always cleared during negotiation (§9 Open Questions).
    SetSlaveReqFd = 27,
    /// IOTLB message channel. Same status as `SetSlaveReqFd`.
    IotlbMsg = 28,
    /// Postcopy migration listen advisory. Never issued.
    PostcopyAdvise = 29,
    /// Postcopy migration listen. Never issued.
    PostcopyListen = 30,
    /// Postcopy end-of-migration advisory. Never issued.
    PostcopyEnd = 31,
    /// Shared inflight-buffer fd exchange. Never issued.
    GetInflightFd = 32,
    /// Shared inflight-buffer fd exchange. Never issued.
    SetInflightFd = 33,
}

impl RequestCode {
    fn from_u32(v: u32) -> Option<RequestCode> {
        use RequestCode::*;
        let code = match v {
            1 => GetFeatures,
            2 => SetFeatures,
            3 => SetOwner,
            4 => ResetOwner,
            5 => SetMemTable,
            6 => SetLogBase,
            7 => SetLogFd,
            8 => SetVringNum,
            9 => SetVringAddr,
            10 => SetVringBase,
            11 => GetVringBase,
            12 => SetVringKick,
            13 => SetVringCall,
            14 => SetVringErr,
            15 => GetProtocolFeatures,
            16 => SetProtocolFeatures,
            17 => GetQueueNum,
            18 => SetVringEnable,
            19 => SetBackendReqFd,
            20 => GetConfig,
            21 => SetConfig,
            22 => AddMemReg,
            23 => RemMemReg,
            24 => ResetDevice,
            25 => SetStatus,
            26 => GetStatus,
            27 => SetSlaveReqFd,
            28 => IotlbMsg,
            29 => PostcopyAdvise,
            30 => PostcopyListen,
            31 => PostcopyEnd,
            32 => GetInflightFd,
            33 => SetInflightFd,
            _ => return None,
        };
        Some(code)
    }
}

/// Protocol feature bits negotiated via `get/set-protocol-features`. Only
/// the subset this core understands; everything else is masked off
/// unconditionally (§4.E "Protocol feature negotiation").
pub mod protocol_features {
    pub const MULTIQUEUE: u64 = 1 << 0;
    pub const REPLY_ACK: u64 = 1 << 3;
    /// Backend-initiated request channel. Its handler is intentionally
    /// absent (§9 Open Questions); always cleared before
    /// `set-protocol-features` is sent.
    pub const REQUEST_BACKEND: u64 = 1 << 5;
    pub const DEVICE_STATE: u64 = 1 << 8;
    pub const CONFIGURE_MEM_SLOTS: u64 = 1 << 10;
    pub const DEVICE_RESET: u64 = 1 << 13;

    /// The full mask this transport ever leaves set. Every bit outside
    /// this set is cleared from the backend's advertised features before
    /// they are echoed back (§4.E).
    pub const SUPPORTED_MASK: u64 =
        MULTIQUEUE | REPLY_ACK | DEVICE_STATE | CONFIGURE_MEM_SLOTS | DEVICE_RESET;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHeader {
    pub request: u32,
    pub flags: u32,
    pub payload_size: u32,
}

impl MessageHeader {
    /// Total wire size of the header (§4.E: "16-byte header"). The three
    /// named fields account for 12 bytes; the remaining 4 are reserved and
    /// always sent as zero.
    pub const WIRE_SIZE: usize = 16;

    pub fn request(code: RequestCode, payload_size: u32, need_reply: bool) -> MessageHeader {
        let mut flags = PROTOCOL_VERSION & FLAG_VERSION_MASK;
        if need_reply {
            flags |= FLAG_NEED_REPLY;
        }
        MessageHeader {
            request: code as u32,
            flags,
            payload_size,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    pub fn needs_reply(&self) -> bool {
        self.flags & FLAG_NEED_REPLY != 0
    }

    pub fn version(&self) -> u32 {
        self.flags & FLAG_VERSION_MASK
    }

    pub fn request_code(&self) -> Option<RequestCode> {
        RequestCode::from_u32(self.request)
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.request.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::WIRE_SIZE]) -> MessageHeader {
        MessageHeader {
            request: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            payload_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// `{index, num}` payload shape shared by `set-vring-num`, `set-vring-base`,
/// `get-vring-base`, and the kick/call no-fd scalar form.
#[derive(Debug, Clone, Copy, Default)]
pub struct VringState {
    pub index: u32,
    pub num: u32,
}

impl VringState {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<VringState> {
        if buf.len() != Self::WIRE_SIZE {
            return None;
        }
        Some(VringState {
            index: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            num: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

/// `set-vring-addr` payload: index, flags, and three host-virtual ring
/// pointers plus a log address (unused by this core, always zero).
#[derive(Debug, Clone, Copy, Default)]
pub struct VringAddr {
    pub index: u32,
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

impl VringAddr {
    pub const WIRE_SIZE: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.desc_user_addr.to_le_bytes());
        buf[16..24].copy_from_slice(&self.used_user_addr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.avail_user_addr.to_le_bytes());
        buf[32..40].copy_from_slice(&self.log_guest_addr.to_le_bytes());
        buf
    }
}

/// One entry of a `set-memory-table` payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTableRegion {
    pub guest_phys_addr: u64,
    pub len: u64,
    pub host_virt_addr: u64,
    pub fd_offset: u64,
}

impl MemoryTableRegion {
    pub const WIRE_SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.guest_phys_addr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.host_virt_addr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.fd_offset.to_le_bytes());
        buf
    }
}

/// Serializes a `set-memory-table` payload: a 4-byte region count padded
/// to 8 bytes, followed by up to [`MAX_MEMORY_REGIONS`] region entries.
pub fn encode_memory_table(regions: &[MemoryTableRegion]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + regions.len() * MemoryTableRegion::WIRE_SIZE);
    buf.extend_from_slice(&(regions.len() as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    for region in regions {
        buf.extend_from_slice(&region.to_bytes());
    }
    buf
}

pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn decode_u64(buf: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(0..8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = MessageHeader::request(RequestCode::GetFeatures, 8, true);
        let bytes = header.to_bytes();
        let back = MessageHeader::from_bytes(&bytes);
        assert_eq!(back.request, RequestCode::GetFeatures as u32);
        assert!(back.needs_reply());
        assert_eq!(back.version(), PROTOCOL_VERSION);
    }

    #[test]
    fn reply_flag_is_distinguishable_from_need_reply() {
        let mut header = MessageHeader::request(RequestCode::SetFeatures, 8, false);
        header.flags |= FLAG_REPLY;
        assert!(header.is_reply());
        assert!(!header.needs_reply());
    }

    #[test]
    fn supported_protocol_mask_excludes_request_backend() {
        assert_eq!(
            protocol_features::SUPPORTED_MASK & protocol_features::REQUEST_BACKEND,
            0
        );
    }

    #[test]
    fn memory_table_encoding_starts_with_region_count() {
        let regions = vec![MemoryTableRegion {
            guest_phys_addr: 0,
            len: 0x1000,
            host_virt_addr: 0x7f00_0000_0000,
            fd_offset: 0,
        }];
        let bytes = encode_memory_table(&regions);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(bytes.len(), 8 + MemoryTableRegion::WIRE_SIZE);
    }
}
