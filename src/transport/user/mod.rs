//! The user transport implements the vhost capability set by exchanging
//! framed messages with a backend over a vhost-user UNIX stream socket
//! (component E). Message framing lives in [`message`], socket plumbing in
//! [`connection`]; this module drives both against the shared
//! [`super::VhostCapability`] trait.

pub mod connection;
pub mod message;

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use crate::error::{Result, VhostError};
use crate::eventfd::SENTINEL_FD;
use crate::memory::GuestRegion;

use self::connection::Connection;
use self::message::{
    decode_u64, encode_memory_table, encode_u64, protocol_features, MemoryTableRegion,
    MessageHeader, RequestCode, VringAddr, VringState, VHOST_USER_VRING_NOFD_MASK,
};

use super::{VhostCapability, VringAddrConfig};

/// A vhost-user backend reached over a UNIX stream socket.
pub struct UserTransport {
    conn: Connection,
    negotiated_protocol_features: u64,
}

impl UserTransport {
    pub fn new(stream: UnixStream) -> UserTransport {
        UserTransport {
            conn: Connection::new(stream),
            negotiated_protocol_features: 0,
        }
    }

    fn send_request(&mut self, code: RequestCode, payload: &[u8], fds: &[RawFd]) -> Result<()> {
        let header = MessageHeader::request(code, payload.len() as u32, false);
        self.conn.send(&header, payload, fds)
    }

    /// Sends a request with the need-reply flag set and waits for the
    /// matching reply (§4.E "Reply-ack"). `max_fds` bounds how many
    /// ancillary fds the reply may legally carry.
    fn request_reply(
        &mut self,
        code: RequestCode,
        payload: &[u8],
        fds: &[RawFd],
        max_fds: usize,
    ) -> Result<(Vec<u8>, Vec<RawFd>)> {
        let header = MessageHeader::request(code, payload.len() as u32, true);
        self.conn.send(&header, payload, fds)?;
        let (reply_header, reply_payload, reply_fds) = self.conn.recv(max_fds)?;
        if reply_header.request != code as u32 {
            return Err(VhostError::proto(format!(
                "reply request code {} does not match request {}",
                reply_header.request, code as u32
            )));
        }
        if !reply_header.is_reply() {
            return Err(VhostError::proto(
                "backend response is missing the reply flag".to_string(),
            ));
        }
        Ok((reply_payload, reply_fds))
    }

    fn request_u64_reply(&mut self, code: RequestCode) -> Result<u64> {
        let (payload, _) = self.request_reply(code, &[], &[], 0)?;
        decode_u64(&payload)
            .ok_or_else(|| VhostError::proto(format!("expected an 8-byte scalar reply to {code:?}")))
    }

    /// Negotiates the protocol-feature subset this transport understands.
    /// Every bit outside [`protocol_features::SUPPORTED_MASK`] — including
    /// the backend-initiated request channel, IOTLB, postcopy, and
    /// inflight-fd bits spec.md names but never exercises — is cleared
    /// before being sent back, regardless of what the backend advertised
    /// (§4.E, §9 Open Questions).
    fn negotiate_protocol_features(&mut self) -> Result<()> {
        let backend_mask = self.request_u64_reply(RequestCode::GetProtocolFeatures)?;
        let accepted = backend_mask & protocol_features::SUPPORTED_MASK;
        self.send_request(
            RequestCode::SetProtocolFeatures,
            &encode_u64(accepted),
            &[],
        )?;
        self.negotiated_protocol_features = accepted;
        Ok(())
    }
}

impl VhostCapability for UserTransport {
    fn init(&mut self, _start_index: u16) -> Result<()> {
        self.negotiate_protocol_features()
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_features(&mut self) -> Result<u64> {
        self.request_u64_reply(RequestCode::GetFeatures)
    }

    fn set_features(&mut self, features: u64) -> Result<()> {
        self.send_request(RequestCode::SetFeatures, &encode_u64(features), &[])
    }

    fn set_owner(&mut self) -> Result<()> {
        self.send_request(RequestCode::SetOwner, &[], &[])
    }

    fn reset_owner(&mut self) -> Result<()> {
        self.send_request(RequestCode::ResetOwner, &[], &[])
    }

    fn set_mem_table(&mut self, regions: &[GuestRegion]) -> Result<()> {
        let mut fds = Vec::with_capacity(regions.len());
        let mut entries = Vec::with_capacity(regions.len());
        for region in regions {
            let (fd, fd_offset) = region.fd_backing.ok_or_else(|| {
                VhostError::proto("user transport requires fd-backed memory regions".to_string())
            })?;
            fds.push(fd);
            entries.push(MemoryTableRegion {
                guest_phys_addr: region.guest_phys_addr,
                len: region.len,
                host_virt_addr: region.host_virt_addr,
                fd_offset,
            });
        }
        let payload = encode_memory_table(&entries);
        self.send_request(RequestCode::SetMemTable, &payload, &fds)
    }

    fn set_vring_num(&mut self, index: u16, num: u16) -> Result<()> {
        let state = VringState {
            index: index as u32,
            num: num as u32,
        };
        self.send_request(RequestCode::SetVringNum, &state.to_bytes(), &[])
    }

    fn set_vring_base(&mut self, index: u16, base: u16) -> Result<()> {
        let state = VringState {
            index: index as u32,
            num: base as u32,
        };
        self.send_request(RequestCode::SetVringBase, &state.to_bytes(), &[])
    }

    fn get_vring_base(&mut self, index: u16) -> Result<u16> {
        let request = VringState {
            index: index as u32,
            num: 0,
        };
        let (payload, _) =
            self.request_reply(RequestCode::GetVringBase, &request.to_bytes(), &[], 0)?;
        let state = VringState::from_bytes(&payload)
            .ok_or_else(|| VhostError::proto("malformed vring-state reply".to_string()))?;
        Ok(state.num as u16)
    }

    fn set_vring_addr(&mut self, config: &VringAddrConfig) -> Result<()> {
        let addr = VringAddr {
            index: config.index as u32,
            flags: 0,
            desc_user_addr: config.desc_table,
            used_user_addr: config.used_ring,
            avail_user_addr: config.avail_ring,
            log_guest_addr: 0,
        };
        self.send_request(RequestCode::SetVringAddr, &addr.to_bytes(), &[])
    }

    fn set_vring_kick(&mut self, index: u16, fd: RawFd) -> Result<()> {
        send_vring_fd(self, RequestCode::SetVringKick, index, fd)
    }

    fn set_vring_call(&mut self, index: u16, fd: RawFd) -> Result<()> {
        send_vring_fd(self, RequestCode::SetVringCall, index, fd)
    }

    fn set_busyloop_timeout(&mut self, _index: u16, _timeout_us: u32) -> Result<()> {
        Err(VhostError::CapabilityUnavailable {
            op: "set_busyloop_timeout",
        })
    }

    fn supports_busyloop_timeout(&self) -> bool {
        false
    }

    fn supports_device_reset(&self) -> bool {
        self.negotiated_protocol_features & protocol_features::DEVICE_RESET != 0
    }

    fn reset_device(&mut self) -> Result<()> {
        if !self.supports_device_reset() {
            return Err(VhostError::CapabilityUnavailable {
                op: "reset_device",
            });
        }
        self.send_request(RequestCode::ResetDevice, &[], &[])
    }
}

/// Sends `set-vring-kick`/`set-vring-call`: the fd is attached as ancillary
/// data when valid, or the no-fd sentinel bit is set in the scalar payload
/// when the caller passes [`SENTINEL_FD`] (§4.E "Fd passing").
fn send_vring_fd(
    transport: &mut UserTransport,
    code: RequestCode,
    index: u16,
    fd: RawFd,
) -> Result<()> {
    if fd == SENTINEL_FD {
        let scalar = (index as u64) | VHOST_USER_VRING_NOFD_MASK;
        transport.send_request(code, &encode_u64(scalar), &[])
    } else {
        transport.send_request(code, &encode_u64(index as u64), &[fd])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair() -> (UserTransport, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (UserTransport::new(a), b)
    }

    fn reply_with_u64(backend: &UnixStream, code: RequestCode, value: u64) {
        let header = MessageHeader::request(code, 8, false);
        let mut header_bytes = header.to_bytes();
        // Stamp the reply flag (bit 2) directly; `MessageHeader::request`
        // only knows how to build request-side flags.
        header_bytes[4] |= 1 << 2;
        backend.send_with_fds(&[&header_bytes[..], &value.to_le_bytes()], &[]).unwrap();
    }

    use vmm_sys_util::sock_ctrl_msg::ScmSocket;

    fn recv_with_fds(backend: &UnixStream, buf: &mut [u8], fds: &mut [RawFd]) -> (usize, usize) {
        let mut iovecs = [libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut std::os::raw::c_void,
            iov_len: buf.len(),
        }];
        // SAFETY: `iovecs` points at `buf`, which outlives this call and is valid
        // to write arbitrary data into.
        unsafe { backend.recv_with_fds(&mut iovecs[..], fds) }.unwrap()
    }

    #[test]
    fn protocol_negotiation_clears_request_backend_bit() {
        let (mut transport, backend) = handshake_pair();
        let backend_features = protocol_features::SUPPORTED_MASK | protocol_features::REQUEST_BACKEND;

        let handle = std::thread::spawn(move || {
            transport.negotiate_protocol_features().unwrap();
            transport
        });

        // Drive the backend side: reply to get-protocol-features, then
        // read the set-protocol-features request and check what came back.
        let mut header_buf = [0u8; MessageHeader::WIRE_SIZE];
        let mut fds = [-1; 1];
        recv_with_fds(&backend, &mut header_buf, &mut fds);
        reply_with_u64(&backend, RequestCode::GetProtocolFeatures, backend_features);

        let mut header_buf2 = [0u8; MessageHeader::WIRE_SIZE];
        recv_with_fds(&backend, &mut header_buf2, &mut fds);
        let header2 = MessageHeader::from_bytes(&header_buf2);
        let mut payload = vec![0u8; header2.payload_size as usize];
        recv_with_fds(&backend, &mut payload, &mut fds);
        let sent_mask = decode_u64(&payload).unwrap();

        assert_eq!(sent_mask & protocol_features::REQUEST_BACKEND, 0);
        assert_eq!(sent_mask, protocol_features::SUPPORTED_MASK);

        let transport = handle.join().unwrap();
        assert!(transport.supports_device_reset());
    }

    #[test]
    fn sentinel_fd_sets_nofd_bit_instead_of_attaching_a_descriptor() {
        let (mut transport, backend) = handshake_pair();
        transport.set_vring_kick(3, SENTINEL_FD).unwrap();

        let mut header_buf = [0u8; MessageHeader::WIRE_SIZE];
        let mut fds = [-1; 1];
        let (_, nfds) = recv_with_fds(&backend, &mut header_buf, &mut fds);
        let header = MessageHeader::from_bytes(&header_buf);
        let mut payload = vec![0u8; header.payload_size as usize];
        recv_with_fds(&backend, &mut payload, &mut fds[nfds..]);
        let scalar = decode_u64(&payload).unwrap();

        assert_eq!(nfds, 0);
        assert_ne!(scalar & VHOST_USER_VRING_NOFD_MASK, 0);
        assert_eq!(scalar & 0xff, 3);
    }
}
