//! Frames vhost-user messages over a `UnixStream`, attaching and receiving
//! ancillary fds via `vmm_sys_util::sock_ctrl_msg::ScmSocket` — the same
//! `SCM_RIGHTS` primitive the pack's vhost-user backends (see
//! other_examples) build their wire layer on, rather than hand-rolled
//! `libc::sendmsg` calls.

use std::io;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use libc::iovec;
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

use crate::error::{retry_on_intr, Result, VhostError};

use super::message::{MessageHeader, MAX_FDS, MAX_PAYLOAD_SIZE};

/// A framed duplex channel to a vhost-user backend.
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Connection {
        Connection { stream }
    }

    /// Sends one frame: header, then payload, with `fds` attached as
    /// ancillary data in the same `sendmsg` call (§4.E "one `sendmsg` call
    /// with ancillary data").
    pub fn send(&self, header: &MessageHeader, payload: &[u8], fds: &[RawFd]) -> Result<()> {
        if fds.len() > MAX_FDS {
            return Err(VhostError::proto(format!(
                "refusing to send {} fds, maximum is {}",
                fds.len(),
                MAX_FDS
            )));
        }
        let header_bytes = header.to_bytes();
        let bufs: [&[u8]; 2] = [&header_bytes, payload];
        retry_on_intr("user_transport_send", || {
            self.stream
                .send_with_fds(&bufs, fds)
                .map(|_| ())
                .map_err(io::Error::from)
        })
    }

    /// Receives one frame. Returns the header, payload bytes, and any fds
    /// that arrived as ancillary data. A short header, a payload larger
    /// than [`MAX_PAYLOAD_SIZE`] or than declared, or more than one fd when
    /// the caller expected at most one, are protocol violations (§4.E
    /// "Reply-ack").
    pub fn recv(&self, max_fds: usize) -> Result<(MessageHeader, Vec<u8>, Vec<RawFd>)> {
        let mut header_buf = [0u8; MessageHeader::WIRE_SIZE];
        let mut fd_buf = vec![-1 as RawFd; max_fds.max(1)];
        let (n, nfds) = retry_on_intr("user_transport_recv_header", || {
            let mut iovecs = [iovec {
                iov_base: header_buf.as_mut_ptr() as *mut c_void,
                iov_len: header_buf.len(),
            }];
            // SAFETY: `iovecs` points at `header_buf`, which outlives this call and is
            // valid to write arbitrary data into.
            unsafe { self.stream.recv_with_fds(&mut iovecs[..], &mut fd_buf) }
                .map_err(io::Error::from)
        })?;
        if n != MessageHeader::WIRE_SIZE {
            return Err(VhostError::proto(format!(
                "short header: expected {} bytes, got {n}",
                MessageHeader::WIRE_SIZE
            )));
        }
        let header = MessageHeader::from_bytes(&header_buf);
        if header.payload_size > MAX_PAYLOAD_SIZE {
            return Err(VhostError::proto(format!(
                "declared payload {} exceeds maximum {}",
                header.payload_size, MAX_PAYLOAD_SIZE
            )));
        }

        let mut payload = vec![0u8; header.payload_size as usize];
        let mut payload_fds = vec![-1 as RawFd; max_fds.max(1).saturating_sub(nfds)];
        let mut received = 0usize;
        let mut total_fds = nfds;
        while received < payload.len() {
            let (n, more_fds) = retry_on_intr("user_transport_recv_payload", || {
                let mut iovecs = [iovec {
                    iov_base: payload[received..].as_mut_ptr() as *mut c_void,
                    iov_len: payload[received..].len(),
                }];
                // SAFETY: `iovecs` points at the remaining slice of `payload`, which
                // outlives this call and is valid to write arbitrary data into.
                unsafe { self.stream.recv_with_fds(&mut iovecs[..], &mut payload_fds) }
                    .map_err(io::Error::from)
            })?;
            if n == 0 {
                return Err(VhostError::proto(
                    "connection closed mid-frame".to_string(),
                ));
            }
            received += n;
            total_fds += more_fds;
        }

        if total_fds > max_fds {
            return Err(VhostError::proto(format!(
                "received {total_fds} fds, expected at most {max_fds}"
            )));
        }
        fd_buf.truncate(nfds);
        Ok((header, payload, fd_buf))
    }
}
