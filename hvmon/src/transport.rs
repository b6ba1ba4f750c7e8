//! Socket plumbing: the greeting exchange and frame writes, with or without
//! a file descriptor riding along as `SCM_RIGHTS` ancillary data.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};

use hvmon_proto::{CAP_OOB, Greeting, NEGOTIATE, Reply, Request};
use tokio::io::{AsyncWriteExt, BufReader, Interest};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Error, Result};
use crate::ids::IdGen;
use crate::log::{Entry, WireLog};

/// A connection that completed capability negotiation.
#[derive(Debug)]
pub(crate) struct Negotiated {
    /// Read side, still holding whatever the peer sent after the handshake.
    pub(crate) reader: BufReader<OwnedReadHalf>,
    /// Write side.
    pub(crate) writer: OwnedWriteHalf,
    /// Whether the greeting advertised out-of-band transfer.
    pub(crate) oob: bool,
}

/// Reads the greeting and negotiates capabilities.
///
/// The negotiation reply is read inline because the read loop only starts
/// once this succeeds.
pub(crate) async fn negotiate(stream: UnixStream, ids: &IdGen, log: &WireLog) -> Result<Negotiated> {
    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);

    let greeting: Greeting = hvmon_proto::recv(&mut reader)
        .await
        .map_err(|e| Error::Handshake(format!("reading greeting: {e}")))?;
    let oob = greeting.has(CAP_OOB);

    let id = ids.next();
    let request = Request::execute(NEGOTIATE).with_id(id);
    let frame = hvmon_proto::encode(&request)?;
    if let Err(e) = log.record(Entry::Query, &frame) {
        tracing::debug!(error = %e, "failed to log query");
    }
    writer.write_all(&frame).await?;
    writer.flush().await?;

    let mut line = Vec::new();
    if !hvmon_proto::read_line(&mut reader, &mut line).await? {
        return Err(Error::Handshake("monitor closed the connection".to_owned()));
    }
    if let Err(e) = log.record(Entry::Reply, &line) {
        tracing::debug!(error = %e, "failed to log reply");
    }
    let reply: Reply = serde_json::from_slice(&line)
        .map_err(|e| Error::Handshake(format!("decoding negotiation reply: {e}")))?;

    if let Some(err) = reply.error {
        return Err(Error::Protocol(err));
    }
    if reply.id != id.get() {
        return Err(Error::Handshake(format!(
            "reply id {} and command id {} mismatch",
            reply.id,
            id.get()
        )));
    }

    tracing::debug!(protocol = %greeting.protocol, oob, "monitor handshake complete");
    Ok(Negotiated { reader, writer, oob })
}

/// Writes one encoded frame, attaching `fd` to its first byte when given.
pub(crate) async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let Some(fd) = fd else {
        writer.write_all(frame).await?;
        return writer.flush().await;
    };

    let sent = {
        let sock: &UnixStream = writer.as_ref();
        loop {
            sock.writable().await?;
            match sock.try_io(Interest::WRITABLE, || {
                send_with_rights(sock.as_raw_fd(), frame, fd.as_raw_fd())
            }) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    };

    // The descriptor went out with the first chunk; the rest is plain bytes.
    if let Some(rest) = frame.get(sent..).filter(|r| !r.is_empty()) {
        writer.write_all(rest).await?;
    }
    writer.flush().await
}

/// One `sendmsg(2)` call carrying `frame` and a single `SCM_RIGHTS` fd.
#[allow(unused_unsafe, clippy::unnecessary_fallible_conversions)]
fn send_with_rights(sock: RawFd, frame: &[u8], fd: RawFd) -> io::Result<usize> {
    const FD_LEN: u32 = size_of::<RawFd>() as u32;

    // SAFETY: CMSG_SPACE only does arithmetic on its argument.
    let space = unsafe { libc::CMSG_SPACE(FD_LEN) } as usize;
    // u64 words keep the control buffer aligned for `cmsghdr`.
    let mut control = vec![0u64; space.div_ceil(size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: frame.as_ptr().cast_mut().cast(),
        iov_len: frame.len(),
    };

    // SAFETY: msghdr is plain old data; zeroed is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    // `size_t` on glibc, `socklen_t` elsewhere.
    msg.msg_controllen = space
        .try_into()
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: msg_control points at `space` zeroed, aligned bytes, enough
    // for one header plus one fd, so CMSG_FIRSTHDR is non-null and both the
    // header and its data area lie inside `control`.
    let sent = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(FD_LEN) as _;
        libc::CMSG_DATA(cmsg).cast::<RawFd>().write_unaligned(fd);
        libc::sendmsg(sock, &raw const msg, 0)
    };

    usize::try_from(sent).map_err(|_| io::Error::last_os_error())
}
