//! The send-side serialisation path.
//!
//! A [`WriteJob`] is one message handed to a connection's write task by the remote's
//!  dispatcher. The job carries the payload buffers and, for messages whose fate is
//!  decided by the write itself, the completion channel of the originating send. A
//!  synchronous-mode data message carries no completion here: it is parked in the
//!  remote's wait-ack state at dispatch time, so the writer is free for control
//!  messages while the ack is outstanding.
//!
//! The serial is assigned strictly before the first byte of the message goes out, so
//!  serials on the wire are exactly the order messages were written.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::ChirpError;
use crate::identity::Identity;
use crate::wire::{msg_type, WireHeader};

/// What kind of queue entry a job came from; the remote uses this to clean up its
///  dispatch state when the job completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JobKind {
    Data,
    Ack,
    Noop,
}

pub(crate) struct WriteJob {
    pub kind: JobKind,
    pub identity: Identity,
    pub msg_type: u8,
    pub header: Bytes,
    pub data: Bytes,
    /// Resolves the user's send future once the write outcome is known. `None` for
    ///  control messages and for ack-awaited messages (parked in the remote instead).
    pub completion: Option<oneshot::Sender<Result<(), ChirpError>>>,
}

impl WriteJob {
    /// Whether the peer owes an ack for this message; the write alone does not
    ///  complete it.
    pub fn awaits_ack(&self) -> bool {
        self.msg_type & msg_type::REQ_ACK != 0
    }
}

/// Serialise and write one message. An `Err` is an I/O failure on the transport.
pub(crate) async fn write_message<W: AsyncWrite + Unpin>(
    out: &mut W,
    scratch: &mut BytesMut,
    serial: u32,
    job: &WriteJob,
) -> Result<(), ChirpError> {
    scratch.clear();
    WireHeader {
        identity: job.identity,
        serial,
        msg_type: job.msg_type,
        header_len: job.header.len() as u16,
        data_len: job.data.len() as u32,
    }
    .ser(scratch);

    write_all_parts(out, scratch, &job.header, &job.data)
        .await
        .map_err(|_| ChirpError::WriteError)
}

async fn write_all_parts<W: AsyncWrite + Unpin>(
    out: &mut W,
    wire_header: &[u8],
    header: &Bytes,
    data: &Bytes,
) -> std::io::Result<()> {
    out.write_all(wire_header).await?;
    if !header.is_empty() {
        out.write_all(header).await?;
    }
    if !data.is_empty() {
        out.write_all(data).await?;
    }
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn job(msg_type: u8, header: &[u8], data: &[u8]) -> WriteJob {
        WriteJob {
            kind: JobKind::Data,
            identity: Identity::from_bytes([3; 16]),
            msg_type,
            header: Bytes::copy_from_slice(header),
            data: Bytes::copy_from_slice(data),
            completion: None,
        }
    }

    #[tokio::test]
    async fn test_write_message_frames_correctly() {
        let mut out = Vec::new();
        let mut scratch = BytesMut::new();

        write_message(&mut out, &mut scratch, 17, &job(msg_type::REQ_ACK, b"hd", b"payload"))
            .await
            .unwrap();

        let mut buf: &[u8] = &out;
        let hdr = WireHeader::deser(&mut buf).unwrap();
        assert_eq!(hdr.identity, Identity::from_bytes([3; 16]));
        assert_eq!(hdr.serial, 17);
        assert_eq!(hdr.msg_type, msg_type::REQ_ACK);
        assert_eq!(hdr.header_len, 2);
        assert_eq!(hdr.data_len, 7);
        assert_eq!(buf, b"hdpayload");
    }

    #[tokio::test]
    async fn test_write_message_empty_blobs() {
        let mut out = Vec::new();
        let mut scratch = BytesMut::new();

        write_message(&mut out, &mut scratch, 1, &job(msg_type::ACK, b"", b""))
            .await
            .unwrap();
        assert_eq!(out.len(), WireHeader::SERIALIZED_LEN);
    }

    #[tokio::test]
    async fn test_scratch_is_reusable() {
        let mut out = Vec::new();
        let mut scratch = BytesMut::new();

        write_message(&mut out, &mut scratch, 1, &job(0, b"", b"first"))
            .await
            .unwrap();
        write_message(&mut out, &mut scratch, 2, &job(0, b"", b"second"))
            .await
            .unwrap();

        let mut buf: &[u8] = &out;
        let first = WireHeader::deser(&mut buf).unwrap();
        assert_eq!(first.serial, 1);
        buf = &buf[first.data_len as usize..];
        let second = WireHeader::deser(&mut buf).unwrap();
        assert_eq!(second.serial, 2);
        assert_eq!(buf, b"second");
    }

    #[rstest]
    #[case::plain_data(0, false)]
    #[case::req_ack(msg_type::REQ_ACK, true)]
    #[case::ack(msg_type::ACK, false)]
    #[case::noop(msg_type::NOOP, false)]
    fn test_awaits_ack(#[case] msg_type: u8, #[case] expected: bool) {
        assert_eq!(job(msg_type, b"", b"").awaits_ack(), expected);
    }
}
