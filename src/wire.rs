//! Fixed-layout codecs for the two wire framings, all integers in network byte order:
//!
//! ```ascii
//! handshake (18 bytes), sent once by each side on connection establishment:
//! 0:  port (u16 BE) - the port the sender *listens* on, not the ephemeral port
//! 2:  identity (16 bytes) - the sender's node identity
//!
//! wire message header (27 bytes), repeated thereafter:
//! 0:  identity (16 bytes)
//! 16: serial (u32 BE)
//! 20: type (u8) - bit 0 REQ_ACK, bit 1 ACK, bit 2 NOOP
//! 21: header_len (u16 BE)
//! 23: data_len (u32 BE)
//! 27: header_len bytes of header, then data_len bytes of data
//! ```
//!
//! The header places `type` between serial and the lengths; encoders write field by
//!  field, so no alignment padding can ever appear.

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::identity::Identity;

/// Message type bits as they appear on the wire.
pub mod msg_type {
    /// The sender requests an acknowledge message.
    pub const REQ_ACK: u8 = 1;
    /// The message is an acknowledge message.
    pub const ACK: u8 = 1 << 1;
    /// The message is a liveness probe.
    pub const NOOP: u8 = 1 << 2;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub port: u16,
    pub identity: Identity,
}

impl Handshake {
    pub const SERIALIZED_LEN: usize = 18;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.port);
        self.identity.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Handshake> {
        let port = buf.try_get_u16()?;
        let identity = Identity::try_deser(buf)?;
        Ok(Handshake { port, identity })
    }
}

/// The fixed 27-byte header preceding every application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub identity: Identity,
    pub serial: u32,
    pub msg_type: u8,
    pub header_len: u16,
    pub data_len: u32,
}

impl WireHeader {
    pub const SERIALIZED_LEN: usize = 27;

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.identity.ser(buf);
        buf.put_u32(self.serial);
        buf.put_u8(self.msg_type);
        buf.put_u16(self.header_len);
        buf.put_u32(self.data_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<WireHeader> {
        let identity = Identity::try_deser(buf)?;
        let serial = buf.try_get_u32()?;
        let msg_type = buf.try_get_u8()?;
        let header_len = buf.try_get_u16()?;
        let data_len = buf.try_get_u32()?;
        Ok(WireHeader {
            identity,
            serial,
            msg_type,
            header_len,
            data_len,
        })
    }

    pub fn is_ack(&self) -> bool {
        self.msg_type & msg_type::ACK != 0
    }

    pub fn is_noop(&self) -> bool {
        self.msg_type & msg_type::NOOP != 0
    }

    pub fn wants_ack(&self) -> bool {
        self.msg_type & msg_type::REQ_ACK != 0
    }

    pub fn total_payload_len(&self) -> usize {
        self.header_len as usize + self.data_len as usize
    }

    /// Validate the decoded header against the configured message size limit and the
    ///  structural rules for control messages.
    pub fn validate(&self, max_msg_size: u32) -> anyhow::Result<()> {
        if self.header_len as u64 + self.data_len as u64 > max_msg_size as u64 {
            bail!(
                "message of {} bytes exceeds the configured maximum of {}",
                self.header_len as u64 + self.data_len as u64,
                max_msg_size
            );
        }
        if self.is_ack() || self.is_noop() {
            if self.header_len != 0 || self.data_len != 0 {
                bail!("control message carries a payload");
            }
            if self.wants_ack() {
                bail!("control message requests an ack");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn id(first: u8) -> Identity {
        let mut data = [0u8; 16];
        data[0] = first;
        data[15] = 0x99;
        Identity::from_bytes(data)
    }

    #[rstest]
    #[case::min_port(0)]
    #[case::chirp_default(2998)]
    #[case::max_port(u16::MAX)]
    fn test_handshake_roundtrip(#[case] port: u16) {
        let original = Handshake {
            port,
            identity: Identity::random(),
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), Handshake::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = Handshake::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_handshake_exact_bytes() {
        let hs = Handshake {
            port: 0x0bb6, // 2998
            identity: id(0xab),
        };
        let mut buf = BytesMut::new();
        hs.ser(&mut buf);

        let mut expected = vec![0x0b, 0xb6, 0xab];
        expected.extend_from_slice(&[0; 14]);
        expected.push(0x99);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[rstest]
    #[case::empty(0, 0, 0, 0)]
    #[case::data_only(0, 5, 1, msg_type::REQ_ACK)]
    #[case::header_and_data(17, 1024, 77, 0)]
    #[case::ack(0, 0, u32::MAX, msg_type::ACK)]
    #[case::noop(0, 0, 42, msg_type::NOOP)]
    #[case::max_lens(u16::MAX, u32::MAX, 3, msg_type::REQ_ACK)]
    fn test_wire_header_roundtrip(
        #[case] header_len: u16,
        #[case] data_len: u32,
        #[case] serial: u32,
        #[case] msg_type: u8,
    ) {
        let original = WireHeader {
            identity: Identity::random(),
            serial,
            msg_type,
            header_len,
            data_len,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), WireHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = WireHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_wire_header_exact_bytes() {
        let hdr = WireHeader {
            identity: id(0x01),
            serial: 0x0102_0304,
            msg_type: msg_type::REQ_ACK,
            header_len: 0x00ff,
            data_len: 0xdead_beef,
        };
        let mut buf = BytesMut::new();
        hdr.ser(&mut buf);

        let mut expected = vec![0x01];
        expected.extend_from_slice(&[0; 14]);
        expected.push(0x99);
        expected.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]); // serial
        expected.push(0x01); // type
        expected.extend_from_slice(&[0x00, 0xff]); // header_len
        expected.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // data_len
        assert_eq!(&buf[..], &expected[..]);
    }

    #[rstest]
    #[case::one_byte(1)]
    #[case::half_header(13)]
    #[case::one_short(WireHeader::SERIALIZED_LEN - 1)]
    fn test_wire_header_deser_incomplete(#[case] len: usize) {
        let hdr = WireHeader {
            identity: Identity::random(),
            serial: 1,
            msg_type: 0,
            header_len: 0,
            data_len: 0,
        };
        let mut buf = BytesMut::new();
        hdr.ser(&mut buf);

        let mut b: &[u8] = &buf[..len];
        assert!(WireHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::fits(100, 924, 1024, true)]
    #[case::exact(1000, 24, 1024, true)]
    #[case::too_big(1000, 25, 1024, false)]
    #[case::data_alone_too_big(0, 2000, 1024, false)]
    fn test_validate_size(
        #[case] header_len: u16,
        #[case] data_len: u32,
        #[case] max: u32,
        #[case] ok: bool,
    ) {
        let hdr = WireHeader {
            identity: Identity::random(),
            serial: 0,
            msg_type: 0,
            header_len,
            data_len,
        };
        assert_eq!(hdr.validate(max).is_ok(), ok);
    }

    #[rstest]
    #[case::ack_with_data(msg_type::ACK, 0, 1)]
    #[case::ack_with_header(msg_type::ACK, 1, 0)]
    #[case::noop_with_data(msg_type::NOOP, 0, 1)]
    #[case::ack_requesting_ack(msg_type::ACK | msg_type::REQ_ACK, 0, 0)]
    #[case::noop_requesting_ack(msg_type::NOOP | msg_type::REQ_ACK, 0, 0)]
    fn test_validate_rejects_malformed_control(
        #[case] msg_type: u8,
        #[case] header_len: u16,
        #[case] data_len: u32,
    ) {
        let hdr = WireHeader {
            identity: Identity::random(),
            serial: 0,
            msg_type,
            header_len,
            data_len,
        };
        assert!(hdr.validate(u32::MAX).is_err());
    }
}
