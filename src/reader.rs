//! The receive-side state machine.
//!
//! The reader consumes a byte stream in arbitrary chunks and assembles fully-formed
//!  messages. It is deliberately free of any I/O: the connection's read task feeds it
//!  whatever the transport delivered and acts on the returned actions. Slot acquisition
//!  happens here; when the pool is exhausted the reader reports [`ReadAction::NeedSlot`]
//!  and keeps its position, so the caller can stop reading from the socket until a slot
//!  is released and then resume exactly where it left off.
//!
//! The handshake exchange is not part of this state machine; connections swap the
//!  18-byte handshake during establishment and only then start feeding the reader.

use crate::buffer_pool::{BufferPool, Slot};
use crate::identity::Identity;
use crate::wire::WireHeader;

pub(crate) enum ReadAction {
    /// A complete message was assembled into the returned slot.
    Deliver(Box<Slot>, WireHeader),
    /// The peer acknowledged the message with this identity.
    AckReceived(Identity),
    /// The peer probed liveness; refresh the timestamps.
    NoopSeen,
    /// No free slot; stop the stream and re-enter `consume` after a release.
    NeedSlot,
}

enum ReadState {
    /// Accumulating the 27-byte wire header.
    Wait,
    /// Wire header decoded, waiting for a free slot.
    Acquire(WireHeader),
    /// Reading the header blob into the slot.
    Header,
    /// Reading the data blob into the slot.
    Data,
}

pub(crate) struct Reader {
    max_msg_size: u32,
    state: ReadState,
    hdr_buf: [u8; WireHeader::SERIALIZED_LEN],
    hdr_filled: usize,
    current: Option<(WireHeader, Box<Slot>)>,
}

impl Reader {
    pub fn new(max_msg_size: u32) -> Reader {
        Reader {
            max_msg_size,
            state: ReadState::Wait,
            hdr_buf: [0; WireHeader::SERIALIZED_LEN],
            hdr_filled: 0,
            current: None,
        }
    }

    /// Advance the state machine with the next chunk of the byte stream.
    ///
    /// Returns the number of bytes consumed and at most one action. The caller must keep
    ///  re-invoking with the unconsumed remainder until it gets `(_, None)` back. An
    ///  `Err` is a protocol violation; the connection must be shut down.
    pub fn consume(
        &mut self,
        input: &[u8],
        pool: &BufferPool,
    ) -> anyhow::Result<(usize, Option<ReadAction>)> {
        let mut consumed = 0;

        loop {
            match &self.state {
                ReadState::Wait => {
                    let want = WireHeader::SERIALIZED_LEN - self.hdr_filled;
                    let take = want.min(input.len() - consumed);
                    self.hdr_buf[self.hdr_filled..self.hdr_filled + take]
                        .copy_from_slice(&input[consumed..consumed + take]);
                    self.hdr_filled += take;
                    consumed += take;

                    if self.hdr_filled < WireHeader::SERIALIZED_LEN {
                        return Ok((consumed, None));
                    }

                    let header = WireHeader::deser(&mut &self.hdr_buf[..])?;
                    header.validate(self.max_msg_size)?;
                    self.hdr_filled = 0;

                    if header.is_noop() {
                        return Ok((consumed, Some(ReadAction::NoopSeen)));
                    }
                    if header.is_ack() {
                        return Ok((consumed, Some(ReadAction::AckReceived(header.identity))));
                    }
                    self.state = ReadState::Acquire(header);
                }

                ReadState::Acquire(_) => {
                    let ReadState::Acquire(header) =
                        std::mem::replace(&mut self.state, ReadState::Wait)
                    else {
                        unreachable!()
                    };
                    let Some(mut slot) = pool.acquire() else {
                        self.state = ReadState::Acquire(header);
                        return Ok((consumed, Some(ReadAction::NeedSlot)));
                    };
                    slot.header.prepare(header.header_len as usize);
                    slot.data.prepare(header.data_len as usize);

                    if header.header_len > 0 {
                        self.state = ReadState::Header;
                        self.current = Some((header, slot));
                    } else if header.data_len > 0 {
                        self.state = ReadState::Data;
                        self.current = Some((header, slot));
                    } else {
                        return Ok((consumed, Some(ReadAction::Deliver(slot, header))));
                    }
                }

                ReadState::Header => {
                    let (header, slot) = self.current.as_mut().expect("no message in flight");
                    let want = header.header_len as usize - slot.header.len();
                    let take = want.min(input.len() - consumed);
                    slot.header
                        .storage()
                        .extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;

                    if slot.header.len() < header.header_len as usize {
                        return Ok((consumed, None));
                    }
                    if header.data_len > 0 {
                        self.state = ReadState::Data;
                    } else {
                        return self.finish(consumed);
                    }
                }

                ReadState::Data => {
                    let (header, slot) = self.current.as_mut().expect("no message in flight");
                    let want = header.data_len as usize - slot.data.len();
                    let take = want.min(input.len() - consumed);
                    slot.data
                        .storage()
                        .extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;

                    if slot.data.len() < header.data_len as usize {
                        return Ok((consumed, None));
                    }
                    return self.finish(consumed);
                }
            }
        }
    }

    fn finish(&mut self, consumed: usize) -> anyhow::Result<(usize, Option<ReadAction>)> {
        let (header, slot) = self.current.take().expect("no message in flight");
        self.state = ReadState::Wait;
        Ok((consumed, Some(ReadAction::Deliver(slot, header))))
    }

    /// Abort the message currently being assembled and hand its slot back, e.g. on
    ///  connection shutdown.
    pub fn abort(&mut self, pool: &BufferPool) {
        if let Some((_, slot)) = self.current.take() {
            pool.release(slot);
        }
        self.state = ReadState::Wait;
        self.hdr_filled = 0;
    }
}

impl Reader {
    #[cfg(test)]
    fn is_idle(&self) -> bool {
        matches!(self.state, ReadState::Wait) && self.hdr_filled == 0 && self.current.is_none()
    }
}
