use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rand::RngCore;

/// The size of a chirp identity in bytes.
pub const ID_SIZE: usize = 16;

/// A 16-byte opaque identity.
///
/// Identifies a node (generated fresh on each start unless configured) as well as a
///  message and the answers to it: replying to a message preserves its identity, so the
///  identity can be used to correlate request and response. If a truly unique key is
///  needed, use the identity/serial pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; ID_SIZE]);

impl Identity {
    pub const ZERO: Identity = Identity([0; ID_SIZE]);

    pub fn random() -> Identity {
        let mut data = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut data);
        Identity(data)
    }

    pub fn from_bytes(data: [u8; ID_SIZE]) -> Identity {
        Identity(data)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_SIZE]
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Identity> {
        let mut data = [0u8; ID_SIZE];
        for b in data.iter_mut() {
            *b = buf.try_get_u8()?;
        }
        Ok(Identity(data))
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
