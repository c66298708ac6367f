use bytes::{Buf, BytesMut};

use crate::config::DEFAULT_HEADER;

/// Stateless length-prefixed framing with a magic header for stream
/// resynchronization.
///
/// Wire shape: `HEADER || LEN(4, big-endian) || PAYLOAD`. `unpack` treats
/// any bytes preceding a recognized header as unrecoverable garbage and
/// discards them, which lets a stream realign itself after corruption
/// instead of permanently desyncing.
#[derive(Debug, Clone)]
pub struct Framer {
    header: Vec<u8>,
}

impl Framer {
    pub fn new(header: impl Into<Vec<u8>>) -> Self {
        let header = header.into();
        assert!(!header.is_empty(), "pack header must not be empty");
        Self { header }
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn pack(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + 4 + payload.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Drains every complete frame currently sitting in `residue`, leaving a
    /// partial frame (or a dangling potential-header suffix) in place for
    /// the next call.
    pub fn unpack(&self, residue: &mut BytesMut) -> Vec<Vec<u8>> {
        let hlen = self.header.len();
        let mut out = Vec::new();

        loop {
            let Some(pos) = find(&residue[..], &self.header) else {
                let keep = residue.len().min(hlen.saturating_sub(1));
                let drop = residue.len() - keep;
                residue.advance(drop);
                break;
            };

            // bytes before the header are garbage; the header itself is kept
            residue.advance(pos);

            if residue.len() < hlen + 4 {
                break;
            }

            let len = u32::from_be_bytes([
                residue[hlen],
                residue[hlen + 1],
                residue[hlen + 2],
                residue[hlen + 3],
            ]) as usize;

            if residue.len() < hlen + 4 + len {
                break;
            }

            residue.advance(hlen + 4);
            out.push(residue.split_to(len).to_vec());
        }

        out
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER.as_bytes().to_vec())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
