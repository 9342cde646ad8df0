//! MLLP framing: the tokio codec used on every socket, plus string helpers for
//! wrapping and stripping a single frame.

use bytes::buf::{Buf, BufMut};
use bytes::BytesMut;
use log::{debug, trace, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Hl7Error;

/// Vertical-Tab char, the marker for the start of a message
pub const BLOCK_HEADER: u8 = 0x0B;
/// File-Separator char + CR, the marker for the end of a message
pub const BLOCK_FOOTER: [u8; 2] = [0x1C, 0x0D];
/// Upper bound on buffered bytes without seeing an end block
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// A tokio codec for the HL7 MLLP network protocol.
///
/// Decoding hands back the message bytes with the envelope removed, encoding wraps
/// whatever it's given. Neither direction looks inside the message.
///
/// The decoder leaves incomplete data in the source buffer, so a `Framed`/`FramedRead`
/// keeps appending reads until a whole frame is present, regardless of how the bytes
/// were chunked on the wire. Several frames in one read are handed back one at a time.
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_len: usize,
}

impl Default for MllpCodec {
    fn default() -> Self {
        MllpCodec::new()
    }
}

impl MllpCodec {
    /// Creates a new Codec instance, generally for use within a tokio-util `Framed`,
    /// but can be instantiated standalone for testing purposes etc.
    /// Example:
    /// ```
    /// use hl7_mllp_engine::MllpCodec;
    /// let mllp = MllpCodec::new();
    /// ```
    pub fn new() -> Self {
        MllpCodec {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// A codec that gives up on a peer once this many bytes arrive without an end block.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        MllpCodec { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    // Searching from the start: a peer that doesn't wait for its ACK can put several
    // messages in one read. A lone 0x1C counts as the end block, the CR is optional.
    fn get_footer_position(src: &BytesMut) -> Option<usize> {
        let position = src.iter().position(|b| *b == BLOCK_FOOTER[0]);
        match position {
            Some(i) => trace!("MLLP: Found footer at index {}", i),
            None => trace!("MLLP: Unable to find footer..."),
        }
        position
    }
}

// Support encoding data as an MLLP Frame.
// This is used for both the primary HL7 message sent from a publisher, and also any ACK/NACK messages sent from a Listener.
impl Encoder<BytesMut> for MllpCodec {
    type Error = Hl7Error;

    fn encode(&mut self, event: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&[u8]>>::encode(self, &event[..], dst)
    }
}

impl<'a> Encoder<&'a str> for MllpCodec {
    type Error = Hl7Error;

    fn encode(&mut self, event: &'a str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&[u8]>>::encode(self, event.as_bytes(), dst)
    }
}

impl<'a> Encoder<&'a [u8]> for MllpCodec {
    type Error = Hl7Error;

    fn encode(&mut self, event: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(event.len() + 3); //we need an extra 3 bytes of space on top of the message proper
        dst.put_u8(BLOCK_HEADER); //header

        dst.put_slice(event); //data

        dst.put_slice(&BLOCK_FOOTER); //footer

        debug!("MLLP: Encoded {} bytes for send", event.len());
        Ok(())
    }
}

// Support decoding data from an MLLP Frame.
// This is used for receiving the primary HL7 message in a listener, and also decoding any ACK/NACK responses in a publisher.
impl Decoder for MllpCodec {
    type Item = BytesMut;
    type Error = Hl7Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let end_offset = match MllpCodec::get_footer_position(src) {
            Some(end_offset) => end_offset,
            None => {
                if src.len() > self.max_frame_len {
                    let buffered = src.len();
                    src.clear();
                    return Err(Hl7Error::framing(format!(
                        "no end block within {} bytes ({} buffered)",
                        self.max_frame_len, buffered
                    )));
                }
                return Ok(None); // no message lurking in here yet
            }
        };

        // the CR may still be in flight, in which case it turns up as leading junk on the next frame
        let consumed = if src.get(end_offset + 1) == Some(&BLOCK_FOOTER[1]) {
            end_offset + 2
        } else {
            end_offset + 1
        };

        let mut result = src.split_to(consumed);
        result.truncate(end_offset);

        if result.len() > self.max_frame_len {
            return Err(Hl7Error::framing(format!(
                "frame of {} bytes exceeds the {} byte limit",
                result.len(),
                self.max_frame_len
            )));
        }

        // we DO have to ignore any bytes prior to the BLOCK_HEADER as MLLP requires
        match result.iter().position(|b| *b == BLOCK_HEADER) {
            Some(start_offset) => result.advance(start_offset + 1),
            None => {
                // some peers never send the start block
                let leading = result
                    .iter()
                    .take_while(|b| **b == b'\r' || **b == b'\n')
                    .count();
                result.advance(leading);
            }
        }

        trace!("MLLP: Decoded frame of {} bytes", result.len());
        Ok(Some(result))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
            warn!(
                "MLLP: Discarding {} bytes of unterminated frame at end of stream",
                buf.len()
            );
        }
        buf.clear();
        Ok(None)
    }
}

/// Wraps an already-assembled message in a single MLLP envelope.
pub fn wrap(message: &str) -> String {
    let mut framed = String::with_capacity(message.len() + 3);
    framed.push(BLOCK_HEADER as char);
    framed.push_str(message);
    framed.push(BLOCK_FOOTER[0] as char);
    framed.push(BLOCK_FOOTER[1] as char);
    framed
}

/// Removes the MLLP envelope from the boundaries of `message`, when present.
///
/// A missing start block is tolerated, as is an end block without its trailing CR.
pub fn strip(message: &str) -> &str {
    let message = message
        .strip_prefix(BLOCK_HEADER as char)
        .unwrap_or(message);

    if let Some(inner) = message.strip_suffix("\x1C\x0D") {
        inner
    } else if let Some(inner) = message.strip_suffix(BLOCK_FOOTER[0] as char) {
        inner
    } else {
        message
    }
}
