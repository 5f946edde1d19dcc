//! Logical message framing layered on top of tungstenite's already-reassembled
//! WebSocket messages.
//!
//! tungstenite hands us whole `Message::Binary`/`Message::Text` payloads, having
//! done the wire-level fragmentation/reassembly itself. webshocket needs its own
//! notion of fragmentation above that: a single logical packet can be split by the
//! sender into a run of frames (`BINARY fin=0`, `CONTINUATION fin=0`, ...,
//! `CONTINUATION fin=1`) to bound per-send memory, and the receiving side has to
//! put them back together before handing a payload up to the codec. We encode
//! that as one header byte in front of every `Message::Binary` tungstenite sends,
//! independent of whatever real wire fragmentation tungstenite itself performs
//! underneath.

use crate::error::Error;
use crate::result::Result;

/// Default chunk size used when splitting an outbound payload across frames.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const FLAG_FIN: u8 = 0b0000_0001;
const FLAG_CONTINUATION: u8 = 0b0000_0010;

/// Logical opcode of a reassembled frame, mirroring the three cases the
/// reassembly algorithm branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Binary,
    Continuation,
    Close,
}

/// One logical frame as it crosses the wire inside a single tungstenite message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    pub fin: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn binary(fin: bool, payload: Vec<u8>) -> Self {
        Frame { opcode: Opcode::Binary, fin, payload }
    }

    pub fn continuation(fin: bool, payload: Vec<u8>) -> Self {
        Frame { opcode: Opcode::Continuation, fin, payload }
    }

    /// Encode as a tungstenite `Message::Binary`, prefixed with our 1-byte header.
    pub fn into_message(self) -> tungstenite::Message {
        debug_assert!(self.opcode != Opcode::Close, "close frames bypass the header encoding");
        let mut buf = Vec::with_capacity(self.payload.len() + 1);
        let mut flags = 0u8;
        if self.fin {
            flags |= FLAG_FIN;
        }
        if self.opcode == Opcode::Continuation {
            flags |= FLAG_CONTINUATION;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.payload);
        tungstenite::Message::Binary(buf)
    }

    /// Decode a tungstenite `Message::Binary` previously produced by [`Frame::into_message`].
    pub fn from_binary(mut data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::MalformedFrame);
        }
        let flags = data.remove(0);
        let fin = flags & FLAG_FIN != 0;
        let opcode = if flags & FLAG_CONTINUATION != 0 { Opcode::Continuation } else { Opcode::Binary };
        Ok(Frame { opcode, fin, payload: data })
    }

    pub fn close() -> Self {
        Frame { opcode: Opcode::Close, fin: true, payload: Vec::new() }
    }
}

/// Splits `payload` into a run of frames no larger than `chunk_size`, following
/// the same shape as a single chunked send: a lone `fin=1` BINARY frame if it
/// fits in one chunk, otherwise a `fin=0` BINARY frame, zero or more `fin=0`
/// CONTINUATION frames, and a final `fin=1` CONTINUATION frame. Never emits an
/// empty final frame.
pub fn chunk(payload: &[u8], chunk_size: usize) -> Vec<Frame> {
    assert!(chunk_size > 0);

    if payload.len() <= chunk_size {
        return vec![Frame::binary(true, payload.to_vec())];
    }

    let mut frames = Vec::with_capacity(payload.len() / chunk_size + 1);
    let mut chunks = payload.chunks(chunk_size).peekable();

    let first = chunks.next().expect("payload is non-empty");
    frames.push(Frame::binary(false, first.to_vec()));

    while let Some(chunk) = chunks.next() {
        let is_last = chunks.peek().is_none();
        frames.push(Frame::continuation(is_last, chunk.to_vec()));
    }

    frames
}

/// Reassembles a run of frames arriving on a single connection into complete
/// logical payloads. Mirrors the original picows listener's `_frag_buffer`.
#[derive(Default)]
pub struct Reassembler {
    frag_buffer: Vec<Vec<u8>>,
}

/// Outcome of feeding one frame into the reassembler.
pub enum Reassembled {
    /// The frame completed (or was itself) a whole logical payload.
    Payload(Vec<u8>),
    /// The frame was buffered; more continuation frames are expected.
    Pending,
    /// A close frame was received.
    Close,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, frame: Frame) -> Reassembled {
        match frame.opcode {
            Opcode::Close => Reassembled::Close,
            Opcode::Binary if frame.fin => Reassembled::Payload(frame.payload),
            Opcode::Binary => {
                self.frag_buffer.clear();
                self.frag_buffer.push(frame.payload);
                Reassembled::Pending
            }
            Opcode::Continuation => {
                self.frag_buffer.push(frame.payload);
                if frame.fin {
                    let joined = self.frag_buffer.concat();
                    self.frag_buffer.clear();
                    Reassembled::Payload(joined)
                } else {
                    Reassembled::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_roundtrip() {
        let payload = vec![1u8, 2, 3, 4];
        let frames = chunk(&payload, DEFAULT_CHUNK_SIZE);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].opcode, Opcode::Binary);

        let mut r = Reassembler::new();
        match r.feed(frames.into_iter().next().unwrap()) {
            Reassembled::Payload(p) => assert_eq!(p, payload),
            _ => panic!("expected a complete payload"),
        }
    }

    #[test]
    fn multi_chunk_roundtrip() {
        let payload: Vec<u8> = (0..250u32).flat_map(|b| (b as u8).to_be_bytes()).collect();
        let frames = chunk(&payload, 16);
        assert!(frames.len() > 1);
        assert_eq!(frames[0].opcode, Opcode::Binary);
        assert!(!frames[0].fin);
        for f in &frames[1..frames.len() - 1] {
            assert_eq!(f.opcode, Opcode::Continuation);
            assert!(!f.fin);
        }
        assert!(frames.last().unwrap().fin);
        assert_eq!(frames.last().unwrap().opcode, Opcode::Continuation);

        let mut r = Reassembler::new();
        let mut result = None;
        for f in frames {
            match r.feed(f) {
                Reassembled::Payload(p) => result = Some(p),
                Reassembled::Pending => {}
                Reassembled::Close => panic!("unexpected close"),
            }
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn wire_roundtrip_preserves_header() {
        let frame = Frame::continuation(true, vec![9, 9, 9]);
        let msg = frame.into_message();
        let tungstenite::Message::Binary(data) = msg else { panic!("not binary") };
        let decoded = Frame::from_binary(data).unwrap();
        assert_eq!(decoded.opcode, Opcode::Continuation);
        assert!(decoded.fin);
        assert_eq!(decoded.payload, vec![9, 9, 9]);
    }
}
