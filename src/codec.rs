//! Wire framing for KeepKey devices.
//!
//! Every message travels as a canonical frame `## | type:u16 BE | len:u32 BE | payload`
//! split into 64-byte packets. The first packet is prefixed with `0x3F` (v5,
//! USB/WebUSB) or `0x00 0x3F` (v4, HID report 0); continuation packets are
//! `0x3F` followed by up to 63 payload bytes in both formats.
//!
//! The frame header is applied once, by [`WireMessage::to_frame`]. [`chunk`]
//! only accepts buffers that already carry it and never adds it again.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

pub const PACKET_SIZE: usize = 64;
pub const PACKET_MARKER: u8 = 0x3F;
pub const REPORT_ID: u8 = 0x00;
pub const MAGIC: [u8; 2] = *b"##";
pub const FRAME_HEADER_LEN: usize = 8;
/// Firmware images are the largest messages a device accepts.
pub const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

const CONTINUATION_CAPACITY: usize = PACKET_SIZE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// USB / WebUSB bulk framing.
    V5,
    /// Legacy HID framing with a leading report ID.
    V4,
}

impl WireFormat {
    /// Bytes that precede the frame header in the first packet.
    pub fn first_packet_prefix(self) -> &'static [u8] {
        match self {
            WireFormat::V5 => &[PACKET_MARKER],
            WireFormat::V4 => &[REPORT_ID, PACKET_MARKER],
        }
    }

    /// Payload bytes carried by the first packet: 55 for v5, 54 for v4.
    pub fn first_payload_capacity(self) -> usize {
        PACKET_SIZE - self.first_packet_prefix().len() - FRAME_HEADER_LEN
    }
}

/// A message type plus its serialized body, without any framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub message_type: u16,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(message_type: u16, payload: Vec<u8>) -> Self {
        Self { message_type, payload }
    }

    /// Canonical frame: magic, type, length, payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        frame.put_slice(&MAGIC);
        frame.put_u16(self.message_type);
        frame.put_u32(self.payload.len() as u32);
        frame.put_slice(&self.payload);
        frame.to_vec()
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (message_type, declared) = parse_header(frame)?;
        let received = frame.len() - FRAME_HEADER_LEN;
        if received < declared {
            return Err(ProtocolError::Incomplete { expected: declared, received });
        }
        Ok(Self {
            message_type,
            payload: frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared].to_vec(),
        })
    }
}

/// Read type and declared length from a canonical frame header.
pub fn parse_header(frame: &[u8]) -> Result<(u16, usize), ProtocolError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::ShortFrame { len: frame.len(), needed: FRAME_HEADER_LEN });
    }
    if frame[..2] != MAGIC {
        return Err(ProtocolError::UnexpectedMagic { found: hex::encode(&frame[..2]) });
    }
    let mut header = &frame[2..FRAME_HEADER_LEN];
    let message_type = header.get_u16();
    let declared = header.get_u32() as usize;
    if declared > MAX_MESSAGE_LEN {
        return Err(ProtocolError::LengthTooLarge { declared, max: MAX_MESSAGE_LEN });
    }
    Ok((message_type, declared))
}

/// Split an already-framed buffer into zero-padded 64-byte packets.
pub fn chunk(frame: &[u8], format: WireFormat) -> Result<Vec<[u8; PACKET_SIZE]>, ProtocolError> {
    let (_, declared) = parse_header(frame)?;
    let received = frame.len() - FRAME_HEADER_LEN;
    if received != declared {
        return Err(ProtocolError::Incomplete { expected: declared, received });
    }

    let prefix = format.first_packet_prefix();
    let mut packets = Vec::with_capacity(1 + declared / CONTINUATION_CAPACITY);

    let mut first = [0u8; PACKET_SIZE];
    first[..prefix.len()].copy_from_slice(prefix);
    let first_len = frame.len().min(PACKET_SIZE - prefix.len());
    first[prefix.len()..prefix.len() + first_len].copy_from_slice(&frame[..first_len]);
    packets.push(first);

    for piece in frame[first_len..].chunks(CONTINUATION_CAPACITY) {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0] = PACKET_MARKER;
        packet[1..1 + piece.len()].copy_from_slice(piece);
        packets.push(packet);
    }

    Ok(packets)
}

/// Frame and chunk a message in one step.
pub fn encode(message: &WireMessage, format: WireFormat) -> Result<Vec<[u8; PACKET_SIZE]>, ProtocolError> {
    chunk(&message.to_frame(), format)
}

/// Incremental packet reassembly producing canonical frames.
///
/// For v4, the first packet is accepted with or without the leading report ID
/// since HID stacks differ on whether reads include it. The emitted frame is
/// always the canonical `##` form.
#[derive(Debug)]
pub struct Reassembler {
    format: WireFormat,
    buf: BytesMut,
    expected: Option<usize>,
}

impl Reassembler {
    pub fn new(format: WireFormat) -> Self {
        Self { format, buf: BytesMut::new(), expected: None }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// True when no message is partially received.
    pub fn is_idle(&self) -> bool {
        self.expected.is_none()
    }

    /// Bytes of payload received so far and bytes declared, if mid-message.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.expected
            .map(|expected| (self.buf.len().saturating_sub(FRAME_HEADER_LEN), expected))
    }

    /// Feed one packet. Returns the full frame once the declared length is met.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.expected {
            None => self.push_first(packet),
            Some(expected) => self.push_continuation(packet, expected),
        }
    }

    /// Error out if a message is still partially received.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.progress() {
            Some((received, expected)) => Err(ProtocolError::Incomplete { expected, received }),
            None => Ok(()),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.expected = None;
    }

    fn push_first(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let offset = self.header_offset(packet)?;
        if packet.len() < offset + FRAME_HEADER_LEN {
            return Err(ProtocolError::ShortPacket {
                expected: offset + FRAME_HEADER_LEN,
                actual: packet.len(),
            });
        }

        let frame_start = &packet[offset..];
        let (_, declared) = parse_header(frame_start)?;
        self.buf.clear();
        self.buf.reserve(FRAME_HEADER_LEN + declared);
        self.buf.put_slice(&frame_start[..FRAME_HEADER_LEN]);

        let data = &frame_start[FRAME_HEADER_LEN..];
        self.buf.put_slice(&data[..data.len().min(declared)]);
        self.expected = Some(declared);
        Ok(self.take_if_complete(declared))
    }

    fn push_continuation(
        &mut self,
        packet: &[u8],
        expected: usize,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some(&marker) = packet.first() else {
            return Err(ProtocolError::ShortPacket { expected: 1, actual: 0 });
        };
        if marker != PACKET_MARKER {
            self.clear();
            return Err(ProtocolError::BadContinuation { found: marker });
        }
        let received = self.buf.len() - FRAME_HEADER_LEN;
        let wanted = expected - received;
        let data = &packet[1..];
        self.buf.put_slice(&data[..data.len().min(wanted)]);
        Ok(self.take_if_complete(expected))
    }

    fn header_offset(&self, packet: &[u8]) -> Result<usize, ProtocolError> {
        let starts_with = |prefix: &[u8]| {
            packet.len() >= prefix.len() + MAGIC.len()
                && packet.starts_with(prefix)
                && packet[prefix.len()..prefix.len() + MAGIC.len()] == MAGIC
        };
        match self.format {
            WireFormat::V5 if starts_with(&[PACKET_MARKER]) => Ok(1),
            WireFormat::V4 if starts_with(&[REPORT_ID, PACKET_MARKER]) => Ok(2),
            WireFormat::V4 if starts_with(&[PACKET_MARKER]) => Ok(1),
            _ => Err(ProtocolError::UnexpectedMagic {
                found: hex::encode(&packet[..packet.len().min(4)]),
            }),
        }
    }

    fn take_if_complete(&mut self, expected: usize) -> Option<Vec<u8>> {
        if self.buf.len() - FRAME_HEADER_LEN < expected {
            return None;
        }
        self.expected = None;
        Some(self.buf.split().to_vec())
    }
}

/// Reassemble a complete packet sequence into a canonical frame.
pub fn reassemble<I, P>(packets: I, format: WireFormat) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut reassembler = Reassembler::new(format);
    let mut frame = None;
    for packet in packets {
        if frame.is_some() {
            return Err(ProtocolError::UnexpectedPacket);
        }
        frame = reassembler.push(packet.as_ref())?;
    }
    match frame {
        Some(frame) => Ok(frame),
        None => {
            reassembler.finish()?;
            Err(ProtocolError::ShortFrame { len: 0, needed: FRAME_HEADER_LEN })
        }
    }
}

pub fn decode<I, P>(packets: I, format: WireFormat) -> Result<WireMessage, ProtocolError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    WireMessage::from_frame(&reassemble(packets, format)?)
}

/// Hex of the first `max` bytes, for debug logging.
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    let shown = &bytes[..bytes.len().min(max)];
    if bytes.len() > max {
        format!("{}.. ({} bytes)", hex::encode(shown), bytes.len())
    } else {
        hex::encode(shown)
    }
}
