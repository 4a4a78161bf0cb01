pub mod factory;
pub mod hid;
pub mod mock;
pub mod protocol_adapter;
pub mod webusb;

pub use factory::*;
pub use hid::*;
pub use protocol_adapter::*;
pub use webusb::*;

use crate::codec::{self, Reassembler, WireFormat, PACKET_SIZE};
use crate::error::{LinkError, ProtocolError, TransportError};
use crate::messages::{self, Message};
use core::time::Duration;
use log::{debug, info};
use std::time::Instant;

/// Packets after the first arrive back to back; a gap this long means the
/// device stopped mid-message.
const CONTINUATION_TIMEOUT: Duration = Duration::from_millis(500);
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// One open handle to a device interface, moving 64-byte packets.
///
/// Framing lives in the provided `write`/`read` methods so every link speaks
/// canonical `##` frames to the layers above.
pub trait Transport {
    type Error: std::error::Error + Into<TransportError>;

    fn wire_format(&self) -> WireFormat;
    fn write_packet(&mut self, packet: &[u8; PACKET_SIZE], timeout: Duration) -> Result<(), Self::Error>;
    /// Returns the number of bytes read; zero means nothing arrived in time.
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE], timeout: Duration) -> Result<usize, Self::Error>;
    /// Drain anything the device queued up, leaving the handle open.
    fn reset(&mut self) -> Result<(), Self::Error>;

    /// Older devices need longer per-message timeouts.
    fn legacy_timing(&self) -> bool {
        false
    }

    /// Write a canonical frame. The frame header is already present and is not re-applied.
    fn write(&mut self, frame: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        let packets = codec::chunk(frame, self.wire_format())?;
        debug!(
            "Transport write: {} packets ({:?}), frame {}",
            packets.len(),
            self.wire_format(),
            codec::hex_preview(frame, 32)
        );
        let started = Instant::now();
        for packet in &packets {
            let remaining = timeout.saturating_sub(started.elapsed()).max(MIN_IO_TIMEOUT);
            self.write_packet(packet, remaining).map_err(|e| LinkError::Transport(e.into()))?;
        }
        Ok(frame.len())
    }

    /// Read one message and return it as a canonical frame.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let mut reassembler = Reassembler::new(self.wire_format());
        let mut packet = [0u8; PACKET_SIZE];

        let size = self.read_packet(&mut packet, timeout).map_err(|e| LinkError::Transport(e.into()))?;
        if size == 0 {
            return Err(TransportError::Timeout(timeout).into());
        }
        debug!("Transport read: first packet {}", codec::hex_preview(&packet[..size], 16));
        if let Some(frame) = reassembler.push(&packet[..size])? {
            return Ok(frame);
        }

        let mut packet_count = 1;
        loop {
            packet.fill(0);
            let size = match self.read_packet(&mut packet, CONTINUATION_TIMEOUT) {
                Ok(size) => size,
                Err(e) => {
                    let err: TransportError = e.into();
                    match err {
                        TransportError::Timeout(_) => 0,
                        other => return Err(other.into()),
                    }
                }
            };
            if size == 0 {
                let (received, expected) = reassembler.progress().unwrap_or_default();
                return Err(ProtocolError::Incomplete { expected, received }.into());
            }
            packet_count += 1;
            if let Some(frame) = reassembler.push(&packet[..size])? {
                debug!("Transport read: complete frame in {} packets", packet_count);
                return Ok(frame);
            }
        }
    }
}

pub trait ProtocolAdapter {
    fn reset(&mut self) -> Result<(), LinkError>;
    fn send(&mut self, msg: Message) -> Result<(), LinkError>;
    fn handle(&mut self, msg: Message) -> Result<Message, LinkError>;
    fn as_mut_dyn(&mut self) -> &mut dyn ProtocolAdapter;
    fn with_handler<'a: 'b, 'b>(
        &'a mut self,
        handler: &'b MessageHandler<'b>,
    ) -> Box<dyn ProtocolAdapter + 'b> {
        Box::from(MessageHandlerStack {
            parent_adapter: self.as_mut_dyn(),
            handler,
        })
    }
    fn with_interaction_handler<'a>(&'a mut self) -> Box<dyn ProtocolAdapter + 'a> {
        self.with_handler(&interaction_message_handler)
    }
}

pub type MessageHandler<'a> = dyn Fn(&Message) -> Result<Option<Message>, LinkError> + 'a;

/// Answers the prompts a headless host can satisfy on its own and hands
/// everything else (PIN matrix, passphrase, recovery characters, failures)
/// back to the caller.
pub fn interaction_message_handler(msg: &Message) -> Result<Option<Message>, LinkError> {
    Ok(match msg {
        Message::ButtonRequest(req) => {
            info!("InteractionHandler: ButtonRequest received, code: {:?}, sending ButtonAck", req.code);
            Some(messages::ButtonAck::default().into())
        }
        Message::EntropyRequest(_) => {
            let mut entropy = [0u8; 32];
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut entropy);

            info!("InteractionHandler: EntropyRequest received, sending 32 bytes of entropy");
            Some(messages::EntropyAck { entropy: Some(entropy.into()) }.into())
        }
        _ => None,
    })
}

pub struct MessageHandlerStack<'a, 'b> {
    parent_adapter: &'a mut dyn ProtocolAdapter,
    handler: &'b MessageHandler<'b>,
}

impl ProtocolAdapter for MessageHandlerStack<'_, '_> {
    fn reset(&mut self) -> Result<(), LinkError> {
        self.parent_adapter.reset()
    }
    fn send(&mut self, msg: Message) -> Result<(), LinkError> {
        self.parent_adapter.send(msg)
    }
    fn handle(&mut self, msg: Message) -> Result<Message, LinkError> {
        let mut msg = msg;
        loop {
            let msg_out = self.parent_adapter.handle(msg)?;
            match (self.handler)(&msg_out)? {
                Some(x) => {
                    debug!("MessageHandlerStack: handler answered {} with {}", msg_out.name(), x.name());
                    msg = x;
                }
                None => return Ok(msg_out),
            }
        }
    }
    fn as_mut_dyn(&mut self) -> &mut dyn ProtocolAdapter {
        self
    }
}
