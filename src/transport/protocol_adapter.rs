use super::{ProtocolAdapter, Transport};
use crate::error::LinkError;
use crate::messages::Message;

use log::{debug, info};

impl<T> ProtocolAdapter for T
where
    T: Transport,
{
    fn reset(&mut self) -> Result<(), LinkError> {
        <T as Transport>::reset(self).map_err(|e| LinkError::Transport(e.into()))
    }

    fn send(&mut self, msg: Message) -> Result<(), LinkError> {
        info!("ProtocolAdapter::send: Sending {} (type {})", msg.name(), msg.type_id());

        let frame = msg.to_frame();
        debug!("ProtocolAdapter::send: Encoded frame size: {} bytes", frame.len());

        self.write(&frame, msg.write_timeout(self.legacy_timing()))?;
        Ok(())
    }

    fn as_mut_dyn(&mut self) -> &mut dyn ProtocolAdapter {
        self
    }

    fn handle(&mut self, msg: Message) -> Result<Message, LinkError> {
        let read_timeout = msg.read_timeout(self.legacy_timing());
        self.send(msg)?;

        debug!("ProtocolAdapter::handle: Waiting for response (timeout: {:?})...", read_timeout);
        let frame = self.read(read_timeout)?;

        let out = Message::from_frame(&frame)?;
        info!("ProtocolAdapter::handle: Received {} ({} bytes)", out.name(), frame.len());
        Ok(out)
    }
}
