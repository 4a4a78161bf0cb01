/// Declares the message catalogue: a `MessageType` id table and a `Message`
/// enum with one variant per prost body plus `Unknown` for ids outside the table.
macro_rules! kk_message {
    ($($name:ident = $id:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[repr(u16)]
        pub enum MessageType {
            $($name = $id),*
        }

        impl MessageType {
            pub fn id(self) -> u16 {
                self as u16
            }

            pub fn from_id(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(MessageType::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$name => stringify!($name),)*
                }
            }
        }

        impl std::fmt::Display for MessageType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $($name($name),)*
            Unknown { message_type: u16, payload: Vec<u8> },
        }

        impl Message {
            /// Numeric id carried in the frame header.
            pub fn type_id(&self) -> u16 {
                match self {
                    $(Message::$name(_) => $id,)*
                    Message::Unknown { message_type, .. } => *message_type,
                }
            }

            pub fn message_type(&self) -> Option<MessageType> {
                MessageType::from_id(self.type_id())
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Message::$name(_) => stringify!($name),)*
                    Message::Unknown { .. } => "Unknown",
                }
            }

            pub fn to_wire(&self) -> crate::codec::WireMessage {
                let payload = match self {
                    $(Message::$name(body) => ::prost::Message::encode_to_vec(body),)*
                    Message::Unknown { payload, .. } => payload.clone(),
                };
                crate::codec::WireMessage::new(self.type_id(), payload)
            }

            pub fn from_wire(wire: &crate::codec::WireMessage) -> Result<Self, crate::error::ProtocolError> {
                let decoded = match MessageType::from_id(wire.message_type) {
                    $(Some(MessageType::$name) => {
                        <$name as ::prost::Message>::decode(wire.payload.as_slice()).map(Message::$name)
                    })*
                    None => {
                        return Ok(Message::Unknown {
                            message_type: wire.message_type,
                            payload: wire.payload.clone(),
                        })
                    }
                };
                decoded.map_err(|e| crate::error::ProtocolError::Decode {
                    message_type: wire.message_type,
                    reason: e.to_string(),
                })
            }
        }

        $(
            impl From<$name> for Message {
                fn from(body: $name) -> Self {
                    Message::$name(body)
                }
            }
        )*
    };
}

pub(crate) use kk_message;
