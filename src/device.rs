use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The message data type used on the sensor's wire.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Deserialize, Serialize)]
pub struct DeviceMessage(String);

impl DeviceMessage {
    /// Create a message from bytes, ignoring any bad utf8 bytes.
    pub fn new_lossy<B: AsRef<[u8]>>(bytes: B) -> Self {
        Self(String::from_utf8_lossy(bytes.as_ref()).to_string())
    }

    /// Turn the message (utf8) into bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T: AsRef<str>> From<T> for DeviceMessage {
    fn from(string_like: T) -> Self {
        Self(string_like.as_ref().into())
    }
}

impl Display for DeviceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.chars().take(48).collect::<String>();

        write!(f, "{}", s.trim())
    }
}

/// The message data type used for raw wire bytes.
pub type DeviceMessageBytes = Vec<u8>;

/// An event on a device connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The connection put this message on the wire.
    ToWire(DeviceMessageBytes),

    /// The connection received this message from the wire.
    FromWire(DeviceMessageBytes),
}

impl Display for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            DeviceEvent::ToWire(b) => {
                write!(f, "ToWire: {}", DeviceMessage::new_lossy(b))
            }
            DeviceEvent::FromWire(b) => {
                write!(f, "FromWire: {}", DeviceMessage::new_lossy(b))
            }
        }
    }
}

impl DeviceEvent {
    /// Attempt to borrow the event as something that was sent to wire.
    pub fn as_to_wire(&self) -> Option<&DeviceMessageBytes> {
        if let Self::ToWire(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Attempt to borrow the event as something that was received from wire.
    pub fn as_from_wire(&self) -> Option<&DeviceMessageBytes> {
        if let Self::FromWire(v) = self {
            Some(v)
        } else {
            None
        }
    }
}
