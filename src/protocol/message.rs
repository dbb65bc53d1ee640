//! Message framing for the host/guest network channel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Size of the common `{ type: u32, size: u32 }` header.
pub const HEADER_SIZE: usize = 8;

/// Largest frame a stream transport will accept.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Result reported when the guest closed the channel without answering.
pub const RESULT_NO_RESPONSE: i32 = 713;

/// Result reported for sends attempted after the channel was stopped.
pub const RESULT_SHUTDOWN_IN_PROGRESS: i32 = 1115;

/// Result sent back to the guest when a host callback failed.
pub const RESULT_CALLBACK_FAILED: i32 = -1;

/// Address family values used by the guest (Linux numbering).
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

const PORT_REQUEST_FIELDS_SIZE: usize = 28;

/// Message types carried on the channel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Result = 1,
    InterfaceConfiguration = 2,
    Notification = 3,
    VmNicCreatedNotification = 4,
    CreateDeviceRequest = 5,
    ModifyGuestDeviceSettingRequest = 6,
    LoopbackRoutesRequest = 7,
    DeviceSettingRequest = 8,
    InitialIpConfigurationNotification = 9,
    SetupIpv6 = 10,
    NoOp = 11,
    GlobalNetFilter = 12,
    InterfaceNetFilter = 13,
    ConnectTestRequest = 14,
    PortAllocationRequest = 15,
    InterfaceStateChange = 16,
}

impl TryFrom<u32> for MessageType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        let message_type = match value {
            1 => MessageType::Result,
            2 => MessageType::InterfaceConfiguration,
            3 => MessageType::Notification,
            4 => MessageType::VmNicCreatedNotification,
            5 => MessageType::CreateDeviceRequest,
            6 => MessageType::ModifyGuestDeviceSettingRequest,
            7 => MessageType::LoopbackRoutesRequest,
            8 => MessageType::DeviceSettingRequest,
            9 => MessageType::InitialIpConfigurationNotification,
            10 => MessageType::SetupIpv6,
            11 => MessageType::NoOp,
            12 => MessageType::GlobalNetFilter,
            13 => MessageType::InterfaceNetFilter,
            14 => MessageType::ConnectTestRequest,
            15 => MessageType::PortAllocationRequest,
            16 => MessageType::InterfaceStateChange,
            _ => return Err(Error::UnexpectedMessageType(value)),
        };
        Ok(message_type)
    }
}

impl MessageType {
    /// Offset of the text payload, i.e. the common header plus the
    /// kind-specific fixed fields.
    pub const fn header_offset(self) -> usize {
        match self {
            MessageType::Result | MessageType::InterfaceStateChange => HEADER_SIZE + 4,
            MessageType::Notification => HEADER_SIZE + 16,
            MessageType::PortAllocationRequest => HEADER_SIZE + PORT_REQUEST_FIELDS_SIZE,
            _ => HEADER_SIZE,
        }
    }

    /// Device messages carry a bare JSON document after the common header.
    pub const fn is_device_message(self) -> bool {
        matches!(
            self,
            MessageType::VmNicCreatedNotification
                | MessageType::CreateDeviceRequest
                | MessageType::ModifyGuestDeviceSettingRequest
                | MessageType::LoopbackRoutesRequest
                | MessageType::DeviceSettingRequest
                | MessageType::InitialIpConfigurationNotification
                | MessageType::SetupIpv6
                | MessageType::NoOp
                | MessageType::GlobalNetFilter
                | MessageType::InterfaceNetFilter
                | MessageType::ConnectTestRequest
        )
    }
}

/// Decoded common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub size: u32,
}

/// Read the raw `(type, size)` pair without interpreting the type.
pub fn read_raw_header(bytes: &[u8]) -> Result<(u32, u32)> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::MalformedMessage(format!(
            "message is {} bytes, header needs {}",
            bytes.len(),
            HEADER_SIZE
        )));
    }
    let message_type = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((message_type, size))
}

/// Encode a frame: `[header][fixed][payload][NUL]`.
///
/// `fixed` must be exactly the kind-specific header region.
pub fn encode(message_type: MessageType, fixed: &[u8], payload: &str) -> Result<Vec<u8>> {
    let offset = message_type.header_offset();
    if HEADER_SIZE + fixed.len() != offset {
        return Err(Error::Encoding(format!(
            "{:?} expects {} fixed header bytes, got {}",
            message_type,
            offset - HEADER_SIZE,
            fixed.len()
        )));
    }

    let size = offset
        .checked_add(payload.len())
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| Error::Encoding(format!("{:?} payload too large", message_type)))?;
    let wire_size = u32::try_from(size)
        .map_err(|_| Error::Encoding(format!("{:?} message size {} does not fit in u32", message_type, size)))?;

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(message_type as u32).to_le_bytes());
    buf.extend_from_slice(&wire_size.to_le_bytes());
    buf.extend_from_slice(fixed);
    buf.extend_from_slice(payload.as_bytes());
    buf.push(0);
    debug_assert_eq!(buf.len(), size);

    Ok(buf)
}

/// Decode a frame into its header and the byte range of its payload.
///
/// The range excludes the trailing NUL. A frame without one is accepted.
pub fn decode(bytes: &[u8]) -> Result<(MessageHeader, Range<usize>)> {
    let (raw_type, size) = read_raw_header(bytes)?;
    let message_type = MessageType::try_from(raw_type)?;

    let declared = size as usize;
    if declared < HEADER_SIZE || declared > bytes.len() {
        return Err(Error::MalformedMessage(format!(
            "{:?} declares {} bytes, buffer holds {}",
            message_type,
            size,
            bytes.len()
        )));
    }

    let offset = message_type.header_offset();
    if declared < offset {
        return Err(Error::MalformedMessage(format!(
            "{:?} requires {} header bytes, message has {}",
            message_type, offset, size
        )));
    }

    let mut end = declared;
    if end > offset && bytes[end - 1] == 0 {
        end -= 1;
    }

    Ok((MessageHeader { message_type, size }, offset..end))
}

/// Port bind or release reported by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocationRequest {
    pub address: SocketAddr,
    pub protocol: i32,
    pub allocate: bool,
}

impl PortAllocationRequest {
    fn encode_fields(&self) -> [u8; PORT_REQUEST_FIELDS_SIZE] {
        let mut fields = [0u8; PORT_REQUEST_FIELDS_SIZE];
        let (family, octets) = match self.address.ip() {
            IpAddr::V4(ip) => {
                let mut octets = [0u8; 16];
                octets[..4].copy_from_slice(&ip.octets());
                (AF_INET, octets)
            }
            IpAddr::V6(ip) => (AF_INET6, ip.octets()),
        };
        fields[0..2].copy_from_slice(&family.to_le_bytes());
        fields[2..4].copy_from_slice(&self.address.port().to_le_bytes());
        fields[4..8].copy_from_slice(&self.protocol.to_le_bytes());
        fields[8..12].copy_from_slice(&u32::from(self.allocate).to_le_bytes());
        fields[12..28].copy_from_slice(&octets);
        fields
    }

    fn decode_fields(fixed: &[u8]) -> Result<Self> {
        if fixed.len() != PORT_REQUEST_FIELDS_SIZE {
            return Err(Error::MalformedMessage("port allocation fields truncated".into()));
        }
        let family = u16::from_le_bytes([fixed[0], fixed[1]]);
        let port = u16::from_le_bytes([fixed[2], fixed[3]]);
        let protocol = i32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let allocate = u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]) != 0;

        let ip = match family {
            AF_INET => IpAddr::V4(Ipv4Addr::new(fixed[12], fixed[13], fixed[14], fixed[15])),
            AF_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&fixed[12..28]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(Error::MalformedMessage(format!("unsupported address family {}", other)));
            }
        };

        Ok(Self {
            address: SocketAddr::new(ip, port),
            protocol,
            allocate,
        })
    }
}

/// A typed channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Integer answer to any request.
    Result(i32),
    /// Endpoint state for an adapter (JSON).
    InterfaceConfiguration(String),
    /// Endpoint setting change addressed to one adapter (JSON).
    Notification { adapter_id: Uuid, content: String },
    /// Device-level request (JSON).
    Device { message_type: MessageType, content: String },
    /// Guest bound or released a port.
    PortAllocation(PortAllocationRequest),
    /// Guest interface went up or down.
    InterfaceStateChange { name: String, up: bool },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Result(_) => MessageType::Result,
            Message::InterfaceConfiguration(_) => MessageType::InterfaceConfiguration,
            Message::Notification { .. } => MessageType::Notification,
            Message::Device { message_type, .. } => *message_type,
            Message::PortAllocation(_) => MessageType::PortAllocationRequest,
            Message::InterfaceStateChange { .. } => MessageType::InterfaceStateChange,
        }
    }

    /// Encode the message to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Message::Result(result) => encode(MessageType::Result, &result.to_le_bytes(), ""),
            Message::InterfaceConfiguration(content) => encode(MessageType::InterfaceConfiguration, &[], content),
            Message::Notification { adapter_id, content } => {
                encode(MessageType::Notification, adapter_id.as_bytes(), content)
            }
            Message::Device { message_type, content } => {
                if !message_type.is_device_message() {
                    return Err(Error::Encoding(format!("{:?} is not a device message", message_type)));
                }
                encode(*message_type, &[], content)
            }
            Message::PortAllocation(request) => {
                encode(MessageType::PortAllocationRequest, &request.encode_fields(), "")
            }
            Message::InterfaceStateChange { name, up } => {
                encode(MessageType::InterfaceStateChange, &u32::from(*up).to_le_bytes(), name)
            }
        }
    }

    /// Decode a message from a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = decode(bytes)?;
        let fixed = &bytes[HEADER_SIZE..header.message_type.header_offset()];
        let text = || {
            std::str::from_utf8(&bytes[payload.clone()])
                .map(str::to_owned)
                .map_err(|e| Error::MalformedMessage(format!("{:?} payload is not UTF-8: {}", header.message_type, e)))
        };

        let message = match header.message_type {
            MessageType::Result => Message::Result(i32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]])),
            MessageType::InterfaceConfiguration => Message::InterfaceConfiguration(text()?),
            MessageType::Notification => {
                let mut id = [0u8; 16];
                id.copy_from_slice(fixed);
                Message::Notification {
                    adapter_id: Uuid::from_bytes(id),
                    content: text()?,
                }
            }
            MessageType::PortAllocationRequest => {
                Message::PortAllocation(PortAllocationRequest::decode_fields(fixed)?)
            }
            MessageType::InterfaceStateChange => Message::InterfaceStateChange {
                name: text()?,
                up: u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) != 0,
            },
            message_type => Message::Device {
                message_type,
                content: text()?,
            },
        };

        Ok(message)
    }
}
