//! Outbound configuration messenger.
//!
//! Every send is a synchronous round trip: the request frame goes out and the
//! guest answers with a `Result` frame. Sends are serialized by an internal
//! lock so the guest sees them in call order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{DuplexStream, StreamTransport, Transport, TransportCloser};
use crate::config::NetworkingConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::protocol::schema::Endpoint;
use crate::protocol::{Message, MessageType, RESULT_NO_RESPONSE, RESULT_SHUTDOWN_IN_PROGRESS};

/// Host-to-guest configuration channel.
pub struct ConfigChannel {
    transport: Mutex<Box<dyn Transport>>,
    stopped: Arc<AtomicBool>,
    closer: Option<TransportCloser>,
}

impl ConfigChannel {
    pub fn new(transport: impl Transport + 'static) -> Self {
        let closer = match transport.closer() {
            Ok(closer) => Some(closer),
            Err(e) => {
                warn!(error = %e, "configuration channel cannot be closed asynchronously");
                None
            }
        };

        Self {
            transport: Mutex::new(Box::new(transport)),
            stopped: Arc::new(AtomicBool::new(false)),
            closer,
        }
    }

    /// Channel over a connected stream, bounded by the configured
    /// transaction timeout.
    pub fn over_stream<S: DuplexStream>(stream: S, config: &NetworkingConfig) -> Result<Self> {
        let transport = StreamTransport::new(stream, "config").with_timeout(config.transaction_timeout)?;
        Ok(Self::new(transport))
    }

    /// Send a message and ignore the guest's answer.
    ///
    /// Transport failures are still reported.
    pub fn notify(&self, message: &Message) -> Result<()> {
        if let Some(code) = self.transact(message)? {
            if code != 0 {
                debug!(message_type = ?message.message_type(), code, "guest answered notification with error");
            }
        }
        Ok(())
    }

    /// Send a message and require a zero answer.
    pub fn command(&self, message: &Message) -> Result<()> {
        match self.transact(message)? {
            Some(code) => check_result(message.message_type(), code),
            None => Ok(()),
        }
    }

    /// Send a message and return the guest's answer as is.
    ///
    /// Returns [`RESULT_SHUTDOWN_IN_PROGRESS`] once the channel is stopped.
    pub fn command_for_result(&self, message: &Message) -> Result<i32> {
        match self.transact(message)? {
            Some(RESULT_NO_RESPONSE) => Err(Error::UnexpectedGuestExit {
                message_type: message.message_type(),
            }),
            Some(code) => Ok(code),
            None => Ok(RESULT_SHUTDOWN_IN_PROGRESS),
        }
    }

    /// Stop the channel. Later sends return without touching the transport.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping configuration channel");
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Push an endpoint's address to the guest.
    pub fn send_endpoint_state(&self, endpoint: &Endpoint) -> Result<()> {
        let content = serde_json::to_string(endpoint)?;
        self.command(&Message::InterfaceConfiguration(content))
    }

    /// Send an endpoint setting change addressed to one adapter.
    pub fn send_endpoint_notification<T: Serialize>(&self, adapter_id: Uuid, settings: &T) -> Result<()> {
        let content = serde_json::to_string(settings)?;
        self.notify(&Message::Notification { adapter_id, content })
    }

    pub fn send_device_message<T: Serialize>(&self, message_type: MessageType, request: &T) -> Result<()> {
        self.command(&device_message(message_type, request)?)
    }

    pub fn send_device_message_for_result<T: Serialize>(&self, message_type: MessageType, request: &T) -> Result<i32> {
        self.command_for_result(&device_message(message_type, request)?)
    }

    /// Round trip one message. `None` means the channel is stopped.
    fn transact(&self, message: &Message) -> Result<Option<i32>> {
        if self.is_stopped() {
            return Ok(None);
        }

        let request = message.encode()?;
        let mut transport = lock(&self.transport);
        if self.is_stopped() {
            return Ok(None);
        }

        let answer = match transport.transact(&request) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if self.is_stopped() {
                    return Ok(None);
                }
                return Ok(Some(RESULT_NO_RESPONSE));
            }
            Err(e) if self.is_stopped() => {
                debug!(error = %e, "send failed during shutdown");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match Message::decode(&answer)? {
            Message::Result(code) => {
                debug!(message_type = ?message.message_type(), code, "guest answered");
                Ok(Some(code))
            }
            other => Err(Error::UnexpectedMessageType(other.message_type() as u32)),
        }
    }
}

fn device_message<T: Serialize>(message_type: MessageType, request: &T) -> Result<Message> {
    debug_assert!(message_type.is_device_message(), "{:?} is not a device message", message_type);
    Ok(Message::Device {
        message_type,
        content: serde_json::to_string(request)?,
    })
}

fn check_result(message_type: MessageType, code: i32) -> Result<()> {
    match code {
        0 => Ok(()),
        RESULT_NO_RESPONSE => Err(Error::UnexpectedGuestExit { message_type }),
        code => Err(Error::GuestRejected { message_type, code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::{CreateDeviceRequest, DeviceType, Dns};
    use crate::testing::FakeTransport;
    #[cfg(unix)]
    use std::io::Write;
    #[cfg(unix)]
    use std::os::unix::net::UnixStream;
    #[cfg(unix)]
    use std::thread;
    #[cfg(unix)]
    use std::time::Duration;

    fn noop() -> Message {
        Message::Device {
            message_type: MessageType::NoOp,
            content: "{}".into(),
        }
    }

    #[test]
    fn test_command_success() {
        let transport = FakeTransport::new();
        let channel = ConfigChannel::new(transport.clone());
        channel.command(&noop()).unwrap();
        assert_eq!(transport.sent(), vec![noop()]);
    }

    #[test]
    fn test_command_rejected() {
        let transport = FakeTransport::new();
        transport.push_result(Some(22));
        let channel = ConfigChannel::new(transport);
        match channel.command(&noop()) {
            Err(Error::GuestRejected { message_type, code }) => {
                assert_eq!(message_type, MessageType::NoOp);
                assert_eq!(code, 22);
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_command_guest_exit() {
        let transport = FakeTransport::new();
        transport.push_result(None);
        let channel = ConfigChannel::new(transport);
        assert!(matches!(
            channel.command(&noop()),
            Err(Error::UnexpectedGuestExit { message_type: MessageType::NoOp })
        ));
    }

    #[test]
    fn test_notify_ignores_guest_error() {
        let transport = FakeTransport::new();
        transport.push_result(Some(5));
        let channel = ConfigChannel::new(transport.clone());
        channel.notify(&noop()).unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_notify_surfaces_transport_failure() {
        let transport = FakeTransport::new();
        transport.fail_next_send();
        let channel = ConfigChannel::new(transport);
        assert!(matches!(channel.notify(&noop()), Err(Error::Io(_))));
    }

    #[test]
    fn test_command_for_result_returns_raw_value() {
        let transport = FakeTransport::new();
        transport.push_result(Some(42));
        let channel = ConfigChannel::new(transport);
        assert_eq!(channel.command_for_result(&noop()).unwrap(), 42);
    }

    #[test]
    fn test_stop_is_idempotent_and_silences_sends() {
        let transport = FakeTransport::new();
        let channel = ConfigChannel::new(transport.clone());
        channel.stop();
        channel.stop();
        assert!(channel.is_stopped());

        channel.notify(&noop()).unwrap();
        channel.command(&noop()).unwrap();
        assert_eq!(channel.command_for_result(&noop()).unwrap(), RESULT_SHUTDOWN_IN_PROGRESS);
        assert!(transport.sent().is_empty());
        assert!(transport.is_closed());
    }

    #[test]
    fn test_endpoint_notification_frame() {
        let transport = FakeTransport::new();
        let channel = ConfigChannel::new(transport.clone());
        let adapter_id = Uuid::from_u128(7);
        let dns = Dns {
            server_list: "8.8.8.8".into(),
            ..Default::default()
        };
        channel.send_endpoint_notification(adapter_id, &dns).unwrap();

        match &transport.sent()[0] {
            Message::Notification { adapter_id: id, content } => {
                assert_eq!(*id, adapter_id);
                let value: serde_json::Value = serde_json::from_str(content).unwrap();
                assert_eq!(value["ServerList"], "8.8.8.8");
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_device_message_for_result() {
        let transport = FakeTransport::new();
        transport.push_result(Some(3));
        transport.push_result(None);
        let channel = ConfigChannel::new(transport.clone());
        let request = CreateDeviceRequest {
            device_type: DeviceType::Loopback,
            device_name: "loopback0".into(),
            ..Default::default()
        };

        assert_eq!(
            channel
                .send_device_message_for_result(MessageType::CreateDeviceRequest, &request)
                .unwrap(),
            3
        );
        assert!(matches!(
            channel.send_device_message_for_result(MessageType::CreateDeviceRequest, &request),
            Err(Error::UnexpectedGuestExit {
                message_type: MessageType::CreateDeviceRequest
            })
        ));
        assert_eq!(transport.sent().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_unblocks_pending_command() {
        let (host, _guest) = UnixStream::pair().unwrap();
        let channel = ConfigChannel::new(StreamTransport::new(host, "config"));

        // The guest never answers.
        thread::scope(|scope| {
            let pending = scope.spawn(|| channel.command(&noop()));
            thread::sleep(Duration::from_millis(50));
            channel.stop();
            assert!(pending.join().unwrap().is_ok());
        });
        assert!(channel.is_stopped());
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_during_stop_is_swallowed() {
        let (host, mut guest) = UnixStream::pair().unwrap();
        let channel = ConfigChannel::new(StreamTransport::new(host, "config"));

        // Half an answer header, then silence: stopping cuts the frame short.
        guest.write_all(&(MessageType::Result as u32).to_le_bytes()).unwrap();
        thread::scope(|scope| {
            let pending = scope.spawn(|| channel.command_for_result(&noop()));
            thread::sleep(Duration::from_millis(50));
            channel.stop();
            assert_eq!(pending.join().unwrap().unwrap(), RESULT_SHUTDOWN_IN_PROGRESS);
        });
        drop(guest);
    }

    #[test]
    fn test_device_message() {
        let transport = FakeTransport::new();
        let channel = ConfigChannel::new(transport.clone());
        let request = CreateDeviceRequest {
            device_type: DeviceType::Loopback,
            device_name: "loopback0".into(),
            ..Default::default()
        };
        channel.send_device_message(MessageType::CreateDeviceRequest, &request).unwrap();
        assert_eq!(transport.sent()[0].message_type(), MessageType::CreateDeviceRequest);
    }
}
