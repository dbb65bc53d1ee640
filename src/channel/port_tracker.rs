//! Inbound event server for guest port binds and interface state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use super::transport::{Transport, TransportCloser};
use crate::error::{Error, Result};
use crate::protocol::{Message, PortAllocationRequest, RESULT_CALLBACK_FAILED};

const THREAD_NAME: &str = "guestnet-port-tracker";

/// Receive loop answering guest-originated requests on its own thread.
///
/// Dropping the server closes its transport and joins the thread, so no
/// handler runs once teardown has started.
pub struct PortEventServer {
    closer: TransportCloser,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortEventServer {
    /// Spawn the receive loop.
    ///
    /// `port_handler`'s return value is sent back to the guest as is.
    /// Interface events are always answered with 0.
    pub fn start<T, P, I>(mut transport: T, port_handler: P, interface_handler: I) -> Result<Self>
    where
        T: Transport + 'static,
        P: Fn(PortAllocationRequest) -> i32 + Send + 'static,
        I: Fn(&str, bool) + Send + 'static,
    {
        let closer = transport.closer()?;
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new().name(THREAD_NAME.into()).spawn(move || {
            match serve(&mut transport, &port_handler, &interface_handler) {
                Ok(()) => debug!("port tracker channel closed"),
                Err(e) => error!(error = %e, "port tracker terminated"),
            }
            thread_running.store(false, Ordering::SeqCst);
        })?;

        info!("port tracker started");
        Ok(Self {
            closer,
            running,
            handle: Some(handle),
        })
    }

    /// Whether the receive loop is still listening.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close the transport and join the receive loop.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.closer.close();
        if handle.join().is_err() {
            error!("port tracker thread panicked");
        }
        info!("port tracker stopped");
    }
}

impl Drop for PortEventServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve<T, P, I>(transport: &mut T, port_handler: &P, interface_handler: &I) -> Result<()>
where
    T: Transport,
    P: Fn(PortAllocationRequest) -> i32,
    I: Fn(&str, bool),
{
    while let Some(frame) = transport.receive_or_closed()? {
        let result = match Message::decode(&frame)? {
            Message::PortAllocation(request) => {
                debug!(
                    address = %request.address,
                    protocol = request.protocol,
                    allocate = request.allocate,
                    "port allocation request"
                );
                invoke("port", || port_handler(request)).unwrap_or(RESULT_CALLBACK_FAILED)
            }
            Message::InterfaceStateChange { name, up } => {
                debug!(interface = %name, up, "guest interface state change");
                invoke("interface", || interface_handler(&name, up))
                    .map(|()| 0)
                    .unwrap_or(RESULT_CALLBACK_FAILED)
            }
            other => return Err(Error::UnexpectedMessageType(other.message_type() as u32)),
        };
        transport.send_result(result)?;
    }
    Ok(())
}

fn invoke<R>(handler: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(payload) => {
            error!(handler, panic = panic_message(payload.as_ref()), "handler panicked");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown"
    }
}
