//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::channel::transport::{Transport, TransportCloser};
use crate::error::Result;
use crate::host::{
    AddressFamily, ConnectivityCallback, ConnectivityHint, HostNetwork, IpInterface, NetworkSettings, Subscription,
    UnicastAddress,
};
use crate::protocol::Message;

#[derive(Default)]
struct TransportState {
    sent: Vec<Vec<u8>>,
    results: VecDeque<Option<i32>>,
    inbound: VecDeque<Vec<u8>>,
    replies: Vec<i32>,
    fail_next_send: bool,
    closed: bool,
}

/// Scriptable [`Transport`]. Clones share state.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<(Mutex<TransportState>, Condvar)>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TransportState) -> R) -> R {
        let (state, cond) = &*self.inner;
        let result = f(&mut state.lock().unwrap());
        cond.notify_all();
        result
    }

    /// Queue the answer for the next request. `None` closes without answering.
    /// Requests with nothing queued are answered with 0.
    pub fn push_result(&self, result: Option<i32>) {
        self.with_state(|s| s.results.push_back(result));
    }

    pub fn fail_next_send(&self) {
        self.with_state(|s| s.fail_next_send = true);
    }

    /// Queue a frame for `receive_or_closed`.
    pub fn push_inbound(&self, message: &Message) {
        let frame = message.encode().unwrap();
        self.push_inbound_bytes(frame);
    }

    pub fn push_inbound_bytes(&self, frame: Vec<u8>) {
        self.with_state(|s| s.inbound.push_back(frame));
    }

    pub fn close(&self) {
        self.with_state(|s| s.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    /// Requests sent so far, decoded.
    pub fn sent(&self) -> Vec<Message> {
        self.with_state(|s| s.sent.iter().map(|frame| Message::decode(frame).unwrap()).collect())
    }

    pub fn sent_bytes(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.sent.clone())
    }

    pub fn replies(&self) -> Vec<i32> {
        self.with_state(|s| s.replies.clone())
    }

    /// Wait until at least `count` replies were sent back.
    pub fn wait_for_replies(&self, count: usize, timeout: Duration) -> Vec<i32> {
        let deadline = Instant::now() + timeout;
        let (state, cond) = &*self.inner;
        let mut guard = state.lock().unwrap();
        while guard.replies.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = cond.wait_timeout(guard, deadline - now).unwrap().0;
        }
        guard.replies.clone()
    }
}

impl Transport for FakeTransport {
    fn transact(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_state(|s| -> Result<Option<Vec<u8>>> {
            if s.fail_next_send {
                s.fail_next_send = false;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake send failure").into());
            }
            if s.closed {
                return Ok(None);
            }
            s.sent.push(request.to_vec());
            match s.results.pop_front() {
                Some(Some(code)) => Ok(Some(Message::Result(code).encode()?)),
                Some(None) => Ok(None),
                None => Ok(Some(Message::Result(0).encode()?)),
            }
        })
    }

    fn receive_or_closed(&mut self) -> Result<Option<Vec<u8>>> {
        let (state, cond) = &*self.inner;
        let mut guard = state.lock().unwrap();
        loop {
            if let Some(frame) = guard.inbound.pop_front() {
                return Ok(Some(frame));
            }
            if guard.closed {
                return Ok(None);
            }
            guard = cond.wait(guard).unwrap();
        }
    }

    fn send_result(&mut self, result: i32) -> Result<()> {
        self.with_state(|s| s.replies.push(result));
        Ok(())
    }

    fn closer(&self) -> Result<TransportCloser> {
        let transport = self.clone();
        Ok(TransportCloser::new(move || transport.close()))
    }
}

#[derive(Default)]
struct HostState {
    settings: NetworkSettings,
    addresses: Vec<UnicastAddress>,
    interfaces: Vec<IpInterface>,
    hint: ConnectivityHint,
    scripted_hints: VecDeque<ConnectivityHint>,
    callbacks: HashMap<u64, Arc<ConnectivityCallback>>,
    next_subscription: u64,
    address_queries: usize,
}

/// Mutable [`HostNetwork`]. Clones share state.
#[derive(Clone, Default)]
pub struct FakeHost {
    inner: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new(settings: NetworkSettings) -> Self {
        let host = Self::default();
        host.inner.lock().unwrap().settings = settings;
        host
    }

    pub fn set_settings(&self, settings: NetworkSettings) {
        self.inner.lock().unwrap().settings = settings;
    }

    pub fn set_addresses(&self, addresses: Vec<UnicastAddress>) {
        self.inner.lock().unwrap().addresses = addresses;
    }

    pub fn set_interfaces(&self, interfaces: Vec<IpInterface>) {
        self.inner.lock().unwrap().interfaces = interfaces;
    }

    /// Replace the table with one connected IPv4 interface.
    pub fn set_connected_interface(&self, interface_id: u64, connected: bool, mtu: u32) {
        self.set_interfaces(vec![IpInterface {
            interface_id,
            family: AddressFamily::Ipv4,
            connected,
            mtu,
        }]);
    }

    /// Hints returned by the next `connectivity_hint` calls, before falling
    /// back to the current one.
    pub fn script_hints(&self, hints: impl IntoIterator<Item = ConnectivityHint>) {
        self.inner.lock().unwrap().scripted_hints.extend(hints);
    }

    /// Set the current hint and invoke every subscriber.
    pub fn notify(&self, hint: ConnectivityHint) {
        let callbacks: Vec<_> = {
            let mut state = self.inner.lock().unwrap();
            state.hint = hint;
            state.callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            callback(hint);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().callbacks.len()
    }

    pub fn address_queries(&self) -> usize {
        self.inner.lock().unwrap().address_queries
    }
}

impl HostNetwork for FakeHost {
    fn endpoint_settings(&self) -> Result<NetworkSettings> {
        Ok(self.inner.lock().unwrap().settings.clone())
    }

    fn unicast_addresses(&self) -> Result<Vec<UnicastAddress>> {
        let mut state = self.inner.lock().unwrap();
        state.address_queries += 1;
        Ok(state.addresses.clone())
    }

    fn ip_interfaces(&self) -> Result<Vec<IpInterface>> {
        Ok(self.inner.lock().unwrap().interfaces.clone())
    }

    fn connectivity_hint(&self) -> Result<ConnectivityHint> {
        let mut state = self.inner.lock().unwrap();
        let hint = state.scripted_hints.pop_front().unwrap_or(state.hint);
        Ok(hint)
    }

    fn subscribe(&self, callback: ConnectivityCallback) -> Result<Subscription> {
        let id = {
            let mut state = self.inner.lock().unwrap();
            let id = state.next_subscription;
            state.next_subscription += 1;
            state.callbacks.insert(id, Arc::new(callback));
            id
        };
        let inner = self.inner.clone();
        Ok(Subscription::new(move || {
            inner.lock().unwrap().callbacks.remove(&id);
        }))
    }
}
