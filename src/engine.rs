//! Guest network bring-up and synchronization with the host network.
//!
//! The engine plugs a virtio-net adapter into the guest that mirrors the
//! host's preferred address, pushes address, route and DNS settings over the
//! configuration channel, optionally sets up the loopback relay device, and
//! serves guest port binds through the port tracker.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::os::unix::net::UnixStream;
//! use guestnet::{ConfigChannel, NetworkEngine, NetworkingConfig, SystemHostNetwork};
//!
//! # fn attach_nic(_tag: &str, _options: &str) -> guestnet::Result<uuid::Uuid> { unimplemented!() }
//! # fn main() -> guestnet::Result<()> {
//! let config = NetworkingConfig::from_env()?;
//! let stream = UnixStream::connect("/run/guest/gns.sock")?;
//! let channel = ConfigChannel::over_stream(stream, &config)?;
//! let host = Arc::new(SystemHostNetwork::from_config(&config));
//!
//! let engine = NetworkEngine::builder(channel, host, config)
//!     .on_add_guest_device(|_class, _device, tag, options| attach_nic(tag, options))
//!     .on_modify_open_ports(|_class, _tag, _addr, _protocol, _open| 0)
//!     .on_guest_interface_state_changed(|_name, _up| {})
//!     .build();
//! engine.initialize()?;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ConfigChannel, PortEventServer, Transport};
use crate::config::NetworkingConfig;
use crate::error::{Error, Result};
use crate::forwarding::{self, Protocol, LOOPBACK_DEVICE_TAG, PRIMARY_DEVICE_TAG};
use crate::host::{
    minimum_connected_mtu, AddressFamily, ConnectivityHint, HostNetwork, NetworkSettings, Subscription,
};
use crate::lock;
use crate::protocol::message::AF_INET;
use crate::protocol::schema::{
    CreateDeviceRequest, DeviceType, Dns, Endpoint, GuestEndpointResourceType, ModifyGuestEndpointSettingRequest,
    ModifyRequestType, NetworkInterface, Route,
};
use crate::protocol::{MessageType, PortAllocationRequest};

/// Device class of the virtio-net adapter.
pub const VIRTIO_NET_CLASS_ID: Uuid = Uuid::from_u128(0x16479d2e_f0c3_4dba_bf7a_04fff0892b07);

/// Device instance id of the virtio-net adapter.
pub const VIRTIO_NET_DEVICE_ID: Uuid = Uuid::from_u128(0xf07010d0_0ea9_447f_88ef_bd952a4d2f14);

const LOOPBACK_DEVICE_OPTIONS: &str = "client_ip=127.0.0.1;client_mac=00:11:22:33:44:55";

// loopback0 and its gateway (169.254.73.152) are the only hosts on this /30.
const LOOPBACK_ENDPOINT_ADDRESS: &str = "169.254.73.153";
const LOOPBACK_ENDPOINT_PREFIX_LENGTH: u8 = 30;

const DEFAULT_ROUTE_PREFIX: &str = "0.0.0.0/0";

const WORKER_THREAD_NAME: &str = "guestnet-connectivity";

/// Plugs a device into the guest: `(class_id, device_id, tag, options) -> adapter_id`.
pub type AddGuestDeviceFn = dyn Fn(&Uuid, &Uuid, &str, &str) -> Result<Uuid> + Send + Sync;

/// Opens or releases a host port: `(class_id, tag, address, protocol, open) -> result`.
pub type ModifyOpenPortsFn = dyn Fn(&Uuid, &str, SocketAddr, Protocol, bool) -> i32 + Send + Sync;

/// Observes guest interface state: `(name, up)`.
pub type InterfaceStateChangedFn = dyn Fn(&str, bool) + Send + Sync;

/// Lifecycle of a [`NetworkEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkingMode {
    VirtioProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTrackerType {
    Mirrored,
}

/// Networking flags reported to the guest's boot configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialNetworkingConfiguration {
    pub mode: NetworkingMode,
    pub disable_ipv6: bool,
    pub enable_dhcp_client: bool,
    pub port_tracker: PortTrackerType,
}

#[derive(Default)]
struct Callbacks {
    add_guest_device: Option<Arc<AddGuestDeviceFn>>,
    modify_open_ports: Option<Arc<ModifyOpenPortsFn>>,
    interface_state_changed: Option<Arc<InterfaceStateChangedFn>>,
}

/// Mutable engine state, guarded by one lock.
#[derive(Debug)]
struct Shared {
    state: EngineState,
    settings: Option<NetworkSettings>,
    adapter_id: Option<Uuid>,
    loopback_adapter_id: Option<Uuid>,
    /// Last MTU observed on the host.
    mtu: Option<u32>,
    /// MTU change not yet sent to the guest.
    pending_mtu: Option<u32>,
    interface_id: Option<u64>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: EngineState::Uninitialized,
            settings: None,
            adapter_id: None,
            loopback_adapter_id: None,
            mtu: None,
            pending_mtu: None,
            interface_id: None,
        }
    }
}

struct Inner {
    channel: ConfigChannel,
    host: Arc<dyn HostNetwork>,
    config: NetworkingConfig,
    callbacks: Callbacks,
    shared: Mutex<Shared>,
}

enum WorkerEvent {
    Connectivity(ConnectivityHint),
    Shutdown,
}

/// Builder for a [`NetworkEngine`].
pub struct NetworkEngineBuilder {
    channel: ConfigChannel,
    host: Arc<dyn HostNetwork>,
    config: NetworkingConfig,
    callbacks: Callbacks,
}

impl NetworkEngineBuilder {
    /// Set the device-attach callback.
    pub fn on_add_guest_device<F>(mut self, f: F) -> Self
    where
        F: Fn(&Uuid, &Uuid, &str, &str) -> Result<Uuid> + Send + Sync + 'static,
    {
        self.callbacks.add_guest_device = Some(Arc::new(f));
        self
    }

    /// Set the host port callback used by the port tracker.
    pub fn on_modify_open_ports<F>(mut self, f: F) -> Self
    where
        F: Fn(&Uuid, &str, SocketAddr, Protocol, bool) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.modify_open_ports = Some(Arc::new(f));
        self
    }

    pub fn on_guest_interface_state_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.callbacks.interface_state_changed = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> NetworkEngine {
        NetworkEngine {
            inner: Arc::new(Inner {
                channel: self.channel,
                host: self.host,
                config: self.config,
                callbacks: self.callbacks,
                shared: Mutex::new(Shared::default()),
            }),
            stopping: AtomicBool::new(false),
            subscription: Mutex::new(None),
            port_tracker: Mutex::new(None),
            events: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }
}

/// Host-side network engine for one guest.
pub struct NetworkEngine {
    inner: Arc<Inner>,
    stopping: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
    port_tracker: Mutex<Option<PortEventServer>>,
    events: Mutex<Option<UnboundedSender<WorkerEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkEngine {
    pub fn builder(channel: ConfigChannel, host: Arc<dyn HostNetwork>, config: NetworkingConfig) -> NetworkEngineBuilder {
        NetworkEngineBuilder {
            channel,
            host,
            config,
            callbacks: Callbacks::default(),
        }
    }

    /// Bring up guest networking.
    ///
    /// Settings already sent to the guest are not rolled back on failure.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut shared = lock(&self.inner.shared);
            if shared.state != EngineState::Uninitialized {
                return Err(Error::InvalidState("engine already initialized"));
            }
            shared.state = EngineState::Initializing;
        }

        match self.try_initialize() {
            Ok(()) => {
                let mut shared = lock(&self.inner.shared);
                if shared.state == EngineState::Initializing {
                    shared.state = EngineState::Running;
                }
                info!(adapter_id = ?shared.adapter_id, "guest networking initialized");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to initialize guest networking");
                let mut shared = lock(&self.inner.shared);
                if shared.state == EngineState::Initializing {
                    shared.state = EngineState::Uninitialized;
                }
                Err(e)
            }
        }
    }

    fn try_initialize(&self) -> Result<()> {
        let callbacks = &self.inner.callbacks;
        let add_guest_device = callbacks
            .add_guest_device
            .clone()
            .ok_or(Error::NotConfigured("add_guest_device callback"))?;
        if callbacks.modify_open_ports.is_none() {
            return Err(Error::NotConfigured("modify_open_ports callback"));
        }
        if callbacks.interface_state_changed.is_none() {
            return Err(Error::NotConfigured("interface_state_changed callback"));
        }

        let settings = self.inner.host.endpoint_settings()?;
        let mtu = match self.inner.host.ip_interfaces() {
            Ok(interfaces) => minimum_connected_mtu(&interfaces),
            Err(e) => {
                warn!(error = %e, "failed to query host interfaces");
                None
            }
        };

        let options = settings.device_options();
        info!(%options, "adding guest network device");
        let adapter_id = add_device(add_guest_device.as_ref(), PRIMARY_DEVICE_TAG, &options)?;

        {
            let mut shared = lock(&self.inner.shared);
            shared.adapter_id = Some(adapter_id);
            shared.mtu = mtu;
            self.inner.send_primary_configuration(adapter_id, &settings)?;
            shared.settings = Some(settings);
        }

        if self.inner.config.enable_localhost_relay {
            self.ensure_not_stopping()?;
            self.setup_loopback_device(add_guest_device.as_ref())?;
        }

        self.ensure_not_stopping()?;
        self.start_connectivity_tracking()?;

        // A stop() that raced with the setup above may have missed the
        // worker or the subscription.
        if self.stopping.load(Ordering::SeqCst) {
            self.teardown();
            return Err(Error::InvalidState("engine stopped during initialization"));
        }
        Ok(())
    }

    fn ensure_not_stopping(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("engine stopped during initialization"));
        }
        Ok(())
    }

    fn setup_loopback_device(&self, add_guest_device: &AddGuestDeviceFn) -> Result<()> {
        let adapter_id = add_device(add_guest_device, LOOPBACK_DEVICE_TAG, LOOPBACK_DEVICE_OPTIONS)?;
        debug!(%adapter_id, "added loopback relay device");

        // The MAC is advertised by the virtio device itself.
        let endpoint = Endpoint {
            id: adapter_id,
            ip_address: LOOPBACK_ENDPOINT_ADDRESS.into(),
            prefix_length: LOOPBACK_ENDPOINT_PREFIX_LENGTH,
            port_friendly_name: LOOPBACK_DEVICE_TAG.into(),
            ..Default::default()
        };
        self.inner.channel.send_endpoint_state(&endpoint)?;

        let request = CreateDeviceRequest {
            device_type: DeviceType::Loopback,
            device_name: LOOPBACK_DEVICE_TAG.into(),
            lower_edge_adapter_id: Some(adapter_id),
            lower_edge_device_name: None,
        };
        self.inner.channel.send_device_message(MessageType::CreateDeviceRequest, &request)?;

        lock(&self.inner.shared).loopback_adapter_id = Some(adapter_id);
        Ok(())
    }

    /// Subscribe to host connectivity changes, handled on a worker thread.
    fn start_connectivity_tracking(&self) -> Result<()> {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || run_worker(inner, receiver))?;
        *lock(&self.worker) = Some(worker);

        let hints = events.clone();
        *lock(&self.events) = Some(events);

        let subscription = self.inner.host.subscribe(Box::new(move |hint| {
            // The receiver is gone once the engine stops.
            let _ = hints.send(WorkerEvent::Connectivity(hint));
        }))?;
        *lock(&self.subscription) = Some(subscription);
        Ok(())
    }

    /// Start serving guest port binds. May only be called once.
    pub fn start_port_tracker<T: Transport + 'static>(&self, transport: T) -> Result<()> {
        let mut slot = lock(&self.port_tracker);
        debug_assert!(slot.is_none(), "port tracker already started");
        if slot.is_some() {
            return Err(Error::InvalidState("port tracker already started"));
        }

        let callbacks = &self.inner.callbacks;
        let modify_open_ports = callbacks
            .modify_open_ports
            .clone()
            .ok_or(Error::NotConfigured("modify_open_ports callback"))?;
        let interface_state_changed = callbacks
            .interface_state_changed
            .clone()
            .ok_or(Error::NotConfigured("interface_state_changed callback"))?;
        let relay_enabled = self.inner.config.enable_localhost_relay;

        let server = PortEventServer::start(
            transport,
            move |request| handle_port_request(modify_open_ports.as_ref(), relay_enabled, request),
            move |name: &str, up| interface_state_changed(name, up),
        )?;
        *slot = Some(server);
        Ok(())
    }

    /// Re-sync the guest after a host connectivity change.
    pub fn refresh_guest_connection(&self, hint: ConnectivityHint) -> Result<()> {
        self.inner.refresh_guest_connection(hint)
    }

    /// Resolve `address` to the host interface carrying it.
    ///
    /// Waits up to the configured deadline for the address to appear and
    /// its IPv4 interface to become connected. Returns `Ok(None)` when the
    /// deadline passes and [`Error::RetryableConnectivityChanged`] if the
    /// host connectivity moves away from `hint` meanwhile.
    pub fn find_interface_id(&self, address: IpAddr, hint: ConnectivityHint) -> Result<Option<u64>> {
        self.inner.find_interface_id(address, hint)
    }

    /// Resolve the guest's address and record the interface id.
    pub fn resolve_guest_interface(&self, hint: ConnectivityHint) -> Result<Option<u64>> {
        self.inner.resolve_guest_interface(hint)
    }

    pub fn initial_configuration(&self) -> InitialNetworkingConfiguration {
        InitialNetworkingConfiguration {
            mode: NetworkingMode::VirtioProxy,
            disable_ipv6: false,
            enable_dhcp_client: false,
            port_tracker: PortTrackerType::Mirrored,
        }
    }

    /// Log the current networking state.
    pub fn trace_rundown(&self) {
        let shared = lock(&self.inner.shared);
        info!(
            state = ?shared.state,
            settings = ?shared.settings,
            adapter_id = ?shared.adapter_id,
            loopback_adapter_id = ?shared.loopback_adapter_id,
            mtu = ?shared.mtu,
            pending_mtu = ?shared.pending_mtu,
            interface_id = ?shared.interface_id,
            port_tracker_running = lock(&self.port_tracker).as_ref().map(PortEventServer::is_running),
            "networking rundown"
        );
    }

    pub fn state(&self) -> EngineState {
        lock(&self.inner.shared).state
    }

    pub fn adapter_id(&self) -> Option<Uuid> {
        lock(&self.inner.shared).adapter_id
    }

    /// Host interface resolved for the guest, if any.
    pub fn interface_id(&self) -> Option<u64> {
        lock(&self.inner.shared).interface_id
    }

    /// MTU change held back because propagation is disabled.
    pub fn pending_mtu(&self) -> Option<u32> {
        lock(&self.inner.shared).pending_mtu
    }

    /// Tear down. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
    }

    /// Release whatever is running. Each resource is taken exactly once.
    fn teardown(&self) {
        // No new connectivity events, then unblock any guest round trip.
        drop(lock(&self.subscription).take());
        self.inner.channel.stop();
        lock(&self.inner.shared).state = EngineState::Stopped;

        if let Some(mut server) = lock(&self.port_tracker).take() {
            server.stop();
        }
        if let Some(events) = lock(&self.events).take() {
            let _ = events.send(WorkerEvent::Shutdown);
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                error!("connectivity worker panicked");
            }
        }
        info!("guest networking stopped");
    }
}

impl Drop for NetworkEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn send_primary_configuration(&self, adapter_id: Uuid, settings: &NetworkSettings) -> Result<()> {
        self.send_endpoint(adapter_id, settings)?;
        if let Some(gateway) = settings.best_gateway() {
            self.send_default_route(adapter_id, ModifyRequestType::Add, gateway)?;
        }
        if !settings.dns_servers.is_empty() {
            self.send_dns(adapter_id, settings)?;
        }
        Ok(())
    }

    fn send_endpoint(&self, adapter_id: Uuid, settings: &NetworkSettings) -> Result<()> {
        let endpoint = Endpoint {
            id: adapter_id,
            ip_address: settings
                .preferred_ip
                .map(|ip| ip.address.to_string())
                .unwrap_or_default(),
            prefix_length: settings.preferred_ip.map(|ip| ip.prefix_length).unwrap_or_default(),
            ..Default::default()
        };
        self.channel.send_endpoint_state(&endpoint)
    }

    fn send_default_route(&self, adapter_id: Uuid, request_type: ModifyRequestType, gateway: IpAddr) -> Result<()> {
        let request = ModifyGuestEndpointSettingRequest::new(
            request_type,
            GuestEndpointResourceType::Route,
            Route {
                next_hop: gateway.to_string(),
                destination_prefix: DEFAULT_ROUTE_PREFIX.into(),
                family: AF_INET,
                ..Default::default()
            },
        );
        self.channel.send_endpoint_notification(adapter_id, &request)
    }

    fn send_dns(&self, adapter_id: Uuid, settings: &NetworkSettings) -> Result<()> {
        let request = ModifyGuestEndpointSettingRequest::new(
            ModifyRequestType::Update,
            GuestEndpointResourceType::Dns,
            Dns {
                server_list: settings.dns_server_list(),
                options: self.config.dns_options.clone(),
                ..Default::default()
            },
        );
        self.channel.send_endpoint_notification(adapter_id, &request)
    }

    fn refresh_guest_connection(&self, hint: ConnectivityHint) -> Result<()> {
        // Query the host before taking the lock.
        let mtu = minimum_connected_mtu(&self.host.ip_interfaces()?);
        let settings = if self.config.refresh_settings {
            Some(self.host.endpoint_settings()?)
        } else {
            None
        };

        let mut shared = lock(&self.shared);
        if shared.state == EngineState::Stopped {
            return Ok(());
        }
        if let Some(settings) = settings {
            self.refresh_settings(&mut shared, settings)?;
        }
        if let Some(mtu) = mtu {
            self.refresh_mtu(&mut shared, hint, mtu)?;
        }
        Ok(())
    }

    /// Re-send the parts of the primary configuration that changed.
    fn refresh_settings(&self, shared: &mut Shared, settings: NetworkSettings) -> Result<()> {
        let (Some(adapter_id), Some(previous)) = (shared.adapter_id, shared.settings.as_ref()) else {
            return Ok(());
        };
        if *previous == settings {
            return Ok(());
        }
        info!(?settings, "host network settings changed");

        if previous.device_options() != settings.device_options() {
            // Device options only take effect when the adapter is added.
            debug!(options = %settings.device_options(), "guest device options are stale");
        }
        if previous.preferred_ip != settings.preferred_ip {
            self.send_endpoint(adapter_id, &settings)?;
        }
        let (old_gateway, new_gateway) = (previous.best_gateway(), settings.best_gateway());
        if old_gateway != new_gateway {
            if let Some(gateway) = old_gateway {
                self.send_default_route(adapter_id, ModifyRequestType::Remove, gateway)?;
            }
            if let Some(gateway) = new_gateway {
                self.send_default_route(adapter_id, ModifyRequestType::Add, gateway)?;
            }
        }
        if previous.dns_servers != settings.dns_servers {
            self.send_dns(adapter_id, &settings)?;
        }

        shared.settings = Some(settings);
        Ok(())
    }

    fn refresh_mtu(&self, shared: &mut Shared, hint: ConnectivityHint, mtu: u32) -> Result<()> {
        if shared.mtu == Some(mtu) {
            return Ok(());
        }

        info!(?hint, mtu, previous = ?shared.mtu, "host MTU changed");
        shared.mtu = Some(mtu);

        let adapter_id = match shared.adapter_id {
            Some(adapter_id) if self.config.propagate_mtu => adapter_id,
            _ => {
                debug!(mtu, "MTU change not sent to guest");
                shared.pending_mtu = Some(mtu);
                return Ok(());
            }
        };

        let request = ModifyGuestEndpointSettingRequest::new(
            ModifyRequestType::Update,
            GuestEndpointResourceType::Interface,
            NetworkInterface {
                connected: true,
                nl_mtu: mtu,
                metric: 0,
            },
        );
        self.channel.send_endpoint_notification(adapter_id, &request)?;
        shared.pending_mtu = None;
        Ok(())
    }

    fn find_interface_id(&self, address: IpAddr, hint: ConnectivityHint) -> Result<Option<u64>> {
        let deadline = Instant::now() + self.config.resolve_timeout;

        // The address shows up in the table before its interface reports
        // connected; wait for both.
        let interface_id = loop {
            let found = self
                .host
                .unicast_addresses()?
                .into_iter()
                .find(|entry| entry.address == address);
            if let Some(entry) = found {
                break entry.interface_id;
            }
            if !self.wait_for_retry(address, hint, deadline)? {
                debug!(%address, "address not found on host");
                return Ok(None);
            }
        };

        loop {
            let connected = self.host.ip_interfaces()?.iter().any(|interface| {
                interface.interface_id == interface_id
                    && interface.family == AddressFamily::Ipv4
                    && interface.connected
            });
            if connected {
                debug!(%address, interface_id, "resolved guest interface");
                return Ok(Some(interface_id));
            }
            if !self.wait_for_retry(address, hint, deadline)? {
                debug!(%address, interface_id, "host interface never connected");
                return Ok(None);
            }
        }
    }

    /// Sleep one poll interval. `false` once the deadline passed or the
    /// engine is stopping.
    fn wait_for_retry(&self, address: IpAddr, hint: ConnectivityHint, deadline: Instant) -> Result<bool> {
        if Instant::now() >= deadline || self.channel.is_stopped() {
            return Ok(false);
        }
        thread::sleep(self.config.resolve_poll_interval);
        if self.host.connectivity_hint()? != hint {
            return Err(Error::RetryableConnectivityChanged { address });
        }
        Ok(true)
    }

    fn resolve_guest_interface(&self, hint: ConnectivityHint) -> Result<Option<u64>> {
        let address = lock(&self.shared)
            .settings
            .as_ref()
            .and_then(|settings| settings.preferred_ip)
            .map(|ip| ip.address);
        let Some(address) = address else {
            return Ok(None);
        };

        let interface_id = self.find_interface_id(address, hint)?;
        lock(&self.shared).interface_id = interface_id;
        Ok(interface_id)
    }

    fn on_connectivity_change(&self, hint: ConnectivityHint) {
        if self.channel.is_stopped() {
            return;
        }
        if let Err(e) = self.refresh_guest_connection(hint) {
            warn!(error = %e, "failed to refresh guest connection");
        }
        if !self.config.track_guest_interface {
            return;
        }
        match self.resolve_guest_interface(hint) {
            Ok(_) => {}
            Err(e) if e.is_retryable() => debug!(error = %e, "interface resolution restarts on next change"),
            Err(e) => warn!(error = %e, "failed to resolve guest interface"),
        }
    }
}

/// Attach one virtio-net device. A nil adapter id means the attach failed.
fn add_device(add_guest_device: &AddGuestDeviceFn, tag: &str, options: &str) -> Result<Uuid> {
    let adapter_id = add_guest_device(&VIRTIO_NET_CLASS_ID, &VIRTIO_NET_DEVICE_ID, tag, options)?;
    if adapter_id.is_nil() {
        return Err(Error::device(format!("attaching {} returned a nil adapter id", tag)));
    }
    Ok(adapter_id)
}

fn run_worker(inner: Arc<Inner>, mut events: UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.blocking_recv() {
        match event {
            WorkerEvent::Connectivity(hint) => inner.on_connectivity_change(hint),
            WorkerEvent::Shutdown => break,
        }
    }
    debug!("connectivity worker exiting");
}

fn handle_port_request(modify_open_ports: &ModifyOpenPortsFn, relay_enabled: bool, request: PortAllocationRequest) -> i32 {
    let protocol = Protocol::from(request.protocol);
    if let Protocol::Other(value) = protocol {
        warn!(protocol = value, address = %request.address, "unsupported bind protocol");
        return 0;
    }

    let actions = forwarding::plan(request.address, protocol, request.allocate, relay_enabled);
    forwarding::apply(&actions, |action| {
        modify_open_ports(
            &VIRTIO_NET_CLASS_ID,
            action.target.tag(),
            action.address,
            action.protocol,
            action.allocate,
        )
    })
}
