//! JSON documents carried in message payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Address and identity of one guest adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
    #[serde(rename = "GatewayAddress")]
    pub gateway_address: String,
    #[serde(rename = "PortFriendlyName")]
    pub port_friendly_name: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: Uuid,
    #[serde(rename = "PrefixLength")]
    pub prefix_length: u8,
    #[serde(rename = "DNSServerList")]
    pub dns_server_list: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Route {
    pub next_hop: String,
    pub destination_prefix: String,
    pub site_prefix_length: u8,
    pub metric: u32,
    pub family: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Dns {
    pub domain: String,
    pub search: String,
    pub server_list: String,
    pub options: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct NetworkInterface {
    pub connected: bool,
    pub nl_mtu: u32,
    pub metric: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyRequestType {
    #[default]
    Add,
    Remove,
    Update,
    Refresh,
    Reset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestEndpointResourceType {
    #[default]
    Interface,
    Route,
    #[serde(rename = "IPAddress")]
    IpAddress,
    #[serde(rename = "DNS")]
    Dns,
    MacAddress,
    Neighbor,
    Port,
}

/// Change to one setting of a guest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyGuestEndpointSettingRequest<T> {
    #[serde(rename = "ResourceType")]
    pub resource_type: GuestEndpointResourceType,
    #[serde(rename = "RequestType")]
    pub request_type: ModifyRequestType,
    #[serde(rename = "Settings")]
    pub settings: T,
    #[serde(rename = "targetDeviceName", default, skip_serializing_if = "Option::is_none")]
    pub target_device_name: Option<String>,
}

impl<T> ModifyGuestEndpointSettingRequest<T> {
    pub fn new(request_type: ModifyRequestType, resource_type: GuestEndpointResourceType, settings: T) -> Self {
        Self {
            resource_type,
            request_type,
            settings,
            target_device_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Bond,
    Loopback,
    VirtualWifi,
    VirtualTunnel,
    VirtualCellular,
}

/// Ask the guest to create a network device on top of an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceRequest {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_edge_adapter_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_edge_device_name: Option<String>,
}
