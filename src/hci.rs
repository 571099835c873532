//! The opaque HCI command interface consumed by the advertising manager,
//! and the controller events it delivers back.
//!
//! Commands map one-to-one onto the Core 5.4 LE extended advertising,
//! periodic advertising, and BIG command set. Each call resolves with the
//! command's completion status; the three events that arrive outside a
//! command context are folded into one [`AdvertisingEvent`] sum type.

use async_trait::async_trait;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::address::RawAddress;

/// Status code on the HCI error plane, augmented with host-defined
/// advertising codes. Both live on the same u8 plane, as on the wire, and
/// controller statuses pass through the manager verbatim.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AdvStatus(pub u8);

impl AdvStatus {
    pub const SUCCESS: AdvStatus = AdvStatus(0x00);
    /// HCI Unknown HCI Command; also the BIG path's rejection code for
    /// unsupported or malformed requests.
    pub const ILLEGAL_COMMAND: AdvStatus = AdvStatus(0x01);
    /// No free advertising instance slot.
    pub const TOO_MANY_ADVERTISERS: AdvStatus = AdvStatus(0x02);
    /// Encrypted advertising data requested while the feature is disabled.
    pub const FEATURE_UNSUPPORTED: AdvStatus = AdvStatus(0x05);
    /// Invalid instance id, or instance not in use.
    pub const MULTI_ADV_FAILURE: AdvStatus = AdvStatus(0x09);
    /// Connection Terminated By Local Host.
    pub const CONN_CAUSE_LOCAL_HOST: AdvStatus = AdvStatus(0x16);
    /// Duration elapsed on an enabled set.
    pub const ADVERTISING_TIMEOUT: AdvStatus = AdvStatus(0x3c);
    /// Extended advertising event budget exhausted.
    pub const LIMIT_REACHED: AdvStatus = AdvStatus(0x43);

    pub fn is_success(self) -> bool {
        self == AdvStatus::SUCCESS
    }
}

impl std::fmt::Display for AdvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Extended advertising data operation: position of a fragment within the
/// full payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum AdvDataOp {
    Intermediate = 0x00,
    First = 0x01,
    Last = 0x02,
    Complete = 0x03,
}

/// Fragment Preference: the controller should not fragment further on air.
pub const FRAGMENT_PREFERENCE: u8 = 0x01;

/// Advertising PHY selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum LePhy {
    Invalid = 0,
    #[default]
    Phy1m = 1,
    Phy2m = 2,
    PhyCoded = 3,
}

/// Own address type for an advertising set.
///
/// The wire values 0x00-0x03 are the Core ones; `Default` and `Anonymous`
/// are resolved by the manager against the local privacy setting before
/// anything reaches the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum OwnAddressType {
    Public = 0x00,
    Random = 0x01,
    PublicId = 0x02,
    RandomId = 0x03,
    /// Defer to the local privacy setting.
    #[default]
    Default = 0xfe,
    /// Advertise without an address (anonymous extended advertising).
    Anonymous = 0xff,
}

/// Client-facing advertising parameters for one set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdvertiseParameters {
    /// 16-bit advertising event properties bitfield (bit 0 = connectable,
    /// bits 2-3 = directed, bit 4 = legacy, bit 5 = anonymous).
    pub advertising_event_properties: u16,
    /// Minimum advertising interval, in 0.625 ms units.
    pub adv_int_min: u32,
    /// Maximum advertising interval, in 0.625 ms units.
    pub adv_int_max: u32,
    pub channel_map: u8,
    pub adv_filter_policy: u8,
    /// Requested TX power, dBm. The controller reports the selected value
    /// back on completion.
    pub tx_power: i8,
    pub primary_advertising_phy: LePhy,
    pub secondary_advertising_phy: LePhy,
    pub scan_request_notification_enable: u8,
    pub own_address_type: OwnAddressType,
}

impl Default for AdvertiseParameters {
    fn default() -> Self {
        AdvertiseParameters {
            advertising_event_properties: 0,
            adv_int_min: 160,
            adv_int_max: 210,
            channel_map: 0x07,
            adv_filter_policy: 0x00,
            tx_power: 0,
            primary_advertising_phy: LePhy::Phy1m,
            secondary_advertising_phy: LePhy::Phy1m,
            scan_request_notification_enable: 0,
            own_address_type: OwnAddressType::Default,
        }
    }
}

/// Parameters of the periodic advertising train attached to a set.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeriodicAdvertisingParameters {
    pub enable: bool,
    pub include_adi: bool,
    /// Periodic advertising interval, in 1.25 ms units.
    pub min_interval: u16,
    pub max_interval: u16,
    pub periodic_advertising_properties: u16,
}

/// Parameters for LE Create BIG.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CreateBigParams {
    pub num_bis: u8,
    pub sdu_interval: u32,
    pub max_sdu: u16,
    pub max_transport_latency: u16,
    pub rtn: u8,
    pub phy: u8,
    pub packing: u8,
    pub framing: u8,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
}

impl Default for CreateBigParams {
    fn default() -> Self {
        CreateBigParams {
            num_bis: 1,
            sdu_interval: 10_000,
            max_sdu: 100,
            max_transport_latency: 10,
            rtn: 2,
            phy: 0x02,
            packing: 0,
            framing: 0,
            encryption: false,
            broadcast_code: [0; 16],
        }
    }
}

/// Fully resolved parameters handed to LE Set Extended Advertising
/// Parameters, after the manager has applied interval clamping, SID
/// assignment, and address selection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExtendedAdvertisingParams {
    pub advertising_event_properties: u16,
    pub primary_advertising_interval_min: u32,
    pub primary_advertising_interval_max: u32,
    pub primary_advertising_channel_map: u8,
    pub own_address_type: OwnAddressType,
    pub own_address: RawAddress,
    pub peer_address_type: u8,
    pub peer_address: RawAddress,
    pub advertising_filter_policy: u8,
    pub advertising_tx_power: i8,
    pub primary_advertising_phy: u8,
    pub secondary_advertising_max_skip: u8,
    pub secondary_advertising_phy: u8,
    pub advertising_sid: u8,
    pub scan_request_notification_enable: u8,
}

/// One entry of a (possibly batched) LE Set Extended Advertising Enable.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetEnableData {
    pub handle: u8,
    /// 10 ms units; 0 means no limit.
    pub duration: u16,
    /// 0 means no limit.
    pub max_extended_advertising_events: u8,
}

/// Controller events relevant to advertising, delivered to
/// [`crate::advertise_manager::AdvertiseManager::on_advertising_event`].
#[derive(Clone, Debug)]
pub enum AdvertisingEvent {
    /// LE Advertising Set Terminated.
    SetTerminated {
        status: AdvStatus,
        advertising_handle: u8,
        connection_handle: u16,
        num_completed_extended_adv_events: u8,
    },
    /// LE Create BIG Complete.
    CreateBigComplete {
        status: AdvStatus,
        big_handle: u8,
        big_sync_delay: u32,
        transport_latency_big: u32,
        phy: u8,
        nse: u8,
        bn: u8,
        pto: u8,
        irc: u8,
        max_pdu: u16,
        iso_interval: u16,
        num_bis: u8,
        conn_handle_list: Vec<u16>,
    },
    /// LE Terminate BIG Complete.
    TerminateBigComplete { status: AdvStatus, big_handle: u8, reason: u8 },
}

/// Opaque HCI command sink for the advertising manager.
///
/// Every command is asynchronous: the future resolves when the controller
/// reports the command's completion status. The transport below is free to
/// interleave commands from different advertising handles; the manager
/// only relies on per-call completion.
#[async_trait]
pub trait BleAdvertiserHciInterface: Send + Sync {
    /// Number of advertising set slots supported by the controller.
    async fn read_instance_count(&self) -> u8;

    /// Whether the controller supports the ISO broadcaster role.
    fn supports_iso_broadcaster(&self) -> bool;

    /// Whether the controller accepts the ADI field in periodic enable.
    fn supports_periodic_advertising_adi(&self) -> bool;

    /// Some controllers cannot use advertising handle 0.
    fn quirk_advertiser_zero_handle(&self) -> bool {
        false
    }

    /// LE Set Extended Advertising Parameters. Returns the completion
    /// status and the TX power selected by the controller.
    async fn set_parameters(&self, handle: u8, params: ExtendedAdvertisingParams)
        -> (AdvStatus, i8);

    /// LE Set Advertising Set Random Address.
    async fn set_random_address(&self, handle: u8, address: RawAddress) -> AdvStatus;

    /// LE Set Extended Advertising Data (one fragment).
    async fn set_advertising_data(
        &self,
        handle: u8,
        operation: AdvDataOp,
        fragment_preference: u8,
        data: &[u8],
    ) -> AdvStatus;

    /// LE Set Extended Scan Response Data (one fragment).
    async fn set_scan_response_data(
        &self,
        handle: u8,
        operation: AdvDataOp,
        fragment_preference: u8,
        data: &[u8],
    ) -> AdvStatus;

    /// LE Set Extended Advertising Enable over the given set entries.
    async fn enable(&self, enable: bool, sets: Vec<SetEnableData>) -> AdvStatus;

    /// LE Set Periodic Advertising Parameters.
    async fn set_periodic_advertising_parameters(
        &self,
        handle: u8,
        min_interval: u16,
        max_interval: u16,
        properties: u16,
    ) -> AdvStatus;

    /// LE Set Periodic Advertising Data (one fragment).
    async fn set_periodic_advertising_data(
        &self,
        handle: u8,
        operation: AdvDataOp,
        data: &[u8],
    ) -> AdvStatus;

    /// LE Set Periodic Advertising Enable. Bit 0 of `enable` enables the
    /// train, bit 1 requests ADI inclusion.
    async fn set_periodic_advertising_enable(&self, enable: u8, handle: u8) -> AdvStatus;

    /// LE Remove Advertising Set.
    async fn remove_advertising_set(&self, handle: u8) -> AdvStatus;

    /// LE Create BIG. Completion arrives later as
    /// [`AdvertisingEvent::CreateBigComplete`].
    async fn create_big(
        &self,
        big_handle: u8,
        advertising_handle: u8,
        params: CreateBigParams,
    ) -> AdvStatus;

    /// LE Terminate BIG. Completion arrives later as
    /// [`AdvertisingEvent::TerminateBigComplete`].
    async fn terminate_big(&self, big_handle: u8, reason: u8) -> AdvStatus;

    /// LE Rand: eight bytes from the controller RNG.
    async fn le_rand(&self) -> [u8; 8];
}
