//! BLE multi-advertising manager: advertising set lifecycle, command
//! pipelines, RPA rotation, and broadcast isochronous groups.
//!
//! All state lives in a fixed-capacity instance table sized from the
//! controller's reported slot count. Client calls spawn per-instance
//! command pipelines on the executor; each pipeline step holds only a weak
//! handle to the manager and re-checks it after every suspension, so a
//! torn-down manager makes in-flight pipelines abort without side effects.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use num_traits::clamp;
use tokio::time::Instant;

use crate::address::{RawAddress, RpaGenerator};
use crate::alarm::Alarm;
use crate::enc_adv_data::{self, EncKeyMaterial, RANDOMIZER_LEN};
use crate::fragment::{fragments, EXT_ADV_DATA_LEN_MAX, PERIODIC_ADV_DATA_LEN_MAX};
use crate::hci::{
    AdvStatus, AdvertiseParameters, AdvertisingEvent, BleAdvertiserHciInterface, CreateBigParams,
    ExtendedAdvertisingParams, OwnAddressType, PeriodicAdvertisingParameters, SetEnableData,
    FRAGMENT_PREFERENCE,
};

// Advertising data types the manager patches or prepends.
const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_TX_POWER_LEVEL: u8 = 0x0a;

// Flags AD values.
const FLAG_NON_DISCOVERABLE: u8 = 0x00;
const FLAG_LIMITED_DISCOVERABLE: u8 = 0x01;
const FLAG_GENERAL_DISCOVERABLE: u8 = 0x02;

// Service-data prefix of a Broadcast Audio Announcement (UUID 0x1851).
// Sets carrying it rotate their RPA at a reduced rate.
const BROADCAST_AUDIO_ANNOUNCEMENT_PREFIX: [u8; 4] = [0x03, 0x16, 0x51, 0x18];

// Rotations skipped between RPA updates on broadcast sets.
const BROADCAST_RPA_SKIP_COUNT: u8 = 15;

// Bits 2-3 of the advertising event properties select directed advertising.
const DIRECTED_BITS: u16 = 0x0c;

// Advertising interval limits, in 0.625 ms units.
const INTERVAL_MIN: u32 = 160; // 100 ms
const INTERVAL_MAX: u32 = 0x00ff_ffff;

const INVALID_BIG_HANDLE: u8 = 0xff;
const INVALID_INST_ID: u8 = 0xff;

pub type RegisterCb = Box<dyn FnOnce(u8, AdvStatus) + Send>;
pub type MultiAdvCb = Box<dyn FnOnce(AdvStatus) + Send>;
pub type ParametersCb = Box<dyn FnOnce(AdvStatus, i8) + Send>;
pub type GetAddressCb = Box<dyn FnOnce(OwnAddressType, RawAddress) + Send>;
pub type IdTxPowerStatusCb = Box<dyn FnOnce(u8, i8, AdvStatus) + Send>;
/// Duration/event-budget expiry callback kept on an instance. May fire more
/// than once over the instance's lifetime (each re-enable re-arms it).
pub type TimeoutCb = Arc<dyn Fn(AdvStatus) + Send + Sync>;
/// Expiry callback passed to `start_advertising_set`, keyed by instance id.
pub type RegisterTimeoutCb = Box<dyn Fn(u8, AdvStatus) + Send + Sync>;
pub type CreateBigCb = Box<dyn FnOnce(u8, AdvStatus, BigCreateReport) + Send>;
/// `(command status, advertising instance, big handle, reason)`. The status
/// is the controller's completion result; the reason is the one the host
/// supplied on terminate. The two may differ.
pub type TerminateBigCb = Box<dyn FnOnce(AdvStatus, u8, u8, u8) + Send>;

/// Parameters delivered by LE Create BIG Complete.
#[derive(Clone, Debug, Default)]
pub struct BigCreateReport {
    pub big_handle: u8,
    pub big_sync_delay: u32,
    pub transport_latency_big: u32,
    pub phy: u8,
    pub nse: u8,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u16,
    pub iso_interval: u16,
    pub num_bis: u8,
    pub conn_handle_list: Vec<u16>,
}

fn failed_big_report() -> BigCreateReport {
    BigCreateReport { big_handle: INVALID_BIG_HANDLE, ..Default::default() }
}

/// Progress of an instance through its configuration pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InstanceState {
    #[default]
    Idle,
    Registered,
    ParamsSet,
    AddrSet,
    DataPending,
    PeriodicPending,
    Enabled,
    Disabling,
}

fn is_connectable(advertising_event_properties: u16) -> bool {
    advertising_event_properties & 0x01 != 0
}

/// One controller advertising slot.
struct AdvertisingInstance {
    inst_id: u8,
    in_use: bool,
    state: InstanceState,
    advertising_event_properties: u16,
    adv_raddr_timer: Alarm,
    tx_power: i8,
    /// 10 ms units; 0 means no limit.
    duration: u16,
    max_ext_adv_events: u8,
    timeout_timer: Alarm,
    own_address_type: OwnAddressType,
    own_address: RawAddress,
    timeout_cb: Option<TimeoutCb>,
    /// Deferred RPA rotation: perform on the next enable.
    address_update_required: bool,
    periodic_enabled: bool,
    /// 0.625 ms units.
    advertising_interval: u32,
    skip_rpa_count: u8,
    skip_rpa: bool,
    randomizer: [u8; RANDOMIZER_LEN],
    advertise_data: Vec<u8>,
    scan_response_data: Vec<u8>,
    periodic_data: Vec<u8>,
    advertise_data_enc: Vec<u8>,
    scan_response_data_enc: Vec<u8>,
    periodic_adv_data_enc: Vec<u8>,
    enc_key_value: Vec<u8>,
    /// Last-scheduled enable intent. True from the moment an enable is
    /// issued, not from its completion; commands scheduled while true run
    /// against an enabled set unless the enable fails.
    enable_status: bool,
    enable_time: Instant,
    big_handle: u8,
}

impl AdvertisingInstance {
    fn new(inst_id: u8) -> Self {
        AdvertisingInstance {
            inst_id,
            in_use: false,
            state: InstanceState::Idle,
            advertising_event_properties: 0,
            adv_raddr_timer: Alarm::new(),
            tx_power: 0,
            duration: 0,
            max_ext_adv_events: 0,
            timeout_timer: Alarm::new(),
            own_address_type: OwnAddressType::Public,
            own_address: RawAddress::EMPTY,
            timeout_cb: None,
            address_update_required: false,
            periodic_enabled: false,
            advertising_interval: 0,
            skip_rpa_count: 0,
            skip_rpa: false,
            randomizer: [0; RANDOMIZER_LEN],
            advertise_data: Vec::new(),
            scan_response_data: Vec::new(),
            periodic_data: Vec::new(),
            advertise_data_enc: Vec::new(),
            scan_response_data_enc: Vec::new(),
            periodic_adv_data_enc: Vec::new(),
            enc_key_value: Vec::new(),
            enable_status: false,
            enable_time: Instant::now(),
            big_handle: INVALID_BIG_HANDLE,
        }
    }

    fn is_enabled(&self) -> bool {
        self.enable_status
    }

    fn is_connectable(&self) -> bool {
        is_connectable(self.advertising_event_properties)
    }

    fn has_encrypted_data(&self) -> bool {
        !self.advertise_data_enc.is_empty()
            || !self.scan_response_data_enc.is_empty()
            || !self.periodic_adv_data_enc.is_empty()
    }
}

/// One broadcast isochronous group slot, bound to an advertising instance.
struct IsoBigInstance {
    big_handle: u8,
    in_use: bool,
    bis_handles: Vec<u16>,
    adv_inst_id: u8,
    created_status: bool,
    create_big_cb: Option<CreateBigCb>,
    terminate_big_cb: Option<TerminateBigCb>,
    /// Reason the host supplied on terminate, echoed in the callback.
    terminate_reason: u8,
}

impl IsoBigInstance {
    fn new(big_handle: u8) -> Self {
        IsoBigInstance {
            big_handle,
            in_use: false,
            bis_handles: Vec::new(),
            adv_inst_id: INVALID_INST_ID,
            created_status: false,
            create_big_cb: None,
            terminate_big_cb: None,
            terminate_reason: 0,
        }
    }
}

/// Recomputes the remaining duration and event budget of an enabled
/// instance as of `now`. When either budget is exhausted (within one tick)
/// the enable intent is cleared and the instance's timeout callback is
/// returned, to be invoked by the caller outside any lock.
fn recompute_timeout(inst: &mut AdvertisingInstance, now: Instant) -> Option<TimeoutCb> {
    let elapsed_ms = now.saturating_duration_since(inst.enable_time).as_millis() as u64;
    if inst.duration != 0 {
        let done = elapsed_ms / 10;
        if done + 1 >= u64::from(inst.duration) {
            inst.enable_status = false;
            return inst.timeout_cb.clone();
        }
        inst.duration -= done as u16;
    }
    if inst.max_ext_adv_events != 0 {
        let event_ms = u64::from(inst.advertising_interval) * 5 / 8;
        if event_ms > 0 {
            let done = elapsed_ms / event_ms;
            if done + 1 >= u64::from(inst.max_ext_adv_events) {
                inst.enable_status = false;
                return inst.timeout_cb.clone();
            }
            inst.max_ext_adv_events -= done as u8;
        }
    }
    None
}

/// Rewrites the payload byte of every TX Power Level structure in `data`.
/// Walks length-prefixed structures so an 0x0a inside another structure is
/// never touched.
fn patch_tx_power(data: &mut [u8], tx_power: i8) {
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i + 1] == AD_TYPE_TX_POWER_LEVEL {
            data[i + 2] = tx_power as u8;
        }
        i += data[i] as usize + 1;
    }
}

fn effective_own_address_type(
    local_privacy_enabled: bool,
    requested: OwnAddressType,
) -> OwnAddressType {
    match requested {
        // Anonymous and Default defer to the local privacy setting.
        OwnAddressType::Anonymous | OwnAddressType::Default => {
            if local_privacy_enabled {
                OwnAddressType::Random
            } else {
                OwnAddressType::Public
            }
        }
        other => other,
    }
}

fn try_upgrade(weak: &Weak<AdvertiseManager>) -> Option<Arc<AdvertiseManager>> {
    let manager = weak.upgrade();
    if manager.is_none() {
        info!("stack was shut down");
    }
    manager
}

/// Stack-level configuration and feature gates.
#[derive(Clone)]
pub struct AdvertiseManagerConfig {
    /// Whether Encrypted Advertising Data may be used at all.
    pub enc_adv_data_enabled: bool,
    /// Hex-dump encryption inputs and outputs to the debug log.
    pub enc_adv_data_log_enabled: bool,
    /// The controller generates and rotates RPAs itself.
    pub rpa_gen_offload_enabled: bool,
    /// Advertise from a resolvable private address unless a caller
    /// explicitly overrides the address type.
    pub local_privacy_enabled: bool,
    /// PTS mode: force flags into non-connectable advertising data.
    pub pts_le_nonconn_adv_enabled: bool,
    /// PTS mode: connectable but non-discoverable advertising.
    pub pts_le_conn_nondisc_adv_enabled: bool,
    /// The controller's public address, used by public-address sets.
    pub public_address: RawAddress,
    /// Interval between RPA rotations, in milliseconds.
    pub rpa_rotation_interval_ms: u64,
    /// GAP Encrypted Data Key Material, used when a caller provides no key
    /// value of its own.
    pub gap_enc_key_material: EncKeyMaterial,
    /// Receives `(connection handle, own address)` when a connectable set
    /// hands off a connection while local privacy is active.
    pub conn_addr_update_cb: Option<Arc<dyn Fn(u16, RawAddress) + Send + Sync>>,
}

impl Default for AdvertiseManagerConfig {
    fn default() -> Self {
        AdvertiseManagerConfig {
            enc_adv_data_enabled: false,
            enc_adv_data_log_enabled: false,
            rpa_gen_offload_enabled: false,
            local_privacy_enabled: false,
            pts_le_nonconn_adv_enabled: false,
            pts_le_conn_nondisc_adv_enabled: false,
            public_address: RawAddress::EMPTY,
            rpa_rotation_interval_ms: 900_000,
            gap_enc_key_material: EncKeyMaterial::default(),
            conn_addr_update_cb: None,
        }
    }
}

#[derive(Default)]
struct AdvState {
    adv_inst: Vec<AdvertisingInstance>,
    iso_big_inst: Vec<IsoBigInstance>,
    inst_count: u8,
    rpa_gen_offload_enabled: bool,
}

/// Payload snapshot taken before an RPA rotation so encrypted payloads can
/// be rebuilt against the new address.
struct RefreshSnapshot {
    adv: (Vec<u8>, Vec<u8>),
    scan: (Vec<u8>, Vec<u8>),
    periodic: Option<(Vec<u8>, Vec<u8>)>,
}

/// The creator-parameters bundle moved through the start pipeline.
struct CreatorParams {
    params: AdvertiseParameters,
    own_address_type: OwnAddressType,
    advertise_data: Vec<u8>,
    advertise_data_enc: Vec<u8>,
    scan_response_data: Vec<u8>,
    scan_response_data_enc: Vec<u8>,
    periodic_params: PeriodicAdvertisingParameters,
    periodic_data: Vec<u8>,
    periodic_adv_data_enc: Vec<u8>,
    duration: u16,
    max_ext_adv_events: u8,
    enc_key_value: Vec<u8>,
    cb: IdTxPowerStatusCb,
    timeout_cb: RegisterTimeoutCb,
}

/// Coordinates every advertising set the controller can run.
pub struct AdvertiseManager {
    hci: Arc<dyn BleAdvertiserHciInterface>,
    rpa_generator: Arc<dyn RpaGenerator>,
    config: AdvertiseManagerConfig,
    state: Mutex<AdvState>,
    weak_self: Weak<AdvertiseManager>,
}

impl AdvertiseManager {
    /// Creates a manager and sizes its instance tables from the
    /// controller's reported slot count.
    pub async fn new(
        hci: Arc<dyn BleAdvertiserHciInterface>,
        rpa_generator: Arc<dyn RpaGenerator>,
        config: AdvertiseManagerConfig,
    ) -> Arc<AdvertiseManager> {
        let inst_count = hci.read_instance_count().await;
        debug!("controller supports {} advertising instances", inst_count);
        let rpa_gen_offload_enabled = config.rpa_gen_offload_enabled;
        let manager = Arc::new_cyclic(|weak_self| AdvertiseManager {
            hci,
            rpa_generator,
            config,
            state: Mutex::new(AdvState {
                adv_inst: (0..inst_count).map(AdvertisingInstance::new).collect(),
                iso_big_inst: (0..inst_count).map(IsoBigInstance::new).collect(),
                inst_count,
                rpa_gen_offload_enabled,
            }),
            weak_self: weak_self.clone(),
        });
        if manager.hci.quirk_advertiser_zero_handle() {
            // Handle 0 is unusable on this controller: burn a registration
            // on it so clients never receive it.
            manager.register_advertiser(Box::new(|_, _| {}));
        }
        manager
    }

    /// Number of advertising instances the controller supports.
    pub fn get_max_adv_instances(&self) -> u8 {
        self.state.lock().unwrap().inst_count
    }

    pub fn update_rpa_gen_offload_status(&self, enable: bool) {
        self.state.lock().unwrap().rpa_gen_offload_enabled = enable;
    }

    pub fn is_rpa_gen_offload_enabled(&self) -> bool {
        self.state.lock().unwrap().rpa_gen_offload_enabled
    }

    /// Pipeline progress of an instance, for observability.
    pub fn instance_state(&self, inst_id: u8) -> Option<InstanceState> {
        self.state.lock().unwrap().adv_inst.get(inst_id as usize).map(|inst| inst.state)
    }

    /// Reports the address type and current own address of an instance.
    pub fn get_own_address(&self, inst_id: u8, cb: GetAddressCb) {
        let result = {
            let state = self.state.lock().unwrap();
            if inst_id >= state.inst_count {
                error!("bad instance id {}", inst_id);
                return;
            }
            let inst = &state.adv_inst[inst_id as usize];
            (inst.own_address_type, inst.own_address)
        };
        cb(result.0, result.1);
    }

    /// Allocates a free advertising instance. Completion is asynchronous
    /// because address generation is.
    pub fn register_advertiser(&self, cb: RegisterCb) {
        let own_address_type = if self.config.local_privacy_enabled {
            OwnAddressType::Random
        } else {
            OwnAddressType::Public
        };
        self.register_advertiser_impl(own_address_type, cb);
    }

    fn register_advertiser_impl(&self, own_address_type: OwnAddressType, cb: RegisterCb) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            match Self::register_instance_task(&weak, own_address_type).await {
                None => {}
                Some(Ok(inst_id)) => cb(inst_id, AdvStatus::SUCCESS),
                Some(Err(status)) => cb(INVALID_INST_ID, status),
            }
        });
    }

    /// Finds a free slot and prepares its own address. Returns `None` when
    /// the manager went away mid-flight.
    async fn register_instance_task(
        weak: &Weak<AdvertiseManager>,
        own_address_type: OwnAddressType,
    ) -> Option<Result<u8, AdvStatus>> {
        let (inst_id, needs_rpa) = {
            let manager = try_upgrade(weak)?;
            let public_address = manager.config.public_address;
            let mut state = manager.state.lock().unwrap();
            let offload = state.rpa_gen_offload_enabled;
            let Some(inst) = state.adv_inst.iter_mut().find(|inst| !inst.in_use) else {
                info!("no free advertiser instance");
                return Some(Err(AdvStatus::TOO_MANY_ADVERTISERS));
            };
            inst.in_use = true;
            inst.state = InstanceState::Registered;
            inst.own_address_type = own_address_type;
            if own_address_type == OwnAddressType::Public {
                inst.own_address = public_address;
                (inst.inst_id, false)
            } else {
                (inst.inst_id, !offload)
            }
        };

        if needs_rpa {
            let rpa_generator = Arc::clone(&try_upgrade(weak)?.rpa_generator);
            let rpa = rpa_generator.generate_rpa().await;
            let manager = try_upgrade(weak)?;
            {
                let mut state = manager.state.lock().unwrap();
                let inst = &mut state.adv_inst[inst_id as usize];
                if !inst.in_use {
                    error!("not active instance");
                    return None;
                }
                inst.own_address = rpa;
            }
            manager.arm_raddr_timer(inst_id);
        }
        Some(Ok(inst_id))
    }

    fn arm_raddr_timer(&self, inst_id: u8) {
        let period = Duration::from_millis(self.config.rpa_rotation_interval_ms);
        let weak = self.weak_self.clone();
        let mut state = self.state.lock().unwrap();
        state.adv_inst[inst_id as usize].adv_raddr_timer.schedule_periodic(period, move || {
            let weak = weak.clone();
            async move {
                let _ = AdvertiseManager::configure_rpa_task(weak, inst_id).await;
            }
        });
    }

    /// Releases an instance: terminates its bound BIG, disables the set and
    /// the periodic train if scheduled enabled, cancels both timers, and
    /// removes the set from the controller if it ever reached it.
    pub fn unregister(&self, inst_id: u8) {
        debug!("unregister(): inst_id {}", inst_id);
        let hci = Arc::clone(&self.hci);
        let mut state = self.state.lock().unwrap();
        if inst_id >= state.inst_count {
            error!("bad instance id {}", inst_id);
            return;
        }

        let mut big_to_terminate = None;
        if self.hci.supports_iso_broadcaster() {
            let bound = state.adv_inst[inst_id as usize].big_handle;
            if bound != INVALID_BIG_HANDLE {
                state.adv_inst[inst_id as usize].big_handle = INVALID_BIG_HANDLE;
                let big = &mut state.iso_big_inst[bound as usize];
                big.in_use = false;
                big.bis_handles.clear();
                big.created_status = false;
                big.big_handle = INVALID_BIG_HANDLE;
                big_to_terminate = Some(bound);
            }
        }

        let inst = &mut state.adv_inst[inst_id as usize];
        let was_enabled = inst.is_enabled();
        if was_enabled {
            inst.enable_status = false;
            inst.advertise_data.clear();
            inst.advertise_data_enc.clear();
            inst.scan_response_data.clear();
            inst.scan_response_data_enc.clear();
        }
        let was_periodic = inst.periodic_enabled;
        if was_periodic {
            inst.periodic_enabled = false;
            inst.periodic_data.clear();
            inst.periodic_adv_data_enc.clear();
        }
        inst.timeout_timer.cancel();
        inst.adv_raddr_timer.cancel();
        inst.in_use = false;
        inst.skip_rpa = false;
        inst.skip_rpa_count = 0;
        inst.address_update_required = false;
        inst.timeout_cb = None;
        inst.enc_key_value.clear();
        // A set that never made it past registration does not exist in the
        // controller, so there is nothing to remove there.
        let remove_set =
            inst.state != InstanceState::Registered && inst.state != InstanceState::Idle;
        inst.state = InstanceState::Idle;
        drop(state);

        tokio::spawn(async move {
            if let Some(big_handle) = big_to_terminate {
                let _ = hci.terminate_big(big_handle, AdvStatus::CONN_CAUSE_LOCAL_HOST.0).await;
            }
            if was_enabled {
                let _ = hci
                    .enable(false, vec![SetEnableData { handle: inst_id, ..Default::default() }])
                    .await;
            }
            if was_periodic {
                let _ = hci.set_periodic_advertising_enable(0, inst_id).await;
            }
            if remove_set {
                let _ = hci.remove_advertising_set(inst_id).await;
            }
        });
    }

    /// Creates a set, applies parameters, payloads, and the optional
    /// periodic train, then enables it. Any failing step unwinds through
    /// [`unregister`](Self::unregister) and reports its status.
    #[allow(clippy::too_many_arguments)]
    pub fn start_advertising_set(
        &self,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        advertise_data_enc: Vec<u8>,
        scan_response_data: Vec<u8>,
        scan_response_data_enc: Vec<u8>,
        periodic_params: PeriodicAdvertisingParameters,
        periodic_data: Vec<u8>,
        periodic_adv_data_enc: Vec<u8>,
        duration: u16,
        max_ext_adv_events: u8,
        enc_key_value: Vec<u8>,
        cb: IdTxPowerStatusCb,
        timeout_cb: RegisterTimeoutCb,
    ) {
        if (!advertise_data_enc.is_empty()
            || !scan_response_data_enc.is_empty()
            || !periodic_adv_data_enc.is_empty())
            && !self.config.enc_adv_data_enabled
        {
            error!("encrypted advertising data provided but the feature is disabled");
            cb(0, 0, AdvStatus::FEATURE_UNSUPPORTED);
            return;
        }

        let own_address_type =
            effective_own_address_type(self.config.local_privacy_enabled, params.own_address_type);
        let creator = CreatorParams {
            params,
            own_address_type,
            advertise_data,
            advertise_data_enc,
            scan_response_data,
            scan_response_data_enc,
            periodic_params,
            periodic_data,
            periodic_adv_data_enc,
            duration,
            max_ext_adv_events,
            enc_key_value,
            cb,
            timeout_cb,
        };
        let weak = self.weak_self.clone();
        tokio::spawn(Self::start_advertising_set_task(weak, creator));
    }

    async fn start_advertising_set_task(weak: Weak<AdvertiseManager>, creator: CreatorParams) {
        let CreatorParams {
            params,
            own_address_type,
            advertise_data,
            advertise_data_enc,
            scan_response_data,
            scan_response_data_enc,
            periodic_params,
            periodic_data,
            periodic_adv_data_enc,
            duration,
            max_ext_adv_events,
            enc_key_value,
            cb,
            timeout_cb,
        } = creator;

        let inst_id = match Self::register_instance_task(&weak, own_address_type).await {
            None => return,
            Some(Err(status)) => {
                error!("registering advertiser failed, status: {}", status);
                cb(0, 0, status);
                return;
            }
            Some(Ok(inst_id)) => inst_id,
        };

        {
            let Some(manager) = try_upgrade(&weak) else { return };
            let mut state = manager.state.lock().unwrap();
            state.adv_inst[inst_id as usize].enc_key_value = enc_key_value;
        }

        let Some((status, _)) = Self::set_parameters_task(weak.clone(), inst_id, params).await
        else {
            return;
        };
        if !status.is_success() {
            Self::unregister_and_fail(&weak, inst_id, status, cb, "setting parameters failed");
            return;
        }

        let address_step = {
            let Some(manager) = try_upgrade(&weak) else { return };
            let state = manager.state.lock().unwrap();
            let inst = &state.adv_inst[inst_id as usize];
            if inst.own_address_type == OwnAddressType::Public || state.rpa_gen_offload_enabled {
                None
            } else {
                Some((Arc::clone(&manager.hci), inst.own_address))
            }
        };
        if let Some((hci, own_address)) = address_step {
            let status = hci.set_random_address(inst_id, own_address).await;
            if !status.is_success() {
                Self::unregister_and_fail(
                    &weak,
                    inst_id,
                    status,
                    cb,
                    "setting random address failed",
                );
                return;
            }
            let Some(manager) = try_upgrade(&weak) else { return };
            let mut state = manager.state.lock().unwrap();
            state.adv_inst[inst_id as usize].state = InstanceState::AddrSet;
        }

        {
            let Some(manager) = try_upgrade(&weak) else { return };
            let mut state = manager.state.lock().unwrap();
            state.adv_inst[inst_id as usize].state = InstanceState::DataPending;
        }
        let Some(status) =
            Self::set_data_task(weak.clone(), inst_id, false, advertise_data, advertise_data_enc)
                .await
        else {
            return;
        };
        if !status.is_success() {
            Self::unregister_and_fail(&weak, inst_id, status, cb, "setting advertise data failed");
            return;
        }
        let Some(status) = Self::set_data_task(
            weak.clone(),
            inst_id,
            true,
            scan_response_data,
            scan_response_data_enc,
        )
        .await
        else {
            return;
        };
        if !status.is_success() {
            Self::unregister_and_fail(
                &weak,
                inst_id,
                status,
                cb,
                "setting scan response data failed",
            );
            return;
        }

        if periodic_params.enable {
            {
                let Some(manager) = try_upgrade(&weak) else { return };
                let mut state = manager.state.lock().unwrap();
                state.adv_inst[inst_id as usize].state = InstanceState::PeriodicPending;
            }
            let Some(status) =
                Self::set_periodic_params_task(weak.clone(), inst_id, periodic_params).await
            else {
                return;
            };
            if !status.is_success() {
                Self::unregister_and_fail(
                    &weak,
                    inst_id,
                    status,
                    cb,
                    "setting periodic parameters failed",
                );
                return;
            }
            let Some(status) = Self::set_periodic_data_task(
                weak.clone(),
                inst_id,
                periodic_data,
                periodic_adv_data_enc,
            )
            .await
            else {
                return;
            };
            if !status.is_success() {
                Self::unregister_and_fail(
                    &weak,
                    inst_id,
                    status,
                    cb,
                    "setting periodic data failed",
                );
                return;
            }
            let Some(status) = Self::set_periodic_enable_task(
                weak.clone(),
                inst_id,
                true,
                periodic_params.include_adi,
            )
            .await
            else {
                return;
            };
            if !status.is_success() {
                Self::unregister_and_fail(
                    &weak,
                    inst_id,
                    status,
                    cb,
                    "enabling periodic advertising failed",
                );
                return;
            }
        }

        let instance_timeout: TimeoutCb = Arc::new(move |status| timeout_cb(inst_id, status));
        let Some(status) = Self::enable_task(
            weak.clone(),
            inst_id,
            true,
            duration,
            max_ext_adv_events,
            Some(instance_timeout),
        )
        .await
        else {
            return;
        };
        if !status.is_success() {
            Self::unregister_and_fail(&weak, inst_id, status, cb, "enabling advertiser failed");
            return;
        }

        let tx_power = {
            let Some(manager) = try_upgrade(&weak) else { return };
            let state = manager.state.lock().unwrap();
            state.adv_inst[inst_id as usize].tx_power
        };
        cb(inst_id, tx_power, AdvStatus::SUCCESS);
    }

    fn unregister_and_fail(
        weak: &Weak<AdvertiseManager>,
        inst_id: u8,
        status: AdvStatus,
        cb: IdTxPowerStatusCb,
        what: &str,
    ) {
        error!("{}, status: {}", what, status);
        if let Some(manager) = weak.upgrade() {
            manager.unregister(inst_id);
        }
        cb(0, 0, status);
    }

    /// Starts advertising on an already-registered instance. The simpler
    /// entry point predating full advertising sets.
    pub fn start_advertising(
        &self,
        inst_id: u8,
        cb: MultiAdvCb,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        scan_response_data: Vec<u8>,
        duration: u16,
        timeout_cb: TimeoutCb,
    ) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(status) = Self::start_advertising_task(
                weak,
                inst_id,
                params,
                advertise_data,
                scan_response_data,
                duration,
                timeout_cb,
            )
            .await
            {
                cb(status);
            }
        });
    }

    async fn start_advertising_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        scan_response_data: Vec<u8>,
        duration: u16,
        timeout_cb: TimeoutCb,
    ) -> Option<AdvStatus> {
        let (status, _) = Self::set_parameters_task(weak.clone(), inst_id, params).await?;
        if !status.is_success() {
            error!("setting parameters failed, status: {}", status);
            return Some(status);
        }
        let (hci, own_address) = {
            let manager = try_upgrade(&weak)?;
            let state = manager.state.lock().unwrap();
            (Arc::clone(&manager.hci), state.adv_inst[inst_id as usize].own_address)
        };
        let status = hci.set_random_address(inst_id, own_address).await;
        if !status.is_success() {
            error!("setting random address failed, status: {}", status);
            return Some(status);
        }
        let status =
            Self::set_data_task(weak.clone(), inst_id, false, advertise_data, Vec::new()).await?;
        if !status.is_success() {
            error!("setting advertise data failed, status: {}", status);
            return Some(status);
        }
        let status =
            Self::set_data_task(weak.clone(), inst_id, true, scan_response_data, Vec::new())
                .await?;
        if !status.is_success() {
            error!("setting scan response data failed, status: {}", status);
            return Some(status);
        }
        Self::enable_task(weak, inst_id, true, duration, 0, Some(timeout_cb)).await
    }

    /// Applies advertising parameters to an instance.
    pub fn set_parameters(&self, inst_id: u8, params: AdvertiseParameters, cb: ParametersCb) {
        debug!("set_parameters(): inst_id {}", inst_id);
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some((status, tx_power)) =
                Self::set_parameters_task(weak, inst_id, params).await
            {
                cb(status, tx_power);
            }
        });
    }

    async fn set_parameters_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        params: AdvertiseParameters,
    ) -> Option<(AdvStatus, i8)> {
        let (hci, wire) = {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            if inst_id >= state.inst_count {
                error!("bad instance id {}", inst_id);
                return None;
            }
            let offload = state.rpa_gen_offload_enabled;
            let inst = &mut state.adv_inst[inst_id as usize];
            if !inst.in_use {
                error!("adv instance not in use {}", inst_id);
                return Some((AdvStatus::MULTI_ADV_FAILURE, 0));
            }
            inst.advertising_event_properties = params.advertising_event_properties;
            inst.tx_power = params.tx_power;
            let interval_min = clamp(params.adv_int_min, INTERVAL_MIN, INTERVAL_MAX);
            let interval_max = clamp(params.adv_int_max, interval_min, INTERVAL_MAX);
            inst.advertising_interval = interval_min;

            let mut peer_address = RawAddress::EMPTY;
            if offload {
                // Offloaded RPA generation keys the controller's address
                // book by a per-instance pseudo peer.
                peer_address = RawAddress { val: [0, 0, 0, 0, 0, inst.inst_id] };
                inst.own_address_type = OwnAddressType::RandomId;
            }

            // SID is in 0x00..=0x0f; no controller has more than 16 slots,
            // so the instance id maps onto it directly.
            let advertising_sid = inst.inst_id % 0x10;

            let wire = ExtendedAdvertisingParams {
                advertising_event_properties: params.advertising_event_properties,
                primary_advertising_interval_min: interval_min,
                primary_advertising_interval_max: interval_max,
                primary_advertising_channel_map: params.channel_map,
                own_address_type: inst.own_address_type,
                own_address: inst.own_address,
                peer_address_type: 0x00,
                peer_address,
                advertising_filter_policy: params.adv_filter_policy,
                advertising_tx_power: params.tx_power,
                primary_advertising_phy: params.primary_advertising_phy as u8,
                secondary_advertising_max_skip: 0x00,
                secondary_advertising_phy: params.secondary_advertising_phy as u8,
                advertising_sid,
                scan_request_notification_enable: params.scan_request_notification_enable,
            };
            (Arc::clone(&manager.hci), wire)
        };

        let (status, tx_power) = hci.set_parameters(inst_id, wire).await;
        if status.is_success() {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            let inst = &mut state.adv_inst[inst_id as usize];
            inst.tx_power = tx_power;
            if inst.state == InstanceState::Registered {
                inst.state = InstanceState::ParamsSet;
            }
        }
        Some((status, tx_power))
    }

    /// Replaces advertising or scan-response data on an instance,
    /// encrypting and fragmenting as needed.
    pub fn set_data(
        &self,
        inst_id: u8,
        is_scan_rsp: bool,
        data: Vec<u8>,
        encr_data: Vec<u8>,
        cb: MultiAdvCb,
    ) {
        if !encr_data.is_empty() && !self.config.enc_adv_data_enabled {
            error!("encrypted advertising data provided but the feature is disabled");
            cb(AdvStatus::FEATURE_UNSUPPORTED);
            return;
        }
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(status) =
                Self::set_data_task(weak, inst_id, is_scan_rsp, data, encr_data).await
            {
                cb(status);
            }
        });
    }

    async fn set_data_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        is_scan_rsp: bool,
        data: Vec<u8>,
        encr_data: Vec<u8>,
    ) -> Option<AdvStatus> {
        let (hci, restart, disable_entry, mut payload, log_enabled) = {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            if inst_id >= state.inst_count {
                error!("bad instance id {}", inst_id);
                return None;
            }
            let inst = &mut state.adv_inst[inst_id as usize];
            let restart =
                data.len() + encr_data.len() > EXT_ADV_DATA_LEN_MAX && inst.is_enabled();
            if is_scan_rsp {
                inst.scan_response_data = data.clone();
                inst.scan_response_data_enc = encr_data.clone();
            } else {
                inst.advertise_data = data.clone();
                inst.advertise_data_enc = encr_data.clone();
            }

            let update_flags = manager.config.pts_le_nonconn_adv_enabled
                || manager.config.pts_le_conn_nondisc_adv_enabled;
            let mut payload = data;
            if (!is_scan_rsp && inst.is_connectable()) || update_flags {
                let flags_val = if manager.config.pts_le_conn_nondisc_adv_enabled {
                    FLAG_NON_DISCOVERABLE
                } else if inst.duration > 0 {
                    FLAG_LIMITED_DISCOVERABLE
                } else {
                    FLAG_GENERAL_DISCOVERABLE
                };
                let mut flagged = Vec::with_capacity(payload.len() + 3);
                flagged.extend_from_slice(&[2, AD_TYPE_FLAGS, flags_val]);
                flagged.extend_from_slice(&payload);
                payload = flagged;
            }

            if restart {
                inst.state = InstanceState::Disabling;
            }
            let disable_entry = SetEnableData {
                handle: inst_id,
                duration: inst.duration,
                max_extended_advertising_events: inst.max_ext_adv_events,
            };
            (
                Arc::clone(&manager.hci),
                restart,
                disable_entry,
                payload,
                manager.config.enc_adv_data_log_enabled,
            )
        };

        if restart {
            // An oversized rewrite cannot land while the set is on air.
            let _ = hci.enable(false, vec![disable_entry]).await;
        }

        if !encr_data.is_empty() {
            // Every encrypted assembly uses a fresh randomizer.
            let rand = hci.le_rand().await;
            let manager = try_upgrade(&weak)?;
            let (key_material, randomizer, tx_power) = {
                let mut state = manager.state.lock().unwrap();
                let inst = &mut state.adv_inst[inst_id as usize];
                inst.randomizer = enc_adv_data::randomizer_from_le_rand(rand);
                let key_material = EncKeyMaterial::from_key_value(&inst.enc_key_value)
                    .unwrap_or(manager.config.gap_enc_key_material);
                (key_material, inst.randomizer, inst.tx_power)
            };
            patch_tx_power(&mut payload, tx_power);
            let mut encr = encr_data;
            patch_tx_power(&mut encr, tx_power);
            let Some(encrypted) = enc_adv_data::encrypted_ad_structure(
                &key_material,
                &randomizer,
                &encr,
                log_enabled,
            ) else {
                return Some(AdvStatus::MULTI_ADV_FAILURE);
            };
            payload.extend_from_slice(&encrypted);
        } else {
            let tx_power = {
                let manager = try_upgrade(&weak)?;
                let state = manager.state.lock().unwrap();
                state.adv_inst[inst_id as usize].tx_power
            };
            patch_tx_power(&mut payload, tx_power);
        }

        let status = Self::send_fragmented_data(&hci, inst_id, is_scan_rsp, &payload).await;
        if !status.is_success() {
            error!("failed to write advertising payload, status: {}", status);
            return Some(status);
        }

        if restart {
            let enable_entry = {
                let manager = try_upgrade(&weak)?;
                let mut state = manager.state.lock().unwrap();
                let inst = &mut state.adv_inst[inst_id as usize];
                inst.state = InstanceState::Enabled;
                SetEnableData {
                    handle: inst_id,
                    duration: inst.duration,
                    max_extended_advertising_events: inst.max_ext_adv_events,
                }
            };
            return Some(hci.enable(true, vec![enable_entry]).await);
        }
        Some(status)
    }

    async fn send_fragmented_data(
        hci: &Arc<dyn BleAdvertiserHciInterface>,
        inst_id: u8,
        is_scan_rsp: bool,
        payload: &[u8],
    ) -> AdvStatus {
        for (operation, chunk) in fragments(payload, EXT_ADV_DATA_LEN_MAX) {
            let status = if is_scan_rsp {
                hci.set_scan_response_data(inst_id, operation, FRAGMENT_PREFERENCE, chunk).await
            } else {
                hci.set_advertising_data(inst_id, operation, FRAGMENT_PREFERENCE, chunk).await
            };
            if !status.is_success() {
                return status;
            }
        }
        AdvStatus::SUCCESS
    }

    async fn send_fragmented_periodic_data(
        hci: &Arc<dyn BleAdvertiserHciInterface>,
        inst_id: u8,
        payload: &[u8],
    ) -> AdvStatus {
        for (operation, chunk) in fragments(payload, PERIODIC_ADV_DATA_LEN_MAX) {
            let status = hci.set_periodic_advertising_data(inst_id, operation, chunk).await;
            if !status.is_success() {
                return status;
            }
        }
        AdvStatus::SUCCESS
    }

    /// Enables or disables an instance, arming host-side duration
    /// emulation when needed. A deferred RPA rotation runs first.
    pub fn enable(
        &self,
        inst_id: u8,
        enable: bool,
        duration: u16,
        max_ext_adv_events: u8,
        cb: MultiAdvCb,
        timeout_cb: Option<TimeoutCb>,
    ) {
        debug!("enable(): inst_id {}, enable {}, duration {}", inst_id, enable, duration);
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(status) =
                Self::enable_task(weak, inst_id, enable, duration, max_ext_adv_events, timeout_cb)
                    .await
            {
                cb(status);
            }
        });
    }

    async fn enable_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        enable: bool,
        duration: u16,
        max_ext_adv_events: u8,
        timeout_cb: Option<TimeoutCb>,
    ) -> Option<AdvStatus> {
        let rotate_first = {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            if inst_id >= state.inst_count {
                error!("bad instance id {}", inst_id);
                return None;
            }
            let offload = state.rpa_gen_offload_enabled;
            let inst = &mut state.adv_inst[inst_id as usize];
            if !inst.in_use {
                error!("invalid or no active instance");
                return Some(AdvStatus::MULTI_ADV_FAILURE);
            }
            if enable && (duration != 0 || max_ext_adv_events != 0) {
                if let Some(timeout_cb) = timeout_cb {
                    inst.timeout_cb = Some(timeout_cb);
                }
            }
            inst.duration = duration;
            inst.max_ext_adv_events = max_ext_adv_events;
            let rotate = enable && inst.address_update_required && !offload;
            if rotate {
                inst.address_update_required = false;
            }
            rotate
        };

        if rotate_first {
            // The deferred rotation must land before the set goes live.
            Self::configure_rpa_task(weak.clone(), inst_id).await?;
        }

        let (hci, entry, emulate_duration) = {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            let inst = &mut state.adv_inst[inst_id as usize];
            let emulate_duration = enable && inst.duration > 0;
            if !emulate_duration {
                inst.timeout_timer.cancel();
            }
            if enable {
                inst.enable_time = Instant::now();
            }
            inst.enable_status = enable;
            inst.state = if enable { InstanceState::Enabled } else { InstanceState::Disabling };
            let entry = SetEnableData {
                handle: inst_id,
                duration: inst.duration,
                max_extended_advertising_events: inst.max_ext_adv_events,
            };
            (Arc::clone(&manager.hci), entry, emulate_duration)
        };

        let status = hci.enable(enable, vec![entry]).await;

        let manager = try_upgrade(&weak)?;
        if status.is_success() {
            if emulate_duration {
                manager.arm_timeout_timer(inst_id, duration);
            }
            if !enable {
                let mut state = manager.state.lock().unwrap();
                let inst = &mut state.adv_inst[inst_id as usize];
                if inst.state == InstanceState::Disabling {
                    inst.state = InstanceState::ParamsSet;
                }
            }
        }
        Some(status)
    }

    /// Emulates the Duration parameter host-side: when the alarm fires the
    /// set is disabled and the disable's completion lands in the stored
    /// timeout callback.
    fn arm_timeout_timer(&self, inst_id: u8, duration: u16) {
        let weak = self.weak_self.clone();
        let mut state = self.state.lock().unwrap();
        let inst = &mut state.adv_inst[inst_id as usize];
        inst.timeout_timer.schedule(Duration::from_millis(u64::from(duration) * 10), async move {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let timeout_cb = {
                let state = manager.state.lock().unwrap();
                state.adv_inst[inst_id as usize].timeout_cb.clone()
            };
            let cb: MultiAdvCb = match timeout_cb {
                Some(timeout_cb) => Box::new(move |status| timeout_cb(status)),
                None => Box::new(|_| {}),
            };
            manager.enable(inst_id, false, 0, 0, cb, None);
        });
    }

    /// Swaps the instance's own address for a freshly generated RPA,
    /// quiescing the set and refreshing encrypted payloads as required.
    async fn configure_rpa_task(weak: Weak<AdvertiseManager>, inst_id: u8) -> Option<AdvStatus> {
        {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            if inst_id >= state.inst_count {
                return None;
            }
            let inst = &mut state.adv_inst[inst_id as usize];
            if !inst.in_use {
                return None;
            }
            if inst.skip_rpa {
                if inst.skip_rpa_count > 0 {
                    inst.skip_rpa_count -= 1;
                    return None;
                }
                debug!("resetting rpa skip budget for broadcast instance {}", inst_id);
                inst.skip_rpa_count = BROADCAST_RPA_SKIP_COUNT;
            }
            // With a duration or event cap there is no good way to carry
            // the remaining budget across a restart; rotate when the set
            // stops instead.
            if inst.is_enabled()
                && inst.is_connectable()
                && (inst.duration != 0 || inst.max_ext_adv_events != 0)
            {
                inst.address_update_required = true;
                return Some(AdvStatus::SUCCESS);
            }
        }

        let rpa_generator = Arc::clone(&try_upgrade(&weak)?.rpa_generator);
        let rpa = rpa_generator.generate_rpa().await;

        let (hci, restart, refresh) = {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            let inst = &mut state.adv_inst[inst_id as usize];
            // A connectable set must not advertise across the address
            // change, and any encrypted payload needs its randomizer
            // refreshed against the new address.
            let restart =
                inst.is_enabled() && (inst.is_connectable() || inst.has_encrypted_data());
            inst.own_address = rpa;
            let refresh = RefreshSnapshot {
                adv: (inst.advertise_data.clone(), inst.advertise_data_enc.clone()),
                scan: (inst.scan_response_data.clone(), inst.scan_response_data_enc.clone()),
                periodic: (!inst.periodic_adv_data_enc.is_empty() && inst.periodic_enabled)
                    .then(|| (inst.periodic_data.clone(), inst.periodic_adv_data_enc.clone())),
            };
            (Arc::clone(&manager.hci), restart, refresh)
        };

        if restart {
            {
                let manager = try_upgrade(&weak)?;
                let mut state = manager.state.lock().unwrap();
                state.adv_inst[inst_id as usize].enable_status = false;
            }
            let _ = hci
                .enable(false, vec![SetEnableData { handle: inst_id, ..Default::default() }])
                .await;
        }

        let status = hci.set_random_address(inst_id, rpa).await;
        if !status.is_success() {
            warn!("setting random address failed, status: {}", status);
        }

        if !refresh.adv.1.is_empty() {
            let (data, encr_data) = refresh.adv;
            let status = Self::set_data_task(weak.clone(), inst_id, false, data, encr_data).await?;
            if !status.is_success() {
                error!("set data failed: {}", status);
                return Some(status);
            }
            // The scan response rewrite refreshes the randomizer again if
            // it carries encrypted data of its own.
            let (scan_data, scan_encr) = refresh.scan;
            let status =
                Self::set_data_task(weak.clone(), inst_id, true, scan_data, scan_encr).await?;
            if !status.is_success() {
                error!("set scan response data failed: {}", status);
                return Some(status);
            }
            if let Some((periodic_data, periodic_encr)) = refresh.periodic {
                let status = Self::set_periodic_data_task(
                    weak.clone(),
                    inst_id,
                    periodic_data,
                    periodic_encr,
                )
                .await?;
                if !status.is_success() {
                    error!("set periodic data failed: {}", status);
                    return Some(status);
                }
            }
        } else if !refresh.scan.1.is_empty() {
            let (scan_data, scan_encr) = refresh.scan;
            let status =
                Self::set_data_task(weak.clone(), inst_id, true, scan_data, scan_encr).await?;
            if !status.is_success() {
                error!("set scan response data failed: {}", status);
                return Some(status);
            }
        } else if let Some((periodic_data, periodic_encr)) = refresh.periodic {
            let status =
                Self::set_periodic_data_task(weak.clone(), inst_id, periodic_data, periodic_encr)
                    .await?;
            if !status.is_success() {
                error!("set periodic data failed: {}", status);
                return Some(status);
            }
        }

        if restart {
            {
                let manager = try_upgrade(&weak)?;
                let mut state = manager.state.lock().unwrap();
                state.adv_inst[inst_id as usize].enable_status = true;
            }
            let _ = hci
                .enable(true, vec![SetEnableData { handle: inst_id, ..Default::default() }])
                .await;
        }
        Some(AdvStatus::SUCCESS)
    }

    /// Applies periodic advertising parameters.
    pub fn set_periodic_advertising_parameters(
        &self,
        inst_id: u8,
        params: PeriodicAdvertisingParameters,
        cb: MultiAdvCb,
    ) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(status) = Self::set_periodic_params_task(weak, inst_id, params).await {
                cb(status);
            }
        });
    }

    async fn set_periodic_params_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        params: PeriodicAdvertisingParameters,
    ) -> Option<AdvStatus> {
        debug!("set periodic advertising parameters: inst_id {}", inst_id);
        let hci = Arc::clone(&try_upgrade(&weak)?.hci);
        Some(
            hci.set_periodic_advertising_parameters(
                inst_id,
                params.min_interval,
                params.max_interval,
                params.periodic_advertising_properties,
            )
            .await,
        )
    }

    /// Replaces the periodic advertising payload.
    pub fn set_periodic_advertising_data(
        &self,
        inst_id: u8,
        data: Vec<u8>,
        encr_data: Vec<u8>,
        cb: MultiAdvCb,
    ) {
        if !encr_data.is_empty() && !self.config.enc_adv_data_enabled {
            error!("encrypted advertising data provided but the feature is disabled");
            cb(AdvStatus::FEATURE_UNSUPPORTED);
            return;
        }
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(status) = Self::set_periodic_data_task(weak, inst_id, data, encr_data).await
            {
                cb(status);
            }
        });
    }

    async fn set_periodic_data_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        data: Vec<u8>,
        encr_data: Vec<u8>,
    ) -> Option<AdvStatus> {
        let (hci, restart_periodic, log_enabled) = {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            if inst_id >= state.inst_count {
                error!("bad instance id {}", inst_id);
                return None;
            }
            let inst = &mut state.adv_inst[inst_id as usize];
            inst.periodic_data = data.clone();
            inst.periodic_adv_data_enc = encr_data.clone();
            let restart_periodic =
                data.len() + encr_data.len() > PERIODIC_ADV_DATA_LEN_MAX && inst.periodic_enabled;
            if data.starts_with(&BROADCAST_AUDIO_ANNOUNCEMENT_PREFIX)
                || encr_data.starts_with(&BROADCAST_AUDIO_ANNOUNCEMENT_PREFIX)
            {
                debug!("broadcast announcement on instance {}; throttling rpa rotation", inst_id);
                inst.skip_rpa = true;
                inst.skip_rpa_count = BROADCAST_RPA_SKIP_COUNT;
            }
            (
                Arc::clone(&manager.hci),
                restart_periodic,
                manager.config.enc_adv_data_log_enabled,
            )
        };

        if restart_periodic {
            // Oversized rewrite on a live train: stop it around the write.
            Self::set_periodic_enable_task(weak.clone(), inst_id, false, false).await?;
        }

        let mut payload = data;
        if !encr_data.is_empty() {
            let rand = hci.le_rand().await;
            let manager = try_upgrade(&weak)?;
            let (key_material, randomizer) = {
                let mut state = manager.state.lock().unwrap();
                let inst = &mut state.adv_inst[inst_id as usize];
                inst.randomizer = enc_adv_data::randomizer_from_le_rand(rand);
                let key_material = EncKeyMaterial::from_key_value(&inst.enc_key_value)
                    .unwrap_or(manager.config.gap_enc_key_material);
                (key_material, inst.randomizer)
            };
            let Some(encrypted) = enc_adv_data::encrypted_ad_structure(
                &key_material,
                &randomizer,
                &encr_data,
                log_enabled,
            ) else {
                return Some(AdvStatus::MULTI_ADV_FAILURE);
            };
            payload.extend_from_slice(&encrypted);
        }

        let status = Self::send_fragmented_periodic_data(&hci, inst_id, &payload).await;
        if !status.is_success() {
            error!("failed to write periodic payload, status: {}", status);
            return Some(status);
        }
        if restart_periodic {
            return Self::set_periodic_enable_task(weak, inst_id, true, false).await;
        }
        Some(status)
    }

    /// Enables or disables the periodic advertising train.
    pub fn set_periodic_advertising_enable(
        &self,
        inst_id: u8,
        enable: bool,
        include_adi: bool,
        cb: MultiAdvCb,
    ) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(status) =
                Self::set_periodic_enable_task(weak, inst_id, enable, include_adi).await
            {
                cb(status);
            }
        });
    }

    async fn set_periodic_enable_task(
        weak: Weak<AdvertiseManager>,
        inst_id: u8,
        enable: bool,
        include_adi: bool,
    ) -> Option<AdvStatus> {
        let (hci, value) = {
            let manager = try_upgrade(&weak)?;
            let state = manager.state.lock().unwrap();
            if inst_id >= state.inst_count {
                error!("bad instance id {}", inst_id);
                return None;
            }
            let inst = &state.adv_inst[inst_id as usize];
            if !inst.in_use {
                error!("invalid or not active instance");
                return Some(AdvStatus::MULTI_ADV_FAILURE);
            }
            let mut value = enable as u8;
            // ADI only goes on the wire when the controller takes it.
            if enable && include_adi && manager.hci.supports_periodic_advertising_adi() {
                value |= 0x02;
            }
            (Arc::clone(&manager.hci), value)
        };

        let status = hci.set_periodic_advertising_enable(value, inst_id).await;
        debug!(
            "periodic adv enable: inst_id {}, enable {}, status {}",
            inst_id, enable, status
        );
        if status.is_success() {
            let manager = try_upgrade(&weak)?;
            let mut state = manager.state.lock().unwrap();
            state.adv_inst[inst_id as usize].periodic_enabled = enable;
        }
        Some(status)
    }

    /// Creates a broadcast isochronous group bound to an advertising set.
    /// Completion arrives with LE Create BIG Complete.
    pub fn create_big(&self, inst_id: u8, params: CreateBigParams, cb: CreateBigCb) {
        debug!("create_big(): inst_id {}", inst_id);
        if !self.hci.supports_iso_broadcaster() {
            debug!("iso broadcaster not supported by controller");
            cb(inst_id, AdvStatus::ILLEGAL_COMMAND, failed_big_report());
            return;
        }
        let big_handle = {
            let mut state = self.state.lock().unwrap();
            if inst_id >= state.inst_count {
                drop(state);
                error!("bad instance id {}", inst_id);
                cb(inst_id, AdvStatus::MULTI_ADV_FAILURE, failed_big_report());
                return;
            }
            let Some(slot) = state.iso_big_inst.iter().position(|big| !big.in_use) else {
                let inst_count = state.inst_count;
                drop(state);
                debug!("cannot create BIG, all {} handles in use", inst_count);
                cb(inst_id, AdvStatus::ILLEGAL_COMMAND, failed_big_report());
                return;
            };
            let big = &mut state.iso_big_inst[slot];
            big.in_use = true;
            big.big_handle = slot as u8;
            big.adv_inst_id = inst_id;
            big.create_big_cb = Some(cb);
            debug!("BIG handle allocated: {}", slot);
            state.adv_inst[inst_id as usize].big_handle = slot as u8;
            slot as u8
        };
        let hci = Arc::clone(&self.hci);
        tokio::spawn(async move {
            let _ = hci.create_big(big_handle, inst_id, params).await;
        });
    }

    /// Terminates a previously created BIG. A BIG that never completed
    /// creation is rejected without HCI traffic.
    pub fn terminate_big(&self, inst_id: u8, big_handle: u8, reason: u8, cb: TerminateBigCb) {
        debug!("terminate_big(): big_handle {}", big_handle);
        if !self.hci.supports_iso_broadcaster() {
            debug!("iso broadcaster not supported by controller");
            cb(AdvStatus::ILLEGAL_COMMAND, inst_id, big_handle, reason);
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if big_handle >= state.inst_count {
                drop(state);
                error!("invalid BIG handle {}", big_handle);
                cb(AdvStatus::ILLEGAL_COMMAND, inst_id, big_handle, reason);
                return;
            }
            let big = &mut state.iso_big_inst[big_handle as usize];
            if !big.created_status {
                drop(state);
                error!("terminating BIG which is not created");
                cb(AdvStatus::ILLEGAL_COMMAND, inst_id, big_handle, reason);
                return;
            }
            big.terminate_big_cb = Some(cb);
            big.adv_inst_id = inst_id;
            big.terminate_reason = reason;
        }
        let hci = Arc::clone(&self.hci);
        tokio::spawn(async move {
            let _ = hci.terminate_big(big_handle, reason).await;
        });
    }

    /// Pauses every enabled set with one batched disable, recomputing each
    /// set's remaining budget first so [`resume`](Self::resume) restarts
    /// with what is left.
    pub fn suspend(&self) {
        let now = Instant::now();
        let mut sets = Vec::new();
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for inst in state.adv_inst.iter_mut().filter(|inst| inst.in_use && inst.enable_status)
            {
                if inst.duration != 0 || inst.max_ext_adv_events != 0 {
                    if let Some(cb) = recompute_timeout(inst, now) {
                        expired.push(cb);
                    }
                }
                if inst.enable_status {
                    sets.push(SetEnableData { handle: inst.inst_id, ..Default::default() });
                }
            }
        }
        for cb in expired {
            cb(AdvStatus::SUCCESS);
        }
        if !sets.is_empty() {
            let hci = Arc::clone(&self.hci);
            tokio::spawn(async move {
                let _ = hci.enable(false, sets).await;
            });
        }
    }

    /// Restores every set whose enable intent survived
    /// [`suspend`](Self::suspend), carrying the remaining budgets.
    pub fn resume(&self) {
        let mut sets = Vec::new();
        {
            let state = self.state.lock().unwrap();
            for inst in state.adv_inst.iter().filter(|inst| inst.in_use && inst.enable_status) {
                sets.push(SetEnableData {
                    handle: inst.inst_id,
                    duration: inst.duration,
                    max_extended_advertising_events: inst.max_ext_adv_events,
                });
            }
        }
        if !sets.is_empty() {
            let hci = Arc::clone(&self.hci);
            tokio::spawn(async move {
                let _ = hci.enable(true, sets).await;
            });
        }
    }

    /// Feeds a controller event into the state machine.
    pub fn on_advertising_event(&self, event: AdvertisingEvent) {
        match event {
            AdvertisingEvent::SetTerminated {
                status,
                advertising_handle,
                connection_handle,
                num_completed_extended_adv_events,
            } => self.on_advertising_set_terminated(
                status,
                advertising_handle,
                connection_handle,
                num_completed_extended_adv_events,
            ),
            AdvertisingEvent::CreateBigComplete {
                status,
                big_handle,
                big_sync_delay,
                transport_latency_big,
                phy,
                nse,
                bn,
                pto,
                irc,
                max_pdu,
                iso_interval,
                num_bis,
                conn_handle_list,
            } => self.on_create_big_complete(
                status,
                BigCreateReport {
                    big_handle,
                    big_sync_delay,
                    transport_latency_big,
                    phy,
                    nse,
                    bn,
                    pto,
                    irc,
                    max_pdu,
                    iso_interval,
                    num_bis,
                    conn_handle_list,
                },
            ),
            AdvertisingEvent::TerminateBigComplete { status, big_handle, reason } => {
                self.on_terminate_big_complete(status, big_handle, reason)
            }
        }
    }

    /// Handles LE Advertising Set Terminated.
    ///
    /// Directed sets are one-shot: when a directed set terminates its slot
    /// is released and no completion is delivered.
    fn on_advertising_set_terminated(
        &self,
        status: AdvStatus,
        advertising_handle: u8,
        connection_handle: u16,
        _num_completed_extended_adv_events: u8,
    ) {
        debug!(
            "advertising set terminated: status {}, handle {}, connection handle 0x{:04x}",
            status, advertising_handle, connection_handle
        );
        let mut timeout_to_fire: Option<(TimeoutCb, AdvStatus)> = None;
        let mut conn_addr: Option<RawAddress> = None;
        let mut reenable: Option<SetEnableData> = None;
        {
            let mut state = self.state.lock().unwrap();
            if advertising_handle >= state.inst_count {
                warn!("terminated event for unknown handle {}", advertising_handle);
                return;
            }
            let offload = state.rpa_gen_offload_enabled;
            let inst = &mut state.adv_inst[advertising_handle as usize];
            if status == AdvStatus::LIMIT_REACHED || status == AdvStatus::ADVERTISING_TIMEOUT {
                // Duration elapsed or the event budget ran out.
                inst.enable_status = false;
                match inst.timeout_cb.clone() {
                    Some(cb) => timeout_to_fire = Some((cb, status)),
                    None => info!("no timeout callback"),
                }
            } else {
                if !offload && self.config.local_privacy_enabled {
                    conn_addr = Some(inst.own_address);
                }
                if inst.in_use {
                    if inst.advertising_event_properties & DIRECTED_BITS == 0 {
                        if let Some(cb) = recompute_timeout(inst, Instant::now()) {
                            timeout_to_fire = Some((cb, AdvStatus::SUCCESS));
                        }
                        if inst.enable_status {
                            reenable = Some(SetEnableData {
                                handle: advertising_handle,
                                duration: inst.duration,
                                max_extended_advertising_events: inst.max_ext_adv_events,
                            });
                        }
                    } else {
                        inst.in_use = false;
                        inst.state = InstanceState::Idle;
                    }
                }
            }
        }
        if let Some(own_address) = conn_addr {
            if let Some(cb) = &self.config.conn_addr_update_cb {
                cb(connection_handle, own_address);
            }
        }
        if let Some((cb, status)) = timeout_to_fire {
            cb(status);
        }
        if let Some(entry) = reenable {
            debug!("re-enabling advertising");
            let hci = Arc::clone(&self.hci);
            tokio::spawn(async move {
                let _ = hci.enable(true, vec![entry]).await;
            });
        }
    }

    fn on_create_big_complete(&self, status: AdvStatus, report: BigCreateReport) {
        debug!("create BIG complete: big_handle {}, status {}", report.big_handle, status);
        let (cb, adv_inst_id) = {
            let mut state = self.state.lock().unwrap();
            if report.big_handle >= state.inst_count {
                error!("invalid BIG handle {}", report.big_handle);
                return;
            }
            let adv_inst_id;
            let cb;
            {
                let big = &mut state.iso_big_inst[report.big_handle as usize];
                adv_inst_id = big.adv_inst_id;
                cb = big.create_big_cb.take();
                if status.is_success() {
                    big.bis_handles = report.conn_handle_list.clone();
                    big.created_status = true;
                } else {
                    big.in_use = false;
                    big.big_handle = INVALID_BIG_HANDLE;
                }
            }
            if !status.is_success() && (adv_inst_id as usize) < state.adv_inst.len() {
                state.adv_inst[adv_inst_id as usize].big_handle = INVALID_BIG_HANDLE;
            }
            (cb, adv_inst_id)
        };
        if let Some(cb) = cb {
            cb(adv_inst_id, status, report);
        }
    }

    /// The callback reports the reason the host supplied on terminate; the
    /// event's own reason field only mirrors it for locally-initiated
    /// termination.
    fn on_terminate_big_complete(&self, status: AdvStatus, big_handle: u8, _reason: u8) {
        debug!("terminate BIG complete: big_handle {}, status {}", big_handle, status);
        let (cb, adv_inst_id, reason) = {
            let mut state = self.state.lock().unwrap();
            if big_handle >= state.inst_count {
                error!("invalid BIG handle {}", big_handle);
                return;
            }
            let adv_inst_id;
            let cb;
            let reason;
            {
                let big = &mut state.iso_big_inst[big_handle as usize];
                adv_inst_id = big.adv_inst_id;
                cb = big.terminate_big_cb.take();
                reason = big.terminate_reason;
                big.in_use = false;
                big.bis_handles.clear();
                big.created_status = false;
                big.big_handle = INVALID_BIG_HANDLE;
            }
            if (adv_inst_id as usize) < state.adv_inst.len() {
                state.adv_inst[adv_inst_id as usize].big_handle = INVALID_BIG_HANDLE;
            }
            (cb, adv_inst_id, reason)
        };
        if let Some(cb) = cb {
            cb(status, adv_inst_id, big_handle, reason);
        }
    }

    /// Cancels every pending alarm. Runs on teardown before the manager is
    /// dropped.
    pub fn cancel_adv_alarms(&self) {
        let mut state = self.state.lock().unwrap();
        for inst in state.adv_inst.iter_mut() {
            inst.timeout_timer.cancel();
            inst.adv_raddr_timer.cancel();
        }
    }
}

lazy_static! {
    static ref INSTANCE: Mutex<Option<Arc<AdvertiseManager>>> = Mutex::new(None);
}

/// Initializes the process-wide manager. Replaces any previous instance.
pub async fn initialize(
    hci: Arc<dyn BleAdvertiserHciInterface>,
    rpa_generator: Arc<dyn RpaGenerator>,
    config: AdvertiseManagerConfig,
) {
    let manager = AdvertiseManager::new(hci, rpa_generator, config).await;
    *INSTANCE.lock().unwrap() = Some(manager);
}

/// The process-wide manager, if initialized.
pub fn get() -> Option<Arc<AdvertiseManager>> {
    INSTANCE.lock().unwrap().clone()
}

pub fn is_initialized() -> bool {
    INSTANCE.lock().unwrap().is_some()
}

/// Tears down the process-wide manager. In-flight pipeline continuations
/// observe the teardown on their next step and abort without side effects.
pub fn clean_up() {
    let manager = INSTANCE.lock().unwrap().take();
    if let Some(manager) = manager {
        manager.cancel_adv_alarms();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_recompute_timeout_shutdown() {
        let start = Instant::now();
        let mut inst = AdvertisingInstance::new(0);
        inst.enable_status = true;
        inst.enable_time = start;
        inst.duration = 12; // 120 ms
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        inst.timeout_cb = Some(Arc::new(move |_| {
            flag.store(true, Ordering::SeqCst);
        }));

        let cb = recompute_timeout(&mut inst, start + Duration::from_millis(111));
        cb.expect("duration budget should be exhausted")(AdvStatus::SUCCESS);
        assert!(fired.load(Ordering::SeqCst));
        assert!(!inst.enable_status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recompute_timeout_adjusts_budgets() {
        let start = Instant::now();
        let mut inst = AdvertisingInstance::new(0);
        inst.enable_status = true;
        inst.enable_time = start;
        inst.duration = 50; // 500 ms
        inst.max_ext_adv_events = 50;
        inst.advertising_interval = 16; // 10 ms
        inst.timeout_cb = Some(Arc::new(|_| panic!("no timeout expected")));

        let cb = recompute_timeout(&mut inst, start + Duration::from_millis(250));
        assert!(cb.is_none());
        assert!(inst.enable_status);
        assert_eq!(inst.duration, 25);
        assert_eq!(inst.max_ext_adv_events, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recompute_timeout_event_budget_exhausted() {
        let start = Instant::now();
        let mut inst = AdvertisingInstance::new(0);
        inst.enable_status = true;
        inst.enable_time = start;
        inst.max_ext_adv_events = 50;
        inst.advertising_interval = 16;
        inst.timeout_cb = Some(Arc::new(|_| {}));

        let cb = recompute_timeout(&mut inst, start + Duration::from_millis(495));
        assert!(cb.is_some());
        assert!(!inst.enable_status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recompute_timeout_without_budgets_is_noop() {
        let start = Instant::now();
        let mut inst = AdvertisingInstance::new(0);
        inst.enable_status = true;
        inst.enable_time = start;

        let cb = recompute_timeout(&mut inst, start + Duration::from_millis(10_000));
        assert!(cb.is_none());
        assert!(inst.enable_status);
    }

    #[test]
    fn test_patch_tx_power_walks_structures() {
        // An 0x0a byte inside the local-name payload must not be patched;
        // the real TX Power Level structure must be.
        let mut data = vec![
            0x05, 0x09, b'a', 0x0a, b'c', b'd', // complete local name
            0x02, 0x0a, 0x7f, // tx power level placeholder
        ];
        patch_tx_power(&mut data, -21);
        assert_eq!(data[3], 0x0a);
        assert_eq!(data[8], (-21i8) as u8);
    }

    #[test]
    fn test_patch_tx_power_truncated_structure() {
        let mut data = vec![0x02, 0x0a];
        patch_tx_power(&mut data, 5);
        assert_eq!(data, vec![0x02, 0x0a]);
    }

    #[test]
    fn test_effective_own_address_type() {
        assert_eq!(
            effective_own_address_type(false, OwnAddressType::Default),
            OwnAddressType::Public
        );
        assert_eq!(
            effective_own_address_type(true, OwnAddressType::Default),
            OwnAddressType::Random
        );
        assert_eq!(
            effective_own_address_type(false, OwnAddressType::Anonymous),
            OwnAddressType::Public
        );
        assert_eq!(
            effective_own_address_type(true, OwnAddressType::Anonymous),
            OwnAddressType::Random
        );
        assert_eq!(
            effective_own_address_type(true, OwnAddressType::Public),
            OwnAddressType::Public
        );
        assert_eq!(
            effective_own_address_type(false, OwnAddressType::RandomId),
            OwnAddressType::RandomId
        );
    }
}
