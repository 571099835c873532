//! BLE multi-advertising manager.
//!
//! Host-side coordination of multiple concurrent LE extended advertising
//! sets, each with its own parameters, advertising and scan-response
//! payloads, optional periodic advertising train, optional Broadcast
//! Isochronous Group, and optional Encrypted Advertising Data. The manager
//! sits between higher-level clients and an opaque HCI command interface;
//! commands flow down through per-instance pipelines and controller events
//! flow back up into the per-instance state machine.

pub mod address;
pub mod advertise_manager;
pub mod alarm;
pub mod enc_adv_data;
pub mod fragment;
pub mod hci;
pub mod logging;

pub use address::{RawAddress, RpaGenerator, SoftwareRpaGenerator};
pub use advertise_manager::{
    clean_up, get, initialize, is_initialized, AdvertiseManager, AdvertiseManagerConfig,
    BigCreateReport, CreateBigCb, GetAddressCb, IdTxPowerStatusCb, InstanceState, MultiAdvCb,
    ParametersCb, RegisterCb, RegisterTimeoutCb, TerminateBigCb, TimeoutCb,
};
pub use hci::{
    AdvDataOp, AdvStatus, AdvertiseParameters, AdvertisingEvent, BleAdvertiserHciInterface,
    CreateBigParams, ExtendedAdvertisingParams, LePhy, OwnAddressType,
    PeriodicAdvertisingParameters, SetEnableData,
};
