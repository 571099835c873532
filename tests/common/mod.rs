//! Mocked HCI interface and helpers shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use btadv::address::{RawAddress, RpaGenerator};
use btadv::advertise_manager::{AdvertiseManager, AdvertiseManagerConfig};
use btadv::hci::{
    AdvDataOp, AdvStatus, AdvertiseParameters, BleAdvertiserHciInterface, CreateBigParams,
    ExtendedAdvertisingParams, PeriodicAdvertisingParameters, SetEnableData,
};

/// Every HCI command the manager issues, as observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum HciCommand {
    SetParameters { handle: u8, params: ExtendedAdvertisingParams },
    SetRandomAddress { handle: u8, address: RawAddress },
    SetAdvertisingData { handle: u8, operation: AdvDataOp, data: Vec<u8> },
    SetScanResponseData { handle: u8, operation: AdvDataOp, data: Vec<u8> },
    Enable { enable: bool, sets: Vec<SetEnableData> },
    SetPeriodicParameters { handle: u8, min_interval: u16, max_interval: u16, properties: u16 },
    SetPeriodicData { handle: u8, operation: AdvDataOp, data: Vec<u8> },
    SetPeriodicEnable { enable: u8, handle: u8 },
    RemoveAdvertisingSet { handle: u8 },
    CreateBig { big_handle: u8, advertising_handle: u8, params: CreateBigParams },
    TerminateBig { big_handle: u8, reason: u8 },
    LeRand,
}

/// Auto-responding mock controller. Records every command, streams it to
/// the test over a channel, and answers with SUCCESS unless a one-shot
/// failure was injected for that command kind. LE Rand output is a
/// deterministic counter so randomizer freshness is observable.
pub struct MockHci {
    tx: UnboundedSender<HciCommand>,
    commands: Mutex<Vec<HciCommand>>,
    failures: Mutex<HashMap<&'static str, AdvStatus>>,
    rand_counter: Mutex<u8>,
    instance_count: u8,
    selected_tx_power: i8,
    iso_broadcaster: bool,
    periodic_adi: bool,
}

impl MockHci {
    pub fn new(instance_count: u8) -> (Arc<MockHci>, UnboundedReceiver<HciCommand>) {
        MockHci::with_features(instance_count, true, true)
    }

    pub fn with_features(
        instance_count: u8,
        iso_broadcaster: bool,
        periodic_adi: bool,
    ) -> (Arc<MockHci>, UnboundedReceiver<HciCommand>) {
        let (tx, rx) = unbounded_channel();
        (
            Arc::new(MockHci {
                tx,
                commands: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                rand_counter: Mutex::new(0),
                instance_count,
                selected_tx_power: 9,
                iso_broadcaster,
                periodic_adi,
            }),
            rx,
        )
    }

    /// Makes the next command of the given kind complete with `status`.
    pub fn fail_next(&self, kind: &'static str, status: AdvStatus) {
        self.failures.lock().unwrap().insert(kind, status);
    }

    pub fn selected_tx_power(&self) -> i8 {
        self.selected_tx_power
    }

    pub fn commands(&self) -> Vec<HciCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn record(&self, command: HciCommand) {
        self.commands.lock().unwrap().push(command.clone());
        let _ = self.tx.send(command);
    }

    fn status_for(&self, kind: &'static str) -> AdvStatus {
        self.failures.lock().unwrap().remove(kind).unwrap_or(AdvStatus::SUCCESS)
    }
}

#[async_trait]
impl BleAdvertiserHciInterface for MockHci {
    async fn read_instance_count(&self) -> u8 {
        self.instance_count
    }

    fn supports_iso_broadcaster(&self) -> bool {
        self.iso_broadcaster
    }

    fn supports_periodic_advertising_adi(&self) -> bool {
        self.periodic_adi
    }

    async fn set_parameters(
        &self,
        handle: u8,
        params: ExtendedAdvertisingParams,
    ) -> (AdvStatus, i8) {
        self.record(HciCommand::SetParameters { handle, params });
        (self.status_for("set_parameters"), self.selected_tx_power)
    }

    async fn set_random_address(&self, handle: u8, address: RawAddress) -> AdvStatus {
        self.record(HciCommand::SetRandomAddress { handle, address });
        self.status_for("set_random_address")
    }

    async fn set_advertising_data(
        &self,
        handle: u8,
        operation: AdvDataOp,
        _fragment_preference: u8,
        data: &[u8],
    ) -> AdvStatus {
        self.record(HciCommand::SetAdvertisingData { handle, operation, data: data.to_vec() });
        self.status_for("set_advertising_data")
    }

    async fn set_scan_response_data(
        &self,
        handle: u8,
        operation: AdvDataOp,
        _fragment_preference: u8,
        data: &[u8],
    ) -> AdvStatus {
        self.record(HciCommand::SetScanResponseData { handle, operation, data: data.to_vec() });
        self.status_for("set_scan_response_data")
    }

    async fn enable(&self, enable: bool, sets: Vec<SetEnableData>) -> AdvStatus {
        self.record(HciCommand::Enable { enable, sets });
        self.status_for("enable")
    }

    async fn set_periodic_advertising_parameters(
        &self,
        handle: u8,
        min_interval: u16,
        max_interval: u16,
        properties: u16,
    ) -> AdvStatus {
        self.record(HciCommand::SetPeriodicParameters {
            handle,
            min_interval,
            max_interval,
            properties,
        });
        self.status_for("set_periodic_advertising_parameters")
    }

    async fn set_periodic_advertising_data(
        &self,
        handle: u8,
        operation: AdvDataOp,
        data: &[u8],
    ) -> AdvStatus {
        self.record(HciCommand::SetPeriodicData { handle, operation, data: data.to_vec() });
        self.status_for("set_periodic_advertising_data")
    }

    async fn set_periodic_advertising_enable(&self, enable: u8, handle: u8) -> AdvStatus {
        self.record(HciCommand::SetPeriodicEnable { enable, handle });
        self.status_for("set_periodic_advertising_enable")
    }

    async fn remove_advertising_set(&self, handle: u8) -> AdvStatus {
        self.record(HciCommand::RemoveAdvertisingSet { handle });
        self.status_for("remove_advertising_set")
    }

    async fn create_big(
        &self,
        big_handle: u8,
        advertising_handle: u8,
        params: CreateBigParams,
    ) -> AdvStatus {
        self.record(HciCommand::CreateBig { big_handle, advertising_handle, params });
        self.status_for("create_big")
    }

    async fn terminate_big(&self, big_handle: u8, reason: u8) -> AdvStatus {
        self.record(HciCommand::TerminateBig { big_handle, reason });
        self.status_for("terminate_big")
    }

    async fn le_rand(&self) -> [u8; 8] {
        self.record(HciCommand::LeRand);
        let mut counter = self.rand_counter.lock().unwrap();
        *counter = counter.wrapping_add(1);
        let base = *counter;
        std::array::from_fn(|i| base.wrapping_add(i as u8))
    }
}

/// Deterministic address source: each generated RPA differs only in its
/// last byte.
pub struct SeqRpaGenerator {
    counter: Mutex<u8>,
}

impl SeqRpaGenerator {
    pub fn new() -> Self {
        SeqRpaGenerator { counter: Mutex::new(0) }
    }
}

#[async_trait]
impl RpaGenerator for SeqRpaGenerator {
    async fn generate_rpa(&self) -> RawAddress {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        RawAddress { val: [0x40, 0x11, 0x22, 0x33, 0x44, *counter] }
    }
}

pub async fn build_manager(
    hci: Arc<MockHci>,
    config: AdvertiseManagerConfig,
) -> Arc<AdvertiseManager> {
    AdvertiseManager::new(hci, Arc::new(SeqRpaGenerator::new()), config).await
}

/// Starts a set with no periodic train and no encryption, returning the
/// started callback's `(inst_id, tx_power, status)`.
pub async fn start_simple_set(
    manager: &Arc<AdvertiseManager>,
    params: AdvertiseParameters,
    advertise_data: Vec<u8>,
    scan_response_data: Vec<u8>,
    duration: u16,
    max_ext_adv_events: u8,
) -> (u8, i8, AdvStatus) {
    start_set(
        manager,
        params,
        advertise_data,
        Vec::new(),
        scan_response_data,
        Vec::new(),
        PeriodicAdvertisingParameters::default(),
        Vec::new(),
        Vec::new(),
        duration,
        max_ext_adv_events,
        Vec::new(),
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn start_set(
    manager: &Arc<AdvertiseManager>,
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
) -> (u8, i8, AdvStatus) {
    let (tx, rx) = oneshot::channel();
    manager.start_advertising_set(
        params,
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
        Box::new(move |inst_id, tx_power, status| {
            let _ = tx.send((inst_id, tx_power, status));
        }),
        Box::new(|_, _| {}),
    );
    rx.await.expect("start callback dropped")
}

pub async fn next_command(rx: &mut UnboundedReceiver<HciCommand>) -> HciCommand {
    rx.recv().await.expect("hci command channel closed")
}

/// Receives commands until one matches, discarding the rest.
pub async fn next_matching<F>(rx: &mut UnboundedReceiver<HciCommand>, mut pred: F) -> HciCommand
where
    F: FnMut(&HciCommand) -> bool,
{
    loop {
        let command = rx.recv().await.expect("hci command channel closed");
        if pred(&command) {
            return command;
        }
    }
}
