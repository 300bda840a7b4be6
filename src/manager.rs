// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Implementation of the NFCEE lifecycle state machine.
//!
//! The manager owns the registry and the routing rules, sends commands to
//! the controller through an mpsc channel and advances when the matching
//! responses and notifications are handed back as events. It never blocks:
//! pending responses are tracked with wait flags and deadlines, and the
//! owner of the manager is in charge of firing the timeout events.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lmrt::{self, LmrtCapture, LmrtPacket, TlvEntry};
use crate::packets::{self, ControllerEvent, DiscoveryRequest, STATUS_OK};
use crate::registry::{Ecb, EeId, EeInfo, EeInterface, EeStatus, Registry, TechMask};
use crate::routing::{self, AidRule, PowerMasks, ProtocolMask, SystemCodeRule};
use crate::view;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Maximum number of registered listeners.
const MAX_LISTENERS: usize = 3;
/// Size of the More and Number of Routing Entries fields.
const ROUTING_PAYLOAD_HEADER_SIZE: u16 = 2;

/// State of the NFCEE manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EmState {
    Init,
    InitDone,
    Restoring,
    Disabling,
    Disabled,
}

impl EmState {
    /// Name of the state used in logs.
    pub fn name(self) -> &'static str {
        match self {
            EmState::Init => "INIT",
            EmState::InitDone => "INIT_DONE",
            EmState::Restoring => "RESTORING",
            EmState::Disabling => "DISABLING",
            EmState::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for EmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bit_mask! {
    /// Outstanding work tracked by the NFCEE manager.
    WaitFlags {
        /// The HCI subsystem has not completed its initialization.
        HCI = 0x01,
        DISCOVERY = 0x02,
        MODE_SET = 0x04,
        ROUTING = 0x08,
        CONNECTION = 0x10,
        POWER_LINK = 0x20,
    }
}

/// Power mode of the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerMode {
    /// The controller is fully powered and may have lost its routing.
    Full,
    /// The controller enters a low power mode.
    OffSleep,
}

/// Application requests.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub enum Request {
    Discover,
    Register(mpsc::UnboundedSender<Notification>),
    Deregister(mpsc::UnboundedSender<Notification>),
    ModeSet { id: EeId, enable: bool },
    SetTechnologyRouting { id: EeId, masks: PowerMasks<TechMask> },
    ClearTechnologyRouting { id: EeId, mask: TechMask },
    SetProtocolRouting { id: EeId, masks: PowerMasks<ProtocolMask> },
    ClearProtocolRouting { id: EeId, mask: ProtocolMask },
    AddAid { id: EeId, rule: AidRule },
    RemoveAid { aid: Vec<u8> },
    AddSystemCode { id: EeId, rule: SystemCodeRule },
    RemoveSystemCode { code: u16 },
    ClearRoutingTable { technology: bool, protocol: bool, system_code: bool },
    LmrtSize,
    UpdateNow,
    Connect { id: EeId, interface: EeInterface },
    SendData { id: EeId, data: Bytes },
    Disconnect { id: EeId },
    PowerAndLinkCtrl { id: EeId, config: u8 },
}

impl Request {
    /// Name of the request used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Discover => "API_DISCOVER",
            Request::Register(_) => "API_REGISTER",
            Request::Deregister(_) => "API_DEREGISTER",
            Request::ModeSet { .. } => "API_MODE_SET",
            Request::SetTechnologyRouting { .. } => "API_SET_TECH_CFG",
            Request::ClearTechnologyRouting { .. } => "API_CLEAR_TECH_CFG",
            Request::SetProtocolRouting { .. } => "API_SET_PROTO_CFG",
            Request::ClearProtocolRouting { .. } => "API_CLEAR_PROTO_CFG",
            Request::AddAid { .. } => "API_ADD_AID",
            Request::RemoveAid { .. } => "API_REMOVE_AID",
            Request::AddSystemCode { .. } => "API_ADD_SYSCODE",
            Request::RemoveSystemCode { .. } => "API_REMOVE_SYSCODE",
            Request::ClearRoutingTable { .. } => "API_CLEAR_ROUTING_TABLE",
            Request::LmrtSize => "API_LMRT_SIZE",
            Request::UpdateNow => "API_UPDATE_NOW",
            Request::Connect { .. } => "API_CONNECT",
            Request::SendData { .. } => "API_SEND_DATA",
            Request::Disconnect { .. } => "API_DISCONNECT",
            Request::PowerAndLinkCtrl { .. } => "API_PWR_AND_LINK_CTRL",
        }
    }
}

/// Events processed by the NFCEE manager.
#[derive(Clone, Debug)]
pub enum Event {
    /// Application request whose result is not awaited.
    Api(Request),
    /// Response, notification or data received from the controller.
    Nci(ControllerEvent),
    /// The controller completed its initialization.
    ControllerEnabled,
    /// The NFC stack is shutting down.
    DisableRequested,
    /// The HCI subsystem completed its pending work.
    CompanionDone,
    PowerModeChanged(PowerMode),
    RoutingTimeout,
    DiscoveryTimeout,
}

impl Event {
    /// Name of the event used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Api(request) => request.name(),
            Event::Nci(event) => match event {
                ControllerEvent::RoutingRsp { .. }
                | ControllerEvent::PowerAndLinkCtrlRsp { .. } => "NCI_WAIT_RSP",
                ControllerEvent::DiscoverRsp { .. } => "NCI_DISC_RSP",
                ControllerEvent::DiscoverNtf(_) | ControllerEvent::StatusNtf { .. } => {
                    "NCI_DISC_NTF"
                }
                ControllerEvent::ModeSetRsp { .. } => "NCI_MODE_SET",
                ControllerEvent::ConnCreateRsp { .. } | ControllerEvent::ConnCloseRsp { .. } => {
                    "NCI_CONN"
                }
                ControllerEvent::Data { .. } => "NCI_DATA",
                ControllerEvent::ActionNtf { .. } => "NCI_ACTION",
                ControllerEvent::DiscoveryReqNtf(_) => "NCI_DISC_REQ",
            },
            Event::ControllerEnabled => "SYS_ENABLE",
            Event::DisableRequested => "SYS_DISABLE",
            Event::CompanionDone => "HCI_DONE",
            Event::PowerModeChanged(_) => "PWR_CONTROL",
            Event::RoutingTimeout => "ROUT_TIMEOUT",
            Event::DiscoveryTimeout => "DISCV_TIMEOUT",
        }
    }
}

/// Notifications delivered to the registered listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Notification {
    Enabled,
    Disabled,
    Discovered(Vec<EeInfo>),
    StatusChanged(EeInfo),
    ModeSet { id: EeId, enable: bool, result: Result<()> },
    UpdateDone,
    UpdateFailed(Error),
    Restored,
    LmrtRemainingSize(u16),
    Connected { id: EeId, result: Result<u8> },
    Disconnected { id: EeId },
    Data { id: EeId, payload: Bytes },
    Action { id: EeId, trigger: u8, data: Vec<u8> },
    PowerAndLinkCtrl { result: Result<()> },
    /// A queued or fire-and-forget request failed.
    RequestFailed(Error),
}

/// Routing table commit in flight.
#[derive(Debug)]
struct Commit {
    table: Vec<TlvEntry>,
    commands: Vec<Vec<u8>>,
    next: usize,
}

#[derive(Debug)]
struct Discovery {
    expected: Option<u8>,
    reported: usize,
    on_enable: bool,
}

/// State of the NFCEE manager.
pub struct EeManager {
    config: Config,
    state: EmState,
    flags: WaitFlags,
    registry: Registry,
    nci_tx: mpsc::UnboundedSender<Vec<u8>>,
    listeners: Vec<mpsc::UnboundedSender<Notification>>,
    /// Requests received before the end of the initialization.
    pending: VecDeque<Request>,
    commit: Option<Commit>,
    recommit: bool,
    /// Last routing table acknowledged by the controller.
    committed: Vec<TlvEntry>,
    capture: LmrtCapture,
    discovery: Option<Discovery>,
    discover_pending: bool,
    mode_set: Option<(EeId, bool)>,
    mode_set_queue: VecDeque<(EeId, bool)>,
    /// NFCEEs deactivated by the last low power transition.
    restore_mask: u32,
    /// NFCEEs whose mode set is outstanding during the restore.
    restore_pending: u32,
    connecting: Option<EeId>,
    disconnecting: Option<EeId>,
    routing_deadline: Option<Instant>,
    /// End of the quiet period following a commit timeout. Late responses
    /// to the abandoned packet are dropped until then.
    quiet_until: Option<Instant>,
    discovery_deadline: Option<Instant>,
}

impl EeManager {
    /// Create a manager sending its commands on `nci_tx`.
    pub fn new(config: Config, nci_tx: mpsc::UnboundedSender<Vec<u8>>) -> EeManager {
        EeManager {
            config,
            state: EmState::Init,
            flags: WaitFlags::NONE,
            registry: Registry::new(),
            nci_tx,
            listeners: vec![],
            pending: VecDeque::new(),
            commit: None,
            recommit: false,
            committed: vec![],
            capture: LmrtCapture::new(),
            discovery: None,
            discover_pending: false,
            mode_set: None,
            mode_set_queue: VecDeque::new(),
            restore_mask: 0,
            restore_pending: 0,
            connecting: None,
            disconnecting: None,
            routing_deadline: None,
            quiet_until: None,
            discovery_deadline: None,
        }
    }

    pub fn state(&self) -> EmState {
        self.state
    }

    pub fn flags(&self) -> WaitFlags {
        self.flags
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Routing table last acknowledged by the controller.
    pub fn committed_table(&self) -> &[TlvEntry] {
        &self.committed
    }

    /// History of the routing commands sent to the controller.
    pub fn capture(&self) -> &LmrtCapture {
        &self.capture
    }

    /// Return true while a routing table commit is in flight.
    pub fn is_committing(&self) -> bool {
        self.commit.is_some()
    }

    /// Listen Mode Routing Table capacity of the controller.
    pub fn max_table_size(&self) -> u16 {
        self.config.max_routing_table_size
    }

    /// Space left in the routing table for the current rules.
    pub fn lmrt_remaining_size(&self) -> u16 {
        let size = lmrt::encoded_size(&self.registry.encode_canonical_table());
        self.max_table_size().saturating_sub(u16::try_from(size).unwrap_or(u16::MAX))
    }

    /// Display names and listen technologies of the active NFCEEs.
    pub fn active_environments(&self) -> HashMap<String, TechMask> {
        view::compute_active_environments(&self.config, &self.registry)
    }

    /// Presence information of the discovered NFCEEs.
    pub fn ee_info(&self) -> Result<Vec<EeInfo>> {
        match self.state {
            EmState::InitDone | EmState::Restoring => Ok(self.registry.info()),
            state => Err(Error::WrongState(state)),
        }
    }

    /// Return the earliest pending deadline and the event to handle when
    /// it expires.
    pub fn next_timeout(&self) -> Option<(Instant, Event)> {
        match (self.routing_deadline.or(self.quiet_until), self.discovery_deadline) {
            (Some(routing), Some(discovery)) if discovery < routing => {
                Some((discovery, Event::DiscoveryTimeout))
            }
            (Some(routing), _) => Some((routing, Event::RoutingTimeout)),
            (None, Some(discovery)) => Some((discovery, Event::DiscoveryTimeout)),
            (None, None) => None,
        }
    }

    fn send(&self, command: Vec<u8>) {
        if self.nci_tx.send(command).is_err() {
            error!("nci channel closed, dropping command");
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.listeners.retain(|listener| listener.send(notification.clone()).is_ok());
    }

    /// Handle an event. Failures of application requests are reported to
    /// the listeners.
    pub fn handle(&mut self, event: Event) {
        if let Event::Api(request) = event {
            if let Err(err) = self.request(request) {
                warn!("request failed: {}", err);
                self.notify(Notification::RequestFailed(err));
            }
            return;
        }

        debug!("{} in state {}", event.name(), self.state);
        match event {
            Event::Api(_) => (),
            Event::Nci(event) => self.controller_event(event),
            Event::ControllerEnabled => self.enable(),
            Event::DisableRequested => self.disable(),
            Event::CompanionDone => self.companion_done(),
            Event::PowerModeChanged(mode) => self.power_mode(mode),
            Event::RoutingTimeout if self.commit.is_some() => {
                warn!("routing table commit timed out");
                self.finish_commit(Err(Error::CommitTimeout))
            }
            Event::RoutingTimeout => self.end_quiet_period(),
            Event::DiscoveryTimeout => {
                warn!("nfcee discovery timed out");
                self.finish_discovery()
            }
        }
    }

    /// Handle an application request. The result reflects the acceptance
    /// of the request, not the completion of the resulting commands.
    pub fn request(&mut self, request: Request) -> Result<()> {
        debug!("{} in state {}", request.name(), self.state);
        match request {
            request @ (Request::Register(_) | Request::Deregister(_)) => self.process(request),
            request => match self.state {
                EmState::Init => {
                    self.check_params(&request)?;
                    debug!("queueing {} until initialization completes", request.name());
                    self.pending.push_back(request);
                    Ok(())
                }
                EmState::InitDone | EmState::Restoring => self.process(request),
                state => Err(Error::WrongState(state)),
            },
        }
    }

    fn process(&mut self, request: Request) -> Result<()> {
        match request {
            Request::Register(listener) => self.register(listener),
            Request::Deregister(listener) => {
                self.listeners.retain(|existing| !existing.same_channel(&listener));
                Ok(())
            }
            Request::Discover => {
                self.discover();
                Ok(())
            }
            Request::ModeSet { id, enable } => self.mode_set(id, enable),
            Request::SetTechnologyRouting { id, masks } => {
                self.registry.set_technology_routing(id, masks)
            }
            Request::ClearTechnologyRouting { id, mask } => {
                self.registry.clear_technology_routing(id, mask)
            }
            Request::SetProtocolRouting { id, masks } => {
                self.registry.set_protocol_routing(id, masks)
            }
            Request::ClearProtocolRouting { id, mask } => {
                self.registry.clear_protocol_routing(id, mask)
            }
            Request::AddAid { id, rule } => self.registry.add_aid(id, rule),
            Request::RemoveAid { aid } => self.registry.remove_aid(&aid).map(|_| ()),
            Request::AddSystemCode { id, rule } => {
                self.check_system_code(rule.code)?;
                self.registry.add_system_code(id, rule)
            }
            Request::RemoveSystemCode { code } => {
                self.check_system_code(code)?;
                self.registry.remove_system_code(code).map(|_| ())
            }
            Request::ClearRoutingTable { technology, protocol, system_code } => {
                self.registry.clear_routing_table(technology, protocol, system_code);
                Ok(())
            }
            Request::LmrtSize => {
                let size = self.lmrt_remaining_size();
                self.notify(Notification::LmrtRemainingSize(size));
                Ok(())
            }
            Request::UpdateNow => self.update_now(),
            Request::Connect { id, interface } => self.connect(id, interface),
            Request::SendData { id, data } => self.send_data(id, &data),
            Request::Disconnect { id } => self.disconnect(id),
            Request::PowerAndLinkCtrl { id, config } => {
                self.controller_target(id)?;
                self.flags |= WaitFlags::POWER_LINK;
                self.send(packets::nfcee_power_and_link_ctrl_cmd(id, config));
                Ok(())
            }
        }
    }

    fn register(&mut self, listener: mpsc::UnboundedSender<Notification>) -> Result<()> {
        if self.listeners.iter().any(|existing| existing.same_channel(&listener)) {
            return Ok(());
        }
        self.listeners.retain(|existing| !existing.is_closed());
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(Error::InvalidParam("too many listeners"));
        }
        self.listeners.push(listener);
        Ok(())
    }

    /// Reject the requests whose parameters are invalid whatever the
    /// state of the registry.
    fn check_params(&self, request: &Request) -> Result<()> {
        match request {
            Request::AddAid { rule, .. } => routing::check_aid(&rule.aid),
            Request::RemoveAid { aid } => routing::check_aid(aid),
            Request::AddSystemCode { rule, .. } => self.check_system_code(rule.code),
            Request::RemoveSystemCode { code } => self.check_system_code(*code),
            Request::SendData { data, .. } if data.is_empty() => {
                Err(Error::InvalidParam("data must not be empty"))
            }
            _ => Ok(()),
        }
    }

    fn check_system_code(&self, code: u16) -> Result<()> {
        if code == 0 {
            return Err(Error::InvalidParam("system code must not be zero"));
        }
        if !self.config.system_code_supported() {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    /// Return the controller NFCEE targeted by a command.
    fn controller_target(&mut self, id: EeId) -> Result<&mut Ecb> {
        match self.registry.find_by_id_mut(id) {
            Some(ecb) if !ecb.is_host() && ecb.status != EeStatus::Removed => Ok(ecb),
            _ => Err(Error::BadHandle(id)),
        }
    }

    fn controller_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::RoutingRsp { status } => self.routing_rsp(status),
            ControllerEvent::DiscoverRsp { status, num_ee } => self.discover_rsp(status, num_ee),
            ControllerEvent::DiscoverNtf(info) => self.discover_ntf(info),
            ControllerEvent::ModeSetRsp { status } => self.mode_set_rsp(status),
            ControllerEvent::StatusNtf { id, status } => self.status_ntf(id, status),
            ControllerEvent::PowerAndLinkCtrlRsp { status } => {
                self.flags = self.flags.without(WaitFlags::POWER_LINK);
                let result =
                    if status == STATUS_OK { Ok(()) } else { Err(Error::Rejected(status)) };
                self.notify(Notification::PowerAndLinkCtrl { result })
            }
            ControllerEvent::ConnCreateRsp { status, conn_id } => {
                self.conn_create_rsp(status, conn_id)
            }
            ControllerEvent::ConnCloseRsp { status } => self.conn_close_rsp(status),
            ControllerEvent::Data { conn_id, payload } => {
                match self.registry.find_by_conn_id(conn_id) {
                    Some(ecb) => {
                        let id = ecb.id;
                        self.notify(Notification::Data { id, payload })
                    }
                    None => warn!("dropping data received on unknown connection {}", conn_id),
                }
            }
            ControllerEvent::ActionNtf { id, trigger, data } => {
                self.notify(Notification::Action { id, trigger, data })
            }
            ControllerEvent::DiscoveryReqNtf(requests) => self.discovery_req_ntf(&requests),
        }
    }

    fn enable(&mut self) {
        match self.state {
            EmState::Init => (),
            EmState::Disabled => {
                info!("re-initializing the nfcee manager");
                self.registry.init();
                self.state = EmState::Init;
            }
            state => {
                warn!("ignoring controller enable in state {}", state);
                return;
            }
        }
        if self.config.hci_network {
            self.flags |= WaitFlags::HCI;
        }
        if self.config.max_ee == 0 {
            self.init_done()
        } else {
            self.start_discovery(true)
        }
    }

    fn init_done(&mut self) {
        self.state = EmState::InitDone;
        info!("nfcee manager ready, {} nfcee(s) present", self.registry.present_count());
        self.notify(Notification::Enabled);

        for request in std::mem::take(&mut self.pending) {
            let name = request.name();
            if let Err(err) = self.process(request) {
                warn!("queued {} failed: {}", name, err);
                self.notify(Notification::RequestFailed(err));
            }
        }
    }

    fn disable(&mut self) {
        if matches!(self.state, EmState::Disabling | EmState::Disabled) {
            debug!("already {}", self.state);
            return;
        }
        self.cancel_pending_work();
        if self.flags.contains(WaitFlags::HCI) {
            info!("waiting for the hci subsystem before disabling");
            self.state = EmState::Disabling;
        } else {
            self.disabled()
        }
    }

    fn cancel_pending_work(&mut self) {
        if self.commit.take().is_some() {
            warn!("abandoning the routing table commit in flight");
        }
        self.recommit = false;
        self.discovery = None;
        self.discover_pending = false;
        self.mode_set = None;
        self.mode_set_queue.clear();
        self.restore_mask = 0;
        self.restore_pending = 0;
        self.connecting = None;
        self.disconnecting = None;
        self.pending.clear();
        self.routing_deadline = None;
        self.quiet_until = None;
        self.discovery_deadline = None;
        self.flags = self.flags & WaitFlags::HCI;
    }

    fn disabled(&mut self) {
        self.state = EmState::Disabled;
        self.registry.init();
        self.committed.clear();
        info!("nfcee manager disabled");
        self.notify(Notification::Disabled)
    }

    fn companion_done(&mut self) {
        self.flags = self.flags.without(WaitFlags::HCI);
        if self.state == EmState::Disabling {
            self.disabled()
        }
    }

    fn discover(&mut self) {
        if self.state == EmState::Restoring || self.discovery.is_some() {
            debug!("coalescing nfcee discovery");
            self.discover_pending = true;
            return;
        }
        self.start_discovery(false)
    }

    fn start_discovery(&mut self, on_enable: bool) {
        self.discovery = Some(Discovery { expected: None, reported: 0, on_enable });
        self.flags |= WaitFlags::DISCOVERY;
        self.discovery_deadline = Some(Instant::now() + self.config.discovery_timeout());
        self.send(packets::nfcee_discover_cmd(self.config.nci_version))
    }

    fn discover_rsp(&mut self, status: u8, num_ee: u8) {
        let Some(discovery) = self.discovery.as_mut() else {
            warn!("unexpected nfcee discover response");
            return;
        };
        if status != STATUS_OK {
            warn!("nfcee discovery failed with status {:#04x}", status);
            return self.finish_discovery();
        }
        debug!("{} nfcee(s) announced", num_ee);
        discovery.expected = Some(num_ee);
        if discovery.reported >= num_ee as usize {
            self.finish_discovery()
        }
    }

    fn discover_ntf(&mut self, info: EeInfo) {
        let info = self.apply_presence(info);
        match self.discovery.as_mut() {
            Some(discovery) => {
                discovery.reported += 1;
                let expected = discovery.expected.map(usize::from);
                if expected.is_some_and(|expected| discovery.reported >= expected) {
                    self.finish_discovery()
                }
            }
            None => self.notify(Notification::StatusChanged(info)),
        }
    }

    /// Refresh the presence of an NFCEE. Discovery does not report the
    /// listen technologies, the known ones are kept.
    fn apply_presence(&mut self, mut info: EeInfo) -> EeInfo {
        if let Some(ecb) = self.registry.find_by_id(info.id) {
            info.tech_mask |= ecb.tech_mask;
        }
        self.registry.apply_discovery_result(std::slice::from_ref(&info));
        if info.status == EeStatus::Removed {
            self.clear_ecb(info.id);
            info.tech_mask = TechMask::NONE;
        }
        info
    }

    fn clear_ecb(&mut self, id: EeId) {
        if let Some(ecb) = self.registry.find_by_id_mut(id) {
            let had_rules = !ecb.rules.is_empty();
            ecb.clear_config();
            ecb.tech_mask = TechMask::NONE;
            if had_rules {
                self.registry.set_dirty(true);
            }
        }
    }

    fn finish_discovery(&mut self) {
        let Some(discovery) = self.discovery.take() else {
            return;
        };
        self.flags = self.flags.without(WaitFlags::DISCOVERY);
        self.discovery_deadline = None;
        info!("nfcee discovery complete, {} nfcee(s) present", self.registry.present_count());
        self.notify(Notification::Discovered(self.registry.info()));

        if discovery.on_enable && self.state == EmState::Init {
            self.init_done()
        } else if self.state == EmState::InitDone && std::mem::take(&mut self.discover_pending) {
            self.start_discovery(false)
        }
    }

    fn status_ntf(&mut self, id: EeId, status: EeStatus) {
        let Some(ecb) = self.registry.find_by_id_mut(id) else {
            warn!("status notification for unknown nfcee {:#04x}", id);
            return;
        };
        ecb.status = status;
        if status == EeStatus::Removed {
            self.clear_ecb(id);
        }
        if let Some(ecb) = self.registry.find_by_id(id) {
            let info = ecb.info();
            self.notify(Notification::StatusChanged(info))
        }
    }

    fn discovery_req_ntf(&mut self, requests: &[DiscoveryRequest]) {
        for request in requests {
            let Some(ecb) = self.registry.find_by_id_mut(request.id) else {
                warn!("discovery request for unknown nfcee {:#04x}", request.id);
                continue;
            };
            ecb.tech_mask = if request.add {
                ecb.tech_mask | request.technology
            } else {
                ecb.tech_mask.without(request.technology)
            };
            debug!("nfcee {:#04x} listen technologies {:#04x}", ecb.id, ecb.tech_mask.0);
        }
    }

    fn mode_set(&mut self, id: EeId, enable: bool) -> Result<()> {
        self.controller_target(id)?;
        if self.mode_set.is_some() {
            self.mode_set_queue.push_back((id, enable));
        } else {
            self.send_mode_set(id, enable);
        }
        Ok(())
    }

    fn send_mode_set(&mut self, id: EeId, enable: bool) {
        self.mode_set = Some((id, enable));
        self.flags |= WaitFlags::MODE_SET;
        self.send(packets::nfcee_mode_set_cmd(id, enable))
    }

    fn mode_set_rsp(&mut self, status: u8) {
        let Some((id, enable)) = self.mode_set.take() else {
            warn!("unexpected nfcee mode set response");
            return;
        };
        self.flags = self.flags.without(WaitFlags::MODE_SET);

        let result = if status == STATUS_OK {
            if let Some(ecb) = self.registry.find_by_id_mut(id) {
                ecb.status = if enable { EeStatus::Active } else { EeStatus::Inactive };
            }
            if !enable {
                self.clear_ecb(id);
            }
            Ok(())
        } else {
            warn!("mode set of nfcee {:#04x} failed with status {:#04x}", id, status);
            Err(Error::Rejected(status))
        };
        if let Some(ecb) = self.registry.find_by_id(id) {
            self.restore_pending &= !ecb.to_mask();
        }
        self.notify(Notification::ModeSet { id, enable, result });

        if let Some((id, enable)) = self.mode_set_queue.pop_front() {
            self.send_mode_set(id, enable)
        } else if self.state == EmState::Restoring && self.restore_pending == 0 {
            self.restore_routing()
        }
    }

    fn power_mode(&mut self, mode: PowerMode) {
        match mode {
            PowerMode::OffSleep => {
                for ecb in self.registry.iter_mut() {
                    if !ecb.is_host() && ecb.status == EeStatus::Active {
                        self.restore_mask |= ecb.to_mask();
                        ecb.status = EeStatus::Inactive;
                    }
                }
            }
            PowerMode::Full => {
                if self.state != EmState::InitDone {
                    debug!("ignoring power mode full in state {}", self.state);
                    return;
                }
                self.state = EmState::Restoring;
                let targets: Vec<(EeId, u32)> = self
                    .registry
                    .iter()
                    .filter(|ecb| !ecb.is_host() && ecb.status != EeStatus::Removed)
                    .filter(|ecb| {
                        ecb.status == EeStatus::Active || self.restore_mask & ecb.to_mask() != 0
                    })
                    .map(|ecb| (ecb.id, ecb.to_mask()))
                    .collect();
                self.restore_mask = 0;
                info!("restoring {} nfcee(s)", targets.len());

                for (id, mask) in targets {
                    self.restore_pending |= mask;
                    if self.mode_set.is_some() {
                        self.mode_set_queue.push_back((id, true));
                    } else {
                        self.send_mode_set(id, true);
                    }
                }
                if self.restore_pending == 0 {
                    self.restore_routing()
                }
            }
        }
    }

    /// Resend the whole routing table after the NFCEEs are restored.
    fn restore_routing(&mut self) {
        self.registry.set_dirty(true);
        if self.commit.is_some() || self.quiet_until.is_some() {
            self.recommit = true;
        } else if self.start_commit().is_err() {
            self.check_restore_complete()
        }
    }

    fn check_restore_complete(&mut self) {
        if self.state == EmState::Restoring
            && self.restore_pending == 0
            && self.mode_set.is_none()
            && self.commit.is_none()
            && self.quiet_until.is_none()
        {
            self.state = EmState::InitDone;
            info!("nfcee restore complete");
            self.notify(Notification::Restored);
            if std::mem::take(&mut self.discover_pending) {
                self.start_discovery(false)
            }
        }
    }

    fn update_now(&mut self) -> Result<()> {
        if self.commit.is_some() || self.quiet_until.is_some() {
            debug!("routing table commit in flight, coalescing update");
            self.recommit = true;
            return Ok(());
        }
        self.start_commit()
    }

    fn prepare_commit(&self, table: &[TlvEntry]) -> Result<Vec<Vec<u8>>> {
        let size = lmrt::encoded_size(table);
        let max = self.max_table_size() as usize;
        if size > max {
            return Err(Error::TableFull { size, max });
        }
        let max_size = (self.config.max_control_packet_payload_size as u16)
            .saturating_sub(ROUTING_PAYLOAD_HEADER_SIZE);
        lmrt::split(table, max_size)?.iter().map(LmrtPacket::to_command).collect()
    }

    fn start_commit(&mut self) -> Result<()> {
        let table = self.registry.encode_canonical_table();
        let commands = match self.prepare_commit(&table) {
            Ok(commands) => commands,
            Err(err) => {
                error!("cannot commit the routing table: {}", err);
                self.notify(Notification::UpdateFailed(err.clone()));
                return Err(err);
            }
        };
        info!("committing {} routing entries in {} packet(s)", table.len(), commands.len());
        self.registry.set_dirty(false);
        self.commit = Some(Commit { table, commands, next: 0 });
        self.flags |= WaitFlags::ROUTING;
        self.send_next_packet();
        Ok(())
    }

    fn send_next_packet(&mut self) {
        let Some(command) =
            self.commit.as_ref().and_then(|commit| commit.commands.get(commit.next)).cloned()
        else {
            return;
        };
        if let Err(err) = self.capture.capture(&command) {
            debug!("lmrt capture skipped: {}", err);
        }
        self.routing_deadline = Some(Instant::now() + self.config.routing_timeout());
        self.send(command)
    }

    fn routing_rsp(&mut self, status: u8) {
        let Some(commit) = self.commit.as_mut() else {
            warn!("unexpected routing response");
            return;
        };
        self.routing_deadline = None;
        if status != STATUS_OK {
            return self.finish_commit(Err(Error::Rejected(status)));
        }
        commit.next += 1;
        if commit.next < commit.commands.len() {
            self.send_next_packet()
        } else {
            self.finish_commit(Ok(()))
        }
    }

    fn finish_commit(&mut self, result: Result<()>) {
        let Some(commit) = self.commit.take() else {
            return;
        };
        self.flags = self.flags.without(WaitFlags::ROUTING);
        self.routing_deadline = None;
        let timed_out = matches!(result, Err(Error::CommitTimeout));
        match result {
            Ok(()) => {
                info!("routing table committed");
                self.committed = commit.table;
                self.notify(Notification::UpdateDone)
            }
            Err(err) => {
                error!("routing table commit failed: {}", err);
                self.registry.set_dirty(true);
                self.notify(Notification::UpdateFailed(err))
            }
        }

        if timed_out {
            // The controller may still answer the abandoned packet.
            self.quiet_until = Some(Instant::now() + self.config.routing_timeout());
            return;
        }
        if std::mem::take(&mut self.recommit) {
            // Failures are reported by start_commit.
            let _ = self.start_commit();
        }
        self.check_restore_complete()
    }

    fn end_quiet_period(&mut self) {
        if self.quiet_until.take().is_none() {
            return;
        }
        debug!("routing quiet period over");
        if std::mem::take(&mut self.recommit) {
            let _ = self.start_commit();
        }
        self.check_restore_complete()
    }

    fn connect(&mut self, id: EeId, interface: EeInterface) -> Result<()> {
        if self.connecting.is_some() {
            return Err(Error::InvalidParam("connection request already pending"));
        }
        if self.controller_target(id)?.conn_id.is_some() {
            return Err(Error::InvalidParam("nfcee is already connected"));
        }
        self.connecting = Some(id);
        self.flags |= WaitFlags::CONNECTION;
        self.send(packets::core_conn_create_cmd(id, interface));
        Ok(())
    }

    fn connection_of(&self, id: EeId) -> Result<u8> {
        self.registry.find_by_id(id).and_then(|ecb| ecb.conn_id).ok_or(Error::BadHandle(id))
    }

    fn send_data(&mut self, id: EeId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParam("data must not be empty"));
        }
        let conn_id = self.connection_of(id)?;
        self.send(packets::data_packet(conn_id, data));
        Ok(())
    }

    fn disconnect(&mut self, id: EeId) -> Result<()> {
        if self.disconnecting.is_some() {
            return Err(Error::InvalidParam("disconnection request already pending"));
        }
        let conn_id = self.connection_of(id)?;
        self.disconnecting = Some(id);
        self.send(packets::core_conn_close_cmd(conn_id));
        Ok(())
    }

    fn conn_create_rsp(&mut self, status: u8, conn_id: u8) {
        let Some(id) = self.connecting.take() else {
            warn!("unexpected connection create response");
            return;
        };
        self.flags = self.flags.without(WaitFlags::CONNECTION);
        let result = if status == STATUS_OK {
            if let Some(ecb) = self.registry.find_by_id_mut(id) {
                ecb.conn_id = Some(conn_id);
            }
            Ok(conn_id)
        } else {
            Err(Error::Rejected(status))
        };
        self.notify(Notification::Connected { id, result })
    }

    fn conn_close_rsp(&mut self, status: u8) {
        let Some(id) = self.disconnecting.take() else {
            warn!("unexpected connection close response");
            return;
        };
        if status != STATUS_OK {
            warn!("connection close of nfcee {:#04x} returned status {:#04x}", id, status);
        }
        if let Some(ecb) = self.registry.find_by_id_mut(id) {
            ecb.conn_id = None;
        }
        self.notify(Notification::Disconnected { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::NciVersion;
    use crate::registry::HOST_ID;
    use crate::routing::{AidInfo, PowerState};

    struct Fixture {
        manager: EeManager,
        nci_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        notifications: mpsc::UnboundedReceiver<Notification>,
    }

    impl Fixture {
        fn new(config: Config) -> Fixture {
            let (nci_tx, nci_rx) = mpsc::unbounded_channel();
            let (listener, notifications) = mpsc::unbounded_channel();
            let mut manager = EeManager::new(config, nci_tx);
            manager.request(Request::Register(listener)).unwrap();
            Fixture { manager, nci_rx, notifications }
        }

        /// Manager initialized without NFCEE discovery.
        fn enabled(config: Config) -> Fixture {
            let mut fixture = Fixture::new(config);
            fixture.manager.handle(Event::ControllerEnabled);
            assert_eq!(fixture.manager.state(), EmState::InitDone);
            fixture.notifications();
            fixture
        }

        fn sent(&mut self) -> Vec<Vec<u8>> {
            let mut commands = vec![];
            while let Ok(command) = self.nci_rx.try_recv() {
                commands.push(command);
            }
            commands
        }

        fn notifications(&mut self) -> Vec<Notification> {
            let mut notifications = vec![];
            while let Ok(notification) = self.notifications.try_recv() {
                notifications.push(notification);
            }
            notifications
        }

        fn nci(&mut self, event: ControllerEvent) {
            self.manager.handle(Event::Nci(event))
        }

        fn discover(&mut self, id: EeId, status: EeStatus) {
            self.nci(ControllerEvent::DiscoverNtf(EeInfo {
                id,
                status,
                interface: EeInterface::Apdu,
                tech_mask: TechMask::NONE,
            }))
        }
    }

    fn aid(bytes: &[u8]) -> AidRule {
        AidRule { aid: bytes.to_vec(), power: PowerState::SWITCHED_ON, info: AidInfo::NONE }
    }

    fn technology(id: EeId, mask: TechMask) -> Request {
        Request::SetTechnologyRouting { id, masks: PowerMasks::switch_on(mask) }
    }

    fn connect(id: EeId) -> Request {
        Request::Connect { id, interface: EeInterface::Apdu }
    }

    #[test]
    fn state_names() {
        assert_eq!(EmState::InitDone.to_string(), "INIT_DONE");
        assert_eq!(Event::RoutingTimeout.name(), "ROUT_TIMEOUT");
        assert_eq!(Event::Api(Request::UpdateNow).name(), "API_UPDATE_NOW");
        assert_eq!(
            Event::Nci(ControllerEvent::RoutingRsp { status: 0 }).name(),
            "NCI_WAIT_RSP"
        );
    }

    #[test]
    fn enable_without_nfcee_is_immediate() {
        let mut fixture = Fixture::new(Config::default());
        assert_eq!(fixture.manager.ee_info(), Err(Error::WrongState(EmState::Init)));
        fixture.manager.handle(Event::ControllerEnabled);
        assert_eq!(fixture.manager.state(), EmState::InitDone);
        assert!(fixture.sent().is_empty());
        assert_eq!(fixture.notifications(), vec![Notification::Enabled]);
        assert_eq!(fixture.manager.ee_info(), Ok(vec![]));
    }

    #[test]
    fn requests_are_replayed_after_discovery() {
        let mut fixture = Fixture::new(Config { max_ee: 1, ..Default::default() });
        fixture.manager.handle(Event::ControllerEnabled);
        assert_eq!(fixture.sent(), vec![vec![0x22, 0x00, 0x00]]);
        assert!(fixture.manager.flags().contains(WaitFlags::DISCOVERY));

        fixture
            .manager
            .request(Request::AddAid { id: HOST_ID, rule: aid(&[0xa0, 0x00, 0x00, 0x00, 0x03]) })
            .unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        assert!(fixture.sent().is_empty());

        fixture.nci(ControllerEvent::DiscoverRsp { status: 0, num_ee: 1 });
        assert_eq!(fixture.manager.state(), EmState::Init);
        fixture.discover(0x86, EeStatus::Active);

        assert_eq!(fixture.manager.state(), EmState::InitDone);
        assert!(fixture.manager.next_timeout().is_some());
        assert_eq!(
            fixture.sent(),
            vec![vec![
                0x21, 0x01, 0x0b, 0x00, 0x01, 0x02, 0x07, 0x00, 0x01, 0xa0, 0x00, 0x00, 0x00, 0x03
            ]]
        );
        let notifications = fixture.notifications();
        assert_eq!(notifications[1], Notification::Enabled);
        assert!(matches!(&notifications[0], Notification::Discovered(infos) if infos.len() == 1));
    }

    #[test]
    fn discovery_timeout_completes_initialization() {
        let mut fixture = Fixture::new(Config { max_ee: 2, ..Default::default() });
        fixture.manager.handle(Event::ControllerEnabled);
        let (_, event) = fixture.manager.next_timeout().unwrap();
        assert!(matches!(event, Event::DiscoveryTimeout));

        fixture.manager.handle(event);
        assert_eq!(fixture.manager.state(), EmState::InitDone);
        assert!(fixture.manager.next_timeout().is_none());
        assert!(!fixture.manager.flags().contains(WaitFlags::DISCOVERY));
    }

    #[test]
    fn disable_without_companion_work() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.manager.handle(Event::DisableRequested);
        assert_eq!(fixture.manager.state(), EmState::Disabled);
        assert_eq!(fixture.notifications(), vec![Notification::Disabled]);
        assert_eq!(
            fixture.manager.request(Request::UpdateNow),
            Err(Error::WrongState(EmState::Disabled))
        );
    }

    #[test]
    fn disable_waits_for_companion_work() {
        let mut fixture = Fixture::enabled(Config { hci_network: true, ..Default::default() });
        fixture.manager.handle(Event::DisableRequested);
        assert_eq!(fixture.manager.state(), EmState::Disabling);
        assert!(fixture.notifications().is_empty());

        fixture.manager.handle(Event::CompanionDone);
        assert_eq!(fixture.manager.state(), EmState::Disabled);
        assert_eq!(fixture.notifications(), vec![Notification::Disabled]);
    }

    #[test]
    fn disable_cancels_commit_deadline() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        assert!(fixture.manager.next_timeout().is_some());

        fixture.manager.handle(Event::DisableRequested);
        assert!(fixture.manager.next_timeout().is_none());
        assert!(!fixture.manager.is_committing());
    }

    #[test]
    fn commit_waits_for_each_packet() {
        // Room for a single technology entry per packet.
        let config = Config { max_control_packet_payload_size: 8, ..Default::default() };
        let mut fixture = Fixture::enabled(config);
        fixture.manager.request(technology(HOST_ID, TechMask::A | TechMask::B)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();

        assert_eq!(
            fixture.sent(),
            vec![vec![0x21, 0x01, 0x07, 0x01, 0x01, 0x00, 0x03, 0x00, 0x01, 0x00]]
        );
        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert_eq!(
            fixture.sent(),
            vec![vec![0x21, 0x01, 0x07, 0x00, 0x01, 0x00, 0x03, 0x00, 0x01, 0x01]]
        );
        assert!(fixture.notifications().is_empty());

        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert_eq!(fixture.notifications(), vec![Notification::UpdateDone]);
        assert_eq!(fixture.manager.committed_table().len(), 2);
        assert_eq!(
            fixture.manager.capture().committed_tlvs(),
            &[0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x03, 0x00, 0x01, 0x01]
        );
        assert!(!fixture.manager.registry().is_dirty());
        assert!(fixture.manager.next_timeout().is_none());
    }

    #[test]
    fn commit_timeout_keeps_previous_table() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        let committed = fixture.manager.committed_table().to_vec();
        fixture.notifications();

        fixture.manager.request(technology(HOST_ID, TechMask::F)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        let (_, event) = fixture.manager.next_timeout().unwrap();
        assert!(matches!(event, Event::RoutingTimeout));
        fixture.manager.handle(event);

        assert_eq!(fixture.notifications(), vec![Notification::UpdateFailed(Error::CommitTimeout)]);
        assert_eq!(fixture.manager.committed_table(), committed.as_slice());
        assert!(fixture.manager.registry().is_dirty());
        assert!(!fixture.manager.is_committing());

        // A late response is ignored.
        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert!(fixture.notifications().is_empty());
    }

    #[test]
    fn recommit_waits_out_late_response() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        assert_eq!(fixture.sent().len(), 1);
        fixture.manager.request(Request::AddAid { id: HOST_ID, rule: aid(&[0xa0, 0x01]) }).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();

        fixture.manager.handle(Event::RoutingTimeout);
        assert_eq!(fixture.notifications(), vec![Notification::UpdateFailed(Error::CommitTimeout)]);
        assert!(fixture.sent().is_empty());
        let (_, event) = fixture.manager.next_timeout().unwrap();
        assert!(matches!(event, Event::RoutingTimeout));

        // The answer to the abandoned packet must not acknowledge a new one.
        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert!(fixture.sent().is_empty());
        assert!(fixture.notifications().is_empty());
        fixture.manager.request(Request::UpdateNow).unwrap();
        assert!(fixture.sent().is_empty());

        fixture.manager.handle(event);
        let sent = fixture.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(lmrt::parse(&sent[0]).unwrap().tlvs.len(), 2);
        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert_eq!(fixture.notifications(), vec![Notification::UpdateDone]);
        assert!(fixture.manager.next_timeout().is_none());
    }

    #[test]
    fn rejected_packet_aborts_commit() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        fixture.nci(ControllerEvent::RoutingRsp { status: 0x06 });
        assert_eq!(
            fixture.notifications(),
            vec![Notification::UpdateFailed(Error::Rejected(0x06))]
        );
        assert!(fixture.manager.committed_table().is_empty());
    }

    #[test]
    fn commit_requests_are_coalesced() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        assert_eq!(fixture.sent().len(), 1);

        fixture.manager.request(Request::AddAid { id: HOST_ID, rule: aid(&[0xa0, 0x01]) }).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        fixture.manager.request(Request::UpdateNow).unwrap();
        assert!(fixture.sent().is_empty());

        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        let sent = fixture.sent();
        assert_eq!(sent.len(), 1);
        let packet = lmrt::parse(&sent[0]).unwrap();
        assert_eq!(packet.tlvs.len(), 2);

        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert!(fixture.sent().is_empty());
        assert_eq!(
            fixture.notifications(),
            vec![Notification::UpdateDone, Notification::UpdateDone]
        );
        assert_eq!(fixture.manager.committed_table().len(), 2);
    }

    #[test]
    fn oversized_entry_fails_commit() {
        let config = Config { max_control_packet_payload_size: 6, ..Default::default() };
        let mut fixture = Fixture::enabled(config);
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        let err = Error::TableEntryTooLarge { size: 5, max: 4 };
        assert_eq!(fixture.manager.request(Request::UpdateNow), Err(err.clone()));
        assert!(fixture.sent().is_empty());
        assert_eq!(fixture.notifications(), vec![Notification::UpdateFailed(err)]);
    }

    #[test]
    fn table_capacity() {
        let config = Config { max_routing_table_size: 8, ..Default::default() };
        let mut fixture = Fixture::enabled(config);
        assert_eq!(fixture.manager.lmrt_remaining_size(), 8);
        fixture.manager.request(technology(HOST_ID, TechMask::A)).unwrap();
        assert_eq!(fixture.manager.lmrt_remaining_size(), 3);

        fixture.manager.request(Request::LmrtSize).unwrap();
        assert_eq!(fixture.notifications(), vec![Notification::LmrtRemainingSize(3)]);

        fixture.manager.request(technology(HOST_ID, TechMask::A | TechMask::B)).unwrap();
        assert_eq!(fixture.manager.lmrt_remaining_size(), 0);
        assert_eq!(
            fixture.manager.request(Request::UpdateNow),
            Err(Error::TableFull { size: 10, max: 8 })
        );
        assert!(fixture.sent().is_empty());
    }

    #[test]
    fn system_code_routing_support() {
        let config = Config { nci_version: NciVersion::Version10, ..Default::default() };
        let mut fixture = Fixture::enabled(config);
        let rule = SystemCodeRule { code: 0xfe00, power: PowerState::SWITCHED_ON };
        assert_eq!(
            fixture.manager.request(Request::AddSystemCode { id: HOST_ID, rule }),
            Err(Error::NotSupported)
        );
        assert_eq!(
            fixture.manager.request(Request::RemoveSystemCode { code: 0 }),
            Err(Error::InvalidParam("system code must not be zero"))
        );

        let config = Config {
            nci_version: NciVersion::Version10,
            system_code_routing_supported: true,
            ..Default::default()
        };
        let mut fixture = Fixture::enabled(config);
        assert_eq!(fixture.manager.request(Request::AddSystemCode { id: HOST_ID, rule }), Ok(()));
        assert_eq!(fixture.manager.request(Request::RemoveSystemCode { code: 0xfe00 }), Ok(()));
    }

    #[test]
    fn invalid_requests_are_rejected_before_queueing() {
        let mut fixture = Fixture::new(Config { max_ee: 1, ..Default::default() });
        fixture.manager.handle(Event::ControllerEnabled);
        assert_eq!(fixture.manager.state(), EmState::Init);

        let bad_aid = Error::InvalidParam("aid length must be between 1 and 16");
        assert_eq!(
            fixture.manager.request(Request::AddAid { id: HOST_ID, rule: aid(&[0xa0; 17]) }),
            Err(bad_aid.clone())
        );
        assert_eq!(
            fixture.manager.request(Request::AddAid { id: HOST_ID, rule: aid(&[]) }),
            Err(bad_aid.clone())
        );
        assert_eq!(fixture.manager.request(Request::RemoveAid { aid: vec![] }), Err(bad_aid));
        let rule = SystemCodeRule { code: 0, power: PowerState::SWITCHED_ON };
        assert_eq!(
            fixture.manager.request(Request::AddSystemCode { id: HOST_ID, rule }),
            Err(Error::InvalidParam("system code must not be zero"))
        );
        assert_eq!(
            fixture.manager.request(Request::SendData { id: 0x86, data: Bytes::new() }),
            Err(Error::InvalidParam("data must not be empty"))
        );

        fixture.manager.handle(Event::DiscoveryTimeout);
        assert_eq!(fixture.manager.state(), EmState::InitDone);
        assert!(fixture.sent().iter().all(|command| command[..2] == [0x22, 0x00]));
        assert!(!fixture
            .notifications()
            .iter()
            .any(|notification| matches!(notification, Notification::RequestFailed(_))));

        let config = Config { max_ee: 1, nci_version: NciVersion::Version10, ..Default::default() };
        let mut fixture = Fixture::new(config);
        fixture.manager.handle(Event::ControllerEnabled);
        assert_eq!(fixture.manager.state(), EmState::Init);
        let rule = SystemCodeRule { code: 0xfe00, power: PowerState::SWITCHED_ON };
        assert_eq!(
            fixture.manager.request(Request::AddSystemCode { id: HOST_ID, rule }),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn restore_after_power_cycle() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.discover(0x86, EeStatus::Active);
        fixture.manager.request(technology(0x86, TechMask::A)).unwrap();
        fixture.notifications();

        fixture.manager.handle(Event::PowerModeChanged(PowerMode::OffSleep));
        assert_eq!(fixture.manager.registry().find_by_id(0x86).unwrap().status, EeStatus::Inactive);
        assert!(fixture.sent().is_empty());

        fixture.manager.handle(Event::PowerModeChanged(PowerMode::Full));
        assert_eq!(fixture.manager.state(), EmState::Restoring);
        assert_eq!(fixture.sent(), vec![vec![0x22, 0x01, 0x02, 0x86, 0x01]]);

        // Discovery is postponed until the restore completes.
        fixture.manager.request(Request::Discover).unwrap();
        assert!(fixture.sent().is_empty());

        fixture.nci(ControllerEvent::ModeSetRsp { status: 0 });
        assert_eq!(fixture.manager.registry().find_by_id(0x86).unwrap().status, EeStatus::Active);
        assert_eq!(
            fixture.sent(),
            vec![vec![0x21, 0x01, 0x07, 0x00, 0x01, 0x00, 0x03, 0x86, 0x01, 0x00]]
        );
        assert_eq!(fixture.manager.state(), EmState::Restoring);

        fixture.nci(ControllerEvent::RoutingRsp { status: 0 });
        assert_eq!(fixture.manager.state(), EmState::InitDone);
        assert_eq!(fixture.sent(), vec![vec![0x22, 0x00, 0x00]]);
        assert_eq!(
            fixture.notifications(),
            vec![
                Notification::ModeSet { id: 0x86, enable: true, result: Ok(()) },
                Notification::UpdateDone,
                Notification::Restored,
            ]
        );
    }

    #[test]
    fn mode_set_disable_clears_config() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.discover(0x86, EeStatus::Active);
        fixture.manager.request(Request::AddAid { id: 0x86, rule: aid(&[0xa0, 0x02]) }).unwrap();

        fixture.manager.request(Request::ModeSet { id: 0x86, enable: false }).unwrap();
        assert_eq!(fixture.sent(), vec![vec![0x22, 0x01, 0x02, 0x86, 0x00]]);
        fixture.nci(ControllerEvent::ModeSetRsp { status: 0 });

        let ecb = fixture.manager.registry().find_by_id(0x86).unwrap();
        assert_eq!(ecb.status, EeStatus::Inactive);
        assert!(ecb.rules.is_empty());
        assert_eq!(
            fixture.manager.request(Request::ModeSet { id: 0x99, enable: true }),
            Err(Error::BadHandle(0x99))
        );
    }

    #[test]
    fn removed_nfcee_loses_its_rules() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.discover(0x86, EeStatus::Active);
        fixture.manager.request(technology(0x86, TechMask::A)).unwrap();

        fixture.nci(ControllerEvent::StatusNtf { id: 0x86, status: EeStatus::Removed });
        assert!(fixture.manager.registry().find_by_id(0x86).unwrap().rules.is_empty());
        assert_eq!(
            fixture.manager.request(technology(0x86, TechMask::A)),
            Err(Error::BadHandle(0x86))
        );
    }

    #[test]
    fn data_pipe() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.discover(0x86, EeStatus::Active);
        fixture.notifications();

        fixture.manager.request(connect(0x86)).unwrap();
        assert_eq!(
            fixture.sent(),
            vec![vec![0x20, 0x04, 0x06, 0x03, 0x01, 0x01, 0x02, 0x86, 0x00]]
        );
        fixture.nci(ControllerEvent::ConnCreateRsp { status: 0, conn_id: 3 });
        assert_eq!(
            fixture.notifications(),
            vec![Notification::Connected { id: 0x86, result: Ok(3) }]
        );

        let apdu = Bytes::from_static(&[0x00, 0xa4, 0x04, 0x00]);
        fixture.manager.request(Request::SendData { id: 0x86, data: apdu }).unwrap();
        assert_eq!(fixture.sent(), vec![vec![0x03, 0x00, 0x04, 0x00, 0xa4, 0x04, 0x00]]);

        let payload = Bytes::from_static(&[0x90, 0x00]);
        fixture.nci(ControllerEvent::Data { conn_id: 3, payload });
        assert_eq!(
            fixture.notifications(),
            vec![Notification::Data { id: 0x86, payload: Bytes::from_static(&[0x90, 0x00]) }]
        );

        fixture.manager.request(Request::Disconnect { id: 0x86 }).unwrap();
        assert_eq!(fixture.sent(), vec![vec![0x20, 0x05, 0x01, 0x03]]);
        fixture.nci(ControllerEvent::ConnCloseRsp { status: 0 });
        assert_eq!(fixture.notifications(), vec![Notification::Disconnected { id: 0x86 }]);
        assert_eq!(
            fixture.manager.request(Request::SendData { id: 0x86, data: Bytes::from_static(&[0]) }),
            Err(Error::BadHandle(0x86))
        );
    }

    #[test]
    fn one_disconnection_at_a_time() {
        let mut fixture = Fixture::enabled(Config::default());
        fixture.discover(0x86, EeStatus::Active);
        fixture.discover(0x81, EeStatus::Active);
        fixture.manager.request(connect(0x86)).unwrap();
        fixture.nci(ControllerEvent::ConnCreateRsp { status: 0, conn_id: 3 });
        fixture.manager.request(connect(0x81)).unwrap();
        fixture.nci(ControllerEvent::ConnCreateRsp { status: 0, conn_id: 4 });
        fixture.sent();
        fixture.notifications();

        fixture.manager.request(Request::Disconnect { id: 0x86 }).unwrap();
        assert_eq!(
            fixture.manager.request(Request::Disconnect { id: 0x81 }),
            Err(Error::InvalidParam("disconnection request already pending"))
        );
        assert_eq!(fixture.sent(), vec![vec![0x20, 0x05, 0x01, 0x03]]);

        fixture.nci(ControllerEvent::ConnCloseRsp { status: 0 });
        assert_eq!(fixture.notifications(), vec![Notification::Disconnected { id: 0x86 }]);
        fixture.manager.request(Request::Disconnect { id: 0x81 }).unwrap();
        assert_eq!(fixture.sent(), vec![vec![0x20, 0x05, 0x01, 0x04]]);
    }

    #[test]
    fn discovery_requests_drive_the_active_view() {
        let config = Config { offhost_route_ese: vec![0x86], ..Default::default() };
        let mut fixture = Fixture::enabled(config);
        fixture.discover(0x86, EeStatus::Active);
        fixture.nci(ControllerEvent::DiscoveryReqNtf(vec![
            DiscoveryRequest { add: true, id: 0x86, technology: TechMask::A, protocol: 0x04 },
            DiscoveryRequest { add: true, id: 0x86, technology: TechMask::B, protocol: 0x04 },
            DiscoveryRequest { add: false, id: 0x86, technology: TechMask::B, protocol: 0x04 },
        ]));

        let view = fixture.manager.active_environments();
        assert_eq!(view.len(), 1);
        assert_eq!(view["eSE1"], TechMask::A);

        fixture.nci(ControllerEvent::StatusNtf { id: 0x86, status: EeStatus::Inactive });
        assert!(fixture.manager.active_environments().is_empty());
    }

    #[test]
    fn listener_limit() {
        let mut fixture = Fixture::new(Config::default());
        let (second, _second_rx) = mpsc::unbounded_channel();
        let (third, _third_rx) = mpsc::unbounded_channel();
        let (fourth, _fourth_rx) = mpsc::unbounded_channel();
        fixture.manager.request(Request::Register(second.clone())).unwrap();
        fixture.manager.request(Request::Register(third)).unwrap();
        assert_eq!(
            fixture.manager.request(Request::Register(fourth.clone())),
            Err(Error::InvalidParam("too many listeners"))
        );
        fixture.manager.request(Request::Deregister(second)).unwrap();
        assert_eq!(fixture.manager.request(Request::Register(fourth)), Ok(()));
    }
}
