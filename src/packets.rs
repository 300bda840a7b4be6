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

//! Packet parsers and serializers for the NCI messages exchanged by the
//! NFCEE manager.

use crate::registry::{EeId, EeInfo, EeInterface, EeStatus, TechMask};
use bytes::Bytes;
use serde::Deserialize;

/// NCI Message Type field values, already shifted into the header byte.
pub mod mt {
    #![allow(missing_docs)]
    pub const DATA: u8 = 0x00;
    pub const COMMAND: u8 = 0x20;
    pub const RESPONSE: u8 = 0x40;
    pub const NOTIFICATION: u8 = 0x60;
}

/// NCI Group Identifiers.
pub mod gid {
    #![allow(missing_docs)]
    pub const CORE: u8 = 0x00;
    pub const RF: u8 = 0x01;
    pub const NFCEE: u8 = 0x02;
}

/// Opcode Identifiers used by the NFCEE manager.
pub mod oid {
    #![allow(missing_docs)]
    pub const CORE_CONN_CREATE: u8 = 0x04;
    pub const CORE_CONN_CLOSE: u8 = 0x05;
    pub const RF_SET_LISTEN_MODE_ROUTING: u8 = 0x01;
    pub const RF_NFCEE_ACTION: u8 = 0x09;
    pub const RF_NFCEE_DISCOVERY_REQ: u8 = 0x0a;
    pub const NFCEE_DISCOVER: u8 = 0x00;
    pub const NFCEE_MODE_SET: u8 = 0x01;
    pub const NFCEE_STATUS: u8 = 0x02;
    pub const NFCEE_POWER_AND_LINK_CTRL: u8 = 0x03;
}

/// Status code of a successful command.
pub const STATUS_OK: u8 = 0x00;

const HEADER_SIZE: usize = 3;
const MT_MASK: u8 = 0xe0;
const GID_MASK: u8 = 0x0f;
const OID_MASK: u8 = 0x3f;
const CONN_ID_MASK: u8 = 0x0f;
const DESTINATION_TYPE_NFCEE: u8 = 0x03;
const DESTINATION_PARAM_NFCEE: u8 = 0x01;

/// NCI version implemented by the controller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum NciVersion {
    #[serde(rename = "1.0")]
    Version10,
    #[serde(rename = "1.1")]
    Version11,
    #[serde(rename = "2.0")]
    #[default]
    Version20,
}

/// Change of the listen technologies of an NFCEE, carried by
/// RF_NFCEE_DISCOVERY_REQ_NTF.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DiscoveryRequest {
    pub add: bool,
    pub id: EeId,
    pub technology: TechMask,
    pub protocol: u8,
}

/// NCI responses, notifications and data consumed by the NFCEE manager.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ControllerEvent {
    RoutingRsp { status: u8 },
    DiscoverRsp { status: u8, num_ee: u8 },
    DiscoverNtf(EeInfo),
    ModeSetRsp { status: u8 },
    StatusNtf { id: EeId, status: EeStatus },
    PowerAndLinkCtrlRsp { status: u8 },
    ConnCreateRsp { status: u8, conn_id: u8 },
    ConnCloseRsp { status: u8 },
    Data { conn_id: u8, payload: Bytes },
    ActionNtf { id: EeId, trigger: u8, data: Vec<u8> },
    DiscoveryReqNtf(Vec<DiscoveryRequest>),
}

fn control(mt: u8, gid: u8, oid: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.push(mt | gid);
    packet.push(oid);
    packet.push(payload.len() as u8);
    packet.extend_from_slice(payload);
    packet
}

/// NFCEE_DISCOVER_CMD. NCI 1.x carries the Discovery Action field.
pub fn nfcee_discover_cmd(version: NciVersion) -> Vec<u8> {
    match version {
        NciVersion::Version20 => control(mt::COMMAND, gid::NFCEE, oid::NFCEE_DISCOVER, &[]),
        _ => control(mt::COMMAND, gid::NFCEE, oid::NFCEE_DISCOVER, &[0x01]),
    }
}

/// NFCEE_MODE_SET_CMD.
pub fn nfcee_mode_set_cmd(id: EeId, enable: bool) -> Vec<u8> {
    control(mt::COMMAND, gid::NFCEE, oid::NFCEE_MODE_SET, &[id, enable as u8])
}

/// NFCEE_POWER_AND_LINK_CNTRL_CMD.
pub fn nfcee_power_and_link_ctrl_cmd(id: EeId, config: u8) -> Vec<u8> {
    control(mt::COMMAND, gid::NFCEE, oid::NFCEE_POWER_AND_LINK_CTRL, &[id, config])
}

/// CORE_CONN_CREATE_CMD with an NFCEE destination.
pub fn core_conn_create_cmd(id: EeId, interface: EeInterface) -> Vec<u8> {
    control(
        mt::COMMAND,
        gid::CORE,
        oid::CORE_CONN_CREATE,
        &[DESTINATION_TYPE_NFCEE, 1, DESTINATION_PARAM_NFCEE, 2, id, interface.into()],
    )
}

/// CORE_CONN_CLOSE_CMD.
pub fn core_conn_close_cmd(conn_id: u8) -> Vec<u8> {
    control(mt::COMMAND, gid::CORE, oid::CORE_CONN_CLOSE, &[conn_id])
}

/// Data packet on a logical connection. The length field is rewritten
/// by the transport when the payload is segmented.
pub fn data_packet(conn_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.push(mt::DATA | (conn_id & CONN_ID_MASK));
    packet.push(0);
    packet.push(u8::try_from(payload.len()).unwrap_or(u8::MAX));
    packet.extend_from_slice(payload);
    packet
}

fn technology_of(rf_technology_and_mode: u8) -> TechMask {
    // Poll and listen modes of the same technology share the low bits.
    match rf_technology_and_mode & 0x7f {
        0x00 => TechMask::A,
        0x01 => TechMask::B,
        0x02 => TechMask::F,
        0x06 => TechMask::V,
        _ => TechMask::NONE,
    }
}

fn parse_discover_ntf(payload: &[u8]) -> Option<EeInfo> {
    let (&id, rest) = payload.split_first()?;
    let (&status, rest) = rest.split_first()?;
    let (&num_protocols, rest) = rest.split_first()?;
    let protocols = rest.get(..num_protocols as usize)?;
    Some(EeInfo {
        id,
        status: EeStatus::from_nci(status),
        interface: protocols.first().map_or(EeInterface::Apdu, |p| EeInterface::from(*p)),
        tech_mask: TechMask::NONE,
    })
}

fn parse_discovery_req_ntf(payload: &[u8]) -> Option<Vec<DiscoveryRequest>> {
    let (&count, mut rest) = payload.split_first()?;
    let mut requests = vec![];
    for _ in 0..count {
        let kind = *rest.first()?;
        let length = *rest.get(1)? as usize;
        let value = rest.get(2..2 + length)?;
        if value.len() < 3 {
            return None;
        }
        requests.push(DiscoveryRequest {
            add: kind == 0x00,
            id: value[0],
            technology: technology_of(value[1]),
            protocol: value[2],
        });
        rest = &rest[2 + length..];
    }
    Some(requests)
}

/// Decode an NCI packet into the event consumed by the NFCEE manager.
/// Returns None for packets not addressed to the NFCEE manager and for
/// malformed payloads.
pub fn decode(packet: &[u8]) -> Option<ControllerEvent> {
    if packet.len() < HEADER_SIZE {
        return None;
    }
    let payload = &packet[HEADER_SIZE..];
    let status = payload.first().copied();

    match (packet[0] & MT_MASK, packet[0] & GID_MASK, packet[1] & OID_MASK) {
        (mt::DATA, _, _) => Some(ControllerEvent::Data {
            conn_id: packet[0] & CONN_ID_MASK,
            payload: Bytes::copy_from_slice(payload),
        }),
        (mt::RESPONSE, gid::RF, oid::RF_SET_LISTEN_MODE_ROUTING) => {
            Some(ControllerEvent::RoutingRsp { status: status? })
        }
        (mt::RESPONSE, gid::NFCEE, oid::NFCEE_DISCOVER) => Some(ControllerEvent::DiscoverRsp {
            status: status?,
            num_ee: payload.get(1).copied().unwrap_or(0),
        }),
        (mt::RESPONSE, gid::NFCEE, oid::NFCEE_MODE_SET) => {
            Some(ControllerEvent::ModeSetRsp { status: status? })
        }
        (mt::RESPONSE, gid::NFCEE, oid::NFCEE_POWER_AND_LINK_CTRL) => {
            Some(ControllerEvent::PowerAndLinkCtrlRsp { status: status? })
        }
        (mt::RESPONSE, gid::CORE, oid::CORE_CONN_CREATE) => Some(ControllerEvent::ConnCreateRsp {
            status: status?,
            conn_id: payload.get(3).copied().unwrap_or(0),
        }),
        (mt::RESPONSE, gid::CORE, oid::CORE_CONN_CLOSE) => {
            Some(ControllerEvent::ConnCloseRsp { status: status? })
        }
        (mt::NOTIFICATION, gid::NFCEE, oid::NFCEE_DISCOVER) => {
            parse_discover_ntf(payload).map(ControllerEvent::DiscoverNtf)
        }
        (mt::NOTIFICATION, gid::NFCEE, oid::NFCEE_STATUS) => Some(ControllerEvent::StatusNtf {
            id: *payload.first()?,
            status: EeStatus::from_nci(*payload.get(1)?),
        }),
        (mt::NOTIFICATION, gid::RF, oid::RF_NFCEE_ACTION) => {
            let length = *payload.get(2)? as usize;
            Some(ControllerEvent::ActionNtf {
                id: payload[0],
                trigger: payload[1],
                data: payload.get(3..3 + length)?.to_vec(),
            })
        }
        (mt::NOTIFICATION, gid::RF, oid::RF_NFCEE_DISCOVERY_REQ) => {
            parse_discovery_req_ntf(payload).map(ControllerEvent::DiscoveryReqNtf)
        }
        _ => None,
    }
}
