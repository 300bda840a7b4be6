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

//! Routing rules owned by the NFCEE control blocks, and their encoding
//! into the canonical Listen Mode Routing Table.

use crate::error::{Error, Result};
use crate::lmrt::TlvEntry;
use crate::registry::{Ecb, EeId, EeStatus, Registry, TechMask};
use log::debug;

/// Maximum length of an AID.
pub const MAX_AID_LEN: usize = 16;

/// Routing entry types ([NCI] 6.3.2 Table 46).
pub const TLV_TYPE_TECHNOLOGY: u8 = 0x00;
#[allow(missing_docs)]
pub const TLV_TYPE_PROTOCOL: u8 = 0x01;
#[allow(missing_docs)]
pub const TLV_TYPE_AID: u8 = 0x02;
#[allow(missing_docs)]
pub const TLV_TYPE_SYSTEM_CODE: u8 = 0x03;
const TLV_TYPE_MASK: u8 = 0x0f;

/// Common access to the raw bits of the routing masks.
pub trait Mask: Copy {
    /// Raw bits of the mask.
    fn bits(self) -> u8;
    /// Build a mask from raw bits.
    fn from_bits(bits: u8) -> Self;
}

bit_mask! {
    /// Power states in which a routing entry applies. The bit values are
    /// those of the routing entry Power State field.
    PowerState {
        SWITCHED_ON = 0x01,
        SWITCHED_OFF = 0x02,
        BATTERY_OFF = 0x04,
        SCREEN_OFF_UNLOCKED = 0x08,
        SCREEN_ON_LOCKED = 0x10,
        SCREEN_OFF_LOCKED = 0x20,
    }
}

bit_mask! {
    /// RF protocols selected by protocol based routing.
    ProtocolMask {
        T1T = 0x01,
        T2T = 0x02,
        T3T = 0x04,
        ISO_DEP = 0x08,
        NFC_DEP = 0x10,
        T5T = 0x20,
        NDEF = 0x40,
    }
}

bit_mask! {
    /// Qualifiers of an AID routing entry.
    AidInfo {
        PREFIX = 0x10,
        SUFFIX = 0x20,
        /// Do not route the AID while the NFCEE is powered off.
        BLOCK_WHEN_OFF = 0x40,
    }
}

/// Technology bits and their NCI RF technology values.
static TECHNOLOGIES: [(TechMask, u8); 4] =
    [(TechMask::A, 0x00), (TechMask::B, 0x01), (TechMask::F, 0x02), (TechMask::V, 0x03)];

/// Protocol bits and their NCI RF protocol values.
static PROTOCOLS: [(ProtocolMask, u8); 7] = [
    (ProtocolMask::T1T, 0x01),
    (ProtocolMask::T2T, 0x02),
    (ProtocolMask::T3T, 0x03),
    (ProtocolMask::ISO_DEP, 0x04),
    (ProtocolMask::NFC_DEP, 0x05),
    (ProtocolMask::T5T, 0x06),
    (ProtocolMask::NDEF, 0x07),
];

/// Per power state selection of technologies or protocols.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PowerMasks<M> {
    pub switch_on: M,
    pub switch_off: M,
    pub battery_off: M,
    pub screen_lock: M,
    pub screen_off: M,
    pub screen_off_lock: M,
}

impl<M: Mask> PowerMasks<M> {
    /// Same selection in the switched-on state only.
    pub fn switch_on(mask: M) -> Self {
        let none = M::from_bits(0);
        PowerMasks {
            switch_on: mask,
            switch_off: none,
            battery_off: none,
            screen_lock: none,
            screen_off: none,
            screen_off_lock: none,
        }
    }

    /// Same selection in every power state of `power`.
    pub fn for_power_state(mask: M, power: PowerState) -> Self {
        let pick = |state: PowerState| if power.contains(state) { mask } else { M::from_bits(0) };
        PowerMasks {
            switch_on: pick(PowerState::SWITCHED_ON),
            switch_off: pick(PowerState::SWITCHED_OFF),
            battery_off: pick(PowerState::BATTERY_OFF),
            screen_lock: pick(PowerState::SCREEN_ON_LOCKED),
            screen_off: pick(PowerState::SCREEN_OFF_UNLOCKED),
            screen_off_lock: pick(PowerState::SCREEN_OFF_LOCKED),
        }
    }

    fn pairs(&self) -> [(M, PowerState); 6] {
        [
            (self.switch_on, PowerState::SWITCHED_ON),
            (self.switch_off, PowerState::SWITCHED_OFF),
            (self.battery_off, PowerState::BATTERY_OFF),
            (self.screen_lock, PowerState::SCREEN_ON_LOCKED),
            (self.screen_off, PowerState::SCREEN_OFF_UNLOCKED),
            (self.screen_off_lock, PowerState::SCREEN_OFF_LOCKED),
        ]
    }

    /// Power states in which the selection contains `bit`.
    pub fn power_state_of(&self, bit: M) -> PowerState {
        self.pairs()
            .iter()
            .filter(|(mask, _)| mask.bits() & bit.bits() != 0)
            .fold(PowerState::NONE, |acc, (_, state)| acc | *state)
    }

    /// Union of the selections in all power states.
    pub fn union(&self) -> M {
        M::from_bits(self.pairs().iter().fold(0, |acc, (mask, _)| acc | mask.bits()))
    }

    /// Remove `mask` from the selections in all power states.
    pub fn clear(&mut self, mask: M) {
        for field in [
            &mut self.switch_on,
            &mut self.switch_off,
            &mut self.battery_off,
            &mut self.screen_lock,
            &mut self.screen_off,
            &mut self.screen_off_lock,
        ] {
            *field = M::from_bits(field.bits() & !mask.bits());
        }
    }
}

/// AID based routing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AidRule {
    pub aid: Vec<u8>,
    pub power: PowerState,
    pub info: AidInfo,
}

/// System code based routing entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SystemCodeRule {
    pub code: u16,
    pub power: PowerState,
}

/// Routing rules owned by one control block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RuleSet {
    pub technologies: PowerMasks<TechMask>,
    pub protocols: PowerMasks<ProtocolMask>,
    pub aids: Vec<AidRule>,
    pub system_codes: Vec<SystemCodeRule>,
}

impl RuleSet {
    /// Return true if the rule set contributes no routing entry.
    pub fn is_empty(&self) -> bool {
        self.technologies.union().is_empty()
            && self.protocols.union().is_empty()
            && self.aids.is_empty()
            && self.system_codes.is_empty()
    }

    fn technology_entries(&self, id: EeId) -> impl Iterator<Item = TlvEntry> + '_ {
        TECHNOLOGIES.iter().filter_map(move |(bit, value)| {
            let power = self.technologies.power_state_of(*bit);
            (!power.is_empty()).then(|| TlvEntry::route(TLV_TYPE_TECHNOLOGY, id, power, &[*value]))
        })
    }

    fn protocol_entries(&self, id: EeId) -> impl Iterator<Item = TlvEntry> + '_ {
        PROTOCOLS.iter().filter_map(move |(bit, value)| {
            let power = self.protocols.power_state_of(*bit);
            (!power.is_empty()).then(|| TlvEntry::route(TLV_TYPE_PROTOCOL, id, power, &[*value]))
        })
    }

    fn aid_entries(&self, id: EeId) -> impl Iterator<Item = TlvEntry> + '_ {
        self.aids
            .iter()
            .map(move |rule| TlvEntry::route(TLV_TYPE_AID | rule.info.0, id, rule.power, &rule.aid))
    }

    fn system_code_entries(&self, id: EeId) -> impl Iterator<Item = TlvEntry> + '_ {
        self.system_codes.iter().map(move |rule| {
            TlvEntry::route(TLV_TYPE_SYSTEM_CODE, id, rule.power, &rule.code.to_be_bytes())
        })
    }
}

/// Kind of a routing entry, decoded from its TLV type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RouteKind {
    Technology,
    Protocol,
    Aid,
    SystemCode,
}

impl RouteKind {
    /// Decode the kind of the entry, ignoring the qualifier bits.
    /// Unknown types are carried through the table untouched.
    pub fn from_tlv_type(tlv_type: u8) -> Option<RouteKind> {
        match tlv_type & TLV_TYPE_MASK {
            TLV_TYPE_TECHNOLOGY => Some(RouteKind::Technology),
            TLV_TYPE_PROTOCOL => Some(RouteKind::Protocol),
            TLV_TYPE_AID => Some(RouteKind::Aid),
            TLV_TYPE_SYSTEM_CODE => Some(RouteKind::SystemCode),
            _ => None,
        }
    }
}

/// Validate the length of an AID.
pub fn check_aid(aid: &[u8]) -> Result<()> {
    if aid.is_empty() || aid.len() > MAX_AID_LEN {
        return Err(Error::InvalidParam("aid length must be between 1 and 16"));
    }
    Ok(())
}

impl Registry {
    /// Return the control block targeted by a routing mutation.
    fn route_target(&mut self, id: EeId) -> Result<&mut Ecb> {
        match self.find_by_id_mut(id) {
            Some(ecb) if ecb.status != EeStatus::Removed => Ok(ecb),
            _ => Err(Error::BadHandle(id)),
        }
    }

    /// Replace the technology based routing of the NFCEE.
    pub fn set_technology_routing(&mut self, id: EeId, masks: PowerMasks<TechMask>) -> Result<()> {
        self.route_target(id)?.rules.technologies = masks;
        self.set_dirty(true);
        Ok(())
    }

    /// Remove the technologies in `mask` from the technology based routing
    /// of the NFCEE. Clearing an empty mask is a no-op.
    pub fn clear_technology_routing(&mut self, id: EeId, mask: TechMask) -> Result<()> {
        if mask.is_empty() {
            return Ok(());
        }
        self.route_target(id)?.rules.technologies.clear(mask);
        self.set_dirty(true);
        Ok(())
    }

    /// Replace the protocol based routing of the NFCEE.
    pub fn set_protocol_routing(
        &mut self,
        id: EeId,
        masks: PowerMasks<ProtocolMask>,
    ) -> Result<()> {
        self.route_target(id)?.rules.protocols = masks;
        self.set_dirty(true);
        Ok(())
    }

    /// Remove the protocols in `mask` from the protocol based routing
    /// of the NFCEE. Clearing an empty mask is a no-op.
    pub fn clear_protocol_routing(&mut self, id: EeId, mask: ProtocolMask) -> Result<()> {
        if mask.is_empty() {
            return Ok(());
        }
        self.route_target(id)?.rules.protocols.clear(mask);
        self.set_dirty(true);
        Ok(())
    }

    /// Route `rule.aid` to the NFCEE. An AID is owned by a single NFCEE:
    /// any previous route for the same AID is replaced.
    pub fn add_aid(&mut self, id: EeId, rule: AidRule) -> Result<()> {
        check_aid(&rule.aid)?;
        self.route_target(id)?;
        for ecb in self.iter_mut() {
            ecb.rules.aids.retain(|existing| existing.aid != rule.aid);
        }
        debug!("add aid {} to nfcee {:#04x}", hex::encode(&rule.aid), id);
        self.route_target(id)?.rules.aids.push(rule);
        self.set_dirty(true);
        Ok(())
    }

    /// Remove the route for `aid`, returning the NFCEE it was routed to.
    pub fn remove_aid(&mut self, aid: &[u8]) -> Result<EeId> {
        check_aid(aid)?;
        let ecb = self
            .iter_mut()
            .find(|ecb| ecb.rules.aids.iter().any(|rule| rule.aid == aid))
            .ok_or(Error::InvalidParam("aid is not routed"))?;
        ecb.rules.aids.retain(|rule| rule.aid != aid);
        let id = ecb.id;
        self.set_dirty(true);
        Ok(id)
    }

    /// Route the system code to the NFCEE, replacing any previous route
    /// for the same code.
    pub fn add_system_code(&mut self, id: EeId, rule: SystemCodeRule) -> Result<()> {
        if rule.code == 0 {
            return Err(Error::InvalidParam("system code must not be zero"));
        }
        self.route_target(id)?;
        for ecb in self.iter_mut() {
            ecb.rules.system_codes.retain(|existing| existing.code != rule.code);
        }
        self.route_target(id)?.rules.system_codes.push(rule);
        self.set_dirty(true);
        Ok(())
    }

    /// Remove the route for the system code, returning the NFCEE it was
    /// routed to.
    pub fn remove_system_code(&mut self, code: u16) -> Result<EeId> {
        if code == 0 {
            return Err(Error::InvalidParam("system code must not be zero"));
        }
        let ecb = self
            .iter_mut()
            .find(|ecb| ecb.rules.system_codes.iter().any(|rule| rule.code == code))
            .ok_or(Error::InvalidParam("system code is not routed"))?;
        ecb.rules.system_codes.retain(|rule| rule.code != code);
        let id = ecb.id;
        self.set_dirty(true);
        Ok(id)
    }

    /// Clear the selected rule kinds on every NFCEE.
    pub fn clear_routing_table(&mut self, technology: bool, protocol: bool, system_code: bool) {
        for ecb in self.iter_mut() {
            if technology {
                ecb.rules.technologies = PowerMasks::default();
            }
            if protocol {
                ecb.rules.protocols = PowerMasks::default();
            }
            if system_code {
                ecb.rules.system_codes.clear();
            }
        }
        self.set_dirty(true);
    }

    /// Encode the routing rules of every NFCEE into the canonical table:
    /// technology entries first, then protocol, AID and system code
    /// entries. Each group is ordered by NFCEE id, then insertion order.
    pub fn encode_canonical_table(&self) -> Vec<TlvEntry> {
        let mut ecbs: Vec<&Ecb> =
            self.iter().filter(|ecb| ecb.status != EeStatus::Removed).collect();
        ecbs.sort_by_key(|ecb| ecb.id);

        let mut table = vec![];
        table.extend(ecbs.iter().flat_map(|ecb| ecb.rules.technology_entries(ecb.id)));
        table.extend(ecbs.iter().flat_map(|ecb| ecb.rules.protocol_entries(ecb.id)));
        table.extend(ecbs.iter().flat_map(|ecb| ecb.rules.aid_entries(ecb.id)));
        table.extend(ecbs.iter().flat_map(|ecb| ecb.rules.system_code_entries(ecb.id)));
        table
    }
}
