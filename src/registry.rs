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

//! Registry of the NFCEE control blocks.

use crate::routing::RuleSet;
use log::warn;

/// Identifier assigned to an NFCEE by the controller.
pub type EeId = u8;

/// Reserved identifier of the Device Host.
pub const HOST_ID: EeId = 0x00;
/// Identifier of an unused control block slot.
pub const INVALID_ID: EeId = 0xff;
/// Number of controller NFCEEs tracked by the registry.
pub const MAX_EE_SUPPORTED: usize = 4;
/// Slot reserved for the Device Host control block.
pub const HOST_SLOT: usize = MAX_EE_SUPPORTED;

bit_mask! {
    /// Listen mode RF technologies supported by an NFCEE.
    TechMask {
        A = 0x01,
        B = 0x02,
        F = 0x04,
        V = 0x08,
    }
}

/// Status of an NFCEE as reported by the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EeStatus {
    Active,
    Inactive,
    Removed,
}

impl EeStatus {
    /// Decode the NFCEE Status field of NFCEE_DISCOVER_NTF and
    /// NFCEE_STATUS_NTF. Unresponsive NFCEEs are treated as removed.
    pub fn from_nci(status: u8) -> EeStatus {
        match status {
            0x00 => EeStatus::Active,
            0x01 => EeStatus::Inactive,
            _ => EeStatus::Removed,
        }
    }
}

/// NFCEE protocol / interface advertised in discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EeInterface {
    Apdu,
    HciAccess,
    T3tCommandSet,
    Transparent,
    Proprietary(u8),
}

impl From<u8> for EeInterface {
    fn from(value: u8) -> Self {
        match value {
            0x00 => EeInterface::Apdu,
            0x01 => EeInterface::HciAccess,
            0x02 => EeInterface::T3tCommandSet,
            0x03 => EeInterface::Transparent,
            other => EeInterface::Proprietary(other),
        }
    }
}

impl From<EeInterface> for u8 {
    fn from(interface: EeInterface) -> Self {
        match interface {
            EeInterface::Apdu => 0x00,
            EeInterface::HciAccess => 0x01,
            EeInterface::T3tCommandSet => 0x02,
            EeInterface::Transparent => 0x03,
            EeInterface::Proprietary(other) => other,
        }
    }
}

/// Presence information reported for one NFCEE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EeInfo {
    pub id: EeId,
    pub status: EeStatus,
    pub interface: EeInterface,
    pub tech_mask: TechMask,
}

/// Execution Environment Control Block.
#[derive(Clone, Debug)]
pub struct Ecb {
    slot: usize,
    pub id: EeId,
    pub status: EeStatus,
    pub interface: EeInterface,
    pub tech_mask: TechMask,
    pub rules: RuleSet,
    pub conn_id: Option<u8>,
}

impl Ecb {
    fn new(slot: usize) -> Ecb {
        let (id, status) = if slot == HOST_SLOT {
            (HOST_ID, EeStatus::Active)
        } else {
            (INVALID_ID, EeStatus::Inactive)
        };
        Ecb {
            slot,
            id,
            status,
            interface: EeInterface::Apdu,
            tech_mask: TechMask::NONE,
            rules: RuleSet::default(),
            conn_id: None,
        }
    }

    /// Return true for the Device Host control block.
    pub fn is_host(&self) -> bool {
        self.slot == HOST_SLOT
    }

    /// Return the bit selecting this control block in EE bitmasks.
    pub fn to_mask(&self) -> u32 {
        1 << self.slot
    }

    /// Restore the configuration of the control block to defaults,
    /// keeping its identity and presence.
    pub fn clear_config(&mut self) {
        self.rules = RuleSet::default();
        self.conn_id = None;
    }

    /// Snapshot of the presence information of the control block.
    pub fn info(&self) -> EeInfo {
        EeInfo {
            id: self.id,
            status: self.status,
            interface: self.interface,
            tech_mask: self.tech_mask,
        }
    }
}

/// Fixed-capacity arena of NFCEE control blocks, one slot per supported
/// NFCEE plus the Device Host slot.
#[derive(Clone, Debug)]
pub struct Registry {
    ecbs: [Ecb; MAX_EE_SUPPORTED + 1],
    dirty: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Create a registry with all slots initialized.
    pub fn new() -> Registry {
        Registry { ecbs: std::array::from_fn(Ecb::new), dirty: false }
    }

    /// Reset every slot to its default value.
    pub fn init(&mut self) {
        *self = Registry::new();
    }

    /// Return the control block assigned to `id`.
    pub fn find_by_id(&self, id: EeId) -> Option<&Ecb> {
        if id == INVALID_ID {
            return None;
        }
        self.ecbs.iter().find(|ecb| ecb.id == id)
    }

    /// Mutable variant of [`Registry::find_by_id`].
    pub fn find_by_id_mut(&mut self, id: EeId) -> Option<&mut Ecb> {
        if id == INVALID_ID {
            return None;
        }
        self.ecbs.iter_mut().find(|ecb| ecb.id == id)
    }

    /// Return the control block owning the logical connection `conn_id`.
    pub fn find_by_conn_id(&self, conn_id: u8) -> Option<&Ecb> {
        self.ecbs.iter().find(|ecb| ecb.conn_id == Some(conn_id))
    }

    /// Mutable variant of [`Registry::find_by_conn_id`].
    pub fn find_by_conn_id_mut(&mut self, conn_id: u8) -> Option<&mut Ecb> {
        self.ecbs.iter_mut().find(|ecb| ecb.conn_id == Some(conn_id))
    }

    /// Return the EE selector bit of the control block.
    pub fn to_mask(&self, ecb: &Ecb) -> u32 {
        ecb.to_mask()
    }

    /// Refresh presence information from discovery results.
    /// Routing configuration of known NFCEEs is preserved; entries for
    /// unknown NFCEEs take the first free slot.
    pub fn apply_discovery_result(&mut self, entries: &[EeInfo]) {
        for entry in entries {
            if entry.id == HOST_ID || entry.id == INVALID_ID {
                warn!("ignoring discovery result with reserved nfcee id {:#04x}", entry.id);
                continue;
            }
            let slots = &self.ecbs[..MAX_EE_SUPPORTED];
            let slot = match slots
                .iter()
                .position(|ecb| ecb.id == entry.id)
                .or_else(|| slots.iter().position(|ecb| ecb.id == INVALID_ID))
            {
                Some(slot) => slot,
                None => {
                    warn!("no free slot for nfcee {:#04x}", entry.id);
                    continue;
                }
            };
            let ecb = &mut self.ecbs[slot];
            ecb.id = entry.id;
            ecb.status = entry.status;
            ecb.interface = entry.interface;
            ecb.tech_mask = entry.tech_mask;
        }
    }

    /// Iterate over the populated control blocks, controller NFCEEs first
    /// and the Device Host last.
    pub fn iter(&self) -> impl Iterator<Item = &Ecb> {
        self.ecbs.iter().filter(|ecb| ecb.id != INVALID_ID)
    }

    /// Mutable variant of [`Registry::iter`].
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Ecb> {
        self.ecbs.iter_mut().filter(|ecb| ecb.id != INVALID_ID)
    }

    /// Presence information of the discovered controller NFCEEs.
    pub fn info(&self) -> Vec<EeInfo> {
        self.iter().filter(|ecb| !ecb.is_host()).map(Ecb::info).collect()
    }

    /// Number of discovered NFCEEs, not counting HCI access entries.
    pub fn present_count(&self) -> usize {
        self.iter()
            .filter(|ecb| !ecb.is_host() && ecb.interface != EeInterface::HciAccess)
            .count()
    }

    /// Return true if routing rules changed since the last commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty
    }
}
