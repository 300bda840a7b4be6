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

//! Static configuration of the NFCEE manager.

use crate::error::{Error, Result};
use crate::manager::Request;
use crate::packets::NciVersion;
use crate::registry::{EeId, TechMask};
use crate::routing::{AidInfo, AidRule, PowerMasks, PowerState, ProtocolMask, SystemCodeRule};
use anyhow::Context;
use core::time::Duration;
use serde::Deserialize;
use std::path::Path;

/// Route id of the NDEF NFCEE when not configured.
pub const DEFAULT_NDEF_NFCEE_ROUTE: EeId = 0x10;
const MAX_ROUTING_TABLE_SIZE: u16 = 512;
const MAX_CONTROL_PACKET_PAYLOAD_SIZE: u8 = 255;
const ROUTING_TIMEOUT_MS: u64 = 1000;
const DISCOVERY_TIMEOUT_MS: u64 = 2000;

/// Configuration of the NFCEE manager, read from a TOML file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Route ids of the embedded secure elements, in display order.
    pub offhost_route_ese: Vec<EeId>,
    /// Route ids of the UICC slots, in display order.
    pub offhost_route_uicc: Vec<EeId>,
    pub t4t_nfcee_enable: bool,
    pub default_ndef_nfcee_route: EeId,
    /// Listen Mode Routing Table capacity advertised by the controller.
    pub max_routing_table_size: u16,
    pub max_control_packet_payload_size: u8,
    pub nci_version: NciVersion,
    pub system_code_routing_supported: bool,
    /// Number of NFCEEs expected to answer discovery.
    pub max_ee: u8,
    /// The HCI network is enabled. Disabling then waits for the HCI
    /// subsystem to complete.
    pub hci_network: bool,
    pub routing_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    /// Routing rules applied by the binary at start-up.
    pub routes: Vec<RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            offhost_route_ese: vec![],
            offhost_route_uicc: vec![],
            t4t_nfcee_enable: false,
            default_ndef_nfcee_route: DEFAULT_NDEF_NFCEE_ROUTE,
            max_routing_table_size: MAX_ROUTING_TABLE_SIZE,
            max_control_packet_payload_size: MAX_CONTROL_PACKET_PAYLOAD_SIZE,
            nci_version: NciVersion::default(),
            system_code_routing_supported: false,
            max_ee: 0,
            hci_network: false,
            routing_timeout_ms: ROUTING_TIMEOUT_MS,
            discovery_timeout_ms: DISCOVERY_TIMEOUT_MS,
            routes: vec![],
        }
    }
}

impl Config {
    /// Read the configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Config::parse(&text).with_context(|| format!("invalid configuration {}", path.display()))
    }

    /// Parse the configuration from TOML text.
    pub fn parse(text: &str) -> anyhow::Result<Config> {
        Ok(toml::from_str(text)?)
    }

    /// Return true if the controller accepts system code routing entries.
    pub fn system_code_supported(&self) -> bool {
        self.nci_version >= NciVersion::Version20 || self.system_code_routing_supported
    }

    pub fn routing_timeout(&self) -> Duration {
        Duration::from_millis(self.routing_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

fn default_power() -> u8 {
    PowerState::SWITCHED_ON.0
}

/// One routing rule of the configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum RouteConfig {
    Technology {
        ee: EeId,
        mask: u8,
        #[serde(default = "default_power")]
        power: u8,
    },
    Protocol {
        ee: EeId,
        mask: u8,
        #[serde(default = "default_power")]
        power: u8,
    },
    Aid {
        ee: EeId,
        /// AID bytes in hexadecimal.
        aid: String,
        #[serde(default = "default_power")]
        power: u8,
        #[serde(default)]
        info: u8,
    },
    SystemCode {
        ee: EeId,
        code: u16,
        #[serde(default = "default_power")]
        power: u8,
    },
}

impl RouteConfig {
    /// Convert the rule into the matching routing request.
    pub fn to_request(&self) -> Result<Request> {
        Ok(match self {
            RouteConfig::Technology { ee, mask, power } => Request::SetTechnologyRouting {
                id: *ee,
                masks: PowerMasks::for_power_state(TechMask(*mask), PowerState(*power)),
            },
            RouteConfig::Protocol { ee, mask, power } => Request::SetProtocolRouting {
                id: *ee,
                masks: PowerMasks::for_power_state(ProtocolMask(*mask), PowerState(*power)),
            },
            RouteConfig::Aid { ee, aid, power, info } => Request::AddAid {
                id: *ee,
                rule: AidRule {
                    aid: hex::decode(aid).map_err(|_| Error::InvalidParam("aid is not valid hex"))?,
                    power: PowerState(*power),
                    info: AidInfo(*info),
                },
            },
            RouteConfig::SystemCode { ee, code, power } => Request::AddSystemCode {
                id: *ee,
                rule: SystemCodeRule { code: *code, power: PowerState(*power) },
            },
        })
    }
}
