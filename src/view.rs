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

//! Named view of the active execution environments.

use crate::config::Config;
use crate::registry::{EeId, EeInterface, EeStatus, Registry, TechMask};
use std::collections::HashMap;

const ESE_PREFIX: &str = "eSE";
const UICC_PREFIX: &str = "SIM";
const NDEF_NFCEE_NAME: &str = "NDEF-NFCEE";

/// Display names of the configured route ids. A route id listed more
/// than once keeps its last name.
pub fn route_names(config: &Config) -> HashMap<EeId, String> {
    let mut names = HashMap::new();
    for (index, id) in config.offhost_route_ese.iter().enumerate() {
        names.insert(*id, format!("{}{}", ESE_PREFIX, index + 1));
    }
    for (index, id) in config.offhost_route_uicc.iter().enumerate() {
        names.insert(*id, format!("{}{}", UICC_PREFIX, index + 1));
    }
    if config.t4t_nfcee_enable {
        names.insert(config.default_ndef_nfcee_route, NDEF_NFCEE_NAME.to_owned());
    }
    names
}

/// Map the display name of every active configured NFCEE to its listen
/// technologies.
pub fn compute_active_environments(
    config: &Config,
    registry: &Registry,
) -> HashMap<String, TechMask> {
    let names = route_names(config);
    registry
        .iter()
        .filter(|ecb| !ecb.is_host() && ecb.interface != EeInterface::HciAccess)
        .filter(|ecb| ecb.status == EeStatus::Active)
        .filter_map(|ecb| names.get(&ecb.id).map(|name| (name.clone(), ecb.tech_mask)))
        .collect()
}
