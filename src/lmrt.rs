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

//! Listen Mode Routing Table packetization.
//!
//! The canonical table is split into RF_SET_LISTEN_MODE_ROUTING_CMD
//! packets chained with the More flag. Observed routing commands can be
//! parsed back into packets and accumulated into a capture history used
//! for diagnostics.

use crate::error::{Error, Result};
use crate::registry::EeId;
use crate::routing::PowerState;
use log::debug;

/// GID/OID header of RF_SET_LISTEN_MODE_ROUTING_CMD.
pub const SET_LISTEN_MODE_ROUTING_CMD: [u8; 2] = [0x21, 0x01];

/// Size of the opcode and length fields of a routing command.
const COMMAND_HEADER_SIZE: usize = 3;
/// Size of the More and Number of Routing Entries fields.
const PAYLOAD_HEADER_SIZE: usize = 2;
/// Size of the type and length fields of a routing entry.
const TLV_HEADER_SIZE: usize = 2;

/// One routing entry in its wire encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvEntry {
    pub tlv_type: u8,
    value: Vec<u8>,
}

impl TlvEntry {
    /// Create a routing entry. The value is limited to 255 bytes.
    pub fn new(tlv_type: u8, value: Vec<u8>) -> Result<TlvEntry> {
        if value.len() > u8::MAX as usize {
            return Err(Error::InvalidParam("routing entry value exceeds 255 bytes"));
        }
        Ok(TlvEntry { tlv_type, value })
    }

    /// Create a routing entry `[nfcee_id, power_state, payload..]`.
    /// Payloads are bounded by the AID length, so the entry always fits.
    pub(crate) fn route(tlv_type: u8, id: EeId, power: PowerState, payload: &[u8]) -> TlvEntry {
        let mut value = Vec::with_capacity(2 + payload.len());
        value.push(id);
        value.push(power.0);
        value.extend_from_slice(payload);
        TlvEntry { tlv_type, value }
    }

    /// Value of the entry.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Length field of the entry.
    pub fn len(&self) -> u8 {
        self.value.len() as u8
    }

    /// Return true if the entry has an empty value.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Number of bytes taken by the entry in a routing command.
    pub fn encoded_size(&self) -> usize {
        TLV_HEADER_SIZE + self.value.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.tlv_type);
        out.push(self.len());
        out.extend_from_slice(&self.value);
    }

    /// Wire encoding of the entry.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        self.write(&mut out);
        out
    }
}

/// Total encoded size of a routing table.
pub fn encoded_size(table: &[TlvEntry]) -> usize {
    table.iter().map(TlvEntry::encoded_size).sum()
}

/// Payload of one RF_SET_LISTEN_MODE_ROUTING_CMD.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LmrtPacket {
    pub more: bool,
    pub tlvs: Vec<TlvEntry>,
}

impl LmrtPacket {
    /// Number of Routing Entries field of the packet.
    pub fn entry_count(&self) -> u8 {
        self.tlvs.len() as u8
    }

    /// Concatenated wire encoding of the routing entries.
    pub fn tlv_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        for tlv in &self.tlvs {
            tlv.write(&mut out);
        }
        out
    }

    /// Serialize the packet into a complete routing command.
    pub fn to_command(&self) -> Result<Vec<u8>> {
        let tlvs = self.tlv_bytes();
        let length = PAYLOAD_HEADER_SIZE + tlvs.len();
        let length = u8::try_from(length)
            .map_err(|_| Error::TableEntryTooLarge { size: length, max: u8::MAX as usize })?;
        let mut command = Vec::with_capacity(COMMAND_HEADER_SIZE + length as usize);
        command.extend_from_slice(&SET_LISTEN_MODE_ROUTING_CMD);
        command.push(length);
        command.push(self.more as u8);
        command.push(self.entry_count());
        command.extend_from_slice(&tlvs);
        Ok(command)
    }
}

/// Split the canonical table into packets carrying at most `max_size`
/// bytes of routing entries each. Every packet but the last has the More
/// flag set; an empty table yields a single empty packet.
pub fn split(table: &[TlvEntry], max_size: u16) -> Result<Vec<LmrtPacket>> {
    let max_size = max_size as usize;
    let mut packets = vec![];
    let mut current = LmrtPacket::default();
    let mut current_size = 0;

    for entry in table {
        let size = entry.encoded_size();
        if size > max_size {
            return Err(Error::TableEntryTooLarge { size, max: max_size });
        }
        if !current.tlvs.is_empty()
            && (current_size + size > max_size || current.tlvs.len() == u8::MAX as usize)
        {
            current.more = true;
            packets.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.tlvs.push(entry.clone());
        current_size += size;
    }

    packets.push(current);
    Ok(packets)
}

/// Parse a routing command `{opcode(2), len(1), more(1), count(1), tlv..}`.
/// Returns None if the buffer is truncated, the declared length does not
/// match, or the entry count does not match the decoded entries.
pub fn parse(buffer: &[u8]) -> Option<LmrtPacket> {
    if buffer.len() < COMMAND_HEADER_SIZE + PAYLOAD_HEADER_SIZE {
        return None;
    }
    if buffer[2] as usize != buffer.len() - COMMAND_HEADER_SIZE {
        return None;
    }
    let more = match buffer[3] {
        0 => false,
        1 => true,
        _ => return None,
    };
    let entry_count = buffer[4] as usize;

    let mut tlvs = vec![];
    let mut rest = &buffer[COMMAND_HEADER_SIZE + PAYLOAD_HEADER_SIZE..];
    while !rest.is_empty() {
        if rest.len() < TLV_HEADER_SIZE {
            return None;
        }
        let length = rest[1] as usize;
        let value = rest.get(TLV_HEADER_SIZE..TLV_HEADER_SIZE + length)?;
        tlvs.push(TlvEntry { tlv_type: rest[0], value: value.to_vec() });
        rest = &rest[TLV_HEADER_SIZE + length..];
    }

    (tlvs.len() == entry_count).then_some(LmrtPacket { more, tlvs })
}

/// History of the routing commands observed on the NCI interface.
#[derive(Clone, Debug, Default)]
pub struct LmrtCapture {
    payloads: Vec<LmrtPacket>,
    committed_tlvs: Vec<u8>,
}

impl LmrtCapture {
    /// Create an empty capture history.
    pub fn new() -> LmrtCapture {
        Default::default()
    }

    /// Clear the captured packets.
    pub fn init(&mut self) {
        self.payloads.clear();
    }

    /// Record an observed routing command. A command following the last
    /// packet of a table starts a new history. Completing a table refreshes
    /// the committed entries and logs the history.
    pub fn capture(&mut self, buffer: &[u8]) -> Result<()> {
        let packet = parse(buffer).ok_or(Error::MalformedCapture)?;
        if self.payloads.last().is_some_and(|last| !last.more) {
            self.payloads.clear();
        }
        let complete = !packet.more;
        self.payloads.push(packet);
        if complete {
            self.update();
            self.log();
        }
        Ok(())
    }

    /// Rebuild the committed entries from the captured packets.
    pub fn update(&mut self) {
        self.committed_tlvs = self.payloads.iter().flat_map(LmrtPacket::tlv_bytes).collect();
    }

    /// Captured packets, in order.
    pub fn payloads(&self) -> &[LmrtPacket] {
        &self.payloads
    }

    /// Concatenated routing entries of the last complete table.
    pub fn committed_tlvs(&self) -> &[u8] {
        &self.committed_tlvs
    }

    /// Log the captured packets.
    pub fn log(&self) {
        if self.payloads.is_empty() {
            debug!("lmrt_log: No payloads to log");
            return;
        }
        let count = self.payloads.len();
        for (index, packet) in self.payloads.iter().enumerate() {
            debug!("lmrt_log: Packet {}/{}", index + 1, count);
            debug!("lmrt_log: {} entries in this packet", packet.entry_count());
            debug!("lmrt_log: tlv: {}", hex::encode(packet.tlv_bytes()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(bytes: &[u8]) -> TlvEntry {
        TlvEntry::new(bytes[0], bytes[2..].to_vec()).unwrap()
    }

    fn sample_table() -> Vec<TlvEntry> {
        vec![
            tlv(&[0x52, 0x02, 0x00, 0x11]),
            tlv(&[0x43, 0x04, 0xc0, 0x3b, 0xfe, 0xfe]),
            tlv(&[0x41, 0x03, 0x00, 0x11, 0x04]),
            tlv(&[0x00, 0x03, 0xc0, 0x3b, 0x02]),
            tlv(&[0x00, 0x03, 0x00, 0x39, 0x00]),
            tlv(&[0x00, 0x03, 0x00, 0x39, 0x01]),
        ]
    }

    fn seeded_capture() -> LmrtCapture {
        let mut capture = LmrtCapture::new();
        for packet in split(&sample_table(), 6).unwrap() {
            capture.capture(&packet.to_command().unwrap()).unwrap();
        }
        capture
    }

    #[test]
    fn split_round_trip() {
        let table = sample_table();
        for max_size in [6, 7, 10, 12, 25, 253] {
            let packets = split(&table, max_size).unwrap();
            let joined: Vec<TlvEntry> = packets.iter().flat_map(|p| p.tlvs.clone()).collect();
            assert_eq!(joined, table);
            assert_eq!(packets.iter().filter(|p| !p.more).count(), 1);
            assert!(!packets.last().unwrap().more);
            assert!(packets.iter().all(|p| p.tlvs.iter().map(TlvEntry::encoded_size).sum::<usize>()
                <= max_size as usize));
        }
    }

    #[test]
    fn split_is_greedy() {
        let packets = split(&sample_table(), 12).unwrap();
        let counts: Vec<u8> = packets.iter().map(LmrtPacket::entry_count).collect();
        assert_eq!(counts, vec![2, 2, 2]);
        assert_eq!(packets.iter().map(|p| p.more).collect::<Vec<_>>(), vec![true, true, false]);
    }

    #[test]
    fn split_empty_table() {
        let packets = split(&[], 253).unwrap();
        assert_eq!(packets, vec![LmrtPacket { more: false, tlvs: vec![] }]);
        assert_eq!(packets[0].to_command().unwrap(), vec![0x21, 0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn split_rejects_oversize_entry() {
        assert_eq!(
            split(&sample_table(), 5),
            Err(Error::TableEntryTooLarge { size: 6, max: 5 })
        );
    }

    #[test]
    fn parse_rejects_invalid_buffers() {
        assert_eq!(parse(&[]), None);
        assert_eq!(parse(&[0x20, 0x01, 0x00]), None);
        // Declared length longer than the buffer.
        assert_eq!(parse(&[0x20, 0x01, 0x08, 0x00, 0x01, 0x00, 0x03, 0x00, 0x39, 0x01]), None);
        // Truncated routing entry.
        assert_eq!(parse(&[0x20, 0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x00, 0x39]), None);
        // Entry count mismatch.
        assert_eq!(parse(&[0x20, 0x01, 0x07, 0x00, 0x02, 0x00, 0x03, 0x00, 0x39, 0x01]), None);
    }

    #[test]
    fn parse_single_entry() {
        let packet = parse(&[0x20, 0x01, 0x07, 0x00, 0x01, 0x00, 0x03, 0x00, 0x39, 0x01]).unwrap();
        assert!(!packet.more);
        assert_eq!(packet.entry_count(), 1);
        assert_eq!(packet.tlvs[0].to_bytes(), vec![0x00, 0x03, 0x00, 0x39, 0x01]);
    }

    #[test]
    fn parse_empty_payload() {
        let packet = parse(&[0x20, 0x01, 0x02, 0x00, 0x00]).unwrap();
        assert!(!packet.more);
        assert_eq!(packet.entry_count(), 0);
        assert!(packet.tlvs.is_empty());
    }

    #[test]
    fn parse_keeps_unknown_entry_types() {
        let packet = parse(&[0x21, 0x01, 0x06, 0x01, 0x01, 0x0a, 0x02, 0xde, 0xad]).unwrap();
        assert!(packet.more);
        assert_eq!(packet.tlvs[0].tlv_type, 0x0a);
        assert_eq!(packet.tlvs[0].value(), &[0xde, 0xad]);
    }

    #[test]
    fn init_clears_payloads() {
        let mut capture = seeded_capture();
        assert_eq!(capture.payloads().len(), 6);
        capture.init();
        assert!(capture.payloads().is_empty());
    }

    #[test]
    fn invalid_capture_keeps_history() {
        let mut capture = seeded_capture();
        let before = capture.payloads().to_vec();
        assert_eq!(capture.capture(&[]), Err(Error::MalformedCapture));
        assert_eq!(capture.capture(&[0x20, 0x01, 0x00]), Err(Error::MalformedCapture));
        assert_eq!(capture.payloads(), &before[..]);
        assert_eq!(capture.payloads().iter().map(|p| p.more).collect::<Vec<_>>(), vec![
            true, true, true, true, true, false
        ]);
    }

    #[test]
    fn capture_after_complete_table_starts_new_history() {
        let mut capture = seeded_capture();
        capture.capture(&[0x20, 0x01, 0x07, 0x00, 0x01, 0x00, 0x03, 0x00, 0x39, 0x01]).unwrap();
        assert_eq!(capture.payloads().len(), 1);
        assert!(!capture.payloads()[0].more);
        assert_eq!(capture.payloads()[0].entry_count(), 1);
        assert_eq!(capture.committed_tlvs(), &[0x00, 0x03, 0x00, 0x39, 0x01]);
    }

    #[test]
    fn capture_chained_packets() {
        let mut capture = LmrtCapture::new();
        capture.capture(&[0x21, 0x01, 0x07, 0x01, 0x01, 0x00, 0x03, 0x00, 0x39, 0x00]).unwrap();
        assert!(capture.committed_tlvs().is_empty());
        capture.capture(&[0x21, 0x01, 0x07, 0x00, 0x01, 0x00, 0x03, 0x00, 0x39, 0x01]).unwrap();
        assert_eq!(capture.payloads().len(), 2);
        assert_eq!(
            capture.committed_tlvs(),
            &[0x00, 0x03, 0x00, 0x39, 0x00, 0x00, 0x03, 0x00, 0x39, 0x01]
        );
    }

    #[test]
    fn capture_empty_table() {
        let mut capture = seeded_capture();
        capture.capture(&[0x20, 0x01, 0x02, 0x00, 0x00]).unwrap();
        assert_eq!(capture.payloads().len(), 1);
        assert_eq!(capture.payloads()[0].entry_count(), 0);
        assert!(capture.payloads()[0].tlvs.is_empty());
        assert!(capture.committed_tlvs().is_empty());
    }
}
