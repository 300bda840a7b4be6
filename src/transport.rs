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

//! NCI transport.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const HEADER_SIZE: usize = 3;
const PBF_MASK: u8 = 0x10;
const MAX_SEGMENT_SIZE: usize = 255;

/// Read NCI Control and Data packets received on the NCI transport.
/// Performs recombination of the segmented packets.
pub struct NciReader<R> {
    socket: Mutex<R>,
}

/// Write NCI Control and Data packets to the NCI transport.
/// Performs segmentation of the packets.
pub struct NciWriter<W> {
    socket: Mutex<W>,
}

impl<R: AsyncRead + Unpin> NciReader<R> {
    /// Create a new NCI reader from the read half of the transport.
    pub fn new(socket: R) -> Self {
        NciReader { socket: Mutex::new(socket) }
    }

    /// Read a single NCI packet from the reader. The packet is automatically
    /// re-assembled if segmented on the NCI transport.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut socket = self.socket.lock().await;
        let mut complete_packet = vec![0; HEADER_SIZE];

        // Segments of one message share the same MT, GID and OID (or
        // Conn ID) values, keeping the last header is correct.
        loop {
            let mut header = [0; HEADER_SIZE];
            socket.read_exact(&mut header).await?;
            complete_packet[..HEADER_SIZE].copy_from_slice(&header);

            let mut payload_bytes = vec![0; header[2] as usize];
            socket.read_exact(&mut payload_bytes).await?;
            complete_packet.extend(payload_bytes);

            if header[0] & PBF_MASK == 0 {
                complete_packet[0] &= !PBF_MASK;
                let length = complete_packet.len() - HEADER_SIZE;
                complete_packet[2] = u8::try_from(length).unwrap_or(u8::MAX);
                return Ok(complete_packet);
            }
        }
    }
}

impl<W: AsyncWrite + Unpin> NciWriter<W> {
    /// Create a new NCI writer from the write half of the transport.
    pub fn new(socket: W) -> Self {
        NciWriter { socket: Mutex::new(socket) }
    }

    /// Write a single NCI packet to the writer. The packet is automatically
    /// segmented if the payload exceeds the maximum size limit.
    pub async fn write(&self, packet: &[u8]) -> Result<()> {
        if packet.len() < HEADER_SIZE {
            anyhow::bail!("truncated nci packet of {} bytes", packet.len());
        }
        let mut socket = self.socket.lock().await;
        let mut header_bytes = [packet[0], packet[1], 0];
        let mut payload = &packet[HEADER_SIZE..];

        loop {
            let chunk_length = std::cmp::min(MAX_SEGMENT_SIZE, payload.len());
            header_bytes[0] &= !PBF_MASK;
            if chunk_length < payload.len() {
                header_bytes[0] |= PBF_MASK;
            }
            header_bytes[2] = chunk_length as u8;

            socket.write_all(&header_bytes).await?;
            socket.write_all(&payload[..chunk_length]).await?;
            payload = &payload[chunk_length..];

            if payload.is_empty() {
                return Ok(());
            }
        }
    }
}
