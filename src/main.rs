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

//! NFCEE routing agent.
//!
//! Connects to an NFCC exposing NCI over TCP, discovers the NFCEEs, and
//! commits the routing rules listed in the configuration file.

use anyhow::Result;
use argh::FromArgs;
use log::{debug, info, warn};
use nfcee_router::config::Config;
use nfcee_router::packets;
use nfcee_router::transport::{NciReader, NciWriter};
use nfcee_router::{EeTask, Event, Notification};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(FromArgs, Debug)]
/// NFCEE routing agent.
struct Opt {
    #[argh(option)]
    /// path of the TOML configuration file.
    config: Option<PathBuf>,
    #[argh(option, default = "7000")]
    /// configure the TCP port of the NCI server.
    nci_port: u16,
}

async fn run() -> Result<()> {
    let opt: Opt = argh::from_env();
    let config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let socket = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, opt.nci_port)).await?;
    info!("Connected to NCI server at address 127.0.0.1:{}", opt.nci_port);
    let (nci_rx, nci_tx) = socket.into_split();
    let nci_reader = NciReader::new(nci_rx);
    let nci_writer = NciWriter::new(nci_tx);

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (task, handle) = EeTask::new(config.clone(), command_tx);

    let result: Result<((), (), (), ())> = futures::future::try_join4(
        // NFCEE manager.
        async { task.run().await.map_err(anyhow::Error::from) },
        // NCI event handler.
        async {
            loop {
                let packet = nci_reader.read().await?;
                match packets::decode(&packet) {
                    Some(event) => handle.post(Event::Nci(event))?,
                    None => debug!("ignoring nci packet {}", hex::encode(&packet)),
                }
            }
        },
        // NCI command writer.
        async {
            loop {
                let command =
                    command_rx.recv().await.ok_or(anyhow::anyhow!("command channel closed"))?;
                nci_writer.write(&command).await?
            }
        },
        // Routing configuration.
        async {
            let mut notifications = handle.register().await?;
            handle.post(Event::ControllerEnabled)?;
            for route in &config.routes {
                if let Err(err) = handle.request(route.to_request()?).await {
                    warn!("rejected route {:?}: {}", route, err);
                }
            }
            handle.update_now().await?;

            loop {
                let notification = notifications
                    .recv()
                    .await
                    .ok_or(anyhow::anyhow!("notification channel closed"))?;
                info!("{:?}", notification);
                if notification == Notification::UpdateDone {
                    for (name, technologies) in handle.active_environments().await? {
                        info!("{}: technologies {:#04x}", name, technologies.0);
                    }
                }
            }
        },
    )
    .await;
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "debug"),
    );
    run().await
}
