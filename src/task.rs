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

//! Processing context of the NFCEE manager.
//!
//! All the state of the manager is owned by a single task. Application
//! requests and controller events are posted to the task through an mpsc
//! channel, and the task fires the timeout events when the deadlines set
//! by the manager expire.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manager::{EeManager, EmState, Event, Notification, Request};
use crate::registry::{EeId, EeInfo, EeInterface, TechMask};
use crate::routing::{AidRule, PowerMasks, ProtocolMask, SystemCodeRule};
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Messages processed by the NFCEE task.
#[derive(Debug)]
pub enum Message {
    /// Application request with its acceptance status.
    Request { request: Request, reply: oneshot::Sender<Result<()>> },
    /// Event whose handling is not awaited.
    Event(Event),
    ActiveEnvironments { reply: oneshot::Sender<HashMap<String, TechMask>> },
    Info { reply: oneshot::Sender<Result<Vec<EeInfo>>> },
    LmrtRemainingSize { reply: oneshot::Sender<u16> },
    State { reply: oneshot::Sender<EmState> },
}

/// Task owning the NFCEE manager.
pub struct EeTask {
    manager: EeManager,
    rx: mpsc::UnboundedReceiver<Message>,
}

/// Handle used to post requests and events to the NFCEE task.
#[derive(Clone, Debug)]
pub struct EeHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl EeTask {
    /// Create the task and its handle. Commands for the controller are
    /// sent on `nci_tx`.
    pub fn new(config: Config, nci_tx: mpsc::UnboundedSender<Vec<u8>>) -> (EeTask, EeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EeTask { manager: EeManager::new(config, nci_tx), rx }, EeHandle { tx })
    }

    fn dispatch(&mut self, message: Message) {
        // Replies are dropped when the caller stopped waiting.
        match message {
            Message::Request { request, reply } => {
                let _ = reply.send(self.manager.request(request));
            }
            Message::Event(event) => self.manager.handle(event),
            Message::ActiveEnvironments { reply } => {
                let _ = reply.send(self.manager.active_environments());
            }
            Message::Info { reply } => {
                let _ = reply.send(self.manager.ee_info());
            }
            Message::LmrtRemainingSize { reply } => {
                let _ = reply.send(self.manager.lmrt_remaining_size());
            }
            Message::State { reply } => {
                let _ = reply.send(self.manager.state());
            }
        }
    }

    /// Main routine of the NFCEE task. Returns when every handle is
    /// dropped.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let timeout = self.manager.next_timeout();
            let deadline = timeout.as_ref().map(|(deadline, _)| *deadline);
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.dispatch(message),
                    None => {
                        debug!("nfcee task stopped");
                        return Ok(());
                    }
                },
                _ = time::sleep_until(deadline.unwrap_or_else(time::Instant::now)),
                    if deadline.is_some() =>
                {
                    if let Some((_, event)) = timeout {
                        self.manager.handle(event)
                    }
                }
            }
        }
    }
}

impl EeHandle {
    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::ChannelClosed)
    }

    async fn query<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(message(reply))?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Post an event to the task. This is the delivery path of the
    /// controller responses and notifications.
    pub fn post(&self, event: Event) -> Result<()> {
        self.send(Message::Event(event))
    }

    /// Submit a request and wait for its acceptance.
    pub async fn request(&self, request: Request) -> Result<()> {
        self.query(|reply| Message::Request { request, reply }).await?
    }

    /// Register a listener for the manager notifications.
    pub async fn register(&self) -> Result<mpsc::UnboundedReceiver<Notification>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(Request::Register(tx)).await?;
        Ok(rx)
    }

    pub async fn discover(&self) -> Result<()> {
        self.request(Request::Discover).await
    }

    pub async fn mode_set(&self, id: EeId, enable: bool) -> Result<()> {
        self.request(Request::ModeSet { id, enable }).await
    }

    pub async fn set_technology_routing(
        &self,
        id: EeId,
        masks: PowerMasks<TechMask>,
    ) -> Result<()> {
        self.request(Request::SetTechnologyRouting { id, masks }).await
    }

    pub async fn clear_technology_routing(&self, id: EeId, mask: TechMask) -> Result<()> {
        self.request(Request::ClearTechnologyRouting { id, mask }).await
    }

    pub async fn set_protocol_routing(
        &self,
        id: EeId,
        masks: PowerMasks<ProtocolMask>,
    ) -> Result<()> {
        self.request(Request::SetProtocolRouting { id, masks }).await
    }

    pub async fn clear_protocol_routing(&self, id: EeId, mask: ProtocolMask) -> Result<()> {
        self.request(Request::ClearProtocolRouting { id, mask }).await
    }

    pub async fn add_aid(&self, id: EeId, rule: AidRule) -> Result<()> {
        self.request(Request::AddAid { id, rule }).await
    }

    pub async fn remove_aid(&self, aid: &[u8]) -> Result<()> {
        self.request(Request::RemoveAid { aid: aid.to_vec() }).await
    }

    pub async fn add_system_code(&self, id: EeId, rule: SystemCodeRule) -> Result<()> {
        self.request(Request::AddSystemCode { id, rule }).await
    }

    pub async fn remove_system_code(&self, code: u16) -> Result<()> {
        self.request(Request::RemoveSystemCode { code }).await
    }

    pub async fn clear_routing_table(
        &self,
        technology: bool,
        protocol: bool,
        system_code: bool,
    ) -> Result<()> {
        self.request(Request::ClearRoutingTable { technology, protocol, system_code }).await
    }

    /// Request a commit of the routing table. Completion is reported with
    /// [`Notification::UpdateDone`] or [`Notification::UpdateFailed`].
    pub async fn update_now(&self) -> Result<()> {
        self.request(Request::UpdateNow).await
    }

    pub async fn connect(&self, id: EeId, interface: EeInterface) -> Result<()> {
        self.request(Request::Connect { id, interface }).await
    }

    pub async fn send_data(&self, id: EeId, data: Bytes) -> Result<()> {
        self.request(Request::SendData { id, data }).await
    }

    pub async fn disconnect(&self, id: EeId) -> Result<()> {
        self.request(Request::Disconnect { id }).await
    }

    pub async fn power_and_link_ctrl(&self, id: EeId, config: u8) -> Result<()> {
        self.request(Request::PowerAndLinkCtrl { id, config }).await
    }

    /// Display names and listen technologies of the active NFCEEs.
    pub async fn active_environments(&self) -> Result<HashMap<String, TechMask>> {
        self.query(|reply| Message::ActiveEnvironments { reply }).await
    }

    /// Presence information of the discovered NFCEEs.
    pub async fn info(&self) -> Result<Vec<EeInfo>> {
        self.query(|reply| Message::Info { reply }).await?
    }

    pub async fn lmrt_remaining_size(&self) -> Result<u16> {
        self.query(|reply| Message::LmrtRemainingSize { reply }).await
    }

    pub async fn state(&self) -> Result<EmState> {
        self.query(|reply| Message::State { reply }).await
    }
}
