//! Scripted collaborators for scenario tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_client::credentials::TokenService;
use tether_client::error::{LoadError, RefreshError};
use tether_client::navigation::{ThreadData, ThreadLoader};
use tether_client::transport::{Link, LinkEvent, Transport};
use tether_core::{
    Claims, ClientFrame, ConfirmedMessage, ConnectionError, Credential, MessageId, ResourceId,
    Role, ServerFrame, TempId,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub fn token(sub: &str, lifetime_secs: i64) -> String {
    let now = Utc::now();
    Claims {
        sub: sub.into(),
        iat: now.timestamp(),
        exp: (now + TimeDelta::seconds(lifetime_secs)).timestamp(),
    }
    .encode_unsigned()
}

pub fn expired_token(sub: &str) -> String {
    let now = Utc::now();
    Claims {
        sub: sub.into(),
        iat: (now - TimeDelta::seconds(600)).timestamp(),
        exp: (now - TimeDelta::seconds(1)).timestamp(),
    }
    .encode_unsigned()
}

pub fn credential(sub: &str, lifetime_secs: i64) -> Credential {
    Credential::decode(token(sub, lifetime_secs)).unwrap()
}

pub fn confirmed(id: &str, resource: &str, content: &str, client_ref: Option<&TempId>) -> ConfirmedMessage {
    ConfirmedMessage {
        id: MessageId::new(id),
        resource_id: ResourceId::from(resource),
        role: Role::User,
        content: content.to_string(),
        sent_at: Utc::now(),
        client_ref: client_ref.cloned(),
    }
}

/// Let spawned tasks run. Paused clocks advance only once everything is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub enum OpenStep {
    Accept,
    Fail(ConnectionError),
    /// Accept after a delay.
    Delay(Duration),
    /// Never resolve.
    Hang,
}

struct Remote {
    sent: mpsc::UnboundedReceiver<ClientFrame>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
}

/// Transport whose opens follow a script (accepting once it runs out).
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<OpenStep>>,
    opens: Mutex<Vec<(Instant, String)>>,
    remotes: Mutex<Vec<Remote>>,
    log: Mutex<Vec<ClientFrame>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(steps: Vec<OpenStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn open_tokens(&self) -> Vec<String> {
        self.opens.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    /// Every frame the manager has written, across links, in order.
    pub fn sent(&self) -> Vec<ClientFrame> {
        let mut remotes = self.remotes.lock().unwrap();
        let mut log = self.log.lock().unwrap();
        for remote in remotes.iter_mut() {
            while let Ok(frame) = remote.sent.try_recv() {
                log.push(frame);
            }
        }
        log.clone()
    }

    pub fn credential_updates(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                ClientFrame::CredentialUpdate { token } => Some(token),
                _ => None,
            })
            .collect()
    }

    /// Deliver a frame on the most recent link.
    pub fn push(&self, frame: ServerFrame) {
        let remotes = self.remotes.lock().unwrap();
        let remote = remotes.last().expect("no link open");
        remote.inbound.send(LinkEvent::Frame(frame)).unwrap();
    }

    /// Kill the most recent link.
    pub fn close(&self, error: ConnectionError) {
        let remotes = self.remotes.lock().unwrap();
        let remote = remotes.last().expect("no link open");
        let _ = remote.inbound.send(LinkEvent::Closed(error));
    }

    fn accept(&self) -> Link {
        let (link, sent, inbound) = Link::pair();
        self.remotes.lock().unwrap().push(Remote { sent, inbound });
        link
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, credential: &Credential) -> Result<Link, ConnectionError> {
        self.opens
            .lock()
            .unwrap()
            .push((Instant::now(), credential.token().to_string()));
        let step = self.script.lock().unwrap().pop_front().unwrap_or(OpenStep::Accept);
        match step {
            OpenStep::Accept => Ok(self.accept()),
            OpenStep::Fail(error) => Err(error),
            OpenStep::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept())
            }
            OpenStep::Hang => std::future::pending().await,
        }
    }
}

/// Token service answering from a script.
#[derive(Default)]
pub struct ScriptedTokens {
    responses: Mutex<VecDeque<Result<String, RefreshError>>>,
    calls: AtomicUsize,
}

impl ScriptedTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(responses: Vec<Result<String, RefreshError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenService for ScriptedTokens {
    async fn refresh(&self, _current: &Credential) -> Result<String, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RefreshError::Transient("no scripted response".into())))
    }
}

pub enum LoadStep {
    /// Succeed after a delay, with these messages.
    Ok(Duration, Vec<ConfirmedMessage>),
    Fail(LoadError),
    /// Never resolve unless cancelled.
    Hang,
}

/// Thread loader answering per thread from a script (empty threads once
/// the script runs out).
#[derive(Default)]
pub struct ScriptedLoader {
    scripts: Mutex<HashMap<String, VecDeque<LoadStep>>>,
    calls: Mutex<Vec<String>>,
    observed_cancel: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, resource: &str, steps: Vec<LoadStep>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, resource: &str) -> usize {
        self.calls().iter().filter(|r| *r == resource).count()
    }

    pub fn observed_cancel(&self) -> usize {
        self.observed_cancel.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThreadLoader for ScriptedLoader {
    async fn load(
        &self,
        resource_id: &ResourceId,
        cancel: CancellationToken,
    ) -> Result<ThreadData, LoadError> {
        self.calls.lock().unwrap().push(resource_id.to_string());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(resource_id.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or(LoadStep::Ok(Duration::ZERO, Vec::new()));

        let (delay, messages) = match step {
            LoadStep::Ok(delay, messages) => (delay, messages),
            LoadStep::Fail(error) => return Err(error),
            LoadStep::Hang => {
                cancel.cancelled().await;
                self.observed_cancel.fetch_add(1, Ordering::SeqCst);
                return Err(LoadError::Cancelled);
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                self.observed_cancel.fetch_add(1, Ordering::SeqCst);
                Err(LoadError::Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(ThreadData {
                resource_id: resource_id.clone(),
                title: format!("Thread {resource_id}"),
                messages,
            }),
        }
    }
}
