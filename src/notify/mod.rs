//! Vault transition notifications.
//!
//! The tracker never talks to a messaging API directly. It hands each
//! `VaultEvent` to a `Notifier`, which queues it on an unbounded channel;
//! a dispatcher task drains the queue into a `NotificationSink`. Delivery
//! failures are logged and dropped, so a slow or broken sink can never stall
//! or fail the polling loop.
//!
//! Sinks:
//! - `TelegramSink` (telegram.rs): Bot API `sendMessage`
//! - `FileSink` (file.rs): append-only JSON lines
//! - `LogSink`: tracing only, used when nothing else is configured
//! - `FanoutSink`: delivers to several sinks

pub mod file;
pub mod format;
pub mod telegram;

use crate::vault::{dec_u256, VaultRecord};
use alloy::primitives::U256;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use file::FileSink;
pub use telegram::{TelegramCommandListener, TelegramSink};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected message: status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{failed} of {total} sinks failed")]
    Partial { failed: usize, total: usize },
}

/// A state transition worth telling someone about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VaultEvent {
    /// Best-effort liveness message on startup.
    Startup { vaults: usize, last_block: u64 },
    VaultCreated { record: VaultRecord, filled: bool },
    CapRaised {
        record: VaultRecord,
        #[serde(with = "dec_u256")]
        old_cap: U256,
        #[serde(with = "dec_u256")]
        new_cap: U256,
        #[serde(with = "dec_u256")]
        current_supply: U256,
    },
    VaultFilled { record: VaultRecord },
    /// Capacity opened up again on a previously filled vault.
    VaultAvailable { record: VaultRecord },
}

impl VaultEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            VaultEvent::Startup { .. } => "startup",
            VaultEvent::VaultCreated { .. } => "vault_created",
            VaultEvent::CapRaised { .. } => "cap_raised",
            VaultEvent::VaultFilled { .. } => "vault_filled",
            VaultEvent::VaultAvailable { .. } => "vault_available",
        }
    }

    pub fn vault(&self) -> Option<&VaultRecord> {
        match self {
            VaultEvent::Startup { .. } => None,
            VaultEvent::VaultCreated { record, .. }
            | VaultEvent::CapRaised { record, .. }
            | VaultEvent::VaultFilled { record }
            | VaultEvent::VaultAvailable { record } => Some(record),
        }
    }
}

impl std::fmt::Display for VaultEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultEvent::Startup { vaults, last_block } => {
                write!(f, "Startup(vaults={}, block={})", vaults, last_block)
            }
            VaultEvent::VaultCreated { record, filled } => {
                write!(f, "VaultCreated({}, filled={})", record.address, filled)
            }
            VaultEvent::CapRaised {
                record,
                old_cap,
                new_cap,
                ..
            } => write!(f, "CapRaised({}, {} -> {})", record.address, old_cap, new_cap),
            VaultEvent::VaultFilled { record } => write!(f, "VaultFilled({})", record.address),
            VaultEvent::VaultAvailable { record } => {
                write!(f, "VaultAvailable({})", record.address)
            }
        }
    }
}

/// Something that can deliver a rendered event.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &VaultEvent) -> Result<(), NotifyError>;
}

/// Logs events instead of delivering them.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, event: &VaultEvent) -> Result<(), NotifyError> {
        info!(kind = event.kind(), event = %event, "notification (no sink configured)");
        Ok(())
    }
}

/// Delivers each event to every inner sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn deliver(&self, event: &VaultEvent) -> Result<(), NotifyError> {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(event).await {
                warn!(sink = sink.name(), kind = event.kind(), error = %e, "sink delivery failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(NotifyError::Partial {
                failed,
                total: self.sinks.len(),
            });
        }
        Ok(())
    }
}

/// Non-blocking handle the tracker emits events through.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<VaultEvent>,
}

impl Notifier {
    /// A notifier plus the raw receiving end (tests and custom dispatch).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<VaultEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A notifier whose events are delivered to `sink` by a background task.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> (Self, tokio::task::JoinHandle<()>) {
        let (notifier, rx) = Self::channel();
        let handle = tokio::spawn(dispatch(rx, sink));
        (notifier, handle)
    }

    pub fn emit(&self, event: VaultEvent) {
        debug!(kind = event.kind(), event = %event, "emitting notification");
        if self.tx.send(event).is_err() {
            warn!("notification dispatcher is gone, dropping event");
        }
    }
}

/// Drain `rx` into `sink` until every `Notifier` clone is dropped.
pub async fn dispatch(mut rx: mpsc::UnboundedReceiver<VaultEvent>, sink: Arc<dyn NotificationSink>) {
    while let Some(event) = rx.recv().await {
        match sink.deliver(&event).await {
            Ok(()) => debug!(sink = sink.name(), kind = event.kind(), "notification delivered"),
            Err(e) => warn!(
                sink = sink.name(),
                kind = event.kind(),
                event = %event,
                error = %e,
                "notification delivery failed"
            ),
        }
    }
    debug!("notification dispatcher stopped");
}
