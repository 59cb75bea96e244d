//! Backfiller descriptors and their subscribe/notify handles.
//!
//! A publisher owns the current descriptor; any number of watches observe it.
//! Retraction is an explicit `None` value, and dropping the publisher is
//! reported the same way.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::proto::PROTOCOL_VERSION;
use super::types::Region;

/// Published address record of a live backfiller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct BackfillerDescriptor<R: Region> {
    pub protocol_version: u32,
    /// Transport address of the request mailbox.
    pub address: String,
    /// Region the backfiller is authoritative for.
    pub region_hint: R,
}

impl<R: Region> BackfillerDescriptor<R> {
    pub fn new(address: impl Into<String>, region_hint: R) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            address: address.into(),
            region_hint,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

pub struct DescriptorPublisher<R: Region> {
    tx: watch::Sender<Option<BackfillerDescriptor<R>>>,
}

impl<R: Region> DescriptorPublisher<R> {
    /// A publisher with nothing published yet.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, descriptor: BackfillerDescriptor<R>) {
        tracing::debug!(address = %descriptor.address, region = %descriptor.region_hint, "publishing backfiller");
        self.tx.send_replace(Some(descriptor));
    }

    pub fn retract(&self) {
        tracing::debug!("retracting backfiller");
        self.tx.send_replace(None);
    }

    pub fn subscribe(&self) -> DescriptorWatch<R> {
        DescriptorWatch {
            rx: self.tx.subscribe(),
            _pinned: None,
        }
    }
}

impl<R: Region> Default for DescriptorPublisher<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of a descriptor.
#[derive(Clone)]
pub struct DescriptorWatch<R: Region> {
    rx: watch::Receiver<Option<BackfillerDescriptor<R>>>,
    /// Keeps a fixed watch's sender alive so it never reads as retracted.
    _pinned: Option<Arc<watch::Sender<Option<BackfillerDescriptor<R>>>>>,
}

impl<R: Region> DescriptorWatch<R> {
    /// A watch pinned to a fixed descriptor, for callers that learned the
    /// address out of band.
    pub fn fixed(descriptor: BackfillerDescriptor<R>) -> Self {
        let (tx, rx) = watch::channel(Some(descriptor));
        Self {
            rx,
            _pinned: Some(Arc::new(tx)),
        }
    }

    pub fn current(&self) -> Option<BackfillerDescriptor<R>> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new value. A dropped
    /// publisher reads as retraction.
    pub async fn changed(&mut self) -> Option<BackfillerDescriptor<R>> {
        match self.rx.changed().await {
            Ok(()) => self.rx.borrow_and_update().clone(),
            Err(_) => None,
        }
    }
}
