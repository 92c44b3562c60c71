//! Web Push subscription store and delivery gateway for MebelPlace.
//!
//! Subscriptions are held in memory per user, keyed by endpoint. Delivery goes
//! through a pluggable [`PushProvider`], and every send produces a
//! [`PushSendReport`] instead of an error, a push problem must never take an
//! event broadcast down with it. The [`PushGateway`] also implements
//! [`mebelplace_ws::PushFallback`] so the WebSocket broadcaster can hand off
//! notifications for users who are offline.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use mebelplace_ws::PushFallback;
use mebelplace_ws::models::OutboundPayload;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// VAPID key material identifying this application server to push services.
#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

impl VapidConfig {
    /// Reads the key pair from `VAPID_PUBLIC_KEY` and `VAPID_PRIVATE_KEY`,
    /// and the contact from `VAPID_SUBJECT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            public_key: std::env::var("VAPID_PUBLIC_KEY").unwrap_or_default(),
            private_key: std::env::var("VAPID_PRIVATE_KEY").unwrap_or_default(),
            subject: std::env::var("VAPID_SUBJECT")
                .unwrap_or_else(|_| "mailto:support@mebelplace.com.kz".to_owned()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Error)]
pub enum PushSendError {
    /// The push service no longer knows the endpoint. The subscription is
    /// dead and should be discarded.
    #[error("Subscription expired")]
    Gone,
    #[error("Unknown: {0}")]
    Unknown(String),
}

/// Transport that actually delivers a payload to a push service endpoint.
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// # Errors
    ///
    /// * `PushSendError::Gone` if the endpoint is no longer valid
    /// * If the delivery failed for any other reason
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &str,
    ) -> Result<(), PushSendError>;
}

impl core::fmt::Debug for dyn PushProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("{PushProvider}")
    }
}

/// Placeholder provider used when no Web Push transport is configured. Every
/// delivery attempt fails, which keeps fallback reports honest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPushProvider;

#[async_trait]
impl PushProvider for DisabledPushProvider {
    async fn send(
        &self,
        _subscription: &PushSubscription,
        _payload: &str,
    ) -> Result<(), PushSendError> {
        Err(PushSendError::Unknown(
            "Push provider not configured".to_owned(),
        ))
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushSendResult {
    pub endpoint: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one logical send across all targeted subscriptions. `success`
/// means at least one delivery went through.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushSendReport {
    pub success: bool,
    pub results: Vec<PushSendResult>,
    pub success_count: usize,
    pub total_count: usize,
}

impl PushSendReport {
    const fn empty() -> Self {
        Self {
            success: false,
            results: Vec::new(),
            success_count: 0,
            total_count: 0,
        }
    }
}

#[derive(Debug)]
pub struct PushGateway {
    vapid: VapidConfig,
    provider: Box<dyn PushProvider>,
    subscriptions: RwLock<BTreeMap<u64, Vec<PushSubscription>>>,
}

impl PushGateway {
    #[must_use]
    pub fn new(vapid: VapidConfig, provider: Box<dyn PushProvider>) -> Self {
        Self {
            vapid,
            provider,
            subscriptions: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn vapid_public_key(&self) -> &str {
        &self.vapid.public_key
    }

    /// Stores `subscription` for `user_id`. Re-subscribing an endpoint that is
    /// already known refreshes its keys in place and keeps its original owner.
    ///
    /// # Panics
    ///
    /// * If the subscription store `RwLock` is poisoned
    pub fn subscribe(&self, user_id: u64, subscription: PushSubscription) {
        let mut subscriptions = self.subscriptions.write().unwrap();

        for subs in subscriptions.values_mut() {
            if let Some(existing) = subs
                .iter_mut()
                .find(|s| s.endpoint == subscription.endpoint)
            {
                log::debug!(
                    "Refreshing keys for known push endpoint {}",
                    subscription.endpoint
                );
                existing.keys = subscription.keys;
                return;
            }
        }

        log::debug!("Registered push subscription for user {user_id}");
        subscriptions.entry(user_id).or_default().push(subscription);
    }

    /// Removes the subscription matching `endpoint` for `user_id`, if any.
    ///
    /// # Panics
    ///
    /// * If the subscription store `RwLock` is poisoned
    pub fn unsubscribe(&self, user_id: u64, endpoint: &str) {
        let mut subscriptions = self.subscriptions.write().unwrap();

        if let Some(subs) = subscriptions.get_mut(&user_id) {
            subs.retain(|s| s.endpoint != endpoint);

            if subs.is_empty() {
                subscriptions.remove(&user_id);
            }
        }
    }

    /// Pushes `payload` to every subscription registered for `user_id`.
    ///
    /// # Panics
    ///
    /// * If the subscription store `RwLock` is poisoned
    pub async fn send_to_user(&self, user_id: u64, payload: &str) -> PushSendReport {
        let targets = {
            let subscriptions = self.subscriptions.read().unwrap();
            subscriptions.get(&user_id).cloned().unwrap_or_default()
        };

        if targets.is_empty() {
            log::debug!("No push subscriptions found for user {user_id}");
            return PushSendReport::empty();
        }

        let targets = targets.into_iter().map(|s| (user_id, s)).collect();

        self.deliver(targets, payload).await
    }

    /// Pushes `payload` to every subscription of every user.
    ///
    /// # Panics
    ///
    /// * If the subscription store `RwLock` is poisoned
    pub async fn send_to_all(&self, payload: &str) -> PushSendReport {
        let targets = {
            let subscriptions = self.subscriptions.read().unwrap();
            subscriptions
                .iter()
                .flat_map(|(user_id, subs)| {
                    let user_id = *user_id;
                    subs.iter().cloned().map(move |s| (user_id, s))
                })
                .collect::<Vec<_>>()
        };

        self.deliver(targets, payload).await
    }

    async fn deliver(
        &self,
        targets: Vec<(u64, PushSubscription)>,
        payload: &str,
    ) -> PushSendReport {
        let total_count = targets.len();
        let mut results = Vec::with_capacity(total_count);
        let mut success_count = 0;

        for (user_id, subscription) in targets {
            match self.provider.send(&subscription, payload).await {
                Ok(()) => {
                    success_count += 1;
                    results.push(PushSendResult {
                        endpoint: subscription.endpoint,
                        success: true,
                        error: None,
                    });
                }
                Err(e @ PushSendError::Gone) => {
                    log::debug!("Pruning expired push subscription for user {user_id}");
                    self.unsubscribe(user_id, &subscription.endpoint);
                    results.push(PushSendResult {
                        endpoint: subscription.endpoint,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
                Err(e) => {
                    log::error!("Failed to push to user {user_id}: {e:?}");
                    results.push(PushSendResult {
                        endpoint: subscription.endpoint,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        PushSendReport {
            success: success_count > 0,
            results,
            success_count,
            total_count,
        }
    }
}

#[async_trait]
impl PushFallback for PushGateway {
    async fn send_to_user(&self, user_id: u64, payload: &OutboundPayload) -> bool {
        let data = match serde_json::to_value(payload) {
            Ok(value) => value.to_string(),
            Err(e) => {
                log::error!("Failed to serialize push notification: {e:?}");
                return false;
            }
        };

        self.send_to_user(user_id, data.as_str()).await.success
    }
}
