//! Change-of-value subscriptions, both sides
//!
//! Client side: [`Application::change_of_value`] subscribes and returns a
//! [`CovSubscription`] guard that queues matching notifications, refreshes
//! the subscription before the lifetime lapses, and unsubscribes on
//! [`CovSubscription::unsubscribe`]. Dropping the guard cancels the refresh
//! timer; the explicit unsubscribe also tells the server.
//!
//! Server side: [`CovServer`] keeps one subscription list per monitored
//! object and fans out notifications when an applicable property changes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

use crate::{
    apdu::{ConfirmedService, ErrorClass, ErrorCode, UnconfirmedService},
    app::Application,
    constructed::{Any, PropertyValue, TypeSpec},
    error::{Error, Result},
    object::PropertyIdentifier,
    pdu::Address,
    primitives::ObjectIdentifier,
    service::{CovNotification, CovValue, ServiceParameters, SubscribeCov},
};

/// the subscription is refreshed this long before it would lapse
const REFRESH_MARGIN: Duration = Duration::from_secs(2);

type ClientKey = (Address, u32, ObjectIdentifier);

/// Client-side notification routing
pub(crate) struct CovClient {
    sinks: Mutex<HashMap<ClientKey, mpsc::Sender<CovNotification>>>,
}

impl CovClient {
    pub(crate) fn new() -> Self {
        CovClient {
            sinks: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, key: ClientKey) -> mpsc::Receiver<CovNotification> {
        let (tx, rx) = mpsc::channel(16);
        self.sinks.lock().expect("poisoned").insert(key, tx);
        rx
    }

    fn unregister(&self, key: &ClientKey) {
        self.sinks.lock().expect("poisoned").remove(key);
    }

    /// route an incoming notification to its subscription, if any
    pub(crate) fn deliver(&self, source: &Address, notification: CovNotification) {
        let key = (
            source.clone(),
            notification.subscriber_process_identifier,
            notification.monitored_object_identifier,
        );
        let sink = self.sinks.lock().expect("poisoned").get(&key).cloned();
        match sink {
            Some(tx) => {
                if tx.try_send(notification).is_err() {
                    debug!("notification queue full, dropping");
                }
            }
            None => debug!("notification with no matching subscription"),
        }
    }
}

/// An active client-side COV subscription.
///
/// Notifications queue as they arrive; `notification`/`get_value` pop them.
/// The refresh timer re-subscribes at `lifetime - 2 s` (none when the
/// lifetime is 0, which is indefinite).
pub struct CovSubscription {
    app: Arc<Application>,
    peer: Address,
    process_id: u32,
    monitored: ObjectIdentifier,
    confirmed: bool,
    rx: mpsc::Receiver<CovNotification>,
    refresh: Option<tokio::task::JoinHandle<()>>,
}

impl CovSubscription {
    /// the next queued notification
    pub async fn notification(&mut self) -> Option<CovNotification> {
        self.rx.recv().await
    }

    /// Pop the next notification and decode its present-value against the
    /// monitored object's property table.
    pub async fn get_value(&mut self) -> Result<PropertyValue> {
        let notification = self.notification().await.ok_or(Error::Cancelled)?;
        let present = notification
            .list_of_values
            .iter()
            .find(|v| v.property_identifier == PropertyIdentifier::PresentValue)
            .ok_or_else(|| {
                Error::execution(ErrorClass::Property, ErrorCode::UnknownProperty)
            })?;
        let spec = self
            .app
            .declared_type(
                &self.peer,
                self.monitored,
                PropertyIdentifier::PresentValue,
                None,
            )
            .unwrap_or(TypeSpec::Opaque);
        Ok(present.value.decode_as(&spec)?)
    }

    /// Cancel with the server and tear the subscription down. The
    /// cancellation form omits both issueConfirmed and lifetime.
    pub async fn unsubscribe(mut self) -> Result<()> {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        let cancel = SubscribeCov {
            subscriber_process_identifier: self.process_id,
            monitored_object_identifier: self.monitored,
            issue_confirmed_notifications: None,
            lifetime: None,
        };
        let rx = self
            .app
            .asap()
            .request(
                self.peer.clone(),
                ConfirmedService::SubscribeCov,
                cancel.to_bytes()?,
            )
            .await?;
        let _ = rx.await;
        Ok(())
    }

    /// true when this subscription uses confirmed notifications
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }
}

impl Drop for CovSubscription {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        self.app
            .cov_client
            .unregister(&(self.peer.clone(), self.process_id, self.monitored));
    }
}

impl Application {
    /// Subscribe to change-of-value notifications for an object on a peer.
    ///
    /// `lifetime` is in seconds; 0 subscribes indefinitely. The returned
    /// guard queues notifications and refreshes the subscription shortly
    /// before it lapses.
    pub async fn change_of_value(
        self: &Arc<Self>,
        peer: Address,
        monitored: ObjectIdentifier,
        process_id: u32,
        confirmed: bool,
        lifetime: u32,
    ) -> Result<CovSubscription> {
        let key = (peer.clone(), process_id, monitored);
        let rx = self.cov_client.register(key.clone());

        let subscribe = SubscribeCov {
            subscriber_process_identifier: process_id,
            monitored_object_identifier: monitored,
            issue_confirmed_notifications: Some(confirmed),
            lifetime: Some(lifetime),
        };
        let bytes = subscribe.to_bytes()?;
        let result = async {
            let ack = self
                .asap()
                .request(peer.clone(), ConfirmedService::SubscribeCov, bytes.clone())
                .await?;
            ack.await.map_err(|_| Error::Cancelled)??;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = result {
            self.cov_client.unregister(&key);
            return Err(e);
        }

        let refresh = (lifetime > 0).then(|| {
            let app = self.clone();
            let peer = peer.clone();
            let interval = Duration::from_secs(lifetime.into())
                .saturating_sub(REFRESH_MARGIN)
                .max(Duration::from_secs(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let request = app
                        .asap()
                        .request(
                            peer.clone(),
                            ConfirmedService::SubscribeCov,
                            bytes.clone(),
                        )
                        .await;
                    match request {
                        Ok(ack) => match ack.await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("subscription refresh refused: {e}"),
                            Err(_) => warn!("subscription refresh cancelled"),
                        },
                        Err(e) => warn!("subscription refresh failed: {e}"),
                    }
                }
            })
        });

        Ok(CovSubscription {
            app: self.clone(),
            peer,
            process_id,
            monitored,
            confirmed,
            rx,
            refresh,
        })
    }
}

struct ServerSubscription {
    client: Address,
    process_id: u32,
    monitored: ObjectIdentifier,
    confirmed: bool,
    /// None while the subscription is indefinite
    expires_at: Option<Instant>,
    /// last value a notification reported, for increment suppression
    last_notified: Option<PropertyValue>,
}

/// Server-side subscription lists, per monitored object
pub(crate) struct CovServer {
    subscriptions: Mutex<Vec<ServerSubscription>>,
}

impl CovServer {
    pub(crate) fn new() -> Self {
        CovServer {
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// handle a SubscribeCOV request: add, refresh, or cancel
    pub(crate) fn subscribe(&self, client: &Address, request: &SubscribeCov) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().expect("poisoned");
        let position = subscriptions.iter().position(|s| {
            s.client == *client
                && s.process_id == request.subscriber_process_identifier
                && s.monitored == request.monitored_object_identifier
        });

        if request.is_cancellation() {
            if let Some(position) = position {
                subscriptions.remove(position);
            }
            return Ok(());
        }

        let lifetime = request.lifetime.unwrap_or(0);
        let expires_at =
            (lifetime > 0).then(|| Instant::now() + Duration::from_secs(lifetime.into()));
        let subscription = ServerSubscription {
            client: client.clone(),
            process_id: request.subscriber_process_identifier,
            monitored: request.monitored_object_identifier,
            confirmed: request.issue_confirmed_notifications.unwrap_or(false),
            expires_at,
            last_notified: None,
        };
        match position {
            Some(position) => subscriptions[position] = subscription,
            None => subscriptions.push(subscription),
        }
        Ok(())
    }

    /// live subscription count, expired entries purged
    pub(crate) fn active_count(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock().expect("poisoned");
        let now = Instant::now();
        subscriptions.retain(|s| s.expires_at.is_none_or(|e| e > now));
        subscriptions.len()
    }

    /// fan a change out to every live subscription on the object
    pub(crate) async fn notify_subscribers(
        &self,
        app: &Arc<Application>,
        monitored: ObjectIdentifier,
        present: PropertyValue,
        flags: PropertyValue,
    ) {
        // the object's cov-increment suppresses small analog changes
        let increment = match app.object(monitored) {
            Some(object) => match object
                .read_property(PropertyIdentifier::CovIncrement, None)
                .await
            {
                Ok(PropertyValue::Real(increment)) => Some(increment),
                _ => None,
            },
            None => None,
        };

        let now = Instant::now();
        let targets: Vec<(Address, u32, bool, u32)> = {
            let mut subscriptions = self.subscriptions.lock().expect("poisoned");
            subscriptions.retain(|s| s.expires_at.is_none_or(|e| e > now));
            subscriptions
                .iter_mut()
                .filter(|s| s.monitored == monitored)
                .filter(|s| {
                    let significant = match (&s.last_notified, &present, increment) {
                        (Some(PropertyValue::Real(last)), PropertyValue::Real(new), Some(inc)) => {
                            (new - last).abs() >= inc
                        }
                        _ => true,
                    };
                    significant
                })
                .map(|s| {
                    s.last_notified = Some(present.clone());
                    let remaining = s
                        .expires_at
                        .map(|e| e.saturating_duration_since(now).as_secs() as u32)
                        .unwrap_or(0);
                    (s.client.clone(), s.process_id, s.confirmed, remaining)
                })
                .collect()
        };

        for (client, process_id, confirmed, time_remaining) in targets {
            let notification = CovNotification {
                subscriber_process_identifier: process_id,
                initiating_device_identifier: app.device_id(),
                monitored_object_identifier: monitored,
                time_remaining,
                list_of_values: match (Any::from_value(&present), Any::from_value(&flags)) {
                    (Ok(present), Ok(flags)) => vec![
                        CovValue {
                            property_identifier: PropertyIdentifier::PresentValue,
                            property_array_index: None,
                            value: present,
                        },
                        CovValue {
                            property_identifier: PropertyIdentifier::StatusFlags,
                            property_array_index: None,
                            value: flags,
                        },
                    ],
                    _ => continue,
                },
            };
            let bytes = match notification.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    warn!("notification encode failed: {e}");
                    continue;
                }
            };
            if confirmed {
                // an ordinary confirmed transaction; completion tracked by
                // its own TSM
                match app
                    .asap()
                    .request(
                        client.clone(),
                        ConfirmedService::ConfirmedCovNotification,
                        bytes,
                    )
                    .await
                {
                    Ok(ack) => {
                        tokio::spawn(async move {
                            if let Ok(Err(e)) = ack.await {
                                debug!("confirmed notification to {client:?} failed: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("confirmed notification send failed: {e}"),
                }
            } else if let Err(e) = app
                .asap()
                .send_unconfirmed(
                    &client,
                    UnconfirmedService::UnconfirmedCovNotification,
                    bytes,
                )
                .await
            {
                warn!("unconfirmed notification send failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Mac;

    fn subscription(process_id: u32, lifetime: Option<u32>) -> SubscribeCov {
        SubscribeCov {
            subscriber_process_identifier: process_id,
            monitored_object_identifier: ObjectIdentifier::new(
                crate::object::ObjectType::AnalogInput,
                1,
            ),
            issue_confirmed_notifications: Some(false),
            lifetime,
        }
    }

    #[tokio::test]
    async fn subscribe_refresh_and_cancel() {
        let server = CovServer::new();
        let client = Address::local_station(Mac::station(5));

        server.subscribe(&client, &subscription(1, Some(60))).unwrap();
        assert_eq!(server.active_count(), 1);
        // same triple refreshes in place
        server.subscribe(&client, &subscription(1, Some(120))).unwrap();
        assert_eq!(server.active_count(), 1);
        // different process id is a second subscription
        server.subscribe(&client, &subscription(2, Some(60))).unwrap();
        assert_eq!(server.active_count(), 2);

        let mut cancel = subscription(1, None);
        cancel.issue_confirmed_notifications = None;
        assert!(cancel.is_cancellation());
        server.subscribe(&client, &cancel).unwrap();
        assert_eq!(server.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_expiry_purges() {
        let server = CovServer::new();
        let client = Address::local_station(Mac::station(5));
        server.subscribe(&client, &subscription(1, Some(1))).unwrap();
        assert_eq!(server.active_count(), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(server.active_count(), 0);
    }
}
