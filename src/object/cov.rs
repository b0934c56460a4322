//! Change-of-value subscriptions (Clause 13.1, 13.14-13.15).
//!
//! Two subscription kinds, each bounded by a configurable cap:
//!
//! - *Object subscriptions* (SubscribeCOV) fire on any change of the
//!   distinguished properties, Present_Value and Status_Flags.
//! - *Property subscriptions* (SubscribeCOVProperty) watch one
//!   `(object, property, optional index)` and may carry a COV increment:
//!   numeric changes smaller than the increment are suppressed.
//!
//! The manager is fed by the database's change listener and emits
//! notification data through an injected callback; the application layer
//! encodes and sends the actual (un)confirmed COVNotification APDUs. An
//! initial notification is emitted at subscribe time. Confirmed
//! notifications that keep failing are demoted to unconfirmed rather than
//! dropped.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::database::{ChangeEvent, ObjectDatabase};
use super::{
    ObjectError, ObjectIdentifier, PropertyIdentifier, PropertyValue, Result,
};
use crate::network::address::BacnetAddress;

/// Consecutive confirmed-notification failures before demotion.
const DEMOTE_AFTER_FAILURES: u32 = 3;

/// COV manager limits and timing.
#[derive(Debug, Clone)]
pub struct CovConfig {
    pub max_object_subscriptions: usize,
    pub max_property_subscriptions: usize,
    pub reaper_interval: Duration,
}

impl Default for CovConfig {
    fn default() -> Self {
        Self {
            max_object_subscriptions: 64,
            max_property_subscriptions: 64,
            reaper_interval: Duration::from_secs(10),
        }
    }
}

/// Identity of a subscription: subscriber, process, object, and the
/// monitored property for the property-subscription kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionKey {
    pub subscriber: BacnetAddress,
    pub process_id: u32,
    pub object_id: ObjectIdentifier,
    pub monitored: Option<(PropertyIdentifier, Option<u32>)>,
}

struct Subscription {
    key: SubscriptionKey,
    confirmed: bool,
    expiry: Option<Instant>,
    cov_increment: Option<f64>,
    last_notified: Option<PropertyValue>,
    failures: u32,
}

impl Subscription {
    fn expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    fn time_remaining(&self) -> u32 {
        match self.expiry {
            None => 0,
            Some(expiry) => expiry
                .saturating_duration_since(Instant::now())
                .as_secs()
                .min(u64::from(u32::MAX)) as u32,
        }
    }
}

/// Data handed to the notification callback; the application encodes it
/// into a COVNotification APDU.
#[derive(Debug, Clone)]
pub struct CovNotificationData {
    pub subscriber: BacnetAddress,
    pub process_id: u32,
    pub object_id: ObjectIdentifier,
    pub time_remaining: u32,
    pub values: Vec<(PropertyIdentifier, PropertyValue)>,
    pub confirmed: bool,
}

/// Callback delivering notification data to the send path.
pub type CovNotifier = Arc<dyn Fn(CovNotificationData) + Send + Sync>;

/// The COV subscription manager.
pub struct CovManager {
    config: CovConfig,
    database: Arc<ObjectDatabase>,
    subscriptions: Mutex<Vec<Subscription>>,
    notifier: RwLock<Option<CovNotifier>>,
}

impl CovManager {
    pub fn new(database: Arc<ObjectDatabase>, config: CovConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            database,
            subscriptions: Mutex::new(Vec::new()),
            notifier: RwLock::new(None),
        })
    }

    /// Register the notification sink.
    pub fn set_notifier(&self, notifier: CovNotifier) {
        *self.notifier.write().expect("notifier lock") = Some(notifier);
    }

    /// Wire this manager into the database's change feed.
    pub fn attach(self: Arc<Self>) {
        let manager = Arc::downgrade(&self);
        self.database.set_change_listener(Arc::new(move |event| {
            if let Some(manager) = manager.upgrade() {
                manager.handle_change(event);
            }
        }));
    }

    /// Subscribe for object-level notifications. `lifetime` of `None` (or
    /// zero) is indefinite. Emits the initial notification immediately.
    pub fn subscribe_object(
        &self,
        subscriber: BacnetAddress,
        process_id: u32,
        object_id: ObjectIdentifier,
        confirmed: bool,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        if !self.database.contains(object_id) {
            return Err(ObjectError::UnknownObject);
        }
        let key = SubscriptionKey {
            subscriber,
            process_id,
            object_id,
            monitored: None,
        };
        self.insert(key.clone(), confirmed, lifetime, None)?;
        self.notify_object_subscription(&key);
        Ok(())
    }

    /// Subscribe for a specific property, with an optional COV increment
    /// for numeric properties.
    pub fn subscribe_property(
        &self,
        subscriber: BacnetAddress,
        process_id: u32,
        object_id: ObjectIdentifier,
        property: PropertyIdentifier,
        array_index: Option<u32>,
        cov_increment: Option<f64>,
        confirmed: bool,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        // The property must exist and be readable right now.
        let current = self.database.read_property(object_id, property, array_index)?;
        if cov_increment.is_some() && current.as_numeric().is_none() {
            return Err(ObjectError::NotCovProperty);
        }

        let key = SubscriptionKey {
            subscriber,
            process_id,
            object_id,
            monitored: Some((property, array_index)),
        };
        self.insert(key.clone(), confirmed, lifetime, cov_increment)?;
        self.notify_property_subscription(&key, current);
        Ok(())
    }

    /// Cancel a subscription. Unknown subscriptions are ignored, as the
    /// standard requires.
    pub fn unsubscribe(&self, key: &SubscriptionKey) {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .retain(|sub| sub.key != *key);
    }

    fn insert(
        &self,
        key: SubscriptionKey,
        confirmed: bool,
        lifetime: Option<Duration>,
        cov_increment: Option<f64>,
    ) -> Result<()> {
        let expiry = match lifetime {
            None => None,
            Some(duration) if duration.is_zero() => None,
            Some(duration) => Some(Instant::now() + duration),
        };
        let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock");

        if let Some(existing) = subscriptions.iter_mut().find(|sub| sub.key == key) {
            existing.confirmed = confirmed;
            existing.expiry = expiry;
            existing.cov_increment = cov_increment;
            existing.failures = 0;
            return Ok(());
        }

        let is_property = key.monitored.is_some();
        let count = subscriptions
            .iter()
            .filter(|sub| sub.key.monitored.is_some() == is_property)
            .count();
        let cap = if is_property {
            self.config.max_property_subscriptions
        } else {
            self.config.max_object_subscriptions
        };
        if count >= cap {
            return Err(ObjectError::ResourcesExhausted);
        }

        subscriptions.push(Subscription {
            key,
            confirmed,
            expiry,
            cov_increment,
            last_notified: None,
            failures: 0,
        });
        Ok(())
    }

    /// Feed from the database change listener.
    pub fn handle_change(&self, event: &ChangeEvent) {
        // Status_Flags is computed, so the flag inputs count as changes to
        // it.
        let distinguished = matches!(
            event.property,
            PropertyIdentifier::PresentValue
                | PropertyIdentifier::StatusFlags
                | PropertyIdentifier::OutOfService
                | PropertyIdentifier::EventState
                | PropertyIdentifier::Reliability
        );

        // Work out which subscriptions fire while holding the lock, then
        // notify outside it: the notifier may re-enter the database.
        struct Firing {
            key: SubscriptionKey,
            confirmed: bool,
            time_remaining: u32,
        }
        let mut firing = Vec::new();
        {
            let now = Instant::now();
            let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock");
            for sub in subscriptions.iter_mut() {
                if sub.key.object_id != event.object_id || sub.expired(now) {
                    continue;
                }
                match &sub.key.monitored {
                    None => {
                        if distinguished {
                            firing.push(Firing {
                                key: sub.key.clone(),
                                confirmed: sub.confirmed,
                                time_remaining: sub.time_remaining(),
                            });
                        }
                    }
                    Some((property, array_index)) => {
                        if *property != event.property {
                            continue;
                        }
                        let new_value = match array_index {
                            None => event.new.clone(),
                            Some(index) => match self.database.read_property(
                                event.object_id,
                                *property,
                                Some(*index),
                            ) {
                                Ok(value) => value,
                                Err(_) => continue,
                            },
                        };
                        if let Some(increment) = sub.cov_increment {
                            let previous = sub
                                .last_notified
                                .as_ref()
                                .and_then(PropertyValue::as_numeric);
                            let current = new_value.as_numeric();
                            if let (Some(previous), Some(current)) = (previous, current) {
                                if (current - previous).abs() < increment {
                                    continue;
                                }
                            }
                        }
                        sub.last_notified = Some(new_value);
                        firing.push(Firing {
                            key: sub.key.clone(),
                            confirmed: sub.confirmed,
                            time_remaining: sub.time_remaining(),
                        });
                    }
                }
            }
        }

        for fire in firing {
            match &fire.key.monitored {
                None => self.notify_object_subscription(&fire.key),
                Some((property, array_index)) => {
                    if let Ok(value) =
                        self.database
                            .read_property(fire.key.object_id, *property, *array_index)
                    {
                        self.emit(CovNotificationData {
                            subscriber: fire.key.subscriber.clone(),
                            process_id: fire.key.process_id,
                            object_id: fire.key.object_id,
                            time_remaining: fire.time_remaining,
                            values: vec![(*property, value)],
                            confirmed: fire.confirmed,
                        });
                    }
                }
            }
        }
    }

    /// Record a failed confirmed notification. The subscription survives;
    /// repeated failures demote it to unconfirmed.
    pub fn notification_failed(&self, key: &SubscriptionKey) {
        let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock");
        if let Some(sub) = subscriptions.iter_mut().find(|sub| sub.key == *key) {
            sub.failures += 1;
            if sub.confirmed && sub.failures >= DEMOTE_AFTER_FAILURES {
                log::warn!(
                    "demoting COV subscription for {} process {} to unconfirmed",
                    sub.key.object_id,
                    sub.key.process_id
                );
                sub.confirmed = false;
            }
        }
    }

    /// Remove all subscriptions for a deleted object.
    pub fn purge_object(&self, object_id: ObjectIdentifier) {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .retain(|sub| sub.key.object_id != object_id);
    }

    /// Remove expired subscriptions.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .retain(|sub| !sub.expired(now));
    }

    /// Periodic reaper; runs until aborted.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.purge_expired();
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().expect("subscriptions lock").len()
    }

    fn notify_object_subscription(&self, key: &SubscriptionKey) {
        let mut values = Vec::new();
        for property in [PropertyIdentifier::PresentValue, PropertyIdentifier::StatusFlags] {
            if let Ok(value) = self.database.read_property(key.object_id, property, None) {
                values.push((property, value));
            }
        }
        if values.is_empty() {
            return;
        }
        let (confirmed, time_remaining) = self.lookup_delivery(key);
        self.emit(CovNotificationData {
            subscriber: key.subscriber.clone(),
            process_id: key.process_id,
            object_id: key.object_id,
            time_remaining,
            values,
            confirmed,
        });
    }

    fn notify_property_subscription(&self, key: &SubscriptionKey, current: PropertyValue) {
        let Some((property, _)) = key.monitored else { return };
        {
            let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock");
            if let Some(sub) = subscriptions.iter_mut().find(|sub| sub.key == *key) {
                sub.last_notified = Some(current.clone());
            }
        }
        let (confirmed, time_remaining) = self.lookup_delivery(key);
        self.emit(CovNotificationData {
            subscriber: key.subscriber.clone(),
            process_id: key.process_id,
            object_id: key.object_id,
            time_remaining,
            values: vec![(property, current)],
            confirmed,
        });
    }

    fn lookup_delivery(&self, key: &SubscriptionKey) -> (bool, u32) {
        let subscriptions = self.subscriptions.lock().expect("subscriptions lock");
        subscriptions
            .iter()
            .find(|sub| sub.key == *key)
            .map(|sub| (sub.confirmed, sub.time_remaining()))
            .unwrap_or((false, 0))
    }

    fn emit(&self, data: CovNotificationData) {
        let notifier = self.notifier.read().expect("notifier lock").clone();
        if let Some(notifier) = notifier {
            notifier(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::analog::units;
    use crate::object::device::DeviceInfo;
    use crate::object::{BacnetObject, ObjectType};

    fn setup() -> (
        Arc<ObjectDatabase>,
        Arc<CovManager>,
        Arc<Mutex<Vec<CovNotificationData>>>,
        ObjectIdentifier,
    ) {
        let db = ObjectDatabase::new(BacnetObject::device(&DeviceInfo::new(1, "dev")));
        db.add_object(BacnetObject::analog_value(1, "av-1", units::PERCENT, Some(10.0)))
            .unwrap();
        let cov = CovManager::new(db.clone(), CovConfig::default());
        cov.clone().attach();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        cov.set_notifier(Arc::new(move |data| {
            sink.lock().unwrap().push(data);
        }));
        let av = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        (db, cov, received, av)
    }

    fn subscriber() -> BacnetAddress {
        "10.0.0.5:47808".parse().unwrap()
    }

    #[test]
    fn object_subscription_initial_and_change_notifications() {
        let (db, cov, received, av) = setup();
        cov.subscribe_object(subscriber(), 7, av, false, Some(Duration::from_secs(120)))
            .unwrap();

        // Initial notification carries Present_Value and Status_Flags.
        {
            let received = received.lock().unwrap();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].process_id, 7);
            assert_eq!(received[0].values.len(), 2);
            assert_eq!(received[0].values[0].0, PropertyIdentifier::PresentValue);
            assert!(received[0].time_remaining > 110);
        }

        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(55.0), None, None)
            .unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(
            received[1].values[0],
            (PropertyIdentifier::PresentValue, PropertyValue::Real(55.0))
        );
    }

    #[test]
    fn property_subscription_with_cov_increment_threshold() {
        let (db, cov, received, av) = setup();
        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(10.0), Some(8), None)
            .unwrap();

        cov.subscribe_property(
            subscriber(),
            3,
            av,
            PropertyIdentifier::PresentValue,
            None,
            Some(5.0),
            false,
            None,
        )
        .unwrap();
        // Initial notification at 10.0.
        assert_eq!(received.lock().unwrap().len(), 1);

        // Delta below the increment: suppressed.
        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(12.0), Some(8), None)
            .unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);

        // Delta at or above the increment: notified with the new value.
        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(16.0), Some(8), None)
            .unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(
            received[1].values[0],
            (PropertyIdentifier::PresentValue, PropertyValue::Real(16.0))
        );
    }

    #[test]
    fn subscription_cap_enforced() {
        let (_db, cov, _received, av) = setup();
        let cov_small = CovManager::new(cov.database.clone(), CovConfig {
            max_object_subscriptions: 1,
            ..Default::default()
        });
        cov_small
            .subscribe_object(subscriber(), 1, av, false, None)
            .unwrap();
        let overflow: BacnetAddress = "10.0.0.6:47808".parse().unwrap();
        assert_eq!(
            cov_small.subscribe_object(overflow, 2, av, false, None),
            Err(ObjectError::ResourcesExhausted)
        );
        // Re-subscription of an existing entry is always admitted.
        cov_small
            .subscribe_object(subscriber(), 1, av, true, Some(Duration::from_secs(30)))
            .unwrap();
    }

    #[test]
    fn expired_subscriptions_are_reaped() {
        let (db, cov, received, av) = setup();
        cov.subscribe_object(subscriber(), 1, av, false, Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        cov.purge_expired();
        assert_eq!(cov.subscription_count(), 0);

        received.lock().unwrap().clear();
        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(1.0), None, None)
            .unwrap();
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn object_removal_purges_subscriptions() {
        let (db, cov, _received, av) = setup();
        cov.subscribe_object(subscriber(), 1, av, false, None).unwrap();
        db.remove_object(av).unwrap();
        cov.purge_object(av);
        assert_eq!(cov.subscription_count(), 0);
    }

    #[test]
    fn repeated_confirmed_failures_demote_to_unconfirmed() {
        let (db, cov, received, av) = setup();
        cov.subscribe_object(subscriber(), 1, av, true, None).unwrap();
        let key = SubscriptionKey {
            subscriber: subscriber(),
            process_id: 1,
            object_id: av,
            monitored: None,
        };
        for _ in 0..DEMOTE_AFTER_FAILURES {
            cov.notification_failed(&key);
        }

        received.lock().unwrap().clear();
        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(2.0), None, None)
            .unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(!received[0].confirmed, "subscription must be demoted, not removed");
    }
}
