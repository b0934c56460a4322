//! Object database.
//!
//! Holds every local object, keyed by identifier with secondary indices by
//! type and by device-unique object name. The Device object's Object_List
//! and Database_Revision are answered here: the list is a virtual read over
//! the database and the revision counts add/remove/rename operations.
//!
//! Property changes are observed through per-object hooks installed at
//! registration; the database forwards them to a single change listener
//! (the COV manager) synchronously, after its own lock is released, so the
//! listener may read back through the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{
    BacnetObject, ObjectError, ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyValue,
    Result, WriteHook,
};

/// One observed property change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub object_id: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub old: PropertyValue,
    pub new: PropertyValue,
}

struct DbInner {
    objects: HashMap<ObjectIdentifier, BacnetObject>,
    /// Insertion order drives Object_List.
    order: Vec<ObjectIdentifier>,
    name_index: HashMap<String, ObjectIdentifier>,
    type_index: HashMap<ObjectType, Vec<ObjectIdentifier>>,
    device_id: ObjectIdentifier,
    revision: u32,
}

/// Listener invoked for every property change, after the database lock is
/// released.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// The local object database.
pub struct ObjectDatabase {
    inner: RwLock<DbInner>,
    /// Changes collected by object hooks during a write.
    pending: Arc<Mutex<Vec<ChangeEvent>>>,
    listener: RwLock<Option<ChangeListener>>,
}

impl ObjectDatabase {
    /// Create a database seeded with its Device object.
    pub fn new(device: BacnetObject) -> Arc<Self> {
        assert_eq!(device.identifier().object_type, ObjectType::Device);
        let device_id = device.identifier();
        let db = Arc::new(Self {
            inner: RwLock::new(DbInner {
                objects: HashMap::new(),
                order: Vec::new(),
                name_index: HashMap::new(),
                type_index: HashMap::new(),
                device_id,
                revision: 1,
            }),
            pending: Arc::new(Mutex::new(Vec::new())),
            listener: RwLock::new(None),
        });
        db.add_object(device).expect("fresh database accepts its device");
        db
    }

    /// Register the change listener (COV feed).
    pub fn set_change_listener(&self, listener: ChangeListener) {
        *self.listener.write().expect("listener lock") = Some(listener);
    }

    fn collector_hook(&self) -> WriteHook {
        let pending = self.pending.clone();
        Arc::new(move |object_id, property, old, new| {
            pending.lock().expect("pending lock").push(ChangeEvent {
                object_id,
                property,
                old: old.clone(),
                new: new.clone(),
            });
        })
    }

    /// Deliver collected change events to the listener. Runs after the
    /// database lock is dropped; the listener may call back in.
    fn flush_changes(&self) {
        let events: Vec<ChangeEvent> =
            std::mem::take(&mut *self.pending.lock().expect("pending lock"));
        if events.is_empty() {
            return;
        }
        let listener = self.listener.read().expect("listener lock").clone();
        if let Some(listener) = listener {
            for event in &events {
                listener(event);
            }
        }
    }

    /// Add an object. Rejects duplicate identifiers and duplicate names.
    pub fn add_object(&self, mut object: BacnetObject) -> Result<()> {
        let id = object.identifier();
        if !id.is_valid() {
            return Err(ObjectError::InvalidParameter("instance out of range"));
        }
        let name = object.object_name();
        let mut inner = self.inner.write().expect("db lock");
        if inner.objects.contains_key(&id) {
            return Err(ObjectError::ObjectIdentifierAlreadyExists);
        }
        if inner.name_index.contains_key(&name) {
            return Err(ObjectError::DuplicateName(name));
        }
        object.set_write_hook(Some(self.collector_hook()));
        inner.name_index.insert(name, id);
        inner.type_index.entry(id.object_type).or_default().push(id);
        inner.order.push(id);
        inner.objects.insert(id, object);
        inner.revision = inner.revision.wrapping_add(1);
        Ok(())
    }

    /// Remove an object. The Device object cannot be removed.
    pub fn remove_object(&self, id: ObjectIdentifier) -> Result<BacnetObject> {
        let mut inner = self.inner.write().expect("db lock");
        if id == inner.device_id {
            return Err(ObjectError::ObjectDeletionNotPermitted);
        }
        let mut object = inner.objects.remove(&id).ok_or(ObjectError::UnknownObject)?;
        object.set_write_hook(None);
        let name = object.object_name();
        inner.name_index.remove(&name);
        inner.order.retain(|entry| *entry != id);
        if let Some(of_type) = inner.type_index.get_mut(&id.object_type) {
            of_type.retain(|entry| *entry != id);
        }
        inner.revision = inner.revision.wrapping_add(1);
        Ok(object)
    }

    /// Rename an object, keeping the name index consistent.
    pub fn rename_object(&self, id: ObjectIdentifier, new_name: &str) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("db lock");
            if !inner.objects.contains_key(&id) {
                return Err(ObjectError::UnknownObject);
            }
            match inner.name_index.get(new_name) {
                Some(existing) if *existing != id => {
                    return Err(ObjectError::DuplicateName(new_name.to_string()))
                }
                _ => {}
            }
            let object = inner.objects.get_mut(&id).expect("presence checked");
            let old_name = object.object_name();
            object.write_property(
                PropertyIdentifier::ObjectName,
                PropertyValue::CharacterString(new_name.to_string()),
                None,
                None,
            )?;
            inner.name_index.remove(&old_name);
            inner.name_index.insert(new_name.to_string(), id);
            inner.revision = inner.revision.wrapping_add(1);
        }
        self.flush_changes();
        Ok(())
    }

    /// Read a property, resolving the database-level virtual properties of
    /// the Device object.
    pub fn read_property(
        &self,
        id: ObjectIdentifier,
        property: PropertyIdentifier,
        array_index: Option<u32>,
    ) -> Result<PropertyValue> {
        let inner = self.inner.read().expect("db lock");
        if id == inner.device_id {
            match property {
                PropertyIdentifier::ObjectList => {
                    let items: Vec<PropertyValue> =
                        inner.order.iter().map(|id| PropertyValue::ObjectId(*id)).collect();
                    return match array_index {
                        None => Ok(PropertyValue::Array(items)),
                        Some(index) => super::index_array(&items, index),
                    };
                }
                PropertyIdentifier::DatabaseRevision => {
                    return Ok(PropertyValue::Unsigned(inner.revision));
                }
                _ => {}
            }
        }
        inner
            .objects
            .get(&id)
            .ok_or(ObjectError::UnknownObject)?
            .read_property(property, array_index)
    }

    /// Write a property. Object_Name writes are checked for uniqueness and
    /// update the name index.
    pub fn write_property(
        &self,
        id: ObjectIdentifier,
        property: PropertyIdentifier,
        value: PropertyValue,
        priority: Option<u8>,
        array_index: Option<u32>,
    ) -> Result<()> {
        if property == PropertyIdentifier::ObjectName {
            let new_name = value
                .as_str()
                .ok_or(ObjectError::InvalidDataType)?
                .to_string();
            return self.rename_object(id, &new_name);
        }

        let result = {
            let mut inner = self.inner.write().expect("db lock");
            inner
                .objects
                .get_mut(&id)
                .ok_or(ObjectError::UnknownObject)?
                .write_property(property, value, priority, array_index)
        };
        self.flush_changes();
        result
    }

    /// Run a closure against an object immutably.
    pub fn with_object<T>(
        &self,
        id: ObjectIdentifier,
        f: impl FnOnce(&BacnetObject) -> T,
    ) -> Result<T> {
        let inner = self.inner.read().expect("db lock");
        inner.objects.get(&id).map(f).ok_or(ObjectError::UnknownObject)
    }

    pub fn contains(&self, id: ObjectIdentifier) -> bool {
        self.inner.read().expect("db lock").objects.contains_key(&id)
    }

    /// Find an object by its device-unique name.
    pub fn find_by_name(&self, name: &str) -> Option<ObjectIdentifier> {
        self.inner.read().expect("db lock").name_index.get(name).copied()
    }

    pub fn objects_of_type(&self, object_type: ObjectType) -> Vec<ObjectIdentifier> {
        self.inner
            .read()
            .expect("db lock")
            .type_index
            .get(&object_type)
            .cloned()
            .unwrap_or_default()
    }

    /// All identifiers in Object_List order.
    pub fn object_ids(&self) -> Vec<ObjectIdentifier> {
        self.inner.read().expect("db lock").order.clone()
    }

    pub fn object_count(&self) -> usize {
        self.inner.read().expect("db lock").objects.len()
    }

    pub fn device_id(&self) -> ObjectIdentifier {
        self.inner.read().expect("db lock").device_id
    }

    pub fn revision(&self) -> u32 {
        self.inner.read().expect("db lock").revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::analog::units;
    use crate::object::device::DeviceInfo;

    fn database() -> Arc<ObjectDatabase> {
        ObjectDatabase::new(BacnetObject::device(&DeviceInfo::new(100, "device-100")))
    }

    #[test]
    fn duplicate_identifier_rejected() {
        let db = database();
        db.add_object(BacnetObject::analog_value(1, "av-1", units::PERCENT, None))
            .unwrap();
        let result = db.add_object(BacnetObject::analog_value(1, "av-1b", units::PERCENT, None));
        assert_eq!(result, Err(ObjectError::ObjectIdentifierAlreadyExists));
    }

    #[test]
    fn duplicate_name_rejected_and_freed_on_remove() {
        let db = database();
        db.add_object(BacnetObject::analog_value(1, "setpoint", units::PERCENT, None))
            .unwrap();
        assert_eq!(
            db.add_object(BacnetObject::analog_value(2, "setpoint", units::PERCENT, None)),
            Err(ObjectError::DuplicateName("setpoint".into()))
        );

        // Removal frees the name immediately.
        db.remove_object(ObjectIdentifier::new(ObjectType::AnalogValue, 1))
            .unwrap();
        db.add_object(BacnetObject::analog_value(2, "setpoint", units::PERCENT, None))
            .unwrap();
    }

    #[test]
    fn rename_validates_uniqueness_and_updates_index() {
        let db = database();
        db.add_object(BacnetObject::analog_value(1, "alpha", units::PERCENT, None))
            .unwrap();
        db.add_object(BacnetObject::analog_value(2, "beta", units::PERCENT, None))
            .unwrap();

        let alpha = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        assert_eq!(
            db.rename_object(alpha, "beta"),
            Err(ObjectError::DuplicateName("beta".into()))
        );
        db.rename_object(alpha, "gamma").unwrap();
        assert_eq!(db.find_by_name("gamma"), Some(alpha));
        assert_eq!(db.find_by_name("alpha"), None);

        // Renaming through WriteProperty behaves identically.
        db.write_property(
            alpha,
            PropertyIdentifier::ObjectName,
            PropertyValue::CharacterString("delta".into()),
            None,
            None,
        )
        .unwrap();
        assert_eq!(db.find_by_name("delta"), Some(alpha));
    }

    #[test]
    fn device_cannot_be_removed() {
        let db = database();
        assert_eq!(
            db.remove_object(db.device_id()),
            Err(ObjectError::ObjectDeletionNotPermitted)
        );
    }

    #[test]
    fn revision_counts_structural_changes() {
        let db = database();
        let initial = db.revision();
        db.add_object(BacnetObject::analog_value(1, "a", units::PERCENT, None))
            .unwrap();
        db.rename_object(ObjectIdentifier::new(ObjectType::AnalogValue, 1), "b")
            .unwrap();
        db.remove_object(ObjectIdentifier::new(ObjectType::AnalogValue, 1))
            .unwrap();
        assert_eq!(db.revision(), initial + 3);

        assert_eq!(
            db.read_property(db.device_id(), PropertyIdentifier::DatabaseRevision, None)
                .unwrap(),
            PropertyValue::Unsigned(initial + 3)
        );
    }

    #[test]
    fn object_list_is_virtual_with_index_access() {
        let db = database();
        db.add_object(BacnetObject::analog_value(1, "a", units::PERCENT, None))
            .unwrap();
        db.add_object(BacnetObject::binary_value(2, "b", None)).unwrap();

        assert_eq!(
            db.read_property(db.device_id(), PropertyIdentifier::ObjectList, Some(0))
                .unwrap(),
            PropertyValue::Unsigned(3)
        );
        assert_eq!(
            db.read_property(db.device_id(), PropertyIdentifier::ObjectList, Some(1))
                .unwrap(),
            PropertyValue::ObjectId(db.device_id())
        );
        assert_eq!(
            db.read_property(db.device_id(), PropertyIdentifier::ObjectList, Some(9)),
            Err(ObjectError::InvalidArrayIndex)
        );
    }

    #[test]
    fn change_listener_fires_after_write() {
        let db = database();
        db.add_object(BacnetObject::analog_value(1, "a", units::PERCENT, Some(10.0)))
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        db.set_change_listener(Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let av = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        db.write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(33.0), None, None)
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].property, PropertyIdentifier::PresentValue);
        assert_eq!(events[0].old, PropertyValue::Real(10.0));
        assert_eq!(events[0].new, PropertyValue::Real(33.0));
    }

    #[test]
    fn unknown_object_read() {
        let db = database();
        assert_eq!(
            db.read_property(
                ObjectIdentifier::new(ObjectType::AnalogValue, 99),
                PropertyIdentifier::PresentValue,
                None
            ),
            Err(ObjectError::UnknownObject)
        );
    }
}
