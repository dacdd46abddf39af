//! Server-side callback table.
//!
//! A field callback exists once per field and carries the set of client
//! slots interested in it. Clients join with ADD_CALLBACK and leave with
//! DELETE_CALLBACK or by disconnecting; the callback is deleted when its last
//! interested client leaves. The poll timer is registered as a timer
//! callback so that it owns an id like every other callback.
//!
//! Callback ids are table handles with [`CALLBACK_BIT`] set, so they can
//! never be mistaken for request ids on the wire.

use crate::protocol::CALLBACK_BIT;
use mx_core::limits::{CALLBACK_HANDLE_BLOCK_SIZE, CALLBACK_HANDLE_NUM_BLOCKS};
use mx_core::{FieldAddress, FieldValue, HandleTable, MxError, MxResult};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

/// What a callback is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackClass {
    /// A record field.
    Field,
    /// A periodic timer.
    Timer,
}

/// When a callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackType {
    /// The target's value changed.
    ValueChanged,
    /// Every poll interval.
    Poll,
}

/// One entry of the callback table.
#[derive(Debug, Clone)]
pub struct Callback {
    /// Wire id (handle | [`CALLBACK_BIT`]).
    pub id: u32,
    /// Class tag.
    pub class: CallbackClass,
    /// Type tag.
    pub callback_type: CallbackType,
    /// Target field, for field callbacks.
    pub target: Option<FieldAddress>,
    /// Poll period, for timer callbacks.
    pub period: Option<Duration>,
    interested: BTreeSet<usize>,
    last_value: Option<FieldValue>,
    active: bool,
}

impl Callback {
    /// Client slots to notify.
    pub fn interested(&self) -> impl Iterator<Item = usize> + '_ {
        self.interested.iter().copied()
    }

    /// True if `slot` is on the interested list.
    pub fn is_interested(&self, slot: usize) -> bool {
        self.interested.contains(&slot)
    }

    /// Value most recently delivered.
    pub fn last_value(&self) -> Option<&FieldValue> {
        self.last_value.as_ref()
    }

    /// Record `value` as delivered. Returns true if it differs from the
    /// previous one.
    pub fn update(&mut self, value: &FieldValue) -> bool {
        if self.last_value.as_ref() == Some(value) {
            return false;
        }
        self.last_value = Some(value.clone());
        true
    }

    /// Mark the callback as running. Returns false if it already was, in
    /// which case the caller must not run it again.
    pub fn enter(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    /// Clear the running mark set by [`Callback::enter`].
    pub fn leave(&mut self) {
        self.active = false;
    }
}

/// Convert a table handle into a wire id.
pub fn callback_id(handle: usize) -> MxResult<u32> {
    u32::try_from(handle)
        .ok()
        .filter(|h| h & CALLBACK_BIT == 0)
        .map(|h| h | CALLBACK_BIT)
        .ok_or_else(|| MxError::WouldExceedLimit(format!("callback handle {} is too large", handle)))
}

/// Convert a wire id back into a table handle.
pub fn callback_handle(id: u32) -> MxResult<usize> {
    if id & CALLBACK_BIT == 0 {
        return Err(MxError::IllegalArgument(format!(
            "{:#x} is not a callback id",
            id
        )));
    }
    Ok((id & !CALLBACK_BIT) as usize)
}

/// All live callbacks.
#[derive(Debug)]
pub struct CallbackTable {
    table: HandleTable<Callback>,
    by_field: HashMap<FieldAddress, usize>,
}

impl CallbackTable {
    /// An empty table.
    pub fn new() -> MxResult<Self> {
        Ok(Self {
            table: HandleTable::new(CALLBACK_HANDLE_BLOCK_SIZE, CALLBACK_HANDLE_NUM_BLOCKS)?,
            by_field: HashMap::new(),
        })
    }

    fn insert(&mut self, build: impl FnOnce(u32) -> Callback) -> MxResult<u32> {
        // The id depends on the handle, so reserve the slot with a
        // placeholder first.
        let handle = self.table.alloc(build(0))?;
        let id = match callback_id(handle) {
            Ok(id) => id,
            Err(err) => {
                self.table.release(handle)?;
                return Err(err);
            }
        };
        self.table.get_mut(handle)?.id = id;
        Ok(id)
    }

    /// Register the poll timer.
    pub fn add_poll_timer(&mut self, period: Duration) -> MxResult<u32> {
        let id = self.insert(|id| Callback {
            id,
            class: CallbackClass::Timer,
            callback_type: CallbackType::Poll,
            target: None,
            period: Some(period),
            interested: BTreeSet::new(),
            last_value: None,
            active: false,
        })?;
        debug!(callback_id = %format!("{:#x}", id), ?period, "Registered poll timer callback");
        Ok(id)
    }

    /// Add `slot` to the value-changed callback of `field`, creating the
    /// callback if needed. `current` seeds the last delivered value so the
    /// first poll only reports real changes.
    pub fn add_field_callback(
        &mut self,
        field: FieldAddress,
        slot: usize,
        current: FieldValue,
    ) -> MxResult<u32> {
        if let Some(&handle) = self.by_field.get(&field) {
            let callback = self.table.get_mut(handle)?;
            callback.interested.insert(slot);
            return Ok(callback.id);
        }
        let id = self.insert(|id| Callback {
            id,
            class: CallbackClass::Field,
            callback_type: CallbackType::ValueChanged,
            target: Some(field),
            period: None,
            interested: BTreeSet::from([slot]),
            last_value: Some(current),
            active: false,
        })?;
        self.by_field.insert(field, callback_handle(id)?);
        Ok(id)
    }

    /// Remove `slot` from callback `id`, deleting the callback when nobody
    /// is left. Returns true if the callback was deleted.
    pub fn delete(&mut self, id: u32, slot: usize) -> MxResult<bool> {
        let handle = callback_handle(id)?;
        let callback = self.table.get_mut(handle)?;
        if !callback.interested.remove(&slot) {
            return Err(MxError::NotFound(format!(
                "connection {} is not registered for callback {:#x}",
                slot, id
            )));
        }
        if callback.interested.is_empty() {
            self.remove(handle)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop `slot` from every field callback. Callbacks left with nobody
    /// interested are deleted; returns how many were.
    pub fn remove_handler(&mut self, slot: usize) -> usize {
        let mut emptied = Vec::new();
        for handle in self.table.handles() {
            if let Ok(callback) = self.table.get_mut(handle) {
                if callback.class == CallbackClass::Field
                    && callback.interested.remove(&slot)
                    && callback.interested.is_empty()
                {
                    emptied.push(handle);
                }
            }
        }
        for handle in &emptied {
            if let Err(err) = self.remove(*handle) {
                debug!(handle, error = %err, "Callback vanished during handler removal");
            }
        }
        emptied.len()
    }

    fn remove(&mut self, handle: usize) -> MxResult<Callback> {
        let callback = self.table.release(handle)?;
        if let Some(field) = callback.target {
            self.by_field.remove(&field);
        }
        debug!(callback_id = %format!("{:#x}", callback.id), "Deleted callback");
        Ok(callback)
    }

    /// Callback by wire id.
    pub fn get(&self, id: u32) -> MxResult<&Callback> {
        self.table.get(callback_handle(id)?)
    }

    /// Callback attached to `field`.
    pub fn for_field(&self, field: FieldAddress) -> Option<&Callback> {
        let handle = self.by_field.get(&field)?;
        self.table.get(*handle).ok()
    }

    /// Mutable callback attached to `field`.
    pub fn for_field_mut(&mut self, field: FieldAddress) -> Option<&mut Callback> {
        let handle = self.by_field.get(&field)?;
        self.table.get_mut(*handle).ok()
    }

    /// Fields that currently have a value-changed callback.
    pub fn watched_fields(&self) -> Vec<FieldAddress> {
        let mut fields: Vec<FieldAddress> = self.by_field.keys().copied().collect();
        fields.sort();
        fields
    }

    /// Number of live callbacks, timers included.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::RecordId;

    fn field(record: usize, ordinal: usize) -> FieldAddress {
        FieldAddress::new(RecordId(record), ordinal)
    }

    #[test]
    fn ids_carry_the_callback_bit() {
        let mut table = CallbackTable::new().unwrap();
        let timer = table.add_poll_timer(Duration::from_millis(100)).unwrap();
        assert_eq!(timer, CALLBACK_BIT);
        let id = table.add_field_callback(field(1, 9), 2, FieldValue::Long(0)).unwrap();
        assert_eq!(id, CALLBACK_BIT | 1);
        assert_eq!(callback_handle(id).unwrap(), 1);
        assert!(callback_handle(1).is_err());
        assert_eq!(table.get(timer).unwrap().class, CallbackClass::Timer);
    }

    #[test]
    fn one_callback_per_field() {
        let mut table = CallbackTable::new().unwrap();
        let a = table.add_field_callback(field(1, 9), 1, FieldValue::Long(0)).unwrap();
        let b = table.add_field_callback(field(1, 9), 2, FieldValue::Long(0)).unwrap();
        assert_eq!(a, b);
        let callback = table.for_field(field(1, 9)).unwrap();
        assert_eq!(callback.interested().collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn only_interested_slots_are_listed() {
        let mut table = CallbackTable::new().unwrap();
        table.add_field_callback(field(3, 8), 1, FieldValue::Long(0)).unwrap();
        let callback = table.for_field(field(3, 8)).unwrap();
        assert!(callback.is_interested(1));
        assert!(!callback.is_interested(2));
    }

    #[test]
    fn delete_removes_empty_callbacks() {
        let mut table = CallbackTable::new().unwrap();
        let id = table.add_field_callback(field(1, 9), 1, FieldValue::Long(0)).unwrap();
        table.add_field_callback(field(1, 9), 2, FieldValue::Long(0)).unwrap();

        assert!(!table.delete(id, 1).unwrap());
        assert!(matches!(table.delete(id, 1), Err(MxError::NotFound(_))));
        assert!(table.delete(id, 2).unwrap());
        assert!(table.for_field(field(1, 9)).is_none());
        assert!(matches!(table.get(id), Err(MxError::NotFound(_))));
    }

    #[test]
    fn disconnect_cleans_every_callback() {
        let mut table = CallbackTable::new().unwrap();
        table.add_poll_timer(Duration::from_millis(100)).unwrap();
        table.add_field_callback(field(1, 9), 1, FieldValue::Long(0)).unwrap();
        table.add_field_callback(field(2, 9), 1, FieldValue::Long(0)).unwrap();
        table.add_field_callback(field(2, 9), 2, FieldValue::Long(0)).unwrap();

        assert_eq!(table.remove_handler(1), 1);
        assert!(table.for_field(field(1, 9)).is_none());
        let shared = table.for_field(field(2, 9)).unwrap();
        assert_eq!(shared.interested().collect::<Vec<_>>(), [2]);
        // the poll timer survives
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn update_reports_changes_only() {
        let mut table = CallbackTable::new().unwrap();
        table.add_field_callback(field(1, 9), 1, FieldValue::Double(1.0)).unwrap();
        let callback = table.for_field_mut(field(1, 9)).unwrap();
        assert!(!callback.update(&FieldValue::Double(1.0)));
        assert!(callback.update(&FieldValue::Double(2.0)));
        assert_eq!(callback.last_value(), Some(&FieldValue::Double(2.0)));
    }

    #[test]
    fn enter_guards_against_reentry() {
        let mut table = CallbackTable::new().unwrap();
        table.add_field_callback(field(1, 9), 1, FieldValue::Long(0)).unwrap();
        let callback = table.for_field_mut(field(1, 9)).unwrap();
        assert!(callback.enter());
        assert!(!callback.enter());
        callback.leave();
        assert!(callback.enter());
    }

    #[test]
    fn handles_are_reused_after_delete() {
        let mut table = CallbackTable::new().unwrap();
        let first = table.add_field_callback(field(1, 9), 1, FieldValue::Long(0)).unwrap();
        table.delete(first, 1).unwrap();
        let second = table.add_field_callback(field(4, 9), 1, FieldValue::Long(0)).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.watched_fields(), [field(4, 9)]);
    }
}
