use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ObjectId;

pub type SharedObject = Arc<Mutex<Box<dyn Any + Send>>>;

/// Objects member handlers can be bound to. Ids are never reused.
pub struct ObjectArena {
    objects: HashMap<ObjectId, SharedObject>,
    next_id: u32,
}

impl Default for ObjectArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectArena {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert<T: Any + Send>(&mut self, object: T) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.objects
            .insert(id, Arc::new(Mutex::new(Box::new(object))));
        id
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Box<dyn Any + Send>> {
        let shared = self.objects.remove(&id)?;
        match Arc::try_unwrap(shared) {
            Ok(mutex) => Some(mutex.into_inner()),
            // a handler still holds it; it goes away when the call returns
            Err(_) => None,
        }
    }

    /// Clones the handle so the arena lock can be dropped before the call.
    pub fn get(&self, id: ObjectId) -> Option<SharedObject> {
        self.objects.get(&id).cloned()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl std::fmt::Debug for ObjectArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectArena")
            .field("objects", &self.objects.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
