use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use super::ObjectId;
use super::codec::{MAX_IDENTIFIER_LEN, RpcIdentifier};
use crate::net::address::PeerAddress;

/// Opaque value handed to every invocation of a handler.
pub type RpcContext = Arc<dyn Any + Send + Sync>;

/// One inbound call as seen by its handler.
#[derive(Debug)]
pub struct RpcInvocation {
    pub sender: PeerAddress,
    pub identifier: String,
    pub args: Vec<u8>,
    pub object: Option<ObjectId>,
    /// Sent back to a blocking caller.
    pub reply: Vec<u8>,
    pub context: Option<RpcContext>,
}

impl RpcInvocation {
    pub fn context<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.context.as_deref().and_then(|c| c.downcast_ref::<T>())
    }
}

pub type StaticHandler = Arc<dyn Fn(&mut RpcInvocation) + Send + Sync>;
/// Returns `false` when the bound object is not the type the handler expects.
pub type MemberHandler =
    Arc<dyn Fn(&mut (dyn Any + Send), &mut RpcInvocation) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum RpcHandler {
    /// Called without a bound object.
    Static(StaticHandler),
    /// Called on the arena object the caller names.
    Member(MemberHandler),
}

impl RpcHandler {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&mut RpcInvocation) + Send + Sync + 'static,
    {
        Self::Static(Arc::new(f))
    }

    /// Wraps a handler for objects of type `T`. Calls naming an object of
    /// another type are dropped without a reply.
    pub fn member<T, F>(f: F) -> Self
    where
        T: Any + Send,
        F: Fn(&mut T, &mut RpcInvocation) + Send + Sync + 'static,
    {
        Self::Member(Arc::new(
            move |object: &mut (dyn Any + Send), call: &mut RpcInvocation| {
                let Some(object) = object.downcast_mut::<T>() else {
                    log::debug!(
                        "rpc {} from {}: object {:?} has the wrong type",
                        call.identifier,
                        call.sender,
                        call.object
                    );
                    return false;
                };
                f(object, call);
                true
            },
        ))
    }

    pub fn is_member(&self) -> bool {
        matches!(self, Self::Member(_))
    }
}

impl std::fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(_) => f.write_str("RpcHandler::Static"),
            Self::Member(_) => f.write_str("RpcHandler::Member"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcRegistration {
    pub identifier: String,
    pub handler: RpcHandler,
    pub context: Option<RpcContext>,
}

/// Identifier table. Indices are stable for the lifetime of a registration
/// and are what a callee announces to its callers.
#[derive(Debug, Default)]
pub struct RpcRegistry {
    entries: Vec<Option<RpcRegistration>>,
    by_name: HashMap<String, u16>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` for an empty, oversized or duplicate identifier.
    pub fn register(
        &mut self,
        identifier: &str,
        handler: RpcHandler,
        context: Option<RpcContext>,
    ) -> bool {
        if identifier.is_empty()
            || identifier.len() > MAX_IDENTIFIER_LEN
            || self.by_name.contains_key(identifier)
        {
            return false;
        }

        let index = match self.entries.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.entries.len() < u16::MAX as usize => {
                self.entries.push(None);
                self.entries.len() - 1
            }
            None => return false,
        };

        self.entries[index] = Some(RpcRegistration {
            identifier: identifier.to_owned(),
            handler,
            context,
        });
        self.by_name.insert(identifier.to_owned(), index as u16);
        true
    }

    pub fn unregister(&mut self, identifier: &str) -> bool {
        let Some(index) = self.by_name.remove(identifier) else {
            return false;
        };
        self.entries[index as usize] = None;
        true
    }

    pub fn index_of(&self, identifier: &str) -> Option<u16> {
        self.by_name.get(identifier).copied()
    }

    pub fn resolve(&self, identifier: &RpcIdentifier) -> Option<(u16, &RpcRegistration)> {
        let index = match identifier {
            RpcIdentifier::Index(index) => *index,
            RpcIdentifier::Name(name) => self.index_of(name)?,
        };
        let registration = self.entries.get(index as usize)?.as_ref()?;
        Some((index, registration))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
