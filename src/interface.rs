//! Typed views over a [`RemoteObject`]'s name-keyed members, as generated by
//! [`remote_interface!`](crate::remote_interface).

use crate::proxy::{ListenerId, ProxyError, RemoteObject};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::marker::PhantomData;

/// One property of a remote object, read and written as `T`.
pub struct PropertyRef<'a, T> {
    object: &'a RemoteObject,
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<'a, T> PropertyRef<'a, T> {
    pub fn new(object: &'a RemoteObject, name: &'static str) -> Self {
        Self {
            object,
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> PropertyRef<'_, T>
where
    T: DeserializeOwned,
{
    pub fn get(&self) -> Result<Option<T>, ProxyError> {
        match self.object.property(self.name)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<T> PropertyRef<'_, T>
where
    T: Serialize,
{
    pub fn set(&self, value: &T) -> Result<bool, ProxyError> {
        let value = serde_json::to_value(value)?;
        self.object.set_property(self.name, value)
    }
}

/// One signal of a remote object.
pub struct SignalRef<'a> {
    object: &'a RemoteObject,
    name: &'static str,
}

impl<'a> SignalRef<'a> {
    pub fn new(object: &'a RemoteObject, name: &'static str) -> Self {
        Self { object, name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn connect<F>(&self, listener: F) -> Result<ListenerId, ProxyError>
    where
        F: Fn(&[Value]) + 'static,
    {
        self.object.connect(self.name, listener)
    }

    pub fn disconnect(&self, id: ListenerId) -> Result<bool, ProxyError> {
        self.object.disconnect(self.name, id)
    }

    pub fn listener_count(&self) -> usize {
        self.object.listener_count(self.name)
    }
}
