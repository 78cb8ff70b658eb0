//! The slice of an orchestration framework's entity model that port forwarding needs.
//!
//! Entities themselves are provided by the embedding application.

use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;

/// A typed configuration key on an [Entity].
pub struct ConfigKey<T> {
    name: &'static str,
    description: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> ConfigKey<T> {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }
}

/// A typed attribute (sensor) published by an [Entity].
pub struct AttributeSensor<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> AttributeSensor<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

macro_rules! impl_key_traits {
    ($ty:ident, $label:literal) => {
        impl<T> Clone for $ty<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $ty<T> {}

        impl<T> Debug for $ty<T> {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", $label, self.name)
            }
        }

        impl<T> Display for $ty<T> {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name)
            }
        }
    };
}

impl_key_traits!(ConfigKey, "ConfigKey");
impl_key_traits!(AttributeSensor, "AttributeSensor");

/// A managed entity, with configuration and attributes.
pub trait Entity: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str {
        self.id()
    }

    fn config<T: Clone + 'static>(&self, key: &ConfigKey<T>) -> Option<T>
    where
        Self: Sized;

    fn attribute<T: Clone + 'static>(&self, sensor: &AttributeSensor<T>) -> Option<T>
    where
        Self: Sized;
}
