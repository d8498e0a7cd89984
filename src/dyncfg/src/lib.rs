// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dynamically updatable configuration.
//!
//! Basic usage:
//! - A type-safe static `Config` is defined near where it is used.
//! - Once in the lifetime of a process, all interesting `Config`s are
//!   registered to a `ConfigSet`. The values within a `ConfigSet` are shared,
//!   though multiple `ConfigSet`s may be created and each are completely
//!   independent (i.e. one in each unit test).
//! - A `ConfigSet` is plumbed around as necessary and may be used to get or
//!   set the value of `Config`.
//!
//! ```
//! # use mz_dyncfg::{Config, ConfigSet};
//! const FOO: Config<i64> = Config::new("foo", 1, "description of foo");
//! fn bar(cfg: &ConfigSet) {
//!     assert_eq!(FOO.get(&cfg), 1);
//! }
//! fn main() {
//!     let cfg = ConfigSet::default().add(&FOO);
//!     bar(&cfg);
//! }
//! ```
//!
//! Configs may carry a validator. Updates through [Config::set] that the
//! validator rejects leave the current value in place.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A handle to a dynamically updatable configuration value.
///
/// This represents a strongly-typed named config of type `T`. It may be
/// registered to a set of such configs with [ConfigSet::add] and then later
/// used to retrieve the latest value at any time with [Self::get].
///
/// The supported types are [i64] and [Duration].
#[derive(Clone, Debug)]
pub struct Config<T: ConfigType> {
    name: &'static str,
    desc: &'static str,
    default: T::Default,
    validate: Option<fn(&T) -> Result<(), String>>,
}

impl<T: ConfigType> Config<T> {
    /// Constructs a handle for a config of type `T`.
    ///
    /// It is best practice, but not strictly required, for the name to be
    /// globally unique within a process.
    pub const fn new(name: &'static str, default: T::Default, desc: &'static str) -> Self {
        Config {
            name,
            default,
            desc,
            validate: None,
        }
    }

    /// Like [Self::new], but every later update is first passed to
    /// `validate`, which returns a human readable reason on rejection.
    pub const fn new_validated(
        name: &'static str,
        default: T::Default,
        desc: &'static str,
        validate: fn(&T) -> Result<(), String>,
    ) -> Self {
        Config {
            name,
            default,
            desc,
            validate: Some(validate),
        }
    }

    /// The name of this config.
    pub fn name(&self) -> &str {
        self.name
    }

    /// The description of this config.
    pub fn desc(&self) -> &str {
        self.desc
    }

    /// The default value of this config.
    pub fn default(&self) -> &T::Default {
        &self.default
    }

    /// Returns the latest value of this config within the given set.
    ///
    /// Panics if this config was not previously registered to the set.
    pub fn get(&self, set: &ConfigSet) -> T {
        T::get(T::shared(self, set).expect("config should be registered to set"))
    }

    /// Updates the value of this config within the given set.
    ///
    /// Every holder of the set (and of its clones) observes the new value on
    /// their next [Self::get].
    pub fn set(&self, set: &ConfigSet, val: T) -> Result<(), ConfigError> {
        if let Some(validate) = self.validate {
            validate(&val).map_err(|reason| ConfigError::Invalid {
                name: self.name,
                reason,
            })?;
        }
        let shared = T::shared(self, set).ok_or(ConfigError::Unregistered(self.name))?;
        T::set(shared, val);
        Ok(())
    }
}

/// An error updating a [Config].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The value was rejected by the config's validator.
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    /// The config was never added to the set.
    #[error("config {0} is not registered to this set")]
    Unregistered(&'static str),
}

/// A type usable as a [Config].
pub trait ConfigType: Sized {
    /// A const-compatible type suitable for use as the default value of configs
    /// of this type.
    type Default: Into<Self> + Clone;
    /// A value of this type, sharable between config value updaters and config
    /// value retrievers.
    type Shared;

    /// Extracts the sharable value for a config of this type from a set.
    fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>>;

    /// Converts this type to its type-erased enum equivalent.
    fn to_val(val: &Self) -> ConfigVal;

    /// Retrieves the current config value of this type from a value of its
    /// corresponding sharable type.
    fn get(x: &Self::Shared) -> Self;

    /// Updates the sharable value for a config of this type to the given value.
    fn set(x: &Self::Shared, val: Self);
}

/// An set of [Config]s with values independent of other [ConfigSet]s (even if
/// they contain the same configs).
///
/// Clones share values with the set they were cloned from.
#[derive(Clone, Default)]
pub struct ConfigSet {
    /// The sharable value of each registered config, by name.
    configs: BTreeMap<String, ConfigVal>,
}

impl ConfigSet {
    /// Adds the given config to this set.
    ///
    /// Names are required to be unique within a set, but each set is entirely
    /// independent. Panics if a config with the same name has previously been
    /// registered to this set.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        let val = T::to_val(&Into::<T>::into(config.default.clone()));
        if self.configs.insert(config.name.to_owned(), val).is_some() {
            panic!("{} registered twice", config.name);
        }
        self
    }
}

/// A type-erased [ConfigType::Shared] for when set of different types are
/// stored in a collection.
#[derive(Clone, Debug)]
pub enum ConfigVal {
    /// An `i64` shared value.
    I64(Arc<AtomicI64>),
    /// A `Duration` shared value.
    Duration(Arc<RwLock<Duration>>),
}

mod impls {
    use std::sync::atomic::{AtomicI64, Ordering::SeqCst};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use crate::{Config, ConfigSet, ConfigType, ConfigVal};

    impl ConfigType for i64 {
        type Default = i64;
        type Shared = AtomicI64;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            match vals.configs.get(config.name)? {
                ConfigVal::I64(x) => Some(x),
                x => panic!("expected i64 value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::I64(Arc::new((*val).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(val, SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            x.load(SeqCst)
        }
    }

    impl ConfigType for Duration {
        type Default = Duration;
        type Shared = RwLock<Duration>;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            match vals.configs.get(config.name)? {
                ConfigVal::Duration(x) => Some(x),
                x => panic!("expected Duration value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Duration(Arc::new(RwLock::new(*val)))
        }
        fn set(x: &Self::Shared, val: Self) {
            *x.write().expect("lock poisoned") = val;
        }
        fn get(x: &Self::Shared) -> Self {
            *x.read().expect("lock poisoned")
        }
    }

    impl std::fmt::Debug for ConfigSet {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let ConfigSet { configs } = self;
            f.debug_map()
                .entries(configs.iter())
                .finish()
        }
    }
}
