// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings handed to [`crate::broker::Broker::connect`]. Values default
//! to a local broker and can be overridden from the environment, e.g.
//! `TOPIC_BROKER__BROKER__HOST=rabbit.internal` or `TOPIC_BROKER__APP__NAME=orders`.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "TOPIC_BROKER";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "topic-broker".to_owned(),
        }
    }
}

/// Where and as whom the broker session connects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for BrokerConfigs {
    fn default() -> Self {
        BrokerConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl BrokerConfigs {
    /// Connection URI with the password masked, suitable for logs.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.user,
            self.host,
            self.port,
            self.vhost.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub broker: BrokerConfigs,
}

impl Configs {
    /// Loads the defaults overridden by `TOPIC_BROKER__*` environment variables.
    ///
    /// # Returns
    /// The merged configuration or a ConfigError when a variable does not parse
    pub fn from_env() -> Result<Configs, ConfigError> {
        Self::from_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
    }

    fn from_source(env: Environment) -> Result<Configs, ConfigError> {
        Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()
    }
}
