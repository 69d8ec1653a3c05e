// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `OTT_*` environment variable configuration.
//!
//! Every key of [`PartialConfig`] can be set by upper-casing it and adding the `OTT_` prefix,
//! e.g. `OTT_API_KEY`, `OTT_SERVER_URL`, `OTT_TRANSPORT=disk`, `OTT_QUEUE_MAX_AGE=3600`.

use figment::{providers::Env, Figment};

use crate::config::{merge_config, Config, ConfigError, ConfigSource, PartialConfig};

pub const ENV_PREFIX: &str = "OTT_";

#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        let partial = figment.extract::<PartialConfig>().map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to parse config from environment variables: {e}"
            ))
        })?;
        merge_config(config, &partial)
    }
}
