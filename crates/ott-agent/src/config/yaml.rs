// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! YAML file-based configuration.
//!
//! ```yaml
//! api_key: your_api_key_here
//! server_url: https://intake.example.com
//! transport: disk
//! disk_queue_dir: /var/spool/ott-agent
//! compressed: 6
//! ```

use std::path::PathBuf;

use figment::{
    providers::{Format, Yaml},
    Figment,
};

use crate::config::{merge_config, Config, ConfigError, ConfigSource, PartialConfig};

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        let partial = figment.extract::<PartialConfig>().map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to parse config from yaml file: {e}, using default config."
            ))
        })?;
        merge_config(config, &partial)
    }
}
