// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate log;

mod kafka_cache;

pub use kafka_cache::{KafkaCache, KafkaCacheConfig, TopicOverrides};

use serde::{Deserialize, Serialize};

use std::io::Read;

/// Top-level configuration file for a process hosting topic caches.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub kafka_cache: KafkaCache,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, std::io::Error> {
        match toml::from_str(content) {
            Ok(t) => Ok(t),
            Err(e) => {
                error!("{}", e);
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Error parsing config",
                ))
            }
        }
    }
}

impl KafkaCacheConfig for Config {
    fn kafka_cache(&self) -> &KafkaCache {
        &self.kafka_cache
    }
}
