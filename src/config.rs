// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::fs::File;
use std::io;
use std::path::Path;

/// Configuration for the process host binary, read from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    /// Address the TCP listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Flat text file holding the persisted engine registry blob.
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
    /// Expected CONNECT code; an empty token accepts any client.
    #[serde(default)]
    pub connect_token: String,
    /// Load timeout applied when a LOAD_ENGINE message carries zero.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_listen() -> String {
    "127.0.0.1:3543".to_owned()
}

fn default_registry_path() -> String {
    "engines.txt".to_owned()
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            listen: default_listen(),
            registry_path: default_registry_path(),
            connect_token: String::new(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl HostConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<HostConfig> {
        let file = File::open(path)?;
        serde_json::from_reader(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::HostConfig;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: HostConfig = serde_json::from_str("{}").unwrap();
        assert_eq!("127.0.0.1:3543", config.listen);
        assert_eq!("engines.txt", config.registry_path);
        assert_eq!("", config.connect_token);
        assert_eq!(10_000, config.default_timeout_ms);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config: HostConfig =
            serde_json::from_str(r#"{"listen": "0.0.0.0:9000", "connect_token": "s3cret"}"#)
                .unwrap();
        assert_eq!("0.0.0.0:9000", config.listen);
        assert_eq!("s3cret", config.connect_token);
    }
}
