// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz `ServiceConfig` TOML parsing and validation.
//!
//! 1. `parse_toml` never panics on arbitrary input.
//! 2. Parsed configs validate without panics, and warnings display.
//! 3. Serialising back to TOML and re-parsing is lossless.
#![no_main]
use cvx_config::{ServiceConfig, parse_toml, validate_config};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = parse_toml(s) else {
        return;
    };

    match validate_config(&config) {
        Ok(warnings) => {
            for w in &warnings {
                let _ = format!("{w}");
            }
        }
        Err(e) => {
            let _ = format!("{e}");
        }
    }

    if let Ok(toml_str) = toml::to_string(&config) {
        if let Ok(rt) = parse_toml(&toml_str) {
            assert_eq!(config, rt, "TOML round-trip must be lossless");
        }
    }

    if let Ok(json) = serde_json::to_string(&config) {
        let back: ServiceConfig = serde_json::from_str(&json).expect("json round-trip");
        assert_eq!(config, back);
    }
});
