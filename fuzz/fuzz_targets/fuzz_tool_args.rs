// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz `x-tool-args` splitting.
//!
//! 1. `split_tool_args` never panics.
//! 2. Accepted tokens carry no control characters and respect the limits.
//! 3. Re-quoting the tokens and splitting again yields the same tokens.
#![no_main]
use cvx_daemon::params::{MAX_ARG_LEN, MAX_TOOL_ARGS, split_tool_args};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(tokens) = split_tool_args(raw) else {
        return;
    };

    assert!(tokens.len() <= MAX_TOOL_ARGS);
    for token in &tokens {
        assert!(token.len() <= MAX_ARG_LEN);
        assert!(!token.chars().any(char::is_control));
    }

    let requoted: Vec<String> = tokens
        .iter()
        .map(|t| format!("\"{}\"", t.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    let again = split_tool_args(&requoted.join(" ")).expect("re-quoted tokens must split");
    assert_eq!(tokens, again);
});
