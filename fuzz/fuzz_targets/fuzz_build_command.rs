// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fuzz command assembly against a fixed tool with a flag allowlist.
//!
//! Whatever the caller sends, an accepted command keeps the template's fixed
//! tokens in place, never carries a flag outside the allowlist, and never
//! carries a value that could name a file.
#![no_main]
use arbitrary::Arbitrary;
use cvx_config::ToolEntry;
use cvx_daemon::params::build_command;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    format: Option<String>,
    args: Option<String>,
}

fuzz_target!(|input: Input| {
    let tool = ToolEntry {
        program: "magick".into(),
        args: vec!["-".into(), "{args}".into(), "{format}:-".into()],
        formats: vec!["png".into(), "jpg".into()],
        default_format: Some("png".into()),
        allowed_flags: vec!["-resize".into(), "-quality".into()],
        ..ToolEntry::default()
    };

    let Ok(plan) = build_command(&tool, input.format.as_deref(), input.args.as_deref()) else {
        return;
    };

    let args = plan.spec.args();
    assert_eq!(args.first().map(String::as_str), Some("-"));
    let last = args.last().expect("template ends with the output token");
    assert!(last == "png:-" || last == "jpg:-");
    for arg in &args[1..args.len() - 1] {
        if arg.starts_with("--") || (arg.starts_with('-') && arg[1..].starts_with(|c: char| c.is_ascii_alphabetic())) {
            let name = arg.split_once('=').map_or(arg.as_str(), |(n, _)| n);
            assert!(tool.allowed_flags.iter().any(|f| f == name), "flag {name} slipped through");
        } else {
            assert!(!arg.starts_with('@') && !arg.contains(['/', '\\', ':']), "value {arg} slipped through");
        }
    }
});
