//! A small codec for the ASCII properties files used by the tracking
//! sidecars. Only the subset of the format the sidecars need is supported:
//! `key=value` lines, `#`/`!` comments, and backslash escaping of
//! separator characters inside keys.

use std::collections::BTreeMap;

const HEADER: &str = "#NOTE: internal tracking file, do not edit\n";

fn escape_key(key: &str, out: &mut String) {
    for c in key.chars() {
        match c {
            '\\' | '=' | ':' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
}

fn escape_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
}

fn unescaped(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        _ => c,
    }
}

/// Renders the map as a properties file with sorted keys.
pub(crate) fn serialize(entries: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(HEADER.len() + entries.len() * 64);
    out.push_str(HEADER);
    for (key, value) in entries {
        escape_key(key, &mut out);
        out.push('=');
        escape_value(value, &mut out);
        out.push('\n');
    }
    out
}

/// Parses a properties file. Malformed lines are skipped rather than
/// reported; the caller treats missing entries as absent state.
pub(crate) fn parse(content: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let mut key = String::new();
        let mut value = None;
        let mut chars = line.char_indices();
        while let Some((index, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        key.push(unescaped(escaped));
                    }
                }
                '=' | ':' => {
                    let mut rest = String::new();
                    let mut tail = line[index + 1..].trim_start().chars();
                    while let Some(c) = tail.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = tail.next() {
                                    rest.push(unescaped(escaped));
                                }
                            }
                            _ => rest.push(c),
                        }
                    }
                    value = Some(rest);
                    break;
                }
                _ => key.push(c),
            }
        }
        if let Some(value) = value {
            entries.insert(key, value);
        }
    }
    entries
}
