// SPDX-License-Identifier: GPL-3.0-only
//! Line-oriented parsing of the query tool's output
//!
//! The text is a sequence of blocks, one per output:
//!
//! ```text
//! HDMI-1 connected primary 1920x1080+0+0 (normal left inverted right) 527mm x 296mm
//!    1920x1080     60.00*+  50.00    30.00    24.00
//!    1280x720      60.00    50.00
//! DP-1 disconnected (normal left inverted right x axis y axis)
//! ```
//!
//! [`tokenize`] classifies every line; [`find_output`] walks the tokens to
//! collect the modes of one output.

use crate::mode::{Mode, OutputSnapshot};

/// Typed form of a single line of query output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Line<'a> {
    /// Unindented `<name> connected|disconnected ...` line
    Header { name: &'a str, connected: bool },
    /// Indented line, possibly a mode line of the current block
    ModeLine(&'a str),
    /// Any other unindented line; ends the current block
    Other,
}

/// Classify every line of `text`
pub fn tokenize(text: &str) -> impl Iterator<Item = Line<'_>> {
    text.lines().map(classify)
}

fn classify(line: &str) -> Line<'_> {
    if line.starts_with(char::is_whitespace) {
        return Line::ModeLine(line);
    }

    let (name, after) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let after = after.trim_start();
    let status = after.split(char::is_whitespace).next().unwrap_or_default();

    match status {
        "connected" if !name.is_empty() => Line::Header {
            name,
            connected: true,
        },
        "disconnected" if !name.is_empty() => Line::Header {
            name,
            connected: false,
        },
        _ => Line::Other,
    }
}

/// Parse the mode block of the connected output `name`
///
/// Returns `None` when no `<name> connected` header exists. A header followed
/// by no valid mode line yields a snapshot with an empty mode list.
pub fn find_output(text: &str, name: &str) -> Option<OutputSnapshot> {
    let mut lines = tokenize(text);

    lines.find(|line| {
        matches!(line, Line::Header { name: n, connected: true, .. } if *n == name)
    })?;

    let mut modes = Vec::new();
    for line in lines {
        let Line::ModeLine(text) = line else {
            break;
        };
        let parsed = parse_mode_line(text);
        for mode in &parsed {
            debug!("Parsed mode {} for {}", mode, name);
        }
        modes.extend(parsed);
    }

    Some(OutputSnapshot {
        name: name.to_string(),
        connected: true,
        modes,
    })
}

/// Modes of the connected output `name`; empty when it is absent
#[cfg(test)]
pub fn parse_modes(text: &str, name: &str) -> Vec<Mode> {
    find_output(text, name)
        .map(|snapshot| snapshot.modes)
        .unwrap_or_default()
}

/// Names of every output reported as connected, in query order
pub fn connected_outputs(text: &str) -> Vec<String> {
    tokenize(text)
        .filter_map(|line| match line {
            Line::Header {
                name,
                connected: true,
                ..
            } => Some(name.to_string()),
            _ => None,
        })
        .collect()
}

/// Parse one indented line into one mode per listed refresh rate
///
/// The first token must contain `<width>x<height>`; lines where it doesn't,
/// or where nothing follows it, yield nothing.
pub fn parse_mode_line(line: &str) -> Vec<Mode> {
    let line = line.trim_start();
    let Some((mode_name, rest)) = line.split_once(char::is_whitespace) else {
        return Vec::new();
    };
    let Some((width, height)) = parse_size(mode_name) else {
        return Vec::new();
    };
    if width == 0 || height == 0 {
        return Vec::new();
    }

    numbers(rest)
        .filter_map(|token| token.parse::<f64>().ok())
        .filter(|rate| *rate > 0.0)
        .map(|rate| Mode::new(width, height, rate))
        .collect()
}

/// Find the first `<digits>x<digits>` run in a mode name such as
/// `1920x1080`, `1920x1080i` or `1920x1080_60.00`
fn parse_size(token: &str) -> Option<(u32, u32)> {
    let bytes = token.as_bytes();
    let mut start = 0;

    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let width_end = digits_end(bytes, start);
        if bytes.get(width_end) == Some(&b'x') {
            let height_end = digits_end(bytes, width_end + 1);
            if height_end > width_end + 1 {
                let width = token[start..width_end].parse().ok()?;
                let height = token[width_end + 1..height_end].parse().ok()?;
                return Some((width, height));
            }
        }
        start = width_end;
    }

    None
}

fn digits_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |offset| from + offset)
}

/// Numeric tokens of the form `\d+(\.\d+)?`, skipping markers like `*` and `+`
fn numbers(text: &str) -> impl Iterator<Item = &str> {
    let bytes = text.as_bytes();
    let mut pos = 0;

    std::iter::from_fn(move || {
        while pos < bytes.len() && !bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos >= bytes.len() {
            return None;
        }

        let start = pos;
        pos = digits_end(bytes, pos);
        if bytes.get(pos) == Some(&b'.') && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) {
            pos = digits_end(bytes, pos + 1);
        }
        Some(&text[start..pos])
    })
}
