//! Parsing of free-form edit instructions.
//!
//! Two things are pulled out of instruction or analysis text:
//!
//! * a **strength** value:
//!
//!   ```text
//!   strength := "strength" ws* [":" | "="] ws* number ["%"]
//!   number   := digit+ ["." digit+]
//!   ```
//!
//!   matched case-insensitively anywhere in the text. Values above `1` are
//!   read as percentages; the result is clamped to `0.0..=1.0`.
//!
//! * an **AI-facing section**: a heading line whose text, after stripping
//!   leading `#`, `*`, `-` and whitespace, starts with `ai-facing`,
//!   `ai facing`, `for ai` or `ai prompt`. The section body is the remainder
//!   of the heading line after the first `:` plus every following line up to
//!   the next heading (a line starting with `#`, or a line wrapped in `**`).

use std::ops::Range;

const SECTION_MARKERS: [&str; 4] = ["ai-facing", "ai facing", "for ai", "ai prompt"];

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionDirective {
    pub text: String,
    pub strength: Option<f32>,
}

/// Splits an instruction into the text a model should see and an optional
/// strength. The strength clause is removed from the text.
pub fn parse_directive(raw: &str) -> InstructionDirective {
    let base = extract_ai_section(raw).unwrap_or_else(|| raw.trim().to_string());
    match find_strength(&base) {
        Some((strength, span)) => {
            let mut text = String::with_capacity(base.len());
            text.push_str(&base[..span.start]);
            text.push_str(&base[span.end..]);
            InstructionDirective {
                text: tidy(&text),
                strength: Some(strength),
            }
        }
        None => InstructionDirective {
            text: base,
            strength: find_strength(raw).map(|(value, _)| value),
        },
    }
}

pub fn parse_strength(text: &str) -> Option<f32> {
    find_strength(text).map(|(value, _)| value)
}

pub fn extract_ai_section(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|line| is_ai_heading(line))?;

    let mut body: Vec<&str> = Vec::new();
    if let Some((_, tail)) = lines[start].split_once(':') {
        let tail = tail.trim().trim_matches('*').trim();
        if !tail.is_empty() {
            body.push(tail);
        }
    }
    for line in &lines[start + 1..] {
        if is_heading(line) {
            break;
        }
        body.push(line.trim());
    }

    let joined = body.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn find_strength(text: &str) -> Option<(f32, Range<usize>)> {
    let lowered = text.to_ascii_lowercase();
    let bytes = lowered.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = lowered[search_from..].find("strength") {
        let start = search_from + offset;
        let mut idx = start + "strength".len();
        search_from = idx;

        idx = skip_spaces(bytes, idx);
        if idx < bytes.len() && (bytes[idx] == b':' || bytes[idx] == b'=') {
            idx = skip_spaces(bytes, idx + 1);
        }
        let number_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx == number_start {
            continue;
        }
        if idx + 1 < bytes.len() && bytes[idx] == b'.' && bytes[idx + 1].is_ascii_digit() {
            idx += 1;
            while idx < bytes.len() && bytes[idx].is_ascii_digit() {
                idx += 1;
            }
        }
        let Ok(mut value) = lowered[number_start..idx].parse::<f32>() else {
            continue;
        };
        let percent = idx < bytes.len() && bytes[idx] == b'%';
        if percent {
            idx += 1;
        }
        if percent || value > 1.0 {
            value /= 100.0;
        }
        return Some((value.clamp(0.0, 1.0), start..idx));
    }
    None
}

fn skip_spaces(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() && (bytes[idx] == b' ' || bytes[idx] == b'\t') {
        idx += 1;
    }
    idx
}

fn heading_text(line: &str) -> String {
    line.trim_start_matches(|ch: char| ch == '#' || ch == '*' || ch == '-' || ch.is_whitespace())
        .to_ascii_lowercase()
}

fn is_ai_heading(line: &str) -> bool {
    let text = heading_text(line);
    SECTION_MARKERS.iter().any(|marker| text.starts_with(marker))
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('#')
        || (trimmed.len() > 4 && trimmed.starts_with("**") && trimmed.ends_with("**"))
}

fn tidy(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    collapsed
        .trim_matches(|ch: char| ch == ',' || ch == ';' || ch.is_whitespace())
        .replace(" ,", ",")
        .replace(" .", ".")
}
