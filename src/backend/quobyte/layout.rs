//! Parser for the Quobyte file-layout attribute.
//!
//! The layout text is a sequence of `segment { start_offset: N length: N stripe { version: N
//! device_id: N ... } }` blocks preceded by a `posix_attrs` block of file metadata. The parse
//! is intentionally loose: the text is split on the literal `segment`, each chunk is tokenized
//! into alphanumeric/underscore runs with all punctuation acting as separators, and the
//! interesting fields are pulled out of the token stream by name. A malformed numeric token
//! drops only the field it belongs to, never the whole parse.

use std::str::FromStr;

/// A contiguous byte range of one file and the stripe holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start_offset: u64,
    pub length: u64,
    pub stripe: Stripe,
}

/// The ordered set of physical devices holding one segment's replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stripe {
    pub version: u32,
    pub device_ids: Vec<u64>,
}

/// Parse the raw layout attribute text of one file into its segments.
pub fn parse_layout(raw: &str) -> Vec<Segment> {
    let mut segments = vec![];
    for chunk in raw.split("segment") {
        let tokens: Vec<&str> = chunk
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|token| !token.is_empty())
            .collect();
        let first = match tokens.first() {
            Some(first) => *first,
            None => continue,
        };
        if first == "posix_attrs" {
            continue;
        }

        let mut start_offset = 0;
        let mut length = 0;
        let mut stripe = Stripe::default();
        let mut idx = 0;
        while idx < tokens.len() {
            match tokens[idx] {
                "start_offset" => {
                    if let Some(val) = parse_field(&tokens, idx) {
                        start_offset = val;
                    }
                    idx += 1;
                }
                "length" => {
                    if let Some(val) = parse_field(&tokens, idx) {
                        length = val;
                    }
                    idx += 1;
                }
                "version" => {
                    if let Some(val) = parse_field(&tokens, idx) {
                        stripe.version = val;
                    }
                    idx += 1;
                }
                "device_id" => {
                    if let Some(val) = parse_field(&tokens, idx) {
                        stripe.device_ids.push(val);
                    }
                    idx += 1;
                }
                _ => (),
            }
            idx += 1;
        }
        segments.push(Segment { start_offset, length, stripe });
    }
    segments
}

/// Parse the token following the named field token at `idx`, skipping the field on error.
fn parse_field<T: FromStr>(tokens: &[&str], idx: usize) -> Option<T> {
    let field = tokens[idx];
    let val = match tokens.get(idx + 1) {
        Some(val) => *val,
        None => {
            tracing::warn!(%field, "layout field has no value token, skipping");
            return None;
        }
    };
    match val.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(%field, value = %val, "malformed numeric token in layout, skipping field");
            None
        }
    }
}
