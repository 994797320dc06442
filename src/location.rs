//! Geographic locations: the decoded geocoding result, its binary
//! serialization, and the canonicalization of free-form French location
//! text into geocodable candidates.

use crate::error::{JobdeckError, Result};
use crate::kv::{put_uvarint, uvarint};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// A resolved location. `post_code` is carried in memory only; the binary
/// record keeps the four name fields and the coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub city: String,
    pub county: String,
    pub state: String,
    pub country: String,
    pub post_code: String,
    pub lat: f64,
    pub lon: f64,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("city", &self.city),
            ("postcode", &self.post_code),
            ("county", &self.county),
            ("state", &self.state),
            ("country", &self.country),
        ];
        let mut written = false;
        for (name, value) in fields {
            if value.is_empty() {
                continue;
            }
            if written {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
            written = true;
        }
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let mut buf = [0u8; 10];
    let n = put_uvarint(&mut buf, s.len() as u64);
    out.extend_from_slice(&buf[..n]);
    out.extend_from_slice(s.as_bytes());
}

fn read_string<'a>(data: &'a [u8]) -> Result<(String, &'a [u8])> {
    let (len, n) = uvarint(data)
        .ok_or_else(|| JobdeckError::Decode("could not decode string length".into()))?;
    let len = len as usize;
    let rest = &data[n..];
    if rest.len() < len {
        return Err(JobdeckError::Decode("truncated location string".into()));
    }
    let s = std::str::from_utf8(&rest[..len])
        .map_err(|e| JobdeckError::Decode(e.to_string()))?
        .to_string();
    Ok((s, &rest[len..]))
}

/// Append the binary form of a location: four length-prefixed strings
/// followed by latitude and longitude as little-endian f64.
pub fn write_binary_location(out: &mut Vec<u8>, loc: &Location) {
    write_string(out, &loc.city);
    write_string(out, &loc.county);
    write_string(out, &loc.state);
    write_string(out, &loc.country);
    out.extend_from_slice(&loc.lat.to_le_bytes());
    out.extend_from_slice(&loc.lon.to_le_bytes());
}

/// Decode a binary location, returning it with the unread remainder.
pub fn read_binary_location(data: &[u8]) -> Result<(Location, &[u8])> {
    let mut loc = Location::default();
    let (city, data) = read_string(data)?;
    let (county, data) = read_string(data)?;
    let (state, data) = read_string(data)?;
    let (country, data) = read_string(data)?;
    if data.len() < 16 {
        return Err(JobdeckError::Decode("truncated location point".into()));
    }
    loc.city = city;
    loc.county = county;
    loc.state = state;
    loc.country = country;
    loc.lat = f64::from_le_bytes(data[..8].try_into().unwrap());
    loc.lon = f64::from_le_bytes(data[8..16].try_into().unwrap());
    Ok((loc, &data[16..]))
}

fn nfd(s: &str) -> String {
    s.nfd().collect()
}

fn nfc(s: &str) -> String {
    s.nfc().collect()
}

// Locative prefixes and noise words, matched on NFD-decomposed lowercase
// text. Offers write locations like "proche de Lyon", "dpt 42 ou 69",
// "agglo. nantaise" or "basé Paris".
static LOC_PREFIX: Lazy<Regex> = Lazy::new(|| {
    let pattern = nfd(
        "^(?:proche de|proche|dpts|dpt|départem\\.|départements|département|agglo\\.|agglo|agence de|agence|basé|régions|région)\\s*",
    );
    Regex::new(&pattern).unwrap()
});

static NOISE_WORDS: Lazy<Regex> = Lazy::new(|| {
    let pattern = nfd("(?:métropole|metropole)");
    Regex::new(&pattern).unwrap()
});

fn strip_prefixes(s: &str) -> Vec<String> {
    let mut stripped = s.to_string();
    loop {
        let next = LOC_PREFIX.replace(&stripped, "").trim().to_string();
        if next == stripped {
            break;
        }
        stripped = next;
    }
    let cleaned = NOISE_WORDS.replace_all(&stripped, "").trim().to_string();
    vec![cleaned]
}

fn split_alternatives(s: &str) -> Vec<String> {
    s.split(" ou ").map(|p| p.to_string()).collect()
}

fn fix_well_known(s: &str) -> Vec<String> {
    if s == "idf" {
        return vec!["ile-de-france".to_string()];
    }
    if s == "paca" {
        return vec!["provence-alpes-cote d'azur".to_string()];
    }
    if s == "75000" {
        return vec!["paris".to_string()];
    }
    if s.contains("boulogne b") {
        return vec!["boulogne billancourt".to_string()];
    }
    if s.contains("velizy") {
        return vec!["velizy".to_string()];
    }
    vec![s.to_string()]
}

fn consume_num_sep(mut s: &[u8]) -> (&[u8], usize) {
    let mut consumed = 0;
    loop {
        match s {
            [b' ', rest @ ..] | [b'-', rest @ ..] | [b'/', rest @ ..] | [b',', rest @ ..] => {
                consumed += 1;
                s = rest;
            }
            [b'o', b'u', rest @ ..] | [b'e', b't', rest @ ..] => {
                consumed += 2;
                s = rest;
            }
            _ => break,
        }
    }
    (s, consumed)
}

fn is_num(c: u8) -> bool {
    c.is_ascii_digit()
}

/// Split department-number lists like "23/45 - 52 ou 92" into individual
/// one- or two-digit codes. Anything else passes through unchanged.
fn fix_department_nums(s: &str) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut found = Vec::new();
    let (mut input, _) = consume_num_sep(bytes);
    loop {
        if input.len() >= 2 && is_num(input[0]) && is_num(input[1]) {
            found.push(String::from_utf8_lossy(&input[..2]).into_owned());
            input = &input[2..];
        } else if !input.is_empty() && is_num(input[0]) {
            found.push(String::from_utf8_lossy(&input[..1]).into_owned());
            input = &input[1..];
        } else {
            break;
        }
        let (rest, consumed) = consume_num_sep(input);
        input = rest;
        if consumed == 0 && !input.is_empty() {
            break;
        }
        if input.is_empty() {
            return found;
        }
    }
    vec![s.to_string()]
}

fn apply(input: Vec<String>, f: impl Fn(&str) -> Vec<String>) -> Vec<String> {
    let mut output = Vec::new();
    for s in input {
        for r in f(&s) {
            let r = r.trim().to_string();
            if !r.is_empty() {
                output.push(r);
            }
        }
    }
    output
}

/// Canonicalize a free-form French location into geocodable candidates, in
/// lookup order.
pub fn fix_location(s: &str) -> Vec<String> {
    let result = vec![nfd(&s.trim().to_lowercase())];
    let result = apply(result, split_alternatives);
    let result = apply(result, strip_prefixes);
    let result = apply(result, fix_well_known);
    let result = apply(result, fix_department_nums);
    apply(result, |s| vec![nfc(s)])
}
