//! Salary text parsing. Offers carry salaries as free text: "45 - 55 kEUR",
//! "de 40 à 45 K€", "selon profil", "A définir"…

use crate::error::{JobdeckError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static SALARY_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)").unwrap());

fn is_mark(c: char) -> bool {
    ('\u{0300}'..='\u{036F}').contains(&c)
}

fn norm_string(s: &str) -> String {
    s.nfd().filter(|c| !is_mark(*c)).nfc().collect()
}

/// Extract (min, max) salary bounds in kEUR from a salary text. Texts with
/// no number at all parse as (0, 0); more than two numbers is an error.
/// Amounts given in euros are scaled down to kEUR.
pub fn parse_salary(s: &str) -> Result<(i32, i32)> {
    let s = norm_string(s).to_lowercase();
    let mut values = Vec::new();
    for m in SALARY_NUM.find_iter(&s) {
        let v: f64 = m
            .as_str()
            .parse()
            .map_err(|e| JobdeckError::Decode(format!("invalid salary number: {}", e)))?;
        let v = if v >= 1000.0 { v / 1000.0 } else { v };
        values.push(v as i32);
    }
    match values.len() {
        0 => Ok((0, 0)),
        1 => Ok((values[0], values[0])),
        2 => Ok((values[0], values[1])),
        _ => Err(JobdeckError::Decode("too many numbers".into())),
    }
}
