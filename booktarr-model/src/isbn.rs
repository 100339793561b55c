//! ISBN value types and the 10 ↔ 13 digit conversion rules.
//!
//! ISBN-13 is the canonical edition key everywhere in Booktarr; a lone
//! ISBN-10 is kept verbatim and promoted through the standard
//! 978-prefix recomputation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// A validated ISBN-10. Digits only, except the check position which
/// may be `X` (stored uppercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Isbn10(String);

/// A validated ISBN-13. Thirteen digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Isbn13(String);

/// Either ISBN form, as parsed from user or vendor input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isbn {
    Ten(Isbn10),
    Thirteen(Isbn13),
}

impl Isbn {
    /// Parse an ISBN in either form. Separators (hyphens, spaces, and
    /// any other non-alphanumeric characters) are stripped before
    /// validation; `x` is accepted case-insensitively in the ISBN-10
    /// check position only.
    pub fn parse(input: &str) -> Result<Self> {
        let cleaned: String = input.chars().filter(char::is_ascii_alphanumeric).collect();

        match cleaned.len() {
            10 => Isbn10::new(&cleaned).map(Isbn::Ten),
            13 => Isbn13::new(&cleaned).map(Isbn::Thirteen),
            n => Err(ModelError::InvalidIsbn(format!(
                "expected 10 or 13 characters, got {n}"
            ))),
        }
    }

    /// The canonical ISBN-13 form, promoting an ISBN-10 if needed.
    pub fn canonical(&self) -> Isbn13 {
        match self {
            Isbn::Ten(isbn10) => isbn10.to_isbn13(),
            Isbn::Thirteen(isbn13) => isbn13.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Isbn::Ten(isbn10) => isbn10.as_str(),
            Isbn::Thirteen(isbn13) => isbn13.as_str(),
        }
    }
}

impl fmt::Display for Isbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Isbn10 {
    pub fn new(cleaned: &str) -> Result<Self> {
        if cleaned.len() != 10 {
            return Err(ModelError::InvalidIsbn(format!(
                "ISBN-10 must be 10 characters, got {}",
                cleaned.len()
            )));
        }

        let upper = cleaned.to_ascii_uppercase();
        let bytes = upper.as_bytes();
        if !bytes[..9].iter().all(u8::is_ascii_digit) {
            return Err(ModelError::InvalidIsbn(
                "ISBN-10 positions 1-9 must be digits".to_string(),
            ));
        }
        if !(bytes[9].is_ascii_digit() || bytes[9] == b'X') {
            return Err(ModelError::InvalidIsbn(
                "ISBN-10 check position must be a digit or X".to_string(),
            ));
        }

        let mut total: u32 = 0;
        for (i, b) in bytes.iter().enumerate() {
            let value = if *b == b'X' { 10 } else { u32::from(b - b'0') };
            total += value * (10 - i as u32);
        }
        if total % 11 != 0 {
            return Err(ModelError::InvalidIsbn(format!(
                "ISBN-10 check digit mismatch for {upper}"
            )));
        }

        Ok(Self(upper))
    }

    /// Promote to ISBN-13: `978` prefix plus a recomputed mod-10 check
    /// digit over the first nine digits.
    pub fn to_isbn13(&self) -> Isbn13 {
        let mut base = String::with_capacity(13);
        base.push_str("978");
        base.push_str(&self.0[..9]);

        let check = isbn13_check_digit(base.as_bytes());
        base.push(char::from(b'0' + check));

        Isbn13(base)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Isbn10 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Isbn13 {
    pub fn new(cleaned: &str) -> Result<Self> {
        if cleaned.len() != 13 || !cleaned.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ModelError::InvalidIsbn(
                "ISBN-13 must be 13 digits".to_string(),
            ));
        }

        let check = isbn13_check_digit(&cleaned.as_bytes()[..12]);
        if check != cleaned.as_bytes()[12] - b'0' {
            return Err(ModelError::InvalidIsbn(format!(
                "ISBN-13 check digit mismatch for {cleaned}"
            )));
        }

        Ok(Self(cleaned.to_string()))
    }

    /// Demote to ISBN-10. Only `978`-prefixed values have an ISBN-10
    /// equivalent.
    pub fn to_isbn10(&self) -> Option<Isbn10> {
        let base = self.0.strip_prefix("978")?;
        let base = &base[..9];

        let mut total: u32 = 0;
        for (i, b) in base.bytes().enumerate() {
            total += u32::from(b - b'0') * (10 - i as u32);
        }
        let check = (11 - total % 11) % 11;

        let mut out = String::with_capacity(10);
        out.push_str(base);
        out.push(if check == 10 {
            'X'
        } else {
            char::from(b'0' + check as u8)
        });

        Some(Isbn10(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Isbn13 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn isbn13_check_digit(first_twelve: &[u8]) -> u8 {
    let mut total: u32 = 0;
    for (i, b) in first_twelve.iter().enumerate() {
        let weight = if i % 2 == 1 { 3 } else { 1 };
        total += u32::from(b - b'0') * weight;
    }
    ((10 - total % 10) % 10) as u8
}

/// Shape test used to classify search queries: 10 or 13 digits with an
/// optional `X` check digit (ISBN-10 only), separators stripped. Does
/// not verify the check digit; a lookup against a malformed-but-shaped
/// ISBN simply finds nothing.
pub fn looks_like_isbn(query: &str) -> bool {
    let cleaned: String = query
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();

    match cleaned.len() {
        13 => cleaned.bytes().all(|b| b.is_ascii_digit()),
        10 => {
            let bytes = cleaned.as_bytes();
            bytes[..9].iter().all(u8::is_ascii_digit)
                && (bytes[9].is_ascii_digit() || bytes[9].eq_ignore_ascii_case(&b'X'))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_promotes_isbn10() {
        let isbn = Isbn::parse("0439708184").unwrap();
        assert_eq!(isbn.canonical().as_str(), "9780439708180");
    }

    #[test]
    fn parse_strips_separators_and_case() {
        let isbn = Isbn::parse("0-8044-2957-x").unwrap();
        assert_eq!(isbn.as_str(), "080442957X");

        let isbn = Isbn::parse("978 0439 708 180").unwrap();
        assert_eq!(isbn.as_str(), "9780439708180");
    }

    #[test]
    fn rejects_bad_check_digits() {
        assert!(Isbn::parse("0439708185").is_err());
        assert!(Isbn::parse("9780439708181").is_err());
    }

    #[test]
    fn rejects_x_outside_check_position() {
        assert!(Isbn::parse("04397X8184").is_err());
    }

    #[test]
    fn round_trips_isbn10_through_isbn13() {
        for raw in ["0439708184", "080442957X", "0306406152"] {
            let Ok(Isbn::Ten(original)) = Isbn::parse(raw) else {
                panic!("expected valid ISBN-10: {raw}");
            };
            let promoted = original.to_isbn13();
            let demoted = promoted.to_isbn10().unwrap();
            assert_eq!(original, demoted);
        }
    }

    #[test]
    fn demotion_requires_978_prefix() {
        let isbn = Isbn13::new("9791037502346").unwrap();
        assert!(isbn.to_isbn10().is_none());
    }

    #[test]
    fn shape_classifier() {
        assert!(looks_like_isbn("9780439708180"));
        assert!(looks_like_isbn("0-439-70818-4"));
        assert!(looks_like_isbn("080442957x"));
        assert!(!looks_like_isbn("harry potter"));
        assert!(!looks_like_isbn("12345"));
        assert!(!looks_like_isbn("97804397081800"));
    }
}
