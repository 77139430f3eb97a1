//! The interdex class order ("betamap").
//!
//! One entry per line: a class, either as a descriptor (`Lcom/foo/Bar;`) or as a class
//! file name (`com/foo/Bar.class`), or one of the marker names that delimit regions of
//! the order. Markers may carry either suffix or none.

use std::fmt;

use crate::{pool::DexType, Error, Result};

/// One parsed betamap line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BetamapEntry {
    /// A class to place.
    Class(DexType),
    /// `DexEndMarker<n>`: close the current dex.
    DexEnd,
    /// `ColdStart20PctEnd`: later classes belong to the extended coldstart set.
    ColdStart20PctEnd,
    /// `ScrollSetStart`.
    ScrollSetStart,
    /// `ScrollSetEnd`.
    ScrollSetEnd,
    /// `BackgroundSetStart`.
    BackgroundSetStart,
    /// `BackgroundSetEnd`.
    BackgroundSetEnd,
}

impl BetamapEntry {
    /// `true` for every entry but [`BetamapEntry::Class`].
    #[must_use]
    pub fn is_marker(&self) -> bool {
        !matches!(self, Self::Class(_))
    }

    fn marker(name: &str) -> Option<Self> {
        if let Some(n) = name.strip_prefix("DexEndMarker") {
            return n.chars().all(|c| c.is_ascii_digit()).then_some(Self::DexEnd);
        }
        match name {
            "ColdStart20PctEnd" => Some(Self::ColdStart20PctEnd),
            "ScrollSetStart" => Some(Self::ScrollSetStart),
            "ScrollSetEnd" => Some(Self::ScrollSetEnd),
            "BackgroundSetStart" => Some(Self::BackgroundSetStart),
            "BackgroundSetEnd" => Some(Self::BackgroundSetEnd),
            _ => None,
        }
    }
}

impl fmt::Display for BetamapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class(ty) => write!(f, "{ty}"),
            Self::DexEnd => f.write_str("DexEndMarker"),
            Self::ColdStart20PctEnd => f.write_str("ColdStart20PctEnd"),
            Self::ScrollSetStart => f.write_str("ScrollSetStart"),
            Self::ScrollSetEnd => f.write_str("ScrollSetEnd"),
            Self::BackgroundSetStart => f.write_str("BackgroundSetStart"),
            Self::BackgroundSetEnd => f.write_str("BackgroundSetEnd"),
        }
    }
}

/// Parses one betamap line.
///
/// # Errors
///
/// Returns [`Error::InvalidBetamap`] for a class name that ends in neither `.class` nor
/// `;`.
pub fn parse_entry(line: &str) -> Result<BetamapEntry> {
    let line = line.trim();
    let bare = line
        .strip_suffix(".class")
        .or_else(|| line.strip_prefix('L').and_then(|l| l.strip_suffix(';')))
        .unwrap_or(line);
    if let Some(marker) = BetamapEntry::marker(bare) {
        return Ok(marker);
    }
    if let Some(stem) = line.strip_suffix(".class") {
        return Ok(BetamapEntry::Class(DexType::make(&format!("L{stem};"))));
    }
    if line.starts_with('L') && line.ends_with(';') {
        return Ok(BetamapEntry::Class(DexType::make(line)));
    }
    Err(Error::InvalidBetamap(line.to_string()))
}

/// Parses a whole betamap, skipping blank lines and `#` comments.
///
/// # Errors
///
/// Returns [`Error::InvalidBetamap`] naming the first malformed line.
pub fn parse_betamap<S: AsRef<str>>(lines: &[S]) -> Result<Vec<BetamapEntry>> {
    lines
        .iter()
        .map(AsRef::as_ref)
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(parse_entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_spellings() {
        assert_eq!(
            parse_entry("com/foo/Bar.class").unwrap(),
            BetamapEntry::Class(DexType::make("Lcom/foo/Bar;"))
        );
        assert_eq!(
            parse_entry("Lcom/foo/Bar;").unwrap(),
            BetamapEntry::Class(DexType::make("Lcom/foo/Bar;"))
        );
    }

    #[test]
    fn test_markers() {
        let entries = parse_betamap(&[
            "DexEndMarker0.class",
            "LDexEndMarker12;",
            "ColdStart20PctEnd",
            "ScrollSetStart.class",
            "ScrollSetEnd.class",
            "BackgroundSetStart.class",
            "BackgroundSetEnd.class",
        ])
        .unwrap();
        assert_eq!(
            entries,
            vec![
                BetamapEntry::DexEnd,
                BetamapEntry::DexEnd,
                BetamapEntry::ColdStart20PctEnd,
                BetamapEntry::ScrollSetStart,
                BetamapEntry::ScrollSetEnd,
                BetamapEntry::BackgroundSetStart,
                BetamapEntry::BackgroundSetEnd,
            ]
        );
    }

    #[test]
    fn test_invalid_name_is_typed_error() {
        let err = parse_betamap(&["com/foo/Bar.class", "com/foo/Baz"]).unwrap_err();
        assert!(matches!(err, Error::InvalidBetamap(name) if name == "com/foo/Baz"));
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        let entries = parse_betamap(&["", "# header", "  LA;  "]).unwrap();
        assert_eq!(entries, vec![BetamapEntry::Class(DexType::make("LA;"))]);
    }
}
