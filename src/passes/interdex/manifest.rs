//! The dex manifest: one line per emitted dex.
//!
//! ```text
//! Lsecondary/dex01/Canary;,ordinal=1,coldstart=1,extended=0,primary=0,scroll=0,background=0
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
};

use crate::{
    model::{canary_name, DexInfo, DexUnit},
    Result,
};

/// File name of the manifest inside the output directory.
pub const MANIFEST_FILE: &str = "dex_manifest.txt";

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Canary descriptor of the dex.
    pub canary: String,
    /// Position of the dex; the primary dex is 0.
    pub ordinal: usize,
    /// Layout labels.
    pub info: DexInfo,
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |b: bool| u8::from(b);
        write!(
            f,
            "{},ordinal={},coldstart={},extended={},primary={},scroll={},background={}",
            self.canary,
            self.ordinal,
            flag(self.info.coldstart),
            flag(self.info.extended),
            flag(self.info.primary),
            flag(self.info.scroll),
            flag(self.info.background),
        )
    }
}

/// The manifest entries of `dexes`, in order.
///
/// A dex whose first class is a canary is named by it; the others by the canary name
/// their ordinal would have.
#[must_use]
pub fn manifest_entries(dexes: &[DexUnit]) -> Vec<ManifestEntry> {
    dexes
        .iter()
        .enumerate()
        .map(|(ordinal, dex)| ManifestEntry {
            canary: match dex.classes.first() {
                Some(first) if dex.has_canary() => first.ty().descriptor().to_string(),
                _ => canary_name(ordinal),
            },
            ordinal,
            info: dex.info,
        })
        .collect()
}

/// Renders the manifest of `dexes`, newline terminated.
#[must_use]
pub fn render_manifest(dexes: &[DexUnit]) -> String {
    manifest_entries(dexes)
        .iter()
        .map(|e| format!("{e}\n"))
        .collect()
}

/// Writes the manifest of `dexes` into `dir`.
///
/// # Errors
///
/// Returns [`crate::Error::FileError`] if the file cannot be written.
pub fn write_manifest(dir: &Path, dexes: &[DexUnit]) -> Result<PathBuf> {
    let path = dir.join(MANIFEST_FILE);
    std::fs::write(&path, render_manifest(dexes))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DexClass;

    #[test]
    fn test_line_format() {
        let dexes = vec![
            DexUnit::new(
                vec![],
                DexInfo {
                    primary: true,
                    ..DexInfo::default()
                },
            ),
            DexUnit::new(
                vec![DexClass::canary(1)],
                DexInfo {
                    coldstart: true,
                    scroll: true,
                    ..DexInfo::default()
                },
            ),
        ];
        assert_eq!(
            render_manifest(&dexes),
            "Lsecondary/dex00/Canary;,ordinal=0,coldstart=0,extended=0,primary=1,scroll=0,background=0\n\
             Lsecondary/dex01/Canary;,ordinal=1,coldstart=1,extended=0,primary=0,scroll=1,background=0\n"
        );
    }
}
