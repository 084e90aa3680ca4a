//! Candidate master keys and passphrases
//!
//! Candidates come from command-line hex strings, newline-delimited key
//! files (typically extracted from memory dumps) and passphrases. Order is
//! preserved: it decides which candidate wins when several verify.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use unseal_core::{fingerprint, Error, Result, MAX_TEXT_FILE_SIZE};

/// Where a candidate came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Provenance {
    /// `--master-key` argument, 1-based
    Argument { position: usize },
    /// Line of a key file, 1-based
    KeyFile { path: PathBuf, line: usize },
    /// `--passphrase` argument, 1-based
    Passphrase { position: usize },
    /// Concatenation of two earlier candidates (0-based set indices)
    XtsPair { first: usize, second: usize },
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Argument { position } => write!(f, "argument #{}", position),
            Provenance::KeyFile { path, line } => write!(f, "{}:{}", path.display(), line),
            Provenance::Passphrase { position } => write!(f, "passphrase #{}", position),
            Provenance::XtsPair { first, second } => write!(f, "XTS pair of candidates {}+{}", first, second),
        }
    }
}

/// Whether a candidate is key bytes or a passphrase to run through a KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeyForm {
    Raw,
    Passphrase,
}

/// One candidate key
#[derive(Clone, PartialEq, Eq)]
pub struct CandidateKey {
    bytes: Vec<u8>,
    form: KeyForm,
    provenance: Provenance,
}

impl CandidateKey {
    /// Raw key bytes
    pub fn raw(bytes: Vec<u8>, provenance: Provenance) -> Self {
        Self {
            bytes,
            form: KeyForm::Raw,
            provenance,
        }
    }

    /// Passphrase text
    pub fn passphrase(text: &str, provenance: Provenance) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
            form: KeyForm::Passphrase,
            provenance,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn form(&self) -> KeyForm {
        self.form
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_raw(&self) -> bool {
        self.form == KeyForm::Raw
    }
}

impl fmt::Debug for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateKey")
            .field("form", &self.form)
            .field("len", &self.bytes.len())
            .field("fingerprint", &fingerprint(&self.bytes))
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// Parse a hex key, tolerating a `0x` prefix and `:`/space/`-` separators
pub fn parse_hex_key(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-' | '\t'))
        .collect();

    if cleaned.is_empty() {
        return Err(Error::invalid_key("empty key"));
    }

    hex::decode(&cleaned).map_err(|e| Error::invalid_key(format!("not a hex key: {}", e)))
}

/// Upper bound on candidates [`CandidateSet::add_xts_pairs`] appends
pub const MAX_XTS_PAIRS: usize = 65_536;

/// Ordered, duplicate-free set of candidates
#[derive(Clone, Default)]
pub struct CandidateSet {
    keys: Vec<CandidateKey>,
    seen: HashSet<(KeyForm, Vec<u8>)>,
}

impl fmt::Debug for CandidateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.keys).finish()
    }
}

impl CandidateSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate unless identical bytes of the same form are present
    ///
    /// Returns whether the candidate was added.
    pub fn push(&mut self, key: CandidateKey) -> bool {
        if !self.seen.insert((key.form, key.bytes.clone())) {
            debug!("Skipping duplicate candidate from {}", key.provenance);
            return false;
        }
        self.keys.push(key);
        true
    }

    /// Add one hex key given on the command line
    pub fn add_hex(&mut self, text: &str, position: usize) -> Result<bool> {
        let bytes = parse_hex_key(text)
            .map_err(|e| Error::invalid_key(format!("argument #{}: {}", position, e)))?;
        Ok(self.push(CandidateKey::raw(bytes, Provenance::Argument { position })))
    }

    /// Add one passphrase
    pub fn add_passphrase(&mut self, text: &str, position: usize) -> bool {
        self.push(CandidateKey::passphrase(text, Provenance::Passphrase { position }))
    }

    /// Load a newline-delimited hex key file
    ///
    /// Blank lines and lines starting with `#` are skipped; a malformed
    /// line fails the whole load with its line number.
    pub fn load_key_file(&mut self, path: &Path) -> Result<usize> {
        let size = fs::metadata(path)?.len();
        if size > MAX_TEXT_FILE_SIZE {
            return Err(Error::invalid_key(format!(
                "{}: key file of {} bytes exceeds limit {}",
                path.display(),
                size,
                MAX_TEXT_FILE_SIZE
            )));
        }
        let text = fs::read_to_string(path)?;
        let added = self.add_key_lines(&text, path)?;
        info!("Loaded {} candidate keys from {}", added, path.display());
        Ok(added)
    }

    /// Add keys from key-file text attributed to `path`
    pub fn add_key_lines(&mut self, text: &str, path: &Path) -> Result<usize> {
        let mut parsed = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let content = line.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let bytes = parse_hex_key(content)
                .map_err(|e| Error::invalid_key(format!("{}:{}: {}", path.display(), line_no, e)))?;
            parsed.push(CandidateKey::raw(
                bytes,
                Provenance::KeyFile {
                    path: path.to_path_buf(),
                    line: line_no,
                },
            ));
        }

        Ok(parsed.into_iter().filter(|key| self.push(key.clone())).count())
    }

    /// Append every ordered concatenation of two same-length raw candidates
    ///
    /// Memory dumps expose the two XTS half-keys separately; the pairs are
    /// appended after all original candidates so originals keep priority.
    /// At most [`MAX_XTS_PAIRS`] pairs are added.
    pub fn add_xts_pairs(&mut self) -> usize {
        self.add_xts_pairs_limited(MAX_XTS_PAIRS)
    }

    fn add_xts_pairs_limited(&mut self, limit: usize) -> usize {
        let originals: Vec<(usize, CandidateKey)> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_raw())
            .map(|(i, k)| (i, k.clone()))
            .collect();

        let mut added = 0;
        for (i, first) in &originals {
            for (j, second) in &originals {
                if i == j || first.len() != second.len() {
                    continue;
                }
                if added == limit {
                    warn!(
                        "Stopped combining half-keys at {} pairs (of {} raw candidates)",
                        limit,
                        originals.len()
                    );
                    return added;
                }
                let mut bytes = first.bytes.clone();
                bytes.extend_from_slice(&second.bytes);
                let pair = CandidateKey::raw(bytes, Provenance::XtsPair { first: *i, second: *j });
                if self.push(pair) {
                    added += 1;
                }
            }
        }
        debug!("Added {} XTS pair candidates", added);
        added
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CandidateKey> {
        self.keys.get(index)
    }

    pub fn as_slice(&self) -> &[CandidateKey] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateKey> {
        self.keys.iter()
    }

    /// True when any candidate is a passphrase
    pub fn has_passphrases(&self) -> bool {
        self.keys.iter().any(|k| k.form == KeyForm::Passphrase)
    }
}

impl FromIterator<CandidateKey> for CandidateSet {
    fn from_iter<I: IntoIterator<Item = CandidateKey>>(iter: I) -> Self {
        let mut set = CandidateSet::new();
        for key in iter {
            set.push(key);
        }
        set
    }
}
