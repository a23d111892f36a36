//! Known tunnel server host keys

use std::collections::HashSet;
use std::path::Path;

use russh_keys::key::PublicKey;

/// Fingerprints of the server keys the agent trusts
#[derive(Debug, Clone, Default)]
pub struct KnownHostKeys {
    fingerprints: HashSet<String>,
}

impl KnownHostKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse OpenSSH public key lines (`type base64 [comment]`).
    ///
    /// Blank lines and `#` comments are skipped; unparseable lines are
    /// logged and ignored.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut keys = Self::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_openssh_line(line) {
                Some(key) => keys.add(&key),
                None => tracing::warn!("Ignoring unparseable host key: {}", line),
            }
        }
        keys
    }

    /// Load every file in a directory, one key per line
    pub fn load_dir(dir: &Path) -> std::io::Result<Self> {
        let mut keys = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(entry.path())?;
            keys.fingerprints
                .extend(Self::from_lines(content.lines()).fingerprints);
        }
        tracing::info!("Loaded {} known host keys from {:?}", keys.len(), dir);
        Ok(keys)
    }

    pub fn add(&mut self, key: &PublicKey) {
        self.fingerprints.insert(key.fingerprint());
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.fingerprints.contains(&key.fingerprint())
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// How the server's host key is checked
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Only keys in the set are accepted
    Known(KnownHostKeys),
    /// Any key is accepted. Used for machines that were just created and
    /// when verification is explicitly disabled.
    AcceptAny,
}

impl HostKeyPolicy {
    pub fn accepts(&self, key: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::Known(keys) => keys.contains(key),
            HostKeyPolicy::AcceptAny => true,
        }
    }
}

fn parse_openssh_line(line: &str) -> Option<PublicKey> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    match parts.next() {
        Some(base64) => russh_keys::parse_public_key_base64(base64).ok(),
        None => russh_keys::parse_public_key_base64(first).ok(),
    }
}
