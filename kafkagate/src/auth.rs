// kafkagate/src/auth.rs
//
// HTTP Basic authentication against an htpasswd-style credential file.
//
// File format: one `user:{PLAIN}password` entry per line. Ill-formed lines
// (missing colon, unsupported hashing scheme) are skipped with a warning so a
// single bad entry can't lock every sender out.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;

const PLAIN_PREFIX: &str = "{PLAIN}";

/// Parsed credential database.
#[derive(Debug, Default, Clone)]
pub struct Htpasswd {
    // user → plaintext password
    entries: HashMap<String, String>,
}

impl Htpasswd {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read htpasswd file {}", path.display()))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let Some((user, hashed)) = line.split_once(':') else {
                warn!("htpasswd line {}: no colon found, skipping", lineno + 1);
                continue;
            };
            let Some(password) = hashed.strip_prefix(PLAIN_PREFIX) else {
                warn!(
                    "htpasswd line {}: unsupported hashing scheme, skipping",
                    lineno + 1
                );
                continue;
            };
            entries.insert(user.to_string(), password.to_string());
        }
        Self { entries }
    }

    /// Check a user/password pair against the database.
    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        self.entries.get(user).map(String::as_str) == Some(password)
    }
}

/// Decode an `Authorization: Basic <b64>` header value into (user, password).
pub fn parse_basic_authorization(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
