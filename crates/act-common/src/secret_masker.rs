// SecretMasker: thread-safe store of secret values, replaced by `***` in
// every line forwarded to the logger. Seeded from configured secrets and
// extended at runtime by `add-mask` workflow commands.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// A cloneable handle; clones share the same secret set.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<SecretMaskerInner>>,
}

#[derive(Debug, Default)]
struct SecretMaskerInner {
    /// Sorted longest first so a secret containing another is masked whole.
    secrets: Vec<String>,
    min_secret_length: usize,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Masker seeded with the given values.
    pub fn with_secrets<'a>(values: impl IntoIterator<Item = &'a String>) -> Self {
        let masker = Self::new();
        for value in values {
            masker.add_value(value);
        }
        masker
    }

    /// Register a value to mask. Empty or whitespace-only values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        if inner.secrets.iter().any(|s| s == trimmed) {
            return;
        }
        inner.secrets.push(trimmed.to_string());
        inner.secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        inner.min_secret_length = inner.secrets.iter().map(String::len).min().unwrap_or(0);
    }

    /// Replace every registered value in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let inner = self.inner.read();

        if inner.secrets.is_empty() || input.len() < inner.min_secret_length {
            return input.to_string();
        }

        let mut result = input.to_string();
        for secret in &inner.secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.inner.read().secrets.len()
    }
}
