use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps customer contact data so it never lands in logs verbatim.
///
/// `Debug` and `Display` print a redacted form; emails keep their first
/// character and domain (`a***@example.com`) so support can still correlate
/// log lines. Serialization is transparent: API responses and stored
/// documents carry the real value.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T: AsRef<str>> Masked<T> {
    fn redacted(&self) -> String {
        let raw = self.0.as_ref();
        match raw.split_once('@') {
            Some((local, domain)) => {
                let first = local.chars().next().map(String::from).unwrap_or_default();
                format!("{}***@{}", first, domain)
            }
            None if raw.len() > 4 => {
                let tail: String = raw.chars().rev().take(3).collect::<Vec<_>>().into_iter().rev().collect();
                format!("****{}", tail)
            }
            None => "****".to_string(),
        }
    }
}

impl<T: AsRef<str>> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

impl<T: AsRef<str>> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Shorthand used at log call sites: `info!("... {}", masked(&email))`.
pub fn masked(value: &str) -> Masked<&str> {
    Masked(value)
}
