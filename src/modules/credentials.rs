//! Display-safe connection strings.
//!
//! Connection strings may carry an inline `password=` or a `credentials=`
//! file path in their query. Anything that leaves the process (mount
//! options, log lines, error messages) uses the masked form built here.

use super::constants::{CREDENTIALS_KEY, CREDENTIALS_MASK, PASSWORD_KEY, PASSWORD_MASK};
use std::fmt;
use zeroize::Zeroizing;

fn mask_for(key: &str) -> Option<&'static str> {
    match key {
        PASSWORD_KEY => Some(PASSWORD_MASK),
        CREDENTIALS_KEY => Some(CREDENTIALS_MASK),
        _ => None,
    }
}

/// Returns `conn` with every credential value replaced by its mask.
///
/// Only the query (after the first `?`) is inspected. Parameters are split
/// on `&`; a parameter whose key is exactly `password` or `credentials` has
/// its value replaced, everything else is copied unchanged and in order.
pub fn mask_credentials(conn: &str) -> String {
    let (base, query) = match conn.split_once('?') {
        Some(split) => split,
        None => return conn.to_string(),
    };

    let mut masked = String::with_capacity(conn.len());
    masked.push_str(base);
    masked.push('?');

    for (i, param) in query.split('&').enumerate() {
        if i > 0 {
            masked.push('&');
        }
        match param.split_once('=') {
            Some((key, _)) => match mask_for(key) {
                Some(mask) => {
                    masked.push_str(key);
                    masked.push('=');
                    masked.push_str(mask);
                }
                None => masked.push_str(param),
            },
            None => masked.push_str(param),
        }
    }

    masked
}

/// A credential value that is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// The secret itself, for handing to a client library.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PASSWORD_MASK)
    }
}
