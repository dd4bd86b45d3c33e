//! Keyed pseudonymization of personal identifiers (CPF).
//!
//! Raw identifiers never leave this module in any persisted form: callers
//! clean them with [`clean_identifier`], derive the registry-comparable
//! [`JoinKeyMode::join_key`], and only ever store [`PseudonymId`] values.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{EgressosError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Fixed input hashed to fingerprint a key without revealing it.
const FINGERPRINT_INPUT: &str = "egressos:key-fingerprint:v1";

/// Number of digits in a CPF.
const CPF_LEN: usize = 11;

/// Length of the CPF fragment left visible by the registry masking.
const MASKED_FRAGMENT_LEN: usize = 6;

// ---------------------------------------------------------------------------
// PseudonymId
// ---------------------------------------------------------------------------

/// Hex-encoded HMAC-SHA256 of an identifier (64 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PseudonymId(String);

impl PseudonymId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for PseudonymId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// IdentityHasher
// ---------------------------------------------------------------------------

/// Deterministic one-way mapping from raw identifiers to [`PseudonymId`]s.
#[derive(Clone)]
pub struct IdentityHasher {
    mac: HmacSha256,
}

impl IdentityHasher {
    /// Build a hasher keyed with `salt`. An empty salt is rejected.
    pub fn new(salt: impl AsRef<[u8]>) -> Result<Self> {
        let salt = salt.as_ref();
        if salt.is_empty() {
            return Err(EgressosError::config("pseudonymization salt must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(salt)
            .map_err(|e| EgressosError::config(format!("invalid salt: {e}")))?;
        Ok(Self { mac })
    }

    /// Build a hasher from the salt held in environment variable `var_name`.
    pub fn from_env(var_name: &str) -> Result<Self> {
        match std::env::var(var_name) {
            Ok(val) if !val.trim().is_empty() => Self::new(val.trim()),
            _ => Err(EgressosError::config(format!(
                "pseudonymization salt not found. Set the {var_name} environment variable."
            ))),
        }
    }

    /// Hash an identifier. Same input and salt always give the same output.
    pub fn hash(&self, identifier: &str) -> PseudonymId {
        let mut mac = self.mac.clone();
        mac.update(identifier.as_bytes());
        PseudonymId(hex::encode(mac.finalize().into_bytes()))
    }

    /// Hash of a fixed input string; changes iff the salt changes.
    pub fn fingerprint(&self) -> String {
        self.hash(FINGERPRINT_INPUT).into_string()
    }
}

impl std::fmt::Debug for IdentityHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityHasher")
            .field("key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Join keys
// ---------------------------------------------------------------------------

/// How identifiers are reduced to the portion comparable with the registry.
///
/// The public partner dump masks CPFs as `***NNNNNN**`, so by default only
/// the six middle digits can be matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinKeyMode {
    /// Middle six digits of a CPF (digits 4 to 9).
    #[default]
    MaskedCpf,
    /// The whole digits-only identifier.
    Full,
}

impl JoinKeyMode {
    /// Derive the join key from a digits-only identifier.
    pub fn join_key(self, digits: &str) -> Option<String> {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match self {
            Self::Full => Some(digits.to_string()),
            Self::MaskedCpf if digits.len() >= CPF_LEN => Some(digits[3..9].to_string()),
            Self::MaskedCpf if digits.len() >= MASKED_FRAGMENT_LEN => {
                Some(digits[digits.len() - MASKED_FRAGMENT_LEN..].to_string())
            }
            Self::MaskedCpf => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaskedCpf => "masked-cpf",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for JoinKeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JoinKeyMode {
    type Err = EgressosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "masked-cpf" | "masked_cpf" => Ok(Self::MaskedCpf),
            "full" => Ok(Self::Full),
            other => Err(EgressosError::config(format!(
                "unknown join key mode '{other}' (expected masked-cpf or full)"
            ))),
        }
    }
}

/// Keep only ASCII digits.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Clean a roster identifier.
///
/// In [`JoinKeyMode::MaskedCpf`] the value must be a valid CPF (leading zeros
/// lost by spreadsheet number formatting are restored); anything else is
/// treated as missing. In [`JoinKeyMode::Full`] any non-empty digit string is
/// accepted.
pub fn clean_identifier(raw: &str, mode: JoinKeyMode) -> Option<String> {
    let digits = digits_only(raw);
    if digits.is_empty() {
        return None;
    }
    match mode {
        JoinKeyMode::Full => Some(digits),
        JoinKeyMode::MaskedCpf => {
            if digits.len() > CPF_LEN {
                return None;
            }
            let padded = format!("{digits:0>CPF_LEN$}");
            is_valid_cpf(&padded).then_some(padded)
        }
    }
}

/// Validate the two CPF check digits. Repeated-digit CPFs are rejected.
pub fn is_valid_cpf(digits: &str) -> bool {
    let d: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if d.len() != CPF_LEN || digits.len() != CPF_LEN {
        return false;
    }
    if d.iter().all(|&x| x == d[0]) {
        return false;
    }
    let check = |len: usize| -> u32 {
        let sum: u32 = d[..len]
            .iter()
            .enumerate()
            .map(|(i, &x)| x * (len as u32 + 1 - i as u32))
            .sum();
        let r = (sum * 10) % 11;
        if r == 10 { 0 } else { r }
    };
    check(9) == d[9] && check(10) == d[10]
}
