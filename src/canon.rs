// 🔤 Canon Key - stable comparison form of a noisy street / place name
//
// "Av. Constitución", "AVDA CONSTITUCION", "avenida constitucion " → "CONSTITUCION"
//
// Steps: accent strip (NFKD + drop non-ASCII), whitespace collapse, uppercase,
// then strip known street-type prefixes until none is left.

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Street-type prefixes removed from the front of a value.
/// Longer spellings come before their abbreviations.
const STREET_PREFIXES: &[&str] = &[
    "CALLE",
    "CL",
    "C/",
    "AVENIDA",
    r"AVDA\.?",
    r"AV\.?",
    "AV/",
    "CAMINO",
    r"CMNO\.?",
    "PASEO",
    r"PS\.?",
    "PLAZA",
    r"PZA\.?",
    "CARRETERA",
    r"CTRA\.?",
    "TRAVESIA",
    r"TRAV\.?",
    "RUA",
    "LUGAR",
];

fn prefix_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| {
        let alternation = STREET_PREFIXES.join("|");
        Regex::new(&format!(r"^(?:{alternation})\s+")).expect("static prefix pattern")
    })
}

/// Canon key of a raw value. Total (any input, "" → "") and idempotent.
///
/// ```
/// use parcel_reconcile::canon::canon;
///
/// assert_eq!(canon("Av. Constitución"), "CONSTITUCION");
/// assert_eq!(canon("CL Mayor   "), "MAYOR");
/// ```
pub fn canon(raw: &str) -> String {
    let ascii: String = raw.nfkd().filter(|c| c.is_ascii()).collect();

    let mut key = ascii
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();

    // Strip to a fixed point so canon(canon(x)) == canon(x)
    // even for stacked prefixes like "CALLE C/ MAYOR".
    let rx = prefix_regex();
    while let Some(m) = rx.find(&key) {
        key = key[m.end()..].to_string();
    }

    key
}

/// First `len` characters of a canon key (blocking prefix)
pub fn canon_prefix(key: &str, len: usize) -> String {
    key.chars().take(len).collect()
}

// ============================================================================
// TESTS
// ============================================================================
