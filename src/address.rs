// 🏠 Address Parser Framework
// Splits a free-text address into street / number / unit / staircase / floor / door.
//
// Two interchangeable parsers satisfy the same contract. The parser is chosen
// once per run from the config (see `get_parser`), never per call, so every
// row of a run is parsed the same way.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

// ============================================================================
// CORE TYPES
// ============================================================================

/// ParsedAddress - output of parser.parse(); every field optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAddress {
    pub street: Option<String>,
    pub number: Option<String>,
    pub unit: Option<String>,
    pub staircase: Option<String>,
    pub floor: Option<String>,
    pub door: Option<String>,
}

impl ParsedAddress {
    /// Field names in output order (used for `<prefix>_<field>` columns)
    pub const FIELDS: [&'static str; 6] = ["street", "number", "unit", "staircase", "floor", "door"];

    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "street" => self.street.as_deref(),
            "number" => self.number.as_deref(),
            "unit" => self.unit.as_deref(),
            "staircase" => self.staircase.as_deref(),
            "floor" => self.floor.as_deref(),
            "door" => self.door.as_deref(),
            _ => None,
        }
    }

    /// Single comparable string: uppercase, space-joined, with fixed
    /// token prefixes per sub-field ("ESC", "PL", "PT").
    pub fn normalized(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let up = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_uppercase);

        if let Some(v) = up(&self.street) {
            parts.push(v.split_whitespace().collect::<Vec<_>>().join(" "));
        }
        if let Some(v) = up(&self.number) {
            parts.push(v);
        }
        if let Some(v) = up(&self.unit) {
            parts.push(v);
        }
        if let Some(v) = up(&self.staircase) {
            parts.push(format!("ESC {v}"));
        }
        if let Some(v) = up(&self.floor) {
            parts.push(format!("PL {v}"));
        }
        if let Some(v) = up(&self.door) {
            parts.push(format!("PT {v}"));
        }

        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// Anchored regular expression (default)
    #[default]
    Regex,
    /// Keyword scanner over whitespace tokens
    Token,
}

/// AddressParser - the only contract builders depend on
pub trait AddressParser: Send + Sync {
    fn parse(&self, text: &str) -> ParsedAddress;

    fn kind(&self) -> ParserKind;
}

/// Factory: one parser per run
pub fn get_parser(kind: ParserKind) -> Box<dyn AddressParser> {
    match kind {
        ParserKind::Regex => Box::new(RegexAddressParser::new()),
        ParserKind::Token => Box::new(TokenAddressParser::new()),
    }
}

/// Join the non-empty source fields into one address line
pub fn build_full_address(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when at least two sources hold a normalized address and they do not
/// all agree. Each item is the set of addresses one source gives for a key.
pub fn has_conflict<'a, S>(sources: impl IntoIterator<Item = S>) -> bool
where
    S: IntoIterator<Item = &'a str>,
{
    let mut populated = 0;
    let mut distinct: BTreeSet<&str> = BTreeSet::new();
    for source in sources {
        let mut any = false;
        for address in source.into_iter().filter(|a| !a.is_empty()) {
            any = true;
            distinct.insert(address);
        }
        if any {
            populated += 1;
        }
    }
    populated >= 2 && distinct.len() > 1
}

fn clean(v: &str) -> Option<String> {
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

// ============================================================================
// REGEX PARSER
// ============================================================================

pub struct RegexAddressParser;

impl RegexAddressParser {
    pub fn new() -> Self {
        RegexAddressParser
    }

    fn regex() -> &'static Regex {
        static RX: OnceLock<Regex> = OnceLock::new();
        RX.get_or_init(|| {
            Regex::new(
                r"(?i)^(?P<street>[^0-9]+)?\s*(?P<number>\d+)?\s*(?:(?P<unit>[A-Z])\b)?(?:\s*ESC(?:ALERA)?\.?\s*(?P<staircase>\w+))?(?:\s*PL(?:ANTA)?\.?\s*(?P<floor>\w+))?(?:\s*P(?:UERTA|TA|T)?\.?\s*(?P<door>\w+))?",
            )
            .expect("static address pattern")
        })
    }
}

impl Default for RegexAddressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressParser for RegexAddressParser {
    fn parse(&self, text: &str) -> ParsedAddress {
        let text = text.trim();
        let mut parsed = ParsedAddress::default();

        if let Some(caps) = Self::regex().captures(text) {
            let get = |name: &str| caps.name(name).and_then(|m| clean(m.as_str()));
            parsed.street = get("street");
            parsed.number = get("number");
            parsed.unit = get("unit");
            parsed.staircase = get("staircase");
            parsed.floor = get("floor");
            parsed.door = get("door");
        }

        if parsed.street.is_none() && parsed.number.is_none() {
            parsed.street = clean(text);
        }

        parsed
    }

    fn kind(&self) -> ParserKind {
        ParserKind::Regex
    }
}

// ============================================================================
// TOKEN PARSER
// ============================================================================

/// Scans whitespace tokens: words before the first number form the street,
/// keywords (ESC/PL/PT and their long forms) claim the next token.
pub struct TokenAddressParser;

impl TokenAddressParser {
    pub fn new() -> Self {
        TokenAddressParser
    }

    fn keyword(token: &str) -> Option<&'static str> {
        match token.trim_end_matches('.').to_uppercase().as_str() {
            "ESC" | "ESCALERA" => Some("staircase"),
            "PL" | "PLANTA" | "PISO" => Some("floor"),
            "P" | "PT" | "PTA" | "PUERTA" => Some("door"),
            _ => None,
        }
    }
}

impl Default for TokenAddressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressParser for TokenAddressParser {
    fn parse(&self, text: &str) -> ParsedAddress {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut parsed = ParsedAddress::default();
        let mut street: Vec<&str> = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let tok = tokens[i];

            if let Some(field) = Self::keyword(tok) {
                if parsed.number.is_some() || !street.is_empty() {
                    if let Some(value) = tokens.get(i + 1) {
                        let slot = match field {
                            "staircase" => &mut parsed.staircase,
                            "floor" => &mut parsed.floor,
                            _ => &mut parsed.door,
                        };
                        if slot.is_none() {
                            *slot = clean(value);
                            i += 2;
                            continue;
                        }
                    }
                }
            }

            if parsed.number.is_none() {
                let digits: String = tok.chars().take_while(|c| c.is_ascii_digit()).collect();
                if !digits.is_empty() {
                    let rest = &tok[digits.len()..];
                    parsed.number = Some(digits);
                    if rest.len() == 1 && rest.chars().all(|c| c.is_ascii_alphabetic()) {
                        parsed.unit = Some(rest.to_string());
                    }
                    i += 1;
                    continue;
                }
                street.push(tok);
            } else if parsed.unit.is_none()
                && parsed.staircase.is_none()
                && tok.len() == 1
                && tok.chars().all(|c| c.is_ascii_alphabetic())
            {
                parsed.unit = Some(tok.to_string());
            }
            i += 1;
        }

        parsed.street = clean(&street.join(" "));
        parsed
    }

    fn kind(&self) -> ParserKind {
        ParserKind::Token
    }
}

// ============================================================================
// TESTS
// ============================================================================
