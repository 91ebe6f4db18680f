//! Distinguished names: AVA, RDN and DN.
//!
//! A [`Dn`] keeps its RDNs in one ordered sequence. Index 0 holds the most
//! general RDN (the one DER encodes first, usually `C=`), and the string form
//! renders the sequence in reverse, so `add_rdn` appends to the end of the
//! index order and the new RDN shows up first in the string.

use crate::oid::{self, json_kind, OidTag, OidToken};
use crate::SecmodError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// Characters that must be escaped inside an attribute value.
const SPECIALS: &[char] = &[',', '+', '"', '\\', '<', '>', ';', '='];

// ─── Ava ────────────────────────────────────────────────────────────────

/// Attribute value assertion: an attribute type paired with a UTF-8 value.
///
/// Ordered by attribute type ordinal, then by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ava {
    tag: OidTag,
    value: String,
}

impl Ava {
    /// Build an AVA from any OID spelling and a value.
    pub fn new<'a>(key: impl Into<OidToken<'a>>, value: impl Into<String>) -> Result<Self, SecmodError> {
        let tag = oid::resolve(key)?;
        Ok(Ava {
            tag,
            value: value.into(),
        })
    }

    pub fn tag(&self) -> OidTag {
        self.tag
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Key used when rendering: the short name, else `OID.<dotted>`.
    pub fn key(&self) -> String {
        match self.tag.short_name() {
            Some(short) => short.to_string(),
            None => format!("OID.{}", self.tag.oid()),
        }
    }

    fn matches(&self, tag: OidTag) -> bool {
        self.tag == tag
    }
}

impl fmt::Display for Ava {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key(), escape_value(&self.value))
    }
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let edge_space = c == ' ' && (i == 0 || i == last);
        if SPECIALS.contains(&c) || edge_space || (i == 0 && c == '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ─── Rdn ────────────────────────────────────────────────────────────────

/// Relative distinguished name: an ordered, possibly empty set of AVAs.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    pub fn new(avas: Vec<Ava>) -> Self {
        Rdn { avas }
    }

    pub fn empty() -> Self {
        Rdn::default()
    }

    pub fn push(&mut self, ava: Ava) {
        self.avas.push(ava);
    }

    pub fn len(&self) -> usize {
        self.avas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ava> {
        self.avas.iter()
    }

    pub fn get_index(&self, index: usize) -> Option<&Ava> {
        self.avas.get(index)
    }

    pub fn as_slice(&self) -> &[Ava] {
        &self.avas
    }

    /// All AVAs whose type matches `key`, in order.
    ///
    /// Fails with `KeyNotFound` when nothing matches, including when `key`
    /// does not name a known attribute type.
    pub fn get<'a>(&self, key: impl Into<OidToken<'a>>) -> Result<Vec<&Ava>, SecmodError> {
        let key = key.into();
        let tag = lookup_tag(key)?;
        let found: Vec<&Ava> = self.avas.iter().filter(|a| a.matches(tag)).collect();
        if found.is_empty() {
            return Err(key_not_found(key));
        }
        Ok(found)
    }

    pub fn contains_key<'a>(&self, key: impl Into<OidToken<'a>>) -> bool {
        self.get(key).is_ok()
    }

    fn contains_tag(&self, tag: OidTag) -> bool {
        self.avas.iter().any(|a| a.matches(tag))
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.avas.iter().map(|a| a.to_string()).collect();
        f.write_str(&parts.join("+"))
    }
}

impl<'a> IntoIterator for &'a Rdn {
    type Item = &'a Ava;
    type IntoIter = std::slice::Iter<'a, Ava>;

    fn into_iter(self) -> Self::IntoIter {
        self.avas.iter()
    }
}

impl From<Ava> for Rdn {
    fn from(ava: Ava) -> Self {
        Rdn { avas: vec![ava] }
    }
}

fn lookup_tag(key: OidToken<'_>) -> Result<OidTag, SecmodError> {
    oid::resolve(key).map_err(|_| key_not_found(key))
}

fn key_not_found(key: OidToken<'_>) -> SecmodError {
    match key {
        OidToken::Tag(tag) => SecmodError::KeyNotFound(tag.registry_name().to_string()),
        OidToken::Text(text) => SecmodError::KeyNotFound(text.to_string()),
    }
}

// ─── Dn ─────────────────────────────────────────────────────────────────

/// Distinguished name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dn {
    rdns: Vec<Rdn>,
    source: SourceDer,
}

/// The encoding a [`Dn`] was decoded from. Not part of the value: two DNs
/// with the same RDNs compare equal wherever they came from.
#[derive(Debug, Clone, Default)]
struct SourceDer(Option<Decoded>);

#[derive(Debug, Clone)]
struct Decoded {
    der: Arc<[u8]>,
    /// Some attributes of `der` have no counterpart in the RDNs.
    dropped: bool,
}

impl PartialEq for SourceDer {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for SourceDer {}

impl PartialOrd for SourceDer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SourceDer {
    fn cmp(&self, _: &Self) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for SourceDer {
    fn hash<H: Hasher>(&self, _: &mut H) {}
}

/// Accepted inputs for building a [`Dn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnSource {
    /// DN string, e.g. `CN=host,O=Example,C=US`.
    Str(String),
    /// RDNs in index order.
    Rdns(Vec<Rdn>),
    Empty,
}

impl From<&str> for DnSource {
    fn from(s: &str) -> Self {
        DnSource::Str(s.to_string())
    }
}

impl From<String> for DnSource {
    fn from(s: String) -> Self {
        DnSource::Str(s)
    }
}

impl From<Vec<Rdn>> for DnSource {
    fn from(rdns: Vec<Rdn>) -> Self {
        DnSource::Rdns(rdns)
    }
}

impl TryFrom<&serde_json::Value> for DnSource {
    type Error = SecmodError;

    /// `null` is empty, a string is parsed, and an array holds DN strings or
    /// RDNs given as `[key, value]` pairs (or arrays of such pairs).
    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(DnSource::Empty),
            Value::String(s) => Ok(DnSource::Str(s.clone())),
            Value::Array(items) => {
                let mut rdns = Vec::new();
                for item in items {
                    match item {
                        Value::String(s) => rdns.extend(Dn::parse(s)?.rdns),
                        Value::Array(inner) => rdns.push(rdn_from_json(inner)?),
                        other => return Err(SecmodError::InvalidDnSource(json_kind(other).into())),
                    }
                }
                Ok(DnSource::Rdns(rdns))
            }
            other => Err(SecmodError::InvalidDnSource(json_kind(other).into())),
        }
    }
}

fn rdn_from_json(items: &[serde_json::Value]) -> Result<Rdn, SecmodError> {
    use serde_json::Value;
    if let [Value::String(_) | Value::Number(_), Value::String(_)] = items {
        return ava_from_json(items).map(Rdn::from);
    }
    let mut rdn = Rdn::empty();
    for item in items {
        match item {
            Value::Array(pair) => rdn.push(ava_from_json(pair)?),
            other => return Err(SecmodError::InvalidDnSource(json_kind(other).into())),
        }
    }
    Ok(rdn)
}

fn ava_from_json(pair: &[serde_json::Value]) -> Result<Ava, SecmodError> {
    match pair {
        [key, serde_json::Value::String(value)] => {
            let token = OidToken::try_from(key)?;
            Ava::new(token, value.as_str())
        }
        _ => Err(SecmodError::InvalidDnSource(format!(
            "array of {} elements where a [key, value] pair was expected",
            pair.len()
        ))),
    }
}

impl Dn {
    pub fn new() -> Self {
        Dn::default()
    }

    /// Build a DN from any accepted source.
    pub fn from_source(source: impl Into<DnSource>) -> Result<Self, SecmodError> {
        match source.into() {
            DnSource::Str(s) => Dn::parse(&s),
            DnSource::Rdns(rdns) => Ok(Dn::from_rdns(rdns)),
            DnSource::Empty => Ok(Dn::default()),
        }
    }

    /// Parse a DN string. The right-most RDN lands at index 0.
    pub fn parse(input: &str) -> Result<Self, SecmodError> {
        let mut rdns = Vec::new();
        for segment in split_rdns(input)? {
            let mut rdn = Rdn::empty();
            for raw in segment {
                rdn.push(parse_ava(&raw)?);
            }
            rdns.push(rdn);
        }
        rdns.reverse();
        Ok(Dn::from_rdns(rdns))
    }

    fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Dn {
            rdns,
            source: SourceDer::default(),
        }
    }

    /// Append an RDN to the index order; it renders first.
    pub fn add_rdn(&mut self, rdn: Rdn) {
        self.rdns.push(rdn);
        self.source = SourceDer::default();
    }

    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rdn> {
        self.rdns.iter()
    }

    pub fn get_index(&self, index: usize) -> Option<&Rdn> {
        self.rdns.get(index)
    }

    pub fn as_slice(&self) -> &[Rdn] {
        &self.rdns
    }

    /// All RDNs containing an AVA of type `key`, in index order.
    pub fn get<'a>(&self, key: impl Into<OidToken<'a>>) -> Result<Vec<&Rdn>, SecmodError> {
        let key = key.into();
        let tag = lookup_tag(key)?;
        let found: Vec<&Rdn> = self.rdns.iter().filter(|r| r.contains_tag(tag)).collect();
        if found.is_empty() {
            return Err(key_not_found(key));
        }
        Ok(found)
    }

    pub fn contains_key<'a>(&self, key: impl Into<OidToken<'a>>) -> bool {
        self.get(key).is_ok()
    }

    fn first_value(&self, tag: OidTag) -> Option<&str> {
        self.rdns
            .iter()
            .flat_map(|r| r.iter())
            .find(|a| a.matches(tag))
            .map(|a| a.value())
    }

    pub fn common_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaCommonName)
    }

    pub fn country_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaCountryName)
    }

    pub fn locality_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaLocality)
    }

    pub fn state_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaStateOrProvince)
    }

    pub fn org_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaOrganizationName)
    }

    pub fn org_unit_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaOrganizationalUnitName)
    }

    /// PKCS #9 email address, falling back to the RFC 1274 mail attribute.
    pub fn email_address(&self) -> Option<&str> {
        self.first_value(OidTag::Pkcs9EmailAddress)
            .or_else(|| self.first_value(OidTag::Rfc1274Mail))
    }

    pub fn dc_name(&self) -> Option<&str> {
        self.first_value(OidTag::AvaDc)
    }

    pub fn cert_uid(&self) -> Option<&str> {
        self.first_value(OidTag::Rfc1274Uid)
    }

    /// Build from a decoded X.509 name. Attributes whose type is not in the
    /// registry, or whose value is not a string, are skipped.
    pub(crate) fn from_x509(name: &x509_parser::x509::X509Name<'_>) -> Self {
        let mut rdns = Vec::new();
        let mut dropped = false;
        for x509_rdn in name.iter() {
            let mut rdn = Rdn::empty();
            for attr in x509_rdn.iter() {
                let dotted = attr.attr_type().to_id_string();
                let tag = match oid::resolve(dotted.as_str()) {
                    Ok(tag) => tag,
                    Err(_) => {
                        tracing::warn!(oid = %dotted, "skipping unregistered name attribute");
                        dropped = true;
                        continue;
                    }
                };
                match attr.as_str() {
                    Ok(value) => rdn.push(Ava {
                        tag,
                        value: value.to_string(),
                    }),
                    Err(_) => {
                        tracing::warn!(oid = %dotted, "skipping non-string name attribute");
                        dropped = true;
                    }
                }
            }
            if !rdn.is_empty() {
                rdns.push(rdn);
            }
        }
        Dn {
            rdns,
            source: SourceDer(Some(Decoded {
                der: Arc::from(name.as_raw()),
                dropped,
            })),
        }
    }

    /// DER this name was decoded from, if it has not been edited since.
    pub(crate) fn der(&self) -> Option<&[u8]> {
        self.source.0.as_ref().map(|d| &*d.der)
    }

    /// Whether decoding skipped attributes, so the RDNs are not the whole name.
    pub(crate) fn dropped_attributes(&self) -> bool {
        self.source.0.as_ref().is_some_and(|d| d.dropped)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.rdns.iter().rev().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for Dn {
    type Err = SecmodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

impl<'a> IntoIterator for &'a Dn {
    type Item = &'a Rdn;
    type IntoIter = std::slice::Iter<'a, Rdn>;

    fn into_iter(self) -> Self::IntoIter {
        self.rdns.iter()
    }
}

impl Serialize for Dn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Dn::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ─── String codec ───────────────────────────────────────────────────────

/// Split a DN string into RDN segments, each a list of raw AVA strings.
/// Escapes and quotes are preserved for `parse_ava`.
fn split_rdns(input: &str) -> Result<Vec<Vec<String>>, SecmodError> {
    let mut segments = Vec::new();
    if input.trim().is_empty() {
        return Ok(segments);
    }

    let mut current_rdn: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let next = chars.next().ok_or_else(|| {
                    SecmodError::InvalidDn(format!("dangling escape in {:?}", input))
                })?;
                current.push('\\');
                current.push(next);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '+' if !in_quotes => {
                current_rdn.push(std::mem::take(&mut current));
            }
            ',' | ';' if !in_quotes => {
                current_rdn.push(std::mem::take(&mut current));
                segments.push(std::mem::take(&mut current_rdn));
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(SecmodError::InvalidDn(format!(
            "unterminated quote in {:?}",
            input
        )));
    }
    current_rdn.push(current);
    segments.push(current_rdn);
    Ok(segments)
}

fn parse_ava(raw: &str) -> Result<Ava, SecmodError> {
    let eq = find_unescaped(raw, '=')
        .ok_or_else(|| SecmodError::InvalidDn(format!("missing '=' in {:?}", raw.trim())))?;
    let (key, rest) = raw.split_at(eq);
    let key = key.trim();
    if key.is_empty() {
        return Err(SecmodError::InvalidDn(format!(
            "missing attribute type in {:?}",
            raw.trim()
        )));
    }
    let tag = oid::resolve(key)
        .map_err(|_| SecmodError::InvalidDn(format!("unknown attribute type {:?}", key)))?;
    let value = unescape_value(rest.get(1..).unwrap_or(""))?;
    Ok(Ava { tag, value })
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            _ if c == target && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Decode an attribute value: backslash escapes (`\,` and hex pairs `\2C`),
/// double-quoted strings, and trimming of unescaped surrounding spaces.
fn unescape_value(raw: &str) -> Result<String, SecmodError> {
    let trimmed = raw.trim_start();
    let mut bytes: Vec<u8> = Vec::with_capacity(trimmed.len());
    let mut chars = trimmed.chars().peekable();
    let mut in_quotes = false;
    // Length of `bytes` that must survive trailing-space trimming.
    let mut keep = 0;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let next = chars
                    .next()
                    .ok_or_else(|| SecmodError::InvalidDn(format!("dangling escape in {:?}", raw)))?;
                let hex_pair = chars
                    .peek()
                    .filter(|low| next.is_ascii_hexdigit() && low.is_ascii_hexdigit())
                    .copied();
                match hex_pair {
                    Some(low) => {
                        chars.next();
                        let byte = hex::decode(format!("{}{}", next, low))
                            .ok()
                            .and_then(|v| v.first().copied())
                            .ok_or_else(|| {
                                SecmodError::InvalidDn(format!("bad hex escape in {:?}", raw))
                            })?;
                        bytes.push(byte);
                    }
                    None => push_char(&mut bytes, next),
                }
                keep = bytes.len();
            }
            '"' => {
                in_quotes = !in_quotes;
                keep = bytes.len();
            }
            _ => {
                push_char(&mut bytes, c);
                if in_quotes || c != ' ' {
                    keep = bytes.len();
                }
            }
        }
    }
    bytes.truncate(keep);
    String::from_utf8(bytes)
        .map_err(|_| SecmodError::InvalidDn(format!("value is not UTF-8 in {:?}", raw)))
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]
    use super::*;

    #[test]
    fn escaped_specials_round_trip() {
        let ava = Ava::new("cn", "Smith, John + Co").unwrap();
        assert_eq!(ava.to_string(), "CN=Smith\\, John \\+ Co");
        let dn = Dn::parse(&ava.to_string()).unwrap();
        assert_eq!(dn.common_name(), Some("Smith, John + Co"));
    }

    #[test]
    fn quoted_and_hex_values() {
        let dn = Dn::parse("CN=\"a,b\",O=x\\2Cy").unwrap();
        assert_eq!(dn.common_name(), Some("a,b"));
        assert_eq!(dn.org_name(), Some("x,y"));
    }

    #[test]
    fn surrounding_spaces_trimmed() {
        let dn = Dn::parse("CN = host , O= Example Inc ").unwrap();
        assert_eq!(dn.common_name(), Some("host"));
        assert_eq!(dn.org_name(), Some("Example Inc"));
        let edge = Ava::new("cn", " padded ").unwrap();
        assert_eq!(Dn::parse(&edge.to_string()).unwrap().common_name(), Some(" padded "));
    }

    #[test]
    fn malformed_strings() {
        assert!(matches!(Dn::parse("CN"), Err(SecmodError::InvalidDn(_))));
        assert!(matches!(Dn::parse("=x"), Err(SecmodError::InvalidDn(_))));
        assert!(matches!(Dn::parse("CN=\"open"), Err(SecmodError::InvalidDn(_))));
        assert!(matches!(Dn::parse("CN=x\\"), Err(SecmodError::InvalidDn(_))));
        assert!(matches!(Dn::parse("CN=x,"), Err(SecmodError::InvalidDn(_))));
        assert!(matches!(Dn::parse("BOGUS=x"), Err(SecmodError::InvalidDn(_))));
    }
}
