//! Shared encoding and matching utilities.

use crate::errcode::SEC_ERROR_INVALID_ARGS;
use crate::SecmodError;
use base64::Engine;
use std::net::IpAddr;

/// Decode hex text into bytes.
///
/// Accepts an optional `0x` prefix and any mix of `:`, whitespace or no
/// separator between octets (`"e8:a7:7c"`, `"e8a77c"`, `"0xE8A77C"`).
pub fn read_hex(input: &str) -> Result<Vec<u8>, SecmodError> {
    let trimmed = input.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = body
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();
    hex::decode(&digits)
        .map_err(|e| SecmodError::native_detail(SEC_ERROR_INVALID_ARGS, format!("{}: {:?}", e, input)))
}

/// Format bytes as lowercase hex octets joined by `separator`.
pub fn data_to_hex(data: &[u8], separator: &str) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Format bytes as colon-separated uppercase hex (e.g., "AB:CD:EF").
pub(crate) fn hex_colon_upper(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Encode bytes as base64 with PEM-style 64-character line wrapping.
pub(crate) fn base64_wrap(data: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(64)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub(crate) fn base64_decode(text: &str) -> Result<Vec<u8>, SecmodError> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| SecmodError::DerError(format!("invalid base64: {}", e)))
}

/// Whether the input looks like PEM (starts with `-----BEGIN` after whitespace).
pub(crate) fn is_pem(input: &[u8]) -> bool {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    input
        .get(start..)
        .is_some_and(|rest| rest.starts_with(b"-----BEGIN"))
}

/// Wrap DER bytes in a PEM block with the given label.
pub(crate) fn der_to_pem(der: &[u8], label: &str) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        base64_wrap(der)
    )
}

/// Decode every PEM block in `input`, returning `(label, contents)` pairs.
pub(crate) fn pem_blocks(input: &[u8]) -> Result<Vec<(String, Vec<u8>)>, SecmodError> {
    let mut blocks = Vec::new();
    for pem in x509_parser::pem::Pem::iter_from_buffer(input) {
        let pem = pem.map_err(|e| SecmodError::PemError(format!("{}", e)))?;
        blocks.push((pem.label, pem.contents));
    }
    if blocks.is_empty() {
        return Err(SecmodError::PemError("no PEM blocks found".into()));
    }
    Ok(blocks)
}

/// Match `hostname` against certificate names.
///
/// SAN DNS names are authoritative; the common name is consulted only when
/// the certificate carries no SAN DNS names. IP literals match only the SAN
/// IP addresses.
pub(crate) fn verify_hostname_match(
    dns_names: &[String],
    san_ips: &[IpAddr],
    cn: Option<&str>,
    hostname: &str,
) -> bool {
    let host = hostname.trim_end_matches('.');
    if host.is_empty() {
        return false;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return san_ips.contains(&ip);
    }

    if !dns_names.is_empty() {
        return dns_names.iter().any(|pattern| dns_name_matches(pattern, host));
    }
    cn.is_some_and(|cn| dns_name_matches(cn, host))
}

/// RFC 6125 matching: case-insensitive, with a wildcard allowed only as the
/// whole left-most label and never directly under a public-looking suffix
/// (at least two labels must follow it).
fn dns_name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if suffix.split('.').count() < 2 || suffix.contains('*') {
            return false;
        }
        return match host.split_once('.') {
            Some((first, rest)) => !first.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        };
    }
    !pattern.contains('*') && pattern.eq_ignore_ascii_case(host)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn hex_round_trip() {
        let text = "e8:a7:7c:e2:05:63:6a:31";
        let bytes = read_hex(text).unwrap();
        assert_eq!(bytes, vec![0xe8, 0xa7, 0x7c, 0xe2, 0x05, 0x63, 0x6a, 0x31]);
        assert_eq!(data_to_hex(&bytes, ":"), text);
        assert_eq!(read_hex("0xE8A7").unwrap(), vec![0xe8, 0xa7]);
        assert!(read_hex("zz").is_err());
    }

    #[test]
    fn wildcard_matching() {
        let names = vec!["*.example.com".to_string()];
        assert!(verify_hostname_match(&names, &[], None, "www.example.com"));
        assert!(verify_hostname_match(&names, &[], None, "WWW.Example.COM."));
        assert!(!verify_hostname_match(&names, &[], None, "a.b.example.com"));
        assert!(!verify_hostname_match(&names, &[], None, "example.com"));
        let too_broad = vec!["*.com".to_string()];
        assert!(!verify_hostname_match(&too_broad, &[], None, "example.com"));
    }

    #[test]
    fn cn_fallback_only_without_san() {
        assert!(verify_hostname_match(&[], &[], Some("host.test"), "host.test"));
        let names = vec!["other.test".to_string()];
        assert!(!verify_hostname_match(&names, &[], Some("host.test"), "host.test"));
    }

    #[test]
    fn ip_literals_use_san_ips() {
        let ips: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap()];
        assert!(verify_hostname_match(&[], &ips, Some("127.0.0.1"), "127.0.0.1"));
        assert!(!verify_hostname_match(&[], &[], Some("127.0.0.1"), "127.0.0.1"));
    }

    #[test]
    fn pem_detection() {
        let pem = der_to_pem(&[1, 2, 3], "CERTIFICATE");
        assert!(is_pem(pem.as_bytes()));
        assert!(!is_pem(&[0x30, 0x82]));
        let blocks = pem_blocks(pem.as_bytes()).unwrap();
        assert_eq!(blocks, vec![("CERTIFICATE".to_string(), vec![1, 2, 3])]);
    }
}
