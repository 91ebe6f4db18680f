//! OID registry.
//!
//! One static table maps every supported object identifier between its four
//! spellings: the [`OidTag`] enum value, the registry name
//! (`SEC_OID_AVA_COMMON_NAME`), the dotted-decimal string (`2.5.4.3`) and,
//! for name attributes, the short display name used in DN strings (`CN`).
//! Name parsing, certificate decoding, digest selection and PKCS#12 bag
//! classification all resolve through here.
//!
//! Tag ordinals follow declaration order and define the ordering of
//! attribute types (common name sorts before organizational unit).

use crate::SecmodError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

struct Entry {
    tag: OidTag,
    registry: &'static str,
    oid: &'static str,
    short: Option<&'static str>,
    description: &'static str,
}

macro_rules! oid_registry {
    ($( $tag:ident => $reg:literal, $oid:literal, $short:expr, $desc:literal; )*) => {
        /// Identifier of an attribute type, algorithm or container element.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u32)]
        pub enum OidTag {
            /// Registry zero value; never a valid attribute type.
            Unknown = 0,
            $( #[doc = $desc] $tag, )*
        }

        const ENTRIES: &[Entry] = &[
            $( Entry { tag: OidTag::$tag, registry: $reg, oid: $oid, short: $short, description: $desc }, )*
        ];
    };
}

oid_registry! {
    // ── Digest algorithms ───────────────────────────────────────────────
    Md5 => "SEC_OID_MD5", "1.2.840.113549.2.5", None, "MD5";
    Sha1 => "SEC_OID_SHA1", "1.3.14.3.2.26", None, "SHA-1";
    Sha256 => "SEC_OID_SHA256", "2.16.840.1.101.3.4.2.1", None, "SHA-256";
    Sha384 => "SEC_OID_SHA384", "2.16.840.1.101.3.4.2.2", None, "SHA-384";
    Sha512 => "SEC_OID_SHA512", "2.16.840.1.101.3.4.2.3", None, "SHA-512";

    // ── Symmetric ciphers ───────────────────────────────────────────────
    DesCbc => "SEC_OID_DES_CBC", "1.3.14.3.2.7", None, "DES-CBC";
    DesEde3Cbc => "SEC_OID_DES_EDE3_CBC", "1.2.840.113549.3.7", None, "DES-EDE3-CBC";
    Aes128Cbc => "SEC_OID_AES_128_CBC", "2.16.840.1.101.3.4.1.2", None, "AES-128-CBC";
    Aes192Cbc => "SEC_OID_AES_192_CBC", "2.16.840.1.101.3.4.1.22", None, "AES-192-CBC";
    Aes256Cbc => "SEC_OID_AES_256_CBC", "2.16.840.1.101.3.4.1.42", None, "AES-256-CBC";

    // ── Public key and signature algorithms ─────────────────────────────
    Pkcs1RsaEncryption => "SEC_OID_PKCS1_RSA_ENCRYPTION", "1.2.840.113549.1.1.1", None, "PKCS #1 RSA Encryption";
    Pkcs1Sha1WithRsaEncryption => "SEC_OID_PKCS1_SHA1_WITH_RSA_ENCRYPTION", "1.2.840.113549.1.1.5", None, "PKCS #1 SHA-1 With RSA Encryption";
    Pkcs1Sha256WithRsaEncryption => "SEC_OID_PKCS1_SHA256_WITH_RSA_ENCRYPTION", "1.2.840.113549.1.1.11", None, "PKCS #1 SHA-256 With RSA Encryption";
    Pkcs1Sha384WithRsaEncryption => "SEC_OID_PKCS1_SHA384_WITH_RSA_ENCRYPTION", "1.2.840.113549.1.1.12", None, "PKCS #1 SHA-384 With RSA Encryption";
    Pkcs1Sha512WithRsaEncryption => "SEC_OID_PKCS1_SHA512_WITH_RSA_ENCRYPTION", "1.2.840.113549.1.1.13", None, "PKCS #1 SHA-512 With RSA Encryption";
    AnsiX962EcPublicKey => "SEC_OID_ANSIX962_EC_PUBLIC_KEY", "1.2.840.10045.2.1", None, "X9.62 elliptic curve public key";
    AnsiX962EcdsaSha256Signature => "SEC_OID_ANSIX962_ECDSA_SHA256_SIGNATURE", "1.2.840.10045.4.3.2", None, "X9.62 ECDSA signature with SHA256";
    AnsiX962EcdsaSha384Signature => "SEC_OID_ANSIX962_ECDSA_SHA384_SIGNATURE", "1.2.840.10045.4.3.3", None, "X9.62 ECDSA signature with SHA384";
    AnsiX962EcdsaSha512Signature => "SEC_OID_ANSIX962_ECDSA_SHA512_SIGNATURE", "1.2.840.10045.4.3.4", None, "X9.62 ECDSA signature with SHA512";
    Ed25519PublicKey => "SEC_OID_ED25519_PUBLIC_KEY", "1.3.101.112", None, "Ed25519";

    // ── PKCS #9 attributes ──────────────────────────────────────────────
    Pkcs9EmailAddress => "SEC_OID_PKCS9_EMAIL_ADDRESS", "1.2.840.113549.1.9.1", Some("E"), "PKCS #9 Email Address";
    Pkcs9FriendlyName => "SEC_OID_PKCS9_FRIENDLY_NAME", "1.2.840.113549.1.9.20", None, "PKCS #9 Friendly Name";
    Pkcs9LocalKeyId => "SEC_OID_PKCS9_LOCAL_KEY_ID", "1.2.840.113549.1.9.21", None, "PKCS #9 Local Key ID";

    // ── X.520 / RFC 1274 name attributes ────────────────────────────────
    AvaCommonName => "SEC_OID_AVA_COMMON_NAME", "2.5.4.3", Some("CN"), "X520 Common Name";
    AvaCountryName => "SEC_OID_AVA_COUNTRY_NAME", "2.5.4.6", Some("C"), "X520 Country Name";
    AvaLocality => "SEC_OID_AVA_LOCALITY", "2.5.4.7", Some("L"), "X520 Locality Name";
    AvaStateOrProvince => "SEC_OID_AVA_STATE_OR_PROVINCE", "2.5.4.8", Some("ST"), "X520 State Or Province Name";
    AvaOrganizationName => "SEC_OID_AVA_ORGANIZATION_NAME", "2.5.4.10", Some("O"), "X520 Organization Name";
    AvaOrganizationalUnitName => "SEC_OID_AVA_ORGANIZATIONAL_UNIT_NAME", "2.5.4.11", Some("OU"), "X520 Organizational Unit Name";
    AvaDnQualifier => "SEC_OID_AVA_DN_QUALIFIER", "2.5.4.46", Some("dnQualifier"), "X520 DN Qualifier";
    AvaDc => "SEC_OID_AVA_DC", "0.9.2342.19200300.100.1.25", Some("DC"), "Domain Component";
    Rfc1274Uid => "SEC_OID_RFC1274_UID", "0.9.2342.19200300.100.1.1", Some("UID"), "RFC 1274 User Id";
    Rfc1274Mail => "SEC_OID_RFC1274_MAIL", "0.9.2342.19200300.100.1.3", Some("MAIL"), "RFC 1274 E-mail Address";
    AvaSurname => "SEC_OID_AVA_SURNAME", "2.5.4.4", Some("SN"), "X520 Surname";
    AvaSerialNumber => "SEC_OID_AVA_SERIAL_NUMBER", "2.5.4.5", Some("serialNumber"), "X520 Serial Number";
    AvaStreetAddress => "SEC_OID_AVA_STREET_ADDRESS", "2.5.4.9", Some("street"), "X520 Street Address";
    AvaTitle => "SEC_OID_AVA_TITLE", "2.5.4.12", Some("title"), "X520 Title";
    AvaPostalAddress => "SEC_OID_AVA_POSTAL_ADDRESS", "2.5.4.16", Some("postalAddress"), "X520 Postal Address";
    AvaPostalCode => "SEC_OID_AVA_POSTAL_CODE", "2.5.4.17", Some("postalCode"), "X520 Postal Code";
    AvaName => "SEC_OID_AVA_NAME", "2.5.4.41", Some("name"), "X520 Name";
    AvaGivenName => "SEC_OID_AVA_GIVEN_NAME", "2.5.4.42", Some("givenName"), "X520 Given Name";
    AvaInitials => "SEC_OID_AVA_INITIALS", "2.5.4.43", Some("initials"), "X520 Initials";
    AvaGenerationQualifier => "SEC_OID_AVA_GENERATION_QUALIFIER", "2.5.4.44", Some("generationQualifier"), "X520 Generation Qualifier";
    AvaHouseIdentifier => "SEC_OID_AVA_HOUSE_IDENTIFIER", "2.5.4.51", Some("houseIdentifier"), "X520 House Identifier";
    AvaPseudonym => "SEC_OID_AVA_PSEUDONYM", "2.5.4.65", Some("pseudonym"), "X520 Pseudonym";

    // ── Certificate extensions and usages ───────────────────────────────
    NsCertExtCertType => "SEC_OID_NS_CERT_EXT_CERT_TYPE", "2.16.840.1.113730.1.1", None, "Certificate Type";
    ExtKeyUsageServerAuth => "SEC_OID_EXT_KEY_USAGE_SERVER_AUTH", "1.3.6.1.5.5.7.3.1", None, "TLS Web Server Authentication Certificate";
    ExtKeyUsageClientAuth => "SEC_OID_EXT_KEY_USAGE_CLIENT_AUTH", "1.3.6.1.5.5.7.3.2", None, "TLS Web Client Authentication Certificate";
    ExtKeyUsageEmailProtect => "SEC_OID_EXT_KEY_USAGE_EMAIL_PROTECT", "1.3.6.1.5.5.7.3.4", None, "E-Mail Protection Certificate";

    // ── PKCS #12 bag types and PBE algorithms ───────────────────────────
    Pkcs12V1KeyBagId => "SEC_OID_PKCS12_V1_KEY_BAG_ID", "1.2.840.113549.1.12.10.1.1", None, "PKCS #12 V1 Key Bag";
    Pkcs12V1Pkcs8ShroudedKeyBagId => "SEC_OID_PKCS12_V1_PKCS8_SHROUDED_KEY_BAG_ID", "1.2.840.113549.1.12.10.1.2", None, "PKCS #12 V1 PKCS8 Shrouded Key Bag";
    Pkcs12V1CertBagId => "SEC_OID_PKCS12_V1_CERT_BAG_ID", "1.2.840.113549.1.12.10.1.3", None, "PKCS #12 V1 Certificate Bag";
    Pkcs12V1CrlBagId => "SEC_OID_PKCS12_V1_CRL_BAG_ID", "1.2.840.113549.1.12.10.1.4", None, "PKCS #12 V1 CRL Bag";
    Pkcs12V1SecretBagId => "SEC_OID_PKCS12_V1_SECRET_BAG_ID", "1.2.840.113549.1.12.10.1.5", None, "PKCS #12 V1 Secret Bag";
    Pkcs12V1SafeContentsBagId => "SEC_OID_PKCS12_V1_SAFE_CONTENTS_BAG_ID", "1.2.840.113549.1.12.10.1.6", None, "PKCS #12 V1 Safe Contents Bag";
    Pkcs12V2PbeWithSha1And128BitRc4 => "SEC_OID_PKCS12_V2_PBE_WITH_SHA1_AND_128_BIT_RC4", "1.2.840.113549.1.12.1.1", None, "PKCS #12 V2 PBE With SHA-1 and 128 Bit RC4";
    Pkcs12V2PbeWithSha1And40BitRc4 => "SEC_OID_PKCS12_V2_PBE_WITH_SHA1_AND_40_BIT_RC4", "1.2.840.113549.1.12.1.2", None, "PKCS #12 V2 PBE With SHA-1 and 40 Bit RC4";
    Pkcs12V2PbeWithSha1And3KeyTripleDesCbc => "SEC_OID_PKCS12_V2_PBE_WITH_SHA1_AND_3KEY_TRIPLE_DES_CBC", "1.2.840.113549.1.12.1.3", None, "PKCS #12 V2 PBE With SHA-1 and 3KEY Triple DES-CBC";
    Pkcs12V2PbeWithSha1And2KeyTripleDesCbc => "SEC_OID_PKCS12_V2_PBE_WITH_SHA1_AND_2KEY_TRIPLE_DES_CBC", "1.2.840.113549.1.12.1.4", None, "PKCS #12 V2 PBE With SHA-1 and 2KEY Triple DES-CBC";
    Pkcs12V2PbeWithSha1And128BitRc2Cbc => "SEC_OID_PKCS12_V2_PBE_WITH_SHA1_AND_128_BIT_RC2_CBC", "1.2.840.113549.1.12.1.5", None, "PKCS #12 V2 PBE With SHA-1 and 128 Bit RC2 CBC";
    Pkcs12V2PbeWithSha1And40BitRc2Cbc => "SEC_OID_PKCS12_V2_PBE_WITH_SHA1_AND_40_BIT_RC2_CBC", "1.2.840.113549.1.12.1.6", None, "PKCS #12 V2 PBE With SHA-1 and 40 Bit RC2 CBC";
    Pkcs5Pbkdf2 => "SEC_OID_PKCS5_PBKDF2", "1.2.840.113549.1.5.12", None, "PKCS #5 Password Based Key Dervive Function v2 ";
    Pkcs5Pbes2 => "SEC_OID_PKCS5_PBES2", "1.2.840.113549.1.5.13", None, "PKCS #5 Password Based Encryption v2 ";
    HmacSha1 => "SEC_OID_HMAC_SHA1", "1.2.840.113549.2.7", None, "HMAC SHA-1";
    HmacSha256 => "SEC_OID_HMAC_SHA256", "1.2.840.113549.2.9", None, "HMAC SHA-256";
}

/// Extra spellings accepted for name attributes, beyond the short name.
const ALIASES: &[(&str, OidTag)] = &[
    ("S", OidTag::AvaStateOrProvince),
    ("emailAddress", OidTag::Pkcs9EmailAddress),
    ("email", OidTag::Pkcs9EmailAddress),
    ("userid", OidTag::Rfc1274Uid),
    ("domainComponent", OidTag::AvaDc),
    ("commonName", OidTag::AvaCommonName),
    ("countryName", OidTag::AvaCountryName),
    ("localityName", OidTag::AvaLocality),
    ("stateOrProvinceName", OidTag::AvaStateOrProvince),
    ("organizationName", OidTag::AvaOrganizationName),
    ("organizationalUnitName", OidTag::AvaOrganizationalUnitName),
];

const REGISTRY_PREFIX: &str = "SEC_OID_";

impl OidTag {
    fn entry(self) -> Option<&'static Entry> {
        ENTRIES.iter().find(|e| e.tag == self)
    }

    /// Look a tag up by its ordinal.
    pub fn from_ordinal(ordinal: u32) -> Option<OidTag> {
        if ordinal == 0 {
            return Some(OidTag::Unknown);
        }
        ENTRIES
            .iter()
            .find(|e| e.tag as u32 == ordinal)
            .map(|e| e.tag)
    }

    /// Numeric ordinal of the tag.
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// Dotted-decimal OID without prefix (`2.5.4.3`).
    pub fn oid(self) -> &'static str {
        self.entry().map(|e| e.oid).unwrap_or("")
    }

    /// Registry name (`SEC_OID_AVA_COMMON_NAME`).
    pub fn registry_name(self) -> &'static str {
        self.entry().map(|e| e.registry).unwrap_or("SEC_OID_UNKNOWN")
    }

    /// Human-readable description (`X520 Common Name`).
    pub fn description(self) -> &'static str {
        self.entry().map(|e| e.description).unwrap_or("Unknown OID")
    }

    /// Short name used when rendering distinguished names (`CN`).
    pub fn short_name(self) -> Option<&'static str> {
        self.entry().and_then(|e| e.short)
    }

    /// Whether the tag names a distinguished-name attribute type.
    pub fn is_name_attribute(self) -> bool {
        self.short_name().is_some()
    }

    /// Iterate over every registered tag (excluding [`OidTag::Unknown`]).
    pub fn all() -> impl Iterator<Item = OidTag> {
        ENTRIES.iter().map(|e| e.tag)
    }
}

impl fmt::Display for OidTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for OidTag {
    type Err = SecmodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve(s)
    }
}

impl Serialize for OidTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.registry_name())
    }
}

impl<'de> Deserialize<'de> for OidTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        resolve(s.as_str()).map_err(serde::de::Error::custom)
    }
}

/// Any of the accepted spellings of an OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidToken<'a> {
    Tag(OidTag),
    Text(&'a str),
}

impl From<OidTag> for OidToken<'_> {
    fn from(tag: OidTag) -> Self {
        OidToken::Tag(tag)
    }
}

impl<'a> From<&'a str> for OidToken<'a> {
    fn from(s: &'a str) -> Self {
        OidToken::Text(s)
    }
}

impl<'a> From<&'a String> for OidToken<'a> {
    fn from(s: &'a String) -> Self {
        OidToken::Text(s.as_str())
    }
}

impl<'a> TryFrom<&'a serde_json::Value> for OidToken<'a> {
    type Error = SecmodError;

    /// Strings are OID text, non-negative integers are tag ordinals; any
    /// other JSON value is not an OID token.
    fn try_from(value: &'a serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::String(s) => Ok(OidToken::Text(s.as_str())),
            serde_json::Value::Number(n) => {
                let ordinal = n
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| SecmodError::InvalidOidToken(n.to_string()))?;
                OidTag::from_ordinal(ordinal)
                    .map(OidToken::Tag)
                    .ok_or_else(|| SecmodError::UnknownOid(format!("tag ordinal {}", ordinal)))
            }
            other => Err(SecmodError::InvalidOidToken(json_kind(other).into())),
        }
    }
}

pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Resolve any OID spelling to its tag.
///
/// Accepts a tag, a short name (`cn`, case-insensitive), a registry name
/// with or without the `SEC_OID_` prefix, or a dotted-decimal string with or
/// without an `OID.` prefix.
pub fn resolve<'a>(token: impl Into<OidToken<'a>>) -> Result<OidTag, SecmodError> {
    match token.into() {
        OidToken::Tag(OidTag::Unknown) => Err(SecmodError::UnknownOid(
            OidTag::Unknown.registry_name().into(),
        )),
        OidToken::Tag(tag) => Ok(tag),
        OidToken::Text(text) => resolve_text(text),
    }
}

fn resolve_text(text: &str) -> Result<OidTag, SecmodError> {
    let s = text.trim();
    let unknown = || SecmodError::UnknownOid(text.to_string());

    if let Some(dotted) = strip_prefix_ignore_case(s, "OID.") {
        return find_by_oid(dotted).ok_or_else(unknown);
    }
    if is_dotted_decimal(s) {
        return find_by_oid(s).ok_or_else(unknown);
    }

    if let Some(entry) = ENTRIES
        .iter()
        .find(|e| e.short.is_some_and(|short| short.eq_ignore_ascii_case(s)))
    {
        return Ok(entry.tag);
    }
    if let Some((_, tag)) = ALIASES.iter().find(|(a, _)| a.eq_ignore_ascii_case(s)) {
        return Ok(*tag);
    }

    let upper = s.to_ascii_uppercase();
    let bare = upper.strip_prefix(REGISTRY_PREFIX).unwrap_or(&upper);
    ENTRIES
        .iter()
        .find(|e| e.registry.strip_prefix(REGISTRY_PREFIX) == Some(bare))
        .map(|e| e.tag)
        .ok_or_else(unknown)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

fn find_by_oid(dotted: &str) -> Option<OidTag> {
    ENTRIES.iter().find(|e| e.oid == dotted).map(|e| e.tag)
}

/// Whether `s` has the shape of a dotted-decimal OID (two or more numeric arcs).
pub fn is_dotted_decimal(s: &str) -> bool {
    let mut arcs = 0;
    for arc in s.split('.') {
        if arc.is_empty() || !arc.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        arcs += 1;
    }
    arcs >= 2
}

/// Dotted-decimal form with the `OID.` prefix (`OID.2.5.4.3`).
pub fn dotted_decimal<'a>(token: impl Into<OidToken<'a>>) -> Result<String, SecmodError> {
    resolve(token).map(|tag| format!("OID.{}", tag.oid()))
}

/// Human-readable description of an OID (`X520 Common Name`).
pub fn display_name<'a>(token: impl Into<OidToken<'a>>) -> Result<&'static str, SecmodError> {
    resolve(token).map(OidTag::description)
}

/// Registry name of an OID (`SEC_OID_AVA_COMMON_NAME`).
pub fn registry_name<'a>(token: impl Into<OidToken<'a>>) -> Result<&'static str, SecmodError> {
    resolve(token).map(OidTag::registry_name)
}
