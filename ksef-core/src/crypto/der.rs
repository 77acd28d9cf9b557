//! Minimal ASN.1 DER construction.
//!
//! Only the handful of primitives needed for the XAdES `IssuerSerialV2` value and for
//! converting ECDSA signatures are provided. Every function produces definite-length DER;
//! a wrong tag byte here is not caught by the platform until signature verification.
use pkcs8::der::Tagged;
use x509_cert::name::Name;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DerError {
    #[error("invalid object identifier '{0}'")]
    InvalidOid(String),
    #[error("value '{0}' is not a valid PrintableString")]
    NotPrintable(String),
    #[error("truncated DER input")]
    Truncated,
    #[error("unexpected tag 0x{found:02x}, expected 0x{expected:02x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("integer of {len} bytes does not fit in {max} bytes")]
    IntegerTooLarge { len: usize, max: usize },
    #[error("trailing bytes after DER value")]
    TrailingData,
}

/// Definite-length encoding: short form below 128, long form otherwise.
pub fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .into_iter()
        .skip_while(|b| *b == 0)
        .collect();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(0x80 | bytes.len() as u8);
    out.extend(bytes);
    out
}

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(encode_length(content.len()));
    out.extend_from_slice(content);
    out
}

pub fn sequence(items: &[Vec<u8>]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &items.concat())
}

/// SET OF: DER requires the encoded elements in ascending byte order.
pub fn set_of(items: &[Vec<u8>]) -> Vec<u8> {
    let mut sorted = items.to_vec();
    sorted.sort();
    tlv(TAG_SET, &sorted.concat())
}

/// Constructed, context-specific explicit tag `[n]`.
pub fn explicit(tag_number: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xa0 | (tag_number & 0x1f), content)
}

/// INTEGER from unsigned big-endian magnitude bytes.
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
    let trimmed: Vec<u8> = magnitude.iter().copied().skip_while(|b| *b == 0).collect();
    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().map_or(true, |b| b & 0x80 != 0) {
        content.push(0);
    }
    content.extend(trimmed);
    tlv(TAG_INTEGER, &content)
}

pub fn object_identifier(dotted: &str) -> Result<Vec<u8>, DerError> {
    let invalid = || DerError::InvalidOid(dotted.to_string());
    let arcs = dotted
        .split('.')
        .map(|arc| arc.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        return Err(invalid());
    }

    let mut content = Vec::new();
    push_base128(&mut content, arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        push_base128(&mut content, *arc);
    }
    Ok(tlv(TAG_OID, &content))
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut chunk = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        chunk.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    chunk.reverse();
    out.extend(chunk);
}

pub fn utf8_string(value: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, value.as_bytes())
}

pub fn printable_string(value: &str) -> Result<Vec<u8>, DerError> {
    let printable = value.chars().all(|c| {
        c.is_ascii_alphanumeric() || " '()+,-./:=?".contains(c)
    });
    if !printable {
        return Err(DerError::NotPrintable(value.to_string()));
    }
    Ok(tlv(TAG_PRINTABLE_STRING, value.as_bytes()))
}

/// Split one TLV off the front of `input`, returning `(tag, content, rest)`.
pub fn read_tlv(input: &[u8]) -> Result<(u8, &[u8], &[u8]), DerError> {
    let (&tag, rest) = input.split_first().ok_or(DerError::Truncated)?;
    let (&first, rest) = rest.split_first().ok_or(DerError::Truncated)?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > std::mem::size_of::<usize>() || rest.len() < count {
            return Err(DerError::Truncated);
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[count..])
    };
    if rest.len() < len {
        return Err(DerError::Truncated);
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn expect_tlv(input: &[u8], expected: u8) -> Result<(&[u8], &[u8]), DerError> {
    let (tag, content, rest) = read_tlv(input)?;
    if tag != expected {
        return Err(DerError::UnexpectedTag {
            expected,
            found: tag,
        });
    }
    Ok((content, rest))
}

/// Convert a DER `ECDSA-Sig-Value` into the fixed-width `r || s` form XML-DSig expects.
///
/// Each component is stripped of sign padding and left-padded with zeros to
/// `component_size` bytes (32, 48 or 66 for P-256, P-384, P-521).
pub fn ecdsa_der_to_raw(der: &[u8], component_size: usize) -> Result<Vec<u8>, DerError> {
    let (body, rest) = expect_tlv(der, TAG_SEQUENCE)?;
    if !rest.is_empty() {
        return Err(DerError::TrailingData);
    }
    let (r, body) = expect_tlv(body, TAG_INTEGER)?;
    let (s, body) = expect_tlv(body, TAG_INTEGER)?;
    if !body.is_empty() {
        return Err(DerError::TrailingData);
    }

    let mut raw = Vec::with_capacity(component_size * 2);
    for component in [r, s] {
        let trimmed: &[u8] = {
            let start = component
                .iter()
                .position(|b| *b != 0)
                .unwrap_or(component.len());
            &component[start..]
        };
        if trimmed.len() > component_size {
            return Err(DerError::IntegerTooLarge {
                len: trimmed.len(),
                max: component_size,
            });
        }
        raw.extend(std::iter::repeat(0u8).take(component_size - trimmed.len()));
        raw.extend_from_slice(trimmed);
    }
    Ok(raw)
}

/// Attribute types that may appear in a certificate issuer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    CommonName,
    OrganizationalUnit,
    Organization,
    Locality,
    State,
    Country,
    SerialNumber,
    OrganizationIdentifier,
    GivenName,
    Surname,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 10] = [
        AttributeKind::CommonName,
        AttributeKind::OrganizationalUnit,
        AttributeKind::Organization,
        AttributeKind::Locality,
        AttributeKind::State,
        AttributeKind::Country,
        AttributeKind::SerialNumber,
        AttributeKind::OrganizationIdentifier,
        AttributeKind::GivenName,
        AttributeKind::Surname,
    ];

    pub fn oid(&self) -> &'static str {
        match self {
            AttributeKind::CommonName => "2.5.4.3",
            AttributeKind::Surname => "2.5.4.4",
            AttributeKind::SerialNumber => "2.5.4.5",
            AttributeKind::Country => "2.5.4.6",
            AttributeKind::Locality => "2.5.4.7",
            AttributeKind::State => "2.5.4.8",
            AttributeKind::Organization => "2.5.4.10",
            AttributeKind::OrganizationalUnit => "2.5.4.11",
            AttributeKind::GivenName => "2.5.4.42",
            AttributeKind::OrganizationIdentifier => "2.5.4.97",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            AttributeKind::CommonName => "CN",
            AttributeKind::OrganizationalUnit => "OU",
            AttributeKind::Organization => "O",
            AttributeKind::Locality => "L",
            AttributeKind::State => "ST",
            AttributeKind::Country => "C",
            AttributeKind::SerialNumber => "serialNumber",
            AttributeKind::OrganizationIdentifier => "organizationIdentifier",
            AttributeKind::GivenName => "GN",
            AttributeKind::Surname => "SN",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.short_name().eq_ignore_ascii_case(name))
    }

    pub fn from_oid(oid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.oid() == oid)
    }

    /// X.520 mandates PrintableString for country codes and serial numbers.
    fn default_string_tag(&self) -> u8 {
        match self {
            AttributeKind::Country | AttributeKind::SerialNumber => TAG_PRINTABLE_STRING,
            _ => TAG_UTF8_STRING,
        }
    }
}

/// One `AttributeTypeAndValue` of a relative distinguished name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdnAttribute {
    oid: String,
    value_tag: u8,
    value: Vec<u8>,
}

impl RdnAttribute {
    pub fn new(kind: AttributeKind, value: &str) -> Self {
        Self {
            oid: kind.oid().to_string(),
            value_tag: kind.default_string_tag(),
            value: value.as_bytes().to_vec(),
        }
    }

    pub fn kind(&self) -> Option<AttributeKind> {
        AttributeKind::from_oid(&self.oid)
    }

    fn encode(&self) -> Result<Vec<u8>, DerError> {
        let value = match self.value_tag {
            TAG_PRINTABLE_STRING => {
                printable_string(&String::from_utf8_lossy(&self.value))?
            }
            tag => tlv(tag, &self.value),
        };
        Ok(sequence(&[object_identifier(&self.oid)?, value]))
    }
}

/// An X.500 name as an ordered list of single-valued RDNs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    rdns: Vec<Vec<RdnAttribute>>,
}

impl DistinguishedName {
    /// Build from `(short name, value)` pairs kept in the given order.
    pub fn from_components<'a>(
        components: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, DerError> {
        let rdns = components
            .into_iter()
            .map(|(name, value)| {
                AttributeKind::from_short_name(name)
                    .map(|kind| vec![RdnAttribute::new(kind, value)])
                    .ok_or_else(|| DerError::InvalidOid(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rdns })
    }

    /// Rebuild a certificate name keeping RDN order and the original string types.
    pub fn from_name(name: &Name) -> Self {
        let rdns = name
            .0
            .iter()
            .map(|rdn| {
                rdn.0
                    .iter()
                    .map(|atv| RdnAttribute {
                        oid: atv.oid.to_string(),
                        value_tag: atv.value.tag().octet(),
                        value: atv.value.value().to_vec(),
                    })
                    .collect()
            })
            .collect();
        Self { rdns }
    }

    pub fn attributes(&self) -> impl Iterator<Item = &RdnAttribute> {
        self.rdns.iter().flatten()
    }

    pub fn encode(&self) -> Result<Vec<u8>, DerError> {
        let rdns = self
            .rdns
            .iter()
            .map(|rdn| {
                let attrs = rdn
                    .iter()
                    .map(RdnAttribute::encode)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(set_of(&attrs))
            })
            .collect::<Result<Vec<_>, DerError>>()?;
        Ok(sequence(&rdns))
    }
}

/// `IssuerSerial ::= SEQUENCE { issuer GeneralNames, serialNumber CertificateSerialNumber }`
/// with the issuer as a single `directoryName [4]` general name.
pub fn issuer_serial_v2(issuer: &DistinguishedName, serial: &[u8]) -> Result<Vec<u8>, DerError> {
    let general_names = sequence(&[explicit(4, &issuer.encode()?)]);
    Ok(sequence(&[general_names, integer(serial)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use x509_cert::der::Encode;

    #[test]
    fn length_uses_short_and_long_forms() {
        assert_eq!(encode_length(0), [0x00]);
        assert_eq!(encode_length(5), [0x05]);
        assert_eq!(encode_length(127), [0x7f]);
        assert_eq!(encode_length(128), [0x81, 0x80]);
        assert_eq!(encode_length(255), [0x81, 0xff]);
        assert_eq!(encode_length(256), [0x82, 0x01, 0x00]);
        assert_eq!(encode_length(70_000), [0x83, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn integer_is_minimal_and_non_negative() {
        assert_eq!(integer(&[]), [0x02, 0x01, 0x00]);
        assert_eq!(integer(&[0x00]), [0x02, 0x01, 0x00]);
        assert_eq!(integer(&[0x7f]), [0x02, 0x01, 0x7f]);
        assert_eq!(integer(&[0x80]), [0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(&[0x00, 0x00, 0x01]), [0x02, 0x01, 0x01]);
        assert_eq!(integer(&[0x01, 0x00]), [0x02, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn oid_arcs_encode_base128() {
        assert_eq!(
            object_identifier("2.5.4.3").unwrap(),
            [0x06, 0x03, 0x55, 0x04, 0x03]
        );
        assert_eq!(
            object_identifier("2.5.4.97").unwrap(),
            [0x06, 0x03, 0x55, 0x04, 0x61]
        );
        assert_eq!(
            object_identifier("1.2.840.113549").unwrap(),
            [0x06, 0x06, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d]
        );
        assert!(object_identifier("3.1").is_err());
        assert!(object_identifier("1.40").is_err());
        assert!(object_identifier("1").is_err());
        assert!(object_identifier("1.a.3").is_err());
    }

    #[test]
    fn strings_use_their_own_tags() {
        assert_eq!(utf8_string("Łódź")[0], TAG_UTF8_STRING);
        assert_eq!(
            printable_string("PL").unwrap(),
            [0x13, 0x02, 0x50, 0x4c]
        );
        assert!(printable_string("Łódź").is_err());
        assert!(printable_string("a@b").is_err());
    }

    #[test]
    fn set_of_sorts_elements() {
        let a = utf8_string("b");
        let b = utf8_string("a");
        assert_eq!(set_of(&[a.clone(), b.clone()]), set_of(&[b, a]));
    }

    #[test]
    fn single_country_name_is_bit_exact() {
        let name = DistinguishedName::from_components([("C", "PL")]).unwrap();
        assert_eq!(
            name.encode().unwrap(),
            [
                0x30, 0x0d, 0x31, 0x0b, 0x30, 0x09, 0x06, 0x03, 0x55, 0x04, 0x06, 0x13, 0x02,
                0x50, 0x4c
            ]
        );
    }

    #[test]
    fn components_keep_given_order() {
        let forward = DistinguishedName::from_components([("CN", "A"), ("C", "PL")]).unwrap();
        let reverse = DistinguishedName::from_components([("C", "PL"), ("CN", "A")]).unwrap();
        assert_ne!(forward.encode().unwrap(), reverse.encode().unwrap());
        let kinds: Vec<_> = forward.attributes().filter_map(|a| a.kind()).collect();
        assert_eq!(kinds, [AttributeKind::CommonName, AttributeKind::Country]);
        assert!(DistinguishedName::from_components([("XX", "v")]).is_err());
    }

    #[test]
    fn certificate_name_round_trips_bit_exact() {
        let name = Name::from_str(
            "CN=Test CA,OU=Testing,O=Ministry,2.5.4.7=Warszawa,2.5.4.8=mazowieckie,C=PL,2.5.4.5=12345",
        )
        .expect("name");
        let expected = name.to_der().expect("der");
        let rebuilt = DistinguishedName::from_name(&name).encode().expect("encode");
        assert_eq!(rebuilt, expected);
    }

    #[test]
    fn issuer_serial_wraps_name_in_directory_name() {
        let name = DistinguishedName::from_components([("C", "PL")]).unwrap();
        let encoded = issuer_serial_v2(&name, &[0x01]).unwrap();
        let name_der = name.encode().unwrap();

        let (tag, body, rest) = read_tlv(&encoded).unwrap();
        assert_eq!(tag, TAG_SEQUENCE);
        assert!(rest.is_empty());
        let (tag, general_names, body) = read_tlv(body).unwrap();
        assert_eq!(tag, TAG_SEQUENCE);
        let (tag, directory_name, _) = read_tlv(general_names).unwrap();
        assert_eq!(tag, 0xa4);
        assert_eq!(directory_name, name_der.as_slice());
        assert_eq!(body, [0x02, 0x01, 0x01]);
    }

    #[test]
    fn ecdsa_conversion_pads_and_strips() {
        // r has a sign byte, s is short.
        let mut r = vec![0x00, 0x80];
        r.extend([0x11; 31]);
        let s = vec![0x05];
        let der = sequence(&[tlv(TAG_INTEGER, &r), tlv(TAG_INTEGER, &s)]);
        for size in [32usize, 48, 66] {
            let raw = ecdsa_der_to_raw(&der, size).unwrap();
            assert_eq!(raw.len(), size * 2);
            assert_eq!(raw[size * 2 - 1], 0x05);
            assert!(raw[size..size * 2 - 1].iter().all(|b| *b == 0));
        }
        let raw = ecdsa_der_to_raw(&der, 32).unwrap();
        assert_eq!(raw[0], 0x80);
    }

    #[test]
    fn ecdsa_conversion_rejects_oversized_and_malformed() {
        let big = vec![0x7f; 33];
        let der = sequence(&[tlv(TAG_INTEGER, &big), tlv(TAG_INTEGER, &[1])]);
        assert!(matches!(
            ecdsa_der_to_raw(&der, 32),
            Err(DerError::IntegerTooLarge { .. })
        ));
        assert!(matches!(
            ecdsa_der_to_raw(&[0x31, 0x00], 32),
            Err(DerError::UnexpectedTag { .. })
        ));
        assert!(matches!(
            ecdsa_der_to_raw(&[0x30, 0x05, 0x02], 32),
            Err(DerError::Truncated)
        ));
    }

    #[test]
    fn read_tlv_handles_long_form() {
        let content = vec![0xab; 300];
        let encoded = tlv(0x04, &content);
        let (tag, body, rest) = read_tlv(&encoded).unwrap();
        assert_eq!(tag, 0x04);
        assert_eq!(body.len(), 300);
        assert!(rest.is_empty());
    }
}
