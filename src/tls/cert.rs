//! Certificate metadata and expiration windows.

use chrono::{DateTime, SecondsFormat, Utc};
use rustls::pki_types::TrustAnchor;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::time::ASN1Time;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::event::Fields;

/// Unix timestamp of `0001-01-01T00:00:00Z`, the date an unset certificate
/// time decodes to.
const ZERO_TIMESTAMP: i64 = -62_135_596_800;

const MAX_CHAIN_DEPTH: usize = 10;

#[derive(Error, Debug)]
#[error("unable to parse certificate: {0}")]
pub struct CertError(String);

/// The "zero" certificate date. It cannot be told apart from an absent value.
pub fn zero_time() -> DateTime<Utc> {
    DateTime::from_timestamp(ZERO_TIMESTAMP, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn is_zero_time(t: &DateTime<Utc>) -> bool {
    t.timestamp() <= ZERO_TIMESTAMP
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Expiration window of a chain. `not_after` is `None` when no certificate in
/// the chain carries a non-zero expiry, which means "unknown", not "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertWindow {
    pub not_before: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
}

impl CertWindow {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && self.not_after.is_none_or(|not_after| now <= not_after)
    }

    fn expires_before(&self, other: &CertWindow) -> bool {
        match (self.not_after, other.not_after) {
            (Some(mine), Some(theirs)) => mine < theirs,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn write_fields(&self, fields: &mut Fields) {
        fields.put(
            "tls.certificate_not_valid_before",
            format_time(&self.not_before),
        );
        if let Some(not_after) = &self.not_after {
            fields.put("tls.certificate_not_valid_after", format_time(not_after));
        }
    }
}

/// Window of one chain: the latest `not_before` and the earliest non-zero
/// `not_after`. Chain order is irrelevant.
pub fn calculate_cert_timestamps(chain: &[Validity]) -> CertWindow {
    let not_before = chain
        .iter()
        .map(|v| v.not_before)
        .max()
        .unwrap_or_else(zero_time);
    let not_after = chain
        .iter()
        .map(|v| v.not_after)
        .filter(|t| !is_zero_time(t))
        .min();
    CertWindow {
        not_before,
        not_after,
    }
}

/// Pick the window to report for a handshake.
///
/// Without verified chains the peer chain decides. Otherwise each verified
/// chain yields a window and the soonest-expiring one among the chains valid
/// at `now` wins. A chain that is not valid at `now` never replaces a window
/// that is; if no chain is valid the soonest expiry is kept.
pub fn select_window(
    peer: &[Validity],
    verified: &[Vec<Validity>],
    now: DateTime<Utc>,
) -> CertWindow {
    let mut selected: Option<CertWindow> = None;
    for chain in verified {
        let window = calculate_cert_timestamps(chain);
        selected = Some(match selected {
            None => window,
            Some(current) => {
                let current_valid = current.is_valid_at(now);
                let candidate_valid = window.is_valid_at(now);
                if candidate_valid && !current_valid {
                    window
                } else if candidate_valid == current_valid && window.expires_before(&current) {
                    window
                } else {
                    current
                }
            }
        });
    }
    selected.unwrap_or_else(|| calculate_cert_timestamps(peer))
}

/// Read-only view of one certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateInfo {
    pub sha1: String,
    pub sha256: String,
    pub issuer_common_name: Option<String>,
    pub issuer_distinguished_name: String,
    pub subject_common_name: Option<String>,
    pub subject_distinguished_name: String,
    pub serial_number: String,
    pub signature_algorithm: String,
    pub public_key_algorithm: String,
    pub public_key_size: Option<usize>,
    pub public_key_exponent: Option<u64>,
    pub public_key_curve: Option<String>,
    pub alternative_names: Vec<String>,
    pub version_number: u32,
    pub validity: Validity,
}

impl CertificateInfo {
    pub fn parse(der: &[u8]) -> Result<Self, CertError> {
        let (_, cert) = parse_x509_certificate(der).map_err(|e| CertError(e.to_string()))?;

        let (public_key_algorithm, public_key_size, public_key_exponent, public_key_curve) =
            public_key_details(&cert);

        let mut alternative_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in san.value.general_names.iter() {
                match name {
                    GeneralName::DNSName(dns) => alternative_names.push(dns.to_string()),
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_bytes(raw) {
                            alternative_names.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(CertificateInfo {
            sha1: hex::encode_upper(Sha1::digest(der)),
            sha256: hex::encode_upper(Sha256::digest(der)),
            issuer_common_name: common_name(cert.issuer()),
            issuer_distinguished_name: cert.issuer().to_string(),
            subject_common_name: common_name(cert.subject()),
            subject_distinguished_name: cert.subject().to_string(),
            serial_number: serial_hex(cert.raw_serial()),
            signature_algorithm: signature_algorithm_name(
                &cert.signature_algorithm.algorithm.to_id_string(),
            ),
            public_key_algorithm,
            public_key_size,
            public_key_exponent,
            public_key_curve,
            alternative_names,
            version_number: cert.version().0 + 1,
            validity: validity_of(&cert),
        })
    }

    /// Write the leaf certificate metadata under `tls.server`.
    pub fn write_fields(&self, fields: &mut Fields) {
        fields.put("tls.server.hash.sha1", self.sha1.clone());
        fields.put("tls.server.hash.sha256", self.sha256.clone());

        let x509 = "tls.server.x509";
        fields.put(
            &format!("{x509}.not_before"),
            format_time(&self.validity.not_before),
        );
        fields.put(
            &format!("{x509}.not_after"),
            format_time(&self.validity.not_after),
        );
        fields.put(&format!("{x509}.serial_number"), self.serial_number.clone());
        fields.put(
            &format!("{x509}.signature_algorithm"),
            self.signature_algorithm.clone(),
        );
        fields.put(
            &format!("{x509}.public_key_algorithm"),
            self.public_key_algorithm.clone(),
        );
        if let Some(size) = self.public_key_size {
            fields.put(&format!("{x509}.public_key_size"), size);
        }
        if let Some(exponent) = self.public_key_exponent {
            fields.put(&format!("{x509}.public_key_exponent"), exponent);
        }
        if let Some(curve) = &self.public_key_curve {
            fields.put(&format!("{x509}.public_key_curve"), curve.clone());
        }
        if let Some(cn) = &self.issuer_common_name {
            fields.put(&format!("{x509}.issuer.common_name"), cn.clone());
        }
        fields.put(
            &format!("{x509}.issuer.distinguished_name"),
            self.issuer_distinguished_name.clone(),
        );
        if let Some(cn) = &self.subject_common_name {
            fields.put(&format!("{x509}.subject.common_name"), cn.clone());
        }
        fields.put(
            &format!("{x509}.subject.distinguished_name"),
            self.subject_distinguished_name.clone(),
        );
        if !self.alternative_names.is_empty() {
            fields.put(
                &format!("{x509}.alternative_names"),
                self.alternative_names.clone(),
            );
        }
        fields.put(&format!("{x509}.version_number"), self.version_number);
    }
}

/// A trust anchor the chain walk may end at: a configured CA certificate or a
/// bundled webpki root.
#[derive(Debug, Clone)]
pub struct Anchor {
    /// Name value without its outer SEQUENCE header, as webpki stores it.
    subject: Vec<u8>,
    /// Full DER of the SubjectPublicKeyInfo.
    spki: Vec<u8>,
    certificate: Option<(Vec<u8>, Validity)>,
}

impl Anchor {
    pub fn from_der(der: &[u8]) -> Result<Self, CertError> {
        let (_, cert) = parse_x509_certificate(der).map_err(|e| CertError(e.to_string()))?;
        Ok(Anchor {
            subject: der_value(cert.subject().as_raw()).to_vec(),
            spki: cert.public_key().raw.to_vec(),
            certificate: Some((der.to_vec(), validity_of(&cert))),
        })
    }

    pub fn from_trust_anchor(anchor: &TrustAnchor<'_>) -> Self {
        Anchor {
            subject: anchor.subject.as_ref().to_vec(),
            spki: der_sequence(anchor.subject_public_key_info.as_ref()),
            certificate: None,
        }
    }

    fn is(&self, der: &[u8]) -> bool {
        matches!(&self.certificate, Some((own, _)) if own.as_slice() == der)
    }

    fn issued(&self, cert: &X509Certificate<'_>) -> bool {
        if self.subject.as_slice() != der_value(cert.issuer().as_raw()) {
            return false;
        }
        match SubjectPublicKeyInfo::from_der(&self.spki) {
            Ok((_, key)) => cert.verify_signature(Some(&key)).is_ok(),
            Err(_) => false,
        }
    }

    fn validity(&self) -> Option<Validity> {
        self.certificate.as_ref().map(|(_, validity)| *validity)
    }
}

/// Validity periods of every chain that links `peer[0]` to one of `anchors`,
/// using the rest of the peer chain as candidate intermediates. Each link must
/// carry a signature from the next certificate's key. Every branch is kept, so
/// cross-signed intermediates yield several chains.
pub fn verified_chain_validities(peer: &[&[u8]], anchors: &[Anchor]) -> Vec<Vec<Validity>> {
    let mut certs: Vec<(&[u8], X509Certificate<'_>)> = Vec::new();
    for der in peer {
        if certs.iter().any(|(seen, _)| seen == der) {
            continue;
        }
        match parse_x509_certificate(der) {
            Ok((_, cert)) => certs.push((*der, cert)),
            Err(e) if certs.is_empty() => {
                log::debug!("unable to parse leaf certificate: {e}");
                return Vec::new();
            }
            Err(e) => log::debug!("skipping unparsable certificate in chain: {e}"),
        }
    }
    if certs.is_empty() {
        return Vec::new();
    }

    fn chain_of(
        path: &[usize],
        certs: &[(&[u8], X509Certificate<'_>)],
        anchor: Option<Validity>,
    ) -> Vec<Validity> {
        path.iter()
            .map(|i| validity_of(&certs[*i].1))
            .chain(anchor)
            .collect()
    }

    fn walk(
        path: &mut Vec<usize>,
        certs: &[(&[u8], X509Certificate<'_>)],
        anchors: &[Anchor],
        out: &mut Vec<Vec<Validity>>,
    ) {
        let (der, cert) = &certs[path[path.len() - 1]];
        if anchors.iter().any(|a| a.is(der)) {
            let chain = chain_of(path, certs, None);
            if !out.contains(&chain) {
                out.push(chain);
            }
            return;
        }
        for anchor in anchors.iter().filter(|a| a.issued(cert)) {
            let chain = chain_of(path, certs, anchor.validity());
            if !out.contains(&chain) {
                out.push(chain);
            }
        }
        if path.len() >= MAX_CHAIN_DEPTH {
            return;
        }

        let parents: Vec<usize> = (1..certs.len())
            .filter(|i| !path.contains(i))
            .filter(|i| {
                let parent = &certs[*i].1;
                parent.subject().as_raw() == cert.issuer().as_raw()
                    && cert.verify_signature(Some(parent.public_key())).is_ok()
            })
            .collect();
        for parent in parents {
            path.push(parent);
            walk(path, certs, anchors, out);
            path.pop();
        }
    }

    let mut chains = Vec::new();
    walk(&mut vec![0], &certs, anchors, &mut chains);
    chains
}

/// Strip the tag and length of a DER element.
fn der_value(raw: &[u8]) -> &[u8] {
    let header = match raw.get(1) {
        Some(len) if len & 0x80 == 0 => 2,
        Some(len) => 2 + usize::from(len & 0x7f),
        None => return raw,
    };
    raw.get(header..).unwrap_or(raw)
}

/// Wrap `value` in a DER SEQUENCE header.
fn der_sequence(value: &[u8]) -> Vec<u8> {
    let mut out = vec![0x30];
    let len = value.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(value);
    out
}

pub fn validity_from_der(der: &[u8]) -> Result<Validity, CertError> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| CertError(e.to_string()))?;
    Ok(validity_of(&cert))
}

fn validity_of(cert: &X509Certificate<'_>) -> Validity {
    Validity {
        not_before: asn1_to_utc(&cert.validity().not_before),
        not_after: asn1_to_utc(&cert.validity().not_after),
    }
}

fn asn1_to_utc(time: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_else(zero_time)
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn common_name(name: &x509_parser::x509::X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn serial_hex(raw: &[u8]) -> String {
    let trimmed: &[u8] = match raw.iter().position(|b| *b != 0) {
        Some(first) => &raw[first..],
        None => &[0],
    };
    hex::encode_upper(trimmed)
}

fn ip_from_bytes(raw: &[u8]) -> Option<String> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn signature_algorithm_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.4" => "MD5-RSA",
        "1.2.840.113549.1.1.5" => "SHA1-RSA",
        "1.2.840.113549.1.1.11" => "SHA256-RSA",
        "1.2.840.113549.1.1.12" => "SHA384-RSA",
        "1.2.840.113549.1.1.13" => "SHA512-RSA",
        "1.2.840.113549.1.1.10" => "SHA256-RSAPSS",
        "1.2.840.10040.4.3" => "DSA-SHA1",
        "1.2.840.10045.4.1" => "ECDSA-SHA1",
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256",
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384",
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512",
        "1.3.101.112" => "Ed25519",
        other => return other.to_string(),
    };
    name.to_string()
}

fn curve_name(oid: &str) -> Option<String> {
    let name = match oid {
        "1.2.840.10045.3.1.7" => "P-256",
        "1.3.132.0.34" => "P-384",
        "1.3.132.0.35" => "P-521",
        "1.3.132.0.33" => "P-224",
        _ => return None,
    };
    Some(name.to_string())
}

fn public_key_details(
    cert: &X509Certificate<'_>,
) -> (String, Option<usize>, Option<u64>, Option<String>) {
    let spki = cert.public_key();
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => (
            "RSA".to_string(),
            Some(rsa.key_size()),
            rsa.try_exponent().ok(),
            None,
        ),
        Ok(PublicKey::EC(point)) => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .and_then(|oid| curve_name(&oid.to_id_string()));
            ("ECDSA".to_string(), Some(point.key_size()), None, curve)
        }
        Ok(PublicKey::DSA(_)) => ("DSA".to_string(), None, None, None),
        _ => {
            let oid = spki.algorithm.algorithm.to_id_string();
            let name = match oid.as_str() {
                "1.3.101.112" => "Ed25519".to_string(),
                "1.3.101.113" => "Ed448".to_string(),
                _ => "Unknown".to_string(),
            };
            (name, None, None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn validity(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Validity {
        Validity {
            not_before,
            not_after,
        }
    }

    #[test]
    fn window_uses_latest_start_and_earliest_nonzero_end() {
        let t0 = at(2020, 1, 1);
        let t1 = at(2021, 1, 1);
        let t2 = at(2030, 1, 1);
        let chain = [validity(t0, t2), validity(t1, zero_time())];

        let window = calculate_cert_timestamps(&chain);
        assert_eq!(window.not_before, t1);
        assert_eq!(window.not_after, Some(t2));
    }

    #[test]
    fn window_ignores_chain_order() {
        let a = validity(at(2022, 6, 1), at(2025, 1, 1));
        let b = validity(at(2019, 1, 1), at(2035, 1, 1));
        assert_eq!(
            calculate_cert_timestamps(&[a, b]),
            calculate_cert_timestamps(&[b, a])
        );
        assert_eq!(calculate_cert_timestamps(&[b, a]).not_after, Some(at(2025, 1, 1)));
    }

    #[test]
    fn all_zero_not_after_is_unknown() {
        let chain = [
            validity(at(2020, 1, 1), zero_time()),
            validity(zero_time(), zero_time()),
        ];
        let window = calculate_cert_timestamps(&chain);
        assert_eq!(window.not_before, at(2020, 1, 1));
        assert_eq!(window.not_after, None);
    }

    #[test]
    fn without_verified_chains_peer_window_is_reported() {
        let peer = [validity(at(2020, 1, 1), at(2030, 1, 1))];
        let window = select_window(&peer, &[], at(2024, 1, 1));
        assert_eq!(window.not_after, Some(at(2030, 1, 1)));
    }

    #[test]
    fn soonest_valid_verified_chain_wins() {
        let now = at(2024, 1, 1);
        let peer = [validity(at(2020, 1, 1), at(2040, 1, 1))];
        let long = vec![validity(at(2020, 1, 1), at(2035, 1, 1))];
        let short = vec![validity(at(2020, 1, 1), at(2026, 1, 1))];

        let window = select_window(&peer, &[long.clone(), short.clone()], now);
        assert_eq!(window.not_after, Some(at(2026, 1, 1)));
        let window = select_window(&peer, &[short, long], now);
        assert_eq!(window.not_after, Some(at(2026, 1, 1)));
    }

    #[test]
    fn invalid_chain_does_not_displace_valid_one() {
        let now = at(2024, 1, 1);
        let valid = vec![validity(at(2020, 1, 1), at(2030, 1, 1))];
        let expired = vec![validity(at(2019, 1, 1), at(2023, 1, 1))];
        let future = vec![validity(at(2025, 1, 1), at(2027, 1, 1))];

        let window = select_window(&[], &[valid.clone(), expired.clone()], now);
        assert_eq!(window.not_after, Some(at(2030, 1, 1)));
        let window = select_window(&[], &[expired, valid.clone()], now);
        assert_eq!(window.not_after, Some(at(2030, 1, 1)));
        let window = select_window(&[], &[valid, future], now);
        assert_eq!(window.not_after, Some(at(2030, 1, 1)));
    }

    #[test]
    fn parses_self_signed_certificate() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = generated.cert.der().to_vec();
        let info = CertificateInfo::parse(&der).unwrap();

        assert_eq!(info.sha1.len(), 40);
        assert_eq!(info.sha256.len(), 64);
        assert_eq!(info.alternative_names, vec!["localhost".to_string()]);
        assert_eq!(info.public_key_algorithm, "ECDSA");
        assert_eq!(info.public_key_curve.as_deref(), Some("P-256"));
        assert_eq!(info.signature_algorithm, "ECDSA-SHA256");
        assert_eq!(info.version_number, 3);
        assert!(info.validity.not_after > info.validity.not_before);

        let mut fields = Fields::new();
        info.write_fields(&mut fields);
        assert!(fields.contains("tls.server.hash.sha256"));
        assert!(fields.contains("tls.server.x509.subject.distinguished_name"));
        assert_eq!(
            fields.get("tls.server.x509.alternative_names"),
            Some(&serde_json::json!(["localhost"]))
        );
    }

    #[test]
    fn self_signed_leaf_is_a_single_chain() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = generated.cert.der().to_vec();
        let anchors = [Anchor::from_der(&der).unwrap()];
        let chains = verified_chain_validities(&[der.as_slice()], &anchors);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].len(), 1);
    }

    struct Issuer {
        cert: rcgen::Certificate,
        key: rcgen::KeyPair,
    }

    fn ca_params(name: &str) -> rcgen::CertificateParams {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, name);
        params
    }

    fn root(name: &str) -> Issuer {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = ca_params(name).self_signed(&key).unwrap();
        Issuer { cert, key }
    }

    fn issue(params: &rcgen::CertificateParams, key: &rcgen::KeyPair, by: &Issuer) -> Vec<u8> {
        params
            .clone()
            .signed_by(key, &by.cert, &by.key)
            .unwrap()
            .der()
            .to_vec()
    }

    fn intermediate(name: &str, by: &Issuer) -> Issuer {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = ca_params(name).signed_by(&key, &by.cert, &by.key).unwrap();
        Issuer { cert, key }
    }

    fn leaf(by: &Issuer) -> Vec<u8> {
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        issue(&params, &key, by)
    }

    #[test]
    fn chain_through_intermediate_reaches_configured_root() {
        let root = root("Test Root");
        let inter = intermediate("Test Intermediate", &root);
        let leaf = leaf(&inter);
        let inter_der = inter.cert.der().to_vec();

        let anchors = [Anchor::from_der(root.cert.der()).unwrap()];
        let chains = verified_chain_validities(&[leaf.as_slice(), inter_der.as_slice()], &anchors);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].len(), 3);
    }

    #[test]
    fn unanchored_chain_is_not_verified() {
        let unknown = root("Unknown Root");
        let inter = intermediate("Test Intermediate", &unknown);
        let leaf = leaf(&inter);
        let inter_der = inter.cert.der().to_vec();
        let unknown_der = unknown.cert.der().to_vec();

        assert!(verified_chain_validities(&[leaf.as_slice(), inter_der.as_slice()], &[]).is_empty());

        let other = root("Other Root");
        let anchors = [Anchor::from_der(other.cert.der()).unwrap()];
        assert!(verified_chain_validities(
            &[leaf.as_slice(), inter_der.as_slice(), unknown_der.as_slice()],
            &anchors
        ).is_empty());
    }

    #[test]
    fn issuer_name_without_matching_signature_is_not_verified() {
        let trusted = root("Shared Name");
        let impostor = root("Shared Name");
        let leaf = leaf(&impostor);
        let impostor_der = impostor.cert.der().to_vec();

        let anchors = [Anchor::from_der(trusted.cert.der()).unwrap()];
        assert!(verified_chain_validities(&[leaf.as_slice()], &anchors).is_empty());
        assert!(verified_chain_validities(&[leaf.as_slice(), impostor_der.as_slice()], &anchors).is_empty());
    }

    #[test]
    fn bundled_root_form_anchors_chain() {
        let root = root("Bundled Root");
        let leaf = leaf(&root);

        let (_, parsed) = parse_x509_certificate(root.cert.der()).unwrap();
        let trust_anchor = TrustAnchor {
            subject: der_value(parsed.subject().as_raw()).to_vec().into(),
            subject_public_key_info: der_value(parsed.public_key().raw).to_vec().into(),
            name_constraints: None,
        };
        let anchors = [Anchor::from_trust_anchor(&trust_anchor)];

        let chains = verified_chain_validities(&[leaf.as_slice()], &anchors);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].len(), 1);
        assert_eq!(der_sequence(der_value(parsed.public_key().raw)), parsed.public_key().raw);
    }

    #[test]
    fn expired_cross_sign_to_unknown_root_does_not_set_window() {
        let trusted = root("Trusted Root");
        let unknown = root("Retired Root");

        let inter_key = rcgen::KeyPair::generate().unwrap();
        let current = ca_params("Shared Intermediate")
            .signed_by(&inter_key, &trusted.cert, &trusted.key)
            .unwrap();
        let mut retired_params = ca_params("Shared Intermediate");
        retired_params.not_before = rcgen::date_time_ymd(2015, 1, 1);
        retired_params.not_after = rcgen::date_time_ymd(2020, 1, 1);
        let retired = issue(&retired_params, &inter_key, &unknown);
        let inter = Issuer {
            cert: current,
            key: inter_key,
        };
        let leaf = leaf(&inter);
        let current_der = inter.cert.der().to_vec();

        let anchors = [Anchor::from_der(trusted.cert.der()).unwrap()];
        let peer: [&[u8]; 3] = [&leaf, &retired, &current_der];
        let chains = verified_chain_validities(&peer, &anchors);
        assert_eq!(chains.len(), 1);

        let peer_validities: Vec<_> = peer.iter().map(|d| validity_from_der(d).unwrap()).collect();
        let window = select_window(&peer_validities, &chains, Utc::now());
        assert!(window.not_after.unwrap() > at(2020, 1, 1));
    }

    #[test]
    fn window_fields() {
        let window = CertWindow {
            not_before: at(2024, 1, 1),
            not_after: None,
        };
        let mut fields = Fields::new();
        window.write_fields(&mut fields);
        assert_eq!(
            fields.get("tls.certificate_not_valid_before"),
            Some(&serde_json::json!("2024-01-01T00:00:00Z"))
        );
        assert!(!fields.contains("tls.certificate_not_valid_after"));
    }
}
