//! RFC 1035 zone-text handling.
//!
//! The upstream pushes zones as BIND-style zone files. Everything downstream
//! (backend verification, reconciliation, peer sync) counts records the same
//! way: one per IN-class resource record, the SOA included.

use crate::error::Error;
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType, RrKey};
use hickory_proto::serialize::txt::Parser;
use std::collections::BTreeMap;
use tracing::debug;

/// A zone parsed from text, keyed the way hickory stores it.
#[derive(Debug)]
pub struct ParsedZone {
    pub origin: Name,
    pub records: BTreeMap<RrKey, RecordSet>,
}

impl ParsedZone {
    /// Number of IN-class resource records, counting each individual record
    /// (every A, NS, MX, ...) the way a row-per-record SQL backend stores
    /// them. The SOA counts as one.
    pub fn record_count(&self) -> usize {
        self.iter_records()
            .filter(|r| r.dns_class() == DNSClass::IN)
            .count()
    }

    pub fn iter_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().flat_map(|set| set.records_without_rrsigs())
    }

    pub fn has_soa(&self) -> bool {
        self.soa().is_some()
    }

    pub fn soa(&self) -> Option<&Record> {
        self.records
            .get(&RrKey::new(LowerName::new(&self.origin), RecordType::SOA))
            .and_then(|set| set.records_without_rrsigs().next())
    }

    pub fn soa_serial(&self) -> Option<u32> {
        self.soa().and_then(|record| match record.data() {
            RData::SOA(soa) => Some(soa.serial()),
            _ => None,
        })
    }
}

/// Lowercase a zone name and strip the trailing dot, yielding the canonical
/// datastore key.
pub fn canonical_zone_name(zone_name: &str) -> String {
    zone_name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn zone_origin(zone_name: &str) -> Result<Name, Error> {
    let canonical = canonical_zone_name(zone_name);
    Name::from_ascii(format!("{canonical}."))
        .map_err(|e| Error::InvalidZoneName(format!("'{zone_name}': {e}")))
}

/// Parse zone text against the given origin. Accepts `@`-relative and FQDN
/// owner names; relative names are qualified against the origin.
pub fn parse_zone(zone_data: &str, zone_name: &str) -> Result<ParsedZone, Error> {
    let origin = zone_origin(zone_name)?;
    let (origin, records) = Parser::new(zone_data, None, Some(origin))
        .parse()
        .map_err(|e| Error::InvalidZone(format!("{zone_name}: {e}")))?;
    Ok(ParsedZone { origin, records })
}

/// Normalize zone text for storage and backend writes.
///
/// Prepends `$ORIGIN` and `$TTL` directives when the upstream omitted them,
/// then validates by parsing. Returns the normalized text.
pub fn normalize_zone(zone_data: &str, zone_name: &str) -> Result<String, Error> {
    let canonical = canonical_zone_name(zone_name);
    let mut normalized = zone_data.to_string();
    if !normalized.contains("$ORIGIN") {
        normalized = format!("$ORIGIN {canonical}.\n{normalized}");
    }
    if !normalized.contains("$TTL") {
        normalized = format!("$TTL 300\n{normalized}");
    }

    let parsed = parse_zone(&normalized, &canonical)?;
    debug!(
        zone = %canonical,
        records = parsed.record_count(),
        "Zone validated"
    );
    Ok(normalized)
}

/// Count IN-class records in zone text. The reference count for per-backend
/// verification.
pub fn count_records(zone_data: &str, zone_name: &str) -> Result<usize, Error> {
    Ok(parse_zone(zone_data, zone_name)?.record_count())
}

/// Qualify a record name or in-zone target as an absolute FQDN without the
/// trailing dot, the form row-store backends persist.
///
/// `@` and the empty string mean the apex.
pub fn ensure_fqdn(name: &str, zone_name: &str) -> String {
    let zone = canonical_zone_name(zone_name);
    if name == "@" || name.is_empty() {
        return zone;
    }
    if let Some(stripped) = name.strip_suffix('.') {
        return stripped.to_string();
    }
    if name.eq_ignore_ascii_case(&zone) {
        return name.to_ascii_lowercase();
    }
    format!("{name}.{zone}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 2024010101 3600 900 604800 300
@ IN NS ns1.example.com.
@ IN NS ns2.example.com.
www IN A 192.0.2.10
";

    #[test]
    fn test_count_records_soa_counts_as_one() {
        assert_eq!(count_records(ZONE, "example.com").unwrap(), 4);
    }

    #[test]
    fn test_parse_identifies_soa() {
        let parsed = parse_zone(ZONE, "example.com").unwrap();
        assert!(parsed.has_soa());
        assert_eq!(parsed.soa_serial(), Some(2024010101));
    }

    #[test]
    fn test_empty_zone_soa_only() {
        let zone = "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300
";
        assert_eq!(count_records(zone, "example.com").unwrap(), 1);
    }

    #[test]
    fn test_wildcard_record_parses() {
        let zone = format!("{ZONE}* IN A 192.0.2.20\n");
        assert_eq!(count_records(&zone, "example.com").unwrap(), 5);
    }

    #[test]
    fn test_relative_names_qualify_against_origin() {
        let zone = "\
$ORIGIN example.com.
$TTL 300
@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300
mail IN A 192.0.2.30
@ IN MX 10 mail
";
        let parsed = parse_zone(zone, "example.com").unwrap();
        assert_eq!(parsed.record_count(), 3);
        let names: Vec<String> = parsed
            .iter_records()
            .map(|r| r.name().to_ascii())
            .collect();
        assert!(names.iter().any(|n| n == "mail.example.com."));
    }

    #[test]
    fn test_normalize_adds_missing_directives() {
        let bare = "\
@ IN SOA ns1.example.com. hostmaster.example.com. 1 3600 900 604800 300
@ IN NS ns1.example.com.
";
        let normalized = normalize_zone(bare, "example.com").unwrap();
        assert!(normalized.starts_with("$TTL 300\n$ORIGIN example.com.\n"));
        assert_eq!(count_records(&normalized, "example.com").unwrap(), 2);
    }

    #[test]
    fn test_normalize_preserves_existing_directives() {
        let normalized = normalize_zone(ZONE, "example.com").unwrap();
        assert_eq!(normalized, ZONE);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_zone("not a zone file at all %%", "example.com").is_err());
    }

    #[test]
    fn test_bad_zone_name_is_its_own_error() {
        // A label longer than 63 octets is not a valid DNS name.
        let name = format!("{}.example.com", "a".repeat(64));
        let err = parse_zone(ZONE, &name).unwrap_err();
        assert!(matches!(err, Error::InvalidZoneName(_)));
    }

    #[test]
    fn test_normalize_round_trip_preserves_count() {
        let normalized = normalize_zone(ZONE, "example.com").unwrap();
        assert_eq!(
            count_records(&normalized, "example.com").unwrap(),
            count_records(ZONE, "example.com").unwrap()
        );
    }

    #[test]
    fn test_canonical_zone_name() {
        assert_eq!(canonical_zone_name("Example.COM."), "example.com");
        assert_eq!(canonical_zone_name(" example.com "), "example.com");
    }

    #[test]
    fn test_ensure_fqdn() {
        assert_eq!(ensure_fqdn("@", "example.com"), "example.com");
        assert_eq!(ensure_fqdn("", "example.com"), "example.com");
        assert_eq!(ensure_fqdn("www", "example.com"), "www.example.com");
        assert_eq!(ensure_fqdn("mail.example.com.", "example.com"), "mail.example.com");
        assert_eq!(ensure_fqdn("example.com", "example.com"), "example.com");
    }
}
