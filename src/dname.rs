//! Domain names in canonical wire form: length-prefixed labels terminated by
//! the zero-length root label, as described in
//! https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
//!
//! Names are kept uninterpreted and uncompressed; comparison and hashing fold
//! ASCII case so that `WWW.Example.COM.` and `www.example.com.` collide, which
//! RFC1035 section 2.3.3 requires of every cache.
use std::cmp::Ordering;
use std::hash::{BuildHasher, Hasher};

use crate::error::{DNSError, DNSResult, InternalError};
use crate::rfc1035::{MAX_DOMAIN_LEN, MAX_LABEL_LEN};

// Fixed seeds so the canonical hashes are reproducible from a freshly parsed
// wire packet anywhere in the process. The values themselves are arbitrary.
const HASH_SEEDS: [u64; 4] = [
    0x00ab,
    0x5bd1_e995,
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
];

/// The hasher behind `rrset_key_hash` and `query_info_hash`.
pub(crate) fn canonical_hasher() -> ahash::AHasher {
    ahash::RandomState::with_seeds(HASH_SEEDS[0], HASH_SEEDS[1], HASH_SEEDS[2], HASH_SEEDS[3])
        .build_hasher()
}

/// Validate a wire-form domain name at the start of `buf`. Returns the number
/// of octets the name occupies, root label included, or 0 when the encoding is
/// malformed (overlong label or name, truncation, compression pointer).
pub fn dname_valid(buf: &[u8]) -> usize {
    let mut used = 0usize;
    loop {
        let lab = match buf.get(used) {
            Some(&l) => l as usize,
            None => return 0,
        };
        if lab == 0 {
            return used + 1;
        }
        if lab > MAX_LABEL_LEN {
            // a two-bit tag here would be a compression pointer; neither is
            // valid inside a cached name
            return 0;
        }
        used += lab + 1;
        if used + 1 > MAX_DOMAIN_LEN || used >= buf.len() {
            return 0;
        }
    }
}

/// Case-insensitive total order over wire-form names. Label length octets are
/// all below 0x41 so folding the whole byte sequence is safe.
pub fn query_dname_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.iter()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.iter().map(|c| c.to_ascii_lowercase()))
}

/// Feed a name into a hasher, case-folded. Every spot that hashes a name
/// (cache keys, the canonical hashes, a wire parser) must go through this so
/// the results stay interchangeable.
pub fn dname_query_hash<H: Hasher>(dname: &[u8], h: &mut H) {
    for b in dname {
        h.write_u8(b.to_ascii_lowercase());
    }
}

/// Remove the leftmost label, yielding the parent name. Returns `None` at the
/// root (or on a malformed length octet), which ends a root-ward walk.
pub fn dname_strip_label(dname: &[u8]) -> Option<&[u8]> {
    let lab = *dname.first()? as usize;
    if lab == 0 {
        return None;
    }
    dname.get(lab + 1..)
}

/// Convert a dotted text name to wire form.
///
/// ```
/// use dnscache::dname::dname_from_text;
///
/// let dn = dname_from_text("www.example.com.").unwrap();
/// assert_eq!(dn, b"\x03www\x07example\x03com\x00");
///
/// let root = dname_from_text(".").unwrap();
/// assert_eq!(root, b"\x00");
///
/// assert!(dname_from_text("").is_err());
/// ```
pub fn dname_from_text(domain: &str) -> DNSResult<Vec<u8>> {
    // safeguard
    if domain.is_empty() {
        return Err(DNSError::DNSInternalError(InternalError::EmptyDomainName));
    }

    let mut wire = Vec::with_capacity(domain.len() + 2);
    for label in domain.split('.').filter(|x| !x.is_empty()) {
        let bytes = label.as_bytes();
        if bytes.len() > MAX_LABEL_LEN {
            return Err(DNSError::DNSInternalError(InternalError::DnsLabelTooLong));
        }
        wire.push(bytes.len() as u8);
        wire.extend_from_slice(bytes);
    }

    // final root label
    wire.push(0);
    if wire.len() > MAX_DOMAIN_LEN {
        return Err(DNSError::DNSInternalError(
            InternalError::DnsDomainNameTooLong,
        ));
    }
    Ok(wire)
}

/// Render a wire-form name as dotted text, for logs and diagnostics.
/// Unprintable bytes come out as `\xNN` escapes.
pub fn dname_to_text(dname: &[u8]) -> String {
    let mut out = String::new();
    let mut name = dname;
    loop {
        let lab = match name.first() {
            Some(&l) if l as usize <= MAX_LABEL_LEN => l as usize,
            _ => break,
        };
        if lab == 0 {
            break;
        }
        if name.len() < lab + 1 {
            break;
        }
        for &b in &name[1..lab + 1] {
            if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                out.push(b as char);
            } else {
                out.push_str(&format!("\\x{:02x}", b));
            }
        }
        out.push('.');
        name = &name[lab + 1..];
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}
