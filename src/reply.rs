//! Query and reply structures as the caches store them and as callers
//! receive them.
//!
//! A cached reply ([`ReplyInfo`]) does not own its record sets: it references
//! shared cache entries through `(key, id)` pairs. The reference list is kept
//! sorted in the stable key order so a reader can lock every referenced set
//! without risking deadlock against another reader. A reply handed back to a
//! caller ([`DnsMsg`]) is the opposite: every byte is owned, every TTL is
//! relative, and no cache memory is referenced.
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

use crate::dname::{canonical_hasher, dname_query_hash, query_dname_compare};
use crate::error::{DNSResult, InternalError};
use crate::region::Region;
use crate::rrset::{
    cmp_rrset_keys, PackedRrset, RrsetEntry, RrsetKey, RrsetRef, SecStatus,
};

/// The lookup key of the message cache: one question tuple.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub qname: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
}

impl QueryInfo {
    pub fn new(qname: Vec<u8>, qtype: u16, qclass: u16) -> Self {
        QueryInfo {
            qname,
            qtype,
            qclass,
        }
    }

    /// Byte footprint for cache accounting.
    pub fn sizeof(&self) -> usize {
        mem::size_of::<Self>() + self.qname.len()
    }
}

impl PartialEq for QueryInfo {
    fn eq(&self, other: &Self) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && query_dname_compare(&self.qname, &other.qname) == Ordering::Equal
    }
}

impl Eq for QueryInfo {}

impl Hash for QueryInfo {
    fn hash<H: Hasher>(&self, h: &mut H) {
        dname_query_hash(&self.qname, h);
        h.write_u16(self.qtype);
        h.write_u16(self.qclass);
    }
}

/// The canonical query hash, reproducible from a wire question section.
pub fn query_info_hash(q: &QueryInfo) -> u64 {
    let mut h = canonical_hasher();
    q.hash(&mut h);
    h.finish()
}

/// A reply as stored in the message cache: header state plus references into
/// the RRset cache.
///
/// `rrsets` keeps the section order (answer, authority, additional, with
/// `an + ns + ar == rrsets.len()`); `refs` holds the same entries sorted by
/// key order for deterministic multi-lock acquisition.
#[derive(Debug)]
pub struct ReplyInfo {
    /// DNS header flags, RCODE in the low bits
    pub flags: u16,
    pub qdcount: u16,
    /// Reply TTL; relative on input to the store path, absolute once cached
    pub ttl: u32,
    pub security: SecStatus,
    pub an_numrrsets: usize,
    pub ns_numrrsets: usize,
    pub ar_numrrsets: usize,
    pub rrsets: Vec<Arc<RrsetEntry>>,
    pub refs: Vec<RrsetRef>,
}

impl ReplyInfo {
    /// Assemble a reply around freshly parsed record sets, section counts
    /// first. TTLs are still relative at this point.
    pub fn new(
        flags: u16,
        qdcount: u16,
        ttl: u32,
        security: SecStatus,
        an_numrrsets: usize,
        ns_numrrsets: usize,
        ar_numrrsets: usize,
        rrsets: Vec<Arc<RrsetEntry>>,
    ) -> DNSResult<Self> {
        if an_numrrsets + ns_numrrsets + ar_numrrsets != rrsets.len() {
            return Err(InternalError::SectionCountMismatch.into());
        }
        Ok(ReplyInfo {
            flags,
            qdcount,
            ttl,
            security,
            an_numrrsets,
            ns_numrrsets,
            ar_numrrsets,
            rrsets,
            refs: Vec::new(),
        })
    }

    /// Capture a `(key, id)` reference for every record set, in section
    /// order; `sort_refs` establishes the lock order afterwards.
    pub fn capture_refs(&mut self) {
        self.refs = self.rrsets.iter().map(RrsetRef::capture).collect();
    }

    /// Sort the references into the stable key order every multi-lock
    /// acquisition follows.
    pub fn sort_refs(&mut self) {
        self.refs
            .sort_by(|a, b| cmp_rrset_keys(&a.key.rk, &b.key.rk));
    }

    /// Turn every relative TTL into an absolute deadline by adding `now`:
    /// each referenced payload, then the reply itself. Only sound on the
    /// store path, while the payloads are not yet shared with the cache.
    pub fn set_ttls_absolute(&mut self, now: u32) {
        for e in &self.rrsets {
            let mut st = e.state().write();
            Arc::make_mut(&mut st.data).ttl_add(now);
        }
        self.ttl = self.ttl.saturating_add(now);
    }

    /// Byte footprint for cache accounting; the referenced sets are shared
    /// and accounted by the RRset cache, only the reference arrays count
    /// here.
    pub fn sizeof(&self) -> usize {
        mem::size_of::<Self>()
            + self.rrsets.len() * mem::size_of::<Arc<RrsetEntry>>()
            + self.refs.len() * mem::size_of::<RrsetRef>()
    }
}

/// A record set copied out of the cache: owned key, owned payload, relative
/// TTLs, no locks.
#[derive(Debug)]
pub struct OwnedRrset {
    pub rk: RrsetKey,
    pub hash: u64,
    /// Version of the source entry at copy time
    pub id: u64,
    pub data: PackedRrset,
}

impl OwnedRrset {
    /// Deep-copy a payload into region-budgeted storage, rewriting TTLs from
    /// absolute to relative and rebuilding the offset table. Returns `None`
    /// when the region budget runs out.
    pub fn copy(
        rk: &RrsetKey,
        hash: u64,
        id: u64,
        data: &PackedRrset,
        region: &Region,
        now: u32,
    ) -> Option<Self> {
        let dname = region.alloc_init(&rk.dname)?;
        region.charge(data.sizeof())?;
        let mut d = data.clone();
        d.fixup();
        d.ttl_make_relative(now);
        Some(OwnedRrset {
            rk: RrsetKey::new(dname, rk.rtype, rk.class, rk.flags),
            hash,
            id,
            data: d,
        })
    }
}

/// The header and sections of a reply artifact.
#[derive(Debug)]
pub struct ReplyData {
    pub flags: u16,
    pub qdcount: u16,
    /// Relative TTL of the whole reply
    pub ttl: u32,
    pub security: SecStatus,
    pub an_numrrsets: usize,
    pub ns_numrrsets: usize,
    pub ar_numrrsets: usize,
    pub rrsets: Vec<OwnedRrset>,
}

/// A reply handed to a caller: question plus fully owned reply data.
#[derive(Debug)]
pub struct DnsMsg {
    pub qinfo: QueryInfo,
    pub rep: ReplyData,
}

impl DnsMsg {
    /// An empty reply skeleton with room for `cap` record sets, charged to
    /// the region.
    pub fn gen(
        region: &Region,
        qname: &[u8],
        qtype: u16,
        qclass: u16,
        cap: usize,
    ) -> Option<Self> {
        let qname = region.alloc_init(qname)?;
        region.charge(mem::size_of::<DnsMsg>() + cap * mem::size_of::<OwnedRrset>())?;
        Some(DnsMsg {
            qinfo: QueryInfo::new(qname, qtype, qclass),
            rep: ReplyData {
                flags: 0,
                qdcount: 0,
                ttl: 0,
                security: SecStatus::Unchecked,
                an_numrrsets: 0,
                ns_numrrsets: 0,
                ar_numrrsets: 0,
                rrsets: Vec::with_capacity(cap),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfc1035::{CLASS_IN, RR_TYPE_A, RR_TYPE_NS};
    use crate::rrset::{rrset_key_hash, RrsetTrust};
    use crate::{dname, qinfo};

    fn entry(name: &str, rtype: u16, rdata: &[u8], ttl: u32, id: u64) -> Arc<RrsetEntry> {
        let key = RrsetKey::new(dname!(name), rtype, CLASS_IN, 0);
        let data = PackedRrset::from_rrs(
            &[(rdata, ttl)],
            &[],
            RrsetTrust::AnsNoAa,
            SecStatus::Unchecked,
        );
        Arc::new(RrsetEntry::new(key, data, id))
    }

    #[test]
    fn query_hash_folds_case() {
        let q1 = qinfo!("WWW.EXAMPLE.COM.", RR_TYPE_A);
        let q2 = qinfo!("www.example.com.", RR_TYPE_A);
        assert_eq!(q1, q2);
        assert_eq!(query_info_hash(&q1), query_info_hash(&q2));

        let q3 = qinfo!("www.example.com.", RR_TYPE_NS);
        assert_ne!(q1, q3);
    }

    #[test]
    fn section_counts_must_match() {
        let e = entry("www.example.com.", RR_TYPE_A, &[1, 2, 3, 4], 60, 1);
        assert!(ReplyInfo::new(0, 1, 60, SecStatus::Unchecked, 2, 0, 0, vec![e]).is_err());
    }

    #[test]
    fn refs_sort_into_key_order() {
        let e1 = entry("zz.example.com.", RR_TYPE_A, &[1, 2, 3, 4], 60, 1);
        let e2 = entry("aa.example.com.", RR_TYPE_A, &[5, 6, 7, 8], 60, 2);
        let e3 = entry("aa.example.com.", RR_TYPE_NS, &dname!("ns1.example.com."), 60, 3);
        let mut rep = ReplyInfo::new(
            0,
            1,
            60,
            SecStatus::Unchecked,
            3,
            0,
            0,
            vec![e1, e2, e3],
        )
        .unwrap();
        rep.capture_refs();
        rep.sort_refs();
        for w in rep.refs.windows(2) {
            assert_ne!(
                cmp_rrset_keys(&w[0].key.rk, &w[1].key.rk),
                Ordering::Greater
            );
        }
        // name sorts before type
        assert_eq!(rep.refs[0].key.rk.dname, dname!("aa.example.com."));
        assert_eq!(rep.refs[0].key.rk.rtype, RR_TYPE_A);
        assert_eq!(rep.refs[2].key.rk.dname, dname!("zz.example.com."));
    }

    #[test]
    fn ttl_normalization_is_absolute() {
        let e = entry("www.example.com.", RR_TYPE_A, &[1, 2, 3, 4], 60, 1);
        let mut rep =
            ReplyInfo::new(0, 1, 60, SecStatus::Unchecked, 1, 0, 0, vec![e.clone()]).unwrap();
        rep.capture_refs();
        rep.set_ttls_absolute(1000);
        assert_eq!(rep.ttl, 1060);
        let snap = e.snapshot(1000).unwrap();
        assert_eq!(snap.data.ttl, 1060);
        assert_eq!(snap.data.rr_ttl[0], 1060);
    }

    #[test]
    fn copy_out_makes_ttls_relative() {
        let e = entry("www.example.com.", RR_TYPE_A, &[1, 2, 3, 4], 1060, 1);
        let region = Region::new();
        let snap = e.snapshot(0).unwrap();
        let copy = OwnedRrset::copy(&e.rk, e.hash, snap.id, &snap.data, &region, 1030).unwrap();
        assert_eq!(copy.data.ttl, 30);
        assert_eq!(copy.data.rr_ttl[0], 30);
        assert_eq!(copy.rk, e.rk);
        assert_eq!(copy.hash, rrset_key_hash(&e.rk));
        assert!(region.used() > 0);
    }

    #[test]
    fn copy_out_fails_on_tiny_region() {
        let e = entry("www.example.com.", RR_TYPE_A, &[1, 2, 3, 4], 60, 1);
        let region = Region::with_limit(4);
        let snap = e.snapshot(0).unwrap();
        assert!(OwnedRrset::copy(&e.rk, e.hash, snap.id, &snap.data, &region, 0).is_none());
    }
}
