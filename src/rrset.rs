//! Data storage for a set of resource records: the unit of DNS caching.
//!
//! An RRset is identified by its key (owner name, type, class plus cache-side
//! flags) and stores its records in one packed payload: parallel length,
//! offset and TTL tables over a single concatenated rdata buffer, with RRSIG
//! covers sharing the tables after the data records. The offset table is
//! derived state; `fixup` recomputes it from the lengths after a payload has
//! been rebuilt.
//!
//! Cached payloads carry absolute TTLs (wall-clock deadlines). Every record's
//! rdata is stored with a 16-bit big-endian length prefix, exactly as a wire
//! parser produces it.
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;

use crate::dname::{canonical_hasher, dname_query_hash, dname_valid, query_dname_compare};
use crate::rfc1035::{RR_TYPE_CNAME, RR_TYPE_DNAME};

/// Maximum TTL as defined in https://tools.ietf.org/html/rfc2181
pub const MAX_TTL: u32 = 2_147_483_647;

/// Key flag splitting an NSEC RRset seen at a zone apex from one seen
/// elsewhere; otherwise-identical sets must not collide in the cache.
pub const RRSET_NSEC_AT_APEX: u32 = 0x1;

/// Identity of an RRset in the cache. Equality and hashing fold ASCII case on
/// the owner name; `flags` carries cache-side distinctions such as
/// [`RRSET_NSEC_AT_APEX`].
#[derive(Debug, Clone)]
pub struct RrsetKey {
    pub dname: Vec<u8>,
    pub rtype: u16,
    pub class: u16,
    pub flags: u32,
}

impl RrsetKey {
    pub fn new(dname: Vec<u8>, rtype: u16, class: u16, flags: u32) -> Self {
        RrsetKey {
            dname,
            rtype,
            class,
            flags,
        }
    }

    /// Byte footprint for cache accounting.
    pub fn sizeof(&self) -> usize {
        mem::size_of::<Self>() + self.dname.len()
    }
}

impl PartialEq for RrsetKey {
    fn eq(&self, other: &Self) -> bool {
        self.rtype == other.rtype
            && self.class == other.class
            && self.flags == other.flags
            && query_dname_compare(&self.dname, &other.dname) == Ordering::Equal
    }
}

impl Eq for RrsetKey {}

impl Hash for RrsetKey {
    fn hash<H: Hasher>(&self, h: &mut H) {
        dname_query_hash(&self.dname, h);
        h.write_u16(self.rtype);
        h.write_u16(self.class);
        h.write_u32(self.flags);
    }
}

/// The canonical RRset hash. A parser hashing a freshly decoded wire RRset
/// computes the identical value, so parsed sets find their cached
/// counterparts.
pub fn rrset_key_hash(key: &RrsetKey) -> u64 {
    let mut h = canonical_hasher();
    key.hash(&mut h);
    h.finish()
}

/// The stable total order used for multi-lock acquisition: owner name first
/// (case-folded), then type, class, flags.
pub fn cmp_rrset_keys(a: &RrsetKey, b: &RrsetKey) -> Ordering {
    query_dname_compare(&a.dname, &b.dname)
        .then(a.rtype.cmp(&b.rtype))
        .then(a.class.cmp(&b.class))
        .then(a.flags.cmp(&b.flags))
}

/// How strongly an RRset's provenance is trusted, weakest first. Admission
/// into the cache never replaces a higher rank with a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RrsetTrust {
    /// initial value for trust
    None,
    /// Additional information from non-authoritative answers
    AddNoAa,
    /// Data from the authority section of a non-authoritative answer
    AuthNoAa,
    /// Additional information from an authoritative answer
    AddAa,
    /// non-authoritative data from the answer section of authoritative answers
    NonauthAnsAa,
    /// Data from the answer section of a non-authoritative answer
    AnsNoAa,
    /// Glue from a primed referral
    Glue,
    /// Data from the authority section of an authoritative answer
    AuthAa,
    /// Data from the answer section of an authoritative answer
    AnsAa,
    /// A primed referral without glue
    SecNoglue,
    /// An authoritative referral for the zone itself, without glue
    PrimNoglue,
    /// Successfully DNSSEC validated
    Validated,
    /// Ultimate trust: locally configured data
    Ultimate,
}

impl fmt::Display for RrsetTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RrsetTrust::None => "none",
            RrsetTrust::AddNoAa => "add_noAA",
            RrsetTrust::AuthNoAa => "auth_noAA",
            RrsetTrust::AddAa => "add_AA",
            RrsetTrust::NonauthAnsAa => "nonauth_ans_AA",
            RrsetTrust::AnsNoAa => "ans_noAA",
            RrsetTrust::Glue => "glue",
            RrsetTrust::AuthAa => "auth_AA",
            RrsetTrust::AnsAa => "ans_AA",
            RrsetTrust::SecNoglue => "sec_noglue",
            RrsetTrust::PrimNoglue => "prim_noglue",
            RrsetTrust::Validated => "validated",
            RrsetTrust::Ultimate => "ultimate",
        };
        write!(f, "{}", s)
    }
}

/// DNSSEC disposition of an RRset, attached at validation time and carried
/// through to every reply that references the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecStatus {
    Unchecked,
    Bogus,
    Indeterminate,
    Insecure,
    Secure,
}

impl fmt::Display for SecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecStatus::Unchecked => "unchecked",
            SecStatus::Bogus => "bogus",
            SecStatus::Indeterminate => "indeterminate",
            SecStatus::Insecure => "insecure",
            SecStatus::Secure => "secure",
        };
        write!(f, "{}", s)
    }
}

/// The packed payload of an RRset: `count` data records followed by
/// `rrsig_count` signature records in the same tables.
///
/// Invariant: `ttl` is the minimum of the per-record TTLs.
#[derive(Debug, Clone)]
pub struct PackedRrset {
    /// Set-level TTL; absolute while cached, relative in copied-out artifacts
    pub ttl: u32,
    /// Number of data records
    pub count: usize,
    /// Number of RRSIG records stored after the data records
    pub rrsig_count: usize,
    pub trust: RrsetTrust,
    pub security: SecStatus,
    /// Per-record stored length, 16-bit rdata length prefix included
    pub rr_len: Vec<usize>,
    /// Per-record offset into `rdata`; derived from `rr_len` by `fixup`
    pub rr_off: Vec<usize>,
    /// Per-record TTL
    pub rr_ttl: Vec<u32>,
    /// Concatenated record payloads
    pub rdata: Vec<u8>,
}

impl PackedRrset {
    /// Build a payload from raw rdata (no length prefix) and per-record TTLs,
    /// data records and signatures separately. The set TTL becomes the
    /// minimum per-record TTL.
    pub fn from_rrs(
        rrs: &[(&[u8], u32)],
        sigs: &[(&[u8], u32)],
        trust: RrsetTrust,
        security: SecStatus,
    ) -> Self {
        let total = rrs.len() + sigs.len();
        let mut rr_len = Vec::with_capacity(total);
        let mut rr_ttl = Vec::with_capacity(total);
        let mut rdata = Vec::new();
        let mut ttl = MAX_TTL;
        for (rd, t) in rrs.iter().chain(sigs.iter()) {
            rr_len.push(rd.len() + 2);
            rr_ttl.push(*t);
            if *t < ttl {
                ttl = *t;
            }
            let mut prefix = [0u8; 2];
            BigEndian::write_u16(&mut prefix, rd.len() as u16);
            rdata.extend_from_slice(&prefix);
            rdata.extend_from_slice(rd);
        }
        let mut d = PackedRrset {
            ttl,
            count: rrs.len(),
            rrsig_count: sigs.len(),
            trust,
            security,
            rr_len,
            rr_off: Vec::new(),
            rr_ttl,
            rdata,
        };
        d.fixup();
        d
    }

    /// Data records plus signatures.
    pub fn total(&self) -> usize {
        self.count + self.rrsig_count
    }

    /// The stored bytes of record `i`, length prefix included.
    pub fn rr(&self, i: usize) -> &[u8] {
        &self.rdata[self.rr_off[i]..self.rr_off[i] + self.rr_len[i]]
    }

    /// Recompute the offset table from the lengths. Mandatory after a payload
    /// is copied or its tables rebuilt.
    pub fn fixup(&mut self) {
        self.rr_off.clear();
        self.rr_off.reserve(self.rr_len.len());
        let mut off = 0;
        for &len in &self.rr_len {
            self.rr_off.push(off);
            off += len;
        }
    }

    /// Byte footprint for cache accounting.
    pub fn sizeof(&self) -> usize {
        mem::size_of::<Self>()
            + self.total() * (2 * mem::size_of::<usize>() + mem::size_of::<u32>())
            + self.rdata.len()
    }

    /// Shift every TTL forward, saturating; turns relative TTLs into absolute
    /// deadlines at store time.
    pub fn ttl_add(&mut self, add: u32) {
        self.ttl = self.ttl.saturating_add(add);
        for t in &mut self.rr_ttl {
            *t = t.saturating_add(add);
        }
    }

    /// Make every TTL relative to `now`, saturating at 0; the copy-out
    /// boundary conversion, applied exactly once per artifact.
    pub fn ttl_make_relative(&mut self, now: u32) {
        self.ttl = self.ttl.saturating_sub(now);
        for t in &mut self.rr_ttl {
            *t = t.saturating_sub(now);
        }
    }
}

/// Payload equality ignoring TTLs and trust: same records, same signatures.
pub fn rrsetdata_equal(d1: &PackedRrset, d2: &PackedRrset) -> bool {
    if d1.count != d2.count || d1.rrsig_count != d2.rrsig_count {
        return false;
    }
    (0..d1.total()).all(|i| d1.rr(i) == d2.rr(i))
}

/// Extract the target name of a CNAME or DNAME set: the single record's
/// rdata must be exactly one valid uncompressed name behind its length
/// prefix.
pub fn get_cname_target<'a>(key: &RrsetKey, d: &'a PackedRrset) -> Option<&'a [u8]> {
    if key.rtype != RR_TYPE_CNAME && key.rtype != RR_TYPE_DNAME {
        return None;
    }
    if d.count < 1 {
        return None;
    }
    let rr = d.rr(0);
    // at least the length prefix and a root label
    if rr.len() < 3 {
        return None;
    }
    let len = BigEndian::read_u16(&rr[..2]) as usize;
    if len != rr.len() - 2 {
        return None;
    }
    let target = &rr[2..];
    if dname_valid(target) != len {
        return None;
    }
    Some(target)
}

/// A shared cache entry: immutable identity plus the lock-guarded, versioned
/// payload. Replies and callers hold these through `Arc` and revalidate with
/// the `(key, id)` pair; an `id` of 0 marks an entry that has been evicted or
/// replaced.
#[derive(Debug)]
pub struct RrsetEntry {
    pub rk: RrsetKey,
    /// Canonical hash of `rk`, precomputed for shard selection
    pub hash: u64,
    state: RwLock<RrsetState>,
}

#[derive(Debug)]
pub struct RrsetState {
    /// Version; 0 only for dead entries, never issued
    pub id: u64,
    /// Payload snapshot, replaced wholesale on admission, never mutated
    pub data: Arc<PackedRrset>,
}

impl RrsetEntry {
    pub fn new(rk: RrsetKey, data: PackedRrset, id: u64) -> Self {
        let hash = rrset_key_hash(&rk);
        RrsetEntry {
            rk,
            hash,
            state: RwLock::new(RrsetState {
                id,
                data: Arc::new(data),
            }),
        }
    }

    /// Current version.
    pub fn id(&self) -> u64 {
        self.state.read().id
    }

    /// Take a coherent view of the payload, or `None` when the entry is dead
    /// or its TTL has passed.
    pub fn snapshot(&self, now: u32) -> Option<RrsetSnapshot> {
        let st = self.state.read();
        if st.id == 0 || st.data.ttl < now {
            return None;
        }
        Some(RrsetSnapshot {
            id: st.id,
            data: st.data.clone(),
        })
    }

    pub(crate) fn state(&self) -> &RwLock<RrsetState> {
        &self.state
    }

    /// Byte footprint for cache accounting: key, payload and entry overhead.
    pub fn sizeof(&self) -> usize {
        mem::size_of::<Self>() + self.rk.dname.len() + self.state.read().data.sizeof()
    }
}

/// A validated view of an entry's payload at one instant.
#[derive(Debug, Clone)]
pub struct RrsetSnapshot {
    pub id: u64,
    pub data: Arc<PackedRrset>,
}

/// An eviction-safe handle on a cache entry: the entry plus the version it
/// had when the reference was captured. A mismatch at read time means the set
/// was replaced or evicted and whatever references it is dead.
#[derive(Debug, Clone)]
pub struct RrsetRef {
    pub key: Arc<RrsetEntry>,
    pub id: u64,
}

impl RrsetRef {
    pub fn capture(key: &Arc<RrsetEntry>) -> Self {
        RrsetRef {
            id: key.id(),
            key: key.clone(),
        }
    }
}
