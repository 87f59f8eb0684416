//! Cache services for DNS: the read/write path over the message and RRset
//! caches, CNAME/DNAME synthesis, and closest-enclosing delegation search.
//!
//! The environment is an explicit handle ([`DnsCache`]) passed to every
//! operation; there is no hidden global. Callers take the wall clock once per
//! top-level operation and thread it through, and supply a [`Region`] that
//! owns everything an operation synthesizes. All failure at this layer is a
//! miss: `None` out, locks released, nothing half-returned.
use std::mem;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::delegpt::DelegPt;
use crate::dname::{dname_strip_label, dname_valid};
use crate::region::Region;
use crate::reply::{query_info_hash, DnsMsg, OwnedRrset, QueryInfo, ReplyInfo};
use crate::rfc1035::{
    BIT_QR, MAX_DOMAIN_LEN, RCODE_YXDOMAIN, RR_TYPE_A, RR_TYPE_AAAA, RR_TYPE_CNAME,
    RR_TYPE_DNAME, RR_TYPE_DS, RR_TYPE_NS, RR_TYPE_NSEC,
};
use crate::rrset::{
    get_cname_target, rrset_key_hash, PackedRrset, RrsetEntry, RrsetKey, RrsetRef,
    RrsetSnapshot, RrsetTrust, SecStatus,
};

pub mod msg_cache;
pub mod rrset_cache;

use msg_cache::{MsgCache, MsgEntry};
use rrset_cache::RrsetCache;

/// Sizing knobs for the two caches. The defaults mirror a small resolver:
/// a few megabytes per cache, four lock stripes each.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total byte cap of the RRset cache
    pub rrset_cache_bytes: usize,
    /// Lock stripes of the RRset cache, rounded up to a power of two
    pub rrset_cache_slabs: usize,
    /// Total byte cap of the message cache
    pub msg_cache_bytes: usize,
    /// Lock stripes of the message cache
    pub msg_cache_slabs: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            rrset_cache_bytes: 4 * 1024 * 1024,
            rrset_cache_slabs: 4,
            msg_cache_bytes: 4 * 1024 * 1024,
            msg_cache_slabs: 4,
        }
    }
}

/// The cache environment: both stores behind one handle, shared freely
/// between query threads.
pub struct DnsCache {
    pub rrset: RrsetCache,
    pub msg: MsgCache,
}

impl DnsCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        DnsCache {
            rrset: RrsetCache::new(cfg.rrset_cache_bytes, cfg.rrset_cache_slabs),
            msg: MsgCache::new(cfg.msg_cache_bytes, cfg.msg_cache_slabs),
        }
    }

    /// Store a freshly resolved reply.
    ///
    /// The reply arrives with relative TTLs. Every record set is normalized
    /// to absolute TTLs and offered to the RRset cache; sets already cached
    /// with equal or better standing are swapped in so the reply references
    /// the canonical copy. A reply TTL of 0 means the message itself is not
    /// cached, but its sets have still been admitted -- they may serve as
    /// delegation information later.
    pub fn store_msg(&self, qinfo: QueryInfo, hash: u64, mut rep: ReplyInfo, now: u32) {
        let ttl = rep.ttl;
        rep.capture_refs();
        rep.set_ttls_absolute(now);

        // see if each rrset is in the cache already, if not insert it
        for i in 0..rep.rrsets.len() {
            let mut rref = rep.refs[i].clone();
            if self.rrset.update(&mut rref, now) {
                // it was in the cache: reference the canonical copy
                rep.rrsets[i] = rref.key.clone();
            }
            rep.refs[i] = rref;
        }
        rep.sort_refs();

        if ttl == 0 {
            debug!("TTL 0: dropped msg from cache");
            return;
        }
        self.msg.insert(qinfo, hash, rep);
    }

    /// Answer a query from cache: exact reply, then DNAME synthesis, then
    /// CNAME, else `None`. DNAME is tried before CNAME so the CNAME a caller
    /// sees is always the one the DNAME would synthesize.
    pub fn lookup(
        &self,
        qname: &[u8],
        qtype: u16,
        qclass: u16,
        now: u32,
        region: &Region,
        scratch: &Region,
    ) -> Option<DnsMsg> {
        // the message cache has both NXDOMAIN and answer replies
        let q = QueryInfo::new(qname.to_vec(), qtype, qclass);
        let h = query_info_hash(&q);
        if let Some(e) = self.msg.lookup(&q, h) {
            if let Some(msg) = self.tomsg(&e, now, region, scratch) {
                return Some(msg);
            }
            // expired, or not all referenced rrsets were still valid
        }

        // a DNAME anywhere above the qname is preferred over a plain CNAME:
        // the CNAME is resynthesized and thus consistent with the DNAME
        if let Some((entry, snap)) = self.find_closest_of_type(qname, qclass, now, RR_TYPE_DNAME)
        {
            if let Some(msg) = synth_dname_msg(&entry, &snap, region, now, &q) {
                return Some(msg);
            }
        }

        // a CNAME at the qname itself
        if let Some((entry, snap)) = self.rrset.lookup(qname, RR_TYPE_CNAME, qclass, 0, now) {
            if let Some(msg) = cname_msg(&entry, &snap, region, now, &q) {
                return Some(msg);
            }
        }

        None
    }

    /// Find the closest enclosing delegation the cache knows: the nearest
    /// NS set walking root-ward from `qname`, its nameservers, whatever
    /// A/AAAA glue is cached for them, and -- when `want_msg` is set -- a
    /// referral reply carrying the NS, a DS or NSEC proof if present, and
    /// the glue in its additional section.
    ///
    /// Returns `None` when no NS is cached at any enclosing name; the caller
    /// falls back to its configured hints.
    pub fn find_delegation(
        &self,
        qname: &[u8],
        qtype: u16,
        qclass: u16,
        now: u32,
        region: &Region,
        want_msg: bool,
    ) -> Option<(DelegPt, Option<DnsMsg>)> {
        let (nskey, nssnap) = self.find_closest_of_type(qname, qclass, now, RR_TYPE_NS)?;

        let mut dp = match DelegPt::new(region, &nskey.rk.dname) {
            Some(dp) => dp,
            None => {
                warn!("find_delegation: out of region memory");
                return None;
            }
        };
        let mut msg = None;
        if want_msg {
            match create_referral(qname, qtype, qclass, region, &nskey, &nssnap, now) {
                Some(m) => msg = Some(m),
                None => {
                    warn!("find_delegation: out of region memory");
                    return None;
                }
            }
        }

        // seed the nameserver names out of the NS rdata
        for i in 0..nssnap.data.count {
            match ns_name(&nssnap.data, i) {
                Some(name) => {
                    if dp.add_ns(region, name).is_none() {
                        warn!("find_delegation: could not add nameserver");
                        break;
                    }
                }
                None => debug!("find_delegation: skipped malformed NS record"),
            }
        }

        // DS proves a secure delegation, NSEC at the parent proves there is
        // none; only a referral reply carries the proof
        if let Some(m) = msg.as_mut() {
            self.find_add_ds(region, m, &dp, qclass, now);
        }
        self.find_add_addrs(qclass, region, &mut dp, now, &mut msg);

        debug!("find_delegation returns {}", dp);
        Some((dp, msg))
    }

    /// Walk `qname` root-ward and return the first cached set of
    /// `searchtype`. Each probe takes and releases its own locks.
    fn find_closest_of_type(
        &self,
        qname: &[u8],
        qclass: u16,
        now: u32,
        searchtype: u16,
    ) -> Option<(Arc<RrsetEntry>, RrsetSnapshot)> {
        let mut name = qname;
        loop {
            if let Some(hit) = self.rrset.lookup(name, searchtype, qclass, 0, now) {
                return Some(hit);
            }
            name = dname_strip_label(name)?;
        }
    }

    /// Reassemble a cached reply into a caller-owned message. Fails (as a
    /// miss) when the reply has expired, any referenced set has been
    /// replaced, or the region runs out.
    fn tomsg(
        &self,
        e: &MsgEntry,
        now: u32,
        region: &Region,
        scratch: &Region,
    ) -> Option<DnsMsg> {
        let r = e.reply();
        if r.ttl <= now {
            return None;
        }
        let mut msg = DnsMsg::gen(
            region,
            &e.qinfo.qname,
            e.qinfo.qtype,
            e.qinfo.qclass,
            r.rrsets.len(),
        )?;
        msg.rep.flags = r.flags;
        msg.rep.qdcount = r.qdcount;
        msg.rep.ttl = r.ttl - now;
        msg.rep.security = r.security;
        msg.rep.an_numrrsets = r.an_numrrsets;
        msg.rep.ns_numrrsets = r.ns_numrrsets;
        msg.rep.ar_numrrsets = r.ar_numrrsets;

        // lock every referenced set in the stored order and check that it is
        // still the version this reply was built from
        let mut guards = Vec::with_capacity(r.refs.len());
        for rref in &r.refs {
            let g = rref.key.state().read();
            if g.id != rref.id {
                return None;
            }
            guards.push(g);
        }
        // snapshot the payloads in section order while everything is held
        let mut snaps = Vec::with_capacity(r.rrsets.len());
        for ent in &r.rrsets {
            let j = r.refs.iter().position(|rr| Arc::ptr_eq(&rr.key, ent))?;
            snaps.push((r.refs[j].id, guards[j].data.clone()));
        }
        drop(guards);

        for (ent, (id, data)) in r.rrsets.iter().zip(&snaps) {
            msg.rep
                .rrsets
                .push(OwnedRrset::copy(&ent.rk, ent.hash, *id, data, region, now)?);
        }

        // serving the reply warms its sets; purely advisory, so a full
        // scratch region only skips the touch
        let refs = r.refs.clone();
        drop(r);
        if scratch
            .charge(refs.len() * mem::size_of::<RrsetRef>())
            .is_some()
        {
            self.rrset.touch(&refs);
        } else {
            debug!("lookup: scratch region full, skipping cache touch");
        }
        Some(msg)
    }

    /// Add the DS at the zone cut to the referral's authority section, or the
    /// NSEC at the same owner when no DS is cached. This is a referral, so
    /// the parent-side NSEC is wanted; the apex key flag is not consulted.
    fn find_add_ds(
        &self,
        region: &Region,
        msg: &mut DnsMsg,
        dp: &DelegPt,
        qclass: u16,
        now: u32,
    ) {
        let hit = self
            .rrset
            .lookup(&dp.name, RR_TYPE_DS, qclass, 0, now)
            .or_else(|| self.rrset.lookup(&dp.name, RR_TYPE_NSEC, qclass, 0, now));
        if let Some((e, snap)) = hit {
            match OwnedRrset::copy(&e.rk, e.hash, snap.id, &snap.data, region, now) {
                Some(c) => {
                    msg.rep.rrsets.push(c);
                    msg.rep.ns_numrrsets += 1;
                }
                None => debug!("find_delegation: no region space for DS/NSEC"),
            }
        }
    }

    /// Attach cached A and AAAA sets to every nameserver in the delegation,
    /// and append them to the referral's additional section when one is
    /// being built. Each lookup holds its locks only for the snapshot.
    fn find_add_addrs(
        &self,
        qclass: u16,
        region: &Region,
        dp: &mut DelegPt,
        now: u32,
        msg: &mut Option<DnsMsg>,
    ) {
        for i in 0..dp.nslist.len() {
            let name = dp.nslist[i].name.clone();
            for rtype in [RR_TYPE_A, RR_TYPE_AAAA] {
                if let Some((e, snap)) = self.rrset.lookup(&name, rtype, qclass, 0, now) {
                    match OwnedRrset::copy(&e.rk, e.hash, snap.id, &snap.data, region, now) {
                        Some(c) => {
                            if let Some(m) = msg.as_mut() {
                                addr_to_additional(&e, &snap, region, m, now);
                            }
                            if rtype == RR_TYPE_A {
                                dp.add_a(&name, c);
                            } else {
                                dp.add_aaaa(&name, c);
                            }
                        }
                        None => warn!("find_delegation: no region space for glue"),
                    }
                }
            }
        }
    }
}

/// Parse nameserver `i` out of an NS payload: the rdata behind its length
/// prefix must be exactly one valid name.
fn ns_name(data: &PackedRrset, i: usize) -> Option<&[u8]> {
    let rr = data.rr(i);
    if rr.len() < 3 {
        return None;
    }
    let len = BigEndian::read_u16(&rr[..2]) as usize;
    if rr.len() != len + 2 {
        return None;
    }
    let name = &rr[2..];
    if dname_valid(name) != len {
        return None;
    }
    Some(name)
}

/// Append an address set copy to a referral's additional section; on region
/// exhaustion the referral simply stays without it.
fn addr_to_additional(
    e: &Arc<RrsetEntry>,
    snap: &RrsetSnapshot,
    region: &Region,
    msg: &mut DnsMsg,
    now: u32,
) {
    match OwnedRrset::copy(&e.rk, e.hash, snap.id, &snap.data, region, now) {
        Some(c) => {
            msg.rep.rrsets.push(c);
            msg.rep.ar_numrrsets += 1;
        }
        None => debug!("find_delegation: no region space for additional glue"),
    }
}

/// The referral skeleton: question echoed, QR set, the NS set in the
/// authority section, room reserved for DS/NSEC and per-nameserver glue.
fn create_referral(
    qname: &[u8],
    qtype: u16,
    qclass: u16,
    region: &Region,
    nskey: &Arc<RrsetEntry>,
    nssnap: &RrsetSnapshot,
    now: u32,
) -> Option<DnsMsg> {
    let mut msg = DnsMsg::gen(
        region,
        qname,
        qtype,
        qclass,
        2 + 2 * nssnap.data.count,
    )?;
    msg.rep.flags = BIT_QR; // a reply, but not an authoritative one
    msg.rep.qdcount = 1;
    let ns = OwnedRrset::copy(&nskey.rk, nskey.hash, nssnap.id, &nssnap.data, region, now)?;
    msg.rep.rrsets.push(ns);
    msg.rep.ns_numrrsets = 1;
    Some(msg)
}

/// One-set reply around a cached CNAME.
fn cname_msg(
    entry: &Arc<RrsetEntry>,
    snap: &RrsetSnapshot,
    region: &Region,
    now: u32,
    q: &QueryInfo,
) -> Option<DnsMsg> {
    let mut msg = DnsMsg::gen(region, &q.qname, q.qtype, q.qclass, 1)?;
    msg.rep.flags = BIT_QR; // reply, no AA, no error
    msg.rep.qdcount = 1;
    msg.rep.ttl = snap.data.ttl.saturating_sub(now);
    msg.rep.an_numrrsets = 1;
    msg.rep
        .rrsets
        .push(OwnedRrset::copy(&entry.rk, entry.hash, snap.id, &snap.data, region, now)?);
    Some(msg)
}

/// Synthesize the DNAME + CNAME reply for a qname below a cached DNAME.
///
/// The CNAME owner is the qname; its target is the qname with the DNAME
/// owner suffix swapped for the DNAME target. When that name would exceed
/// the 255-octet limit the reply carries the DNAME alone with RCODE
/// YXDOMAIN, per RFC6672.
fn synth_dname_msg(
    entry: &Arc<RrsetEntry>,
    snap: &RrsetSnapshot,
    region: &Region,
    now: u32,
    q: &QueryInfo,
) -> Option<DnsMsg> {
    let mut msg = DnsMsg::gen(region, &q.qname, q.qtype, q.qclass, 2)?;
    msg.rep.flags = BIT_QR; // reply, no AA, no error
    msg.rep.qdcount = 1;
    msg.rep.ttl = snap.data.ttl.saturating_sub(now);
    msg.rep.an_numrrsets = 1;
    msg.rep
        .rrsets
        .push(OwnedRrset::copy(&entry.rk, entry.hash, snap.id, &snap.data, region, now)?);

    let dtarg = get_cname_target(&entry.rk, &snap.data)?;
    // the owner is a suffix of the qname: it was found by stripping labels
    let keep = q.qname.len() - entry.rk.dname.len();
    let newlen = keep + dtarg.len();
    if newlen > MAX_DOMAIN_LEN {
        msg.rep.flags |= RCODE_YXDOMAIN;
        return Some(msg);
    }
    let mut newname = region.alloc(newlen)?;
    // qname front (without the DNAME owner) ++ DNAME target
    newname[..keep].copy_from_slice(&q.qname[..keep]);
    newname[keep..].copy_from_slice(dtarg);

    let ck = RrsetKey::new(region.alloc_init(&q.qname)?, RR_TYPE_CNAME, entry.rk.class, 0);
    let hash = rrset_key_hash(&ck);
    let data = PackedRrset::from_rrs(
        &[(&newname, 0)], // 0 for the synthesized CNAME TTL
        &[],
        RrsetTrust::AnsNoAa,
        SecStatus::Unchecked,
    );
    region.charge(data.sizeof())?;
    msg.rep.ttl = data.ttl;
    msg.rep.rrsets.push(OwnedRrset {
        rk: ck,
        hash,
        id: 0,
        data,
    });
    msg.rep.an_numrrsets += 1;
    Some(msg)
}
