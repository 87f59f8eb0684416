//! Delegation point: the parent-side boundary where authority is handed off.
//!
//! Built by the delegation finder from a cached NS set, then decorated with
//! whatever A/AAAA glue the cache holds for the nameserver names. The
//! structure is region-owned caller data; it references no cache memory.
use std::cmp::Ordering;
use std::fmt;
use std::mem;

use crate::dname::{dname_to_text, query_dname_compare};
use crate::region::Region;
use crate::reply::OwnedRrset;

/// One nameserver of a delegation: its name and whatever address sets the
/// cache could supply. A nameserver with neither address set still needs
/// resolving before it can be queried.
#[derive(Debug)]
pub struct DelegPtNs {
    pub name: Vec<u8>,
    pub a: Option<OwnedRrset>,
    pub aaaa: Option<OwnedRrset>,
}

impl DelegPtNs {
    /// Whether this nameserver can be targeted without further lookups.
    pub fn resolved(&self) -> bool {
        self.a.is_some() || self.aaaa.is_some()
    }
}

/// A delegation point under construction: the zone name and its nameservers
/// in the order the NS set lists them.
#[derive(Debug)]
pub struct DelegPt {
    pub name: Vec<u8>,
    pub nslist: Vec<DelegPtNs>,
}

impl DelegPt {
    pub fn new(region: &Region, name: &[u8]) -> Option<Self> {
        let name = region.alloc_init(name)?;
        region.charge(mem::size_of::<DelegPt>())?;
        Some(DelegPt {
            name,
            nslist: Vec::new(),
        })
    }

    /// Add a nameserver by name; duplicates are merged.
    pub fn add_ns(&mut self, region: &Region, name: &[u8]) -> Option<()> {
        if self.find_ns(name).is_some() {
            return Some(());
        }
        let name = region.alloc_init(name)?;
        region.charge(mem::size_of::<DelegPtNs>())?;
        self.nslist.push(DelegPtNs {
            name,
            a: None,
            aaaa: None,
        });
        Some(())
    }

    pub fn find_ns(&self, name: &[u8]) -> Option<&DelegPtNs> {
        self.nslist
            .iter()
            .find(|ns| query_dname_compare(&ns.name, name) == Ordering::Equal)
    }

    fn find_ns_mut(&mut self, name: &[u8]) -> Option<&mut DelegPtNs> {
        self.nslist
            .iter_mut()
            .find(|ns| query_dname_compare(&ns.name, name) == Ordering::Equal)
    }

    /// Attach an A set to the named nameserver; false when the name is not
    /// part of this delegation.
    pub fn add_a(&mut self, ns_name: &[u8], rrset: OwnedRrset) -> bool {
        match self.find_ns_mut(ns_name) {
            Some(ns) => {
                ns.a = Some(rrset);
                true
            }
            None => false,
        }
    }

    /// Attach an AAAA set to the named nameserver.
    pub fn add_aaaa(&mut self, ns_name: &[u8], rrset: OwnedRrset) -> bool {
        match self.find_ns_mut(ns_name) {
            Some(ns) => {
                ns.aaaa = Some(rrset);
                true
            }
            None => false,
        }
    }

    pub fn ns_count(&self) -> usize {
        self.nslist.len()
    }
}

impl fmt::Display for DelegPt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delegation {}:", dname_to_text(&self.name))?;
        for ns in &self.nslist {
            write!(f, " {}", dname_to_text(&ns.name))?;
            if ns.a.is_some() {
                write!(f, "+A")?;
            }
            if ns.aaaa.is_some() {
                write!(f, "+AAAA")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dname;
    use crate::rfc1035::{CLASS_IN, RR_TYPE_A};
    use crate::rrset::{rrset_key_hash, PackedRrset, RrsetKey, RrsetTrust, SecStatus};

    fn glue(name: &str) -> OwnedRrset {
        let rk = RrsetKey::new(dname!(name), RR_TYPE_A, CLASS_IN, 0);
        let hash = rrset_key_hash(&rk);
        let data = PackedRrset::from_rrs(
            &[(&[192, 0, 2, 1], 60)],
            &[],
            RrsetTrust::Glue,
            SecStatus::Unchecked,
        );
        OwnedRrset {
            rk,
            hash,
            id: 1,
            data,
        }
    }

    #[test]
    fn build_and_attach_glue() {
        let region = Region::new();
        let mut dp = DelegPt::new(&region, &dname!("example.com.")).unwrap();
        dp.add_ns(&region, &dname!("ns1.example.com.")).unwrap();
        dp.add_ns(&region, &dname!("ns2.example.com.")).unwrap();
        // duplicate names are merged
        dp.add_ns(&region, &dname!("NS1.example.com.")).unwrap();
        assert_eq!(dp.ns_count(), 2);

        assert!(dp.add_a(&dname!("ns1.example.com."), glue("ns1.example.com.")));
        assert!(!dp.add_a(&dname!("other.example.net."), glue("other.example.net.")));
        assert!(dp.nslist[0].resolved());
        assert!(!dp.nslist[1].resolved());
    }

    #[test]
    fn region_bounds_the_build() {
        let region = Region::with_limit(8);
        // the 13-octet zone name already exceeds the budget
        assert!(DelegPt::new(&region, &dname!("example.com.")).is_none());
    }

    #[test]
    fn display_marks_resolved_servers() {
        let region = Region::new();
        let mut dp = DelegPt::new(&region, &dname!("example.com.")).unwrap();
        dp.add_ns(&region, &dname!("ns1.example.com.")).unwrap();
        dp.add_a(&dname!("ns1.example.com."), glue("ns1.example.com."));
        let s = dp.to_string();
        assert!(s.contains("example.com."));
        assert!(s.contains("ns1.example.com.+A"));
    }
}
