// useful helpers for tests: wire-form names and question tuples without the
// byte-literal noise
#[macro_export]
macro_rules! dname {
    ($text:expr) => {
        $crate::dname::dname_from_text($text).unwrap()
    };
}

#[macro_export]
macro_rules! qinfo {
    ($text:expr, $qtype:expr) => {
        $crate::reply::QueryInfo::new($crate::dname!($text), $qtype, $crate::rfc1035::CLASS_IN)
    };
}
