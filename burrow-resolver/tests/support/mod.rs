//! Shared test helpers.

pub mod mock_server;

use std::sync::Arc;

use burrow_cache::View;
use burrow_proto::{Name, Rclass, Rdata, RdataType, Rdataset};

/// Installs a test-writer subscriber once; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[must_use]
pub fn name(s: &str) -> Name {
    s.parse().unwrap_or_else(|_| panic!("bad test name: {s}"))
}

#[must_use]
pub fn a_rdataset(ttl: u32, addr: &str) -> Rdataset {
    let mut rs = Rdataset::new(RdataType::A, ttl);
    rs.rdatas
        .push(Rdata::A(addr.parse().unwrap_or_else(|_| panic!("bad addr"))));
    rs
}

#[must_use]
pub fn ns_rdataset(ttl: u32, target: &str) -> Rdataset {
    let mut rs = Rdataset::new(RdataType::Ns, ttl);
    rs.rdatas.push(Rdata::Ns(name(target)));
    rs
}

#[must_use]
pub fn soa_rdataset(ttl: u32, minimum: u32) -> Rdataset {
    let mut rs = Rdataset::new(RdataType::Soa, ttl);
    rs.rdatas.push(Rdata::Soa {
        mname: name("ns.example.com"),
        rname: name("hostmaster.example.com"),
        serial: 2_024_010_100,
        refresh: 7200,
        retry: 3600,
        expire: 1_209_600,
        minimum,
    });
    rs
}

/// A view whose root hints point the resolver at `server_ip` (the mock
/// server's loopback address).
#[must_use]
pub fn hinted_view(server_ip: &str) -> Arc<View> {
    let view = View::new(Rclass::In);
    view.load_hint(&Name::root(), ns_rdataset(518_400, "a.root-servers.net"));
    view.load_hint(&name("a.root-servers.net"), a_rdataset(518_400, server_ip));
    Arc::new(view)
}
