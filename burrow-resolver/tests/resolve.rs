//! End-to-end resolution scenarios against a scripted fake authoritative
//! server, exercising the real dispatchers over loopback sockets.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::time::Duration;

use burrow_cache::CacheEntry;
use burrow_proto::{RdataType, Trust};
use burrow_resolver::{FetchOpts, FetchOutcome, Resolver, ResolverConfig};
use pretty_assertions::assert_eq;
use support::{
    a_rdataset, hinted_view, init_tracing,
    mock_server::{MockAction, MockDnsServer, ResponseTemplate},
    name, ns_rdataset, soa_rdataset,
};

async fn resolver_for(mock: &MockDnsServer, lifetime_secs: u64) -> Resolver {
    init_tracing();
    let view = hinted_view("127.0.0.1");
    let config = ResolverConfig {
        buckets: 2,
        server_port: mock.port(),
        lifetime_secs,
        ..ResolverConfig::default()
    };
    let resolver = Resolver::create(view, config, None)
        .await
        .unwrap_or_else(|error| panic!("resolver create: {error}"));
    resolver.freeze();
    resolver
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simple_authoritative_answer() {
    let mock = MockDnsServer::builder()
        .reply(ResponseTemplate::answer(
            true,
            vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
        ))
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::Success);
    assert_eq!(done.foundname, Some(name("www.example.com")));
    let rdataset = done.rdataset.expect("answer rdataset");
    assert_eq!(rdataset.rtype, RdataType::A);
    assert_eq!(rdataset.rdatas.len(), 1);
    assert_eq!(rdataset.trust, Trust::AuthAnswer);

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delegation_chain_is_followed_and_cached() {
    let mock = MockDnsServer::builder()
        // Root refers us to com.
        .reply(
            ResponseTemplate::default()
                .with_authority(vec![(name("com"), ns_rdataset(172_800, "a.gtld-servers.net"))])
                .with_additional(vec![(
                    name("a.gtld-servers.net"),
                    a_rdataset(172_800, "127.0.0.1"),
                )]),
        )
        // com refers us to example.com with glue.
        .reply(
            ResponseTemplate::default()
                .with_authority(vec![(
                    name("example.com"),
                    ns_rdataset(172_800, "ns.example.com"),
                )])
                .with_additional(vec![(
                    name("ns.example.com"),
                    a_rdataset(172_800, "127.0.0.1"),
                )]),
        )
        // The authoritative answer.
        .reply(ResponseTemplate::answer(
            true,
            vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
        ))
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::Success);
    assert_eq!(mock.udp_queries(), 3);

    // Both referral NS sets were cached as glue, the answer as an
    // authoritative answer.
    let now = burrow_cache::unix_now();
    let cache = resolver.view().cache();
    match cache.get(&name("com"), RdataType::Ns, now) {
        Some(CacheEntry::Positive(rs)) => assert_eq!(rs.trust, Trust::Glue),
        other => panic!("com NS not cached: {other:?}"),
    }
    match cache.get(&name("example.com"), RdataType::Ns, now) {
        Some(CacheEntry::Positive(rs)) => assert_eq!(rs.trust, Trust::Glue),
        other => panic!("example.com NS not cached: {other:?}"),
    }
    match cache.get(&name("ns.example.com"), RdataType::A, now) {
        Some(CacheEntry::Positive(rs)) => assert_eq!(rs.trust, Trust::Glue),
        other => panic!("glue not cached: {other:?}"),
    }
    match cache.get(&name("www.example.com"), RdataType::A, now) {
        Some(CacheEntry::Positive(rs)) => assert_eq!(rs.trust, Trust::AuthAnswer),
        other => panic!("answer not cached: {other:?}"),
    }

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nxdomain_is_negatively_cached() {
    let mock = MockDnsServer::builder()
        .reply(
            ResponseTemplate::rcode(burrow_proto::Rcode::NxDomain)
                .with_authority(vec![(name("example.com"), soa_rdataset(3600, 300))]),
        )
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::NcacheNxDomain);

    // The negative entry covers every type at the name.
    let now = burrow_cache::unix_now();
    let cache = resolver.view().cache();
    match cache.get(&name("www.example.com"), RdataType::A, now) {
        Some(CacheEntry::Negative(negative)) => {
            assert_eq!(negative.covers, RdataType::Any);
        }
        other => panic!("expected negative entry: {other:?}"),
    }
    match cache.get(&name("www.example.com"), RdataType::Aaaa, now) {
        Some(CacheEntry::Negative(_)) => {}
        other => panic!("negative entry should cover AAAA too: {other:?}"),
    }

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresponsive_servers_time_out() {
    let mock = MockDnsServer::builder()
        .fallback(MockAction::Drop)
        .build()
        .await;
    let resolver = resolver_for(&mock, 3).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::TimedOut);
    assert!(mock.udp_queries() >= 1);

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_truncation_upgrades_to_tcp() {
    let mock = MockDnsServer::builder()
        .reply(ResponseTemplate::truncated())
        .reply(ResponseTemplate::answer(
            true,
            vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
        ))
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::Success);
    assert_eq!(mock.udp_queries(), 1);
    assert_eq!(mock.tcp_connects(), 1);

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_formerr_disables_edns0_and_retries() {
    let mock = MockDnsServer::builder()
        .reply(ResponseTemplate::rcode(burrow_proto::Rcode::FormErr))
        .reply(ResponseTemplate::answer(
            true,
            vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
        ))
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::Success);
    // First try advertised EDNS0; the retry did not.
    assert_eq!(mock.edns_seen(), vec![true, false]);

    // The server's dislike of EDNS0 is remembered in the address
    // database.
    let addrinfo = resolver.adb().find_addrinfo(mock.addr());
    assert_eq!(
        addrinfo.flags() & burrow_adb::flags::NOEDNS0,
        burrow_adb::flags::NOEDNS0
    );

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_joined_fetches_share_one_context() {
    let mock = MockDnsServer::builder()
        .reply(
            ResponseTemplate::answer(
                true,
                vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
            )
            .with_delay(Duration::from_millis(200)),
        )
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut first = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let mut second = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();

    let first_done = first.done().await;
    let second_done = second.done().await;

    assert_eq!(first_done.outcome, FetchOutcome::Success);
    assert_eq!(second_done.outcome, FetchOutcome::Success);
    assert_eq!(first_done.foundname, second_done.foundname);
    assert_eq!(first_done.rdataset, second_done.rdataset);
    // One shared context means one query on the wire.
    assert_eq!(mock.udp_queries(), 1);

    resolver.destroy_fetch(first);
    resolver.destroy_fetch(second);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_delivers_exactly_one_canceled_event() {
    let mock = MockDnsServer::builder()
        .fallback(MockAction::Drop)
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();

    resolver.cancel_fetch(&fetch);
    let done = fetch.done().await;
    assert_eq!(done.outcome, FetchOutcome::Canceled);

    // Cancel followed by destroy behaves like destroy alone: no second
    // delivery, no panic.
    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_cancels_and_drains() {
    let mock = MockDnsServer::builder()
        .fallback(MockAction::Drop)
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();

    resolver.shutdown();
    let done = fetch.done().await;
    assert_eq!(done.outcome, FetchOutcome::Canceled);
    resolver.destroy_fetch(fetch);

    resolver.when_shutdown().await;
    // A second waiter sees the already-drained state immediately.
    resolver.when_shutdown().await;

    // New fetches are refused during shutdown.
    let result = resolver.create_fetch(
        &name("www.example.org"),
        RdataType::A,
        None,
        &[],
        FetchOpts::default(),
    );
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unshared_fetches_get_separate_contexts() {
    let mock = MockDnsServer::builder()
        .reply(
            ResponseTemplate::answer(
                true,
                vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
            )
            .with_delay(Duration::from_millis(100)),
        )
        .reply(ResponseTemplate::answer(
            true,
            vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
        ))
        .build()
        .await;
    let resolver = resolver_for(&mock, 90).await;

    let mut first = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::UNSHARED,
        )
        .unwrap();
    let mut second = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::UNSHARED,
        )
        .unwrap();

    assert_eq!(first.done().await.outcome, FetchOutcome::Success);
    assert_eq!(second.done().await.outcome, FetchOutcome::Success);
    // Two contexts, two queries.
    assert_eq!(mock.udp_queries(), 2);

    resolver.destroy_fetch(first);
    resolver.destroy_fetch(second);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_only_policy_queries_forwarder_with_rd() {
    init_tracing();
    let mock = MockDnsServer::builder()
        .reply(ResponseTemplate::answer(
            false,
            vec![(name("www.example.com"), a_rdataset(3600, "93.184.216.34"))],
        ))
        .build()
        .await;

    let view = hinted_view("127.0.0.1");
    let config = ResolverConfig {
        buckets: 2,
        server_port: mock.port(),
        ..ResolverConfig::default()
    };
    let resolver = Resolver::create(view, config, None)
        .await
        .unwrap_or_else(|error| panic!("resolver create: {error}"));
    resolver.set_forwarders(vec![mock.addr()]).unwrap();
    resolver
        .set_forward_policy(burrow_resolver::ForwardPolicy::Only)
        .unwrap();
    resolver.freeze();

    let mut fetch = resolver
        .create_fetch(
            &name("www.example.com"),
            RdataType::A,
            None,
            &[],
            FetchOpts::default(),
        )
        .unwrap();
    let done = fetch.done().await;

    assert_eq!(done.outcome, FetchOutcome::Success);
    // Forwarders are asked to recurse on our behalf.
    assert_eq!(mock.rd_seen(), vec![true]);
    // A non-authoritative forwarder answer carries plain answer trust.
    assert_eq!(done.rdataset.map(|rs| rs.trust), Some(Trust::Answer));

    resolver.destroy_fetch(fetch);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_freeze_gates_configuration_and_fetching() {
    init_tracing();
    let mock = MockDnsServer::builder().build().await;
    let view = hinted_view("127.0.0.1");
    let config = ResolverConfig {
        buckets: 1,
        server_port: mock.port(),
        ..ResolverConfig::default()
    };
    let resolver = Resolver::create(view, config, None)
        .await
        .unwrap_or_else(|error| panic!("resolver create: {error}"));

    // Fetches require a frozen resolver.
    assert!(
        resolver
            .create_fetch(
                &name("www.example.com"),
                RdataType::A,
                None,
                &[],
                FetchOpts::default(),
            )
            .is_err()
    );

    resolver.freeze();

    // Configuration is immutable once frozen.
    assert!(resolver.set_forwarders(vec![mock.addr()]).is_err());
    assert!(
        resolver
            .set_forward_policy(burrow_resolver::ForwardPolicy::First)
            .is_err()
    );
}
