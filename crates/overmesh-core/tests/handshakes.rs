//! End-to-end handshake scenarios over loopback UDP with mock TUN
//! devices: the happy path, a decoy responder with a foreign CA,
//! simultaneous initiation, and recovery from an unclean restart.

mod common;

use std::time::Duration;

use common::{free_port, start_node, static_entry, wait_for, TestCa};

#[tokio::test(flavor = "multi_thread")]
async fn test_good_handshake_carries_payload() {
    let ca = TestCa::new();

    let mut b = start_node(&ca, "b", "10.128.0.2/24", free_port(), |_| {}).await;
    let b_udp = b.udp;
    let a = start_node(&ca, "a", "10.128.0.1/24", free_port(), |s| {
        static_entry(s, "10.128.0.2", &[b_udp]);
    })
    .await;

    a.send_payload(b.vpn_ip, b"Hi").await;

    let payload = b
        .recv_payload(Duration::from_secs(5))
        .await
        .expect("payload should arrive on b's tun");
    assert_eq!(payload, b"Hi");

    // exactly one tunnel on each side
    assert!(
        wait_for(Duration::from_secs(2), || {
            a.control.tunnel_count() == 1 && b.control.tunnel_count() == 1
        })
        .await
    );
    assert_eq!(a.control.host_count(), 1);
    assert_eq!(b.control.host_count(), 1);
    assert!(a.control.has_tunnel_to(b.vpn_ip));
    assert_eq!(a.control.pending_count(), 0);

    a.control.stop().await;
    b.control.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_responder_is_rejected() {
    let ca = TestCa::new();
    let foreign_ca = TestCa::new();

    // A decoy claiming b's overlay address, but signed by a CA we do
    // not trust
    let evil = start_node(&foreign_ca, "evil", "10.128.0.2/24", free_port(), |_| {}).await;
    let mut b = start_node(&ca, "b", "10.128.0.2/24", free_port(), |_| {}).await;

    let (evil_udp, b_udp) = (evil.udp, b.udp);
    let a = start_node(&ca, "a", "10.128.0.1/24", free_port(), |s| {
        // the decoy's address is tried alongside the real one
        static_entry(s, "10.128.0.2", &[evil_udp, b_udp]);
    })
    .await;

    a.send_payload(b.vpn_ip, b"Hi").await;

    let payload = b
        .recv_payload(Duration::from_secs(5))
        .await
        .expect("payload should arrive on the real b");
    assert_eq!(payload, b"Hi");

    // a's one tunnel is to the real b, authenticated by its cert
    let a_intf = a.control.interface();
    let hi = a_intf.hostmap.query_vpn_ip(b.vpn_ip).unwrap();
    assert_eq!(hi.peer_cert().unwrap().details.name, "b");

    // the decoy never got a tunnel out of us
    assert_eq!(evil.control.tunnel_count(), 0);

    a.control.stop().await;
    b.control.stop().await;
    evil.control.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simultaneous_initiation_converges_to_one_tunnel() {
    let ca = TestCa::new();
    let port_a = free_port();
    let port_b = free_port();
    let addr_a: std::net::SocketAddr = format!("127.0.0.1:{}", port_a).parse().unwrap();
    let addr_b: std::net::SocketAddr = format!("127.0.0.1:{}", port_b).parse().unwrap();

    let mut b = start_node(&ca, "b", "10.128.0.2/24", port_b, |s| {
        static_entry(s, "10.128.0.1", &[addr_a]);
    })
    .await;
    let mut a = start_node(&ca, "a", "10.128.0.1/24", port_a, |s| {
        static_entry(s, "10.128.0.2", &[addr_b]);
    })
    .await;

    // both sides dial at once
    a.send_payload(b.vpn_ip, b"from a").await;
    b.send_payload(a.vpn_ip, b"from b").await;

    let to_b = b
        .recv_payload(Duration::from_secs(5))
        .await
        .expect("a's payload must reach b");
    assert_eq!(to_b, b"from a");
    let to_a = a
        .recv_payload(Duration::from_secs(5))
        .await
        .expect("b's payload must reach a");
    assert_eq!(to_a, b"from b");

    // keep the surviving tunnel busy while the race loser idles out
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    let mut settled = false;
    while std::time::Instant::now() < deadline {
        a.send_payload(b.vpn_ip, b"keepalive").await;
        b.send_payload(a.vpn_ip, b"keepalive").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        a.drain_delivered();
        b.drain_delivered();
        if a.control.tunnel_count() == 1 && b.control.tunnel_count() == 1 {
            settled = true;
            break;
        }
    }
    assert!(settled, "exactly one tunnel must remain on each side");

    // and that tunnel still carries traffic both ways
    a.drain_delivered();
    b.drain_delivered();
    a.send_payload(b.vpn_ip, b"still works").await;
    b.send_payload(a.vpn_ip, b"still works").await;
    assert_eq!(
        b.recv_payload(Duration::from_secs(5)).await.unwrap(),
        b"still works"
    );
    assert_eq!(
        a.recv_payload(Duration::from_secs(5)).await.unwrap(),
        b"still works"
    );

    a.control.stop().await;
    b.control.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unclean_restart_rebuilds_tunnel() {
    let ca = TestCa::new();

    let mut b = start_node(&ca, "b", "10.128.0.2/24", free_port(), |_| {}).await;
    let b_udp = b.udp;
    let mut a = start_node(&ca, "a", "10.128.0.1/24", free_port(), |s| {
        static_entry(s, "10.128.0.2", &[b_udp]);
    })
    .await;

    a.send_payload(b.vpn_ip, b"Hi").await;
    assert_eq!(
        b.recv_payload(Duration::from_secs(5)).await.unwrap(),
        b"Hi"
    );

    // a forgets everything, as a crashed-and-restarted process would
    a.control.drop_all_tunnels();
    assert_eq!(a.control.tunnel_count(), 0);

    // the next packet handshakes fresh
    a.send_payload(b.vpn_ip, b"Hi again").await;
    let payload = b
        .recv_payload(Duration::from_secs(5))
        .await
        .expect("payload should arrive over the rebuilt tunnel");
    assert_eq!(payload, b"Hi again");

    // b's stale tunnel is collapsed, leaving one live tunnel per side;
    // keep the fresh one busy so only the stale one idles out
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    let mut settled = false;
    while std::time::Instant::now() < deadline {
        a.send_payload(b.vpn_ip, b"keepalive").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        b.drain_delivered();
        if a.control.tunnel_count() == 1 && b.control.tunnel_count() == 1 {
            settled = true;
            break;
        }
    }
    assert!(settled, "stale tunnel must be torn down");

    a.control.stop().await;
    b.control.stop().await;
}
