//! Matrix switcher integration tests
//!
//! Drives `MatrixClient` against a mock switcher over real TCP and UDP sockets.
//! These tests verify:
//! - Exact wire bytes for a routing command
//! - OK / ERR / unrecognized reply handling
//! - Timeouts and refused connections are reported, not raised

mod mock_servers;

use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use mock_servers::MockMatrix;
use venue_av_control::bus::{create_bus, BusEvent, SharedBus};
use venue_av_control::config::RoutingConfig;
use venue_av_control::devices::{MatrixClient, MatrixConfiguration, MatrixProtocol};
use venue_av_control::error::{ControlError, ErrorKind};

// =============================================================================
// Test utilities
// =============================================================================

fn fast_routing(require_ok: bool) -> RoutingConfig {
    RoutingConfig {
        tcp_timeout_ms: 300,
        udp_timeout_ms: 300,
        require_ok,
    }
}

fn test_client(require_ok: bool) -> (MatrixClient, broadcast::Receiver<BusEvent>) {
    let bus: SharedBus = create_bus();
    let rx = bus.subscribe();
    (MatrixClient::new(fast_routing(require_ok), bus), rx)
}

fn tcp_config(mock: &MockMatrix) -> MatrixConfiguration {
    let mut config = MatrixConfiguration::new("127.0.0.1", MatrixProtocol::Tcp);
    config.tcp_port = mock.tcp_port();
    config
}

fn udp_config(mock: &MockMatrix) -> MatrixConfiguration {
    let mut config = MatrixConfiguration::new("127.0.0.1", MatrixProtocol::Udp);
    config.udp_port = mock.udp_port();
    config
}

/// A local port with nothing listening on it
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// =============================================================================
// TCP
// =============================================================================

mod tcp {
    use super::*;

    #[tokio::test]
    async fn route_writes_exact_command_and_accepts_ok() {
        let mock = MockMatrix::start(Some("OK\r\n")).await;
        let (client, mut rx) = test_client(false);

        let result = client.route(&tcp_config(&mock), 3, 2).await.unwrap();

        assert!(result.success, "unexpected failure: {:?}", result.error);
        assert_eq!(result.command, "3X2.");
        assert_eq!(result.response.as_deref(), Some("OK"));
        assert!(result.error_kind.is_none());
        assert_eq!(mock.received(), vec![b"3X2.\r\n".to_vec()]);

        match rx.try_recv().unwrap() {
            BusEvent::MatrixRouted {
                address,
                input,
                output,
                success,
            } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!((input, output), (3, 2));
                assert!(success);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        mock.stop().await;
    }

    #[tokio::test]
    async fn err_reply_is_a_protocol_failure() {
        let mock = MockMatrix::start(Some("ERR\r\n")).await;
        let (client, _rx) = test_client(false);

        let result = client.route(&tcp_config(&mock), 1, 4).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Protocol));
        assert_eq!(result.response.as_deref(), Some("ERR"));

        mock.stop().await;
    }

    #[tokio::test]
    async fn reply_without_ok_is_accepted_when_lenient() {
        let mock = MockMatrix::start(Some("3X2.\r\n")).await;
        let (client, _rx) = test_client(false);

        let result = client.route(&tcp_config(&mock), 3, 2).await.unwrap();

        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("3X2."));

        mock.stop().await;
    }

    #[tokio::test]
    async fn reply_without_ok_fails_when_ok_required() {
        let mock = MockMatrix::start(Some("3X2.\r\n")).await;
        let (client, _rx) = test_client(true);

        let result = client.route(&tcp_config(&mock), 3, 2).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Protocol));

        mock.stop().await;
    }

    #[tokio::test]
    async fn silent_switcher_times_out() {
        let mock = MockMatrix::start(None).await;
        let (client, mut rx) = test_client(false);

        let started = Instant::now();
        let result = client.route(&tcp_config(&mock), 2, 1).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.response.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        // The command still reached the switcher
        assert_eq!(mock.received(), vec![b"2X1.\r\n".to_vec()]);

        match rx.try_recv().unwrap() {
            BusEvent::MatrixRouted { success, .. } => assert!(!success),
            other => panic!("unexpected event: {:?}", other),
        }

        mock.stop().await;
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let (client, _rx) = test_client(false);
        let mut config = MatrixConfiguration::new("127.0.0.1", MatrixProtocol::Tcp);
        config.tcp_port = closed_port().await;

        let result = client.route(&config, 1, 1).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Connection));
    }

    #[tokio::test]
    async fn probe_reports_reachability() {
        let mock = MockMatrix::start(Some("OK\r\n")).await;
        let (client, _rx) = test_client(false);

        assert!(client.probe(&tcp_config(&mock)).await.is_ok());

        let mut closed = MatrixConfiguration::new("127.0.0.1", MatrixProtocol::Tcp);
        closed.tcp_port = closed_port().await;
        let err = client.probe(&closed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        mock.stop().await;
    }
}

// =============================================================================
// UDP
// =============================================================================

mod udp {
    use super::*;

    #[tokio::test]
    async fn route_sends_single_datagram_and_accepts_ok() {
        let mock = MockMatrix::start(Some("OK")).await;
        let (client, _rx) = test_client(false);

        let result = client.route(&udp_config(&mock), 12, 8).await.unwrap();

        assert!(result.success, "unexpected failure: {:?}", result.error);
        assert_eq!(result.command, "12X8.");
        assert_eq!(mock.received(), vec![b"12X8.\r\n".to_vec()]);

        mock.stop().await;
    }

    #[tokio::test]
    async fn err_datagram_is_a_protocol_failure() {
        let mock = MockMatrix::start(Some("ERR")).await;
        let (client, _rx) = test_client(false);

        let result = client.route(&udp_config(&mock), 1, 2).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Protocol));

        mock.stop().await;
    }

    #[tokio::test]
    async fn ipv6_switcher_is_reachable() {
        // Hosts without an IPv6 loopback have nothing to test
        let Ok(switcher) = tokio::net::UdpSocket::bind("[::1]:0").await else {
            return;
        };
        let port = switcher.local_addr().unwrap().port();
        let reply = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = switcher.recv_from(&mut buf).await.unwrap();
            switcher.send_to(b"OK\r\n", from).await.unwrap();
            buf[..n].to_vec()
        });

        let (client, _rx) = test_client(true);
        let mut config = MatrixConfiguration::new("::1", MatrixProtocol::Udp);
        config.udp_port = port;

        let result = client.route(&config, 3, 4).await.unwrap();

        assert!(result.success, "unexpected failure: {:?}", result.error);
        assert_eq!(reply.await.unwrap(), b"3X4.\r\n".to_vec());
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let mock = MockMatrix::start(None).await;
        let (client, _rx) = test_client(false);

        let started = Instant::now();
        let result = client.route(&udp_config(&mock), 1, 2).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));

        mock.stop().await;
    }
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn zero_channel_is_rejected_before_any_io() {
    let mock = MockMatrix::start(Some("OK\r\n")).await;
    let (client, mut rx) = test_client(false);

    let err = client.route(&tcp_config(&mock), 0, 2).await.unwrap_err();

    assert!(matches!(err, ControlError::InvalidArgument(_)));
    assert!(mock.received().is_empty());
    assert!(rx.try_recv().is_err());

    mock.stop().await;
}
