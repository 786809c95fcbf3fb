// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use tracing::{debug, error};

use crate::encoding::encode_message;
use crate::segment::Segment;

/// Outcome of sending one batch of documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Datagrams handed to the OS.
    pub sent: usize,
    /// Documents that could not be encoded or written.
    pub failed: usize,
    /// Total bytes written, headers included.
    pub bytes: usize,
}

impl SendReport {
    pub fn merge(&mut self, other: SendReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

/// Delivers flattened documents to the collector daemon.
///
/// Implementations never fail the caller: errors are logged and counted in
/// the returned report. `delivered` is called for each document actually
/// handed to the OS, never for failed ones.
pub trait Transport: Send + Sync {
    fn send_batch(&self, segments: &[Segment], delivered: &mut dyn FnMut(&Segment))
        -> SendReport;
}

/// Fire-and-forget UDP delivery.
///
/// A socket is bound for every batch and released when the batch is done,
/// whether or not the sends succeeded.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    endpoint: SocketAddr,
}

impl UdpTransport {
    #[must_use]
    pub fn new(endpoint: SocketAddr) -> Self {
        Self { endpoint }
    }

    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn bind(&self) -> std::io::Result<UdpSocket> {
        let local: SocketAddr = if self.endpoint.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        UdpSocket::bind(local)
    }
}

impl Transport for UdpTransport {
    fn send_batch(
        &self,
        segments: &[Segment],
        delivered: &mut dyn FnMut(&Segment),
    ) -> SendReport {
        let mut report = SendReport::default();
        if segments.is_empty() {
            return report;
        }

        let socket = match self.bind() {
            Ok(socket) => socket,
            Err(e) => {
                error!(
                    "Error opening socket to X-Ray daemon at {}, due to error {} ({}): dropping {} segments",
                    self.endpoint,
                    e.raw_os_error().unwrap_or_default(),
                    e,
                    segments.len()
                );
                report.failed = segments.len();
                return report;
            }
        };

        for segment in segments {
            let message = match encode_message(segment) {
                Ok(message) => message,
                Err(e) => {
                    error!("Error encoding segment {}: {}", segment.id, e);
                    report.failed += 1;
                    continue;
                }
            };
            match socket.send_to(&message, self.endpoint) {
                Ok(written) => {
                    report.sent += 1;
                    report.bytes += written;
                    delivered(segment);
                }
                Err(e) => {
                    error!(
                        "Error sending trace to X-Ray daemon, due to error {} ({}) with trace: {}",
                        e.raw_os_error().unwrap_or_default(),
                        e,
                        String::from_utf8_lossy(&message)
                    );
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Sent {} of {} segments ({} bytes) to {}",
            report.sent,
            segments.len(),
            report.bytes,
            self.endpoint
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::DAEMON_HEADER;
    use serde_json::Value;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn fake_daemon() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn receive(socket: &UdpSocket) -> String {
        let mut buf = vec![0u8; 70 * 1024];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[test]
    fn test_sends_framed_datagrams() {
        let daemon = fake_daemon();
        let transport = UdpTransport::new(daemon.local_addr().unwrap());
        let segments = vec![
            Segment::new("one", "0000000000000001", "1-abc-def", 1.0),
            Segment::new("two", "0000000000000002", "1-abc-def", 2.0),
        ];

        let mut delivered = Vec::new();
        let report = transport.send_batch(&segments, &mut |s| delivered.push(s.name.clone()));
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(delivered, vec!["one", "two"]);

        for expected in ["one", "two"] {
            let datagram = receive(&daemon);
            let (header, payload) = datagram.split_once('\n').unwrap();
            assert_eq!(header, DAEMON_HEADER);
            let value: Value = serde_json::from_str(payload).unwrap();
            assert_eq!(value["name"], expected);
        }
    }

    #[test]
    fn test_empty_batch_sends_nothing() {
        let transport = UdpTransport::new("127.0.0.1:9".parse().unwrap());
        assert_eq!(transport.send_batch(&[], &mut |_| {}), SendReport::default());
    }

    #[test]
    #[traced_test]
    fn test_oversized_datagram_failure_is_logged_not_raised() {
        let daemon = fake_daemon();
        let transport = UdpTransport::new(daemon.local_addr().unwrap());
        let mut segment = Segment::new("huge", "0000000000000001", "t", 1.0);
        segment
            .extra
            .insert("payload".to_string(), Value::String("a".repeat(70 * 1024)));

        let small = Segment::new("small", "0000000000000002", "t", 1.0);
        let mut delivered = Vec::new();
        let report =
            transport.send_batch(&[segment, small], &mut |s| delivered.push(s.id.clone()));
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(delivered, vec!["0000000000000002"]);
        assert!(logs_contain("Error sending trace to X-Ray daemon"));
    }

    #[test]
    fn test_report_merge() {
        let mut report = SendReport {
            sent: 1,
            failed: 0,
            bytes: 10,
        };
        report.merge(SendReport {
            sent: 2,
            failed: 1,
            bytes: 5,
        });
        assert_eq!(
            report,
            SendReport {
                sent: 3,
                failed: 1,
                bytes: 15
            }
        );
    }
}
