use cadence::prelude::*;
use cadence::{MetricResult, StatsdClient, UdpMetricSink};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Where counters, gauges and timings are reported to.
///
/// Reporting never fails from the caller's point of view: a metric that cannot be delivered is
/// dropped.
pub trait Metrics: Send + Sync {
    fn incr(&self, name: &str);
    fn gauge(&self, name: &str, value: f64);
    fn time(&self, name: &str, duration: Duration);
    fn close(&self);
}

pub type SharedMetrics = Arc<dyn Metrics>;

/// Discards every metric.
#[derive(Debug, Default)]
pub struct Noop;

impl Metrics for Noop {
    fn incr(&self, _name: &str) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn time(&self, _name: &str, _duration: Duration) {}
    fn close(&self) {}
}

/// Sends metrics to a StatsD server over UDP, one datagram per metric.
///
/// The client is dropped on `close`, after which every metric is discarded.
pub struct Statsd {
    client: RwLock<Option<StatsdClient>>,
}

impl Statsd {
    pub fn connect(addr: impl ToSocketAddrs) -> MetricResult<Statsd> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to send metrics to")
        })?;

        let local: IpAddr = if addr.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let socket = UdpSocket::bind((local, 0))?;
        // A full socket buffer must never stall a connection.
        socket.set_nonblocking(true)?;

        let sink = UdpMetricSink::from(addr, socket)?;

        Ok(Statsd {
            client: RwLock::new(Some(StatsdClient::from_sink("", sink))),
        })
    }

    fn send(&self, name: &str, f: impl FnOnce(&StatsdClient) -> MetricResult<()>) {
        let client = self.client.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = client.as_ref() {
            if let Err(e) = f(client) {
                debug!("Failed to send metric {:?}: {}", name, e);
            }
        }
    }
}

impl Metrics for Statsd {
    fn incr(&self, name: &str) {
        self.send(name, |client| client.incr(name).map(|_| ()));
    }

    fn gauge(&self, name: &str, value: f64) {
        self.send(name, |client| client.gauge(name, value).map(|_| ()));
    }

    fn time(&self, name: &str, duration: Duration) {
        self.send(name, |client| client.time(name, duration).map(|_| ()));
    }

    fn close(&self) {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            if let Err(e) = client.flush() {
                debug!("Failed to flush metrics: {}", e);
            }
        }
    }
}
