use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};
use tokio::task;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::connection::{Connection, Context};
use crate::metrics::{Metrics, Noop, SharedMetrics, Statsd};
use crate::shutdown::{Fatal, Shutdown};
use crate::store::{self, Db, Info, SharedStorage};

/// How often storage statistics are forwarded to the metrics sink.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before accepting again after a transient accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub dir: PathBuf,
    /// Size in bytes at which the write log is sealed.
    pub chunk_size: u64,
    pub expiry: Duration,
    /// StatsD endpoint. Metrics are discarded when empty.
    pub statsd_addr: String,
    pub max_frame_size: usize,
    pub max_pending_replies: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: "localhost:5533".to_string(),
            dir: PathBuf::from("db"),
            chunk_size: 100_000_000,
            expiry: Duration::from_secs(60 * 60),
            statsd_addr: "localhost:8125".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_replies: None,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error(transparent)]
    Fatal(store::Error),
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),
}

pub struct Server {
    listener: TcpListener,
    context: Context,
    sampler: CancellationToken,
    shutdown: Shutdown,
}

impl Server {
    /// Binds the listener, then opens the database and the metrics sink described by `config`.
    pub async fn bind(config: Config) -> crate::Result<Server> {
        let listener = TcpListener::bind(&config.addr).await?;

        // Replaying the chunks reads every file in the directory.
        let store = {
            let (dir, chunk_size, expiry) = (config.dir.clone(), config.chunk_size, config.expiry);
            task::spawn_blocking(move || Db::open(dir, chunk_size, expiry)).await??
        };
        info!("Opened database in {}", config.dir.display());

        let metrics: SharedMetrics = if config.statsd_addr.is_empty() {
            Arc::new(Noop)
        } else {
            Arc::new(Statsd::connect(&config.statsd_addr)?)
        };

        Ok(Server::new(listener, Arc::new(store), metrics, &config))
    }

    /// Builds a server around an already bound listener and already opened collaborators.
    pub fn new(
        listener: TcpListener,
        store: SharedStorage,
        metrics: SharedMetrics,
        config: &Config,
    ) -> Server {
        let sampler = CancellationToken::new();
        let shutdown = Shutdown::new(store.clone(), metrics.clone(), sampler.clone());

        Server {
            listener,
            context: Context {
                store,
                metrics,
                fatal: Fatal::new(),
                max_frame_size: config.max_frame_size,
                max_pending_replies: config.max_pending_replies,
            },
            sampler,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that tears the server's collaborators down. Safe to use from several places.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Accepts connections until a connection reports a fatal storage error, or accepting
    /// fails for good. Connections are not tracked once spawned.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            context,
            sampler,
            ..
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!("Listening on {}", addr);
        }
        context.metrics.incr("server-start");

        tokio::spawn(sample_stats(
            context.store.clone(),
            context.metrics.clone(),
            sampler,
            SAMPLE_INTERVAL,
        ));

        loop {
            let accepted = tokio::select! {
                biased;
                err = context.fatal.raised() => return Err(ServerError::Fatal(err)),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, client_address)) => {
                    tokio::spawn(handle_connection(stream, client_address, context.clone()));
                }
                Err(e) => recover_from_accept_error(e, &*context.metrics).await?,
            }
        }
    }
}

/// Waits out a transient accept error. Any other error is returned and ends the accept loop.
async fn recover_from_accept_error(
    err: io::Error,
    metrics: &dyn Metrics,
) -> Result<(), ServerError> {
    if !is_transient(&err) {
        error!("Failed to accept connection: {}", err);
        return Err(ServerError::Accept(err));
    }

    metrics.incr("errors.accept");
    warn!(
        "Failed to accept connection: {}; retrying in {:?}",
        err, ACCEPT_RETRY_DELAY
    );
    time::sleep(ACCEPT_RETRY_DELAY).await;
    Ok(())
}

#[instrument(
    name = "connection",
    skip(stream, context),
    fields(connection_id, client_address)
)]
async fn handle_connection(stream: TcpStream, client_address: SocketAddr, context: Context) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    context.metrics.incr("client-connect");
    let conn = Connection::new(stream, context);

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    info!("Accepted connection");
    conn.run().await;
    info!("Connection closed");
}

// Out of descriptors, kernel buffers or memory.
#[cfg(unix)]
const RESOURCE_EXHAUSTION: [i32; 4] = [
    libc::EMFILE,
    libc::ENFILE,
    libc::ENOBUFS,
    libc::ENOMEM,
];
#[cfg(not(unix))]
const RESOURCE_EXHAUSTION: [i32; 0] = [];

/// Accept errors that say nothing about the listener itself and are worth retrying.
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut | OutOfMemory
    ) {
        return true;
    }

    err.raw_os_error()
        .map_or(false, |code| RESOURCE_EXHAUSTION.contains(&code))
}

/// Forwards a storage snapshot as gauges every `period` until `stop` is cancelled.
async fn sample_stats(
    store: SharedStorage,
    metrics: SharedMetrics,
    stop: CancellationToken,
    period: Duration,
) {
    let mut interval = time::interval_at(time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                // The engine lock may be held across disk writes.
                let store = store.clone();
                match task::spawn_blocking(move || store.info()).await {
                    Ok(info) => record_info(&info, &*metrics),
                    Err(e) => warn!("Failed to sample storage info: {}", e),
                }
            }
        }
    }

    debug!("Stats sampler stopped");
}

fn record_info(info: &Info, metrics: &dyn Metrics) {
    metrics.gauge("db.rchunks", info.read_chunks as f64);
    metrics.gauge("db.total-rlog-size", info.total_read_log_size as f64);
    metrics.gauge("db.wlog-keys", info.write_log_keys as f64);
    metrics.gauge("db.rlog-keys", info.read_log_keys as f64);
    metrics.gauge("db.total-keys", info.total_keys as f64);
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::sync::Mutex;

    use super::*;
    use crate::store::{Memory, Storage};

    #[derive(Default)]
    struct Recorder {
        counters: Mutex<Vec<String>>,
        values: Mutex<Vec<(String, f64)>>,
    }

    impl Metrics for Recorder {
        fn incr(&self, name: &str) {
            self.counters.lock().unwrap().push(name.to_string());
        }
        fn gauge(&self, name: &str, value: f64) {
            self.values.lock().unwrap().push((name.to_string(), value));
        }
        fn time(&self, _name: &str, _duration: Duration) {}
        fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_reports_storage_info_periodically() {
        let store = Arc::new(Memory::new());
        store.put(Bytes::from("foo"), Bytes::from("bar")).unwrap();
        let metrics = Arc::new(Recorder::default());
        let stop = CancellationToken::new();

        let sampler = tokio::spawn(sample_stats(
            store.clone(),
            metrics.clone(),
            stop.clone(),
            SAMPLE_INTERVAL,
        ));

        time::sleep(SAMPLE_INTERVAL / 2).await;
        assert!(metrics.values.lock().unwrap().is_empty());

        time::sleep(SAMPLE_INTERVAL).await;
        assert_eq!(
            *metrics.values.lock().unwrap(),
            vec![
                ("db.rchunks".to_string(), 0.0),
                ("db.total-rlog-size".to_string(), 0.0),
                ("db.wlog-keys".to_string(), 1.0),
                ("db.rlog-keys".to_string(), 0.0),
                ("db.total-keys".to_string(), 1.0),
            ]
        );

        time::sleep(SAMPLE_INTERVAL).await;
        assert_eq!(metrics.values.lock().unwrap().len(), 10);

        stop.cancel();
        sampler.await.unwrap();

        time::sleep(SAMPLE_INTERVAL * 3).await;
        assert_eq!(metrics.values.lock().unwrap().len(), 10);
    }

    #[test]
    fn transient_accept_errors() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            assert!(is_transient(&io::Error::from(kind)), "{:?}", kind);
        }

        assert!(!is_transient(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_accept_error_is_counted_and_retried_later() {
        let metrics = Recorder::default();
        let start = time::Instant::now();

        let res = recover_from_accept_error(
            io::Error::from(io::ErrorKind::ConnectionReset),
            &metrics,
        )
        .await;

        assert!(res.is_ok());
        assert!(start.elapsed() >= ACCEPT_RETRY_DELAY);
        assert_eq!(*metrics.counters.lock().unwrap(), vec!["errors.accept"]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_accept_error_stops_accepting() {
        let metrics = Recorder::default();
        let start = time::Instant::now();

        let res = recover_from_accept_error(
            io::Error::from(io::ErrorKind::PermissionDenied),
            &metrics,
        )
        .await;

        match res {
            Err(ServerError::Accept(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(metrics.counters.lock().unwrap().is_empty());
    }

    struct FailingStore;

    impl Storage for FailingStore {
        fn put(&self, _key: Bytes, _value: Bytes) -> Result<(), store::Error> {
            Err(store::Error::Fatal("short write".to_string()))
        }

        fn get(&self, _key: &[u8]) -> Result<(Bytes, store::Meta), store::Error> {
            Err(store::Error::KeyNotFound)
        }

        fn info(&self) -> Info {
            Info::default()
        }

        fn close(&self) -> Result<(), store::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fatal_storage_error_stops_the_server() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(
            listener,
            Arc::new(FailingStore),
            Arc::new(Noop),
            &Config::default(),
        );
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let running = tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*4\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nNX\r\n")
            .await
            .unwrap();

        let res = time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        match res {
            Err(ServerError::Fatal(err)) => {
                assert_eq!(err.to_string(), "fatal database error: short write")
            }
            other => panic!("unexpected result: {:?}", other),
        }

        shutdown.stop().unwrap();
        assert!(shutdown.is_stopped());
    }
}
