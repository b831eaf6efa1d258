use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error as ThisError;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::commands::executable::Executable;
use crate::commands::{Command, CommandParserError};
use crate::frame::{self, Frame};
use crate::metrics::SharedMetrics;
use crate::shutdown::Fatal;
use crate::store::{self, SharedStorage};

/// A request as handed over from the reader to the processor.
///
/// Requests that could not be decoded or interpreted still go through the pipeline, so that the
/// client gets an error reply in the right position.
pub type Request = Result<Command, RequestError>;

#[derive(Debug, ThisError)]
pub enum RequestError {
    #[error(transparent)]
    Frame(#[from] frame::Error),
    #[error(transparent)]
    Command(#[from] CommandParserError),
}

/// What every connection shares with the rest of the server.
#[derive(Clone)]
pub struct Context {
    pub store: SharedStorage,
    pub metrics: SharedMetrics,
    pub fatal: Fatal,
    pub max_frame_size: usize,
    /// Bound on replies that are ready but not written yet. `None` means unbounded.
    pub max_pending_replies: Option<usize>,
}

/// One client connection, served by three tasks:
///
/// * the reader decodes requests from the socket and hands them to the processor one at a time;
/// * the processor executes requests in arrival order and queues their replies;
/// * the writer takes replies from the head of that queue and writes them to the socket.
///
/// Reading, executing and writing overlap, which is what makes pipelining work, while replies
/// still leave in the order their requests came in.
///
/// The reader and the writer each own a cancellation signal: `read_closed` is set when reading
/// from the socket fails, `write_closed` when writing to it fails. Both are children of a session
/// token the processor cancels when it stops, so a single cancel takes down the whole pipeline.
pub struct Connection<S> {
    pub id: Uuid,
    stream: S,
    context: Context,
}

// Both hand-offs carry a single item, which bounds how far each task can run ahead of the next.
const HANDOFF_CAPACITY: usize = 1;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, context: Context) -> Connection<S> {
        Connection {
            id: Uuid::new_v4(),
            stream,
            context,
        }
    }

    /// Serves the connection until the client goes away, the socket fails, or a fatal storage
    /// error is raised. The socket is shut down once, when every task is done with it.
    pub async fn run(self) {
        let Connection {
            stream, context, ..
        } = self;

        let (read_half, write_half) = io::split(stream);

        let session = CancellationToken::new();
        let read_closed = session.child_token();
        let write_closed = session.child_token();

        let (requests_tx, requests_rx) = mpsc::channel(HANDOFF_CAPACITY);
        let (replies_tx, replies_rx) = mpsc::channel(HANDOFF_CAPACITY);

        let reader = tokio::spawn(read_requests(
            FramedRead::new(read_half, FrameCodec::new(context.max_frame_size)),
            requests_tx,
            read_closed.clone(),
            write_closed.clone(),
        ));
        let writer = tokio::spawn(write_replies(
            FramedWrite::new(write_half, FrameCodec::new(context.max_frame_size)),
            replies_rx,
            read_closed.clone(),
            write_closed.clone(),
        ));

        let mut processor = Processor {
            context,
            queue: VecDeque::new(),
        };
        let outcome = processor
            .run(requests_rx, replies_tx, &read_closed, &write_closed)
            .await;

        if outcome != Outcome::Drained {
            session.cancel();
        }

        let (read_half, write_half) = match (reader.await, writer.await) {
            (Ok(read_half), Ok(write_half)) => (read_half, write_half),
            (read_res, write_res) => {
                // The half owned by a task that panicked is gone with it, which already closed
                // the socket.
                for err in [read_res.err(), write_res.err()].into_iter().flatten() {
                    error!("Connection task failed: {}", err);
                }
                return;
            }
        };

        let mut stream = read_half.unsplit(write_half);
        if let Err(e) = stream.shutdown().await {
            debug!("Failed to shut down connection: {}", e);
        }
    }
}

#[derive(Debug, PartialEq)]
enum Outcome {
    /// The client finished sending requests and every reply was handed to the writer.
    Drained,
    /// Reading or writing failed.
    Closed,
    /// A fatal storage error was raised.
    Fatal,
}

struct Processor {
    context: Context,
    // Replies waiting for the writer, in request order.
    queue: VecDeque<Frame>,
}

impl Processor {
    async fn run(
        &mut self,
        mut requests: mpsc::Receiver<Request>,
        replies: mpsc::Sender<Frame>,
        read_closed: &CancellationToken,
        write_closed: &CancellationToken,
    ) -> Outcome {
        let mut reading = true;

        loop {
            if !reading && self.queue.is_empty() {
                return Outcome::Drained;
            }

            tokio::select! {
                biased;
                _ = read_closed.cancelled() => return Outcome::Closed,
                _ = write_closed.cancelled() => return Outcome::Closed,
                permit = replies.reserve(), if !self.queue.is_empty() => {
                    let Ok(permit) = permit else {
                        return Outcome::Closed;
                    };
                    if let Some(reply) = self.queue.pop_front() {
                        permit.send(reply);
                    }
                }
                request = requests.recv(), if reading && self.has_room() => {
                    let Some(request) = request else {
                        // The reader is done, deliver what is left.
                        reading = false;
                        continue;
                    };
                    match self.execute(request).await {
                        Ok(reply) => self.queue.push_back(reply),
                        Err(e) => {
                            error!("Fatal database error: {}", e);
                            self.context.fatal.raise(e);
                            return Outcome::Fatal;
                        }
                    }
                }
            }
        }
    }

    fn has_room(&self) -> bool {
        self.context
            .max_pending_replies
            .map_or(true, |max| self.queue.len() < max.max(1))
    }

    /// Runs one request. Everything but a fatal storage error becomes a reply.
    ///
    /// Storage calls may hit the disk, so they run on the blocking pool. The processor waits for
    /// each one before taking the next request, which keeps replies in request order.
    async fn execute(&self, request: Request) -> Result<Frame, store::Error> {
        let metrics = &self.context.metrics;

        let cmd = match request {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics.incr("errors.request");
                debug!("Invalid request: {}", e);
                return Ok(Frame::Error(e.to_string()));
            }
        };

        let metric = format!("requests.{}", cmd.name());
        metrics.incr("requests");
        metrics.incr(&metric);

        let storage = self.context.store.clone();
        let start = Instant::now();
        let res = task::spawn_blocking(move || cmd.exec(&*storage))
            .await
            // A panic may have left a write half done.
            .unwrap_or_else(|e| Err(store::Error::Fatal(format!("storage task failed: {}", e))));
        metrics.time(&metric, start.elapsed());

        match res {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Database error: {}", e);
                Ok(Frame::Error(e.to_string()))
            }
        }
    }
}

async fn read_requests<R>(
    mut frames: FramedRead<R, FrameCodec>,
    requests: mpsc::Sender<Request>,
    read_closed: CancellationToken,
    write_closed: CancellationToken,
) -> R
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = write_closed.cancelled() => break,
            frame = frames.next() => frame,
        };

        let request = match frame {
            Some(Ok(Ok(parts))) => Command::try_from(parts).map_err(RequestError::from),
            Some(Ok(Err(e))) => Err(RequestError::from(e)),
            Some(Err(e)) => {
                debug!("Failed to read from client: {}", e);
                read_closed.cancel();
                break;
            }
            None => {
                debug!("Client closed its side of the connection");
                break;
            }
        };

        // Never block on a processor that is gone: the write side may fail while we wait.
        tokio::select! {
            biased;
            _ = write_closed.cancelled() => break,
            res = requests.send(request) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }

    frames.into_inner()
}

async fn write_replies<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut replies: mpsc::Receiver<Frame>,
    read_closed: CancellationToken,
    write_closed: CancellationToken,
) -> W
where
    W: AsyncWrite + Unpin,
{
    loop {
        let reply = tokio::select! {
            biased;
            _ = read_closed.cancelled() => break,
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };

        let res = tokio::select! {
            biased;
            _ = read_closed.cancelled() => break,
            res = sink.send(reply) => res,
        };

        if let Err(e) = res {
            debug!("Failed to write to client: {}", e);
            write_closed.cancel();
            break;
        }
    }

    sink.into_inner()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    use super::*;
    use crate::metrics::{Metrics, Noop};
    use crate::store::{Info, Memory, Meta, Storage};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn context(store: SharedStorage) -> Context {
        Context {
            store,
            metrics: Arc::new(Noop),
            fatal: Fatal::new(),
            max_frame_size: crate::codec::DEFAULT_MAX_FRAME_SIZE,
            max_pending_replies: None,
        }
    }

    fn serve(context: Context) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(Connection::new(server, context).run());
        (client, handle)
    }

    async fn read_exact(client: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n];
        timeout(TIMEOUT, client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for a reply")
            .unwrap();
        buf
    }

    async fn read_to_end(client: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![];
        timeout(TIMEOUT, client.read_to_end(&mut buf))
            .await
            .expect("timed out waiting for the connection to close")
            .unwrap();
        buf
    }

    const SET_FOO: &[u8] = b"*4\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n$2\r\nNX\r\n";
    const GET_FOO: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
    const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

    #[tokio::test]
    async fn set_get_ping() {
        let (mut client, _) = serve(context(Arc::new(Memory::new())));

        client.write_all(SET_FOO).await.unwrap();
        assert_eq!(read_exact(&mut client, 5).await, b"+OK\r\n");

        client.write_all(SET_FOO).await.unwrap();
        assert_eq!(read_exact(&mut client, 5).await, b"$-1\r\n");

        client.write_all(GET_FOO).await.unwrap();
        assert_eq!(read_exact(&mut client, 9).await, b"$3\r\nbar\r\n");

        client.write_all(PING).await.unwrap();
        assert_eq!(read_exact(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn get_missing_key() {
        let (mut client, _) = serve(context(Arc::new(Memory::new())));

        client.write_all(GET_FOO).await.unwrap();

        assert_eq!(read_exact(&mut client, 5).await, b"$-1\r\n");
    }

    /// Sleeps before answering a GET for `slow`, and counts the requests it sees.
    #[derive(Default)]
    struct SlowStore {
        inner: Memory,
        gets: AtomicUsize,
    }

    impl Storage for SlowStore {
        fn put(&self, key: Bytes, value: Bytes) -> Result<(), store::Error> {
            self.inner.put(key, value)
        }

        fn get(&self, key: &[u8]) -> Result<(Bytes, Meta), store::Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if key == b"slow" {
                std::thread::sleep(Duration::from_millis(500));
            }
            self.inner.get(key)
        }

        fn info(&self) -> Info {
            self.inner.info()
        }

        fn close(&self) -> Result<(), store::Error> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn pipelined_replies_keep_request_order() {
        let store = Arc::new(SlowStore::default());
        store
            .put(Bytes::from("slow"), Bytes::from("tortoise"))
            .unwrap();
        let (mut client, _) = serve(context(store.clone()));

        let mut requests = vec![];
        requests.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$4\r\nslow\r\n");
        requests.extend_from_slice(PING);
        requests.extend_from_slice(SET_FOO);
        requests.extend_from_slice(GET_FOO);
        requests.extend_from_slice(b"*1\r\n$4\r\nINFO\r\n");
        client.write_all(&requests).await.unwrap();

        let expected = b"$8\r\ntortoise\r\n+PONG\r\n+OK\r\n$3\r\nbar\r\n+read_chunks:0 total_read_log_size:0 write_log_keys:2 read_log_keys:0 total_keys:2\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_storage_call_does_not_stall_other_connections() {
        let store = Arc::new(SlowStore::default());
        store
            .put(Bytes::from("slow"), Bytes::from("tortoise"))
            .unwrap();
        let (mut slow_client, _) = serve(context(store.clone()));
        let (mut other_client, _) = serve(context(store.clone()));

        slow_client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nslow\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        other_client.write_all(PING).await.unwrap();
        assert_eq!(read_exact(&mut other_client, 7).await, b"+PONG\r\n");
        assert!(
            start.elapsed() < Duration::from_millis(250),
            "PING took {:?}",
            start.elapsed()
        );

        assert_eq!(
            read_exact(&mut slow_client, 14).await,
            b"$8\r\ntortoise\r\n"
        );
    }

    #[tokio::test]
    async fn bounded_queue_still_answers_everything_in_order() {
        let mut context = context(Arc::new(Memory::new()));
        context.max_pending_replies = Some(1);
        let (mut client, _) = serve(context);

        let mut requests = vec![];
        let mut expected = vec![];
        for i in 0..100 {
            let key = format!("key{:03}", i);
            requests.extend_from_slice(
                format!("*4\r\n$3\r\nSET\r\n$6\r\n{}\r\n$1\r\nv\r\n$2\r\nNX\r\n", key).as_bytes(),
            );
            requests.extend_from_slice(format!("*2\r\n$3\r\nGET\r\n$6\r\n{}\r\n", key).as_bytes());
            expected.extend_from_slice(b"+OK\r\n$1\r\nv\r\n");
        }
        client.write_all(&requests).await.unwrap();

        assert_eq!(read_exact(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn invalid_requests_do_not_close_the_connection() {
        let (mut client, _) = serve(context(Arc::new(Memory::new())));

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")
            .await
            .unwrap();
        let expected = b"-the NX option to SET is required\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        client
            .write_all(b"*5\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n$2\r\nNX\r\n$2\r\nXX\r\n")
            .await
            .unwrap();
        let expected = b"-the XX option to SET is not supported\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        client
            .write_all(b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n")
            .await
            .unwrap();
        let expected = b"-wrong number of arguments for command\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        client.write_all(b"*1\r\n$4\r\nQUIT\r\n").await.unwrap();
        let expected = b"-unrecognized command\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        client.write_all(b"*10000001\r\n").await.unwrap();
        let expected = b"-client sent an unreasonable bulk string count\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        client.write_all(b"*1\r\n$1000001\r\n").await.unwrap();
        let expected = b"-client sent an unreasonable string length\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);

        client.write_all(PING).await.unwrap();
        assert_eq!(read_exact(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn pending_replies_are_delivered_after_client_half_close() {
        let (mut client, handle) = serve(context(Arc::new(Memory::new())));

        let mut requests = vec![];
        requests.extend_from_slice(SET_FOO);
        requests.extend_from_slice(GET_FOO);
        requests.extend_from_slice(PING);
        client.write_all(&requests).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(
            read_to_end(&mut client).await,
            b"+OK\r\n$3\r\nbar\r\n+PONG\r\n"
        );
        timeout(TIMEOUT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connection_ends_when_client_goes_away() {
        let (mut client, handle) = serve(context(Arc::new(Memory::new())));

        client.write_all(PING).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPI").await.unwrap();
        drop(client);

        timeout(TIMEOUT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_failure_stops_the_reader() {
        // A tiny pipe the client never reads from, so the writer eventually blocks; then the
        // client disappears and every task has to notice.
        let (mut client, server) = tokio::io::duplex(16);
        let handle = tokio::spawn(Connection::new(server, context(Arc::new(Memory::new()))).run());

        for _ in 0..8 {
            let _ = timeout(Duration::from_millis(50), client.write_all(PING)).await;
        }
        drop(client);

        timeout(TIMEOUT, handle).await.unwrap().unwrap();
    }

    struct BrokenStore;

    impl Storage for BrokenStore {
        fn put(&self, _key: Bytes, _value: Bytes) -> Result<(), store::Error> {
            Err(store::Error::Fatal("disk on fire".to_string()))
        }

        fn get(&self, _key: &[u8]) -> Result<(Bytes, Meta), store::Error> {
            Err(store::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "read failed",
            )))
        }

        fn info(&self) -> Info {
            Info::default()
        }

        fn close(&self) -> Result<(), store::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn storage_errors_are_replied() {
        let (mut client, _) = serve(context(Arc::new(BrokenStore)));

        client.write_all(GET_FOO).await.unwrap();

        assert_eq!(read_exact(&mut client, 14).await, b"-read failed\r\n");
    }

    #[tokio::test]
    async fn fatal_storage_error_is_raised_and_closes_the_connection() {
        let context = context(Arc::new(BrokenStore));
        let fatal = context.fatal.clone();
        let (mut client, handle) = serve(context);

        client.write_all(PING).await.unwrap();
        client.write_all(SET_FOO).await.unwrap();

        let err = timeout(TIMEOUT, fatal.raised()).await.unwrap();
        assert_eq!(err.to_string(), "fatal database error: disk on fire");

        timeout(TIMEOUT, handle).await.unwrap().unwrap();

        // Whatever made it out before the error, nothing is written for the failed request.
        let written = read_to_end(&mut client).await;
        assert!(written.is_empty() || written == b"+PONG\r\n");
    }

    #[derive(Default)]
    struct Recorder {
        counters: std::sync::Mutex<Vec<String>>,
    }

    impl Metrics for Recorder {
        fn incr(&self, name: &str) {
            self.counters.lock().unwrap().push(name.to_string());
        }
        fn gauge(&self, _name: &str, _value: f64) {}
        fn time(&self, _name: &str, _duration: Duration) {}
        fn close(&self) {}
    }

    #[tokio::test]
    async fn requests_are_counted() {
        let metrics = Arc::new(Recorder::default());
        let mut context = context(Arc::new(Memory::new()));
        context.metrics = metrics.clone();
        let (mut client, _) = serve(context);

        client.write_all(PING).await.unwrap();
        client.write_all(b"*1\r\n$3\r\nBAD\r\n").await.unwrap();
        read_exact(&mut client, 7 + 23).await;

        assert_eq!(
            *metrics.counters.lock().unwrap(),
            vec!["requests", "requests.ping", "errors.request"]
        );
    }
}
