//! Request staging and the writer thread.
//!
//! The stager owns the FIFO of pending requests and everything about
//! answering them: it pairs each incoming reply with the oldest pending
//! request, applies backpressure to callers, and replays unsatisfied
//! requests after a reconnect. The writer thread it feeds is the only
//! place that sends bytes to the stream.
//!
//! Subscription-mode connections run the stager unpaired: no reply ever
//! pops the queue there, so the writer retires each request as soon as it
//! is written instead of keeping it around for replay.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use thiserror::Error;

use crate::error::ClientError;
use crate::options::BackpressureStrategy;
use crate::resp::{EncodedRequest, Value};
use crate::stream::WriteHalf;

/// Where a reply eventually lands. Each variant is signalled exactly once.
pub(crate) enum ReplySink {
    Future(crossbeam::channel::Sender<Value>),
    Callback(Box<dyn FnOnce(Value) + Send>),
}

impl ReplySink {
    fn signal(self, reply: Value) {
        match self {
            ReplySink::Future(tx) => {
                let _ = tx.send(reply);
            }
            ReplySink::Callback(callback) => callback(reply),
        }
    }
}

/// The caller's handle to a staged request.
///
/// A nil reply means the request was dropped by the retry policy rather
/// than answered by the server.
pub struct ReplyFuture {
    rx: Receiver<Value>,
}

impl ReplyFuture {
    /// Block until the reply arrives.
    pub fn wait(self) -> Result<Value, ClientError> {
        self.rx.recv().map_err(|_| ClientError::Shutdown)
    }

    /// Block for at most `timeout`; `Ok(None)` if nothing arrived.
    pub fn wait_for(&self, timeout: Duration) -> Result<Option<Value>, ClientError> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Shutdown),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Result<Option<Value>, ClientError> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ClientError::Shutdown),
        }
    }
}

fn reply_channel() -> (ReplySink, ReplyFuture) {
    let (tx, rx) = bounded(1);
    (ReplySink::Future(tx), ReplyFuture { rx })
}

#[derive(Debug, Error)]
#[error("reply received with no pending request")]
pub(crate) struct SpuriousReply;

struct StagedRequest {
    request: EncodedRequest,
    sink: Option<ReplySink>,
    /// Replies absorbed so far; a MULTI block produces several, and only
    /// the last one reaches the sink.
    received: usize,
}

struct StagerInner {
    queue: VecDeque<StagedRequest>,
    /// Index into `queue` of the next entry to send on the current stream.
    next_write: usize,
    /// Connection-setup frames, written ahead of the queue. No sinks; their
    /// replies are consumed by the handshake or a subscription listener.
    preamble: Vec<EncodedRequest>,
    preamble_next: usize,
    /// While true the queue is gated: only preamble frames go out.
    gated: bool,
    stream: Option<WriteHalf>,
    /// Bumped on every activate, so a writer that fails a send can tell
    /// whether the stream it used is still the current one.
    generation: u64,
    shutdown: bool,
}

pub(crate) struct RequestStager {
    inner: Mutex<StagerInner>,
    cond: Condvar,
    backpressure: BackpressureStrategy,
    /// True on command connections, where each reply pops the queue. False
    /// on subscription connections: a request is finished once written.
    pairs_replies: bool,
}

impl RequestStager {
    pub(crate) fn new(backpressure: BackpressureStrategy, pairs_replies: bool) -> RequestStager {
        RequestStager {
            inner: Mutex::new(StagerInner {
                queue: VecDeque::new(),
                next_write: 0,
                preamble: Vec::new(),
                preamble_next: 0,
                gated: false,
                stream: None,
                generation: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            backpressure,
            pairs_replies,
        }
    }

    /// Append a request and hand back the future for its reply. Blocks
    /// while the pending count is at the backpressure limit.
    pub(crate) fn stage(&self, request: EncodedRequest) -> ReplyFuture {
        let (sink, future) = reply_channel();
        self.stage_with_sink(request, sink);
        future
    }

    pub(crate) fn stage_callback(
        &self,
        request: EncodedRequest,
        callback: Box<dyn FnOnce(Value) + Send>,
    ) {
        self.stage_with_sink(request, ReplySink::Callback(callback));
    }

    fn stage_with_sink(&self, request: EncodedRequest, sink: ReplySink) {
        let mut inner = self.lock();
        if let BackpressureStrategy::PendingLimit(limit) = self.backpressure {
            while inner.queue.len() >= limit && !inner.shutdown {
                inner = self
                    .cond
                    .wait(inner)
                    .expect("stager lock poisoned");
            }
        }
        if inner.shutdown {
            drop(inner);
            sink.signal(Value::Nil);
            return;
        }
        inner.queue.push_back(StagedRequest {
            request,
            sink: Some(sink),
            received: 0,
        });
        self.cond.notify_all();
    }

    /// Queue a connection-setup frame. Never blocks on backpressure and is
    /// written before anything in the queue.
    pub(crate) fn stage_preamble(&self, request: EncodedRequest) {
        let mut inner = self.lock();
        inner.preamble.push(request);
        self.cond.notify_all();
    }

    /// Lift the handshake gate: queued requests may flow.
    pub(crate) fn open_gate(&self) {
        let mut inner = self.lock();
        inner.gated = false;
        self.cond.notify_all();
    }

    /// Deliver a reply to the oldest pending request. Intermediate replies
    /// of a MULTI block are absorbed; the final one signals the sink.
    pub(crate) fn satisfy(&self, reply: Value) -> Result<(), SpuriousReply> {
        let mut inner = self.lock();
        let front = inner.queue.front_mut().ok_or(SpuriousReply)?;
        front.received += 1;
        if front.received < front.request.replies() {
            return Ok(());
        }
        let mut entry = inner.queue.pop_front().expect("front exists");
        if inner.next_write > 0 {
            inner.next_write -= 1;
        }
        drop(inner);
        if let Some(sink) = entry.sink.take() {
            sink.signal(reply);
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Terminal failure: answer every pending request with nil and drop it.
    pub(crate) fn clear_pending(&self) {
        let drained: Vec<StagedRequest> = {
            let mut inner = self.lock();
            inner.next_write = 0;
            inner.queue.drain(..).collect()
        };
        for mut entry in drained {
            if let Some(sink) = entry.sink.take() {
                sink.signal(Value::Nil);
            }
        }
        self.cond.notify_all();
    }

    /// Bind to a fresh stream. Every unsatisfied request will be re-sent
    /// from the head; the server may see duplicates, which is fine because
    /// replies pair by order, not identity. `gated` holds the queue back
    /// until the handshake completes.
    pub(crate) fn activate(&self, stream: WriteHalf, gated: bool) {
        let mut inner = self.lock();
        inner.stream = Some(stream);
        inner.generation += 1;
        inner.next_write = 0;
        inner.preamble.clear();
        inner.preamble_next = 0;
        inner.gated = gated;
        self.cond.notify_all();
    }

    /// Stop writing; the pending queue is retained.
    pub(crate) fn deactivate(&self) {
        let mut inner = self.lock();
        inner.stream = None;
        self.cond.notify_all();
    }

    pub(crate) fn begin_shutdown(&self) {
        let mut inner = self.lock();
        inner.shutdown = true;
        inner.stream = None;
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StagerInner> {
        self.inner.lock().expect("stager lock poisoned")
    }

    /// The writer thread body: pick the next unwritten frame, send it with
    /// the lock released, repeat. Exits on shutdown.
    pub(crate) fn writer_loop(&self) {
        loop {
            let (stream, generation, bytes, retired) = {
                let mut inner = self.lock();
                loop {
                    if inner.shutdown {
                        return;
                    }
                    if let Some(stream) = inner.stream.clone() {
                        if inner.preamble_next < inner.preamble.len() {
                            let bytes = inner.preamble[inner.preamble_next].bytes();
                            inner.preamble_next += 1;
                            break (stream, inner.generation, bytes, None);
                        }
                        if !inner.gated && inner.next_write < inner.queue.len() {
                            if self.pairs_replies {
                                let bytes = inner.queue[inner.next_write].request.bytes();
                                inner.next_write += 1;
                                break (stream, inner.generation, bytes, None);
                            }
                            // Unpaired: no reply will ever pop this entry,
                            // so writing it is the end of its life.
                            let mut entry =
                                inner.queue.pop_front().expect("queue not empty");
                            let bytes = entry.request.bytes();
                            break (stream, inner.generation, bytes, entry.sink.take());
                        }
                    }
                    inner = self
                        .cond
                        .wait(inner)
                        .expect("stager lock poisoned");
                }
            };

            let sent = stream.send_all(&bytes).alive;
            if let Some(sink) = retired {
                sink.signal(Value::Nil);
                self.cond.notify_all();
            }
            if !sent {
                tracing::debug!("write failed, dropping stream");
                // Kill the socket so the read loop notices, and stop
                // writing on this generation.
                stream.shutdown();
                let mut inner = self.lock();
                if inner.generation == generation {
                    inner.stream = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::resp::ResponseReader;
    use crate::stream::{NetworkStream, TlsConfig};
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn start_writer(stager: &Arc<RequestStager>) -> thread::JoinHandle<()> {
        let stager = Arc::clone(stager);
        thread::spawn(move || stager.writer_loop())
    }

    /// A loopback pair: the returned receiver yields commands the writer
    /// actually put on the wire.
    fn wire_tap() -> (WriteHalf, crossbeam::channel::Receiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = crossbeam::channel::unbounded();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = ResponseReader::new();
            let mut buf = [0u8; 2048];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                reader.feed(&buf[..n]);
                while let Ok(Some(frame)) = reader.next_response() {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        });
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let stream = NetworkStream::connect(&endpoint, &TlsConfig::Off).expect("connect");
        let (_read, write) = stream.split();
        (write, rx)
    }

    fn command_name(frame: &Value) -> String {
        frame.as_array().unwrap()[0].as_str().unwrap().to_string()
    }

    #[test]
    fn replies_pair_in_fifo_order() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::Unlimited, true));
        let first = stager.stage(EncodedRequest::encode(&["PING"]));
        let second = stager.stage(EncodedRequest::encode(&["ECHO", "x"]));

        stager.satisfy(Value::Status("PONG".into())).unwrap();
        stager.satisfy(Value::bulk("x")).unwrap();

        assert_eq!(first.wait().unwrap(), Value::Status("PONG".into()));
        assert_eq!(second.wait().unwrap(), Value::bulk("x"));
    }

    #[test]
    fn satisfy_without_pending_is_an_error() {
        let stager = RequestStager::new(BackpressureStrategy::Unlimited, true);
        assert!(stager.satisfy(Value::Nil).is_err());
    }

    #[test]
    fn multi_blocks_absorb_intermediate_replies() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::Unlimited, true));
        let future = stager.stage(EncodedRequest::multi(&[vec![
            "VHSET".to_string(),
            "a".to_string(),
            "1".to_string(),
        ]]));

        stager.satisfy(Value::Status("OK".into())).unwrap();
        stager.satisfy(Value::Status("QUEUED".into())).unwrap();
        let exec_reply = Value::Array(vec![Value::Integer(1)]);
        stager.satisfy(exec_reply.clone()).unwrap();

        assert_eq!(future.wait().unwrap(), exec_reply);
        assert_eq!(stager.pending_len(), 0);
    }

    #[test]
    fn clear_pending_answers_with_nil() {
        let stager = RequestStager::new(BackpressureStrategy::Unlimited, true);
        let future = stager.stage(EncodedRequest::encode(&["GET", "k"]));
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = Arc::clone(&called);
        stager.stage_callback(
            EncodedRequest::encode(&["GET", "k2"]),
            Box::new(move |reply| {
                assert!(reply.is_nil());
                called2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        stager.clear_pending();
        assert_eq!(future.wait().unwrap(), Value::Nil);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writer_drains_in_order_and_replays_on_reconnect() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::Unlimited, true));
        let writer = start_writer(&stager);

        let _f1 = stager.stage(EncodedRequest::encode(&["FIRST"]));
        let _f2 = stager.stage(EncodedRequest::encode(&["SECOND"]));

        let (write, rx) = wire_tap();
        stager.activate(write, false);
        assert_eq!(command_name(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), "FIRST");
        assert_eq!(command_name(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), "SECOND");

        // Nothing was satisfied; a new stream sees both again, in order.
        stager.deactivate();
        let (write2, rx2) = wire_tap();
        stager.activate(write2, false);
        assert_eq!(command_name(&rx2.recv_timeout(Duration::from_secs(1)).unwrap()), "FIRST");
        assert_eq!(command_name(&rx2.recv_timeout(Duration::from_secs(1)).unwrap()), "SECOND");

        stager.begin_shutdown();
        writer.join().unwrap();
    }

    #[test]
    fn unpaired_mode_retires_entries_once_written() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::Unlimited, false));
        let writer = start_writer(&stager);

        let future = stager.stage(EncodedRequest::encode(&["SUBSCRIBE", "alpha"]));
        let (write, rx) = wire_tap();
        stager.activate(write, false);
        assert_eq!(
            command_name(&rx.recv_timeout(Duration::from_secs(1)).unwrap()),
            "SUBSCRIBE"
        );
        // Written means finished: the sink resolves to nil and the entry
        // leaves the queue.
        assert_eq!(future.wait().unwrap(), Value::Nil);
        assert_eq!(stager.pending_len(), 0);

        // A reconnect has nothing to replay.
        stager.deactivate();
        let (write2, rx2) = wire_tap();
        stager.activate(write2, false);
        assert!(rx2.recv_timeout(Duration::from_millis(100)).is_err());

        stager.begin_shutdown();
        writer.join().unwrap();
    }

    #[test]
    fn preamble_outruns_the_gated_queue() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::Unlimited, true));
        let writer = start_writer(&stager);

        let _f = stager.stage(EncodedRequest::encode(&["GET", "k"]));
        let (write, rx) = wire_tap();
        stager.activate(write, true);
        stager.stage_preamble(EncodedRequest::encode(&["AUTH", "secret"]));

        assert_eq!(command_name(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), "AUTH");
        // Gate still closed: the GET must not appear yet.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        stager.open_gate();
        assert_eq!(command_name(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), "GET");

        stager.begin_shutdown();
        writer.join().unwrap();
    }

    #[test]
    fn backpressure_blocks_until_a_slot_frees() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::PendingLimit(2), true));
        let _f1 = stager.stage(EncodedRequest::encode(&["A"]));
        let _f2 = stager.stage(EncodedRequest::encode(&["B"]));

        let stager2 = Arc::clone(&stager);
        let started = Instant::now();
        let staging = thread::spawn(move || {
            let _f3 = stager2.stage(EncodedRequest::encode(&["C"]));
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(100));
        stager.satisfy(Value::Status("OK".into())).unwrap();
        let blocked_for = staging.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(80));
        assert_eq!(stager.pending_len(), 2);
    }

    #[test]
    fn shutdown_unblocks_backpressured_callers() {
        let stager = Arc::new(RequestStager::new(BackpressureStrategy::PendingLimit(1), true));
        let _f1 = stager.stage(EncodedRequest::encode(&["A"]));
        let stager2 = Arc::clone(&stager);
        let staging = thread::spawn(move || stager2.stage(EncodedRequest::encode(&["B"])));
        thread::sleep(Duration::from_millis(50));
        stager.begin_shutdown();
        let future = staging.join().unwrap();
        assert_eq!(future.wait().unwrap(), Value::Nil);
    }
}
