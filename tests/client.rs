//! End-to-end client scenarios against in-process RESP servers.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use revhash::{
    add_intercept, AuthHandshake, BackpressureStrategy, Client, ClientOptions,
    ConnectionListener, Disconnect, Members, RetryStrategy, Value,
};

fn options(port: u16) -> ClientOptions {
    ClientOptions::new(Members::single("127.0.0.1", port))
}

#[test]
fn happy_pipeline_resolves_in_order() {
    let (listener, port) = listen();
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        while let Some(command) = conn.command() {
            match command[0].as_str() {
                "PING" => conn.write(&enc_status("PONG")),
                "ECHO" => conn.write(&enc_bulk(&command[1])),
                other => conn.write(&enc_error(&format!("ERR unknown command {other}"))),
            }
        }
    });

    let client = Client::new(options(port));
    let first = client.execute(&["PING"]);
    let second = client.execute(&["ECHO", "x"]);
    let third = client.execute(&["PING"]);

    assert_eq!(first.wait().unwrap(), Value::Status("PONG".into()));
    assert_eq!(second.wait().unwrap(), Value::bulk("x"));
    assert_eq!(third.wait().unwrap(), Value::Status("PONG".into()));
}

#[test]
fn moved_error_redirects_and_replays() {
    // The redirect points at a port nobody listens on; an intercept maps
    // it to the real second server.
    let (first_listener, first_port) = listen();
    let (second_listener, second_port) = listen();
    add_intercept("127.0.0.1", 7781, "127.0.0.1", second_port);

    thread::spawn(move || {
        let (stream, _) = first_listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        let command = conn.command().expect("first command");
        assert_eq!(command[0], "PING");
        conn.write(&enc_error("MOVED 0 127.0.0.1:7781"));
    });
    thread::spawn(move || {
        let (stream, _) = second_listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        while let Some(command) = conn.command() {
            assert_eq!(command[0], "PING");
            conn.write(&enc_status("PONG"));
        }
    });

    let mut options = options(first_port);
    options.transparent_redirects = true;
    options.retry_strategy = RetryStrategy::InfiniteRetries;
    let client = Client::new(options);

    let reply = client.execute(&["PING"]).wait().unwrap();
    assert_eq!(reply, Value::Status("PONG".into()));
}

#[test]
fn infinite_retries_replays_after_reconnect() {
    let (listener, port) = listen();
    thread::spawn(move || {
        // First connection: swallow both commands, then drop.
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        conn.command().expect("first command");
        conn.command().expect("second command");
        drop(conn);

        // Second connection: both commands come back, in order.
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        assert_eq!(conn.command().expect("replayed first")[1], "one");
        assert_eq!(conn.command().expect("replayed second")[1], "two");
        conn.write(&enc_int(1));
        conn.write(&enc_int(2));
        // Keep the connection open until the client goes away.
        while conn.command().is_some() {}
    });

    let mut options = options(port);
    options.retry_strategy = RetryStrategy::InfiniteRetries;
    let client = Client::new(options);

    let first = client.execute(&["GET", "one"]);
    let second = client.execute(&["GET", "two"]);
    assert_eq!(first.wait().unwrap(), Value::Integer(1));
    assert_eq!(second.wait().unwrap(), Value::Integer(2));
}

#[test]
fn no_retries_answers_with_nil_on_disconnect() {
    let (listener, port) = listen();
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        conn.command().expect("first command");
        conn.command().expect("second command");
        drop(conn);
        // Accept reconnects so the engine isn't stuck in refused loops.
        while let Ok((stream, _)) = listener.accept() {
            let mut conn = FrameConn::new(stream);
            while conn.command().is_some() {}
        }
    });

    let client = Client::new(options(port));
    let first = client.execute(&["GET", "one"]);
    let second = client.execute(&["GET", "two"]);
    assert_eq!(first.wait().unwrap(), Value::Nil);
    assert_eq!(second.wait().unwrap(), Value::Nil);
}

#[test]
fn backpressure_blocks_then_unblocks() {
    let (listener, port) = listen();
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        conn.command().expect("first command");
        conn.command().expect("second command");
        release_rx.recv().expect("release signal");
        conn.write(&enc_status("OK"));
        conn.command().expect("third command");
        conn.write(&enc_status("OK"));
        conn.write(&enc_status("OK"));
    });

    let mut options = options(port);
    options.backpressure = BackpressureStrategy::PendingLimit(2);
    let client = Arc::new(Client::new(options));

    let _first = client.execute(&["SET", "a", "1"]);
    let _second = client.execute(&["SET", "b", "2"]);

    let client2 = Arc::clone(&client);
    let started = Instant::now();
    let staging = thread::spawn(move || {
        let future = client2.execute(&["SET", "c", "3"]);
        (started.elapsed(), future)
    });

    // The third execute must still be blocked on the pending limit.
    thread::sleep(Duration::from_millis(150));
    release_tx.send(()).expect("release");

    let (blocked_for, third) = staging.join().expect("staging thread");
    assert!(
        blocked_for >= Duration::from_millis(100),
        "third execute should have blocked, took {blocked_for:?}"
    );
    assert_eq!(third.wait().unwrap(), Value::Status("OK".into()));
}

#[test]
fn handshake_runs_before_queued_traffic() {
    let (listener, port) = listen();
    thread::spawn(move || {
        // First attempt: reject the credentials; the client must drop the
        // connection and try again.
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        assert_eq!(
            conn.command().expect("auth"),
            vec!["AUTH".to_string(), "sesame".to_string()]
        );
        conn.write(&enc_error("ERR invalid password"));

        // Second attempt: accept, then serve. The AUTH frame must arrive
        // before the user's PING even though PING was staged first.
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        assert_eq!(conn.command().expect("auth again")[0], "AUTH");
        conn.write(&enc_status("OK"));
        assert_eq!(conn.command().expect("ping")[0], "PING");
        conn.write(&enc_status("PONG"));
        while conn.command().is_some() {}
    });

    let mut options = options(port);
    options.retry_strategy = RetryStrategy::InfiniteRetries;
    options.handshake = Some(Box::new(AuthHandshake::new("sesame")));
    let client = Client::new(options);

    let reply = client.execute(&["PING"]).wait().unwrap();
    assert_eq!(reply, Value::Status("PONG".into()));
}

#[test]
fn listeners_observe_epochs() {
    struct Recorder {
        events: crossbeam::channel::Sender<(bool, u64)>,
    }
    impl ConnectionListener for Recorder {
        fn connection_established(&self, epoch: u64) {
            let _ = self.events.send((true, epoch));
        }
        fn connection_lost(&self, epoch: u64, _reason: &Disconnect) {
            let _ = self.events.send((false, epoch));
        }
    }

    // Serve exactly one command per connection, then hang up; every PING
    // forces a reconnect and an epoch bump.
    let (listener, port) = listen();
    thread::spawn(move || {
        while let Ok((stream, _)) = listener.accept() {
            let mut conn = FrameConn::new(stream);
            if conn.command().is_some() {
                conn.write(&enc_status("PONG"));
            }
        }
    });

    let (events_tx, events_rx) = crossbeam::channel::unbounded();
    let mut options = options(port);
    options.retry_strategy = RetryStrategy::InfiniteRetries;
    let client = Client::new(options);
    let recorder: Arc<dyn ConnectionListener> = Arc::new(Recorder { events: events_tx });
    client.attach_listener(&recorder);

    assert_eq!(
        client.execute(&["PING"]).wait().unwrap(),
        Value::Status("PONG".into())
    );
    assert_eq!(
        client.execute(&["PING"]).wait().unwrap(),
        Value::Status("PONG".into())
    );

    // The first established may beat attach_listener, but the hangup after
    // the first PING must surface as a loss followed by a higher epoch.
    let mut saw_lost = false;
    let mut saw_reconnect = false;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && !(saw_lost && saw_reconnect) {
        match events_rx.recv_timeout(Duration::from_millis(200)) {
            Ok((false, _)) => saw_lost = true,
            Ok((true, epoch)) if epoch >= 2 => saw_reconnect = true,
            _ => {}
        }
    }
    assert!(saw_lost, "connection_lost never fired");
    assert!(saw_reconnect, "epoch did not advance on reconnect");
    assert!(client.epoch() >= 2);
}

#[test]
fn sync_wrappers_translate_replies() {
    let (listener, port) = listen();
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut conn = FrameConn::new(stream);
        while let Some(command) = conn.command() {
            match command[0].as_str() {
                "EXISTS" => conn.write(&enc_int(1)),
                "DEL" => conn.write(&enc_int(0)),
                _ => conn.write(&enc_error("ERR nope")),
            }
        }
    });

    let client = Client::new(options(port));
    assert_eq!(client.exists("somekey").unwrap(), 1);
    assert_eq!(client.del("somekey").unwrap(), 0);
    assert!(client
        .execute(&["WHATEVER"])
        .wait()
        .map(|reply| matches!(reply, Value::Error(_)))
        .unwrap());
}
