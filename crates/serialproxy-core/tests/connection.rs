use pretty_assertions::assert_eq;
use serialproxy_core::protocol::{
    Connection, ConnectionOptions, Frame, FrameDecoder, FramingError, ProtocolError, Request,
    ScriptedTransport,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(read_timeout_ms: u64) -> ConnectionOptions {
    ConnectionOptions::default()
        .with_read_timeout(Duration::from_millis(read_timeout_ms))
        .with_poll_interval(Duration::from_millis(5))
}

/// Poll `condition` until it holds or two seconds pass
async fn wait_for(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(2), "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_batch_results_in_submission_order() {
    init_tracing();
    let mock = ScriptedTransport::new();
    mock.reply("SET1", &["SETOK"])
        .reply("READ", &["1", "2", "READ=42"])
        .reply("MODE", &["busy", "MODEOK"]);
    let conn = Connection::new(mock.clone(), options(500)).unwrap();

    let responses = conn
        .execute_all(vec![
            Request::exact("SET1", "SETOK"),
            Request::pattern("READ", r"^READ=(\d+)$").unwrap(),
            Request::exact("MODE", "MODEOK"),
        ])
        .await
        .expect("all replies");

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].lines, vec!["SETOK"]);
    assert_eq!(responses[1].lines, vec!["1", "2", "READ=42"]);
    assert_eq!(responses[1].end_match.as_ref().unwrap().get(1), Some("42"));
    assert_eq!(responses[2].last_line(), Some("MODEOK"));
    assert_eq!(mock.written_lines(), vec!["SET1", "READ", "MODE"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_never_interleave() {
    init_tracing();
    let mock = ScriptedTransport::new();
    for i in 0..10 {
        for j in 0..3 {
            let command = format!("T{}-{}", i, j);
            mock.reply(&command, &[format!("{}OK", command).as_str()]);
        }
    }
    let conn = Arc::new(Connection::new(mock.clone(), options(500)).unwrap());

    let mut tasks = Vec::new();
    for i in 0..10 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let batch = (0..3)
                .map(|j| {
                    let command = format!("T{}-{}", i, j);
                    let terminator = format!("{}OK", command);
                    Request::exact(command, terminator)
                })
                .collect();
            conn.execute_all(batch).await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("batch succeeds");
    }

    let written = mock.written_lines();
    assert_eq!(written.len(), 30);
    for chunk in written.chunks(3) {
        let prefix = chunk[0].split('-').next().unwrap().to_string();
        let expected: Vec<String> = (0..3).map(|j| format!("{}-{}", prefix, j)).collect();
        assert_eq!(chunk.to_vec(), expected);
    }
}

#[tokio::test]
async fn test_timeout_abandons_rest_of_batch() {
    init_tracing();
    let mock = ScriptedTransport::new();
    mock.reply("AV", &["garbage"]).reply("NEXT", &["NEXTOK"]);
    let conn = Connection::new(mock.clone(), options(150)).unwrap();

    let start = Instant::now();
    let results = conn
        .execute(vec![
            Request::exact("AV", "AVOK"),
            Request::exact("NEXT", "NEXTOK"),
        ])
        .await;
    let elapsed = start.elapsed();

    let expected = ProtocolError::Timeout {
        command: "AV".to_string(),
        timeout_ms: 150,
    };
    assert_eq!(results, vec![Err(expected.clone()), Err(expected)]);
    assert!(elapsed >= Duration::from_millis(150), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "returned late: {:?}", elapsed);
    assert_eq!(mock.written_lines(), vec!["AV"]);

    // The connection stays usable after a timeout
    let response = conn
        .execute_one(Request::exact("NEXT", "NEXTOK"))
        .await
        .expect("reply");
    assert_eq!(response.lines, vec!["NEXTOK"]);
}

#[tokio::test]
async fn test_per_request_timeout_override() {
    let mock = ScriptedTransport::new();
    let conn = Connection::new(mock, options(5_000)).unwrap();

    let start = Instant::now();
    let err = conn
        .execute_one(Request::exact("SLOW", "OK").with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout { timeout_ms: 50, .. }));
    assert!(start.elapsed() < Duration::from_millis(1000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_only_affects_its_batch() {
    init_tracing();
    let mock = ScriptedTransport::new();
    mock.reply("PING", &["PONG"]);
    let conn = Arc::new(Connection::new(mock.clone(), options(5_000)).unwrap());

    let cancel = CancellationToken::new();
    let waiting = {
        let conn = conn.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            conn.execute_with(
                vec![Request::exact("HANG", "NEVER"), Request::exact("PING", "PONG")],
                cancel,
            )
            .await
        })
    };

    wait_for(|| mock.written_lines() == vec!["HANG"]).await;
    let start = Instant::now();
    cancel.cancel();
    let results = waiting.await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(1000));
    assert_eq!(
        results,
        vec![Err(ProtocolError::Cancelled), Err(ProtocolError::Cancelled)]
    );

    let pong = conn.execute_one(Request::exact("PING", "PONG")).await.unwrap();
    assert_eq!(pong.lines, vec!["PONG"]);
    assert_eq!(mock.written_lines(), vec!["HANG", "PING"]);
}

#[tokio::test]
async fn test_out_of_band_dispatch() {
    init_tracing();
    let mock = ScriptedTransport::new();
    let conn = Connection::new(mock.clone(), options(500)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));

    let sink = seen.clone();
    conn.register_event(r"^X(\d+)Y$", move |groups| {
        sink.lock().unwrap().push(groups.get(1).unwrap().to_string());
    })
    .unwrap();
    let sink = seen.clone();
    conn.register_event("^Z$", move |_| sink.lock().unwrap().push("*".to_string()))
        .unwrap();
    let sink = seen.clone();
    conn.register_event("^X12Y$", move |_| sink.lock().unwrap().insert(0, "!".to_string()))
        .unwrap();

    for line in ["X12Y", "X1-2Y", "X13Y", "Z", "A", "Z"] {
        mock.push_line(line);
    }

    wait_for(|| seen.lock().unwrap().len() == 5).await;
    // Give a stray extra dispatch a chance to show up
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["!", "12", "13", "*", "*"]);
}

#[tokio::test]
async fn test_reply_lines_are_not_out_of_band() {
    let mock = ScriptedTransport::new();
    mock.reply("SIR", &["EVENT", "SIROK"]);
    let conn = Connection::new(mock.clone(), options(500)).unwrap();
    let events = Arc::new(Mutex::new(0usize));

    let counter = events.clone();
    conn.register_event("^EVENT$", move |_| *counter.lock().unwrap() += 1)
        .unwrap();

    let response = conn.execute_one(Request::exact("SIR", "SIROK")).await.unwrap();
    assert_eq!(response.lines, vec!["EVENT", "SIROK"]);

    mock.push_line("EVENT");
    wait_for(|| *events.lock().unwrap() == 1).await;
}

#[tokio::test]
async fn test_panicking_handler_keeps_reader_alive() {
    let mock = ScriptedTransport::new();
    mock.reply("AV", &["AVOK"]);
    let conn = Connection::new(mock.clone(), options(500)).unwrap();
    conn.register_event("^BOOM$", |_| panic!("handler bug")).unwrap();

    mock.push_line("BOOM");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let response = conn.execute_one(Request::exact("AV", "AVOK")).await.unwrap();
    assert_eq!(response.lines, vec!["AVOK"]);
}

#[tokio::test]
async fn test_raw_frame_round_trip() {
    init_tracing();
    let request = Frame::new(vec![0x10, 0x02, 0x03]).unwrap().encode();
    let reply = Frame::new(vec![0x90, 0x00, 0xAB]).unwrap().encode();
    let mock = ScriptedTransport::new();
    mock.reply_raw(&request, &reply).reply("AV", &["AVOK"]);
    let conn = Connection::new(mock.clone(), options(200)).unwrap();

    let payload = conn
        .execute_raw(request.clone(), FrameDecoder::new())
        .await
        .expect("frame");
    assert_eq!(payload, vec![0x90, 0x00, 0xAB]);
    assert_eq!(mock.written_raw(), vec![request]);

    // Line mode resumes afterwards
    let response = conn.execute_one(Request::exact("AV", "AVOK")).await.unwrap();
    assert_eq!(response.lines, vec!["AVOK"]);
}

#[tokio::test]
async fn test_raw_corrupted_checksum_is_framing_error() {
    let request = Frame::new(vec![0x11]).unwrap().encode();
    let mut reply = Frame::new(vec![0x91, 0x01]).unwrap().encode();
    let checksum_index = reply.len() - 2;
    reply[checksum_index] ^= 0x55;

    let mock = ScriptedTransport::new();
    mock.reply_raw(&request, &reply);
    let conn = Connection::new(mock, options(200)).unwrap();

    let err = conn
        .execute_raw(request, FrameDecoder::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Framing(FramingError::ChecksumMismatch { .. })
    ));
    // Framing errors do not take the connection down
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_raw_bytes_bypass_out_of_band() {
    let mock = ScriptedTransport::new();
    mock.reply_raw(b"GET", b"Z\n");
    let conn = Connection::new(mock.clone(), options(200)).unwrap();
    let fired = Arc::new(Mutex::new(false));
    let flag = fired.clone();
    conn.register_event("^Z$", move |_| *flag.lock().unwrap() = true)
        .unwrap();

    let line = conn
        .execute_raw_with(|port| {
            port.write(b"GET")?;
            let mut bytes = Vec::new();
            loop {
                match port.read_byte()? {
                    b'\n' => return Ok(bytes),
                    b => bytes.push(b),
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(line, b"Z".to_vec());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!*fired.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transport_failure_fails_queued_batches() {
    init_tracing();
    let mock = ScriptedTransport::new();
    let conn = Arc::new(Connection::new(mock.clone(), options(5_000)).unwrap());

    let first = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.execute_one(Request::exact("HANG", "NEVER")).await })
    };
    wait_for(|| mock.written_lines() == vec!["HANG"]).await;

    let queued = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.execute_one(Request::exact("NEXT", "NEXTOK")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    mock.fail_reads("device unplugged");
    let failure = ProtocolError::TransportFailure("device unplugged".to_string());
    assert_eq!(first.await.unwrap(), Err(failure.clone()));
    assert_eq!(queued.await.unwrap(), Err(failure));

    assert!(conn.is_closed());
    assert_eq!(
        conn.execute_one(Request::exact("NEXT", "NEXTOK")).await,
        Err(ProtocolError::ConnectionClosed)
    );
    assert_eq!(mock.written_lines(), vec!["HANG"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_fails_active_and_queued_requests() {
    init_tracing();
    let mock = ScriptedTransport::new();
    let conn = Arc::new(Connection::new(mock.clone(), options(5_000)).unwrap());

    let mut tasks = Vec::new();
    for i in 0..3 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            conn.execute(vec![
                Request::exact(format!("Q{}", i), "OK"),
                Request::exact("AFTER", "OK"),
            ])
            .await
        }));
    }
    wait_for(|| !mock.written_lines().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    conn.close().unwrap();
    for task in tasks {
        assert_eq!(
            task.await.unwrap(),
            vec![
                Err(ProtocolError::ConnectionClosed),
                Err(ProtocolError::ConnectionClosed)
            ]
        );
    }
    assert!(mock.is_closed());
    assert_eq!(mock.written_lines().len(), 1);

    // Second close is a no-op
    conn.close().unwrap();
    assert_eq!(
        conn.execute_raw(vec![0xA5], FrameDecoder::new()).await,
        Err(ProtocolError::ConnectionClosed)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_transport_failure_closes_connection() {
    init_tracing();
    let mock = ScriptedTransport::new();
    let conn = Arc::new(Connection::new(mock.clone(), options(5_000)).unwrap());
    let (go, wait) = std::sync::mpsc::channel::<()>();

    let raw = {
        let conn = conn.clone();
        let line = mock.clone();
        tokio::spawn(async move {
            conn.execute_raw_with(move |port| {
                let _ = wait.recv_timeout(Duration::from_secs(2));
                port.write(&[0xA5, 0x00, 0x00, 0x5A])?;
                line.fail_reads("adapter reset");
                port.read_byte()
            })
            .await
        })
    };
    // Let the raw exchange take the line before queueing behind it
    tokio::time::sleep(Duration::from_millis(30)).await;

    let queued = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.execute_one(Request::exact("AV", "AVOK")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    go.send(()).unwrap();

    let failure = ProtocolError::TransportFailure("adapter reset".to_string());
    assert_eq!(raw.await.unwrap(), Err(failure.clone()));
    assert_eq!(queued.await.unwrap(), Err(failure));
    assert!(conn.is_closed());
    assert!(mock.written_lines().is_empty());
    assert_eq!(
        conn.execute_one(Request::exact("AV", "AVOK")).await,
        Err(ProtocolError::ConnectionClosed)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_queued_batch_never_sent() {
    init_tracing();
    let mock = ScriptedTransport::new();
    mock.reply("PING", &["PONG"]);
    let conn = Arc::new(Connection::new(mock.clone(), options(5_000)).unwrap());

    let first = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.execute_one(
                Request::exact("HANG", "NEVER").with_timeout(Duration::from_millis(200)),
            )
            .await
        })
    };
    wait_for(|| mock.written_lines() == vec!["HANG"]).await;

    let cancel = CancellationToken::new();
    let queued = {
        let conn = conn.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            conn.execute_with(
                vec![Request::exact("SET", "SETOK"), Request::exact("READ", "READOK")],
                cancel,
            )
            .await
        })
    };
    let behind = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.execute_one(Request::exact("PING", "PONG")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    assert!(matches!(
        first.await.unwrap(),
        Err(ProtocolError::Timeout { timeout_ms: 200, .. })
    ));
    assert_eq!(
        queued.await.unwrap(),
        vec![Err(ProtocolError::Cancelled), Err(ProtocolError::Cancelled)]
    );
    assert_eq!(behind.await.unwrap().unwrap().lines, vec!["PONG"]);
    assert_eq!(mock.written_lines(), vec!["HANG", "PING"]);
}
