use futures::future::join_all;
use serialproxy_core::protocol::{Connection, ConnectionOptions, ProtocolError, Request, ScriptedTransport};
use serialproxy_core::share::ResponseShare;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting_share(runs: Arc<AtomicUsize>) -> Arc<ResponseShare<usize>> {
    Arc::new(ResponseShare::new(move || {
        let runs = runs.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }))
}

async fn round(share: &Arc<ResponseShare<usize>>, callers: usize) -> Vec<Result<usize, ProtocolError>> {
    let tasks = (0..callers).map(|_| {
        let share = share.clone();
        tokio::spawn(async move { share.execute().await })
    });
    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_callers_share_one_execution() {
    let runs = Arc::new(AtomicUsize::new(0));
    let share = counting_share(runs.clone());

    let first = round(&share, 100).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(first.iter().all(|r| *r == Ok(1)));
    assert!(!share.is_in_flight());

    let second = round(&share, 100).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(second.iter().all(|r| *r == Ok(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_instrument_query() {
    let mock = ScriptedTransport::new();
    mock.reply("AV", &["230.01", "AVOK"]);
    mock.set_reply_delay(Duration::from_millis(50));
    let conn = Arc::new(
        Connection::new(
            mock.clone(),
            ConnectionOptions::default().with_read_timeout(Duration::from_millis(500)),
        )
        .unwrap(),
    );

    let query_conn = conn.clone();
    let share = Arc::new(ResponseShare::new(move || {
        let conn = query_conn.clone();
        async move {
            let response = conn.execute_one(Request::exact("AV", "AVOK")).await?;
            Ok::<_, ProtocolError>(response.body().join(";"))
        }
    }));

    let tasks = (0..20).map(|_| {
        let share = share.clone();
        tokio::spawn(async move { share.execute().await })
    });
    for joined in join_all(tasks).await {
        assert_eq!(joined.unwrap(), Ok("230.01".to_string()));
    }
    assert_eq!(mock.written_lines(), vec!["AV"]);
}
