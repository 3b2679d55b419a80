mod support;

use iproto_client::{CancelToken, Config, Endpoint, Opcode};
use support::id_response;
use support::requests::CancellablePing;
use support::FakeServer;

/// A request whose cancellation token fires before the server ever replies
/// resolves with `Error::Cancelled` instead of hanging until a deadline.
#[tokio::test]
async fn cancelling_before_a_reply_arrives_surfaces_cancelled() {
    let server = FakeServer::bind().await;
    let config = Config::builder(Endpoint::new(server.host(), server.port())).build();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.send_greeting().await;
        let (id_header, _) = conn.expect(Opcode::Id).await;
        conn.reply_ok(id_header.sync, id_response(4, &[0, 1, 2, 3])).await;

        // Deliberately never reply to the PING: the client must not hang
        // waiting for a response that's never coming once cancelled.
        let _ = conn.expect(Opcode::Ping).await;
    });

    let client = iproto_client::Connection::connect(config).await.expect("connect");

    let cancel = CancelToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel_clone.cancel();
    });

    let err = client
        .submit(CancellablePing { cancel })
        .await
        .expect_err("cancelled request must not resolve successfully");
    assert!(matches!(err, iproto_client::Error::Cancelled));

    server_task.await.expect("server task panicked");
    client.close().await;
}

/// A token cancelled before `submit` is even called resolves immediately.
#[tokio::test]
async fn an_already_cancelled_token_short_circuits_immediately() {
    let server = FakeServer::bind().await;
    let config = Config::builder(Endpoint::new(server.host(), server.port())).build();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.send_greeting().await;
        let (id_header, _) = conn.expect(Opcode::Id).await;
        conn.reply_ok(id_header.sync, id_response(4, &[0, 1, 2, 3])).await;
        let _ = conn.expect(Opcode::Ping).await;
    });

    let client = iproto_client::Connection::connect(config).await.expect("connect");

    let cancel = CancelToken::new();
    cancel.cancel();

    let elapsed = std::time::Instant::now();
    let err = client
        .submit(CancellablePing { cancel })
        .await
        .expect_err("pre-cancelled request must not resolve successfully");
    assert!(matches!(err, iproto_client::Error::Cancelled));
    assert!(elapsed.elapsed() < std::time::Duration::from_secs(1));

    server_task.await.expect("server task panicked");
    client.close().await;
}
