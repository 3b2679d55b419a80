mod support;

use iproto_client::frame::body_key;
use iproto_client::{Config, Endpoint, Opcode};
use rmpv::Value;
use support::{field, id_response, FakeServer};

#[tokio::test]
async fn watcher_is_resubscribed_before_reconnected_connection_is_ready() {
    let server = FakeServer::bind().await;
    let config = Config::builder(Endpoint::new(server.host(), server.port())).build();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.send_greeting().await;
        let (id_header, _) = conn.expect(Opcode::Id).await;
        conn.reply_ok(id_header.sync, id_response(4, &[0, 1, 2, 3])).await;

        let (_, body) = conn.expect(Opcode::Watch).await;
        assert_eq!(field(&body, body_key::EVENT_KEY), Some(&Value::from("k")));
        conn.disconnect().await;

        let mut conn = server.accept().await;
        conn.send_greeting().await;
        let (id_header, _) = conn.expect(Opcode::Id).await;
        conn.reply_ok(id_header.sync, id_response(4, &[0, 1, 2, 3])).await;

        let (_, body) = conn.expect(Opcode::Watch).await;
        assert_eq!(field(&body, body_key::EVENT_KEY), Some(&Value::from("k")));

        conn.push_event("k", Value::from(42i64)).await;
    });

    let client = iproto_client::Connection::connect(config).await.expect("connect");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, Value)>();
    client
        .register_watcher(
            "k",
            Box::new(move |key, value| {
                let _ = tx.send((key.to_string(), value.clone()));
            }),
        )
        .await
        .expect("register watcher");

    let (key, value) = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("event delivered within deadline")
        .expect("channel not closed");
    assert_eq!(key, "k");
    assert_eq!(value, Value::from(42i64));

    server_task.await.expect("server task panicked");
    client.close().await;
}
