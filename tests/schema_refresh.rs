mod support;

use iproto_client::frame::body_key;
use iproto_client::{Config, Endpoint, Opcode};
use rmpv::Value;
use support::requests::Select;
use support::{data_body, field, id_response, vindex_row, vspace_row, FakeServer};

/// A server reporting protocol version 2 never gets name-based addressing:
/// the client must resolve "test"/"primary" against `_vspace`/`_vindex`
/// itself, and concurrent lookups against a cold cache must still only pay
/// for one refresh round trip.
#[tokio::test]
async fn concurrent_lookups_against_a_cold_cache_refresh_exactly_once() {
    let server = FakeServer::bind().await;
    let config = Config::builder(Endpoint::new(server.host(), server.port())).build();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.send_greeting().await;

        let (id_header, _) = conn.expect(Opcode::Id).await;
        conn.reply_ok(id_header.sync, id_response(2, &[0, 1])).await;

        let (vspace_header, body) = conn.expect(Opcode::Select).await;
        assert_eq!(field(&body, body_key::SPACE_ID), Some(&Value::from(281u32)));
        conn.reply_ok(vspace_header.sync, data_body(vec![vspace_row(512, "test")])).await;

        let (vindex_header, body) = conn.expect(Opcode::Select).await;
        assert_eq!(field(&body, body_key::SPACE_ID), Some(&Value::from(289u32)));
        conn.reply_ok(vindex_header.sync, data_body(vec![vindex_row(512, 0, "primary")])).await;

        for _ in 0..3 {
            let (select_header, body) = conn.expect(Opcode::Select).await;
            assert_eq!(field(&body, body_key::SPACE_ID), Some(&Value::from(512u32)));
            assert_eq!(field(&body, body_key::INDEX_ID), Some(&Value::from(0u32)));
            let row = Value::Array(vec![Value::from(1i64), Value::from("a")]);
            conn.reply_ok(select_header.sync, data_body(vec![row])).await;
        }
    });

    let client = iproto_client::Connection::connect(config).await.expect("connect");

    let (a, b, c) = tokio::join!(
        client.submit(Select::by_name("test", "primary", vec![Value::from(1i64)])),
        client.submit(Select::by_name("test", "primary", vec![Value::from(1i64)])),
        client.submit(Select::by_name("test", "primary", vec![Value::from(1i64)])),
    );
    a.expect("select a succeeds");
    b.expect("select b succeeds");
    c.expect("select c succeeds");

    server_task.await.expect("server task panicked");
    client.close().await;
}
