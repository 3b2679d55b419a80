mod support;

use iproto_client::frame::body_key;
use iproto_client::{Config, Endpoint, Opcode};
use rmpv::Value;
use sha1::{Digest, Sha1};
use support::requests::Ping;
use support::{data_body, field, id_response, FakeServer, DEFAULT_SALT};

fn expected_scramble(salt: &[u8], password: &[u8]) -> [u8; 20] {
    let sha1_pw = Sha1::digest(password);
    let sha1_sha1_pw = Sha1::digest(sha1_pw);
    let mut salted = Vec::with_capacity(salt.len() + sha1_sha1_pw.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(&sha1_sha1_pw);
    let step3 = Sha1::digest(&salted);
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = sha1_pw[i] ^ step3[i];
    }
    out
}

#[tokio::test]
async fn chap_sha1_scramble_matches_salt_and_password() {
    let server = FakeServer::bind().await;
    let config = Config::builder(Endpoint::new(server.host(), server.port()))
        .credentials("alice", "hunter2")
        .build();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.send_greeting_with_salt(&DEFAULT_SALT).await;

        let (auth_header, body) = conn.expect(Opcode::Auth).await;
        assert_eq!(field(&body, body_key::USER_NAME), Some(&Value::from("alice")));

        let tuple = field(&body, body_key::TUPLE).and_then(|v| v.as_array()).expect("tuple");
        assert_eq!(tuple[0], Value::from("chap-sha1"));
        let scramble = match &tuple[1] {
            Value::Binary(bytes) => bytes.as_slice(),
            other => panic!("expected binary scramble, got {other:?}"),
        };
        assert_eq!(scramble, expected_scramble(&DEFAULT_SALT, b"hunter2"));

        conn.reply_ok(auth_header.sync, Value::Map(vec![])).await;

        let (id_header, _) = conn.expect(Opcode::Id).await;
        conn.reply_ok(id_header.sync, id_response(4, &[0, 1, 2, 3])).await;

        let (ping_header, _) = conn.expect(Opcode::Ping).await;
        conn.reply_ok(ping_header.sync, data_body(vec![])).await;
    });

    let client = iproto_client::Connection::connect(config).await.expect("connect");
    client.submit(Ping).await.expect("ping after auth");

    server_task.await.expect("server task panicked");
    client.close().await;
}

#[tokio::test]
async fn rejected_credentials_surface_as_auth_error() {
    let server = FakeServer::bind().await;
    let config = Config::builder(Endpoint::new(server.host(), server.port()))
        .credentials("alice", "wrong")
        .build();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.send_greeting().await;
        let (auth_header, _) = conn.expect(Opcode::Auth).await;
        conn.reply_error(auth_header.sync, 42, "Incorrect password").await;
    });

    let err = iproto_client::Connection::connect(config).await.expect_err("auth should fail");
    assert!(matches!(err, iproto_client::Error::Auth(_)));

    server_task.await.expect("server task panicked");
}
