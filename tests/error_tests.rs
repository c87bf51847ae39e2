use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tperf::protocol::{encode_blob, COOKIE_SIZE};
use tperf::{Client, Config, ErrorCode, ErrorKind, Mode, Server};

fn local_server(port: u16) -> Config {
    Config::server(port).with_bind_addr("127.0.0.1".parse().unwrap())
}

fn local_client(port: u16) -> Config {
    Config::client("127.0.0.1".to_string(), port)
}

/// Accepts one control connection, reads the cookie and answers with `reply`.
async fn fake_responder(reply: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut cookie = [0u8; COOKIE_SIZE];
        stream.read_exact(&mut cookie).await.unwrap();
        stream.write_all(&reply).await.unwrap();
        // Hold the connection open until the client hangs up.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });
    port
}

#[tokio::test]
async fn test_busy_server_denies_second_client() {
    let server = Server::new(local_server(25331)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let first = tokio::spawn(async move {
        Client::new(local_client(25331).with_duration(Duration::from_secs(2)))
            .unwrap()
            .run()
            .await
    });
    sleep(Duration::from_millis(700)).await;

    let second = Client::new(local_client(25331).with_duration(Duration::from_secs(1))).unwrap();
    let err = second.run().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AccessDenied);
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(second.results().is_none());

    let results = first.await.unwrap().unwrap();
    assert!(results.complete);
    assert!(results.bytes_sent > 0);
}

#[tokio::test]
async fn test_admission_rejects_excess_bandwidth() {
    let server = Server::new(local_server(25332).with_bitrate_limit(3)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let config = local_client(25332).with_parallel(4).with_bandwidth(1);
    let err = Client::new(config).unwrap().run().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TotalRate);
    assert_eq!(err.kind(), ErrorKind::Admission);
    assert_eq!(err.peer_errno(), Some(0));

    // A refused test does not wedge the server.
    let config = local_client(25332).with_duration(Duration::from_secs(1));
    let results = Client::new(config).unwrap().run().await.unwrap();
    assert!(results.complete);
}

#[tokio::test]
async fn test_stray_connection_is_denied_during_a_test() {
    let server = Server::new(local_server(25333)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let test = tokio::spawn(async move {
        Client::new(local_client(25333).with_duration(Duration::from_secs(2)))
            .unwrap()
            .run()
            .await
    });
    sleep(Duration::from_millis(700)).await;

    let mut stray = TcpStream::connect("127.0.0.1:25333").await.unwrap();
    stray.write_all(&[b'x'; COOKIE_SIZE]).await.unwrap();
    let mut answer = [0u8; 1];
    timeout(Duration::from_secs(3), stray.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer[0], 0xFF);

    let results = test.await.unwrap().unwrap();
    assert!(results.complete);
    assert_eq!(results.streams.len(), 1);
}

#[tokio::test]
async fn test_client_cancellation_ends_the_test_cleanly() {
    let server = Server::new(local_server(25334)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let client = Client::new(local_client(25334).with_duration(Duration::from_secs(10))).unwrap();
    let token = client.cancellation_token().clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        token.cancel();
    });

    let results = timeout(Duration::from_secs(5), client.run())
        .await
        .unwrap()
        .unwrap();
    assert!(results.complete);
    assert!(results.duration < Duration::from_secs(3));
    assert_eq!(results.peer_bytes_received(), results.bytes_sent);
}

#[tokio::test]
async fn test_server_cancellation_terminates_the_client() {
    let server = Server::new(local_server(25335)).unwrap();
    let token = server.cancellation_token().clone();
    let server_task = tokio::spawn(async move { server.run().await });
    sleep(Duration::from_millis(100)).await;

    let client = Client::new(
        local_client(25335)
            .with_duration(Duration::from_secs(10))
            .with_mode(Mode::Receive),
    )
    .unwrap();
    let client_task = tokio::spawn(async move {
        let outcome = client.run().await;
        (outcome, client.results())
    });

    sleep(Duration::from_secs(1)).await;
    token.cancel();

    let (outcome, partial) = timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap_err().code(), ErrorCode::ServerTerminated);
    let partial = partial.expect("partial results after the test started");
    assert!(!partial.complete);
    assert!(partial.bytes_received > 0);

    let served = timeout(Duration::from_secs(5), server_task).await.unwrap().unwrap();
    assert!(served.is_ok());
}

#[tokio::test]
async fn test_peer_error_carries_code_and_errno() {
    let mut reply = vec![0xFE];
    reply.extend_from_slice(&27i32.to_be_bytes());
    reply.extend_from_slice(&111i32.to_be_bytes());
    let port = fake_responder(reply).await;

    let err = Client::new(local_client(port)).unwrap().run().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TotalRate);
    assert_eq!(err.peer_errno(), Some(111));
}

#[tokio::test]
async fn test_unknown_control_byte_fails_the_session() {
    let port = fake_responder(vec![3]).await;

    let err = Client::new(local_client(port)).unwrap().run().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Message);
}

#[tokio::test]
async fn test_control_close_before_the_test() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut cookie = [0u8; COOKIE_SIZE];
        stream.read_exact(&mut cookie).await.unwrap();
    });

    let err = Client::new(local_client(port)).unwrap().run().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CtrlClose);
}

#[tokio::test]
async fn test_bad_parameters_are_reported_to_the_initiator() {
    let server = Server::new(local_server(25336)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let mut ctrl = TcpStream::connect("127.0.0.1:25336").await.unwrap();
    ctrl.write_all(&[b'a'; COOKIE_SIZE]).await.unwrap();

    let mut state = [0u8; 1];
    ctrl.read_exact(&mut state).await.unwrap();
    assert_eq!(state[0], 9);

    let params = encode_blob(&serde_json::json!({"tcp": true, "time": 1, "parallel": 0})).unwrap();
    ctrl.write_all(&params).await.unwrap();

    ctrl.read_exact(&mut state).await.unwrap();
    assert_eq!(state[0], 0xFE);
    let mut code = [0u8; 8];
    ctrl.read_exact(&mut code).await.unwrap();
    assert_eq!(i32::from_be_bytes([code[0], code[1], code[2], code[3]]), 6);

    // The server moves on to the next test.
    let results = Client::new(local_client(25336).with_duration(Duration::from_secs(1)))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert!(results.complete);
}

#[tokio::test]
async fn test_client_terminate_frees_the_server() {
    let server = Server::new(local_server(25337)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let mut ctrl = TcpStream::connect("127.0.0.1:25337").await.unwrap();
    ctrl.write_all(&[b'b'; COOKIE_SIZE]).await.unwrap();
    let mut state = [0u8; 1];
    ctrl.read_exact(&mut state).await.unwrap();
    assert_eq!(state[0], 9);

    let params = encode_blob(&serde_json::json!({"tcp": true, "time": 1, "parallel": 1})).unwrap();
    ctrl.write_all(&params).await.unwrap();
    ctrl.read_exact(&mut state).await.unwrap();
    assert_eq!(state[0], 10);

    ctrl.write_all(&[12]).await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(3), ctrl.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    let results = Client::new(local_client(25337).with_duration(Duration::from_secs(1)))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert!(results.complete);
}

#[tokio::test]
async fn test_fractional_duration_is_refused_before_connecting() {
    let err = Client::new(local_client(25338).with_duration(Duration::from_millis(500)))
        .err()
        .expect("a half-second test cannot be negotiated");
    assert_eq!(err.code(), ErrorCode::Duration);
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = Client::new(local_client(25338).with_omit(Duration::from_millis(1500)))
        .err()
        .expect("a fractional warm-up cannot be negotiated");
    assert_eq!(err.code(), ErrorCode::Omit);
}

#[tokio::test]
async fn test_silent_stray_connection_is_denied_after_the_cookie_wait() {
    let server = Server::new(local_server(25339)).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    sleep(Duration::from_millis(100)).await;

    let test = tokio::spawn(async move {
        Client::new(local_client(25339).with_duration(Duration::from_secs(3)))
            .unwrap()
            .run()
            .await
    });
    sleep(Duration::from_millis(700)).await;

    // Connects and never presents a cookie.
    let mut stray = TcpStream::connect("127.0.0.1:25339").await.unwrap();
    let mut answer = [0u8; 1];
    timeout(Duration::from_secs(3), stray.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer[0], 0xFF);

    let results = test.await.unwrap().unwrap();
    assert!(results.complete);
    assert_eq!(results.peer_bytes_received(), results.bytes_sent);
}
