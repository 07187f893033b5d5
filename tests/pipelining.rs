//! Pipelining, ordering and backpressure of the connection session.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use web_session::http::responses::{bad_request_response, string_response};
use web_session::{Responder, SessionError, SessionSettings};

mod common;

use common::{collecting_settings, echo_path, get, spawn_session, ResponseReader};

#[tokio::test]
async fn responses_follow_request_order() {
    let (settings, mut requests) = collecting_settings();
    let (mut client, _task) = spawn_session(settings);
    let mut reader = ResponseReader::new(&mut client);

    reader.write(&format!("{}{}{}", get("/r1"), get("/r2"), get("/r3"))).await;

    let (r1, p1) = requests.recv().await.unwrap();
    let (r2, p2) = requests.recv().await.unwrap();
    let (r3, p3) = requests.recv().await.unwrap();

    // Complete out of order: R2, R1, R3.
    p2.respond(echo_path(&r2));
    tokio::time::sleep(Duration::from_millis(20)).await;
    p1.respond(echo_path(&r1));
    p3.respond(echo_path(&r3));

    for expected in ["/r1", "/r2", "/r3"] {
        let res = reader.next().await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.text(), expected);
    }
}

#[tokio::test]
async fn full_queue_withholds_next_read() {
    let (settings, mut requests) = collecting_settings();
    let (mut client, _task) = spawn_session(settings.with_request_queue_limit(2));
    let mut reader = ResponseReader::new(&mut client);

    reader.write(&format!("{}{}{}", get("/r1"), get("/r2"), get("/r3"))).await;

    let (r1, p1) = requests.recv().await.unwrap();
    let (r2, p2) = requests.recv().await.unwrap();
    let withheld = tokio::time::timeout(Duration::from_millis(100), requests.recv()).await;
    assert!(withheld.is_err(), "third request read while the queue was full");

    p1.respond(echo_path(&r1));
    assert_eq!(reader.next().await.unwrap().text(), "/r1");

    let (r3, p3) = requests.recv().await.unwrap();
    assert_eq!(r3.uri().path(), "/r3");
    p2.respond(echo_path(&r2));
    p3.respond(echo_path(&r3));
    assert_eq!(reader.next().await.unwrap().text(), "/r2");
    assert_eq!(reader.next().await.unwrap().text(), "/r3");
}

#[tokio::test]
async fn closing_response_discards_queued_responses() {
    let (settings, mut requests) = collecting_settings();
    let (mut client, task) = spawn_session(settings);

    client
        .write_all(format!("{}{}{}", get("/r1"), get("/r2"), get("/r3")).as_bytes())
        .await
        .unwrap();

    let (r1, p1) = requests.recv().await.unwrap();
    let (r2, p2) = requests.recv().await.unwrap();
    let (r3, p3) = requests.recv().await.unwrap();
    p3.respond(echo_path(&r3));
    p2.respond(echo_path(&r2));
    p1.respond(echo_path(&r1).close());

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(text.matches("HTTP/1.1 ").count(), 1);
    assert!(text.ends_with("/r1"));
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn late_completions_after_teardown_are_absorbed() {
    let (settings, mut requests) = collecting_settings();
    let (mut client, task) = spawn_session(settings);

    client
        .write_all(format!("{}{}", get("/a"), get("/b")).as_bytes())
        .await
        .unwrap();
    let (ra, pa) = requests.recv().await.unwrap();
    let (rb, pb) = requests.recv().await.unwrap();

    task.abort();
    let _ = task.await;
    drop(client);

    assert!(!pa.is_connected());
    pa.respond(echo_path(&ra));
    pb.respond(echo_path(&rb));
}

#[tokio::test]
async fn missing_handler_answers_not_found() {
    let (mut client, _task) = spawn_session(SessionSettings::new());
    let mut reader = ResponseReader::new(&mut client);

    reader.write(&get("/nowhere")).await;
    let res = reader.next().await.unwrap();
    assert_eq!(res.status, 404);
    assert_eq!(res.text(), "No handler implemented");
    assert!(res.header("server").unwrap().starts_with("web-session/"));
}

#[tokio::test]
async fn dropped_responder_answers_500_and_keeps_connection() {
    let settings = SessionSettings::new().on_http_request(|req, responder: Responder, _| {
        if req.uri().path() == "/drop" {
            drop(responder);
        } else {
            responder.respond(echo_path(&req));
        }
    });
    let (mut client, _task) = spawn_session(settings);
    let mut reader = ResponseReader::new(&mut client);

    reader.write(&format!("{}{}", get("/drop"), get("/ok"))).await;

    let res = reader.next().await.unwrap();
    assert_eq!(res.status, 500);
    assert_eq!(res.text(), "Request dropped by handler");
    assert!(res.header("connection").is_none());

    let res = reader.next().await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "/ok");
}

#[tokio::test]
async fn slow_handler_times_out() {
    let parked: Arc<Mutex<Vec<Responder>>> = Arc::default();
    let stash = parked.clone();
    let settings = SessionSettings::new()
        .with_handler_timeout(Some(Duration::from_millis(50)))
        .on_http_request(move |req, responder, _| {
            if req.uri().path() == "/slow" {
                if let Ok(mut parked) = stash.try_lock() {
                    parked.push(responder);
                }
            } else {
                responder.respond(echo_path(&req));
            }
        });
    let (mut client, task) = spawn_session(settings);
    let mut reader = ResponseReader::new(&mut client);

    reader.write(&format!("{}{}", get("/slow"), get("/fast"))).await;

    let res = reader.next().await.unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(res.text(), "Handler timed out");
    assert_eq!(reader.next().await.unwrap().text(), "/fast");

    // The original responder is now stale.
    let late = parked.lock().await.pop().unwrap();
    late.respond(bad_request_response(
        &http::Request::new(bytes::Bytes::new()),
        "too late",
    ));

    reader.write(&get("/again")).await;
    assert_eq!(reader.next().await.unwrap().text(), "/again");
    assert!(!task.is_finished());
}

#[tokio::test]
async fn unrepresentable_handler_timeout_means_no_deadline() {
    let (settings, mut requests) = collecting_settings();
    let settings = settings.with_handler_timeout(Some(Duration::from_secs(u64::MAX)));
    let (mut client, task) = spawn_session(settings);
    let mut reader = ResponseReader::new(&mut client);

    reader.write(&get("/a")).await;
    let (req, responder) = tokio::time::timeout(Duration::from_secs(1), requests.recv())
        .await
        .expect("handler was not reached")
        .unwrap();
    responder.respond(echo_path(&req));

    let res = reader.next().await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "/a");
    assert!(!task.is_finished());
}

#[tokio::test]
async fn oversized_body_is_rejected_and_closed() {
    let (settings, _requests) = collecting_settings();
    let (mut client, task) = spawn_session(settings.with_request_body_limit(16));
    let mut reader = ResponseReader::new(&mut client);

    reader
        .write("POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n")
        .await;
    let res = reader.next().await.unwrap();
    assert_eq!(res.status, 413);
    assert_eq!(res.header("connection"), Some("close"));
    assert!(reader.next().await.is_none());

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SessionError::Protocol(_))));
}

#[tokio::test]
async fn half_closed_client_still_gets_responses() {
    let settings = SessionSettings::new().on_http_request(|req, responder, _| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let res = string_response(&req, "later", StatusCode::OK, "text/plain");
            responder.respond(res);
        });
    });
    let (mut client, task) = spawn_session(settings);

    client.write_all(get("/").as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reader = ResponseReader::new(&mut client);
    assert_eq!(reader.next().await.unwrap().text(), "later");
    assert!(reader.next().await.is_none());
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn chunked_request_body_reaches_handler() {
    let (settings, mut requests) = collecting_settings();
    let (mut client, _task) = spawn_session(settings);
    let mut reader = ResponseReader::new(&mut client);

    reader
        .write("POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n")
        .await;
    let (req, responder) = requests.recv().await.unwrap();
    assert_eq!(req.body().as_ref(), b"Wikipedia");

    let body = String::from_utf8(req.body().to_vec()).unwrap();
    responder.respond(string_response(&req, &body, StatusCode::OK, "text/plain"));
    assert_eq!(reader.next().await.unwrap().text(), "Wikipedia");
}
