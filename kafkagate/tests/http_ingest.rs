// End-to-end HTTP ingest: real listener, real requests over a socket, records
// consumed back from a mock Kafka cluster.

mod common;

use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kafkagate::config::{HttpOptions, ListenerConfig, Proto, SocketOptions};
use kafkagate::decode::DecoderKind;
use kafkagate::listener::Listener;

use common::{assert_no_records, consume, fixture, free_port, local_addr, Fixture};

fn http_listener_config(port: u16) -> ListenerConfig {
    ListenerConfig {
        proto: Proto::Http,
        port,
        decoder: DecoderKind::StreamingJson,
        num_threads: 2,
        topic: None,
        socket: SocketOptions::default(),
        http: HttpOptions {
            connection_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    }
}

async fn start_listener(fixture: &Fixture, config: ListenerConfig) -> Listener {
    Listener::spawn(fixture.app.clone(), config)
        .await
        .expect("failed to start listener")
}

/// Send a raw HTTP/1.1 request and return the full response text. Requests
/// carry Connection: close so the server ends the stream after responding.
async fn raw_request(port: u16, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(local_addr(port)).await.expect("connect");
    stream.write_all(request).await.expect("send request");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

fn post(path: &str, headers: &str, body: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n{headers}Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    request
}

#[tokio::test]
async fn single_record_end_to_end() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let body = br#"{"client_mac":"54:26:96:db:88:01","a":5}"#;
    let response = raw_request(port, &post("/v1/topicA", "", body)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"messages_queued":1}"#), "{response}");

    let records = consume(&fx, "topicA", 1);
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0][..], &body[..]);

    listener.shutdown().await;
}

#[tokio::test]
async fn concatenated_records_arrive_in_order() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(port, &post("/v1/topicB", "", br#"{"a":1}{"a":2}"#)).await;
    assert!(response.contains(r#"{"messages_queued":2}"#), "{response}");

    let records = consume(&fx, "topicB", 2);
    assert_eq!(records.len(), 2);
    assert_eq!(&records[0][..], br#"{"a":1}"#);
    assert_eq!(&records[1][..], br#"{"a":2}"#);

    listener.shutdown().await;
}

#[tokio::test]
async fn straddling_chunked_body_yields_one_record() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let part1 = br#"{"client_mac":"54:26:96:"#;
    let part2 = br#"db:88:01","a":5}"#;

    let mut stream = TcpStream::connect(local_addr(port)).await.expect("connect");
    stream
        .write_all(
            b"POST /v1/topicC HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
              Transfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
    stream
        .write_all(format!("{:x}\r\n", part1.len()).as_bytes())
        .await
        .unwrap();
    stream.write_all(part1).await.unwrap();
    stream.write_all(b"\r\n").await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream
        .write_all(format!("{:x}\r\n", part2.len()).as_bytes())
        .await
        .unwrap();
    stream.write_all(part2).await.unwrap();
    stream.write_all(b"\r\n0\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains(r#"{"messages_queued":1}"#), "{response}");

    let records = consume(&fx, "topicC", 1);
    assert_eq!(records.len(), 1);
    let mut expected = part1.to_vec();
    expected.extend_from_slice(part2);
    assert_eq!(records[0], expected);

    listener.shutdown().await;
}

#[tokio::test]
async fn get_validator_echoes_token_without_producing() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(
        port,
        b"GET /v1/meraki/myowntestvalidator HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("myowntestvalidator"), "{response}");

    assert_no_records(&fx, "meraki");
    listener.shutdown().await;
}

#[tokio::test]
async fn url_outside_namespace_is_404() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(port, &post("/v2/topic", "", br#"{"a":1}"#)).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    listener.shutdown().await;
}

#[tokio::test]
async fn disallowed_method_gets_405_with_allow() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(
        port,
        b"PUT /v1/topicA HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");
    assert!(response.to_lowercase().contains("allow: get, post"), "{response}");

    listener.shutdown().await;
}

#[tokio::test]
async fn htpasswd_miss_is_401_and_hit_scopes_the_topic() {
    let mut htpasswd = tempfile::NamedTempFile::new().unwrap();
    htpasswd.write_all(b"abc:{PLAIN}secret\n").unwrap();

    let fx = fixture();
    let port = free_port();
    let mut config = http_listener_config(port);
    config.http.htpasswd_file = Some(htpasswd.path().to_path_buf());
    let listener = start_listener(&fx, config).await;

    // No credentials: 401 without processing the body.
    let response = raw_request(port, &post("/v1/topicA", "", br#"{"a":1}"#)).await;
    assert!(response.starts_with("HTTP/1.1 401"), "{response}");
    assert!(
        response.to_lowercase().contains("www-authenticate: basic"),
        "{response}"
    );

    // Valid credentials: the username scopes the topic. "abc:secret"
    let response = raw_request(
        port,
        &post(
            "/v1/topicA",
            "Authorization: Basic YWJjOnNlY3JldA==\r\n",
            br#"{"client_mac":"54:26:96:db:88:01","a":5}"#,
        ),
    )
    .await;
    assert!(response.contains(r#"{"messages_queued":1}"#), "{response}");

    let records = consume(&fx, "abc_topicA", 1);
    assert_eq!(records.len(), 1);

    listener.shutdown().await;
}

#[tokio::test]
async fn x_consumer_id_header_scopes_the_topic_without_auth() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(
        port,
        &post("/v1/topicA", "X-Consumer-ID: sensor7\r\n", br#"{"a":1}"#),
    )
    .await;
    assert!(response.contains(r#"{"messages_queued":1}"#), "{response}");

    let records = consume(&fx, "sensor7_topicA", 1);
    assert_eq!(records.len(), 1);

    listener.shutdown().await;
}

#[tokio::test]
async fn gzip_body_is_inflated_before_parsing() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let payload = br#"{"compressed":true,"a":5}"#;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    let compressed = encoder.finish().unwrap();

    let response = raw_request(
        port,
        &post("/v1/topicGz", "Content-Encoding: gzip\r\n", &compressed),
    )
    .await;
    assert!(response.contains(r#"{"messages_queued":1}"#), "{response}");

    let records = consume(&fx, "topicGz", 1);
    assert_eq!(&records[0][..], &payload[..]);

    listener.shutdown().await;
}

#[tokio::test]
async fn empty_body_is_200_with_zero_queued() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(port, &post("/v1/topicE", "", b"")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"messages_queued":0}"#), "{response}");

    listener.shutdown().await;
}

#[tokio::test]
async fn malformed_tail_keeps_valid_prefix_and_reports_error() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(port, &post("/v1/topicM", "", br#"{"a":1}{"b":}"#)).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("json_decoder_error"), "{response}");
    assert!(response.contains(r#""messages_queued":1"#), "{response}");

    let records = consume(&fx, "topicM", 1);
    assert_eq!(&records[0][..], br#"{"a":1}"#);

    listener.shutdown().await;
}

#[tokio::test]
async fn xml_body_is_transformed_to_json_records() {
    let fx = fixture();
    let port = free_port();
    let listener = start_listener(&fx, http_listener_config(port)).await;

    let response = raw_request(
        port,
        &post(
            "/v1/topicXml",
            "Content-Type: application/xml\r\n",
            br#"<event id="7">up</event>"#,
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(
        response.contains("<result><messages_queued>1</messages_queued></result>"),
        "{response}"
    );

    let records = consume(&fx, "topicXml", 1);
    let value: serde_json::Value = serde_json::from_slice(&records[0]).unwrap();
    assert_eq!(value["tag"], "event");
    assert_eq!(value["attributes"]["id"], "7");
    assert_eq!(value["text"], "up");

    listener.shutdown().await;
}
