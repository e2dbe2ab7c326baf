//! End-to-end tests: a real server on an ephemeral port, spoken to with raw
//! HTTP and raw FastCGI bytes.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use wirefront::config::{Mode, ServerConfig};
use wirefront::fastcgi::{ProtocolStatus, Record, Role, nv};
use wirefront::http::{Request, Response, StatusCode};
use wirefront::server::Server;

struct Running {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn echo(mut request: Request) -> Option<Response> {
    match request.path() {
        "missing" => return None,
        "boom" => panic!("handler failed"),
        _ => {}
    }
    let mut body = format!("{} {}", request.method(), request.path());
    if let Some(x) = request.query_param("x") {
        body.push_str(&format!(" x={x}"));
    }
    for (name, value) in request.form_params() {
        body.push_str(&format!(" {name}={value}"));
    }
    for file in request.take_uploads() {
        let data = std::fs::read(file.path()).unwrap_or_default();
        body.push_str(&format!(
            " file:{}:{}",
            file.file_name().unwrap_or(""),
            String::from_utf8_lossy(&data)
        ));
    }
    Some(Response::new(StatusCode::Ok).body(body))
}

fn config(mode: Mode, max_connections: usize) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        mode,
        max_connections,
        read_buffer_size: 256,
        upload_dir: std::env::temp_dir().join(format!("wirefront-it-{:016x}", fastrand::u64(..))),
        idle_timeout_secs: 5,
        ..ServerConfig::default()
    }
}

async fn start(mode: Mode, max_connections: usize) -> Running {
    start_with(config(mode, max_connections)).await
}

async fn start_with(config: ServerConfig) -> Running {
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .run_until(echo, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    Running {
        addr,
        stop: Some(stop),
    }
}

async fn exchange(addr: SocketAddr, chunks: &[&[u8]]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for chunk in chunks {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    out
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[tokio::test]
async fn http_get_round_trip() {
    let server = start(Mode::Http, 4).await;
    let out = text(
        &exchange(
            server.addr,
            &[b"GET /page?x=1 HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"],
        )
        .await,
    );
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with("GET page x=1"));
}

#[tokio::test]
async fn pipelined_keep_alive_requests() {
    let server = start(Mode::Http, 4).await;
    let out = text(
        &exchange(
            server.addr,
            &[b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\nGET /three HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"],
        )
        .await,
    );
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 3, "{out}");
    let one = out.find("GET one").unwrap();
    let two = out.find("GET two").unwrap();
    let three = out.find("GET three").unwrap();
    assert!(one < two && two < three);
}

#[tokio::test]
async fn missing_route_is_404() {
    let server = start(Mode::Http, 2).await;
    let out = text(
        &exchange(
            server.addr,
            &[b"GET /missing HTTP/1.0\r\nHost: a\r\n\r\n"],
        )
        .await,
    );
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
}

#[tokio::test]
async fn post_without_length_gets_411() {
    let server = start(Mode::Http, 2).await;
    let out = text(&exchange(server.addr, &[b"POST /x HTTP/1.1\r\nHost: a\r\n\r\n"]).await);
    assert!(out.starts_with("HTTP/1.1 411 Length Required\r\n"), "{out}");
    assert!(out.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn multipart_upload_split_across_writes() {
    let server = start(Mode::Http, 2).await;
    let body: &[u8] = b"--zz\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nreport\r\n--zz\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"r.txt\"\r\nContent-Type: text/plain\r\n\r\nline1\r\nline2\r\n--zz--\r\n";
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: a\r\nConnection: close\r\nContent-Type: multipart/form-data; boundary=zz\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let input = [head.as_bytes(), body].concat();
    // split inside the closing delimiter of the file part
    let split = input.len() - 8;
    let out = text(&exchange(server.addr, &[&input[..split], &input[split..]]).await);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("POST upload title=report file:r.txt:line1\r\nline2"), "{out}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploads_on_a_multi_threaded_runtime() {
    let server = start(Mode::Http, 2).await;
    let data = "x".repeat(3000);
    let body = format!(
        "--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"big.bin\"\r\n\r\n{data}\r\n--b--\r\n"
    );
    let head = format!(
        "POST /up HTTP/1.1\r\nHost: a\r\nConnection: close\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let input = [head.as_bytes(), body.as_bytes()].concat();
    let chunks: Vec<&[u8]> = input.chunks(700).collect();
    let out = text(&exchange(server.addr, &chunks).await);
    assert!(out.ends_with(&format!("POST up file:big.bin:{data}")), "{out}");
}

#[tokio::test]
async fn urlencoded_form_is_decoded() {
    let server = start(Mode::Http, 2).await;
    let out = text(
        &exchange(
            server.addr,
            &[b"POST /f HTTP/1.1\r\nHost: a\r\nConnection: close\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 13\r\n\r\n", b"a=hello+there"],
        )
        .await,
    );
    assert!(out.ends_with("POST f a=hello there"), "{out}");
}

#[tokio::test]
async fn gzip_for_clients_that_accept_it() {
    let server = start(Mode::Http, 2).await;
    let path = "p".repeat(200);
    let req = format!(
        "GET /{path} HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n"
    );
    let out = text(&exchange(server.addr, &[req.as_bytes()]).await);
    assert!(out.contains("Content-Encoding: gzip\r\n"), "{out}");

    let ajax = format!(
        "GET /{path} HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip\r\nX-Requested-With: XMLHttpRequest\r\nConnection: close\r\n\r\n"
    );
    let out = text(&exchange(server.addr, &[ajax.as_bytes()]).await);
    assert!(!out.contains("Content-Encoding"), "{out}");
}

#[tokio::test]
async fn slot_survives_a_panicking_handler() {
    let server = start(Mode::Http, 1).await;
    let out = exchange(
        server.addr,
        &[b"GET /boom HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"],
    )
    .await;
    assert!(out.is_empty());

    let out = text(
        &exchange(
            server.addr,
            &[b"GET /ok HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"],
        )
        .await,
    );
    assert!(out.ends_with("GET ok"), "{out}");
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let server = start_with(ServerConfig {
        idle_timeout_secs: 1,
        ..config(Mode::Http, 1)
    })
    .await;
    let started = tokio::time::Instant::now();
    let out = exchange(server.addr, &[]).await;
    assert!(out.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

fn fastcgi_request(request_id: u16, flags: u8, params: &[(&str, &str)], stdin: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    Record::BeginRequest {
        request_id,
        role: Role::Responder,
        flags,
    }
    .encode(&mut out);
    let mut encoded = BytesMut::new();
    nv::encode_all(params.iter().copied(), &mut encoded);
    Record::Params {
        request_id,
        content: encoded.freeze(),
    }
    .encode(&mut out);
    Record::Params {
        request_id,
        content: Bytes::new(),
    }
    .encode(&mut out);
    if !stdin.is_empty() {
        Record::Stdin {
            request_id,
            content: Bytes::copy_from_slice(stdin),
        }
        .encode(&mut out);
    }
    Record::Stdin {
        request_id,
        content: Bytes::new(),
    }
    .encode(&mut out);
    out
}

/// Decodes every complete record; a trailing partial record is ignored.
fn decode_records(mut buf: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    while let Some((record, used)) = Record::decode(buf).unwrap() {
        records.push(record);
        buf = &buf[used..];
    }
    records
}

#[tokio::test]
async fn fastcgi_request_byte_by_byte() {
    let server = start(Mode::FastCgi, 2).await;
    let wire = fastcgi_request(
        1,
        0,
        &[
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", "/submit?x=9"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("HTTP_HOST", "example.org"),
            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
            ("CONTENT_LENGTH", "7"),
        ],
        b"k=v%21z",
    );
    let chunks: Vec<&[u8]> = wire.chunks(3).collect();
    let out = exchange(server.addr, &chunks).await;
    let records = decode_records(&out);

    let Some(Record::EndRequest {
        request_id: 1,
        protocol_status: ProtocolStatus::RequestComplete,
        ..
    }) = records.last()
    else {
        panic!("expected END_REQUEST last, got {records:?}");
    };
    let stdout: Vec<u8> = records
        .iter()
        .filter_map(|r| match r {
            Record::Stdout { content, .. } => Some(content.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    let reply = text(&stdout);
    assert!(reply.starts_with("Status: 200 OK\r\n"), "{reply}");
    assert!(reply.ends_with("POST submit x=9 k=v!z"), "{reply}");
}

fn stdout_of(records: &[Record]) -> String {
    let bytes: Vec<u8> = records
        .iter()
        .filter_map(|r| match r {
            Record::Stdout { content, .. } => Some(content.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    text(&bytes)
}

#[tokio::test]
async fn fastcgi_head_without_host_gets_framed_400() {
    let server = start(Mode::FastCgi, 1).await;
    let wire = fastcgi_request(
        1,
        0,
        &[
            ("REQUEST_METHOD", "GET"),
            ("REQUEST_URI", "/foo"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
        ],
        b"",
    );
    let records = decode_records(&exchange(server.addr, &[&wire]).await);
    assert!(
        matches!(
            records.last(),
            Some(Record::EndRequest {
                request_id: 1,
                protocol_status: ProtocolStatus::RequestComplete,
                ..
            })
        ),
        "{records:?}"
    );
    let reply = stdout_of(&records);
    assert!(reply.starts_with("Status: 400 Bad Request\r\n"), "{reply}");
}

#[tokio::test]
async fn fastcgi_validation_error_is_framed() {
    let server = start(Mode::FastCgi, 1).await;
    let wire = fastcgi_request(
        7,
        1,
        &[
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", "/x"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("HTTP_HOST", "h"),
        ],
        b"",
    );
    // keep-conn is overridden: the connection still closes after the error
    let records = decode_records(&exchange(server.addr, &[&wire]).await);
    assert!(
        matches!(records.last(), Some(Record::EndRequest { request_id: 7, .. })),
        "{records:?}"
    );
    let reply = stdout_of(&records);
    assert!(reply.starts_with("Status: 411 Length Required\r\n"), "{reply}");
}

#[tokio::test]
async fn fastcgi_abort_closes_connection() {
    let server = start(Mode::FastCgi, 1).await;
    let mut wire = BytesMut::new();
    Record::BeginRequest {
        request_id: 3,
        role: Role::Responder,
        flags: 1,
    }
    .encode(&mut wire);
    Record::AbortRequest { request_id: 3 }.encode(&mut wire);
    let out = exchange(server.addr, &[&wire]).await;
    assert!(decode_records(&out).is_empty(), "{out:?}");
}

#[tokio::test]
async fn fastcgi_keep_conn_serves_two_requests() {
    let server = start(Mode::FastCgi, 2).await;
    let params = [
        ("REQUEST_METHOD", "GET"),
        ("REQUEST_URI", "/a"),
        ("SERVER_PROTOCOL", "HTTP/1.1"),
        ("HTTP_HOST", "h"),
    ];
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // the front end waits for END_REQUEST before reusing the connection
    stream
        .write_all(&fastcgi_request(1, 1, &params, b""))
        .await
        .unwrap();
    let mut first = Vec::new();
    let mut buf = [0u8; 1024];
    while !decode_records(&first)
        .iter()
        .any(|r| matches!(r, Record::EndRequest { request_id: 1, .. }))
    {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the first reply");
        first.extend_from_slice(&buf[..n]);
    }

    stream
        .write_all(&fastcgi_request(2, 0, &params, b""))
        .await
        .unwrap();
    let mut second = Vec::new();
    stream.read_to_end(&mut second).await.unwrap();

    let ends: Vec<u16> = decode_records(&[first, second].concat())
        .into_iter()
        .filter_map(|r| match r {
            Record::EndRequest { request_id, .. } => Some(request_id),
            _ => None,
        })
        .collect();
    assert_eq!(ends, [1, 2]);
}

#[tokio::test]
async fn fastcgi_multiplexing_is_refused() {
    let server = start(Mode::FastCgi, 2).await;
    let mut wire = BytesMut::new();
    Record::BeginRequest {
        request_id: 1,
        role: Role::Responder,
        flags: 1,
    }
    .encode(&mut wire);
    Record::BeginRequest {
        request_id: 2,
        role: Role::Responder,
        flags: 1,
    }
    .encode(&mut wire);
    let out = exchange(server.addr, &[&wire]).await;
    let records = decode_records(&out);
    assert_eq!(
        records,
        [Record::EndRequest {
            request_id: 2,
            app_status: 0,
            protocol_status: ProtocolStatus::CantMultiplexConnections,
        }]
    );
}

#[tokio::test]
async fn pool_limits_concurrent_connections() {
    let server = start(Mode::Http, 1).await;
    // holds the only slot with an unfinished request
    let mut first = TcpStream::connect(server.addr).await.unwrap();
    first.write_all(b"GET /slow HTTP/1.1\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let addr = server.addr;
    let second = tokio::spawn(async move {
        let request: &[u8] = b"GET /second HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
        exchange(addr, &[request]).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished(), "second connection served while pool was full");

    first
        .write_all(b"Host: a\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    first.read_to_end(&mut out).await.unwrap();
    assert!(text(&out).ends_with("GET slow"));

    let out = text(&second.await.unwrap());
    assert!(out.ends_with("GET second"), "{out}");
}
