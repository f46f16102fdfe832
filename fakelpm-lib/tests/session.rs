//! Server and client state machines over in-memory streams

mod common;

use common::*;
use fakelpm_lib::session::{Phase, ServerSession, ServerState};
use fakelpm_lib::{ClientConfig, LpmClient, SessionConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::time::timeout;

const BUFFER: usize = 4096;

fn session(stream: DuplexStream, config: SessionConfig, batch: usize) -> ServerSession<DuplexStream> {
    ServerSession::new(stream, config, fixed_source(batch), fixed_clock())
}

async fn read_block(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut block = vec![0u8; len];
    timeout(Duration::from_secs(2), stream.read_exact(&mut block))
        .await
        .expect("block arrives in time")
        .expect("block is readable");
    block
}

/// Assert that nothing is written back within a short window.
async fn assert_silent(stream: &mut DuplexStream) {
    let mut byte = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(100), stream.read(&mut byte)).await.is_err(),
        "server replied to input without a frame"
    );
}

#[tokio::test]
async fn test_client_and_server_complete_a_download() {
    init_tracing();
    let (client_side, server_side) = duplex(BUFFER);
    let server = session(server_side, SessionConfig::default(), 4);
    assert_eq!(server.state(), ServerState::AwaitingRequest);
    let server = tokio::spawn(server.run());

    let config = ClientConfig::default().with_codes(*b"U042", *b"P777");
    let mut client = LpmClient::from_stream(client_side, config);
    let download = client.download(Command::Total).await.expect("download succeeds");

    assert_eq!(&download.header.user_code, b"U042");
    assert_eq!(&download.header.plant_code, b"P777");
    assert_eq!(download.header.date_time(), Some(fixed_clock().now()));
    assert_eq!(download.measurements.len(), 4);
    assert!(download.measurements.iter().all(|m| m.data == sample_payload()));
    assert_eq!(download.readings().len(), 12);

    let summary = server.await.expect("server task").expect("session succeeds");
    assert_eq!(summary.command, Command::Total);
    assert_eq!(summary.records_sent, 4);
    assert_eq!(summary.naks_sent, 0);
}

#[tokio::test]
async fn test_partial_download_uses_same_flow() {
    let (client_side, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), MIN_RECORDS).run());

    let mut client = LpmClient::from_stream(client_side, ClientConfig::default());
    let download = client.download(Command::Partial).await.expect("download succeeds");
    assert_eq!(download.measurements.len(), MIN_RECORDS);

    let summary = server.await.expect("server task").expect("session succeeds");
    assert_eq!(summary.command, Command::Partial);
}

#[tokio::test]
async fn test_server_naks_framed_garbage_and_recovers() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), MIN_RECORDS).run());

    // Noise without a complete STX..ETX span draws no reply
    peer.write_all(b"hello").await.unwrap();
    assert_silent(&mut peer).await;

    // Framed but not a request; judged once no more bytes follow
    peer.write_all(&[STX, b'C', b'0', 0x11, 0x22, ETX]).await.unwrap();
    assert_eq!(read_block(&mut peer, CONTROL_LEN).await, NAK_FRAME);

    // Well formed request with a bad checksum
    let mut corrupted = Request::new(Command::Total).encode().to_vec();
    corrupted[5] ^= 0x01;
    peer.write_all(&corrupted).await.unwrap();
    assert_eq!(read_block(&mut peer, CONTROL_LEN).await, NAK_FRAME);

    // Same connection, valid request
    peer.write_all(&Request::new(Command::Total).encode()).await.unwrap();
    assert_eq!(read_block(&mut peer, CONTROL_LEN).await, ACK_FRAME);
    let header = Header::decode(&read_block(&mut peer, HEADER_LEN).await).expect("header decodes");
    assert_eq!(&header.user_code, b"0000");

    peer.write_all(&ACK_FRAME).await.unwrap();
    for _ in 0..MIN_RECORDS {
        Measurement::decode(&read_block(&mut peer, MEASUREMENT_LEN).await).expect("measurement decodes");
        peer.write_all(&ACK_FRAME).await.unwrap();
    }
    Final::decode(&read_block(&mut peer, FINAL_LEN).await).expect("final decodes");

    let summary = server.await.expect("server task").expect("session succeeds");
    assert_eq!(summary.naks_sent, 2);
}

/// Read the ACK and header that answer a request.
async fn expect_header(peer: &mut DuplexStream) -> Header {
    assert_eq!(read_block(peer, CONTROL_LEN).await, ACK_FRAME);
    Header::decode(&read_block(peer, HEADER_LEN).await).expect("header decodes")
}

#[tokio::test]
async fn test_stray_start_byte_before_request_is_skipped() {
    let (mut peer, server_side) = duplex(BUFFER);
    let config = SessionConfig::default().with_frame_gap(Duration::from_millis(50));
    let server = tokio::spawn(session(server_side, config, MIN_RECORDS).run());

    peer.write_all(&[b'x', STX]).await.unwrap();
    assert_silent(&mut peer).await;

    // The request arrives well after the lone STX
    peer.write_all(&Request::new(Command::Total).with_codes(*b"1111", *b"2222").encode())
        .await
        .unwrap();
    let header = expect_header(&mut peer).await;
    assert_eq!(&header.user_code, b"1111");

    drop(peer);
    let err = server.await.expect("server task").expect_err("client hung up");
    assert_eq!(err.phase(), Some(Phase::HeaderAck));
}

#[tokio::test]
async fn test_stray_start_byte_in_same_read_as_request() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), MIN_RECORDS).run());

    let mut input = vec![STX, 0x55];
    input.extend_from_slice(&Request::new(Command::Partial).encode());
    peer.write_all(&input).await.unwrap();
    let header = expect_header(&mut peer).await;
    assert_eq!(&header.plant_code, b"0000");

    drop(peer);
    assert!(server.await.expect("server task").is_err());
}

#[tokio::test]
async fn test_request_split_after_etx_valued_byte() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), MIN_RECORDS).run());

    let request = Request::new(Command::Total).with_codes(*b"zz00", *b"0000").encode();
    // Checksum 0x0327: the first part ends on a byte equal to ETX
    assert_eq!(request[19], ETX);

    peer.write_all(&request[..20]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    peer.write_all(&request[20..]).await.unwrap();

    let header = expect_header(&mut peer).await;
    assert_eq!(&header.user_code, b"zz00");

    peer.write_all(&ACK_FRAME).await.unwrap();
    for _ in 0..MIN_RECORDS {
        read_block(&mut peer, MEASUREMENT_LEN).await;
        peer.write_all(&ACK_FRAME).await.unwrap();
    }
    read_block(&mut peer, FINAL_LEN).await;

    let summary = server.await.expect("server task").expect("session succeeds");
    assert_eq!(summary.naks_sent, 0);
}

#[tokio::test]
async fn test_request_trickled_byte_by_byte() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), MIN_RECORDS).run());

    for byte in Request::new(Command::Partial).encode().iter() {
        peer.write_all(&[*byte]).await.unwrap();
        tokio::task::yield_now().await;
    }
    expect_header(&mut peer).await;

    drop(peer);
    assert!(server.await.expect("server task").is_err());
}

#[tokio::test]
async fn test_unknown_command_is_naked() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), MIN_RECORDS).run());

    let mut request = Request::new(Command::Total);
    request.command = *b"XX";
    peer.write_all(&request.encode()).await.unwrap();
    assert_eq!(read_block(&mut peer, CONTROL_LEN).await, NAK_FRAME);

    // Hanging up while the server waits for a request ends the session
    drop(peer);
    let err = server.await.expect("server task").expect_err("session fails");
    assert_eq!(err.phase(), Some(Phase::Request));
}

#[tokio::test]
async fn test_missing_measurement_ack_times_out() {
    let (mut peer, server_side) = duplex(BUFFER);
    let config = SessionConfig::default().with_ack_timeout(Duration::from_millis(150));
    let server = tokio::spawn(session(server_side, config, 5).run());

    peer.write_all(&Request::new(Command::Total).encode()).await.unwrap();
    assert_eq!(read_block(&mut peer, CONTROL_LEN).await, ACK_FRAME);
    read_block(&mut peer, HEADER_LEN).await;
    peer.write_all(&ACK_FRAME).await.unwrap();
    read_block(&mut peer, MEASUREMENT_LEN).await;

    // No ACK for the first record
    let err = server.await.expect("server task").expect_err("session times out");
    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert_eq!(err.phase(), Some(Phase::MeasurementAck));

    // Only one record was sent before the server gave up
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_missing_header_ack_times_out() {
    let (mut peer, server_side) = duplex(BUFFER);
    let config = SessionConfig::default().with_ack_timeout(Duration::from_millis(150));
    let server = tokio::spawn(session(server_side, config, 3).run());

    peer.write_all(&Request::new(Command::Partial).encode()).await.unwrap();
    read_block(&mut peer, CONTROL_LEN + HEADER_LEN).await;

    let err = server.await.expect("server task").expect_err("session times out");
    assert!(err.is_timeout());
    assert_eq!(err.phase(), Some(Phase::HeaderAck));
}

#[tokio::test]
async fn test_ack_content_is_not_validated() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), 3).run());

    peer.write_all(&Request::new(Command::Total).encode()).await.unwrap();
    read_block(&mut peer, CONTROL_LEN + HEADER_LEN).await;
    peer.write_all(b"whatever!!!").await.unwrap();
    for _ in 0..3 {
        read_block(&mut peer, MEASUREMENT_LEN).await;
        peer.write_all(&NAK_FRAME).await.unwrap();
    }
    read_block(&mut peer, FINAL_LEN).await;

    let summary = server.await.expect("server task").expect("session succeeds");
    assert_eq!(summary.records_sent, 3);
}

#[tokio::test]
async fn test_short_ack_replies_are_accepted() {
    let (mut peer, server_side) = duplex(BUFFER);
    let config = SessionConfig::default().with_ack_timeout(Duration::from_millis(500));
    let server = tokio::spawn(session(server_side, config, 3).run());

    peer.write_all(&Request::new(Command::Total).encode()).await.unwrap();
    read_block(&mut peer, CONTROL_LEN + HEADER_LEN).await;
    peer.write_all(b"ok").await.unwrap();
    for _ in 0..3 {
        read_block(&mut peer, MEASUREMENT_LEN).await;
        peer.write_all(&[0x06]).await.unwrap();
    }
    read_block(&mut peer, FINAL_LEN).await;

    let summary = server.await.expect("server task").expect("session succeeds");
    assert_eq!(summary.records_sent, 3);
}

#[tokio::test]
async fn test_hangup_while_awaiting_ack_is_not_a_timeout() {
    let (mut peer, server_side) = duplex(BUFFER);
    let server = tokio::spawn(session(server_side, SessionConfig::default(), 3).run());

    peer.write_all(&Request::new(Command::Total).encode()).await.unwrap();
    read_block(&mut peer, CONTROL_LEN + HEADER_LEN).await;
    drop(peer);

    let err = server.await.expect("server task").expect_err("session fails");
    assert!(!err.is_timeout());
    assert_eq!(err.phase(), Some(Phase::HeaderAck));
}

/// Plays the server from a script of raw blocks.
async fn scripted_server(blocks: Vec<Bytes>) -> DuplexStream {
    let (client_side, mut server_side) = duplex(BUFFER);
    for block in blocks {
        server_side.write_all(&block).await.unwrap();
    }
    // Keep the server end open for the client's ACKs
    tokio::spawn(async move {
        let mut sink = Vec::new();
        let _ = server_side.read_to_end(&mut sink).await;
    });
    client_side
}

fn script_header() -> Bytes {
    Header::new(*b"0000", *b"0000", fixed_clock().now()).encode()
}

#[tokio::test]
async fn test_client_keeps_payload_that_is_not_eod() {
    // Payload starting with "EOX" shares the PCD4 prefix and two letters with a final frame
    let mut payload = sample_payload();
    payload.status = b'E';
    payload.year = b'O';
    payload.month = b'X';

    let stream = scripted_server(vec![
        Bytes::from_static(&ACK_FRAME),
        script_header(),
        Measurement::new(payload).encode(),
        Final::new().encode(),
    ])
    .await;

    let mut client = LpmClient::from_stream(stream, ClientConfig::default());
    let download = client.download(Command::Total).await.expect("download succeeds");
    assert_eq!(download.measurements.len(), 1);
    assert_eq!(download.measurements[0].data, payload);
}

#[tokio::test]
async fn test_client_stops_at_final_frame() {
    let stream = scripted_server(vec![Bytes::from_static(&ACK_FRAME), script_header(), Final::new().encode()]).await;

    let mut client = LpmClient::from_stream(stream, ClientConfig::default());
    let download = client.download(Command::Total).await.expect("download succeeds");
    assert!(download.measurements.is_empty());
}

#[tokio::test]
async fn test_client_rejects_unknown_record_prefix() {
    let mut bogus = Final::new();
    bogus.block = *b"D9";
    let stream = scripted_server(vec![Bytes::from_static(&ACK_FRAME), script_header(), bogus.encode()]).await;

    let mut client = LpmClient::from_stream(stream, ClientConfig::default());
    let err = client.download(Command::Total).await.expect_err("download fails");
    assert!(err.is_protocol_violation());
    assert!(matches!(err.root(), LpmError::Framing(_)));
    assert_eq!(err.phase(), Some(Phase::Measurement));
}

#[tokio::test]
async fn test_client_reports_corrupted_header() {
    let mut header = script_header().to_vec();
    header[8] ^= 0x40;
    let stream = scripted_server(vec![Bytes::from_static(&ACK_FRAME), Bytes::from(header)]).await;

    let mut client = LpmClient::from_stream(stream, ClientConfig::default());
    let err = client.download(Command::Total).await.expect_err("download fails");
    assert!(matches!(err.root(), LpmError::Checksum { .. }));
    assert_eq!(err.phase(), Some(Phase::Header));
}

#[tokio::test]
async fn test_client_reports_rejected_request() {
    let stream = scripted_server(vec![Bytes::from_static(&NAK_FRAME)]).await;

    let mut client = LpmClient::from_stream(stream, ClientConfig::default());
    let err = client.download(Command::Total).await.expect_err("download fails");
    assert!(matches!(err.root(), LpmError::Rejected));
    assert!(!err.is_timeout());
    assert_eq!(err.phase(), Some(Phase::RequestAck));
}

#[tokio::test]
async fn test_client_times_out_on_silent_server() {
    let (client_side, _server_side) = duplex(BUFFER);
    let config = ClientConfig::default().with_timeout(Duration::from_millis(100));
    let mut client = LpmClient::from_stream(client_side, config);

    let err = client.read_greeting().await.expect_err("greeting never arrives");
    assert!(err.is_timeout());
    assert!(!err.is_protocol_violation());
    assert_eq!(err.phase(), Some(Phase::Greeting));
}
