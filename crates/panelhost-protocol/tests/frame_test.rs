// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Framing tests over real async streams.

use panelhost_protocol::frame::{
    FrameError, FrameHeader, FrameKind, FrameReader, FrameWriter, Inbound, HEADER_LEN,
    MAX_PAYLOAD,
};
use panelhost_protocol::wire::{
    rpc_request, ConnectClientMessage, ErrorResponse, RequestMessage, RpcRequest, RtnStatus,
};

fn connect_request() -> RpcRequest {
    RpcRequest {
        conn_id: String::new(),
        client_version: "rust-test".to_string(),
        request: Some(rpc_request::Request::ConnectClient(ConnectClientMessage {
            ts: 1,
            proc_run_id: "proc-1".to_string(),
            acc_id: "acc-1".to_string(),
            zone_name: "default".to_string(),
            anon_acc: true,
            proc_name: "itest".to_string(),
            proc_tags: Default::default(),
            host_data: Default::default(),
            start_ts: 1,
            reconnect_app_runtimes: vec![],
        })),
    }
}

#[tokio::test]
async fn test_rpc_envelope_round_trip() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut writer = FrameWriter::new(client);
    let mut reader = FrameReader::new(server);

    let msg = connect_request();
    writer.write(FrameKind::Rpc, &msg).await.unwrap();

    match reader.read::<RpcRequest>(FrameKind::Rpc).await.unwrap() {
        Inbound::Message(decoded) => assert_eq!(decoded, msg),
        other => panic!("expected message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pushed_frames_arrive_in_order() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut writer = FrameWriter::new(client);
    let mut reader = FrameReader::new(server);

    for i in 0..5 {
        let msg = RequestMessage {
            req_id: format!("r{}", i),
            request_type: "handler".to_string(),
            ..Default::default()
        };
        writer.write(FrameKind::Push, &msg).await.unwrap();
    }

    for i in 0..5 {
        match reader.read::<RequestMessage>(FrameKind::Push).await.unwrap() {
            Inbound::Message(msg) => assert_eq!(msg.req_id, format!("r{}", i)),
            other => panic!("expected message, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_fault_interrupts_push_sequence() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut writer = FrameWriter::new(client);
    let mut reader = FrameReader::new(server);

    let msg = RequestMessage {
        req_id: "r1".to_string(),
        ..Default::default()
    };
    writer.write(FrameKind::Push, &msg).await.unwrap();
    let fault = ErrorResponse {
        status: Some(RtnStatus {
            success: false,
            err: "Bad ConnId".to_string(),
            err_code: "badconnid".to_string(),
            perm_err: false,
        }),
    };
    writer.write(FrameKind::Fault, &fault).await.unwrap();

    assert!(matches!(
        reader.read::<RequestMessage>(FrameKind::Push).await.unwrap(),
        Inbound::Message(_)
    ));
    match reader.read::<RequestMessage>(FrameKind::Push).await.unwrap() {
        Inbound::Fault(status) => assert_eq!(status.err_code, "badconnid"),
        other => panic!("expected fault, got {:?}", other),
    }
}

#[tokio::test]
async fn test_closed_stream_yields_closed() {
    let (client, server) = tokio::io::duplex(1024);
    drop(client);
    let mut reader = FrameReader::new(server);
    match reader.read::<RequestMessage>(FrameKind::Push).await.unwrap() {
        Inbound::Closed => {}
        other => panic!("expected closed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversize_header_rejected() {
    use tokio::io::AsyncWriteExt;

    let (mut client, server) = tokio::io::duplex(1024);
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
    header[4..].copy_from_slice(&(FrameKind::Rpc as u16).to_be_bytes());
    client.write_all(&header).await.unwrap();

    let mut reader = FrameReader::new(server);
    match reader.read::<RequestMessage>(FrameKind::Rpc).await {
        Err(FrameError::PayloadTooLarge(_)) => {}
        other => panic!("expected payload-too-large, got {:?}", other),
    }
}

#[test]
fn test_status_survives_request_frame_encoding() {
    use prost::Message;

    let msg = RequestMessage {
        req_id: "r-status".to_string(),
        status: Some(RtnStatus {
            success: false,
            err: "Bad ConnId".to_string(),
            err_code: "badconnid".to_string(),
            perm_err: false,
        }),
        ..Default::default()
    };
    let bytes = msg.encode_to_vec();
    let decoded = RequestMessage::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded.status.unwrap().err_code, "badconnid");
}

#[test]
fn test_header_encode_parse() {
    let header = FrameHeader {
        kind: FrameKind::Reply,
        len: 9,
    };
    assert_eq!(FrameHeader::parse(header.encode()).unwrap(), header);
}
