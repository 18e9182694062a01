// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, time::Duration};

use s7_tags_rs::cfg::{
    config::{BackoffConfig, Config},
    enums::CpuFamily,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub fn test_config(endpoint: SocketAddr) -> Config {
    Config {
        endpoint,
        cpu_family: CpuFamily::S71200,
        rack: Some(0),
        slot: Some(1),
        poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_millis(500),
        proposed_pdu_length: 480,
        watchdog: None,
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(15),
            max_delay: Duration::from_millis(200),
        },
    }
}

pub async fn bind_loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn cotp_connection_confirm() -> Vec<u8> {
    vec![
        0x03, 0x00, 0x00, 0x16, 0x11, 0xD0, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01, 0x00,
        0xC2, 0x02, 0x01, 0x02,
    ]
}

fn setup_communication_ack(pdu_ref: u16, max_amq_caller: u16, max_amq_callee: u16, pdu_length: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(27);
    buf.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
    buf.extend_from_slice(&[0x02, 0xF0, 0x80]);
    buf.push(0x32);
    buf.push(0x03); // ack-data
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.extend_from_slice(&pdu_ref.to_be_bytes());
    buf.extend_from_slice(&8u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.push(0x00); // err_class
    buf.push(0x00); // err_code
    buf.push(0xF0); // FUNC_SETUP_COMM
    buf.push(0x00); // reserved
    buf.extend_from_slice(&max_amq_caller.to_be_bytes());
    buf.extend_from_slice(&max_amq_callee.to_be_bytes());
    buf.extend_from_slice(&pdu_length.to_be_bytes());
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    buf
}

fn read_var_ack(pdu_ref: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
    buf.extend_from_slice(&[0x02, 0xF0, 0x80]);
    buf.push(0x32);
    buf.push(0x03);
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.extend_from_slice(&pdu_ref.to_be_bytes());
    buf.extend_from_slice(&2u16.to_be_bytes()); // param_len
    buf.extend_from_slice(&((4 + payload.len()) as u16).to_be_bytes()); // data_len
    buf.push(0x00); // err_class
    buf.push(0x00); // err_code
    buf.push(0x04); // FUNC_READ_VAR
    buf.push(0x01); // n_items
    buf.push(0xFF); // return code ok
    buf.push(0x04); // transport: byte/word
    buf.extend_from_slice(&((payload.len() * 8) as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    buf
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await.unwrap();
    let total = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
    let mut rest = vec![0u8; total - 4];
    stream.read_exact(&mut rest).await.unwrap();
    let mut full = hdr.to_vec();
    full.extend_from_slice(&rest);
    full
}

fn pdu_ref_of(job_frame: &[u8]) -> u16 {
    u16::from_be_bytes([job_frame[11], job_frame[12]])
}

/// Accepts one connection, performs the COTP + Setup Communication
/// handshake, then answers one ReadVar request with `payload`.
pub fn spawn_fake_plc(listener: TcpListener, payload: Vec<u8>) {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _cr = read_frame(&mut stream).await;
        stream.write_all(&cotp_connection_confirm()).await.unwrap();

        let setup_req = read_frame(&mut stream).await;
        stream
            .write_all(&setup_communication_ack(pdu_ref_of(&setup_req), 1, 1, 480))
            .await
            .unwrap();

        let read_req = read_frame(&mut stream).await;
        stream.write_all(&read_var_ack(pdu_ref_of(&read_req), &payload)).await.unwrap();
    });
}

/// Accepts one connection and performs only the handshake, for tests
/// that only care about `Connection::connect` succeeding.
pub fn spawn_handshake_only_plc(listener: TcpListener) {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _cr = read_frame(&mut stream).await;
        stream.write_all(&cotp_connection_confirm()).await.unwrap();

        let setup_req = read_frame(&mut stream).await;
        stream
            .write_all(&setup_communication_ack(pdu_ref_of(&setup_req), 1, 1, 480))
            .await
            .unwrap();
    });
}
