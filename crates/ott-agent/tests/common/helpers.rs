// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use ott_agent::config::{Config, TransportMode};
use ott_agent::event::Event;

/// Config pointing at `server_url` with a queue in `queue_dir`, no sampling, no backoff
pub fn test_config(server_url: &str, queue_dir: &Path, transport: TransportMode) -> Config {
    Config {
        api_key: "_not_a_real_key_".to_string(),
        server_url: server_url.to_string(),
        transport,
        timeout: 2,
        sample_rate: 1.0,
        high_memory_detected: u64::MAX,
        disk_queue_dir: queue_dir.to_path_buf(),
        queue_backoff_base_ms: 0,
        queue_backoff_max_ms: 0,
        ..Default::default()
    }
}

/// Decode a request body according to its `Content-Encoding`
#[allow(dead_code)]
pub fn decode_body(body: &[u8], encoding: Option<&str>) -> Event {
    let json = if encoding == Some("gzip") {
        let mut decoded = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut decoded)
            .expect("Failed to ungzip body");
        decoded
    } else {
        body.to_vec()
    };
    serde_json::from_slice(&json).expect("Body is not an event")
}

/// Address of a port nothing listens on
#[allow(dead_code)]
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let port = listener.local_addr().expect("Failed to get local addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}
