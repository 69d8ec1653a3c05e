// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

/// Builds a rustls client configuration trusting the platform's native root certificates.
pub fn client_config() -> Result<Arc<ClientConfig>, Box<dyn Error + Send + Sync>> {
    let mut root_cert_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for err in &native_certs.errors {
        debug!("WIRE | Error while loading native certificates: {err}");
    }

    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => {
                debug!("WIRE | Failed to parse certificate: {:?}", err);
            }
        }
    }
    if valid_count == 0 {
        return Err("No valid certificates found in native root store".into());
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("Failed to set protocol versions: {e}"))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    debug!("WIRE | TLS configured with {valid_count} native root certificates");
    Ok(Arc::new(config))
}
