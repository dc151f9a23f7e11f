//! TLS environment: context creation and cipher/DH material loading.
//!
//! One `SslContext` is built per chirp instance at start. The protocol is pinned to
//!  TLS 1.2, compression is disabled, peers must present a certificate (verified
//!  against the configured chain, depth 5) and the cipher list is restricted to the
//!  DHE AES256 families, with the DH group loaded from the configured PEM file.
//!
//! Loopback peers are not encrypted unless the config sets `always_encrypt`.

use std::net::IpAddr;
use std::path::Path;

use openssl::dh::Dh;
use openssl::ssl::{
    Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslOptions, SslVerifyMode,
    SslVersion,
};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

use crate::config::Config;
use crate::error::ChirpError;

const CIPHER_LIST: &str = "DHE-RSA-AES256-GCM-SHA384:DHE-DSS-AES256-GCM-SHA384:\
                           DHE-RSA-AES256-SHA256:DHE-DSS-AES256-SHA256";

pub(crate) struct TlsEnv {
    context: SslContext,
}

impl TlsEnv {
    pub fn new(config: &Config) -> Result<TlsEnv, ChirpError> {
        let cert = config
            .cert_chain_pem
            .as_deref()
            .ok_or(ChirpError::NotInitialized)?;
        let dh = config
            .dh_params_pem
            .as_deref()
            .ok_or(ChirpError::NotInitialized)?;
        if !cert.exists() {
            return Err(ChirpError::value(format!(
                "cert_chain_pem does not exist: {}",
                cert.display()
            )));
        }
        if !dh.exists() {
            return Err(ChirpError::value(format!(
                "dh_params_pem does not exist: {}",
                dh.display()
            )));
        }

        let context = build_context(cert, dh).map_err(|e| {
            ChirpError::TlsError(format!("building the TLS context failed: {}", e))
        })?;
        Ok(TlsEnv { context })
    }

    /// Run the client-side handshake on an outgoing stream.
    pub async fn connect(&self, stream: TcpStream) -> Result<SslStream<TcpStream>, ChirpError> {
        let mut stream = self.new_stream(stream)?;
        std::pin::Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| ChirpError::TlsError(format!("TLS handshake failed: {}", e)))?;
        debug!("client-side TLS handshake complete");
        Ok(stream)
    }

    /// Run the server-side handshake on an accepted stream.
    pub async fn accept(&self, stream: TcpStream) -> Result<SslStream<TcpStream>, ChirpError> {
        let mut stream = self.new_stream(stream)?;
        std::pin::Pin::new(&mut stream)
            .accept()
            .await
            .map_err(|e| ChirpError::TlsError(format!("TLS handshake failed: {}", e)))?;
        debug!("server-side TLS handshake complete");
        Ok(stream)
    }

    fn new_stream(&self, stream: TcpStream) -> Result<SslStream<TcpStream>, ChirpError> {
        let ssl = Ssl::new(&self.context)
            .map_err(|e| ChirpError::TlsError(format!("creating TLS session failed: {}", e)))?;
        SslStream::new(ssl, stream)
            .map_err(|e| ChirpError::TlsError(format!("wrapping the stream failed: {}", e)))
    }
}

fn build_context(cert: &Path, dh: &Path) -> Result<SslContext, openssl::error::ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::tls())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_options(SslOptions::NO_COMPRESSION);
    builder.set_cipher_list(CIPHER_LIST)?;

    builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    builder.set_verify_depth(5);

    builder.set_certificate_chain_file(cert)?;
    builder.set_private_key_file(cert, SslFiletype::PEM)?;
    builder.check_private_key()?;
    builder.set_ca_file(cert)?;

    let dh_params = Dh::params_from_pem(&std::fs::read(dh).map_err(|_| {
        openssl::error::ErrorStack::get()
    })?)?;
    builder.set_tmp_dh(&dh_params)?;

    Ok(builder.build())
}

/// Whether a connection to `peer` gets TLS: encryption must be enabled, and loopback
///  peers are exempt unless the config insists.
pub(crate) fn should_encrypt(config: &Config, peer: IpAddr) -> bool {
    if config.disable_encryption {
        return false;
    }
    if peer.is_loopback() && !config.always_encrypt {
        return false;
    }
    true
}
