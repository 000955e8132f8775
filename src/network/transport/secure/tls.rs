//! TLS identity and QUIC endpoint configuration.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile as pemfile;

use crate::config::{ServerConfig, TlsConfig};
use crate::network::error::StartError;

/// Uni streams a peer may have open at once.
const MAX_CONCURRENT_UNI_STREAMS: u32 = 64;

/// Datagrams buffered per connection before quinn drops the oldest.
const DATAGRAM_BUFFER_PACKETS: usize = 256;

/// Certificate chain plus private key.
pub type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Build the quinn server config: TLS identity plus transport limits.
pub fn build_server_config(config: &ServerConfig) -> Result<quinn::ServerConfig, StartError> {
    let (certs, private_key) = load_identity(&config.tls)?;
    let mut server_config = quinn::ServerConfig::with_single_cert(certs, private_key)
        .map_err(|err| StartError::Tls(err.to_string()))?;

    let idle_timeout = quinn::IdleTimeout::try_from(config.idle_timeout)
        .map_err(|err| StartError::InvalidConfig(format!("idle_timeout: {err}")))?;

    let mut transport = quinn::TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(quinn::VarInt::from_u32(0))
        .max_concurrent_uni_streams(quinn::VarInt::from_u32(MAX_CONCURRENT_UNI_STREAMS))
        .datagram_receive_buffer_size(Some(config.max_payload_size.max(1500) * DATAGRAM_BUFFER_PACKETS))
        .keep_alive_interval(Some(config.keepalive_interval))
        .max_idle_timeout(Some(idle_timeout));
    server_config.transport = Arc::new(transport);
    Ok(server_config)
}

/// Load or generate the server's certificate and key.
pub fn load_identity(tls: &TlsConfig) -> Result<Identity, StartError> {
    match tls {
        TlsConfig::SelfSigned { subject_alt_names } => {
            let certified_key = rcgen::generate_simple_self_signed(subject_alt_names.clone())
                .map_err(|err| StartError::Tls(err.to_string()))?;
            let rcgen::CertifiedKey { cert, signing_key } = certified_key;
            let cert_der = cert.der().clone();
            let priv_key = PrivatePkcs8KeyDer::from(signing_key.serialize_der());
            Ok((vec![cert_der], priv_key.into()))
        }
        TlsConfig::CertificateFiles {
            certificate,
            private_key,
        } => {
            let mut certs = open(certificate, "certificate")?;
            let mut key = open(private_key, "private key")?;
            parse_pem(&mut certs, &mut key)
        }
        TlsConfig::Pem {
            certificate_pem,
            private_key_pem,
        } => parse_pem(
            &mut certificate_pem.as_bytes(),
            &mut private_key_pem.as_bytes(),
        ),
    }
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, StartError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| StartError::Tls(format!("{what} file {}: {err}", path.display())))
}

fn parse_pem(certs: &mut dyn BufRead, key: &mut dyn BufRead) -> Result<Identity, StartError> {
    let certs = pemfile::certs(certs)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StartError::Tls(format!("parse certificate: {err}")))?;
    if certs.is_empty() {
        return Err(StartError::Tls("no certificates found".into()));
    }

    let key = pemfile::private_key(key)
        .map_err(|err| StartError::Tls(format!("parse private key: {err}")))?
        .ok_or_else(|| StartError::Tls("no private key found".into()))?;

    Ok((certs, key))
}
