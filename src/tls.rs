use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::Config;

/// TLS acceptor from `BOOKD_TLS_CERT` / `BOOKD_TLS_KEY`; `None` serves plaintext.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both BOOKD_TLS_CERT and BOOKD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {cert_path}"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cert: Option<&str>, key: Option<&str>) -> Config {
        Config::from_lookup(|k| match k {
            "BOOKD_TLS_CERT" => cert.map(String::from),
            "BOOKD_TLS_KEY" => key.map(String::from),
            _ => None,
        })
    }

    #[test]
    fn plaintext_when_unset() {
        assert!(load_tls_acceptor(&config(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_an_error() {
        let Err(err) = load_tls_acceptor(&config(Some("cert.pem"), None)) else {
            panic!("expected error");
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_surface_io_error() {
        let Err(err) =
            load_tls_acceptor(&config(Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem")))
        else {
            panic!("expected error");
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
