use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use ulid::Ulid;

/// Server settings, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub admins: HashSet<Ulid>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> io::Result<Option<T>> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, format!("{name}: cannot parse {raw:?}"))
        }),
    }
}

/// Comma-separated ULIDs; blanks are skipped.
pub fn parse_admins(raw: &str) -> io::Result<HashSet<Ulid>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Ulid::from_string(s).map_err(|e| {
                io::Error::new(ErrorKind::InvalidInput, format!("SLOTBOOK_ADMINS: {s}: {e}"))
            })
        })
        .collect()
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        let config = Self {
            port: parsed("SLOTBOOK_PORT")?.unwrap_or(5433),
            bind: var("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: var("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: var("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parsed("SLOTBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed("SLOTBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed("SLOTBOOK_METRICS_PORT")?,
            tls_cert: var("SLOTBOOK_TLS_CERT"),
            tls_key: var("SLOTBOOK_TLS_KEY"),
            admins: var("SLOTBOOK_ADMINS")
                .map(|raw| parse_admins(&raw))
                .transpose()?
                .unwrap_or_default(),
        };
        if config.max_connections == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "SLOTBOOK_MAX_CONNECTIONS must be at least 1",
            ));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    /// `None` when TLS is off. Cert and key must be given together.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut tls = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        tls.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }
}
