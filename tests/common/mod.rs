#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use horizon_io::Endpoint;

static SCRATCH_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Directory under the system temp dir, removed on drop
pub struct Scratch {
    path: PathBuf,
}

impl Scratch {
    pub fn new(tag: &str) -> anyhow::Result<Self> {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("horizon_io-{}-{}-{}", tag, std::process::id(), seq));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Self-signed certificate and key for `localhost`, written as PEM files
pub struct Identity {
    pub cert: PathBuf,
    pub key: PathBuf,
    _dir: Scratch,
}

pub fn identity() -> anyhow::Result<Identity> {
    let dir = Scratch::new("identity")?;
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    fs::write(&cert, certified.cert.pem())?;
    fs::write(&key, certified.key_pair.serialize_pem())?;
    Ok(Identity { cert, key, _dir: dir })
}

/// Loopback endpoint; port 0 lets the kernel pick
pub fn localhost(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", port)
}

/// Whether binding `port` needs privileges this process lacks
pub fn port_is_privileged(port: u16) -> bool {
    if unsafe { libc::geteuid() } == 0 {
        return false;
    }
    let start = fs::read_to_string("/proc/sys/net/ipv4/ip_unprivileged_port_start")
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .unwrap_or(1024);
    port < start
}

/// Deterministic payload of `len` bytes
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
