//! Certificate files for the template backend.
//!
//! Edge and reencrypt bindings get `certs/<host>.pem` holding the private key,
//! the certificate and the optional CA certificate. Reencrypt bindings also
//! get `cacerts/<host>_pod.pem` with the destination CA. File names depend on
//! the host only, so rewriting them is idempotent.

use crate::error::{Result, RouterError};
use crate::model::{RouteBinding, DEST_CA_CERT_SUFFIX};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the default certificate file inside the certificate directory
pub const DEFAULT_CERT_NAME: &str = "default";

const CERT_DIR: &str = "certs";
const CA_CERT_DIR: &str = "cacerts";

#[derive(Debug, Clone)]
pub struct CertificateMaterializer {
    cert_dir: PathBuf,
    ca_cert_dir: PathBuf,
}

impl CertificateMaterializer {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            cert_dir: working_dir.join(CERT_DIR),
            ca_cert_dir: working_dir.join(CA_CERT_DIR),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn ca_cert_dir(&self) -> &Path {
        &self.ca_cert_dir
    }

    pub fn cert_path(&self, host: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.pem", host))
    }

    pub fn destination_ca_path(&self, host: &str) -> PathBuf {
        self.ca_cert_dir
            .join(format!("{}{}.pem", host, DEST_CA_CERT_SUFFIX))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.cert_dir, &self.ca_cert_dir] {
            std::fs::create_dir_all(dir).map_err(|e| RouterError::io(dir, e))?;
        }
        Ok(())
    }

    /// Write the artifacts of one binding. Passthrough and plain bindings write nothing.
    pub fn materialize(&self, binding: &RouteBinding) -> Result<()> {
        if !binding.termination.terminates_at_proxy() {
            return Ok(());
        }

        if let Some(cert) = binding.host_certificate() {
            let mut contents = String::new();
            if let Some(key) = &cert.private_key {
                contents.push_str(key);
                contents.push('\n');
            }
            contents.push_str(&cert.contents);
            if let Some(ca) = binding.ca_certificate() {
                contents.push('\n');
                contents.push_str(&ca.contents);
            }

            let path = self.cert_path(&binding.host);
            write_atomic(&path, contents.as_bytes(), true)?;
            debug!(host = %binding.host, path = %path.display(), "Certificate written");
        }

        if let Some(dest) = binding.destination_ca_certificate() {
            let path = self.destination_ca_path(&binding.host);
            write_atomic(&path, dest.contents.as_bytes(), true)?;
            debug!(host = %binding.host, path = %path.display(), "Destination CA written");
        }

        Ok(())
    }

    /// Artifacts of removed bindings are left on disk.
    pub fn remove(&self, binding: &RouteBinding) {
        debug!(
            host = %binding.host,
            "Certificate removal is not performed; artifacts stay until overwritten"
        );
    }

    /// Copy the default certificate into place and return its path
    pub fn write_default_certificate(&self, contents: &[u8]) -> Result<PathBuf> {
        let path = self.cert_path(DEFAULT_CERT_NAME);
        write_atomic(&path, contents, true)?;
        info!(path = %path.display(), "Default certificate installed");
        Ok(path)
    }
}

/// Replace `path` with `contents` through a temporary file in the same directory.
///
/// Private files are created with mode 0600, others with 0644.
pub fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| RouterError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| RouterError::io(dir, e))?;
    tmp.write_all(contents).map_err(|e| RouterError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| RouterError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| RouterError::io(path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = private;
    }

    tmp.persist(path).map_err(|e| RouterError::io(path, e.error))?;
    Ok(())
}
