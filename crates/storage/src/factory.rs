//! Backend construction from storage descriptors.
//!
//! The descriptor's untyped settings are read exactly once, here, into the
//! typed configuration of the requested backend. Nothing is connected.

use crate::BackendHandle;
use crate::backend::{
    FtpBackend, FtpConfig, LocalBackend, LocalConfig, SmbBackend, SmbConfig, WebDavBackend, WebDavConfig,
};
use crate::error::{ErrorKind, Result};
use crate::models::Protocol;
use exn::ResultExt;
use fsbridge_config::{Settings, StorageDescriptor};

/// Creates disconnected backends from descriptors.
pub trait ClientFactory: Send + Sync {
    /// # Errors
    ///
    /// [`UnsupportedProtocol`](ErrorKind::UnsupportedProtocol) for an unknown
    /// protocol tag, [`Configuration`](ErrorKind::Configuration) for settings
    /// the backend can't work with.
    fn create_client(&self, descriptor: &StorageDescriptor) -> Result<BackendHandle>;

    /// Protocol tags this factory knows about, whether or not the current
    /// platform or build can actually connect with them.
    fn supported_protocols(&self) -> &[Protocol];
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl ClientFactory for DefaultFactory {
    fn create_client(&self, descriptor: &StorageDescriptor) -> Result<BackendHandle> {
        let protocol: Protocol = descriptor.protocol.parse()?;
        let (name, settings) = (descriptor.name.clone(), &descriptor.settings);
        tracing::debug!(storage = %descriptor.id, protocol = %protocol, "creating storage backend");
        let backend: BackendHandle = match protocol {
            Protocol::Smb => Box::new(SmbBackend::new(name, smb_config(settings)?)),
            Protocol::Ftp => Box::new(FtpBackend::new(name, ftp_config(settings)?)),
            Protocol::Nfs => nfs_backend(name, settings)?,
            Protocol::WebDav => Box::new(WebDavBackend::new(name, webdav_config(settings))?),
            Protocol::Local => Box::new(LocalBackend::new(name, local_config(settings))),
        };
        Ok(backend)
    }

    fn supported_protocols(&self) -> &[Protocol] {
        &Protocol::ALL
    }
}

fn port(settings: &Settings, default: u16) -> Result<u16> {
    let port = settings.integer_or(&["port"], i64::from(default));
    u16::try_from(port).or_raise(|| ErrorKind::Configuration(format!("port {port} is out of range")))
}

fn smb_config(settings: &Settings) -> Result<SmbConfig> {
    Ok(SmbConfig {
        host: settings.string_or(&["host"], ""),
        port: port(settings, SmbConfig::DEFAULT_PORT)?,
        share: settings.string_or(&["share"], ""),
        username: settings.string_or(&["username"], ""),
        password: settings.string_or(&["password"], ""),
        domain: settings.string_or(&["domain"], SmbConfig::DEFAULT_DOMAIN),
    })
}

fn ftp_config(settings: &Settings) -> Result<FtpConfig> {
    Ok(FtpConfig {
        host: settings.string_or(&["host"], ""),
        port: port(settings, FtpConfig::DEFAULT_PORT)?,
        username: settings.string_or(&["username"], ""),
        password: settings.string_or(&["password"], ""),
        path: settings.string_or(&["path"], ""),
    })
}

#[cfg(target_os = "linux")]
fn nfs_backend(name: String, settings: &Settings) -> Result<BackendHandle> {
    use crate::backend::{NfsBackend, NfsConfig};
    let config = NfsConfig {
        host: settings.string_or(&["host"], ""),
        export: settings.string_or(&["path", "export"], ""),
        mount_point: settings.string_or(&["mount_point", "mountPoint"], "").into(),
        options: settings.string_or(&["options"], NfsConfig::DEFAULT_OPTIONS),
    };
    Ok(Box::new(NfsBackend::new(name, config)?))
}

#[cfg(not(target_os = "linux"))]
fn nfs_backend(_name: String, _settings: &Settings) -> Result<BackendHandle> {
    exn::bail!(ErrorKind::UnsupportedPlatform(Protocol::Nfs))
}

fn webdav_config(settings: &Settings) -> WebDavConfig {
    WebDavConfig {
        url: settings.string_or(&["url"], ""),
        username: settings.string_or(&["username"], ""),
        password: settings.string_or(&["password"], ""),
        path: settings.string_or(&["path"], ""),
    }
}

fn local_config(settings: &Settings) -> LocalConfig {
    LocalConfig { base_path: settings.string_or(&["base_path", "basePath"], "").into() }
}
