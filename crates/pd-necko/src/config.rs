//! Registry configuration.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_ipc::ChannelConfig;
use pd_ipc::ProcessRole;
use pd_security::SecurityPolicy;
use std::ffi::OsStr;

const DEFAULT_TRANSFER_BUFFER_BYTES: usize = 32 * 1024;
const IPC_SECURITY_ENV: &str = "PIXELDUST_IPC_SECURITY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeckoConfig {
    /// Validate load contexts claimed by children. Only tests turn this off.
    pub ipc_security: bool,
    /// Largest data message relayed per read from a request.
    pub transfer_buffer_bytes: usize,
    pub channel: ChannelConfig,
}

impl NeckoConfig {
    pub fn hardened(role: ProcessRole) -> BrowserResult<Self> {
        let config = Self {
            ipc_security: true,
            transfer_buffer_bytes: DEFAULT_TRANSFER_BUFFER_BYTES,
            channel: ChannelConfig::hardened(role)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Hardened defaults with `PIXELDUST_IPC_SECURITY` applied.
    pub fn from_env(role: ProcessRole) -> BrowserResult<Self> {
        let mut config = Self::hardened(role)?;
        if let Some(value) = std::env::var_os(IPC_SECURITY_ENV) {
            config.ipc_security = ipc_security_enabled(&value);
        }
        Ok(config)
    }

    pub fn with_ipc_security(mut self, enabled: bool) -> Self {
        self.ipc_security = enabled;
        self
    }

    pub fn with_transfer_buffer_bytes(mut self, bytes: usize) -> Self {
        self.transfer_buffer_bytes = bytes;
        self
    }

    pub fn validate(&self) -> BrowserResult<()> {
        self.channel.validate()?;

        if self.transfer_buffer_bytes == 0 {
            return Err(BrowserError::new(
                "necko.transfer_buffer_invalid",
                "transfer_buffer_bytes must be greater than zero",
            ));
        }

        if self.transfer_buffer_bytes > self.channel.max_message_bytes {
            return Err(BrowserError::new(
                "necko.transfer_buffer_too_large",
                format!(
                    "transfer_buffer_bytes exceeds channel max_message_bytes ({} > {})",
                    self.transfer_buffer_bytes, self.channel.max_message_bytes
                ),
            ));
        }

        Ok(())
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        if self.ipc_security {
            SecurityPolicy::default()
        } else {
            SecurityPolicy::trusting()
        }
    }
}

fn ipc_security_enabled(value: &OsStr) -> bool {
    !matches!(
        value.to_str().map(str::trim),
        Some("0") | Some("false") | Some("off")
    )
}

#[cfg(test)]
mod tests {
    use super::NeckoConfig;
    use super::ipc_security_enabled;
    use pd_ipc::ProcessRole;
    use std::ffi::OsStr;

    fn hardened() -> NeckoConfig {
        NeckoConfig::hardened(ProcessRole::Parent).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn hardened_defaults_validate() {
        let config = hardened();
        assert!(config.ipc_security);
        assert_eq!(config.transfer_buffer_bytes, 32 * 1024);
        assert!(config.security_policy().ipc_security);
    }

    #[test]
    fn transfer_buffer_is_bounded_by_frame_limit() {
        let zero = hardened().with_transfer_buffer_bytes(0).validate();
        assert!(zero.is_err());
        if let Err(error) = zero {
            assert_eq!(error.code, "necko.transfer_buffer_invalid");
        }

        let config = hardened();
        let limit = config.channel.max_message_bytes;
        let too_large = config.with_transfer_buffer_bytes(limit + 1).validate();
        assert!(too_large.is_err());
        if let Err(error) = too_large {
            assert_eq!(error.code, "necko.transfer_buffer_too_large");
        }
    }

    #[test]
    fn env_value_disables_security() {
        assert!(!ipc_security_enabled(OsStr::new("0")));
        assert!(!ipc_security_enabled(OsStr::new(" off ")));
        assert!(ipc_security_enabled(OsStr::new("1")));
        assert!(ipc_security_enabled(OsStr::new("")));
        assert!(!hardened().with_ipc_security(false).security_policy().ipc_security);
    }
}
