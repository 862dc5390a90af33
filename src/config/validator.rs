use anyhow::{bail, Result};
use tracing::warn;

use super::{BridgeConfig, PluginConfig, PortalConfig, SessionConfig};
use crate::codec::HEADER_LEN;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证会话参数
    pub fn validate_session_config(config: &SessionConfig, context: &str) -> Result<()> {
        if config.queue_size == 0 {
            bail!("{}: session.queue_size must be greater than 0", context);
        }
        if config.write_attempts == 0 {
            bail!("{}: session.write_attempts must be greater than 0", context);
        }
        if config.write_timeout_secs == Some(0) {
            bail!("{}: session.write_timeout_secs cannot be 0", context);
        }
        if config.read_timeout_secs == Some(0) {
            bail!("{}: session.read_timeout_secs cannot be 0", context);
        }
        Ok(())
    }

    /// 验证帧长度上限，至少要能容纳空载荷以外的最小命令
    pub fn validate_max_frame_length(max: usize, context: &str) -> Result<()> {
        if max < HEADER_LEN {
            bail!(
                "{}: max_frame_length must be at least {} bytes (current: {})",
                context,
                HEADER_LEN,
                max
            );
        }
        Ok(())
    }

    /// 验证门户配置
    pub fn validate_portal_config(config: &PortalConfig) -> Result<()> {
        Self::validate_address(&config.server_addr, "Portal server_addr")?;
        Self::validate_address(&config.proxy_bind_addr, "Portal proxy_bind_addr")?;

        if config.worker_pool_capacity == 0 {
            bail!("Portal worker_pool_capacity must be greater than 0");
        }
        if config.worker_timeout_secs == 0 {
            bail!("Portal worker_timeout_secs must be greater than 0");
        }
        if config.heartbeat_timeout_secs == 0 {
            bail!("Portal heartbeat_timeout_secs must be greater than 0");
        }
        if config.sweep_interval_secs == 0 {
            bail!("Portal sweep_interval_secs must be greater than 0");
        }
        if config.handshake_timeout_secs == 0 {
            bail!("Portal handshake_timeout_secs must be greater than 0");
        }
        if config.sweep_interval_secs > config.heartbeat_timeout_secs {
            warn!(
                "sweep_interval_secs ({}) is longer than heartbeat_timeout_secs ({}), \
                 dead bridges will linger",
                config.sweep_interval_secs, config.heartbeat_timeout_secs
            );
        }

        Self::validate_max_frame_length(config.max_frame_length, "Portal")?;
        Self::validate_session_config(&config.session, "Portal")?;
        Ok(())
    }

    /// 验证网桥配置
    pub fn validate_bridge_config(config: &BridgeConfig) -> Result<()> {
        Self::validate_address(&config.server_addr, "Bridge server_addr")?;
        match &config.plugin {
            // 插件接管工作连接，不拨号本地端口
            Some(PluginConfig::FileServer { file_location, .. }) => {
                if file_location.as_os_str().is_empty() {
                    bail!("Bridge plugin.file_location cannot be empty");
                }
            }
            None => {
                Self::validate_address(&config.local_addr, "Bridge local_addr")?;
                Self::validate_port(config.local_port, "Bridge local_port")?;
            }
        }
        // 不支持动态分配远程端口
        Self::validate_port(config.remote_port, "Bridge remote_port")?;

        if let Some(ref name) = config.proxy_name {
            Self::validate_name(name, "Bridge proxy_name")?;
        }

        if config.heartbeat_interval_secs < 0 {
            bail!(
                "Bridge heartbeat_interval_secs cannot be less than 0 (current: {})",
                config.heartbeat_interval_secs
            );
        }
        if config.reconnect_delay_secs == Some(0) {
            bail!("Bridge reconnect_delay_secs cannot be 0");
        }
        if config.handshake_timeout_secs == 0 {
            bail!("Bridge handshake_timeout_secs must be greater than 0");
        }

        Self::validate_max_frame_length(config.max_frame_length, "Bridge")?;
        Self::validate_session_config(&config.session, "Bridge")?;
        Ok(())
    }
}
