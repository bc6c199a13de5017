use anyhow::{Context, bail};
use serde::Deserialize;
use spark_transport_loop::{FileHandleKind, ListenEndpoint, TransportOptions};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// 回显示例的完整配置。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `[listen]`：`tcp`、`unix`、`fd` 三者恰好出现一个；`fd_kind` 仅与 `fd` 搭配，缺省为 `auto`；
/// - `[transport]`：可选，字段同 [`TransportOptions`]，缺省值见其 `Default` 实现；
/// - 未知字段直接报错，避免拼写错误被静默忽略。
///
/// ```toml
/// [listen]
/// tcp = "127.0.0.1:7878"
///
/// [transport]
/// backlog = 256
/// full_queue_policy = "reject"
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoConfig {
    pub listen: ListenConfig,
    #[serde(default)]
    pub transport: TransportOptions,
}

/// `[listen]` 表。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    pub tcp: Option<SocketAddr>,
    pub unix: Option<PathBuf>,
    pub fd: Option<RawFd>,
    pub fd_kind: Option<FileHandleKind>,
}

impl EchoConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: EchoConfig = toml::from_str(raw).context("failed to parse echo config")?;
        config.listen.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// 未提供配置文件时使用的缺省配置：监听 `127.0.0.1:7878`。
    pub fn fallback() -> Self {
        Self {
            listen: ListenConfig {
                tcp: Some(SocketAddr::from(([127, 0, 0, 1], 7878))),
                ..ListenConfig::default()
            },
            transport: TransportOptions::default(),
        }
    }
}

impl ListenConfig {
    fn validate(&self) -> anyhow::Result<()> {
        let configured = [self.tcp.is_some(), self.unix.is_some(), self.fd.is_some()]
            .into_iter()
            .filter(|present| *present)
            .count();
        if configured != 1 {
            bail!("[listen] requires exactly one of `tcp`, `unix` or `fd`, found {configured}");
        }
        if self.fd_kind.is_some() && self.fd.is_none() {
            bail!("[listen] `fd_kind` is only valid together with `fd`");
        }
        if let Some(fd) = self.fd
            && fd < 0
        {
            bail!("[listen] `fd` must be non-negative, got {fd}");
        }
        Ok(())
    }

    /// 转换为监听端点。
    ///
    /// `fd` 形式会接管该描述符的所有权，同一配置只应调用一次。
    pub fn to_endpoint(&self) -> anyhow::Result<ListenEndpoint> {
        self.validate()?;
        if let Some(addr) = self.tcp {
            return Ok(ListenEndpoint::tcp(addr));
        }
        if let Some(path) = &self.unix {
            return Ok(ListenEndpoint::unix(path.clone()));
        }
        match self.fd {
            Some(fd) => {
                // SAFETY: 描述符由启动方（systemd、父进程）继承给本进程，配置声明其归本进程所有。
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                Ok(ListenEndpoint::file_handle(
                    owned,
                    self.fd_kind.unwrap_or(FileHandleKind::Auto),
                ))
            }
            None => bail!("[listen] has no endpoint"),
        }
    }
}
