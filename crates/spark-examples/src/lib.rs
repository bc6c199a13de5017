//! 接纳桥示例的公共部分：配置模型与加载。
//!
//! 二进制入口见 `src/bin/loop_echo.rs`。

pub mod config;

pub use config::{EchoConfig, ListenConfig};
