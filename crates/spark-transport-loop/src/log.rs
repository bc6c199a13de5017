use crate::connection::ConnectionId;
use crate::error::TransportError;
use std::io;
use std::net::SocketAddr;

/// 传输层日志汇的最小契约。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 接纳桥只把日志视为不透明的结构化事件汇，宿主可以对接 `tracing`、测试记录器或自研后端；
/// - 每个事件一个方法，调用方无需拼装消息文本，实现方可以按事件类型做采样或计数。
///
/// ## 契约 (What)
/// - `connection_reset`：地址解析或连接泵遇到对端重置；`None` 表示对端身份未知；
/// - `unexpected_fault`：生产者路径上的非预期故障，必须以最高严重级别输出，`site` 标识调用点；
/// - 其余事件为诊断信息，默认空实现；
/// - **前置条件**：实现必须非阻塞，它们会在事件循环线程上被调用。
pub trait TransportLog: Send + Sync + 'static {
    fn connection_reset(&self, connection: Option<ConnectionId>);

    fn unexpected_fault(&self, error: &TransportError, site: &'static str);

    fn connection_accepted(&self, _connection: ConnectionId, _remote: Option<SocketAddr>) {}

    fn connection_rejected(&self, _connection: ConnectionId, _reason: &'static str) {}

    /// 生产者发现队列满载并开始等待。
    fn accept_queue_full(&self, _capacity: usize) {}

    fn connection_closed(&self, _connection: ConnectionId, _error: Option<&io::Error>) {}
}

/// 基于 `tracing` 的默认日志汇。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLog;

impl TransportLog for TracingLog {
    fn connection_reset(&self, connection: Option<ConnectionId>) {
        match connection {
            Some(id) => tracing::debug!(connection_id = %id, "connection reset"),
            None => tracing::debug!(connection_id = "(null)", "connection reset"),
        }
    }

    fn unexpected_fault(&self, error: &TransportError, site: &'static str) {
        tracing::error!(
            code = error.code(),
            site,
            error = %error,
            "unexpected exception in {site}"
        );
    }

    fn connection_accepted(&self, connection: ConnectionId, remote: Option<SocketAddr>) {
        match remote {
            Some(remote) => tracing::debug!(
                connection_id = %connection,
                %remote,
                "connection accepted"
            ),
            None => tracing::debug!(connection_id = %connection, "connection accepted"),
        }
    }

    fn connection_rejected(&self, connection: ConnectionId, reason: &'static str) {
        tracing::warn!(connection_id = %connection, reason, "connection rejected");
    }

    fn accept_queue_full(&self, capacity: usize) {
        tracing::warn!(
            capacity,
            "accept queue is full, connection intake is waiting for consumers"
        );
    }

    fn connection_closed(&self, connection: ConnectionId, error: Option<&io::Error>) {
        match error {
            Some(error) => tracing::debug!(
                connection_id = %connection,
                %error,
                "connection pump stopped with error"
            ),
            None => tracing::debug!(connection_id = %connection, "connection closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn tracing_log_reports_reset_and_faults() {
        let log = TracingLog;
        log.connection_reset(None);
        log.unexpected_fault(
            &TransportError::AcceptQueueClosed,
            "ListenerContext::handle_connection",
        );

        assert!(logs_contain("connection reset"));
        assert!(logs_contain("(null)"));
        assert!(logs_contain(
            "unexpected exception in ListenerContext::handle_connection"
        ));
        assert!(logs_contain("spark.transport.loop.accept_queue_closed"));
    }
}
