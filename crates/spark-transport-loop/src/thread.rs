use crate::error::{self, TransportError, map_io_error};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tokio::net::{TcpStream, UnixStream};
use tokio::runtime::{Builder, EnterGuard, Handle};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// 交给事件循环关闭的句柄。
pub(crate) enum CloseRequest {
    Tcp(TcpStream),
    Pipe(UnixStream),
}

impl CloseRequest {
    fn close(self) {
        match self {
            CloseRequest::Tcp(stream) => drop(stream),
            CloseRequest::Pipe(stream) => drop(stream),
        }
    }
}

/// 单线程事件循环。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 接纳桥的生产者必须是单个、不可重入的执行上下文；本类型在独立 OS 线程上运行
///   Tokio current-thread 运行时，监听器的接纳任务与所有连接泵都在这里被驱动；
/// - 句柄的关闭同样回到循环线程执行（`queue_close`），与句柄的注册位置保持一致。
///
/// ## 逻辑 (How)
/// - `start` 创建线程并在其中构建运行时，通过同步通道回传 [`Handle`]；
/// - 循环主体只做两件事：等待停止信号、排空关闭队列；
/// - `stop` 置位停止标志、发送停止信号并等待线程退出，运行时析构时会取消残留任务。
///
/// ## 契约 (What)
/// - `spawn`/`init` 在循环停止后返回 [`TransportError::LoopStopped`]；
/// - `queue_close` 永不失败：循环已停止时句柄就地关闭；
/// - 克隆共享同一线程，`stop` 可重复调用。
#[derive(Clone)]
pub struct LoopThread {
    inner: Arc<LoopShared>,
}

struct LoopShared {
    name: String,
    handle: Handle,
    thread_id: ThreadId,
    running: AtomicBool,
    close_queue: mpsc::UnboundedSender<CloseRequest>,
    queued_closes: AtomicU64,
    stop_signal: Mutex<Option<oneshot::Sender<()>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LoopThread {
    /// 启动名为 `name` 的事件循环线程。
    pub fn start(name: impl Into<String>) -> Result<Self, TransportError> {
        let name = name.into();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((runtime.handle().clone(), thread::current().id())));
                runtime.block_on(drive(stop_rx, close_rx));
            })
            .map_err(|err| map_io_error(error::SPAWN_LOOP, err))?;

        let (handle, thread_id) = ready_rx
            .recv()
            .map_err(|_| {
                map_io_error(
                    error::SPAWN_LOOP,
                    io::Error::other("loop thread exited before reporting readiness"),
                )
            })?
            .map_err(|err| map_io_error(error::SPAWN_LOOP, err))?;

        tracing::debug!(loop_name = %name, "event loop started");
        Ok(Self {
            inner: Arc::new(LoopShared {
                name,
                handle,
                thread_id,
                running: AtomicBool::new(true),
                close_queue: close_tx,
                queued_closes: AtomicU64::new(0),
                stop_signal: Mutex::new(Some(stop_tx)),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// 当前线程是否就是事件循环线程。
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// 循环仍在运行时返回 `Ok`。
    pub fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::LoopStopped {
                name: self.inner.name.clone(),
            })
        }
    }

    /// 在事件循环上调度任务。
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, TransportError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        Ok(self.inner.handle.spawn(future))
    }

    /// 进入循环的运行时上下文，用于把标准库套接字登记到循环的 IO 驱动上。
    pub fn enter(&self) -> Result<EnterGuard<'_>, TransportError> {
        self.ensure_running()?;
        Ok(self.inner.handle.enter())
    }

    /// 请求事件循环关闭句柄。
    pub(crate) fn queue_close(&self, request: CloseRequest) {
        self.inner.queued_closes.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(request)) = self.inner.close_queue.send(request) {
            request.close();
        }
    }

    /// 累计提交给 `queue_close` 的句柄数量。
    pub fn queued_closes(&self) -> u64 {
        self.inner.queued_closes.load(Ordering::Relaxed)
    }

    /// 停止事件循环并等待线程退出。
    ///
    /// 在循环线程内部调用时只发送停止信号，不等待自身退出。
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(signal) = self.inner.stop_signal.lock().take() {
            let _ = signal.send(());
        }
        if self.is_loop_thread() {
            return;
        }
        if let Some(join) = self.inner.join.lock().take()
            && join.join().is_err()
        {
            tracing::error!(loop_name = %self.inner.name, "event loop thread panicked");
        }
        tracing::debug!(loop_name = %self.inner.name, "event loop stopped");
    }
}

impl fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopThread")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn drive(
    mut stop: oneshot::Receiver<()>,
    mut closes: mpsc::UnboundedReceiver<CloseRequest>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            request = closes.recv() => match request {
                Some(request) => request.close(),
                None => break,
            },
        }
    }
    closes.close();
    while let Ok(request) = closes.try_recv() {
        request.close();
    }
}
