use crate::cancellation::Cancellation;
use crate::error::TransportError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::Notify;

/// 监听上下文使用的接纳队列容量。
pub const ACCEPT_QUEUE_CAPACITY: usize = 512;

/// 有界 FIFO 交接队列：事件循环线程写入，任意线程/任务读取。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 事件循环是单线程、不可重入的回调生产者，消费者则是任意数量的异步任务；
///   队列是两者之间唯一共享的可变状态，调用方无需额外加锁；
/// - 容量上限防止无人消费时连接无限堆积，满载时挂起写入方即为唯一的背压点。
///
/// ## 逻辑 (How)
/// - `parking_lot::Mutex<VecDeque<T>>` 保存元素与关闭标志，临界区只做入队/出队，从不跨 `.await`；
/// - `readable` 在入队后 `notify_one`、关闭时 `notify_waiters`；
///   `writable` 在出队后 `notify_one`、关闭时 `notify_waiters`；
/// - 等待方先登记 `Notified` 再检查状态，检查与唤醒之间不会丢失通知。
///
/// ## 契约 (What)
/// - 长度始终不超过容量；出队顺序严格等于入队顺序；
/// - `close` 只生效一次，之后入队返回原元素，出队在排空后返回 `Ok(None)`；
/// - `dequeue` 的取消只中止等待，不会消费或丢失元素。
///
/// ## 注意事项 (Trade-offs)
/// - 等待者按登记顺序被唤醒，但被唤醒者若随后放弃等待，通知会转交下一个等待者，
///   因此元素的交付顺序由入队顺序决定，而非调用方到达顺序。
pub struct AcceptQueue<T> {
    state: Mutex<QueueState<T>>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// 入队时队列已关闭，元素原样退回。
pub struct QueueClosed<T>(pub T);

impl<T> QueueClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

/// 非阻塞入队失败的原因，元素原样退回。
pub enum TryEnqueueError<T> {
    Full(T),
    Closed(T),
}

impl<T> TryEnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryEnqueueError::Full(item) | TryEnqueueError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for TryEnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryEnqueueError::Full(_) => f.write_str("Full(..)"),
            TryEnqueueError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

enum Slot<T> {
    Item(T),
    Empty,
    Closed,
}

impl<T> AcceptQueue<T> {
    /// 以 [`ACCEPT_QUEUE_CAPACITY`] 创建队列。
    pub fn new() -> Self {
        Self::with_capacity(ACCEPT_QUEUE_CAPACITY)
    }

    /// 以指定容量创建队列，容量至少为 1。
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前排队中的元素数量。
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 非阻塞入队。
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TryEnqueueError::Closed(item));
            }
            if state.items.len() >= self.capacity {
                return Err(TryEnqueueError::Full(item));
            }
            state.items.push_back(item);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// 入队；队列满载时挂起，直到有空位或队列关闭。
    pub async fn enqueue(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut pending = item;
        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            match self.try_enqueue(pending) {
                Ok(()) => return Ok(()),
                Err(TryEnqueueError::Closed(item)) => return Err(QueueClosed(item)),
                Err(TryEnqueueError::Full(item)) => pending = item,
            }

            writable.await;
        }
    }

    /// 非阻塞出队。
    pub fn try_dequeue(&self) -> Option<T> {
        match self.take() {
            Slot::Item(item) => Some(item),
            Slot::Empty | Slot::Closed => None,
        }
    }

    /// 出队；队列为空时挂起。
    ///
    /// - `Ok(Some(item))`：按入队顺序取得下一个元素；
    /// - `Ok(None)`：队列已关闭且已排空；
    /// - `Err(TransportError::Cancelled)`：等待期间 `cancellation` 被触发，队列状态不变。
    pub async fn dequeue(&self, cancellation: &Cancellation) -> Result<Option<T>, TransportError> {
        loop {
            if cancellation.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            match self.take() {
                Slot::Item(item) => return Ok(Some(item)),
                Slot::Closed => return Ok(None),
                Slot::Empty => {}
            }

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(TransportError::Cancelled),
                _ = &mut readable => {}
            }
        }
    }

    /// 关闭队列。首次关闭返回 `true`，重复关闭无副作用并返回 `false`。
    pub fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if first {
            self.readable.notify_waiters();
            self.writable.notify_waiters();
        }
        first
    }

    fn take(&self) -> Slot<T> {
        let slot = {
            let mut state = self.state.lock();
            match state.items.pop_front() {
                Some(item) => Slot::Item(item),
                None if state.closed => Slot::Closed,
                None => Slot::Empty,
            }
        };
        if matches!(slot, Slot::Item(_)) {
            self.writable.notify_one();
        }
        slot
    }
}

impl<T> Default for AcceptQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AcceptQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AcceptQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
