//! 接纳队列的交接语义验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：接纳队列是事件循环与消费者之间唯一共享的可变状态，
//!   这里验证 FIFO 顺序、容量上限处的挂起、关闭后的排空，以及取消不会吞掉元素。
//! - **设计手法 (How)**：
//!   - 以 Proptest 生成“入队/出队”操作序列，与 `VecDeque` 影子模型逐步对照；
//!   - 并发场景使用多线程 Tokio 运行时，挂起判定以短暂休眠后的 `is_finished` 为准。
//! - **合同与边界 (What)**：
//!   - 长度永不超过 [`ACCEPT_QUEUE_CAPACITY`]；
//!   - 第 513 个写入方挂起，直到某个消费者取走一个元素；
//!   - 关闭后已排队元素仍按顺序交付，随后返回 `Ok(None)`。

use proptest::prelude::*;
use spark_transport_loop::{
    ACCEPT_QUEUE_CAPACITY, AcceptQueue, Cancellation, TransportError, TryEnqueueError,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
enum Op {
    Enqueue(u32),
    Dequeue,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => any::<u32>().prop_map(Op::Enqueue),
            2 => Just(Op::Dequeue),
        ],
        0..256,
    )
}

proptest! {
    #[test]
    fn prop_queue_matches_fifo_model(capacity in 1usize..8, ops in ops()) {
        let queue = AcceptQueue::with_capacity(capacity);
        let mut model = VecDeque::new();
        let cancellation = Cancellation::new();

        for op in ops {
            match op {
                Op::Enqueue(value) => match queue.try_enqueue(value) {
                    Ok(()) => model.push_back(value),
                    Err(TryEnqueueError::Full(rejected)) => {
                        prop_assert_eq!(rejected, value);
                        prop_assert_eq!(model.len(), capacity);
                    }
                    Err(TryEnqueueError::Closed(_)) => prop_assert!(false, "queue never closed"),
                },
                Op::Dequeue if model.is_empty() => {
                    prop_assert_eq!(queue.try_dequeue(), None);
                }
                Op::Dequeue => {
                    let item = futures::executor::block_on(queue.dequeue(&cancellation));
                    prop_assert_eq!(item.ok().flatten(), model.pop_front());
                }
            }
            prop_assert!(queue.len() <= capacity);
            prop_assert_eq!(queue.len(), model.len());
        }

        queue.close();
        for expected in model {
            let item = futures::executor::block_on(queue.dequeue(&cancellation));
            prop_assert_eq!(item.ok().flatten(), Some(expected));
        }
        let drained = futures::executor::block_on(queue.dequeue(&cancellation));
        prop_assert!(matches!(drained, Ok(None)));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn writer_beyond_capacity_waits_for_a_dequeue() {
    let queue = Arc::new(AcceptQueue::new());
    for value in 0..ACCEPT_QUEUE_CAPACITY {
        queue.try_enqueue(value).expect("below capacity");
    }
    assert!(queue.is_full());

    let writer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.enqueue(ACCEPT_QUEUE_CAPACITY).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished(), "第 513 个写入方应挂起");
    assert_eq!(queue.len(), ACCEPT_QUEUE_CAPACITY);

    let first = queue
        .dequeue(&Cancellation::new())
        .await
        .expect("dequeue")
        .expect("item");
    assert_eq!(first, 0);

    tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .expect("写入方应在出队后恢复")
        .expect("writer task")
        .expect("queue open");
    assert_eq!(queue.len(), ACCEPT_QUEUE_CAPACITY);

    let mut expected = 1;
    while let Some(value) = queue.try_dequeue() {
        assert_eq!(value, expected);
        expected += 1;
    }
    assert_eq!(expected, ACCEPT_QUEUE_CAPACITY + 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_dequeue_leaves_queue_untouched() {
    let queue = Arc::new(AcceptQueue::<u32>::new());
    let cancellation = Cancellation::new();

    let reader = {
        let queue = Arc::clone(&queue);
        let cancellation = cancellation.clone();
        tokio::spawn(async move { queue.dequeue(&cancellation).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reader.is_finished());

    assert!(cancellation.cancel());
    let outcome = reader.await.expect("reader task");
    assert!(matches!(outcome, Err(TransportError::Cancelled)));

    queue.try_enqueue(7).expect("enqueue after cancel");
    assert_eq!(queue.len(), 1);
    let fresh = queue.dequeue(&Cancellation::new()).await.expect("dequeue");
    assert_eq!(fresh, Some(7));

    // 已取消的令牌即使队列非空也不会取走元素。
    queue.try_enqueue(8).expect("enqueue");
    assert!(matches!(
        queue.dequeue(&cancellation).await,
        Err(TransportError::Cancelled)
    ));
    assert_eq!(queue.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn close_wakes_idle_readers_and_drains_backlog() {
    let queue = Arc::new(AcceptQueue::<u32>::new());
    let idle = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.dequeue(&Cancellation::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.close());

    let idle = tokio::time::timeout(Duration::from_secs(1), idle)
        .await
        .expect("关闭应唤醒等待中的读取方")
        .expect("reader task");
    assert!(matches!(idle, Ok(None)));

    let queue = AcceptQueue::new();
    queue.try_enqueue(1).expect("enqueue");
    queue.try_enqueue(2).expect("enqueue");
    queue.close();
    assert!(queue.enqueue(3).await.is_err());

    let cancellation = Cancellation::new();
    assert_eq!(queue.dequeue(&cancellation).await.expect("first"), Some(1));
    assert_eq!(queue.dequeue(&cancellation).await.expect("second"), Some(2));
    assert_eq!(queue.dequeue(&cancellation).await.expect("drained"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_consumers_receive_each_item_once() {
    const ITEMS: u32 = 2_000;
    const CONSUMERS: usize = 4;

    let queue = Arc::new(AcceptQueue::with_capacity(16));
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let cancellation = Cancellation::new();
                let mut seen = Vec::new();
                while let Some(item) = queue.dequeue(&cancellation).await.expect("dequeue") {
                    seen.push(item);
                }
                seen
            })
        })
        .collect();

    for item in 0..ITEMS {
        queue.enqueue(item).await.expect("queue open");
    }
    queue.close();

    let mut all = BTreeSet::new();
    let mut total = 0;
    for consumer in consumers {
        let seen = consumer.await.expect("consumer task");
        // 单个消费者看到的元素保持入队顺序。
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        total += seen.len();
        all.extend(seen);
    }
    assert_eq!(total, ITEMS as usize);
    assert_eq!(all.len(), ITEMS as usize);
}
