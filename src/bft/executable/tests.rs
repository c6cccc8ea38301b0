use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::bft::communication::message::{
    BatchRequest, BatchResponse, ClientRequestEntry, MessageKind, Request,
};
use crate::bft::communication::serialize;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::metrics::Metrics;
use crate::bft::ordering::{Orderable, SeqNo};

const TICK: Duration = Duration::from_millis(5);

struct RecordingExecutor {
    executed: Mutex<Vec<u64>>,
    out_of_order: bool,
    calls: AtomicUsize,
}

impl RecordingExecutor {
    fn new(out_of_order: bool) -> Arc<Self> {
        Arc::new(Self {
            executed: Mutex::new(Vec::new()),
            out_of_order,
            calls: AtomicUsize::new(0),
        })
    }
}

impl TransactionExecutor for RecordingExecutor {
    fn execute_batch(&self, batch: BatchRequest) -> Result<Option<BatchResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().push(u64::from(batch.seq));
        Ok(Some(BatchResponse {
            responses: vec![b"done".to_vec()],
            ..Default::default()
        }))
    }

    fn is_out_of_order(&self) -> bool {
        self.out_of_order
    }
}

fn committed(seq: u64) -> Request {
    let batch = BatchRequest {
        createtime: 11,
        local_id: 42,
        proxy_id: NodeId::from(3u32),
        client_requests: vec![ClientRequestEntry {
            sender_id: NodeId::from(9u32),
            data: seq.to_le_bytes().to_vec(),
        }],
        ..Default::default()
    };
    let data = serialize::serialize(&batch).unwrap();
    let mut req = Request::new(MessageKind::PrePrepare, NodeId::from(1u32));
    req.seq = SeqNo::from(seq);
    req.hash = Digest::of(&data[..]);
    req.data = data;
    req
}

fn pipeline(executor: Arc<RecordingExecutor>) -> TransactionPipeline {
    TransactionPipeline::new(executor, Arc::new(Metrics::new()))
}

#[test]
fn test_out_of_order_commits_execute_in_sequence() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor.clone());

    // commits arrive 3, 1, 2; the executor must see 1, 2, 3
    pipeline.commit(committed(3)).unwrap();
    assert_eq!(u64::from(pipeline.max_pending_executed_seq()), 0);
    pipeline.commit(committed(1)).unwrap();
    assert_eq!(u64::from(pipeline.max_pending_executed_seq()), 1);
    pipeline.commit(committed(2)).unwrap();
    assert_eq!(u64::from(pipeline.max_pending_executed_seq()), 3);

    for _ in 0..3 {
        assert!(pipeline.execute_once(TICK).unwrap());
    }
    assert_eq!(&executor.executed.lock()[..], &[1, 2, 3]);
}

#[test]
fn test_duplicate_commit_is_ignored() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor.clone());
    pipeline.commit(committed(1)).unwrap();
    pipeline.commit(committed(1)).unwrap();
    assert!(pipeline.execute_once(TICK).unwrap());
    assert!(!pipeline.execute_once(TICK).unwrap());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_seq_update_fires_after_each_drain() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor);
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        pipeline.set_seq_update(Box::new(move |seq| {
            seen.lock().push(u64::from(seq));
        }));
    }

    pipeline.commit(committed(2)).unwrap();
    pipeline.commit(committed(1)).unwrap();
    // the notification reports the next sequence to execute
    assert_eq!(&seen.lock()[..], &[2, 3]);
}

#[test]
fn test_pre_execute_runs_once_per_sequence() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor);
    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        pipeline.set_pre_execute(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));
    }
    pipeline.commit(committed(1)).unwrap();
    pipeline.commit(committed(1)).unwrap();
    pipeline.commit(committed(2)).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_post_execute_echoes_the_reply_routing_triple() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor);
    let seen: Arc<Mutex<Vec<(u64, u64, u32, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        pipeline.set_post_execute(Box::new(move |_, response| {
            seen.lock().push((
                response.createtime,
                response.local_id,
                u32::from(response.proxy_id),
                u64::from(response.seq),
            ));
        }));
    }

    pipeline.commit(committed(1)).unwrap();
    assert!(pipeline.execute_once(TICK).unwrap());
    assert_eq!(&seen.lock()[..], &[(11, 42, 3, 1)]);
}

#[test]
fn test_view_change_holes_skip_the_executor() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor.clone());

    let mut hole = Request::new(MessageKind::PrePrepare, NodeId::from(2u32));
    hole.seq = SeqNo::from(1);
    hole.hash = Digest::of(&[]);
    pipeline.commit(hole).unwrap();

    assert!(pipeline.execute_once(TICK).unwrap());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(u64::from(pipeline.max_pending_executed_seq()), 1);
}

#[test]
fn test_out_of_order_executor_uses_the_unordered_queue() {
    let executor = RecordingExecutor::new(true);
    let pipeline = pipeline(executor.clone());
    let replies = Arc::new(AtomicUsize::new(0));
    {
        let replies = replies.clone();
        pipeline.set_post_execute(Box::new(move |_, _| {
            replies.fetch_add(1, Ordering::SeqCst);
        }));
    }

    pipeline.commit(committed(1)).unwrap();

    // the unordered queue executes the batch
    assert!(pipeline.execute_out_of_order_once(TICK).unwrap());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    // the ordered path only delivers the reply
    assert!(pipeline.execute_once(TICK).unwrap());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(replies.load(Ordering::SeqCst), 1);
}

#[test]
fn test_commit_feeds_the_checkpoint_sink_in_order() {
    let executor = RecordingExecutor::new(false);
    let pipeline = pipeline(executor);
    let (tx, rx) = crate::bft::communication::channel::new_bounded(8);
    pipeline.set_commit_sink(tx);

    pipeline.commit(committed(2)).unwrap();
    pipeline.commit(committed(1)).unwrap();

    let first = rx.recv_timeout(TICK).unwrap();
    let second = rx.recv_timeout(TICK).unwrap();
    assert_eq!(u64::from(first.sequence_number()), 1);
    assert_eq!(u64::from(second.sequence_number()), 2);
}
