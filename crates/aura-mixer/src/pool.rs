//! Slave pool
//!
//! Fixed-size worker pool for the two per-tick phases. The master hands
//! each worker a contiguous chunk of the node range over a channel, then
//! blocks until every worker reports done - only one phase is ever active.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::{broadcast_chunk, process_incoming_chunk, BroadcastParams, MixerNode, SlaveShared, SlaveStats};

/// One phase of work.
#[derive(Clone)]
pub enum SlaveJob {
    /// Pass 1: drain inboxes and apply.
    Drain,
    /// Pass 2: filter, sort, budget, encode, send.
    Broadcast(BroadcastParams),
}

enum WorkerMessage {
    Order {
        job: SlaveJob,
        nodes: Arc<Vec<Arc<MixerNode>>>,
        start: usize,
        end: usize,
    },
    Stop,
}

/// Fixed worker pool with a phase barrier.
pub struct SlavePool {
    senders: Vec<Sender<WorkerMessage>>,
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<Mutex<SlaveStats>>>,
}

impl SlavePool {
    pub fn new(shared: Arc<SlaveShared>, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        debug!(num_threads, "starting slave pool");

        let (done_tx, done_rx) = unbounded();
        let mut senders = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);
        let mut stats = Vec::with_capacity(num_threads);

        for index in 0..num_threads {
            let (job_tx, job_rx) = bounded::<WorkerMessage>(1);
            let slave_stats = Arc::new(Mutex::new(SlaveStats::default()));
            let worker_stats = slave_stats.clone();
            let worker_shared = shared.clone();
            let worker_done = done_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("aura-slave-{index}"))
                .spawn(move || {
                    while let Ok(message) = job_rx.recv() {
                        match message {
                            WorkerMessage::Order {
                                job,
                                nodes,
                                start,
                                end,
                            } => {
                                let chunk = &nodes[start..end];
                                let mut stats = worker_stats.lock();
                                match job {
                                    SlaveJob::Drain => {
                                        process_incoming_chunk(chunk, &worker_shared, &mut stats)
                                    }
                                    SlaveJob::Broadcast(params) => {
                                        broadcast_chunk(chunk, &params, &worker_shared, &mut stats)
                                    }
                                }
                                drop(stats);
                                let _ = worker_done.send(());
                            }
                            WorkerMessage::Stop => break,
                        }
                    }
                })
                .expect("failed to spawn slave thread");

            senders.push(job_tx);
            handles.push(handle);
            stats.push(slave_stats);
        }

        SlavePool {
            senders,
            done_rx,
            handles,
            stats,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.senders.len()
    }

    /// Run one phase over the node range and barrier until every worker is
    /// done. The range is partitioned contiguously and evenly.
    pub fn run(&self, job: SlaveJob, nodes: &[Arc<MixerNode>]) {
        if nodes.is_empty() {
            return;
        }

        let shared_nodes = Arc::new(nodes.to_vec());
        let workers = self.senders.len().min(nodes.len());
        let chunk = nodes.len().div_ceil(workers);

        let mut dispatched = 0;
        for (index, sender) in self.senders.iter().take(workers).enumerate() {
            let start = index * chunk;
            let end = ((index + 1) * chunk).min(nodes.len());
            if start >= end {
                continue;
            }
            sender
                .send(WorkerMessage::Order {
                    job: job.clone(),
                    nodes: shared_nodes.clone(),
                    start,
                    end,
                })
                .expect("slave thread exited unexpectedly");
            dispatched += 1;
        }

        for _ in 0..dispatched {
            self.done_rx
                .recv()
                .expect("slave thread exited unexpectedly");
        }
    }

    /// Sum and reset every slave's counters.
    pub fn harvest_stats(&self) -> SlaveStats {
        let mut aggregate = SlaveStats::default();
        for slot in &self.stats {
            aggregate += std::mem::take(&mut *slot.lock());
        }
        aggregate
    }
}

impl Drop for SlavePool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Stop);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::{Clock, NodeId};
    use aura_registry::{NodeFlags, NodeKind};

    use crate::{CaptureSink, ClientData, QueuedMessage, Registry, SortWeights};

    fn shared_for(registry: Arc<Registry>) -> Arc<SlaveShared> {
        Arc::new(SlaveShared {
            registry,
            sink: Arc::new(CaptureSink::new()),
            weights: Arc::new(SortWeights::new()),
            clock: Clock::new(),
            mixer_id: NodeId::random(),
            skeleton_whitelist: Vec::new(),
            skeleton_replacement: String::new(),
            min_bounding_radius: 0.0,
            max_bounding_radius: 1000.0,
        })
    }

    #[test]
    fn test_drain_phase_covers_every_node() {
        let registry = Arc::new(Registry::new(Clock::new()));
        for _ in 0..20 {
            let node = registry
                .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
                .unwrap();
            let client = node.client_or_init(|| ClientData::new(node.id(), node.local_id()));
            client
                .lock()
                .queue_packet(QueuedMessage::TraitsAck(1));
        }

        let pool = SlavePool::new(shared_for(registry.clone()), 4);
        registry.nested_each(|nodes| pool.run(SlaveJob::Drain, nodes));

        let stats = pool.harvest_stats();
        assert_eq!(stats.nodes_processed, 20);
        assert_eq!(stats.packets_processed, 20);
    }

    #[test]
    fn test_more_workers_than_nodes() {
        let registry = Arc::new(Registry::new(Clock::new()));
        let node = registry
            .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
            .unwrap();
        node.client_or_init(|| ClientData::new(node.id(), node.local_id()));

        let pool = SlavePool::new(shared_for(registry.clone()), 8);
        registry.nested_each(|nodes| pool.run(SlaveJob::Drain, nodes));
        assert_eq!(pool.harvest_stats().nodes_processed, 1);
    }

    #[test]
    fn test_harvest_resets_counters() {
        let registry = Arc::new(Registry::new(Clock::new()));
        let node = registry
            .add_or_update(NodeId::random(), NodeKind::Agent, None, NodeFlags::default())
            .unwrap();
        node.client_or_init(|| ClientData::new(node.id(), node.local_id()));

        let pool = SlavePool::new(shared_for(registry.clone()), 2);
        registry.nested_each(|nodes| pool.run(SlaveJob::Drain, nodes));
        assert_eq!(pool.harvest_stats().nodes_processed, 1);
        assert_eq!(pool.harvest_stats().nodes_processed, 0);
    }

    #[test]
    fn test_empty_range_is_a_noop() {
        let registry = Arc::new(Registry::new(Clock::new()));
        let pool = SlavePool::new(shared_for(registry), 2);
        pool.run(SlaveJob::Drain, &[]);
        assert_eq!(pool.harvest_stats().nodes_processed, 0);
    }
}
