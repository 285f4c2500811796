//! End-to-end runs of the sum-of-squares pipeline in forked processes.
//!
//! Everything lives in a single test so that no other test thread is running
//! while the role processes are forked.

use taskvent::process::{LocalManager, ManagerConfig};
use taskvent::roles::SyncMode;
use taskvent::squares::{SquaresSink, SquaresVentilator, SquaresWorker, expected_sum};
use taskvent::transport::recv_json;

const COUNT: u64 = 50;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Launch a pipeline with `workers` workers and return the sink's total.
fn run_pipeline(workers: usize, sync: SyncMode) -> u64 {
    let result_port = free_port();
    let config = ManagerConfig::new(free_port(), free_port())
        .with_ventilator_hwm(Some(10))
        .with_worker_hwms(Some(5), Some(5))
        .with_sink_hwm(Some(100))
        .with_sync(sync);
    let mut manager = LocalManager::new(
        SquaresVentilator::new(COUNT),
        SquaresSink::new(COUNT).with_result_port(result_port),
        (0..workers).map(|_| SquaresWorker).collect(),
        config,
    );
    manager.launch().unwrap();
    assert_eq!(manager.processes().len(), workers + 2);

    let context = zmq::Context::new();
    let results = context.socket(zmq::PULL).unwrap();
    results.set_rcvtimeo(30_000).unwrap();
    results
        .bind(&format!("tcp://127.0.0.1:{}", result_port))
        .unwrap();

    let sum: u64 = recv_json(&results).unwrap();
    let reason = manager.wait().unwrap();
    assert!(reason.is_success(), "sink {}", reason);
    // Workers never finish on their own and must have been stopped.
    assert!(manager.processes().iter().all(|p| p.exit_reason().is_some()));
    sum
}

#[test]
fn test_sum_of_squares_across_processes() {
    assert_eq!(expected_sum(COUNT), 42925);
    assert_eq!(run_pipeline(2, SyncMode::Tolerant), 42925);
    assert_eq!(run_pipeline(3, SyncMode::Tolerant), 42925);
    assert_eq!(run_pipeline(2, SyncMode::handshake(free_port())), 42925);
}
