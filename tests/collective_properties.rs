use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device};
use inc_collectives::distributed::types::chunk_range;
use inc_collectives::distributed::{
    Algorithm, AlgorithmEntry, AlgorithmTable, CollectiveCommunicator, DeviceBuffer, GroupOptions, LocalTransport,
    OpCode, ProcessGroup, ReduceOp, TransportStats, Work, WorkState,
};
use inc_collectives::utils::config::{BackendChoice, CollectiveConfig};
use inc_collectives::utils::error::CollectiveError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::Runtime;

const WAIT: Option<Duration> = Some(Duration::from_secs(20));

fn cpu_config() -> CollectiveConfig {
    CollectiveConfig {
        backend: BackendChoice::Cpu,
        ..Default::default()
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Group whose ranks all run one algorithm for `opcode`, with the transports
/// kept around so tests can break links.
fn forced_group(
    rt: &Runtime,
    world_size: usize,
    opcode: OpCode,
    algorithm: Algorithm,
) -> (Vec<Arc<LocalTransport>>, Vec<ProcessGroup>) {
    let transports: Vec<_> = LocalTransport::new_group(world_size).into_iter().map(Arc::new).collect();
    let groups = transports
        .iter()
        .map(|t| {
            let options = GroupOptions {
                runtime: Some(rt.handle().clone()),
                table: Some(AlgorithmTable::new(vec![AlgorithmEntry {
                    opcode,
                    bytes: 0..usize::MAX,
                    algorithm,
                }])),
                ..Default::default()
            };
            ProcessGroup::with_transport(t.clone(), cpu_config(), options).unwrap()
        })
        .collect();
    (transports, groups)
}

fn wait_all(works: &[Work]) {
    for (rank, w) in works.iter().enumerate() {
        w.wait(WAIT).unwrap_or_else(|e| panic!("rank {} failed: {}", rank, e));
    }
}

#[test]
fn test_all_reduce_of_rank_ids() {
    for n in 1..=6 {
        let groups = ProcessGroup::new_local_group(n, cpu_config()).unwrap();
        let outputs: Vec<_> = groups
            .iter()
            .map(|_| DeviceBuffer::zeros(DType::F32, 3, &Device::Cpu).unwrap())
            .collect();
        let works: Vec<_> = groups
            .iter()
            .zip(&outputs)
            .map(|(g, out)| {
                let input = DeviceBuffer::from_vec(vec![g.rank() as f32; 3], &Device::Cpu).unwrap();
                g.all_reduce(&input, out, ReduceOp::Sum).unwrap()
            })
            .collect();
        wait_all(&works);

        let expected = (n * (n - 1) / 2) as f32;
        for out in &outputs {
            assert_eq!(out.to_vec::<f32>().unwrap(), vec![expected; 3], "n={}", n);
        }
    }
}

#[test]
fn test_large_all_reduce_uses_ring() {
    let n = 4;
    let count = 8192; // 64 KiB of i64, above the small-message threshold
    let groups = ProcessGroup::new_local_group(n, cpu_config()).unwrap();
    let inputs: Vec<_> = (0..n)
        .map(|r| DeviceBuffer::from_vec((0..count as i64).map(|i| i * (r as i64 + 1)).collect(), &Device::Cpu).unwrap())
        .collect();
    assert_eq!(
        groups[0].algorithm_for(OpCode::AllReduce, &inputs[0], Some(ReduceOp::Sum)),
        Algorithm::Ring
    );

    // In place: output aliases input.
    let works: Vec<_> = groups
        .iter()
        .zip(&inputs)
        .map(|(g, buf)| g.all_reduce(buf, buf, ReduceOp::Sum).unwrap())
        .collect();
    wait_all(&works);

    let factor = (1..=n as i64).sum::<i64>();
    let expected: Vec<i64> = (0..count as i64).map(|i| i * factor).collect();
    for buf in &inputs {
        assert_eq!(buf.to_vec::<i64>().unwrap(), expected);
    }
}

#[test]
fn test_ring_and_doubling_agree_with_brute_force() {
    let rt = runtime();
    let n = 5;
    let count = 23;
    let mut rng = StdRng::seed_from_u64(42);
    let data: Vec<Vec<i64>> = (0..n)
        .map(|_| (0..count).map(|_| rng.gen_range(-1000..1000)).collect())
        .collect();

    for op in [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min] {
        let expected: Vec<i64> = (0..count)
            .map(|i| {
                let column = data.iter().map(|row| row[i]);
                match op {
                    ReduceOp::Sum => column.sum(),
                    ReduceOp::Max => column.max().unwrap(),
                    _ => column.min().unwrap(),
                }
            })
            .collect();

        for algorithm in [Algorithm::Ring, Algorithm::RecursiveDoubling] {
            let (_, groups) = forced_group(&rt, n, OpCode::AllReduce, algorithm);
            let outputs: Vec<_> = (0..n)
                .map(|_| DeviceBuffer::zeros(DType::I64, count, &Device::Cpu).unwrap())
                .collect();
            let works: Vec<_> = groups
                .iter()
                .enumerate()
                .map(|(r, g)| {
                    let input = DeviceBuffer::from_vec(data[r].clone(), &Device::Cpu).unwrap();
                    g.all_reduce(&input, &outputs[r], op).unwrap()
                })
                .collect();
            wait_all(&works);
            for out in &outputs {
                assert_eq!(out.to_vec::<i64>().unwrap(), expected, "{} with {}", op, algorithm);
            }
        }
    }
}

#[test]
fn test_broadcast_is_bit_exact() {
    let n = 5;
    let root = 2;
    let mut rng = StdRng::seed_from_u64(7);
    let mut payload: Vec<f32> = (0..37).map(|_| rng.gen::<f32>() * 1e6 - 5e5).collect();
    payload[3] = f32::MIN_POSITIVE / 4.0; // subnormal
    payload[5] = -0.0;

    let groups = ProcessGroup::new_local_group(n, cpu_config()).unwrap();
    let outputs: Vec<_> = (0..n)
        .map(|_| DeviceBuffer::zeros(DType::F32, payload.len(), &Device::Cpu).unwrap())
        .collect();
    let works: Vec<_> = groups
        .iter()
        .enumerate()
        .map(|(r, g)| {
            let input = if r == root {
                DeviceBuffer::from_vec(payload.clone(), &Device::Cpu).unwrap()
            } else {
                DeviceBuffer::zeros(DType::F32, payload.len(), &Device::Cpu).unwrap()
            };
            g.broadcast(&input, &outputs[r], root).unwrap()
        })
        .collect();
    wait_all(&works);

    let expected: Vec<u32> = payload.iter().map(|v| v.to_bits()).collect();
    for out in &outputs {
        let bits: Vec<u32> = out.to_vec::<f32>().unwrap().iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }
}

#[test]
fn test_all_gather_rank_order_both_algorithms() {
    let rt = runtime();
    let n = 5;
    let expected: Vec<u32> = (0..n as u32).flat_map(|r| [r * 10, r * 10 + 1]).collect();

    for algorithm in [Algorithm::Ring, Algorithm::RecursiveDoubling] {
        let (_, groups) = forced_group(&rt, n, OpCode::AllGather, algorithm);
        let outputs: Vec<_> = (0..n)
            .map(|_| DeviceBuffer::zeros(DType::U32, 2 * n, &Device::Cpu).unwrap())
            .collect();
        let works: Vec<_> = groups
            .iter()
            .enumerate()
            .map(|(r, g)| {
                let input = DeviceBuffer::from_vec(vec![r as u32 * 10, r as u32 * 10 + 1], &Device::Cpu).unwrap();
                g.all_gather(&input, &outputs[r]).unwrap()
            })
            .collect();
        wait_all(&works);
        for out in &outputs {
            assert_eq!(out.to_vec::<u32>().unwrap(), expected, "{}", algorithm);
        }
    }
}

#[test]
fn test_reduce_scatter_uneven_chunks() {
    let rt = runtime();
    let n = 3;
    let count = 7;

    for algorithm in [Algorithm::Ring, Algorithm::RecursiveHalving] {
        let (_, groups) = forced_group(&rt, n, OpCode::ReduceScatter, algorithm);
        let outputs: Vec<_> = (0..n)
            .map(|r| DeviceBuffer::zeros(DType::F64, chunk_range(count, n, r).len(), &Device::Cpu).unwrap())
            .collect();
        assert_eq!(
            outputs.iter().map(DeviceBuffer::element_count).collect::<Vec<_>>(),
            vec![3, 2, 2]
        );
        let works: Vec<_> = groups
            .iter()
            .enumerate()
            .map(|(r, g)| {
                let values: Vec<f64> = (0..count).map(|i| (i + r * 100) as f64).collect();
                let input = DeviceBuffer::from_vec(values, &Device::Cpu).unwrap();
                g.reduce_scatter(&input, &outputs[r], ReduceOp::Avg).unwrap()
            })
            .collect();
        wait_all(&works);

        for (r, out) in outputs.iter().enumerate() {
            let got = out.to_vec::<f64>().unwrap();
            for (v, i) in got.iter().zip(chunk_range(count, n, r)) {
                assert!((v - (i as f64 + 100.0)).abs() < 1e-9, "rank {} with {}", r, algorithm);
            }
        }
    }
}

#[test]
fn test_barrier_waits_for_every_rank() {
    let groups = ProcessGroup::new_local_group(4, cpu_config()).unwrap();
    let early: Vec<_> = groups[..3].iter().map(|g| g.barrier().unwrap()).collect();

    for w in &early {
        assert!(matches!(w.wait(Some(Duration::from_millis(200))), Err(CollectiveError::TimedOut(_))));
        assert!(!w.poll().is_terminal());
    }

    let last = groups[3].barrier().unwrap();
    last.wait(WAIT).unwrap();
    wait_all(&early);
}

#[test]
fn test_single_rank_makes_no_transport_calls() {
    let groups = ProcessGroup::new_local_group(1, cpu_config()).unwrap();
    let g = &groups[0];
    let input = DeviceBuffer::from_vec(vec![1u32, 2, 3], &Device::Cpu).unwrap();
    let output = DeviceBuffer::zeros(DType::U32, 3, &Device::Cpu).unwrap();

    let works = [
        g.all_reduce(&input, &output, ReduceOp::Max).unwrap(),
        g.broadcast(&input, &output, 0).unwrap(),
        g.all_gather(&input, &output).unwrap(),
        g.reduce_scatter(&input, &output, ReduceOp::Sum).unwrap(),
        g.barrier().unwrap(),
    ];
    for w in &works {
        assert_eq!(w.poll(), WorkState::Completed);
    }
    assert_eq!(output.to_vec::<u32>().unwrap(), vec![1, 2, 3]);
    assert_eq!(g.transport_stats(), TransportStats::default());
}

#[test]
fn test_broken_link_fails_every_rank() {
    let rt = runtime();
    let n = 4;
    let (transports, groups) = forced_group(&rt, n, OpCode::AllReduce, Algorithm::RecursiveDoubling);
    transports[0].sever(1);

    let works: Vec<_> = groups
        .iter()
        .map(|g| {
            let buf = DeviceBuffer::from_vec(vec![1.0f32; 4], &Device::Cpu).unwrap();
            g.all_reduce(&buf, &buf, ReduceOp::Sum).unwrap()
        })
        .collect();

    for w in &works {
        let err = w.wait(WAIT).unwrap_err();
        assert!(
            matches!(err, CollectiveError::Connectivity { .. } | CollectiveError::Aborted { .. }),
            "unexpected error {}",
            err
        );
        assert_eq!(w.poll(), WorkState::Failed);
    }
}

#[test]
fn test_length_disagreement_fails_every_rank() {
    let rt = runtime();
    let n = 3;

    for algorithm in [Algorithm::Ring, Algorithm::RecursiveDoubling] {
        let (_, groups) = forced_group(&rt, n, OpCode::AllReduce, algorithm);
        let works: Vec<_> = groups
            .iter()
            .map(|g| {
                let len = if g.rank() == 0 { 5 } else { 4 };
                let buf = DeviceBuffer::from_vec(vec![1i64; len], &Device::Cpu).unwrap();
                g.all_reduce(&buf, &buf, ReduceOp::Sum).unwrap()
            })
            .collect();

        let mut detected = false;
        for (rank, w) in works.iter().enumerate() {
            let err = w.wait(WAIT).unwrap_err();
            match err {
                CollectiveError::ShapeMismatch(_) => detected = true,
                CollectiveError::Aborted { .. } => {}
                other => panic!("rank {} with {}: unexpected error {}", rank, algorithm, other),
            }
            assert_eq!(w.poll(), WorkState::Failed);
        }
        assert!(detected, "no rank reported the mismatch with {}", algorithm);
    }
}

#[test]
fn test_cancel_stress_leaves_pool_consistent() {
    let n = 3;
    let mut rng = StdRng::seed_from_u64(2024);
    let groups = ProcessGroup::new_local_group(n, cpu_config()).unwrap();

    for round in 0..40 {
        let count = [64, 1000, 1999][rng.gen_range(0..3)];
        let works: Vec<_> = groups
            .iter()
            .map(|g| {
                let buf = DeviceBuffer::from_vec(vec![g.rank() as f32; count], &Device::Cpu).unwrap();
                g.all_reduce(&buf, &buf, ReduceOp::Sum).unwrap()
            })
            .collect();
        if rng.gen_bool(0.4) {
            works[rng.gen_range(0..n)].cancel();
        }
        for w in &works {
            let outcome = w.wait(WAIT);
            assert!(!matches!(outcome, Err(CollectiveError::TimedOut(_))), "round {} hung", round);
            assert!(w.poll().is_terminal());
        }
    }

    for g in &groups {
        let stats = g.pool_stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.double_allocations, 0);
        assert!(stats.reuses > 0);
    }

    // The group is still usable afterwards.
    let outputs: Vec<_> = (0..n)
        .map(|_| DeviceBuffer::zeros(DType::F32, 2, &Device::Cpu).unwrap())
        .collect();
    let works: Vec<_> = groups
        .iter()
        .zip(&outputs)
        .map(|(g, out)| {
            let input = DeviceBuffer::from_vec(vec![1.0f32; 2], &Device::Cpu).unwrap();
            g.all_reduce(&input, out, ReduceOp::Sum).unwrap()
        })
        .collect();
    wait_all(&works);
    assert_eq!(outputs[2].to_vec::<f32>().unwrap(), vec![3.0, 3.0]);
}

#[test]
fn test_point_to_point_tags() {
    let groups = ProcessGroup::new_local_group(2, cpu_config()).unwrap();
    let first = DeviceBuffer::zeros(DType::I64, 2, &Device::Cpu).unwrap();
    let second = DeviceBuffer::zeros(DType::I64, 2, &Device::Cpu).unwrap();

    // Receives posted in the opposite order of the sends still match by tag.
    let r2 = groups[1].recv(&second, 0, 2).unwrap();
    let r1 = groups[1].recv(&first, 0, 1).unwrap();
    let s1 = groups[0].send(&DeviceBuffer::from_vec(vec![1i64, 1], &Device::Cpu).unwrap(), 1, 1).unwrap();
    let s2 = groups[0].send(&DeviceBuffer::from_vec(vec![2i64, 2], &Device::Cpu).unwrap(), 1, 2).unwrap();
    wait_all(&[s1, s2, r1, r2]);

    assert_eq!(first.to_vec::<i64>().unwrap(), vec![1, 1]);
    assert_eq!(second.to_vec::<i64>().unwrap(), vec![2, 2]);

    let small = DeviceBuffer::zeros(DType::I64, 1, &Device::Cpu).unwrap();
    let r = groups[1].recv(&small, 0, 9).unwrap();
    groups[0]
        .send(&DeviceBuffer::from_vec(vec![1i64, 2, 3], &Device::Cpu).unwrap(), 1, 9)
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert!(matches!(r.wait(WAIT), Err(CollectiveError::SizeMismatch { expected: 1, actual: 3 })));
}

#[test]
fn test_invalid_calls_rejected_before_issue() {
    let groups = ProcessGroup::new_local_group(3, cpu_config()).unwrap();
    let g = &groups[1];
    let input = DeviceBuffer::zeros(DType::U32, 7, &Device::Cpu).unwrap();

    let wrong_chunk = DeviceBuffer::zeros(DType::U32, 3, &Device::Cpu).unwrap();
    assert!(matches!(
        g.reduce_scatter(&input, &wrong_chunk, ReduceOp::Sum),
        Err(CollectiveError::SizeMismatch { expected: 2, actual: 3 })
    ));
    assert!(matches!(
        g.all_reduce(&input, &input, ReduceOp::Avg),
        Err(CollectiveError::UnsupportedOperation { op: ReduceOp::Avg, dtype: DType::U32 })
    ));
    assert!(matches!(g.send(&input, 3, 0), Err(CollectiveError::InvalidArgument(_))));
}

#[test]
fn test_groups_are_independent() {
    let a = ProcessGroup::new_local_group(2, cpu_config()).unwrap();
    let b = ProcessGroup::new_local_group(3, cpu_config()).unwrap();

    let sum_a: Vec<f64> = std::thread::scope(|s| {
        let handles: Vec<_> = a
            .iter()
            .map(|g| s.spawn(move || inc_collectives::distributed::all_reduce_scalar(2.0, ReduceOp::Sum, g)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
    });
    let max_b: Vec<f64> = std::thread::scope(|s| {
        let handles: Vec<_> = b
            .iter()
            .map(|g| {
                s.spawn(move || {
                    inc_collectives::distributed::all_reduce_scalar(g.rank() as f64, ReduceOp::Max, g)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
    });

    assert_eq!(sum_a, vec![4.0, 4.0]);
    assert_eq!(max_b, vec![2.0, 2.0, 2.0]);
    assert_eq!(CollectiveCommunicator::world_size(&b[0]), 3);
}
