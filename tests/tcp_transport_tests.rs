use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use inc_collectives::distributed::{
    all_reduce_scalar, CollectiveCommunicator, MemoryRendezvous, MessageTag, ProcessGroup, ReduceOp, TcpTransport,
    Transport,
};
use inc_collectives::utils::config::{BackendChoice, CollectiveConfig};
use inc_collectives::utils::error::CollectiveError;
use inc_collectives::utils::retry::RetryPolicy;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn pair() -> (TcpTransport, TcpTransport) {
    let a = TcpTransport::bind(loopback()).await.unwrap();
    let b = TcpTransport::bind(loopback()).await.unwrap();
    let addrs = vec![a.local_addr(), b.local_addr()];
    let policy = fast_policy();
    let (t0, t1) = tokio::join!(a.establish(0, &addrs, &policy), b.establish(1, &addrs, &policy));
    (t0.unwrap(), t1.unwrap())
}

#[tokio::test]
async fn test_frames_cross_the_socket() {
    let (t0, t1) = pair().await;
    let sent = Tensor::new(&[1.5f32, -2.25, 1e-3], &Device::Cpu).unwrap().to_dtype(DType::BF16).unwrap();
    t0.send(1, MessageTag::new(5, 0), &sent).await.unwrap();

    let got = t1.recv(0, MessageTag::new(5, 0), 3, &Device::Cpu).await.unwrap();
    assert_eq!(got.dtype(), DType::BF16);
    assert_eq!(
        got.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap(),
        sent.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap()
    );
    assert_eq!(t0.stats().messages_sent, 1);
    assert_eq!(t0.stats().bytes_sent, 6);
    assert_eq!(t1.stats().messages_received, 1);
}

#[tokio::test]
async fn test_abort_notice_and_disconnect() {
    let (t0, t1) = pair().await;
    t0.abort(9, "gave up").await;
    let err = t1.recv(0, MessageTag::new(9, 1), 4, &Device::Cpu).await.unwrap_err();
    assert_eq!(err, CollectiveError::Aborted { rank: 0, reason: "gave up".to_string() });

    drop(t0);
    let err = tokio::time::timeout(Duration::from_secs(5), t1.recv(0, MessageTag::new(10, 0), 4, &Device::Cpu))
        .await
        .expect("disconnect was not noticed")
        .unwrap_err();
    assert!(matches!(err, CollectiveError::Connectivity { rank: 0, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_send_keeps_stream_framed() {
    let (t0, t1) = pair().await;
    let big_len = 16 * 1024 * 1024;
    let big = Tensor::zeros(big_len, DType::F32, &Device::Cpu).unwrap();

    // Give up on the large send while its frame is still being written.
    let abandoned = tokio::time::timeout(Duration::from_millis(50), t0.send(1, MessageTag::p2p(1), &big)).await;
    drop(abandoned);

    let small = Tensor::new(&[42u32], &Device::Cpu).unwrap();
    t0.send(1, MessageTag::p2p(2), &small).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(30), t1.recv(0, MessageTag::p2p(2), 1, &Device::Cpu))
        .await
        .expect("message after an abandoned send never arrived")
        .unwrap();
    assert_eq!(got.to_vec1::<u32>().unwrap(), vec![42]);

    let whole = t1.recv(0, MessageTag::p2p(1), big_len, &Device::Cpu).await.unwrap();
    assert_eq!(whole.elem_count(), big_len);
}

#[tokio::test]
async fn test_world_size_disagreement_is_rejected() {
    let a = TcpTransport::bind(loopback()).await.unwrap();
    let b = TcpTransport::bind(loopback()).await.unwrap();
    let short = vec![a.local_addr(), b.local_addr()];
    let long = vec![a.local_addr(), b.local_addr(), SocketAddr::from(([127, 0, 0, 1], 9))];
    let policy = fast_policy();

    let (r0, r1) = tokio::join!(a.establish(0, &short, &policy), b.establish(1, &long, &policy));
    assert!(matches!(r0, Err(CollectiveError::Config(_))));
    assert!(r1.is_err());
}

#[test]
fn test_tcp_process_group_collectives() {
    let world_size = 3;
    let rendezvous = Arc::new(MemoryRendezvous::new(world_size));
    let config = CollectiveConfig {
        backend: BackendChoice::Cpu,
        connect_initial_delay_ms: 10,
        ..Default::default()
    };

    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let rendezvous = rendezvous.clone();
            let config = config.clone();
            thread::spawn(move || {
                let group = ProcessGroup::connect_tcp(rank, world_size, rendezvous.as_ref(), config).unwrap();
                let total = all_reduce_scalar(rank as f64 + 1.0, ReduceOp::Sum, &group).unwrap();
                let gathered = CollectiveCommunicator::all_gather(&group, &Tensor::new(&[rank as i64], &Device::Cpu).unwrap())
                    .unwrap()
                    .to_vec1::<i64>()
                    .unwrap();
                let from_root = CollectiveCommunicator::broadcast(
                    &group,
                    &Tensor::new(&[rank as u8 + 40], &Device::Cpu).unwrap(),
                    1,
                )
                .unwrap()
                .to_vec1::<u8>()
                .unwrap();
                CollectiveCommunicator::barrier(&group).unwrap();
                (total, gathered, from_root)
            })
        })
        .collect();

    for h in handles {
        let (total, gathered, from_root) = h.join().unwrap();
        assert_eq!(total, 6.0);
        assert_eq!(gathered, vec![0, 1, 2]);
        assert_eq!(from_root, vec![41]);
    }
}
