mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use request_counter::ledger::DEFAULT_PEER_IDLE_WINDOW;
use request_counter::peer::PeerHandle;
use request_counter::{CallContext, RequestCounter, UnaryServerInfo};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tonic::{Code, Status};

fn ctx(peer: &PeerHandle) -> CallContext {
    CallContext::new().with_peer(peer.clone())
}

async fn call_ok(
    counter: &RequestCounter,
    peer: &PeerHandle,
    method: &str,
    name: &str,
) -> Result<StatusResponse, Status> {
    counter
        .unary_interceptor(ctx(peer), request(name), &UnaryServerInfo::new(method), |_ctx, _req| async {
            Ok::<_, Status>(response("ok"))
        })
        .await
}

/// 启动一个阻塞中的调用，返回时 handler 已经开始执行
async fn spawn_blocked(
    counter: &RequestCounter,
    peer: &PeerHandle,
    method: &'static str,
    name: &str,
) -> (JoinHandle<Result<StatusResponse, Status>>, Arc<Notify>) {
    let release = Arc::new(Notify::new());
    let (started_tx, started_rx) = oneshot::channel();

    let counter = counter.clone();
    let ctx = ctx(peer);
    let req = request(name);
    let gate = release.clone();
    let handle = tokio::spawn(async move {
        counter
            .unary_interceptor(ctx, req, &UnaryServerInfo::new(method), move |_ctx, _req| async move {
                let _ = started_tx.send(());
                gate.notified().await;
                Ok::<_, Status>(response("done"))
            })
            .await
    });

    started_rx.await.expect("handler should start");
    (handle, release)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ceiling_one_rejects_second_caller_until_first_completes() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);
    let b = peer(2);

    let (first, release) = spawn_blocked(&counter, &a, ARM_MOVE, "arm1").await;
    assert_eq!(counter.in_flight(&limit_key("arm1")), 1);

    let status = call_ok(&counter, &b, ARM_MOVE, "arm1").await.unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
    assert!(
        status
            .message()
            .contains("exceeded request limit 1 on resource arm1.viam.component.arm.v1.ArmService"),
        "unexpected message: {}",
        status.message()
    );
    assert!(status.message().contains("your client is responsible for 0"));

    // 其它资源不受影响
    call_ok(&counter, &b, ARM_MOVE, "arm2").await.unwrap();

    release.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(counter.in_flight(&limit_key("arm1")), 0);

    // 第一个调用结束后，重试成功
    let resp = call_ok(&counter, &b, ARM_MOVE, "arm1").await.unwrap();
    assert_eq!(resp.state, "ok");
    assert_eq!(counter.rejected_total(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ceiling_never_exceeded_under_load() {
    const LIMIT: i64 = 3;
    let counter = RequestCounter::with_limit(LIMIT, DEFAULT_PEER_IDLE_WINDOW);
    let peak = Arc::new(std::sync::atomic::AtomicI64::new(0));
    let running = Arc::new(std::sync::atomic::AtomicI64::new(0));

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let counter = counter.clone();
        let peak = peak.clone();
        let running = running.clone();
        let caller = peer(100 + i % 4);
        tasks.push(tokio::spawn(async move {
            counter
                .unary_interceptor(ctx(&caller), request("arm1"), &UnaryServerInfo::new(ARM_MOVE), |_ctx, _req| async move {
                    let now = running.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, Status>(response("ok"))
                })
                .await
        }));
    }

    let mut admitted = 0i64;
    let mut rejected = 0i64;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(status) => {
                assert_eq!(status.code(), Code::ResourceExhausted);
                rejected += 1;
            }
        }
    }

    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= LIMIT);
    assert_eq!(admitted + rejected, 32);
    assert_eq!(rejected as u64, counter.rejected_total());
    assert_eq!(counter.in_flight(&limit_key("arm1")), 0);

    let key = "arm1.ArmService/MoveToPosition";
    assert_eq!(counter.stats()[key], admitted);
}

#[tokio::test]
async fn test_release_after_handler_error() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);

    let status = counter
        .unary_interceptor(ctx(&a), request("arm1"), &UnaryServerInfo::new(ARM_MOVE), |_ctx, _req| async {
            Err::<StatusResponse, _>(Status::internal("motor stalled"))
        })
        .await
        .unwrap_err();

    // handler 的错误原样返回
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "motor stalled");
    assert_eq!(counter.in_flight(&limit_key("arm1")), 0);
    assert_eq!(counter.peer_ledger().in_flight(Some(&a), &limit_key("arm1")), 0);

    call_ok(&counter, &a, ARM_MOVE, "arm1").await.unwrap();
}

#[tokio::test]
async fn test_release_after_cancellation() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);

    let info = UnaryServerInfo::new(ARM_MOVE);
    let call = counter.unary_interceptor(
        ctx(&a),
        request("arm1"),
        &info,
        |_ctx, _req| async {
            std::future::pending::<()>().await;
            Ok::<_, Status>(response("never"))
        },
    );
    assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());

    assert_eq!(counter.in_flight(&limit_key("arm1")), 0);
    let stats = counter.stats();
    assert_eq!(stats["arm1.ArmService/MoveToPosition"], 1);
    assert_eq!(stats["arm1.ArmService/MoveToPosition.errorCnt"], 1);

    call_ok(&counter, &a, ARM_MOVE, "arm1").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_after_handler_panic() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);

    let task = {
        let counter = counter.clone();
        let a = a.clone();
        tokio::spawn(async move {
            counter
                .unary_interceptor(ctx(&a), request("arm1"), &UnaryServerInfo::new(ARM_MOVE), |_ctx, _req| async {
                    if true {
                        panic!("handler blew up");
                    }
                    Ok::<_, Status>(response("unreachable"))
                })
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert_eq!(counter.in_flight(&limit_key("arm1")), 0);
    assert_eq!(counter.stats()["arm1.ArmService/MoveToPosition.errorCnt"], 1);
}

#[tokio::test]
async fn test_counting_completeness() {
    let counter = RequestCounter::with_limit(10, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);
    let info = UnaryServerInfo::new(ARM_MOVE);

    for i in 0..7 {
        let fail = i % 3 == 0;
        let _ = counter
            .unary_interceptor(ctx(&a), request("arm1"), &info, move |_ctx, _req| async move {
                if fail {
                    Err(Status::unavailable("busy"))
                } else {
                    Ok(response("moved"))
                }
            })
            .await;
    }

    let key = "arm1.ArmService/MoveToPosition";
    let stats = counter.stats();
    assert_eq!(stats[key], 7);
    // i = 0, 3, 6
    assert_eq!(stats[&format!("{}.errorCnt", key)], 3);
    let per_response = prost::Message::encoded_len(&response("moved")) as i64;
    assert_eq!(stats[&format!("{}.dataSentBytes", key)], 4 * per_response);
    assert!(stats.contains_key(&format!("{}.timeSpent", key)));
    assert_eq!(stats[&format!("{}.inFlightRequests", limit_key("arm1"))], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreign_api_never_counted_or_limited() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);
    let b = peer(2);

    // 即使消息带有资源名，外部 API 也不受上限约束
    let (first, release) = spawn_blocked(&counter, &a, FOREIGN_METHOD, "arm1").await;
    call_ok(&counter, &b, FOREIGN_METHOD, "arm1").await.unwrap();
    call_ok(&counter, &b, "/grpc.health.v1.Health/Check", "arm1").await.unwrap();

    release.notify_one();
    first.await.unwrap().unwrap();

    assert!(counter.stats().is_empty());
    assert_eq!(counter.rejected_total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_robot_service_limited_as_a_whole() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);
    let b = peer(2);

    let (first, release) = spawn_blocked(&counter, &a, ROBOT_STATUS, "").await;
    let status = call_ok(&counter, &b, ROBOT_STATUS, "").await.unwrap_err();
    assert!(status
        .message()
        .contains("on resource viam.robot.v1.RobotService"));

    release.notify_one();
    first.await.unwrap().unwrap();

    let stats = counter.stats();
    assert_eq!(stats["RobotService/GetMachineStatus"], 1);
    assert_eq!(stats["viam.robot.v1.RobotService.inFlightRequests"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unnamed_platform_call_counted_but_not_limited() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);

    let (first, release) = spawn_blocked(&counter, &a, VISION_LIST, "").await;
    call_ok(&counter, &a, VISION_LIST, "").await.unwrap();
    release.notify_one();
    first.await.unwrap().unwrap();

    let stats = counter.stats();
    assert_eq!(stats["VisionService/ListModels"], 2);
    assert!(!stats.keys().any(|key| key.ends_with(".inFlightRequests")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejection_reports_callers_own_in_flight() {
    let counter = RequestCounter::with_limit(3, DEFAULT_PEER_IDLE_WINDOW);
    let a = peer(1);
    let b = peer(2);
    let key = limit_key("arm1");

    let (a1, release_a1) = spawn_blocked(&counter, &a, ARM_MOVE, "arm1").await;
    let (a2, release_a2) = spawn_blocked(&counter, &a, ARM_MOVE, "arm1").await;
    let (b1, release_b1) = spawn_blocked(&counter, &b, ARM_MOVE, "arm1").await;

    let before = counter.peer_ledger().in_flight(Some(&a), &key);
    assert_eq!(before, 2);

    let status = call_ok(&counter, &a, ARM_MOVE, "arm1").await.unwrap_err();
    assert!(status.message().contains("your client is responsible for 2"));

    let info = counter.peer_ledger().snapshot(Some(&a));
    assert_eq!(info.inflight_requests.get(&key), Some(&2));
    assert_eq!(info.rejected_requests.get(&key), Some(&1));
    assert_eq!(info.connection_id, "conn-1");

    let status = call_ok(&counter, &b, ARM_MOVE, "arm1").await.unwrap_err();
    assert!(status.message().contains("your client is responsible for 1"));

    for release in [release_a1, release_a2, release_b1] {
        release.notify_one();
    }
    for task in [a1, a2, b1] {
        task.await.unwrap().unwrap();
    }
    assert_eq!(counter.in_flight(&key), 0);
    assert_eq!(counter.peer_ledger().in_flight(Some(&a), &key), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_without_peer_share_one_bucket() {
    let counter = RequestCounter::with_limit(1, DEFAULT_PEER_IDLE_WINDOW);
    let release = Arc::new(Notify::new());
    let (started_tx, started_rx) = oneshot::channel();

    let first = {
        let counter = counter.clone();
        let gate = release.clone();
        tokio::spawn(async move {
            counter
                .unary_interceptor(CallContext::new(), request("arm1"), &UnaryServerInfo::new(ARM_MOVE), move |_ctx, _req| async move {
                    let _ = started_tx.send(());
                    gate.notified().await;
                    Ok::<_, Status>(response("done"))
                })
                .await
        })
    };
    started_rx.await.unwrap();

    let status = counter
        .unary_interceptor(CallContext::new(), request("arm1"), &UnaryServerInfo::new(ARM_MOVE), |_ctx, _req| async {
            Ok::<_, Status>(response("ok"))
        })
        .await
        .unwrap_err();
    assert!(status.message().contains("your client is responsible for 1"));

    let info = counter.peer_ledger().snapshot(None);
    assert_eq!(info.connection_id, "no-peer");

    release.notify_one();
    first.await.unwrap().unwrap();
}
