use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine::{
    AcquirePolicy, EngineLauncher, EnginePool, Evaluation, EvaluationRequest, Evaluator,
    ProcessLauncher, SessionError, Snapshot, WorkerInbox, WorkerLauncher, WorkerOutbox,
};
use tokio_stream::StreamExt;

const WHITE_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
const BLACK_FEN: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";

/// Engine stand-in that answers the handshake and replays `search` on `go`.
async fn scripted_engine(
    mut inbox: WorkerInbox,
    outbox: WorkerOutbox,
    search: &'static [&'static str],
) -> Result<(), String> {
    while let Some(line) = inbox.recv().await {
        match line.as_str() {
            "uci" => {
                outbox.post_line("id name Scripted").await;
                outbox.post_line("uciok").await;
            }
            "isready" => {
                outbox.post_line("readyok").await;
            }
            "go depth 0" => return Err("refusing depth 0".to_string()),
            l if l.starts_with("go") => {
                for chunk in search {
                    outbox.post(*chunk).await;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn scripted(search: &'static [&'static str]) -> Arc<dyn EngineLauncher> {
    Arc::new(WorkerLauncher::new(
        move |inbox: WorkerInbox, outbox: WorkerOutbox| scripted_engine(inbox, outbox, search),
    ))
}

fn evaluator(search: &'static [&'static str]) -> Evaluator {
    Evaluator::new(EnginePool::single(scripted(search)))
}

async fn collect(evaluator: &Evaluator, request: EvaluationRequest) -> Vec<Snapshot> {
    evaluator.evaluate(request).collect().await
}

const FULL_SEARCH: &[&str] = &[
    "info depth 1 seldepth 1 multipv 1 score cp 18 nodes 20 nps 20000 time 1 pv e2e4\n",
    "info depth 2 seldepth 2 multipv 1 score cp 29 nodes 300 time 2 pv e2e4 e7e5\n",
    "info depth 2 currmove d2d4 currmovenumber 2\n",
    "info depth 3 seldepth 4 multipv 1 score cp 22 nodes 2000000 time 4000 pv e2e4 e7e5 g1f3 b8c6 f1b5 a7a6 d2d3\n",
    "bestmove e2e4 ponder e7e5\n",
];

#[tokio::test]
async fn test_full_evaluation_stream() {
    let evaluator = evaluator(FULL_SEARCH);
    let snapshots = collect(&evaluator, EvaluationRequest::new(WHITE_FEN)).await;

    assert_eq!(snapshots.len(), 4);
    let depths: Vec<u32> = snapshots
        .iter()
        .filter_map(|s| match s {
            Snapshot::Info(r) => Some(r.depth),
            _ => None,
        })
        .collect();
    assert_eq!(depths, vec![1, 2, 3]);

    match snapshots.last() {
        Some(Snapshot::Done(result)) => {
            assert_eq!(result.best_move, "e2e4");
            assert_eq!(result.evaluation, Some(Evaluation::Pawns(0.22)));
            assert_eq!(result.principal_variation.len(), 6);
            assert_eq!(result.nps, Some(500_000));
            assert_eq!(result.fen(), WHITE_FEN);
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_scores_normalized_for_black_to_move() {
    let evaluator = evaluator(&["info depth 5 score cp 40\n", "bestmove e7e5\n"]);
    let done = evaluator
        .evaluate(EvaluationRequest::new(BLACK_FEN))
        .finish()
        .await;
    match done {
        Some(Snapshot::Done(result)) => {
            assert_eq!(result.evaluation, Some(Evaluation::Pawns(-0.4)))
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_output_split_mid_line() {
    let evaluator = evaluator(&["info dep", "th 5 nodes 10\nbestm", "ove e2e4\n"]);
    let snapshots = collect(&evaluator, EvaluationRequest::new(WHITE_FEN)).await;

    assert_eq!(snapshots.len(), 2);
    assert!(matches!(&snapshots[0], Snapshot::Info(r) if r.depth == 5 && r.nodes == 10));
    assert!(matches!(&snapshots[1], Snapshot::Done(r) if r.best_move == "e2e4" && r.nps.is_none()));
}

#[tokio::test]
async fn test_bestmove_alone_completes() {
    let evaluator = evaluator(&["bestmove e2e4\n"]);
    let snapshots = collect(&evaluator, EvaluationRequest::new(WHITE_FEN)).await;
    match snapshots.as_slice() {
        [Snapshot::Done(result)] => {
            assert_eq!(result.best_move, "e2e4");
            assert_eq!(result.nps, None);
            assert_eq!(result.evaluation, None);
        }
        other => panic!("unexpected snapshots: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_emits_single_error() {
    let evaluator = evaluator(&["info depth 1 score cp 5\n"]);
    let snapshots = collect(
        &evaluator,
        EvaluationRequest::new(WHITE_FEN).with_time_limit_ms(500),
    )
    .await;

    assert_eq!(snapshots.len(), 2);
    assert!(matches!(snapshots[0], Snapshot::Info(_)));
    assert_eq!(
        snapshots[1],
        Snapshot::Error(SessionError::Timeout(Duration::from_millis(500)))
    );
}

#[tokio::test]
async fn test_busy_engine_rejects_second_request() {
    let evaluator = evaluator(&["info depth 1 score cp 5\n"]);
    let mut first = evaluator.evaluate(EvaluationRequest::new(WHITE_FEN));
    assert!(matches!(first.next_snapshot().await, Some(Snapshot::Info(_))));

    let second = collect(&evaluator, EvaluationRequest::new(WHITE_FEN)).await;
    assert_eq!(second, vec![Snapshot::Error(SessionError::Busy)]);

    drop(first);
    tokio::time::timeout(Duration::from_secs(5), async {
        while evaluator.pool().available() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cancelled session should free its engine");
}

#[tokio::test]
async fn test_wait_policy_serializes_requests() {
    let pool = EnginePool::new(scripted(&["bestmove e2e4\n"]), 1, AcquirePolicy::Wait);
    let evaluator = Evaluator::new(pool);

    let first = evaluator.evaluate(EvaluationRequest::new(WHITE_FEN));
    let second = evaluator.evaluate(EvaluationRequest::new(BLACK_FEN));
    let (first, second) = tokio::join!(first.finish(), second.finish());

    assert!(matches!(first, Some(Snapshot::Done(_))));
    assert!(matches!(second, Some(Snapshot::Done(_))));
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_dropped_before_acquiring() {
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    let launcher = WorkerLauncher::new(move |inbox: WorkerInbox, outbox: WorkerOutbox| {
        counter.fetch_add(1, Ordering::SeqCst);
        scripted_engine(inbox, outbox, &["info depth 1 score cp 5\n"])
    });
    let pool = EnginePool::new(Arc::new(launcher), 1, AcquirePolicy::Wait);
    let evaluator = Evaluator::new(pool);

    let mut first = evaluator.evaluate(EvaluationRequest::new(WHITE_FEN));
    assert!(matches!(first.next_snapshot().await, Some(Snapshot::Info(_))));

    let queued = evaluator.evaluate(EvaluationRequest::new(BLACK_FEN));
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(queued);
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(first);
    while evaluator.pool().available() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert_eq!(evaluator.pool().available(), 1);
}

#[tokio::test]
async fn test_engine_reused_after_done() {
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    let launcher = WorkerLauncher::new(move |inbox: WorkerInbox, outbox: WorkerOutbox| {
        counter.fetch_add(1, Ordering::SeqCst);
        scripted_engine(inbox, outbox, &["info depth 1\n", "bestmove e2e4\n"])
    });
    let evaluator = Evaluator::new(EnginePool::single(Arc::new(launcher)));

    for _ in 0..3 {
        let done = evaluator
            .evaluate(EvaluationRequest::new(WHITE_FEN))
            .finish()
            .await;
        assert!(matches!(done, Some(Snapshot::Done(_))));
    }
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_engine_failure_surfaces_runtime_error() {
    let evaluator = evaluator(&["info depth 1\n"]);
    let snapshots = collect(&evaluator, EvaluationRequest::new(WHITE_FEN).with_depth(0)).await;
    match snapshots.as_slice() {
        [Snapshot::Error(SessionError::Runtime(msg))] => assert!(msg.contains("depth 0")),
        other => panic!("unexpected snapshots: {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_exit_before_bestmove() {
    let launcher = WorkerLauncher::new(|mut inbox: WorkerInbox, outbox: WorkerOutbox| async move {
        while let Some(line) = inbox.recv().await {
            if line.starts_with("go") {
                outbox.post_line("info depth 1 score cp 3").await;
                return Ok::<(), String>(());
            }
        }
        Ok(())
    });
    let evaluator = Evaluator::new(EnginePool::single(Arc::new(launcher)));
    let snapshots = collect(&evaluator, EvaluationRequest::new(WHITE_FEN)).await;

    assert_eq!(snapshots.len(), 2);
    match &snapshots[1] {
        Snapshot::Error(SessionError::Runtime(msg)) => assert!(msg.contains("code 0")),
        other => panic!("unexpected snapshot: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_engine_binary() {
    let pool = EnginePool::single(Arc::new(ProcessLauncher::new(
        "/nonexistent/evalstream-engine-binary",
    )));
    let snapshots = collect(&Evaluator::new(pool), EvaluationRequest::new(WHITE_FEN)).await;
    match snapshots.as_slice() {
        [Snapshot::Error(SessionError::EngineStart(_))] => {}
        other => panic!("unexpected snapshots: {:?}", other),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_engine_session() {
    let script = r#"while read line; do
        case "$line" in
            uci) echo "id name sh"; echo "uciok" ;;
            isready) echo "readyok" ;;
            go*) echo "info depth 1 score cp 30 nodes 10 time 5 pv e2e4"
                 echo "info depth 2 score mate 2 nodes 2000 time 4 pv e2e4 e7e5"
                 echo "bestmove e2e4" ;;
        esac
    done"#;
    let launcher =
        ProcessLauncher::new("sh").with_args(vec!["-c".to_string(), script.to_string()]);
    let evaluator = Evaluator::new(EnginePool::single(Arc::new(launcher)));

    let snapshots = collect(&evaluator, EvaluationRequest::new(WHITE_FEN)).await;
    assert_eq!(snapshots.len(), 3);
    match &snapshots[2] {
        Snapshot::Done(result) => {
            assert_eq!(result.best_move, "e2e4");
            assert_eq!(result.evaluation.map(|e| e.to_string()), Some("M2".to_string()));
            assert_eq!(result.nps, Some(500_000));
        }
        other => panic!("expected done, got {:?}", other),
    }
}
