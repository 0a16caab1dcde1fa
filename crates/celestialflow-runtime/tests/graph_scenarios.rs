//! End-to-end graph scenarios: chains, fan-out through a splitter,
//! routing, deduplication, multi-root fan-in, layered layout, and an
//! externally aborted loop.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use celestialflow_runtime::func::{AsyncFnStage, FnStage};
use celestialflow_runtime::stage::{StageConfig, TaskStage};
use celestialflow_runtime::structures::{task_chain, task_loop};
use celestialflow_runtime::{router, splitter, LayoutMode, TaskGraph};
use celestialflow_shared::{ExecutionMode, StageMode, TaskValue, UserFuncError};

fn init_for(tag: &str, tasks: Vec<TaskValue>) -> HashMap<String, Vec<TaskValue>> {
    let mut init = HashMap::new();
    init.insert(tag.to_string(), tasks);
    init
}

/// Point the run's fallback files at a scratch directory. The guard must
/// outlive the run.
fn scratch_fallback(graph: &mut TaskGraph) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    graph.set_fallback(celestialflow_shared::config::FallbackConfig {
        dir: dir.path().to_string_lossy().into_owned(),
        persist_leftover_tasks: false,
    });
    dir
}

fn stage_with(
    func: celestialflow_runtime::SharedStageFunc,
    execution_mode: ExecutionMode,
    worker_limit: usize,
) -> TaskStage {
    TaskStage::new(
        func,
        StageConfig {
            execution_mode,
            worker_limit,
            ..StageConfig::default()
        },
    )
    .unwrap()
}

fn identity_stage() -> TaskStage {
    stage_with(
        FnStage::new("identity", |args: Vec<TaskValue>| Ok(args[0].clone())),
        ExecutionMode::Serial,
        1,
    )
}

fn fib(n: i64) -> i64 {
    let (mut a, mut b) = (0i64, 1i64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

#[tokio::test(flavor = "multi_thread")]
async fn linear_chain_accounts_every_stage() {
    let fib_stage = stage_with(
        FnStage::new("fib", |args: Vec<TaskValue>| {
            let n = args[0].as_i64().expect("integer input");
            Ok(json!(fib(n)))
        }),
        ExecutionMode::Thread,
        3,
    );
    let square_stage = stage_with(
        FnStage::new("square", |args: Vec<TaskValue>| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n.saturating_mul(n)))
        }),
        ExecutionMode::Thread,
        3,
    );
    let sleep_stage = stage_with(
        AsyncFnStage::new("sleep_1", |args: Vec<TaskValue>| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(args.into_iter().next().unwrap_or(TaskValue::Null))
        }),
        ExecutionMode::Async,
        4,
    );
    let divide_stage = stage_with(
        FnStage::new("divide_by_two", |args: Vec<TaskValue>| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n / 2))
        }),
        ExecutionMode::Serial,
        1,
    );

    let stages = vec![
        fib_stage.clone(),
        square_stage.clone(),
        sleep_stage.clone(),
        divide_stage.clone(),
    ];
    let mut graph = task_chain(stages, StageMode::Process).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let inputs: Vec<TaskValue> = (25..=36).map(|n| json!(n)).collect();
    let report = graph
        .start_graph(init_for("Stage 1", inputs), true)
        .await
        .unwrap();

    assert!(report.by_error.is_empty(), "no failures expected");
    for stage in [&fib_stage, &square_stage, &sleep_stage, &divide_stage] {
        let counts = stage.metrics().counts();
        assert_eq!(counts.tasks_input, 12);
        assert_eq!(counts.tasks_successed, 12);
        assert_eq!(counts.tasks_pending, 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn splitter_fans_out_while_sibling_failure_is_isolated() {
    // gen → {log, splitter → {download, parse}}; log raises on gen(1)'s
    // output, the splitter still forwards both children to both branches.
    let gen_stage = stage_with(
        FnStage::new("generate_urls", |args: Vec<TaskValue>| {
            let x = args[0].as_i64().unwrap_or(0);
            Ok(json!([format!("url_{x}_0"), format!("url_{x}_1")]))
        }),
        ExecutionMode::Serial,
        1,
    );
    let log_stage = stage_with(
        FnStage::new("log_urls", |args: Vec<TaskValue>| {
            if args[0] == json!(["url_1_0", "url_1_1"]) {
                return Err(UserFuncError::new(
                    "ValueError",
                    "Test error in ('url_1_0', 'url_1_1')",
                ));
            }
            Ok(json!(format!("Logged({})", args[0])))
        }),
        ExecutionMode::Serial,
        1,
    );
    let split_stage = splitter().unwrap();
    let download_stage = stage_with(
        FnStage::new("download", |args: Vec<TaskValue>| {
            Ok(json!(format!("Downloaded({})", args[0])))
        }),
        ExecutionMode::Thread,
        2,
    );
    let parse_stage = stage_with(
        FnStage::new("parse", |args: Vec<TaskValue>| Ok(args[0].clone())),
        ExecutionMode::Thread,
        2,
    );

    let mut graph = TaskGraph::new();
    let gen = graph.add_stage(gen_stage.clone());
    let log = graph.add_stage(log_stage.clone());
    let split = graph.add_stage(split_stage.clone());
    let download = graph.add_stage(download_stage.clone());
    let parse = graph.add_stage(parse_stage.clone());

    graph.set_graph_context(gen, &[log, split], StageMode::Process, "GenURLs");
    graph.set_graph_context(log, &[], StageMode::Process, "Loger");
    graph.set_graph_context(split, &[download, parse], StageMode::Process, "Splitter");
    graph.set_graph_context(download, &[], StageMode::Process, "Downloader");
    graph.set_graph_context(parse, &[], StageMode::Process, "Parser");
    graph.set_roots(&[gen]).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let report = graph
        .start_graph(init_for("GenURLs", vec![json!(1)]), true)
        .await
        .unwrap();

    // Exactly one failure, keyed by error and stage.
    assert_eq!(report.by_error.len(), 1);
    let ((error, stage_tag), tasks) = report.by_error.iter().next().unwrap();
    assert!(error.starts_with("ValueError("));
    assert_eq!(stage_tag, "Loger");
    assert_eq!(tasks.len(), 1);
    assert_eq!(report.by_stage["Loger"].len(), 1);

    // The splitter forwarded its two children to both branches.
    assert_eq!(split_stage.split_count(), Some(2));
    for stage in [&download_stage, &parse_stage] {
        let counts = stage.metrics().counts();
        assert_eq!(counts.tasks_input, 2);
        assert_eq!(counts.tasks_successed, 2);
        assert_eq!(counts.tasks_pending, 0);
    }

    let log_counts = log_stage.metrics().counts();
    assert_eq!(log_counts.tasks_input, 1);
    assert_eq!(log_counts.tasks_failed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn router_delivers_to_selected_targets_only() {
    // decide → router → {down, up}: x < 10 goes down, the rest go up.
    let decide_stage = stage_with(
        FnStage::new("decide", |args: Vec<TaskValue>| {
            let x = args[0].as_i64().unwrap_or(0);
            let target = if x < 10 { "down" } else { "up" };
            Ok(json!([target, x]))
        }),
        ExecutionMode::Serial,
        1,
    );
    let route_stage = router().unwrap();
    let down_stage = identity_stage();
    let up_stage = identity_stage();

    let mut graph = TaskGraph::new();
    let decide = graph.add_stage(decide_stage.clone());
    let route = graph.add_stage(route_stage.clone());
    let down = graph.add_stage(down_stage.clone());
    let up = graph.add_stage(up_stage.clone());

    graph.set_graph_context(decide, &[route], StageMode::Process, "Decide");
    graph.set_graph_context(route, &[down, up], StageMode::Process, "Router");
    graph.set_graph_context(down, &[], StageMode::Process, "down");
    graph.set_graph_context(up, &[], StageMode::Process, "up");
    graph.set_roots(&[decide]).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let inputs: Vec<TaskValue> = (1..=20).map(|n| json!(n)).collect();
    let report = graph
        .start_graph(init_for("Decide", inputs), true)
        .await
        .unwrap();

    assert!(report.by_error.is_empty());
    let route_counts = route_stage.route_counts().unwrap();
    assert_eq!(route_counts["down"], 9);
    assert_eq!(route_counts["up"], 11);

    assert_eq!(down_stage.metrics().counts().tasks_input, 9);
    assert_eq!(down_stage.metrics().counts().tasks_successed, 9);
    assert_eq!(up_stage.metrics().counts().tasks_input, 11);
    assert_eq!(up_stage.metrics().counts().tasks_successed, 11);
}

#[tokio::test(flavor = "multi_thread")]
async fn router_reports_unknown_targets_as_configuration_failures() {
    let decide_stage = stage_with(
        FnStage::new("decide", |_args: Vec<TaskValue>| Ok(json!(["sideways", 1]))),
        ExecutionMode::Serial,
        1,
    );
    let route_stage = router().unwrap();
    let down_stage = identity_stage();

    let mut graph = TaskGraph::new();
    let decide = graph.add_stage(decide_stage);
    let route = graph.add_stage(route_stage);
    let down = graph.add_stage(down_stage);
    graph.set_graph_context(decide, &[route], StageMode::Process, "Decide");
    graph.set_graph_context(route, &[down], StageMode::Process, "Router");
    graph.set_graph_context(down, &[], StageMode::Process, "down");
    graph.set_roots(&[decide]).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let report = graph
        .start_graph(init_for("Decide", vec![json!(1)]), true)
        .await
        .unwrap();

    assert_eq!(report.by_error.len(), 1);
    let ((error, stage_tag), _) = report.by_error.iter().next().unwrap();
    assert!(error.starts_with("ConfigurationError("), "got: {error}");
    assert_eq!(stage_tag, "Router");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_inputs_run_once() {
    let stage = stage_with(
        FnStage::new("echo", |args: Vec<TaskValue>| Ok(args[0].clone())),
        ExecutionMode::Serial,
        1,
    );
    let mut graph = task_chain(vec![stage.clone()], StageMode::Process).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let report = graph
        .start_graph(
            init_for("Stage 1", vec![json!(5), json!(5), json!(5)]),
            true,
        )
        .await
        .unwrap();

    assert!(report.by_error.is_empty());
    let counts = stage.metrics().counts();
    assert_eq!(counts.tasks_input, 3);
    assert_eq!(counts.tasks_successed, 1);
    assert_eq!(counts.tasks_duplicated, 2);
    assert_eq!(counts.tasks_pending, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_root_fan_in_waits_for_both_upstreams() {
    // A → C ← B, with inputs injected at both roots.
    let a_stage = identity_stage();
    let b_stage = identity_stage();
    let c_stage = stage_with(
        FnStage::new("merge", |args: Vec<TaskValue>| Ok(args[0].clone())),
        ExecutionMode::Thread,
        2,
    );

    let mut graph = TaskGraph::new();
    let a = graph.add_stage(a_stage.clone());
    let b = graph.add_stage(b_stage.clone());
    let c = graph.add_stage(c_stage.clone());
    graph.set_graph_context(a, &[c], StageMode::Process, "A");
    graph.set_graph_context(b, &[c], StageMode::Process, "B");
    graph.set_graph_context(c, &[], StageMode::Process, "C");
    graph.set_roots(&[a, b]).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let mut init = HashMap::new();
    init.insert(
        "A".to_string(),
        (1..=10).map(|n| json!(n)).collect::<Vec<_>>(),
    );
    init.insert(
        "B".to_string(),
        (11..=20).map(|n| json!(n)).collect::<Vec<_>>(),
    );
    let report = graph.start_graph(init, true).await.unwrap();

    assert!(report.by_error.is_empty());
    let counts = c_stage.metrics().counts();
    assert_eq!(counts.tasks_input, 20, "C sees both upstream contributions");
    assert_eq!(counts.tasks_successed, 20);
    assert_eq!(counts.tasks_pending, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn serial_layout_gates_layers_and_still_completes() {
    let first = identity_stage();
    let second = identity_stage();
    let third = identity_stage();

    let mut graph = TaskGraph::with_layout(LayoutMode::Serial);
    let a = graph.add_stage(first.clone());
    let b = graph.add_stage(second.clone());
    let c = graph.add_stage(third.clone());
    graph.set_graph_context(a, &[b], StageMode::Process, "A");
    graph.set_graph_context(b, &[c], StageMode::Process, "B");
    graph.set_graph_context(c, &[], StageMode::Process, "C");
    graph.set_roots(&[a]).unwrap();
    assert_eq!(graph.layout_mode(), LayoutMode::Serial);
    let _fallback = scratch_fallback(&mut graph);

    let inputs: Vec<TaskValue> = (1..=5).map(|n| json!(n)).collect();
    let report = graph.start_graph(init_for("A", inputs), true).await.unwrap();

    assert!(report.by_error.is_empty());
    for stage in [&first, &second, &third] {
        assert_eq!(stage.metrics().counts().tasks_successed, 5);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_runs_until_externally_aborted() {
    // Three add_sleep stages in a ring; values grow by one per hop until
    // the guard trips, then the envelope drops out of the loop.
    fn add_sleep_stage() -> TaskStage {
        stage_with(
            AsyncFnStage::new("add_sleep", |args: Vec<TaskValue>| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let n = args[0].as_i64().unwrap_or(0);
                if n > 30 {
                    return Err(UserFuncError::new(
                        "ValueError",
                        "Test error for greater than 30",
                    ));
                }
                Ok(json!(n + 1))
            }),
            ExecutionMode::Serial,
            1,
        )
    }

    let a = add_sleep_stage();
    let b = add_sleep_stage();
    let c = add_sleep_stage();
    let mut graph = task_loop(vec![a.clone(), b.clone(), c.clone()]).unwrap();
    graph.set_shutdown_grace(Duration::from_millis(200));
    let _fallback = scratch_fallback(&mut graph);
    assert!(!graph.is_dag());

    let shutdown = graph.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.shutdown();
    });

    let report = graph
        .start_graph(init_for("Stage 1", vec![json!(1)]), false)
        .await
        .unwrap();

    // Values 1..=30 succeeded somewhere in the ring, 31 errored out and
    // did not re-enter.
    let total_success: u64 = [&a, &b, &c]
        .iter()
        .map(|s| s.metrics().counts().tasks_successed)
        .sum();
    let total_failed: u64 = [&a, &b, &c]
        .iter()
        .map(|s| s.metrics().counts().tasks_failed)
        .sum();
    assert_eq!(total_success, 30);
    assert_eq!(total_failed, 1);
    assert_eq!(report.by_error.len(), 1);
    let ((error, _), _) = report.by_error.iter().next().unwrap();
    assert!(error.starts_with("ValueError("));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_methods_benchmarks_every_mode_combination() {
    let stage = identity_stage();
    let mut graph = task_chain(vec![stage.clone()], StageMode::Process).unwrap();
    let _fallback = scratch_fallback(&mut graph);

    let bench = graph
        .test_methods(
            init_for("Stage 1", vec![json!(1), json!(2)]),
            &[StageMode::Serial, StageMode::Process],
            &[ExecutionMode::Serial, ExecutionMode::Thread],
        )
        .await
        .unwrap();

    assert_eq!(bench.time_table.len(), 2);
    assert_eq!(bench.time_table[0].len(), 2);
    assert!(bench.by_error.is_empty());

    // The last run's counters stand alone: reruns reset state.
    let counts = stage.metrics().counts();
    assert_eq!(counts.tasks_successed, 2);
    assert_eq!(counts.tasks_input, 2);
}
