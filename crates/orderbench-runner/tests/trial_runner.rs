mod common;

use std::collections::HashSet;
use std::fs;

use orderbench_runner::allocator::Allocation;
use orderbench_runner::mock::{MockReply, MockTransport};
use orderbench_runner::node::NodeController;
use orderbench_runner::trial::{RunOutput, TrialRunner};
use orderbench_runner::{CommandList, CompletionStatus, ExperimentConfig, Interrupt, OrderType};

fn run_on(
    config: &ExperimentConfig,
    transport: &MockTransport,
    commands: &[&str],
    interrupt: &Interrupt,
) -> orderbench_runner::error::Result<RunOutput> {
    let root = common::temp_root("trial");
    let alloc = Allocation::new(config.workers.clone(), config.ssh.credentials());
    let node = NodeController::new("n0", &alloc, config, transport, &root, interrupt);
    let list = CommandList::new(commands.iter().map(|c| c.to_string()).collect());
    let out = TrialRunner::new(&node).run(&list, config.trials.n_runs, &config.working_directory());
    let _ = fs::remove_dir_all(root);
    out
}

#[test]
fn echo_scenario_yields_one_fixed_and_one_random_trial() {
    let root = common::temp_root("echo");
    let config = common::config(&["n0"], &root);
    let transport = MockTransport::new();
    let out = run_on(&config, &transport, &["echo A", "echo B"], &Interrupt::new()).expect("run");

    assert_eq!(out.trials.len(), 2);
    assert_eq!(out.executions.len(), 4);
    assert_eq!(out.stopped_early, None);
    assert_eq!(out.trials[0].order_type, OrderType::Fixed);
    assert_eq!(out.trials[0].seed, None);
    assert_eq!(out.trials[1].order_type, OrderType::Random);
    assert!(out.trials[1].seed.is_some());
    assert!(out
        .executions
        .iter()
        .all(|e| e.completion_status == CompletionStatus::Success));

    for trial in &out.trials {
        let rows: Vec<_> = out
            .executions
            .iter()
            .filter(|e| e.trial_id == trial.trial_id)
            .collect();
        assert_eq!(rows.len(), 2);
        let mut commands: Vec<&str> = rows.iter().map(|e| e.command.as_str()).collect();
        commands.sort_unstable();
        assert_eq!(commands, vec!["echo A", "echo B"]);
        for (position, row) in rows.iter().enumerate() {
            assert_eq!(row.position, position);
            assert_eq!(row.trial_index, trial.index);
            assert_eq!(row.total_trials, 2);
        }
    }
    let fixed: Vec<usize> = out.executions[..2].iter().map(|e| e.command_index).collect();
    assert_eq!(fixed, vec![0, 1]);

    assert_eq!(
        transport.executed("n0"),
        vec![
            "cd bench && echo A".to_string(),
            "cd bench && echo B".to_string(),
            format!("cd bench && {}", out.executions[2].command),
            format!("cd bench && {}", out.executions[3].command),
        ]
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn failing_command_is_recorded_and_the_trial_continues() {
    let root = common::temp_root("fail");
    let mut config = common::config(&["n0"], &root);
    config.trials.n_runs = 2;
    let transport = MockTransport::new().with_responder(|_, cmd| {
        if cmd.ends_with("./broken") {
            MockReply::exit(1, "segfault")
        } else {
            MockReply::ok("ok")
        }
    });
    let commands = ["./one", "./broken", "./three"];
    let out = run_on(&config, &transport, &commands, &Interrupt::new()).expect("run");

    assert_eq!(out.trials.len(), 4);
    for trial in &out.trials {
        let rows: Vec<_> = out
            .executions
            .iter()
            .filter(|e| e.trial_id == trial.trial_id)
            .collect();
        assert_eq!(rows.len(), commands.len());
        for row in rows {
            let expected = if row.command == "./broken" {
                CompletionStatus::Failure
            } else {
                CompletionStatus::Success
            };
            assert_eq!(row.completion_status, expected, "{}", row.command);
        }
    }
    let _ = fs::remove_dir_all(root);
}

#[test]
fn transport_errors_during_a_command_become_failures() {
    let root = common::temp_root("transport");
    let mut config = common::config(&["n0"], &root);
    config.retry.remote_attempts = 2;
    let transport = MockTransport::new().with_responder(|_, cmd| {
        if cmd.ends_with("flaky") {
            MockReply::transport_error()
        } else {
            MockReply::ok("")
        }
    });
    let out = run_on(&config, &transport, &["flaky", "steady"], &Interrupt::new()).expect("run");
    assert_eq!(out.executions.len(), 4);
    let flaky: Vec<_> = out.executions.iter().filter(|e| e.command == "flaky").collect();
    assert!(flaky
        .iter()
        .all(|e| e.completion_status == CompletionStatus::Failure));
    let attempts = transport
        .executed("n0")
        .iter()
        .filter(|c| c.ends_with("flaky"))
        .count();
    assert_eq!(attempts, 4);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn reset_failure_truncates_the_run() {
    let root = common::temp_root("reset");
    let mut config = common::config(&["n0"], &root);
    config.trials.n_runs = 3;
    config.reset.enabled = true;
    let transport = MockTransport::new().probe_script("n0", vec![true, false]);
    let out = run_on(&config, &transport, &["echo A", "echo B"], &Interrupt::new())
        .expect("reset failure is not raised");

    assert_eq!(out.trials.len(), 2);
    assert_eq!(out.executions.len(), 4);
    assert!(out
        .stopped_early
        .as_deref()
        .is_some_and(|r| r.contains("did not come back")));
    assert_eq!(
        transport
            .executed("n0")
            .iter()
            .filter(|c| c.as_str() == "sudo reboot")
            .count(),
        2
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn block_ordering_runs_all_fixed_trials_first() {
    let root = common::temp_root("block");
    let mut config = common::config(&["n0"], &root);
    config.trials.n_runs = 2;
    config.trials.interleave = false;
    let out = run_on(&config, &MockTransport::new(), &["a", "b"], &Interrupt::new()).expect("run");
    let kinds: Vec<OrderType> = out.trials.iter().map(|t| t.order_type).collect();
    assert_eq!(
        kinds,
        vec![
            OrderType::Fixed,
            OrderType::Fixed,
            OrderType::Random,
            OrderType::Random
        ]
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn same_seed_gives_same_random_orders() {
    let root = common::temp_root("seed");
    let mut config = common::config(&["n0"], &root);
    config.trials.n_runs = 3;
    let commands = ["c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7"];
    let random_orders = |out: &RunOutput| -> Vec<Vec<usize>> {
        out.trials
            .iter()
            .filter(|t| t.order_type == OrderType::Random)
            .map(|t| {
                out.executions
                    .iter()
                    .filter(|e| e.trial_id == t.trial_id)
                    .map(|e| e.command_index)
                    .collect()
            })
            .collect()
    };
    let a = run_on(&config, &MockTransport::new(), &commands, &Interrupt::new()).expect("a");
    let b = run_on(&config, &MockTransport::new(), &commands, &Interrupt::new()).expect("b");
    assert_eq!(a.seed, 7);
    assert_eq!(random_orders(&a), random_orders(&b));
    assert_eq!(
        a.trials.iter().map(|t| t.seed).collect::<Vec<_>>(),
        b.trials.iter().map(|t| t.seed).collect::<Vec<_>>()
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn trial_ids_are_unique() {
    let root = common::temp_root("ids");
    let mut config = common::config(&["n0"], &root);
    config.trials.n_runs = 5;
    let out = run_on(&config, &MockTransport::new(), &["x"], &Interrupt::new()).expect("run");
    let ids: HashSet<_> = out.trials.iter().map(|t| t.trial_id).collect();
    assert_eq!(ids.len(), 10);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn instrumentation_environment_is_sourced_before_each_command() {
    let root = common::temp_root("instr");
    let mut config = common::config(&["n0"], &root);
    config.instrumentation = vec!["pin_to_core".into()];
    let transport = MockTransport::new();
    run_on(&config, &transport, &["./bench"], &Interrupt::new()).expect("run");
    assert!(transport
        .executed("n0")
        .iter()
        .all(|c| c == ". ~/instr_env.txt && cd bench && ./bench"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn interrupt_aborts_the_run() {
    let root = common::temp_root("interrupt");
    let config = common::config(&["n0"], &root);
    let interrupt = Interrupt::new();
    interrupt.trigger();
    let err = run_on(&config, &MockTransport::new(), &["x"], &interrupt).expect_err("interrupted");
    assert!(err.is_interrupt());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn overflowing_loop_count_is_rejected_before_any_connection() {
    let root = common::temp_root("overflow");
    let mut config = common::config(&["n0"], &root);
    config.trials.n_runs = u32::MAX;
    let transport = MockTransport::new();
    let err = run_on(&config, &transport, &["echo A"], &Interrupt::new()).expect_err("overflow");
    assert!(
        matches!(err, orderbench_runner::OrchestratorError::Config(_)),
        "{}",
        err
    );
    assert!(transport.events().is_empty());
    let _ = fs::remove_dir_all(root);
}
