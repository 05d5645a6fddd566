//! Public API tests
//!
//! The end-to-end test needs `initdb` and `pg_ctl` on PATH and free ports
//! 34555/34556; run it with `cargo test -- --ignored`.

use clap::Parser;
use pg_relocate::node::CommandOutput;
use pg_relocate::{
    AppConfig, Cli, Command, Dispatcher, NodeAction, NodeStatus, Report, StatusClassifier,
    TransferOutcome,
};

fn output(success: bool, code: Option<i32>, text: &str) -> CommandOutput {
    CommandOutput {
        success,
        code,
        text: text.to_string(),
    }
}

#[test]
fn test_status_classification() {
    let classifier = StatusClassifier::new(vec![
        "no server running".to_string(),
        "сервер не работает".to_string(),
    ]);

    assert_eq!(
        classifier.classify(&output(true, Some(0), "pg_ctl: server is running (PID: 1)")),
        Some(NodeStatus::Running)
    );
    assert_eq!(
        classifier.classify(&output(false, Some(3), "")),
        Some(NodeStatus::Stopped)
    );
    assert_eq!(
        classifier.classify(&output(false, Some(1), "pg_ctl: сервер не работает")),
        Some(NodeStatus::Stopped)
    );
    assert_eq!(
        classifier.classify(&output(false, Some(4), "pg_ctl: could not access directory")),
        None
    );
}

#[test]
fn test_shipped_config_loads() {
    let config = AppConfig::from_file("config/dev.yaml").unwrap();
    assert_eq!(config.nodes.a.name, "A");
    assert_eq!(config.nodes.b.name, "B");
    assert_ne!(config.nodes.a.port, config.nodes.b.port);
    assert_eq!(config.transfer.seed_rows, 9);
    assert!(config.transfer.purge_source);
}

#[test]
fn test_command_line_parsing() {
    let parse = |list: &[&str]| {
        Cli::try_parse_from(std::iter::once("pg_relocate").chain(list.iter().copied()))
    };
    assert_eq!(
        parse(&["create"]).unwrap().command,
        Command::Node(NodeAction::Create)
    );
    let cli = parse(&["--json", "transfer"]).unwrap();
    assert!(cli.json);
    assert_eq!(
        cli.command,
        Command::Transfer {
            simulate_crash: false
        }
    );
    assert!(parse(&["transfer", "--force"]).is_err());
}

fn live_config(root: &std::path::Path) -> AppConfig {
    let yaml = format!(
        r#"
log_dir: "{root}/logs"
nodes:
  a:
    name: "A"
    data_dir: "{root}/server_a"
    port: 34555
  b:
    name: "B"
    data_dir: "{root}/server_b"
    port: 34556
"#,
        root = root.display()
    );
    AppConfig::from_yaml(&yaml).unwrap()
}

fn expect_nodes_ok(report: &Report) {
    assert!(report.all_ok(), "node command failed:\n{}", report);
}

#[tokio::test]
#[ignore = "requires initdb and pg_ctl"]
async fn test_end_to_end_relocation() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::from_config(live_config(dir.path())).unwrap();

    let create = dispatcher.dispatch(Command::Node(NodeAction::Create)).await.unwrap();
    expect_nodes_ok(&create);
    let start = dispatcher.dispatch(Command::Node(NodeAction::Start)).await.unwrap();
    expect_nodes_ok(&start);

    // Crash hook first: nothing may move
    let crashed = dispatcher
        .dispatch(Command::Transfer {
            simulate_crash: true,
        })
        .await
        .unwrap();
    match crashed {
        Report::Transfer(r) => {
            assert_eq!(r.transfer.outcome, TransferOutcome::CrashSimulated);
            assert_eq!(r.transfer.moved_ids.len(), 9);
        }
        other => panic!("unexpected report: {other:?}"),
    }

    let committed = dispatcher
        .dispatch(Command::Transfer {
            simulate_crash: false,
        })
        .await
        .unwrap();
    match committed {
        Report::Transfer(r) => {
            assert_eq!(r.transfer.outcome, TransferOutcome::Committed);
            assert_eq!(r.transfer.moved_ids, (1..=9).collect::<Vec<_>>());
            assert!(r.transfer.source_purged);
        }
        other => panic!("unexpected report: {other:?}"),
    }

    match dispatcher.dispatch(Command::InDoubt).await.unwrap() {
        Report::InDoubt { operations } => assert!(operations.is_empty()),
        other => panic!("unexpected report: {other:?}"),
    }

    let stop = dispatcher.dispatch(Command::Node(NodeAction::Stop)).await.unwrap();
    expect_nodes_ok(&stop);
    let destroy = dispatcher.dispatch(Command::Node(NodeAction::Destroy)).await.unwrap();
    expect_nodes_ok(&destroy);
}
