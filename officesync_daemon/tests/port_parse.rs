//! Flag and environment resolution through the public config API.
use std::time::Duration;

use officesync_daemon::config::{CliAction, Config, DEFAULT_HTTP_PORT, DEFAULT_WS_PORT};

fn run(args: &[&str]) -> Config {
    let argv = std::iter::once("officesync_daemon")
        .chain(args.iter().copied())
        .map(String::from);
    match Config::from_env_with(|_| None).unwrap().apply_args(argv).unwrap() {
        CliAction::Run(cfg) => cfg,
        CliAction::Help => panic!("unexpected help"),
    }
}

#[test]
fn port_long_short_and_assign() {
    assert_eq!(run(&["--port", "9001"]).ws_port, 9001);
    assert_eq!(run(&["-p", "9002"]).ws_port, 9002);
    assert_eq!(run(&["--port=9003"]).ws_port, 9003);
    let cfg = run(&[]);
    assert_eq!((cfg.ws_port, cfg.http_port), (DEFAULT_WS_PORT, DEFAULT_HTTP_PORT));
}

#[test]
fn intervals_are_in_their_units() {
    let cfg = run(&["--collect-interval", "15", "--backup-interval=2", "--retention-days", "3"]);
    assert_eq!(cfg.collect_interval, Duration::from_secs(15));
    assert_eq!(cfg.backup_interval, Duration::from_secs(2 * 3600));
    assert_eq!(cfg.retention(), chrono::Duration::days(3));
}

#[test]
fn env_then_flags() {
    let cfg = Config::from_env_with(|k| match k {
        "OFFICESYNC_WS_PORT" => Some("7000".into()),
        "OFFICESYNC_HTTP_PORT" => Some("7001".into()),
        _ => None,
    })
    .unwrap();
    let argv = ["officesync_daemon", "--http-port", "7002"].map(String::from);
    let CliAction::Run(cfg) = cfg.apply_args(argv).unwrap() else {
        panic!("unexpected help");
    };
    assert_eq!((cfg.ws_port, cfg.http_port), (7000, 7002));
}
