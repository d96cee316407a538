//! Unit tests for CLI commands

use crate::cli::{demo_routes, load_config, Cli, Commands};
use crate::config::CacheConfig;
use crate::context::Context;
use crate::result::Outcome;
use crate::router::Router;
use clap::Parser;
use http::Method;
use smallvec::SmallVec;
use std::io::Write;

#[test]
fn test_serve_command_with_flags() {
    let cli = Cli::try_parse_from([
        "sagewire",
        "serve",
        "--config",
        "engine.yaml",
        "--addr",
        "127.0.0.1:8080",
        "--static",
        "public",
    ])
    .unwrap();

    match cli.command {
        Commands::Serve {
            config,
            addr,
            static_dir,
        } => {
            assert_eq!(config.unwrap().to_string_lossy(), "engine.yaml");
            assert_eq!(addr.as_deref(), Some("127.0.0.1:8080"));
            assert_eq!(static_dir.unwrap().to_string_lossy(), "public");
        }
        _ => panic!("Expected Serve command"),
    }
}

#[test]
fn test_serve_command_defaults() {
    let cli = Cli::try_parse_from(["sagewire", "serve"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Serve {
            config: None,
            addr: None,
            static_dir: None
        }
    ));
}

#[test]
fn test_check_requires_config() {
    assert!(Cli::try_parse_from(["sagewire", "check"]).is_err());
}

#[test]
fn test_load_config_applies_addr() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "hostname: demo.local\nhttp_port: 7000").unwrap();

    let config = load_config(Some(file.path()), Some("127.0.0.1:8181")).unwrap();
    assert_eq!(config.hostname, "demo.local");
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.http_port, Some(8181));

    let v6 = load_config(None, Some("[::1]:0")).unwrap();
    assert_eq!(v6.bind_address, "::1");
    assert_eq!(v6.http_port, Some(0));
}

#[test]
fn test_load_config_rejects_bad_addr() {
    assert!(load_config(None, Some("no-port")).is_err());
    assert!(load_config(None, Some("host:http")).is_err());
}

#[test]
fn test_demo_routes_answer() {
    let routes = demo_routes(None, CacheConfig::default());
    let route = routes.route_for(&Method::GET, "/hello").unwrap();
    let mut ctx = Context::new(Method::GET, "/hello?name=ada", SmallVec::new());
    match route.invoke(&mut ctx).unwrap() {
        Outcome::Ready(mut result) => {
            let body = result.body.as_mut().unwrap().to_bytes().unwrap();
            assert_eq!(body, b"hello, ada");
        }
        Outcome::Async(_) => panic!("expected a ready result"),
    }

    assert!(routes.route_for(&Method::GET, "/assets/app.js").is_none());
    let slow = routes.route_for(&Method::GET, "/slow").unwrap();
    let mut ctx = Context::new(Method::GET, "/slow?ms=1", SmallVec::new());
    assert!(matches!(slow.invoke(&mut ctx).unwrap(), Outcome::Async(_)));
}

#[test]
fn test_demo_routes_mount_static_dir() {
    let dir = tempfile::tempdir().unwrap();
    let routes = demo_routes(Some(dir.path().to_path_buf()), CacheConfig::default());
    assert!(routes.route_for(&Method::GET, "/assets/app.js").is_some());
}
