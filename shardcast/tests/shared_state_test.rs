// Integration tests for shardcast::shared::SharedStateProxy

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use shardcast::shared::{arg, reply};
use shardcast::{
    BoxedUnit, Dispatcher, DispatcherConfig, ProxyConfig, ProxyMode, SharedError, SharedHandle,
    SharedObject, SharedStateProxy, UnitContext, UnitResult, WorkUnit,
};

/// A small knowledge base: url -> findings.
#[derive(Clone, Default)]
struct KnowledgeBase {
    entries: BTreeMap<String, Vec<String>>,
}

impl KnowledgeBase {
    fn seeded() -> Self {
        let mut kb = KnowledgeBase::default();
        kb.entries.insert("/admin".to_string(), vec!["directory listing".to_string()]);
        kb
    }
}

impl SharedObject for KnowledgeBase {
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, SharedError> {
        match method {
            "append" => {
                let url: String = arg(args, 0)?;
                let finding: String = arg(args, 1)?;
                self.entries.entry(url).or_default().push(finding);
                Ok(Value::Null)
            }
            "get" => {
                let url: String = arg(args, 0)?;
                reply(self.entries.get(&url).cloned().unwrap_or_default())
            }
            "len" => reply(self.entries.values().map(Vec::len).sum::<usize>()),
            "slow" => {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Value::Null)
            }
            other => Err(SharedError::UnknownMethod(other.to_string())),
        }
    }
}

const EXPOSED: [&str; 4] = ["append", "get", "len", "slow"];

#[test]
fn test_severed_remote_falls_back_with_same_value() {
    let proxy = SharedStateProxy::new("kb", KnowledgeBase::seeded(), EXPOSED);
    assert_eq!(proxy.mode(), ProxyMode::Remote);

    let remote = proxy.call("get", vec![json!("/admin")]).unwrap();
    assert_eq!(remote, json!(["directory listing"]));

    proxy.shutdown_remote();
    assert!(!proxy.is_active());

    let local = proxy.call("get", vec![json!("/admin")]).unwrap();
    assert_eq!(local, remote);
    assert_eq!(proxy.mode(), ProxyMode::LocalFallback);
}

#[test]
fn test_fallback_writes_stay_local() {
    let proxy = SharedStateProxy::new("kb", KnowledgeBase::default(), EXPOSED);
    proxy.call("append", vec![json!("/a"), json!("remote")]).unwrap();

    proxy.shutdown_remote();
    proxy.call("append", vec![json!("/b"), json!("local")]).unwrap();
    assert_eq!(proxy.call("len", vec![]).unwrap(), json!(1));

    // back on a fresh server; neither write survived
    assert_eq!(proxy.ensure_active(), ProxyMode::Remote);
    assert!(proxy.is_active());
    assert_eq!(proxy.call("len", vec![]).unwrap(), json!(0));
}

#[test]
fn test_ensure_active_is_noop_when_healthy() {
    let proxy = SharedStateProxy::new("kb", KnowledgeBase::default(), EXPOSED);
    proxy.call("append", vec![json!("/a"), json!("x")]).unwrap();
    assert_eq!(proxy.ensure_active(), ProxyMode::Remote);
    assert_eq!(proxy.call("len", vec![]).unwrap(), json!(1));
}

#[test]
fn test_call_timeout_counts_as_transport_failure() {
    let config = ProxyConfig::default().with_call_timeout(Duration::from_millis(20));
    let proxy = SharedStateProxy::from_factory_with_config("kb", KnowledgeBase::seeded, EXPOSED, config);

    assert_eq!(proxy.call("slow", vec![]).unwrap(), Value::Null);
    assert_eq!(proxy.mode(), ProxyMode::LocalFallback);
}

#[test]
fn test_ensure_active_keeps_live_server_after_timeout() {
    let config = ProxyConfig::default().with_call_timeout(Duration::from_millis(100));
    let proxy = SharedStateProxy::from_factory_with_config("kb", KnowledgeBase::default, EXPOSED, config);
    proxy.call("append", vec![json!("/a"), json!("remote")]).unwrap();

    proxy.call("slow", vec![]).unwrap();
    assert_eq!(proxy.mode(), ProxyMode::LocalFallback);
    assert!(proxy.is_active());

    assert_eq!(proxy.ensure_active(), ProxyMode::Remote);
    assert_eq!(proxy.mode(), ProxyMode::Remote);

    // let the server finish the slow call, then read the state it kept
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(proxy.call("len", vec![]).unwrap(), json!(1));
    assert_eq!(proxy.call("get", vec![json!("/a")]).unwrap(), json!(["remote"]));
    assert_eq!(proxy.mode(), ProxyMode::Remote);
}

#[test]
fn test_method_errors_do_not_switch_mode() {
    let proxy = SharedStateProxy::new("kb", KnowledgeBase::default(), ["get", "drop_all"]);

    match proxy.call("append", vec![json!("/a"), json!("x")]) {
        Err(SharedError::NotExposed(method)) => assert_eq!(method, "append"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(matches!(proxy.call("drop_all", vec![]), Err(SharedError::UnknownMethod(_))));
    assert!(matches!(proxy.call("get", vec![json!(3)]), Err(SharedError::InvalidArguments(_))));
    assert_eq!(proxy.mode(), ProxyMode::Remote);
    assert_eq!(proxy.exposed().collect::<Vec<_>>(), vec!["drop_all", "get"]);
}

/// Records one finding per job in the shared knowledge base.
struct Recorder {
    name: String,
}

impl WorkUnit for Recorder {
    type Payload = String;
    type Output = usize;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, _action: &str, url: &String, ctx: &UnitContext) -> UnitResult<usize> {
        ctx.call_shared("kb", "append", vec![json!(url), json!(self.name)])
            .map_err(anyhow::Error::from)?;
        Ok(vec![ctx.job_id() as usize])
    }
}

#[test]
fn test_units_share_state_through_dispatcher() {
    let kb = Arc::new(SharedStateProxy::new("kb", KnowledgeBase::default(), EXPOSED));
    let units: Vec<BoxedUnit<String, usize>> = (0..4)
        .map(|i| Arc::new(Recorder { name: format!("rec-{}", i) }) as BoxedUnit<String, usize>)
        .collect();
    let dispatcher = Dispatcher::builder()
        .units(units)
        .config(DispatcherConfig::default().with_parallelism(2))
        .shared("kb", kb.clone())
        .build()
        .unwrap();

    dispatcher.submit("grep", "/login".to_string(), Some(Duration::from_secs(10))).unwrap();
    assert_eq!(kb.call("len", vec![]).unwrap(), json!(4));

    // a dead server is restarted before the next job
    kb.shutdown_remote();
    dispatcher.submit("grep", "/logout".to_string(), Some(Duration::from_secs(10))).unwrap();
    assert_eq!(kb.mode(), ProxyMode::Remote);
    assert_eq!(kb.call("get", vec![json!("/logout")]).unwrap().as_array().map(Vec::len), Some(4));

    dispatcher.terminate().unwrap();
}
