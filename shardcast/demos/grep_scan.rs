//! Nine grep plugins scanning one response through a dispatcher.
//!
//! Run with `RUST_LOG=shardcast=debug` to watch jobs move through the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use shardcast::shared::arg;
use shardcast::{
    logging, BoxedUnit, DispatcherConfig, ManagerKind, ManagerSet, SharedError, SharedObject,
    SharedStateProxy, UnitContext, UnitResult, WorkUnit,
};

/// Findings reported by plugins, hosted on the state server.
#[derive(Clone, Default)]
struct KnowledgeBase {
    findings: HashMap<String, Vec<String>>,
}

impl SharedObject for KnowledgeBase {
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, SharedError> {
        match method {
            "append" => {
                let plugin: String = arg(args, 0)?;
                let finding: String = arg(args, 1)?;
                self.findings.entry(plugin).or_default().push(finding);
                Ok(Value::Null)
            }
            "count" => Ok(json!(self.findings.values().map(Vec::len).sum::<usize>())),
            other => Err(SharedError::UnknownMethod(other.to_string())),
        }
    }
}

#[derive(WorkUnit)]
#[work_unit(name_field = "name", payload = "String", output = "usize", actions(grep = "grep"))]
struct SleepyPlugin {
    name: String,
}

impl SleepyPlugin {
    fn grep(&self, body: &String, ctx: &UnitContext) -> UnitResult<usize> {
        tracing::info!(plugin = %self.name, shard = ctx.shard(), "grepping {} bytes", body.len());
        std::thread::sleep(Duration::from_millis(200));

        let hits = body.matches(self.name.as_str()).count();
        if hits > 0 {
            ctx.call_shared("kb", "append", vec![json!(self.name), json!(format!("{} hits", hits))])
                .map_err(anyhow::Error::from)?;
        }
        Ok(vec![hits])
    }
}

fn plugins() -> Vec<BoxedUnit<String, usize>> {
    ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF", "GGG", "HHH", "III"]
        .into_iter()
        .map(|name| Arc::new(SleepyPlugin { name: name.to_string() }) as BoxedUnit<String, usize>)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_development();

    let kb = Arc::new(SharedStateProxy::new("kb", KnowledgeBase::default(), ["append", "count"]));
    let managers = ManagerSet::new(DispatcherConfig::default().with_parallelism(4))
        .with_shared("kb", kb.clone());

    let grep = managers.get_or_start(ManagerKind::Grep, plugins)?;
    let body = "AAA BBB AAA <html>III</html>".to_string();

    let results = grep
        .submit_async(ManagerKind::Grep.action(), body, Some(Duration::from_secs(30)))
        .await?;
    for (name, hits) in grep.unit_names().iter().zip(&results) {
        println!("{:>4}: {:?}", name, hits);
    }

    println!("findings in kb: {}", shardcast::SharedHandle::call(kb.as_ref(), "count", vec![])?);
    println!("{:#?}", grep.metrics());

    managers.terminate_all()?;
    Ok(())
}
