#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use svckit::{
    async_trait, AppContext, BindingSpec, ConfigNode, FactoryBuilder, Object, Service, ServiceCtx,
    ServiceFactory, SlotArgs, SlotHandler,
};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().clone()
}

pub fn count(journal: &Journal, entry: &str) -> usize {
    journal.lock().iter().filter(|e| *e == entry).count()
}

pub fn position(journal: &Journal, entry: &str) -> Option<usize> {
    journal.lock().iter().position(|e| e == entry)
}

fn log(journal: &Journal, ctx: &ServiceCtx, what: &str) {
    journal.lock().push(format!("{}:{}", ctx.uid(), what));
}

/// Records every hook; increments an `inout` key named `value` on update.
pub struct Recorder {
    journal: Journal,
}

#[async_trait]
impl Service for Recorder {
    async fn configuring(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "configure");
        Ok(())
    }

    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "start");
        Ok(())
    }

    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "update");
        if let Some(obj) = ctx.inout("value")? {
            let n = obj.get().as_i64().unwrap_or(0);
            obj.set(json!(n + 1));
        }
        Ok(())
    }

    async fn stopping(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "stop");
        Ok(())
    }

    async fn swapping(&self, ctx: &ServiceCtx, key: &str) -> anyhow::Result<()> {
        let present = ctx.input(key)?.is_some();
        log(&self.journal, ctx, &format!("swap:{key}:{present}"));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Publishes a fresh `Data` object on its `out` key when started.
pub struct Producer {
    journal: Journal,
}

#[async_trait]
impl Service for Producer {
    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "start");
        ctx.set_output("out", Some(Object::new("Data", json!(1)))).await?;
        Ok(())
    }

    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "update");
        if let Some(obj) = ctx.output("out") {
            let n = obj.get().as_i64().unwrap_or(0);
            obj.set(json!(n + 1));
            ctx.notify_modified("out").await?;
        }
        Ok(())
    }

    async fn stopping(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        log(&self.journal, ctx, "stop");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Declares a strict binding shape: one `in` and an optional `out`.
pub struct Strict;

#[async_trait]
impl Service for Strict {
    fn bindings(&self) -> Vec<BindingSpec> {
        vec![BindingSpec::input("in"), BindingSpec::output("out").optional()]
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reads its mandatory input while configuring, which is not allowed.
pub struct EagerReader;

#[async_trait]
impl Service for EagerReader {
    async fn configuring(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        ctx.input("in")?;
        Ok(())
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Refuses to start.
pub struct Failing;

#[async_trait]
impl Service for Failing {
    async fn starting(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        anyhow::bail!("refusing to start")
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Deserialize)]
struct SleepyConfig {
    delay_ms: u64,
}

/// Sleeps `config.delay_ms` on every update.
pub struct Sleepy {
    journal: Journal,
}

#[async_trait]
impl Service for Sleepy {
    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let cfg: SleepyConfig = ctx.config()?;
        log(&self.journal, ctx, "begin");
        tokio::time::sleep(Duration::from_millis(cfg.delay_ms)).await;
        log(&self.journal, ctx, "end");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Starts two owned sub-services of type `test::Recorder`.
pub struct Parent;

#[async_trait]
impl Service for Parent {
    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        for n in 1..=2 {
            let sub = ctx
                .create_sub_service("test::Recorder", &format!("{}.sub{n}", ctx.uid()), Vec::new(), None)
                .await?;
            sub.start().await?;
        }
        Ok(())
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Declares a `poke` slot that records its first argument.
pub struct Slotted {
    journal: Journal,
}

#[async_trait]
impl Service for Slotted {
    async fn configuring(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let journal = Arc::clone(&self.journal);
        let handler: SlotHandler = Arc::new(move |ctx: ServiceCtx, args: SlotArgs| {
            let journal = Arc::clone(&journal);
            async move {
                let arg = args.first().cloned().unwrap_or_default();
                journal.lock().push(format!("{}:poke:{arg}", ctx.uid()));
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        ctx.declare_slot("poke", handler)?;
        ctx.declare_signal("ping", 1)?;
        Ok(())
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DelayConfig {
    delay_ms: u64,
}

/// Declares a `go` slot that waits `config.delay_ms`, then publishes a fresh
/// object on its `out` key.
pub struct Publisher {
    journal: Journal,
}

#[async_trait]
impl Service for Publisher {
    async fn configuring(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let cfg: DelayConfig = ctx.config()?;
        let journal = Arc::clone(&self.journal);
        let handler: SlotHandler = Arc::new(move |ctx: ServiceCtx, _args: SlotArgs| {
            let journal = Arc::clone(&journal);
            let delay = Duration::from_millis(cfg.delay_ms);
            async move {
                tokio::time::sleep(delay).await;
                ctx.set_output("out", Some(Object::new("Data", json!(1)))).await?;
                journal.lock().push(format!("{}:published", ctx.uid()));
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        ctx.declare_slot("go", handler)?;
        Ok(())
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn swapping(&self, ctx: &ServiceCtx, key: &str) -> anyhow::Result<()> {
        let present = ctx.input(key)?.is_some();
        log(&self.journal, ctx, &format!("swap:{key}:{present}"));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Takes `config.delay_ms` to start.
pub struct SlowStart {
    journal: Journal,
}

#[async_trait]
impl Service for SlowStart {
    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let cfg: DelayConfig = ctx.config()?;
        tokio::time::sleep(Duration::from_millis(cfg.delay_ms)).await;
        log(&self.journal, ctx, "start");
        Ok(())
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Declares a `touch` slot that bumps its `inout` key `target` and announces
/// the change without hearing its own echo.
pub struct Mutator {
    journal: Journal,
}

#[async_trait]
impl Service for Mutator {
    async fn configuring(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let journal = Arc::clone(&self.journal);
        let handler: SlotHandler = Arc::new(move |ctx: ServiceCtx, _args: SlotArgs| {
            let journal = Arc::clone(&journal);
            async move {
                let Some(target) = ctx.inout("target")? else {
                    return Ok(());
                };
                let signal = ctx
                    .modified_signal("target")
                    .ok_or_else(|| anyhow::anyhow!("target is not bound"))?;
                let _echo = ctx.block(&signal, "touch");
                let n = target.get().as_i64().unwrap_or(0);
                target.set(json!(n + 1));
                ctx.notify_modified("target").await?;
                journal.lock().push(format!("{}:touch", ctx.uid()));
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        ctx.declare_slot("touch", handler)?;
        Ok(())
    }

    async fn updating(&self, _ctx: &ServiceCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn factory(journal: &Journal) -> Arc<ServiceFactory> {
    let mut b = FactoryBuilder::with_builtins();
    let j = Arc::clone(journal);
    b.register("test::Recorder", move || Arc::new(Recorder { journal: Arc::clone(&j) }) as Arc<dyn Service>);
    let j = Arc::clone(journal);
    b.register("test::Producer", move || {
        Arc::new(Producer { journal: Arc::clone(&j) }) as Arc<dyn Service>
    });
    let j = Arc::clone(journal);
    b.register("test::Sleepy", move || Arc::new(Sleepy { journal: Arc::clone(&j) }) as Arc<dyn Service>);
    let j = Arc::clone(journal);
    b.register("test::Slotted", move || {
        Arc::new(Slotted { journal: Arc::clone(&j) }) as Arc<dyn Service>
    });
    let j = Arc::clone(journal);
    b.register("test::Publisher", move || {
        Arc::new(Publisher { journal: Arc::clone(&j) }) as Arc<dyn Service>
    });
    let j = Arc::clone(journal);
    b.register("test::SlowStart", move || {
        Arc::new(SlowStart { journal: Arc::clone(&j) }) as Arc<dyn Service>
    });
    let j = Arc::clone(journal);
    b.register("test::Mutator", move || {
        Arc::new(Mutator { journal: Arc::clone(&j) }) as Arc<dyn Service>
    });
    b.register("test::Strict", || Arc::new(Strict) as Arc<dyn Service>);
    b.register("test::EagerReader", || Arc::new(EagerReader) as Arc<dyn Service>);
    b.register("test::Failing", || Arc::new(Failing) as Arc<dyn Service>);
    b.register("test::Parent", || Arc::new(Parent) as Arc<dyn Service>);
    Arc::new(b.build().expect("test factory"))
}

pub fn app(journal: &Journal) -> Arc<AppContext> {
    AppContext::new(factory(journal))
}

// --- configuration builders ---

pub fn object(uid: &str) -> ConfigNode {
    ConfigNode::new("object").attr("uid", uid).attr("type", "Data")
}

pub fn deferred(uid: &str) -> ConfigNode {
    object(uid).attr("src", "deferred")
}

pub fn service(uid: &str, type_name: &str) -> ConfigNode {
    ConfigNode::new("service")
        .attr("uid", uid)
        .attr("type", type_name)
}

pub fn binding(access: &str, key: &str, uid: &str) -> ConfigNode {
    ConfigNode::new(access).attr("key", key).attr("uid", uid)
}

pub fn connect(channel: &str, signals: &[&str], slots: &[&str]) -> ConfigNode {
    let mut node = ConfigNode::new("connect").attr("channel", channel);
    for s in signals {
        node = node.child(ConfigNode::new("signal").with_value(*s));
    }
    for s in slots {
        node = node.child(ConfigNode::new("slot").with_value(*s));
    }
    node
}
