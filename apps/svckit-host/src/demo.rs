//! Demo service types shipped with the host.
//!
//! `demo::Ticker` publishes a counter object and bumps it on every update;
//! `demo::Logger` reads that object and logs each change it is notified of.

use std::any::Any;

use serde::Deserialize;
use serde_json::json;
use svckit::{async_trait, BindingSpec, FactoryBuilder, Object, Service, ServiceCtx, ServiceRegistrator};

pub const TICKER: &str = "demo::Ticker";
pub const LOGGER: &str = "demo::Logger";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TickerConfig {
    step: i64,
    start: i64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self { step: 1, start: 0 }
    }
}

#[derive(Default)]
pub struct Ticker;

#[async_trait]
impl Service for Ticker {
    fn bindings(&self) -> Vec<BindingSpec> {
        vec![BindingSpec::output("counter")]
    }

    async fn configuring(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let cfg: TickerConfig = ctx.config()?;
        anyhow::ensure!(cfg.step != 0, "{}: step must not be zero", ctx.uid());
        Ok(())
    }

    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let cfg: TickerConfig = ctx.config()?;
        let counter = Object::new("Counter", json!({ "value": cfg.start, "ticks": 0 }));
        ctx.set_output("counter", Some(counter)).await?;
        tracing::info!(service = %ctx.uid(), start = cfg.start, "ticker started");
        Ok(())
    }

    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let Some(counter) = ctx.output("counter") else {
            return Ok(());
        };
        let cfg: TickerConfig = ctx.config()?;
        let (value, ticks) = counter.with(|v| {
            (
                v["value"].as_i64().unwrap_or(0) + cfg.step,
                v["ticks"].as_u64().unwrap_or(0) + 1,
            )
        });
        counter.set(json!({ "value": value, "ticks": ticks }));
        ctx.notify_modified("counter").await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggerConfig {
    label: Option<String>,
}

#[derive(Default)]
pub struct Logger;

#[async_trait]
impl Service for Logger {
    fn bindings(&self) -> Vec<BindingSpec> {
        vec![BindingSpec::input("source")]
    }

    async fn starting(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        tracing::info!(service = %ctx.uid(), "logger attached");
        Ok(())
    }

    async fn updating(&self, ctx: &ServiceCtx) -> anyhow::Result<()> {
        let cfg: LoggerConfig = ctx.config()?;
        let label = cfg.label.as_deref().unwrap_or(ctx.uid());
        if let Some(source) = ctx.input("source")? {
            let version = source.version();
            source.with(|v| tracing::info!(%label, version, value = %v, "observed"));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register(b: &mut FactoryBuilder) {
    b.register_default::<Ticker>(TICKER);
    b.register_default::<Logger>(LOGGER);
}

inventory::submit! {
    ServiceRegistrator(register)
}
