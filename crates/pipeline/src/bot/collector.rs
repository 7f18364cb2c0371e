//! Collector bots: fetch external data and wrap it in reports.

use intelflow_core::harmonization::DateTime;
use intelflow_core::message::{AddOptions, Message};

use super::{Bot, BotContext};
use crate::error::BotError;

/// Feed specific collection logic.
///
/// `rate_limit` of the bot is the interval between two collections.
pub trait CollectorBot: Send {
    fn init(&mut self, _ctx: &mut BotContext) -> Result<(), BotError> {
        Ok(())
    }

    /// Reports fetched in this round, each carrying its payload in `raw`.
    /// Use [`BotContext::new_report`] to create them.
    fn collect(&mut self, ctx: &mut BotContext) -> Result<Vec<Message>, BotError>;
}

/// Runs a [`CollectorBot`]: stamps feed metadata on the collected reports
/// and sends them.
pub struct CollectorRunner<C> {
    collector: C,
}

impl<C: CollectorBot> CollectorRunner<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }
}

impl<C: CollectorBot> Bot for CollectorRunner<C> {
    fn init(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        self.collector.init(ctx)
    }

    fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let reports = self.collector.collect(ctx)?;
        for mut report in reports {
            if !report.contains("raw") {
                tracing::warn!(
                    bot_id = %ctx.bot_id(),
                    "ignoring report without raw field, possible bug or misconfiguration of this bot"
                );
                continue;
            }
            add_feed_fields(&mut report, ctx)?;
            ctx.send_message(&report)?;
        }
        Ok(())
    }
}

/// Feed metadata from `[bots.<id>.feed]`. Values the collector already set
/// are kept.
fn add_feed_fields(report: &mut Message, ctx: &BotContext) -> Result<(), BotError> {
    let feed = &ctx.config().feed;
    let keep = AddOptions::default().with_raise_failure(false);

    let name = feed.name.as_deref().unwrap_or(ctx.bot_id());
    report.add_with("feed.name", name, &keep)?;
    for (key, value) in [
        ("feed.code", &feed.code),
        ("feed.provider", &feed.provider),
        ("feed.documentation", &feed.documentation),
    ] {
        if let Some(value) = value {
            report.add_with(key, value.as_str(), &keep)?;
        }
    }
    if let Some(accuracy) = feed.accuracy {
        report.add_with("feed.accuracy", accuracy, &keep)?;
    }
    report.add_with("time.observation", DateTime::now(), &keep)?;
    Ok(())
}
