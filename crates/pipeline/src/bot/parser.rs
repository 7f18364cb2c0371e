//! Parser bots: one report in, events out.

use intelflow_core::message::Message;

use super::{Bot, BotContext};
use crate::error::BotError;

/// How a report's payload is cut into records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFormat {
    /// One record per line, surrounding whitespace stripped.
    #[default]
    Lines,
    /// One record per CSV row. Newlines inside quoted fields do not end a
    /// record.
    Csv,
}

/// Splits `raw` into records. Blank records are dropped.
pub fn split_records(raw: &str, format: RecordFormat) -> Vec<String> {
    match format {
        RecordFormat::Lines => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect(),
        RecordFormat::Csv => split_csv_rows(raw),
    }
}

fn split_csv_rows(raw: &str) -> Vec<String> {
    let mut rows = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in raw.chars() {
        match c {
            '"' => {
                // "" inside a quoted field toggles twice
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\n' if !in_quotes => {
                let row = current.trim_end_matches('\r');
                if !row.trim().is_empty() {
                    rows.push(row.to_owned());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let row = current.trim_end_matches('\r');
    if !row.trim().is_empty() {
        rows.push(row.to_owned());
    }
    rows
}

/// Fields of one CSV row: comma separated, `"` quoting with `""` as an
/// escaped quote.
pub fn csv_fields(record: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = record.trim_end_matches(['\r', '\n']).chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Feed specific parsing logic.
///
/// Only [`ParserBot::parse_line`] is mandatory. Wrap the parser in a
/// [`ParserRunner`] to run it.
pub trait ParserBot: Send {
    fn record_format(&self) -> RecordFormat {
        RecordFormat::Lines
    }

    /// Cuts the decoded payload of `report` into records.
    ///
    /// Override to skip comments or headers.
    fn parse(&mut self, _report: &Message, raw: &str) -> Result<Vec<String>, BotError> {
        Ok(split_records(raw, self.record_format()))
    }

    /// Events contained in one record.
    fn parse_line(&mut self, line: &str, report: &Message) -> Result<Vec<Message>, BotError>;

    /// Payload of the report dumped for a record that failed to parse.
    fn recover_line(&self, line: &str) -> String {
        line.to_owned()
    }
}

/// Runs a [`ParserBot`]: receive a report, send its events, dump the
/// records that failed, acknowledge the report once.
pub struct ParserRunner<P> {
    parser: P,
}

impl<P: ParserBot> ParserRunner<P> {
    pub fn new(parser: P) -> Self {
        Self { parser }
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }
}

impl<P: ParserBot> Bot for ParserRunner<P> {
    fn process(&mut self, ctx: &mut BotContext) -> Result<(), BotError> {
        let report = ctx.receive_message()?;

        let Some(raw) = report.raw_bytes() else {
            tracing::warn!(
                bot_id = %ctx.bot_id(),
                "report without raw field received, possible bug or misconfiguration in previous bots"
            );
            return ctx.acknowledge_message();
        };
        let raw = String::from_utf8_lossy(&raw);

        let mut failed = Vec::new();
        for line in self.parser.parse(&report, &raw)? {
            if line.is_empty() {
                continue;
            }
            match self.parser.parse_line(&line, &report) {
                Ok(events) => {
                    for event in events.iter().filter(|e| !e.is_empty()) {
                        ctx.send_message(event)?;
                    }
                }
                Err(err) if err.is_fatal() || err.is_stop_request() => return Err(err),
                Err(err) => {
                    tracing::error!(bot_id = %ctx.bot_id(), error = %err, "failed to parse line");
                    failed.push((err, line));
                }
            }
        }

        if !failed.is_empty() {
            tracing::warn!(bot_id = %ctx.bot_id(), failed = failed.len(), "lines failed to parse");
        }
        if ctx.config().error_dump_message {
            for (err, line) in &failed {
                let mut dump = report.copy();
                dump.set_raw(self.parser.recover_line(line))?;
                ctx.dump_message(err, &dump)?;
            }
        }

        ctx.acknowledge_message()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::pipeline::Pipeline;
    use crate::queue::{MemoryBroker, Queue};
    use intelflow_core::config::{BotConfig, DEFAULT_PATH};
    use intelflow_core::schema::FieldSchema;

    /// `ip,time,fqdn` rows.
    struct DemoParser;

    impl ParserBot for DemoParser {
        fn record_format(&self) -> RecordFormat {
            RecordFormat::Csv
        }

        fn parse_line(&mut self, line: &str, report: &Message) -> Result<Vec<Message>, BotError> {
            let fields = csv_fields(line);
            let [ip, time, fqdn] = fields.as_slice() else {
                return Err(BotError::process(format!("expected 3 columns, got {}", fields.len())));
            };
            let mut event = Message::event_from_report(report);
            event.add("source.ip", ip.as_str())?;
            event.add("time.source", time.as_str())?;
            event.add("source.fqdn", fqdn.as_str())?;
            event.set_raw(line)?;
            Ok(vec![event])
        }
    }

    fn context(broker: &Arc<MemoryBroker>, dir: &Path) -> BotContext {
        let mut config = BotConfig::default();
        config.module = "demo-parser".to_owned();
        config.source_queue = Some("reports".to_owned());
        config
            .destination_queues
            .insert(DEFAULT_PATH.to_owned(), vec!["events".to_owned()]);
        let pipeline = Pipeline::builder("demo-parser")
            .queue(Arc::clone(broker) as Arc<dyn Queue>)
            .source(config.source_queue.clone())
            .destinations(config.destination_queues.clone())
            .build()
            .unwrap();
        BotContext::new("demo-parser", config, pipeline, dir, Duration::from_millis(5))
    }

    fn push_report(broker: &MemoryBroker, ctx: &BotContext, raw: Option<&str>) {
        let mut report = ctx.new_report();
        report.add("feed.name", "Demo").unwrap();
        if let Some(raw) = raw {
            report.set_raw(raw).unwrap();
        }
        broker.push("reports", report.serialize().unwrap().as_bytes()).unwrap();
    }

    fn events(broker: &MemoryBroker, ctx: &BotContext) -> Vec<Message> {
        broker
            .snapshot("events")
            .iter()
            .map(|b| Message::unserialize_bytes(b, Arc::clone(ctx.schema())).unwrap())
            .collect()
    }

    #[test]
    fn splits_lines_and_skips_blanks() {
        assert_eq!(
            split_records("  a \n\n b\r\n", RecordFormat::Lines),
            vec!["a".to_owned(), "b".to_owned()]
        );
    }

    #[test]
    fn csv_rows_keep_quoted_newlines() {
        let rows = split_records("a,\"multi\nline\"\r\nb,c\n", RecordFormat::Csv);
        assert_eq!(rows, vec!["a,\"multi\nline\"".to_owned(), "b,c".to_owned()]);
    }

    #[test]
    fn csv_fields_handle_quotes() {
        assert_eq!(csv_fields("a,\"b,c\",\"say \"\"hi\"\"\","), vec!["a", "b,c", "say \"hi\"", ""]);
        assert_eq!(csv_fields(""), vec![""]);
    }

    #[test]
    fn report_becomes_event() {
        let broker = Arc::new(MemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&broker, dir.path());
        push_report(&broker, &ctx, Some("1.2.3.4,2016-11-12 15:02,example.org"));

        let mut runner = ParserRunner::new(DemoParser);
        runner.process(&mut ctx).unwrap();

        let events = events(&broker, &ctx);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.get_str("feed.name"), Some("Demo"));
        assert_eq!(event.get_str("source.ip"), Some("1.2.3.4"));
        assert_eq!(event.get_str("time.source"), Some("2016-11-12T15:02:00+00:00"));
        assert_eq!(event.get_str("source.fqdn"), Some("example.org"));
        assert_eq!(broker.in_flight("reports").unwrap(), None);
    }

    #[test]
    fn failed_lines_are_dumped_and_report_acknowledged() {
        let broker = Arc::new(MemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&broker, dir.path());
        push_report(
            &broker,
            &ctx,
            Some("1.2.3.4,2016-11-12 15:02,example.org\nnot-an-ip,2016-11-12 15:02,example.org\n"),
        );

        ParserRunner::new(DemoParser).process(&mut ctx).unwrap();

        assert_eq!(events(&broker, &ctx).len(), 1);
        assert_eq!(broker.in_flight("reports").unwrap(), None);

        let dumped = ctx.dump_writer().read().unwrap();
        assert_eq!(dumped.len(), 1);
        let report = Message::unserialize(&dumped[0].1.message, Arc::clone(ctx.schema())).unwrap();
        assert_eq!(
            report.raw_bytes().unwrap(),
            b"not-an-ip,2016-11-12 15:02,example.org".to_vec()
        );
        assert_eq!(report.get_str("feed.name"), Some("Demo"));
    }

    #[test]
    fn report_without_raw_is_acknowledged() {
        let broker = Arc::new(MemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&broker, dir.path());
        push_report(&broker, &ctx, None);

        ParserRunner::new(DemoParser).process(&mut ctx).unwrap();
        assert!(events(&broker, &ctx).is_empty());
        assert_eq!(broker.in_flight("reports").unwrap(), None);
        assert!(ctx.dump_writer().read().unwrap().is_empty());
    }
}
