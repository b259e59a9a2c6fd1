//! Tracing setup for the extractor binary.
//!
//! Console output goes through an `EnvFilter`-filtered `fmt` layer on stderr. Alongside it,
//! [`LogFileLayer`] copies events to log files chosen by the enclosing spans:
//!
//! - inside a `document` span: `<log_dir>/log_file_<file>.log`
//! - inside a `domain` span as well: `<log_dir>/log_domain_<file>_<domain>.log`

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DOCUMENT_SPAN: &str = "document";
const DOMAIN_SPAN: &str = "domain";

/// Installs the global subscriber: stderr console output plus per-document log files.
pub fn init(log_dir: &Path, file_level: Level) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let console_filter =
        EnvFilter::from_default_env().add_directive("ccda_omop=info".parse()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(LogFileLayer::new(log_dir, file_level))
        .init();
    Ok(())
}

/// `file` and `domain` values recorded on a span.
#[derive(Debug, Default, Clone)]
struct ScopeFields {
    file: Option<String>,
    domain: Option<String>,
}

impl Visit for ScopeFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}").trim_matches('"').to_string();
        match field.name() {
            "file" => self.file = Some(rendered),
            "domain" => self.domain = Some(rendered),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "file" => self.file = Some(value.to_string()),
            "domain" => self.domain = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Collects the event message and any extra fields.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

/// A [`tracing_subscriber::Layer`] that appends events to per-document and per-domain files.
///
/// Events outside any `document` span are ignored. Events more verbose than `level` are
/// dropped. Handles are kept open until the document span closes.
pub struct LogFileLayer {
    dir: PathBuf,
    level: Level,
    open: Mutex<HashMap<PathBuf, File>>,
}

impl LogFileLayer {
    pub fn new(dir: &Path, level: Level) -> Self {
        Self {
            dir: dir.to_path_buf(),
            level,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn file_log_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!("log_file_{file}.log"))
    }

    fn domain_log_path(&self, file: &str, domain: &str) -> PathBuf {
        self.dir.join(format!("log_domain_{file}_{domain}.log"))
    }

    fn append(&self, path: PathBuf, line: &str) {
        let Ok(mut open) = self.open.lock() else {
            return;
        };
        if !open.contains_key(&path) {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(handle) => {
                    open.insert(path.clone(), handle);
                }
                Err(err) => {
                    eprintln!("cannot open log file {}: {err}", path.display());
                    return;
                }
            }
        }
        if let Some(handle) = open.get_mut(&path) {
            if let Err(err) = handle.write_all(line.as_bytes()) {
                eprintln!("cannot write log file {}: {err}", path.display());
            }
        }
    }
}

impl<S> Layer<S> for LogFileLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let name = attrs.metadata().name();
        if name != DOCUMENT_SPAN && name != DOMAIN_SPAN {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = ScopeFields::default();
        attrs.record(&mut fields);
        span.extensions_mut().insert(fields);
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.level {
            return;
        }

        let mut scope = ScopeFields::default();
        if let Some(spans) = ctx.event_scope(event) {
            for span in spans {
                if let Some(fields) = span.extensions().get::<ScopeFields>() {
                    if scope.domain.is_none() {
                        scope.domain = fields.domain.clone();
                    }
                    if scope.file.is_none() {
                        scope.file = fields.file.clone();
                    }
                }
            }
        }
        let Some(file) = scope.file else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut line = format!(
            "{} {level}: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            visitor.message
        );
        for (name, value) in &visitor.fields {
            line.push_str(&format!(" {name}={value}"));
        }
        line.push('\n');

        if let Some(domain) = &scope.domain {
            self.append(self.domain_log_path(&file, domain), &line);
        }
        self.append(self.file_log_path(&file), &line);
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };
        if span.name() != DOCUMENT_SPAN {
            return;
        }
        let Some(file) = span
            .extensions()
            .get::<ScopeFields>()
            .and_then(|fields| fields.file.clone())
        else {
            return;
        };
        let file_log = self.file_log_path(&file);
        let domain_prefix = format!("log_domain_{file}_");
        if let Ok(mut open) = self.open.lock() {
            open.retain(|path, _| {
                let is_domain_log = path
                    .file_name()
                    .map(|name| name.to_string_lossy().starts_with(&domain_prefix))
                    .unwrap_or(false);
                *path != file_log && !is_domain_log
            });
        }
    }
}
