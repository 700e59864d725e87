// src/core/run_log.rs

//! Categorized message log of one run and its XML report.
//!
//! Messages go to the `log` facade immediately and are also kept per category
//! (one category per executed command) so the report can group them.

use chrono::{DateTime, Local};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const ROOT_CATEGORY: &str = "__root";
const REPORT_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Error, Debug)]
pub enum RunLogError {
    #[error("Could not create log folder '{path}': {source}")]
    CreateFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not write log report '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not render log report: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    General,
    Warning,
    Critical,
    Status,
}

impl MessageKind {
    fn label(self) -> &'static str {
        match self {
            Self::General => "msg",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub category: String,
    pub kind: MessageKind,
    pub text: String,
}

#[derive(Debug, Clone)]
struct Category {
    name: String,
    started: DateTime<Local>,
    duration_secs: Option<i64>,
    entries: Vec<(MessageKind, String)>,
}

#[derive(Debug, Clone)]
pub struct RunLog {
    project: String,
    run_id: Uuid,
    started: DateTime<Local>,
    ended: Option<DateTime<Local>>,
    categories: Vec<Category>,
    active: usize,
    folder: Option<PathBuf>,
    file_name: Option<String>,
    name_prefix: Option<String>,
}

impl RunLog {
    pub fn new(project: &str) -> Self {
        let started = Local::now();
        Self {
            project: project.to_string(),
            run_id: Uuid::new_v4(),
            started,
            ended: None,
            categories: vec![Category {
                name: ROOT_CATEGORY.to_string(),
                started,
                duration_secs: None,
                entries: Vec::new(),
            }],
            active: 0,
            folder: None,
            file_name: None,
            name_prefix: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    // --- Report destination ---

    pub fn set_folder(&mut self, folder: impl Into<PathBuf>) {
        self.folder = Some(folder.into());
    }

    /// Explicit report file name; `.xml` is appended when missing.
    pub fn set_file_name(&mut self, name: &str) {
        let name = name.trim();
        self.file_name = (!name.is_empty()).then(|| name.to_string());
    }

    pub fn set_name_prefix(&mut self, prefix: &str) {
        let prefix = prefix.trim();
        self.name_prefix = (!prefix.is_empty()).then(|| prefix.to_string());
    }

    // --- Categories ---

    /// Opens (or re-enters) a category; later messages are filed under it.
    pub fn create_category(&mut self, name: &str) {
        let name = name.trim();
        if let Some(pos) = self.categories.iter().position(|c| c.name == name) {
            self.active = pos;
            return;
        }
        self.categories.push(Category {
            name: name.to_string(),
            started: Local::now(),
            duration_secs: None,
            entries: Vec::new(),
        });
        self.active = self.categories.len() - 1;
    }

    /// Stamps the active category's duration and returns to the root category.
    pub fn close_category(&mut self) {
        if self.active != 0
            && let Some(category) = self.categories.get_mut(self.active)
        {
            category.duration_secs = Some((Local::now() - category.started).num_seconds());
        }
        self.active = 0;
    }

    // --- Messages ---

    pub fn message(&mut self, text: &str, kind: MessageKind) {
        if text.is_empty() {
            return;
        }
        let Some(category) = self.categories.get_mut(self.active) else {
            return;
        };
        match kind {
            MessageKind::General | MessageKind::Status => {
                log::info!("log-{}:{}", kind.label(), text);
            }
            MessageKind::Warning => log::warn!("log-{}:{}", kind.label(), text),
            MessageKind::Critical => log::error!("log-{}:{}", kind.label(), text),
        }
        category.entries.push((kind, text.to_string()));
    }

    pub fn general(&mut self, text: &str) {
        self.message(text, MessageKind::General);
    }

    pub fn warning(&mut self, text: &str) {
        self.message(text, MessageKind::Warning);
    }

    pub fn critical(&mut self, text: &str) {
        self.message(text, MessageKind::Critical);
    }

    pub fn status(&mut self, text: &str) {
        self.message(text, MessageKind::Status);
    }

    /// Every message recorded so far, grouped by category in creation order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.categories
            .iter()
            .flat_map(|c| {
                c.entries.iter().map(|(kind, text)| LogEntry {
                    category: c.name.clone(),
                    kind: *kind,
                    text: text.clone(),
                })
            })
            .collect()
    }

    /// Plain text of every message, in recording order per category.
    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.text).collect()
    }

    // --- Report ---

    pub fn end(&mut self) {
        self.ended = Some(Local::now());
    }

    /// Report file path for the configured folder and naming.
    pub fn report_path(&self) -> Option<PathBuf> {
        let folder = self.folder.as_ref()?;
        let name = match &self.file_name {
            Some(name) if name.to_lowercase().ends_with(".xml") => name.clone(),
            Some(name) => format!("{name}.xml"),
            None => format!(
                "{}_{}.xml",
                self.name_prefix.as_deref().unwrap_or("log"),
                Local::now().format(REPORT_TIME_FORMAT)
            ),
        };
        Some(folder.join(name))
    }

    pub fn to_xml(&self) -> Result<String, RunLogError> {
        let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
        w.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
            .map_err(render_error)?;
        w.write_event(Event::Start(BytesStart::new("Projects")))
            .map_err(render_error)?;
        w.write_event(Event::Start(BytesStart::new(self.project.as_str())))
            .map_err(render_error)?;

        let ended = self.ended.unwrap_or_else(Local::now);
        write_text_element(&mut w, "RunId", &self.run_id.to_string())?;
        write_text_element(&mut w, "StartTime", &self.started.format(REPORT_TIME_FORMAT).to_string())?;
        write_text_element(&mut w, "EndTime", &ended.format(REPORT_TIME_FORMAT).to_string())?;
        write_text_element(
            &mut w,
            "TotalDuration",
            &(ended - self.started).num_seconds().to_string(),
        )?;

        for category in &self.categories {
            let is_root = category.name == ROOT_CATEGORY;
            if !is_root {
                w.write_event(Event::Start(BytesStart::new(category.name.as_str())))
                    .map_err(render_error)?;
            }
            for (kind, text) in &category.entries {
                match kind {
                    MessageKind::General => write_text_element(&mut w, "Message", text)?,
                    MessageKind::Status => write_text_element(&mut w, "Status", text)?,
                    MessageKind::Warning | MessageKind::Critical => {
                        w.write_event(Event::Start(BytesStart::new("Error")))
                            .map_err(render_error)?;
                        write_text_element(&mut w, "type", kind.label())?;
                        write_text_element(&mut w, "text", text)?;
                        w.write_event(Event::End(BytesEnd::new("Error")))
                            .map_err(render_error)?;
                    }
                }
            }
            if let Some(secs) = category.duration_secs {
                write_text_element(&mut w, "Duration", &secs.to_string())?;
            }
            if !is_root {
                w.write_event(Event::End(BytesEnd::new(category.name.as_str())))
                    .map_err(render_error)?;
            }
        }

        w.write_event(Event::End(BytesEnd::new(self.project.as_str())))
            .map_err(render_error)?;
        w.write_event(Event::End(BytesEnd::new("Projects")))
            .map_err(render_error)?;
        String::from_utf8(w.into_inner()).map_err(|e| RunLogError::Render(e.to_string()))
    }

    /// Writes the report, creating the folder when missing.
    /// Returns `Ok(None)` when no folder was configured.
    pub fn write_report(&self) -> Result<Option<PathBuf>, RunLogError> {
        let Some(path) = self.report_path() else {
            return Ok(None);
        };
        if let Some(folder) = path.parent() {
            ensure_folder(folder)?;
        }
        let xml = self.to_xml()?;
        fs::write(&path, xml).map_err(|source| RunLogError::Write {
            path: path.clone(),
            source,
        })?;
        log::debug!("Log report written to '{}'", path.display());
        Ok(Some(path))
    }
}

fn render_error<E: std::fmt::Display>(e: E) -> RunLogError {
    RunLogError::Render(e.to_string())
}

fn ensure_folder(folder: &Path) -> Result<(), RunLogError> {
    if folder.as_os_str().is_empty() || folder.exists() {
        return Ok(());
    }
    fs::create_dir_all(folder).map_err(|source| RunLogError::CreateFolder {
        path: folder.to_path_buf(),
        source,
    })
}

fn write_text_element(w: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), RunLogError> {
    w.write_event(Event::Start(BytesStart::new(name)))
        .map_err(render_error)?;
    w.write_event(Event::Text(BytesText::new(text)))
        .map_err(render_error)?;
    w.write_event(Event::End(BytesEnd::new(name)))
        .map_err(render_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::Document;

    #[test]
    fn test_messages_are_filed_under_active_category() {
        let mut log = RunLog::new("MDCS");
        log.general("Processing command(s):CM+AF");
        log.create_category("CM");
        log.general("Command:CM->Create a new mosaic dataset.");
        log.status("OK");
        log.close_category();
        log.warning("after");

        let entries = log.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries.iter().filter(|e| e.category == "CM").count(), 2);
        assert_eq!(
            entries.iter().find(|e| e.kind == MessageKind::Status).unwrap().text,
            "OK"
        );
    }

    #[test]
    fn test_report_is_valid_xml_with_categories() {
        let mut log = RunLog::new("MDCS");
        log.create_category("AI2");
        log.critical("boom");
        log.status("Failed!");
        log.close_category();
        log.end();

        let doc = Document::parse(&log.to_xml().unwrap()).unwrap();
        assert_eq!(doc.name(doc.root()), "Projects");
        assert_eq!(doc.value_of("Status"), "Failed!");
        assert_eq!(doc.value_of("text"), "boom");
        assert_eq!(doc.value_of("type"), "critical");
        assert!(doc.elements_by_name("AI2").next().is_some());
    }

    #[test]
    fn test_report_naming_and_folder_creation() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunLog::new("MDCS");
        assert!(log.write_report().unwrap().is_none());

        log.set_folder(dir.path().join("logs"));
        log.set_file_name("run1");
        let path = log.write_report().unwrap().unwrap();
        assert_eq!(path, dir.path().join("logs").join("run1.xml"));
        assert!(path.exists());

        log.set_file_name("");
        log.set_name_prefix("config");
        let name = log.report_path().unwrap();
        let name = name.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("config_") && name.ends_with(".xml"));
    }
}
