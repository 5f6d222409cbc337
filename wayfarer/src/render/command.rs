//! PDF rendering through an external HTML-to-PDF converter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::{PdfRenderer, RenderedPdf, file_stem, render_html};
use crate::database::models::Itinerary;
use crate::{Error, Result};

/// Renderer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Directory the PDFs are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Converter program.
    #[serde(default = "default_command")]
    pub command: String,

    /// Converter arguments. `{input}` and `{output}` are replaced with the
    /// HTML source and PDF destination paths.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Hard limit for one converter run, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Keep the intermediate HTML next to the PDF.
    #[serde(default)]
    pub keep_html: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/pdfs")
}

fn default_command() -> String {
    "wkhtmltopdf".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "--quiet".to_string(),
        "{input}".to_string(),
        "{output}".to_string(),
    ]
}

fn default_command_timeout_secs() -> u64 {
    55
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            command: default_command(),
            args: default_args(),
            command_timeout_secs: default_command_timeout_secs(),
            keep_html: false,
        }
    }
}

impl RendererConfig {
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }
}

/// [`PdfRenderer`] that writes an HTML document and converts it with an
/// external command such as `wkhtmltopdf`.
pub struct CommandPdfRenderer {
    config: RendererConfig,
}

impl CommandPdfRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    fn expand_args(&self, input: &str, output: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|a| a.replace("{input}", input).replace("{output}", output))
            .collect()
    }
}

#[async_trait]
impl PdfRenderer for CommandPdfRenderer {
    async fn render(&self, itinerary: &Itinerary, content: &str) -> Result<RenderedPdf> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let stem = file_stem(itinerary);
        let html_path = self.config.output_dir.join(format!("{stem}.html"));
        let filename = format!("{stem}.pdf");
        let pdf_path = self.config.output_dir.join(&filename);

        let html = render_html(itinerary, content)
            .map_err(|e| Error::render(format!("failed to build HTML: {e}")))?;
        tokio::fs::write(&html_path, html).await?;

        let input = html_path.to_string_lossy().into_owned();
        let output = pdf_path.to_string_lossy().into_owned();

        let mut cmd = process_utils::tokio_command(&self.config.command);
        cmd.args(self.expand_args(&input, &output));

        debug!(
            itinerary_id = itinerary.id,
            command = %self.config.command,
            "Rendering PDF"
        );

        let result = process_utils::run_captured(
            cmd,
            Duration::from_secs(self.config.command_timeout_secs),
        )
        .await;

        if !self.config.keep_html {
            if let Err(e) = tokio::fs::remove_file(&html_path).await {
                warn!(path = %html_path.display(), "Failed to remove intermediate HTML: {}", e);
            }
        }

        result.map_err(|e| Error::render(e.to_string()))?;

        let written = tokio::fs::metadata(&pdf_path)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !written {
            return Err(Error::render(format!(
                "converter produced no output at {}",
                pdf_path.display()
            )));
        }

        let path = std::path::absolute(&pdf_path)
            .unwrap_or(pdf_path)
            .to_string_lossy()
            .into_owned();

        Ok(RenderedPdf { filename, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Itinerary;
    use chrono::NaiveDate;

    fn itinerary() -> Itinerary {
        Itinerary {
            id: 12,
            client_id: "c".into(),
            session_id: None,
            destination: "São Paulo, Brazil".into(),
            start_date: NaiveDate::from_ymd_opt(2031, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2031, 1, 3).unwrap(),
            budget: None,
            interests: "[]".into(),
            processing_status: "processing".into(),
            created_at: 0,
            completed_at: None,
            generated_content: String::new(),
            model_used: None,
            pdf_filename: None,
            pdf_path: None,
        }
    }

    #[test]
    fn stem_is_slugged() {
        assert_eq!(file_stem(&itinerary()), "itinerary-12-s-o-paulo-brazil");
    }

    #[test]
    fn placeholders_are_expanded() {
        let renderer = CommandPdfRenderer::new(RendererConfig::default());
        assert_eq!(
            renderer.expand_args("/a.html", "/a.pdf"),
            vec!["--quiet", "/a.html", "/a.pdf"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn renders_with_external_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = RendererConfig::default()
            .with_output_dir(dir.path())
            .with_command(
                "sh",
                vec!["-c".into(), "cp \"$0\" \"$1\"".into(), "{input}".into(), "{output}".into()],
            );
        let renderer = CommandPdfRenderer::new(config);

        let pdf = renderer.render(&itinerary(), "## Day 1").await.unwrap();
        assert_eq!(pdf.filename, "itinerary-12-s-o-paulo-brazil.pdf");
        let written = std::fs::read_to_string(&pdf.path).unwrap();
        assert!(written.contains("<h2>Day 1</h2>"));
        assert!(!dir.path().join("itinerary-12-s-o-paulo-brazil.html").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_a_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = RendererConfig::default()
            .with_output_dir(dir.path())
            .with_command("sh", vec!["-c".into(), "exit 1".into()]);
        let err = CommandPdfRenderer::new(config)
            .render(&itinerary(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }
}
